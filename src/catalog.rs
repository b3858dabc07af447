//! Fetch targets produced by each source's catalog rules.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

/// Where the bytes of a target live.
#[derive(Debug, Clone, PartialEq)]
pub enum Location {
    /// Whole document over HTTP.
    Url(String),
    /// Byte ranges of an HTTP document, concatenated in order.
    UrlRanges {
        url: String,
        ranges: Vec<(u64, Option<u64>)>,
    },
    /// Object key in the run's bucket.
    S3Key(String),
}

/// One entry of the identifier list handed to the fetcher.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchTarget {
    /// Unique within a catalog.
    pub id: String,
    pub location: Location,
    /// Local name inside the scratch directory, derived from `id`.
    pub file_name: String,
    /// Time bucket the target covers.
    pub time: NaiveDateTime,
    /// Variables the target carries, in file order.
    pub variables: Vec<String>,
}

impl FetchTarget {
    pub fn new(id: impl Into<String>, location: Location, file_name: impl Into<String>, time: NaiveDateTime) -> Self {
        FetchTarget {
            id: id.into(),
            location,
            file_name: file_name.into(),
            time,
            variables: Vec::new(),
        }
    }

    pub fn with_variables(mut self, variables: Vec<String>) -> Self {
        self.variables = variables;
        self
    }

    pub fn local_path(&self, scratch_dir: &Path) -> PathBuf {
        scratch_dir.join(&self.file_name)
    }
}

/// A fetched target and the file it was written to.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFile {
    pub target: FetchTarget,
    pub path: PathBuf,
}

// -- Tests -------------------------------------------------------------------
