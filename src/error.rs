//! Error taxonomy shared by every downloader.
//!
//! Validation problems end a run early with a message, fetch problems are
//! isolated to a single target, and merge problems abort the run.

use thiserror::Error;

/// Invalid user input.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("could not parse date `{0}`")]
    Date(String),

    #[error("start `{start}` is after end `{end}`")]
    EmptyRange { start: String, end: String },

    #[error("No valid variables provided")]
    NoVariables,

    #[error("boundary file `{0}` does not exist")]
    MissingBoundary(String),

    #[error("invalid boundary: {0}")]
    Boundary(String),

    #[error("Output directory {0} does not exist. Try creating before running")]
    MissingOutputDir(String),
}

/// Failure to materialize one fetch target.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("server returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("object store: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport cannot fetch {0}")]
    Unsupported(String),
}

impl FetchError {
    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            FetchError::Status { status, .. } => {
                matches!(status, 408 | 429) || (500..600).contains(status)
            }
            FetchError::ObjectStore(e) => !matches!(
                e,
                object_store::Error::NotFound { .. }
                    | object_store::Error::InvalidPath { .. }
                    | object_store::Error::NotSupported { .. }
            ),
            FetchError::Io(_) => true,
            FetchError::Unsupported(_) => false,
        }
    }
}

/// A raw file that could not be read into a dataset.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed {format} file: {reason}")]
    Malformed { format: &'static str, reason: String },

    #[error("{0} missing from file")]
    Missing(String),

    #[error("{0} decoding is not enabled in this build")]
    Unsupported(&'static str),
}

impl DecodeError {
    pub fn malformed(format: &'static str, reason: impl Into<String>) -> Self {
        DecodeError::Malformed {
            format,
            reason: reason.into(),
        }
    }
}

/// Pieces that cannot be combined into one dataset.
#[derive(Debug, Error, PartialEq)]
pub enum MergeError {
    #[error("nothing to merge")]
    Empty,

    #[error("spatial coordinates differ between pieces")]
    SpatialMismatch,

    #[error("variables differ between pieces: {0:?} vs {1:?}")]
    VariableMismatch(Vec<String>, Vec<String>),

    #[error("variable `{0}` is present in more than one piece")]
    DuplicateVariable(String),

    #[error("variable `{0}` has {1} values, expected {2}")]
    Shape(String, usize, usize),

    #[error("no grid cells fall inside the boundary")]
    EmptyRegion,
}
