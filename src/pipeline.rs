//! Stages every downloader runs once its catalog is built.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::{
    catalog::{FetchTarget, RawFile},
    dataset::Dataset,
    download::{FetchReport, Fetcher},
    error::{DecodeError, MergeError, ValidationError},
    geo::{Boundary, BoundingBox},
    persist::{self, StoreFormat},
};

pub const NO_FILES: &str = "No files downloaded. Exiting...";
pub const NO_DECODABLE_FILES: &str = "None of the downloaded files could be decoded. Exiting...";

/// How a run ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A store was written.
    Written(PathBuf),
    /// Nothing to do; the message says why.
    Skipped(String),
}

impl From<ValidationError> for Outcome {
    fn from(e: ValidationError) -> Self {
        Outcome::Skipped(format!("{}. Exiting...", e))
    }
}

/// Creates the scratch directory and runs the whole catalog through `fetcher`.
pub async fn fetch(fetcher: &Fetcher, targets: Vec<FetchTarget>) -> Result<FetchReport> {
    tokio::fs::create_dir_all(fetcher.scratch_dir())
        .await
        .with_context(|| format!("could not create {}", fetcher.scratch_dir().display()))?;

    let report = fetcher.fetch_all(targets).await;
    report.print_summary();

    Ok(report)
}

/// Decodes every raw file, skipping the ones that cannot be read.
pub fn decode_each<'a, T>(
    files: &'a [RawFile],
    mut decode: impl FnMut(&RawFile) -> Result<T, DecodeError>,
) -> Vec<(&'a RawFile, T)> {
    files
        .iter()
        .filter_map(|file| match decode(file) {
            Ok(v) => Some((file, v)),
            Err(e) => {
                warn!("Skipping {}: {}", file.target.id, e);
                None
            }
        })
        .collect()
}

/// Why a run that decoded nothing ends.
pub fn nothing_decoded(report: &FetchReport) -> Outcome {
    if report.succeeded.is_empty() {
        Outcome::Skipped(NO_FILES.to_string())
    } else {
        Outcome::Skipped(NO_DECODABLE_FILES.to_string())
    }
}

/// Coarse clip of one decoded file to the boundary's bounding box.
pub fn crop(ds: Dataset, bbox: Option<&BoundingBox>) -> Result<Dataset, MergeError> {
    match bbox {
        Some(bbox) => ds.crop_to_bbox(bbox),
        None => Ok(ds),
    }
}

/// Joins per-file pieces: pieces with the same variables are concatenated
/// along time, then the groups are merged on the union of their timestamps.
pub fn combine(pieces: Vec<Dataset>) -> Result<Dataset, MergeError> {
    let mut groups: BTreeMap<Vec<String>, Vec<Dataset>> = BTreeMap::new();
    for piece in pieces {
        groups.entry(piece.variable_names()).or_default().push(piece);
    }
    debug!(groups = groups.len(), "combining pieces");

    let joined = groups
        .into_values()
        .map(Dataset::concat_time)
        .collect::<Result<Vec<_>, _>>()?;

    Dataset::merge(joined)
}

/// Masks to the boundary and writes the store.
pub fn save(mut ds: Dataset, boundary: Option<&Boundary>, path: &Path, format: StoreFormat) -> Result<Outcome> {
    if let Some(boundary) = boundary {
        let inside = ds.mask(boundary);
        if inside == 0 {
            return Err(MergeError::EmptyRegion.into());
        }
        debug!(inside, "masked to boundary");
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("could not create {}", parent.display()))?;
    }
    persist::save(&ds, path, format)?;

    Ok(Outcome::Written(path.to_path_buf()))
}

// -- Tests -------------------------------------------------------------------
