//! Writing merged datasets to disk and removing scratch files.

pub mod parquet;
pub mod zarr;

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::ValueEnum;
use tracing::{debug, info, warn};

use crate::{cli::create_spinner, dataset::Dataset, request::DateRange};

/// On-disk layout of the output store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum StoreFormat {
    /// Chunked Zarr V3 directory
    #[default]
    Zarr,
    /// Long-format parquet table
    Parquet,
}

impl StoreFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            StoreFormat::Zarr => "zarr",
            StoreFormat::Parquet => "parquet",
        }
    }
}

/// `<output_dir>/<start>_<end>[_suffix]_<source>_data.<ext>`
pub fn store_path(
    output_dir: &Path,
    range: &DateRange,
    suffix: Option<&str>,
    source: &str,
    format: StoreFormat,
) -> PathBuf {
    let label = |s: &str| s.replace(':', "-").replace(' ', "T");
    let suffix = suffix.map(|s| format!("_{}", s)).unwrap_or_default();
    let name = format!(
        "{}_{}{}_{}_data.{}",
        label(&range.start_label),
        label(&range.end_label),
        suffix,
        source,
        format.extension()
    );

    output_dir.join(name)
}

/// Writes `ds` to `path`, replacing whatever was there.
pub fn save(ds: &Dataset, path: &Path, format: StoreFormat) -> Result<()> {
    remove_existing(path)?;

    let bar = create_spinner(format!("Writing {}...", path.display()));
    match format {
        StoreFormat::Zarr => zarr::save(ds, path),
        StoreFormat::Parquet => parquet::save(ds, path),
    }
    .with_context(|| format!("failed to write {}", path.display()))?;
    bar.finish_with_message(format!("Saved to {}", path.display()));

    info!(
        path = %path.display(),
        times = ds.times.len(),
        cells = ds.spatial.cells(),
        variables = ds.variables.len(),
        "store written"
    );
    Ok(())
}

fn remove_existing(path: &Path) -> Result<()> {
    let removed = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match removed {
        Ok(()) => {
            debug!("replaced existing store {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("could not remove {}", path.display())),
    }
}

/// Deletes raw files, then the scratch directory if nothing else is left in it.
///
/// Never fails: files already gone are ignored and other errors are logged.
pub fn cleanup(paths: &[PathBuf], scratch_dir: &Path) {
    let mut removed = 0;
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove {}: {}", path.display(), e),
        }
    }

    // fails while other runs still have files in there
    if fs::remove_dir(scratch_dir).is_ok() {
        debug!("removed scratch directory {}", scratch_dir.display());
    }

    info!(removed, "cleaned up raw files");
}

// -- Tests -------------------------------------------------------------------
