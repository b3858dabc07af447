//! Command line interface.

pub mod command;

use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use crate::{
    error::ValidationError,
    persist::StoreFormat,
    request::{parse_variables, DateRange, Frequency, Request},
};
use command::{hrrr::HrrrArgs, ornl::OrnlArgs, prism::PrismArgs, snotel::SnotelArgs, wrf::WrfArgs};

#[derive(Parser)]
#[command(version, about, long_about = None)]
/// Downloads weather and climate datasets clipped to a boundary
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Get HRRR forecast fields from the NOAA archive
    Hrrr(HrrrArgs),
    /// Get ORNL 9505 VIC/Daymet yearly grids
    Ornl(OrnlArgs),
    /// Get PRISM 4km daily rasters
    Prism(PrismArgs),
    /// Get SNOTEL station series from the NRCS AWDB
    Snotel(SnotelArgs),
    /// Get downscaled WRF-CMIP6 output from S3
    Wrf(WrfArgs),
}

/// Flags shared by every downloader.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Start of the range, e.g. 2020-10-01
    #[arg(long)]
    pub start: String,

    /// End of the range (inclusive)
    #[arg(long)]
    pub end: String,

    /// Comma separated variables; empty means the source defaults
    #[arg(long, default_value = "")]
    pub variables: String,

    /// Directory the store is written to
    #[arg(long, default_value = "data/weather_data/")]
    pub output_dir: PathBuf,

    /// GeoJSON polygon limiting the downloaded data
    #[arg(long, default_value = "data/GIS/SkagitBoundary.json")]
    pub geojson: PathBuf,

    /// Where raw files are kept until the store is written
    #[arg(long, env = "WXDL_SCRATCH_DIR")]
    pub scratch_dir: Option<PathBuf>,

    /// Output store format
    #[arg(long, value_enum, default_value_t = StoreFormat::Zarr)]
    pub format: StoreFormat,
}

impl CommonArgs {
    /// Validates the flags into a request for `source`.
    pub fn request(
        &self,
        source: &str,
        frequency: Frequency,
        allowed: &[&str],
        defaults: &[&str],
    ) -> Result<Request, ValidationError> {
        let range = DateRange::parse(&self.start, &self.end)?;
        let variables = parse_variables(&self.variables, allowed, defaults, source);
        if variables.is_empty() {
            return Err(ValidationError::NoVariables);
        }

        Ok(self.build(source, range, frequency, variables))
    }

    /// Like [`CommonArgs::request`] for sources without an allow-list.
    ///
    /// Variables are kept as given; an empty list means every variable in the files.
    pub fn unchecked_request(&self, source: &str, frequency: Frequency) -> Result<Request, ValidationError> {
        let range = DateRange::parse(&self.start, &self.end)?;
        let mut variables: Vec<String> = Vec::new();
        for name in self.variables.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if !variables.iter().any(|v| v == name) {
                variables.push(name.to_string());
            }
        }

        Ok(self.build(source, range, frequency, variables))
    }

    fn build(&self, source: &str, range: DateRange, frequency: Frequency, variables: Vec<String>) -> Request {
        Request {
            range,
            frequency,
            variables,
            output_dir: self.output_dir.clone(),
            boundary: Some(self.geojson.clone()),
            scratch_dir: self.scratch_dir(source),
            format: self.format,
        }
    }

    pub fn scratch_dir(&self, source: &str) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("wxdl")
                .join(source.to_lowercase())
        })
    }
}

/// Creates a spinner.
pub fn create_spinner(message: String) -> ProgressBar {
    let bar = ProgressBar::new_spinner().with_message(message);
    bar.enable_steady_tick(Duration::from_millis(100));

    bar
}

/// Creates a progress bar.
pub fn create_progress_bar(size: u64, message: String) -> ProgressBar {
    let bar = ProgressBar::new(size).with_message(message);
    match ProgressStyle::with_template("[{eta_precise}] {bar:40.cyan/blue} {msg}") {
        Ok(style) => bar.with_style(style.progress_chars("##-")),
        Err(_) => bar,
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::path::Path;

    use super::*;

    /// Flags as they would be parsed for a run writing into `dir`.
    pub(crate) fn common(start: &str, end: &str, variables: &str, dir: &Path) -> CommonArgs {
        CommonArgs {
            start: start.into(),
            end: end.into(),
            variables: variables.into(),
            output_dir: dir.join("out"),
            geojson: dir.join("boundary.json"),
            scratch_dir: Some(dir.join("scratch")),
            format: StoreFormat::Zarr,
        }
    }

    #[test]
    fn should_parse_subcommand_flags() {
        let cli = Cli::try_parse_from([
            "wxdl",
            "prism",
            "--start",
            "2021-01-01",
            "--end",
            "2021-01-03",
            "--variables",
            "tmax,ppt",
            "--format",
            "parquet",
        ])
        .unwrap();

        let Commands::Prism(args) = cli.command else { panic!("expected prism") };
        assert_eq!(args.common.variables, "tmax,ppt");
        assert_eq!(args.common.output_dir, PathBuf::from("data/weather_data/"));
        assert_eq!(args.common.format, StoreFormat::Parquet);
    }

    #[test]
    fn should_build_request() {
        let args = common("2021-01-01", "2021-01-02", "TMAX,BOGUS", Path::new("/tmp/x"));

        let request = args.request("Test", Frequency::Daily, &["TMAX", "TMIN"], &["TMIN"]).unwrap();

        assert_eq!(request.variables, vec!["TMAX"]);
        assert_eq!(request.scratch_dir, PathBuf::from("/tmp/x/scratch"));
    }

    #[test]
    fn should_refuse_request_without_variables() {
        let args = common("2021-01-01", "2021-01-02", "BOGUS", Path::new("/tmp/x"));
        let err = args.request("Test", Frequency::Daily, &["TMAX"], &["TMAX"]).unwrap_err();
        assert!(matches!(err, ValidationError::NoVariables));
    }

    #[test]
    fn should_keep_free_variable_list() {
        let args = common("2021-01-01", "2021-01-02", "T2, Q2,T2", Path::new("/tmp/x"));
        assert_eq!(args.unchecked_request("WRF", Frequency::Hourly).unwrap().variables, vec!["T2", "Q2"]);

        let args = common("2021-01-01", "2021-01-02", "", Path::new("/tmp/x"));
        assert!(args.unchecked_request("WRF", Frequency::Hourly).unwrap().variables.is_empty());
    }

    #[test]
    fn should_default_scratch_dir_per_source() {
        let mut args = common("2021", "2021", "", Path::new("/tmp/x"));
        args.scratch_dir = None;
        assert!(args.scratch_dir("PRISM").ends_with("wxdl/prism"));
    }
}
