//! ORNL 9505 VIC/Daymet yearly grids, historical or CMIP6 downscaled.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Args;
use tracing::{info, warn};

use crate::{
    catalog::{FetchTarget, Location},
    cli::CommonArgs,
    dataset::Dataset,
    download::{FetchReport, Fetcher, HttpTransport, Transport},
    geo::Boundary,
    persist,
    pipeline::{self, Outcome, NO_DECODABLE_FILES},
    reading::netcdf,
    request::{choose, Frequency, Request},
};

pub const WORKERS: usize = 4;
const ROOT: &str = "https://hydrosource2.ornl.gov/files/SWA9505V3";
const CROP_MARGIN: f64 = 0.05;

pub const VARIABLES: &[&str] = &[
    "prcp", "tmax", "tmin", "wind", "rhum", "srad", "lrad", "qair", "vp", "vpd", "pres", "runoff",
    "runoffs", "runoffb", "swe", "evap", "pet", "soilm", "PRMS_runoff", "PRMS_runoffs", "PRMS_runoffb",
    "PRMS_swe", "PRMS_evap", "PRMS_pet", "PRMS_soilm",
];
const DEFAULT_VARIABLES: &[&str] = &["prcp", "tmax", "tmin", "wind", "rhum", "srad", "lrad"];

const HYDRO_MODELS: &[&str] = &["VIC4"];
const REFERENCES: &[&str] = &["DaymetV4", "Livneh"];
const GCMS: &[&str] = &[
    "ACCESS-CM2",
    "BCC-CSM2-MR",
    "CNRM-ESM2-1",
    "EC-Earth3",
    "MPI-ESM1-2-HR",
    "MRI-ESM2-0",
    "NorESM2-MM",
];
const DOWNSCALING_METHODS: &[&str] = &["DBCCA", "RegCM"];
const SCENARIOS: &[&str] = &["ssp126", "ssp245", "ssp370", "ssp585"];

const HISTORICAL_YEARS: (i32, i32) = (1950, 2018);
const PROJECTION_YEARS: (i32, i32) = (1980, 2099);

#[derive(Args, Debug, Clone)]
pub struct OrnlArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Reference meteorological observations: DaymetV4 or Livneh
    #[arg(long, default_value = "DaymetV4")]
    pub reference: String,

    /// Hydrological model (only VIC4 is published)
    #[arg(long, default_value = "VIC4")]
    pub hydro_model: String,

    /// Global climate model, e.g. ACCESS-CM2
    #[arg(long)]
    pub gcm: Option<String>,

    /// Climate scenario, e.g. ssp585
    #[arg(long)]
    pub scenario: Option<String>,

    /// Downscaling method: DBCCA or RegCM
    #[arg(long)]
    pub downscaling_method: Option<String>,

    /// CMIP6 ensemble member; derived from the GCM when omitted
    #[arg(long)]
    pub ensemble_id: Option<String>,
}

/// Which family of files to read.
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    /// Observation-driven runs only.
    Reference,
    /// Downscaled GCM projection.
    Projection {
        gcm: String,
        scenario: String,
        ensemble: String,
        method: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub reference: String,
    pub hydro_model: String,
    pub variant: Variant,
}

impl Product {
    pub fn from_args(args: &OrnlArgs) -> Self {
        let reference = choose(Some(args.reference.as_str()), REFERENCES, "DaymetV4", "reference").to_string();
        let hydro_model = choose(Some(args.hydro_model.as_str()), HYDRO_MODELS, "VIC4", "hydro model").to_string();

        let pick = |value: &Option<String>, allowed: &[&str], what: &str| -> Option<String> {
            let value = value.as_deref()?.trim();
            if allowed.contains(&value) {
                Some(value.to_string())
            } else {
                warn!("{} is not a valid {}", value, what);
                None
            }
        };
        let gcm = pick(&args.gcm, GCMS, "GCM");
        let scenario = pick(&args.scenario, SCENARIOS, "climate scenario");
        let method = pick(&args.downscaling_method, DOWNSCALING_METHODS, "downscaling method");

        let variant = match (gcm, scenario, method) {
            (Some(gcm), Some(scenario), Some(method)) => {
                let ensemble = args.ensemble_id.clone().unwrap_or_else(|| ensemble_id(&gcm).to_string());
                Variant::Projection {
                    gcm,
                    scenario,
                    ensemble,
                    method,
                }
            }
            _ => {
                info!("No GCM, climate scenario or downscaling method provided. Using reference data only.");
                Variant::Reference
            }
        };

        Product {
            reference,
            hydro_model,
            variant,
        }
    }

    fn years(&self) -> (i32, i32) {
        match self.variant {
            Variant::Reference => HISTORICAL_YEARS,
            Variant::Projection { .. } => PROJECTION_YEARS,
        }
    }

    /// Path of one variable's file for `year`, relative to the archive root.
    pub fn file_path(&self, variable: &str, year: i32) -> String {
        let (reference, hydro) = (&self.reference, &self.hydro_model);
        match &self.variant {
            Variant::Reference => {
                format!("{reference}/{variable}/{reference}_{hydro}_{variable}_{year}.nc")
            }
            Variant::Projection {
                gcm,
                scenario,
                ensemble,
                method,
            } => {
                let reference = if reference == "DaymetV4" { "Daymet" } else { reference.as_str() };
                let run = format!("{gcm}_{scenario}_{ensemble}_{method}_{reference}");
                format!("{run}/{variable}/{run}_{hydro}_{variable}_{year}.nc")
            }
        }
    }

    /// Distinguishes projection stores from reference ones.
    pub fn store_suffix(&self) -> Option<String> {
        match &self.variant {
            Variant::Reference => None,
            Variant::Projection { gcm, scenario, method, .. } => Some(format!("{}_{}_{}", gcm, scenario, method)),
        }
    }
}

pub fn ensemble_id(gcm: &str) -> &'static str {
    match gcm {
        "CNRM-ESM2-1" => "r1i1p1f2",
        _ => "r1i1p1f1",
    }
}

pub async fn ornl(args: OrnlArgs) -> Result<Outcome> {
    netcdf::ensure_supported().context("rebuild with `--features netcdf` to read ORNL files")?;
    let request = match args.common.request("ORNL", Frequency::Yearly, VARIABLES, DEFAULT_VARIABLES) {
        Ok(r) => r,
        Err(e) => return Ok(e.into()),
    };
    let boundary = match request.boundary.as_deref().map(Boundary::load).transpose() {
        Ok(b) => b,
        Err(e) => return Ok(e.into()),
    };
    let product = Product::from_args(&args);

    run(&request, &product, boundary.as_ref(), Arc::new(HttpTransport::new()?)).await
}

/// One NetCDF file per (variable, year) inside the product's year window.
pub fn catalog(request: &Request, product: &Product) -> Vec<FetchTarget> {
    let (first, last) = product.years();
    let years: Vec<i32> = request
        .range
        .years()
        .filter(|y| {
            if *y > last {
                warn!("Year {} is greater than {}. Skipping...", y, last);
                false
            } else if *y < first {
                warn!("Year {} is less than {}. Skipping...", y, first);
                false
            } else {
                true
            }
        })
        .collect();

    let mut targets = Vec::new();
    for variable in &request.variables {
        for year in &years {
            let Some(time) = NaiveDate::from_ymd_opt(*year, 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0)) else {
                continue;
            };
            let path = product.file_path(variable, *year);
            let file_name = path.rsplit('/').next().unwrap_or(&path).to_string();
            targets.push(
                FetchTarget::new(path.clone(), Location::Url(format!("{}/{}", ROOT, path)), file_name, time)
                    .with_variables(vec![variable.clone()]),
            );
        }
    }

    targets
}

async fn run(
    request: &Request,
    product: &Product,
    boundary: Option<&Boundary>,
    transport: Arc<dyn Transport>,
) -> Result<Outcome> {
    let targets = catalog(request, product);
    if targets.is_empty() {
        return Ok(Outcome::Skipped("No files to download for the given years. Exiting...".to_string()));
    }
    info!(targets = targets.len(), "ORNL catalog built");

    let fetcher = Fetcher::new(transport, WORKERS, &request.scratch_dir);
    let report = pipeline::fetch(&fetcher, targets).await?;
    let outcome = assemble(request, product, boundary, &report);
    persist::cleanup(&report.paths(), &request.scratch_dir);

    outcome
}

fn assemble(request: &Request, product: &Product, boundary: Option<&Boundary>, report: &FetchReport) -> Result<Outcome> {
    let bbox = boundary.map(|b| b.bbox().padded(CROP_MARGIN));

    let pieces = pipeline::decode_each(&report.succeeded, |f| {
        let var = f.target.variables.first().map(String::as_str).unwrap_or_default();
        netcdf::read_grid(&f.path, var)
    })
    .into_iter()
    .map(|(_, ds)| pipeline::crop(ds.normalize_longitude(), bbox.as_ref()))
    .collect::<Result<Vec<Dataset>, _>>()?;

    if pieces.is_empty() {
        return Ok(pipeline::nothing_decoded(report));
    }

    let mut ds = pipeline::combine(pieces)?.floor_times(Frequency::Daily);
    ds.attrs.insert("source".into(), "ORNL".into());
    ds.attrs.insert("reference".into(), product.reference.clone());
    ds.attrs.insert("hydro_model".into(), product.hydro_model.clone());
    ds.attrs.insert("start".into(), request.range.start_label.clone());
    ds.attrs.insert("end".into(), request.range.end_label.clone());

    let suffix = product.store_suffix();
    let path = persist::store_path(&request.output_dir, &request.range, suffix.as_deref(), "ORNL", request.format);
    pipeline::save(ds, boundary, &path, request.format)
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::cli::tests::common;

    fn args(start: &str, end: &str, dir: &std::path::Path) -> OrnlArgs {
        OrnlArgs {
            common: common(start, end, "prcp,tmax", dir),
            reference: "DaymetV4".into(),
            hydro_model: "VIC4".into(),
            gcm: None,
            scenario: None,
            downscaling_method: None,
            ensemble_id: None,
        }
    }

    fn request(args: &OrnlArgs) -> Request {
        args.common
            .request("ORNL", Frequency::Yearly, VARIABLES, DEFAULT_VARIABLES)
            .unwrap()
    }

    #[test]
    fn should_fall_back_to_reference_runs() {
        let tmp = TempDir::new().unwrap();
        let mut args = args("2000", "2001", tmp.path());
        args.gcm = Some("ACCESS-CM2".into());
        args.scenario = Some("ssp999".into());
        args.downscaling_method = Some("DBCCA".into());

        let product = Product::from_args(&args);
        let targets = catalog(&request(&args), &product);

        assert_eq!(product.variant, Variant::Reference);
        assert_eq!(targets.len(), 4);
        assert_eq!(
            targets[0].location,
            Location::Url(format!("{}/DaymetV4/prcp/DaymetV4_VIC4_prcp_2000.nc", ROOT))
        );
        assert_eq!(targets[3].file_name, "DaymetV4_VIC4_tmax_2001.nc");
    }

    #[test]
    fn should_build_projection_paths() {
        let tmp = TempDir::new().unwrap();
        let mut args = args("2050", "2050", tmp.path());
        args.gcm = Some("CNRM-ESM2-1".into());
        args.scenario = Some("ssp585".into());
        args.downscaling_method = Some("DBCCA".into());

        let product = Product::from_args(&args);

        assert_eq!(
            product.file_path("prcp", 2050),
            "CNRM-ESM2-1_ssp585_r1i1p1f2_DBCCA_Daymet/prcp/CNRM-ESM2-1_ssp585_r1i1p1f2_DBCCA_Daymet_VIC4_prcp_2050.nc"
        );
        assert_eq!(product.store_suffix().as_deref(), Some("CNRM-ESM2-1_ssp585_DBCCA"));

        args.ensemble_id = Some("r2i1p1f2".into());
        assert!(Product::from_args(&args).file_path("prcp", 2050).contains("_r2i1p1f2_"));
    }

    #[test]
    fn should_skip_years_outside_the_archive() {
        let tmp = TempDir::new().unwrap();
        let args = args("2017", "2020", tmp.path());
        let product = Product::from_args(&args);

        let targets = catalog(&request(&args), &product);

        let years: Vec<String> = targets.iter().map(|x| x.time.format("%Y").to_string()).collect();
        assert_eq!(years, vec!["2017", "2018", "2017", "2018"]);
    }

    #[test]
    fn should_derive_ensemble_from_gcm() {
        assert_eq!(ensemble_id("CNRM-ESM2-1"), "r1i1p1f2");
        assert_eq!(ensemble_id("NorESM2-MM"), "r1i1p1f1");
    }

    #[tokio::test]
    async fn should_exit_without_targets() {
        let tmp = TempDir::new().unwrap();
        let args = args("1900", "1901", tmp.path());
        let product = Product::from_args(&args);
        let transport = Arc::new(crate::download::tests::MemoryTransport {
            documents: Default::default(),
        });

        let outcome = run(&request(&args), &product, None, transport).await.unwrap();

        assert!(matches!(outcome, Outcome::Skipped(_)));
    }

    #[cfg(not(feature = "netcdf"))]
    #[tokio::test]
    async fn should_skip_files_it_cannot_decode() {
        let tmp = TempDir::new().unwrap();
        let args = args("2000", "2000", tmp.path());
        let request = request(&args);
        let product = Product::from_args(&args);
        let documents = catalog(&request, &product)
            .into_iter()
            .filter_map(|x| match x.location {
                Location::Url(url) => Some((url, b"CDF\x01".to_vec())),
                _ => None,
            })
            .collect();
        let transport = Arc::new(crate::download::tests::MemoryTransport { documents });

        let outcome = run(&request, &product, None, transport).await.unwrap();

        assert_eq!(outcome, Outcome::Skipped(NO_DECODABLE_FILES.to_string()));
        assert!(!request.scratch_dir.exists());
    }

    #[cfg(not(feature = "netcdf"))]
    #[tokio::test]
    async fn should_refuse_to_download_without_netcdf_support() {
        let tmp = TempDir::new().unwrap();
        let args = args("2000", "2000", tmp.path());
        let scratch = request(&args).scratch_dir;

        let err = ornl(args).await.unwrap_err();

        assert!(format!("{:#}", err).contains("NetCDF decoding is not enabled"));
        assert!(!scratch.exists());
    }
}
