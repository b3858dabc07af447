//! HRRR forecast fields from the NOAA archive, fetched by `.idx` byte range.

use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use clap::Args;
use regex::Regex;
use tracing::{info, warn};

use crate::{
    catalog::{FetchTarget, Location},
    cli::CommonArgs,
    dataset::horizon::{self, Field, Horizon},
    dataset::Dataset,
    download::{FetchReport, Fetcher, HttpTransport, Transport},
    geo::Boundary,
    persist,
    pipeline::{self, Outcome, NO_FILES},
    reading::grib,
    request::{choose, Frequency, Request},
};

pub const WORKERS: usize = 2;
const BASE_URL: &str = "https://noaa-hrrr-bdp-pds.s3.amazonaws.com";
const CROP_MARGIN: f64 = 0.05;
const HORIZONS: [u32; 2] = [0, 1];
const IDX: &str = ".idx";

const MODELS: &[&str] = &["hrrr", "hrrrak"];
const PRODUCTS: &[&str] = &["sfc", "prs", "nat", "subh"];

/// Surface product fields a parameter may name.
pub const FIELDS: &[&str] = &[
    "REFC", "RETOP", "VIL", "VIS", "REFD", "GUST", "UGRD", "VGRD", "MAXUVV", "MAXDVV", "MAXUW", "MAXVW",
    "HGT", "PRES", "MSLMA", "TMP", "POT", "DPT", "SPFH", "RH", "WIND", "APCP", "PRATE", "WEASD", "SNOD",
    "ASNOW", "FROZR", "FRZR", "CSNOW", "CICEP", "CFRZR", "CRAIN", "CPOFP", "TCDC", "LCDC", "MCDC", "HCDC",
    "DSWRF", "DLWRF", "USWRF", "ULWRF", "VBDSF", "VDDSF", "CAPE", "CIN", "PWAT", "HLCY", "LTNG", "SFCR",
    "FRICV", "SHTFL", "LHTFL", "GFLUX", "VGTYP", "LAND", "ICEC", "SNOWC", "TSOIL", "SOILW", "MSTAV",
    "CNWAT", "LFTX", "4LFTX", "HPBL", "VUCSH", "VVCSH", "BGRUN", "SSRUN", "EVP", "GPP",
];
const DEFAULT_PARAMETERS: &[&str] = &[
    "TMP:2 m above ground",
    "RH:2 m above ground",
    "WIND:10 m above ground",
    "DSWRF:surface",
    "DLWRF:surface",
    "APCP:surface",
];

#[derive(Args, Debug, Clone)]
pub struct HrrrArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// hrrr (CONUS) or hrrrak (Alaska)
    #[arg(long, default_value = "hrrr")]
    pub model: String,

    /// sfc, prs, nat or subh
    #[arg(long, default_value = "sfc")]
    pub product: String,
}

/// The archive files of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub model: &'static str,
    pub product: &'static str,
}

impl Product {
    pub fn from_args(args: &HrrrArgs) -> Self {
        Product {
            model: choose(Some(args.model.as_str()), MODELS, "hrrr", "model"),
            product: choose(Some(args.product.as_str()), PRODUCTS, "sfc", "product"),
        }
    }

    pub fn url(&self, init: NaiveDateTime, fxx: u32) -> String {
        let (region, suffix) = match self.model {
            "hrrrak" => ("alaska", ".ak"),
            _ => ("conus", ""),
        };
        format!(
            "{}/hrrr.{}/{}/hrrr.t{}z.wrf{}f{:02}{}.grib2",
            BASE_URL,
            init.format("%Y%m%d"),
            region,
            init.format("%H"),
            self.product,
            fxx,
            suffix
        )
    }
}

/// Parameters whose `VAR` is a known field, as `VAR:LEVEL` or a `:VAR:...` pattern.
fn known_parameters(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| {
            let var = p.trim_start_matches(':').split(':').next().unwrap_or_default();
            FIELDS.contains(&var)
        })
        .map(str::to_string)
        .collect()
}

pub async fn hrrr(args: HrrrArgs) -> Result<Outcome> {
    let product = Product::from_args(&args);
    let known = known_parameters(&args.common.variables);
    let allowed: Vec<&str> = known.iter().map(String::as_str).collect();
    let request = match args.common.request("HRRR", Frequency::Hourly, &allowed, DEFAULT_PARAMETERS) {
        Ok(r) => r,
        Err(e) => return Ok(e.into()),
    };
    let boundary = match request.boundary.as_deref().map(Boundary::load).transpose() {
        Ok(b) => b,
        Err(e) => return Ok(e.into()),
    };

    run(&request, &product, boundary.as_ref(), Arc::new(HttpTransport::new()?)).await
}

/// One GRIB2 file per (init hour, horizon).
pub fn catalog(request: &Request, product: &Product) -> Vec<FetchTarget> {
    Frequency::Hourly
        .buckets(&request.range)
        .into_iter()
        .flat_map(|init| {
            HORIZONS.iter().map(move |fxx| {
                let url = product.url(init, *fxx);
                let file_name = format!("{}.{}", init.format("%Y%m%d"), url.rsplit('/').next().unwrap_or_default());
                FetchTarget::new(horizon_id(init, *fxx), Location::Url(url), file_name, init)
            })
        })
        .collect()
}

fn horizon_id(init: NaiveDateTime, fxx: u32) -> String {
    format!("{}f{:02}", init.format("%Y%m%d%H"), fxx)
}

/// Forecast hour encoded in a target id.
fn horizon_of(id: &str) -> Option<u32> {
    id.rsplit_once('f')?.1.parse().ok()
}

fn index_target(target: &FetchTarget) -> Option<FetchTarget> {
    let Location::Url(url) = &target.location else { return None };
    Some(FetchTarget::new(
        format!("{}{}", target.id, IDX),
        Location::Url(format!("{}{}", url, IDX)),
        format!("{}{}", target.file_name, IDX),
        target.time,
    ))
}

/// Turns each fetched index into a ranged target carrying the selected descriptors.
fn ranged_targets(targets: &[FetchTarget], indexes: &FetchReport, pattern: &Regex) -> Vec<FetchTarget> {
    let by_id: HashMap<&str, &FetchTarget> = targets.iter().map(|t| (t.id.as_str(), t)).collect();

    pipeline::decode_each(&indexes.succeeded, |f| grib::parse_idx(&std::fs::read_to_string(&f.path)?))
        .into_iter()
        .filter_map(|(file, entries)| {
            let target = by_id.get(file.target.id.strip_suffix(IDX)?)?;
            let Location::Url(url) = &target.location else { return None };
            let selected = grib::select(&entries, pattern);
            if selected.is_empty() {
                warn!("No fields in {} match the requested parameters. Skipping...", target.id);
                return None;
            }
            let descriptors = selected.iter().map(|e| e.descriptor()).collect();
            let location = Location::UrlRanges {
                url: url.clone(),
                ranges: grib::byte_ranges(&selected),
            };
            Some(FetchTarget { location, ..(*target).clone() }.with_variables(descriptors))
        })
        .collect()
}

/// Fetches every index, then only the matching messages of every file.
async fn fetch_fields(
    fetcher: &Fetcher,
    targets: &[FetchTarget],
    parameters: &[String],
) -> Result<(FetchReport, FetchReport)> {
    let pattern = grib::search_pattern(parameters).context("could not build the parameter search")?;
    info!("Search string: {}", pattern);

    let indexes = pipeline::fetch(fetcher, targets.iter().filter_map(index_target).collect()).await?;
    let ranged = ranged_targets(targets, &indexes, &pattern);
    let files = pipeline::fetch(fetcher, ranged).await?;

    Ok((indexes, files))
}

async fn run(
    request: &Request,
    product: &Product,
    boundary: Option<&Boundary>,
    transport: Arc<dyn Transport>,
) -> Result<Outcome> {
    let fetcher = Fetcher::new(transport, WORKERS, &request.scratch_dir);
    let targets = catalog(request, product);
    info!(targets = targets.len(), model = product.model, product = product.product, "HRRR catalog built");

    let (indexes, files) = fetch_fields(&fetcher, &targets, &request.variables).await?;
    let outcome = assemble(request, boundary, &files);
    persist::cleanup(&[indexes.paths(), files.paths()].concat(), &request.scratch_dir);

    outcome
}

fn assemble(request: &Request, boundary: Option<&Boundary>, report: &FetchReport) -> Result<Outcome> {
    let bbox = boundary.map(|b| b.bbox().padded(CROP_MARGIN));

    let pieces = pipeline::decode_each(&report.succeeded, |f| grib::read(&f.path, f.target.time, &f.target.variables))
        .into_iter()
        .filter_map(|(file, ds)| {
            let fields: Vec<Field> = grib::fields(&file.target.variables);
            let tag = horizon::classify(&file.target.id, horizon_of(&file.target.id)?, &fields)?;
            Some((tag, ds))
        })
        .map(|(tag, ds)| pipeline::crop(ds.normalize_longitude(), bbox.as_ref()).map(|ds| (tag, ds)))
        .collect::<Result<Vec<(Horizon, Dataset)>, _>>()?;

    if pieces.is_empty() {
        return Ok(pipeline::nothing_decoded(report));
    }

    let mut ds = horizon::recombine(pieces)?.floor_times(Frequency::Hourly);
    ds.attrs.insert("source".into(), "HRRR".into());
    ds.attrs.insert("start".into(), request.range.start_label.clone());
    ds.attrs.insert("end".into(), request.range.end_label.clone());

    let path = persist::store_path(&request.output_dir, &request.range, None, "HRRR", request.format);
    pipeline::save(ds, boundary, &path, request.format)
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{cli::tests::common, dataset::tests::t, download::tests::MemoryTransport};

    const INDEX: &str = "\
1:0:d=2021010100:REFC:entire atmosphere:anl:
2:10:d=2021010100:TMP:2 m above ground:anl:
3:20:d=2021010100:RH:2 m above ground:anl:
4:30:d=2021010100:APCP:surface:0-1 hour acc fcst:
";
    const BODY: &[u8] = b"aaaaaaaaaabbbbbbbbbbccccccccccdddd";

    fn request(variables: &str, dir: &std::path::Path) -> Request {
        let known = known_parameters(variables);
        let allowed: Vec<&str> = known.iter().map(String::as_str).collect();
        common("2021-01-01T00:00", "2021-01-01T02:00", variables, dir)
            .request("HRRR", Frequency::Hourly, &allowed, DEFAULT_PARAMETERS)
            .unwrap()
    }

    fn conus() -> Product {
        Product { model: "hrrr", product: "sfc" }
    }

    #[test]
    fn should_build_two_horizons_per_hour() {
        let tmp = TempDir::new().unwrap();
        let targets = catalog(&request("", tmp.path()), &conus());

        assert_eq!(targets.len(), 6);
        assert_eq!(
            targets[1].location,
            Location::Url(
                "https://noaa-hrrr-bdp-pds.s3.amazonaws.com/hrrr.20210101/conus/hrrr.t00z.wrfsfcf01.grib2".into()
            )
        );
        assert_eq!(targets[1].id, "2021010100f01");
        assert_eq!(targets[1].file_name, "20210101.hrrr.t00z.wrfsfcf01.grib2");
        assert_eq!(targets[5].time, t("2021-01-01T02:00"));
    }

    #[test]
    fn should_name_alaska_files() {
        let alaska = Product { model: "hrrrak", product: "prs" };
        assert_eq!(
            alaska.url(t("2021-06-01T12:00"), 0),
            "https://noaa-hrrr-bdp-pds.s3.amazonaws.com/hrrr.20210601/alaska/hrrr.t12z.wrfprsf00.ak.grib2"
        );
    }

    #[test]
    fn should_validate_parameter_fields() {
        let tmp = TempDir::new().unwrap();
        let request = request("TMP:2 m above ground,BOGUS:surface, APCP:surface", tmp.path());
        assert_eq!(request.variables, vec!["TMP:2 m above ground", "APCP:surface"]);
    }

    #[test]
    fn should_accept_search_patterns_for_known_fields() {
        let tmp = TempDir::new().unwrap();
        let request = request(":APCP:.*acc,:BOGUS:", tmp.path());
        assert_eq!(request.variables, vec![":APCP:.*acc"]);
    }

    #[test]
    fn should_default_to_surface_parameters() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(request("", tmp.path()).variables.len(), DEFAULT_PARAMETERS.len());
    }

    #[test]
    fn should_read_horizon_from_id() {
        assert_eq!(horizon_of("2021010100f01"), Some(1));
        assert_eq!(horizon_of(&horizon_id(t("2021-01-01T05:00"), 0)), Some(0));
        assert_eq!(horizon_of("bogus"), None);
    }

    #[tokio::test]
    async fn should_fetch_only_matching_messages() {
        let tmp = TempDir::new().unwrap();
        let request = request("TMP:2 m above ground,RH:2 m above ground", tmp.path());
        let targets: Vec<FetchTarget> = catalog(&request, &conus()).into_iter().take(1).collect();
        let Location::Url(url) = &targets[0].location else { unreachable!() };
        let documents = [
            (url.clone(), BODY.to_vec()),
            (format!("{}.idx", url), INDEX.as_bytes().to_vec()),
        ]
        .into_iter()
        .collect();
        let fetcher = Fetcher::new(Arc::new(MemoryTransport { documents }), WORKERS, &request.scratch_dir);

        let (indexes, files) = fetch_fields(&fetcher, &targets, &request.variables).await.unwrap();

        assert_eq!(indexes.succeeded.len(), 1);
        let file = &files.succeeded[0];
        assert_eq!(
            file.target.location,
            Location::UrlRanges { url: url.clone(), ranges: vec![(10, Some(29))] }
        );
        assert_eq!(file.target.variables, vec!["TMP:2 m above ground:anl", "RH:2 m above ground:anl"]);
        assert_eq!(std::fs::read(&file.path).unwrap(), b"bbbbbbbbbbcccccccccc");
    }

    #[tokio::test]
    async fn should_skip_files_without_matching_fields() {
        let tmp = TempDir::new().unwrap();
        let request = request("DSWRF:surface", tmp.path());
        let targets: Vec<FetchTarget> = catalog(&request, &conus()).into_iter().take(1).collect();
        let Location::Url(url) = &targets[0].location else { unreachable!() };
        let documents = [(format!("{}.idx", url), INDEX.as_bytes().to_vec())].into_iter().collect();

        let outcome = run(&request, &conus(), None, Arc::new(MemoryTransport { documents })).await.unwrap();

        assert_eq!(outcome, Outcome::Skipped(NO_FILES.to_string()));
        assert!(!request.scratch_dir.exists());
    }
}
