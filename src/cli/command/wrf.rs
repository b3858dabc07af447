//! UCLA WRF-CMIP6 downscaled hourly output from the public S3 bucket.

use std::{ops::RangeInclusive, sync::Arc};

use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime};
use clap::Args;
use tracing::{info, warn};

use crate::{
    catalog::{FetchTarget, Location},
    cli::CommonArgs,
    dataset::Dataset,
    download::{FetchReport, Fetcher, S3Transport, Transport},
    geo::Boundary,
    persist,
    pipeline::{self, Outcome, NO_FILES},
    reading::netcdf::{self, WrfGrid},
    request::{Frequency, Request},
};

pub const WORKERS: usize = 24;
const BUCKET: &str = "wrf-cmip6-noversioning";
const REGION: &str = "us-west-2";
const ROOT: &str = "downscaled_products";
const CROP_MARGIN: f64 = 0.05;

#[derive(Args, Debug, Clone)]
pub struct WrfArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// GCM, variant and scenario, e.g. cesm2_r11i1p1f1_ssp245
    #[arg(long)]
    pub model: String,

    /// 1 for wrfout files, 2 for hourly auxhist files
    #[arg(long, default_value_t = 2)]
    pub data_tier: u8,

    /// 1 (45km), 2 (9km), 3 (3km California) or 4 (3km Wyoming)
    #[arg(long, default_value_t = 2)]
    pub domain: u8,

    /// Read the historical run of the model
    #[arg(long)]
    pub historical: bool,

    /// Read the bias corrected run of the model
    #[arg(long)]
    pub bias_corrected: bool,
}

/// The run of the downscaling archive a request reads.
#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub model: String,
    pub tier: u8,
    pub domain: u8,
    pub historical: bool,
    pub bias_corrected: bool,
}

fn within(value: u8, allowed: RangeInclusive<u8>, default: u8, what: &str) -> u8 {
    if allowed.contains(&value) {
        value
    } else {
        warn!("{} is not a valid {}. Using {} instead", value, what, default);
        default
    }
}

impl Product {
    pub fn from_args(args: &WrfArgs) -> Self {
        Product {
            model: args.model.trim().to_string(),
            tier: within(args.data_tier, 1..=2, 2, "data tier"),
            domain: within(args.domain, 1..=4, 2, "domain"),
            historical: args.historical,
            bias_corrected: args.bias_corrected,
        }
    }

    /// Model directory, e.g. `cesm2_r11i1p1f1_historical_bc`.
    pub fn model_dir(&self) -> String {
        format!(
            "{}{}{}",
            self.model,
            if self.historical { "_historical" } else { "" },
            if self.bias_corrected { "_bc" } else { "" }
        )
    }

    /// Object key of the file written at `hour`.
    ///
    /// Yearly directories start in September, so anything before October
    /// lives under the previous year.
    pub fn key(&self, hour: NaiveDateTime) -> String {
        let family = if self.model.starts_with("era5") { "reanalysis" } else { "gcm" };
        let prefix = if self.tier == 1 { "wrfout" } else { "auxhist" };
        let dir_year = if hour.month() > 9 { hour.year() } else { hour.year() - 1 };
        format!(
            "{}/{}/{}/hourly/{}/d0{}/{}_d01_{}",
            ROOT,
            family,
            self.model_dir(),
            dir_year,
            self.domain,
            prefix,
            hour.format("%Y-%m-%d_%H:%M:%S")
        )
    }

    pub fn local_name(&self, key: &str) -> String {
        let base = key.rsplit('/').next().unwrap_or(key);
        format!("{}_{}.nc", self.model_dir(), base.replace(':', "-"))
    }

    fn coordinates_target(&self, time: NaiveDateTime) -> FetchTarget {
        let name = format!("wrfinput_d0{}", self.domain);
        FetchTarget::new(
            name.clone(),
            Location::S3Key(format!("{}/wrf_coordinates/{}", ROOT, name)),
            name,
            time,
        )
    }
}

pub async fn wrf(args: WrfArgs) -> Result<Outcome> {
    netcdf::ensure_supported().context("rebuild with `--features netcdf` to read WRF files")?;
    let product = Product::from_args(&args);
    let request = match args.common.unchecked_request("WRF", Frequency::Hourly) {
        Ok(r) => r,
        Err(e) => return Ok(e.into()),
    };
    let boundary = match request.boundary.as_deref().map(Boundary::load).transpose() {
        Ok(b) => b,
        Err(e) => return Ok(e.into()),
    };

    let transport = S3Transport::public(BUCKET, REGION)?;
    run(&request, &product, boundary.as_ref(), Arc::new(transport)).await
}

/// Every hour from midnight of the first day to midnight of the last.
pub fn catalog(request: &Request, product: &Product) -> Vec<FetchTarget> {
    let first = request.range.start.date().and_time(NaiveTime::MIN);
    let last = request.range.end.date().and_time(NaiveTime::MIN);

    std::iter::successors(Some(first), |h| Some(*h + Duration::hours(1)))
        .take_while(|h| *h <= last)
        .map(|hour| {
            let key = product.key(hour);
            let name = product.local_name(&key);
            FetchTarget::new(key.clone(), Location::S3Key(key), name, hour)
        })
        .collect()
}

async fn run(
    request: &Request,
    product: &Product,
    boundary: Option<&Boundary>,
    transport: Arc<dyn Transport>,
) -> Result<Outcome> {
    let fetcher = Fetcher::new(transport, WORKERS, &request.scratch_dir);
    let targets = catalog(request, product);
    info!(targets = targets.len(), model = %product.model_dir(), domain = product.domain, "WRF catalog built");

    let report = pipeline::fetch(&fetcher, targets).await?;
    if report.succeeded.is_empty() {
        persist::cleanup(&report.paths(), &request.scratch_dir);
        return Ok(Outcome::Skipped(NO_FILES.to_string()));
    }

    let metadata = pipeline::fetch(&fetcher, vec![product.coordinates_target(request.range.start)]).await?;
    let outcome = match coordinates(&metadata) {
        Ok(grid) => assemble(request, product, boundary, &grid, &report),
        Err(e) => Err(e),
    };
    persist::cleanup(&[report.paths(), metadata.paths()].concat(), &request.scratch_dir);

    outcome
}

fn coordinates(metadata: &FetchReport) -> Result<WrfGrid> {
    let file = metadata
        .succeeded
        .first()
        .ok_or_else(|| anyhow!("could not download the WRF coordinates file"))?;
    netcdf::read_wrf_coordinates(&file.path).with_context(|| format!("could not read {}", file.path.display()))
}

fn assemble(
    request: &Request,
    product: &Product,
    boundary: Option<&Boundary>,
    grid: &WrfGrid,
    report: &FetchReport,
) -> Result<Outcome> {
    let bbox = boundary.map(|b| b.bbox().padded(CROP_MARGIN));

    let pieces = pipeline::decode_each(&report.succeeded, |f| netcdf::read_wrf(&f.path, grid))
        .into_iter()
        .map(|(_, mut ds)| {
            if !request.variables.is_empty() {
                ds.select_variables(&request.variables);
            }
            pipeline::crop(ds.normalize_longitude(), bbox.as_ref())
        })
        .collect::<Result<Vec<Dataset>, _>>()?;

    if pieces.is_empty() {
        return Ok(pipeline::nothing_decoded(report));
    }

    let mut ds = pipeline::combine(pieces)?.floor_times(Frequency::Hourly);
    if ds.is_empty() {
        return Ok(Outcome::Skipped(format!(
            "None of {} found in the WRF files. Exiting...",
            request.variables.join(", ")
        )));
    }
    ds.attrs.insert("source".into(), "WRF-CMIP6".into());
    ds.attrs.insert("model".into(), product.model_dir());
    ds.attrs.insert("domain".into(), product.domain.to_string());
    ds.attrs.insert("start".into(), request.range.start_label.clone());
    ds.attrs.insert("end".into(), request.range.end_label.clone());

    let source = format!("wrf_{}", product.model);
    let path = persist::store_path(&request.output_dir, &request.range, None, &source, request.format);
    pipeline::save(ds, boundary, &path, request.format)
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use super::*;
    use crate::{cli::tests::common, dataset::tests::t, download::tests::MemoryTransport};

    fn product(model: &str) -> Product {
        Product {
            model: model.into(),
            tier: 2,
            domain: 2,
            historical: false,
            bias_corrected: false,
        }
    }

    fn request(start: &str, end: &str, dir: &std::path::Path) -> Request {
        common(start, end, "", dir).unchecked_request("WRF", Frequency::Hourly).unwrap()
    }

    #[test]
    fn should_file_autumn_hours_under_their_own_year() {
        let p = product("cesm2_r11i1p1f1_ssp245");

        assert_eq!(
            p.key(t("2020-10-01T05:00")),
            "downscaled_products/gcm/cesm2_r11i1p1f1_ssp245/hourly/2020/d02/auxhist_d01_2020-10-01_05:00:00"
        );
        assert_eq!(
            p.key(t("2021-09-30T23:00")),
            "downscaled_products/gcm/cesm2_r11i1p1f1_ssp245/hourly/2020/d02/auxhist_d01_2021-09-30_23:00:00"
        );
    }

    #[test]
    fn should_build_reanalysis_and_variant_keys() {
        let era5 = Product { tier: 1, domain: 1, ..product("era5") };
        assert_eq!(
            era5.key(t("2000-01-01")),
            "downscaled_products/reanalysis/era5/hourly/1999/d01/wrfout_d01_2000-01-01_00:00:00"
        );

        let bc = Product { historical: true, bias_corrected: true, ..product("cesm2") };
        assert!(bc.key(t("2000-01-01")).starts_with("downscaled_products/gcm/cesm2_historical_bc/hourly/"));
        assert_eq!(
            bc.local_name(&bc.key(t("2000-01-01T03:00"))),
            "cesm2_historical_bc_auxhist_d01_2000-01-01_03-00-00.nc"
        );
    }

    #[test]
    fn should_fall_back_on_invalid_domain_and_tier() {
        let args = WrfArgs {
            common: common("2000-01-01", "2000-01-01", "", std::path::Path::new("/tmp/x")),
            model: "cesm2".into(),
            data_tier: 3,
            domain: 7,
            historical: false,
            bias_corrected: false,
        };

        let p = Product::from_args(&args);

        assert_eq!((p.tier, p.domain), (2, 2));
    }

    #[test]
    fn should_cover_midnight_to_midnight() {
        let tmp = TempDir::new().unwrap();
        let targets = catalog(&request("2000-01-01T13:00", "2000-01-02T06:00", tmp.path()), &product("cesm2"));

        assert_eq!(targets.len(), 25);
        assert_eq!(targets[0].time, t("2000-01-01"));
        assert_eq!(targets[24].time, t("2000-01-02"));
        assert!(matches!(&targets[3].location, Location::S3Key(k) if k.ends_with("2000-01-01_03:00:00")));
    }

    #[tokio::test]
    async fn should_exit_when_nothing_downloads() {
        let tmp = TempDir::new().unwrap();
        let request = request("2000-01-01", "2000-01-01", tmp.path());
        let transport = MemoryTransport { documents: HashMap::new() };

        let outcome = run(&request, &product("cesm2"), None, Arc::new(transport)).await.unwrap();

        assert_eq!(outcome, Outcome::Skipped(NO_FILES.to_string()));
        assert!(!request.scratch_dir.exists());
    }

    #[cfg(not(feature = "netcdf"))]
    #[tokio::test]
    async fn should_fail_without_coordinates_and_clean_up() {
        let tmp = TempDir::new().unwrap();
        let request = request("2000-01-01", "2000-01-01", tmp.path());
        let p = product("cesm2");
        let mut documents: HashMap<String, Vec<u8>> = catalog(&request, &p)
            .into_iter()
            .map(|x| (x.id, b"CDF".to_vec()))
            .collect();
        documents.insert("downscaled_products/wrf_coordinates/wrfinput_d02".into(), b"CDF".to_vec());

        let result = run(&request, &p, None, Arc::new(MemoryTransport { documents })).await;

        assert!(result.is_err());
        assert!(!request.scratch_dir.exists());
    }

    #[cfg(not(feature = "netcdf"))]
    #[tokio::test]
    async fn should_refuse_to_download_without_netcdf_support() {
        let tmp = TempDir::new().unwrap();
        let args = WrfArgs {
            common: common("2000-01-01", "2000-01-02", "", tmp.path()),
            model: "cesm2".into(),
            data_tier: 2,
            domain: 2,
            historical: false,
            bias_corrected: false,
        };

        let err = wrf(args).await.unwrap_err();

        assert!(format!("{:#}", err).contains("NetCDF decoding is not enabled"));
        assert!(!tmp.path().join("scratch").exists());
    }
}
