//! PRISM 4km daily rasters from the NACSE web service.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::{
    catalog::{FetchTarget, Location},
    cli::CommonArgs,
    dataset::Dataset,
    download::{FetchReport, Fetcher, HttpTransport, Transport},
    geo::Boundary,
    persist,
    pipeline::{self, Outcome},
    reading::bil,
    request::{Frequency, Request},
};

pub const WORKERS: usize = 6;
const BASE_URL: &str = "https://services.nacse.org/prism/data/public/4km";
const CROP_MARGIN: f64 = 0.05;

pub const VARIABLES: &[&str] = &["tmean", "tmax", "tmin", "ppt", "vpdmax", "vpdmin", "tdmean"];
const DEFAULT_VARIABLES: &[&str] = &["tmean", "tmax", "tmin", "ppt", "vpdmax", "vpdmin"];

#[derive(Args, Debug, Clone)]
pub struct PrismArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

pub async fn prism(args: PrismArgs) -> Result<Outcome> {
    let request = match args.common.request("PRISM", Frequency::Daily, VARIABLES, DEFAULT_VARIABLES) {
        Ok(r) => r,
        Err(e) => return Ok(e.into()),
    };
    let boundary = match request.boundary.as_deref().map(Boundary::load).transpose() {
        Ok(b) => b,
        Err(e) => return Ok(e.into()),
    };

    run(&request, boundary.as_ref(), Arc::new(HttpTransport::new()?)).await
}

/// One zip per (variable, day).
pub fn catalog(request: &Request) -> Vec<FetchTarget> {
    let days = Frequency::Daily.buckets(&request.range);

    request
        .variables
        .iter()
        .flat_map(|var| {
            days.iter().map(move |day| {
                let stamp = day.format("%Y%m%d").to_string();
                FetchTarget::new(
                    format!("{}/{}", var, stamp),
                    Location::Url(format!("{}/{}/{}", BASE_URL, var, stamp)),
                    format!("PRISM_{}_{}.zip", var, stamp),
                    *day,
                )
                .with_variables(vec![var.clone()])
            })
        })
        .collect()
}

async fn run(request: &Request, boundary: Option<&Boundary>, transport: Arc<dyn Transport>) -> Result<Outcome> {
    let fetcher = Fetcher::new(transport, WORKERS, &request.scratch_dir);
    let targets = catalog(request);
    info!(targets = targets.len(), "PRISM catalog built");

    let report = pipeline::fetch(&fetcher, targets).await?;
    let outcome = assemble(request, boundary, &report);
    persist::cleanup(&report.paths(), &request.scratch_dir);

    outcome
}

fn assemble(request: &Request, boundary: Option<&Boundary>, report: &FetchReport) -> Result<Outcome> {
    let bbox = boundary.map(|b| b.bbox().padded(CROP_MARGIN));

    let pieces = pipeline::decode_each(&report.succeeded, |f| {
        let var = f.target.variables.first().map(String::as_str).unwrap_or_default();
        bil::read_zip(&f.path, var, f.target.time)
    })
    .into_iter()
    .map(|(_, ds)| pipeline::crop(ds, bbox.as_ref()))
    .collect::<Result<Vec<Dataset>, _>>()?;

    if pieces.is_empty() {
        return Ok(pipeline::nothing_decoded(report));
    }

    let mut ds = pipeline::combine(pieces)?.floor_times(Frequency::Daily);
    ds.attrs.insert("source".into(), "PRISM".into());
    ds.attrs.insert("start".into(), request.range.start_label.clone());
    ds.attrs.insert("end".into(), request.range.end_label.clone());

    let path = persist::store_path(&request.output_dir, &request.range, None, "PRISM", request.format);
    pipeline::save(ds, boundary, &path, request.format)
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use super::*;
    use crate::{
        cli::tests::common,
        dataset::tests::t,
        download::tests::MemoryTransport,
        geo::tests::box_geojson,
        reading::bil::tests::zipped_raster,
    };

    fn request(variables: &str, dir: &std::path::Path) -> Request {
        common("2021-01-01", "2021-01-03", variables, dir)
            .request("PRISM", Frequency::Daily, VARIABLES, DEFAULT_VARIABLES)
            .unwrap()
    }

    #[test]
    fn should_build_one_target_per_variable_and_day() {
        let tmp = TempDir::new().unwrap();
        let request = request("tmax,ppt", tmp.path());

        let targets = catalog(&request);

        assert_eq!(targets.len(), 6);
        assert_eq!(
            targets[0].location,
            Location::Url("https://services.nacse.org/prism/data/public/4km/tmax/20210101".into())
        );
        assert_eq!(targets[5].file_name, "PRISM_ppt_20210103.zip");
        assert!(targets.iter().all(|x| request.range.contains(&x.time)));
    }

    #[test]
    fn should_default_to_all_but_dew_point() {
        let tmp = TempDir::new().unwrap();
        let request = request("", tmp.path());
        assert_eq!(request.variables.len(), 6);
        assert!(!request.variables.contains(&"tdmean".to_string()));
    }

    #[tokio::test]
    async fn should_download_merge_and_clean_up() {
        let tmp = TempDir::new().unwrap();
        let request = request("tmax", tmp.path());
        let documents: HashMap<String, Vec<u8>> = catalog(&request)
            .into_iter()
            .filter(|x| x.time != t("2021-01-03"))
            .map(|x| match x.location {
                Location::Url(url) => (url, zipped_raster()),
                _ => unreachable!(),
            })
            .collect();
        // covers the two western cells of the top row
        let boundary = Boundary::from_geojson(&box_geojson(-122.75, 48.25, -121.75, 48.75)).unwrap();

        let outcome = run(&request, Some(&boundary), Arc::new(MemoryTransport { documents })).await.unwrap();

        let path = tmp.path().join("out/2021-01-01_2021-01-03_PRISM_data.zarr");
        assert_eq!(outcome, Outcome::Written(path.clone()));
        assert!(path.join("tmax").exists());
        assert!(!request.scratch_dir.exists());
    }

    #[test]
    fn should_crop_each_raster_to_the_boundary_box() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("PRISM_tmax_20210101.zip");
        std::fs::write(&file, zipped_raster()).unwrap();
        let report = FetchReport {
            succeeded: vec![crate::catalog::RawFile {
                target: FetchTarget::new("tmax/20210101", Location::Url("x".into()), "x", t("2021-01-01"))
                    .with_variables(vec!["tmax".into()]),
                path: file,
            }],
            ..Default::default()
        };
        let boundary = Boundary::from_geojson(&box_geojson(-122.75, 47.75, -122.25, 48.75)).unwrap();
        let request = request("tmax", tmp.path());

        let outcome = assemble(&request, Some(&boundary), &report).unwrap();

        let Outcome::Written(path) = outcome else { panic!("expected a store") };
        let store = Arc::new(zarrs_filesystem::FilesystemStore::new(&path).unwrap());
        let tmax = zarrs::array::Array::open(store, "/tmax").unwrap();
        assert_eq!(tmax.shape(), &[1, 2, 1]);
    }
}
