//! SNOTEL station series from the NRCS Air-Water Database REST service.

use std::{path::Path, sync::Arc};

use anyhow::{anyhow, Result};
use chrono::{NaiveDate, NaiveDateTime};
use clap::Args;
use tracing::{info, warn};

use crate::{
    catalog::{FetchTarget, Location},
    cli::CommonArgs,
    download::{FetchReport, Fetcher, HttpTransport, Transport},
    error::ValidationError,
    geo::Boundary,
    persist,
    pipeline::{self, Outcome},
    reading::awdb::{self, StationMeta},
    request::{choose, Frequency, Request},
};

pub const WORKERS: usize = 5;
const BASE_URL: &str = "https://wcc.sc.egov.usda.gov/awdbRestApi/services/v1";
const ALL_SNOTEL_STATIONS: &str = "*:*:SNTL";
pub const NO_DATA: &str = "No variable data found for the given stations on given dates. Exiting...";

/// Variable names accepted on the command line and their AWDB element codes.
pub const ELEMENTS: &[(&str, &str)] = &[
    ("SNOWDEPTH", "SNWD"),
    ("SWE", "WTEQ"),
    ("PRECIPITATION", "PRCP"),
    ("ACCUMULATED PRECIPITATION", "PREC"),
    ("AIR TEMP", "TOBS"),
    ("AVG AIR TEMP", "TAVG"),
    ("MAX AIR TEMP", "TMAX"),
    ("MIN AIR TEMP", "TMIN"),
    ("RELATIVE HUMIDITY", "RHUM"),
];
const VARIABLES: &[&str] = &[
    "SNOWDEPTH",
    "SWE",
    "PRECIPITATION",
    "ACCUMULATED PRECIPITATION",
    "AIR TEMP",
    "AVG AIR TEMP",
    "MAX AIR TEMP",
    "MIN AIR TEMP",
    "RELATIVE HUMIDITY",
];
// stations rarely report humidity
const DEFAULT_VARIABLES: &[&str] = &[
    "SNOWDEPTH",
    "SWE",
    "PRECIPITATION",
    "ACCUMULATED PRECIPITATION",
    "AIR TEMP",
    "AVG AIR TEMP",
    "MAX AIR TEMP",
    "MIN AIR TEMP",
];

#[derive(Args, Debug, Clone)]
pub struct SnotelArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Comma separated station triplets, e.g. 460:WA:SNTL; replaces the boundary search
    #[arg(long)]
    pub station_ids: Option<String>,

    /// hourly or daily
    #[arg(long, default_value = "hourly")]
    pub frequency: String,
}

pub fn element_code(variable: &str) -> Option<&'static str> {
    ELEMENTS.iter().find(|(name, _)| *name == variable).map(|(_, code)| *code)
}

fn duration(frequency: Frequency) -> &'static str {
    match frequency {
        Frequency::Daily => "DAILY",
        _ => "HOURLY",
    }
}

pub async fn snotel(args: SnotelArgs) -> Result<Outcome> {
    let frequency = match choose(Some(args.frequency.as_str()), &["hourly", "daily"], "hourly", "frequency") {
        "daily" => Frequency::Daily,
        _ => Frequency::Hourly,
    };
    let request = match args.common.request("Snotel", frequency, VARIABLES, DEFAULT_VARIABLES) {
        Ok(r) => r,
        Err(e) => return Ok(e.into()),
    };
    if let Err(e) = check_output_dir(&request.output_dir) {
        return Ok(e.into());
    }

    let station_ids = parse_station_ids(args.station_ids.as_deref());
    let boundary = if station_ids.is_some() {
        None
    } else {
        match request.boundary.as_deref().map(Boundary::load).transpose() {
            Ok(b) => b,
            Err(e) => return Ok(e.into()),
        }
    };

    run(&request, station_ids, boundary.as_ref(), Arc::new(HttpTransport::new()?)).await
}

fn check_output_dir(dir: &Path) -> Result<(), ValidationError> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(ValidationError::MissingOutputDir(dir.display().to_string()))
    }
}

fn parse_station_ids(raw: Option<&str>) -> Option<Vec<String>> {
    let ids: Vec<String> = raw?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    Some(ids)
}

/// Keeps the stations inside `boundary`, bounding box first.
pub fn stations_within(stations: Vec<StationMeta>, boundary: &Boundary) -> Vec<StationMeta> {
    let bbox = boundary.bbox();
    stations
        .into_iter()
        .filter(|s| bbox.contains(s.longitude, s.latitude))
        .filter(|s| boundary.contains(s.longitude, s.latitude))
        .collect()
}

/// Slices of the range falling in each calendar year.
fn year_slices(request: &Request) -> Vec<(NaiveDateTime, NaiveDateTime)> {
    request
        .range
        .years()
        .filter_map(|year| {
            let first = NaiveDate::from_ymd_opt(year, 1, 1)?.and_hms_opt(0, 0, 0)?;
            let last = NaiveDate::from_ymd_opt(year, 12, 31)?.and_hms_opt(23, 59, 59)?;
            Some((first.max(request.range.start), last.min(request.range.end)))
        })
        .collect()
}

fn stations_target(ids: Option<&[String]>, time: NaiveDateTime) -> FetchTarget {
    let triplets = ids.map(|ids| ids.join(",")).unwrap_or_else(|| ALL_SNOTEL_STATIONS.to_string());
    FetchTarget::new(
        "stations",
        Location::Url(format!("{}/stations?stationTriplets={}&activeOnly=true", BASE_URL, triplets)),
        "SNOTEL_stations.json",
        time,
    )
}

/// One query per (station, variable, calendar year).
pub fn catalog(request: &Request, stations: &[StationMeta]) -> Vec<FetchTarget> {
    let stamp = |t: &NaiveDateTime| t.format("%Y-%m-%d%%20%H:%M").to_string();
    let slices = year_slices(request);

    let mut targets = Vec::new();
    for station in stations {
        let triplet = &station.station_triplet;
        for variable in &request.variables {
            let Some(code) = element_code(variable) else { continue };
            for (begin, end) in &slices {
                let url = format!(
                    "{}/data?stationTriplets={}&elements={}&duration={}&beginDate={}&endDate={}",
                    BASE_URL,
                    triplet,
                    code,
                    duration(request.frequency),
                    stamp(begin),
                    stamp(end)
                );
                let year = begin.format("%Y");
                targets.push(
                    FetchTarget::new(
                        format!("{}/{}/{}", triplet, code, year),
                        Location::Url(url),
                        format!("SNOTEL_{}_{}_{}.json", triplet.replace(':', "_"), code, year),
                        *begin,
                    )
                    .with_variables(vec![variable.clone()]),
                );
            }
        }
    }

    targets
}

async fn run(
    request: &Request,
    station_ids: Option<Vec<String>>,
    boundary: Option<&Boundary>,
    transport: Arc<dyn Transport>,
) -> Result<Outcome> {
    if station_ids.as_ref().is_some_and(|ids| ids.is_empty()) {
        return Ok(Outcome::Skipped("No station IDs provided. Exiting...".to_string()));
    }

    let fetcher = Fetcher::new(transport, WORKERS, &request.scratch_dir);
    let listing = pipeline::fetch(&fetcher, vec![stations_target(station_ids.as_deref(), request.range.start)]).await?;
    let stations = match listing.succeeded.first() {
        Some(file) => awdb::read_stations(&file.path).map_err(|e| anyhow!("station listing: {}", e)),
        None => Err(anyhow!("could not download the station listing")),
    };
    let stations = match stations {
        Ok(s) => s,
        Err(e) => {
            persist::cleanup(&listing.paths(), &request.scratch_dir);
            return Err(e);
        }
    };

    let stations = match (&station_ids, boundary) {
        (Some(ids), _) => {
            let found: Vec<StationMeta> = ids
                .iter()
                .filter_map(|id| {
                    let s = stations.iter().find(|s| &s.station_triplet == id);
                    if s.is_none() {
                        warn!("{} is not a known station. Skipping...", id);
                    }
                    s.cloned()
                })
                .collect();
            found
        }
        (None, Some(boundary)) => stations_within(stations, boundary),
        (None, None) => stations,
    };
    info!(stations = stations.len(), "SNOTEL stations selected");

    let targets = catalog(request, &stations);
    let report = pipeline::fetch(&fetcher, targets).await?;
    let outcome = assemble(request, &stations, boundary, &report);
    persist::cleanup(&[listing.paths(), report.paths()].concat(), &request.scratch_dir);

    outcome
}

fn assemble(
    request: &Request,
    stations: &[StationMeta],
    boundary: Option<&Boundary>,
    report: &FetchReport,
) -> Result<Outcome> {
    let observations: Vec<awdb::Observation> = pipeline::decode_each(&report.succeeded, |f| awdb::read_observations(&f.path))
        .into_iter()
        .flat_map(|(_, obs)| obs)
        .collect();
    if stations.is_empty() || observations.is_empty() {
        return Ok(Outcome::Skipped(NO_DATA.to_string()));
    }

    let variables: Vec<(String, String)> = request
        .variables
        .iter()
        .filter_map(|v| element_code(v).map(|code| (v.clone(), code.to_string())))
        .collect();
    let mut ds = awdb::assemble(stations, &observations, &variables)?.floor_times(request.frequency);
    for name in ds.drop_empty_variables() {
        info!("{} has no data at the selected stations", name);
    }
    if ds.is_empty() {
        return Ok(Outcome::Skipped(NO_DATA.to_string()));
    }

    ds.attrs.insert("source".into(), "SNOTEL".into());
    ds.attrs.insert("frequency".into(), request.frequency.label().into());
    ds.attrs.insert("start".into(), request.range.start_label.clone());
    ds.attrs.insert("end".into(), request.range.end_label.clone());

    let source = format!("SNOTEL_{}", request.frequency.label());
    let path = persist::store_path(&request.output_dir, &request.range, None, &source, request.format);
    pipeline::save(ds, boundary, &path, request.format)
}

// -- Tests -------------------------------------------------------------------
