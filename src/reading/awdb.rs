//! NRCS Air-Water Database REST responses (SNOTEL).

use std::{collections::BTreeSet, fs, path::Path};

use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::{
    dataset::{Dataset, Spatial},
    error::DecodeError,
    request::parse_timestamp,
};

const FORMAT: &str = "AWDB JSON";

/// Entry of the `/stations` listing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationMeta {
    pub station_triplet: String,
    #[serde(default)]
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub elevation: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StationData {
    station_triplet: String,
    #[serde(default)]
    data: Vec<ElementData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ElementData {
    station_element: StationElement,
    #[serde(default)]
    values: Vec<ValueRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StationElement {
    element_code: String,
    #[serde(default)]
    stored_unit_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ValueRecord {
    date: String,
    #[serde(default)]
    value: Option<f64>,
}

/// One reading of one element at one station.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub station: String,
    pub element: String,
    pub units: Option<String>,
    pub time: NaiveDateTime,
    pub value: f64,
}

pub fn read_stations(path: &Path) -> Result<Vec<StationMeta>, DecodeError> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| DecodeError::malformed(FORMAT, e.to_string()))
}

pub fn read_observations(path: &Path) -> Result<Vec<Observation>, DecodeError> {
    let text = fs::read_to_string(path)?;
    let stations: Vec<StationData> =
        serde_json::from_str(&text).map_err(|e| DecodeError::malformed(FORMAT, e.to_string()))?;

    let mut out = Vec::new();
    for station in stations {
        for element in station.data {
            for record in element.values {
                let Some(value) = record.value else { continue };
                let time = parse_timestamp(&record.date)
                    .map_err(|e| DecodeError::malformed(FORMAT, e.to_string()))?;
                out.push(Observation {
                    station: station.station_triplet.clone(),
                    element: element.station_element.element_code.clone(),
                    units: element.station_element.stored_unit_code.clone(),
                    time,
                    value,
                });
            }
        }
    }

    Ok(out)
}

/// Reshapes point series into a (time × site) dataset.
///
/// `variables` pairs each output variable name with its element code. Sites
/// follow `stations` order; observations from unknown stations are ignored.
pub fn assemble(
    stations: &[StationMeta],
    observations: &[Observation],
    variables: &[(String, String)],
) -> Result<Dataset, DecodeError> {
    let times: Vec<NaiveDateTime> = observations
        .iter()
        .map(|o| o.time)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let spatial = Spatial::Stations {
        ids: stations.iter().map(|s| s.station_triplet.clone()).collect(),
        lat: stations.iter().map(|s| s.latitude).collect(),
        lon: stations.iter().map(|s| s.longitude).collect(),
    };
    let cells = stations.len();
    let mut ds = Dataset::new(times.clone(), spatial);

    for (name, code) in variables {
        let mut values = vec![f32::NAN; times.len() * cells];
        let mut units = None;
        for o in observations.iter().filter(|o| &o.element == code) {
            let Some(site) = stations.iter().position(|s| s.station_triplet == o.station) else {
                continue;
            };
            if let Ok(t) = times.binary_search(&o.time) {
                values[t * cells + site] = o.value as f32;
                units = units.or_else(|| o.units.clone());
            }
        }
        ds.insert(name.clone(), values, units)
            .map_err(|e| DecodeError::malformed(FORMAT, e.to_string()))?;
    }

    Ok(ds)
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use tempfile::TempDir;

    use super::*;

    pub(crate) const STATIONS: &str = r#"[
        {"stationTriplet":"460:WA:SNTL","name":"Easy Pass","latitude":48.86,"longitude":-121.44,"elevation":5270},
        {"stationTriplet":"909:WA:SNTL","name":"Elbow Lake","latitude":48.69,"longitude":-121.91}
    ]"#;

    pub(crate) const DATA: &str = r#"[
        {"stationTriplet":"460:WA:SNTL","data":[
            {"stationElement":{"elementCode":"WTEQ","storedUnitCode":"in"},
             "values":[{"date":"2021-01-01 00:00","value":10.5},{"date":"2021-01-01 01:00","value":10.6}]},
            {"stationElement":{"elementCode":"TOBS","storedUnitCode":"degF"},
             "values":[{"date":"2021-01-01 00:00","value":30.0},{"date":"2021-01-01 01:00"}]}
        ]}
    ]"#;

    #[test]
    fn should_read_station_listing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stations.json");
        fs::write(&path, STATIONS).unwrap();

        let stations = read_stations(&path).unwrap();

        assert_eq!(stations.len(), 2);
        assert_eq!(stations[0].station_triplet, "460:WA:SNTL");
        assert_eq!(stations[1].elevation, None);
    }

    #[test]
    fn should_skip_missing_values() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.json");
        fs::write(&path, DATA).unwrap();

        let obs = read_observations(&path).unwrap();

        assert_eq!(obs.len(), 3);
        assert_eq!(obs[2].element, "TOBS");
    }

    #[test]
    fn should_assemble_time_by_site() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.json");
        fs::write(&path, STATIONS).unwrap();
        let stations = read_stations(&path).unwrap();
        fs::write(&path, DATA).unwrap();
        let obs = read_observations(&path).unwrap();
        let vars = vec![
            ("SWE".to_string(), "WTEQ".to_string()),
            ("AIR TEMP".to_string(), "TOBS".to_string()),
            ("SNOWDEPTH".to_string(), "SNWD".to_string()),
        ];

        let mut ds = assemble(&stations, &obs, &vars).unwrap();

        assert_eq!(ds.times.len(), 2);
        assert_eq!(ds.spatial.shape(), vec![2]);
        let swe = &ds.variables["SWE"];
        assert_eq!(swe.values[0], 10.5);
        assert!(swe.values[1].is_nan());
        assert_eq!(swe.values[2], 10.6);
        assert_eq!(swe.units.as_deref(), Some("in"));
        assert_eq!(ds.drop_empty_variables(), vec!["SNOWDEPTH".to_string()]);
    }
}
