//! NetCDF grids: ORNL/Daymet yearly files and WRF hourly output.
//!
//! Decoding needs libnetcdf and is only compiled with the `netcdf` feature.
//! Without it every file is reported as undecodable and skipped.

use chrono::{Duration, NaiveDateTime};

use crate::{error::DecodeError, request::parse_timestamp};

const FORMAT: &str = "NetCDF";

/// Converts CF `"<unit> since <epoch>"` offsets to timestamps.
pub fn cf_times(units: &str, offsets: &[f64]) -> Result<Vec<NaiveDateTime>, DecodeError> {
    let (unit, epoch) = units
        .split_once(" since ")
        .ok_or_else(|| DecodeError::malformed(FORMAT, format!("time units `{}`", units)))?;
    let epoch = epoch.trim().trim_end_matches(" UTC").trim_end_matches('Z');
    let epoch = parse_timestamp(epoch)
        .or_else(|_| parse_timestamp(epoch.split('.').next().unwrap_or(epoch)))
        .map_err(|_| DecodeError::malformed(FORMAT, format!("time epoch `{}`", epoch)))?;

    let seconds = match unit.trim().to_ascii_lowercase().as_str() {
        "days" | "day" => 86_400.0,
        "hours" | "hour" => 3_600.0,
        "minutes" | "minute" => 60.0,
        "seconds" | "second" => 1.0,
        other => return Err(DecodeError::malformed(FORMAT, format!("time unit `{}`", other))),
    };

    offsets
        .iter()
        .map(|o| {
            epoch
                .checked_add_signed(Duration::milliseconds((o * seconds * 1000.0).round() as i64))
                .ok_or_else(|| DecodeError::malformed(FORMAT, format!("time offset {}", o)))
        })
        .collect()
}

/// Cell coordinates of a WRF domain, row-major (south_north, west_east).
#[derive(Debug, Clone, PartialEq)]
pub struct WrfGrid {
    pub ny: usize,
    pub nx: usize,
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
}

/// Parses WRF `Times` strings such as `2021-01-01_00:00:00`.
pub fn wrf_time(s: &str) -> Result<NaiveDateTime, DecodeError> {
    let s = s.trim_matches(char::from(0)).trim();
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d_%H:%M:%S")
        .map_err(|_| DecodeError::malformed(FORMAT, format!("WRF time `{}`", s)))
}

/// Applies packing attributes and masks fill values.
pub fn unpack(raw: Vec<f32>, scale: Option<f32>, offset: Option<f32>, fill: &[f32]) -> Vec<f32> {
    raw.into_iter()
        .map(|v| {
            if !v.is_finite() || fill.iter().any(|f| (v - f).abs() <= f.abs() * 1e-6) {
                f32::NAN
            } else {
                v * scale.unwrap_or(1.0) + offset.unwrap_or(0.0)
            }
        })
        .collect()
}

#[cfg(feature = "netcdf")]
mod native {
    use std::path::Path;

    use super::{cf_times, unpack, wrf_time, WrfGrid, FORMAT};
    use crate::{
        dataset::{Dataset, Spatial},
        error::DecodeError,
    };

    fn open(path: &Path) -> Result<netcdf::File, DecodeError> {
        netcdf::open(path).map_err(|e| DecodeError::malformed(FORMAT, format!("{}: {}", path.display(), e)))
    }

    fn variable<'f>(file: &'f netcdf::File, names: &[&str]) -> Option<netcdf::Variable<'f>> {
        names.iter().find_map(|n| file.variable(n))
    }

    fn f32_attr(var: &netcdf::Variable, name: &str) -> Option<f32> {
        if !var.attributes().any(|a| a.name() == name) {
            return None;
        }
        f32::try_from(var.attribute_value(name)?.ok()?).ok()
    }

    fn str_attr(var: &netcdf::Variable, name: &str) -> Option<String> {
        if !var.attributes().any(|a| a.name() == name) {
            return None;
        }
        match var.attribute_value(name)?.ok()? {
            netcdf::AttributeValue::Str(s) => Some(s),
            _ => None,
        }
    }

    fn values(var: &netcdf::Variable) -> Result<Vec<f32>, DecodeError> {
        let raw: Vec<f32> = var
            .get_values::<f32, _>(..)
            .map_err(|e| DecodeError::malformed(FORMAT, format!("{}: {}", var.name(), e)))?;
        let fill: Vec<f32> = ["_FillValue", "missing_value"]
            .iter()
            .filter_map(|a| f32_attr(var, a))
            .collect();
        Ok(unpack(raw, f32_attr(var, "scale_factor"), f32_attr(var, "add_offset"), &fill))
    }

    fn f64_values(var: &netcdf::Variable) -> Result<Vec<f64>, DecodeError> {
        var.get_values::<f64, _>(..)
            .map_err(|e| DecodeError::malformed(FORMAT, format!("{}: {}", var.name(), e)))
    }

    /// A (time, lat, lon) grid holding `name`.
    pub fn read_grid(path: &Path, name: &str) -> Result<Dataset, DecodeError> {
        let file = open(path)?;
        let lat = variable(&file, &["lat", "latitude", "y"])
            .ok_or_else(|| DecodeError::Missing("latitude".to_string()))?;
        let lon = variable(&file, &["lon", "longitude", "x"])
            .ok_or_else(|| DecodeError::Missing("longitude".to_string()))?;
        let time = variable(&file, &["time"]).ok_or_else(|| DecodeError::Missing("time".to_string()))?;
        let units = str_attr(&time, "units").ok_or_else(|| DecodeError::Missing("time units".to_string()))?;

        let times = cf_times(&units, &f64_values(&time)?)?;
        let spatial = Spatial::Regular {
            lat: f64_values(&lat)?,
            lon: f64_values(&lon)?,
        };

        let data = file
            .variable(name)
            .or_else(|| file.variables().find(|v| v.dimensions().len() == 3))
            .ok_or_else(|| DecodeError::Missing(name.to_string()))?;
        let dims: Vec<String> = data.dimensions().iter().map(|d| d.name()).collect();
        if dims.first().map(String::as_str) != Some("time") {
            return Err(DecodeError::malformed(FORMAT, format!("{} has dimensions {:?}", name, dims)));
        }

        let mut ds = Dataset::new(times, spatial);
        ds.insert(name, values(&data)?, str_attr(&data, "units"))
            .map_err(|e| DecodeError::malformed(FORMAT, e.to_string()))?;
        Ok(ds)
    }

    /// (lat, lon) of every cell from a `wrfinput` file.
    pub fn read_wrf_coordinates(path: &Path) -> Result<WrfGrid, DecodeError> {
        let file = open(path)?;
        let xlat = file.variable("XLAT").ok_or_else(|| DecodeError::Missing("XLAT".to_string()))?;
        let xlong = file.variable("XLONG").ok_or_else(|| DecodeError::Missing("XLONG".to_string()))?;
        let dims = xlat.dimensions();
        if dims.len() != 3 {
            return Err(DecodeError::malformed(FORMAT, "XLAT is not (Time, south_north, west_east)"));
        }
        let (ny, nx) = (dims[1].len(), dims[2].len());

        // first time step only
        let lat: Vec<f64> = f64_values(&xlat)?.into_iter().take(ny * nx).collect();
        let lon: Vec<f64> = f64_values(&xlong)?.into_iter().take(ny * nx).collect();
        Ok(WrfGrid { ny, nx, lat, lon })
    }

    /// Every (Time, south_north, west_east) field of a WRF output file.
    pub fn read_wrf(path: &Path, coords: &WrfGrid) -> Result<Dataset, DecodeError> {
        let file = open(path)?;
        let WrfGrid { ny, nx, lat, lon } = coords;

        let times_var = file.variable("Times").ok_or_else(|| DecodeError::Missing("Times".to_string()))?;
        let width = times_var.dimensions().get(1).map(|d| d.len()).unwrap_or(19).max(1);
        let raw = times_var
            .get_raw_values(..)
            .map_err(|e| DecodeError::malformed(FORMAT, e.to_string()))?;
        let times = raw
            .chunks(width)
            .map(|c| wrf_time(&String::from_utf8_lossy(c)))
            .collect::<Result<Vec<_>, _>>()?;

        let spatial = Spatial::Curvilinear {
            ny: *ny,
            nx: *nx,
            lat: lat.clone(),
            lon: lon.clone(),
        };
        let mut ds = Dataset::new(times, spatial);

        for var in file.variables() {
            let dims: Vec<String> = var.dimensions().iter().map(|d| d.name()).collect();
            if dims != ["Time", "south_north", "west_east"] || matches!(var.name().as_str(), "XLAT" | "XLONG") {
                continue;
            }
            let sizes_match = var.dimensions()[1].len() == *ny && var.dimensions()[2].len() == *nx;
            if !sizes_match {
                continue;
            }
            ds.insert(var.name(), values(&var)?, str_attr(&var, "units"))
                .map_err(|e| DecodeError::malformed(FORMAT, e.to_string()))?;
        }

        Ok(ds)
    }
}

#[cfg(feature = "netcdf")]
pub use native::{read_grid, read_wrf, read_wrf_coordinates};

/// Fails when this build cannot decode NetCDF, so callers can stop before downloading.
pub fn ensure_supported() -> Result<(), DecodeError> {
    if cfg!(feature = "netcdf") {
        Ok(())
    } else {
        Err(DecodeError::Unsupported(FORMAT))
    }
}

#[cfg(not(feature = "netcdf"))]
mod disabled {
    use std::path::Path;

    use super::WrfGrid;
    use crate::{dataset::Dataset, error::DecodeError};

    pub fn read_grid(_path: &Path, _name: &str) -> Result<Dataset, DecodeError> {
        Err(DecodeError::Unsupported(super::FORMAT))
    }

    pub fn read_wrf_coordinates(_path: &Path) -> Result<WrfGrid, DecodeError> {
        Err(DecodeError::Unsupported(super::FORMAT))
    }

    pub fn read_wrf(_path: &Path, _coords: &WrfGrid) -> Result<Dataset, DecodeError> {
        Err(DecodeError::Unsupported(super::FORMAT))
    }
}

#[cfg(not(feature = "netcdf"))]
pub use disabled::{read_grid, read_wrf, read_wrf_coordinates};
