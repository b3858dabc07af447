//! GRIB2 forecast files and their `.idx` side-car indexes.
//!
//! Grid geometry is read straight from section 3; values are unpacked by the
//! `grib` crate.

use std::{fs::File, io::BufReader, path::Path};

use chrono::NaiveDateTime;
use regex::Regex;
use tracing::warn;

use super::lambert::LambertConformal;
use crate::{
    dataset::{horizon::Field, Dataset, Spatial},
    error::DecodeError,
};

const FORMAT: &str = "GRIB2";
const DEFAULT_EARTH_RADIUS: f64 = 6371229.0;

/// One line of a wgrib2-style inventory.
#[derive(Debug, Clone, PartialEq)]
pub struct IdxEntry {
    pub number: u32,
    pub offset: u64,
    /// Last byte of the message, `None` for the final message.
    pub end: Option<u64>,
    pub variable: String,
    pub level: String,
    pub forecast: String,
}

impl IdxEntry {
    /// `VAR:LEVEL:FORECAST`, the text searched by parameter patterns.
    pub fn descriptor(&self) -> String {
        format!("{}:{}:{}", self.variable, self.level, self.forecast)
    }
}

/// Parses `n:offset:d=YYYYMMDDHH:VAR:LEVEL:FORECAST:` lines.
pub fn parse_idx(text: &str) -> Result<Vec<IdxEntry>, DecodeError> {
    let mut entries: Vec<IdxEntry> = Vec::new();

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() < 6 {
            return Err(DecodeError::malformed("idx", format!("short line `{}`", line)));
        }
        let number = parts[0]
            .trim()
            .parse()
            .map_err(|_| DecodeError::malformed("idx", format!("bad message number `{}`", line)))?;
        let offset = parts[1]
            .trim()
            .parse()
            .map_err(|_| DecodeError::malformed("idx", format!("bad offset `{}`", line)))?;

        entries.push(IdxEntry {
            number,
            offset,
            end: None,
            variable: parts[3].to_string(),
            level: parts[4].to_string(),
            forecast: parts[5].to_string(),
        });
    }

    for i in 1..entries.len() {
        let next = entries[i].offset;
        entries[i - 1].end = Some(next.saturating_sub(1));
    }

    Ok(entries)
}

/// Builds the inventory search for `params`.
///
/// `VAR` and `VAR:LEVEL` are literal and match the start of a descriptor.
/// A parameter starting with `:` is a regex searched anywhere in
/// `:VAR:LEVEL:FORECAST:`, so `:APCP:.*acc` picks accumulations only.
pub fn search_pattern(params: &[String]) -> Result<Regex, regex::Error> {
    let (raw, literal): (Vec<&str>, Vec<&str>) =
        params.iter().map(|p| p.trim()).partition(|p| p.starts_with(':'));

    let mut alternatives: Vec<String> = raw.iter().map(|p| format!("(?:{})", p)).collect();
    if !literal.is_empty() {
        let escaped: Vec<String> = literal.iter().map(|p| regex::escape(p)).collect();
        alternatives.insert(0, format!("(?:^:(?:{}):)", escaped.join("|")));
    }
    Regex::new(&alternatives.join("|"))
}

pub fn select<'a>(entries: &'a [IdxEntry], pattern: &Regex) -> Vec<&'a IdxEntry> {
    entries
        .iter()
        .filter(|e| pattern.is_match(&format!(":{}:", e.descriptor())))
        .collect()
}

/// Byte ranges covering the selected messages, adjacent messages joined.
pub fn byte_ranges(selected: &[&IdxEntry]) -> Vec<(u64, Option<u64>)> {
    let mut ranges: Vec<(u64, Option<u64>)> = Vec::new();
    for entry in selected {
        match ranges.last_mut() {
            Some((_, Some(end))) if *end + 1 == entry.offset => *end = entry.end.unwrap_or(*end),
            _ => ranges.push((entry.offset, entry.end)),
        }
        if let Some(last) = ranges.last_mut() {
            if entry.end.is_none() {
                last.1 = None;
            }
        }
    }
    ranges
}

/// Turns `VAR:LEVEL:FORECAST` into a field named like `tmp_2_m_above_ground`.
pub fn field(descriptor: &str) -> Field {
    let mut parts = descriptor.splitn(3, ':');
    let variable = parts.next().unwrap_or_default();
    let level = parts.next().unwrap_or_default();
    let forecast = parts.next().unwrap_or_default();

    Field {
        name: snake(&format!("{} {}", variable, level)),
        accumulated: forecast.contains("acc"),
    }
}

/// Fields of one file in message order, with repeated names made unique.
///
/// A repeat takes its forecast as a suffix (`apcp_surface_0_1_hour_acc_fcst`),
/// then a message counter if that is still taken.
pub fn fields(descriptors: &[String]) -> Vec<Field> {
    let mut out: Vec<Field> = Vec::with_capacity(descriptors.len());
    for (i, descriptor) in descriptors.iter().enumerate() {
        let mut f = field(descriptor);
        let taken = |name: &str, out: &[Field]| out.iter().any(|o| o.name == name);
        if taken(&f.name, &out) {
            let forecast = descriptor.splitn(3, ':').nth(2).unwrap_or_default();
            let mut name = snake(&format!("{} {}", f.name, forecast));
            if taken(&name, &out) {
                name = format!("{}_{}", name, i + 1);
            }
            warn!("{} repeats {} in one file, stored as {}", descriptor, f.name, name);
            f.name = name;
        }
        out.push(f);
    }
    out
}

fn snake(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// Geometry of a message from section 3.
#[derive(Debug, Clone, PartialEq)]
pub enum GridDefinition {
    LatLon {
        ni: usize,
        nj: usize,
        la1: f64,
        lo1: f64,
        di: f64,
        dj: f64,
    },
    Lambert {
        nx: usize,
        ny: usize,
        projection: LambertConformal,
    },
}

impl GridDefinition {
    pub fn parse(section: &[u8]) -> Result<Self, DecodeError> {
        if section.len() < 14 {
            return Err(DecodeError::malformed(FORMAT, "section 3 too short"));
        }
        let template = u16::from_be_bytes([section[12], section[13]]);
        let gd = &section[14..];

        match template {
            0 => {
                need(gd, 58)?;
                let scanning = gd[57];
                let sign_i = if scanning & 0x80 != 0 { -1.0 } else { 1.0 };
                let sign_j = if scanning & 0x40 != 0 { 1.0 } else { -1.0 };
                Ok(GridDefinition::LatLon {
                    ni: be_u32(gd, 16) as usize,
                    nj: be_u32(gd, 20) as usize,
                    la1: micro(be_i32(gd, 32)),
                    lo1: micro(be_u32(gd, 36) as i64),
                    di: sign_i * micro(be_u32(gd, 49) as i64),
                    dj: sign_j * micro(be_u32(gd, 53) as i64),
                })
            }
            30 => {
                need(gd, 59)?;
                let scanning = gd[50];
                let sign_i = if scanning & 0x80 != 0 { -1.0 } else { 1.0 };
                let sign_j = if scanning & 0x40 != 0 { 1.0 } else { -1.0 };
                let nx = be_u32(gd, 16) as usize;
                let ny = be_u32(gd, 20) as usize;
                let projection = LambertConformal::new(
                    micro(be_i32(gd, 24)),
                    micro(be_u32(gd, 28) as i64),
                    micro(be_u32(gd, 37) as i64),
                    micro(be_i32(gd, 51)),
                    micro(be_i32(gd, 55)),
                    sign_i * be_u32(gd, 41) as f64 / 1000.0,
                    sign_j * be_u32(gd, 45) as f64 / 1000.0,
                    earth_radius(gd),
                );
                Ok(GridDefinition::Lambert { nx, ny, projection })
            }
            other => Err(DecodeError::malformed(
                FORMAT,
                format!("unsupported grid template 3.{}", other),
            )),
        }
    }

    pub fn points(&self) -> usize {
        match self {
            GridDefinition::LatLon { ni, nj, .. } => ni * nj,
            GridDefinition::Lambert { nx, ny, .. } => nx * ny,
        }
    }

    /// Coordinates of every point in scan order.
    pub fn spatial(&self) -> Spatial {
        match self {
            GridDefinition::LatLon { ni, nj, la1, lo1, di, dj, .. } => Spatial::Regular {
                lat: (0..*nj).map(|j| la1 + j as f64 * dj).collect(),
                lon: (0..*ni).map(|i| lo1 + i as f64 * di).collect(),
            },
            GridDefinition::Lambert { nx, ny, projection } => {
                let mut lat = Vec::with_capacity(nx * ny);
                let mut lon = Vec::with_capacity(nx * ny);
                for j in 0..*ny {
                    for i in 0..*nx {
                        let (la, lo) = projection.grid_to_geo(i as f64, j as f64);
                        lat.push(la);
                        lon.push(lo);
                    }
                }
                Spatial::Curvilinear { ny: *ny, nx: *nx, lat, lon }
            }
        }
    }
}

fn need(gd: &[u8], len: usize) -> Result<(), DecodeError> {
    if gd.len() < len {
        Err(DecodeError::malformed(FORMAT, "grid template truncated"))
    } else {
        Ok(())
    }
}

fn be_u32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

// GRIB2 signed integers are sign-magnitude.
fn be_i32(b: &[u8], at: usize) -> i64 {
    let raw = be_u32(b, at);
    let magnitude = (raw & 0x7fff_ffff) as i64;
    if raw & 0x8000_0000 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

fn micro(v: i64) -> f64 {
    v as f64 / 1e6
}

fn earth_radius(gd: &[u8]) -> f64 {
    match gd[0] {
        1 => {
            let scale = gd[1] as i32;
            be_u32(gd, 2) as f64 / 10f64.powi(scale)
        }
        _ => DEFAULT_EARTH_RADIUS,
    }
}

/// Section 3 of every message in a (possibly concatenated) GRIB2 file.
pub fn grid_sections(bytes: &[u8]) -> Result<Vec<&[u8]>, DecodeError> {
    let mut grids = Vec::new();
    let mut pos = 0;

    while pos + 16 <= bytes.len() {
        if &bytes[pos..pos + 4] != b"GRIB" {
            return Err(DecodeError::malformed(FORMAT, format!("no message at byte {}", pos)));
        }
        if bytes[pos + 7] != 2 {
            return Err(DecodeError::malformed(FORMAT, "only edition 2 is supported"));
        }
        let total = u64::from_be_bytes(
            bytes[pos + 8..pos + 16]
                .try_into()
                .map_err(|_| DecodeError::malformed(FORMAT, "bad length"))?,
        ) as usize;
        let end = pos + total;
        if total < 20 || end > bytes.len() {
            return Err(DecodeError::malformed(FORMAT, "message truncated"));
        }

        let mut at = pos + 16;
        let mut grid = None;
        while at + 5 <= end && &bytes[at..at + 4] != b"7777" {
            let len = be_u32(bytes, at) as usize;
            if len < 5 || at + len > end {
                return Err(DecodeError::malformed(FORMAT, "bad section length"));
            }
            if bytes[at + 4] == 3 {
                grid = Some(&bytes[at..at + len]);
            }
            at += len;
        }
        grids.push(grid.ok_or_else(|| DecodeError::Missing("grid definition section".to_string()))?);
        pos = end;
    }

    Ok(grids)
}

/// Reads every message of `path` into one dataset at `time`.
///
/// `descriptors` names the messages in file order.
pub fn read(path: &Path, time: NaiveDateTime, descriptors: &[String]) -> Result<Dataset, DecodeError> {
    let bytes = std::fs::read(path)?;
    let grids = grid_sections(&bytes)?;
    if grids.len() != descriptors.len() {
        return Err(DecodeError::malformed(
            FORMAT,
            format!("{} messages for {} fields", grids.len(), descriptors.len()),
        ));
    }
    let first = grids
        .first()
        .ok_or_else(|| DecodeError::Missing("GRIB2 messages".to_string()))?;
    let grid = GridDefinition::parse(first)?;
    if grids.iter().any(|g| g != first) {
        return Err(DecodeError::malformed(FORMAT, "messages use different grids"));
    }

    let grib2 = grib::from_reader(BufReader::new(File::open(path)?))
        .map_err(|e| DecodeError::malformed(FORMAT, e.to_string()))?;

    let mut ds = Dataset::new(vec![time], grid.spatial());
    let names = fields(descriptors);
    for (((_, submsg), descriptor), f) in grib2.iter().zip(descriptors).zip(names) {
        let decoder = grib::Grib2SubmessageDecoder::from(submsg)
            .map_err(|e| DecodeError::malformed(FORMAT, e.to_string()))?;
        let values: Vec<f32> = decoder
            .dispatch()
            .map_err(|e| DecodeError::malformed(FORMAT, e.to_string()))?
            .collect();
        if values.len() != grid.points() {
            return Err(DecodeError::malformed(
                FORMAT,
                format!("{} has {} values for {} points", descriptor, values.len(), grid.points()),
            ));
        }
        ds.insert(f.name, values, None)
            .map_err(|e| DecodeError::malformed(FORMAT, e.to_string()))?;
    }

    Ok(ds)
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const IDX: &str = "\
1:0:d=2021010100:REFC:entire atmosphere:anl:
2:1000:d=2021010100:TMP:2 m above ground:anl:
3:2500:d=2021010100:RH:2 m above ground:anl:
4:4000:d=2021010100:APCP:surface:0-1 hour acc fcst:
5:6000:d=2021010100:TMP:500 mb:anl:
";

    #[test]
    fn should_parse_idx_with_message_ends() {
        let entries = parse_idx(IDX).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[1].variable, "TMP");
        assert_eq!(entries[1].level, "2 m above ground");
        assert_eq!(entries[1].end, Some(2499));
        assert_eq!(entries[4].end, None);
        assert!(parse_idx("garbage").is_err());
    }

    #[test]
    fn should_select_by_variable_and_level() {
        let entries = parse_idx(IDX).unwrap();
        let pattern = search_pattern(&["TMP:2 m above ground".into(), "APCP".into()]).unwrap();

        let selected = select(&entries, &pattern);

        let numbers: Vec<u32> = selected.iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![2, 4]);
    }

    #[test]
    fn should_search_with_raw_patterns() {
        let entries = parse_idx(IDX).unwrap();

        let pattern = search_pattern(&[":APCP:.*acc".into(), "TMP:2 m above ground".into()]).unwrap();
        let numbers: Vec<u32> = select(&entries, &pattern).iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![2, 4]);

        let pattern = search_pattern(&[":anl:".into()]).unwrap();
        let numbers: Vec<u32> = select(&entries, &pattern).iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 5]);
    }

    #[test]
    fn should_join_adjacent_ranges() {
        let entries = parse_idx(IDX).unwrap();
        let picked = vec![&entries[1], &entries[2], &entries[4]];
        assert_eq!(byte_ranges(&picked), vec![(1000, Some(3999)), (6000, None)]);
    }

    #[test]
    fn should_name_fields() {
        let f = field("TMP:2 m above ground:anl");
        assert_eq!(f.name, "tmp_2_m_above_ground");
        assert!(!f.accumulated);
        let f = field("APCP:surface:0-1 hour acc fcst");
        assert_eq!(f.name, "apcp_surface");
        assert!(f.accumulated);
    }

    #[test]
    fn should_keep_repeated_fields_apart() {
        let descriptors: Vec<String> = [
            "APCP:surface:0-1 hour acc fcst",
            "APCP:surface:0-1 hour acc fcst",
            "TMP:2 m above ground:anl",
            "APCP:surface:0-15 min acc fcst",
        ]
        .iter()
        .map(|d| d.to_string())
        .collect();

        let names: Vec<String> = fields(&descriptors).into_iter().map(|f| f.name).collect();

        assert_eq!(
            names,
            vec![
                "apcp_surface",
                "apcp_surface_0_1_hour_acc_fcst",
                "tmp_2_m_above_ground",
                "apcp_surface_0_15_min_acc_fcst",
            ]
        );
    }

    fn lambert_section() -> Vec<u8> {
        let mut s = vec![0u8; 14 + 59];
        s[0..4].copy_from_slice(&(73u32).to_be_bytes());
        s[4] = 3;
        s[12..14].copy_from_slice(&30u16.to_be_bytes());
        let gd = &mut s[14..];
        gd[0] = 6;
        gd[16..20].copy_from_slice(&1799u32.to_be_bytes());
        gd[20..24].copy_from_slice(&1059u32.to_be_bytes());
        gd[24..28].copy_from_slice(&21_138_123u32.to_be_bytes());
        gd[28..32].copy_from_slice(&237_280_472u32.to_be_bytes());
        gd[33..37].copy_from_slice(&38_500_000u32.to_be_bytes());
        gd[37..41].copy_from_slice(&262_500_000u32.to_be_bytes());
        gd[41..45].copy_from_slice(&3_000_000u32.to_be_bytes());
        gd[45..49].copy_from_slice(&3_000_000u32.to_be_bytes());
        gd[50] = 0x40;
        gd[51..55].copy_from_slice(&38_500_000u32.to_be_bytes());
        gd[55..59].copy_from_slice(&38_500_000u32.to_be_bytes());
        s
    }

    #[test]
    fn should_parse_lambert_template() {
        let grid = GridDefinition::parse(&lambert_section()).unwrap();

        let GridDefinition::Lambert { nx, ny, projection } = &grid else {
            panic!("expected Lambert grid")
        };
        assert_eq!((*nx, *ny), (1799, 1059));
        let (lat, lon) = projection.grid_to_geo(0.0, 0.0);
        assert!((lat - 21.138123).abs() < 1e-6);
        assert!((lon - 237.280472).abs() < 1e-6);
        assert_eq!(grid.points(), 1799 * 1059);
    }

    #[test]
    fn should_read_sign_magnitude_latitudes() {
        let mut s = vec![0u8; 14 + 58];
        s[12..14].copy_from_slice(&0u16.to_be_bytes());
        let gd = &mut s[14..];
        gd[16..20].copy_from_slice(&3u32.to_be_bytes());
        gd[20..24].copy_from_slice(&2u32.to_be_bytes());
        gd[32..36].copy_from_slice(&(0x8000_0000u32 | 10_000_000).to_be_bytes());
        gd[36..40].copy_from_slice(&350_000_000u32.to_be_bytes());
        gd[49..53].copy_from_slice(&1_000_000u32.to_be_bytes());
        gd[53..57].copy_from_slice(&500_000u32.to_be_bytes());
        gd[57] = 0x40;

        let grid = GridDefinition::parse(&s).unwrap();

        let Spatial::Regular { lat, lon } = grid.spatial() else { panic!("expected regular grid") };
        assert_eq!(lat, vec![-10.0, -9.5]);
        assert_eq!(lon, vec![350.0, 351.0, 352.0]);
    }

    #[test]
    fn should_walk_concatenated_messages() {
        fn message(grid: &[u8]) -> Vec<u8> {
            let total = 16 + grid.len() + 4;
            let mut m = b"GRIB".to_vec();
            m.extend([0, 0, 0, 2]);
            m.extend((total as u64).to_be_bytes());
            m.extend(grid);
            m.extend(b"7777");
            m
        }
        let grid = lambert_section();
        let mut bytes = message(&grid);
        bytes.extend(message(&grid));

        let sections = grid_sections(&bytes).unwrap();

        assert_eq!(sections.len(), 2);
        assert_eq!(sections[1], grid.as_slice());
        assert!(grid_sections(&bytes[..30]).is_err());
    }
}
