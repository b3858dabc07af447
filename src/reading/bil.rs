//! Band-interleaved rasters (`.bil` + `.hdr`) shipped inside zip archives.

use std::{collections::HashMap, fs::File, io::Read, path::Path};

use chrono::NaiveDateTime;
use zip::ZipArchive;

use crate::{
    dataset::{Dataset, Spatial},
    error::DecodeError,
};

const FORMAT: &str = "BIL";

/// ESRI raster header.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub nrows: usize,
    pub ncols: usize,
    pub nbits: u32,
    pub pixel_type: String,
    pub big_endian: bool,
    pub ulx: f64,
    pub uly: f64,
    pub xdim: f64,
    pub ydim: f64,
    pub nodata: Option<f64>,
}

impl Header {
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        let keys: HashMap<String, String> = text
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                Some((parts.next()?.to_ascii_uppercase(), parts.next()?.to_string()))
            })
            .collect();

        let get = |k: &str| -> Result<&String, DecodeError> {
            keys.get(k).ok_or_else(|| DecodeError::Missing(format!("{} in header", k)))
        };
        fn num<T: std::str::FromStr>(k: &str, v: &str) -> Result<T, DecodeError> {
            v.parse()
                .map_err(|_| DecodeError::malformed(FORMAT, format!("{} = {}", k, v)))
        }

        let nbands: usize = keys.get("NBANDS").map(|v| num("NBANDS", v)).transpose()?.unwrap_or(1);
        if nbands != 1 {
            return Err(DecodeError::malformed(FORMAT, format!("{} bands", nbands)));
        }

        Ok(Header {
            nrows: num("NROWS", get("NROWS")?)?,
            ncols: num("NCOLS", get("NCOLS")?)?,
            nbits: keys.get("NBITS").map(|v| num("NBITS", v)).transpose()?.unwrap_or(8),
            pixel_type: keys
                .get("PIXELTYPE")
                .map(|s| s.to_ascii_uppercase())
                .unwrap_or_else(|| "UNSIGNEDINT".to_string()),
            big_endian: keys
                .get("BYTEORDER")
                .map(|s| s.eq_ignore_ascii_case("M"))
                .unwrap_or(false),
            ulx: num("ULXMAP", get("ULXMAP")?)?,
            uly: num("ULYMAP", get("ULYMAP")?)?,
            xdim: num("XDIM", get("XDIM")?)?,
            ydim: num("YDIM", get("YDIM")?)?,
            nodata: keys.get("NODATA").map(|v| num("NODATA", v)).transpose()?,
        })
    }

    /// Cell-centre coordinates, north to south.
    pub fn spatial(&self) -> Spatial {
        Spatial::Regular {
            lat: (0..self.nrows).map(|i| self.uly - i as f64 * self.ydim).collect(),
            lon: (0..self.ncols).map(|j| self.ulx + j as f64 * self.xdim).collect(),
        }
    }

    pub fn decode(&self, raw: &[u8]) -> Result<Vec<f32>, DecodeError> {
        let width = (self.nbits / 8) as usize;
        let expected = self.nrows * self.ncols * width;
        if width == 0 || raw.len() < expected {
            return Err(DecodeError::malformed(
                FORMAT,
                format!("{} bytes for {} cells", raw.len(), self.nrows * self.ncols),
            ));
        }

        let be = self.big_endian;
        let values = raw[..expected].chunks_exact(width).map(|c| -> Result<f64, DecodeError> {
            Ok(match (self.pixel_type.as_str(), width) {
                ("FLOAT", 4) => {
                    let b = [c[0], c[1], c[2], c[3]];
                    (if be { f32::from_be_bytes(b) } else { f32::from_le_bytes(b) }) as f64
                }
                ("SIGNEDINT", 2) => {
                    let b = [c[0], c[1]];
                    (if be { i16::from_be_bytes(b) } else { i16::from_le_bytes(b) }) as f64
                }
                (_, 2) => {
                    let b = [c[0], c[1]];
                    (if be { u16::from_be_bytes(b) } else { u16::from_le_bytes(b) }) as f64
                }
                (_, 1) => c[0] as f64,
                (kind, w) => {
                    return Err(DecodeError::malformed(
                        FORMAT,
                        format!("unsupported pixel type {} ({} bytes)", kind, w),
                    ))
                }
            })
        });

        values
            .map(|v| {
                v.map(|v| match self.nodata {
                    Some(nd) if (v - nd).abs() < 1e-6 => f32::NAN,
                    _ => v as f32,
                })
            })
            .collect()
    }
}

/// Reads the single raster in `path` as `variable` at `time`.
pub fn read_zip(path: &Path, variable: &str, time: NaiveDateTime) -> Result<Dataset, DecodeError> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| DecodeError::malformed("zip", e.to_string()))?;

    let mut header = None;
    let mut raster = None;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| DecodeError::malformed("zip", e.to_string()))?;
        let name = entry.name().to_ascii_lowercase();
        if name.ends_with(".hdr") {
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            header = Some(Header::parse(&text)?);
        } else if name.ends_with(".bil") {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            raster = Some(bytes);
        }
    }

    let header = header.ok_or_else(|| DecodeError::Missing(".hdr entry".to_string()))?;
    let raster = raster.ok_or_else(|| DecodeError::Missing(".bil entry".to_string()))?;

    let mut ds = Dataset::new(vec![time], header.spatial());
    ds.insert(variable, header.decode(&raster)?, None)
        .map_err(|e| DecodeError::malformed(FORMAT, e.to_string()))?;

    Ok(ds)
}

// -- Tests -------------------------------------------------------------------
