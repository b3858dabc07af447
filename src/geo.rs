//! Polygonal boundaries loaded from GeoJSON.

use std::{fs, path::Path};

use serde_json::Value;

use crate::error::ValidationError;

/// Rectangular lon/lat extent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }

    /// Grows the box by `margin` degrees on every side.
    pub fn padded(&self, margin: f64) -> Self {
        BoundingBox {
            min_lon: self.min_lon - margin,
            min_lat: self.min_lat - margin,
            max_lon: self.max_lon + margin,
            max_lat: self.max_lat + margin,
        }
    }
}

type Ring = Vec<(f64, f64)>;

/// One exterior ring and its holes.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    pub exterior: Ring,
    pub holes: Vec<Ring>,
}

impl Polygon {
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        ring_contains(&self.exterior, lon, lat)
            && !self.holes.iter().any(|h| ring_contains(h, lon, lat))
    }
}

fn ring_contains(ring: &[(f64, f64)], lon: f64, lat: f64) -> bool {
    let n = ring.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if ((yi > lat) != (yj > lat)) && (lon < (xj - xi) * (lat - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }

    inside
}

/// Union of every polygon found in a GeoJSON document, in lon/lat degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct Boundary {
    pub polygons: Vec<Polygon>,
}

impl Boundary {
    pub fn load(path: &Path) -> Result<Self, ValidationError> {
        if !path.exists() {
            return Err(ValidationError::MissingBoundary(path.display().to_string()));
        }
        let text = fs::read_to_string(path)
            .map_err(|e| ValidationError::Boundary(format!("{}: {}", path.display(), e)))?;
        Self::from_geojson(&text)
    }

    pub fn from_geojson(text: &str) -> Result<Self, ValidationError> {
        let doc: Value =
            serde_json::from_str(text).map_err(|e| ValidationError::Boundary(e.to_string()))?;
        check_crs(&doc)?;

        let mut polygons = Vec::new();
        collect(&doc, &mut polygons)?;
        if polygons.is_empty() {
            return Err(ValidationError::Boundary("no polygons found".to_string()));
        }

        Ok(Boundary { polygons })
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        self.polygons.iter().any(|p| p.contains(lon, lat))
    }

    pub fn bbox(&self) -> BoundingBox {
        let mut bbox = BoundingBox {
            min_lon: f64::INFINITY,
            min_lat: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
            max_lat: f64::NEG_INFINITY,
        };
        for (lon, lat) in self.polygons.iter().flat_map(|p| p.exterior.iter()) {
            bbox.min_lon = bbox.min_lon.min(*lon);
            bbox.max_lon = bbox.max_lon.max(*lon);
            bbox.min_lat = bbox.min_lat.min(*lat);
            bbox.max_lat = bbox.max_lat.max(*lat);
        }
        bbox
    }
}

// Only geographic lon/lat input is accepted; the legacy `crs` member may
// still name it explicitly.
fn check_crs(doc: &Value) -> Result<(), ValidationError> {
    let Some(name) = doc.pointer("/crs/properties/name").and_then(Value::as_str) else {
        return Ok(());
    };
    let geographic = ["CRS84", "EPSG::4326", "EPSG:4326", "CRS:84"];
    if geographic.iter().any(|g| name.ends_with(g)) {
        Ok(())
    } else {
        Err(ValidationError::Boundary(format!(
            "coordinates must be lon/lat degrees, found crs {}",
            name
        )))
    }
}

fn collect(value: &Value, out: &mut Vec<Polygon>) -> Result<(), ValidationError> {
    match value.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => {
            for feature in value
                .get("features")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                collect(feature, out)?;
            }
        }
        Some("Feature") => {
            if let Some(geometry) = value.get("geometry").filter(|g| !g.is_null()) {
                collect(geometry, out)?;
            }
        }
        Some("GeometryCollection") => {
            for geometry in value
                .get("geometries")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                collect(geometry, out)?;
            }
        }
        Some("Polygon") => out.push(polygon(coordinates(value)?)?),
        Some("MultiPolygon") => {
            let parts = coordinates(value)?
                .as_array()
                .ok_or_else(|| ValidationError::Boundary("bad MultiPolygon".to_string()))?;
            for part in parts {
                out.push(polygon(part)?);
            }
        }
        // Points and lines carry no area.
        Some(_) => {}
        None => return Err(ValidationError::Boundary("missing `type`".to_string())),
    }

    Ok(())
}

fn coordinates(value: &Value) -> Result<&Value, ValidationError> {
    value
        .get("coordinates")
        .ok_or_else(|| ValidationError::Boundary("geometry without coordinates".to_string()))
}

fn polygon(value: &Value) -> Result<Polygon, ValidationError> {
    let rings = value
        .as_array()
        .ok_or_else(|| ValidationError::Boundary("bad Polygon".to_string()))?;
    let mut rings = rings.iter().map(ring);

    let exterior = rings
        .next()
        .ok_or_else(|| ValidationError::Boundary("polygon without rings".to_string()))??;
    let holes = rings.collect::<Result<Vec<_>, _>>()?;

    Ok(Polygon { exterior, holes })
}

fn ring(value: &Value) -> Result<Ring, ValidationError> {
    let points = value
        .as_array()
        .ok_or_else(|| ValidationError::Boundary("bad ring".to_string()))?;

    points
        .iter()
        .map(|p| match (p.get(0).and_then(Value::as_f64), p.get(1).and_then(Value::as_f64)) {
            (Some(lon), Some(lat)) => Ok((lon, lat)),
            _ => Err(ValidationError::Boundary(format!("bad position {}", p))),
        })
        .collect()
}

// -- Tests -------------------------------------------------------------------
