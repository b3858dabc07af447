//! In-memory (time × space × variable) dataset and the operations used to
//! assemble one from many raw files.

pub mod horizon;

use std::collections::BTreeMap;

use chrono::NaiveDateTime;

use crate::{error::MergeError, geo::BoundingBox, geo::Boundary, request::Frequency};

const COORD_TOLERANCE: f64 = 1e-6;

/// Spatial layout shared by every variable of a dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum Spatial {
    /// Rectilinear grid, cells ordered row-major by (lat, lon).
    Regular { lat: Vec<f64>, lon: Vec<f64> },
    /// Projected grid with per-cell coordinates, row-major (y, x).
    Curvilinear {
        ny: usize,
        nx: usize,
        lat: Vec<f64>,
        lon: Vec<f64>,
    },
    /// Point observations.
    Stations {
        ids: Vec<String>,
        lat: Vec<f64>,
        lon: Vec<f64>,
    },
}

impl Spatial {
    pub fn cells(&self) -> usize {
        match self {
            Spatial::Regular { lat, lon } => lat.len() * lon.len(),
            Spatial::Curvilinear { ny, nx, .. } => ny * nx,
            Spatial::Stations { ids, .. } => ids.len(),
        }
    }

    /// Shape of one time slice.
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Spatial::Regular { lat, lon } => vec![lat.len(), lon.len()],
            Spatial::Curvilinear { ny, nx, .. } => vec![*ny, *nx],
            Spatial::Stations { ids, .. } => vec![ids.len()],
        }
    }

    pub fn dimension_names(&self) -> Vec<&'static str> {
        match self {
            Spatial::Regular { .. } => vec!["lat", "lon"],
            Spatial::Curvilinear { .. } => vec!["y", "x"],
            Spatial::Stations { .. } => vec!["site"],
        }
    }

    /// (lon, lat) of a cell.
    pub fn coords(&self, cell: usize) -> (f64, f64) {
        match self {
            Spatial::Regular { lat, lon } => {
                let n = lon.len();
                (lon[cell % n], lat[cell / n])
            }
            Spatial::Curvilinear { lat, lon, .. } | Spatial::Stations { lat, lon, .. } => {
                (lon[cell], lat[cell])
            }
        }
    }

    fn same_as(&self, other: &Spatial) -> bool {
        fn close(a: &[f64], b: &[f64]) -> bool {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= COORD_TOLERANCE)
        }
        match (self, other) {
            (Spatial::Regular { lat: a, lon: b }, Spatial::Regular { lat: c, lon: d }) => {
                close(a, c) && close(b, d)
            }
            (
                Spatial::Curvilinear { ny, nx, lat: a, lon: b },
                Spatial::Curvilinear { ny: ny2, nx: nx2, lat: c, lon: d },
            ) => ny == ny2 && nx == nx2 && close(a, c) && close(b, d),
            (Spatial::Stations { ids: a, .. }, Spatial::Stations { ids: b, .. }) => a == b,
            _ => false,
        }
    }
}

/// Values of one variable, time-major: `values[t * cells + cell]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub values: Vec<f32>,
    pub units: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub times: Vec<NaiveDateTime>,
    pub spatial: Spatial,
    pub variables: BTreeMap<String, Variable>,
    pub attrs: BTreeMap<String, String>,
}

impl Dataset {
    pub fn new(times: Vec<NaiveDateTime>, spatial: Spatial) -> Self {
        Dataset {
            times,
            spatial,
            variables: BTreeMap::new(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        values: Vec<f32>,
        units: Option<String>,
    ) -> Result<(), MergeError> {
        let name = name.into();
        let expected = self.times.len() * self.spatial.cells();
        if values.len() != expected {
            return Err(MergeError::Shape(name, values.len(), expected));
        }
        self.variables.insert(name, Variable { values, units });
        Ok(())
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.variables.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty() || self.variables.is_empty() || self.spatial.cells() == 0
    }

    pub fn select_variables(&mut self, keep: &[String]) {
        self.variables.retain(|name, _| keep.contains(name));
    }

    pub fn drop_variables(&mut self, drop: &[&str]) {
        self.variables.retain(|name, _| !drop.contains(&name.as_str()));
    }

    /// Removes variables that hold no finite value at all.
    pub fn drop_empty_variables(&mut self) -> Vec<String> {
        let empty: Vec<String> = self
            .variables
            .iter()
            .filter(|(_, v)| v.values.iter().all(|x| !x.is_finite()))
            .map(|(k, _)| k.clone())
            .collect();
        self.variables.retain(|name, _| !empty.contains(name));
        empty
    }

    /// Joins pieces that carry the same variables along the time axis.
    pub fn concat_time(pieces: Vec<Dataset>) -> Result<Dataset, MergeError> {
        let mut pieces = pieces.into_iter();
        let first = pieces.next().ok_or(MergeError::Empty)?;
        let names = first.variable_names();

        let mut out = first;
        for piece in pieces {
            if !piece.spatial.same_as(&out.spatial) {
                return Err(MergeError::SpatialMismatch);
            }
            if piece.variable_names() != names {
                return Err(MergeError::VariableMismatch(names, piece.variable_names()));
            }
            out.times.extend(piece.times);
            for (name, var) in piece.variables {
                if let Some(existing) = out.variables.get_mut(&name) {
                    existing.values.extend(var.values);
                }
            }
            for (k, v) in piece.attrs {
                out.attrs.entry(k).or_insert(v);
            }
        }

        let times = out.times.clone();
        Ok(out.regroup(&times))
    }

    /// Combines variable-disjoint pieces on the union of their timestamps.
    pub fn merge(pieces: Vec<Dataset>) -> Result<Dataset, MergeError> {
        let first = pieces.first().ok_or(MergeError::Empty)?;
        let spatial = first.spatial.clone();

        let mut times: Vec<NaiveDateTime> = Vec::new();
        for piece in &pieces {
            if !piece.spatial.same_as(&spatial) {
                return Err(MergeError::SpatialMismatch);
            }
            times.extend(piece.times.iter().copied());
        }
        times.sort();
        times.dedup();

        let cells = spatial.cells();
        let mut out = Dataset::new(times.clone(), spatial);
        for piece in pieces {
            let slots: Vec<usize> = piece
                .times
                .iter()
                .map(|t| times.binary_search(t).unwrap_or_default())
                .collect();

            for (name, var) in piece.variables {
                if out.variables.contains_key(&name) {
                    return Err(MergeError::DuplicateVariable(name));
                }
                let mut values = vec![f32::NAN; times.len() * cells];
                for (local, slot) in slots.iter().enumerate() {
                    let src = &var.values[local * cells..(local + 1) * cells];
                    let dst = &mut values[slot * cells..(slot + 1) * cells];
                    for (d, s) in dst.iter_mut().zip(src) {
                        if d.is_nan() {
                            *d = *s;
                        }
                    }
                }
                out.variables.insert(name, Variable { values, units: var.units });
            }
            for (k, v) in piece.attrs {
                out.attrs.entry(k).or_insert(v);
            }
        }

        Ok(out)
    }

    /// Floors every timestamp; slices landing on the same instant collapse.
    pub fn floor_times(self, frequency: Frequency) -> Dataset {
        let floored: Vec<NaiveDateTime> = self.times.iter().map(|t| frequency.floor(*t)).collect();
        self.regroup(&floored)
    }

    // Re-sorts slices by `keys` (one per current slice). Slices sharing a key
    // are collapsed cell by cell, the first finite value winning.
    fn regroup(mut self, keys: &[NaiveDateTime]) -> Dataset {
        let mut order: Vec<usize> = (0..keys.len()).collect();
        order.sort_by_key(|i| keys[*i]);

        let mut times: Vec<NaiveDateTime> = Vec::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for i in order {
            if times.last() == Some(&keys[i]) {
                if let Some(group) = groups.last_mut() {
                    group.push(i);
                }
            } else {
                times.push(keys[i]);
                groups.push(vec![i]);
            }
        }

        let cells = self.spatial.cells();
        for var in self.variables.values_mut() {
            let mut values = vec![f32::NAN; times.len() * cells];
            for (slot, group) in groups.iter().enumerate() {
                let dst = &mut values[slot * cells..(slot + 1) * cells];
                for src_slot in group {
                    let src = &var.values[src_slot * cells..(src_slot + 1) * cells];
                    for (d, s) in dst.iter_mut().zip(src) {
                        if !d.is_finite() && s.is_finite() {
                            *d = *s;
                        }
                    }
                }
            }
            var.values = values;
        }

        self.times = times;
        self
    }

    /// Rewraps longitudes from [0, 360) to [-180, 180).
    ///
    /// Regular grids are re-sorted so longitude stays ascending.
    pub fn normalize_longitude(mut self) -> Dataset {
        let wrap = |x: f64| if x >= 180.0 { x - 360.0 } else { x };

        match &mut self.spatial {
            Spatial::Regular { lat, lon } => {
                if lon.iter().all(|x| *x < 180.0) {
                    return self;
                }
                let wrapped: Vec<f64> = lon.iter().map(|x| wrap(*x)).collect();
                let mut order: Vec<usize> = (0..wrapped.len()).collect();
                order.sort_by(|a, b| wrapped[*a].total_cmp(&wrapped[*b]));

                let (rows, cols) = (lat.len(), lon.len());
                *lon = order.iter().map(|i| wrapped[*i]).collect();
                for var in self.variables.values_mut() {
                    let mut values = Vec::with_capacity(var.values.len());
                    for slice in var.values.chunks(rows * cols) {
                        for row in slice.chunks(cols) {
                            values.extend(order.iter().map(|i| row[*i]));
                        }
                    }
                    var.values = values;
                }
            }
            Spatial::Curvilinear { lon, .. } | Spatial::Stations { lon, .. } => {
                lon.iter_mut().for_each(|x| *x = wrap(*x));
            }
        }

        self
    }

    /// Coarse clip to the smallest sub-grid (or station subset) touching `bbox`.
    pub fn crop_to_bbox(self, bbox: &BoundingBox) -> Result<Dataset, MergeError> {
        if self.spatial.cells() == 0 {
            return Err(MergeError::EmptyRegion);
        }
        match &self.spatial {
            Spatial::Regular { lat, lon } => {
                let rows: Vec<usize> = (0..lat.len())
                    .filter(|i| lat[*i] >= bbox.min_lat && lat[*i] <= bbox.max_lat)
                    .collect();
                let cols: Vec<usize> = (0..lon.len())
                    .filter(|j| lon[*j] >= bbox.min_lon && lon[*j] <= bbox.max_lon)
                    .collect();
                if rows.is_empty() || cols.is_empty() {
                    return Err(MergeError::EmptyRegion);
                }
                let spatial = Spatial::Regular {
                    lat: rows.iter().map(|i| lat[*i]).collect(),
                    lon: cols.iter().map(|j| lon[*j]).collect(),
                };
                let n = lon.len();
                let keep: Vec<usize> = rows
                    .iter()
                    .flat_map(|i| cols.iter().map(move |j| i * n + j))
                    .collect();
                Ok(self.take_cells(&keep, spatial))
            }
            Spatial::Curvilinear { ny, nx, lat, lon } => {
                let (ny, nx) = (*ny, *nx);
                let (mut r0, mut r1, mut c0, mut c1) = (usize::MAX, 0, usize::MAX, 0);
                for cell in 0..ny * nx {
                    if bbox.contains(lon[cell], lat[cell]) {
                        let (r, c) = (cell / nx, cell % nx);
                        r0 = r0.min(r);
                        r1 = r1.max(r);
                        c0 = c0.min(c);
                        c1 = c1.max(c);
                    }
                }
                if r0 == usize::MAX {
                    return Err(MergeError::EmptyRegion);
                }
                let keep: Vec<usize> = (r0..=r1)
                    .flat_map(|r| (c0..=c1).map(move |c| r * nx + c))
                    .collect();
                let spatial = Spatial::Curvilinear {
                    ny: r1 - r0 + 1,
                    nx: c1 - c0 + 1,
                    lat: keep.iter().map(|i| lat[*i]).collect(),
                    lon: keep.iter().map(|i| lon[*i]).collect(),
                };
                Ok(self.take_cells(&keep, spatial))
            }
            Spatial::Stations { ids, lat, lon } => {
                let keep: Vec<usize> = (0..ids.len())
                    .filter(|i| bbox.contains(lon[*i], lat[*i]))
                    .collect();
                if keep.is_empty() {
                    return Err(MergeError::EmptyRegion);
                }
                let spatial = Spatial::Stations {
                    ids: keep.iter().map(|i| ids[*i].clone()).collect(),
                    lat: keep.iter().map(|i| lat[*i]).collect(),
                    lon: keep.iter().map(|i| lon[*i]).collect(),
                };
                Ok(self.take_cells(&keep, spatial))
            }
        }
    }

    fn take_cells(mut self, keep: &[usize], spatial: Spatial) -> Dataset {
        let cells = self.spatial.cells();
        for var in self.variables.values_mut() {
            var.values = var
                .values
                .chunks(cells.max(1))
                .flat_map(|slice| keep.iter().map(move |i| slice[*i]))
                .collect();
        }
        self.spatial = spatial;
        self
    }

    /// Sets every cell outside `boundary` to NaN. Returns the inside cell count.
    pub fn mask(&mut self, boundary: &Boundary) -> usize {
        let cells = self.spatial.cells();
        if cells == 0 {
            return 0;
        }
        let inside: Vec<bool> = (0..cells)
            .map(|c| {
                let (lon, lat) = self.spatial.coords(c);
                boundary.contains(lon, lat)
            })
            .collect();

        for var in self.variables.values_mut() {
            for slice in var.values.chunks_mut(cells) {
                for (v, keep) in slice.iter_mut().zip(&inside) {
                    if !keep {
                        *v = f32::NAN;
                    }
                }
            }
        }

        inside.iter().filter(|x| **x).count()
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{geo::tests::box_geojson, request::parse_timestamp};

    pub(crate) fn t(s: &str) -> NaiveDateTime {
        parse_timestamp(s).unwrap()
    }

    /// 10×10 one-degree grid starting at (`lon0`, 40).
    pub(crate) fn grid(lon0: f64, times: &[&str], var: &str) -> Dataset {
        let spatial = Spatial::Regular {
            lat: (0..10).map(|i| 40.0 + i as f64).collect(),
            lon: (0..10).map(|j| lon0 + j as f64).collect(),
        };
        let times: Vec<NaiveDateTime> = times.iter().map(|s| t(s)).collect();
        let n = times.len() * 100;
        let mut ds = Dataset::new(times, spatial);
        ds.insert(var, (0..n).map(|i| i as f32).collect(), None).unwrap();
        ds
    }

    fn finite_cells(ds: &Dataset, var: &str) -> usize {
        let cells = ds.spatial.cells();
        let values = &ds.variables[var].values;
        (0..cells)
            .filter(|c| (0..ds.times.len()).any(|t| values[t * cells + c].is_finite()))
            .count()
    }

    #[test]
    fn should_mask_to_polygon() {
        let mut ds = grid(-125.0, &["2021-01-01", "2021-01-02"], "tmax");
        let boundary = Boundary::from_geojson(&box_geojson(-121.5, 43.5, -119.5, 45.5)).unwrap();

        let inside = ds.mask(&boundary);

        assert_eq!(inside, 4);
        assert_eq!(finite_cells(&ds, "tmax"), 4);
        let values = &ds.variables["tmax"].values;
        assert_eq!(values.iter().filter(|v| v.is_finite()).count(), 8);
    }

    #[test]
    fn should_normalize_longitude_before_masking() {
        let boundary = Boundary::from_geojson(&box_geojson(-121.5, 43.5, -119.5, 45.5)).unwrap();

        let mut shifted = grid(235.0, &["2021-01-01"], "tmax").normalize_longitude();
        let mut reference = grid(-125.0, &["2021-01-01"], "tmax");
        shifted.mask(&boundary);
        reference.mask(&boundary);

        let Spatial::Regular { lon, .. } = &shifted.spatial else { panic!() };
        assert!(lon.iter().all(|x| (-180.0..180.0).contains(x)));
        assert_eq!(shifted.spatial, reference.spatial);
        let kept = |ds: &Dataset| -> Vec<Option<f32>> {
            ds.variables["tmax"].values.iter().map(|v| v.is_finite().then_some(*v)).collect()
        };
        assert_eq!(kept(&shifted), kept(&reference));
        assert_eq!(finite_cells(&shifted, "tmax"), 4);
    }

    #[test]
    fn should_reorder_columns_across_the_antimeridian() {
        let spatial = Spatial::Regular { lat: vec![0.0], lon: vec![0.0, 90.0, 180.0, 270.0] };
        let mut ds = Dataset::new(vec![t("2021-01-01")], spatial);
        ds.insert("v", vec![1.0, 2.0, 3.0, 4.0], None).unwrap();

        let ds = ds.normalize_longitude();

        let Spatial::Regular { lon, .. } = &ds.spatial else { panic!() };
        assert_eq!(lon, &vec![-180.0, -90.0, 0.0, 90.0]);
        assert_eq!(ds.variables["v"].values, vec![3.0, 4.0, 1.0, 2.0]);
    }

    #[test]
    fn should_concat_in_time_order() {
        let a = grid(0.0, &["2021-01-02"], "v");
        let b = grid(0.0, &["2021-01-01"], "v");

        let ds = Dataset::concat_time(vec![a, b]).unwrap();

        assert_eq!(ds.times, vec![t("2021-01-01"), t("2021-01-02")]);
        assert_eq!(ds.variables["v"].values.len(), 200);
        assert_eq!(ds.variables["v"].values[0], 0.0);
    }

    #[test]
    fn should_refuse_to_concat_different_variables() {
        let a = grid(0.0, &["2021-01-01"], "v");
        let b = grid(0.0, &["2021-01-02"], "w");
        assert!(matches!(
            Dataset::concat_time(vec![a, b]),
            Err(MergeError::VariableMismatch(_, _))
        ));
    }

    #[test]
    fn should_merge_disjoint_variables() {
        let a = grid(0.0, &["2021-01-01", "2021-01-02"], "t2m");
        let b = grid(0.0, &["2021-01-02"], "apcp");

        let ds = Dataset::merge(vec![a, b]).unwrap();

        assert_eq!(ds.times.len(), 2);
        assert_eq!(ds.variable_names(), vec!["apcp", "t2m"]);
        let apcp = &ds.variables["apcp"].values;
        assert!(apcp[..100].iter().all(|v| v.is_nan()));
        assert_eq!(apcp[100], 0.0);
    }

    #[test]
    fn should_reject_duplicate_variables_in_merge() {
        let a = grid(0.0, &["2021-01-01"], "v");
        let b = grid(0.0, &["2021-01-02"], "v");
        assert_eq!(
            Dataset::merge(vec![a, b]),
            Err(MergeError::DuplicateVariable("v".to_string()))
        );
    }

    #[test]
    fn should_reject_spatial_mismatch() {
        let a = grid(0.0, &["2021-01-01"], "v");
        let b = grid(1.0, &["2021-01-01"], "w");
        assert_eq!(Dataset::merge(vec![a, b]), Err(MergeError::SpatialMismatch));
    }

    #[test]
    fn should_collapse_floored_times() {
        let spatial = Spatial::Stations {
            ids: vec!["a".into(), "b".into()],
            lat: vec![0.0, 1.0],
            lon: vec![0.0, 1.0],
        };
        let mut ds = Dataset::new(vec![t("2021-01-01T00:10"), t("2021-01-01T00:50")], spatial);
        ds.insert("v", vec![f32::NAN, 2.0, 3.0, 4.0], None).unwrap();

        let ds = ds.floor_times(Frequency::Hourly);

        assert_eq!(ds.times, vec![t("2021-01-01T00:00")]);
        assert_eq!(ds.variables["v"].values, vec![3.0, 2.0]);
    }

    #[test]
    fn should_crop_regular_grid() {
        let ds = grid(-125.0, &["2021-01-01"], "v");
        let bbox = BoundingBox { min_lon: -121.5, min_lat: 43.5, max_lon: -119.5, max_lat: 45.5 };

        let ds = ds.crop_to_bbox(&bbox).unwrap();

        assert_eq!(ds.spatial.shape(), vec![2, 2]);
        // row 4 (lat 44), column 4 (lon -121)
        assert_eq!(ds.variables["v"].values[0], 44.0);
    }

    #[test]
    fn should_crop_curvilinear_grid_to_covering_rectangle() {
        let (ny, nx) = (3, 3);
        let lat: Vec<f64> = (0..9).map(|i| (i / nx) as f64).collect();
        let lon: Vec<f64> = (0..9).map(|i| (i % nx) as f64).collect();
        let mut ds = Dataset::new(vec![t("2021-01-01")], Spatial::Curvilinear { ny, nx, lat, lon });
        ds.insert("v", (0..9).map(|i| i as f32).collect(), None).unwrap();
        let bbox = BoundingBox { min_lon: 0.5, min_lat: 0.5, max_lon: 2.5, max_lat: 1.5 };

        let ds = ds.crop_to_bbox(&bbox).unwrap();

        assert_eq!(ds.spatial.shape(), vec![1, 2]);
        assert_eq!(ds.variables["v"].values, vec![4.0, 5.0]);
    }

    #[test]
    fn should_report_empty_region() {
        let ds = grid(0.0, &["2021-01-01"], "v");
        let bbox = BoundingBox { min_lon: 50.0, min_lat: 0.0, max_lon: 51.0, max_lat: 1.0 };
        assert_eq!(ds.crop_to_bbox(&bbox), Err(MergeError::EmptyRegion));
    }

    #[test]
    fn should_handle_grids_without_cells() {
        let spatial = Spatial::Regular { lat: vec![48.0], lon: vec![] };
        let mut ds = Dataset::new(vec![t("2021-01-01")], spatial);
        ds.insert("v", vec![], None).unwrap();
        let boundary = Boundary::from_geojson(&box_geojson(-1.0, 47.0, 1.0, 49.0)).unwrap();
        let bbox = boundary.bbox();

        assert_eq!(ds.mask(&boundary), 0);
        assert_eq!(ds.crop_to_bbox(&bbox), Err(MergeError::EmptyRegion));
    }

    #[test]
    fn should_drop_empty_variables() {
        let spatial = Spatial::Stations { ids: vec!["a".into()], lat: vec![0.0], lon: vec![0.0] };
        let mut ds = Dataset::new(vec![t("2021-01-01")], spatial);
        ds.insert("full", vec![1.0], None).unwrap();
        ds.insert("empty", vec![f32::NAN], None).unwrap();

        assert_eq!(ds.drop_empty_variables(), vec!["empty".to_string()]);
        assert_eq!(ds.variable_names(), vec!["full"]);
    }
}
