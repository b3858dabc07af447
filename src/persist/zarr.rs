//! Zarr V3 directory stores.
//!
//! Layout: a root group carrying the dataset attributes, an int64 `time`
//! array, `lat`/`lon` coordinate arrays shaped like the spatial layout, and
//! one float32 array per variable over `(time, <spatial dims>)`.

use std::{fs, path::Path, sync::Arc};

use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};
use zarrs::array::codec::bytes_to_bytes::blosc::{
    BloscCodec, BloscCompressionLevel, BloscCompressor, BloscShuffleMode,
};
use zarrs::array::codec::BytesToBytesCodecTraits;
use zarrs::array::{ArrayBuilder, ChunkGrid, DataType, Element, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs::group::GroupBuilder;
use zarrs_filesystem::FilesystemStore;

use crate::dataset::{Dataset, Spatial};

const TIME_CHUNK: u64 = 24;
const SPACE_CHUNK: u64 = 256;
const COMPRESSION_LEVEL: u8 = 5;

pub const TIME_UNITS: &str = "seconds since 1970-01-01 00:00:00";

struct ArraySpec<'a> {
    name: &'a str,
    shape: Vec<u64>,
    dims: Vec<&'a str>,
    attrs: Map<String, Value>,
}

pub fn save(ds: &Dataset, path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    let store = Arc::new(FilesystemStore::new(path)?);

    let mut attrs: Map<String, Value> = ds.attrs.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
    attrs.insert(
        "created_by".to_string(),
        json!(format!("wxdl {}", env!("CARGO_PKG_VERSION"))),
    );
    if let Spatial::Stations { ids, .. } = &ds.spatial {
        attrs.insert("site_ids".to_string(), json!(ids));
    }
    GroupBuilder::new()
        .attributes(attrs)
        .build(store.clone(), "/")?
        .store_metadata()?;

    let nt = ds.times.len() as u64;
    let seconds: Vec<i64> = ds.times.iter().map(|t| t.and_utc().timestamp()).collect();
    let mut time_attrs = Map::new();
    time_attrs.insert("units".to_string(), json!(TIME_UNITS));
    time_attrs.insert("calendar".to_string(), json!("proleptic_gregorian"));
    let time = ArraySpec {
        name: "time",
        shape: vec![nt],
        dims: vec!["time"],
        attrs: time_attrs,
    };
    write(&store, time, DataType::Int64, FillValue::from(0i64), None, &seconds)?;

    write_coordinates(&store, &ds.spatial)?;

    let spatial_shape: Vec<u64> = ds.spatial.shape().iter().map(|n| *n as u64).collect();
    let spatial_dims = ds.spatial.dimension_names();
    for (name, var) in &ds.variables {
        let mut attrs = Map::new();
        if let Some(units) = &var.units {
            attrs.insert("units".to_string(), json!(units));
        }
        let spec = ArraySpec {
            name,
            shape: [vec![nt], spatial_shape.clone()].concat(),
            dims: [vec!["time"], spatial_dims.clone()].concat(),
            attrs,
        };
        write(
            &store,
            spec,
            DataType::Float32,
            FillValue::from(f32::NAN),
            Some(blosc()?),
            &var.values,
        )?;
    }

    Ok(())
}

fn write_coordinates(store: &Arc<FilesystemStore>, spatial: &Spatial) -> Result<()> {
    let degrees = |axis: &str| {
        let mut attrs = Map::new();
        attrs.insert("units".to_string(), json!(format!("degrees_{}", axis)));
        attrs
    };

    let (lat, lon, lat_shape, lon_shape, lat_dims, lon_dims) = match spatial {
        Spatial::Regular { lat, lon } => (
            lat,
            lon,
            vec![lat.len() as u64],
            vec![lon.len() as u64],
            vec!["lat"],
            vec!["lon"],
        ),
        Spatial::Curvilinear { ny, nx, lat, lon } => {
            let shape = vec![*ny as u64, *nx as u64];
            (lat, lon, shape.clone(), shape, vec!["y", "x"], vec!["y", "x"])
        }
        Spatial::Stations { lat, lon, .. } => {
            let shape = vec![lat.len() as u64];
            (lat, lon, shape.clone(), shape, vec!["site"], vec!["site"])
        }
    };

    let lat_spec = ArraySpec {
        name: "lat",
        shape: lat_shape,
        dims: lat_dims,
        attrs: degrees("north"),
    };
    write(store, lat_spec, DataType::Float64, FillValue::from(f64::NAN), None, lat)?;

    let lon_spec = ArraySpec {
        name: "lon",
        shape: lon_shape,
        dims: lon_dims,
        attrs: degrees("east"),
    };
    write(store, lon_spec, DataType::Float64, FillValue::from(f64::NAN), None, lon)?;

    Ok(())
}

fn blosc() -> Result<Arc<dyn BytesToBytesCodecTraits>> {
    let level = BloscCompressionLevel::try_from(COMPRESSION_LEVEL)
        .map_err(|_| anyhow!("invalid blosc level {}", COMPRESSION_LEVEL))?;
    let codec = BloscCodec::new(BloscCompressor::Zstd, level, None, BloscShuffleMode::Shuffle, Some(4))?;
    Ok(Arc::new(codec))
}

// Chunks span at most a day of hourly slices and a 256-cell tile.
fn chunk_grid(shape: &[u64], time_major: bool) -> Result<ChunkGrid> {
    let chunks: Vec<u64> = shape
        .iter()
        .enumerate()
        .map(|(i, n)| {
            let cap = if time_major && i == 0 { TIME_CHUNK } else { SPACE_CHUNK };
            (*n).clamp(1, cap)
        })
        .collect();

    chunks.try_into().map_err(|e| anyhow!("invalid chunk shape: {:?}", e))
}

fn write<T: Element>(
    store: &Arc<FilesystemStore>,
    spec: ArraySpec,
    data_type: DataType,
    fill: FillValue,
    codec: Option<Arc<dyn BytesToBytesCodecTraits>>,
    values: &[T],
) -> Result<()> {
    let time_major = spec.dims.first() == Some(&"time");
    let mut builder = ArrayBuilder::new(spec.shape.clone(), data_type, chunk_grid(&spec.shape, time_major)?, fill);
    builder
        .dimension_names(Some(spec.dims))
        .attributes(spec.attrs);
    if let Some(codec) = codec {
        builder.bytes_to_bytes_codecs(vec![codec]);
    }

    let array = builder.build(store.clone(), &format!("/{}", spec.name))?;
    array.store_metadata()?;
    if values.is_empty() {
        return Ok(());
    }

    let subset = ArraySubset::new_with_start_shape(vec![0; spec.shape.len()], spec.shape)?;
    array.store_array_subset_elements(&subset, values)?;

    Ok(())
}

// -- Tests -------------------------------------------------------------------
