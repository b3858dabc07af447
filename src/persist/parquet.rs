//! Long-format parquet export: one row per finite value.

use std::{fs::File, path::Path, sync::Arc};

use anyhow::Result;
use arrow::{
    array::{Float32Builder, StringBuilder, TimestampSecondBuilder, UInt32Builder},
    datatypes::{DataType, Field, Schema, TimeUnit},
    record_batch::RecordBatch,
};
use parquet::{
    arrow::ArrowWriter,
    basic::{Compression, ZstdLevel},
    file::properties::WriterProperties,
};

use crate::{cli::create_progress_bar, dataset::Dataset};

const CHUNK_SIZE: usize = 100_000;

fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("time", DataType::Timestamp(TimeUnit::Second, None), false),
        Field::new("cell", DataType::UInt32, false),
        Field::new("lat", DataType::Float32, false),
        Field::new("lon", DataType::Float32, false),
        Field::new("variable", DataType::Utf8, false),
        Field::new("value", DataType::Float32, false),
    ]))
}

struct Columns {
    time: TimestampSecondBuilder,
    cell: UInt32Builder,
    lat: Float32Builder,
    lon: Float32Builder,
    variable: StringBuilder,
    value: Float32Builder,
    rows: usize,
}

impl Columns {
    fn new() -> Self {
        Columns {
            time: TimestampSecondBuilder::with_capacity(CHUNK_SIZE),
            cell: UInt32Builder::with_capacity(CHUNK_SIZE),
            lat: Float32Builder::with_capacity(CHUNK_SIZE),
            lon: Float32Builder::with_capacity(CHUNK_SIZE),
            variable: StringBuilder::with_capacity(CHUNK_SIZE, CHUNK_SIZE * 8),
            value: Float32Builder::with_capacity(CHUNK_SIZE),
            rows: 0,
        }
    }

    fn flush(&mut self, writer: &mut ArrowWriter<File>, schema: &Arc<Schema>) -> Result<()> {
        if self.rows == 0 {
            return Ok(());
        }
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(self.time.finish()),
                Arc::new(self.cell.finish()),
                Arc::new(self.lat.finish()),
                Arc::new(self.lon.finish()),
                Arc::new(self.variable.finish()),
                Arc::new(self.value.finish()),
            ],
        )?;
        writer.write(&batch)?;
        self.rows = 0;

        Ok(())
    }
}

pub fn save(ds: &Dataset, path: &Path) -> Result<()> {
    let total: usize = ds
        .variables
        .values()
        .map(|v| v.values.iter().filter(|x| x.is_finite()).count())
        .sum();

    let schema = schema();
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .set_dictionary_enabled(true)
        .build();
    let mut writer = ArrowWriter::try_new(File::create(path)?, schema.clone(), Some(props))?;
    let pb = create_progress_bar(total as u64, "Writing parquet file".to_string());

    let cells = ds.spatial.cells();
    let coords: Vec<(f32, f32)> = (0..cells)
        .map(|c| {
            let (lon, lat) = ds.spatial.coords(c);
            (lat as f32, lon as f32)
        })
        .collect();
    let seconds: Vec<i64> = ds.times.iter().map(|t| t.and_utc().timestamp()).collect();

    let mut columns = Columns::new();
    let mut written = 0u64;
    for (name, var) in &ds.variables {
        for (i, value) in var.values.iter().enumerate() {
            if !value.is_finite() {
                continue;
            }
            let (t, cell) = (i / cells, i % cells);
            let (lat, lon) = coords[cell];

            columns.time.append_value(seconds[t]);
            columns.cell.append_value(cell as u32);
            columns.lat.append_value(lat);
            columns.lon.append_value(lon);
            columns.variable.append_value(name);
            columns.value.append_value(*value);
            columns.rows += 1;

            written += 1;
            if written % 10_000 == 0 {
                pb.set_position(written);
            }
            if columns.rows >= CHUNK_SIZE {
                columns.flush(&mut writer, &schema)?;
            }
        }
    }
    columns.flush(&mut writer, &schema)?;

    pb.finish_with_message("Finished writing Parquet file");
    writer.close()?;
    Ok(())
}

// -- Tests -------------------------------------------------------------------
