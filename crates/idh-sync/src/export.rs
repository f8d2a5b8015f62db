//! Parquet snapshots of a reconciled series, for offline checks against the warehouse.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use idh_core::{format_instant, MetricRow, Observation, TimeRange, MEASUREMENT_COLUMNS};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::reconcile::flatten_all;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub range: TimeRange,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `observations.parquet`, `metrics.parquet` and `manifest.json` into `dir`.
pub fn export_snapshot(dir: &Path, range: &TimeRange, observations: &[Observation]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let metrics = flatten_all(observations);
    let observations_path = dir.join("observations.parquet");
    let metrics_path = dir.join("metrics.parquet");
    write_observations_parquet(&observations_path, observations)?;
    write_metrics_parquet(&metrics_path, &metrics)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        range: *range,
        files: vec![
            manifest_entry("observations", dir, &observations_path, observations.len())?,
            manifest_entry("metrics", dir, &metrics_path, metrics.len())?,
        ],
    };

    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_observations_parquet(path: &Path, observations: &[Observation]) -> Result<()> {
    let mut fields = vec![ArrowField::new("timestamp", DataType::Utf8, false)];
    fields.extend(
        MEASUREMENT_COLUMNS
            .iter()
            .map(|name| ArrowField::new(*name, DataType::UInt32, false)),
    );
    fields.push(ArrowField::new("sum", DataType::Int64, false));
    let schema = Arc::new(Schema::new(fields));

    let mut columns: Vec<ArrayRef> = vec![Arc::new(StringArray::from(
        observations
            .iter()
            .map(|o| format_instant(&o.timestamp))
            .collect::<Vec<_>>(),
    ))];
    for index in 0..MEASUREMENT_COLUMNS.len() {
        columns.push(Arc::new(UInt32Array::from(
            observations
                .iter()
                .map(|o| o.measurements.column_values()[index])
                .collect::<Vec<_>>(),
        )));
    }
    columns.push(Arc::new(Int64Array::from(
        observations
            .iter()
            .map(|o| o.sum.unwrap_or_else(|| o.measurements.method_sum()))
            .collect::<Vec<_>>(),
    )));

    let batch = RecordBatch::try_new(schema, columns).context("building observations record batch")?;
    write_parquet(path, batch)
}

fn write_metrics_parquet(path: &Path, metrics: &[MetricRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("timestamp", DataType::Utf8, false),
        ArrowField::new("method", DataType::Utf8, false),
        ArrowField::new("count", DataType::UInt32, false),
    ]));

    let timestamps = StringArray::from(
        metrics
            .iter()
            .map(|m| format_instant(&m.timestamp))
            .collect::<Vec<_>>(),
    );
    let methods = StringArray::from(metrics.iter().map(|m| m.method.as_str()).collect::<Vec<_>>());
    let counts = UInt32Array::from(metrics.iter().map(|m| m.count).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![Arc::new(timestamps), Arc::new(methods), Arc::new(counts)],
    )
    .context("building metrics record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, dir: &Path, path: &Path, rows: usize) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::canonicalize;
    use crate::testing::{at_hour, hourly};
    use parquet::file::reader::{FileReader, SerializedFileReader};

    fn parquet_rows(path: &Path) -> i64 {
        let reader = SerializedFileReader::new(File::open(path).unwrap()).unwrap();
        reader.metadata().file_metadata().num_rows()
    }

    #[test]
    fn snapshot_writes_both_tables_and_a_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let series = canonicalize(hourly(0..6, |h| h as u32)).unwrap();
        let range = TimeRange::new(at_hour(0), at_hour(6)).unwrap();

        let manifest_path = export_snapshot(dir.path(), &range, &series).unwrap();

        assert_eq!(parquet_rows(&dir.path().join("observations.parquet")), 6);
        assert_eq!(parquet_rows(&dir.path().join("metrics.parquet")), 60);

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(manifest_path).unwrap()).unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0]["path"], "observations.parquet");
        assert_eq!(files[1]["rows"], 60);
        assert_eq!(files[0]["sha256"].as_str().unwrap().len(), 64);
        assert_eq!(manifest["range"]["from"], "2020-05-01T00:00:00Z");
    }
}
