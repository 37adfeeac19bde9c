//! Processed-samples snapshot export.
//!
//! Reads every row of the `processed_samples` relation and writes it verbatim
//! to a single Parquet file. There is no filtering (soft-deleted rows are
//! exported too) and no incremental mode.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use thiserror::Error;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info, warn};

use crate::config::ExportConfig;

const SELECT_PROCESSED_SAMPLES: &str = "SELECT id, created_at, updated_at, deleted_at, device_id, \
     scenario_id, metric_name, value, timestamp FROM processed_samples";

/// Errors that can occur during the export.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("export task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("cannot write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// One row of `processed_samples`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedSample {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub device_id: String,
    pub scenario_id: String,
    pub metric_name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl TryFrom<&Row> for ProcessedSample {
    type Error = tokio_postgres::Error;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
            device_id: row.try_get("device_id")?,
            scenario_id: row.try_get("scenario_id")?,
            metric_name: row.try_get("metric_name")?,
            value: row.try_get("value")?,
            timestamp: row.try_get("timestamp")?,
        })
    }
}

/// Arrow schema of the snapshot file, columns in table order.
pub fn samples_schema() -> SchemaRef {
    let utc_micros = DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()));
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("created_at", utc_micros.clone(), false),
        Field::new("updated_at", utc_micros.clone(), false),
        Field::new("deleted_at", utc_micros.clone(), true),
        Field::new("device_id", DataType::Utf8, false),
        Field::new("scenario_id", DataType::Utf8, false),
        Field::new("metric_name", DataType::Utf8, false),
        Field::new("value", DataType::Float64, false),
        Field::new("timestamp", utc_micros, false),
    ]))
}

fn timestamp_column<I>(values: I) -> ArrayRef
where
    I: IntoIterator<Item = Option<DateTime<Utc>>>,
{
    let micros: Vec<Option<i64>> = values
        .into_iter()
        .map(|t| t.map(|t| t.timestamp_micros()))
        .collect();
    Arc::new(TimestampMicrosecondArray::from(micros).with_timezone("UTC"))
}

/// Convert rows into a single columnar batch.
pub fn to_record_batch(samples: &[ProcessedSample]) -> Result<RecordBatch, ExportError> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from_iter_values(samples.iter().map(|s| s.id))),
        timestamp_column(samples.iter().map(|s| Some(s.created_at))),
        timestamp_column(samples.iter().map(|s| Some(s.updated_at))),
        timestamp_column(samples.iter().map(|s| s.deleted_at)),
        Arc::new(StringArray::from_iter_values(samples.iter().map(|s| s.device_id.as_str()))),
        Arc::new(StringArray::from_iter_values(samples.iter().map(|s| s.scenario_id.as_str()))),
        Arc::new(StringArray::from_iter_values(samples.iter().map(|s| s.metric_name.as_str()))),
        Arc::new(Float64Array::from_iter_values(samples.iter().map(|s| s.value))),
        timestamp_column(samples.iter().map(|s| Some(s.timestamp))),
    ];

    Ok(RecordBatch::try_new(samples_schema(), columns)?)
}

/// Write `samples` to a Snappy-compressed Parquet file at `path`.
///
/// Returns the number of rows written. An empty slice still produces a valid
/// file carrying the schema.
pub fn write_parquet(path: &Path, samples: &[ProcessedSample]) -> Result<usize, ExportError> {
    let batch = to_record_batch(samples)?;

    let file = File::create(path).map_err(|source| ExportError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    debug!(path = %path.display(), rows = batch.num_rows(), "Parquet file written");
    Ok(batch.num_rows())
}

/// Fetch every processed sample.
pub async fn fetch_processed_samples(client: &Client) -> Result<Vec<ProcessedSample>, ExportError> {
    let rows = client.query(SELECT_PROCESSED_SAMPLES, &[]).await?;
    let samples = rows
        .iter()
        .map(ProcessedSample::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(samples)
}

/// Connect, dump the table and write the snapshot. Returns the row count.
pub async fn run_export(config: &ExportConfig) -> Result<usize, ExportError> {
    info!("Connecting to sample store");
    let (client, connection) = tokio_postgres::connect(&config.database_url, NoTls).await?;

    // The connection object performs the actual I/O.
    let connection_handle = tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!(error = %e, "Database connection error");
        }
    });

    let samples = fetch_processed_samples(&client).await?;
    info!(rows = samples.len(), "Fetched processed samples");

    let output_path = config.output_path.clone();
    let written =
        tokio::task::spawn_blocking(move || write_parquet(&output_path, &samples)).await??;

    drop(client);
    if let Err(e) = connection_handle.await {
        warn!(error = %e, "Database connection task panicked");
    }

    info!(
        rows = written,
        path = %config.output_path.display(),
        "Export complete"
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use chrono::TimeZone;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use uuid::Uuid;

    fn sample(id: i64, metric: &str, deleted: bool) -> ProcessedSample {
        let base = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        ProcessedSample {
            id,
            created_at: base,
            updated_at: base + chrono::Duration::seconds(1),
            deleted_at: deleted.then(|| base + chrono::Duration::seconds(2)),
            device_id: "1".to_string(),
            scenario_id: "19".to_string(),
            metric_name: metric.to_string(),
            value: id as f64 * 0.5,
            timestamp: base + chrono::Duration::microseconds(123_456),
        }
    }

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("processed-samples-{}.parquet", Uuid::new_v4()))
    }

    #[test]
    fn test_schema_column_order() {
        let schema = samples_schema();
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(
            names,
            vec![
                "id",
                "created_at",
                "updated_at",
                "deleted_at",
                "device_id",
                "scenario_id",
                "metric_name",
                "value",
                "timestamp"
            ]
        );
        assert!(schema.field_with_name("deleted_at").unwrap().is_nullable());
        assert!(!schema.field_with_name("id").unwrap().is_nullable());
    }

    #[test]
    fn test_record_batch_keeps_rows_verbatim() {
        let rows = vec![sample(1, "acc_x_mean", false), sample(2, "temp_max", true)];
        let batch = to_record_batch(&rows).unwrap();

        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 9);

        let deleted = batch
            .column(3)
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .unwrap();
        assert!(deleted.is_null(0));
        assert!(!deleted.is_null(1));

        let metrics = batch
            .column(6)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(metrics.value(1), "temp_max");

        let timestamps = batch
            .column(8)
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .unwrap();
        assert_eq!(timestamps.value(0), rows[0].timestamp.timestamp_micros());
    }

    #[test]
    fn test_write_parquet_snapshot() {
        let rows = vec![
            sample(1, "acc_x_mean", false),
            sample(2, "gyro_z_rms", false),
            sample(3, "temp_max", true),
        ];
        let path = temp_path();

        let written = write_parquet(&path, &rows).unwrap();
        assert_eq!(written, 3);

        let file = File::open(&path).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let total: usize = reader.map(|batch| batch.unwrap().num_rows()).sum();
        assert_eq!(total, 3);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_write_parquet_empty_table() {
        let path = temp_path();

        assert_eq!(write_parquet(&path, &[]).unwrap(), 0);

        let file = File::open(&path).unwrap();
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).unwrap();
        assert_eq!(builder.schema().fields().len(), 9);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_panicked_write_task_is_task_error() {
        let join_error = tokio::task::spawn_blocking(|| -> usize { panic!("writer panicked") })
            .await
            .unwrap_err();

        let err = ExportError::from(join_error);
        assert!(matches!(err, ExportError::Task(_)));
        assert!(err.to_string().starts_with("export task failed"));
    }

    #[test]
    fn test_write_parquet_bad_path() {
        let path = std::env::temp_dir()
            .join(format!("missing-{}", Uuid::new_v4()))
            .join("data.parquet");

        let err = write_parquet(&path, &[sample(1, "acc_x_mean", false)]).unwrap_err();
        assert!(matches!(err, ExportError::Io { .. }));
    }
}
