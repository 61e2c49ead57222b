use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use chrono::NaiveDate;
use polars::prelude::{AnyValue, DataFrame, ParquetWriter, StatisticsOptions};
use uuid::Uuid;

use crate::{
    config::PipelineConfig,
    error::{DataError, MandiResult, ValidationError},
    idempotency::MarkerStore,
    lake::Compression,
    metrics,
    schema::{CanonicalCol, Layer, partition_values},
    validate::{Validator, quarantine_frame, report::AuditLog},
};

/// One partition-aware lake write.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub layer: Layer,
    /// Dataset name under the layer (e.g. `equity_ohlc`).
    pub dataset: String,
    /// Lake root.
    pub base_path: PathBuf,
    /// Hive partition columns, outermost first.
    pub partition_cols: Vec<CanonicalCol>,
    /// Validation schema; `None` skips pre-write validation.
    pub schema_name: Option<String>,
    pub compression: Compression,
    pub quarantine_dir: Option<PathBuf>,
    /// Idempotency key, typically the ISO trade date, optionally
    /// suffixed with a sub-partition discriminator.
    pub key: String,
    /// Output file stem (e.g. `bhavcopy_20240115`).
    pub file_stem: String,
    /// Trading day; anchors the partition of zero-row markers.
    pub trade_date: NaiveDate,
    pub fail_on_validation_errors: bool,
    /// Metadata captured in the idempotency marker.
    pub source_metadata: BTreeMap<String, String>,
}

impl WriteRequest {
    pub fn new(
        layer: Layer,
        dataset: impl Into<String>,
        base_path: impl Into<PathBuf>,
        trade_date: NaiveDate,
    ) -> Self {
        let dataset = dataset.into();
        Self {
            layer,
            dataset,
            base_path: base_path.into(),
            partition_cols: vec![CanonicalCol::Year, CanonicalCol::Month, CanonicalCol::Day],
            schema_name: None,
            compression: Compression::default(),
            quarantine_dir: None,
            key: trade_date.to_string(),
            file_stem: format!("part_{}", trade_date.format("%Y%m%d")),
            trade_date,
            fail_on_validation_errors: true,
            source_metadata: BTreeMap::new(),
        }
    }

    pub fn with_schema_name(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = Some(schema_name.into());
        self
    }

    pub fn with_partition_cols(mut self, cols: Vec<CanonicalCol>) -> Self {
        self.partition_cols = cols;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_file_stem(mut self, stem: impl Into<String>) -> Self {
        self.file_stem = stem.into();
        self
    }

    pub fn with_quarantine_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.quarantine_dir = Some(dir.into());
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.source_metadata
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn apply_policy(mut self, policy: &PipelineConfig) -> Self {
        self.fail_on_validation_errors = policy.fail_on_validation_errors;
        self
    }

    fn dataset_root(&self) -> PathBuf {
        self.base_path
            .join(self.layer.to_string())
            .join(&self.dataset)
    }

    /// Partition directory for the run's trade date; where zero-row
    /// markers land when there is nothing to write.
    fn date_partition_dir(&self) -> PathBuf {
        let (year, month, day) = partition_values(self.trade_date);
        self.dataset_root()
            .join(format!("year={year}"))
            .join(format!("month={month:02}"))
            .join(format!("day={day:02}"))
    }
}

/// Outcome of a lake write.
#[derive(Debug, Clone)]
pub struct WriteReport {
    pub output_paths: Vec<PathBuf>,
    pub rows: u64,
    pub idempotent_skip: bool,
}

/// Partitioned Parquet writer with pre-write validation, quarantine and
/// idempotency markers.
///
/// Files are written to a temp name and renamed so readers never see a
/// partial file; the marker is written last, after the output is
/// durable.
#[derive(Debug, Clone, Default)]
pub struct LakeWriter {
    markers: MarkerStore,
    audit: Option<AuditLog>,
}

impl LakeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every pre-write validation outcome in the audit log.
    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    #[tracing::instrument(skip_all, fields(dataset = %req.dataset, key = %req.key))]
    pub fn write(&self, df: &DataFrame, req: &WriteRequest) -> MandiResult<WriteReport> {
        // Zero-row frames still complete the unit of work: the marker
        // stops endless refetching of dates with no data.
        if df.height() == 0 {
            let expected = req.date_partition_dir().join(format!("{}.parquet", req.file_stem));
            if self.markers.is_complete(&expected, &req.key) {
                tracing::info!(idempotent_skip = true, "lake_write_skipped");
                return Ok(WriteReport {
                    output_paths: vec![expected],
                    rows: 0,
                    idempotent_skip: true,
                });
            }
            let mut metadata = req.source_metadata.clone();
            metadata
                .entry("skipped".to_string())
                .or_insert_with(|| "no_rows".to_string());
            self.markers
                .record_complete(&expected, &req.key, 0, metadata)?;
            tracing::info!(path = %expected.display(), "lake_write_empty_marker");
            return Ok(WriteReport {
                output_paths: vec![expected],
                rows: 0,
                idempotent_skip: false,
            });
        }

        if let Some(schema_name) = &req.schema_name {
            self.validate_before_write(df, schema_name, req)?;
        }

        let partitions = df
            .partition_by(
                req.partition_cols.iter().map(|c| c.name()).collect::<Vec<_>>(),
                true,
            )
            .map_err(|e| DataError::Frame(e.to_string()))?;

        let mut output_paths = Vec::with_capacity(partitions.len());
        let mut rows_written = 0u64;
        let mut skipped = 0usize;

        for partition in partitions {
            let dir = self.partition_dir(&partition, req)?;
            let output = dir.join(format!("{}.parquet", req.file_stem));

            // Marker check is the last action before the side effect.
            if self.markers.is_complete(&output, &req.key) {
                tracing::info!(path = %output.display(), idempotent_skip = true, "lake_write_skipped");
                skipped += 1;
                output_paths.push(output);
                continue;
            }

            let mut to_write = partition.clone();
            for col in &req.partition_cols {
                let _ = to_write.drop_in_place(col.as_str())
                    .map_err(|e| DataError::Frame(e.to_string()))?;
            }

            let rows = to_write.height() as u64;
            self.write_file(&mut to_write, &output, req.compression)?;

            self.markers
                .record_complete(&output, &req.key, rows, req.source_metadata.clone())?;

            tracing::info!(
                path = %output.display(),
                rows,
                compression = %req.compression,
                "lake_write_complete"
            );
            rows_written += rows;
            output_paths.push(output);
        }

        let idempotent_skip = skipped == output_paths.len();
        if !idempotent_skip {
            metrics::parquet_write(&req.dataset, true);
        }
        Ok(WriteReport {
            output_paths,
            rows: rows_written,
            idempotent_skip,
        })
    }

    fn validate_before_write(
        &self,
        df: &DataFrame,
        schema_name: &str,
        req: &WriteRequest,
    ) -> MandiResult<()> {
        let result = Validator::for_schema(schema_name)?.validate(df)?;

        if let Some(audit) = &self.audit
            && let Err(e) = audit.append(schema_name, &result)
        {
            tracing::warn!(error = %e, "validation_audit_append_failed");
        }

        if result.critical_failures == 0 {
            return Ok(());
        }

        if let Some(quarantine_dir) = &req.quarantine_dir {
            let failed = quarantine_frame(df, &result, schema_name)?;
            fs::create_dir_all(quarantine_dir).map_err(DataError::Io)?;
            let mut failed = failed;
            let path = quarantine_dir.join(format!("{schema_name}_failures.parquet"));
            self.write_file(&mut failed, &path, Compression::Snappy)?;
            tracing::warn!(
                quarantine = %path.display(),
                failed_rows = failed.height(),
                "quarantined_failures"
            );
        }

        if req.fail_on_validation_errors {
            metrics::parquet_write(&req.dataset, false);
            tracing::error!(
                schema_name,
                critical_failures = result.critical_failures,
                "validation_failed_aborting_write"
            );
            return Err(ValidationError::CriticalFailures {
                schema_name: schema_name.to_string(),
                critical_failures: result.critical_failures,
                total_rows: result.total_rows,
            }
            .into());
        }

        tracing::warn!(
            critical_failures = result.critical_failures,
            "validation_failures_detected_continuing"
        );
        Ok(())
    }

    /// Hive directory for one partition frame, derived from its key
    /// column values.
    fn partition_dir(&self, partition: &DataFrame, req: &WriteRequest) -> MandiResult<PathBuf> {
        let mut dir = req.dataset_root();
        for col in &req.partition_cols {
            let value = partition
                .column(col.as_str())
                .and_then(|c| c.get(0))
                .map_err(|e| DataError::Frame(e.to_string()))?;
            dir = dir.join(format!("{}={}", col.as_str(), partition_segment(col, &value)));
        }
        Ok(dir)
    }

    fn write_file(
        &self,
        df: &mut DataFrame,
        output: &Path,
        compression: Compression,
    ) -> MandiResult<()> {
        let dir = output.parent().ok_or_else(|| {
            DataError::FileSystem(format!("output path {} has no parent", output.display()))
        })?;
        fs::create_dir_all(dir).map_err(DataError::Io)?;

        let tmp = dir.join(format!(".tmp.{}", Uuid::new_v4()));
        let file = fs::File::create(&tmp).map_err(DataError::Io)?;
        ParquetWriter::new(file)
            .with_compression(compression.to_parquet())
            .with_statistics(StatisticsOptions::full())
            .finish(df)
            .map_err(|e| DataError::Frame(e.to_string()))?;
        fs::rename(&tmp, output).map_err(DataError::Io)?;
        Ok(())
    }
}

/// Render one partition value the way Hive readers expect: months and
/// days zero-padded, everything else verbatim.
fn partition_segment(col: &CanonicalCol, value: &AnyValue) -> String {
    let raw = match value {
        AnyValue::String(s) => s.to_string(),
        AnyValue::StringOwned(s) => s.to_string(),
        other => other.to_string(),
    };
    match col {
        CanonicalCol::Month | CanonicalCol::Day => match raw.parse::<u32>() {
            Ok(n) => format!("{n:02}"),
            Err(_) => raw,
        },
        _ => raw,
    }
}
