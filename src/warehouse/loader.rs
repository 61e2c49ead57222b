use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use polars::prelude::{DataFrame, ParquetReader, SerReader};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    config::WarehouseConfig,
    error::{DataError, IntegrationError, MandiResult},
    metrics,
    warehouse::{
        ClickHouseClient, ColumnMeta, WarehouseTable,
        coerce::{coerce_value, parse_column_type},
        mappings::{map_column, required_columns},
    },
};

#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    pub batch_size: usize,
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            batch_size: 100_000,
            attempts: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

impl LoadOptions {
    pub fn from_config(config: &WarehouseConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            attempts: config.insert_attempts,
            backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadReport {
    pub table: WarehouseTable,
    pub rows: u64,
    pub batches: usize,
    pub duration: Duration,
    /// True when cancellation stopped the load between batches.
    pub truncated: bool,
}

/// Column-mapped, type-coerced bulk loader into the OLAP warehouse.
///
/// The loader introspects each target table, applies the static name
/// mapping, aligns every row to the warehouse column order and coerces
/// values per column type. It never deletes prior data; replays rely on
/// the table engine's merge-on-key semantics.
pub struct WarehouseLoader {
    client: ClickHouseClient,
    options: LoadOptions,
}

impl WarehouseLoader {
    pub fn new(client: ClickHouseClient, options: LoadOptions) -> Self {
        Self { client, options }
    }

    pub fn from_config(config: &WarehouseConfig) -> MandiResult<Self> {
        Ok(Self::new(
            ClickHouseClient::new(config.clone())?,
            LoadOptions::from_config(config),
        ))
    }

    /// Load one normalized frame into `table`.
    ///
    /// Cancellation is cooperative: the in-flight batch completes and
    /// subsequent batches are skipped.
    #[tracing::instrument(skip_all, fields(table = %table, rows = df.height()))]
    pub async fn load_frame(
        &self,
        df: &DataFrame,
        table: WarehouseTable,
        cancel: Option<&CancellationToken>,
    ) -> MandiResult<LoadReport> {
        let started = Instant::now();
        let columns = self.client.columns(table).await?;
        let rows = build_rows(df, table, &columns)?;

        let mut inserted = 0u64;
        let mut batches = 0usize;
        let mut truncated = false;

        for chunk in rows.chunks(self.options.batch_size.max(1)) {
            if let Some(cancel) = cancel
                && cancel.is_cancelled()
            {
                tracing::warn!(inserted, "load_cancelled_between_batches");
                truncated = true;
                break;
            }

            self.insert_with_retry(table, chunk).await?;
            inserted += chunk.len() as u64;
            batches += 1;
        }

        let report = LoadReport {
            table,
            rows: inserted,
            batches,
            duration: started.elapsed(),
            truncated,
        };

        metrics::clickhouse_load(table.as_str(), true);
        tracing::info!(
            rows = report.rows,
            batches = report.batches,
            duration_ms = report.duration.as_millis() as u64,
            "clickhouse_load_complete"
        );
        Ok(report)
    }

    /// Load every Parquet file under `source` (recursively) into
    /// `table`.
    #[tracing::instrument(skip_all, fields(table = %table, source = %source.display()))]
    pub async fn load_parquet(
        &self,
        source: &Path,
        table: WarehouseTable,
        cancel: Option<&CancellationToken>,
    ) -> MandiResult<LoadReport> {
        let started = Instant::now();
        let files = find_parquet_files(source)?;
        if files.is_empty() {
            return Err(DataError::FileSystem(format!(
                "no Parquet files found in {}",
                source.display()
            ))
            .into());
        }

        let mut rows = 0u64;
        let mut batches = 0usize;
        let mut truncated = false;
        for path in files {
            let file = fs::File::open(&path).map_err(DataError::Io)?;
            let frame = ParquetReader::new(file)
                .finish()
                .map_err(|e| DataError::Frame(e.to_string()))?;
            tracing::info!(file = %path.display(), rows = frame.height(), "loading_parquet_file");

            let report = self.load_frame(&frame, table, cancel).await?;
            rows += report.rows;
            batches += report.batches;
            if report.truncated {
                truncated = true;
                break;
            }
        }

        Ok(LoadReport {
            table,
            rows,
            batches,
            duration: started.elapsed(),
            truncated,
        })
    }

    /// Linear backoff: attempt n sleeps n * backoff before retrying
    /// transient insert failures.
    async fn insert_with_retry(
        &self,
        table: WarehouseTable,
        rows: &[Map<String, Value>],
    ) -> MandiResult<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.client.insert_batch(table, rows).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.options.attempts => {
                    let sleep = self.options.backoff * attempt;
                    tracing::warn!(
                        attempt,
                        backoff_ms = sleep.as_millis() as u64,
                        error = %e,
                        "insert_retrying"
                    );
                    tokio::time::sleep(sleep).await;
                }
                Err(e) => {
                    metrics::clickhouse_load(table.as_str(), false);
                    return Err(e);
                }
            }
        }
    }
}

/// Align a frame to the warehouse column order, applying the table's
/// name mapping and per-type coercion. Fails fatally when a required
/// warehouse column has no source after mapping.
pub(crate) fn build_rows(
    df: &DataFrame,
    table: WarehouseTable,
    columns: &[ColumnMeta],
) -> MandiResult<Vec<Map<String, Value>>> {
    // warehouse column name -> source frame column (post-mapping).
    let mut sources: Vec<Option<&str>> = Vec::with_capacity(columns.len());
    let frame_columns: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|n| n.to_string())
        .collect();

    for meta in columns {
        let source = frame_columns
            .iter()
            .find(|frame_col| map_column(table, frame_col) == meta.name)
            .map(String::as_str);
        sources.push(source);
    }

    let missing: Vec<String> = required_columns(table)
        .iter()
        .filter(|required| {
            !columns
                .iter()
                .zip(&sources)
                .any(|(meta, source)| meta.name == **required && source.is_some())
        })
        .map(|c| c.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(IntegrationError::MissingColumns {
            table: table.to_string(),
            columns: missing,
        }
        .into());
    }

    let types: Vec<_> = columns
        .iter()
        .map(|meta| parse_column_type(&meta.column_type))
        .collect();

    let mut rows = Vec::with_capacity(df.height());
    for row_idx in 0..df.height() {
        let mut row = Map::with_capacity(columns.len());
        for ((meta, source), column_type) in columns.iter().zip(&sources).zip(&types) {
            let value = match source {
                Some(frame_col) => {
                    let av = df
                        .column(frame_col)
                        .and_then(|c| c.get(row_idx))
                        .map_err(|e| DataError::Frame(e.to_string()))?;
                    coerce_value(&av, column_type)
                }
                None => coerce_value(&polars::prelude::AnyValue::Null, column_type),
            };
            row.insert(meta.name.clone(), value);
        }
        rows.push(row);
    }

    Ok(rows)
}

fn find_parquet_files(path: &Path) -> MandiResult<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    collect(path, &mut files)?;
    files.sort();
    return Ok(files);

    fn collect(dir: &Path, out: &mut Vec<PathBuf>) -> MandiResult<()> {
        for entry in fs::read_dir(dir).map_err(DataError::Io)? {
            let entry = entry.map_err(DataError::Io)?;
            let path = entry.path();
            if path.is_dir() {
                collect(&path, out)?;
            } else {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.ends_with(".parquet") && !name.starts_with('_') && !name.starts_with('.') {
                    out.push(path);
                }
            }
        }
        Ok(())
    }
}
