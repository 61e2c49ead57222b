use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{DataError, MandiResult},
    validate::ValidationResult,
};

/// One validation run, as appended to the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub schema_name: String,
    pub total_rows: usize,
    pub valid_rows: usize,
    pub critical_failures: usize,
    pub warnings: usize,
}

/// Append-only JSONL log of validation outcomes, colocated with the
/// quarantine directory so operators find failures and their history in
/// one place.
#[derive(Debug, Clone)]
pub struct AuditLog {
    root: PathBuf,
}

impl AuditLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn log_path(&self) -> PathBuf {
        self.root.join("validation_audit.jsonl")
    }

    pub fn append(&self, schema_name: &str, result: &ValidationResult) -> MandiResult<()> {
        let entry = AuditEntry {
            timestamp: result.timestamp,
            schema_name: schema_name.to_string(),
            total_rows: result.total_rows,
            valid_rows: result.valid_rows,
            critical_failures: result.critical_failures,
            warnings: result.warnings,
        };

        fs::create_dir_all(&self.root).map_err(DataError::Io)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .map_err(DataError::Io)?;
        let line = serde_json::to_string(&entry).map_err(DataError::Json)?;
        writeln!(file, "{line}").map_err(DataError::Io)?;
        Ok(())
    }

    /// Entries from the trailing window. Unparseable lines are skipped;
    /// a missing log is an empty history, not an error.
    pub fn load(&self, days: i64) -> MandiResult<Vec<AuditEntry>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let cutoff = Utc::now() - Duration::days(days);
        let raw = fs::read_to_string(&path).map_err(DataError::Io)?;
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str::<AuditEntry>(line).ok())
            .filter(|e| e.timestamp >= cutoff)
            .collect())
    }

    pub fn daily_report(&self, days: i64) -> MandiResult<DailyReport> {
        let entries = self.load(days)?;

        let mut per_schema: BTreeMap<String, SchemaSummary> = BTreeMap::new();
        for entry in &entries {
            let summary = per_schema
                .entry(entry.schema_name.clone())
                .or_insert_with(|| SchemaSummary {
                    schema_name: entry.schema_name.clone(),
                    runs: 0,
                    total_rows: 0,
                    critical_failures: 0,
                    warnings: 0,
                    pass_rate: 1.0,
                });
            summary.runs += 1;
            summary.total_rows += entry.total_rows;
            summary.critical_failures += entry.critical_failures;
            summary.warnings += entry.warnings;
        }
        for summary in per_schema.values_mut() {
            summary.pass_rate = if summary.total_rows == 0 {
                1.0
            } else {
                1.0 - summary.critical_failures as f64 / summary.total_rows as f64
            };
        }

        Ok(DailyReport {
            generated_at: Utc::now(),
            window_days: days,
            runs: entries.len(),
            per_schema: per_schema.into_values().collect(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSummary {
    pub schema_name: String,
    pub runs: usize,
    pub total_rows: usize,
    pub critical_failures: usize,
    pub warnings: usize,
    pub pass_rate: f64,
}

/// Aggregated view over the audit window, one block per schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyReport {
    pub generated_at: DateTime<Utc>,
    pub window_days: i64,
    pub runs: usize,
    pub per_schema: Vec<SchemaSummary>,
}

impl DailyReport {
    pub fn format(&self) -> String {
        let mut out = format!(
            "Validation report ({} runs over {} days)\n",
            self.runs, self.window_days
        );
        for s in &self.per_schema {
            out.push_str(&format!(
                "  {}: {} runs, {} rows, {} critical, {} warnings, pass rate {:.2}%\n",
                s.schema_name,
                s.runs,
                s.total_rows,
                s.critical_failures,
                s.warnings,
                s.pass_rate * 100.0
            ));
        }
        out
    }
}
