use std::{env, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, MandiResult};

/// Top-level application configuration.
///
/// Loaded once at startup from environment variables (optionally
/// overridden by a JSON config file) and shared immutably via `Arc`.
/// Nothing mutates configuration at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MandiConfig {
    pub storage: StorageConfig,
    pub warehouse: WarehouseConfig,
    pub metrics: MetricsConfig,
    pub pipeline: PipelineConfig,
}

impl MandiConfig {
    /// Resolve configuration from the process environment.
    ///
    /// Recognized variables: `CLICKHOUSE_{HOST,PORT,USER,PASSWORD,DATABASE}`,
    /// `METRICS_PORT`, `MANDI_DATA_DIR`, `MANDI_DEADLINE_SECS`,
    /// `MLFLOW_TRACKING_URI` (parsed and logged, otherwise unused).
    pub fn from_env() -> MandiResult<Self> {
        Ok(Self {
            storage: StorageConfig::from_env()?,
            warehouse: WarehouseConfig::from_env()?,
            metrics: MetricsConfig::from_env()?,
            pipeline: PipelineConfig::from_env()?,
        })
    }

    /// Parse a JSON config file produced by operations tooling.
    pub fn from_json(raw: &str) -> MandiResult<Self> {
        serde_json::from_str(raw).map_err(|e| {
            ConfigError::InvalidValue {
                key: "config_file".to_string(),
                value: String::new(),
                msg: e.to_string(),
            }
            .into()
        })
    }
}

/// Data-lake storage layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the lake; layers (`raw`, `normalized`,
    /// `features`, `reference`) live directly below it.
    pub data_dir: PathBuf,

    /// Sibling directory receiving quarantined rows and the validation
    /// audit log.
    pub quarantine_dir: PathBuf,
}

impl StorageConfig {
    fn from_env() -> MandiResult<Self> {
        let data_dir =
            PathBuf::from(env::var("MANDI_DATA_DIR").unwrap_or_else(|_| "data/lake".to_string()));
        let quarantine_dir = data_dir
            .parent()
            .map(|p| p.join("quarantine"))
            .unwrap_or_else(|| PathBuf::from("data/quarantine"));
        Ok(Self {
            data_dir,
            quarantine_dir,
        })
    }
}

/// ClickHouse connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    pub host: String,
    /// Configured port. The native TCP port (9000) is probed and falls
    /// back to the HTTP companion port; any other value is used as the
    /// HTTP port directly.
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Rows per insert batch.
    pub batch_size: usize,
    /// Insert attempts before giving up (linear backoff between them).
    pub insert_attempts: u32,
}

impl WarehouseConfig {
    fn from_env() -> MandiResult<Self> {
        Ok(Self {
            host: env::var("CLICKHOUSE_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: parse_env_or("CLICKHOUSE_PORT", 8123)?,
            user: env::var("CLICKHOUSE_USER").unwrap_or_else(|_| "default".to_string()),
            password: env::var("CLICKHOUSE_PASSWORD").unwrap_or_default(),
            database: env::var("CLICKHOUSE_DATABASE")
                .unwrap_or_else(|_| "mandi_market".to_string()),
            batch_size: 100_000,
            insert_attempts: 3,
        })
    }

    /// HTTP endpoint used for both metadata queries and inserts.
    ///
    /// When the configured port is the native TCP port, inserts go
    /// through the HTTP companion port instead.
    pub fn http_url(&self) -> String {
        let port = if self.port == 9000 { 8123 } else { self.port };
        format!("http://{}:{}", self.host, port)
    }
}

/// Prometheus scrape endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub port: u16,
}

impl MetricsConfig {
    fn from_env() -> MandiResult<Self> {
        Ok(Self {
            port: parse_env_or("METRICS_PORT", 9090)?,
        })
    }
}

/// Cross-pipeline execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Wall-clock budget per pipeline run.
    pub run_deadline: Duration,

    /// Bounded worker pool size for symbol-keyed parallel fetches.
    pub fetch_workers: usize,

    /// Abort a lake write when pre-write validation reports critical
    /// failures.
    pub fail_on_validation_errors: bool,

    /// Threshold for the `price_continuity` warning rule.
    pub max_price_change_pct: f64,

    /// Recorded for parity with the deployment environment; the tracking
    /// integration itself is not part of this crate.
    pub mlflow_tracking_uri: Option<String>,
}

impl PipelineConfig {
    fn from_env() -> MandiResult<Self> {
        let deadline_secs: u64 = parse_env_or("MANDI_DEADLINE_SECS", 30 * 60)?;
        Ok(Self {
            run_deadline: Duration::from_secs(deadline_secs),
            fetch_workers: 4,
            fail_on_validation_errors: true,
            max_price_change_pct: 0.20,
            mlflow_tracking_uri: env::var("MLFLOW_TRACKING_URI").ok(),
        })
    }
}

fn parse_env_or<T>(key: &str, default: T) -> MandiResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| {
            ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
                msg: e.to_string(),
            }
            .into()
        }),
        Err(_) => Ok(default),
    }
}
