use std::num::{ParseFloatError, ParseIntError};

use thiserror::Error;

pub type MandiResult<T> = Result<T, MandiError>;

#[derive(Debug, Error)]
pub enum MandiError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Integration(#[from] IntegrationError),

    /// The named circuit breaker is OPEN; the wrapped call was not invoked.
    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error(transparent)]
    System(#[from] SystemError),
}

impl MandiError {
    /// Whether the operation that produced this error may be retried.
    ///
    /// Retry-vs-fatal is a pure function of the error value: the retry
    /// policy never inspects anything beyond this classification.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(e) => e.is_retryable(),
            Self::Integration(e) => e.is_retryable(),
            Self::Data(e) => e.is_retryable(),
            // Open breakers recover on the breaker's own timescale, not
            // within a single retry loop.
            Self::CircuitOpen(_) => false,
            Self::Config(_) | Self::Parse(_) | Self::Validation(_) | Self::System(_) => false,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }
}

/// Errors raised while loading or interpreting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for {key}: '{value}': {msg}")]
    InvalidValue {
        key: String,
        value: String,
        msg: String,
    },

    #[error("Unknown pipeline: '{0}'")]
    UnknownPipeline(String),

    #[error("Unknown source: '{0}'")]
    UnknownSource(String),

    #[error("Failed to parse enum: {0}")]
    ParseEnum(#[from] strum::ParseError),
}

/// Transport-level failures talking to an upstream source.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Request to {url} failed: {msg}")]
    Transport { url: String, msg: String },

    #[error("Request to {url} timed out")]
    Timeout { url: String },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Rate limited by {url}")]
    RateLimited { url: String },

    #[error("Deadline exceeded before request to {0}")]
    DeadlineExceeded(String),
}

impl NetworkError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } | Self::RateLimited { .. } => true,
            // 5xx is a server fault; 4xx means the request itself is wrong.
            Self::Status { status, .. } => *status >= 500,
            Self::DeadlineExceeded(_) => false,
        }
    }
}

/// Errors converting raw source bytes into a normalized frame.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error(
        "Schema drift for {source_name}: missing columns {missing:?}, unexpected columns {extra:?}"
    )]
    SchemaDrift {
        source_name: String,
        missing: Vec<String>,
        extra: Vec<String>,
    },

    #[error("Malformed {source_name} payload: {msg}")]
    MalformedPayload { source_name: String, msg: String },

    #[error("Archive error for {source_name}: {msg}")]
    Archive { source_name: String, msg: String },

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Invalid date '{value}': {msg}")]
    InvalidDate { value: String, msg: String },

    #[error("Failed to parse integer: {0}")]
    ParseInt(#[from] ParseIntError),

    #[error("Failed to parse float: {0}")]
    ParseFloat(#[from] ParseFloatError),
}

/// Declarative rule violations over a frame.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(
        "Validation failed for {schema_name}: {critical_failures} critical errors out of {total_rows} rows"
    )]
    CriticalFailures {
        schema_name: String,
        critical_failures: usize,
        total_rows: usize,
    },

    #[error("Unknown validation schema: '{0}'")]
    UnknownSchema(String),

    #[error("Duplicate custom rule: '{0}'")]
    DuplicateRule(String),
}

/// I/O and frame-manipulation failures on the output side.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("IO operation failed")]
    Io(#[from] std::io::Error),

    #[error("Data frame error: {0}")]
    Frame(String),

    #[error("Serialization failed")]
    Json(#[from] serde_json::Error),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Empty frame: {0}")]
    EmptyFrame(String),
}

impl DataError {
    fn is_retryable(&self) -> bool {
        match self {
            // ENOSPC cannot be retried away; everything else on the
            // filesystem is assumed transient.
            Self::Io(e) => e.raw_os_error() != Some(28),
            Self::FileSystem(_) => true,
            Self::Frame(_) | Self::Json(_) | Self::EmptyFrame(_) => false,
        }
    }
}

/// Failures of the warehouse integration.
#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("ClickHouse connection failed: {0}")]
    Connect(String),

    #[error("ClickHouse insert into {table} failed: {msg}")]
    Insert { table: String, msg: String },

    #[error("Failed to introspect table {table}: {msg}")]
    Introspection { table: String, msg: String },

    #[error("Table {table} is missing required columns after mapping: {columns:?}")]
    MissingColumns { table: String, columns: Vec<String> },

    #[error("Unsupported warehouse table: '{0}'")]
    UnsupportedTable(String),
}

impl IntegrationError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Insert { .. } | Self::Introspection { .. } => true,
            Self::MissingColumns { .. } | Self::UnsupportedTable(_) => false,
        }
    }
}

/// Errors related to internal invariants, joins, and bugs.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Worker task failed: {0}")]
    Join(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Missing internal field: {0}")]
    MissingField(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Metrics exporter error: {0}")]
    Metrics(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable_client_errors_are_not() {
        let e = MandiError::from(NetworkError::Status {
            url: "https://www.nseindia.com".to_string(),
            status: 503,
        });
        assert!(e.is_retryable());

        let e = MandiError::from(NetworkError::Status {
            url: "https://www.nseindia.com".to_string(),
            status: 403,
        });
        assert!(!e.is_retryable());

        let e = MandiError::from(NetworkError::RateLimited {
            url: "https://www.nseindia.com".to_string(),
        });
        assert!(e.is_retryable());
    }

    #[test]
    fn enospc_is_fatal_other_io_is_retryable() {
        let enospc = std::io::Error::from_raw_os_error(28);
        assert!(!MandiError::from(DataError::Io(enospc)).is_retryable());

        let eagain = std::io::Error::from_raw_os_error(11);
        assert!(MandiError::from(DataError::Io(eagain)).is_retryable());
    }

    #[test]
    fn breaker_open_skips_the_retry_loop() {
        let e = MandiError::CircuitOpen("NSE_EQ_BAR".to_string());
        assert!(e.is_circuit_open());
        assert!(!e.is_retryable());
    }

    #[test]
    fn schema_drift_is_fatal() {
        let e = MandiError::from(ParseError::SchemaDrift {
            source_name: "BSE_EQ_BAR".to_string(),
            missing: vec!["SC_CODE".to_string()],
            extra: vec![],
        });
        assert!(!e.is_retryable());
    }
}
