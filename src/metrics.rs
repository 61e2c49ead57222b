use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{MandiResult, SystemError};

// ================================================================================================
// Series names
// ================================================================================================

pub const FILES_DOWNLOADED: &str = "files_downloaded";
pub const ROWS_PARSED: &str = "rows_parsed";
pub const PARQUET_WRITE_SUCCESS: &str = "parquet_write_success";
pub const PARQUET_WRITE_FAILED: &str = "parquet_write_failed";
pub const CLICKHOUSE_LOAD_SUCCESS: &str = "clickhouse_load_success";
pub const CLICKHOUSE_LOAD_FAILED: &str = "clickhouse_load_failed";
pub const FLOW_DURATION: &str = "flow_duration";

// ================================================================================================
// Recorder
// ================================================================================================

/// Install the global Prometheus recorder and expose `GET /metrics`
/// on `0.0.0.0:{port}`.
///
/// Must be called once, before any pipeline runs; the registry itself
/// is the only process-wide mutable singleton in the crate.
pub fn install_recorder(port: u16) -> MandiResult<()> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| SystemError::Metrics(e.to_string()))?;
    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    describe_counter!(FILES_DOWNLOADED, "Raw files fetched per source");
    describe_counter!(ROWS_PARSED, "Rows emitted by parsers, by source and status");
    describe_counter!(PARQUET_WRITE_SUCCESS, "Successful lake writes per table");
    describe_counter!(PARQUET_WRITE_FAILED, "Failed lake writes per table");
    describe_counter!(CLICKHOUSE_LOAD_SUCCESS, "Successful warehouse loads per table");
    describe_counter!(CLICKHOUSE_LOAD_FAILED, "Failed warehouse loads per table");
    describe_histogram!(FLOW_DURATION, "Pipeline run duration in seconds");
}

// ================================================================================================
// Recording helpers
// ================================================================================================

pub fn file_downloaded(source: &str) {
    counter!(FILES_DOWNLOADED, "source" => source.to_string()).increment(1);
}

pub fn rows_parsed(source: &str, status: &str, rows: u64) {
    counter!(ROWS_PARSED, "source" => source.to_string(), "status" => status.to_string())
        .increment(rows);
}

pub fn parquet_write(table: &str, success: bool) {
    let name = if success {
        PARQUET_WRITE_SUCCESS
    } else {
        PARQUET_WRITE_FAILED
    };
    counter!(name, "table" => table.to_string()).increment(1);
}

pub fn clickhouse_load(table: &str, success: bool) {
    let name = if success {
        CLICKHOUSE_LOAD_SUCCESS
    } else {
        CLICKHOUSE_LOAD_FAILED
    };
    counter!(name, "table" => table.to_string()).increment(1);
}

pub fn flow_duration(flow_name: &str, status: &str, elapsed: Duration) {
    histogram!(
        FLOW_DURATION,
        "flow_name" => flow_name.to_string(),
        "status" => status.to_string()
    )
    .record(elapsed.as_secs_f64());
}
