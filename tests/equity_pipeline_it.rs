mod common;

use std::sync::Arc;

use chrono::NaiveDate;
use common::{StubFetcher, StubResponse, nse_csv, nse_row, nse_three_symbol_fixture, test_config};
use mandi::{
    PipelineKernel, PipelineKind, RunStatus, Source,
    idempotency::MarkerStore,
};
use polars::prelude::{ParquetReader, SerReader};

fn trade_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 15).expect("date")
}

#[tokio::test]
async fn happy_path_writes_partition_marker_and_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let fetcher = Arc::new(StubFetcher::new());
    fetcher.push(
        Source::NseEqBar,
        StubResponse::Payload(nse_three_symbol_fixture()),
    );

    let kernel = PipelineKernel::new(config, fetcher);
    let run = kernel.run(PipelineKind::EquityDaily, trade_date()).await;

    assert_eq!(run.status, Some(RunStatus::Success));
    assert_eq!(run.rows_written(), 3);

    let output = dir
        .path()
        .join("lake/normalized/equity_ohlc/year=2024/month=01/day=15/bhavcopy_20240115.parquet");
    assert!(output.exists(), "partition file missing");

    let frame = ParquetReader::new(std::fs::File::open(&output).expect("open"))
        .finish()
        .expect("read parquet");
    assert_eq!(frame.height(), 3);

    let marker = MarkerStore::new()
        .read(&output, "2024-01-15")
        .expect("marker exists");
    assert_eq!(marker.rows, 3);

    // No quarantine output for a clean frame.
    assert!(
        !dir.path()
            .join("quarantine/normalized_equity_ohlc_failures.parquet")
            .exists()
    );
}

#[tokio::test]
async fn holiday_404_records_zero_row_marker_and_skips_thereafter() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let holiday = NaiveDate::from_ymd_opt(2024, 1, 26).expect("date");

    let fetcher = Arc::new(StubFetcher::new());
    fetcher.push(Source::NseEqBar, StubResponse::NotFound);
    fetcher.push(Source::NseEqBar, StubResponse::NotFound);

    let kernel = PipelineKernel::new(config, fetcher);

    let first = kernel.run(PipelineKind::EquityDaily, holiday).await;
    assert_eq!(first.status, Some(RunStatus::Success));

    let expected = dir
        .path()
        .join("lake/normalized/equity_ohlc/year=2024/month=01/day=26/bhavcopy_20240126.parquet");
    assert!(!expected.exists(), "no lake file for an empty day");

    let marker = MarkerStore::new()
        .read(&expected, "2024-01-26")
        .expect("marker exists");
    assert_eq!(marker.rows, 0);
    assert_eq!(
        marker.metadata.get("skipped").map(String::as_str),
        Some("download_failed")
    );

    let second = kernel.run(PipelineKind::EquityDaily, holiday).await;
    assert_eq!(second.status, Some(RunStatus::SkippedIdempotent));
}

#[tokio::test]
async fn ohlc_violation_quarantines_and_aborts_the_write() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());

    // open=90 below low=95: exactly one critical violation on `open`.
    let fetcher = Arc::new(StubFetcher::new());
    fetcher.push(
        Source::NseEqBar,
        StubResponse::Payload(nse_csv(&[nse_row(
            "BADBAR",
            "9999",
            "INE999Z01019",
            90.0,
            110.0,
            95.0,
            105.0,
        )])),
    );

    let kernel = PipelineKernel::new(config, fetcher);
    let run = kernel.run(PipelineKind::EquityDaily, trade_date()).await;
    assert_eq!(run.status, Some(RunStatus::Failed));

    let partition = dir
        .path()
        .join("lake/normalized/equity_ohlc/year=2024/month=01/day=15/bhavcopy_20240115.parquet");
    assert!(!partition.exists(), "aborted write must not leave a file");

    let quarantine = dir
        .path()
        .join("quarantine/normalized_equity_ohlc_failures.parquet");
    assert!(quarantine.exists(), "quarantine file missing");

    let failed = ParquetReader::new(std::fs::File::open(&quarantine).expect("open"))
        .finish()
        .expect("read quarantine");
    assert_eq!(failed.height(), 1);

    let errors = failed
        .column("validation_errors")
        .and_then(|c| c.str().cloned())
        .expect("errors column");
    let message = errors.get(0).expect("message");
    assert!(message.contains("open"), "message: {message}");

    let schema_col = failed
        .column("schema_name")
        .and_then(|c| c.str().cloned())
        .expect("schema column");
    assert_eq!(schema_col.get(0), Some("normalized_equity_ohlc"));
}
