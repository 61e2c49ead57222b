mod common;

use std::sync::Arc;

use bytes::Bytes;
use chrono::NaiveDate;
use common::{StubFetcher, StubResponse, nse_csv, nse_row, test_config};
use mandi::{PipelineKernel, PipelineKind, RunStatus, Source, idempotency::MarkerStore};
use polars::prelude::{ParquetReader, SerReader};

fn trade_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 10).expect("date")
}

fn actions_csv() -> Bytes {
    Bytes::from(
        "Symbol,Company Name,Series,Face Value,Purpose,Ex-Date,Record Date\n\
         RELIANCE,Reliance Industries,EQ,10,\
         \"Face Value Split (Sub-Division) - From Rs 10/- Per Share To Rs 5/- Per Share\",\
         15-Jan-2024,16-Jan-2024\n\
         TCS,Tata Consultancy,EQ,1,Bonus 1:1,20-Jan-2024,21-Jan-2024\n"
            .to_string(),
    )
}

#[tokio::test]
async fn disclosures_land_in_the_reference_lake() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let fetcher = Arc::new(StubFetcher::new());
    fetcher.push(
        Source::NseCorporateActions,
        StubResponse::Payload(actions_csv()),
    );

    let kernel = PipelineKernel::new(config, fetcher);
    let run = kernel.run(PipelineKind::CorporateActions, trade_date()).await;
    assert_eq!(run.status, Some(RunStatus::Success));
    assert_eq!(run.rows_written(), 2);

    let output = dir
        .path()
        .join("lake/reference/corporate_actions/year=2024/month=01/day=10/actions_20240110.parquet");
    assert!(output.exists(), "reference file missing");

    let frame = ParquetReader::new(std::fs::File::open(&output).expect("open"))
        .finish()
        .expect("read parquet");
    let factors = frame
        .column("adjustment_factor")
        .and_then(|c| c.f64().cloned())
        .expect("factor column");
    assert_eq!(factors.get(0), Some(2.0)); // split Rs 10 -> Rs 5
    assert_eq!(factors.get(1), Some(2.0)); // bonus 1:1

    let marker = MarkerStore::new()
        .read(&output, "2024-01-10")
        .expect("marker exists");
    assert_eq!(marker.rows, 2);
}

#[tokio::test]
async fn equity_bars_before_an_ex_date_are_repriced() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());

    let fetcher = Arc::new(StubFetcher::new());
    fetcher.push(
        Source::NseEqBar,
        StubResponse::Payload(nse_csv(&[
            nse_row("RELIANCE", "2885", "INE002A01018", 2500.0, 2550.0, 2480.0, 2520.0),
            nse_row("INFY", "1594", "INE009A01021", 1600.0, 1625.0, 1595.0, 1620.0),
        ])),
    );
    fetcher.push(
        Source::NseCorporateActions,
        StubResponse::Payload(actions_csv()),
    );

    let kernel = PipelineKernel::new(config, fetcher);
    let run = kernel.run(PipelineKind::EquityDaily, trade_date()).await;
    assert_eq!(run.status, Some(RunStatus::Success));

    let output = dir
        .path()
        .join("lake/normalized/equity_ohlc/year=2024/month=01/day=10/bhavcopy_20240110.parquet");
    let frame = ParquetReader::new(std::fs::File::open(&output).expect("open"))
        .finish()
        .expect("read parquet");

    let closes = frame
        .column("close")
        .and_then(|c| c.f64().cloned())
        .expect("close column");
    let factors = frame
        .column("adjustment_factor")
        .and_then(|c| c.f64().cloned())
        .expect("factor column");

    // RELIANCE splits on the 15th: the bar on the 10th is divided by 2
    // and carries the factor; INFY has no action and stays neutral.
    assert_eq!(closes.get(0), Some(1260.0));
    assert_eq!(factors.get(0), Some(2.0));
    assert_eq!(closes.get(1), Some(1620.0));
    assert_eq!(factors.get(1), Some(1.0));

    let dates = frame.column("adjustment_date").expect("date column");
    assert_eq!(dates.null_count(), 1);
}

#[tokio::test]
async fn missing_disclosure_feed_leaves_bars_neutral() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());

    let fetcher = Arc::new(StubFetcher::new());
    fetcher.push(
        Source::NseEqBar,
        StubResponse::Payload(nse_csv(&[nse_row(
            "RELIANCE",
            "2885",
            "INE002A01018",
            2500.0,
            2550.0,
            2480.0,
            2520.0,
        )])),
    );
    // No corporate-actions response queued: the feed 404s.

    let kernel = PipelineKernel::new(config, fetcher);
    let run = kernel.run(PipelineKind::EquityDaily, trade_date()).await;
    assert_eq!(run.status, Some(RunStatus::Success));

    let output = dir
        .path()
        .join("lake/normalized/equity_ohlc/year=2024/month=01/day=10/bhavcopy_20240110.parquet");
    let frame = ParquetReader::new(std::fs::File::open(&output).expect("open"))
        .finish()
        .expect("read parquet");

    let factors = frame
        .column("adjustment_factor")
        .and_then(|c| c.f64().cloned())
        .expect("factor column");
    assert_eq!(factors.get(0), Some(1.0));
}
