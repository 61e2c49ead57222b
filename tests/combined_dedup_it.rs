mod common;

use std::{collections::HashSet, sync::Arc};

use chrono::NaiveDate;
use common::{
    StubFetcher, StubResponse, bse_csv, bse_row, nse_csv, nse_row, test_config,
};
use mandi::{PipelineKernel, PipelineKind, RunStatus, Source};
use polars::prelude::{ParquetReader, SerReader};

fn trade_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 15).expect("date")
}

/// Cross-source dedup: NSE rows all survive; BSE contributes only the
/// ISINs NSE does not cover, and overlapping ISINs carry NSE's values.
#[tokio::test]
async fn combined_run_dedups_by_isin_preferring_nse() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());

    // 5 NSE rows; 4 BSE rows with 3 overlapping ISINs -> 5 + 1 = 6.
    let nse_rows: Vec<String> = (0..5)
        .map(|i| {
            nse_row(
                &format!("NSE{i}"),
                &format!("{i}"),
                &format!("INE00{i}A01010"),
                100.0,
                110.0,
                95.0,
                105.0,
            )
        })
        .collect();
    let bse_rows: Vec<String> = vec![
        bse_row("500000", "NSE0", "INE000A01010", 99.0),
        bse_row("500001", "NSE1", "INE001A01010", 99.0),
        bse_row("500002", "NSE2", "INE002A01010", 99.0),
        bse_row("500003", "BSEONLY", "INE777B01010", 42.0),
    ];

    let fetcher = Arc::new(StubFetcher::new());
    fetcher.push(Source::NseEqBar, StubResponse::Payload(nse_csv(&nse_rows)));
    fetcher.push(Source::BseEqBar, StubResponse::Payload(bse_csv(&bse_rows)));

    let kernel = PipelineKernel::new(config, fetcher);
    let run = kernel.run(PipelineKind::CombinedEquity, trade_date()).await;
    assert_eq!(run.status, Some(RunStatus::Success));

    let output = dir
        .path()
        .join("lake/normalized/equity_ohlc/year=2024/month=01/day=15/combined_20240115.parquet");
    let frame = ParquetReader::new(std::fs::File::open(&output).expect("open"))
        .finish()
        .expect("read parquet");
    assert_eq!(frame.height(), 6);

    let isin_col = frame
        .column("isin")
        .and_then(|c| c.str().cloned())
        .expect("isin column");
    let isins: Vec<&str> = isin_col.iter().flatten().collect();
    let distinct: HashSet<&&str> = isins.iter().collect();
    assert_eq!(distinct.len(), isins.len(), "duplicate ISIN survived");

    // The overlapping ISINs carry NSE's close, not BSE's.
    let exchange_col = frame
        .column("exchange")
        .and_then(|c| c.str().cloned())
        .expect("exchange column");
    let close_col = frame
        .column("close")
        .and_then(|c| c.f64().cloned())
        .expect("close column");
    for ((isin, exchange), close) in isin_col
        .iter()
        .zip(exchange_col.iter())
        .zip(close_col.iter())
    {
        if let Some(isin) = isin
            && isin.starts_with("INE00")
        {
            assert_eq!(exchange, Some("NSE"), "{isin}");
            assert_eq!(close, Some(105.0), "{isin}");
        }
    }
}

/// One failed exchange degrades the combined run instead of failing it.
#[tokio::test]
async fn combined_run_tolerates_a_missing_source() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());

    let fetcher = Arc::new(StubFetcher::new());
    fetcher.push(
        Source::NseEqBar,
        StubResponse::Payload(nse_csv(&[nse_row(
            "RELIANCE",
            "2885",
            "INE002A01018",
            2900.0,
            2950.0,
            2880.0,
            2940.0,
        )])),
    );
    fetcher.push(Source::BseEqBar, StubResponse::NotFound);

    let kernel = PipelineKernel::new(config, fetcher);
    let run = kernel.run(PipelineKind::CombinedEquity, trade_date()).await;
    assert_eq!(run.status, Some(RunStatus::Success));
    assert_eq!(run.rows_written(), 1);
}
