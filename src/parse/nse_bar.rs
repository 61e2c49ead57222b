use std::{
    io::{Cursor, Read},
    sync::Arc,
};

use bytes::Bytes;
use polars::prelude::{
    DataFrame, DataType, Field, IntoLazy, Literal, NULL, NamedFrom, Schema, SchemaRef, col, lit,
};

use crate::{
    error::{DataError, MandiResult, ParseError},
    parse::{
        ParseContext, SourceParser, check_schema_drift, conform_to_schema, csv_header,
        days_since_epoch, envelope_literals, partition_literals, read_csv,
    },
    schema::{CanonicalCol, equity_bar_schema, event_id},
};

/// Parser for the NSE UDiFF common-market bhavcopy: a dated ZIP holding
/// one CSV with the full equity session.
///
/// The declared input schema is the exchange's column set; any deviation
/// is schema drift and fails the run before a single row is parsed.
pub struct NseBarParser;

const NSE_COLUMNS: [&str; 34] = [
    "TradDt",
    "BizDt",
    "Sgmt",
    "Src",
    "FinInstrmTp",
    "FinInstrmId",
    "ISIN",
    "TckrSymb",
    "SctySrs",
    "XpryDt",
    "FininstrmActlXpryDt",
    "StrkPric",
    "OptnTp",
    "FinInstrmNm",
    "OpnPric",
    "HghPric",
    "LwPric",
    "ClsPric",
    "LastPric",
    "PrvsClsgPric",
    "UndrlygPric",
    "SttlmPric",
    "OpnIntrst",
    "ChngInOpnIntrst",
    "TtlTradgVol",
    "TtlTrfVal",
    "TtlNbOfTxsExctd",
    "SsnId",
    "NewBrdLotQty",
    "Rmks",
    "Rsvd1",
    "Rsvd2",
    "Rsvd3",
    "Rsvd4",
];

fn input_schema() -> SchemaRef {
    let fields = NSE_COLUMNS.iter().map(|name| {
        let dtype = match *name {
            "OpnPric" | "HghPric" | "LwPric" | "ClsPric" | "LastPric" | "PrvsClsgPric"
            | "UndrlygPric" | "SttlmPric" | "StrkPric" | "TtlTrfVal" => DataType::Float64,
            "TtlTradgVol" | "TtlNbOfTxsExctd" | "OpnIntrst" | "ChngInOpnIntrst"
            | "NewBrdLotQty" => DataType::Int64,
            _ => DataType::String,
        };
        Field::new((*name).into(), dtype)
    });
    Arc::new(Schema::from_iter(fields))
}

/// Pull the CSV out of a bhavcopy payload. The archives endpoint serves
/// ZIP; some mirrors serve gzip or the bare CSV, so all three unwrap.
fn unwrap_zip(raw: &Bytes) -> MandiResult<Vec<u8>> {
    if raw.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = flate2::read::GzDecoder::new(raw.as_ref());
        let mut bytes = Vec::new();
        decoder.read_to_end(&mut bytes).map_err(|e| ParseError::Archive {
            source_name: "NSE_EQ_BAR".to_string(),
            msg: e.to_string(),
        })?;
        return Ok(bytes);
    }

    match zip::ZipArchive::new(Cursor::new(raw.as_ref())) {
        Ok(mut archive) => {
            let csv_name = (0..archive.len())
                .filter_map(|i| archive.by_index(i).ok().map(|f| f.name().to_string()))
                .find(|name| name.to_lowercase().ends_with(".csv"))
                .ok_or_else(|| ParseError::Archive {
                    source_name: "NSE_EQ_BAR".to_string(),
                    msg: "no CSV entry in archive".to_string(),
                })?;

            let mut entry = archive
                .by_name(&csv_name)
                .map_err(|e| ParseError::Archive {
                    source_name: "NSE_EQ_BAR".to_string(),
                    msg: e.to_string(),
                })?;
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes).map_err(DataError::Io)?;
            Ok(bytes)
        }
        Err(_) => Ok(raw.to_vec()),
    }
}

impl SourceParser for NseBarParser {
    fn declared_schema(&self) -> SchemaRef {
        equity_bar_schema()
    }

    #[tracing::instrument(skip_all, fields(trade_date = %ctx.trade_date))]
    fn parse(&self, raw: &Bytes, ctx: &ParseContext) -> MandiResult<DataFrame> {
        let csv = unwrap_zip(raw)?;

        let header = csv_header(&csv)?;
        check_schema_drift(ctx.source, &header, &input_schema())?;

        let df = read_csv(&csv, input_schema())?;
        let before = df.height();

        // Rows without a primary symbol are dropped here, not reported
        // as validation failures.
        let df = df
            .lazy()
            .filter(
                col("TckrSymb")
                    .is_not_null()
                    .and(col("TckrSymb").neq(lit(""))),
            )
            .collect()
            .map_err(|e| DataError::Frame(e.to_string()))?;

        tracing::info!(
            rows = df.height(),
            filtered = before - df.height(),
            "nse_bhavcopy_parsed"
        );

        let symbols = df
            .column("TckrSymb")
            .and_then(|c| c.str().cloned())
            .map_err(|e| DataError::Frame(e.to_string()))?;
        let series = df
            .column("SctySrs")
            .and_then(|c| c.str().cloned())
            .map_err(|e| DataError::Frame(e.to_string()))?;
        let instrument_ids = df
            .column("FinInstrmId")
            .and_then(|c| c.str().cloned())
            .map_err(|e| DataError::Frame(e.to_string()))?;

        let mut event_ids = Vec::with_capacity(df.height());
        let mut entity_ids = Vec::with_capacity(df.height());
        for ((symbol, srs), instrument_id) in symbols
            .iter()
            .zip(series.iter())
            .zip(instrument_ids.iter())
        {
            let symbol = symbol.unwrap_or_default();
            let srs = srs.unwrap_or_default();
            let instrument_id = instrument_id.unwrap_or_default();
            event_ids.push(event_id(
                ctx.source.as_str(),
                ctx.trade_date,
                &format!("{symbol}:{srs}"),
            ));
            entity_ids.push(format!("{symbol}:{instrument_id}:NSE"));
        }

        let df = df
            .lazy()
            .with_columns([
                polars::prelude::Series::new(CanonicalCol::EventId.name(), event_ids)
                    .lit()
                    .alias(CanonicalCol::EventId.name()),
                polars::prelude::Series::new(CanonicalCol::EntityId.name(), entity_ids)
                    .lit()
                    .alias(CanonicalCol::EntityId.name()),
            ])
            .with_columns(envelope_literals(ctx))
            .with_columns([
                col("FinInstrmId").alias(CanonicalCol::InstrumentId.name()),
                col("TckrSymb").alias(CanonicalCol::Symbol.name()),
                lit("NSE").alias(CanonicalCol::Exchange.name()),
                col("ISIN").alias(CanonicalCol::Isin.name()),
                col("FinInstrmTp").alias(CanonicalCol::InstrumentType.name()),
                col("SctySrs").alias(CanonicalCol::Series.name()),
                lit(days_since_epoch(ctx.trade_date))
                    .cast(DataType::Date)
                    .alias(CanonicalCol::TradeDate.name()),
                col("PrvsClsgPric").alias(CanonicalCol::PrevClose.name()),
                col("OpnPric").alias(CanonicalCol::Open.name()),
                col("HghPric").alias(CanonicalCol::High.name()),
                col("LwPric").alias(CanonicalCol::Low.name()),
                col("ClsPric").alias(CanonicalCol::Close.name()),
                col("LastPric").alias(CanonicalCol::LastPrice.name()),
                col("SttlmPric").alias(CanonicalCol::SettlementPrice.name()),
                col("TtlTradgVol").alias(CanonicalCol::Volume.name()),
                col("TtlTrfVal").alias(CanonicalCol::Turnover.name()),
                col("TtlNbOfTxsExctd").alias(CanonicalCol::Trades.name()),
                // Neutral until the corporate-actions repricing step.
                lit(1.0).alias(CanonicalCol::AdjustmentFactor.name()),
                lit(NULL)
                    .cast(DataType::Date)
                    .alias(CanonicalCol::AdjustmentDate.name()),
                lit(true).alias(CanonicalCol::IsTradingDay.name()),
            ])
            .with_columns(partition_literals(ctx.trade_date))
            .collect()
            .map_err(|e| DataError::Frame(e.to_string()))?;

        conform_to_schema(df, &self.declared_schema())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::fetch::Source;

    fn fixture_csv() -> String {
        let header = NSE_COLUMNS.join(",");
        let row = |symbol: &str, id: &str, isin: &str, o: f64, h: f64, l: f64, c: f64| {
            format!(
                "2024-01-15,2024-01-15,CM,NSE,STK,{id},{isin},{symbol},EQ,-,-,-,-,{symbol} LTD,\
                 {o},{h},{l},{c},{c},{pc},-,{c},0,0,1000,{to},50,F1,1,-,-,-,-,-",
                pc = o,
                to = c * 1000.0,
            )
        };
        format!(
            "{header}\n{}\n{}\n{}\n",
            row("RELIANCE", "2885", "INE002A01018", 2900.0, 2950.0, 2880.0, 2940.0),
            row("TCS", "11536", "INE467B01029", 3800.0, 3850.0, 3790.0, 3830.0),
            row("INFY", "1594", "INE009A01021", 1600.0, 1625.0, 1595.0, 1620.0),
        )
    }

    fn ctx() -> ParseContext {
        ParseContext::new(
            Source::NseEqBar,
            NaiveDate::from_ymd_opt(2024, 1, 15).expect("date"),
        )
    }

    #[test]
    fn parses_plain_csv_payload() {
        let raw = Bytes::from(fixture_csv());
        let df = NseBarParser.parse(&raw, &ctx()).expect("parse succeeds");
        assert_eq!(df.height(), 3);
        assert_eq!(&**df.schema(), &*equity_bar_schema());

        let symbol_col = df
            .column("symbol")
            .and_then(|c| c.str().cloned())
            .expect("symbol column");
        let symbols: Vec<Option<&str>> = symbol_col.iter().collect();
        assert_eq!(
            symbols,
            vec![Some("RELIANCE"), Some("TCS"), Some("INFY")]
        );
    }

    #[test]
    fn parses_zip_payload() {
        use std::io::Write;
        use zip::write::SimpleFileOptions;

        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            writer
                .start_file("BhavCopy_NSE_CM.csv", SimpleFileOptions::default())
                .expect("zip entry");
            writer
                .write_all(fixture_csv().as_bytes())
                .expect("zip body");
            writer.finish().expect("zip finish");
        }

        let df = NseBarParser
            .parse(&Bytes::from(buf), &ctx())
            .expect("zip parse succeeds");
        assert_eq!(df.height(), 3);
    }

    #[test]
    fn parses_gzip_payload() {
        use flate2::{Compression, write::GzEncoder};
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(fixture_csv().as_bytes())
            .expect("gzip body");
        let buf = encoder.finish().expect("gzip finish");

        let df = NseBarParser
            .parse(&Bytes::from(buf), &ctx())
            .expect("gzip parse succeeds");
        assert_eq!(df.height(), 3);
    }

    #[test]
    fn unknown_columns_are_schema_drift() {
        let raw = Bytes::from("TradDt,Mystery\n2024-01-15,1\n".to_string());
        let err = NseBarParser.parse(&raw, &ctx()).expect_err("drift fails");
        assert!(err.to_string().contains("Schema drift"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn event_ids_are_deterministic_across_runs() {
        let raw = Bytes::from(fixture_csv());
        let a = NseBarParser.parse(&raw, &ctx()).expect("first parse");
        let b = NseBarParser.parse(&raw, &ctx()).expect("second parse");
        assert_eq!(
            a.column("event_id").expect("ids").str().expect("str").get(0),
            b.column("event_id").expect("ids").str().expect("str").get(0),
        );
    }
}
