use std::sync::Arc;

use bytes::Bytes;
use polars::prelude::{
    DataFrame, DataType, Field, IntoLazy, Literal, NULL, NamedFrom, Schema, SchemaRef, Series,
    col, lit,
};

use crate::{
    error::{DataError, MandiResult},
    parse::{
        ParseContext, SourceParser, check_schema_drift, conform_to_schema, csv_header,
        days_since_epoch, envelope_literals, partition_literals, read_csv,
    },
    schema::{CanonicalCol, equity_bar_schema, event_id},
};

/// Parser for the BSE equity bhavcopy CSV.
///
/// BSE publishes its own 15-column layout; the parser unifies it onto
/// the canonical equity-bar schema so NSE and BSE frames deduplicate
/// and load identically. Fields BSE does not publish (settlement price,
/// instrument type) come out null.
pub struct BseBarParser;

const BSE_COLUMNS: [&str; 15] = [
    "SC_CODE",
    "SC_NAME",
    "SC_GROUP",
    "SC_TYPE",
    "OPEN",
    "HIGH",
    "LOW",
    "CLOSE",
    "LAST",
    "PREVCLOSE",
    "NO_TRADES",
    "NO_OF_SHRS",
    "NET_TURNOV",
    "TDCLOINDI",
    "ISIN_CODE",
];

fn input_schema() -> SchemaRef {
    let fields = BSE_COLUMNS.iter().map(|name| {
        let dtype = match *name {
            "OPEN" | "HIGH" | "LOW" | "CLOSE" | "LAST" | "PREVCLOSE" | "NET_TURNOV" => {
                DataType::Float64
            }
            "NO_TRADES" | "NO_OF_SHRS" => DataType::Int64,
            _ => DataType::String,
        };
        Field::new((*name).into(), dtype)
    });
    Arc::new(Schema::from_iter(fields))
}

impl SourceParser for BseBarParser {
    fn declared_schema(&self) -> SchemaRef {
        equity_bar_schema()
    }

    #[tracing::instrument(skip_all, fields(trade_date = %ctx.trade_date))]
    fn parse(&self, raw: &Bytes, ctx: &ParseContext) -> MandiResult<DataFrame> {
        let header = csv_header(raw)?;
        check_schema_drift(ctx.source, &header, &input_schema())?;

        let df = read_csv(raw, input_schema())?;
        let before = df.height();

        let df = df
            .lazy()
            .filter(
                col("SC_CODE")
                    .is_not_null()
                    .and(col("SC_CODE").neq(lit("")))
                    .and(col("SC_NAME").is_not_null())
                    .and(col("SC_NAME").neq(lit(""))),
            )
            .with_columns([col("SC_NAME").str().strip_chars(lit(NULL))])
            .collect()
            .map_err(|e| DataError::Frame(e.to_string()))?;

        tracing::info!(
            rows = df.height(),
            filtered = before - df.height(),
            "bse_bhavcopy_parsed"
        );

        let codes = df
            .column("SC_CODE")
            .and_then(|c| c.str().cloned())
            .map_err(|e| DataError::Frame(e.to_string()))?;
        let names = df
            .column("SC_NAME")
            .and_then(|c| c.str().cloned())
            .map_err(|e| DataError::Frame(e.to_string()))?;

        let mut event_ids = Vec::with_capacity(df.height());
        let mut entity_ids = Vec::with_capacity(df.height());
        for (code, name) in codes.iter().zip(names.iter()) {
            let code = code.unwrap_or_default();
            let name = name.unwrap_or_default();
            event_ids.push(event_id(ctx.source.as_str(), ctx.trade_date, code));
            entity_ids.push(format!("{name}:{code}:BSE"));
        }

        let df = df
            .lazy()
            .with_columns([
                Series::new(CanonicalCol::EventId.name(), event_ids).lit(),
                Series::new(CanonicalCol::EntityId.name(), entity_ids).lit(),
            ])
            .with_columns(envelope_literals(ctx))
            .with_columns([
                col("SC_CODE").alias(CanonicalCol::InstrumentId.name()),
                col("SC_NAME").alias(CanonicalCol::Symbol.name()),
                lit("BSE").alias(CanonicalCol::Exchange.name()),
                col("ISIN_CODE").alias(CanonicalCol::Isin.name()),
                col("SC_TYPE").alias(CanonicalCol::InstrumentType.name()),
                col("SC_GROUP").alias(CanonicalCol::Series.name()),
                lit(days_since_epoch(ctx.trade_date))
                    .cast(DataType::Date)
                    .alias(CanonicalCol::TradeDate.name()),
                col("PREVCLOSE").alias(CanonicalCol::PrevClose.name()),
                col("OPEN").alias(CanonicalCol::Open.name()),
                col("HIGH").alias(CanonicalCol::High.name()),
                col("LOW").alias(CanonicalCol::Low.name()),
                col("CLOSE").alias(CanonicalCol::Close.name()),
                col("LAST").alias(CanonicalCol::LastPrice.name()),
                // BSE equity bhavcopy carries no settlement price.
                lit(NULL)
                    .cast(DataType::Float64)
                    .alias(CanonicalCol::SettlementPrice.name()),
                col("NO_OF_SHRS").alias(CanonicalCol::Volume.name()),
                col("NET_TURNOV").alias(CanonicalCol::Turnover.name()),
                col("NO_TRADES").alias(CanonicalCol::Trades.name()),
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
        let header = BSE_COLUMNS.join(",");
        format!(
            "{header}\n\
             500325,RELIANCE,A,Q,2900.0,2950.0,2880.0,2938.0,2938.0,2895.0,48,1200,3525600.0,,INE002A01018\n\
             532540,TCS,A,Q,3801.0,3849.0,3791.0,3829.0,3829.0,3795.0,30,800,3063200.0,,INE467B01029\n\
             ,GHOST,A,Q,1.0,1.0,1.0,1.0,1.0,1.0,1,1,1.0,,INE000000000\n"
        )
    }

    fn ctx() -> ParseContext {
        ParseContext::new(
            Source::BseEqBar,
            NaiveDate::from_ymd_opt(2024, 1, 15).expect("date"),
        )
    }

    #[test]
    fn maps_bse_columns_onto_canonical_schema() {
        let raw = Bytes::from(fixture_csv());
        let df = BseBarParser.parse(&raw, &ctx()).expect("parse succeeds");

        // The row without a scrip code is dropped up front.
        assert_eq!(df.height(), 2);
        assert_eq!(&**df.schema(), &*equity_bar_schema());

        let exchange = df
            .column("exchange")
            .and_then(|c| c.str().cloned())
            .expect("exchange column");
        assert!(exchange.iter().all(|v| v == Some("BSE")));

        // Fields absent from the BSE layout surface as nulls.
        let settlement = df.column("settlement_price").expect("settlement column");
        assert_eq!(settlement.null_count(), 2);
    }

    #[test]
    fn wrong_layout_is_schema_drift() {
        let raw = Bytes::from("SC_CODE,UNEXPECTED\n1,2\n".to_string());
        let err = BseBarParser.parse(&raw, &ctx()).expect_err("drift fails");
        assert!(err.to_string().contains("Schema drift"));
    }
}
