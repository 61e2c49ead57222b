use std::io::Cursor;

use bytes::Bytes;
use chrono::NaiveDate;
use polars::prelude::{
    CsvParseOptions, CsvReadOptions, DataFrame, Expr, IntoLazy, NullValues, Schema, SchemaExt,
    SchemaRef, SerReader, col, lit,
};

use crate::{
    error::{DataError, MandiResult, ParseError},
    fetch::Source,
    schema::{self, CanonicalCol},
};

pub mod bse_bar;
pub mod bulk_deals;
pub mod corporate_actions;
pub mod index_constituents;
pub mod nse_bar;
pub mod option_chain;
pub mod symbol_master;
pub mod xbrl;

/// Tokens the exchanges use for "no value".
pub const NULL_SENTINELS: [&str; 6] = ["-", "", "null", "NULL", "N/A", "NA"];

/// Per-run metadata a parser needs beyond the raw bytes.
#[derive(Debug, Clone)]
pub struct ParseContext {
    pub source: Source,
    pub trade_date: NaiveDate,
    /// Discriminator for symbol-keyed sources (option chain, XBRL).
    pub symbol: Option<String>,
    /// Discriminator for index-keyed sources (constituents).
    pub index: Option<String>,
}

impl ParseContext {
    pub fn new(source: Source, trade_date: NaiveDate) -> Self {
        Self {
            source,
            trade_date,
            symbol: None,
            index: None,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn schema_version(&self) -> &'static str {
        self.source.schema_version()
    }
}

/// Per-source adapter from raw bytes to a normalized tabular frame.
///
/// `declared_schema` is the canonical output contract; `parse` must
/// return a frame conforming to it exactly (order, names, dtypes).
pub trait SourceParser: Send + Sync {
    fn declared_schema(&self) -> SchemaRef;

    fn parse(&self, raw: &Bytes, ctx: &ParseContext) -> MandiResult<DataFrame>;
}

// ================================================================================================
// Shared helpers
// ================================================================================================

/// Fail fast when the upstream column set diverges from the declared
/// input schema, naming what is missing and what is unexpected.
pub(crate) fn check_schema_drift(
    source: Source,
    actual: &[String],
    expected: &Schema,
) -> MandiResult<()> {
    let expected_names: Vec<&str> = expected.iter_names().map(|n| n.as_str()).collect();
    let missing: Vec<String> = expected_names
        .iter()
        .filter(|n| !actual.iter().any(|a| a == *n))
        .map(|n| n.to_string())
        .collect();
    let extra: Vec<String> = actual
        .iter()
        .filter(|a| !expected_names.contains(&a.as_str()))
        .cloned()
        .collect();

    if missing.is_empty() && extra.is_empty() {
        Ok(())
    } else {
        Err(ParseError::SchemaDrift {
            source_name: source.to_string(),
            missing,
            extra,
        }
        .into())
    }
}

/// Header row of a CSV payload, trimmed of quotes and padding.
pub(crate) fn csv_header(raw: &[u8]) -> MandiResult<Vec<String>> {
    let text = std::str::from_utf8(raw).map_err(|e| ParseError::MalformedPayload {
        source_name: "csv".to_string(),
        msg: e.to_string(),
    })?;
    let first = text.lines().next().ok_or_else(|| ParseError::MalformedPayload {
        source_name: "csv".to_string(),
        msg: "empty payload".to_string(),
    })?;
    Ok(first
        .split(',')
        .map(|c| c.trim().trim_matches('"').trim().to_string())
        .collect())
}

/// Read a CSV payload with per-column dtype overrides and the shared
/// null-sentinel set.
pub(crate) fn read_csv(raw: &[u8], dtypes: SchemaRef) -> MandiResult<DataFrame> {
    let nulls = NULL_SENTINELS.iter().map(|s| (*s).into()).collect();
    CsvReadOptions::default()
        .with_has_header(true)
        .with_schema_overwrite(Some(dtypes))
        .with_parse_options(
            CsvParseOptions::default().with_null_values(Some(NullValues::AllColumns(nulls))),
        )
        .into_reader_with_file_handle(Cursor::new(raw))
        .finish()
        .map_err(|e| DataError::Frame(e.to_string()).into())
}

/// Select the canonical columns in declared order, casting each to its
/// declared dtype. The parser must have materialized every column.
pub(crate) fn conform_to_schema(df: DataFrame, schema: &Schema) -> MandiResult<DataFrame> {
    let exprs: Vec<Expr> = schema
        .iter_fields()
        .map(|f| col(f.name().clone()).cast(f.dtype().clone()))
        .collect();
    df.lazy()
        .select(exprs)
        .collect()
        .map_err(|e| DataError::Frame(e.to_string()).into())
}

/// Literal columns shared by every envelope: event/ingest times, source
/// and schema version. Per-row `event_id`/`entity_id` stay with the
/// individual parsers since their business keys differ.
pub(crate) fn envelope_literals(ctx: &ParseContext) -> [Expr; 4] {
    [
        lit(schema::event_time_ms(ctx.trade_date)).alias(CanonicalCol::EventTime.name()),
        lit(schema::now_ms()).alias(CanonicalCol::IngestTime.name()),
        lit(ctx.source.as_str()).alias(CanonicalCol::Source.name()),
        lit(ctx.schema_version()).alias(CanonicalCol::SchemaVersion.name()),
    ]
}

/// Hive partition literal columns derived from the trading day.
pub(crate) fn partition_literals(trade_date: NaiveDate) -> [Expr; 3] {
    let (year, month, day) = schema::partition_values(trade_date);
    [
        lit(year).alias(CanonicalCol::Year.name()),
        lit(month).alias(CanonicalCol::Month.name()),
        lit(day).alias(CanonicalCol::Day.name()),
    ]
}

/// Days since the Unix epoch; polars `Date` physical representation.
pub(crate) fn days_since_epoch(date: NaiveDate) -> i32 {
    (date - NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch")).num_days() as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MandiError;

    #[test]
    fn drift_names_missing_and_extra_columns() {
        let expected = Schema::from_iter([
            CanonicalCol::Symbol.field(),
            CanonicalCol::Open.field(),
            CanonicalCol::Close.field(),
        ]);
        let actual = vec![
            "symbol".to_string(),
            "close".to_string(),
            "surprise".to_string(),
        ];

        let err = check_schema_drift(Source::NseEqBar, &actual, &expected)
            .expect_err("drift must fail");
        match err {
            MandiError::Parse(ParseError::SchemaDrift { missing, extra, .. }) => {
                assert_eq!(missing, vec!["open".to_string()]);
                assert_eq!(extra, vec!["surprise".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn header_is_trimmed_and_unquoted() {
        let raw = b"\"Symbol\", Client Name ,Buy/Sell\nRELIANCE,ACME,BUY\n";
        let header = csv_header(raw).expect("header parses");
        assert_eq!(header, vec!["Symbol", "Client Name", "Buy/Sell"]);
    }

    #[test]
    fn epoch_days_match_polars_date_repr() {
        let d = NaiveDate::from_ymd_opt(1970, 1, 2).expect("date");
        assert_eq!(days_since_epoch(d), 1);
        let d = NaiveDate::from_ymd_opt(2024, 1, 15).expect("date");
        assert_eq!(days_since_epoch(d), 19737);
    }
}
