use bytes::Bytes;
use polars::prelude::{DataFrame, DataType, IntoLazy, SchemaRef, df, lit};
use serde::Deserialize;
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    error::{DataError, MandiResult, ParseError},
    parse::{
        ParseContext, SourceParser, conform_to_schema, days_since_epoch, envelope_literals,
        partition_literals,
    },
    schema::{CanonicalCol, event_id, index_constituent_schema},
};

/// Membership change recorded for one (index, symbol, date).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstituentAction {
    Add,
    Remove,
    #[default]
    Rebalance,
}

/// Parser for the NSE index-constituent JSON feed.
///
/// The payload's `data` list mixes the index aggregate row with its
/// members; only listed equity series (`EQ`, `BE`) survive. One event
/// is emitted per (index_name, symbol, effective_date).
pub struct IndexConstituentParser {
    pub action: ConstituentAction,
}

impl Default for IndexConstituentParser {
    fn default() -> Self {
        Self {
            action: ConstituentAction::Rebalance,
        }
    }
}

const RETAINED_SERIES: [&str; 2] = ["EQ", "BE"];

#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(default)]
    name: Option<String>,
    data: Vec<Constituent>,
}

#[derive(Debug, Deserialize)]
struct Constituent {
    symbol: String,
    #[serde(default)]
    series: Option<String>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    #[serde(default)]
    isin: Option<String>,
    #[serde(rename = "companyName", default)]
    company_name: Option<String>,
}

impl SourceParser for IndexConstituentParser {
    fn declared_schema(&self) -> SchemaRef {
        index_constituent_schema()
    }

    #[tracing::instrument(skip_all, fields(trade_date = %ctx.trade_date))]
    fn parse(&self, raw: &Bytes, ctx: &ParseContext) -> MandiResult<DataFrame> {
        let payload: Payload =
            serde_json::from_slice(raw).map_err(|e| ParseError::MalformedPayload {
                source_name: ctx.source.to_string(),
                msg: e.to_string(),
            })?;

        let index_name = ctx
            .index
            .clone()
            .or(payload.name)
            .ok_or_else(|| ParseError::MalformedPayload {
                source_name: ctx.source.to_string(),
                msg: "no index name in params or payload".to_string(),
            })?;

        let action = self.action.to_string();
        let mut event_ids = Vec::new();
        let mut entity_ids = Vec::new();
        let mut symbols = Vec::new();
        let mut series_col = Vec::new();
        let mut isins: Vec<Option<String>> = Vec::new();

        for item in &payload.data {
            let Some(series) = item.series.as_deref() else {
                continue;
            };
            if !RETAINED_SERIES.contains(&series) || item.symbol.is_empty() {
                continue;
            }

            let business_key = format!("{index_name}:{}", item.symbol);
            event_ids.push(event_id(ctx.source.as_str(), ctx.trade_date, &business_key));
            entity_ids.push(format!("{}:{index_name}:NSE", item.symbol));
            symbols.push(item.symbol.clone());
            series_col.push(series.to_string());
            isins.push(item.meta.as_ref().and_then(|m| m.isin.clone()));
        }

        tracing::info!(
            index = %index_name,
            members = symbols.len(),
            total = payload.data.len(),
            "index_constituents_parsed"
        );

        let df = df! {
            CanonicalCol::EventId.as_str() => event_ids,
            CanonicalCol::EntityId.as_str() => entity_ids,
            CanonicalCol::Symbol.as_str() => symbols,
            CanonicalCol::Series.as_str() => series_col,
            CanonicalCol::Isin.as_str() => isins,
        }
        .map_err(|e| DataError::Frame(e.to_string()))?;

        let df = df
            .lazy()
            .with_columns(envelope_literals(ctx))
            .with_columns([
                lit(index_name.as_str()).alias(CanonicalCol::IndexName.name()),
                lit(action.as_str()).alias(CanonicalCol::Action.name()),
                lit(days_since_epoch(ctx.trade_date))
                    .cast(DataType::Date)
                    .alias(CanonicalCol::EffectiveDate.name()),
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

    fn ctx() -> ParseContext {
        ParseContext::new(
            Source::NseIndexConstituent,
            NaiveDate::from_ymd_opt(2024, 1, 15).expect("date"),
        )
        .with_index("NIFTY 50")
    }

    fn fixture_json() -> String {
        r#"{
            "name": "NIFTY 50",
            "data": [
                {"symbol": "NIFTY 50", "series": null, "meta": null},
                {"symbol": "RELIANCE", "series": "EQ",
                 "meta": {"isin": "INE002A01018", "companyName": "Reliance Industries"}},
                {"symbol": "TCS", "series": "EQ",
                 "meta": {"isin": "INE467B01029", "companyName": "Tata Consultancy"}},
                {"symbol": "SOMEBOND", "series": "GB", "meta": {"isin": "INE000000001"}}
            ]
        }"#
        .to_string()
    }

    #[test]
    fn retains_only_listed_equity_series() {
        let df = IndexConstituentParser::default()
            .parse(&Bytes::from(fixture_json()), &ctx())
            .expect("parse succeeds");

        assert_eq!(df.height(), 2);
        let series = df
            .column("series")
            .and_then(|c| c.str().cloned())
            .expect("series column");
        assert!(series.iter().all(|s| s == Some("EQ")));

        let action = df
            .column("action")
            .and_then(|c| c.str().cloned())
            .expect("action column");
        assert!(action.iter().all(|a| a == Some("REBALANCE")));
    }

    #[test]
    fn malformed_json_is_fatal() {
        let err = IndexConstituentParser::default()
            .parse(&Bytes::from("{broken".to_string()), &ctx())
            .expect_err("must fail");
        assert!(!err.is_retryable());
    }
}
