use bytes::Bytes;
use chrono::NaiveDate;
use polars::prelude::{DataFrame, DataType, IntoLazy, SchemaRef, df, lit};
use serde::Deserialize;

use crate::{
    error::{DataError, MandiResult, ParseError},
    parse::{
        ParseContext, SourceParser, conform_to_schema, days_since_epoch, envelope_literals,
        partition_literals,
    },
    schema::{CanonicalCol, event_id, option_chain_schema},
};

/// Parser for the NSE option-chain JSON snapshot.
///
/// The top-level record carries `underlyingValue`; each strike emits up
/// to two rows (CE and PE). Expiries arrive as `DD-MMM-YYYY` and are
/// converted to ISO dates.
pub struct OptionChainParser;

#[derive(Debug, Deserialize)]
struct Payload {
    records: Records,
}

#[derive(Debug, Deserialize)]
struct Records {
    #[serde(default)]
    data: Vec<StrikeEntry>,
    #[serde(rename = "underlyingValue", default)]
    underlying_value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct StrikeEntry {
    #[serde(rename = "strikePrice")]
    strike_price: f64,
    #[serde(rename = "expiryDate")]
    expiry_date: String,
    #[serde(rename = "CE", default)]
    ce: Option<ContractQuote>,
    #[serde(rename = "PE", default)]
    pe: Option<ContractQuote>,
}

#[derive(Debug, Deserialize)]
struct ContractQuote {
    #[serde(rename = "lastPrice", default)]
    last_price: Option<f64>,
    #[serde(rename = "openInterest", default)]
    open_interest: Option<i64>,
    #[serde(rename = "changeinOpenInterest", default)]
    change_in_oi: Option<i64>,
    #[serde(rename = "impliedVolatility", default)]
    implied_volatility: Option<f64>,
    #[serde(rename = "totalTradedVolume", default)]
    volume: Option<i64>,
}

fn parse_expiry(raw: &str) -> MandiResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%d-%b-%Y").map_err(|e| {
        ParseError::InvalidDate {
            value: raw.to_string(),
            msg: e.to_string(),
        }
        .into()
    })
}

impl SourceParser for OptionChainParser {
    fn declared_schema(&self) -> SchemaRef {
        option_chain_schema()
    }

    #[tracing::instrument(skip_all, fields(trade_date = %ctx.trade_date))]
    fn parse(&self, raw: &Bytes, ctx: &ParseContext) -> MandiResult<DataFrame> {
        let payload: Payload =
            serde_json::from_slice(raw).map_err(|e| ParseError::MalformedPayload {
                source_name: ctx.source.to_string(),
                msg: e.to_string(),
            })?;

        let symbol = ctx.symbol.clone().ok_or_else(|| ParseError::MalformedPayload {
            source_name: ctx.source.to_string(),
            msg: "option chain requires a symbol parameter".to_string(),
        })?;
        let underlying_value = payload.records.underlying_value;

        let mut event_ids = Vec::new();
        let mut entity_ids = Vec::new();
        let mut expiries: Vec<i32> = Vec::new();
        let mut strikes = Vec::new();
        let mut option_types: Vec<&'static str> = Vec::new();
        let mut last_prices = Vec::new();
        let mut open_interests = Vec::new();
        let mut oi_changes = Vec::new();
        let mut ivs = Vec::new();
        let mut volumes = Vec::new();

        for entry in &payload.records.data {
            let expiry = parse_expiry(&entry.expiry_date)?;
            for (side, quote) in [("CE", entry.ce.as_ref()), ("PE", entry.pe.as_ref())] {
                let Some(quote) = quote else { continue };

                let business_key =
                    format!("{symbol}:{expiry}:{strike}:{side}", strike = entry.strike_price);
                event_ids.push(event_id(ctx.source.as_str(), ctx.trade_date, &business_key));
                entity_ids.push(format!(
                    "{symbol}:{expiry}:{strike}:{side}:NSE",
                    strike = entry.strike_price
                ));
                expiries.push(days_since_epoch(expiry));
                strikes.push(entry.strike_price);
                option_types.push(side);
                last_prices.push(quote.last_price);
                open_interests.push(quote.open_interest);
                oi_changes.push(quote.change_in_oi);
                ivs.push(quote.implied_volatility);
                volumes.push(quote.volume);
            }
        }

        tracing::info!(
            symbol = %symbol,
            contracts = strikes.len(),
            strikes = payload.records.data.len(),
            "option_chain_parsed"
        );

        let df = df! {
            CanonicalCol::EventId.as_str() => event_ids,
            CanonicalCol::EntityId.as_str() => entity_ids,
            CanonicalCol::ExpiryDate.as_str() => expiries,
            CanonicalCol::StrikePrice.as_str() => strikes,
            CanonicalCol::OptionType.as_str() => option_types,
            CanonicalCol::LastPrice.as_str() => last_prices,
            CanonicalCol::OpenInterest.as_str() => open_interests,
            CanonicalCol::ChangeInOpenInterest.as_str() => oi_changes,
            CanonicalCol::ImpliedVolatility.as_str() => ivs,
            CanonicalCol::Volume.as_str() => volumes,
        }
        .map_err(|e| DataError::Frame(e.to_string()))?;

        let df = df
            .lazy()
            .with_columns(envelope_literals(ctx))
            .with_columns([
                lit(symbol.as_str()).alias(CanonicalCol::Symbol.name()),
                match underlying_value {
                    Some(v) => lit(v),
                    None => lit(polars::prelude::NULL).cast(DataType::Float64),
                }
                .alias(CanonicalCol::UnderlyingValue.name()),
                lit(days_since_epoch(ctx.trade_date))
                    .cast(DataType::Date)
                    .alias(CanonicalCol::TradeDate.name()),
            ])
            .with_columns(partition_literals(ctx.trade_date))
            .collect()
            .map_err(|e| DataError::Frame(e.to_string()))?;

        conform_to_schema(df, &self.declared_schema())
    }
}
