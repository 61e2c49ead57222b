use std::io::Cursor;

use bytes::Bytes;
use polars::prelude::{
    CsvParseOptions, CsvReadOptions, DataFrame, IntoLazy, NullValues, SerReader, df,
};
use regex::Regex;

use crate::{
    error::{DataError, MandiResult, ParseError},
    fetch::DealKind,
    parse::{
        NULL_SENTINELS, ParseContext, SourceParser, conform_to_schema, csv_header,
        days_since_epoch, envelope_literals, partition_literals,
    },
    schema::{CanonicalCol, bulk_block_deal_schema, event_id},
};

/// Parser for NSE bulk/block deal disclosures.
///
/// The endpoint serves a Brotli-compressed CSV (decompressed at the
/// transport layer) whose header wording drifts between "Quantity
/// Traded" and "QuantityTraded" vintages; both are accepted. A row
/// whose side column names both sides yields one BUY and one SELL
/// event.
pub struct BulkDealsParser {
    pub deal_kind: DealKind,
}

/// Logical input columns and the header spellings seen in the wild.
const HEADER_VARIANTS: [(&str, &[&str]); 6] = [
    ("symbol", &["Symbol", "SYMBOL"]),
    ("client_name", &["Client Name", "ClientName", "CLIENT NAME"]),
    ("side", &["Buy/Sell", "Buy / Sell", "BUY/SELL"]),
    (
        "quantity",
        &["Quantity Traded", "QuantityTraded", "QTY TRADED"],
    ),
    (
        "trade_price",
        &[
            "Trade Price / Wght. Avg. Price",
            "TradePrice/Wght.Avg.Price",
            "Trade Price",
        ],
    ),
    ("remarks", &["Remarks", "REMARKS"]),
];

fn canonical_header(name: &str) -> Option<&'static str> {
    let trimmed = name.trim();
    HEADER_VARIANTS
        .iter()
        .find(|(_, variants)| variants.iter().any(|v| v.eq_ignore_ascii_case(trimmed)))
        .map(|(canonical, _)| *canonical)
}

impl SourceParser for BulkDealsParser {
    fn declared_schema(&self) -> polars::prelude::SchemaRef {
        bulk_block_deal_schema()
    }

    #[tracing::instrument(skip_all, fields(deal_kind = %self.deal_kind, trade_date = %ctx.trade_date))]
    fn parse(&self, raw: &Bytes, ctx: &ParseContext) -> MandiResult<DataFrame> {
        let header = csv_header(raw)?;

        let mut missing: Vec<String> = Vec::new();
        for (canonical, _) in HEADER_VARIANTS {
            if canonical == "remarks" {
                continue; // optional in older vintages
            }
            if !header.iter().any(|h| canonical_header(h) == Some(canonical)) {
                missing.push(canonical.to_string());
            }
        }
        if !missing.is_empty() {
            let extra = header
                .iter()
                .filter(|h| canonical_header(h).is_none() && !h.eq_ignore_ascii_case("date"))
                .cloned()
                .collect();
            return Err(ParseError::SchemaDrift {
                source_name: ctx.source.to_string(),
                missing,
                extra,
            }
            .into());
        }

        // Everything reads as text; grouped digits ("12,34,567") are
        // cleaned before the numeric casts.
        let nulls = NULL_SENTINELS.iter().map(|s| (*s).into()).collect();
        let mut raw_df = CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(Some(0))
            .with_parse_options(
                CsvParseOptions::default().with_null_values(Some(NullValues::AllColumns(nulls))),
            )
            .into_reader_with_file_handle(Cursor::new(raw.as_ref()))
            .finish()
            .map_err(|e| DataError::Frame(e.to_string()))?;

        let renames: Vec<(String, &'static str)> = raw_df
            .get_column_names()
            .iter()
            .filter_map(|name| canonical_header(name).map(|c| (name.to_string(), c)))
            .collect();
        for (from, to) in renames {
            raw_df
                .rename(&from, to.into())
                .map_err(|e| DataError::Frame(e.to_string()))?;
        }

        let digits = Regex::new(r"[^0-9.\-]").expect("static pattern");
        let column =
            |name: &str| -> MandiResult<Vec<Option<String>>> {
                Ok(raw_df
                    .column(name)
                    .and_then(|c| c.str().cloned())
                    .map_err(|e| DataError::Frame(e.to_string()))?
                    .iter()
                    .map(|v| v.map(|s| s.trim().to_string()))
                    .collect())
            };

        let symbols = column("symbol")?;
        let clients = column("client_name")?;
        let sides = column("side")?;
        let quantities = column("quantity")?;
        let prices = column("trade_price")?;
        let remarks: Vec<Option<String>> = if raw_df.get_column_names().iter().any(|n| n.as_str() == "remarks")
        {
            column("remarks")?
        } else {
            vec![None; raw_df.height()]
        };

        let mut out_event_ids: Vec<String> = Vec::new();
        let mut out_entity_ids: Vec<String> = Vec::new();
        let mut out_symbols: Vec<String> = Vec::new();
        let mut out_clients: Vec<Option<String>> = Vec::new();
        let mut out_sides: Vec<String> = Vec::new();
        let mut out_quantities: Vec<Option<i64>> = Vec::new();
        let mut out_prices: Vec<Option<f64>> = Vec::new();
        let mut out_remarks: Vec<Option<String>> = Vec::new();

        let deal_kind = self.deal_kind.as_str();
        for i in 0..raw_df.height() {
            let Some(symbol) = symbols[i].as_deref().filter(|s| !s.is_empty()) else {
                continue;
            };
            let side_raw = sides[i].as_deref().unwrap_or_default().to_uppercase();

            // "BUY/SELL" rows disclose both sides of the same deal.
            let mut emitted: Vec<&str> = Vec::with_capacity(2);
            if side_raw.contains("BUY") {
                emitted.push("BUY");
            }
            if side_raw.contains("SELL") {
                emitted.push("SELL");
            }

            for side in emitted {
                let business_key = format!("{symbol}:{deal_kind}:{side}");
                out_event_ids.push(event_id(ctx.source.as_str(), ctx.trade_date, &business_key));
                out_entity_ids.push(format!(
                    "{symbol}:{deal_kind}:{side}:{}",
                    ctx.trade_date.format("%Y%m%d")
                ));
                out_symbols.push(symbol.to_string());
                out_clients.push(clients[i].clone());
                out_sides.push(side.to_string());
                out_quantities.push(
                    quantities[i]
                        .as_deref()
                        .map(|q| digits.replace_all(q, ""))
                        .and_then(|q| q.parse::<f64>().ok())
                        .map(|q| q.trunc() as i64),
                );
                out_prices.push(
                    prices[i]
                        .as_deref()
                        .map(|p| digits.replace_all(p, ""))
                        .and_then(|p| p.parse::<f64>().ok()),
                );
                out_remarks.push(remarks[i].clone());
            }
        }

        tracing::info!(
            input_rows = raw_df.height(),
            events = out_symbols.len(),
            "deals_parsed"
        );

        let deal_date = days_since_epoch(ctx.trade_date);
        let df = df! {
            CanonicalCol::EventId.as_str() => out_event_ids,
            CanonicalCol::EntityId.as_str() => out_entity_ids,
            CanonicalCol::Symbol.as_str() => out_symbols,
            CanonicalCol::ClientName.as_str() => out_clients,
            CanonicalCol::TransactionType.as_str() => out_sides,
            CanonicalCol::Quantity.as_str() => out_quantities,
            CanonicalCol::TradePrice.as_str() => out_prices,
            CanonicalCol::Remarks.as_str() => out_remarks,
        }
        .map_err(|e| DataError::Frame(e.to_string()))?;

        let df = df
            .lazy()
            .with_columns(envelope_literals(ctx))
            .with_columns([
                polars::prelude::lit(deal_kind).alias(CanonicalCol::DealType.name()),
                polars::prelude::lit(deal_date)
                    .cast(polars::prelude::DataType::Date)
                    .alias(CanonicalCol::DealDate.name()),
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
            Source::NseBulkDeals,
            NaiveDate::from_ymd_opt(2024, 1, 15).expect("date"),
        )
    }

    fn fixture_csv() -> String {
        "Date,Symbol,Security Name,Client Name,Buy/Sell,Quantity Traded,\"Trade Price / Wght. Avg. Price\",Remarks\n\
         15-01-2024,RELIANCE,Reliance Industries,ACME CAPITAL,BUY,\"12,34,567\",\"2,940.50\",-\n\
         15-01-2024,TCS,Tata Consultancy,ZEN FUND,SELL,\"45,000\",\"3,830.00\",-\n\
         15-01-2024,INFY,Infosys,CROSS TRADER,BUY/SELL,\"10,000\",\"1,620.25\",-\n"
            .to_string()
    }

    #[test]
    fn splits_two_sided_rows_into_buy_and_sell_events() {
        let parser = BulkDealsParser {
            deal_kind: DealKind::Bulk,
        };
        let df = parser
            .parse(&Bytes::from(fixture_csv()), &ctx())
            .expect("parse succeeds");

        // 2 single-sided rows + 1 both-sided row = 4 events.
        assert_eq!(df.height(), 4);

        let side_col = df
            .column("transaction_type")
            .and_then(|c| c.str().cloned())
            .expect("side column");
        let sides: Vec<Option<&str>> = side_col.iter().collect();
        assert_eq!(
            sides,
            vec![Some("BUY"), Some("SELL"), Some("BUY"), Some("SELL")]
        );
    }

    #[test]
    fn grouped_digits_parse_into_numbers() {
        let parser = BulkDealsParser {
            deal_kind: DealKind::Bulk,
        };
        let df = parser
            .parse(&Bytes::from(fixture_csv()), &ctx())
            .expect("parse succeeds");

        let qty = df
            .column("quantity")
            .and_then(|c| c.i64().cloned())
            .expect("quantity column");
        assert_eq!(qty.get(0), Some(1_234_567));

        let price = df
            .column("trade_price")
            .and_then(|c| c.f64().cloned())
            .expect("price column");
        assert_eq!(price.get(0), Some(2940.50));
    }

    #[test]
    fn missing_side_column_is_schema_drift() {
        let parser = BulkDealsParser {
            deal_kind: DealKind::Block,
        };
        let raw = Bytes::from("Symbol,Client Name\nRELIANCE,ACME\n".to_string());
        let err = parser.parse(&raw, &ctx()).expect_err("drift fails");
        assert!(err.to_string().contains("side"));
    }
}
