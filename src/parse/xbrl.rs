use std::collections::HashMap;

use bytes::Bytes;
use chrono::NaiveDate;
use polars::prelude::{DataFrame, DataType, IntoLazy, SchemaRef, df, lit};
use quick_xml::{Reader, events::Event};

use crate::{
    error::{DataError, MandiResult, ParseError},
    parse::{
        ParseContext, SourceParser, conform_to_schema, days_since_epoch, envelope_literals,
        partition_literals,
    },
    schema::{CanonicalCol, event_id, quarterly_financials_schema},
};

/// Parser for quarterly financial XBRL filings.
///
/// Extracts `context` periods, `unit` measures and a fixed dictionary
/// of fact tags into one canonical row. The filing-level "level of
/// rounding" (Crores / Lakhs / Thousands) is applied to monetary facts
/// only; per-share and unitless measures pass through unscaled. A
/// negative `decimals` attribute on a fact takes precedence over the
/// file-level rounding.
pub struct XbrlFinancialsParser;

#[derive(Debug, Default, Clone)]
struct Context {
    period_start: Option<NaiveDate>,
    period_end: Option<NaiveDate>,
    instant: Option<NaiveDate>,
}

#[derive(Debug)]
struct Fact {
    local_name: String,
    context_ref: Option<String>,
    unit_ref: Option<String>,
    decimals: Option<String>,
    value: String,
}

/// Fact tag → canonical financial column.
fn mapped_field(local_name: &str) -> Option<CanonicalCol> {
    match local_name {
        "RevenueFromOperations" | "SegmentRevenueFromOperations" => {
            Some(CanonicalCol::RevenueFromOperations)
        }
        "OtherIncome" => Some(CanonicalCol::OtherIncome),
        "Income" => Some(CanonicalCol::TotalIncome),
        "Expenses" => Some(CanonicalCol::TotalExpenses),
        "ProfitBeforeTax" => Some(CanonicalCol::ProfitBeforeTax),
        "TaxExpense" => Some(CanonicalCol::TaxExpense),
        "ProfitLossForPeriod" | "ProfitLossForPeriodFromContinuingOperations" => {
            Some(CanonicalCol::ProfitAfterTax)
        }
        "BasicEarningsLossPerShareFromContinuingOperations"
        | "BasicEarningsLossPerShareFromContinuingAndDiscontinuedOperations" => {
            Some(CanonicalCol::BasicEps)
        }
        "DilutedEarningsLossPerShareFromContinuingOperations"
        | "DilutedEarningsLossPerShareFromContinuingAndDiscontinuedOperations" => {
            Some(CanonicalCol::DilutedEps)
        }
        _ => None,
    }
}

fn local_name(qname: &[u8]) -> String {
    let raw = String::from_utf8_lossy(qname);
    raw.rsplit(':').next().unwrap_or(&raw).to_string()
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").ok()
}

fn to_float(text: &str) -> Option<f64> {
    let cleaned = text.trim().replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

/// Divisor implied by the filing's declared level of rounding.
fn rounding_divisor(level: &str) -> f64 {
    let level = level.to_lowercase();
    if level.contains("crore") {
        1e7
    } else if level.contains("lakh") {
        1e5
    } else if level.contains("thousand") {
        1e3
    } else {
        1.0
    }
}

fn is_unscaled_unit(unit_text: &str) -> bool {
    let unit = unit_text.to_lowercase();
    unit.contains("share") || unit.contains("pure")
}

struct Document {
    contexts: HashMap<String, Context>,
    units: HashMap<String, String>,
    facts: Vec<Fact>,
    level_of_rounding: Option<String>,
}

fn read_document(raw: &Bytes) -> MandiResult<Document> {
    let text = std::str::from_utf8(raw).map_err(|e| ParseError::Xml(e.to_string()))?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut contexts: HashMap<String, Context> = HashMap::new();
    let mut units: HashMap<String, String> = HashMap::new();
    let mut facts: Vec<Fact> = Vec::new();
    let mut level_of_rounding: Option<String> = None;

    let mut path: Vec<String> = Vec::new();
    let mut current_context: Option<(String, Context)> = None;
    let mut current_unit: Option<String> = None;
    let mut pending_fact: Option<Fact> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref());

                let mut context_ref = None;
                let mut unit_ref = None;
                let mut decimals = None;
                let mut id = None;
                for attr in e.attributes().flatten() {
                    let key = local_name(attr.key.as_ref());
                    let value = String::from_utf8_lossy(&attr.value).to_string();
                    match key.as_str() {
                        "contextRef" => context_ref = Some(value),
                        "unitRef" => unit_ref = Some(value),
                        "decimals" => decimals = Some(value),
                        "id" => id = Some(value),
                        _ => {}
                    }
                }

                match name.as_str() {
                    "context" => {
                        if let Some(id) = id {
                            current_context = Some((id, Context::default()));
                        }
                    }
                    "unit" => {
                        if let Some(id) = id {
                            current_unit = Some(id);
                        }
                    }
                    _ if current_context.is_none()
                        && current_unit.is_none()
                        && context_ref.is_some() =>
                    {
                        pending_fact = Some(Fact {
                            local_name: name.clone(),
                            context_ref,
                            unit_ref,
                            decimals,
                            value: String::new(),
                        });
                    }
                    _ => {}
                }

                path.push(name);
            }
            Ok(Event::Text(t)) => {
                let value = t
                    .unescape()
                    .map_err(|e| ParseError::Xml(e.to_string()))?
                    .to_string();
                let leaf = path.last().map(String::as_str).unwrap_or_default();

                if let Some((_, ctx)) = current_context.as_mut() {
                    match leaf {
                        "startDate" => ctx.period_start = parse_date(&value),
                        "endDate" => ctx.period_end = parse_date(&value),
                        "instant" => ctx.instant = parse_date(&value),
                        _ => {}
                    }
                } else if let Some(unit_id) = current_unit.as_ref() {
                    if leaf == "measure" {
                        units.insert(unit_id.clone(), value);
                    }
                } else if let Some(fact) = pending_fact.as_mut() {
                    fact.value = value;
                } else if leaf.contains("LevelOfRounding") {
                    level_of_rounding = Some(value);
                }
            }
            Ok(Event::End(e)) => {
                let name = local_name(e.name().as_ref());
                match name.as_str() {
                    "context" => {
                        if let Some((id, ctx)) = current_context.take() {
                            contexts.insert(id, ctx);
                        }
                    }
                    "unit" => current_unit = None,
                    _ => {
                        if let Some(fact) = pending_fact.take_if(|f| f.local_name == name) {
                            if fact.local_name.contains("LevelOfRounding") {
                                level_of_rounding = Some(fact.value.clone());
                            }
                            facts.push(fact);
                        }
                    }
                }
                path.pop();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ParseError::Xml(e.to_string()).into()),
        }
    }

    Ok(Document {
        contexts,
        units,
        facts,
        level_of_rounding,
    })
}

impl SourceParser for XbrlFinancialsParser {
    fn declared_schema(&self) -> SchemaRef {
        quarterly_financials_schema()
    }

    #[tracing::instrument(skip_all, fields(trade_date = %ctx.trade_date))]
    fn parse(&self, raw: &Bytes, ctx: &ParseContext) -> MandiResult<DataFrame> {
        let doc = read_document(raw)?;
        let divisor = doc
            .level_of_rounding
            .as_deref()
            .map(rounding_divisor)
            .unwrap_or(1.0);

        let mut fields: HashMap<CanonicalCol, f64> = HashMap::new();
        let mut symbol: Option<String> = None;
        let mut isin: Option<String> = None;
        let mut context_votes: HashMap<String, usize> = HashMap::new();

        for fact in &doc.facts {
            match fact.local_name.as_str() {
                "Symbol" | "NSESymbol" => {
                    symbol = Some(fact.value.trim().to_string());
                    continue;
                }
                "ISIN" => {
                    isin = Some(fact.value.trim().to_string());
                    continue;
                }
                _ => {}
            }

            let Some(col) = mapped_field(&fact.local_name) else {
                continue;
            };
            let Some(raw_value) = to_float(&fact.value) else {
                continue;
            };

            if let Some(context_ref) = &fact.context_ref {
                *context_votes.entry(context_ref.clone()).or_default() += 1;
            }

            let unit_text = fact
                .unit_ref
                .as_ref()
                .and_then(|u| doc.units.get(u))
                .cloned()
                .unwrap_or_default();

            // Negative decimals beat the file-level rounding; per-share
            // and pure measures are never scaled.
            let scaled = match fact
                .decimals
                .as_deref()
                .filter(|d| !d.eq_ignore_ascii_case("INF"))
                .and_then(|d| d.parse::<i32>().ok())
            {
                Some(dec) if dec < 0 => raw_value / 10f64.powi(-dec),
                _ if !is_unscaled_unit(&unit_text) && divisor != 1.0 => raw_value / divisor,
                _ => raw_value,
            };

            fields.entry(col).or_insert(scaled);
        }

        let main_context = context_votes
            .into_iter()
            .max_by_key(|(_, votes)| *votes)
            .and_then(|(id, _)| doc.contexts.get(&id).cloned())
            .unwrap_or_default();

        let symbol = symbol
            .or_else(|| ctx.symbol.clone())
            .ok_or_else(|| ParseError::MalformedPayload {
                source_name: ctx.source.to_string(),
                msg: "filing carries no symbol and none was supplied".to_string(),
            })?;

        tracing::info!(
            symbol = %symbol,
            facts = doc.facts.len(),
            mapped = fields.len(),
            rounding = doc.level_of_rounding.as_deref().unwrap_or("none"),
            "xbrl_parsed"
        );

        let period_end = main_context.period_end.or(main_context.instant);
        let business_key = format!(
            "{symbol}:{}",
            period_end.map(|d| d.to_string()).unwrap_or_default()
        );

        let field = |col: CanonicalCol| fields.get(&col).copied();
        let date_days = |d: Option<NaiveDate>| d.map(days_since_epoch);

        let frame = df! {
            CanonicalCol::EventId.as_str() =>
                vec![event_id(ctx.source.as_str(), ctx.trade_date, &business_key)],
            CanonicalCol::EntityId.as_str() => vec![format!("{symbol}::NSE")],
            CanonicalCol::Symbol.as_str() => vec![symbol],
            CanonicalCol::Isin.as_str() => vec![isin],
            CanonicalCol::PeriodStart.as_str() => vec![date_days(main_context.period_start)],
            CanonicalCol::PeriodEnd.as_str() => vec![date_days(period_end)],
            CanonicalCol::RevenueFromOperations.as_str() =>
                vec![field(CanonicalCol::RevenueFromOperations)],
            CanonicalCol::OtherIncome.as_str() => vec![field(CanonicalCol::OtherIncome)],
            CanonicalCol::TotalIncome.as_str() => vec![field(CanonicalCol::TotalIncome)],
            CanonicalCol::TotalExpenses.as_str() => vec![field(CanonicalCol::TotalExpenses)],
            CanonicalCol::ProfitBeforeTax.as_str() => vec![field(CanonicalCol::ProfitBeforeTax)],
            CanonicalCol::TaxExpense.as_str() => vec![field(CanonicalCol::TaxExpense)],
            CanonicalCol::ProfitAfterTax.as_str() => vec![field(CanonicalCol::ProfitAfterTax)],
            CanonicalCol::BasicEps.as_str() => vec![field(CanonicalCol::BasicEps)],
            CanonicalCol::DilutedEps.as_str() => vec![field(CanonicalCol::DilutedEps)],
        }
        .map_err(|e| DataError::Frame(e.to_string()))?;

        let frame = frame
            .lazy()
            .with_columns(envelope_literals(ctx))
            .with_columns(partition_literals(ctx.trade_date))
            .collect()
            .map_err(|e| DataError::Frame(e.to_string()))?;

        conform_to_schema(frame, &self.declared_schema())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::Source;

    fn ctx() -> ParseContext {
        ParseContext::new(
            Source::NseXbrlFiling,
            NaiveDate::from_ymd_opt(2024, 1, 15).expect("date"),
        )
        .with_symbol("RELIANCE")
    }

    fn fixture_xml() -> String {
        r#"<?xml version="1.0"?>
<xbrl xmlns:xbrli="http://www.xbrl.org/2003/instance" xmlns:in-bse-fin="http://example/fin">
  <xbrli:context id="FY24Q3">
    <xbrli:entity><xbrli:identifier scheme="http://nseindia.com">RELIANCE</xbrli:identifier></xbrli:entity>
    <xbrli:period>
      <xbrli:startDate>2023-10-01</xbrli:startDate>
      <xbrli:endDate>2023-12-31</xbrli:endDate>
    </xbrli:period>
  </xbrli:context>
  <xbrli:unit id="INR"><xbrli:measure>iso4217:INR</xbrli:measure></xbrli:unit>
  <xbrli:unit id="INRPerShare"><xbrli:measure>in-bse-fin:INRPerShare</xbrli:measure></xbrli:unit>
  <in-bse-fin:LevelOfRoundingUsedInFinancialStatements contextRef="FY24Q3">Crores</in-bse-fin:LevelOfRoundingUsedInFinancialStatements>
  <in-bse-fin:Symbol contextRef="FY24Q3">RELIANCE</in-bse-fin:Symbol>
  <in-bse-fin:RevenueFromOperations contextRef="FY24Q3" unitRef="INR">22500</in-bse-fin:RevenueFromOperations>
  <in-bse-fin:ProfitBeforeTax contextRef="FY24Q3" unitRef="INR">4100</in-bse-fin:ProfitBeforeTax>
  <in-bse-fin:BasicEarningsLossPerShareFromContinuingOperations contextRef="FY24Q3" unitRef="INRPerShare">25.5</in-bse-fin:BasicEarningsLossPerShareFromContinuingOperations>
</xbrl>"#
            .to_string()
    }

    #[test]
    fn monetary_facts_scale_per_share_facts_do_not() {
        let df = XbrlFinancialsParser
            .parse(&Bytes::from(fixture_xml()), &ctx())
            .expect("parse succeeds");
        assert_eq!(df.height(), 1);

        let revenue = df
            .column("revenue_from_operations")
            .and_then(|c| c.f64().cloned())
            .expect("revenue column");
        assert_eq!(revenue.get(0), Some(22500.0 / 1e7));

        let eps = df
            .column("basic_eps")
            .and_then(|c| c.f64().cloned())
            .expect("eps column");
        assert_eq!(eps.get(0), Some(25.5));
    }

    #[test]
    fn period_comes_from_the_dominant_context() {
        let df = XbrlFinancialsParser
            .parse(&Bytes::from(fixture_xml()), &ctx())
            .expect("parse succeeds");

        let end = df.column("period_end").expect("period_end column");
        assert_eq!(end.null_count(), 0);
    }

    #[test]
    fn broken_xml_is_fatal() {
        let err = XbrlFinancialsParser
            .parse(&Bytes::from("<xbrl><unclosed".to_string()), &ctx())
            .expect_err("must fail");
        assert!(!err.is_retryable());
    }
}
