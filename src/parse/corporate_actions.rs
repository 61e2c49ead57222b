use std::{collections::HashMap, io::Cursor};

use bytes::Bytes;
use chrono::NaiveDate;
use polars::prelude::{
    CsvParseOptions, CsvReadOptions, DataFrame, IntoLazy, NamedFrom, NullValues, SchemaRef,
    SerReader, Series, df,
};
use regex::Regex;

use crate::{
    error::{DataError, MandiResult, ParseError},
    parse::{
        NULL_SENTINELS, ParseContext, SourceParser, conform_to_schema, csv_header,
        days_since_epoch, envelope_literals, partition_literals,
    },
    schema::{CanonicalCol, corporate_action_schema, equity_bar_schema, event_id},
};

/// Parser for the NSE corporate-actions disclosure CSV (CF-CA).
///
/// Each row is one announced action keyed by (symbol, ex-date). The
/// adjustment factor is derived from the free-text `Purpose` column:
/// a face-value split of Rs x to Rs y yields x/y, a bonus of a:b yields
/// (a+b)/b. Dividends are recorded but do not reprice the series.
pub struct CorporateActionsParser;

/// Logical input columns and the header spellings seen in the wild.
const HEADER_VARIANTS: [(&str, &[&str]); 5] = [
    ("symbol", &["Symbol", "SYMBOL"]),
    ("series", &["Series", "SERIES"]),
    ("isin", &["ISIN", "Isin"]),
    ("purpose", &["Purpose", "PURPOSE"]),
    ("ex_date", &["Ex-Date", "Ex Date", "EX-DATE", "ExDate"]),
];

fn canonical_header(name: &str) -> Option<&'static str> {
    let trimmed = name.trim();
    HEADER_VARIANTS
        .iter()
        .find(|(_, variants)| variants.iter().any(|v| v.eq_ignore_ascii_case(trimmed)))
        .map(|(canonical, _)| *canonical)
}

/// Classified action with its price-adjustment factor.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedAction {
    pub action_type: &'static str,
    pub adjustment_factor: f64,
}

/// Derive the action type and factor from the disclosure's purpose
/// text.
///
/// - `Face Value Split ... From Rs 10 ... To Rs 5` → SPLIT, 10/5 = 2.0
/// - `Bonus 1:2` (1 new share per 2 held) → BONUS, (1+2)/2 = 1.5
/// - `Dividend ...` → DIVIDEND, 1.0 (the series is not repriced; the
///   cash amount is not a capital change)
/// - anything else → OTHER, 1.0
pub fn classify_purpose(purpose: &str) -> ClassifiedAction {
    let upper = purpose.to_uppercase();

    if upper.contains("SPLIT") || upper.contains("SUB-DIVISION") {
        let face_values = Regex::new(r"(?i)R[SE]\.?\s*(\d+(?:\.\d+)?)").expect("static pattern");
        let values: Vec<f64> = face_values
            .captures_iter(purpose)
            .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse().ok()))
            .collect();
        let factor = match values.as_slice() {
            [old_fv, new_fv, ..] if *new_fv > 0.0 => old_fv / new_fv,
            _ => 1.0,
        };
        return ClassifiedAction {
            action_type: "SPLIT",
            adjustment_factor: factor,
        };
    }

    if upper.contains("BONUS") {
        let ratio = Regex::new(r"(\d+)\s*:\s*(\d+)").expect("static pattern");
        let factor = ratio
            .captures(purpose)
            .and_then(|c| {
                let new: f64 = c.get(1)?.as_str().parse().ok()?;
                let existing: f64 = c.get(2)?.as_str().parse().ok()?;
                (existing > 0.0).then_some((new + existing) / existing)
            })
            .unwrap_or(1.0);
        return ClassifiedAction {
            action_type: "BONUS",
            adjustment_factor: factor,
        };
    }

    if upper.contains("DIVIDEND") {
        return ClassifiedAction {
            action_type: "DIVIDEND",
            adjustment_factor: 1.0,
        };
    }

    ClassifiedAction {
        action_type: "OTHER",
        adjustment_factor: 1.0,
    }
}

fn parse_ex_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%d-%b-%Y")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}

impl SourceParser for CorporateActionsParser {
    fn declared_schema(&self) -> SchemaRef {
        corporate_action_schema()
    }

    #[tracing::instrument(skip_all, fields(trade_date = %ctx.trade_date))]
    fn parse(&self, raw: &Bytes, ctx: &ParseContext) -> MandiResult<DataFrame> {
        let header = csv_header(raw)?;

        let mut missing: Vec<String> = Vec::new();
        for required in ["symbol", "purpose", "ex_date"] {
            if !header.iter().any(|h| canonical_header(h) == Some(required)) {
                missing.push(required.to_string());
            }
        }
        if !missing.is_empty() {
            let extra = header
                .iter()
                .filter(|h| canonical_header(h).is_none())
                .cloned()
                .collect();
            return Err(ParseError::SchemaDrift {
                source_name: ctx.source.to_string(),
                missing,
                extra,
            }
            .into());
        }

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

        let column = |name: &str| -> MandiResult<Vec<Option<String>>> {
            Ok(raw_df
                .column(name)
                .and_then(|c| c.str().cloned())
                .map_err(|e| DataError::Frame(e.to_string()))?
                .iter()
                .map(|v| v.map(|s| s.trim().to_string()))
                .collect())
        };

        let symbols = column("symbol")?;
        let purposes = column("purpose")?;
        let ex_dates = column("ex_date")?;
        let has = |name: &str| raw_df.get_column_names().iter().any(|n| n.as_str() == name);
        let isins: Vec<Option<String>> = if has("isin") {
            column("isin")?
        } else {
            vec![None; raw_df.height()]
        };

        let mut out_event_ids: Vec<String> = Vec::new();
        let mut out_entity_ids: Vec<String> = Vec::new();
        let mut out_symbols: Vec<String> = Vec::new();
        let mut out_isins: Vec<Option<String>> = Vec::new();
        let mut out_actions: Vec<&'static str> = Vec::new();
        let mut out_ex_dates: Vec<i32> = Vec::new();
        let mut out_purposes: Vec<String> = Vec::new();
        let mut out_factors: Vec<f64> = Vec::new();

        for i in 0..raw_df.height() {
            let Some(symbol) = symbols[i].as_deref().filter(|s| !s.is_empty()) else {
                continue;
            };
            let Some(purpose) = purposes[i].as_deref() else {
                continue;
            };
            let Some(ex_date) = ex_dates[i].as_deref().and_then(parse_ex_date) else {
                continue;
            };

            let classified = classify_purpose(purpose);
            let business_key = format!("{symbol}:{ex_date}:{}", classified.action_type);
            out_event_ids.push(event_id(ctx.source.as_str(), ctx.trade_date, &business_key));
            out_entity_ids.push(format!("{symbol}:{}:{ex_date}", classified.action_type));
            out_symbols.push(symbol.to_string());
            out_isins.push(isins[i].clone());
            out_actions.push(classified.action_type);
            out_ex_dates.push(days_since_epoch(ex_date));
            out_purposes.push(purpose.to_string());
            out_factors.push(classified.adjustment_factor);
        }

        tracing::info!(
            input_rows = raw_df.height(),
            actions = out_symbols.len(),
            "corporate_actions_parsed"
        );

        let df = df! {
            CanonicalCol::EventId.as_str() => out_event_ids,
            CanonicalCol::EntityId.as_str() => out_entity_ids,
            CanonicalCol::Symbol.as_str() => out_symbols,
            CanonicalCol::Isin.as_str() => out_isins,
            CanonicalCol::ActionType.as_str() => out_actions,
            CanonicalCol::ExDate.as_str() => out_ex_dates,
            CanonicalCol::Purpose.as_str() => out_purposes,
            CanonicalCol::AdjustmentFactor.as_str() => out_factors,
        }
        .map_err(|e| DataError::Frame(e.to_string()))?;

        let df = df
            .lazy()
            .with_columns(envelope_literals(ctx))
            .with_columns(partition_literals(ctx.trade_date))
            .collect()
            .map_err(|e| DataError::Frame(e.to_string()))?;

        conform_to_schema(df, &self.declared_schema())
    }
}

// ================================================================================================
// Price adjustment
// ================================================================================================

const PRICE_COLS: [CanonicalCol; 7] = [
    CanonicalCol::PrevClose,
    CanonicalCol::Open,
    CanonicalCol::High,
    CanonicalCol::Low,
    CanonicalCol::Close,
    CanonicalCol::LastPrice,
    CanonicalCol::SettlementPrice,
];

/// Reprice an equity-bar frame for corporate actions.
///
/// A bar is adjusted by the product of the factors of every action on
/// its symbol whose ex-date falls after the bar's trade date; prices
/// divide by that factor so the series stays continuous across splits
/// and bonuses. `adjustment_factor` records the applied factor and
/// `adjustment_date` the next ex-date; bars on or after the ex-date are
/// untouched (factor 1.0, date null).
#[tracing::instrument(skip_all)]
pub fn apply_adjustments(bars: DataFrame, actions: &DataFrame) -> MandiResult<DataFrame> {
    if bars.height() == 0 || actions.height() == 0 {
        return Ok(bars);
    }

    let str_col = |df: &DataFrame, col: CanonicalCol| -> MandiResult<Vec<Option<String>>> {
        Ok(df
            .column(col.as_str())
            .and_then(|c| c.str().cloned())
            .map_err(|e| DataError::Frame(e.to_string()))?
            .iter()
            .map(|v| v.map(str::to_string))
            .collect())
    };
    let date_col = |df: &DataFrame, col: CanonicalCol| -> MandiResult<Vec<Option<i32>>> {
        Ok(df
            .column(col.as_str())
            .and_then(|c| c.cast(&polars::prelude::DataType::Int32))
            .and_then(|c| c.i32().cloned())
            .map_err(|e| DataError::Frame(e.to_string()))?
            .iter()
            .collect())
    };

    // symbol -> [(ex_date_days, factor)]
    let a_symbols = str_col(actions, CanonicalCol::Symbol)?;
    let a_ex_dates = date_col(actions, CanonicalCol::ExDate)?;
    let a_factors: Vec<Option<f64>> = actions
        .column(CanonicalCol::AdjustmentFactor.as_str())
        .and_then(|c| c.f64().cloned())
        .map_err(|e| DataError::Frame(e.to_string()))?
        .iter()
        .collect();

    let mut by_symbol: HashMap<String, Vec<(i32, f64)>> = HashMap::new();
    for i in 0..actions.height() {
        let (Some(symbol), Some(ex_date), Some(factor)) =
            (a_symbols[i].clone(), a_ex_dates[i], a_factors[i])
        else {
            continue;
        };
        if factor > 0.0 {
            by_symbol.entry(symbol).or_default().push((ex_date, factor));
        }
    }

    let b_symbols = str_col(&bars, CanonicalCol::Symbol)?;
    let b_dates = date_col(&bars, CanonicalCol::TradeDate)?;

    let mut factors = Vec::with_capacity(bars.height());
    let mut adjustment_dates: Vec<Option<i32>> = Vec::with_capacity(bars.height());
    let mut adjusted_rows = 0usize;

    for i in 0..bars.height() {
        let events = b_symbols[i]
            .as_ref()
            .and_then(|symbol| by_symbol.get(symbol));
        let (Some(events), Some(trade_days)) = (events, b_dates[i]) else {
            factors.push(1.0);
            adjustment_dates.push(None);
            continue;
        };

        let mut factor = 1.0;
        let mut next_ex: Option<i32> = None;
        for (ex_days, event_factor) in events {
            if *ex_days > trade_days {
                factor *= event_factor;
                next_ex = Some(next_ex.map_or(*ex_days, |d| d.min(*ex_days)));
            }
        }

        if (factor - 1.0).abs() > f64::EPSILON {
            adjusted_rows += 1;
        }
        factors.push(factor);
        adjustment_dates.push(next_ex);
    }

    tracing::info!(
        rows = bars.height(),
        adjusted = adjusted_rows,
        actions = actions.height(),
        "price_adjustment_applied"
    );

    let mut bars = bars;
    for col in PRICE_COLS {
        let values: Vec<Option<f64>> = bars
            .column(col.as_str())
            .and_then(|c| c.f64().cloned())
            .map_err(|e| DataError::Frame(e.to_string()))?
            .iter()
            .enumerate()
            .map(|(i, v)| v.map(|v| v / factors[i]))
            .collect();
        bars.with_column(Series::new(col.name(), values))
            .map_err(|e| DataError::Frame(e.to_string()))?;
    }

    bars.with_column(Series::new(CanonicalCol::AdjustmentFactor.name(), factors))
        .map_err(|e| DataError::Frame(e.to_string()))?;
    bars.with_column(Series::new(
        CanonicalCol::AdjustmentDate.name(),
        adjustment_dates,
    ))
    .map_err(|e| DataError::Frame(e.to_string()))?;

    conform_to_schema(bars, &equity_bar_schema())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::Source;

    fn ctx() -> ParseContext {
        ParseContext::new(
            Source::NseCorporateActions,
            NaiveDate::from_ymd_opt(2024, 1, 10).expect("date"),
        )
    }

    fn fixture_csv() -> String {
        "Symbol,Company Name,Series,Face Value,Purpose,Ex-Date,Record Date\n\
         RELIANCE,Reliance Industries,EQ,10,\"Face Value Split (Sub-Division) - From Rs 10/- Per Share To Rs 5/- Per Share\",15-Jan-2024,16-Jan-2024\n\
         TCS,Tata Consultancy,EQ,1,Bonus 1:1,20-Jan-2024,21-Jan-2024\n\
         INFY,Infosys,EQ,5,Dividend - Rs 18 Per Share,18-Jan-2024,19-Jan-2024\n"
            .to_string()
    }

    #[test]
    fn splits_derive_factor_from_face_values() {
        let split = classify_purpose(
            "Face Value Split (Sub-Division) - From Rs 10/- Per Share To Rs 5/- Per Share",
        );
        assert_eq!(split.action_type, "SPLIT");
        assert_eq!(split.adjustment_factor, 2.0);

        // Reverse split: face value rises.
        let reverse = classify_purpose("Consolidation Split From Rs 1 To Rs 2");
        assert_eq!(reverse.adjustment_factor, 0.5);
    }

    #[test]
    fn bonus_factor_is_new_plus_existing_over_existing() {
        assert_eq!(classify_purpose("Bonus 1:1").adjustment_factor, 2.0);
        assert_eq!(classify_purpose("Bonus 1:2").adjustment_factor, 1.5);
        assert_eq!(classify_purpose("Bonus 2:5").adjustment_factor, 1.4);
    }

    #[test]
    fn dividends_and_unknowns_do_not_reprice() {
        let dividend = classify_purpose("Dividend - Rs 18 Per Share");
        assert_eq!(dividend.action_type, "DIVIDEND");
        assert_eq!(dividend.adjustment_factor, 1.0);

        let other = classify_purpose("Annual General Meeting");
        assert_eq!(other.action_type, "OTHER");
        assert_eq!(other.adjustment_factor, 1.0);
    }

    #[test]
    fn parses_disclosures_into_canonical_actions() {
        let df = CorporateActionsParser
            .parse(&Bytes::from(fixture_csv()), &ctx())
            .expect("parse succeeds");
        assert_eq!(df.height(), 3);
        assert_eq!(&**df.schema(), &*corporate_action_schema());

        let action_col = df
            .column("action_type")
            .and_then(|c| c.str().cloned())
            .expect("action column");
        let actions: Vec<Option<&str>> = action_col.iter().collect();
        assert_eq!(actions, vec![Some("SPLIT"), Some("BONUS"), Some("DIVIDEND")]);

        let factors = df
            .column("adjustment_factor")
            .and_then(|c| c.f64().cloned())
            .expect("factor column");
        assert_eq!(factors.get(0), Some(2.0));
        assert_eq!(factors.get(1), Some(2.0));
        assert_eq!(factors.get(2), Some(1.0));
    }

    #[test]
    fn missing_purpose_column_is_schema_drift() {
        let raw = Bytes::from("Symbol,Ex-Date\nRELIANCE,15-Jan-2024\n".to_string());
        let err = CorporateActionsParser
            .parse(&raw, &ctx())
            .expect_err("drift fails");
        assert!(err.to_string().contains("purpose"));
    }

    #[test]
    fn bars_before_the_ex_date_are_repriced() {
        use crate::parse::nse_bar::NseBarParser;

        // Bar dated 2024-01-10; RELIANCE splits 2:1 on 2024-01-15.
        let bar_csv = {
            let header = "TradDt,BizDt,Sgmt,Src,FinInstrmTp,FinInstrmId,ISIN,TckrSymb,SctySrs,\
                 XpryDt,FininstrmActlXpryDt,StrkPric,OptnTp,FinInstrmNm,OpnPric,HghPric,LwPric,\
                 ClsPric,LastPric,PrvsClsgPric,UndrlygPric,SttlmPric,OpnIntrst,ChngInOpnIntrst,\
                 TtlTradgVol,TtlTrfVal,TtlNbOfTxsExctd,SsnId,NewBrdLotQty,Rmks,Rsvd1,Rsvd2,Rsvd3,Rsvd4";
            format!(
                "{header}\n\
                 2024-01-10,2024-01-10,CM,NSE,STK,2885,INE002A01018,RELIANCE,EQ,-,-,-,-,RELIANCE LTD,\
                 2500.0,2550.0,2480.0,2520.0,2520.0,2500.0,-,2520.0,0,0,1000,2520000.0,50,F1,1,-,-,-,-,-\n\
                 2024-01-10,2024-01-10,CM,NSE,STK,11536,INE467B01029,TCS,EQ,-,-,-,-,TCS LTD,\
                 3800.0,3850.0,3790.0,3830.0,3830.0,3800.0,-,3830.0,0,0,800,3064000.0,30,F1,1,-,-,-,-,-\n"
            )
        };
        let bars = NseBarParser
            .parse(
                &Bytes::from(bar_csv),
                &ParseContext::new(
                    Source::NseEqBar,
                    NaiveDate::from_ymd_opt(2024, 1, 10).expect("date"),
                ),
            )
            .expect("bars parse");

        let actions = CorporateActionsParser
            .parse(
                &Bytes::from(
                    "Symbol,Company Name,Series,Face Value,Purpose,Ex-Date,Record Date\n\
                     RELIANCE,Reliance Industries,EQ,10,\
                     \"Face Value Split (Sub-Division) - From Rs 10/- Per Share To Rs 5/- Per Share\",\
                     15-Jan-2024,16-Jan-2024\n"
                        .to_string(),
                ),
                &ctx(),
            )
            .expect("actions parse");

        let adjusted = apply_adjustments(bars, &actions).expect("adjustment succeeds");

        let closes = adjusted
            .column("close")
            .and_then(|c| c.f64().cloned())
            .expect("close column");
        // RELIANCE divided by 2; TCS untouched.
        assert_eq!(closes.get(0), Some(1260.0));
        assert_eq!(closes.get(1), Some(3830.0));

        let factors = adjusted
            .column("adjustment_factor")
            .and_then(|c| c.f64().cloned())
            .expect("factor column");
        assert_eq!(factors.get(0), Some(2.0));
        assert_eq!(factors.get(1), Some(1.0));

        let dates = adjusted.column("adjustment_date").expect("date column");
        assert_eq!(dates.null_count(), 1);
    }

    #[test]
    fn bars_on_or_after_the_ex_date_are_untouched() {
        use crate::parse::nse_bar::NseBarParser;

        let header = "TradDt,BizDt,Sgmt,Src,FinInstrmTp,FinInstrmId,ISIN,TckrSymb,SctySrs,\
             XpryDt,FininstrmActlXpryDt,StrkPric,OptnTp,FinInstrmNm,OpnPric,HghPric,LwPric,\
             ClsPric,LastPric,PrvsClsgPric,UndrlygPric,SttlmPric,OpnIntrst,ChngInOpnIntrst,\
             TtlTradgVol,TtlTrfVal,TtlNbOfTxsExctd,SsnId,NewBrdLotQty,Rmks,Rsvd1,Rsvd2,Rsvd3,Rsvd4";
        let bar_csv = format!(
            "{header}\n\
             2024-01-15,2024-01-15,CM,NSE,STK,2885,INE002A01018,RELIANCE,EQ,-,-,-,-,RELIANCE LTD,\
             500.0,510.0,495.0,505.0,505.0,500.0,-,505.0,0,0,1000,505000.0,50,F1,1,-,-,-,-,-\n"
        );
        let bars = NseBarParser
            .parse(
                &Bytes::from(bar_csv),
                &ParseContext::new(
                    Source::NseEqBar,
                    NaiveDate::from_ymd_opt(2024, 1, 15).expect("date"),
                ),
            )
            .expect("bars parse");

        let actions = CorporateActionsParser
            .parse(
                &Bytes::from(
                    "Symbol,Company Name,Series,Face Value,Purpose,Ex-Date,Record Date\n\
                     RELIANCE,Reliance Industries,EQ,10,\
                     \"Face Value Split (Sub-Division) - From Rs 10/- Per Share To Rs 5/- Per Share\",\
                     15-Jan-2024,16-Jan-2024\n"
                        .to_string(),
                ),
                &ctx(),
            )
            .expect("actions parse");

        let adjusted = apply_adjustments(bars, &actions).expect("adjustment succeeds");

        let closes = adjusted
            .column("close")
            .and_then(|c| c.f64().cloned())
            .expect("close column");
        assert_eq!(closes.get(0), Some(505.0));

        let factors = adjusted
            .column("adjustment_factor")
            .and_then(|c| c.f64().cloned())
            .expect("factor column");
        assert_eq!(factors.get(0), Some(1.0));
    }
}
