use chrono::Utc;
use polars::prelude::{
    BooleanChunked, DataFrame, DataType, Float64Chunked, Int64Chunked, Schema, StringChunked,
};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::{
    parse::days_since_epoch,
    schema::CanonicalCol,
    validate::{Severity, ValidatorState, Violation},
};

/// Tunables consumed by individual rules.
#[derive(Debug, Clone, Copy)]
pub struct RuleParams {
    /// `price_continuity` tolerance as a fraction of `prev_close`.
    pub max_price_change_pct: f64,
    /// `turnover_reasonableness` tolerance as a fraction of
    /// `volume * close`.
    pub turnover_tolerance: f64,
}

impl Default for RuleParams {
    fn default() -> Self {
        Self {
            max_price_change_pct: 0.20,
            turnover_tolerance: 0.01,
        }
    }
}

/// The built-in business rules.
///
/// Every rule applies only when the columns it references exist in the
/// frame, so the same rule set serves all datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum BusinessRule {
    OhlcHighLowConsistency,
    OhlcOpenInRange,
    OhlcCloseInRange,
    NonNegativePrices,
    NonNegativeVolume,
    VolumeWhenTrades,
    TurnoverReasonableness,
    PriceContinuity,
    TimestampNotFuture,
    IngestFreshness,
    DateRange,
    TradingDayCompleteness,
    AdjustmentFactorPositive,
    Uniqueness,
}

impl BusinessRule {
    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::TurnoverReasonableness
            | Self::PriceContinuity
            | Self::IngestFreshness
            | Self::TradingDayCompleteness => Severity::Warning,
            _ => Severity::Critical,
        }
    }

    /// Evaluate the rule over one slice, reporting indices relative to
    /// the full frame via `offset`.
    pub(crate) fn apply(
        &self,
        slice: &DataFrame,
        offset: usize,
        params: &RuleParams,
        state: &mut ValidatorState,
    ) -> Vec<Violation> {
        match self {
            Self::OhlcHighLowConsistency => self.high_low(slice, offset),
            Self::OhlcOpenInRange => self.price_in_range(slice, offset, CanonicalCol::Open),
            Self::OhlcCloseInRange => self.price_in_range(slice, offset, CanonicalCol::Close),
            Self::NonNegativePrices => self.non_negative_prices(slice, offset),
            Self::NonNegativeVolume => self.non_negative_volume(slice, offset),
            Self::VolumeWhenTrades => self.volume_when_trades(slice, offset),
            Self::TurnoverReasonableness => self.turnover(slice, offset, params),
            Self::PriceContinuity => self.continuity(slice, offset, params),
            Self::TimestampNotFuture => self.not_future(slice, offset),
            Self::IngestFreshness => self.freshness(slice, offset),
            Self::DateRange => self.date_range(slice, offset),
            Self::TradingDayCompleteness => self.trading_day(slice, offset),
            Self::AdjustmentFactorPositive => self.adjustment_factor(slice, offset),
            Self::Uniqueness => self.uniqueness(slice, offset, state),
        }
    }

    fn violation(&self, row_index: usize, field: &str, message: String) -> Violation {
        Violation {
            row_index,
            field: field.to_string(),
            message,
            validator: self.to_string(),
            severity: self.severity(),
        }
    }

    fn high_low(&self, slice: &DataFrame, offset: usize) -> Vec<Violation> {
        let (Some(high), Some(low)) = (
            f64_col(slice, CanonicalCol::High),
            f64_col(slice, CanonicalCol::Low),
        ) else {
            return Vec::new();
        };

        high.iter()
            .zip(low.iter())
            .enumerate()
            .filter_map(|(i, (h, l))| match (h, l) {
                (Some(h), Some(l)) if h < l => Some(self.violation(
                    offset + i,
                    "high,low",
                    format!("high ({h}) < low ({l})"),
                )),
                _ => None,
            })
            .collect()
    }

    fn price_in_range(&self, slice: &DataFrame, offset: usize, price: CanonicalCol) -> Vec<Violation> {
        let (Some(value), Some(high), Some(low)) = (
            f64_col(slice, price),
            f64_col(slice, CanonicalCol::High),
            f64_col(slice, CanonicalCol::Low),
        ) else {
            return Vec::new();
        };

        let field = price.as_str();
        value
            .iter()
            .zip(high.iter())
            .zip(low.iter())
            .enumerate()
            .filter_map(|(i, ((v, h), l))| match (v, h, l) {
                (Some(v), Some(h), Some(l)) if v < l || v > h => Some(self.violation(
                    offset + i,
                    field,
                    format!("{field} ({v}) outside [{l}, {h}]"),
                )),
                _ => None,
            })
            .collect()
    }

    fn non_negative_prices(&self, slice: &DataFrame, offset: usize) -> Vec<Violation> {
        const PRICE_COLS: [CanonicalCol; 7] = [
            CanonicalCol::PrevClose,
            CanonicalCol::Open,
            CanonicalCol::High,
            CanonicalCol::Low,
            CanonicalCol::Close,
            CanonicalCol::LastPrice,
            CanonicalCol::SettlementPrice,
        ];

        let mut violations = Vec::new();
        for col in PRICE_COLS {
            let Some(values) = f64_col(slice, col) else {
                continue;
            };
            for (i, value) in values.iter().enumerate() {
                if let Some(v) = value
                    && v < 0.0
                {
                    violations.push(self.violation(
                        offset + i,
                        col.as_str(),
                        format!("negative price {v}"),
                    ));
                }
            }
        }
        violations
    }

    fn non_negative_volume(&self, slice: &DataFrame, offset: usize) -> Vec<Violation> {
        let Some(volumes) = i64_col(slice, CanonicalCol::Volume) else {
            return Vec::new();
        };
        volumes
            .iter()
            .enumerate()
            .filter_map(|(i, v)| match v {
                Some(v) if v < 0 => Some(self.violation(
                    offset + i,
                    CanonicalCol::Volume.as_str(),
                    format!("negative volume {v}"),
                )),
                _ => None,
            })
            .collect()
    }

    fn volume_when_trades(&self, slice: &DataFrame, offset: usize) -> Vec<Violation> {
        let (Some(volumes), Some(trades)) = (
            i64_col(slice, CanonicalCol::Volume),
            i64_col(slice, CanonicalCol::Trades),
        ) else {
            return Vec::new();
        };

        volumes
            .iter()
            .zip(trades.iter())
            .enumerate()
            .filter_map(|(i, (v, t))| match (v, t) {
                (Some(v), Some(t)) if t > 0 && v <= 0 => Some(self.violation(
                    offset + i,
                    CanonicalCol::Volume.as_str(),
                    format!("{t} trades executed with volume {v}"),
                )),
                _ => None,
            })
            .collect()
    }

    fn turnover(&self, slice: &DataFrame, offset: usize, params: &RuleParams) -> Vec<Violation> {
        let (Some(turnover), Some(volumes), Some(closes)) = (
            f64_col(slice, CanonicalCol::Turnover),
            i64_col(slice, CanonicalCol::Volume),
            f64_col(slice, CanonicalCol::Close),
        ) else {
            return Vec::new();
        };

        let mut violations = Vec::new();
        for (i, ((t, v), c)) in turnover
            .iter()
            .zip(volumes.iter())
            .zip(closes.iter())
            .enumerate()
        {
            let (Some(t), Some(v), Some(c)) = (t, v, c) else {
                continue;
            };
            if v <= 0 || c <= 0.0 {
                continue;
            }
            let notional = v as f64 * c;
            let deviation = (t - notional).abs() / notional;
            if deviation > params.turnover_tolerance {
                violations.push(self.violation(
                    offset + i,
                    CanonicalCol::Turnover.as_str(),
                    format!(
                        "turnover {t} deviates {:.2}% from volume x close {notional}",
                        deviation * 100.0
                    ),
                ));
            }
        }
        violations
    }

    fn continuity(&self, slice: &DataFrame, offset: usize, params: &RuleParams) -> Vec<Violation> {
        let (Some(prev), Some(closes)) = (
            f64_col(slice, CanonicalCol::PrevClose),
            f64_col(slice, CanonicalCol::Close),
        ) else {
            return Vec::new();
        };
        // Adjustment events legitimately reprice the series.
        let factors = f64_col(slice, CanonicalCol::AdjustmentFactor);

        let mut violations = Vec::new();
        for (i, (p, c)) in prev.iter().zip(closes.iter()).enumerate() {
            let (Some(p), Some(c)) = (p, c) else { continue };
            if p <= 0.0 {
                continue;
            }
            if let Some(factors) = &factors
                && factors.get(i).is_some_and(|f| (f - 1.0).abs() > f64::EPSILON)
            {
                continue;
            }
            let change = (c - p).abs() / p;
            if change > params.max_price_change_pct {
                violations.push(self.violation(
                    offset + i,
                    CanonicalCol::Close.as_str(),
                    format!("close moved {:.2}% against prev_close {p}", change * 100.0),
                ));
            }
        }
        violations
    }

    fn not_future(&self, slice: &DataFrame, offset: usize) -> Vec<Violation> {
        let Some(event_times) = i64_col(slice, CanonicalCol::EventTime) else {
            return Vec::new();
        };
        let limit = Utc::now().timestamp_millis() + 60_000;

        event_times
            .iter()
            .enumerate()
            .filter_map(|(i, t)| match t {
                Some(t) if t > limit => Some(self.violation(
                    offset + i,
                    CanonicalCol::EventTime.as_str(),
                    format!("event_time {t} is in the future"),
                )),
                _ => None,
            })
            .collect()
    }

    fn freshness(&self, slice: &DataFrame, offset: usize) -> Vec<Violation> {
        let Some(event_times) = i64_col(slice, CanonicalCol::EventTime) else {
            return Vec::new();
        };
        let now = Utc::now().timestamp_millis();
        const STALE_MS: i64 = 48 * 3600 * 1000;

        event_times
            .iter()
            .enumerate()
            .filter_map(|(i, t)| match t {
                Some(t) if now - t > STALE_MS => Some(self.violation(
                    offset + i,
                    CanonicalCol::EventTime.as_str(),
                    format!("event is {}h old", (now - t) / 3_600_000),
                )),
                _ => None,
            })
            .collect()
    }

    fn date_range(&self, slice: &DataFrame, offset: usize) -> Vec<Violation> {
        let Some(dates) = date_col(slice, CanonicalCol::TradeDate) else {
            return Vec::new();
        };
        let min_days = days_since_epoch(
            chrono::NaiveDate::from_ymd_opt(1990, 1, 1).expect("fixed lower bound"),
        );
        let max_days = days_since_epoch(Utc::now().date_naive());

        dates
            .iter()
            .enumerate()
            .filter_map(|(i, d)| match d {
                Some(d) if d < min_days || d > max_days => Some(self.violation(
                    offset + i,
                    CanonicalCol::TradeDate.as_str(),
                    format!("partition date outside [1990-01-01, today] ({d} days)"),
                )),
                _ => None,
            })
            .collect()
    }

    fn trading_day(&self, slice: &DataFrame, offset: usize) -> Vec<Violation> {
        let (Some(trading), Some(volumes)) = (
            bool_col(slice, CanonicalCol::IsTradingDay),
            i64_col(slice, CanonicalCol::Volume),
        ) else {
            return Vec::new();
        };

        trading
            .iter()
            .zip(volumes.iter())
            .enumerate()
            .filter_map(|(i, (t, v))| match (t, v) {
                (Some(true), Some(v)) if v <= 0 => Some(self.violation(
                    offset + i,
                    CanonicalCol::Volume.as_str(),
                    "no volume on a trading day".to_string(),
                )),
                _ => None,
            })
            .collect()
    }

    fn adjustment_factor(&self, slice: &DataFrame, offset: usize) -> Vec<Violation> {
        let Some(factors) = f64_col(slice, CanonicalCol::AdjustmentFactor) else {
            return Vec::new();
        };
        factors
            .iter()
            .enumerate()
            .filter_map(|(i, f)| match f {
                Some(f) if f <= 0.0 => Some(self.violation(
                    offset + i,
                    CanonicalCol::AdjustmentFactor.as_str(),
                    format!("adjustment_factor {f} must be positive"),
                )),
                _ => None,
            })
            .collect()
    }

    fn uniqueness(
        &self,
        slice: &DataFrame,
        offset: usize,
        state: &mut ValidatorState,
    ) -> Vec<Violation> {
        let (Some(sources), Some(entities), Some(dates)) = (
            str_col(slice, CanonicalCol::Source),
            str_col(slice, CanonicalCol::EntityId),
            date_col(slice, CanonicalCol::TradeDate),
        ) else {
            return Vec::new();
        };

        let mut violations = Vec::new();
        for (i, ((source, entity), date)) in sources
            .iter()
            .zip(entities.iter())
            .zip(dates.iter())
            .enumerate()
        {
            let key = format!(
                "{}|{}|{}",
                source.unwrap_or_default(),
                entity.unwrap_or_default(),
                date.map(|d| d.to_string()).unwrap_or_default()
            );
            if !state.seen_keys.insert(key) {
                violations.push(self.violation(
                    offset + i,
                    CanonicalCol::EntityId.as_str(),
                    "duplicate (source, entity_id, trade_date)".to_string(),
                ));
            }
        }
        violations
    }
}

// ================================================================================================
// Schema conformance
// ================================================================================================

/// Frame-level conformance against the declared schema: every envelope
/// column present with per-row non-null ids, and no dtype divergence on
/// declared columns.
pub(crate) fn schema_rule_violations(df: &DataFrame, schema: &Schema) -> Vec<Violation> {
    const REQUIRED_NON_NULL: [CanonicalCol; 3] = [
        CanonicalCol::EventId,
        CanonicalCol::EntityId,
        CanonicalCol::Source,
    ];

    let mut violations = Vec::new();
    let make = |row_index: usize, field: &str, message: String| Violation {
        row_index,
        field: field.to_string(),
        message,
        validator: "schema_conformance".to_string(),
        severity: Severity::Critical,
    };

    for required in REQUIRED_NON_NULL {
        if !schema.contains(required.as_str()) {
            continue;
        }
        match df.column(required.as_str()) {
            Err(_) => violations.push(make(
                0,
                required.as_str(),
                "required column missing".to_string(),
            )),
            Ok(column) => {
                if let Ok(values) = column.str() {
                    for (i, v) in values.iter().enumerate() {
                        if v.is_none_or(str::is_empty) {
                            violations.push(make(
                                i,
                                required.as_str(),
                                "required field is null".to_string(),
                            ));
                        }
                    }
                }
            }
        }
    }

    for (name, declared) in schema.iter() {
        if let Ok(column) = df.column(name)
            && column.dtype() != declared
        {
            violations.push(make(
                0,
                name,
                format!("dtype {} does not match declared {declared}", column.dtype()),
            ));
        }
    }

    violations
}

// ================================================================================================
// Typed column access
// ================================================================================================

pub(crate) fn f64_col(df: &DataFrame, col: CanonicalCol) -> Option<Float64Chunked> {
    df.column(col.as_str())
        .ok()
        .and_then(|c| c.cast(&DataType::Float64).ok())
        .and_then(|c| c.f64().cloned().ok())
}

pub(crate) fn i64_col(df: &DataFrame, col: CanonicalCol) -> Option<Int64Chunked> {
    df.column(col.as_str())
        .ok()
        .and_then(|c| c.cast(&DataType::Int64).ok())
        .and_then(|c| c.i64().cloned().ok())
}

pub(crate) fn bool_col(df: &DataFrame, col: CanonicalCol) -> Option<BooleanChunked> {
    df.column(col.as_str())
        .ok()
        .and_then(|c| c.bool().cloned().ok())
}

pub(crate) fn str_col(df: &DataFrame, col: CanonicalCol) -> Option<StringChunked> {
    df.column(col.as_str())
        .ok()
        .and_then(|c| c.str().cloned().ok())
}

/// Date columns as physical days-since-epoch; tolerates frames that
/// carry the raw integer representation.
pub(crate) fn date_col(df: &DataFrame, col: CanonicalCol) -> Option<polars::prelude::Int32Chunked> {
    df.column(col.as_str())
        .ok()
        .and_then(|c| c.cast(&DataType::Int32).ok())
        .and_then(|c| c.i32().cloned().ok())
}

#[cfg(test)]
mod tests {
    use polars::prelude::df;

    use super::*;

    #[test]
    fn rule_names_follow_the_published_vocabulary() {
        assert_eq!(
            BusinessRule::OhlcHighLowConsistency.to_string(),
            "ohlc_high_low_consistency"
        );
        assert_eq!(BusinessRule::Uniqueness.to_string(), "uniqueness");
        assert_eq!(BusinessRule::all().count(), 14);
    }

    #[test]
    fn warning_rules_do_not_block() {
        for rule in BusinessRule::all() {
            let expected = matches!(
                rule,
                BusinessRule::TurnoverReasonableness
                    | BusinessRule::PriceContinuity
                    | BusinessRule::IngestFreshness
                    | BusinessRule::TradingDayCompleteness
            );
            assert_eq!(rule.severity() == Severity::Warning, expected, "{rule}");
        }
    }

    #[test]
    fn rules_skip_frames_without_their_columns() {
        let df = df! { "unrelated" => &[1i64, 2, 3] }.expect("frame");
        let mut state = ValidatorState::default();
        for rule in BusinessRule::all() {
            let violations = rule.apply(&df, 0, &RuleParams::default(), &mut state);
            assert!(violations.is_empty(), "{rule} fired without its columns");
        }
    }

    #[test]
    fn turnover_tolerance_is_relative() {
        let df = df! {
            "turnover" => &[1010.0, 1200.0],
            "volume" => &[10i64, 10],
            "close" => &[100.0, 100.0],
        }
        .expect("frame");

        let mut state = ValidatorState::default();
        let violations = BusinessRule::TurnoverReasonableness.apply(
            &df,
            100,
            &RuleParams::default(),
            &mut state,
        );
        // 1% deviation passes, 20% fails; index is frame-global.
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].row_index, 101);
        assert_eq!(violations[0].severity, Severity::Warning);
    }

    #[test]
    fn continuity_ignores_adjusted_rows() {
        let df = df! {
            "prev_close" => &[100.0, 100.0],
            "close" => &[150.0, 150.0],
            "adjustment_factor" => &[1.0, 0.5],
        }
        .expect("frame");

        let mut state = ValidatorState::default();
        let violations =
            BusinessRule::PriceContinuity.apply(&df, 0, &RuleParams::default(), &mut state);
        // Only the unadjusted row trips the 20% threshold.
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].row_index, 0);
    }
}
