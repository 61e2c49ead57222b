use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use polars::prelude::{DataType, Field, PlSmallStr, Schema, SchemaRef};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

/// The standardized vocabulary for all mandi market data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum CanonicalCol {
    // ========================================================================
    // Event Envelope
    // ========================================================================
    /// Deterministic UUIDv5 of `{source}:{trade_date}:{business_key}`.
    EventId,
    /// Milliseconds since epoch; midnight UTC of the trading day.
    EventTime,
    /// Milliseconds since epoch at parse time.
    IngestTime,
    /// Source name (e.g. "NSE_EQ_BAR").
    Source,
    SchemaVersion,
    /// `SYMBOL:INSTRUMENT_ID:EXCHANGE` style identity string.
    EntityId,

    // ========================================================================
    // Identity
    // ========================================================================
    InstrumentId,
    Symbol,
    Exchange,
    Isin,
    InstrumentType,
    Series,
    CompanyName,

    // ========================================================================
    // Time Definitions
    // ========================================================================
    TradeDate,
    EffectiveDate,
    ExpiryDate,
    DealDate,
    CalendarDate,
    AdjustmentDate,
    PeriodStart,
    PeriodEnd,
    ListingDate,

    // ========================================================================
    // Equity Bar Payload
    // ========================================================================
    PrevClose,
    Open,
    High,
    Low,
    Close,
    LastPrice,
    SettlementPrice,
    Volume,
    Turnover,
    Trades,
    AdjustmentFactor,
    IsTradingDay,

    // ========================================================================
    // Bulk / Block Deals
    // ========================================================================
    ClientName,
    /// "BULK" or "BLOCK".
    DealType,
    /// "BUY" or "SELL".
    TransactionType,
    Quantity,
    TradePrice,
    Remarks,

    // ========================================================================
    // Index Constituents
    // ========================================================================
    IndexName,
    /// "ADD", "REMOVE" or "REBALANCE".
    Action,

    // ========================================================================
    // Option Chain
    // ========================================================================
    StrikePrice,
    /// "CE" or "PE".
    OptionType,
    UnderlyingValue,
    OpenInterest,
    ChangeInOpenInterest,
    ImpliedVolatility,

    // ========================================================================
    // Corporate Actions / Reference
    // ========================================================================
    ActionType,
    ExDate,
    Purpose,
    FaceValue,
    MarketLot,
    HolidayName,

    // ========================================================================
    // Quarterly Financials (XBRL)
    // ========================================================================
    RevenueFromOperations,
    OtherIncome,
    TotalIncome,
    TotalExpenses,
    ProfitBeforeTax,
    TaxExpense,
    ProfitAfterTax,
    BasicEps,
    DilutedEps,

    // ========================================================================
    // Partitioning & Quarantine
    // ========================================================================
    Year,
    Month,
    Day,
    ValidationErrors,
    SchemaName,
}

impl From<CanonicalCol> for PlSmallStr {
    fn from(value: CanonicalCol) -> Self {
        value.as_str().into()
    }
}

impl CanonicalCol {
    pub fn name(&self) -> PlSmallStr {
        (*self).into()
    }

    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn dtype(&self) -> DataType {
        match self {
            // Strings
            Self::EventId
            | Self::Source
            | Self::SchemaVersion
            | Self::EntityId
            | Self::InstrumentId
            | Self::Symbol
            | Self::Exchange
            | Self::Isin
            | Self::InstrumentType
            | Self::Series
            | Self::CompanyName
            | Self::ClientName
            | Self::DealType
            | Self::TransactionType
            | Self::Remarks
            | Self::IndexName
            | Self::Action
            | Self::OptionType
            | Self::ActionType
            | Self::Purpose
            | Self::HolidayName
            | Self::ValidationErrors
            | Self::SchemaName => DataType::String,

            // Epoch milliseconds
            Self::EventTime | Self::IngestTime => DataType::Int64,

            // Integers
            Self::Volume
            | Self::Trades
            | Self::Quantity
            | Self::OpenInterest
            | Self::ChangeInOpenInterest
            | Self::MarketLot => DataType::Int64,

            Self::Year | Self::Month | Self::Day => DataType::Int32,

            // Floats
            Self::PrevClose
            | Self::Open
            | Self::High
            | Self::Low
            | Self::Close
            | Self::LastPrice
            | Self::SettlementPrice
            | Self::Turnover
            | Self::AdjustmentFactor
            | Self::TradePrice
            | Self::StrikePrice
            | Self::UnderlyingValue
            | Self::ImpliedVolatility
            | Self::FaceValue
            | Self::RevenueFromOperations
            | Self::OtherIncome
            | Self::TotalIncome
            | Self::TotalExpenses
            | Self::ProfitBeforeTax
            | Self::TaxExpense
            | Self::ProfitAfterTax
            | Self::BasicEps
            | Self::DilutedEps => DataType::Float64,

            // Dates
            Self::TradeDate
            | Self::EffectiveDate
            | Self::ExpiryDate
            | Self::DealDate
            | Self::CalendarDate
            | Self::AdjustmentDate
            | Self::PeriodStart
            | Self::PeriodEnd
            | Self::ListingDate
            | Self::ExDate => DataType::Date,

            // Booleans
            Self::IsTradingDay => DataType::Boolean,
        }
    }

    pub fn field(&self) -> Field {
        Field::new(self.name(), self.dtype())
    }
}

fn envelope_fields() -> [Field; 6] {
    [
        CanonicalCol::EventId.field(),
        CanonicalCol::EventTime.field(),
        CanonicalCol::IngestTime.field(),
        CanonicalCol::Source.field(),
        CanonicalCol::SchemaVersion.field(),
        CanonicalCol::EntityId.field(),
    ]
}

fn partition_fields() -> [Field; 3] {
    [
        CanonicalCol::Year.field(),
        CanonicalCol::Month.field(),
        CanonicalCol::Day.field(),
    ]
}

pub fn equity_bar_schema() -> SchemaRef {
    let s = Schema::from_iter(
        envelope_fields()
            .into_iter()
            .chain([
                CanonicalCol::InstrumentId.field(),
                CanonicalCol::Symbol.field(),
                CanonicalCol::Exchange.field(),
                CanonicalCol::Isin.field(),
                CanonicalCol::InstrumentType.field(),
                CanonicalCol::Series.field(),
                CanonicalCol::TradeDate.field(),
                CanonicalCol::PrevClose.field(),
                CanonicalCol::Open.field(),
                CanonicalCol::High.field(),
                CanonicalCol::Low.field(),
                CanonicalCol::Close.field(),
                CanonicalCol::LastPrice.field(),
                CanonicalCol::SettlementPrice.field(),
                CanonicalCol::Volume.field(),
                CanonicalCol::Turnover.field(),
                CanonicalCol::Trades.field(),
                CanonicalCol::AdjustmentFactor.field(),
                CanonicalCol::AdjustmentDate.field(),
                CanonicalCol::IsTradingDay.field(),
            ])
            .chain(partition_fields()),
    );
    Arc::new(s)
}

pub fn bulk_block_deal_schema() -> SchemaRef {
    let s = Schema::from_iter(
        envelope_fields()
            .into_iter()
            .chain([
                CanonicalCol::Symbol.field(),
                CanonicalCol::ClientName.field(),
                CanonicalCol::DealType.field(),
                CanonicalCol::TransactionType.field(),
                CanonicalCol::Quantity.field(),
                CanonicalCol::TradePrice.field(),
                CanonicalCol::Remarks.field(),
                CanonicalCol::DealDate.field(),
            ])
            .chain(partition_fields()),
    );
    Arc::new(s)
}

pub fn index_constituent_schema() -> SchemaRef {
    let s = Schema::from_iter(
        envelope_fields()
            .into_iter()
            .chain([
                CanonicalCol::IndexName.field(),
                CanonicalCol::Symbol.field(),
                CanonicalCol::Series.field(),
                CanonicalCol::Isin.field(),
                CanonicalCol::Action.field(),
                CanonicalCol::EffectiveDate.field(),
            ])
            .chain(partition_fields()),
    );
    Arc::new(s)
}

pub fn option_chain_schema() -> SchemaRef {
    let s = Schema::from_iter(
        envelope_fields()
            .into_iter()
            .chain([
                CanonicalCol::Symbol.field(),
                CanonicalCol::ExpiryDate.field(),
                CanonicalCol::StrikePrice.field(),
                CanonicalCol::OptionType.field(),
                CanonicalCol::UnderlyingValue.field(),
                CanonicalCol::LastPrice.field(),
                CanonicalCol::OpenInterest.field(),
                CanonicalCol::ChangeInOpenInterest.field(),
                CanonicalCol::ImpliedVolatility.field(),
                CanonicalCol::Volume.field(),
                CanonicalCol::TradeDate.field(),
            ])
            .chain(partition_fields()),
    );
    Arc::new(s)
}

pub fn corporate_action_schema() -> SchemaRef {
    let s = Schema::from_iter(
        envelope_fields()
            .into_iter()
            .chain([
                CanonicalCol::Symbol.field(),
                CanonicalCol::Isin.field(),
                CanonicalCol::ActionType.field(),
                CanonicalCol::ExDate.field(),
                CanonicalCol::Purpose.field(),
                CanonicalCol::AdjustmentFactor.field(),
            ])
            .chain(partition_fields()),
    );
    Arc::new(s)
}

pub fn symbol_master_schema() -> SchemaRef {
    let s = Schema::from_iter([
        CanonicalCol::Symbol.field(),
        CanonicalCol::Isin.field(),
        CanonicalCol::InstrumentId.field(),
        CanonicalCol::CompanyName.field(),
        CanonicalCol::Series.field(),
        CanonicalCol::ListingDate.field(),
        CanonicalCol::FaceValue.field(),
        CanonicalCol::MarketLot.field(),
    ]);
    Arc::new(s)
}

pub fn trading_calendar_schema() -> SchemaRef {
    let s = Schema::from_iter([
        CanonicalCol::CalendarDate.field(),
        CanonicalCol::Exchange.field(),
        CanonicalCol::IsTradingDay.field(),
        CanonicalCol::HolidayName.field(),
        CanonicalCol::Year.field(),
    ]);
    Arc::new(s)
}

pub fn quarterly_financials_schema() -> SchemaRef {
    let s = Schema::from_iter(
        envelope_fields()
            .into_iter()
            .chain([
                CanonicalCol::Symbol.field(),
                CanonicalCol::Isin.field(),
                CanonicalCol::PeriodStart.field(),
                CanonicalCol::PeriodEnd.field(),
                CanonicalCol::RevenueFromOperations.field(),
                CanonicalCol::OtherIncome.field(),
                CanonicalCol::TotalIncome.field(),
                CanonicalCol::TotalExpenses.field(),
                CanonicalCol::ProfitBeforeTax.field(),
                CanonicalCol::TaxExpense.field(),
                CanonicalCol::ProfitAfterTax.field(),
                CanonicalCol::BasicEps.field(),
                CanonicalCol::DilutedEps.field(),
            ])
            .chain(partition_fields()),
    );
    Arc::new(s)
}

// ================================================================================================
// Lake layers
// ================================================================================================

/// Top-level lake layer a dataset lives under.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Layer {
    Raw,
    Normalized,
    Features,
    Reference,
}

// ================================================================================================
// Envelope helpers
// ================================================================================================

/// Deterministic event id: UUIDv5 over `{source}:{trade_date}:{business_key}`
/// in the DNS namespace.
pub fn event_id(source: &str, trade_date: NaiveDate, business_key: &str) -> String {
    let name = format!("{source}:{trade_date}:{business_key}");
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, name.as_bytes()).to_string()
}

/// Midnight UTC of the trading day, in epoch milliseconds.
pub fn event_time_ms(trade_date: NaiveDate) -> i64 {
    NaiveDateTime::new(trade_date, NaiveTime::MIN)
        .and_utc()
        .timestamp_millis()
}

/// Current wall clock in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Hive partition values derived from the trading day.
pub fn partition_values(trade_date: NaiveDate) -> (i32, i32, i32) {
    use chrono::Datelike;
    (
        trade_date.year(),
        trade_date.month() as i32,
        trade_date.day() as i32,
    )
}
