use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

pub mod client;
pub mod coerce;
pub mod loader;
pub mod mappings;

pub use client::{ClickHouseClient, ColumnMeta};
pub use loader::{LoadOptions, LoadReport, WarehouseLoader};

/// OLAP tables the loader may target.
///
/// Idempotency at the warehouse is the table engine's concern: each
/// table is a ReplacingMergeTree keyed on (event_id, trade_date), so
/// re-loads merge away rather than duplicate.
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
    EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum WarehouseTable {
    RawEquityOhlc,
    NormalizedEquityOhlc,
    FeaturesEquityIndicators,
    BulkBlockDeals,
    IndexConstituents,
    OptionChain,
    TradingCalendar,
    CorporateActions,
    SymbolMaster,
    QuarterlyFinancials,
}

impl WarehouseTable {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Lake layer the table is fed from.
    pub fn layer(&self) -> crate::schema::Layer {
        use crate::schema::Layer;
        match self {
            Self::RawEquityOhlc => Layer::Raw,
            Self::NormalizedEquityOhlc | Self::BulkBlockDeals | Self::OptionChain => {
                Layer::Normalized
            }
            Self::FeaturesEquityIndicators => Layer::Features,
            Self::TradingCalendar
            | Self::CorporateActions
            | Self::SymbolMaster
            | Self::IndexConstituents
            | Self::QuarterlyFinancials => Layer::Reference,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_snake_case() {
        assert_eq!(
            WarehouseTable::NormalizedEquityOhlc.as_str(),
            "normalized_equity_ohlc"
        );
        assert_eq!(
            "bulk_block_deals".parse::<WarehouseTable>().expect("known"),
            WarehouseTable::BulkBlockDeals
        );
    }
}
