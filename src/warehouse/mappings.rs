use crate::warehouse::WarehouseTable;

/// Static column-name mappings: normalized frame column → warehouse
/// column.
///
/// Mappings are lookup tables fixed at build time; a column absent from
/// its table's map loads under its own name. The equity tables keep the
/// exchange's UDiFF vocabulary on the warehouse side so existing SQL
/// written against raw NSE files keeps working.
const EQUITY_OHLC_MAPPING: &[(&str, &str)] = &[
    ("trade_date", "TradDt"),
    ("symbol", "TckrSymb"),
    ("open", "OpnPric"),
    ("high", "HghPric"),
    ("low", "LwPric"),
    ("close", "ClsPric"),
    ("last_price", "LastPric"),
    ("prev_close", "PrvsClsgPric"),
    ("settlement_price", "SttlmPric"),
    ("volume", "TtlTradgVol"),
    ("turnover", "TtlTrfVal"),
    ("trades", "TtlNbOfTxsExctd"),
    ("isin", "ISIN"),
    ("instrument_id", "FinInstrmId"),
    ("instrument_type", "FinInstrmTp"),
    ("series", "SctySrs"),
    ("exchange", "Src"),
];

pub fn column_mapping(table: WarehouseTable) -> &'static [(&'static str, &'static str)] {
    match table {
        WarehouseTable::RawEquityOhlc | WarehouseTable::NormalizedEquityOhlc => {
            EQUITY_OHLC_MAPPING
        }
        // The remaining tables were designed against the normalized
        // vocabulary; they load by identity.
        _ => &[],
    }
}

/// Warehouse name for a normalized frame column.
pub fn map_column(table: WarehouseTable, frame_column: &str) -> &str {
    column_mapping(table)
        .iter()
        .find(|(from, _)| *from == frame_column)
        .map(|(_, to)| *to)
        .unwrap_or(frame_column)
}

/// Warehouse columns that must be present after mapping; their absence
/// fails the load before any insert.
pub fn required_columns(table: WarehouseTable) -> &'static [&'static str] {
    match table {
        WarehouseTable::RawEquityOhlc | WarehouseTable::NormalizedEquityOhlc => {
            &["event_id", "TradDt", "TckrSymb", "ClsPric"]
        }
        WarehouseTable::FeaturesEquityIndicators => &["event_id", "trade_date", "symbol"],
        WarehouseTable::BulkBlockDeals => {
            &["event_id", "symbol", "deal_type", "transaction_type", "deal_date"]
        }
        WarehouseTable::IndexConstituents => {
            &["event_id", "index_name", "symbol", "effective_date"]
        }
        WarehouseTable::OptionChain => {
            &["event_id", "symbol", "expiry_date", "strike_price", "option_type"]
        }
        WarehouseTable::TradingCalendar => &["calendar_date", "exchange"],
        WarehouseTable::CorporateActions => &["event_id", "symbol", "action_type", "ex_date"],
        WarehouseTable::SymbolMaster => &["symbol"],
        WarehouseTable::QuarterlyFinancials => &["event_id", "symbol", "period_end"],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equity_columns_map_to_udiff_names() {
        assert_eq!(
            map_column(WarehouseTable::NormalizedEquityOhlc, "close"),
            "ClsPric"
        );
        assert_eq!(
            map_column(WarehouseTable::NormalizedEquityOhlc, "volume"),
            "TtlTradgVol"
        );
        // Envelope columns pass through unmapped.
        assert_eq!(
            map_column(WarehouseTable::NormalizedEquityOhlc, "event_id"),
            "event_id"
        );
    }

    #[test]
    fn identity_tables_keep_their_names() {
        assert_eq!(map_column(WarehouseTable::OptionChain, "strike_price"), "strike_price");
        assert!(column_mapping(WarehouseTable::TradingCalendar).is_empty());
    }

    #[test]
    fn every_table_declares_required_columns() {
        use strum::IntoEnumIterator;
        for table in WarehouseTable::iter() {
            assert!(!required_columns(table).is_empty(), "{table}");
        }
    }
}
