use std::{collections::HashMap, io::Cursor};

use bytes::Bytes;
use chrono::NaiveDate;
use polars::prelude::{
    CsvParseOptions, CsvReadOptions, DataFrame, NamedFrom, NullValues, SchemaRef, SerReader, df,
};

use crate::{
    error::{DataError, MandiResult},
    parse::{
        NULL_SENTINELS, ParseContext, SourceParser, check_schema_drift, conform_to_schema,
        csv_header, days_since_epoch,
    },
    schema::{CanonicalCol, equity_bar_schema, symbol_master_schema},
};

/// Parser for the NSE listed-securities master (`EQUITY_L.csv`), one row
/// per listed security. The master is a reference dataset: no event
/// envelope, no partitions.
pub struct SymbolMasterParser;

const MASTER_COLUMNS: [&str; 8] = [
    "SYMBOL",
    "NAME OF COMPANY",
    "SERIES",
    "DATE OF LISTING",
    "PAID UP VALUE",
    "MARKET LOT",
    "ISIN NUMBER",
    "FACE VALUE",
];

fn master_input_schema() -> polars::prelude::Schema {
    polars::prelude::Schema::from_iter(
        MASTER_COLUMNS
            .iter()
            .map(|n| polars::prelude::Field::new((*n).into(), polars::prelude::DataType::String)),
    )
}

impl SourceParser for SymbolMasterParser {
    fn declared_schema(&self) -> SchemaRef {
        symbol_master_schema()
    }

    #[tracing::instrument(skip_all)]
    fn parse(&self, raw: &Bytes, ctx: &ParseContext) -> MandiResult<DataFrame> {
        let header = csv_header(raw)?;
        check_schema_drift(ctx.source, &header, &master_input_schema())?;

        // NSE pads the header cells; read untyped and address columns by
        // position after the drift check has pinned the layout.
        let nulls = NULL_SENTINELS.iter().map(|s| (*s).into()).collect();
        let raw_df = CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(Some(0))
            .with_parse_options(
                CsvParseOptions::default().with_null_values(Some(NullValues::AllColumns(nulls))),
            )
            .into_reader_with_file_handle(Cursor::new(raw.as_ref()))
            .finish()
            .map_err(|e| DataError::Frame(e.to_string()))?;

        let text_col = |idx: usize| -> MandiResult<Vec<Option<String>>> {
            let name = raw_df.get_column_names()[idx].as_str();
            Ok(raw_df
                .column(name)
                .and_then(|c| c.str().cloned())
                .map_err(|e| DataError::Frame(e.to_string()))?
                .iter()
                .map(|v| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
                .collect())
        };

        let symbols = text_col(0)?;
        let companies = text_col(1)?;
        let series = text_col(2)?;
        let listing_dates = text_col(3)?;
        let _paid_up = text_col(4)?;
        let market_lots = text_col(5)?;
        let isins = text_col(6)?;
        let face_values = text_col(7)?;

        let mut out_symbols = Vec::new();
        let mut out_isins: Vec<Option<String>> = Vec::new();
        let mut out_companies: Vec<Option<String>> = Vec::new();
        let mut out_series: Vec<Option<String>> = Vec::new();
        let mut out_listing: Vec<Option<i32>> = Vec::new();
        let mut out_face: Vec<Option<f64>> = Vec::new();
        let mut out_lot: Vec<Option<i64>> = Vec::new();

        for i in 0..raw_df.height() {
            let Some(symbol) = symbols[i].clone() else {
                continue;
            };
            out_symbols.push(symbol);
            out_isins.push(isins[i].clone());
            out_companies.push(companies[i].clone());
            out_series.push(series[i].clone());
            out_listing.push(
                listing_dates[i]
                    .as_deref()
                    .and_then(|d| NaiveDate::parse_from_str(d, "%d-%b-%Y").ok())
                    .map(days_since_epoch),
            );
            out_face.push(face_values[i].as_deref().and_then(|v| v.parse().ok()));
            out_lot.push(market_lots[i].as_deref().and_then(|v| v.parse().ok()));
        }

        tracing::info!(securities = out_symbols.len(), "symbol_master_parsed");

        let df = df! {
            CanonicalCol::Symbol.as_str() => &out_symbols,
            CanonicalCol::Isin.as_str() => out_isins,
            // The NSE equity master keys securities by ticker; it is the
            // instrument id for the EQ segment.
            CanonicalCol::InstrumentId.as_str() => &out_symbols,
            CanonicalCol::CompanyName.as_str() => out_companies,
            CanonicalCol::Series.as_str() => out_series,
            CanonicalCol::ListingDate.as_str() => out_listing,
            CanonicalCol::FaceValue.as_str() => out_face,
            CanonicalCol::MarketLot.as_str() => out_lot,
        }
        .map_err(|e| DataError::Frame(e.to_string()))?;

        conform_to_schema(df, &self.declared_schema())
    }
}

// ================================================================================================
// Enrichment
// ================================================================================================

/// Fill missing `instrument_id` values on an equity-bar frame from the
/// symbol master: exact (symbol, isin) matches first, then a
/// symbol-only fallback for securities whose ISIN diverges between
/// exchanges.
#[tracing::instrument(skip_all)]
pub fn enrich_with_instrument_ids(bars: DataFrame, master: &DataFrame) -> MandiResult<DataFrame> {
    let read_str = |df: &DataFrame, col: CanonicalCol| -> MandiResult<Vec<Option<String>>> {
        Ok(df
            .column(col.as_str())
            .and_then(|c| c.str().cloned())
            .map_err(|e| DataError::Frame(e.to_string()))?
            .iter()
            .map(|v| v.map(str::to_string))
            .collect())
    };

    let m_symbols = read_str(master, CanonicalCol::Symbol)?;
    let m_isins = read_str(master, CanonicalCol::Isin)?;
    let m_ids = read_str(master, CanonicalCol::InstrumentId)?;

    let mut exact: HashMap<(String, String), String> = HashMap::new();
    let mut by_symbol: HashMap<String, String> = HashMap::new();
    for i in 0..master.height() {
        let (Some(symbol), Some(id)) = (m_symbols[i].clone(), m_ids[i].clone()) else {
            continue;
        };
        if let Some(isin) = m_isins[i].clone() {
            exact.entry((symbol.clone(), isin)).or_insert(id.clone());
        }
        by_symbol.entry(symbol).or_insert(id);
    }

    let b_symbols = read_str(&bars, CanonicalCol::Symbol)?;
    let b_isins = read_str(&bars, CanonicalCol::Isin)?;
    let b_ids = read_str(&bars, CanonicalCol::InstrumentId)?;

    let mut matched = 0usize;
    let enriched_ids: Vec<Option<String>> = (0..bars.height())
        .map(|i| {
            if b_ids[i].is_some() {
                return b_ids[i].clone();
            }
            let Some(symbol) = b_symbols[i].as_ref() else {
                return None;
            };
            let hit = b_isins[i]
                .as_ref()
                .and_then(|isin| exact.get(&(symbol.clone(), isin.clone())))
                .or_else(|| by_symbol.get(symbol));
            if hit.is_some() {
                matched += 1;
            }
            hit.cloned()
        })
        .collect();

    tracing::info!(rows = bars.height(), enriched = matched, "symbol_enrichment_complete");

    let mut bars = bars;
    bars.with_column(polars::prelude::Series::new(
        CanonicalCol::InstrumentId.name(),
        enriched_ids,
    ))
    .map_err(|e| DataError::Frame(e.to_string()))?;

    conform_to_schema(bars, &equity_bar_schema())
}
