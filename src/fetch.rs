use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    breaker::BreakerConfig,
    error::{MandiResult, NetworkError},
    retry::RetryPolicy,
};

// ================================================================================================
// Sources
// ================================================================================================

/// Named external data providers.
///
/// Each source carries its own schema version, retry budget and
/// circuit-breaker configuration; breakers are keyed by the source name
/// so a failing provider never trips another.
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
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    NseEqBar,
    BseEqBar,
    NseBulkDeals,
    NseIndexConstituent,
    NseOptionChain,
    NseMaster,
    NseCorporateActions,
    NseXbrlFiling,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn schema_version(&self) -> &'static str {
        match self {
            Self::NseEqBar => "udiff-2.0",
            Self::BseEqBar => "bse-eq-1.0",
            Self::NseBulkDeals => "deals-1.0",
            Self::NseIndexConstituent => "constituents-1.0",
            Self::NseOptionChain => "option-chain-1.0",
            Self::NseMaster => "equity-l-1.0",
            Self::NseCorporateActions => "cf-ca-1.0",
            Self::NseXbrlFiling => "xbrl-v1",
        }
    }

    /// Per-source retry budget. Exchange archive endpoints tolerate more
    /// attempts than the rate-limited JSON APIs.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::NseEqBar | Self::BseEqBar | Self::NseMaster => {
                RetryPolicy::default().with_max_attempts(3)
            }
            Self::NseBulkDeals
            | Self::NseIndexConstituent
            | Self::NseCorporateActions
            | Self::NseXbrlFiling => RetryPolicy::default().with_max_attempts(2),
            Self::NseOptionChain => RetryPolicy::default()
                .with_max_attempts(2)
                .with_initial_backoff(Duration::from_secs(5)),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        match self {
            Self::NseOptionChain => BreakerConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_secs(120),
            },
            _ => BreakerConfig::default(),
        }
    }
}

/// Whether a large-trade disclosure row crossed the bulk or the block
/// threshold; drives both the fetch URL and the lake sub-partition.
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
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DealKind {
    Bulk,
    Block,
}

impl DealKind {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Parameters keying one fetch.
///
/// Date-keyed sources use only `trade_date`; symbol- and index-keyed
/// sources add their discriminator.
#[derive(Debug, Clone)]
pub struct FetchParams {
    pub trade_date: NaiveDate,
    pub symbol: Option<String>,
    pub index: Option<String>,
    pub deal_kind: Option<DealKind>,
}

impl FetchParams {
    pub fn for_date(trade_date: NaiveDate) -> Self {
        Self {
            trade_date,
            symbol: None,
            index: None,
            deal_kind: None,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn with_deal_kind(mut self, deal_kind: DealKind) -> Self {
        self.deal_kind = Some(deal_kind);
        self
    }
}

/// Result of a fetch.
///
/// A 404 from a date-keyed source is a legitimate outcome (holiday,
/// not-yet-published date), not an error: the caller records a zero-row
/// idempotency marker and moves on.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Payload(Bytes),
    NotFound,
}

impl FetchOutcome {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Contract every source transport implements.
///
/// Implementations own HTTP session setup and transport-level
/// decompression (gzip, brotli); archive formats (ZIP) are the parser's
/// concern. Fetchers run behind the circuit breaker of their source.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, source: Source, params: &FetchParams) -> MandiResult<FetchOutcome>;
}

// ================================================================================================
// HTTP fetcher
// ================================================================================================

/// Production fetcher speaking HTTP to the exchange endpoints.
///
/// The reqwest client is cheap to clone and internally synchronized, so
/// one fetcher is shared across the worker pool.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> MandiResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .user_agent("Mozilla/5.0 (X11; Linux x86_64) mandi/1.0")
            .build()
            .map_err(|e| NetworkError::Transport {
                url: String::new(),
                msg: e.to_string(),
            })?;
        Ok(Self { client })
    }

    fn url_for(&self, source: Source, params: &FetchParams) -> String {
        let d = params.trade_date;
        match source {
            Source::NseEqBar => format!(
                "https://nsearchives.nseindia.com/content/cm/BhavCopy_NSE_CM_0_0_0_{}_F_0000.csv.zip",
                d.format("%Y%m%d")
            ),
            Source::BseEqBar => format!(
                "https://www.bseindia.com/download/BhavCopy/Equity/EQ{}.CSV",
                d.format("%d%m%y")
            ),
            Source::NseBulkDeals => {
                let kind = match params.deal_kind.unwrap_or(DealKind::Bulk) {
                    DealKind::Bulk => "bulk_deals",
                    DealKind::Block => "block_deals",
                };
                format!(
                    "https://www.nseindia.com/api/historicalOR/bulk-block-short-deals?optionType={kind}&from={from}&to={to}&csv=true",
                    from = d.format("%d-%m-%Y"),
                    to = d.format("%d-%m-%Y"),
                )
            }
            Source::NseIndexConstituent => format!(
                "https://www.nseindia.com/api/equity-stockIndices?index={}",
                params.index.as_deref().unwrap_or("NIFTY%2050")
            ),
            Source::NseOptionChain => format!(
                "https://www.nseindia.com/api/option-chain-indices?symbol={}",
                params.symbol.as_deref().unwrap_or("NIFTY")
            ),
            Source::NseCorporateActions => {
                // Forward window: upcoming ex-dates are what price
                // adjustment of this date's bars needs.
                let to = d + chrono::Duration::days(30);
                format!(
                    "https://www.nseindia.com/api/corporates-corporateActions?index=equities&from_date={from}&to_date={to}&csv=true",
                    from = d.format("%d-%m-%Y"),
                    to = to.format("%d-%m-%Y"),
                )
            }
            Source::NseMaster => {
                "https://nsearchives.nseindia.com/content/equities/EQUITY_L.csv".to_string()
            }
            Source::NseXbrlFiling => format!(
                "https://nsearchives.nseindia.com/corporate/xbrl/{}_{}.xml",
                params.symbol.as_deref().unwrap_or_default(),
                d.format("%Y%m%d"),
            ),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[tracing::instrument(skip_all, fields(source = %source, trade_date = %params.trade_date))]
    async fn fetch(&self, source: Source, params: &FetchParams) -> MandiResult<FetchOutcome> {
        let url = self.url_for(source, params);

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                NetworkError::Timeout { url: url.clone() }
            } else {
                NetworkError::Transport {
                    url: url.clone(),
                    msg: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status.as_u16() == 404 {
            tracing::info!(url = %url, "fetch_not_found");
            return Ok(FetchOutcome::NotFound);
        }
        if status.as_u16() == 429 {
            return Err(NetworkError::RateLimited { url }.into());
        }
        if !status.is_success() {
            return Err(NetworkError::Status {
                url,
                status: status.as_u16(),
            }
            .into());
        }

        let body = response.bytes().await.map_err(|e| NetworkError::Transport {
            url: url.clone(),
            msg: e.to_string(),
        })?;

        crate::metrics::file_downloaded(source.as_str());
        tracing::info!(url = %url, bytes = body.len(), "fetch_complete");
        Ok(FetchOutcome::Payload(body))
    }
}
