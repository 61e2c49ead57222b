use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

pub mod context;
pub mod kernel;
pub mod run;

pub use context::RunContext;
pub use kernel::PipelineKernel;
pub use run::{PipelineRun, RunStatus, StepMetrics};

/// The logical pipelines the scheduler can trigger.
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
#[strum(serialize_all = "kebab-case")]
pub enum PipelineKind {
    /// NSE equity daily bars into the normalized lake and warehouse.
    EquityDaily,
    /// NSE + BSE bars combined with ISIN dedup (NSE preferred).
    CombinedEquity,
    /// Bulk and block large-trade disclosures.
    BulkBlockDeals,
    /// Index membership snapshots.
    IndexConstituents,
    /// Intraday option-chain snapshot (minute-grain at finest).
    OptionChainSnapshot,
    /// Corporate-action disclosures (splits, bonuses, dividends).
    CorporateActions,
    /// Derived trading-day reference calendar.
    TradingCalendar,
    /// Quarterly XBRL financial filings.
    QuarterlyFinancials,
}

impl PipelineKind {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_names_are_kebab_case() {
        assert_eq!(PipelineKind::EquityDaily.as_str(), "equity-daily");
        assert_eq!(
            "combined-equity".parse::<PipelineKind>().expect("known"),
            PipelineKind::CombinedEquity
        );
    }
}
