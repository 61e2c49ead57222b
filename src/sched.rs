use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use chrono_tz::Asia::Kolkata;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::{
    error::{MandiResult, SystemError},
    pipeline::{PipelineKernel, PipelineKind, PipelineRun},
};

/// Cron binding for one pipeline.
///
/// Expressions are six-field cron (seconds first) in UTC; the comments
/// carry the IST trading-desk times they encode (IST = UTC+05:30).
#[derive(Debug, Clone, Copy)]
pub struct PipelineSchedule {
    pub kind: PipelineKind,
    pub cron: &'static str,
    pub description: &'static str,
}

pub fn schedules() -> [PipelineSchedule; 8] {
    [
        PipelineSchedule {
            kind: PipelineKind::EquityDaily,
            // 18:00 IST weekdays.
            cron: "0 30 12 * * Mon-Fri",
            description: "NSE equity daily bars, weekdays 18:00 IST",
        },
        PipelineSchedule {
            kind: PipelineKind::BulkBlockDeals,
            // 15:00 IST weekdays.
            cron: "0 30 9 * * Mon-Fri",
            description: "Bulk/block deals, weekdays 15:00 IST",
        },
        PipelineSchedule {
            kind: PipelineKind::TradingCalendar,
            // Quarterly, first day of the quarter.
            cron: "0 0 2 1 1,4,7,10 *",
            description: "Trading calendar refresh, quarterly",
        },
        PipelineSchedule {
            kind: PipelineKind::IndexConstituents,
            // 19:00 IST daily.
            cron: "0 30 13 * * *",
            description: "Index constituents, daily 19:00 IST",
        },
        PipelineSchedule {
            kind: PipelineKind::OptionChainSnapshot,
            // Every 30 minutes across market hours (09:15-15:30 IST).
            cron: "0 15,45 4-9 * * Mon-Fri",
            description: "Option chain snapshot, every 30 min during market hours",
        },
        PipelineSchedule {
            kind: PipelineKind::CombinedEquity,
            // 20:00 IST weekdays.
            cron: "0 30 14 * * Mon-Fri",
            description: "Combined NSE+BSE equity, weekdays 20:00 IST",
        },
        PipelineSchedule {
            kind: PipelineKind::CorporateActions,
            // 18:30 IST weekdays, after the bhavcopy run.
            cron: "0 0 13 * * Mon-Fri",
            description: "Corporate-action disclosures, weekdays 18:30 IST",
        },
        PipelineSchedule {
            kind: PipelineKind::QuarterlyFinancials,
            // Mid-month after the quarter closes.
            cron: "0 0 4 15 1,4,7,10 *",
            description: "Quarterly XBRL financials",
        },
    ]
}

/// Trading date a trigger without an explicit date refers to: today on
/// the exchange's clock.
pub fn today_ist() -> NaiveDate {
    chrono::Utc::now().with_timezone(&Kolkata).date_naive()
}

/// Cron front-end over the pipeline kernel: deploys the standing
/// schedule and keeps a record of completed runs.
pub struct Scheduler {
    kernel: Arc<PipelineKernel>,
    runs: Arc<Mutex<Vec<PipelineRun>>>,
}

impl Scheduler {
    pub fn new(kernel: Arc<PipelineKernel>) -> Self {
        Self {
            kernel,
            runs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Trigger one pipeline immediately, tracking the run.
    pub async fn trigger(&self, kind: PipelineKind, trade_date: NaiveDate) -> PipelineRun {
        let run = self.kernel.run(kind, trade_date).await;
        if let Ok(mut runs) = self.runs.lock() {
            runs.push(run.clone());
        }
        run
    }

    pub fn completed_runs(&self) -> Vec<PipelineRun> {
        self.runs.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Register every schedule and start the cron loop. Resolves once
    /// the scheduler is running; jobs fire in the background until the
    /// process exits.
    #[tracing::instrument(skip_all)]
    pub async fn deploy(&self) -> MandiResult<()> {
        let mut scheduler = JobScheduler::new()
            .await
            .map_err(|e| SystemError::Scheduler(e.to_string()))?;

        for schedule in schedules() {
            let kernel = self.kernel.clone();
            let runs = self.runs.clone();
            let kind = schedule.kind;

            let job = Job::new_async(schedule.cron, move |_id, _scheduler| {
                let kernel = kernel.clone();
                let runs = runs.clone();
                Box::pin(async move {
                    let trade_date = today_ist();
                    let run = kernel.run(kind, trade_date).await;
                    if let Ok(mut runs) = runs.lock() {
                        runs.push(run);
                    }
                })
            })
            .map_err(|e| SystemError::Scheduler(e.to_string()))?;

            scheduler
                .add(job)
                .await
                .map_err(|e| SystemError::Scheduler(e.to_string()))?;
            tracing::info!(
                pipeline = kind.as_str(),
                cron = schedule.cron,
                "pipeline_scheduled"
            );
        }

        scheduler
            .start()
            .await
            .map_err(|e| SystemError::Scheduler(e.to_string()))?;
        tracing::info!(pipelines = schedules().len(), "scheduler_deployed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_pipeline_is_scheduled_once() {
        let all = schedules();
        let mut kinds: Vec<&str> = all.iter().map(|s| s.kind.as_str()).collect();
        kinds.sort_unstable();
        kinds.dedup();
        assert_eq!(kinds.len(), all.len());
    }

    #[test]
    fn cron_expressions_have_seconds_field() {
        for schedule in schedules() {
            assert_eq!(
                schedule.cron.split_whitespace().count(),
                6,
                "{}",
                schedule.cron
            );
        }
    }
}
