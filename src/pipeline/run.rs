use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

use crate::{metrics, pipeline::PipelineKind};

/// Terminal state of one pipeline run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Failed,
    SkippedIdempotent,
}

/// Outcome of one step (fetch, parse, validate, write, load).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetrics {
    pub name: String,
    pub rows: u64,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Ephemeral record of one pipeline run; the structured end event and
/// the `flow_duration` histogram are both emitted from here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub pipeline: PipelineKind,
    pub parameters: BTreeMap<String, String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: Option<RunStatus>,
    pub steps: Vec<StepMetrics>,
}

impl PipelineRun {
    pub fn new(run_id: Uuid, pipeline: PipelineKind) -> Self {
        Self {
            run_id,
            pipeline,
            parameters: BTreeMap::new(),
            start_time: Utc::now(),
            end_time: None,
            status: None,
            steps: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, key: &str, value: impl ToString) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }

    pub fn record_step(
        &mut self,
        name: &str,
        rows: u64,
        duration: Duration,
        error: Option<String>,
    ) {
        self.steps.push(StepMetrics {
            name: name.to_string(),
            rows,
            duration,
            error,
        });
    }

    /// Close the run: stamps the end time, emits the structured end
    /// event and records the run histogram.
    pub fn finish(&mut self, status: RunStatus) {
        self.end_time = Some(Utc::now());
        self.status = Some(status);

        let elapsed = self
            .end_time
            .map(|end| (end - self.start_time).to_std().unwrap_or_default())
            .unwrap_or_default();

        let metric_status = match status {
            RunStatus::Success | RunStatus::SkippedIdempotent => "success",
            RunStatus::Failed => "failed",
        };
        metrics::flow_duration(self.pipeline.as_str(), metric_status, elapsed);

        let rows_per_step: Vec<(String, u64)> = self
            .steps
            .iter()
            .map(|s| (s.name.clone(), s.rows))
            .collect();
        let first_error = self.steps.iter().find_map(|s| s.error.clone());

        tracing::info!(
            run_id = %self.run_id,
            pipeline = self.pipeline.as_str(),
            status = %status,
            duration_ms = elapsed.as_millis() as u64,
            idempotent_skip = status == RunStatus::SkippedIdempotent,
            steps = ?rows_per_step,
            error = first_error.as_deref().unwrap_or(""),
            "pipeline_run_complete"
        );
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            Some(RunStatus::Success) | Some(RunStatus::SkippedIdempotent)
        )
    }

    /// Rows that reached the lake in this run.
    pub fn rows_written(&self) -> u64 {
        self.steps
            .iter()
            .filter(|s| s.name.starts_with("write"))
            .map(|s| s.rows)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_records_steps_and_finishes() {
        let mut run = PipelineRun::new(Uuid::new_v4(), PipelineKind::EquityDaily)
            .with_parameter("trade_date", "2024-01-15");

        run.record_step("fetch", 1, Duration::from_millis(120), None);
        run.record_step("write", 3, Duration::from_millis(40), None);
        run.finish(RunStatus::Success);

        assert!(run.is_success());
        assert_eq!(run.rows_written(), 3);
        assert!(run.end_time.is_some());
        assert_eq!(
            run.parameters.get("trade_date").map(String::as_str),
            Some("2024-01-15")
        );
    }

    #[test]
    fn failed_runs_surface_the_step_error() {
        let mut run = PipelineRun::new(Uuid::new_v4(), PipelineKind::BulkBlockDeals);
        run.record_step(
            "fetch",
            0,
            Duration::from_millis(10),
            Some("HTTP 503".to_string()),
        );
        run.finish(RunStatus::Failed);

        assert!(!run.is_success());
        assert_eq!(run.status, Some(RunStatus::Failed));
    }
}
