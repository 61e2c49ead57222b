use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{breaker::BreakerRegistry, config::MandiConfig, error::MandiResult};

/// Per-run execution context threaded through every pipeline step.
///
/// Carries the shared breaker registry, the cancellation token and the
/// run deadline; there are no process-wide mutable singletons beyond
/// the metrics registry, so everything a step needs arrives here.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub config: Arc<MandiConfig>,
    pub breakers: Arc<BreakerRegistry>,
    pub cancel: CancellationToken,
    started: Instant,
    deadline: Duration,
}

impl RunContext {
    pub fn new(config: Arc<MandiConfig>, breakers: Arc<BreakerRegistry>) -> Self {
        let deadline = config.pipeline.run_deadline;
        Self {
            run_id: Uuid::new_v4(),
            config,
            breakers,
            cancel: CancellationToken::new(),
            started: Instant::now(),
            deadline,
        }
    }

    /// Cancel the run when the deadline elapses. Cancellation is
    /// cooperative: steps observe the token at their next I/O boundary.
    pub fn spawn_deadline_watchdog(&self) {
        let cancel = self.cancel.clone();
        let remaining = self.remaining();
        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            if !cancel.is_cancelled() {
                tracing::warn!("run_deadline_exceeded_cancelling");
                cancel.cancel();
            }
        });
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_sub(self.started.elapsed())
    }

    pub fn check_active(&self) -> MandiResult<()> {
        if self.cancel.is_cancelled() {
            Err(crate::error::SystemError::InvariantViolation(
                "pipeline run cancelled".to_string(),
            )
            .into())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Arc<MandiConfig> {
        Arc::new(MandiConfig::from_env().expect("env config"))
    }

    #[tokio::test]
    async fn watchdog_cancels_after_deadline() {
        let mut cfg = (*config()).clone();
        cfg.pipeline.run_deadline = Duration::from_millis(20);
        let ctx = RunContext::new(Arc::new(cfg), Arc::new(BreakerRegistry::new()));

        assert!(ctx.check_active().is_ok());
        ctx.spawn_deadline_watchdog();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(ctx.check_active().is_err());
    }

    #[test]
    fn remaining_shrinks_from_the_configured_deadline() {
        let ctx = RunContext::new(config(), Arc::new(BreakerRegistry::new()));
        assert!(ctx.remaining() <= ctx.config.pipeline.run_deadline);
    }
}
