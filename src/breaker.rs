use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use strum::{Display, EnumString, IntoStaticStr};

use crate::error::{MandiError, MandiResult, SystemError};

/// Breaker states: CLOSED admits calls, OPEN fails them fast, and
/// HALF_OPEN admits a single probe after the recovery timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
}

/// A named circuit breaker guarding one external source.
///
/// Transitions are serialized by the inner mutex; the guarded work runs
/// outside the lock, so `guard()` / `on_success()` / `on_failure()` wrap
/// the call instead of owning it.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure_time: None,
            }),
        }
    }

    /// Admission check before invoking the wrapped function.
    ///
    /// In OPEN state this fails with `CircuitOpen` without invoking
    /// anything, unless the recovery timeout has elapsed, in which case
    /// the breaker moves to HALF_OPEN and admits exactly this call.
    pub fn guard(&self) -> MandiResult<()> {
        let mut inner = self.lock()?;
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    tracing::info!(breaker = %self.name, "breaker_half_open");
                    Ok(())
                } else {
                    Err(MandiError::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    pub fn on_success(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.state == BreakerState::HalfOpen {
                tracing::info!(breaker = %self.name, "breaker_recovered");
            }
            inner.state = BreakerState::Closed;
            inner.failure_count = 0;
        }
    }

    pub fn on_failure(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.last_failure_time = Some(Instant::now());
            match inner.state {
                BreakerState::HalfOpen => {
                    inner.state = BreakerState::Open;
                    tracing::warn!(breaker = %self.name, "breaker_reopened");
                }
                BreakerState::Closed => {
                    inner.failure_count += 1;
                    if inner.failure_count >= self.config.failure_threshold {
                        inner.state = BreakerState::Open;
                        tracing::warn!(
                            breaker = %self.name,
                            failures = inner.failure_count,
                            "breaker_opened"
                        );
                    }
                }
                BreakerState::Open => {}
            }
        }
    }

    /// Force the breaker back to CLOSED.
    pub fn reset(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.state = BreakerState::Closed;
            inner.failure_count = 0;
            inner.last_failure_time = None;
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner
            .lock()
            .map(|i| i.state)
            .unwrap_or(BreakerState::Open)
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().map(|i| i.failure_count).unwrap_or(0)
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == BreakerState::Closed
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MandiResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| SystemError::InvariantViolation("breaker mutex poisoned".to_string()).into())
    }
}

/// Registry of breakers keyed by source name.
///
/// Failures in one source never trip another; state is process-local.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut map = match self.breakers.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn reset_all(&self) {
        if let Ok(map) = self.breakers.lock() {
            for breaker in map.values() {
                breaker.reset();
            }
        }
    }
}
