//! Three-state circuit breaker around fallible actions.
//!
//! `Closed -> Open` after `failure_threshold` consecutive failures.
//! `Open -> HalfOpen` once `reset_timeout_ms` has elapsed since the last failure.
//! `HalfOpen -> Closed` on the next success, `HalfOpen -> Open` on the next failure.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::types::Millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

/// Serializable view of the breaker for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<Millis>,
}

/// The call was short-circuited because the breaker is open.
///
/// Distinct from a failure: it never increments failure counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blocked {
    pub retry_in_ms: u64,
}

/// Result of [`CircuitBreaker::execute`].
#[derive(Debug)]
pub enum BreakerCall<T> {
    Blocked(Blocked),
    Completed(anyhow::Result<T>),
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Millis>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            last_failure_time: self.last_failure_time,
        }
    }

    /// Decide whether a call may proceed at `now_ms`.
    ///
    /// Moves `Open -> HalfOpen` when the reset timeout has elapsed.
    pub fn try_acquire(&mut self, now_ms: Millis) -> Result<(), Blocked> {
        if self.state != CircuitState::Open {
            return Ok(());
        }
        let elapsed = now_ms.saturating_sub(self.last_failure_time.unwrap_or(0));
        if elapsed >= self.settings.reset_timeout_ms {
            debug!(elapsed_ms = elapsed, "circuit half-open, allowing trial call");
            self.state = CircuitState::HalfOpen;
            return Ok(());
        }
        let retry_in_ms = self.settings.reset_timeout_ms - elapsed;
        warn!(retry_in_ms, "circuit open, call blocked");
        Err(Blocked { retry_in_ms })
    }

    pub fn record_success(&mut self) {
        if self.state == CircuitState::HalfOpen {
            info!("circuit reset to closed");
        }
        self.state = CircuitState::Closed;
        self.failure_count = 0;
    }

    pub fn record_failure(&mut self, now_ms: Millis) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(now_ms);
        let trip = self.state == CircuitState::HalfOpen
            || self.failure_count >= self.settings.failure_threshold;
        if trip && self.state != CircuitState::Open {
            error!(failures = self.failure_count, "circuit tripped to open");
            self.state = CircuitState::Open;
        }
    }

    /// Run `action` through the breaker.
    ///
    /// While open (and before the timeout), `action` is never invoked.
    /// An `Err` from `action` counts as a failure and is handed back to the caller.
    pub async fn execute<T, F, Fut>(&mut self, now_ms: Millis, action: F) -> BreakerCall<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Err(blocked) = self.try_acquire(now_ms) {
            return BreakerCall::Blocked(blocked);
        }
        let result = action().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(now_ms),
        }
        BreakerCall::Completed(result)
    }
}
