//! Structured per-tick records published by the control loop.
//!
//! Reports are plain serializable values. Consumers subscribe to a
//! broadcast channel; a slow or absent subscriber never blocks the loop.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::core::circuit_breaker::BreakerSnapshot;
use crate::core::guard::GuardReport;
use crate::core::rate_limiter::RateLimiterState;
use crate::core::test_loop::TestLoopStatus;
use crate::core::types::{ActionCategory, Millis, RuntimeStatus};
use crate::core::verdict::CompletionVerdict;
use crate::core::watchdog::EscalationState;
use crate::resume::ActionOutcome;
use crate::strategies::CategoryCounters;

const REPORT_CAPACITY: usize = 64;

/// What a tick ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickAction {
    /// Snapshot was not actionable.
    Idle,
    Dispatched,
    GuardBlocked,
    BreakerBlocked,
    RateLimited,
    ChannelError,
}

/// Coarse cause of a failed tick, for display and log filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Transport,
    /// Every strategy of a category failed.
    Exhausted,
    Unknown,
}

impl FailureKind {
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout
        } else if ["disconnected", "channel unavailable", "connection", "socket"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            Self::Transport
        } else if lower.contains("exhausted") {
            Self::Exhausted
        } else {
            Self::Unknown
        }
    }
}

/// Aggregate counters across the life of the loop.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SafetyCounters {
    pub blocked_unsafe: u64,
    pub breaker_blocked: u64,
    pub rate_limited: u64,
    pub channel_errors: u64,
    pub dispatched: u64,
    pub categories: BTreeMap<ActionCategory, CategoryCounters>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    pub tick: u32,
    pub at: Millis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RuntimeStatus>,
    pub action: TickAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard: Option<GuardReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch: Option<ActionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub escalation: EscalationState,
    pub breaker: BreakerSnapshot,
    pub rate_limit: RateLimiterState,
    pub test_loop: TestLoopStatus,
    pub verdict: CompletionVerdict,
    pub counters: SafetyCounters,
    pub consecutive_failures: u32,
    pub next_sleep_ms: u64,
    pub note: String,
}

/// Fan-out for tick reports.
#[derive(Debug, Clone)]
pub struct TickBroadcaster {
    tx: broadcast::Sender<TickReport>,
}

impl TickBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(REPORT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TickReport> {
        self.tx.subscribe()
    }

    pub fn publish(&self, report: TickReport) {
        if self.tx.send(report).is_err() {
            trace!("no report subscribers");
        }
    }
}

impl Default for TickBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
