//! Escalation watchdog.
//!
//! Tracks repeated recovery failures while the assistant is waiting and arms
//! the "force full prompt" resume variant once failures reach `threshold`,
//! gated by `cooldown_ms` since the last arming.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::types::Millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogSettings {
    pub threshold: u32,
    pub cooldown_ms: u64,
    pub max_events: usize,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            threshold: 3,
            cooldown_ms: 5 * 60 * 1000,
            max_events: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationEventKind {
    Armed,
    Suppressed,
    Reset,
    Consumed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub at: Millis,
    pub event: EscalationEventKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EscalationState {
    pub consecutive_failures: u32,
    pub armed: bool,
    pub last_armed_at: Option<Millis>,
    pub reason: Option<String>,
    pub events: VecDeque<EscalationEvent>,
}

#[derive(Debug, Clone)]
pub struct EscalationWatchdog {
    settings: WatchdogSettings,
    state: EscalationState,
}

impl EscalationWatchdog {
    pub fn new(settings: WatchdogSettings) -> Self {
        Self {
            settings: WatchdogSettings {
                max_events: settings.max_events.max(1),
                ..settings
            },
            state: EscalationState::default(),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.state.armed
    }

    pub fn state(&self) -> &EscalationState {
        &self.state
    }

    /// A best-effort recovery attempt failed while waiting.
    pub fn record_failure(&mut self, now_ms: Millis, detail: &str) {
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        let failures = self.state.consecutive_failures;

        if failures < self.settings.threshold {
            debug!(failures, threshold = self.settings.threshold, "escalation suppressed");
            self.push(
                now_ms,
                EscalationEventKind::Suppressed,
                format!(
                    "below threshold ({failures}/{}): {detail}",
                    self.settings.threshold
                ),
            );
            return;
        }

        if let Some(last) = self.state.last_armed_at {
            let since = now_ms.saturating_sub(last);
            if since < self.settings.cooldown_ms {
                let remaining = self.settings.cooldown_ms - since;
                debug!(remaining_ms = remaining, "escalation cooldown active");
                self.push(
                    now_ms,
                    EscalationEventKind::Suppressed,
                    format!("cooldown active ({remaining}ms remaining): {detail}"),
                );
                return;
            }
        }

        warn!(failures, %detail, "escalation armed");
        self.state.armed = true;
        self.state.last_armed_at = Some(now_ms);
        self.state.reason = Some(detail.to_string());
        self.push(
            now_ms,
            EscalationEventKind::Armed,
            format!("{failures} consecutive failures: {detail}"),
        );
    }

    /// Recovery or resume succeeded without using an armed escalation.
    pub fn record_success(&mut self, now_ms: Millis, detail: &str) {
        self.reset(now_ms, detail);
    }

    /// The armed escalation was used by a resume attempt that succeeded.
    pub fn consume(&mut self, now_ms: Millis) {
        if !self.state.armed {
            return;
        }
        info!("escalation consumed");
        self.push(
            now_ms,
            EscalationEventKind::Consumed,
            "forced full prompt delivered".to_string(),
        );
        self.reset(now_ms, "escalation consumed");
    }

    /// The snapshot left the waiting condition without recovery involvement.
    pub fn clear_waiting(&mut self, now_ms: Millis) {
        if self.state.consecutive_failures == 0 && !self.state.armed {
            return;
        }
        self.reset(now_ms, "waiting cleared");
    }

    fn reset(&mut self, now_ms: Millis, detail: &str) {
        self.state.consecutive_failures = 0;
        self.state.armed = false;
        self.state.reason = None;
        self.push(now_ms, EscalationEventKind::Reset, detail.to_string());
    }

    fn push(&mut self, at: Millis, event: EscalationEventKind, detail: String) {
        self.state.events.push_back(EscalationEvent { at, event, detail });
        while self.state.events.len() > self.settings.max_events {
            self.state.events.pop_front();
        }
    }
}
