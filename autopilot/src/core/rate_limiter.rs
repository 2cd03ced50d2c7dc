//! Rolling-hour call budget.
//!
//! The hour boundary is checked lazily on every call instead of a background timer.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::types::Millis;

pub const HOUR_MS: u64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterState {
    pub calls_this_hour: u32,
    pub hour_start_time: Millis,
    pub max_calls_per_hour: u32,
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_calls_per_hour: u32,
    calls_this_hour: u32,
    hour_start_time: Millis,
}

impl RateLimiter {
    pub fn new(max_calls_per_hour: u32, now_ms: Millis) -> Self {
        Self {
            max_calls_per_hour,
            calls_this_hour: 0,
            hour_start_time: now_ms,
        }
    }

    pub fn can_make_call(&mut self, now_ms: Millis) -> bool {
        self.check_hour_reset(now_ms);
        let allowed = self.calls_this_hour < self.max_calls_per_hour;
        if !allowed {
            warn!(
                calls = self.calls_this_hour,
                max = self.max_calls_per_hour,
                "hourly rate limit reached"
            );
        }
        allowed
    }

    pub fn record_call(&mut self, now_ms: Millis) {
        self.check_hour_reset(now_ms);
        self.calls_this_hour = self.calls_this_hour.saturating_add(1);
        info!(
            calls = self.calls_this_hour,
            max = self.max_calls_per_hour,
            "call recorded"
        );
    }

    pub fn remaining_calls(&mut self, now_ms: Millis) -> u32 {
        self.check_hour_reset(now_ms);
        self.max_calls_per_hour.saturating_sub(self.calls_this_hour)
    }

    pub fn time_until_reset_ms(&self, now_ms: Millis) -> u64 {
        HOUR_MS.saturating_sub(now_ms.saturating_sub(self.hour_start_time))
    }

    /// Zero the counter once a full hour has elapsed since the last reset.
    pub fn check_hour_reset(&mut self, now_ms: Millis) {
        if now_ms.saturating_sub(self.hour_start_time) >= HOUR_MS {
            self.calls_this_hour = 0;
            self.hour_start_time = now_ms;
            info!("hourly rate limit reset");
        }
    }

    pub fn reset(&mut self, now_ms: Millis) {
        self.calls_this_hour = 0;
        self.hour_start_time = now_ms;
    }

    pub fn state(&self) -> RateLimiterState {
        RateLimiterState {
            calls_this_hour: self.calls_this_hour,
            hour_start_time: self.hour_start_time,
            max_calls_per_hour: self.max_calls_per_hour,
        }
    }
}
