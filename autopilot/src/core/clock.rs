//! Time source abstraction.
//!
//! Core state machines take `now_ms` explicitly; the control loop reads it from
//! a [`Clock`] so tests can drive time by hand.

use crate::core::types::Millis;

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Millis;
}

/// Wall clock backed by `chrono::Utc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Millis {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_ms(&self) -> Millis {
        (**self).now_ms()
    }
}
