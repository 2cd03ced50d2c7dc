//! Deterministic, pure logic shared by the autopilot.
//!
//! Core modules must be free of I/O side effects. Time enters only through
//! explicit `now_ms` arguments so every state machine replays deterministically.

pub mod backoff;
pub mod circuit_breaker;
pub mod classifier;
pub mod clock;
pub mod exit_detector;
pub mod guard;
pub mod rate_limiter;
pub mod test_loop;
pub mod types;
pub mod verdict;
pub mod watchdog;
