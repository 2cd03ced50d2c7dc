//! Resilient action dispatch and autonomous resume for an assistant UI.
//!
//! The crate watches a host runtime through a [`io::channel::ControlChannel`],
//! decides whether it is safe to act, and performs resume actions through
//! layered fallback strategies. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic state machines (guard, watchdog, backoff,
//!   circuit breaker, rate limiter, detectors). No I/O; time is passed in.
//! - **[`io`]**: Configuration files and the control channel, including a
//!   JSONL replay channel.
//!
//! Orchestration modules ([`strategies`], [`resume`], [`looping`]) combine the
//! two into the control loop; [`report`] holds what the loop publishes.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod report;
pub mod resume;
pub mod strategies;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
