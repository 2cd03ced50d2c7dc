//! Stable exit codes for autopilot CLI commands.

/// Command succeeded, or the loop stopped without a verdict (cancelled, tick limit).
pub const OK: i32 = 0;
/// Command failed due to invalid config, snapshot or replay input.
pub const INVALID: i32 = 1;
/// `autopilot replay` stopped because the assistant signalled completion.
pub const COMPLETE: i32 = 2;
/// `autopilot replay` stopped on a failure streak or a test-only loop.
pub const STUCK: i32 = 3;
/// `autopilot guard` refused auto-resume for the snapshot.
pub const GUARD_BLOCKED: i32 = 4;
