//! Shared deterministic types for the autopilot core.
//!
//! These types are the contract between the control channel (which produces
//! snapshots) and the pure decision logic. Nothing here performs I/O.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Wall-clock timestamp in milliseconds since the Unix epoch.
pub type Millis = u64;

/// Assistant state as reported by the inspection channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Idle,
    Processing,
    PendingActions,
    WaitingForInput,
    AllComplete,
    Stopped,
    #[default]
    Unknown,
}

impl RuntimeStatus {
    /// A "live" status is one the channel positively identified.
    pub fn is_live(self) -> bool {
        !matches!(self, RuntimeStatus::Unknown | RuntimeStatus::Stopped)
    }

    pub fn label(self) -> &'static str {
        match self {
            RuntimeStatus::Idle => "idle",
            RuntimeStatus::Processing => "processing",
            RuntimeStatus::PendingActions => "pending_actions",
            RuntimeStatus::WaitingForInput => "waiting_for_input",
            RuntimeStatus::AllComplete => "all_complete",
            RuntimeStatus::Stopped => "stopped",
            RuntimeStatus::Unknown => "unknown",
        }
    }
}

/// One of the monitored host UI flavors.
///
/// `A` and `B` are the primary chat-panel implementations; `C` is the
/// tertiary panel that only contributes a bonus to the health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    A,
    B,
    C,
}

impl Profile {
    pub const ALL: [Profile; 3] = [Profile::A, Profile::B, Profile::C];

    pub fn label(self) -> &'static str {
        match self {
            Profile::A => "a",
            Profile::B => "b",
            Profile::C => "c",
        }
    }
}

/// Visible-surface signals for a single profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileCoverage {
    pub has_visible_input: bool,
    pub has_visible_action_control: bool,
    pub pending_action_count: u32,
}

impl ProfileCoverage {
    /// Any single signal is enough for a profile to count towards the score.
    pub fn is_ready(&self) -> bool {
        self.has_visible_input || self.has_visible_action_control || self.pending_action_count > 0
    }

    /// Pending action items are clickable controls, so they satisfy the
    /// action-control half of the strict check.
    pub fn has_action_control(&self) -> bool {
        self.has_visible_action_control || self.pending_action_count > 0
    }
}

/// Point-in-time view of the assistant UI, produced externally every poll.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSnapshot {
    pub status: RuntimeStatus,
    pub timestamp: Millis,
    pub profile_coverage: BTreeMap<Profile, ProfileCoverage>,
    pub active_profile: Option<Profile>,
    /// `None` when the channel could not determine the waiting state at all.
    pub waiting_for_input: Option<bool>,
}

impl RuntimeSnapshot {
    pub fn coverage(&self, profile: Profile) -> ProfileCoverage {
        self.profile_coverage
            .get(&profile)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_waiting(&self) -> bool {
        self.status == RuntimeStatus::WaitingForInput || self.waiting_for_input == Some(true)
    }

    pub fn has_pending_actions(&self) -> bool {
        self.status == RuntimeStatus::PendingActions
            || self
                .profile_coverage
                .values()
                .any(|coverage| coverage.pending_action_count > 0)
    }

    /// Whether the control loop should consider acting on this snapshot.
    pub fn is_actionable(&self) -> bool {
        if matches!(
            self.status,
            RuntimeStatus::Processing | RuntimeStatus::AllComplete | RuntimeStatus::Stopped
        ) {
            return false;
        }
        self.is_waiting() || self.has_pending_actions()
    }
}

/// Action category a strategy belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionCategory {
    TextEntry,
    Activation,
    Submission,
}

impl ActionCategory {
    pub const ALL: [ActionCategory; 3] = [
        ActionCategory::TextEntry,
        ActionCategory::Activation,
        ActionCategory::Submission,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ActionCategory::TextEntry => "text-entry",
            ActionCategory::Activation => "activation",
            ActionCategory::Submission => "submission",
        }
    }
}

/// Outcome of one strategy attempt. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub strategy_id: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn failed(strategy_id: impl Into<String>, duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            success: false,
            duration_ms,
            error: Some(error.into()),
        }
    }
}

/// Coarse confidence bucket used by human-facing recommendations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    /// Bucket a 0-100 percentage.
    pub fn from_percent(percent: u8) -> Self {
        match percent {
            80.. => Confidence::High,
            50..=79 => Confidence::Medium,
            _ => Confidence::Low,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage_is_ready_on_any_signal() {
        assert!(!ProfileCoverage::default().is_ready());
        let pending_only = ProfileCoverage {
            pending_action_count: 2,
            ..ProfileCoverage::default()
        };
        assert!(pending_only.is_ready());
        assert!(pending_only.has_action_control());
    }

    #[test]
    fn processing_snapshot_is_not_actionable_even_if_waiting_flag_set() {
        let snapshot = RuntimeSnapshot {
            status: RuntimeStatus::Processing,
            waiting_for_input: Some(true),
            ..RuntimeSnapshot::default()
        };
        assert!(!snapshot.is_actionable());
    }

    #[test]
    fn snapshot_deserializes_with_missing_fields() {
        let raw = r#"{"status":"waiting_for_input","profile_coverage":{"b":{"has_visible_input":true}}}"#;
        let snapshot: RuntimeSnapshot = serde_json::from_str(raw).expect("parse");
        assert!(snapshot.is_actionable());
        assert!(snapshot.coverage(Profile::B).has_visible_input);
        assert_eq!(snapshot.waiting_for_input, None);
    }

    #[test]
    fn confidence_buckets() {
        assert_eq!(Confidence::from_percent(95), Confidence::High);
        assert_eq!(Confidence::from_percent(50), Confidence::Medium);
        assert_eq!(Confidence::from_percent(10), Confidence::Low);
    }
}
