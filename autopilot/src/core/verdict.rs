//! Per-tick completion verdict combining text, guard and snapshot signals.

use serde::{Deserialize, Serialize};

use crate::core::exit_detector::ExitCheck;
use crate::core::guard::GuardReport;
use crate::core::types::{Confidence, RuntimeSnapshot, RuntimeStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionVerdict {
    pub ready_to_resume: bool,
    pub is_complete: bool,
    pub is_waiting_for_input: bool,
    /// 0-100
    pub confidence: u8,
    pub confidence_label: Confidence,
    pub reasons: Vec<String>,
}

/// Derive the verdict for one tick. `exit` is `None` when the tick had no fresh output.
pub fn derive_verdict(
    snapshot: &RuntimeSnapshot,
    guard: Option<&GuardReport>,
    exit: Option<&ExitCheck>,
) -> CompletionVerdict {
    let mut reasons = Vec::new();
    let status_complete = snapshot.status == RuntimeStatus::AllComplete;
    let text_complete = exit.is_some_and(|check| check.should_exit);

    if status_complete {
        reasons.push("runtime reports all_complete".to_string());
    }
    if let Some(check) = exit {
        reasons.extend(check.reasons.iter().cloned());
    } else {
        reasons.push("no fresh output this tick".to_string());
    }

    let is_complete = status_complete || text_complete;
    let confidence = if status_complete {
        100
    } else {
        exit.map(|check| (check.confidence * 100.0).round().clamp(0.0, 100.0) as u8)
            .unwrap_or(0)
    };

    let guard_allows = guard.is_some_and(|report| report.allowed);
    if let Some(report) = guard {
        reasons.push(format!("guard: {}", report.reason));
    }

    CompletionVerdict {
        ready_to_resume: guard_allows && !is_complete && snapshot.is_actionable(),
        is_complete,
        is_waiting_for_input: snapshot.is_waiting(),
        confidence,
        confidence_label: Confidence::from_percent(confidence),
        reasons,
    }
}
