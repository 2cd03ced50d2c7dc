//! Completion / exit detection over free-text assistant output.
//!
//! Fails safe: ambiguous text never triggers an exit.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::classifier::TextClassifier;

const COMPLETION_WEIGHT: f64 = 0.55;
const ACTIVE_WORK_WEIGHT: f64 = 0.40;
const UNCERTAINTY_WEIGHT: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitSettings {
    /// Minimum confidence (0-1) required before text alone ends the loop.
    pub confidence_floor: f64,
    pub max_consecutive_failures: u32,
}

impl Default for ExitSettings {
    fn default() -> Self {
        Self {
            confidence_floor: 0.5,
            max_consecutive_failures: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitCheck {
    pub should_exit: bool,
    /// 0.0 - 1.0
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub reasons: Vec<String>,
}

impl ExitCheck {
    fn keep_going(confidence: f64, reasons: Vec<String>) -> Self {
        Self {
            should_exit: false,
            confidence,
            reason: None,
            reasons,
        }
    }
}

pub struct ExitDetector {
    settings: ExitSettings,
    completion: Arc<dyn TextClassifier>,
    active_work: Arc<dyn TextClassifier>,
    uncertainty: Arc<dyn TextClassifier>,
    failure_count: u32,
}

impl ExitDetector {
    pub fn new(
        settings: ExitSettings,
        completion: Arc<dyn TextClassifier>,
        active_work: Arc<dyn TextClassifier>,
        uncertainty: Arc<dyn TextClassifier>,
    ) -> Self {
        Self {
            settings,
            completion,
            active_work,
            uncertainty,
            failure_count: 0,
        }
    }

    pub fn check_response(&self, text: &str) -> ExitCheck {
        if text.trim().is_empty() {
            return ExitCheck::keep_going(0.0, vec!["empty response".to_string()]);
        }

        let completion = self.completion.classify(text).count();
        let active = self.active_work.classify(text).count();
        let uncertain = self.uncertainty.classify(text).count();

        let positive = completion as f64 * COMPLETION_WEIGHT;
        let negative = active as f64 * ACTIVE_WORK_WEIGHT + uncertain as f64 * UNCERTAINTY_WEIGHT;
        let confidence = (positive - negative).clamp(0.0, 1.0);

        let reasons = vec![
            format!("completionSignals={completion}"),
            format!("activeWorkSignals={active}"),
            format!("uncertaintySignals={uncertain}"),
            format!("confidence={confidence:.2}"),
        ];

        let should_exit =
            completion > 0 && active == 0 && confidence >= self.settings.confidence_floor;
        if !should_exit {
            return ExitCheck::keep_going(confidence, reasons);
        }

        info!(reasons = %reasons.join(", "), "completion detected");
        ExitCheck {
            should_exit: true,
            confidence,
            reason: Some("assistant indicated completion".to_string()),
            reasons,
        }
    }

    pub fn report_success(&mut self) {
        self.failure_count = 0;
    }

    /// Count a failed iteration; forces an exit once the streak hits the limit.
    pub fn report_failure(&mut self) -> ExitCheck {
        self.failure_count = self.failure_count.saturating_add(1);
        if self.failure_count >= self.settings.max_consecutive_failures {
            warn!(failures = self.failure_count, "too many consecutive failures");
            return ExitCheck {
                should_exit: true,
                confidence: 1.0,
                reason: Some(format!(
                    "too many consecutive failures ({})",
                    self.failure_count
                )),
                reasons: vec![format!("consecutiveFailures={}", self.failure_count)],
            };
        }
        ExitCheck::keep_going(
            0.0,
            vec![format!("consecutiveFailures={}", self.failure_count)],
        )
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failure_count
    }

    pub fn reset(&mut self) {
        self.failure_count = 0;
    }
}
