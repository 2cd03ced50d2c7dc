//! Detects assistant loops that only re-run verification without new work.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::classifier::TextClassifier;

pub const DEFAULT_MAX_TEST_LOOPS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestLoopCheck {
    pub is_test_only: bool,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub should_exit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestLoopStatus {
    pub consecutive: u32,
    pub total: u32,
    pub percentage: f64,
}

pub struct TestLoopDetector {
    max_consecutive: u32,
    test_activity: Arc<dyn TextClassifier>,
    feature_work: Arc<dyn TextClassifier>,
    consecutive: u32,
    analyzed: u32,
    test_only: u32,
}

impl TestLoopDetector {
    pub fn new(
        max_consecutive: u32,
        test_activity: Arc<dyn TextClassifier>,
        feature_work: Arc<dyn TextClassifier>,
    ) -> Self {
        Self {
            max_consecutive,
            test_activity,
            feature_work,
            consecutive: 0,
            analyzed: 0,
            test_only: 0,
        }
    }

    pub fn analyze_response(&mut self, text: &str) -> TestLoopCheck {
        if text.trim().is_empty() {
            return TestLoopCheck {
                is_test_only: false,
                confidence: 0.0,
                should_exit: false,
                reason: None,
            };
        }
        self.analyzed = self.analyzed.saturating_add(1);

        let tests = self.test_activity.classify(text).count();
        let features = self.feature_work.classify(text).count();
        let is_test_only = tests > 0 && features == 0;
        let confidence = tests as f64 / (tests + features + 1) as f64;

        if is_test_only {
            self.consecutive = self.consecutive.saturating_add(1);
            self.test_only = self.test_only.saturating_add(1);
            warn!(consecutive = self.consecutive, "test-only response");
        } else {
            self.consecutive = 0;
        }

        let should_exit = self.consecutive >= self.max_consecutive;
        let reason = should_exit.then(|| {
            format!(
                "{} consecutive test-only loops (feature likely complete)",
                self.consecutive
            )
        });
        if let Some(reason) = &reason {
            info!(%reason, "test loop exit");
        }

        TestLoopCheck {
            is_test_only,
            confidence,
            should_exit,
            reason,
        }
    }

    pub fn status(&self) -> TestLoopStatus {
        let percentage = if self.analyzed == 0 {
            0.0
        } else {
            f64::from(self.test_only) / f64::from(self.analyzed) * 100.0
        };
        TestLoopStatus {
            consecutive: self.consecutive,
            total: self.test_only,
            percentage,
        }
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
        self.analyzed = 0;
        self.test_only = 0;
    }
}
