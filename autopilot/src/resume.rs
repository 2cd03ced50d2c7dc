//! Resume actions the control loop dispatches through the strategy registry.
//!
//! A resume types the continuation message and submits it. Accepting pending
//! actions clicks the matching control. Readiness recovery clicks a configured
//! element to surface a hidden input or panel when the guard blocks.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::core::types::{ActionCategory, ExecutionResult, RuntimeSnapshot};
use crate::io::channel::ControlChannel;
use crate::io::config::AutopilotConfig;
use crate::strategies::{ExecutionContext, StrategyRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeSettings {
    pub resume_message: String,
    pub escalation_message: String,
    pub accept_selector: String,
    pub submit_selector: String,
    pub recovery_selector: Option<String>,
    pub accept_keywords: Vec<String>,
    pub reject_keywords: Vec<String>,
}

impl ResumeSettings {
    pub fn from_config(config: &AutopilotConfig) -> Self {
        Self {
            resume_message: config.control.resume_message.clone(),
            escalation_message: config.control.escalation_message.clone(),
            accept_selector: config.strategies.accept_selector.clone(),
            submit_selector: config.strategies.submit_selector.clone(),
            recovery_selector: config.strategies.recovery_selector.clone(),
            accept_keywords: config.strategies.accept_keywords.clone(),
            reject_keywords: config.strategies.reject_keywords.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeAction {
    Resume,
    /// Resume with the full escalation message.
    EscalatedResume,
    AcceptPending,
    RecoverReadiness,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRun {
    pub category: ActionCategory,
    pub results: Vec<ExecutionResult>,
}

impl CategoryRun {
    pub fn succeeded(&self) -> bool {
        self.results.iter().any(|result| result.success)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: ResumeAction,
    pub success: bool,
    pub runs: Vec<CategoryRun>,
    pub detail: String,
}

impl ActionOutcome {
    pub fn results(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.runs.iter().flat_map(|run| run.results.iter())
    }
}

#[derive(Debug, Clone)]
pub struct ResumeActions {
    settings: ResumeSettings,
}

impl ResumeActions {
    pub fn new(settings: ResumeSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ResumeSettings {
        &self.settings
    }

    /// Action for an actionable snapshot. Pending actions take precedence over typing.
    pub fn plan(&self, snapshot: &RuntimeSnapshot, escalated: bool) -> Option<ResumeAction> {
        if snapshot.has_pending_actions() {
            Some(ResumeAction::AcceptPending)
        } else if snapshot.is_waiting() {
            Some(if escalated {
                ResumeAction::EscalatedResume
            } else {
                ResumeAction::Resume
            })
        } else {
            None
        }
    }

    #[instrument(skip_all, fields(action = ?action))]
    pub async fn perform(
        &self,
        registry: &mut StrategyRegistry,
        channel: Arc<dyn ControlChannel>,
        action: ResumeAction,
        cancel: &CancellationToken,
    ) -> ActionOutcome {
        let base = ExecutionContext {
            channel: Some(channel),
            cancel: cancel.clone(),
            ..ExecutionContext::default()
        };
        match action {
            ResumeAction::Resume => {
                self.resume(registry, base, action, &self.settings.resume_message)
                    .await
            }
            ResumeAction::EscalatedResume => {
                self.resume(registry, base, action, &self.settings.escalation_message)
                    .await
            }
            ResumeAction::AcceptPending => self.accept_pending(registry, base).await,
            ResumeAction::RecoverReadiness => {
                let selector = self.settings.recovery_selector.clone();
                self.click(registry, base, action, selector, Vec::new())
                    .await
            }
        }
    }

    /// Click the recovery element, if one is configured.
    pub async fn recover_readiness(
        &self,
        registry: &mut StrategyRegistry,
        channel: Arc<dyn ControlChannel>,
        cancel: &CancellationToken,
    ) -> Option<ActionOutcome> {
        self.settings.recovery_selector.as_ref()?;
        Some(
            self.perform(registry, channel, ResumeAction::RecoverReadiness, cancel)
                .await,
        )
    }

    async fn resume(
        &self,
        registry: &mut StrategyRegistry,
        base: ExecutionContext,
        action: ResumeAction,
        message: &str,
    ) -> ActionOutcome {
        let text_ctx = ExecutionContext {
            text: Some(message.to_string()),
            ..base.clone()
        };
        let text = CategoryRun {
            category: ActionCategory::TextEntry,
            results: registry
                .execute_category(ActionCategory::TextEntry, &text_ctx)
                .await,
        };
        if !text.succeeded() {
            let detail = if base.cancel.is_cancelled() {
                "cancelled"
            } else {
                "text entry exhausted"
            };
            warn!(detail, "text not entered, not submitting");
            return ActionOutcome {
                action,
                success: false,
                runs: vec![text],
                detail: detail.to_string(),
            };
        }

        let submit_ctx = ExecutionContext {
            selector: Some(self.settings.submit_selector.clone()),
            ..base
        };
        let submit = CategoryRun {
            category: ActionCategory::Submission,
            results: registry
                .execute_category(ActionCategory::Submission, &submit_ctx)
                .await,
        };
        let success = submit.succeeded();
        let detail = if success {
            info!("resume submitted");
            "message submitted".to_string()
        } else if submit_ctx.cancel.is_cancelled() {
            "cancelled".to_string()
        } else {
            warn!("submission exhausted");
            "submission exhausted".to_string()
        };
        ActionOutcome {
            action,
            success,
            runs: vec![text, submit],
            detail,
        }
    }

    async fn accept_pending(
        &self,
        registry: &mut StrategyRegistry,
        base: ExecutionContext,
    ) -> ActionOutcome {
        let selector = Some(self.settings.accept_selector.clone());
        let accept = self.settings.accept_keywords.clone();
        self.click(registry, base, ResumeAction::AcceptPending, selector, accept)
            .await
    }

    async fn click(
        &self,
        registry: &mut StrategyRegistry,
        base: ExecutionContext,
        action: ResumeAction,
        selector: Option<String>,
        accept_keywords: Vec<String>,
    ) -> ActionOutcome {
        let ctx = ExecutionContext {
            selector,
            accept_keywords,
            reject_keywords: self.settings.reject_keywords.clone(),
            ..base
        };
        let run = CategoryRun {
            category: ActionCategory::Activation,
            results: registry
                .execute_category(ActionCategory::Activation, &ctx)
                .await,
        };
        let success = run.succeeded();
        let detail = if success {
            "control activated"
        } else if ctx.cancel.is_cancelled() {
            "cancelled"
        } else {
            "activation exhausted"
        };
        ActionOutcome {
            action,
            success,
            runs: vec![run],
            detail: detail.to_string(),
        }
    }
}
