//! Autopilot configuration stored under `.autopilot/config.toml`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::circuit_breaker::BreakerSettings;
use crate::core::exit_detector::ExitSettings;
use crate::core::guard::GuardSettings;
use crate::core::types::ActionCategory;
use crate::core::watchdog::WatchdogSettings;

pub const DEFAULT_CONFIG_PATH: &str = ".autopilot/config.toml";

/// Autopilot configuration (TOML).
///
/// Edited by humans; missing fields default to the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AutopilotConfig {
    pub control: ControlConfig,
    pub strategies: StrategyConfig,
    pub guard: GuardConfig,
    pub watchdog: WatchdogConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub detectors: DetectorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControlConfig {
    /// Sleep between ticks when nothing is failing.
    pub base_interval_secs: u64,
    /// Upper bound for the adaptive backoff.
    pub max_backoff_minutes: u64,
    /// Stop after this many ticks. `0` runs until a detector or the caller stops it.
    pub max_ticks: u32,
    /// Timeout for every snapshot/output read from the control channel.
    pub channel_timeout_ms: u64,
    /// Continuation message typed on a normal resume.
    pub resume_message: String,
    /// Full message typed once the escalation watchdog is armed.
    pub escalation_message: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: 30,
            max_backoff_minutes: 5,
            max_ticks: 100,
            channel_timeout_ms: 5_000,
            resume_message: "continue".to_string(),
            escalation_message: "Continue with the current task. If you are blocked, state the \
                                 blocker explicitly, otherwise proceed with the next step."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StrategyConfig {
    /// Enabled text-entry strategy ids (allowlist).
    pub text_entry: Vec<String>,
    /// Enabled activation strategy ids (allowlist).
    pub activation: Vec<String>,
    /// Enabled submission strategy ids (allowlist).
    pub submission: Vec<String>,
    /// Per-strategy post-delay overrides in milliseconds.
    pub timings: BTreeMap<String, u64>,
    /// Target success count for activation and submission.
    pub retry_count: u32,
    /// Dispatch activation strategies concurrently.
    pub parallel_execution: bool,
    pub attempt_timeout_ms: u64,
    pub accept_keywords: Vec<String>,
    pub reject_keywords: Vec<String>,
    pub accept_selector: String,
    pub submit_selector: String,
    /// Clicked when the guard blocks, to surface a hidden panel. Unset disables recovery clicks.
    pub recovery_selector: Option<String>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            text_entry: strings(&["key-dispatch", "insert-text", "dom-inject"]),
            activation: strings(&["selector-click", "pointer-click", "script-click"]),
            submission: strings(&["submit-button", "enter-key", "script-submit"]),
            timings: BTreeMap::new(),
            retry_count: 1,
            parallel_execution: false,
            attempt_timeout_ms: 5_000,
            accept_keywords: strings(&["accept", "allow", "run", "continue", "retry"]),
            reject_keywords: strings(&["reject", "deny", "cancel", "discard"]),
            accept_selector: "button, [role='button']".to_string(),
            submit_selector: "button[type='submit'], button[aria-label*='Send']".to_string(),
            recovery_selector: None,
        }
    }
}

impl StrategyConfig {
    pub fn allowlist(&self, category: ActionCategory) -> &[String] {
        match category {
            ActionCategory::TextEntry => &self.text_entry,
            ActionCategory::Activation => &self.activation,
            ActionCategory::Submission => &self.submission,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GuardConfig {
    pub min_score: u8,
    pub require_strict: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        let settings = GuardSettings::default();
        Self {
            min_score: settings.min_score,
            require_strict: settings.require_strict,
        }
    }
}

impl GuardConfig {
    pub fn settings(&self) -> GuardSettings {
        GuardSettings {
            min_score: self.min_score,
            require_strict: self.require_strict,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatchdogConfig {
    pub threshold: u32,
    pub cooldown_ms: u64,
    pub max_events: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        let settings = WatchdogSettings::default();
        Self {
            threshold: settings.threshold,
            cooldown_ms: settings.cooldown_ms,
            max_events: settings.max_events,
        }
    }
}

impl WatchdogConfig {
    pub fn settings(&self) -> WatchdogSettings {
        WatchdogSettings {
            threshold: self.threshold,
            cooldown_ms: self.cooldown_ms,
            max_events: self.max_events,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_calls_per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls_per_hour: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        let settings = BreakerSettings::default();
        Self {
            failure_threshold: settings.failure_threshold,
            reset_timeout_ms: settings.reset_timeout_ms,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.failure_threshold,
            reset_timeout_ms: self.reset_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    pub completion_confidence_floor: f64,
    pub max_consecutive_failures: u32,
    pub max_consecutive_test_loops: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        let exit = ExitSettings::default();
        Self {
            completion_confidence_floor: exit.confidence_floor,
            max_consecutive_failures: exit.max_consecutive_failures,
            max_consecutive_test_loops: crate::core::test_loop::DEFAULT_MAX_TEST_LOOPS,
        }
    }
}

impl DetectorConfig {
    pub fn exit_settings(&self) -> ExitSettings {
        ExitSettings {
            confidence_floor: self.completion_confidence_floor,
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }
}

impl AutopilotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.control.base_interval_secs == 0 {
            return Err(anyhow!("control.base_interval_secs must be > 0"));
        }
        if self.control.channel_timeout_ms == 0 {
            return Err(anyhow!("control.channel_timeout_ms must be > 0"));
        }
        if self.control.resume_message.trim().is_empty() {
            return Err(anyhow!("control.resume_message must be non-empty"));
        }
        if self.control.escalation_message.trim().is_empty() {
            return Err(anyhow!("control.escalation_message must be non-empty"));
        }
        if self.strategies.retry_count == 0 {
            return Err(anyhow!("strategies.retry_count must be > 0"));
        }
        if self.strategies.attempt_timeout_ms == 0 {
            return Err(anyhow!("strategies.attempt_timeout_ms must be > 0"));
        }
        let mut seen = BTreeSet::new();
        for category in ActionCategory::ALL {
            for id in self.strategies.allowlist(category) {
                if !seen.insert(id.as_str()) {
                    return Err(anyhow!(
                        "strategy id '{id}' appears in more than one allowlist"
                    ));
                }
            }
        }
        if self.guard.min_score > 100 {
            return Err(anyhow!("guard.min_score must be <= 100"));
        }
        if self.watchdog.threshold == 0 {
            return Err(anyhow!("watchdog.threshold must be > 0"));
        }
        if self.watchdog.max_events == 0 {
            return Err(anyhow!("watchdog.max_events must be > 0"));
        }
        if self.rate_limit.max_calls_per_hour == 0 {
            return Err(anyhow!("rate_limit.max_calls_per_hour must be > 0"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(anyhow!("circuit_breaker.failure_threshold must be > 0"));
        }
        let floor = self.detectors.completion_confidence_floor;
        if !(0.0..=1.0).contains(&floor) || floor == 0.0 {
            return Err(anyhow!(
                "detectors.completion_confidence_floor must be in (0, 1]"
            ));
        }
        if self.detectors.max_consecutive_failures == 0 {
            return Err(anyhow!("detectors.max_consecutive_failures must be > 0"));
        }
        if self.detectors.max_consecutive_test_loops == 0 {
            return Err(anyhow!("detectors.max_consecutive_test_loops must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AutopilotConfig::default()`.
pub fn load_config(path: &Path) -> Result<AutopilotConfig> {
    if !path.exists() {
        let cfg = AutopilotConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AutopilotConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AutopilotConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}
