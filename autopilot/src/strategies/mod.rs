//! Action strategy registry.
//!
//! A strategy is one way of performing an action category against the host
//! (typing text, clicking a control, submitting). The registry orders the
//! enabled strategies of a category by priority and runs them until enough
//! of them succeed. Individual strategy failures never escape as errors; they
//! become failed [`ExecutionResult`]s.

pub mod builtin;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{ActionCategory, ExecutionResult};
use crate::io::channel::ControlChannel;
use crate::io::config::StrategyConfig;

/// Parameters handed to a strategy for one attempt.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    pub channel: Option<Arc<dyn ControlChannel>>,
    pub text: Option<String>,
    pub selector: Option<String>,
    /// Fallback click point for coordinate-based strategies.
    pub point: Option<(f64, f64)>,
    pub accept_keywords: Vec<String>,
    pub reject_keywords: Vec<String>,
    /// Once cancelled, running attempts are abandoned and the rest are skipped.
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    /// The channel, if attached and connected.
    pub fn connected_channel(&self) -> Option<&Arc<dyn ControlChannel>> {
        self.channel.as_ref().filter(|channel| channel.is_connected())
    }
}

#[async_trait]
pub trait ActionStrategy: Send + Sync {
    fn id(&self) -> &str;

    fn category(&self) -> ActionCategory;

    /// Lower runs first.
    fn priority(&self) -> u32;

    /// Delay after each attempt, unless overridden by configuration.
    fn post_delay(&self) -> Duration;

    fn requires_channel(&self) -> bool {
        true
    }

    fn enabled(&self) -> bool {
        true
    }

    /// `Ok(true)` when the action was performed.
    async fn attempt(&self, ctx: &ExecutionContext) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySettings {
    pub allowlists: BTreeMap<ActionCategory, Vec<String>>,
    /// Post-delay overrides by strategy id, in milliseconds.
    pub timings: BTreeMap<String, u64>,
    pub retry_count: u32,
    pub parallel_execution: bool,
    pub attempt_timeout: Duration,
}

impl RegistrySettings {
    pub fn from_config(config: &StrategyConfig) -> Self {
        let allowlists = ActionCategory::ALL
            .into_iter()
            .map(|category| (category, config.allowlist(category).to_vec()))
            .collect();
        Self {
            allowlists,
            timings: config.timings.clone(),
            retry_count: config.retry_count,
            parallel_execution: config.parallel_execution,
            attempt_timeout: config.attempt_timeout(),
        }
    }

    fn allows(&self, category: ActionCategory, id: &str) -> bool {
        self.allowlists
            .get(&category)
            .is_some_and(|ids| ids.iter().any(|allowed| allowed == id))
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from_config(&StrategyConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CategoryCounters {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategySummary {
    pub id: String,
    pub category: ActionCategory,
    pub priority: u32,
    pub post_delay_ms: u64,
    pub requires_channel: bool,
    pub enabled: bool,
    pub allowed: bool,
}

struct Registered {
    strategy: Arc<dyn ActionStrategy>,
    post_delay: Duration,
}

pub struct StrategyRegistry {
    settings: RegistrySettings,
    strategies: BTreeMap<String, Registered>,
    counters: BTreeMap<ActionCategory, CategoryCounters>,
}

impl StrategyRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            settings,
            strategies: BTreeMap::new(),
            counters: BTreeMap::new(),
        }
    }

    /// Registry preloaded with every built-in strategy.
    pub fn with_builtins(settings: RegistrySettings) -> Result<Self> {
        let mut registry = Self::new(settings);
        for strategy in builtin::all() {
            registry.register(strategy)?;
        }
        Ok(registry)
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Register a strategy. Configured timing overrides apply here.
    pub fn register(&mut self, strategy: Arc<dyn ActionStrategy>) -> Result<()> {
        let id = strategy.id().to_string();
        if self.strategies.contains_key(&id) {
            bail!("strategy '{id}' is already registered");
        }
        let post_delay = self
            .settings
            .timings
            .get(&id)
            .map_or_else(|| strategy.post_delay(), |ms| Duration::from_millis(*ms));
        debug!(id = %id, category = strategy.category().label(), "registered strategy");
        self.strategies.insert(
            id,
            Registered {
                strategy,
                post_delay,
            },
        );
        Ok(())
    }

    /// Enabled, allowlisted strategies of `category` in priority order.
    pub fn by_category(&self, category: ActionCategory) -> Vec<Arc<dyn ActionStrategy>> {
        self.ordered(category)
            .into_iter()
            .map(|entry| Arc::clone(&entry.strategy))
            .collect()
    }

    fn ordered(&self, category: ActionCategory) -> Vec<&Registered> {
        let mut entries: Vec<&Registered> = self
            .strategies
            .values()
            .filter(|entry| {
                let strategy = &entry.strategy;
                strategy.category() == category
                    && strategy.enabled()
                    && self.settings.allows(category, strategy.id())
            })
            .collect();
        // BTreeMap iteration is by id, so ties on priority stay deterministic.
        entries.sort_by_key(|entry| entry.strategy.priority());
        entries
    }

    /// Number of successes that ends a sequential run of `category`.
    pub fn target_successes(&self, category: ActionCategory) -> u32 {
        match category {
            ActionCategory::TextEntry => 1,
            ActionCategory::Activation | ActionCategory::Submission => self.settings.retry_count,
        }
    }

    /// Run strategies of `category` in priority order.
    ///
    /// Sequential mode stops once [`Self::target_successes`] is reached.
    /// Activation runs every strategy concurrently when parallel execution is on.
    #[instrument(skip_all, fields(category = category.label()))]
    pub async fn execute_category(
        &mut self,
        category: ActionCategory,
        ctx: &ExecutionContext,
    ) -> Vec<ExecutionResult> {
        let attempt_timeout = self.settings.attempt_timeout;
        let entries = self.ordered(category);
        if entries.is_empty() {
            warn!("no enabled strategies");
            return Vec::new();
        }

        let results = if self.settings.parallel_execution && category == ActionCategory::Activation
        {
            join_all(
                entries
                    .iter()
                    .map(|entry| run_attempt(entry, ctx, attempt_timeout)),
            )
            .await
        } else {
            let target = self.target_successes(category);
            let mut results = Vec::with_capacity(entries.len());
            let mut successes = 0;
            for entry in entries {
                if successes >= target {
                    break;
                }
                let result = run_attempt(entry, ctx, attempt_timeout).await;
                if result.success {
                    successes += 1;
                }
                results.push(result);
            }
            results
        };

        let succeeded = results.iter().filter(|result| result.success).count();
        info!(attempts = results.len(), succeeded, "category executed");
        self.record(category, &results);
        results
    }

    /// Run exactly one strategy by id, regardless of allowlist.
    pub async fn execute_single(&mut self, id: &str, ctx: &ExecutionContext) -> ExecutionResult {
        let Some(entry) = self.strategies.get(id) else {
            return ExecutionResult::failed(id, 0, format!("unknown strategy '{id}'"));
        };
        let category = entry.strategy.category();
        let result = run_attempt(entry, ctx, self.settings.attempt_timeout).await;
        self.record(category, std::slice::from_ref(&result));
        result
    }

    pub fn summary(&self) -> Vec<StrategySummary> {
        let mut rows: Vec<StrategySummary> = self
            .strategies
            .values()
            .map(|entry| {
                let strategy = &entry.strategy;
                StrategySummary {
                    id: strategy.id().to_string(),
                    category: strategy.category(),
                    priority: strategy.priority(),
                    post_delay_ms: duration_ms(entry.post_delay),
                    requires_channel: strategy.requires_channel(),
                    enabled: strategy.enabled(),
                    allowed: self.settings.allows(strategy.category(), strategy.id()),
                }
            })
            .collect();
        rows.sort_by(|a, b| (a.category, a.priority).cmp(&(b.category, b.priority)));
        rows
    }

    pub fn counters(&self) -> &BTreeMap<ActionCategory, CategoryCounters> {
        &self.counters
    }

    fn record(&mut self, category: ActionCategory, results: &[ExecutionResult]) {
        let counters = self.counters.entry(category).or_default();
        for result in results {
            counters.attempts += 1;
            if result.success {
                counters.successes += 1;
            } else {
                counters.failures += 1;
            }
        }
    }
}

async fn run_attempt(
    entry: &Registered,
    ctx: &ExecutionContext,
    attempt_timeout: Duration,
) -> ExecutionResult {
    let strategy = &entry.strategy;
    let id = strategy.id();
    let started = Instant::now();
    if ctx.cancel.is_cancelled() {
        debug!(id, "skipping, cancelled");
        return ExecutionResult::failed(id, 0, "cancelled");
    }
    if strategy.requires_channel() && ctx.connected_channel().is_none() {
        debug!(id, "skipping, control channel unavailable");
        return ExecutionResult::failed(id, 0, "control channel unavailable");
    }

    let outcome = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => None,
        outcome = timeout(attempt_timeout, strategy.attempt(ctx)) => Some(outcome),
    };
    let Some(outcome) = outcome else {
        warn!(id, "attempt abandoned, cancelled");
        return ExecutionResult::failed(id, duration_ms(started.elapsed()), "cancelled");
    };
    tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => debug!(id, "post-delay cut short, cancelled"),
        () = sleep(entry.post_delay) => {}
    }
    let elapsed_ms = duration_ms(started.elapsed());
    let timeout_ms = duration_ms(attempt_timeout);

    match outcome {
        Ok(Ok(success)) => {
            debug!(id, success, elapsed_ms, "strategy attempted");
            ExecutionResult {
                strategy_id: id.to_string(),
                success,
                duration_ms: elapsed_ms,
                error: None,
            }
        }
        Ok(Err(err)) => {
            warn!(id, error = %err, "strategy failed");
            ExecutionResult::failed(id, elapsed_ms, format!("{err:#}"))
        }
        Err(_) => {
            warn!(id, timeout_ms, "strategy timed out");
            ExecutionResult::failed(id, elapsed_ms, format!("timed out after {timeout_ms}ms"))
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
