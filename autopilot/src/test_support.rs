//! Test-only helpers: snapshot and replay-frame builders, scripted strategies,
//! and a hand-driven clock.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::core::classifier::DefaultClassifiers;
use crate::core::clock::Clock;
use crate::core::types::{
    ActionCategory, Millis, Profile, ProfileCoverage, RuntimeSnapshot, RuntimeStatus,
};
use crate::io::channel::ControlChannel;
use crate::io::config::AutopilotConfig;
use crate::io::replay::{ReplayChannel, ReplayFrame};
use crate::looping::ControlLoop;
use crate::strategies::{
    ActionStrategy, ExecutionContext, RegistrySettings, StrategyRegistry,
};

pub const TEST_EPOCH_MS: Millis = 1_700_000_000_000;

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: Millis) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: Millis) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }
}

/// Coverage with a visible input and action control.
pub fn full_coverage() -> ProfileCoverage {
    ProfileCoverage {
        has_visible_input: true,
        has_visible_action_control: true,
        pending_action_count: 0,
    }
}

fn covered(status: RuntimeStatus, waiting: bool) -> RuntimeSnapshot {
    RuntimeSnapshot {
        status,
        timestamp: TEST_EPOCH_MS,
        profile_coverage: Profile::ALL
            .into_iter()
            .map(|profile| (profile, full_coverage()))
            .collect(),
        active_profile: Some(Profile::A),
        waiting_for_input: Some(waiting),
    }
}

/// Waiting for input with every profile fully covered (guard score 100).
pub fn waiting_snapshot() -> RuntimeSnapshot {
    covered(RuntimeStatus::WaitingForInput, true)
}

/// One pending action on the active profile.
pub fn pending_snapshot() -> RuntimeSnapshot {
    let mut snapshot = covered(RuntimeStatus::PendingActions, false);
    if let Some(coverage) = snapshot.profile_coverage.get_mut(&Profile::A) {
        coverage.pending_action_count = 1;
    }
    snapshot
}

/// Waiting for input, but no profile reports any coverage.
pub fn blind_snapshot() -> RuntimeSnapshot {
    RuntimeSnapshot {
        status: RuntimeStatus::WaitingForInput,
        timestamp: TEST_EPOCH_MS,
        profile_coverage: BTreeMap::new(),
        active_profile: None,
        waiting_for_input: Some(true),
    }
}

pub fn snapshot_with_status(status: RuntimeStatus) -> RuntimeSnapshot {
    covered(status, false)
}

pub fn frame(snapshot: RuntimeSnapshot) -> ReplayFrame {
    ReplayFrame {
        snapshot,
        ..ReplayFrame::default()
    }
}

pub fn waiting_frame() -> ReplayFrame {
    frame(waiting_snapshot())
}

pub fn pending_frame() -> ReplayFrame {
    frame(pending_snapshot())
}

pub fn blind_frame() -> ReplayFrame {
    frame(blind_snapshot())
}

pub fn idle_frame() -> ReplayFrame {
    frame(snapshot_with_status(RuntimeStatus::Idle))
}

pub fn output_frame(mut frame: ReplayFrame, text: &str) -> ReplayFrame {
    frame.output = Some(text.to_string());
    frame
}

pub fn replay_channel(frames: Vec<ReplayFrame>) -> Arc<dyn ControlChannel> {
    Arc::new(ReplayChannel::new(frames))
}

/// Outcome of one scripted strategy attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyScript {
    Succeed,
    /// Attempted, but reported `false`.
    Fail,
    Error(&'static str),
    /// Never completes; only the attempt timeout ends it.
    Hang,
}

/// Strategy that plays back scripted outcomes and records what it was asked to do.
///
/// The last script entry repeats once the sequence is exhausted.
#[derive(Debug)]
pub struct ScriptedStrategy {
    id: String,
    category: ActionCategory,
    priority: u32,
    enabled: bool,
    scripts: Mutex<VecDeque<StrategyScript>>,
    last: Mutex<StrategyScript>,
    calls: AtomicUsize,
    texts: Mutex<Vec<String>>,
    selectors: Mutex<Vec<String>>,
}

impl ScriptedStrategy {
    pub fn new(
        id: &str,
        category: ActionCategory,
        priority: u32,
        script: StrategyScript,
    ) -> Arc<Self> {
        Self::sequence(id, category, priority, vec![script])
    }

    pub fn sequence(
        id: &str,
        category: ActionCategory,
        priority: u32,
        scripts: Vec<StrategyScript>,
    ) -> Arc<Self> {
        Arc::new(Self::build(id, category, priority, true, scripts))
    }

    pub fn disabled(id: &str, category: ActionCategory, priority: u32) -> Arc<Self> {
        Arc::new(Self::build(
            id,
            category,
            priority,
            false,
            vec![StrategyScript::Succeed],
        ))
    }

    fn build(
        id: &str,
        category: ActionCategory,
        priority: u32,
        enabled: bool,
        scripts: Vec<StrategyScript>,
    ) -> Self {
        let last = scripts.last().copied().unwrap_or(StrategyScript::Succeed);
        Self {
            id: id.to_string(),
            category,
            priority,
            enabled,
            scripts: Mutex::new(scripts.into()),
            last: Mutex::new(last),
            calls: AtomicUsize::new(0),
            texts: Mutex::new(Vec::new()),
            selectors: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_texts(&self) -> Vec<String> {
        self.texts.lock().expect("texts lock").clone()
    }

    pub fn seen_selectors(&self) -> Vec<String> {
        self.selectors.lock().expect("selectors lock").clone()
    }

    fn next_script(&self) -> StrategyScript {
        let mut scripts = self.scripts.lock().expect("scripts lock");
        let mut last = self.last.lock().expect("last lock");
        if let Some(script) = scripts.pop_front() {
            *last = script;
        }
        *last
    }
}

#[async_trait]
impl ActionStrategy for ScriptedStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> ActionCategory {
        self.category
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn post_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn attempt(&self, ctx: &ExecutionContext) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(text) = &ctx.text {
            self.texts.lock().expect("texts lock").push(text.clone());
        }
        if let Some(selector) = &ctx.selector {
            self.selectors
                .lock()
                .expect("selectors lock")
                .push(selector.clone());
        }
        match self.next_script() {
            StrategyScript::Succeed => Ok(true),
            StrategyScript::Fail => Ok(false),
            StrategyScript::Error(message) => Err(anyhow!(message)),
            StrategyScript::Hang => std::future::pending().await,
        }
    }
}

fn allow_scripted(
    mut settings: RegistrySettings,
    strategies: &[Arc<ScriptedStrategy>],
) -> RegistrySettings {
    settings.allowlists = BTreeMap::new();
    for strategy in strategies {
        settings
            .allowlists
            .entry(strategy.category)
            .or_default()
            .push(strategy.id.clone());
    }
    settings
}

fn register_all(
    settings: RegistrySettings,
    strategies: Vec<Arc<ScriptedStrategy>>,
) -> StrategyRegistry {
    let mut registry = StrategyRegistry::new(allow_scripted(settings, &strategies));
    for strategy in strategies {
        registry.register(strategy).expect("register scripted strategy");
    }
    registry
}

/// Registry holding only `strategies`, each allowlisted, with default settings.
pub fn scripted_registry(strategies: Vec<Arc<ScriptedStrategy>>) -> StrategyRegistry {
    register_all(RegistrySettings::default(), strategies)
}

/// Control loop over a replay channel and scripted strategies, with a frozen clock.
pub fn scripted_loop(
    frames: Vec<ReplayFrame>,
    strategies: Vec<Arc<ScriptedStrategy>>,
    config: AutopilotConfig,
) -> (ControlLoop, Arc<ReplayChannel>) {
    scripted_loop_with_clock(
        frames,
        strategies,
        config,
        Arc::new(ManualClock::new(TEST_EPOCH_MS)),
    )
}

pub fn scripted_loop_with_clock(
    frames: Vec<ReplayFrame>,
    strategies: Vec<Arc<ScriptedStrategy>>,
    config: AutopilotConfig,
    clock: Arc<ManualClock>,
) -> (ControlLoop, Arc<ReplayChannel>) {
    let channel = Arc::new(ReplayChannel::new(frames));
    let registry = register_all(
        RegistrySettings::from_config(&config.strategies),
        strategies,
    );
    let classifiers = DefaultClassifiers::new().expect("default classifiers");
    let control = ControlLoop::new(
        &config,
        Arc::clone(&channel) as Arc<dyn ControlChannel>,
        clock,
        registry,
        classifiers,
    );
    (control, channel)
}
