//! Autonomous control loop for `autopilot replay` and embedders.
//!
//! One tick reads the runtime snapshot, evaluates the guard, dispatches a
//! resume action through the circuit breaker and rate limiter, feeds the
//! completion and test-loop detectors, then sleeps for the adaptive backoff.
//! The loop never returns an error: every per-tick failure is folded into its
//! state and published as a [`TickReport`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::backoff::backoff_secs;
use crate::core::circuit_breaker::{BreakerCall, CircuitBreaker};
use crate::core::classifier::{DefaultClassifiers, TextClassifier};
use crate::core::clock::Clock;
use crate::core::exit_detector::{ExitCheck, ExitDetector};
use crate::core::guard::{GuardReport, GuardSettings, evaluate};
use crate::core::rate_limiter::RateLimiter;
use crate::core::test_loop::TestLoopDetector;
use crate::core::types::{Millis, RuntimeSnapshot};
use crate::core::verdict::derive_verdict;
use crate::core::watchdog::EscalationWatchdog;
use crate::io::channel::ControlChannel;
use crate::io::config::AutopilotConfig;
use crate::report::{FailureKind, SafetyCounters, TickAction, TickBroadcaster, TickReport};
use crate::resume::{ActionOutcome, ResumeAction, ResumeActions, ResumeSettings};
use crate::strategies::{RegistrySettings, StrategyRegistry};

#[derive(Debug, Clone, PartialEq)]
pub struct LoopSettings {
    pub base_interval: Duration,
    pub max_backoff_minutes: u64,
    /// `0` means no tick limit.
    pub max_ticks: u32,
    pub channel_timeout: Duration,
    pub guard: GuardSettings,
}

impl LoopSettings {
    pub fn from_config(config: &AutopilotConfig) -> Self {
        Self {
            base_interval: Duration::from_secs(config.control.base_interval_secs),
            max_backoff_minutes: config.control.max_backoff_minutes,
            max_ticks: config.control.max_ticks,
            channel_timeout: Duration::from_millis(config.control.channel_timeout_ms),
            guard: config.guard.settings(),
        }
    }
}

/// Reason why [`ControlLoop::run`] stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum LoopStop {
    Cancelled,
    CompletionDetected { confidence: f64, detail: String },
    TestLoopDetected { consecutive: u32, detail: String },
    TooManyFailures { failures: u32, detail: String },
    MaxTicksReached { max_ticks: u32 },
}

/// Summary of a loop run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopOutcome {
    pub ticks: u32,
    pub stop: LoopStop,
    pub counters: SafetyCounters,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub report: TickReport,
    pub stop: Option<LoopStop>,
}

/// Requests an early tick from outside the loop.
///
/// Requests arriving while a tick is running are dropped; several requests
/// between ticks collapse into one.
#[derive(Debug, Clone, Default)]
pub struct RefreshHandle {
    inner: Arc<RefreshInner>,
}

#[derive(Debug, Default)]
struct RefreshInner {
    in_flight: AtomicBool,
    pending: AtomicBool,
    notify: Notify,
}

impl RefreshHandle {
    /// Returns `true` when the request will cause an early tick.
    pub fn request(&self) -> bool {
        if self.inner.in_flight.load(Ordering::SeqCst) {
            debug!("refresh dropped, tick in flight");
            return false;
        }
        if self.inner.pending.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.notify.notify_one();
        true
    }

    fn begin_tick(&self) {
        self.inner.in_flight.store(true, Ordering::SeqCst);
        self.inner.pending.store(false, Ordering::SeqCst);
    }

    fn end_tick(&self) {
        self.inner.in_flight.store(false, Ordering::SeqCst);
    }

    async fn notified(&self) {
        self.inner.notify.notified().await;
    }
}

/// A resume action that ran but did not succeed.
#[derive(Debug)]
struct DispatchFailed(ActionOutcome);

impl fmt::Display for DispatchFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", failure_message(&self.0))
    }
}

impl std::error::Error for DispatchFailed {}

fn failure_message(outcome: &ActionOutcome) -> String {
    let errors: Vec<String> = outcome
        .results()
        .filter_map(|result| {
            result
                .error
                .as_ref()
                .map(|error| format!("{}: {error}", result.strategy_id))
        })
        .collect();
    if errors.is_empty() {
        outcome.detail.clone()
    } else {
        format!("{} ({})", outcome.detail, errors.join("; "))
    }
}

/// What the action phase of a tick did.
struct ActionStep {
    action: TickAction,
    dispatch: Option<ActionOutcome>,
    failure: Option<FailureKind>,
    note: String,
    stop: Option<LoopStop>,
}

impl ActionStep {
    fn quiet(action: TickAction, note: String) -> Self {
        Self {
            action,
            dispatch: None,
            failure: None,
            note,
            stop: None,
        }
    }
}

pub struct ControlLoop {
    channel: Arc<dyn ControlChannel>,
    clock: Arc<dyn Clock>,
    settings: LoopSettings,
    registry: StrategyRegistry,
    actions: ResumeActions,
    breaker: CircuitBreaker,
    rate_limiter: RateLimiter,
    watchdog: EscalationWatchdog,
    exit_detector: ExitDetector,
    test_loop: TestLoopDetector,
    consecutive_failures: u32,
    ticks: u32,
    last_output: Option<String>,
    counters: SafetyCounters,
    reports: TickBroadcaster,
    refresh: RefreshHandle,
}

impl ControlLoop {
    /// Loop over the built-in strategies and default classifiers.
    pub fn from_config(
        config: &AutopilotConfig,
        channel: Arc<dyn ControlChannel>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let registry =
            StrategyRegistry::with_builtins(RegistrySettings::from_config(&config.strategies))?;
        let classifiers = DefaultClassifiers::new()?;
        Ok(Self::new(config, channel, clock, registry, classifiers))
    }

    pub fn new(
        config: &AutopilotConfig,
        channel: Arc<dyn ControlChannel>,
        clock: Arc<dyn Clock>,
        registry: StrategyRegistry,
        classifiers: DefaultClassifiers,
    ) -> Self {
        let now = clock.now_ms();
        let completion: Arc<dyn TextClassifier> = Arc::new(classifiers.completion);
        let active_work: Arc<dyn TextClassifier> = Arc::new(classifiers.active_work);
        let uncertainty: Arc<dyn TextClassifier> = Arc::new(classifiers.uncertainty);
        let test_activity: Arc<dyn TextClassifier> = Arc::new(classifiers.test_activity);
        let feature_work: Arc<dyn TextClassifier> = Arc::new(classifiers.feature_work);
        Self {
            channel,
            clock,
            settings: LoopSettings::from_config(config),
            registry,
            actions: ResumeActions::new(ResumeSettings::from_config(config)),
            breaker: CircuitBreaker::new(config.circuit_breaker.settings()),
            rate_limiter: RateLimiter::new(config.rate_limit.max_calls_per_hour, now),
            watchdog: EscalationWatchdog::new(config.watchdog.settings()),
            exit_detector: ExitDetector::new(
                config.detectors.exit_settings(),
                completion,
                active_work,
                uncertainty,
            ),
            test_loop: TestLoopDetector::new(
                config.detectors.max_consecutive_test_loops,
                test_activity,
                feature_work,
            ),
            consecutive_failures: 0,
            ticks: 0,
            last_output: None,
            counters: SafetyCounters::default(),
            reports: TickBroadcaster::new(),
            refresh: RefreshHandle::default(),
        }
    }

    pub fn settings_mut(&mut self) -> &mut LoopSettings {
        &mut self.settings
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TickReport> {
        self.reports.subscribe()
    }

    pub fn refresh_handle(&self) -> RefreshHandle {
        self.refresh.clone()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn watchdog(&self) -> &EscalationWatchdog {
        &self.watchdog
    }

    /// Sleep before the next tick, from the loop's own failure count.
    pub fn next_sleep(&self) -> Duration {
        Duration::from_secs(backoff_secs(
            self.settings.base_interval.as_secs(),
            i64::from(self.consecutive_failures),
            self.settings.max_backoff_minutes,
        ))
    }

    /// Tick until cancelled, a detector fires, or the tick limit is reached.
    #[instrument(skip_all, fields(max_ticks = self.settings.max_ticks))]
    pub async fn run(&mut self, cancel: CancellationToken) -> LoopOutcome {
        info!("control loop started");
        let refresh = self.refresh.clone();
        loop {
            if cancel.is_cancelled() {
                return self.outcome(LoopStop::Cancelled);
            }
            if let Some(stop) = self.tick_limit() {
                return self.outcome(stop);
            }

            refresh.begin_tick();
            let TickOutcome { report, stop } = self.tick(&cancel).await;
            refresh.end_tick();

            let pause = Duration::from_millis(report.next_sleep_ms);
            self.reports.publish(report);
            if let Some(stop) = stop {
                info!(?stop, ticks = self.ticks, "control loop stopped");
                return self.outcome(stop);
            }
            if let Some(stop) = self.tick_limit() {
                return self.outcome(stop);
            }

            tokio::select! {
                () = cancel.cancelled() => return self.outcome(LoopStop::Cancelled),
                () = refresh.notified() => debug!("early tick requested"),
                () = sleep(pause) => {}
            }
        }
    }

    fn tick_limit(&self) -> Option<LoopStop> {
        let max_ticks = self.settings.max_ticks;
        (max_ticks > 0 && self.ticks >= max_ticks).then(|| {
            info!(max_ticks, "tick limit reached");
            LoopStop::MaxTicksReached { max_ticks }
        })
    }

    /// Run exactly one tick.
    ///
    /// Cancelling `cancel` mid-dispatch abandons the running strategy, skips
    /// the rest and ends the tick with [`LoopStop::Cancelled`].
    #[instrument(skip_all, fields(tick = self.ticks + 1))]
    pub async fn tick(&mut self, cancel: &CancellationToken) -> TickOutcome {
        self.ticks += 1;
        let now = self.clock.now_ms();

        let snapshot = match self.read_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => return self.channel_failure(now, &err),
        };

        if !snapshot.is_actionable() {
            debug!(status = snapshot.status.label(), "not actionable");
            self.watchdog.clear_waiting(now);
            self.consecutive_failures = 0;
            self.exit_detector.report_success();
            let note = format!("status {}", snapshot.status.label());
            let step = ActionStep::quiet(TickAction::Idle, note);
            return self.finish(now, Some(&snapshot), None, None, step);
        }

        let output = self.read_output().await;
        let guard = evaluate(&snapshot, self.settings.guard);

        if cancel.is_cancelled() {
            let step = ActionStep {
                stop: Some(LoopStop::Cancelled),
                ..ActionStep::quiet(TickAction::Idle, "cancelled before dispatch".to_string())
            };
            return self.finish(now, Some(&snapshot), Some(guard), None, step);
        }

        let mut step = if !guard.allowed {
            self.guard_blocked(now, &snapshot, &guard, cancel).await
        } else if !self.rate_limiter.can_make_call(now) {
            self.counters.rate_limited += 1;
            let reset_in = self.rate_limiter.time_until_reset_ms(now);
            warn!(reset_in_ms = reset_in, "hourly call budget exhausted");
            ActionStep::quiet(
                TickAction::RateLimited,
                format!("rate limited, resets in {reset_in}ms"),
            )
        } else {
            self.dispatch(now, &snapshot, cancel).await
        };
        if cancel.is_cancelled() {
            step.stop = Some(LoopStop::Cancelled);
        }

        let mut exit = None;
        if let Some(text) = output.filter(|text| self.last_output.as_ref() != Some(text)) {
            let check = self.exit_detector.check_response(&text);
            let test = self.test_loop.analyze_response(&text);
            if step.stop.is_none() {
                if check.should_exit {
                    step.stop = Some(LoopStop::CompletionDetected {
                        confidence: check.confidence,
                        detail: check.reason.clone().unwrap_or_default(),
                    });
                } else if test.should_exit {
                    step.stop = Some(LoopStop::TestLoopDetected {
                        consecutive: self.test_loop.status().consecutive,
                        detail: test.reason.clone().unwrap_or_default(),
                    });
                }
            }
            exit = Some(check);
            self.last_output = Some(text);
        }

        self.finish(now, Some(&snapshot), Some(guard), exit, step)
    }

    async fn read_snapshot(&self) -> Result<RuntimeSnapshot> {
        let limit = self.settings.channel_timeout;
        timeout(limit, self.channel.runtime_snapshot())
            .await
            .map_err(|_| anyhow!("snapshot read timed out after {}ms", limit.as_millis()))?
    }

    async fn read_output(&self) -> Option<String> {
        match timeout(self.settings.channel_timeout, self.channel.latest_output()).await {
            Ok(Ok(text)) => text,
            Ok(Err(err)) => {
                warn!(error = %err, "output read failed");
                None
            }
            Err(_) => {
                warn!("output read timed out");
                None
            }
        }
    }

    fn channel_failure(&mut self, now: Millis, err: &anyhow::Error) -> TickOutcome {
        let message = format!("{err:#}");
        warn!(error = %message, "snapshot read failed");
        self.counters.channel_errors += 1;
        let failure = FailureKind::classify(&message);
        let step = ActionStep {
            failure: Some(failure),
            stop: self.record_loop_failure(),
            ..ActionStep::quiet(TickAction::ChannelError, message)
        };
        self.finish(now, None, None, None, step)
    }

    /// Count one loop failure. Returns a stop when the failure budget is spent.
    fn record_loop_failure(&mut self) -> Option<LoopStop> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let check = self.exit_detector.report_failure();
        check.should_exit.then(|| LoopStop::TooManyFailures {
            failures: self.exit_detector.consecutive_failures(),
            detail: check.reason.unwrap_or_default(),
        })
    }

    async fn guard_blocked(
        &mut self,
        now: Millis,
        snapshot: &RuntimeSnapshot,
        guard: &GuardReport,
        cancel: &CancellationToken,
    ) -> ActionStep {
        self.counters.blocked_unsafe += 1;
        info!(score = guard.score, reason = %guard.reason, "guard blocked resume");
        if !snapshot.is_waiting() {
            return ActionStep::quiet(TickAction::GuardBlocked, guard.reason.clone());
        }

        let recovery = self
            .actions
            .recover_readiness(&mut self.registry, Arc::clone(&self.channel), cancel)
            .await;
        match &recovery {
            Some(outcome) if outcome.success => {
                self.watchdog
                    .record_success(now, "readiness recovery succeeded");
            }
            _ if cancel.is_cancelled() => {}
            _ => {
                let detail = format!("guard blocked: {}", guard.reason);
                self.watchdog.record_failure(now, &detail);
            }
        }
        ActionStep {
            dispatch: recovery,
            ..ActionStep::quiet(TickAction::GuardBlocked, guard.reason.clone())
        }
    }

    async fn dispatch(
        &mut self,
        now: Millis,
        snapshot: &RuntimeSnapshot,
        cancel: &CancellationToken,
    ) -> ActionStep {
        let escalated = self.watchdog.is_armed() && snapshot.is_waiting();
        let Some(plan) = self.actions.plan(snapshot, escalated) else {
            return ActionStep::quiet(TickAction::Idle, "nothing to dispatch".to_string());
        };

        let channel = Arc::clone(&self.channel);
        let actions = &self.actions;
        let registry = &mut self.registry;
        let call = self
            .breaker
            .execute(now, move || async move {
                let outcome = actions.perform(registry, channel, plan, cancel).await;
                if outcome.success {
                    Ok(outcome)
                } else {
                    Err(anyhow::Error::new(DispatchFailed(outcome)))
                }
            })
            .await;

        match call {
            BreakerCall::Blocked(blocked) => {
                self.counters.breaker_blocked += 1;
                ActionStep::quiet(
                    TickAction::BreakerBlocked,
                    format!("circuit open, retry in {}ms", blocked.retry_in_ms),
                )
            }
            BreakerCall::Completed(Ok(outcome)) => {
                self.counters.dispatched += 1;
                self.rate_limiter.record_call(now);
                self.consecutive_failures = 0;
                self.exit_detector.report_success();
                if outcome.action == ResumeAction::EscalatedResume {
                    self.watchdog.consume(now);
                } else {
                    self.watchdog.record_success(now, &outcome.detail);
                }
                info!(action = ?outcome.action, "dispatch succeeded");
                let note = outcome.detail.clone();
                ActionStep {
                    dispatch: Some(outcome),
                    ..ActionStep::quiet(TickAction::Dispatched, note)
                }
            }
            BreakerCall::Completed(Err(err)) => {
                self.counters.dispatched += 1;
                self.rate_limiter.record_call(now);
                let (outcome, message) = match err.downcast::<DispatchFailed>() {
                    Ok(DispatchFailed(outcome)) => {
                        let message = failure_message(&outcome);
                        (Some(outcome), message)
                    }
                    Err(other) => (None, format!("{other:#}")),
                };
                if cancel.is_cancelled() {
                    info!("dispatch cancelled");
                    return ActionStep {
                        dispatch: outcome,
                        stop: Some(LoopStop::Cancelled),
                        ..ActionStep::quiet(TickAction::Dispatched, message)
                    };
                }
                warn!(error = %message, "dispatch failed");
                if snapshot.is_waiting() {
                    self.watchdog.record_failure(now, &message);
                }
                ActionStep {
                    action: TickAction::Dispatched,
                    dispatch: outcome,
                    failure: Some(FailureKind::classify(&message)),
                    stop: self.record_loop_failure(),
                    note: message,
                }
            }
        }
    }

    fn finish(
        &mut self,
        now: Millis,
        snapshot: Option<&RuntimeSnapshot>,
        guard: Option<GuardReport>,
        exit: Option<ExitCheck>,
        step: ActionStep,
    ) -> TickOutcome {
        self.counters.categories = self.registry.counters().clone();
        let fallback = RuntimeSnapshot::default();
        let verdict = derive_verdict(
            snapshot.unwrap_or(&fallback),
            guard.as_ref(),
            exit.as_ref(),
        );
        let next_sleep_ms = u64::try_from(self.next_sleep().as_millis()).unwrap_or(u64::MAX);
        let report = TickReport {
            tick: self.ticks,
            at: now,
            status: snapshot.map(|snapshot| snapshot.status),
            action: step.action,
            guard,
            dispatch: step.dispatch,
            failure: step.failure,
            escalation: self.watchdog.state().clone(),
            breaker: self.breaker.snapshot(),
            rate_limit: self.rate_limiter.state(),
            test_loop: self.test_loop.status(),
            verdict,
            counters: self.counters.clone(),
            consecutive_failures: self.consecutive_failures,
            next_sleep_ms,
            note: step.note,
        };
        TickOutcome {
            report,
            stop: step.stop,
        }
    }

    fn outcome(&self, stop: LoopStop) -> LoopOutcome {
        LoopOutcome {
            ticks: self.ticks,
            stop,
            counters: self.counters.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ActionCategory, RuntimeStatus};
    use crate::io::replay::ReplayFrame;
    use crate::test_support::{
        ScriptedStrategy, StrategyScript, blind_frame, idle_frame, output_frame, pending_frame,
        scripted_loop, waiting_frame,
    };

    fn resume_strategies(submit: StrategyScript) -> Vec<Arc<ScriptedStrategy>> {
        vec![
            ScriptedStrategy::new("type", ActionCategory::TextEntry, 1, StrategyScript::Succeed),
            ScriptedStrategy::new("click", ActionCategory::Activation, 1, StrategyScript::Succeed),
            ScriptedStrategy::new("send", ActionCategory::Submission, 1, submit),
        ]
    }

    async fn ticks(control: &mut ControlLoop, count: usize) -> Vec<TickOutcome> {
        let cancel = CancellationToken::new();
        let mut outcomes = Vec::new();
        for _ in 0..count {
            outcomes.push(control.tick(&cancel).await);
        }
        outcomes
    }

    #[tokio::test(start_paused = true)]
    async fn idle_snapshot_sleeps_at_base_interval() {
        let (mut control, _) = scripted_loop(
            vec![idle_frame()],
            resume_strategies(StrategyScript::Succeed),
            AutopilotConfig::default(),
        );
        let outcome = &ticks(&mut control, 1).await[0];
        assert_eq!(outcome.report.action, TickAction::Idle);
        assert_eq!(outcome.report.next_sleep_ms, 30_000);
        assert!(outcome.stop.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_snapshot_dispatches_a_resume() {
        let (mut control, channel) = scripted_loop(
            vec![waiting_frame()],
            resume_strategies(StrategyScript::Succeed),
            AutopilotConfig::default(),
        );
        let outcome = &ticks(&mut control, 1).await[0];
        assert_eq!(outcome.report.action, TickAction::Dispatched);
        let dispatch = outcome.report.dispatch.as_ref().expect("dispatch");
        assert_eq!(dispatch.action, ResumeAction::Resume);
        assert!(dispatch.success);
        assert_eq!(outcome.report.rate_limit.calls_this_hour, 1);
        assert_eq!(outcome.report.counters.dispatched, 1);
        assert!(channel.dispatched().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_actions_are_accepted() {
        let (mut control, _) = scripted_loop(
            vec![pending_frame()],
            resume_strategies(StrategyScript::Succeed),
            AutopilotConfig::default(),
        );
        let outcome = &ticks(&mut control, 1).await[0];
        let dispatch = outcome.report.dispatch.as_ref().expect("dispatch");
        assert_eq!(dispatch.action, ResumeAction::AcceptPending);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_grow_backoff_and_success_resets_it() {
        let frames = vec![waiting_frame(), waiting_frame(), waiting_frame()];
        let (mut control, _) = scripted_loop(
            frames,
            vec![
                ScriptedStrategy::new("type", ActionCategory::TextEntry, 1, StrategyScript::Succeed),
                ScriptedStrategy::sequence(
                    "send",
                    ActionCategory::Submission,
                    1,
                    vec![StrategyScript::Fail, StrategyScript::Fail, StrategyScript::Succeed],
                ),
            ],
            AutopilotConfig::default(),
        );
        let outcomes = ticks(&mut control, 3).await;
        assert_eq!(outcomes[0].report.next_sleep_ms, 60_000);
        assert_eq!(outcomes[0].report.failure, Some(FailureKind::Exhausted));
        assert_eq!(outcomes[1].report.next_sleep_ms, 120_000);
        assert_eq!(outcomes[2].report.next_sleep_ms, 30_000);
        assert_eq!(outcomes[2].report.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn guard_block_is_not_a_loop_failure() {
        let (mut control, _) = scripted_loop(
            vec![blind_frame()],
            resume_strategies(StrategyScript::Succeed),
            AutopilotConfig::default(),
        );
        let outcome = &ticks(&mut control, 1).await[0];
        assert_eq!(outcome.report.action, TickAction::GuardBlocked);
        assert_eq!(outcome.report.counters.blocked_unsafe, 1);
        assert_eq!(outcome.report.consecutive_failures, 0);
        assert_eq!(outcome.report.escalation.consecutive_failures, 1);
        assert!(outcome.report.dispatch.is_none());
        let guard = outcome.report.guard.as_ref().expect("guard");
        assert!(!guard.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_guard_blocks_arm_escalation_and_next_resume_consumes_it() {
        let mut config = AutopilotConfig::default();
        config.watchdog.threshold = 2;
        let frames = vec![blind_frame(), blind_frame(), waiting_frame()];
        let text = ScriptedStrategy::new("type", ActionCategory::TextEntry, 1, StrategyScript::Succeed);
        let (mut control, _) = scripted_loop(
            frames,
            vec![
                Arc::clone(&text),
                ScriptedStrategy::new("send", ActionCategory::Submission, 1, StrategyScript::Succeed),
            ],
            config.clone(),
        );
        let outcomes = ticks(&mut control, 3).await;
        assert!(!outcomes[0].report.escalation.armed);
        assert!(outcomes[1].report.escalation.armed);

        let dispatch = outcomes[2].report.dispatch.as_ref().expect("dispatch");
        assert_eq!(dispatch.action, ResumeAction::EscalatedResume);
        assert_eq!(text.seen_texts(), vec![config.control.escalation_message]);
        assert!(!outcomes[2].report.escalation.armed);
        let kinds: Vec<_> = outcomes[2]
            .report
            .escalation
            .events
            .iter()
            .map(|event| event.event)
            .collect();
        assert!(kinds.contains(&crate::core::watchdog::EscalationEventKind::Consumed));
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_waiting_clears_escalation() {
        let frames = vec![blind_frame(), idle_frame()];
        let (mut control, _) = scripted_loop(
            frames,
            resume_strategies(StrategyScript::Succeed),
            AutopilotConfig::default(),
        );
        let outcomes = ticks(&mut control, 2).await;
        assert_eq!(outcomes[0].report.escalation.consecutive_failures, 1);
        assert_eq!(outcomes[1].report.escalation.consecutive_failures, 0);
        let last = outcomes[1].report.escalation.events.back().expect("event");
        assert_eq!(last.detail, "waiting cleared");
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_blocks_without_counting_failures() {
        let mut config = AutopilotConfig::default();
        config.circuit_breaker.failure_threshold = 2;
        config.detectors.max_consecutive_failures = 10;
        let frames = vec![waiting_frame(), waiting_frame(), waiting_frame()];
        let (mut control, _) = scripted_loop(
            frames,
            resume_strategies(StrategyScript::Fail),
            config,
        );
        let outcomes = ticks(&mut control, 3).await;
        assert_eq!(outcomes[1].report.breaker.state, crate::core::circuit_breaker::CircuitState::Open);
        assert_eq!(outcomes[2].report.action, TickAction::BreakerBlocked);
        assert_eq!(outcomes[2].report.consecutive_failures, 2);
        assert_eq!(outcomes[2].report.counters.breaker_blocked, 1);
        assert_eq!(outcomes[2].report.rate_limit.calls_this_hour, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_refuses_dispatch() {
        let mut config = AutopilotConfig::default();
        config.rate_limit.max_calls_per_hour = 1;
        let frames = vec![waiting_frame(), waiting_frame()];
        let (mut control, _) = scripted_loop(
            frames,
            resume_strategies(StrategyScript::Succeed),
            config,
        );
        let outcomes = ticks(&mut control, 2).await;
        assert_eq!(outcomes[0].report.action, TickAction::Dispatched);
        assert_eq!(outcomes[1].report.action, TickAction::RateLimited);
        assert_eq!(outcomes[1].report.consecutive_failures, 0);
        assert_eq!(outcomes[1].report.counters.rate_limited, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_text_stops_the_loop() {
        let frames = vec![output_frame(
            waiting_frame(),
            "All tasks are complete. The implementation is finished and all tests pass.",
        )];
        let (mut control, _) = scripted_loop(
            frames,
            resume_strategies(StrategyScript::Succeed),
            AutopilotConfig::default(),
        );
        let outcome = &ticks(&mut control, 1).await[0];
        assert!(matches!(
            outcome.stop,
            Some(LoopStop::CompletionDetected { .. })
        ));
        assert!(outcome.report.verdict.is_complete);
    }

    #[tokio::test(start_paused = true)]
    async fn ambiguous_text_keeps_the_loop_running() {
        let frames = vec![output_frame(
            waiting_frame(),
            "Maybe done? I'm not sure, still working on the parser.",
        )];
        let (mut control, _) = scripted_loop(
            frames,
            resume_strategies(StrategyScript::Succeed),
            AutopilotConfig::default(),
        );
        let outcome = &ticks(&mut control, 1).await[0];
        assert!(outcome.stop.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_output_is_analyzed_once() {
        let text = "Running the test suite again to verify tests pass.";
        let frames = vec![
            output_frame(waiting_frame(), text),
            output_frame(waiting_frame(), text),
            output_frame(waiting_frame(), text),
        ];
        let (mut control, _) = scripted_loop(
            frames,
            resume_strategies(StrategyScript::Succeed),
            AutopilotConfig::default(),
        );
        let outcomes = ticks(&mut control, 3).await;
        assert_eq!(outcomes[2].report.test_loop.total, 1);
        assert!(outcomes.iter().all(|outcome| outcome.stop.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_output_stops_after_three_rounds() {
        let frames = vec![
            output_frame(waiting_frame(), "Running the tests again to verify tests pass."),
            output_frame(waiting_frame(), "Re-running the test suite to check the tests."),
            output_frame(waiting_frame(), "Running tests once more, verifying test results."),
        ];
        let (mut control, _) = scripted_loop(
            frames,
            resume_strategies(StrategyScript::Succeed),
            AutopilotConfig::default(),
        );
        let outcomes = ticks(&mut control, 3).await;
        assert!(outcomes[1].stop.is_none());
        assert!(matches!(
            outcomes[2].stop,
            Some(LoopStop::TestLoopDetected { consecutive: 3, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn channel_errors_count_and_eventually_stop() {
        let mut config = AutopilotConfig::default();
        config.detectors.max_consecutive_failures = 2;
        let broken = || ReplayFrame {
            error: Some("connection reset".to_string()),
            ..ReplayFrame::default()
        };
        let (mut control, _) = scripted_loop(
            vec![broken(), broken()],
            resume_strategies(StrategyScript::Succeed),
            config,
        );
        let outcomes = ticks(&mut control, 2).await;
        assert_eq!(outcomes[0].report.action, TickAction::ChannelError);
        assert_eq!(outcomes[0].report.failure, Some(FailureKind::Transport));
        assert!(outcomes[0].stop.is_none());
        assert!(matches!(
            outcomes[1].stop,
            Some(LoopStop::TooManyFailures { failures: 2, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_tick_breaks_the_failure_streak() {
        let broken = || ReplayFrame {
            error: Some("connection reset".to_string()),
            ..ReplayFrame::default()
        };
        let frames = vec![broken(), broken(), broken(), broken(), idle_frame(), broken()];
        let (mut control, _) = scripted_loop(
            frames,
            resume_strategies(StrategyScript::Succeed),
            AutopilotConfig::default(),
        );
        let outcomes = ticks(&mut control, 6).await;
        assert_eq!(outcomes[3].report.consecutive_failures, 4);
        assert_eq!(outcomes[4].report.consecutive_failures, 0);
        assert_eq!(outcomes[5].report.consecutive_failures, 1);
        assert!(outcomes.iter().all(|outcome| outcome.stop.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_dispatch_skips_remaining_strategies() {
        let fallback =
            ScriptedStrategy::new("t2", ActionCategory::TextEntry, 2, StrategyScript::Succeed);
        let send =
            ScriptedStrategy::new("send", ActionCategory::Submission, 1, StrategyScript::Succeed);
        let (mut control, _) = scripted_loop(
            vec![waiting_frame()],
            vec![
                ScriptedStrategy::new("t1", ActionCategory::TextEntry, 1, StrategyScript::Hang),
                Arc::clone(&fallback),
                Arc::clone(&send),
            ],
            AutopilotConfig::default(),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let started = tokio::time::Instant::now();

        let (outcome, ()) = tokio::join!(control.tick(&cancel), async move {
            sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        assert_eq!(outcome.stop, Some(LoopStop::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(fallback.calls(), 0);
        assert_eq!(send.calls(), 0);
        assert_eq!(outcome.report.consecutive_failures, 0);
        assert_eq!(outcome.report.escalation.consecutive_failures, 0);
        let dispatch = outcome.report.dispatch.as_ref().expect("dispatch");
        assert_eq!(dispatch.detail, "cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn last_tick_returns_without_sleeping() {
        let mut config = AutopilotConfig::default();
        config.control.max_ticks = 1;
        let (mut control, _) = scripted_loop(
            vec![idle_frame()],
            resume_strategies(StrategyScript::Succeed),
            config,
        );
        let started = tokio::time::Instant::now();
        let outcome = control.run(CancellationToken::new()).await;
        assert_eq!(outcome.stop, LoopStop::MaxTicksReached { max_ticks: 1 });
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_at_max_ticks() {
        let mut config = AutopilotConfig::default();
        config.control.max_ticks = 2;
        let (mut control, _) = scripted_loop(
            vec![idle_frame(), idle_frame(), idle_frame()],
            resume_strategies(StrategyScript::Succeed),
            config,
        );
        let outcome = control.run(CancellationToken::new()).await;
        assert_eq!(outcome.ticks, 2);
        assert_eq!(outcome.stop, LoopStop::MaxTicksReached { max_ticks: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_token_stops_before_ticking() {
        let (mut control, _) = scripted_loop(
            vec![waiting_frame()],
            resume_strategies(StrategyScript::Succeed),
            AutopilotConfig::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = control.run(cancel).await;
        assert_eq!(outcome.ticks, 0);
        assert_eq!(outcome.stop, LoopStop::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_sleep_stops_promptly() {
        let (mut control, _) = scripted_loop(
            vec![idle_frame(), idle_frame()],
            resume_strategies(StrategyScript::Succeed),
            AutopilotConfig::default(),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let (outcome, ()) = tokio::join!(control.run(cancel), async move {
            sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        assert_eq!(outcome.ticks, 1);
        assert_eq!(outcome.stop, LoopStop::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_triggers_an_early_tick_and_coalesces() {
        let mut config = AutopilotConfig::default();
        config.control.max_ticks = 2;
        let (mut control, _) = scripted_loop(
            vec![idle_frame(), idle_frame()],
            resume_strategies(StrategyScript::Succeed),
            config,
        );
        let refresh = control.refresh_handle();
        let started = tokio::time::Instant::now();
        let (outcome, accepted) = tokio::join!(control.run(CancellationToken::new()), async move {
            sleep(Duration::from_secs(1)).await;
            (refresh.request(), refresh.request())
        });
        assert_eq!(accepted, (true, false));
        assert_eq!(outcome.stop, LoopStop::MaxTicksReached { max_ticks: 2 });
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn reports_are_broadcast_per_tick() {
        let mut config = AutopilotConfig::default();
        config.control.max_ticks = 2;
        let (mut control, _) = scripted_loop(
            vec![idle_frame(), waiting_frame()],
            resume_strategies(StrategyScript::Succeed),
            config,
        );
        let mut reports = control.subscribe();
        control.run(CancellationToken::new()).await;
        let first = reports.recv().await.expect("first report");
        let second = reports.recv().await.expect("second report");
        assert_eq!(first.tick, 1);
        assert_eq!(first.status, Some(RuntimeStatus::Idle));
        assert_eq!(second.action, TickAction::Dispatched);
    }
}
