//! Loop-level harness tests for full autopilot sessions.
//!
//! These tests drive `ControlLoop` over replayed frames to verify end-to-end
//! behavior: guard gating, built-in strategy dispatch through the channel,
//! breaker and rate-limit recovery over time, and loop termination.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use autopilot::core::circuit_breaker::CircuitState;
use autopilot::core::clock::SystemClock;
use autopilot::core::rate_limiter::HOUR_MS;
use autopilot::core::types::{ActionCategory, RuntimeStatus};
use autopilot::io::channel::{ControlChannel, DomEvent, ElementNode, EventTarget, Rect};
use autopilot::io::config::AutopilotConfig;
use autopilot::io::replay::{ReplayChannel, ReplayFrame};
use autopilot::looping::{ControlLoop, LoopStop};
use autopilot::report::TickAction;
use autopilot::resume::ResumeAction;
use autopilot::test_support::{
    ManualClock, ScriptedStrategy, StrategyScript, TEST_EPOCH_MS, blind_frame, idle_frame,
    output_frame, pending_frame, scripted_loop, scripted_loop_with_clock, waiting_frame,
};

fn button(id: &str, text: &str) -> ElementNode {
    ElementNode {
        node_id: id.to_string(),
        tag: "button".to_string(),
        text: text.to_string(),
        bounds: Some(Rect {
            x: 100.0,
            y: 200.0,
            width: 40.0,
            height: 20.0,
        }),
    }
}

fn resume_strategies(submit: StrategyScript) -> Vec<Arc<ScriptedStrategy>> {
    vec![
        ScriptedStrategy::new("type", ActionCategory::TextEntry, 1, StrategyScript::Succeed),
        ScriptedStrategy::new("click", ActionCategory::Activation, 1, StrategyScript::Succeed),
        ScriptedStrategy::new("send", ActionCategory::Submission, 1, submit),
    ]
}

/// Session sequence:
/// 1. processing → idle tick
/// 2. waiting → resume typed and submitted
/// 3. pending action → accept clicked
/// 4. waiting but blind → guard blocks, nothing dispatched
/// 5. waiting with completion text → resume, then loop stops
#[tokio::test(start_paused = true)]
async fn session_runs_until_completion_is_detected() {
    let mut processing = idle_frame();
    processing.snapshot.status = RuntimeStatus::Processing;
    let frames = vec![
        processing,
        waiting_frame(),
        pending_frame(),
        blind_frame(),
        output_frame(
            waiting_frame(),
            "All tasks are complete. The implementation is finished and all tests pass.",
        ),
    ];
    let (mut control, _) = scripted_loop(
        frames,
        resume_strategies(StrategyScript::Succeed),
        AutopilotConfig::default(),
    );
    let mut reports = control.subscribe();

    let outcome = control.run(CancellationToken::new()).await;

    assert_eq!(outcome.ticks, 5);
    assert!(matches!(outcome.stop, LoopStop::CompletionDetected { .. }));
    assert_eq!(outcome.counters.blocked_unsafe, 1);
    assert_eq!(outcome.counters.dispatched, 3);

    let mut actions = Vec::new();
    while let Ok(report) = reports.try_recv() {
        actions.push((
            report.action,
            report.dispatch.as_ref().map(|dispatch| dispatch.action),
        ));
    }
    assert_eq!(
        actions,
        vec![
            (TickAction::Idle, None),
            (TickAction::Dispatched, Some(ResumeAction::Resume)),
            (TickAction::Dispatched, Some(ResumeAction::AcceptPending)),
            (TickAction::GuardBlocked, None),
            (TickAction::Dispatched, Some(ResumeAction::Resume)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn failure_streak_stops_the_loop_as_stuck() {
    let frames = (0..10).map(|_| waiting_frame()).collect();
    let mut config = AutopilotConfig::default();
    config.circuit_breaker.failure_threshold = 100;
    let (mut control, _) = scripted_loop(
        frames,
        resume_strategies(StrategyScript::Error("send button detached")),
        config,
    );

    let outcome = control.run(CancellationToken::new()).await;

    assert_eq!(outcome.ticks, 5);
    match outcome.stop {
        LoopStop::TooManyFailures { failures, .. } => assert_eq!(failures, 5),
        other => panic!("unexpected stop {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn breaker_half_opens_after_reset_timeout_and_closes_on_success() {
    let clock = Arc::new(ManualClock::new(TEST_EPOCH_MS));
    let mut config = AutopilotConfig::default();
    config.circuit_breaker.failure_threshold = 1;
    let frames = vec![waiting_frame(), waiting_frame(), waiting_frame()];
    let strategies = vec![
        ScriptedStrategy::new("type", ActionCategory::TextEntry, 1, StrategyScript::Succeed),
        ScriptedStrategy::sequence(
            "send",
            ActionCategory::Submission,
            1,
            vec![StrategyScript::Fail, StrategyScript::Succeed],
        ),
    ];
    let (mut control, _) =
        scripted_loop_with_clock(frames, strategies, config.clone(), Arc::clone(&clock));
    let cancel = CancellationToken::new();

    let tripped = control.tick(&cancel).await.report;
    assert_eq!(tripped.breaker.state, CircuitState::Open);

    clock.advance(1_000);
    let blocked = control.tick(&cancel).await.report;
    assert_eq!(blocked.action, TickAction::BreakerBlocked);

    clock.advance(config.circuit_breaker.reset_timeout_ms);
    let recovered = control.tick(&cancel).await.report;
    assert_eq!(recovered.action, TickAction::Dispatched);
    assert_eq!(recovered.breaker.state, CircuitState::Closed);
    assert_eq!(recovered.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_window_resets_after_an_hour() {
    let clock = Arc::new(ManualClock::new(TEST_EPOCH_MS));
    let mut config = AutopilotConfig::default();
    config.rate_limit.max_calls_per_hour = 1;
    let frames = vec![waiting_frame(), waiting_frame(), waiting_frame()];
    let (mut control, _) = scripted_loop_with_clock(
        frames,
        resume_strategies(StrategyScript::Succeed),
        config,
        Arc::clone(&clock),
    );
    let cancel = CancellationToken::new();

    assert_eq!(
        control.tick(&cancel).await.report.action,
        TickAction::Dispatched
    );
    assert_eq!(
        control.tick(&cancel).await.report.action,
        TickAction::RateLimited
    );
    clock.advance(HOUR_MS);
    let report = control.tick(&cancel).await.report;
    assert_eq!(report.action, TickAction::Dispatched);
    assert_eq!(report.rate_limit.calls_this_hour, 1);
}

#[tokio::test(start_paused = true)]
async fn builtin_strategies_type_and_submit_through_the_channel() {
    let config = AutopilotConfig::default();
    let mut frame = waiting_frame();
    frame.elements.insert(
        config.strategies.submit_selector.clone(),
        vec![button("send", "Send")],
    );
    let channel = Arc::new(ReplayChannel::new(vec![frame]));
    let mut control = ControlLoop::from_config(
        &config,
        Arc::clone(&channel) as Arc<dyn ControlChannel>,
        Arc::new(SystemClock),
    )
    .expect("control loop");

    let report = control.tick(&CancellationToken::new()).await.report;

    assert_eq!(report.action, TickAction::Dispatched);
    let dispatched = channel.dispatched();
    let typed = dispatched
        .iter()
        .filter(|record| matches!(record.event, DomEvent::Key { .. }))
        .count();
    assert_eq!(typed, config.control.resume_message.chars().count() * 2);
    let last = dispatched.last().expect("submit click");
    assert_eq!(
        last.target,
        EventTarget::Node {
            node_id: "send".to_string()
        }
    );
    assert_eq!(last.event, DomEvent::Click);
}

#[tokio::test(start_paused = true)]
async fn parallel_activation_attempts_every_builtin_click() {
    let mut config = AutopilotConfig::default();
    config.strategies.parallel_execution = true;
    let mut frame: ReplayFrame = pending_frame();
    frame.elements.insert(
        config.strategies.accept_selector.clone(),
        vec![button("deny", "Reject"), button("ok", "Accept")],
    );
    let channel = Arc::new(ReplayChannel::new(vec![frame]));
    let mut control = ControlLoop::from_config(
        &config,
        Arc::clone(&channel) as Arc<dyn ControlChannel>,
        Arc::new(SystemClock),
    )
    .expect("control loop");

    let report = control.tick(&CancellationToken::new()).await.report;

    let dispatch = report.dispatch.expect("dispatch");
    assert_eq!(dispatch.action, ResumeAction::AcceptPending);
    let ids: Vec<&str> = dispatch
        .results()
        .map(|result| result.strategy_id.as_str())
        .collect();
    assert_eq!(ids, vec!["selector-click", "pointer-click", "script-click"]);
    assert_eq!(channel.scripts().len(), 1);
    assert!(channel.dispatched().iter().all(|record| record.target
        != EventTarget::Node {
            node_id: "deny".to_string()
        }));
}

#[tokio::test(start_paused = true)]
async fn disconnected_channel_fails_fast_without_touching_the_host() {
    let mut frame = waiting_frame();
    frame.disconnected = true;
    let channel = Arc::new(ReplayChannel::new(vec![frame]));
    let mut control = ControlLoop::from_config(
        &AutopilotConfig::default(),
        Arc::clone(&channel) as Arc<dyn ControlChannel>,
        Arc::new(SystemClock),
    )
    .expect("control loop");

    let report = control.tick(&CancellationToken::new()).await.report;

    assert_eq!(report.action, TickAction::Dispatched);
    assert_eq!(report.consecutive_failures, 1);
    let dispatch = report.dispatch.expect("dispatch");
    assert!(!dispatch.success);
    assert!(
        dispatch
            .results()
            .all(|result| result.error.as_deref() == Some("control channel unavailable"))
    );
    assert!(channel.dispatched().is_empty());
}
