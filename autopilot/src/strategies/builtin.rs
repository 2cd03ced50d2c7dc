//! Built-in strategies for each action category.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::core::types::ActionCategory;
use crate::io::channel::{
    ControlChannel, DomEvent, ElementNode, EventTarget, KeyPhase, Modifiers, MousePhase,
};
use crate::strategies::{ActionStrategy, ExecutionContext};

/// Every built-in strategy, including the ones disabled by default.
pub fn all() -> Vec<Arc<dyn ActionStrategy>> {
    vec![
        Arc::new(KeyDispatch),
        Arc::new(InsertText),
        Arc::new(DomInject),
        Arc::new(SelectorClick),
        Arc::new(PointerClick),
        Arc::new(ScriptClick),
        Arc::new(CoordinateClick),
        Arc::new(SubmitButton),
        Arc::new(EnterKey),
        Arc::new(ScriptSubmit),
        Arc::new(AltEnter),
    ]
}

/// First visible element whose text matches an accept keyword and no reject keyword.
///
/// With no accept keywords, any element not rejected qualifies.
pub fn pick_target<'a>(
    nodes: &'a [ElementNode],
    accept: &[String],
    reject: &[String],
) -> Option<&'a ElementNode> {
    nodes.iter().find(|node| {
        let text = node.text.to_lowercase();
        let rejected = reject
            .iter()
            .any(|keyword| text.contains(&keyword.to_lowercase()));
        let accepted = accept.is_empty()
            || accept
                .iter()
                .any(|keyword| text.contains(&keyword.to_lowercase()));
        accepted && !rejected
    })
}

fn channel(ctx: &ExecutionContext) -> Result<&Arc<dyn ControlChannel>> {
    ctx.connected_channel()
        .context("control channel unavailable")
}

/// JavaScript string literal for `value`.
fn js_string(value: &str) -> Result<String> {
    serde_json::to_string(value).context("encode script literal")
}

async fn press_key(
    channel: &dyn ControlChannel,
    key: &str,
    code: &str,
    text: Option<&str>,
    modifiers: Modifiers,
) -> Result<()> {
    for phase in [KeyPhase::Down, KeyPhase::Up] {
        let event = DomEvent::Key {
            phase,
            key: key.to_string(),
            code: code.to_string(),
            text: text.map(str::to_string),
            modifiers,
        };
        channel.dispatch_event(&EventTarget::Focused, &event).await?;
    }
    Ok(())
}

async fn click_point(channel: &dyn ControlChannel, x: f64, y: f64) -> Result<()> {
    let target = EventTarget::Point { x, y };
    for phase in [MousePhase::Pressed, MousePhase::Released] {
        channel
            .dispatch_event(
                &target,
                &DomEvent::Mouse {
                    phase,
                    click_count: 1,
                },
            )
            .await?;
    }
    Ok(())
}

async fn matching_node(ctx: &ExecutionContext) -> Result<Option<ElementNode>> {
    let Some(selector) = ctx.selector.as_deref() else {
        return Ok(None);
    };
    let nodes = channel(ctx)?.query_visible_elements(selector).await?;
    Ok(pick_target(&nodes, &ctx.accept_keywords, &ctx.reject_keywords).cloned())
}

fn script_result(value: &serde_json::Value) -> bool {
    value.as_bool().unwrap_or(false)
}

// ---- text entry ----

/// Types the text one key at a time into the focused element.
pub struct KeyDispatch;

#[async_trait]
impl ActionStrategy for KeyDispatch {
    fn id(&self) -> &str {
        "key-dispatch"
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::TextEntry
    }

    fn priority(&self) -> u32 {
        1
    }

    fn post_delay(&self) -> Duration {
        Duration::from_millis(10)
    }

    async fn attempt(&self, ctx: &ExecutionContext) -> Result<bool> {
        let Some(text) = ctx.text.as_deref() else {
            return Ok(false);
        };
        let channel = channel(ctx)?;
        let mut buf = [0u8; 4];
        for ch in text.chars() {
            let key: &str = ch.encode_utf8(&mut buf);
            press_key(channel.as_ref(), key, "", Some(key), Modifiers::default()).await?;
        }
        Ok(true)
    }
}

/// Inserts the whole text into the focused element in one event.
pub struct InsertText;

#[async_trait]
impl ActionStrategy for InsertText {
    fn id(&self) -> &str {
        "insert-text"
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::TextEntry
    }

    fn priority(&self) -> u32 {
        2
    }

    fn post_delay(&self) -> Duration {
        Duration::from_millis(100)
    }

    async fn attempt(&self, ctx: &ExecutionContext) -> Result<bool> {
        let Some(text) = ctx.text.as_deref() else {
            return Ok(false);
        };
        channel(ctx)?
            .dispatch_event(
                &EventTarget::Focused,
                &DomEvent::InsertText {
                    text: text.to_string(),
                },
            )
            .await?;
        Ok(true)
    }
}

/// Sets the value of the focused input through script evaluation.
pub struct DomInject;

#[async_trait]
impl ActionStrategy for DomInject {
    fn id(&self) -> &str {
        "dom-inject"
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::TextEntry
    }

    fn priority(&self) -> u32 {
        3
    }

    fn post_delay(&self) -> Duration {
        Duration::from_millis(50)
    }

    async fn attempt(&self, ctx: &ExecutionContext) -> Result<bool> {
        let Some(text) = ctx.text.as_deref() else {
            return Ok(false);
        };
        let literal = js_string(text)?;
        let script = format!(
            "(() => {{\
               const el = document.activeElement;\
               if (!el) return false;\
               if (el.isContentEditable) {{ el.textContent = {literal}; }}\
               else if (el.tagName === 'INPUT' || el.tagName === 'TEXTAREA') {{ el.value = {literal}; }}\
               else return false;\
               el.dispatchEvent(new Event('input', {{ bubbles: true }}));\
               return true;\
             }})()"
        );
        let value = channel(ctx)?.evaluate_script(&script).await?;
        Ok(script_result(&value))
    }
}

// ---- activation ----

/// Clicks the first visible element matching the selector and keywords.
pub struct SelectorClick;

#[async_trait]
impl ActionStrategy for SelectorClick {
    fn id(&self) -> &str {
        "selector-click"
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::Activation
    }

    fn priority(&self) -> u32 {
        1
    }

    fn post_delay(&self) -> Duration {
        Duration::from_millis(50)
    }

    async fn attempt(&self, ctx: &ExecutionContext) -> Result<bool> {
        let Some(node) = matching_node(ctx).await? else {
            return Ok(false);
        };
        let target = EventTarget::Node {
            node_id: node.node_id,
        };
        channel(ctx)?.dispatch_event(&target, &DomEvent::Click).await?;
        Ok(true)
    }
}

/// Presses and releases the mouse at the center of the matching element.
pub struct PointerClick;

#[async_trait]
impl ActionStrategy for PointerClick {
    fn id(&self) -> &str {
        "pointer-click"
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::Activation
    }

    fn priority(&self) -> u32 {
        2
    }

    fn post_delay(&self) -> Duration {
        Duration::from_millis(50)
    }

    async fn attempt(&self, ctx: &ExecutionContext) -> Result<bool> {
        let Some(bounds) = matching_node(ctx).await?.and_then(|node| node.bounds) else {
            return Ok(false);
        };
        let (x, y) = bounds.center();
        click_point(channel(ctx)?.as_ref(), x, y).await?;
        Ok(true)
    }
}

/// Fires mouse events on the matching element from inside the page.
pub struct ScriptClick;

#[async_trait]
impl ActionStrategy for ScriptClick {
    fn id(&self) -> &str {
        "script-click"
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::Activation
    }

    fn priority(&self) -> u32 {
        3
    }

    fn post_delay(&self) -> Duration {
        Duration::from_millis(50)
    }

    async fn attempt(&self, ctx: &ExecutionContext) -> Result<bool> {
        let Some(selector) = ctx.selector.as_deref() else {
            return Ok(false);
        };
        let selector = js_string(selector)?;
        let accept = serde_json::to_string(&ctx.accept_keywords).context("encode keywords")?;
        let reject = serde_json::to_string(&ctx.reject_keywords).context("encode keywords")?;
        let script = format!(
            "(() => {{\
               const accept = {accept}.map(k => k.toLowerCase());\
               const reject = {reject}.map(k => k.toLowerCase());\
               const el = Array.from(document.querySelectorAll({selector})).find(node => {{\
                 const text = (node.textContent || '').toLowerCase();\
                 const ok = accept.length === 0 || accept.some(k => text.includes(k));\
                 return ok && !reject.some(k => text.includes(k));\
               }});\
               if (!el) return false;\
               for (const type of ['mousedown', 'mouseup', 'click']) {{\
                 el.dispatchEvent(new MouseEvent(type, {{ bubbles: true }}));\
               }}\
               return true;\
             }})()"
        );
        let value = channel(ctx)?.evaluate_script(&script).await?;
        Ok(script_result(&value))
    }
}

/// Clicks a fixed viewport point. Disabled unless explicitly enabled.
pub struct CoordinateClick;

#[async_trait]
impl ActionStrategy for CoordinateClick {
    fn id(&self) -> &str {
        "coord-click"
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::Activation
    }

    fn priority(&self) -> u32 {
        4
    }

    fn post_delay(&self) -> Duration {
        Duration::from_millis(100)
    }

    fn enabled(&self) -> bool {
        false
    }

    async fn attempt(&self, ctx: &ExecutionContext) -> Result<bool> {
        let Some((x, y)) = ctx.point else {
            return Ok(false);
        };
        click_point(channel(ctx)?.as_ref(), x, y).await?;
        Ok(true)
    }
}

// ---- submission ----

/// Clicks the visible submit control.
pub struct SubmitButton;

#[async_trait]
impl ActionStrategy for SubmitButton {
    fn id(&self) -> &str {
        "submit-button"
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::Submission
    }

    fn priority(&self) -> u32 {
        1
    }

    fn post_delay(&self) -> Duration {
        Duration::from_millis(50)
    }

    async fn attempt(&self, ctx: &ExecutionContext) -> Result<bool> {
        let Some(selector) = ctx.selector.as_deref() else {
            return Ok(false);
        };
        let channel = channel(ctx)?;
        let nodes = channel.query_visible_elements(selector).await?;
        let Some(node) = nodes.first() else {
            return Ok(false);
        };
        let target = EventTarget::Node {
            node_id: node.node_id.clone(),
        };
        channel.dispatch_event(&target, &DomEvent::Click).await?;
        Ok(true)
    }
}

/// Presses Enter in the focused element.
pub struct EnterKey;

#[async_trait]
impl ActionStrategy for EnterKey {
    fn id(&self) -> &str {
        "enter-key"
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::Submission
    }

    fn priority(&self) -> u32 {
        2
    }

    fn post_delay(&self) -> Duration {
        Duration::from_millis(50)
    }

    async fn attempt(&self, ctx: &ExecutionContext) -> Result<bool> {
        press_key(
            channel(ctx)?.as_ref(),
            "Enter",
            "Enter",
            Some("\r"),
            Modifiers::default(),
        )
        .await?;
        Ok(true)
    }
}

/// Submits the form that owns the focused element.
pub struct ScriptSubmit;

#[async_trait]
impl ActionStrategy for ScriptSubmit {
    fn id(&self) -> &str {
        "script-submit"
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::Submission
    }

    fn priority(&self) -> u32 {
        3
    }

    fn post_delay(&self) -> Duration {
        Duration::from_millis(100)
    }

    async fn attempt(&self, ctx: &ExecutionContext) -> Result<bool> {
        let script = "(() => {\
               const el = document.activeElement;\
               const form = el && el.closest('form');\
               if (!form) return false;\
               form.requestSubmit();\
               return true;\
             })()";
        let value = channel(ctx)?.evaluate_script(script).await?;
        Ok(script_result(&value))
    }
}

/// Alt+Enter for hosts that bind submission to it. Disabled unless explicitly enabled.
pub struct AltEnter;

#[async_trait]
impl ActionStrategy for AltEnter {
    fn id(&self) -> &str {
        "alt-enter"
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::Submission
    }

    fn priority(&self) -> u32 {
        4
    }

    fn post_delay(&self) -> Duration {
        Duration::from_millis(50)
    }

    fn enabled(&self) -> bool {
        false
    }

    async fn attempt(&self, ctx: &ExecutionContext) -> Result<bool> {
        let modifiers = Modifiers {
            alt: true,
            ..Modifiers::default()
        };
        press_key(channel(ctx)?.as_ref(), "Enter", "Enter", Some("\r"), modifiers).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::channel::Rect;
    use crate::io::replay::{ReplayChannel, ReplayFrame};
    use crate::strategies::{RegistrySettings, StrategyRegistry};
    use crate::test_support::waiting_frame;

    fn node(id: &str, text: &str) -> ElementNode {
        ElementNode {
            node_id: id.to_string(),
            tag: "button".to_string(),
            text: text.to_string(),
            bounds: Some(Rect {
                x: 0.0,
                y: 0.0,
                width: 20.0,
                height: 10.0,
            }),
        }
    }

    fn keywords(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    async fn channel_with(frame: ReplayFrame) -> Arc<ReplayChannel> {
        let channel = Arc::new(ReplayChannel::new(vec![frame]));
        channel.runtime_snapshot().await.expect("snapshot");
        channel
    }

    fn context(channel: &Arc<ReplayChannel>) -> ExecutionContext {
        ExecutionContext {
            channel: Some(Arc::clone(channel) as Arc<dyn ControlChannel>),
            accept_keywords: keywords(&["accept", "run"]),
            reject_keywords: keywords(&["reject"]),
            ..ExecutionContext::default()
        }
    }

    #[test]
    fn pick_target_honors_accept_and_reject() {
        let nodes = vec![
            node("1", "Reject all"),
            node("2", "Settings"),
            node("3", "Accept and run"),
        ];
        let picked = pick_target(&nodes, &keywords(&["accept"]), &keywords(&["reject"]));
        assert_eq!(picked.map(|n| n.node_id.as_str()), Some("3"));

        let rejected_too = vec![node("1", "Accept or reject")];
        assert!(pick_target(&rejected_too, &keywords(&["accept"]), &keywords(&["reject"])).is_none());

        let any = pick_target(&nodes, &[], &keywords(&["reject"]));
        assert_eq!(any.map(|n| n.node_id.as_str()), Some("2"));
    }

    #[test]
    fn builtin_ids_are_unique_and_register_cleanly() {
        let registry =
            StrategyRegistry::with_builtins(RegistrySettings::default()).expect("builtins");
        let summary = registry.summary();
        assert_eq!(summary.len(), 11);
        let disabled: Vec<&str> = summary
            .iter()
            .filter(|row| !row.enabled)
            .map(|row| row.id.as_str())
            .collect();
        assert_eq!(disabled, vec!["coord-click", "alt-enter"]);
    }

    #[tokio::test]
    async fn key_dispatch_sends_down_and_up_per_char() {
        let channel = channel_with(waiting_frame()).await;
        let mut ctx = context(&channel);
        ctx.text = Some("ok".to_string());
        assert!(KeyDispatch.attempt(&ctx).await.expect("attempt"));
        assert_eq!(channel.dispatched().len(), 4);
    }

    #[tokio::test]
    async fn text_strategies_need_text() {
        let channel = channel_with(waiting_frame()).await;
        let ctx = context(&channel);
        assert!(!KeyDispatch.attempt(&ctx).await.expect("attempt"));
        assert!(!InsertText.attempt(&ctx).await.expect("attempt"));
        assert!(!DomInject.attempt(&ctx).await.expect("attempt"));
        assert!(channel.dispatched().is_empty());
    }

    #[tokio::test]
    async fn dom_inject_escapes_text_as_a_literal() {
        let channel = channel_with(waiting_frame()).await;
        let mut ctx = context(&channel);
        ctx.text = Some("it's \"quoted\"\nnext".to_string());
        assert!(DomInject.attempt(&ctx).await.expect("attempt"));
        let scripts = channel.scripts();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].contains(r#""it's \"quoted\"\nnext""#));
    }

    #[tokio::test]
    async fn selector_click_targets_the_accepted_node() {
        let mut frame = waiting_frame();
        frame.elements.insert(
            "button".to_string(),
            vec![node("deny", "Reject"), node("ok", "Accept")],
        );
        let channel = channel_with(frame).await;
        let mut ctx = context(&channel);
        ctx.selector = Some("button".to_string());

        assert!(SelectorClick.attempt(&ctx).await.expect("attempt"));
        let dispatched = channel.dispatched();
        assert_eq!(
            dispatched[0].target,
            EventTarget::Node {
                node_id: "ok".to_string()
            }
        );
        assert_eq!(dispatched[0].event, DomEvent::Click);
    }

    #[tokio::test]
    async fn pointer_click_uses_the_node_center() {
        let mut frame = waiting_frame();
        frame
            .elements
            .insert("button".to_string(), vec![node("ok", "Run")]);
        let channel = channel_with(frame).await;
        let mut ctx = context(&channel);
        ctx.selector = Some("button".to_string());

        assert!(PointerClick.attempt(&ctx).await.expect("attempt"));
        let dispatched = channel.dispatched();
        assert_eq!(dispatched.len(), 2);
        assert_eq!(dispatched[0].target, EventTarget::Point { x: 10.0, y: 5.0 });
    }

    #[tokio::test]
    async fn activation_without_a_match_reports_false() {
        let channel = channel_with(waiting_frame()).await;
        let mut ctx = context(&channel);
        ctx.selector = Some("button".to_string());
        assert!(!SelectorClick.attempt(&ctx).await.expect("attempt"));
        assert!(!PointerClick.attempt(&ctx).await.expect("attempt"));
    }

    #[tokio::test]
    async fn script_strategies_report_the_script_result() {
        let mut frame = waiting_frame();
        frame.script_result = Some(serde_json::Value::Bool(false));
        let channel = channel_with(frame).await;
        let mut ctx = context(&channel);
        ctx.selector = Some("button".to_string());
        assert!(!ScriptClick.attempt(&ctx).await.expect("attempt"));
        assert!(!ScriptSubmit.attempt(&ctx).await.expect("attempt"));
    }

    #[tokio::test]
    async fn alt_enter_sets_the_alt_modifier() {
        let channel = channel_with(waiting_frame()).await;
        let ctx = context(&channel);
        assert!(AltEnter.attempt(&ctx).await.expect("attempt"));
        let dispatched = channel.dispatched();
        match &dispatched[0].event {
            DomEvent::Key { modifiers, .. } => assert!(modifiers.alt),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
