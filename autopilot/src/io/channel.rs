//! Control channel to the host runtime.
//!
//! Everything the autopilot reads or does to the host goes through
//! [`ControlChannel`]. Implementations own the transport; the loop only sees
//! element queries, dispatched events, script evaluation and snapshots.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::types::RuntimeSnapshot;

/// Element bounds in viewport coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// A visible element returned by [`ControlChannel::query_visible_elements`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementNode {
    pub node_id: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Rect>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventTarget {
    /// Whatever currently holds focus.
    Focused,
    Node { node_id: String },
    Point { x: f64, y: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPhase {
    Down,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MousePhase {
    Pressed,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Modifiers {
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub shift: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomEvent {
    Key {
        phase: KeyPhase,
        key: String,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default)]
        modifiers: Modifiers,
    },
    Mouse {
        phase: MousePhase,
        click_count: u32,
    },
    Click,
    InsertText {
        text: String,
    },
}

impl DomEvent {
    pub fn key(phase: KeyPhase, key: &str, code: &str, text: Option<&str>) -> Self {
        Self::Key {
            phase,
            key: key.to_string(),
            code: code.to_string(),
            text: text.map(str::to_string),
            modifiers: Modifiers::default(),
        }
    }
}

#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Whether the transport is currently attached.
    fn is_connected(&self) -> bool {
        true
    }

    async fn query_visible_elements(&self, selector: &str) -> Result<Vec<ElementNode>>;

    async fn dispatch_event(&self, target: &EventTarget, event: &DomEvent) -> Result<()>;

    async fn evaluate_script(&self, script: &str) -> Result<serde_json::Value>;

    async fn runtime_snapshot(&self) -> Result<RuntimeSnapshot>;

    /// Latest assistant output text, if the host exposes any.
    async fn latest_output(&self) -> Result<Option<String>>;
}

#[async_trait]
impl<C: ControlChannel + ?Sized> ControlChannel for Arc<C> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    async fn query_visible_elements(&self, selector: &str) -> Result<Vec<ElementNode>> {
        (**self).query_visible_elements(selector).await
    }

    async fn dispatch_event(&self, target: &EventTarget, event: &DomEvent) -> Result<()> {
        (**self).dispatch_event(target, event).await
    }

    async fn evaluate_script(&self, script: &str) -> Result<serde_json::Value> {
        (**self).evaluate_script(script).await
    }

    async fn runtime_snapshot(&self) -> Result<RuntimeSnapshot> {
        (**self).runtime_snapshot().await
    }

    async fn latest_output(&self) -> Result<Option<String>> {
        (**self).latest_output().await
    }
}
