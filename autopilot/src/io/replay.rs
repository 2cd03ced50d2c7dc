//! Replay channel driven by recorded JSONL frames.
//!
//! Each line of a replay file is one [`ReplayFrame`]. Every
//! `runtime_snapshot` call advances to the next frame; element queries,
//! output and script results answer from the current frame. Dispatched
//! events and evaluated scripts are recorded for inspection.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::RuntimeSnapshot;
use crate::io::channel::{ControlChannel, DomEvent, ElementNode, EventTarget};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayFrame {
    pub snapshot: RuntimeSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Visible elements keyed by the selector that finds them.
    pub elements: BTreeMap<String, Vec<ElementNode>>,
    /// Value returned by script evaluation. Missing means `true`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_result: Option<serde_json::Value>,
    /// When set, reading this frame's snapshot fails with this message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub disconnected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    /// Zero-based frame index the event was dispatched against.
    pub frame: usize,
    pub target: EventTarget,
    pub event: DomEvent,
}

#[derive(Debug, Default)]
struct ReplayState {
    /// Number of frames consumed so far.
    consumed: usize,
    dispatched: Vec<DispatchRecord>,
    scripts: Vec<String>,
}

#[derive(Debug)]
pub struct ReplayChannel {
    frames: Vec<ReplayFrame>,
    state: Mutex<ReplayState>,
}

impl ReplayChannel {
    pub fn new(frames: Vec<ReplayFrame>) -> Self {
        Self {
            frames,
            state: Mutex::new(ReplayState::default()),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Ok(Self::new(load_frames(path)?))
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn dispatched(&self) -> Vec<DispatchRecord> {
        self.state()
            .map(|state| state.dispatched.clone())
            .unwrap_or_default()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.state()
            .map(|state| state.scripts.clone())
            .unwrap_or_default()
    }

    fn state(&self) -> Result<MutexGuard<'_, ReplayState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("replay state lock poisoned"))
    }

    fn current_index(state: &ReplayState) -> usize {
        state.consumed.saturating_sub(1)
    }

    fn current(&self) -> Result<(usize, &ReplayFrame)> {
        let index = Self::current_index(&*self.state()?);
        let frame = self
            .frames
            .get(index)
            .ok_or_else(|| anyhow!("replay has no frames"))?;
        Ok((index, frame))
    }
}

#[async_trait]
impl ControlChannel for ReplayChannel {
    fn is_connected(&self) -> bool {
        self.current()
            .map(|(_, frame)| !frame.disconnected)
            .unwrap_or(false)
    }

    async fn query_visible_elements(&self, selector: &str) -> Result<Vec<ElementNode>> {
        let (_, frame) = self.current()?;
        Ok(frame.elements.get(selector).cloned().unwrap_or_default())
    }

    async fn dispatch_event(&self, target: &EventTarget, event: &DomEvent) -> Result<()> {
        let (_, frame) = self.current()?;
        if frame.disconnected {
            bail!("control channel disconnected");
        }
        let mut state = self.state()?;
        let index = Self::current_index(&state);
        debug!(frame = index, ?target, ?event, "replay dispatch");
        state.dispatched.push(DispatchRecord {
            frame: index,
            target: target.clone(),
            event: event.clone(),
        });
        Ok(())
    }

    async fn evaluate_script(&self, script: &str) -> Result<serde_json::Value> {
        let (_, frame) = self.current()?;
        if frame.disconnected {
            bail!("control channel disconnected");
        }
        let result = frame
            .script_result
            .clone()
            .unwrap_or(serde_json::Value::Bool(true));
        self.state()?.scripts.push(script.to_string());
        Ok(result)
    }

    async fn runtime_snapshot(&self) -> Result<RuntimeSnapshot> {
        let index = {
            let mut state = self.state()?;
            if state.consumed >= self.frames.len() {
                bail!("replay exhausted after {} frames", self.frames.len());
            }
            state.consumed += 1;
            state.consumed - 1
        };
        let frame = &self.frames[index];
        if let Some(message) = &frame.error {
            bail!("{message}");
        }
        Ok(frame.snapshot.clone())
    }

    async fn latest_output(&self) -> Result<Option<String>> {
        let (_, frame) = self.current()?;
        Ok(frame.output.clone())
    }
}

/// Parse a JSONL replay file. Blank lines are skipped.
pub fn load_frames(path: &Path) -> Result<Vec<ReplayFrame>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut frames = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let frame: ReplayFrame = serde_json::from_str(line)
            .with_context(|| format!("parse {}:{}", path.display(), index + 1))?;
        frames.push(frame);
    }
    if frames.is_empty() {
        bail!("replay file {} has no frames", path.display());
    }
    Ok(frames)
}
