//! Auto-resume guard: scores a runtime snapshot and decides whether
//! autonomous resumption is safe right now.
//!
//! Two tiers must agree before the loop acts:
//! - a 0-100 coverage score compared against `min_score`;
//! - a binary strict check on the active profile (input surface AND action
//!   control), enforced when `require_strict` is set.
//!
//! Reports are recomputed from the snapshot on every call.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::types::{Confidence, Profile, RuntimeSnapshot};

const PRIMARY_PROFILE_WEIGHT: u8 = 30;
const LIVE_STATUS_WEIGHT: u8 = 20;
const WAITING_FLAG_WEIGHT: u8 = 10;
/// Only a ready third profile lifts the score from 90 to 100.
const TERTIARY_PROFILE_WEIGHT: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardSettings {
    pub min_score: u8,
    pub require_strict: bool,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            min_score: 70,
            require_strict: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileHealth {
    pub ready: bool,
    pub has_input: bool,
    pub has_action_control: bool,
    pub pending: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScoreParts {
    pub profile_a_coverage: u8,
    pub profile_b_coverage: u8,
    pub live_status: u8,
    pub waiting_detection: u8,
    pub tertiary_bonus: u8,
}

impl ScoreParts {
    pub fn total(&self) -> u8 {
        self.profile_a_coverage
            + self.profile_b_coverage
            + self.live_status
            + self.waiting_detection
            + self.tertiary_bonus
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn from_score(score: u8) -> Self {
        match score {
            90.. => Grade::A,
            75..=89 => Grade::B,
            60..=74 => Grade::C,
            40..=59 => Grade::D,
            _ => Grade::F,
        }
    }
}

/// A binary signal the strict check found missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "profile", rename_all = "snake_case")]
pub enum StrictGap {
    NoActiveProfile,
    MissingInput(Profile),
    MissingActionControl(Profile),
}

impl StrictGap {
    /// How many binary signals this gap stands for.
    fn weight(self) -> usize {
        match self {
            StrictGap::NoActiveProfile => 2,
            StrictGap::MissingInput(_) | StrictGap::MissingActionControl(_) => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthBreakdown {
    pub profiles: BTreeMap<Profile, ProfileHealth>,
    pub score_parts: ScoreParts,
    pub score: u8,
    pub grade: Grade,
    pub active_profile: Option<Profile>,
    pub strict_pass: bool,
    pub strict_gaps: Vec<StrictGap>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardReport {
    pub allowed: bool,
    pub score: u8,
    pub min_score: u8,
    pub score_pass: bool,
    pub strict_pass: bool,
    pub require_strict: bool,
    pub reason: String,
    pub reasons: Vec<String>,
    pub suggestions: Vec<String>,
    pub recommended_action: String,
    pub recommended_confidence: Confidence,
    pub health: HealthBreakdown,
}

pub fn evaluate_health(snapshot: &RuntimeSnapshot) -> HealthBreakdown {
    let profiles: BTreeMap<Profile, ProfileHealth> = Profile::ALL
        .into_iter()
        .map(|profile| {
            let coverage = snapshot.coverage(profile);
            let health = ProfileHealth {
                ready: coverage.is_ready(),
                has_input: coverage.has_visible_input,
                has_action_control: coverage.has_action_control(),
                pending: coverage.pending_action_count,
            };
            (profile, health)
        })
        .collect();
    let ready = |profile: Profile| profiles.get(&profile).is_some_and(|health| health.ready);

    let score_parts = ScoreParts {
        profile_a_coverage: if ready(Profile::A) { PRIMARY_PROFILE_WEIGHT } else { 0 },
        profile_b_coverage: if ready(Profile::B) { PRIMARY_PROFILE_WEIGHT } else { 0 },
        live_status: if snapshot.status.is_live() { LIVE_STATUS_WEIGHT } else { 0 },
        waiting_detection: if snapshot.waiting_for_input.is_some() {
            WAITING_FLAG_WEIGHT
        } else {
            0
        },
        tertiary_bonus: if ready(Profile::C) { TERTIARY_PROFILE_WEIGHT } else { 0 },
    };
    let score = score_parts.total();

    let strict_gaps = match snapshot.active_profile {
        None => vec![StrictGap::NoActiveProfile],
        Some(active) => {
            let mut gaps = Vec::new();
            let health = profiles.get(&active).copied();
            if !health.is_some_and(|h| h.has_input) {
                gaps.push(StrictGap::MissingInput(active));
            }
            if !health.is_some_and(|h| h.has_action_control) {
                gaps.push(StrictGap::MissingActionControl(active));
            }
            gaps
        }
    };

    HealthBreakdown {
        strict_pass: strict_gaps.is_empty(),
        profiles,
        score_parts,
        score,
        grade: Grade::from_score(score),
        active_profile: snapshot.active_profile,
        strict_gaps,
    }
}

pub fn evaluate(snapshot: &RuntimeSnapshot, settings: GuardSettings) -> GuardReport {
    let health = evaluate_health(snapshot);
    let min_score = settings.min_score.min(100);
    let score_pass = health.score >= min_score;
    let strict_blocks = settings.require_strict && !health.strict_pass;
    let allowed = score_pass && !strict_blocks;

    let mut reasons = Vec::new();
    let mut suggestions = Vec::new();

    if !score_pass {
        reasons.push(format!(
            "score {} is below minimum {}",
            health.score, min_score
        ));
        suggestions.push(
            "Improve profile coverage signals (open the assistant panels) or lower guard.min_score."
                .to_string(),
        );
    }
    if strict_blocks {
        reasons.push(strict_reason(&health));
        suggestions.extend(health.strict_gaps.iter().map(|gap| gap_suggestion(*gap)));
    }
    if reasons.is_empty() {
        reasons.push("guard conditions satisfied".to_string());
    }
    if suggestions.is_empty() {
        suggestions
            .push("No action needed; auto-resume is permitted under current settings.".to_string());
    }

    let (recommended_action, recommended_confidence) = if allowed {
        (
            "No action needed; auto-resume is currently allowed.".to_string(),
            Confidence::High,
        )
    } else {
        recommend(&health, score_pass, strict_blocks)
    };

    GuardReport {
        allowed,
        score: health.score,
        min_score,
        score_pass,
        strict_pass: health.strict_pass,
        require_strict: settings.require_strict,
        reason: reasons.join("; "),
        reasons,
        suggestions,
        recommended_action,
        recommended_confidence,
        health,
    }
}

fn strict_reason(health: &HealthBreakdown) -> String {
    let Some(active) = health.active_profile else {
        return "strict readiness failed: no active profile".to_string();
    };
    let missing: Vec<&str> = health
        .strict_gaps
        .iter()
        .filter_map(|gap| match gap {
            StrictGap::MissingInput(_) => Some("input surface"),
            StrictGap::MissingActionControl(_) => Some("action control"),
            StrictGap::NoActiveProfile => None,
        })
        .collect();
    format!(
        "strict readiness failed for active profile {}: missing {}",
        active.label(),
        missing.join(" and ")
    )
}

fn gap_suggestion(gap: StrictGap) -> String {
    match gap {
        StrictGap::NoActiveProfile => {
            "No active profile detected; bring a monitored assistant panel to the foreground."
                .to_string()
        }
        StrictGap::MissingInput(profile) => format!(
            "Profile {} text input signal missing; open or focus its chat input.",
            profile.label()
        ),
        StrictGap::MissingActionControl(profile) => format!(
            "Profile {} submit/accept signal missing; expose its send or accept controls.",
            profile.label()
        ),
    }
}

/// Pick the most useful next step. Confidence drops as more binary signals are missing.
fn recommend(health: &HealthBreakdown, score_pass: bool, strict_blocks: bool) -> (String, Confidence) {
    let mut missing = usize::from(!score_pass);
    if strict_blocks {
        missing += health.strict_gaps.iter().map(|gap| gap.weight()).sum::<usize>();
    }
    let confidence = match missing {
        0 | 1 => Confidence::High,
        2 => Confidence::Medium,
        _ => Confidence::Low,
    };

    let action = if strict_blocks {
        match health.strict_gaps.as_slice() {
            [StrictGap::NoActiveProfile, ..] => {
                "Bring a monitored assistant panel to the foreground, then re-check the guard."
                    .to_string()
            }
            [StrictGap::MissingInput(profile), StrictGap::MissingActionControl(_)] => format!(
                "Open profile {}'s panel so its input and controls are visible, then re-check the guard.",
                profile.label()
            ),
            [StrictGap::MissingInput(profile)] => format!(
                "Open or focus profile {}'s chat input, then re-check the guard.",
                profile.label()
            ),
            [StrictGap::MissingActionControl(profile)] => format!(
                "Expose profile {}'s send/accept controls (or pending action buttons), then re-check the guard.",
                profile.label()
            ),
            _ => "Inspect the guard report for remaining strict blockers.".to_string(),
        }
    } else {
        let weakest = [Profile::A, Profile::B]
            .into_iter()
            .find(|profile| !health.profiles.get(profile).is_some_and(|h| h.ready));
        match weakest {
            Some(profile) => format!(
                "Open profile {}'s panel to raise coverage, or lower guard.min_score temporarily.",
                profile.label()
            ),
            None => "Lower guard.min_score temporarily or restore the waiting/status signals."
                .to_string(),
        }
    };

    (action, confidence)
}
