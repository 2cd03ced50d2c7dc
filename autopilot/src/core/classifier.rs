//! Injectable free-text classifiers.
//!
//! Detectors only see the number of matched signals, never the wording, so the
//! phrase tables can be swapped without touching control-loop logic.

use anyhow::{Context, Result};
use regex::RegexSet;

/// Labels of the signals a classifier found in a piece of text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signals {
    pub matched: Vec<String>,
}

impl Signals {
    pub fn count(&self) -> usize {
        self.matched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matched.is_empty()
    }
}

pub trait TextClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Signals;
}

impl<F> TextClassifier for F
where
    F: Fn(&str) -> Signals + Send + Sync,
{
    fn classify(&self, text: &str) -> Signals {
        self(text)
    }
}

/// Case-insensitive regex set; each pattern that matches counts as one signal.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    name: String,
    set: RegexSet,
}

impl PatternClassifier {
    pub fn new(name: &str, patterns: &[&str]) -> Result<Self> {
        let set = RegexSet::new(patterns.iter().map(|pattern| format!("(?i){pattern}")))
            .with_context(|| format!("compile {name} patterns"))?;
        Ok(Self {
            name: name.to_string(),
            set,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl TextClassifier for PatternClassifier {
    fn classify(&self, text: &str) -> Signals {
        Signals {
            matched: self
                .set
                .matches(text)
                .into_iter()
                .map(|index| self.set.patterns()[index].clone())
                .collect(),
        }
    }
}

const COMPLETION: &[&str] = &[
    r"all\s+tasks?\s+(are\s+)?(complete|completed|done)",
    r"goal\s+(has\s+been\s+)?achieved",
    r"implementation\s+(is\s+)?complete",
    r"nothing\s+(left|remaining)\s+to\s+do",
    r"no\s+(more|remaining)\s+tasks?",
];

const ACTIVE_WORK: &[&str] = &[
    r"working\s+on",
    r"\bnext\s+(task|step)",
    r"\bcontinu(e|ing)\b",
    r"\bin\s+progress\b",
    r"\bpending\b",
];

const UNCERTAINTY: &[&str] = &[
    r"\bprobably\b",
    r"\bmaybe\b",
    r"(seems|likely|might\s+be)\s+(done|complete)",
];

const TEST_ACTIVITY: &[&str] = &[
    r"running\s+(the\s+)?(unit\s+)?tests?",
    r"\d+\s+tests?\s+(passed|passing)",
    r"all\s+tests?\s+pass",
    r"test\s+suite",
    r"coverage\s+report",
    r"no\s+changes?\s+(needed|required)",
];

const FEATURE_WORK: &[&str] = &[
    r"creat(ed|ing)\s+(a\s+)?(new\s+)?file",
    r"implement(ed|ing)\b",
    r"refactor(ed|ing)\b",
    r"fix(ed|ing)\s+(the\s+)?(bug|issue|error)",
    r"(added|adding)\s+\w+",
    r"(updated|updating|modified|modifying)\s+\w+",
];

/// Default classifier set used when the caller does not inject its own.
pub struct DefaultClassifiers {
    pub completion: PatternClassifier,
    pub active_work: PatternClassifier,
    pub uncertainty: PatternClassifier,
    pub test_activity: PatternClassifier,
    pub feature_work: PatternClassifier,
}

impl DefaultClassifiers {
    pub fn new() -> Result<Self> {
        Ok(Self {
            completion: PatternClassifier::new("completion", COMPLETION)?,
            active_work: PatternClassifier::new("active-work", ACTIVE_WORK)?,
            uncertainty: PatternClassifier::new("uncertainty", UNCERTAINTY)?,
            test_activity: PatternClassifier::new("test-activity", TEST_ACTIVITY)?,
            feature_work: PatternClassifier::new("feature-work", FEATURE_WORK)?,
        })
    }
}
