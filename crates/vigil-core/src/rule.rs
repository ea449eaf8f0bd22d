//! Notification rules evaluated against recognition results.
//!
//! Rules are loaded from TOML:
//!
//! ```toml
//! [[rule]]
//! name = "stranger"
//! unknown = true
//! count = { op = "ge", value = 1 }
//! ```

use crate::notifier::{Level, Notification};
use crate::recognizer::Recognition;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("cannot read rules file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid rules: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparison {
    /// `actual <op> expected`.
    pub fn holds(self, actual: usize, expected: usize) -> bool {
        match self {
            Comparison::Eq => actual == expected,
            Comparison::Gt => actual > expected,
            Comparison::Ge => actual >= expected,
            Comparison::Lt => actual < expected,
            Comparison::Le => actual <= expected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountCondition {
    pub op: Comparison,
    pub value: usize,
}

impl Default for CountCondition {
    fn default() -> Self {
        Self {
            op: Comparison::Ge,
            value: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    /// Only count findings with this flag; `None` counts every finding.
    #[serde(default)]
    pub unknown: Option<bool>,
    #[serde(default)]
    pub count: CountCondition,
}

impl Rule {
    /// Number of findings this rule looks at.
    pub fn matching_count(&self, recognition: &Recognition) -> usize {
        recognition
            .findings
            .iter()
            .filter(|f| self.unknown.map_or(true, |unknown| f.unknown == unknown))
            .count()
    }

    /// The notification to send for `recognition`, if the rule fires.
    pub fn evaluate(&self, recognition: &Recognition) -> Option<Notification> {
        let count = self.matching_count(recognition);
        if !self.count.op.holds(count, self.count.value) {
            return None;
        }
        Some(Notification::new(Level::Warning, describe(count, self.unknown)))
    }
}

fn describe(count: usize, unknown: Option<bool>) -> String {
    let noun = if count == 1 { "person" } else { "people" };
    match unknown {
        Some(true) => format!("{count} unknown {noun} detected"),
        Some(false) => format!("{count} known {noun} detected"),
        None => format!("{count} {noun} detected"),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default, rename = "rule")]
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn from_toml(src: &str) -> Result<Self, RuleError> {
        Ok(toml::from_str(src)?)
    }

    pub fn load(path: &Path) -> Result<Self, RuleError> {
        let src = std::fs::read_to_string(path).map_err(|source| RuleError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let rules = Self::from_toml(&src)?;
        tracing::info!(path = %path.display(), rules = rules.rules.len(), "loaded rules");
        Ok(rules)
    }

    /// Notifications for every rule that fires, in rule order.
    pub fn evaluate(&self, recognition: &Recognition) -> Vec<(String, Notification)> {
        self.rules
            .iter()
            .filter_map(|rule| rule.evaluate(recognition).map(|n| (rule.name.clone(), n)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
