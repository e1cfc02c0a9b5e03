//! Shared data model for sections and their evaluation results.

use serde::{Deserialize, Serialize};

use crate::calc::CalcValue;

/// Opaque, externally-assigned section identifier.
///
/// The scheduler never creates these; it only needs stable equality and,
/// for deterministic re-queue order, a total order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SectionId(String);

impl SectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<String> for SectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for SectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Evaluated outcome of a single line.
///
/// `value` is `None` when the line's assignment duplicated an earlier
/// identifier in the same section; the original parse then lives in
/// `shadowed_assignment` so an unchanged line stays cache-matchable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineResult {
    pub input: String,
    pub value: Option<CalcValue>,
    pub shadowed_assignment: Option<CalcValue>,
}

impl LineResult {
    pub fn new(input: impl Into<String>, value: Option<CalcValue>) -> Self {
        Self {
            input: input.into(),
            value,
            shadowed_assignment: None,
        }
    }

    /// The value as originally parsed, looking through shadowing.
    pub fn original_value(&self) -> Option<&CalcValue> {
        self.shadowed_assignment.as_ref().or(self.value.as_ref())
    }

    /// True when the effective (non-shadowed) value is an assignment.
    pub fn is_assignment(&self) -> bool {
        matches!(self.value, Some(CalcValue::Assignment { .. }))
    }
}

/// Section total produced by a stable pass.
///
/// An empty total (no summable values in the section) keeps `value` as
/// `None` and `formatted` empty, which renders as conspicuously blank.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SectionTotal {
    pub value: Option<CalcValue>,
    pub formatted: String,
}

impl SectionTotal {
    pub fn new(value: CalcValue, formatted: impl Into<String>) -> Self {
        Self {
            value: Some(value),
            formatted: formatted.into(),
        }
    }

    pub fn empty() -> Self {
        Self {
            value: None,
            formatted: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }
}

impl Default for SectionTotal {
    fn default() -> Self {
        Self::empty()
    }
}

/// Recovers the input lines a result list was evaluated from, used to
/// re-queue a section after global invalidation.
pub fn recover_inputs(results: &[LineResult]) -> Vec<String> {
    results.iter().map(|result| result.input.clone()).collect()
}
