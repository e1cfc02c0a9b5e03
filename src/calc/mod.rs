//! # Calculator Collaborator
//!
//! The scheduler treats the text-parsing engine as an external collaborator
//! behind the [`Calculator`] trait: `parse` turns one line of text into a
//! [`CalcValue`] against the currently bound constants, `add` folds section
//! totals, and `format` renders a value for display.
//!
//! A value may be tagged as an assignment (`ident = expr`), in which case it
//! binds a constant instead of contributing to the section total. Parse
//! failures surface as [`CalcValue::Error`] so the UI can render them like
//! any other result.
//!
//! [`SimpleCalculator`] is the bundled reference implementation: a nom
//! tokenizer plus a small expression grammar with unit-aware arithmetic.

pub mod simple;
pub mod tokenizer;
pub mod units;

pub use simple::{SimpleCalculator, SimpleCalculatorFactory};
pub use units::UnitTable;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier → bound value, visible to subsequent lines of one section.
pub type ConstantsMap = HashMap<String, CalcValue>;

/// A magnitude with an optional unit symbol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub magnitude: f64,
    pub unit: Option<String>,
}

impl Quantity {
    pub fn new(magnitude: f64, unit: Option<String>) -> Self {
        Self { magnitude, unit }
    }

    pub fn unitless(magnitude: f64) -> Self {
        Self {
            magnitude,
            unit: None,
        }
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.unit {
            Some(unit) => write!(f, "{} {}", self.magnitude, unit),
            None => write!(f, "{}", self.magnitude),
        }
    }
}

// 計算結果の型
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CalcValue {
    Number(Quantity),
    Assignment {
        identifier: String,
        value: Box<CalcValue>,
    },
    Error(String),
}

impl CalcValue {
    pub fn number(magnitude: f64) -> Self {
        Self::Number(Quantity::unitless(magnitude))
    }

    pub fn quantity(magnitude: f64, unit: impl Into<String>) -> Self {
        Self::Number(Quantity::new(magnitude, Some(unit.into())))
    }

    pub fn assignment(identifier: impl Into<String>, value: CalcValue) -> Self {
        Self::Assignment {
            identifier: identifier.into(),
            value: Box::new(value),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn as_assignment(&self) -> Option<(&str, &CalcValue)> {
        match self {
            Self::Assignment { identifier, value } => Some((identifier.as_str(), value)),
            _ => None,
        }
    }

    pub fn is_assignment(&self) -> bool {
        matches!(self, Self::Assignment { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl std::fmt::Display for CalcValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(quantity) => write!(f, "{}", quantity),
            Self::Assignment { identifier, value } => write!(f, "{} = {}", identifier, value),
            Self::Error(message) => write!(f, "error: {}", message),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalcError {
    #[error("Parse error in '{input}': {message}")]
    Parse { input: String, message: String },

    #[error("Unknown identifier: {identifier}")]
    UnknownIdentifier { identifier: String },

    #[error("Incompatible units: {left} and {right}")]
    IncompatibleUnits { left: String, right: String },

    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    #[error("Division by zero")]
    DivisionByZero,
}

pub type CalcResult<T> = Result<T, CalcError>;

/// External parsing engine contract.
///
/// Implementations must be deterministic for a given `(input, constants)`
/// pair; the cache relies on identical text reproducing identical values.
pub trait Calculator: Send + Sync {
    /// Parses one line of text against the currently bound constants.
    fn parse(&self, input: &str, constants: &ConstantsMap) -> CalcResult<CalcValue>;

    /// Adds two values, used to fold the section total.
    fn add(&self, left: &CalcValue, right: &CalcValue) -> CalcResult<CalcValue>;

    /// Renders a value for display.
    fn format(&self, value: &CalcValue) -> String;
}

/// Builds per-section calculator instances against a unit table.
///
/// Instances are cached per section and rebuilt after a global
/// invalidation, so a table change takes effect on re-evaluation.
pub trait CalculatorFactory: Send + Sync {
    fn instance(&self, units: &UnitTable) -> Arc<dyn Calculator>;
}
