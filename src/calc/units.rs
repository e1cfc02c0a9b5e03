//! Unit and currency conversion table.
//!
//! This is the shared global configuration of the scheduler: replacing it
//! invalidates every cached section, because cached values may embed
//! conversions computed against the old rates.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Symbol → rate relative to an implicit base unit.
///
/// A rate of `r` means one of that unit equals `r` base units, so
/// converting between two known symbols goes through the base.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UnitTable {
    #[serde(default)]
    rates: HashMap<String, f64>,
}

impl UnitTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, symbol: impl Into<String>, rate: f64) -> Self {
        self.rates.insert(symbol.into(), rate);
        self
    }

    pub fn set_rate(&mut self, symbol: impl Into<String>, rate: f64) {
        self.rates.insert(symbol.into(), rate);
    }

    pub fn rate(&self, symbol: &str) -> Option<f64> {
        self.rates.get(symbol).copied()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.rates.contains_key(symbol)
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    /// Converts a magnitude between two known symbols through the base
    /// rate. Returns `None` if either symbol is unknown or the target
    /// rate is zero.
    pub fn convert(&self, magnitude: f64, from: &str, to: &str) -> Option<f64> {
        if from == to {
            return Some(magnitude);
        }
        let from_rate = self.rate(from)?;
        let to_rate = self.rate(to)?;
        if to_rate == 0.0 {
            return None;
        }
        Some(magnitude * from_rate / to_rate)
    }
}
