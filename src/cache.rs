//! Per-section evaluation cache.
//!
//! One entry per section, created on the first completed evaluation and
//! refreshed in place afterwards. Entries hold only *completed* results;
//! partial progress lives in the active fiber. The worker task is the sole
//! owner, so a plain map suffices.

use std::collections::HashMap;
use std::sync::Arc;

use crate::calc::{Calculator, ConstantsMap};
use crate::section::{LineResult, SectionId};

pub(crate) struct SectionEntry {
    pub results: Vec<LineResult>,
    pub constants: ConstantsMap,
    /// Parser instance bound to the unit table it was built against.
    pub calculator: Arc<dyn Calculator>,
}

#[derive(Default)]
pub(crate) struct EvaluationCache {
    entries: HashMap<SectionId, SectionEntry>,
}

impl EvaluationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, section_id: &SectionId) -> Option<&SectionEntry> {
        self.entries.get(section_id)
    }

    pub fn insert(&mut self, section_id: SectionId, entry: SectionEntry) {
        self.entries.insert(section_id, entry);
    }

    pub fn remove(&mut self, section_id: &SectionId) -> Option<SectionEntry> {
        self.entries.remove(section_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Empties the cache, returning entries in sorted id order so
    /// re-queueing after a global invalidation is deterministic.
    pub fn drain_sorted(&mut self) -> Vec<(SectionId, SectionEntry)> {
        let mut drained: Vec<_> = self.entries.drain().collect();
        drained.sort_by(|(a, _), (b, _)| a.cmp(b));
        drained
    }
}
