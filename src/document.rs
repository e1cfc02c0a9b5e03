//! # Document Tracking
//!
//! Turns successive whole-document snapshots into the minimal set of
//! scheduler commands. Only sections whose text actually differs are
//! touched; a unit table change invalidates every cached section before
//! any section commands go out, so nothing is evaluated against stale
//! rates.

use std::collections::HashMap;

use tracing::debug;

use crate::calc::UnitTable;
use crate::scheduler::{Scheduler, SchedulerResult};
use crate::section::SectionId;

/// One snapshot of a document: each section's input lines plus the
/// document-wide unit table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentState {
    pub sections: HashMap<SectionId, Vec<String>>,
    pub units: UnitTable,
}

impl DocumentState {
    pub fn with_section(mut self, section_id: impl Into<SectionId>, lines: &[&str]) -> Self {
        self.sections.insert(
            section_id.into(),
            lines.iter().map(|line| line.to_string()).collect(),
        );
        self
    }

    pub fn with_units(mut self, units: UnitTable) -> Self {
        self.units = units;
        self
    }
}

/// Sections whose text differs between two snapshots. Each list is sorted
/// by section id so downstream command order is deterministic.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SectionDiff {
    pub added: Vec<SectionId>,
    pub changed: Vec<SectionId>,
    pub removed: Vec<SectionId>,
}

impl SectionDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

pub fn diff_sections(
    previous: &HashMap<SectionId, Vec<String>>,
    next: &HashMap<SectionId, Vec<String>>,
) -> SectionDiff {
    // 同じマップなら比較せずに済ませる
    if std::ptr::eq(previous, next) {
        return SectionDiff::default();
    }

    let mut diff = SectionDiff::default();
    for (section_id, inputs) in next {
        match previous.get(section_id) {
            None => diff.added.push(section_id.clone()),
            Some(previous_inputs) if previous_inputs != inputs => {
                diff.changed.push(section_id.clone())
            }
            Some(_) => {}
        }
    }
    for section_id in previous.keys() {
        if !next.contains_key(section_id) {
            diff.removed.push(section_id.clone());
        }
    }

    diff.added.sort();
    diff.changed.sort();
    diff.removed.sort();
    diff
}

/// Feeds a [`Scheduler`] from document snapshots, remembering the last
/// applied one.
#[derive(Debug, Default)]
pub struct DocumentTracker {
    previous: DocumentState,
}

impl DocumentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previous(&self) -> &DocumentState {
        &self.previous
    }

    /// Applies one snapshot: a unit change first invalidates all cached
    /// sections, then removed sections are unloaded and added or changed
    /// ones loaded. Returns the section diff that was applied.
    pub fn apply(
        &mut self,
        scheduler: &Scheduler,
        next: DocumentState,
    ) -> SchedulerResult<SectionDiff> {
        if next.units != self.previous.units {
            debug!("Unit table changed, invalidating cached sections");
            scheduler.invalidate_all(next.units.clone())?;
        }

        let diff = diff_sections(&self.previous.sections, &next.sections);
        for section_id in &diff.removed {
            scheduler.unload(section_id.clone())?;
        }
        for section_id in diff.added.iter().chain(&diff.changed) {
            let inputs = next.sections.get(section_id).cloned().unwrap_or_default();
            scheduler.load(section_id.clone(), inputs)?;
        }

        self.previous = next;
        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sections(entries: &[(&str, &[&str])]) -> HashMap<SectionId, Vec<String>> {
        entries
            .iter()
            .map(|(section_id, lines)| {
                (
                    SectionId::from(*section_id),
                    lines.iter().map(|line| line.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_diff_added_changed_removed() {
        let previous = sections(&[("a", &["1"]), ("b", &["2"]), ("c", &["3"])]);
        let next = sections(&[("a", &["1"]), ("b", &["2 + 2"]), ("d", &["4"])]);

        let diff = diff_sections(&previous, &next);
        assert_eq!(diff.added, vec![SectionId::from("d")]);
        assert_eq!(diff.changed, vec![SectionId::from("b")]);
        assert_eq!(diff.removed, vec![SectionId::from("c")]);
    }

    #[test]
    fn test_diff_unchanged_sections_are_skipped() {
        let previous = sections(&[("a", &["x = 1"])]);
        let next = previous.clone();
        assert!(diff_sections(&previous, &next).is_empty());
    }

    #[test]
    fn test_diff_identity_shortcut() {
        let snapshot = sections(&[("a", &["1"])]);
        assert!(diff_sections(&snapshot, &snapshot).is_empty());
    }

    #[test]
    fn test_diff_lists_are_sorted() {
        let previous = sections(&[]);
        let next = sections(&[("c", &["1"]), ("a", &["2"]), ("b", &["3"])]);

        let diff = diff_sections(&previous, &next);
        assert_eq!(
            diff.added,
            vec![
                SectionId::from("a"),
                SectionId::from("b"),
                SectionId::from("c")
            ]
        );
    }

    #[test]
    fn test_document_state_builder() {
        let state = DocumentState::default()
            .with_section("s1", &["1 + 1"])
            .with_units(UnitTable::new().with_rate("USD", 1.0));
        assert_eq!(state.sections.len(), 1);
        assert!(state.units.contains("USD"));
    }

    #[test]
    fn test_tracker_starts_from_an_empty_snapshot() {
        let tracker = DocumentTracker::new();
        assert!(tracker.previous().sections.is_empty());
        assert!(tracker.previous().units.is_empty());
    }
}
