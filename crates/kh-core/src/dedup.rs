//! Age-compacted seen-id maps.
//!
//! Two instances back the pipeline: one over wrap event ids (suppressing
//! redundant decrypt work) and one over inner request ids (suppressing
//! replay). Compaction runs on a timer and drops entries older than the
//! caller's cutoff.

use std::collections::HashMap;

/// Map of id to the event `created_at` it was first seen with.
#[derive(Debug, Default)]
pub struct SeenMap {
    seen: HashMap<String, i64>,
}

impl SeenMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id`. Returns true when the id was already present.
    ///
    /// Insertion is unconditional so that the recorded timestamp always
    /// reflects the most recent sighting.
    pub fn check_and_insert(&mut self, id: &str, created_at: i64) -> bool {
        self.seen.insert(id.to_string(), created_at).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains_key(id)
    }

    /// Drop entries with `created_at` older than `cutoff`.
    pub fn compact(&mut self, cutoff: i64) {
        self.seen.retain(|_, ts| *ts >= cutoff);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_insert_is_new() {
        let mut m = SeenMap::new();
        assert!(!m.check_and_insert("a", 100));
        assert!(m.check_and_insert("a", 101));
        assert!(m.contains("a"));
    }

    #[test]
    fn test_compact_drops_old_entries() {
        let mut m = SeenMap::new();
        m.check_and_insert("old", 100);
        m.check_and_insert("new", 200);
        m.compact(150);
        assert!(!m.contains("old"));
        assert!(m.contains("new"));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_compact_keeps_entries_at_cutoff() {
        let mut m = SeenMap::new();
        m.check_and_insert("edge", 150);
        m.compact(150);
        assert!(m.contains("edge"));
    }

    #[test]
    fn test_reinsert_after_compaction_is_new() {
        let mut m = SeenMap::new();
        m.check_and_insert("a", 100);
        m.compact(150);
        assert!(!m.check_and_insert("a", 200));
    }
}
