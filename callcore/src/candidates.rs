//! Reader-side deduplication of relayed ICE candidates.
//!
//! The relay never deduplicates: candidate lists only grow, and a reader may
//! see the same snapshot (or an older prefix of it) many times. Each endpoint
//! keeps a set of candidates it has already applied, keyed by content, and
//! only hands new entries to its peer connection.

use std::collections::HashSet;

use crate::types::IceCandidate;

#[derive(Debug, Default, Clone)]
pub struct CandidateTracker {
    applied: HashSet<IceCandidate>,
}

impl CandidateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries of `list` not yet applied, in list order, without duplicates.
    ///
    /// Nothing is recorded; call [`mark_applied`](Self::mark_applied) once a
    /// candidate has actually been handed to the peer connection.
    pub fn fresh<'a>(&self, list: &'a [IceCandidate]) -> Vec<&'a IceCandidate> {
        let mut in_batch = HashSet::new();
        list.iter()
            .filter(|c| !self.applied.contains(*c) && in_batch.insert(*c))
            .collect()
    }

    /// Record a candidate as applied. Returns `false` if it already was.
    pub fn mark_applied(&mut self, candidate: &IceCandidate) -> bool {
        self.applied.insert(candidate.clone())
    }

    pub fn len(&self) -> usize {
        self.applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<IceCandidate> {
        items.iter().map(|s| IceCandidate::from(*s)).collect()
    }

    fn apply_all(tracker: &mut CandidateTracker, list: &[IceCandidate]) -> Vec<String> {
        let fresh: Vec<IceCandidate> = tracker.fresh(list).into_iter().cloned().collect();
        for c in &fresh {
            tracker.mark_applied(c);
        }
        fresh.into_iter().map(IceCandidate::into_inner).collect()
    }

    #[test]
    fn test_reapplying_same_snapshot_applies_nothing() {
        let mut tracker = CandidateTracker::new();
        let snapshot = list(&["candidate:1", "candidate:2"]);

        assert_eq!(
            apply_all(&mut tracker, &snapshot),
            vec!["candidate:1", "candidate:2"]
        );
        assert!(apply_all(&mut tracker, &snapshot).is_empty());
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_growing_list_yields_only_the_tail() {
        let mut tracker = CandidateTracker::new();
        apply_all(&mut tracker, &list(&["candidate:1"]));

        let grown = list(&["candidate:1", "candidate:2", "candidate:3"]);
        assert_eq!(
            apply_all(&mut tracker, &grown),
            vec!["candidate:2", "candidate:3"]
        );
    }

    #[test]
    fn test_duplicate_entries_within_a_list_are_applied_once() {
        let mut tracker = CandidateTracker::new();
        let dup = list(&["candidate:1", "candidate:1", "candidate:2"]);

        assert_eq!(
            apply_all(&mut tracker, &dup),
            vec!["candidate:1", "candidate:2"]
        );
    }

    #[test]
    fn test_fresh_does_not_record() {
        let tracker = CandidateTracker::new();
        let snapshot = list(&["candidate:1"]);

        assert_eq!(tracker.fresh(&snapshot).len(), 1);
        assert_eq!(tracker.fresh(&snapshot).len(), 1);
        assert!(tracker.is_empty());
    }
}
