//! Bookkeeping of which revision content has already been submitted.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::revision::Revision;

/// What the monitor should do with a discovered revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// New identity or new content.
    Run,
    /// Same commits as the last submission.
    AlreadyTested,
    /// An earlier submission for this identity is still running.
    InFlight,
}

#[derive(Debug)]
struct Entry {
    revision: Revision,
    in_flight: Arc<AtomicBool>,
}

/// Last submitted revision per identity.
///
/// Owned by one monitor's poll loop; runs only ever see an [`InFlightGuard`].
#[derive(Debug, Default)]
pub struct TestedSet {
    entries: HashMap<String, Entry>,
}

impl TestedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decide(&self, revision: &Revision) -> ScheduleDecision {
        match self.entries.get(&revision.id()) {
            None => ScheduleDecision::Run,
            Some(entry) if entry.revision.same_content(revision) => ScheduleDecision::AlreadyTested,
            Some(entry) if entry.in_flight.load(Ordering::SeqCst) => ScheduleDecision::InFlight,
            Some(_) => ScheduleDecision::Run,
        }
    }

    /// Records `revision` as submitted and marks it in flight until the
    /// returned guard is dropped.
    pub fn record(&mut self, revision: Revision) -> InFlightGuard {
        let in_flight = Arc::new(AtomicBool::new(true));
        self.entries.insert(
            revision.id(),
            Entry {
                revision,
                in_flight: Arc::clone(&in_flight),
            },
        );
        InFlightGuard { in_flight }
    }

    /// Drops the entry for `id` so the next cycle retries it.
    pub fn forget(&mut self, id: &str) {
        self.entries.remove(id);
    }

    /// Evicts every identity not in `live`.
    pub fn retain_live(&mut self, live: &HashSet<String>) {
        self.entries.retain(|id, _| {
            let keep = live.contains(id);
            if !keep {
                tracing::debug!(revision = %id, "evicting closed revision");
            }
            keep
        });
    }

    pub fn get(&self, id: &str) -> Option<&Revision> {
        self.entries.get(id).map(|entry| &entry.revision)
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .is_some_and(|entry| entry.in_flight.load(Ordering::SeqCst))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Clears the in-flight flag of one submission when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicBool>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::{ChangeRequest, ChangeState, Commit};
    use chrono::{TimeZone, Utc};

    fn cr(number: u64, hashes: &[&str]) -> Revision {
        let commits = hashes
            .iter()
            .map(|h| Commit::new(*h, Utc.timestamp_opt(1, 0).unwrap()))
            .collect();
        Revision::ChangeRequest(ChangeRequest::new(
            number,
            commits,
            "alice",
            true,
            ChangeState::Open,
            "master",
        ))
    }

    #[test]
    fn unknown_identity_runs() {
        let set = TestedSet::new();

        assert_eq!(set.decide(&cr(7, &["c1"])), ScheduleDecision::Run);
    }

    #[test]
    fn same_content_is_already_tested_even_in_flight() {
        let mut set = TestedSet::new();
        let _guard = set.record(cr(7, &["c1"]));

        assert_eq!(set.decide(&cr(7, &["c1"])), ScheduleDecision::AlreadyTested);
    }

    #[test]
    fn new_content_waits_for_in_flight_run() {
        let mut set = TestedSet::new();
        let guard = set.record(cr(7, &["c1"]));

        assert_eq!(set.decide(&cr(7, &["c1", "c2"])), ScheduleDecision::InFlight);

        drop(guard);
        assert!(!set.is_in_flight("7"));
        assert_eq!(set.decide(&cr(7, &["c1", "c2"])), ScheduleDecision::Run);
    }

    #[test]
    fn record_replaces_previous_value() {
        let mut set = TestedSet::new();
        drop(set.record(cr(7, &["c1"])));
        drop(set.record(cr(7, &["c2"])));

        assert_eq!(set.len(), 1);
        assert_eq!(set.get("7").unwrap().commits()[0].hash, "c2");
    }

    #[test]
    fn retain_live_evicts_closed_identities() {
        let mut set = TestedSet::new();
        drop(set.record(cr(7, &["c1"])));
        drop(set.record(cr(8, &["c1"])));

        let live = HashSet::from(["8".to_string()]);
        set.retain_live(&live);

        assert!(set.get("7").is_none());
        assert!(set.get("8").is_some());
    }

    #[test]
    fn forget_allows_retry() {
        let mut set = TestedSet::new();
        drop(set.record(cr(7, &["c1"])));

        set.forget("7");

        assert!(set.is_empty());
        assert_eq!(set.decide(&cr(7, &["c1"])), ScheduleDecision::Run);
    }
}
