// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Event Registry (§4.3): a `Path -> EventRecord` map plus the decision
//! table that arbitrates concurrent migrate/un-migrate requests for the same
//! path.
//!
//! Every operation here takes the registry mutex briefly and returns; none
//! of them block on backend I/O or on another worker's completion. Callers
//! that need to wait for a peer drop the registry mutex first and call
//! [`EventRecord::await_completion`] on the `Arc` handed back to them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ErrorKind;
use crate::record::{Direction, EventRecord, RecordState};

/// Result of [`Registry::insert_or_join`].
pub enum JoinOutcome {
    /// No record existed (or a finished opposite-direction one was retired);
    /// the caller now owns a freshly inserted record and should run.
    Inserted(Arc<EventRecord>),
    /// A same-direction worker is already running; wait on it instead of
    /// starting a new one.
    Join(Arc<EventRecord>),
    /// A prior record occupies the path but has already finished; the
    /// caller should back off and let its owner clean it up (§4.2.1, §9
    /// open question — resolved here as "busy", not "join", see DESIGN.md).
    Busy,
    /// An outbound migration is in progress; deny access until it completes.
    Deny,
}

/// `Path -> EventRecord` map guarded by a single mutex.
#[derive(Default)]
pub struct Registry {
    records: Mutex<HashMap<PathBuf, Arc<EventRecord>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `record` for `path` iff no record currently exists there.
    pub fn insert_if_absent(&self, path: PathBuf, record: Arc<EventRecord>) -> Option<Arc<EventRecord>> {
        let mut records = self.records.lock();
        if records.contains_key(&path) {
            return None;
        }
        records.insert(path, Arc::clone(&record));
        Some(record)
    }

    pub fn lookup(&self, path: &Path) -> Option<Arc<EventRecord>> {
        self.records.lock().get(path).cloned()
    }

    pub fn remove(&self, path: &Path) -> Option<Arc<EventRecord>> {
        self.records.lock().remove(path)
    }

    /// Snapshot of every path currently tracked. Used by shutdown and tests;
    /// never held while iterating I/O.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.records.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The decision table from §4.3, extended with the §4.2.1 "finished
    /// peer" rule for the combinations the table leaves implicit. Takes the
    /// registry mutex for the duration of the table lookup only; any record
    /// state/error read happens on a cheap `parking_lot` lock inside
    /// `EventRecord`, never on backend I/O.
    pub fn insert_or_join(&self, path: &Path, desired: Direction) -> JoinOutcome {
        let mut records = self.records.lock();

        let Some(existing) = records.get(path).cloned() else {
            let record = Arc::new(EventRecord::new(path, desired));
            records.insert(path.to_path_buf(), Arc::clone(&record));
            return JoinOutcome::Inserted(record);
        };

        let finished = existing.try_acquire_completion().is_some();

        if finished {
            // §4.3 row: "MIGRATE_OUT done, desired MIGRATE_IN -> proceed
            // (caller inserts after remove)". Every other finished
            // combination falls back to the §4.2.1 "finished peer ->
            // busy" rule: the path is occupied by a record awaiting
            // cleanup by its own owner, not a new worker.
            return if existing.direction == Direction::MigrateOut && desired == Direction::MigrateIn {
                records.remove(path);
                let record = Arc::new(EventRecord::new(path, desired));
                records.insert(path.to_path_buf(), Arc::clone(&record));
                JoinOutcome::Inserted(record)
            } else {
                JoinOutcome::Busy
            };
        }

        match (existing.direction, desired) {
            (Direction::MigrateOut, Direction::MigrateOut) => JoinOutcome::Join(existing),
            (Direction::MigrateOut, Direction::MigrateIn) => JoinOutcome::Deny,
            (Direction::MigrateIn, Direction::MigrateOut) => JoinOutcome::Busy,
            (Direction::MigrateIn, Direction::MigrateIn) => JoinOutcome::Join(existing),
        }
    }
}

/// Terminal (state, error) pair, useful when a caller only wants to mirror
/// a peer's verdict rather than inspect it.
pub type Verdict = (RecordState, Option<ErrorKind>);

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn path(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn absent_path_inserts_and_caller_runs() {
        let registry = Registry::new();
        match registry.insert_or_join(&path("/x"), Direction::MigrateOut) {
            JoinOutcome::Inserted(record) => {
                assert_eq!(record.direction, Direction::MigrateOut);
                assert_eq!(record.state(), RecordState::Started);
            }
            _ => panic!("expected Inserted"),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn migrate_out_busy_denies_migrate_in() {
        let registry = Registry::new();
        let record = Arc::new(EventRecord::new(path("/x"), Direction::MigrateOut));
        registry.insert_if_absent(path("/x"), record.clone());
        let _completion = record.try_acquire_completion().expect("should be free initially");

        match registry.insert_or_join(&path("/x"), Direction::MigrateIn) {
            JoinOutcome::Deny => {}
            _ => panic!("expected Deny"),
        }
    }

    #[test]
    fn migrate_out_busy_joins_migrate_out() {
        let registry = Registry::new();
        let record = Arc::new(EventRecord::new(path("/x"), Direction::MigrateOut));
        registry.insert_if_absent(path("/x"), record.clone());
        let _completion = record.try_acquire_completion().expect("should be free initially");

        match registry.insert_or_join(&path("/x"), Direction::MigrateOut) {
            JoinOutcome::Join(existing) => assert!(Arc::ptr_eq(&existing, &record)),
            _ => panic!("expected Join"),
        }
    }

    #[test]
    fn migrate_in_busy_denies_new_migrate_out_as_busy() {
        let registry = Registry::new();
        let record = Arc::new(EventRecord::new(path("/x"), Direction::MigrateIn));
        registry.insert_if_absent(path("/x"), record.clone());
        let _completion = record.try_acquire_completion().expect("should be free initially");

        match registry.insert_or_join(&path("/x"), Direction::MigrateOut) {
            JoinOutcome::Busy => {}
            _ => panic!("expected Busy"),
        }
    }

    #[test]
    fn finished_record_returns_busy_not_join() {
        let registry = Registry::new();
        let record = Arc::new(EventRecord::new(path("/x"), Direction::MigrateOut));
        registry.insert_if_absent(path("/x"), record.clone());
        record.finish(RecordState::Done, None);
        // completion lock was never taken, so it's still "free" -> finished.

        match registry.insert_or_join(&path("/x"), Direction::MigrateOut) {
            JoinOutcome::Busy => {}
            _ => panic!("expected Busy for a finished-but-not-yet-removed record"),
        }
    }

    #[test]
    fn finished_migrate_out_lets_migrate_in_proceed() {
        let registry = Registry::new();
        let old = Arc::new(EventRecord::new(path("/x"), Direction::MigrateOut));
        registry.insert_if_absent(path("/x"), old.clone());
        old.finish(RecordState::Done, None);

        match registry.insert_or_join(&path("/x"), Direction::MigrateIn) {
            JoinOutcome::Inserted(new) => {
                assert!(!Arc::ptr_eq(&new, &old));
                assert_eq!(new.direction, Direction::MigrateIn);
            }
            _ => panic!("expected Inserted"),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn at_most_one_record_per_path() {
        let registry = Registry::new();
        let record = Arc::new(EventRecord::new(path("/x"), Direction::MigrateOut));
        assert!(registry.insert_if_absent(path("/x"), record.clone()).is_some());
        let other = Arc::new(EventRecord::new(path("/x"), Direction::MigrateIn));
        assert!(registry.insert_if_absent(path("/x"), other).is_none());
        assert_eq!(registry.len(), 1);
    }
}
