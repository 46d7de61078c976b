// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The per-path [`EventRecord`] state machine (§3).
//!
//! An `EventRecord` is published into the [`crate::Registry`] under the
//! registry mutex, then mutated only by the worker that owns it. Peers never
//! touch `state`/`error` directly; they either `try_acquire_completion` to
//! probe for "already finished", or `await_completion` to block for the
//! final verdict.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::ErrorKind;

/// Which way content is flowing for this path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// frontend → backend
    MigrateOut,
    /// backend → frontend
    MigrateIn,
}

/// §3 state machine. `Done`/`Failed`/`Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Started,
    Open,
    Busy,
    Done,
    Failed,
    Aborted,
}

impl RecordState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecordState::Done | RecordState::Failed | RecordState::Aborted)
    }
}

/// `state` and `error` are a single invariant: once terminal, `error` is
/// `Some` iff the state is `Failed`/`Aborted`. Kept in one lock so a reader
/// never observes one half of the pair mid-update.
struct Status {
    state: RecordState,
    error: Option<ErrorKind>,
}

/// The coordination object for one path. Created with `state = Started`,
/// published into the registry, then owned exclusively by whichever worker
/// inserted it until that worker removes it.
pub struct EventRecord {
    pub path: PathBuf,
    pub direction: Direction,
    status: Mutex<Status>,
    /// Held by the owning worker for its full run; release signals peers
    /// blocked in `await_completion`.
    completion: AsyncMutex<()>,
}

/// Guard returned by `try_acquire_completion`/`acquire_completion`. Dropping
/// it releases the completion lock, which is how a worker signals that the
/// record has reached a terminal state.
pub type CompletionGuard<'a> = tokio::sync::MutexGuard<'a, ()>;

impl EventRecord {
    pub fn new(path: impl Into<PathBuf>, direction: Direction) -> Self {
        Self {
            path: path.into(),
            direction,
            status: Mutex::new(Status { state: RecordState::Started, error: None }),
            completion: AsyncMutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> RecordState {
        self.status.lock().state
    }

    pub fn error(&self) -> Option<ErrorKind> {
        self.status.lock().error
    }

    pub fn set_state(&self, state: RecordState) {
        self.status.lock().state = state;
    }

    /// Write the terminal state and error together. Call this while still
    /// holding the record's `completion` guard.
    pub fn finish(&self, state: RecordState, error: Option<ErrorKind>) {
        debug_assert!(state.is_terminal(), "finish() called with non-terminal state");
        let mut status = self.status.lock();
        status.state = state;
        status.error = error;
    }

    /// Non-blocking: `Some` means the caller now owns the completion for
    /// this record (e.g. re-running cleanup); `None` means another worker
    /// still holds it.
    pub fn try_acquire_completion(&self) -> Option<CompletionGuard<'_>> {
        self.completion.try_lock().ok()
    }

    /// Acquire the completion lock, blocking until whoever holds it (if
    /// anyone) releases it. Used by the owning worker at the start of its
    /// run, and held for the worker's full lifetime.
    pub async fn acquire_completion(&self) -> CompletionGuard<'_> {
        self.completion.lock().await
    }

    /// Block until the record reaches a terminal state, then return it.
    /// Drops the registry mutex before calling this (callers must not hold
    /// it), per §4.3.
    pub async fn await_completion(&self) -> (RecordState, Option<ErrorKind>) {
        let _guard = self.completion.lock().await;
        let status = self.status.lock();
        (status.state, status.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn new_record_starts_in_started_state() {
        let record = EventRecord::new("/data/a.txt", Direction::MigrateOut);
        assert_eq!(record.state(), RecordState::Started);
        assert_eq!(record.error(), None);
    }

    #[test]
    fn finish_sets_state_and_error_atomically() {
        let record = EventRecord::new("/data/a.txt", Direction::MigrateIn);
        record.finish(RecordState::Failed, Some(ErrorKind::Io));
        assert_eq!(record.state(), RecordState::Failed);
        assert_eq!(record.error(), Some(ErrorKind::Io));
    }

    #[tokio::test]
    async fn await_completion_blocks_until_owner_releases() {
        let record = Arc::new(EventRecord::new("/data/a.txt", Direction::MigrateOut));
        let guard = record.acquire_completion().await;
        assert!(record.try_acquire_completion().is_none());

        let waiter = {
            let record = Arc::clone(&record);
            tokio::spawn(async move { record.await_completion().await })
        };

        tokio::task::yield_now().await;
        record.finish(RecordState::Done, None);
        drop(guard);

        let (state, error) = waiter.await.expect("waiter task panicked");
        assert_eq!(state, RecordState::Done);
        assert_eq!(error, None);
    }
}
