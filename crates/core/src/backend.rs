// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The abstract Backend Store interface (§4.4). A backend is a persistent
//! sink addressed by relative path; the migration protocol is expressed
//! entirely in terms of this trait so the reference "file" backend and any
//! future plug-in share the same open/check/migrate/unmigrate/close
//! bracket.

use std::fs::File;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::HsmError;
use crate::metadata::FileMeta;

/// Per-path handle created by [`Backend::open`]. Owned by the worker that
/// opened it; `close` must run exactly once regardless of the outcome.
pub struct BackendHandle {
    pub file: File,
    pub relative_path: PathBuf,
}

/// Outcome of [`Backend::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Current,
    Stale,
}

/// Outcome of [`Backend::unmigrate`]: whether content was actually streamed
/// into the frontend, or whether the backend fell back to a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmigrateOutcome {
    Copied,
    BindMounted,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Prepare the backend object for `path`; may create it and any parent
    /// directories. Never returns a handle for a negative/invalid
    /// descriptor — see the open question recorded in DESIGN.md about the
    /// historical "0 is failure" sentinel.
    async fn open(&self, path: &std::path::Path) -> Result<BackendHandle, HsmError>;

    /// Compare backend metadata for `path` against `frontend` without
    /// opening a handle. `Err(NotFound)` when the backend has no copy.
    async fn check(&self, path: &std::path::Path, frontend: FileMeta) -> Result<CheckResult, HsmError>;

    /// Copy `frontend`'s contents into the backend object behind `handle`,
    /// then mirror size/mode/uid/gid/timestamps onto the backend copy.
    /// Does not touch the frontend; callers punch holes there separately
    /// (§4.2.1 step 5).
    async fn migrate(&self, handle: &BackendHandle, frontend: &File) -> Result<(), HsmError>;

    /// Rehydrate `frontend` (open at `frontend_path`) from the backend
    /// object behind `handle`. May fall back to bind-mounting
    /// `frontend_path` per §4.4 when streaming is impractical.
    async fn unmigrate(
        &self,
        handle: &BackendHandle,
        frontend_path: &std::path::Path,
        frontend: &File,
    ) -> Result<UnmigrateOutcome, HsmError>;

    /// Release backend-side resources. Called unconditionally before the
    /// owning worker reports its verdict.
    async fn close(&self, handle: BackendHandle) -> Result<(), HsmError>;

    /// Undo any bind mount a prior [`Backend::unmigrate`] left over
    /// `frontend_path`, before a new migrate writes through it (§4.4
    /// "cross-device case"). Backends that never bind-mount can leave the
    /// default no-op.
    async fn unmount_stale(&self, _frontend_path: &std::path::Path) -> Result<(), HsmError> {
        Ok(())
    }
}
