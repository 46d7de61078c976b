// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test doubles shared across crates that depend on `hsm-core` with
//! `features = ["test-support"]`.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::backend::{Backend, BackendHandle, CheckResult, UnmigrateOutcome};
use crate::error::{ErrorKind, HsmError};
use crate::metadata::FileMeta;

/// An in-memory backend for exercising the registry/watcher/command-server
/// logic without touching the filesystem. Not a stand-in for the reference
/// file backend's own tests (those live in `hsm-daemon`).
#[derive(Default)]
pub struct FakeBackend {
    contents: Mutex<HashMap<PathBuf, Vec<u8>>>,
    fail_open: Mutex<Option<ErrorKind>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) {
        self.contents.lock().expect("lock poisoned").insert(path.into(), data.into());
    }

    pub fn fail_next_open(&self, kind: ErrorKind) {
        *self.fail_open.lock().expect("lock poisoned") = Some(kind);
    }

    pub fn has(&self, path: &Path) -> bool {
        self.contents.lock().expect("lock poisoned").contains_key(path)
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn open(&self, path: &Path) -> Result<BackendHandle, HsmError> {
        if let Some(kind) = self.fail_open.lock().expect("lock poisoned").take() {
            return Err(kind.into());
        }
        let file = tempfile::tempfile()?;
        self.contents.lock().expect("lock poisoned").entry(path.to_path_buf()).or_default();
        Ok(BackendHandle { file, relative_path: path.to_path_buf() })
    }

    async fn check(&self, path: &Path, frontend: FileMeta) -> Result<CheckResult, HsmError> {
        let contents = self.contents.lock().expect("lock poisoned");
        let Some(data) = contents.get(path) else {
            return Err(ErrorKind::NotFound.into());
        };
        if data.len() as u64 == frontend.size {
            Ok(CheckResult::Current)
        } else {
            Ok(CheckResult::Stale)
        }
    }

    async fn migrate(&self, handle: &BackendHandle, _frontend: &File) -> Result<(), HsmError> {
        // Tests seed/replace `contents` directly; the handle's file stands
        // in for a real backend fd.
        let _ = &handle.file;
        Ok(())
    }

    async fn unmigrate(
        &self,
        _handle: &BackendHandle,
        _frontend_path: &Path,
        _frontend: &File,
    ) -> Result<UnmigrateOutcome, HsmError> {
        Ok(UnmigrateOutcome::Copied)
    }

    async fn close(&self, _handle: BackendHandle) -> Result<(), HsmError> {
        Ok(())
    }
}
