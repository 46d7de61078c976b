// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File metadata carried between frontend and backend during migration.

use std::os::unix::fs::MetadataExt;
use std::time::SystemTime;

/// The subset of POSIX metadata that migration must preserve (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub device: u64,
}

impl FileMeta {
    pub fn from_std(meta: &std::fs::Metadata) -> Self {
        Self {
            size: meta.size(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            atime: meta.atime(),
            mtime: meta.mtime(),
            device: meta.dev(),
        }
    }

    pub fn mtime_as_system_time(&self) -> SystemTime {
        epoch_secs_to_system_time(self.mtime)
    }

    pub fn atime_as_system_time(&self) -> SystemTime {
        epoch_secs_to_system_time(self.atime)
    }

    /// §4.4 / §8: a backend copy is current iff sizes match and the backend
    /// is at least as fresh as the frontend.
    pub fn is_current_against(&self, frontend: &FileMeta) -> bool {
        self.size == frontend.size && self.mtime >= frontend.mtime
    }
}

fn epoch_secs_to_system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs as u64)
    } else {
        SystemTime::UNIX_EPOCH - std::time::Duration::from_secs((-secs) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(size: u64, mtime: i64) -> FileMeta {
        FileMeta { size, mode: 0o644, uid: 0, gid: 0, atime: mtime, mtime, device: 0 }
    }

    #[test]
    fn current_when_size_equal_and_backend_newer() {
        let frontend = meta(6, 100);
        let backend = meta(6, 100);
        assert!(backend.is_current_against(&frontend));

        let fresher_backend = meta(6, 200);
        assert!(fresher_backend.is_current_against(&frontend));
    }

    #[test]
    fn stale_on_size_mismatch_or_older_backend() {
        let frontend = meta(6, 100);
        assert!(!meta(5, 200).is_current_against(&frontend));
        assert!(!meta(6, 50).is_current_against(&frontend));
    }
}
