// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Path Resolver (§4.5): turn a kernel-supplied access handle into an
//! absolute path by reading the symlink the kernel exposes for it under
//! `/proc/self/fd/`.

use std::os::fd::RawFd;
use std::path::PathBuf;

use hsm_core::{ErrorKind, HsmError};

/// Resolve `fd` (an fd open in *this* process, e.g. from a fanotify event's
/// `fd` field) to its absolute path.
///
/// A truncated or empty link is a failure, matching the contract every
/// caller relies on: a failed resolve means "emit DENY, drop", never a
/// partial path.
pub fn resolve(fd: RawFd) -> Result<PathBuf, HsmError> {
    let link = format!("/proc/self/fd/{fd}");
    let target = std::fs::read_link(&link)?;

    if target.as_os_str().is_empty() {
        return Err(ErrorKind::NotFound.into());
    }

    // `/proc` symlinks for deleted files are suffixed with " (deleted)"; we
    // have no use for such a handle since the frontend entry is gone.
    if target.to_string_lossy().ends_with(" (deleted)") {
        return Err(ErrorKind::NotFound.into());
    }

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn resolves_an_open_file_to_its_absolute_path() {
        let file = tempfile::NamedTempFile::new().expect("create temp file");
        let resolved = resolve(file.as_raw_fd()).expect("resolve should succeed");
        assert_eq!(resolved, file.path().canonicalize().expect("canonicalize"));
    }

    #[test]
    fn rejects_a_closed_descriptor() {
        // A very large, almost certainly unopened fd number.
        assert!(resolve(123_456).is_err());
    }
}
