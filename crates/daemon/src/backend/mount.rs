// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bind-mount fallback for un-migrate (§4.4, §9 open question on teardown).
//!
//! When a backend object is too large to stream, or streaming comes back
//! partial, `unmigrate` bind-mounts the backend path directly over the
//! frontend path so reads go straight through to the backend. Teardown
//! policy (§9): the mount is torn down lazily, by the *next* `migrate_file`
//! call for that path (§4.4 "cross-device case"), not by a background
//! sweep — there is no other owner of the frontend path in between.

use std::path::Path;

use hsm_core::HsmError;
use nix::mount::{mount, umount2, MntFlags, MsFlags};

pub fn bind_mount(backend_path: &Path, frontend_path: &Path) -> Result<(), HsmError> {
    mount(
        Some(backend_path),
        frontend_path,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )?;
    Ok(())
}

/// Unmount `frontend_path` if it is currently a mountpoint. Best-effort: a
/// plain directory that was never bind-mounted is not an error.
pub fn unmount_if_mounted(frontend_path: &Path) -> Result<(), HsmError> {
    match umount2(frontend_path, MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        Err(nix::Error::EINVAL) => Ok(()), // not a mountpoint
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmounting_a_plain_directory_is_not_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(unmount_if_mounted(tmp.path()).is_ok());
    }
}
