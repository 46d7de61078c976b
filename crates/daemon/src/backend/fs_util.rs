// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Recursive directory creation that tolerates already-existing
//! directories but fails on a non-directory at an intermediate component
//! (§9 design note).

use std::path::Path;

use hsm_core::{ErrorKind, HsmError};

pub fn create_leading_directories(path: &Path, mode: u32) -> Result<(), HsmError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    create_dir_all(parent, mode)
}

fn create_dir_all(dir: &Path, mode: u32) -> Result<(), HsmError> {
    match std::fs::symlink_metadata(dir) {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => return Err(ErrorKind::InvalidArgument.into()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if let Some(parent) = dir.parent() {
        create_dir_all(parent, mode)?;
    }

    match nix::unistd::mkdir(dir, nix::sys::stat::Mode::from_bits_truncate(mode)) {
        Ok(()) => Ok(()),
        // Another worker may have created it concurrently; that's fine.
        Err(nix::Error::EEXIST) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn creates_missing_parents() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let target = tmp.path().join("a/b/c/file.bin");
        create_leading_directories(&target, 0o700).expect("create dirs");
        assert!(tmp.path().join("a/b/c").is_dir());
    }

    #[test]
    fn tolerates_already_existing_directories() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("a/b")).expect("pre-create");
        let target = tmp.path().join("a/b/file.bin");
        create_leading_directories(&target, 0o700).expect("create dirs");
    }

    #[test]
    fn fails_on_non_directory_intermediate_component() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a"), b"not a directory").expect("write file");
        let target = tmp.path().join("a/b/file.bin");
        assert!(create_leading_directories(&target, 0o700).is_err());
    }
}
