// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The reference "file" backend. One backend object per frontend path,
//! stored under `prefix + path`; parent directories are created on demand
//! with mode 0700 (§6).

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hsm_core::{Backend, BackendHandle, CheckResult, ErrorKind, FileMeta, HsmError, UnmigrateOutcome};
use nix::sys::stat::{fchmod, fstat, Mode};
use nix::sys::time::TimeSpec;
use nix::unistd::{fchown, ftruncate, Gid, Uid};

use super::fs_util::create_leading_directories;
use super::mount::{bind_mount, unmount_if_mounted};

pub struct FileBackend {
    prefix: PathBuf,
    bind_mount_threshold: u64,
}

impl FileBackend {
    pub fn new(prefix: impl Into<PathBuf>, bind_mount_threshold: u64) -> Self {
        Self { prefix: prefix.into(), bind_mount_threshold }
    }

    fn backend_path(&self, relative: &Path) -> PathBuf {
        // `relative` is always relative (a frontend path with its monitored
        // root stripped); join, don't concatenate strings, so a leading
        // `/` in `relative` can't escape the prefix.
        let relative = relative.strip_prefix("/").unwrap_or(relative);
        self.prefix.join(relative)
    }

    /// Mirror mode/uid/gid/atime/mtime from `src` onto the backend file
    /// `dst_fd`. Best-effort past the content copy, per §7: failures here
    /// are logged, not surfaced.
    fn mirror_metadata(dst_fd: i32, src: FileMeta) {
        if let Err(e) = fchmod(dst_fd, Mode::from_bits_truncate(src.mode & 0o7777)) {
            tracing::warn!(error = %e, "failed to mirror mode onto backend file");
        }
        if let Err(e) = fchown(dst_fd, Some(Uid::from_raw(src.uid)), Some(Gid::from_raw(src.gid))) {
            tracing::warn!(error = %e, "failed to mirror owner onto backend file");
        }
        let atime = TimeSpec::new(src.atime, 0);
        let mtime = TimeSpec::new(src.mtime, 0);
        if let Err(e) = nix::sys::stat::futimens(dst_fd, &atime, &mtime) {
            tracing::warn!(error = %e, "failed to mirror timestamps onto backend file");
        }
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn open(&self, path: &Path) -> Result<BackendHandle, HsmError> {
        let backend_path = self.backend_path(path);
        create_leading_directories(&backend_path, 0o700)?;

        let file = OpenOptions::new().read(true).write(true).create(true).open(&backend_path)?;
        Ok(BackendHandle { file, relative_path: path.to_path_buf() })
    }

    async fn check(&self, path: &Path, frontend: FileMeta) -> Result<CheckResult, HsmError> {
        let backend_path = self.backend_path(path);
        let meta = match std::fs::metadata(&backend_path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ErrorKind::NotFound.into()),
            Err(e) => return Err(e.into()),
        };
        let backend_meta = FileMeta::from_std(&meta);
        if backend_meta.is_current_against(&frontend) {
            Ok(CheckResult::Current)
        } else {
            Ok(CheckResult::Stale)
        }
    }

    async fn migrate(&self, handle: &BackendHandle, frontend: &File) -> Result<(), HsmError> {
        let backend_fd = handle.file.as_raw_fd();
        let frontend_fd = frontend.as_raw_fd();

        let frontend_stat = fstat(frontend_fd)?;
        let backend_stat = fstat(backend_fd)?;

        if frontend_stat.st_size != backend_stat.st_size {
            ftruncate(backend_fd, frontend_stat.st_size)?;
        }

        copy_all(frontend, &handle.file, frontend_stat.st_size as u64)?;

        let frontend_meta = Self::frontend_meta_from_stat(&frontend_stat);
        Self::mirror_metadata(backend_fd, frontend_meta);
        Ok(())
    }

    async fn unmigrate(
        &self,
        handle: &BackendHandle,
        frontend_path: &Path,
        frontend: &File,
    ) -> Result<UnmigrateOutcome, HsmError> {
        let backend_fd = handle.file.as_raw_fd();
        let frontend_fd = frontend.as_raw_fd();

        let backend_stat = fstat(backend_fd)?;
        let frontend_stat = fstat(frontend_fd)?;

        if backend_stat.st_size as u64 > self.bind_mount_threshold {
            let backend_path = self.backend_path(&handle.relative_path);
            bind_mount(&backend_path, frontend_path)?;
            return Ok(UnmigrateOutcome::BindMounted);
        }

        if backend_stat.st_size != frontend_stat.st_size {
            nix::fcntl::posix_fallocate(frontend_fd, 0, backend_stat.st_size)
                .or_else(|e| if e == nix::Error::ENOTSUP { Ok(()) } else { Err(e) })?;
            ftruncate(frontend_fd, backend_stat.st_size)?;
        }

        if copy_all(&handle.file, frontend, backend_stat.st_size as u64).is_err() {
            // Partial stream: fall back to a bind mount rather than leave
            // the frontend half-populated (§4.4).
            let backend_path = self.backend_path(&handle.relative_path);
            bind_mount(&backend_path, frontend_path)?;
            return Ok(UnmigrateOutcome::BindMounted);
        }

        let backend_meta = Self::frontend_meta_from_stat(&backend_stat);
        let atime = TimeSpec::new(backend_meta.atime, 0);
        let mtime = TimeSpec::new(backend_meta.mtime, 0);
        if let Err(e) = nix::sys::stat::futimens(frontend_fd, &atime, &mtime) {
            tracing::warn!(error = %e, "failed to mirror timestamps onto frontend file");
        }
        Ok(UnmigrateOutcome::Copied)
    }

    async fn close(&self, _handle: BackendHandle) -> Result<(), HsmError> {
        Ok(())
    }

    async fn unmount_stale(&self, frontend_path: &Path) -> Result<(), HsmError> {
        unmount_if_mounted(frontend_path)
    }
}

impl FileBackend {
    fn frontend_meta_from_stat(stat: &nix::sys::stat::FileStat) -> FileMeta {
        FileMeta {
            size: stat.st_size as u64,
            mode: stat.st_mode,
            uid: stat.st_uid,
            gid: stat.st_gid,
            atime: stat.st_atime,
            mtime: stat.st_mtime,
            device: stat.st_dev,
        }
    }
}

fn copy_all(src: &File, dst: &File, len: u64) -> Result<(), HsmError> {
    use std::io::{Read, Seek, SeekFrom, Write};

    let mut src = src.try_clone()?;
    let mut dst = dst.try_clone()?;
    src.seek(SeekFrom::Start(0))?;
    dst.seek(SeekFrom::Start(0))?;

    let copied = std::io::copy(&mut src.by_ref().take(len), &mut dst)?;
    if copied != len {
        return Err(ErrorKind::DeviceFull.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn backend_with_prefix() -> (tempfile::TempDir, FileBackend) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let backend = FileBackend::new(tmp.path().join("backend"), 1 << 30);
        (tmp, backend)
    }

    #[tokio::test]
    async fn open_creates_parent_directories_under_prefix() {
        let (_tmp, backend) = backend_with_prefix();
        let handle = backend.open(Path::new("data/a.txt")).await.expect("open");
        assert!(handle.file.metadata().expect("metadata").is_file());
    }

    #[tokio::test]
    async fn migrate_copies_content_and_preserves_size() {
        let (tmp, backend) = backend_with_prefix();
        let frontend_path = tmp.path().join("a.txt");
        let mut frontend = File::create(&frontend_path).expect("create frontend");
        frontend.write_all(b"hello\n").expect("write");
        let frontend = File::open(&frontend_path).expect("reopen frontend");

        let handle = backend.open(Path::new("a.txt")).await.expect("open backend");
        backend.migrate(&handle, &frontend).await.expect("migrate");

        let backend_meta = handle.file.metadata().expect("metadata");
        assert_eq!(backend_meta.len(), 6);
    }

    #[tokio::test]
    async fn check_reports_stale_on_size_mismatch() {
        let (tmp, backend) = backend_with_prefix();
        let frontend_path = tmp.path().join("a.txt");
        std::fs::write(&frontend_path, b"hello\n").expect("write frontend");

        let handle = backend.open(Path::new("a.txt")).await.expect("open backend");
        handle.file.set_len(3).expect("truncate backend short");

        let frontend_meta = FileMeta::from_std(&std::fs::metadata(&frontend_path).expect("meta"));
        let result = backend.check(Path::new("a.txt"), frontend_meta).await.expect("check");
        assert_eq!(result, CheckResult::Stale);
    }

    #[tokio::test]
    async fn check_reports_not_found_when_backend_missing() {
        let (_tmp, backend) = backend_with_prefix();
        let frontend_meta = FileMeta { size: 0, mode: 0o644, uid: 0, gid: 0, atime: 0, mtime: 0, device: 0 };
        let err = backend.check(Path::new("missing.txt"), frontend_meta).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
