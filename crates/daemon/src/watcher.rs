// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Permission Watcher (§4.1): drives one kernel access-permission event
//! to one verdict. This is the subsystem with the hardest failure mode in
//! the whole daemon — a verdict that never arrives hangs the process that
//! triggered the event — so every exit path from [`run_unmigrate_worker`]
//! is structured to always reach the final `write_response`.

use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hsm_core::{Backend, Direction, ErrorKind, EventRecord, JoinOutcome, Registry};
use nix::sys::fanotify::{EventFFlags, Fanotify, InitFlags, MarkFlags, MaskFlags, Response};
use tokio::io::unix::AsyncFd;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::resolver;

const READINESS_TIMEOUT: Duration = Duration::from_secs(5);

const WATCH_MASK: MaskFlags = MaskFlags::FAN_OPEN_PERM.union(MaskFlags::FAN_EVENT_ON_CHILD);

/// Owns the fanotify subscription and the registry of in-flight
/// migrate/un-migrate records for the subtree it watches.
pub struct PermissionWatcher {
    fanotify: AsyncFd<Fanotify>,
    registry: Arc<Registry>,
    backend: Arc<dyn Backend>,
    root: std::path::PathBuf,
}

impl PermissionWatcher {
    pub fn new(root: impl Into<std::path::PathBuf>, registry: Arc<Registry>, backend: Arc<dyn Backend>) -> io::Result<Self> {
        let root = root.into();
        let fanotify = Fanotify::init(
            InitFlags::FAN_CLASS_PRE_CONTENT | InitFlags::FAN_CLOEXEC,
            EventFFlags::O_RDONLY,
        )
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        fanotify
            .mark(MarkFlags::FAN_MARK_ADD, WATCH_MASK, None, Some(&root))
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        Ok(Self { fanotify: AsyncFd::new(fanotify)?, registry, backend, root })
    }

    /// Remove the subtree mark for `path` so future accesses no longer
    /// trap (§4.1.1, after a successful un-migrate).
    fn remove_mark_for(&self, path: &Path) {
        if let Err(e) = self.fanotify.get_ref().mark(MarkFlags::FAN_MARK_REMOVE, WATCH_MASK, None, Some(path)) {
            warn!(error = %e, path = %path.display(), "failed to remove fanotify mark");
        }
    }

    /// Add a mark for `path` so future accesses trap (§4.2.1 step 6, after a
    /// successful migrate-out).
    pub fn add_mark_for(&self, path: &Path) {
        if let Err(e) = self.fanotify.get_ref().mark(MarkFlags::FAN_MARK_ADD, WATCH_MASK, None, Some(path)) {
            warn!(error = %e, path = %path.display(), "failed to add fanotify mark");
        }
    }

    /// The absolute frontend path for a relative path under the watched
    /// root; the inverse of the private `relative_path` helper.
    pub fn frontend_path(&self, relative: &Path) -> std::path::PathBuf {
        self.root.join(relative)
    }

    /// Run the event loop until `cancel` fires. §4.1 step 1: the watcher is
    /// only cancel-safe at this readiness-poll suspension point; once a
    /// worker is spawned it runs to verdict regardless of shutdown.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(root = %self.root.display(), "permission watcher started");
        loop {
            let ready = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("permission watcher observed cancellation");
                    return;
                }
                ready = timeout(READINESS_TIMEOUT, self.fanotify.readable()) => ready,
            };

            let mut guard = match ready {
                Ok(Ok(guard)) => guard,
                Ok(Err(e)) => {
                    error!(error = %e, "fanotify readiness poll failed");
                    continue;
                }
                Err(_) => continue, // 5s cooperative timeout; loop back to check `cancel`
            };

            let events = match guard.get_inner().read_events() {
                Ok(events) => events,
                Err(e) => {
                    guard.clear_ready();
                    error!(error = %e, "failed to read fanotify events");
                    continue;
                }
            };
            guard.clear_ready();

            for event in events {
                self.clone().handle_event(event);
            }
        }
    }

    fn handle_event(self: Arc<Self>, event: nix::sys::fanotify::FanotifyEvent) {
        let Some(fd) = event.fd() else {
            return;
        };

        if !event.mask().contains(MaskFlags::FAN_OPEN_PERM) {
            // No verdict owed for a mere notification event, but we still
            // own this fd and must close it (§3: closed exactly once).
            let _ = nix::unistd::close(fd);
            return;
        }

        let path = match resolver::resolve(fd) {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "failed to resolve event handle to a path, denying");
                self.write_verdict(fd, Response::Deny);
                return;
            }
        };

        match self.registry.insert_or_join(&path, Direction::MigrateIn) {
            JoinOutcome::Deny => {
                // A MIGRATE_OUT is busy on this path: the write protecting
                // the outgoing copy is the source of truth (§4.1 step 5).
                debug!(path = %path.display(), "denying access: outbound migration in progress");
                self.write_verdict(fd, Response::Deny);
            }
            JoinOutcome::Busy => {
                // A record for this path is mid-teardown by its own owner
                // (a narrow race, not the common case). Deny conservatively;
                // the caller's next open retries once the path clears.
                debug!(path = %path.display(), "denying access: record mid-teardown");
                self.write_verdict(fd, Response::Deny);
            }
            JoinOutcome::Join(existing) => {
                // Another un-migrate is already running for this path. We
                // don't spawn a second worker, but this event's own fd
                // still owes its own verdict (§8: every event gets exactly
                // one), so wait for the in-flight worker's outcome and
                // mirror it.
                let watcher = Arc::clone(&self);
                tokio::spawn(async move {
                    let (_state, error) = existing.await_completion().await;
                    let response = if error.is_none() { Response::Allow } else { Response::Deny };
                    watcher.write_verdict(fd, response);
                });
            }
            JoinOutcome::Inserted(record) => {
                let watcher = Arc::clone(&self);
                tokio::spawn(async move {
                    watcher.run_unmigrate_worker(record, fd).await;
                });
            }
        }
    }

    fn write_verdict(&self, fd: RawFd, response: Response) {
        if let Err(e) = self.fanotify.get_ref().write_response(fd, response) {
            error!(error = %e, "failed to write fanotify response");
        }
        let _ = nix::unistd::close(fd);
    }

    /// §4.1.1: single linear run, owning `record`'s completion for the
    /// full duration, always ending in exactly one verdict write and one
    /// close of `fd`.
    async fn run_unmigrate_worker(&self, record: Arc<EventRecord>, fd: RawFd) {
        let _completion = record.acquire_completion().await;
        record.set_state(hsm_core::RecordState::Open);

        let outcome = self.unmigrate(&record, fd).await;

        let (state, error) = match outcome {
            Ok(()) => (hsm_core::RecordState::Done, None),
            Err(kind) => (hsm_core::RecordState::Failed, Some(kind)),
        };
        record.finish(state, error);

        if error.is_none() {
            self.remove_mark_for(&record.path);
        } else {
            // Frontend placeholder left untouched so a later access can
            // retry the un-migrate (§7).
            warn!(path = %record.path.display(), ?error, "un-migrate failed");
        }

        let response = if error.is_none() { Response::Allow } else { Response::Deny };
        self.write_verdict(fd, response);
        self.registry.remove(&record.path);
    }

    async fn unmigrate(&self, record: &EventRecord, fd: RawFd) -> Result<(), ErrorKind> {
        record.set_state(hsm_core::RecordState::Busy);

        let relative = self.relative_path(&record.path);

        // Distinguish "no backend copy at all" (nothing to rehydrate, the
        // mark was added by SETUP or is stale) from a genuine migrated
        // file, before `open` creates a backend object as a side effect.
        let frontend_meta = match std::fs::metadata(&record.path) {
            Ok(meta) => hsm_core::FileMeta::from_std(&meta),
            Err(e) => return Err(ErrorKind::from_errno(e.raw_os_error().unwrap_or(libc::EIO))),
        };
        match self.backend.check(&relative, frontend_meta).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // "Already un-migrated": no backend copy exists, so there
                // is nothing to rehydrate (§4.1.1, §8 scenario 4).
                return Ok(());
            }
            Err(e) => return Err(e.kind()),
        }

        let handle = self.backend.open(&relative).await.map_err(|e| e.kind())?;

        // SAFETY: `fd` is a valid, open descriptor for the duration of this
        // worker; we never close it ourselves before `write_verdict` does.
        let frontend = unsafe { std::fs::File::from(std::os::fd::OwnedFd::from_raw_fd(nix::unistd::dup(fd).map_err(|e| ErrorKind::from_errno(e as i32))?)) };

        let result = self.backend.unmigrate(&handle, &record.path, &frontend).await;
        if let Err(e) = self.backend.close(handle).await {
            warn!(error = %e, "failed to close backend handle after un-migrate");
        }

        result.map(|_outcome| ()).map_err(|e| e.kind())
    }

    /// Strip the watched root so backends address objects by the same
    /// relative path regardless of where the frontend tree is mounted.
    fn relative_path<'a>(&self, path: &'a Path) -> std::path::PathBuf {
        path.strip_prefix(&self.root).unwrap_or(path).to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsm_core::test_support::FakeBackend;

    #[test]
    fn watch_mask_includes_access_permission_and_children() {
        assert!(WATCH_MASK.contains(MaskFlags::FAN_OPEN_PERM));
        assert!(WATCH_MASK.contains(MaskFlags::FAN_EVENT_ON_CHILD));
    }

    #[tokio::test]
    async fn relative_path_strips_watched_root() {
        let registry = Arc::new(Registry::new());
        let backend: Arc<dyn Backend> = Arc::new(FakeBackend::new());
        // Constructing a real PermissionWatcher requires an actual fanotify
        // fd (needs CAP_SYS_ADMIN); exercise the pure path logic instead
        // via a throwaway struct with the same field layout semantics.
        struct Fixture {
            root: std::path::PathBuf,
        }
        let fixture = Fixture { root: std::path::PathBuf::from("/mnt/frontend") };
        let path = std::path::Path::new("/mnt/frontend/data/a.txt");
        let relative = path.strip_prefix(&fixture.root).unwrap_or(path);
        assert_eq!(relative, std::path::Path::new("data/a.txt"));
        let _ = (&registry, &backend);
    }
}
