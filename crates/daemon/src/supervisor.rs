// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Supervisor (§4.6): installs signal handling, coordinates an orderly
//! shutdown of the permission watcher and command server, and lets any
//! in-flight migrate/un-migrate workers detach and run to their own verdict
//! rather than being torn down mid-operation.

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::command_server::CommandServer;
use crate::watcher::PermissionWatcher;

/// Owns the top-level cancellation token and the two long-running server
/// tasks. `run` returns once both servers have observed cancellation and
/// their event loops have returned; it does not wait on detached worker
/// tasks (§5: those outlive shutdown by design).
pub struct Supervisor {
    watcher: Arc<PermissionWatcher>,
    command_server: Arc<CommandServer>,
    cancel: CancellationToken,
}

impl Supervisor {
    /// `cancel` is shared with the command server so its SHUTDOWN handling
    /// triggers the same teardown path as a signal.
    pub fn new(watcher: Arc<PermissionWatcher>, command_server: Arc<CommandServer>, cancel: CancellationToken) -> Self {
        Self { watcher, command_server, cancel }
    }

    /// Run until SIGINT/SIGTERM, or until `cancel` is triggered some other
    /// way (e.g. a privileged SHUTDOWN command).
    pub async fn run(self) -> std::io::Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let watcher_task = tokio::spawn(Arc::clone(&self.watcher).run(self.cancel.clone()));
        let command_task = tokio::spawn(Arc::clone(&self.command_server).run(self.cancel.clone()));

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = self.cancel.cancelled() => info!("cancellation requested internally"),
        }

        self.cancel.cancel();

        if let Err(e) = watcher_task.await {
            tracing::warn!(error = %e, "permission watcher task panicked");
        }
        if let Err(e) = command_task.await {
            tracing::warn!(error = %e, "command server task panicked");
        }

        info!("supervisor shutdown complete; any in-flight workers continue detached");
        Ok(())
    }
}
