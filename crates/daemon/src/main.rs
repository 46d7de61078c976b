// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `hsmd`: the hierarchical storage management daemon and its CLI client.
//!
//! With no shortcut flag, the process subscribes its `root` argument for
//! permission events and serves the privileged command socket until
//! signalled (§2, §4.6). With `-c`/`-m`/`-u`/`-s`, it instead sends one
//! datagram to an already-running daemon and prints the result (§4.2).

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use hsm_daemon::{
    config::Cli,
    Config,
    FileBackend,
    command_server::CommandServer,
    supervisor::Supervisor,
    watcher::PermissionWatcher,
};
use hsm_core::Registry;
use hsm_wire::{CommandCode, Request, Response};
use nix::sys::socket::{
    connect, recv, sendmsg, socket, AddressFamily, ControlMessage, MsgFlags, SockFlag, SockType,
    UnixAddr,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SOCKET_NAME: &str = "hsmd";

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_logging(cli.priority);

    let client_command = client_command_for(&cli);

    let result = if let Some((command, path)) = client_command {
        run_client(command, path)
    } else {
        run_daemon(cli)
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "hsmd exited with an error");
            std::process::ExitCode::FAILURE
        }
    }
}

/// syslog priority (0 emerg .. 7 debug) mapped onto a `tracing` filter, the
/// way the rest of the pack wires `-p`/`-v` flags into `EnvFilter`.
fn init_logging(priority: u8) {
    let level = match priority {
        0..=3 => "error",
        4 => "warn",
        5 | 6 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn client_command_for(cli: &Cli) -> Option<(CommandCode, Option<PathBuf>)> {
    if cli.shutdown {
        return Some((CommandCode::Shutdown, None));
    }
    if let Some(path) = &cli.check {
        return Some((CommandCode::Check, Some(path.clone())));
    }
    if let Some(path) = &cli.migrate {
        return Some((CommandCode::Migrate, Some(path.clone())));
    }
    if let Some(path) = &cli.setup {
        return Some((CommandCode::Setup, Some(path.clone())));
    }
    None
}

/// Send one request datagram to a running daemon and print its response.
/// `MIGRATE` additionally passes the opened frontend fd via `SCM_RIGHTS` so
/// the daemon can read/write it without re-resolving the path itself.
fn run_client(command: CommandCode, path: Option<PathBuf>) -> std::io::Result<()> {
    let fd = socket(AddressFamily::Unix, SockType::Datagram, SockFlag::SOCK_CLOEXEC, None)
        .map_err(std::io::Error::from)?;
    let addr = UnixAddr::new_abstract(SOCKET_NAME.as_bytes()).map_err(std::io::Error::from)?;
    connect(fd.as_raw_fd(), &addr).map_err(std::io::Error::from)?;

    let request = Request::new(command, path.clone());
    let body = request.encode();

    let frontend_file = if command == CommandCode::Migrate {
        path.as_deref().map(open_for_migrate).transpose()?
    } else {
        None
    };

    let iov = [std::io::IoSlice::new(&body)];
    match &frontend_file {
        Some(file) => {
            let raw = [file.as_raw_fd()];
            let cmsg = [ControlMessage::ScmRights(&raw)];
            sendmsg::<UnixAddr>(fd.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
                .map_err(std::io::Error::from)?;
        }
        None => {
            sendmsg::<UnixAddr>(fd.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)
                .map_err(std::io::Error::from)?;
        }
    }

    let mut buf = [0u8; 4096];
    let n = recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty()).map_err(std::io::Error::from)?;
    match Response::decode(&buf[..n]) {
        Response::Success => println!("ok"),
        Response::Error(kind) => {
            eprintln!("error: {kind:?}");
            std::process::exit(1);
        }
        Response::Text(text) => println!("{text}"),
    }
    Ok(())
}

/// Open the frontend file and take the advisory write lock §4.2 requires
/// the client to hold before handing the fd to the daemon: the daemon
/// relies on this lock, not its own bookkeeping, as the fence against a
/// concurrent writer racing the migrate's stat+copy+hole-punch sequence.
/// The lock travels with the fd through `SCM_RIGHTS` and is released when
/// `frontend_file` is dropped after the daemon's reply arrives.
fn open_for_migrate(path: &Path) -> std::io::Result<std::fs::File> {
    let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    nix::fcntl::flock(file.as_raw_fd(), nix::fcntl::FlockArg::LockExclusive).map_err(std::io::Error::from)?;
    Ok(file)
}

#[tokio::main(flavor = "multi_thread")]
async fn run_daemon(cli: Cli) -> std::io::Result<()> {
    let config = Config::from_cli(&cli);
    info!(root = %config.root.display(), backend = %cli.backend, "starting hsmd");

    let registry = Arc::new(Registry::new());
    let backend: Arc<dyn hsm_core::Backend> =
        Arc::new(FileBackend::new(config.backend_prefix.clone(), config.bind_mount_threshold));

    let watcher = Arc::new(PermissionWatcher::new(
        config.root.clone(),
        Arc::clone(&registry),
        Arc::clone(&backend),
    )?);

    let cancel = CancellationToken::new();
    let command_server = Arc::new(
        CommandServer::bind(
            &config.socket_name,
            Arc::clone(&registry),
            Arc::clone(&backend),
            Arc::clone(&watcher),
            config.privileged_uid,
            cancel.clone(),
        )
        .map_err(std::io::Error::from)?,
    );

    let supervisor = Supervisor::new(watcher, command_server, cancel);
    supervisor.run().await
}
