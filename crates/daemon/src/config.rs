// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-scoped configuration (§6, §9 "Global configuration"). Parsed
//! once in `main` and handed down to the servers as a dependency; workers
//! never reach back into environment state themselves.

use std::path::PathBuf;

use clap::Parser;

/// Command-line surface of the `hsmd` binary.
///
/// With none of `-c`/`-m`/`-u`/`-s` given, the process becomes the daemon:
/// it subscribes `root` for permission events and serves the command
/// socket until signalled. With one of them given, the process instead
/// acts as a one-shot CLI client against an already-running daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "hsmd", about = "Hierarchical storage management daemon")]
pub struct Cli {
    /// Backend plug-in to use.
    #[arg(short = 'b', long = "backend", default_value = "file")]
    pub backend: String,

    /// Backend option in `key=value` form; may be repeated.
    #[arg(short = 'o', long = "option", value_parser = parse_kv)]
    pub options: Vec<(String, String)>,

    /// Backend store prefix directory (§4.4 `prefix`).
    #[arg(short = 'd', long = "directory")]
    pub prefix: Option<PathBuf>,

    /// Send CHECK for `path` to a running daemon and exit.
    #[arg(short = 'c', long = "check")]
    pub check: Option<PathBuf>,

    /// Send MIGRATE for `path` to a running daemon and exit.
    #[arg(short = 'm', long = "migrate")]
    pub migrate: Option<PathBuf>,

    /// Send SETUP (enroll for monitoring) for `path` and exit.
    #[arg(short = 'u', long = "setup")]
    pub setup: Option<PathBuf>,

    /// Send SHUTDOWN to a running daemon and exit.
    #[arg(short = 's', long = "shutdown")]
    pub shutdown: bool,

    /// Logging priority, in syslog terms (0 = emerg .. 7 = debug).
    #[arg(short = 'p', long = "priority", default_value_t = 6)]
    pub priority: u8,

    /// Directory subtree to monitor, when running as the daemon.
    #[arg(required_unless_present_any = ["check", "migrate", "setup", "shutdown"])]
    pub root: Option<PathBuf>,
}

fn parse_kv(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

/// Resolved daemon configuration: what `main` derives from [`Cli`] when it
/// decides to run as the daemon rather than as a one-shot client.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory subtree subscribed for permission events.
    pub root: PathBuf,
    /// Backend store prefix directory.
    pub backend_prefix: PathBuf,
    /// Backend-specific options, verbatim from `-o`.
    pub backend_options: Vec<(String, String)>,
    /// Path to the privileged CLI's abstract-namespace socket name.
    pub socket_name: String,
    /// UID that is allowed to issue privileged commands.
    pub privileged_uid: u32,
    /// Size threshold (bytes) above which `unmigrate` prefers a bind mount
    /// over a streamed copy (§4.4).
    pub bind_mount_threshold: u64,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            root: cli.root.clone().unwrap_or_default(),
            backend_prefix: cli.prefix.clone().unwrap_or_else(|| PathBuf::from("/var/lib/hsmd/backend")),
            backend_options: cli.options.clone(),
            socket_name: "hsmd".to_string(),
            privileged_uid: nix::unistd::geteuid().as_raw(),
            bind_mount_threshold: 1 << 30, // 1 GiB, per §9 scenario 5
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_options() {
        assert_eq!(parse_kv("depth=2"), Ok(("depth".to_string(), "2".to_string())));
        assert!(parse_kv("no-equals-sign").is_err());
    }
}
