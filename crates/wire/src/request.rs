// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Request encoding: `cmd_byte || path_nul` (§6). The path is only present
//! for `MIGRATE`/`CHECK`/`MONITOR`/`SETUP`; other commands carry an empty
//! body after the command byte.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use thiserror::Error;

use crate::command::CommandCode;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("empty datagram")]
    Empty,
    #[error("unknown command code {0}")]
    UnknownCommand(u8),
    #[error("path is not NUL-terminated")]
    MissingTerminator,
    #[error("command requires a relative path")]
    MissingPath,
}

/// A decoded request datagram, not yet associated with its ancillary
/// credentials or (for `MIGRATE`) its passed file descriptor — those are
/// layered on by the command server after `recvmsg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: CommandCode,
    pub path: Option<PathBuf>,
}

impl Request {
    pub fn new(command: CommandCode, path: Option<PathBuf>) -> Self {
        Self { command, path }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(2 + self.path.as_ref().map_or(0, |p| p.as_os_str().len()));
        body.push(self.command.as_byte());
        if let Some(path) = &self.path {
            body.extend_from_slice(path.as_os_str().as_bytes());
        }
        body.push(0);
        body
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, RequestError> {
        let (&cmd_byte, rest) = datagram.split_first().ok_or(RequestError::Empty)?;
        let command = CommandCode::from_byte(cmd_byte).ok_or(RequestError::UnknownCommand(cmd_byte))?;

        let nul_pos = rest.iter().position(|&b| b == 0).ok_or(RequestError::MissingTerminator)?;
        let path_bytes = &rest[..nul_pos];

        let path = if path_bytes.is_empty() {
            None
        } else {
            Some(PathBuf::from(OsStr::from_bytes(path_bytes)))
        };

        if command.carries_path() && path.is_none() {
            return Err(RequestError::MissingPath);
        }

        Ok(Self { command, path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_migrate_with_path() {
        let request = Request::new(CommandCode::Migrate, Some(PathBuf::from("data/a.txt")));
        let encoded = request.encode();
        assert_eq!(Request::decode(&encoded), Ok(request));
    }

    #[test]
    fn round_trips_shutdown_without_path() {
        let request = Request::new(CommandCode::Shutdown, None);
        let encoded = request.encode();
        assert_eq!(encoded, vec![CommandCode::Shutdown.as_byte(), 0]);
        assert_eq!(Request::decode(&encoded), Ok(request));
    }

    #[test]
    fn empty_datagram_is_rejected() {
        assert_eq!(Request::decode(&[]), Err(RequestError::Empty));
    }

    #[test]
    fn missing_terminator_is_rejected() {
        assert_eq!(
            Request::decode(&[CommandCode::Check.as_byte(), b'x']),
            Err(RequestError::MissingTerminator)
        );
    }

    #[test]
    fn migrate_without_path_is_rejected() {
        assert_eq!(
            Request::decode(&[CommandCode::Migrate.as_byte(), 0]),
            Err(RequestError::MissingPath)
        );
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert_eq!(Request::decode(&[200, 0]), Err(RequestError::UnknownCommand(200)));
    }
}
