// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error kinds shared by every subsystem, with a stable numeric mapping for
//! the CLI wire protocol (§7 of the design).

use std::io;

use thiserror::Error;

/// A coarse error classification. Every kind round-trips through a single
/// byte on the wire so a CLI client can render a verdict without linking
/// against this crate's error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Busy,
    Stale,
    DeviceFull,
    PermissionDenied,
    Io,
    Interrupted,
    Unsupported,
    InvalidArgument,
    Timeout,
}

impl ErrorKind {
    /// Numeric code carried on the CLI wire. `0` is reserved for success and
    /// is never returned here.
    pub const fn code(self) -> u8 {
        match self {
            ErrorKind::NotFound => 1,
            ErrorKind::AlreadyExists => 2,
            ErrorKind::Busy => 3,
            ErrorKind::Stale => 4,
            ErrorKind::DeviceFull => 5,
            ErrorKind::PermissionDenied => 6,
            ErrorKind::Io => 7,
            ErrorKind::Interrupted => 8,
            ErrorKind::Unsupported => 9,
            ErrorKind::InvalidArgument => 10,
            ErrorKind::Timeout => 11,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => ErrorKind::NotFound,
            2 => ErrorKind::AlreadyExists,
            3 => ErrorKind::Busy,
            4 => ErrorKind::Stale,
            5 => ErrorKind::DeviceFull,
            6 => ErrorKind::PermissionDenied,
            7 => ErrorKind::Io,
            8 => ErrorKind::Interrupted,
            9 => ErrorKind::Unsupported,
            10 => ErrorKind::InvalidArgument,
            11 => ErrorKind::Timeout,
            _ => return None,
        })
    }

    /// Classify a raw `errno` value as observed from a `nix`/`libc` call.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => ErrorKind::NotFound,
            libc::EEXIST => ErrorKind::AlreadyExists,
            libc::EBUSY | libc::EAGAIN => ErrorKind::Busy,
            libc::ENOSPC => ErrorKind::DeviceFull,
            libc::EACCES | libc::EPERM => ErrorKind::PermissionDenied,
            libc::EINTR => ErrorKind::Interrupted,
            libc::ENOTSUP => ErrorKind::Unsupported,
            libc::EINVAL => ErrorKind::InvalidArgument,
            libc::ETIMEDOUT => ErrorKind::Timeout,
            _ => ErrorKind::Io,
        }
    }
}

/// The crate-wide error type. Every fallible operation in the daemon either
/// returns this directly or wraps it with `#[from]`.
#[derive(Debug, Error)]
pub enum HsmError {
    #[error("{0:?}")]
    Kind(ErrorKind),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

impl HsmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HsmError::Kind(k) => *k,
            HsmError::Io(e) => e
                .raw_os_error()
                .map(ErrorKind::from_errno)
                .unwrap_or(ErrorKind::Io),
            HsmError::Nix(e) => ErrorKind::from_errno(*e as i32),
        }
    }

    /// Numeric code for the CLI wire, `0` reserved for success.
    pub fn code(&self) -> u8 {
        self.kind().code()
    }
}

impl From<ErrorKind> for HsmError {
    fn from(kind: ErrorKind) -> Self {
        HsmError::Kind(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trips_through_from_code() {
        for kind in [
            ErrorKind::NotFound,
            ErrorKind::AlreadyExists,
            ErrorKind::Busy,
            ErrorKind::Stale,
            ErrorKind::DeviceFull,
            ErrorKind::PermissionDenied,
            ErrorKind::Io,
            ErrorKind::Interrupted,
            ErrorKind::Unsupported,
            ErrorKind::InvalidArgument,
            ErrorKind::Timeout,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
        }
    }

    #[test]
    fn code_zero_is_unused() {
        for kind_code in 1u8..=11 {
            assert!(ErrorKind::from_code(kind_code).is_some());
        }
        assert_eq!(ErrorKind::from_code(0), None);
    }

    #[test]
    fn errno_classification() {
        assert_eq!(ErrorKind::from_errno(libc::ENOSPC), ErrorKind::DeviceFull);
        assert_eq!(ErrorKind::from_errno(libc::EBUSY), ErrorKind::Busy);
        assert_eq!(ErrorKind::from_errno(999_999), ErrorKind::Io);
    }
}
