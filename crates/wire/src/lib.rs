// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! hsm-wire: the CLI-to-daemon datagram protocol (§6).
//!
//! The wire format is deliberately minimal — it is carried over a single
//! `SOCK_DGRAM` Unix socket, with the file handle for `MIGRATE` passed out
//! of band via `SCM_RIGHTS` and the sender's credentials via
//! `SCM_CREDENTIALS`. Everything in this crate is pure data: encoding,
//! decoding, and the credential check. The socket I/O itself lives in
//! `hsm-daemon`, which is the only crate that needs an async runtime.

mod command;
mod credentials;
mod request;
mod response;

pub use command::CommandCode;
pub use credentials::Credentials;
pub use request::{Request, RequestError};
pub use response::Response;
