// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error kinds for the resource tree and event loop binding.
//!
//! Named by kind rather than by POSIX errno: callers match on the kind, not
//! a raw integer. Each variant's doc comment records the errno it stands in
//! for, since log lines and the wire-level daemon protocol still want that
//! number.

use thiserror::Error;

/// Error kinds produced by `sid-core` and `sid-worker`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid input: empty id, malformed params. `EINVAL`.
    #[error("invalid argument")]
    InvalidArgument,

    /// Unknown or empty channel id. `ECHRNG`.
    #[error("no such channel")]
    NoChannel,

    /// No event-loop-owning ancestor reachable, or no worker/worker-proxy
    /// ancestor reachable. `ENOMEDIUM`.
    #[error("no medium: event loop or worker peer unreachable")]
    NoMedium,

    /// Isolation denied (owns a loop, or has no parent). `EPERM`.
    #[error("operation not permitted")]
    NotPermitted,

    /// Allocation failure. `ENOMEM`.
    #[error("allocation failed")]
    NoMemory,

    /// Required sibling/ancestor resource absent. `ESRCH`.
    #[error("resource not found")]
    NotFound,

    /// Resource or worker-control is busy with a conflicting operation.
    /// `EBUSY`.
    #[error("resource busy")]
    Busy,

    /// Operation unsupported for this resource/worker type. `ENOTSUP`.
    #[error("operation not supported")]
    NotSupported,

    /// No peer reachable on the other end of a channel. `ENOTCONN`.
    #[error("not connected")]
    NotConnected,

    /// Peer closed its end of the channel. `EPIPE`.
    #[error("broken pipe")]
    BrokenPipe,

    /// Underlying I/O failure not covered by a more specific kind above.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::BrokenPipe => Error::BrokenPipe,
            std::io::ErrorKind::NotConnected => Error::NotConnected,
            std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                Error::InvalidArgument
            }
            _ => Error::Io(e.to_string()),
        }
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        match e {
            nix::Error::EPIPE => Error::BrokenPipe,
            nix::Error::ENOTCONN => Error::NotConnected,
            nix::Error::EINVAL => Error::InvalidArgument,
            nix::Error::ENOMEM => Error::NoMemory,
            nix::Error::EBUSY => Error::Busy,
            nix::Error::ESRCH => Error::NotFound,
            _ => Error::Io(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
