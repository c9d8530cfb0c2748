// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use thiserror::Error;

/// `sid-worker`'s own error type. The kind taxonomy lives in
/// `sid_core::Error`; this crate's variant set stays thin and delegates to
/// it rather than re-deriving the same kinds twice.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] sid_core::Error),

    /// A channel spec carried an empty id. `EINVAL`.
    #[error("channel spec id must not be empty")]
    EmptyChannelSpecId,

    /// `run_new_worker` called on an internal worker control, or
    /// `run_worker` called for a worker type that doesn't support it.
    /// `ENOTSUP`.
    #[error("operation not supported for this worker type")]
    UnsupportedForWorkerType,

    /// A worker init was already prepared (double `get_new_worker` before
    /// `run_worker`). `EBUSY`.
    #[error("worker init already prepared")]
    AlreadyPrepared,

    /// `run_worker` called without a prior `get_new_worker`. `ESRCH`.
    #[error("no worker init prepared")]
    NotPrepared,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Core(sid_core::Error::from(e))
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Core(sid_core::Error::from(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
