// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker control: fork/exec orchestration, channel wiring, framed message
//! passing, and the worker-proxy lifecycle state machine built on top of
//! `sid-core`'s resource tree and event loop binding.
//!
//! `fork`, `dup2`, `prctl`, `sendmsg`/`recvmsg` with `SCM_RIGHTS`, and
//! wrapping a channel's raw FD for `read`/`write` are unsafe by nature in
//! `nix`'s bindings; this crate overrides the workspace's blanket
//! `unsafe_code = "forbid"` lint and confines every unsafe call to the
//! `spawn` and `fd_pass` modules, plus the narrow `BorrowedFd::borrow_raw`
//! wrapping in `control`'s channel I/O.
#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod buffer;
pub mod channel;
pub mod channel_spec;
pub mod command;
pub mod control;
pub mod error;
pub mod fd_pass;
pub mod spawn;
pub mod worker;

pub use channel::{Channel, Role, WorkerKind};
pub use channel_spec::{ChannelSpec, ExtWireExtension, RxCallback, RxSpec, TxCallback, TxSpec, Wire};
pub use command::ChannelCommand;
pub use control::{
    ExternalParams, OnYield, Params, TimeoutSpec, WorkerControl, WorkerControlConfig, WorkerKindConfig,
    WORKER_CONTROL_TYPE,
};
pub use error::{Error, Result};
pub use worker::{WorkerProxyData, WorkerState, WORKER_PROXY_TYPE, WORKER_PROXY_WITH_LOOP_TYPE, WORKER_TYPE};
