// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Channel specs: the construction-time description of one bidirectional
//! lane between a worker proxy and its worker, deep-copied once into the
//! worker-control resource's data.

use std::os::fd::RawFd;
use std::rc::Rc;

use sid_core::Resource;

use crate::command::ChannelCommand;
use crate::error::{Error, Result};

/// How a channel's two file descriptors are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wire {
    /// No FDs are created; the channel carries no traffic.
    None,
    /// A pipe; the proxy keeps the write end, the worker the read end.
    PipeToWorker,
    /// A pipe; the worker keeps the write end, the proxy the read end.
    PipeToProxy,
    /// A non-blocking, close-on-exec `SOCK_STREAM` pair.
    Socket,
}

/// Invoked when a message completes on this endpoint. `cmd` is `None` for
/// plain-mode (external worker) channels, which carry no command header. The
/// trailing `Option<RawFd>` is the FD received alongside a `DATA_EXT`
/// message (socket wires only); the callback owns it and is responsible for
/// closing it.
pub type RxCallback = Rc<dyn Fn(&Resource, Option<ChannelCommand>, &[u8], Option<RawFd>) -> Result<()>>;

/// Invoked just before a message is written. A negative-signalling `Err` is
/// logged as a warning but does not abort the send, per the send algorithm.
/// The trailing `Option<RawFd>` mirrors the FD `chan_send`'s caller asked to
/// pass alongside this message, if any.
pub type TxCallback = Rc<dyn Fn(&Resource, Option<ChannelCommand>, &[u8], Option<RawFd>) -> Result<()>>;

#[derive(Clone, Default)]
pub struct RxSpec {
    /// Bytes appended in memory after a plain-mode message completes
    /// (end-of-stream); ignored on size-prefix channels.
    pub data_suffix: Option<Vec<u8>>,
    pub callback: Option<RxCallback>,
}

#[derive(Clone, Default)]
pub struct TxSpec {
    pub callback: Option<TxCallback>,
}

/// The redirect target for an "external wire extension": the worker side
/// `dup2`s its channel FD onto this FD (e.g. the child's stdin/stdout) and
/// closes the original, after channel buffer setup.
#[derive(Debug, Clone, Copy)]
pub struct ExtWireExtension {
    pub redirect_fd: RawFd,
}

#[derive(Clone)]
pub struct ChannelSpec {
    pub id: String,
    pub wire: Wire,
    pub proxy_rx: RxSpec,
    pub proxy_tx: TxSpec,
    pub worker_rx: RxSpec,
    pub worker_tx: TxSpec,
    pub ext_wire_extension: Option<ExtWireExtension>,
}

impl ChannelSpec {
    pub fn new(id: impl Into<String>, wire: Wire) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::EmptyChannelSpecId);
        }
        Ok(Self {
            id,
            wire,
            proxy_rx: RxSpec::default(),
            proxy_tx: TxSpec::default(),
            worker_rx: RxSpec::default(),
            worker_tx: TxSpec::default(),
            ext_wire_extension: None,
        })
    }

    pub fn with_ext_wire_extension(mut self, redirect_fd: RawFd) -> Self {
        self.ext_wire_extension = Some(ExtWireExtension { redirect_fd });
        self
    }
}

/// Deep-copies `specs` into a fresh, independently owned `Vec`. Validates
/// that every id is non-empty (construction already enforces this, but a
/// caller may hand-build a `Vec<ChannelSpec>` directly).
///
/// A `Vec<ChannelSpec>` clone gives a pointer-independent copy of the
/// caller's specs in one step, with no shared state surviving into the
/// worker-control resource.
pub fn deep_copy_channel_specs(specs: &[ChannelSpec]) -> Result<Vec<ChannelSpec>> {
    for spec in specs {
        if spec.id.is_empty() {
            return Err(Error::EmptyChannelSpecId);
        }
    }
    Ok(specs.to_vec())
}

impl std::fmt::Debug for ChannelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSpec")
            .field("id", &self.id)
            .field("wire", &self.wire)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_id_rejected() {
        assert_eq!(
            ChannelSpec::new("", Wire::PipeToWorker).unwrap_err(),
            Error::EmptyChannelSpecId
        );
    }

    #[test]
    fn deep_copy_is_pointer_independent_of_input() {
        let original = vec![ChannelSpec::new("req", Wire::PipeToWorker).unwrap()];
        let copied = deep_copy_channel_specs(&original).unwrap();
        assert_eq!(copied.len(), original.len());
        assert_eq!(copied[0].id, original[0].id);
        drop(original);
        assert_eq!(copied[0].id, "req");
    }
}
