// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A channel: one bidirectional lane between a worker proxy and its worker,
//! bound to a file descriptor and a pair of framed buffers whose mode is
//! picked from the wiring table keyed by (worker type, role).

use std::os::fd::RawFd;
use std::rc::Rc;

use nix::unistd::close;

use sid_core::EventSource;

use crate::buffer::{BufferMode, RxBuffer, TxBuffer};
use crate::channel_spec::{ChannelSpec, RxSpec, TxSpec, Wire};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Proxy,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Internal,
    External,
}

/// Picks the rx/tx buffer mode for one endpoint, per the channel wiring
/// table: internal workers frame both directions with size-prefix; external
/// workers carry plain, unframed bytes, and only on the proxy side (the
/// worker side of an external channel has no framed buffer at all — it's
/// just the child's redirected stdio).
pub fn buffer_mode(role: Role, kind: WorkerKind) -> Option<BufferMode> {
    match (role, kind) {
        (Role::Worker, WorkerKind::Internal) => Some(BufferMode::SizePrefix),
        (Role::Proxy, WorkerKind::Internal) => Some(BufferMode::SizePrefix),
        (Role::Worker, WorkerKind::External) => None,
        (Role::Proxy, WorkerKind::External) => Some(BufferMode::Plain),
    }
}

pub struct Channel {
    pub spec: Rc<ChannelSpec>,
    pub role: Role,
    pub fd: Option<RawFd>,
    pub rx: Option<RxBuffer>,
    pub tx: Option<TxBuffer>,
    /// The channel's registered readability source, if any. Dropping this
    /// (e.g. on EOF) unregisters it from the owning event loop.
    pub io_source: Option<EventSource>,
}

impl Channel {
    pub fn new(spec: Rc<ChannelSpec>, role: Role, fd: Option<RawFd>, kind: WorkerKind) -> Self {
        let (rx, tx) = match buffer_mode(role, kind) {
            Some(mode) => (Some(RxBuffer::new(mode)), Some(TxBuffer::new(mode))),
            None => (None, None),
        };
        Self {
            spec,
            role,
            fd,
            rx,
            tx,
            io_source: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn rx_spec(&self) -> &RxSpec {
        match self.role {
            Role::Proxy => &self.spec.proxy_rx,
            Role::Worker => &self.spec.worker_rx,
        }
    }

    pub fn tx_spec(&self) -> &TxSpec {
        match self.role {
            Role::Proxy => &self.spec.proxy_tx,
            Role::Worker => &self.spec.worker_tx,
        }
    }

    pub fn close(&mut self) -> Result<()> {
        if let Some(fd) = self.fd.take() {
            close(fd).map_err(crate::error::Error::from)?;
        }
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            let _ = close(fd);
        }
    }
}

/// Marks `fd` non-blocking. Pipe ends created by `pipe()` default to
/// blocking; the reactor's single-threaded cooperative loop needs every
/// channel FD to never block the process on read or write, the same
/// guarantee `SOCK_NONBLOCK` already gives the socket-wire case.
fn set_nonblocking(fd: RawFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    let flags = OFlag::from_bits_truncate(fcntl(borrowed, FcntlArg::F_GETFL).map_err(crate::error::Error::from)?);
    fcntl(borrowed, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(crate::error::Error::from)?;
    Ok(())
}

/// The two raw FDs produced for one channel spec at fork time, before the
/// parent/child split each close the end they don't own.
pub struct ChannelFds {
    pub proxy_fd: Option<RawFd>,
    pub worker_fd: Option<RawFd>,
}

impl ChannelSpec {
    pub fn create_fds(&self) -> Result<ChannelFds> {
        use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
        use nix::unistd::pipe;

        Ok(match self.wire {
            Wire::None => ChannelFds {
                proxy_fd: None,
                worker_fd: None,
            },
            Wire::PipeToWorker => {
                let (read_end, write_end) = pipe().map_err(crate::error::Error::from)?;
                let (read_end, write_end): (RawFd, RawFd) = (read_end.into(), write_end.into());
                set_nonblocking(read_end)?;
                set_nonblocking(write_end)?;
                ChannelFds {
                    proxy_fd: Some(write_end),
                    worker_fd: Some(read_end),
                }
            }
            Wire::PipeToProxy => {
                let (read_end, write_end) = pipe().map_err(crate::error::Error::from)?;
                let (read_end, write_end): (RawFd, RawFd) = (read_end.into(), write_end.into());
                set_nonblocking(read_end)?;
                set_nonblocking(write_end)?;
                ChannelFds {
                    proxy_fd: Some(read_end),
                    worker_fd: Some(write_end),
                }
            }
            Wire::Socket => {
                let (a, b) = socketpair(
                    AddressFamily::Unix,
                    SockType::Stream,
                    None,
                    SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
                )
                .map_err(crate::error::Error::from)?;
                ChannelFds {
                    proxy_fd: Some(a.into()),
                    worker_fd: Some(b.into()),
                }
            }
        })
    }
}
