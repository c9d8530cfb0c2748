// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ancillary file-descriptor transfer over a socket-wire channel: one
//! `sendmsg`/`recvmsg` carrying a single sentinel byte (`0xFF`) plus one
//! `SCM_RIGHTS` control message, sent as a second, separate syscall after
//! the frame's ordinary payload has already gone out through the channel's
//! normal write path. Retries on `EAGAIN`/`EINTR`, per the core's blanket
//! "retry only these two" propagation policy.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::RawFd;

use nix::cmsg_space;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};

use crate::error::{Error, Result};

const SENTINEL: u8 = 0xFF;

/// Sends `fd` as ancillary data over `sock_fd`, with a single sentinel byte
/// as the ordinary payload (the socket must otherwise carry no data for
/// this message — `DATA_EXT`'s real payload went out separately already).
pub fn send_fd(sock_fd: RawFd, fd: RawFd) -> Result<()> {
    let byte = [SENTINEL];
    let iov = [IoSlice::new(&byte)];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    loop {
        match sendmsg::<UnixAddr>(sock_fd, &iov, &cmsg, MsgFlags::empty(), None) {
            Ok(_) => return Ok(()),
            Err(nix::Error::EAGAIN) | Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(Error::from(e)),
        }
    }
}

/// Receives one ancillary FD over `sock_fd`. Returns the new, distinct FD
/// the kernel allocated in this process for the same open-file description.
pub fn recv_fd(sock_fd: RawFd) -> Result<RawFd> {
    let mut byte = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut byte)];
    let mut cmsg_buf = cmsg_space!([RawFd; 1]);
    loop {
        let msg = match recvmsg::<UnixAddr>(sock_fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty()) {
            Ok(m) => m,
            Err(nix::Error::EAGAIN) | Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(Error::from(e)),
        };
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(fd) = fds.first() {
                    return Ok(*fd);
                }
            }
        }
        return Err(Error::Core(sid_core::Error::Io(
            "ancillary receive carried no SCM_RIGHTS fd".to_string(),
        )));
    }
}
