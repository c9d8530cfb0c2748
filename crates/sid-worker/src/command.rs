// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The 4-byte channel command header used on size-prefix channels.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCommand {
    Noop = 0,
    Yield = 1,
    Data = 2,
    DataExt = 3,
}

impl ChannelCommand {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(ChannelCommand::Noop),
            1 => Ok(ChannelCommand::Yield),
            2 => Ok(ChannelCommand::Data),
            3 => Ok(ChannelCommand::DataExt),
            _ => Err(Error::Core(sid_core::Error::InvalidArgument)),
        }
    }

    /// Whether this command carries an ancillary `SCM_RIGHTS` FD transfer
    /// (socket wires only).
    pub fn carries_fd(self) -> bool {
        matches!(self, ChannelCommand::DataExt)
    }
}
