// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The two framed-buffer disciplines channels speak: size-prefix (internal
//! workers, header = command word) and plain (external workers, message
//! boundary = end-of-stream).

use crate::command::ChannelCommand;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    SizePrefix,
    Plain,
}

/// Accumulates bytes read off a channel FD until one message is complete.
#[derive(Debug)]
pub struct RxBuffer {
    mode: BufferMode,
    data: Vec<u8>,
}

impl RxBuffer {
    pub fn new(mode: BufferMode) -> Self {
        Self {
            mode,
            data: Vec::new(),
        }
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size-prefix only: true once a full frame (length prefix + command +
    /// payload) has arrived.
    pub fn is_complete(&self) -> bool {
        match self.mode {
            BufferMode::Plain => false,
            BufferMode::SizePrefix => match self.frame_len() {
                Some(len) => self.data.len() >= 4 + len,
                None => false,
            },
        }
    }

    fn frame_len(&self) -> Option<usize> {
        if self.data.len() < 4 {
            return None;
        }
        let bytes: [u8; 4] = self.data[0..4].try_into().ok()?;
        Some(u32::from_le_bytes(bytes) as usize)
    }

    /// Splits the command header off a complete size-prefix frame and
    /// leaves any trailing bytes (the start of the next frame) buffered.
    pub fn take_framed(&mut self) -> Result<(ChannelCommand, Vec<u8>)> {
        let len = self.frame_len().ok_or(Error::Core(sid_core::Error::InvalidArgument))?;
        if len < 4 || self.data.len() < 4 + len {
            return Err(Error::Core(sid_core::Error::InvalidArgument));
        }
        let cmd_bytes: [u8; 4] = self.data[4..8]
            .try_into()
            .map_err(|_| Error::Core(sid_core::Error::InvalidArgument))?;
        let cmd = ChannelCommand::from_u32(u32::from_le_bytes(cmd_bytes))?;
        let payload = self.data[8..4 + len].to_vec();
        self.data.drain(0..4 + len);
        Ok((cmd, payload))
    }

    /// Plain mode: drains everything accumulated so far. Called once EOF is
    /// observed.
    pub fn take_plain(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    pub fn reset(&mut self) {
        self.data.clear();
    }
}

/// Accumulates bytes to write for one outgoing message.
#[derive(Debug)]
pub struct TxBuffer {
    mode: BufferMode,
    data: Vec<u8>,
    cursor: usize,
}

impl TxBuffer {
    pub fn new(mode: BufferMode) -> Self {
        Self {
            mode,
            data: Vec::new(),
            cursor: 0,
        }
    }

    /// Stages one message. `cmd` is `None` for plain-mode channels (no
    /// command header is ever written on those).
    pub fn prepare(&mut self, cmd: Option<ChannelCommand>, payload: &[u8]) {
        self.data.clear();
        self.cursor = 0;
        match self.mode {
            BufferMode::SizePrefix => {
                let cmd = cmd.unwrap_or(ChannelCommand::Data);
                let len = 4u32 + payload.len() as u32;
                self.data.extend_from_slice(&len.to_le_bytes());
                self.data.extend_from_slice(&cmd.as_u32().to_le_bytes());
                self.data.extend_from_slice(payload);
            }
            BufferMode::Plain => {
                self.data.extend_from_slice(payload);
            }
        }
    }

    pub fn remaining(&self) -> &[u8] {
        &self.data[self.cursor..]
    }

    pub fn advance(&mut self, n: usize) {
        self.cursor += n;
    }

    pub fn is_drained(&self) -> bool {
        self.cursor >= self.data.len()
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_prefix_round_trip() {
        let mut tx = TxBuffer::new(BufferMode::SizePrefix);
        tx.prepare(Some(ChannelCommand::Data), b"hi!");
        let mut rx = RxBuffer::new(BufferMode::SizePrefix);
        rx.feed(tx.remaining());
        assert!(rx.is_complete());
        let (cmd, payload) = rx.take_framed().unwrap();
        assert_eq!(cmd, ChannelCommand::Data);
        assert_eq!(payload, b"hi!");
        assert!(rx.is_empty());
    }

    #[test]
    fn size_prefix_handles_partial_feeds() {
        let mut tx = TxBuffer::new(BufferMode::SizePrefix);
        tx.prepare(Some(ChannelCommand::Yield), b"");
        let frame = tx.remaining().to_vec();
        let mut rx = RxBuffer::new(BufferMode::SizePrefix);
        rx.feed(&frame[..2]);
        assert!(!rx.is_complete());
        rx.feed(&frame[2..]);
        assert!(rx.is_complete());
        let (cmd, payload) = rx.take_framed().unwrap();
        assert_eq!(cmd, ChannelCommand::Yield);
        assert!(payload.is_empty());
    }

    #[test]
    fn size_prefix_preserves_two_back_to_back_messages_in_order() {
        let mut tx = TxBuffer::new(BufferMode::SizePrefix);
        tx.prepare(Some(ChannelCommand::Data), b"one");
        let mut combined = tx.remaining().to_vec();
        tx.prepare(Some(ChannelCommand::Data), b"two");
        combined.extend_from_slice(tx.remaining());

        let mut rx = RxBuffer::new(BufferMode::SizePrefix);
        rx.feed(&combined);
        let (_, first) = rx.take_framed().unwrap();
        assert_eq!(first, b"one");
        assert!(rx.is_complete());
        let (_, second) = rx.take_framed().unwrap();
        assert_eq!(second, b"two");
    }

    #[test]
    fn plain_mode_never_reports_complete_and_accumulates_until_drained() {
        let mut rx = RxBuffer::new(BufferMode::Plain);
        rx.feed(b"A\n");
        rx.feed(b"B\n");
        assert!(!rx.is_complete());
        assert_eq!(rx.take_plain(), b"A\nB\n");
    }
}

/// Property tests for the size-prefix framing round-trip: whatever payload
/// and command `chan_send` stages, the receive side must recover
/// byte-for-byte, however the bytes arrive split across `feed` calls — one
/// `read()` off a pipe rarely lands on a frame boundary.
#[cfg(test)]
mod framing_properties {
    use super::*;
    use proptest::prelude::*;

    fn command_strategy() -> impl Strategy<Value = ChannelCommand> {
        prop_oneof![
            Just(ChannelCommand::Noop),
            Just(ChannelCommand::Yield),
            Just(ChannelCommand::Data),
            Just(ChannelCommand::DataExt),
        ]
    }

    proptest! {
        /// Invariant: a single complete frame decodes to exactly the command
        /// and payload that were staged, regardless of payload size.
        #[test]
        fn single_frame_round_trips(cmd in command_strategy(), payload in prop::collection::vec(any::<u8>(), 0..512)) {
            let mut tx = TxBuffer::new(BufferMode::SizePrefix);
            tx.prepare(Some(cmd), &payload);
            let mut rx = RxBuffer::new(BufferMode::SizePrefix);
            rx.feed(tx.remaining());
            prop_assert!(rx.is_complete());
            let (got_cmd, got_payload) = rx.take_framed().unwrap();
            prop_assert_eq!(got_cmd, cmd);
            prop_assert_eq!(got_payload, payload);
            prop_assert!(rx.is_empty());
        }

        /// Invariant: splitting the same frame into arbitrarily small chunks
        /// before feeding it never changes the decoded result — the buffer
        /// must not report completion early on a partial frame, nor lose
        /// bytes once the rest arrives.
        #[test]
        fn arbitrary_chunking_round_trips(
            cmd in command_strategy(),
            payload in prop::collection::vec(any::<u8>(), 0..256),
            chunk_size in 1usize..7,
        ) {
            let mut tx = TxBuffer::new(BufferMode::SizePrefix);
            tx.prepare(Some(cmd), &payload);
            let frame = tx.remaining().to_vec();

            let mut rx = RxBuffer::new(BufferMode::SizePrefix);
            for chunk in frame.chunks(chunk_size) {
                rx.feed(chunk);
            }
            prop_assert!(rx.is_complete());
            let (got_cmd, got_payload) = rx.take_framed().unwrap();
            prop_assert_eq!(got_cmd, cmd);
            prop_assert_eq!(got_payload, payload);
        }

        /// Invariant: N back-to-back messages decode in the same order they
        /// were staged, with no interleaving — the FIFO-ordering guarantee
        /// size-prefix framing exists to provide.
        #[test]
        fn sequence_of_frames_preserves_order(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..8),
        ) {
            let mut tx = TxBuffer::new(BufferMode::SizePrefix);
            let mut combined = Vec::new();
            for p in &payloads {
                tx.prepare(Some(ChannelCommand::Data), p);
                combined.extend_from_slice(tx.remaining());
            }

            let mut rx = RxBuffer::new(BufferMode::SizePrefix);
            rx.feed(&combined);
            for expected in &payloads {
                prop_assert!(rx.is_complete());
                let (cmd, payload) = rx.take_framed().unwrap();
                prop_assert_eq!(cmd, ChannelCommand::Data);
                prop_assert_eq!(&payload, expected);
            }
            prop_assert!(rx.is_empty());
        }
    }
}
