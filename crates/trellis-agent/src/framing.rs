// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing for stream transports.
//!
//! A byte socket has no message boundaries. Each wire message is framed as
//! `[length: u16 LE][payload]`; a length of zero is a no-op heartbeat
//! frame. The decoder is a resumable state machine: whenever a read would
//! block it returns control to the caller with all partial progress saved,
//! so one I/O thread can service many non-blocking connections. The same
//! byte stream produces the same sequence of completed messages no matter
//! how reads are chunked.

use std::io::{self, Read};

use crate::error::AgentError;

/// Frame header size (2 bytes for length).
pub const FRAME_HEADER_SIZE: usize = 2;

/// Persisted decode state between invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for a length prefix.
    Empty,
    /// Only the low prefix byte has arrived.
    SizeIncomplete { low: u8 },
    /// Prefix complete, no payload bytes read yet.
    SizeRead { size: usize },
    /// Partial payload buffered.
    MessageIncomplete { size: usize, filled: usize },
}

/// Resumable frame decoder. One instance per connection.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    buffer: Vec<u8>,
    max_size: usize,
}

impl FrameDecoder {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: DecodeState::Empty,
            buffer: Vec::new(),
            max_size,
        }
    }

    /// Pull bytes from `reader` until a frame completes or the read would
    /// block.
    ///
    /// - `Ok(Some(payload))`: a complete message; state is back to empty.
    /// - `Ok(None)`: no data yet; call again on the next readable event.
    /// - `Err(ConnectionClosed)`: the peer closed the stream.
    /// - `Err(Io(..))`: socket error; the caller closes the connection.
    pub fn decode<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
    ) -> Result<Option<Vec<u8>>, AgentError> {
        loop {
            match self.state {
                DecodeState::Empty => {
                    let mut prefix = [0u8; FRAME_HEADER_SIZE];
                    match read_some(reader, &mut prefix)? {
                        0 => return Ok(None),
                        1 => {
                            self.state = DecodeState::SizeIncomplete { low: prefix[0] };
                        }
                        _ => self.on_size(u16::from_le_bytes(prefix))?,
                    }
                }
                DecodeState::SizeIncomplete { low } => {
                    let mut high = [0u8; 1];
                    match read_some(reader, &mut high)? {
                        0 => return Ok(None),
                        _ => self.on_size(u16::from_le_bytes([low, high[0]]))?,
                    }
                }
                DecodeState::SizeRead { size } => {
                    self.buffer.resize(size, 0);
                    match read_some(reader, &mut self.buffer[..])? {
                        0 => return Ok(None),
                        n if n == size => {
                            self.state = DecodeState::Empty;
                            return Ok(Some(std::mem::take(&mut self.buffer)));
                        }
                        n => {
                            self.state = DecodeState::MessageIncomplete { size, filled: n };
                        }
                    }
                }
                DecodeState::MessageIncomplete { size, filled } => {
                    match read_some(reader, &mut self.buffer[filled..size])? {
                        0 => return Ok(None),
                        n => {
                            let filled = filled + n;
                            if filled == size {
                                self.state = DecodeState::Empty;
                                return Ok(Some(std::mem::take(&mut self.buffer)));
                            }
                            self.state = DecodeState::MessageIncomplete { size, filled };
                        }
                    }
                }
            }
        }
    }

    fn on_size(&mut self, size: u16) -> Result<(), AgentError> {
        if size == 0 {
            // Heartbeat no-op frame.
            self.state = DecodeState::Empty;
            return Ok(());
        }
        let size = usize::from(size);
        if size > self.max_size {
            return Err(AgentError::FrameTooLarge(size));
        }
        self.state = DecodeState::SizeRead { size };
        Ok(())
    }

    /// True while a frame is partially buffered.
    pub fn is_partial(&self) -> bool {
        self.state != DecodeState::Empty
    }

    /// Drop partial progress (connection re-establishment).
    pub fn reset(&mut self) {
        self.state = DecodeState::Empty;
        self.buffer.clear();
    }

    /// Frame a payload: `[len u16 LE][payload]`.
    pub fn encode(payload: &[u8]) -> Result<Vec<u8>, AgentError> {
        if payload.len() > usize::from(u16::MAX) {
            return Err(AgentError::FrameTooLarge(payload.len()));
        }
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(payload);
        Ok(frame)
    }

    /// The zero-length keepalive frame.
    pub fn heartbeat_frame() -> [u8; FRAME_HEADER_SIZE] {
        [0, 0]
    }
}

/// One read attempt. 0 means "no data yet" (WouldBlock); a peer close or a
/// socket error is surfaced as Err.
fn read_some<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize, AgentError> {
    loop {
        match reader.read(buf) {
            Ok(0) => return Err(AgentError::ConnectionClosed),
            Ok(n) => return Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
