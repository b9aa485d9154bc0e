// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Crate-wide error type.
//
// All parsing is safe: malformed input returns Err, never panics.

use std::fmt;

/// Errors produced by the trellis agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// Not enough bytes to parse a header / payload.
    BufferTooShort,
    /// Unknown submessage id.
    UnknownSubmessageId(u8),
    /// Unknown object kind byte.
    UnknownObjectKind(u8),
    /// Unknown status code.
    UnknownStatusCode(u8),
    /// Unknown representation tag byte.
    UnknownRepresentation(u8),
    /// Payload length does not match the expected size.
    PayloadLengthMismatch,
    /// Frame payload exceeds what the 2-byte length prefix can carry.
    FrameTooLarge(usize),
    /// The peer closed the connection.
    ConnectionClosed,
    /// A transport-level I/O error (message only, not the original error).
    Io(String),
    /// Fragmentation / reassembly error.
    FragmentError(String),
    /// Bridge error forwarded from the middleware side.
    BridgeError(String),
    /// Configuration validation error.
    ConfigError(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooShort => write!(f, "buffer too short"),
            Self::UnknownSubmessageId(id) => write!(f, "unknown submessage id: 0x{:02x}", id),
            Self::UnknownObjectKind(k) => write!(f, "unknown object kind: 0x{:02x}", k),
            Self::UnknownStatusCode(c) => write!(f, "unknown status code: 0x{:02x}", c),
            Self::UnknownRepresentation(t) => write!(f, "unknown representation tag: 0x{:02x}", t),
            Self::PayloadLengthMismatch => write!(f, "payload length mismatch"),
            Self::FrameTooLarge(n) => write!(f, "frame payload too large: {} bytes", n),
            Self::ConnectionClosed => write!(f, "connection closed by peer"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
            Self::FragmentError(msg) => write!(f, "fragment error: {}", msg),
            Self::BridgeError(msg) => write!(f, "bridge error: {}", msg),
            Self::ConfigError(msg) => write!(f, "config error: {}", msg),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
