// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-lane delivery streams.
//!
//! Output lanes buffer agent-to-client messages: best-effort lanes are a
//! bounded FIFO with silent drops, reliable lanes keep a sliding window for
//! retransmission until the peer acknowledges. Input lanes filter and
//! reorder client-to-agent messages. Oversized submessages are split into
//! FRAGMENT submessages on reliable output lanes and reassembled on reliable
//! input lanes.

pub mod input;
pub mod output;

pub use input::{BestEffortInputStream, ReassemblyBuffer, ReliableInputStream};
pub use output::{BestEffortOutputStream, ReliableOutputStream};

use crate::protocol::{
    serialize_submessage, MessageHeader, Submessage, MESSAGE_HEADER_SIZE,
};
use crate::seq::SeqNum;

/// One outgoing wire message: a header plus submessages appended until the
/// size budget is reached. The sequence number is assigned by the owning
/// stream when the message enters its window.
#[derive(Debug, Clone)]
pub struct OutputMessage {
    header: MessageHeader,
    payload: Vec<u8>,
    budget: usize,
}

impl OutputMessage {
    pub fn new(header: MessageHeader, budget: usize) -> Self {
        Self {
            header,
            payload: Vec::new(),
            budget,
        }
    }

    /// Append a submessage if it fits the remaining budget.
    pub fn append_submessage(&mut self, submsg: &Submessage) -> bool {
        let bytes = serialize_submessage(submsg);
        if MESSAGE_HEADER_SIZE + self.payload.len() + bytes.len() > self.budget {
            return false;
        }
        self.payload.extend_from_slice(&bytes);
        true
    }

    /// Append pre-serialized submessage bytes if they fit.
    pub fn append_raw(&mut self, bytes: &[u8]) -> bool {
        if MESSAGE_HEADER_SIZE + self.payload.len() + bytes.len() > self.budget {
            return false;
        }
        self.payload.extend_from_slice(bytes);
        true
    }

    pub fn set_sequence(&mut self, seq: SeqNum) {
        self.header.sequence_nr = seq.raw();
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Serialized wire form: header + submessages.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MESSAGE_HEADER_SIZE + self.payload.len());
        self.header.write_to(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        ClientKey, DataPayload, ObjectId, StreamId, SUBMESSAGE_HEADER_SIZE,
    };

    fn header() -> MessageHeader {
        MessageHeader {
            session_id: 1,
            stream_id: StreamId(0x80),
            sequence_nr: 0,
            client_key: ClientKey([1, 2, 3, 4]),
        }
    }

    #[test]
    fn test_output_message_budget() {
        // Budget fits the header and one 10-byte DATA submessage, not two.
        let data = Submessage::Data(DataPayload {
            reader_id: ObjectId(1),
            data: vec![0; 4],
        });
        let one = MESSAGE_HEADER_SIZE + SUBMESSAGE_HEADER_SIZE + 6;
        let mut msg = OutputMessage::new(header(), one + 4);
        assert!(msg.append_submessage(&data));
        assert!(!msg.append_submessage(&data));
        assert_eq!(msg.to_bytes().len(), one);
    }

    #[test]
    fn test_output_message_sequence_stamped() {
        let mut msg = OutputMessage::new(header(), 512);
        msg.set_sequence(SeqNum(0x1234));
        let bytes = msg.to_bytes();
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 0x1234);
    }
}
