// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Outgoing stream lanes.
//
// Best-effort: bounded FIFO, a full queue drops the push, nothing is
// retransmitted. Reliable: sliding window keyed by sequence number with
// three watermarks:
//
//   last_acked <= last_sent <= last_available
//
// The buffer retains exactly (last_acked, last_available]. Buffering ahead
// of transmission (last_available beyond last_sent) lets fragment assembly
// proceed independently of pacing, while the single depth bound keeps
// memory bounded no matter how slowly the peer acknowledges.

use std::collections::{BTreeMap, VecDeque};

use crate::protocol::{
    serialize_submessage, ClientKey, FragmentPayload, HeartbeatPayload, MessageHeader,
    StreamId, Submessage, MESSAGE_HEADER_SIZE, SUBMESSAGE_HEADER_SIZE,
};
use crate::seq::SeqNum;
use crate::stream::OutputMessage;

/// Fragment submessage overhead: submessage header + fragment_nr + total.
const FRAGMENT_OVERHEAD: usize = SUBMESSAGE_HEADER_SIZE + 4;

// ---------------------------------------------------------------------------
// Best-effort output stream
// ---------------------------------------------------------------------------

/// Bounded FIFO of outgoing messages for a non-guaranteed lane.
#[derive(Debug)]
pub struct BestEffortOutputStream {
    session_id: u8,
    stream_id: StreamId,
    client_key: ClientKey,
    /// Last sequence number handed out, housekeeping only.
    last_send: SeqNum,
    depth: usize,
    budget: usize,
    messages: VecDeque<OutputMessage>,
}

impl BestEffortOutputStream {
    pub fn new(
        session_id: u8,
        stream_id: StreamId,
        client_key: ClientKey,
        depth: usize,
        budget: usize,
    ) -> Self {
        Self {
            session_id,
            stream_id,
            client_key,
            last_send: SeqNum::SENTINEL,
            depth,
            budget,
            messages: VecDeque::new(),
        }
    }

    fn header(&self) -> MessageHeader {
        MessageHeader {
            session_id: self.session_id,
            stream_id: self.stream_id,
            sequence_nr: 0,
            client_key: self.client_key,
        }
    }

    /// Enqueue a message. Returns false without mutation when the queue is
    /// at capacity; the caller decides what to do (typically drop).
    pub fn push_message(&mut self, message: OutputMessage) -> bool {
        if self.messages.len() >= self.depth {
            return false;
        }
        self.messages.push_back(message);
        true
    }

    /// Wrap a single submessage into a new message and enqueue it. Rejects
    /// a submessage too large for one message: fragmentation is a
    /// reliable-lane capability.
    pub fn push_submessage(&mut self, submsg: &Submessage) -> bool {
        if self.messages.len() >= self.depth {
            return false;
        }
        let mut message = OutputMessage::new(self.header(), self.budget);
        if !message.append_submessage(submsg) {
            return false;
        }
        self.messages.push_back(message);
        true
    }

    /// Dequeue the oldest pending message, stamped with the next sequence
    /// number. Success is signalled iff a message is produced.
    pub fn pop_message(&mut self) -> Option<OutputMessage> {
        let mut message = self.messages.pop_front()?;
        self.last_send = self.last_send.next();
        message.set_sequence(self.last_send);
        Some(message)
    }

    pub fn pending(&self) -> usize {
        self.messages.len()
    }

    /// Clear the last-delivered marker and the queue (session
    /// re-establishment).
    pub fn reset(&mut self) {
        self.last_send = SeqNum::SENTINEL;
        self.messages.clear();
    }
}

// ---------------------------------------------------------------------------
// Reliable output stream
// ---------------------------------------------------------------------------

/// Sliding-window buffer of outgoing messages keyed by sequence number.
#[derive(Debug)]
pub struct ReliableOutputStream {
    session_id: u8,
    stream_id: StreamId,
    client_key: ClientKey,
    last_available: SeqNum,
    last_sent: SeqNum,
    last_acked: SeqNum,
    depth: u16,
    budget: usize,
    messages: BTreeMap<u16, OutputMessage>,
}

impl ReliableOutputStream {
    pub fn new(
        session_id: u8,
        stream_id: StreamId,
        client_key: ClientKey,
        depth: u16,
        budget: usize,
    ) -> Self {
        Self {
            session_id,
            stream_id,
            client_key,
            last_available: SeqNum::SENTINEL,
            last_sent: SeqNum::SENTINEL,
            last_acked: SeqNum::SENTINEL,
            depth,
            budget,
            messages: BTreeMap::new(),
        }
    }

    fn header(&self) -> MessageHeader {
        MessageHeader {
            session_id: self.session_id,
            stream_id: self.stream_id,
            sequence_nr: 0,
            client_key: self.client_key,
        }
    }

    /// Push a message for immediate transmission. Succeeds only while
    /// `last_sent - last_acked < depth`; a false return is the back-pressure
    /// signal and leaves the window untouched.
    pub fn push_message(&mut self, mut message: OutputMessage) -> bool {
        if self.last_sent.diff(self.last_acked) >= i32::from(self.depth) {
            return false;
        }
        self.last_sent = self.last_sent.next();
        if self.last_available < self.last_sent {
            self.last_available = self.last_sent;
        }
        message.set_sequence(self.last_sent);
        self.messages.insert(self.last_sent.raw(), message);
        true
    }

    /// Buffered message for retransmission. A miss means the peer asked for
    /// a sequence number already pruned (a timing anomaly, not a fault).
    pub fn get_message(&self, seq: SeqNum) -> Option<Vec<u8>> {
        self.messages.get(&seq.raw()).map(OutputMessage::to_bytes)
    }

    /// Advance `last_acked` toward `first_unacked - 1`, erasing each newly
    /// acknowledged message. Monotonic prefix acknowledgment: regressive or
    /// out-of-window values are ignored, and the watermark never passes
    /// `last_sent`; acknowledgment fields come from the remote peer and
    /// are clamped, not trusted.
    pub fn update_from_acknack(&mut self, first_unacked: SeqNum) {
        while self.last_acked.next() < first_unacked && self.last_acked < self.last_sent {
            self.last_acked = self.last_acked.next();
            self.messages.remove(&self.last_acked.raw());
        }
    }

    /// Buffer a submessage ahead of transmission, fragmenting when it does
    /// not fit one message. Returns false without mutation when the window
    /// cannot take all needed messages.
    pub fn push_submessage(&mut self, submsg: &Submessage) -> bool {
        let bytes = serialize_submessage(submsg);
        let capacity = self.budget - MESSAGE_HEADER_SIZE;
        if bytes.len() <= capacity {
            if self.last_available.diff(self.last_acked) >= i32::from(self.depth) {
                return false;
            }
            let mut message = OutputMessage::new(self.header(), self.budget);
            if !message.append_raw(&bytes) {
                return false;
            }
            self.last_available = self.last_available.next();
            message.set_sequence(self.last_available);
            self.messages.insert(self.last_available.raw(), message);
            return true;
        }
        self.push_fragments(&bytes, capacity)
    }

    /// Split serialized submessage bytes into FRAGMENT submessages, one per
    /// buffered message. The receiver concatenates the data chunks and
    /// parses the result as a submessage.
    fn push_fragments(&mut self, bytes: &[u8], capacity: usize) -> bool {
        let chunk = capacity - FRAGMENT_OVERHEAD;
        let total = bytes.len().div_ceil(chunk);
        if total > usize::from(u16::MAX) {
            return false;
        }
        let free = i32::from(self.depth) - self.last_available.diff(self.last_acked);
        if (total as i32) > free {
            return false;
        }
        for (nr, piece) in bytes.chunks(chunk).enumerate() {
            let fragment = Submessage::Fragment(FragmentPayload {
                fragment_nr: nr as u16,
                total_fragments: total as u16,
                data: piece.to_vec(),
            });
            let mut message = OutputMessage::new(self.header(), self.budget);
            message.append_submessage(&fragment);
            self.last_available = self.last_available.next();
            message.set_sequence(self.last_available);
            self.messages.insert(self.last_available.raw(), message);
        }
        true
    }

    /// Sequence number the next transmitted message will carry.
    pub fn next_message_seq(&self) -> SeqNum {
        self.last_sent.next()
    }

    /// Hand out the next buffered-but-unsent message for transmission,
    /// advancing `last_sent` toward `last_available` (pacing).
    pub fn pop_next_message(&mut self) -> Option<(SeqNum, Vec<u8>)> {
        if self.last_sent < self.last_available {
            self.last_sent = self.last_sent.next();
            let bytes = self.messages.get(&self.last_sent.raw())?.to_bytes();
            Some((self.last_sent, bytes))
        } else {
            None
        }
    }

    /// Oldest sequence number still held (for HEARTBEAT).
    pub fn first_available(&self) -> SeqNum {
        self.last_acked.next()
    }

    /// Newest sequence number buffered (for HEARTBEAT).
    pub fn last_available(&self) -> SeqNum {
        self.last_available
    }

    pub fn message_pending(&self) -> bool {
        !self.messages.is_empty()
    }

    pub fn heartbeat(&self) -> HeartbeatPayload {
        HeartbeatPayload {
            first_unacked: self.first_available().raw(),
            last_unacked: self.last_available.raw(),
        }
    }

    /// Clear all watermarks to the "nothing sent" sentinel and empty the
    /// buffer (reconnection / session loss).
    pub fn reset(&mut self) {
        self.last_available = SeqNum::SENTINEL;
        self.last_sent = SeqNum::SENTINEL;
        self.last_acked = SeqNum::SENTINEL;
        self.messages.clear();
    }
}
