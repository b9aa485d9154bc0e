// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Incoming stream lanes.
//
// Best-effort input is a monotonic filter: a message is accepted only when
// its sequence number is newer than the last one handled. Reliable input
// reorders and deduplicates: messages at the expected sequence number are
// delivered at once, later ones are held in a bounded forward buffer until
// the gap fills or the peer's HEARTBEAT abandons it.

use std::collections::BTreeMap;

use crate::error::AgentError;
use crate::protocol::{AcknackPayload, FragmentPayload};
use crate::seq::SeqNum;

// ---------------------------------------------------------------------------
// Best-effort input stream
// ---------------------------------------------------------------------------

/// Monotonic acceptance filter, no buffering.
#[derive(Debug)]
pub struct BestEffortInputStream {
    last_handled: SeqNum,
}

impl BestEffortInputStream {
    pub fn new() -> Self {
        Self {
            last_handled: SeqNum::SENTINEL,
        }
    }

    /// Accept iff `seq` is newer than the last handled number, advancing
    /// the marker. Stale and duplicate messages are rejected.
    pub fn accept(&mut self, seq: SeqNum) -> bool {
        if self.last_handled < seq {
            self.last_handled = seq;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.last_handled = SeqNum::SENTINEL;
    }
}

impl Default for BestEffortInputStream {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Reliable input stream
// ---------------------------------------------------------------------------

/// Reorders and dedups inbound reliable messages; reports missing sequence
/// numbers for ACKNACK generation; reassembles FRAGMENT submessages.
#[derive(Debug)]
pub struct ReliableInputStream {
    /// Highest sequence number delivered in order.
    last_handled: SeqNum,
    /// Highest sequence number the peer has advertised via HEARTBEAT.
    last_announced: SeqNum,
    depth: u16,
    /// Out-of-order payloads held until the gap below them fills.
    buffer: BTreeMap<u16, Vec<u8>>,
    /// Reassembly for an in-flight fragmented submessage.
    fragments: Option<ReassemblyBuffer>,
}

impl ReliableInputStream {
    pub fn new(depth: u16) -> Self {
        Self {
            last_handled: SeqNum::SENTINEL,
            last_announced: SeqNum::SENTINEL,
            depth,
            buffer: BTreeMap::new(),
            fragments: None,
        }
    }

    fn next_expected(&self) -> SeqNum {
        self.last_handled.next()
    }

    /// Offer an inbound payload. Accepts numbers in the forward window
    /// `(last_handled, last_handled + depth]`; duplicates and stale numbers
    /// are dropped. Delivery happens through `pop_deliverable`.
    pub fn push(&mut self, seq: SeqNum, payload: Vec<u8>) -> bool {
        let ahead = seq.diff(self.last_handled);
        if ahead <= 0 || ahead > i32::from(self.depth) {
            return false;
        }
        if self.buffer.contains_key(&seq.raw()) {
            return false;
        }
        if self.last_announced < seq {
            self.last_announced = seq;
        }
        self.buffer.insert(seq.raw(), payload);
        true
    }

    /// Drain the next in-order payload, if buffered. Call repeatedly until
    /// `None` to deliver everything a gap-fill released.
    pub fn pop_deliverable(&mut self) -> Option<Vec<u8>> {
        let next = self.next_expected();
        let payload = self.buffer.remove(&next.raw())?;
        self.last_handled = next;
        Some(payload)
    }

    /// Track the peer's advertised output window. Sequence numbers below
    /// `first` will never be retransmitted: the gap is abandoned and
    /// delivery resumes at `first`.
    pub fn update_from_heartbeat(&mut self, first: SeqNum, last: SeqNum) {
        if self.last_announced < last {
            self.last_announced = last;
        }
        while self.next_expected() < first {
            let skipped = self.next_expected();
            self.buffer.remove(&skipped.raw());
            self.last_handled = skipped;
        }
    }

    /// True when the peer has announced messages not yet delivered in order.
    pub fn has_holes(&self) -> bool {
        self.last_handled < self.last_announced
    }

    /// Build the ACKNACK for the current state: `first_unacked` plus a
    /// bitmap where bit i marks `first_unacked + i` as missing within the
    /// announced window.
    pub fn acknack(&self) -> AcknackPayload {
        let first_unacked = self.next_expected();
        let mut bitmap = 0u16;
        for bit in 0..16u16 {
            let seq = first_unacked + bit;
            if self.last_announced < seq {
                break;
            }
            if !self.buffer.contains_key(&seq.raw()) {
                bitmap |= 1 << bit;
            }
        }
        AcknackPayload {
            first_unacked: first_unacked.raw(),
            nack_bitmap: bitmap,
        }
    }

    /// Feed one FRAGMENT submessage, delivered in sequence order. Returns
    /// the reassembled submessage bytes once the final piece arrives.
    pub fn accept_fragment(
        &mut self,
        fragment: &FragmentPayload,
    ) -> Result<Option<Vec<u8>>, AgentError> {
        let buffer = self
            .fragments
            .get_or_insert_with(|| ReassemblyBuffer::new(fragment.total_fragments));
        let expected = buffer.total_fragments();
        if expected != fragment.total_fragments {
            self.fragments = None;
            return Err(AgentError::FragmentError(format!(
                "fragment total changed mid-stream: {} != {}",
                fragment.total_fragments, expected
            )));
        }
        let complete = buffer.insert(fragment.fragment_nr, fragment.data.clone())?;
        if complete {
            let assembled = buffer.assemble()?;
            self.fragments = None;
            Ok(Some(assembled))
        } else {
            Ok(None)
        }
    }

    pub fn reset(&mut self) {
        self.last_handled = SeqNum::SENTINEL;
        self.last_announced = SeqNum::SENTINEL;
        self.buffer.clear();
        self.fragments = None;
    }
}

// ---------------------------------------------------------------------------
// Fragment reassembly
// ---------------------------------------------------------------------------

/// Collects fragments and produces the original payload once all have
/// arrived.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    total_fragments: u16,
    received: Vec<Option<Vec<u8>>>,
    received_count: u16,
}

impl ReassemblyBuffer {
    pub fn new(total_fragments: u16) -> Self {
        let mut received = Vec::with_capacity(total_fragments as usize);
        received.resize_with(total_fragments as usize, || None);
        Self {
            total_fragments,
            received,
            received_count: 0,
        }
    }

    /// Insert a fragment. Returns `true` if all fragments have been received.
    pub fn insert(&mut self, fragment_nr: u16, data: Vec<u8>) -> Result<bool, AgentError> {
        if fragment_nr >= self.total_fragments {
            return Err(AgentError::FragmentError(format!(
                "fragment_nr {} >= total {}",
                fragment_nr, self.total_fragments
            )));
        }
        let idx = fragment_nr as usize;
        if self.received[idx].is_none() {
            self.received_count += 1;
        }
        self.received[idx] = Some(data);
        Ok(self.received_count == self.total_fragments)
    }

    /// Assemble the complete payload. Only valid when all fragments are
    /// present.
    pub fn assemble(&self) -> Result<Vec<u8>, AgentError> {
        if self.received_count < self.total_fragments {
            return Err(AgentError::FragmentError(format!(
                "missing fragments: have {}/{}",
                self.received_count, self.total_fragments
            )));
        }
        let mut payload = Vec::new();
        for slot in &self.received {
            match slot {
                Some(d) => payload.extend_from_slice(d),
                None => {
                    return Err(AgentError::FragmentError("internal: missing slot".into()));
                }
            }
        }
        Ok(payload)
    }

    pub fn total_fragments(&self) -> u16 {
        self.total_fragments
    }
}
