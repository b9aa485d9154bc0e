// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Per-client session: the collection of stream lanes.
//
// Lanes are created lazily the first time a stream id is used and keep
// their state for the life of the session. Inbound messages pass through
// the lane matching the header's stream id: the no-sequencing lane
// delivers everything, best-effort lanes filter stale sequence numbers,
// reliable lanes reorder and reassemble. Outbound submessages are routed
// the same way.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::protocol::{
    parse_submessage, serialize_message, AcknackPayload, ClientKey, HeartbeatPayload,
    MessageHeader, StreamId, StreamKind, Submessage, WireMessage,
};
use crate::seq::SeqNum;
use crate::stream::input::{BestEffortInputStream, ReliableInputStream};
use crate::stream::output::{BestEffortOutputStream, ReliableOutputStream};

/// One client's lane state on both directions.
#[derive(Debug)]
pub struct Session {
    session_id: u8,
    client_key: ClientKey,
    reliable_depth: u16,
    best_effort_depth: usize,
    /// Per-message byte budget, shared by every lane.
    budget: usize,
    heartbeat_period: Duration,
    last_heartbeat: Option<Instant>,
    best_effort_in: HashMap<StreamId, BestEffortInputStream>,
    reliable_in: HashMap<StreamId, ReliableInputStream>,
    best_effort_out: HashMap<StreamId, BestEffortOutputStream>,
    reliable_out: HashMap<StreamId, ReliableOutputStream>,
}

impl Session {
    pub fn new(session_id: u8, client_key: ClientKey, config: &AgentConfig) -> Self {
        Self {
            session_id,
            client_key,
            reliable_depth: config.reliable_depth,
            best_effort_depth: config.best_effort_depth,
            budget: config.max_message_size,
            heartbeat_period: Duration::from_millis(config.heartbeat_period_ms),
            last_heartbeat: None,
            best_effort_in: HashMap::new(),
            reliable_in: HashMap::new(),
            best_effort_out: HashMap::new(),
            reliable_out: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> u8 {
        self.session_id
    }

    fn reliable_in_lane(&mut self, id: StreamId) -> &mut ReliableInputStream {
        let depth = self.reliable_depth;
        self.reliable_in
            .entry(id)
            .or_insert_with(|| ReliableInputStream::new(depth))
    }

    fn reliable_out_lane(&mut self, id: StreamId) -> &mut ReliableOutputStream {
        let (session_id, key, depth, budget) = (
            self.session_id,
            self.client_key,
            self.reliable_depth,
            self.budget,
        );
        self.reliable_out
            .entry(id)
            .or_insert_with(|| ReliableOutputStream::new(session_id, id, key, depth, budget))
    }

    fn best_effort_out_lane(&mut self, id: StreamId) -> &mut BestEffortOutputStream {
        let (session_id, key, depth, budget) = (
            self.session_id,
            self.client_key,
            self.best_effort_depth,
            self.budget,
        );
        self.best_effort_out
            .entry(id)
            .or_insert_with(|| BestEffortOutputStream::new(session_id, id, key, depth, budget))
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Run an inbound message body (the bytes after the message header)
    /// through the lane named by the header. Returns the submessage batches
    /// now deliverable, in order: zero (filtered or buffered), one, or
    /// several when a gap fill releases held messages.
    ///
    /// On a reliable lane a body consisting only of HEARTBEAT / ACKNACK
    /// submessages bypasses sequencing: those describe lane state and must
    /// act immediately, not in order.
    pub fn accept_input(
        &mut self,
        header: &MessageHeader,
        body: &[u8],
    ) -> Result<Vec<Vec<Submessage>>, AgentError> {
        match header.stream_id.kind() {
            StreamKind::NoSequencing => Ok(vec![parse_submessages(body)?]),
            StreamKind::BestEffort => {
                let lane = self
                    .best_effort_in
                    .entry(header.stream_id)
                    .or_insert_with(BestEffortInputStream::new);
                if lane.accept(SeqNum(header.sequence_nr)) {
                    Ok(vec![parse_submessages(body)?])
                } else {
                    Ok(Vec::new())
                }
            }
            StreamKind::Reliable => {
                let batch = parse_submessages(body)?;
                if !batch.is_empty() && batch.iter().all(is_lane_control) {
                    return Ok(vec![batch]);
                }
                let lane = self.reliable_in_lane(header.stream_id);
                lane.push(SeqNum(header.sequence_nr), body.to_vec());
                let mut blobs = Vec::new();
                while let Some(blob) = lane.pop_deliverable() {
                    blobs.push(blob);
                }
                let mut batches = Vec::with_capacity(blobs.len());
                for blob in blobs {
                    batches.push(self.reassemble_batch(header.stream_id, &blob)?);
                }
                Ok(batches)
            }
        }
    }

    /// Parse one deliverable blob, folding FRAGMENT submessages through the
    /// lane's reassembly buffer. A completed reassembly is parsed back into
    /// the submessage it carried and takes the fragments' place.
    fn reassemble_batch(
        &mut self,
        stream_id: StreamId,
        blob: &[u8],
    ) -> Result<Vec<Submessage>, AgentError> {
        let mut batch = Vec::new();
        for submsg in parse_submessages(blob)? {
            match submsg {
                Submessage::Fragment(fragment) => {
                    let lane = self.reliable_in_lane(stream_id);
                    if let Some(bytes) = lane.accept_fragment(&fragment)? {
                        let (whole, _) = parse_submessage(&bytes)?;
                        batch.push(whole);
                    }
                }
                other => batch.push(other),
            }
        }
        Ok(batch)
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Route a submessage to the lane named by `stream_id`. Returns false
    /// when the lane cannot take it (best-effort queue full, reliable
    /// window exhausted, or oversized for a best-effort lane); the caller
    /// decides whether that is a drop or an error status.
    pub fn push_output_submessage(&mut self, stream_id: StreamId, submsg: &Submessage) -> bool {
        match stream_id.kind() {
            StreamKind::NoSequencing | StreamKind::BestEffort => {
                self.best_effort_out_lane(stream_id).push_submessage(submsg)
            }
            StreamKind::Reliable => self.reliable_out_lane(stream_id).push_submessage(submsg),
        }
    }

    /// Collect every message ready for the wire: best-effort FIFOs drain
    /// completely, reliable lanes advance their send watermark over the
    /// buffered backlog.
    pub fn drain_output(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for lane in self.best_effort_out.values_mut() {
            while let Some(message) = lane.pop_message() {
                out.push(message.to_bytes());
            }
        }
        for lane in self.reliable_out.values_mut() {
            while let Some((_, bytes)) = lane.pop_next_message() {
                out.push(bytes);
            }
        }
        out
    }

    /// HEARTBEAT messages for reliable lanes still holding unacknowledged
    /// data, at most once per configured period. Returned serialized, ready
    /// to send.
    pub fn heartbeats(&mut self, now: Instant) -> Vec<Vec<u8>> {
        if let Some(last) = self.last_heartbeat {
            if now.duration_since(last) < self.heartbeat_period {
                return Vec::new();
            }
        }
        let mut out = Vec::new();
        for (id, lane) in &self.reliable_out {
            if !lane.message_pending() {
                continue;
            }
            let message = WireMessage {
                header: MessageHeader {
                    session_id: self.session_id,
                    stream_id: *id,
                    sequence_nr: 0,
                    client_key: self.client_key,
                },
                submessages: vec![Submessage::Heartbeat(lane.heartbeat())],
            };
            out.push(serialize_message(&message));
        }
        if !out.is_empty() || self.last_heartbeat.is_none() {
            self.last_heartbeat = Some(now);
        }
        out
    }

    /// Apply a peer ACKNACK to the reliable output lane: prune acknowledged
    /// messages and return the ones the bitmap requests again.
    pub fn handle_acknack(&mut self, stream_id: StreamId, ack: &AcknackPayload) -> Vec<Vec<u8>> {
        let first_unacked = SeqNum(ack.first_unacked);
        let lane = self.reliable_out_lane(stream_id);
        lane.update_from_acknack(first_unacked);
        let mut resend = Vec::new();
        for bit in 0..16u16 {
            if ack.nack_bitmap & (1 << bit) == 0 {
                continue;
            }
            if let Some(bytes) = lane.get_message(first_unacked + bit) {
                resend.push(bytes);
            }
        }
        resend
    }

    /// Apply a peer HEARTBEAT to the reliable input lane. Returns the
    /// ACKNACK to send back when announced messages are still missing.
    pub fn handle_heartbeat(
        &mut self,
        stream_id: StreamId,
        heartbeat: &HeartbeatPayload,
    ) -> Option<AcknackPayload> {
        let lane = self.reliable_in_lane(stream_id);
        // first_unacked names the next number the peer still holds; the
        // last number it pruned is one below it.
        lane.update_from_heartbeat(
            SeqNum(heartbeat.first_unacked),
            SeqNum(heartbeat.last_unacked),
        );
        if lane.has_holes() {
            Some(lane.acknack())
        } else {
            None
        }
    }

    /// Reset every lane (session re-establishment keeps the lane objects,
    /// their sequence state restarts from scratch).
    pub fn reset(&mut self) {
        for lane in self.best_effort_in.values_mut() {
            lane.reset();
        }
        for lane in self.reliable_in.values_mut() {
            lane.reset();
        }
        for lane in self.best_effort_out.values_mut() {
            lane.reset();
        }
        for lane in self.reliable_out.values_mut() {
            lane.reset();
        }
        self.last_heartbeat = None;
    }
}

/// True for submessages that describe reliable-lane state rather than carry
/// client traffic.
fn is_lane_control(submsg: &Submessage) -> bool {
    matches!(submsg, Submessage::Heartbeat(_) | Submessage::Acknack(_))
}

fn parse_submessages(mut buf: &[u8]) -> Result<Vec<Submessage>, AgentError> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        let (submsg, consumed) = parse_submessage(buf)?;
        out.push(submsg);
        buf = &buf[consumed..];
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        parse_message, serialize_submessage, DataPayload, ObjectId, StatusCode, StatusPayload,
    };

    const KEY: ClientKey = ClientKey([0xAA, 0xBB, 0xCC, 0xDD]);
    const RELIABLE: StreamId = StreamId(0x80);
    const BEST_EFFORT: StreamId = StreamId(0x01);

    fn config() -> AgentConfig {
        AgentConfig {
            reliable_depth: 8,
            best_effort_depth: 4,
            max_message_size: 128,
            heartbeat_period_ms: 200,
            ..AgentConfig::default()
        }
    }

    fn session() -> Session {
        Session::new(1, KEY, &config())
    }

    fn header(stream_id: StreamId, seq: u16) -> MessageHeader {
        MessageHeader {
            session_id: 1,
            stream_id,
            sequence_nr: seq,
            client_key: KEY,
        }
    }

    fn status(code: StatusCode) -> Submessage {
        Submessage::Status(StatusPayload {
            related_object_id: ObjectId(0x0001),
            status: code,
        })
    }

    fn body(submsgs: &[Submessage]) -> Vec<u8> {
        let mut out = Vec::new();
        for s in submsgs {
            out.extend_from_slice(&serialize_submessage(s));
        }
        out
    }

    #[test]
    fn test_no_sequencing_delivers_everything() {
        let mut s = session();
        let b = body(&[status(StatusCode::Ok)]);
        // Repeated sequence numbers are not filtered on stream 0.
        for _ in 0..3 {
            let batches = s.accept_input(&header(StreamId::NONE, 0), &b).unwrap();
            assert_eq!(batches.len(), 1);
        }
    }

    #[test]
    fn test_best_effort_filters_stale() {
        let mut s = session();
        let b = body(&[status(StatusCode::Ok)]);
        assert_eq!(s.accept_input(&header(BEST_EFFORT, 5), &b).unwrap().len(), 1);
        assert!(s.accept_input(&header(BEST_EFFORT, 5), &b).unwrap().is_empty());
        assert!(s.accept_input(&header(BEST_EFFORT, 3), &b).unwrap().is_empty());
        assert_eq!(s.accept_input(&header(BEST_EFFORT, 6), &b).unwrap().len(), 1);
    }

    #[test]
    fn test_reliable_reorders() {
        let mut s = session();
        let first = body(&[status(StatusCode::Ok)]);
        let second = body(&[status(StatusCode::OkMatched)]);
        // Seq 1 arrives first: held.
        assert!(s.accept_input(&header(RELIABLE, 1), &second).unwrap().is_empty());
        // Seq 0 releases both, in order.
        let batches = s.accept_input(&header(RELIABLE, 0), &first).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![status(StatusCode::Ok)]);
        assert_eq!(batches[1], vec![status(StatusCode::OkMatched)]);
    }

    #[test]
    fn test_control_bypasses_sequencing() {
        let mut s = session();
        let hb = body(&[Submessage::Heartbeat(HeartbeatPayload {
            first_unacked: 0,
            last_unacked: 3,
        })]);
        // Out-of-order sequence number, still delivered at once.
        let batches = s.accept_input(&header(RELIABLE, 7), &hb).unwrap();
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn test_fragment_reassembly_inside_lane() {
        let mut s = session();
        let whole = serialize_submessage(&Submessage::Data(DataPayload {
            reader_id: ObjectId(0x0002),
            data: vec![7u8; 40],
        }));
        let (a, b) = whole.split_at(whole.len() / 2);
        let f = |nr: u16, data: &[u8]| {
            body(&[Submessage::Fragment(crate::protocol::FragmentPayload {
                fragment_nr: nr,
                total_fragments: 2,
                data: data.to_vec(),
            })])
        };
        assert!(s.accept_input(&header(RELIABLE, 0), &f(0, a)).unwrap()[0].is_empty());
        let batches = s.accept_input(&header(RELIABLE, 1), &f(1, b)).unwrap();
        assert_eq!(batches.len(), 1);
        match &batches[0][0] {
            Submessage::Data(d) => assert_eq!(d.data, vec![7u8; 40]),
            other => panic!("expected DATA, got {other:?}"),
        }
    }

    #[test]
    fn test_output_routing_and_drain() {
        let mut s = session();
        assert!(s.push_output_submessage(StreamId::NONE, &status(StatusCode::Ok)));
        assert!(s.push_output_submessage(RELIABLE, &status(StatusCode::Ok)));
        let out = s.drain_output();
        assert_eq!(out.len(), 2);
        // Everything already handed out: nothing left.
        assert!(s.drain_output().is_empty());
        for bytes in out {
            let msg = parse_message(&bytes).unwrap();
            assert_eq!(msg.header.client_key, KEY);
        }
    }

    #[test]
    fn test_best_effort_full_reports_false() {
        let mut s = session();
        for _ in 0..4 {
            assert!(s.push_output_submessage(BEST_EFFORT, &status(StatusCode::Ok)));
        }
        assert!(!s.push_output_submessage(BEST_EFFORT, &status(StatusCode::Ok)));
    }

    #[test]
    fn test_acknack_prunes_and_retransmits() {
        let mut s = session();
        for _ in 0..3 {
            assert!(s.push_output_submessage(RELIABLE, &status(StatusCode::Ok)));
        }
        assert_eq!(s.drain_output().len(), 3);
        // Peer got 0, missing 1 and 2.
        let resend = s.handle_acknack(
            RELIABLE,
            &AcknackPayload {
                first_unacked: 1,
                nack_bitmap: 0b11,
            },
        );
        assert_eq!(resend.len(), 2);
        assert_eq!(parse_message(&resend[0]).unwrap().header.sequence_nr, 1);
        assert_eq!(parse_message(&resend[1]).unwrap().header.sequence_nr, 2);
    }

    #[test]
    fn test_heartbeat_period_and_content() {
        let mut s = session();
        assert!(s.push_output_submessage(RELIABLE, &status(StatusCode::Ok)));
        s.drain_output();
        let t0 = Instant::now();
        let beats = s.heartbeats(t0);
        assert_eq!(beats.len(), 1);
        let msg = parse_message(&beats[0]).unwrap();
        assert_eq!(msg.header.stream_id, RELIABLE);
        match &msg.submessages[0] {
            Submessage::Heartbeat(hb) => {
                assert_eq!(hb.first_unacked, 0);
                assert_eq!(hb.last_unacked, 0);
            }
            other => panic!("expected HEARTBEAT, got {other:?}"),
        }
        // Within the period: silent.
        assert!(s.heartbeats(t0 + Duration::from_millis(50)).is_empty());
        // Past the period: beats again.
        assert_eq!(s.heartbeats(t0 + Duration::from_millis(250)).len(), 1);
    }

    #[test]
    fn test_peer_heartbeat_yields_acknack_on_holes() {
        let mut s = session();
        let b = body(&[status(StatusCode::Ok)]);
        s.accept_input(&header(RELIABLE, 1), &b).unwrap();
        // Peer announces 0..=1; 0 is missing.
        let ack = s
            .handle_heartbeat(
                RELIABLE,
                &HeartbeatPayload {
                    first_unacked: 0,
                    last_unacked: 1,
                },
            )
            .expect("hole should produce an acknack");
        assert_eq!(ack.first_unacked, 0);
        assert_eq!(ack.nack_bitmap & 1, 1);
    }

    #[test]
    fn test_reset_restarts_sequencing() {
        let mut s = session();
        let b = body(&[status(StatusCode::Ok)]);
        assert_eq!(s.accept_input(&header(RELIABLE, 0), &b).unwrap().len(), 1);
        // Replayed seq 0 is a duplicate until reset.
        assert!(s.accept_input(&header(RELIABLE, 0), &b).unwrap().is_empty());
        s.reset();
        assert_eq!(s.accept_input(&header(RELIABLE, 0), &b).unwrap().len(), 1);
    }
}
