// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Message dispatch.
//
// `Agent` is the transport-independent core: it takes complete inbound
// message bytes, runs them through the client's session lanes, applies the
// operations to the entity tree / bridge, and hands back the serialized
// replies plus the session events the transport layer needs for its
// source bookkeeping. It holds no socket state and is shared across worker
// threads behind an `Arc`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::bridge::MiddlewareBridge;
use crate::client::{ClientState, Handshake, Root};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::protocol::{
    serialize_message, ClientKey, CreateClientPayload, DataPayload, MessageHeader, ObjectId,
    ObjectKind, StatusCode, StatusPayload, StreamId, StreamKind, Submessage, WireMessage,
    MESSAGE_HEADER_SIZE,
};

/// Client lifecycle notifications for the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Handshake accepted: bind the message's source to this key.
    ClientCreated(ClientKey),
    /// Client gone (DELETE or replacement): release the binding.
    ClientDeleted(ClientKey),
}

/// Everything one inbound message produced.
#[derive(Debug, Default)]
pub struct ProcessResult {
    /// Serialized messages to send back to the message's source.
    pub replies: Vec<Vec<u8>>,
    pub events: Vec<SessionEvent>,
}

/// Periodic work: keep-alive traffic and eviction.
#[derive(Debug, Default)]
pub struct TickResult {
    /// Serialized messages per client key (the transport resolves sources).
    pub outbound: Vec<(ClientKey, Vec<u8>)>,
    pub evicted: Vec<ClientKey>,
}

pub struct Agent {
    config: AgentConfig,
    root: Root,
    bridge: Arc<dyn MiddlewareBridge>,
}

impl Agent {
    pub fn new(config: AgentConfig, bridge: Arc<dyn MiddlewareBridge>) -> Result<Self, AgentError> {
        config.validate()?;
        Ok(Self {
            root: Root::new(config.clone()),
            config,
            bridge,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn root(&self) -> &Root {
        &self.root
    }

    /// Process one complete inbound message. Never panics on hostile input:
    /// malformed bytes or an unknown client produce a log line and an empty
    /// result.
    pub fn process_message(&self, source: SocketAddr, bytes: &[u8]) -> ProcessResult {
        let now = Instant::now();
        let header = match MessageHeader::parse(bytes) {
            Ok(header) => header,
            Err(err) => {
                warn!("{source}: unparseable header: {err}");
                return ProcessResult::default();
            }
        };
        let body = &bytes[MESSAGE_HEADER_SIZE..];

        // The handshake is the one operation that runs without an
        // established client.
        if let Some(greeting) = parse_handshake(body) {
            return self.handle_create_client(source, &greeting, now);
        }

        let Some(client) = self.root.get_client(header.client_key) else {
            warn!(
                "{source}: message for unknown client {}, dropped",
                header.client_key
            );
            return ProcessResult::default();
        };

        let mut result = ProcessResult::default();
        let mut delete_self = false;
        {
            let mut state = client.lock();
            // Only the established session incarnation may speak for the key;
            // a replaced session must re-handshake, not inject traffic.
            if header.session_id != state.session_id {
                warn!(
                    "{source}: session {} for client {} is not the established {}, dropped",
                    header.session_id, header.client_key, state.session_id
                );
                return ProcessResult::default();
            }
            state.last_activity = now;
            let batches = match state.session.accept_input(&header, body) {
                Ok(batches) => batches,
                Err(err) => {
                    warn!("{source}: bad message body: {err}");
                    return ProcessResult::default();
                }
            };
            'outer: for batch in batches {
                for submsg in batch {
                    if self.dispatch(&mut state, &header, &submsg, &mut result) {
                        delete_self = true;
                        break 'outer;
                    }
                }
            }
            result.replies.extend(state.session.drain_output());
        }
        if delete_self {
            self.root.delete_client(self.bridge.as_ref(), header.client_key);
            result.events.push(SessionEvent::ClientDeleted(header.client_key));
        }
        result
    }

    /// Keep-alive heartbeats plus inactivity eviction. Driven by the
    /// transport's poll timeout.
    pub fn tick(&self, now: Instant) -> TickResult {
        let mut result = TickResult::default();
        for client in self.root.clients() {
            let key = client.key();
            let mut state = client.lock();
            for message in state.session.heartbeats(now) {
                result.outbound.push((key, message));
            }
        }
        let timeout = Duration::from_millis(self.config.client_timeout_ms);
        result.evicted = self.root.evict_expired(self.bridge.as_ref(), now, timeout);
        result
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    fn handle_create_client(
        &self,
        source: SocketAddr,
        greeting: &CreateClientPayload,
        now: Instant,
    ) -> ProcessResult {
        let mut result = ProcessResult::default();
        let status = match self.root.create_client(self.bridge.as_ref(), greeting, now) {
            Handshake::Created(_) => {
                result.events.push(SessionEvent::ClientCreated(greeting.client_key));
                StatusCode::Ok
            }
            Handshake::Reconnected(_) => {
                result.events.push(SessionEvent::ClientCreated(greeting.client_key));
                StatusCode::Ok
            }
            Handshake::Refused(status) => {
                debug!("{source}: handshake refused: {status:?}");
                status
            }
        };
        // The handshake reply bypasses the lanes: the session may not exist.
        result.replies.push(serialize_message(&WireMessage {
            header: MessageHeader {
                session_id: greeting.session_id,
                stream_id: StreamId::NONE,
                sequence_nr: 0,
                client_key: greeting.client_key,
            },
            submessages: vec![Submessage::Status(StatusPayload {
                related_object_id: ObjectId::CLIENT,
                status,
            })],
        }));
        result
    }

    /// Apply one submessage. Returns true when the whole client must be
    /// torn down (DELETE on `ObjectId::CLIENT`), which has to happen after
    /// the client lock is released.
    fn dispatch(
        &self,
        state: &mut ClientState,
        header: &MessageHeader,
        submsg: &Submessage,
        result: &mut ProcessResult,
    ) -> bool {
        let reply_stream = header.stream_id;
        match submsg {
            Submessage::Create(create) => {
                let status = state.tree.create_object(
                    self.bridge.as_ref(),
                    create.object_id,
                    create.flags,
                    create.descriptor.clone(),
                );
                self.reply_status(state, reply_stream, create.object_id, status);
            }
            Submessage::Delete(delete) => {
                if delete.object_id == ObjectId::CLIENT {
                    self.reply_status(state, reply_stream, ObjectId::CLIENT, StatusCode::Ok);
                    return true;
                }
                let status = state.tree.delete_object(self.bridge.as_ref(), delete.object_id);
                self.reply_status(state, reply_stream, delete.object_id, status);
            }
            Submessage::WriteData(write) => {
                match state.tree.handle_of(write.writer_id, ObjectKind::DataWriter) {
                    Some(handle) => {
                        if let Err(err) = self.bridge.write(handle, &write.data) {
                            debug!("write through {:04x}: {err}", write.writer_id.0);
                            self.reply_status(
                                state,
                                reply_stream,
                                write.writer_id,
                                StatusCode::ErrInvalidData,
                            );
                        }
                        // Successful writes are silent.
                    }
                    None => self.reply_status(
                        state,
                        reply_stream,
                        write.writer_id,
                        StatusCode::ErrUnknownReference,
                    ),
                }
            }
            Submessage::ReadData(read) => self.handle_read_data(state, reply_stream, read),
            Submessage::Heartbeat(heartbeat) => {
                if let Some(ack) = state.session.handle_heartbeat(header.stream_id, heartbeat) {
                    // Lane control goes out directly, unsequenced.
                    result.replies.push(serialize_message(&WireMessage {
                        header: MessageHeader {
                            session_id: header.session_id,
                            stream_id: header.stream_id,
                            sequence_nr: 0,
                            client_key: header.client_key,
                        },
                        submessages: vec![Submessage::Acknack(ack)],
                    }));
                }
            }
            Submessage::Acknack(ack) => {
                let resend = state.session.handle_acknack(header.stream_id, ack);
                result.replies.extend(resend);
            }
            Submessage::Reset => {
                debug!("client {}: session reset", header.client_key);
                state.session.reset();
            }
            // Agent-to-client submessages arriving inbound are a peer bug.
            Submessage::Status(_) | Submessage::Data(_) => {
                debug!("client {}: unexpected inbound {submsg:?}", header.client_key);
            }
            // Fragments are consumed inside the reliable input lane and
            // CREATE_CLIENT is intercepted before dispatch.
            Submessage::Fragment(_) | Submessage::CreateClient(_) => {
                debug!("client {}: stray {submsg:?}", header.client_key);
            }
        }
        false
    }

    fn handle_read_data(
        &self,
        state: &mut ClientState,
        reply_stream: StreamId,
        read: &crate::protocol::ReadDataPayload,
    ) {
        let Some(handle) = state.tree.handle_of(read.reader_id, ObjectKind::DataReader) else {
            self.reply_status(
                state,
                reply_stream,
                read.reader_id,
                StatusCode::ErrUnknownReference,
            );
            return;
        };
        let mut delivered = 0u16;
        while delivered < read.max_samples {
            match self.bridge.take(handle) {
                Ok(Some(data)) => {
                    let submsg = Submessage::Data(DataPayload {
                        reader_id: read.reader_id,
                        data,
                    });
                    self.push_reply(state, reply_stream, &submsg);
                    delivered += 1;
                }
                Ok(None) => break,
                Err(err) => {
                    debug!("take through {:04x}: {err}", read.reader_id.0);
                    self.reply_status(
                        state,
                        reply_stream,
                        read.reader_id,
                        StatusCode::ErrInvalidData,
                    );
                    return;
                }
            }
        }
        if delivered == 0 {
            // Nothing available: the reply is an empty-handed OK.
            self.reply_status(state, reply_stream, read.reader_id, StatusCode::Ok);
        }
    }

    fn reply_status(
        &self,
        state: &mut ClientState,
        stream_id: StreamId,
        related: ObjectId,
        status: StatusCode,
    ) {
        let submsg = Submessage::Status(StatusPayload {
            related_object_id: related,
            status,
        });
        self.push_reply(state, stream_id, &submsg);
    }

    /// Route a reply submessage to the lane the request arrived on. A full
    /// reliable window degrades to an ERR_RESOURCES status on the
    /// no-sequencing lane; a full best-effort lane drops the reply.
    fn push_reply(&self, state: &mut ClientState, stream_id: StreamId, submsg: &Submessage) {
        if state.session.push_output_submessage(stream_id, submsg) {
            return;
        }
        match stream_id.kind() {
            StreamKind::Reliable => {
                debug!("reliable lane {:02x} full, degrading reply", stream_id.0);
                let fallback = Submessage::Status(StatusPayload {
                    related_object_id: ObjectId::CLIENT,
                    status: StatusCode::ErrResources,
                });
                if !state
                    .session
                    .push_output_submessage(StreamId::NONE, &fallback)
                {
                    debug!("no-sequencing lane full as well, reply lost");
                }
            }
            StreamKind::NoSequencing | StreamKind::BestEffort => {
                debug!("best-effort lane {:02x} full, reply dropped", stream_id.0);
            }
        }
    }
}

/// A handshake message is a single CREATE_CLIENT submessage on the
/// no-sequencing lane; anything else is regular traffic.
fn parse_handshake(body: &[u8]) -> Option<CreateClientPayload> {
    match crate::protocol::parse_submessage(body) {
        Ok((Submessage::CreateClient(greeting), consumed)) if consumed == body.len() => {
            Some(greeting)
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NullBridge;
    use crate::protocol::{
        parse_message, CreatePayload, CreationFlags, DeletePayload, ObjectDescriptor,
        Representation, COOKIE, VERSION_MAJOR, VERSION_MINOR,
    };

    const KEY: ClientKey = ClientKey([1, 2, 3, 4]);
    const RELIABLE: StreamId = StreamId(0x80);

    fn agent() -> Agent {
        Agent::new(AgentConfig::default(), Arc::new(NullBridge::new())).unwrap()
    }

    fn agent_with_config(config: AgentConfig) -> Agent {
        Agent::new(config, Arc::new(NullBridge::new())).unwrap()
    }

    fn source() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn handshake_bytes(key: ClientKey) -> Vec<u8> {
        serialize_message(&WireMessage {
            header: MessageHeader {
                session_id: 1,
                stream_id: StreamId::NONE,
                sequence_nr: 0,
                client_key: key,
            },
            submessages: vec![Submessage::CreateClient(CreateClientPayload {
                cookie: COOKIE,
                version: [VERSION_MAJOR, VERSION_MINOR],
                client_key: key,
                session_id: 1,
            })],
        })
    }

    fn message(stream_id: StreamId, seq: u16, submsgs: Vec<Submessage>) -> Vec<u8> {
        serialize_message(&WireMessage {
            header: MessageHeader {
                session_id: 1,
                stream_id,
                sequence_nr: seq,
                client_key: KEY,
            },
            submessages: submsgs,
        })
    }

    fn create_participant(seq: u16) -> Vec<u8> {
        message(
            RELIABLE,
            seq,
            vec![Submessage::Create(CreatePayload {
                object_id: ObjectId(0x0001),
                flags: CreationFlags::default(),
                descriptor: ObjectDescriptor::Participant {
                    domain_id: 0,
                    representation: Representation::Reference("default".to_owned()),
                },
            })],
        )
    }

    fn first_status(reply: &[u8]) -> StatusPayload {
        let msg = parse_message(reply).unwrap();
        for submsg in &msg.submessages {
            if let Submessage::Status(status) = submsg {
                return *status;
            }
        }
        panic!("no STATUS in reply");
    }

    #[test]
    fn test_handshake_accepted() {
        let a = agent();
        let result = a.process_message(source(), &handshake_bytes(KEY));
        assert_eq!(result.events, vec![SessionEvent::ClientCreated(KEY)]);
        assert_eq!(result.replies.len(), 1);
        let status = first_status(&result.replies[0]);
        assert_eq!(status.status, StatusCode::Ok);
        assert!(a.root().get_client(KEY).is_some());
    }

    #[test]
    fn test_handshake_bad_cookie() {
        let a = agent();
        let bytes = serialize_message(&WireMessage {
            header: MessageHeader {
                session_id: 1,
                stream_id: StreamId::NONE,
                sequence_nr: 0,
                client_key: KEY,
            },
            submessages: vec![Submessage::CreateClient(CreateClientPayload {
                cookie: *b"NOPE",
                version: [VERSION_MAJOR, VERSION_MINOR],
                client_key: KEY,
                session_id: 1,
            })],
        });
        let result = a.process_message(source(), &bytes);
        assert!(result.events.is_empty());
        assert_eq!(
            first_status(&result.replies[0]).status,
            StatusCode::ErrInvalidData
        );
        assert!(a.root().is_empty());
    }

    #[test]
    fn test_unknown_client_dropped() {
        let a = agent();
        let result = a.process_message(source(), &create_participant(0));
        assert!(result.replies.is_empty());
        assert!(result.events.is_empty());
    }

    #[test]
    fn test_create_over_reliable_lane() {
        let a = agent();
        a.process_message(source(), &handshake_bytes(KEY));
        let result = a.process_message(source(), &create_participant(0));
        assert_eq!(result.replies.len(), 1);
        let reply = parse_message(&result.replies[0]).unwrap();
        assert_eq!(reply.header.stream_id, RELIABLE);
        let status = first_status(&result.replies[0]);
        assert_eq!(status.related_object_id, ObjectId(0x0001));
        assert_eq!(status.status, StatusCode::Ok);
    }

    #[test]
    fn test_delete_client_emits_event() {
        let a = agent();
        a.process_message(source(), &handshake_bytes(KEY));
        let bytes = message(
            RELIABLE,
            0,
            vec![Submessage::Delete(DeletePayload {
                object_id: ObjectId::CLIENT,
            })],
        );
        let result = a.process_message(source(), &bytes);
        assert_eq!(result.events, vec![SessionEvent::ClientDeleted(KEY)]);
        assert_eq!(first_status(&result.replies[0]).status, StatusCode::Ok);
        assert!(a.root().get_client(KEY).is_none());
    }

    #[test]
    fn test_malformed_bytes_are_dropped() {
        let a = agent();
        assert!(a.process_message(source(), &[0x01, 0x02]).replies.is_empty());
    }

    #[test]
    fn test_stale_session_id_is_dropped() {
        let a = agent();
        a.process_message(source(), &handshake_bytes(KEY));
        // Same key, but a session id never established by a handshake.
        let stale = serialize_message(&WireMessage {
            header: MessageHeader {
                session_id: 9,
                stream_id: RELIABLE,
                sequence_nr: 0,
                client_key: KEY,
            },
            submessages: vec![Submessage::Create(CreatePayload {
                object_id: ObjectId(0x0001),
                flags: CreationFlags::default(),
                descriptor: ObjectDescriptor::Participant {
                    domain_id: 0,
                    representation: Representation::Reference("default".to_owned()),
                },
            })],
        });
        let result = a.process_message(source(), &stale);
        assert!(result.replies.is_empty());
        assert!(result.events.is_empty());
        // The established session is untouched: seq 0 is still fresh and
        // the participant does not exist yet.
        let result = a.process_message(source(), &create_participant(0));
        assert_eq!(first_status(&result.replies[0]).status, StatusCode::Ok);
    }

    #[test]
    fn test_reliable_window_exhaustion_degrades() {
        let a = agent_with_config(AgentConfig {
            reliable_depth: 2,
            ..AgentConfig::default()
        });
        a.process_message(source(), &handshake_bytes(KEY));
        // Three replies into a window of two: the third degrades to an
        // ERR_RESOURCES status on the no-sequencing lane.
        let participant = |id: u16| {
            Submessage::Create(CreatePayload {
                object_id: ObjectId(id),
                flags: CreationFlags::default(),
                descriptor: ObjectDescriptor::Participant {
                    domain_id: 0,
                    representation: Representation::Reference("default".to_owned()),
                },
            })
        };
        let bytes = message(RELIABLE, 0, vec![participant(1), participant(2), participant(3)]);
        let result = a.process_message(source(), &bytes);
        assert_eq!(result.replies.len(), 3);
        let mut reliable = 0;
        let mut degraded = 0;
        for reply in &result.replies {
            let msg = parse_message(reply).unwrap();
            if msg.header.stream_id == RELIABLE {
                reliable += 1;
            } else {
                assert_eq!(msg.header.stream_id, StreamId::NONE);
                let status = first_status(reply);
                assert_eq!(status.related_object_id, ObjectId::CLIENT);
                assert_eq!(status.status, StatusCode::ErrResources);
                degraded += 1;
            }
        }
        assert_eq!(reliable, 2);
        assert_eq!(degraded, 1);
    }

    #[test]
    fn test_best_effort_full_drops_reply() {
        let a = agent_with_config(AgentConfig {
            best_effort_depth: 1,
            ..AgentConfig::default()
        });
        a.process_message(source(), &handshake_bytes(KEY));
        let participant = |id: u16| {
            Submessage::Create(CreatePayload {
                object_id: ObjectId(id),
                flags: CreationFlags::default(),
                descriptor: ObjectDescriptor::Participant {
                    domain_id: 0,
                    representation: Representation::Reference("default".to_owned()),
                },
            })
        };
        // Two replies into a best-effort queue of one: the second is lost.
        let bytes = message(StreamId(0x01), 0, vec![participant(1), participant(2)]);
        let result = a.process_message(source(), &bytes);
        assert_eq!(result.replies.len(), 1);
        assert_eq!(first_status(&result.replies[0]).related_object_id, ObjectId(1));
    }

    #[test]
    fn test_reset_restarts_lanes_over_the_wire() {
        let a = agent();
        a.process_message(source(), &handshake_bytes(KEY));
        let result = a.process_message(source(), &create_participant(0));
        assert_eq!(first_status(&result.replies[0]).status, StatusCode::Ok);
        let reset = message(StreamId::NONE, 0, vec![Submessage::Reset]);
        assert!(a.process_message(source(), &reset).replies.is_empty());
        // Sequencing restarted, entities kept: the replayed seq 0 is
        // processed again and finds the participant already there.
        let result = a.process_message(source(), &create_participant(0));
        assert_eq!(
            first_status(&result.replies[0]).status,
            StatusCode::ErrAlreadyExists
        );
    }
}
