// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Trellis wire format parser/builder.
//
// All fields are little-endian. All parsing is safe: malformed input
// returns Err, never panics.

use std::fmt;

use crate::error::AgentError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Message header size in bytes: session id + stream id + sequence nr + client key.
pub const MESSAGE_HEADER_SIZE: usize = 8;

/// Submessage header size in bytes.
pub const SUBMESSAGE_HEADER_SIZE: usize = 4;

/// Handshake cookie carried by CREATE_CLIENT.
pub const COOKIE: [u8; 4] = *b"TRLX";

/// Protocol version advertised by this agent.
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;

// Submessage IDs
pub const SUBMSG_CREATE_CLIENT: u8 = 0x00;
pub const SUBMSG_CREATE: u8 = 0x01;
pub const SUBMSG_DELETE: u8 = 0x02;
pub const SUBMSG_STATUS: u8 = 0x05;
pub const SUBMSG_WRITE_DATA: u8 = 0x07;
pub const SUBMSG_READ_DATA: u8 = 0x08;
pub const SUBMSG_DATA: u8 = 0x09;
pub const SUBMSG_FRAGMENT: u8 = 0x0B;
pub const SUBMSG_HEARTBEAT: u8 = 0x0D;
pub const SUBMSG_ACKNACK: u8 = 0x0E;
pub const SUBMSG_RESET: u8 = 0x0F;

// Object kinds
pub const OBJ_PARTICIPANT: u8 = 0x01;
pub const OBJ_TOPIC: u8 = 0x02;
pub const OBJ_PUBLISHER: u8 = 0x03;
pub const OBJ_SUBSCRIBER: u8 = 0x04;
pub const OBJ_DATAWRITER: u8 = 0x05;
pub const OBJ_DATAREADER: u8 = 0x06;
pub const OBJ_TYPE: u8 = 0x07;

// Status codes
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_OK_MATCHED: u8 = 0x01;
pub const STATUS_ERR_MISMATCH: u8 = 0x81;
pub const STATUS_ERR_ALREADY_EXISTS: u8 = 0x82;
pub const STATUS_ERR_UNKNOWN_REFERENCE: u8 = 0x84;
pub const STATUS_ERR_INVALID_DATA: u8 = 0x85;
pub const STATUS_ERR_INCOMPATIBLE: u8 = 0x86;
pub const STATUS_ERR_RESOURCES: u8 = 0x87;

// Representation tags
pub const REPR_INLINE: u8 = 0x01;
pub const REPR_REFERENCE: u8 = 0x02;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// 4-byte client-chosen key, unique among connected clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientKey(pub [u8; 4]);

impl ClientKey {
    /// Reserved "no mapping" sentinel.
    pub const INVALID: ClientKey = ClientKey([0; 4]);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Stream lane identifier. The id range encodes the lane kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u8);

/// Lane kind derived from the stream id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// stream_id 0x00: best-effort without sequencing.
    NoSequencing,
    /// stream_id 0x01..=0x7F: numbered best-effort lanes.
    BestEffort,
    /// stream_id 0x80..=0xFF: reliable lanes.
    Reliable,
}

impl StreamId {
    /// The no-sequencing lane.
    pub const NONE: StreamId = StreamId(0x00);

    pub fn kind(self) -> StreamKind {
        match self.0 {
            0x00 => StreamKind::NoSequencing,
            0x01..=0x7F => StreamKind::BestEffort,
            _ => StreamKind::Reliable,
        }
    }

    pub fn is_reliable(self) -> bool {
        self.kind() == StreamKind::Reliable
    }
}

/// Client-assigned 2-byte object prefix, unique per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u16);

impl ObjectId {
    /// Addresses the client itself in DELETE.
    pub const CLIENT: ObjectId = ObjectId(0xFFFE);
}

// ---------------------------------------------------------------------------
// Object kind enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectKind {
    Participant = OBJ_PARTICIPANT,
    Topic = OBJ_TOPIC,
    Publisher = OBJ_PUBLISHER,
    Subscriber = OBJ_SUBSCRIBER,
    DataWriter = OBJ_DATAWRITER,
    DataReader = OBJ_DATAREADER,
    Type = OBJ_TYPE,
}

impl ObjectKind {
    pub fn from_u8(v: u8) -> Result<Self, AgentError> {
        match v {
            OBJ_PARTICIPANT => Ok(Self::Participant),
            OBJ_TOPIC => Ok(Self::Topic),
            OBJ_PUBLISHER => Ok(Self::Publisher),
            OBJ_SUBSCRIBER => Ok(Self::Subscriber),
            OBJ_DATAWRITER => Ok(Self::DataWriter),
            OBJ_DATAREADER => Ok(Self::DataReader),
            OBJ_TYPE => Ok(Self::Type),
            _ => Err(AgentError::UnknownObjectKind(v)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ---------------------------------------------------------------------------
// Status code enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Ok = STATUS_OK,
    OkMatched = STATUS_OK_MATCHED,
    ErrMismatch = STATUS_ERR_MISMATCH,
    ErrAlreadyExists = STATUS_ERR_ALREADY_EXISTS,
    ErrUnknownReference = STATUS_ERR_UNKNOWN_REFERENCE,
    ErrInvalidData = STATUS_ERR_INVALID_DATA,
    ErrIncompatible = STATUS_ERR_INCOMPATIBLE,
    ErrResources = STATUS_ERR_RESOURCES,
}

impl StatusCode {
    pub fn from_u8(v: u8) -> Result<Self, AgentError> {
        match v {
            STATUS_OK => Ok(Self::Ok),
            STATUS_OK_MATCHED => Ok(Self::OkMatched),
            STATUS_ERR_MISMATCH => Ok(Self::ErrMismatch),
            STATUS_ERR_ALREADY_EXISTS => Ok(Self::ErrAlreadyExists),
            STATUS_ERR_UNKNOWN_REFERENCE => Ok(Self::ErrUnknownReference),
            STATUS_ERR_INVALID_DATA => Ok(Self::ErrInvalidData),
            STATUS_ERR_INCOMPATIBLE => Ok(Self::ErrIncompatible),
            STATUS_ERR_RESOURCES => Ok(Self::ErrResources),
            _ => Err(AgentError::UnknownStatusCode(v)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok | Self::OkMatched)
    }
}

// ---------------------------------------------------------------------------
// Creation mode flags
// ---------------------------------------------------------------------------

/// Two independent idempotency flags carried by CREATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreationFlags {
    /// Permit binding to an existing object with a matching description.
    pub reuse: bool,
    /// Permit destroying and recreating an existing object.
    pub replace: bool,
}

impl CreationFlags {
    pub fn from_byte(b: u8) -> Self {
        Self {
            reuse: b & 0x01 != 0,
            replace: b & 0x02 != 0,
        }
    }

    pub fn as_byte(self) -> u8 {
        u8::from(self.reuse) | (u8::from(self.replace) << 1)
    }
}

// ---------------------------------------------------------------------------
// Object representation and descriptors
// ---------------------------------------------------------------------------

/// How an object is described: either an inline descriptor document or a
/// reference to a named predefined object. Compared verbatim: equality of
/// two representations is the creation-mode "matches" relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Representation {
    Inline(String),
    Reference(String),
}

impl Representation {
    fn tag(&self) -> u8 {
        match self {
            Self::Inline(_) => REPR_INLINE,
            Self::Reference(_) => REPR_REFERENCE,
        }
    }

    fn text(&self) -> &str {
        match self {
            Self::Inline(s) | Self::Reference(s) => s,
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.tag());
        buf.extend_from_slice(&encode_string(self.text()));
    }

    fn parse(buf: &[u8]) -> Result<(Self, usize), AgentError> {
        if buf.is_empty() {
            return Err(AgentError::BufferTooShort);
        }
        let (text, consumed) = decode_string(&buf[1..])?;
        let repr = match buf[0] {
            REPR_INLINE => Self::Inline(text),
            REPR_REFERENCE => Self::Reference(text),
            other => return Err(AgentError::UnknownRepresentation(other)),
        };
        Ok((repr, 1 + consumed))
    }
}

/// Closed tagged union over object kinds. Derived `PartialEq` is the
/// creation-mode "matches" relation: same kind, same parent linkage, and a
/// byte-for-byte identical representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectDescriptor {
    Participant {
        domain_id: u16,
        representation: Representation,
    },
    Topic {
        participant_id: ObjectId,
        representation: Representation,
    },
    Publisher {
        participant_id: ObjectId,
        representation: Representation,
    },
    Subscriber {
        participant_id: ObjectId,
        representation: Representation,
    },
    DataWriter {
        publisher_id: ObjectId,
        representation: Representation,
    },
    DataReader {
        subscriber_id: ObjectId,
        representation: Representation,
    },
    Type {
        participant_id: ObjectId,
        representation: Representation,
    },
}

impl ObjectDescriptor {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Participant { .. } => ObjectKind::Participant,
            Self::Topic { .. } => ObjectKind::Topic,
            Self::Publisher { .. } => ObjectKind::Publisher,
            Self::Subscriber { .. } => ObjectKind::Subscriber,
            Self::DataWriter { .. } => ObjectKind::DataWriter,
            Self::DataReader { .. } => ObjectKind::DataReader,
            Self::Type { .. } => ObjectKind::Type,
        }
    }

    /// The declared parent id, `None` for participants.
    pub fn parent_id(&self) -> Option<ObjectId> {
        match self {
            Self::Participant { .. } => None,
            Self::Topic { participant_id, .. }
            | Self::Publisher { participant_id, .. }
            | Self::Subscriber { participant_id, .. }
            | Self::Type { participant_id, .. } => Some(*participant_id),
            Self::DataWriter { publisher_id, .. } => Some(*publisher_id),
            Self::DataReader { subscriber_id, .. } => Some(*subscriber_id),
        }
    }

    /// Kind the declared parent must resolve to, `None` for participants.
    pub fn parent_kind(&self) -> Option<ObjectKind> {
        match self {
            Self::Participant { .. } => None,
            Self::Topic { .. } | Self::Publisher { .. } | Self::Subscriber { .. }
            | Self::Type { .. } => Some(ObjectKind::Participant),
            Self::DataWriter { .. } => Some(ObjectKind::Publisher),
            Self::DataReader { .. } => Some(ObjectKind::Subscriber),
        }
    }

    pub fn representation(&self) -> &Representation {
        match self {
            Self::Participant { representation, .. }
            | Self::Topic { representation, .. }
            | Self::Publisher { representation, .. }
            | Self::Subscriber { representation, .. }
            | Self::DataWriter { representation, .. }
            | Self::DataReader { representation, .. }
            | Self::Type { representation, .. } => representation,
        }
    }

    /// Kind-specific u16 field: domain id for participants, parent id
    /// otherwise.
    fn field(&self) -> u16 {
        match self {
            Self::Participant { domain_id, .. } => *domain_id,
            other => other.parent_id().map_or(0, |id| id.0),
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.kind().as_u8());
        buf.extend_from_slice(&self.field().to_le_bytes());
        self.representation().write_to(buf);
    }

    fn parse(buf: &[u8]) -> Result<(Self, usize), AgentError> {
        if buf.len() < 3 {
            return Err(AgentError::BufferTooShort);
        }
        let kind = ObjectKind::from_u8(buf[0])?;
        let field = u16::from_le_bytes([buf[1], buf[2]]);
        let (representation, consumed) = Representation::parse(&buf[3..])?;
        let descriptor = match kind {
            ObjectKind::Participant => Self::Participant {
                domain_id: field,
                representation,
            },
            ObjectKind::Topic => Self::Topic {
                participant_id: ObjectId(field),
                representation,
            },
            ObjectKind::Publisher => Self::Publisher {
                participant_id: ObjectId(field),
                representation,
            },
            ObjectKind::Subscriber => Self::Subscriber {
                participant_id: ObjectId(field),
                representation,
            },
            ObjectKind::DataWriter => Self::DataWriter {
                publisher_id: ObjectId(field),
                representation,
            },
            ObjectKind::DataReader => Self::DataReader {
                subscriber_id: ObjectId(field),
                representation,
            },
            ObjectKind::Type => Self::Type {
                participant_id: ObjectId(field),
                representation,
            },
        };
        Ok((descriptor, 3 + consumed))
    }
}

// ---------------------------------------------------------------------------
// Message header
// ---------------------------------------------------------------------------

/// Top-level message header (8 bytes). Present on every message so a
/// stateless transport can still demultiplex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub session_id: u8,
    pub stream_id: StreamId,
    pub sequence_nr: u16,
    pub client_key: ClientKey,
}

impl MessageHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, AgentError> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(AgentError::BufferTooShort);
        }
        let mut client_key = [0u8; 4];
        client_key.copy_from_slice(&buf[4..8]);
        Ok(Self {
            session_id: buf[0],
            stream_id: StreamId(buf[1]),
            sequence_nr: u16::from_le_bytes([buf[2], buf[3]]),
            client_key: ClientKey(client_key),
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.session_id);
        buf.push(self.stream_id.0);
        buf.extend_from_slice(&self.sequence_nr.to_le_bytes());
        buf.extend_from_slice(&self.client_key.0);
    }
}

// ---------------------------------------------------------------------------
// Submessage header
// ---------------------------------------------------------------------------

/// Submessage header (4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmessageHeader {
    pub submessage_id: u8,
    pub flags: u8,
    pub length: u16,
}

impl SubmessageHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, AgentError> {
        if buf.len() < SUBMESSAGE_HEADER_SIZE {
            return Err(AgentError::BufferTooShort);
        }
        Ok(Self {
            submessage_id: buf[0],
            flags: buf[1],
            length: u16::from_le_bytes([buf[2], buf[3]]),
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.submessage_id);
        buf.push(self.flags);
        buf.extend_from_slice(&self.length.to_le_bytes());
    }
}

// ---------------------------------------------------------------------------
// Submessage payloads
// ---------------------------------------------------------------------------

/// CREATE_CLIENT (0x00) - handshake: cookie + version + key + session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateClientPayload {
    pub cookie: [u8; 4],
    pub version: [u8; 2],
    pub client_key: ClientKey,
    pub session_id: u8,
}

/// CREATE (0x01) - create an object in the client's entity tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePayload {
    pub object_id: ObjectId,
    pub flags: CreationFlags,
    pub descriptor: ObjectDescriptor,
}

/// DELETE (0x02) - delete an object, or the whole client for `ObjectId::CLIENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletePayload {
    pub object_id: ObjectId,
}

/// STATUS (0x05) - agent -> client operation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPayload {
    pub related_object_id: ObjectId,
    pub status: StatusCode,
}

/// WRITE_DATA (0x07)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteDataPayload {
    pub writer_id: ObjectId,
    pub data: Vec<u8>,
}

/// READ_DATA (0x08)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadDataPayload {
    pub reader_id: ObjectId,
    pub max_samples: u16,
}

/// DATA (0x09) - agent -> client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload {
    pub reader_id: ObjectId,
    pub data: Vec<u8>,
}

/// FRAGMENT (0x0B) - one piece of an oversized submessage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentPayload {
    pub fragment_nr: u16,
    pub total_fragments: u16,
    pub data: Vec<u8>,
}

/// HEARTBEAT (0x0D) - advertises the sender's output window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub first_unacked: u16,
    pub last_unacked: u16,
}

/// ACKNACK (0x0E) - first unacknowledged sequence number plus a bitmap of
/// additionally-missing numbers within the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcknackPayload {
    pub first_unacked: u16,
    pub nack_bitmap: u16,
}

// ---------------------------------------------------------------------------
// Unified submessage enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submessage {
    CreateClient(CreateClientPayload),
    Create(CreatePayload),
    Delete(DeletePayload),
    Status(StatusPayload),
    WriteData(WriteDataPayload),
    ReadData(ReadDataPayload),
    Data(DataPayload),
    Fragment(FragmentPayload),
    Heartbeat(HeartbeatPayload),
    Acknack(AcknackPayload),
    Reset,
}

/// A complete wire message: one header + one or more submessages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub header: MessageHeader,
    pub submessages: Vec<Submessage>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn read_u16_le(buf: &[u8], off: usize) -> Result<u16, AgentError> {
    if off + 2 > buf.len() {
        return Err(AgentError::BufferTooShort);
    }
    Ok(u16::from_le_bytes([buf[off], buf[off + 1]]))
}

/// Parse a single submessage (header + payload) starting at `buf`.
/// Returns (submessage, bytes_consumed).
pub fn parse_submessage(buf: &[u8]) -> Result<(Submessage, usize), AgentError> {
    let hdr = SubmessageHeader::parse(buf)?;
    let payload_start = SUBMESSAGE_HEADER_SIZE;
    let payload_end = payload_start + hdr.length as usize;
    if buf.len() < payload_end {
        return Err(AgentError::BufferTooShort);
    }
    let payload = &buf[payload_start..payload_end];

    let submsg = match hdr.submessage_id {
        SUBMSG_CREATE_CLIENT => {
            if payload.len() < 11 {
                return Err(AgentError::PayloadLengthMismatch);
            }
            let mut cookie = [0u8; 4];
            cookie.copy_from_slice(&payload[0..4]);
            let version = [payload[4], payload[5]];
            let mut client_key = [0u8; 4];
            client_key.copy_from_slice(&payload[6..10]);
            Submessage::CreateClient(CreateClientPayload {
                cookie,
                version,
                client_key: ClientKey(client_key),
                session_id: payload[10],
            })
        }
        SUBMSG_CREATE => {
            if payload.len() < 3 {
                return Err(AgentError::PayloadLengthMismatch);
            }
            let object_id = ObjectId(u16::from_le_bytes([payload[0], payload[1]]));
            let flags = CreationFlags::from_byte(payload[2]);
            let (descriptor, _) = ObjectDescriptor::parse(&payload[3..])?;
            Submessage::Create(CreatePayload {
                object_id,
                flags,
                descriptor,
            })
        }
        SUBMSG_DELETE => {
            let object_id = ObjectId(read_u16_le(payload, 0)?);
            Submessage::Delete(DeletePayload { object_id })
        }
        SUBMSG_STATUS => {
            if payload.len() < 3 {
                return Err(AgentError::PayloadLengthMismatch);
            }
            let related_object_id = ObjectId(u16::from_le_bytes([payload[0], payload[1]]));
            let status = StatusCode::from_u8(payload[2])?;
            Submessage::Status(StatusPayload {
                related_object_id,
                status,
            })
        }
        SUBMSG_WRITE_DATA => {
            if payload.len() < 2 {
                return Err(AgentError::PayloadLengthMismatch);
            }
            let writer_id = ObjectId(u16::from_le_bytes([payload[0], payload[1]]));
            Submessage::WriteData(WriteDataPayload {
                writer_id,
                data: payload[2..].to_vec(),
            })
        }
        SUBMSG_READ_DATA => {
            if payload.len() < 4 {
                return Err(AgentError::PayloadLengthMismatch);
            }
            let reader_id = ObjectId(u16::from_le_bytes([payload[0], payload[1]]));
            let max_samples = u16::from_le_bytes([payload[2], payload[3]]);
            Submessage::ReadData(ReadDataPayload {
                reader_id,
                max_samples,
            })
        }
        SUBMSG_DATA => {
            if payload.len() < 2 {
                return Err(AgentError::PayloadLengthMismatch);
            }
            let reader_id = ObjectId(u16::from_le_bytes([payload[0], payload[1]]));
            Submessage::Data(DataPayload {
                reader_id,
                data: payload[2..].to_vec(),
            })
        }
        SUBMSG_FRAGMENT => {
            if payload.len() < 4 {
                return Err(AgentError::PayloadLengthMismatch);
            }
            let fragment_nr = u16::from_le_bytes([payload[0], payload[1]]);
            let total_fragments = u16::from_le_bytes([payload[2], payload[3]]);
            Submessage::Fragment(FragmentPayload {
                fragment_nr,
                total_fragments,
                data: payload[4..].to_vec(),
            })
        }
        SUBMSG_HEARTBEAT => {
            if payload.len() < 4 {
                return Err(AgentError::PayloadLengthMismatch);
            }
            Submessage::Heartbeat(HeartbeatPayload {
                first_unacked: u16::from_le_bytes([payload[0], payload[1]]),
                last_unacked: u16::from_le_bytes([payload[2], payload[3]]),
            })
        }
        SUBMSG_ACKNACK => {
            if payload.len() < 4 {
                return Err(AgentError::PayloadLengthMismatch);
            }
            Submessage::Acknack(AcknackPayload {
                first_unacked: u16::from_le_bytes([payload[0], payload[1]]),
                nack_bitmap: u16::from_le_bytes([payload[2], payload[3]]),
            })
        }
        SUBMSG_RESET => Submessage::Reset,
        other => return Err(AgentError::UnknownSubmessageId(other)),
    };
    Ok((submsg, payload_end))
}

/// Parse a complete wire message (header + one or more submessages).
pub fn parse_message(buf: &[u8]) -> Result<WireMessage, AgentError> {
    let header = MessageHeader::parse(buf)?;
    let mut offset = MESSAGE_HEADER_SIZE;
    let mut submessages = Vec::new();
    while offset < buf.len() {
        let (submsg, consumed) = parse_submessage(&buf[offset..])?;
        submessages.push(submsg);
        offset += consumed;
    }
    if submessages.is_empty() {
        return Err(AgentError::BufferTooShort);
    }
    Ok(WireMessage {
        header,
        submessages,
    })
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Serialize a submessage (header + payload) into bytes.
pub fn serialize_submessage(submsg: &Submessage) -> Vec<u8> {
    let (id, payload) = match submsg {
        Submessage::CreateClient(p) => {
            let mut pl = Vec::with_capacity(11);
            pl.extend_from_slice(&p.cookie);
            pl.extend_from_slice(&p.version);
            pl.extend_from_slice(&p.client_key.0);
            pl.push(p.session_id);
            (SUBMSG_CREATE_CLIENT, pl)
        }
        Submessage::Create(p) => {
            let mut pl = Vec::new();
            pl.extend_from_slice(&p.object_id.0.to_le_bytes());
            pl.push(p.flags.as_byte());
            p.descriptor.write_to(&mut pl);
            (SUBMSG_CREATE, pl)
        }
        Submessage::Delete(p) => (SUBMSG_DELETE, p.object_id.0.to_le_bytes().to_vec()),
        Submessage::Status(p) => {
            let mut pl = Vec::with_capacity(3);
            pl.extend_from_slice(&p.related_object_id.0.to_le_bytes());
            pl.push(p.status.as_u8());
            (SUBMSG_STATUS, pl)
        }
        Submessage::WriteData(p) => {
            let mut pl = Vec::with_capacity(2 + p.data.len());
            pl.extend_from_slice(&p.writer_id.0.to_le_bytes());
            pl.extend_from_slice(&p.data);
            (SUBMSG_WRITE_DATA, pl)
        }
        Submessage::ReadData(p) => {
            let mut pl = Vec::with_capacity(4);
            pl.extend_from_slice(&p.reader_id.0.to_le_bytes());
            pl.extend_from_slice(&p.max_samples.to_le_bytes());
            (SUBMSG_READ_DATA, pl)
        }
        Submessage::Data(p) => {
            let mut pl = Vec::with_capacity(2 + p.data.len());
            pl.extend_from_slice(&p.reader_id.0.to_le_bytes());
            pl.extend_from_slice(&p.data);
            (SUBMSG_DATA, pl)
        }
        Submessage::Fragment(p) => {
            let mut pl = Vec::with_capacity(4 + p.data.len());
            pl.extend_from_slice(&p.fragment_nr.to_le_bytes());
            pl.extend_from_slice(&p.total_fragments.to_le_bytes());
            pl.extend_from_slice(&p.data);
            (SUBMSG_FRAGMENT, pl)
        }
        Submessage::Heartbeat(p) => {
            let mut pl = Vec::with_capacity(4);
            pl.extend_from_slice(&p.first_unacked.to_le_bytes());
            pl.extend_from_slice(&p.last_unacked.to_le_bytes());
            (SUBMSG_HEARTBEAT, pl)
        }
        Submessage::Acknack(p) => {
            let mut pl = Vec::with_capacity(4);
            pl.extend_from_slice(&p.first_unacked.to_le_bytes());
            pl.extend_from_slice(&p.nack_bitmap.to_le_bytes());
            (SUBMSG_ACKNACK, pl)
        }
        Submessage::Reset => (SUBMSG_RESET, Vec::new()),
    };

    let hdr = SubmessageHeader {
        submessage_id: id,
        flags: 0,
        length: payload.len() as u16,
    };
    let mut out = Vec::with_capacity(SUBMESSAGE_HEADER_SIZE + payload.len());
    hdr.write_to(&mut out);
    out.extend_from_slice(&payload);
    out
}

/// Serialize a full message (header + submessages).
pub fn serialize_message(msg: &WireMessage) -> Vec<u8> {
    let mut buf = Vec::new();
    msg.header.write_to(&mut buf);
    for sub in &msg.submessages {
        buf.extend_from_slice(&serialize_submessage(sub));
    }
    buf
}

// ---------------------------------------------------------------------------
// Length-prefixed strings (representation text)
// ---------------------------------------------------------------------------

/// Encode a string as [len_u16_le][utf8_bytes].
pub fn encode_string(s: &str) -> Vec<u8> {
    let len = s.len() as u16;
    let mut buf = Vec::with_capacity(2 + s.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    buf
}

/// Decode a length-prefixed string. Returns (string, bytes_consumed).
pub fn decode_string(buf: &[u8]) -> Result<(String, usize), AgentError> {
    let len = read_u16_le(buf, 0)? as usize;
    if buf.len() < 2 + len {
        return Err(AgentError::BufferTooShort);
    }
    let s = String::from_utf8_lossy(&buf[2..2 + len]).into_owned();
    Ok((s, 2 + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_descriptor() -> ObjectDescriptor {
        ObjectDescriptor::Topic {
            participant_id: ObjectId(0x0001),
            representation: Representation::Inline("<topic><name>t</name></topic>".into()),
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let hdr = MessageHeader {
            session_id: 0x11,
            stream_id: StreamId(0x80),
            sequence_nr: 0xBEEF,
            client_key: ClientKey([1, 2, 3, 4]),
        };
        let mut buf = Vec::new();
        hdr.write_to(&mut buf);
        assert_eq!(buf.len(), MESSAGE_HEADER_SIZE);
        assert_eq!(MessageHeader::parse(&buf).unwrap(), hdr);
    }

    #[test]
    fn test_stream_id_ranges() {
        assert_eq!(StreamId(0x00).kind(), StreamKind::NoSequencing);
        assert_eq!(StreamId(0x01).kind(), StreamKind::BestEffort);
        assert_eq!(StreamId(0x7F).kind(), StreamKind::BestEffort);
        assert_eq!(StreamId(0x80).kind(), StreamKind::Reliable);
        assert_eq!(StreamId(0xFF).kind(), StreamKind::Reliable);
    }

    #[test]
    fn test_creation_flags_byte() {
        for (reuse, replace) in [(false, false), (true, false), (false, true), (true, true)] {
            let flags = CreationFlags { reuse, replace };
            assert_eq!(CreationFlags::from_byte(flags.as_byte()), flags);
        }
    }

    #[test]
    fn test_create_roundtrip() {
        let sub = Submessage::Create(CreatePayload {
            object_id: ObjectId(0x0022),
            flags: CreationFlags {
                reuse: true,
                replace: false,
            },
            descriptor: sample_descriptor(),
        });
        let bytes = serialize_submessage(&sub);
        let (parsed, consumed) = parse_submessage(&bytes).unwrap();
        assert_eq!(parsed, sub);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_all_submessages_roundtrip() {
        let subs = vec![
            Submessage::CreateClient(CreateClientPayload {
                cookie: COOKIE,
                version: [VERSION_MAJOR, VERSION_MINOR],
                client_key: ClientKey([0xDE, 0xAD, 0xBE, 0xEF]),
                session_id: 0x01,
            }),
            Submessage::Delete(DeletePayload {
                object_id: ObjectId(42),
            }),
            Submessage::Status(StatusPayload {
                related_object_id: ObjectId(42),
                status: StatusCode::OkMatched,
            }),
            Submessage::WriteData(WriteDataPayload {
                writer_id: ObjectId(10),
                data: vec![1, 2, 3],
            }),
            Submessage::ReadData(ReadDataPayload {
                reader_id: ObjectId(20),
                max_samples: 5,
            }),
            Submessage::Data(DataPayload {
                reader_id: ObjectId(20),
                data: vec![0xAA],
            }),
            Submessage::Fragment(FragmentPayload {
                fragment_nr: 1,
                total_fragments: 3,
                data: vec![9; 16],
            }),
            Submessage::Heartbeat(HeartbeatPayload {
                first_unacked: 1,
                last_unacked: 5,
            }),
            Submessage::Acknack(AcknackPayload {
                first_unacked: 3,
                nack_bitmap: 0x0005,
            }),
            Submessage::Reset,
        ];
        for sub in &subs {
            let bytes = serialize_submessage(sub);
            let (parsed, consumed) = parse_submessage(&bytes).unwrap();
            assert_eq!(&parsed, sub);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn test_descriptor_matches_relation() {
        let a = sample_descriptor();
        let b = sample_descriptor();
        assert_eq!(a, b);

        // Different representation kind mismatches even with identical text.
        let c = ObjectDescriptor::Topic {
            participant_id: ObjectId(0x0001),
            representation: Representation::Reference("<topic><name>t</name></topic>".into()),
        };
        assert_ne!(a, c);

        // Different parent linkage mismatches.
        let d = ObjectDescriptor::Topic {
            participant_id: ObjectId(0x0002),
            representation: Representation::Inline("<topic><name>t</name></topic>".into()),
        };
        assert_ne!(a, d);
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let sub = Submessage::WriteData(WriteDataPayload {
            writer_id: ObjectId(1),
            data: vec![7; 8],
        });
        let bytes = serialize_submessage(&sub);
        for cut in 0..bytes.len() {
            assert!(parse_submessage(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_message_requires_submessage() {
        let hdr = MessageHeader {
            session_id: 0,
            stream_id: StreamId::NONE,
            sequence_nr: 0,
            client_key: ClientKey::INVALID,
        };
        let mut buf = Vec::new();
        hdr.write_to(&mut buf);
        assert!(parse_message(&buf).is_err());
    }
}
