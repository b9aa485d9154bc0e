// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Trellis protocol gateway.
//!
//! Bridges resource-constrained clients speaking the compact Trellis wire
//! protocol into a full pub/sub middleware. Clients open a session, build a
//! tree of middleware entities by id, and exchange data over numbered
//! stream lanes with optional reliability.
//!
//! # Architecture
//!
//! ```text
//! Trellis Client (MCU)            Trellis Agent (this crate)     Middleware
//!   ESP32 / STM32                   Linux server
//!        |                                |                          |
//!        |--- CREATE_CLIENT ------------>|                          |
//!        |--- CREATE(writer) ----------->|--- create entity ------->|
//!        |--- WRITE_DATA(payload) ------>|--- write --------------->|
//!        |<-- DATA(payload) -------------|<-- sample ---------------|
//!        |<-- HEARTBEAT / ACKNACK ------>|                          |
//!        |--- DELETE ------------------->|--- teardown ------------>|
//! ```
//!
//! # Key Features
//!
//! - **Transport front-ends**: TCP (length-prefix framed) and UDP (one
//!   datagram per message), both feeding a shared FCFS worker pool
//! - **Middleware-agnostic**: any pub/sub library plugs in via
//!   [`MiddlewareBridge`]
//! - **Stream reliability**: per-lane sequence numbers, retransmission
//!   windows, heartbeats, and transparent fragmentation
//! - **Entity tree**: per-client registry with reuse/replace creation
//!   resolution and cascading delete

pub mod agent;
pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod protocol;
pub mod scheduler;
pub mod seq;
pub mod server;
pub mod session;
pub mod source_map;
pub mod stream;
pub mod tree;

// Re-exports for convenience.
pub use agent::{Agent, ProcessResult, SessionEvent, TickResult};
pub use bridge::{MiddlewareBridge, NullBridge};
pub use client::{Handshake, ProxyClient, Root};
pub use config::AgentConfig;
pub use error::AgentError;
pub use framing::FrameDecoder;
pub use protocol::{
    // Identifiers
    ClientKey, ObjectId, StreamId,
    // Message types
    MessageHeader, SubmessageHeader, Submessage, WireMessage,
    // Payload types
    CreateClientPayload, CreatePayload, DeletePayload,
    WriteDataPayload, ReadDataPayload, DataPayload,
    StatusPayload, HeartbeatPayload, AcknackPayload, FragmentPayload,
    // Enums
    CreationFlags, ObjectDescriptor, ObjectKind, Representation, StatusCode, StreamKind,
    // Functions
    parse_message, parse_submessage, serialize_message, serialize_submessage,
};
pub use scheduler::FcfsScheduler;
pub use seq::SeqNum;
pub use server::{TcpSessionServer, UdpSessionServer};
pub use session::Session;
pub use source_map::SourceClientMap;
pub use tree::EntityTree;
