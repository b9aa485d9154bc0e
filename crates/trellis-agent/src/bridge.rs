// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// MiddlewareBridge trait - connects the agent to an actual pub/sub
// middleware implementation.
//
// This is intentionally middleware-agnostic: any pub/sub library can
// implement it.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::AgentError;
use crate::protocol::Representation;

/// Bridge between the trellis agent and an actual middleware.
///
/// Each method maps to an operation the agent forwards when a client's
/// entity is created, deleted, or used. Handles are opaque middleware
/// entity ids owned by the implementation.
pub trait MiddlewareBridge: Send + Sync {
    /// Create a domain participant from its representation.
    fn create_participant(
        &self,
        domain_id: u16,
        representation: &Representation,
    ) -> Result<u32, AgentError>;

    /// Create a topic under the given participant.
    fn create_topic(
        &self,
        participant: u32,
        representation: &Representation,
    ) -> Result<u32, AgentError>;

    /// Create a publisher under the given participant.
    fn create_publisher(
        &self,
        participant: u32,
        representation: &Representation,
    ) -> Result<u32, AgentError>;

    /// Create a subscriber under the given participant.
    fn create_subscriber(
        &self,
        participant: u32,
        representation: &Representation,
    ) -> Result<u32, AgentError>;

    /// Create a data writer under the given publisher.
    fn create_writer(
        &self,
        publisher: u32,
        representation: &Representation,
    ) -> Result<u32, AgentError>;

    /// Create a data reader under the given subscriber.
    fn create_reader(
        &self,
        subscriber: u32,
        representation: &Representation,
    ) -> Result<u32, AgentError>;

    /// Register a type with the given participant.
    fn register_type(
        &self,
        participant: u32,
        representation: &Representation,
    ) -> Result<u32, AgentError>;

    /// Write serialized data through the given writer.
    fn write(&self, writer: u32, data: &[u8]) -> Result<(), AgentError>;

    /// Take one sample from the given reader. `None` if no data is
    /// available.
    fn take(&self, reader: u32) -> Result<Option<Vec<u8>>, AgentError>;

    /// Delete a middleware entity by handle.
    fn delete_entity(&self, handle: u32) -> Result<(), AgentError>;
}

// ---------------------------------------------------------------------------
// Null bridge (for testing)
// ---------------------------------------------------------------------------

/// A bridge that always succeeds and hands out fresh handles. Useful for
/// protocol-level testing without a real middleware stack.
#[derive(Debug)]
pub struct NullBridge {
    next_handle: AtomicU32,
}

impl Default for NullBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl NullBridge {
    /// Handles start at 1; 0 is never handed out.
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU32::new(1),
        }
    }

    fn fresh(&self) -> u32 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl MiddlewareBridge for NullBridge {
    fn create_participant(
        &self,
        _domain_id: u16,
        _representation: &Representation,
    ) -> Result<u32, AgentError> {
        Ok(self.fresh())
    }

    fn create_topic(
        &self,
        _participant: u32,
        _representation: &Representation,
    ) -> Result<u32, AgentError> {
        Ok(self.fresh())
    }

    fn create_publisher(
        &self,
        _participant: u32,
        _representation: &Representation,
    ) -> Result<u32, AgentError> {
        Ok(self.fresh())
    }

    fn create_subscriber(
        &self,
        _participant: u32,
        _representation: &Representation,
    ) -> Result<u32, AgentError> {
        Ok(self.fresh())
    }

    fn create_writer(
        &self,
        _publisher: u32,
        _representation: &Representation,
    ) -> Result<u32, AgentError> {
        Ok(self.fresh())
    }

    fn create_reader(
        &self,
        _subscriber: u32,
        _representation: &Representation,
    ) -> Result<u32, AgentError> {
        Ok(self.fresh())
    }

    fn register_type(
        &self,
        _participant: u32,
        _representation: &Representation,
    ) -> Result<u32, AgentError> {
        Ok(self.fresh())
    }

    fn write(&self, _writer: u32, _data: &[u8]) -> Result<(), AgentError> {
        Ok(())
    }

    fn take(&self, _reader: u32) -> Result<Option<Vec<u8>>, AgentError> {
        Ok(None)
    }

    fn delete_entity(&self, _handle: u32) -> Result<(), AgentError> {
        Ok(())
    }
}
