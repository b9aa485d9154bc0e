// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Per-client entity tree.
//
// Clients build a hierarchy of middleware entities (participant -> topic /
// publisher / subscriber -> writer / reader) addressed by 16-bit object
// ids. CREATE requests resolve against the tree through the creation-mode
// flags; DELETE cascades to descendants.

use std::collections::HashMap;

use log::debug;

use crate::bridge::MiddlewareBridge;
use crate::protocol::{CreationFlags, ObjectDescriptor, ObjectId, ObjectKind, StatusCode};

/// One node of the tree: the descriptor the client supplied plus the
/// middleware handle the bridge returned for it.
#[derive(Debug, Clone)]
struct Entity {
    descriptor: ObjectDescriptor,
    handle: u32,
}

/// Registry of a single client's entities.
#[derive(Debug, Default)]
pub struct EntityTree {
    entities: HashMap<ObjectId, Entity>,
}

impl EntityTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn kind_of(&self, id: ObjectId) -> Option<ObjectKind> {
        self.entities.get(&id).map(|e| e.descriptor.kind())
    }

    /// Middleware handle of `id` when it resolves to an entity of `kind`.
    pub fn handle_of(&self, id: ObjectId, kind: ObjectKind) -> Option<u32> {
        self.entities
            .get(&id)
            .filter(|e| e.descriptor.kind() == kind)
            .map(|e| e.handle)
    }

    /// Resolve a CREATE against the tree.
    ///
    /// Creation-mode matrix: a new id always creates; an occupied id
    /// recreates when `replace` is set, binds when `reuse` is set and the
    /// descriptor matches, and errors otherwise (ERR_MISMATCH when `reuse`
    /// was asked for, ERR_ALREADY_EXISTS when it was not).
    ///
    /// The bridge entity is created before any tree mutation, so a bridge
    /// failure leaves the tree untouched.
    pub fn create_object(
        &mut self,
        bridge: &dyn MiddlewareBridge,
        id: ObjectId,
        flags: CreationFlags,
        descriptor: ObjectDescriptor,
    ) -> StatusCode {
        if let Some(existing) = self.entities.get(&id) {
            if !flags.replace {
                if flags.reuse {
                    if existing.descriptor == descriptor {
                        return StatusCode::OkMatched;
                    }
                    return StatusCode::ErrMismatch;
                }
                return StatusCode::ErrAlreadyExists;
            }
        }

        // Child entities must name a live parent of the right kind.
        let parent_handle = match (descriptor.parent_id(), descriptor.parent_kind()) {
            (Some(parent_id), Some(parent_kind)) => {
                match self.handle_of(parent_id, parent_kind) {
                    Some(handle) => Some(handle),
                    None => {
                        debug!(
                            "create {:04x}: parent {:04x} missing or wrong kind",
                            id.0, parent_id.0
                        );
                        return StatusCode::ErrInvalidData;
                    }
                }
            }
            _ => None,
        };

        let created = match &descriptor {
            ObjectDescriptor::Participant {
                domain_id,
                representation,
            } => bridge.create_participant(*domain_id, representation),
            ObjectDescriptor::Topic { representation, .. } => {
                bridge.create_topic(parent_handle.unwrap_or(0), representation)
            }
            ObjectDescriptor::Publisher { representation, .. } => {
                bridge.create_publisher(parent_handle.unwrap_or(0), representation)
            }
            ObjectDescriptor::Subscriber { representation, .. } => {
                bridge.create_subscriber(parent_handle.unwrap_or(0), representation)
            }
            ObjectDescriptor::DataWriter { representation, .. } => {
                bridge.create_writer(parent_handle.unwrap_or(0), representation)
            }
            ObjectDescriptor::DataReader { representation, .. } => {
                bridge.create_reader(parent_handle.unwrap_or(0), representation)
            }
            ObjectDescriptor::Type { representation, .. } => {
                bridge.register_type(parent_handle.unwrap_or(0), representation)
            }
        };

        let handle = match created {
            Ok(handle) => handle,
            Err(err) => {
                debug!("create {:04x}: bridge refused: {err}", id.0);
                return StatusCode::ErrInvalidData;
            }
        };

        if self.entities.contains_key(&id) {
            // replace path: tear down the old entity and its descendants
            self.remove_cascade(bridge, id);
        }
        self.entities.insert(id, Entity { descriptor, handle });
        StatusCode::Ok
    }

    /// Delete `id` and every descendant, releasing the bridge entities.
    pub fn delete_object(&mut self, bridge: &dyn MiddlewareBridge, id: ObjectId) -> StatusCode {
        if !self.entities.contains_key(&id) {
            return StatusCode::ErrUnknownReference;
        }
        self.remove_cascade(bridge, id);
        StatusCode::Ok
    }

    /// Tear down every entity. Used when the whole client goes away.
    pub fn clear(&mut self, bridge: &dyn MiddlewareBridge) {
        // roots first, remove_cascade takes their subtrees with them
        let roots: Vec<ObjectId> = self
            .entities
            .iter()
            .filter(|(_, e)| e.descriptor.parent_id().is_none())
            .map(|(id, _)| *id)
            .collect();
        for id in roots {
            self.remove_cascade(bridge, id);
        }
        // orphans (parent already gone) may remain
        let rest: Vec<ObjectId> = self.entities.keys().copied().collect();
        for id in rest {
            self.remove_cascade(bridge, id);
        }
    }

    /// Remove `id` and all transitive children, deleting bridge entities
    /// leaf-first. Bridge delete failures are logged and do not stop the
    /// cascade.
    fn remove_cascade(&mut self, bridge: &dyn MiddlewareBridge, id: ObjectId) {
        let mut victims = vec![id];
        let mut cursor = 0;
        while cursor < victims.len() {
            let current = victims[cursor];
            cursor += 1;
            let children: Vec<ObjectId> = self
                .entities
                .iter()
                .filter(|(_, e)| e.descriptor.parent_id() == Some(current))
                .map(|(child, _)| *child)
                .collect();
            victims.extend(children);
        }
        for victim in victims.iter().rev() {
            if let Some(entity) = self.entities.remove(victim) {
                if let Err(err) = bridge.delete_entity(entity.handle) {
                    debug!("delete {:04x}: bridge error: {err}", victim.0);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NullBridge;
    use crate::error::AgentError;
    use crate::protocol::Representation;

    fn participant(domain_id: u16, repr: &str) -> ObjectDescriptor {
        ObjectDescriptor::Participant {
            domain_id,
            representation: Representation::Reference(repr.to_owned()),
        }
    }

    fn topic(participant_id: ObjectId, repr: &str) -> ObjectDescriptor {
        ObjectDescriptor::Topic {
            participant_id,
            representation: Representation::Reference(repr.to_owned()),
        }
    }

    fn flags(reuse: bool, replace: bool) -> CreationFlags {
        CreationFlags { reuse, replace }
    }

    const PART: ObjectId = ObjectId(0x0001);

    #[test]
    fn test_fresh_id_creates() {
        let bridge = NullBridge::new();
        let mut tree = EntityTree::new();
        let st = tree.create_object(&bridge, PART, flags(false, false), participant(0, "p"));
        assert_eq!(st, StatusCode::Ok);
        assert!(tree.contains(PART));
    }

    #[test]
    fn test_no_flags_on_existing_is_already_exists() {
        let bridge = NullBridge::new();
        let mut tree = EntityTree::new();
        tree.create_object(&bridge, PART, flags(false, false), participant(0, "p"));
        // same and different descriptors both refuse without flags
        let same = tree.create_object(&bridge, PART, flags(false, false), participant(0, "p"));
        let diff = tree.create_object(&bridge, PART, flags(false, false), participant(1, "q"));
        assert_eq!(same, StatusCode::ErrAlreadyExists);
        assert_eq!(diff, StatusCode::ErrAlreadyExists);
    }

    #[test]
    fn test_reuse_binds_on_match() {
        let bridge = NullBridge::new();
        let mut tree = EntityTree::new();
        tree.create_object(&bridge, PART, flags(false, false), participant(0, "p"));
        let st = tree.create_object(&bridge, PART, flags(true, false), participant(0, "p"));
        assert_eq!(st, StatusCode::OkMatched);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_reuse_without_replace_mismatches() {
        let bridge = NullBridge::new();
        let mut tree = EntityTree::new();
        tree.create_object(&bridge, PART, flags(false, false), participant(0, "p"));
        let st = tree.create_object(&bridge, PART, flags(true, false), participant(1, "q"));
        assert_eq!(st, StatusCode::ErrMismatch);
    }

    #[test]
    fn test_replace_recreates_regardless_of_match() {
        let bridge = NullBridge::new();
        let mut tree = EntityTree::new();
        tree.create_object(&bridge, PART, flags(false, false), participant(0, "p"));
        for (reuse, desc) in [
            (false, participant(0, "p")),
            (false, participant(1, "q")),
            (true, participant(0, "p")),
            (true, participant(1, "q")),
        ] {
            let st = tree.create_object(&bridge, PART, flags(reuse, true), desc);
            assert_eq!(st, StatusCode::Ok);
        }
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_replace_tears_down_descendants() {
        let bridge = NullBridge::new();
        let mut tree = EntityTree::new();
        tree.create_object(&bridge, PART, flags(false, false), participant(0, "p"));
        tree.create_object(&bridge, ObjectId(0x0002), flags(false, false), topic(PART, "t"));
        let st = tree.create_object(&bridge, PART, flags(false, true), participant(1, "q"));
        assert_eq!(st, StatusCode::Ok);
        assert!(!tree.contains(ObjectId(0x0002)));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_child_requires_parent_of_right_kind() {
        let bridge = NullBridge::new();
        let mut tree = EntityTree::new();
        // no parent at all
        let st = tree.create_object(&bridge, ObjectId(2), flags(false, false), topic(PART, "t"));
        assert_eq!(st, StatusCode::ErrInvalidData);
        // parent exists but is a topic, not a publisher
        tree.create_object(&bridge, PART, flags(false, false), participant(0, "p"));
        tree.create_object(&bridge, ObjectId(2), flags(false, false), topic(PART, "t"));
        let writer = ObjectDescriptor::DataWriter {
            publisher_id: ObjectId(2),
            representation: Representation::Reference("w".to_owned()),
        };
        let st = tree.create_object(&bridge, ObjectId(3), flags(false, false), writer);
        assert_eq!(st, StatusCode::ErrInvalidData);
    }

    #[test]
    fn test_delete_cascades_to_descendants() {
        let bridge = NullBridge::new();
        let mut tree = EntityTree::new();
        tree.create_object(&bridge, PART, flags(false, false), participant(0, "p"));
        tree.create_object(&bridge, ObjectId(2), flags(false, false), topic(PART, "t"));
        let publisher = ObjectDescriptor::Publisher {
            participant_id: PART,
            representation: Representation::Reference("pub".to_owned()),
        };
        tree.create_object(&bridge, ObjectId(3), flags(false, false), publisher);
        let writer = ObjectDescriptor::DataWriter {
            publisher_id: ObjectId(3),
            representation: Representation::Reference("w".to_owned()),
        };
        tree.create_object(&bridge, ObjectId(4), flags(false, false), writer);

        assert_eq!(tree.delete_object(&bridge, PART), StatusCode::Ok);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_delete_unknown_id() {
        let bridge = NullBridge::new();
        let mut tree = EntityTree::new();
        assert_eq!(
            tree.delete_object(&bridge, ObjectId(0x0042)),
            StatusCode::ErrUnknownReference
        );
    }

    #[test]
    fn test_delete_leaf_keeps_siblings() {
        let bridge = NullBridge::new();
        let mut tree = EntityTree::new();
        tree.create_object(&bridge, PART, flags(false, false), participant(0, "p"));
        tree.create_object(&bridge, ObjectId(2), flags(false, false), topic(PART, "a"));
        tree.create_object(&bridge, ObjectId(3), flags(false, false), topic(PART, "b"));
        assert_eq!(tree.delete_object(&bridge, ObjectId(2)), StatusCode::Ok);
        assert!(tree.contains(PART));
        assert!(tree.contains(ObjectId(3)));
        assert_eq!(tree.len(), 2);
    }

    // Bridge that refuses every creation, for the no-mutation guarantee.
    struct RefusingBridge;

    impl MiddlewareBridge for RefusingBridge {
        fn create_participant(
            &self,
            _domain_id: u16,
            _repr: &Representation,
        ) -> Result<u32, AgentError> {
            Err(AgentError::BridgeError("refused".into()))
        }
        fn create_topic(&self, _p: u32, _r: &Representation) -> Result<u32, AgentError> {
            Err(AgentError::BridgeError("refused".into()))
        }
        fn create_publisher(&self, _p: u32, _r: &Representation) -> Result<u32, AgentError> {
            Err(AgentError::BridgeError("refused".into()))
        }
        fn create_subscriber(&self, _p: u32, _r: &Representation) -> Result<u32, AgentError> {
            Err(AgentError::BridgeError("refused".into()))
        }
        fn create_writer(&self, _p: u32, _r: &Representation) -> Result<u32, AgentError> {
            Err(AgentError::BridgeError("refused".into()))
        }
        fn create_reader(&self, _p: u32, _r: &Representation) -> Result<u32, AgentError> {
            Err(AgentError::BridgeError("refused".into()))
        }
        fn register_type(&self, _p: u32, _r: &Representation) -> Result<u32, AgentError> {
            Err(AgentError::BridgeError("refused".into()))
        }
        fn write(&self, _w: u32, _d: &[u8]) -> Result<(), AgentError> {
            Ok(())
        }
        fn take(&self, _r: u32) -> Result<Option<Vec<u8>>, AgentError> {
            Ok(None)
        }
        fn delete_entity(&self, _h: u32) -> Result<(), AgentError> {
            Ok(())
        }
    }

    #[test]
    fn test_bridge_failure_leaves_tree_untouched() {
        let bridge = RefusingBridge;
        let mut tree = EntityTree::new();
        let st = tree.create_object(&bridge, PART, flags(false, false), participant(0, "p"));
        assert_eq!(st, StatusCode::ErrInvalidData);
        assert!(tree.is_empty());

        // replace path must also keep the old entity on failure
        let good = NullBridge::new();
        tree.create_object(&good, PART, flags(false, false), participant(0, "p"));
        let st = tree.create_object(&bridge, PART, flags(false, true), participant(1, "q"));
        assert_eq!(st, StatusCode::ErrInvalidData);
        assert!(tree.contains(PART));
    }
}
