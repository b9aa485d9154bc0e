// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Client registry and per-client state.
//
// `Root` owns the key -> client map and linearizes handshakes per key
// under one mutex. Each `ProxyClient` carries its entity tree and session
// behind its own mutex, so traffic for distinct clients runs fully in
// parallel while mutations of one client stay serialized.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::{Mutex, MutexGuard};

use crate::bridge::MiddlewareBridge;
use crate::config::AgentConfig;
use crate::protocol::{ClientKey, CreateClientPayload, StatusCode, COOKIE, VERSION_MAJOR};
use crate::session::Session;
use crate::tree::EntityTree;

/// Mutable per-client state, guarded by the client's mutex.
#[derive(Debug)]
pub struct ClientState {
    pub session_id: u8,
    pub tree: EntityTree,
    pub session: Session,
    pub last_activity: Instant,
}

/// One connected client: entity tree + stream lanes.
#[derive(Debug)]
pub struct ProxyClient {
    key: ClientKey,
    state: Mutex<ClientState>,
}

impl ProxyClient {
    fn new(key: ClientKey, session_id: u8, config: &AgentConfig, now: Instant) -> Self {
        Self {
            key,
            state: Mutex::new(ClientState {
                session_id,
                tree: EntityTree::new(),
                session: Session::new(session_id, key, config),
                last_activity: now,
            }),
        }
    }

    pub fn key(&self) -> ClientKey {
        self.key
    }

    pub fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock()
    }
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

/// Outcome of a CREATE_CLIENT handshake.
#[derive(Debug)]
pub enum Handshake {
    /// Fresh client, or an existing key replaced under a new session id.
    Created(Arc<ProxyClient>),
    /// Same key, same session id: lanes reset, tree kept.
    Reconnected(Arc<ProxyClient>),
    /// Handshake rejected with the given status.
    Refused(StatusCode),
}

/// The agent-wide client registry.
pub struct Root {
    config: AgentConfig,
    clients: Mutex<HashMap<ClientKey, Arc<ProxyClient>>>,
}

impl Root {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    pub fn get_client(&self, key: ClientKey) -> Option<Arc<ProxyClient>> {
        self.clients.lock().get(&key).cloned()
    }

    /// Snapshot of every connected client.
    pub fn clients(&self) -> Vec<Arc<ProxyClient>> {
        self.clients.lock().values().cloned().collect()
    }

    /// Resolve a CREATE_CLIENT greeting.
    ///
    /// Bad cookie -> ERR_INVALID_DATA; wrong major version ->
    /// ERR_INCOMPATIBLE; a known key with the same session id is a
    /// reconnect (lanes reset, entities kept); a known key with a new
    /// session id replaces the client outright; a new key past
    /// `max_clients` -> ERR_RESOURCES.
    pub fn create_client(
        &self,
        bridge: &dyn MiddlewareBridge,
        greeting: &CreateClientPayload,
        now: Instant,
    ) -> Handshake {
        if greeting.cookie != COOKIE {
            debug!("handshake: bad cookie {:02x?}", greeting.cookie);
            return Handshake::Refused(StatusCode::ErrInvalidData);
        }
        if greeting.version[0] != VERSION_MAJOR {
            debug!("handshake: incompatible version {:?}", greeting.version);
            return Handshake::Refused(StatusCode::ErrIncompatible);
        }

        let mut clients = self.clients.lock();
        if let Some(existing) = clients.get(&greeting.client_key).cloned() {
            let mut state = existing.lock();
            if state.session_id == greeting.session_id {
                info!("client {} reconnected", greeting.client_key);
                state.session.reset();
                state.last_activity = now;
                drop(state);
                return Handshake::Reconnected(existing);
            }
            // New session id: the old incarnation is gone for good.
            info!(
                "client {} replaced (session {} -> {})",
                greeting.client_key, state.session_id, greeting.session_id
            );
            state.tree.clear(bridge);
            drop(state);
            clients.remove(&greeting.client_key);
        } else if clients.len() >= self.config.max_clients {
            debug!(
                "handshake: at capacity ({} clients)",
                self.config.max_clients
            );
            return Handshake::Refused(StatusCode::ErrResources);
        }

        let client = Arc::new(ProxyClient::new(
            greeting.client_key,
            greeting.session_id,
            &self.config,
            now,
        ));
        clients.insert(greeting.client_key, Arc::clone(&client));
        info!("client {} created", greeting.client_key);
        Handshake::Created(client)
    }

    /// Remove a client, tearing down its entity tree.
    pub fn delete_client(&self, bridge: &dyn MiddlewareBridge, key: ClientKey) -> StatusCode {
        let removed = self.clients.lock().remove(&key);
        match removed {
            Some(client) => {
                client.lock().tree.clear(bridge);
                info!("client {key} deleted");
                StatusCode::Ok
            }
            None => StatusCode::ErrUnknownReference,
        }
    }

    /// Drop every client idle longer than `timeout`. Returns the evicted
    /// keys so the caller can release transport bindings.
    pub fn evict_expired(
        &self,
        bridge: &dyn MiddlewareBridge,
        now: Instant,
        timeout: Duration,
    ) -> Vec<ClientKey> {
        let mut clients = self.clients.lock();
        let expired: Vec<ClientKey> = clients
            .iter()
            .filter(|(_, c)| now.duration_since(c.lock().last_activity) > timeout)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            if let Some(client) = clients.remove(key) {
                client.lock().tree.clear(bridge);
                info!("client {key} evicted after inactivity");
            }
        }
        expired
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NullBridge;

    const KEY: ClientKey = ClientKey([1, 2, 3, 4]);

    fn greeting(key: ClientKey, session_id: u8) -> CreateClientPayload {
        CreateClientPayload {
            cookie: COOKIE,
            version: [VERSION_MAJOR, 0],
            client_key: key,
            session_id,
        }
    }

    #[test]
    fn test_handshake_creates() {
        let root = Root::new(AgentConfig::default());
        let bridge = NullBridge::new();
        match root.create_client(&bridge, &greeting(KEY, 1), Instant::now()) {
            Handshake::Created(client) => assert_eq!(client.key(), KEY),
            other => panic!("expected Created, got {other:?}"),
        }
        assert_eq!(root.len(), 1);
    }

    #[test]
    fn test_bad_cookie_refused() {
        let root = Root::new(AgentConfig::default());
        let bridge = NullBridge::new();
        let mut g = greeting(KEY, 1);
        g.cookie = *b"NOPE";
        match root.create_client(&bridge, &g, Instant::now()) {
            Handshake::Refused(StatusCode::ErrInvalidData) => {}
            other => panic!("expected ErrInvalidData, got {other:?}"),
        }
        assert!(root.is_empty());
    }

    #[test]
    fn test_version_mismatch_refused() {
        let root = Root::new(AgentConfig::default());
        let bridge = NullBridge::new();
        let mut g = greeting(KEY, 1);
        g.version = [VERSION_MAJOR + 1, 0];
        match root.create_client(&bridge, &g, Instant::now()) {
            Handshake::Refused(StatusCode::ErrIncompatible) => {}
            other => panic!("expected ErrIncompatible, got {other:?}"),
        }
    }

    #[test]
    fn test_same_session_is_reconnect() {
        let root = Root::new(AgentConfig::default());
        let bridge = NullBridge::new();
        let first = match root.create_client(&bridge, &greeting(KEY, 1), Instant::now()) {
            Handshake::Created(c) => c,
            other => panic!("{other:?}"),
        };
        match root.create_client(&bridge, &greeting(KEY, 1), Instant::now()) {
            Handshake::Reconnected(c) => assert!(Arc::ptr_eq(&first, &c)),
            other => panic!("expected Reconnected, got {other:?}"),
        }
        assert_eq!(root.len(), 1);
    }

    #[test]
    fn test_new_session_replaces() {
        let root = Root::new(AgentConfig::default());
        let bridge = NullBridge::new();
        let first = match root.create_client(&bridge, &greeting(KEY, 1), Instant::now()) {
            Handshake::Created(c) => c,
            other => panic!("{other:?}"),
        };
        match root.create_client(&bridge, &greeting(KEY, 2), Instant::now()) {
            Handshake::Created(c) => assert!(!Arc::ptr_eq(&first, &c)),
            other => panic!("expected Created, got {other:?}"),
        }
        assert_eq!(root.len(), 1);
    }

    #[test]
    fn test_capacity_refuses_new_keys() {
        let root = Root::new(AgentConfig {
            max_clients: 1,
            ..AgentConfig::default()
        });
        let bridge = NullBridge::new();
        root.create_client(&bridge, &greeting(KEY, 1), Instant::now());
        let other_key = ClientKey([9, 9, 9, 9]);
        match root.create_client(&bridge, &greeting(other_key, 1), Instant::now()) {
            Handshake::Refused(StatusCode::ErrResources) => {}
            other => panic!("expected ErrResources, got {other:?}"),
        }
        // Known keys still reconnect at capacity.
        match root.create_client(&bridge, &greeting(KEY, 1), Instant::now()) {
            Handshake::Reconnected(_) => {}
            other => panic!("expected Reconnected, got {other:?}"),
        }
    }

    #[test]
    fn test_delete_client() {
        let root = Root::new(AgentConfig::default());
        let bridge = NullBridge::new();
        root.create_client(&bridge, &greeting(KEY, 1), Instant::now());
        assert_eq!(root.delete_client(&bridge, KEY), StatusCode::Ok);
        assert_eq!(
            root.delete_client(&bridge, KEY),
            StatusCode::ErrUnknownReference
        );
        assert!(root.get_client(KEY).is_none());
    }

    #[test]
    fn test_evict_expired() {
        let root = Root::new(AgentConfig::default());
        let bridge = NullBridge::new();
        let t0 = Instant::now();
        root.create_client(&bridge, &greeting(KEY, 1), t0);
        let fresh_key = ClientKey([5, 6, 7, 8]);
        let t1 = t0 + Duration::from_secs(60);
        root.create_client(&bridge, &greeting(fresh_key, 1), t1);
        let evicted = root.evict_expired(&bridge, t1, Duration::from_secs(30));
        assert_eq!(evicted, vec![KEY]);
        assert!(root.get_client(KEY).is_none());
        assert!(root.get_client(fresh_key).is_some());
    }
}
