// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Transport source <-> client key mapping.
//
// The transport layer addresses peers by socket address, the protocol by
// client key. Both directions live in one struct behind one mutex so they
// can never disagree.

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::Mutex;

use crate::protocol::ClientKey;

#[derive(Debug, Default)]
struct MapsInner {
    by_source: HashMap<SocketAddr, ClientKey>,
    by_key: HashMap<ClientKey, SocketAddr>,
}

/// Bidirectional source/client-key map.
#[derive(Debug, Default)]
pub struct SourceClientMap {
    inner: Mutex<MapsInner>,
}

impl SourceClientMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `source` to `key`, removing any stale binding either of them
    /// held. After this, exactly one pair involves `source` or `key`.
    pub fn bind(&self, source: SocketAddr, key: ClientKey) {
        let mut inner = self.inner.lock();
        if let Some(old_key) = inner.by_source.remove(&source) {
            inner.by_key.remove(&old_key);
        }
        if let Some(old_source) = inner.by_key.remove(&key) {
            inner.by_source.remove(&old_source);
        }
        inner.by_source.insert(source, key);
        inner.by_key.insert(key, source);
    }

    /// Drop the binding for `source`, if any.
    pub fn unbind_source(&self, source: SocketAddr) {
        let mut inner = self.inner.lock();
        if let Some(key) = inner.by_source.remove(&source) {
            inner.by_key.remove(&key);
        }
    }

    /// Drop the binding for `key`, if any.
    pub fn unbind_key(&self, key: ClientKey) {
        let mut inner = self.inner.lock();
        if let Some(source) = inner.by_key.remove(&key) {
            inner.by_source.remove(&source);
        }
    }

    /// Key bound to `source`, or `ClientKey::INVALID` when unbound.
    pub fn client_key_of(&self, source: SocketAddr) -> ClientKey {
        self.inner
            .lock()
            .by_source
            .get(&source)
            .copied()
            .unwrap_or(ClientKey::INVALID)
    }

    /// Source bound to `key`, if any.
    pub fn source_of(&self, key: ClientKey) -> Option<SocketAddr> {
        self.inner.lock().by_key.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_source.is_empty()
    }
}
