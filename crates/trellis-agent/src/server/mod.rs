// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Transport servers.
//
// Both transports share the same shape: an I/O side turns the wire into
// complete message payloads and pushes them onto the scheduler; a worker
// pool pops them, runs the agent, and routes replies back through a
// transport-specific sender. The workers also maintain the source/key map
// from the session events the agent emits.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::debug;

use crate::agent::{Agent, SessionEvent};
use crate::scheduler::FcfsScheduler;
use crate::source_map::SourceClientMap;

pub mod tcp;
pub mod udp;

pub use tcp::TcpSessionServer;
pub use udp::UdpSessionServer;

/// Unit of work handed from the I/O side to the worker pool.
#[derive(Debug)]
pub enum WorkItem {
    /// One complete inbound message.
    Frame { source: SocketAddr, payload: Vec<u8> },
    /// Periodic maintenance: heartbeats and eviction.
    Tick,
}

/// Transport-specific reply path. Implementations must tolerate a stale
/// destination (the peer may be gone by the time a reply is ready).
pub trait ReplySender: Send + Sync {
    fn send(&self, dest: SocketAddr, payload: Vec<u8>);
    /// Tear down the transport state for `dest` (TCP closes the
    /// connection; datagram transports have nothing to do).
    fn close(&self, dest: SocketAddr);
}

/// Spawn `count` worker threads popping from `scheduler` until `deinit`.
pub(crate) fn spawn_workers(
    count: usize,
    agent: Arc<Agent>,
    scheduler: Arc<FcfsScheduler<WorkItem>>,
    sources: Arc<SourceClientMap>,
    sender: Arc<dyn ReplySender>,
) -> io::Result<Vec<JoinHandle<()>>> {
    (0..count)
        .map(|i| {
            let agent = Arc::clone(&agent);
            let scheduler = Arc::clone(&scheduler);
            let sources = Arc::clone(&sources);
            let sender = Arc::clone(&sender);
            thread::Builder::new()
                .name(format!("trellis-worker-{i}"))
                .spawn(move || worker_loop(&agent, &scheduler, &sources, sender.as_ref()))
        })
        .collect()
}

fn worker_loop(
    agent: &Agent,
    scheduler: &FcfsScheduler<WorkItem>,
    sources: &SourceClientMap,
    sender: &dyn ReplySender,
) {
    while let Some(item) = scheduler.pop() {
        match item {
            WorkItem::Frame { source, payload } => {
                let result = agent.process_message(source, &payload);
                for event in &result.events {
                    match event {
                        SessionEvent::ClientCreated(key) => sources.bind(source, *key),
                        SessionEvent::ClientDeleted(key) => sources.unbind_key(*key),
                    }
                }
                for reply in result.replies {
                    sender.send(source, reply);
                }
            }
            WorkItem::Tick => {
                let tick = agent.tick(Instant::now());
                for (key, message) in tick.outbound {
                    match sources.source_of(key) {
                        Some(dest) => sender.send(dest, message),
                        None => debug!("heartbeat for unbound client {key}, dropped"),
                    }
                }
                for key in tick.evicted {
                    if let Some(dest) = sources.source_of(key) {
                        sender.close(dest);
                    }
                    sources.unbind_key(key);
                }
            }
        }
    }
}
