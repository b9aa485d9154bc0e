// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// UDP transport server.
//
// Datagram boundaries are message boundaries, so there is no framing
// layer: one receive thread blocks on the socket (with a timeout that
// doubles as the tick source) and pushes each datagram onto the
// scheduler. Workers reply with `send_to` on the shared socket.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::agent::Agent;
use crate::error::AgentError;
use crate::scheduler::FcfsScheduler;
use crate::server::{spawn_workers, ReplySender, WorkItem};
use crate::source_map::SourceClientMap;

/// Largest datagram we accept; a 16-bit length protocol cannot exceed it.
const MAX_DATAGRAM: usize = 65535;

struct UdpReplySender {
    socket: Arc<UdpSocket>,
}

impl ReplySender for UdpReplySender {
    fn send(&self, dest: SocketAddr, payload: Vec<u8>) {
        if let Err(e) = self.socket.send_to(&payload, dest) {
            debug!("{dest}: send failed: {e}");
        }
    }

    fn close(&self, _dest: SocketAddr) {
        // No per-peer state on a datagram socket.
    }
}

/// UDP front-end: one receive thread plus the worker pool.
pub struct UdpSessionServer {
    local_addr: SocketAddr,
    scheduler: Arc<FcfsScheduler<WorkItem>>,
    running: Arc<AtomicBool>,
    rx_thread: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl UdpSessionServer {
    /// Bind and start serving immediately.
    pub fn bind(addr: SocketAddr, agent: Arc<Agent>) -> Result<Self, AgentError> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        // The read timeout doubles as the tick period.
        let tick_period = Duration::from_millis(agent.config().heartbeat_period_ms);
        socket.set_read_timeout(Some(tick_period))?;
        let socket: UdpSocket = socket.into();
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let scheduler = Arc::new(FcfsScheduler::new());
        scheduler.init();
        let sources = Arc::new(SourceClientMap::new());
        let running = Arc::new(AtomicBool::new(true));

        let sender = Arc::new(UdpReplySender {
            socket: Arc::clone(&socket),
        });
        let workers = spawn_workers(
            agent.config().workers,
            Arc::clone(&agent),
            Arc::clone(&scheduler),
            sources,
            sender,
        )?;

        let rx_thread = {
            let scheduler = Arc::clone(&scheduler);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("trellis-udp-rx".to_owned())
                .spawn(move || receive_loop(&socket, &scheduler, &running))?
        };

        info!("udp server listening on {local_addr}");
        Ok(Self {
            local_addr,
            scheduler,
            running,
            rx_thread: Some(rx_thread),
            workers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the receive thread and the worker pool, joining both.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        if let Some(handle) = self.rx_thread.take() {
            let _ = handle.join();
        }
        self.scheduler.deinit();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        info!("udp server on {} stopped", self.local_addr);
    }
}

impl Drop for UdpSessionServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop(
    socket: &UdpSocket,
    scheduler: &FcfsScheduler<WorkItem>,
    running: &AtomicBool,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((0, _)) => {}
            Ok((n, source)) => {
                scheduler.push(
                    WorkItem::Frame {
                        source,
                        payload: buf[..n].to_vec(),
                    },
                    0,
                );
            }
            // Timeout expired: run periodic maintenance instead.
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                scheduler.push(WorkItem::Tick, 0);
            }
            Err(e) => {
                warn!("recv error: {e}");
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
    use crate::config::AgentConfig;
    use crate::protocol::{
        parse_message, serialize_message, ClientKey, CreateClientPayload, MessageHeader,
        StatusCode, StreamId, Submessage, WireMessage, COOKIE, VERSION_MAJOR, VERSION_MINOR,
    };

    #[test]
    fn test_handshake_over_udp() {
        let agent =
            Arc::new(Agent::new(AgentConfig::default(), Arc::new(NullBridge::new())).unwrap());
        let mut server = UdpSessionServer::bind("127.0.0.1:0".parse().unwrap(), agent).unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let key = ClientKey([7, 7, 7, 7]);
        let handshake = serialize_message(&WireMessage {
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
        });
        client.send_to(&handshake, server.local_addr()).unwrap();

        let mut buf = [0u8; 1024];
        let (n, _) = client.recv_from(&mut buf).unwrap();
        let reply = parse_message(&buf[..n]).unwrap();
        assert_eq!(reply.header.client_key, key);
        match &reply.submessages[0] {
            Submessage::Status(status) => assert_eq!(status.status, StatusCode::Ok),
            other => panic!("expected STATUS, got {other:?}"),
        }

        server.shutdown();
    }
}
