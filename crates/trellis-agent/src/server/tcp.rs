// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// TCP transport server.
//
// One dedicated I/O thread runs a mio poll loop: it accepts connections,
// feeds inbound bytes through a per-connection `FrameDecoder`, and pushes
// completed frames onto the shared scheduler. Workers send replies through
// a command channel; a `Waker` pulls the poll loop out of its wait to
// drain them. Writes keep a per-connection queue with a partial-write
// offset so slow peers only stall themselves.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use log::{debug, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::agent::Agent;
use crate::error::AgentError;
use crate::framing::FrameDecoder;
use crate::scheduler::FcfsScheduler;
use crate::server::{spawn_workers, ReplySender, WorkItem};
use crate::source_map::SourceClientMap;

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const CONNECTION_TOKEN_START: usize = 2;

const MAX_EVENTS: usize = 128;

/// Commands from the worker side to the I/O thread.
#[derive(Debug)]
enum IoCommand {
    Send { dest: SocketAddr, payload: Vec<u8> },
    Close { dest: SocketAddr },
}

/// Worker-side reply path: queue a command, wake the poll.
struct TcpReplySender {
    cmd_tx: Sender<IoCommand>,
    waker: Arc<Waker>,
}

impl ReplySender for TcpReplySender {
    fn send(&self, dest: SocketAddr, payload: Vec<u8>) {
        if self.cmd_tx.send(IoCommand::Send { dest, payload }).is_ok() {
            let _ = self.waker.wake();
        }
    }

    fn close(&self, dest: SocketAddr) {
        if self.cmd_tx.send(IoCommand::Close { dest }).is_ok() {
            let _ = self.waker.wake();
        }
    }
}

/// Per-connection I/O state.
struct Connection {
    stream: TcpStream,
    remote_addr: SocketAddr,
    decoder: FrameDecoder,
    send_queue: Vec<u8>,
    send_offset: usize,
}

/// The poll loop state, owned by the I/O thread.
struct IoLoop {
    poll: Poll,
    listener: TcpListener,
    connections: HashMap<Token, Connection>,
    addr_to_token: HashMap<SocketAddr, Token>,
    next_token: usize,
    cmd_rx: Receiver<IoCommand>,
    scheduler: Arc<FcfsScheduler<WorkItem>>,
    sources: Arc<SourceClientMap>,
    running: Arc<AtomicBool>,
    max_frame: usize,
    tick_period: Duration,
}

impl IoLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);
        let mut last_tick = Instant::now();

        while self.running.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(self.tick_period)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("poll error: {e}");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.handle_accept(),
                    WAKER_TOKEN => self.handle_commands(),
                    token => {
                        if event.is_readable() {
                            self.handle_readable(token);
                        }
                        if event.is_writable() {
                            self.try_flush(token);
                        }
                    }
                }
            }

            let now = Instant::now();
            if now.duration_since(last_tick) >= self.tick_period {
                last_tick = now;
                self.scheduler.push(WorkItem::Tick, 0);
            }
        }

        for (_, mut conn) in self.connections.drain() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
    }

    fn handle_accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, remote_addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!("{remote_addr}: register failed: {e}");
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    debug!("{remote_addr}: connection accepted");
                    self.connections.insert(
                        token,
                        Connection {
                            stream,
                            remote_addr,
                            decoder: FrameDecoder::new(self.max_frame),
                            send_queue: Vec::new(),
                            send_offset: 0,
                        },
                    );
                    self.addr_to_token.insert(remote_addr, token);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept error: {e}");
                    break;
                }
            }
        }
    }

    fn handle_commands(&mut self) {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(IoCommand::Send { dest, payload }) => {
                    let Some(&token) = self.addr_to_token.get(&dest) else {
                        debug!("{dest}: reply for closed connection, dropped");
                        continue;
                    };
                    let frame = match FrameDecoder::encode(&payload) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("{dest}: unframeable reply: {e}");
                            continue;
                        }
                    };
                    if let Some(conn) = self.connections.get_mut(&token) {
                        conn.send_queue.extend_from_slice(&frame);
                    }
                    self.try_flush(token);
                }
                Ok(IoCommand::Close { dest }) => {
                    if let Some(&token) = self.addr_to_token.get(&dest) {
                        self.close_connection(token, "closed by agent");
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.running.store(false, Ordering::Relaxed);
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, token: Token) {
        let reason = loop {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            match conn.decoder.decode(&mut conn.stream) {
                Ok(Some(payload)) => {
                    self.scheduler.push(
                        WorkItem::Frame {
                            source: conn.remote_addr,
                            payload,
                        },
                        0,
                    );
                }
                Ok(None) => return,
                Err(AgentError::ConnectionClosed) => break "closed by peer",
                Err(e) => {
                    warn!("{}: read error: {e}", conn.remote_addr);
                    break "read error";
                }
            }
        };
        self.close_connection(token, reason);
    }

    fn try_flush(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if conn.send_queue.is_empty() {
            return;
        }
        while conn.send_offset < conn.send_queue.len() {
            match conn.stream.write(&conn.send_queue[conn.send_offset..]) {
                Ok(0) => {
                    self.close_connection(token, "write returned 0");
                    return;
                }
                Ok(n) => conn.send_offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("{}: write error: {e}", conn.remote_addr);
                    self.close_connection(token, "write error");
                    return;
                }
            }
        }
        conn.send_queue.clear();
        conn.send_offset = 0;
    }

    /// Close one connection; the rest of the server is unaffected.
    fn close_connection(&mut self, token: Token, reason: &str) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.addr_to_token.remove(&conn.remote_addr);
            self.sources.unbind_source(conn.remote_addr);
            debug!("{}: connection closed ({reason})", conn.remote_addr);
        }
    }
}

// ---------------------------------------------------------------------------
// Server handle
// ---------------------------------------------------------------------------

/// TCP front-end: owns the I/O thread and the worker pool.
pub struct TcpSessionServer {
    local_addr: SocketAddr,
    scheduler: Arc<FcfsScheduler<WorkItem>>,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
    io_thread: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl TcpSessionServer {
    /// Bind and start serving immediately.
    pub fn bind(addr: SocketAddr, agent: Arc<Agent>) -> Result<Self, AgentError> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let (cmd_tx, cmd_rx) = channel::unbounded();
        let scheduler = Arc::new(FcfsScheduler::new());
        scheduler.init();
        let sources = Arc::new(SourceClientMap::new());
        let running = Arc::new(AtomicBool::new(true));

        let sender = Arc::new(TcpReplySender {
            cmd_tx,
            waker: Arc::clone(&waker),
        });
        let workers = spawn_workers(
            agent.config().workers,
            Arc::clone(&agent),
            Arc::clone(&scheduler),
            Arc::clone(&sources),
            sender,
        )?;

        let io_loop = IoLoop {
            poll,
            listener,
            connections: HashMap::new(),
            addr_to_token: HashMap::new(),
            next_token: CONNECTION_TOKEN_START,
            cmd_rx,
            scheduler: Arc::clone(&scheduler),
            sources,
            running: Arc::clone(&running),
            max_frame: agent.config().max_message_size,
            tick_period: Duration::from_millis(agent.config().heartbeat_period_ms),
        };
        let io_thread = thread::Builder::new()
            .name("trellis-tcp-io".to_owned())
            .spawn(move || io_loop.run())?;

        info!("tcp server listening on {local_addr}");
        Ok(Self {
            local_addr,
            scheduler,
            running,
            waker,
            io_thread: Some(io_thread),
            workers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the I/O thread and the worker pool, joining both.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        let _ = self.waker.wake();
        if let Some(handle) = self.io_thread.take() {
            let _ = handle.join();
        }
        self.scheduler.deinit();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        info!("tcp server on {} stopped", self.local_addr);
    }
}

impl Drop for TcpSessionServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
