//! Networked nodes
//!
//! A [`NodeHost`] listens for peer nodes and dials out to them. Each live
//! connection is represented locally by a peer-link agent bound at
//! `http://<remote-node>`, so sending to another node is just sending a
//! [`RemoteEnvelope`] through a channel over that address.
//!
//! # Connection lifecycle
//!
//! 1. The dialing side sends a HELLO frame carrying its node name; the
//!    accepting side answers with its own
//! 2. Both sides spawn a peer link and bind it at the other's node address
//! 3. A reader thread per connection decodes DELIVER frames and routes each
//!    envelope by its destination; envelopes with no route are dropped
//! 4. When the connection closes the link is killed, which releases the
//!    node address

use crate::agent::{Agent, AgentId, AgentType};
use crate::codec::RemoteEnvelope;
use crate::context::Context;
use crate::dispatch::Handlers;
use crate::error::{AgentError, Result};
use crate::frame::Frame;
use crate::routing::node_address;
use crate::runtime::RuntimeEnvironment;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufReader, ErrorKind};
use std::net::{Shutdown as SocketShutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Handshake frame; payload is the sender's node name
pub const MESSAGE_HELLO: u32 = 1;

/// Frame carrying one bincode-encoded [`RemoteEnvelope`]
pub const MESSAGE_DELIVER: u32 = 2;

/// Agent type of peer links
pub const PEER_LINK_TYPE: &str = "peer-link";

const ACCEPT_POLL: Duration = Duration::from_millis(20);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Listener lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Created,
    Listening,
    /// Stopped; cannot be started again
    Disposed,
}

/// Writes envelopes for one remote node onto its connection
struct PeerLink {
    node: String,
    writer: TcpStream,
}

impl Agent for PeerLink {
    fn handlers(handlers: &mut Handlers<Self>) -> Result<()> {
        handlers.receive(|link: &mut PeerLink, envelope: RemoteEnvelope, ctx: &mut Context<'_>| {
            let frame = Frame::new(MESSAGE_DELIVER, envelope.to_bytes()?);
            if let Err(e) = frame.write_to(&mut link.writer) {
                warn!("Lost connection to {}: {}", link.node, e);
                ctx.stop();
            }
            Ok(())
        })?;
        Ok(())
    }

    fn stopped(&mut self, _ctx: &mut Context<'_>) {
        let _ = self.writer.shutdown(SocketShutdown::Both);
    }
}

struct Connection {
    serial: u64,
    stream: TcpStream,
    link: AgentId,
    reader: Option<JoinHandle<()>>,
}

/// State shared with the accept and reader threads
struct Shared {
    env: RuntimeEnvironment,
    stopping: AtomicBool,
    serial: AtomicU64,
    connections: Mutex<HashMap<String, Connection>>,
}

struct Listener {
    state: HostState,
    local_addr: Option<SocketAddr>,
    accept: Option<JoinHandle<()>>,
}

/// TCP endpoint connecting this environment to peer nodes
pub struct NodeHost {
    bind_addr: SocketAddr,
    shared: Arc<Shared>,
    listener: Mutex<Listener>,
}

impl NodeHost {
    pub fn new(env: RuntimeEnvironment, bind_addr: SocketAddr) -> Self {
        NodeHost {
            bind_addr,
            shared: Arc::new(Shared {
                env,
                stopping: AtomicBool::new(false),
                serial: AtomicU64::new(0),
                connections: Mutex::new(HashMap::new()),
            }),
            listener: Mutex::new(Listener {
                state: HostState::Created,
                local_addr: None,
                accept: None,
            }),
        }
    }

    pub fn state(&self) -> HostState {
        self.listener.lock().state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().local_addr
    }

    /// Bind and start accepting peers. Returns the bound address; calling
    /// it again while listening returns the same address.
    pub fn start(&self) -> Result<SocketAddr> {
        let mut listener = self.listener.lock();
        match (listener.state, listener.local_addr) {
            (HostState::Disposed, _) => return Err(AgentError::Disposed),
            (HostState::Listening, Some(addr)) => return Ok(addr),
            _ => {}
        }

        let socket = TcpListener::bind(self.bind_addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("{}-accept", self.shared.env.config().node_name))
            .spawn(move || accept_loop(socket, shared))?;

        listener.state = HostState::Listening;
        listener.local_addr = Some(local_addr);
        listener.accept = Some(handle);
        info!(
            "Node {} listening on {}",
            self.shared.env.config().node_name,
            local_addr
        );
        Ok(local_addr)
    }

    /// Dial a peer and complete the handshake. Returns the peer's node name.
    pub fn connect(&self, addr: SocketAddr) -> Result<String> {
        if self.state() == HostState::Disposed {
            return Err(AgentError::Disposed);
        }
        let mut stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        hello(&self.shared.env).write_to(&mut stream)?;
        let remote = read_hello(&mut stream)?;
        stream.set_read_timeout(None)?;

        establish(&self.shared, stream, &remote)?;
        Ok(remote)
    }

    /// Node names of the currently connected peers
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.shared.connections.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Stop accepting, close every peer connection and wait for the
    /// background threads. The host cannot be started again.
    pub fn stop(&self) {
        let accept = {
            let mut listener = self.listener.lock();
            if listener.state == HostState::Disposed {
                return;
            }
            listener.state = HostState::Disposed;
            listener.accept.take()
        };
        self.shared.stopping.store(true, Ordering::Release);
        if let Some(handle) = accept {
            if handle.join().is_err() {
                error!("Accept thread panicked");
            }
        }

        let connections: Vec<Connection> = self.shared.connections.lock().drain().map(|(_, c)| c).collect();
        for mut connection in connections {
            let _ = connection.stream.shutdown(SocketShutdown::Both);
            let _ = self.shared.env.kill(&connection.link);
            if let Some(reader) = connection.reader.take() {
                if reader.join().is_err() {
                    error!("Reader thread panicked");
                }
            }
        }
        info!("Node {} host stopped", self.shared.env.config().node_name);
    }
}

impl Drop for NodeHost {
    fn drop(&mut self) {
        self.stop();
    }
}

fn hello(env: &RuntimeEnvironment) -> Frame {
    Frame::new(MESSAGE_HELLO, env.config().node_name.as_bytes().to_vec())
}

fn read_hello(stream: &mut TcpStream) -> Result<String> {
    let frame = Frame::read_from(stream)?
        .ok_or_else(|| AgentError::Io("Peer closed during handshake".to_string()))?;
    if frame.message_id != MESSAGE_HELLO {
        return Err(AgentError::Codec(format!(
            "Expected HELLO, got message {}",
            frame.message_id
        )));
    }
    let name = String::from_utf8(frame.payload).map_err(|e| AgentError::Codec(e.to_string()))?;
    if name.is_empty() {
        return Err(AgentError::Codec("Empty node name in HELLO".to_string()));
    }
    Ok(name)
}

fn accept_loop(socket: TcpListener, shared: Arc<Shared>) {
    while !shared.stopping.load(Ordering::Acquire) {
        match socket.accept() {
            Ok((stream, peer)) => {
                debug!("Accepted connection from {}", peer);
                if let Err(e) = accept_peer(&shared, stream) {
                    warn!("Handshake with {} failed: {}", peer, e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                error!("Accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!("Accept loop exiting");
}

fn accept_peer(shared: &Arc<Shared>, mut stream: TcpStream) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    let remote = read_hello(&mut stream)?;
    hello(&shared.env).write_to(&mut stream)?;
    stream.set_read_timeout(None)?;
    establish(shared, stream, &remote)
}

/// Spawn the peer link, bind the node address and start the reader.
fn establish(shared: &Arc<Shared>, stream: TcpStream, remote: &str) -> Result<()> {
    let env = &shared.env;
    let link = PeerLink {
        node: remote.to_string(),
        writer: stream.try_clone()?,
    };
    let link_id = env.spawn_agent(AgentType::new(PEER_LINK_TYPE), link, None)?;
    if let Err(e) = env.bind(&node_address(remote), &link_id) {
        let _ = env.kill(&link_id);
        let _ = stream.shutdown(SocketShutdown::Both);
        return Err(e);
    }

    let serial = shared.serial.fetch_add(1, Ordering::Relaxed);
    let reader_stream = stream.try_clone()?;
    let reader_shared = Arc::clone(shared);
    let reader_remote = remote.to_string();
    let reader_link = link_id.clone();

    // Register before the reader can finish so its cleanup finds the entry.
    let mut connections = shared.connections.lock();
    let reader = thread::Builder::new()
        .name(format!("{}-peer-{}", env.config().node_name, remote))
        .spawn(move || {
            read_loop(&reader_shared, reader_stream, &reader_remote);
            let _ = reader_shared.env.kill(&reader_link);
            let mut connections = reader_shared.connections.lock();
            if connections.get(&reader_remote).is_some_and(|c| c.serial == serial) {
                connections.remove(&reader_remote);
            }
            info!("Peer {} disconnected", reader_remote);
        });
    let reader = match reader {
        Ok(reader) => reader,
        Err(e) => {
            drop(connections);
            let _ = env.kill(&link_id);
            return Err(e.into());
        }
    };
    connections.insert(
        remote.to_string(),
        Connection {
            serial,
            stream,
            link: link_id,
            reader: Some(reader),
        },
    );
    info!("Peer {} connected", remote);
    Ok(())
}

fn read_loop(shared: &Shared, stream: TcpStream, remote: &str) {
    let mut reader = BufReader::new(stream);
    loop {
        let frame = match Frame::read_from(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                if !shared.stopping.load(Ordering::Acquire) {
                    warn!("Reading from {} failed: {}", remote, e);
                }
                return;
            }
        };
        if frame.message_id != MESSAGE_DELIVER {
            debug!("Ignoring message {} from {}", frame.message_id, remote);
            continue;
        }
        match RemoteEnvelope::from_bytes(&frame.payload) {
            Ok(envelope) => route(&shared.env, envelope),
            Err(e) => warn!("Bad envelope from {}: {}", remote, e),
        }
    }
}

/// Deliver an inbound envelope locally; misses are dropped.
fn route(env: &RuntimeEnvironment, envelope: RemoteEnvelope) {
    let Some(target) = env.routes().try_find(&envelope.destination) else {
        warn!("No route for {}, dropped", envelope.to_debug_string());
        return;
    };
    debug!("Delivering {} to {}", envelope.to_debug_string(), target.id());
    if let Err(e) = target.send(envelope) {
        warn!("Delivery failed: {}", e);
    }
}
