//! Endpoint layer: protocol-parameterized client and server endpoints
//! that frame, batch, and reliably deliver SOME/IP traffic over TCP,
//! UDP, and local stream sockets.
//!
//! Every endpoint owns its socket tasks; callers interact through the
//! short-lock send path and receive traffic as [`EndpointEvent`]s on a
//! channel instead of reentrant upcalls. The endpoint manager is the
//! sole strong owner of endpoints; services keep weak handles.

pub mod client;
pub mod framing;
pub mod manager;
pub mod packetizer;
pub mod server;
pub mod udp;

use crate::error::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

pub use client::TcpClientEndpoint;
#[cfg(unix)]
pub use client::LocalClientEndpoint;
pub use manager::EndpointManager;
pub use server::TcpServerEndpoint;
#[cfg(unix)]
pub use server::LocalServerEndpoint;
pub use udp::UdpEndpoint;

// =============================================================================
// IDENTITY
// =============================================================================

/// Opaque endpoint identity carried in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(u64);

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

impl EndpointId {
    pub fn next() -> Self {
        Self(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ep{}", self.0)
    }
}

/// Transport protocol of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Local,
}

/// The peer a received frame came from or a server send targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Peer {
    /// Remote socket address (TCP or UDP).
    Ip(SocketAddr),
    /// Local stream connection, identified per accepted connection.
    Local(u64),
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Peer::Ip(addr) => write!(f, "{addr}"),
            Peer::Local(id) => write!(f, "local#{id}"),
        }
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// Upward traffic and lifecycle notifications.
///
/// Consumed from a channel by the routing host; endpoints never call
/// back into their owner directly.
#[derive(Debug)]
pub enum EndpointEvent {
    /// A client endpoint transitioned to connected.
    Connected { endpoint: EndpointId },
    /// A client endpoint lost its connection (reconnect is already
    /// scheduled) or a server-side connection went away.
    Disconnected { endpoint: EndpointId, peer: Option<Peer> },
    /// One complete SOME/IP frame.
    Frame { endpoint: EndpointId, peer: Peer, bytes: Vec<u8> },
}

pub type EventSender = mpsc::Sender<EndpointEvent>;

/// Depth of the endpoint event channel. Bounds memory between socket
/// tasks and the routing host; socket reads pause when the host lags.
pub const EVENT_CHANNEL_DEPTH: usize = 256;

/// Read chunk size for stream sockets.
pub(crate) const READ_CHUNK: usize = 8192;

// =============================================================================
// OPTIONS
// =============================================================================

/// Per-endpoint construction parameters resolved from configuration.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub max_message_size: usize,
    pub queue_limit: usize,
    pub flush_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_connect_timeout: Duration,
    /// Magic-cookie resynchronization (stream endpoints only).
    pub magic_cookies: bool,
    /// Command-header framing (local stream sockets only).
    pub command_framing: bool,
}

impl EndpointOptions {
    pub fn from_config(config: &crate::config::Config, max_message_size: u32) -> Self {
        Self {
            max_message_size: max_message_size as usize,
            queue_limit: config.endpoint_queue_limit(),
            flush_timeout: Duration::from_millis(config.flush_timeout_ms()),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms()),
            max_connect_timeout: Duration::from_millis(config.max_connect_timeout_ms()),
            magic_cookies: false,
            command_framing: false,
        }
    }

    pub fn with_magic_cookies(mut self, enabled: bool) -> Self {
        self.magic_cookies = enabled;
        self
    }

    pub fn with_command_framing(mut self) -> Self {
        self.command_framing = true;
        self
    }
}

// =============================================================================
// CAPABILITY SET
// =============================================================================

/// What every endpoint can do, regardless of protocol.
///
/// `send` is the client-role path (one fixed remote); `send_to` is the
/// server-role path (explicit peer). Each variant implements the one
/// that applies and rejects the other.
pub trait Endpoint: Send + Sync {
    fn id(&self) -> EndpointId;

    /// Bound local address, when the endpoint has one.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Queue framed bytes toward the fixed remote.
    fn send(&self, bytes: &[u8], flush: bool) -> Result<()>;

    /// Queue framed bytes toward a specific peer.
    fn send_to(&self, peer: Peer, bytes: &[u8], flush: bool) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Cancel timers, close the socket, clear the send queue.
    fn stop(&self);
}
