//! Stack-wide error type.
//!
//! Local recovery is preferred: connection faults are handled inside the
//! endpoint layer (reconnect with backoff) and only surface to callers
//! when a newly requested destination cannot be reached. Configuration
//! and bind failures are fatal at initialization.

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or contradictory configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A local socket could not be acquired. Fatal for that endpoint.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Transient connect failure; the endpoint retries with backoff.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The peer went away mid-write; close and reconnect.
    #[error("broken pipe on {0}")]
    BrokenPipe(SocketAddr),

    /// A message exceeds the ceiling of the endpoint it was bound for.
    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    /// The endpoint send queue is at its configured depth.
    #[error("send queue full (depth {0})")]
    QueueFull(usize),

    /// A frame that cannot be decoded. Dropped; TCP attempts cookie resync.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// No route for the addressed (service, instance, method).
    #[error("no route for service {service:#06x} instance {instance:#06x}")]
    UnknownRoute { service: u16, instance: u16 },

    /// The endpoint is not connected and the send was not queued.
    #[error("endpoint not connected")]
    NotConnected,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
