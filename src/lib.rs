//! SOME/IP middleware core: wire codec, endpoint layer, service
//! discovery, and the in-process routing core.
//!
//! The crate is assembled around one explicit [`config::Config`] handle
//! and one endpoint event channel: endpoints (TCP, UDP, local stream)
//! push frames and lifecycle events into the channel, the routing host
//! consumes it, and the SD engine runs as a peer subsystem on its own
//! UDP socket, mutating routing state as offers and subscriptions come
//! and go.

pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod host;
pub mod routing;
pub mod sd;
pub mod types;

pub use codec::Message;
pub use config::Config;
pub use endpoint::{Endpoint, EndpointEvent, EndpointManager, EndpointOptions, Peer, Protocol};
pub use error::{Error, Result};
pub use routing::{RoutedMessage, Router};
pub use sd::{SdCommand, SdEngine, SdHandle};
pub use types::{
    ClientId, EventId, EventgroupId, InstanceId, MessageType, MethodId, ReturnCode, ServiceId,
    SessionId, Ttl,
};
