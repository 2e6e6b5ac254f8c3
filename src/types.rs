//! Protocol identifiers, wire enumerations, and stack-wide constants.
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage** — every buffer the stack accumulates
//!    (packetizer, send queue, receive buffer) has an explicit limit tied
//!    to a constant or configuration value defined here.
//!
//! 2. **Wire fidelity** — enums that appear on the wire are `#[repr(u8)]`
//!    with the exact SOME/IP values; conversion from raw bytes is total
//!    (unknown values are rejected, never mapped).

use std::fmt;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Service identifier (16-bit on the wire).
pub type ServiceId = u16;

/// Service instance identifier (16-bit on the wire, SD only).
pub type InstanceId = u16;

/// Method identifier. Bit 15 set means the id names an event.
pub type MethodId = u16;

/// Event identifier (a [`MethodId`] with bit 15 set).
pub type EventId = u16;

/// Client identifier assigned per application.
pub type ClientId = u16;

/// Per-client request sequence number.
pub type SessionId = u16;

/// Eventgroup identifier (SD only).
pub type EventgroupId = u16;

/// Major interface version (8-bit on the wire).
pub type MajorVersion = u8;

/// Minor interface version (32-bit, SD service entries only).
pub type MinorVersion = u32;

/// Time-to-live in seconds. 24-bit on the wire, stored as u32.
pub type Ttl = u32;

/// Matches any instance in lookups and SD finds.
pub const ANY_INSTANCE: InstanceId = 0xFFFF;

/// Matches any major version in SD finds.
pub const ANY_MAJOR: MajorVersion = 0xFF;

/// Matches any minor version in SD finds.
pub const ANY_MINOR: MinorVersion = 0xFFFF_FFFF;

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// SOME/IP protocol version carried at header offset 12.
/// The stack rejects any other value during decode.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Default interface version used when a service does not configure one.
pub const DEFAULT_INTERFACE_VERSION: u8 = 0x01;

/// Size of the full SOME/IP header including the length field (bytes 0..16).
pub const SOMEIP_HEADER_SIZE: usize = 16;

/// Portion of the header covered by the length field (client id onward).
/// `length = SOMEIP_LENGTH_COVERED + payload.len()`.
pub const SOMEIP_LENGTH_COVERED: u32 = 8;

// =============================================================================
// MESSAGE TYPES
// =============================================================================

/// SOME/IP message type (header offset 14).
///
/// The ACK variants exist for transports with explicit acknowledgement;
/// they classify exactly like their base type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x00,
    RequestNoReturn = 0x01,
    Notification = 0x02,
    RequestAck = 0x40,
    RequestNoReturnAck = 0x41,
    NotificationAck = 0x42,
    Response = 0x80,
    Error = 0x81,
    ResponseAck = 0xC0,
    ErrorAck = 0xC1,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Request),
            0x01 => Some(Self::RequestNoReturn),
            0x02 => Some(Self::Notification),
            0x40 => Some(Self::RequestAck),
            0x41 => Some(Self::RequestNoReturnAck),
            0x42 => Some(Self::NotificationAck),
            0x80 => Some(Self::Response),
            0x81 => Some(Self::Error),
            0xC0 => Some(Self::ResponseAck),
            0xC1 => Some(Self::ErrorAck),
            _ => None,
        }
    }

    /// True for anything a server must act on (fire-and-forget included).
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::Request | Self::RequestNoReturn | Self::RequestAck | Self::RequestNoReturnAck
        )
    }

    /// True for requests that never produce a response message.
    pub fn is_request_no_return(self) -> bool {
        matches!(self, Self::RequestNoReturn | Self::RequestNoReturnAck)
    }

    pub fn is_notification(self) -> bool {
        matches!(self, Self::Notification | Self::NotificationAck)
    }

    /// True for messages routed back to the requester by (client, session).
    pub fn is_response(self) -> bool {
        matches!(self, Self::Response | Self::Error | Self::ResponseAck | Self::ErrorAck)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Method ids with bit 15 set name events, not methods.
#[inline]
pub fn is_event(method: MethodId) -> bool {
    method & 0x8000 != 0
}

// =============================================================================
// RETURN CODES
// =============================================================================

/// SOME/IP return code (header offset 15).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    Ok = 0x00,
    NotOk = 0x01,
    UnknownService = 0x02,
    UnknownMethod = 0x03,
    NotReady = 0x04,
    NotReachable = 0x05,
    Timeout = 0x06,
    WrongProtocolVersion = 0x07,
    WrongInterfaceVersion = 0x08,
    MalformedMessage = 0x09,
}

impl ReturnCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Ok),
            0x01 => Some(Self::NotOk),
            0x02 => Some(Self::UnknownService),
            0x03 => Some(Self::UnknownMethod),
            0x04 => Some(Self::NotReady),
            0x05 => Some(Self::NotReachable),
            0x06 => Some(Self::Timeout),
            0x07 => Some(Self::WrongProtocolVersion),
            0x08 => Some(Self::WrongInterfaceVersion),
            0x09 => Some(Self::MalformedMessage),
            _ => None,
        }
    }
}

// =============================================================================
// MESSAGE SIZE LIMITS
// =============================================================================
// Each endpoint enforces the ceiling configured for it; these are the
// fallbacks when the configuration does not name one. The decoder rejects
// any frame whose declared size exceeds the bound endpoint's ceiling
// before allocating for it.

/// Default ceiling for messages on local (Unix stream) endpoints.
/// Local clients exchange whole serialized messages; 1 MiB covers large
/// payloads while bounding per-client buffering.
pub const DEFAULT_MAX_MESSAGE_SIZE_LOCAL: u32 = 1024 * 1024;

/// Default ceiling for TCP endpoints without a configured
/// `message-sizes` entry. Matches the local default.
pub const DEFAULT_MAX_MESSAGE_SIZE_RELIABLE: u32 = 1024 * 1024;

/// Ceiling for UDP endpoints. SOME/IP never fragments at its own layer,
/// so a datagram must fit a conventional Ethernet MTU payload.
pub const MAX_MESSAGE_SIZE_UNRELIABLE: u32 = 1400;

/// Send-queue depth bound per endpoint. Overflow fails the newest send
/// with a queue-full error instead of blocking the caller.
pub const DEFAULT_ENDPOINT_QUEUE_LIMIT: usize = 1024;

// =============================================================================
// ENDPOINT TIMING DEFAULTS
// =============================================================================
// Both are required configuration; these are only the values the loader
// falls back to when the keys are absent.

/// Packetizer flush timeout in milliseconds.
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 1000;

/// Initial client reconnect delay in milliseconds. Doubles on every
/// failed attempt until [`DEFAULT_MAX_CONNECT_TIMEOUT_MS`].
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 100;

/// Reconnect backoff cap. 100 ms × 2^6; keeps a flapping peer from
/// being retried more than every few seconds.
pub const DEFAULT_MAX_CONNECT_TIMEOUT_MS: u64 = 6400;

// =============================================================================
// SERVICE DISCOVERY CONSTANTS
// =============================================================================

/// Service id reserved for SD messages.
pub const SD_SERVICE: ServiceId = 0xFFFF;

/// Instance id used in the SD message header context.
pub const SD_INSTANCE: InstanceId = 0x0000;

/// Method id reserved for SD messages.
pub const SD_METHOD: MethodId = 0x8100;

/// Client id carried in SD messages.
pub const SD_CLIENT: ClientId = 0x0000;

/// SD body prefix: flags u8 + reserved u24 + entries_len u32 (partial).
/// Flags byte + reserved + the two array length fields.
pub const SD_DATA_SIZE: usize = 12;

/// Fixed size of every SD entry.
pub const SD_ENTRY_SIZE: usize = 16;

/// Option header: length u16 + type u8.
pub const SD_OPTION_HEADER_SIZE: usize = 3;

/// Reboot flag: bit 7 of the SD flags byte.
pub const SD_FLAG_REBOOT: u8 = 0x80;

/// Unicast-supported flag: bit 6 of the SD flags byte.
pub const SD_FLAG_UNICAST: u8 = 0x40;

/// Largest SD datagram body the engine will coalesce entries into.
/// Below the UDP ceiling so a full cycle always fits one datagram.
pub const SD_MAX_MESSAGE_SIZE: usize = 1400;

// Defaults mirroring the `service-discovery` configuration section.

pub const SD_DEFAULT_ENABLED: bool = true;
pub const SD_DEFAULT_PROTOCOL: &str = "udp";
pub const SD_DEFAULT_MULTICAST: &str = "224.224.224.0";
pub const SD_DEFAULT_PORT: u16 = 30490;

pub const SD_DEFAULT_INITIAL_DELAY_MIN_MS: u64 = 0;
pub const SD_DEFAULT_INITIAL_DELAY_MAX_MS: u64 = 3000;
pub const SD_DEFAULT_REPETITIONS_BASE_DELAY_MS: u64 = 10;
pub const SD_DEFAULT_REPETITIONS_MAX: u8 = 3;
pub const SD_DEFAULT_TTL: Ttl = 5;
pub const SD_DEFAULT_CYCLIC_OFFER_DELAY_MS: u64 = 1000;
pub const SD_DEFAULT_REQUEST_RESPONSE_DELAY_MS: u64 = 2000;

// =============================================================================
// LOCAL IPC
// =============================================================================

/// Command header preceding control messages on local stream sockets:
/// command u8, reserved u8, client u16, size u32.
pub const COMMAND_HEADER_SIZE: usize = 8;

/// Commands exchanged between the routing host and local applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Application announces itself and its client id.
    Register = 0x00,
    /// Application leaves; the host drops its routes.
    Deregister = 0x01,
    /// A serialized SOME/IP message follows.
    Send = 0x02,
    /// Application subscribes to an eventgroup.
    Subscribe = 0x03,
    /// Application cancels an eventgroup subscription.
    Unsubscribe = 0x04,
}

impl Command {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Register),
            0x01 => Some(Self::Deregister),
            0x02 => Some(Self::Send),
            0x03 => Some(Self::Subscribe),
            0x04 => Some(Self::Unsubscribe),
            _ => None,
        }
    }
}
