//! SOME/IP wire codec.
//!
//! Pure byte-level encode/decode for the SOME/IP message header, the
//! magic-cookie resynchronization frames, and the local command header.
//! No I/O and no state; everything here operates on caller buffers in
//! network byte order.
//!
//! ```text
//! offset 0  : service_id  u16
//! offset 2  : method_id   u16   (bit 15 set = event)
//! offset 4  : length      u32   (covers offset 8..end)
//! offset 8  : client_id   u16
//! offset 10 : session_id  u16
//! offset 12 : proto_ver   u8
//! offset 13 : iface_ver   u8
//! offset 14 : msg_type    u8
//! offset 15 : return_code u8
//! offset 16 : payload
//! ```

use crate::error::{Error, Result};
use crate::types::{
    ClientId, Command, MessageType, MethodId, ReturnCode, ServiceId, SessionId,
    COMMAND_HEADER_SIZE, PROTOCOL_VERSION, SOMEIP_HEADER_SIZE, SOMEIP_LENGTH_COVERED,
};

// =============================================================================
// MAGIC COOKIES
// =============================================================================

/// Client-to-server magic cookie: service 0xFFFF, method 0x8000,
/// length 8, client 0xDEAD, session 0xBEEF, REQUEST_NO_RETURN.
pub const CLIENT_COOKIE: [u8; 16] = [
    0xFF, 0xFF, 0x80, 0x00, 0x00, 0x00, 0x00, 0x08, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x01, 0x01,
    0x00,
];

/// Server-to-client magic cookie: method 0x8001, NOTIFICATION.
pub const SERVER_COOKIE: [u8; 16] = [
    0xFF, 0xFF, 0x80, 0x01, 0x00, 0x00, 0x00, 0x08, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x01, 0x02,
    0x00,
];

/// True if `buf` starts with either magic cookie.
pub fn is_magic_cookie(buf: &[u8]) -> bool {
    buf.len() >= SOMEIP_HEADER_SIZE
        && (buf[..SOMEIP_HEADER_SIZE] == CLIENT_COOKIE || buf[..SOMEIP_HEADER_SIZE] == SERVER_COOKIE)
}

/// Scan `buf` for a magic cookie. Returns the offset of the first match.
pub fn find_magic_cookie(buf: &[u8]) -> Option<usize> {
    if buf.len() < SOMEIP_HEADER_SIZE {
        return None;
    }
    (0..=buf.len() - SOMEIP_HEADER_SIZE).find(|&i| is_magic_cookie(&buf[i..]))
}

// =============================================================================
// MESSAGE
// =============================================================================

/// A decoded SOME/IP message.
///
/// Invariant: the encoded length field is always derived as
/// `8 + payload.len()`; it is never stored separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub service: ServiceId,
    pub method: MethodId,
    pub client: ClientId,
    pub session: SessionId,
    pub protocol_version: u8,
    pub interface_version: u8,
    pub message_type: MessageType,
    pub return_code: ReturnCode,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(
        service: ServiceId,
        method: MethodId,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            service,
            method,
            client: 0,
            session: 0,
            protocol_version: PROTOCOL_VERSION,
            interface_version: crate::types::DEFAULT_INTERFACE_VERSION,
            message_type,
            return_code: ReturnCode::Ok,
            payload,
        }
    }

    /// Total size on the wire.
    pub fn wire_size(&self) -> usize {
        SOMEIP_HEADER_SIZE + self.payload.len()
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_size());
        self.encode_into(&mut buf);
        buf
    }

    /// Append the encoded message to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let length = SOMEIP_LENGTH_COVERED + self.payload.len() as u32;
        buf.extend_from_slice(&self.service.to_be_bytes());
        buf.extend_from_slice(&self.method.to_be_bytes());
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(&self.client.to_be_bytes());
        buf.extend_from_slice(&self.session.to_be_bytes());
        buf.push(self.protocol_version);
        buf.push(self.interface_version);
        buf.push(self.message_type as u8);
        buf.push(self.return_code as u8);
        buf.extend_from_slice(&self.payload);
    }

    /// Decode one message from the start of `buf`.
    ///
    /// `max_message_size` is the ceiling configured for the endpoint the
    /// bytes arrived on; a declared size above it is rejected before any
    /// allocation happens.
    pub fn decode(buf: &[u8], max_message_size: usize) -> Result<Self> {
        let total = message_size(buf).ok_or(Error::Malformed("short header"))?;
        if total > max_message_size {
            return Err(Error::MessageTooLarge { size: total, limit: max_message_size });
        }
        if buf.len() < total {
            return Err(Error::Malformed("truncated message"));
        }
        if total < SOMEIP_HEADER_SIZE {
            return Err(Error::Malformed("length below header size"));
        }

        let protocol_version = buf[12];
        if protocol_version != PROTOCOL_VERSION {
            return Err(Error::Malformed("unsupported protocol version"));
        }
        let message_type =
            MessageType::from_u8(buf[14]).ok_or(Error::Malformed("unknown message type"))?;
        let return_code =
            ReturnCode::from_u8(buf[15]).ok_or(Error::Malformed("unknown return code"))?;

        Ok(Self {
            service: u16::from_be_bytes([buf[0], buf[1]]),
            method: u16::from_be_bytes([buf[2], buf[3]]),
            client: u16::from_be_bytes([buf[8], buf[9]]),
            session: u16::from_be_bytes([buf[10], buf[11]]),
            protocol_version,
            interface_version: buf[13],
            message_type,
            return_code,
            payload: buf[SOMEIP_HEADER_SIZE..total].to_vec(),
        })
    }
}

/// Total wire size of the message starting at `buf[0]`, if at least the
/// length field is available: `8 + length`.
pub fn message_size(buf: &[u8]) -> Option<usize> {
    if buf.len() < 8 {
        return None;
    }
    let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Some(8 + length as usize)
}

// =============================================================================
// LOCAL COMMAND HEADER
// =============================================================================

/// Command header on local stream sockets: command u8, reserved u8,
/// client u16, size u32. `size` counts the bytes that follow the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub command: Command,
    pub client: ClientId,
    pub size: u32,
}

impl CommandHeader {
    pub fn new(command: Command, client: ClientId, size: u32) -> Self {
        Self { command, client, size }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.command as u8);
        buf.push(0);
        buf.extend_from_slice(&self.client.to_be_bytes());
        buf.extend_from_slice(&self.size.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < COMMAND_HEADER_SIZE {
            return Err(Error::Malformed("short command header"));
        }
        let command = Command::from_u8(buf[0]).ok_or(Error::Malformed("unknown command"))?;
        Ok(Self {
            command,
            client: u16::from_be_bytes([buf[2], buf[3]]),
            size: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

/// Body of a [`Command::Send`] frame: instance, flush flag, and the
/// serialized SOME/IP message, carried opaque between host and client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendCommand {
    pub instance: u16,
    pub flush: bool,
    pub frame: Vec<u8>,
}

impl SendCommand {
    /// Encode the complete command frame (header included).
    pub fn encode(&self, client: ClientId) -> Vec<u8> {
        let size = 4 + self.frame.len() as u32;
        let mut buf = Vec::with_capacity(COMMAND_HEADER_SIZE + size as usize);
        CommandHeader::new(Command::Send, client, size).encode_into(&mut buf);
        buf.extend_from_slice(&self.instance.to_be_bytes());
        buf.push(u8::from(self.flush));
        buf.push(0);
        buf.extend_from_slice(&self.frame);
        buf
    }

    /// Decode from a command body (header already stripped).
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(Error::Malformed("short send command"));
        }
        Ok(Self {
            instance: u16::from_be_bytes([body[0], body[1]]),
            flush: body[2] != 0,
            frame: body[4..].to_vec(),
        })
    }
}

/// Body of [`Command::Subscribe`] / [`Command::Unsubscribe`] frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeCommand {
    pub service: ServiceId,
    pub instance: u16,
    pub eventgroup: u16,
}

impl SubscribeCommand {
    pub fn encode(&self, command: Command, client: ClientId) -> Vec<u8> {
        let mut buf = Vec::with_capacity(COMMAND_HEADER_SIZE + 6);
        CommandHeader::new(command, client, 6).encode_into(&mut buf);
        buf.extend_from_slice(&self.service.to_be_bytes());
        buf.extend_from_slice(&self.instance.to_be_bytes());
        buf.extend_from_slice(&self.eventgroup.to_be_bytes());
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 6 {
            return Err(Error::Malformed("short subscribe command"));
        }
        Ok(Self {
            service: u16::from_be_bytes([body[0], body[1]]),
            instance: u16::from_be_bytes([body[2], body[3]]),
            eventgroup: u16::from_be_bytes([body[4], body[5]]),
        })
    }
}
