//! Stream framing: reassembly of SOME/IP frames from a byte stream and
//! magic-cookie resynchronization after frame loss.
//!
//! The reassembler owns the growing receive buffer of one stream
//! connection. Frames are extracted once complete; when the header at a
//! suspected message boundary is implausible (declared size below the
//! header size or above the endpoint ceiling) the stream is out of sync:
//! with magic cookies enabled for the peer port we scan for the 16-byte
//! cookie pattern, drop everything before it, skip the cookie, and
//! resume; otherwise the connection must be dropped.

use crate::codec::{find_magic_cookie, is_magic_cookie, message_size};
use crate::error::{Error, Result};
use crate::types::SOMEIP_HEADER_SIZE;

/// Largest prefix of a magic cookie that can sit incomplete at the end
/// of the buffer. Everything before it is garbage once a scan failed.
const COOKIE_TAIL: usize = SOMEIP_HEADER_SIZE - 1;

#[derive(Debug)]
pub struct StreamReassembler {
    buf: Vec<u8>,
    max_message_size: usize,
    magic_cookies: bool,
    /// Bytes discarded during resynchronization, for diagnostics.
    dropped: u64,
}

impl StreamReassembler {
    pub fn new(max_message_size: usize, magic_cookies: bool) -> Self {
        Self { buf: Vec::new(), max_message_size, magic_cookies, dropped: 0 }
    }

    /// Feed freshly received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete frame.
    ///
    /// `Ok(None)` means more bytes are needed. `Err(Malformed)` means the
    /// stream cannot be realigned and the connection must be dropped.
    /// Magic cookies are consumed silently and never returned.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if self.buf.len() < 8 {
                return Ok(None);
            }

            let total = message_size(&self.buf).expect("checked length above");
            if total < SOMEIP_HEADER_SIZE || total > self.max_message_size {
                if !self.resync()? {
                    return Ok(None);
                }
                continue;
            }

            if self.buf.len() < total {
                return Ok(None);
            }

            if is_magic_cookie(&self.buf) {
                self.buf.drain(..SOMEIP_HEADER_SIZE);
                continue;
            }

            let frame: Vec<u8> = self.buf.drain(..total).collect();
            return Ok(Some(frame));
        }
    }

    /// Realign on the next magic cookie.
    ///
    /// Returns `Ok(true)` when realigned (the cookie was consumed),
    /// `Ok(false)` when the tail may still grow into a cookie.
    fn resync(&mut self) -> Result<bool> {
        if !self.magic_cookies {
            return Err(Error::Malformed("stream out of sync, cookies disabled"));
        }
        match find_magic_cookie(&self.buf) {
            Some(at) => {
                self.dropped += (at + SOMEIP_HEADER_SIZE) as u64;
                self.buf.drain(..at + SOMEIP_HEADER_SIZE);
                Ok(true)
            }
            None => {
                // No cookie yet. Keep only a tail that could still be the
                // start of one so garbage cannot grow the buffer forever.
                if self.buf.len() > COOKIE_TAIL {
                    let cut = self.buf.len() - COOKIE_TAIL;
                    self.dropped += cut as u64;
                    self.buf.drain(..cut);
                }
                Ok(false)
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Reassembler for local stream sockets: every frame is an 8-byte
/// command header followed by `size` body bytes. Delivered frames keep
/// the header so the host can dispatch on the command.
#[derive(Debug)]
pub struct CommandReassembler {
    buf: Vec<u8>,
    max_message_size: usize,
}

impl CommandReassembler {
    pub fn new(max_message_size: usize) -> Self {
        Self { buf: Vec::new(), max_message_size }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < crate::types::COMMAND_HEADER_SIZE {
            return Ok(None);
        }
        let header = crate::codec::CommandHeader::decode(&self.buf)?;
        let total = crate::types::COMMAND_HEADER_SIZE + header.size as usize;
        if header.size as usize > self.max_message_size {
            // Local peers are trusted processes; a bad size means the
            // stream is broken beyond recovery.
            return Err(Error::MessageTooLarge {
                size: header.size as usize,
                limit: self.max_message_size,
            });
        }
        if self.buf.len() < total {
            return Ok(None);
        }
        Ok(Some(self.buf.drain(..total).collect()))
    }
}

/// Stream framing mode: SOME/IP length-delimited frames on TCP,
/// command-header frames on local sockets.
#[derive(Debug)]
pub enum Reassembler {
    SomeIp(StreamReassembler),
    Command(CommandReassembler),
}

impl Reassembler {
    pub fn extend(&mut self, data: &[u8]) {
        match self {
            Reassembler::SomeIp(r) => r.extend(data),
            Reassembler::Command(r) => r.extend(data),
        }
    }

    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            Reassembler::SomeIp(r) => r.next_frame(),
            Reassembler::Command(r) => r.next_frame(),
        }
    }
}

/// Split one datagram into its back-to-back SOME/IP frames.
///
/// UDP framing is strictly message-aligned; any leftover or oversized
/// declared length makes the whole datagram malformed.
pub fn split_datagram(data: &[u8], max_message_size: usize) -> Result<Vec<Vec<u8>>> {
    let mut frames = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let total = message_size(rest).ok_or(Error::Malformed("short datagram header"))?;
        if total < SOMEIP_HEADER_SIZE {
            return Err(Error::Malformed("datagram length below header size"));
        }
        if total > max_message_size {
            return Err(Error::MessageTooLarge { size: total, limit: max_message_size });
        }
        if rest.len() < total {
            return Err(Error::Malformed("truncated datagram frame"));
        }
        frames.push(rest[..total].to_vec());
        rest = &rest[total..];
    }
    Ok(frames)
}
