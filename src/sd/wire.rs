//! SD message body codec.
//!
//! An SD message is an ordinary SOME/IP message (service 0xFFFF, method
//! 0x8100) whose payload carries a flags byte, an entries array, and an
//! options array. Entries precede options; each entry references up to
//! two contiguous runs of options by index. The encoder deduplicates
//! identical option runs so a cycle's worth of offers sharing one
//! endpoint option stays small.
//!
//! ```text
//! flags      u8    (bit 7 reboot, bit 6 unicast-supported)
//! reserved   u24
//! entries_len u32
//! entries    16 bytes each
//! options_len u32
//! options    length u16, type u8, payload
//! ```

use crate::codec::Message;
use crate::error::{Error, Result};
use crate::types::{
    EventgroupId, InstanceId, MajorVersion, MessageType, MinorVersion, ServiceId, SessionId, Ttl,
    SD_CLIENT, SD_DATA_SIZE, SD_ENTRY_SIZE, SD_FLAG_REBOOT, SD_FLAG_UNICAST, SD_METHOD,
    SD_SERVICE,
};
use std::net::{Ipv4Addr, Ipv6Addr};

// =============================================================================
// ENTRIES
// =============================================================================

/// Wire entry types. Stop/Nack forms are the same types with ttl 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    FindService = 0x00,
    OfferService = 0x01,
    SubscribeEventgroup = 0x06,
    SubscribeEventgroupAck = 0x07,
}

impl EntryType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::FindService),
            0x01 => Some(Self::OfferService),
            0x06 => Some(Self::SubscribeEventgroup),
            0x07 => Some(Self::SubscribeEventgroupAck),
            _ => None,
        }
    }

    fn is_eventgroup(self) -> bool {
        matches!(self, Self::SubscribeEventgroup | Self::SubscribeEventgroupAck)
    }
}

/// Type-specific tail of an entry (bytes 12..16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPayload {
    /// Find/Offer carry the minor version.
    Service { minor: MinorVersion },
    /// Subscribe/Ack carry the eventgroup and a disambiguation counter.
    Eventgroup { eventgroup: EventgroupId, counter: u8 },
}

/// One decoded SD entry with its referenced options resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub entry_type: EntryType,
    pub service: ServiceId,
    pub instance: InstanceId,
    pub major: MajorVersion,
    pub ttl: Ttl,
    pub payload: EntryPayload,
    pub options: Vec<SdOption>,
}

impl Entry {
    pub fn find(service: ServiceId, instance: InstanceId, major: MajorVersion, ttl: Ttl) -> Self {
        Self {
            entry_type: EntryType::FindService,
            service,
            instance,
            major,
            ttl,
            payload: EntryPayload::Service { minor: crate::types::ANY_MINOR },
            options: Vec::new(),
        }
    }

    pub fn offer(
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        ttl: Ttl,
    ) -> Self {
        Self {
            entry_type: EntryType::OfferService,
            service,
            instance,
            major,
            ttl,
            payload: EntryPayload::Service { minor },
            options: Vec::new(),
        }
    }

    pub fn subscribe(
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        eventgroup: EventgroupId,
        counter: u8,
        ttl: Ttl,
    ) -> Self {
        Self {
            entry_type: EntryType::SubscribeEventgroup,
            service,
            instance,
            major,
            ttl,
            payload: EntryPayload::Eventgroup { eventgroup, counter },
            options: Vec::new(),
        }
    }

    pub fn subscribe_ack(
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        eventgroup: EventgroupId,
        counter: u8,
        ttl: Ttl,
    ) -> Self {
        Self {
            entry_type: EntryType::SubscribeEventgroupAck,
            service,
            instance,
            major,
            ttl,
            payload: EntryPayload::Eventgroup { eventgroup, counter },
            options: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: Vec<SdOption>) -> Self {
        self.options = options;
        self
    }

    /// OfferService with ttl 0.
    pub fn is_stop_offer(&self) -> bool {
        self.entry_type == EntryType::OfferService && self.ttl == 0
    }

    /// SubscribeEventgroup with ttl 0.
    pub fn is_stop_subscribe(&self) -> bool {
        self.entry_type == EntryType::SubscribeEventgroup && self.ttl == 0
    }

    /// SubscribeEventgroupAck with ttl 0.
    pub fn is_nack(&self) -> bool {
        self.entry_type == EntryType::SubscribeEventgroupAck && self.ttl == 0
    }

    pub fn eventgroup(&self) -> Option<EventgroupId> {
        match self.payload {
            EntryPayload::Eventgroup { eventgroup, .. } => Some(eventgroup),
            EntryPayload::Service { .. } => None,
        }
    }
}

// =============================================================================
// OPTIONS
// =============================================================================

/// Transport protocol byte in endpoint options (IANA protocol numbers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum L4Proto {
    Tcp = 0x06,
    Udp = 0x11,
}

impl L4Proto {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x06 => Some(Self::Tcp),
            0x11 => Some(Self::Udp),
            _ => None,
        }
    }
}

/// SD option.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SdOption {
    Configuration { payload: Vec<u8> },
    LoadBalancing { priority: u16, weight: u16 },
    Ipv4Endpoint { addr: Ipv4Addr, l4: L4Proto, port: u16 },
    Ipv6Endpoint { addr: Ipv6Addr, l4: L4Proto, port: u16 },
    Ipv4Multicast { addr: Ipv4Addr, port: u16 },
    Ipv6Multicast { addr: Ipv6Addr, port: u16 },
}

const OPT_CONFIGURATION: u8 = 0x01;
const OPT_LOAD_BALANCING: u8 = 0x02;
const OPT_IPV4_ENDPOINT: u8 = 0x04;
const OPT_IPV6_ENDPOINT: u8 = 0x06;
const OPT_IPV4_MULTICAST: u8 = 0x14;
const OPT_IPV6_MULTICAST: u8 = 0x16;

impl SdOption {
    pub fn ipv4(addr: Ipv4Addr, l4: L4Proto, port: u16) -> Self {
        Self::Ipv4Endpoint { addr, l4, port }
    }

    pub fn ipv4_multicast(addr: Ipv4Addr, port: u16) -> Self {
        Self::Ipv4Multicast { addr, port }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            SdOption::Configuration { payload } => {
                buf.extend_from_slice(&(1 + payload.len() as u16).to_be_bytes());
                buf.push(OPT_CONFIGURATION);
                buf.push(0); // reserved
                buf.extend_from_slice(payload);
            }
            SdOption::LoadBalancing { priority, weight } => {
                buf.extend_from_slice(&5u16.to_be_bytes());
                buf.push(OPT_LOAD_BALANCING);
                buf.push(0);
                buf.extend_from_slice(&priority.to_be_bytes());
                buf.extend_from_slice(&weight.to_be_bytes());
            }
            SdOption::Ipv4Endpoint { addr, l4, port } => {
                buf.extend_from_slice(&9u16.to_be_bytes());
                buf.push(OPT_IPV4_ENDPOINT);
                buf.push(0);
                buf.extend_from_slice(&addr.octets());
                buf.push(0);
                buf.push(*l4 as u8);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            SdOption::Ipv6Endpoint { addr, l4, port } => {
                buf.extend_from_slice(&21u16.to_be_bytes());
                buf.push(OPT_IPV6_ENDPOINT);
                buf.push(0);
                buf.extend_from_slice(&addr.octets());
                buf.push(0);
                buf.push(*l4 as u8);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            SdOption::Ipv4Multicast { addr, port } => {
                buf.extend_from_slice(&9u16.to_be_bytes());
                buf.push(OPT_IPV4_MULTICAST);
                buf.push(0);
                buf.extend_from_slice(&addr.octets());
                buf.push(0);
                buf.push(L4Proto::Udp as u8);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            SdOption::Ipv6Multicast { addr, port } => {
                buf.extend_from_slice(&21u16.to_be_bytes());
                buf.push(OPT_IPV6_MULTICAST);
                buf.push(0);
                buf.extend_from_slice(&addr.octets());
                buf.push(0);
                buf.push(L4Proto::Udp as u8);
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    fn decode(type_byte: u8, payload: &[u8]) -> Result<Self> {
        // `payload` starts at the reserved byte after the type field.
        let need = |n: usize| {
            if payload.len() < n {
                Err(Error::Malformed("short sd option"))
            } else {
                Ok(())
            }
        };
        match type_byte {
            OPT_CONFIGURATION => {
                need(1)?;
                Ok(SdOption::Configuration { payload: payload[1..].to_vec() })
            }
            OPT_LOAD_BALANCING => {
                need(5)?;
                Ok(SdOption::LoadBalancing {
                    priority: u16::from_be_bytes([payload[1], payload[2]]),
                    weight: u16::from_be_bytes([payload[3], payload[4]]),
                })
            }
            OPT_IPV4_ENDPOINT => {
                need(9)?;
                Ok(SdOption::Ipv4Endpoint {
                    addr: Ipv4Addr::new(payload[1], payload[2], payload[3], payload[4]),
                    l4: L4Proto::from_u8(payload[6])
                        .ok_or(Error::Malformed("unknown l4 protocol"))?,
                    port: u16::from_be_bytes([payload[7], payload[8]]),
                })
            }
            OPT_IPV6_ENDPOINT => {
                need(21)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&payload[1..17]);
                Ok(SdOption::Ipv6Endpoint {
                    addr: Ipv6Addr::from(octets),
                    l4: L4Proto::from_u8(payload[18])
                        .ok_or(Error::Malformed("unknown l4 protocol"))?,
                    port: u16::from_be_bytes([payload[19], payload[20]]),
                })
            }
            OPT_IPV4_MULTICAST => {
                need(9)?;
                Ok(SdOption::Ipv4Multicast {
                    addr: Ipv4Addr::new(payload[1], payload[2], payload[3], payload[4]),
                    port: u16::from_be_bytes([payload[7], payload[8]]),
                })
            }
            OPT_IPV6_MULTICAST => {
                need(21)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&payload[1..17]);
                Ok(SdOption::Ipv6Multicast {
                    addr: Ipv6Addr::from(octets),
                    port: u16::from_be_bytes([payload[19], payload[20]]),
                })
            }
            _ => Err(Error::Malformed("unknown sd option type")),
        }
    }
}

// =============================================================================
// MESSAGE
// =============================================================================

/// One SD datagram body: flags plus a batch of entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdMessage {
    pub reboot: bool,
    pub unicast: bool,
    pub entries: Vec<Entry>,
}

impl SdMessage {
    pub fn new(reboot: bool, unicast: bool) -> Self {
        Self { reboot, unicast, entries: Vec::new() }
    }

    /// Encode the SD body: flags, reserved, entries, options. Options
    /// referenced by each entry become a contiguous run; identical runs
    /// are emitted once and shared by index.
    pub fn encode(&self) -> Vec<u8> {
        let mut options_wire: Vec<u8> = Vec::new();
        // (start index, count) per already-emitted run, for dedup.
        let mut runs: Vec<(Vec<SdOption>, u8, u8)> = Vec::new();
        let mut option_count: u8 = 0;

        let mut entries_wire = Vec::with_capacity(self.entries.len() * SD_ENTRY_SIZE);
        for entry in &self.entries {
            let (index1, count1) = if entry.options.is_empty() {
                (0u8, 0u8)
            } else if let Some((_, start, count)) =
                runs.iter().find(|(opts, _, _)| opts == &entry.options)
            {
                (*start, *count)
            } else {
                let start = option_count;
                for option in &entry.options {
                    option.encode_into(&mut options_wire);
                }
                let count = entry.options.len() as u8;
                option_count += count;
                runs.push((entry.options.clone(), start, count));
                (start, count)
            };

            entries_wire.push(entry.entry_type as u8);
            entries_wire.push(index1);
            entries_wire.push(0); // index2: second run unused
            entries_wire.push(count1 << 4);
            entries_wire.extend_from_slice(&entry.service.to_be_bytes());
            entries_wire.extend_from_slice(&entry.instance.to_be_bytes());
            entries_wire.push(entry.major);
            let ttl = entry.ttl.to_be_bytes();
            entries_wire.extend_from_slice(&ttl[1..4]);
            match entry.payload {
                EntryPayload::Service { minor } => {
                    entries_wire.extend_from_slice(&minor.to_be_bytes());
                }
                EntryPayload::Eventgroup { eventgroup, counter } => {
                    entries_wire.push(0);
                    entries_wire.push(counter & 0x0F);
                    entries_wire.extend_from_slice(&eventgroup.to_be_bytes());
                }
            }
        }

        let mut body = Vec::with_capacity(SD_DATA_SIZE + entries_wire.len() + options_wire.len());
        let mut flags = 0u8;
        if self.reboot {
            flags |= SD_FLAG_REBOOT;
        }
        if self.unicast {
            flags |= SD_FLAG_UNICAST;
        }
        body.push(flags);
        body.extend_from_slice(&[0, 0, 0]); // reserved u24
        body.extend_from_slice(&(entries_wire.len() as u32).to_be_bytes());
        body.extend_from_slice(&entries_wire);
        body.extend_from_slice(&(options_wire.len() as u32).to_be_bytes());
        body.extend_from_slice(&options_wire);
        body
    }

    /// Wrap the body into a SOME/IP message with the SD header fields.
    pub fn to_someip(&self, session: SessionId) -> Message {
        let mut message =
            Message::new(SD_SERVICE, SD_METHOD, MessageType::Notification, self.encode());
        message.client = SD_CLIENT;
        message.session = session;
        message
    }

    /// Decode an SD body, resolving option references.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < SD_DATA_SIZE {
            return Err(Error::Malformed("short sd body"));
        }
        let flags = body[0];
        let entries_len = u32::from_be_bytes([body[4], body[5], body[6], body[7]]) as usize;
        if entries_len % SD_ENTRY_SIZE != 0 {
            return Err(Error::Malformed("sd entries length not a multiple of 16"));
        }
        if body.len() < 8 + entries_len + 4 {
            return Err(Error::Malformed("sd entries truncated"));
        }
        let entries_wire = &body[8..8 + entries_len];
        let options_off = 8 + entries_len;
        let options_len = u32::from_be_bytes([
            body[options_off],
            body[options_off + 1],
            body[options_off + 2],
            body[options_off + 3],
        ]) as usize;
        if body.len() < options_off + 4 + options_len {
            return Err(Error::Malformed("sd options truncated"));
        }
        let options_wire = &body[options_off + 4..options_off + 4 + options_len];

        let options = decode_options(options_wire)?;

        let mut entries = Vec::with_capacity(entries_len / SD_ENTRY_SIZE);
        for raw in entries_wire.chunks_exact(SD_ENTRY_SIZE) {
            let entry_type =
                EntryType::from_u8(raw[0]).ok_or(Error::Malformed("unknown sd entry type"))?;
            let index1 = raw[1] as usize;
            let index2 = raw[2] as usize;
            let count1 = (raw[3] >> 4) as usize;
            let count2 = (raw[3] & 0x0F) as usize;
            let service = u16::from_be_bytes([raw[4], raw[5]]);
            let instance = u16::from_be_bytes([raw[6], raw[7]]);
            let major = raw[8];
            let ttl = u32::from_be_bytes([0, raw[9], raw[10], raw[11]]);
            let payload = if entry_type.is_eventgroup() {
                EntryPayload::Eventgroup {
                    eventgroup: u16::from_be_bytes([raw[14], raw[15]]),
                    counter: raw[13] & 0x0F,
                }
            } else {
                EntryPayload::Service {
                    minor: u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]),
                }
            };

            let mut resolved = Vec::with_capacity(count1 + count2);
            for (index, count) in [(index1, count1), (index2, count2)] {
                if count == 0 {
                    continue;
                }
                if index + count > options.len() {
                    return Err(Error::Malformed("sd option index out of range"));
                }
                resolved.extend_from_slice(&options[index..index + count]);
            }

            entries.push(Entry {
                entry_type,
                service,
                instance,
                major,
                ttl,
                payload,
                options: resolved,
            });
        }

        Ok(Self {
            reboot: flags & SD_FLAG_REBOOT != 0,
            unicast: flags & SD_FLAG_UNICAST != 0,
            entries,
        })
    }
}

fn decode_options(mut wire: &[u8]) -> Result<Vec<SdOption>> {
    let mut options = Vec::new();
    while !wire.is_empty() {
        if wire.len() < 3 {
            return Err(Error::Malformed("short sd option header"));
        }
        let length = u16::from_be_bytes([wire[0], wire[1]]) as usize;
        let type_byte = wire[2];
        if wire.len() < 3 + length {
            return Err(Error::Malformed("sd option truncated"));
        }
        options.push(SdOption::decode(type_byte, &wire[3..3 + length])?);
        wire = &wire[3 + length..];
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint_option() -> SdOption {
        SdOption::ipv4(Ipv4Addr::new(192, 168, 1, 10), L4Proto::Tcp, 30509)
    }

    #[test]
    fn offer_round_trip() {
        let mut msg = SdMessage::new(true, true);
        msg.entries.push(
            Entry::offer(0x1234, 0x0001, 1, 0, 5).with_options(vec![endpoint_option()]),
        );
        let body = msg.encode();
        let back = SdMessage::decode(&body).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn entries_precede_options() {
        let mut msg = SdMessage::new(false, false);
        msg.entries
            .push(Entry::offer(0x1111, 1, 1, 0, 5).with_options(vec![endpoint_option()]));
        let body = msg.encode();
        let entries_len = u32::from_be_bytes([body[4], body[5], body[6], body[7]]) as usize;
        assert_eq!(entries_len, SD_ENTRY_SIZE);
        // Options array follows the entries array.
        let options_len_off = 8 + entries_len;
        let options_len = u32::from_be_bytes([
            body[options_len_off],
            body[options_len_off + 1],
            body[options_len_off + 2],
            body[options_len_off + 3],
        ]) as usize;
        assert_eq!(body.len(), options_len_off + 4 + options_len);
    }

    #[test]
    fn identical_option_runs_shared() {
        let mut msg = SdMessage::new(false, false);
        for service in [0x1000u16, 0x1001, 0x1002] {
            msg.entries
                .push(Entry::offer(service, 1, 1, 0, 5).with_options(vec![endpoint_option()]));
        }
        let body = msg.encode();
        // One 9-byte IPv4 option + 3-byte header, emitted once.
        let entries_len = 3 * SD_ENTRY_SIZE;
        let options_len = u32::from_be_bytes([
            body[8 + entries_len],
            body[8 + entries_len + 1],
            body[8 + entries_len + 2],
            body[8 + entries_len + 3],
        ]) as usize;
        assert_eq!(options_len, 12);

        let back = SdMessage::decode(&body).unwrap();
        for entry in &back.entries {
            assert_eq!(entry.options, vec![endpoint_option()]);
        }
    }

    #[test]
    fn subscribe_round_trip_with_counter() {
        let mut msg = SdMessage::new(false, true);
        msg.entries.push(
            Entry::subscribe(0x1234, 1, 1, 0x0005, 3, 300)
                .with_options(vec![SdOption::ipv4(Ipv4Addr::new(10, 0, 0, 2), L4Proto::Udp, 40000)]),
        );
        let back = SdMessage::decode(&msg.encode()).unwrap();
        assert_eq!(back.entries[0].eventgroup(), Some(0x0005));
        assert_eq!(
            back.entries[0].payload,
            EntryPayload::Eventgroup { eventgroup: 0x0005, counter: 3 }
        );
        assert_eq!(back.entries[0].ttl, 300);
    }

    #[test]
    fn ttl_is_24_bit() {
        let mut msg = SdMessage::new(false, false);
        msg.entries.push(Entry::offer(1, 1, 1, 0, 0x00FF_FFFF));
        let back = SdMessage::decode(&msg.encode()).unwrap();
        assert_eq!(back.entries[0].ttl, 0x00FF_FFFF);
    }

    #[test]
    fn stop_classification() {
        assert!(Entry::offer(1, 1, 1, 0, 0).is_stop_offer());
        assert!(!Entry::offer(1, 1, 1, 0, 5).is_stop_offer());
        assert!(Entry::subscribe(1, 1, 1, 2, 0, 0).is_stop_subscribe());
        assert!(Entry::subscribe_ack(1, 1, 1, 2, 0, 0).is_nack());
        assert!(!Entry::subscribe_ack(1, 1, 1, 2, 0, 10).is_nack());
    }

    #[test]
    fn reboot_and_unicast_flags() {
        let body = SdMessage::new(true, false).encode();
        assert_eq!(body[0], SD_FLAG_REBOOT);
        let body = SdMessage::new(false, true).encode();
        assert_eq!(body[0], SD_FLAG_UNICAST);
    }

    #[test]
    fn multicast_option_round_trip() {
        let mut msg = SdMessage::new(false, false);
        msg.entries.push(Entry::subscribe_ack(1, 1, 1, 5, 0, 60).with_options(vec![
            SdOption::ipv4_multicast(Ipv4Addr::new(224, 225, 226, 1), 32000),
        ]));
        let back = SdMessage::decode(&msg.encode()).unwrap();
        assert_eq!(
            back.entries[0].options,
            vec![SdOption::ipv4_multicast(Ipv4Addr::new(224, 225, 226, 1), 32000)]
        );
    }

    #[test]
    fn ipv6_endpoint_round_trip() {
        let addr: Ipv6Addr = "fd00::1".parse().unwrap();
        let mut msg = SdMessage::new(false, false);
        msg.entries.push(
            Entry::offer(2, 1, 1, 0, 5)
                .with_options(vec![SdOption::Ipv6Endpoint { addr, l4: L4Proto::Udp, port: 4000 }]),
        );
        let back = SdMessage::decode(&msg.encode()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn truncated_bodies_rejected() {
        let mut msg = SdMessage::new(false, false);
        msg.entries.push(Entry::offer(1, 1, 1, 0, 5).with_options(vec![endpoint_option()]));
        let body = msg.encode();
        for cut in [0, 4, 11, body.len() - 1] {
            assert!(SdMessage::decode(&body[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn bad_option_index_rejected() {
        let mut msg = SdMessage::new(false, false);
        msg.entries.push(Entry::offer(1, 1, 1, 0, 5));
        let mut body = msg.encode();
        body[8 + 3] = 0x10; // claim one option, none present
        assert!(SdMessage::decode(&body).is_err());
    }

    #[test]
    fn sd_someip_header_fields() {
        let msg = SdMessage::new(false, true);
        let framed = msg.to_someip(0x0001);
        assert_eq!(framed.service, SD_SERVICE);
        assert_eq!(framed.method, SD_METHOD);
        assert_eq!(framed.client, SD_CLIENT);
        assert_eq!(framed.session, 0x0001);
        assert_eq!(framed.message_type, MessageType::Notification);
    }
}
