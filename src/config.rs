//! Configuration loading and the read-only configuration view.
//!
//! The on-disk format is a JSON tree. Numeric values are accepted both as
//! JSON numbers and as strings (`"0x1234"` or `"4660"`), matching the
//! files deployed ECUs actually ship. The loader resolves the tree into
//! an immutable [`Config`] that is built once at startup and passed to
//! every component as an explicit `Arc<Config>` handle; there is no
//! process-wide configuration state.
//!
//! Lookups on the hot path (`reliable_port`, `message_size_reliable`,
//! `has_enabled_magic_cookies`) are HashMap reads.

use crate::error::{Error, Result};
use crate::types::{
    ClientId, EventId, EventgroupId, InstanceId, MajorVersion, MinorVersion, ServiceId, Ttl,
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_ENDPOINT_QUEUE_LIMIT, DEFAULT_FLUSH_TIMEOUT_MS,
    DEFAULT_INTERFACE_VERSION, DEFAULT_MAX_CONNECT_TIMEOUT_MS, DEFAULT_MAX_MESSAGE_SIZE_LOCAL,
    DEFAULT_MAX_MESSAGE_SIZE_RELIABLE, SD_DEFAULT_CYCLIC_OFFER_DELAY_MS, SD_DEFAULT_ENABLED,
    SD_DEFAULT_INITIAL_DELAY_MAX_MS, SD_DEFAULT_INITIAL_DELAY_MIN_MS, SD_DEFAULT_MULTICAST,
    SD_DEFAULT_PORT, SD_DEFAULT_PROTOCOL, SD_DEFAULT_REPETITIONS_BASE_DELAY_MS,
    SD_DEFAULT_REPETITIONS_MAX, SD_DEFAULT_REQUEST_RESPONSE_DELAY_MS, SD_DEFAULT_TTL,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use tracing::warn;

/// Environment variable electing this process as the routing host.
pub const ENV_ROUTING: &str = "SOMEIP_ROUTING";

/// Environment variable naming the configuration file to load.
pub const ENV_CONFIGURATION: &str = "SOMEIP_CONFIGURATION";

/// Default configuration file path when neither flag nor env names one.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/someip/someip.json";

// =============================================================================
// VALUE HELPERS
// =============================================================================
// The tree is provider-agnostic: "0x1234", "4660" and 4660 all denote the
// same number, "true"/true the same flag. Unknown keys are ignored.

fn parse_u64(value: &Value, key: &str) -> Result<u64> {
    match value {
        Value::Number(n) => {
            n.as_u64().ok_or_else(|| Error::Config(format!("{key}: not an unsigned integer")))
        }
        Value::String(s) => {
            let s = s.trim();
            let parsed = if let Some(hexa) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u64::from_str_radix(hexa, 16)
            } else {
                s.parse::<u64>()
            };
            parsed.map_err(|_| Error::Config(format!("{key}: cannot parse {s:?} as a number")))
        }
        _ => Err(Error::Config(format!("{key}: expected number or numeric string"))),
    }
}

fn parse_u32(value: &Value, key: &str) -> Result<u32> {
    let v = parse_u64(value, key)?;
    u32::try_from(v).map_err(|_| Error::Config(format!("{key}: {v} exceeds 32 bits")))
}

fn parse_u16(value: &Value, key: &str) -> Result<u16> {
    let v = parse_u64(value, key)?;
    u16::try_from(v).map_err(|_| Error::Config(format!("{key}: {v} exceeds 16 bits")))
}

fn parse_u8(value: &Value, key: &str) -> Result<u8> {
    let v = parse_u64(value, key)?;
    u8::try_from(v).map_err(|_| Error::Config(format!("{key}: {v} exceeds 8 bits")))
}

fn parse_bool(value: &Value, key: &str) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.trim() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(Error::Config(format!("{key}: cannot parse {other:?} as bool"))),
        },
        _ => Err(Error::Config(format!("{key}: expected bool"))),
    }
}

fn parse_str<'v>(value: &'v Value, key: &str) -> Result<&'v str> {
    value.as_str().ok_or_else(|| Error::Config(format!("{key}: expected string")))
}

// =============================================================================
// RESOLVED MODEL
// =============================================================================

/// Log sink selection from the `logging` section.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub console: bool,
    pub file: bool,
    pub dlt: bool,
    pub file_path: Option<String>,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { console: true, file: false, dlt: false, file_path: None, level: "info".into() }
    }
}

/// One eventgroup of a service: member events plus an optional multicast
/// target for fanout-once delivery.
#[derive(Debug, Clone)]
pub struct EventgroupConfig {
    pub eventgroup: EventgroupId,
    pub events: Vec<EventId>,
    pub multicast: Option<(Ipv4Addr, u16)>,
}

/// A configured service instance, local or remote.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub service: ServiceId,
    pub instance: InstanceId,
    /// Address the service lives on. Equal to our unicast for local
    /// services; a different address marks the service as remote.
    pub unicast: IpAddr,
    pub reliable_port: Option<u16>,
    pub unreliable_port: Option<u16>,
    /// Magic-cookie resynchronization on the reliable port.
    pub magic_cookies: bool,
    pub major: MajorVersion,
    pub minor: MinorVersion,
    pub events: Vec<EventId>,
    pub eventgroups: Vec<EventgroupConfig>,
}

impl ServiceConfig {
    /// Eventgroups containing `event`.
    pub fn groups_of(&self, event: EventId) -> impl Iterator<Item = &EventgroupConfig> {
        self.eventgroups.iter().filter(move |g| g.events.contains(&event))
    }
}

/// One application hosted by this node.
#[derive(Debug, Clone)]
pub struct ApplicationConfig {
    pub name: String,
    pub id: ClientId,
    pub num_dispatchers: usize,
}

/// Service-discovery parameters (`service-discovery` section).
#[derive(Debug, Clone)]
pub struct SdConfig {
    pub enabled: bool,
    pub multicast: Ipv4Addr,
    pub port: u16,
    pub protocol: String,
    pub initial_delay_min_ms: u64,
    pub initial_delay_max_ms: u64,
    pub repetitions_base_delay_ms: u64,
    pub repetitions_max: u8,
    pub ttl: Ttl,
    pub cyclic_offer_delay_ms: u64,
    pub request_response_delay_ms: u64,
}

impl Default for SdConfig {
    fn default() -> Self {
        Self {
            enabled: SD_DEFAULT_ENABLED,
            multicast: SD_DEFAULT_MULTICAST.parse().unwrap(),
            port: SD_DEFAULT_PORT,
            protocol: SD_DEFAULT_PROTOCOL.into(),
            initial_delay_min_ms: SD_DEFAULT_INITIAL_DELAY_MIN_MS,
            initial_delay_max_ms: SD_DEFAULT_INITIAL_DELAY_MAX_MS,
            repetitions_base_delay_ms: SD_DEFAULT_REPETITIONS_BASE_DELAY_MS,
            repetitions_max: SD_DEFAULT_REPETITIONS_MAX,
            ttl: SD_DEFAULT_TTL,
            cyclic_offer_delay_ms: SD_DEFAULT_CYCLIC_OFFER_DELAY_MS,
            request_response_delay_ms: SD_DEFAULT_REQUEST_RESPONSE_DELAY_MS,
        }
    }
}

/// The resolved, immutable configuration view.
#[derive(Debug)]
pub struct Config {
    unicast: IpAddr,
    logging: LoggingConfig,
    services: HashMap<(ServiceId, InstanceId), ServiceConfig>,
    applications: HashMap<String, ApplicationConfig>,
    routing_host: String,
    sd: SdConfig,

    max_message_size_local: u32,
    /// (address, port) → reliable message-size ceiling.
    message_sizes: HashMap<(IpAddr, u16), u32>,
    /// address → ports with magic cookies enabled.
    magic_cookies: HashMap<IpAddr, HashSet<u16>>,

    flush_timeout_ms: u64,
    connect_timeout_ms: u64,
    max_connect_timeout_ms: u64,
    endpoint_queue_limit: usize,
}

impl Config {
    // -------------------------------------------------------------------------
    // Loading
    // -------------------------------------------------------------------------

    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let tree: Value =
            serde_json::from_str(text).map_err(|e| Error::Config(format!("invalid JSON: {e}")))?;
        Self::from_tree(&tree)
    }

    /// Resolve a configuration tree into the immutable view.
    pub fn from_tree(tree: &Value) -> Result<Self> {
        let root = tree.as_object().ok_or_else(|| Error::Config("root must be an object".into()))?;

        let unicast: IpAddr = parse_str(
            root.get("unicast").ok_or_else(|| Error::Config("missing \"unicast\"".into()))?,
            "unicast",
        )?
        .parse()
        .map_err(|e| Error::Config(format!("unicast: {e}")))?;

        let logging = Self::load_logging(root.get("logging"))?;
        let (max_message_size_local, message_sizes, flush_timeout_ms, connect_timeout_ms,
             max_connect_timeout_ms, endpoint_queue_limit) =
            Self::load_someip(root.get("someip"))?;

        let mut services = HashMap::new();
        let mut magic_cookies: HashMap<IpAddr, HashSet<u16>> = HashMap::new();
        if let Some(list) = root.get("services") {
            let list = list
                .as_array()
                .ok_or_else(|| Error::Config("services: expected array".into()))?;
            for entry in list {
                let svc = Self::load_service(entry, unicast)?;
                if svc.magic_cookies {
                    if let Some(port) = svc.reliable_port {
                        magic_cookies.entry(svc.unicast).or_default().insert(port);
                    } else {
                        return Err(Error::Config(format!(
                            "service {:#06x}.{:#06x}: magic cookies without a reliable port",
                            svc.service, svc.instance
                        )));
                    }
                }
                let key = (svc.service, svc.instance);
                if services.insert(key, svc).is_some() {
                    return Err(Error::Config(format!(
                        "duplicate service {:#06x}.{:#06x}",
                        key.0, key.1
                    )));
                }
            }
        }

        let mut applications = HashMap::new();
        if let Some(list) = root.get("applications") {
            let list = list
                .as_array()
                .ok_or_else(|| Error::Config("applications: expected array".into()))?;
            for entry in list {
                let app = Self::load_application(entry)?;
                if applications.insert(app.name.clone(), app).is_some() {
                    return Err(Error::Config("duplicate application name".into()));
                }
            }
        }

        let routing_host = match root.get("routing") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Object(o)) => match o.get("host") {
                Some(v) => parse_str(v, "routing.host")?.to_owned(),
                None => String::new(),
            },
            Some(_) => return Err(Error::Config("routing: expected string or object".into())),
            None => String::new(),
        };

        let sd = Self::load_sd(root.get("service-discovery"))?;

        Ok(Self {
            unicast,
            logging,
            services,
            applications,
            routing_host,
            sd,
            max_message_size_local,
            message_sizes,
            magic_cookies,
            flush_timeout_ms,
            connect_timeout_ms,
            max_connect_timeout_ms,
            endpoint_queue_limit,
        })
    }

    fn load_logging(section: Option<&Value>) -> Result<LoggingConfig> {
        let mut out = LoggingConfig::default();
        let Some(section) = section else { return Ok(out) };
        let obj = section
            .as_object()
            .ok_or_else(|| Error::Config("logging: expected object".into()))?;
        if let Some(v) = obj.get("console") {
            out.console = parse_bool(v, "logging.console")?;
        }
        if let Some(v) = obj.get("dlt") {
            out.dlt = parse_bool(v, "logging.dlt")?;
        }
        if let Some(v) = obj.get("level") {
            out.level = parse_str(v, "logging.level")?.to_owned();
        }
        match obj.get("file") {
            Some(Value::Object(file)) => {
                if let Some(v) = file.get("enable") {
                    out.file = parse_bool(v, "logging.file.enable")?;
                }
                if let Some(v) = file.get("path") {
                    out.file_path = Some(parse_str(v, "logging.file.path")?.to_owned());
                }
            }
            Some(v) => out.file = parse_bool(v, "logging.file")?,
            None => {}
        }
        Ok(out)
    }

    #[allow(clippy::type_complexity)]
    fn load_someip(
        section: Option<&Value>,
    ) -> Result<(u32, HashMap<(IpAddr, u16), u32>, u64, u64, u64, usize)> {
        let mut local = DEFAULT_MAX_MESSAGE_SIZE_LOCAL;
        let mut sizes = HashMap::new();
        let mut flush = DEFAULT_FLUSH_TIMEOUT_MS;
        let mut connect = DEFAULT_CONNECT_TIMEOUT_MS;
        let mut max_connect = DEFAULT_MAX_CONNECT_TIMEOUT_MS;
        let mut queue_limit = DEFAULT_ENDPOINT_QUEUE_LIMIT;

        let Some(section) = section else {
            return Ok((local, sizes, flush, connect, max_connect, queue_limit));
        };
        let obj =
            section.as_object().ok_or_else(|| Error::Config("someip: expected object".into()))?;

        if let Some(v) = obj.get("max-payload-local") {
            local = parse_u32(v, "someip.max-payload-local")?;
        }
        if let Some(v) = obj.get("flush-timeout") {
            flush = parse_u64(v, "someip.flush-timeout")?;
        }
        if let Some(v) = obj.get("connect-timeout") {
            connect = parse_u64(v, "someip.connect-timeout")?;
        }
        if let Some(v) = obj.get("max-connect-timeout") {
            max_connect = parse_u64(v, "someip.max-connect-timeout")?;
        }
        if let Some(v) = obj.get("endpoint-queue-limit") {
            queue_limit = parse_u64(v, "someip.endpoint-queue-limit")? as usize;
        }
        if connect == 0 || connect > max_connect {
            return Err(Error::Config(
                "someip.connect-timeout must be nonzero and <= max-connect-timeout".into(),
            ));
        }

        if let Some(list) = obj.get("message-sizes") {
            let list = list
                .as_array()
                .ok_or_else(|| Error::Config("someip.message-sizes: expected array".into()))?;
            for entry in list {
                let e = entry
                    .as_object()
                    .ok_or_else(|| Error::Config("message-sizes entry: expected object".into()))?;
                let addr: IpAddr = parse_str(
                    e.get("unicast")
                        .ok_or_else(|| Error::Config("message-sizes entry: missing unicast".into()))?,
                    "message-sizes.unicast",
                )?
                .parse()
                .map_err(|err| Error::Config(format!("message-sizes.unicast: {err}")))?;
                let port = parse_u16(
                    e.get("port")
                        .ok_or_else(|| Error::Config("message-sizes entry: missing port".into()))?,
                    "message-sizes.port",
                )?;
                let size = parse_u32(
                    e.get("max-payload")
                        .ok_or_else(|| Error::Config("message-sizes entry: missing max-payload".into()))?,
                    "message-sizes.max-payload",
                )?;
                sizes.insert((addr, port), size);
            }
        }

        Ok((local, sizes, flush, connect, max_connect, queue_limit))
    }

    fn load_service(entry: &Value, our_unicast: IpAddr) -> Result<ServiceConfig> {
        let obj =
            entry.as_object().ok_or_else(|| Error::Config("service: expected object".into()))?;
        let service = parse_u16(
            obj.get("service").ok_or_else(|| Error::Config("service: missing id".into()))?,
            "service",
        )?;
        let instance = parse_u16(
            obj.get("instance")
                .ok_or_else(|| Error::Config("service: missing instance".into()))?,
            "instance",
        )?;

        let unicast = match obj.get("unicast") {
            Some(v) => parse_str(v, "service.unicast")?
                .parse()
                .map_err(|e| Error::Config(format!("service.unicast: {e}")))?,
            None => our_unicast,
        };

        let mut reliable_port = None;
        let mut magic_cookies = false;
        match obj.get("reliable") {
            Some(Value::Object(rel)) => {
                if let Some(v) = rel.get("port") {
                    reliable_port = Some(parse_u16(v, "reliable.port")?);
                }
                if let Some(v) = rel.get("enable-magic-cookies") {
                    magic_cookies = parse_bool(v, "reliable.enable-magic-cookies")?;
                }
            }
            Some(v) => reliable_port = Some(parse_u16(v, "reliable")?),
            None => {}
        }

        let unreliable_port = match obj.get("unreliable") {
            Some(v) => Some(parse_u16(v, "unreliable")?),
            None => None,
        };

        let major = match obj.get("major") {
            Some(v) => parse_u8(v, "major")?,
            None => DEFAULT_INTERFACE_VERSION,
        };
        let minor = match obj.get("minor") {
            Some(v) => parse_u32(v, "minor")?,
            None => 0,
        };

        let mut events = Vec::new();
        if let Some(list) = obj.get("events") {
            let list =
                list.as_array().ok_or_else(|| Error::Config("events: expected array".into()))?;
            for ev in list {
                // Either a bare id or an object with an "event" key.
                let id = match ev {
                    Value::Object(e) => parse_u16(
                        e.get("event").ok_or_else(|| Error::Config("events entry: missing event".into()))?,
                        "events.event",
                    )?,
                    other => parse_u16(other, "events")?,
                };
                events.push(id);
            }
        }

        let mut eventgroups = Vec::new();
        if let Some(list) = obj.get("eventgroups") {
            let list = list
                .as_array()
                .ok_or_else(|| Error::Config("eventgroups: expected array".into()))?;
            for eg in list {
                let e = eg
                    .as_object()
                    .ok_or_else(|| Error::Config("eventgroup: expected object".into()))?;
                let eventgroup = parse_u16(
                    e.get("eventgroup")
                        .ok_or_else(|| Error::Config("eventgroup: missing id".into()))?,
                    "eventgroup",
                )?;
                let mut member_events = Vec::new();
                if let Some(evs) = e.get("events") {
                    let evs = evs
                        .as_array()
                        .ok_or_else(|| Error::Config("eventgroup.events: expected array".into()))?;
                    for ev in evs {
                        member_events.push(parse_u16(ev, "eventgroup.events")?);
                    }
                }
                let multicast = match (e.get("multicast"), e.get("multicast-port")) {
                    (Some(addr), Some(port)) => {
                        let addr: Ipv4Addr = parse_str(addr, "eventgroup.multicast")?
                            .parse()
                            .map_err(|err| Error::Config(format!("eventgroup.multicast: {err}")))?;
                        Some((addr, parse_u16(port, "eventgroup.multicast-port")?))
                    }
                    (Some(_), None) | (None, Some(_)) => {
                        return Err(Error::Config(
                            "eventgroup: multicast and multicast-port must come together".into(),
                        ))
                    }
                    (None, None) => None,
                };
                eventgroups.push(EventgroupConfig { eventgroup, events: member_events, multicast });
            }
        }

        // Every configured event must belong to at least one eventgroup of
        // the same service; a groupless event could never be delivered.
        for ev in &events {
            if !eventgroups.iter().any(|g| g.events.contains(ev)) {
                return Err(Error::Config(format!(
                    "service {service:#06x}.{instance:#06x}: event {ev:#06x} is in no eventgroup"
                )));
            }
        }

        Ok(ServiceConfig {
            service,
            instance,
            unicast,
            reliable_port,
            unreliable_port,
            magic_cookies,
            major,
            minor,
            events,
            eventgroups,
        })
    }

    fn load_application(entry: &Value) -> Result<ApplicationConfig> {
        let obj = entry
            .as_object()
            .ok_or_else(|| Error::Config("application: expected object".into()))?;
        let name = parse_str(
            obj.get("name").ok_or_else(|| Error::Config("application: missing name".into()))?,
            "application.name",
        )?
        .to_owned();
        let id = parse_u16(
            obj.get("id").ok_or_else(|| Error::Config("application: missing id".into()))?,
            "application.id",
        )?;
        let num_dispatchers = match obj.get("num-dispatchers") {
            Some(v) => (parse_u64(v, "application.num-dispatchers")? as usize).max(1),
            None => 1,
        };
        Ok(ApplicationConfig { name, id, num_dispatchers })
    }

    fn load_sd(section: Option<&Value>) -> Result<SdConfig> {
        let mut out = SdConfig::default();
        let Some(section) = section else { return Ok(out) };
        let obj = section
            .as_object()
            .ok_or_else(|| Error::Config("service-discovery: expected object".into()))?;

        if let Some(v) = obj.get("enabled").or_else(|| obj.get("enable")) {
            out.enabled = parse_bool(v, "service-discovery.enabled")?;
        }
        if let Some(v) = obj.get("multicast") {
            out.multicast = parse_str(v, "service-discovery.multicast")?
                .parse()
                .map_err(|e| Error::Config(format!("service-discovery.multicast: {e}")))?;
        }
        if let Some(v) = obj.get("port") {
            out.port = parse_u16(v, "service-discovery.port")?;
        }
        if let Some(v) = obj.get("protocol") {
            out.protocol = parse_str(v, "service-discovery.protocol")?.to_owned();
            if out.protocol != "udp" {
                warn!("service-discovery.protocol {:?} unsupported, using udp", out.protocol);
                out.protocol = "udp".into();
            }
        }
        if let Some(v) = obj.get("initial-delay-min") {
            out.initial_delay_min_ms = parse_u64(v, "service-discovery.initial-delay-min")?;
        }
        if let Some(v) = obj.get("initial-delay-max") {
            out.initial_delay_max_ms = parse_u64(v, "service-discovery.initial-delay-max")?;
        }
        if out.initial_delay_min_ms > out.initial_delay_max_ms {
            return Err(Error::Config("service-discovery: initial-delay-min > max".into()));
        }
        if let Some(v) = obj.get("repetitions-base-delay") {
            out.repetitions_base_delay_ms =
                parse_u64(v, "service-discovery.repetitions-base-delay")?;
        }
        if let Some(v) = obj.get("repetitions-max") {
            out.repetitions_max = parse_u8(v, "service-discovery.repetitions-max")?;
        }
        if let Some(v) = obj.get("ttl") {
            out.ttl = parse_u32(v, "service-discovery.ttl")?;
            if out.ttl == 0 {
                return Err(Error::Config("service-discovery.ttl: 0 means stop-offer".into()));
            }
        }
        if let Some(v) = obj.get("cyclic-offer-delay") {
            out.cyclic_offer_delay_ms = parse_u64(v, "service-discovery.cyclic-offer-delay")?;
        }
        if let Some(v) = obj.get("request-response-delay") {
            out.request_response_delay_ms =
                parse_u64(v, "service-discovery.request-response-delay")?;
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // View
    // -------------------------------------------------------------------------

    pub fn unicast_address(&self) -> IpAddr {
        self.unicast
    }

    pub fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    pub fn service(&self, service: ServiceId, instance: InstanceId) -> Option<&ServiceConfig> {
        self.services.get(&(service, instance))
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceConfig> {
        self.services.values()
    }

    /// Services hosted on this node.
    pub fn local_services(&self) -> impl Iterator<Item = &ServiceConfig> {
        self.services.values().filter(move |s| s.unicast == self.unicast)
    }

    /// Services configured with a remote unicast address.
    pub fn remote_services(&self) -> impl Iterator<Item = &ServiceConfig> {
        self.services.values().filter(move |s| s.unicast != self.unicast)
    }

    pub fn reliable_port(&self, service: ServiceId, instance: InstanceId) -> Option<u16> {
        self.service(service, instance).and_then(|s| s.reliable_port)
    }

    pub fn unreliable_port(&self, service: ServiceId, instance: InstanceId) -> Option<u16> {
        self.service(service, instance).and_then(|s| s.unreliable_port)
    }

    pub fn has_enabled_magic_cookies(&self, addr: IpAddr, port: u16) -> bool {
        self.magic_cookies.get(&addr).is_some_and(|ports| ports.contains(&port))
    }

    pub fn routing_host(&self) -> &str {
        &self.routing_host
    }

    /// Routing-host election: the configured host name wins, the
    /// `SOMEIP_ROUTING` environment variable overrides it.
    pub fn is_routing_host(&self, app_name: &str) -> bool {
        if let Ok(elected) = std::env::var(ENV_ROUTING) {
            return elected == app_name;
        }
        self.routing_host == app_name
    }

    pub fn application(&self, name: &str) -> Option<&ApplicationConfig> {
        self.applications.get(name)
    }

    pub fn applications(&self) -> impl Iterator<Item = &ApplicationConfig> {
        self.applications.values()
    }

    pub fn client_id(&self, name: &str) -> Option<ClientId> {
        self.applications.get(name).map(|a| a.id)
    }

    pub fn num_dispatchers(&self, name: &str) -> usize {
        self.applications.get(name).map(|a| a.num_dispatchers).unwrap_or(1)
    }

    pub fn max_message_size_local(&self) -> u32 {
        self.max_message_size_local
    }

    /// Reliable message-size ceiling for `(address, port)`.
    pub fn message_size_reliable(&self, addr: IpAddr, port: u16) -> u32 {
        self.message_sizes
            .get(&(addr, port))
            .copied()
            .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_RELIABLE)
    }

    pub fn sd(&self) -> &SdConfig {
        &self.sd
    }

    pub fn flush_timeout_ms(&self) -> u64 {
        self.flush_timeout_ms
    }

    pub fn connect_timeout_ms(&self) -> u64 {
        self.connect_timeout_ms
    }

    pub fn max_connect_timeout_ms(&self) -> u64 {
        self.max_connect_timeout_ms
    }

    pub fn endpoint_queue_limit(&self) -> usize {
        self.endpoint_queue_limit
    }
}
