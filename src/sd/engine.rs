//! Service Discovery engine.
//!
//! One task owns the dedicated SD socket (UDP, multicast group joined)
//! and every piece of SD state: offer and find phase machines, both
//! subscription directions, reboot tracking, and the per-destination
//! session counters. Commands arrive on a channel; SD frames arrive as
//! endpoint events from the SD socket; everything else is timer-driven.
//!
//! Entries due in the same cycle coalesce into one datagram (entries
//! first, then the shared options), bounded by the SD MTU. Answers to
//! multicast traffic are delayed by a uniform random share of
//! `request_response_delay` to avoid answer storms.

use super::fsm::{FindFsm, OfferFsm, RebootDetector, SessionCounter, Subscriber, SubscriberRegistry};
use super::wire::{Entry, EntryType, L4Proto, SdMessage, SdOption};
use crate::codec::Message;
use crate::config::Config;
use crate::endpoint::{
    Endpoint, EndpointEvent, EndpointId, EndpointManager, EndpointOptions, Peer, Protocol,
    UdpEndpoint,
};
use crate::error::{Error, Result};
use crate::routing::{NotifyTarget, Router};
use crate::types::{
    EventgroupId, InstanceId, ServiceId, MAX_MESSAGE_SIZE_UNRELIABLE, SD_MAX_MESSAGE_SIZE,
    SD_METHOD, SD_SERVICE, SOMEIP_HEADER_SIZE,
};
use rand::Rng;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Floor for the tick timer so expiry sweeps happen even when no phase
/// machine is due.
const MAX_TICK_INTERVAL: Duration = Duration::from_millis(1000);

// =============================================================================
// COMMANDS
// =============================================================================

/// Requests from the routing host into the engine.
#[derive(Debug)]
pub enum SdCommand {
    /// Announce a local service (enters Initial-Wait).
    OfferService { service: ServiceId, instance: InstanceId },
    /// Withdraw a local service (emits a TTL-0 offer).
    StopOfferService { service: ServiceId, instance: InstanceId },
    /// Start finding a remote service.
    RequestService { service: ServiceId, instance: InstanceId },
    /// Subscribe to a remote eventgroup. The ports name the local
    /// endpoints notifications should be delivered to.
    Subscribe {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        reliable_port: Option<u16>,
        unreliable_port: Option<u16>,
    },
    /// Drop a subscription (emits a TTL-0 subscribe).
    Unsubscribe { service: ServiceId, instance: InstanceId, eventgroup: EventgroupId },
    /// Best-effort stop entries, then terminate the task.
    Shutdown,
}

/// Handle held by the routing host.
#[derive(Clone)]
pub struct SdHandle {
    commands: mpsc::Sender<SdCommand>,
    local_addr: SocketAddr,
}

impl SdHandle {
    pub async fn send(&self, command: SdCommand) -> Result<()> {
        self.commands.send(command).await.map_err(|_| Error::NotConnected)
    }

    /// Address of the SD socket (useful when the port was ephemeral).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

// =============================================================================
// INTERNAL STATE
// =============================================================================

/// A remote service learned from an OfferService entry.
#[derive(Debug)]
struct RemoteOffer {
    /// SD source the offer came from (subscribes go back there).
    sd_peer: SocketAddr,
    expires: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionState {
    /// Waiting for an offer (or for an ack after sending).
    Requested,
    /// Acked with a TTL; refreshed at 2/3 of it.
    Acked,
}

/// One of our subscriptions to a remote eventgroup.
#[derive(Debug)]
struct OurSubscription {
    state: SubscriptionState,
    reliable_port: Option<u16>,
    unreliable_port: Option<u16>,
    counter: u8,
    /// Next refresh when acked; cleared while no offer is known.
    refresh_due: Option<Instant>,
}

/// A unicast answer scheduled behind the request-response delay.
#[derive(Debug)]
struct DelayedSend {
    due: Instant,
    target: SocketAddr,
    entries: Vec<Entry>,
}

pub struct SdEngine {
    config: Arc<Config>,
    router: Arc<Router>,
    manager: Arc<EndpointManager>,
    /// Unicast SD socket; all transmissions leave through it.
    unicast: Arc<UdpEndpoint>,
    /// Group-joined socket; kept only to receive multicast SD traffic.
    multicast: Arc<UdpEndpoint>,
    /// Frames from this endpoint arrived on the multicast channel.
    multicast_id: EndpointId,
    sd_events: mpsc::Receiver<EndpointEvent>,
    commands: mpsc::Receiver<SdCommand>,

    multicast_target: SocketAddr,

    offers: HashMap<(ServiceId, InstanceId), OfferFsm>,
    finds: HashMap<(ServiceId, InstanceId), FindFsm>,
    remote_offers: HashMap<(ServiceId, InstanceId), RemoteOffer>,
    our_subs: HashMap<(ServiceId, InstanceId, EventgroupId), OurSubscription>,
    subscribers: SubscriberRegistry,

    reboot: RebootDetector,
    multicast_session: SessionCounter,
    unicast_sessions: HashMap<SocketAddr, SessionCounter>,
    /// Peers that advertised unicast support in their flags.
    peer_unicast: HashMap<IpAddr, bool>,
    delayed: Vec<DelayedSend>,
}

impl SdEngine {
    /// Bind the SD socket, spawn the engine task, return the handle.
    pub fn spawn(
        config: Arc<Config>,
        router: Arc<Router>,
        manager: Arc<EndpointManager>,
    ) -> Result<SdHandle> {
        let sd = config.sd();
        let interface = match config.unicast_address() {
            IpAddr::V4(addr) => addr,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        let (event_tx, sd_events) = mpsc::channel(crate::endpoint::EVENT_CHANNEL_DEPTH);
        let options = EndpointOptions::from_config(&config, MAX_MESSAGE_SIZE_UNRELIABLE);
        // Two sockets share the SD port: the group-joined one receives
        // multicast, the unicast one receives answers addressed to us
        // and carries every transmission. Which socket a frame arrived
        // on is what keys reboot detection per channel.
        let multicast = Arc::new(UdpEndpoint::bind_multicast(
            sd.multicast,
            sd.port,
            interface,
            options.clone(),
            event_tx.clone(),
        )?);
        let unicast = Arc::new(UdpEndpoint::bind_reuse(
            SocketAddr::new(config.unicast_address(), sd.port),
            options,
            event_tx,
        )?);
        let multicast_id = multicast.id();
        let local_addr = unicast.local_addr();
        info!(multicast = %sd.multicast, port = sd.port, %local_addr, "service discovery up");

        let (command_tx, commands) = mpsc::channel(64);
        let multicast_target = SocketAddr::new(IpAddr::V4(sd.multicast), sd.port);

        let engine = Self {
            config,
            router,
            manager,
            unicast,
            multicast,
            multicast_id,
            sd_events,
            commands,
            multicast_target,
            offers: HashMap::new(),
            finds: HashMap::new(),
            remote_offers: HashMap::new(),
            our_subs: HashMap::new(),
            subscribers: SubscriberRegistry::new(),
            reboot: RebootDetector::new(),
            multicast_session: SessionCounter::new(),
            unicast_sessions: HashMap::new(),
            peer_unicast: HashMap::new(),
            delayed: Vec::new(),
        };
        tokio::spawn(engine.run());

        Ok(SdHandle { commands: command_tx, local_addr })
    }

    async fn run(mut self) {
        loop {
            let wakeup = self.next_due().min(Instant::now() + MAX_TICK_INTERVAL);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SdCommand::Shutdown) | None => {
                        self.shutdown();
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },
                event = self.sd_events.recv() => match event {
                    Some(EndpointEvent::Frame { endpoint, peer: Peer::Ip(from), bytes }) => {
                        let via_multicast = endpoint == self.multicast_id;
                        self.handle_frame(from, &bytes, via_multicast);
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wakeup)) => {
                    self.tick(Instant::now());
                }
            }
        }
        debug!("service discovery engine stopped");
    }

    // -------------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------------

    fn next_due(&self) -> Instant {
        let mut due = Instant::now() + MAX_TICK_INTERVAL;
        for fsm in self.offers.values() {
            if let Some(d) = fsm.next_due() {
                due = due.min(d);
            }
        }
        for fsm in self.finds.values() {
            if let Some(d) = fsm.next_due() {
                due = due.min(d);
            }
        }
        for send in &self.delayed {
            due = due.min(send.due);
        }
        for sub in self.our_subs.values() {
            if let Some(d) = sub.refresh_due {
                due = due.min(d);
            }
        }
        for offer in self.remote_offers.values() {
            due = due.min(offer.expires);
        }
        due
    }

    fn tick(&mut self, now: Instant) {
        // Offers and finds due this cycle coalesce into one multicast
        // datagram.
        let mut batch: Vec<Entry> = Vec::new();

        let offered: Vec<_> = self.offers.keys().copied().collect();
        for key in offered {
            if self.offers.get_mut(&key).is_some_and(|fsm| fsm.tick(now)) {
                if let Some(entry) = self.offer_entry(key.0, key.1) {
                    batch.push(entry);
                }
            }
        }
        let finding: Vec<_> = self.finds.keys().copied().collect();
        for key in finding {
            if self.finds.get_mut(&key).is_some_and(|fsm| fsm.tick(now)) {
                batch.push(Entry::find(key.0, key.1, crate::types::ANY_MAJOR, self.config.sd().ttl));
            }
        }
        if !batch.is_empty() {
            self.send_entries(self.multicast_target, batch);
        }

        // Delayed unicast answers.
        let mut due_sends = Vec::new();
        self.delayed.retain(|send| {
            if send.due <= now {
                due_sends.push((send.target, send.entries.clone()));
                false
            } else {
                true
            }
        });
        for (target, entries) in due_sends {
            self.send_entries(target, entries);
        }

        // Subscription refresh at 2/3 of the granted TTL.
        let refresh: Vec<_> = self
            .our_subs
            .iter()
            .filter(|(_, sub)| sub.refresh_due.is_some_and(|d| d <= now))
            .map(|(key, _)| *key)
            .collect();
        for key in refresh {
            self.send_subscribe(key, false);
        }

        // Remote offers whose TTL elapsed without a refresh.
        let expired: Vec<_> = self
            .remote_offers
            .iter()
            .filter(|(_, offer)| offer.expires <= now)
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            info!(
                service = format_args!("{:#06x}", key.0),
                instance = format_args!("{:#06x}", key.1),
                "remote offer expired"
            );
            self.drop_remote_offer(key);
        }

        // Remote subscribers whose TTL elapsed: rebuild fanout targets.
        if self.subscribers.expire(now) > 0 {
            self.push_all_subscriber_targets();
        }
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    fn handle_command(&mut self, command: SdCommand) {
        let now = Instant::now();
        let sd = self.config.sd();
        match command {
            SdCommand::OfferService { service, instance } => {
                let delay = Duration::from_millis(
                    rand::thread_rng()
                        .gen_range(sd.initial_delay_min_ms..=sd.initial_delay_max_ms),
                );
                self.offers.insert((service, instance), OfferFsm::new(now, delay, sd));
                debug!(
                    service = format_args!("{service:#06x}"),
                    instance = format_args!("{instance:#06x}"),
                    initial_delay_ms = delay.as_millis() as u64,
                    "offering service"
                );
            }
            SdCommand::StopOfferService { service, instance } => {
                if let Some(mut fsm) = self.offers.remove(&(service, instance)) {
                    fsm.stop();
                    if let Some(mut entry) = self.offer_entry(service, instance) {
                        entry.ttl = 0;
                        self.send_entries(self.multicast_target, vec![entry]);
                    }
                }
            }
            SdCommand::RequestService { service, instance } => {
                if self.remote_offers.contains_key(&(service, instance)) {
                    return;
                }
                let delay = Duration::from_millis(
                    rand::thread_rng()
                        .gen_range(sd.initial_delay_min_ms..=sd.initial_delay_max_ms),
                );
                self.finds.insert((service, instance), FindFsm::new(now, delay, sd));
            }
            SdCommand::Subscribe { service, instance, eventgroup, reliable_port, unreliable_port } => {
                let counter = (self.our_subs.len() & 0x0F) as u8;
                self.our_subs.insert(
                    (service, instance, eventgroup),
                    OurSubscription {
                        state: SubscriptionState::Requested,
                        reliable_port,
                        unreliable_port,
                        counter,
                        refresh_due: None,
                    },
                );
                // Subscribe immediately when the offer is already known;
                // otherwise the next offer triggers it.
                if self.remote_offers.contains_key(&(service, instance)) {
                    self.send_subscribe((service, instance, eventgroup), false);
                } else {
                    self.handle_command(SdCommand::RequestService { service, instance });
                }
            }
            SdCommand::Unsubscribe { service, instance, eventgroup } => {
                if self.our_subs.remove(&(service, instance, eventgroup)).is_some() {
                    self.send_subscribe_stop((service, instance, eventgroup));
                }
            }
            SdCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    // -------------------------------------------------------------------------
    // Incoming SD traffic
    // -------------------------------------------------------------------------

    fn handle_frame(&mut self, from: SocketAddr, bytes: &[u8], via_multicast: bool) {
        let message = match Message::decode(bytes, MAX_MESSAGE_SIZE_UNRELIABLE as usize) {
            Ok(m) => m,
            Err(e) => {
                warn!(%from, error = %e, "dropping undecodable sd frame");
                return;
            }
        };
        if message.service != SD_SERVICE || message.method != SD_METHOD {
            trace!(%from, "non-sd frame on sd socket, ignoring");
            return;
        }
        // Our own multicast transmissions loop back; drop them.
        if from.ip() == self.config.unicast_address() {
            return;
        }
        let sd_message = match SdMessage::decode(&message.payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(%from, error = %e, "dropping malformed sd body");
                return;
            }
        };

        // Reboot detection per (sender, channel): peers run separate
        // session counters for multicast and unicast, so the channels
        // must not share detector state.
        if self.reboot.check(from.ip(), via_multicast, sd_message.reboot, message.session) {
            info!(peer = %from.ip(), "peer reboot detected, invalidating its state");
            self.invalidate_peer(from.ip());
        }
        self.peer_unicast.insert(from.ip(), sd_message.unicast);

        for entry in sd_message.entries {
            match entry.entry_type {
                EntryType::OfferService => self.handle_offer(from, &entry),
                EntryType::FindService => self.handle_find(from, &entry),
                EntryType::SubscribeEventgroup => self.handle_subscribe(from, &entry),
                EntryType::SubscribeEventgroupAck => self.handle_subscribe_ack(from, &entry),
            }
        }
    }

    fn handle_offer(&mut self, from: SocketAddr, entry: &Entry) {
        let key = (entry.service, entry.instance);
        if entry.is_stop_offer() {
            if self.remote_offers.contains_key(&key) {
                info!(
                    service = format_args!("{:#06x}", key.0),
                    instance = format_args!("{:#06x}", key.1),
                    "remote service stopped"
                );
                self.drop_remote_offer(key);
            }
            return;
        }

        let mut reliable = None;
        let mut unreliable = None;
        for option in &entry.options {
            match option {
                SdOption::Ipv4Endpoint { addr, l4: L4Proto::Tcp, port } => {
                    reliable = Some(SocketAddr::new(IpAddr::V4(*addr), *port));
                }
                SdOption::Ipv4Endpoint { addr, l4: L4Proto::Udp, port } => {
                    unreliable = Some(SocketAddr::new(IpAddr::V4(*addr), *port));
                }
                SdOption::Ipv6Endpoint { addr, l4: L4Proto::Tcp, port } => {
                    reliable = Some(SocketAddr::new(IpAddr::V6(*addr), *port));
                }
                SdOption::Ipv6Endpoint { addr, l4: L4Proto::Udp, port } => {
                    unreliable = Some(SocketAddr::new(IpAddr::V6(*addr), *port));
                }
                _ => {}
            }
        }
        if reliable.is_none() && unreliable.is_none() {
            warn!(%from, "offer without endpoint options, ignoring");
            return;
        }

        let expires = Instant::now() + Duration::from_secs(u64::from(entry.ttl));
        let fresh = self
            .remote_offers
            .insert(key, RemoteOffer { sd_peer: from, expires })
            .is_none();
        if fresh {
            info!(
                service = format_args!("{:#06x}", key.0),
                instance = format_args!("{:#06x}", key.1),
                peer = %from,
                ttl = entry.ttl,
                "remote service offered"
            );
            if let Err(e) = self.router.set_remote_service(key.0, key.1, reliable, unreliable) {
                warn!(error = %e, "failed to record remote service");
            }
        }

        // A matching offer terminates finding.
        if let Some(find) = self.finds.get_mut(&key) {
            find.offer_received();
        }

        // Local interest turns into subscribes.
        let interested: Vec<_> = self
            .our_subs
            .iter()
            .filter(|((service, instance, _), sub)| {
                (*service, *instance) == key && sub.state == SubscriptionState::Requested
            })
            .map(|(sub_key, _)| *sub_key)
            .collect();
        for sub_key in interested {
            self.send_subscribe(sub_key, true);
        }
    }

    fn handle_find(&mut self, from: SocketAddr, entry: &Entry) {
        let key = (entry.service, entry.instance);
        if !self.offers.contains_key(&key) {
            return;
        }
        let Some(offer) = self.offer_entry(key.0, key.1) else { return };
        // Answer unicast when the finder supports it, after a random
        // share of the request-response delay.
        let target = if self.peer_unicast.get(&from.ip()).copied().unwrap_or(false) {
            from
        } else {
            self.multicast_target
        };
        let delay_ms = self.config.sd().request_response_delay_ms;
        let jitter = if delay_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=delay_ms))
        };
        trace!(%from, service = format_args!("{:#06x}", key.0), delay_ms = jitter.as_millis() as u64,
            "answering find");
        self.delayed.push(DelayedSend { due: Instant::now() + jitter, target, entries: vec![offer] });
    }

    fn handle_subscribe(&mut self, from: SocketAddr, entry: &Entry) {
        let Some(eventgroup) = entry.eventgroup() else { return };
        let key = (entry.service, entry.instance, eventgroup);
        let counter = match entry.payload {
            super::wire::EntryPayload::Eventgroup { counter, .. } => counter,
            super::wire::EntryPayload::Service { .. } => 0,
        };

        if entry.is_stop_subscribe() {
            if self.subscribers.remove(key, from.ip(), counter) {
                self.push_subscriber_targets(key);
            }
            return;
        }

        // Validate: we must offer the service and know the eventgroup.
        let service_config = self.config.service(entry.service, entry.instance);
        let known_group = service_config
            .map(|s| s.eventgroups.iter().any(|g| g.eventgroup == eventgroup))
            .unwrap_or(false);
        if !self.offers.contains_key(&(entry.service, entry.instance)) || !known_group {
            debug!(%from, eventgroup = format_args!("{eventgroup:#06x}"), "nacking subscribe");
            let nack = Entry::subscribe_ack(entry.service, entry.instance, entry.major, eventgroup, counter, 0);
            self.send_entries(from, vec![nack]);
            return;
        }

        let mut reliable = None;
        let mut unreliable = None;
        for option in &entry.options {
            match option {
                SdOption::Ipv4Endpoint { addr, l4: L4Proto::Tcp, port } => {
                    reliable = Some(SocketAddr::new(IpAddr::V4(*addr), *port));
                }
                SdOption::Ipv4Endpoint { addr, l4: L4Proto::Udp, port } => {
                    unreliable = Some(SocketAddr::new(IpAddr::V4(*addr), *port));
                }
                _ => {}
            }
        }

        let now = Instant::now();
        let ttl = entry.ttl;
        self.subscribers.upsert(
            key,
            Subscriber { peer: from.ip(), counter, reliable, unreliable, expires: now },
            ttl,
            now,
        );
        debug!(%from, service = format_args!("{:#06x}", entry.service),
            eventgroup = format_args!("{eventgroup:#06x}"), ttl, "subscriber added");
        let multicast_group = service_config
            .and_then(|s| s.eventgroups.iter().find(|g| g.eventgroup == eventgroup))
            .and_then(|g| g.multicast);
        self.push_subscriber_targets(key);

        // Ack, granting the requested TTL; multicast eventgroups carry
        // the group address so the subscriber can join it.
        let mut ack =
            Entry::subscribe_ack(entry.service, entry.instance, entry.major, eventgroup, counter, ttl);
        if let Some(group) = multicast_group {
            ack = ack.with_options(vec![SdOption::ipv4_multicast(group.0, group.1)]);
        }
        self.send_entries(from, vec![ack]);
    }

    fn handle_subscribe_ack(&mut self, from: SocketAddr, entry: &Entry) {
        let Some(eventgroup) = entry.eventgroup() else { return };
        let key = (entry.service, entry.instance, eventgroup);
        let Some(sub) = self.our_subs.get_mut(&key) else { return };

        if entry.is_nack() {
            warn!(%from, service = format_args!("{:#06x}", entry.service),
                eventgroup = format_args!("{eventgroup:#06x}"), "subscription nacked");
            sub.state = SubscriptionState::Requested;
            sub.refresh_due = None;
            return;
        }

        sub.state = SubscriptionState::Acked;
        // Refresh at two thirds of the granted TTL.
        let refresh = Duration::from_secs(u64::from(entry.ttl)) * 2 / 3;
        sub.refresh_due = Some(Instant::now() + refresh);
        trace!(%from, eventgroup = format_args!("{eventgroup:#06x}"), ttl = entry.ttl, "subscription acked");

        // Multicast eventgroup: join the announced group so its
        // notifications reach the routing host like any other frames.
        for option in &entry.options {
            if let SdOption::Ipv4Multicast { addr, port } = option {
                debug!(group = %addr, port, "eventgroup uses multicast delivery");
                let options =
                    EndpointOptions::from_config(&self.config, MAX_MESSAGE_SIZE_UNRELIABLE);
                let interface = match self.config.unicast_address() {
                    IpAddr::V4(v4) => v4,
                    IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
                };
                if let Err(e) = self.manager.multicast_server(*addr, *port, interface, options) {
                    warn!(group = %addr, port, error = %e, "failed to join eventgroup multicast");
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Emission
    // -------------------------------------------------------------------------

    /// Our OfferService entry with endpoint options from configuration.
    fn offer_entry(&self, service: ServiceId, instance: InstanceId) -> Option<Entry> {
        let config = self.config.service(service, instance)?;
        let mut options = Vec::new();
        match self.config.unicast_address() {
            IpAddr::V4(addr) => {
                if let Some(port) = config.reliable_port {
                    options.push(SdOption::ipv4(addr, L4Proto::Tcp, port));
                }
                if let Some(port) = config.unreliable_port {
                    options.push(SdOption::ipv4(addr, L4Proto::Udp, port));
                }
            }
            IpAddr::V6(addr) => {
                if let Some(port) = config.reliable_port {
                    options.push(SdOption::Ipv6Endpoint { addr, l4: L4Proto::Tcp, port });
                }
                if let Some(port) = config.unreliable_port {
                    options.push(SdOption::Ipv6Endpoint { addr, l4: L4Proto::Udp, port });
                }
            }
        }
        Some(
            Entry::offer(service, instance, config.major, config.minor, self.config.sd().ttl)
                .with_options(options),
        )
    }

    fn send_subscribe(&mut self, key: (ServiceId, InstanceId, EventgroupId), initial: bool) {
        let Some(offer) = self.remote_offers.get(&(key.0, key.1)) else { return };
        let target = offer.sd_peer;
        let Some(major) = self.config.service(key.0, key.1).map(|s| s.major) else { return };
        let ttl = self.config.sd().ttl;
        let retry = Duration::from_millis(self.config.sd().cyclic_offer_delay_ms);
        let unicast = match self.config.unicast_address() {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        };

        let Some(sub) = self.our_subs.get_mut(&key) else { return };
        let mut options = Vec::new();
        if let Some(addr) = unicast {
            if let Some(port) = sub.reliable_port {
                options.push(SdOption::ipv4(addr, L4Proto::Tcp, port));
            }
            if let Some(port) = sub.unreliable_port {
                options.push(SdOption::ipv4(addr, L4Proto::Udp, port));
            }
        }
        let entry =
            Entry::subscribe(key.0, key.1, major, key.2, sub.counter, ttl).with_options(options);
        // Always re-arm: retries run on the cyclic cadence until an ack
        // moves the schedule to 2/3 of the granted TTL. Leaving a past
        // deadline in place would fire this path on every loop turn.
        sub.refresh_due = Some(Instant::now() + retry);
        if initial {
            trace!(service = format_args!("{:#06x}", key.0),
                eventgroup = format_args!("{:#06x}", key.2), %target, "subscribing");
        }
        self.send_entries(target, vec![entry]);
    }

    fn send_subscribe_stop(&mut self, key: (ServiceId, InstanceId, EventgroupId)) {
        let Some(offer) = self.remote_offers.get(&(key.0, key.1)) else { return };
        let target = offer.sd_peer;
        let Some(service) = self.config.service(key.0, key.1) else { return };
        let entry = Entry::subscribe(key.0, key.1, service.major, key.2, 0, 0);
        self.send_entries(target, vec![entry]);
    }

    /// Coalesce entries into datagrams bounded by the SD MTU and send.
    fn send_entries(&mut self, target: SocketAddr, entries: Vec<Entry>) {
        let mut message = SdMessage::new(false, true);
        for entry in entries {
            message.entries.push(entry);
            let encoded = message.encode().len() + SOMEIP_HEADER_SIZE;
            if encoded > SD_MAX_MESSAGE_SIZE {
                // The last entry tipped it over the MTU; flush without
                // it and start the next datagram with it.
                let overflow = message.entries.pop().expect("just pushed");
                self.transmit(target, &mut message);
                message.entries.push(overflow);
            }
        }
        if !message.entries.is_empty() {
            self.transmit(target, &mut message);
        }
    }

    fn transmit(&mut self, target: SocketAddr, message: &mut SdMessage) {
        let counter = if target == self.multicast_target {
            &mut self.multicast_session
        } else {
            self.unicast_sessions.entry(target).or_default()
        };
        let (session, reboot) = counter.next();
        message.reboot = reboot;
        let wire = message.to_someip(session).encode();
        if let Err(e) = self.unicast.send_to(Peer::Ip(target), &wire, true) {
            warn!(%target, error = %e, "failed to send sd message");
        }
        message.entries.clear();
    }

    // -------------------------------------------------------------------------
    // State maintenance
    // -------------------------------------------------------------------------

    fn drop_remote_offer(&mut self, key: (ServiceId, InstanceId)) {
        self.remote_offers.remove(&key);
        self.router.remove_remote_service(key.0, key.1);
        // Subscriptions to that service fall back to waiting for the
        // next offer.
        for (sub_key, sub) in self.our_subs.iter_mut() {
            if (sub_key.0, sub_key.1) == key {
                sub.state = SubscriptionState::Requested;
                sub.refresh_due = None;
            }
        }
    }

    fn invalidate_peer(&mut self, peer: IpAddr) {
        let offered: Vec<_> = self
            .remote_offers
            .iter()
            .filter(|(_, offer)| offer.sd_peer.ip() == peer)
            .map(|(key, _)| *key)
            .collect();
        for key in offered {
            self.drop_remote_offer(key);
        }
        if self.subscribers.invalidate_peer(peer) > 0 {
            self.push_all_subscriber_targets();
        }
        self.reboot.forget(peer);
    }

    /// Rebuild the fanout target list of one eventgroup and hand it to
    /// the routing core.
    fn push_subscriber_targets(&mut self, key: (ServiceId, InstanceId, EventgroupId)) {
        let mut targets = Vec::new();
        let multicast = self
            .config
            .service(key.0, key.1)
            .and_then(|s| s.eventgroups.iter().find(|g| g.eventgroup == key.2))
            .and_then(|g| g.multicast);

        let mut multicast_needed = false;
        for subscriber in self.subscribers.subscribers(key) {
            match (subscriber.reliable, subscriber.unreliable) {
                (Some(addr), _) => {
                    let size = self.config.message_size_reliable(addr.ip(), addr.port());
                    let options = EndpointOptions::from_config(&self.config, size)
                        .with_magic_cookies(
                            self.config.has_enabled_magic_cookies(addr.ip(), addr.port()),
                        );
                    match self.manager.client(Protocol::Tcp, addr, options) {
                        Ok(endpoint) => targets.push(NotifyTarget::Reliable(addr, endpoint)),
                        Err(e) => warn!(%addr, error = %e, "no reliable path to subscriber"),
                    }
                }
                (None, Some(addr)) => {
                    let options =
                        EndpointOptions::from_config(&self.config, MAX_MESSAGE_SIZE_UNRELIABLE);
                    match self.manager.client(Protocol::Udp, addr, options) {
                        Ok(endpoint) => targets.push(NotifyTarget::Unreliable(addr, endpoint)),
                        Err(e) => warn!(%addr, error = %e, "no unreliable path to subscriber"),
                    }
                }
                // No endpoint options: the subscriber listens on the
                // eventgroup multicast address.
                (None, None) => multicast_needed = true,
            }
        }
        if multicast_needed {
            if let Some((group, port)) = multicast {
                let addr = SocketAddr::new(IpAddr::V4(group), port);
                let options =
                    EndpointOptions::from_config(&self.config, MAX_MESSAGE_SIZE_UNRELIABLE);
                match self.manager.client(Protocol::Udp, addr, options) {
                    Ok(endpoint) => targets.push(NotifyTarget::Multicast(addr, endpoint)),
                    Err(e) => warn!(%addr, error = %e, "no multicast path for eventgroup"),
                }
            }
        }
        self.router.set_subscribers(key.0, key.1, key.2, targets);
    }

    fn push_all_subscriber_targets(&mut self) {
        let keys: Vec<_> = self.subscribers.snapshot().keys().copied().collect();
        for key in keys {
            self.push_subscriber_targets(key);
        }
        // Groups that just lost their last subscriber need clearing too;
        // snapshot() no longer lists them, so sweep the router's view of
        // everything we ever offered.
        for (service, instance) in self.offers.keys() {
            if let Some(config) = self.config.service(*service, *instance) {
                for group in &config.eventgroups {
                    let key = (*service, *instance, group.eventgroup);
                    if self.subscribers.subscribers(key).next().is_none() {
                        self.router.set_subscribers(key.0, key.1, key.2, Vec::new());
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Best-effort StopOffer/StopSubscribe before the socket closes.
    fn shutdown(&mut self) {
        info!("service discovery shutting down");
        let mut stops = Vec::new();
        let offered: Vec<_> = self.offers.keys().copied().collect();
        for (service, instance) in offered {
            if let Some(mut entry) = self.offer_entry(service, instance) {
                entry.ttl = 0;
                stops.push(entry);
            }
        }
        if !stops.is_empty() {
            self.send_entries(self.multicast_target, stops);
        }
        let subscribed: Vec<_> = self.our_subs.keys().copied().collect();
        for key in subscribed {
            self.send_subscribe_stop(key);
        }
        self.unicast.stop();
        self.multicast.stop();
    }
}
