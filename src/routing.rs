//! Routing core: maps (service, instance, method) to local application
//! mailboxes or remote endpoints, correlates responses, and fans
//! notifications out to eventgroup subscribers.
//!
//! The dispatch path reads an immutable snapshot of the routing tables:
//! readers clone an `Arc` under a briefly-held read lock, writers (SD
//! engine, configuration load, registration) rebuild the tables and
//! swap the `Arc` under the write half. Per-client mailboxes are
//! bounded FIFO channels, so a slow application delays only itself.
//!
//! Ordering: a given (source client, service, instance) always resolves
//! to the same endpoint, and endpoint send queues are FIFO, so two
//! sends from one producer to one service arrive in submission order.

use crate::codec::Message;
use crate::config::Config;
use crate::endpoint::{Endpoint, EndpointManager, EndpointOptions, Peer, Protocol};
use crate::error::{Error, Result};
use crate::types::{
    is_event, ClientId, EventgroupId, InstanceId, ServiceId, SessionId,
    MAX_MESSAGE_SIZE_UNRELIABLE,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Depth of each per-client mailbox.
pub const MAILBOX_DEPTH: usize = 256;

/// Dropped messages with no route, visible to diagnostics.
pub static UNKNOWN_ROUTE_COUNT: AtomicU64 = AtomicU64::new(0);

// =============================================================================
// TABLE MODEL
// =============================================================================

/// A message delivered into a local application mailbox.
#[derive(Debug)]
pub struct RoutedMessage {
    pub instance: InstanceId,
    pub message: Message,
}

/// Where a remote service can be reached.
#[derive(Clone, Default)]
pub struct RemoteService {
    pub reliable: Option<(SocketAddr, Weak<dyn Endpoint>)>,
    pub unreliable: Option<(SocketAddr, Weak<dyn Endpoint>)>,
}

/// One target of a notification fanout.
#[derive(Clone)]
pub enum NotifyTarget {
    /// Unicast over the subscriber's reliable endpoint.
    Reliable(SocketAddr, Weak<dyn Endpoint>),
    /// Unicast over the subscriber's unreliable endpoint.
    Unreliable(SocketAddr, Weak<dyn Endpoint>),
    /// One datagram to the eventgroup multicast address.
    Multicast(SocketAddr, Weak<dyn Endpoint>),
    /// In-process subscriber.
    Local(ClientId),
}

#[derive(Clone, Default)]
struct Tables {
    /// Locally provided services and the client owning each.
    local_services: HashMap<(ServiceId, InstanceId), ClientId>,
    /// Remote services learned from SD or static configuration.
    remote_services: HashMap<(ServiceId, InstanceId), RemoteService>,
    /// Fanout targets per eventgroup (remote subscribers, multicast).
    subscribers: HashMap<(ServiceId, InstanceId, EventgroupId), Vec<NotifyTarget>>,
    /// Local applications subscribed per eventgroup.
    local_subscribers: HashMap<(ServiceId, InstanceId, EventgroupId), HashSet<ClientId>>,
}

/// Where a response to an in-flight request must go.
enum ReplyPath {
    Local(ClientId),
    Remote { endpoint: Weak<dyn Endpoint>, peer: Peer },
}

/// Origin of a routed message.
pub enum Origin {
    /// In-process application.
    Local,
    /// Arrived over an endpoint; kept for the reply path.
    Remote { endpoint: Weak<dyn Endpoint>, peer: Peer },
}

// =============================================================================
// ROUTER
// =============================================================================

pub struct Router {
    config: Arc<Config>,
    manager: Arc<EndpointManager>,
    snapshot: RwLock<Arc<Tables>>,
    /// Serializes writers; readers only touch `snapshot`.
    write_gate: Mutex<()>,
    mailboxes: RwLock<HashMap<ClientId, mpsc::Sender<RoutedMessage>>>,
    pending: Mutex<HashMap<(ClientId, SessionId), ((ServiceId, InstanceId), ReplyPath)>>,
}

impl Router {
    pub fn new(config: Arc<Config>, manager: Arc<EndpointManager>) -> Self {
        Self {
            config,
            manager,
            snapshot: RwLock::new(Arc::new(Tables::default())),
            write_gate: Mutex::new(()),
            mailboxes: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn tables(&self) -> Arc<Tables> {
        Arc::clone(&self.snapshot.read().unwrap())
    }

    fn update_tables(&self, mutate: impl FnOnce(&mut Tables)) {
        let _gate = self.write_gate.lock().unwrap();
        let mut tables = (*self.tables()).clone();
        mutate(&mut tables);
        *self.snapshot.write().unwrap() = Arc::new(tables);
    }

    // -------------------------------------------------------------------------
    // Registration (writers)
    // -------------------------------------------------------------------------

    /// Register a local application and get its FIFO mailbox.
    pub fn register_client(&self, client: ClientId) -> mpsc::Receiver<RoutedMessage> {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        self.mailboxes.write().unwrap().insert(client, tx);
        debug!(client = format_args!("{client:#06x}"), "registered local client");
        rx
    }

    /// Drop a local application: its mailbox, provided services,
    /// subscriptions, and pending replies.
    pub fn deregister_client(&self, client: ClientId) {
        self.mailboxes.write().unwrap().remove(&client);
        self.update_tables(|tables| {
            tables.local_services.retain(|_, owner| *owner != client);
            for subscribers in tables.local_subscribers.values_mut() {
                subscribers.remove(&client);
            }
        });
        self.pending.lock().unwrap().retain(|(owner, _), _| *owner != client);
        debug!(client = format_args!("{client:#06x}"), "deregistered local client");
    }

    /// A local application offers a service instance.
    pub fn offer_service(&self, service: ServiceId, instance: InstanceId, client: ClientId) {
        self.update_tables(|tables| {
            tables.local_services.insert((service, instance), client);
        });
    }

    pub fn stop_offer_service(&self, service: ServiceId, instance: InstanceId) {
        self.update_tables(|tables| {
            tables.local_services.remove(&(service, instance));
        });
    }

    /// Locally provided service instances (for SD announcement).
    pub fn local_services(&self) -> Vec<(ServiceId, InstanceId)> {
        self.tables().local_services.keys().copied().collect()
    }

    /// Record a reachable remote service, creating (or sharing) its
    /// endpoints through the manager. Called by the SD engine on
    /// OfferService and by static remote configuration.
    pub fn set_remote_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        reliable: Option<SocketAddr>,
        unreliable: Option<SocketAddr>,
    ) -> Result<()> {
        let mut remote = RemoteService::default();
        if let Some(addr) = reliable {
            let size = self.config.message_size_reliable(addr.ip(), addr.port());
            let options = EndpointOptions::from_config(&self.config, size).with_magic_cookies(
                self.config.has_enabled_magic_cookies(addr.ip(), addr.port()),
            );
            let endpoint = self.manager.client(Protocol::Tcp, addr, options)?;
            remote.reliable = Some((addr, endpoint));
        }
        if let Some(addr) = unreliable {
            let options =
                EndpointOptions::from_config(&self.config, MAX_MESSAGE_SIZE_UNRELIABLE);
            let endpoint = self.manager.client(Protocol::Udp, addr, options)?;
            remote.unreliable = Some((addr, endpoint));
        }
        debug!(
            service = format_args!("{service:#06x}"),
            instance = format_args!("{instance:#06x}"),
            ?reliable,
            ?unreliable,
            "remote service reachable"
        );
        self.update_tables(|tables| {
            tables.remote_services.insert((service, instance), remote);
        });
        Ok(())
    }

    /// Forget a remote service (StopOffer, TTL elapse, peer reboot).
    pub fn remove_remote_service(&self, service: ServiceId, instance: InstanceId) {
        self.update_tables(|tables| {
            tables.remote_services.remove(&(service, instance));
        });
    }

    pub fn has_remote_service(&self, service: ServiceId, instance: InstanceId) -> bool {
        self.tables().remote_services.contains_key(&(service, instance))
    }

    /// Replace the fanout targets of one eventgroup. The SD engine
    /// pushes a fresh target list whenever subscriptions change.
    pub fn set_subscribers(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        targets: Vec<NotifyTarget>,
    ) {
        self.update_tables(|tables| {
            if targets.is_empty() {
                tables.subscribers.remove(&(service, instance, eventgroup));
            } else {
                tables.subscribers.insert((service, instance, eventgroup), targets);
            }
        });
    }

    /// A local application subscribes to an eventgroup.
    pub fn subscribe_local(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) {
        self.update_tables(|tables| {
            tables
                .local_subscribers
                .entry((service, instance, eventgroup))
                .or_default()
                .insert(client);
        });
    }

    pub fn unsubscribe_local(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) {
        self.update_tables(|tables| {
            if let Some(subscribers) =
                tables.local_subscribers.get_mut(&(service, instance, eventgroup))
            {
                subscribers.remove(&client);
            }
        });
    }

    /// Eventgroups a local application wants from a remote service;
    /// the SD engine turns these into SubscribeEventgroup entries.
    pub fn local_subscriptions(&self) -> Vec<(ServiceId, InstanceId, EventgroupId)> {
        self.tables().local_subscribers.keys().copied().collect()
    }

    // -------------------------------------------------------------------------
    // Dispatch (readers)
    // -------------------------------------------------------------------------

    /// Route one message. `flush` is passed through to the endpoint
    /// send path so applications can batch.
    pub fn route(
        &self,
        message: Message,
        instance: InstanceId,
        origin: Origin,
        flush: bool,
    ) -> Result<()> {
        if message.message_type.is_request() {
            self.route_request(message, instance, origin, flush)
        } else if message.message_type.is_response() {
            self.route_response(message, instance)
        } else {
            self.route_notification(message, instance, flush)
        }
    }

    fn route_request(
        &self,
        message: Message,
        instance: InstanceId,
        origin: Origin,
        flush: bool,
    ) -> Result<()> {
        let tables = self.tables();
        let key = (message.service, instance);

        if let Some(&owner) = tables.local_services.get(&key) {
            self.check_local_size(&message)?;
            let correlation = (message.client, message.session);
            if !message.message_type.is_request_no_return() {
                let reply = match origin {
                    Origin::Local => ReplyPath::Local(message.client),
                    Origin::Remote { endpoint, peer } => ReplyPath::Remote { endpoint, peer },
                };
                self.pending.lock().unwrap().insert(correlation, (key, reply));
            }
            let delivered = self.deliver_local(owner, instance, message);
            if delivered.is_err() {
                self.pending.lock().unwrap().remove(&correlation);
            }
            return delivered;
        }

        if let Some(remote) = tables.remote_services.get(&key) {
            // Requests ride the reliable endpoint unless the service
            // only offers an unreliable one.
            let expects_response = !message.message_type.is_request_no_return();
            let (client, session) = (message.client, message.session);
            self.send_remote(remote, &message, true, flush)?;
            if expects_response {
                self.pending
                    .lock()
                    .unwrap()
                    .insert((client, session), (key, ReplyPath::Local(client)));
            }
            return Ok(());
        }

        self.unknown_route(&message, instance)
    }

    fn route_response(&self, message: Message, instance: InstanceId) -> Result<()> {
        let pending = self.pending.lock().unwrap().remove(&(message.client, message.session));
        let Some((key, reply)) = pending else {
            UNKNOWN_ROUTE_COUNT.fetch_add(1, Ordering::Relaxed);
            warn!(
                client = format_args!("{:#06x}", message.client),
                session = format_args!("{:#06x}", message.session),
                "response for unknown request, dropping"
            );
            return Err(Error::UnknownRoute { service: message.service, instance });
        };
        match reply {
            ReplyPath::Local(client) => self.deliver_local(client, key.1, message),
            ReplyPath::Remote { endpoint, peer } => {
                let Some(endpoint) = endpoint.upgrade() else {
                    return Err(Error::NotConnected);
                };
                endpoint.send_to(peer, &message.encode(), true)
            }
        }
    }

    fn route_notification(
        &self,
        message: Message,
        instance: InstanceId,
        flush: bool,
    ) -> Result<()> {
        if !is_event(message.method) {
            return Err(Error::Malformed("notification without event id"));
        }
        let tables = self.tables();
        let service = message.service;
        let Some(config) = self.config.service(service, instance) else {
            return self.unknown_route(&message, instance);
        };

        let wire = message.encode();
        let mut delivered = 0usize;
        let mut sent_unicast: HashSet<SocketAddr> = HashSet::new();
        let mut sent_multicast: HashSet<SocketAddr> = HashSet::new();
        let mut sent_local: HashSet<ClientId> = HashSet::new();

        for group in config.groups_of(message.method) {
            let key = (service, instance, group.eventgroup);

            // One slow or dead subscriber must not starve the rest of
            // the fanout; per-target failures are logged and skipped.
            for target in tables.subscribers.get(&key).into_iter().flatten() {
                match target {
                    NotifyTarget::Reliable(addr, endpoint)
                    | NotifyTarget::Unreliable(addr, endpoint) => {
                        if !sent_unicast.insert(*addr) {
                            continue;
                        }
                        if let Some(endpoint) = endpoint.upgrade() {
                            match endpoint.send(&wire, flush) {
                                Ok(()) => delivered += 1,
                                Err(e) => warn!(%addr, error = %e, "notify failed"),
                            }
                        }
                    }
                    NotifyTarget::Multicast(addr, endpoint) => {
                        // Once per multicast group regardless of how
                        // many subscribers listen there.
                        if !sent_multicast.insert(*addr) {
                            continue;
                        }
                        if let Some(endpoint) = endpoint.upgrade() {
                            match endpoint.send(&wire, flush) {
                                Ok(()) => delivered += 1,
                                Err(e) => warn!(group = %addr, error = %e, "multicast notify failed"),
                            }
                        }
                    }
                    NotifyTarget::Local(client) => {
                        if !sent_local.insert(*client) {
                            continue;
                        }
                        match self.deliver_local(*client, instance, message.clone()) {
                            Ok(()) => delivered += 1,
                            Err(e) => warn!(
                                client = format_args!("{client:#06x}"),
                                error = %e,
                                "local notify failed"
                            ),
                        }
                    }
                }
            }

            for client in tables.local_subscribers.get(&key).into_iter().flatten() {
                if sent_local.insert(*client) {
                    match self.deliver_local(*client, instance, message.clone()) {
                        Ok(()) => delivered += 1,
                        Err(e) => warn!(
                            client = format_args!("{client:#06x}"),
                            error = %e,
                            "local notify failed"
                        ),
                    }
                }
            }
        }

        trace!(
            service = format_args!("{service:#06x}"),
            event = format_args!("{:#06x}", message.method),
            delivered,
            "notification fanout"
        );
        Ok(())
    }

    fn deliver_local(
        &self,
        client: ClientId,
        instance: InstanceId,
        message: Message,
    ) -> Result<()> {
        let mailbox = {
            let mailboxes = self.mailboxes.read().unwrap();
            mailboxes.get(&client).cloned()
        };
        let Some(mailbox) = mailbox else {
            UNKNOWN_ROUTE_COUNT.fetch_add(1, Ordering::Relaxed);
            warn!(client = format_args!("{client:#06x}"), "no mailbox for client, dropping");
            return Err(Error::UnknownRoute { service: message.service, instance });
        };
        mailbox
            .try_send(RoutedMessage { instance, message })
            .map_err(|_| Error::QueueFull(MAILBOX_DEPTH))
    }

    fn send_remote(
        &self,
        remote: &RemoteService,
        message: &Message,
        prefer_reliable: bool,
        flush: bool,
    ) -> Result<()> {
        let (reliable, unreliable) = (&remote.reliable, &remote.unreliable);
        let choice = if prefer_reliable {
            reliable.as_ref().or(unreliable.as_ref())
        } else {
            unreliable.as_ref().or(reliable.as_ref())
        };
        let Some((addr, endpoint)) = choice else {
            return Err(Error::NotConnected);
        };

        let is_reliable = reliable.as_ref().is_some_and(|(a, _)| a == addr);
        let limit = if is_reliable {
            self.config.message_size_reliable(addr.ip(), addr.port()) as usize
        } else {
            MAX_MESSAGE_SIZE_UNRELIABLE as usize
        };
        if message.wire_size() > limit {
            return Err(Error::MessageTooLarge { size: message.wire_size(), limit });
        }

        let Some(endpoint) = endpoint.upgrade() else {
            return Err(Error::NotConnected);
        };
        endpoint.send(&message.encode(), flush)
    }

    fn check_local_size(&self, message: &Message) -> Result<()> {
        let limit = self.config.max_message_size_local() as usize;
        if message.wire_size() > limit {
            return Err(Error::MessageTooLarge { size: message.wire_size(), limit });
        }
        Ok(())
    }

    fn unknown_route(&self, message: &Message, instance: InstanceId) -> Result<()> {
        UNKNOWN_ROUTE_COUNT.fetch_add(1, Ordering::Relaxed);
        warn!(
            service = format_args!("{:#06x}", message.service),
            instance = format_args!("{instance:#06x}"),
            method = format_args!("{:#06x}", message.method),
            "no route, dropping"
        );
        Err(Error::UnknownRoute { service: message.service, instance })
    }
}

// =============================================================================
// DISPATCHER POOL
// =============================================================================

/// Drain a mailbox with `count` worker tasks so slow handlers never
/// block socket tasks. With one dispatcher (the default) handler
/// invocations preserve mailbox FIFO order.
pub fn spawn_dispatchers<F>(
    name: &str,
    receiver: mpsc::Receiver<RoutedMessage>,
    count: usize,
    handler: F,
) where
    F: Fn(RoutedMessage) + Send + Sync + 'static,
{
    let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
    let handler = Arc::new(handler);
    for worker in 0..count.max(1) {
        let receiver = Arc::clone(&receiver);
        let handler = Arc::clone(&handler);
        let name = name.to_owned();
        tokio::spawn(async move {
            loop {
                let message = {
                    let mut rx = receiver.lock().await;
                    rx.recv().await
                };
                match message {
                    Some(message) => handler(message),
                    None => {
                        trace!(app = %name, worker, "mailbox closed, dispatcher exiting");
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageType, ReturnCode};
    use serde_json::json;

    fn config() -> Arc<Config> {
        Arc::new(
            Config::from_tree(&json!({
                "unicast": "127.0.0.1",
                "someip": { "max-payload-local": 100 },
                "services": [
                    {
                        "service": "0x1234", "instance": "0x0001",
                        "unreliable": 0,
                        "events": ["0x8001"],
                        "eventgroups": [
                            { "eventgroup": "0x0005", "events": ["0x8001"] }
                        ]
                    }
                ]
            }))
            .unwrap(),
        )
    }

    fn router() -> (Router, mpsc::Sender<crate::endpoint::EndpointEvent>) {
        let (tx, _rx) = mpsc::channel(64);
        let manager = Arc::new(EndpointManager::new(tx.clone()));
        (Router::new(config(), manager), tx)
    }

    fn request(service: ServiceId, client: ClientId, session: SessionId) -> Message {
        let mut m = Message::new(service, 0x0001, MessageType::Request, vec![1, 2, 3]);
        m.client = client;
        m.session = session;
        m
    }

    #[tokio::test]
    async fn local_request_response_round_trip() {
        let (router, _tx) = router();
        let mut provider_mailbox = router.register_client(0x0200);
        let mut consumer_mailbox = router.register_client(0x0100);
        router.offer_service(0x1234, 0x0001, 0x0200);

        router
            .route(request(0x1234, 0x0100, 7), 0x0001, Origin::Local, true)
            .unwrap();
        let delivered = provider_mailbox.recv().await.unwrap();
        assert_eq!(delivered.message.session, 7);

        // Provider answers; the response is correlated back by
        // (client, session).
        let mut response = delivered.message.clone();
        response.message_type = MessageType::Response;
        response.return_code = ReturnCode::Ok;
        router.route(response, 0x0001, Origin::Local, true).unwrap();
        let answered = consumer_mailbox.recv().await.unwrap();
        assert_eq!(answered.message.message_type, MessageType::Response);
        assert_eq!(answered.message.session, 7);
    }

    #[tokio::test]
    async fn unknown_response_dropped_and_counted() {
        let (router, _tx) = router();
        let before = UNKNOWN_ROUTE_COUNT.load(Ordering::Relaxed);
        let mut response = request(0x1234, 0x0100, 99);
        response.message_type = MessageType::Response;
        assert!(matches!(
            router.route(response, 0x0001, Origin::Local, true),
            Err(Error::UnknownRoute { .. })
        ));
        assert!(UNKNOWN_ROUTE_COUNT.load(Ordering::Relaxed) > before);
    }

    #[tokio::test]
    async fn unknown_service_is_unknown_route() {
        let (router, _tx) = router();
        router.register_client(0x0100);
        assert!(matches!(
            router.route(request(0x4444, 0x0100, 1), 0x0001, Origin::Local, true),
            Err(Error::UnknownRoute { .. })
        ));
    }

    #[tokio::test]
    async fn oversized_local_message_rejected_at_entry() {
        let (router, _tx) = router();
        router.register_client(0x0200);
        router.offer_service(0x1234, 0x0001, 0x0200);
        let mut big = request(0x1234, 0x0100, 1);
        big.payload = vec![0u8; 200]; // over max-payload-local = 100
        assert!(matches!(
            router.route(big, 0x0001, Origin::Local, true),
            Err(Error::MessageTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn notification_fans_out_to_local_subscribers() {
        let (router, _tx) = router();
        let mut a = router.register_client(0x0101);
        let mut b = router.register_client(0x0102);
        router.subscribe_local(0x0101, 0x1234, 0x0001, 0x0005);
        router.subscribe_local(0x0102, 0x1234, 0x0001, 0x0005);
        assert_eq!(router.local_subscriptions(), vec![(0x1234, 0x0001, 0x0005)]);

        let event = Message::new(0x1234, 0x8001, MessageType::Notification, vec![9]);
        router.route(event, 0x0001, Origin::Local, true).unwrap();

        assert_eq!(a.recv().await.unwrap().message.method, 0x8001);
        assert_eq!(b.recv().await.unwrap().message.method, 0x8001);
    }

    #[tokio::test]
    async fn unsubscribed_client_not_notified() {
        let (router, _tx) = router();
        let mut a = router.register_client(0x0101);
        router.subscribe_local(0x0101, 0x1234, 0x0001, 0x0005);
        router.unsubscribe_local(0x0101, 0x1234, 0x0001, 0x0005);

        let event = Message::new(0x1234, 0x8001, MessageType::Notification, vec![9]);
        let _ = router.route(event, 0x0001, Origin::Local, true);
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn deregister_removes_routes_and_pending() {
        let (router, _tx) = router();
        router.register_client(0x0200);
        router.offer_service(0x1234, 0x0001, 0x0200);
        router.register_client(0x0100);
        router
            .route(request(0x1234, 0x0100, 5), 0x0001, Origin::Local, true)
            .unwrap();

        router.deregister_client(0x0200);
        assert!(router.local_services().is_empty());
        // The requester too: its pending entry must not leak.
        router.deregister_client(0x0100);
        let mut response = request(0x1234, 0x0100, 5);
        response.message_type = MessageType::Response;
        assert!(router.route(response, 0x0001, Origin::Local, true).is_err());
    }

    #[tokio::test]
    async fn stop_offer_removes_local_route() {
        let (router, _tx) = router();
        router.register_client(0x0200);
        router.offer_service(0x1234, 0x0001, 0x0200);
        assert_eq!(router.local_services(), vec![(0x1234, 0x0001)]);

        router.stop_offer_service(0x1234, 0x0001);
        assert!(router.local_services().is_empty());
        assert!(matches!(
            router.route(request(0x1234, 0x0100, 1), 0x0001, Origin::Local, true),
            Err(Error::UnknownRoute { .. })
        ));
    }

    #[tokio::test]
    async fn notification_without_event_bit_rejected() {
        let (router, _tx) = router();
        let bogus = Message::new(0x1234, 0x0001, MessageType::Notification, vec![]);
        assert!(matches!(
            router.route(bogus, 0x0001, Origin::Local, true),
            Err(Error::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn mailbox_overflow_reports_queue_full() {
        let (router, _tx) = router();
        let _mailbox = router.register_client(0x0200);
        router.offer_service(0x1234, 0x0001, 0x0200);
        let mut result = Ok(());
        for session in 0..=MAILBOX_DEPTH as u16 {
            result = router.route(
                request(0x1234, 0x0100, session),
                0x0001,
                Origin::Local,
                true,
            );
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(Error::QueueFull(_))));
    }
}
