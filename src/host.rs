//! Routing host: owns the shared endpoints and dispatches between local
//! applications, local-stream clients, and the network.
//!
//! The host consumes the single endpoint event channel. Frames from
//! network endpoints are decoded, their instance resolved from the
//! endpoint they arrived on, and handed to the routing core. Frames
//! from the local stream socket are command frames: register,
//! deregister, send, subscribe. Registered local-stream clients get a
//! forwarder task that wraps their mailbox traffic back into command
//! frames.

use crate::codec::{CommandHeader, Message, SendCommand, SubscribeCommand};
use crate::config::Config;
use crate::endpoint::{
    Endpoint, EndpointEvent, EndpointId, EndpointManager, EndpointOptions, Peer, Protocol,
    EVENT_CHANNEL_DEPTH,
};
use crate::error::{Error, Result};
use crate::routing::{Origin, RoutedMessage, Router};
use crate::sd::{SdCommand, SdEngine, SdHandle};
use crate::types::{
    ClientId, Command, InstanceId, ServiceId, COMMAND_HEADER_SIZE, MAX_MESSAGE_SIZE_UNRELIABLE,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Local stream socket of a routing host, named after it.
pub fn local_socket_path(routing_host: &str) -> std::path::PathBuf {
    std::path::PathBuf::from(format!("/tmp/someip-{routing_host}.sock"))
}

/// Stops the host's event loop when triggered.
#[derive(Clone)]
pub struct HostHandle {
    shutdown: watch::Sender<bool>,
}

impl HostHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

pub struct RoutingHost {
    config: Arc<Config>,
    manager: Arc<EndpointManager>,
    router: Arc<Router>,
    sd: Option<SdHandle>,
    events: mpsc::Receiver<EndpointEvent>,
    shutdown: watch::Receiver<bool>,

    /// Server endpoints by id, for reply paths and instance resolution.
    endpoints: HashMap<EndpointId, Weak<dyn Endpoint>>,
    /// Per-endpoint service → instance resolution (built at bind time).
    endpoint_services: HashMap<EndpointId, HashMap<ServiceId, InstanceId>>,
    /// The local stream server, when bound.
    local_server: Option<(EndpointId, Weak<dyn Endpoint>)>,
    /// Registered local-stream clients per connection.
    ipc_clients: HashMap<Peer, ClientId>,
    /// Port of the shared UDP endpoint that receives remote events.
    event_port: Option<u16>,
}

impl RoutingHost {
    /// Bind all configured endpoints and start service discovery.
    pub async fn start(config: Arc<Config>) -> Result<(Self, HostHandle)> {
        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let manager = Arc::new(EndpointManager::new(event_tx));
        let router = Arc::new(Router::new(Arc::clone(&config), Arc::clone(&manager)));

        let mut endpoints = HashMap::new();
        let mut endpoint_services: HashMap<EndpointId, HashMap<ServiceId, InstanceId>> =
            HashMap::new();

        // Server endpoints for every locally provided service; services
        // sharing a port share the endpoint.
        let unicast = config.unicast_address();
        for service in config.local_services() {
            if let Some(port) = service.reliable_port {
                let addr = SocketAddr::new(unicast, port);
                let size = config.message_size_reliable(unicast, port);
                let options = EndpointOptions::from_config(&config, size)
                    .with_magic_cookies(config.has_enabled_magic_cookies(unicast, port));
                let endpoint = manager.server(Protocol::Tcp, addr, options).await?;
                if let Some(live) = endpoint.upgrade() {
                    endpoints.insert(live.id(), endpoint);
                    endpoint_services
                        .entry(live.id())
                        .or_default()
                        .insert(service.service, service.instance);
                }
            }
            if let Some(port) = service.unreliable_port {
                let addr = SocketAddr::new(unicast, port);
                let options =
                    EndpointOptions::from_config(&config, MAX_MESSAGE_SIZE_UNRELIABLE);
                let endpoint = manager.server(Protocol::Udp, addr, options).await?;
                if let Some(live) = endpoint.upgrade() {
                    endpoints.insert(live.id(), endpoint);
                    endpoint_services
                        .entry(live.id())
                        .or_default()
                        .insert(service.service, service.instance);
                }
            }
        }

        // Shared UDP endpoint for receiving remote notifications; its
        // port rides along in our SubscribeEventgroup entries.
        let event_endpoint = manager
            .server(
                Protocol::Udp,
                SocketAddr::new(unicast, 0),
                EndpointOptions::from_config(&config, MAX_MESSAGE_SIZE_UNRELIABLE),
            )
            .await?;
        let event_port = event_endpoint
            .upgrade()
            .and_then(|e| {
                endpoints.insert(e.id(), event_endpoint.clone());
                e.local_addr()
            })
            .map(|addr| addr.port());

        // Local stream socket for out-of-process applications.
        #[cfg(unix)]
        let local_server = {
            let path = local_socket_path(config.routing_host());
            let options = EndpointOptions::from_config(&config, config.max_message_size_local())
                .with_command_framing();
            let endpoint = manager.local_server(&path, options)?;
            match endpoint.upgrade() {
                Some(live) => {
                    endpoints.insert(live.id(), endpoint.clone());
                    Some((live.id(), endpoint))
                }
                None => None,
            }
        };
        #[cfg(not(unix))]
        let local_server = None;

        // Statically configured remote services are reachable without
        // discovery.
        for service in config.remote_services() {
            let reliable = service.reliable_port.map(|p| SocketAddr::new(service.unicast, p));
            let unreliable = service.unreliable_port.map(|p| SocketAddr::new(service.unicast, p));
            router.set_remote_service(service.service, service.instance, reliable, unreliable)?;
        }

        let sd = if config.sd().enabled {
            Some(SdEngine::spawn(Arc::clone(&config), Arc::clone(&router), Arc::clone(&manager))?)
        } else {
            None
        };

        let (shutdown_tx, shutdown) = watch::channel(false);
        info!(unicast = %unicast, services = config.local_services().count(),
            sd = sd.is_some(), "routing host up");

        Ok((
            Self {
                config,
                manager,
                router,
                sd,
                events,
                shutdown,
                endpoints,
                endpoint_services,
                local_server,
                ipc_clients: HashMap::new(),
                event_port,
            },
            HostHandle { shutdown: shutdown_tx },
        ))
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    pub fn manager(&self) -> Arc<EndpointManager> {
        Arc::clone(&self.manager)
    }

    pub fn sd(&self) -> Option<SdHandle> {
        self.sd.clone()
    }

    /// Offer every configured local service on behalf of `client` and
    /// announce them through SD.
    pub async fn offer_configured(&self, client: ClientId) {
        let offered: Vec<_> = self
            .config
            .local_services()
            .map(|s| (s.service, s.instance))
            .collect();
        for (service, instance) in offered {
            self.router.offer_service(service, instance, client);
            if let Some(sd) = &self.sd {
                let _ = sd.send(SdCommand::OfferService { service, instance }).await;
            }
        }
    }

    /// Consume endpoint events until shutdown.
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }

        // Best-effort SD goodbyes before the sockets close.
        if let Some(sd) = &self.sd {
            let _ = sd.send(SdCommand::Shutdown).await;
        }
        self.manager.stop_all();
        info!("routing host stopped");
        Ok(())
    }

    async fn handle_event(&mut self, event: EndpointEvent) {
        match event {
            EndpointEvent::Frame { endpoint, peer, bytes } => {
                let is_ipc = self.local_server.as_ref().is_some_and(|(id, _)| *id == endpoint);
                if is_ipc {
                    self.handle_ipc_frame(peer, &bytes).await;
                } else {
                    self.handle_network_frame(endpoint, peer, &bytes);
                }
            }
            EndpointEvent::Connected { endpoint } => {
                trace!(%endpoint, "endpoint connected");
            }
            EndpointEvent::Disconnected { endpoint, peer } => {
                trace!(%endpoint, ?peer, "endpoint disconnected");
                let is_ipc = self.local_server.as_ref().is_some_and(|(id, _)| *id == endpoint);
                if is_ipc {
                    if let Some(client) = peer.and_then(|p| self.ipc_clients.remove(&p)) {
                        debug!(client = format_args!("{client:#06x}"),
                            "local client connection lost, deregistering");
                        self.router.deregister_client(client);
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Network frames
    // -------------------------------------------------------------------------

    fn handle_network_frame(&mut self, endpoint: EndpointId, peer: Peer, bytes: &[u8]) {
        let message = match Message::decode(bytes, bytes.len()) {
            Ok(message) => message,
            Err(e) => {
                warn!(%endpoint, %peer, error = %e, "dropping undecodable frame");
                return;
            }
        };
        // SD frames are handled by the engine on its own socket; one
        // arriving here means misconfiguration.
        if message.service == crate::types::SD_SERVICE {
            trace!(%endpoint, "sd frame on data endpoint, ignoring");
            return;
        }

        let Some(instance) = self.resolve_instance(endpoint, peer, message.service) else {
            warn!(%endpoint, %peer, service = format_args!("{:#06x}", message.service),
                "cannot resolve instance, dropping");
            return;
        };

        let origin = match self.endpoints.get(&endpoint) {
            Some(weak) => Origin::Remote { endpoint: weak.clone(), peer },
            None => Origin::Local,
        };
        if let Err(e) = self.router.route(message, instance, origin, true) {
            debug!(%endpoint, %peer, error = %e, "inbound frame not routed");
        }
    }

    /// Instance of `service` for a frame that arrived on `endpoint`.
    fn resolve_instance(
        &self,
        endpoint: EndpointId,
        peer: Peer,
        service: ServiceId,
    ) -> Option<InstanceId> {
        if let Some(instance) =
            self.endpoint_services.get(&endpoint).and_then(|map| map.get(&service))
        {
            return Some(*instance);
        }
        // Responses and notifications from a remote service: match on
        // the configured remote address.
        if let Peer::Ip(addr) = peer {
            if let Some(service_config) = self
                .config
                .services()
                .find(|s| s.service == service && s.unicast == addr.ip())
            {
                return Some(service_config.instance);
            }
        }
        // Unambiguous single instance.
        let mut instances = self.config.services().filter(|s| s.service == service);
        match (instances.next(), instances.next()) {
            (Some(only), None) => Some(only.instance),
            _ => None,
        }
    }

    // -------------------------------------------------------------------------
    // Local stream clients
    // -------------------------------------------------------------------------

    async fn handle_ipc_frame(&mut self, peer: Peer, frame: &[u8]) {
        let header = match CommandHeader::decode(frame) {
            Ok(header) => header,
            Err(e) => {
                warn!(%peer, error = %e, "dropping malformed command frame");
                return;
            }
        };
        let body = &frame[COMMAND_HEADER_SIZE..];

        match header.command {
            Command::Register => self.register_ipc_client(peer, header.client),
            Command::Deregister => {
                if self.ipc_clients.remove(&peer).is_some() {
                    self.router.deregister_client(header.client);
                }
            }
            Command::Send => {
                let send = match SendCommand::decode(body) {
                    Ok(send) => send,
                    Err(e) => {
                        warn!(%peer, error = %e, "dropping malformed send command");
                        return;
                    }
                };
                let limit = self.config.max_message_size_local() as usize;
                let message = match Message::decode(&send.frame, limit) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(%peer, error = %e, "dropping undecodable local message");
                        return;
                    }
                };
                // Replies come back through the client's mailbox, so the
                // origin is local even though the bytes crossed a socket.
                if let Err(e) =
                    self.router.route(message, send.instance, Origin::Local, send.flush)
                {
                    debug!(%peer, error = %e, "local send not routed");
                }
            }
            Command::Subscribe => {
                let Ok(subscribe) = SubscribeCommand::decode(body) else {
                    warn!(%peer, "dropping malformed subscribe command");
                    return;
                };
                self.router.subscribe_local(
                    header.client,
                    subscribe.service,
                    subscribe.instance,
                    subscribe.eventgroup,
                );
                if let Some(sd) = &self.sd {
                    let _ = sd
                        .send(SdCommand::Subscribe {
                            service: subscribe.service,
                            instance: subscribe.instance,
                            eventgroup: subscribe.eventgroup,
                            reliable_port: None,
                            unreliable_port: self.event_port,
                        })
                        .await;
                }
            }
            Command::Unsubscribe => {
                let Ok(subscribe) = SubscribeCommand::decode(body) else {
                    warn!(%peer, "dropping malformed unsubscribe command");
                    return;
                };
                self.router.unsubscribe_local(
                    header.client,
                    subscribe.service,
                    subscribe.instance,
                    subscribe.eventgroup,
                );
                if let Some(sd) = &self.sd {
                    let _ = sd
                        .send(SdCommand::Unsubscribe {
                            service: subscribe.service,
                            instance: subscribe.instance,
                            eventgroup: subscribe.eventgroup,
                        })
                        .await;
                }
            }
        }
    }

    fn register_ipc_client(&mut self, peer: Peer, client: ClientId) {
        let Some((_, server)) = &self.local_server else { return };
        debug!(%peer, client = format_args!("{client:#06x}"), "local client registered");
        self.ipc_clients.insert(peer, client);
        let mailbox = self.router.register_client(client);
        tokio::spawn(forward_to_ipc(mailbox, server.clone(), peer, client));
    }
}

/// Forward a registered local-stream client's mailbox back over its
/// connection as command frames.
async fn forward_to_ipc(
    mut mailbox: mpsc::Receiver<RoutedMessage>,
    server: Weak<dyn Endpoint>,
    peer: Peer,
    client: ClientId,
) {
    while let Some(routed) = mailbox.recv().await {
        let Some(endpoint) = server.upgrade() else { break };
        let command = SendCommand {
            instance: routed.instance,
            flush: true,
            frame: routed.message.encode(),
        };
        if let Err(e) = endpoint.send_to(peer, &command.encode(client), true) {
            debug!(%peer, error = %e, "forward to local client failed");
            if matches!(e, Error::NotConnected) {
                break;
            }
        }
    }
}
