//! UDP endpoints.
//!
//! Datagram framing is strictly message-aligned: the packetizer batches
//! whole SOME/IP messages up to the unreliable ceiling and every flush
//! turns the accumulated batch into exactly one datagram. Receive
//! parses each datagram as one or more back-to-back messages; a
//! malformed datagram is dropped whole (there is no resynchronization
//! on UDP).
//!
//! One endpoint serves both roles: with a fixed `remote` it behaves as
//! a client endpoint, and `send_to` lazily creates an independent send
//! path (packetizer, queue, writer) per peer for the server role and
//! for SD unicast answers.

use super::client::Shared;
use super::packetizer::Packet;
use super::{Endpoint, EndpointEvent, EndpointId, EndpointOptions, EventSender, Peer};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Largest datagram we ever ask the socket to carry.
const MAX_DATAGRAM: usize = 65_507;

pub struct UdpEndpoint {
    id: EndpointId,
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    /// Fixed remote for the client role.
    remote: Option<SocketAddr>,
    options: EndpointOptions,
    peers: Arc<Mutex<HashMap<SocketAddr, Arc<Shared>>>>,
    stop_tx: watch::Sender<bool>,
}

impl UdpEndpoint {
    /// Bind a server-role endpoint on `local`.
    pub fn bind(local: SocketAddr, options: EndpointOptions, events: EventSender) -> Result<Self> {
        let socket = plain_socket(local)?;
        Self::launch(socket, None, options, events)
    }

    /// Bind a client-role endpoint on an ephemeral port toward `remote`.
    pub fn client(
        remote: SocketAddr,
        options: EndpointOptions,
        events: EventSender,
    ) -> Result<Self> {
        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ((std::net::Ipv6Addr::UNSPECIFIED, 0)).into()
        };
        let socket = plain_socket(local)?;
        Self::launch(socket, Some(remote), options, events)
    }

    /// Bind with `SO_REUSEADDR` so the SD port can be shared between
    /// the unicast socket and the group-joined multicast socket.
    pub fn bind_reuse(
        local: SocketAddr,
        options: EndpointOptions,
        events: EventSender,
    ) -> Result<Self> {
        let socket = reuse_socket(local)?;
        Self::launch(socket, None, options, events)
    }

    /// Bind a shared multicast socket: `SO_REUSEADDR`, bound to the
    /// group port, joined to `group` on `interface`. Used by the SD
    /// endpoint and by multicast eventgroups.
    pub fn bind_multicast(
        group: Ipv4Addr,
        port: u16,
        interface: Ipv4Addr,
        options: EndpointOptions,
        events: EventSender,
    ) -> Result<Self> {
        let bind_addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
        let socket = reuse_socket(bind_addr)?;
        // Unicast traffic on the shared port still flows without group
        // membership, so a failed join degrades instead of aborting.
        match socket.join_multicast_v4(group, interface) {
            Ok(()) => debug!(%group, port, %interface, "joined multicast group"),
            Err(e) => warn!(%group, port, %interface, error = %e,
                "multicast join failed, receiving unicast only"),
        }
        Self::launch(socket, None, options, events)
    }

    fn launch(
        socket: UdpSocket,
        remote: Option<SocketAddr>,
        options: EndpointOptions,
        events: EventSender,
    ) -> Result<Self> {
        let local = socket.local_addr()?;
        let id = EndpointId::next();
        let socket = Arc::new(socket);
        let peers: Arc<Mutex<HashMap<SocketAddr, Arc<Shared>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (stop_tx, mut recv_stop) = watch::channel(false);

        let recv_socket = Arc::clone(&socket);
        let recv_events = events;
        let max = options.max_message_size;
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = recv_stop.changed() => break,
                    received = recv_socket.recv_from(&mut buf) => match received {
                        Ok((n, from)) => {
                            match super::framing::split_datagram(&buf[..n], max) {
                                Ok(frames) => {
                                    for bytes in frames {
                                        trace!(endpoint = %id, peer = %from, len = bytes.len(), "frame");
                                        if recv_events
                                            .send(EndpointEvent::Frame {
                                                endpoint: id,
                                                peer: Peer::Ip(from),
                                                bytes,
                                            })
                                            .await
                                            .is_err()
                                        {
                                            return;
                                        }
                                    }
                                }
                                Err(e) => {
                                    warn!(endpoint = %id, peer = %from, error = %e,
                                        "dropping malformed datagram");
                                }
                            }
                        }
                        Err(e) => {
                            warn!(endpoint = %id, error = %e, "udp receive failed");
                            break;
                        }
                    },
                }
            }
        });

        let endpoint = Self { id, socket, local, remote, options, peers, stop_tx };
        if let Some(remote) = remote {
            // Create the client-role send path eagerly so sends before
            // any receive do not pay the setup cost.
            endpoint.peer_state(remote);
        }
        Ok(endpoint)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Send path toward `target`, created on first use.
    fn peer_state(&self, target: SocketAddr) -> Arc<Shared> {
        let mut peers = self.peers.lock().unwrap();
        if let Some(state) = peers.get(&target) {
            return Arc::clone(state);
        }
        let state = Arc::new(Shared::new(self.id, &self.options));
        peers.insert(target, Arc::clone(&state));

        let socket = Arc::clone(&self.socket);
        let task_state = Arc::clone(&state);
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop_rx.changed() => {}
                result = datagram_write_loop(&socket, target, &task_state) => {
                    if let Err(e) = result {
                        warn!(peer = %target, error = %e, "udp send path failed");
                    }
                }
            }
        });
        state
    }

    fn push(&self, state: &Shared, bytes: &[u8], flush: bool) -> Result<()> {
        {
            let mut queue = state.queue.lock().unwrap();
            queue.push(bytes, flush, Instant::now())?;
        }
        state.writer_wake.notify_one();
        Ok(())
    }
}

impl Endpoint for UdpEndpoint {
    fn id(&self) -> EndpointId {
        self.id
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn send(&self, bytes: &[u8], flush: bool) -> Result<()> {
        let Some(remote) = self.remote else {
            warn!(endpoint = %self.id, "udp server endpoint requires an explicit target");
            return Err(Error::NotConnected);
        };
        let state = self.peer_state(remote);
        self.push(&state, bytes, flush)
    }

    fn send_to(&self, peer: Peer, bytes: &[u8], flush: bool) -> Result<()> {
        let Peer::Ip(target) = peer else {
            return Err(Error::NotConnected);
        };
        let state = self.peer_state(target);
        self.push(&state, bytes, flush)
    }

    fn is_connected(&self) -> bool {
        // Datagram sockets are usable as soon as they are bound.
        !self.stop_tx.is_closed() && !*self.stop_tx.borrow()
    }

    fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let peers = self.peers.lock().unwrap();
        for state in peers.values() {
            state.queue.lock().unwrap().clear();
            state.writer_wake.notify_one();
        }
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

fn plain_socket(local: SocketAddr) -> Result<UdpSocket> {
    let std_socket = std::net::UdpSocket::bind(local)
        .map_err(|source| Error::Bind { addr: local.to_string(), source })?;
    std_socket
        .set_nonblocking(true)
        .map_err(|source| Error::Bind { addr: local.to_string(), source })?;
    UdpSocket::from_std(std_socket).map_err(|source| Error::Bind { addr: local.to_string(), source })
}

fn reuse_socket(local: SocketAddr) -> Result<UdpSocket> {
    let domain = if local.is_ipv4() { socket2::Domain::IPV4 } else { socket2::Domain::IPV6 };
    let raw = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
        .map_err(|source| Error::Bind { addr: local.to_string(), source })?;
    raw.set_reuse_address(true)
        .and_then(|()| raw.bind(&local.into()))
        .and_then(|()| raw.set_nonblocking(true))
        .map_err(|source| Error::Bind { addr: local.to_string(), source })?;
    let std_socket: std::net::UdpSocket = raw.into();
    UdpSocket::from_std(std_socket).map_err(|source| Error::Bind { addr: local.to_string(), source })
}

/// Datagram writer: every queued packet goes out as one datagram.
async fn datagram_write_loop(
    socket: &UdpSocket,
    target: SocketAddr,
    shared: &Shared,
) -> io::Result<()> {
    loop {
        let step: Option<Packet> = {
            let queue = shared.queue.lock().unwrap();
            queue.front()
        };
        match step {
            Some(packet) => {
                socket.send_to(&packet, target).await?;
                shared.queue.lock().unwrap().pop_sent();
            }
            None => {
                let deadline = shared.queue.lock().unwrap().flush_deadline();
                match deadline {
                    None => shared.writer_wake.notified().await,
                    Some(deadline) => {
                        tokio::select! {
                            _ = shared.writer_wake.notified() => {}
                            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                                shared.queue.lock().unwrap().flush_if_due(Instant::now());
                            }
                        }
                    }
                }
            }
        }
    }
}
