//! Stream server endpoints (TCP and local stream).
//!
//! A server endpoint accepts connections and dispatches their frames
//! upward with the source peer attached. Each accepted connection gets
//! its own send path (packetizer, queue, writer) mirroring the client
//! endpoint minus reconnection: when a connection dies the peer is
//! forgotten and the remote client is expected to reconnect.

use super::client::{read_loop, write_loop, Shared};
use super::{Endpoint, EndpointEvent, EndpointId, EndpointOptions, EventSender, Peer};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, warn};

// =============================================================================
// ACCEPTOR CAPABILITY
// =============================================================================

/// The accept half of the server capability set.
pub trait Acceptor: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, Peer)>> + Send;
}

pub struct TcpAcceptor {
    listener: TcpListener,
}

impl Acceptor for TcpAcceptor {
    type Stream = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<(Self::Stream, Peer)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, Peer::Ip(addr)))
    }
}

#[cfg(unix)]
pub struct LocalAcceptor {
    listener: tokio::net::UnixListener,
    next_conn: std::sync::atomic::AtomicU64,
}

#[cfg(unix)]
impl Acceptor for LocalAcceptor {
    type Stream = tokio::net::UnixStream;

    async fn accept(&self) -> io::Result<(Self::Stream, Peer)> {
        let (stream, _) = self.listener.accept().await?;
        // Unix peers are anonymous; number them per accepted connection.
        let id = self.next_conn.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok((stream, Peer::Local(id)))
    }
}

// =============================================================================
// SERVER ENDPOINT
// =============================================================================

type PeerMap = Arc<Mutex<HashMap<Peer, Arc<Shared>>>>;

/// Generic stream server endpoint; instantiated for TCP and local.
pub struct StreamServer<A: Acceptor> {
    id: EndpointId,
    local: Option<SocketAddr>,
    peers: PeerMap,
    stop_tx: watch::Sender<bool>,
    _acceptor: std::marker::PhantomData<A>,
}

pub type TcpServerEndpoint = StreamServer<TcpAcceptor>;
#[cfg(unix)]
pub type LocalServerEndpoint = StreamServer<LocalAcceptor>;

impl TcpServerEndpoint {
    /// Bind and start accepting on `local`.
    pub async fn bind(
        local: SocketAddr,
        options: EndpointOptions,
        events: EventSender,
    ) -> Result<Self> {
        let listener = TcpListener::bind(local)
            .await
            .map_err(|source| Error::Bind { addr: local.to_string(), source })?;
        let bound = listener.local_addr().map_err(|source| Error::Bind {
            addr: local.to_string(),
            source,
        })?;
        debug!(local = %bound, "tcp server endpoint listening");
        Ok(Self::launch(TcpAcceptor { listener }, Some(bound), options, events))
    }
}

#[cfg(unix)]
impl LocalServerEndpoint {
    /// Bind the routing host's local stream socket at `path`.
    pub fn bind(
        path: impl AsRef<std::path::Path>,
        options: EndpointOptions,
        events: EventSender,
    ) -> Result<Self> {
        let path = path.as_ref();
        // A stale socket file from a previous run blocks the bind.
        let _ = std::fs::remove_file(path);
        let listener = tokio::net::UnixListener::bind(path).map_err(|source| Error::Bind {
            addr: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "local server endpoint listening");
        Ok(Self::launch(
            LocalAcceptor { listener, next_conn: std::sync::atomic::AtomicU64::new(1) },
            None,
            options,
            events,
        ))
    }
}

impl<A: Acceptor> StreamServer<A> {
    fn launch(
        acceptor: A,
        local: Option<SocketAddr>,
        options: EndpointOptions,
        events: EventSender,
    ) -> Self {
        let id = EndpointId::next();
        let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let accept_peers = Arc::clone(&peers);
        tokio::spawn(async move {
            accept_loop(acceptor, id, options, events, accept_peers, stop_rx).await;
        });

        Self { id, local, peers, stop_tx, _acceptor: std::marker::PhantomData }
    }

    /// Peers with a live connection right now.
    pub fn connected_peers(&self) -> Vec<Peer> {
        self.peers.lock().unwrap().keys().copied().collect()
    }
}

impl<A: Acceptor> Endpoint for StreamServer<A> {
    fn id(&self) -> EndpointId {
        self.id
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn send(&self, _bytes: &[u8], _flush: bool) -> Result<()> {
        warn!(endpoint = %self.id, "server endpoint requires an explicit target");
        Err(Error::NotConnected)
    }

    fn send_to(&self, peer: Peer, bytes: &[u8], flush: bool) -> Result<()> {
        let shared = {
            let peers = self.peers.lock().unwrap();
            peers.get(&peer).cloned()
        };
        let Some(shared) = shared else {
            return Err(Error::NotConnected);
        };
        {
            let mut queue = shared.queue.lock().unwrap();
            queue.push(bytes, flush, Instant::now())?;
        }
        shared.writer_wake.notify_one();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.peers.lock().unwrap().is_empty()
    }

    fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let peers = self.peers.lock().unwrap();
        for shared in peers.values() {
            shared.queue.lock().unwrap().clear();
            shared.writer_wake.notify_one();
        }
    }
}

impl<A: Acceptor> Drop for StreamServer<A> {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

// =============================================================================
// ACCEPT LOOP
// =============================================================================

async fn accept_loop<A: Acceptor>(
    acceptor: A,
    id: EndpointId,
    options: EndpointOptions,
    events: EventSender,
    peers: PeerMap,
    stop_rx: watch::Receiver<bool>,
) {
    let mut stop = stop_rx.clone();
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = acceptor.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(endpoint = %id, %peer, "accepted connection");
                    let shared = Arc::new(Shared::new(id, &options));
                    peers.lock().unwrap().insert(peer, Arc::clone(&shared));
                    tokio::spawn(run_connection(
                        stream,
                        shared,
                        peer,
                        options.clone(),
                        events.clone(),
                        Arc::clone(&peers),
                        stop_rx.clone(),
                    ));
                }
                Err(e) => {
                    // Transient accept failures (EMFILE and friends);
                    // back off briefly instead of spinning.
                    warn!(endpoint = %id, error = %e, "accept failed");
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
                    }
                }
            },
        }
    }
}

async fn run_connection<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    shared: Arc<Shared>,
    peer: Peer,
    options: EndpointOptions,
    events: EventSender,
    peers: PeerMap,
    mut stop_rx: watch::Receiver<bool>,
) {
    let id = shared.id;
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let write = write_loop(&mut write_half, &shared);
    let read = read_loop(&mut read_half, id, &options, &events, peer);
    tokio::pin!(write);
    tokio::pin!(read);

    let outcome: io::Result<()> = tokio::select! {
        _ = stop_rx.changed() => Ok(()),
        result = &mut write => result,
        result = &mut read => result,
    };

    if let Err(e) = outcome {
        debug!(endpoint = %id, %peer, error = %e, "connection closed");
    }
    peers.lock().unwrap().remove(&peer);
    let _ = events.send(EndpointEvent::Disconnected { endpoint: id, peer: Some(peer) }).await;
}
