//! Stream client endpoints (TCP and local stream).
//!
//! One connection task per endpoint owns the socket: it connects with
//! exponential backoff, then runs the read and write halves until an
//! error sends it back to connecting. Only that task touches the
//! socket; senders on other threads append to the locked send queue and
//! wake the writer. A single write is in flight at any time, and the
//! queue head is popped only after its write completed, so packets
//! survive a reconnect and reach the wire in submission order.

use super::framing::{CommandReassembler, Reassembler, StreamReassembler};
use super::packetizer::SendQueue;
use super::{
    Endpoint, EndpointEvent, EndpointId, EndpointOptions, EventSender, Peer, READ_CHUNK,
};
use crate::error::{Error, Result};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tracing::{debug, trace, warn};

// =============================================================================
// CONNECTOR CAPABILITY
// =============================================================================

/// The connect half of the endpoint capability set; the rest of the
/// client behavior (packetizer, queue, flush, reconnect) is shared.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Peer identity attached to received frames.
    fn peer(&self) -> Peer;
}

/// TCP connector with Nagle disabled: the packetizer already batches,
/// a second batching layer would only add latency.
pub struct TcpConnector {
    remote: SocketAddr,
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(self.remote).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn peer(&self) -> Peer {
        Peer::Ip(self.remote)
    }
}

/// Local stream connector (Unix domain socket to the routing host).
#[cfg(unix)]
pub struct LocalConnector {
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl Connector for LocalConnector {
    type Stream = tokio::net::UnixStream;

    async fn connect(&self) -> io::Result<tokio::net::UnixStream> {
        tokio::net::UnixStream::connect(&self.path).await
    }

    fn peer(&self) -> Peer {
        Peer::Local(0)
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

/// State behind the endpoint mutex plus the writer wakeup. Shared with
/// the server module, whose per-connection send paths mirror this.
pub(super) struct Shared {
    pub(super) id: EndpointId,
    pub(super) queue: Mutex<SendQueue>,
    pub(super) writer_wake: Notify,
    pub(super) connected: AtomicBool,
}

impl Shared {
    pub(super) fn new(id: EndpointId, options: &EndpointOptions) -> Self {
        Self {
            id,
            queue: Mutex::new(SendQueue::new(
                options.max_message_size,
                options.queue_limit,
                options.flush_timeout,
            )),
            writer_wake: Notify::new(),
            connected: AtomicBool::new(false),
        }
    }
}

enum WriterStep {
    Write(super::packetizer::Packet),
    Idle(Option<Instant>),
}

impl Shared {
    fn next_step(&self) -> WriterStep {
        let queue = self.queue.lock().unwrap();
        match queue.front() {
            Some(packet) => WriterStep::Write(packet),
            None => WriterStep::Idle(queue.flush_deadline()),
        }
    }
}

// =============================================================================
// CLIENT ENDPOINT
// =============================================================================

/// Generic stream client endpoint; instantiated for TCP and local.
pub struct StreamClient<C: Connector> {
    shared: Arc<Shared>,
    connector: Arc<C>,
    stop_tx: watch::Sender<bool>,
}

pub type TcpClientEndpoint = StreamClient<TcpConnector>;
#[cfg(unix)]
pub type LocalClientEndpoint = StreamClient<LocalConnector>;

impl TcpClientEndpoint {
    /// Start a TCP client endpoint toward `remote`.
    pub fn start(remote: SocketAddr, options: EndpointOptions, events: EventSender) -> Self {
        Self::launch(TcpConnector { remote }, options, events)
    }
}

#[cfg(unix)]
impl LocalClientEndpoint {
    /// Start a local stream client endpoint toward the socket at `path`.
    pub fn start(
        path: impl Into<std::path::PathBuf>,
        options: EndpointOptions,
        events: EventSender,
    ) -> Self {
        Self::launch(LocalConnector { path: path.into() }, options, events)
    }
}

impl<C: Connector> StreamClient<C> {
    fn launch(connector: C, options: EndpointOptions, events: EventSender) -> Self {
        let shared = Arc::new(Shared::new(EndpointId::next(), &options));
        let connector = Arc::new(connector);
        let (stop_tx, stop_rx) = watch::channel(false);

        // The connection task keeps only a weak handle; once the owner
        // drops the endpoint the task winds down instead of keeping the
        // state alive through its own timers.
        let task_shared = Arc::downgrade(&shared);
        let task_connector = Arc::clone(&connector);
        tokio::spawn(async move {
            run_client(task_shared, task_connector, options, events, stop_rx).await;
        });

        Self { shared, connector, stop_tx }
    }

    /// The fixed remote this endpoint connects to.
    pub fn peer(&self) -> Peer {
        self.connector.peer()
    }
}

impl<C: Connector> Endpoint for StreamClient<C> {
    fn id(&self) -> EndpointId {
        self.shared.id
    }

    fn send(&self, bytes: &[u8], flush: bool) -> Result<()> {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.push(bytes, flush, Instant::now())?;
        }
        self.shared.writer_wake.notify_one();
        Ok(())
    }

    fn send_to(&self, peer: Peer, _bytes: &[u8], _flush: bool) -> Result<()> {
        warn!(endpoint = %self.shared.id, %peer, "client endpoint cannot send to explicit targets");
        Err(Error::NotConnected)
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn stop(&self) {
        let _ = self.stop_tx.send(true);
        self.shared.queue.lock().unwrap().clear();
        self.shared.writer_wake.notify_one();
    }
}

impl<C: Connector> Drop for StreamClient<C> {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

// =============================================================================
// CONNECTION TASK
// =============================================================================

async fn run_client<C: Connector>(
    shared: std::sync::Weak<Shared>,
    connector: Arc<C>,
    options: EndpointOptions,
    events: EventSender,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut backoff = options.connect_timeout;

    loop {
        if *stop_rx.borrow() {
            break;
        }
        // Upgrade at the top of every cycle; a dead owner ends the task.
        let Some(state) = shared.upgrade() else { break };
        let id = state.id;

        tokio::select! {
            _ = stop_rx.changed() => break,
            connected = connector.connect() => match connected {
                Ok(stream) => {
                    backoff = options.connect_timeout;
                    state.connected.store(true, Ordering::Release);
                    if events.send(EndpointEvent::Connected { endpoint: id }).await.is_err() {
                        break;
                    }
                    debug!(endpoint = %id, peer = %connector.peer(), "connected");

                    let outcome =
                        run_connected(stream, &state, &options, &events, connector.peer(), &mut stop_rx)
                            .await;

                    state.connected.store(false, Ordering::Release);
                    if let Err(e) = outcome {
                        debug!(endpoint = %id, error = %e, "connection lost");
                    }
                    drop(state);
                    if events
                        .send(EndpointEvent::Disconnected { endpoint: id, peer: None })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    // Broken pipe and peers closing mid-stream reconnect
                    // immediately; the backoff only grows while connects
                    // themselves fail.
                }
                Err(e) => {
                    trace!(endpoint = %id, error = %e, delay_ms = backoff.as_millis() as u64,
                        "connect failed, backing off");
                    drop(state);
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(options.max_connect_timeout);
                }
            },
        }
    }
}

/// Drive one established connection until stop or error.
async fn run_connected<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    shared: &Shared,
    options: &EndpointOptions,
    events: &EventSender,
    peer: Peer,
    stop_rx: &mut watch::Receiver<bool>,
) -> io::Result<()> {
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let write = write_loop(&mut write_half, shared);
    let read = read_loop(&mut read_half, shared.id, options, events, peer);
    tokio::pin!(write);
    tokio::pin!(read);

    tokio::select! {
        _ = stop_rx.changed() => Ok(()),
        result = &mut write => result,
        result = &mut read => result,
    }
}

/// Single writer: at most one write in flight, queue head popped only
/// after success so an interrupted packet is retransmitted entire.
pub(super) async fn write_loop<W: AsyncWrite + Unpin>(
    write_half: &mut W,
    shared: &Shared,
) -> io::Result<()> {
    loop {
        match shared.next_step() {
            WriterStep::Write(packet) => {
                write_half.write_all(&packet).await?;
                shared.queue.lock().unwrap().pop_sent();
            }
            WriterStep::Idle(None) => shared.writer_wake.notified().await,
            WriterStep::Idle(Some(deadline)) => {
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

pub(super) async fn read_loop<R: AsyncRead + Unpin>(
    read_half: &mut R,
    id: EndpointId,
    options: &EndpointOptions,
    events: &EventSender,
    peer: Peer,
) -> io::Result<()> {
    let mut reassembler = if options.command_framing {
        Reassembler::Command(CommandReassembler::new(options.max_message_size))
    } else {
        Reassembler::SomeIp(StreamReassembler::new(
            options.max_message_size,
            options.magic_cookies,
        ))
    };
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = read_half.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
        }
        reassembler.extend(&chunk[..n]);
        loop {
            match reassembler.next_frame() {
                Ok(Some(bytes)) => {
                    trace!(endpoint = %id, %peer, len = bytes.len(),
                        head = %hex::encode(&bytes[..bytes.len().min(16)]), "frame");
                    if events
                        .send(EndpointEvent::Frame { endpoint: id, peer, bytes })
                        .await
                        .is_err()
                    {
                        return Err(io::Error::new(io::ErrorKind::Other, "event channel closed"));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(endpoint = %id, %peer, error = %e, "dropping out-of-sync connection");
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "stream out of sync"));
                }
            }
        }
    }
}
