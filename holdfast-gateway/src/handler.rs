//! Per-connection handling: socket I/O tasks, worker dispatch, outbound
//! sends.
//!
//! Each accepted socket is split into a reader task and a writer task. The
//! writer task is the socket's owning task: every outbound write goes
//! through its queue, so [`ConnectionHandler::send`] is safe from any
//! thread and never touches the socket directly. The reader task turns
//! every successful read into one opaque payload dispatched to the worker
//! pool together with a weak handler reference.

use crate::manager::ConnectionManager;
use bytes::{Bytes, BytesMut};
use holdfast_core::{Channel, WorkerPool};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Read buffer capacity; one read yields at most one payload of this size.
const READ_CHUNK: usize = 64 * 1024;

/// Identifier minted for each accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw connection id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier bound to a connection after a successful logon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw session id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Application hook processing one inbound payload.
///
/// Runs on a worker-pool thread, never on the socket tasks. Implementors
/// may call [`ConnectionHandler::send`] (or go through the
/// [`ConnectionManager`]) to push replies.
pub trait Service: Send + Sync + 'static {
    /// Handle one opaque payload read from `conn`'s socket.
    fn handle(&self, conn: &Arc<ConnectionHandler>, payload: Bytes);
}

/// One inbound payload tagged with its source connection.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Connection the payload arrived on
    pub connection: ConnectionId,
    /// The opaque payload bytes
    pub payload: Bytes,
}

/// Default service: forwards every inbound payload to the upper layer over
/// a channel.
///
/// This is the gateway side of the logon flow: the upper layer receives
/// `(connection, payload)`, decides about the logon, and answers through
/// [`ConnectionManager::set_session`] and
/// [`ConnectionManager::send_to_session`].
pub struct UpstreamService {
    upstream: Channel<InboundFrame>,
}

impl UpstreamService {
    /// Create a service forwarding into `upstream`.
    #[must_use]
    pub fn new(upstream: Channel<InboundFrame>) -> Self {
        Self { upstream }
    }
}

impl Service for UpstreamService {
    fn handle(&self, conn: &Arc<ConnectionHandler>, payload: Bytes) {
        self.upstream.send(InboundFrame { connection: conn.id(), payload });
    }
}

/// Owns one client connection: identity, outbound queue, and the service
/// dispatch for inbound payloads.
///
/// Shared ownership lives in the [`ConnectionManager`]; the handler is
/// destroyed when the last shared reference drops.
pub struct ConnectionHandler {
    id: ConnectionId,
    peer_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Bytes>,
    service: Arc<dyn Service>,
    pool: Arc<WorkerPool>,
    manager: Weak<ConnectionManager>,
}

impl ConnectionHandler {
    /// Create a handler for an accepted connection.
    ///
    /// `outbound` feeds the writer task created by
    /// [`spawn_io`](ConnectionHandler::spawn_io).
    pub(crate) fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Bytes>,
        service: Arc<dyn Service>,
        pool: Arc<WorkerPool>,
        manager: Weak<ConnectionManager>,
    ) -> Arc<Self> {
        Arc::new(Self { id, peer_addr, outbound, service, pool, manager })
    }

    /// The connection id minted at accept time.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// The peer's socket address.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Queue `bytes` for writing on the socket's owning task.
    ///
    /// Safe from any thread. Sends to a torn-down socket are dropped
    /// silently; the queued bytes never keep the handler itself alive.
    pub fn send(&self, bytes: Bytes) {
        if self.outbound.send(bytes).is_err() {
            trace!(connection = %self.id, "dropping send to torn-down socket");
        }
    }

    /// Spawn the reader and writer tasks for `stream`.
    pub(crate) fn spawn_io(
        self: &Arc<Self>,
        stream: TcpStream,
        outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    ) {
        let (read_half, write_half) = stream.into_split();
        tokio::spawn(write_loop(self.id, write_half, outbound_rx));

        let handler = Arc::clone(self);
        tokio::spawn(async move {
            handler.read_loop(read_half).await;
        });
    }

    async fn read_loop(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        loop {
            let mut buf = BytesMut::with_capacity(READ_CHUNK);
            match read_half.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!(connection = %self.id, peer = %self.peer_addr, "peer closed connection");
                    break;
                },
                Ok(n) => {
                    trace!(connection = %self.id, bytes = n, "read payload");
                    self.dispatch(buf.freeze());
                },
                Err(e) => {
                    debug!(connection = %self.id, error = %e, "read failed");
                    break;
                },
            }
        }
        self.disconnected();
    }

    /// Queue one payload on the worker pool.
    ///
    /// The work item holds only a weak handler reference; if the
    /// connection is gone by the time a worker runs it, the work is
    /// dropped silently.
    fn dispatch(self: &Arc<Self>, payload: Bytes) {
        let weak = Arc::downgrade(self);
        self.pool.execute(move || {
            if let Some(handler) = weak.upgrade() {
                let service = Arc::clone(&handler.service);
                service.handle(&handler, payload);
            }
        });
    }

    fn disconnected(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.unregister(self.id);
        }
    }
}

impl fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// Writer task: the socket's owning task for all outbound traffic.
///
/// Deliberately captures only the write half and the byte queue, never the
/// handler, so late-arriving writes cannot resurrect a dead handler.
async fn write_loop(
    id: ConnectionId,
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(bytes) = outbound.recv().await {
        if let Err(e) = write_half.write_all(&bytes).await {
            debug!(connection = %id, error = %e, "write failed; closing writer");
            break;
        }
    }
    let _ = write_half.shutdown().await;
    trace!(connection = %id, "writer task stopped");
}
