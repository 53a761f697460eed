//! Connection module
//!
//! One [`Connection`] exists per accepted socket. It owns the bound session,
//! the outbound queue and the close gate; the transport pumps own the socket.
//!
//! Lifecycle is `Serving -> Closed`, one way. Closing runs exactly once no
//! matter how many callers race: it calls [`Session::on_disconnect`] while
//! holding the gate and then raises the close signal that stops both pumps,
//! which release the socket.

use std::cell::Cell;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::ReentrantMutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, warn, Span};

use crate::error::{NetworkError, Result};
use crate::net::session::Session;
use crate::protocol::frame::{self, Frame};

/// Unique connection identifier
pub type ConnectionId = u64;

/// Underlying socket type of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Stream socket, frames carry a length envelope
    Tcp,
    /// Message socket, one frame per binary message
    WebSocket,
}

impl TransportKind {
    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::WebSocket => "websocket",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Pumps are running
    Serving,
    /// Closed, never reopens
    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Serving => "Serving",
            ConnectionState::Closed => "Closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Connection capability exposed to the application
pub trait Conn: Send + Sync {
    /// Server-unique connection id
    fn id(&self) -> ConnectionId;

    /// Socket type
    fn kind(&self) -> TransportKind;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    /// The session bound to this connection, while the connection is alive
    fn session(&self) -> Option<Arc<dyn Session>>;

    /// Queue one encoded frame for transmission
    ///
    /// Never waits on the socket. Fails with `WriteBufferFull` when the
    /// outbound queue is at capacity (the frame is dropped) and with
    /// `ConnectionClosed` once the connection is closed.
    fn write(&self, frame: Bytes) -> Result<()>;

    /// Encode and queue a frame
    fn write_frame(&self, frame: &Frame) -> Result<()> {
        self.write(frame.encode())
    }

    /// Close the connection; repeated calls are no-ops
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A live connection
pub struct Connection {
    id: ConnectionId,
    kind: TransportKind,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    session: Arc<dyn Session>,
    /// Producer side of the outbound queue; the write pump holds the receiver
    outbound: mpsc::Sender<Bytes>,
    /// Close gate, also held while delivering messages
    gate: ReentrantMutex<Cell<ConnectionState>>,
    /// Lock-free mirror of the gate for `is_closed`
    closed: AtomicBool,
    /// Close signal observed by both pumps
    closed_tx: watch::Sender<bool>,
    created_at: Instant,
    span: Span,
}

impl Connection {
    /// Create a connection and the receiving end of its outbound queue
    pub fn new(
        id: ConnectionId,
        kind: TransportKind,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        session: Arc<dyn Session>,
        queue_capacity: usize,
        span: Span,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (outbound, outbound_rx) = mpsc::channel(queue_capacity.max(1));
        let (closed_tx, _) = watch::channel(false);
        let connection = Arc::new(Self {
            id,
            kind,
            local_addr,
            remote_addr,
            session,
            outbound,
            gate: ReentrantMutex::new(Cell::new(ConnectionState::Serving)),
            closed: AtomicBool::new(false),
            closed_tx,
            created_at: Instant::now(),
            span,
        });
        (connection, outbound_rx)
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::Acquire) {
            ConnectionState::Closed
        } else {
            ConnectionState::Serving
        }
    }

    /// Tracing span of this connection
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time since the connection was accepted
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Fire `on_connect`; returns false if the session closed the connection
    pub(crate) fn open(self: &Arc<Self>) -> bool {
        let gate = self.gate.lock();
        if gate.get() != ConnectionState::Serving {
            return false;
        }
        let handle: Arc<dyn Conn> = Arc::new(ConnHandle::new(self));
        self.session.on_connect(handle);
        gate.get() == ConnectionState::Serving
    }

    /// Hand one inbound frame to the session
    ///
    /// Returns false once the connection is closed; the frame is dropped
    /// without reaching the session in that case.
    pub(crate) fn deliver(&self, frame: Bytes) -> bool {
        let gate = self.gate.lock();
        if gate.get() != ConnectionState::Serving {
            return false;
        }
        self.session.on_message(frame);
        gate.get() == ConnectionState::Serving
    }
}

impl Conn for Connection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn session(&self) -> Option<Arc<dyn Session>> {
        Some(self.session.clone())
    }

    fn write(&self, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed.into());
        }
        frame::validate(&payload)?;

        match self.outbound.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(parent: &self.span, conn_id = self.id, "Outbound queue full, frame dropped");
                Err(NetworkError::WriteBufferFull.into())
            }
            Err(TrySendError::Closed(_)) => Err(NetworkError::ConnectionClosed.into()),
        }
    }

    fn close(&self) {
        let gate = self.gate.lock();
        if gate.get() == ConnectionState::Closed {
            return;
        }
        gate.set(ConnectionState::Closed);
        self.closed.store(true, Ordering::Release);

        debug!(
            parent: &self.span,
            conn_id = self.id,
            age = ?self.age(),
            "Connection closed"
        );
        self.session.on_disconnect();
        drop(gate);

        self.closed_tx.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .field("age", &self.age())
            .finish()
    }
}

/// Handle given to sessions
///
/// Holds the connection weakly so that a session keeping its handle does not
/// keep the connection (and itself) alive after the pumps are gone.
struct ConnHandle {
    id: ConnectionId,
    kind: TransportKind,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    inner: Weak<Connection>,
}

impl ConnHandle {
    fn new(connection: &Arc<Connection>) -> Self {
        Self {
            id: connection.id,
            kind: connection.kind,
            local_addr: connection.local_addr,
            remote_addr: connection.remote_addr,
            inner: Arc::downgrade(connection),
        }
    }
}

impl Conn for ConnHandle {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn session(&self) -> Option<Arc<dyn Session>> {
        self.inner.upgrade().and_then(|c| c.session())
    }

    fn write(&self, frame: Bytes) -> Result<()> {
        match self.inner.upgrade() {
            Some(connection) => connection.write(frame),
            None => Err(NetworkError::ConnectionClosed.into()),
        }
    }

    fn close(&self) {
        if let Some(connection) = self.inner.upgrade() {
            connection.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.upgrade().map_or(true, |c| c.is_closed())
    }
}
