//! Connection handler module
//!
//! Binds one accepted socket to a fresh session and connection, then runs
//! the transport pumps until the connection closes:
//! - TCP sockets are served directly
//! - WebSocket sockets are upgraded first
//! - the connection is registered for the duration of its pumps

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::config::TransportConfig;
use crate::error::Result;
use crate::net::connection::{Conn, Connection};
use crate::net::registry::ConnectionRegistry;
use crate::net::session::SessionFactory;
use crate::net::transport::{TcpTransport, Transport, WebSocketTransport};

/// Connection handler shared by the accept loop of one server
#[derive(Clone)]
pub struct ConnectionHandler {
    /// Creates one session per connection
    factory: Arc<dyn SessionFactory>,
    /// Transport tunables
    config: Arc<TransportConfig>,
    /// Live connections of this server
    registry: Arc<ConnectionRegistry>,
    /// Parent span of every connection span
    span: Span,
}

impl ConnectionHandler {
    /// Create a new connection handler
    pub fn new(factory: impl SessionFactory, config: TransportConfig) -> Self {
        if let Err(e) = config.validate() {
            warn!(error = %e, "Transport config out of range, clamping where needed");
        }
        Self {
            factory: Arc::new(factory),
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            span: Span::current(),
        }
    }

    /// Share a registry with other handlers
    pub fn with_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Parent span for connection spans
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Handle a TCP connection
    pub async fn handle_tcp(&self, stream: TcpStream) -> Result<()> {
        if self.config.tcp_nodelay {
            stream.set_nodelay(true)?;
        }

        let transport = TcpTransport::new(stream)?;
        self.serve(transport).await;
        Ok(())
    }

    /// Upgrade and handle a WebSocket connection
    pub async fn handle_websocket(&self, stream: TcpStream) -> Result<()> {
        if self.config.tcp_nodelay {
            stream.set_nodelay(true)?;
        }

        let transport = WebSocketTransport::accept(stream, self.config.handshake_timeout()).await?;
        info!(remote = %transport.remote_addr(), "WebSocket connection established");

        self.serve(transport).await;
        Ok(())
    }

    /// Bind a transport to a new session and run it to completion
    pub async fn serve<T: Transport>(&self, transport: T) {
        let id = self.registry.next_id();
        let span = info_span!(
            parent: &self.span,
            "connection",
            conn_id = id,
            peer = %transport.remote_addr(),
            transport = %transport.kind(),
        );

        let session = self.factory.create();
        let (connection, outbound) = Connection::new(
            id,
            transport.kind(),
            transport.local_addr(),
            transport.remote_addr(),
            session,
            self.config.outbound_queue_capacity,
            span.clone(),
        );

        async move {
            debug!("Connection opened");

            if !connection.open() {
                debug!("Session closed the connection during connect");
                return;
            }
            if !self.registry.insert(connection.clone()) {
                return;
            }
            // Unregisters and closes even if the pumps unwind
            let _registration = Registration {
                registry: &self.registry,
                connection: &connection,
            };

            transport
                .run(connection.clone(), outbound, self.config.clone())
                .await;

            debug!(age = ?connection.age(), "Connection finished");
        }
        .instrument(span)
        .await
    }
}

/// Registry entry of a serving connection
struct Registration<'a> {
    registry: &'a ConnectionRegistry,
    connection: &'a Arc<Connection>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.connection.id());
        self.connection.close();
    }
}
