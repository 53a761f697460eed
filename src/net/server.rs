//! Server module
//!
//! One server per transport kind. A server runs an accept loop over an
//! [`Acceptor`], hands every accepted socket to its [`ConnectionHandler`] on a
//! fresh task and closes all of its connections once the shutdown future
//! resolves.

use std::future::{self, Future};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::config::TransportConfig;
use crate::error::{NetworkError, Result};
use crate::net::connection::TransportKind;
use crate::net::handler::ConnectionHandler;
use crate::net::registry::ConnectionRegistry;
use crate::net::session::SessionFactory;

/// First pause after a failed accept
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);

/// Longest pause between failed accepts
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Source of accepted stream sockets
pub trait Acceptor: Send + 'static {
    /// Wait for the next inbound connection
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Acceptor for TcpListener {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// A listening server
#[async_trait]
pub trait Server: Send + Sync {
    /// Transport kind served
    fn kind(&self) -> TransportKind;

    /// Bind `addr` and serve until the process ends
    ///
    /// Returns only on a fatal error such as a failed bind.
    async fn start(&self, addr: &str) -> Result<()>;
}

/// Stream socket server
pub struct TcpServer {
    handler: ConnectionHandler,
}

impl TcpServer {
    pub fn new(factory: impl SessionFactory, config: TransportConfig) -> Self {
        Self {
            handler: ConnectionHandler::new(factory, config),
        }
    }

    /// Share a registry with other servers
    pub fn with_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.handler = self.handler.with_registry(registry);
        self
    }

    /// Parent span for everything this server logs
    pub fn with_span(mut self, span: Span) -> Self {
        self.handler = self.handler.with_span(span);
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.handler.registry()
    }

    /// Accept from `acceptor` until `shutdown` resolves, then close every
    /// connection
    pub async fn serve<A, S>(&self, acceptor: A, shutdown: S)
    where
        A: Acceptor,
        S: Future<Output = ()> + Send,
    {
        serve_with(&self.handler, TransportKind::Tcp, acceptor, shutdown).await
    }

    /// Bind `addr` and serve until `shutdown` resolves
    pub async fn start_with_shutdown<S>(&self, addr: &str, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        let listener = bind(addr).await?;
        self.serve(listener, shutdown).await;
        Ok(())
    }
}

#[async_trait]
impl Server for TcpServer {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn start(&self, addr: &str) -> Result<()> {
        self.start_with_shutdown(addr, future::pending()).await
    }
}

/// WebSocket server
///
/// Upgrades every accepted socket on its own task, bounded by the handshake
/// timeout, so a slow client never stalls the accept loop.
pub struct WsServer {
    handler: ConnectionHandler,
}

impl WsServer {
    pub fn new(factory: impl SessionFactory, config: TransportConfig) -> Self {
        Self {
            handler: ConnectionHandler::new(factory, config),
        }
    }

    /// Share a registry with other servers
    pub fn with_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.handler = self.handler.with_registry(registry);
        self
    }

    /// Parent span for everything this server logs
    pub fn with_span(mut self, span: Span) -> Self {
        self.handler = self.handler.with_span(span);
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.handler.registry()
    }

    /// Accept from `acceptor` until `shutdown` resolves, then close every
    /// connection
    pub async fn serve<A, S>(&self, acceptor: A, shutdown: S)
    where
        A: Acceptor,
        S: Future<Output = ()> + Send,
    {
        serve_with(&self.handler, TransportKind::WebSocket, acceptor, shutdown).await
    }

    /// Bind `addr` and serve until `shutdown` resolves
    pub async fn start_with_shutdown<S>(&self, addr: &str, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        let listener = bind(addr).await?;
        self.serve(listener, shutdown).await;
        Ok(())
    }
}

#[async_trait]
impl Server for WsServer {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn start(&self, addr: &str) -> Result<()> {
        self.start_with_shutdown(addr, future::pending()).await
    }
}

/// Resolve and bind a listening socket
async fn bind(addr: &str) -> Result<TcpListener> {
    let resolved = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| NetworkError::InvalidAddress(format!("{}: {}", addr, e)))?
        .next()
        .ok_or_else(|| NetworkError::InvalidAddress(addr.to_string()))?;

    TcpListener::bind(resolved).await.map_err(|source| {
        NetworkError::Bind {
            addr: addr.to_string(),
            source,
        }
        .into()
    })
}

async fn serve_with<A, S>(handler: &ConnectionHandler, kind: TransportKind, acceptor: A, shutdown: S)
where
    A: Acceptor,
    S: Future<Output = ()> + Send,
{
    let local = acceptor
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let span = info_span!(parent: handler.span(), "server", transport = %kind, local = %local);
    info!(parent: &span, "Server listening on: {}", local);

    accept_loop(acceptor, shutdown, &span, |stream, addr| {
        info!(parent: &span, peer = %addr, "New connection");
        let handler = handler.clone();
        tokio::spawn(
            async move {
                let result = match kind {
                    TransportKind::Tcp => handler.handle_tcp(stream).await,
                    TransportKind::WebSocket => handler.handle_websocket(stream).await,
                };
                if let Err(e) = result {
                    warn!(peer = %addr, error = %e, "Connection setup failed");
                }
            }
            .instrument(span.clone()),
        );
    })
    .await;

    handler.registry().close_all();
    info!(parent: &span, "Server stopped");
}

/// Run `on_accept` for every accepted socket until `shutdown` resolves
///
/// Accept errors never end the loop; they pause it with exponential backoff.
async fn accept_loop<A, S, F>(mut acceptor: A, shutdown: S, span: &Span, mut on_accept: F)
where
    A: Acceptor,
    S: Future<Output = ()>,
    F: FnMut(TcpStream, SocketAddr),
{
    tokio::pin!(shutdown);
    let mut backoff = ACCEPT_BACKOFF_MIN;

    loop {
        let accepted = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            result = acceptor.accept() => result,
        };

        match accepted {
            Ok((stream, addr)) => {
                backoff = ACCEPT_BACKOFF_MIN;
                on_accept(stream, addr);
            }
            Err(e) => {
                let err = NetworkError::Accept(e.to_string());
                error!(parent: span, error = %err, ?backoff, "Failed to accept connection");
                tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    _ = time::sleep(backoff) => {}
                }
                backoff = next_backoff(backoff);
            }
        }
    }

    info!(parent: span, "Accept loop shutting down");
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(ACCEPT_BACKOFF_MAX)
}
