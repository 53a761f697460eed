//! Framelink echo server
//!
//! Serves length-framed binary messages over TCP and WebSocket and writes
//! every valid frame back to its sender.

use std::future;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn};
use tracing_subscriber::{fmt, EnvFilter};

use framelink::config::ServerConfig;
use framelink::net::{Conn, ConnectionRegistry, Session, TcpServer, WsServer};
use framelink::{Frame, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Initialize logging
    init_logging();

    info!("Framelink echo server v{}", VERSION);

    // Load configuration
    let config = ServerConfig::load()
        .await
        .context("Failed to load configuration")?;
    info!(
        "Configuration loaded from: {}",
        config.config_path.display()
    );

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let registry = Arc::new(ConnectionRegistry::new());
    let mut servers = JoinSet::new();

    if config.tcp_enabled {
        let server = TcpServer::new(EchoSession::default, config.transport.clone())
            .with_registry(registry.clone())
            .with_span(info_span!("tcp"));
        let addr = config.tcp_addr.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        servers.spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.recv().await;
            };
            server
                .start_with_shutdown(&addr, shutdown)
                .await
                .with_context(|| format!("TCP server on {} failed", addr))
        });
    }

    if config.websocket_enabled {
        let server = WsServer::new(EchoSession::default, config.transport.clone())
            .with_registry(registry.clone())
            .with_span(info_span!("websocket"));
        let addr = config.websocket_addr.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        servers.spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.recv().await;
            };
            server
                .start_with_shutdown(&addr, shutdown)
                .await
                .with_context(|| format!("WebSocket server on {} failed", addr))
        });
    }

    info!("Server startup complete!");

    // Wait for a shutdown signal, or for a server to fail early
    let mut failure = None;
    tokio::select! {
        _ = wait_for_shutdown() => {}
        Some(joined) = servers.join_next() => {
            failure = server_failure(joined);
        }
    }

    info!("Shutting down server...");
    let _ = shutdown_tx.send(());

    while let Some(joined) = servers.join_next().await {
        if let Some(e) = server_failure(joined) {
            error!("{:#}", e);
        }
    }

    registry.close_all();
    info!("All connections closed");

    match failure {
        Some(e) => Err(e),
        None => {
            info!("Server shutdown complete. Goodbye!");
            Ok(())
        }
    }
}

/// Initialize the logging/tracing system
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,framelink=debug"));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    // Structured output for log shippers
    if std::env::var("FRAMELINK_LOG_JSON").is_ok_and(|v| v == "1" || v == "true") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn server_failure(
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> Option<anyhow::Error> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => Some(anyhow::Error::new(e).context("Server task panicked")),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

/// Writes every valid frame back to its sender
#[derive(Default)]
struct EchoSession {
    conn: Mutex<Option<Arc<dyn Conn>>>,
}

impl Session for EchoSession {
    fn on_connect(&self, conn: Arc<dyn Conn>) {
        info!(
            conn_id = conn.id(),
            remote = %conn.remote_addr(),
            transport = %conn.kind(),
            "Client connected"
        );
        *self.conn.lock() = Some(conn);
    }

    fn on_message(&self, data: Bytes) {
        let Some(conn) = self.conn.lock().clone() else {
            return;
        };

        match Frame::decode_bytes(data) {
            Ok(frame) => {
                debug!(
                    conn_id = conn.id(),
                    len = frame.length,
                    extend = frame.extend,
                    "Echoing frame"
                );
                if let Err(e) = conn.write_frame(&frame) {
                    warn!(conn_id = conn.id(), error = %e, "Echo failed");
                }
            }
            Err(e) => {
                warn!(conn_id = conn.id(), error = %e, "Malformed frame, closing");
                conn.close();
            }
        }
    }

    fn on_disconnect(&self) {
        if let Some(conn) = self.conn.lock().take() {
            info!(conn_id = conn.id(), "Client disconnected");
        }
    }
}
