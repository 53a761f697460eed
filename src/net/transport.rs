//! Transport module
//!
//! Each transport kind runs the same pair of pumps against a [`Connection`]:
//!
//! - the read pump turns inbound data into frames and delivers them to the
//!   session, in arrival order
//! - the write pump drains the outbound queue in FIFO order, bounds every
//!   write by the write deadline and refreshes that deadline on each
//!   keepalive tick
//!
//! Whichever pump fails first closes the connection, and the close signal
//! stops the other one. Stream sockets go through the boundary detector;
//! WebSocket messages are already delimited and bypass it.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, trace, warn, Instrument};

use crate::config::TransportConfig;
use crate::error::{NetworkError, Result};
use crate::net::buffer::FrameReader;
use crate::net::connection::{Conn, Connection, TransportKind};
use crate::protocol::frame::envelope;

/// Pump contract shared by every transport kind
pub trait Transport: Send + 'static {
    fn kind(&self) -> TransportKind;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    /// Run both pumps until the connection is closed, then release the socket
    fn run(
        self,
        connection: Arc<Connection>,
        outbound: mpsc::Receiver<Bytes>,
        config: Arc<TransportConfig>,
    ) -> impl Future<Output = ()> + Send;
}

/// Stream socket transport
pub struct TcpTransport {
    stream: TcpStream,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl TcpTransport {
    /// Wrap an accepted TCP stream
    pub fn new(stream: TcpStream) -> Result<Self> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        Ok(Self {
            stream,
            local_addr,
            remote_addr,
        })
    }
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    async fn run(
        self,
        connection: Arc<Connection>,
        outbound: mpsc::Receiver<Bytes>,
        config: Arc<TransportConfig>,
    ) {
        let (mut reader, writer) = self.stream.into_split();

        let writer_task = tokio::spawn(
            tcp_write_pump(connection.clone(), writer, outbound, config.clone())
                .instrument(connection.span().clone()),
        );

        tcp_read_pump(&connection, &mut reader, &config).await;
        connection.close();
        let _ = writer_task.await;
    }
}

async fn tcp_read_pump(connection: &Connection, reader: &mut OwnedReadHalf, config: &TransportConfig) {
    let mut frames = FrameReader::new(config.read_buffer_initial, config.read_buffer_max);
    let closed = connection.closed();
    tokio::pin!(closed);

    loop {
        tokio::select! {
            _ = &mut closed => break,
            result = frames.next_frame(reader) => match result {
                Ok(Some(frame)) => {
                    trace!(len = frame.len(), "Frame received");
                    if !connection.deliver(frame) {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Peer closed the stream");
                    break;
                }
                Err(e) if e.is_disconnect() => {
                    debug!(error = %e, "Connection lost");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Read pump failed");
                    break;
                }
            }
        }
    }
}

async fn tcp_write_pump(
    connection: Arc<Connection>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    config: Arc<TransportConfig>,
) {
    let write_wait = config.write_wait();
    let mut keepalive = keepalive_interval(config.keepalive_period());
    let closed = connection.closed();
    tokio::pin!(closed);

    loop {
        tokio::select! {
            biased;
            _ = &mut closed => break,
            message = outbound.recv() => {
                let Some(frame) = message else { break };
                let wire = envelope(&frame);
                if let Err(e) = within_deadline(write_wait, writer.write_all(&wire)).await {
                    warn!(error = %e, "Write pump failed");
                    break;
                }
                trace!(len = frame.len(), "Frame sent");
            }
            _ = keepalive.tick() => {
                if let Err(e) = within_deadline(write_wait, writer.flush()).await {
                    warn!(error = %e, "Keepalive failed");
                    break;
                }
                trace!("Write deadline refreshed");
            }
        }
    }

    connection.close();
    let _ = time::timeout(write_wait, writer.shutdown()).await;
}

/// Message socket transport
pub struct WebSocketTransport {
    stream: WebSocketStream<TcpStream>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl WebSocketTransport {
    /// Upgrade an accepted TCP stream, bounded by `handshake_timeout`
    pub async fn accept(stream: TcpStream, handshake_timeout: Duration) -> Result<Self> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;

        let stream = time::timeout(handshake_timeout, tokio_tungstenite::accept_async(stream))
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(|e| NetworkError::WebSocket(e.to_string()))?;

        Ok(Self {
            stream,
            local_addr,
            remote_addr,
        })
    }
}

impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    async fn run(
        self,
        connection: Arc<Connection>,
        outbound: mpsc::Receiver<Bytes>,
        config: Arc<TransportConfig>,
    ) {
        let (sink, stream) = self.stream.split();

        let writer_task = tokio::spawn(
            ws_write_pump(connection.clone(), sink, outbound, config.clone())
                .instrument(connection.span().clone()),
        );

        ws_read_pump(&connection, stream, &config).await;
        connection.close();
        let _ = writer_task.await;
    }
}

/// Deliver inbound messages until close, error or `peer_timeout` of silence
///
/// Text messages are delivered as frames too, as their UTF-8 bytes.
async fn ws_read_pump(
    connection: &Connection,
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    config: &TransportConfig,
) {
    let peer_timeout = config.peer_timeout();
    let closed = connection.closed();
    tokio::pin!(closed);

    loop {
        let next = tokio::select! {
            _ = &mut closed => break,
            next = time::timeout(peer_timeout, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                warn!(?peer_timeout, "Peer timed out");
                break;
            }
            Ok(None) => {
                debug!("WebSocket stream ended");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!(error = %e, "WebSocket read failed");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        let frame = match message {
            Message::Binary(data) => Bytes::from(data),
            Message::Text(text) => Bytes::from(text),
            Message::Close(_) => {
                debug!("WebSocket close message received");
                break;
            }
            // tungstenite queues pong replies itself; control traffic only
            // refreshes the idle window
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        trace!(len = frame.len(), "Message received");
        if !connection.deliver(frame) {
            break;
        }
    }
}

async fn ws_write_pump(
    connection: Arc<Connection>,
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbound: mpsc::Receiver<Bytes>,
    config: Arc<TransportConfig>,
) {
    let write_wait = config.write_wait();
    let mut keepalive = keepalive_interval(config.keepalive_period());
    let closed = connection.closed();
    tokio::pin!(closed);

    loop {
        tokio::select! {
            biased;
            _ = &mut closed => break,
            message = outbound.recv() => {
                let Some(frame) = message else { break };
                let len = frame.len();
                if let Err(e) = within_deadline(write_wait, sink.send(Message::Binary(frame.to_vec()))).await {
                    warn!(error = %e, "Write pump failed");
                    break;
                }
                trace!(len, "Message sent");
            }
            _ = keepalive.tick() => {
                if let Err(e) = within_deadline(write_wait, sink.send(Message::Ping(Vec::new()))).await {
                    warn!(error = %e, "Keepalive failed");
                    break;
                }
                trace!("Ping sent");
            }
        }
    }

    connection.close();
    let _ = time::timeout(write_wait, sink.close()).await;
}

/// Keepalive ticker; the first tick fires one period from now
fn keepalive_interval(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Run one socket write under a fresh write deadline
async fn within_deadline<F, E>(write_wait: Duration, write: F) -> Result<()>
where
    F: Future<Output = std::result::Result<(), E>>,
    E: std::fmt::Display,
{
    match time::timeout(write_wait, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(NetworkError::WriteError(e.to_string()).into()),
        Err(_) => Err(NetworkError::Timeout.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FramelinkError;

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_first_tick_after_period() {
        let start = Instant::now();
        let mut interval = keepalive_interval(Duration::from_millis(900));
        interval.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(900));
        interval.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(1800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_from_unvalidated_config() {
        let config = TransportConfig {
            peer_timeout_ms: 1,
            ..Default::default()
        };
        let start = Instant::now();
        let mut interval = keepalive_interval(config.keepalive_period());
        interval.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_within_deadline_times_out() {
        let err = within_deadline(Duration::from_millis(50), async {
            time::sleep(Duration::from_secs(1)).await;
            Ok::<(), std::io::Error>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, FramelinkError::Network(NetworkError::Timeout)));
    }

    #[tokio::test]
    async fn test_within_deadline_maps_write_error() {
        let err = within_deadline(Duration::from_secs(1), async {
            Err::<(), _>(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            FramelinkError::Network(NetworkError::WriteError(_))
        ));
    }
}
