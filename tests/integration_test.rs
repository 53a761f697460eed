//! Integration tests over loopback sockets
//!
//! These tests verify the end-to-end behavior of:
//! - TCP framing, echo and the session callback order
//! - WebSocket upgrade and message round trips
//! - Accept loop recovery after transient errors
//! - Keepalive pings, idle peers and stalled readers
//! - Shutdown closing every live connection

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use framelink::net::{Acceptor, Conn, ConnectionRegistry, Session, TcpServer, WsServer};
use framelink::protocol::frame::envelope;
use framelink::{Frame, TransportConfig};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Connect,
    Message(Bytes),
    Disconnect,
}

/// Session that reports every callback and echoes each frame back
struct Probe {
    events: mpsc::UnboundedSender<Event>,
    conn: Mutex<Option<Arc<dyn Conn>>>,
}

impl Session for Probe {
    fn on_connect(&self, conn: Arc<dyn Conn>) {
        *self.conn.lock() = Some(conn);
        let _ = self.events.send(Event::Connect);
    }

    fn on_message(&self, frame: Bytes) {
        let _ = self.events.send(Event::Message(frame.clone()));
        let conn = self.conn.lock().clone();
        if let Some(conn) = conn {
            let _ = conn.write(frame);
        }
    }

    fn on_disconnect(&self) {
        let _ = self.events.send(Event::Disconnect);
    }
}

/// A running server plus the handles a test needs to drive it
struct Harness {
    addr: SocketAddr,
    events: mpsc::UnboundedReceiver<Event>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Harness {
    async fn next_event(&mut self) -> Event {
        timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("event channel closed")
    }

    async fn wait_for_count(&self, count: usize) {
        timeout(WAIT, async {
            while self.registry.count() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("unexpected number of registered connections");
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        timeout(WAIT, self.task)
            .await
            .expect("server did not stop")
            .unwrap();
    }
}

enum Kind {
    Tcp,
    WebSocket,
}

async fn start(kind: Kind, acceptor: impl Acceptor) -> Harness {
    start_with(kind, acceptor, TransportConfig::default()).await
}

async fn start_with(kind: Kind, acceptor: impl Acceptor, config: TransportConfig) -> Harness {
    let addr = acceptor.local_addr().unwrap();
    let (events_tx, events) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let factory = move || Probe {
        events: events_tx.clone(),
        conn: Mutex::new(None),
    };
    let shutdown = async move {
        let _ = shutdown_rx.await;
    };

    let (registry, task) = match kind {
        Kind::Tcp => {
            let server = TcpServer::new(factory, config);
            let registry = server.registry().clone();
            let task = tokio::spawn(async move { server.serve(acceptor, shutdown).await });
            (registry, task)
        }
        Kind::WebSocket => {
            let server = WsServer::new(factory, config);
            let registry = server.registry().clone();
            let task = tokio::spawn(async move { server.serve(acceptor, shutdown).await });
            (registry, task)
        }
    };

    Harness {
        addr,
        events,
        registry,
        shutdown: Some(shutdown_tx),
        task,
    }
}

async fn listener() -> TcpListener {
    TcpListener::bind("127.0.0.1:0").await.unwrap()
}

async fn read_frame(stream: &mut TcpStream) -> Bytes {
    let mut header = [0u8; 8];
    timeout(WAIT, stream.read_exact(&mut header))
        .await
        .unwrap()
        .unwrap();
    let mut frame = vec![0u8; u64::from_be_bytes(header) as usize];
    timeout(WAIT, stream.read_exact(&mut frame))
        .await
        .unwrap()
        .unwrap();
    Bytes::from(frame)
}

/// Acceptor that fails a fixed number of times before accepting for real
struct FlakyAcceptor {
    listener: TcpListener,
    failures: usize,
}

impl Acceptor for FlakyAcceptor {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(io::Error::new(io::ErrorKind::Other, "transient accept failure"));
        }
        self.listener.accept().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// Test a TCP echo round trip and the callback order around it
#[tokio::test]
async fn test_tcp_echo_lifecycle() {
    let mut harness = start(Kind::Tcp, listener().await).await;
    let mut client = TcpStream::connect(harness.addr).await.unwrap();

    let frame = Frame::new(&b"PING"[..], 42).encode();
    client.write_all(&envelope(&frame)).await.unwrap();
    assert_eq!(read_frame(&mut client).await, frame);

    drop(client);

    assert_eq!(harness.next_event().await, Event::Connect);
    assert_eq!(harness.next_event().await, Event::Message(frame));
    assert_eq!(harness.next_event().await, Event::Disconnect);
    harness.wait_for_count(0).await;
    harness.stop().await;
}

/// Test that frames written back-to-back arrive in the same order
#[tokio::test]
async fn test_tcp_write_order_is_preserved() {
    let mut harness = start(Kind::Tcp, listener().await).await;
    let mut client = TcpStream::connect(harness.addr).await.unwrap();

    let frames: Vec<Bytes> = [&b"m1"[..], &b"m2"[..], &b"m3"[..]]
        .iter()
        .map(|body| Frame::new(*body, 0).encode())
        .collect();

    // One write carrying all three frames
    let mut wire = Vec::new();
    for frame in &frames {
        wire.extend_from_slice(&envelope(frame));
    }
    client.write_all(&wire).await.unwrap();

    for frame in &frames {
        assert_eq!(&read_frame(&mut client).await, frame);
    }

    assert_eq!(harness.next_event().await, Event::Connect);
    for frame in &frames {
        assert_eq!(harness.next_event().await, Event::Message(frame.clone()));
    }
    harness.stop().await;
}

/// Test that a zero-length frame ends the connection
#[tokio::test]
async fn test_tcp_zero_length_frame_closes_connection() {
    let mut harness = start(Kind::Tcp, listener().await).await;
    let mut client = TcpStream::connect(harness.addr).await.unwrap();

    client.write_all(&[0u8; 8]).await.unwrap();

    assert_eq!(harness.next_event().await, Event::Connect);
    assert_eq!(harness.next_event().await, Event::Disconnect);

    let mut rest = Vec::new();
    let read = timeout(WAIT, client.read_to_end(&mut rest)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    harness.wait_for_count(0).await;
    harness.stop().await;
}

/// Test that the server survives accept errors and serves the next client
#[tokio::test]
async fn test_server_recovers_from_accept_errors() {
    let acceptor = FlakyAcceptor {
        listener: listener().await,
        failures: 3,
    };
    let mut harness = start(Kind::Tcp, acceptor).await;
    let mut client = TcpStream::connect(harness.addr).await.unwrap();

    let frame = Frame::new(&b"after errors"[..], 7).encode();
    client.write_all(&envelope(&frame)).await.unwrap();
    assert_eq!(read_frame(&mut client).await, frame);
    drop(client);

    assert_eq!(harness.next_event().await, Event::Connect);
    assert_eq!(harness.next_event().await, Event::Message(frame));
    assert_eq!(harness.next_event().await, Event::Disconnect);
    harness.stop().await;
}

/// Test a WebSocket echo round trip
#[tokio::test]
async fn test_websocket_echo_lifecycle() {
    let mut harness = start(Kind::WebSocket, listener().await).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", harness.addr))
        .await
        .unwrap();

    let frame = Frame::new(&b"over websocket"[..], 9).encode();
    ws.send(Message::Binary(frame.to_vec())).await.unwrap();

    let echoed = timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => break Bytes::from(data),
                Some(Ok(_)) => continue,
                other => panic!("unexpected websocket read: {:?}", other),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(echoed, frame);

    ws.close(None).await.unwrap();

    assert_eq!(harness.next_event().await, Event::Connect);
    assert_eq!(harness.next_event().await, Event::Message(frame));
    assert_eq!(harness.next_event().await, Event::Disconnect);
    harness.wait_for_count(0).await;
    harness.stop().await;
}

/// Test that shutting a server down closes its live connections
#[tokio::test]
async fn test_shutdown_closes_connections() {
    let mut harness = start(Kind::Tcp, listener().await).await;
    let mut client = TcpStream::connect(harness.addr).await.unwrap();

    assert_eq!(harness.next_event().await, Event::Connect);
    harness.wait_for_count(1).await;

    harness.shutdown.take().unwrap().send(()).unwrap();
    assert_eq!(harness.next_event().await, Event::Disconnect);

    let mut rest = Vec::new();
    let read = timeout(WAIT, client.read_to_end(&mut rest)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    harness.wait_for_count(0).await;
    harness.stop().await;
}

/// Test that an idle WebSocket peer is pinged, then dropped after the peer timeout
#[tokio::test]
async fn test_websocket_idle_peer_is_pinged_then_dropped() {
    let config = TransportConfig {
        peer_timeout_ms: 400,
        keepalive_period_ms: Some(100),
        ..Default::default()
    };
    let mut harness = start_with(Kind::WebSocket, listener().await, config).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", harness.addr))
        .await
        .unwrap();

    // Read up to the first ping, then go silent: no pong, no data
    let first = timeout(WAIT, ws.next()).await.unwrap();
    assert!(matches!(first, Some(Ok(Message::Ping(_)))));

    assert_eq!(harness.next_event().await, Event::Connect);
    assert_eq!(harness.next_event().await, Event::Disconnect);
    harness.wait_for_count(0).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.events.try_recv().is_err());

    drop(ws);
    harness.stop().await;
}

/// Test that a peer which stops reading trips the write deadline
#[tokio::test]
async fn test_stalled_reader_hits_write_deadline() {
    let config = TransportConfig {
        write_wait_ms: 200,
        ..Default::default()
    };
    let mut harness = start_with(Kind::Tcp, listener().await, config).await;
    let mut client = TcpStream::connect(harness.addr).await.unwrap();

    // Flood the echo without ever reading it back
    let frame = Frame::new(vec![0x5A; 60_000], 1).encode();
    let wire = envelope(&frame);
    let writer = tokio::spawn(async move {
        for _ in 0..2_000 {
            if client.write_all(&wire).await.is_err() {
                break;
            }
        }
        client
    });

    assert_eq!(harness.next_event().await, Event::Connect);
    loop {
        match harness.next_event().await {
            Event::Message(_) => continue,
            Event::Disconnect => break,
            Event::Connect => panic!("second connect on one socket"),
        }
    }
    harness.wait_for_count(0).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.events.try_recv().is_err());

    let _client = timeout(WAIT, writer).await.unwrap().unwrap();
    harness.stop().await;
}
