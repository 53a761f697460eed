//! Networking module
//!
//! This module handles all network-related functionality:
//! - TCP stream sockets with length-enveloped frames
//! - WebSocket sockets with one frame per binary message
//! - Per-connection read and write pumps
//! - Connection lifecycle and the session callbacks it drives

pub mod buffer;
pub mod connection;
pub mod handler;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use connection::{Conn, Connection, ConnectionId, ConnectionState, TransportKind};
pub use handler::ConnectionHandler;
pub use registry::ConnectionRegistry;
pub use server::{Acceptor, Server, TcpServer, WsServer};
pub use session::{Session, SessionFactory};
pub use transport::{TcpTransport, Transport, WebSocketTransport};
