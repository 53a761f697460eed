//! Framelink Library
//!
//! Session-oriented networking over TCP and WebSocket. Every connection
//! carries length-framed binary messages and drives an application
//! [`Session`] through connect, message and disconnect callbacks.
//!
//! ## Modules
//!
//! - `config` - Transport tunables and host configuration
//! - `error` - Error types and result definitions
//! - `net` - Servers, connections, pumps and the session contract
//! - `protocol` - Frame layout and the stream boundary detector

pub mod config;
pub mod error;
pub mod net;
pub mod protocol;

// Re-export commonly used types
pub use config::{ServerConfig, TransportConfig};
pub use error::{FramelinkError, Result};
pub use net::{Conn, Server, Session, SessionFactory, TcpServer, WsServer};
pub use protocol::Frame;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
