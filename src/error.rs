//! Error handling module
//!
//! Defines the error types shared by the codec, the connections and the servers.

use std::io;

use thiserror::Error;

/// Main error type for framelink
#[derive(Error, Debug)]
pub enum FramelinkError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Frame format errors
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,

    #[error("Write buffer full")]
    WriteBufferFull,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Write error: {0}")]
    WriteError(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Accept error: {0}")]
    Accept(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Frame format errors
///
/// Every variant is fatal to the connection that produced it: the stream
/// cannot be resynchronised once a boundary is lost.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {len} bytes (min: {min})")]
    TooShort { len: usize, min: usize },

    #[error("Frame length is zero")]
    ZeroLength,

    #[error("Frame length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: u64, actual: u64 },

    #[error("Frame too large: {size} bytes (max: {max})")]
    TooLarge { size: u64, max: usize },

    #[error("Stream ended inside a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
}

/// Result type alias for framelink operations
pub type Result<T> = std::result::Result<T, FramelinkError>;

impl FramelinkError {
    /// Whether this error means the peer went away rather than misbehaved
    pub fn is_disconnect(&self) -> bool {
        match self {
            FramelinkError::Network(NetworkError::ConnectionClosed) => true,
            FramelinkError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
