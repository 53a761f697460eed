//! Configuration module
//!
//! Transport tunables shared by every connection, and the host configuration
//! loaded from a TOML file plus environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::{ENVELOPE_SIZE, FRAME_OVERHEAD};

/// Shortest keepalive period handed to the pumps
const MIN_KEEPALIVE_MS: u64 = 1;

/// Per-connection transport tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Deadline for a single outbound write, in milliseconds
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,

    /// Peer idle window in milliseconds
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_ms: u64,

    /// Keepalive period in milliseconds (defaults to 90% of the peer timeout)
    #[serde(default)]
    pub keepalive_period_ms: Option<u64>,

    /// Bound of the per-connection outbound queue
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Initial size of the stream read buffer
    #[serde(default = "default_read_buffer_initial")]
    pub read_buffer_initial: usize,

    /// Hard cap of the stream read buffer
    #[serde(default = "default_read_buffer_max")]
    pub read_buffer_max: usize,

    /// Deadline for the WebSocket upgrade handshake, in milliseconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Disable Nagle's algorithm on accepted sockets
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
}

/// Host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Listen address of the TCP server
    #[serde(default = "default_tcp_addr")]
    pub tcp_addr: String,

    /// Listen address of the WebSocket server
    #[serde(default = "default_websocket_addr")]
    pub websocket_addr: String,

    /// Run the TCP server
    #[serde(default = "default_true")]
    pub tcp_enabled: bool,

    /// Run the WebSocket server
    #[serde(default = "default_true")]
    pub websocket_enabled: bool,

    /// Transport tunables
    #[serde(default)]
    pub transport: TransportConfig,
}

fn default_write_wait() -> u64 {
    10_000
}

fn default_peer_timeout() -> u64 {
    7_000
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_read_buffer_initial() -> usize {
    512
}

fn default_read_buffer_max() -> usize {
    65536
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_tcp_addr() -> String {
    "0.0.0.0:7300".to_string()
}

fn default_websocket_addr() -> String {
    "0.0.0.0:7301".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            write_wait_ms: default_write_wait(),
            peer_timeout_ms: default_peer_timeout(),
            keepalive_period_ms: None,
            outbound_queue_capacity: default_outbound_queue_capacity(),
            read_buffer_initial: default_read_buffer_initial(),
            read_buffer_max: default_read_buffer_max(),
            handshake_timeout_ms: default_handshake_timeout(),
            tcp_nodelay: default_true(),
        }
    }
}

impl TransportConfig {
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    /// Keepalive period, 90% of the peer timeout unless set explicitly
    ///
    /// Never zero, even for configs that skipped [`validate`](Self::validate).
    pub fn keepalive_period(&self) -> Duration {
        Duration::from_millis(self.configured_keepalive_ms().max(MIN_KEEPALIVE_MS))
    }

    fn configured_keepalive_ms(&self) -> u64 {
        match self.keepalive_period_ms {
            Some(ms) => ms,
            None => self.peer_timeout_ms.saturating_mul(9) / 10,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Validate the transport tunables
    pub fn validate(&self) -> Result<()> {
        if self.write_wait_ms == 0 {
            anyhow::bail!("Write wait must be greater than zero");
        }
        if self.peer_timeout_ms == 0 {
            anyhow::bail!("Peer timeout must be greater than zero");
        }
        let keepalive = self.configured_keepalive_ms();
        if keepalive == 0 {
            anyhow::bail!("Keepalive period must be greater than zero");
        }
        if keepalive >= self.peer_timeout_ms {
            anyhow::bail!("Keepalive period must be shorter than the peer timeout");
        }
        if self.outbound_queue_capacity == 0 {
            anyhow::bail!("Outbound queue capacity must be greater than zero");
        }
        if self.read_buffer_initial == 0 || self.read_buffer_initial > self.read_buffer_max {
            anyhow::bail!("Read buffer initial size must be between 1 and the maximum size");
        }
        if self.read_buffer_max < ENVELOPE_SIZE + FRAME_OVERHEAD {
            anyhow::bail!(
                "Read buffer maximum must hold at least {} bytes",
                ENVELOPE_SIZE + FRAME_OVERHEAD
            );
        }
        if self.handshake_timeout_ms == 0 {
            anyhow::bail!("Handshake timeout must be greater than zero");
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/framelink.toml"),
            tcp_addr: default_tcp_addr(),
            websocket_addr: default_websocket_addr(),
            tcp_enabled: default_true(),
            websocket_enabled: default_true(),
            transport: TransportConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        let config_path = env::var("FRAMELINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/framelink.toml"));

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

            Self::from_toml(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("FRAMELINK_TCP_ADDR") {
            self.tcp_addr = val;
        }
        if let Ok(val) = env::var("FRAMELINK_WEBSOCKET_ADDR") {
            self.websocket_addr = val;
        }
        if let Ok(val) = env::var("FRAMELINK_TCP_ENABLED") {
            self.tcp_enabled = parse_flag(&val);
        }
        if let Ok(val) = env::var("FRAMELINK_WEBSOCKET_ENABLED") {
            self.websocket_enabled = parse_flag(&val);
        }
        if let Ok(val) = env::var("FRAMELINK_WRITE_WAIT_MS") {
            if let Ok(ms) = val.parse() {
                self.transport.write_wait_ms = ms;
            }
        }
        if let Ok(val) = env::var("FRAMELINK_PEER_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.transport.peer_timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var("FRAMELINK_KEEPALIVE_PERIOD_MS") {
            if let Ok(ms) = val.parse() {
                self.transport.keepalive_period_ms = Some(ms);
            }
        }
        if let Ok(val) = env::var("FRAMELINK_OUTBOUND_QUEUE_CAPACITY") {
            if let Ok(capacity) = val.parse() {
                self.transport.outbound_queue_capacity = capacity;
            }
        }
        if let Ok(val) = env::var("FRAMELINK_READ_BUFFER_MAX") {
            if let Ok(max) = val.parse() {
                self.transport.read_buffer_max = max;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.tcp_enabled && !self.websocket_enabled {
            anyhow::bail!("At least one of the TCP and WebSocket servers must be enabled");
        }
        if self.tcp_enabled && self.websocket_enabled && self.tcp_addr == self.websocket_addr {
            anyhow::bail!("TCP and WebSocket servers must listen on different addresses");
        }
        self.transport.validate()
    }
}

fn parse_flag(val: &str) -> bool {
    val.to_lowercase() == "true" || val == "1"
}
