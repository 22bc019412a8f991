//! exbridge configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Default cap on a single declared frame length (256 MiB). A configured
/// cap of 0 disables the check.
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

/// Network address for the listener or the downstream sink
#[derive(Debug, Clone, Serialize, Deserialize, Hash, Eq, PartialEq)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn to_socket_addr(&self) -> std::io::Result<SocketAddr> {
        use std::net::ToSocketAddrs;
        let addr = format!("{}:{}", self.host, self.port);
        addr.to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid address"))
    }

    /// gRPC endpoint URL, as tonic expects it.
    pub fn to_endpoint(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            format!("{}:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address the export client connects to
    pub listen_addr: NodeAddr,

    /// Arrow Flight endpoint that receives the forwarded batches
    pub sink_addr: NodeAddr,

    /// Largest frame length accepted off the wire; 0 disables the check
    pub max_frame_bytes: u32,

    /// Per-frame read timeout in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_timeout_secs: Option<u64>,

    /// Timeout for connecting to the sink, in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sink_timeout_secs: Option<u64>,

    /// Max concurrent sessions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,

    /// Reject unknown column type tags instead of reading them as VARCHAR
    pub strict_types: bool,

    /// Shared secret expected as the first frame of every connection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// Batches buffered between a session and its sink stream
    pub sink_channel_capacity: usize,

    /// Expect a compression code after the query id
    pub negotiate_compression: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: NodeAddr::new("0.0.0.0", 9999),
            sink_addr: NodeAddr::new("127.0.0.1", 50051),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            read_timeout_secs: None,
            sink_timeout_secs: None,
            max_connections: None,
            strict_types: false,
            auth_token: None,
            sink_channel_capacity: 16,
            negotiate_compression: false,
        }
    }
}

impl BridgeConfig {
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Self, crate::BridgeError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| crate::BridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), crate::BridgeError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), crate::BridgeError> {
        if self.sink_channel_capacity == 0 {
            return Err(crate::BridgeError::Config(
                "sink_channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_connections == Some(0) {
            return Err(crate::BridgeError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if let Some(token) = &self.auth_token {
            if token.is_empty() || token.len() > crate::types::MAX_TOKEN_BYTES {
                return Err(crate::BridgeError::Config(format!(
                    "auth_token must be 1..={} bytes",
                    crate::types::MAX_TOKEN_BYTES
                )));
            }
        }
        Ok(())
    }

    /// Frame cap to enforce, if any.
    pub fn frame_limit(&self) -> Option<u32> {
        (self.max_frame_bytes > 0).then_some(self.max_frame_bytes)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_secs.map(Duration::from_secs)
    }

    pub fn sink_timeout(&self) -> Option<Duration> {
        self.sink_timeout_secs.map(Duration::from_secs)
    }
}
