//! exbridge error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Connection closed: expected {expected} bytes, received {received}")]
    ConnectionClosed { expected: usize, received: usize },

    #[error("Schema parse error: {0}")]
    SchemaParse(String),

    #[error("Batch decode error: {0}")]
    BatchDecode(String),

    #[error("Forwarder error: {0}")]
    Forwarder(String),

    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    #[error("Frame too large: {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::ser::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl BridgeError {
    /// True when the peer went away rather than sending something invalid.
    pub fn is_peer_disconnect(&self) -> bool {
        match self {
            BridgeError::ConnectionClosed { .. } => true,
            BridgeError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
