//! exbridge common - shared types, errors, and configuration

pub mod config;
pub mod error;
pub mod types;

pub use config::{BridgeConfig, NodeAddr, DEFAULT_MAX_FRAME_BYTES};
pub use error::{BridgeError, Result};
pub use types::{QueryId, SessionId, SessionState, SessionSummary, MAX_QUERY_ID_BYTES, MAX_TOKEN_BYTES};
