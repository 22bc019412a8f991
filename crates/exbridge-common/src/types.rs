//! exbridge core types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Longest auth token accepted on the wire.
pub const MAX_TOKEN_BYTES: usize = 1024;

/// Longest query id accepted on the wire.
pub const MAX_QUERY_ID_BYTES: usize = 1024;

/// Query identifier sent by the export client; names the sink destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(pub String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueryId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Unique identifier of one accepted connection, for log correlation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session_{}", self.0)
    }
}

/// Lifecycle of a connection session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Accepted,
    Authenticating,
    ReadingQueryId,
    ReadingSchema,
    StreamingBatches,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Accepted => "accepted",
            SessionState::Authenticating => "authenticating",
            SessionState::ReadingQueryId => "reading_query_id",
            SessionState::ReadingSchema => "reading_schema",
            SessionState::StreamingBatches => "streaming_batches",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Totals reported when a session completes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub query_id: QueryId,
    pub rows: u64,
    pub batches: u64,
    pub payload_bytes: u64,
    pub null_values: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl SessionSummary {
    pub fn new(session_id: SessionId, query_id: QueryId) -> Self {
        Self {
            session_id,
            query_id,
            rows: 0,
            batches: 0,
            payload_bytes: 0,
            null_values: 0,
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
        }
    }

    /// Account for one decoded batch.
    pub fn record_batch(&mut self, rows: usize, payload_bytes: usize, null_values: usize) {
        self.rows += rows as u64;
        self.batches += 1;
        self.payload_bytes += payload_bytes as u64;
        self.null_values += null_values as u64;
    }
}
