//! Connection session
//!
//! Drives one export connection through
//! `Accepted -> [Authenticating ->] ReadingQueryId -> ReadingSchema ->
//! StreamingBatches -> Completed | Failed`.
//! On success the client gets the two-byte ack; on any failure the forwarder
//! is aborted, so the sink commits nothing, and the client gets nothing
//! before the socket goes away.

use std::sync::Arc;
use std::time::Instant;

use arrow_array::Array;
use exbridge_common::{
    BridgeConfig, BridgeError, QueryId, Result, SessionId, SessionState, SessionSummary,
    MAX_QUERY_ID_BYTES, MAX_TOKEN_BYTES,
};
use exbridge_forwarder::{StreamForwarder, StreamSink};
use exbridge_protocol::{
    BatchDecoder, ColumnSchema, CompressionCodec, Decompressor, FrameLimits, FrameReader,
    TypePolicy, ACK, UNAUTHORIZED_REPLY,
};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Per-session settings derived from [`BridgeConfig`]
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub limits: FrameLimits,
    pub type_policy: TypePolicy,
    pub auth_token: Option<String>,
    /// Read a compression code right after the query id.
    pub negotiate_compression: bool,
}

impl SessionOptions {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            limits: FrameLimits {
                max_frame_bytes: config.frame_limit(),
                read_timeout: config.read_timeout(),
            },
            type_policy: if config.strict_types {
                TypePolicy::Strict
            } else {
                TypePolicy::Permissive
            },
            auth_token: config.auth_token.clone(),
            negotiate_compression: config.negotiate_compression,
        }
    }
}

pub struct Session {
    id: SessionId,
    peer: String,
    state: SessionState,
    failed_in: Option<SessionState>,
    options: Arc<SessionOptions>,
}

impl Session {
    pub fn new(peer: impl Into<String>, options: Arc<SessionOptions>) -> Self {
        Self {
            id: SessionId::new(),
            peer: peer.into(),
            state: SessionState::Accepted,
            failed_in: None,
            options,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The state the session was in when it failed.
    pub fn failed_in(&self) -> Option<SessionState> {
        self.failed_in
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!("{} [{}] {} -> {}", self.id, self.peer, self.state, next);
        self.state = next;
    }

    /// Run the session to completion over `io`, forwarding into `sink`.
    ///
    /// `io` is dropped before this returns, which closes the connection.
    pub async fn run<S>(&mut self, io: S, sink: &dyn StreamSink) -> Result<SessionSummary>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let (reader, mut writer) = tokio::io::split(io);
        let mut frames = FrameReader::with_limits(reader, self.options.limits);

        match self.drive(&mut frames, &mut writer, sink).await {
            Ok(mut summary) => {
                summary.elapsed = started.elapsed();
                self.transition(SessionState::Completed);
                Ok(summary)
            }
            Err(e) => {
                self.failed_in = Some(self.state);
                self.transition(SessionState::Failed);
                tracing::debug!(
                    "{} [{}] read {} bytes before failing",
                    self.id,
                    self.peer,
                    frames.bytes_read()
                );
                Err(e)
            }
        }
    }

    async fn drive<R, W>(
        &mut self,
        frames: &mut FrameReader<R>,
        writer: &mut W,
        sink: &dyn StreamSink,
    ) -> Result<SessionSummary>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let options = self.options.clone();
        if let Some(token) = options.auth_token.as_deref() {
            self.transition(SessionState::Authenticating);
            authenticate(frames, writer, token).await?;
        }

        self.transition(SessionState::ReadingQueryId);
        let query_id = read_query_id(frames).await?;
        let mut decompressor = if options.negotiate_compression {
            let codec = CompressionCodec::from_code(frames.read_u32().await?)?;
            tracing::info!("{} query {} using compression {}", self.id, query_id, codec);
            Decompressor::new(codec)
        } else {
            Decompressor::new(CompressionCodec::None)
        };

        self.transition(SessionState::ReadingSchema);
        let payload = frames.read_frame().await?;
        let schema = Arc::new(ColumnSchema::parse(&payload, options.type_policy)?);
        for column in schema.columns().iter().filter(|c| c.is_remapped()) {
            tracing::debug!(
                "{} column '{}' declared as '{}', reading as {}",
                self.id,
                column.name,
                column.declared_type,
                column.logical_type
            );
        }
        tracing::info!(
            "{} [{}] query {} with {} columns",
            self.id,
            self.peer,
            query_id,
            schema.len()
        );

        self.transition(SessionState::StreamingBatches);
        let mut forwarder =
            StreamForwarder::open(sink, query_id.as_str(), schema.arrow_schema()).await?;
        let decoder = BatchDecoder::new(schema);
        let mut summary = SessionSummary::new(self.id, query_id);

        let streamed = stream_batches(
            frames,
            &mut decompressor,
            &decoder,
            &mut forwarder,
            &mut summary,
        )
        .await;
        if let Err(e) = streamed {
            forwarder.abort().await;
            return Err(e);
        }
        forwarder.close().await?;

        writer.write_all(ACK).await?;
        writer.flush().await?;
        Ok(summary)
    }
}

async fn authenticate<R, W>(frames: &mut FrameReader<R>, writer: &mut W, token: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let reason = match frames.read_frame_capped(Some(MAX_TOKEN_BYTES as u32)).await {
        Ok(presented) if !presented.is_empty() && bool::from(presented.ct_eq(token.as_bytes())) => {
            return Ok(())
        }
        Ok(presented) if presented.is_empty() => "empty token".to_string(),
        Ok(_) => "token mismatch".to_string(),
        Err(BridgeError::FrameTooLarge { len, max }) => {
            format!("token frame of {len} bytes exceeds {max}")
        }
        Err(e) => return Err(e),
    };
    writer.write_all(UNAUTHORIZED_REPLY).await?;
    writer.flush().await?;
    Err(BridgeError::Unauthorized(reason))
}

async fn read_query_id<R: AsyncRead + Unpin>(frames: &mut FrameReader<R>) -> Result<QueryId> {
    let raw = frames
        .read_frame_capped(Some(MAX_QUERY_ID_BYTES as u32))
        .await?;
    let id = std::str::from_utf8(&raw)
        .map_err(|e| BridgeError::Protocol(format!("query id is not valid UTF-8: {e}")))?;
    if id.is_empty() {
        return Err(BridgeError::Protocol("empty query id".to_string()));
    }
    Ok(QueryId::new(id.to_string()))
}

/// Decode and forward batch frames until the zero-length frame.
async fn stream_batches<R: AsyncRead + Unpin>(
    frames: &mut FrameReader<R>,
    decompressor: &mut Decompressor,
    decoder: &BatchDecoder,
    forwarder: &mut StreamForwarder,
    summary: &mut SessionSummary,
) -> Result<()> {
    loop {
        let frame = frames.read_frame().await?;
        if frame.is_empty() {
            return Ok(());
        }
        let payload = decompressor.decompress(&frame)?;
        let payload_bytes = payload.len();
        let batch = decoder.decode(payload)?;
        let rows = batch.num_rows();
        let nulls: usize = batch.columns().iter().map(|c| c.null_count()).sum();
        forwarder.write(batch).await?;
        summary.record_batch(rows, payload_bytes, nulls);
    }
}
