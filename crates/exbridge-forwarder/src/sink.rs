//! Downstream sink abstraction
//!
//! A sink hands out one write stream per destination. Streams are owned by a
//! single session and are never shared.

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use exbridge_common::Result;

/// Something that can open destination-named batch streams
#[async_trait::async_trait]
pub trait StreamSink: Send + Sync {
    /// Open a write stream for `destination`, negotiated with `schema`.
    async fn open(&self, destination: &str, schema: SchemaRef) -> Result<Box<dyn SinkStream>>;
}

/// An open write stream
#[async_trait::async_trait]
pub trait SinkStream: Send {
    /// Send one batch; batches arrive downstream in call order.
    async fn write(&mut self, batch: RecordBatch) -> Result<()>;

    /// Finalize the stream. Data becomes visible downstream only after this
    /// returns `Ok`.
    async fn close(&mut self) -> Result<()>;

    /// Tear the stream down so the sink discards everything written to it.
    async fn abort(&mut self);
}
