//! Session-owned forwarding stream
//!
//! Wraps one sink stream and tracks whether it has been finished, so that the
//! session finishes it exactly once on every exit path: `close` on success,
//! `abort` on failure. Anything after the first finish is a no-op.

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use exbridge_common::{BridgeError, Result};

use crate::sink::{SinkStream, StreamSink};

pub struct StreamForwarder {
    destination: String,
    stream: Option<Box<dyn SinkStream>>,
    batches: u64,
    rows: u64,
}

impl StreamForwarder {
    /// Open a stream for `destination` on `sink`.
    pub async fn open(sink: &dyn StreamSink, destination: &str, schema: SchemaRef) -> Result<Self> {
        let stream = sink.open(destination, schema).await?;
        tracing::debug!("Forwarder opened for '{}'", destination);
        Ok(Self {
            destination: destination.to_string(),
            stream: Some(stream),
            batches: 0,
            rows: 0,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn batches_written(&self) -> u64 {
        self.batches
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    pub async fn write(&mut self, batch: RecordBatch) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            BridgeError::Forwarder(format!("write to closed stream '{}'", self.destination))
        })?;
        let rows = batch.num_rows() as u64;
        stream.write(batch).await?;
        self.batches += 1;
        self.rows += rows;
        Ok(())
    }

    /// Finalize the stream. Closing an already closed forwarder does nothing.
    pub async fn close(&mut self) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        stream.close().await?;
        tracing::debug!(
            "Forwarder for '{}' closed after {} batches ({} rows)",
            self.destination,
            self.batches,
            self.rows
        );
        Ok(())
    }

    /// Finish the stream on a failure path so that nothing written so far
    /// is committed downstream. Counts as the stream's one close.
    pub async fn abort(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        stream.abort().await;
        tracing::debug!(
            "Forwarder for '{}' aborted after {} batches ({} rows)",
            self.destination,
            self.batches,
            self.rows
        );
    }
}

impl Drop for StreamForwarder {
    fn drop(&mut self) {
        if self.stream.is_some() {
            tracing::warn!(
                "Forwarder for '{}' dropped without close after {} batches",
                self.destination,
                self.batches
            );
        }
    }
}
