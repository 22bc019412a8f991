//! In-memory sink that records every call, with optional failure injection.

use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use exbridge_common::{BridgeError, Result};
use parking_lot::Mutex;

use crate::sink::{SinkStream, StreamSink};

#[derive(Debug, Clone)]
pub enum SinkEvent {
    Open {
        destination: String,
        schema: SchemaRef,
    },
    Write {
        destination: String,
        batch: RecordBatch,
    },
    Close {
        destination: String,
    },
    Abort {
        destination: String,
    },
}

impl SinkEvent {
    pub fn destination(&self) -> &str {
        match self {
            SinkEvent::Open { destination, .. }
            | SinkEvent::Write { destination, .. }
            | SinkEvent::Close { destination }
            | SinkEvent::Abort { destination } => destination,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    fail_open: bool,
    fail_write_at: Option<usize>,
    fail_close: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<SinkEvent>>>,
    faults: Faults,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_open(mut self) -> Self {
        self.faults.fail_open = true;
        self
    }

    /// Fail the `n`-th write (zero-based) of every stream.
    pub fn failing_write_at(mut self, n: usize) -> Self {
        self.faults.fail_write_at = Some(n);
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.faults.fail_close = true;
        self
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    pub fn events_for(&self, destination: &str) -> Vec<SinkEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.destination() == destination)
            .cloned()
            .collect()
    }

    pub fn batches_for(&self, destination: &str) -> Vec<RecordBatch> {
        self.events_for(destination)
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Write { batch, .. } => Some(batch),
                _ => None,
            })
            .collect()
    }

    pub fn rows_for(&self, destination: &str) -> usize {
        self.batches_for(destination)
            .iter()
            .map(|b| b.num_rows())
            .sum()
    }

    pub fn opens_for(&self, destination: &str) -> usize {
        self.events_for(destination)
            .iter()
            .filter(|e| matches!(e, SinkEvent::Open { .. }))
            .count()
    }

    pub fn closes_for(&self, destination: &str) -> usize {
        self.events_for(destination)
            .iter()
            .filter(|e| matches!(e, SinkEvent::Close { .. }))
            .count()
    }

    pub fn aborts_for(&self, destination: &str) -> usize {
        self.events_for(destination)
            .iter()
            .filter(|e| matches!(e, SinkEvent::Abort { .. }))
            .count()
    }

    /// Rows a real sink would have committed for `destination`: those of
    /// streams that closed successfully.
    pub fn committed_rows_for(&self, destination: &str) -> usize {
        if self.faults.fail_close {
            return 0;
        }
        let mut committed = 0;
        let mut pending = 0;
        for event in self.events_for(destination) {
            match event {
                SinkEvent::Open { .. } | SinkEvent::Abort { .. } => pending = 0,
                SinkEvent::Write { batch, .. } => pending += batch.num_rows(),
                SinkEvent::Close { .. } => {
                    committed += pending;
                    pending = 0;
                }
            }
        }
        committed
    }
}

#[async_trait::async_trait]
impl StreamSink for MemorySink {
    async fn open(&self, destination: &str, schema: SchemaRef) -> Result<Box<dyn SinkStream>> {
        if self.faults.fail_open {
            return Err(BridgeError::Forwarder(format!(
                "sink refused stream for '{destination}'"
            )));
        }
        self.events.lock().push(SinkEvent::Open {
            destination: destination.to_string(),
            schema,
        });
        Ok(Box::new(MemoryStream {
            destination: destination.to_string(),
            events: self.events.clone(),
            faults: self.faults,
            writes: 0,
        }))
    }
}

struct MemoryStream {
    destination: String,
    events: Arc<Mutex<Vec<SinkEvent>>>,
    faults: Faults,
    writes: usize,
}

#[async_trait::async_trait]
impl SinkStream for MemoryStream {
    async fn write(&mut self, batch: RecordBatch) -> Result<()> {
        let index = self.writes;
        self.writes += 1;
        if self.faults.fail_write_at == Some(index) {
            return Err(BridgeError::Forwarder(format!(
                "write {index} to '{}' rejected",
                self.destination
            )));
        }
        self.events.lock().push(SinkEvent::Write {
            destination: self.destination.clone(),
            batch,
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.events.lock().push(SinkEvent::Close {
            destination: self.destination.clone(),
        });
        if self.faults.fail_close {
            return Err(BridgeError::Forwarder(format!(
                "close of '{}' rejected",
                self.destination
            )));
        }
        Ok(())
    }

    async fn abort(&mut self) {
        self.events.lock().push(SinkEvent::Abort {
            destination: self.destination.clone(),
        });
    }
}
