//! Arrow Flight sink
//!
//! Each stream is one `DoPut` call whose descriptor path is the destination.
//! The RPC runs on its own task; batches reach it through a bounded channel
//! so a slow sink applies back-pressure to the session that feeds it.

use std::time::Duration;

use arrow_array::RecordBatch;
use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::error::FlightError;
use arrow_flight::{FlightClient, FlightDescriptor};
use arrow_schema::SchemaRef;
use exbridge_common::{BridgeConfig, BridgeError, NodeAddr, Result};
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tonic::transport::Channel;

use crate::sink::{SinkStream, StreamSink};

type BatchSender = mpsc::Sender<std::result::Result<RecordBatch, FlightError>>;

/// Opens `DoPut` streams against a Flight endpoint
#[derive(Debug, Clone)]
pub struct FlightSink {
    addr: NodeAddr,
    connect_timeout: Option<Duration>,
    channel_capacity: usize,
}

impl FlightSink {
    pub fn new(addr: NodeAddr) -> Self {
        Self {
            addr,
            connect_timeout: None,
            channel_capacity: 16,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.sink_addr.clone())
            .with_connect_timeout(config.sink_timeout())
            .with_channel_capacity(config.sink_channel_capacity)
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    async fn connect(&self) -> Result<FlightClient> {
        let mut endpoint = Channel::from_shared(self.addr.to_endpoint())
            .map_err(|e| BridgeError::Forwarder(format!("invalid sink address {}: {e}", self.addr)))?;
        if let Some(timeout) = self.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }
        let channel = endpoint.connect().await.map_err(|e| {
            BridgeError::Forwarder(format!("failed to connect to sink {}: {e}", self.addr))
        })?;
        Ok(FlightClient::new(channel))
    }
}

#[async_trait::async_trait]
impl StreamSink for FlightSink {
    async fn open(&self, destination: &str, schema: SchemaRef) -> Result<Box<dyn SinkStream>> {
        let mut client = self.connect().await?;

        let (sender, receiver) = mpsc::channel(self.channel_capacity);
        let descriptor = FlightDescriptor::new_path(vec![destination.to_string()]);
        let flight_data = FlightDataEncoderBuilder::new()
            .with_schema(schema)
            .with_flight_descriptor(Some(descriptor))
            .build(receiver);

        let task = tokio::spawn(async move {
            let mut results = client.do_put(flight_data).await?;
            let mut acks = 0usize;
            while let Some(result) = results.next().await {
                result?;
                acks += 1;
            }
            Ok::<usize, FlightError>(acks)
        });

        tracing::debug!("Opened DoPut stream to {} for '{}'", self.addr, destination);
        Ok(Box::new(FlightSinkStream {
            destination: destination.to_string(),
            sender: Some(sender),
            task: Some(task),
        }))
    }
}

struct FlightSinkStream {
    destination: String,
    sender: Option<BatchSender>,
    task: Option<JoinHandle<std::result::Result<usize, FlightError>>>,
}

impl FlightSinkStream {
    /// Wait for the RPC task and translate its outcome.
    async fn join_rpc(&mut self) -> Result<usize> {
        let Some(task) = self.task.take() else {
            return Ok(0);
        };
        match task.await {
            Ok(Ok(acks)) => Ok(acks),
            Ok(Err(e)) => Err(BridgeError::Forwarder(format!(
                "DoPut for '{}' failed: {e}",
                self.destination
            ))),
            Err(e) => Err(BridgeError::Forwarder(format!(
                "DoPut task for '{}' did not finish: {e}",
                self.destination
            ))),
        }
    }
}

#[async_trait::async_trait]
impl SinkStream for FlightSinkStream {
    async fn write(&mut self, batch: RecordBatch) -> Result<()> {
        let sender = self.sender.as_mut().ok_or_else(|| {
            BridgeError::Forwarder(format!("stream for '{}' is closed", self.destination))
        })?;
        if sender.send(Ok(batch)).await.is_ok() {
            return Ok(());
        }

        // The receiver only goes away when the RPC has ended.
        self.sender = None;
        match self.join_rpc().await {
            Err(e) => Err(e),
            Ok(_) => Err(BridgeError::Forwarder(format!(
                "DoPut for '{}' ended before the stream was closed",
                self.destination
            ))),
        }
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the sender ends the request stream.
        self.sender = None;
        let acks = self.join_rpc().await?;
        tracing::debug!(
            "DoPut for '{}' finished with {} put results",
            self.destination,
            acks
        );
        Ok(())
    }

    async fn abort(&mut self) {
        // The request stream must still be open here; dropping the sender
        // first would end the DoPut cleanly.
        if let Some(task) = self.task.take() {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!("DoPut task for '{}' failed: {}", self.destination, e);
                }
            }
        }
        self.sender = None;
        tracing::debug!("DoPut for '{}' aborted", self.destination);
    }
}

impl Drop for FlightSinkStream {
    fn drop(&mut self) {
        // Tear down an unclosed stream without waiting on the sink.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
