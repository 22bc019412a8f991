//! Minimal Flight `DoPut` endpoint
//!
//! Accepts `DoPut` streams, decodes them, and keeps the batches per
//! descriptor path. A stream's batches become visible only once the client
//! has finished it cleanly. Used as a local stand-in for the ingestion
//! service.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_flight::decode::FlightRecordBatchStream;
use arrow_flight::error::FlightError;
use arrow_flight::flight_service_server::{FlightService, FlightServiceServer};
use arrow_flight::{
    Action, Criteria, FlightData, FlightDescriptor, FlightInfo, HandshakeRequest,
    HandshakeResponse, PollInfo, PutResult, SchemaResult, Ticket,
};
use dashmap::{DashMap, DashSet};
use futures::{Stream, StreamExt, TryStreamExt};
use tonic::{transport::Server, Request, Response, Status, Streaming};

/// Collects `DoPut` streams by destination
#[derive(Debug, Clone, Default)]
pub struct FlightReceiver {
    committed: Arc<DashMap<String, Vec<RecordBatch>>>,
    rejected: Arc<DashSet<String>>,
}

impl FlightReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every `DoPut` for `destination`.
    pub fn reject(&self, destination: impl Into<String>) {
        self.rejected.insert(destination.into());
    }

    pub fn batches(&self, destination: &str) -> Vec<RecordBatch> {
        self.committed
            .get(destination)
            .map(|b| b.value().clone())
            .unwrap_or_default()
    }

    pub fn rows(&self, destination: &str) -> usize {
        self.committed
            .get(destination)
            .map(|b| b.iter().map(|batch| batch.num_rows()).sum())
            .unwrap_or(0)
    }

    pub fn destinations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.committed.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub async fn serve(self, listen: SocketAddr) -> anyhow::Result<()> {
        tracing::info!("Flight receiver listening on {}", listen);
        Server::builder()
            .add_service(FlightServiceServer::new(self))
            .serve(listen)
            .await
            .map_err(|e| anyhow::anyhow!(e))
    }
}

fn destination_of(descriptor: Option<&FlightDescriptor>) -> Option<String> {
    let path = &descriptor?.path;
    if path.is_empty() {
        None
    } else {
        Some(path.join("/"))
    }
}

#[tonic::async_trait]
impl FlightService for FlightReceiver {
    type HandshakeStream = Pin<Box<dyn Stream<Item = Result<HandshakeResponse, Status>> + Send>>;
    type ListFlightsStream = Pin<Box<dyn Stream<Item = Result<FlightInfo, Status>> + Send>>;
    type DoGetStream = Pin<Box<dyn Stream<Item = Result<FlightData, Status>> + Send>>;
    type DoPutStream = Pin<Box<dyn Stream<Item = Result<PutResult, Status>> + Send>>;
    type DoActionStream = Pin<Box<dyn Stream<Item = Result<arrow_flight::Result, Status>> + Send>>;
    type ListActionsStream = Pin<Box<dyn Stream<Item = Result<arrow_flight::ActionType, Status>> + Send>>;
    type DoExchangeStream = Pin<Box<dyn Stream<Item = Result<FlightData, Status>> + Send>>;

    async fn do_put(
        &self,
        request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoPutStream>, Status> {
        let mut input = request.into_inner();
        let first = input
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("Empty DoPut stream"))?;
        let destination = destination_of(first.flight_descriptor.as_ref())
            .ok_or_else(|| Status::invalid_argument("DoPut requires a descriptor path"))?;

        if self.rejected.contains(&destination) {
            return Err(Status::permission_denied(format!(
                "Destination '{destination}' is not accepted"
            )));
        }

        let flight_data = futures::stream::once(async move { Ok::<_, Status>(first) })
            .chain(input)
            .map_err(FlightError::from);
        let batches: Vec<RecordBatch> = FlightRecordBatchStream::new_from_flight_data(flight_data)
            .try_collect()
            .await
            .map_err(|e| Status::internal(format!("Decoding error: {e}")))?;

        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        tracing::info!(
            "Received {} rows in {} batches for '{}'",
            rows,
            batches.len(),
            destination
        );
        self.committed.entry(destination).or_default().extend(batches);

        let result = PutResult::default();
        Ok(Response::new(Box::pin(futures::stream::iter(vec![Ok(result)]))))
    }

    async fn handshake(
        &self,
        _request: Request<Streaming<HandshakeRequest>>,
    ) -> Result<Response<Self::HandshakeStream>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn list_flights(
        &self,
        _request: Request<Criteria>,
    ) -> Result<Response<Self::ListFlightsStream>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn get_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn poll_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<PollInfo>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn get_schema(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<SchemaResult>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn do_get(
        &self,
        _request: Request<Ticket>,
    ) -> Result<Response<Self::DoGetStream>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn do_action(
        &self,
        _request: Request<Action>,
    ) -> Result<Response<Self::DoActionStream>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn list_actions(
        &self,
        _request: Request<arrow_flight::Empty>,
    ) -> Result<Response<Self::ListActionsStream>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn do_exchange(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoExchangeStream>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }
}
