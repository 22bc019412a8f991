//! exbridge forwarder - streams decoded batches into the downstream sink

pub mod flight;
pub mod forwarder;
pub mod memory;
pub mod receiver;
pub mod sink;

pub use flight::FlightSink;
pub use forwarder::StreamForwarder;
pub use memory::{MemorySink, SinkEvent};
pub use receiver::FlightReceiver;
pub use sink::{SinkStream, StreamSink};
