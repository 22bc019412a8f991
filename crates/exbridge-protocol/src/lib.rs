//! exbridge protocol - framing, schema negotiation and the batch codec

pub mod client;
pub mod compression;
pub mod decoder;
pub mod encoder;
pub mod frame;
pub mod schema;

pub use client::ExportClient;
pub use compression::{CompressionCodec, Decompressor, MAX_DECOMPRESSED_BATCH_BYTES};
pub use decoder::BatchDecoder;
pub use encoder::{PayloadBuilder, Value};
pub use frame::{length_prefixed, FrameCodec, FrameLimits, FrameReader, ACK, UNAUTHORIZED_REPLY};
pub use schema::{ColumnDef, ColumnSchema, LogicalType, TypePolicy};
