//! Export client
//!
//! Speaks the producer side of the export stream: optional token, query id,
//! optional compression code, schema, batches, end-of-stream, then waits for
//! the bridge's reply.

use bytes::Bytes;
use exbridge_common::{BridgeError, Result};
use futures::SinkExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};

use crate::compression::{compress, CompressionCodec};
use crate::frame::{length_prefixed, ACK};
use crate::schema::ColumnSchema;

pub struct ExportClient {
    reader: OwnedReadHalf,
    frames: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    compression: CompressionCodec,
}

impl ExportClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader,
            frames: FramedWrite::new(writer, length_prefixed(None)),
            compression: CompressionCodec::None,
        })
    }

    async fn send_frame(&mut self, payload: Bytes) -> Result<()> {
        self.frames.send(payload).await?;
        Ok(())
    }

    pub async fn send_token(&mut self, token: &str) -> Result<()> {
        self.send_frame(Bytes::copy_from_slice(token.as_bytes())).await
    }

    pub async fn send_query_id(&mut self, query_id: &str) -> Result<()> {
        self.send_frame(Bytes::copy_from_slice(query_id.as_bytes())).await
    }

    /// Announce the batch codec. Only valid against a bridge that negotiates
    /// compression; later batches are compressed with `codec`.
    pub async fn send_compression(&mut self, codec: CompressionCodec) -> Result<()> {
        self.send_raw(&codec.code().to_be_bytes()).await?;
        self.compression = codec;
        Ok(())
    }

    pub async fn send_schema(&mut self, schema: &ColumnSchema) -> Result<()> {
        self.send_schema_json(&schema.to_json()).await
    }

    pub async fn send_schema_json(&mut self, json: &str) -> Result<()> {
        self.send_frame(Bytes::copy_from_slice(json.as_bytes())).await
    }

    /// Send one encoded batch payload. Empty payloads are refused since a
    /// zero-length frame would end the stream.
    pub async fn send_batch(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(BridgeError::Protocol(
                "empty batch payload would end the stream".to_string(),
            ));
        }
        let frame = match self.compression {
            CompressionCodec::None => Bytes::copy_from_slice(payload),
            codec => Bytes::from(compress(codec, payload)?),
        };
        self.send_frame(frame).await
    }

    /// Write bytes as-is, bypassing framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        // `send` flushes, so nothing is left buffered in the codec.
        let writer = self.frames.get_mut();
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read whatever the bridge sends until it closes the connection.
    pub async fn read_response(&mut self) -> Result<Vec<u8>> {
        let mut response = Vec::new();
        self.reader.read_to_end(&mut response).await?;
        Ok(response)
    }

    /// Send end-of-stream and return the bridge's reply.
    pub async fn finish(mut self) -> Result<Vec<u8>> {
        self.send_frame(Bytes::new()).await?;
        self.read_response().await
    }

    /// Like [`finish`](Self::finish), but fails unless the reply is the ack.
    pub async fn finish_acked(self) -> Result<()> {
        let response = self.finish().await?;
        if response == ACK {
            Ok(())
        } else {
            Err(BridgeError::Protocol(format!(
                "bridge replied {:?} instead of ack",
                String::from_utf8_lossy(&response)
            )))
        }
    }
}
