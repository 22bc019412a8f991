//! Per-connection batch compression
//!
//! When the bridge negotiates compression, the client follows its query id
//! with a bare big-endian u32 naming the codec. Every batch frame after that
//! carries a compressed payload; the end-of-stream frame stays empty.

use std::fmt;
use std::io::{Read, Write};

use exbridge_common::{BridgeError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

/// Upper bound on one decompressed batch payload.
pub const MAX_DECOMPRESSED_BATCH_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionCodec {
    None,
    /// zlib stream (RFC 1950)
    Zlib,
    /// raw LZ4 block, no size prefix
    Lz4,
}

impl CompressionCodec {
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(CompressionCodec::None),
            1 => Ok(CompressionCodec::Zlib),
            2 => Ok(CompressionCodec::Lz4),
            other => Err(BridgeError::Protocol(format!(
                "unknown compression code {other}"
            ))),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            CompressionCodec::None => 0,
            CompressionCodec::Zlib => 1,
            CompressionCodec::Lz4 => 2,
        }
    }
}

impl fmt::Display for CompressionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionCodec::None => write!(f, "NONE"),
            CompressionCodec::Zlib => write!(f, "ZLIB"),
            CompressionCodec::Lz4 => write!(f, "LZ4"),
        }
    }
}

/// Compress one batch payload the way an export client would.
pub fn compress(codec: CompressionCodec, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        CompressionCodec::None => Ok(data.to_vec()),
        CompressionCodec::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        CompressionCodec::Lz4 => Ok(lz4_flex::block::compress(data)),
    }
}

/// Session-scoped decompressor. Reuses one scratch buffer across batches.
pub struct Decompressor {
    codec: CompressionCodec,
    scratch: Vec<u8>,
}

impl Decompressor {
    pub fn new(codec: CompressionCodec) -> Self {
        Self {
            codec,
            scratch: Vec::new(),
        }
    }

    pub fn codec(&self) -> CompressionCodec {
        self.codec
    }

    /// Decompress one batch frame. Output larger than
    /// [`MAX_DECOMPRESSED_BATCH_BYTES`] is rejected.
    pub fn decompress<'a>(&'a mut self, frame: &'a [u8]) -> Result<&'a [u8]> {
        match self.codec {
            CompressionCodec::None => Ok(frame),
            CompressionCodec::Zlib => {
                self.scratch.clear();
                ZlibDecoder::new(frame)
                    .take(MAX_DECOMPRESSED_BATCH_BYTES as u64 + 1)
                    .read_to_end(&mut self.scratch)
                    .map_err(|e| BridgeError::BatchDecode(format!("zlib: {e}")))?;
                if self.scratch.len() > MAX_DECOMPRESSED_BATCH_BYTES {
                    return Err(BridgeError::BatchDecode(format!(
                        "zlib: batch inflates past {MAX_DECOMPRESSED_BATCH_BYTES} bytes"
                    )));
                }
                Ok(&self.scratch)
            }
            CompressionCodec::Lz4 => {
                if self.scratch.len() < MAX_DECOMPRESSED_BATCH_BYTES {
                    self.scratch.resize(MAX_DECOMPRESSED_BATCH_BYTES, 0);
                }
                let n = lz4_flex::block::decompress_into(frame, &mut self.scratch)
                    .map_err(|e| BridgeError::BatchDecode(format!("lz4: {e}")))?;
                Ok(&self.scratch[..n])
            }
        }
    }
}
