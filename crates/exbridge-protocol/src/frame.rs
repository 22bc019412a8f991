//! Length-prefixed framing
//!
//! Every message on the export stream is a 4-byte big-endian length followed
//! by exactly that many payload bytes. A zero-length frame in the batch phase
//! marks the end of the stream.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use exbridge_common::{BridgeError, Result};
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead, LengthDelimitedCodec, LengthDelimitedCodecError};

/// Acknowledgment written to the client after a successful end-of-stream.
pub const ACK: &[u8] = b"OK";

/// Reply written when the client presents a wrong auth token.
pub const UNAUTHORIZED_REPLY: &[u8] = b"ERROR: UNAUTHORIZED";

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// The export stream's frame codec: u32 big-endian length, no adjustment.
/// `None` accepts any length a u32 can carry.
pub fn length_prefixed(max_frame_bytes: Option<u32>) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(LENGTH_PREFIX_BYTES)
        .big_endian()
        .max_frame_length(frame_cap(max_frame_bytes))
        .new_codec()
}

fn frame_cap(max_frame_bytes: Option<u32>) -> usize {
    max_frame_bytes.map_or(u32::MAX as usize, |max| max as usize)
}

/// Guards applied while reading frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameLimits {
    pub max_frame_bytes: Option<u32>,
    pub read_timeout: Option<Duration>,
}

/// Decoder for the export stream.
///
/// Wraps [`LengthDelimitedCodec`] so cap violations and truncated frames come
/// back as [`BridgeError`]s carrying the declared length. It can also hand
/// out one bare big-endian word, which is how the compression code travels.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    cap: Option<u32>,
    /// Declared length of the frame currently being assembled.
    pending: Option<u32>,
    bare_word: bool,
}

impl FrameCodec {
    pub fn new(cap: Option<u32>) -> Self {
        Self {
            inner: length_prefixed(cap),
            cap,
            pending: None,
            bare_word: false,
        }
    }

    fn set_cap(&mut self, cap: Option<u32>) {
        self.cap = cap;
        self.inner.set_max_frame_length(frame_cap(cap));
    }

    fn map_codec_error(&self, err: std::io::Error) -> BridgeError {
        let too_long = err
            .get_ref()
            .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>());
        match (too_long, self.pending, self.cap) {
            (true, Some(len), Some(max)) => BridgeError::FrameTooLarge { len, max },
            _ => BridgeError::Io(err),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = BridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if self.bare_word {
            if src.len() < LENGTH_PREFIX_BYTES {
                return Ok(None);
            }
            return Ok(Some(src.split_to(LENGTH_PREFIX_BYTES)));
        }

        if self.pending.is_none() && src.len() >= LENGTH_PREFIX_BYTES {
            self.pending = Some((&src[..LENGTH_PREFIX_BYTES]).get_u32());
        }
        match self.inner.decode(src) {
            Ok(Some(frame)) => {
                self.pending = None;
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(self.map_codec_error(e)),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        match self.pending {
            None if src.is_empty() => Ok(None),
            Some(len) if !self.bare_word => Err(BridgeError::ConnectionClosed {
                expected: len as usize,
                received: src.len(),
            }),
            _ => Err(BridgeError::ConnectionClosed {
                expected: LENGTH_PREFIX_BYTES,
                received: src.len(),
            }),
        }
    }
}

/// Reads frames off a byte stream.
pub struct FrameReader<R> {
    frames: FramedRead<R, FrameCodec>,
    limits: FrameLimits,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limits(inner, FrameLimits::default())
    }

    pub fn with_limits(inner: R, limits: FrameLimits) -> Self {
        Self {
            frames: FramedRead::new(inner, FrameCodec::new(limits.max_frame_bytes)),
            limits,
            bytes_read: 0,
        }
    }

    /// Bytes of complete frames consumed so far, prefixes included.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    async fn next_item(&mut self) -> Result<BytesMut> {
        let next = match self.limits.read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.frames.next())
                .await
                .map_err(|_| {
                    BridgeError::Timeout(format!("no complete frame within {timeout:?}"))
                })?,
            None => self.frames.next().await,
        };
        next.unwrap_or(Err(BridgeError::ConnectionClosed {
            expected: LENGTH_PREFIX_BYTES,
            received: 0,
        }))
    }

    /// Read one bare big-endian u32 that is not wrapped in a frame.
    pub async fn read_u32(&mut self) -> Result<u32> {
        self.frames.decoder_mut().bare_word = true;
        let word = self.next_item().await;
        self.frames.decoder_mut().bare_word = false;
        let word = word?;
        self.bytes_read += LENGTH_PREFIX_BYTES as u64;
        Ok((&word[..]).get_u32())
    }

    /// Read one frame and return its payload. An empty payload is a
    /// zero-length frame.
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        let frame = self.next_item().await?;
        self.bytes_read += (LENGTH_PREFIX_BYTES + frame.len()) as u64;
        Ok(frame.freeze())
    }

    /// Read one frame whose declared length may not exceed `cap`; later
    /// frames go back to the configured limit.
    pub async fn read_frame_capped(&mut self, cap: Option<u32>) -> Result<Bytes> {
        self.frames.decoder_mut().set_cap(cap);
        let frame = self.read_frame().await;
        self.frames.decoder_mut().set_cap(self.limits.max_frame_bytes);
        frame
    }
}
