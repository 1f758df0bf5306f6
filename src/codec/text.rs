//! On-demand reads for the text variant
//!
//! Nothing is decoded until a [`ReadRequest`] is armed; each request yields
//! exactly one item and then disarms the codec.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::{NetError, Result};

/// How a read request delimits its result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Exactly `size` bytes; 0 means whatever is available
    Exact,
    /// Up to and excluding `\r\n`
    Crlf,
    /// Up to and excluding `\n`
    Lf,
}

impl ReadMode {
    fn delimiter(self) -> Option<&'static [u8]> {
        match self {
            ReadMode::Exact => None,
            ReadMode::Crlf => Some(b"\r\n"),
            ReadMode::Lf => Some(b"\n"),
        }
    }
}

/// A single pending read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub mode: ReadMode,
    /// Byte count for `Exact`, line length bound for delimited reads (0 = unbounded)
    pub size: usize,
    /// Caller correlation token
    pub reply_id: i32,
}

/// Decoder serving one [`ReadRequest`] at a time
#[derive(Debug, Default)]
pub struct TextCodec {
    request: Option<ReadRequest>,
    // bytes already searched for the delimiter
    scanned: usize,
}

impl TextCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the codec with the next request
    pub fn begin(&mut self, request: ReadRequest) {
        self.request = Some(request);
        self.scanned = 0;
    }

    /// Currently armed request, if any
    pub fn pending(&self) -> Option<ReadRequest> {
        self.request
    }

    fn finish(&mut self) {
        self.request = None;
        self.scanned = 0;
    }
}

impl Decoder for TextCodec {
    type Item = Bytes;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        let Some(request) = self.request else {
            return Ok(None);
        };

        let Some(delim) = request.mode.delimiter() else {
            if request.size == 0 {
                if src.is_empty() {
                    return Ok(None);
                }
                self.finish();
                return Ok(Some(src.split().freeze()));
            }
            if src.len() < request.size {
                src.reserve(request.size - src.len());
                return Ok(None);
            }
            self.finish();
            return Ok(Some(src.split_to(request.size).freeze()));
        };

        let start = self.scanned.saturating_sub(delim.len() - 1);
        let found = src[start..]
            .windows(delim.len())
            .position(|w| w == delim)
            .map(|pos| start + pos);

        match found {
            Some(pos) => {
                if request.size > 0 && pos > request.size {
                    self.finish();
                    return Err(NetError::LineTooLong(request.size));
                }
                let line = src.split_to(pos).freeze();
                src.advance(delim.len());
                self.finish();
                Ok(Some(line))
            }
            None => {
                if request.size > 0 && src.len() > request.size + delim.len() {
                    self.finish();
                    return Err(NetError::LineTooLong(request.size));
                }
                self.scanned = src.len();
                Ok(None)
            }
        }
    }

    // A partial result at end of stream is dropped; the stream end is
    // reported as the read failure.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        self.decode(src)
    }
}
