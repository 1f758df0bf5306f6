//! Length-prefixed socket framing
//!
//! Frame format: [Len(2 BE)][Payload(Len)]
//!
//! Whether the prefix is applied on reads, writes, both or neither is
//! controlled by [`FrameMode`].

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use tokio_util::codec::{BytesCodec, Decoder, LengthDelimitedCodec};

use crate::error::{NetError, Result};

/// Largest payload a single frame can carry
pub const MAX_FRAME: usize = u16::MAX as usize;

/// Length-prefix framing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum FrameMode {
    /// Raw bytes both ways
    #[default]
    None,
    /// Inbound stream is length-prefixed
    Receive,
    /// Outbound payloads get a length prefix
    Send,
    /// Both directions
    Both,
}

impl FrameMode {
    /// Inbound data is length-prefixed
    pub fn receives(self) -> bool {
        matches!(self, FrameMode::Receive | FrameMode::Both)
    }

    /// Outbound data gets a length prefix
    pub fn sends(self) -> bool {
        matches!(self, FrameMode::Send | FrameMode::Both)
    }
}

/// Unrecognized frame mode token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFrameModeError(pub String);

impl fmt::Display for ParseFrameModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unsupported frame flag '{}', supported: 'none' 'r' 'w' 'rw' 'wr'",
            self.0
        )
    }
}

impl std::error::Error for ParseFrameModeError {}

impl FromStr for FrameMode {
    type Err = ParseFrameModeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(FrameMode::None),
            "r" => Ok(FrameMode::Receive),
            "w" => Ok(FrameMode::Send),
            "rw" | "wr" => Ok(FrameMode::Both),
            _ => Err(ParseFrameModeError(s.to_string())),
        }
    }
}

impl TryFrom<String> for FrameMode {
    type Error = ParseFrameModeError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for FrameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            FrameMode::None => "none",
            FrameMode::Receive => "r",
            FrameMode::Send => "w",
            FrameMode::Both => "rw",
        };
        f.write_str(token)
    }
}

/// Inbound decoder for the socket variant
#[derive(Debug)]
pub enum SocketCodec {
    /// Length-prefixed frames
    Framed(LengthDelimitedCodec),
    /// Whatever arrived in one read
    Raw(BytesCodec),
}

impl SocketCodec {
    /// Decoder matching the receive side of `mode`
    pub fn new(mode: FrameMode) -> Self {
        if mode.receives() {
            SocketCodec::Framed(
                LengthDelimitedCodec::builder()
                    .big_endian()
                    .length_field_length(2)
                    .max_frame_length(MAX_FRAME)
                    .new_codec(),
            )
        } else {
            SocketCodec::Raw(BytesCodec::new())
        }
    }
}

impl Decoder for SocketCodec {
    type Item = Bytes;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        let frame = match self {
            SocketCodec::Framed(codec) => codec.decode(src)?,
            SocketCodec::Raw(codec) => codec.decode(src)?,
        };
        Ok(frame.map(BytesMut::freeze))
    }
}

/// Apply the send side of `mode` to an outbound payload
pub fn encode(mode: FrameMode, data: Bytes) -> Result<Bytes> {
    if !mode.sends() {
        return Ok(data);
    }
    if data.len() > MAX_FRAME {
        return Err(NetError::FrameTooLarge(data.len()));
    }

    let mut buf = BytesMut::with_capacity(2 + data.len());
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(&data);
    Ok(buf.freeze())
}
