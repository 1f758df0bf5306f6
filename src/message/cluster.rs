//! Cluster wire envelope
//!
//! Format: [PayloadLen(2 LE)][Payload(L)][Header(rest)]
//!
//! The header length is implicit: total size - 2 - L. This framing is
//! independent of the per-connection frame mode.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::Message;
use crate::error::{NetError, Result};

/// Size of the length prefix
pub const LEN_PREFIX: usize = 2;

/// Largest payload the 2-byte prefix can describe
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Build a cluster envelope from a header and payload
pub fn pack(header: &[u8], payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_PAYLOAD {
        return Err(NetError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LEN_PREFIX + payload.len() + header.len());
    buf.put_u16_le(payload.len() as u16);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(header);
    Ok(buf.freeze())
}

/// Split a cluster envelope into `(payload, header)`
pub fn unpack(data: &[u8]) -> Result<(&[u8], &[u8])> {
    if data.len() < LEN_PREFIX {
        return Err(NetError::Envelope("missing length prefix"));
    }

    let mut prefix = &data[..LEN_PREFIX];
    let len = prefix.get_u16_le() as usize;
    let body = &data[LEN_PREFIX..];
    if body.len() < len {
        return Err(NetError::Envelope("payload truncated"));
    }

    Ok(body.split_at(len))
}

/// Wrap a message payload into a cluster envelope in place
pub fn pack_message(header: &[u8], msg: &mut Message) -> Result<()> {
    let packed = pack(header, msg.data())?;
    msg.clear();
    msg.write(&packed);
    Ok(())
}

/// Unwrap a cluster envelope in place, leaving the payload in the message
/// and returning the header
pub fn unpack_message(msg: &mut Message) -> Result<Bytes> {
    let (payload_len, header) = {
        let (payload, header) = unpack(msg.data())?;
        (payload.len(), Bytes::copy_from_slice(header))
    };

    let buf = msg.buffer_mut();
    buf.advance(LEN_PREFIX);
    buf.truncate(payload_len);
    Ok(header)
}
