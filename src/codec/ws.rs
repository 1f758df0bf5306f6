//! Websocket framing (RFC 6455 subset)
//!
//! Frame header: [FIN|RSV|OpCode(1)][MASK|Len7(1)][ExtLen(0/2/8 BE)][MaskKey(0/4)]
//!
//! The codec starts in the handshake stage and yields the HTTP head of the
//! opening handshake as [`WsItem::Head`]; after [`WsCodec::open`] it decodes
//! frames, reassembling fragmented data messages.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ring::rand::{SecureRandom, SystemRandom};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{NetError, Result};

/// Magic value appended to the client key before hashing
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest reassembled message accepted
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Largest handshake head accepted
const MAX_HEAD: usize = 8 * 1024;

/// Reply sent when an opening handshake is rejected
pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";

/// Which end of the websocket this codec serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted side: inbound frames must be masked
    Server,
    /// Dialed side: outbound frames are masked
    Client,
}

/// Frame opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

/// Decoded websocket unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsItem {
    /// HTTP head of the opening handshake, terminator included
    Head(Bytes),
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    /// Close frame with its status code, if any
    Close(Option<u16>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Handshake,
    Open,
}

struct RawFrame {
    fin: bool,
    opcode: OpCode,
    payload: Bytes,
}

/// Websocket codec for one connection
#[derive(Debug)]
pub struct WsCodec {
    role: Role,
    stage: Stage,
    fragment: Option<(OpCode, BytesMut)>,
    max_payload: usize,
}

impl WsCodec {
    /// New codec in the handshake stage
    pub fn new(role: Role) -> Self {
        Self {
            role,
            stage: Stage::Handshake,
            fragment: None,
            max_payload: MAX_PAYLOAD,
        }
    }

    /// Handshake done, decode frames from now on
    pub fn open(&mut self) {
        self.stage = Stage::Open;
    }

    pub fn is_open(&self) -> bool {
        self.stage == Stage::Open
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn decode_head(&mut self, src: &mut BytesMut) -> Result<Option<WsItem>> {
        match src.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(pos) => Ok(Some(WsItem::Head(src.split_to(pos + 4).freeze()))),
            None if src.len() > MAX_HEAD => Err(NetError::Handshake("handshake head too large")),
            None => Ok(None),
        }
    }

    fn decode_frame(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>> {
        if src.len() < 2 {
            return Ok(None);
        }

        let b0 = src[0];
        let b1 = src[1];
        if b0 & 0x70 != 0 {
            return Err(NetError::WebSocket("reserved bits set"));
        }
        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(NetError::WebSocket("unknown opcode"))?;
        let fin = b0 & 0x80 != 0;
        let masked = b1 & 0x80 != 0;

        match (self.role, masked) {
            (Role::Server, false) => return Err(NetError::WebSocket("unmasked client frame")),
            (Role::Client, true) => return Err(NetError::WebSocket("masked server frame")),
            _ => {}
        }

        let (ext, len) = match b1 & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (2, u16::from_be_bytes([src[2], src[3]]) as u64)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                (8, u64::from_be_bytes(raw))
            }
            n => (0, n as u64),
        };

        if opcode.is_control() && (!fin || len > 125) {
            return Err(NetError::WebSocket("invalid control frame"));
        }
        if len > self.max_payload as u64 {
            return Err(NetError::WebSocket("payload too large"));
        }

        let len = len as usize;
        let header = 2 + ext + if masked { 4 } else { 0 };
        let total = header + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        let key = if masked {
            let mut key = [0u8; 4];
            key.copy_from_slice(&frame[2 + ext..header]);
            Some(key)
        } else {
            None
        };
        frame.advance(header);
        if let Some(key) = key {
            apply_mask(&mut frame, key);
        }

        Ok(Some(RawFrame {
            fin,
            opcode,
            payload: frame.freeze(),
        }))
    }
}

impl Decoder for WsCodec {
    type Item = WsItem;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WsItem>> {
        if self.stage == Stage::Handshake {
            return self.decode_head(src);
        }

        loop {
            let Some(frame) = self.decode_frame(src)? else {
                return Ok(None);
            };

            match frame.opcode {
                OpCode::Ping => return Ok(Some(WsItem::Ping(frame.payload))),
                OpCode::Pong => return Ok(Some(WsItem::Pong(frame.payload))),
                OpCode::Close => {
                    let code = (frame.payload.len() >= 2)
                        .then(|| u16::from_be_bytes([frame.payload[0], frame.payload[1]]));
                    return Ok(Some(WsItem::Close(code)));
                }
                OpCode::Continuation => {
                    let Some((_, buf)) = self.fragment.as_mut() else {
                        return Err(NetError::WebSocket("unexpected continuation frame"));
                    };
                    if buf.len() + frame.payload.len() > self.max_payload {
                        return Err(NetError::WebSocket("payload too large"));
                    }
                    buf.extend_from_slice(&frame.payload);
                    if frame.fin {
                        if let Some((opcode, buf)) = self.fragment.take() {
                            return Ok(Some(data_item(opcode, buf.freeze())));
                        }
                    }
                }
                OpCode::Text | OpCode::Binary => {
                    if self.fragment.is_some() {
                        return Err(NetError::WebSocket("expected continuation frame"));
                    }
                    if frame.fin {
                        return Ok(Some(data_item(frame.opcode, frame.payload)));
                    }
                    self.fragment = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                }
            }
        }
    }
}

impl Encoder<WsItem> for WsCodec {
    type Error = NetError;

    fn encode(&mut self, item: WsItem, dst: &mut BytesMut) -> Result<()> {
        match item {
            WsItem::Head(head) => {
                dst.extend_from_slice(&head);
                Ok(())
            }
            WsItem::Text(data) => encode_frame(self.role, OpCode::Text, &data, dst),
            WsItem::Binary(data) => encode_frame(self.role, OpCode::Binary, &data, dst),
            WsItem::Ping(data) => encode_frame(self.role, OpCode::Ping, &data, dst),
            WsItem::Pong(data) => encode_frame(self.role, OpCode::Pong, &data, dst),
            WsItem::Close(Some(code)) => {
                encode_frame(self.role, OpCode::Close, &code.to_be_bytes(), dst)
            }
            WsItem::Close(None) => encode_frame(self.role, OpCode::Close, &[], dst),
        }
    }
}

fn data_item(opcode: OpCode, payload: Bytes) -> WsItem {
    match opcode {
        OpCode::Text => WsItem::Text(payload),
        _ => WsItem::Binary(payload),
    }
}

/// Write one final frame; clients mask the payload
pub fn encode_frame(role: Role, opcode: OpCode, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let mask_bit = if role == Role::Client { 0x80 } else { 0 };
    let len = payload.len();

    dst.reserve(14 + len);
    dst.put_u8(0x80 | opcode as u8);
    if len < 126 {
        dst.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        dst.put_u8(mask_bit | 126);
        dst.put_u16(len as u16);
    } else {
        dst.put_u8(mask_bit | 127);
        dst.put_u64(len as u64);
    }

    if role == Role::Client {
        let mut key = [0u8; 4];
        fill_random(&mut key)?;
        dst.put_slice(&key);
        let start = dst.len();
        dst.put_slice(payload);
        apply_mask(&mut dst[start..], key);
    } else {
        dst.put_slice(payload);
    }
    Ok(())
}

fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

fn fill_random(dest: &mut [u8]) -> Result<()> {
    SystemRandom::new()
        .fill(dest)
        .map_err(|_| NetError::WebSocket("random source unavailable"))
}

/// `Sec-WebSocket-Accept` value for a client key
pub fn accept_key(key: &str) -> String {
    let mut input = String::with_capacity(key.len() + GUID.len());
    input.push_str(key.trim());
    input.push_str(GUID);
    let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, input.as_bytes());
    STANDARD.encode(digest.as_ref())
}

/// Fresh random `Sec-WebSocket-Key`
pub fn client_key() -> Result<String> {
    let mut raw = [0u8; 16];
    fill_random(&mut raw)?;
    Ok(STANDARD.encode(raw))
}

/// Opening request sent by the dialing side
pub fn client_request(host: &str, key: &str) -> Bytes {
    Bytes::from(format!(
        "GET / HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    ))
}

/// Validate a client opening request and build the 101 response
pub fn server_response(head: &[u8]) -> Result<Bytes> {
    let (request_line, headers) = parse_head(head)?;

    if !request_line.starts_with("GET ") {
        return Err(NetError::Handshake("method is not GET"));
    }
    let upgrade = find_header(&headers, "upgrade").unwrap_or("");
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(NetError::Handshake("missing websocket upgrade"));
    }
    if let Some(version) = find_header(&headers, "sec-websocket-version") {
        if version != "13" {
            return Err(NetError::Handshake("unsupported websocket version"));
        }
    }
    let key = find_header(&headers, "sec-websocket-key")
        .filter(|k| !k.is_empty())
        .ok_or(NetError::Handshake("missing Sec-WebSocket-Key"))?;

    Ok(Bytes::from(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(key)
    )))
}

/// Check the server's answer to our opening request
pub fn verify_server_response(head: &[u8], key: &str) -> Result<()> {
    let (status_line, headers) = parse_head(head)?;

    let mut parts = status_line.split_whitespace();
    let _version = parts.next();
    if parts.next() != Some("101") {
        return Err(NetError::Handshake("server refused upgrade"));
    }
    match find_header(&headers, "sec-websocket-accept") {
        Some(accept) if accept == accept_key(key) => Ok(()),
        _ => Err(NetError::Handshake("bad Sec-WebSocket-Accept")),
    }
}

fn parse_head(head: &[u8]) -> Result<(&str, Vec<(&str, &str)>)> {
    let text = std::str::from_utf8(head).map_err(|_| NetError::Handshake("head is not UTF-8"))?;
    let mut lines = text.split("\r\n");
    let first = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or(NetError::Handshake("empty head"))?;

    let headers = lines
        .filter(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(name, value)| (name.trim(), value.trim()))
        .collect();

    Ok((first, headers))
}

fn find_header<'a>(headers: &[(&'a str, &'a str)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| *v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_rfc_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_server_response_for_valid_request() {
        let head = b"GET /chat HTTP/1.1\r\n\
                     Host: server.example.com\r\n\
                     Upgrade: websocket\r\n\
                     Connection: Upgrade\r\n\
                     Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                     Sec-WebSocket-Version: 13\r\n\r\n";
        let response = server_response(head).unwrap();
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 101"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[test]
    fn test_server_response_rejects_plain_http() {
        let head = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        assert!(matches!(server_response(head), Err(NetError::Handshake(_))));
    }

    #[test]
    fn test_client_handshake_agrees_with_server() {
        let key = client_key().unwrap();
        let request = client_request("127.0.0.1:80", &key);
        let response = server_response(&request).unwrap();
        verify_server_response(&response, &key).unwrap();
        assert!(verify_server_response(&response, "other-key").is_err());
    }

    #[test]
    fn test_head_decoded_before_frames() {
        let mut codec = WsCodec::new(Role::Server);
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\n\r\n\x81"[..]);
        let item = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(item, WsItem::Head(Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n")));
        assert_eq!(&buf[..], b"\x81");
    }

    #[test]
    fn test_masked_frame_from_client() {
        let mut client = WsCodec::new(Role::Client);
        let mut server = WsCodec::new(Role::Server);
        server.open();

        let mut wire = BytesMut::new();
        client.encode(WsItem::Text(Bytes::from_static(b"hello")), &mut wire).unwrap();
        assert_eq!(wire[1] & 0x80, 0x80);

        let item = server.decode(&mut wire).unwrap().unwrap();
        assert_eq!(item, WsItem::Text(Bytes::from_static(b"hello")));
        assert!(wire.is_empty());
    }

    #[test]
    fn test_server_rejects_unmasked_frame() {
        let mut server = WsCodec::new(Role::Server);
        server.open();
        let mut wire = BytesMut::from(&[0x82u8, 0x01, 0xFF][..]);
        assert!(server.decode(&mut wire).is_err());
    }

    #[test]
    fn test_extended_length_frame() {
        let payload = vec![7u8; 300];
        let mut wire = BytesMut::new();
        encode_frame(Role::Server, OpCode::Binary, &payload, &mut wire).unwrap();
        assert_eq!(wire[1], 126);

        let mut client = WsCodec::new(Role::Client);
        client.open();
        // partial frame waits for more bytes
        let mut partial = wire.split_to(100);
        assert!(client.decode(&mut partial).unwrap().is_none());
        partial.unsplit(wire);
        assert_eq!(
            client.decode(&mut partial).unwrap().unwrap(),
            WsItem::Binary(Bytes::from(payload))
        );
    }

    #[test]
    fn test_fragmented_message_reassembled() {
        let mut wire = BytesMut::new();
        // first fragment: FIN clear, text opcode
        wire.put_u8(0x01);
        wire.put_u8(3);
        wire.put_slice(b"hel");
        // interleaved ping
        encode_frame(Role::Server, OpCode::Ping, b"p", &mut wire).unwrap();
        // final continuation
        wire.put_u8(0x80);
        wire.put_u8(2);
        wire.put_slice(b"lo");

        let mut client = WsCodec::new(Role::Client);
        client.open();
        assert_eq!(
            client.decode(&mut wire).unwrap().unwrap(),
            WsItem::Ping(Bytes::from_static(b"p"))
        );
        assert_eq!(
            client.decode(&mut wire).unwrap().unwrap(),
            WsItem::Text(Bytes::from_static(b"hello"))
        );
    }

    #[test]
    fn test_close_frame_code() {
        let mut wire = BytesMut::new();
        let mut server = WsCodec::new(Role::Server);
        server.encode(WsItem::Close(Some(1000)), &mut wire).unwrap();

        let mut client = WsCodec::new(Role::Client);
        client.open();
        assert_eq!(
            client.decode(&mut wire).unwrap().unwrap(),
            WsItem::Close(Some(1000))
        );
    }

    #[test]
    fn test_oversized_control_frame_rejected() {
        let mut client = WsCodec::new(Role::Client);
        client.open();
        let mut wire = BytesMut::new();
        wire.put_u8(0x89);
        wire.put_u8(126);
        wire.put_u16(200);
        assert!(client.decode(&mut wire).is_err());
    }
}
