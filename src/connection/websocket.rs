//! Handshake and frame reader for the websocket variant

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::io;
use std::net::SocketAddr;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::debug;

use super::{EventSink, WriterCommand};
use crate::codec::ws::{self, OpCode, Role, WsCodec, WsItem};
use crate::error::{NetError, Result};
use crate::manager::{CloseReason, ConnEvent};
use crate::metrics::METRICS;

type WsFrames = FramedRead<OwnedReadHalf, WsCodec>;

pub(super) async fn run(
    reader: OwnedReadHalf,
    writer: mpsc::UnboundedSender<WriterCommand>,
    role: Role,
    peer: SocketAddr,
    events: EventSink,
) {
    let mut frames = FramedRead::new(reader, WsCodec::new(role));

    if let Err(error) = handshake(&mut frames, &writer, role, peer).await {
        debug!(conn_id = %events.id, %peer, error = %error, "Websocket handshake failed");
        if role == Role::Server && matches!(error, NetError::Handshake(_)) {
            // rejected requests get a 400 before the socket closes
            let _ = writer.send(WriterCommand::Write {
                data: Bytes::from_static(ws::BAD_REQUEST),
                close_after: Some(CloseReason::Error(error)),
            });
        } else {
            events.emit(ConnEvent::Closed(CloseReason::Error(error)));
        }
        return;
    }

    frames.decoder_mut().open();
    events.emit(ConnEvent::Opened);

    while let Some(item) = frames.next().await {
        match item {
            Ok(WsItem::Text(data)) | Ok(WsItem::Binary(data)) => {
                METRICS.bytes_rx(data.len() as u64);
                events.emit(ConnEvent::Data(data));
            }
            Ok(WsItem::Ping(payload)) => {
                events.emit(ConnEvent::Activity);
                if let Ok(pong) = control_frame(role, OpCode::Pong, &payload) {
                    let _ = writer.send(WriterCommand::Write {
                        data: pong,
                        close_after: None,
                    });
                }
            }
            Ok(WsItem::Close(code)) => {
                let reply = match code {
                    Some(code) => control_frame(role, OpCode::Close, &code.to_be_bytes()),
                    None => control_frame(role, OpCode::Close, &[]),
                };
                match reply {
                    Ok(data) => {
                        let _ = writer.send(WriterCommand::Write {
                            data,
                            close_after: Some(CloseReason::Eof),
                        });
                    }
                    Err(e) => events.emit(ConnEvent::Closed(CloseReason::Error(e))),
                }
                return;
            }
            Ok(WsItem::Pong(_)) => events.emit(ConnEvent::Activity),
            Ok(WsItem::Head(_)) => {}
            Err(e) => {
                events.emit(ConnEvent::Closed(CloseReason::Error(e)));
                return;
            }
        }
    }

    events.emit(ConnEvent::Closed(CloseReason::Eof));
}

async fn handshake(
    frames: &mut WsFrames,
    writer: &mpsc::UnboundedSender<WriterCommand>,
    role: Role,
    peer: SocketAddr,
) -> Result<()> {
    match role {
        Role::Server => {
            let head = next_head(frames).await?;
            let response = ws::server_response(&head)?;
            write(writer, response)
        }
        Role::Client => {
            let key = ws::client_key()?;
            write(writer, ws::client_request(&peer.to_string(), &key))?;
            let head = next_head(frames).await?;
            ws::verify_server_response(&head, &key)
        }
    }
}

async fn next_head(frames: &mut WsFrames) -> Result<Bytes> {
    match frames.next().await {
        Some(Ok(WsItem::Head(head))) => Ok(head),
        Some(Ok(_)) => Err(NetError::Handshake("frame before handshake")),
        Some(Err(e)) => Err(e),
        None => Err(NetError::Io(io::ErrorKind::UnexpectedEof.into())),
    }
}

fn write(writer: &mpsc::UnboundedSender<WriterCommand>, data: Bytes) -> Result<()> {
    writer
        .send(WriterCommand::Write {
            data,
            close_after: None,
        })
        .map_err(|_| NetError::Io(io::ErrorKind::BrokenPipe.into()))
}

fn control_frame(role: Role, opcode: OpCode, payload: &[u8]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(payload.len() + 6);
    ws::encode_frame(role, opcode, payload, &mut buf)?;
    Ok(buf.freeze())
}
