//! Request-driven reader for the text variant

use futures::StreamExt;
use std::io;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use super::EventSink;
use crate::codec::{ReadRequest, TextCodec};
use crate::error::NetError;
use crate::manager::ConnEvent;
use crate::metrics::METRICS;

/// Serve read requests one at a time; the first failure ends the reader
pub(super) async fn read_loop(
    reader: OwnedReadHalf,
    mut requests: mpsc::UnboundedReceiver<ReadRequest>,
    events: EventSink,
) {
    let mut frames = FramedRead::new(reader, TextCodec::new());

    while let Some(request) = requests.recv().await {
        frames.decoder_mut().begin(request);
        let reply_id = request.reply_id;

        match frames.next().await {
            Some(Ok(data)) => {
                METRICS.bytes_rx(data.len() as u64);
                events.emit(ConnEvent::ReadDone { reply_id, data });
            }
            Some(Err(error)) => {
                events.emit(ConnEvent::ReadFailed { reply_id, error });
                return;
            }
            None => {
                let error = NetError::Io(io::ErrorKind::UnexpectedEof.into());
                events.emit(ConnEvent::ReadFailed { reply_id, error });
                return;
            }
        }
    }
}
