//! Continuous reader for the raw socket variant

use futures::StreamExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio_util::codec::FramedRead;

use super::EventSink;
use crate::codec::{FrameMode, SocketCodec};
use crate::manager::{CloseReason, ConnEvent};
use crate::metrics::METRICS;

/// Forward every frame (or raw chunk) until the stream ends
pub(super) async fn read_loop(reader: OwnedReadHalf, frame: FrameMode, events: EventSink) {
    let mut frames = FramedRead::new(reader, SocketCodec::new(frame));

    while let Some(item) = frames.next().await {
        match item {
            Ok(data) => {
                METRICS.bytes_rx(data.len() as u64);
                events.emit(ConnEvent::Data(data));
            }
            Err(e) => {
                events.emit(ConnEvent::Closed(CloseReason::Error(e)));
                return;
            }
        }
    }

    events.emit(ConnEvent::Closed(CloseReason::Eof));
}
