//! Wire codecs
//!
//! `tokio_util::codec` decoders and encoders for the three connection
//! variants: length-prefixed socket frames, on-demand text reads, and
//! websocket frames.

pub mod frame;
pub mod text;
pub mod ws;

pub use frame::{FrameMode, ParseFrameModeError, SocketCodec, MAX_FRAME};
pub use text::{ReadMode, ReadRequest, TextCodec};
pub use ws::{Role, WsCodec, WsItem};
