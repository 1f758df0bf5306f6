//! Error types
//!
//! Every failure the manager can observe is folded into [`NetError`].
//! Nothing here is fatal: errors end up as a boolean result, a reply to
//! the waiting caller, or a log line.

use std::io;
use thiserror::Error;

/// Errors produced by the connection manager and its codecs
#[derive(Debug, Error)]
pub enum NetError {
    /// Operating-system level socket failure
    #[error("{}({})", os_message(.0), os_code(.0))]
    Io(#[from] io::Error),

    /// Name resolution produced no usable address
    #[error("no address found for {0}")]
    Unresolved(String),

    /// Port string is not a valid TCP port
    #[error("invalid port '{0}'")]
    InvalidPort(String),

    /// Operation on a connection id that is not in the table
    #[error("read an invalid socket")]
    InvalidSocket,

    /// Payload does not fit a 2-byte length prefix
    #[error("frame of {0} bytes exceeds the 2-byte length prefix")]
    FrameTooLarge(usize),

    /// Delimited read ran past its size bound
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    /// Websocket opening handshake rejected
    #[error("websocket handshake failed: {0}")]
    Handshake(&'static str),

    /// Websocket framing violation
    #[error("websocket protocol error: {0}")]
    WebSocket(&'static str),

    /// Connection idle for longer than the configured timeout
    #[error("read timeout")]
    Timeout,

    /// Malformed cluster envelope
    #[error("malformed cluster envelope: {0}")]
    Envelope(&'static str),
}

impl NetError {
    /// OS error code, 0 when the error did not come from the OS
    pub fn code(&self) -> i32 {
        match self {
            NetError::Io(e) => os_code(e),
            _ => 0,
        }
    }

    /// True when the peer simply went away
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            NetError::Io(e) if matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            )
        )
    }
}

/// Render an error the way it is surfaced to callers:
/// `"<context> <message>(<code>)"` for OS errors.
///
/// Presentation only, callers must not parse it.
pub fn describe(context: &str, err: &NetError) -> String {
    format!("{context} {err}")
}

fn os_code(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(0)
}

// std appends " (os error N)" to OS errors; the code is rendered separately.
fn os_message(err: &io::Error) -> String {
    let text = err.to_string();
    match text.find(" (os error") {
        Some(pos) => text[..pos].to_string(),
        None => text,
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, NetError>;
