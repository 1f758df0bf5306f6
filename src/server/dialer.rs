//! Name resolution and outbound connects

use std::net::SocketAddr;
use tokio::net::{lookup_host, TcpStream};
use tracing::trace;

use crate::error::{NetError, Result};
use crate::manager::{Completion, Context};

/// Resolve `host:port`; the port must be numeric
pub async fn resolve(host: &str, port: &str) -> Result<Vec<SocketAddr>> {
    let port: u16 = port
        .parse()
        .map_err(|_| NetError::InvalidPort(port.to_string()))?;

    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
    if addrs.is_empty() {
        return Err(NetError::Unresolved(format!("{host}:{port}")));
    }
    Ok(addrs)
}

/// Try each resolved address in order; the last failure is returned
pub async fn connect(host: &str, port: &str) -> Result<(TcpStream, SocketAddr)> {
    let mut last_error = None;

    for addr in resolve(host, port).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok((stream, addr)),
            Err(e) => {
                trace!(%addr, error = %e, "Connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(e) => e.into(),
        None => NetError::Unresolved(format!("{host}:{port}")),
    })
}

/// Connect in the background and post the result
pub(crate) fn connect_in_background(host: String, port: String, ctx: Context, reply_id: i32) {
    tokio::spawn(async move {
        tokio::select! {
            _ = ctx.cancelled() => {}
            result = connect(&host, &port) => {
                let completion = match result {
                    Ok((stream, peer)) => Completion::Connected { stream, peer, reply_id },
                    Err(error) => Completion::ConnectFailed { error, reply_id },
                };
                ctx.post(completion);
            }
        }
    });
}
