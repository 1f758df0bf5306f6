//! Listening socket and accept tasks

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::dialer::resolve;
use crate::error::Result;
use crate::manager::{Completion, Context};
use crate::util::create_tcp_listener;

/// Resolve `host:port` and bind a listener on the first address
pub async fn bind(host: &str, port: &str) -> Result<(TcpListener, SocketAddr)> {
    let addr = resolve(host, port).await?[0];
    let std_listener = create_tcp_listener(addr)?;
    let listener = TcpListener::from_std(std_listener)?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

/// An open listening socket together with its pending accept tasks
///
/// Accept tasks share the socket, so it stays open until every one of them
/// is gone. [`close`](Self::close) waits for that.
#[derive(Debug)]
pub(crate) struct Listener {
    socket: Arc<TcpListener>,
    addr: SocketAddr,
    // generation the manager tags accept completions with
    epoch: u64,
    accepts: Vec<JoinHandle<()>>,
}

impl Listener {
    pub(crate) fn new(socket: TcpListener, addr: SocketAddr, epoch: u64) -> Self {
        Self {
            socket: Arc::new(socket),
            addr,
            epoch,
            accepts: Vec::new(),
        }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Accept one connection in the background and post the result
    ///
    /// The task gives up as soon as the manager is torn down or the
    /// listener is closed.
    pub(crate) fn accept(&mut self, ctx: Context, reply_id: i32) {
        self.accepts.retain(|task| !task.is_finished());

        let socket = Arc::clone(&self.socket);
        let epoch = self.epoch;
        self.accepts.push(tokio::spawn(async move {
            tokio::select! {
                _ = ctx.cancelled() => {
                    trace!(reply_id, "Accept cancelled");
                }
                result = socket.accept() => {
                    let completion = match result {
                        Ok((stream, peer)) => Completion::Accepted { stream, peer, epoch, reply_id },
                        Err(e) => Completion::AcceptFailed { error: e.into(), epoch, reply_id },
                    };
                    ctx.post(completion);
                }
            }
        }));
    }

    /// Stop accepting; the socket is closed once this returns
    pub(crate) async fn close(mut self) {
        let accepts = std::mem::take(&mut self.accepts);
        for task in &accepts {
            task.abort();
        }
        for task in accepts {
            let _ = task.await;
        }
        debug!(addr = %self.addr, epoch = self.epoch, "Listener closed");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        for task in &self.accepts {
            task.abort();
        }
    }
}
