//! Socket utilities and tuning

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

/// Requested listen backlog; the kernel clamps it to its own maximum
pub const LISTEN_BACKLOG: i32 = i32::MAX;

/// Idle time before TCP keepalive probes start
pub const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// Create a non-blocking listening TCP socket
///
/// Address reuse is enabled everywhere except Windows, where it would allow
/// two listeners on the same port.
pub fn create_tcp_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    #[cfg(not(windows))]
    socket.set_reuse_address(true)?;

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Apply per-connection socket options to a freshly accepted or dialed stream
pub fn tune_stream(stream: &TcpStream) -> io::Result<()> {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    sock.set_tcp_keepalive(&keepalive)?;
    Ok(())
}
