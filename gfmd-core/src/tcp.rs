//! TCP utilities shared by the connection supervisor and local-peer setup.

use std::io;
use std::net::TcpStream;
use std::time::Duration;

/// Enable `TCP_NODELAY` on a connection used for gfmd-channel RPC traffic.
/// Request/response framing is latency-sensitive and small, so Nagle's
/// algorithm only hurts here.
pub fn enable_tcp_nodelay(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}

/// Connect to `addr` with a bounded attempt timeout, then enable
/// `TCP_NODELAY`. Used by the connection supervisor's `connect()` step; the
/// caller is responsible for the outer retry/backoff loop.
pub fn connect_with_timeout(
    addr: std::net::SocketAddr,
    timeout: Duration,
) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    enable_tcp_nodelay(&stream)?;
    Ok(stream)
}
