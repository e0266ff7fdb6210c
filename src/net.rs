//! TCP helpers shared by the audio and metadata listeners.

use std::io;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// Pending-connection backlog for both listeners.
const LISTEN_BACKLOG: u32 = 128;

/// Bind a listener with `SO_REUSEADDR` so restarts don't trip over
/// sockets lingering in TIME_WAIT.
pub async fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .context("Failed to create listening socket")?;

    socket.set_reuseaddr(true)?;
    socket
        .bind(addr)
        .with_context(|| format!("Failed to bind {addr}"))?;
    socket
        .listen(LISTEN_BACKLOG)
        .with_context(|| format!("Failed to listen on {addr}"))
}

/// Tune an accepted audio connection for latency over throughput.
///
/// Nagle is disabled so partial chunks leave immediately, and the kernel
/// send buffer is shrunk so a stalled peer fills it (and gets detected)
/// within a fraction of a second of audio instead of megabytes.
pub fn tune_for_low_latency(stream: &TcpStream, send_buffer_size: usize) -> io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_send_buffer_size(send_buffer_size)?;
    Ok(())
}

/// Park on the read half of a push-only connection until the peer goes
/// away. Inbound bytes are discarded.
///
/// Returns `Ok(())` on a clean close and the error on a failed read.
pub async fn wait_for_peer_close<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 512];
    loop {
        if reader.read(&mut scratch).await? == 0 {
            return Ok(());
        }
    }
}
