//! Socket option plumbing shared by the dial and accept paths.

use socket2::SockRef;
use tokio::net::TcpStream;

/// Options applied to every TCP endpoint: `TCP_NODELAY`, `SO_KEEPALIVE`,
/// and `TCP_QUICKACK` where the platform has it. Tokio opens its sockets
/// close-on-exec already.
pub(crate) fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    sock.set_keepalive(true)?;
    #[cfg(target_os = "linux")]
    sock.set_quickack(true)?;
    Ok(())
}
