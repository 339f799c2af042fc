//! Listener abstraction for the accept loop.
//!
//! The server only needs "give me the next connection" and "what address are
//! you bound to", so lifecycle tests can substitute an in-memory listener for
//! a real socket.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Source of incoming connections.
///
/// Dropping the listener closes it; the server relies on that to stop
/// accepting new connections.
#[async_trait]
pub trait Listener: Send + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next connection.
    async fn accept(&mut self) -> io::Result<(Self::Io, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Listener for TcpListener {
    type Io = TcpStream;

    async fn accept(&mut self) -> io::Result<(Self::Io, SocketAddr)> {
        let (stream, remote) = TcpListener::accept(self).await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%remote, error = %e, "Failed to set TCP_NODELAY");
        }
        Ok((stream, remote))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Accept errors that only affect one pending connection, or a momentary
/// resource shortage, and should not bring the server down.
pub(crate) fn is_transient_accept_error(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) {
        return true;
    }
    is_resource_exhaustion(e)
}

/// Out of file descriptors. Worth retrying after a short pause.
#[cfg(unix)]
pub(crate) fn is_resource_exhaustion(e: &io::Error) -> bool {
    use nix::errno::Errno;

    matches!(
        e.raw_os_error().map(Errno::from_raw),
        Some(Errno::EMFILE | Errno::ENFILE | Errno::ENOBUFS | Errno::ENOMEM)
    )
}

#[cfg(not(unix))]
pub(crate) fn is_resource_exhaustion(_e: &io::Error) -> bool {
    false
}
