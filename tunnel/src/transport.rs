use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// A duplex connection to the peer carrying the raw exchange bytes.
///
/// Exactly one worker owns the transport for a connection's lifetime.
/// `TcpStream` is the production implementation; tests plug in their own.
pub trait Transport: Read + Write + Send {
    /// Local endpoint of the connection.
    fn local_addr(&self) -> std::io::Result<SocketAddr>;

    /// Bound the time a single `read` may block. The worker relies on this
    /// to notice close signals and freshly queued writes while it waits on
    /// the peer.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;
}

impl Transport for TcpStream {
    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}
