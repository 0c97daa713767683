use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by a tunnel connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection has been closed. Every operation submitted after
    /// shutdown collapses to this one terminal condition.
    #[error("connection closed")]
    Closed,

    /// Opening the transport connection to the peer failed.
    #[error("dialing peer: {0}")]
    Dial(#[source] io::Error),

    /// An exchange failed at the transport level.
    #[error("transport i/o: {0}")]
    Transport(#[from] io::Error),

    /// The peer violated the exchange protocol, e.g. a response with a
    /// missing or mismatched session id.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Deadlines are not backed by any timeout machinery, so setting one is
    /// rejected instead of silently ignored.
    #[error("deadlines are not supported on tunnel connections")]
    DeadlinesUnsupported,
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        let kind = match &e {
            Error::Closed => io::ErrorKind::UnexpectedEof,
            Error::Dial(inner) | Error::Transport(inner) => inner.kind(),
            Error::Protocol(_) => io::ErrorKind::InvalidData,
            Error::DeadlinesUnsupported => io::ErrorKind::Unsupported,
        };
        io::Error::new(kind, e)
    }
}
