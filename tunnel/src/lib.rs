//! Carry a duplex byte stream over a transport that only supports discrete
//! request/response exchanges.
//!
//! [`Conn`] looks like an ordinary blocking socket to its caller. Behind
//! it, a dedicated worker translates the stream into a sequence of
//! exchanges against a peer that relays bytes to the real destination:
//!
//! 1. Writes are piped into the body of the current outbound exchange.
//! 2. When the pause between writes exceeds the idle interval, the
//!    exchange is cut and sent, and its response body is read to satisfy
//!    pending reads.
//! 3. When nothing has been written for the poll interval, an empty
//!    exchange is issued so data buffered on the peer still flows.
//!
//! All exchanges of one connection carry the same session id; the first
//! also carries the destination address, and a final one in either
//! direction may carry an end-of-data marker. How the peer is dialed and
//! how a request envelope is built are injected through [`Config`].

mod config;
mod conn;
mod error;
pub mod exchange;
#[cfg(feature = "nom")]
mod parse;
pub mod transport;
mod worker;

pub use config::{
    Config, DialFn, NewRequestFn, DEFAULT_IDLE_INTERVAL, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_POLL_INTERVAL,
};
pub use conn::Conn;
pub use error::{Error, Result};
pub use exchange::{Request, ResponseHead, HEADER_CONN_ID, HEADER_DEST_ADDR, HEADER_EOF};
