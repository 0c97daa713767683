use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::exchange::Request;
use crate::transport::Transport;
use crate::Result;

/// Opens a transport connection to the peer, given the destination address
/// the tunnel was created for.
pub type DialFn = Arc<dyn Fn(&str) -> io::Result<Box<dyn Transport>> + Send + Sync>;

/// Builds the protocol envelope for one outbound exchange. The worker
/// attaches the session metadata afterwards; the factory decides method,
/// target and any base headers.
pub type NewRequestFn = Arc<dyn Fn(&str, Bytes) -> Result<Request> + Send + Sync>;

/// How long a pending read may stall before the worker stops waiting on the
/// current exchange and goes back to serving writes.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum silence before an empty poll exchange is issued to fetch
/// whatever the peer has buffered.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Maximum pause between successive writes before the current exchange body
/// is cut and sent.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(5);

/// Immutable per-connection configuration.
///
/// The two functions are the only coupling to the underlying protocol
/// machinery: how the peer is reached and how a request envelope is built
/// are both injected by the caller.
#[derive(Clone)]
pub struct Config {
    pub dial: DialFn,
    pub new_request: NewRequestFn,
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
    pub idle_interval: Duration,
}

impl Config {
    pub fn new<D, N>(dial: D, new_request: N) -> Self
    where
        D: Fn(&str) -> io::Result<Box<dyn Transport>> + Send + Sync + 'static,
        N: Fn(&str, Bytes) -> Result<Request> + Send + Sync + 'static,
    {
        Self {
            dial: Arc::new(dial),
            new_request: Arc::new(new_request),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }
}
