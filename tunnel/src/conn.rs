use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::Sender;

use crate::config::Config;
use crate::worker::{Op, Worker};
use crate::{Error, Result};

/// State shared between the handle and the worker. The closed flag is the
/// only field touched from both sides of the thread boundary.
pub(crate) struct Shared {
    pub(crate) closed: AtomicBool,
    pub(crate) local_addr: Mutex<Option<SocketAddr>>,
}

/// A duplex byte stream carried over discrete request/response exchanges.
///
/// Reads and writes block until the connection's worker answers them; the
/// handle never touches the transport itself. Like `TcpStream`, the I/O
/// traits are implemented for `&Conn` as well, so one thread can read while
/// another writes or closes.
pub struct Conn {
    dest_addr: String,
    shared: Arc<Shared>,
    ops: Sender<Op>,
}

impl Conn {
    /// Create a not-yet-connected tunnel to `dest_addr`. The transport is
    /// dialed on the first operation, or eagerly via [`Conn::connect`].
    pub fn new(dest_addr: impl Into<String>, config: Config) -> Self {
        let dest_addr = dest_addr.into();
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        });
        let (ops, mailbox) = crossbeam_channel::unbounded();
        let worker = Worker::new(config, dest_addr.clone(), Arc::clone(&shared), mailbox);
        thread::spawn(move || worker.run());
        Self {
            dest_addr,
            shared,
            ops,
        }
    }

    /// Dial the transport now instead of waiting for the first read or
    /// write to trigger it.
    pub fn connect(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let (tx, rx) = oneshot::channel();
        if self.ops.send(Op::Connect { reply: tx }).is_err() {
            return Err(Error::Closed);
        }
        rx.recv().unwrap_or(Err(Error::Closed))
    }

    /// Close the connection. Idempotent: only the first call signals the
    /// worker, and repeated calls are no-ops. Never fails.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(dest = %self.dest_addr, "closing tunnel");
            let _ = self.ops.send(Op::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Local endpoint of the transport connection, `None` until a dial has
    /// succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().unwrap()
    }

    /// The destination address this tunnel relays to.
    pub fn remote_addr(&self) -> &str {
        &self.dest_addr
    }

    /// No timeout machinery backs the handle, so deadlines are rejected
    /// rather than silently accepted.
    pub fn set_deadline(&self, _deadline: Instant) -> Result<()> {
        Err(Error::DeadlinesUnsupported)
    }

    pub fn set_read_deadline(&self, _deadline: Instant) -> Result<()> {
        Err(Error::DeadlinesUnsupported)
    }

    pub fn set_write_deadline(&self, _deadline: Instant) -> Result<()> {
        Err(Error::DeadlinesUnsupported)
    }
}

impl Read for &Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.is_closed() {
            return Ok(0);
        }
        let (tx, rx) = oneshot::channel();
        let op = Op::Read {
            max: buf.len(),
            reply: tx,
        };
        if self.ops.send(op).is_err() {
            return Ok(0);
        }
        match rx.recv() {
            Ok(Ok(bytes)) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            Ok(Err(Error::Closed)) => Ok(0),
            Ok(Err(e)) => Err(e.into()),
            // worker gone: collapse to end-of-stream
            Err(_) => Ok(0),
        }
    }
}

impl Write for &Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed.into());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let (tx, rx) = oneshot::channel();
        let op = Op::Write {
            buf: Bytes::copy_from_slice(buf),
            reply: tx,
        };
        if self.ops.send(op).is_err() {
            return Err(Error::Closed.into());
        }
        match rx.recv() {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::Closed.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        // exchange cutting is the worker's call, nothing to force here
        Ok(())
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self).flush()
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.close();
    }
}
