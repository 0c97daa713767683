//! The per-connection worker loop.
//!
//! One worker thread owns the transport connection and the in-flight
//! exchange for its connection. Callers never touch either: operations
//! arrive over the mailbox and are answered through their reply slots.
//!
//! The loop cycles between a write phase and a read phase. Writes are
//! accumulated into the pending exchange body until the pause between them
//! exceeds the idle interval, at which point the exchange is cut and sent.
//! The response body is then drained into pending reads. An idle connection
//! polls with empty exchanges so data buffered on the peer still flows.

use std::io::{self, Read, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use uuid::Uuid;

use crate::config::Config;
use crate::conn::Shared;
use crate::exchange::{self, ExchangeMeta};
use crate::transport::Transport;
use crate::{Error, Result};

/// Granularity of transport reads; bounds how long the worker can be blind
/// to close signals and freshly queued writes while waiting on the peer.
const IO_TICK: Duration = Duration::from_millis(5);

const MAX_HEAD_LEN: usize = 8 * 1024;

/// An operation handed off from the caller side of a connection.
pub(crate) enum Op {
    Write {
        buf: Bytes,
        reply: oneshot::Sender<Result<usize>>,
    },
    Read {
        max: usize,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    Connect {
        reply: oneshot::Sender<Result<()>>,
    },
    Close,
}

struct PendingRead {
    max: usize,
    reply: oneshot::Sender<Result<Bytes>>,
}

/// Parsing state of the inbound side of the current exchange. Kept across
/// phase switches so a partially received response resumes where it left
/// off.
enum Inbound {
    /// No response outstanding.
    Idle,
    /// Accumulating head bytes up to the blank-line terminator.
    Head(Vec<u8>),
    /// Head parsed; `remaining` body bytes still to deliver.
    Body { remaining: usize, eof: bool },
}

enum Phase {
    Write,
    Read,
    Closed,
}

enum Progress {
    Bytes,
    None,
    PeerClosed,
}

pub(crate) struct Worker {
    cfg: Config,
    ops: Receiver<Op>,
    shared: Arc<Shared>,

    id: String,
    dest_addr: String,

    transport: Option<Box<dyn Transport>>,
    /// The destination address rides on the first exchange only.
    first_exchange_sent: bool,
    seen_first_write: bool,

    /// Body of the outbound exchange currently being accumulated.
    outbound: BytesMut,
    pending_read: Option<PendingRead>,
    inbound: Inbound,
    /// Exchanges sent whose response head has not been parsed yet.
    awaiting_heads: usize,
    /// The peer marked a response end-of-data: reads resolve end-of-stream
    /// from here on.
    peer_eof: bool,

    last_activity: Instant,
    /// Cut timing follows the last write specifically; reads delivering
    /// data must not postpone a buffered exchange.
    last_write: Instant,
    last_flush: Instant,
}

impl Worker {
    pub(crate) fn new(
        cfg: Config,
        dest_addr: String,
        shared: Arc<Shared>,
        ops: Receiver<Op>,
    ) -> Self {
        let now = Instant::now();
        Self {
            cfg,
            ops,
            shared,
            id: Uuid::new_v4().to_string(),
            dest_addr,
            transport: None,
            first_exchange_sent: false,
            seen_first_write: false,
            outbound: BytesMut::new(),
            pending_read: None,
            inbound: Inbound::Idle,
            awaiting_heads: 0,
            peer_eof: false,
            last_activity: now,
            last_write: now,
            last_flush: now,
        }
    }

    pub(crate) fn run(mut self) {
        let span = tracing::debug_span!("tunnel_worker", id = %self.id, dest = %self.dest_addr);
        let _guard = span.enter();

        let mut phase = self.start();
        loop {
            phase = match phase {
                Phase::Write => self.write_phase(),
                Phase::Read => self.read_phase(),
                Phase::Closed => break,
            };
        }
        self.shutdown();
    }

    /// Initial state: no transport yet. The first submitted operation
    /// triggers the dial; a dial failure is resolved to that operation and
    /// ends the connection.
    fn start(&mut self) -> Phase {
        match self.ops.recv() {
            Ok(Op::Close) | Err(_) => Phase::Closed,
            Ok(Op::Connect { reply }) => {
                let res = self.establish();
                let failed = res.is_err();
                let _ = reply.send(res);
                if failed {
                    Phase::Closed
                } else {
                    Phase::Write
                }
            }
            Ok(Op::Write { buf, reply }) => match self.establish() {
                Ok(()) => {
                    self.accept_write(buf, reply);
                    Phase::Write
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Phase::Closed
                }
            },
            Ok(Op::Read { max, reply }) => match self.establish() {
                Ok(()) => {
                    self.pending_read = Some(PendingRead { max, reply });
                    Phase::Write
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Phase::Closed
                }
            },
        }
    }

    fn establish(&mut self) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        tracing::debug!("dialing peer");
        let transport = (self.cfg.dial)(&self.dest_addr).map_err(Error::Dial)?;
        transport
            .set_read_timeout(Some(IO_TICK))
            .map_err(Error::Dial)?;
        if let Ok(addr) = transport.local_addr() {
            *self.shared.local_addr.lock().unwrap() = Some(addr);
        }
        self.transport = Some(transport);
        Ok(())
    }

    fn accept_write(&mut self, buf: Bytes, reply: oneshot::Sender<Result<usize>>) {
        let n = buf.len();
        self.outbound.extend_from_slice(&buf);
        self.seen_first_write = true;
        let now = Instant::now();
        self.last_activity = now;
        self.last_write = now;
        let _ = reply.send(Ok(n));
    }

    /// Serve the mailbox, cutting the pending exchange when writes go quiet
    /// and polling when the whole connection does.
    fn write_phase(&mut self) -> Phase {
        loop {
            // flush first when the cut point has already passed
            if !self.outbound.is_empty() && self.last_write.elapsed() >= self.cfg.idle_interval {
                return match self.flush(false) {
                    Ok(()) => Phase::Read,
                    Err(e) => {
                        self.fail(e);
                        Phase::Closed
                    }
                };
            }
            // a pending read with an exchange still in flight drains that
            // exchange before anything else
            if self.pending_read.is_some()
                && (self.peer_eof
                    || self.awaiting_heads > 0
                    || !matches!(self.inbound, Inbound::Idle))
            {
                return Phase::Read;
            }

            match self.write_wait() {
                Some(timeout) => match self.ops.recv_timeout(timeout) {
                    Ok(op) => {
                        if let Some(phase) = self.handle_op(op) {
                            return phase;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        // idle cut, or an empty poll if nothing is buffered
                        return match self.flush(false) {
                            Ok(()) => Phase::Read,
                            Err(e) => {
                                self.fail(e);
                                Phase::Closed
                            }
                        };
                    }
                    Err(RecvTimeoutError::Disconnected) => return Phase::Closed,
                },
                None => match self.ops.recv() {
                    Ok(op) => {
                        if let Some(phase) = self.handle_op(op) {
                            return phase;
                        }
                    }
                    Err(_) => return Phase::Closed,
                },
            }
        }
    }

    /// How long to wait for the next operation before cutting the current
    /// exchange or polling. `None` means there is nothing to flush and
    /// nobody waiting for data: block until the caller acts.
    fn write_wait(&self) -> Option<Duration> {
        let now = Instant::now();
        if !self.outbound.is_empty() {
            let cut_at = self.last_write + self.cfg.idle_interval;
            return Some(cut_at.saturating_duration_since(now));
        }
        // Poll only while no exchange is outstanding. Before the very first
        // write the connection stays quiet unless a read is already waiting
        // for peer data, so a slow-starting caller is never truncated.
        let may_poll = !self.peer_eof
            && self.awaiting_heads == 0
            && matches!(self.inbound, Inbound::Idle)
            && (self.seen_first_write || self.pending_read.is_some());
        if may_poll {
            let poll_at = self.last_flush.max(self.last_activity) + self.cfg.poll_interval;
            return Some(poll_at.saturating_duration_since(now));
        }
        None
    }

    /// Returns the next phase when the operation forces a transition.
    fn handle_op(&mut self, op: Op) -> Option<Phase> {
        match op {
            Op::Write { buf, reply } => {
                self.accept_write(buf, reply);
                None
            }
            Op::Read { max, reply } => {
                if self.peer_eof {
                    let _ = reply.send(Ok(Bytes::new()));
                } else {
                    if self.pending_read.is_some() {
                        tracing::warn!("concurrent reads submitted, dropping the earlier one");
                    }
                    self.pending_read = Some(PendingRead { max, reply });
                }
                None
            }
            Op::Connect { reply } => {
                // transport is already up by the time phases run
                let _ = reply.send(Ok(()));
                None
            }
            Op::Close => Some(Phase::Closed),
        }
    }

    /// Drain the in-flight exchange: parse the response head, deliver body
    /// bytes to the pending read, and fall back to the write phase whenever
    /// the caller's writes need the transport or nothing more can happen
    /// here.
    fn read_phase(&mut self) -> Phase {
        let mut stalled_since = Instant::now();
        loop {
            loop {
                match self.ops.try_recv() {
                    Ok(op) => {
                        if let Some(Phase::Closed) = self.handle_op(op) {
                            return Phase::Closed;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Phase::Closed,
                }
            }
            // writes past their cut point flow before we keep waiting on
            // the peer
            if !self.outbound.is_empty() && self.last_write.elapsed() >= self.cfg.idle_interval {
                return Phase::Write;
            }
            if self.peer_eof {
                if let Some(pending) = self.pending_read.take() {
                    let _ = pending.reply.send(Ok(Bytes::new()));
                }
                return Phase::Write;
            }
            match self.inbound {
                Inbound::Idle => {
                    if self.awaiting_heads == 0 {
                        return Phase::Write;
                    }
                    self.inbound = Inbound::Head(Vec::new());
                }
                Inbound::Body { .. } if self.pending_read.is_none() => {
                    // body bytes wait in the transport until a caller asks
                    return Phase::Write;
                }
                _ => {}
            }
            match self.step_inbound() {
                Ok(Progress::Bytes) => stalled_since = Instant::now(),
                Ok(Progress::None) => {
                    if stalled_since.elapsed() > self.cfg.idle_timeout {
                        tracing::debug!("exchange stalled, yielding to writes");
                        return Phase::Write;
                    }
                }
                Ok(Progress::PeerClosed) => {
                    tracing::debug!("peer closed transport");
                    if let Some(pending) = self.pending_read.take() {
                        let _ = pending.reply.send(Ok(Bytes::new()));
                    }
                    return Phase::Closed;
                }
                Err(e) => {
                    self.fail(e);
                    return Phase::Closed;
                }
            }
        }
    }

    fn step_inbound(&mut self) -> Result<Progress> {
        match self.inbound {
            Inbound::Idle => Ok(Progress::None),
            Inbound::Head(_) => self.step_head(),
            Inbound::Body { .. } => self.step_body(),
        }
    }

    /// Pull head bytes until the blank-line terminator, then parse and
    /// validate. Byte-at-a-time keeps the body untouched; heads are tiny.
    fn step_head(&mut self) -> Result<Progress> {
        let transport = self.transport.as_mut().expect("transport present in read phase");
        let mut byte = [0u8; 1];
        let n = match transport.read(&mut byte) {
            Ok(n) => n,
            Err(e) if is_retry(&e) => return Ok(Progress::None),
            Err(e) => return Err(Error::Transport(e)),
        };
        if n == 0 {
            return Ok(Progress::PeerClosed);
        }
        let Inbound::Head(acc) = &mut self.inbound else {
            unreachable!("step_head outside head parsing")
        };
        acc.push(byte[0]);
        if acc.len() > MAX_HEAD_LEN {
            return Err(Error::Protocol("response head too large".to_owned()));
        }
        if !acc.ends_with(b"\r\n\r\n") {
            return Ok(Progress::Bytes);
        }

        let text = std::str::from_utf8(acc)
            .map_err(|_| Error::Protocol("response head is not valid utf-8".to_owned()))?;
        let head = exchange::parse_head(text)?;
        if head.conn_id.as_deref() != Some(self.id.as_str()) {
            return Err(Error::Protocol(format!(
                "response for wrong session: {:?}",
                head.conn_id
            )));
        }
        if !(200..300).contains(&head.status) {
            return Err(Error::Protocol(format!(
                "unexpected response status {}",
                head.status
            )));
        }
        tracing::trace!(
            status = head.status,
            len = head.content_length,
            eof = head.eof,
            "response head"
        );
        self.awaiting_heads -= 1;
        if head.content_length == 0 {
            self.inbound = Inbound::Idle;
            if head.eof {
                self.peer_eof = true;
            }
        } else {
            self.inbound = Inbound::Body {
                remaining: head.content_length,
                eof: head.eof,
            };
        }
        Ok(Progress::Bytes)
    }

    /// Deliver the next chunk of the response body to the pending read.
    fn step_body(&mut self) -> Result<Progress> {
        let (remaining, eof) = match &self.inbound {
            Inbound::Body { remaining, eof } => (*remaining, *eof),
            _ => unreachable!("step_body outside body delivery"),
        };
        let want = match &self.pending_read {
            Some(pending) => remaining.min(pending.max),
            None => return Ok(Progress::None),
        };
        let mut buf = vec![0u8; want];
        let transport = self.transport.as_mut().expect("transport present in read phase");
        let n = match transport.read(&mut buf) {
            Ok(n) => n,
            Err(e) if is_retry(&e) => return Ok(Progress::None),
            Err(e) => return Err(Error::Transport(e)),
        };
        if n == 0 {
            return Ok(Progress::PeerClosed);
        }
        buf.truncate(n);

        let pending = self.pending_read.take().expect("pending read checked above");
        let _ = pending.reply.send(Ok(Bytes::from(buf)));
        self.last_activity = Instant::now();

        let remaining = remaining - n;
        if remaining == 0 {
            self.inbound = Inbound::Idle;
            if eof {
                self.peer_eof = true;
            }
        } else {
            self.inbound = Inbound::Body { remaining, eof };
        }
        Ok(Progress::Bytes)
    }

    /// Send the accumulated outbound body as one exchange. An empty body is
    /// a poll.
    fn flush(&mut self, eof: bool) -> Result<()> {
        let body = self.outbound.split().freeze();
        let len = body.len();
        let req = (self.cfg.new_request)(exchange::METHOD_POST, body)?;
        let meta = ExchangeMeta {
            id: &self.id,
            dest_addr: (!self.first_exchange_sent).then_some(self.dest_addr.as_str()),
            eof,
        };
        let wire = exchange::encode_request(&req, &meta);

        let transport = self.transport.as_mut().expect("transport established before flush");
        transport.write_all(&wire)?;
        transport.flush()?;

        self.first_exchange_sent = true;
        self.awaiting_heads += 1;
        self.last_flush = Instant::now();
        tracing::trace!(body = len, eof, "exchange sent");
        Ok(())
    }

    /// Unrecoverable transport or protocol failure: surface it to the
    /// operation in flight and drive the connection down.
    fn fail(&mut self, e: Error) {
        tracing::warn!(error = %e, "closing connection");
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Some(pending) = self.pending_read.take() {
            let _ = pending.reply.send(Err(e));
        }
    }

    /// Terminal state. Everything pending or still arriving resolves to
    /// end-of-stream, and the transport is released.
    fn shutdown(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);

        if let Some(pending) = self.pending_read.take() {
            let _ = pending.reply.send(Ok(Bytes::new()));
        }
        while let Ok(op) = self.ops.try_recv() {
            match op {
                Op::Write { reply, .. } => {
                    let _ = reply.send(Err(Error::Closed));
                }
                Op::Read { reply, .. } => {
                    let _ = reply.send(Ok(Bytes::new()));
                }
                Op::Connect { reply } => {
                    let _ = reply.send(Err(Error::Closed));
                }
                Op::Close => {}
            }
        }

        // final exchange carrying the end-of-data marker and any bytes the
        // idle cut had not flushed yet, best effort
        if self.transport.is_some() {
            if let Err(e) = self.flush(true) {
                tracing::debug!(error = %e, "sending final exchange");
            }
        }
        // consume whatever responses are still in flight so the transport
        // closes with a clean FIN instead of resetting bytes the peer has
        // not read yet
        if let Some(transport) = self.transport.as_mut() {
            let mut scratch = [0u8; 4096];
            let deadline = Instant::now() + Duration::from_millis(25);
            while Instant::now() < deadline {
                match transport.read(&mut scratch) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if is_retry(&e) => {}
                    Err(_) => break,
                }
            }
        }
        self.transport = None;
        tracing::debug!("worker stopped");
    }
}

fn is_retry(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
