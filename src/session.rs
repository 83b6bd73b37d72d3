// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-connection inbound decoding and outbound write scheduling.
//!
//! A [`Session`] is registered with the reactor under one [`Token`] and
//! implements [`ChannelHandler`]: read/write readiness on its socket posts a
//! worker job rather than running inline. A single "in-flight" flag
//! serialises a session's own worker jobs against each other, which is what
//! gives the [`Listener`] callbacks their non-overlapping ordering guarantee.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use mio::event::Event;
use mio::net::TcpStream;
use mio::{Interest, Token};
use parking_lot::{Condvar, Mutex};

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::error::SessionError;
use crate::reactor::{ChannelHandler, ReactorHandle};
use crate::thread_pool::ThreadPool;

/// Shared registry of live sessions, keyed by reactor token. Declared here
/// (rather than in `emitter`) since [`Session`] itself needs to remove its
/// own entry on close; re-exported by `emitter` for the engine's use.
pub type SessionRegistry = Arc<Mutex<std::collections::HashMap<Token, SessionHandle>>>;

/// Capability implemented by user code to observe a session's inbound
/// stream and end-of-life.
///
/// `on_data_received` is never called concurrently with itself or with
/// `on_connection_closed` for the same session; `on_connection_closed` is
/// the last call, made exactly once.
pub trait Listener: Send + Sync {
    /// A chunk of bytes arrived, in TCP byte-stream order. The buffer is a
    /// single-reference handle the listener may `retain()` past this call.
    fn on_data_received(&self, session: &SessionHandle, buffer: PooledBuffer);

    /// The session has reached end-of-life: either the peer closed the
    /// stream, a fatal I/O error occurred, or the engine is shutting down.
    /// Called exactly once, after every preceding `on_data_received`.
    fn on_connection_closed(&self, session: &SessionHandle);
}

/// The write side of the session's state word. Reads are tracked
/// separately via `in_flight` + the readiness event itself: a read in
/// flight doesn't block `send_data` from queuing more output, so folding
/// `Reading` into this word would only complicate the `Idle` check
/// `send_data` uses to decide whether to arm write interest.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Idle = 0,
    Reading = 1,
    Writing = 2,
    Closing = 3,
    Closed = 4,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Idle,
            1 => State::Reading,
            2 => State::Writing,
            3 => State::Closing,
            _ => State::Closed,
        }
    }
}

/// An owning handle to a session; cheap to clone, shared across the reactor,
/// worker threads, and user code.
pub type SessionHandle = Arc<Session>;

struct Pending {
    buffer: PooledBuffer,
    offset: usize,
}

/// One accepted or connected TCP stream, wired into the reactor and thread
/// pool.
pub struct Session {
    token: Token,
    stream: Mutex<TcpStream>,
    listener: Arc<dyn Listener>,
    input_pool: Arc<BufferPool>,
    input_block_size: usize,
    outbound: Mutex<VecDeque<PooledBuffer>>,
    pending_write: Mutex<Option<Pending>>,
    state: AtomicU8,
    in_flight: AtomicBool,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    reactor: ReactorHandle,
    flushed_through: Mutex<u64>,
    flush_cv: Condvar,
    next_send_seq: AtomicU64,
    /// The I/O error that triggered this session's close, if any (a clean
    /// EOF or an explicit `close_connection()` leaves this `None`). Surfaced
    /// to the listener via [`Session::take_last_error`] from
    /// `on_connection_closed`, matching the error policy of transient
    /// per-session I/O failures closing the session rather than panicking.
    last_error: Mutex<Option<SessionError>>,
    /// The engine's session registry this session was inserted into on
    /// accept/connect; `finish_close` removes its own entry so a closed
    /// session never lingers past its natural lifetime.
    registry: SessionRegistry,
    /// Back-reference letting `&self` dispatch (required by
    /// [`ChannelHandler::handle_ready_ops`]) hand worker closures an owned
    /// [`SessionHandle`] without the reactor's handler map double-owning
    /// the session.
    weak_self: Weak<Session>,
}

impl Session {
    /// Wraps an already-connected, already-registered stream. Called by
    /// [`crate::emitter::Acceptor`] and [`crate::emitter::Connector`] once
    /// their socket is ready to read/write.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        token: Token,
        stream: TcpStream,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        listener: Arc<dyn Listener>,
        input_pool: Arc<BufferPool>,
        input_block_size: usize,
        reactor: ReactorHandle,
        registry: SessionRegistry,
    ) -> SessionHandle {
        Arc::new_cyclic(|weak_self| Session {
            token,
            stream: Mutex::new(stream),
            listener,
            input_pool,
            input_block_size,
            outbound: Mutex::new(VecDeque::new()),
            pending_write: Mutex::new(None),
            state: AtomicU8::new(State::Idle as u8),
            in_flight: AtomicBool::new(false),
            local_addr,
            remote_addr,
            reactor,
            flushed_through: Mutex::new(0),
            flush_cv: Condvar::new(),
            next_send_seq: AtomicU64::new(0),
            last_error: Mutex::new(None),
            registry,
            weak_self: weak_self.clone(),
        })
    }

    /// The reactor token this session is registered under.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Registers this session's socket with the reactor under its own
    /// token, installing itself as the dispatch target. Called by
    /// [`crate::emitter::Acceptor`] right after [`Session::new`], since the
    /// `Arc<dyn ChannelHandler>` the reactor wants can only be produced once
    /// the session is already behind an `Arc`.
    pub fn register_with_reactor(self: &SessionHandle, interest: Interest) -> io::Result<()> {
        let mut stream = self.stream.lock();
        self.reactor.register(
            &mut *stream,
            self.token,
            interest,
            Arc::clone(self) as Arc<dyn ChannelHandler>,
        )
    }

    /// Re-registers this session's socket interest without changing which
    /// token it's under. Used by [`crate::emitter::Connector`] once a
    /// pending connect finishes: the token/handler-map entry is swapped via
    /// [`ReactorHandle::replace_handler`] instead of a fresh `register`.
    pub fn reregister_with_reactor(self: &SessionHandle, interest: Interest) -> io::Result<()> {
        let mut stream = self.stream.lock();
        self.reactor.reregister(&mut *stream, self.token, interest)
    }

    /// Local socket address captured at accept/connect time.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote socket address captured at accept/connect time.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Takes the I/O error that caused this session to close, if any.
    /// `None` for a clean EOF or an explicit [`Session::close_connection`].
    /// Meant to be called once, from within [`Listener::on_connection_closed`].
    pub fn take_last_error(&self) -> Option<SessionError> {
        self.last_error.lock().take()
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_closing_or_closed(&self) -> bool {
        matches!(self.state(), State::Closing | State::Closed)
    }

    /// Enqueues `buffer` for output. Returns `false` if the session is
    /// closing or closed, in which case the buffer is dropped.
    ///
    /// If the session was idle, posts a selector-thread task to enable
    /// write interest; that task's `active_readers` delta is always zero.
    pub fn send_data(self: &SessionHandle, buffer: PooledBuffer) -> bool {
        if self.is_closing_or_closed() {
            return false;
        }
        let was_idle = self
            .state
            .compare_exchange(
                State::Idle as u8,
                State::Writing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        self.outbound.lock().push_back(buffer);
        if was_idle {
            self.arm_write_interest();
        }
        true
    }

    /// Enqueues `buffer` and blocks the caller until every byte enqueued up
    /// to and including this call has been written, or the session closes.
    /// Returns `false` if the session was already closing/closed.
    pub fn send_data_sync(self: &SessionHandle, buffer: PooledBuffer) -> bool {
        if self.is_closing_or_closed() {
            return false;
        }
        let my_seq = self.next_send_seq.fetch_add(1, Ordering::AcqRel) + 1;
        if !self.send_data(buffer) {
            return false;
        }
        let mut flushed = self.flushed_through.lock();
        while *flushed < my_seq && !self.is_closing_or_closed() {
            self.flush_cv.wait(&mut flushed);
        }
        *flushed >= my_seq
    }

    /// Requests a close. Writer drains remaining queued data, then posts a
    /// selector-thread task to cancel the key and notify the listener.
    /// Returns `true` only for the call that performed the Idle/Reading/
    /// Writing -> Closing transition.
    pub fn close_connection(self: &SessionHandle) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current == State::Closing as u8 || current == State::Closed as u8 {
                return false;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    State::Closing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.arm_write_interest();
                return true;
            }
        }
    }

    fn arm_write_interest(self: &SessionHandle) {
        let session = Arc::clone(self);
        self.reactor.run_queue().enqueue_no_wake(move || {
            let mut stream = session.stream.lock();
            let _ = session
                .reactor
                .reregister(&mut *stream, session.token, Interest::READABLE | Interest::WRITABLE);
            0
        });
    }

    fn disarm_write_interest(self: &SessionHandle) {
        let session = Arc::clone(self);
        self.reactor.run_queue().enqueue_no_wake(move || {
            let mut stream = session.stream.lock();
            let _ = session
                .reactor
                .reregister(&mut *stream, session.token, Interest::READABLE);
            0
        });
    }

    fn rearm_read_interest(self: &SessionHandle) {
        let session = Arc::clone(self);
        self.reactor.run_queue().enqueue(move || {
            let mut stream = session.stream.lock();
            let writing = !session.outbound.lock().is_empty() || session.pending_write.lock().is_some();
            let interest = if writing {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            let _ = session.reactor.reregister(&mut *stream, session.token, interest);
            -1
        });
    }

    fn try_begin_io(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn end_io(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    /// Worker-thread read step: repeatedly draws a buffer from the
    /// per-emitter input pool and performs a non-blocking read, dispatching
    /// each one to the listener, until the socket reports `WouldBlock`,
    /// end-of-stream, or an error. A single edge-triggered readiness event
    /// only fires once per arrival of new bytes, so everything already
    /// sitting in the kernel receive buffer must be drained in this one
    /// dispatch — mirroring `do_write`'s drain-until-`WouldBlock` loop and
    /// `Acceptor::accept_all`'s drain-until-`WouldBlock` loop. Posts the
    /// read re-arm (or the close sequence on EOF/error) as a selector-thread
    /// task once the loop stops.
    fn do_read(self: SessionHandle) {
        loop {
            let mut buffer = self.input_pool.alloc_exact(self.input_block_size);
            let read_result = {
                let mut stream = self.stream.lock();
                let slice = buffer.as_mut_slice().expect("freshly allocated buffer is unique");
                stream.read(slice)
            };

            match read_result {
                Ok(0) => {
                    self.end_io();
                    self.begin_close_on_eof();
                    return;
                }
                Ok(n) => {
                    buffer.truncate(n);
                    self.listener.on_data_received(&self, buffer);
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.end_io();
                    self.rearm_read_interest();
                    return;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("[session] read error on {:?}: {e}", self.token);
                    *self.last_error.lock() = Some(SessionError::Io(e));
                    self.end_io();
                    self.begin_close_on_eof();
                    return;
                }
            }
        }
    }

    /// Worker-thread write step: drains the outbound queue via successive
    /// `write` calls until it empties (disarm write interest) or the socket
    /// would block (leave interest armed).
    fn do_write(self: SessionHandle) {
        loop {
            let next = {
                let mut pending = self.pending_write.lock();
                if pending.is_none() {
                    let mut outbound = self.outbound.lock();
                    match outbound.pop_front() {
                        Some(buffer) => *pending = Some(Pending { buffer, offset: 0 }),
                        None => break,
                    }
                }
                let p = pending.as_ref().unwrap();
                (p.buffer.clone(), p.offset)
            };
            let (buffer, offset) = next;

            let write_result = {
                let mut stream = self.stream.lock();
                stream.write(&buffer.as_slice()[offset..])
            };

            match write_result {
                Ok(0) => break,
                Ok(n) => {
                    let new_offset = offset + n;
                    if new_offset >= buffer.size() {
                        *self.pending_write.lock() = None;
                        self.complete_one_send();
                    } else {
                        *self.pending_write.lock() = Some(Pending { buffer, offset: new_offset });
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.end_io();
                    return;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("[session] write error on {:?}: {e}", self.token);
                    *self.last_error.lock() = Some(SessionError::Io(e));
                    self.end_io();
                    self.begin_close_on_eof();
                    return;
                }
            }
        }

        self.end_io();
        let closing = self.is_closing_or_closed();
        if closing {
            self.finish_close();
        } else {
            self.state.store(State::Idle as u8, Ordering::Release);
            self.disarm_write_interest();
        }
    }

    fn complete_one_send(self: &SessionHandle) {
        let mut flushed = self.flushed_through.lock();
        *flushed += 1;
        self.flush_cv.notify_all();
    }

    /// Posts the selector-thread task that marks the session closing and
    /// either hands off to a final write-drain worker (if output is still
    /// queued — the peer's read side may outlive ours under TCP half-close)
    /// or finishes the close immediately.
    fn begin_close_on_eof(self: &SessionHandle) {
        let session = Arc::clone(self);
        self.reactor.run_queue().enqueue_no_wake(move || {
            session.state.store(State::Closing as u8, Ordering::Release);
            let has_pending =
                !session.outbound.lock().is_empty() || session.pending_write.lock().is_some();
            if has_pending && session.try_begin_io() {
                let session2 = Arc::clone(&session);
                session.reactor.thread_pool().execute(move || session2.do_write());
            } else {
                session.finish_close();
            }
            0
        });
    }

    /// Deregisters the socket and calls `on_connection_closed` exactly
    /// once. Idempotent past the first successful state transition to
    /// `Closed`.
    fn finish_close(self: &SessionHandle) {
        let prev = self.state.swap(State::Closed as u8, Ordering::AcqRel);
        if prev == State::Closed as u8 {
            return;
        }
        {
            let mut stream = self.stream.lock();
            let _ = self.reactor.deregister(&mut *stream, self.token);
        }
        self.registry.lock().remove(&self.token);
        *self.flushed_through.lock() = u64::MAX;
        self.flush_cv.notify_all();
        self.listener.on_connection_closed(self);
    }
}

impl ChannelHandler for Session {
    fn handle_ready_ops(&self, event: &Event, thread_pool: &ThreadPool) -> i32 {
        let mut delta = 0i32;

        if event.is_writable() && self.state() != State::Closed {
            if self.try_begin_io() {
                if let Some(handle) = self.self_handle() {
                    thread_pool.execute(move || handle.do_write());
                } else {
                    self.end_io();
                }
            }
        }

        if event.is_readable() && self.state() != State::Closed {
            if self.try_begin_io() {
                if let Some(handle) = self.self_handle() {
                    thread_pool.execute(move || handle.do_read());
                    delta += 1;
                } else {
                    self.end_io();
                }
            }
        }

        delta
    }
}

impl Session {
    /// Reconstructs an owned [`SessionHandle`] from `&self` via the weak
    /// back-reference the reactor's handler registry keeps alongside the
    /// strong one. Returns `None` only in the narrow window after the
    /// session has been deregistered but before the last strong reference
    /// drops.
    fn self_handle(&self) -> Option<SessionHandle> {
        self.weak_self.upgrade()
    }
}
