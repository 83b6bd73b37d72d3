// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The single reactor thread: owns the non-blocking multiplexer, merges
//! readiness events with the selector-thread run-queue, and drives the
//! two-hop shutdown sequence.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::event::Event;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;

use crate::run_queue::{RunQueue, SelectorRunnable};
use crate::thread_pool::ThreadPool;

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;
const FIRST_CHANNEL_TOKEN: usize = 0;

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;

/// Capability implemented by anything registered with the reactor: sessions,
/// acceptors, connectors.
///
/// Invoked only on the reactor thread. Returns the delta to apply to
/// `active_readers`, exactly like [`crate::run_queue::SelectorRunnable`].
pub trait ChannelHandler: Send + Sync {
    fn handle_ready_ops(&self, event: &Event, thread_pool: &ThreadPool) -> i32;
}

/// A cross-thread front to the reactor: registration, interest changes, and
/// the run-queue, all safe to call from worker threads or user code.
#[derive(Clone)]
pub struct ReactorHandle {
    registry: Arc<Registry>,
    handlers: Arc<Mutex<HashMap<Token, Arc<dyn ChannelHandler>>>>,
    run_queue: RunQueue,
    thread_pool: Arc<ThreadPool>,
    next_token: Arc<AtomicUsize>,
    active_readers: Arc<AtomicI64>,
    state: Arc<AtomicU8>,
}

impl ReactorHandle {
    /// Allocates the next unique registration token.
    pub fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers `source` under `token`, recording `handler` as its
    /// dispatch target.
    pub fn register(
        &self,
        source: &mut dyn mio::event::Source,
        token: Token,
        interest: Interest,
        handler: Arc<dyn ChannelHandler>,
    ) -> io::Result<()> {
        self.registry.register(source, token, interest)?;
        self.handlers.lock().insert(token, handler);
        Ok(())
    }

    /// Changes the registered interest set for an already-registered token.
    pub fn reregister(
        &self,
        source: &mut dyn mio::event::Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.registry.reregister(source, token, interest)
    }

    /// Deregisters `source` and drops its handler entry.
    pub fn deregister(&self, source: &mut dyn mio::event::Source, token: Token) -> io::Result<()> {
        self.handlers.lock().remove(&token);
        self.registry.deregister(source)
    }

    /// Swaps the dispatch target already registered under `token` for
    /// `handler`, without touching the multiplexer registration itself.
    /// Used when a [`crate::emitter::Connector`]'s pending-connect handler
    /// hands a token off to the [`crate::session::Session`] it just built
    /// for the same socket.
    pub fn replace_handler(&self, token: Token, handler: Arc<dyn ChannelHandler>) {
        self.handlers.lock().insert(token, handler);
    }

    /// Number of channels currently registered with the reactor.
    pub fn registered_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// The shared selector-thread run-queue.
    pub fn run_queue(&self) -> &RunQueue {
        &self.run_queue
    }

    /// The shared worker thread pool.
    pub fn thread_pool(&self) -> &Arc<ThreadPool> {
        &self.thread_pool
    }

    /// Applies `delta` to `active_readers` directly; used by channel
    /// handlers dispatched synchronously on the reactor thread (outside the
    /// run-queue's own delta summation).
    pub fn adjust_active_readers(&self, delta: i32) {
        self.active_readers.fetch_add(delta as i64, Ordering::AcqRel);
    }

    /// Whether the reactor has entered `STOPPING`.
    pub fn is_stopping(&self) -> bool {
        self.state.load(Ordering::Acquire) == STOPPING
    }

    /// Posts the `Stopper2` task: on the reactor thread, closes every
    /// registered session, then flips the reactor into `STOPPING`.
    ///
    /// `close_all` receives the full list of currently-registered tokens and
    /// is expected to post a close for each (typically by looking each one's
    /// session up in the engine's emitter/session registry).
    pub fn post_stopper2<F>(&self, close_all: F)
    where
        F: FnOnce(&[Token]) + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let handlers = Arc::clone(&self.handlers);
        self.run_queue.enqueue_no_wake(move || {
            let tokens: Vec<Token> = handlers.lock().keys().copied().collect();
            close_all(&tokens);
            state.store(STOPPING, Ordering::Release);
            0
        });
    }
}

/// Owns the multiplexer and runs the single reactor thread's event loop.
pub struct Reactor {
    poll: Poll,
    handle: ReactorHandle,
    active_readers: Arc<AtomicI64>,
    state: Arc<AtomicU8>,
}

impl Reactor {
    /// Builds a reactor and its cross-thread handle. `thread_pool` is shared
    /// with the engine; the reactor never owns worker threads itself.
    pub fn new(thread_pool: Arc<ThreadPool>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = Arc::new(poll.registry().try_clone()?);
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let active_readers = Arc::new(AtomicI64::new(0));
        let state = Arc::new(AtomicU8::new(RUNNING));
        let run_queue = RunQueue::new(Arc::clone(&thread_pool), waker);
        let handle = ReactorHandle {
            registry,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            run_queue,
            thread_pool,
            next_token: Arc::new(AtomicUsize::new(FIRST_CHANNEL_TOKEN)),
            active_readers: Arc::clone(&active_readers),
            state: Arc::clone(&state),
        };
        Ok(Self {
            poll,
            handle,
            active_readers,
            state,
        })
    }

    /// A cloneable cross-thread handle to this reactor.
    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Spawns the dedicated reactor thread and runs the event loop until
    /// shutdown completes.
    pub fn spawn(mut self) -> JoinHandle<()> {
        thread::Builder::new()
            .name("reactor-net-reactor".into())
            .spawn(move || self.run())
            .expect("failed to spawn reactor thread")
    }

    fn run(&mut self) {
        log::debug!("[reactor] loop starting");
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            let stopping = self.state.load(Ordering::Acquire) == STOPPING;
            let timeout = if stopping {
                Some(Duration::ZERO)
            } else if self.active_readers.load(Ordering::Acquire) > 0 {
                Some(Duration::ZERO)
            } else {
                None
            };

            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::debug!("[reactor] poll error: {e}");
                continue;
            }

            self.handle.run_queue.publish_sentinel();

            #[cfg(feature = "trace")]
            log::trace!("[reactor] poll woke with {} ready key(s)", events.iter().count());

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                let handler = self.handle.handlers.lock().get(&event.token()).cloned();
                if let Some(handler) = handler {
                    let delta = handler.handle_ready_ops(event, &self.handle.thread_pool);
                    #[cfg(feature = "trace")]
                    log::trace!(
                        "[reactor] {:?} handle_ready_ops delta={delta}",
                        event.token()
                    );
                    self.active_readers.fetch_add(delta as i64, Ordering::AcqRel);
                }
            }

            let delta = self.handle.run_queue.drain_from_head();
            #[cfg(feature = "trace")]
            log::trace!("[reactor] run-queue batch delta={delta}");
            self.active_readers.fetch_add(delta as i64, Ordering::AcqRel);

            let later_delta = self.handle.run_queue.drain_later();
            debug_assert_eq!(
                later_delta, 0,
                "later-list tasks must never report a non-zero active_readers delta"
            );

            if stopping && self.handle.registered_count() == 0 {
                break;
            }
        }

        log::debug!("[reactor] loop exited");
    }
}

/// A no-op task whose only purpose is to carry a wake-up through the
/// run-queue; useful for tests that want to observe `active_readers`
/// transitions without a real channel.
pub(crate) struct NoopTask;

impl SelectorRunnable for NoopTask {
    fn run_in_selector_thread(self: Box<Self>) -> i32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration as StdDuration;

    #[test]
    fn reactor_starts_and_stops_cleanly_with_no_registrations() {
        let pool = Arc::new(ThreadPool::start(2));
        let reactor = Reactor::new(Arc::clone(&pool)).unwrap();
        let handle = reactor.handle();
        let join = reactor.spawn();

        handle.post_stopper2(|_tokens| {});

        join.join().expect("reactor thread panicked");
        pool.stop_and_wait();
    }

    #[test]
    fn registered_count_reflects_register_and_deregister() {
        let pool = Arc::new(ThreadPool::start(1));
        let reactor = Reactor::new(Arc::clone(&pool)).unwrap();
        let handle = reactor.handle();

        struct Dummy;
        impl ChannelHandler for Dummy {
            fn handle_ready_ops(&self, _e: &Event, _tp: &ThreadPool) -> i32 {
                0
            }
        }

        let mut listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let token = handle.next_token();
        handle
            .register(&mut listener, token, Interest::READABLE, Arc::new(Dummy))
            .unwrap();
        assert_eq!(handle.registered_count(), 1);
        handle.deregister(&mut listener, token).unwrap();
        assert_eq!(handle.registered_count(), 0);

        let join = reactor.spawn();
        handle.post_stopper2(|_| {});
        join.join().unwrap();
        pool.stop_and_wait();
    }

    #[test]
    fn stopper2_closes_sessions_before_flipping_state() {
        let pool = Arc::new(ThreadPool::start(1));
        let reactor = Reactor::new(Arc::clone(&pool)).unwrap();
        let handle = reactor.handle();
        let join = reactor.spawn();

        let closed = Arc::new(AtomicBool::new(false));
        let closed2 = Arc::clone(&closed);
        handle.post_stopper2(move |_tokens| {
            closed2.store(true, Ordering::Release);
        });

        join.join().unwrap();
        assert!(closed.load(Ordering::Acquire));
        pool.stop_and_wait();
    }

    #[test]
    fn idle_reactor_blocks_until_woken_by_run_queue_enqueue() {
        let pool = Arc::new(ThreadPool::start(1));
        let reactor = Reactor::new(Arc::clone(&pool)).unwrap();
        let handle = reactor.handle();
        let join = reactor.spawn();

        thread::sleep(StdDuration::from_millis(20));
        handle.run_queue().enqueue(NoopTask);
        thread::sleep(StdDuration::from_millis(20));

        handle.post_stopper2(|_| {});
        join.join().unwrap();
        pool.stop_and_wait();
    }
}
