// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `Engine`: the top-level object wiring the reactor, thread pool, emitter
//! registry, and session registry together.
//!
//! Multiple engines may coexist in one process; there is no process-wide
//! singleton. `start()` spawns the dedicated reactor thread; `stop()` drives
//! a two-hop shutdown sequence: `Stopper1` quiesces emitters off the reactor
//! thread, `Stopper2` closes every session on the reactor thread.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::config::{EmitterConfig, EngineConfig};
use crate::emitter::{Acceptor, Connector, Emitter, EmitterErrorSink, EmitterRegistry, ListenerFactory, SessionRegistry};
use crate::error::EngineError;
use crate::reactor::{Reactor, ReactorHandle};
use crate::session::Listener;
use crate::thread_pool::ThreadPool;

/// The top-level engine: one reactor thread, one shared thread pool, and
/// the acceptors/connectors/sessions registered against it.
pub struct Engine {
    reactor_handle: ReactorHandle,
    reactor_join: Mutex<Option<JoinHandle<()>>>,
    thread_pool: Arc<ThreadPool>,
    emitters: EmitterRegistry,
    sessions: SessionRegistry,
    stopped: AtomicBool,
}

/// Default sink: logs exceptions at `warn` level. Supplied when the caller
/// doesn't provide its own [`EmitterErrorSink`].
struct LoggingErrorSink;

impl EmitterErrorSink for LoggingErrorSink {
    fn on_exception(&self, err: EngineError) {
        log::warn!("[engine] emitter exception: {err}");
    }
}

impl Engine {
    /// Builds and starts an engine: spawns the thread pool and the reactor
    /// thread immediately.
    pub fn start(config: EngineConfig) -> io::Result<Arc<Engine>> {
        let thread_pool = Arc::new(ThreadPool::start(config.resolved_thread_count()));
        let reactor = Reactor::new(Arc::clone(&thread_pool))?;
        let reactor_handle = reactor.handle();
        let join = reactor.spawn();

        log::debug!(
            "[engine] started: {} worker threads",
            config.resolved_thread_count()
        );

        Ok(Arc::new(Engine {
            reactor_handle,
            reactor_join: Mutex::new(Some(join)),
            thread_pool,
            emitters: EmitterRegistry::new(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Binds a listening socket and registers an [`Acceptor`] for it. Each
    /// accepted connection is handed to a [`Listener`] produced by
    /// `listener_factory`.
    pub fn register_acceptor(
        self: &Arc<Self>,
        addr: SocketAddr,
        config: EmitterConfig,
        listener_factory: ListenerFactory,
    ) -> Result<SocketAddr, EngineError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::EngineStopped);
        }
        let acceptor = Acceptor::bind(
            addr,
            config,
            listener_factory,
            self.reactor_handle.clone(),
            Arc::clone(&self.sessions),
            Arc::new(LoggingErrorSink),
        )?;
        let bound = acceptor.local_addr()?;
        self.emitters.insert(acceptor as Arc<dyn Emitter>);
        Ok(bound)
    }

    /// Initiates a non-blocking outbound connection, completing
    /// asynchronously on the reactor thread; `listener` observes the
    /// resulting session once the connect finishes.
    pub fn connect(
        self: &Arc<Self>,
        addr: SocketAddr,
        config: EmitterConfig,
        listener: Arc<dyn Listener>,
    ) -> Result<(), EngineError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::EngineStopped);
        }
        let connector = Connector::connect(
            addr,
            config,
            listener,
            self.reactor_handle.clone(),
            Arc::clone(&self.sessions),
            Arc::new(LoggingErrorSink),
        )?;
        self.emitters.insert(connector as Arc<dyn Emitter>);
        Ok(())
    }

    /// Number of emitters (acceptors + connectors) currently registered.
    pub fn emitter_count(&self) -> usize {
        self.emitters.len()
    }

    /// Number of live sessions currently tracked.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Drives the two-hop shutdown sequence and blocks until the reactor
    /// thread exits and the thread pool has drained.
    ///
    /// `Stopper1` (emitter quiesce) and the emitter `stop_and_wait` calls
    /// run on a thread-pool worker, never on the reactor thread, since an
    /// emitter's own teardown may briefly block. `Stopper2` (session close)
    /// is posted onto the reactor's run-queue so it executes on the reactor
    /// thread, where key interest sets may safely be touched.
    pub fn stop(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let emitters = self.emitters.snapshot();
        let sessions = Arc::clone(&self.sessions);
        let reactor_handle = self.reactor_handle.clone();

        self.thread_pool.execute(move || {
            for emitter in &emitters {
                emitter.stop_and_wait();
            }
            reactor_handle.post_stopper2(move |_tokens| {
                let drained: Vec<_> = sessions.lock().drain().map(|(_, s)| s).collect();
                for session in drained {
                    session.close_connection();
                }
            });
        });

        if let Some(join) = self.reactor_join.lock().take() {
            let _ = join.join();
        }
        self.thread_pool.stop_and_wait();
        log::debug!("[engine] stopped");
    }

    /// Whether [`Engine::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::PooledBuffer;
    use crate::session::SessionHandle;
    use std::sync::Mutex as StdMutex;

    struct EchoListener {
        received: StdMutex<Vec<u8>>,
        closed: Arc<AtomicBool>,
    }

    impl Listener for EchoListener {
        fn on_data_received(&self, session: &SessionHandle, buffer: PooledBuffer) {
            self.received.lock().unwrap().extend_from_slice(buffer.as_slice());
            session.send_data(buffer.retain());
        }

        fn on_connection_closed(&self, _session: &SessionHandle) {
            self.closed.store(true, Ordering::Release);
        }
    }

    #[test]
    fn engine_starts_and_stops_with_no_emitters() {
        let engine = Engine::start(EngineConfig::new()).unwrap();
        assert_eq!(engine.emitter_count(), 0);
        engine.stop();
        assert!(engine.is_stopped());
    }

    #[test]
    fn register_acceptor_binds_and_reports_local_addr() {
        let engine = Engine::start(EngineConfig::new()).unwrap();
        let closed = Arc::new(AtomicBool::new(false));
        let factory: ListenerFactory = {
            let closed = Arc::clone(&closed);
            Arc::new(move |_peer| {
                Arc::new(EchoListener {
                    received: StdMutex::new(Vec::new()),
                    closed: Arc::clone(&closed),
                }) as Arc<dyn Listener>
            })
        };
        let bound = engine
            .register_acceptor("127.0.0.1:0".parse().unwrap(), EmitterConfig::new(), factory)
            .unwrap();
        assert_eq!(engine.emitter_count(), 1);
        assert!(bound.port() > 0);
        engine.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let engine = Engine::start(EngineConfig::new()).unwrap();
        engine.stop();
        engine.stop();
        assert!(engine.is_stopped());
    }

    #[test]
    fn operations_after_stop_return_engine_stopped() {
        let engine = Engine::start(EngineConfig::new()).unwrap();
        engine.stop();
        let factory: ListenerFactory = Arc::new(|_peer| {
            Arc::new(EchoListener {
                received: StdMutex::new(Vec::new()),
                closed: Arc::new(AtomicBool::new(false)),
            }) as Arc<dyn Listener>
        });
        let err = engine
            .register_acceptor("127.0.0.1:0".parse().unwrap(), EmitterConfig::new(), factory)
            .unwrap_err();
        assert!(matches!(err, EngineError::EngineStopped));
    }
}
