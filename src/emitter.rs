// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Acceptor and connector channel handlers: the engine's listening and
//! outbound-connect glue, plus the registry that tracks them for shutdown.
//!
//! Both emitters implement [`ChannelHandler`] directly (they are themselves
//! registered with the reactor under their own token) and [`Emitter`], the
//! capability the engine uses to quiesce them during `stop()`. Errors during
//! setup or an accept/connect failure surface through [`EmitterErrorSink`]
//! rather than closing anything silently.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};

use crate::buffer_pool::BufferPool;
use crate::config::EmitterConfig;
use crate::error::EngineError;
use crate::reactor::{ChannelHandler, ReactorHandle};
use crate::session::{Listener, Session, SessionHandle};
pub use crate::session::SessionRegistry;
use crate::thread_pool::ThreadPool;

/// Receives errors that can't be attributed to a single session: failed
/// accepts, failed outbound connects, registration failures.
pub trait EmitterErrorSink: Send + Sync {
    fn on_exception(&self, err: EngineError);
}

/// Produces one [`Listener`] per accepted/connected session. Acceptors
/// typically return a shared listener instance; connectors commonly build
/// one per call since each `connect` is a distinct logical peer.
pub type ListenerFactory = Arc<dyn Fn(SocketAddr) -> Arc<dyn Listener> + Send + Sync>;

/// Capability the engine uses to quiesce an emitter off the reactor thread
/// during the two-hop shutdown sequence (see [`crate::reactor::ReactorHandle::post_stopper2`]).
pub trait Emitter: Send + Sync {
    /// Stops accepting/connecting and releases the emitter's own socket.
    /// May block briefly; never called on the reactor thread.
    fn stop_and_wait(&self);
}

/// Listens on a bound, non-blocking TCP socket; on `accept` readiness,
/// wraps each new stream in a [`Session`] registered for read interest.
pub struct Acceptor {
    listener: Mutex<TcpListener>,
    token: Token,
    config: EmitterConfig,
    listener_factory: ListenerFactory,
    input_pool: Arc<BufferPool>,
    reactor: ReactorHandle,
    sessions: SessionRegistry,
    error_sink: Arc<dyn EmitterErrorSink>,
}

impl Acceptor {
    /// Binds `addr` and registers the resulting listener with `reactor`
    /// under a freshly allocated token. `reuse_addr` is taken from `config`.
    pub fn bind(
        addr: SocketAddr,
        config: EmitterConfig,
        listener_factory: ListenerFactory,
        reactor: ReactorHandle,
        sessions: SessionRegistry,
        error_sink: Arc<dyn EmitterErrorSink>,
    ) -> Result<Arc<Acceptor>, EngineError> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(config.reuse_addr)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        let std_listener: std::net::TcpListener = socket.into();
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener);

        let token = reactor.next_token();
        let input_pool = Arc::new(BufferPool::new(
            config.input_queue_block_size,
            config.input_queue_cache_initial_size,
            config.input_queue_cache_max_size,
        ));

        let acceptor = Arc::new(Acceptor {
            listener: Mutex::new(listener),
            token,
            config,
            listener_factory,
            input_pool,
            reactor: reactor.clone(),
            sessions,
            error_sink,
        });

        reactor.register(
            &mut *acceptor.listener.lock(),
            token,
            Interest::READABLE,
            Arc::clone(&acceptor) as Arc<dyn ChannelHandler>,
        )?;

        Ok(acceptor)
    }

    /// The reactor token this acceptor is registered under.
    pub fn token(&self) -> Token {
        self.token
    }

    /// The local address this acceptor is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.lock().local_addr()
    }

    fn accept_all(&self, thread_pool: &ThreadPool) {
        loop {
            let accepted = self.listener.lock().accept();
            match accepted {
                Ok((stream, remote_addr)) => self.wrap_and_register(stream, remote_addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.error_sink.on_exception(EngineError::Io(e));
                    break;
                }
            }
        }
        let _ = thread_pool;
    }

    fn wrap_and_register(&self, stream: TcpStream, remote_addr: SocketAddr) {
        let local_addr = match stream.local_addr() {
            Ok(a) => a,
            Err(e) => {
                self.error_sink.on_exception(EngineError::Io(e));
                return;
            }
        };
        let token = self.reactor.next_token();
        let listener = (self.listener_factory)(remote_addr);
        let session = Session::new(
            token,
            stream,
            local_addr,
            remote_addr,
            listener,
            Arc::clone(&self.input_pool),
            self.config.input_queue_block_size,
            self.reactor.clone(),
            Arc::clone(&self.sessions),
        );

        if let Err(e) = session.register_with_reactor(Interest::READABLE) {
            self.error_sink.on_exception(EngineError::Io(e));
            return;
        }
        self.sessions.lock().insert(token, session);
    }
}

impl ChannelHandler for Acceptor {
    fn handle_ready_ops(&self, _event: &Event, thread_pool: &ThreadPool) -> i32 {
        self.accept_all(thread_pool);
        0
    }
}

impl Emitter for Acceptor {
    fn stop_and_wait(&self) {
        let _ = self.reactor.deregister(&mut *self.listener.lock(), self.token);
    }
}

/// State of an in-flight outbound connection attempt.
enum ConnectState {
    Pending(TcpStream),
    Done,
}

/// Initiates a non-blocking outbound TCP connection; on `writable`
/// readiness (the non-blocking-connect completion signal) finalises the
/// socket and wraps it in a [`Session`].
pub struct Connector {
    state: Mutex<ConnectState>,
    token: Token,
    remote_addr: SocketAddr,
    config: EmitterConfig,
    listener: Arc<dyn Listener>,
    input_pool: Arc<BufferPool>,
    reactor: ReactorHandle,
    sessions: SessionRegistry,
    error_sink: Arc<dyn EmitterErrorSink>,
}

impl Connector {
    /// Starts a non-blocking connect to `addr`, registering for write
    /// readiness (connect completion).
    pub fn connect(
        addr: SocketAddr,
        config: EmitterConfig,
        listener: Arc<dyn Listener>,
        reactor: ReactorHandle,
        sessions: SessionRegistry,
        error_sink: Arc<dyn EmitterErrorSink>,
    ) -> Result<Arc<Connector>, EngineError> {
        let stream = TcpStream::connect(addr)?;
        let token = reactor.next_token();
        let input_pool = Arc::new(BufferPool::new(
            config.input_queue_block_size,
            config.input_queue_cache_initial_size,
            config.input_queue_cache_max_size,
        ));

        let connector = Arc::new(Connector {
            state: Mutex::new(ConnectState::Pending(stream)),
            token,
            remote_addr: addr,
            config,
            listener,
            input_pool,
            reactor: reactor.clone(),
            sessions,
            error_sink,
        });

        {
            let mut state = connector.state.lock();
            let ConnectState::Pending(stream) = &mut *state else {
                unreachable!("connector just constructed, always Pending");
            };
            reactor.register(
                stream,
                token,
                Interest::WRITABLE,
                Arc::clone(&connector) as Arc<dyn ChannelHandler>,
            )?;
        }

        Ok(connector)
    }

    fn finish_connect(&self, thread_pool: &ThreadPool) {
        let mut stream = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, ConnectState::Done) {
                ConnectState::Pending(s) => s,
                ConnectState::Done => return,
            }
        };

        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                self.error_sink.on_exception(EngineError::Io(e));
                let _ = self.reactor.deregister(&mut stream, self.token);
                return;
            }
        }

        let local_addr = match stream.local_addr() {
            Ok(a) => a,
            Err(e) => {
                self.error_sink.on_exception(EngineError::Io(e));
                return;
            }
        };

        let session = Session::new(
            self.token,
            stream,
            local_addr,
            self.remote_addr,
            Arc::clone(&self.listener),
            Arc::clone(&self.input_pool),
            self.config.input_queue_block_size,
            self.reactor.clone(),
            Arc::clone(&self.sessions),
        );
        if let Err(e) = session.reregister_with_reactor(Interest::READABLE) {
            self.error_sink.on_exception(EngineError::Io(e));
            return;
        }
        // Re-point the handler registration at the session: the connector's
        // own dispatch-table entry for this token is replaced rather than
        // re-registered, since the socket itself keeps its existing `mio`
        // registration across the handoff.
        self.reactor
            .replace_handler(self.token, Arc::clone(&session) as Arc<dyn ChannelHandler>);
        self.sessions.lock().insert(self.token, session);
        let _ = thread_pool;
    }
}

impl ChannelHandler for Connector {
    fn handle_ready_ops(&self, _event: &Event, thread_pool: &ThreadPool) -> i32 {
        self.finish_connect(thread_pool);
        0
    }
}

impl Emitter for Connector {
    fn stop_and_wait(&self) {
        if let ConnectState::Pending(mut stream) =
            std::mem::replace(&mut *self.state.lock(), ConnectState::Done)
        {
            let _ = self.reactor.deregister(&mut stream, self.token);
        }
    }
}

/// A mutex-guarded table of registered emitters, keyed by an
/// engine-assigned id. The registry lock is a leaf: never held across I/O,
/// never acquired while holding a session lock.
#[derive(Default)]
pub struct EmitterRegistry {
    emitters: Mutex<HashMap<u64, Arc<dyn Emitter>>>,
    next_id: AtomicU64,
}

impl EmitterRegistry {
    pub fn new() -> Self {
        Self {
            emitters: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers `emitter`, returning its registry id.
    pub fn insert(&self, emitter: Arc<dyn Emitter>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.emitters.lock().insert(id, emitter);
        id
    }

    /// Removes and returns the emitter registered under `id`, if any.
    pub fn remove(&self, id: u64) -> Option<Arc<dyn Emitter>> {
        self.emitters.lock().remove(&id)
    }

    /// Snapshots every registered emitter. Used by shutdown (`Stopper1`):
    /// the snapshot is taken under the lock, but `stop_and_wait` itself runs
    /// after the lock is released.
    pub fn snapshot(&self) -> Vec<Arc<dyn Emitter>> {
        self.emitters.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.emitters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.emitters.lock().is_empty()
    }
}
