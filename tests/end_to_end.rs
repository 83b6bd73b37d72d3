// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end scenarios against real loopback TCP sockets: echo under load,
//! back-pressure, rapid connect/disconnect churn, and shutdown while
//! sessions are still active.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reactor_net::{Engine, EmitterConfig, EngineConfig, Listener, PooledBuffer, SessionHandle};

/// Initialises the `env_logger` subscriber once per test binary so `-- --nocapture`
/// surfaces the engine's `log::debug!`/`log::warn!` output; harmless if a
/// subscriber is already installed.
fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// Echoes every byte it receives straight back to the sender.
struct EchoListener;

impl Listener for EchoListener {
    fn on_data_received(&self, session: &SessionHandle, buffer: PooledBuffer) {
        session.send_data(buffer);
    }

    fn on_connection_closed(&self, _session: &SessionHandle) {}
}

fn start_echo_engine() -> (Arc<Engine>, SocketAddr) {
    let engine = Engine::start(EngineConfig::new()).expect("engine starts");
    let addr = engine
        .register_acceptor(
            "127.0.0.1:0".parse().unwrap(),
            EmitterConfig::new(),
            Arc::new(|_peer| Arc::new(EchoListener) as Arc<dyn Listener>),
        )
        .expect("bind succeeds");
    (engine, addr)
}

/// Ten clients each round-trip a 1 MiB payload through an echo acceptor.
#[test]
fn echo_round_trips_large_payloads_across_many_clients() {
    init_logging();
    let (engine, addr) = start_echo_engine();

    let clients: Vec<_> = (0..10)
        .map(|i| {
            std::thread::spawn(move || {
                let payload: Vec<u8> = (0..1024 * 1024).map(|b| (b ^ i) as u8).collect();
                let mut stream = StdTcpStream::connect(addr).expect("connect");
                stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

                let writer_payload = payload.clone();
                let mut write_half = stream.try_clone().unwrap();
                let writer = std::thread::spawn(move || {
                    write_half.write_all(&writer_payload).unwrap();
                });

                let mut echoed = vec![0u8; payload.len()];
                stream.read_exact(&mut echoed).expect("full echo arrives");
                writer.join().unwrap();
                assert_eq!(echoed, payload, "client {i} got back a corrupted echo");
            })
        })
        .collect();

    for client in clients {
        client.join().expect("client thread panicked");
    }

    assert_eq!(engine.session_count(), 10);
    engine.stop();
    assert_eq!(engine.session_count(), 0);
}

/// A listener that writes back four times what it reads, without pacing its
/// reads against the client — it exercises the outbound queue building up
/// behind a slow reader rather than the read side starving.
struct AmplifyingListener;

impl Listener for AmplifyingListener {
    fn on_data_received(&self, session: &SessionHandle, buffer: PooledBuffer) {
        for _ in 0..4 {
            session.send_data(buffer.retain());
        }
    }

    fn on_connection_closed(&self, _session: &SessionHandle) {}
}

#[test]
fn back_pressure_does_not_drop_or_corrupt_amplified_output() {
    init_logging();
    let engine = Engine::start(EngineConfig::new()).expect("engine starts");
    let addr = engine
        .register_acceptor(
            "127.0.0.1:0".parse().unwrap(),
            EmitterConfig::new().with_input_queue_block_size(4096),
            Arc::new(|_peer| Arc::new(AmplifyingListener) as Arc<dyn Listener>),
        )
        .expect("bind succeeds");

    let mut stream = StdTcpStream::connect(addr).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    let chunk = vec![0x5Au8; 4096];
    let expected_total = chunk.len() * 4 * 20;

    let writer_chunk = chunk.clone();
    let mut write_half = stream.try_clone().unwrap();
    let writer = std::thread::spawn(move || {
        for _ in 0..20 {
            write_half.write_all(&writer_chunk).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
    });

    // A deliberately slow reader: drains in small pieces so the outbound
    // queue on the session side has to hold more than one pending buffer.
    let mut received = 0usize;
    let mut small = [0u8; 512];
    while received < expected_total {
        let n = stream.read(&mut small).expect("read does not error");
        assert!(n > 0, "peer closed before delivering the full amplified stream");
        assert!(small[..n].iter().all(|&b| b == 0x5A), "amplified bytes must be unchanged");
        received += n;
    }

    writer.join().unwrap();
    engine.stop();
}

struct CountingListener {
    closed: Arc<AtomicUsize>,
    unexpected_errors: Arc<AtomicUsize>,
}

impl Listener for CountingListener {
    fn on_data_received(&self, _session: &SessionHandle, _buffer: PooledBuffer) {}

    fn on_connection_closed(&self, session: &SessionHandle) {
        // A peer-initiated TCP close surfaces as a clean EOF, not an I/O
        // error, so `take_last_error` must come back empty here.
        if session.take_last_error().is_some() {
            self.unexpected_errors.fetch_add(1, Ordering::AcqRel);
        }
        self.closed.fetch_add(1, Ordering::AcqRel);
    }
}

/// Many short-lived connections in quick succession must each get exactly
/// one `on_connection_closed` and leave no session behind in the registry.
#[test]
fn rapid_connect_disconnect_leaves_no_leaked_sessions() {
    init_logging();
    let engine = Engine::start(EngineConfig::new()).expect("engine starts");
    let closed = Arc::new(AtomicUsize::new(0));
    let unexpected_errors = Arc::new(AtomicUsize::new(0));
    let addr = {
        let closed = Arc::clone(&closed);
        let unexpected_errors = Arc::clone(&unexpected_errors);
        engine
            .register_acceptor(
                "127.0.0.1:0".parse().unwrap(),
                EmitterConfig::new(),
                Arc::new(move |_peer| {
                    Arc::new(CountingListener {
                        closed: Arc::clone(&closed),
                        unexpected_errors: Arc::clone(&unexpected_errors),
                    }) as Arc<dyn Listener>
                }),
            )
            .expect("bind succeeds")
    };

    const ROUNDS: usize = 50;
    for _ in 0..ROUNDS {
        let stream = StdTcpStream::connect(addr).expect("connect");
        drop(stream);
    }

    // Closing is driven by the reactor/worker threads asynchronously; give
    // the engine a bounded window to notice every peer-initiated close.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while closed.load(Ordering::Acquire) < ROUNDS && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(closed.load(Ordering::Acquire), ROUNDS);
    assert_eq!(unexpected_errors.load(Ordering::Acquire), 0);
    assert_eq!(engine.session_count(), 0);
    engine.stop();
}

/// `stop()` while connections are actively exchanging data must still
/// deliver exactly one `on_connection_closed` per live session and return
/// only once the reactor thread has actually exited.
#[test]
fn shutdown_under_load_closes_every_active_session_once() {
    init_logging();
    let closed = Arc::new(AtomicUsize::new(0));
    let unexpected_errors = Arc::new(AtomicUsize::new(0));
    let engine = Engine::start(EngineConfig::new()).expect("engine starts");
    let addr = {
        let closed = Arc::clone(&closed);
        let unexpected_errors = Arc::clone(&unexpected_errors);
        engine
            .register_acceptor(
                "127.0.0.1:0".parse().unwrap(),
                EmitterConfig::new(),
                Arc::new(move |_peer| {
                    Arc::new(CountingListener {
                        closed: Arc::clone(&closed),
                        unexpected_errors: Arc::clone(&unexpected_errors),
                    }) as Arc<dyn Listener>
                }),
            )
            .expect("bind succeeds")
    };

    let keep_sending = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let streams = Arc::new(Mutex::new(Vec::new()));
    let senders: Vec<_> = (0..8)
        .map(|_| {
            let keep_sending = Arc::clone(&keep_sending);
            let streams = Arc::clone(&streams);
            std::thread::spawn(move || {
                let mut stream = StdTcpStream::connect(addr).expect("connect");
                stream.set_write_timeout(Some(Duration::from_millis(200))).ok();
                let payload = [0u8; 256];
                while keep_sending.load(Ordering::Acquire) {
                    if stream.write_all(&payload).is_err() {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
                streams.lock().unwrap().push(stream);
            })
        })
        .collect();

    // Let the sessions actually exchange a few rounds of data before tearing
    // the engine down underneath them.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(engine.session_count(), 8);

    engine.stop();
    keep_sending.store(false, Ordering::Release);
    for sender in senders {
        let _ = sender.join();
    }

    assert_eq!(closed.load(Ordering::Acquire), 8);
    assert_eq!(unexpected_errors.load(Ordering::Acquire), 0);
    assert_eq!(engine.session_count(), 0);
    assert!(engine.is_stopped());
}
