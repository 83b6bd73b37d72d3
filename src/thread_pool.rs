// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Fixed-size FIFO worker pool.
//!
//! No priorities, no per-task timeouts, no work stealing: a single shared
//! queue guarded by a `parking_lot` mutex/condvar, drained in order by `N`
//! worker threads. The reactor posts selector-thread alarms and per-session
//! read/write jobs here; workers never touch the multiplexer directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

/// A unit of work executed by a worker thread.
pub trait Runnable: Send + 'static {
    fn run(self: Box<Self>);
}

impl<F: FnOnce() + Send + 'static> Runnable for F {
    fn run(self: Box<Self>) {
        (*self)()
    }
}

struct Shared {
    queue: Mutex<std::collections::VecDeque<Box<dyn Runnable>>>,
    not_empty: Condvar,
    stopping: AtomicBool,
}

/// A fixed-size FIFO thread pool.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawns `threads` worker threads, each blocking on the shared queue.
    pub fn start(threads: usize) -> Self {
        let threads = threads.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(std::collections::VecDeque::new()),
            not_empty: Condvar::new(),
            stopping: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(threads);
        for idx in 0..threads {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("reactor-net-worker-{idx}"))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        log::debug!("[thread_pool] started with {threads} worker threads");
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues `task`, waking exactly one idle worker.
    pub fn execute<R: Runnable>(&self, task: R) {
        if self.shared.stopping.load(Ordering::Acquire) {
            log::debug!("[thread_pool] dropping task submitted after stop");
            return;
        }
        let mut queue = self.shared.queue.lock();
        queue.push_back(Box::new(task));
        self.shared.not_empty.notify_one();
    }

    /// Signals shutdown, lets every worker drain the queue to empty, then
    /// joins all threads.
    pub fn stop_and_wait(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.not_empty.notify_all();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        log::debug!("[thread_pool] stopped");
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if shared.stopping.load(Ordering::Acquire) {
                    break None;
                }
                shared.not_empty.wait(&mut queue);
            }
        };
        match task {
            Some(task) => task.run(),
            None => break,
        }
    }
}
