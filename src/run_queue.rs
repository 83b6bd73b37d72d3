// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Lock-free multi-producer, single-consumer run-queue of tasks destined for
//! the reactor thread.
//!
//! Modelled as an intrusive singly-linked list with two shared cursors,
//! `HEAD` and `TAIL` ([`HEAD_SLOT`]/[`TAIL_SLOT`] below name their historical
//! home in a 47-entry, cache-line-padded atomic array; we keep the slot
//! numbering for continuity with that layout even though each cursor is its
//! own field here).
//!
//! `enqueue` swaps `TAIL` for the new node and links the previous tail to it;
//! if the swapped-out tail was null the queue was empty, so the new node also
//! becomes `HEAD` and, if requested, a recyclable alarm task is posted to the
//! worker pool to wake the reactor's blocking poll. The reactor drains a
//! batch by CAS-publishing a dummy sentinel into `TAIL` (closing the batch to
//! late arrivals) and walking from `HEAD`; if it reaches a node whose `next`
//! is still null and the sentinel-publish race means some other producer beat
//! it to `TAIL`, it spins until that producer finishes linking `next`.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use mio::Waker;
use parking_lot::Mutex;

use crate::thread_pool::ThreadPool;

/// Historical slot index of the run-queue head in the 47-entry padded array.
pub const HEAD_SLOT: usize = 15;
/// Historical slot index of the run-queue tail in the 47-entry padded array.
pub const TAIL_SLOT: usize = 31;

/// A task destined for the reactor thread.
///
/// Returns the delta to apply to the reactor's `active_readers` counter:
/// positive when the task has posted further work the reactor should wait
/// on, negative when it completes such work, zero otherwise.
pub trait SelectorRunnable: Send {
    fn run_in_selector_thread(self: Box<Self>) -> i32;
}

impl<F: FnOnce() -> i32 + Send> SelectorRunnable for F {
    fn run_in_selector_thread(self: Box<Self>) -> i32 {
        (*self)()
    }
}

/// Batch-boundary sentinel: a no-op runnable with a zero delta.
struct DummyRunnable;

impl SelectorRunnable for DummyRunnable {
    fn run_in_selector_thread(self: Box<Self>) -> i32 {
        0
    }
}

struct Node {
    next: AtomicPtr<Node>,
    task: Option<Box<dyn SelectorRunnable>>,
}

impl Node {
    fn new_raw(task: Box<dyn SelectorRunnable>) -> *mut Node {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            task: Some(task),
        }))
    }
}

struct Inner {
    head: AtomicPtr<Node>,
    tail: AtomicPtr<Node>,
    alarm_pending: AtomicBool,
    later: Mutex<Vec<Box<dyn SelectorRunnable>>>,
    thread_pool: Arc<ThreadPool>,
    waker: Arc<Waker>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            // SAFETY: every still-linked node was heap-allocated by
            // `Node::new_raw` and not yet freed, since consumption always
            // frees as it advances past a node.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Ordering::Acquire);
        }
    }
}

/// A handle to the lock-free selector-thread run-queue.
///
/// Cheaply `Clone`-able; every clone shares the same underlying queue.
#[derive(Clone)]
pub struct RunQueue(Arc<Inner>);

impl RunQueue {
    /// Creates an empty run-queue. `thread_pool` carries the recyclable
    /// alarm task; `waker` wakes the reactor's blocking poll.
    pub fn new(thread_pool: Arc<ThreadPool>, waker: Arc<Waker>) -> Self {
        Self(Arc::new(Inner {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            alarm_pending: AtomicBool::new(false),
            later: Mutex::new(Vec::new()),
            thread_pool,
            waker,
        }))
    }

    /// Enqueues `task`, posting a wake alarm through the thread pool if the
    /// queue was empty.
    pub fn enqueue<R: SelectorRunnable + 'static>(&self, task: R) {
        self.push(Box::new(task), true);
    }

    /// Enqueues `task` without ever posting a wake alarm, even if the queue
    /// was empty. Used when the caller knows the reactor will observe the
    /// queue some other way (e.g. it is about to poll anyway).
    pub fn enqueue_no_wake<R: SelectorRunnable + 'static>(&self, task: R) {
        self.push(Box::new(task), false);
    }

    /// Queues `task` on the reactor-thread-private `later` list, drained
    /// strictly after the current batch. Intended only for tasks that never
    /// alter `active_readers`.
    pub fn enqueue_later<R: SelectorRunnable + 'static>(&self, task: R) {
        self.0.later.lock().push(Box::new(task));
    }

    fn push(&self, task: Box<dyn SelectorRunnable>, wake: bool) {
        let node = Node::new_raw(task);
        let prev = self.0.tail.swap(node, Ordering::AcqRel);
        if prev.is_null() {
            self.0.head.store(node, Ordering::Release);
            if wake {
                self.post_alarm(node);
            }
        } else {
            // SAFETY: `prev` was the tail just swapped out; it is still
            // live because nothing frees a node before linking past it, and
            // no other producer can observe or mutate `prev.next` before we
            // do (it is only ever written once, by whichever enqueue swapped
            // `prev` out of `tail`).
            unsafe { (*prev).next.store(node, Ordering::Release) };
        }
    }

    /// Posts the recyclable wake alarm if one is not already pending.
    ///
    /// `captured` is compared by address only (never dereferenced) against
    /// the live head once the alarm runs in its worker thread; a mismatch
    /// means the batch already drained and the wake would be redundant.
    fn post_alarm(&self, captured: *mut Node) {
        if self
            .0
            .alarm_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let inner = Arc::clone(&self.0);
        let captured_addr = captured as usize;
        inner.thread_pool.execute(move || {
            if inner.head.load(Ordering::Acquire) as usize == captured_addr {
                if let Err(e) = inner.waker.wake() {
                    log::debug!("[run_queue] waker.wake() failed: {e}");
                }
            }
            inner.alarm_pending.store(false, Ordering::Release);
        });
    }

    /// Publishes a batch-boundary sentinel into `TAIL`, guaranteeing `HEAD`
    /// becomes non-null. Called right after polling the multiplexer and
    /// before dispatching ready keys, so any tasks those keys post land
    /// after the sentinel and are walked opportunistically rather than
    /// required for this iteration's progress.
    pub fn publish_sentinel(&self) {
        let sentinel = Node::new_raw(Box::new(DummyRunnable));
        let prev = self.0.tail.swap(sentinel, Ordering::AcqRel);
        if prev.is_null() {
            self.0.head.store(sentinel, Ordering::Release);
        } else {
            unsafe { (*prev).next.store(sentinel, Ordering::Release) };
        }
    }

    /// Convenience wrapper used by tests and off-loop callers: publishes the
    /// sentinel and immediately drains from `HEAD`.
    pub fn drain_batch(&self) -> i32 {
        self.publish_sentinel();
        self.drain_from_head()
    }

    /// Walks the list from `HEAD`, running each task and summing its
    /// `active_readers` delta, until the queue transiently empties. Must
    /// only be called from the reactor thread, and only after a sentinel
    /// has been published at least once since the queue was created.
    pub fn drain_from_head(&self) -> i32 {
        let mut node = self.0.head.load(Ordering::Acquire);
        while node.is_null() {
            std::hint::spin_loop();
            node = self.0.head.load(Ordering::Acquire);
        }

        let mut delta = 0i32;
        loop {
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            if next.is_null() {
                if self
                    .0
                    .tail
                    .compare_exchange(node, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    delta += Self::run_and_free(node);
                    self.0.head.store(ptr::null_mut(), Ordering::Release);
                    break;
                }
                // A producer swapped in a new tail but hasn't linked `next`
                // yet; it is guaranteed to do so shortly.
                let linked = loop {
                    let n = unsafe { (*node).next.load(Ordering::Acquire) };
                    if !n.is_null() {
                        break n;
                    }
                    std::hint::spin_loop();
                };
                delta += Self::run_and_free(node);
                self.0.head.store(linked, Ordering::Release);
                node = linked;
            } else {
                delta += Self::run_and_free(node);
                self.0.head.store(next, Ordering::Release);
                node = next;
            }
        }
        delta
    }

    /// Runs and drops every task on the `later` list, in FIFO order. Must be
    /// called strictly after [`RunQueue::drain_batch`].
    pub fn drain_later(&self) -> i32 {
        let tasks: Vec<_> = std::mem::take(&mut self.0.later.lock());
        let mut delta = 0i32;
        for task in tasks {
            delta += task.run_in_selector_thread();
        }
        delta
    }

    fn run_and_free(node: *mut Node) -> i32 {
        // SAFETY: `node` was produced by `Node::new_raw` and is consumed
        // exactly once, right before the only pointer to it (`head`/`next`)
        // is advanced past it.
        let mut boxed = unsafe { Box::from_raw(node) };
        let task = boxed.task.take().expect("node run more than once");
        task.run_in_selector_thread()
    }
}
