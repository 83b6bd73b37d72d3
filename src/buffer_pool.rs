// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Lock-free slab/bump allocator yielding reference-counted byte-buffer
//! slices.
//!
//! # Architecture
//!
//! ```text
//! +----------------------------------------------------------------+
//! |                          BufferPool                             |
//! |  +------------+   CAS    +-------------------------------+     |
//! |  |   state    |<-------->|           current chunk        |     |
//! |  | (AtomicI32)|          |   (ArcSwap<Chunk>)             |     |
//! |  +------------+          +---------------+---------------+     |
//! |                                          |                     |
//! |                                   get/put v                    |
//! |                          +-----------------------------+       |
//! |                          |       ChunkCache             |       |
//! |                          | bounded free-list of storage  |       |
//! |                          +-----------------------------+       |
//! +----------------------------------------------------------------+
//! ```
//!
//! `state` packs two things into one 32-bit word: `state mod chunk_size` is
//! the next free offset inside the current chunk, and the word as a whole is
//! a monotonically advancing generation used to make the allocation CAS
//! ABA-safe. The sentinel value `-1` means "a thread is mid-rotation between
//! chunks; retry". Every chunk is born with a reference count of
//! `capacity + 1`: the extra `+1` is the pool's own claim on the chunk, given
//! up the moment the chunk stops being `current`.
//!
//! Allocation follows the seven cases below (`size` is the upper bound the
//! caller accepts, `min_size` the lower bound):
//!
//! 1. Requested reserved size fits strictly inside the remaining space of the
//!    current chunk: bump `state` and hand back a slice of it (the hot
//!    path, a single CAS).
//! 2. It exactly fills the remaining space: rotate to a fresh chunk, handing
//!    back the remainder of the outgoing one.
//! 3. It overflows the remaining space but `min_size` still fits: same
//!    rotation, but the returned slice shrinks to whatever was left.
//! 4. It overflows and `min_size` doesn't fit either, but `size` is smaller
//!    than a whole chunk: rotate to a fresh chunk and allocate `size` from
//!    its start.
//! 5. `size` equals the chunk size exactly: a dedicated chunk is fetched
//!    out-of-band and reserved whole; the current chunk is left untouched.
//! 6. `size` exceeds the chunk size but `min_size` still fits one: rotate to
//!    a fresh chunk and allocate `min_size` from its start.
//! 7. `min_size` itself exceeds the chunk size: a one-off chunk outside any
//!    cache is allocated, sized to the request, and dies with its single
//!    slice.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::object_cache::ObjectCache;

#[inline]
fn round_up_4(n: usize) -> usize {
    (n + 3) & !3
}

/// Rebase helper for the pool's `state` word.
///
/// `st.wrapping_add(inc)` is the common case; if that would land on a
/// non-positive value (including the reserved `-1` lock sentinel) the word
/// is rebased to `offs + inc`, which keeps the low bits equal to the true
/// in-chunk offset while restarting the monotonic counter.
#[inline]
fn bump(st: i32, inc: i32, offs: i32) -> i32 {
    let raw = st.wrapping_add(inc);
    if raw <= 0 {
        offs + inc
    } else {
        raw
    }
}

// ============================================================================
// Chunk cache
// ============================================================================

/// Bounded free-list of raw chunk storage for one `chunk_size`, built on top
/// of the lock-free [`ObjectCache`] (component A).
struct ChunkCache {
    chunk_size: usize,
    free: ObjectCache<Box<[u8]>>,
}

impl ChunkCache {
    fn new(chunk_size: usize, initial: usize, max_retained: usize) -> Arc<Self> {
        let cache = Arc::new(Self {
            chunk_size,
            free: ObjectCache::new(max_retained.max(1)),
        });
        for _ in 0..initial.min(max_retained) {
            cache.free.put(vec![0u8; chunk_size].into_boxed_slice());
        }
        cache
    }

    /// Pops a chunk from the free-list, allocating fresh storage if empty.
    fn get(self: &Arc<Self>) -> Arc<Chunk> {
        let storage = self
            .free
            .get()
            .unwrap_or_else(|| vec![0u8; self.chunk_size].into_boxed_slice());
        Arc::new(Chunk::new(storage, Some(Arc::clone(self))))
    }

    fn put(&self, storage: Box<[u8]>) {
        self.free.put(storage);
    }

    /// Number of chunks currently retained.
    fn len(&self) -> usize {
        self.free.len()
    }

    fn clear(&self) {
        self.free.clear();
    }
}

// ============================================================================
// Chunk
// ============================================================================

/// A fixed-capacity backing buffer plus a reservation-tracking counter.
///
/// `byte_refcount` starts at `capacity + 1` (the `+1` is the pool's own
/// claim) and is decremented as outstanding `PooledBuffer`s release their
/// `reserved_size`, and as the pool gives up its own claim on rotation. It
/// exists to make the pool's byte-accounting invariant observable and
/// testable; actual memory reclamation rides on `Arc`'s own strong count via
/// `Drop`.
struct Chunk {
    data: UnsafeCell<Box<[u8]>>,
    capacity: usize,
    byte_refcount: AtomicI64,
    cache: Option<Arc<ChunkCache>>,
}

// SAFETY: `data` is only ever sliced through `Chunk::slice`/`slice_mut` with
// offset ranges handed out by `BufferPool`'s CAS allocator, which never
// issues two overlapping ranges from a live chunk. Concurrent disjoint
// mutable access is therefore sound.
unsafe impl Sync for Chunk {}

impl Chunk {
    fn new(storage: Box<[u8]>, cache: Option<Arc<ChunkCache>>) -> Self {
        let capacity = storage.len();
        Self {
            data: UnsafeCell::new(storage),
            capacity,
            byte_refcount: AtomicI64::new(capacity as i64 + 1),
            cache,
        }
    }

    /// Releases `n` bytes (or the pool's single `+1` token when `n == 1` and
    /// the chunk is rotating out) from this chunk's outstanding reservation.
    fn release_tokens(&self, n: usize) {
        let prev = self.byte_refcount.fetch_sub(n as i64, Ordering::AcqRel);
        debug_assert!(
            prev - n as i64 >= 0,
            "chunk refcount underflow: released {n} with only {prev} outstanding"
        );
    }

    #[cfg(test)]
    fn outstanding(&self) -> i64 {
        self.byte_refcount.load(Ordering::Acquire)
    }

    /// # Safety
    /// `offset + len` must lie within `capacity`, and the caller must hold
    /// the unique allocation for that range (enforced by `BufferPool`).
    unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        let data = unsafe { &*self.data.get() };
        &data[offset..offset + len]
    }

    /// # Safety
    /// Same requirements as [`Chunk::slice`], plus the caller must be the
    /// sole holder of a mutable view into this range.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        let data = unsafe { &mut *self.data.get() };
        &mut data[offset..offset + len]
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if let Some(cache) = &self.cache {
            let storage = std::mem::replace(self.data.get_mut(), Box::new([]));
            cache.put(storage);
        }
    }
}

// ============================================================================
// PooledBuffer
// ============================================================================

struct PooledBufferInner {
    chunk: Arc<Chunk>,
    offset: usize,
    size: usize,
    reserved: usize,
}

impl Drop for PooledBufferInner {
    fn drop(&mut self) {
        self.chunk.release_tokens(self.reserved);
    }
}

/// An immutable view `(chunk, offset, logical_size)` into pooled memory.
///
/// Cloning `retain`s the buffer (bumps the outer reference count); the last
/// clone to drop releases `reserved_size` bytes back to the owning chunk.
pub struct PooledBuffer(Arc<PooledBufferInner>);

impl PooledBuffer {
    fn new(chunk: Arc<Chunk>, offset: usize, size: usize, reserved: usize) -> Self {
        Self(Arc::new(PooledBufferInner {
            chunk,
            offset,
            size,
            reserved,
        }))
    }

    /// Logical size requested by the caller.
    pub fn size(&self) -> usize {
        self.0.size
    }

    /// Bytes actually reserved inside the chunk (`round_up_4(size)`, or more
    /// for a shrunk/rotated allocation).
    pub fn reserved(&self) -> usize {
        self.0.reserved
    }

    /// Borrows the buffer's bytes.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { self.0.chunk.slice(self.0.offset, self.0.size) }
    }

    /// Mutably borrows the buffer's bytes, if this is the sole reference.
    ///
    /// Returns `None` if the buffer has been `retain`ed elsewhere, since a
    /// shared mutable view would alias.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let inner = Arc::get_mut(&mut self.0)?;
        Some(unsafe { inner.chunk.slice_mut(inner.offset, inner.size) })
    }

    /// Bumps the outer reference count, returning a new handle to the same
    /// bytes. Equivalent to `Clone::clone`.
    pub fn retain(&self) -> PooledBuffer {
        self.clone()
    }

    /// Shrinks the buffer's reported logical size in place, without touching
    /// the chunk's reservation. Used by the session read path: a full-size
    /// buffer is drawn from the pool before the byte count of an actual
    /// `read()` is known, then truncated down to what was really filled.
    ///
    /// No-op (returns `false`) if this handle has been `retain`ed elsewhere,
    /// since shrinking a shared view would be observable to the other
    /// holder.
    pub fn truncate(&mut self, new_size: usize) -> bool {
        assert!(new_size <= self.0.size, "truncate must shrink, not grow");
        match Arc::get_mut(&mut self.0) {
            Some(inner) => {
                inner.size = new_size;
                true
            }
            None => false,
        }
    }
}

impl Clone for PooledBuffer {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

// ============================================================================
// BufferPool
// ============================================================================

/// Lock-free slab/bump allocator for short-lived network buffers.
pub struct BufferPool {
    chunk_size: usize,
    state: AtomicI32,
    current: ArcSwap<Chunk>,
    cache: Arc<ChunkCache>,
}

impl BufferPool {
    /// Creates a pool of chunks sized `chunk_size`, prefilling its backing
    /// cache with `cache_initial` chunks and retaining at most
    /// `cache_max` on release.
    pub fn new(chunk_size: usize, cache_initial: usize, cache_max: usize) -> Self {
        assert!(
            chunk_size >= 4 && chunk_size % 4 == 0,
            "chunk_size must be a positive multiple of 4"
        );
        let cache = ChunkCache::new(chunk_size, cache_initial, cache_max);
        let first = cache.get();
        Self {
            chunk_size,
            state: AtomicI32::new(0),
            current: ArcSwap::new(first),
            cache,
        }
    }

    /// `alloc(size, size)`.
    pub fn alloc_exact(&self, size: usize) -> PooledBuffer {
        self.alloc(size, size)
    }

    /// Returns a slice of at least `min_size` and at most `size` bytes,
    /// four-byte aligned. See the module docs for the seven allocation
    /// cases.
    pub fn alloc(&self, size: usize, min_size: usize) -> PooledBuffer {
        assert!(min_size <= size, "min_size must not exceed size");
        let cs = self.chunk_size;

        if size > cs {
            return if min_size <= cs {
                self.rotate_and_alloc_fresh(min_size) // case 6
            } else {
                self.alloc_one_off(size) // case 7
            };
        }

        if size == cs {
            return self.alloc_dedicated(size); // case 5
        }

        // size < cs: cases 1-4.
        loop {
            let st = self.state.load(Ordering::Acquire);
            if st == -1 {
                std::hint::spin_loop();
                continue;
            }
            let offs = st.rem_euclid(cs as i32) as usize;
            let space = cs - offs;
            let rs = round_up_4(size);

            if rs < space {
                // Case 1: fits inside the current chunk. The chunk must be
                // captured before the CAS, not after: `current` only ever
                // changes while `state == -1`, so a concurrent rotation
                // between our CAS succeeding and a post-CAS `load_full()`
                // would hand back a slice of the *new* chunk tagged with an
                // offset/size that were only ever valid in the old one.
                let chunk = self.current.load_full();
                let new_st = bump(st, rs as i32, offs as i32);
                if self
                    .state
                    .compare_exchange_weak(st, new_st, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return PooledBuffer::new(chunk, offs, size, rs);
                }
                continue;
            }

            if rs == space || (rs > space && min_size <= space) {
                // Cases 2 & 3: rotate, hand back the outgoing chunk's tail.
                if self
                    .state
                    .compare_exchange(st, -1, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                let outgoing = self.current.load_full();
                outgoing.release_tokens(1);
                let fresh = self.cache.get();
                self.current.store(fresh);
                self.state.store(cs as i32, Ordering::Release); // offs + space == cs
                let ret_size = if rs == space { size } else { space };
                return PooledBuffer::new(outgoing, offs, ret_size, space);
            }

            // Case 4: rs > space and min_size > space.
            return self.rotate_and_alloc_fresh(size);
        }
    }

    /// Drains the backing chunk cache.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Number of chunks currently retained in the backing cache.
    pub fn cached_chunk_count(&self) -> usize {
        self.cache.len()
    }

    /// Cases 4 & 6: abandon the current chunk's remaining space (and the
    /// pool's own `+1` claim on it), rotate to a fresh chunk, and allocate
    /// `alloc_size` from its start.
    fn rotate_and_alloc_fresh(&self, alloc_size: usize) -> PooledBuffer {
        let cs = self.chunk_size;
        loop {
            let st = self.state.load(Ordering::Acquire);
            if st == -1 {
                std::hint::spin_loop();
                continue;
            }
            if self
                .state
                .compare_exchange(st, -1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let offs = st.rem_euclid(cs as i32) as usize;
            let space = cs - offs;
            let outgoing = self.current.load_full();
            outgoing.release_tokens(space + 1);
            let fresh = self.cache.get();
            self.current.store(Arc::clone(&fresh));
            let rs = round_up_4(alloc_size);
            self.state.store(rs as i32, Ordering::Release);
            return PooledBuffer::new(fresh, 0, alloc_size, rs);
        }
    }

    /// Case 5: `size == chunk_size`. Fetched out-of-band; the pool's own
    /// claim is released immediately since nothing will ever sub-allocate
    /// from this chunk again.
    fn alloc_dedicated(&self, size: usize) -> PooledBuffer {
        let fresh = self.cache.get();
        fresh.release_tokens(1);
        PooledBuffer::new(fresh, 0, size, size)
    }

    /// Case 7: request exceeds the chunk size even for `min_size`. A
    /// one-off chunk outside any cache, sized to the request, dies with its
    /// single slice.
    fn alloc_one_off(&self, size: usize) -> PooledBuffer {
        let rs = round_up_4(size);
        let storage = vec![0u8; rs].into_boxed_slice();
        let chunk = Arc::new(Chunk::new(storage, None));
        chunk.release_tokens(1);
        PooledBuffer::new(chunk, 0, size, rs)
    }
}
