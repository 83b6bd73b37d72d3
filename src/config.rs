// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Engine and emitter configuration.
//!
//! Plain `Clone + Debug` structs with `Default` impls and builder-style
//! `with_*` setters — no external config-file parsing, that's out of scope
//! for this crate.

/// Top-level engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Number of worker threads in the thread pool. `0` means auto:
    /// `max(4, num_cpus)`.
    pub thread_pool_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thread_pool_threads: 0,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an explicit worker thread count (0 keeps the auto default).
    pub fn with_thread_pool_threads(mut self, n: usize) -> Self {
        self.thread_pool_threads = n;
        self
    }

    /// Resolves `thread_pool_threads` to a concrete worker count.
    pub fn resolved_thread_count(&self) -> usize {
        if self.thread_pool_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .max(4)
        } else {
            self.thread_pool_threads
        }
    }
}

/// Per-emitter (acceptor/connector) configuration.
#[derive(Clone, Debug)]
pub struct EmitterConfig {
    /// Chunk size for per-session input buffers, in bytes.
    pub input_queue_block_size: usize,

    /// Initial prefill count for the per-emitter input buffer chunk cache.
    pub input_queue_cache_initial_size: usize,

    /// Maximum number of chunks the input buffer chunk cache retains.
    pub input_queue_cache_max_size: usize,

    /// Whether to prefer OS-page-backed buffers over heap-backed ones.
    ///
    /// Accepted for interface parity with the original system; both values
    /// currently route to the same heap `Vec<u8>` chunk storage (see
    /// DESIGN.md, Open Question 4).
    pub use_direct_buffers: bool,

    /// `SO_REUSEADDR` for acceptors. Ignored by connectors.
    pub reuse_addr: bool,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            input_queue_block_size: 64 * 1024,
            input_queue_cache_initial_size: 4,
            input_queue_cache_max_size: 64,
            use_direct_buffers: false,
            reuse_addr: true,
        }
    }
}

impl EmitterConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the chunk size used for this emitter's input buffers.
    pub fn with_input_queue_block_size(mut self, size: usize) -> Self {
        self.input_queue_block_size = size;
        self
    }

    /// Sets the chunk cache prefill count.
    pub fn with_input_queue_cache_initial_size(mut self, n: usize) -> Self {
        self.input_queue_cache_initial_size = n;
        self
    }

    /// Sets the chunk cache maximum retained count.
    pub fn with_input_queue_cache_max_size(mut self, n: usize) -> Self {
        self.input_queue_cache_max_size = n;
        self
    }

    /// Sets whether to prefer OS-page-backed buffers.
    pub fn with_use_direct_buffers(mut self, yes: bool) -> Self {
        self.use_direct_buffers = yes;
        self
    }

    /// Sets `SO_REUSEADDR` for acceptors built from this config.
    pub fn with_reuse_addr(mut self, yes: bool) -> Self {
        self.reuse_addr = yes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_auto_thread_count_is_at_least_four() {
        let cfg = EngineConfig::default();
        assert!(cfg.resolved_thread_count() >= 4);
    }

    #[test]
    fn engine_config_explicit_thread_count_is_honoured() {
        let cfg = EngineConfig::new().with_thread_pool_threads(7);
        assert_eq!(cfg.resolved_thread_count(), 7);
    }

    #[test]
    fn emitter_config_builder_overrides_defaults() {
        let cfg = EmitterConfig::new()
            .with_input_queue_block_size(8192)
            .with_input_queue_cache_initial_size(2)
            .with_input_queue_cache_max_size(8)
            .with_use_direct_buffers(true)
            .with_reuse_addr(false);
        assert_eq!(cfg.input_queue_block_size, 8192);
        assert_eq!(cfg.input_queue_cache_initial_size, 2);
        assert_eq!(cfg.input_queue_cache_max_size, 8);
        assert!(cfg.use_direct_buffers);
        assert!(!cfg.reuse_addr);
    }
}
