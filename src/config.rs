//! Cache configuration
//!
//! The cache ceiling, worker count and pressure thresholds are consumed by
//! this crate but owned by the embedding engine. Pressure is the ratio of
//! resident bytes to the ceiling; the background workers start evicting at
//! `evict_trigger` and application threads are expected to evict inline
//! above `evict_hard_limit`.

use serde::{Deserialize, Serialize};

/// Configuration for the page cache and its eviction machinery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache size ceiling in bytes
    ///
    /// Resident bytes may transiently exceed this; eviction must always make
    /// forward progress back toward it.
    pub ceiling_bytes: u64,

    /// Number of background eviction worker threads
    pub worker_count: usize,

    /// Pressure level at which background workers start scanning (0.0 - 1.0)
    pub evict_trigger: f64,

    /// Pressure level above which application threads should call
    /// `evict_now` / `relieve_pressure` before proceeding with a write
    pub evict_hard_limit: f64,

    /// Maximum candidates produced per selector pass
    pub scan_batch: usize,

    /// Worker sleep interval when pressure is below the trigger (milliseconds)
    pub worker_idle_ms: u64,

    /// Base delay for per-page retry backoff after a busy skip (milliseconds)
    pub backoff_base_ms: u64,

    /// Cap on the per-page retry backoff (milliseconds)
    pub backoff_cap_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ceiling_bytes: 64 * 1024 * 1024, // 64MB
            worker_count: 2,
            evict_trigger: 0.8,
            evict_hard_limit: 0.95,
            scan_batch: 16,
            worker_idle_ms: 50,
            backoff_base_ms: 1,
            backoff_cap_ms: 100,
        }
    }
}

impl CacheConfig {
    /// Small ceiling, single worker, fast intervals. For tests only.
    pub fn for_testing() -> Self {
        Self {
            ceiling_bytes: 16 * 1024,
            worker_count: 1,
            evict_trigger: 0.5,
            evict_hard_limit: 0.9,
            scan_batch: 8,
            worker_idle_ms: 5,
            backoff_base_ms: 1,
            backoff_cap_ms: 10,
        }
    }

    /// Whether the given pressure level calls for background eviction
    pub fn above_trigger(&self, pressure: f64) -> bool {
        pressure >= self.evict_trigger
    }

    /// Whether the given pressure level calls for forced synchronous eviction
    pub fn above_hard_limit(&self, pressure: f64) -> bool {
        pressure >= self.evict_hard_limit
    }
}
