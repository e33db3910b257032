//! Eviction outcomes and counters

pub mod pool;

pub use pool::EvictionPool;

use std::sync::atomic::{AtomicU64, Ordering};

/// Terminal result of one eviction attempt.
///
/// `SkippedBusy` and `SkippedNoBenefit` are internal retry signals, never
/// reported as errors; a failed durable write is the `Err` arm of the
/// attempt instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// Page fully written out and dropped from the cache
    Evicted,
    /// Visible portion written out; a restored page took over residency
    Restored,
    /// Page pinned or lock contended; requeued with backoff
    SkippedBusy,
    /// Evicting this page would yield negligible relief
    SkippedNoBenefit,
}

/// Eviction counters, readable by an external statistics subsystem
pub(crate) struct EvictionStats {
    pub pages_evicted: AtomicU64,
    pub pages_restored: AtomicU64,
    /// Restores forced by updates not yet globally visible
    pub nonvisible_restores: AtomicU64,
    pub reconcile_failures: AtomicU64,
    pub skipped_busy: AtomicU64,
    pub skipped_no_benefit: AtomicU64,
}

impl EvictionStats {
    pub fn new() -> Self {
        Self {
            pages_evicted: AtomicU64::new(0),
            pages_restored: AtomicU64::new(0),
            nonvisible_restores: AtomicU64::new(0),
            reconcile_failures: AtomicU64::new(0),
            skipped_busy: AtomicU64::new(0),
            skipped_no_benefit: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self, oracle_fallbacks: u64) -> EvictionStatsSnapshot {
        EvictionStatsSnapshot {
            pages_evicted: self.pages_evicted.load(Ordering::Relaxed),
            pages_restored: self.pages_restored.load(Ordering::Relaxed),
            nonvisible_restores: self.nonvisible_restores.load(Ordering::Relaxed),
            reconcile_failures: self.reconcile_failures.load(Ordering::Relaxed),
            skipped_busy: self.skipped_busy.load(Ordering::Relaxed),
            skipped_no_benefit: self.skipped_no_benefit.load(Ordering::Relaxed),
            oracle_fallbacks,
        }
    }
}

/// Point-in-time view of the eviction counters
#[derive(Debug, Clone, Default)]
pub struct EvictionStatsSnapshot {
    pub pages_evicted: u64,
    pub pages_restored: u64,
    pub nonvisible_restores: u64,
    pub reconcile_failures: u64,
    pub skipped_busy: u64,
    pub skipped_no_benefit: u64,
    pub oracle_fallbacks: u64,
}
