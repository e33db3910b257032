//! Eviction worker pool
//!
//! Background workers and forced synchronous callers funnel into the same
//! per-page attempt: take the eviction try-lock, re-check eligibility under
//! it (selection is lock-free, so the first check may be stale), reconcile,
//! apply the outcome. Contention is never waited out: a busy page is skipped
//! and deferred with per-page exponential backoff, and the cyclic candidate
//! scan revisits it on a later revolution, which bounds starvation.
//!
//! `evict_now` never sleeps. It either makes progress, reports busy so the
//! caller can proceed with degraded (over-limit) memory use, or surfaces an
//! I/O failure. Shutdown stops workers from pulling new candidates and
//! drains in-flight attempts before joining.

use crate::cache::{Cache, EvictionSelector};
use crate::evict::{EvictOutcome, EvictionStats, EvictionStatsSnapshot};
use crate::oracle::VisibilityOracle;
use crate::block::BlockManager;
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::types::PageId;
use crate::{CacheError, Result};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Failure count is capped so the backoff shift cannot overflow
const MAX_BACKOFF_SHIFT: u32 = 10;

struct BackoffState {
    failures: u32,
    retry_at: Instant,
}

struct PoolInner {
    cache: Arc<Cache>,
    selector: EvictionSelector,
    reconciler: Reconciler,
    stats: EvictionStats,

    /// Per-page retry deferral after busy skips
    backoff: DashMap<PageId, BackoffState>,

    shutdown: AtomicBool,
}

/// Fixed-size pool of eviction workers plus the synchronous eviction entry
/// points used by application threads under pressure
pub struct EvictionPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EvictionPool {
    /// Spawn `config.worker_count` background workers against `cache`.
    pub fn new(
        cache: Arc<Cache>,
        oracle: Arc<dyn VisibilityOracle>,
        blocks: Arc<dyn BlockManager>,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            selector: EvictionSelector::new(cache.clone()),
            reconciler: Reconciler::new(oracle, blocks),
            stats: EvictionStats::new(),
            backoff: DashMap::new(),
            shutdown: AtomicBool::new(false),
            cache,
        });

        let (tx, rx) = unbounded::<PageId>();
        let mut handles = Vec::new();
        for _ in 0..inner.cache.config().worker_count {
            let worker_inner = Arc::clone(&inner);
            let worker_rx = rx.clone();
            let worker_tx = tx.clone();
            handles.push(thread::spawn(move || {
                worker_loop(worker_inner, worker_rx, worker_tx);
            }));
        }
        // Workers hold their own channel ends; the channel dies with them.
        drop(tx);
        drop(rx);

        Self {
            inner,
            workers: Mutex::new(handles),
        }
    }

    /// Synchronous eviction attempt for application threads above the hard
    /// pressure threshold. Never sleeps.
    pub fn evict_now(&self, id: PageId) -> Result<EvictOutcome> {
        self.inner.attempt_evict(id)
    }

    /// Bounded synchronous eviction loop: keep attempting candidates until
    /// usage is back at or below the ceiling or `max_attempts` is spent.
    /// Returns the bytes reclaimed.
    pub fn relieve_pressure(&self, max_attempts: usize) -> Result<u64> {
        let (start, _) = self.inner.cache.current_usage();
        let mut attempts = 0;

        while attempts < max_attempts && self.inner.cache.pressure_level() > 1.0 {
            let batch = self
                .inner
                .selector
                .next_candidates(self.inner.cache.config().scan_batch);
            if batch.is_empty() {
                break;
            }
            for id in batch {
                if attempts >= max_attempts || self.inner.cache.pressure_level() <= 1.0 {
                    break;
                }
                attempts += 1;
                self.inner.attempt_evict(id)?;
            }
        }

        let (end, _) = self.inner.cache.current_usage();
        Ok(start.saturating_sub(end))
    }

    /// Eviction counters
    pub fn stats(&self) -> EvictionStatsSnapshot {
        self.inner
            .stats
            .snapshot(self.inner.reconciler.oracle_fallbacks())
    }

    /// Stop pulling candidates, drain in-flight attempts, join the workers.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for EvictionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<PoolInner>, rx: Receiver<PageId>, tx: Sender<PageId>) {
    let idle = Duration::from_millis(inner.cache.config().worker_idle_ms.max(1));

    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }

        match rx.recv_timeout(idle) {
            Ok(id) => match inner.attempt_evict(id) {
                Err(CacheError::Shutdown) => break,
                Err(err) => {
                    // Recoverable at retry: the page stays resident and dirty
                    // and the scan will find it again.
                    eprintln!("eviction of page {} failed: {}", id, err);
                }
                Ok(_) => {}
            },
            Err(RecvTimeoutError::Timeout) => {
                let pressure = inner.cache.pressure_level();
                if inner.cache.config().above_trigger(pressure) {
                    let batch = inner
                        .selector
                        .next_candidates(inner.cache.config().scan_batch);
                    for id in batch {
                        if tx.send(id).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

impl PoolInner {
    /// The shared per-page eviction attempt (background and synchronous).
    fn attempt_evict(&self, id: PageId) -> Result<EvictOutcome> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(CacheError::Shutdown);
        }

        // Deferred by an earlier busy skip?
        if let Some(state) = self.backoff.get(&id) {
            if Instant::now() < state.retry_at {
                self.stats.skipped_busy.fetch_add(1, Ordering::Relaxed);
                return Ok(EvictOutcome::SkippedBusy);
            }
        }

        let Some(page) = self.cache.lookup_quiet(id) else {
            // Already gone; nothing to reclaim.
            self.backoff.remove(&id);
            self.stats.skipped_no_benefit.fetch_add(1, Ordering::Relaxed);
            return Ok(EvictOutcome::SkippedNoBenefit);
        };

        let Some(_guard) = page.begin_evict() else {
            self.note_busy(id);
            self.stats.skipped_busy.fetch_add(1, Ordering::Relaxed);
            return Ok(EvictOutcome::SkippedBusy);
        };

        // Selection is lock-free, so re-check everything under the lock.
        if page.is_pinned() || self.cache.is_externally_pinned(id) {
            self.note_busy(id);
            self.stats.skipped_busy.fetch_add(1, Ordering::Relaxed);
            return Ok(EvictOutcome::SkippedBusy);
        }
        match self.cache.lookup_quiet(id) {
            Some(current) if Arc::ptr_eq(&current, &page) => {}
            // A racing attempt already replaced or removed this instance.
            _ => {
                self.stats.skipped_busy.fetch_add(1, Ordering::Relaxed);
                return Ok(EvictOutcome::SkippedBusy);
            }
        }

        if !page.is_dirty() {
            if page.base_addr().is_none() {
                // An empty shell that was never written out; dropping it
                // frees almost nothing.
                self.stats.skipped_no_benefit.fetch_add(1, Ordering::Relaxed);
                return Ok(EvictOutcome::SkippedNoBenefit);
            }
            // Clean with a durable base: drop residency, no write needed.
            self.cache.remove_evicted(&page);
            self.backoff.remove(&id);
            self.stats.pages_evicted.fetch_add(1, Ordering::Relaxed);
            return Ok(EvictOutcome::Evicted);
        }

        match self.reconciler.reconcile(&page) {
            Ok(ReconcileOutcome::Evicted { addr }) => {
                self.cache.note_location(id, addr);
                self.cache.remove_evicted(&page);
                self.backoff.remove(&id);
                self.stats.pages_evicted.fetch_add(1, Ordering::Relaxed);
                Ok(EvictOutcome::Evicted)
            }
            Ok(ReconcileOutcome::Restored { addr, page: restored, preserved }) => {
                self.cache.note_location(id, addr);
                self.cache.install_restored(&page, restored);
                self.backoff.remove(&id);
                self.stats.pages_restored.fetch_add(1, Ordering::Relaxed);
                if preserved > 0 {
                    self.stats.nonvisible_restores.fetch_add(1, Ordering::Relaxed);
                }
                Ok(EvictOutcome::Restored)
            }
            Err(err) => {
                // Page state is untouched; the attempt is safely retryable.
                self.stats.reconcile_failures.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Exponential per-page backoff with jitter, so a hot page is not
    /// hammered in a tight retry loop.
    fn note_busy(&self, id: PageId) {
        let base = self.cache.config().backoff_base_ms.max(1);
        let cap = self.cache.config().backoff_cap_ms.max(base);

        let mut entry = self.backoff.entry(id).or_insert(BackoffState {
            failures: 0,
            retry_at: Instant::now(),
        });
        entry.failures = entry.failures.saturating_add(1);
        let shift = (entry.failures - 1).min(MAX_BACKOFF_SHIFT);
        let delay = (base << shift).min(cap);
        let jitter = rand::thread_rng().gen_range(0..=base);
        entry.retry_at = Instant::now() + Duration::from_millis(delay + jitter);
    }
}
