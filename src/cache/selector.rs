//! Eviction candidate selector
//!
//! Cyclic clock-style scan over the resident page set. The scan has no side
//! effects on page state: it only reads pin/lock/recency fields and advances
//! the shared cursor (relaxed ordering; the scan is approximate by design).
//! Candidates are scored by dirty-byte ratio plus read-generation age, so
//! large dirty pages that relieve pressure fastest sort first, with ties
//! broken by page id for determinism.

use crate::cache::Cache;
use crate::page::Page;
use crate::types::PageId;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Age contribution is capped so a huge generation gap cannot drown out the
/// dirty-byte signal.
const MAX_AGE_SCORE: u64 = 100;

pub struct EvictionSelector {
    cache: Arc<Cache>,
}

impl EvictionSelector {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }

    /// Up to `n` page ids judged worth evicting, best first.
    ///
    /// Restartable: each call resumes from the persisted cursor and wraps at
    /// the end of the page set, bumping the read-generation clock once per
    /// full revolution.
    pub fn next_candidates(&self, n: usize) -> Vec<PageId> {
        let ids = self.cache.resident_ids_sorted();
        if ids.is_empty() || n == 0 {
            return Vec::new();
        }

        let len = ids.len();
        let window = len.min((n * 4).max(32));
        let start = self.cache.scan_cursor.load(Ordering::Relaxed) % len;
        let gen = self.cache.scan_gen();

        let mut scored: Vec<(u64, PageId)> = Vec::with_capacity(window);
        for i in 0..window {
            let id = ids[(start + i) % len];
            let Some(page) = self.cache.lookup_quiet(id) else {
                continue; // evicted since the id snapshot
            };
            if page.is_pinned()
                || page.evict_locked()
                || self.cache.is_externally_pinned(id)
            {
                continue;
            }
            let score = Self::score(&page, gen);
            if score > 0 {
                scored.push((score, id));
            }
        }

        self.cache
            .scan_cursor
            .store((start + window) % len, Ordering::Relaxed);
        if start + window >= len {
            // Completed a revolution; age out recency lazily.
            self.cache.bump_scan_gen();
        }

        scored.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(n);
        scored.into_iter().map(|(_, id)| id).collect()
    }

    /// Dirty-byte ratio (percent) plus capped read-generation age
    fn score(page: &Page, gen: u64) -> u64 {
        let footprint = page.footprint();
        let dirty_pct = if footprint == 0 {
            0
        } else {
            page.dirty_bytes() * 100 / footprint
        };
        let age = gen.saturating_sub(page.read_gen()).min(MAX_AGE_SCORE);
        dirty_pct + age
    }
}
