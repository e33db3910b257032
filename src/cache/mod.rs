//! Process-wide page cache
//!
//! Registry of resident pages plus aggregate memory accounting. There is no
//! global lock over the cache: page lookup goes through a concurrent map,
//! byte counters are plain atomics, and the only exclusion is the per-page
//! eviction lock. Usage may transiently exceed the configured ceiling; the
//! eviction machinery is responsible for trending it back down.

pub mod selector;

pub use selector::EvictionSelector;

use crate::block::{BlockAddr, BlockManager};
use crate::config::CacheConfig;
use crate::page::Page;
use crate::types::{Key, PageId, Snapshot, Timestamp, TxnId};
use crate::Result;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Cursor-layer hook: pages it reports as pinned are never evicted
pub type PinProbe = Box<dyn Fn(PageId) -> bool + Send + Sync>;

/// Process-wide registry of resident pages
pub struct Cache {
    config: CacheConfig,

    /// Page id -> resident page. Single owner of residency.
    pages: DashMap<PageId, Arc<Page>>,

    /// Total resident bytes (base images + update chains + overhead)
    total_bytes: AtomicU64,

    /// Bytes held in dirty update chains
    dirty_bytes: AtomicU64,

    /// Clock hand for the candidate scan; relaxed, approximate by design
    pub(crate) scan_cursor: AtomicUsize,

    /// Read-generation clock, bumped once per full selector pass
    scan_gen: AtomicU64,

    /// Last written durable image per page id, so fully evicted pages can be
    /// re-materialized. Stands in for the parent address the B-tree owns.
    locations: DashMap<PageId, BlockAddr>,

    /// Optional cursor-layer pin notification
    pin_probe: RwLock<Option<PinProbe>>,

    hits: AtomicU64,
    misses: AtomicU64,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub resident_pages: usize,
    pub total_bytes: u64,
    pub dirty_bytes: u64,
    pub ceiling_bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            pages: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            dirty_bytes: AtomicU64::new(0),
            scan_cursor: AtomicUsize::new(0),
            scan_gen: AtomicU64::new(1),
            locations: DashMap::new(),
            pin_probe: RwLock::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Fetch the resident page for `id`, re-materializing it from its last
    /// durable image or creating it empty if it has never been written out.
    pub fn fetch_or_create(&self, id: PageId, blocks: &dyn BlockManager) -> Result<Arc<Page>> {
        if let Some(entry) = self.pages.get(&id) {
            let page = entry.value().clone();
            drop(entry);
            page.touch(self.scan_gen());
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(page);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // Build outside the map entry so no shard lock is held across I/O.
        let page = match self.locations.get(&id).map(|e| *e.value()) {
            Some(addr) => {
                let bytes = blocks.read_image(addr)?;
                let base: BTreeMap<Key, Vec<u8>> = bincode::deserialize(&bytes)?;
                Arc::new(Page::with_base(id, addr, base))
            }
            None => Arc::new(Page::new(id)),
        };

        match self.pages.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                // Raced with another fetch; theirs won residency.
                Ok(entry.get().clone())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                self.total_bytes.fetch_add(page.footprint(), Ordering::SeqCst);
                self.dirty_bytes.fetch_add(page.dirty_bytes(), Ordering::SeqCst);
                entry.insert(page.clone());
                Ok(page)
            }
        }
    }

    /// Resident page lookup; refreshes recency and hit/miss counters
    pub fn lookup(&self, id: PageId) -> Option<Arc<Page>> {
        match self.lookup_quiet(id) {
            Some(page) => {
                page.touch(self.scan_gen());
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(page)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Lookup without touching recency or counters (eviction paths)
    pub(crate) fn lookup_quiet(&self, id: PageId) -> Option<Arc<Page>> {
        self.pages.get(&id).map(|e| e.value().clone())
    }

    /// Append a pending update to `id`. Pins the page for the duration, so a
    /// concurrent eviction attempt either sees the pin or holds the writer
    /// out until its outcome is applied; the loop then lands the update on
    /// whatever instance now owns residency.
    pub fn write(
        &self,
        id: PageId,
        key: Key,
        value: Option<Vec<u8>>,
        txn_id: TxnId,
        blocks: &dyn BlockManager,
    ) -> Result<()> {
        loop {
            let page = self.fetch_or_create(id, blocks)?;
            let _pin = page.pin();
            match self.lookup_quiet(id) {
                Some(current) if Arc::ptr_eq(&current, &page) => {
                    let added = page.apply_update(key, value.clone(), txn_id);
                    self.total_bytes.fetch_add(added, Ordering::SeqCst);
                    self.dirty_bytes.fetch_add(added, Ordering::SeqCst);
                    return Ok(());
                }
                // Page was evicted or restored between fetch and pin; retry
                // against the current instance.
                _ => continue,
            }
        }
    }

    /// Stamp a commit timestamp onto `txn_id`'s pending updates on `id`.
    /// Returns the number of records stamped (0 if the page is not resident;
    /// a page with pending updates is always resident).
    pub fn commit_txn(&self, id: PageId, txn_id: TxnId, commit_ts: Timestamp) -> usize {
        loop {
            let Some(page) = self.lookup_quiet(id) else {
                return 0;
            };
            let _pin = page.pin();
            match self.lookup_quiet(id) {
                Some(current) if Arc::ptr_eq(&current, &page) => {
                    return page.commit_txn(txn_id, commit_ts);
                }
                _ => continue,
            }
        }
    }

    /// Snapshot read of one key
    pub fn read(&self, id: PageId, key: Key, snapshot: &Snapshot) -> Option<Vec<u8>> {
        self.lookup(id).and_then(|page| page.read(key, snapshot))
    }

    /// (total bytes, dirty bytes)
    pub fn current_usage(&self) -> (u64, u64) {
        (
            self.total_bytes.load(Ordering::SeqCst),
            self.dirty_bytes.load(Ordering::SeqCst),
        )
    }

    /// Used bytes / ceiling
    pub fn pressure_level(&self) -> f64 {
        let used = self.total_bytes.load(Ordering::SeqCst);
        used as f64 / self.config.ceiling_bytes as f64
    }

    /// Record where a page's latest durable image lives
    pub(crate) fn note_location(&self, id: PageId, addr: BlockAddr) {
        self.locations.insert(id, addr);
    }

    pub fn location(&self, id: PageId) -> Option<BlockAddr> {
        self.locations.get(&id).map(|e| *e.value())
    }

    /// Drop residency after a full eviction. Only the holder of the page's
    /// eviction guard may call this. Returns false if `page` no longer owns
    /// the entry.
    pub(crate) fn remove_evicted(&self, page: &Arc<Page>) -> bool {
        let removed = self
            .pages
            .remove_if(&page.id(), |_, current| Arc::ptr_eq(current, page))
            .is_some();
        if removed {
            self.total_bytes.fetch_sub(page.footprint(), Ordering::SeqCst);
            self.dirty_bytes.fetch_sub(page.dirty_bytes(), Ordering::SeqCst);
        }
        removed
    }

    /// Atomically replace an evicted page with its restored successor.
    /// Concurrent lookups see either the old or the new instance.
    pub(crate) fn install_restored(&self, old: &Arc<Page>, new: Arc<Page>) {
        self.total_bytes.fetch_add(new.footprint(), Ordering::SeqCst);
        self.dirty_bytes.fetch_add(new.dirty_bytes(), Ordering::SeqCst);
        self.pages.insert(new.id(), new);
        self.total_bytes.fetch_sub(old.footprint(), Ordering::SeqCst);
        self.dirty_bytes.fetch_sub(old.dirty_bytes(), Ordering::SeqCst);
    }

    /// Register the cursor layer's pin notification hook
    pub fn set_pin_probe(&self, probe: PinProbe) {
        *self.pin_probe.write() = Some(probe);
    }

    pub(crate) fn is_externally_pinned(&self, id: PageId) -> bool {
        self.pin_probe.read().as_ref().is_some_and(|probe| probe(id))
    }

    /// Sorted resident page ids; the selector's scan domain
    pub(crate) fn resident_ids_sorted(&self) -> Vec<PageId> {
        let mut ids: Vec<PageId> = self.pages.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn resident_count(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn scan_gen(&self) -> u64 {
        self.scan_gen.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_scan_gen(&self) -> u64 {
        self.scan_gen.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn stats(&self) -> CacheStats {
        let (total_bytes, dirty_bytes) = self.current_usage();
        CacheStats {
            resident_pages: self.pages.len(),
            total_bytes,
            dirty_bytes,
            ceiling_bytes: self.config.ceiling_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Engine shutdown: drop all residency
    pub fn close(&self) {
        self.pages.clear();
        self.total_bytes.store(0, Ordering::SeqCst);
        self.dirty_bytes.store(0, Ordering::SeqCst);
    }
}
