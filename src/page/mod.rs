//! In-memory page: base image plus per-key update chains
//!
//! A page is owned by the cache while resident and transiently by whichever
//! thread holds its eviction guard. Eviction exclusion uses a try-lock only;
//! nothing in this module blocks waiting for an evictor except `pin`, which
//! spins out an in-flight attempt.
//!
//! Writers and evictors exclude each other with a two-flag handshake:
//! a writer raises its pin before checking the `evicting` flag, an evictor
//! raises `evicting` (under the eviction lock) before checking the pin
//! count. With sequentially consistent ordering on both, at least one side
//! always observes the other, so an update can never slip onto a page that
//! an evictor has already decided is quiescent.

mod update;

pub use update::{Update, UpdateChain};

use crate::block::BlockAddr;
use crate::types::{Key, PageId, Snapshot, Timestamp, TxnId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Accounting estimate for the fixed cost of a resident page
pub(crate) const PAGE_OVERHEAD: u64 = 256;

/// The in-memory unit of caching
pub struct Page {
    id: PageId,

    /// Decoded base image; immutable for the lifetime of this page instance
    base: BTreeMap<Key, Vec<u8>>,

    /// Durable address of the base image, if one exists
    base_addr: Option<BlockAddr>,

    /// Accounted size of the base image
    base_bytes: u64,

    /// Dirty update chains keyed by in-page key
    chains: RwLock<BTreeMap<Key, UpdateChain>>,

    /// Aggregate footprint of all chain records
    dirty_bytes: AtomicU64,

    /// Open-cursor / writer pin count
    pins: AtomicU32,

    /// Lazily refreshed read generation (approximate recency)
    read_gen: AtomicU64,

    /// Exclusive eviction lock; acquired only via try-lock
    evict_lock: Mutex<()>,

    /// Raised while an eviction attempt holds the lock (writer handshake)
    evicting: AtomicBool,
}

impl Page {
    /// Create a brand new page with no durable backing
    pub fn new(id: PageId) -> Self {
        Self::build(id, BTreeMap::new(), None, BTreeMap::new())
    }

    /// Materialize a page from a durable base image
    pub fn with_base(id: PageId, addr: BlockAddr, base: BTreeMap<Key, Vec<u8>>) -> Self {
        Self::build(id, base, Some(addr), BTreeMap::new())
    }

    /// Build a restored page: a fresh instance carrying the updates that
    /// reconciliation could not write, linked against the new base image.
    pub fn restored(
        id: PageId,
        addr: BlockAddr,
        base: BTreeMap<Key, Vec<u8>>,
        chains: BTreeMap<Key, UpdateChain>,
    ) -> Self {
        Self::build(id, base, Some(addr), chains)
    }

    fn build(
        id: PageId,
        base: BTreeMap<Key, Vec<u8>>,
        base_addr: Option<BlockAddr>,
        chains: BTreeMap<Key, UpdateChain>,
    ) -> Self {
        let base_bytes: u64 = base.values().map(|v| 8 + v.len() as u64).sum();
        let dirty_bytes: u64 = chains.values().map(UpdateChain::footprint).sum();
        Self {
            id,
            base,
            base_addr,
            base_bytes,
            chains: RwLock::new(chains),
            dirty_bytes: AtomicU64::new(dirty_bytes),
            pins: AtomicU32::new(0),
            read_gen: AtomicU64::new(0),
            evict_lock: Mutex::new(()),
            evicting: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn base_addr(&self) -> Option<BlockAddr> {
        self.base_addr
    }

    /// The decoded base image
    pub fn base(&self) -> &BTreeMap<Key, Vec<u8>> {
        &self.base
    }

    /// Append a pending update for `key`. Returns the bytes added, which the
    /// caller accounts against the cache counters.
    pub fn apply_update(&self, key: Key, value: Option<Vec<u8>>, txn_id: TxnId) -> u64 {
        let update = Update::new(txn_id, value);
        let added = update.footprint();
        let mut chains = self.chains.write();
        chains.entry(key).or_default().prepend(update);
        self.dirty_bytes.fetch_add(added, Ordering::SeqCst);
        added
    }

    /// Stamp a commit timestamp onto all of `txn_id`'s pending updates.
    /// Returns how many records were stamped.
    pub fn commit_txn(&self, txn_id: TxnId, commit_ts: Timestamp) -> usize {
        let mut chains = self.chains.write();
        chains
            .values_mut()
            .map(|chain| chain.stamp_commit(txn_id, commit_ts))
            .sum()
    }

    /// Read `key` under snapshot isolation: newest chain update the snapshot
    /// sees, else the base image. `None` means not present or deleted.
    pub fn read(&self, key: Key, snapshot: &Snapshot) -> Option<Vec<u8>> {
        let chains = self.chains.read();
        if let Some(chain) = chains.get(&key) {
            if let Some(update) = chain.visible_to(snapshot) {
                return update.value.clone(); // None = visible tombstone
            }
        }
        self.base.get(&key).cloned()
    }

    /// Clone the chains for reconciliation planning. Stable while the caller
    /// holds the eviction guard and the pin count is zero.
    pub fn chains_snapshot(&self) -> BTreeMap<Key, UpdateChain> {
        self.chains.read().clone()
    }

    pub fn dirty_bytes(&self) -> u64 {
        self.dirty_bytes.load(Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_bytes() > 0
    }

    /// Total accounted footprint of this page
    pub fn footprint(&self) -> u64 {
        PAGE_OVERHEAD + self.base_bytes + self.dirty_bytes()
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::SeqCst) > 0
    }

    /// Non-blocking pin. Fails while an eviction attempt is in flight.
    pub fn try_pin(self: &Arc<Self>) -> Option<PinGuard> {
        self.pins.fetch_add(1, Ordering::SeqCst);
        if self.evicting.load(Ordering::SeqCst) {
            self.pins.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(PinGuard { page: Arc::clone(self) })
    }

    /// Pin the page, spinning out any in-flight eviction attempt.
    /// Bounded by a single reconciliation pass.
    pub fn pin(self: &Arc<Self>) -> PinGuard {
        loop {
            if let Some(guard) = self.try_pin() {
                return guard;
            }
            std::thread::yield_now();
        }
    }

    /// Try to take the exclusive eviction lock. Never blocks.
    pub fn begin_evict(&self) -> Option<EvictionGuard<'_>> {
        let lock = self.evict_lock.try_lock()?;
        self.evicting.store(true, Ordering::SeqCst);
        Some(EvictionGuard { page: self, _lock: lock })
    }

    /// Whether an eviction attempt currently holds the lock
    pub fn evict_locked(&self) -> bool {
        self.evict_lock.is_locked()
    }

    pub fn read_gen(&self) -> u64 {
        self.read_gen.load(Ordering::Relaxed)
    }

    /// Lazy recency refresh: only writes when the generation moved, so hot
    /// pages do not contend on every access.
    pub fn touch(&self, gen: u64) {
        if self.read_gen.load(Ordering::Relaxed) != gen {
            self.read_gen.store(gen, Ordering::Relaxed);
        }
    }
}

/// RAII pin; blocks eviction of the page while held
pub struct PinGuard {
    page: Arc<Page>,
}

impl PinGuard {
    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.page.pins.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive eviction access to one page
pub struct EvictionGuard<'a> {
    page: &'a Page,
    _lock: parking_lot::MutexGuard<'a, ()>,
}

impl Drop for EvictionGuard<'_> {
    fn drop(&mut self) {
        self.page.evicting.store(false, Ordering::SeqCst);
    }
}
