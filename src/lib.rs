//! marmot: an in-memory page cache with snapshot-isolated update chains,
//! background eviction, and page reconciliation to durable images.
//!
//! The cache holds pages as a decoded base image plus per-key chains of
//! versioned updates. Eviction reconciles a page under a per-page exclusive
//! lock: globally visible history is folded into a new durable image, and
//! updates some active snapshot or open transaction still needs are restored
//! onto a fresh in-memory page. A pool of background workers keeps resident
//! bytes trending toward the configured ceiling; application threads can
//! evict synchronously when pressure spikes past the hard limit.

pub mod block;
pub mod cache;
pub mod config;
pub mod evict;
pub mod oracle;
pub mod page;
pub mod reconcile;
pub mod types;

mod error;

pub use block::{BlockAddr, BlockManager, FileBlockManager, MemoryBlockManager};
pub use cache::{Cache, CacheStats, EvictionSelector, PinProbe};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use evict::{EvictOutcome, EvictionPool, EvictionStatsSnapshot};
pub use oracle::{SnapshotId, VisibilityOracle, WatermarkOracle};
pub use page::{Page, PinGuard, Update, UpdateChain};
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use types::{Key, PageId, Snapshot, Timestamp, TxnId, TS_PENDING};
