//! Visibility oracle
//!
//! The reconciliation engine never decides visibility itself; it asks the
//! transaction manager through this interface. The low watermark over all
//! active snapshots only ever advances, so a stale answer can keep an update
//! longer than necessary but can never expose one too early. Callers must
//! re-query per update rather than caching answers across reconciliation
//! calls.
//!
//! Snapshot-relative visibility (`Snapshot::sees`) is plain timestamp math
//! and is infallible; only the global-visibility queries can fail when the
//! transaction manager is unavailable.

use crate::types::{Snapshot, Timestamp, TxnId, TS_PENDING};
use crate::Result;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier handed out when a snapshot is registered
pub type SnapshotId = u64;

/// Answers "is this update visible to every current and future reader?"
pub trait VisibilityOracle: Send + Sync {
    /// Monotonic low watermark over all active snapshots.
    ///
    /// Every commit timestamp at or below the watermark is visible to every
    /// snapshot that exists now or can exist in the future.
    fn low_watermark(&self) -> Result<Timestamp>;

    /// Whether an update with this commit timestamp is globally visible
    fn is_globally_visible(&self, commit_ts: Timestamp) -> Result<bool> {
        if commit_ts == TS_PENDING {
            return Ok(false);
        }
        Ok(commit_ts <= self.low_watermark()?)
    }
}

/// Reference oracle backed by an atomic timestamp allocator and an active
/// snapshot registry.
///
/// The watermark is min(active snapshot timestamps, next timestamp), so it
/// never regresses: releasing a snapshot can only move it forward.
pub struct WatermarkOracle {
    /// Global timestamp generator (next timestamp to hand out)
    next_ts: AtomicU64,

    /// Transaction ID generator
    next_txn: AtomicU64,

    /// Snapshot registration counter
    next_snapshot: AtomicU64,

    /// Active snapshots: registration id -> snapshot timestamp
    active_snapshots: Mutex<BTreeMap<SnapshotId, Timestamp>>,

    /// Transactions that have begun but not committed
    active_txns: Mutex<HashSet<TxnId>>,
}

impl WatermarkOracle {
    pub fn new() -> Self {
        Self {
            next_ts: AtomicU64::new(1),
            next_txn: AtomicU64::new(1),
            next_snapshot: AtomicU64::new(1),
            active_snapshots: Mutex::new(BTreeMap::new()),
            active_txns: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate a new timestamp
    pub fn allocate_timestamp(&self) -> Timestamp {
        self.next_ts.fetch_add(1, Ordering::SeqCst)
    }

    /// Begin a transaction. The returned ID is stamped on its updates.
    pub fn begin_txn(&self) -> TxnId {
        let txn_id = self.next_txn.fetch_add(1, Ordering::SeqCst);
        self.active_txns.lock().insert(txn_id);
        txn_id
    }

    /// Commit a transaction, returning its commit timestamp.
    ///
    /// The timestamp is allocated and the transaction removed from the
    /// active set in one critical section, so a snapshot cloning the set
    /// sees either both effects or neither. The caller is responsible for
    /// stamping the timestamp onto the transaction's updates
    /// (`Cache::commit_txn`).
    pub fn commit_txn(&self, txn_id: TxnId) -> Timestamp {
        let mut active = self.active_txns.lock();
        let commit_ts = self.allocate_timestamp();
        active.remove(&txn_id);
        commit_ts
    }

    /// Register a snapshot and pin the watermark at its timestamp.
    ///
    /// Allocation and registration happen under the snapshot lock: a
    /// watermark reader can never observe the timestamp counter past the
    /// snapshot's timestamp while the snapshot itself is still missing from
    /// the registry.
    pub fn begin_snapshot(&self) -> (SnapshotId, Snapshot) {
        let id = self.next_snapshot.fetch_add(1, Ordering::SeqCst);
        let mut snapshots = self.active_snapshots.lock();
        let active = self.active_txns.lock();
        // Allocate with both locks held: pairs the timestamp with the
        // active set it was taken against.
        let timestamp = self.allocate_timestamp();
        let active_txns = active.clone();
        drop(active);
        snapshots.insert(id, timestamp);
        (id, Snapshot { timestamp, active_txns })
    }

    /// Release a snapshot, allowing the watermark to advance past it
    pub fn release_snapshot(&self, id: SnapshotId) {
        self.active_snapshots.lock().remove(&id);
    }
}

impl Default for WatermarkOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl VisibilityOracle for WatermarkOracle {
    fn low_watermark(&self) -> Result<Timestamp> {
        // Read the counter under the registry lock: any snapshot with a
        // lower timestamp is guaranteed registered by now.
        let snapshots = self.active_snapshots.lock();
        let ceiling = self.next_ts.load(Ordering::SeqCst);
        let floor = snapshots.values().copied().min().unwrap_or(ceiling);
        Ok(floor.min(ceiling))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_never_globally_visible() {
        let oracle = WatermarkOracle::new();
        assert!(!oracle.is_globally_visible(TS_PENDING).unwrap());
    }

    #[test]
    fn test_committed_visible_without_snapshots() {
        let oracle = WatermarkOracle::new();
        let txn = oracle.begin_txn();
        let ts = oracle.commit_txn(txn);
        assert!(oracle.is_globally_visible(ts).unwrap());
    }

    #[test]
    fn test_open_snapshot_pins_watermark() {
        let oracle = WatermarkOracle::new();
        let (snap_id, snap) = oracle.begin_snapshot();

        // Commit after the snapshot began: not globally visible while the
        // snapshot is open.
        let txn = oracle.begin_txn();
        let ts = oracle.commit_txn(txn);
        assert!(ts > snap.timestamp);
        assert!(!oracle.is_globally_visible(ts).unwrap());

        oracle.release_snapshot(snap_id);
        assert!(oracle.is_globally_visible(ts).unwrap());
    }

    #[test]
    fn test_watermark_monotonic() {
        let oracle = WatermarkOracle::new();
        let mut last = oracle.low_watermark().unwrap();

        let (s1, _) = oracle.begin_snapshot();
        for _ in 0..10 {
            let txn = oracle.begin_txn();
            oracle.commit_txn(txn);
            let wm = oracle.low_watermark().unwrap();
            assert!(wm >= last);
            last = wm;
        }
        oracle.release_snapshot(s1);
        assert!(oracle.low_watermark().unwrap() >= last);
    }

    #[test]
    fn test_watermark_monotonic_under_concurrent_churn() {
        use std::sync::atomic::AtomicBool;

        let oracle = WatermarkOracle::new();
        let stop = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..2_000 {
                        let (id, _) = oracle.begin_snapshot();
                        let txn = oracle.begin_txn();
                        oracle.commit_txn(txn);
                        oracle.release_snapshot(id);
                    }
                });
            }
            scope.spawn(|| {
                let mut last = 0;
                while !stop.load(Ordering::SeqCst) {
                    let wm = oracle.low_watermark().unwrap();
                    assert!(wm >= last, "watermark regressed: {} -> {}", last, wm);
                    last = wm;
                }
            });
            // Drive commits from this thread, then stop the observer so the
            // scope can join.
            for _ in 0..2_000 {
                let txn = oracle.begin_txn();
                let ts = oracle.commit_txn(txn);
                // A commit made with no snapshot open below it must already
                // be globally visible, never "not yet registered".
                if oracle.low_watermark().unwrap() >= ts {
                    assert!(oracle.is_globally_visible(ts).unwrap());
                }
            }
            stop.store(true, Ordering::SeqCst);
        });
    }

    #[test]
    fn test_open_snapshot_never_misses_registration() {
        // A commit that lands between a snapshot's timestamp allocation and
        // its registration must not be judged globally visible.
        let oracle = WatermarkOracle::new();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..5_000 {
                    let (id, snap) = oracle.begin_snapshot();
                    let wm = oracle.low_watermark().unwrap();
                    assert!(
                        wm <= snap.timestamp,
                        "watermark {} passed open snapshot at {}",
                        wm,
                        snap.timestamp
                    );
                    oracle.release_snapshot(id);
                }
            });
            scope.spawn(|| {
                for _ in 0..5_000 {
                    let txn = oracle.begin_txn();
                    oracle.commit_txn(txn);
                }
            });
        });
    }

    #[test]
    fn test_snapshot_set_consistent_with_commit_order() {
        // Committed (txn, ts) pairs are published after commit; any snapshot
        // taken later with timestamp >= ts must see that commit, i.e. the
        // transaction can no longer appear in its active set.
        let oracle = WatermarkOracle::new();
        let published = Mutex::new(Vec::<(TxnId, Timestamp)>::new());

        std::thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    for _ in 0..2_000 {
                        let txn = oracle.begin_txn();
                        let ts = oracle.commit_txn(txn);
                        published.lock().push((txn, ts));
                    }
                });
            }
            for _ in 0..2 {
                scope.spawn(|| {
                    for _ in 0..2_000 {
                        let (id, snap) = oracle.begin_snapshot();
                        let committed = published.lock().clone();
                        for (txn, ts) in committed {
                            if ts <= snap.timestamp {
                                assert!(
                                    snap.sees(ts, txn),
                                    "snapshot at {} blind to commit {} by txn {}",
                                    snap.timestamp,
                                    ts,
                                    txn
                                );
                            }
                        }
                        oracle.release_snapshot(id);
                    }
                });
            }
        });
    }

    #[test]
    fn test_snapshot_sees_prior_commit() {
        let oracle = WatermarkOracle::new();
        let txn = oracle.begin_txn();
        let ts = oracle.commit_txn(txn);

        let (_, snap) = oracle.begin_snapshot();
        assert!(snap.sees(ts, txn));
    }

    #[test]
    fn test_snapshot_blind_to_concurrent_txn() {
        let oracle = WatermarkOracle::new();
        let txn = oracle.begin_txn();
        let (_, snap) = oracle.begin_snapshot();
        let ts = oracle.commit_txn(txn);

        // Transaction was active when the snapshot began.
        assert!(!snap.sees(ts, txn));
    }
}
