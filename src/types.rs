//! Core identifier types and snapshot definition
//!
//! Timestamps are allocated by the transaction manager and are monotonically
//! increasing. A commit timestamp of `TS_PENDING` marks an update whose
//! transaction has not committed yet.

use std::collections::HashSet;

/// Stable page identifier, assigned by the B-tree layer
pub type PageId = u64;

/// Transaction ID
pub type TxnId = u64;

/// Timestamp (monotonically increasing)
pub type Timestamp = u64;

/// In-page key
pub type Key = u64;

/// Commit timestamp of an update whose transaction is still open
pub const TS_PENDING: Timestamp = 0;

/// Snapshot for transaction isolation
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Snapshot timestamp
    pub timestamp: Timestamp,

    /// Transaction IDs that were active (uncommitted) at snapshot time
    pub active_txns: HashSet<TxnId>,
}

impl Snapshot {
    /// Check whether a committed-or-pending update is visible to this snapshot.
    ///
    /// Rules:
    /// 1. The update's transaction must not be pending.
    /// 2. The update must have committed at or before the snapshot timestamp.
    /// 3. The creating transaction must not have been active at snapshot time.
    pub fn sees(&self, commit_ts: Timestamp, txn_id: TxnId) -> bool {
        if commit_ts == TS_PENDING {
            return false;
        }
        if commit_ts > self.timestamp {
            return false;
        }
        !self.active_txns.contains(&txn_id)
    }
}
