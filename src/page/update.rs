//! Update records and per-key update chains
//!
//! Each key on a page carries an ordered chain of versioned writes, newest
//! first. The chain is a flat arena of records addressed by index; records
//! move between pages (eviction restore) by value, so there are no links to
//! dangle. A chain is never emptied while any record on it has not been
//! captured in the page's last reconciled image.

use crate::types::{Snapshot, Timestamp, TxnId, TS_PENDING};

/// Bookkeeping estimate for a chain record beyond its value bytes
pub(crate) const UPDATE_OVERHEAD: u64 = 48;

/// A single versioned write to one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    /// Transaction that created this update
    pub txn_id: TxnId,

    /// Commit timestamp; `TS_PENDING` until the transaction commits
    pub commit_ts: Timestamp,

    /// Value bytes, or `None` for a tombstone
    pub value: Option<Vec<u8>>,
}

impl Update {
    pub fn new(txn_id: TxnId, value: Option<Vec<u8>>) -> Self {
        Self {
            txn_id,
            commit_ts: TS_PENDING,
            value,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.commit_ts != TS_PENDING
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Accounted in-memory size of this record
    pub fn footprint(&self) -> u64 {
        UPDATE_OVERHEAD + self.value.as_ref().map_or(0, |v| v.len() as u64)
    }
}

/// Ordered sequence of updates for one key, newest first
#[derive(Debug, Clone, Default)]
pub struct UpdateChain {
    updates: Vec<Update>,
}

impl UpdateChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a chain from records already in newest-first order
    pub fn from_updates(updates: Vec<Update>) -> Self {
        Self { updates }
    }

    /// Push a new update at the head of the chain
    pub fn prepend(&mut self, update: Update) {
        self.updates.insert(0, update);
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Iterate newest to oldest
    pub fn iter(&self) -> impl Iterator<Item = &Update> {
        self.updates.iter()
    }

    pub fn newest(&self) -> Option<&Update> {
        self.updates.first()
    }

    pub fn footprint(&self) -> u64 {
        self.updates.iter().map(Update::footprint).sum()
    }

    /// Stamp the commit timestamp onto this transaction's pending updates.
    /// Returns how many records were stamped.
    pub fn stamp_commit(&mut self, txn_id: TxnId, commit_ts: Timestamp) -> usize {
        let mut stamped = 0;
        for update in &mut self.updates {
            if update.txn_id == txn_id && update.commit_ts == TS_PENDING {
                update.commit_ts = commit_ts;
                stamped += 1;
            }
        }
        stamped
    }

    /// Newest update visible to the snapshot, if any
    pub fn visible_to(&self, snapshot: &Snapshot) -> Option<&Update> {
        self.updates
            .iter()
            .find(|u| snapshot.sees(u.commit_ts, u.txn_id))
    }
}
