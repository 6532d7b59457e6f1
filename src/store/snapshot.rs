//! Store-level snapshots: filtered point-in-time scans.
//!
//! A [`Snapshot`] owns one captured `(tree root, offset horizon)` pair per
//! intersecting shard, taken under the store's shard lock with the
//! offset-intentions fifo applied on top.  Consuming it later — while
//! writes, flushes, even splits proceed — yields exactly the records that
//! were visible at capture time.
//!
//! A [`RollingSnapshot`] extends that with a pinned cursor into the RAM
//! write-ahead fifo: after the on-disk view drains, it replays every
//! buffered mutation present at capture time and beyond, dels included.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::fifo::FifoCursor;
use crate::region::SearchTerms;
use crate::shard::snapshot::ShardSnapshot;
use crate::shard::Record;

use super::{StoreError, WalEntry};

// ------------------------------------------------------------------------------------------------
// Snapshot
// ------------------------------------------------------------------------------------------------

/// A consistent, filtered view over every intersecting shard.
///
/// Iteration yields shards in vector order and records in id order
/// within each shard.
pub struct Snapshot {
    terms: SearchTerms,
    constraints: Vec<Option<u64>>,
    snaps: VecDeque<ShardSnapshot>,
    pending: VecDeque<Record>,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("shards", &self.snaps.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Snapshot {
    pub(crate) fn new(
        terms: SearchTerms,
        constraints: Vec<Option<u64>>,
        snaps: Vec<ShardSnapshot>,
    ) -> Self {
        Self {
            terms,
            constraints,
            snaps: snaps.into(),
            pending: VecDeque::new(),
        }
    }

    /// Hash constraints prune by attribute hash; the final filter
    /// compares the actual attribute bytes against the search terms.
    fn matches_terms(&self, record: &Record) -> bool {
        for i in 0..self.terms.attrs() {
            if let Some(expected) = self.terms.term(i) {
                if record.value.get(i).map(Vec::as_slice) != Some(expected) {
                    return false;
                }
            }
        }
        true
    }

    fn refill(&mut self) -> Result<bool, StoreError> {
        while self.pending.is_empty() {
            let Some(snap) = self.snaps.pop_front() else {
                return Ok(false);
            };
            for record in snap.records(&self.constraints)? {
                if self.matches_terms(&record) {
                    self.pending.push_back(record);
                }
            }
        }
        Ok(true)
    }
}

impl Iterator for Snapshot {
    type Item = Result<Record, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.refill() {
            Ok(true) => self.pending.pop_front().map(Ok),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// RollingSnapshot
// ------------------------------------------------------------------------------------------------

/// One item of a rolling snapshot.
///
/// Items from the on-disk prefix always carry a value; items replayed
/// from the write-ahead fifo carry `None` for deletions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollingItem {
    /// The record's key.
    pub key: Vec<u8>,

    /// The value attributes, or `None` for a buffered deletion.
    pub value: Option<Vec<Vec<u8>>>,

    /// The version (0 for deletions, which carry none).
    pub version: u64,
}

/// A snapshot that keeps rolling forward through the write-ahead fifo
/// after the captured on-disk state drains.
pub struct RollingSnapshot {
    snap: Snapshot,
    wal: FifoCursor<Arc<WalEntry>>,
}

impl std::fmt::Debug for RollingSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollingSnapshot").finish_non_exhaustive()
    }
}

impl RollingSnapshot {
    pub(crate) fn new(snap: Snapshot, wal: FifoCursor<Arc<WalEntry>>) -> Self {
        Self { snap, wal }
    }
}

impl Iterator for RollingSnapshot {
    type Item = Result<RollingItem, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(result) = self.snap.next() {
            return Some(result.map(|record| RollingItem {
                key: record.key,
                value: Some(record.value),
                version: record.version,
            }));
        }

        while self.wal.valid() {
            let entry = self.wal.with(Arc::clone);
            self.wal.next();
            if let Some(entry) = entry {
                return Some(Ok(RollingItem {
                    key: entry.key.clone(),
                    value: entry.value.clone(),
                    version: entry.version,
                }));
            }
        }
        None
    }
}
