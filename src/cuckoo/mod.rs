//! Concurrent cuckoo key index: 64-bit fingerprints to 48-bit log ids.
//!
//! The index is a sorted list of fixed-shape [`CuckooTable`]s, each owning
//! a contiguous key range `[lower_bound, next_lower_bound)`.  The first
//! table's lower bound is 0, so every key has a home.  When a table's
//! bounded eviction gives up, the index splits it at the median live key
//! into two successors and swaps the table list; the pair displaced by
//! the failed eviction is carried through the split so nothing is lost.
//!
//! # Concurrency
//!
//! - Readers take a short lock only to clone the table-list pointer, then
//!   scan the table lock-free; they never wait behind a split.
//! - Writers serialize per table through a striped lock; a split happens
//!   entirely under the owning table's stripe, builds the successors off
//!   to the side, and only then swaps the list pointer.

pub mod table;

#[cfg(test)]
mod tests;

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info};

use crate::sync::StripedLock;
pub use table::{CuckooTable, Displaced, CUCKOO_ROUNDS_BEFORE_FULL, ENTRIES_PER_SET, TOMBSTONE_VALUE};

/// Stripes for per-table writer exclusion.
const TABLE_LOCK_STRIPES: usize = 256;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by cuckoo index operations.
#[derive(Debug, Error)]
pub enum CuckooError {
    /// A split could not place every displaced pair.
    ///
    /// Only reachable when the key distribution collapses onto a handful
    /// of fingerprints; the shard escalates it like any other full signal.
    #[error("cuckoo index cannot place key {key:#x}")]
    Full {
        /// The key that could not be placed.
        key: u64,
    },
}

// ------------------------------------------------------------------------------------------------
// Table list
// ------------------------------------------------------------------------------------------------

struct TableInfo {
    /// Keys `>= lower_bound` (and below the next table's bound) live here.
    lower_bound: u64,
    table: CuckooTable,
}

struct TableList {
    /// Sorted ascending by `lower_bound`; entry 0 is always bound 0.
    tables: Vec<Arc<TableInfo>>,
}

impl TableList {
    /// The table responsible for `key`, plus its position.
    fn find(&self, key: u64) -> (usize, &Arc<TableInfo>) {
        let mut which = 0;
        for (i, info) in self.tables.iter().enumerate() {
            if key < info.lower_bound {
                break;
            }
            which = i;
        }
        (which, &self.tables[which])
    }
}

// ------------------------------------------------------------------------------------------------
// CuckooIndex
// ------------------------------------------------------------------------------------------------

/// The multi-table cuckoo index.
pub struct CuckooIndex {
    tables: Mutex<Arc<TableList>>,
    locks: StripedLock,
}

impl std::fmt::Debug for CuckooIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CuckooIndex")
            .field("tables", &self.snapshot().tables.len())
            .finish_non_exhaustive()
    }
}

impl Default for CuckooIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl CuckooIndex {
    /// An index with a single table covering the whole key space.
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Arc::new(TableList {
                tables: vec![Arc::new(TableInfo {
                    lower_bound: 0,
                    table: CuckooTable::new(),
                })],
            })),
            locks: StripedLock::new(TABLE_LOCK_STRIPES),
        }
    }

    fn snapshot(&self) -> Arc<TableList> {
        match self.tables.lock() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn swap_tables(&self, list: Arc<TableList>) {
        match self.tables.lock() {
            Ok(mut guard) => *guard = list,
            Err(poisoned) => *poisoned.into_inner() = list,
        }
    }

    /// Map `key` to `new_value`, replacing an existing `(key, old_value)`
    /// cell if present (pass `old_value = 0` for a fresh insert).
    pub fn insert(&self, key: u64, old_value: u64, new_value: u64) -> Result<(), CuckooError> {
        loop {
            let list = self.snapshot();
            let (_, info) = list.find(key);
            let guard = self.locks.lock(info.lower_bound);

            // Another writer may have split this table while we waited.
            {
                let current = self.snapshot();
                let (_, now) = current.find(key);
                if !Arc::ptr_eq(now, info) {
                    continue;
                }
            }

            match info.table.insert(key, old_value, new_value) {
                Ok(()) => return Ok(()),
                Err(displaced) => {
                    debug!(key = format_args!("{key:#x}"), "cuckoo table full, splitting");
                    let leftover = self.split(&list, info, displaced)?;
                    // Reinsert outside the stripe: a leftover may hash
                    // back into a successor guarded by this same stripe.
                    drop(guard);
                    for (k, v) in leftover {
                        self.insert(k, 0, v)?;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Every live value mapped to `key`.
    pub fn lookup(&self, key: u64) -> Vec<u64> {
        let list = self.snapshot();
        let (_, info) = list.find(key);
        let mut out = Vec::new();
        info.table.lookup(key, &mut out);
        out
    }

    /// Remove the exact `(key, value)` mapping.  Returns whether a cell
    /// matched.
    pub fn remove(&self, key: u64, value: u64) -> bool {
        loop {
            let list = self.snapshot();
            let (_, info) = list.find(key);
            let _guard = self.locks.lock(info.lower_bound);

            {
                let current = self.snapshot();
                let (_, now) = current.find(key);
                if !Arc::ptr_eq(now, info) {
                    continue;
                }
            }

            return info.table.remove(key, value);
        }
    }

    /// Every live `(key, value)` pair across all tables.
    pub fn extract_pairs(&self) -> Vec<(u64, u64)> {
        let list = self.snapshot();
        let mut pairs = Vec::new();
        for info in &list.tables {
            pairs.extend(info.table.extract_pairs());
        }
        pairs
    }

    /// Number of tables (grows by one per split).
    pub fn table_count(&self) -> usize {
        self.snapshot().tables.len()
    }

    /// Split `info` at the median live key, carrying `displaced` along.
    ///
    /// Runs under `info`'s stripe, so no other writer mutates the table
    /// while its pairs are extracted.  Pairs a successor could not place
    /// are returned for the caller to reinsert once the stripe is free.
    fn split(
        &self,
        list: &Arc<TableList>,
        info: &Arc<TableInfo>,
        displaced: Displaced,
    ) -> Result<Vec<(u64, u64)>, CuckooError> {
        let mut pairs = info.table.extract_pairs();
        pairs.push((displaced.key, displaced.value));
        pairs.sort_unstable();

        let pivot = pairs[pairs.len() / 2].0;
        if pivot <= info.lower_bound {
            // Every key collapsed onto the table's lower bound; another
            // table cannot help.
            return Err(CuckooError::Full { key: displaced.key });
        }

        let low = TableInfo {
            lower_bound: info.lower_bound,
            table: CuckooTable::new(),
        };
        let high = TableInfo {
            lower_bound: pivot,
            table: CuckooTable::new(),
        };

        let mut leftover = Vec::new();
        for (key, value) in pairs {
            let target = if key < pivot { &low } else { &high };
            if let Err(d) = target.table.insert(key, 0, value) {
                leftover.push((d.key, d.value));
            }
        }

        // Swap the list: replace `info` with its two successors.
        let split_at = list
            .tables
            .iter()
            .position(|t| Arc::ptr_eq(t, info))
            .unwrap_or(0);
        let mut tables = Vec::with_capacity(list.tables.len() + 1);
        tables.extend(list.tables[..split_at].iter().cloned());
        tables.push(Arc::new(low));
        tables.push(Arc::new(high));
        tables.extend(list.tables[split_at + 1..].iter().cloned());

        info!(
            pivot = format_args!("{pivot:#x}"),
            tables = tables.len(),
            "cuckoo index split"
        );
        self.swap_tables(Arc::new(TableList { tables }));

        // Pathological leftovers (a fingerprint hot enough to overflow a
        // half-empty successor) re-enter through the caller's normal
        // path, which may split again.
        Ok(leftover)
    }
}
