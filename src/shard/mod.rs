//! One shard: the storage unit for a single hash region.
//!
//! A shard ties together the three leaf structures for the slice of the
//! key-space its [`Coordinate`] describes:
//!
//! - the [append-only log](crate::log) holds the record bytes and assigns
//!   ids,
//! - the [cuckoo index](crate::cuckoo) maps key fingerprints to live ids,
//! - the [search tree](crate::search) maps ids to attribute-hash vectors
//!   for filtered scans.
//!
//! Writes flow log → cuckoo → tree, so a fingerprint that reaches the
//! cuckoo index always resolves in the log.  The shard's *offset* is the
//! log's next-id horizon; snapshots pair that horizon with the tree root
//! current at capture time, and an entry is visible in a snapshot exactly
//! when it was created before the horizon and not dead before it.
//!
//! Capacity is bounded two ways: a data budget of one segment's worth of
//! record bytes (`DataFull`) and 32768 search-tree insertions
//! (`SearchFull`).  Both are signals to the container, which reacts by
//! splitting or cleaning the shard; they never reach external callers.

pub mod encoding_impls;
pub mod snapshot;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::cuckoo::{CuckooError, CuckooIndex};
use crate::encoding::EncodingError;
use crate::log::block::SEGMENT_SIZE;
use crate::log::{Log, LogError};
use crate::region::{Coordinate, RegionHasher};
use crate::search::{SearchError, SearchTree};
use encoding_impls::{decode_record, encode_record};

/// Record bytes a shard may hold before reporting `DataFull` (one
/// segment's worth, mirroring the one-file-per-shard budget of the
/// original design).
pub const SHARD_DATA_CAP: u64 = SEGMENT_SIZE;

/// Search-tree insertions a shard may absorb before reporting
/// `SearchFull`.
pub const SHARD_SEARCH_CAP: u64 = 32768;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by shard operations.
#[derive(Debug, Error)]
pub enum ShardError {
    /// The value arity does not match the shard's schema.
    #[error("wrong arity: expected {expected} value attributes, got {got}")]
    WrongArity {
        /// Attributes the shard stores per record.
        expected: usize,
        /// Attributes the caller supplied.
        got: usize,
    },

    /// The shard's data budget is exhausted; split or clean it.
    #[error("shard data region is full")]
    DataFull,

    /// The shard's search-entry budget is exhausted; split or clean it.
    #[error("shard search index is full")]
    SearchFull,

    /// The cuckoo index cannot place another fingerprint.
    #[error("shard key index is full")]
    HashFull,

    /// Underlying log failure.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// Underlying search-tree failure.
    #[error("search tree error: {0}")]
    Search(#[from] SearchError),

    /// A stored record failed to decode.
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

impl From<EncodingError> for ShardError {
    fn from(e: EncodingError) -> Self {
        ShardError::Corrupt(e.to_string())
    }
}

impl From<CuckooError> for ShardError {
    fn from(_: CuckooError) -> Self {
        ShardError::HashFull
    }
}

// ------------------------------------------------------------------------------------------------
// Record
// ------------------------------------------------------------------------------------------------

/// One decoded record: a key, its value attributes, and a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The primary key.
    pub key: Vec<u8>,

    /// One byte string per value attribute.
    pub value: Vec<Vec<u8>>,

    /// Caller-assigned version; higher versions supersede lower ones.
    pub version: u64,
}

// ------------------------------------------------------------------------------------------------
// Shard
// ------------------------------------------------------------------------------------------------

/// The storage for one hash region.
pub struct Shard {
    coord: Coordinate,
    attrs: usize,
    hasher: Arc<dyn RegionHasher>,
    log: Log,
    index: CuckooIndex,
    tree: SearchTree,

    /// Total tree insertions over this shard's lifetime (never reset).
    search_entries: AtomicU64,

    /// Records tombstoned in place.
    dead_entries: AtomicU64,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("coord", &self.coord)
            .field("attrs", &self.attrs)
            .finish_non_exhaustive()
    }
}

impl Shard {
    /// Create a fresh shard whose log lives at `prefix`.
    pub fn create(
        prefix: impl Into<PathBuf>,
        coord: Coordinate,
        attrs: usize,
        hasher: Arc<dyn RegionHasher>,
    ) -> Result<Self, ShardError> {
        let prefix = prefix.into();
        let log = Log::open(&prefix)?;
        info!(prefix = %prefix.display(), "shard created");
        Ok(Self {
            coord,
            attrs,
            hasher,
            log,
            index: CuckooIndex::new(),
            tree: SearchTree::new(attrs),
            search_entries: AtomicU64::new(0),
            dead_entries: AtomicU64::new(0),
        })
    }

    /// Reopen a quiesced shard, replaying its log to rebuild the cuckoo
    /// index and search tree.
    pub fn open(
        prefix: impl Into<PathBuf>,
        coord: Coordinate,
        attrs: usize,
        hasher: Arc<dyn RegionHasher>,
    ) -> Result<Self, ShardError> {
        let shard = Self::create(prefix, coord, attrs, hasher)?;
        shard.recover()?;
        Ok(shard)
    }

    /// Replay every live record in the log into the RAM structures.
    fn recover(&self) -> Result<(), ShardError> {
        let horizon = self.log.next_id();
        let mut live = 0u64;
        for id in 1..horizon {
            let Some(bytes) = self.log.lookup(id)? else {
                continue; // op ids and removed records leave holes
            };
            let record = decode_record(&bytes)?;
            let (rcoord, hashes) = self.hasher.hash_record(&record.key, &record.value);
            self.index.insert(rcoord.primary_hash, 0, id)?;
            self.tree.insert(id, &hashes)?;
            live += 1;
        }
        self.search_entries.store(live, Ordering::Release);
        // Removed-op accounting: the log counts one for the op id and one
        // for the dead record.
        self.dead_entries
            .store(self.log.removed_count() / 2, Ordering::Release);
        debug!(live, horizon, "shard recovered");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Fetch the live record stored under `key`.
    pub fn get(
        &self,
        primary_hash: u64,
        key: &[u8],
    ) -> Result<Option<(Vec<Vec<u8>>, u64)>, ShardError> {
        Ok(self
            .find_live(primary_hash, key)?
            .map(|(_, record)| (record.value, record.version)))
    }

    /// The log id of the live record stored under `key`, if any.
    pub fn contains(&self, primary_hash: u64, key: &[u8]) -> Result<Option<u64>, ShardError> {
        Ok(self.find_live(primary_hash, key)?.map(|(id, _)| id))
    }

    fn find_live(
        &self,
        primary_hash: u64,
        key: &[u8],
    ) -> Result<Option<(u64, Record)>, ShardError> {
        let mut best: Option<(u64, Record)> = None;
        for id in self.index.lookup(primary_hash) {
            let Some(bytes) = self.log.lookup(id)? else {
                continue; // tombstoned cell racing a removal
            };
            let record = decode_record(&bytes)?;
            if record.key != key {
                continue; // distinct key sharing the fingerprint
            }
            let better = match &best {
                Some((_, current)) => record.version > current.version,
                None => true,
            };
            if better {
                best = Some((id, record));
            }
        }
        Ok(best)
    }

    /// Decode the record with the given id even if it has been removed
    /// (snapshots resolve ids whose removal postdates their horizon).
    pub(crate) fn resolve_any(&self, id: u64) -> Result<Option<Record>, ShardError> {
        match self.log.lookup_including_removed(id)? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Store a record, returning the shard's new offset horizon.
    ///
    /// `coord` and `hashes` must come from the region hasher applied to
    /// `(key, value)`; the caller (the container's flush path) already
    /// computed them for routing.
    pub fn put(
        &self,
        coord: &Coordinate,
        hashes: &[u64],
        key: &[u8],
        value: &[Vec<u8>],
        version: u64,
    ) -> Result<u64, ShardError> {
        if value.len() != self.attrs {
            return Err(ShardError::WrongArity {
                expected: self.attrs,
                got: value.len(),
            });
        }
        if self.search_entries.load(Ordering::Acquire) >= SHARD_SEARCH_CAP {
            return Err(ShardError::SearchFull);
        }

        let record = Record {
            key: key.to_vec(),
            value: value.to_vec(),
            version,
        };
        let bytes = encode_record(&record)?;
        if self.log.used_bytes() + bytes.len() as u64 > SHARD_DATA_CAP {
            return Err(ShardError::DataFull);
        }

        let id = self.log.append(&bytes)?;
        self.index.insert(coord.primary_hash, 0, id)?;
        self.tree.insert(id, hashes)?;
        self.search_entries.fetch_add(1, Ordering::AcqRel);
        Ok(id + 1)
    }

    /// Tombstone the live record stored under `key`, returning the new
    /// offset horizon (`None` when no live record matches).
    pub fn del(&self, primary_hash: u64, key: &[u8]) -> Result<Option<u64>, ShardError> {
        match self.contains(primary_hash, key)? {
            Some(id) => self.remove_by_id(id).map(Some),
            None => Ok(None),
        }
    }

    /// Tombstone the record with the given id.
    pub fn remove_by_id(&self, id: u64) -> Result<u64, ShardError> {
        let bytes = self
            .log
            .lookup(id)?
            .ok_or_else(|| ShardError::Corrupt(format!("no live record with id {id}")))?;
        let record = decode_record(&bytes)?;
        let (rcoord, hashes) = self.hasher.hash_record(&record.key, &record.value);

        let op = self
            .log
            .remove(id)?
            .ok_or_else(|| ShardError::Corrupt(format!("record {id} vanished mid-removal")))?;
        self.index.remove(rcoord.primary_hash, id);
        self.tree.remove(id, &hashes, op)?;
        self.dead_entries.fetch_add(1, Ordering::AcqRel);
        Ok(op + 1)
    }

    /// Stream every live record whose coordinate intersects `target`
    /// into `dest` (split and clean both ride on this).
    pub fn copy_to(&self, target: &Coordinate, dest: &Shard) -> Result<(), ShardError> {
        let horizon = self.horizon();
        let root = self.tree.current_root();
        let unconstrained = vec![None; self.attrs];
        let mut ids = Vec::new();
        self.tree.iterate(root, horizon, &unconstrained, &mut ids)?;
        ids.sort_unstable();

        let mut copied = 0u64;
        for id in ids {
            let Some(bytes) = self.log.lookup(id)? else {
                continue;
            };
            let record = decode_record(&bytes)?;
            let (rcoord, hashes) = self.hasher.hash_record(&record.key, &record.value);
            if !rcoord.intersects(target) {
                continue;
            }
            dest.put(&rcoord, &hashes, &record.key, &record.value, record.version)?;
            copied += 1;
        }
        debug!(copied, "records copied to successor shard");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Accounting / maintenance
    // --------------------------------------------------------------------------------------------

    /// The shard's region.
    pub fn coord(&self) -> &Coordinate {
        &self.coord
    }

    /// Value attributes per record.
    pub fn attrs(&self) -> usize {
        self.attrs
    }

    /// The current offset horizon (the log's next id).
    pub fn horizon(&self) -> u64 {
        self.log.next_id()
    }

    /// The currently published search-tree root.
    pub fn tree_root(&self) -> u64 {
        self.tree.current_root()
    }

    /// Iterate the search tree under an explicit `(root, horizon)`
    /// capture.
    pub(crate) fn tree_iterate(
        &self,
        root: u64,
        horizon: u64,
        constraints: &[Option<u64>],
        out: &mut Vec<u64>,
    ) -> Result<(), ShardError> {
        self.tree.iterate(root, horizon, constraints, out)?;
        Ok(())
    }

    /// Percentage of this shard occupied by dead entries.
    pub fn stale_space(&self) -> u32 {
        let total = self.search_entries.load(Ordering::Acquire);
        if total == 0 {
            return 0;
        }
        let dead = self.dead_entries.load(Ordering::Acquire).min(total);
        (dead * 100 / total) as u32
    }

    /// Percentage of the shard's tighter capacity bound in use.
    pub fn used_space(&self) -> u32 {
        let data = self.log.used_bytes() * 100 / SHARD_DATA_CAP;
        let search = self.search_entries.load(Ordering::Acquire) * 100 / SHARD_SEARCH_CAP;
        data.max(search).min(100) as u32
    }

    /// Flush OS buffers and persist the reopenable state file.
    pub fn sync(&self) -> Result<(), ShardError> {
        self.log.checkpoint()?;
        Ok(())
    }

    /// Flush segment data without rewriting the state file.
    pub fn async_sync(&self) -> Result<(), ShardError> {
        self.log.sync_data()?;
        Ok(())
    }

    /// Close the underlying log.
    pub fn close(&self) -> Result<(), ShardError> {
        self.log.close()?;
        Ok(())
    }

    /// Mark this shard's files as superseded on disk; outstanding
    /// snapshots keep reading, nothing is written back on drop.
    pub fn retire(&self) {
        self.log.retire();
    }
}
