//! The shard container: linearizable get/put/del plus filtered search
//! over a directory of shards.
//!
//! # Locking
//!
//! At any given time only one thread mutates shards — a mutation being a
//! flushed put/del or a clean/split of a shard.  The `shards_mutate`
//! mutex enforces this.  Replacing the shard vector conflicts with
//! readers, so the vector pointer itself sits behind a reader-writer
//! lock; the single mutator may read the vector without the read lock
//! (it is the only thread that swaps it) and takes the write lock only
//! for the swap.
//!
//! Synchronization is around the reference-counted *pointer* to the
//! vector, never the vector contents.  `get` tolerates racing a swap by
//! overlaying the write-ahead fifo on whatever vector it saw; `put`/`del`
//! only touch the fifo; snapshots patch the offsets they read with the
//! pending intentions fifo.
//!
//! # Write path
//!
//! `put`/`del` append to the RAM write-ahead fifo and return.  `flush`
//! applies entries in order: locate the superseded live record across
//! the primary-intersecting shards, store the new record into the last
//! intersecting shard, tombstone the old one, then publish both offset
//! advances through the intentions fifo.  Durability is whatever the
//! flushed shards have synced; `quiesce` drains the fifo, fsyncs every
//! shard, and writes a reopenable state file.
//!
//! # Space management
//!
//! A shard that reports itself full is escalated by `do_mandatory_io`:
//! cleaned in place when ≥ 30% of it is dead, split four ways otherwise
//! (one secondary-hash bit plus one primary-hash bit per secondary
//! branch, each chosen as the unmasked bit whose live population is
//! closest to balanced, smallest index winning ties).  A pool of up to
//! 16 preallocated segment files amortizes successor creation.

pub mod shard_vector;
pub mod snapshot;

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use crossbeam::sync::ShardedLock;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::fifo::IterableFifo;
use crate::region::{Coordinate, RegionHasher, SearchTerms};
use crate::shard::snapshot::ShardSnapshot;
use crate::shard::{Shard, ShardError};
use shard_vector::ShardVector;
use snapshot::{RollingSnapshot, Snapshot};

/// Name of the quiesce state file inside the store directory.
const STATE_FILE_NAME: &str = "store.state";

/// Version stamp the state file must carry.
const STATE_FILE_VERSION: u32 = 1;

/// Cap on the preallocated spare-file pool.
const SPARE_SHARDS_MAX: usize = 16;

/// Sentinel for "no shard needs mandatory io".
const NEEDS_IO_NONE: usize = usize::MAX;

// ------------------------------------------------------------------------------------------------
// Error / status types
// ------------------------------------------------------------------------------------------------

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The value arity does not match the store's schema.
    #[error("wrong arity: expected {expected} value attributes, got {got}")]
    WrongArity {
        /// Value attributes the store was opened with.
        expected: usize,
        /// Value attributes the caller supplied.
        got: usize,
    },

    /// Writing back a shard failed; the shard is degraded.
    #[error("sync failed: {0}")]
    SyncFailed(#[source] ShardError),

    /// Unlinking shard files failed.
    #[error("drop failed: {0}")]
    DropFailed(#[source] io::Error),

    /// A shard split could not complete; the original shard remains.
    #[error("split failed: {0}")]
    SplitFailed(String),

    /// Underlying shard failure.
    #[error("shard error: {0}")]
    Shard(#[from] ShardError),

    /// Filesystem failure outside any one shard.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The quiesce state file is missing, malformed, or for another
    /// state id.
    #[error("state file rejected: {0}")]
    State(String),
}

/// Snapshot of store statistics returned by [`Store::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of live shards.
    pub shard_count: usize,

    /// Current shard-vector generation.
    pub generation: u64,

    /// Per-shard used-space percentages, in vector order.
    pub used_space: Vec<u32>,

    /// Per-shard stale-space percentages, in vector order.
    pub stale_space: Vec<u32>,
}

/// Outcome of a [`Store::flush`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// At least one buffered entry reached the shards.
    Flushed,

    /// The fifo was already empty.
    DidNothing,

    /// A shard's data region filled; call [`Store::do_mandatory_io`].
    DataFull,

    /// A shard's search structures filled; call
    /// [`Store::do_mandatory_io`].
    SearchFull,
}

// ------------------------------------------------------------------------------------------------
// Write-ahead fifo entries
// ------------------------------------------------------------------------------------------------

/// One buffered mutation awaiting flush.
#[derive(Debug)]
pub(crate) struct WalEntry {
    /// Coordinate at enqueue time: fully-masked for puts, primary-only
    /// for dels.
    pub(crate) coord: Coordinate,

    /// The key.
    pub(crate) key: Vec<u8>,

    /// The value attributes; `None` marks a deletion.
    pub(crate) value: Option<Vec<Vec<u8>>>,

    /// The version carried by a put (0 for dels).
    pub(crate) version: u64,
}

/// A pending offset advance, published before it is applied so racing
/// snapshots can patch the offsets they read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OffsetUpdate {
    pub(crate) generation: u64,
    pub(crate) shard_num: usize,
    pub(crate) new_offset: u64,
}

struct SparePool {
    queue: VecDeque<PathBuf>,
    counter: u64,
}

// ------------------------------------------------------------------------------------------------
// Store
// ------------------------------------------------------------------------------------------------

/// A directory of shards answering get/put/del/search for one key-space.
pub struct Store {
    base: PathBuf,
    arity: u16,
    attrs: usize,
    hasher: Arc<dyn RegionHasher>,

    /// Single-mutator lock: flush, clean, split, preallocate, destroy.
    shards_mutate: Mutex<()>,

    /// The live shard vector pointer (readers clone, mutator swaps).
    shards: ShardedLock<Arc<ShardVector>>,

    /// Buffered mutations.
    wal: IterableFifo<Arc<WalEntry>>,

    /// Pending offset advances.
    offsets: IterableFifo<OffsetUpdate>,

    spare: Mutex<SparePool>,

    /// Shard index awaiting mandatory io, or [`NEEDS_IO_NONE`].
    needs_io: AtomicUsize,

    /// Xorshift state for the optimistic-io coin flip.
    seed: AtomicU64,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("base", &self.base)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

impl Store {
    // --------------------------------------------------------------------------------------------
    // Construction
    // --------------------------------------------------------------------------------------------

    /// Create a blank store: one shard covering everything.
    ///
    /// `arity` counts the key plus every value attribute, matching the
    /// tuple width the hasher was built for.
    pub fn create(
        directory: impl Into<PathBuf>,
        hasher: Arc<dyn RegionHasher>,
        arity: u16,
    ) -> Result<Self, StoreError> {
        let base = directory.into();
        fs::create_dir_all(&base)?;
        let attrs = arity.saturating_sub(1) as usize;

        let coord = Coordinate::everything();
        let shard = Arc::new(Shard::create(
            base.join(shard_filename(&coord)),
            coord,
            attrs,
            Arc::clone(&hasher),
        )?);

        info!(base = %base.display(), arity, "store created");
        Ok(Self {
            shards: ShardedLock::new(Arc::new(ShardVector::new(coord, shard))),
            base,
            arity,
            attrs,
            hasher,
            shards_mutate: Mutex::new(()),
            wal: IterableFifo::new(),
            offsets: IterableFifo::new(),
            spare: Mutex::new(SparePool {
                queue: VecDeque::new(),
                counter: 0,
            }),
            needs_io: AtomicUsize::new(NEEDS_IO_NONE),
            seed: AtomicU64::new(0x9E37_79B9_7F4A_7C15),
        })
    }

    /// Reopen a quiesced store, verifying the state id recorded by the
    /// matching [`quiesce`](Store::quiesce).
    pub fn open(
        directory: impl Into<PathBuf>,
        hasher: Arc<dyn RegionHasher>,
        arity: u16,
        state_id: &str,
    ) -> Result<Self, StoreError> {
        let base = directory.into();
        let attrs = arity.saturating_sub(1) as usize;
        let entries = load_state(&base, state_id)?;

        let mut shards = Vec::with_capacity(entries.len());
        for (coord, offset) in entries {
            let shard = Arc::new(Shard::open(
                base.join(shard_filename(&coord)),
                coord,
                attrs,
                Arc::clone(&hasher),
            )?);
            shards.push((coord, shard, offset));
        }

        info!(base = %base.display(), shards = shards.len(), state_id, "store reopened");
        Ok(Self {
            shards: ShardedLock::new(Arc::new(ShardVector::from_parts(1, shards))),
            base,
            arity,
            attrs,
            hasher,
            shards_mutate: Mutex::new(()),
            wal: IterableFifo::new(),
            offsets: IterableFifo::new(),
            spare: Mutex::new(SparePool {
                queue: VecDeque::new(),
                counter: 0,
            }),
            needs_io: AtomicUsize::new(NEEDS_IO_NONE),
            seed: AtomicU64::new(0x9E37_79B9_7F4A_7C15),
        })
    }

    fn shards_snapshot(&self) -> Arc<ShardVector> {
        let guard = match self.shards.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(&guard)
    }

    fn swap_shards(&self, vector: Arc<ShardVector>) {
        let mut guard = match self.shards.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = vector;
    }

    fn lock_mutate(&self) -> MutexGuard<'_, ()> {
        match self.shards_mutate.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Reads and buffered writes
    // --------------------------------------------------------------------------------------------

    /// Fetch the current value and version stored under `key`.
    ///
    /// Reads the shards first, then overlays the write-ahead fifo so
    /// buffered puts and dels are visible immediately; this is what makes
    /// the store linearizable per key despite lazy persistence.
    pub fn get(&self, key: &[u8]) -> Result<Option<(Vec<Vec<u8>>, u64)>, StoreError> {
        let coord = self.hasher.hash_key(key);
        // Take the fifo cursor before touching the shards: an entry that
        // flushes mid-read is then seen at least once.
        let mut wal_cursor = self.wal.iterate();
        let shards = self.shards_snapshot();

        let mut shard_result = None;
        for i in 0..shards.size() {
            if !shards.coordinate(i).primary_intersects(&coord) {
                continue;
            }
            if let Some(hit) = shards.shard(i).get(coord.primary_hash, key)? {
                shard_result = Some(hit);
                break;
            }
        }

        let mut overlaid = false;
        let mut wal_result = None;
        while wal_cursor.valid() {
            if let Some(entry) = wal_cursor.with(Arc::clone) {
                if entry.coord.primary_intersects(&coord) && entry.key == key {
                    overlaid = true;
                    wal_result = entry.value.clone().map(|v| (v, entry.version));
                }
            }
            wal_cursor.next();
        }

        if overlaid {
            Ok(wal_result)
        } else {
            Ok(shard_result)
        }
    }

    /// Buffer a put; durable once a later [`flush`](Store::flush) covers
    /// it.
    pub fn put(&self, key: &[u8], value: Vec<Vec<u8>>, version: u64) -> Result<(), StoreError> {
        if value.len() + 1 != self.arity as usize {
            return Err(StoreError::WrongArity {
                expected: self.attrs,
                got: value.len(),
            });
        }
        let (coord, _hashes) = self.hasher.hash_record(key, &value);
        self.wal.append(Arc::new(WalEntry {
            coord,
            key: key.to_vec(),
            value: Some(value),
            version,
        }));
        Ok(())
    }

    /// Buffer a deletion.
    pub fn del(&self, key: &[u8]) -> Result<(), StoreError> {
        let coord = self.hasher.hash_key(key);
        self.wal.append(Arc::new(WalEntry {
            coord,
            key: key.to_vec(),
            value: None,
            version: 0,
        }));
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Snapshots
    // --------------------------------------------------------------------------------------------

    /// A snapshot filtered by the given search terms.
    pub fn search(&self, terms: SearchTerms) -> Result<Snapshot, StoreError> {
        self.make_snapshot(terms)
    }

    /// A snapshot of everything.
    pub fn snapshot(&self) -> Result<Snapshot, StoreError> {
        self.make_snapshot(SearchTerms::new(self.attrs))
    }

    /// A snapshot of everything that then replays the write-ahead fifo
    /// from its capture point onward.
    pub fn rolling_snapshot(&self) -> Result<RollingSnapshot, StoreError> {
        let wal_cursor = self.wal.iterate();
        let snap = self.make_snapshot(SearchTerms::new(self.attrs))?;
        Ok(RollingSnapshot::new(snap, wal_cursor))
    }

    fn make_snapshot(&self, terms: SearchTerms) -> Result<Snapshot, StoreError> {
        let (coord, constraints) = self.hasher.hash_search(&terms);
        let mut offsets_cursor = self.offsets.iterate();
        let shards = self.shards_snapshot();

        let mut offsets: Vec<u64> = (0..shards.size()).map(|i| shards.offset(i)).collect();

        // Apply intentions published for this vector generation but not
        // yet (or concurrently being) applied.
        while offsets_cursor.valid() {
            if let Some(update) = offsets_cursor.with(|u| *u) {
                if update.generation == shards.generation() && update.shard_num < offsets.len() {
                    offsets[update.shard_num] = offsets[update.shard_num].max(update.new_offset);
                }
            }
            offsets_cursor.next();
        }

        let mut snaps = Vec::new();
        for i in 0..shards.size() {
            if coord.intersects(shards.coordinate(i)) {
                snaps.push(ShardSnapshot::capture(
                    Arc::clone(shards.shard(i)),
                    offsets[i],
                ));
            }
        }
        Ok(Snapshot::new(terms, constraints, snaps))
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Apply up to `num` buffered entries (all of them when `None`) to
    /// the shards, in order.
    ///
    /// With `nonblocking` set, returns immediately (reporting progress)
    /// when another thread already holds the mutate lock.
    pub fn flush(&self, num: Option<usize>, nonblocking: bool) -> Result<FlushStatus, StoreError> {
        let _guard = if nonblocking {
            match self.shards_mutate.try_lock() {
                Ok(g) => g,
                Err(TryLockError::WouldBlock) => return Ok(FlushStatus::Flushed),
                Err(TryLockError::Poisoned(p)) => p.into_inner(),
            }
        } else {
            self.lock_mutate()
        };

        let mut flushed = false;
        let mut full: Option<FlushStatus> = None;
        let mut cursor = self.wal.iterate();
        let mut applied = 0usize;

        while cursor.valid() && num.map_or(true, |n| applied < n) {
            let Some(entry) = cursor.with(Arc::clone) else {
                break;
            };
            let shards = self.shards_snapshot();

            // Any live record under this key is superseded by the entry.
            let mut del_target: Option<(usize, u64)> = None;
            for i in 0..shards.size() {
                if !shards.coordinate(i).primary_intersects(&entry.coord) {
                    continue;
                }
                if let Some(id) = shards
                    .shard(i)
                    .contains(entry.coord.primary_hash, &entry.key)?
                {
                    del_target = Some((i, id));
                    break;
                }
            }

            // Store the new record.  The scan runs backwards so that the
            // successor ordering installed by splits is honored: shards
            // with the zero secondary bit sit last and are offered the
            // record first.
            let mut put_done: Option<(usize, u64)> = None;
            if let Some(value) = &entry.value {
                let (rcoord, hashes) = self.hasher.hash_record(&entry.key, value);
                for i in (0..shards.size()).rev() {
                    if !shards.coordinate(i).intersects(&rcoord) {
                        continue;
                    }
                    match shards
                        .shard(i)
                        .put(&rcoord, &hashes, &entry.key, value, entry.version)
                    {
                        Ok(offset) => {
                            put_done = Some((i, offset));
                            break;
                        }
                        Err(ShardError::DataFull) => {
                            self.needs_io.store(i, Ordering::Release);
                            full = Some(FlushStatus::DataFull);
                            break;
                        }
                        Err(ShardError::SearchFull) | Err(ShardError::HashFull) => {
                            self.needs_io.store(i, Ordering::Release);
                            full = Some(FlushStatus::SearchFull);
                            break;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                if put_done.is_none() {
                    // Shard full (or mid-split); leave the entry queued.
                    break;
                }
            }

            // Tombstone the superseded record after the new one landed;
            // snapshots in the gap are protected by the offset horizons.
            let mut del_done: Option<(usize, u64)> = None;
            if let Some((i, id)) = del_target {
                let offset = shards.shard(i).remove_by_id(id)?;
                del_done = Some((i, offset));
            }

            // Publish both offset advances, apply them, then retire them.
            let mut updates = Vec::new();
            if let Some((i, offset)) = del_done {
                updates.push(OffsetUpdate {
                    generation: shards.generation(),
                    shard_num: i,
                    new_offset: offset,
                });
            }
            if let Some((i, offset)) = put_done {
                updates.push(OffsetUpdate {
                    generation: shards.generation(),
                    shard_num: i,
                    new_offset: offset,
                });
            }
            self.offsets.batch_append(updates.clone());
            for update in &updates {
                shards.set_offset(update.shard_num, update.new_offset);
            }
            for _ in &updates {
                self.offsets.remove_oldest();
            }

            flushed = true;
            applied += 1;
            cursor.next();
        }

        self.wal.advance_to(&cursor);

        if let Some(status) = full {
            return Ok(status);
        }
        Ok(if flushed {
            FlushStatus::Flushed
        } else {
            FlushStatus::DidNothing
        })
    }

    // --------------------------------------------------------------------------------------------
    // Space management
    // --------------------------------------------------------------------------------------------

    /// Split or clean the shard a failed flush flagged as full.
    pub fn do_mandatory_io(&self) -> Result<FlushStatus, StoreError> {
        let _guard = self.lock_mutate();
        let which = self.needs_io.swap(NEEDS_IO_NONE, Ordering::AcqRel);
        if which == NEEDS_IO_NONE {
            return Ok(FlushStatus::DidNothing);
        }
        let shards = self.shards_snapshot();
        if which >= shards.size() {
            return Ok(FlushStatus::DidNothing);
        }
        self.deal_with_full_shard(&shards, which)?;
        Ok(FlushStatus::Flushed)
    }

    /// Opportunistically rebuild the most-loaded shard when the store is
    /// filling up.
    pub fn do_optimistic_io(&self) -> Result<FlushStatus, StoreError> {
        let shards = self.shards_snapshot();

        let mut most_loaded = 0usize;
        let mut most_loaded_amount = 0u32;
        let mut used_total = 0i64;
        for i in 0..shards.size() {
            let used = shards.shard(i).used_space();
            if used > most_loaded_amount {
                most_loaded = i;
                most_loaded_amount = used;
            }
            used_total += i64::from(used);
        }

        let flip = self.random_unit();
        let exponent = (100 - used_total).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        let threshold = 1.0 / 1.01_f64.powi(exponent);

        let _guard = self.lock_mutate();
        let current = self.shards_snapshot();
        if Arc::ptr_eq(&current, &shards) && flip < threshold && most_loaded_amount >= 75 {
            self.deal_with_full_shard(&shards, most_loaded)?;
            return Ok(FlushStatus::Flushed);
        }
        Ok(FlushStatus::DidNothing)
    }

    /// Top up the spare-file pool if upcoming splits look likely.
    pub fn preallocate(&self) -> Result<FlushStatus, StoreError> {
        {
            let pool = self.lock_spare();
            if pool.queue.len() >= SPARE_SHARDS_MAX {
                return Ok(FlushStatus::DidNothing);
            }
        }

        let shards = self.shards_snapshot();
        let mut needed: i64 = 0;
        for i in 0..shards.size() {
            let shard = shards.shard(i);
            let used = shard.used_space();
            let stale = shard.stale_space();
            if used < 25 {
                // Plenty of room.
            } else if used < 50 {
                needed += 1;
            } else if stale >= 30 {
                needed += 1;
            } else {
                needed += 4;
            }
        }

        let need_one = {
            let pool = self.lock_spare();
            needed - pool.queue.len() as i64 > 0
        };
        if !need_one {
            return Ok(FlushStatus::DidNothing);
        }

        let path = {
            let mut pool = self.lock_spare();
            let path = self.base.join(format!("spare-{}", pool.counter));
            pool.counter += 1;
            path
        };
        let file = fs::File::create(&path)?;
        file.set_len(crate::log::block::SEGMENT_SIZE)?;
        file.sync_all()?;
        debug!(path = %path.display(), "spare segment file preallocated");

        let mut pool = self.lock_spare();
        pool.queue.push_back(path);
        Ok(FlushStatus::Flushed)
    }

    fn deal_with_full_shard(
        &self,
        shards: &Arc<ShardVector>,
        which: usize,
    ) -> Result<(), StoreError> {
        let coord = *shards.coordinate(which);
        let shard = shards.shard(which);
        let unsplittable = coord.primary_mask == u64::MAX
            || coord.secondary_lower_mask == u64::MAX
            || coord.secondary_upper_mask == u64::MAX;

        if shard.stale_space() >= 30 {
            self.clean_shard(shards, which)
        } else if unsplittable {
            if shard.stale_space() > 0 {
                self.clean_shard(shards, which)
            } else {
                Err(StoreError::SplitFailed(
                    "shard masks exhausted and nothing is stale".into(),
                ))
            }
        } else {
            self.split_shard(shards, which)
        }
    }

    /// Rewrite one shard without its dead entries.
    fn clean_shard(&self, shards: &Arc<ShardVector>, which: usize) -> Result<(), StoreError> {
        let coord = *shards.coordinate(which);
        let old = Arc::clone(shards.shard(which));
        let name = shard_filename(&coord);
        let tmp_name = format!("{name}-tmp");
        info!(shard = %name, stale = old.stale_space(), "cleaning shard");

        let tmp = self.create_shard_at(&tmp_name, coord)?;
        old.copy_to(&coord, &tmp)?;
        tmp.close()?;
        drop(tmp);

        // Swing the rewritten files over the old names.  The old shard's
        // open descriptors keep serving concurrent snapshots.
        rename_shard_files(&self.base, &tmp_name, &name)?;

        let fresh = Arc::new(Shard::open(
            self.base.join(&name),
            coord,
            self.attrs,
            Arc::clone(&self.hasher),
        )?);
        let vector = shards.replace(which, coord, fresh);
        self.swap_shards(vector);
        old.retire();
        Ok(())
    }

    /// Split one shard into four successors.
    fn split_shard(&self, shards: &Arc<ShardVector>, which: usize) -> Result<(), StoreError> {
        let coord = *shards.coordinate(which);
        let shard = Arc::clone(shards.shard(which));
        info!(shard = %shard_filename(&coord), "splitting shard four ways");

        // Tally each unmasked bit's live population to pick the most
        // balanced cuts.
        let snap = ShardSnapshot::capture(Arc::clone(&shard), shards.offset(which));
        let records = snap.records(&vec![None; self.attrs])?;
        let coords: Vec<Coordinate> = records
            .iter()
            .map(|r| self.hasher.hash_record(&r.key, &r.value).0)
            .collect();

        let mut zeros = [0i64; 64];
        let mut ones = [0i64; 64];
        for rc in &coords {
            for j in 0..64 {
                let bit = 1u64 << j;
                if coord.secondary_lower_mask & bit != 0 {
                    continue;
                }
                if rc.secondary_lower_hash & bit != 0 {
                    ones[j] += 1;
                } else {
                    zeros[j] += 1;
                }
            }
        }
        let secondary_bit = 1u64 << which_to_split(coord.secondary_lower_mask, &zeros, &ones);

        let mut zeros_lower = [0i64; 64];
        let mut ones_lower = [0i64; 64];
        let mut zeros_upper = [0i64; 64];
        let mut ones_upper = [0i64; 64];
        for rc in &coords {
            let upper_branch = rc.secondary_lower_hash & secondary_bit != 0;
            for j in 0..64 {
                let bit = 1u64 << j;
                if coord.primary_mask & bit != 0 {
                    continue;
                }
                let one = rc.primary_hash & bit != 0;
                match (upper_branch, one) {
                    (true, true) => ones_upper[j] += 1,
                    (true, false) => zeros_upper[j] += 1,
                    (false, true) => ones_lower[j] += 1,
                    (false, false) => zeros_lower[j] += 1,
                }
            }
        }
        let primary_lower_bit =
            1u64 << which_to_split(coord.primary_mask, &zeros_lower, &ones_lower);
        let primary_upper_bit =
            1u64 << which_to_split(coord.primary_mask, &zeros_upper, &ones_upper);

        let zero_zero = Coordinate::new(
            coord.primary_mask | primary_lower_bit,
            coord.primary_hash,
            coord.secondary_lower_mask | secondary_bit,
            coord.secondary_lower_hash,
            coord.secondary_upper_mask,
            coord.secondary_upper_hash,
        );
        let zero_one = Coordinate::new(
            coord.primary_mask | primary_upper_bit,
            coord.primary_hash,
            coord.secondary_lower_mask | secondary_bit,
            coord.secondary_lower_hash | secondary_bit,
            coord.secondary_upper_mask,
            coord.secondary_upper_hash,
        );
        let one_zero = Coordinate::new(
            coord.primary_mask | primary_lower_bit,
            coord.primary_hash | primary_lower_bit,
            coord.secondary_lower_mask | secondary_bit,
            coord.secondary_lower_hash,
            coord.secondary_upper_mask,
            coord.secondary_upper_hash,
        );
        let one_one = Coordinate::new(
            coord.primary_mask | primary_upper_bit,
            coord.primary_hash | primary_upper_bit,
            coord.secondary_lower_mask | secondary_bit,
            coord.secondary_lower_hash | secondary_bit,
            coord.secondary_upper_mask,
            coord.secondary_upper_hash,
        );

        let result = self.populate_successors(
            &shard,
            [&zero_zero, &zero_one, &one_zero, &one_one],
        );
        let successors = match result {
            Ok(s) => s,
            Err(e) => {
                // Leave the original shard in place; scrap the partial
                // successors.
                for c in [&zero_zero, &zero_one, &one_zero, &one_one] {
                    let _ = drop_shard_files(&self.base, &shard_filename(c));
                }
                return Err(StoreError::SplitFailed(e.to_string()));
            }
        };
        let [s_zero_zero, s_zero_one, s_one_zero, s_one_one] = successors;

        // Zero-secondary successors go last so a record with no
        // searchable attribute is still found by the lookup path.
        let vector = shards.replace_four(
            which,
            [
                (zero_one, s_zero_one),
                (one_one, s_one_one),
                (zero_zero, s_zero_zero),
                (one_zero, s_one_zero),
            ],
        );
        self.swap_shards(vector);
        shard.retire();
        drop_shard_files(&self.base, &shard_filename(&coord)).map_err(StoreError::DropFailed)?;
        Ok(())
    }

    fn populate_successors(
        &self,
        source: &Arc<Shard>,
        coords: [&Coordinate; 4],
    ) -> Result<[Arc<Shard>; 4], StoreError> {
        let mut out: Vec<Arc<Shard>> = Vec::with_capacity(4);
        for c in coords {
            let successor = Arc::new(self.create_shard_at(&shard_filename(c), *c)?);
            source.copy_to(c, &successor)?;
            out.push(successor);
        }
        match <[Arc<Shard>; 4]>::try_from(out) {
            Ok(arr) => Ok(arr),
            Err(_) => Err(StoreError::SplitFailed("successor construction".into())),
        }
    }

    /// Create a shard whose files live under `name`, consuming a spare
    /// segment file when one is available.
    fn create_shard_at(&self, name: &str, coord: Coordinate) -> Result<Shard, StoreError> {
        let spare = {
            let mut pool = self.lock_spare();
            pool.queue.pop_front()
        };
        if let Some(spare_path) = spare {
            let target = self.base.join(format!("{name}.0"));
            if let Err(e) = fs::rename(&spare_path, &target) {
                warn!(error = %e, "spare file rename failed; creating from scratch");
            }
        }
        Ok(Shard::create(
            self.base.join(name),
            coord,
            self.attrs,
            Arc::clone(&self.hasher),
        )?)
    }

    fn lock_spare(&self) -> MutexGuard<'_, SparePool> {
        match self.spare.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn random_unit(&self) -> f64 {
        // Xorshift; plenty for a maintenance coin flip.
        let mut x = self.seed.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.seed.store(x, Ordering::Relaxed);
        (x >> 11) as f64 / (1u64 << 53) as f64
    }

    // --------------------------------------------------------------------------------------------
    // Durability
    // --------------------------------------------------------------------------------------------

    /// Current shard layout and occupancy.
    pub fn stats(&self) -> StoreStats {
        let shards = self.shards_snapshot();
        StoreStats {
            shard_count: shards.size(),
            generation: shards.generation(),
            used_space: (0..shards.size())
                .map(|i| shards.shard(i).used_space())
                .collect(),
            stale_space: (0..shards.size())
                .map(|i| shards.shard(i).stale_space())
                .collect(),
        }
    }

    /// Fsync every shard and persist each one's reopenable state.
    pub fn sync(&self) -> Result<(), StoreError> {
        let shards = self.shards_snapshot();
        for i in 0..shards.size() {
            shards.shard(i).sync().map_err(StoreError::SyncFailed)?;
        }
        Ok(())
    }

    /// Push shard data into OS buffers without the state rewrite.
    pub fn async_sync(&self) -> Result<(), StoreError> {
        let shards = self.shards_snapshot();
        for i in 0..shards.size() {
            shards
                .shard(i)
                .async_sync()
                .map_err(StoreError::SyncFailed)?;
        }
        Ok(())
    }

    /// Drain the write-ahead fifo, sync everything, and record a state
    /// file under `state_id` so [`open`](Store::open) can reinstate the
    /// store.
    ///
    /// Returns whether the store reached a fully-quiesced state.
    pub fn quiesce(&self, state_id: &str) -> bool {
        loop {
            match self.flush(None, false) {
                Ok(FlushStatus::DidNothing) => break,
                Ok(FlushStatus::Flushed) => continue,
                Ok(FlushStatus::DataFull) | Ok(FlushStatus::SearchFull) => {
                    if let Err(e) = self.do_mandatory_io() {
                        error!(error = %e, "mandatory io failed during quiesce");
                        return false;
                    }
                }
                Err(e) => {
                    error!(error = %e, "flush failed during quiesce");
                    return false;
                }
            }
        }

        if let Err(e) = self.sync() {
            error!(error = %e, "sync failed during quiesce");
            return false;
        }

        match self.dump_state(state_id) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "state dump failed during quiesce");
                false
            }
        }
    }

    fn dump_state(&self, state_id: &str) -> Result<(), StoreError> {
        let shards = self.shards_snapshot();
        let mut out = String::new();
        out.push_str(&format!("version {STATE_FILE_VERSION}\n"));
        out.push_str(&format!("state_id {state_id}\n"));
        for i in 0..shards.size() {
            let c = shards.coordinate(i);
            out.push_str(&format!(
                "shard {} {} {} {} {} {} {}\n",
                c.primary_mask,
                c.primary_hash,
                c.secondary_lower_mask,
                c.secondary_lower_hash,
                c.secondary_upper_mask,
                c.secondary_upper_hash,
                shards.offset(i),
            ));
        }

        // Rewrite atomically: the state file either names the previous
        // quiesce or this one, never a torn mix.
        let tmp_path = self.base.join(format!("{STATE_FILE_NAME}.tmp"));
        let final_path = self.base.join(STATE_FILE_NAME);
        fs::write(&tmp_path, out)?;
        fs::rename(&tmp_path, &final_path)?;
        info!(state_id, path = %final_path.display(), "store state dumped");
        Ok(())
    }

    /// Remove the store from the filesystem.
    ///
    /// Outstanding snapshots keep working off the unlinked files; no
    /// further operations should be issued against the store.
    pub fn destroy(&self) -> Result<(), StoreError> {
        let _guard = self.lock_mutate();
        let shards = self.shards_snapshot();
        let mut result = Ok(());

        {
            let mut pool = self.lock_spare();
            while let Some(path) = pool.queue.pop_front() {
                if let Err(e) = fs::remove_file(&path) {
                    result = Err(StoreError::DropFailed(e));
                }
            }
        }

        for i in 0..shards.size() {
            shards.shard(i).retire();
            if let Err(e) = drop_shard_files(&self.base, &shard_filename(shards.coordinate(i))) {
                result = Err(StoreError::DropFailed(e));
            }
        }

        let state_path = self.base.join(STATE_FILE_NAME);
        if state_path.exists() {
            if let Err(e) = fs::remove_file(&state_path) {
                result = Err(StoreError::DropFailed(e));
            }
        }

        if result.is_ok() {
            if let Err(e) = fs::remove_dir(&self.base) {
                result = Err(StoreError::DropFailed(e));
            }
        }
        result
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// The most balanced unmasked bit: smallest |ones - zeros|, lowest index
/// winning ties.
fn which_to_split(mask: u64, zeros: &[i64; 64], ones: &[i64; 64]) -> u32 {
    let mut position = 63u32;
    let mut best_diff = i64::MAX;
    for j in 0..64u32 {
        if mask & (1u64 << j) != 0 {
            continue;
        }
        let diff = (ones[j as usize] - zeros[j as usize]).abs();
        if diff < best_diff {
            position = j;
            best_diff = diff;
        }
    }
    position
}

/// The filename prefix for a shard at `coord` (16 hex digits per word).
fn shard_filename(coord: &Coordinate) -> String {
    format!(
        "{:016x}-{:016x}-{:016x}-{:016x}-{:016x}-{:016x}",
        coord.primary_mask,
        coord.primary_hash,
        coord.secondary_upper_mask,
        coord.secondary_upper_hash,
        coord.secondary_lower_mask,
        coord.secondary_lower_hash,
    )
}

/// Remove every file belonging to the shard prefix `name`.
fn drop_shard_files(base: &Path, name: &str) -> Result<(), io::Error> {
    let mut failed = None;

    let state = base.join(format!("{name}.state"));
    if state.exists() {
        if let Err(e) = fs::remove_file(&state) {
            failed = Some(e);
        }
    }
    for n in 0u64.. {
        let seg = base.join(format!("{name}.{n}"));
        if !seg.exists() {
            break;
        }
        if let Err(e) = fs::remove_file(&seg) {
            failed = Some(e);
            break;
        }
    }

    match failed {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Rename every file of shard prefix `from` over prefix `to`, removing
/// `to` leftovers past the renamed range.
fn rename_shard_files(base: &Path, from: &str, to: &str) -> Result<(), StoreError> {
    let from_state = base.join(format!("{from}.state"));
    if from_state.exists() {
        fs::rename(&from_state, base.join(format!("{to}.state")))?;
    }

    let mut n = 0u64;
    loop {
        let seg = base.join(format!("{from}.{n}"));
        if !seg.exists() {
            break;
        }
        fs::rename(&seg, base.join(format!("{to}.{n}")))?;
        n += 1;
    }

    // The old shard may have had more segments than its replacement.
    loop {
        let leftover = base.join(format!("{to}.{n}"));
        if !leftover.exists() {
            break;
        }
        fs::remove_file(&leftover)?;
        n += 1;
    }
    Ok(())
}

/// Parse the quiesce state file, verifying version and state id.
fn load_state(base: &Path, state_id: &str) -> Result<Vec<(Coordinate, u64)>, StoreError> {
    let path = base.join(STATE_FILE_NAME);
    let text = fs::read_to_string(&path)
        .map_err(|e| StoreError::State(format!("cannot read {}: {e}", path.display())))?;
    let mut lines = text.lines();

    let version_line = lines
        .next()
        .ok_or_else(|| StoreError::State("missing version line".into()))?;
    let version: u32 = version_line
        .strip_prefix("version ")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| StoreError::State("malformed version line".into()))?;
    if version != STATE_FILE_VERSION {
        return Err(StoreError::State(format!(
            "unsupported state version {version}"
        )));
    }

    let id_line = lines
        .next()
        .ok_or_else(|| StoreError::State("missing state_id line".into()))?;
    let recorded = id_line
        .strip_prefix("state_id ")
        .ok_or_else(|| StoreError::State("malformed state_id line".into()))?;
    if recorded != state_id {
        return Err(StoreError::State(format!(
            "state id mismatch: recorded `{recorded}`, requested `{state_id}`"
        )));
    }

    let mut entries = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let rest = line
            .strip_prefix("shard ")
            .ok_or_else(|| StoreError::State(format!("unexpected line `{line}`")))?;
        let words: Vec<u64> = rest
            .split(' ')
            .map(|w| w.parse::<u64>())
            .collect::<Result<_, _>>()
            .map_err(|_| StoreError::State(format!("bad integer in `{line}`")))?;
        if words.len() != 7 {
            return Err(StoreError::State(format!(
                "expected 7 fields in `{line}`, found {}",
                words.len()
            )));
        }
        entries.push((
            Coordinate::new(words[0], words[1], words[2], words[3], words[4], words[5]),
            words[6],
        ));
    }
    if entries.is_empty() {
        return Err(StoreError::State("no shard lines".into()));
    }
    Ok(entries)
}
