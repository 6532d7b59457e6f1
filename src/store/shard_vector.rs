//! The generation-stamped set of live shards.
//!
//! The vector itself is immutable: replacing a shard (after a clean) or
//! fanning it out into four successors (after a split) builds a new
//! vector with the generation bumped.  Readers clone the `Arc` under a
//! short lock and keep using their copy; only the per-shard offsets
//! mutate in place, and those are single words.
//!
//! Offsets are the shards' id horizons.  They only ever grow, and the
//! offset-update intentions fifo (see the store) patches the window
//! between a flush advancing them and a snapshot reading them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::region::Coordinate;
use crate::shard::Shard;

/// An immutable, generation-stamped list of `(coordinate, shard)` pairs
/// with mutable offset words.
pub struct ShardVector {
    generation: u64,
    shards: Vec<(Coordinate, Arc<Shard>)>,
    offsets: Vec<AtomicU64>,
}

impl std::fmt::Debug for ShardVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardVector")
            .field("generation", &self.generation)
            .field("size", &self.shards.len())
            .finish_non_exhaustive()
    }
}

impl ShardVector {
    /// A first-generation vector holding one shard.
    pub fn new(coord: Coordinate, shard: Arc<Shard>) -> Self {
        let offset = shard.horizon();
        Self {
            generation: 1,
            shards: vec![(coord, shard)],
            offsets: vec![AtomicU64::new(offset)],
        }
    }

    /// Rebuild a vector from reopened shards (quiesce reload).
    pub fn from_parts(generation: u64, shards: Vec<(Coordinate, Arc<Shard>, u64)>) -> Self {
        let mut pairs = Vec::with_capacity(shards.len());
        let mut offsets = Vec::with_capacity(shards.len());
        for (coord, shard, offset) in shards {
            pairs.push((coord, shard));
            offsets.push(AtomicU64::new(offset));
        }
        Self {
            generation,
            shards: pairs,
            offsets,
        }
    }

    /// Number of shards.
    pub fn size(&self) -> usize {
        self.shards.len()
    }

    /// The vector's generation; bumped by every replace.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Coordinate of shard `i`.
    pub fn coordinate(&self, i: usize) -> &Coordinate {
        &self.shards[i].0
    }

    /// Shard `i`.
    pub fn shard(&self, i: usize) -> &Arc<Shard> {
        &self.shards[i].1
    }

    /// Offset horizon of shard `i`.
    pub fn offset(&self, i: usize) -> u64 {
        self.offsets[i].load(Ordering::Acquire)
    }

    /// Advance shard `i`'s offset horizon (never moves backwards).
    pub fn set_offset(&self, i: usize, offset: u64) {
        self.offsets[i].fetch_max(offset, Ordering::AcqRel);
    }

    /// A new vector with shard `i` swapped for `shard` (clean).
    pub fn replace(&self, i: usize, coord: Coordinate, shard: Arc<Shard>) -> Arc<ShardVector> {
        let mut shards = self.shards.clone();
        let mut offsets: Vec<AtomicU64> = self
            .offsets
            .iter()
            .map(|o| AtomicU64::new(o.load(Ordering::Acquire)))
            .collect();
        offsets[i] = AtomicU64::new(shard.horizon());
        shards[i] = (coord, shard);
        Arc::new(Self {
            generation: self.generation + 1,
            shards,
            offsets,
        })
    }

    /// A new vector with shard `i` swapped for four successors (split).
    ///
    /// Successor order matters: the callers place the upper-secondary
    /// shards first so that records with no searchable attribute are
    /// found by the lower-half lookup path.
    pub fn replace_four(
        &self,
        i: usize,
        successors: [(Coordinate, Arc<Shard>); 4],
    ) -> Arc<ShardVector> {
        let mut shards = Vec::with_capacity(self.shards.len() + 3);
        let mut offsets = Vec::with_capacity(self.shards.len() + 3);
        for (j, pair) in self.shards.iter().enumerate() {
            if j == i {
                for (coord, shard) in &successors {
                    offsets.push(AtomicU64::new(shard.horizon()));
                    shards.push((*coord, Arc::clone(shard)));
                }
            } else {
                offsets.push(AtomicU64::new(self.offsets[j].load(Ordering::Acquire)));
                shards.push(pair.clone());
            }
        }
        Arc::new(Self {
            generation: self.generation + 1,
            shards,
            offsets,
        })
    }
}
