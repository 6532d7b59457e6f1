//! Point-in-time view of one shard.
//!
//! A [`ShardSnapshot`] is just two captured words — the search-tree root
//! and the offset horizon — plus a handle on the shard.  Entries created
//! at or past the horizon are invisible; entries tombstoned at or past it
//! are still visible, and the snapshot resolves their bytes through the
//! log's removed-tolerant read path.  Nothing the shard does after the
//! capture changes what the snapshot yields.

use std::sync::Arc;

use super::{Record, Shard, ShardError};

/// An immutable view of one shard at a point in time.
#[derive(Clone)]
pub struct ShardSnapshot {
    shard: Arc<Shard>,
    root: u64,
    horizon: u64,
}

impl std::fmt::Debug for ShardSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardSnapshot")
            .field("root", &self.root)
            .field("horizon", &self.horizon)
            .finish_non_exhaustive()
    }
}

impl ShardSnapshot {
    /// Capture `shard` at the given offset horizon.
    pub fn capture(shard: Arc<Shard>, horizon: u64) -> Self {
        Self {
            root: shard.tree_root(),
            shard,
            horizon,
        }
    }

    /// The shard this snapshot observes.
    pub fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }

    /// The captured offset horizon.
    pub fn horizon(&self) -> u64 {
        self.horizon
    }

    /// Resolve every visible record matching the per-attribute hash
    /// constraints, in id (insertion) order.
    pub fn records(&self, constraints: &[Option<u64>]) -> Result<Vec<Record>, ShardError> {
        let mut ids = Vec::new();
        self.shard
            .tree_iterate(self.root, self.horizon, constraints, &mut ids)?;
        ids.sort_unstable();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            // Removals after the horizon must not hide the record; the
            // log read below tolerates flipped entry types.
            let Some(record) = self.shard.resolve_any(id)? else {
                continue;
            };
            out.push(record);
        }
        Ok(out)
    }
}
