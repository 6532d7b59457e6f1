#![cfg(test)]

use std::sync::Arc;

use crate::region::{MaskHasher, RegionHasher};
use crate::shard::Shard;
use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

pub fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::DEBUG)
        .try_init();
}

pub fn hasher(attrs: usize) -> Arc<MaskHasher> {
    Arc::new(MaskHasher::new(attrs))
}

/// A fresh shard covering the whole key space.
pub fn fresh_shard(tmp: &TempDir, attrs: usize) -> Shard {
    Shard::create(
        tmp.path().join("shard"),
        crate::region::Coordinate::everything(),
        attrs,
        hasher(attrs),
    )
    .unwrap()
}

/// Route a put through the hasher the way the container's flush does.
pub fn put(shard: &Shard, key: &[u8], value: &[Vec<u8>], version: u64) -> u64 {
    let h = hasher(shard.attrs());
    let (coord, hashes) = h.hash_record(key, value);
    shard.put(&coord, &hashes, key, value, version).unwrap()
}

pub fn get(shard: &Shard, key: &[u8]) -> Option<(Vec<Vec<u8>>, u64)> {
    let h = hasher(shard.attrs());
    shard.get(h.hash_key(key).primary_hash, key).unwrap()
}

pub fn del(shard: &Shard, key: &[u8]) -> Option<u64> {
    let h = hasher(shard.attrs());
    shard.del(h.hash_key(key).primary_hash, key).unwrap()
}
