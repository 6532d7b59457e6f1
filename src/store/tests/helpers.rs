#![cfg(test)]

use std::sync::Arc;

use crate::region::MaskHasher;
use crate::store::Store;
use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

pub fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::DEBUG)
        .try_init();
}

/// A fresh store with `arity - 1` value attributes.
pub fn fresh_store(tmp: &TempDir, arity: u16) -> Store {
    Store::create(
        tmp.path().join("store"),
        Arc::new(MaskHasher::new(arity.saturating_sub(1) as usize)),
        arity,
    )
    .unwrap()
}

/// Put, panicking on schema errors.
pub fn put(store: &Store, key: &[u8], value: &[&[u8]], version: u64) {
    store
        .put(key, value.iter().map(|v| v.to_vec()).collect(), version)
        .unwrap();
}

pub fn get(store: &Store, key: &[u8]) -> Option<(Vec<Vec<u8>>, u64)> {
    store.get(key).unwrap()
}
