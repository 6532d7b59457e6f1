//! # TesseraDB
//!
//! An embeddable, sharded key-value storage engine with secondary-index
//! search.  Designed as the single-node disk layer of a distributed
//! store: it owns durability, per-key linearizability, snapshot
//! isolation, and space reclamation for one key-space.
//!
//! ## Architecture
//!
//! ```text
//! put/del(key, value, version)
//!         │
//!         ▼
//! ┌─────────────────────────────────────────────────────┐
//! │                      Store                          │
//! │   write-ahead fifo (RAM) ── flush ──► shards        │
//! │                                                     │
//! │   ┌───────────── one Shard per region ───────────┐  │
//! │   │  append-only log   (segments, record ids)    │  │
//! │   │  cuckoo index      (fingerprint → id)        │  │
//! │   │  search tree       (id → attribute hashes)   │  │
//! │   └──────────────────────────────────────────────┘  │
//! │                                                     │
//! │   split / clean / preallocate / quiesce             │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`store`] | Shard container — get, put, del, search, flush, split, quiesce |
//! | [`shard`] | One hash region: log + cuckoo index + search tree |
//! | [`log`] | Durable append-only segmented log with 48-bit record ids |
//! | [`cuckoo`] | Concurrent cuckoo key index with median splits |
//! | [`search`] | Copy-on-write search trie over attribute hashes |
//! | [`region`] | Region coordinates and the hashing seam |
//! | [`fifo`] | Iterable FIFO with pinned cursors (the RAM WAL) |
//! | [`encoding`] | Deterministic big-endian codec for on-disk bytes |
//! | [`sync`] | Sequence barriers and striped locks |
//!
//! ## Key properties
//!
//! - **Per-key linearizability** — writes buffer in a RAM fifo and reads
//!   overlay it, so a put or del is visible the moment it returns.
//! - **Crash-consistent log** — record bytes live in an append-only
//!   segmented log; a crash can lose an unsynced suffix but never
//!   corrupts the synced prefix.
//! - **Snapshot isolation** — snapshots capture per-shard tree roots and
//!   id horizons; later writes, removals, even shard splits do not
//!   change what a snapshot yields.
//! - **Self-managed space** — full shards split four ways along their
//!   most balanced hash bits; stale shards are rewritten in place.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tesseradb::{MaskHasher, SearchTerms, Store};
//!
//! // Tuples of (key, city, state): arity 3, two searchable attributes.
//! let hasher = Arc::new(MaskHasher::new(2));
//! let store = Store::create("/tmp/my_store", hasher, 3).unwrap();
//!
//! store
//!     .put(b"alice", vec![b"ithaca".to_vec(), b"ny".to_vec()], 1)
//!     .unwrap();
//! assert_eq!(
//!     store.get(b"alice").unwrap(),
//!     Some((vec![b"ithaca".to_vec(), b"ny".to_vec()], 1))
//! );
//!
//! // Make it durable, then search by attribute.
//! store.flush(None, false).unwrap();
//! let in_ny = store
//!     .search(SearchTerms::new(2).equals(1, b"ny".to_vec()))
//!     .unwrap();
//! for record in in_ny {
//!     let record = record.unwrap();
//!     println!("{:?}", record.key);
//! }
//!
//! // Freeze to disk with a caller-chosen state id.
//! assert!(store.quiesce("backup-2024-01"));
//! ```

pub mod cuckoo;
pub mod encoding;
pub mod fifo;
pub mod log;
pub mod region;
pub mod search;
pub mod shard;
pub mod store;
pub mod sync;

pub use region::{Coordinate, MaskHasher, RegionHasher, SearchTerms};
pub use shard::Record;
pub use store::snapshot::{RollingItem, RollingSnapshot, Snapshot};
pub use store::{FlushStatus, Store, StoreError, StoreStats};
