//! Copy-on-write search tree over `(log-id, hash-vector)` entries.
//!
//! The tree gives a shard its filtered scans: every record's per-attribute
//! hash vector is inserted under its log id, and
//! [`iterate`](SearchTree::iterate) streams the ids whose hashes agree
//! with a (possibly partial) constraint vector.
//!
//! # Shape
//!
//! All nodes are 4 KiB blocks of u64 words, addressed by a block id whose
//! two high bits carry the node type:
//!
//! - **internal** — 512 child block ids, indexed by a 9-bit digit drawn
//!   from the entry's hash vector (level ℓ consumes the `(ℓ / a)`-th
//!   9-bit group of attribute `ℓ % a`).
//! - **leaf** — an array of `(log_id, dead, hash[0..a])` entries; the
//!   all-ones word marks an empty slot.
//! - **list** — a leaf whose final word chains to a continuation block,
//!   used once every digit bit has been consumed and a full leaf can no
//!   longer expand.
//!
//! # Concurrency
//!
//! Readers walk whatever root they captured and never lock: published
//! blocks are immutable except for in-place entry appends (id word stored
//! last, release) and dead-flag stamps, both of which a snapshot filters
//! by id and horizon anyway.  Structural changes copy the path from root
//! to the touched node and publish with a single root CAS (the "zipper");
//! blocks built for a round that loses the race are recycled.  The log id
//! order gives update ids their monotonicity; one logical mutator drives
//! inserts and removes (the shard's flush path), so the CAS is wait-free
//! in practice.

pub mod heap;


use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::sync::StripedLock;
use heap::{Heap, Recycler, TreeBlock, WORDS_PER_BLOCK};

/// Tags the block id of a leaf node.
pub const MASK_LEAF: u64 = 1 << 63;

/// Tags the block id of a list-overflow node.
pub const MASK_LIST: u64 = 1 << 62;

/// Strips the type tag off a block id.
pub const MASK_BLOCK: u64 = (1 << 62) - 1;

const MASK_TYPE: u64 = MASK_LEAF | MASK_LIST;

/// The all-ones word: empty child pointer, empty entry slot, live
/// dead-flag.
const EMPTY: u64 = u64::MAX;

/// Hash bits consumed per tree level.
const DIGIT_BITS: u32 = 9;

/// Full 9-bit digit groups available in one 64-bit hash.
const DIGIT_GROUPS: u64 = 64 / DIGIT_BITS as u64;

/// Stripes guarding in-place block mutation.
const BLOCK_LOCK_STRIPES: usize = 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by search-tree operations.
#[derive(Debug, Error)]
pub enum SearchError {
    /// A block id led nowhere; the tree structure is inconsistent.
    #[error("search tree is corrupt: {0}")]
    Corrupt(String),
}

/// Node type decoded from a block id's tag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockType {
    Internal,
    Leaf,
    List,
}

fn block_type(block_id: u64) -> BlockType {
    if block_id & MASK_LEAF != 0 {
        BlockType::Leaf
    } else if block_id & MASK_LIST != 0 {
        BlockType::List
    } else {
        BlockType::Internal
    }
}

/// One step of the descent from the root, for the zipper to replay.
struct Frame {
    idx: usize,
}

// ------------------------------------------------------------------------------------------------
// SearchTree
// ------------------------------------------------------------------------------------------------

/// The copy-on-write search tree of one shard.
pub struct SearchTree {
    /// Value-attribute count; every entry carries this many hashes.
    attrs: usize,

    /// The published root block id (tagged).
    root: AtomicU64,

    heap: Heap,
    block_locks: StripedLock,
}

impl std::fmt::Debug for SearchTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchTree")
            .field("attrs", &self.attrs)
            .field("root", &self.root.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl SearchTree {
    /// An empty tree for entries of `attrs` value attributes.
    pub fn new(attrs: usize) -> Self {
        debug_assert!(attrs > 0);
        let heap = Heap::new();
        let (raw, _block) = heap.create();
        Self {
            attrs,
            root: AtomicU64::new(raw | MASK_LEAF),
            heap,
            block_locks: StripedLock::new(BLOCK_LOCK_STRIPES),
        }
    }

    /// Words one entry occupies.
    fn entry_words(&self) -> usize {
        2 + self.attrs
    }

    /// The digit selecting the child at `level`, or `None` once every
    /// hash bit has been consumed.
    fn digit(&self, hashes: &[u64], level: usize) -> Option<usize> {
        let attr = level % self.attrs;
        let group = (level / self.attrs) as u64;
        if group >= DIGIT_GROUPS {
            return None;
        }
        let shift = 64 - DIGIT_BITS as u64 * (group + 1);
        Some(((hashes[attr] >> shift) & ((1 << DIGIT_BITS) - 1)) as usize)
    }

    /// The currently published root (for snapshot capture).
    pub fn current_root(&self) -> u64 {
        self.root.load(Ordering::Acquire)
    }

    fn get_block(&self, block_id: u64) -> Result<Arc<TreeBlock>, SearchError> {
        self.heap
            .get(block_id & MASK_BLOCK)
            .ok_or_else(|| SearchError::Corrupt(format!("dangling block id {block_id:#x}")))
    }

    // --------------------------------------------------------------------------------------------
    // Insert
    // --------------------------------------------------------------------------------------------

    /// Insert `(log_id, hashes)`.
    pub fn insert(&self, log_id: u64, hashes: &[u64]) -> Result<(), SearchError> {
        debug_assert_eq!(hashes.len(), self.attrs);

        loop {
            // Descend to the leaf (or hole) the hashes select.
            let mut level = 0usize;
            let mut block_id = self.current_root();
            let mut frames: Vec<Frame> = Vec::new();
            let mut block = self.get_block(block_id)?;

            while block_type(block_id) == BlockType::Internal {
                let idx = self.digit(hashes, level).unwrap_or(0);
                frames.push(Frame { idx });
                level += 1;
                block_id = block.load(idx);
                if block_id == EMPTY {
                    break;
                }
                block = self.get_block(block_id)?;
            }

            let mut recycler = Recycler::new(&self.heap);

            if block_id == EMPTY {
                // Empty hole: a fresh leaf holding just the new entry.
                let (raw, new_block) = recycler.create();
                let new_id = raw | MASK_LEAF;
                self.store_entry(&new_block, 0, log_id, hashes);
                if self.zipper(&frames, &mut recycler, EMPTY, new_id) {
                    trace!(log_id, "inserted into fresh leaf");
                    return Ok(());
                }
                continue;
            }

            let _guard = self.block_locks.lock(block_id & MASK_BLOCK);
            let node_type = block_type(block_id);
            debug_assert!(node_type == BlockType::Leaf || node_type == BlockType::List);

            let epw = self.entry_words();
            let end = WORDS_PER_BLOCK - usize::from(node_type == BlockType::List);
            let mut dead_entries = 0usize;
            let mut offset = 0usize;
            let mut stored = false;
            while offset + epw <= end {
                if block.load(offset) == EMPTY {
                    self.store_entry(&block, offset, log_id, hashes);
                    stored = true;
                    break;
                }
                if block.load(offset + 1) != EMPTY {
                    dead_entries += 1;
                }
                offset += epw;
            }
            if stored {
                return Ok(());
            }

            if dead_entries > 0 {
                // Compact the live entries into a fresh block of the same
                // type, appending the new entry, and zipper it in.
                let (raw, new_block) = recycler.create();
                let new_id = raw | (block_id & MASK_TYPE);
                let mut write = 0usize;
                let mut read = 0usize;
                while read + epw <= end {
                    if block.load(read) != EMPTY && block.load(read + 1) == EMPTY {
                        self.copy_entry(&new_block, write, &block, read);
                        write += epw;
                    }
                    read += epw;
                }
                self.store_entry(&new_block, write, log_id, hashes);
                if node_type == BlockType::List {
                    new_block.store(WORDS_PER_BLOCK - 1, block.load(WORDS_PER_BLOCK - 1));
                }
                if self.zipper(&frames, &mut recycler, block_id, new_id) {
                    trace!(log_id, dead_entries, "compacted block and inserted");
                    return Ok(());
                }
                continue;
            }

            // Full of live entries: expand (or chain a list) and retry.
            self.expand(&frames, &mut recycler, block_id, &block)?;
        }
    }

    fn store_entry(&self, block: &TreeBlock, offset: usize, log_id: u64, hashes: &[u64]) {
        for (i, h) in hashes.iter().enumerate() {
            block.store(offset + 2 + i, *h);
        }
        block.store(offset + 1, EMPTY);
        // The id word is published last; a reader that sees it sees the
        // hashes too.
        block.store(offset, log_id);
    }

    fn copy_entry(&self, to: &TreeBlock, to_offset: usize, from: &TreeBlock, from_offset: usize) {
        for i in 0..self.attrs {
            to.store(to_offset + 2 + i, from.load(from_offset + 2 + i));
        }
        to.store(to_offset + 1, from.load(from_offset + 1));
        to.store(to_offset, from.load(from_offset));
    }

    /// Turn a full leaf into an internal node (redistributing its entries
    /// one level deeper) or chain a list block once digits are exhausted.
    fn expand(
        &self,
        frames: &[Frame],
        recycler: &mut Recycler<'_>,
        block_id: u64,
        block: &Arc<TreeBlock>,
    ) -> Result<(), SearchError> {
        let epw = self.entry_words();
        let (raw, new_block) = recycler.create();

        let exhausted = (frames.len() / self.attrs) as u64 >= DIGIT_GROUPS;
        let new_id = if exhausted {
            // No digit bits remain: the fresh (empty) block fronts the
            // full one as a list, chaining through the final word.
            let new_id = raw | MASK_LIST;
            new_block.store(WORDS_PER_BLOCK - 1, block_id);
            trace!(block_id, new_id, "chaining list block");
            new_id
        } else {
            // Redistribute every entry by its digit one level down.
            let level = frames.len();
            let end = WORDS_PER_BLOCK - usize::from(block_type(block_id) == BlockType::List);
            let mut child_cursor: Vec<usize> = vec![0; WORDS_PER_BLOCK];
            let mut children: Vec<Option<Arc<TreeBlock>>> = vec![None; WORDS_PER_BLOCK];

            let mut offset = 0usize;
            while offset + epw <= end {
                if block.load(offset) == EMPTY {
                    offset += epw;
                    continue;
                }
                let mut entry_hashes = Vec::with_capacity(self.attrs);
                for i in 0..self.attrs {
                    entry_hashes.push(block.load(offset + 2 + i));
                }
                let idx = self.digit(&entry_hashes, level).unwrap_or(0);

                if children[idx].is_none() {
                    let (child_raw, child_block) = recycler.create();
                    new_block.store(idx, child_raw | MASK_LEAF);
                    children[idx] = Some(child_block);
                }
                if let Some(child) = &children[idx] {
                    self.copy_entry(child, child_cursor[idx], block, offset);
                    child_cursor[idx] += epw;
                }
                offset += epw;
            }
            trace!(block_id, new_id = raw, "expanded leaf to internal node");
            raw
        };

        // Publish; whether or not the CAS wins, the outer insert loop
        // retries from the top (with everything here recycled on a loss).
        let _ = self.zipper(frames, recycler, block_id, new_id);
        Ok(())
    }

    /// Replace `old_block_id` with `new_block_id` by copying the path
    /// from the root and swinging the root pointer.
    ///
    /// Returns whether the new root was published.
    fn zipper(
        &self,
        frames: &[Frame],
        recycler: &mut Recycler<'_>,
        old_block_id: u64,
        new_block_id: u64,
    ) -> bool {
        if frames.is_empty() {
            let swapped = self
                .root
                .compare_exchange(
                    old_block_id,
                    new_block_id,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
            if swapped {
                recycler.dismiss();
            }
            return swapped;
        }

        // Fresh internal blocks mirroring the recorded path.
        let mut path: Vec<(u64, Arc<TreeBlock>)> = Vec::with_capacity(frames.len());
        for _ in 0..frames.len() {
            path.push(recycler.create());
        }

        loop {
            let old_root = self.current_root();
            let mut block_id = old_root;

            for (level, frame) in frames.iter().enumerate() {
                if block_id == EMPTY || block_type(block_id) != BlockType::Internal {
                    return false;
                }
                let block = match self.heap.get(block_id & MASK_BLOCK) {
                    Some(b) => b,
                    None => return false,
                };
                path[level].1.copy_from(&block);
                block_id = block.load(frame.idx);
            }

            // The descent must still land on the block being replaced.
            if block_id != old_block_id {
                return false;
            }

            for i in 0..frames.len() - 1 {
                path[i].1.store(frames[i].idx, path[i + 1].0);
            }
            if let (Some(last), Some(frame)) = (path.last(), frames.last()) {
                last.1.store(frame.idx, new_block_id);
            }

            let new_root = path[0].0; // internal: no tag bits
            if self
                .root
                .compare_exchange(old_root, new_root, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                recycler.dismiss();
                return true;
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Remove
    // --------------------------------------------------------------------------------------------

    /// Stamp the entry created at `create_id` dead as of `remove_id`.
    ///
    /// Returns whether a live entry was found; a remove with no matching
    /// insert is a no-op.
    pub fn remove(&self, create_id: u64, hashes: &[u64], remove_id: u64) -> Result<bool, SearchError> {
        debug_assert_eq!(hashes.len(), self.attrs);

        let mut level = 0usize;
        let mut block_id = self.current_root();
        let mut block = self.get_block(block_id)?;

        while block_type(block_id) == BlockType::Internal {
            let idx = self.digit(hashes, level).unwrap_or(0);
            level += 1;
            block_id = block.load(idx);
            if block_id == EMPTY {
                return Ok(false);
            }
            block = self.get_block(block_id)?;
        }

        // Scan the node and any list continuations.
        loop {
            let _guard = self.block_locks.lock(block_id & MASK_BLOCK);
            let node_type = block_type(block_id);
            let epw = self.entry_words();
            let end = WORDS_PER_BLOCK - usize::from(node_type == BlockType::List);

            let mut offset = 0usize;
            while offset + epw <= end {
                let id = block.load(offset);
                if id == EMPTY {
                    break;
                }
                if id == create_id && block.load(offset + 1) == EMPTY {
                    block.store(offset + 1, remove_id);
                    trace!(create_id, remove_id, "entry stamped dead");
                    return Ok(true);
                }
                offset += epw;
            }

            if node_type != BlockType::List {
                return Ok(false);
            }
            let next = block.load(WORDS_PER_BLOCK - 1);
            if next == EMPTY {
                return Ok(false);
            }
            drop(_guard);
            block_id = next;
            block = self.get_block(block_id)?;
        }
    }

    // --------------------------------------------------------------------------------------------
    // Iterate
    // --------------------------------------------------------------------------------------------

    /// Stream every entry id under `root` that satisfies `constraints`
    /// and is live at `horizon`.
    ///
    /// `constraints[i] == Some(h)` requires attribute `i`'s hash to equal
    /// `h`; `None` leaves it unconstrained.  An entry is live when its id
    /// precedes the horizon and its dead stamp (if any) does not.
    pub fn iterate(
        &self,
        root: u64,
        horizon: u64,
        constraints: &[Option<u64>],
        out: &mut Vec<u64>,
    ) -> Result<(), SearchError> {
        debug_assert_eq!(constraints.len(), self.attrs);
        self.walk(root, 0, horizon, constraints, out)
    }

    fn walk(
        &self,
        block_id: u64,
        level: usize,
        horizon: u64,
        constraints: &[Option<u64>],
        out: &mut Vec<u64>,
    ) -> Result<(), SearchError> {
        if block_id == EMPTY {
            return Ok(());
        }
        let block = self.get_block(block_id)?;

        match block_type(block_id) {
            BlockType::Internal => {
                let attr = level % self.attrs;
                if let Some(h) = constraints[attr] {
                    // This level's digit is pinned by the constraint.
                    if let Some(idx) = self.digit_of(h, level) {
                        return self.walk(block.load(idx), level + 1, horizon, constraints, out);
                    }
                }
                for idx in 0..WORDS_PER_BLOCK {
                    let child = block.load(idx);
                    if child != EMPTY {
                        self.walk(child, level + 1, horizon, constraints, out)?;
                    }
                }
                Ok(())
            }
            BlockType::Leaf | BlockType::List => {
                let mut id = block_id;
                let mut node = block;
                loop {
                    let node_type = block_type(id);
                    let epw = self.entry_words();
                    let end = WORDS_PER_BLOCK - usize::from(node_type == BlockType::List);
                    let mut offset = 0usize;
                    while offset + epw <= end {
                        let entry_id = node.load(offset);
                        if entry_id == EMPTY {
                            break;
                        }
                        self.emit(&node, offset, entry_id, horizon, constraints, out);
                        offset += epw;
                    }
                    if node_type != BlockType::List {
                        return Ok(());
                    }
                    let next = node.load(WORDS_PER_BLOCK - 1);
                    if next == EMPTY {
                        return Ok(());
                    }
                    id = next;
                    node = self.get_block(id)?;
                }
            }
        }
    }

    fn emit(
        &self,
        node: &TreeBlock,
        offset: usize,
        entry_id: u64,
        horizon: u64,
        constraints: &[Option<u64>],
        out: &mut Vec<u64>,
    ) {
        if entry_id >= horizon {
            return;
        }
        let dead = node.load(offset + 1);
        if dead != EMPTY && dead < horizon {
            return;
        }
        for (i, constraint) in constraints.iter().enumerate() {
            if let Some(h) = constraint {
                if node.load(offset + 2 + i) != *h {
                    return;
                }
            }
        }
        out.push(entry_id);
    }

    /// Digit of a single attribute hash at `level` (which must belong to
    /// that attribute).
    fn digit_of(&self, hash: u64, level: usize) -> Option<usize> {
        let group = (level / self.attrs) as u64;
        if group >= DIGIT_GROUPS {
            return None;
        }
        let shift = 64 - DIGIT_BITS as u64 * (group + 1);
        Some(((hash >> shift) & ((1 << DIGIT_BITS) - 1)) as usize)
    }
}
