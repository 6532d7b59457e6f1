//! RAM block heap backing the search tree.
//!
//! The tree addresses its 4 KiB blocks by dense u64 ids (the two high
//! bits of an id are reserved for the tree's type tags and never reach
//! the heap).  Blocks are shared with readers through `Arc`, so a block
//! stays readable for as long as any snapshot still traverses it, even
//! after its slot is recycled.
//!
//! Only blocks that were **never published** (allocated for a
//! copy-on-write round whose root CAS failed) are ever recycled; ids
//! reachable from any past root are permanent.  That rule is what makes
//! id reuse safe: no stale reader can hold a recycled id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Words (u64) per tree block.
pub const WORDS_PER_BLOCK: usize = 512;

/// A 4 KiB block of atomically-readable u64 words.
///
/// Writers mutate words only under the tree's striped lock (or before the
/// block is published); readers load without locks.  An entry's id word
/// is stored last with release ordering so a reader that observes the id
/// also observes the hashes.
pub struct TreeBlock {
    words: Box<[AtomicU64]>,
}

impl TreeBlock {
    fn new_empty() -> Self {
        let mut words = Vec::with_capacity(WORDS_PER_BLOCK);
        words.resize_with(WORDS_PER_BLOCK, || AtomicU64::new(u64::MAX));
        Self {
            words: words.into_boxed_slice(),
        }
    }

    /// Load word `i`.
    #[inline]
    pub fn load(&self, i: usize) -> u64 {
        self.words[i].load(Ordering::Acquire)
    }

    /// Store word `i`.
    #[inline]
    pub fn store(&self, i: usize, value: u64) {
        self.words[i].store(value, Ordering::Release);
    }

    /// Reset every word to the empty marker.
    pub fn fill_empty(&self) {
        for w in self.words.iter() {
            w.store(u64::MAX, Ordering::Release);
        }
    }

    /// Copy every word of `other` into `self`.
    pub fn copy_from(&self, other: &TreeBlock) {
        for i in 0..WORDS_PER_BLOCK {
            self.store(i, other.load(i));
        }
    }
}

impl std::fmt::Debug for TreeBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeBlock").finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Heap
// ------------------------------------------------------------------------------------------------

struct HeapInner {
    blocks: Vec<Option<Arc<TreeBlock>>>,
    free: Vec<u64>,
}

/// The block heap.
pub struct Heap {
    inner: Mutex<HeapInner>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// An empty heap.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HeapInner {
                blocks: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeapInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Allocate a block (all words set to the empty marker).
    pub fn create(&self) -> (u64, Arc<TreeBlock>) {
        let mut inner = self.lock();
        if let Some(id) = inner.free.pop() {
            let block = Arc::new(TreeBlock::new_empty());
            inner.blocks[id as usize] = Some(Arc::clone(&block));
            return (id, block);
        }
        let id = inner.blocks.len() as u64;
        let block = Arc::new(TreeBlock::new_empty());
        inner.blocks.push(Some(Arc::clone(&block)));
        (id, block)
    }

    /// Fetch a block by raw id (type bits already stripped).
    pub fn get(&self, id: u64) -> Option<Arc<TreeBlock>> {
        let inner = self.lock();
        inner.blocks.get(id as usize)?.clone()
    }

    /// Return a never-published block's slot to the free list.
    pub fn recycle(&self, id: u64) {
        let mut inner = self.lock();
        if let Some(slot) = inner.blocks.get_mut(id as usize) {
            *slot = None;
            inner.free.push(id);
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Heap")
            .field("blocks", &inner.blocks.len())
            .field("free", &inner.free.len())
            .finish()
    }
}

// ------------------------------------------------------------------------------------------------
// Recycler
// ------------------------------------------------------------------------------------------------

/// Tracks blocks allocated for one copy-on-write round.
///
/// If the round's root CAS fails, the recycler (on drop) returns every
/// block it created to the heap; [`dismiss`](Recycler::dismiss) keeps
/// them once the new root is published.
pub struct Recycler<'a> {
    heap: &'a Heap,
    created: Vec<u64>,
}

impl<'a> Recycler<'a> {
    /// A recycler for one attempt against `heap`.
    pub fn new(heap: &'a Heap) -> Self {
        Self {
            heap,
            created: Vec::new(),
        }
    }

    /// Allocate a block tracked by this recycler.
    pub fn create(&mut self) -> (u64, Arc<TreeBlock>) {
        let (id, block) = self.heap.create();
        self.created.push(id);
        (id, block)
    }

    /// The round succeeded: keep every allocated block.
    pub fn dismiss(&mut self) {
        self.created.clear();
    }
}

impl Drop for Recycler<'_> {
    fn drop(&mut self) {
        for id in self.created.drain(..) {
            self.heap.recycle(id);
        }
    }
}
