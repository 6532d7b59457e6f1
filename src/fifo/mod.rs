//! An append-only, iterable FIFO with cursors that pin their position.
//!
//! This is the in-RAM backbone of the container's write path: `put`/`del`
//! append entries here and return immediately; `flush` walks the queue and
//! applies entries to the persistent structures; `get` and rolling
//! snapshots iterate from the oldest retained entry to overlay unflushed
//! writes on top of on-disk state.
//!
//! # Semantics
//!
//! - **Append** is multi-producer: any thread may push.
//! - **Advance** is single-consumer: only the flush path (which holds the
//!   container's mutate lock) retires entries.
//! - **Cursors** ([`FifoCursor`]) iterate from the queue's oldest retained
//!   entry at creation time.  A cursor holds a reference to its node, so
//!   entries it has not yet visited are never reclaimed underneath it —
//!   retiring the queue head only unlinks nodes once the last cursor
//!   holding them drops.  A cursor created on an empty queue becomes
//!   valid once something is appended.
//!
//! # Implementation
//!
//! A singly-linked list of `Arc` nodes.  The list always ends in one
//! unfilled sentinel; `append` links a fresh sentinel behind it and then
//! fills it, so every node was the sentinel once and no placeholder ever
//! sits mid-chain.  Cursors clone the `Arc` of the node they sit on and
//! traverse `next` pointers outside the queue lock, which is what makes
//! reclamation automatic: dropping the queue's head reference frees
//! exactly the prefix no cursor can reach any more.

#[cfg(test)]
mod tests;

use std::sync::{Arc, Mutex, RwLock};

// ------------------------------------------------------------------------------------------------
// Node
// ------------------------------------------------------------------------------------------------

struct Node<T> {
    /// Payload; `None` while this node is still the tail sentinel.
    item: RwLock<Option<T>>,

    /// Next node; linked (once) *before* `item` is filled, so a filled
    /// node always has a successor.
    next: RwLock<Option<Arc<Node<T>>>>,
}

impl<T> Node<T> {
    fn sentinel() -> Arc<Self> {
        Arc::new(Self {
            item: RwLock::new(None),
            next: RwLock::new(None),
        })
    }

    fn is_filled(&self) -> bool {
        read(&self.item).is_some()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ------------------------------------------------------------------------------------------------
// IterableFifo
// ------------------------------------------------------------------------------------------------

/// Append-only FIFO whose cursors pin the entries they still have to read.
pub struct IterableFifo<T> {
    inner: Mutex<FifoInner<T>>,
}

struct FifoInner<T> {
    /// Oldest retained node (the sentinel itself when the queue is empty).
    head: Arc<Node<T>>,

    /// The one unfilled sentinel terminating the list.
    tail: Arc<Node<T>>,
}

impl<T> Default for IterableFifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IterableFifo<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        let sentinel = Node::sentinel();
        Self {
            inner: Mutex::new(FifoInner {
                head: Arc::clone(&sentinel),
                tail: sentinel,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FifoInner<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append one entry to the back of the queue.
    pub fn append(&self, item: T) {
        let new_sentinel = Node::sentinel();
        let mut inner = self.lock();
        // Link the successor first so any cursor that observes the filled
        // item can always step past it.
        *write(&inner.tail.next) = Some(Arc::clone(&new_sentinel));
        *write(&inner.tail.item) = Some(item);
        inner.tail = new_sentinel;
    }

    /// Append a batch of entries, preserving order.
    pub fn batch_append(&self, items: Vec<T>) {
        for item in items {
            self.append(item);
        }
    }

    /// A cursor positioned at the oldest retained entry.
    pub fn iterate(&self) -> FifoCursor<T> {
        let inner = self.lock();
        FifoCursor {
            node: Arc::clone(&inner.head),
        }
    }

    /// True when no retained entry remains.
    pub fn is_empty(&self) -> bool {
        let inner = self.lock();
        !inner.head.is_filled()
    }

    /// Apply `f` to the oldest retained entry, if any.
    pub fn with_oldest<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let inner = self.lock();
        let guard = read(&inner.head.item);
        guard.as_ref().map(f)
    }

    /// Retire the oldest retained entry.
    ///
    /// Entries already reached by live cursors stay readable through those
    /// cursors; the queue just stops handing them to new ones.
    pub fn remove_oldest(&self) {
        let mut inner = self.lock();
        if inner.head.is_filled() {
            let next = read(&inner.head.next).clone();
            if let Some(next) = next {
                inner.head = next;
            }
        }
    }

    /// Retire everything `cursor` has already consumed: the queue head
    /// moves to the cursor's position.
    pub fn advance_to(&self, cursor: &FifoCursor<T>) {
        let mut inner = self.lock();
        inner.head = Arc::clone(&cursor.node);
    }
}

// ------------------------------------------------------------------------------------------------
// FifoCursor
// ------------------------------------------------------------------------------------------------

/// A pinned read position into an [`IterableFifo`].
///
/// The cursor owns a reference to its current node; the queue cannot
/// reclaim that node or anything after it while the cursor lives.
pub struct FifoCursor<T> {
    node: Arc<Node<T>>,
}

impl<T> FifoCursor<T> {
    /// True while the cursor points at a filled entry.
    ///
    /// A cursor parked on the tail sentinel reports `false` now but may
    /// report `true` later, once an append fills that node.
    pub fn valid(&self) -> bool {
        self.node.is_filled()
    }

    /// Apply `f` to the entry under the cursor, if any.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = read(&self.node.item);
        guard.as_ref().map(f)
    }

    /// Step to the next entry (no-op while parked on the sentinel).
    pub fn next(&mut self) {
        if !self.node.is_filled() {
            return;
        }
        let next = read(&self.node.next).clone();
        if let Some(next) = next {
            self.node = next;
        }
    }
}

impl<T> Clone for FifoCursor<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
        }
    }
}
