//! Low-level synchronization primitives shared across the engine.
//!
//! Two primitives live here:
//!
//! - [`SequenceBarrier`] — a monotonically advancing ticket counter used by
//!   the append-only log to serialize the two phases of an append (memory
//!   visibility of framing, then disk visibility of the written blocks)
//!   without holding a lock across I/O.
//! - [`StripedLock`] — a fixed array of mutexes indexed by a 64-bit key,
//!   used wherever per-object locking would be too fine (one mutex per
//!   cuckoo set, per search-tree block) and a global lock too coarse.
//!
//! Both are deliberately tiny: they wrap the exact atomic protocol the
//! engine depends on behind a typed API so the ordering rules live in one
//! place rather than being scattered through the append path.

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crossbeam::utils::Backoff;

// ------------------------------------------------------------------------------------------------
// SequenceBarrier
// ------------------------------------------------------------------------------------------------

/// A monotonically advancing sequence counter with a spin-wait contract.
///
/// Threads holding ticket `t` call [`wait`](Self::wait)`(t)` to block until
/// every ticket below `t` has [`arrive`](Self::arrive)d, perform their
/// serialized work, then call `arrive` to release ticket `t + 1`.
///
/// The counter only ever moves forward.  Waiters spin with exponential
/// backoff; there is no parking, because the critical sections the barrier
/// guards are short (a handful of `pwrite`s at most).
#[derive(Debug)]
pub struct SequenceBarrier {
    seq: AtomicU64,
}

impl SequenceBarrier {
    /// Create a barrier whose next admitted ticket is `start`.
    pub fn new(start: u64) -> Self {
        Self {
            seq: AtomicU64::new(start),
        }
    }

    /// Spin until the barrier has admitted ticket `ticket`.
    ///
    /// Returns immediately if the barrier is already at or past `ticket`.
    pub fn wait(&self, ticket: u64) {
        let backoff = Backoff::new();
        while self.seq.load(Ordering::Acquire) < ticket {
            backoff.snooze();
        }
    }

    /// Release the current ticket, admitting the next one.
    pub fn arrive(&self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
    }

    /// Advance the barrier by `n` tickets at once.
    ///
    /// Used by operations that consume a ticket without doing any work at
    /// it (a `remove` consumes an id but writes no blocks).
    pub fn arrive_many(&self, n: u64) {
        self.seq.fetch_add(n, Ordering::AcqRel);
    }

    /// Reset the barrier to admit ticket `start` next.
    ///
    /// Only valid while no thread is waiting; the log calls this under its
    /// offset lock during open.
    pub fn reset(&self, start: u64) {
        self.seq.store(start, Ordering::Release);
    }

    /// The next ticket the barrier will admit.
    pub fn current(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }
}

// ------------------------------------------------------------------------------------------------
// StripedLock
// ------------------------------------------------------------------------------------------------

/// A fixed-size array of mutexes indexed by a 64-bit key.
///
/// Two keys that hash to the same stripe contend; distinct stripes never
/// do.  The stripe count is fixed at construction and should be a power
/// of two well above the expected concurrency level.
#[derive(Debug)]
pub struct StripedLock {
    stripes: Vec<Mutex<()>>,
}

impl StripedLock {
    /// Create a lock with `stripes` independent mutexes.
    pub fn new(stripes: usize) -> Self {
        debug_assert!(stripes > 0);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Lock the stripe that `key` maps to.
    ///
    /// A poisoned stripe is recovered rather than propagated: the data the
    /// stripes guard carries its own consistency rules and a panicked
    /// holder cannot leave it half-written in a way later holders would
    /// misread.
    pub fn lock(&self, key: u64) -> MutexGuard<'_, ()> {
        let idx = (key % self.stripes.len() as u64) as usize;
        match self.stripes[idx].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of stripes.
    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    /// Always false; present for API completeness.
    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }
}
