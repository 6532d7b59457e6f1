//! The fixed-shape two-way set-associative cuckoo table.
//!
//! Two sub-tables of 2^16 sets, five slots per set, three u32 words per
//! slot (one 64-byte cache line per set with one pad word).  A slot packs
//! a 64-bit key and a 48-bit value so that the full key is reconstructible
//! from the set index plus the slot words:
//!
//! ```text
//! word0 = key[63:32]
//! word1 = key-fragment | value[47:32]     (fragment differs per sub-table)
//! word2 = value[31:0]
//! ```
//!
//! Sub-table 1 addresses sets by `key & 0xFFFF` and keeps `key[31:16]` in
//! word1's upper half; sub-table 2 addresses by `(key >> 16) & 0xFFFF` and
//! keeps `key[15:0]` there.  Between the set index and the slot words,
//! all 64 key bits are recoverable in either sub-table.
//!
//! Cells are plain atomics: writers mutate under the enclosing index's
//! striped lock, readers scan without locks and tolerate mid-eviction
//! states by reconstructing the key and re-checking it against the query.

use std::sync::atomic::{AtomicU32, Ordering};

/// Slots per set (one cache line).
pub const ENTRIES_PER_SET: usize = 5;

/// Displacement rounds before the table reports itself full.
pub const CUCKOO_ROUNDS_BEFORE_FULL: usize = 16;

/// Sets per sub-table.
pub const SETS_PER_SUBTABLE: usize = 1 << 16;

/// A value of all ones (48 bits) marks a tombstoned cell: the key lingers
/// but the mapping is dead and the slot is reusable.
pub const TOMBSTONE_VALUE: u64 = (1 << 48) - 1;

const WORDS_PER_SET: usize = 16;
const WORDS_PER_SLOT: usize = 3;
const TOTAL_WORDS: usize = 2 * SETS_PER_SUBTABLE * WORDS_PER_SET;

/// A `(key, value)` pair displaced out of a full table.
///
/// The enclosing index stashes it and triggers a split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Displaced {
    /// The displaced fingerprint.
    pub key: u64,

    /// The displaced log id.
    pub value: u64,
}

/// One fixed-size cuckoo table.
pub struct CuckooTable {
    cells: Box<[AtomicU32]>,
}

impl std::fmt::Debug for CuckooTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CuckooTable").finish_non_exhaustive()
    }
}

impl Default for CuckooTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CuckooTable {
    /// An empty table (all cells zero).
    pub fn new() -> Self {
        let mut cells = Vec::with_capacity(TOTAL_WORDS);
        cells.resize_with(TOTAL_WORDS, || AtomicU32::new(0));
        Self {
            cells: cells.into_boxed_slice(),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Slot packing
    // --------------------------------------------------------------------------------------------

    fn entry1(key: u64, value: u64) -> [u32; 3] {
        [
            ((key >> 32) & 0xFFFF_FFFF) as u32,
            ((key & 0xFFFF_0000) | ((value >> 32) & 0xFFFF)) as u32,
            (value & 0xFFFF_FFFF) as u32,
        ]
    }

    fn entry2(key: u64, value: u64) -> [u32; 3] {
        [
            ((key >> 32) & 0xFFFF_FFFF) as u32,
            (((key & 0xFFFF) << 16) | ((value >> 32) & 0xFFFF)) as u32,
            (value & 0xFFFF_FFFF) as u32,
        ]
    }

    fn index1(key: u64) -> usize {
        (key & 0xFFFF) as usize
    }

    fn index2(key: u64) -> usize {
        ((key >> 16) & 0xFFFF) as usize
    }

    fn key1(idx: usize, entry: &[u32; 3]) -> u64 {
        ((entry[0] as u64) << 32) | (entry[1] as u64 & 0xFFFF_0000) | idx as u64
    }

    fn key2(idx: usize, entry: &[u32; 3]) -> u64 {
        ((entry[0] as u64) << 32)
            | ((idx as u64) << 16)
            | ((entry[1] as u64 & 0xFFFF_0000) >> 16)
    }

    fn value(entry: &[u32; 3]) -> u64 {
        ((entry[1] as u64 & 0xFFFF) << 32) | entry[2] as u64
    }

    fn is_zero(entry: &[u32; 3]) -> bool {
        entry[0] == 0 && entry[1] == 0 && entry[2] == 0
    }

    // --------------------------------------------------------------------------------------------
    // Cell access
    // --------------------------------------------------------------------------------------------

    fn set_base(&self, subtable: usize, idx: usize) -> usize {
        debug_assert!(subtable == 1 || subtable == 2);
        let offset = if subtable == 1 { idx } else { SETS_PER_SUBTABLE + idx };
        WORDS_PER_SET * offset
    }

    fn load_slot(&self, base: usize, slot: usize) -> [u32; 3] {
        let w = base + slot * WORDS_PER_SLOT;
        [
            self.cells[w].load(Ordering::Acquire),
            self.cells[w + 1].load(Ordering::Acquire),
            self.cells[w + 2].load(Ordering::Acquire),
        ]
    }

    fn store_slot(&self, base: usize, slot: usize, entry: &[u32; 3]) {
        let w = base + slot * WORDS_PER_SLOT;
        self.cells[w].store(entry[0], Ordering::Release);
        self.cells[w + 1].store(entry[1], Ordering::Release);
        self.cells[w + 2].store(entry[2], Ordering::Release);
    }

    // --------------------------------------------------------------------------------------------
    // Operations
    // --------------------------------------------------------------------------------------------

    /// Insert `(key, new_value)`, replacing an existing `(key, old_value)`
    /// slot if present (pass `old_value = 0` for a fresh insert).
    ///
    /// Probes exact match, then key-matching tombstone, then empty space
    /// in both candidate sets before resorting to bounded eviction.  When
    /// eviction exhausts its budget the final displaced pair is returned
    /// as `Err` for the caller to stash and split over.
    pub fn insert(&self, key: u64, old_value: u64, new_value: u64) -> Result<(), Displaced> {
        let mut empty: Option<(usize, usize, usize)> = None; // (subtable, idx, slot)
        let mut tombstone: Option<(usize, usize, usize)> = None;

        for subtable in [1usize, 2] {
            let idx = if subtable == 1 { Self::index1(key) } else { Self::index2(key) };
            let base = self.set_base(subtable, idx);
            let expected = if subtable == 1 {
                Self::entry1(key, old_value)
            } else {
                Self::entry2(key, old_value)
            };
            let dead = if subtable == 1 {
                Self::entry1(key, TOMBSTONE_VALUE)
            } else {
                Self::entry2(key, TOMBSTONE_VALUE)
            };

            for slot in 0..ENTRIES_PER_SET {
                let current = self.load_slot(base, slot);
                if current == expected {
                    let fresh = if subtable == 1 {
                        Self::entry1(key, new_value)
                    } else {
                        Self::entry2(key, new_value)
                    };
                    self.store_slot(base, slot, &fresh);
                    return Ok(());
                }
                if current == dead && tombstone.is_none() {
                    tombstone = Some((subtable, idx, slot));
                }
                if Self::is_zero(&current) {
                    if empty.is_none() {
                        empty = Some((subtable, idx, slot));
                    }
                    break; // sets fill densely; nothing lives past a hole
                }
            }
        }

        if let Some((subtable, idx, slot)) = tombstone.or(empty) {
            let fresh = if subtable == 1 {
                Self::entry1(key, new_value)
            } else {
                Self::entry2(key, new_value)
            };
            self.store_slot(self.set_base(subtable, idx), slot, &fresh);
            return Ok(());
        }

        // Both candidate sets are full of live strangers: evict.
        let mut subtable = 1usize;
        let mut cuckoo_key = key;
        let mut cuckoo_value = new_value;

        for _ in 0..CUCKOO_ROUNDS_BEFORE_FULL {
            let idx = if subtable == 1 {
                Self::index1(cuckoo_key)
            } else {
                Self::index2(cuckoo_key)
            };
            let base = self.set_base(subtable, idx);
            let mut entry = if subtable == 1 {
                Self::entry1(cuckoo_key, cuckoo_value)
            } else {
                Self::entry2(cuckoo_key, cuckoo_value)
            };

            // Shift the incoming entry through the whole set; whatever
            // falls off the end migrates to its alternate set.
            for slot in 0..ENTRIES_PER_SET {
                let displaced = self.load_slot(base, slot);
                self.store_slot(base, slot, &entry);
                entry = displaced;
            }

            if Self::is_zero(&entry) {
                return Ok(());
            }

            cuckoo_key = if subtable == 1 {
                Self::key1(idx, &entry)
            } else {
                Self::key2(idx, &entry)
            };
            cuckoo_value = Self::value(&entry);
            subtable = if subtable == 1 { 2 } else { 1 };
        }

        Err(Displaced {
            key: cuckoo_key,
            value: cuckoo_value,
        })
    }

    /// Return every live value mapped to `key`.
    ///
    /// Distinct keys can share a 64-bit fingerprint, and a key can match
    /// slots in both candidate sets; all live matches are returned.
    pub fn lookup(&self, key: u64, out: &mut Vec<u64>) {
        for subtable in [1usize, 2] {
            let idx = if subtable == 1 { Self::index1(key) } else { Self::index2(key) };
            let base = self.set_base(subtable, idx);
            for slot in 0..ENTRIES_PER_SET {
                let entry = self.load_slot(base, slot);
                if Self::is_zero(&entry) {
                    break;
                }
                let slot_key = if subtable == 1 {
                    Self::key1(idx, &entry)
                } else {
                    Self::key2(idx, &entry)
                };
                if slot_key != key {
                    continue;
                }
                let value = Self::value(&entry);
                if value != 0 && value != TOMBSTONE_VALUE {
                    out.push(value);
                }
            }
        }
    }

    /// Remove the exact `(key, value)` mapping.
    ///
    /// The matched slot is backfilled with the last occupied slot of its
    /// set so sets stay dense.  Returns whether anything matched.
    pub fn remove(&self, key: u64, value: u64) -> bool {
        let mut found = false;

        for subtable in [1usize, 2] {
            let idx = if subtable == 1 { Self::index1(key) } else { Self::index2(key) };
            let base = self.set_base(subtable, idx);
            let expected = if subtable == 1 {
                Self::entry1(key, value)
            } else {
                Self::entry2(key, value)
            };

            for slot in 0..ENTRIES_PER_SET {
                let current = self.load_slot(base, slot);
                if current != expected {
                    continue;
                }

                // Last occupied slot in this set.
                let mut tail = slot;
                for later in (slot + 1)..ENTRIES_PER_SET {
                    if Self::is_zero(&self.load_slot(base, later)) {
                        break;
                    }
                    tail = later;
                }

                let tail_entry = self.load_slot(base, tail);
                self.store_slot(base, slot, &tail_entry);
                self.store_slot(base, tail, &[0, 0, 0]);
                found = true;
                break;
            }
        }

        found
    }

    /// Extract every live `(key, value)` pair (tombstones dropped).
    pub fn extract_pairs(&self) -> Vec<(u64, u64)> {
        let mut pairs = Vec::new();
        for subtable in [1usize, 2] {
            for idx in 0..SETS_PER_SUBTABLE {
                let base = self.set_base(subtable, idx);
                for slot in 0..ENTRIES_PER_SET {
                    let entry = self.load_slot(base, slot);
                    if Self::is_zero(&entry) {
                        break;
                    }
                    let key = if subtable == 1 {
                        Self::key1(idx, &entry)
                    } else {
                        Self::key2(idx, &entry)
                    };
                    let value = Self::value(&entry);
                    if value != 0 && value != TOMBSTONE_VALUE {
                        pairs.push((key, value));
                    }
                }
            }
        }
        pairs
    }
}
