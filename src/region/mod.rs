//! Region coordinates and the hashing interface the engine consumes.
//!
//! A shard owns a *region* of the key-space described by a [`Coordinate`]:
//! three `(mask, hash)` pairs — one for the primary (key) dimension and
//! two words covering the 128-bit secondary (value-attribute) space.  A
//! mask bit set to 1 means "this shard constrains that bit of the hash";
//! two coordinates intersect when they agree on every mutually-constrained
//! bit.
//!
//! Hashing itself is **not** this engine's business: the
//! [`RegionHasher`] trait is the seam to the (external) hyperspace-hashing
//! collaborator.  It must be a pure, deterministic function of its inputs.
//! [`MaskHasher`] is the crate's default implementation: CityHash over
//! each dimension, with attribute hashes bit-interleaved across the two
//! secondary words so that a search constraining attribute `i` determines
//! exactly the mask bits at positions `i, i + a, i + 2a, …`.
//!
//! # Entry coordinates vs shard coordinates
//!
//! Coordinates produced by the hasher carry masks that are either all-ones
//! (dimension fully known — a put knows every attribute) or zero
//! (dimension unknown — a del knows nothing about value attributes).
//! Shard coordinates accrete one mask bit per split and may therefore be
//! partially specified; intersection handles both shapes uniformly.

#[cfg(test)]
mod tests;

use cityhash_rs::cityhash_110_128;

/// 64-bit dimension hash: CityHash 1.1.0, low half.
fn dimension_hash(bytes: &[u8]) -> u64 {
    cityhash_110_128(bytes) as u64
}

/// Number of bits in the combined secondary hash space (two u64 words).
const SECONDARY_SPACE_BITS: usize = 128;

// ------------------------------------------------------------------------------------------------
// Coordinate
// ------------------------------------------------------------------------------------------------

/// A region coordinate: which keys and values belong to a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Coordinate {
    /// Constrained bits of the primary hash.
    pub primary_mask: u64,

    /// Primary (key) hash, meaningful under `primary_mask`.
    pub primary_hash: u64,

    /// Constrained bits of the lower secondary word.
    pub secondary_lower_mask: u64,

    /// Lower word of the interleaved secondary hash.
    pub secondary_lower_hash: u64,

    /// Constrained bits of the upper secondary word.
    pub secondary_upper_mask: u64,

    /// Upper word of the interleaved secondary hash.
    pub secondary_upper_hash: u64,
}

impl Coordinate {
    /// Construct a coordinate from its six words.
    pub fn new(
        primary_mask: u64,
        primary_hash: u64,
        secondary_lower_mask: u64,
        secondary_lower_hash: u64,
        secondary_upper_mask: u64,
        secondary_upper_hash: u64,
    ) -> Self {
        Self {
            primary_mask,
            primary_hash,
            secondary_lower_mask,
            secondary_lower_hash,
            secondary_upper_mask,
            secondary_upper_hash,
        }
    }

    /// The unconstrained coordinate: intersects everything.
    pub fn everything() -> Self {
        Self::default()
    }

    /// True when the two regions share at least one point in the full
    /// (primary × secondary) space.
    pub fn intersects(&self, other: &Coordinate) -> bool {
        self.primary_intersects(other) && self.secondary_intersects(other)
    }

    /// True when the primary (key) projections of the regions overlap.
    pub fn primary_intersects(&self, other: &Coordinate) -> bool {
        let mask = self.primary_mask & other.primary_mask;
        (self.primary_hash & mask) == (other.primary_hash & mask)
    }

    /// True when the secondary (value) projections of the regions overlap.
    pub fn secondary_intersects(&self, other: &Coordinate) -> bool {
        let lmask = self.secondary_lower_mask & other.secondary_lower_mask;
        let umask = self.secondary_upper_mask & other.secondary_upper_mask;
        (self.secondary_lower_hash & lmask) == (other.secondary_lower_hash & lmask)
            && (self.secondary_upper_hash & umask) == (other.secondary_upper_hash & umask)
    }
}

// ------------------------------------------------------------------------------------------------
// Search terms
// ------------------------------------------------------------------------------------------------

/// An equality predicate over the value attributes of a record.
///
/// `terms[i] == Some(bytes)` constrains attribute `i` to equal `bytes`;
/// `None` leaves it unconstrained.
#[derive(Debug, Clone, Default)]
pub struct SearchTerms {
    terms: Vec<Option<Vec<u8>>>,
}

impl SearchTerms {
    /// A predicate over `attrs` value attributes, all unconstrained.
    pub fn new(attrs: usize) -> Self {
        Self {
            terms: vec![None; attrs],
        }
    }

    /// Constrain attribute `idx` to equal `value`.
    pub fn equals(mut self, idx: usize, value: impl Into<Vec<u8>>) -> Self {
        self.terms[idx] = Some(value.into());
        self
    }

    /// Number of attributes this predicate ranges over.
    pub fn attrs(&self) -> usize {
        self.terms.len()
    }

    /// The constraint on attribute `idx`, if any.
    pub fn term(&self, idx: usize) -> Option<&[u8]> {
        self.terms.get(idx).and_then(|t| t.as_deref())
    }
}

// ------------------------------------------------------------------------------------------------
// RegionHasher
// ------------------------------------------------------------------------------------------------

/// The pure hashing function the engine consumes.
///
/// Implementations must be deterministic and side-effect-free: the engine
/// re-hashes decoded records during splits and compares the results
/// against coordinates computed at write time.
pub trait RegionHasher: Send + Sync {
    /// Hash a bare key.  The resulting coordinate constrains only the
    /// primary dimension.
    fn hash_key(&self, key: &[u8]) -> Coordinate;

    /// Hash a full record.  Returns the fully-constrained coordinate and
    /// the per-attribute hash vector stored in the search tree.
    fn hash_record(&self, key: &[u8], value: &[Vec<u8>]) -> (Coordinate, Vec<u64>);

    /// Hash a search predicate.  Returns the (partially-constrained)
    /// coordinate and one `Some(hash)` per constrained attribute.
    fn hash_search(&self, terms: &SearchTerms) -> (Coordinate, Vec<Option<u64>>);
}

// ------------------------------------------------------------------------------------------------
// MaskHasher — default implementation
// ------------------------------------------------------------------------------------------------

/// Default [`RegionHasher`]: CityHash per dimension, attributes
/// bit-interleaved across the secondary words.
#[derive(Debug, Clone)]
pub struct MaskHasher {
    attrs: usize,
}

impl MaskHasher {
    /// A hasher for records with `attrs` value attributes.
    pub fn new(attrs: usize) -> Self {
        debug_assert!(attrs > 0);
        Self { attrs }
    }

    /// Number of value attributes this hasher expects.
    pub fn attrs(&self) -> usize {
        self.attrs
    }

    /// Scatter per-attribute hashes into the two secondary words.
    ///
    /// Bit `p` of the 128-bit secondary space comes from bit `p / attrs`
    /// of attribute `p % attrs`.  Unconstrained attributes (`None`)
    /// contribute no mask bits.
    fn interleave(&self, hashes: &[Option<u64>]) -> (u64, u64, u64, u64) {
        let mut lower_mask = 0u64;
        let mut lower_hash = 0u64;
        let mut upper_mask = 0u64;
        let mut upper_hash = 0u64;

        for p in 0..SECONDARY_SPACE_BITS {
            let attr = p % self.attrs;
            let src_bit = (p / self.attrs) as u32;
            if src_bit >= 64 {
                break;
            }

            let Some(h) = hashes[attr] else {
                continue;
            };
            let bit = (h >> src_bit) & 1;

            if p < 64 {
                lower_mask |= 1u64 << p;
                lower_hash |= bit << p;
            } else {
                upper_mask |= 1u64 << (p - 64);
                upper_hash |= bit << (p - 64);
            }
        }

        (lower_mask, lower_hash, upper_mask, upper_hash)
    }
}

impl RegionHasher for MaskHasher {
    fn hash_key(&self, key: &[u8]) -> Coordinate {
        Coordinate::new(u64::MAX, dimension_hash(key), 0, 0, 0, 0)
    }

    fn hash_record(&self, key: &[u8], value: &[Vec<u8>]) -> (Coordinate, Vec<u64>) {
        debug_assert_eq!(value.len(), self.attrs);
        let hashes: Vec<u64> = value.iter().map(|v| dimension_hash(v)).collect();
        let some: Vec<Option<u64>> = hashes.iter().map(|h| Some(*h)).collect();
        let (lm, lh, um, uh) = self.interleave(&some);
        let coord = Coordinate::new(u64::MAX, dimension_hash(key), lm, lh, um, uh);
        (coord, hashes)
    }

    fn hash_search(&self, terms: &SearchTerms) -> (Coordinate, Vec<Option<u64>>) {
        debug_assert_eq!(terms.attrs(), self.attrs);
        let hashes: Vec<Option<u64>> = (0..self.attrs)
            .map(|i| terms.term(i).map(dimension_hash))
            .collect();
        let (lm, lh, um, uh) = self.interleave(&hashes);
        (Coordinate::new(0, 0, lm, lh, um, uh), hashes)
    }
}
