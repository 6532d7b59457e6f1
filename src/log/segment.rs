//! Segment files and the copy-on-write segment list.
//!
//! A segment is one fixed-size file: the index block at offset 0 followed
//! by [`BLOCKS_PER_SEGMENT`](super::block::BLOCKS_PER_SEGMENT) data
//! blocks.  The single appender writes blocks with positioned writes;
//! once the log's cursor moves past a segment it is *sealed* and gains a
//! read-only memory map, which readers copy blocks out of from then on.
//! The page cache keeps the map coherent with the occasional late
//! `write_at` a `remove` performs against a sealed segment.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use memmap2::Mmap;
use tracing::trace;

use super::block::{Block, BLOCK_SIZE, SEGMENT_SIZE};

// ------------------------------------------------------------------------------------------------
// Segment
// ------------------------------------------------------------------------------------------------

/// One segment file of the append-only log.
pub struct Segment {
    file: File,

    /// Read-only map, installed when the segment is sealed.
    mmap: OnceLock<Mmap>,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("sealed", &self.mmap.get().is_some())
            .finish_non_exhaustive()
    }
}

impl Segment {
    /// Open (or create) a segment file, extending it to the fixed segment
    /// size.  A preallocated spare file of the right size is used as-is.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < SEGMENT_SIZE {
            file.set_len(SEGMENT_SIZE)?;
        }
        trace!(path = %path.display(), "segment opened");
        Ok(Self {
            file,
            mmap: OnceLock::new(),
        })
    }

    /// Install the read-only map.  Idempotent.
    pub fn seal(&self) -> io::Result<()> {
        if self.mmap.get().is_some() {
            return Ok(());
        }
        // SAFETY: the file is never truncated after creation; late 1-byte
        // type flips through `write_at` stay coherent with the map via
        // the shared page cache.
        let map = unsafe { Mmap::map(&self.file)? };
        let _ = self.mmap.set(map);
        Ok(())
    }

    fn read_range(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        if let Some(map) = self.mmap.get() {
            let start = offset as usize;
            return Ok(map[start..start + len].to_vec());
        }
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Copy data block `which` out of the segment.
    pub fn read_block(&self, which: u64) -> io::Result<Vec<u8>> {
        self.read_range((which + 1) * BLOCK_SIZE as u64, BLOCK_SIZE)
    }

    /// Copy the index block out of the segment.
    pub fn read_index(&self) -> io::Result<Vec<u8>> {
        self.read_range(0, BLOCK_SIZE)
    }

    /// Write data block `which`.
    pub fn write_block(&self, which: u64, block: &Block) -> io::Result<()> {
        self.file
            .write_all_at(&block.snapshot(), (which + 1) * BLOCK_SIZE as u64)
    }

    /// Write the index block.
    pub fn write_index(&self, block: &Block) -> io::Result<()> {
        self.file.write_all_at(&block.snapshot(), 0)
    }

    /// Overwrite one byte of data block `which` (entry-type flips).
    pub fn write_u8_at(&self, which: u64, offset_in_block: usize, value: u8) -> io::Result<()> {
        debug_assert!(offset_in_block < BLOCK_SIZE);
        self.file.write_all_at(
            &[value],
            (which + 1) * BLOCK_SIZE as u64 + offset_in_block as u64,
        )
    }

    /// Flush the segment to stable storage.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

// ------------------------------------------------------------------------------------------------
// SegmentList
// ------------------------------------------------------------------------------------------------

/// An immutable list of `(lower_bound, segment)` pairs.
///
/// Entry `i` is segment file `<prefix>.i`; `lower_bound` is the id of the
/// record whose append created the segment (records with strictly greater
/// ids start inside it).  Adding a segment produces a new list so that
/// readers holding a snapshot never observe growth mid-scan.
#[derive(Debug, Default)]
pub struct SegmentList {
    entries: Vec<(u64, Arc<Segment>)>,
}

impl SegmentList {
    /// The empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// A new list with `(lower_bound, segment)` appended.
    pub fn add(&self, lower_bound: u64, segment: Arc<Segment>) -> Arc<SegmentList> {
        let mut entries = self.entries.clone();
        entries.push((lower_bound, segment));
        Arc::new(SegmentList { entries })
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no segment exists yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lower bound of segment `i`.
    pub fn lower_bound(&self, i: usize) -> u64 {
        self.entries[i].0
    }

    /// Segment `i`.
    pub fn segment(&self, i: usize) -> &Arc<Segment> {
        &self.entries[i].1
    }
}
