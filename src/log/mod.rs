//! Durable append-only log of variable-sized records.
//!
//! The log assigns each appended record a monotonically increasing 48-bit
//! id, supports random-access [`lookup`](Log::lookup) by id, and logical
//! deletion via [`remove`](Log::remove).  Storage is a sequence of
//! fixed-size segment files `<prefix>.0`, `<prefix>.1`, … plus an ASCII
//! state file `<prefix>.state` written on close.
//!
//! # On-disk layout
//!
//! ```text
//! <prefix>.N           one index block, then 4093 data blocks of 16 KiB
//!   index block        [reserved u32][base_id u64 BE][delta u32 BE × 4093]
//!   data block         entries, each [crc32|len|type|id48] + body
//! <prefix>.state       id <u64>\n removed <u64>\n segment <n> <lb>\n …
//!                      block <u64>\n offset <u64>\n
//! ```
//!
//! A record that does not fit in one block is split across consecutive
//! blocks as `FIRST`/`MIDDLE`…/`LAST` slices; each slice carries its own
//! CRC32.  The index block maps each data block to the lowest record id
//! appearing in it (as a delta from the segment's base id), which is what
//! makes lookup by id a bounded scan.
//!
//! # Concurrency
//!
//! One logical appender, many readers.  An append reserves its id and
//! block range under a short cursor lock, releases the lock, fills the
//! reserved blocks, then passes through two [`SequenceBarrier`]s: the
//! pre-write barrier orders in-RAM framing by id, the post-write barrier
//! orders disk visibility by id.  Readers spin on the post-write barrier
//! until the id they want is stable, then scan copies of the candidate
//! blocks; they never block the appender.
//!
//! # Crash consistency
//!
//! Closed blocks are written with positioned writes as soon as they fill;
//! the final partial block and the live index block stay in RAM until the
//! next block boundary, [`checkpoint`](Log::checkpoint), or
//! [`close`](Log::close).  A crash can lose the unfinished suffix but
//! never corrupts the synced prefix; reads past the lost suffix report
//! not-found.

pub mod block;
pub mod segment;

#[cfg(test)]
mod tests;

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::sync::SequenceBarrier;
use block::{
    index_base, index_delta, init_index_block, stamp_index_delta, Block, EntryHeader, BLOCKS_PER_SEGMENT,
    BLOCK_SIZE, ENTRY_HEADER_SIZE, ENTRY_TYPE_OFFSET, ID_UPPER_BOUND, MAX_WRITE_SIZE, TYPE_FIRST,
    TYPE_FULL, TYPE_LAST, TYPE_MIDDLE, TYPE_REMOVED,
};
use segment::{Segment, SegmentList};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by log operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LogError {
    /// Operation against a closed log.
    #[error("log is closed")]
    Closed,

    /// The record exceeds the per-record maximum.
    #[error("record of {0} bytes exceeds the per-record maximum")]
    TooBig(usize),

    /// All 2^48 record ids have been issued.
    #[error("48-bit record-id space exhausted")]
    IdsExhausted,

    /// The state file does not match the expected grammar.
    #[error("state file is corrupt: {0}")]
    CorruptState(String),

    /// An on-disk entry failed its integrity check.
    #[error("on-disk entry is corrupt: {0}")]
    Corrupt(String),

    /// Opening a file failed.
    #[error("open failed: {0}")]
    OpenFailed(#[source] io::Error),

    /// A read syscall failed.
    #[error("read failed: {0}")]
    ReadFailed(#[source] io::Error),

    /// A write syscall failed.
    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),

    /// An fsync failed.
    #[error("sync failed: {0}")]
    SyncFailed(#[source] io::Error),

    /// Sealing or closing a segment failed.
    #[error("close failed: {0}")]
    CloseFailed(#[source] io::Error),
}

// ------------------------------------------------------------------------------------------------
// Cursor — the mutable head of the log
// ------------------------------------------------------------------------------------------------

/// All state the offset lock guards.
struct Cursor {
    /// Next unassigned record id; 0 means the log is closed.
    id: u64,

    /// Segment the next byte lands in.
    segment_number: u64,

    /// Data block (within the segment) the next byte lands in.
    block_number: u64,

    /// Byte offset within that block.
    block_offset: u64,

    /// Copy-on-write list of all segments, oldest first.
    segments: Arc<SegmentList>,

    /// Segment currently being appended to; `None` until the first append.
    unfinished_segment: Option<Arc<Segment>>,

    /// Live index block of the unfinished segment.
    unfinished_index: Arc<Block>,

    /// The partially-filled data block, kept in RAM until it closes.
    unfinished_block: Arc<Block>,
}

/// Saved cursor fields for rollback when a reservation fails mid-way.
struct CursorSave {
    id: u64,
    segment_number: u64,
    block_number: u64,
    block_offset: u64,
    segments: Arc<SegmentList>,
    unfinished_segment: Option<Arc<Segment>>,
    unfinished_index: Arc<Block>,
    unfinished_block: Arc<Block>,
}

impl Cursor {
    fn save(&self) -> CursorSave {
        CursorSave {
            id: self.id,
            segment_number: self.segment_number,
            block_number: self.block_number,
            block_offset: self.block_offset,
            segments: Arc::clone(&self.segments),
            unfinished_segment: self.unfinished_segment.clone(),
            unfinished_index: Arc::clone(&self.unfinished_index),
            unfinished_block: Arc::clone(&self.unfinished_block),
        }
    }

    fn restore(&mut self, save: CursorSave) {
        self.id = save.id;
        self.segment_number = save.segment_number;
        self.block_number = save.block_number;
        self.block_offset = save.block_offset;
        self.segments = save.segments;
        self.unfinished_segment = save.unfinished_segment;
        self.unfinished_index = save.unfinished_index;
        self.unfinished_block = save.unfinished_block;
    }
}

// ------------------------------------------------------------------------------------------------
// Pieces — copies of candidate blocks for a read
// ------------------------------------------------------------------------------------------------

/// Where a copied block came from, so `remove` can flip bytes at the
/// authoritative location.
enum PieceOrigin {
    /// The in-RAM unfinished block.
    Ram(Arc<Block>),

    /// Data block `block` of `segment`, on disk.
    Disk { segment: Arc<Segment>, block: u64 },
}

/// A copied candidate block plus its origin.
struct Piece {
    bytes: Vec<u8>,
    origin: PieceOrigin,
}

/// Read-side snapshot of the cursor, taken under the offset lock.
struct ReadView {
    highest: u64,
    highest_segment: u64,
    highest_block: u64,
    segments: Arc<SegmentList>,
    unfinished_index: Arc<Block>,
    unfinished_block: Arc<Block>,
}

// ------------------------------------------------------------------------------------------------
// Log
// ------------------------------------------------------------------------------------------------

/// The append-only segmented log.
pub struct Log {
    /// Path prefix; segments are `<prefix>.N`, state is `<prefix>.state`.
    prefix: PathBuf,

    /// Offset lock: id allocation and cursor arithmetic.
    cursor: Mutex<Cursor>,

    /// Orders in-RAM framing by id.
    pre_write: SequenceBarrier,

    /// Orders disk visibility by id.
    post_write: SequenceBarrier,

    /// Ids consumed by removals plus records flipped dead.
    removed: AtomicU64,

    /// Set when the log's files have been superseded on disk: reads keep
    /// working off the open descriptors, but drop must not write a state
    /// file back under the old name.
    retired: AtomicBool,
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl Log {
    // --------------------------------------------------------------------------------------------
    // Open / close
    // --------------------------------------------------------------------------------------------

    /// Open the log at `prefix`, replaying `<prefix>.state` if present.
    ///
    /// A missing state file bootstraps an empty log; a malformed one is
    /// [`LogError::CorruptState`].
    pub fn open(prefix: impl Into<PathBuf>) -> Result<Self, LogError> {
        let prefix = prefix.into();
        let state_path = path_state(&prefix);

        let state = match fs::read(&state_path) {
            Ok(buf) => parse_state(&buf)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => ParsedState::default(),
            Err(e) => return Err(LogError::ReadFailed(e)),
        };

        let mut segments = Arc::new(SegmentList::new());
        let mut segment_number = 0u64;
        for (i, (segno, lower_bound)) in state.segments.iter().enumerate() {
            if *segno != i as u64 {
                return Err(LogError::CorruptState(format!(
                    "segment lines not consecutive: expected {i}, found {segno}"
                )));
            }
            let seg = Arc::new(
                Segment::open(&path_segment(&prefix, *segno)).map_err(LogError::OpenFailed)?,
            );
            segments = segments.add(*lower_bound, seg);
            segment_number = segment_number.max(*segno);
        }

        // All but the newest segment are immutable from here on.
        for i in 0..segments.len().saturating_sub(1) {
            segments.segment(i).seal().map_err(LogError::CloseFailed)?;
        }

        let (unfinished_segment, unfinished_index, unfinished_block) = if segments.is_empty() {
            (None, Arc::new(Block::zeroed()), Arc::new(Block::zeroed()))
        } else {
            let last = Arc::clone(segments.segment(segments.len() - 1));
            let index = last.read_index().map_err(LogError::ReadFailed)?;
            let data = last.read_block(state.block).map_err(LogError::ReadFailed)?;
            (
                Some(last),
                Arc::new(Block::from_bytes(&index)),
                Arc::new(Block::from_bytes(&data)),
            )
        };

        info!(
            prefix = %prefix.display(),
            id = state.id,
            removed = state.removed,
            segments = segments.len(),
            "log opened"
        );

        Ok(Self {
            cursor: Mutex::new(Cursor {
                id: state.id,
                segment_number,
                block_number: state.block,
                block_offset: state.offset,
                segments,
                unfinished_segment,
                unfinished_index,
                unfinished_block,
            }),
            pre_write: SequenceBarrier::new(state.id),
            post_write: SequenceBarrier::new(state.id),
            removed: AtomicU64::new(state.removed),
            retired: AtomicBool::new(false),
            prefix,
        })
    }

    /// Close the log: quiesce in-flight writes, persist the state file,
    /// flush the unfinished index and data block, and fsync everything.
    ///
    /// Subsequent operations return [`LogError::Closed`].
    pub fn close(&self) -> Result<(), LogError> {
        let id = {
            let mut cur = self.lock_cursor();
            if cur.id == 0 {
                return Err(LogError::Closed);
            }
            let id = cur.id;
            cur.id = 0;
            id
        };

        self.post_write.wait(id);
        self.write_checkpoint(id)?;
        info!(prefix = %self.prefix.display(), id, "log closed");
        Ok(())
    }

    /// Persist the current state file and unfinished blocks without
    /// closing.
    ///
    /// Caller must guarantee no concurrent mutation (the shard's mutate
    /// lock provides this); a checkpoint taken mid-append would record a
    /// torn cursor.
    pub fn checkpoint(&self) -> Result<(), LogError> {
        let id = {
            let cur = self.lock_cursor();
            if cur.id == 0 {
                return Err(LogError::Closed);
            }
            cur.id
        };
        self.post_write.wait(id);
        self.write_checkpoint(id)
    }

    /// Flush all segment data (and the unfinished blocks) to disk without
    /// touching the state file.
    pub fn sync_data(&self) -> Result<(), LogError> {
        let cur = self.lock_cursor();
        if let Some(seg) = &cur.unfinished_segment {
            seg.write_index(&cur.unfinished_index)
                .map_err(LogError::WriteFailed)?;
            seg.write_block(cur.block_number, &cur.unfinished_block)
                .map_err(LogError::WriteFailed)?;
        }
        for i in 0..cur.segments.len() {
            cur.segments.segment(i).sync().map_err(LogError::SyncFailed)?;
        }
        Ok(())
    }

    fn write_checkpoint(&self, id: u64) -> Result<(), LogError> {
        let cur = self.lock_cursor();
        let removed = self.removed.load(Ordering::Acquire);

        let mut out = String::new();
        out.push_str(&format!("id {id}\n"));
        out.push_str(&format!("removed {removed}\n"));
        if cur.segments.is_empty() {
            // Never appended: record the bootstrap segment line so the
            // state file round-trips byte-for-byte.
            out.push_str("segment 0 1\n");
        } else {
            for i in 0..cur.segments.len() {
                cur.segments.segment(i).sync().map_err(LogError::SyncFailed)?;
                out.push_str(&format!("segment {i} {}\n", cur.segments.lower_bound(i)));
            }
        }
        out.push_str(&format!("block {}\n", cur.block_number));
        out.push_str(&format!("offset {}\n", cur.block_offset));

        fs::write(path_state(&self.prefix), out).map_err(LogError::WriteFailed)?;

        if let Some(seg) = &cur.unfinished_segment {
            seg.write_index(&cur.unfinished_index)
                .map_err(LogError::WriteFailed)?;
            seg.write_block(cur.block_number, &cur.unfinished_block)
                .map_err(LogError::WriteFailed)?;
            seg.sync().map_err(LogError::SyncFailed)?;
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Append
    // --------------------------------------------------------------------------------------------

    /// Append `data` as one record, returning its id.
    pub fn append(&self, data: &[u8]) -> Result<u64, LogError> {
        if data.len() > MAX_WRITE_SIZE {
            return Err(LogError::TooBig(data.len()));
        }

        // Worst-case fresh blocks this record can spill into.
        let upper_bound_blocks =
            (data.len() + BLOCK_SIZE - ENTRY_HEADER_SIZE - 1) / (BLOCK_SIZE - ENTRY_HEADER_SIZE);
        let mut blocks: Vec<Arc<Block>> = Vec::with_capacity(upper_bound_blocks + 1);
        blocks.push(Arc::new(Block::zeroed())); // replaced by the unfinished block
        for _ in 0..upper_bound_blocks {
            blocks.push(Arc::new(Block::zeroed()));
        }

        let r = self.reserve(data.len() as u64, &mut blocks)?;
        trace!(id = r.id, bytes = data.len(), "append reserved");

        // Frame the record into the reserved blocks.  The first slice
        // starts at the cursor's old offset; every later slice at 0.
        let mut offset = r.start_offset as usize;
        let mut remaining = data;
        let mut entry_type = if blocks.len() > 1 { TYPE_FIRST } else { TYPE_FULL };
        for (i, b) in blocks.iter().enumerate() {
            let sz = (BLOCK_SIZE - offset - ENTRY_HEADER_SIZE).min(remaining.len());
            let body = &remaining[..sz];
            let header = EntryHeader {
                crc: crc32(body),
                len: sz as u16,
                entry_type,
                id: r.id,
            };
            let mut hdr = [0u8; ENTRY_HEADER_SIZE];
            header.write_to(&mut hdr);
            b.write(offset, &hdr);
            b.write(offset + ENTRY_HEADER_SIZE, body);
            remaining = &remaining[sz..];
            offset = 0;
            entry_type = if i + 2 >= blocks.len() { TYPE_LAST } else { TYPE_MIDDLE };
        }

        // Stamp index deltas for every block this append closes.
        let start_abs = r.start_segment * BLOCKS_PER_SEGMENT + r.start_block;
        let end_abs = r.end_segment * BLOCKS_PER_SEGMENT + r.end_block;
        for i in 0..blocks.len() {
            let first = i == 0 && r.start_offset == 0;
            let last = i + 1 == blocks.len() && start_abs != end_abs && r.end_offset != 0;
            let middle = i > 0 && i + 1 < blocks.len();
            if !(first || last || middle) {
                continue;
            }
            let mut which = r.start_block + i as u64;
            let idx = if which >= BLOCKS_PER_SEGMENT {
                which -= BLOCKS_PER_SEGMENT;
                &r.idx2
            } else {
                &r.idx1
            };
            let base = u64::from_be_bytes(
                idx.read_bytes(block::INDEX_BASE_OFFSET, 8)
                    .try_into()
                    .unwrap_or([0u8; 8]),
            );
            stamp_index_delta(idx, which, (r.id - base) as u32);
        }

        // Phase one: all framing for lower ids is in RAM before ours is
        // published.
        self.pre_write.wait(r.id);
        self.pre_write.arrive();

        let mut result: Result<(), LogError> = Ok(());

        // Write every block this append closed; the final (still mutable)
        // block stays in RAM only.
        for (i, b) in blocks.iter().enumerate().take(blocks.len().saturating_sub(1)) {
            let mut which = r.start_block + i as u64;
            let seg = if which >= BLOCKS_PER_SEGMENT {
                which -= BLOCKS_PER_SEGMENT;
                &r.seg2
            } else {
                &r.seg1
            };
            if let Err(e) = seg.write_block(which, b) {
                if result.is_ok() {
                    result = Err(LogError::WriteFailed(e));
                }
            }
        }

        if r.start_segment != r.end_segment {
            if let Err(e) = r.seg1.write_index(&r.idx1) {
                if result.is_ok() {
                    result = Err(LogError::WriteFailed(e));
                }
            }
        }

        // Phase two: our blocks are on disk only after every lower id's
        // blocks are.
        self.post_write.wait(r.id);

        if r.start_segment != r.end_segment {
            debug!(
                segment = r.start_segment,
                id = r.id,
                "segment boundary crossed, sealing"
            );
            if let Err(e) = r.seg1.sync() {
                if result.is_ok() {
                    result = Err(LogError::SyncFailed(e));
                }
            }
            if let Err(e) = r.seg1.seal() {
                if result.is_ok() {
                    result = Err(LogError::CloseFailed(e));
                }
            }
        }

        self.post_write.arrive();
        result.map(|()| r.id)
    }

    /// Reserve an id and a block range for one append.
    fn reserve(&self, data_len: u64, blocks: &mut Vec<Arc<Block>>) -> Result<Reservation, LogError> {
        let mut cur = self.lock_cursor();
        if cur.id == 0 {
            return Err(LogError::Closed);
        }
        if cur.id >= ID_UPPER_BOUND {
            return Err(LogError::IdsExhausted);
        }

        let save = cur.save();
        let id = cur.id;
        cur.id += 1;

        let start_segment = cur.segment_number;
        let start_block = cur.block_number;
        let start_offset = cur.block_offset;
        blocks[0] = Arc::clone(&cur.unfinished_block);

        // Walk the cursor over the framed slices.
        let mut consumed = 0u64;
        loop {
            let space_left = BLOCK_SIZE as u64 - cur.block_offset - ENTRY_HEADER_SIZE as u64;
            if consumed + space_left >= data_len {
                cur.block_offset += ENTRY_HEADER_SIZE as u64 + (data_len - consumed);
                consumed = data_len;
            } else {
                cur.block_offset += ENTRY_HEADER_SIZE as u64 + space_left;
                consumed += space_left;
            }
            if cur.block_offset + ENTRY_HEADER_SIZE as u64 > BLOCK_SIZE as u64 {
                cur.block_offset = 0;
                cur.block_number += 1;
            }
            if consumed >= data_len {
                break;
            }
        }
        cur.segment_number += cur.block_number / BLOCKS_PER_SEGMENT;
        cur.block_number %= BLOCKS_PER_SEGMENT;

        let end_segment = cur.segment_number;
        let end_block = cur.block_number;
        let end_offset = cur.block_offset;

        let actual_blocks = (end_segment * BLOCKS_PER_SEGMENT + end_block)
            - (start_segment * BLOCKS_PER_SEGMENT + start_block);
        debug_assert!(
            actual_blocks + 1 == blocks.len() as u64 || actual_blocks + 2 == blocks.len() as u64
        );
        if actual_blocks + 2 == blocks.len() as u64 {
            blocks.pop();
        }

        // First append ever: materialize the first segment.
        if cur.unfinished_segment.is_none() {
            match self.open_segment(start_segment) {
                Ok(seg) => {
                    let idx = Arc::new(Block::zeroed());
                    init_index_block(&idx, id - 1);
                    cur.segments = cur.segments.add(id, Arc::clone(&seg));
                    cur.unfinished_segment = Some(seg);
                    cur.unfinished_index = idx;
                }
                Err(e) => {
                    cur.restore(save);
                    return Err(e);
                }
            }
        }

        let seg1 = match &cur.unfinished_segment {
            Some(seg) => Arc::clone(seg),
            None => {
                cur.restore(save);
                return Err(LogError::Corrupt("no writable segment".into()));
            }
        };
        let idx1 = Arc::clone(&cur.unfinished_index);

        // Crossing into a new segment opens it and swaps the live index.
        if start_segment != end_segment {
            match self.open_segment(end_segment) {
                Ok(seg) => {
                    let idx = Arc::new(Block::zeroed());
                    init_index_block(&idx, id - 1);
                    cur.segments = cur.segments.add(id, Arc::clone(&seg));
                    cur.unfinished_segment = Some(seg);
                    cur.unfinished_index = idx;
                }
                Err(e) => {
                    cur.restore(save);
                    return Err(e);
                }
            }
        }
        let seg2 = match &cur.unfinished_segment {
            Some(seg) => Arc::clone(seg),
            None => {
                cur.restore(save);
                return Err(LogError::Corrupt("no writable segment".into()));
            }
        };
        let idx2 = Arc::clone(&cur.unfinished_index);

        if start_segment != end_segment || start_block != end_block {
            if let Some(last) = blocks.last() {
                cur.unfinished_block = Arc::clone(last);
            }
        }

        Ok(Reservation {
            id,
            start_segment,
            start_block,
            start_offset,
            end_segment,
            end_block,
            end_offset,
            seg1,
            idx1,
            seg2,
            idx2,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Lookup / remove
    // --------------------------------------------------------------------------------------------

    /// Fetch the record with the given id.
    ///
    /// Returns `Ok(None)` for ids that were never assigned, not yet
    /// durable, or logically removed.
    pub fn lookup(&self, id: u64) -> Result<Option<Vec<u8>>, LogError> {
        self.lookup_impl(id, false)
    }

    /// Fetch the record with the given id even if it has been logically
    /// removed.
    ///
    /// A removal only flips entry-type bytes; the body bytes (and their
    /// checksums) stay intact, which is what lets snapshots older than
    /// the removal keep resolving the record.
    pub fn lookup_including_removed(&self, id: u64) -> Result<Option<Vec<u8>>, LogError> {
        self.lookup_impl(id, true)
    }

    fn lookup_impl(&self, id: u64, include_removed: bool) -> Result<Option<Vec<u8>>, LogError> {
        let view = self.read_view()?;
        if id == 0 || id >= view.highest {
            return Ok(None);
        }
        self.post_write.wait(id);
        let pieces = self.collect_blocks(id, &view)?;

        let mut out = Vec::new();
        let mut found = false;

        'pieces: for piece in &pieces {
            let mut offset = 0usize;
            while offset + ENTRY_HEADER_SIZE <= BLOCK_SIZE {
                let header = EntryHeader::read_from(&piece.bytes[offset..]);
                let body_start = offset + ENTRY_HEADER_SIZE;
                let body_end = body_start + header.len as usize;

                if header.id != 0 && header.id < id {
                    if body_end > BLOCK_SIZE {
                        break 'pieces;
                    }
                    offset = body_end;
                    continue;
                }
                if header.id > id || header.id == 0 {
                    break 'pieces;
                }
                if header.entry_type == TYPE_REMOVED && !include_removed {
                    return Ok(None);
                }
                if body_end > BLOCK_SIZE {
                    break 'pieces;
                }

                let body = &piece.bytes[body_start..body_end];
                if crc32(body) != header.crc {
                    return Err(LogError::Corrupt(format!(
                        "crc mismatch for record {id} (slice type {})",
                        header.entry_type
                    )));
                }
                out.extend_from_slice(body);
                found = true;
                offset = body_end;
            }
        }

        Ok(found.then_some(out))
    }

    /// Logically remove the record with the given id.
    ///
    /// Consumes one op id from the id space; returns `Ok(Some(op_id))`
    /// when a live record was flipped, `Ok(None)` when no live record
    /// with that id exists.
    pub fn remove(&self, id: u64) -> Result<Option<u64>, LogError> {
        let (view, op) = {
            let mut cur = self.lock_cursor();
            if cur.id == 0 {
                return Err(LogError::Closed);
            }
            if cur.id >= ID_UPPER_BOUND {
                return Err(LogError::IdsExhausted);
            }
            let op = cur.id;
            cur.id += 1;
            (
                ReadView {
                    highest: op,
                    highest_segment: cur.segment_number,
                    highest_block: cur.block_number,
                    segments: Arc::clone(&cur.segments),
                    unfinished_index: Arc::clone(&cur.unfinished_index),
                    unfinished_block: Arc::clone(&cur.unfinished_block),
                },
                op,
            )
        };

        let result = self.remove_inner(id, &view);
        let found = matches!(result, Ok(true));

        // The op id was consumed whether or not anything was flipped;
        // account for it and pass through both barriers so later ids are
        // never stranded.
        self.removed
            .fetch_add(1 + u64::from(found), Ordering::AcqRel);
        self.pre_write.wait(op);
        self.pre_write.arrive();
        self.post_write.wait(op);
        self.post_write.arrive();

        match result {
            Ok(true) => {
                trace!(id, op, "record removed");
                Ok(Some(op))
            }
            Ok(false) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn remove_inner(&self, id: u64, view: &ReadView) -> Result<bool, LogError> {
        if id == 0 || id >= view.highest {
            return Ok(false);
        }
        self.post_write.wait(id);
        let pieces = self.collect_blocks(id, view)?;

        let mut found = false;
        'pieces: for piece in &pieces {
            let mut offset = 0usize;
            while offset + ENTRY_HEADER_SIZE <= BLOCK_SIZE {
                let header = EntryHeader::read_from(&piece.bytes[offset..]);
                let body_start = offset + ENTRY_HEADER_SIZE;
                let body_end = body_start + header.len as usize;

                if header.id != 0 && header.id < id {
                    if body_end > BLOCK_SIZE {
                        break 'pieces;
                    }
                    offset = body_end;
                    continue;
                }
                if header.id > id || header.id == 0 {
                    break 'pieces;
                }
                if header.entry_type != TYPE_REMOVED {
                    // Flip the authoritative copy of the type byte.
                    match &piece.origin {
                        PieceOrigin::Ram(b) => {
                            b.write_u8(offset + ENTRY_TYPE_OFFSET, TYPE_REMOVED);
                        }
                        PieceOrigin::Disk { segment, block } => {
                            segment
                                .write_u8_at(*block, offset + ENTRY_TYPE_OFFSET, TYPE_REMOVED)
                                .map_err(LogError::WriteFailed)?;
                        }
                    }
                    found = true;
                }
                if body_end > BLOCK_SIZE {
                    break 'pieces;
                }
                offset = body_end;
            }
        }
        Ok(found)
    }

    // --------------------------------------------------------------------------------------------
    // Shared read-path plumbing
    // --------------------------------------------------------------------------------------------

    fn read_view(&self) -> Result<ReadView, LogError> {
        let cur = self.lock_cursor();
        if cur.id == 0 {
            return Err(LogError::Closed);
        }
        Ok(ReadView {
            highest: cur.id,
            highest_segment: cur.segment_number,
            highest_block: cur.block_number,
            segments: Arc::clone(&cur.segments),
            unfinished_index: Arc::clone(&cur.unfinished_index),
            unfinished_block: Arc::clone(&cur.unfinished_block),
        })
    }

    /// Copy out every block that could hold a slice of `target`.
    fn collect_blocks(&self, target: u64, view: &ReadView) -> Result<Vec<Piece>, LogError> {
        let list = &view.segments;
        if list.is_empty() {
            return Ok(Vec::new());
        }

        // Highest segment whose lower bound is strictly below the target;
        // an equal lower bound means the record straddles the previous
        // boundary, so the scan widens to two segments.
        let mut segno = 0usize;
        let mut segnum = 1usize;
        for i in (0..list.len()).rev() {
            let lb = list.lower_bound(i);
            if lb == target && i > 0 {
                segnum += 1;
            }
            if lb < target {
                segno = i;
                break;
            }
        }

        let mut pieces = Vec::new();
        for no in 0..segnum {
            let seg_index = segno + no;
            if seg_index >= list.len() {
                break;
            }
            let seg = Arc::clone(list.segment(seg_index));
            let index_bytes = if seg_index as u64 == view.highest_segment {
                view.unfinished_index.snapshot()
            } else {
                seg.read_index().map_err(LogError::ReadFailed)?
            };
            let base = index_base(&index_bytes);

            // Bound the candidate data blocks by the per-block deltas.
            let mut start_blockno = 0u64;
            let mut end_blockno = 0u64;
            let mut j = 0u64;
            while j < BLOCKS_PER_SEGMENT {
                let diff = index_delta(&index_bytes, j);
                let lb = base + diff as u64;
                end_blockno = j;
                if lb > target || (j > 0 && diff == 0) {
                    break;
                }
                if lb < target {
                    start_blockno = j;
                }
                j += 1;
            }
            if j == BLOCKS_PER_SEGMENT {
                end_blockno = BLOCKS_PER_SEGMENT;
            }

            for k in start_blockno..end_blockno {
                if seg_index as u64 == view.highest_segment && k == view.highest_block {
                    pieces.push(Piece {
                        bytes: view.unfinished_block.snapshot(),
                        origin: PieceOrigin::Ram(Arc::clone(&view.unfinished_block)),
                    });
                } else {
                    pieces.push(Piece {
                        bytes: seg.read_block(k).map_err(LogError::ReadFailed)?,
                        origin: PieceOrigin::Disk {
                            segment: Arc::clone(&seg),
                            block: k,
                        },
                    });
                }
            }
        }

        Ok(pieces)
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    /// The next id the log will assign (the current horizon).
    ///
    /// 0 means the log has been closed.
    pub fn next_id(&self) -> u64 {
        self.lock_cursor().id
    }

    /// Mark this log's on-disk files as superseded.
    ///
    /// Reads keep working off the open descriptors (outstanding snapshots
    /// depend on that); drop stops writing the state file back.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Ids consumed by removals plus records flipped dead.
    pub fn removed_count(&self) -> u64 {
        self.removed.load(Ordering::Acquire)
    }

    /// Bytes of data-block space the cursor has consumed.
    pub fn used_bytes(&self) -> u64 {
        let cur = self.lock_cursor();
        (cur.segment_number * BLOCKS_PER_SEGMENT + cur.block_number) * BLOCK_SIZE as u64
            + cur.block_offset
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    fn lock_cursor(&self) -> MutexGuard<'_, Cursor> {
        match self.cursor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn open_segment(&self, segno: u64) -> Result<Arc<Segment>, LogError> {
        Segment::open(&path_segment(&self.prefix, segno))
            .map(Arc::new)
            .map_err(LogError::OpenFailed)
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        if self.retired.load(Ordering::Acquire) {
            return;
        }
        let open = self.lock_cursor().id != 0;
        if open {
            if let Err(e) = self.close() {
                error!(prefix = %self.prefix.display(), error = %e, "log close failed on drop");
            }
        }
    }
}

/// Everything `append` needs after the offset lock is released.
struct Reservation {
    id: u64,
    start_segment: u64,
    start_block: u64,
    start_offset: u64,
    end_segment: u64,
    end_block: u64,
    end_offset: u64,
    seg1: Arc<Segment>,
    idx1: Arc<Block>,
    seg2: Arc<Segment>,
    idx2: Arc<Block>,
}

// ------------------------------------------------------------------------------------------------
// State file
// ------------------------------------------------------------------------------------------------

struct ParsedState {
    id: u64,
    removed: u64,
    segments: Vec<(u64, u64)>,
    block: u64,
    offset: u64,
}

impl Default for ParsedState {
    fn default() -> Self {
        Self {
            id: 1,
            removed: 0,
            segments: Vec::new(),
            block: 0,
            offset: 0,
        }
    }
}

fn parse_state(buf: &[u8]) -> Result<ParsedState, LogError> {
    let text = std::str::from_utf8(buf)
        .map_err(|_| LogError::CorruptState("state file is not ASCII".into()))?;
    let mut lines = StateLines { rest: text };

    let id = parse_kv_line(lines.next()?, "id ")?;
    let removed = parse_kv_line(lines.next()?, "removed ")?;

    let mut segments = Vec::new();
    let mut line = lines.next()?;
    loop {
        let Some(rest) = line.strip_prefix("segment ") else {
            break;
        };
        let mut parts = rest.splitn(2, ' ');
        let segno = parse_u64(parts.next().unwrap_or(""))?;
        let lower_bound = parse_u64(parts.next().unwrap_or(""))?;
        segments.push((segno, lower_bound));
        line = lines.next()?;
    }
    if segments.is_empty() {
        return Err(LogError::CorruptState("no segment lines".into()));
    }

    let block = parse_kv_line(line, "block ")?;
    let offset = parse_kv_line(lines.next()?, "offset ")?;

    if !lines.rest.is_empty() {
        return Err(LogError::CorruptState("trailing bytes after offset line".into()));
    }

    Ok(ParsedState {
        id,
        removed,
        segments,
        block,
        offset,
    })
}

struct StateLines<'a> {
    rest: &'a str,
}

impl<'a> StateLines<'a> {
    fn next(&mut self) -> Result<&'a str, LogError> {
        match self.rest.find('\n') {
            Some(i) => {
                let line = &self.rest[..i];
                self.rest = &self.rest[i + 1..];
                Ok(line)
            }
            None => Err(LogError::CorruptState("truncated state file".into())),
        }
    }
}

fn parse_kv_line(line: &str, prefix: &str) -> Result<u64, LogError> {
    let rest = line
        .strip_prefix(prefix)
        .ok_or_else(|| LogError::CorruptState(format!("expected `{}` line", prefix.trim_end())))?;
    parse_u64(rest)
}

fn parse_u64(s: &str) -> Result<u64, LogError> {
    s.parse::<u64>()
        .map_err(|_| LogError::CorruptState(format!("bad integer `{s}`")))
}

// ------------------------------------------------------------------------------------------------
// Paths / checksums
// ------------------------------------------------------------------------------------------------

fn path_state(prefix: &std::path::Path) -> PathBuf {
    PathBuf::from(format!("{}.state", prefix.display()))
}

fn path_segment(prefix: &std::path::Path, segno: u64) -> PathBuf {
    PathBuf::from(format!("{}.{segno}", prefix.display()))
}

fn crc32(body: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(body);
    hasher.finalize()
}
