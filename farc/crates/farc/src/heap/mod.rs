//! Heap Module - Archived Heap Objects
//!
//! Archived Object Layout (24-byte header + payload):
//! ┌─────────────────────────────────────────┐
//! │         Mark Word (8 bytes)             │
//! │  - Bits 0-3: lock / mark state (zero)   │
//! │  - Bits 4-7: age (zero)                 │
//! │  - Bits 8-63: identity hash (kept)      │
//! ├─────────────────────────────────────────┤
//! │       Class Word (8 bytes)              │  <- ArchiveOffset of the class
//! ├─────────────────────────────────────────┤
//! │         Size (8 bytes)                  │  <- incl. header
//! ├─────────────────────────────────────────┤
//! │         Payload                         │  <- references are heap addresses
//! └─────────────────────────────────────────┘
//!
//! The class word is an archive-relative offset, so the heap never needs
//! metadata relocation: a loader resolves it against wherever the core
//! regions ended up. References inside payloads are absolute addresses at
//! `heap_requested_base` and are listed in the per-range oopmaps.
//!
//! Objects are placed in two kinds of ranges:
//! - *closed*: objects that never point outside themselves (interned strings)
//! - *open*: static-field subgraphs and the roots array

mod allocator;
mod restore;
mod subgraph;

pub use allocator::{ArchiveHeapAllocator, BumpArchiveHeap};
pub use restore::{
    ArchivedClass, ClassInitializer, RecordEntry, RestoreOutcome, StaticFieldSink,
    SubgraphRecord, SubgraphRestorer,
};
pub use subgraph::{
    ArchivedHeapRange, HeapArchive, HeapArchiver, SubgraphEntry, SubgraphInfo,
    ROOTS_ARRAY_ENTRIES,
};

use crate::address::{read_word, write_word, ArchiveOffset, HeapAddr};
use crate::error::{ArchiveError, Result};
use std::fmt;

/// Size of the archived object header in bytes
pub const HEAP_HEADER_SIZE: usize = 24;

/// Mark word fields
pub const AGE_SHIFT: usize = 4;
pub const HASH_SHIFT: usize = 8;
pub const LOCK_MASK: u64 = 0b1111;
pub const AGE_MASK: u64 = 0b1111 << AGE_SHIFT;
pub const HASH_MASK: u64 = u64::MAX << HASH_SHIFT;

/// Maximum ranges of one kind the file format holds
pub const MAX_RANGES_PER_KIND: usize = 2;

/// Class word of the roots array, which has no class
pub const ROOTS_ARRAY_CLASS: ArchiveOffset = ArchiveOffset(u64::MAX);

/// Mark word as archived: identity hash kept, lock and age bits stripped
#[inline]
pub fn archived_mark_word(live: u64) -> u64 {
    live & HASH_MASK
}

/// Identity hash stored in a mark word
#[inline]
pub fn identity_hash(mark_word: u64) -> u64 {
    (mark_word & HASH_MASK) >> HASH_SHIFT
}

/// Header of an archived heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchivedObjectHeader {
    pub mark_word: u64,
    pub class: ArchiveOffset,
    /// Total size including header
    pub size: usize,
}

impl ArchivedObjectHeader {
    pub fn new(live_mark_word: u64, class: ArchiveOffset, payload_size: usize) -> Self {
        Self {
            mark_word: archived_mark_word(live_mark_word),
            class,
            size: HEAP_HEADER_SIZE + payload_size,
        }
    }

    pub fn write(&self, bytes: &mut [u8]) {
        write_word(bytes, 0, self.mark_word);
        write_word(bytes, 8, self.class.0);
        write_word(bytes, 16, self.size as u64);
    }

    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEAP_HEADER_SIZE {
            return Err(ArchiveError::BadHeader(format!(
                "heap object needs {HEAP_HEADER_SIZE} header bytes, {} left",
                bytes.len()
            )));
        }
        let header = Self {
            mark_word: read_word(bytes, 0),
            class: ArchiveOffset(read_word(bytes, 8)),
            size: read_word(bytes, 16) as usize,
        };
        if header.size < HEAP_HEADER_SIZE || header.size > bytes.len() {
            return Err(ArchiveError::BadHeader(format!(
                "heap object size {} out of range",
                header.size
            )));
        }
        Ok(header)
    }

    pub fn identity_hash(&self) -> u64 {
        identity_hash(self.mark_word)
    }

    pub fn payload_size(&self) -> usize {
        self.size - HEAP_HEADER_SIZE
    }
}

/// Closed or open heap archive range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapRangeKind {
    Closed,
    Open,
}

impl HeapRangeKind {
    pub fn name(self) -> &'static str {
        match self {
            HeapRangeKind::Closed => "closed",
            HeapRangeKind::Open => "open",
        }
    }
}

impl fmt::Display for HeapRangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Contiguous span handed out by the heap archive allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRange {
    pub kind: HeapRangeKind,
    pub start: HeapAddr,
    pub used: usize,
}

impl HeapRange {
    pub fn end(&self) -> HeapAddr {
        self.start.add(self.used)
    }

    pub fn contains(&self, addr: HeapAddr) -> bool {
        addr >= self.start && addr < self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_word_keeps_hash_only() {
        let live = (0xBEEF << HASH_SHIFT) | 0b0101_0011;
        let archived = archived_mark_word(live);
        assert_eq!(archived & (LOCK_MASK | AGE_MASK), 0);
        assert_eq!(identity_hash(archived), 0xBEEF);
    }

    #[test]
    fn test_header_layout() {
        let header = ArchivedObjectHeader::new(7 << HASH_SHIFT | 1, ArchiveOffset(0x40), 16);
        let mut bytes = [0u8; 40];
        header.write(&mut bytes);
        assert_eq!(read_word(&bytes, 0), 7 << HASH_SHIFT);
        assert_eq!(read_word(&bytes, 8), 0x40);
        assert_eq!(read_word(&bytes, 16), 40);
        assert_eq!(ArchivedObjectHeader::read(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_bad_size() {
        let mut bytes = [0u8; 24];
        write_word(&mut bytes, 16, 4096);
        assert!(ArchivedObjectHeader::read(&bytes).is_err());
    }
}
