//! Heap Archive Allocation
//!
//! The collector hands out archive space in bracketed ranges: every object
//! allocated between `begin_archive_alloc_range` and
//! `end_archive_alloc_range` lands in one or more contiguous, collector-legal
//! spans, returned when the bracket closes.
//!
//! [`BumpArchiveHeap`] is the in-process implementation: bump allocation
//! over one fixed-capacity buffer addressed from the heap requested base.

use super::{HeapRange, HeapRangeKind, HEAP_HEADER_SIZE};
use crate::address::HeapAddr;
use crate::error::{ArchiveError, Result};
use farc_util::align::align_up;

/// Collaborator: garbage-collector archive allocation
pub trait ArchiveHeapAllocator {
    /// Open a bracket; every allocation until `end_archive_alloc_range`
    /// belongs to `kind`
    fn begin_archive_alloc_range(&mut self, kind: HeapRangeKind) -> Result<()>;

    /// Allocate `size` zeroed bytes
    ///
    /// Fails with [`ArchiveError::HeapObjectTooLarge`] or
    /// [`ArchiveError::HeapSpaceExhausted`]; both are recoverable.
    fn archive_mem_allocate(&mut self, size: usize) -> Result<HeapAddr>;

    /// Close the bracket and return the spans it produced, in address order
    fn end_archive_alloc_range(&mut self) -> Result<Vec<HeapRange>>;

    fn bytes(&self, addr: HeapAddr, len: usize) -> Result<&[u8]>;

    fn bytes_mut(&mut self, addr: HeapAddr, len: usize) -> Result<&mut [u8]>;

    /// Final consistency check of the archived ranges
    fn verify(&self) -> Result<()> {
        Ok(())
    }
}

/// Bump allocator over a fixed-capacity archive heap
#[derive(Debug)]
pub struct BumpArchiveHeap {
    base: HeapAddr,
    buffer: Vec<u8>,
    top: usize,
    alignment: usize,
    max_object_size: usize,
    /// Largest span before a new range is started
    range_size: Option<usize>,
    open: Option<HeapRangeKind>,
    ranges: Vec<HeapRange>,
    closed_ranges: Vec<HeapRange>,
}

impl BumpArchiveHeap {
    pub fn new(base: HeapAddr, capacity: usize, max_object_size: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ArchiveError::InvalidArgument(
                "heap archive capacity must be > 0".to_string(),
            ));
        }
        if base.raw() % 8 != 0 {
            return Err(ArchiveError::InvalidArgument(format!(
                "heap base ({base}) must be 8-byte aligned"
            )));
        }
        Ok(Self {
            base,
            buffer: vec![0; capacity],
            top: 0,
            alignment: 8,
            max_object_size,
            range_size: None,
            open: None,
            ranges: Vec::new(),
            closed_ranges: Vec::new(),
        })
    }

    /// Start a new range whenever the current one would exceed `size`
    pub fn with_range_size(mut self, size: usize) -> Self {
        self.range_size = Some(size);
        self
    }

    pub fn base(&self) -> HeapAddr {
        self.base
    }

    pub fn used(&self) -> usize {
        self.top
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Every range closed so far
    pub fn closed_ranges(&self) -> &[HeapRange] {
        &self.closed_ranges
    }

    fn offset_of(&self, addr: HeapAddr, len: usize) -> Result<usize> {
        let offset = addr
            .raw()
            .checked_sub(self.base.raw())
            .map(|o| o as usize)
            .filter(|&o| o.saturating_add(len) <= self.top)
            .ok_or_else(|| {
                ArchiveError::Internal(format!(
                    "heap access of {len} bytes at {addr} is outside the archive heap"
                ))
            })?;
        Ok(offset)
    }
}

impl ArchiveHeapAllocator for BumpArchiveHeap {
    fn begin_archive_alloc_range(&mut self, kind: HeapRangeKind) -> Result<()> {
        if let Some(open) = self.open {
            return Err(ArchiveError::InvalidState {
                expected: "no open heap archive range".to_string(),
                actual: format!("{open} range open"),
            });
        }
        self.open = Some(kind);
        self.ranges.clear();
        Ok(())
    }

    fn archive_mem_allocate(&mut self, size: usize) -> Result<HeapAddr> {
        let kind = self.open.ok_or_else(|| ArchiveError::InvalidState {
            expected: "open heap archive range".to_string(),
            actual: "no range open".to_string(),
        })?;
        let size = align_up(size.max(HEAP_HEADER_SIZE), self.alignment);
        let limit = self.range_size.map_or(self.max_object_size, |r| r.min(self.max_object_size));
        if size > limit {
            return Err(ArchiveError::HeapObjectTooLarge {
                address: 0,
                size,
                limit,
            });
        }
        let available = self.buffer.len() - self.top;
        if size > available {
            return Err(ArchiveError::HeapSpaceExhausted {
                requested: size,
                available,
            });
        }

        let addr = self.base.add(self.top);
        let needs_new_range = match (self.ranges.last(), self.range_size) {
            (None, _) => true,
            (Some(last), Some(range_size)) => last.used + size > range_size,
            (Some(_), None) => false,
        };
        if needs_new_range {
            self.ranges.push(HeapRange {
                kind,
                start: addr,
                used: 0,
            });
        }
        if let Some(last) = self.ranges.last_mut() {
            last.used += size;
        }
        self.top += size;
        Ok(addr)
    }

    fn end_archive_alloc_range(&mut self) -> Result<Vec<HeapRange>> {
        let kind = self.open.take().ok_or_else(|| ArchiveError::InvalidState {
            expected: "open heap archive range".to_string(),
            actual: "no range open".to_string(),
        })?;
        let ranges = std::mem::take(&mut self.ranges);
        log::debug!(
            target: "farc::heap",
            "closed {kind} heap archive bracket: {} ranges",
            ranges.len()
        );
        self.closed_ranges.extend(ranges.iter().copied());
        Ok(ranges)
    }

    fn bytes(&self, addr: HeapAddr, len: usize) -> Result<&[u8]> {
        let offset = self.offset_of(addr, len)?;
        Ok(&self.buffer[offset..offset + len])
    }

    fn bytes_mut(&mut self, addr: HeapAddr, len: usize) -> Result<&mut [u8]> {
        let offset = self.offset_of(addr, len)?;
        Ok(&mut self.buffer[offset..offset + len])
    }

    fn verify(&self) -> Result<()> {
        let mut expected = self.base;
        for range in &self.closed_ranges {
            if range.start != expected {
                return Err(ArchiveError::Internal(format!(
                    "heap archive range at {} does not follow {}",
                    range.start, expected
                )));
            }
            expected = range.end();
        }
        if expected.raw() - self.base.raw() != self.top as u64 {
            return Err(ArchiveError::Internal(
                "heap archive ranges do not cover the allocated space".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap(capacity: usize) -> BumpArchiveHeap {
        BumpArchiveHeap::new(HeapAddr(0x10_0000), capacity, 256).unwrap()
    }

    #[test]
    fn test_bracketed_allocation() {
        let mut heap = heap(1024);
        heap.begin_archive_alloc_range(HeapRangeKind::Closed).unwrap();
        let a = heap.archive_mem_allocate(30).unwrap();
        let b = heap.archive_mem_allocate(24).unwrap();
        assert_eq!(a, HeapAddr(0x10_0000));
        assert_eq!(b, HeapAddr(0x10_0020));
        let ranges = heap.end_archive_alloc_range().unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].used, 56);
        heap.verify().unwrap();
    }

    #[test]
    fn test_allocation_outside_bracket_fails() {
        let mut heap = heap(1024);
        assert!(matches!(
            heap.archive_mem_allocate(24),
            Err(ArchiveError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_failures_are_recoverable_kinds() {
        let mut heap = heap(64);
        heap.begin_archive_alloc_range(HeapRangeKind::Open).unwrap();
        let too_large = heap.archive_mem_allocate(512).unwrap_err();
        assert!(too_large.is_heap_allocation_failure());
        heap.archive_mem_allocate(48).unwrap();
        let exhausted = heap.archive_mem_allocate(24).unwrap_err();
        assert!(matches!(exhausted, ArchiveError::HeapSpaceExhausted { .. }));
    }

    #[test]
    fn test_range_size_splits_ranges() {
        let mut heap = heap(1024).with_range_size(64);
        heap.begin_archive_alloc_range(HeapRangeKind::Open).unwrap();
        for _ in 0..5 {
            heap.archive_mem_allocate(32).unwrap();
        }
        let ranges = heap.end_archive_alloc_range().unwrap();
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[2].start, HeapAddr(0x10_0080));
    }
}
