//! Build Reservation - Anonymous Mapping Backing the Dump Regions
//!
//! The whole build buffer is one anonymous `memmap2` mapping, sized from the
//! capacity estimate and never resized: the read-only region is laid out
//! directly behind the read-write region, so growing the mapping after the
//! first region is packed would move both.

use crate::address::BufferAddr;
use crate::error::{ArchiveError, Result};
use farc_util::align::align_up;
use memmap2::{MmapMut, MmapOptions};

/// Reserved, zero-filled build buffer
pub struct Reservation {
    mmap: MmapMut,
    base: BufferAddr,
    size: usize,
}

impl Reservation {
    /// Reserve `size` bytes, rounded up to `alignment`
    ///
    /// `alignment` must be a power of two and at least the page size for
    /// the base address to be aligned to it.
    pub fn anonymous(size: usize, alignment: usize) -> Result<Self> {
        if size == 0 {
            return Err(ArchiveError::InvalidArgument(
                "reservation size must be > 0".to_string(),
            ));
        }
        if !alignment.is_power_of_two() {
            return Err(ArchiveError::InvalidArgument(format!(
                "alignment ({alignment}) must be a power of two"
            )));
        }
        let aligned_size = align_up(size, alignment.max(page_size::get()));

        let mmap = MmapOptions::new()
            .len(aligned_size)
            .map_anon()
            .map_err(|e| {
                ArchiveError::VirtualMemory(format!(
                    "failed to reserve {aligned_size} bytes for the build buffer: {e}"
                ))
            })?;

        let base = BufferAddr(mmap.as_ptr() as u64);
        Ok(Self {
            mmap,
            base,
            size: aligned_size,
        })
    }

    pub fn base(&self) -> BufferAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> BufferAddr {
        self.base.add(self.size)
    }

    /// Check if address is inside the reservation
    pub fn contains(&self, addr: BufferAddr) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub fn offset_of(&self, addr: BufferAddr) -> Result<usize> {
        if !self.contains(addr) {
            return Err(ArchiveError::Internal(format!(
                "{addr:?} is outside the build reservation"
            )));
        }
        Ok(addr.offset_from(self.base))
    }

    pub fn bytes(&self, addr: BufferAddr, len: usize) -> Result<&[u8]> {
        let offset = self.checked_range(addr, len)?;
        Ok(&self.mmap[offset..offset + len])
    }

    pub fn bytes_mut(&mut self, addr: BufferAddr, len: usize) -> Result<&mut [u8]> {
        let offset = self.checked_range(addr, len)?;
        Ok(&mut self.mmap[offset..offset + len])
    }

    fn checked_range(&self, addr: BufferAddr, len: usize) -> Result<usize> {
        let offset = self.offset_of(addr)?;
        if offset.saturating_add(len) > self.size {
            return Err(ArchiveError::Internal(format!(
                "access of {len} bytes at {addr:?} runs past the build reservation"
            )));
        }
        Ok(offset)
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("base", &self.base)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_is_zeroed_and_page_rounded() {
        let reservation = Reservation::anonymous(100, 8).unwrap();
        assert!(reservation.size() >= page_size::get());
        assert!(reservation.bytes(reservation.base(), 100).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_out_of_range_access_is_rejected() {
        let mut reservation = Reservation::anonymous(4096, 4096).unwrap();
        let end = reservation.end();
        assert!(reservation.bytes_mut(end, 8).is_err());
        let last = reservation.base().add(reservation.size() - 4);
        assert!(reservation.bytes(last, 8).is_err());
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(Reservation::anonymous(0, 4096).is_err());
    }
}
