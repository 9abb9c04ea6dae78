//! Space Module - Region Allocator and Pointer Bitmap
//!
//! [`DumpSpace`] is the build buffer of one archive session: a single
//! reservation holding the read-write region followed by the read-only
//! region, plus the pointer bitmap covering both.
//!
//! ```text
//! base                                                   base + reserve
//! ├────────── rw ──────────┼────────── ro ──────────┼........ unused ...┤
//!   bit 0 ................................ bit (ro.top - base) / 8
//! ```
//!
//! The space is owned by the build session and passed by `&mut` to every
//! component that allocates or marks pointers, so two builds can never share
//! one bitmap.

mod ptrmap;
mod region;
mod reservation;

pub use ptrmap::{PtrMap, SetBits};
pub use region::DumpRegion;
pub use reservation::Reservation;

use crate::address::{read_word, write_word, BufferAddr};
use crate::error::{ArchiveError, Result};
use farc_util::WORD_SIZE;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The two core regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RegionKind {
    ReadWrite,
    ReadOnly,
}

impl RegionKind {
    pub fn name(self) -> &'static str {
        match self {
            RegionKind::ReadWrite => "rw",
            RegionKind::ReadOnly => "ro",
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Build buffer of one archive session
#[derive(Debug)]
pub struct DumpSpace {
    reservation: Reservation,
    rw: DumpRegion,
    ro: DumpRegion,
    ptrmap: PtrMap,
    core_region_alignment: usize,
    object_alignment: usize,
}

impl DumpSpace {
    /// Reserve `capacity` bytes; the read-write region spans all of it
    /// until it is packed
    pub fn reserve(
        capacity: usize,
        core_region_alignment: usize,
        object_alignment: usize,
    ) -> Result<Self> {
        if !object_alignment.is_power_of_two() || object_alignment < WORD_SIZE {
            return Err(ArchiveError::Configuration(format!(
                "object alignment ({object_alignment}) must be a power of two >= {WORD_SIZE}"
            )));
        }
        let reservation = Reservation::anonymous(capacity, core_region_alignment)?;
        let mut rw = DumpRegion::new("rw");
        rw.init(reservation.base(), reservation.end())?;

        log::debug!(
            target: "farc::builder",
            "reserved {} bytes at {:?} for the build buffer",
            reservation.size(),
            reservation.base()
        );

        Ok(Self {
            reservation,
            rw,
            ro: DumpRegion::new("ro"),
            ptrmap: PtrMap::new(),
            core_region_alignment,
            object_alignment,
        })
    }

    /// Allocate an object-aligned block in `region`
    ///
    /// The bitmap grows with the region so every allocated slot can be
    /// marked.
    pub fn allocate(&mut self, region: RegionKind, size: usize) -> Result<BufferAddr> {
        let alignment = self.object_alignment;
        let addr = self.region_mut(region).allocate(size, alignment)?;
        let top = self.region(region).top();
        self.ptrmap
            .resize(top.offset_from(self.reservation.base()) / WORD_SIZE)?;
        Ok(addr)
    }

    /// Allocate and fill a block
    pub fn allocate_bytes(&mut self, region: RegionKind, bytes: &[u8]) -> Result<BufferAddr> {
        let addr = self.allocate(region, bytes.len())?;
        self.reservation
            .bytes_mut(addr, bytes.len())?
            .copy_from_slice(bytes);
        Ok(addr)
    }

    /// Pack the read-write region and open the read-only region behind it
    pub fn pack_rw(&mut self) -> Result<()> {
        let alignment = self.core_region_alignment;
        self.rw.pack(Some(&mut self.ro), alignment)
    }

    pub fn pack_ro(&mut self) -> Result<()> {
        let alignment = self.core_region_alignment;
        self.ro.pack(None, alignment)?;
        let top = self.ro.top();
        self.ptrmap
            .resize(top.offset_from(self.reservation.base()) / WORD_SIZE)
    }

    pub fn region(&self, kind: RegionKind) -> &DumpRegion {
        match kind {
            RegionKind::ReadWrite => &self.rw,
            RegionKind::ReadOnly => &self.ro,
        }
    }

    fn region_mut(&mut self, kind: RegionKind) -> &mut DumpRegion {
        match kind {
            RegionKind::ReadWrite => &mut self.rw,
            RegionKind::ReadOnly => &mut self.ro,
        }
    }

    /// Start of the buffer; offset 0 of the archive
    pub fn base(&self) -> BufferAddr {
        self.reservation.base()
    }

    /// End of the last allocated byte
    pub fn top(&self) -> BufferAddr {
        if self.ro.is_initialized() {
            self.ro.top()
        } else {
            self.rw.top()
        }
    }

    pub fn reserved(&self) -> usize {
        self.reservation.size()
    }

    pub fn used(&self) -> usize {
        self.top().offset_from(self.base())
    }

    /// Check if `addr` lies in an allocated part of either region
    pub fn contains(&self, addr: BufferAddr) -> bool {
        self.rw.contains(addr) || self.ro.contains(addr)
    }

    pub fn core_region_alignment(&self) -> usize {
        self.core_region_alignment
    }

    pub fn object_alignment(&self) -> usize {
        self.object_alignment
    }

    pub fn bytes(&self, addr: BufferAddr, len: usize) -> Result<&[u8]> {
        self.reservation.bytes(addr, len)
    }

    pub fn bytes_mut(&mut self, addr: BufferAddr, len: usize) -> Result<&mut [u8]> {
        self.reservation.bytes_mut(addr, len)
    }

    /// Bytes of a whole region, including pack padding
    pub fn region_bytes(&self, kind: RegionKind) -> Result<&[u8]> {
        let region = self.region(kind);
        self.reservation.bytes(region.base(), region.used())
    }

    pub fn read_word(&self, slot: BufferAddr) -> Result<u64> {
        Ok(read_word(self.bytes(slot, WORD_SIZE)?, 0))
    }

    pub fn write_word(&mut self, slot: BufferAddr, value: u64) -> Result<()> {
        write_word(self.bytes_mut(slot, WORD_SIZE)?, 0, value);
        Ok(())
    }

    /// Store a buffer pointer into `slot` and mark the slot
    pub fn write_pointer(&mut self, slot: BufferAddr, target: BufferAddr) -> Result<()> {
        self.write_word(slot, target.raw())?;
        self.mark_pointer(slot)
    }

    /// Bitmap index of a slot
    pub fn slot_index(&self, slot: BufferAddr) -> Result<usize> {
        let offset = self.reservation.offset_of(slot)?;
        if offset % WORD_SIZE != 0 {
            return Err(ArchiveError::Internal(format!(
                "pointer slot {slot:?} is not word aligned"
            )));
        }
        Ok(offset / WORD_SIZE)
    }

    /// Address of the slot a bitmap index stands for
    pub fn slot_address(&self, bit: usize) -> BufferAddr {
        self.base().add(bit * WORD_SIZE)
    }

    pub fn mark_pointer(&mut self, slot: BufferAddr) -> Result<()> {
        if !self.contains(slot) {
            return Err(ArchiveError::Internal(format!(
                "pointer slot {slot:?} is outside the allocated regions"
            )));
        }
        let bit = self.slot_index(slot)?;
        self.ptrmap.mark(bit)
    }

    pub fn clear_pointer(&mut self, slot: BufferAddr) -> Result<()> {
        let bit = self.slot_index(slot)?;
        self.ptrmap.clear(bit)
    }

    pub fn ptrmap(&self) -> &PtrMap {
        &self.ptrmap
    }

    pub fn ptrmap_mut(&mut self) -> &mut PtrMap {
        &mut self.ptrmap
    }
}
