//! Dump Regions - Bump Allocation Inside the Reservation
//!
//! A region is a `[base, top, end)` window of the build reservation with a
//! monotonically advancing `top`. Addresses handed out are strictly
//! increasing; nothing is ever freed.
//!
//! ```text
//! reservation
//! ├── rw  [base ........ top)          packed: top frozen, aligned
//! └── ro                 [base ... top ............ end)
//! ```

use crate::address::BufferAddr;
use crate::error::{ArchiveError, Result};
use farc_util::align::align_up;

/// One bump-allocated region of the build buffer
#[derive(Debug, Clone)]
pub struct DumpRegion {
    name: &'static str,
    base: BufferAddr,
    top: BufferAddr,
    end: BufferAddr,
    initialized: bool,
    packed: bool,
}

impl DumpRegion {
    /// Region that has not been placed yet
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            base: BufferAddr::NULL,
            top: BufferAddr::NULL,
            end: BufferAddr::NULL,
            initialized: false,
            packed: false,
        }
    }

    /// Place the region at `[base, end)`
    pub fn init(&mut self, base: BufferAddr, end: BufferAddr) -> Result<()> {
        if self.initialized {
            return Err(ArchiveError::InvalidState {
                expected: format!("{} region unplaced", self.name),
                actual: "already placed".to_string(),
            });
        }
        if base > end {
            return Err(ArchiveError::InvalidArgument(format!(
                "{} region base {base:?} above end {end:?}",
                self.name
            )));
        }
        self.base = base;
        self.top = base;
        self.end = end;
        self.initialized = true;
        Ok(())
    }

    /// Bump-allocate `size` bytes rounded to `alignment`
    ///
    /// Returns the previous top. Running past `end` is a
    /// [`ArchiveError::RegionOverflow`]: capacity was estimated up front and
    /// the region cannot grow.
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Result<BufferAddr> {
        if !self.initialized {
            return Err(ArchiveError::InvalidState {
                expected: format!("{} region placed", self.name),
                actual: "unplaced".to_string(),
            });
        }
        if self.packed {
            return Err(ArchiveError::RegionPacked { region: self.name });
        }

        let aligned_size = align_up(size, alignment);
        let available = self.end.offset_from(self.top);
        if aligned_size > available {
            return Err(ArchiveError::RegionOverflow {
                region: self.name,
                requested: aligned_size,
                available,
            });
        }

        let result = self.top;
        self.top = self.top.add(aligned_size);
        Ok(result)
    }

    /// Freeze the region, rounding its size up to `alignment`
    ///
    /// When `next` is given it is placed directly behind this region and
    /// inherits the rest of the reservation.
    pub fn pack(&mut self, next: Option<&mut DumpRegion>, alignment: usize) -> Result<()> {
        if self.packed {
            return Err(ArchiveError::RegionPacked { region: self.name });
        }
        let used = align_up(self.used(), alignment);
        if used > self.capacity() {
            return Err(ArchiveError::RegionOverflow {
                region: self.name,
                requested: used,
                available: self.capacity(),
            });
        }
        // Padding is part of the region; it is zero in a fresh reservation
        self.top = self.base.add(used);
        self.packed = true;

        if let Some(next) = next {
            let end = self.end;
            self.end = self.top;
            next.init(self.top, end)?;
        }
        log::debug!(
            target: "farc::builder",
            "packed {} region: {:?}..{:?} ({} bytes)",
            self.name,
            self.base,
            self.top,
            self.used()
        );
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn base(&self) -> BufferAddr {
        self.base
    }

    pub fn top(&self) -> BufferAddr {
        self.top
    }

    pub fn end(&self) -> BufferAddr {
        self.end
    }

    pub fn used(&self) -> usize {
        self.top.offset_from(self.base)
    }

    pub fn capacity(&self) -> usize {
        self.end.offset_from(self.base)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_packed(&self) -> bool {
        self.packed
    }

    /// Check if address lies in the allocated part of the region
    pub fn contains(&self, addr: BufferAddr) -> bool {
        self.initialized && addr >= self.base && addr < self.top
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(size: u64) -> DumpRegion {
        let mut region = DumpRegion::new("rw");
        region.init(BufferAddr(0x1000), BufferAddr(0x1000 + size)).unwrap();
        region
    }

    #[test]
    fn test_allocation_is_strictly_increasing() {
        let mut rw = region(256);
        let a = rw.allocate(10, 8).unwrap();
        let b = rw.allocate(8, 8).unwrap();
        assert_eq!(a, BufferAddr(0x1000));
        assert_eq!(b, BufferAddr(0x1010));
        assert_eq!(rw.used(), 24);
        assert!(rw.contains(b));
        assert!(!rw.contains(rw.top()));
    }

    #[test]
    fn test_overflow_is_typed() {
        let mut rw = region(16);
        rw.allocate(16, 8).unwrap();
        match rw.allocate(1, 8) {
            Err(ArchiveError::RegionOverflow { region, available, .. }) => {
                assert_eq!(region, "rw");
                assert_eq!(available, 0);
            },
            other => panic!("expected overflow, got {other:?}"),
        }
    }

    #[test]
    fn test_pack_places_next_region_behind() {
        let mut rw = region(0x3000);
        let mut ro = DumpRegion::new("ro");
        rw.allocate(24, 8).unwrap();
        rw.pack(Some(&mut ro), 0x1000).unwrap();

        assert_eq!(rw.used(), 0x1000);
        assert_eq!(ro.base(), BufferAddr(0x2000));
        assert_eq!(ro.end(), BufferAddr(0x4000));
        assert!(matches!(
            rw.allocate(8, 8),
            Err(ArchiveError::RegionPacked { region: "rw" })
        ));
        assert_eq!(ro.allocate(8, 8).unwrap(), BufferAddr(0x2000));
    }

    #[test]
    fn test_unplaced_region_refuses_allocation() {
        let mut ro = DumpRegion::new("ro");
        assert!(matches!(ro.allocate(8, 8), Err(ArchiveError::InvalidState { .. })));
    }
}
