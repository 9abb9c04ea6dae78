//! Typed Addresses
//!
//! Four address spaces meet during a build and a load, and mixing them up is
//! the classic archive bug (dereferencing a pre-relocation address, or
//! writing a buffer address into a file). Each gets its own type:
//!
//! ```text
//! SourceAddr     live object in the running process (identity key, never persisted)
//! BufferAddr     transient copy inside the build reservation
//! RequestedAddr  where the archive is designed to be mapped
//! ArchiveOffset  displacement from the archive base; becomes an address
//!                only once a base is known
//! ```
//!
//! Raw `u64` values only ever appear as little-endian words inside region
//! bytes.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! address_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub const NULL: Self = Self(0);

            #[inline]
            pub const fn raw(self) -> u64 {
                self.0
            }

            #[inline]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

address_type!(
    /// Address of a live object in the process being archived
    SourceAddr
);
address_type!(
    /// Address inside the build reservation
    BufferAddr
);
address_type!(
    /// Address the archive is designed to be mapped at
    RequestedAddr
);
address_type!(
    /// Address of an object inside the archived heap regions
    HeapAddr
);

impl BufferAddr {
    /// Byte offset of this address from `base`
    #[inline]
    pub fn offset_from(self, base: BufferAddr) -> usize {
        debug_assert!(self.0 >= base.0, "{self:?} below {base:?}");
        (self.0 - base.0) as usize
    }

    #[inline]
    pub fn add(self, bytes: usize) -> BufferAddr {
        BufferAddr(self.0 + bytes as u64)
    }
}

impl HeapAddr {
    #[inline]
    pub fn add(self, bytes: usize) -> HeapAddr {
        HeapAddr(self.0 + bytes as u64)
    }
}

/// Archive-relative displacement
///
/// Offsets are what the loader hands out: they are only turned into an
/// address against the base the archive was actually mapped at.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiveOffset(pub u64);

impl ArchiveOffset {
    #[inline]
    pub const fn new(offset: usize) -> Self {
        Self(offset as u64)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Resolve against a mapped base
    #[inline]
    pub const fn at(self, base: u64) -> u64 {
        base + self.0
    }

    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

impl fmt::Debug for ArchiveOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchiveOffset(+{:#x})", self.0)
    }
}

impl fmt::Display for ArchiveOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{:#x}", self.0)
    }
}

/// Read a little-endian pointer word
#[inline]
pub(crate) fn read_word(bytes: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(word)
}

/// Write a little-endian pointer word
#[inline]
pub(crate) fn write_word(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_offsets() {
        let base = BufferAddr(0x7f00_0000_0000);
        let slot = base.add(0x48);
        assert_eq!(slot.offset_from(base), 0x48);
    }

    #[test]
    fn test_archive_offset_resolves_against_base() {
        let off = ArchiveOffset::new(0x100);
        assert_eq!(off.at(0x8_0000_0000), 0x8_0000_0100);
        assert_eq!(off.add(8).as_usize(), 0x108);
    }

    #[test]
    fn test_word_codec_little_endian() {
        let mut bytes = [0u8; 16];
        write_word(&mut bytes, 8, 0x0102_0304_0506_0708);
        assert_eq!(bytes[8], 0x08);
        assert_eq!(read_word(&bytes, 8), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_debug_is_hex() {
        assert_eq!(format!("{:?}", SourceAddr(0x10)), "SourceAddr(0x10)");
        assert!(RequestedAddr::NULL.is_null());
    }
}
