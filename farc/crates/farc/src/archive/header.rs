//! Archive Header
//!
//! Fixed-size, little-endian, checksummed. Layout (464 bytes):
//!
//! ```text
//!   0  magic                     u32
//!   4  crc                       u32   Adler-32 of bytes [8, 464)
//!   8  version                   u32
//!  12  header_size               u32
//!  16  core_region_alignment     u64
//!  24  object_alignment          u32
//!  28  flags                     u32
//!  32  producer_ident            [u8; 32], NUL padded
//!  64  requested_base_address    u64
//!  72  mapped_base_address       u64
//!  80  ptrmap_size_in_bits       u64
//!  88  cloned_vtables_offset     u64
//!  96  serialized_data_offset    u64
//! 104  heap_requested_base       u64
//! 112  heap_roots_offset         u64
//! 120  base_archive_name_size    u32
//! 124  base_archive_crc          u32
//! 128  regions                   7 x 48-byte region record
//! ```
//!
//! Once [`ArchiveHeader::finalize`] has computed the checksum the header is
//! frozen: every mutator returns [`ArchiveError::InvalidState`].

use crate::error::{ArchiveError, Result};
use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Cursor, Read, Write};

pub const STATIC_MAGIC: u32 = 0xf00b_aba2;
pub const DYNAMIC_MAGIC: u32 = 0xf00b_aba8;
pub const ARCHIVE_VERSION: u32 = 1;

pub const PRODUCER_IDENT_LEN: usize = 32;
pub const REGION_RECORD_SIZE: usize = 48;
pub const NUM_REGIONS: usize = 7;
/// Bytes before the region records
pub const FIXED_HEADER_SIZE: usize = 128;
pub const HEADER_SIZE: usize = FIXED_HEADER_SIZE + NUM_REGIONS * REGION_RECORD_SIZE;

/// First byte covered by the header checksum
const CRC_START: usize = 8;

/// Header flag bits
pub mod flags {
    pub const HAS_HEAP: u32 = 1 << 0;
    pub const DYNAMIC: u32 = 1 << 1;
}

/// Slot of a region in the header, in file order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionIndex {
    ReadWrite,
    ReadOnly,
    Bitmap,
    Closed0,
    Closed1,
    Open0,
    Open1,
}

impl RegionIndex {
    pub const ALL: [RegionIndex; NUM_REGIONS] = [
        RegionIndex::ReadWrite,
        RegionIndex::ReadOnly,
        RegionIndex::Bitmap,
        RegionIndex::Closed0,
        RegionIndex::Closed1,
        RegionIndex::Open0,
        RegionIndex::Open1,
    ];

    pub const HEAP: [RegionIndex; 4] = [
        RegionIndex::Closed0,
        RegionIndex::Closed1,
        RegionIndex::Open0,
        RegionIndex::Open1,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            RegionIndex::ReadWrite => "rw",
            RegionIndex::ReadOnly => "ro",
            RegionIndex::Bitmap => "bm",
            RegionIndex::Closed0 => "closed0",
            RegionIndex::Closed1 => "closed1",
            RegionIndex::Open0 => "open0",
            RegionIndex::Open1 => "open1",
        }
    }

    pub fn is_heap(self) -> bool {
        Self::HEAP.contains(&self)
    }
}

impl fmt::Display for RegionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Placement of one region in the file and in memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionRecord {
    pub file_offset: u64,
    /// Offset from the archive base (core regions) or heap base (heap regions)
    pub mapping_offset: u64,
    pub used: u64,
    pub read_only: bool,
    pub allow_exec: bool,
    pub crc: u32,
    /// Heap regions: byte offset of the oopmap inside the bitmap region
    pub oopmap_offset: u64,
    pub oopmap_size_in_bits: u64,
}

impl RegionRecord {
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// First file byte past the region
    pub fn file_end(&self) -> u64 {
        self.file_offset + self.used
    }

    fn encode(&self, out: &mut impl Write) -> std::io::Result<()> {
        out.write_u64::<LE>(self.file_offset)?;
        out.write_u64::<LE>(self.mapping_offset)?;
        out.write_u64::<LE>(self.used)?;
        out.write_u8(self.read_only as u8)?;
        out.write_u8(self.allow_exec as u8)?;
        out.write_all(&[0; 2])?;
        out.write_u32::<LE>(self.crc)?;
        out.write_u64::<LE>(self.oopmap_offset)?;
        out.write_u64::<LE>(self.oopmap_size_in_bits)
    }

    fn decode(input: &mut impl Read) -> std::io::Result<Self> {
        let file_offset = input.read_u64::<LE>()?;
        let mapping_offset = input.read_u64::<LE>()?;
        let used = input.read_u64::<LE>()?;
        let read_only = input.read_u8()? != 0;
        let allow_exec = input.read_u8()? != 0;
        let mut pad = [0; 2];
        input.read_exact(&mut pad)?;
        Ok(Self {
            file_offset,
            mapping_offset,
            used,
            read_only,
            allow_exec,
            crc: input.read_u32::<LE>()?,
            oopmap_offset: input.read_u64::<LE>()?,
            oopmap_size_in_bits: input.read_u64::<LE>()?,
        })
    }
}

/// Every persisted header field except magic and checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderFields {
    pub core_region_alignment: u64,
    pub object_alignment: u32,
    pub flags: u32,
    pub producer_ident: String,
    pub requested_base_address: u64,
    pub mapped_base_address: u64,
    pub ptrmap_size_in_bits: u64,
    pub cloned_vtables_offset: u64,
    pub serialized_data_offset: u64,
    pub heap_requested_base: u64,
    pub heap_roots_offset: u64,
    pub base_archive_name_size: u32,
    pub base_archive_crc: u32,
    pub regions: [RegionRecord; NUM_REGIONS],
}

impl HeaderFields {
    pub fn new(producer_ident: &str) -> Self {
        Self {
            core_region_alignment: 0,
            object_alignment: 0,
            flags: 0,
            producer_ident: producer_ident.to_string(),
            requested_base_address: 0,
            mapped_base_address: 0,
            ptrmap_size_in_bits: 0,
            cloned_vtables_offset: 0,
            serialized_data_offset: 0,
            heap_requested_base: 0,
            heap_roots_offset: 0,
            base_archive_name_size: 0,
            base_archive_crc: 0,
            regions: [RegionRecord::default(); NUM_REGIONS],
        }
    }
}

/// Archive file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHeader {
    magic: u32,
    crc: u32,
    version: u32,
    fields: HeaderFields,
    finalized: bool,
}

impl ArchiveHeader {
    pub fn new(dynamic: bool, fields: HeaderFields) -> Self {
        let mut fields = fields;
        if dynamic {
            fields.flags |= flags::DYNAMIC;
        }
        Self {
            magic: if dynamic { DYNAMIC_MAGIC } else { STATIC_MAGIC },
            crc: 0,
            version: ARCHIVE_VERSION,
            fields,
            finalized: false,
        }
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn fields(&self) -> &HeaderFields {
        &self.fields
    }

    /// Mutable fields; refused once the checksum is computed
    pub fn fields_mut(&mut self) -> Result<&mut HeaderFields> {
        if self.finalized {
            return Err(ArchiveError::InvalidState {
                expected: "header under construction".to_string(),
                actual: "finalized header".to_string(),
            });
        }
        Ok(&mut self.fields)
    }

    pub fn set_region(&mut self, index: RegionIndex, record: RegionRecord) -> Result<()> {
        self.fields_mut()?.regions[index.index()] = record;
        Ok(())
    }

    pub fn region(&self, index: RegionIndex) -> &RegionRecord {
        &self.fields.regions[index.index()]
    }

    pub fn is_dynamic(&self) -> bool {
        self.magic == DYNAMIC_MAGIC
    }

    pub fn has_heap(&self) -> bool {
        self.fields.flags & flags::HAS_HEAP != 0
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Core image size: rw plus ro
    pub fn core_size(&self) -> u64 {
        self.region(RegionIndex::ReadWrite).used + self.region(RegionIndex::ReadOnly).used
    }

    /// Compute the checksum and freeze the header
    pub fn finalize(&mut self) -> Result<u32> {
        if self.finalized {
            return Err(ArchiveError::InvalidState {
                expected: "header under construction".to_string(),
                actual: "finalized header".to_string(),
            });
        }
        let bytes = self.encode_raw()?;
        self.crc = adler::adler32_slice(&bytes[CRC_START..]);
        self.finalized = true;
        Ok(self.crc)
    }

    /// Encode a finalized header
    pub fn encode(&self) -> Result<Vec<u8>> {
        if !self.finalized {
            return Err(ArchiveError::InvalidState {
                expected: "finalized header".to_string(),
                actual: "header without checksum".to_string(),
            });
        }
        self.encode_raw()
    }

    fn encode_raw(&self) -> Result<Vec<u8>> {
        let f = &self.fields;
        let ident = f.producer_ident.as_bytes();
        if ident.is_empty() || ident.len() >= PRODUCER_IDENT_LEN {
            return Err(ArchiveError::InvalidArgument(format!(
                "producer ident '{}' must be 1-{} bytes",
                f.producer_ident,
                PRODUCER_IDENT_LEN - 1
            )));
        }

        let mut out = Vec::with_capacity(HEADER_SIZE);
        out.write_u32::<LE>(self.magic)?;
        out.write_u32::<LE>(self.crc)?;
        out.write_u32::<LE>(self.version)?;
        out.write_u32::<LE>(HEADER_SIZE as u32)?;
        out.write_u64::<LE>(f.core_region_alignment)?;
        out.write_u32::<LE>(f.object_alignment)?;
        out.write_u32::<LE>(f.flags)?;
        let mut ident_bytes = [0u8; PRODUCER_IDENT_LEN];
        ident_bytes[..ident.len()].copy_from_slice(ident);
        out.write_all(&ident_bytes)?;
        for word in [
            f.requested_base_address,
            f.mapped_base_address,
            f.ptrmap_size_in_bits,
            f.cloned_vtables_offset,
            f.serialized_data_offset,
            f.heap_requested_base,
            f.heap_roots_offset,
        ] {
            out.write_u64::<LE>(word)?;
        }
        out.write_u32::<LE>(f.base_archive_name_size)?;
        out.write_u32::<LE>(f.base_archive_crc)?;
        for region in &f.regions {
            region.encode(&mut out)?;
        }
        debug_assert_eq!(out.len(), HEADER_SIZE);
        Ok(out)
    }

    /// Decode and validate magic, version, size and checksum
    ///
    /// The result is finalized.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ArchiveError::Truncated {
                region: "header",
                needed: HEADER_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }
        let bytes = &bytes[..HEADER_SIZE];
        let mut input = Cursor::new(bytes);

        let magic = input.read_u32::<LE>()?;
        if magic != STATIC_MAGIC && magic != DYNAMIC_MAGIC {
            return Err(ArchiveError::BadHeader(format!("bad magic {magic:#010x}")));
        }
        let crc = input.read_u32::<LE>()?;
        let version = input.read_u32::<LE>()?;
        if version != ARCHIVE_VERSION {
            return Err(ArchiveError::BadHeader(format!(
                "version {version}, expected {ARCHIVE_VERSION}"
            )));
        }
        let header_size = input.read_u32::<LE>()?;
        if header_size as usize != HEADER_SIZE {
            return Err(ArchiveError::BadHeader(format!(
                "header size {header_size}, expected {HEADER_SIZE}"
            )));
        }
        let actual = adler::adler32_slice(&bytes[CRC_START..]);
        if actual != crc {
            return Err(ArchiveError::ChecksumMismatch {
                what: "header".to_string(),
                expected: crc,
                actual,
            });
        }

        let core_region_alignment = input.read_u64::<LE>()?;
        let object_alignment = input.read_u32::<LE>()?;
        let flags = input.read_u32::<LE>()?;
        let mut ident = [0u8; PRODUCER_IDENT_LEN];
        input.read_exact(&mut ident)?;
        let ident_len = ident.iter().position(|&b| b == 0).unwrap_or(PRODUCER_IDENT_LEN);
        let producer_ident = std::str::from_utf8(&ident[..ident_len])
            .map_err(|_| ArchiveError::BadHeader("producer ident is not utf-8".to_string()))?
            .to_string();

        let mut fields = HeaderFields {
            core_region_alignment,
            object_alignment,
            flags,
            producer_ident,
            requested_base_address: input.read_u64::<LE>()?,
            mapped_base_address: input.read_u64::<LE>()?,
            ptrmap_size_in_bits: input.read_u64::<LE>()?,
            cloned_vtables_offset: input.read_u64::<LE>()?,
            serialized_data_offset: input.read_u64::<LE>()?,
            heap_requested_base: input.read_u64::<LE>()?,
            heap_roots_offset: input.read_u64::<LE>()?,
            base_archive_name_size: input.read_u32::<LE>()?,
            base_archive_crc: input.read_u32::<LE>()?,
            regions: [RegionRecord::default(); NUM_REGIONS],
        };
        for region in fields.regions.iter_mut() {
            *region = RegionRecord::decode(&mut input)?;
        }

        if (magic == DYNAMIC_MAGIC) != (fields.flags & flags::DYNAMIC != 0) {
            return Err(ArchiveError::BadHeader(
                "dynamic flag disagrees with magic".to_string(),
            ));
        }
        if !core_region_alignment.is_power_of_two() {
            return Err(ArchiveError::BadHeader(format!(
                "core region alignment {core_region_alignment:#x} is not a power of two"
            )));
        }

        Ok(Self {
            magic,
            crc,
            version,
            fields,
            finalized: true,
        })
    }
}

impl fmt::Display for ArchiveHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.fields;
        writeln!(f, "magic:                   {:#010x} ({})", self.magic, if self.is_dynamic() { "dynamic" } else { "static" })?;
        writeln!(f, "crc:                     {:#010x}", self.crc)?;
        writeln!(f, "version:                 {}", self.version)?;
        writeln!(f, "producer:                {}", h.producer_ident)?;
        writeln!(f, "core_region_alignment:   {:#x}", h.core_region_alignment)?;
        writeln!(f, "object_alignment:        {}", h.object_alignment)?;
        writeln!(f, "flags:                   {:#x}", h.flags)?;
        writeln!(f, "requested_base_address:  {:#x}", h.requested_base_address)?;
        writeln!(f, "mapped_base_address:     {:#x}", h.mapped_base_address)?;
        writeln!(f, "ptrmap_size_in_bits:     {}", h.ptrmap_size_in_bits)?;
        writeln!(f, "cloned_vtables_offset:   {:#x}", h.cloned_vtables_offset)?;
        writeln!(f, "serialized_data_offset:  {:#x}", h.serialized_data_offset)?;
        if self.has_heap() {
            writeln!(f, "heap_requested_base:     {:#x}", h.heap_requested_base)?;
            writeln!(f, "heap_roots_offset:       {:#x}", h.heap_roots_offset)?;
        }
        if self.is_dynamic() {
            writeln!(f, "base_archive_name_size:  {}", h.base_archive_name_size)?;
            writeln!(f, "base_archive_crc:        {:#010x}", h.base_archive_crc)?;
        }
        writeln!(f, "regions:")?;
        for index in RegionIndex::ALL {
            let r = self.region(index);
            if r.is_empty() {
                continue;
            }
            write!(
                f,
                "  {:<8} file {:#010x}  map +{:#010x}  used {:>10}  {}  crc {:#010x}",
                index.name(),
                r.file_offset,
                r.mapping_offset,
                r.used,
                if r.read_only { "ro" } else { "rw" },
                r.crc
            )?;
            if index.is_heap() {
                write!(f, "  oopmap +{:#x} ({} bits)", r.oopmap_offset, r.oopmap_size_in_bits)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> ArchiveHeader {
        let mut fields = HeaderFields::new("farc-test");
        fields.core_region_alignment = 4096;
        fields.object_alignment = 8;
        fields.requested_base_address = 0x8_0000_0000;
        fields.mapped_base_address = 0x8_0000_0000;
        fields.regions[0] = RegionRecord {
            file_offset: 4096,
            used: 8192,
            crc: 77,
            ..Default::default()
        };
        ArchiveHeader::new(false, fields)
    }

    #[test]
    fn test_header_size_is_fixed() {
        assert_eq!(HEADER_SIZE, 464);
        let mut h = header();
        h.finalize().unwrap();
        assert_eq!(h.encode().unwrap().len(), HEADER_SIZE);
    }

    #[test]
    fn test_decode_reads_back_fields() {
        let mut h = header();
        h.finalize().unwrap();
        let decoded = ArchiveHeader::decode(&h.encode().unwrap()).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(decoded.region(RegionIndex::ReadWrite).used, 8192);
    }

    #[test]
    fn test_finalized_header_is_frozen() {
        let mut h = header();
        h.finalize().unwrap();
        assert!(matches!(h.fields_mut(), Err(ArchiveError::InvalidState { .. })));
        assert!(h
            .set_region(RegionIndex::ReadOnly, RegionRecord::default())
            .is_err());
        assert!(h.finalize().is_err());
    }

    #[test]
    fn test_unfinalized_header_not_encoded() {
        assert!(header().encode().is_err());
    }

    #[test]
    fn test_any_flipped_byte_fails_checksum() {
        let mut h = header();
        h.finalize().unwrap();
        let mut bytes = h.encode().unwrap();
        bytes[100] ^= 0x40;
        assert!(matches!(
            ArchiveHeader::decode(&bytes),
            Err(ArchiveError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_magic_and_short_input() {
        let mut h = header();
        h.finalize().unwrap();
        let mut bytes = h.encode().unwrap();
        assert!(matches!(
            ArchiveHeader::decode(&bytes[..100]),
            Err(ArchiveError::Truncated { .. })
        ));
        bytes[0] = 0;
        assert!(matches!(ArchiveHeader::decode(&bytes), Err(ArchiveError::BadHeader(_))));
    }

    #[test]
    fn test_dynamic_header_sets_flag() {
        let h = ArchiveHeader::new(true, HeaderFields::new("farc-test"));
        assert!(h.is_dynamic());
        assert_ne!(h.fields().flags & flags::DYNAMIC, 0);
    }
}
