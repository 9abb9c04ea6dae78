//! Archive Loader
//!
//! Opening validates everything that can be checked without mapping:
//! magic, version, header size, producer, header checksum, truncation, and
//! (optionally) every region checksum. Mapping then copies rw+ro into one
//! anonymous mapping and, when the actual base differs from the requested
//! base, walks the decoded bitmap a second time:
//!
//! ```text
//! for each set bit:   old in [requested, requested + size)  -> old + (actual - requested)
//!                     old in base archive requested range   -> old + (base mapped - base requested)
//!                     anything else                         -> PointerOutOfRange
//! ```
//!
//! No archive that failed a check is ever handed out.
//!
//! The core regions always land in an OS-chosen anonymous mapping (or at a
//! caller-supplied `relocate_to`). `memmap2` cannot request a fixed address,
//! so the requested base is never attempted and an unrelocated load only
//! happens when `relocate_to` names the requested base.

use super::header::{ArchiveHeader, RegionIndex, HEADER_SIZE};
use super::tables::{self, RECORD_HEADER_WORDS, TABLE_HEADER_WORDS};
use crate::address::{read_word, write_word, ArchiveOffset};
use crate::builder::BaseArchive;
use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, Result};
use crate::heap::{
    ArchivedClass, ArchivedObjectHeader, RecordEntry, SubgraphRecord, SubgraphRestorer,
    HEAP_HEADER_SIZE, ROOTS_ARRAY_CLASS, ROOTS_ARRAY_ENTRIES,
};
use crate::space::PtrMap;
use crate::vtable::{splice_slot, LiveVtables, VtableKind, NUM_VTABLE_KINDS};
use farc_util::{FxHashMap, WORD_SIZE};
use memmap2::{MmapMut, MmapOptions};
use std::path::{Path, PathBuf};

/// A validated archive file held in memory
#[derive(Debug)]
pub struct ArchiveFile {
    path: PathBuf,
    header: ArchiveHeader,
    base_archive_name: Option<String>,
    data: Vec<u8>,
}

impl ArchiveFile {
    /// Read and validate `path`
    pub fn open(path: &Path, config: &ArchiveConfig) -> Result<Self> {
        let data = std::fs::read(path)?;
        let file = Self::from_bytes(path, data, config)?;
        log::debug!(
            target: "farc::loader",
            "opened {} ({} archive, {} bytes)",
            path.display(),
            if file.header.is_dynamic() { "dynamic" } else { "static" },
            file.data.len()
        );
        Ok(file)
    }

    fn from_bytes(path: &Path, data: Vec<u8>, config: &ArchiveConfig) -> Result<Self> {
        let header = ArchiveHeader::decode(&data)?;
        let fields = header.fields();
        if fields.producer_ident != config.producer_ident {
            return Err(ArchiveError::BadHeader(format!(
                "produced by '{}', this loader is '{}'",
                fields.producer_ident, config.producer_ident
            )));
        }

        let base_archive_name = if header.is_dynamic() {
            let size = fields.base_archive_name_size as usize;
            let bytes = data.get(HEADER_SIZE..HEADER_SIZE + size).ok_or(ArchiveError::Truncated {
                region: "base archive name",
                needed: (HEADER_SIZE + size) as u64,
                actual: data.len() as u64,
            })?;
            let name = bytes.strip_suffix(&[0]).unwrap_or(bytes);
            Some(String::from_utf8(name.to_vec()).map_err(|_| {
                ArchiveError::BadHeader("base archive name is not utf-8".to_string())
            })?)
        } else {
            None
        };

        for index in RegionIndex::ALL {
            let region = header.region(index);
            if region.is_empty() {
                continue;
            }
            if region.file_offset % fields.core_region_alignment != 0 {
                return Err(ArchiveError::BadHeader(format!(
                    "{index} region at unaligned file offset {:#x}",
                    region.file_offset
                )));
            }
            if region.file_end() > data.len() as u64 {
                return Err(ArchiveError::Truncated {
                    region: index.name(),
                    needed: region.file_end(),
                    actual: data.len() as u64,
                });
            }
            if config.verify_regions {
                let bytes = &data[region.file_offset as usize..region.file_end() as usize];
                let actual = adler::adler32_slice(bytes);
                if actual != region.crc {
                    return Err(ArchiveError::ChecksumMismatch {
                        what: format!("{index} region"),
                        expected: region.crc,
                        actual,
                    });
                }
            }
        }

        let rw = header.region(RegionIndex::ReadWrite);
        let ro = header.region(RegionIndex::ReadOnly);
        if rw.mapping_offset != 0 || ro.mapping_offset != rw.used {
            return Err(ArchiveError::BadHeader(
                "ro region does not directly follow rw".to_string(),
            ));
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            base_archive_name,
            data,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    pub fn base_archive_name(&self) -> Option<&str> {
        self.base_archive_name.as_deref()
    }

    pub fn file_size(&self) -> usize {
        self.data.len()
    }

    pub fn region_bytes(&self, index: RegionIndex) -> &[u8] {
        let region = self.header.region(index);
        &self.data[region.file_offset as usize..region.file_end() as usize]
    }

    /// Decoded relocation bitmap of the core regions
    pub fn ptrmap(&self) -> Result<PtrMap> {
        PtrMap::from_bytes(
            self.region_bytes(RegionIndex::Bitmap),
            self.header.fields().ptrmap_size_in_bits as usize,
        )
    }

    /// Decoded oopmap of a heap region
    pub fn oopmap(&self, index: RegionIndex) -> Result<PtrMap> {
        let region = self.header.region(index);
        let bitmap = self.region_bytes(RegionIndex::Bitmap);
        let start = region.oopmap_offset as usize;
        let bytes = bitmap.get(start..).ok_or_else(|| {
            ArchiveError::BadHeader(format!("{index} oopmap lies outside the bitmap region"))
        })?;
        PtrMap::from_bytes(bytes, region.oopmap_size_in_bits as usize)
    }
}

/// How to map an archive
#[derive(Debug, Clone, Default)]
pub struct MapOptions {
    /// Simulated actual base; the OS-chosen mapping address otherwise
    pub relocate_to: Option<u64>,
    /// Where the base archive of a dynamic archive is mapped
    pub base_archive: Option<BaseArchive>,
}

/// Core regions of an archive mapped into this process
pub struct MappedArchive {
    mapping: MmapMut,
    header: ArchiveHeader,
    requested_base: u64,
    requested_end: u64,
    actual_base: u64,
    actual_end: u64,
    size: usize,
    relocated_pointers: usize,
    base_archive: Option<BaseArchive>,
}

impl MappedArchive {
    pub fn map(file: &ArchiveFile, options: MapOptions) -> Result<Self> {
        let header = file.header().clone();
        let fields = header.fields();
        let size = header.core_size() as usize;
        let requested_base = fields.requested_base_address;
        let requested_end = requested_base.checked_add(size as u64).ok_or_else(|| {
            ArchiveError::BadHeader(format!(
                "{size} core bytes at requested base {requested_base:#x} overflow the address space"
            ))
        })?;
        if let Some(base) = options.relocate_to {
            check_actual_base(base, size as u64, fields.core_region_alignment)?;
        }

        let base_archive = match (header.is_dynamic(), options.base_archive) {
            (false, _) => None,
            (true, None) => {
                return Err(ArchiveError::InvalidArgument(format!(
                    "dynamic archive needs its base archive {} mapped",
                    file.base_archive_name().unwrap_or("?")
                )))
            },
            (true, Some(base)) => {
                if base.header_crc != fields.base_archive_crc {
                    return Err(ArchiveError::ChecksumMismatch {
                        what: "base archive header".to_string(),
                        expected: fields.base_archive_crc,
                        actual: base.header_crc,
                    });
                }
                Some(base)
            },
        };

        let mut mapping = MmapOptions::new()
            .len(size.max(1))
            .map_anon()
            .map_err(|e| {
                ArchiveError::VirtualMemory(format!("failed to map {size} archive bytes: {e}"))
            })?;
        let rw = file.region_bytes(RegionIndex::ReadWrite);
        mapping[..rw.len()].copy_from_slice(rw);
        mapping[rw.len()..size].copy_from_slice(file.region_bytes(RegionIndex::ReadOnly));

        let actual_base = options
            .relocate_to
            .unwrap_or(mapping.as_ptr() as u64);
        let actual_end = actual_base.checked_add(size as u64).ok_or_else(|| {
            ArchiveError::VirtualMemory(format!("mapping at {actual_base:#x} wraps the address space"))
        })?;
        let mut mapped = Self {
            mapping,
            header,
            requested_base,
            requested_end,
            actual_base,
            actual_end,
            size,
            relocated_pointers: 0,
            base_archive,
        };
        mapped.relocate(&file.ptrmap()?)?;
        Ok(mapped)
    }

    fn relocate(&mut self, ptrmap: &PtrMap) -> Result<()> {
        let delta = self.actual_base.wrapping_sub(self.requested_base);
        let requested_end = self.requested_end;
        let mut patched = 0;

        for bit in ptrmap.iter_set() {
            let offset = bit * WORD_SIZE;
            if offset + WORD_SIZE > self.size {
                return Err(ArchiveError::BadHeader(format!(
                    "bitmap bit {bit} lies past the {}-byte core regions",
                    self.size
                )));
            }
            let old = read_word(&self.mapping, offset);
            let new = if old >= self.requested_base && old < requested_end {
                old.wrapping_add(delta)
            } else if let Some(base) = self
                .base_archive
                .as_ref()
                .filter(|b| old >= b.requested_base && old < b.requested_end())
            {
                old - base.requested_base + base.mapped_base
            } else {
                return Err(ArchiveError::PointerOutOfRange {
                    value: old,
                    offset,
                    range: format!("requested range [{:#x}, {requested_end:#x})", self.requested_base),
                });
            };
            if new != old {
                write_word(&mut self.mapping, offset, new);
                patched += 1;
            }
        }

        self.relocated_pointers = patched;
        if patched > 0 {
            log::info!(
                target: "farc::loader",
                "relocated {patched} pointers from {:#x} to {:#x}",
                self.requested_base,
                self.actual_base
            );
        }
        Ok(())
    }

    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    pub fn requested_base(&self) -> u64 {
        self.requested_base
    }

    pub fn actual_base(&self) -> u64 {
        self.actual_base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn was_relocated(&self) -> bool {
        self.actual_base != self.requested_base
    }

    pub fn relocated_pointers(&self) -> usize {
        self.relocated_pointers
    }

    /// Mapped rw+ro bytes
    pub fn bytes(&self) -> &[u8] {
        &self.mapping[..self.size]
    }

    /// Describe this mapping as the base of a dynamic archive
    pub fn as_base_archive(&self, name: &str) -> BaseArchive {
        BaseArchive {
            name: name.to_string(),
            mapped_base: self.actual_base,
            mapped_end: self.actual_end,
            requested_base: self.requested_base,
            header_crc: self.header.crc(),
        }
    }

    pub fn read_word(&self, offset: ArchiveOffset) -> Result<u64> {
        let start = offset.as_usize();
        if start % WORD_SIZE != 0 || start.checked_add(WORD_SIZE).map_or(true, |end| end > self.size) {
            return Err(ArchiveError::InvalidArgument(format!(
                "word at {offset} is outside the mapped archive"
            )));
        }
        Ok(read_word(&self.mapping, start))
    }

    /// Archive offset of a mapped address
    pub fn offset_of(&self, addr: u64) -> Result<ArchiveOffset> {
        if addr < self.actual_base || addr >= self.actual_end {
            return Err(ArchiveError::PointerOutOfRange {
                value: addr,
                offset: 0,
                range: format!("mapped archive [{:#x}, {:#x})", self.actual_base, self.actual_end),
            });
        }
        Ok(ArchiveOffset(addr - self.actual_base))
    }

    fn pointer_at(&self, offset: ArchiveOffset) -> Result<ArchiveOffset> {
        self.offset_of(self.read_word(offset)?)
    }

    /// Mapped address of every clone slot, by kind
    fn clone_slots(&self) -> Result<[Option<ArchiveOffset>; NUM_VTABLE_KINDS]> {
        let table = ArchiveOffset(self.header.fields().cloned_vtables_offset);
        let mut slots = [None; NUM_VTABLE_KINDS];
        for kind in VtableKind::ALL {
            let word = self.read_word(table.add(kind.index() * WORD_SIZE))?;
            if word != 0 {
                slots[kind.index()] = Some(self.offset_of(word)?);
            }
        }
        Ok(slots)
    }

    /// Overwrite every clone slot with this process's dispatch tables
    ///
    /// Must run before any archived polymorphic object is used.
    pub fn splice_vtables(&mut self, live: &LiveVtables) -> Result<usize> {
        let slots = self.clone_slots()?;
        let mut spliced = 0;
        for kind in VtableKind::ALL {
            let Some(entries) = slots[kind.index()] else {
                continue;
            };
            let table = live.require(kind)?;
            splice_slot(&mut self.mapping[..self.size], entries.as_usize(), table)?;
            spliced += 1;
        }
        log::debug!(target: "farc::loader", "spliced {spliced} dispatch tables");
        Ok(spliced)
    }

    /// Call method `index` of the archived object at `object`
    ///
    /// Resolves through the object's dispatch word to its clone slot; the
    /// slot must hold the live table spliced in by [`Self::splice_vtables`].
    pub fn dispatch(&self, object: ArchiveOffset, index: usize, live: &LiveVtables) -> Result<u64> {
        let entries = self.pointer_at(object)?;
        let slots = self.clone_slots()?;
        let kind = VtableKind::ALL
            .into_iter()
            .find(|k| slots[k.index()] == Some(entries))
            .ok_or_else(|| {
                ArchiveError::BadHeader(format!(
                    "object at {object} does not point at a clone slot"
                ))
            })?;
        let table = live.require(kind)?;
        let method = table.method(index).ok_or_else(|| {
            ArchiveError::InvalidArgument(format!("{kind} has no method {index}"))
        })?;
        let archived = self.read_word(entries.add(index * WORD_SIZE))?;
        let expected = table.words()[index];
        if archived != expected {
            return Err(ArchiveError::InvalidState {
                expected: format!("live {kind} table in its clone slot"),
                actual: format!("entry {index} is {archived:#x}"),
            });
        }
        Ok(method(&self.mapping[object.as_usize()..self.size]))
    }

    fn table_word(&self, index: usize) -> Result<u64> {
        let block = self.header.fields().serialized_data_offset;
        let offset = (index as u64)
            .checked_mul(WORD_SIZE as u64)
            .and_then(|bytes| bytes.checked_add(block))
            .ok_or_else(|| {
                ArchiveError::BadHeader(format!("table word {index} lies past the address space"))
            })?;
        self.read_word(ArchiveOffset(offset))
    }

    /// Archived classes, sorted by name
    pub fn classes(&self) -> Result<Vec<ArchivedClass>> {
        let count = self.table_word(0)? as usize;
        (0..count)
            .map(|i| {
                let entry = TABLE_HEADER_WORDS + 2 * i;
                let offset = self.offset_of(self.table_word(entry)?)?;
                let name = self.offset_of(self.table_word(entry + 1)?)?;
                Ok(ArchivedClass {
                    offset,
                    name: tables::decode_name(self.bytes(), name.as_usize())?,
                })
            })
            .collect()
    }

    /// Archived symbols, in symbol table order
    pub fn symbols(&self) -> Result<Vec<ArchiveOffset>> {
        let classes = self.table_word(0)? as usize;
        let count = self.table_word(1)? as usize;
        let first = TABLE_HEADER_WORDS.saturating_add(classes.saturating_mul(2));
        (0..count)
            .map(|i| self.offset_of(self.table_word(first + i)?))
            .collect()
    }

    /// Decoded subgraph records
    pub fn subgraph_records(&self) -> Result<Vec<SubgraphRecord>> {
        let names: FxHashMap<ArchiveOffset, String> = self
            .classes()?
            .into_iter()
            .map(|c| (c.offset, c.name))
            .collect();
        let class_at = |offset: ArchiveOffset| ArchivedClass {
            offset,
            name: names
                .get(&offset)
                .cloned()
                .unwrap_or_else(|| format!("<class {offset}>")),
        };

        let classes = self.table_word(0)? as usize;
        let symbols = self.table_word(1)? as usize;
        let count = self.table_word(2)? as usize;
        let first = TABLE_HEADER_WORDS
            .saturating_add(classes.saturating_mul(2))
            .saturating_add(symbols);
        let mut records = Vec::new();
        for i in 0..count {
            let record = self.offset_of(self.table_word(first + i)?)?;
            let word = |n: usize| self.read_word(record.add(n * WORD_SIZE));
            let holder = self.offset_of(word(0)?)?;
            let entry_count = word(1)? as usize;
            let class_count = word(2)? as usize;

            let entries = (0..entry_count)
                .map(|e| {
                    let (field_offset, root_index) =
                        tables::decode_entry(word(RECORD_HEADER_WORDS + e)?);
                    Ok(RecordEntry {
                        field_offset,
                        root_index,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let record_classes = (0..class_count)
                .map(|c| Ok(class_at(self.offset_of(word(RECORD_HEADER_WORDS + entry_count + c)?)?)))
                .collect::<Result<Vec<_>>>()?;

            records.push(SubgraphRecord {
                holder: class_at(holder),
                entries,
                classes: record_classes,
            });
        }
        Ok(records)
    }

    /// Restorer over this archive's subgraph records and `heap`'s roots
    pub fn subgraph_restorer(&self, heap: &MappedHeap) -> Result<SubgraphRestorer> {
        SubgraphRestorer::new(self.subgraph_records()?, heap.subgraph_roots().to_vec())
    }
}

impl std::fmt::Debug for MappedArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedArchive")
            .field("requested_base", &format_args!("{:#x}", self.requested_base))
            .field("actual_base", &format_args!("{:#x}", self.actual_base))
            .field("size", &self.size)
            .field("relocated_pointers", &self.relocated_pointers)
            .finish()
    }
}

/// Archived heap regions copied to an actual heap base and patched
#[derive(Debug)]
pub struct MappedHeap {
    requested_base: u64,
    actual_base: u64,
    bytes: Vec<u8>,
    roots: Vec<u64>,
    subgraph_root_count: usize,
    relocated_references: usize,
}

impl MappedHeap {
    /// Map the heap regions, or `None` when the archive has none
    ///
    /// `actual_base` defaults to the heap requested base.
    pub fn map(file: &ArchiveFile, actual_base: Option<u64>) -> Result<Option<Self>> {
        let header = file.header();
        if !header.has_heap() {
            return Ok(None);
        }
        let requested_base = header.fields().heap_requested_base;
        let span = RegionIndex::HEAP
            .iter()
            .map(|&i| header.region(i))
            .map(|r| r.mapping_offset.saturating_add(r.used))
            .max()
            .unwrap_or(0);
        let requested_end = requested_base.checked_add(span).ok_or_else(|| {
            ArchiveError::BadHeader(format!(
                "{span} heap bytes at {requested_base:#x} overflow the address space"
            ))
        })?;
        let actual_base = match actual_base {
            Some(base) => {
                check_actual_base(base, span, WORD_SIZE as u64)?;
                base
            },
            None => requested_base,
        };
        let span = span as usize;
        let delta = actual_base.wrapping_sub(requested_base);

        let mut bytes = vec![0u8; span];
        let mut relocated = 0;
        for index in RegionIndex::HEAP {
            let region = header.region(index);
            if region.is_empty() {
                continue;
            }
            let start = region.mapping_offset as usize;
            bytes[start..start + region.used as usize].copy_from_slice(file.region_bytes(index));

            for bit in file.oopmap(index)?.iter_set() {
                let offset = start + bit * WORD_SIZE;
                if offset + WORD_SIZE > start + region.used as usize {
                    return Err(ArchiveError::BadHeader(format!(
                        "{index} oopmap bit {bit} lies past the region"
                    )));
                }
                let old = read_word(&bytes, offset);
                if old < requested_base || old >= requested_end {
                    return Err(ArchiveError::PointerOutOfRange {
                        value: old,
                        offset,
                        range: format!("heap range [{requested_base:#x}, {requested_end:#x})"),
                    });
                }
                write_word(&mut bytes, offset, old.wrapping_add(delta));
                relocated += 1;
            }
        }

        let roots_offset = header.fields().heap_roots_offset as usize;
        let roots_header = ArchivedObjectHeader::read(bytes.get(roots_offset..).unwrap_or_default())?;
        if roots_header.class != ROOTS_ARRAY_CLASS {
            return Err(ArchiveError::BadHeader(format!(
                "heap roots offset {roots_offset:#x} does not hold the roots array"
            )));
        }
        let payload = &bytes[roots_offset + HEAP_HEADER_SIZE..roots_offset + roots_header.size];
        if payload.len() < ROOTS_ARRAY_ENTRIES {
            return Err(ArchiveError::BadHeader(format!(
                "roots array payload of {} bytes has no counts",
                payload.len()
            )));
        }
        let total = read_word(payload, 0) as usize;
        let subgraph_root_count = read_word(payload, WORD_SIZE) as usize;
        let fits = total
            .checked_mul(WORD_SIZE)
            .and_then(|bytes| bytes.checked_add(ROOTS_ARRAY_ENTRIES))
            .is_some_and(|end| end <= payload.len());
        if subgraph_root_count > total || !fits {
            return Err(ArchiveError::BadHeader(format!(
                "roots array claims {total} entries in {} bytes",
                payload.len()
            )));
        }
        let roots = (0..total)
            .map(|i| read_word(payload, ROOTS_ARRAY_ENTRIES + i * WORD_SIZE))
            .collect();

        log::debug!(
            target: "farc::loader",
            "mapped {span} heap bytes at {actual_base:#x}, patched {relocated} references"
        );
        Ok(Some(Self {
            requested_base,
            actual_base,
            bytes,
            roots,
            subgraph_root_count,
            relocated_references: relocated,
        }))
    }

    pub fn requested_base(&self) -> u64 {
        self.requested_base
    }

    pub fn actual_base(&self) -> u64 {
        self.actual_base
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn relocated_references(&self) -> usize {
        self.relocated_references
    }

    /// Every root: subgraph roots, then interned strings
    pub fn roots(&self) -> &[u64] {
        &self.roots
    }

    pub fn subgraph_roots(&self) -> &[u64] {
        &self.roots[..self.subgraph_root_count]
    }

    pub fn interned_strings(&self) -> &[u64] {
        &self.roots[self.subgraph_root_count..]
    }

    /// Header and payload of the object at a mapped heap address
    pub fn object(&self, addr: u64) -> Result<(ArchivedObjectHeader, &[u8])> {
        let offset = addr
            .checked_sub(self.actual_base)
            .map(|o| o as usize)
            .filter(|&o| o < self.bytes.len())
            .ok_or_else(|| ArchiveError::PointerOutOfRange {
                value: addr,
                offset: 0,
                range: format!(
                    "mapped heap [{:#x}, {:#x})",
                    self.actual_base,
                    self.actual_base.saturating_add(self.bytes.len() as u64)
                ),
            })?;
        let header = ArchivedObjectHeader::read(&self.bytes[offset..])?;
        Ok((header, &self.bytes[offset + HEAP_HEADER_SIZE..offset + header.size]))
    }
}

/// Reject a caller-chosen base that is misaligned or leaves no room for `size` bytes
fn check_actual_base(base: u64, size: u64, alignment: u64) -> Result<()> {
    if alignment != 0 && base % alignment != 0 {
        return Err(ArchiveError::InvalidArgument(format!(
            "base {base:#x} is not aligned to {alignment:#x}"
        )));
    }
    if base.checked_add(size).is_none() {
        return Err(ArchiveError::InvalidArgument(format!(
            "{size} bytes at {base:#x} overflow the address space"
        )));
    }
    Ok(())
}
