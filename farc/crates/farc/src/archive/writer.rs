//! Archive Writer
//!
//! File layout, every region at a `core_region_alignment` file offset:
//!
//! ```text
//! [header][base archive name, dynamic only] pad
//! [rw] pad [ro] pad [bm: core bitmap words, heap oopmaps] pad
//! [closed0] pad [closed1] pad [open0] pad [open1]
//! ```
//!
//! A pre-existing file is removed before writing, and a partially written
//! file is removed when any write fails. With `map_log` configured the
//! layout trace is written once the archive is complete.

use super::header::{ArchiveHeader, HeaderFields, RegionIndex, RegionRecord, HEADER_SIZE};
use super::map_log::MapLogger;
use crate::builder::BuiltArchive;
use crate::error::Result;
use crate::heap::ArchivedHeapRange;
use crate::logging::{BuildEvent, BuildLogger};
use farc_util::align::align_up_u64;
use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

/// Serializes one built archive
pub struct ArchiveWriter<'a> {
    archive: &'a BuiltArchive,
    logger: Option<&'a BuildLogger>,
}

/// Where every region goes
struct FileLayout<'a> {
    header: ArchiveHeader,
    base_name: Vec<u8>,
    regions: Vec<(u64, &'a [u8])>,
    bitmap: Vec<u8>,
    bitmap_offset: u64,
}

impl<'a> ArchiveWriter<'a> {
    pub fn new(archive: &'a BuiltArchive) -> Self {
        Self {
            archive,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: &'a BuildLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Compute the finalized header without writing anything
    pub fn header(&self) -> Result<ArchiveHeader> {
        Ok(self.layout()?.header)
    }

    /// Write the archive to `path`, returning the header written
    pub fn write(&self, path: &Path) -> Result<ArchiveHeader> {
        match fs::remove_file(path) {
            Ok(()) => log::debug!(target: "farc::builder", "removed existing {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }

        let layout = self.layout()?;
        let file_size = match Self::write_file(path, &layout) {
            Ok(size) => size,
            Err(err) => {
                if let Err(e) = fs::remove_file(path) {
                    log::warn!(
                        target: "farc::builder",
                        "could not remove partial archive {}: {e}",
                        path.display()
                    );
                }
                return Err(err);
            },
        };

        let event = BuildEvent::ArchiveWritten {
            path: path.display().to_string(),
            file_size,
            crc: layout.header.crc(),
        };
        match self.logger {
            Some(logger) => logger.log(event),
            None => log::info!(
                target: "farc::builder",
                "wrote {} ({} bytes, header crc {:#010x})",
                path.display(),
                file_size,
                layout.header.crc()
            ),
        }
        if let Some(map_log) = &self.archive.config.map_log {
            MapLogger::new(self.archive).write_to(map_log)?;
        }
        Ok(layout.header)
    }

    fn layout(&self) -> Result<FileLayout<'a>> {
        let archive = self.archive;
        let config = &archive.config;
        let alignment = config.core_region_alignment as u64;
        let dynamic = archive.is_dynamic();

        let mut fields = HeaderFields::new(&config.producer_ident);
        fields.core_region_alignment = alignment;
        fields.object_alignment = config.object_alignment as u32;
        fields.requested_base_address = archive.requested_base.raw();
        fields.mapped_base_address = archive.requested_base.raw();
        fields.ptrmap_size_in_bits = archive.ptrmap.size_in_bits() as u64;
        fields.cloned_vtables_offset = archive.cloned_vtables_offset.0;
        fields.serialized_data_offset = archive.serialized_data_offset.0;

        let mut base_name = Vec::new();
        if let Some(base) = &archive.base_archive {
            base_name.extend_from_slice(base.name.as_bytes());
            base_name.push(0);
            fields.base_archive_name_size = base_name.len() as u32;
            fields.base_archive_crc = base.header_crc;
        }

        let mut regions = Vec::new();
        let mut offset = align_up_u64((HEADER_SIZE + base_name.len()) as u64, alignment);
        fields.regions[RegionIndex::ReadWrite.index()] = place(
            &mut offset,
            alignment,
            RegionIndex::ReadWrite,
            &archive.rw,
            0,
            &mut regions,
        );
        fields.regions[RegionIndex::ReadOnly.index()] = place(
            &mut offset,
            alignment,
            RegionIndex::ReadOnly,
            &archive.ro,
            archive.rw.len() as u64,
            &mut regions,
        );

        // Bitmap region: core bitmap, then one oopmap per heap range
        let mut bitmap = archive.ptrmap.to_bytes();
        let mut heap_records = Vec::new();
        let mut heap_base = 0;
        if let Some(heap) = &archive.heap {
            heap_base = heap.requested_base.raw();
            fields.flags |= super::header::flags::HAS_HEAP;
            fields.heap_requested_base = heap.requested_base.raw();
            fields.heap_roots_offset = heap.roots.raw() - heap.requested_base.raw();
            let slots = [
                (RegionIndex::Closed0, heap.closed.first()),
                (RegionIndex::Closed1, heap.closed.get(1)),
                (RegionIndex::Open0, heap.open.first()),
                (RegionIndex::Open1, heap.open.get(1)),
            ];
            for (index, range) in slots {
                let Some(range) = range else { continue };
                let oopmap_offset = bitmap.len() as u64;
                bitmap.extend_from_slice(&range.oopmap.to_bytes());
                heap_records.push((index, range, oopmap_offset));
            }
        }
        let bitmap_offset = offset;
        fields.regions[RegionIndex::Bitmap.index()] = RegionRecord {
            file_offset: bitmap_offset,
            mapping_offset: 0,
            used: bitmap.len() as u64,
            read_only: true,
            allow_exec: false,
            crc: adler::adler32_slice(&bitmap),
            oopmap_offset: 0,
            oopmap_size_in_bits: archive.ptrmap.size_in_bits() as u64,
        };
        offset = align_up_u64(offset + bitmap.len() as u64, alignment);

        for (index, range, oopmap_offset) in heap_records {
            let range: &'a ArchivedHeapRange = range;
            let mut record = place(
                &mut offset,
                alignment,
                index,
                &range.bytes,
                range.start.raw() - heap_base,
                &mut regions,
            );
            record.oopmap_offset = oopmap_offset;
            record.oopmap_size_in_bits = range.oopmap.size_in_bits() as u64;
            fields.regions[index.index()] = record;
        }

        let mut header = ArchiveHeader::new(dynamic, fields);
        header.finalize()?;
        Ok(FileLayout {
            header,
            base_name,
            regions,
            bitmap,
            bitmap_offset,
        })
    }

    fn write_file(path: &Path, layout: &FileLayout<'_>) -> Result<u64> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        out.write_all(&layout.header.encode()?)?;
        out.write_all(&layout.base_name)?;

        let mut chunks: Vec<(u64, &[u8])> = layout.regions.clone();
        chunks.push((layout.bitmap_offset, &layout.bitmap));
        chunks.sort_by_key(|(offset, _)| *offset);

        let mut end = (HEADER_SIZE + layout.base_name.len()) as u64;
        for (offset, bytes) in chunks {
            out.seek(SeekFrom::Start(offset))?;
            out.write_all(bytes)?;
            end = end.max(offset + bytes.len() as u64);
        }
        out.flush()?;
        let file = out.into_inner().map_err(|e| e.into_error())?;
        // Trailing empty regions leave no bytes; keep the length exact
        file.set_len(end)?;
        file.sync_all()?;
        Ok(end)
    }
}

/// Put `bytes` at the next aligned file offset
fn place<'b>(
    offset: &mut u64,
    alignment: u64,
    index: RegionIndex,
    bytes: &'b [u8],
    mapping_offset: u64,
    regions: &mut Vec<(u64, &'b [u8])>,
) -> RegionRecord {
    let record = RegionRecord {
        file_offset: *offset,
        mapping_offset,
        used: bytes.len() as u64,
        read_only: index == RegionIndex::ReadOnly,
        allow_exec: false,
        crc: adler::adler32_slice(bytes),
        oopmap_offset: 0,
        oopmap_size_in_bits: 0,
    };
    log::trace!(
        target: "farc::builder",
        "{index} region at file offset {:#x}, {} bytes",
        *offset,
        bytes.len()
    );
    regions.push((*offset, bytes));
    *offset = align_up_u64(*offset + bytes.len() as u64, alignment);
    record
}
