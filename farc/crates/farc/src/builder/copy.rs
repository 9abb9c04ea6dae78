//! Copy phase
//!
//! Layout order inside the buffer:
//!
//! ```text
//! rw: [clone table][clone slots][rw objects in walk order]  -- packed
//! ro: [ro objects in walk order][class names][subgraph records][tables] -- packed
//! ```
//!
//! Copied objects still hold live addresses in their pointer fields; only
//! their slots are marked here. Relocation rewrites the values.

use super::gather::GatherPlan;
use super::{ArchiveBuilder, LayoutEntry};
use crate::address::{ArchiveOffset, BufferAddr, HeapAddr, SourceAddr};
use crate::archive::tables::{self, RECORD_HEADER_WORDS, TABLE_HEADER_WORDS};
use crate::catalog::{Catalog, RecordId};
use crate::error::{ArchiveError, Result};
use crate::graph::SourceGraph;
use crate::heap::{ArchiveHeapAllocator, BumpArchiveHeap, HeapArchiver};
use crate::logging::BuildEvent;
use crate::space::{DumpSpace, RegionKind};
use crate::vtable::{VtableCloner, NUM_VTABLE_KINDS};
use farc_util::align::align_up;
use farc_util::{FxHashMap, WORD_SIZE};

impl ArchiveBuilder<'_> {
    /// Upper bound of the bytes the copy phase allocates
    pub(super) fn estimate(&self, plan: &GatherPlan) -> usize {
        let object_alignment = self.config.object_alignment;
        let objects: usize = plan
            .rw
            .iter()
            .chain(&plan.ro)
            .map(|&id| align_up(self.catalog.record(id).size, object_alignment))
            .sum();

        let vtables = NUM_VTABLE_KINDS * WORD_SIZE
            + self
                .live_vtables
                .iter()
                .map(|table| (table.len() + 1) * WORD_SIZE)
                .sum::<usize>();

        let names: usize = plan
            .classes
            .iter()
            .filter_map(|&id| self.source.object(self.catalog.record(id).source))
            .map(|obj| tables::name_size(obj.name.as_deref().unwrap_or_default()))
            .sum();
        let table_words = TABLE_HEADER_WORDS + 2 * plan.classes.len() + plan.symbols.len();

        // Per static root: record header, block pointer, entry, class list
        let subgraphs = match self.heap.filter(|_| self.heap_enabled()) {
            Some(heap) => {
                let roots = heap.static_roots().len();
                WORD_SIZE * (4 * roots + 2 * roots + roots * plan.classes.len())
            },
            None => 0,
        };

        let padding = 2 * self.config.core_region_alignment;
        align_up(
            objects
                + vtables
                + names
                + table_words * WORD_SIZE
                + subgraphs
                + padding
                + self.config.estimate_slack,
            self.config.core_region_alignment,
        )
    }

    pub(super) fn copy_phase(&mut self) -> Result<()> {
        let plan = self.plan.take().ok_or_else(|| {
            ArchiveError::Internal("copy phase started without a gather plan".to_string())
        })?;
        let space = self.space.as_mut().ok_or_else(|| {
            ArchiveError::Internal("copy phase started without a reservation".to_string())
        })?;
        let base = space.base();

        let table = self.cloner.capture(space, self.live_vtables)?;
        self.layout.push(LayoutEntry {
            region: RegionKind::ReadWrite,
            offset: ArchiveOffset::new(table.offset_from(base)),
            size: space.region(RegionKind::ReadWrite).top().offset_from(table),
            label: "VtableClones".to_string(),
            name: None,
            source: None,
        });

        let mut copier = Copier {
            space,
            catalog: &mut self.catalog,
            cloner: &self.cloner,
            source: self.source,
            layout: &mut self.layout,
        };
        for &id in &plan.rw {
            copier.copy_object(id)?;
        }
        copier.space.pack_rw()?;
        self.logger.log(BuildEvent::RegionPacked {
            region: RegionKind::ReadWrite.to_string(),
            used_bytes: copier.space.region(RegionKind::ReadWrite).used(),
        });
        for &id in &plan.ro {
            copier.copy_object(id)?;
        }

        self.archive_heap()?;
        self.write_tables(&plan)?;

        let space = self.space_mut()?;
        space.pack_ro()?;
        let ro_used = space.region(RegionKind::ReadOnly).used();
        let used = space.used();
        self.logger.log(BuildEvent::RegionPacked {
            region: RegionKind::ReadOnly.to_string(),
            used_bytes: ro_used,
        });
        log::debug!(
            target: "farc::builder",
            "copy used {} of {} reserved bytes",
            used,
            self.stats.reserved_bytes
        );
        self.plan = Some(plan);
        Ok(())
    }

    fn archive_heap(&mut self) -> Result<()> {
        let Some(heap) = self.heap.filter(|_| self.heap_enabled()) else {
            if self.config.heap_archiving && self.base_archive.is_some() {
                log::info!(target: "farc::heap", "dynamic archive: heap archiving skipped");
            }
            return Ok(());
        };
        let space = self.space.as_ref().ok_or_else(|| {
            ArchiveError::Internal("heap archiving started without a reservation".to_string())
        })?;
        let base = space.base();

        let class_offsets: FxHashMap<SourceAddr, ArchiveOffset> = self
            .catalog
            .iter()
            .filter(|(_, record)| record.kind.is_some_and(|kind| kind.is_class()))
            .filter_map(|(_, record)| {
                record
                    .dest
                    .map(|dest| (record.source, ArchiveOffset::new(dest.offset_from(base))))
            })
            .collect();

        let requested = HeapAddr(self.config.heap_requested_base);
        let mut fallback;
        let allocator: &mut dyn ArchiveHeapAllocator = match self.heap_allocator.as_deref_mut() {
            Some(allocator) => allocator,
            None => {
                fallback = BumpArchiveHeap::new(
                    requested,
                    self.config.heap_capacity,
                    self.config.max_heap_object_size,
                )?;
                if let Some(range_size) = self.config.heap_range_size {
                    fallback = fallback.with_range_size(range_size);
                }
                &mut fallback
            },
        };

        let archive = HeapArchiver::new(
            heap,
            self.source,
            allocator,
            &class_offsets,
            &self.config,
            &self.logger,
        )
        .archive(requested)?;
        self.stats.heap_objects = archive.object_count;
        self.heap_archive = Some(archive);
        Ok(())
    }

    /// Class names, subgraph records and the lookup tables, all in ro
    fn write_tables(&mut self, plan: &GatherPlan) -> Result<()> {
        let space = self.space.as_mut().ok_or_else(|| {
            ArchiveError::Internal("tables written without a reservation".to_string())
        })?;
        let base = space.base();
        let catalog = &self.catalog;
        let source = self.source;
        let dest_of = |id: RecordId| -> Result<BufferAddr> {
            catalog.record(id).dest.ok_or_else(|| {
                ArchiveError::Internal(format!("{} was never copied", catalog.record(id).source))
            })
        };

        let mut classes = Vec::with_capacity(plan.classes.len());
        for &id in &plan.classes {
            let name = source
                .object(catalog.record(id).source)
                .and_then(|obj| obj.name.clone())
                .unwrap_or_default();
            let name_addr = space.allocate_bytes(RegionKind::ReadOnly, &tables::encode_name(&name))?;
            self.layout.push(LayoutEntry {
                region: RegionKind::ReadOnly,
                offset: ArchiveOffset::new(name_addr.offset_from(base)),
                size: tables::name_size(&name),
                label: "ClassName".to_string(),
                name: Some(name),
                source: None,
            });
            classes.push((dest_of(id)?, name_addr));
        }

        let mut records = Vec::new();
        let subgraphs = self.heap_archive.as_ref().map_or(&[][..], |h| &h.subgraphs[..]);
        for info in subgraphs {
            let holder = catalog.lookup(info.holder).map(dest_of).transpose()?;
            let Some(holder) = holder else {
                return Err(ArchiveError::Internal(format!(
                    "subgraph holder {} is not archived",
                    info.holder_name
                )));
            };
            let words = RECORD_HEADER_WORDS + info.entries.len() + info.classes.len();
            let record = space.allocate(RegionKind::ReadOnly, words * WORD_SIZE)?;
            space.write_pointer(record, holder)?;
            space.write_word(record.add(WORD_SIZE), info.entries.len() as u64)?;
            space.write_word(record.add(2 * WORD_SIZE), info.classes.len() as u64)?;

            let mut slot = record.add(RECORD_HEADER_WORDS * WORD_SIZE);
            for entry in &info.entries {
                space.write_word(slot, tables::encode_entry(entry.field_offset, entry.root_index))?;
                slot = slot.add(WORD_SIZE);
            }
            for class in &info.classes {
                let id = catalog.lookup(*class).ok_or_else(|| {
                    ArchiveError::Internal(format!("subgraph class {class} is not archived"))
                })?;
                space.write_pointer(slot, dest_of(id)?)?;
                slot = slot.add(WORD_SIZE);
            }

            self.layout.push(LayoutEntry {
                region: RegionKind::ReadOnly,
                offset: ArchiveOffset::new(record.offset_from(base)),
                size: words * WORD_SIZE,
                label: "SubgraphInfo".to_string(),
                name: Some(info.holder_name.clone()),
                source: None,
            });
            records.push(record);
        }

        let symbols = plan
            .symbols
            .iter()
            .map(|&id| dest_of(id))
            .collect::<Result<Vec<_>>>()?;

        let words = TABLE_HEADER_WORDS + 2 * classes.len() + symbols.len() + records.len();
        let block = space.allocate(RegionKind::ReadOnly, words * WORD_SIZE)?;
        space.write_word(block, classes.len() as u64)?;
        space.write_word(block.add(WORD_SIZE), symbols.len() as u64)?;
        space.write_word(block.add(2 * WORD_SIZE), records.len() as u64)?;
        let mut slot = block.add(TABLE_HEADER_WORDS * WORD_SIZE);
        for (class, name) in classes {
            space.write_pointer(slot, class)?;
            space.write_pointer(slot.add(WORD_SIZE), name)?;
            slot = slot.add(2 * WORD_SIZE);
        }
        for target in symbols.into_iter().chain(records) {
            space.write_pointer(slot, target)?;
            slot = slot.add(WORD_SIZE);
        }

        self.layout.push(LayoutEntry {
            region: RegionKind::ReadOnly,
            offset: ArchiveOffset::new(block.offset_from(base)),
            size: words * WORD_SIZE,
            label: "SerializedData".to_string(),
            name: None,
            source: None,
        });
        self.serialized_data = Some(block);
        Ok(())
    }
}

/// Copies single objects into the buffer
struct Copier<'a> {
    space: &'a mut DumpSpace,
    catalog: &'a mut Catalog,
    cloner: &'a VtableCloner,
    source: &'a dyn SourceGraph,
    layout: &'a mut Vec<LayoutEntry>,
}

impl Copier<'_> {
    fn copy_object(&mut self, id: RecordId) -> Result<()> {
        let record = self.catalog.record(id);
        let addr = record.source;
        let object = self
            .source
            .object(addr)
            .ok_or(ArchiveError::UnknownObject { address: addr.raw() })?;
        let region = object.kind.region();

        let dest = self.space.allocate_bytes(region, &object.bytes)?;
        if let Some(kind) = object.kind.vtable_kind() {
            self.cloner.patch_object(self.space, dest, kind)?;
        }
        let offsets: Vec<usize> = self.catalog.pointer_offsets(id).collect();
        for offset in offsets {
            self.space.mark_pointer(dest.add(offset))?;
        }
        self.catalog.set_dest(id, dest)?;

        self.layout.push(LayoutEntry {
            region,
            offset: ArchiveOffset::new(dest.offset_from(self.space.base())),
            size: object.size(),
            label: object.kind.to_string(),
            name: object.name.clone(),
            source: Some(addr),
        });
        Ok(())
    }
}
