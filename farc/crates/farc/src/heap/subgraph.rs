//! Heap Subgraph Archiver
//!
//! Copies the heap objects reachable from a fixed list of static fields into
//! archive heap space, one object at a time, and records per holder class
//! what a loader must initialize before publishing each field.
//!
//! Walk invariants:
//! - a seen-set keyed by live address spans all roots, so an object shared
//!   by several fields (or reached through a cycle) is copied exactly once
//! - a per-root visited set still walks already-archived objects, so every
//!   root records the classes of everything it can reach
//! - failing to archive a root object abandons that field only; failing on
//!   any object below a root would leave its archived referrer dangling and
//!   aborts the build
//!
//! Reference fields are patched in a final pass once every object has an
//! archive address.

use super::{
    ArchiveHeapAllocator, ArchivedObjectHeader, HeapRange, HeapRangeKind, HEAP_HEADER_SIZE,
    MAX_RANGES_PER_KIND, ROOTS_ARRAY_CLASS,
};
use crate::address::{write_word, ArchiveOffset, HeapAddr, SourceAddr};
use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, Result};
use crate::graph::{HeapGraph, SourceGraph, StaticFieldRoot};
use crate::logging::{BuildEvent, BuildLogger};
use crate::space::PtrMap;
use farc_util::{FxHashMap, FxHashSet, WORD_SIZE};
use indexmap::IndexMap;

/// Payload offset of the first entry of the roots array
pub const ROOTS_ARRAY_ENTRIES: usize = 2 * WORD_SIZE;

/// One archived static field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubgraphEntry {
    pub field_name: String,
    pub field_offset: u32,
    /// Index into the archived roots array
    pub root_index: u32,
}

/// Restoration metadata of one holder class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubgraphInfo {
    pub holder: SourceAddr,
    pub holder_name: String,
    pub entries: Vec<SubgraphEntry>,
    /// Classes to initialize before any entry is published, in discovery order
    pub classes: Vec<SourceAddr>,
}

/// Archived bytes of one heap range plus its oopmap
#[derive(Debug, Clone)]
pub struct ArchivedHeapRange {
    pub kind: HeapRangeKind,
    pub start: HeapAddr,
    pub bytes: Vec<u8>,
    /// One bit per word of `bytes`, set where a heap reference lives
    pub oopmap: PtrMap,
}

/// Result of heap archiving
#[derive(Debug, Clone)]
pub struct HeapArchive {
    pub requested_base: HeapAddr,
    pub closed: Vec<ArchivedHeapRange>,
    pub open: Vec<ArchivedHeapRange>,
    /// Roots array: subgraph roots, then interned strings
    pub roots: HeapAddr,
    pub subgraph_root_count: usize,
    pub interned_string_count: usize,
    pub subgraphs: Vec<SubgraphInfo>,
    pub object_count: usize,
}

impl HeapArchive {
    pub fn used_bytes(&self) -> usize {
        self.closed
            .iter()
            .chain(&self.open)
            .map(|r| r.bytes.len())
            .sum()
    }
}

/// Outcome of trying to archive one object: its address, or why it cannot
/// be archived
type Attempt = std::result::Result<HeapAddr, String>;

/// Heap subgraph archiver of one build
pub struct HeapArchiver<'a> {
    heap: &'a dyn HeapGraph,
    meta: &'a dyn SourceGraph,
    allocator: &'a mut dyn ArchiveHeapAllocator,
    class_offsets: &'a FxHashMap<SourceAddr, ArchiveOffset>,
    config: &'a ArchiveConfig,
    logger: &'a BuildLogger,
    seen: FxHashMap<SourceAddr, HeapAddr>,
    copied: Vec<(SourceAddr, HeapAddr)>,
    reference_slots: Vec<HeapAddr>,
    roots: Vec<HeapAddr>,
    interned: Vec<HeapAddr>,
    subgraphs: IndexMap<SourceAddr, SubgraphInfo>,
}

impl<'a> HeapArchiver<'a> {
    /// `class_offsets` maps every archived class to its archive offset
    pub fn new(
        heap: &'a dyn HeapGraph,
        meta: &'a dyn SourceGraph,
        allocator: &'a mut dyn ArchiveHeapAllocator,
        class_offsets: &'a FxHashMap<SourceAddr, ArchiveOffset>,
        config: &'a ArchiveConfig,
        logger: &'a BuildLogger,
    ) -> Self {
        Self {
            heap,
            meta,
            allocator,
            class_offsets,
            config,
            logger,
            seen: FxHashMap::default(),
            copied: Vec::new(),
            reference_slots: Vec::new(),
            roots: Vec::new(),
            interned: Vec::new(),
            subgraphs: IndexMap::new(),
        }
    }

    /// Archive interned strings and every static-field subgraph
    pub fn archive(mut self, requested_base: HeapAddr) -> Result<HeapArchive> {
        self.allocator.begin_archive_alloc_range(HeapRangeKind::Closed)?;
        for string in self.heap.interned_strings() {
            match self.archive_reachable(string, None)? {
                Ok(addr) => self.interned.push(addr),
                Err(reason) => log::warn!(
                    target: "farc::heap",
                    "interned string {string} not archived: {reason}"
                ),
            }
        }
        let closed = self.close_ranges(HeapRangeKind::Closed)?;

        self.allocator.begin_archive_alloc_range(HeapRangeKind::Open)?;
        for root in self.heap.static_roots() {
            self.archive_static_field(&root)?;
        }
        let roots = self.allocate_roots_array()?;
        let open = self.close_ranges(HeapRangeKind::Open)?;

        self.patch_references()?;
        self.allocator.verify()?;

        let closed = self.collect_ranges(&closed)?;
        let open = self.collect_ranges(&open)?;
        Ok(HeapArchive {
            requested_base,
            closed,
            open,
            roots,
            subgraph_root_count: self.roots.len(),
            interned_string_count: self.interned.len(),
            subgraphs: self.subgraphs.into_values().collect(),
            object_count: self.copied.len(),
        })
    }

    fn class_name(&self, class: SourceAddr) -> String {
        self.meta
            .object(class)
            .and_then(|obj| obj.name.clone())
            .unwrap_or_else(|| class.to_string())
    }

    fn archive_static_field(&mut self, root: &StaticFieldRoot) -> Result<()> {
        let holder_name = self.class_name(root.holder);
        let abandon = |logger: &BuildLogger, reason: String| {
            logger.log(BuildEvent::SubgraphAbandoned {
                holder: holder_name.clone(),
                field: root.field_name.clone(),
                reason,
            })
        };

        if !self.class_offsets.contains_key(&root.holder) {
            abandon(self.logger, "holder class is not archived".to_string());
            return Ok(());
        }
        if root.value.is_null() {
            log::trace!(target: "farc::heap", "{holder_name}::{} is null", root.field_name);
            return Ok(());
        }

        let mut classes = Vec::new();
        let addr = match self.archive_reachable(root.value, Some(&mut classes))? {
            Ok(addr) => addr,
            Err(reason) => {
                abandon(self.logger, reason);
                return Ok(());
            },
        };

        let root_index = self.roots.len() as u32;
        self.roots.push(addr);
        let info = self
            .subgraphs
            .entry(root.holder)
            .or_insert_with(|| SubgraphInfo {
                holder: root.holder,
                holder_name: holder_name.clone(),
                entries: Vec::new(),
                classes: Vec::new(),
            });
        info.entries.push(SubgraphEntry {
            field_name: root.field_name.clone(),
            field_offset: root.field_offset,
            root_index,
        });
        for class in classes {
            if class != root.holder && !info.classes.contains(&class) {
                info.classes.push(class);
            }
        }

        self.logger.log(BuildEvent::SubgraphArchived {
            holder: holder_name,
            field: root.field_name.clone(),
            objects: self.copied.len(),
            classes: info.classes.len(),
        });
        Ok(())
    }

    /// Walk everything reachable from `root`, copying unseen objects
    ///
    /// The inner error is a recoverable failure on `root` itself. Classes of
    /// every reached object not on the early-class allowlist are appended to
    /// `classes`.
    fn archive_reachable(
        &mut self,
        root: SourceAddr,
        mut classes: Option<&mut Vec<SourceAddr>>,
    ) -> Result<Attempt> {
        let root_addr = match self.copy_object(root)? {
            Ok(addr) => addr,
            Err(reason) => return Ok(Err(reason)),
        };

        let heap = self.heap;
        let mut visited = FxHashSet::default();
        visited.insert(root);
        let mut stack = vec![root];

        while let Some(source) = stack.pop() {
            let Some(object) = heap.heap_object(source) else {
                return Err(ArchiveError::UnknownObject {
                    address: source.raw(),
                });
            };

            if let Some(classes) = classes.as_deref_mut() {
                let name = self.class_name(object.class);
                if !self.config.is_early_class(&name) && !classes.contains(&object.class) {
                    classes.push(object.class);
                }
            }

            let children: Vec<SourceAddr> = object
                .reference_fields()
                .map(|(_, child)| child)
                .filter(|child| !child.is_null())
                .collect();
            for child in children.into_iter().rev() {
                if !visited.insert(child) {
                    continue;
                }
                match self.copy_object(child)? {
                    Ok(_) => stack.push(child),
                    Err(reason) => {
                        log::error!(
                            target: "farc::heap",
                            "{child} reached from archived {source} cannot be archived: {reason}"
                        );
                        return Err(ArchiveError::DanglingHeapReference {
                            address: child.raw(),
                            referrer: source.raw(),
                        });
                    },
                }
            }
        }

        Ok(Ok(root_addr))
    }

    /// Copy one object, or return the address of its existing copy
    fn copy_object(&mut self, source: SourceAddr) -> Result<Attempt> {
        if let Some(&addr) = self.seen.get(&source) {
            return Ok(Ok(addr));
        }

        let heap = self.heap;
        let Some(object) = heap.heap_object(source) else {
            return Ok(Err(format!("{source} is not a heap object")));
        };
        if !object.archivable {
            return Ok(Err(format!("{source} holds state that cannot be archived")));
        }
        let Some(&class) = self.class_offsets.get(&object.class) else {
            return Ok(Err(format!(
                "class {} of {source} is not archived",
                self.class_name(object.class)
            )));
        };

        let size = HEAP_HEADER_SIZE + object.payload.len();
        let addr = match self.allocator.archive_mem_allocate(size) {
            Ok(addr) => addr,
            Err(ArchiveError::HeapObjectTooLarge { size, limit, .. }) => {
                let err = ArchiveError::HeapObjectTooLarge {
                    address: source.raw(),
                    size,
                    limit,
                };
                return Ok(Err(err.to_string()));
            },
            Err(err) if err.is_heap_allocation_failure() => return Ok(Err(err.to_string())),
            Err(err) => return Err(err),
        };

        let bytes = self.allocator.bytes_mut(addr, size)?;
        ArchivedObjectHeader::new(object.mark_word, class, object.payload.len()).write(bytes);
        let payload = &mut bytes[HEAP_HEADER_SIZE..];
        payload.copy_from_slice(&object.payload);
        for &offset in &object.loader_wiring_offsets {
            write_word(payload, offset, 0);
        }

        self.seen.insert(source, addr);
        self.copied.push((source, addr));
        Ok(Ok(addr))
    }

    fn allocate_roots_array(&mut self) -> Result<HeapAddr> {
        let entries: Vec<HeapAddr> = self.roots.iter().chain(&self.interned).copied().collect();
        let payload_size = ROOTS_ARRAY_ENTRIES + entries.len() * WORD_SIZE;
        let addr = self
            .allocator
            .archive_mem_allocate(HEAP_HEADER_SIZE + payload_size)?;

        let bytes = self.allocator.bytes_mut(addr, HEAP_HEADER_SIZE + payload_size)?;
        ArchivedObjectHeader::new(0, ROOTS_ARRAY_CLASS, payload_size).write(bytes);
        let payload = &mut bytes[HEAP_HEADER_SIZE..];
        write_word(payload, 0, entries.len() as u64);
        write_word(payload, WORD_SIZE, self.roots.len() as u64);
        for (i, entry) in entries.iter().enumerate() {
            write_word(payload, ROOTS_ARRAY_ENTRIES + i * WORD_SIZE, entry.raw());
        }

        let first = addr.add(HEAP_HEADER_SIZE + ROOTS_ARRAY_ENTRIES);
        self.reference_slots
            .extend((0..entries.len()).map(|i| first.add(i * WORD_SIZE)));
        Ok(addr)
    }

    fn close_ranges(&mut self, kind: HeapRangeKind) -> Result<Vec<HeapRange>> {
        let ranges = self.allocator.end_archive_alloc_range()?;
        if ranges.len() > MAX_RANGES_PER_KIND {
            return Err(ArchiveError::TooManyHeapRanges {
                kind: kind.name(),
                count: ranges.len(),
                max: MAX_RANGES_PER_KIND,
            });
        }
        self.logger.log(BuildEvent::HeapRanges {
            kind: kind.name().to_string(),
            ranges: ranges.len(),
            used_bytes: ranges.iter().map(|r| r.used).sum(),
        });
        Ok(ranges)
    }

    /// Rewrite every reference field from live to archived address
    fn patch_references(&mut self) -> Result<()> {
        let heap = self.heap;
        for &(source, addr) in &self.copied {
            let Some(object) = heap.heap_object(source) else {
                return Err(ArchiveError::UnknownObject {
                    address: source.raw(),
                });
            };
            for (offset, target) in object.reference_fields() {
                let slot = addr.add(HEAP_HEADER_SIZE + offset);
                let value = if target.is_null() {
                    HeapAddr::NULL
                } else {
                    *self.seen.get(&target).ok_or(ArchiveError::DanglingHeapReference {
                        address: target.raw(),
                        referrer: source.raw(),
                    })?
                };
                write_word(self.allocator.bytes_mut(slot, WORD_SIZE)?, 0, value.raw());
                if !value.is_null() {
                    self.reference_slots.push(slot);
                }
            }
        }
        Ok(())
    }

    fn collect_ranges(&self, ranges: &[HeapRange]) -> Result<Vec<ArchivedHeapRange>> {
        ranges
            .iter()
            .map(|range| -> Result<ArchivedHeapRange> {
                let mut oopmap = PtrMap::with_size(range.used / WORD_SIZE);
                for slot in self.reference_slots.iter().filter(|s| range.contains(**s)) {
                    oopmap.mark((slot.raw() - range.start.raw()) as usize / WORD_SIZE)?;
                }
                oopmap.compact()?;
                Ok(ArchivedHeapRange {
                    kind: range.kind,
                    start: range.start,
                    bytes: self.allocator.bytes(range.start, range.used)?.to_vec(),
                    oopmap,
                })
            })
            .collect()
    }
}
