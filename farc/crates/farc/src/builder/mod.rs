//! Builder Module - One Archive Build Session
//!
//! [`ArchiveBuilder`] owns everything a build mutates: the dump space, the
//! catalog, and the vtable cloner. It runs three one-directional phases:
//!
//! ```text
//! Gather ──► Copy ──► Relocate ──► Done
//!   │          │          │
//!   │          │          └─ (a) live -> buffer addresses, per record
//!   │          │             (b) buffer -> requested addresses, per bitmap bit
//!   │          └─ vtable clones, rw objects, pack rw, ro objects,
//!   │             heap subgraphs, serialized tables, pack ro
//!   └─ closure from sorted classes, sorted symbols and extra roots;
//!      decides Copy / Redirect / Nullify once per live address
//! ```
//!
//! The builder is not `Clone` and [`ArchiveBuilder::build`] consumes it, so a
//! session can neither be shared nor reused. Calling a phase out of order is
//! an [`ArchiveError::InvalidState`].

mod copy;
mod gather;
mod relocate;

use crate::address::{ArchiveOffset, BufferAddr, RequestedAddr, SourceAddr};
use crate::catalog::Catalog;
use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, Result};
use crate::graph::{HeapGraph, SourceGraph};
use crate::heap::{ArchiveHeapAllocator, HeapArchive};
use crate::logging::{BuildEvent, BuildLogger};
use crate::space::{DumpSpace, PtrMap, RegionKind};
use crate::vtable::{LiveVtables, VtableCloner};
use farc_util::align::align_up_u64;
use gather::GatherPlan;
use std::fmt;
use std::path::Path;

/// Phase a build session is about to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BuildPhase {
    Gather,
    Copy,
    Relocate,
    Done,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildPhase::Gather => "gather",
            BuildPhase::Copy => "copy",
            BuildPhase::Relocate => "relocate",
            BuildPhase::Done => "done",
        })
    }
}

/// A base archive already mapped into the building process
///
/// Objects inside `[mapped_base, mapped_end)` are not copied again; pointers
/// to them are rewritten to the base archive's own requested addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseArchive {
    pub name: String,
    pub mapped_base: u64,
    pub mapped_end: u64,
    pub requested_base: u64,
    /// Header checksum of the base archive file
    pub header_crc: u32,
}

impl BaseArchive {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.mapped_base && addr < self.mapped_end
    }

    pub fn size(&self) -> u64 {
        self.mapped_end - self.mapped_base
    }

    pub fn requested_end(&self) -> u64 {
        self.requested_base + self.size()
    }

    /// Requested address of a mapped address inside the base archive
    pub fn to_requested(&self, addr: u64) -> u64 {
        addr - self.mapped_base + self.requested_base
    }
}

/// One object or table in the finished layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutEntry {
    pub region: RegionKind,
    pub offset: ArchiveOffset,
    pub size: usize,
    pub label: String,
    pub name: Option<String>,
    /// Live address of copied objects
    pub source: Option<SourceAddr>,
}

/// Counters of one build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub copied: usize,
    pub nullified: usize,
    pub redirected: usize,
    pub estimated_bytes: usize,
    pub reserved_bytes: usize,
    pub rw_bytes: usize,
    pub ro_bytes: usize,
    pub relocated_pointers: usize,
    pub nulls_cleared: usize,
    pub base_archive_pointers: usize,
    pub heap_objects: usize,
}

/// Finished, relocated archive image ready to be written
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub config: ArchiveConfig,
    pub requested_base: RequestedAddr,
    pub rw: Vec<u8>,
    pub ro: Vec<u8>,
    /// Compacted; bit `i` covers archive offset `8 * i`
    pub ptrmap: PtrMap,
    pub cloned_vtables_offset: ArchiveOffset,
    pub serialized_data_offset: ArchiveOffset,
    pub heap: Option<HeapArchive>,
    pub base_archive: Option<BaseArchive>,
    pub layout: Vec<LayoutEntry>,
    pub stats: BuildStats,
}

impl BuiltArchive {
    pub fn is_dynamic(&self) -> bool {
        self.base_archive.is_some()
    }

    /// Total size of the core regions
    pub fn core_size(&self) -> usize {
        self.rw.len() + self.ro.len()
    }

    /// Bytes at an archive offset, spanning rw and ro
    pub fn bytes_at(&self, offset: ArchiveOffset, len: usize) -> Option<&[u8]> {
        let start = offset.as_usize();
        let end = start.checked_add(len)?;
        if end <= self.rw.len() {
            self.rw.get(start..end)
        } else if start >= self.rw.len() {
            self.ro.get(start - self.rw.len()..end - self.rw.len())
        } else {
            None
        }
    }

    /// Write the archive file
    pub fn write(&self, path: &Path) -> Result<crate::archive::ArchiveHeader> {
        crate::archive::ArchiveWriter::new(self).write(path)
    }

    /// Write the human-readable layout trace
    pub fn write_map_log(&self, path: &Path) -> Result<()> {
        crate::archive::MapLogger::new(self).write_to(path)
    }
}

/// Build session
pub struct ArchiveBuilder<'g> {
    config: ArchiveConfig,
    source: &'g dyn SourceGraph,
    heap: Option<&'g dyn HeapGraph>,
    live_vtables: &'g LiveVtables,
    base_archive: Option<BaseArchive>,
    heap_allocator: Option<Box<dyn ArchiveHeapAllocator + 'g>>,
    logger: BuildLogger,
    phase: BuildPhase,
    requested_base: u64,
    catalog: Catalog,
    plan: Option<GatherPlan>,
    space: Option<DumpSpace>,
    cloner: VtableCloner,
    layout: Vec<LayoutEntry>,
    heap_archive: Option<HeapArchive>,
    serialized_data: Option<BufferAddr>,
    stats: BuildStats,
}

impl<'g> ArchiveBuilder<'g> {
    pub fn new(
        config: ArchiveConfig,
        source: &'g dyn SourceGraph,
        live_vtables: &'g LiveVtables,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            requested_base: config.requested_base_address,
            config,
            source,
            heap: None,
            live_vtables,
            base_archive: None,
            heap_allocator: None,
            logger: BuildLogger::default(),
            phase: BuildPhase::Gather,
            catalog: Catalog::new(),
            plan: None,
            space: None,
            cloner: VtableCloner::new(),
            layout: Vec::new(),
            heap_archive: None,
            serialized_data: None,
            stats: BuildStats::default(),
        })
    }

    /// Archive heap subgraphs from `heap`
    pub fn with_heap(mut self, heap: &'g dyn HeapGraph) -> Self {
        self.heap = Some(heap);
        self
    }

    /// Use a collector-provided heap allocator instead of a [`crate::heap::BumpArchiveHeap`]
    pub fn with_heap_allocator(mut self, allocator: Box<dyn ArchiveHeapAllocator + 'g>) -> Self {
        self.heap_allocator = Some(allocator);
        self
    }

    /// Build a dynamic archive layered on top of `base`
    ///
    /// The archive is requested directly behind the base archive's requested
    /// range, and heap archiving is skipped.
    pub fn with_base_archive(mut self, base: BaseArchive) -> Self {
        let alignment = self.config.core_region_alignment as u64;
        self.requested_base = align_up_u64(base.requested_end(), alignment);
        self.base_archive = Some(base);
        self
    }

    pub fn with_logger(mut self, logger: BuildLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn logger(&self) -> &BuildLogger {
        &self.logger
    }

    pub fn phase(&self) -> BuildPhase {
        self.phase
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn requested_base(&self) -> RequestedAddr {
        RequestedAddr(self.requested_base)
    }

    fn enter(&self, phase: BuildPhase) -> Result<()> {
        if self.phase != phase {
            return Err(ArchiveError::InvalidState {
                expected: format!("{phase} phase"),
                actual: format!("{} phase", self.phase),
            });
        }
        Ok(())
    }

    fn space_mut(&mut self) -> Result<&mut DumpSpace> {
        self.space.as_mut().ok_or_else(|| ArchiveError::InvalidState {
            expected: "reserved build buffer".to_string(),
            actual: "no reservation".to_string(),
        })
    }

    /// Phase 1: walk the roots and size the reservation
    pub fn gather(&mut self) -> Result<()> {
        self.enter(BuildPhase::Gather)?;
        let plan = self.logger.phase("gather", || {
            gather::gather(
                self.source,
                &mut self.catalog,
                &self.config,
                self.base_archive.as_ref(),
                &self.logger,
            )
        })?;
        self.stats.copied = plan.rw.len() + plan.ro.len();
        self.stats.nullified = plan.nullified;
        self.stats.redirected = plan.redirected;

        let estimate = self.estimate(&plan);
        let capacity = self.config.reserve_size.unwrap_or(estimate);
        let space = DumpSpace::reserve(
            capacity,
            self.config.core_region_alignment,
            self.config.object_alignment,
        )?;
        self.stats.estimated_bytes = estimate;
        self.stats.reserved_bytes = space.reserved();
        self.logger.log(BuildEvent::CapacityEstimate {
            objects: self.stats.copied,
            estimated_bytes: estimate,
            reserved_bytes: space.reserved(),
        });

        self.space = Some(space);
        self.plan = Some(plan);
        self.phase = BuildPhase::Copy;
        Ok(())
    }

    /// Phase 2: lay out and copy every gathered object
    pub fn copy(&mut self) -> Result<()> {
        self.enter(BuildPhase::Copy)?;
        let start = std::time::Instant::now();
        self.logger.log(BuildEvent::PhaseStart {
            phase: "copy".to_string(),
        });
        self.copy_phase()?;
        self.logger.log(BuildEvent::PhaseEnd {
            phase: "copy".to_string(),
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        });
        self.phase = BuildPhase::Relocate;
        Ok(())
    }

    /// Phase 3: rewrite every pointer to its requested address
    pub fn relocate(&mut self) -> Result<()> {
        self.enter(BuildPhase::Relocate)?;
        let start = std::time::Instant::now();
        self.logger.log(BuildEvent::PhaseStart {
            phase: "relocate".to_string(),
        });
        self.relocate_phase()?;
        self.logger.log(BuildEvent::PhaseEnd {
            phase: "relocate".to_string(),
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        });
        self.phase = BuildPhase::Done;
        Ok(())
    }

    /// Take the finished image out of the session
    pub fn finish(mut self) -> Result<BuiltArchive> {
        self.enter(BuildPhase::Done)?;
        let cloner = std::mem::take(&mut self.cloner);
        let space = self.space_mut()?;
        cloner.zero_before_write(space)?;

        let base = space.base();
        let rw = space.region_bytes(RegionKind::ReadWrite)?.to_vec();
        let ro = space.region_bytes(RegionKind::ReadOnly)?.to_vec();
        let ptrmap = space.ptrmap().clone();

        let table = cloner.table().ok_or_else(|| {
            ArchiveError::Internal("vtable clone table was never allocated".to_string())
        })?;
        let serialized = self.serialized_data.ok_or_else(|| {
            ArchiveError::Internal("serialized data block was never written".to_string())
        })?;

        self.stats.rw_bytes = rw.len();
        self.stats.ro_bytes = ro.len();
        Ok(BuiltArchive {
            config: self.config,
            requested_base: RequestedAddr(self.requested_base),
            rw,
            ro,
            ptrmap,
            cloned_vtables_offset: ArchiveOffset::new(table.offset_from(base)),
            serialized_data_offset: ArchiveOffset::new(serialized.offset_from(base)),
            heap: self.heap_archive,
            base_archive: self.base_archive,
            layout: self.layout,
            stats: self.stats,
        })
    }

    /// Run every phase
    pub fn build(mut self) -> Result<BuiltArchive> {
        self.gather()?;
        self.copy()?;
        self.relocate()?;
        self.finish()
    }

    fn heap_enabled(&self) -> bool {
        self.config.heap_archiving && self.heap.is_some() && self.base_archive.is_none()
    }
}

impl fmt::Debug for ArchiveBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveBuilder")
            .field("phase", &self.phase)
            .field("requested_base", &self.requested_base)
            .field("records", &self.catalog.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{MemoryGraph, MetaKind};

    fn config() -> ArchiveConfig {
        ArchiveConfig {
            heap_archiving: false,
            core_region_alignment: 4096,
            ..Default::default()
        }
    }

    #[test]
    fn test_phases_must_run_in_order() {
        let graph = MemoryGraph::new();
        let live = LiveVtables::standard();
        let mut builder = ArchiveBuilder::new(config(), &graph, &live).unwrap();

        assert!(matches!(builder.copy(), Err(ArchiveError::InvalidState { .. })));
        builder.gather().unwrap();
        assert!(matches!(builder.gather(), Err(ArchiveError::InvalidState { .. })));
        assert!(matches!(builder.relocate(), Err(ArchiveError::InvalidState { .. })));
        builder.copy().unwrap();
        builder.relocate().unwrap();
        assert_eq!(builder.phase(), BuildPhase::Done);
        builder.finish().unwrap();
    }

    #[test]
    fn test_empty_graph_builds() {
        let graph = MemoryGraph::new();
        let live = LiveVtables::standard();
        let built = ArchiveBuilder::new(config(), &graph, &live)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(built.stats.copied, 0);
        assert_eq!(built.rw.len(), 4096);
        assert!(built.ptrmap.is_compacted());
    }

    #[test]
    fn test_dynamic_archive_requests_address_after_base() {
        let graph = MemoryGraph::new();
        let live = LiveVtables::standard();
        let base = BaseArchive {
            name: "base.farc".to_string(),
            mapped_base: 0x7000_0000,
            mapped_end: 0x7000_3000,
            requested_base: 0x8_0000_0000,
            header_crc: 1,
        };
        let builder = ArchiveBuilder::new(config(), &graph, &live)
            .unwrap()
            .with_base_archive(base);
        assert_eq!(builder.requested_base(), RequestedAddr(0x8_0000_3000));
    }

    #[test]
    fn test_excluded_kind_is_counted() {
        let mut graph = MemoryGraph::new();
        let class = graph.add_class(MetaKind::InstanceClass, "A", 32).unwrap();
        let profile = graph.add_metadata(MetaKind::MethodData, 16).unwrap();
        graph.set_pointer(class, 8, profile).unwrap();
        let live = LiveVtables::standard();
        let built = ArchiveBuilder::new(config(), &graph, &live)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(built.stats.nullified, 1);
        assert_eq!(built.stats.copied, 1);
    }
}
