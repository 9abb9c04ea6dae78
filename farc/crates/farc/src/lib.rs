//! # FARC - Relocatable Object Graph Archives
//!
//! FARC snapshots a live graph of class metadata, interned symbols and a
//! selected set of heap objects into a single file that a later process maps
//! at a fixed address and uses in place, with no parsing and no per-object
//! work beyond an optional pointer fix-up pass.
//!
//! ## Overview
//!
//! - **Deterministic builds**: the same graph and configuration always produce
//!   byte-identical archives
//! - **Relocatable**: every pointer slot is recorded in a bitmap, so a loader
//!   that cannot get the requested address patches pointers by one delta
//! - **Dispatch-table cloning**: polymorphic objects point at archived clone
//!   slots that the loader overwrites with its own tables
//! - **Heap subgraphs**: static fields' reachable objects are archived with the
//!   list of classes that must be initialized before they are published
//! - **Layered archives**: a dynamic archive may point into a base archive
//!
//! ## Quick Start
//!
//! ```rust
//! use farc::{ArchiveBuilder, ArchiveConfig, LiveVtables, MemoryGraph, MetaKind};
//!
//! fn main() -> Result<(), farc::ArchiveError> {
//!     let mut graph = MemoryGraph::new();
//!     let class = graph.add_class(MetaKind::InstanceClass, "com/example/Main", 32)?;
//!     let name = graph.add_symbol("com/example/Main");
//!     graph.set_pointer(class, 8, name)?;
//!
//!     let config = ArchiveConfig {
//!         heap_archiving: false,
//!         ..Default::default()
//!     };
//!     let live = LiveVtables::standard();
//!     let built = ArchiveBuilder::new(config, &graph, &live)?.build()?;
//!     assert_eq!(built.stats.copied, 2);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │         SourceGraph / HeapGraph (live objects)            │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ ArchiveBuilder                                            │
//! │   Gather   ── walk from sorted roots, one Catalog record  │
//! │   Copy     ── DumpSpace rw/ro, VtableCloner, HeapArchiver │
//! │   Relocate ── live → buffer → requested, PtrMap compacted │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │ BuiltArchive
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ ArchiveWriter ── header + rw + ro + bitmap + heap ranges  │
//! │ MapLogger     ── layout trace                             │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │ file
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ ArchiveFile → MappedArchive (+ MappedHeap)                │
//! │   validate, map, relocate, splice tables, restore         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ### Address Spaces
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`SourceAddr`] | Live address in the building process |
//! | [`BufferAddr`] | Address inside the build reservation |
//! | [`RequestedAddr`] | Address the archive is designed to be mapped at |
//! | [`ArchiveOffset`] | Offset from the start of the rw region |
//! | [`HeapAddr`] | Archived heap address at the heap requested base |
//!
//! ## Logging
//!
//! Everything goes through the `log` facade under these targets:
//!
//! - `farc::builder`: phases, capacity, copy and relocation summaries
//! - `farc::heap`: heap ranges, subgraphs, abandoned fields
//! - `farc::map`: the map log at `trace`
//! - `farc::loader`: validation and relocation at load
//!
//! ## Safety
//!
//! The crate maps memory only through `memmap2` anonymous mappings and never
//! dereferences archived addresses directly; every read goes through offset
//! arithmetic on the mapped bytes.

pub mod address;
pub mod archive;
pub mod builder;
pub mod catalog;
pub mod config;
pub mod error;
pub mod graph;
pub mod heap;
pub mod logging;
pub mod space;
pub mod vtable;

pub use address::{ArchiveOffset, BufferAddr, HeapAddr, RequestedAddr, SourceAddr};
pub use archive::{
    ArchiveFile, ArchiveHeader, ArchiveWriter, MapLogger, MapOptions, MappedArchive,
    MappedHeap, RegionIndex,
};
pub use builder::{ArchiveBuilder, BaseArchive, BuildPhase, BuildStats, BuiltArchive};
pub use catalog::{Catalog, Disposition};
pub use config::ArchiveConfig;
pub use error::{ArchiveError, ErrorCategory, Result};
pub use graph::{
    GraphDescription, HeapGraph, HeapObject, MemoryGraph, MetaKind, SourceGraph, SourceObject,
    StaticFieldRoot,
};
pub use heap::{
    ArchiveHeapAllocator, ArchivedClass, BumpArchiveHeap, ClassInitializer, HeapArchive,
    RestoreOutcome, StaticFieldSink, SubgraphRestorer,
};
pub use logging::{BuildEvent, BuildLogger, BuildLoggerConfig, LogLevel};
pub use space::{DumpSpace, PtrMap, RegionKind};
pub use vtable::{DispatchTable, LiveVtables, VtableKind};
