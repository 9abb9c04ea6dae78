//! Archive Module - File Format, Writer, Loader
//!
//! ```text
//! BuiltArchive ──ArchiveWriter──▶ file ──ArchiveFile::open──▶ validated bytes
//!                                                     │
//!                                   MappedArchive::map / MappedHeap::map
//!                                                     │
//!                                       relocated, spliced, queryable
//! ```
//!
//! [`MapLogger`] renders the layout of a [`BuiltArchive`](crate::BuiltArchive)
//! for diagnostics.

mod header;
mod loader;
mod map_log;
pub mod tables;
mod writer;

pub use header::{
    flags, ArchiveHeader, HeaderFields, RegionIndex, RegionRecord, ARCHIVE_VERSION,
    DYNAMIC_MAGIC, HEADER_SIZE, NUM_REGIONS, STATIC_MAGIC,
};
pub use loader::{ArchiveFile, MapOptions, MappedArchive, MappedHeap};
pub use map_log::MapLogger;
pub use writer::ArchiveWriter;
