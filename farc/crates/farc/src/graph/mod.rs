//! Graph Module - The Live Object Graph Being Archived
//!
//! The builder never owns the objects it archives. It reads them through
//! two collaborator traits:
//!
//! - [`SourceGraph`]: class metadata and interned symbols (the "metaspace"
//!   side), copied byte-for-byte into the rw/ro regions.
//! - [`HeapGraph`]: ordinary heap objects reachable from a fixed list of
//!   static fields, copied into the heap regions one object at a time.
//!
//! Pointer fields inside object bytes hold live [`SourceAddr`] values as
//! little-endian 64-bit words. The traits expose where those fields are, so
//! the builder can walk the graph without understanding any object layout.
//!
//! [`MemoryGraph`] is a complete in-process implementation used by the
//! command-line tool and the tests.

mod description;
mod memory;

pub use description::{GraphDescription, HeapObjectDescription, MetadataDescription};
pub use memory::MemoryGraph;

use crate::address::{read_word, SourceAddr};
use crate::space::RegionKind;
use crate::vtable::VtableKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of metadata kinds the builder knows how to archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MetaKind {
    /// Interned UTF-8 symbol
    Symbol,
    /// Class with instance fields and methods
    InstanceClass,
    /// Array class
    ArrayClass,
    /// Method (mutable part)
    Method,
    /// Immutable method body
    ConstMethod,
    /// Per-class constant pool
    ConstantPool,
    /// Invocation counters
    MethodCounters,
    /// Profiling data; nullified by the default policy
    MethodData,
    /// Annotation blobs
    Annotations,
    /// Plain metadata array
    Array,
}

impl MetaKind {
    pub const ALL: [MetaKind; 10] = [
        MetaKind::Symbol,
        MetaKind::InstanceClass,
        MetaKind::ArrayClass,
        MetaKind::Method,
        MetaKind::ConstMethod,
        MetaKind::ConstantPool,
        MetaKind::MethodCounters,
        MetaKind::MethodData,
        MetaKind::Annotations,
        MetaKind::Array,
    ];

    /// Region an archived copy of this kind lives in
    pub fn region(self) -> RegionKind {
        match self {
            MetaKind::Symbol | MetaKind::ConstMethod | MetaKind::Annotations | MetaKind::Array => {
                RegionKind::ReadOnly
            },
            MetaKind::InstanceClass
            | MetaKind::ArrayClass
            | MetaKind::Method
            | MetaKind::ConstantPool
            | MetaKind::MethodCounters
            | MetaKind::MethodData => RegionKind::ReadWrite,
        }
    }

    /// Dispatch-table family, for polymorphic kinds
    pub fn vtable_kind(self) -> Option<VtableKind> {
        match self {
            MetaKind::InstanceClass => Some(VtableKind::InstanceClass),
            MetaKind::ArrayClass => Some(VtableKind::ArrayClass),
            MetaKind::Method => Some(VtableKind::Method),
            MetaKind::ConstantPool => Some(VtableKind::ConstantPool),
            _ => None,
        }
    }

    pub fn is_class(self) -> bool {
        matches!(self, MetaKind::InstanceClass | MetaKind::ArrayClass)
    }

    pub fn name(self) -> &'static str {
        match self {
            MetaKind::Symbol => "Symbol",
            MetaKind::InstanceClass => "InstanceClass",
            MetaKind::ArrayClass => "ArrayClass",
            MetaKind::Method => "Method",
            MetaKind::ConstMethod => "ConstMethod",
            MetaKind::ConstantPool => "ConstantPool",
            MetaKind::MethodCounters => "MethodCounters",
            MetaKind::MethodData => "MethodData",
            MetaKind::Annotations => "Annotations",
            MetaKind::Array => "Array",
        }
    }
}

impl fmt::Display for MetaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One live metadata object
///
/// For polymorphic kinds the first word of `bytes` is the live dispatch
/// pointer and must not be listed in `pointer_offsets`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceObject {
    pub kind: MetaKind,
    pub bytes: Vec<u8>,
    /// Byte offsets of pointer fields, ascending, 8-byte aligned
    pub pointer_offsets: Vec<usize>,
    /// Fully-qualified name (classes only); the class sort key
    pub name: Option<String>,
    /// Creation-order surrogate key (symbols); the symbol sort key
    pub sort_key: u64,
    /// Set for classes that failed eligibility checks
    pub unrepresentable: bool,
}

impl SourceObject {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Iterate `(offset, target)` for every pointer field, in offset order
    pub fn pointer_fields(&self) -> impl Iterator<Item = (usize, SourceAddr)> + '_ {
        self.pointer_offsets
            .iter()
            .map(move |&offset| (offset, SourceAddr(read_word(&self.bytes, offset))))
    }
}

/// Collaborator: class/symbol graph visitor
pub trait SourceGraph {
    /// Look up a live metadata object
    fn object(&self, addr: SourceAddr) -> Option<&SourceObject>;

    /// Loaded classes to archive
    fn class_roots(&self) -> Vec<SourceAddr>;

    /// Interned symbol table
    fn symbol_roots(&self) -> Vec<SourceAddr>;

    /// Externally supplied extra roots
    fn extra_roots(&self) -> Vec<SourceAddr> {
        Vec::new()
    }

    /// Depth-first visitor hook: call `f(offset, target)` for every field
    fn visit_fields(&self, addr: SourceAddr, f: &mut dyn FnMut(usize, SourceAddr)) {
        if let Some(obj) = self.object(addr) {
            for (offset, target) in obj.pointer_fields() {
                f(offset, target);
            }
        }
    }
}

/// One live heap object
///
/// The archived layout is a 24-byte [`crate::heap::ArchivedObjectHeader`]
/// followed by `payload`; `reference_offsets` and `loader_wiring_offsets`
/// are relative to the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapObject {
    /// Live class metadata of this object
    pub class: SourceAddr,
    /// Live mark word (identity hash plus transient lock/age bits)
    pub mark_word: u64,
    pub payload: Vec<u8>,
    /// Payload offsets of heap reference fields
    pub reference_offsets: Vec<usize>,
    /// Payload offsets of references to class-loader/module wiring, nulled when archived
    pub loader_wiring_offsets: Vec<usize>,
    /// False for objects whose state can never be archived
    pub archivable: bool,
}

impl HeapObject {
    pub fn reference_fields(&self) -> impl Iterator<Item = (usize, SourceAddr)> + '_ {
        self.reference_offsets
            .iter()
            .map(move |&offset| (offset, SourceAddr(read_word(&self.payload, offset))))
    }
}

/// A static field whose reachable heap subgraph is archived
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticFieldRoot {
    /// Live class declaring the field
    pub holder: SourceAddr,
    pub field_name: String,
    /// Offset of the field inside the holder's static storage
    pub field_offset: u32,
    /// Current field value
    pub value: SourceAddr,
}

/// Collaborator: heap graph and the fixed list of archived static fields
pub trait HeapGraph {
    fn heap_object(&self, addr: SourceAddr) -> Option<&HeapObject>;

    /// Named static fields to archive as subgraph roots
    fn static_roots(&self) -> Vec<StaticFieldRoot>;

    /// Interned strings, archived into the closed heap region
    fn interned_strings(&self) -> Vec<SourceAddr> {
        Vec::new()
    }
}
