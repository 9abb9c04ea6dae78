//! In-process live graph
//!
//! A self-contained [`SourceGraph`] + [`HeapGraph`] whose objects live in
//! plain vectors and carry synthetic, never-dereferenced addresses. Objects
//! are enumerated in creation order, which is exactly the incidental order
//! the builder must not depend on.

use super::{HeapGraph, HeapObject, MetaKind, SourceGraph, SourceObject, StaticFieldRoot};
use crate::address::{write_word, SourceAddr};
use crate::error::{ArchiveError, Result};
use farc_util::align::align_up;
use indexmap::IndexMap;

/// Default first synthetic address handed out
pub const DEFAULT_GRAPH_BASE: u64 = 0x1_0000_0000;

/// Synthetic live dispatch-table addresses, one page per kind
const LIVE_VTABLE_BASE: u64 = 0x5555_0000_0000;

/// Live graph held entirely in memory
#[derive(Debug, Clone)]
pub struct MemoryGraph {
    next_addr: u64,
    next_symbol_key: u64,
    metadata: IndexMap<SourceAddr, SourceObject>,
    heap: IndexMap<SourceAddr, HeapObject>,
    static_roots: Vec<StaticFieldRoot>,
    interned_strings: Vec<SourceAddr>,
    extra_roots: Vec<SourceAddr>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::with_base(DEFAULT_GRAPH_BASE)
    }

    /// Start handing out addresses at `base`
    pub fn with_base(base: u64) -> Self {
        Self {
            next_addr: align_up(base.max(16) as usize, 16) as u64,
            next_symbol_key: 0,
            metadata: IndexMap::new(),
            heap: IndexMap::new(),
            static_roots: Vec::new(),
            interned_strings: Vec::new(),
            extra_roots: Vec::new(),
        }
    }

    fn alloc_addr(&mut self, size: usize) -> SourceAddr {
        let addr = SourceAddr(self.next_addr);
        // Leave a gap so neighbouring objects never look contiguous
        self.next_addr += align_up(size.max(8), 16) as u64 + 16;
        addr
    }

    /// Address of the live dispatch table of `kind` in this process
    pub fn live_vtable_address(kind: MetaKind) -> Option<u64> {
        kind.vtable_kind()
            .map(|vk| LIVE_VTABLE_BASE + (vk.index() as u64) * 0x1000)
    }

    /// Intern a symbol; its sort key is its creation order
    pub fn add_symbol(&mut self, text: &str) -> SourceAddr {
        let key = self.next_symbol_key;
        self.add_symbol_with_key(text, key)
    }

    /// Intern a symbol with an explicit creation-order surrogate key
    pub fn add_symbol_with_key(&mut self, text: &str, sort_key: u64) -> SourceAddr {
        self.next_symbol_key = self.next_symbol_key.max(sort_key + 1);
        let mut bytes = Vec::with_capacity(8 + text.len());
        bytes.extend_from_slice(&(text.len() as u64).to_le_bytes());
        bytes.extend_from_slice(text.as_bytes());
        bytes.resize(align_up(bytes.len(), 8), 0);

        let addr = self.alloc_addr(bytes.len());
        self.metadata.insert(
            addr,
            SourceObject {
                kind: MetaKind::Symbol,
                bytes,
                pointer_offsets: Vec::new(),
                name: None,
                sort_key,
                unrepresentable: false,
            },
        );
        addr
    }

    /// Create a zero-filled metadata object of `size` bytes
    ///
    /// Polymorphic kinds get the live dispatch pointer in their first word.
    pub fn add_metadata(&mut self, kind: MetaKind, size: usize) -> Result<SourceAddr> {
        self.insert_metadata(kind, size, None)
    }

    /// Create a class; `name` is its fully-qualified name
    pub fn add_class(&mut self, kind: MetaKind, name: &str, size: usize) -> Result<SourceAddr> {
        if !kind.is_class() {
            return Err(ArchiveError::InvalidArgument(format!(
                "{kind} is not a class kind"
            )));
        }
        self.insert_metadata(kind, size, Some(name.to_string()))
    }

    fn insert_metadata(
        &mut self,
        kind: MetaKind,
        size: usize,
        name: Option<String>,
    ) -> Result<SourceAddr> {
        if kind == MetaKind::Symbol {
            return Err(ArchiveError::InvalidArgument(
                "symbols are created with add_symbol".to_string(),
            ));
        }
        let size = align_up(size.max(8), 8);
        let mut bytes = vec![0u8; size];
        if let Some(vtable) = Self::live_vtable_address(kind) {
            if size < 16 {
                return Err(ArchiveError::InvalidArgument(format!(
                    "{kind} needs room for a dispatch word and at least one field"
                )));
            }
            write_word(&mut bytes, 0, vtable);
        }

        let addr = self.alloc_addr(size);
        self.metadata.insert(
            addr,
            SourceObject {
                kind,
                bytes,
                pointer_offsets: Vec::new(),
                name,
                sort_key: 0,
                unrepresentable: false,
            },
        );
        Ok(addr)
    }

    fn metadata_mut(&mut self, addr: SourceAddr) -> Result<&mut SourceObject> {
        self.metadata
            .get_mut(&addr)
            .ok_or(ArchiveError::UnknownObject { address: addr.raw() })
    }

    fn check_slot(len: usize, offset: usize, first_reserved: bool) -> Result<()> {
        if offset % 8 != 0 || offset + 8 > len {
            return Err(ArchiveError::InvalidArgument(format!(
                "slot offset {offset} invalid for a {len}-byte object"
            )));
        }
        if first_reserved && offset == 0 {
            return Err(ArchiveError::InvalidArgument(
                "offset 0 holds the dispatch pointer".to_string(),
            ));
        }
        Ok(())
    }

    /// Store a pointer to `target` (or null) in a metadata field
    pub fn set_pointer(&mut self, obj: SourceAddr, offset: usize, target: SourceAddr) -> Result<()> {
        let object = self.metadata_mut(obj)?;
        Self::check_slot(object.bytes.len(), offset, object.kind.vtable_kind().is_some())?;
        write_word(&mut object.bytes, offset, target.raw());
        if let Err(pos) = object.pointer_offsets.binary_search(&offset) {
            object.pointer_offsets.insert(pos, offset);
        }
        Ok(())
    }

    /// Store a plain data word in a metadata field
    pub fn set_word(&mut self, obj: SourceAddr, offset: usize, value: u64) -> Result<()> {
        let object = self.metadata_mut(obj)?;
        Self::check_slot(object.bytes.len(), offset, object.kind.vtable_kind().is_some())?;
        write_word(&mut object.bytes, offset, value);
        if let Ok(pos) = object.pointer_offsets.binary_search(&offset) {
            object.pointer_offsets.remove(pos);
        }
        Ok(())
    }

    /// Flag a class as failing eligibility checks
    pub fn mark_unrepresentable(&mut self, obj: SourceAddr) -> Result<()> {
        self.metadata_mut(obj)?.unrepresentable = true;
        Ok(())
    }

    /// Register an extra metadata root
    pub fn add_extra_root(&mut self, addr: SourceAddr) {
        self.extra_roots.push(addr);
    }

    /// Create a heap object with a zero-filled payload
    pub fn add_heap_object(
        &mut self,
        class: SourceAddr,
        payload_size: usize,
        identity_hash: u32,
    ) -> SourceAddr {
        let payload_size = align_up(payload_size, 8);
        let addr = self.alloc_addr(payload_size + crate::heap::HEAP_HEADER_SIZE);
        // Live mark word: hash plus a non-zero age and lock bit pattern
        let mark_word = ((identity_hash as u64) << crate::heap::HASH_SHIFT) | 0b0011_0001;
        self.heap.insert(
            addr,
            HeapObject {
                class,
                mark_word,
                payload: vec![0u8; payload_size],
                reference_offsets: Vec::new(),
                loader_wiring_offsets: Vec::new(),
                archivable: true,
            },
        );
        addr
    }

    fn heap_mut(&mut self, addr: SourceAddr) -> Result<&mut HeapObject> {
        self.heap
            .get_mut(&addr)
            .ok_or(ArchiveError::UnknownObject { address: addr.raw() })
    }

    /// Store a heap reference in a payload field
    pub fn set_heap_ref(&mut self, obj: SourceAddr, offset: usize, target: SourceAddr) -> Result<()> {
        let object = self.heap_mut(obj)?;
        Self::check_slot(object.payload.len(), offset, false)?;
        write_word(&mut object.payload, offset, target.raw());
        if let Err(pos) = object.reference_offsets.binary_search(&offset) {
            object.reference_offsets.insert(pos, offset);
        }
        Ok(())
    }

    /// Store a plain data word in a payload field
    pub fn set_heap_word(&mut self, obj: SourceAddr, offset: usize, value: u64) -> Result<()> {
        let object = self.heap_mut(obj)?;
        Self::check_slot(object.payload.len(), offset, false)?;
        write_word(&mut object.payload, offset, value);
        Ok(())
    }

    /// Store a reference to class-loader/module wiring; archived as null
    pub fn set_loader_wiring(&mut self, obj: SourceAddr, offset: usize, target: SourceAddr) -> Result<()> {
        let object = self.heap_mut(obj)?;
        Self::check_slot(object.payload.len(), offset, false)?;
        write_word(&mut object.payload, offset, target.raw());
        if let Err(pos) = object.loader_wiring_offsets.binary_search(&offset) {
            object.loader_wiring_offsets.insert(pos, offset);
        }
        Ok(())
    }

    /// Flag a heap object as never archivable
    pub fn mark_unarchivable(&mut self, obj: SourceAddr) -> Result<()> {
        self.heap_mut(obj)?.archivable = false;
        Ok(())
    }

    pub fn add_static_root(
        &mut self,
        holder: SourceAddr,
        field_name: &str,
        field_offset: u32,
        value: SourceAddr,
    ) {
        self.static_roots.push(StaticFieldRoot {
            holder,
            field_name: field_name.to_string(),
            field_offset,
            value,
        });
    }

    pub fn add_interned_string(&mut self, addr: SourceAddr) {
        self.interned_strings.push(addr);
    }

    pub fn metadata_count(&self) -> usize {
        self.metadata.len()
    }

    pub fn heap_count(&self) -> usize {
        self.heap.len()
    }
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceGraph for MemoryGraph {
    fn object(&self, addr: SourceAddr) -> Option<&SourceObject> {
        self.metadata.get(&addr)
    }

    fn class_roots(&self) -> Vec<SourceAddr> {
        self.metadata
            .iter()
            .filter(|(_, obj)| obj.kind.is_class())
            .map(|(addr, _)| *addr)
            .collect()
    }

    fn symbol_roots(&self) -> Vec<SourceAddr> {
        self.metadata
            .iter()
            .filter(|(_, obj)| obj.kind == MetaKind::Symbol)
            .map(|(addr, _)| *addr)
            .collect()
    }

    fn extra_roots(&self) -> Vec<SourceAddr> {
        self.extra_roots.clone()
    }
}

impl HeapGraph for MemoryGraph {
    fn heap_object(&self, addr: SourceAddr) -> Option<&HeapObject> {
        self.heap.get(&addr)
    }

    fn static_roots(&self) -> Vec<StaticFieldRoot> {
        self.static_roots.clone()
    }

    fn interned_strings(&self) -> Vec<SourceAddr> {
        self.interned_strings.clone()
    }
}
