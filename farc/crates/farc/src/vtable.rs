//! Vtable Cloner - Dispatch Tables That Survive Relocation
//!
//! Polymorphic metadata carries a dispatch pointer in its first word. The
//! live value is a code address of the building process and means nothing
//! to any other process, so the archive instead stores a pointer to a
//! per-kind *clone slot* inside the rw region:
//!
//! ```text
//! rw + cloned_vtables_offset:  [slot ptr; NUM_VTABLE_KINDS]
//! clone slot:                  [len: u64][entry 0] .. [entry len-1]
//!                                         ^
//!                 archived object word 0 ─┘
//! ```
//!
//! Slot entries are zeroed before the archive is written. A loading process
//! splices its own live table into every slot before touching any archived
//! object, and dispatches through [`VtableKind`] so the call is always typed:
//! no code address read from the archive is ever called.

use crate::address::{read_word, write_word, BufferAddr};
use crate::error::{ArchiveError, Result};
use crate::space::{DumpSpace, RegionKind};
use farc_util::WORD_SIZE;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of polymorphic kinds with a clone slot
pub const NUM_VTABLE_KINDS: usize = 4;

/// Closed set of polymorphic archived kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VtableKind {
    InstanceClass,
    ArrayClass,
    Method,
    ConstantPool,
}

impl VtableKind {
    pub const ALL: [VtableKind; NUM_VTABLE_KINDS] = [
        VtableKind::InstanceClass,
        VtableKind::ArrayClass,
        VtableKind::Method,
        VtableKind::ConstantPool,
    ];

    /// Position of this kind's pointer in the clone table
    pub fn index(self) -> usize {
        match self {
            VtableKind::InstanceClass => 0,
            VtableKind::ArrayClass => 1,
            VtableKind::Method => 2,
            VtableKind::ConstantPool => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            VtableKind::InstanceClass => "InstanceClass",
            VtableKind::ArrayClass => "ArrayClass",
            VtableKind::Method => "Method",
            VtableKind::ConstantPool => "ConstantPool",
        }
    }
}

impl fmt::Display for VtableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A virtual method: receives the object's bytes (from its start to the end
/// of the mapped region)
pub type MethodFn = fn(&[u8]) -> u64;

/// Live dispatch table of one kind in the current process
#[derive(Clone)]
pub struct DispatchTable {
    kind: VtableKind,
    methods: Vec<MethodFn>,
}

impl DispatchTable {
    pub fn new(kind: VtableKind, methods: Vec<MethodFn>) -> Self {
        Self { kind, methods }
    }

    pub fn kind(&self) -> VtableKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn method(&self, index: usize) -> Option<MethodFn> {
        self.methods.get(index).copied()
    }

    /// Raw table words as they would sit in memory
    pub fn words(&self) -> Vec<u64> {
        self.methods.iter().map(|&m| m as usize as u64).collect()
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("kind", &self.kind)
            .field("len", &self.methods.len())
            .finish()
    }
}

/// Registry of the live dispatch tables of this process
#[derive(Debug, Clone, Default)]
pub struct LiveVtables {
    tables: [Option<DispatchTable>; NUM_VTABLE_KINDS],
}

impl LiveVtables {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in tables of this process, one per kind
    pub fn standard() -> Self {
        let mut live = Self::new();
        for kind in VtableKind::ALL {
            live.register(standard_table(kind));
        }
        live
    }

    pub fn register(&mut self, table: DispatchTable) {
        let index = table.kind().index();
        self.tables[index] = Some(table);
    }

    pub fn get(&self, kind: VtableKind) -> Option<&DispatchTable> {
        self.tables[kind.index()].as_ref()
    }

    pub fn require(&self, kind: VtableKind) -> Result<&DispatchTable> {
        self.get(kind).ok_or_else(|| ArchiveError::MissingVtable {
            kind: kind.name().to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &DispatchTable> + '_ {
        self.tables.iter().flatten()
    }
}

/// Method indices of the standard tables
pub mod methods {
    /// Returns the kind tag (`VtableKind::index() + 1`)
    pub const KIND_TAG: usize = 0;
    /// Returns the word at byte offset 8
    pub const FIRST_FIELD: usize = 1;
    /// Returns 1 for array-like kinds
    pub const IS_ARRAY: usize = 2;
}

fn first_field(object: &[u8]) -> u64 {
    if object.len() < 2 * WORD_SIZE {
        return 0;
    }
    read_word(object, WORD_SIZE)
}

fn is_not_array(_: &[u8]) -> u64 {
    0
}

fn is_array(_: &[u8]) -> u64 {
    1
}

fn standard_table(kind: VtableKind) -> DispatchTable {
    let tag: MethodFn = match kind {
        VtableKind::InstanceClass => |_| 1,
        VtableKind::ArrayClass => |_| 2,
        VtableKind::Method => |_| 3,
        VtableKind::ConstantPool => |_| 4,
    };
    let array: MethodFn = match kind {
        VtableKind::ArrayClass => is_array,
        _ => is_not_array,
    };
    DispatchTable::new(kind, vec![tag, first_field, array])
}

#[derive(Debug, Clone, Copy)]
struct ClonedSlot {
    /// Address of entry 0 (what archived objects point at)
    entries: BufferAddr,
    len: usize,
}

/// Build-side cloner: owns the clone table of one session
#[derive(Debug, Default)]
pub struct VtableCloner {
    table: Option<BufferAddr>,
    slots: [Option<ClonedSlot>; NUM_VTABLE_KINDS],
}

impl VtableCloner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the clone table and one slot per registered kind in rw
    ///
    /// Must run before any polymorphic object is copied. Returns the
    /// address of the clone table.
    pub fn capture(&mut self, space: &mut DumpSpace, live: &LiveVtables) -> Result<BufferAddr> {
        if self.table.is_some() {
            return Err(ArchiveError::InvalidState {
                expected: "vtables not captured".to_string(),
                actual: "already captured".to_string(),
            });
        }
        let table = space.allocate(RegionKind::ReadWrite, NUM_VTABLE_KINDS * WORD_SIZE)?;

        for kind in VtableKind::ALL {
            let Some(live_table) = live.get(kind) else {
                continue;
            };
            let words = live_table.words();
            let slot = space.allocate(RegionKind::ReadWrite, (words.len() + 1) * WORD_SIZE)?;
            let bytes = space.bytes_mut(slot, (words.len() + 1) * WORD_SIZE)?;
            write_word(bytes, 0, words.len() as u64);
            for (i, word) in words.iter().enumerate() {
                write_word(bytes, (i + 1) * WORD_SIZE, *word);
            }

            let entries = slot.add(WORD_SIZE);
            space.write_pointer(table.add(kind.index() * WORD_SIZE), entries)?;
            self.slots[kind.index()] = Some(ClonedSlot {
                entries,
                len: words.len(),
            });
            log::debug!(
                target: "farc::builder",
                "cloned {} vtable ({} entries) at {:?}",
                kind,
                words.len(),
                entries
            );
        }

        self.table = Some(table);
        Ok(table)
    }

    /// Address of the clone slot entries for `kind`
    pub fn archived_table(&self, kind: VtableKind) -> Result<BufferAddr> {
        self.slots[kind.index()]
            .map(|slot| slot.entries)
            .ok_or_else(|| ArchiveError::MissingVtable {
                kind: kind.name().to_string(),
            })
    }

    /// Replace the dispatch word of a freshly copied object
    pub fn patch_object(
        &self,
        space: &mut DumpSpace,
        object: BufferAddr,
        kind: VtableKind,
    ) -> Result<()> {
        let entries = self.archived_table(kind)?;
        space.write_pointer(object, entries)
    }

    pub fn table(&self) -> Option<BufferAddr> {
        self.table
    }

    /// Erase every captured code address; slot lengths stay
    pub fn zero_before_write(&self, space: &mut DumpSpace) -> Result<()> {
        for slot in self.slots.iter().flatten() {
            space
                .bytes_mut(slot.entries, slot.len * WORD_SIZE)?
                .fill(0);
        }
        Ok(())
    }
}

/// Overwrite a mapped clone slot with the current process's table
///
/// `region` is the mapped bytes and `entries` the offset of entry 0.
pub fn splice_slot(region: &mut [u8], entries: usize, table: &DispatchTable) -> Result<()> {
    if entries < WORD_SIZE || entries > region.len() {
        return Err(ArchiveError::BadHeader(format!(
            "{} clone slot at {entries:#x} lies outside the rw region",
            table.kind()
        )));
    }
    let archived_len = read_word(region, entries - WORD_SIZE) as usize;
    let fits = archived_len
        .checked_mul(WORD_SIZE)
        .and_then(|bytes| bytes.checked_add(entries))
        .is_some_and(|end| end <= region.len());
    if archived_len != table.len() || !fits {
        return Err(ArchiveError::VtableMismatch {
            kind: table.kind().name().to_string(),
            archived: archived_len,
            live: table.len(),
        });
    }
    for (i, word) in table.words().into_iter().enumerate() {
        write_word(region, entries + i * WORD_SIZE, word);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_tables_are_distinct_per_kind() {
        let live = LiveVtables::standard();
        let tags: Vec<u64> = VtableKind::ALL
            .iter()
            .map(|&k| live.get(k).unwrap().method(methods::KIND_TAG).unwrap()(&[]))
            .collect();
        assert_eq!(tags, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_capture_writes_slots_and_marks_table() {
        let mut space = DumpSpace::reserve(4096, 4096, 8).unwrap();
        let live = LiveVtables::standard();
        let mut cloner = VtableCloner::new();
        let table = cloner.capture(&mut space, &live).unwrap();

        let entries = cloner.archived_table(VtableKind::Method).unwrap();
        let table_word = space
            .read_word(table.add(VtableKind::Method.index() * WORD_SIZE))
            .unwrap();
        assert_eq!(table_word, entries.raw());
        assert_eq!(space.read_word(entries.add(0)).unwrap(), live.get(VtableKind::Method).unwrap().words()[0]);
        assert_eq!(space.ptrmap().count_set(), NUM_VTABLE_KINDS);

        cloner.zero_before_write(&mut space).unwrap();
        assert_eq!(space.read_word(entries).unwrap(), 0);
        assert_eq!(space.read_word(BufferAddr(entries.raw() - 8)).unwrap(), 3);
    }

    #[test]
    fn test_unregistered_kind_has_no_slot() {
        let mut space = DumpSpace::reserve(4096, 4096, 8).unwrap();
        let mut live = LiveVtables::new();
        live.register(standard_table(VtableKind::InstanceClass));
        let mut cloner = VtableCloner::new();
        cloner.capture(&mut space, &live).unwrap();
        assert!(matches!(
            cloner.archived_table(VtableKind::ConstantPool),
            Err(ArchiveError::MissingVtable { .. })
        ));
    }

    #[test]
    fn test_splice_rejects_length_mismatch() {
        let mut region = vec![0u8; 64];
        write_word(&mut region, 8, 2);
        let table = standard_table(VtableKind::Method);
        assert!(matches!(
            splice_slot(&mut region, 16, &table),
            Err(ArchiveError::VtableMismatch { archived: 2, live: 3, .. })
        ));
    }

    #[test]
    fn test_splice_rejects_huge_archived_length() {
        let mut region = vec![0u8; 64];
        write_word(&mut region, 8, u64::MAX / 4);
        let table = standard_table(VtableKind::Method);
        assert!(matches!(
            splice_slot(&mut region, 16, &table),
            Err(ArchiveError::VtableMismatch { live: 3, .. })
        ));
    }

    #[test]
    fn test_splice_rejects_slot_running_off_region() {
        let mut region = vec![0u8; 32];
        write_word(&mut region, 8, 3);
        let table = standard_table(VtableKind::Method);
        assert!(matches!(
            splice_slot(&mut region, 16, &table),
            Err(ArchiveError::VtableMismatch { archived: 3, live: 3, .. })
        ));
        assert!(matches!(
            splice_slot(&mut region, 40, &table),
            Err(ArchiveError::BadHeader(_))
        ));
    }
}
