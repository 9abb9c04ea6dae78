//! Source Object Catalog
//!
//! One [`SourceObjectRecord`] per distinct live object the walker reaches.
//! Records live in an [`IndexVec`] and are referred to by [`RecordId`], so
//! the identity index in front of them may rehash freely without
//! invalidating anything handed out.
//!
//! Each copied record also owns a bit range in the catalog's *source field
//! map*: one bit per word of the object, set where the live object holds a
//! pointer. The copy phase replays that range into the buffer bitmap at the
//! object's destination, so pointer slots are always found by their offset
//! from the object start.

use crate::address::{BufferAddr, SourceAddr};
use crate::error::{ArchiveError, Result};
use crate::graph::{MetaKind, SourceObject};
use crate::space::{PtrMap, RegionKind};
use farc_util::{define_idx, FxHashMap, IndexVec, WORD_SIZE};

define_idx!(
    /// Stable handle of a catalog record
    RecordId
);

/// What happens to a reached object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Copied into this archive
    Copy,
    /// Already present in the mapped base archive; pointers are redirected
    RedirectToExistingArchiveCopy,
    /// Excluded; pointers to it become null
    Nullify,
}

/// Archive disposition of one live object
#[derive(Debug, Clone)]
pub struct SourceObjectRecord {
    pub source: SourceAddr,
    pub disposition: Disposition,
    /// Unknown for redirected objects
    pub kind: Option<MetaKind>,
    pub size: usize,
    pub region: Option<RegionKind>,
    /// Bit range in the source field map
    pub ptrmap_start: usize,
    pub ptrmap_end: usize,
    /// Set once the object is copied
    pub dest: Option<BufferAddr>,
}

impl SourceObjectRecord {
    pub fn is_copied(&self) -> bool {
        self.disposition == Disposition::Copy
    }
}

/// Deduplicating table of reached objects
#[derive(Debug, Default)]
pub struct Catalog {
    records: IndexVec<RecordId, SourceObjectRecord>,
    by_source: FxHashMap<SourceAddr, RecordId>,
    field_map: PtrMap,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `source` with `disposition`, or return the existing record
    ///
    /// Returns `(id, created)`; `created` is false when `source` was seen
    /// before, in which case `disposition` and `object` are ignored.
    pub fn intern(
        &mut self,
        source: SourceAddr,
        disposition: Disposition,
        object: Option<&SourceObject>,
    ) -> Result<(RecordId, bool)> {
        if let Some(&id) = self.by_source.get(&source) {
            return Ok((id, false));
        }

        let (kind, size) = match object {
            Some(obj) => (Some(obj.kind), obj.size()),
            None => (None, 0),
        };
        let (ptrmap_start, ptrmap_end) = match (disposition, object) {
            (Disposition::Copy, Some(obj)) => {
                let start = self.field_map.append(obj.size().div_ceil(WORD_SIZE))?;
                for &offset in &obj.pointer_offsets {
                    self.field_map.mark(start + offset / WORD_SIZE)?;
                }
                (start, self.field_map.size_in_bits())
            },
            (Disposition::Copy, None) => {
                return Err(ArchiveError::UnknownObject {
                    address: source.raw(),
                })
            },
            _ => (0, 0),
        };

        let id = self.records.push(SourceObjectRecord {
            source,
            disposition,
            kind,
            size,
            region: match disposition {
                Disposition::Copy => kind.map(MetaKind::region),
                _ => None,
            },
            ptrmap_start,
            ptrmap_end,
            dest: None,
        });
        self.by_source.insert(source, id);
        Ok((id, true))
    }

    pub fn lookup(&self, source: SourceAddr) -> Option<RecordId> {
        self.by_source.get(&source).copied()
    }

    pub fn get(&self, source: SourceAddr) -> Option<&SourceObjectRecord> {
        self.lookup(source).map(|id| &self.records[id])
    }

    pub fn record(&self, id: RecordId) -> &SourceObjectRecord {
        &self.records[id]
    }

    /// Record the destination of a copied object; set exactly once
    pub fn set_dest(&mut self, id: RecordId, dest: BufferAddr) -> Result<()> {
        let record = &mut self.records[id];
        if record.dest.is_some() || !record.is_copied() {
            return Err(ArchiveError::Internal(format!(
                "record for {:?} copied twice or not copyable",
                record.source
            )));
        }
        record.dest = Some(dest);
        Ok(())
    }

    /// Byte offsets of pointer fields of a record, from the field map
    pub fn pointer_offsets(&self, id: RecordId) -> impl Iterator<Item = usize> + '_ {
        let record = &self.records[id];
        let start = record.ptrmap_start;
        self.field_map
            .iter_set_in(start, record.ptrmap_end)
            .map(move |bit| (bit - start) * WORD_SIZE)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RecordId, &SourceObjectRecord)> + '_ {
        self.records.iter_enumerated()
    }

    pub fn count(&self, disposition: Disposition) -> usize {
        self.records
            .iter()
            .filter(|r| r.disposition == disposition)
            .count()
    }
}
