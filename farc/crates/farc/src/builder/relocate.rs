//! Relocate phase
//!
//! Two passes over the copied image:
//!
//! - (a) per copied record, every pointer field from its live address to the
//!   target's disposition: buffer copy, base-archive address, or null
//! - (b) per set bitmap bit, buffer addresses shifted to the requested base
//!   and base-archive addresses to the base archive's requested base; null
//!   slots lose their bit
//!
//! After (b) the bitmap is compacted. Every value still marked then lies in
//! the requested range of this archive or of its base.

use super::ArchiveBuilder;
use crate::address::{BufferAddr, SourceAddr};
use crate::catalog::{Catalog, Disposition};
use crate::error::{ArchiveError, Result};
use crate::logging::BuildEvent;
use crate::space::DumpSpace;

impl ArchiveBuilder<'_> {
    pub(super) fn relocate_phase(&mut self) -> Result<()> {
        let space = self.space.as_mut().ok_or_else(|| {
            ArchiveError::Internal("relocate phase started without a reservation".to_string())
        })?;

        resolve_fields(space, &self.catalog)?;

        let buffer_base = space.base().raw();
        let delta = self.requested_base.wrapping_sub(buffer_base);
        let base_archive = self.base_archive.as_ref();
        let slots: Vec<usize> = space.ptrmap().iter_set().collect();

        let (mut relocated, mut nulls, mut base_pointers) = (0, 0, 0);
        for bit in slots {
            let slot = space.slot_address(bit);
            let value = space.read_word(slot)?;
            if value == 0 {
                space.ptrmap_mut().clear(bit)?;
                nulls += 1;
            } else if let Some(base) = base_archive.filter(|b| b.contains(value)) {
                space.write_word(slot, base.to_requested(value))?;
                base_pointers += 1;
            } else if space.contains(BufferAddr(value)) {
                space.write_word(slot, value.wrapping_add(delta))?;
                relocated += 1;
            } else {
                return Err(ArchiveError::PointerOutOfRange {
                    value,
                    offset: slot.offset_from(space.base()),
                    range: format!(
                        "build buffer [{:#x}, {:#x})",
                        buffer_base,
                        space.top().raw()
                    ),
                });
            }
        }
        let bits = space.ptrmap_mut().compact()?;

        log::debug!(
            target: "farc::builder",
            "relocation bitmap compacted to {bits} bits"
        );
        self.stats.relocated_pointers = relocated;
        self.stats.nulls_cleared = nulls;
        self.stats.base_archive_pointers = base_pointers;
        self.logger.log(BuildEvent::RelocationSummary {
            relocated,
            nulls_cleared: nulls,
            base_archive_pointers: base_pointers,
        });
        Ok(())
    }
}

/// Pass (a): live addresses to buffer addresses
fn resolve_fields(space: &mut DumpSpace, catalog: &Catalog) -> Result<()> {
    for (id, record) in catalog.iter().filter(|(_, r)| r.is_copied()) {
        let dest = record.dest.ok_or_else(|| {
            ArchiveError::Internal(format!("{} reached relocation uncopied", record.source))
        })?;
        for offset in catalog.pointer_offsets(id) {
            let slot = dest.add(offset);
            let value = space.read_word(slot)?;
            if value == 0 {
                continue;
            }
            let target = catalog.get(SourceAddr(value)).ok_or_else(|| {
                ArchiveError::UnresolvedReference {
                    target: value,
                    slot_offset: slot.offset_from(space.base()),
                }
            })?;
            match target.disposition {
                Disposition::Copy => {
                    let to = target.dest.ok_or(ArchiveError::UnresolvedReference {
                        target: value,
                        slot_offset: slot.offset_from(space.base()),
                    })?;
                    space.write_word(slot, to.raw())?;
                },
                // Still the base archive's mapped address; pass (b) maps it
                Disposition::RedirectToExistingArchiveCopy => {},
                Disposition::Nullify => space.write_word(slot, 0)?,
            }
        }
    }
    Ok(())
}
