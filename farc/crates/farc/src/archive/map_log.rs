//! Map log: human-readable layout trace of a built archive
//!
//! Diagnostic only. Every line is also emitted at `trace` level under the
//! `farc::map` target, so `RUST_LOG=farc::map=trace` shows the layout without
//! writing a file.

use crate::builder::BuiltArchive;
use crate::error::Result;
use crate::space::RegionKind;
use farc_util::WORD_SIZE;
use std::fmt::Write as _;
use std::path::Path;

/// Renders the layout of one built archive
pub struct MapLogger<'a> {
    archive: &'a BuiltArchive,
    hex_dump: bool,
}

impl<'a> MapLogger<'a> {
    pub fn new(archive: &'a BuiltArchive) -> Self {
        Self {
            archive,
            hex_dump: false,
        }
    }

    /// Append the words of every object
    pub fn with_hex_dump(mut self, enabled: bool) -> Self {
        self.hex_dump = enabled;
        self
    }

    pub fn render(&self) -> String {
        let archive = self.archive;
        let base = archive.requested_base.raw();
        let mut out = String::new();

        let _ = writeln!(
            out,
            "# farc map log ({}, generated {})",
            archive.config.producer_ident,
            chrono::Local::now().to_rfc3339()
        );
        if let Some(base_archive) = &archive.base_archive {
            let _ = writeln!(
                out,
                "# layered on {} at {:#x}",
                base_archive.name, base_archive.requested_base
            );
        }

        for (kind, start, len) in [
            (RegionKind::ReadWrite, 0, archive.rw.len()),
            (RegionKind::ReadOnly, archive.rw.len(), archive.ro.len()),
        ] {
            let _ = writeln!(
                out,
                "[{kind} region] {:#018x} - {:#018x} {:>10} bytes",
                base + start as u64,
                base + (start + len) as u64,
                len
            );
            for entry in archive.layout.iter().filter(|e| e.region == kind) {
                let _ = write!(
                    out,
                    "{:#018x}: @@ {:<16} {:>8}",
                    entry.offset.at(base),
                    entry.label,
                    entry.size
                );
                if let Some(name) = &entry.name {
                    let _ = write!(out, " {name}");
                }
                let _ = writeln!(out);
                if self.hex_dump {
                    self.dump_words(&mut out, entry.offset.as_usize(), entry.size);
                }
            }
        }

        let _ = writeln!(
            out,
            "[bitmap] {} bits, {} pointers",
            archive.ptrmap.size_in_bits(),
            archive.ptrmap.count_set()
        );

        if let Some(heap) = &archive.heap {
            for range in heap.closed.iter().chain(&heap.open) {
                let _ = writeln!(
                    out,
                    "[heap {}] {:#018x} - {:#018x} {:>10} bytes, {} references",
                    range.kind,
                    range.start.raw(),
                    range.start.raw() + range.bytes.len() as u64,
                    range.bytes.len(),
                    range.oopmap.count_set()
                );
            }
            let _ = writeln!(
                out,
                "[heap roots] {:#018x}: {} subgraph roots, {} interned strings",
                heap.roots.raw(),
                heap.subgraph_root_count,
                heap.interned_string_count
            );
        }
        out
    }

    fn dump_words(&self, out: &mut String, offset: usize, size: usize) {
        let base = self.archive.requested_base.raw();
        let Some(bytes) = self.archive.bytes_at(crate::address::ArchiveOffset::new(offset), size)
        else {
            return;
        };
        for (i, chunk) in bytes.chunks(WORD_SIZE).enumerate() {
            let mut word = [0u8; WORD_SIZE];
            word[..chunk.len()].copy_from_slice(chunk);
            let marker = if self.archive.ptrmap.is_set(offset / WORD_SIZE + i) {
                " *"
            } else {
                ""
            };
            let _ = writeln!(
                out,
                "    {:#018x}: {:#018x}{marker}",
                base + (offset + i * WORD_SIZE) as u64,
                u64::from_le_bytes(word)
            );
        }
    }

    /// Emit the map under the `farc::map` target
    pub fn emit(&self) {
        for line in self.render().lines() {
            log::trace!(target: "farc::map", "{line}");
        }
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let text = self.render();
        std::fs::write(path, &text)?;
        log::info!(
            target: "farc::map",
            "wrote map log {} ({} lines)",
            path.display(),
            text.lines().count()
        );
        Ok(())
    }
}
