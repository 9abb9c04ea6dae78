//! Verify command implementation.
//!
//! Runs the full load path: checksum validation, mapping, relocation,
//! vtable splicing, table decoding and heap patching. Any failure is a
//! non-zero exit.

use std::path::PathBuf;

use anyhow::Context;
use farc::{ArchiveFile, LiveVtables, MapOptions, MappedArchive, MappedHeap};
use serde::Serialize;

use crate::commands::common::map_base_archive;
use crate::config::Config;

/// Arguments for the verify command.
#[derive(Debug, Clone, Default)]
pub struct VerifyArgs {
    /// Archive file.
    pub file: PathBuf,
    /// Map the archive here instead of its requested base.
    pub relocate_to: Option<u64>,
    /// Map the archived heap here instead of its requested base.
    pub heap_relocate_to: Option<u64>,
    /// Base archive of a dynamic archive.
    pub base_archive: Option<PathBuf>,
    /// Print a JSON report instead of text.
    pub json: bool,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct VerifyReport {
    pub requested_base: u64,
    pub actual_base: u64,
    pub relocated_pointers: usize,
    pub spliced_vtables: usize,
    pub classes: usize,
    pub symbols: usize,
    pub subgraph_records: usize,
    pub heap_references_patched: Option<usize>,
    pub heap_roots: Option<usize>,
}

/// Load `args.file` and collect what the loader saw.
pub fn verify(args: &VerifyArgs, config: &Config) -> anyhow::Result<VerifyReport> {
    let file = ArchiveFile::open(&args.file, &config.archive)
        .with_context(|| format!("opening {}", args.file.display()))?;

    let base_archive = match &args.base_archive {
        Some(path) => Some(map_base_archive(path, &config.archive)?),
        None => None,
    };
    if file.header().is_dynamic() && base_archive.is_none() {
        anyhow::bail!(
            "{} is a dynamic archive on top of '{}'; pass --base-archive",
            args.file.display(),
            file.base_archive_name().unwrap_or("?")
        );
    }

    let options = MapOptions {
        relocate_to: args.relocate_to,
        base_archive,
    };
    let mut mapped = MappedArchive::map(&file, options).context("mapping archive")?;
    let live = LiveVtables::standard();
    let spliced = mapped.splice_vtables(&live).context("splicing vtables")?;

    let mut report = VerifyReport {
        requested_base: mapped.requested_base(),
        actual_base: mapped.actual_base(),
        relocated_pointers: mapped.relocated_pointers(),
        spliced_vtables: spliced,
        classes: mapped.classes()?.len(),
        symbols: mapped.symbols()?.len(),
        subgraph_records: mapped.subgraph_records()?.len(),
        ..Default::default()
    };

    if let Some(heap) = MappedHeap::map(&file, args.heap_relocate_to).context("mapping heap")? {
        report.heap_references_patched = Some(heap.relocated_references());
        report.heap_roots = Some(heap.roots().len());
        mapped
            .subgraph_restorer(&heap)
            .context("decoding subgraph records")?;
    }

    tracing::debug!(?report, "archive verified");
    Ok(report)
}

/// Execute the verify command.
pub fn run_verify(args: VerifyArgs, config: Config) -> anyhow::Result<()> {
    let report = verify(&args, &config)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}: ok", args.file.display());
    println!(
        "mapped at {:#x} (requested {:#x}), {} pointers relocated",
        report.actual_base, report.requested_base, report.relocated_pointers
    );
    println!(
        "{} vtables spliced, {} classes, {} symbols, {} subgraph records",
        report.spliced_vtables, report.classes, report.symbols, report.subgraph_records
    );
    if let (Some(patched), Some(roots)) = (report.heap_references_patched, report.heap_roots) {
        println!("heap: {} references patched, {} roots", patched, roots);
    }
    Ok(())
}
