//! Inspect command implementation.
//!
//! Prints the header and region table of an archive file, and on request
//! the archived class names.

use std::path::PathBuf;

use anyhow::Context;
use farc::{ArchiveFile, ArchiveHeader, MapOptions, MappedArchive, RegionIndex};
use serde::Serialize;

use crate::config::Config;

/// Arguments for the inspect command.
#[derive(Debug, Clone, Default)]
pub struct InspectArgs {
    /// Archive file.
    pub file: PathBuf,
    /// Also map the archive and list its classes.
    pub classes: bool,
    /// Print a JSON report instead of text.
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct RegionReport {
    name: &'static str,
    file_offset: u64,
    mapping_offset: u64,
    used: u64,
    read_only: bool,
    crc: u32,
}

#[derive(Debug, Serialize)]
struct InspectReport {
    kind: &'static str,
    crc: u32,
    version: u32,
    producer: String,
    requested_base_address: u64,
    base_archive: Option<String>,
    regions: Vec<RegionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    classes: Option<Vec<String>>,
}

impl InspectReport {
    fn new(file: &ArchiveFile) -> Self {
        let header: &ArchiveHeader = file.header();
        let regions = RegionIndex::ALL
            .iter()
            .map(|&index| (index, header.region(index)))
            .filter(|(_, r)| !r.is_empty())
            .map(|(index, r)| RegionReport {
                name: index.name(),
                file_offset: r.file_offset,
                mapping_offset: r.mapping_offset,
                used: r.used,
                read_only: r.read_only,
                crc: r.crc,
            })
            .collect();
        Self {
            kind: if header.is_dynamic() { "dynamic" } else { "static" },
            crc: header.crc(),
            version: header.version(),
            producer: header.fields().producer_ident.clone(),
            requested_base_address: header.fields().requested_base_address,
            base_archive: file.base_archive_name().map(str::to_string),
            regions,
            classes: None,
        }
    }
}

/// Class names of a static archive, mapped at its requested base.
fn class_names(file: &ArchiveFile) -> anyhow::Result<Vec<String>> {
    let mapped = MappedArchive::map(file, MapOptions::default())?;
    Ok(mapped.classes()?.into_iter().map(|c| c.name).collect())
}

/// Execute the inspect command.
pub fn run_inspect(args: InspectArgs, config: Config) -> anyhow::Result<()> {
    let file = ArchiveFile::open(&args.file, &config.archive)
        .with_context(|| format!("opening {}", args.file.display()))?;
    tracing::debug!(file = %args.file.display(), size = file.file_size(), "archive opened");

    let classes = if args.classes {
        if file.header().is_dynamic() {
            anyhow::bail!("listing classes of a dynamic archive needs its base; use verify");
        }
        Some(class_names(&file)?)
    } else {
        None
    };

    if args.json {
        let mut report = InspectReport::new(&file);
        report.classes = classes;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", args.file.display());
    print!("{}", file.header());
    if let Some(base) = file.base_archive_name() {
        println!("base archive:            {}", base);
    }
    if let Some(classes) = classes {
        println!("classes ({}):", classes.len());
        for name in classes {
            println!("  {}", name);
        }
    }
    Ok(())
}
