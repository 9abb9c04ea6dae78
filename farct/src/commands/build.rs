//! Build command implementation.
//!
//! Materializes a JSON graph description, runs the archive builder over it
//! and writes the archive file.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use farc::{ArchiveBuilder, ArchiveConfig, GraphDescription, LiveVtables};

use crate::commands::common::map_base_archive;
use crate::config::Config;

/// Arguments for the build command.
#[derive(Debug, Clone, Default)]
pub struct BuildArgs {
    /// Enable verbose output.
    pub verbose: bool,
    /// Graph description (JSON).
    pub graph: PathBuf,
    /// Archive file to write.
    pub output: PathBuf,
    /// Layout trace to write next to the archive.
    pub map: Option<PathBuf>,
    /// Requested base address override.
    pub base: Option<u64>,
    /// Base archive to layer a dynamic archive on.
    pub base_archive: Option<PathBuf>,
    /// Skip heap archiving.
    pub no_heap: bool,
}

/// Effective archive configuration: config file, then command line.
pub fn effective_config(args: &BuildArgs, config: &Config) -> ArchiveConfig {
    let mut archive = config.archive.clone();
    if let Some(base) = args.base {
        archive.requested_base_address = base;
    }
    if args.no_heap {
        archive.heap_archiving = false;
    }
    if args.map.is_some() {
        archive.map_log = args.map.clone();
    }
    archive
}

/// Execute the build command.
pub fn run_build(args: BuildArgs, config: Config) -> anyhow::Result<()> {
    let start_time = Instant::now();
    let archive_config = effective_config(&args, &config);

    let description = GraphDescription::from_file(&args.graph)
        .with_context(|| format!("reading graph {}", args.graph.display()))?;
    let graph = description.build().context("materializing graph")?;
    tracing::debug!(
        graph = %args.graph.display(),
        metadata = description.metadata.len(),
        heap_objects = description.heap.len(),
        "graph loaded"
    );

    let base = match &args.base_archive {
        Some(path) => Some(map_base_archive(path, &archive_config)?),
        None => None,
    };

    let live = LiveVtables::standard();
    let heap_archiving = archive_config.heap_archiving;
    let mut builder = ArchiveBuilder::new(archive_config, &graph, &live)?;
    if heap_archiving {
        builder = builder.with_heap(&graph);
    }
    if let Some(base) = base {
        builder = builder.with_base_archive(base);
    }
    let built = builder.build().context("building archive")?;

    let header = built
        .write(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;

    let stats = &built.stats;
    println!(
        "wrote {} ({} archive, {} bytes core, requested at {:#x})",
        args.output.display(),
        if built.is_dynamic() { "dynamic" } else { "static" },
        built.core_size(),
        built.requested_base.raw()
    );
    println!(
        "objects: {} copied, {} nullified, {} redirected; pointers: {} relocated",
        stats.copied, stats.nullified, stats.redirected, stats.relocated_pointers
    );
    if let Some(heap) = &built.heap {
        println!(
            "heap: {} objects, {} subgraph roots, {} interned strings",
            stats.heap_objects, heap.subgraph_root_count, heap.interned_string_count
        );
    }
    if let Some(map) = &args.map {
        println!("map: {}", map.display());
    }

    tracing::info!(
        crc = header.crc(),
        elapsed_ms = start_time.elapsed().as_millis() as u64,
        "build completed"
    );
    if args.verbose {
        eprintln!("Build completed in {:.2}s", start_time.elapsed().as_secs_f64());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_overrides_config() {
        let mut config = Config::default();
        config.archive.requested_base_address = 0x9_0000_0000;
        let args = BuildArgs {
            base: Some(0xa_0000_0000),
            no_heap: true,
            map: Some(PathBuf::from("out.map")),
            ..Default::default()
        };

        let archive = effective_config(&args, &config);
        assert_eq!(archive.requested_base_address, 0xa_0000_0000);
        assert!(!archive.heap_archiving);
        assert_eq!(archive.map_log, Some(PathBuf::from("out.map")));
    }

    #[test]
    fn test_config_file_values_survive_without_flags() {
        let mut config = Config::default();
        config.archive.requested_base_address = 0x9_0000_0000;
        config.archive.map_log = Some(PathBuf::from("from-config.map"));

        let archive = effective_config(&BuildArgs::default(), &config);
        assert_eq!(archive.requested_base_address, 0x9_0000_0000);
        assert!(archive.heap_archiving);
        assert_eq!(archive.map_log, Some(PathBuf::from("from-config.map")));
    }
}
