//! Farct CLI - build, inspect and verify farc archives.
//!
//! Parses the command line with clap, installs a tracing subscriber, loads
//! `farct.toml` and dispatches to one handler per subcommand.

mod commands;
mod config;
mod error;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::{
    common::address_arg,
    run_build, run_inspect, run_verify, BuildArgs, InspectArgs, VerifyArgs,
};
use config::Config;
use error::{FarctError, Result};

/// Farct - build and load relocatable object-graph archives
#[derive(Parser, Debug)]
#[command(name = "farct")]
#[command(author = "Fax Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build, inspect and verify farc archives", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true, env = "FARCT_VERBOSE")]
    verbose: bool,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "FARCT_CONFIG")]
    config: Option<PathBuf>,

    /// Disable color output
    #[arg(long, global = true, env = "FARCT_NO_COLOR")]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands for the farct CLI.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Build an archive from a JSON graph description
    Build(BuildCommand),

    /// Print the header and region table of an archive
    Inspect(InspectCommand),

    /// Validate, map and relocate an archive
    ///
    /// Runs the whole load path and reports what was patched.
    Verify(VerifyCommand),
}

/// Arguments for the build subcommand.
#[derive(Parser, Debug)]
struct BuildCommand {
    /// Graph description (JSON)
    #[arg(short, long)]
    graph: PathBuf,

    /// Archive file to write
    #[arg(short, long)]
    output: PathBuf,

    /// Write the layout trace to this file
    #[arg(short, long)]
    map: Option<PathBuf>,

    /// Requested base address (hex or decimal)
    #[arg(long, value_parser = address_arg)]
    base: Option<u64>,

    /// Build a dynamic archive on top of this base archive
    #[arg(long)]
    base_archive: Option<PathBuf>,

    /// Skip heap archiving
    #[arg(long)]
    no_heap: bool,
}

/// Arguments for the inspect subcommand.
#[derive(Parser, Debug)]
struct InspectCommand {
    /// Archive file
    file: PathBuf,

    /// Also list archived classes
    #[arg(long)]
    classes: bool,

    /// Print a JSON report
    #[arg(long)]
    json: bool,
}

/// Arguments for the verify subcommand.
#[derive(Parser, Debug)]
struct VerifyCommand {
    /// Archive file
    file: PathBuf,

    /// Map at this address instead of the requested base
    #[arg(long, value_parser = address_arg)]
    relocate_to: Option<u64>,

    /// Map the archived heap at this address
    #[arg(long, value_parser = address_arg)]
    heap_relocate_to: Option<u64>,

    /// Base archive of a dynamic archive
    #[arg(long)]
    base_archive: Option<PathBuf>,

    /// Print a JSON report
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.verbose || config.verbose, cli.no_color)?;
    execute_command(cli.command, cli.verbose, config)
}

/// Install the tracing subscriber.
///
/// `FARCT_LOG` overrides the level; library `log` records are forwarded.
fn init_logging(verbose: bool, no_color: bool) -> Result<()> {
    let filter = EnvFilter::try_from_env("FARCT_LOG").unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    let subscriber = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(!no_color)
        .with_target(verbose)
        .with_thread_ids(false)
        .with_thread_names(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(subscriber)
        .try_init()
        .map_err(|e| FarctError::Config(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

fn load_config(config_path: Option<&std::path::Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
}

fn execute_command(command: Commands, verbose: bool, config: Config) -> anyhow::Result<()> {
    match command {
        Commands::Build(args) => run_build(
            BuildArgs {
                verbose,
                graph: args.graph,
                output: args.output,
                map: args.map,
                base: args.base,
                base_archive: args.base_archive,
                no_heap: args.no_heap,
            },
            config,
        ),
        Commands::Inspect(args) => run_inspect(
            InspectArgs {
                file: args.file,
                classes: args.classes,
                json: args.json,
            },
            config,
        ),
        Commands::Verify(args) => run_verify(
            VerifyArgs {
                file: args.file,
                relocate_to: args.relocate_to,
                heap_relocate_to: args.heap_relocate_to,
                base_archive: args.base_archive,
                json: args.json,
            },
            config,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_build() {
        let cli = Cli::parse_from(["farct", "build", "--graph", "g.json", "--output", "a.farc"]);
        if let Commands::Build(args) = cli.command {
            assert_eq!(args.graph, PathBuf::from("g.json"));
            assert_eq!(args.output, PathBuf::from("a.farc"));
            assert!(!args.no_heap);
        } else {
            panic!("Expected Build command");
        }
    }

    #[test]
    fn test_cli_parse_build_base_address() {
        let cli = Cli::parse_from([
            "farct", "build", "-g", "g.json", "-o", "a.farc", "--base", "0x9_0000_0000",
        ]);
        if let Commands::Build(args) = cli.command {
            assert_eq!(args.base, Some(0x9_0000_0000));
        } else {
            panic!("Expected Build command");
        }
    }

    #[test]
    fn test_cli_rejects_bad_address() {
        let result = Cli::try_parse_from(["farct", "verify", "a.farc", "--relocate-to", "nope"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parse_verify() {
        let cli = Cli::parse_from([
            "farct", "verify", "a.farc", "--relocate-to", "4096", "--base-archive", "b.farc",
        ]);
        if let Commands::Verify(args) = cli.command {
            assert_eq!(args.relocate_to, Some(4096));
            assert_eq!(args.base_archive, Some(PathBuf::from("b.farc")));
        } else {
            panic!("Expected Verify command");
        }
    }

    #[test]
    fn test_cli_parse_inspect() {
        let cli = Cli::parse_from(["farct", "inspect", "a.farc", "--json"]);
        assert!(matches!(cli.command, Commands::Inspect(InspectCommand { json: true, .. })));
    }

    #[test]
    fn test_cli_parse_global_flags() {
        let cli = Cli::parse_from(["farct", "--verbose", "--config", "/etc/farct.toml", "inspect", "a"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/farct.toml")));
    }
}
