//! Helpers shared by the farct subcommands.

use std::path::Path;

use anyhow::Context;
use farc::{ArchiveConfig, ArchiveFile, BaseArchive, MapOptions, MappedArchive};

use crate::error::{FarctError, Result};

/// Parse an address given as `0x`-prefixed hex or decimal.
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim().replace('_', "");
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|_| FarctError::Validation(format!("'{}' is not an address", s)))
}

/// clap adapter for [`parse_address`].
pub fn address_arg(s: &str) -> std::result::Result<u64, String> {
    parse_address(s).map_err(|e| e.to_string())
}

/// Name a base archive is recorded under: its file name.
pub fn archive_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Open and map a base archive at its requested base.
pub fn map_base_archive(path: &Path, config: &ArchiveConfig) -> anyhow::Result<BaseArchive> {
    let file = ArchiveFile::open(path, config)
        .with_context(|| format!("opening base archive {}", path.display()))?;
    let mapped = MappedArchive::map(&file, MapOptions::default())
        .with_context(|| format!("mapping base archive {}", path.display()))?;
    tracing::debug!(
        base = %path.display(),
        mapped_base = mapped.actual_base(),
        size = mapped.size(),
        "base archive mapped"
    );
    Ok(mapped.as_base_archive(&archive_name(path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_address() {
        assert_eq!(parse_address("0x8_0000_0000").unwrap(), 0x8_0000_0000);
        assert_eq!(parse_address("0X1000").unwrap(), 0x1000);
    }

    #[test]
    fn test_parse_decimal_address() {
        assert_eq!(parse_address("4096").unwrap(), 4096);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_address("0xzz"), Err(FarctError::Validation(_))));
        assert!(parse_address("").is_err());
    }

    #[test]
    fn test_archive_name_is_file_name() {
        assert_eq!(archive_name(Path::new("/tmp/out/base.farc")), "base.farc");
    }
}
