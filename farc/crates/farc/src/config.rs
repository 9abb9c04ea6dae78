//! Configuration Module - Archive Build and Load Parameters
//!
//! Every knob of a build session lives in [`ArchiveConfig`]. The defaults
//! produce a static archive requested at `0x8_0000_0000` with heap archiving
//! enabled.

use crate::error::{ArchiveError, Result};
use crate::graph::MetaKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default requested base address of a static archive
pub const DEFAULT_REQUESTED_BASE: u64 = 0x8_0000_0000;

/// Default requested base address of the archived heap
pub const DEFAULT_HEAP_REQUESTED_BASE: u64 = 0x7_f000_0000;

/// Producer identification stored in every header
pub const DEFAULT_PRODUCER_IDENT: &str = concat!("farc-", env!("CARGO_PKG_VERSION"));

/// Main configuration of an archive build
///
/// # Examples
///
/// ```rust
/// use farc::ArchiveConfig;
///
/// let config = ArchiveConfig {
///     heap_archiving: false,
///     requested_base_address: 0x9_0000_0000,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Address the archive is designed to be mapped at
    ///
    /// Must be aligned to `core_region_alignment`.
    /// Default: 0x8_0000_0000
    pub requested_base_address: u64,

    /// Alignment of every core region, in the file and in memory
    ///
    /// Default: the OS page size
    pub core_region_alignment: usize,

    /// Alignment of every archived metadata object
    ///
    /// Default: 8
    pub object_alignment: usize,

    /// Fixed build reservation size, replacing the capacity estimate
    ///
    /// Default: None (estimate from the gathered objects)
    pub reserve_size: Option<usize>,

    /// Extra bytes added to the capacity estimate
    ///
    /// Default: 64KB
    pub estimate_slack: usize,

    /// Metadata kinds that are nullified instead of copied
    ///
    /// Default: profiling data
    pub excluded_kinds: Vec<MetaKind>,

    /// Archive heap subgraphs and interned strings
    ///
    /// Default: true
    pub heap_archiving: bool,

    /// Capacity of the heap archive space in bytes
    ///
    /// Default: 32MB
    pub heap_capacity: usize,

    /// Largest single heap object that may be archived
    ///
    /// Default: 1MB
    pub max_heap_object_size: usize,

    /// Largest contiguous range the heap archive space hands out before it
    /// starts a new one
    ///
    /// Default: None (one range per kind)
    pub heap_range_size: Option<usize>,

    /// Address the archived heap is designed to be mapped at
    ///
    /// Default: 0x7_f000_0000
    pub heap_requested_base: u64,

    /// Classes already initialized early in the loading process's bootstrap
    ///
    /// Objects of these classes never add their class to a subgraph's
    /// class list.
    pub early_classes: Vec<String>,

    /// Verify per-region checksums when opening an archive
    ///
    /// Default: true
    pub verify_regions: bool,

    /// Write a human-readable layout trace next to the archive
    ///
    /// Default: None
    pub map_log: Option<PathBuf>,

    /// Producer identification stored in the header and checked at load
    ///
    /// At most 31 bytes.
    pub producer_ident: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            requested_base_address: DEFAULT_REQUESTED_BASE,
            core_region_alignment: page_size::get(),
            object_alignment: 8,
            reserve_size: None,
            estimate_slack: 64 * 1024,
            excluded_kinds: vec![MetaKind::MethodData],
            heap_archiving: true,
            heap_capacity: 32 * 1024 * 1024,
            max_heap_object_size: 1024 * 1024,
            heap_range_size: None,
            heap_requested_base: DEFAULT_HEAP_REQUESTED_BASE,
            early_classes: default_early_classes(),
            verify_regions: true,
            map_log: None,
            producer_ident: DEFAULT_PRODUCER_IDENT.to_string(),
        }
    }
}

fn default_early_classes() -> Vec<String> {
    [
        "java/lang/Object",
        "java/lang/String",
        "java/lang/Class",
        "java/lang/Integer",
        "java/lang/Long",
        "[B",
        "[Ljava/lang/Object;",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl ArchiveConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.core_region_alignment.is_power_of_two() || self.core_region_alignment < 4096 {
            return Err(ArchiveError::Configuration(format!(
                "core_region_alignment ({}) must be a power of two >= 4096",
                self.core_region_alignment
            )));
        }

        if !self.object_alignment.is_power_of_two() || self.object_alignment < 8 {
            return Err(ArchiveError::Configuration(format!(
                "object_alignment ({}) must be a power of two >= 8",
                self.object_alignment
            )));
        }

        if self.object_alignment > self.core_region_alignment {
            return Err(ArchiveError::Configuration(
                "object_alignment cannot exceed core_region_alignment".to_string(),
            ));
        }

        if self.requested_base_address == 0
            || self.requested_base_address % self.core_region_alignment as u64 != 0
        {
            return Err(ArchiveError::Configuration(format!(
                "requested_base_address ({:#x}) must be non-zero and aligned to {:#x}",
                self.requested_base_address, self.core_region_alignment
            )));
        }

        if self.reserve_size == Some(0) {
            return Err(ArchiveError::Configuration(
                "reserve_size must be > 0".to_string(),
            ));
        }

        if self.heap_archiving {
            if self.heap_requested_base == 0 || self.heap_requested_base % 8 != 0 {
                return Err(ArchiveError::Configuration(format!(
                    "heap_requested_base ({:#x}) must be non-zero and 8-byte aligned",
                    self.heap_requested_base
                )));
            }
            if self.max_heap_object_size == 0 || self.max_heap_object_size > self.heap_capacity {
                return Err(ArchiveError::Configuration(
                    "max_heap_object_size must be > 0 and <= heap_capacity".to_string(),
                ));
            }
            if self.heap_range_size == Some(0) {
                return Err(ArchiveError::Configuration(
                    "heap_range_size must be > 0".to_string(),
                ));
            }
        }

        if self.producer_ident.is_empty() || self.producer_ident.len() >= 32 {
            return Err(ArchiveError::Configuration(format!(
                "producer_ident '{}' must be 1-31 bytes",
                self.producer_ident
            )));
        }

        Ok(())
    }

    /// Check if `class_name` is on the early-class allowlist
    pub fn is_early_class(&self, class_name: &str) -> bool {
        self.early_classes.iter().any(|c| c == class_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ArchiveConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.is_early_class("java/lang/String"));
        assert!(!config.is_early_class("com/example/Cache"));
    }

    #[test]
    fn test_misaligned_base_rejected() {
        let config = ArchiveConfig {
            requested_base_address: 0x8_0000_0010,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ArchiveError::Configuration(_))
        ));
    }

    #[test]
    fn test_long_producer_ident_rejected() {
        let config = ArchiveConfig {
            producer_ident: "x".repeat(32),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heap_limits_ignored_without_heap() {
        let config = ArchiveConfig {
            heap_archiving: false,
            max_heap_object_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ArchiveConfig =
            serde_json::from_str(r#"{ "heap_archiving": false, "excluded_kinds": [] }"#).unwrap();
        assert!(!config.heap_archiving);
        assert!(config.excluded_kinds.is_empty());
        assert_eq!(config.requested_base_address, DEFAULT_REQUESTED_BASE);
    }
}
