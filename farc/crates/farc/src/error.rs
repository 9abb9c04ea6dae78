//! Error Module - Archive Error Types
//!
//! Defines all error types used by the archive builder and loader.
//!
//! # Error Categories
//!
//! ## Capacity Errors
//! - `RegionOverflow` - Reserved space too small for the objects copied into it
//! - `HeapObjectTooLarge` - Single heap object exceeds the contiguous archive allocation limit
//! - `HeapSpaceExhausted` - Heap archive space ran out
//! - `TooManyHeapRanges` - Heap archive fragmented into more ranges than the format holds
//!
//! ## Consistency Errors
//! - `UnresolvedReference` - A relocation target escaped the gather phase
//! - `MissingVtable` - A polymorphic kind has no registered dispatch table
//! - `VtableMismatch` - A clone slot does not fit the live dispatch table
//! - `ChecksumMismatch` - Header or region checksum does not match
//! - `BadHeader` / `Truncated` / `PointerOutOfRange` - Archive fails load validation
//!
//! ## Eligibility Errors
//! - `DanglingHeapReference` - Abandoning a heap object would leave an archived reference dangling
//!
//! Non-fatal eligibility failures (nullified metadata, abandoned subgraphs)
//! never surface as errors; they are logged and show up as absent values in
//! the archive.

use thiserror::Error;

/// Broad classification of an [`ArchiveError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Reserved space or heap archive space too small
    Capacity,
    /// Internal or on-disk data failed a consistency check
    Consistency,
    /// An object cannot be archived safely
    Eligibility,
    /// File system failure
    Io,
    /// Invalid configuration or argument
    Configuration,
    /// Invariant violation inside the builder (a bug)
    Internal,
}

/// Main error type for all archive operations
///
/// Every error aborts the operation that produced it: a build never writes a
/// partial archive, and a load never uses an archive that failed validation.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// A region ran past the end of the reservation
    ///
    /// **When returned:** the capacity estimate made before copying was too small
    ///
    /// **Recovery strategy:** none inside a build; rerun with a larger `reserve_size`
    #[error("{region} region overflow: requested {requested} bytes, {available} bytes left")]
    RegionOverflow {
        region: &'static str,
        requested: usize,
        available: usize,
    },

    /// Allocation attempted from a region that was already packed
    #[error("{region} region is packed; no further allocation is allowed")]
    RegionPacked { region: &'static str },

    /// A heap object is larger than one contiguous archive allocation may be
    #[error("heap object {address:#x} of {size} bytes exceeds the {limit}-byte archive allocation limit")]
    HeapObjectTooLarge { address: u64, size: usize, limit: usize },

    /// The heap archive space is exhausted
    #[error("heap archive space exhausted: requested {requested} bytes, {available} bytes left")]
    HeapSpaceExhausted { requested: usize, available: usize },

    /// The collector returned more heap ranges than the file format can hold
    #[error("{kind} heap archive split into {count} ranges, at most {max} are supported")]
    TooManyHeapRanges {
        kind: &'static str,
        count: usize,
        max: usize,
    },

    /// A pointer slot refers to an object that was never gathered
    #[error("unresolved reference to {target:#x} from slot at buffer offset {slot_offset:#x}")]
    UnresolvedReference { target: u64, slot_offset: usize },

    /// The source graph does not know an address it handed out
    #[error("source object {address:#x} is unknown to the graph")]
    UnknownObject { address: u64 },

    /// A polymorphic kind is being archived without a registered clone slot
    #[error("no dispatch table registered for {kind}")]
    MissingVtable { kind: String },

    /// A clone slot was captured with a different table length than the live table
    #[error("{kind} clone slot holds {archived} entries, live table has {live}")]
    VtableMismatch {
        kind: String,
        archived: usize,
        live: usize,
    },

    /// A header or region checksum did not verify
    #[error("{what} checksum mismatch: expected {expected:#010x}, actual {actual:#010x}")]
    ChecksumMismatch {
        what: String,
        expected: u32,
        actual: u32,
    },

    /// The archive header is malformed or from an incompatible producer
    #[error("bad archive header: {0}")]
    BadHeader(String),

    /// The archive file is shorter than the header claims
    #[error("archive truncated: {region} needs {needed} bytes, file has {actual}")]
    Truncated {
        region: &'static str,
        needed: u64,
        actual: u64,
    },

    /// A pointer slot does not point into the range it must point into
    #[error("pointer {value:#x} at archive offset {offset:#x} is outside {range}")]
    PointerOutOfRange {
        value: u64,
        offset: usize,
        range: String,
    },

    /// Abandoning a heap object would leave an archived object with a dangling reference
    #[error("heap object {address:#x} cannot be archived but is referenced by archived object {referrer:#x}")]
    DanglingHeapReference { address: u64, referrer: u64 },

    /// I/O failure while reading or writing an archive file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Virtual memory reservation failed
    #[error("virtual memory error: {0}")]
    VirtualMemory(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted in the wrong build phase or on a finalized value
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Internal error - indicates a bug in the builder
    #[error("internal error: {0}")]
    Internal(String),
}

impl ArchiveError {
    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            ArchiveError::RegionOverflow { .. }
            | ArchiveError::RegionPacked { .. }
            | ArchiveError::HeapObjectTooLarge { .. }
            | ArchiveError::HeapSpaceExhausted { .. }
            | ArchiveError::TooManyHeapRanges { .. }
            | ArchiveError::VirtualMemory(_) => ErrorCategory::Capacity,
            ArchiveError::UnresolvedReference { .. }
            | ArchiveError::UnknownObject { .. }
            | ArchiveError::MissingVtable { .. }
            | ArchiveError::VtableMismatch { .. }
            | ArchiveError::ChecksumMismatch { .. }
            | ArchiveError::BadHeader(_)
            | ArchiveError::Truncated { .. }
            | ArchiveError::PointerOutOfRange { .. } => ErrorCategory::Consistency,
            ArchiveError::DanglingHeapReference { .. } => ErrorCategory::Eligibility,
            ArchiveError::Io(_) => ErrorCategory::Io,
            ArchiveError::Configuration(_) | ArchiveError::InvalidArgument(_) => {
                ErrorCategory::Configuration
            },
            ArchiveError::InvalidState { .. } | ArchiveError::Internal(_) => {
                ErrorCategory::Internal
            },
        }
    }

    /// Heap allocation failures the heap archiver may absorb by abandoning one field
    pub fn is_heap_allocation_failure(&self) -> bool {
        matches!(
            self,
            ArchiveError::HeapObjectTooLarge { .. } | ArchiveError::HeapSpaceExhausted { .. }
        )
    }

    /// Check if this error must abort the build or load
    ///
    /// Only heap allocation failures are survivable, and only inside the
    /// heap archiver, which degrades them into an abandoned field.
    pub fn is_fatal(&self) -> bool {
        !self.is_heap_allocation_failure()
    }

    /// Check if this error indicates a bug in the code
    pub fn is_bug(&self) -> bool {
        self.category() == ErrorCategory::Internal
    }
}

/// Result type alias for archive operations
pub type Result<T> = std::result::Result<T, ArchiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_follow_taxonomy() {
        let overflow = ArchiveError::RegionOverflow {
            region: "rw",
            requested: 64,
            available: 8,
        };
        assert_eq!(overflow.category(), ErrorCategory::Capacity);

        let unresolved = ArchiveError::UnresolvedReference {
            target: 0x1000,
            slot_offset: 16,
        };
        assert_eq!(unresolved.category(), ErrorCategory::Consistency);

        let dangling = ArchiveError::DanglingHeapReference {
            address: 0x10,
            referrer: 0x20,
        };
        assert_eq!(dangling.category(), ErrorCategory::Eligibility);
        assert!(!dangling.is_heap_allocation_failure());
        assert!(dangling.is_fatal());
    }

    #[test]
    fn test_heap_allocation_failures_are_absorbable() {
        let err = ArchiveError::HeapSpaceExhausted {
            requested: 128,
            available: 0,
        };
        assert!(err.is_heap_allocation_failure());
        assert!(!err.is_fatal());
        assert!(!err.is_bug());
    }

    #[test]
    fn test_display_mentions_region() {
        let err = ArchiveError::RegionPacked { region: "ro" };
        assert!(err.to_string().contains("ro region is packed"));
    }
}
