//! farc-util - Foundation Types for the Archive Workspace
//!
//! ============================================================================
//! MODULE OVERVIEW
//! ============================================================================
//!
//! Small, dependency-light building blocks shared by the archive builder, the
//! loader and the command-line front end:
//!
//! - [`index_vec`]: vectors indexed by typed ids. The source object catalog
//!   hands out `RecordId`s that stay valid no matter how the lookup table
//!   behind them is rehashed.
//! - [`align`]: power-of-two alignment arithmetic used by the region
//!   allocator, the file writer and the heap archiver.
//! - `FxHashMap` / `FxHashSet`: the fast non-cryptographic hash maps used for
//!   identity-keyed tables (keys are addresses, never attacker controlled).
//!
//! DESIGN PRINCIPLES:
//! ------------------
//! 1. TYPE SAFETY
//!    Typed indices prevent mixing ids from different tables.
//!
//! 2. ZERO-COST
//!    Everything here compiles down to the plain `Vec` / integer code it wraps.
//
// WORD SIZE:
// ----------
// The archive format stores pointers as 64-bit little-endian words and the
// pointer bitmap has one bit per such word. Building on a 32-bit host would
// silently produce a different layout, so it is rejected at compile time.

pub mod align;
pub mod index_vec;

pub use index_vec::{Idx, IndexVec};
pub use rustc_hash::FxHashMap;
pub use rustc_hash::FxHashSet;

/// Size in bytes of one pointer-sized archive slot.
pub const WORD_SIZE: usize = 8;

static_assertions::assert_eq_size!(usize, u64);
static_assertions::const_assert!(WORD_SIZE.is_power_of_two());
