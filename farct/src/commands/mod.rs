//! Command modules for the farct CLI.
//!
//! Each subcommand lives in its own file as an `Args` struct plus a `run_*`
//! entry point.

pub mod common;

pub mod build;
pub mod inspect;
pub mod verify;

pub use build::{run_build, BuildArgs};
pub use inspect::{run_inspect, InspectArgs};
pub use verify::{run_verify, VerifyArgs};
