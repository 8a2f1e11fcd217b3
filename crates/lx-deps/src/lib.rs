//! File stats and the dependency cache.
//!
//! - [`FileStat`] / [`FileStatCache`]: lazily computed path metadata, cached
//!   per compile task (two instances per task — inputs and outputs — so
//!   neither needs cross-task locking)
//! - [`DepsCache`]: maps a compile fingerprint to its previously resolved
//!   input list, validated on every lookup so a stale entry can never
//!   produce a wrong dependency set

mod deps;
mod stat;

pub use deps::{deps_identifier, DepsCache};
pub use stat::{FileStat, FileStatCache};
