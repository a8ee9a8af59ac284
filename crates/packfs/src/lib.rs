#![forbid(unsafe_code)]
//! PackFS public API facade.
//!
//! Re-exports the core functionality from `pfs-core` through a stable
//! external interface. This is the crate downstream consumers (CLI,
//! tooling) depend on.

pub use pfs_core::*;
