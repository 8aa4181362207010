//! Workspace placeholder crate.
//!
//! Host applications depend on `tunelog-workspace` and get the composed
//! service (`core-service`) with the desktop bridges enabled by default,
//! without wiring the transaction log, projection and sync crates themselves.

#[cfg(feature = "desktop-shims")]
pub use core_service::*;
