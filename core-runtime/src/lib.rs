//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the library sync core:
//! - Logging and tracing infrastructure
//! - Configuration management (database, schedule, retry policy, backends)
//! - Event bus for sync and transaction status
//!
//! ## Overview
//!
//! Every other crate in the workspace logs through `tracing` with the
//! conventions set up here and reports status through [`events::EventBus`].

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
