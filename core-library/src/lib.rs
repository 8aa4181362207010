//! # Library Projection Module
//!
//! Owns the local, editable projection of every backend's library and
//! playlists, and the SQLite database shared with the transaction log.
//!
//! ## Overview
//!
//! This module manages:
//! - Identities of library items, playlists and playlist entries (`ids`)
//! - SQLite connection pool and embedded migrations (`db`)
//! - Repository patterns for entry metadata and playlists (`repositories`)
//! - The [`LocalLibrary`] facade with change notifications (`projection`)

pub mod db;
pub mod error;
pub mod ids;
pub mod models;
pub mod projection;
pub mod repositories;

pub use error::{LibraryError, Result};
pub use ids::{EntryId, PlaylistEntryId, PlaylistId};
pub use models::{LibraryEntry, MetaMap, Playlist, PlaylistEntry};
pub use projection::{LocalLibrary, ProjectionChange};
