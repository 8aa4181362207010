//! # Repository Pattern Implementation
//!
//! Repository traits and SQLite implementations for the local projection.
//!
//! ## Architecture
//!
//! - Traits define the interface for each repository
//! - SQLite implementations use sqlx for async database access
//! - All operations return `Result<T>` for error handling
//! - Metadata rows are set-valued, so re-inserting a value is a no-op
//!
//! ## Available Repositories
//!
//! - `MetaRepository` - Multi-valued metadata of library items
//! - `PlaylistRepository` - Playlists, their metadata and ordered entries

pub mod meta;
pub mod playlist;

pub use meta::{MetaRepository, SqliteMetaRepository};
pub use playlist::{PlaylistRepository, SqlitePlaylistRepository};
