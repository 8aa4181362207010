//! Domain models for the local projection
//!
//! Snapshots of the library and playlists as stored locally. Backends return
//! the same shapes from their fetch calls, which lets the reconciliation step
//! compare remote and local state directly.

use crate::ids::{EntryId, PlaylistEntryId, PlaylistId};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::{BTreeMap, BTreeSet};

/// Multi-valued metadata: each key maps to a set of values.
pub type MetaMap = BTreeMap<String, BTreeSet<String>>;

/// Build a [`MetaMap`] from `(key, value)` pairs.
pub fn meta_from_pairs<I, K, V>(pairs: I) -> MetaMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut meta = MetaMap::new();
    for (key, value) in pairs {
        meta.entry(key.into()).or_default().insert(value.into());
    }
    meta
}

/// Whether `meta` holds `value` under `key`.
pub fn meta_contains(meta: &MetaMap, key: &str, value: &str) -> bool {
    meta.get(key).map_or(false, |values| values.contains(value))
}

// =============================================================================
// Library
// =============================================================================

/// One library item with all of its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub id: EntryId,
    pub meta: MetaMap,
}

impl LibraryEntry {
    pub fn new(id: EntryId) -> Self {
        Self {
            id,
            meta: MetaMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.entry(key.into()).or_default().insert(value.into());
        self
    }
}

// =============================================================================
// Playlists
// =============================================================================

/// One occurrence of a song inside a playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub id: PlaylistEntryId,
    pub entry: EntryId,
    /// Metadata of the song captured when it was added, used to display
    /// songs whose source is not loaded.
    #[serde(default)]
    pub meta_snapshot: MetaMap,
}

impl PlaylistEntry {
    pub fn new(id: PlaylistEntryId, entry: EntryId) -> Self {
        Self {
            id,
            entry,
            meta_snapshot: MetaMap::new(),
        }
    }
}

/// A playlist with its metadata and ordered entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: PlaylistId,
    pub name: String,
    pub meta: MetaMap,
    pub entries: Vec<PlaylistEntry>,
}

impl Playlist {
    pub fn new(id: PlaylistId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            meta: MetaMap::new(),
            entries: Vec::new(),
        }
    }

    pub fn with_entry(mut self, entry: PlaylistEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Index of the entry with the given id.
    pub fn position_of(&self, id: &PlaylistEntryId) -> Option<usize> {
        self.entries.iter().position(|e| &e.id == id)
    }

    /// Validate playlist fields
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Playlist name cannot be empty".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Row types
// =============================================================================

#[derive(Debug, FromRow)]
pub(crate) struct MetaRow {
    pub src: String,
    pub entry_id: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, FromRow)]
pub(crate) struct PlaylistRow {
    pub src: String,
    pub playlist_id: String,
    pub name: String,
}

#[derive(Debug, FromRow)]
pub(crate) struct PlaylistEntryRow {
    pub playlist_entry_id: String,
    pub entry_src: String,
    pub entry_id: String,
    pub meta_snapshot: String,
}

impl PlaylistEntryRow {
    pub(crate) fn into_entry(self) -> crate::Result<PlaylistEntry> {
        Ok(PlaylistEntry {
            id: PlaylistEntryId::from(self.playlist_entry_id),
            entry: EntryId::new(self.entry_src, self.entry_id),
            meta_snapshot: serde_json::from_str(&self.meta_snapshot)?,
        })
    }
}

/// Fold rows ordered by `(src, entry_id)` into library entries.
pub(crate) fn group_meta_rows(rows: Vec<MetaRow>) -> Vec<LibraryEntry> {
    let mut entries: Vec<LibraryEntry> = Vec::new();
    for row in rows {
        let id = EntryId::new(row.src, row.entry_id);
        match entries.last_mut() {
            Some(last) if last.id == id => {
                last.meta.entry(row.key).or_default().insert(row.value);
            }
            _ => entries.push(LibraryEntry::new(id).with_meta(row.key, row.value)),
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_from_pairs_is_multi_valued() {
        let meta = meta_from_pairs([("artist", "A"), ("artist", "B"), ("title", "T")]);
        assert_eq!(meta["artist"].len(), 2);
        assert!(meta_contains(&meta, "artist", "B"));
        assert!(!meta_contains(&meta, "album", "B"));
    }

    #[test]
    fn test_group_meta_rows() {
        let row = |id: &str, key: &str, value: &str| MetaRow {
            src: "git".to_string(),
            entry_id: id.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        };
        let entries = group_meta_rows(vec![
            row("a", "title", "Song A"),
            row("a", "rating", "3"),
            row("b", "title", "Song B"),
        ]);

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].meta.len(), 2);
        assert_eq!(entries[1].id, EntryId::new("git", "b"));
    }

    #[test]
    fn test_playlist_position_and_validation() {
        let playlist = Playlist::new(PlaylistId::new("git", "p"), "Mix")
            .with_entry(PlaylistEntry::new("x".into(), EntryId::new("git", "a")))
            .with_entry(PlaylistEntry::new("y".into(), EntryId::new("git", "b")));

        assert_eq!(playlist.position_of(&"y".into()), Some(1));
        assert_eq!(playlist.position_of(&"z".into()), None);
        assert!(playlist.validate().is_ok());
        assert!(Playlist::new(PlaylistId::new("git", "p"), " ").validate().is_err());
    }
}
