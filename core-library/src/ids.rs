//! Identities shared by the projection, the transaction log and the backends.
//!
//! Every library item and playlist is addressed by the backend source that
//! owns it plus the backend's own identifier. Playlist entries get their own
//! opaque identity so a song can appear in a playlist more than once.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Source and id used by [`EntryId::unknown`].
pub const UNKNOWN: &str = "unknown";

// ============================================================================
// EntryId
// ============================================================================

/// Identity of a library item.
///
/// Serialized as `{"src": ..., "id": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId {
    #[serde(rename = "src")]
    pub source: String,
    #[serde(rename = "id")]
    pub local_id: String,
}

impl EntryId {
    pub fn new(source: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            local_id: local_id.into(),
        }
    }

    /// Sentinel for items whose identity could not be determined.
    pub fn unknown() -> Self {
        Self::new(UNKNOWN, UNKNOWN)
    }

    pub fn is_unknown(&self) -> bool {
        self.source == UNKNOWN && self.local_id == UNKNOWN
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.local_id)
    }
}

// ============================================================================
// PlaylistId
// ============================================================================

/// Identity of a playlist. Same shape as [`EntryId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlaylistId {
    #[serde(rename = "src")]
    pub source: String,
    #[serde(rename = "id")]
    pub local_id: String,
}

impl PlaylistId {
    pub fn new(source: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            local_id: local_id.into(),
        }
    }
}

impl fmt::Display for PlaylistId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.local_id)
    }
}

// ============================================================================
// PlaylistEntryId
// ============================================================================

/// Opaque identity of one occurrence of a song inside a playlist.
///
/// Generated once when the edit is created, so replaying the edit never
/// produces a second occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaylistEntryId(String);

impl PlaylistEntryId {
    /// Fresh random id (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PlaylistEntryId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for PlaylistEntryId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for PlaylistEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_entry_id_json_shape() {
        let id = EntryId::new("git", "songs/a.flac");
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json, serde_json::json!({"src": "git", "id": "songs/a.flac"}));

        let back: EntryId = serde_json::from_value(json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_unknown_sentinel() {
        let unknown = EntryId::unknown();
        assert!(unknown.is_unknown());
        assert!(!EntryId::new("git", "unknown").is_unknown());
        assert_eq!(unknown.to_string(), "unknown:unknown");
    }

    #[test]
    fn test_value_equality_and_hash() {
        let mut set = HashSet::new();
        set.insert(PlaylistId::new("git", "road-trip"));
        set.insert(PlaylistId::new("git", "road-trip"));
        set.insert(PlaylistId::new("local", "road-trip"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_playlist_entry_id_is_transparent() {
        let id = PlaylistEntryId::from("pe-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"pe-1\"");
        assert_ne!(PlaylistEntryId::generate(), PlaylistEntryId::generate());
    }
}
