//! # Transactions
//!
//! A transaction is one user edit of the library or of a playlist. It is
//! applied to the local projection immediately and queued until the backend
//! that owns its source accepts it.
//!
//! ## Overview
//!
//! - [`TransactionOp`] is a closed set of edit kinds, each with a typed payload
//! - Payloads serialize to canonical JSON "args" objects and back
//! - A payload that fails to parse, or a kind this build does not know,
//!   becomes [`TransactionOp::Unknown`] with the raw text preserved, so it
//!   survives a round trip through the store untouched
//! - Two apply paths: [`Transaction::apply_locally`] mutates the projection,
//!   [`Transaction::apply`] goes through the backend's batch
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::Transaction;
//! use core_library::EntryId;
//!
//! let tx = Transaction::meta_edit(EntryId::new("git", "a.flac"), "rating", "3", "5");
//! let tx = store.append(tx).await?;
//! tx.apply_locally(&library).await?;
//! ```

use crate::backend::{Batch, BackendRegistry};
use crate::error::{BatchError, Result, SyncError, TransactionError};
use crate::reconcile::FetchedState;
use core_library::models::meta_contains;
use core_library::{EntryId, LocalLibrary, MetaMap, PlaylistEntry, PlaylistEntryId, PlaylistId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Id of a transaction that has not been persisted yet.
pub const ID_NONE: i64 = -1;

// ============================================================================
// Kind and Group
// ============================================================================

/// Queue a transaction belongs to. Each source has one queue per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionGroup {
    Library,
    Playlists,
}

impl TransactionGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionGroup::Library => "library",
            TransactionGroup::Playlists => "playlists",
        }
    }
}

impl FromStr for TransactionGroup {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "library" => Ok(TransactionGroup::Library),
            "playlists" => Ok(TransactionGroup::Playlists),
            _ => Err(SyncError::InvalidGroup(s.to_string())),
        }
    }
}

impl fmt::Display for TransactionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every edit kind this build understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    MetaAdd,
    MetaDelete,
    MetaEdit,
    MetaDeleteAll,
    PlaylistAdd,
    PlaylistDelete,
    PlaylistMetaAdd,
    PlaylistMetaDelete,
    PlaylistMetaEdit,
    PlaylistEntryAdd,
    PlaylistEntryDelete,
    PlaylistEntryMove,
}

impl TransactionKind {
    pub const ALL: [TransactionKind; 12] = [
        TransactionKind::MetaAdd,
        TransactionKind::MetaDelete,
        TransactionKind::MetaEdit,
        TransactionKind::MetaDeleteAll,
        TransactionKind::PlaylistAdd,
        TransactionKind::PlaylistDelete,
        TransactionKind::PlaylistMetaAdd,
        TransactionKind::PlaylistMetaDelete,
        TransactionKind::PlaylistMetaEdit,
        TransactionKind::PlaylistEntryAdd,
        TransactionKind::PlaylistEntryDelete,
        TransactionKind::PlaylistEntryMove,
    ];

    /// Get the string representation for database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::MetaAdd => "META_ADD",
            TransactionKind::MetaDelete => "META_DELETE",
            TransactionKind::MetaEdit => "META_EDIT",
            TransactionKind::MetaDeleteAll => "META_DELETE_ALL",
            TransactionKind::PlaylistAdd => "PLAYLIST_ADD",
            TransactionKind::PlaylistDelete => "PLAYLIST_DELETE",
            TransactionKind::PlaylistMetaAdd => "PLAYLIST_META_ADD",
            TransactionKind::PlaylistMetaDelete => "PLAYLIST_META_DELETE",
            TransactionKind::PlaylistMetaEdit => "PLAYLIST_META_EDIT",
            TransactionKind::PlaylistEntryAdd => "PLAYLIST_ENTRY_ADD",
            TransactionKind::PlaylistEntryDelete => "PLAYLIST_ENTRY_DELETE",
            TransactionKind::PlaylistEntryMove => "PLAYLIST_ENTRY_MOVE",
        }
    }

    pub fn group(&self) -> TransactionGroup {
        match self {
            TransactionKind::MetaAdd
            | TransactionKind::MetaDelete
            | TransactionKind::MetaEdit
            | TransactionKind::MetaDeleteAll => TransactionGroup::Library,
            _ => TransactionGroup::Playlists,
        }
    }
}

impl FromStr for TransactionKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        TransactionKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| SyncError::InvalidKind(s.to_string()))
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaArgs {
    pub entry: EntryId,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaEditArgs {
    pub entry: EntryId,
    pub key: String,
    pub old_value: String,
    pub new_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryArgs {
    pub entry: EntryId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistAddArgs {
    pub playlist: PlaylistId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistArgs {
    pub playlist: PlaylistId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistMetaArgs {
    pub playlist: PlaylistId,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistMetaEditArgs {
    pub playlist: PlaylistId,
    pub key: String,
    pub old_value: String,
    pub new_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistEntryAddArgs {
    pub playlist: PlaylistId,
    pub entry: EntryId,
    pub playlist_entry_id: PlaylistEntryId,
    #[serde(default)]
    pub before: Option<PlaylistEntryId>,
    #[serde(default)]
    pub meta_snapshot: MetaMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistEntryDeleteArgs {
    pub playlist: PlaylistId,
    pub playlist_entry_id: PlaylistEntryId,
    pub entry: EntryId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistEntryMoveArgs {
    pub playlist: PlaylistId,
    pub playlist_entry_id: PlaylistEntryId,
    pub entry: EntryId,
    #[serde(default)]
    pub before: Option<PlaylistEntryId>,
}

/// The edit itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransactionOp {
    MetaAdd(MetaArgs),
    MetaDelete(MetaArgs),
    MetaEdit(MetaEditArgs),
    MetaDeleteAll(EntryArgs),
    PlaylistAdd(PlaylistAddArgs),
    PlaylistDelete(PlaylistArgs),
    PlaylistMetaAdd(PlaylistMetaArgs),
    PlaylistMetaDelete(PlaylistMetaArgs),
    PlaylistMetaEdit(PlaylistMetaEditArgs),
    PlaylistEntryAdd(PlaylistEntryAddArgs),
    PlaylistEntryDelete(PlaylistEntryDeleteArgs),
    PlaylistEntryMove(PlaylistEntryMoveArgs),
    /// Kind or payload this build cannot interpret. Never applied, never
    /// dropped automatically.
    Unknown { kind: String, raw_args: String },
}

fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Option<T> {
    serde_json::from_value(args.clone()).ok()
}

impl TransactionOp {
    /// `None` for [`TransactionOp::Unknown`].
    pub fn kind(&self) -> Option<TransactionKind> {
        let kind = match self {
            TransactionOp::MetaAdd(_) => TransactionKind::MetaAdd,
            TransactionOp::MetaDelete(_) => TransactionKind::MetaDelete,
            TransactionOp::MetaEdit(_) => TransactionKind::MetaEdit,
            TransactionOp::MetaDeleteAll(_) => TransactionKind::MetaDeleteAll,
            TransactionOp::PlaylistAdd(_) => TransactionKind::PlaylistAdd,
            TransactionOp::PlaylistDelete(_) => TransactionKind::PlaylistDelete,
            TransactionOp::PlaylistMetaAdd(_) => TransactionKind::PlaylistMetaAdd,
            TransactionOp::PlaylistMetaDelete(_) => TransactionKind::PlaylistMetaDelete,
            TransactionOp::PlaylistMetaEdit(_) => TransactionKind::PlaylistMetaEdit,
            TransactionOp::PlaylistEntryAdd(_) => TransactionKind::PlaylistEntryAdd,
            TransactionOp::PlaylistEntryDelete(_) => TransactionKind::PlaylistEntryDelete,
            TransactionOp::PlaylistEntryMove(_) => TransactionKind::PlaylistEntryMove,
            TransactionOp::Unknown { .. } => return None,
        };
        Some(kind)
    }

    /// Kind string as stored, including the raw kind of unknown edits.
    pub fn kind_str(&self) -> &str {
        match (self.kind(), self) {
            (_, TransactionOp::Unknown { kind, .. }) => kind,
            (Some(kind), _) => kind.as_str(),
            (None, _) => "UNKNOWN",
        }
    }

    pub fn group(&self) -> TransactionGroup {
        match (self.kind(), self) {
            (Some(kind), _) => kind.group(),
            (None, TransactionOp::Unknown { kind, .. }) if kind.starts_with("PLAYLIST") => {
                TransactionGroup::Playlists
            }
            (None, _) => TransactionGroup::Library,
        }
    }

    /// Canonical JSON args object.
    pub fn to_args(&self) -> Value {
        let value = match self {
            TransactionOp::MetaAdd(args) | TransactionOp::MetaDelete(args) => {
                serde_json::to_value(args)
            }
            TransactionOp::MetaEdit(args) => serde_json::to_value(args),
            TransactionOp::MetaDeleteAll(args) => serde_json::to_value(args),
            TransactionOp::PlaylistAdd(args) => serde_json::to_value(args),
            TransactionOp::PlaylistDelete(args) => serde_json::to_value(args),
            TransactionOp::PlaylistMetaAdd(args) | TransactionOp::PlaylistMetaDelete(args) => {
                serde_json::to_value(args)
            }
            TransactionOp::PlaylistMetaEdit(args) => serde_json::to_value(args),
            TransactionOp::PlaylistEntryAdd(args) => serde_json::to_value(args),
            TransactionOp::PlaylistEntryDelete(args) => serde_json::to_value(args),
            TransactionOp::PlaylistEntryMove(args) => serde_json::to_value(args),
            TransactionOp::Unknown { raw_args, .. } => {
                return serde_json::from_str(raw_args)
                    .unwrap_or_else(|_| Value::String(raw_args.clone()))
            }
        };
        value.unwrap_or_default()
    }

    /// Args as stored. Unknown edits keep their original text byte for byte.
    pub fn to_args_text(&self) -> String {
        match self {
            TransactionOp::Unknown { raw_args, .. } => raw_args.clone(),
            _ => self.to_args().to_string(),
        }
    }

    /// Rebuild an edit from its kind and args. Never fails: anything that
    /// does not parse becomes [`TransactionOp::Unknown`].
    pub fn from_args(kind: &str, args: &Value) -> Self {
        let parsed = kind.parse::<TransactionKind>().ok().and_then(|known| match known {
            TransactionKind::MetaAdd => parse_args(args).map(TransactionOp::MetaAdd),
            TransactionKind::MetaDelete => parse_args(args).map(TransactionOp::MetaDelete),
            TransactionKind::MetaEdit => parse_args(args).map(TransactionOp::MetaEdit),
            TransactionKind::MetaDeleteAll => parse_args(args).map(TransactionOp::MetaDeleteAll),
            TransactionKind::PlaylistAdd => parse_args(args).map(TransactionOp::PlaylistAdd),
            TransactionKind::PlaylistDelete => parse_args(args).map(TransactionOp::PlaylistDelete),
            TransactionKind::PlaylistMetaAdd => {
                parse_args(args).map(TransactionOp::PlaylistMetaAdd)
            }
            TransactionKind::PlaylistMetaDelete => {
                parse_args(args).map(TransactionOp::PlaylistMetaDelete)
            }
            TransactionKind::PlaylistMetaEdit => {
                parse_args(args).map(TransactionOp::PlaylistMetaEdit)
            }
            TransactionKind::PlaylistEntryAdd => {
                parse_args(args).map(TransactionOp::PlaylistEntryAdd)
            }
            TransactionKind::PlaylistEntryDelete => {
                parse_args(args).map(TransactionOp::PlaylistEntryDelete)
            }
            TransactionKind::PlaylistEntryMove => {
                parse_args(args).map(TransactionOp::PlaylistEntryMove)
            }
        });

        parsed.unwrap_or_else(|| TransactionOp::Unknown {
            kind: kind.to_string(),
            raw_args: args.to_string(),
        })
    }

    /// Same as [`TransactionOp::from_args`] starting from stored text.
    pub fn from_args_text(kind: &str, text: &str) -> Self {
        match serde_json::from_str::<Value>(text) {
            Ok(args) => match Self::from_args(kind, &args) {
                TransactionOp::Unknown { kind, .. } => TransactionOp::Unknown {
                    kind,
                    raw_args: text.to_string(),
                },
                op => op,
            },
            Err(_) => TransactionOp::Unknown {
                kind: kind.to_string(),
                raw_args: text.to_string(),
            },
        }
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// JSON envelope used to hand transactions to hosts.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    id: i64,
    src: String,
    date: i64,
    #[serde(default)]
    error_count: u32,
    #[serde(default)]
    error_message: Option<String>,
    kind: String,
    args: Value,
}

/// One queued edit with its bookkeeping.
///
/// Equality and hashing look at `(source, op)` only. Row id, timestamps,
/// error bookkeeping and the applied-locally flag are ignored.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Store row id, [`ID_NONE`] until persisted
    pub id: i64,
    /// Backend source whose queue this edit is in
    pub source: String,
    /// Creation time, Unix millis
    pub created_at: i64,
    /// Failed backend attempts so far
    pub error_count: u32,
    /// Message of the last failed attempt
    pub error_message: Option<String>,
    /// Whether the edit is currently reflected in the projection
    pub applied_locally: bool,
    pub op: TransactionOp,
}

impl Transaction {
    pub fn new(source: impl Into<String>, op: TransactionOp) -> Self {
        Self {
            id: ID_NONE,
            source: source.into(),
            created_at: chrono::Utc::now().timestamp_millis(),
            error_count: 0,
            error_message: None,
            applied_locally: false,
            op,
        }
    }

    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn meta_add(entry: EntryId, key: impl Into<String>, value: impl Into<String>) -> Self {
        let source = entry.source.clone();
        Self::new(
            source,
            TransactionOp::MetaAdd(MetaArgs {
                entry,
                key: key.into(),
                value: value.into(),
            }),
        )
    }

    pub fn meta_delete(entry: EntryId, key: impl Into<String>, value: impl Into<String>) -> Self {
        let source = entry.source.clone();
        Self::new(
            source,
            TransactionOp::MetaDelete(MetaArgs {
                entry,
                key: key.into(),
                value: value.into(),
            }),
        )
    }

    pub fn meta_edit(
        entry: EntryId,
        key: impl Into<String>,
        old_value: impl Into<String>,
        new_value: impl Into<String>,
    ) -> Self {
        let source = entry.source.clone();
        Self::new(
            source,
            TransactionOp::MetaEdit(MetaEditArgs {
                entry,
                key: key.into(),
                old_value: old_value.into(),
                new_value: new_value.into(),
            }),
        )
    }

    pub fn meta_delete_all(entry: EntryId) -> Self {
        let source = entry.source.clone();
        Self::new(source, TransactionOp::MetaDeleteAll(EntryArgs { entry }))
    }

    pub fn playlist_add(playlist: PlaylistId, name: impl Into<String>) -> Self {
        let source = playlist.source.clone();
        Self::new(
            source,
            TransactionOp::PlaylistAdd(PlaylistAddArgs {
                playlist,
                name: name.into(),
            }),
        )
    }

    pub fn playlist_delete(playlist: PlaylistId) -> Self {
        let source = playlist.source.clone();
        Self::new(source, TransactionOp::PlaylistDelete(PlaylistArgs { playlist }))
    }

    pub fn playlist_meta_add(
        playlist: PlaylistId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let source = playlist.source.clone();
        Self::new(
            source,
            TransactionOp::PlaylistMetaAdd(PlaylistMetaArgs {
                playlist,
                key: key.into(),
                value: value.into(),
            }),
        )
    }

    pub fn playlist_meta_delete(
        playlist: PlaylistId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let source = playlist.source.clone();
        Self::new(
            source,
            TransactionOp::PlaylistMetaDelete(PlaylistMetaArgs {
                playlist,
                key: key.into(),
                value: value.into(),
            }),
        )
    }

    pub fn playlist_meta_edit(
        playlist: PlaylistId,
        key: impl Into<String>,
        old_value: impl Into<String>,
        new_value: impl Into<String>,
    ) -> Self {
        let source = playlist.source.clone();
        Self::new(
            source,
            TransactionOp::PlaylistMetaEdit(PlaylistMetaEditArgs {
                playlist,
                key: key.into(),
                old_value: old_value.into(),
                new_value: new_value.into(),
            }),
        )
    }

    /// Add `entry` to `playlist` before `before` (or at the end). A fresh
    /// playlist entry id is generated here.
    pub fn playlist_entry_add(
        playlist: PlaylistId,
        entry: EntryId,
        before: Option<PlaylistEntryId>,
        meta_snapshot: MetaMap,
    ) -> Self {
        let source = playlist.source.clone();
        Self::new(
            source,
            TransactionOp::PlaylistEntryAdd(PlaylistEntryAddArgs {
                playlist,
                entry,
                playlist_entry_id: PlaylistEntryId::generate(),
                before,
                meta_snapshot,
            }),
        )
    }

    pub fn playlist_entry_delete(
        playlist: PlaylistId,
        playlist_entry_id: PlaylistEntryId,
        entry: EntryId,
    ) -> Self {
        let source = playlist.source.clone();
        Self::new(
            source,
            TransactionOp::PlaylistEntryDelete(PlaylistEntryDeleteArgs {
                playlist,
                playlist_entry_id,
                entry,
            }),
        )
    }

    pub fn playlist_entry_move(
        playlist: PlaylistId,
        playlist_entry_id: PlaylistEntryId,
        entry: EntryId,
        before: Option<PlaylistEntryId>,
    ) -> Self {
        let source = playlist.source.clone();
        Self::new(
            source,
            TransactionOp::PlaylistEntryMove(PlaylistEntryMoveArgs {
                playlist,
                playlist_entry_id,
                entry,
                before,
            }),
        )
    }

    pub fn kind(&self) -> Option<TransactionKind> {
        self.op.kind()
    }

    pub fn group(&self) -> TransactionGroup {
        self.op.group()
    }

    pub fn is_persisted(&self) -> bool {
        self.id != ID_NONE
    }

    /// Source of the item the edit refers to. Differs from `source` when a
    /// song from one backend is added to another backend's playlist.
    pub fn arg_source(&self) -> &str {
        match &self.op {
            TransactionOp::MetaAdd(a) | TransactionOp::MetaDelete(a) => &a.entry.source,
            TransactionOp::MetaEdit(a) => &a.entry.source,
            TransactionOp::MetaDeleteAll(a) => &a.entry.source,
            TransactionOp::PlaylistEntryAdd(a) => &a.entry.source,
            TransactionOp::PlaylistEntryDelete(a) => &a.entry.source,
            TransactionOp::PlaylistEntryMove(a) => &a.entry.source,
            TransactionOp::PlaylistAdd(a) => &a.playlist.source,
            TransactionOp::PlaylistDelete(a) => &a.playlist.source,
            TransactionOp::PlaylistMetaAdd(a) | TransactionOp::PlaylistMetaDelete(a) => {
                &a.playlist.source
            }
            TransactionOp::PlaylistMetaEdit(a) => &a.playlist.source,
            TransactionOp::Unknown { .. } => &self.source,
        }
    }

    /// One-line human readable description for status strings.
    pub fn describe(&self) -> String {
        match &self.op {
            TransactionOp::MetaAdd(a) => format!("add {}={} to {}", a.key, a.value, a.entry),
            TransactionOp::MetaDelete(a) => {
                format!("remove {}={} from {}", a.key, a.value, a.entry)
            }
            TransactionOp::MetaEdit(a) => format!(
                "change {} of {} from {} to {}",
                a.key, a.entry, a.old_value, a.new_value
            ),
            TransactionOp::MetaDeleteAll(a) => format!("remove {}", a.entry),
            TransactionOp::PlaylistAdd(a) => format!("create playlist {} ({})", a.name, a.playlist),
            TransactionOp::PlaylistDelete(a) => format!("delete playlist {}", a.playlist),
            TransactionOp::PlaylistMetaAdd(a) => {
                format!("add {}={} to playlist {}", a.key, a.value, a.playlist)
            }
            TransactionOp::PlaylistMetaDelete(a) => {
                format!("remove {}={} from playlist {}", a.key, a.value, a.playlist)
            }
            TransactionOp::PlaylistMetaEdit(a) => format!(
                "change {} of playlist {} from {} to {}",
                a.key, a.playlist, a.old_value, a.new_value
            ),
            TransactionOp::PlaylistEntryAdd(a) => {
                format!("add {} to playlist {}", a.entry, a.playlist)
            }
            TransactionOp::PlaylistEntryDelete(a) => {
                format!("remove {} from playlist {}", a.entry, a.playlist)
            }
            TransactionOp::PlaylistEntryMove(a) => {
                format!("move {} in playlist {}", a.entry, a.playlist)
            }
            TransactionOp::Unknown { kind, .. } => format!("unsupported {} edit", kind),
        }
    }

    // ------------------------------------------------------------------------
    // JSON envelope
    // ------------------------------------------------------------------------

    /// `{id, src, date, errorCount, errorMessage, kind, args}`
    pub fn to_json(&self) -> Value {
        let envelope = Envelope {
            id: self.id,
            src: self.source.clone(),
            date: self.created_at,
            error_count: self.error_count,
            error_message: self.error_message.clone(),
            kind: self.op.kind_str().to_string(),
            args: self.op.to_args(),
        };
        serde_json::to_value(envelope).unwrap_or_default()
    }

    /// Parse an envelope. Only a malformed envelope is an error; a malformed
    /// `args` object yields an unknown edit.
    pub fn from_json(value: &Value) -> Result<Self> {
        let envelope: Envelope = serde_json::from_value(value.clone())
            .map_err(|e| SyncError::InvalidPayload(e.to_string()))?;

        Ok(Self {
            id: envelope.id,
            source: envelope.src,
            created_at: envelope.date,
            error_count: envelope.error_count,
            error_message: envelope.error_message,
            applied_locally: false,
            op: TransactionOp::from_args(&envelope.kind, &envelope.args),
        })
    }

    // ------------------------------------------------------------------------
    // Apply paths
    // ------------------------------------------------------------------------

    /// Send the edit to the backend of its source as a single-edit batch.
    ///
    /// Nothing is staged when the backend does not support the edit.
    pub async fn apply(&self, backends: &BackendRegistry) -> std::result::Result<(), TransactionError> {
        let kind = self
            .kind()
            .ok_or_else(|| TransactionError::Unsupported(self.op.kind_str().to_string()))?;

        let backend = backends
            .get(&self.source)
            .await
            .ok_or_else(|| TransactionError::BackendNotFound(self.source.clone()))?;

        if !backend.supports(kind, self.arg_source()) {
            return Err(TransactionError::NotSupported {
                backend: self.source.clone(),
                kind: kind.as_str().to_string(),
                arg_source: self.arg_source().to_string(),
            });
        }

        let mut batch = backend.start_batch().await?;
        self.add_to_batch(batch.as_mut()).await?;
        batch.commit().await?;
        Ok(())
    }

    /// Stage the edit into an open batch.
    pub async fn add_to_batch(&self, batch: &mut dyn Batch) -> std::result::Result<(), BatchError> {
        match &self.op {
            TransactionOp::MetaAdd(a) => batch.add_meta(&a.entry, &a.key, &a.value).await,
            TransactionOp::MetaDelete(a) => batch.delete_meta(&a.entry, &a.key, &a.value).await,
            TransactionOp::MetaEdit(a) => {
                batch
                    .edit_meta(&a.entry, &a.key, &a.old_value, &a.new_value)
                    .await
            }
            TransactionOp::MetaDeleteAll(a) => batch.delete_all_meta(&a.entry).await,
            TransactionOp::PlaylistAdd(a) => batch.add_playlist(&a.playlist, &a.name).await,
            TransactionOp::PlaylistDelete(a) => batch.delete_playlist(&a.playlist).await,
            TransactionOp::PlaylistMetaAdd(a) => {
                batch.add_playlist_meta(&a.playlist, &a.key, &a.value).await
            }
            TransactionOp::PlaylistMetaDelete(a) => {
                batch.delete_playlist_meta(&a.playlist, &a.key, &a.value).await
            }
            TransactionOp::PlaylistMetaEdit(a) => {
                batch
                    .edit_playlist_meta(&a.playlist, &a.key, &a.old_value, &a.new_value)
                    .await
            }
            TransactionOp::PlaylistEntryAdd(a) => {
                let entry = PlaylistEntry {
                    id: a.playlist_entry_id.clone(),
                    entry: a.entry.clone(),
                    meta_snapshot: a.meta_snapshot.clone(),
                };
                batch
                    .add_playlist_entry(&a.playlist, &entry, a.before.as_ref())
                    .await
            }
            TransactionOp::PlaylistEntryDelete(a) => {
                batch
                    .delete_playlist_entry(&a.playlist, &a.playlist_entry_id, &a.entry)
                    .await
            }
            TransactionOp::PlaylistEntryMove(a) => {
                batch
                    .move_playlist_entry(
                        &a.playlist,
                        &a.playlist_entry_id,
                        &a.entry,
                        a.before.as_ref(),
                    )
                    .await
            }
            TransactionOp::Unknown { kind, .. } => Err(BatchError::Unsupported(format!(
                "unsupported transaction kind {}",
                kind
            ))),
        }
    }

    /// Apply the edit to the local projection. Idempotent.
    pub async fn apply_locally(
        &self,
        library: &LocalLibrary,
    ) -> std::result::Result<(), TransactionError> {
        match &self.op {
            TransactionOp::MetaAdd(a) => library.add_meta(&a.entry, &a.key, &a.value).await?,
            TransactionOp::MetaDelete(a) => library.delete_meta(&a.entry, &a.key, &a.value).await?,
            TransactionOp::MetaEdit(a) => {
                library
                    .edit_meta(&a.entry, &a.key, &a.old_value, &a.new_value)
                    .await?
            }
            TransactionOp::MetaDeleteAll(a) => library.delete_all_meta(&a.entry).await?,
            TransactionOp::PlaylistAdd(a) => library.add_playlist(&a.playlist, &a.name).await?,
            TransactionOp::PlaylistDelete(a) => library.delete_playlist(&a.playlist).await?,
            TransactionOp::PlaylistMetaAdd(a) => {
                library
                    .add_playlist_meta(&a.playlist, &a.key, &a.value)
                    .await?
            }
            TransactionOp::PlaylistMetaDelete(a) => {
                library
                    .delete_playlist_meta(&a.playlist, &a.key, &a.value)
                    .await?
            }
            TransactionOp::PlaylistMetaEdit(a) => {
                library
                    .edit_playlist_meta(&a.playlist, &a.key, &a.old_value, &a.new_value)
                    .await?
            }
            TransactionOp::PlaylistEntryAdd(a) => {
                let entry = PlaylistEntry {
                    id: a.playlist_entry_id.clone(),
                    entry: a.entry.clone(),
                    meta_snapshot: a.meta_snapshot.clone(),
                };
                library
                    .add_playlist_entry(&a.playlist, &entry, a.before.as_ref())
                    .await?
            }
            TransactionOp::PlaylistEntryDelete(a) => {
                library
                    .delete_playlist_entry(&a.playlist, &a.playlist_entry_id)
                    .await?
            }
            TransactionOp::PlaylistEntryMove(a) => {
                library
                    .move_playlist_entry(&a.playlist, &a.playlist_entry_id, a.before.as_ref())
                    .await?
            }
            TransactionOp::Unknown { kind, .. } => {
                return Err(TransactionError::Unsupported(kind.clone()))
            }
        }
        Ok(())
    }

    /// Whether a freshly fetched remote state already shows exactly the
    /// outcome of this edit. Unknown edits and groups missing from the fetch
    /// are never reflected.
    pub fn is_reflected_in(&self, state: &FetchedState) -> bool {
        match &self.op {
            TransactionOp::MetaAdd(a) => state
                .entry_meta(&a.entry)
                .map_or(false, |meta| meta_contains(meta, &a.key, &a.value)),
            TransactionOp::MetaDelete(a) => state.has_library()
                && !state
                    .entry_meta(&a.entry)
                    .map_or(false, |meta| meta_contains(meta, &a.key, &a.value)),
            TransactionOp::MetaEdit(a) => state.entry_meta(&a.entry).map_or(false, |meta| {
                meta_contains(meta, &a.key, &a.new_value)
                    && !meta_contains(meta, &a.key, &a.old_value)
            }),
            TransactionOp::MetaDeleteAll(a) => {
                state.has_library()
                    && state.entry_meta(&a.entry).map_or(true, |meta| meta.is_empty())
            }
            TransactionOp::PlaylistAdd(a) => state
                .playlist(&a.playlist)
                .map_or(false, |p| p.name == a.name),
            TransactionOp::PlaylistDelete(a) => {
                state.has_playlists() && state.playlist(&a.playlist).is_none()
            }
            TransactionOp::PlaylistMetaAdd(a) => state
                .playlist(&a.playlist)
                .map_or(false, |p| meta_contains(&p.meta, &a.key, &a.value)),
            TransactionOp::PlaylistMetaDelete(a) => {
                state.has_playlists()
                    && !state
                        .playlist(&a.playlist)
                        .map_or(false, |p| meta_contains(&p.meta, &a.key, &a.value))
            }
            TransactionOp::PlaylistMetaEdit(a) => state.playlist(&a.playlist).map_or(false, |p| {
                meta_contains(&p.meta, &a.key, &a.new_value)
                    && !meta_contains(&p.meta, &a.key, &a.old_value)
            }),
            TransactionOp::PlaylistEntryAdd(a) => {
                state.playlist(&a.playlist).map_or(false, |p| {
                    match p.position_of(&a.playlist_entry_id) {
                        Some(index) => {
                            p.entries[index].entry == a.entry
                                && placed_before(p, index, a.before.as_ref(), false)
                        }
                        None => false,
                    }
                })
            }
            TransactionOp::PlaylistEntryDelete(a) => {
                state.has_playlists()
                    && state
                        .playlist(&a.playlist)
                        .map_or(true, |p| p.position_of(&a.playlist_entry_id).is_none())
            }
            TransactionOp::PlaylistEntryMove(a) => state.playlist(&a.playlist).map_or(false, |p| {
                p.position_of(&a.playlist_entry_id)
                    .map_or(false, |index| placed_before(p, index, a.before.as_ref(), true))
            }),
            TransactionOp::Unknown { .. } => false,
        }
    }
}

/// Whether the entry at `index` sits directly before `before`. Without an
/// anchor, moves must be last and adds may be anywhere.
fn placed_before(
    playlist: &core_library::Playlist,
    index: usize,
    before: Option<&PlaylistEntryId>,
    must_be_last_without_anchor: bool,
) -> bool {
    match before {
        Some(anchor) => match playlist.position_of(anchor) {
            Some(anchor_index) => anchor_index == index + 1,
            // Anchor gone upstream; the edit landed at the end
            None => index + 1 == playlist.entries.len(),
        },
        None if must_be_last_without_anchor => index + 1 == playlist.entries.len(),
        None => true,
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.op == other.op
    }
}

impl Eq for Transaction {}

impl Hash for Transaction {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
        self.op.hash(state);
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} [{}] {}", self.id, self.source, self.describe())
    }
}

// ============================================================================
// Tests
// ============================================================================
