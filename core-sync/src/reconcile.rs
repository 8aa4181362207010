//! # Reconciliation
//!
//! Brings the local projection of one source in line with a freshly fetched
//! remote snapshot, then replays the edits that are still pending on top.
//!
//! ## Overview
//!
//! 1. [`reconcile_library`] / [`reconcile_playlists`] diff the local snapshot
//!    against the remote one and apply the resulting mutations
//! 2. [`replay_pending`] drops the leading pending transactions the remote
//!    already shows, and re-applies the rest locally so the user keeps
//!    seeing their own edits

use crate::diff::diff_by;
use crate::error::Result;
use crate::store::TransactionStore;
use crate::transaction::TransactionGroup;
use core_library::{EntryId, LibraryEntry, LocalLibrary, MetaMap, Playlist, PlaylistEntryId, PlaylistId};
use std::collections::HashMap;
use tracing::{debug, info, warn};

// ============================================================================
// Fetched snapshot
// ============================================================================

/// Remote state of one source as fetched by a sync. A group that was not
/// fetched is `None`, which is different from fetched and empty.
#[derive(Debug, Clone, Default)]
pub struct FetchedState {
    pub library: Option<HashMap<EntryId, MetaMap>>,
    pub playlists: Option<HashMap<PlaylistId, Playlist>>,
}

impl FetchedState {
    pub fn with_library(mut self, entries: &[LibraryEntry]) -> Self {
        self.library = Some(
            entries
                .iter()
                .map(|entry| (entry.id.clone(), entry.meta.clone()))
                .collect(),
        );
        self
    }

    pub fn with_playlists(mut self, playlists: &[Playlist]) -> Self {
        self.playlists = Some(
            playlists
                .iter()
                .map(|playlist| (playlist.id.clone(), playlist.clone()))
                .collect(),
        );
        self
    }

    pub fn has_library(&self) -> bool {
        self.library.is_some()
    }

    pub fn has_playlists(&self) -> bool {
        self.playlists.is_some()
    }

    pub fn has_group(&self, group: TransactionGroup) -> bool {
        match group {
            TransactionGroup::Library => self.has_library(),
            TransactionGroup::Playlists => self.has_playlists(),
        }
    }

    pub fn entry_meta(&self, entry: &EntryId) -> Option<&MetaMap> {
        self.library.as_ref()?.get(entry)
    }

    pub fn playlist(&self, playlist: &PlaylistId) -> Option<&Playlist> {
        self.playlists.as_ref()?.get(playlist)
    }
}

/// Mutations applied by one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub added: u64,
    pub deleted: u64,
    pub updated: u64,
    pub moved: u64,
}

impl ReconcileStats {
    pub fn is_empty(&self) -> bool {
        self.added + self.deleted + self.updated + self.moved == 0
    }
}

impl std::ops::AddAssign for ReconcileStats {
    fn add_assign(&mut self, other: Self) {
        self.added += other.added;
        self.deleted += other.deleted;
        self.updated += other.updated;
        self.moved += other.moved;
    }
}

// ============================================================================
// Library
// ============================================================================

/// Make the local library of `source` match `remote`. Order is irrelevant.
pub async fn reconcile_library(
    library: &LocalLibrary,
    source: &str,
    remote: &[LibraryEntry],
) -> Result<ReconcileStats> {
    let local = library.library(source).await?;
    let result = diff_by(&local, remote, |entry| &entry.id, |a, b| a.meta == b.meta);
    let mut stats = ReconcileStats::default();

    for &index in &result.deleted {
        library.delete_all_meta(&local[index].id).await?;
        stats.deleted += 1;
    }
    for &index in &result.added {
        let entry = &remote[index];
        library.replace_meta(&entry.id, &entry.meta).await?;
        stats.added += 1;
    }
    for &(_, index) in &result.updated {
        let entry = &remote[index];
        library.replace_meta(&entry.id, &entry.meta).await?;
        stats.updated += 1;
    }

    info!(
        source = %source,
        added = stats.added,
        deleted = stats.deleted,
        updated = stats.updated,
        "Library reconciled"
    );
    Ok(stats)
}

// ============================================================================
// Playlists
// ============================================================================

fn display_name(playlist: &Playlist) -> &str {
    if playlist.name.trim().is_empty() {
        &playlist.id.local_id
    } else {
        &playlist.name
    }
}

/// Make the local playlists of `source` match `remote`, entries and order
/// included.
pub async fn reconcile_playlists(
    library: &LocalLibrary,
    source: &str,
    remote: &[Playlist],
) -> Result<ReconcileStats> {
    let local = library.playlists(source).await?;
    let result = diff_by(
        &local,
        remote,
        |playlist| &playlist.id,
        |a, b| a.name == b.name && a.meta == b.meta,
    );
    let mut stats = ReconcileStats::default();

    for &index in &result.deleted {
        library.delete_playlist(&local[index].id).await?;
        stats.deleted += 1;
    }

    for &index in &result.added {
        let playlist = &remote[index];
        if playlist.name.trim().is_empty() {
            warn!(playlist = %playlist.id, "Remote playlist has no name, using its id");
        }
        library.add_playlist(&playlist.id, display_name(playlist)).await?;
        library.replace_playlist_meta(&playlist.id, &playlist.meta).await?;
        stats += reconcile_entries(library, &[], playlist).await?;
        stats.added += 1;
    }

    for &(old, new) in &result.updated {
        let playlist = &remote[new];
        library.add_playlist(&playlist.id, display_name(playlist)).await?;
        library.replace_playlist_meta(&playlist.id, &playlist.meta).await?;
        stats += reconcile_entries(library, &local[old].entries, playlist).await?;
        stats.updated += 1;
    }

    let unchanged = result
        .same
        .iter()
        .map(|&index| (index, index))
        .chain(result.moved.iter().copied());
    for (old, new) in unchanged {
        stats += reconcile_entries(library, &local[old].entries, &remote[new]).await?;
    }

    info!(
        source = %source,
        added = stats.added,
        deleted = stats.deleted,
        updated = stats.updated,
        moved = stats.moved,
        "Playlists reconciled"
    );
    Ok(stats)
}

async fn reconcile_entries(
    library: &LocalLibrary,
    local: &[core_library::PlaylistEntry],
    remote: &Playlist,
) -> Result<ReconcileStats> {
    let result = diff_by(local, &remote.entries, |entry| &entry.id, |a, b| a.entry == b.entry);
    if result.is_empty() {
        return Ok(ReconcileStats::default());
    }

    let id = &remote.id;
    for &index in &result.deleted {
        library.delete_playlist_entry(id, &local[index].id).await?;
    }
    // Same entry id now pointing at another song
    for &(old, _) in &result.updated {
        library.delete_playlist_entry(id, &local[old].id).await?;
    }
    for &(_, new) in &result.updated {
        library.add_playlist_entry(id, &remote.entries[new], None).await?;
    }
    for &index in &result.added {
        library.add_playlist_entry(id, &remote.entries[index], None).await?;
    }

    let order: Vec<PlaylistEntryId> = remote.entries.iter().map(|e| e.id.clone()).collect();
    library.reorder_playlist(id, &order).await?;

    debug!(
        playlist = %id,
        added = result.added.len(),
        deleted = result.deleted.len(),
        moved = result.moved.len(),
        "Playlist entries reconciled"
    );

    Ok(ReconcileStats {
        added: result.added.len() as u64,
        deleted: result.deleted.len() as u64,
        updated: result.updated.len() as u64,
        moved: result.moved.len() as u64,
    })
}

// ============================================================================
// Pending replay
// ============================================================================

/// What [`replay_pending`] did with the pending queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Leading transactions already shown by the remote, removed
    pub dropped: usize,
    /// Transactions re-applied on top of the projection
    pub reapplied: usize,
    /// Transactions whose local apply failed
    pub failed: usize,
}

/// Re-apply the pending transactions of `(source, group)` after a
/// reconciliation replaced the projection with remote state.
pub async fn replay_pending(
    store: &dyn TransactionStore,
    library: &LocalLibrary,
    source: &str,
    group: TransactionGroup,
    fetched: &FetchedState,
) -> Result<ReplayOutcome> {
    store.mark_applied_locally(source, group, false).await?;

    let pending = store.list(Some(source), Some(group)).await?;
    let mut outcome = ReplayOutcome::default();

    // Only a leading prefix may be dropped, later edits may depend on
    // earlier ones that are not upstream yet
    let mut remaining = pending.as_slice();
    while let Some((first, rest)) = remaining.split_first() {
        if !first.is_reflected_in(fetched) {
            break;
        }
        debug!(id = first.id, kind = %first.op.kind_str(), "Pending transaction already upstream");
        store.remove(first.id).await?;
        outcome.dropped += 1;
        remaining = rest;
    }

    for tx in remaining {
        match tx.apply_locally(library).await {
            Ok(()) => outcome.reapplied += 1,
            Err(e) => {
                warn!(id = tx.id, kind = %tx.op.kind_str(), error = %e, "Failed to replay pending transaction");
                outcome.failed += 1;
            }
        }
    }

    // The flag covers the whole queue, so it is only set when the whole
    // queue is reflected in the projection again
    if outcome.failed == 0 {
        store.mark_applied_locally(source, group, true).await?;
    }

    info!(
        source = %source,
        group = %group,
        dropped = outcome.dropped,
        reapplied = outcome.reapplied,
        failed = outcome.failed,
        "Pending transactions replayed"
    );
    Ok(outcome)
}
