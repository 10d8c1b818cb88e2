//! Persistence and identity interfaces consumed by the tracker.
//!
//! The tracker never talks to a database directly. Implementations live in
//! other crates (`pt-db` for SQLite) or in test fixtures.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::types::{ExternalUserId, ItemId, PlaylistId, SessionId, UserId};

/// A playlist whose first track matches an observed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistCandidate {
    pub playlist_id: PlaylistId,
    pub external_playlist_id: Option<String>,
    /// Track at index 1, used to disambiguate between candidates.
    pub second_item_id: Option<ItemId>,
}

/// Descriptive playlist metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistInfo {
    pub name: String,
    pub generated_at: Option<DateTime<Utc>>,
    pub total_files: u32,
    pub external_playlist_id: Option<String>,
}

/// Values written when a session row is created or updated.
#[derive(Debug, Clone, Copy)]
pub struct SessionUpsert<'a> {
    pub user_id: &'a UserId,
    pub playlist_id: PlaylistId,
    pub external_playlist_id: Option<&'a str>,
    pub current_index: u32,
    pub is_confirmed: bool,
    pub seen_at: DateTime<Utc>,
}

/// A persisted session row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub playlist_id: PlaylistId,
    pub external_playlist_id: Option<String>,
    pub current_index: u32,
    pub last_seen: DateTime<Utc>,
    pub is_confirmed: bool,
    pub is_complete: bool,
}

/// Accumulated listening ticks for one user, item and hour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyListening {
    pub external_user_id: ExternalUserId,
    pub item_id: ItemId,
    pub hour_start: DateTime<Utc>,
    pub ticks: i64,
}

/// Internal identity of a media-server user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

/// Read access to generated playlists and item metadata.
pub trait PlaylistStore: Send + Sync {
    /// Item at a 0-based position, if the playlist has one.
    fn track_at_index(&self, playlist: PlaylistId, index: u32)
    -> Result<Option<ItemId>, StoreError>;

    /// Position of an item within a playlist, if it is part of it.
    fn order_index_of(&self, playlist: PlaylistId, item: &ItemId)
    -> Result<Option<u32>, StoreError>;

    /// Number of tracks in a playlist (0 if unknown).
    fn playlist_length(&self, playlist: PlaylistId) -> Result<u32, StoreError>;

    fn playlist_info(&self, playlist: PlaylistId) -> Result<Option<PlaylistInfo>, StoreError>;

    /// Non-expired playlists of `user` whose first track is `item`, most
    /// recently generated first.
    fn candidate_playlists_by_first_track(
        &self,
        user: &UserId,
        item: &ItemId,
    ) -> Result<Vec<PlaylistCandidate>, StoreError>;

    /// Track runtime in seconds, if metadata is available.
    fn track_runtime(&self, item: &ItemId) -> Result<Option<f64>, StoreError>;

    fn item_title(&self, item: &ItemId) -> Result<Option<String>, StoreError>;

    /// Sum of all track runtimes in seconds.
    fn playlist_total_runtime(&self, playlist: PlaylistId) -> Result<f64, StoreError>;
}

/// Read/write access to playlist session progress.
pub trait SessionStore: Send + Sync {
    /// Creates the user's incomplete session for the playlist, or updates the
    /// existing one. Always returns the same ID for the same open session.
    fn upsert_session(&self, session: &SessionUpsert<'_>) -> Result<SessionId, StoreError>;

    fn record_track_completion(
        &self,
        session: SessionId,
        item: &ItemId,
        index: u32,
        seconds: f64,
    ) -> Result<(), StoreError>;

    fn mark_session_complete(&self, session: SessionId) -> Result<(), StoreError>;

    /// Most recently seen incomplete session of `user` last seen at or after
    /// `since`.
    fn find_recent_incomplete_session(
        &self,
        user: &UserId,
        since: DateTime<Utc>,
    ) -> Result<Option<SessionRow>, StoreError>;

    /// Total listened seconds recorded for a session.
    fn session_listen_time(&self, session: SessionId) -> Result<f64, StoreError>;
}

/// Sink for flushed hourly listening buckets.
pub trait ListeningStore: Send + Sync {
    /// Adds each row's ticks to the stored total for its bucket.
    fn flush_hourly(&self, rows: &[HourlyListening]) -> Result<usize, StoreError>;
}

/// Maps media-server users to internal users.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, external: &ExternalUserId) -> Result<Option<Identity>, StoreError>;
}

/// The collaborators the tracker reads from and writes to.
#[derive(Clone)]
pub struct Stores {
    pub playlists: Arc<dyn PlaylistStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub identity: Arc<dyn IdentityResolver>,
}

impl Stores {
    /// Uses one implementation for every interface.
    pub fn from_shared<S>(store: &Arc<S>) -> Self
    where
        S: PlaylistStore + SessionStore + IdentityResolver + 'static,
    {
        Self {
            playlists: Arc::clone(store) as Arc<dyn PlaylistStore>,
            sessions: Arc::clone(store) as Arc<dyn SessionStore>,
            identity: Arc::clone(store) as Arc<dyn IdentityResolver>,
        }
    }
}

impl fmt::Debug for Stores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
