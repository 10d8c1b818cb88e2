//! Per-user session state.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::PlaylistCandidate;
use crate::types::{ExternalUserId, ItemId, PlaylistId, SessionId};

/// Whether the playlist a user is following is known for certain.
///
/// A session only ever moves from `Seeding` to `Confirmed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    /// Several playlists start with the observed track. Each candidate
    /// carries the second track that would confirm it.
    Seeding { candidates: Vec<PlaylistCandidate> },
    Confirmed,
}

/// One user's position within one playlist attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    /// Assigned on first persistence; never reassigned afterwards.
    pub session_id: Option<SessionId>,
    pub playlist_id: PlaylistId,
    pub external_playlist_id: Option<String>,
    pub current_index: u32,
    pub phase: SessionPhase,
    pub current_item_id: ItemId,
    /// Seconds heard on the current track.
    pub seconds_accum: f64,
    /// Loaded lazily on first need.
    pub playlist_length: Option<u32>,
    pub playlist_total_runtime: f64,
    pub track_started_at: DateTime<Utc>,
    pub external_user_id: ExternalUserId,
}

impl SessionState {
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        matches!(self.phase, SessionPhase::Confirmed)
    }

    /// Whether the current track is the playlist's last one.
    ///
    /// False while the length is unknown.
    #[must_use]
    pub fn on_final_track(&self) -> bool {
        self.playlist_length
            .is_some_and(|len| len > 0 && self.current_index + 1 >= len)
    }

    /// Moves the pointer to a new track and restarts its clocks.
    pub(crate) fn move_to(&mut self, index: u32, item: ItemId, credit: f64, now: DateTime<Utc>) {
        self.current_index = index;
        self.current_item_id = item;
        self.seconds_accum = credit;
        self.track_started_at = now;
    }

    /// Wall-clock seconds since the current track started.
    pub(crate) fn wall_clock_secs(&self, now: DateTime<Utc>) -> f64 {
        #[expect(
            clippy::cast_precision_loss,
            reason = "millisecond spans of a single track fit in f64"
        )]
        let millis = (now - self.track_started_at).num_milliseconds().max(0) as f64;
        millis / 1000.0
    }

    /// A serializable view for introspection.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            playlist_id: self.playlist_id,
            external_playlist_id: self.external_playlist_id.clone(),
            current_index: self.current_index,
            is_confirmed: self.is_confirmed(),
            current_item_id: self.current_item_id.clone(),
            seconds_accum: self.seconds_accum,
            playlist_length: self.playlist_length,
            track_started_at: self.track_started_at,
            external_user_id: self.external_user_id.clone(),
        }
    }
}

/// Flattened [`SessionState`] for logs and status output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: Option<SessionId>,
    pub playlist_id: PlaylistId,
    pub external_playlist_id: Option<String>,
    pub current_index: u32,
    pub is_confirmed: bool,
    pub current_item_id: ItemId,
    pub seconds_accum: f64,
    pub playlist_length: Option<u32>,
    pub track_started_at: DateTime<Utc>,
    pub external_user_id: ExternalUserId,
}

/// Why tracking of a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Completed,
    SwitchedAway,
    /// An unconfirmed seed was contradicted by the next track.
    Discarded,
    Abandoned,
}

/// Outcome of feeding one increment to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Tracking(SessionState),
    Ended(EndReason),
    /// Nothing is tracked and the observation did not start a session.
    Untracked,
}
