//! Domain events emitted by the tracker.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ExternalUserId, ItemId, PlaylistId, SessionId, UserId};

/// Who an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventUser {
    pub user_id: UserId,
    pub display_name: String,
    pub external_user_id: ExternalUserId,
}

/// Which playlist attempt an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPlaylist {
    pub playlist_id: PlaylistId,
    pub playlist_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub total_tracks: u32,
}

/// A playlist session was confirmed and tracking began.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartEvent {
    pub user: EventUser,
    pub playlist: EventPlaylist,
    pub current_index: u32,
    pub current_item_id: ItemId,
    pub current_item_title: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Movement from one track to another within the playlist.
///
/// Used for both `Advance` (previous track heard) and `Jump` (skipped or
/// non-sequential).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackChangeEvent {
    pub user: EventUser,
    pub playlist: EventPlaylist,
    pub from_index: u32,
    pub to_index: u32,
    pub from_item_id: ItemId,
    pub to_item_id: ItemId,
    pub from_item_title: Option<String>,
    pub to_item_title: Option<String>,
    /// Seconds credited to the track that was left.
    pub seconds_on_from: f64,
    pub occurred_at: DateTime<Utc>,
}

/// The user started playing something outside the tracked playlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchAwayEvent {
    pub user: EventUser,
    pub playlist: EventPlaylist,
    pub from_index: u32,
    pub from_item_id: ItemId,
    pub from_item_title: Option<String>,
    pub seconds_on_from: f64,
    pub switched_to_item_id: ItemId,
    pub switched_to_item_title: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// The user has been absent long enough to be considered paused or waiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbsenceEvent {
    pub user: EventUser,
    pub playlist: EventPlaylist,
    pub current_index: u32,
    pub current_item_id: ItemId,
    pub current_item_title: Option<String>,
    pub minutes_absent: f64,
    pub occurred_at: DateTime<Utc>,
}

/// The user came back after a `Paused` or `Waiting` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumedEvent {
    pub user: EventUser,
    pub playlist: EventPlaylist,
    pub current_index: u32,
    pub current_item_id: ItemId,
    pub current_item_title: Option<String>,
    pub minutes_away: f64,
    pub occurred_at: DateTime<Utc>,
}

/// The session was torn down after prolonged absence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbandonedEvent {
    pub user: EventUser,
    pub playlist: EventPlaylist,
    pub last_index: u32,
    pub last_item_id: ItemId,
    pub last_item_title: Option<String>,
    pub seconds_on_last: f64,
    pub occurred_at: DateTime<Utc>,
}

/// The final track was heard and the playlist is complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteEvent {
    pub user: EventUser,
    pub playlist: EventPlaylist,
    pub external_playlist_id: Option<String>,
    pub completed_tracks: u32,
    pub listen_duration_secs: f64,
    pub occurred_at: DateTime<Utc>,
}

/// Every event the tracker can emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackerEvent {
    Start(StartEvent),
    Advance(TrackChangeEvent),
    Jump(TrackChangeEvent),
    SwitchAway(SwitchAwayEvent),
    Paused(AbsenceEvent),
    Waiting(AbsenceEvent),
    Resumed(ResumedEvent),
    Abandoned(AbandonedEvent),
    Complete(CompleteEvent),
}

impl TrackerEvent {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Start(_) => EventKind::Start,
            Self::Advance(_) => EventKind::Advance,
            Self::Jump(_) => EventKind::Jump,
            Self::SwitchAway(_) => EventKind::SwitchAway,
            Self::Paused(_) => EventKind::Paused,
            Self::Waiting(_) => EventKind::Waiting,
            Self::Resumed(_) => EventKind::Resumed,
            Self::Abandoned(_) => EventKind::Abandoned,
            Self::Complete(_) => EventKind::Complete,
        }
    }

    #[must_use]
    pub const fn user(&self) -> &EventUser {
        match self {
            Self::Start(e) => &e.user,
            Self::Advance(e) | Self::Jump(e) => &e.user,
            Self::SwitchAway(e) => &e.user,
            Self::Paused(e) | Self::Waiting(e) => &e.user,
            Self::Resumed(e) => &e.user,
            Self::Abandoned(e) => &e.user,
            Self::Complete(e) => &e.user,
        }
    }

    #[must_use]
    pub const fn playlist(&self) -> &EventPlaylist {
        match self {
            Self::Start(e) => &e.playlist,
            Self::Advance(e) | Self::Jump(e) => &e.playlist,
            Self::SwitchAway(e) => &e.playlist,
            Self::Paused(e) | Self::Waiting(e) => &e.playlist,
            Self::Resumed(e) => &e.playlist,
            Self::Abandoned(e) => &e.playlist,
            Self::Complete(e) => &e.playlist,
        }
    }

    #[must_use]
    pub const fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::Start(e) => e.started_at,
            Self::Advance(e) | Self::Jump(e) => e.occurred_at,
            Self::SwitchAway(e) => e.occurred_at,
            Self::Paused(e) | Self::Waiting(e) => e.occurred_at,
            Self::Resumed(e) => e.occurred_at,
            Self::Abandoned(e) => e.occurred_at,
            Self::Complete(e) => e.occurred_at,
        }
    }
}

/// Discriminant of [`TrackerEvent`], as used in logs and serialized output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    Advance,
    Jump,
    SwitchAway,
    Paused,
    Waiting,
    Resumed,
    Abandoned,
    Complete,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Advance => "advance",
            Self::Jump => "jump",
            Self::SwitchAway => "switch_away",
            Self::Paused => "paused",
            Self::Waiting => "waiting",
            Self::Resumed => "resumed",
            Self::Abandoned => "abandoned",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "advance" => Ok(Self::Advance),
            "jump" => Ok(Self::Jump),
            "switch_away" => Ok(Self::SwitchAway),
            "paused" => Ok(Self::Paused),
            "waiting" => Ok(Self::Waiting),
            "resumed" => Ok(Self::Resumed),
            "abandoned" => Ok(Self::Abandoned),
            "complete" => Ok(Self::Complete),
            _ => Err(UnknownEventKind(s.to_string())),
        }
    }
}

/// Error type for unknown event kind strings.
#[derive(Debug, Clone)]
pub struct UnknownEventKind(String);

impl fmt::Display for UnknownEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event kind: {}", self.0)
    }
}

impl std::error::Error for UnknownEventKind {}
