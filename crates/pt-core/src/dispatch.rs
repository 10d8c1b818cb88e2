//! Event enrichment and delivery.
//!
//! The dispatcher turns raw state into immutable events: it looks up titles,
//! playlist names and display names, and hands the result to an
//! [`EventSink`]. Lookups that fail degrade to `None` or `"Unknown"` so a
//! flaky store never suppresses an event.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::event::{
    CompleteEvent, EventPlaylist, EventUser, StartEvent, SwitchAwayEvent, TrackChangeEvent,
    TrackerEvent,
};
use crate::sink::EventSink;
use crate::state::SessionState;
use crate::store::Stores;
use crate::types::{ExternalUserId, ItemId, PlaylistId, SessionId, UserId};

/// Placeholder for names that could not be resolved.
pub const UNKNOWN: &str = "Unknown";

/// How a track change within the playlist is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackChange {
    /// The previous track was heard.
    Advance,
    /// The previous track was skipped, or the move was non-sequential.
    Jump,
}

#[derive(Clone)]
pub struct EventDispatcher {
    stores: Stores,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher").finish_non_exhaustive()
    }
}

impl EventDispatcher {
    pub fn new(stores: Stores, sink: Arc<dyn EventSink>) -> Self {
        Self { stores, sink }
    }

    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.sink)
    }

    /// Delivers an already-built event.
    pub fn emit(&self, event: TrackerEvent) {
        tracing::info!(
            kind = %event.kind(),
            user = %event.user().user_id,
            playlist = event.playlist().playlist_id.get(),
            "emitting event"
        );
        self.sink.emit(event);
    }

    /// Resolves the display name of a user.
    pub fn event_user(&self, user_id: &UserId, external: &ExternalUserId) -> EventUser {
        let display_name = match self.stores.identity.resolve(external) {
            Ok(Some(identity)) => identity.display_name,
            Ok(None) => UNKNOWN.to_string(),
            Err(err) => {
                tracing::warn!(user = %external, error = %err, "display name lookup failed");
                UNKNOWN.to_string()
            }
        };
        EventUser {
            user_id: user_id.clone(),
            display_name,
            external_user_id: external.clone(),
        }
    }

    pub fn event_playlist(&self, state: &SessionState) -> EventPlaylist {
        self.playlist_context(state.playlist_id, state.session_id, state.playlist_length)
    }

    /// Builds playlist context, looking the length up if it is not known.
    pub fn playlist_context(
        &self,
        playlist_id: PlaylistId,
        session_id: Option<SessionId>,
        known_length: Option<u32>,
    ) -> EventPlaylist {
        let playlist_name = match self.stores.playlists.playlist_info(playlist_id) {
            Ok(Some(info)) => info.name,
            Ok(None) => UNKNOWN.to_string(),
            Err(err) => {
                tracing::warn!(playlist = playlist_id.get(), error = %err, "playlist info lookup failed");
                UNKNOWN.to_string()
            }
        };
        let total_tracks = known_length.unwrap_or_else(|| {
            self.stores
                .playlists
                .playlist_length(playlist_id)
                .unwrap_or_else(|err| {
                    tracing::warn!(playlist = playlist_id.get(), error = %err, "playlist length lookup failed");
                    0
                })
        });
        EventPlaylist {
            playlist_id,
            playlist_name,
            session_id,
            total_tracks,
        }
    }

    pub fn title(&self, item: &ItemId) -> Option<String> {
        self.stores
            .playlists
            .item_title(item)
            .unwrap_or_else(|err| {
                tracing::warn!(item = %item, error = %err, "title lookup failed");
                None
            })
    }

    pub fn start(&self, user: &EventUser, state: &SessionState, now: DateTime<Utc>) {
        self.emit(TrackerEvent::Start(StartEvent {
            user: user.clone(),
            playlist: self.event_playlist(state),
            current_index: state.current_index,
            current_item_id: state.current_item_id.clone(),
            current_item_title: self.title(&state.current_item_id),
            started_at: now,
        }));
    }

    /// Reports a move from `from_index` to the state's current track.
    #[expect(
        clippy::too_many_arguments,
        reason = "mirrors the fields of the event being built"
    )]
    pub fn track_change(
        &self,
        change: TrackChange,
        user: &EventUser,
        state: &SessionState,
        from_index: u32,
        from_item: &ItemId,
        seconds_on_from: f64,
        now: DateTime<Utc>,
    ) {
        let event = TrackChangeEvent {
            user: user.clone(),
            playlist: self.event_playlist(state),
            from_index,
            to_index: state.current_index,
            from_item_id: from_item.clone(),
            to_item_id: state.current_item_id.clone(),
            from_item_title: self.title(from_item),
            to_item_title: self.title(&state.current_item_id),
            seconds_on_from,
            occurred_at: now,
        };
        self.emit(match change {
            TrackChange::Advance => TrackerEvent::Advance(event),
            TrackChange::Jump => TrackerEvent::Jump(event),
        });
    }

    pub fn switch_away(
        &self,
        user: &EventUser,
        state: &SessionState,
        switched_to: &ItemId,
        now: DateTime<Utc>,
    ) {
        self.emit(TrackerEvent::SwitchAway(SwitchAwayEvent {
            user: user.clone(),
            playlist: self.event_playlist(state),
            from_index: state.current_index,
            from_item_id: state.current_item_id.clone(),
            from_item_title: self.title(&state.current_item_id),
            seconds_on_from: state.seconds_accum,
            switched_to_item_id: switched_to.clone(),
            switched_to_item_title: self.title(switched_to),
            occurred_at: now,
        }));
    }

    /// Builds, without emitting, the completion event for a finished session.
    ///
    /// Listen duration is read back from the store, so call this after the
    /// final track has been recorded.
    pub fn complete_event(
        &self,
        user: &EventUser,
        state: &SessionState,
        occurred_at: DateTime<Utc>,
    ) -> CompleteEvent {
        let listen_duration_secs = state.session_id.map_or(0.0, |id| {
            self.stores
                .sessions
                .session_listen_time(id)
                .unwrap_or_else(|err| {
                    tracing::warn!(session = id.get(), error = %err, "listen time lookup failed");
                    0.0
                })
        });
        CompleteEvent {
            user: user.clone(),
            playlist: self.event_playlist(state),
            external_playlist_id: state.external_playlist_id.clone(),
            completed_tracks: state.current_index + 1,
            listen_duration_secs,
            occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectingSink;
    use crate::state::SessionPhase;
    use crate::test_support::{MemoryStore, item, ts};

    fn setup() -> (Arc<MemoryStore>, Arc<CollectingSink>, EventDispatcher, PlaylistId) {
        let store = Arc::new(MemoryStore::new());
        store.add_user("jf-1", "u1", "Ada");
        let playlist = store.add_playlist("u1", "Morning", &[("a", 200.0), ("b", 200.0)]);
        let sink = Arc::new(CollectingSink::new());
        let dispatcher =
            EventDispatcher::new(Stores::from_shared(&store), Arc::clone(&sink) as Arc<dyn EventSink>);
        (store, sink, dispatcher, playlist)
    }

    fn state(playlist: PlaylistId, index: u32, current: &str) -> SessionState {
        SessionState {
            session_id: Some(SessionId(7)),
            playlist_id: playlist,
            external_playlist_id: None,
            current_index: index,
            phase: SessionPhase::Confirmed,
            current_item_id: item(current),
            seconds_accum: 12.0,
            playlist_length: None,
            playlist_total_runtime: 400.0,
            track_started_at: ts("2025-01-01T10:00:00Z"),
            external_user_id: ExternalUserId::new("jf-1").unwrap(),
        }
    }

    #[test]
    fn enriches_titles_and_names() {
        let (_store, sink, dispatcher, playlist) = setup();
        let user = dispatcher.event_user(&UserId::new("u1").unwrap(), &ExternalUserId::new("jf-1").unwrap());
        assert_eq!(user.display_name, "Ada");

        let s = state(playlist, 1, "b");
        dispatcher.track_change(TrackChange::Advance, &user, &s, 0, &item("a"), 200.0, ts("2025-01-01T10:05:00Z"));

        let events = sink.drain();
        assert_eq!(events.len(), 1);
        let TrackerEvent::Advance(event) = &events[0] else {
            panic!("expected advance, got {:?}", events[0]);
        };
        assert_eq!(event.playlist.playlist_name, "Morning");
        assert_eq!(event.playlist.total_tracks, 2);
        assert_eq!(event.playlist.session_id, Some(SessionId(7)));
        assert_eq!(event.from_item_title.as_deref(), Some("Title a"));
        assert_eq!(event.to_item_title.as_deref(), Some("Title b"));
    }

    #[test]
    fn failed_lookups_degrade_to_unknown() {
        let (store, sink, dispatcher, playlist) = setup();
        store.set_fail_reads(true);

        let user = dispatcher.event_user(&UserId::new("u1").unwrap(), &ExternalUserId::new("jf-1").unwrap());
        assert_eq!(user.display_name, UNKNOWN);

        dispatcher.switch_away(&user, &state(playlist, 0, "a"), &item("zzz"), ts("2025-01-01T10:05:00Z"));
        let events = sink.drain();
        let TrackerEvent::SwitchAway(event) = &events[0] else {
            panic!("expected switch away");
        };
        assert_eq!(event.playlist.playlist_name, UNKNOWN);
        assert_eq!(event.playlist.total_tracks, 0);
        assert_eq!(event.from_item_title, None);
        assert!((event.seconds_on_from - 12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_user_gets_placeholder_name() {
        let (_store, _sink, dispatcher, _playlist) = setup();
        let user = dispatcher.event_user(&UserId::new("u9").unwrap(), &ExternalUserId::new("jf-9").unwrap());
        assert_eq!(user.display_name, UNKNOWN);
    }
}
