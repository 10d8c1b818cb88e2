//! Orchestrates per-user session state across ticks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use crate::abandon::{AbandonmentTracker, AbsenceDebugInfo, AbsenceTransition};
use crate::buffer::{RecentDelta, StreamSnapshot};
use crate::config::TrackerConfig;
use crate::dispatch::EventDispatcher;
use crate::error::TrackerError;
use crate::event::EventUser;
use crate::increment::IncrementProcessor;
use crate::sink::EventSink;
use crate::state::{EndReason, SessionPhase, SessionState, SessionSummary, Transition};
use crate::store::Stores;
use crate::types::{ItemId, TICKS_PER_SECOND, UserId, ticks_to_secs};

/// Owns every tracked user's [`SessionState`].
///
/// All mutation happens through `&mut self` from a single tick loop; nothing
/// here is shared across tasks except the deferred completion set.
#[derive(Debug)]
pub struct SessionTracker {
    config: TrackerConfig,
    stores: Stores,
    states: HashMap<UserId, SessionState>,
    /// Item each user just completed a playlist on. It cannot seed a new
    /// session until the user plays something else or stops streaming.
    finished_on: HashMap<UserId, ItemId>,
    processor: IncrementProcessor,
    abandonment: AbandonmentTracker,
}

impl SessionTracker {
    pub fn new(config: TrackerConfig, stores: Stores, sink: Arc<dyn EventSink>) -> Self {
        let dispatcher = EventDispatcher::new(stores.clone(), sink);
        Self {
            processor: IncrementProcessor::new(config.clone(), stores.clone(), dispatcher.clone()),
            abandonment: AbandonmentTracker::new(config.clone(), dispatcher),
            config,
            stores,
            states: HashMap::new(),
            finished_on: HashMap::new(),
        }
    }

    /// Feeds consumed buffer deltas into each user's session.
    ///
    /// A failure for one user is logged and leaves that user's state as it
    /// was; other users are still processed.
    pub fn process_buffer_deltas(&mut self, deltas: &[RecentDelta], now: DateTime<Utc>) {
        self.processor.reap_completions();
        for delta in deltas {
            if let Err(err) = self.process_delta(delta, now) {
                tracing::warn!(
                    user = %delta.external_user_id,
                    item = %delta.item_id,
                    error = %err,
                    "skipping user for this tick"
                );
            }
        }
    }

    fn process_delta(&mut self, delta: &RecentDelta, now: DateTime<Utc>) -> Result<(), TrackerError> {
        let Some(identity) = self.stores.identity.resolve(&delta.external_user_id)? else {
            tracing::debug!(user = %delta.external_user_id, "ignoring unlinked user");
            return Ok(());
        };
        let user = EventUser {
            user_id: identity.user_id,
            display_name: identity.display_name,
            external_user_id: delta.external_user_id.clone(),
        };

        let current = self.states.get(&user.user_id).cloned();
        if current.is_none() {
            if self.finished_on.get(&user.user_id) == Some(&delta.item_id) {
                tracing::debug!(user = %user.user_id, item = %delta.item_id, "still on completed track");
                return Ok(());
            }
            self.finished_on.remove(&user.user_id);
        }
        let transition = self.processor.process_increment(
            &user,
            &delta.item_id,
            delta.seconds,
            current,
            now,
        )?;
        match transition {
            Transition::Tracking(state) => {
                self.states.insert(user.user_id, state);
            }
            Transition::Ended(reason) => {
                tracing::debug!(user = %user.user_id, ?reason, "session ended");
                self.states.remove(&user.user_id);
                if reason == EndReason::Completed {
                    self.finished_on.insert(user.user_id, delta.item_id.clone());
                }
            }
            Transition::Untracked => {}
        }
        Ok(())
    }

    /// Refreshes the absence snapshots from post-increment state.
    pub fn update_snapshots(&mut self, now: DateTime<Utc>) {
        self.abandonment.update_snapshots(&self.states, now);
    }

    /// Advances absence staging and tears down abandoned sessions.
    pub fn check_for_abandoned_sessions(&mut self, streaming: &HashSet<UserId>, now: DateTime<Utc>) {
        self.finished_on.retain(|user, _| streaming.contains(user));
        let transitions = self.abandonment.observe(self.states.keys(), streaming, now);
        for (user, transition) in transitions {
            if transition != AbsenceTransition::Abandoned {
                self.abandonment.notify(&user, transition, now);
                continue;
            }
            if let Err(err) = self.abandon(&user, now) {
                tracing::warn!(user = %user, error = %err, "abandonment failed; retrying next tick");
            }
        }
    }

    fn abandon(&mut self, user: &UserId, now: DateTime<Utc>) -> Result<(), TrackerError> {
        let Some(state) = self.states.get(user) else {
            self.abandonment.forget(user);
            return Ok(());
        };

        if state.is_confirmed() {
            if let Some(session_id) = state.session_id.filter(|_| state.seconds_accum > 0.0) {
                let runtime = self
                    .stores
                    .playlists
                    .track_runtime(&state.current_item_id)?
                    .unwrap_or(self.config.default_runtime_secs);
                let recorded = if state.seconds_accum >= self.config.completion_threshold(runtime) {
                    runtime
                } else {
                    state.seconds_accum
                };
                self.stores.sessions.record_track_completion(
                    session_id,
                    &state.current_item_id,
                    state.current_index,
                    recorded,
                )?;
            }
            self.abandonment.notify_abandoned(user, state, now);
            tracing::info!(
                user = %user,
                playlist = state.playlist_id.get(),
                index = state.current_index,
                "session abandoned"
            );
        } else {
            tracing::info!(user = %user, "unconfirmed session abandoned; dropping silently");
        }

        self.states.remove(user);
        self.abandonment.forget(user);
        Ok(())
    }

    /// Maps streaming snapshots to the internal users they belong to.
    ///
    /// Unlinked or unresolvable users are left out.
    pub fn streaming_users(&self, snapshots: &[StreamSnapshot]) -> HashSet<UserId> {
        snapshots
            .iter()
            .filter_map(|snap| match self.stores.identity.resolve(&snap.external_user_id) {
                Ok(identity) => identity.map(|identity| identity.user_id),
                Err(err) => {
                    tracing::warn!(user = %snap.external_user_id, error = %err, "identity lookup failed");
                    None
                }
            })
            .collect()
    }

    /// Resumes tracking of a persisted, incomplete session whose current
    /// track is what the user is playing now. Emits nothing.
    ///
    /// Returns whether a session was reattached.
    pub fn reattach(&mut self, snapshot: &StreamSnapshot, now: DateTime<Utc>) -> Result<bool, TrackerError> {
        let Some(identity) = self.stores.identity.resolve(&snapshot.external_user_id)? else {
            return Ok(false);
        };
        if self.states.contains_key(&identity.user_id) {
            return Ok(false);
        }

        let since = now - TimeDelta::hours(i64::from(self.config.reattach_lookback_hours));
        let Some(row) = self
            .stores
            .sessions
            .find_recent_incomplete_session(&identity.user_id, since)?
        else {
            return Ok(false);
        };

        let playlists = &self.stores.playlists;
        match playlists.track_at_index(row.playlist_id, row.current_index)? {
            Some(track) if track == snapshot.item_id => {}
            Some(_) => return Ok(false),
            None => {
                return Err(TrackerError::MissingTrack {
                    playlist_id: row.playlist_id.get(),
                    index: row.current_index,
                });
            }
        }

        let position_ticks = snapshot.position_ticks.max(0);
        // The buffer credits early positions itself on first sight.
        let seconds_accum = if position_ticks <= self.config.initial_credit_ticks() {
            0.0
        } else {
            ticks_to_secs(position_ticks)
        };
        let state = SessionState {
            session_id: Some(row.session_id),
            playlist_id: row.playlist_id,
            external_playlist_id: row.external_playlist_id,
            current_index: row.current_index,
            phase: SessionPhase::Confirmed,
            current_item_id: snapshot.item_id.clone(),
            seconds_accum,
            playlist_length: Some(playlists.playlist_length(row.playlist_id)?),
            playlist_total_runtime: playlists.playlist_total_runtime(row.playlist_id)?,
            track_started_at: now - TimeDelta::milliseconds(position_ticks / (TICKS_PER_SECOND / 1000)),
            external_user_id: snapshot.external_user_id.clone(),
        };

        tracing::info!(
            user = %identity.user_id,
            session = row.session_id.get(),
            playlist = row.playlist_id.get(),
            index = row.current_index,
            "reattached session"
        );
        self.states.insert(identity.user_id, state);
        Ok(true)
    }

    pub fn state(&self, user: &UserId) -> Option<&SessionState> {
        self.states.get(user)
    }

    pub fn session_count(&self) -> usize {
        self.states.len()
    }

    pub fn active_sessions(&self) -> BTreeMap<UserId, SessionSummary> {
        self.states
            .iter()
            .map(|(user, state)| (user.clone(), state.summary()))
            .collect()
    }

    pub fn abandonment_debug_info(&self) -> AbsenceDebugInfo {
        let mut info = self.abandonment.debug_info();
        info.tracked_users = self.states.keys().cloned().collect();
        info.tracked_users.sort();
        info
    }

    pub fn pending_completions(&self) -> usize {
        self.processor.pending_completions()
    }

    /// Cancels deferred completions. Never fails.
    pub async fn shutdown(&mut self) {
        self.processor.shutdown().await;
        tracing::info!(tracked = self.states.len(), "session tracker shut down");
    }
}
