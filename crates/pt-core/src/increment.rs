//! Per-increment session inference.
//!
//! Each call feeds one user's newly listened seconds on one item into their
//! session and decides what happened:
//!
//! - **Seed**: no session yet and the item starts one or more of the user's
//!   playlists. A unique match is confirmed at once; several matches stay
//!   unconfirmed until the second track tells them apart.
//! - **Accumulate**: same item as before. On the final track, crossing the
//!   completion threshold finishes the playlist.
//! - **Advance**: the next track in order. Counts as heard if enough of the
//!   previous track was accumulated, or if enough wall-clock time passed since
//!   it started (poll gaps can starve the accumulator).
//! - **Jump**: any other track in the playlist.
//! - **Switch away**: a track outside the playlist ends the session.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::{TrackerConfig, secs_f64};
use crate::deferred::CompletionScheduler;
use crate::dispatch::{EventDispatcher, TrackChange};
use crate::error::TrackerError;
use crate::event::{EventUser, TrackerEvent};
use crate::state::{EndReason, SessionPhase, SessionState, Transition};
use crate::store::{PlaylistCandidate, SessionUpsert, Stores};
use crate::types::{ItemId, SessionId};

/// Events owed for a seed that an advance confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Announce {
    Nothing,
    Start,
}

#[derive(Debug)]
pub struct IncrementProcessor {
    config: TrackerConfig,
    stores: Stores,
    dispatcher: EventDispatcher,
    completions: CompletionScheduler,
}

impl IncrementProcessor {
    pub fn new(config: TrackerConfig, stores: Stores, dispatcher: EventDispatcher) -> Self {
        let completions = CompletionScheduler::new(dispatcher.sink());
        Self {
            config,
            stores,
            dispatcher,
            completions,
        }
    }

    /// Applies `delta_secs` of listening on `item` to the user's session.
    ///
    /// On error the caller keeps its previous state; events already emitted
    /// for this increment are not retracted.
    pub fn process_increment(
        &mut self,
        user: &EventUser,
        item: &ItemId,
        delta_secs: u64,
        current: Option<SessionState>,
        now: DateTime<Utc>,
    ) -> Result<Transition, TrackerError> {
        let Some(state) = current else {
            return self.seed(user, item, delta_secs, now);
        };
        if state.current_item_id == *item {
            return self.accumulate(user, state, delta_secs, now);
        }
        match state.phase {
            SessionPhase::Seeding { .. } => self.resolve_seed(user, state, item, now),
            SessionPhase::Confirmed => self.change_track(user, state, item, delta_secs, now),
        }
    }

    pub fn reap_completions(&mut self) -> usize {
        self.completions.reap()
    }

    pub fn pending_completions(&self) -> usize {
        self.completions.pending()
    }

    pub async fn shutdown(&mut self) {
        self.completions.shutdown().await;
    }

    fn seed(
        &mut self,
        user: &EventUser,
        item: &ItemId,
        delta_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Transition, TrackerError> {
        let mut candidates = self
            .stores
            .playlists
            .candidate_playlists_by_first_track(&user.user_id, item)?;
        if candidates.is_empty() {
            return Ok(Transition::Untracked);
        }

        let credit = self.config.guarded_credit(delta_secs);
        if credit < secs_f64(delta_secs) {
            tracing::debug!(
                user = %user.user_id,
                observed_secs = delta_secs,
                "seed guard applied; starting from 0s"
            );
        }

        let chosen = candidates.remove(0);
        let mut state = SessionState {
            session_id: None,
            playlist_id: chosen.playlist_id,
            external_playlist_id: chosen.external_playlist_id.clone(),
            current_index: 0,
            phase: SessionPhase::Confirmed,
            current_item_id: item.clone(),
            seconds_accum: credit,
            playlist_length: None,
            playlist_total_runtime: self
                .stores
                .playlists
                .playlist_total_runtime(chosen.playlist_id)?,
            track_started_at: now,
            external_user_id: user.external_user_id.clone(),
        };

        if candidates.is_empty() {
            self.confirm(user, &mut state, now)?;
            tracing::info!(
                user = %user.user_id,
                playlist = state.playlist_id.get(),
                credit_secs = credit,
                "seeded and confirmed session"
            );
        } else {
            candidates.insert(0, chosen);
            tracing::info!(
                user = %user.user_id,
                candidates = candidates.len(),
                "seeded ambiguous session; waiting for second track"
            );
            state.phase = SessionPhase::Seeding { candidates };
        }
        Ok(Transition::Tracking(state))
    }

    fn accumulate(
        &mut self,
        user: &EventUser,
        mut state: SessionState,
        delta_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Transition, TrackerError> {
        state.seconds_accum += secs_f64(delta_secs);
        if !state.is_confirmed() {
            return Ok(Transition::Tracking(state));
        }

        self.ensure_length(&mut state)?;
        if state.on_final_track() {
            let runtime = self.runtime_of(&state.current_item_id)?;
            let threshold = self.config.completion_threshold(runtime);
            if state.seconds_accum >= threshold {
                tracing::debug!(
                    user = %user.user_id,
                    accum_secs = state.seconds_accum,
                    threshold_secs = threshold,
                    "final track reached completion threshold"
                );
                self.finalize(user, &state, runtime, now);
                return Ok(Transition::Ended(EndReason::Completed));
            }
        }
        Ok(Transition::Tracking(state))
    }

    fn resolve_seed(
        &mut self,
        user: &EventUser,
        mut state: SessionState,
        item: &ItemId,
        now: DateTime<Utc>,
    ) -> Result<Transition, TrackerError> {
        let SessionPhase::Seeding { candidates } = &state.phase else {
            return Ok(Transition::Tracking(state));
        };
        let Some(matched) = candidates
            .iter()
            .find(|c| c.second_item_id.as_ref() == Some(item))
            .cloned()
        else {
            tracing::info!(
                user = %user.user_id,
                item = %item,
                "second track matched no candidate; discarding seed"
            );
            return Ok(Transition::Ended(EndReason::Discarded));
        };

        self.adopt_candidate(&mut state, &matched)?;
        state.phase = SessionPhase::Confirmed;
        self.sequential_advance(user, state, 1, item, now, Announce::Start)
    }

    fn change_track(
        &mut self,
        user: &EventUser,
        state: SessionState,
        item: &ItemId,
        delta_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Transition, TrackerError> {
        let playlists = &self.stores.playlists;
        let Some(new_index) = playlists.order_index_of(state.playlist_id, item)? else {
            self.dispatcher.switch_away(user, &state, item, now);
            tracing::info!(
                user = %user.user_id,
                playlist = state.playlist_id.get(),
                "switched away from playlist"
            );
            return Ok(Transition::Ended(EndReason::SwitchedAway));
        };

        let next_index = state.current_index + 1;
        let expected_next = playlists.track_at_index(state.playlist_id, next_index)?;
        if expected_next.as_ref() == Some(item) {
            self.sequential_advance(user, state, next_index, item, now, Announce::Nothing)
        } else {
            self.jump(user, state, new_index, item, delta_secs, now)
        }
    }

    /// Moves to the next track in order; the new track starts from zero.
    ///
    /// The session row is written before the previous track is recorded, and
    /// events go out only after both writes succeed.
    fn sequential_advance(
        &mut self,
        user: &EventUser,
        mut state: SessionState,
        next_index: u32,
        item: &ItemId,
        now: DateTime<Utc>,
        announce: Announce,
    ) -> Result<Transition, TrackerError> {
        let runtime = self.runtime_of(&state.current_item_id)?;
        let threshold = self.config.advance_threshold(runtime);
        let wall_secs = state.wall_clock_secs(now);

        let heard = if state.seconds_accum >= threshold {
            true
        } else if wall_secs >= threshold {
            tracing::info!(
                user = %user.user_id,
                accum_secs = state.seconds_accum,
                wall_secs,
                threshold_secs = threshold,
                "wall clock overrides skip; counting track as heard"
            );
            true
        } else {
            false
        };
        let recorded = if heard {
            runtime
        } else {
            state.seconds_accum.max(wall_secs)
        };

        self.ensure_length(&mut state)?;
        let previous = state.clone();
        state.move_to(next_index, item.clone(), 0.0, now);
        let session_id = self.persist(user, &mut state, now)?;
        if recorded > 0.0 {
            self.stores.sessions.record_track_completion(
                session_id,
                &previous.current_item_id,
                previous.current_index,
                recorded,
            )?;
        }

        if announce == Announce::Start {
            let started = SessionState {
                session_id: Some(session_id),
                ..previous.clone()
            };
            self.dispatcher.start(user, &started, now);
        }
        let change = if heard {
            TrackChange::Advance
        } else {
            TrackChange::Jump
        };
        self.dispatcher.track_change(
            change,
            user,
            &state,
            previous.current_index,
            &previous.current_item_id,
            recorded,
            now,
        );
        tracing::info!(
            user = %user.user_id,
            from = previous.current_index,
            to = next_index,
            heard,
            "moved to next track"
        );
        Ok(Transition::Tracking(state))
    }

    fn jump(
        &mut self,
        user: &EventUser,
        mut state: SessionState,
        new_index: u32,
        item: &ItemId,
        delta_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Transition, TrackerError> {
        self.ensure_length(&mut state)?;
        let heard = state.seconds_accum;
        let from_index = state.current_index;
        let from_item = state.current_item_id.clone();
        let credit = self.config.guarded_credit(delta_secs);
        state.move_to(new_index, item.clone(), credit, now);

        let session_id = self.persist(user, &mut state, now)?;
        if heard > 0.0 {
            self.stores.sessions.record_track_completion(
                session_id,
                &from_item,
                from_index,
                heard,
            )?;
        }

        self.dispatcher
            .track_change(TrackChange::Jump, user, &state, from_index, &from_item, heard, now);
        tracing::info!(
            user = %user.user_id,
            from = from_index,
            to = new_index,
            credit_secs = credit,
            "jumped within playlist"
        );
        Ok(Transition::Tracking(state))
    }

    /// Records the final track, marks the session complete and emits
    /// `Complete`, deferred until the track would have ended.
    ///
    /// Store failures are logged; the caller drops the state regardless.
    fn finalize(&mut self, user: &EventUser, state: &SessionState, runtime: f64, now: DateTime<Utc>) {
        if let Some(session_id) = state.session_id {
            if let Err(err) = self.stores.sessions.record_track_completion(
                session_id,
                &state.current_item_id,
                state.current_index,
                runtime,
            ) {
                tracing::error!(session = session_id.get(), error = %err, "failed to record final track");
            }
            if let Err(err) = self.stores.sessions.mark_session_complete(session_id) {
                tracing::error!(session = session_id.get(), error = %err, "failed to mark session complete");
            }
        } else {
            tracing::warn!(user = %user.user_id, "completed session was never persisted");
        }

        let remaining = (runtime - state.seconds_accum).max(0.0);
        let delay_secs = remaining.min(f64::from(self.config.max_event_delay_secs));
        let delay = Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::ZERO);
        let occurred_at = now + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero());

        let event = self.dispatcher.complete_event(user, state, occurred_at);
        tracing::info!(
            user = %user.user_id,
            playlist = state.playlist_id.get(),
            recorded_secs = runtime,
            delay_secs,
            "playlist completed"
        );
        if delay.is_zero() {
            self.dispatcher.emit(TrackerEvent::Complete(event));
        } else {
            self.completions.schedule(event, delay);
        }
    }

    /// Marks the state confirmed, persists it and emits `Start`.
    fn confirm(
        &self,
        user: &EventUser,
        state: &mut SessionState,
        now: DateTime<Utc>,
    ) -> Result<(), TrackerError> {
        state.phase = SessionPhase::Confirmed;
        self.ensure_length(state)?;
        self.persist(user, state, now)?;
        self.dispatcher.start(user, state, now);
        Ok(())
    }

    /// Points an unconfirmed state at the candidate the second track matched.
    fn adopt_candidate(
        &self,
        state: &mut SessionState,
        candidate: &PlaylistCandidate,
    ) -> Result<(), TrackerError> {
        if candidate.playlist_id != state.playlist_id {
            state.playlist_id = candidate.playlist_id;
            state.external_playlist_id.clone_from(&candidate.external_playlist_id);
            state.playlist_length = None;
            state.playlist_total_runtime = self
                .stores
                .playlists
                .playlist_total_runtime(candidate.playlist_id)?;
        }
        Ok(())
    }

    /// Upserts the session row. The first ID returned sticks.
    fn persist(
        &self,
        user: &EventUser,
        state: &mut SessionState,
        now: DateTime<Utc>,
    ) -> Result<SessionId, TrackerError> {
        let id = self.stores.sessions.upsert_session(&SessionUpsert {
            user_id: &user.user_id,
            playlist_id: state.playlist_id,
            external_playlist_id: state.external_playlist_id.as_deref(),
            current_index: state.current_index,
            is_confirmed: state.is_confirmed(),
            seen_at: now,
        })?;
        Ok(*state.session_id.get_or_insert(id))
    }

    fn ensure_length(&self, state: &mut SessionState) -> Result<u32, TrackerError> {
        if let Some(len) = state.playlist_length {
            return Ok(len);
        }
        let len = self.stores.playlists.playlist_length(state.playlist_id)?;
        state.playlist_length = Some(len);
        Ok(len)
    }

    fn runtime_of(&self, item: &ItemId) -> Result<f64, TrackerError> {
        Ok(self
            .stores
            .playlists
            .track_runtime(item)?
            .unwrap_or(self.config.default_runtime_secs))
    }
}
