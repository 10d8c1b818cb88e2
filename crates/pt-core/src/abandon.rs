//! Absence staging for tracked users.
//!
//! Every tick, each tracked user is either streaming or absent. Consecutive
//! absent ticks move a user through `Paused` and `Waiting` (one notification
//! each) and finally to abandonment. Coming back after a notification emits
//! `Resumed`. Events are built from a per-user [`SessionSnapshot`] refreshed
//! each tick, since by the time an event fires the live state may be gone.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::TrackerConfig;
use crate::dispatch::EventDispatcher;
use crate::event::{
    AbandonedEvent, AbsenceEvent, EventPlaylist, EventUser, ResumedEvent, TrackerEvent,
};
use crate::state::SessionState;
use crate::types::{ItemId, UserId};

/// How far a user has progressed through absence notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsenceStage {
    Present,
    Paused,
    Waiting,
}

#[derive(Debug, Clone)]
struct AbsenceRecord {
    ticks_absent: u32,
    first_absent_at: DateTime<Utc>,
    stage: AbsenceStage,
}

/// Frozen copy of what an absence event needs.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub user: EventUser,
    pub playlist: EventPlaylist,
    pub current_index: u32,
    pub current_item_id: ItemId,
    pub current_item_title: Option<String>,
    pub seconds_accum: f64,
    pub is_confirmed: bool,
    pub refreshed_at: DateTime<Utc>,
}

/// What changed for a user on this tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AbsenceTransition {
    Paused { minutes_absent: f64 },
    Waiting { minutes_absent: f64 },
    Resumed { minutes_away: f64 },
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserAbsence {
    pub ticks_absent: u32,
    pub first_absent_at: DateTime<Utc>,
    pub stage: AbsenceStage,
}

/// Absence counters and thresholds, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbsenceDebugInfo {
    pub absences: BTreeMap<UserId, UserAbsence>,
    pub pause_after_ticks: u32,
    pub waiting_after_ticks: u32,
    pub abandon_after_ticks: u32,
    pub tracked_users: Vec<UserId>,
}

#[derive(Debug)]
pub struct AbandonmentTracker {
    config: TrackerConfig,
    dispatcher: EventDispatcher,
    records: HashMap<UserId, AbsenceRecord>,
    snapshots: HashMap<UserId, SessionSnapshot>,
}

impl AbandonmentTracker {
    pub fn new(config: TrackerConfig, dispatcher: EventDispatcher) -> Self {
        Self {
            config,
            dispatcher,
            records: HashMap::new(),
            snapshots: HashMap::new(),
        }
    }

    /// Refreshes snapshots from live state and drops those of untracked users.
    ///
    /// Names and titles are only looked up again when the user moved to a
    /// different playlist position.
    pub fn update_snapshots(&mut self, states: &HashMap<UserId, SessionState>, now: DateTime<Utc>) {
        self.snapshots.retain(|user, _| states.contains_key(user));

        for (user_id, state) in states {
            let same_position = self.snapshots.get(user_id).is_some_and(|snap| {
                snap.playlist.playlist_id == state.playlist_id
                    && snap.current_index == state.current_index
                    && snap.current_item_id == state.current_item_id
            });

            if same_position {
                if let Some(snap) = self.snapshots.get_mut(user_id) {
                    snap.seconds_accum = state.seconds_accum;
                    snap.is_confirmed = state.is_confirmed();
                    snap.playlist.session_id = state.session_id;
                    snap.refreshed_at = now;
                }
                continue;
            }

            let snapshot = SessionSnapshot {
                user: self.dispatcher.event_user(user_id, &state.external_user_id),
                playlist: self.dispatcher.event_playlist(state),
                current_index: state.current_index,
                current_item_id: state.current_item_id.clone(),
                current_item_title: self.dispatcher.title(&state.current_item_id),
                seconds_accum: state.seconds_accum,
                is_confirmed: state.is_confirmed(),
                refreshed_at: now,
            };
            self.snapshots.insert(user_id.clone(), snapshot);
        }
    }

    /// Advances absence counters for every tracked user.
    ///
    /// An `Abandoned` user keeps its record until [`Self::forget`] is called,
    /// so a failed teardown is retried on the next tick.
    pub fn observe<'a>(
        &mut self,
        tracked: impl IntoIterator<Item = &'a UserId>,
        streaming: &HashSet<UserId>,
        now: DateTime<Utc>,
    ) -> Vec<(UserId, AbsenceTransition)> {
        let tracked: HashSet<&UserId> = tracked.into_iter().collect();
        self.records.retain(|user, _| tracked.contains(&user));

        let mut transitions = Vec::new();
        let mut ordered: Vec<&UserId> = tracked.into_iter().collect();
        ordered.sort();

        for user in ordered {
            if streaming.contains(user) {
                if let Some(record) = self.records.remove(user) {
                    if record.stage != AbsenceStage::Present {
                        transitions.push((
                            user.clone(),
                            AbsenceTransition::Resumed {
                                minutes_away: minutes_between(record.first_absent_at, now),
                            },
                        ));
                    }
                }
                continue;
            }

            let record = self.records.entry(user.clone()).or_insert(AbsenceRecord {
                ticks_absent: 0,
                first_absent_at: now,
                stage: AbsenceStage::Present,
            });
            record.ticks_absent += 1;
            let minutes_absent = minutes_between(record.first_absent_at, now);

            if record.ticks_absent >= self.config.abandon_after_ticks {
                transitions.push((user.clone(), AbsenceTransition::Abandoned));
            } else if record.ticks_absent >= self.config.waiting_after_ticks
                && record.stage != AbsenceStage::Waiting
            {
                record.stage = AbsenceStage::Waiting;
                transitions.push((user.clone(), AbsenceTransition::Waiting { minutes_absent }));
            } else if record.ticks_absent >= self.config.pause_after_ticks
                && record.stage == AbsenceStage::Present
            {
                record.stage = AbsenceStage::Paused;
                transitions.push((user.clone(), AbsenceTransition::Paused { minutes_absent }));
            }
        }
        transitions
    }

    /// Emits the event for a `Paused`, `Waiting` or `Resumed` transition.
    ///
    /// Unconfirmed sessions and users without a snapshot stay silent.
    pub fn notify(&self, user: &UserId, transition: AbsenceTransition, now: DateTime<Utc>) {
        let Some(snap) = self.snapshots.get(user).filter(|snap| snap.is_confirmed) else {
            tracing::debug!(user = %user, ?transition, "no confirmed snapshot; not notifying");
            return;
        };
        let event = match transition {
            AbsenceTransition::Paused { minutes_absent } => {
                TrackerEvent::Paused(absence_event(snap, minutes_absent, now))
            }
            AbsenceTransition::Waiting { minutes_absent } => {
                TrackerEvent::Waiting(absence_event(snap, minutes_absent, now))
            }
            AbsenceTransition::Resumed { minutes_away } => TrackerEvent::Resumed(ResumedEvent {
                user: snap.user.clone(),
                playlist: snap.playlist.clone(),
                current_index: snap.current_index,
                current_item_id: snap.current_item_id.clone(),
                current_item_title: snap.current_item_title.clone(),
                minutes_away,
                occurred_at: now,
            }),
            AbsenceTransition::Abandoned => return,
        };
        self.dispatcher.emit(event);
    }

    /// Emits `Abandoned` for a confirmed session being torn down.
    pub fn notify_abandoned(&self, user: &UserId, state: &SessionState, now: DateTime<Utc>) {
        let event = match self.snapshots.get(user) {
            Some(snap) => AbandonedEvent {
                user: snap.user.clone(),
                playlist: snap.playlist.clone(),
                last_index: snap.current_index,
                last_item_id: snap.current_item_id.clone(),
                last_item_title: snap.current_item_title.clone(),
                seconds_on_last: state.seconds_accum,
                occurred_at: now,
            },
            None => AbandonedEvent {
                user: self.dispatcher.event_user(user, &state.external_user_id),
                playlist: self.dispatcher.event_playlist(state),
                last_index: state.current_index,
                last_item_id: state.current_item_id.clone(),
                last_item_title: self.dispatcher.title(&state.current_item_id),
                seconds_on_last: state.seconds_accum,
                occurred_at: now,
            },
        };
        self.dispatcher.emit(TrackerEvent::Abandoned(event));
    }

    /// Drops all absence state for a user.
    pub fn forget(&mut self, user: &UserId) {
        self.records.remove(user);
        self.snapshots.remove(user);
    }

    pub fn snapshot(&self, user: &UserId) -> Option<&SessionSnapshot> {
        self.snapshots.get(user)
    }

    pub fn debug_info(&self) -> AbsenceDebugInfo {
        AbsenceDebugInfo {
            absences: self
                .records
                .iter()
                .map(|(user, record)| {
                    (
                        user.clone(),
                        UserAbsence {
                            ticks_absent: record.ticks_absent,
                            first_absent_at: record.first_absent_at,
                            stage: record.stage,
                        },
                    )
                })
                .collect(),
            pause_after_ticks: self.config.pause_after_ticks,
            waiting_after_ticks: self.config.waiting_after_ticks,
            abandon_after_ticks: self.config.abandon_after_ticks,
            tracked_users: Vec::new(),
        }
    }
}

fn absence_event(snap: &SessionSnapshot, minutes_absent: f64, now: DateTime<Utc>) -> AbsenceEvent {
    AbsenceEvent {
        user: snap.user.clone(),
        playlist: snap.playlist.clone(),
        current_index: snap.current_index,
        current_item_id: snap.current_item_id.clone(),
        current_item_title: snap.current_item_title.clone(),
        minutes_absent,
        occurred_at: now,
    }
}

#[expect(
    clippy::cast_precision_loss,
    reason = "absence spans are minutes to hours"
)]
fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds().max(0) as f64 / 60.0
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeDelta;

    use super::*;
    use crate::event::EventKind;
    use crate::sink::{CollectingSink, EventSink};
    use crate::state::SessionPhase;
    use crate::store::Stores;
    use crate::test_support::{MemoryStore, item, ts, uid};
    use crate::types::{ExternalUserId, SessionId};

    struct Harness {
        sink: Arc<CollectingSink>,
        tracker: AbandonmentTracker,
        states: HashMap<UserId, SessionState>,
        now: DateTime<Utc>,
    }

    impl Harness {
        fn new(confirmed: bool) -> Self {
            let store = Arc::new(MemoryStore::new());
            store.add_user("jf-1", "u1", "Ada");
            let playlist = store.add_playlist("u1", "Morning", &[("a", 200.0), ("b", 200.0)]);
            let sink = Arc::new(CollectingSink::new());
            let dispatcher = EventDispatcher::new(
                Stores::from_shared(&store),
                Arc::clone(&sink) as Arc<dyn EventSink>,
            );
            let now = ts("2025-01-01T10:00:00Z");
            let state = SessionState {
                session_id: Some(SessionId(1)),
                playlist_id: playlist,
                external_playlist_id: None,
                current_index: 0,
                phase: if confirmed {
                    SessionPhase::Confirmed
                } else {
                    SessionPhase::Seeding {
                        candidates: Vec::new(),
                    }
                },
                current_item_id: item("a"),
                seconds_accum: 40.0,
                playlist_length: Some(2),
                playlist_total_runtime: 400.0,
                track_started_at: now,
                external_user_id: ExternalUserId::new("jf-1").unwrap(),
            };
            Self {
                sink,
                tracker: AbandonmentTracker::new(TrackerConfig::default(), dispatcher),
                states: HashMap::from([(uid("u1"), state)]),
                now,
            }
        }

        /// Runs one 15s tick with the given streaming set.
        fn tick(&mut self, streaming: &[&str]) -> Vec<AbsenceTransition> {
            self.now += TimeDelta::seconds(15);
            let streaming: HashSet<UserId> = streaming.iter().map(|u| uid(u)).collect();
            self.tracker.update_snapshots(&self.states, self.now);
            let transitions = self.tracker.observe(self.states.keys(), &streaming, self.now);
            for (user, transition) in &transitions {
                self.tracker.notify(user, *transition, self.now);
            }
            transitions.into_iter().map(|(_, t)| t).collect()
        }

        fn kinds(&self) -> Vec<EventKind> {
            self.sink.drain().iter().map(TrackerEvent::kind).collect()
        }
    }

    #[test]
    fn paused_is_emitted_once() {
        let mut h = Harness::new(true);
        for _ in 0..19 {
            assert!(h.tick(&[]).is_empty());
        }
        assert!(matches!(h.tick(&[]).as_slice(), [AbsenceTransition::Paused { .. }]));
        for _ in 0..10 {
            assert!(h.tick(&[]).is_empty());
        }
        assert_eq!(h.kinds(), vec![EventKind::Paused]);
    }

    #[test]
    fn resumed_after_waiting_reports_minutes_away() {
        let mut h = Harness::new(true);
        for _ in 0..60 {
            h.tick(&[]);
        }
        assert_eq!(h.kinds(), vec![EventKind::Paused, EventKind::Waiting]);

        // First absence was at 10:00:15; resuming at 10:15:15.
        let transitions = h.tick(&["u1"]);
        let [AbsenceTransition::Resumed { minutes_away }] = transitions.as_slice() else {
            panic!("expected resumed, got {transitions:?}");
        };
        assert!((minutes_away - 15.0).abs() < 1e-9);
        assert_eq!(h.kinds(), vec![EventKind::Resumed]);

        // Counters reset: a fresh absence needs the full pause threshold again.
        for _ in 0..19 {
            assert!(h.tick(&[]).is_empty());
        }
        assert_eq!(
            h.tracker.debug_info().absences[&uid("u1")].stage,
            AbsenceStage::Present
        );
    }

    #[test]
    fn returning_before_pause_is_silent() {
        let mut h = Harness::new(true);
        for _ in 0..5 {
            h.tick(&[]);
        }
        assert!(h.tick(&["u1"]).is_empty());
        assert!(h.kinds().is_empty());
        assert!(h.tracker.debug_info().absences.is_empty());
    }

    #[test]
    fn abandonment_is_reported_until_forgotten() {
        let mut h = Harness::new(true);
        for _ in 0..239 {
            h.tick(&[]);
        }
        assert_eq!(h.tick(&[]), vec![AbsenceTransition::Abandoned]);
        assert_eq!(h.tick(&[]), vec![AbsenceTransition::Abandoned]);

        h.tracker.forget(&uid("u1"));
        assert!(h.tracker.snapshot(&uid("u1")).is_none());
    }

    #[test]
    fn unconfirmed_sessions_never_notify() {
        let mut h = Harness::new(false);
        for _ in 0..60 {
            h.tick(&[]);
        }
        h.tick(&["u1"]);
        assert!(h.kinds().is_empty());
    }

    #[test]
    fn snapshots_follow_live_state() {
        let mut h = Harness::new(true);
        h.tick(&["u1"]);
        let snap = h.tracker.snapshot(&uid("u1")).unwrap();
        assert_eq!(snap.current_item_title.as_deref(), Some("Title a"));
        assert_eq!(snap.user.display_name, "Ada");

        if let Some(state) = h.states.get_mut(&uid("u1")) {
            state.current_index = 1;
            state.current_item_id = item("b");
        }
        h.tick(&["u1"]);
        let snap = h.tracker.snapshot(&uid("u1")).unwrap();
        assert_eq!(snap.current_index, 1);
        assert_eq!(snap.current_item_title.as_deref(), Some("Title b"));

        h.states.clear();
        h.tick(&[]);
        assert!(h.tracker.snapshot(&uid("u1")).is_none());
    }

    #[test]
    fn abandoned_event_uses_snapshot_titles() {
        let mut h = Harness::new(true);
        h.tick(&["u1"]);
        let state = h.states[&uid("u1")].clone();
        h.tracker.notify_abandoned(&uid("u1"), &state, h.now);

        let events = h.sink.drain();
        let TrackerEvent::Abandoned(event) = &events[0] else {
            panic!("expected abandoned");
        };
        assert_eq!(event.last_item_title.as_deref(), Some("Title a"));
        assert!((event.seconds_on_last - 40.0).abs() < f64::EPSILON);
    }
}
