//! Tick aggregation.
//!
//! Converts absolute playback positions sampled every poll into listened
//! time, bucketed per (user, item, hour).
//!
//! # Algorithm Summary
//!
//! 1. On a track change, credit the unobserved tail of the previous track
//!    (capped) so poll blind spots at track boundaries are not lost
//! 2. First observation of a (user, item): credit the position only if it is
//!    inside the initial credit window (mid-track joins are not credited)
//! 3. Later observations: a large backward jump is a restart from 0; the
//!    forward delta is credited only if it fits in one tick's worth of time
//! 4. `consume_recent_deltas` surfaces whole new seconds per currently
//!    playing item, tracked by a per-bucket watermark

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TrackerConfig;
use crate::store::HourlyListening;
use crate::types::{ExternalUserId, ItemId, TICKS_PER_SECOND, secs_to_ticks, ticks_to_secs};

/// One active stream as reported by the media server on a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSnapshot {
    pub external_user_id: ExternalUserId,
    pub item_id: ItemId,
    pub position_ticks: i64,
    #[serde(default)]
    pub is_paused: bool,
}

/// New whole seconds listened since the previous consumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentDelta {
    pub external_user_id: ExternalUserId,
    pub item_id: ItemId,
    pub seconds: u64,
}

/// A buffered bucket, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferEntry {
    pub external_user_id: ExternalUserId,
    pub item_id: ItemId,
    pub hour_start: DateTime<Utc>,
    pub ticks: i64,
}

#[derive(Debug, Clone, Copy)]
struct LastTick {
    ticks: i64,
    observed_at: DateTime<Utc>,
}

type UserItem = (ExternalUserId, ItemId);
type BucketKey = (ExternalUserId, ItemId, DateTime<Utc>);

/// Accumulates listened ticks between flushes.
#[derive(Debug)]
pub struct TickBuffer {
    config: TrackerConfig,
    last_known: HashMap<UserItem, LastTick>,
    buffered: HashMap<BucketKey, i64>,
    consumed: HashMap<BucketKey, i64>,
    current_track: HashMap<ExternalUserId, ItemId>,
}

impl TickBuffer {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            last_known: HashMap::new(),
            buffered: HashMap::new(),
            consumed: HashMap::new(),
            current_track: HashMap::new(),
        }
    }

    /// Records one poll observation.
    ///
    /// `runtime_secs` is consulted only when the user's now-playing item
    /// changed, to gap-fill the previous track.
    pub fn update<F>(&mut self, snapshot: &StreamSnapshot, now: DateTime<Utc>, runtime_secs: F)
    where
        F: FnOnce(&ItemId) -> f64,
    {
        let user = &snapshot.external_user_id;
        let item = &snapshot.item_id;

        let previous = self.current_track.insert(user.clone(), item.clone());
        if let Some(previous) = previous.filter(|prev| prev != item) {
            let runtime = runtime_secs(&previous);
            self.fill_gap_on_change(user, &previous, runtime, now);
        }

        let ticks = snapshot.position_ticks.max(0);
        let key = (user.clone(), item.clone());
        let bucket = (user.clone(), item.clone(), hour_bucket(now));

        match self.last_known.get(&key).copied() {
            None => self.handle_initial(key, bucket, ticks, now),
            Some(last) => self.handle_subsequent(key, bucket, ticks, last, now),
        }
    }

    fn handle_initial(&mut self, key: UserItem, bucket: BucketKey, ticks: i64, now: DateTime<Utc>) {
        if ticks <= self.config.initial_credit_ticks() {
            *self.buffered.entry(bucket).or_insert(0) += ticks;
            tracing::debug!(
                user = %key.0,
                item = %key.1,
                secs = ticks_to_secs(ticks),
                "credited initial playtime"
            );
        } else {
            tracing::debug!(
                user = %key.0,
                item = %key.1,
                secs = ticks_to_secs(ticks),
                "first seen mid-track; not crediting position"
            );
        }
        self.last_known.insert(
            key,
            LastTick {
                ticks,
                observed_at: now,
            },
        );
    }

    fn handle_subsequent(
        &mut self,
        key: UserItem,
        bucket: BucketKey,
        ticks: i64,
        last: LastTick,
        now: DateTime<Utc>,
    ) {
        let baseline = if ticks < last.ticks - self.config.max_jump_back_ticks() {
            tracing::debug!(user = %key.0, item = %key.1, "detected restart");
            0
        } else {
            last.ticks
        };
        let delta = ticks - baseline;

        // Re-anchor even when the delta is discarded, so a seek does not
        // poison every later delta.
        self.last_known.insert(
            key,
            LastTick {
                ticks,
                observed_at: now,
            },
        );

        if delta <= 0 {
            return;
        }
        if delta > self.config.max_delta_ticks() {
            tracing::debug!(
                user = %bucket.0,
                item = %bucket.1,
                secs = ticks_to_secs(delta),
                "discarded oversized delta"
            );
            return;
        }
        *self.buffered.entry(bucket).or_insert(0) += delta;
    }

    fn fill_gap_on_change(
        &mut self,
        user: &ExternalUserId,
        previous: &ItemId,
        runtime_secs: f64,
        now: DateTime<Utc>,
    ) {
        let Some(last) = self.last_known.get(&(user.clone(), previous.clone())) else {
            return;
        };
        let gap = (secs_to_ticks(runtime_secs) - last.ticks)
            .max(0)
            .min(self.config.gap_fill_max_ticks());
        if gap > 0 {
            let bucket = (user.clone(), previous.clone(), hour_bucket(now));
            *self.buffered.entry(bucket).or_insert(0) += gap;
            tracing::debug!(
                user = %user,
                item = %previous,
                gap_secs = ticks_to_secs(gap),
                "filled gap at track change"
            );
        }
    }

    /// Returns new whole seconds per (user, currently playing item).
    ///
    /// Items a user is no longer playing are never surfaced. Sub-second
    /// remainders stay unconsumed and carry into the next call.
    pub fn consume_recent_deltas(&mut self) -> Vec<RecentDelta> {
        let mut totals: BTreeMap<UserItem, u64> = BTreeMap::new();

        for (key, &total) in &self.buffered {
            let (user, item, _) = key;
            if self.current_track.get(user) != Some(item) {
                continue;
            }
            let consumed = self.consumed.entry(key.clone()).or_insert(0);
            let new_secs = (total - *consumed) / TICKS_PER_SECOND;
            if new_secs <= 0 {
                continue;
            }
            *consumed += new_secs * TICKS_PER_SECOND;
            *totals.entry((user.clone(), item.clone())).or_insert(0) +=
                u64::try_from(new_secs).unwrap_or(0);
        }

        totals
            .into_iter()
            .map(|((external_user_id, item_id), seconds)| RecentDelta {
                external_user_id,
                item_id,
                seconds,
            })
            .collect()
    }

    /// Total buffered ticks for a (user, item) across hour buckets.
    pub fn buffered_ticks(&self, user: &ExternalUserId, item: &ItemId) -> i64 {
        self.buffered
            .iter()
            .filter(|((u, i, _), _)| u == user && i == item)
            .map(|(_, ticks)| *ticks)
            .sum()
    }

    /// Takes every buffered bucket for persistence and resets the watermarks.
    ///
    /// Last-known positions and now-playing items survive, so deltas and
    /// gap-filling continue seamlessly after a flush.
    pub fn drain_for_flush(&mut self) -> Vec<HourlyListening> {
        let rows = self.pending_rows();
        self.clear_flushed();
        rows
    }

    /// Buffered buckets as rows, without taking them.
    pub fn pending_rows(&self) -> Vec<HourlyListening> {
        let mut rows: Vec<HourlyListening> = self
            .buffered
            .iter()
            .filter(|(_, ticks)| **ticks > 0)
            .map(|((external_user_id, item_id, hour_start), ticks)| HourlyListening {
                external_user_id: external_user_id.clone(),
                item_id: item_id.clone(),
                hour_start: *hour_start,
                ticks: *ticks,
            })
            .collect();
        rows.sort_by(|a, b| {
            (&a.external_user_id, &a.item_id, a.hour_start).cmp(&(
                &b.external_user_id,
                &b.item_id,
                b.hour_start,
            ))
        });
        rows
    }

    /// Forgets buffered buckets once they have been persisted.
    pub fn clear_flushed(&mut self) {
        self.buffered.clear();
        self.consumed.clear();
    }

    /// Whether there is anything to flush.
    pub fn has_pending(&self) -> bool {
        self.buffered.values().any(|ticks| *ticks > 0)
    }

    /// Drops positions not observed within the configured maximum age.
    pub fn prune_stale(&mut self, now: DateTime<Utc>) -> usize {
        let max_age = self.config.max_tick_age();
        let before = self.last_known.len();
        self.last_known
            .retain(|_, last| now - last.observed_at < max_age);
        let pruned = before - self.last_known.len();

        let last_known = &self.last_known;
        self.current_track
            .retain(|user, item| last_known.contains_key(&(user.clone(), item.clone())));

        if pruned > 0 {
            tracing::debug!(pruned, "pruned stale last-known ticks");
        }
        pruned
    }

    pub fn debug_dump(&self) -> Vec<BufferEntry> {
        let mut entries: Vec<BufferEntry> = self
            .buffered
            .iter()
            .map(|((external_user_id, item_id, hour_start), ticks)| BufferEntry {
                external_user_id: external_user_id.clone(),
                item_id: item_id.clone(),
                hour_start: *hour_start,
                ticks: *ticks,
            })
            .collect();
        entries.sort_by(|a, b| {
            (&a.external_user_id, &a.item_id, a.hour_start).cmp(&(
                &b.external_user_id,
                &b.item_id,
                b.hour_start,
            ))
        });
        entries
    }
}

fn hour_bucket(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(TimeDelta::hours(1)).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: i64 = TICKS_PER_SECOND;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn snap(user: &str, item: &str, secs: i64) -> StreamSnapshot {
        StreamSnapshot {
            external_user_id: ExternalUserId::new(user).unwrap(),
            item_id: ItemId::new(item).unwrap(),
            position_ticks: secs * SEC,
            is_paused: false,
        }
    }

    fn buffer_with_guard(initial_credit_secs: u32) -> TickBuffer {
        TickBuffer::new(TrackerConfig {
            initial_credit_secs,
            ..TrackerConfig::default()
        })
    }

    fn no_runtime(_: &ItemId) -> f64 {
        300.0
    }

    fn total_for(deltas: &[RecentDelta], item: &str) -> u64 {
        deltas
            .iter()
            .filter(|d| d.item_id.as_str() == item)
            .map(|d| d.seconds)
            .sum()
    }

    #[test]
    fn initial_observation_inside_guard_is_credited() {
        let mut buffer = buffer_with_guard(30);
        let now = ts("2025-01-01T10:00:00Z");
        buffer.update(&snap("u1", "a", 5), now, no_runtime);

        let deltas = buffer.consume_recent_deltas();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].seconds, 5);
    }

    #[test]
    fn initial_observation_mid_track_is_not_credited() {
        let mut buffer = buffer_with_guard(30);
        let now = ts("2025-01-01T10:00:00Z");
        buffer.update(&snap("u1", "a", 60), now, no_runtime);

        assert!(buffer.consume_recent_deltas().is_empty());
        assert_eq!(
            buffer.buffered_ticks(&ExternalUserId::new("u1").unwrap(), &ItemId::new("a").unwrap()),
            0
        );
    }

    #[test]
    fn backward_jump_beyond_threshold_is_a_restart() {
        let mut buffer = buffer_with_guard(15);
        buffer.update(&snap("u1", "a", 100), ts("2025-01-01T10:00:00Z"), no_runtime);
        buffer.update(&snap("u1", "a", 50), ts("2025-01-01T10:00:15Z"), no_runtime);

        let deltas = buffer.consume_recent_deltas();
        assert_eq!(total_for(&deltas, "a"), 50);
    }

    #[test]
    fn small_backward_seek_is_not_negative_credit() {
        let mut buffer = buffer_with_guard(15);
        buffer.update(&snap("u1", "a", 10), ts("2025-01-01T10:00:00Z"), no_runtime);
        buffer.update(&snap("u1", "a", 8), ts("2025-01-01T10:00:15Z"), no_runtime);

        assert_eq!(total_for(&buffer.consume_recent_deltas(), "a"), 10);
    }

    #[test]
    fn oversized_delta_is_discarded_and_reanchored() {
        let mut buffer = buffer_with_guard(15);
        buffer.update(&snap("u1", "a", 10), ts("2025-01-01T10:00:00Z"), no_runtime);
        buffer.update(&snap("u1", "a", 200), ts("2025-01-01T10:00:15Z"), no_runtime);
        buffer.update(&snap("u1", "a", 215), ts("2025-01-01T10:00:30Z"), no_runtime);

        assert_eq!(total_for(&buffer.consume_recent_deltas(), "a"), 25);
    }

    #[test]
    fn consuming_twice_without_new_ticks_returns_nothing() {
        let mut buffer = buffer_with_guard(15);
        buffer.update(&snap("u1", "a", 0), ts("2025-01-01T10:00:00Z"), no_runtime);
        buffer.update(&snap("u1", "a", 15), ts("2025-01-01T10:00:15Z"), no_runtime);

        assert_eq!(total_for(&buffer.consume_recent_deltas(), "a"), 15);
        assert!(buffer.consume_recent_deltas().is_empty());
    }

    #[test]
    fn sub_second_remainders_carry_over_without_overcounting() {
        let mut buffer = buffer_with_guard(15);
        let user = "u1";
        let mut positions = vec![snap(user, "a", 0)];
        let mut half = snap(user, "a", 0);
        half.position_ticks = 15 * SEC + SEC / 2;
        positions.push(half);
        positions.push(snap(user, "a", 31));

        let mut returned = 0;
        for (i, s) in positions.iter().enumerate() {
            let now = ts("2025-01-01T10:00:00Z") + TimeDelta::seconds(15 * i64::try_from(i).unwrap());
            buffer.update(s, now, no_runtime);
            returned += total_for(&buffer.consume_recent_deltas(), "a");
        }
        assert_eq!(returned, 31);
    }

    #[test]
    fn stale_items_are_not_resurfaced() {
        let mut buffer = buffer_with_guard(15);
        buffer.update(&snap("u1", "a", 10), ts("2025-01-01T10:00:00Z"), no_runtime);
        buffer.update(&snap("u1", "b", 5), ts("2025-01-01T10:00:15Z"), |_| 10.0);

        let deltas = buffer.consume_recent_deltas();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].item_id.as_str(), "b");
        assert_eq!(deltas[0].seconds, 5);
    }

    #[test]
    fn track_change_fills_gap_on_previous_track() {
        let mut buffer = buffer_with_guard(15);
        let user = ExternalUserId::new("u1").unwrap();
        let a = ItemId::new("a").unwrap();
        buffer.update(&snap("u1", "a", 0), ts("2025-01-01T10:00:00Z"), no_runtime);
        buffer.update(&snap("u1", "a", 20), ts("2025-01-01T10:00:15Z"), no_runtime);
        buffer.update(&snap("u1", "b", 0), ts("2025-01-01T10:00:30Z"), |_| 40.0);

        assert_eq!(buffer.buffered_ticks(&user, &a), 40 * SEC);
    }

    #[test]
    fn gap_fill_is_capped() {
        let mut buffer = buffer_with_guard(15);
        let user = ExternalUserId::new("u1").unwrap();
        let a = ItemId::new("a").unwrap();
        buffer.update(&snap("u1", "a", 0), ts("2025-01-01T10:00:00Z"), no_runtime);
        buffer.update(&snap("u1", "a", 20), ts("2025-01-01T10:00:15Z"), no_runtime);
        buffer.update(&snap("u1", "b", 0), ts("2025-01-01T10:00:30Z"), |_| 300.0);

        assert_eq!(buffer.buffered_ticks(&user, &a), 50 * SEC);
    }

    #[test]
    fn ticks_are_bucketed_by_hour() {
        let mut buffer = buffer_with_guard(15);
        buffer.update(&snap("u1", "a", 0), ts("2025-01-01T10:59:50Z"), no_runtime);
        buffer.update(&snap("u1", "a", 10), ts("2025-01-01T10:59:59Z"), no_runtime);
        buffer.update(&snap("u1", "a", 25), ts("2025-01-01T11:00:14Z"), no_runtime);

        let dump = buffer.debug_dump();
        assert_eq!(dump.len(), 2);
        assert_eq!(dump[0].hour_start, ts("2025-01-01T10:00:00Z"));
        assert_eq!(dump[0].ticks, 10 * SEC);
        assert_eq!(dump[1].hour_start, ts("2025-01-01T11:00:00Z"));
        assert_eq!(dump[1].ticks, 15 * SEC);

        // Both buckets surface as one delta for the current item.
        let deltas = buffer.consume_recent_deltas();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].seconds, 25);
    }

    #[test]
    fn drain_for_flush_resets_watermarks() {
        let mut buffer = buffer_with_guard(15);
        buffer.update(&snap("u1", "a", 10), ts("2025-01-01T10:00:00Z"), no_runtime);
        buffer.consume_recent_deltas();

        let rows = buffer.drain_for_flush();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ticks, 10 * SEC);
        assert!(!buffer.has_pending());

        buffer.update(&snap("u1", "a", 25), ts("2025-01-01T10:00:15Z"), no_runtime);
        assert_eq!(total_for(&buffer.consume_recent_deltas(), "a"), 15);
    }

    #[test]
    fn prune_drops_old_positions() {
        let mut buffer = buffer_with_guard(15);
        buffer.update(&snap("u1", "a", 10), ts("2025-01-01T00:00:00Z"), no_runtime);
        buffer.update(&snap("u2", "b", 10), ts("2025-01-01T11:00:00Z"), no_runtime);

        assert_eq!(buffer.prune_stale(ts("2025-01-01T13:00:00Z")), 1);

        // u1's next observation is treated as a first sighting again.
        buffer.drain_for_flush();
        buffer.update(&snap("u1", "a", 100), ts("2025-01-01T13:00:15Z"), no_runtime);
        assert!(buffer.consume_recent_deltas().is_empty());
    }
}
