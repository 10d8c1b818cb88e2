//! Tunable thresholds for tick aggregation and session inference.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::types::TICKS_PER_SECOND;

/// Configuration for the tracker.
///
/// Every field has a default matching a ~15 second polling cadence, so a
/// partially specified config file only overrides what it names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// A position this far behind the last known one is a restart, not a seek.
    /// Default: 5 seconds.
    pub max_jump_back_secs: u32,

    /// Largest per-tick forward delta that is credited as listening.
    /// Default: 60 seconds.
    pub max_delta_per_tick_secs: u32,

    /// First observation of an item is credited only up to this position.
    /// Default: 15 seconds.
    pub initial_credit_secs: u32,

    /// Maximum gap credited to the previous track on a track change.
    /// Default: 30 seconds.
    pub gap_fill_max_secs: u32,

    /// Last-known positions older than this are pruned.
    /// Default: 12 hours.
    pub max_tick_age_hours: u32,

    /// Runtime assumed for items without runtime metadata.
    /// Default: 300 seconds.
    pub default_runtime_secs: f64,

    /// Seeded or jumped-to tracks are credited only up to this many seconds.
    /// Default: 30 seconds.
    pub seed_guard_secs: u32,

    /// Floor of the advance threshold, for very short tracks.
    /// Default: 10 seconds.
    pub advance_min_secs: f64,

    /// Fraction of a track that must be heard for an advance to count as a
    /// completion rather than a skip. Default: 0.67.
    pub advance_fraction: f64,

    /// Fraction of the final track that completes the playlist. Also used to
    /// decide full-runtime credit on abandonment. Default: 0.90.
    pub completion_fraction: f64,

    /// Upper bound on how long a completion event is held back.
    /// Default: 300 seconds.
    pub max_event_delay_secs: u32,

    /// Consecutive absent ticks before `Paused`. Default: 20 (~5 min).
    pub pause_after_ticks: u32,

    /// Consecutive absent ticks before `Waiting`. Default: 60 (~15 min).
    pub waiting_after_ticks: u32,

    /// Consecutive absent ticks before abandonment. Default: 240 (~60 min).
    pub abandon_after_ticks: u32,

    /// How far back the reattach pass looks for an incomplete session.
    /// Default: 6 hours.
    pub reattach_lookback_hours: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_jump_back_secs: 5,
            max_delta_per_tick_secs: 60,
            initial_credit_secs: 15,
            gap_fill_max_secs: 30,
            max_tick_age_hours: 12,
            default_runtime_secs: 300.0,
            seed_guard_secs: 30,
            advance_min_secs: 10.0,
            advance_fraction: 0.67,
            completion_fraction: 0.90,
            max_event_delay_secs: 300,
            pause_after_ticks: 20,
            waiting_after_ticks: 60,
            abandon_after_ticks: 240,
            reattach_lookback_hours: 6,
        }
    }
}

impl TrackerConfig {
    pub(crate) fn max_jump_back_ticks(&self) -> i64 {
        i64::from(self.max_jump_back_secs) * TICKS_PER_SECOND
    }

    pub(crate) fn max_delta_ticks(&self) -> i64 {
        i64::from(self.max_delta_per_tick_secs) * TICKS_PER_SECOND
    }

    pub(crate) fn initial_credit_ticks(&self) -> i64 {
        i64::from(self.initial_credit_secs) * TICKS_PER_SECOND
    }

    pub(crate) fn gap_fill_max_ticks(&self) -> i64 {
        i64::from(self.gap_fill_max_secs) * TICKS_PER_SECOND
    }

    pub(crate) fn max_tick_age(&self) -> Duration {
        Duration::hours(i64::from(self.max_tick_age_hours))
    }

    /// Credit for the first observation on a newly seeded or jumped-to track.
    pub(crate) fn guarded_credit(&self, secs: u64) -> f64 {
        if secs <= u64::from(self.seed_guard_secs) {
            secs_f64(secs)
        } else {
            0.0
        }
    }

    /// Seconds of a track that must be heard before moving on counts as a
    /// completion.
    pub fn advance_threshold(&self, runtime_secs: f64) -> f64 {
        (runtime_secs * self.advance_fraction).max(self.advance_min_secs)
    }

    /// Seconds of a final track that complete the playlist.
    pub fn completion_threshold(&self, runtime_secs: f64) -> f64 {
        runtime_secs * self.completion_fraction
    }
}

#[expect(
    clippy::cast_precision_loss,
    reason = "per-tick second counts are small"
)]
pub(crate) fn secs_f64(secs: u64) -> f64 {
    secs as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: TrackerConfig = serde_json::from_str(r#"{"pause_after_ticks": 4}"#).unwrap();
        assert_eq!(config.pause_after_ticks, 4);
        assert_eq!(config.abandon_after_ticks, 240);
        assert_eq!(config.seed_guard_secs, 30);
    }

    #[test]
    fn advance_threshold_has_floor() {
        let config = TrackerConfig::default();
        assert!((config.advance_threshold(300.0) - 201.0).abs() < 1e-9);
        assert!((config.advance_threshold(6.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn guarded_credit_drops_mid_track_positions() {
        let config = TrackerConfig::default();
        assert!((config.guarded_credit(5) - 5.0).abs() < f64::EPSILON);
        assert!((config.guarded_credit(30) - 30.0).abs() < f64::EPSILON);
        assert!(config.guarded_credit(31).abs() < f64::EPSILON);
    }
}
