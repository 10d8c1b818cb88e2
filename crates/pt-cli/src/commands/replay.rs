//! Offline replay of recorded stream snapshots.
//!
//! Each input line is one poll:
//!
//! ```json
//! {"at": "2025-01-01T10:00:00Z", "streams": [{"external_user_id": "jf-1", "item_id": "a1", "position_ticks": 0}]}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. Events are written as
//! JSON lines in emission order. Completions are never deferred during replay.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use pt_core::store::ListeningStore;
use pt_core::{CollectingSink, EventSink, Pipeline, Stores, StreamSnapshot, TrackerConfig};
use pt_db::Database;
use serde::{Deserialize, Serialize};

use crate::Config;
use crate::output::write_event;

/// One recorded poll.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayTick {
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub streams: Vec<StreamSnapshot>,
}

/// What a replay did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub ticks: usize,
    pub events: usize,
    pub hourly_rows: usize,
    pub open_sessions: usize,
}

/// Parses a replay file, rejecting ticks that go back in time.
pub fn parse_ticks(input: &str) -> Result<Vec<ReplayTick>> {
    let mut ticks: Vec<ReplayTick> = Vec::new();
    for (index, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line_number = index + 1;
        let tick: ReplayTick = serde_json::from_str(line)
            .with_context(|| format!("invalid replay tick on line {line_number}"))?;
        if let Some(previous) = ticks.last() {
            if tick.at < previous.at {
                bail!(
                    "replay tick on line {line_number} ({}) is earlier than the previous tick ({})",
                    tick.at,
                    previous.at
                );
            }
        }
        ticks.push(tick);
    }
    Ok(ticks)
}

pub fn run<W: Write>(writer: &mut W, db: Database, config: &Config, file: &Path) -> Result<ReplayStats> {
    let input = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let ticks = parse_ticks(&input)?;

    let db = Arc::new(db);
    let sink = Arc::new(CollectingSink::new());
    let tracker_config = TrackerConfig {
        max_event_delay_secs: 0,
        ..config.tracker.clone()
    };
    let mut pipeline = Pipeline::new(
        tracker_config,
        Stores::from_shared(&db),
        Arc::clone(&sink) as Arc<dyn EventSink>,
    )
    .with_listening_store(Arc::clone(&db) as Arc<dyn ListeningStore>);

    let mut stats = ReplayStats::default();
    let mut current_hour: Option<(NaiveDate, u32)> = None;
    for tick in &ticks {
        let hour = (tick.at.date_naive(), tick.at.hour());
        if current_hour.is_some_and(|current| current != hour) {
            stats.hourly_rows += pipeline.flush(tick.at);
        }
        current_hour = Some(hour);

        pipeline.run_tick(&tick.streams, tick.at);
        stats.ticks += 1;
        for event in sink.drain() {
            write_event(writer, &event)?;
            stats.events += 1;
        }
    }

    if let Some(last) = ticks.last() {
        stats.hourly_rows += pipeline.flush(last.at);
    }
    stats.open_sessions = pipeline.tracker().session_count();
    tracing::info!(?stats, "replay finished");
    Ok(stats)
}
