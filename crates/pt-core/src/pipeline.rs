//! One polling tick, end to end.
//!
//! Order matters: the buffer is updated and drained before increments are
//! processed, and snapshots are refreshed before the abandonment check so it
//! sees post-increment state.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::buffer::{StreamSnapshot, TickBuffer};
use crate::config::TrackerConfig;
use crate::sink::EventSink;
use crate::store::{ListeningStore, PlaylistStore, Stores};
use crate::tracker::SessionTracker;
use crate::types::ItemId;

/// What a tick did, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub streams: usize,
    pub deltas: usize,
    pub reattached: usize,
    pub active_sessions: usize,
}

pub struct Pipeline {
    config: TrackerConfig,
    buffer: TickBuffer,
    tracker: SessionTracker,
    playlists: Arc<dyn PlaylistStore>,
    listening: Option<Arc<dyn ListeningStore>>,
    reattach_pending: bool,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("buffer", &self.buffer)
            .field("tracker", &self.tracker)
            .field("reattach_pending", &self.reattach_pending)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(config: TrackerConfig, stores: Stores, sink: Arc<dyn EventSink>) -> Self {
        Self {
            buffer: TickBuffer::new(config.clone()),
            playlists: Arc::clone(&stores.playlists),
            tracker: SessionTracker::new(config.clone(), stores, sink),
            config,
            listening: None,
            reattach_pending: true,
        }
    }

    /// Persists flushed hourly buckets to `store`.
    #[must_use]
    pub fn with_listening_store(mut self, store: Arc<dyn ListeningStore>) -> Self {
        self.listening = Some(store);
        self
    }

    /// Runs the whole pipeline for one poll's worth of active streams.
    ///
    /// The first tick also tries to reattach persisted sessions.
    pub fn run_tick(&mut self, snapshots: &[StreamSnapshot], now: DateTime<Utc>) -> TickReport {
        let mut reattached = 0;
        if self.reattach_pending {
            self.reattach_pending = false;
            for snapshot in snapshots {
                match self.tracker.reattach(snapshot, now) {
                    Ok(true) => reattached += 1,
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(user = %snapshot.external_user_id, error = %err, "reattach failed");
                    }
                }
            }
        }

        for snapshot in snapshots {
            let playlists = &self.playlists;
            let default_runtime = self.config.default_runtime_secs;
            self.buffer.update(snapshot, now, |item| {
                runtime_or_default(playlists.as_ref(), item, default_runtime)
            });
        }
        let deltas = self.buffer.consume_recent_deltas();

        self.tracker.process_buffer_deltas(&deltas, now);
        self.tracker.update_snapshots(now);
        let streaming = self.tracker.streaming_users(snapshots);
        self.tracker.check_for_abandoned_sessions(&streaming, now);

        let report = TickReport {
            streams: snapshots.len(),
            deltas: deltas.len(),
            reattached,
            active_sessions: self.tracker.session_count(),
        };
        tracing::debug!(?report, "tick complete");
        report
    }

    /// Writes buffered hourly listening to the listening store and prunes
    /// stale positions. Returns the number of rows written.
    ///
    /// Rows stay buffered when the write fails and go out with the next flush.
    pub fn flush(&mut self, now: DateTime<Utc>) -> usize {
        self.buffer.prune_stale(now);
        let rows = self.buffer.pending_rows();
        if rows.is_empty() {
            return 0;
        }
        let Some(store) = &self.listening else {
            tracing::debug!(rows = rows.len(), "no listening store; dropping buffered rows");
            self.buffer.clear_flushed();
            return 0;
        };
        match store.flush_hourly(&rows) {
            Ok(written) => {
                self.buffer.clear_flushed();
                tracing::info!(rows = written, "flushed hourly listening");
                written
            }
            Err(err) => {
                tracing::error!(
                    rows = rows.len(),
                    error = %err,
                    "failed to flush hourly listening; keeping rows buffered"
                );
                0
            }
        }
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn buffer(&self) -> &TickBuffer {
        &self.buffer
    }

    /// Cancels deferred work and flushes what is buffered. Never fails.
    pub async fn shutdown(&mut self, now: DateTime<Utc>) {
        self.tracker.shutdown().await;
        let flushed = self.flush(now);
        tracing::info!(flushed, "pipeline shut down");
    }
}

fn runtime_or_default(playlists: &dyn PlaylistStore, item: &ItemId, default: f64) -> f64 {
    match playlists.track_runtime(item) {
        Ok(runtime) => runtime.unwrap_or(default),
        Err(err) => {
            tracing::warn!(item = %item, error = %err, "runtime lookup failed; using default");
            default
        }
    }
}
