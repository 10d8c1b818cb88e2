//! Destinations for emitted events.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::event::TrackerEvent;

/// Receives every event the tracker emits, in emission order.
///
/// Implementations must not block for long: `emit` is called from inside the
/// polling tick and from deferred completion tasks.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TrackerEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: TrackerEvent) {}
}

impl EventSink for mpsc::UnboundedSender<TrackerEvent> {
    fn emit(&self, event: TrackerEvent) {
        if self.send(event).is_err() {
            tracing::debug!("event receiver dropped; discarding event");
        }
    }
}

/// Buffers events in memory until drained.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<TrackerEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything collected so far.
    pub fn drain(&self) -> Vec<TrackerEvent> {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::take(&mut *events)
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: TrackerEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event);
    }
}
