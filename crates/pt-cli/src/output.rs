//! JSON-lines event output.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use pt_core::{EventSink, TrackerEvent};

/// Writes one event as a single JSON line and flushes.
pub fn write_event<W: Write>(writer: &mut W, event: &TrackerEvent) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, event)?;
    writeln!(writer)?;
    writer.flush()
}

/// An [`EventSink`] that writes every event as a JSON line.
#[derive(Debug)]
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub const fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn emit(&self, event: TrackerEvent) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = write_event(&mut *writer, &event) {
            tracing::warn!(kind = %event.kind(), error = %err, "failed to write event");
        }
    }
}
