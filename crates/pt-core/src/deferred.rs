//! Delayed emission of playlist completion events.
//!
//! When the final track crosses the completion threshold before it has
//! actually ended, the `Complete` event is held back until roughly when the
//! track would finish. Pending emissions are owned tasks: they are reaped every
//! tick and cancelled on shutdown, so nothing is emitted after teardown.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::event::{CompleteEvent, TrackerEvent};
use crate::sink::EventSink;

pub struct CompletionScheduler {
    tasks: JoinSet<()>,
    cancel: CancellationToken,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for CompletionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionScheduler")
            .field("pending", &self.tasks.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl CompletionScheduler {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
            sink,
        }
    }

    /// Emits `event` after `delay`, unless shut down first.
    ///
    /// Outside a Tokio runtime there is nowhere to park the task, so the event
    /// is emitted immediately.
    pub fn schedule(&mut self, event: CompleteEvent, delay: Duration) {
        if delay.is_zero() || tokio::runtime::Handle::try_current().is_err() {
            self.sink.emit(TrackerEvent::Complete(event));
            return;
        }

        let cancel = self.cancel.clone();
        let sink = Arc::clone(&self.sink);
        tracing::debug!(
            user = %event.user.user_id,
            delay_secs = delay.as_secs_f64(),
            "scheduling deferred completion"
        );
        self.tasks.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!(user = %event.user.user_id, "deferred completion cancelled");
                }
                () = tokio::time::sleep(delay) => {
                    tracing::info!(user = %event.user.user_id, "emitting deferred completion");
                    sink.emit(TrackerEvent::Complete(event));
                }
            }
        });
    }

    /// Collects finished tasks without waiting. Returns how many were reaped.
    pub fn reap(&mut self) -> usize {
        let mut reaped = 0;
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(err) = result {
                tracing::warn!(error = %err, "deferred completion task failed");
            }
            reaped += 1;
        }
        reaped
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Cancels every pending emission and waits for the tasks to exit.
    pub async fn shutdown(&mut self) {
        let pending = self.tasks.len();
        self.cancel.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result {
                tracing::warn!(error = %err, "deferred completion task failed during shutdown");
            }
        }
        if pending > 0 {
            tracing::info!(pending, "cancelled deferred completions");
        }
    }
}
