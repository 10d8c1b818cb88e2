//! Core engine for the playlist session tracker.
//!
//! This crate turns noisy, periodic playback snapshots into a clean stream of
//! session events:
//! - Tick aggregation: converting absolute positions into listened seconds
//! - Session inference: seeding, advancing, jumping, switching away, completing
//! - Absence staging: paused, waiting and abandoned sessions
//!
//! Storage and identity are reached only through the traits in [`store`].

mod abandon;
mod buffer;
pub mod config;
mod deferred;
mod dispatch;
pub mod error;
pub mod event;
mod increment;
mod pipeline;
pub mod sink;
mod state;
pub mod store;
mod tracker;
pub mod types;

#[cfg(test)]
mod test_support;

pub use abandon::{
    AbandonmentTracker, AbsenceDebugInfo, AbsenceStage, AbsenceTransition, SessionSnapshot,
    UserAbsence,
};
pub use buffer::{BufferEntry, RecentDelta, StreamSnapshot, TickBuffer};
pub use config::TrackerConfig;
pub use deferred::CompletionScheduler;
pub use dispatch::{EventDispatcher, TrackChange, UNKNOWN};
pub use error::{StoreError, TrackerError};
pub use event::{EventKind, TrackerEvent, UnknownEventKind};
pub use increment::IncrementProcessor;
pub use pipeline::{Pipeline, TickReport};
pub use sink::{CollectingSink, EventSink, NoopSink};
pub use state::{EndReason, SessionPhase, SessionState, SessionSummary, Transition};
pub use store::Stores;
pub use tracker::SessionTracker;
pub use types::{
    ExternalUserId, ItemId, PlaylistId, SessionId, TICKS_PER_SECOND, UserId, ValidationError,
};
