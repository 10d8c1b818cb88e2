//! Error types shared by the tracker and its store implementations.

use thiserror::Error;

/// Errors surfaced by store and identity implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store failed.
    #[error("store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// A row came back in a shape that could not be interpreted.
    #[error("malformed {entity} row: {message}")]
    Malformed {
        entity: &'static str,
        message: String,
    },
}

impl StoreError {
    /// Wraps any backend error.
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}

/// Errors raised while processing one user's tick.
///
/// These never escape the tick loop; they are logged and the user is skipped.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// A store lookup or write failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A persisted session referenced a playlist that no longer resolves.
    #[error("playlist {playlist_id} has no track at index {index}")]
    MissingTrack { playlist_id: i64, index: u32 },
}
