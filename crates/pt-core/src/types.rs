//! Core type definitions with validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Playback positions are reported in ticks of 100ns.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Validation errors for core types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },
}

/// Generates a validated string ID newtype with common trait implementations.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new ID after validation.
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into();
                if id.is_empty() {
                    return Err(ValidationError::Empty { field: $field_name });
                }
                Ok(Self(id))
            }

            /// Returns the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

/// Generates an integer row-ID newtype for rows owned by the store.
macro_rules! define_row_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Returns the raw row ID.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_string_id!(
    /// Internal user identifier (the account notifications are addressed to).
    UserId, "user ID"
);

define_string_id!(
    /// User identifier as reported by the media server.
    ExternalUserId, "external user ID"
);

define_string_id!(
    /// Media item identifier as reported by the media server.
    ItemId, "item ID"
);

define_row_id!(
    /// Database ID of a generated playlist.
    PlaylistId
);

define_row_id!(
    /// Database ID of a persisted playlist session.
    SessionId
);

/// Converts a tick count to fractional seconds.
#[expect(
    clippy::cast_precision_loss,
    reason = "tick counts stay far below 2^52 for any realistic runtime"
)]
pub fn ticks_to_secs(ticks: i64) -> f64 {
    ticks as f64 / TICKS_PER_SECOND as f64
}

/// Converts fractional seconds to ticks, truncating sub-tick remainders.
#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    reason = "runtimes are bounded well inside i64 ticks"
)]
pub fn secs_to_ticks(secs: f64) -> i64 {
    (secs * TICKS_PER_SECOND as f64) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_id_rejects_empty() {
        assert!(ItemId::new("").is_err());
        assert!(ItemId::new("a1b2").is_ok());
    }

    #[test]
    fn user_id_serde_rejects_empty() {
        let result: Result<UserId, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
    }

    #[test]
    fn external_user_id_serializes_as_plain_string() {
        let id = ExternalUserId::new("jf-user").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"jf-user\"");
    }

    #[test]
    fn row_ids_are_transparent() {
        let json = serde_json::to_string(&SessionId(42)).unwrap();
        assert_eq!(json, "42");
        let parsed: PlaylistId = serde_json::from_str("7").unwrap();
        assert_eq!(parsed, PlaylistId(7));
    }

    #[test]
    #[expect(
        clippy::float_cmp,
        reason = "exact equality intended for whole-second conversions"
    )]
    fn tick_conversions() {
        assert_eq!(ticks_to_secs(50_000_000), 5.0);
        assert_eq!(secs_to_ticks(1.5), 15_000_000);
    }
}
