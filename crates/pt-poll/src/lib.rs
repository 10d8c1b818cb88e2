//! Media server session polling.
//!
//! Fetches `/Sessions` from a Jellyfin-compatible server and reduces the
//! response to the [`StreamSnapshot`]s the tracker consumes: one per session
//! that has a user, a now-playing item and recent activity.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use pt_core::types::{ExternalUserId, ItemId};
use pt_core::StreamSnapshot;
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

/// Default request timeout for API calls.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const TOKEN_HEADER: &str = "X-Emby-Token";
/// Sessions idle for longer than this are not streaming.
const ACTIVITY_WINDOW_MINUTES: i64 = 15;

/// Polling client errors.
#[derive(Debug, Error)]
pub enum PollError {
    /// The provided API key was invalid.
    #[error("invalid API key: {reason}")]
    InvalidApiKey { reason: &'static str },
    /// The server URL could not be used.
    #[error("invalid server URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    /// Failed to build HTTP client.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    /// HTTP request failed.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The server answered with a non-success status.
    #[error("server returned status {status}: {body}")]
    Status { status: u16, body: String },
    /// Failed to parse response.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Client for the media server's session list.
///
/// # Thread Safety
///
/// The client is safe to clone and share across threads. Each clone shares
/// the underlying HTTP connection pool.
#[derive(Clone)]
pub struct MediaServerClient {
    http: reqwest::Client,
    sessions_url: Url,
    api_key: String,
}

impl fmt::Debug for MediaServerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaServerClient")
            .field("sessions_url", &self.sessions_url.as_str())
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl MediaServerClient {
    /// Creates a client for the server at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key is empty or whitespace-only, if the URL
    /// is not an absolute http(s) URL, or if the HTTP client fails to build.
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, PollError> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(PollError::InvalidApiKey {
                reason: "API key cannot be empty",
            });
        }
        if api_key.trim().is_empty() {
            return Err(PollError::InvalidApiKey {
                reason: "API key cannot be whitespace-only",
            });
        }

        let sessions_url = sessions_url(base_url)?;
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(PollError::ClientBuild)?;

        Ok(Self {
            http,
            sessions_url,
            api_key,
        })
    }

    /// Fetches the sessions that are currently streaming, as of `now`.
    pub async fn active_streams(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<StreamSnapshot>, PollError> {
        let response = self
            .http
            .get(self.sessions_url.clone())
            .header(TOKEN_HEADER, &self.api_key)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(PollError::Status {
                status: status.as_u16(),
                body,
            });
        }
        parse_sessions(&body, now)
    }
}

/// Resolves `{base}/Sessions`, tolerating a trailing slash or path prefix.
fn sessions_url(base_url: &str) -> Result<Url, PollError> {
    let invalid = |reason: String| PollError::InvalidUrl {
        url: base_url.to_string(),
        reason,
    };
    let mut base = Url::parse(base_url.trim()).map_err(|err| invalid(err.to_string()))?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", base.scheme())));
    }
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join("Sessions").map_err(|err| invalid(err.to_string()))
}

/// The server returns either a bare list or a paged `{"Items": [...]}` body.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SessionsPayload {
    List(Vec<RawSession>),
    Paged {
        #[serde(rename = "Items")]
        items: Vec<RawSession>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct RawSession {
    user_id: Option<String>,
    last_activity_date: Option<String>,
    now_playing_item: Option<RawItem>,
    play_state: Option<RawPlayState>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct RawItem {
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct RawPlayState {
    position_ticks: Option<i64>,
    is_paused: Option<bool>,
}

/// Extracts streaming sessions from a `/Sessions` response body.
///
/// A session streams when it has a user, a now-playing item and a last
/// activity within the last 15 minutes. Sessions missing any of these are
/// skipped, not errors.
pub fn parse_sessions(body: &str, now: DateTime<Utc>) -> Result<Vec<StreamSnapshot>, PollError> {
    let payload: SessionsPayload =
        serde_json::from_str(body).map_err(|err| PollError::InvalidResponse(err.to_string()))?;
    let sessions = match payload {
        SessionsPayload::List(items) | SessionsPayload::Paged { items } => items,
    };
    let cutoff = now - TimeDelta::minutes(ACTIVITY_WINDOW_MINUTES);
    let total = sessions.len();

    let streams: Vec<StreamSnapshot> = sessions
        .into_iter()
        .filter_map(|session| streaming_snapshot(session, cutoff))
        .collect();
    tracing::debug!(sessions = total, streaming = streams.len(), "parsed sessions");
    Ok(streams)
}

fn streaming_snapshot(session: RawSession, cutoff: DateTime<Utc>) -> Option<StreamSnapshot> {
    let last_activity = session
        .last_activity_date
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())?
        .with_timezone(&Utc);
    if last_activity <= cutoff {
        return None;
    }
    let item_id = ItemId::new(session.now_playing_item?.id?).ok()?;
    let external_user_id = ExternalUserId::new(session.user_id?).ok()?;
    let play_state = session.play_state.unwrap_or_default();
    Some(StreamSnapshot {
        external_user_id,
        item_id,
        position_ticks: play_state.position_ticks.unwrap_or(0).max(0),
        is_paused: play_state.is_paused.unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pt_core::TICKS_PER_SECOND;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn client_rejects_empty_api_key() {
        assert!(matches!(
            MediaServerClient::new("http://localhost:8096", ""),
            Err(PollError::InvalidApiKey { .. })
        ));
    }

    #[test]
    fn client_rejects_whitespace_api_key() {
        assert!(matches!(
            MediaServerClient::new("http://localhost:8096", "   "),
            Err(PollError::InvalidApiKey { .. })
        ));
    }

    #[test]
    fn client_rejects_bad_urls() {
        assert!(matches!(
            MediaServerClient::new("localhost:8096", "key"),
            Err(PollError::InvalidUrl { .. })
        ));
        assert!(matches!(
            MediaServerClient::new("ftp://media.local", "key"),
            Err(PollError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn client_debug_redacts_api_key() {
        let client = MediaServerClient::new("http://localhost:8096", "secret-key").unwrap();
        let debug = format!("{client:?}");
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn sessions_url_keeps_path_prefix() {
        assert_eq!(
            sessions_url("http://localhost:8096").unwrap().as_str(),
            "http://localhost:8096/Sessions"
        );
        assert_eq!(
            sessions_url("https://media.example.com/jellyfin/").unwrap().as_str(),
            "https://media.example.com/jellyfin/Sessions"
        );
        assert_eq!(
            sessions_url("https://media.example.com/jellyfin").unwrap().as_str(),
            "https://media.example.com/jellyfin/Sessions"
        );
    }

    #[test]
    fn parses_streaming_sessions() {
        let body = r#"[
            {
                "UserId": "jf-1",
                "LastActivityDate": "2025-01-01T09:59:50.1234567Z",
                "NowPlayingItem": {"Id": "item-a", "Name": "Song"},
                "PlayState": {"PositionTicks": 300000000, "IsPaused": true}
            },
            {
                "UserId": "jf-2",
                "LastActivityDate": "2025-01-01T09:58:00Z",
                "NowPlayingItem": {"Id": "item-b"}
            }
        ]"#;
        let streams = parse_sessions(body, now()).unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].external_user_id.as_str(), "jf-1");
        assert_eq!(streams[0].item_id.as_str(), "item-a");
        assert_eq!(streams[0].position_ticks, 30 * TICKS_PER_SECOND);
        assert!(streams[0].is_paused);
        assert_eq!(streams[1].position_ticks, 0);
        assert!(!streams[1].is_paused);
    }

    #[test]
    fn skips_idle_and_incomplete_sessions() {
        let body = r#"{"Items": [
            {"UserId": "stale", "LastActivityDate": "2025-01-01T09:40:00Z", "NowPlayingItem": {"Id": "a"}},
            {"UserId": "idle", "LastActivityDate": "2025-01-01T09:59:00Z"},
            {"LastActivityDate": "2025-01-01T09:59:00Z", "NowPlayingItem": {"Id": "a"}},
            {"UserId": "no-date", "NowPlayingItem": {"Id": "a"}},
            {"UserId": "", "LastActivityDate": "2025-01-01T09:59:00Z", "NowPlayingItem": {"Id": "a"}},
            {"UserId": "ok", "LastActivityDate": "2025-01-01T09:59:00Z", "NowPlayingItem": {"Id": "a"}}
        ]}"#;
        let streams = parse_sessions(body, now()).unwrap();
        let users: Vec<&str> = streams.iter().map(|s| s.external_user_id.as_str()).collect();
        assert_eq!(users, vec!["ok"]);
    }

    #[test]
    fn rejects_unexpected_body() {
        let err = parse_sessions(r#"{"error": "nope"}"#, now()).unwrap_err();
        assert!(matches!(err, PollError::InvalidResponse(_)));
    }
}
