//! Storage layer for the playlist tracker.
//!
//! Implements every persistence interface of [`pt_core::store`] on top of
//! `rusqlite`, plus the seeding helpers used to load generated playlists and
//! item metadata.
//!
//! # Thread Safety
//!
//! The tracker holds its stores as `Arc<dyn Trait + Send + Sync>`, so the
//! `rusqlite::Connection` (which is `Send` but not `Sync`) sits behind a
//! `Mutex`. Every query holds the lock only for its own duration.
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Timestamps are stored as TEXT in RFC 3339 with millisecond precision and a
//! `Z` suffix (e.g. `2025-01-15T10:30:00.000Z`). Lexicographic ordering then
//! matches chronological ordering, so range filters are plain string
//! comparisons.
//!
//! ## Defensive Reads
//!
//! Rows may be written by other tools. Integer columns that matter to the
//! tracker (`order_index`, `current_index`, flags) are read as raw
//! [`Value`]s and coerced, so integers stored as TEXT or REAL still load.
//! Item metadata that is not valid JSON is treated as missing.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use pt_core::error::StoreError;
use pt_core::store::{
    HourlyListening, Identity, IdentityResolver, ListeningStore, PlaylistCandidate, PlaylistInfo,
    PlaylistStore, SessionRow, SessionStore, SessionUpsert,
};
use pt_core::types::{
    ExternalUserId, ItemId, PlaylistId, SessionId, UserId, secs_to_ticks, ticks_to_secs,
};
use pt_core::UNKNOWN;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use thiserror::Error;

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored timestamp could not be parsed.
    #[error("invalid timestamp for {entity} {id}: {timestamp}")]
    TimestampParse {
        entity: &'static str,
        id: String,
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
    /// A row held a value the tracker cannot interpret.
    #[error("invalid {entity} row {id}: {message}")]
    InvalidRow {
        entity: &'static str,
        id: String,
        message: String,
    },
    /// A value could not be encoded for storage.
    #[error("failed to encode {what}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::InvalidRow {
                entity,
                id,
                message,
            } => Self::Malformed {
                entity,
                message: format!("{id}: {message}"),
            },
            other => Self::backend(other),
        }
    }
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Mutex<Connection>,
}

/// A generated playlist ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPlaylist {
    pub user_id: UserId,
    pub name: String,
    /// Playlist ID on the media server, if the playlist was pushed there.
    pub external_playlist_id: Option<String>,
    /// Tracks in play order.
    pub items: Vec<ItemId>,
    pub generated_at: DateTime<Utc>,
}

/// Row counts and totals shown by `pt status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatabaseSummary {
    pub linked_users: usize,
    pub items: usize,
    pub playlists: usize,
    pub expired_playlists: usize,
    pub open_sessions: usize,
    pub completed_sessions: usize,
    pub tracks_recorded: usize,
    pub listened_secs: f64,
    pub hourly_rows: usize,
    pub hourly_ticks: i64,
}

/// An incomplete session with its playlist context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenSession {
    pub session_id: SessionId,
    pub user_id: String,
    pub playlist_name: String,
    pub current_index: u32,
    pub total_tracks: u32,
    pub is_confirmed: bool,
    pub last_seen: DateTime<Utc>,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` on the connection and converts the error for the store traits.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, DbError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn();
        f(&mut conn).map_err(|err| {
            tracing::debug!(error = %err, "store operation failed");
            StoreError::from(err)
        })
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(
            "
            -- Maps media-server users to the accounts events are addressed to
            CREATE TABLE IF NOT EXISTS user_links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL UNIQUE,
                display_name TEXT,
                external_user_id TEXT NOT NULL UNIQUE
            );

            -- Media-server item cache
            -- metadata_json: raw item metadata; runtime is read from RunTimeTicks
            CREATE TABLE IF NOT EXISTS items (
                id TEXT PRIMARY KEY,
                title TEXT,
                type TEXT,
                collection TEXT,
                category TEXT,
                last_fetched TEXT,
                metadata_json TEXT
            );

            -- playlist_items: JSON array of item IDs in play order
            CREATE TABLE IF NOT EXISTS user_playlists (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                playlist_name TEXT,
                generated_at TEXT NOT NULL,
                playlist_items TEXT NOT NULL,
                num_files INTEGER NOT NULL,
                is_expired INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_user_playlists_user ON user_playlists(user_id, is_expired);

            CREATE TABLE IF NOT EXISTS playlist_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_playlist_id INTEGER NOT NULL,
                external_playlist_id TEXT,
                item_id TEXT NOT NULL,
                order_index INTEGER NOT NULL,
                added_at TEXT NOT NULL,
                FOREIGN KEY (user_playlist_id) REFERENCES user_playlists(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_playlist_items_playlist ON playlist_items(user_playlist_id, order_index);
            CREATE INDEX IF NOT EXISTS idx_playlist_items_external ON playlist_items(external_playlist_id);

            CREATE TABLE IF NOT EXISTS playlist_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                user_playlist_id INTEGER NOT NULL,
                external_playlist_id TEXT,
                started_at TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                current_index INTEGER NOT NULL DEFAULT 0,
                is_confirmed INTEGER NOT NULL DEFAULT 0,
                is_complete INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (user_playlist_id) REFERENCES user_playlists(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_playlist_sessions_user_active ON playlist_sessions(user_id, is_complete, last_seen);

            CREATE TABLE IF NOT EXISTS playlist_file_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                playlist_session_id INTEGER NOT NULL,
                item_id TEXT NOT NULL,
                order_index INTEGER NOT NULL,
                completed_at TEXT NOT NULL,
                listen_duration_seconds REAL NOT NULL DEFAULT 0,
                FOREIGN KEY (playlist_session_id) REFERENCES playlist_sessions(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_playlist_file_events_session ON playlist_file_events(playlist_session_id);

            -- Listening ticks per external user, item and UTC hour
            CREATE TABLE IF NOT EXISTS listening_hourly (
                external_user_id TEXT NOT NULL,
                item_id TEXT NOT NULL,
                hour_start TEXT NOT NULL,
                ticks INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (external_user_id, item_id, hour_start)
            );

            CREATE INDEX IF NOT EXISTS idx_listening_hourly_user ON listening_hourly(external_user_id);
            ",
        )?;
        Ok(())
    }

    /// Links a media-server user to an internal user, replacing any previous
    /// link for the same media-server user.
    pub fn link_user(
        &self,
        external: &ExternalUserId,
        user: &UserId,
        display_name: &str,
    ) -> Result<(), DbError> {
        self.conn().execute(
            "
            INSERT INTO user_links (user_id, display_name, external_user_id)
            VALUES (?, ?, ?)
            ON CONFLICT(external_user_id)
            DO UPDATE SET user_id = excluded.user_id, display_name = excluded.display_name
            ",
            params![user.as_str(), display_name, external.as_str()],
        )?;
        Ok(())
    }

    /// Inserts or replaces an item's title and runtime.
    pub fn insert_item(
        &self,
        item: &ItemId,
        title: &str,
        runtime_secs: Option<f64>,
    ) -> Result<(), DbError> {
        let metadata = runtime_secs
            .map(|secs| {
                serde_json::to_string(&serde_json::json!({ "RunTimeTicks": secs_to_ticks(secs) }))
            })
            .transpose()
            .map_err(|source| DbError::Encode {
                what: "item metadata",
                source,
            })?;
        self.conn().execute(
            "
            INSERT INTO items (id, title, metadata_json)
            VALUES (?, ?, ?)
            ON CONFLICT(id)
            DO UPDATE SET title = excluded.title, metadata_json = excluded.metadata_json
            ",
            params![item.as_str(), title, metadata],
        )?;
        Ok(())
    }

    /// Stores a generated playlist and its tracks.
    pub fn insert_playlist(&self, playlist: &NewPlaylist) -> Result<PlaylistId, DbError> {
        let items_json =
            serde_json::to_string(&playlist.items).map_err(|source| DbError::Encode {
                what: "playlist items",
                source,
            })?;
        let generated_at = format_timestamp(playlist.generated_at);

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "
            INSERT INTO user_playlists (user_id, playlist_name, generated_at, playlist_items, num_files)
            VALUES (?, ?, ?, ?, ?)
            ",
            params![
                playlist.user_id.as_str(),
                playlist.name,
                generated_at,
                items_json,
                playlist.items.len(),
            ],
        )?;
        let playlist_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO playlist_items (user_playlist_id, external_playlist_id, item_id, order_index, added_at)
                VALUES (?, ?, ?, ?, ?)
                ",
            )?;
            for (index, item) in playlist.items.iter().enumerate() {
                stmt.execute(params![
                    playlist_id,
                    playlist.external_playlist_id,
                    item.as_str(),
                    index,
                    generated_at,
                ])?;
            }
        }
        tx.commit()?;
        tracing::debug!(
            playlist_id,
            user = %playlist.user_id,
            tracks = playlist.items.len(),
            "stored playlist"
        );
        Ok(PlaylistId(playlist_id))
    }

    /// Marks a playlist as expired so it no longer seeds sessions.
    ///
    /// Returns `false` if the playlist does not exist.
    pub fn expire_playlist(&self, playlist: PlaylistId) -> Result<bool, DbError> {
        let updated = self.conn().execute(
            "UPDATE user_playlists SET is_expired = 1 WHERE id = ?",
            [playlist.get()],
        )?;
        Ok(updated > 0)
    }

    /// Counts and totals across the whole database.
    pub fn summary(&self) -> Result<DatabaseSummary, DbError> {
        let conn = self.conn();
        let count = |sql: &str| -> Result<usize, DbError> {
            Ok(conn.query_row(sql, [], |row| row.get(0))?)
        };
        Ok(DatabaseSummary {
            linked_users: count("SELECT COUNT(*) FROM user_links")?,
            items: count("SELECT COUNT(*) FROM items")?,
            playlists: count("SELECT COUNT(*) FROM user_playlists")?,
            expired_playlists: count("SELECT COUNT(*) FROM user_playlists WHERE is_expired = 1")?,
            open_sessions: count("SELECT COUNT(*) FROM playlist_sessions WHERE is_complete = 0")?,
            completed_sessions: count(
                "SELECT COUNT(*) FROM playlist_sessions WHERE is_complete = 1",
            )?,
            tracks_recorded: count("SELECT COUNT(*) FROM playlist_file_events")?,
            listened_secs: conn.query_row(
                "SELECT TOTAL(listen_duration_seconds) FROM playlist_file_events",
                [],
                |row| row.get(0),
            )?,
            hourly_rows: count("SELECT COUNT(*) FROM listening_hourly")?,
            hourly_ticks: conn.query_row(
                "SELECT COALESCE(SUM(ticks), 0) FROM listening_hourly",
                [],
                |row| row.get(0),
            )?,
        })
    }

    /// Lists incomplete sessions, most recently seen first.
    pub fn open_sessions(&self) -> Result<Vec<OpenSession>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "
            SELECT s.id, s.user_id, p.playlist_name, s.current_index, p.num_files, s.is_confirmed, s.last_seen
            FROM playlist_sessions s
            JOIN user_playlists p ON p.id = s.user_playlist_id
            WHERE s.is_complete = 0
            ORDER BY s.last_seen DESC, s.id DESC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Value>(3)?,
                row.get::<_, Value>(4)?,
                row.get::<_, Value>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut sessions = Vec::new();
        for row in rows {
            let (id, user_id, name, index, total, confirmed, last_seen) = row?;
            let id_text = id.to_string();
            sessions.push(OpenSession {
                session_id: SessionId(id),
                user_id,
                playlist_name: name.unwrap_or_else(|| UNKNOWN.to_string()),
                current_index: coerce_u32(&index, "playlist_sessions", &id_text)?,
                total_tracks: coerce_u32(&total, "user_playlists", &id_text)?,
                is_confirmed: coerce_flag(&confirmed),
                last_seen: parse_timestamp(&last_seen, "playlist_sessions", &id_text)?,
            });
        }
        Ok(sessions)
    }

    /// Number of playlists this user has completed.
    pub fn completed_playlist_count(&self, user: &UserId) -> Result<usize, DbError> {
        Ok(self.conn().query_row(
            "SELECT COUNT(*) FROM playlist_sessions WHERE user_id = ? AND is_complete = 1",
            [user.as_str()],
            |row| row.get(0),
        )?)
    }
}

impl PlaylistStore for Database {
    fn track_at_index(
        &self,
        playlist: PlaylistId,
        index: u32,
    ) -> Result<Option<ItemId>, StoreError> {
        self.with_conn(|conn| {
            let item: Option<String> = conn
                .query_row(
                    "
                    SELECT item_id FROM playlist_items
                    WHERE user_playlist_id = ? AND order_index = ?
                    LIMIT 1
                    ",
                    params![playlist.get(), index],
                    |row| row.get(0),
                )
                .optional()?;
            item.map(|id| parse_item_id(id, "playlist_items")).transpose()
        })
    }

    fn order_index_of(
        &self,
        playlist: PlaylistId,
        item: &ItemId,
    ) -> Result<Option<u32>, StoreError> {
        self.with_conn(|conn| {
            let index: Option<Value> = conn
                .query_row(
                    "
                    SELECT order_index FROM playlist_items
                    WHERE user_playlist_id = ? AND item_id = ?
                    ORDER BY id
                    LIMIT 1
                    ",
                    params![playlist.get(), item.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(index.and_then(|value| {
                let index = coerce_int(&value).and_then(|i| u32::try_from(i).ok());
                if index.is_none() {
                    tracing::warn!(playlist = %playlist, item = %item, ?value, "unreadable order index");
                }
                index
            }))
        })
    }

    fn playlist_length(&self, playlist: PlaylistId) -> Result<u32, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM playlist_items WHERE user_playlist_id = ?",
                [playlist.get()],
                |row| row.get(0),
            )?)
        })
    }

    fn playlist_info(&self, playlist: PlaylistId) -> Result<Option<PlaylistInfo>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT playlist_name, generated_at, num_files FROM user_playlists WHERE id = ?",
                    [playlist.get()],
                    |row| {
                        Ok((
                            row.get::<_, Option<String>>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Value>(2)?,
                        ))
                    },
                )
                .optional()?;
            let Some((name, generated_at, num_files)) = row else {
                return Ok(None);
            };
            let external_playlist_id = external_playlist_id(conn, playlist)?;
            Ok(Some(PlaylistInfo {
                name: name.unwrap_or_else(|| UNKNOWN.to_string()),
                generated_at: generated_at.and_then(|raw| {
                    parse_timestamp(&raw, "user_playlists", &playlist.to_string())
                        .inspect_err(|err| tracing::warn!(error = %err, "ignoring generated_at"))
                        .ok()
                }),
                total_files: coerce_int(&num_files)
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(0),
                external_playlist_id,
            }))
        })
    }

    fn candidate_playlists_by_first_track(
        &self,
        user: &UserId,
        item: &ItemId,
    ) -> Result<Vec<PlaylistCandidate>, StoreError> {
        #[derive(Default)]
        struct Heads {
            first: Option<String>,
            second: Option<String>,
            external: Option<String>,
        }

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "
                SELECT up.id, pi.item_id, pi.order_index, pi.external_playlist_id
                FROM user_playlists up
                JOIN playlist_items pi ON pi.user_playlist_id = up.id
                WHERE up.user_id = ?
                  AND up.is_expired = 0
                  AND pi.order_index IN (0, 1)
                ORDER BY up.generated_at DESC, up.id DESC
                ",
            )?;
            let rows = stmt.query_map([user.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Value>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?;

            let mut order = Vec::new();
            let mut heads: HashMap<i64, Heads> = HashMap::new();
            for row in rows {
                let (playlist_id, item_id, index, external) = row?;
                let entry = heads.entry(playlist_id).or_insert_with(|| {
                    order.push(playlist_id);
                    Heads::default()
                });
                match coerce_int(&index) {
                    Some(0) => entry.first = Some(item_id),
                    Some(1) => entry.second = Some(item_id),
                    _ => {}
                }
                if entry.external.is_none() {
                    entry.external = external;
                }
            }

            let mut candidates = Vec::new();
            for playlist_id in order {
                let Some(head) = heads.remove(&playlist_id) else {
                    continue;
                };
                if head.first.as_deref() != Some(item.as_str()) {
                    continue;
                }
                candidates.push(PlaylistCandidate {
                    playlist_id: PlaylistId(playlist_id),
                    external_playlist_id: head.external,
                    second_item_id: head.second.and_then(|id| ItemId::new(id).ok()),
                });
            }
            Ok(candidates)
        })
    }

    fn track_runtime(&self, item: &ItemId) -> Result<Option<f64>, StoreError> {
        self.with_conn(|conn| {
            let metadata: Option<Option<String>> = conn
                .query_row(
                    "SELECT metadata_json FROM items WHERE id = ?",
                    [item.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(metadata
                .flatten()
                .and_then(|raw| runtime_from_metadata(item.as_str(), &raw)))
        })
    }

    fn item_title(&self, item: &ItemId) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            let title: Option<Option<String>> = conn
                .query_row(
                    "SELECT title FROM items WHERE id = ? LIMIT 1",
                    [item.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(title.flatten())
        })
    }

    fn playlist_total_runtime(&self, playlist: PlaylistId) -> Result<f64, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "
                SELECT i.id, i.metadata_json
                FROM playlist_items pi
                JOIN items i ON pi.item_id = i.id
                WHERE pi.user_playlist_id = ?
                ",
            )?;
            let rows = stmt.query_map([playlist.get()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            let mut total = 0.0;
            for row in rows {
                let (item, metadata) = row?;
                if let Some(runtime) = metadata.and_then(|raw| runtime_from_metadata(&item, &raw))
                {
                    total += runtime;
                }
            }
            Ok(total)
        })
    }
}

impl SessionStore for Database {
    fn upsert_session(&self, session: &SessionUpsert<'_>) -> Result<SessionId, StoreError> {
        self.with_conn(|conn| {
            let seen_at = format_timestamp(session.seen_at);
            let tx = conn.transaction()?;
            let existing: Option<i64> = tx
                .query_row(
                    "
                    SELECT id FROM playlist_sessions
                    WHERE user_id = ? AND user_playlist_id = ? AND is_complete = 0
                    ORDER BY id
                    LIMIT 1
                    ",
                    params![session.user_id.as_str(), session.playlist_id.get()],
                    |row| row.get(0),
                )
                .optional()?;

            let id = match existing {
                Some(id) => {
                    tx.execute(
                        "
                        UPDATE playlist_sessions
                        SET last_seen = ?,
                            current_index = ?,
                            is_confirmed = ?,
                            external_playlist_id = COALESCE(?, external_playlist_id)
                        WHERE id = ?
                        ",
                        params![
                            seen_at,
                            session.current_index,
                            session.is_confirmed,
                            session.external_playlist_id,
                            id,
                        ],
                    )?;
                    id
                }
                None => {
                    tx.execute(
                        "
                        INSERT INTO playlist_sessions
                        (user_id, user_playlist_id, external_playlist_id, started_at, last_seen, current_index, is_confirmed)
                        VALUES (?, ?, ?, ?, ?, ?, ?)
                        ",
                        params![
                            session.user_id.as_str(),
                            session.playlist_id.get(),
                            session.external_playlist_id,
                            seen_at,
                            seen_at,
                            session.current_index,
                            session.is_confirmed,
                        ],
                    )?;
                    tx.last_insert_rowid()
                }
            };
            tx.commit()?;
            Ok(SessionId(id))
        })
    }

    fn record_track_completion(
        &self,
        session: SessionId,
        item: &ItemId,
        index: u32,
        seconds: f64,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "
                INSERT INTO playlist_file_events
                (playlist_session_id, item_id, order_index, completed_at, listen_duration_seconds)
                VALUES (?, ?, ?, ?, ?)
                ",
                params![
                    session.get(),
                    item.as_str(),
                    index,
                    format_timestamp(Utc::now()),
                    seconds,
                ],
            )?;
            Ok(())
        })
    }

    fn mark_session_complete(&self, session: SessionId) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE playlist_sessions SET is_complete = 1 WHERE id = ? AND is_complete = 0",
                [session.get()],
            )?;
            if updated == 0 {
                tracing::debug!(session = %session, "session already complete or missing");
            }
            Ok(())
        })
    }

    fn find_recent_incomplete_session(
        &self,
        user: &UserId,
        since: DateTime<Utc>,
    ) -> Result<Option<SessionRow>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "
                    SELECT id, user_id, user_playlist_id, external_playlist_id,
                           current_index, last_seen, is_confirmed, is_complete
                    FROM playlist_sessions
                    WHERE user_id = ?
                      AND is_complete = 0
                      AND last_seen >= ?
                    ORDER BY last_seen DESC, id DESC
                    LIMIT 1
                    ",
                    params![user.as_str(), format_timestamp(since)],
                    |row| {
                        Ok(RawSession {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            playlist_id: row.get(2)?,
                            external_playlist_id: row.get(3)?,
                            current_index: row.get(4)?,
                            last_seen: row.get(5)?,
                            is_confirmed: row.get(6)?,
                            is_complete: row.get(7)?,
                        })
                    },
                )
                .optional()?;
            row.map(RawSession::into_row).transpose()
        })
    }

    fn session_listen_time(&self, session: SessionId) -> Result<f64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT TOTAL(listen_duration_seconds) FROM playlist_file_events WHERE playlist_session_id = ?",
                [session.get()],
                |row| row.get(0),
            )?)
        })
    }
}

impl ListeningStore for Database {
    fn flush_hourly(&self, rows: &[HourlyListening]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut written = 0;
            {
                let mut stmt = tx.prepare(
                    "
                    INSERT INTO listening_hourly (external_user_id, item_id, hour_start, ticks)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(external_user_id, item_id, hour_start)
                    DO UPDATE SET ticks = ticks + excluded.ticks
                    ",
                )?;
                for row in rows {
                    written += stmt.execute(params![
                        row.external_user_id.as_str(),
                        row.item_id.as_str(),
                        format_timestamp(row.hour_start),
                        row.ticks,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(written)
        })
    }
}

impl IdentityResolver for Database {
    fn resolve(&self, external: &ExternalUserId) -> Result<Option<Identity>, StoreError> {
        self.with_conn(|conn| {
            let row: Option<(String, Option<String>)> = conn
                .query_row(
                    "SELECT user_id, display_name FROM user_links WHERE external_user_id = ?",
                    [external.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((user_id, display_name)) = row else {
                return Ok(None);
            };
            let user_id = UserId::new(user_id).map_err(|err| DbError::InvalidRow {
                entity: "user_links",
                id: external.to_string(),
                message: err.to_string(),
            })?;
            let display_name = display_name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| user_id.to_string());
            Ok(Some(Identity {
                user_id,
                display_name,
            }))
        })
    }
}

/// A `playlist_sessions` row before validation.
struct RawSession {
    id: i64,
    user_id: String,
    playlist_id: i64,
    external_playlist_id: Option<String>,
    current_index: Value,
    last_seen: String,
    is_confirmed: Value,
    is_complete: Value,
}

impl RawSession {
    fn into_row(self) -> Result<SessionRow, DbError> {
        let id = self.id.to_string();
        let user_id = UserId::new(self.user_id).map_err(|err| DbError::InvalidRow {
            entity: "playlist_sessions",
            id: id.clone(),
            message: err.to_string(),
        })?;
        Ok(SessionRow {
            session_id: SessionId(self.id),
            user_id,
            playlist_id: PlaylistId(self.playlist_id),
            external_playlist_id: self.external_playlist_id,
            current_index: coerce_u32(&self.current_index, "playlist_sessions", &id)?,
            last_seen: parse_timestamp(&self.last_seen, "playlist_sessions", &id)?,
            is_confirmed: coerce_flag(&self.is_confirmed),
            is_complete: coerce_flag(&self.is_complete),
        })
    }
}

/// First non-null media-server playlist ID recorded for a playlist's tracks.
fn external_playlist_id(
    conn: &Connection,
    playlist: PlaylistId,
) -> Result<Option<String>, DbError> {
    Ok(conn
        .query_row(
            "
            SELECT external_playlist_id FROM playlist_items
            WHERE user_playlist_id = ? AND external_playlist_id IS NOT NULL
            LIMIT 1
            ",
            [playlist.get()],
            |row| row.get(0),
        )
        .optional()?)
}

fn parse_item_id(raw: String, entity: &'static str) -> Result<ItemId, DbError> {
    ItemId::new(raw).map_err(|err| DbError::InvalidRow {
        entity,
        id: "item_id".to_string(),
        message: err.to_string(),
    })
}

/// Reads an integer that may have been stored as TEXT or REAL.
fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(*i),
        Value::Real(f) if f.is_finite() && f.fract().abs() < f64::EPSILON => real_to_int(*f),
        Value::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "only whole, range-checked values reach the cast"
)]
fn real_to_int(f: f64) -> Option<i64> {
    const LIMIT: f64 = 9.007_199_254_740_992e15;
    (f.abs() <= LIMIT).then_some(f as i64)
}

fn coerce_u32(value: &Value, entity: &'static str, id: &str) -> Result<u32, DbError> {
    coerce_int(value)
        .and_then(|i| u32::try_from(i).ok())
        .ok_or_else(|| DbError::InvalidRow {
            entity,
            id: id.to_string(),
            message: format!("expected a non-negative integer, got {value:?}"),
        })
}

fn coerce_flag(value: &Value) -> bool {
    match value {
        Value::Text(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true"),
        other => coerce_int(other).is_some_and(|i| i != 0),
    }
}

/// Runtime in seconds from raw item metadata. Missing, zero and unparseable
/// runtimes are all `None`.
fn runtime_from_metadata(item: &str, metadata: &str) -> Option<f64> {
    let parsed: serde_json::Value = match serde_json::from_str(metadata) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(item, error = %err, "invalid item metadata JSON");
            return None;
        }
    };
    let ticks = parsed.get("RunTimeTicks")?;
    let ticks = ticks
        .as_i64()
        .or_else(|| ticks.as_str().and_then(|s| s.trim().parse().ok()))?;
    (ticks > 0).then(|| ticks_to_secs(ticks))
}

fn parse_timestamp(timestamp: &str, entity: &'static str, id: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            entity,
            id: id.to_string(),
            timestamp: timestamp.to_string(),
            source,
        })
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}
