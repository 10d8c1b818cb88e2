//! In-memory store fixtures shared by unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::StoreError;
use crate::store::{
    HourlyListening, Identity, IdentityResolver, ListeningStore, PlaylistCandidate, PlaylistInfo,
    PlaylistStore, SessionRow, SessionStore, SessionUpsert,
};
use crate::types::{ExternalUserId, ItemId, PlaylistId, SessionId, UserId};

pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

pub fn item(id: &str) -> ItemId {
    ItemId::new(id).unwrap()
}

pub fn uid(id: &str) -> UserId {
    UserId::new(id).unwrap()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub session_id: SessionId,
    pub item_id: ItemId,
    pub index: u32,
    pub seconds: f64,
}

#[derive(Debug)]
struct Playlist {
    user_id: UserId,
    name: String,
    items: Vec<ItemId>,
    external_playlist_id: Option<String>,
    generated_at: DateTime<Utc>,
    expired: bool,
}

#[derive(Debug, Default)]
struct Inner {
    identities: HashMap<ExternalUserId, Identity>,
    playlists: BTreeMap<PlaylistId, Playlist>,
    runtimes: HashMap<ItemId, f64>,
    titles: HashMap<ItemId, String>,
    sessions: BTreeMap<SessionId, SessionRow>,
    completions: Vec<Completion>,
    hourly: Vec<HourlyListening>,
    fail_reads: bool,
    fail_writes: bool,
    failing_upserts: usize,
    fail_completions: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn injected() -> StoreError {
    StoreError::Malformed {
        entity: "test",
        message: "injected failure".into(),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let inner = self.lock();
        if inner.fail_reads { Err(injected()) } else { Ok(inner) }
    }

    fn write(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let inner = self.lock();
        if inner.fail_writes { Err(injected()) } else { Ok(inner) }
    }

    pub fn add_user(&self, external: &str, user: &str, display_name: &str) {
        self.lock().identities.insert(
            ExternalUserId::new(external).unwrap(),
            Identity {
                user_id: uid(user),
                display_name: display_name.to_string(),
            },
        );
    }

    /// Adds a playlist of `(item, runtime)` tracks. Later playlists count as
    /// more recently generated.
    pub fn add_playlist(&self, user: &str, name: &str, tracks: &[(&str, f64)]) -> PlaylistId {
        let mut inner = self.lock();
        let id = PlaylistId(i64::try_from(inner.playlists.len()).unwrap() + 1);
        for (track, runtime) in tracks {
            inner.runtimes.insert(item(track), *runtime);
            inner.titles.insert(item(track), format!("Title {track}"));
        }
        let generated_at = ts("2025-01-01T00:00:00Z") + TimeDelta::minutes(id.get());
        inner.playlists.insert(
            id,
            Playlist {
                user_id: uid(user),
                name: name.to_string(),
                items: tracks.iter().map(|(track, _)| item(track)).collect(),
                external_playlist_id: Some(format!("ext-{}", id.get())),
                generated_at,
                expired: false,
            },
        );
        id
    }

    pub fn expire(&self, playlist: PlaylistId) {
        if let Some(p) = self.lock().playlists.get_mut(&playlist) {
            p.expired = true;
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Fails the next `count` session upserts; other writes still succeed.
    pub fn fail_next_upserts(&self, count: usize) {
        self.lock().failing_upserts = count;
    }

    pub fn set_fail_completions(&self, fail: bool) {
        self.lock().fail_completions = fail;
    }

    pub fn completions(&self) -> Vec<Completion> {
        self.lock().completions.clone()
    }

    pub fn sessions(&self) -> Vec<SessionRow> {
        self.lock().sessions.values().cloned().collect()
    }

    pub fn hourly(&self) -> Vec<HourlyListening> {
        self.lock().hourly.clone()
    }

    /// Inserts a persisted session row directly, as if left by a previous run.
    pub fn insert_session(&self, row: SessionRow) {
        self.lock().sessions.insert(row.session_id, row);
    }
}

impl PlaylistStore for MemoryStore {
    fn track_at_index(&self, playlist: PlaylistId, index: u32) -> Result<Option<ItemId>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .playlists
            .get(&playlist)
            .and_then(|p| p.items.get(index as usize).cloned()))
    }

    fn order_index_of(&self, playlist: PlaylistId, item: &ItemId) -> Result<Option<u32>, StoreError> {
        let inner = self.read()?;
        Ok(inner.playlists.get(&playlist).and_then(|p| {
            p.items
                .iter()
                .position(|i| i == item)
                .and_then(|pos| u32::try_from(pos).ok())
        }))
    }

    fn playlist_length(&self, playlist: PlaylistId) -> Result<u32, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .playlists
            .get(&playlist)
            .map_or(0, |p| u32::try_from(p.items.len()).unwrap_or(u32::MAX)))
    }

    fn playlist_info(&self, playlist: PlaylistId) -> Result<Option<PlaylistInfo>, StoreError> {
        let inner = self.read()?;
        Ok(inner.playlists.get(&playlist).map(|p| PlaylistInfo {
            name: p.name.clone(),
            generated_at: Some(p.generated_at),
            total_files: u32::try_from(p.items.len()).unwrap_or(u32::MAX),
            external_playlist_id: p.external_playlist_id.clone(),
        }))
    }

    fn candidate_playlists_by_first_track(
        &self,
        user: &UserId,
        item: &ItemId,
    ) -> Result<Vec<PlaylistCandidate>, StoreError> {
        let inner = self.read()?;
        let mut matches: Vec<(&PlaylistId, &Playlist)> = inner
            .playlists
            .iter()
            .filter(|(_, p)| &p.user_id == user && !p.expired && p.items.first() == Some(item))
            .collect();
        matches.sort_by(|a, b| b.1.generated_at.cmp(&a.1.generated_at));
        Ok(matches
            .into_iter()
            .map(|(id, p)| PlaylistCandidate {
                playlist_id: *id,
                external_playlist_id: p.external_playlist_id.clone(),
                second_item_id: p.items.get(1).cloned(),
            })
            .collect())
    }

    fn track_runtime(&self, item: &ItemId) -> Result<Option<f64>, StoreError> {
        Ok(self.read()?.runtimes.get(item).copied())
    }

    fn item_title(&self, item: &ItemId) -> Result<Option<String>, StoreError> {
        Ok(self.read()?.titles.get(item).cloned())
    }

    fn playlist_total_runtime(&self, playlist: PlaylistId) -> Result<f64, StoreError> {
        let inner = self.read()?;
        Ok(inner.playlists.get(&playlist).map_or(0.0, |p| {
            p.items
                .iter()
                .filter_map(|i| inner.runtimes.get(i))
                .sum()
        }))
    }
}

impl SessionStore for MemoryStore {
    fn upsert_session(&self, session: &SessionUpsert<'_>) -> Result<SessionId, StoreError> {
        let mut inner = self.write()?;
        if inner.failing_upserts > 0 {
            inner.failing_upserts -= 1;
            return Err(injected());
        }
        let existing = inner
            .sessions
            .values_mut()
            .find(|row| &row.user_id == session.user_id && row.playlist_id == session.playlist_id && !row.is_complete);
        if let Some(row) = existing {
            row.current_index = session.current_index;
            row.is_confirmed = session.is_confirmed;
            row.last_seen = session.seen_at;
            return Ok(row.session_id);
        }
        let id = SessionId(i64::try_from(inner.sessions.len()).unwrap() + 1);
        inner.sessions.insert(
            id,
            SessionRow {
                session_id: id,
                user_id: session.user_id.clone(),
                playlist_id: session.playlist_id,
                external_playlist_id: session.external_playlist_id.map(str::to_string),
                current_index: session.current_index,
                last_seen: session.seen_at,
                is_confirmed: session.is_confirmed,
                is_complete: false,
            },
        );
        Ok(id)
    }

    fn record_track_completion(
        &self,
        session: SessionId,
        item: &ItemId,
        index: u32,
        seconds: f64,
    ) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        if inner.fail_completions {
            return Err(injected());
        }
        inner.completions.push(Completion {
            session_id: session,
            item_id: item.clone(),
            index,
            seconds,
        });
        Ok(())
    }

    fn mark_session_complete(&self, session: SessionId) -> Result<(), StoreError> {
        if let Some(row) = self.write()?.sessions.get_mut(&session) {
            row.is_complete = true;
        }
        Ok(())
    }

    fn find_recent_incomplete_session(
        &self,
        user: &UserId,
        since: DateTime<Utc>,
    ) -> Result<Option<SessionRow>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .sessions
            .values()
            .filter(|row| &row.user_id == user && !row.is_complete && row.last_seen >= since)
            .max_by_key(|row| row.last_seen)
            .cloned())
    }

    fn session_listen_time(&self, session: SessionId) -> Result<f64, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .completions
            .iter()
            .filter(|c| c.session_id == session)
            .map(|c| c.seconds)
            .sum())
    }
}

impl ListeningStore for MemoryStore {
    fn flush_hourly(&self, rows: &[HourlyListening]) -> Result<usize, StoreError> {
        self.write()?.hourly.extend_from_slice(rows);
        Ok(rows.len())
    }
}

impl IdentityResolver for MemoryStore {
    fn resolve(&self, external: &ExternalUserId) -> Result<Option<Identity>, StoreError> {
        Ok(self.read()?.identities.get(external).cloned())
    }
}
