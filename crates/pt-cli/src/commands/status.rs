//! Status command for showing stored playlists, sessions and listening.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use chrono::SecondsFormat;
use pt_core::types::ticks_to_secs;
use pt_db::Database;

pub fn run<W: Write>(writer: &mut W, db: &Database, database_path: &Path, json: bool) -> Result<()> {
    let summary = db.summary()?;
    let open = db.open_sessions()?;

    if json {
        let output = serde_json::json!({
            "database": database_path.display().to_string(),
            "summary": summary,
            "open_sessions": open,
        });
        writeln!(writer, "{}", serde_json::to_string_pretty(&output)?)?;
        return Ok(());
    }

    writeln!(writer, "Playlist tracker status")?;
    writeln!(writer, "Database: {}", database_path.display())?;
    writeln!(writer, "Linked users: {}", summary.linked_users)?;
    writeln!(
        writer,
        "Playlists: {} ({} expired)",
        summary.playlists, summary.expired_playlists
    )?;
    writeln!(
        writer,
        "Sessions: {} open, {} completed",
        summary.open_sessions, summary.completed_sessions
    )?;
    writeln!(
        writer,
        "Tracks recorded: {} ({:.1}s listened)",
        summary.tracks_recorded, summary.listened_secs
    )?;
    writeln!(
        writer,
        "Hourly listening: {} rows ({:.1}s)",
        summary.hourly_rows,
        ticks_to_secs(summary.hourly_ticks)
    )?;

    if open.is_empty() {
        writeln!(writer, "No open sessions.")?;
        return Ok(());
    }

    writeln!(writer, "Open sessions:")?;
    for session in open {
        writeln!(
            writer,
            "- #{} {}: {}, track {}/{}, {}, last seen {}",
            session.session_id,
            session.user_id,
            session.playlist_name,
            session.current_index + 1,
            session.total_tracks,
            if session.is_confirmed {
                "confirmed"
            } else {
                "seeding"
            },
            session.last_seen.to_rfc3339_opts(SecondsFormat::Secs, true)
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{DateTime, Utc};
    use pt_core::store::{SessionStore, SessionUpsert};
    use pt_core::types::{ExternalUserId, ItemId, UserId};
    use pt_db::NewPlaylist;

    use insta::assert_snapshot;

    fn seeded(db_path: &Path) -> Database {
        let db = Database::open(db_path).unwrap();
        let user = UserId::new("u1").unwrap();
        db.link_user(&ExternalUserId::new("jf-1").unwrap(), &user, "Ada")
            .unwrap();
        for track in ["a", "b", "c"] {
            db.insert_item(&ItemId::new(track).unwrap(), track, Some(200.0))
                .unwrap();
        }
        let generated_at = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let playlist = db
            .insert_playlist(&NewPlaylist {
                user_id: user.clone(),
                name: "Morning mix".to_string(),
                external_playlist_id: None,
                items: ["a", "b", "c"]
                    .into_iter()
                    .map(|id| ItemId::new(id).unwrap())
                    .collect(),
                generated_at,
            })
            .unwrap();
        let session = db
            .upsert_session(&SessionUpsert {
                user_id: &user,
                playlist_id: playlist,
                external_playlist_id: None,
                current_index: 1,
                is_confirmed: true,
                seen_at: generated_at + chrono::TimeDelta::hours(10),
            })
            .unwrap();
        db.record_track_completion(session, &ItemId::new("a").unwrap(), 0, 200.0)
            .unwrap();
        db
    }

    #[test]
    fn status_command_outputs_summary_and_open_sessions() {
        let temp = tempfile::tempdir().unwrap();
        let db_path = temp.path().join("pt.db");
        let db = seeded(&db_path);

        let mut output = Vec::new();
        run(&mut output, &db, &db_path, false).unwrap();

        let output = String::from_utf8(output).unwrap();
        let output = output.replace(&db_path.display().to_string(), "[TEMP]/pt.db");
        assert_snapshot!(output, @r"
        Playlist tracker status
        Database: [TEMP]/pt.db
        Linked users: 1
        Playlists: 1 (0 expired)
        Sessions: 1 open, 0 completed
        Tracks recorded: 1 (200.0s listened)
        Hourly listening: 0 rows (0.0s)
        Open sessions:
        - #1 u1: Morning mix, track 2/3, confirmed, last seen 2025-01-01T10:00:00Z
        ");
    }

    #[test]
    fn status_command_on_empty_database() {
        let temp = tempfile::tempdir().unwrap();
        let db_path = temp.path().join("pt.db");
        let db = Database::open(&db_path).unwrap();

        let mut output = Vec::new();
        run(&mut output, &db, &db_path, false).unwrap();

        let output = String::from_utf8(output).unwrap();
        let output = output.replace(&db_path.display().to_string(), "[TEMP]/pt.db");
        assert_snapshot!(output, @r"
        Playlist tracker status
        Database: [TEMP]/pt.db
        Linked users: 0
        Playlists: 0 (0 expired)
        Sessions: 0 open, 0 completed
        Tracks recorded: 0 (0.0s listened)
        Hourly listening: 0 rows (0.0s)
        No open sessions.
        ");
    }

    #[test]
    fn status_json_includes_summary() {
        let temp = tempfile::tempdir().unwrap();
        let db_path = temp.path().join("pt.db");
        let db = seeded(&db_path);

        let mut output = Vec::new();
        run(&mut output, &db, &db_path, true).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(value["summary"]["open_sessions"], 1);
        assert_eq!(value["summary"]["tracks_recorded"], 1);
        assert_eq!(value["open_sessions"][0]["playlist_name"], "Morning mix");
        assert_eq!(value["open_sessions"][0]["current_index"], 1);
    }
}
