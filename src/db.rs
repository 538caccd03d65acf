//! Embedded SQLite storage for meetings, summaries and settings.
//!
//! The schema is migration-managed and applied on open, so a database
//! created by an older build is upgraded in place.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rusqlite_migration::{Migrations, M};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;

/// Language codes the UI offers. The empty string means "not set".
pub const VALID_LANGUAGES: &[&str] = &["", "yue", "en", "zh"];

/// A stored meeting with its audio reference and transcript columns.
///
/// `transcription` holds the raw whisper output (and subsequent manual
/// edits); `transcription_with_speaker` holds the LLM-reviewed,
/// speaker-attributed variant.
#[derive(Debug, Clone, Serialize)]
pub struct Meeting {
    pub id: String,
    pub title: String,
    pub audio_file_path: Option<String>,
    pub transcription: Option<String>,
    pub transcription_with_speaker: Option<String>,
    pub language: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Slim row for the sidebar meeting list.
#[derive(Debug, Clone, Serialize)]
pub struct MeetingListEntry {
    pub id: String,
    pub title: String,
    pub language: String,
    pub created_at: String,
}

pub struct Database {
    conn: Mutex<Connection>,
}

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "CREATE TABLE meetings (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                audio_file_path TEXT,
                transcription TEXT,
                transcription_with_speaker TEXT,
                language TEXT DEFAULT 'en',
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );",
        ),
        M::up(
            "CREATE TABLE settings (
                key TEXT PRIMARY KEY,
                value TEXT
            );",
        ),
        M::up(
            "CREATE TABLE summaries (
                id TEXT PRIMARY KEY,
                meeting_id TEXT,
                content TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (meeting_id) REFERENCES meetings (id)
            );",
        ),
    ])
}

fn meeting_from_row(row: &Row) -> rusqlite::Result<Meeting> {
    Ok(Meeting {
        id: row.get("id")?,
        title: row.get("title")?,
        audio_file_path: row.get("audio_file_path")?,
        transcription: row.get("transcription")?,
        transcription_with_speaker: row.get("transcription_with_speaker")?,
        language: row.get("language")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Database {
    /// Open (or create) the database at `path` and bring the schema up
    /// to date.
    pub fn open(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrations()
            .to_latest(&mut conn)
            .context("failed to run database migrations")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert_meeting(
        &self,
        id: &str,
        title: &str,
        audio_file_path: Option<&str>,
        language: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO meetings (id, title, audio_file_path, language, transcription_with_speaker)
             VALUES (?1, ?2, ?3, ?4, '')",
            params![id, title, audio_file_path, language],
        )?;
        Ok(())
    }

    pub fn list_meetings(&self) -> Result<Vec<MeetingListEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, language, created_at FROM meetings ORDER BY created_at DESC",
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok(MeetingListEntry {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    language: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn get_meeting(&self, id: &str) -> Result<Option<Meeting>> {
        let conn = self.conn.lock().unwrap();
        let meeting = conn
            .query_row(
                "SELECT * FROM meetings WHERE id = ?1",
                params![id],
                meeting_from_row,
            )
            .optional()?;
        Ok(meeting)
    }

    /// Delete a meeting and its summaries in one transaction. Returns
    /// whether the meeting existed.
    pub fn delete_meeting(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        // Summaries reference the meeting, so they go first.
        tx.execute("DELETE FROM summaries WHERE meeting_id = ?1", params![id])?;
        let deleted = tx.execute("DELETE FROM meetings WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    /// Store a fresh transcription into both transcript columns, as a
    /// completed whisper run seeds the speaker transcript too.
    pub fn set_transcriptions(&self, id: &str, raw: &str, with_speaker: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE meetings SET transcription = ?1, transcription_with_speaker = ?2,
             updated_at = CURRENT_TIMESTAMP WHERE id = ?3",
            params![raw, with_speaker, id],
        )?;
        Ok(changed > 0)
    }

    pub fn update_transcription(&self, id: &str, text: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE meetings SET transcription = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![text, id],
        )?;
        Ok(changed > 0)
    }

    pub fn update_speaker_transcription(&self, id: &str, text: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE meetings SET transcription_with_speaker = ?1,
             updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![text, id],
        )?;
        Ok(changed > 0)
    }

    pub fn update_language(&self, id: &str, language: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE meetings SET language = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![language, id],
        )?;
        Ok(changed > 0)
    }

    pub fn insert_summary(&self, id: &str, meeting_id: &str, content: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO summaries (id, meeting_id, content) VALUES (?1, ?2, ?3)",
            params![id, meeting_id, content],
        )?;
        Ok(())
    }

    /// Most recent summary for a meeting, if any.
    pub fn latest_summary(&self, meeting_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let content = conn
            .query_row(
                "SELECT content FROM summaries WHERE meeting_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![meeting_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(content)
    }

    /// All stored settings rows as `(key, value)` pairs.
    pub fn settings_rows(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn upsert_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}
