// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SQLite-backed persisted session store.
//!
//! One row per channel. Only read at startup for recovery; while a session
//! is live the in-memory registry is the source of truth.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
#[cfg(feature = "telemetry")]
use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StoreError;
#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use super::types::{SessionRecord, SessionState};

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Database file name inside the data directory.
pub const DB_FILE: &str = "sessions.db";

/// Persisted session store.
pub struct SessionStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SessionStore {
    /// Open or create `<data_dir>/sessions.db`.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let result = Self::open_at(&data_dir.join(DB_FILE));

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("store.open", start.elapsed());

        result
    }

    /// Open or create a session database at a specific path.
    pub fn open_at(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create directory: {}", e)))?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| StoreError::Open(format!("Failed to open sessions database: {}", e)))?;

        // WAL keeps readers (afk sessions) off the daemon's writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::Open(format!("Failed to set pragmas: {}", e)))?;

        let store = Self {
            conn: Mutex::new(conn),
            path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS sessions (
                channel_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                project_name TEXT NOT NULL,
                project_root TEXT NOT NULL,
                workspace_path TEXT NOT NULL,
                branch TEXT NOT NULL,
                resume_token TEXT,
                state TEXT NOT NULL,
                verbose INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_name);
            "#,
        )
        .map_err(|e| StoreError::Open(format!("Failed to create schema: {}", e)))?;

        let current_version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;

        if current_version.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?)",
                params![SCHEMA_VERSION],
            )?;
        }
        Ok(())
    }

    /// Insert or replace a record.
    pub fn upsert(&self, record: &SessionRecord) -> Result<(), StoreError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        self.conn().execute(
            r#"
            INSERT INTO sessions (
                channel_id, name, project_name, project_root, workspace_path,
                branch, resume_token, state, verbose, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(channel_id) DO UPDATE SET
                name = excluded.name,
                project_name = excluded.project_name,
                project_root = excluded.project_root,
                workspace_path = excluded.workspace_path,
                branch = excluded.branch,
                resume_token = excluded.resume_token,
                state = excluded.state,
                verbose = excluded.verbose,
                updated_at = excluded.updated_at
            "#,
            params![
                record.channel_id,
                record.name,
                record.project_name,
                record.project_root.to_string_lossy(),
                record.workspace_path.to_string_lossy(),
                record.branch,
                record.resume_token,
                record.state.as_str(),
                record.verbose,
                record.created_at.timestamp_millis(),
                Utc::now().timestamp_millis(),
            ],
        )?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("store.upsert", start.elapsed());

        Ok(())
    }

    /// Delete a record. Returns whether it existed.
    pub fn remove(&self, channel_id: &str) -> Result<bool, StoreError> {
        let rows = self
            .conn()
            .execute("DELETE FROM sessions WHERE channel_id = ?", params![channel_id])?;
        Ok(rows > 0)
    }

    pub fn get(&self, channel_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                &format!("{} WHERE channel_id = ?", SELECT_SESSIONS),
                params![channel_id],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    /// Every record, oldest first.
    ///
    /// A row that cannot be decoded fails the whole load as `Corrupted`;
    /// use [`load_all_lenient`](Self::load_all_lenient) to skip such rows.
    pub fn load_all(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.load_raw()?
            .into_iter()
            .map(RawRecord::into_record)
            .collect()
    }

    /// Every decodable record plus the errors for rows that were not.
    pub fn load_all_lenient(&self) -> Result<(Vec<SessionRecord>, Vec<StoreError>), StoreError> {
        let mut records = Vec::new();
        let mut errors = Vec::new();
        for raw in self.load_raw()? {
            match raw.into_record() {
                Ok(record) => records.push(record),
                Err(e) => errors.push(e),
            }
        }
        Ok((records, errors))
    }

    fn load_raw(&self) -> Result<Vec<RawRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{} ORDER BY created_at ASC", SELECT_SESSIONS))?;
        let rows = stmt.query_map([], RawRecord::from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

const SELECT_SESSIONS: &str = "SELECT channel_id, name, project_name, project_root, \
     workspace_path, branch, resume_token, state, verbose, created_at FROM sessions";

/// Row as stored, before validation.
struct RawRecord {
    channel_id: String,
    name: String,
    project_name: String,
    project_root: String,
    workspace_path: String,
    branch: String,
    resume_token: Option<String>,
    state: String,
    verbose: bool,
    created_at: i64,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            channel_id: row.get(0)?,
            name: row.get(1)?,
            project_name: row.get(2)?,
            project_root: row.get(3)?,
            workspace_path: row.get(4)?,
            branch: row.get(5)?,
            resume_token: row.get(6)?,
            state: row.get(7)?,
            verbose: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<SessionRecord, StoreError> {
        let state: SessionState = self.state.parse().map_err(|message| StoreError::Corrupted {
            channel_id: self.channel_id.clone(),
            message,
        })?;
        let created_at: DateTime<Utc> = Utc
            .timestamp_millis_opt(self.created_at)
            .single()
            .ok_or_else(|| StoreError::Corrupted {
                channel_id: self.channel_id.clone(),
                message: format!("invalid created_at {}", self.created_at),
            })?;

        Ok(SessionRecord {
            channel_id: self.channel_id,
            name: self.name,
            project_name: self.project_name,
            project_root: PathBuf::from(self.project_root),
            workspace_path: PathBuf::from(self.workspace_path),
            branch: self.branch,
            resume_token: self.resume_token,
            state,
            verbose: self.verbose,
            created_at,
        })
    }
}
