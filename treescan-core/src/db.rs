//! Relational store for scans and their chunk records (SQLite)

use crate::error::ScanError;
use crate::worker::{ChunkPayload, FailureStage, FileFailure};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

const SCHEMA_VERSION: i32 = 1;

pub type ScanId = i64;

/// Scan lifecycle. A scan is created `running` and ends in exactly one of
/// the other states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Done,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// A row of `scans`
#[derive(Debug, Clone, Serialize)]
pub struct ScanRecord {
    pub id: ScanId,
    pub repo_url: String,
    pub status: ScanStatus,
    pub created_at: i64,
    pub finished_at: Option<i64>,
    pub error: Option<String>,
}

/// A row of `ast_chunks` without the blob
#[derive(Debug, Clone, Serialize)]
pub struct ChunkRecord {
    pub id: i64,
    pub scan_id: ScanId,
    pub file_sha256: String,
    pub relpath: String,
    pub lang: String,
    pub n_lines: i64,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Owner of the SQLite connection. Only the coordinating thread writes.
pub struct ScanDb {
    conn: Connection,
}

impl ScanDb {
    /// Open or create the database file
    pub fn open(path: &Path) -> crate::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// In-memory database (for testing)
    pub fn open_in_memory() -> crate::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn init_schema(conn: &Connection) -> crate::Result<()> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version != 0 && version != SCHEMA_VERSION {
            return Err(ScanError::SchemaVersionMismatch {
                found: version,
                expected: SCHEMA_VERSION,
            });
        }

        if version == 0 {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS scans (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo_url TEXT NOT NULL,
                    status TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    finished_at INTEGER,
                    error TEXT
                );

                CREATE TABLE IF NOT EXISTS ast_chunks (
                    id INTEGER PRIMARY KEY,
                    scan_id INTEGER NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
                    file_sha256 TEXT NOT NULL,
                    compressed_ast BLOB NOT NULL,
                    relpath TEXT NOT NULL,
                    lang TEXT NOT NULL,
                    n_lines INTEGER NOT NULL,
                    UNIQUE (scan_id, relpath)
                );

                CREATE INDEX IF NOT EXISTS idx_ast_chunks_sha ON ast_chunks(file_sha256);

                -- Files that were supported but could not be parsed
                CREATE TABLE IF NOT EXISTS scan_failures (
                    id INTEGER PRIMARY KEY,
                    scan_id INTEGER NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
                    relpath TEXT NOT NULL,
                    stage TEXT NOT NULL,
                    message TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_scan_failures_scan ON scan_failures(scan_id);
                ",
            )?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(())
    }

    /// Insert a scan in `running` state and return its id
    pub fn create_scan(&self, repo_url: &str) -> crate::Result<ScanId> {
        self.conn.execute(
            "INSERT INTO scans (repo_url, status, created_at) VALUES (?, ?, ?)",
            params![repo_url, ScanStatus::Running.as_str(), now_secs()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Move a scan to a terminal state
    pub fn finish_scan(
        &self,
        scan_id: ScanId,
        status: ScanStatus,
        error: Option<&str>,
    ) -> crate::Result<()> {
        let updated = self.conn.execute(
            "UPDATE scans SET status = ?, finished_at = ?, error = ? WHERE id = ?",
            params![status.as_str(), now_secs(), error, scan_id],
        )?;
        if updated == 0 {
            return Err(ScanError::ScanNotFound(scan_id));
        }
        Ok(())
    }

    /// Insert one batch of chunks and failures atomically
    pub fn insert_batch(
        &mut self,
        scan_id: ScanId,
        chunks: &[ChunkPayload],
        failures: &[FileFailure],
    ) -> crate::Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut insert_chunk = tx.prepare_cached(
                "INSERT INTO ast_chunks (scan_id, file_sha256, compressed_ast, relpath, lang, n_lines)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            for chunk in chunks {
                insert_chunk.execute(params![
                    scan_id,
                    chunk.file_sha256,
                    chunk.compressed_ast,
                    chunk.relpath,
                    chunk.lang,
                    chunk.n_lines as i64
                ])?;
            }

            let mut insert_failure = tx.prepare_cached(
                "INSERT INTO scan_failures (scan_id, relpath, stage, message) VALUES (?, ?, ?, ?)",
            )?;
            for failure in failures {
                insert_failure.execute(params![
                    scan_id,
                    failure.relpath,
                    failure.stage.as_str(),
                    failure.message
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_scan(&self, scan_id: ScanId) -> crate::Result<ScanRecord> {
        self.conn
            .query_row(
                "SELECT id, repo_url, status, created_at, finished_at, error FROM scans WHERE id = ?",
                params![scan_id],
                scan_from_row,
            )
            .optional()?
            .ok_or(ScanError::ScanNotFound(scan_id))
    }

    /// Most recent scans first
    pub fn list_scans(&self, limit: usize) -> crate::Result<Vec<ScanRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, repo_url, status, created_at, finished_at, error FROM scans
             ORDER BY id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit as i64], scan_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn count_chunks(&self, scan_id: ScanId) -> crate::Result<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM ast_chunks WHERE scan_id = ?",
            params![scan_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Chunks of a scan ordered by path, without blobs
    pub fn list_chunks(&self, scan_id: ScanId) -> crate::Result<Vec<ChunkRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, scan_id, file_sha256, relpath, lang, n_lines FROM ast_chunks
             WHERE scan_id = ? ORDER BY relpath",
        )?;
        let rows = stmt.query_map(params![scan_id], |row| {
            Ok(ChunkRecord {
                id: row.get(0)?,
                scan_id: row.get(1)?,
                file_sha256: row.get(2)?,
                relpath: row.get(3)?,
                lang: row.get(4)?,
                n_lines: row.get(5)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Compressed tree stored for `relpath` in a scan
    pub fn chunk_blob(&self, scan_id: ScanId, relpath: &str) -> crate::Result<Option<(String, Vec<u8>)>> {
        self.conn
            .query_row(
                "SELECT file_sha256, compressed_ast FROM ast_chunks WHERE scan_id = ? AND relpath = ?",
                params![scan_id, relpath],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list_failures(&self, scan_id: ScanId) -> crate::Result<Vec<FileFailure>> {
        let mut stmt = self.conn.prepare(
            "SELECT relpath, stage, message FROM scan_failures WHERE scan_id = ? ORDER BY relpath",
        )?;
        let rows = stmt.query_map(params![scan_id], |row| {
            let stage: String = row.get(1)?;
            Ok(FileFailure {
                relpath: row.get(0)?,
                stage: FailureStage::from_name(&stage).unwrap_or(FailureStage::Read),
                message: row.get(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

fn scan_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScanRecord> {
    let status: String = row.get(2)?;
    Ok(ScanRecord {
        id: row.get(0)?,
        repo_url: row.get(1)?,
        status: ScanStatus::from_name(&status).unwrap_or(ScanStatus::Failed),
        created_at: row.get(3)?,
        finished_at: row.get(4)?,
        error: row.get(5)?,
    })
}
