use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub mod migrations;

use crate::config::DatabaseConfig;
use crate::error::CollectorError;
use crate::plan::Record;

/// SQLite-backed persistence for sessions, pages, records and checkpoints
pub struct StorageManager {
    connection: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Running,
    Interrupted,
    Completed,
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Created => "created",
            SessionStatus::Running => "running",
            SessionStatus::Interrupted => "interrupted",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "created" => Ok(SessionStatus::Created),
            "running" => Ok(SessionStatus::Running),
            "interrupted" => Ok(SessionStatus::Interrupted),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid session status: {}", s)),
        }
    }
}

/// Persisted collection session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub status: SessionStatus,
    pub plan_yaml: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub pages_visited: u64,
    pub records_collected: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub metrics_json: Option<String>,
}

/// Snapshot of the frontier and counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub session_id: String,
    pub sequence: u64,
    pub pending: Vec<String>,
    pub pages_visited: u64,
    pub records_collected: u64,
    pub failures: u64,
    pub created_at: DateTime<Utc>,
}

/// What happened to one URL
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    Fetched { http_status: u16 },
    Failed { error: String },
    Skipped { reason: String },
}

impl PageOutcome {
    fn status(&self) -> &'static str {
        match self {
            PageOutcome::Fetched { .. } => "ok",
            PageOutcome::Failed { .. } => "failed",
            PageOutcome::Skipped { .. } => "skipped",
        }
    }
}

/// A failed page row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedPage {
    pub url: String,
    pub error: String,
    pub fetched_at: DateTime<Utc>,
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ms.div_euclid(1000), (ms.rem_euclid(1000) * 1_000_000) as u32)
        .unwrap_or_else(Utc::now)
}

const SESSION_COLUMNS: &str = "id, name, status, plan_yaml, created_at, updated_at,
     pages_visited, records_collected, failures, last_error, metrics_json";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        name: row.get(1)?,
        status: row.get::<_, String>(2)?.parse().unwrap_or(SessionStatus::Failed),
        plan_yaml: row.get(3)?,
        created_at: from_millis(row.get(4)?),
        updated_at: from_millis(row.get(5)?),
        pages_visited: row.get::<_, i64>(6)? as u64,
        records_collected: row.get::<_, i64>(7)? as u64,
        failures: row.get::<_, i64>(8)? as u64,
        last_error: row.get(9)?,
        metrics_json: row.get(10)?,
    })
}

impl StorageManager {
    /// Open (or create) the database file and migrate it
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Opening session database: {}", config.path.display());

        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let connection = Connection::open(&config.path)?;
        if config.enable_wal {
            let mode: String = connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            debug!("SQLite journal mode: {}", mode);
        }

        Self::from_connection(connection, Some(config.path.clone()))
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(connection: Connection, path: Option<PathBuf>) -> Result<Self> {
        connection.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrations::run_migrations(&connection)?;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            path,
        })
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    pub async fn create_session(&self, id: &str, name: &str, plan_yaml: &str) -> Result<Session> {
        let conn = self.connection.lock().await;
        let now = Utc::now();

        conn.execute(
            "INSERT INTO sessions (id, name, status, plan_yaml, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, name, SessionStatus::Created.to_string(), plan_yaml, to_millis(now)],
        )?;

        debug!("Created session {}", id);
        let session = conn.query_row(
            &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
            params![id],
            session_from_row,
        )?;
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.connection.lock().await;
        let session = conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                params![id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    pub async fn list_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            SESSION_COLUMNS
        ))?;

        let sessions = stmt
            .query_map(params![limit as i64], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    pub async fn update_status(&self, id: &str, status: SessionStatus, last_error: Option<&str>) -> Result<()> {
        let conn = self.connection.lock().await;
        let updated = conn.execute(
            "UPDATE sessions SET status = ?1, last_error = COALESCE(?2, last_error), updated_at = ?3
             WHERE id = ?4",
            params![status.to_string(), last_error, to_millis(Utc::now()), id],
        )?;

        if updated == 0 {
            return Err(CollectorError::SessionNotFound { session_id: id.to_string() }.into());
        }
        debug!("Session {} is now {}", id, status);
        Ok(())
    }

    pub async fn store_metrics(&self, id: &str, metrics_json: &str) -> Result<()> {
        let conn = self.connection.lock().await;
        let updated = conn.execute(
            "UPDATE sessions SET metrics_json = ?1, updated_at = ?2 WHERE id = ?3",
            params![metrics_json, to_millis(Utc::now()), id],
        )?;
        if updated == 0 {
            return Err(CollectorError::SessionNotFound { session_id: id.to_string() }.into());
        }
        Ok(())
    }

    /// Delete a session and, through cascades, everything it owns
    pub async fn delete_session(&self, id: &str) -> Result<bool> {
        let conn = self.connection.lock().await;
        let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        if deleted > 0 {
            info!("Deleted session {}", id);
        }
        Ok(deleted > 0)
    }

    /// Store a page, its records and the pagination links it led to in one transaction
    ///
    /// Returns `false` when the URL is already recorded for the session.
    /// A previously failed page is replaced.
    pub async fn record_page(
        &self,
        session_id: &str,
        url: &str,
        outcome: &PageOutcome,
        records: &[Record],
        next_links: &[String],
    ) -> Result<bool> {
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction()?;
        let now = to_millis(Utc::now());

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, status FROM pages WHERE session_id = ?1 AND url = ?2",
                params![session_id, url],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((page_id, status)) = existing {
            if status != "failed" {
                debug!("Page already recorded for session {}: {}", session_id, url);
                return Ok(false);
            }
            tx.execute("DELETE FROM pages WHERE id = ?1", params![page_id])?;
        }

        let (http_status, error) = match outcome {
            PageOutcome::Fetched { http_status } => (Some(*http_status as i64), None),
            PageOutcome::Failed { error } => (None, Some(error.as_str())),
            PageOutcome::Skipped { reason } => (None, Some(reason.as_str())),
        };

        let links_json = if next_links.is_empty() {
            None
        } else {
            Some(serde_json::to_string(next_links)?)
        };

        tx.execute(
            "INSERT INTO pages
                (session_id, url, status, http_status, error, record_count, next_links_json, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session_id,
                url,
                outcome.status(),
                http_status,
                error,
                records.len() as i64,
                links_json,
                now
            ],
        )?;
        let page_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare("INSERT INTO records (session_id, page_id, data_json) VALUES (?1, ?2, ?3)")?;
            for record in records {
                stmt.execute(params![session_id, page_id, serde_json::to_string(record)?])?;
            }
        }

        let updated = tx.execute(
            "UPDATE sessions SET
                pages_visited = (SELECT COUNT(*) FROM pages WHERE session_id = ?1 AND status = 'ok'),
                failures = (SELECT COUNT(*) FROM pages WHERE session_id = ?1 AND status = 'failed'),
                records_collected = (SELECT COUNT(*) FROM records WHERE session_id = ?1),
                updated_at = ?2
             WHERE id = ?1",
            params![session_id, now],
        )?;
        if updated == 0 {
            return Err(CollectorError::SessionNotFound { session_id: session_id.to_string() }.into());
        }

        tx.commit()?;
        Ok(true)
    }

    /// URLs already handled for a session, optionally counting failed ones
    pub async fn visited_urls(&self, session_id: &str, include_failed: bool) -> Result<Vec<String>> {
        let conn = self.connection.lock().await;
        let sql = if include_failed {
            "SELECT url FROM pages WHERE session_id = ?1 ORDER BY id"
        } else {
            "SELECT url FROM pages WHERE session_id = ?1 AND status != 'failed' ORDER BY id"
        };
        let mut stmt = conn.prepare(sql)?;
        let urls = stmt
            .query_map(params![session_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(urls)
    }

    /// Pagination links recorded with fetched pages, in discovery order
    pub async fn discovered_links(&self, session_id: &str) -> Result<Vec<String>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT next_links_json FROM pages
             WHERE session_id = ?1 AND status = 'ok' AND next_links_json IS NOT NULL ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut links = Vec::new();
        for json in rows {
            let page_links: Vec<String> = serde_json::from_str(&json)
                .map_err(|e| CollectorError::storage(format!("Corrupt page links in session {}: {}", session_id, e)))?;
            links.extend(page_links);
        }
        Ok(links)
    }

    pub async fn failed_pages(&self, session_id: &str) -> Result<Vec<FailedPage>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT url, error, fetched_at FROM pages
             WHERE session_id = ?1 AND status = 'failed' ORDER BY id",
        )?;
        let pages = stmt
            .query_map(params![session_id], |row| {
                Ok(FailedPage {
                    url: row.get(0)?,
                    error: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    fetched_at: from_millis(row.get(2)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pages)
    }

    /// All records of a session in collection order
    pub async fn load_records(&self, session_id: &str) -> Result<Vec<Record>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare("SELECT data_json FROM records WHERE session_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for json in rows {
            let record: Record = serde_json::from_str(&json)
                .map_err(|e| CollectorError::storage(format!("Corrupt record in session {}: {}", session_id, e)))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Append a checkpoint with the next sequence number and the session's current counters
    pub async fn save_checkpoint(&self, session_id: &str, pending: &[String]) -> Result<Checkpoint> {
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now();

        let counters: Option<(i64, i64, i64)> = tx
            .query_row(
                "SELECT pages_visited, records_collected, failures FROM sessions WHERE id = ?1",
                params![session_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (pages_visited, records_collected, failures) = counters
            .ok_or_else(|| CollectorError::SessionNotFound { session_id: session_id.to_string() })?;

        let sequence: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM checkpoints WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO checkpoints
                (session_id, sequence, pending_json, pages_visited, records_collected, failures, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id,
                sequence,
                serde_json::to_string(pending)?,
                pages_visited,
                records_collected,
                failures,
                to_millis(now)
            ],
        )?;
        tx.commit()?;

        debug!("Checkpoint {} saved for session {} ({} pending)", sequence, session_id, pending.len());
        Ok(Checkpoint {
            session_id: session_id.to_string(),
            sequence: sequence as u64,
            pending: pending.to_vec(),
            pages_visited: pages_visited as u64,
            records_collected: records_collected as u64,
            failures: failures as u64,
            created_at: now,
        })
    }

    pub async fn latest_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.connection.lock().await;
        let row = conn
            .query_row(
                "SELECT sequence, pending_json, pages_visited, records_collected, failures, created_at
                 FROM checkpoints WHERE session_id = ?1 ORDER BY sequence DESC LIMIT 1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((sequence, pending_json, pages_visited, records_collected, failures, created_at)) = row else {
            return Ok(None);
        };

        let pending: Vec<String> = serde_json::from_str(&pending_json)
            .map_err(|e| CollectorError::storage(format!("Corrupt checkpoint for {}: {}", session_id, e)))?;

        Ok(Some(Checkpoint {
            session_id: session_id.to_string(),
            sequence: sequence as u64,
            pending,
            pages_visited: pages_visited as u64,
            records_collected: records_collected as u64,
            failures: failures as u64,
            created_at: from_millis(created_at),
        }))
    }
}
