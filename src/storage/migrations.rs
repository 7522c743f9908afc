use anyhow::Result;
use rusqlite::{params, Connection};
use tracing::info;

use crate::error::CollectorError;

/// Database schema version
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Run all necessary database migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current_version = get_schema_version(conn)?;
    if current_version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }
    info!("Migrating database schema from version {} to {}", current_version, CURRENT_SCHEMA_VERSION);

    for version in (current_version + 1)..=CURRENT_SCHEMA_VERSION {
        apply_migration(conn, version)
            .map_err(|e| {
                tracing::error!("Migration {} failed: {}", version, e);
                CollectorError::Migration { version }
            })?;
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![version, chrono::Utc::now().timestamp()],
        )?;
    }

    info!("Database migrations completed");
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => apply_migration_v1(conn),
        2 => apply_migration_v2(conn),
        3 => apply_migration_v3(conn),
        _ => Err(anyhow::anyhow!("Unknown migration version: {}", version)),
    }
}

/// v1: sessions, visited pages and their records
fn apply_migration_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE sessions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            plan_yaml TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            pages_visited INTEGER NOT NULL DEFAULT 0,
            records_collected INTEGER NOT NULL DEFAULT 0,
            failures INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        );

        CREATE TABLE pages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            url TEXT NOT NULL,
            status TEXT NOT NULL,
            http_status INTEGER,
            error TEXT,
            record_count INTEGER NOT NULL DEFAULT 0,
            fetched_at INTEGER NOT NULL,
            FOREIGN KEY (session_id) REFERENCES sessions (id) ON DELETE CASCADE,
            UNIQUE (session_id, url)
        );

        CREATE TABLE records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            page_id INTEGER NOT NULL,
            data_json TEXT NOT NULL,
            FOREIGN KEY (session_id) REFERENCES sessions (id) ON DELETE CASCADE,
            FOREIGN KEY (page_id) REFERENCES pages (id) ON DELETE CASCADE
        );

        CREATE INDEX idx_sessions_created_at ON sessions (created_at);
        CREATE INDEX idx_pages_session ON pages (session_id);
        CREATE INDEX idx_records_session ON records (session_id);
        COMMIT;",
    )?;
    Ok(())
}

/// v2: checkpoints and persisted run metrics
fn apply_migration_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE checkpoints (
            session_id TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            pending_json TEXT NOT NULL,
            pages_visited INTEGER NOT NULL,
            records_collected INTEGER NOT NULL,
            failures INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (session_id, sequence),
            FOREIGN KEY (session_id) REFERENCES sessions (id) ON DELETE CASCADE
        );

        ALTER TABLE sessions ADD COLUMN metrics_json TEXT;
        COMMIT;",
    )?;
    Ok(())
}

/// v3: pagination links discovered on each page
fn apply_migration_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;
        ALTER TABLE pages ADD COLUMN next_links_json TEXT;
        COMMIT;",
    )?;
    Ok(())
}
