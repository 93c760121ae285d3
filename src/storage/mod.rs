//! Persistent state: tenants and the append-only sync log.
//!
//! One sqlite file, WAL mode, a single connection guarded by a parking_lot
//! mutex (we handle our own locking; sqlite's is disabled).

pub mod sync_log_store;
pub mod tenant_store;

pub use sync_log_store::SyncLogStore;
pub use tenant_store::TenantStore;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};

pub type SharedConnection = Arc<Mutex<Connection>>;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS tenants (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    marketplace TEXT NOT NULL,
    marketplace_credentials_enc TEXT NOT NULL,
    spreadsheet_credentials_enc TEXT NOT NULL,
    spreadsheet_id TEXT NOT NULL,
    worksheet_name TEXT NOT NULL,
    cadence_hours INTEGER NOT NULL DEFAULT 24,
    paused INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS sync_logs (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    started_at INTEGER NOT NULL,
    finished_at INTEGER NOT NULL,
    status TEXT NOT NULL,
    partial_reason TEXT,
    products_processed INTEGER NOT NULL DEFAULT 0,
    products_failed INTEGER NOT NULL DEFAULT 0,
    orders_fetched_raw INTEGER NOT NULL DEFAULT 0,
    orders_after_filter INTEGER NOT NULL DEFAULT 0,
    error_kind TEXT,
    error_message TEXT,
    flags TEXT NOT NULL DEFAULT '[]',
    duration_ms INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_sync_logs_tenant_started
    ON sync_logs(tenant_id, started_at DESC);
"#;

pub fn open_database(db_path: &str) -> Result<SharedConnection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;

    let conn = Connection::open_with_flags(db_path, flags)
        .with_context(|| format!("Failed to open database at {}", db_path))?;

    conn.execute_batch(SCHEMA_SQL)
        .context("Failed to initialize database schema")?;

    let journal_mode: String = conn
        .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        .unwrap_or_default();
    if journal_mode.to_lowercase() != "wal" {
        warn!("WAL mode not active, journal_mode = {}", journal_mode);
    }

    let tenant_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM tenants", [], |row| row.get(0))
        .unwrap_or(0);
    info!(db_path, tenants = tenant_count, "Database initialized");

    Ok(Arc::new(Mutex::new(conn)))
}

#[cfg(test)]
pub(crate) fn open_test_database() -> (SharedConnection, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("test.db");
    let conn = open_database(path.to_str().unwrap()).expect("open test db");
    (conn, dir)
}
