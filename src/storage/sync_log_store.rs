//! Append-only record of sync attempts.
//!
//! Every dispatched job ends in exactly one row here. The core never
//! prunes; retention is the operator's concern.

use rusqlite::{params, Row};

use crate::error::SyncResult;
use crate::models::{FailureClass, PartialReason, SyncLog, SyncStatus};
use crate::storage::{tenant_store::timestamp_to_datetime, SharedConnection};

pub struct SyncLogStore {
    conn: SharedConnection,
}

impl SyncLogStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    pub fn append(&self, log: &SyncLog) -> SyncResult<()> {
        let flags_json = serde_json::to_string(&log.flags)
            .unwrap_or_else(|_| "[]".to_string());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_logs (id, tenant_id, started_at, finished_at, status, \
                 partial_reason, products_processed, products_failed, \
                 orders_fetched_raw, orders_after_filter, error_kind, error_message, \
                 flags, duration_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                log.id,
                log.tenant_id,
                log.started_at.timestamp(),
                log.finished_at.timestamp(),
                log.status.as_str(),
                log.partial_reason.map(|r| r.as_str()),
                log.products_processed,
                log.products_failed,
                log.orders_fetched_raw,
                log.orders_after_filter,
                log.error_kind.map(|k| k.as_str()),
                log.error_message,
                flags_json,
                log.duration_ms,
            ],
        )?;
        Ok(())
    }

    pub fn latest_for_tenant(&self, tenant_id: &str) -> SyncResult<Option<SyncLog>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, started_at, finished_at, status, partial_reason, \
                    products_processed, products_failed, orders_fetched_raw, \
                    orders_after_filter, error_kind, error_message, flags, duration_ms \
             FROM sync_logs WHERE tenant_id = ?1 \
             ORDER BY started_at DESC, id LIMIT 1",
        )?;
        let mut rows = stmt.query_map([tenant_id], row_to_log)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Logs whose start falls within the last `days` days, newest first.
    pub fn recent_for_tenant(&self, tenant_id: &str, days: u32) -> SyncResult<Vec<SyncLog>> {
        let cutoff = chrono::Utc::now().timestamp() - i64::from(days) * 86_400;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, started_at, finished_at, status, partial_reason, \
                    products_processed, products_failed, orders_fetched_raw, \
                    orders_after_filter, error_kind, error_message, flags, duration_ms \
             FROM sync_logs WHERE tenant_id = ?1 AND started_at >= ?2 \
             ORDER BY started_at DESC",
        )?;
        let logs = stmt
            .query_map(params![tenant_id, cutoff], row_to_log)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    pub fn count_for_tenant(&self, tenant_id: &str) -> SyncResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_logs WHERE tenant_id = ?1",
            [tenant_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<SyncLog> {
    let status_raw: String = row.get(4)?;
    let partial_raw: Option<String> = row.get(5)?;
    let error_kind_raw: Option<String> = row.get(10)?;
    let flags_raw: String = row.get(12)?;

    Ok(SyncLog {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        started_at: timestamp_to_datetime(row.get(2)?),
        finished_at: timestamp_to_datetime(row.get(3)?),
        status: SyncStatus::parse(&status_raw).unwrap_or(SyncStatus::Failed),
        partial_reason: partial_raw.as_deref().and_then(PartialReason::parse),
        products_processed: row.get::<_, i64>(6)? as u32,
        products_failed: row.get::<_, i64>(7)? as u32,
        orders_fetched_raw: row.get::<_, i64>(8)? as u32,
        orders_after_filter: row.get::<_, i64>(9)? as u32,
        error_kind: error_kind_raw.as_deref().and_then(FailureClass::parse),
        error_message: row.get(11)?,
        flags: serde_json::from_str(&flags_raw).unwrap_or_default(),
        duration_ms: row.get(13)?,
    })
}
