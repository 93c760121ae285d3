//! Tenant rows: identity, encrypted credential blobs, sheet destination,
//! cadence. Deleting a tenant cascades to its sync logs; the caller is
//! responsible for flushing the cache and rate-limiter keyspaces.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Row};
use tracing::info;

use crate::error::{SyncError, SyncResult};
use crate::models::{MarketplaceKind, Tenant};
use crate::storage::SharedConnection;

pub struct NewTenant {
    pub name: String,
    pub marketplace: MarketplaceKind,
    pub marketplace_credentials_enc: String,
    pub spreadsheet_credentials_enc: String,
    pub spreadsheet_id: String,
    pub worksheet_name: String,
    pub cadence_hours: u32,
}

pub struct TenantStore {
    conn: SharedConnection,
}

impl TenantStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    pub fn create(&self, new: NewTenant) -> SyncResult<Tenant> {
        let tenant = Tenant {
            id: uuid::Uuid::new_v4().to_string(),
            name: new.name,
            marketplace: new.marketplace,
            marketplace_credentials_enc: new.marketplace_credentials_enc,
            spreadsheet_credentials_enc: new.spreadsheet_credentials_enc,
            spreadsheet_id: new.spreadsheet_id,
            worksheet_name: new.worksheet_name,
            cadence_hours: new.cadence_hours,
            paused: false,
            created_at: Utc::now(),
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tenants (id, name, marketplace, marketplace_credentials_enc, \
                 spreadsheet_credentials_enc, spreadsheet_id, worksheet_name, \
                 cadence_hours, paused, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
            params![
                tenant.id,
                tenant.name,
                tenant.marketplace.as_str(),
                tenant.marketplace_credentials_enc,
                tenant.spreadsheet_credentials_enc,
                tenant.spreadsheet_id,
                tenant.worksheet_name,
                tenant.cadence_hours,
                tenant.created_at.timestamp(),
            ],
        )?;

        info!(tenant_id = %tenant.id, name = %tenant.name, "Tenant created");
        Ok(tenant)
    }

    pub fn get(&self, tenant_id: &str) -> SyncResult<Option<Tenant>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, marketplace, marketplace_credentials_enc, \
                    spreadsheet_credentials_enc, spreadsheet_id, worksheet_name, \
                    cadence_hours, paused, created_at \
             FROM tenants WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map([tenant_id], row_to_tenant)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Tenants eligible for scheduling (not paused), oldest first.
    pub fn list_active(&self) -> SyncResult<Vec<Tenant>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, marketplace, marketplace_credentials_enc, \
                    spreadsheet_credentials_enc, spreadsheet_id, worksheet_name, \
                    cadence_hours, paused, created_at \
             FROM tenants WHERE paused = 0 ORDER BY created_at",
        )?;
        let tenants = stmt
            .query_map([], row_to_tenant)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tenants)
    }

    pub fn set_paused(&self, tenant_id: &str, paused: bool) -> SyncResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tenants SET paused = ?2 WHERE id = ?1",
            params![tenant_id, paused as i64],
        )?;
        if changed == 0 {
            return Err(SyncError::invalid_request(format!(
                "tenant {tenant_id} not found"
            )));
        }
        Ok(())
    }

    /// Replace both credential blobs (re-onboarding via the external API).
    pub fn update_credentials(
        &self,
        tenant_id: &str,
        marketplace_credentials_enc: &str,
        spreadsheet_credentials_enc: &str,
    ) -> SyncResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tenants SET marketplace_credentials_enc = ?2, \
                 spreadsheet_credentials_enc = ?3 WHERE id = ?1",
            params![
                tenant_id,
                marketplace_credentials_enc,
                spreadsheet_credentials_enc
            ],
        )?;
        if changed == 0 {
            return Err(SyncError::invalid_request(format!(
                "tenant {tenant_id} not found"
            )));
        }
        Ok(())
    }

    /// Remove the tenant; sync logs go with it (FK cascade).
    pub fn delete(&self, tenant_id: &str) -> SyncResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM tenants WHERE id = ?1", [tenant_id])?;
        if changed > 0 {
            info!(tenant_id, "Tenant deleted");
        }
        Ok(changed > 0)
    }
}

fn row_to_tenant(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    let marketplace_raw: String = row.get(2)?;
    let created_at_ts: i64 = row.get(9)?;
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        marketplace: MarketplaceKind::parse(&marketplace_raw)
            .unwrap_or(MarketplaceKind::Wildberries),
        marketplace_credentials_enc: row.get(3)?,
        spreadsheet_credentials_enc: row.get(4)?,
        spreadsheet_id: row.get(5)?,
        worksheet_name: row.get(6)?,
        cadence_hours: row.get::<_, i64>(7)? as u32,
        paused: row.get::<_, i64>(8)? != 0,
        created_at: Utc
            .timestamp_opt(created_at_ts, 0)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

/// Re-exported for row mapping in the log store.
pub(crate) fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_test_database;

    fn new_tenant(name: &str) -> NewTenant {
        NewTenant {
            name: name.to_string(),
            marketplace: MarketplaceKind::Wildberries,
            marketplace_credentials_enc: "enc-mp".to_string(),
            spreadsheet_credentials_enc: "enc-sheet".to_string(),
            spreadsheet_id: "sheet-1".to_string(),
            worksheet_name: "Inventory".to_string(),
            cadence_hours: 24,
        }
    }

    #[test]
    fn test_create_and_get() {
        let (conn, _dir) = open_test_database();
        let store = TenantStore::new(conn);
        let created = store.create(new_tenant("Acme")).unwrap();
        let got = store.get(&created.id).unwrap().unwrap();
        assert_eq!(got.name, "Acme");
        assert_eq!(got.marketplace, MarketplaceKind::Wildberries);
        assert_eq!(got.cadence_hours, 24);
        assert!(!got.paused);
    }

    #[test]
    fn test_list_active_excludes_paused() {
        let (conn, _dir) = open_test_database();
        let store = TenantStore::new(conn);
        let a = store.create(new_tenant("A")).unwrap();
        let _b = store.create(new_tenant("B")).unwrap();
        store.set_paused(&a.id, true).unwrap();
        let active = store.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "B");
    }

    #[test]
    fn test_update_credentials() {
        let (conn, _dir) = open_test_database();
        let store = TenantStore::new(conn);
        let t = store.create(new_tenant("A")).unwrap();
        store.update_credentials(&t.id, "new-mp", "new-sheet").unwrap();
        let got = store.get(&t.id).unwrap().unwrap();
        assert_eq!(got.marketplace_credentials_enc, "new-mp");
        assert_eq!(got.spreadsheet_credentials_enc, "new-sheet");
    }

    #[test]
    fn test_delete_missing_tenant() {
        let (conn, _dir) = open_test_database();
        let store = TenantStore::new(conn);
        assert!(!store.delete("nope").unwrap());
        assert!(store.set_paused("nope", true).is_err());
    }
}
