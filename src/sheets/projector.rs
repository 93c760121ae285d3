//! Projects the merged product model into the tenant's worksheet.
//!
//! Layout: two header rows — categories on row 1, field names on row 2 —
//! then one row per product, with each warehouse occupying a dedicated
//! three-column group. Row identity is the seller article in column A.
//!
//! Quota discipline is the load-bearing contract here: one worksheet
//! resolution, one optional clear, one header verification, one existence
//! read, one batched write per cycle. The worksheet handle and the
//! existence map are threaded through the cycle; nothing re-resolves, and
//! per-product reads are forbidden.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{ErrorKind, SyncResult};
use crate::models::Product;
use crate::sheets::client::{SheetsClient, ValueRange};

pub const PRODUCT_CATEGORY_HEADER: &str = "Product";
pub const PRODUCT_FIELD_HEADERS: [&str; 6] = [
    "seller article",
    "nmId",
    "name",
    "totalOrders",
    "totalStock",
    "turnover",
];
pub const WAREHOUSE_FIELD_HEADERS: [&str; 3] = ["name", "orders", "stock"];

/// Worksheet titles from earlier deployments, renamed on first touch.
pub const LEGACY_WORKSHEET_NAMES: [&str; 2] = ["Остатки", "Stock"];

/// First data row, 1-indexed (rows 1–2 are headers).
const DATA_START_ROW: usize = 3;

/// Read budget per cycle; exceeding it is a bug in the calling sequence.
const READ_BUDGET: u32 = 8;

/// Resolved once per cycle and threaded through every operation.
pub struct WorksheetHandle {
    pub sheet_id: i64,
    pub title: String,
    reads_used: AtomicU32,
}

impl WorksheetHandle {
    fn new(sheet_id: i64, title: String) -> Self {
        Self {
            sheet_id,
            title,
            reads_used: AtomicU32::new(0),
        }
    }

    fn count_read(&self) {
        let used = self.reads_used.fetch_add(1, Ordering::Relaxed) + 1;
        if used > READ_BUDGET {
            warn!(
                worksheet = %self.title,
                reads = used,
                "Read budget exceeded for this cycle"
            );
        }
    }

    pub fn reads_used(&self) -> u32 {
        self.reads_used.load(Ordering::Relaxed)
    }
}

/// Column plan for one cycle: the union of warehouse names across all
/// products, ordered, so the projection is deterministic.
#[derive(Debug, Clone)]
pub struct Layout {
    pub warehouse_names: Vec<String>,
    pub window_days: u32,
}

impl Layout {
    pub fn from_products(products: &[Product], window_days: u32) -> Self {
        let mut names: Vec<String> = products
            .iter()
            .flat_map(|p| p.warehouses.iter().map(|w| w.name.clone()))
            .collect();
        names.sort();
        names.dedup();
        Self {
            warehouse_names: names,
            window_days: window_days.max(1),
        }
    }

    pub fn column_count(&self) -> usize {
        PRODUCT_FIELD_HEADERS.len() + self.warehouse_names.len() * WAREHOUSE_FIELD_HEADERS.len()
    }

    pub fn header_rows(&self) -> (Vec<Value>, Vec<Value>) {
        let mut categories: Vec<Value> = Vec::with_capacity(self.column_count());
        categories.push(json!(PRODUCT_CATEGORY_HEADER));
        categories.extend(std::iter::repeat(json!("")).take(PRODUCT_FIELD_HEADERS.len() - 1));
        for name in &self.warehouse_names {
            categories.push(json!(name));
            categories.extend(
                std::iter::repeat(json!("")).take(WAREHOUSE_FIELD_HEADERS.len() - 1),
            );
        }

        let mut fields: Vec<Value> = PRODUCT_FIELD_HEADERS.iter().map(|h| json!(h)).collect();
        for _ in &self.warehouse_names {
            fields.extend(WAREHOUSE_FIELD_HEADERS.iter().map(|h| json!(h)));
        }

        (categories, fields)
    }

    pub fn row_for(&self, product: &Product) -> Vec<Value> {
        let mut row: Vec<Value> = vec![
            json!(product.vendor_code),
            json!(product.nm_id),
            json!(product.name),
            json!(product.total_orders),
            json!(product.total_stock),
            turnover_cell(product.total_stock, product.total_orders, self.window_days),
        ];

        let by_name: HashMap<&str, &crate::models::Warehouse> = product
            .warehouses
            .iter()
            .map(|w| (w.name.as_str(), w))
            .collect();

        for name in &self.warehouse_names {
            match by_name.get(name.as_str()) {
                Some(w) => {
                    row.push(json!(w.name));
                    row.push(json!(w.orders));
                    row.push(json!(w.stock));
                }
                None => {
                    row.push(json!(""));
                    row.push(json!(""));
                    row.push(json!(""));
                }
            }
        }
        row
    }
}

/// Days of cover at the window's order rate; blank when nothing was ordered.
fn turnover_cell(stock: u32, orders: u32, window_days: u32) -> Value {
    if orders == 0 {
        return json!("");
    }
    let days = f64::from(stock) * f64::from(window_days) / f64::from(orders);
    json!(format!("{days:.1}"))
}

/// Trailing empty cells are not round-tripped by the API; normalize before
/// comparing stored headers with expected ones.
fn rows_match(actual: &[Vec<Value>], expected: &[Vec<Value>]) -> bool {
    let norm = |rows: &[Vec<Value>]| -> Vec<Vec<String>> {
        rows.iter()
            .map(|row| {
                let mut cells: Vec<String> = row
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .collect();
                while cells.last().map(|c| c.is_empty()).unwrap_or(false) {
                    cells.pop();
                }
                cells
            })
            .collect()
    };
    norm(actual) == norm(expected)
}

/// Column A values → seller article → 1-indexed sheet row.
fn parse_existence(values: &[Vec<Value>]) -> HashMap<String, usize> {
    let mut map = HashMap::with_capacity(values.len());
    for (idx, row) in values.iter().enumerate() {
        if let Some(article) = row.first().and_then(|v| v.as_str()) {
            if !article.is_empty() {
                // First occurrence wins; duplicates would be a prior bug.
                map.entry(article.to_string()).or_insert(DATA_START_ROW + idx);
            }
        }
    }
    map
}

#[derive(Debug, Clone, Copy)]
pub struct UpsertReport {
    pub rows_written: usize,
    pub retried: bool,
}

pub struct Projector {
    client: SheetsClient,
    retry_pause: Duration,
}

impl Projector {
    pub fn new(client: SheetsClient) -> Self {
        Self {
            client,
            retry_pause: Duration::from_secs(5),
        }
    }

    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    /// Locate the worksheet, renaming a legacy-titled one on first touch,
    /// creating it fresh otherwise. The handle stays valid for the cycle.
    pub async fn ensure_worksheet(&self, title: &str) -> SyncResult<WorksheetHandle> {
        let sheets = self.client.spreadsheet_meta().await?;
        let handle = if let Some(found) = sheets.iter().find(|s| s.title == title) {
            WorksheetHandle::new(found.sheet_id, found.title.clone())
        } else if let Some(legacy) = sheets
            .iter()
            .find(|s| LEGACY_WORKSHEET_NAMES.contains(&s.title.as_str()))
        {
            info!(from = %legacy.title, to = %title, "Renaming legacy worksheet");
            self.client.rename_sheet(legacy.sheet_id, title).await?;
            WorksheetHandle::new(legacy.sheet_id, title.to_string())
        } else {
            let sheet_id = self.client.add_sheet(title).await?;
            info!(worksheet = %title, "Created worksheet");
            WorksheetHandle::new(sheet_id, title.to_string())
        };
        handle.count_read();
        Ok(handle)
    }

    /// Confirm the two-header-row layout; rewrite both rows in a single
    /// batched update when it differs.
    pub async fn verify_schema(
        &self,
        handle: &WorksheetHandle,
        layout: &Layout,
    ) -> SyncResult<()> {
        let range = format!("'{}'!1:2", handle.title);
        let got: Vec<ValueRange> = self.client.values_batch_get(&[range]).await?;
        handle.count_read();

        let (categories, fields) = layout.header_rows();
        let expected = vec![categories, fields];
        let actual = got.first().map(|vr| vr.values.clone()).unwrap_or_default();

        if rows_match(&actual, &expected) {
            return Ok(());
        }

        info!(worksheet = %handle.title, "Rewriting header rows");
        self.client
            .values_batch_update(&[(format!("'{}'!A1", handle.title), expected)])
            .await
    }

    /// Remove data rows, keep headers.
    pub async fn clear_data(&self, handle: &WorksheetHandle) -> SyncResult<()> {
        self.client
            .values_clear(&format!("'{}'!A{}:ZZ", handle.title, DATA_START_ROW))
            .await
    }

    /// Write all products in one batched update. With
    /// `skip_existence_check` (valid right after `clear_data`) rows are laid
    /// out contiguously from the first data row; otherwise one full-range
    /// read of column A resolves row identities for the whole cycle.
    pub async fn upsert_products(
        &self,
        handle: &WorksheetHandle,
        layout: &Layout,
        products: &[Product],
        skip_existence_check: bool,
    ) -> SyncResult<UpsertReport> {
        let rows: Vec<Vec<Value>> = products.iter().map(|p| layout.row_for(p)).collect();
        if rows.is_empty() {
            return Ok(UpsertReport {
                rows_written: 0,
                retried: false,
            });
        }

        let data: Vec<(String, Vec<Vec<Value>>)> = if skip_existence_check {
            vec![(format!("'{}'!A{}", handle.title, DATA_START_ROW), rows)]
        } else {
            let range = format!("'{}'!A{}:A", handle.title, DATA_START_ROW);
            let got = self.client.values_batch_get(&[range]).await?;
            handle.count_read();
            let existing =
                parse_existence(&got.first().map(|vr| vr.values.as_slice()).unwrap_or(&[]));

            let mut next_free_row = DATA_START_ROW
                + got.first().map(|vr| vr.values.len()).unwrap_or(0);
            let mut data = Vec::with_capacity(rows.len());
            for (product, row) in products.iter().zip(rows) {
                let sheet_row = match existing.get(&product.vendor_code) {
                    Some(&row_idx) => row_idx,
                    None => {
                        let r = next_free_row;
                        next_free_row += 1;
                        r
                    }
                };
                data.push((format!("'{}'!A{}", handle.title, sheet_row), vec![row]));
            }
            data
        };

        let rows_written = data.iter().map(|(_, v)| v.len()).sum();
        let retried = self.write_with_quota_retry(&data).await?;

        info!(
            worksheet = %handle.title,
            rows = rows_written,
            reads_used = handle.reads_used(),
            retried,
            "Projection written"
        );
        Ok(UpsertReport {
            rows_written,
            retried,
        })
    }

    /// The single permitted write retry: quota errors get one more attempt
    /// after a pause; anything else propagates immediately.
    async fn write_with_quota_retry(
        &self,
        data: &[(String, Vec<Vec<Value>>)],
    ) -> SyncResult<bool> {
        match self.client.values_batch_update(data).await {
            Ok(()) => Ok(false),
            Err(e) if e.kind == ErrorKind::QuotaExceeded => {
                warn!(
                    pause_secs = self.retry_pause.as_secs(),
                    "Spreadsheet quota exhausted, retrying write once"
                );
                tokio::time::sleep(self.retry_pause).await;
                self.client.values_batch_update(data).await?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }
}
