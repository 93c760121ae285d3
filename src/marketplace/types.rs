//! Wire types for the marketplace endpoints.
//!
//! Field validation happens here at the boundary; inner code only ever sees
//! these fully-typed records.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Analytics v2: stocks report (aggregates)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StocksReportRequest {
    #[serde(rename = "currentPeriod")]
    pub current_period: ReportPeriod,
    #[serde(rename = "stockType")]
    pub stock_type: String,
    #[serde(rename = "skipDeletedNm")]
    pub skip_deleted_nm: bool,
    #[serde(rename = "availabilityFilters")]
    pub availability_filters: Vec<String>,
    #[serde(rename = "orderBy")]
    pub order_by: ReportOrderBy,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportPeriod {
    /// `YYYY-MM-DD`
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportOrderBy {
    pub field: String,
    pub mode: String,
}

impl StocksReportRequest {
    pub fn page(start: String, end: String, limit: u32, offset: u32) -> Self {
        Self {
            current_period: ReportPeriod { start, end },
            stock_type: String::new(),
            skip_deleted_nm: true,
            availability_filters: vec![
                "actual".to_string(),
                "balanced".to_string(),
                "deficient".to_string(),
            ],
            order_by: ReportOrderBy {
                field: "stockCount".to_string(),
                mode: "desc".to_string(),
            },
            limit,
            offset,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StocksReportResponse {
    pub data: StocksReportData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StocksReportData {
    #[serde(default)]
    pub items: Vec<ProductAggregate>,
}

/// One SKU from the aggregates endpoint. `metrics.stockCount` is the
/// authoritative total across all fulfillment modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductAggregate {
    #[serde(rename = "nmID")]
    pub nm_id: i64,
    #[serde(rename = "vendorCode", default)]
    pub vendor_code: String,
    #[serde(rename = "title", alias = "name", default)]
    pub title: String,
    pub metrics: AggregateMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateMetrics {
    #[serde(rename = "stockCount", default)]
    pub stock_count: u32,
    #[serde(rename = "ordersCount", default)]
    pub orders_count: u32,
}

// ---------------------------------------------------------------------------
// Analytics v1: warehouse remains (two-step async task)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RemainsTaskResponse {
    pub data: RemainsTaskData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemainsTaskData {
    #[serde(rename = "taskId")]
    pub task_id: String,
}

/// Per-product FBO breakdown. Authoritative for marketplace-operated stock
/// only; seller-fulfilled stock never appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseRemains {
    #[serde(rename = "nmId")]
    pub nm_id: i64,
    #[serde(rename = "vendorCode", default)]
    pub vendor_code: String,
    #[serde(default)]
    pub warehouses: Vec<RemainsWarehouse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemainsWarehouse {
    #[serde(alias = "warehouseName")]
    pub name: String,
    #[serde(default)]
    pub quantity: u32,
}

// ---------------------------------------------------------------------------
// Statistics v1: supplier orders
// ---------------------------------------------------------------------------

/// One order record. `srid` is the dedupe key across retries and
/// overlapping windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    #[serde(rename = "nmId")]
    pub nm_id: i64,
    #[serde(rename = "warehouseName", default)]
    pub warehouse_name: String,
    pub srid: String,
    #[serde(rename = "isCancel", default)]
    pub is_cancel: bool,
    #[serde(rename = "date", default)]
    pub date: Option<String>,
}

/// Aggregation window for the analytics request.
#[derive(Debug, Clone, Copy)]
pub struct AggregationWindow {
    pub start: chrono::NaiveDate,
    pub end: chrono::NaiveDate,
}

impl AggregationWindow {
    /// Window ending today, going back `days` (capped at 3 months, the
    /// endpoint's documented maximum).
    pub fn last_days(days: u32) -> Self {
        let end = chrono::Utc::now().date_naive();
        let days = days.min(90).max(1);
        let start = end - chrono::Duration::days(i64::from(days) - 1);
        Self { start, end }
    }

    pub fn start_str(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }

    pub fn end_str(&self) -> String {
        self.end.format("%Y-%m-%d").to_string()
    }

    pub fn days(&self) -> u32 {
        ((self.end - self.start).num_days() + 1).max(1) as u32
    }
}
