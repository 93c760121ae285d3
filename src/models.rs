use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marketplaces a tenant can connect. Only Wildberries is implemented today;
/// the tag is stored per tenant so further variants slot in without a schema
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketplaceKind {
    Wildberries,
    Ozon,
}

impl MarketplaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketplaceKind::Wildberries => "wildberries",
            MarketplaceKind::Ozon => "ozon",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "wildberries" => Some(MarketplaceKind::Wildberries),
            "ozon" => Some(MarketplaceKind::Ozon),
            _ => None,
        }
    }
}

/// A seller account with its encrypted credentials and sheet destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub marketplace: MarketplaceKind,
    /// Vault blob: marketplace API token.
    pub marketplace_credentials_enc: String,
    /// Vault blob: spreadsheet credentials (service-account JSON).
    pub spreadsheet_credentials_enc: String,
    pub spreadsheet_id: String,
    pub worksheet_name: String,
    pub cadence_hours: u32,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
}

/// Fulfillment class of a warehouse row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fulfillment {
    /// Marketplace-operated warehouse (from the breakdown endpoint).
    Fbo,
    /// Seller-fulfilled residual stock.
    Fbs,
    /// Created to carry orders with no matching stock row.
    Synthetic,
}

impl Fulfillment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Fulfillment::Fbo => "fbo",
            Fulfillment::Fbs => "fbs",
            Fulfillment::Synthetic => "synthetic",
        }
    }
}

/// Per-product, per-location stock/orders row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warehouse {
    pub name: String,
    pub fulfillment: Fulfillment,
    pub stock: u32,
    pub orders: u32,
}

/// A SKU as seen on the marketplace, with its warehouse breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub nm_id: i64,
    /// Seller article code; row identity in the projected sheet.
    pub vendor_code: String,
    pub name: String,
    pub total_stock: u32,
    pub total_orders: u32,
    pub warehouses: Vec<Warehouse>,
    pub updated_at: DateTime<Utc>,
}

/// What put a job on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Scheduled,
    Manual,
    Retry,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Scheduled => "scheduled",
            SyncTrigger::Manual => "manual",
            SyncTrigger::Retry => "retry",
        }
    }
}

/// Maximum attempts for one logical sync (first run + retries).
pub const MAX_SYNC_ATTEMPTS: u32 = 3;

/// Runtime dispatch unit. Never persisted.
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub tenant_id: String,
    pub trigger: SyncTrigger,
    pub enqueued_at: DateTime<Utc>,
    pub attempt: u32,
}

impl SyncJob {
    pub fn new(tenant_id: impl Into<String>, trigger: SyncTrigger) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            trigger,
            enqueued_at: Utc::now(),
            attempt: 1,
        }
    }

    pub fn retry_of(&self) -> Self {
        Self {
            tenant_id: self.tenant_id.clone(),
            trigger: SyncTrigger::Retry,
            enqueued_at: Utc::now(),
            attempt: self.attempt + 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Partial,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Partial => "partial",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(SyncStatus::Success),
            "partial" => Some(SyncStatus::Partial),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// Why a cycle finished `partial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialReason {
    NoBreakdown,
    NoOrders,
    Deadline,
}

impl PartialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartialReason::NoBreakdown => "no_breakdown",
            PartialReason::NoOrders => "no_orders",
            PartialReason::Deadline => "deadline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "no_breakdown" => Some(PartialReason::NoBreakdown),
            "no_orders" => Some(PartialReason::NoOrders),
            "deadline" => Some(PartialReason::Deadline),
            _ => None,
        }
    }
}

/// Failure classification recorded on a failed SyncLog. Derived from the
/// pipeline step that failed, not only from the error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Credential,
    Marketplace,
    Projection,
    Cancelled,
    Internal,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Credential => "credential",
            FailureClass::Marketplace => "marketplace",
            FailureClass::Projection => "projection",
            FailureClass::Cancelled => "cancelled",
            FailureClass::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credential" => Some(FailureClass::Credential),
            "marketplace" => Some(FailureClass::Marketplace),
            "projection" => Some(FailureClass::Projection),
            "cancelled" => Some(FailureClass::Cancelled),
            "internal" => Some(FailureClass::Internal),
            _ => None,
        }
    }
}

/// Flag recorded when the projector write succeeded only on its retry.
pub const FLAG_PROJECTION_RETRIED: &str = "projection_retried";
/// Flag recorded when aggregates total < FBO sum for at least one product.
pub const FLAG_RECONCILIATION_MISMATCH: &str = "reconciliation_mismatch";

/// Append-only record of one sync attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: String,
    pub tenant_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: SyncStatus,
    pub partial_reason: Option<PartialReason>,
    pub products_processed: u32,
    pub products_failed: u32,
    pub orders_fetched_raw: u32,
    pub orders_after_filter: u32,
    pub error_kind: Option<FailureClass>,
    pub error_message: Option<String>,
    pub flags: Vec<String>,
    pub duration_ms: i64,
}
