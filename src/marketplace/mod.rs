//! Marketplace data acquisition.
//!
//! The sync pipeline is polymorphic over the capability set below; variants
//! correspond to marketplace kinds. Only Wildberries is wired today.

pub mod types;
pub mod wildberries;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::{
    cache::TenantCache,
    config::Config,
    error::{SyncError, SyncResult},
    models::MarketplaceKind,
    rate_limit::RateLimiter,
    shutdown::Shutdown,
};
use types::{AggregationWindow, OrderRecord, ProductAggregate, WarehouseRemains};

#[async_trait]
pub trait Marketplace: Send + Sync {
    /// Aggregated totals per SKU — the authoritative stock/orders counts.
    async fn fetch_product_aggregates(
        &self,
        window: AggregationWindow,
    ) -> SyncResult<Vec<ProductAggregate>>;

    /// Per-warehouse FBO breakdown (seller-fulfilled stock not included).
    async fn fetch_warehouse_breakdown(
        &self,
        shutdown: &Shutdown,
    ) -> SyncResult<Vec<WarehouseRemains>>;

    /// Flat order records since `date_from`.
    async fn fetch_orders(&self, date_from: DateTime<Utc>) -> SyncResult<Vec<OrderRecord>>;
}

/// Build the client variant for a tenant from its decrypted API token.
/// Policy overrides exist for tests; `None` keeps the production defaults.
pub fn build_marketplace(
    kind: MarketplaceKind,
    token: String,
    tenant_id: String,
    config: &Config,
    limiter: Arc<RateLimiter>,
    cache: Arc<TenantCache>,
    retry: Option<wildberries::RetryPolicy>,
    poll: Option<wildberries::PollPolicy>,
) -> SyncResult<Arc<dyn Marketplace>> {
    match kind {
        MarketplaceKind::Wildberries => {
            let mut client =
                wildberries::WildberriesClient::new(config, token, tenant_id, limiter, cache)?;
            if let Some(retry) = retry {
                client = client.with_retry_policy(retry);
            }
            if let Some(poll) = poll {
                client = client.with_poll_policy(poll);
            }
            Ok(Arc::new(client))
        }
        other => Err(SyncError::invalid_request(format!(
            "marketplace {} is not supported yet",
            other.as_str()
        ))),
    }
}
