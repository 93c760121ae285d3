//! Per-tenant sync pipeline.
//!
//! PENDING → LOADING_CREDENTIALS → FETCHING_MARKETPLACE → MERGING →
//! PROJECTING → (SUCCESS | PARTIAL | FAILED). Every call returns exactly one
//! SyncLog; the caller persists it. Credentials are materialized into
//! job-local variables only and dropped with the job.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::{
    cache::TenantCache,
    config::Config,
    error::{ErrorKind, SyncError},
    marketplace::{build_marketplace, types::AggregationWindow},
    merge::{merge, MergeOutcome},
    models::{
        FailureClass, PartialReason, SyncLog, SyncStatus, SyncTrigger, Tenant,
        FLAG_PROJECTION_RETRIED, FLAG_RECONCILIATION_MISMATCH,
    },
    rate_limit::RateLimiter,
    sheets::{projector::Layout, Projector, SheetsClient, TokenProvider},
    shutdown::Shutdown,
    vault::CredentialVault,
};

/// Terminal result of one cycle: the log to persist, plus the underlying
/// error when the cycle failed (the scheduler's retry policy needs the
/// kind, which the persisted classification deliberately collapses).
pub struct SyncOutcome {
    pub log: SyncLog,
    pub error: Option<SyncError>,
}

/// Mutable bookkeeping for one cycle, folded into the final SyncLog.
#[derive(Default)]
struct CycleState {
    partial_reason: Option<PartialReason>,
    flags: Vec<String>,
    products_processed: u32,
    products_failed: u32,
    orders_fetched_raw: u32,
    orders_after_filter: u32,
}

impl CycleState {
    fn push_flag(&mut self, flag: &str) {
        if !self.flags.iter().any(|f| f == flag) {
            self.flags.push(flag.to_string());
        }
    }

    fn mark_partial(&mut self, reason: PartialReason) {
        // First reason wins; later degradations are logged but the record
        // keeps the earliest cause.
        if self.partial_reason.is_none() {
            self.partial_reason = Some(reason);
        }
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    vault: Arc<CredentialVault>,
    limiter: Arc<RateLimiter>,
    cache: Arc<TenantCache>,
    /// Shared client for token exchanges; sheet/marketplace calls use their
    /// own pooled clients.
    http: reqwest::Client,
    /// Policy overrides, used by tests to shrink waits.
    projector_retry_pause: Option<std::time::Duration>,
    marketplace_retry: Option<crate::marketplace::wildberries::RetryPolicy>,
    marketplace_poll: Option<crate::marketplace::wildberries::PollPolicy>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        vault: Arc<CredentialVault>,
        limiter: Arc<RateLimiter>,
        cache: Arc<TenantCache>,
    ) -> Self {
        Self {
            config,
            vault,
            limiter,
            cache,
            http: reqwest::Client::new(),
            projector_retry_pause: None,
            marketplace_retry: None,
            marketplace_poll: None,
        }
    }

    pub fn with_projector_retry_pause(mut self, pause: std::time::Duration) -> Self {
        self.projector_retry_pause = Some(pause);
        self
    }

    pub fn with_marketplace_policies(
        mut self,
        retry: crate::marketplace::wildberries::RetryPolicy,
        poll: crate::marketplace::wildberries::PollPolicy,
    ) -> Self {
        self.marketplace_retry = Some(retry);
        self.marketplace_poll = Some(poll);
        self
    }

    /// Run one sync cycle end to end. Never panics on data; always returns
    /// a terminal SyncLog for the caller to persist.
    pub async fn run_sync(
        &self,
        tenant: &Tenant,
        trigger: SyncTrigger,
        soft_deadline: Instant,
        shutdown: &Shutdown,
    ) -> SyncOutcome {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut state = CycleState::default();

        info!(
            tenant_id = %tenant.id,
            trigger = trigger.as_str(),
            "Sync cycle starting"
        );

        // -- LOADING_CREDENTIALS ------------------------------------------
        let mp_token = match self.vault.decrypt(&tenant.marketplace_credentials_enc) {
            Ok(token) => token,
            Err(e) => return self.finish_failed(tenant, started_at, start, state, &e),
        };
        let sheet_creds = match self.vault.decrypt(&tenant.spreadsheet_credentials_enc) {
            Ok(creds) => creds,
            Err(e) => return self.finish_failed(tenant, started_at, start, state, &e),
        };

        let marketplace = match build_marketplace(
            tenant.marketplace,
            mp_token,
            tenant.id.clone(),
            &self.config,
            self.limiter.clone(),
            self.cache.clone(),
            self.marketplace_retry,
            self.marketplace_poll,
        ) {
            Ok(client) => client,
            Err(e) => return self.finish_failed(tenant, started_at, start, state, &e),
        };

        let auth = match TokenProvider::from_credentials_json(
            &sheet_creds,
            self.http.clone(),
            &self.config.sheets_token_url,
        ) {
            Ok(auth) => auth,
            Err(e) => return self.finish_failed(tenant, started_at, start, state, &e),
        };
        let sheets_client = match SheetsClient::new(
            self.config.sheets_base.clone(),
            tenant.spreadsheet_id.clone(),
            auth,
        ) {
            Ok(client) => client,
            Err(e) => return self.finish_failed(tenant, started_at, start, state, &e),
        };
        let mut projector = Projector::new(sheets_client);
        if let Some(pause) = self.projector_retry_pause {
            projector = projector.with_retry_pause(pause);
        }

        if shutdown.is_cancelled() {
            return self.finish_cancelled(tenant, started_at, start, state);
        }

        // -- FETCHING_MARKETPLACE -----------------------------------------
        let window = AggregationWindow::last_days(self.config.aggregates_window_days);
        let orders_from =
            Utc::now() - ChronoDuration::days(i64::from(self.config.orders_window_days));

        let (aggregates_res, breakdown_res, orders_res) = tokio::join!(
            marketplace.fetch_product_aggregates(window),
            marketplace.fetch_warehouse_breakdown(shutdown),
            marketplace.fetch_orders(orders_from),
        );

        let aggregates = match aggregates_res {
            Ok(items) => items,
            Err(e) if e.kind == ErrorKind::Cancelled => {
                return self.finish_cancelled(tenant, started_at, start, state)
            }
            // Aggregates are the authoritative source; without them there is
            // nothing worth projecting.
            Err(e) => return self.finish_failed(tenant, started_at, start, state, &e),
        };

        let breakdown = match breakdown_res {
            Ok(items) => items,
            Err(e) if e.kind == ErrorKind::Cancelled => {
                return self.finish_cancelled(tenant, started_at, start, state)
            }
            Err(e) => {
                // Totals stay correct; only the per-warehouse detail is lost.
                warn!(tenant_id = %tenant.id, error = %e, "Warehouse breakdown unavailable");
                state.mark_partial(PartialReason::NoBreakdown);
                Vec::new()
            }
        };

        let orders = match orders_res {
            Ok(items) => items,
            Err(e) if e.kind == ErrorKind::Cancelled => {
                return self.finish_cancelled(tenant, started_at, start, state)
            }
            Err(e) => {
                warn!(tenant_id = %tenant.id, error = %e, "Orders unavailable");
                state.mark_partial(PartialReason::NoOrders);
                Vec::new()
            }
        };

        if shutdown.is_cancelled() {
            return self.finish_cancelled(tenant, started_at, start, state);
        }

        // -- MERGING (never fails for data reasons) -----------------------
        let MergeOutcome {
            products,
            warnings,
            orders_fetched_raw,
            orders_after_filter,
        } = merge(&aggregates, &breakdown, &orders);

        state.products_processed = products.len() as u32;
        state.orders_fetched_raw = orders_fetched_raw;
        state.orders_after_filter = orders_after_filter;
        for warning in &warnings {
            warn!(tenant_id = %tenant.id, warning = %warning, "Merge warning");
            state.push_flag(FLAG_RECONCILIATION_MISMATCH);
        }

        // Soft deadline: abandon the remaining (slow) work voluntarily.
        // Deadline overrides any earlier degradation as the recorded reason.
        if Instant::now() >= soft_deadline {
            warn!(tenant_id = %tenant.id, "Soft deadline elapsed before projection");
            state.partial_reason = Some(PartialReason::Deadline);
            return self.finish(tenant, started_at, start, state, SyncStatus::Partial, None, None);
        }
        if shutdown.is_cancelled() {
            return self.finish_cancelled(tenant, started_at, start, state);
        }

        // -- PROJECTING ---------------------------------------------------
        let layout = Layout::from_products(&products, window.days());

        // Scheduled refreshes (and their retries) rewrite the sheet
        // wholesale, dropping rows of products gone since the last cycle.
        // Manual syncs skip the destructive clear and upsert in place via
        // the cycle's single existence read.
        let full_refresh = matches!(trigger, SyncTrigger::Scheduled | SyncTrigger::Retry);

        let handle = match projector.ensure_worksheet(&tenant.worksheet_name).await {
            Ok(handle) => handle,
            Err(e) => {
                state.products_failed = state.products_processed;
                return self.finish_projection_failed(tenant, started_at, start, state, &e);
            }
        };
        if let Err(e) = projector.verify_schema(&handle, &layout).await {
            state.products_failed = state.products_processed;
            return self.finish_projection_failed(tenant, started_at, start, state, &e);
        }
        if full_refresh {
            // Clear failure is fatal: a half-cleared sheet must not be
            // appended.
            if let Err(e) = projector.clear_data(&handle).await {
                state.products_failed = state.products_processed;
                return self.finish_projection_failed(tenant, started_at, start, state, &e);
            }
        }

        match projector
            .upsert_products(&handle, &layout, &products, full_refresh)
            .await
        {
            Ok(report) => {
                if report.retried {
                    state.push_flag(FLAG_PROJECTION_RETRIED);
                }
            }
            Err(e) => {
                // The merge counters stay on the log so the failure can be
                // diagnosed against what should have been written.
                state.products_failed = state.products_processed;
                return self.finish_projection_failed(tenant, started_at, start, state, &e);
            }
        }

        let status = if state.partial_reason.is_some() {
            SyncStatus::Partial
        } else {
            SyncStatus::Success
        };
        self.finish(tenant, started_at, start, state, status, None, None)
    }

    fn finish(
        &self,
        tenant: &Tenant,
        started_at: chrono::DateTime<Utc>,
        start: Instant,
        state: CycleState,
        status: SyncStatus,
        error_kind: Option<FailureClass>,
        error_message: Option<String>,
    ) -> SyncOutcome {
        let finished_at = Utc::now();
        let duration_ms = start.elapsed().as_millis() as i64;

        match status {
            SyncStatus::Failed => error!(
                tenant_id = %tenant.id,
                kind = error_kind.map(|k| k.as_str()).unwrap_or("unknown"),
                duration_ms,
                "Sync cycle failed"
            ),
            SyncStatus::Partial => warn!(
                tenant_id = %tenant.id,
                reason = state.partial_reason.map(|r| r.as_str()).unwrap_or("unknown"),
                products = state.products_processed,
                duration_ms,
                "Sync cycle finished partially"
            ),
            SyncStatus::Success => info!(
                tenant_id = %tenant.id,
                products = state.products_processed,
                orders = state.orders_after_filter,
                duration_ms,
                "Sync cycle finished"
            ),
        }

        SyncOutcome {
            log: SyncLog {
                id: uuid::Uuid::new_v4().to_string(),
                tenant_id: tenant.id.clone(),
                started_at,
                finished_at,
                status,
                partial_reason: state.partial_reason,
                products_processed: state.products_processed,
                products_failed: state.products_failed,
                orders_fetched_raw: state.orders_fetched_raw,
                orders_after_filter: state.orders_after_filter,
                error_kind,
                error_message,
                flags: state.flags,
                duration_ms,
            },
            error: None,
        }
    }

    fn finish_failed(
        &self,
        tenant: &Tenant,
        started_at: chrono::DateTime<Utc>,
        start: Instant,
        state: CycleState,
        error: &SyncError,
    ) -> SyncOutcome {
        let class = classify(error.kind);
        let mut outcome = self.finish(
            tenant,
            started_at,
            start,
            state,
            SyncStatus::Failed,
            Some(class),
            Some(error.message.clone()),
        );
        outcome.error = Some(error.clone());
        outcome
    }

    /// Projection-step failures classify as `projection` whatever the
    /// low-level kind, except when credentials or cancellation are the
    /// actual culprit.
    fn finish_projection_failed(
        &self,
        tenant: &Tenant,
        started_at: chrono::DateTime<Utc>,
        start: Instant,
        state: CycleState,
        error: &SyncError,
    ) -> SyncOutcome {
        let class = match error.kind {
            ErrorKind::ConfigMissing | ErrorKind::CredentialCorrupt => FailureClass::Credential,
            ErrorKind::Cancelled | ErrorKind::Deadline => FailureClass::Cancelled,
            _ => FailureClass::Projection,
        };
        let mut outcome = self.finish(
            tenant,
            started_at,
            start,
            state,
            SyncStatus::Failed,
            Some(class),
            Some(error.message.clone()),
        );
        outcome.error = Some(error.clone());
        outcome
    }

    fn finish_cancelled(
        &self,
        tenant: &Tenant,
        started_at: chrono::DateTime<Utc>,
        start: Instant,
        state: CycleState,
    ) -> SyncOutcome {
        let error = SyncError::cancelled("job cancelled by scheduler shutdown");
        let mut outcome = self.finish(
            tenant,
            started_at,
            start,
            state,
            SyncStatus::Failed,
            Some(FailureClass::Cancelled),
            Some(error.message.clone()),
        );
        outcome.error = Some(error);
        outcome
    }
}

/// Map a component error kind to the log's failure classification.
fn classify(kind: ErrorKind) -> FailureClass {
    match kind {
        ErrorKind::ConfigMissing | ErrorKind::CredentialCorrupt => FailureClass::Credential,
        ErrorKind::MarketplaceTransient | ErrorKind::MarketplaceInvalid => {
            FailureClass::Marketplace
        }
        ErrorKind::QuotaExceeded => FailureClass::Projection,
        ErrorKind::Cancelled | ErrorKind::Deadline => FailureClass::Cancelled,
        ErrorKind::QueueFull | ErrorKind::Storage | ErrorKind::Internal => FailureClass::Internal,
    }
}
