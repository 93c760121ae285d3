//! Wildberries API client.
//!
//! Composes three upstream sources: the analytics v2 stocks report
//! (aggregated totals, paginated POST), the analytics v1 warehouse remains
//! (two-step async task: create, then poll the download endpoint), and the
//! statistics v1 supplier orders feed. All calls go through the shared rate
//! limiter and memoize their responses in the tenant cache so a retried sync
//! does not re-fetch inside one cycle.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{header::AUTHORIZATION, Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    cache::TenantCache,
    config::Config,
    error::{SyncError, SyncResult},
    marketplace::{
        types::{
            AggregationWindow, OrderRecord, ProductAggregate, RemainsTaskResponse,
            StocksReportRequest, StocksReportResponse, WarehouseRemains,
        },
        Marketplace,
    },
    rate_limit::RateLimiter,
    shutdown::Shutdown,
};

const AGGREGATES_PATH: &str = "/api/v2/stocks-report/products/products";
const REMAINS_CREATE_PATH: &str = "/api/v1/warehouse_remains";
const ORDERS_PATH: &str = "/api/v1/supplier/orders";

const AGGREGATES_PAGE_LIMIT: u32 = 1000;
// Hard stop for pagination; 30 pages is far beyond any real catalog here.
const AGGREGATES_MAX_PAGES: u32 = 30;

// Empirical per-endpoint admission (requests per minute).
const AGGREGATES_LIMIT_PER_MIN: u32 = 3;
const REMAINS_LIMIT_PER_MIN: u32 = 3;
const ORDERS_LIMIT_PER_MIN: u32 = 60;
const LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Exponential backoff parameters for transient upstream failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

/// Poll cadence for the warehouse-remains task.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct WildberriesClient {
    http: Client,
    token: String,
    analytics_base: String,
    statistics_base: String,
    tenant_id: String,
    limiter: Arc<RateLimiter>,
    cache: Arc<TenantCache>,
    tenant_limit_per_min: u32,
    global_limit_per_min: u32,
    retry: RetryPolicy,
    poll: PollPolicy,
}

impl WildberriesClient {
    pub fn new(
        config: &Config,
        token: String,
        tenant_id: String,
        limiter: Arc<RateLimiter>,
        cache: Arc<TenantCache>,
    ) -> SyncResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .user_agent("stocksync/0.1 (inventory sync)")
            .build()
            .map_err(|e| SyncError::internal(format!("http client: {e}")))?;

        Ok(Self {
            http,
            token,
            analytics_base: config.wb_analytics_base.clone(),
            statistics_base: config.wb_statistics_base.clone(),
            tenant_id,
            limiter,
            cache,
            tenant_limit_per_min: config.tenant_rate_limit_per_min,
            global_limit_per_min: config.global_rate_limit_per_min,
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Admission order: global, tenant, endpoint. Waiting (not rejecting) is
    /// the right behavior inside a job; the scheduler already bounds total
    /// job time.
    async fn admit(&self, endpoint_key: &str, endpoint_limit: u32) {
        self.limiter
            .wait_until_allowed("global", self.global_limit_per_min, LIMIT_WINDOW)
            .await;
        self.limiter
            .wait_until_allowed(
                &format!("tenant:{}", self.tenant_id),
                self.tenant_limit_per_min,
                LIMIT_WINDOW,
            )
            .await;
        self.limiter
            .wait_until_allowed(endpoint_key, endpoint_limit, LIMIT_WINDOW)
            .await;
    }

    /// Execute with exponential backoff. Transport errors and 5xx retry;
    /// 429 retries honoring `Retry-After`; any other 4xx is terminal.
    async fn send_with_retry(
        &self,
        label: &str,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> SyncResult<reqwest::Response> {
        let mut backoff = self.retry.base;
        let mut last_error = String::new();

        for attempt in 1..=self.retry.attempts {
            match build().send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                    let wait = parse_retry_after(&resp).unwrap_or(backoff);
                    warn!(
                        endpoint = label,
                        attempt,
                        wait_secs = wait.as_secs(),
                        "Upstream rate limited (429)"
                    );
                    last_error = format!("{label}: 429 too many requests");
                    if attempt < self.retry.attempts {
                        sleep(wait).await;
                        backoff = (backoff * 2).min(self.retry.cap);
                    }
                }
                Ok(resp) if resp.status().is_server_error() => {
                    let status = resp.status();
                    warn!(endpoint = label, attempt, %status, "Upstream server error");
                    last_error = format!("{label}: {status}");
                    if attempt < self.retry.attempts {
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(self.retry.cap);
                    }
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(SyncError::invalid_request(format!(
                        "{label} {status}: {body}"
                    )));
                }
                Err(e) => {
                    warn!(endpoint = label, attempt, error = %e, "Transport error");
                    last_error = format!("{label}: {e}");
                    if attempt < self.retry.attempts {
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(self.retry.cap);
                    }
                }
            }
        }

        Err(SyncError::transient(format!(
            "{label}: attempts exhausted ({last_error})"
        )))
    }

    async fn fetch_aggregates_page(
        &self,
        window: &AggregationWindow,
        offset: u32,
    ) -> SyncResult<Vec<ProductAggregate>> {
        let url = format!("{}{}", self.analytics_base, AGGREGATES_PATH);
        let body = StocksReportRequest::page(
            window.start_str(),
            window.end_str(),
            AGGREGATES_PAGE_LIMIT,
            offset,
        );

        let resp = self
            .send_with_retry("stocks-report", || {
                self.http
                    .post(&url)
                    .header(AUTHORIZATION, &self.token)
                    .json(&body)
            })
            .await?;

        let parsed: StocksReportResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::invalid_request(format!("stocks-report parse: {e}")))?;

        Ok(parsed.data.items)
    }
}

#[async_trait]
impl Marketplace for WildberriesClient {
    async fn fetch_product_aggregates(
        &self,
        window: AggregationWindow,
    ) -> SyncResult<Vec<ProductAggregate>> {
        let cache_key = format!("wb:aggregates:{}:{}", window.start_str(), window.end_str());
        if let Some(cached) = self
            .cache
            .get_json::<Vec<ProductAggregate>>(&self.tenant_id, &cache_key)
        {
            debug!(tenant_id = %self.tenant_id, "Aggregates served from cache");
            return Ok(cached);
        }

        let mut items: Vec<ProductAggregate> = Vec::new();
        for page in 0..AGGREGATES_MAX_PAGES {
            self.admit("marketplace:wb:aggregates", AGGREGATES_LIMIT_PER_MIN)
                .await;
            let offset = page * AGGREGATES_PAGE_LIMIT;
            let batch = self.fetch_aggregates_page(&window, offset).await?;
            let got = batch.len();
            items.extend(batch);
            if got < AGGREGATES_PAGE_LIMIT as usize {
                break;
            }
        }

        info!(
            tenant_id = %self.tenant_id,
            products = items.len(),
            "Fetched stock aggregates"
        );
        self.cache
            .set_json(&self.tenant_id, &cache_key, &items, None);
        Ok(items)
    }

    async fn fetch_warehouse_breakdown(
        &self,
        shutdown: &Shutdown,
    ) -> SyncResult<Vec<WarehouseRemains>> {
        let cache_key = "wb:remains";
        if let Some(cached) = self
            .cache
            .get_json::<Vec<WarehouseRemains>>(&self.tenant_id, cache_key)
        {
            debug!(tenant_id = %self.tenant_id, "Warehouse remains served from cache");
            return Ok(cached);
        }

        self.admit("marketplace:wb:remains", REMAINS_LIMIT_PER_MIN)
            .await;

        let create_url = format!(
            "{}{}?groupByNm=true&groupBySize=false",
            self.analytics_base, REMAINS_CREATE_PATH
        );
        let resp = self
            .send_with_retry("warehouse-remains", || {
                self.http
                    .post(&create_url)
                    .header(AUTHORIZATION, &self.token)
            })
            .await?;

        let task: RemainsTaskResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::invalid_request(format!("warehouse-remains parse: {e}")))?;
        let task_id = task.data.task_id;
        debug!(tenant_id = %self.tenant_id, task_id = %task_id, "Warehouse remains task created");

        let download_url = format!(
            "{}{}/tasks/{}/download",
            self.analytics_base, REMAINS_CREATE_PATH, task_id
        );
        let deadline = tokio::time::Instant::now() + self.poll.timeout;

        loop {
            if shutdown.is_cancelled() {
                return Err(SyncError::cancelled("warehouse-remains poll cancelled"));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SyncError::transient(format!(
                    "warehouse-remains task {task_id} did not finish in {:?}",
                    self.poll.timeout
                )));
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    return Err(SyncError::cancelled("warehouse-remains poll cancelled"));
                }
                _ = sleep(self.poll.interval) => {}
            }

            let poll_resp = self
                .http
                .get(&download_url)
                .header(AUTHORIZATION, &self.token)
                .send()
                .await;

            match poll_resp {
                Ok(resp) if resp.status().is_success() => {
                    let remains: Vec<WarehouseRemains> = resp.json().await.map_err(|e| {
                        SyncError::invalid_request(format!("remains download parse: {e}"))
                    })?;
                    info!(
                        tenant_id = %self.tenant_id,
                        products = remains.len(),
                        "Warehouse remains task finished"
                    );
                    self.cache
                        .set_json(&self.tenant_id, cache_key, &remains, None);
                    return Ok(remains);
                }
                // Task not ready yet; keep polling until the deadline.
                Ok(resp)
                    if resp.status() == StatusCode::NOT_FOUND
                        || resp.status() == StatusCode::ACCEPTED =>
                {
                    debug!(task_id = %task_id, status = %resp.status(), "Remains task pending");
                }
                Ok(resp) if resp.status().is_server_error() => {
                    warn!(task_id = %task_id, status = %resp.status(), "Remains poll server error");
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(SyncError::invalid_request(format!(
                        "remains download {status}: {body}"
                    )));
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Remains poll transport error");
                }
            }
        }
    }

    async fn fetch_orders(&self, date_from: DateTime<Utc>) -> SyncResult<Vec<OrderRecord>> {
        let date_from_str = date_from.to_rfc3339_opts(SecondsFormat::Secs, true);
        let cache_key = format!("wb:orders:{}", date_from_str);
        if let Some(cached) = self
            .cache
            .get_json::<Vec<OrderRecord>>(&self.tenant_id, &cache_key)
        {
            debug!(tenant_id = %self.tenant_id, "Orders served from cache");
            return Ok(cached);
        }

        self.admit("marketplace:wb:orders", ORDERS_LIMIT_PER_MIN)
            .await;

        let url = format!("{}{}", self.statistics_base, ORDERS_PATH);
        let resp = self
            .send_with_retry("supplier-orders", || {
                self.http
                    .get(&url)
                    .header(AUTHORIZATION, &self.token)
                    .query(&[("dateFrom", date_from_str.as_str()), ("flag", "0")])
            })
            .await?;

        let orders: Vec<OrderRecord> = resp
            .json()
            .await
            .map_err(|e| SyncError::invalid_request(format!("supplier-orders parse: {e}")))?;

        info!(
            tenant_id = %self.tenant_id,
            orders = orders.len(),
            "Fetched supplier orders"
        );
        self.cache
            .set_json(&self.tenant_id, &cache_key, &orders, None);
        Ok(orders)
    }
}

fn parse_retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
