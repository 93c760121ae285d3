//! Job scheduling: periodic dispatch, on-demand triggers, per-tenant
//! concurrency, timeouts, and cooperative shutdown.
//!
//! A bounded mpsc queue feeds a pool of worker tasks sharing one receiver.
//! At most one job per tenant is in flight at any moment; the in-flight map
//! is the sole cross-worker lock and doubles as the drain ledger on
//! shutdown.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

use crate::{
    cache::TenantCache,
    config::Config,
    error::{ErrorKind, SyncError, SyncResult},
    models::{FailureClass, SyncJob, SyncLog, SyncStatus, SyncTrigger, MAX_SYNC_ATTEMPTS},
    rate_limit::RateLimiter,
    shutdown::{self, Shutdown, ShutdownHandle},
    storage::{SyncLogStore, TenantStore},
    sync::orchestrator::{Orchestrator, SyncOutcome},
};

const TICK_INTERVAL: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Hard per-job ceiling; the job future is dropped past this.
const HARD_TIMEOUT: Duration = Duration::from_secs(600);
/// Orchestrator's voluntary cutoff, leaving headroom under the hard one.
const SOFT_TIMEOUT: Duration = Duration::from_secs(540);
/// How long in-flight jobs get to drain on shutdown before abort.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
/// Daily anchor: 00:01 local, plus per-tenant jitter.
const ANCHOR_HOUR: u32 = 0;
const ANCHOR_MINUTE: u32 = 1;
/// Jitter range around the anchor (±5 min).
const JITTER_RANGE_SECS: i64 = 300;

struct Inner {
    config: Arc<Config>,
    tenants: Arc<TenantStore>,
    logs: Arc<SyncLogStore>,
    orchestrator: Arc<Orchestrator>,
    cache: Arc<TenantCache>,
    limiter: Arc<RateLimiter>,
    queue_tx: mpsc::Sender<SyncJob>,
    /// tenant id → job start time; presence means a sync is in flight.
    in_flight: Mutex<HashMap<String, DateTime<Utc>>>,
    shutdown: Shutdown,
}

pub struct SyncScheduler {
    inner: Arc<Inner>,
    handle: ShutdownHandle,
    queue_rx: Mutex<Option<mpsc::Receiver<SyncJob>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncScheduler {
    /// Wire the scheduler without spawning anything (tests drive pieces
    /// directly); `start()` is the production entry point.
    pub fn new(
        config: Arc<Config>,
        tenants: Arc<TenantStore>,
        logs: Arc<SyncLogStore>,
        orchestrator: Arc<Orchestrator>,
        cache: Arc<TenantCache>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let (handle, shutdown) = shutdown::channel();

        let inner = Arc::new(Inner {
            config,
            tenants,
            logs,
            orchestrator,
            cache,
            limiter,
            queue_tx,
            in_flight: Mutex::new(HashMap::new()),
            shutdown,
        });

        Self {
            inner,
            handle,
            queue_rx: Mutex::new(Some(queue_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn workers, the schedule tick, and the cache/limiter sweeper.
    pub fn start(
        config: Arc<Config>,
        tenants: Arc<TenantStore>,
        logs: Arc<SyncLogStore>,
        orchestrator: Arc<Orchestrator>,
        cache: Arc<TenantCache>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let scheduler = Self::new(config, tenants, logs, orchestrator, cache, limiter);
        scheduler.spawn_tasks();
        scheduler
    }

    fn spawn_tasks(&self) {
        let rx = self
            .queue_rx
            .lock()
            .take()
            .expect("spawn_tasks called twice");
        let shared_rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = self.inner.config.workers.max(1);
        let mut tasks = self.tasks.lock();

        for worker in 0..workers {
            let inner = self.inner.clone();
            let rx = shared_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let job_opt = tokio::select! {
                        _ = inner.shutdown.cancelled() => break,
                        job = async { rx.lock().await.recv().await } => job,
                    };
                    let Some(job) = job_opt else { break };
                    inner.process_job(worker, job).await;
                }
                debug!(worker, "Sync worker stopped");
            }));
        }

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => inner.dispatch_due_tenants(),
                }
            }
        }));

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.limiter.cleanup();
                        inner.cache.sweep();
                    }
                }
            }
        }));

        info!(workers, "Sync scheduler started");
    }

    /// On-demand entry point for the external surface (chat-bot, CLI).
    /// Backpressure is surfaced, not hidden: a full queue is the caller's
    /// problem to retry.
    pub fn trigger_sync(&self, tenant_id: &str, trigger: SyncTrigger) -> SyncResult<()> {
        if self.inner.tenants.get(tenant_id)?.is_none() {
            return Err(SyncError::invalid_request(format!(
                "tenant {tenant_id} not found"
            )));
        }

        let job = SyncJob::new(tenant_id, trigger);
        match self.inner.queue_tx.try_send(job) {
            Ok(()) => {
                info!(tenant_id, trigger = trigger.as_str(), "Sync enqueued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(tenant_id, "Dispatch queue full, rejecting enqueue");
                Err(SyncError::new(ErrorKind::QueueFull, "dispatch queue full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(SyncError::internal("dispatch queue closed"))
            }
        }
    }

    pub fn latest_sync_log(&self, tenant_id: &str) -> SyncResult<Option<SyncLog>> {
        self.inner.logs.latest_for_tenant(tenant_id)
    }

    /// Signal shutdown, give in-flight jobs `DRAIN_TIMEOUT` to finish, then
    /// abort what remains and record `failed(cancelled)` logs for it.
    pub async fn shutdown(self) {
        info!("Sync scheduler shutting down");
        self.handle.signal();

        let drain_deadline = Instant::now() + DRAIN_TIMEOUT;
        while !self.inner.in_flight.lock().is_empty() && Instant::now() < drain_deadline {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }

        // Jobs that were aborted mid-flight never got to write their log.
        let orphans: Vec<(String, DateTime<Utc>)> =
            self.inner.in_flight.lock().drain().collect();
        for (tenant_id, started_at) in orphans {
            warn!(tenant_id = %tenant_id, "Job terminated by shutdown");
            let log = cancelled_log(
                &tenant_id,
                started_at,
                "worker terminated during shutdown drain",
            );
            if let Err(e) = self.inner.logs.append(&log) {
                error!(tenant_id = %tenant_id, error = %e, "Failed to record cancelled job");
            }
        }

        info!("Sync scheduler stopped");
    }

    #[cfg(test)]
    fn inner_for_tests(&self) -> &Arc<Inner> {
        &self.inner
    }
}

impl Inner {
    fn claim(&self, tenant_id: &str) -> bool {
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains_key(tenant_id) {
            return false;
        }
        in_flight.insert(tenant_id.to_string(), Utc::now());
        true
    }

    fn release(&self, tenant_id: &str) {
        self.in_flight.lock().remove(tenant_id);
    }

    async fn process_job(&self, worker: usize, job: SyncJob) {
        let tenant = match self.tenants.get(&job.tenant_id) {
            Ok(Some(tenant)) => tenant,
            Ok(None) => {
                warn!(tenant_id = %job.tenant_id, "Job for unknown tenant dropped");
                return;
            }
            Err(e) => {
                error!(tenant_id = %job.tenant_id, error = %e, "Tenant lookup failed");
                return;
            }
        };

        if tenant.paused && job.trigger == SyncTrigger::Scheduled {
            debug!(tenant_id = %tenant.id, "Tenant paused, skipping scheduled job");
            return;
        }

        if !self.claim(&tenant.id) {
            warn!(
                tenant_id = %tenant.id,
                worker,
                "Sync already in flight for tenant, dropping job"
            );
            return;
        }

        let started_at = Utc::now();
        let soft_deadline = Instant::now() + SOFT_TIMEOUT;
        let result = timeout(
            HARD_TIMEOUT,
            self.orchestrator
                .run_sync(&tenant, job.trigger, soft_deadline, &self.shutdown),
        )
        .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(tenant_id = %tenant.id, "Hard timeout, job terminated");
                SyncOutcome {
                    log: cancelled_log(
                        &tenant.id,
                        started_at,
                        &format!("hard timeout after {}s", HARD_TIMEOUT.as_secs()),
                    ),
                    error: Some(SyncError::new(ErrorKind::Deadline, "hard timeout")),
                }
            }
        };

        if let Err(e) = self.logs.append(&outcome.log) {
            error!(tenant_id = %tenant.id, error = %e, "Failed to persist sync log");
        }
        self.release(&tenant.id);

        // Retriable failures of scheduled-origin jobs go back on the queue.
        if let Some(err) = &outcome.error {
            if should_retry(&job, err) && !self.shutdown.is_cancelled() {
                let retry = job.retry_of();
                info!(
                    tenant_id = %tenant.id,
                    attempt = retry.attempt,
                    "Re-enqueueing failed sync"
                );
                if self.queue_tx.try_send(retry).is_err() {
                    warn!(tenant_id = %tenant.id, "Retry dropped, queue full");
                }
            }
        }
    }

    /// One scheduler tick: enqueue a scheduled job for every tenant whose
    /// next run time has passed.
    fn dispatch_due_tenants(&self) {
        let tenants = match self.tenants.list_active() {
            Ok(tenants) => tenants,
            Err(e) => {
                error!(error = %e, "Failed to list tenants for dispatch");
                return;
            }
        };

        let now = Local::now();
        for tenant in tenants {
            if self.in_flight.lock().contains_key(&tenant.id) {
                continue;
            }

            let last_started = match self.logs.latest_for_tenant(&tenant.id) {
                Ok(log) => log.map(|l| l.started_at.with_timezone(&Local)),
                Err(e) => {
                    error!(tenant_id = %tenant.id, error = %e, "Sync log lookup failed");
                    continue;
                }
            };

            let due = match last_started {
                None => true,
                Some(last) => {
                    now >= next_run_after(last, tenant.cadence_hours, tenant_jitter(&tenant.id))
                }
            };
            if !due {
                continue;
            }

            match self
                .queue_tx
                .try_send(SyncJob::new(&tenant.id, SyncTrigger::Scheduled))
            {
                Ok(()) => debug!(tenant_id = %tenant.id, "Scheduled sync enqueued"),
                Err(_) => {
                    // Tolerated: the next tick will pick the tenant up again.
                    warn!(tenant_id = %tenant.id, "Dispatch queue full, tick skipped tenant")
                }
            }
        }
    }
}

/// Only scheduled-origin jobs (and their retries) are re-enqueued; a manual
/// sync is never retried behind its caller's back.
fn should_retry(job: &SyncJob, error: &SyncError) -> bool {
    matches!(job.trigger, SyncTrigger::Scheduled | SyncTrigger::Retry)
        && error.kind.is_retriable()
        && job.attempt < MAX_SYNC_ATTEMPTS
}

fn cancelled_log(tenant_id: &str, started_at: DateTime<Utc>, message: &str) -> SyncLog {
    let finished_at = Utc::now();
    SyncLog {
        id: uuid::Uuid::new_v4().to_string(),
        tenant_id: tenant_id.to_string(),
        started_at,
        finished_at,
        status: SyncStatus::Failed,
        partial_reason: None,
        products_processed: 0,
        products_failed: 0,
        orders_fetched_raw: 0,
        orders_after_filter: 0,
        error_kind: Some(FailureClass::Cancelled),
        error_message: Some(message.to_string()),
        flags: Vec::new(),
        duration_ms: (finished_at - started_at).num_milliseconds(),
    }
}

/// Deterministic per-tenant jitter in ±`JITTER_RANGE_SECS`, so a fleet of
/// daily tenants doesn't stampede the marketplace at the anchor minute.
fn tenant_jitter(tenant_id: &str) -> i64 {
    let mut hasher = DefaultHasher::new();
    tenant_id.hash(&mut hasher);
    let spread = (hasher.finish() % (2 * JITTER_RANGE_SECS as u64 + 1)) as i64;
    spread - JITTER_RANGE_SECS
}

/// Next scheduled run after a sync that started at `last`. Multiples of
/// 24 h anchor at 00:01 local the following `cadence/24` days; shorter
/// cadences are plain offsets. Jitter shifts the anchor, not the cadence.
fn next_run_after(last: DateTime<Local>, cadence_hours: u32, jitter_secs: i64) -> DateTime<Local> {
    let cadence_hours = cadence_hours.max(1);
    if cadence_hours % 24 == 0 {
        let days = i64::from(cadence_hours / 24);
        let anchor_day = last.date_naive() + ChronoDuration::days(days);
        let anchor = Local
            .with_ymd_and_hms(
                anchor_day.year(),
                anchor_day.month(),
                anchor_day.day(),
                ANCHOR_HOUR,
                ANCHOR_MINUTE,
                0,
            )
            .single()
            // DST gap at the anchor minute: fall back to a plain offset.
            .unwrap_or(last + ChronoDuration::days(days));
        anchor + ChronoDuration::seconds(jitter_secs)
    } else {
        last + ChronoDuration::hours(i64::from(cadence_hours))
            + ChronoDuration::seconds(jitter_secs)
    }
}
