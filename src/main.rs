//! stocksync - marketplace inventory → spreadsheet synchronization engine.
//!
//! Runs the scheduler daemon by default; subcommands cover single-shot syncs
//! and tenant administration for operators.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stocksync_backend::{
    cache::TenantCache,
    config::{load_env, Config},
    models::{MarketplaceKind, SyncTrigger},
    rate_limit::RateLimiter,
    shutdown::Shutdown,
    storage::{open_database, tenant_store::NewTenant, SyncLogStore, TenantStore},
    sync::{Orchestrator, SyncScheduler},
    vault::CredentialVault,
};

#[derive(Parser)]
#[command(name = "stocksync", about = "Marketplace → spreadsheet sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler daemon (default).
    Run,
    /// Run a single sync for one tenant and exit.
    Once {
        /// Tenant id to sync.
        tenant_id: String,
    },
    /// Onboard a tenant: encrypts credentials and stores the destination.
    AddTenant {
        #[arg(long)]
        name: String,
        /// Marketplace API token (Wildberries).
        #[arg(long)]
        wb_token: String,
        #[arg(long)]
        spreadsheet_id: String,
        #[arg(long, default_value = "Inventory")]
        worksheet: String,
        /// Path to the spreadsheet service-account JSON
        /// (or a `{"token": "..."}` file for static-token setups).
        #[arg(long)]
        sheets_credentials_file: String,
        #[arg(long, default_value_t = 24)]
        cadence_hours: u32,
    },
    /// Remove a tenant and everything it owns.
    RemoveTenant {
        tenant_id: String,
    },
    /// List active tenants.
    Tenants,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let config = Arc::new(Config::from_env()?);

    let conn = open_database(&config.database_path)?;
    let tenants = Arc::new(TenantStore::new(conn.clone()));
    let logs = Arc::new(SyncLogStore::new(conn));
    let vault = Arc::new(
        CredentialVault::from_config(config.master_key.as_deref())
            .context("Master key required (STOCKSYNC_MASTER_KEY)")?,
    );
    let limiter = Arc::new(RateLimiter::new());
    let cache = Arc::new(TenantCache::default());
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        vault.clone(),
        limiter.clone(),
        cache.clone(),
    ));

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            run_daemon(config, tenants, logs, orchestrator, cache, limiter).await
        }
        Command::Once { tenant_id } => run_once(&tenant_id, tenants, logs, orchestrator).await,
        Command::AddTenant {
            name,
            wb_token,
            spreadsheet_id,
            worksheet,
            sheets_credentials_file,
            cadence_hours,
        } => add_tenant(
            &vault,
            &tenants,
            name,
            wb_token,
            spreadsheet_id,
            worksheet,
            sheets_credentials_file,
            cadence_hours,
        ),
        Command::RemoveTenant { tenant_id } => {
            // Cascade order: rows first, then the in-process keyspaces.
            if !tenants.delete(&tenant_id)? {
                bail!("tenant {tenant_id} not found");
            }
            cache.flush_tenant(&tenant_id);
            limiter.flush_prefix(&format!("tenant:{tenant_id}"));
            Ok(())
        }
        Command::Tenants => list_tenants(&tenants),
    }
}

async fn run_daemon(
    config: Arc<Config>,
    tenants: Arc<TenantStore>,
    logs: Arc<SyncLogStore>,
    orchestrator: Arc<Orchestrator>,
    cache: Arc<TenantCache>,
    limiter: Arc<RateLimiter>,
) -> Result<()> {
    info!(
        workers = config.workers,
        queue = config.queue_capacity,
        "🚀 stocksync starting"
    );

    let scheduler = SyncScheduler::start(config, tenants, logs, orchestrator, cache, limiter);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    scheduler.shutdown().await;
    Ok(())
}

async fn run_once(
    tenant_id: &str,
    tenants: Arc<TenantStore>,
    logs: Arc<SyncLogStore>,
    orchestrator: Arc<Orchestrator>,
) -> Result<()> {
    let Some(tenant) = tenants.get(tenant_id)? else {
        bail!("tenant {tenant_id} not found");
    };

    let soft_deadline = Instant::now() + Duration::from_secs(540);
    let outcome = orchestrator
        .run_sync(&tenant, SyncTrigger::Manual, soft_deadline, &Shutdown::never())
        .await;
    logs.append(&outcome.log)?;

    match outcome.error {
        None => info!(
            status = outcome.log.status.as_str(),
            products = outcome.log.products_processed,
            duration_ms = outcome.log.duration_ms,
            "Sync finished"
        ),
        Some(e) => {
            error!(status = outcome.log.status.as_str(), error = %e, "Sync failed");
            bail!("sync failed: {e}");
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn add_tenant(
    vault: &CredentialVault,
    tenants: &TenantStore,
    name: String,
    wb_token: String,
    spreadsheet_id: String,
    worksheet: String,
    sheets_credentials_file: String,
    cadence_hours: u32,
) -> Result<()> {
    let sheets_credentials = std::fs::read_to_string(&sheets_credentials_file)
        .with_context(|| format!("Failed to read {sheets_credentials_file}"))?;

    // Sanity-parse before encrypting so a bad file fails loudly here, not
    // on the tenant's first sync.
    if serde_json::from_str::<serde_json::Value>(&sheets_credentials).is_err() {
        bail!("{sheets_credentials_file} is not valid JSON");
    }

    let tenant = tenants.create(NewTenant {
        name,
        marketplace: MarketplaceKind::Wildberries,
        marketplace_credentials_enc: vault.encrypt(&wb_token)?,
        spreadsheet_credentials_enc: vault.encrypt(&sheets_credentials)?,
        spreadsheet_id,
        worksheet_name: worksheet,
        cadence_hours,
    })?;

    println!("{}", tenant.id);
    Ok(())
}

fn list_tenants(tenants: &TenantStore) -> Result<()> {
    let active = tenants.list_active()?;
    if active.is_empty() {
        warn!("No active tenants");
        return Ok(());
    }
    for tenant in active {
        println!(
            "{}  {}  {}  every {}h",
            tenant.id,
            tenant.marketplace.as_str(),
            tenant.name,
            tenant.cadence_hours
        );
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stocksync_backend=info,stocksync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
