//! Process configuration.
//!
//! Everything comes from `STOCKSYNC_*` environment variables (dotenv
//! honored), with defaults that work for a single-box deployment.

use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    /// Master encryption key: 64 hex chars or an arbitrary passphrase.
    pub master_key: Option<String>,
    pub wb_analytics_base: String,
    pub wb_statistics_base: String,
    pub sheets_base: String,
    pub sheets_token_url: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub default_cadence_hours: u32,
    /// Aggregation window for the analytics request, days back from today.
    pub aggregates_window_days: u32,
    /// Orders lookback, days back from now (≈ one calendar week is safe).
    pub orders_window_days: u32,
    /// Per-tenant API admission, requests per minute.
    pub tenant_rate_limit_per_min: u32,
    /// Whole-process admission, requests per minute.
    pub global_rate_limit_per_min: u32,
}

pub const DEFAULT_WB_ANALYTICS_BASE: &str = "https://seller-analytics-api.wildberries.ru";
pub const DEFAULT_WB_STATISTICS_BASE: &str = "https://statistics-api.wildberries.ru";
pub const DEFAULT_SHEETS_BASE: &str = "https://sheets.googleapis.com";
pub const DEFAULT_SHEETS_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_path = resolve_data_path(
            std::env::var("STOCKSYNC_DB_PATH").ok(),
            "stocksync.db",
        );

        let master_key = std::env::var("STOCKSYNC_MASTER_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let wb_analytics_base = std::env::var("STOCKSYNC_WB_ANALYTICS_BASE")
            .unwrap_or_else(|_| DEFAULT_WB_ANALYTICS_BASE.to_string());

        let wb_statistics_base = std::env::var("STOCKSYNC_WB_STATISTICS_BASE")
            .unwrap_or_else(|_| DEFAULT_WB_STATISTICS_BASE.to_string());

        let sheets_base = std::env::var("STOCKSYNC_SHEETS_BASE")
            .unwrap_or_else(|_| DEFAULT_SHEETS_BASE.to_string());

        let sheets_token_url = std::env::var("STOCKSYNC_SHEETS_TOKEN_URL")
            .unwrap_or_else(|_| DEFAULT_SHEETS_TOKEN_URL.to_string());

        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        let workers = std::env::var("STOCKSYNC_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or_else(|| (cores * 2).min(8));

        let queue_capacity = std::env::var("STOCKSYNC_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(64);

        let default_cadence_hours = std::env::var("STOCKSYNC_DEFAULT_CADENCE_HOURS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(24);

        let aggregates_window_days = std::env::var("STOCKSYNC_AGGREGATES_WINDOW_DAYS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|&v| v > 0)
            // The analytics endpoint rejects windows longer than 3 months.
            .map(|v| v.min(90))
            .unwrap_or(30);

        let orders_window_days = std::env::var("STOCKSYNC_ORDERS_WINDOW_DAYS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|&v| v > 0)
            .map(|v| v.min(7))
            .unwrap_or(7);

        let tenant_rate_limit_per_min = std::env::var("STOCKSYNC_TENANT_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(100);

        let global_rate_limit_per_min = std::env::var("STOCKSYNC_GLOBAL_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(1000);

        Ok(Self {
            database_path,
            master_key,
            wb_analytics_base,
            wb_statistics_base,
            sheets_base,
            sheets_token_url,
            workers,
            queue_capacity,
            default_cadence_hours,
            aggregates_window_days,
            orders_window_days,
            tenant_rate_limit_per_min,
            global_rate_limit_per_min,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "stocksync.db".to_string(),
            master_key: None,
            wb_analytics_base: DEFAULT_WB_ANALYTICS_BASE.to_string(),
            wb_statistics_base: DEFAULT_WB_STATISTICS_BASE.to_string(),
            sheets_base: DEFAULT_SHEETS_BASE.to_string(),
            sheets_token_url: DEFAULT_SHEETS_TOKEN_URL.to_string(),
            workers: 4,
            queue_capacity: 64,
            default_cadence_hours: 24,
            aggregates_window_days: 30,
            orders_window_days: 7,
            tenant_rate_limit_per_min: 100,
            global_rate_limit_per_min: 1000,
        }
    }
}

/// Relative data paths resolve against the crate directory, not the caller's
/// cwd, so running via --manifest-path doesn't create a stray empty DB.
fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return base.join(default_filename).to_string_lossy().to_string();
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }
    base.join(p).to_string_lossy().to_string()
}

pub fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate directory.
    let _ = dotenv::dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
