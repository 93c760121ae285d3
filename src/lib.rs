//! Stocksync Backend Library
//!
//! Exposes the sync-engine modules for use by the binary and tests.

pub mod cache;
pub mod config;
pub mod error;
pub mod marketplace;
pub mod merge;
pub mod models;
pub mod rate_limit;
pub mod sheets;
pub mod shutdown;
pub mod storage;
pub mod sync;
pub mod vault;

pub use config::Config;
pub use error::{ErrorKind, SyncError, SyncResult};
