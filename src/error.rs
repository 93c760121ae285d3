//! Error taxonomy shared by every sync component.
//!
//! Components translate lower-level failures into a `SyncError` carrying one
//! of the kinds below before returning to the orchestrator; the orchestrator
//! alone decides the terminal sync status.

use thiserror::Error;

/// Classification of a sync-time failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Required configuration absent at startup. Fatal; aborts boot.
    ConfigMissing,
    /// Credential blob failed to decrypt or parse.
    CredentialCorrupt,
    /// Retriable upstream error (5xx, 429, transport). Retried inside the
    /// marketplace client; surfaces only once attempts are exhausted.
    MarketplaceTransient,
    /// Non-retriable upstream error (4xx other than 429).
    MarketplaceInvalid,
    /// Spreadsheet quota exhausted. The projector retries once after a pause.
    QuotaExceeded,
    /// Soft or hard timeout elapsed.
    Deadline,
    /// Job cancelled by scheduler shutdown.
    Cancelled,
    /// Dispatch queue is full; the enqueue was rejected.
    QueueFull,
    /// Persistence failure (sqlite).
    Storage,
    /// Unexpected programming error.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigMissing => "config_missing",
            ErrorKind::CredentialCorrupt => "credential_corrupt",
            ErrorKind::MarketplaceTransient => "marketplace_transient",
            ErrorKind::MarketplaceInvalid => "marketplace_invalid",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Deadline => "deadline",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::Storage => "storage",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether a failed job may be re-enqueued as a retry attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorKind::MarketplaceTransient | ErrorKind::QuotaExceeded | ErrorKind::Storage
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct SyncError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SyncError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn config_missing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigMissing, message)
    }

    pub fn credential(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CredentialCorrupt, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MarketplaceTransient, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MarketplaceInvalid, message)
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QuotaExceeded, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::new(ErrorKind::Storage, e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        // Transport-level failures are retriable by policy; status-mapped
        // errors are classified at the call site where the status is known.
        SyncError::new(ErrorKind::MarketplaceTransient, e.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(ErrorKind::CredentialCorrupt.as_str(), "credential_corrupt");
        assert_eq!(ErrorKind::QuotaExceeded.as_str(), "quota_exceeded");
        assert_eq!(ErrorKind::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn test_retriable_kinds() {
        assert!(ErrorKind::MarketplaceTransient.is_retriable());
        assert!(ErrorKind::QuotaExceeded.is_retriable());
        assert!(!ErrorKind::MarketplaceInvalid.is_retriable());
        assert!(!ErrorKind::CredentialCorrupt.is_retriable());
        assert!(!ErrorKind::Cancelled.is_retriable());
    }
}
