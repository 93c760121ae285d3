//! Tenant-scoped TTL cache.
//!
//! Physical keys are namespaced `tenant:{id}:{key}` so one tenant's
//! invalidation can never touch another's entries. Values are opaque strings
//! (callers store JSON). The cache is advisory: a miss is always a valid
//! answer, and the sync pipeline must produce identical results with the
//! cache wiped — it only saves re-fetching marketplace responses under retry
//! and debounces redundant projector reads.

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

pub struct TenantCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    default_ttl: Duration,
}

impl Default for TenantCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl TenantCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    fn physical_key(tenant_id: &str, key: &str) -> String {
        format!("tenant:{}:{}", tenant_id, key)
    }

    pub fn get(&self, tenant_id: &str, key: &str) -> Option<String> {
        let physical = Self::physical_key(tenant_id, key);
        {
            let entries = self.entries.read();
            match entries.get(&physical) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.value.clone());
                }
                Some(_) => {} // expired, fall through to removal
                None => return None,
            }
        }
        self.entries.write().remove(&physical);
        None
    }

    pub fn set(&self, tenant_id: &str, key: &str, value: impl Into<String>, ttl: Option<Duration>) {
        let physical = Self::physical_key(tenant_id, key);
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.entries.write().insert(
            physical,
            CacheEntry {
                value: value.into(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn delete(&self, tenant_id: &str, key: &str) {
        self.entries
            .write()
            .remove(&Self::physical_key(tenant_id, key));
    }

    /// JSON convenience over get/set for typed payloads.
    pub fn get_json<T: DeserializeOwned>(&self, tenant_id: &str, key: &str) -> Option<T> {
        let raw = self.get(tenant_id, key)?;
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(tenant_id, key, error = %e, "Dropping undecodable cache entry");
                self.delete(tenant_id, key);
                None
            }
        }
    }

    pub fn set_json<T: Serialize>(
        &self,
        tenant_id: &str,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) {
        if let Ok(raw) = serde_json::to_string(value) {
            self.set(tenant_id, key, raw, ttl);
        }
    }

    /// Delete every key of a tenant matching `pattern`: exact match, or
    /// prefix match when the pattern ends with `*`.
    pub fn invalidate_pattern(&self, tenant_id: &str, pattern: &str) {
        let prefix = Self::physical_key(tenant_id, pattern.trim_end_matches('*'));
        let exact = !pattern.ends_with('*');
        let mut entries = self.entries.write();
        entries.retain(|key, _| {
            if exact {
                key != &prefix
            } else {
                !key.starts_with(&prefix)
            }
        });
    }

    pub fn flush_tenant(&self, tenant_id: &str) {
        let prefix = format!("tenant:{}:", tenant_id);
        let mut entries = self.entries.write();
        entries.retain(|key, _| !key.starts_with(&prefix));
    }

    /// Drop expired entries (call from a background task).
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> TenantCache {
        TenantCache::new(Duration::from_secs(60))
    }

    #[test]
    fn test_set_get_roundtrip() {
        let c = cache();
        c.set("t1", "orders", "[1,2,3]", None);
        assert_eq!(c.get("t1", "orders").as_deref(), Some("[1,2,3]"));
    }

    #[test]
    fn test_tenant_isolation() {
        let c = cache();
        c.set("t1", "k", "a", None);
        c.set("t2", "k", "b", None);
        assert_eq!(c.get("t1", "k").as_deref(), Some("a"));
        assert_eq!(c.get("t2", "k").as_deref(), Some("b"));
        c.flush_tenant("t1");
        assert!(c.get("t1", "k").is_none());
        assert_eq!(c.get("t2", "k").as_deref(), Some("b"));
    }

    #[test]
    fn test_ttl_expiry() {
        let c = cache();
        c.set("t1", "k", "v", Some(Duration::from_millis(20)));
        assert!(c.get("t1", "k").is_some());
        std::thread::sleep(Duration::from_millis(30));
        assert!(c.get("t1", "k").is_none());
        // The expired entry was evicted, not just hidden.
        assert!(c.is_empty());
    }

    #[test]
    fn test_invalidate_pattern_prefix() {
        let c = cache();
        c.set("t1", "wb:orders:1", "a", None);
        c.set("t1", "wb:orders:2", "b", None);
        c.set("t1", "wb:remains", "c", None);
        c.invalidate_pattern("t1", "wb:orders:*");
        assert!(c.get("t1", "wb:orders:1").is_none());
        assert!(c.get("t1", "wb:orders:2").is_none());
        assert_eq!(c.get("t1", "wb:remains").as_deref(), Some("c"));
    }

    #[test]
    fn test_invalidate_pattern_exact() {
        let c = cache();
        c.set("t1", "wb:remains", "c", None);
        c.set("t1", "wb:remains:extra", "d", None);
        c.invalidate_pattern("t1", "wb:remains");
        assert!(c.get("t1", "wb:remains").is_none());
        assert_eq!(c.get("t1", "wb:remains:extra").as_deref(), Some("d"));
    }

    #[test]
    fn test_json_roundtrip() {
        let c = cache();
        c.set_json("t1", "nums", &vec![1u32, 2, 3], None);
        assert_eq!(c.get_json::<Vec<u32>>("t1", "nums"), Some(vec![1, 2, 3]));
        // Corrupt entries are dropped on read.
        c.set("t1", "nums", "not json", None);
        assert_eq!(c.get_json::<Vec<u32>>("t1", "nums"), None);
        assert!(c.get("t1", "nums").is_none());
    }

    #[test]
    fn test_sweep_removes_expired_only() {
        let c = cache();
        c.set("t1", "old", "v", Some(Duration::from_millis(10)));
        c.set("t1", "new", "v", Some(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(20));
        c.sweep();
        assert_eq!(c.len(), 1);
        assert!(c.get("t1", "new").is_some());
    }
}
