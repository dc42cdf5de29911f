//! Coordination cache: named TTL locks, service heartbeats, token blacklist.
//!
//! Locks are fail-closed (store trouble reads as "not acquired"); blacklist
//! checks are fail-open (availability over strictness). The in-process
//! implementation below is the default; the trait is the seam for a shared
//! blob store in multi-process deployments.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Last-seen heartbeat for a background loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait CoordinationCache: Send + Sync {
    /// Acquires the named lock for `owner_id`. Returns false when another
    /// owner holds it (or on store failure).
    async fn acquire_lock(&self, name: &str, owner_id: &str, ttl: Duration) -> bool;

    /// Releases the named lock; only the current owner may release.
    async fn release_lock(&self, name: &str, owner_id: &str) -> bool;

    async fn set_service_health(&self, name: &str, payload: serde_json::Value);

    async fn get_service_health(&self, name: &str) -> Option<ServiceHealth>;

    async fn blacklist_token(&self, jti: &str, ttl: Duration);

    /// False when the store is unreachable: a down cache must not lock
    /// every user out.
    async fn is_token_blacklisted(&self, jti: &str) -> bool;
}

struct LockEntry {
    owner_id: String,
    expires_at: Instant,
}

#[derive(Default)]
struct MemoryCacheState {
    locks: HashMap<String, LockEntry>,
    health: HashMap<String, ServiceHealth>,
    blacklist: HashMap<String, Instant>,
}

/// Process-local cache implementation.
#[derive(Default)]
pub struct MemoryCache {
    state: Mutex<MemoryCacheState>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn sweep(state: &mut MemoryCacheState) {
        let now = Instant::now();
        state.locks.retain(|_, entry| entry.expires_at > now);
        state.blacklist.retain(|_, expires| *expires > now);
    }
}

#[async_trait]
impl CoordinationCache for MemoryCache {
    async fn acquire_lock(&self, name: &str, owner_id: &str, ttl: Duration) -> bool {
        let mut state = self.state.lock();
        Self::sweep(&mut state);
        match state.locks.get(name) {
            Some(entry) if entry.owner_id != owner_id => false,
            _ => {
                state.locks.insert(
                    name.to_string(),
                    LockEntry {
                        owner_id: owner_id.to_string(),
                        expires_at: Instant::now() + ttl,
                    },
                );
                true
            }
        }
    }

    async fn release_lock(&self, name: &str, owner_id: &str) -> bool {
        let mut state = self.state.lock();
        Self::sweep(&mut state);
        match state.locks.get(name) {
            Some(entry) if entry.owner_id == owner_id => {
                state.locks.remove(name);
                true
            }
            _ => false,
        }
    }

    async fn set_service_health(&self, name: &str, payload: serde_json::Value) {
        self.state.lock().health.insert(
            name.to_string(),
            ServiceHealth {
                payload,
                updated_at: Utc::now(),
            },
        );
    }

    async fn get_service_health(&self, name: &str) -> Option<ServiceHealth> {
        self.state.lock().health.get(name).cloned()
    }

    async fn blacklist_token(&self, jti: &str, ttl: Duration) {
        let mut state = self.state.lock();
        Self::sweep(&mut state);
        state
            .blacklist
            .insert(jti.to_string(), Instant::now() + ttl);
    }

    async fn is_token_blacklisted(&self, jti: &str) -> bool {
        let mut state = self.state.lock();
        Self::sweep(&mut state);
        state.blacklist.contains_key(jti)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_single_holder() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(30);
        assert!(cache.acquire_lock("webhook:u1:BTCUSDT:60:long", "a", ttl).await);
        assert!(!cache.acquire_lock("webhook:u1:BTCUSDT:60:long", "b", ttl).await);
        // Re-entrant for the same owner (refreshes the TTL).
        assert!(cache.acquire_lock("webhook:u1:BTCUSDT:60:long", "a", ttl).await);
    }

    #[tokio::test]
    async fn test_lock_owner_checked_release() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(30);
        assert!(cache.acquire_lock("lock", "a", ttl).await);
        assert!(!cache.release_lock("lock", "b").await);
        assert!(cache.release_lock("lock", "a").await);
        assert!(cache.acquire_lock("lock", "b", ttl).await);
    }

    #[tokio::test]
    async fn test_lock_expires() {
        let cache = MemoryCache::new();
        assert!(cache.acquire_lock("lock", "a", Duration::from_millis(10)).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.acquire_lock("lock", "b", Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn test_blacklist_roundtrip() {
        let cache = MemoryCache::new();
        assert!(!cache.is_token_blacklisted("jti-1").await);
        cache.blacklist_token("jti-1", Duration::from_secs(60)).await;
        assert!(cache.is_token_blacklisted("jti-1").await);
    }

    #[tokio::test]
    async fn test_service_health() {
        let cache = MemoryCache::new();
        cache
            .set_service_health("fill_monitor", serde_json::json!({"iteration": 7}))
            .await;
        let health = cache.get_service_health("fill_monitor").await.unwrap();
        assert_eq!(health.payload["iteration"], 7);
        assert!(cache.get_service_health("risk_engine").await.is_none());
    }
}
