//! Service-discovery seam.
//!
//! The coordinator must be strongly consistent: the register-if-absent
//! primitive is what enforces one live session per user across the cluster.
//! `MemoryDiscovery` is that contract for a single process (development and
//! tests); a production deployment plugs an etcd-backed implementation in
//! behind the same trait.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use gated_core::error::Result;

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Register `key → value` with a TTL (zero = no expiry).
    ///
    /// With `exclusive`, an existing unexpired entry wins and `Ok(false)` is
    /// returned; without it the entry is overwritten (TTL refresh).
    async fn register(
        &self,
        key: &str,
        value: &str,
        exclusive: bool,
        ttl: Duration,
    ) -> Result<bool>;

    async fn unregister(&self, key: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// All entries whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|t| t <= Instant::now())
    }
}

/// In-process coordinator.
#[derive(Default)]
pub struct MemoryDiscovery {
    entries: DashMap<String, Entry>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn register(
        &self,
        key: &str,
        value: &str,
        exclusive: bool,
        ttl: Duration,
    ) -> Result<bool> {
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        let mut slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry { value: value.to_string(), expires_at });
        if exclusive && !slot.expired() && slot.value != value {
            return Ok(false);
        }
        slot.value = value.to_string();
        slot.expires_at = expires_at;
        Ok(true)
    }

    async fn unregister(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .get(key)
            .filter(|e| !e.expired())
            .map(|e| e.value.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.expired())
            .map(|e| (e.key().clone(), e.value.clone()))
            .collect())
    }
}
