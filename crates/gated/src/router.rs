//! Module → topic router cache.
//!
//! Bootstrapped from discovery at init; after that, mutated only by `Router`
//! control messages consumed from the broker. Reads never block writers.

use dashmap::DashMap;

use gated_core::error::{GateError, Result};

use crate::cluster::Discovery;

/// Discovery table holding `<project>/gated/routes/<module> → topic`.
pub const ROUTES_TABLE: &str = "gated/routes";

#[derive(Default)]
pub struct RouterCache {
    routes: DashMap<String, String>,
}

impl RouterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Warm the cache from discovery.
    pub async fn init(&self, discovery: &dyn Discovery, project: &str) -> Result<()> {
        let prefix = format!("{project}/{ROUTES_TABLE}/");
        for (key, topic) in discovery.list(&prefix).await? {
            if let Some(module) = key.rsplit('/').next() {
                tracing::debug!(module = %module, topic = %topic, "route loaded");
                self.routes.insert(module.to_string(), topic);
            }
        }
        Ok(())
    }

    pub fn add(&self, module: &str, topic: &str) {
        self.routes.insert(module.to_string(), topic.to_string());
    }

    pub fn remove(&self, module: &str) {
        self.routes.remove(module);
    }

    pub fn lookup(&self, module: &str) -> Result<String> {
        self.routes
            .get(module)
            .map(|r| r.value().clone())
            .ok_or_else(|| GateError::RouterNotFound(module.to_string()))
    }
}
