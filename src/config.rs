//! Cluster Configuration
//!
//! Process-wide settings fixed at initialization. They can be loaded from a JSON document
//! (the same shape as an internal-config string), a file, and `OBJLIFE_*` environment
//! variables, in that order of precedence from lowest to highest.

use crate::eviction::policy::StoreRetryPolicy;
use crate::membership::types::LivenessTiming;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "OBJLIFE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// Capacity of each node's object store, in bytes.
    pub object_store_memory: u64,
    /// How many eviction passes a full store attempts before failing a put.
    pub object_store_full_max_retries: u32,
    /// Wait before the first retry of a full store; doubles on every attempt.
    pub object_store_full_initial_delay_ms: u64,
    /// Delay between attempts of a crashed task unless the task overrides it.
    pub task_retry_delay_ms: u64,
    /// Retry budget for tasks submitted without an explicit one.
    pub default_max_retries: u32,
    pub num_nodes: usize,
    /// Executor workers started with the cluster, spread across nodes.
    pub num_workers: usize,
    pub heartbeat_interval_ms: u64,
    pub suspect_timeout_ms: u64,
    pub dead_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            object_store_memory: 100 * 1024 * 1024,
            object_store_full_max_retries: 5,
            object_store_full_initial_delay_ms: 10,
            task_retry_delay_ms: 100,
            default_max_retries: 3,
            num_nodes: 1,
            num_workers: 2,
            heartbeat_interval_ms: 100,
            suspect_timeout_ms: 1_000,
            dead_timeout_ms: 3_000,
        }
    }
}

impl ClusterConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ClusterConfig =
            serde_json::from_str(json).context("invalid cluster config JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json(&raw)
    }

    /// Applies `OBJLIFE_<FIELD>` variables from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup. Keys are `OBJLIFE_` plus the
    /// upper-cased field name.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", key, e))
        }

        let var = |field: &str| {
            let key = format!("{}{}", ENV_PREFIX, field.to_uppercase());
            lookup(&key).map(|raw| (key, raw))
        };

        if let Some((k, v)) = var("object_store_memory") {
            self.object_store_memory = parse(&k, v)?;
        }
        if let Some((k, v)) = var("object_store_full_max_retries") {
            self.object_store_full_max_retries = parse(&k, v)?;
        }
        if let Some((k, v)) = var("object_store_full_initial_delay_ms") {
            self.object_store_full_initial_delay_ms = parse(&k, v)?;
        }
        if let Some((k, v)) = var("task_retry_delay_ms") {
            self.task_retry_delay_ms = parse(&k, v)?;
        }
        if let Some((k, v)) = var("default_max_retries") {
            self.default_max_retries = parse(&k, v)?;
        }
        if let Some((k, v)) = var("num_nodes") {
            self.num_nodes = parse(&k, v)?;
        }
        if let Some((k, v)) = var("num_workers") {
            self.num_workers = parse(&k, v)?;
        }
        if let Some((k, v)) = var("heartbeat_interval_ms") {
            self.heartbeat_interval_ms = parse(&k, v)?;
        }
        if let Some((k, v)) = var("suspect_timeout_ms") {
            self.suspect_timeout_ms = parse(&k, v)?;
        }
        if let Some((k, v)) = var("dead_timeout_ms") {
            self.dead_timeout_ms = parse(&k, v)?;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.object_store_memory == 0 {
            anyhow::bail!("object_store_memory must be greater than zero");
        }
        if self.num_nodes == 0 {
            anyhow::bail!("num_nodes must be at least 1");
        }
        if self.num_workers == 0 {
            anyhow::bail!("num_workers must be at least 1");
        }
        if self.heartbeat_interval_ms == 0 {
            anyhow::bail!("heartbeat_interval_ms must be greater than zero");
        }
        if self.suspect_timeout_ms <= self.heartbeat_interval_ms {
            anyhow::bail!(
                "suspect_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.suspect_timeout_ms,
                self.heartbeat_interval_ms
            );
        }
        if self.dead_timeout_ms <= self.suspect_timeout_ms {
            anyhow::bail!(
                "dead_timeout_ms ({}) must exceed suspect_timeout_ms ({})",
                self.dead_timeout_ms,
                self.suspect_timeout_ms
            );
        }
        Ok(())
    }

    pub fn task_retry_delay(&self) -> Duration {
        Duration::from_millis(self.task_retry_delay_ms)
    }

    pub fn store_retry(&self) -> StoreRetryPolicy {
        StoreRetryPolicy {
            max_retries: self.object_store_full_max_retries,
            initial_delay: Duration::from_millis(self.object_store_full_initial_delay_ms),
        }
    }

    pub fn liveness_timing(&self) -> LivenessTiming {
        LivenessTiming {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            suspect_timeout: Duration::from_millis(self.suspect_timeout_ms),
            dead_timeout: Duration::from_millis(self.dead_timeout_ms),
        }
    }
}
