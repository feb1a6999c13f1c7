// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::retry::RetryConfig;

/// Name of the pool used when none is configured.
pub const DEFAULT_POOL: &str = "default";

/// One processor pool and its worker count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Pool identifier (`processorPoolId` of instances dispatched to it).
    pub id: String,
    /// Fixed number of workers.
    pub workers: usize,
}

impl PoolConfig {
    /// Create a pool configuration.
    pub fn new(id: impl Into<String>, workers: usize) -> Self {
        Self {
            id: id.into(),
            workers,
        }
    }
}

/// Waypoint engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Processor pools
    pub pools: Vec<PoolConfig>,
    /// Retry policy for store operations
    pub store_retry: RetryConfig,
    /// How long unmatched responses are kept for later waits
    pub early_response_ttl: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `WAYPOINT_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `WAYPOINT_POOLS`: `id=workers` pairs separated by commas (default: `default=4`)
    /// - `WAYPOINT_STORE_MAX_ATTEMPTS`: attempts per store operation (default: 3)
    /// - `WAYPOINT_STORE_RETRY_DELAY_MS`: base retry delay (default: 100)
    /// - `WAYPOINT_EARLY_RESPONSE_TTL_SECS`: early response retention (default: 300)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("WAYPOINT_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("WAYPOINT_DATABASE_URL"))?;

        let pools = parse_pools(
            &std::env::var("WAYPOINT_POOLS").unwrap_or_else(|_| format!("{}=4", DEFAULT_POOL)),
        )?;

        let max_attempts: u32 = std::env::var("WAYPOINT_STORE_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "WAYPOINT_STORE_MAX_ATTEMPTS",
                "must be a positive integer",
            ))?;

        let delay_ms: u64 = std::env::var("WAYPOINT_STORE_RETRY_DELAY_MS")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("WAYPOINT_STORE_RETRY_DELAY_MS", "must be a number of milliseconds")
            })?;

        let ttl_secs: u64 = std::env::var("WAYPOINT_EARLY_RESPONSE_TTL_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("WAYPOINT_EARLY_RESPONSE_TTL_SECS", "must be a number of seconds")
            })?;

        Ok(Self {
            database_url,
            pools,
            store_retry: RetryConfig::new(max_attempts, delay_ms),
            early_response_ttl: Duration::from_secs(ttl_secs),
        })
    }
}

fn parse_pools(raw: &str) -> Result<Vec<PoolConfig>, ConfigError> {
    const VAR: &str = "WAYPOINT_POOLS";
    let mut pools: Vec<PoolConfig> = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (id, workers) = part
            .split_once('=')
            .ok_or(ConfigError::Invalid(VAR, "expected id=workers pairs"))?;
        let id = id.trim();
        if id.is_empty() {
            return Err(ConfigError::Invalid(VAR, "pool id must not be empty"));
        }
        let workers: usize = workers
            .trim()
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(VAR, "worker count must be a positive integer"))?;
        if pools.iter().any(|p| p.id == id) {
            return Err(ConfigError::Invalid(VAR, "pool ids must be unique"));
        }
        pools.push(PoolConfig::new(id, workers));
    }
    if pools.is_empty() {
        return Err(ConfigError::Invalid(VAR, "at least one pool is required"));
    }
    Ok(pools)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
