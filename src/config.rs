//! Node Configuration
//!
//! Per-subsystem configuration structs with production defaults. A node runs
//! with defaults plus a port and a data directory; everything else is
//! optional. Values can come from a TOML file (`--config`), CLI flags, or the
//! `SERENGETI_DATA_PATH` environment variable (which wins over the flag).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{SerengetiError, SerengetiResult};

/// Environment variable overriding the data path.
pub const DATA_PATH_ENV: &str = "SERENGETI_DATA_PATH";

/// Default HTTP port. The discovery port is reserved for future use; probing
/// goes over HTTP.
pub const DEFAULT_HTTP_PORT: u16 = 1985;
pub const DEFAULT_DISCOVERY_PORT: u16 = 1986;

/// Top-level configuration, one section per subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub cluster: ClusterConfig,
    pub persistence: PersistenceConfig,
    pub query: QueryConfig,
}

/// Identity and boundary settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub http_port: u16,
    /// Reserved; accepted and reported but never bound.
    pub discovery_port: u16,
    pub data_path: PathBuf,
    /// Bearer token required by `GET /admin`.
    pub admin_token: String,
    /// Grace period for draining workers at shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            data_path: PathBuf::from("./serengeti-data"),
            admin_token: "serengeti-admin".to_string(),
            shutdown_timeout_ms: 10_000,
        }
    }
}

/// LSM storage engine settings, shared by every (db, table) engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Memtable freeze threshold in bytes.
    pub memtable_max_bytes: usize,
    /// Level-0 sstable count that triggers a compaction.
    pub compaction_trigger: usize,
    /// Interval between background flush/compaction sweeps.
    pub compaction_interval_ms: u64,
    /// Target bloom filter false positive rate.
    pub bloom_fpr: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            memtable_max_bytes: 4 * 1024 * 1024,
            compaction_trigger: 3,
            compaction_interval_ms: 30_000,
            bloom_fpr: 0.01,
        }
    }
}

/// Discovery, membership, and replication transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Full-subnet sweep interval.
    pub ping_interval_ms: u64,
    /// Per-probe and per-RPC deadline.
    pub network_timeout_ms: u64,
    /// Delay before a lost node triggers replica movement.
    pub reshuffle_debounce_ms: u64,
    /// Bound on concurrent probes during a sweep.
    pub probe_concurrency: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 5_000,
            network_timeout_ms: 2_500,
            reshuffle_debounce_ms: 10_000,
            probe_concurrency: 64,
        }
    }
}

/// Persistence scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub interval_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { interval_ms: 60_000 }
    }
}

/// Query engine settings: memory pool, spill, and result cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Process-wide memory budget for the query pool computation.
    pub memory_budget_bytes: usize,
    /// Fraction of the budget available to queries; the rest is reserved.
    pub query_memory_fraction: f64,
    /// Rows per in-memory sort chunk before the sort spills.
    pub sort_chunk_max_rows: usize,
    /// Hash join partition count.
    pub join_partitions: usize,
    /// Result cache TTL.
    pub cache_ttl_ms: u64,
    /// Result cache capacity in entries.
    pub cache_max_entries: usize,
    /// Optional per-query deadline; `0` means unbounded.
    pub query_timeout_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 256 * 1024 * 1024,
            query_memory_fraction: 0.7,
            sort_chunk_max_rows: 10_000,
            join_partitions: 8,
            cache_ttl_ms: 30_000,
            cache_max_entries: 256,
            query_timeout_ms: 0,
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file. Missing sections fall back to
    /// defaults; an unreadable or malformed file is a startup failure.
    pub fn load(path: &std::path::Path) -> SerengetiResult<Config> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| SerengetiError::Internal(format!("invalid config file: {e}")))
    }

    /// Applies the environment override for the data path.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(DATA_PATH_ENV) {
            if !path.is_empty() {
                self.node.data_path = PathBuf::from(path);
            }
        }
    }

    /// Effective query memory pool in bytes.
    pub fn query_pool_bytes(&self) -> usize {
        (self.query.memory_budget_bytes as f64 * self.query.query_memory_fraction) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.node.http_port, 1985);
        assert_eq!(config.node.discovery_port, 1986);
        assert_eq!(config.cluster.ping_interval_ms, 5_000);
        assert_eq!(config.cluster.network_timeout_ms, 2_500);
        assert_eq!(config.persistence.interval_ms, 60_000);
        assert!((config.query.query_memory_fraction - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serengeti.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[node]\nhttp_port = 2000\n\n[cluster]\nping_interval_ms = 100").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.node.http_port, 2000);
        assert_eq!(config.cluster.ping_interval_ms, 100);
        // Untouched sections keep their defaults.
        assert_eq!(config.storage.compaction_trigger, 3);
        assert_eq!(config.persistence.interval_ms, 60_000);
    }

    #[test]
    fn query_pool_respects_fraction() {
        let mut config = Config::default();
        config.query.memory_budget_bytes = 1000;
        config.query.query_memory_fraction = 0.7;
        assert_eq!(config.query_pool_bytes(), 700);
    }
}
