//! Configuration for the storage core.
//!
//! Sources and precedence (highest wins):
//! 1. Environment variables (`LTBASE_ENGINE_*`)
//! 2. Config file (JSON)
//! 3. Defaults

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LtBaseError, Result};

/// Default per-query timeout when none is configured.
const DEFAULT_QUERY_TIMEOUT_MS: u64 = 30_000;
/// Default row-count threshold for cost-based cold routing.
const DEFAULT_MAX_COLD_SCAN_ROWS: i64 = 100_000;

/// Logical table names of one entity store deployment.
///
/// `main` and `eav` are required for reads; `change_log` is required for
/// writes when CDC is enabled and optional otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageTables {
    pub main: String,
    pub eav: String,
    #[serde(default)]
    pub change_log: Option<String>,
}

impl StorageTables {
    #[must_use]
    pub fn new(main: impl Into<String>, eav: impl Into<String>) -> Self {
        Self {
            main: main.into(),
            eav: eav.into(),
            change_log: None,
        }
    }

    #[must_use]
    pub fn with_change_log(mut self, change_log: impl Into<String>) -> Self {
        self.change_log = Some(change_log.into());
        self
    }

    /// Reads need both the main and the EAV table.
    pub fn validate_for_read(&self) -> Result<()> {
        if self.main.trim().is_empty() {
            return Err(LtBaseError::EmptyTableName {
                context: "main table",
            });
        }
        if self.eav.trim().is_empty() {
            return Err(LtBaseError::EmptyTableName { context: "eav table" });
        }
        Ok(())
    }
}

/// Object-store credentials for remote cold-tier tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub endpoint: String,
}

impl ObjectStoreConfig {
    /// Whether credentials are present at all.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.access_key_id.is_empty() && !self.secret_access_key.is_empty()
    }
}

/// Routing sub-policy of the analytic engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// `freshness-first`, `cost-first`, `hybrid`, or anything else (which
    /// leaves the defaults standing).
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_max_cold_scan_rows")]
    pub max_cold_scan_rows: i64,
    #[serde(default = "default_true")]
    pub allow_object_store_fallback: bool,
}

fn default_strategy() -> String {
    "hybrid".to_string()
}

const fn default_max_cold_scan_rows() -> i64 {
    DEFAULT_MAX_COLD_SCAN_ROWS
}

const fn default_true() -> bool {
    true
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_cold_scan_rows: DEFAULT_MAX_COLD_SCAN_ROWS,
            allow_object_store_fallback: true,
        }
    }
}

/// Analytic-engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Database path; empty means in-memory.
    #[serde(default)]
    pub db_path: String,
    /// Memory limit in megabytes; 0 leaves the engine default.
    #[serde(default)]
    pub memory_limit_mb: u64,
    /// Thread count; 0 leaves the engine default.
    #[serde(default)]
    pub max_parallelism: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// Extensions installed and loaded best-effort on open.
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
}

const fn default_max_connections() -> usize {
    1
}

const fn default_query_timeout_ms() -> u64 {
    DEFAULT_QUERY_TIMEOUT_MS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            db_path: String::new(),
            memory_limit_mb: 0,
            max_parallelism: 0,
            max_connections: 1,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            extensions: Vec::new(),
            object_store: ObjectStoreConfig::default(),
            routing: RoutingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file, falling back to defaults when it is missing,
    /// then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            serde_json::from_str(&contents)?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `LTBASE_ENGINE_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Some(enabled) = env_bool("LTBASE_ENGINE_ENABLED") {
            self.enabled = enabled;
        }
        if let Ok(path) = env::var("LTBASE_ENGINE_DB_PATH") {
            self.db_path = path;
        }
        if let Some(limit) = env_parse("LTBASE_ENGINE_MEMORY_LIMIT_MB") {
            self.memory_limit_mb = limit;
        }
        if let Some(threads) = env_parse("LTBASE_ENGINE_MAX_PARALLELISM") {
            self.max_parallelism = threads;
        }
        if let Some(connections) = env_parse("LTBASE_ENGINE_MAX_CONNECTIONS") {
            self.max_connections = connections;
        }
        if let Some(timeout) = env_parse("LTBASE_ENGINE_QUERY_TIMEOUT_MS") {
            self.query_timeout_ms = timeout;
        }
        if let Ok(strategy) = env::var("LTBASE_ENGINE_ROUTING_STRATEGY") {
            if !strategy.trim().is_empty() {
                self.routing.strategy = strategy;
            }
        }
    }

    /// `max_connections >= 1`, `query_timeout > 0`.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections < 1 {
            return Err(LtBaseError::InvalidEngineConfig {
                reason: "max_connections must be >= 1",
            });
        }
        if self.query_timeout_ms == 0 {
            return Err(LtBaseError::InvalidEngineConfig {
                reason: "query_timeout must be > 0",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Whether the engine runs in-memory.
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        self.db_path.trim().is_empty()
    }
}

fn env_bool(key: &str) -> Option<bool> {
    match env::var(key).ok()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok()?.trim().parse().ok()
}
