//! Storage configuration via `profstore.toml`
//!
//! Every setting has a default, so an empty file (or
//! `StorageConfig::default()`) is a valid configuration. Intervals are given
//! in milliseconds; sizes accept either a byte count or a string such as
//! `"256MB"`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use profstore_core::{ByteSize, Result, StoreError};
use profstore_storage::{EngineOptions, RetentionPolicy};

/// Config file name placed in the storage directory.
pub const CONFIG_FILE_NAME: &str = "profstore.toml";

/// Age cap for one aggregation level
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionLevel {
    /// Aggregation level
    pub level: u32,
    /// Maximum age in milliseconds (0 = no cap)
    pub max_age_ms: u64,
}

/// Storage configuration loaded from `profstore.toml`.
///
/// # Example
///
/// ```toml
/// storage_path = "/var/lib/profstore"
/// gc_size_diff = "256MB"
/// cache_evict_threshold = 0.25
///
/// [[retention_levels]]
/// level = 0
/// max_age_ms = 86400000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory; each database lives in a subdirectory named after it
    pub storage_path: PathBuf,

    /// How often size gauges are refreshed
    pub metrics_update_interval_ms: u64,
    /// How often dirty cache entries are written back
    pub write_back_interval_ms: u64,
    /// How often memory pressure is checked
    pub evict_interval_ms: u64,
    /// Idle time after which clean cache entries are dropped
    pub cache_ttl_ms: u64,
    /// How often aggregate disk usage is checked for GC
    pub gc_interval_ms: u64,
    /// How often each database checks its own size for GC
    pub db_gc_interval_ms: u64,
    /// Growth that triggers garbage collection (0 = every tick)
    pub gc_size_diff: ByteSize,

    /// Memory used / total at which eviction starts
    pub cache_evict_threshold: f64,
    /// Share of the trees cache evicted per eviction
    pub cache_evict_volume: f64,

    /// Absolute retention in milliseconds (0 = unlimited)
    pub retention_ms: u64,
    /// Retained size limit (0 = unlimited)
    pub retention_size: ByteSize,
    /// Share of the size limit reclaimed on top of the overflow
    pub reclaim_size_ratio: f64,

    /// Most verbose level engines log at: error, warn, info, debug, trace
    pub engine_log_level: String,
    /// Fail on a torn value-log tail instead of truncating it
    pub engine_no_truncate: bool,
    /// fsync after every engine write
    pub engine_sync_writes: bool,
    /// Flatten each engine while closing it
    pub engine_compact_on_close: bool,
    /// Value-log segment rotation size
    pub value_log_file_size: ByteSize,

    /// Per-level age caps
    pub retention_levels: Vec<RetentionLevel>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("profstore-data"),
            metrics_update_interval_ms: 10_000,
            write_back_interval_ms: 60_000,
            evict_interval_ms: 20_000,
            cache_ttl_ms: 120_000,
            gc_interval_ms: 300_000,
            db_gc_interval_ms: 300_000,
            gc_size_diff: ByteSize(256 * ByteSize::MB.as_u64()),
            cache_evict_threshold: 0.25,
            cache_evict_volume: 0.33,
            retention_ms: 0,
            retention_size: ByteSize(0),
            reclaim_size_ratio: 0.05,
            engine_log_level: "error".to_string(),
            engine_no_truncate: false,
            engine_sync_writes: false,
            engine_compact_on_close: false,
            value_log_file_size: ByteSize(64 * ByteSize::MB.as_u64()),
            retention_levels: Vec::new(),
        }
    }
}

impl StorageConfig {
    /// Default configuration rooted at `path`
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: path.into(),
            ..Self::default()
        }
    }

    /// Check that the configuration can drive the store.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Config` for an empty storage path, a zero task
    /// interval, or an eviction threshold/volume outside `(0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if self.storage_path.as_os_str().is_empty() {
            return Err(StoreError::config("storage_path must not be empty"));
        }
        let intervals = [
            ("metrics_update_interval_ms", self.metrics_update_interval_ms),
            ("write_back_interval_ms", self.write_back_interval_ms),
            ("evict_interval_ms", self.evict_interval_ms),
            ("gc_interval_ms", self.gc_interval_ms),
            ("db_gc_interval_ms", self.db_gc_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(StoreError::config(format!("{} must be greater than zero", name)));
            }
        }
        for (name, value) in [
            ("cache_evict_threshold", self.cache_evict_threshold),
            ("cache_evict_volume", self.cache_evict_volume),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(StoreError::config(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.reclaim_size_ratio) {
            return Err(StoreError::config(format!(
                "reclaim_size_ratio must be in [0, 1], got {}",
                self.reclaim_size_ratio
            )));
        }
        Ok(())
    }

    /// Metrics refresh interval
    pub fn metrics_update_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_update_interval_ms)
    }

    /// Write-back interval
    pub fn write_back_interval(&self) -> Duration {
        Duration::from_millis(self.write_back_interval_ms)
    }

    /// Eviction check interval
    pub fn evict_interval(&self) -> Duration {
        Duration::from_millis(self.evict_interval_ms)
    }

    /// Cache entry TTL
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Aggregate GC check interval
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    /// Per-database GC check interval
    pub fn db_gc_interval(&self) -> Duration {
        Duration::from_millis(self.db_gc_interval_ms)
    }

    /// Parsed engine log level; unknown values fall back to `ERROR`
    pub fn engine_log_level(&self) -> tracing::Level {
        tracing::Level::from_str(self.engine_log_level.trim()).unwrap_or(tracing::Level::ERROR)
    }

    /// Engine options for the database called `name`
    pub fn engine_options(&self, name: &str) -> EngineOptions {
        EngineOptions {
            name: name.to_string(),
            truncate: !self.engine_no_truncate,
            sync_writes: self.engine_sync_writes,
            compact_on_close: self.engine_compact_on_close,
            value_log_file_size: self.value_log_file_size.as_u64(),
            log_level: self.engine_log_level(),
        }
    }

    /// Retention policy described by the retention settings
    pub fn retention_policy(&self) -> RetentionPolicy {
        self.retention_levels.iter().fold(
            RetentionPolicy::new()
                .set_absolute_max_age(Duration::from_millis(self.retention_ms))
                .set_size_limit(self.retention_size),
            |policy, l| policy.set_level_max_age(l.level, Duration::from_millis(l.max_age_ms)),
        )
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Profstore storage configuration

# Root directory. Each database is kept in its own subdirectory.
storage_path = "profstore-data"

# Background task intervals (milliseconds)
metrics_update_interval_ms = 10000
write_back_interval_ms = 60000
evict_interval_ms = 20000
gc_interval_ms = 300000
db_gc_interval_ms = 300000

# Clean cache entries idle for longer than this are dropped (milliseconds)
cache_ttl_ms = 120000

# Garbage collection runs once disk usage grew by this much (0 = every tick)
gc_size_diff = "256MB"

# Eviction starts when used/total memory reaches the threshold, and drops
# this share of the trees cache each time.
cache_evict_threshold = 0.25
cache_evict_volume = 0.33

# Retention (0 = unlimited)
retention_ms = 0
retention_size = "0B"
reclaim_size_ratio = 0.05

# Engine settings
engine_log_level = "error"
engine_no_truncate = false
engine_sync_writes = false
engine_compact_on_close = false
value_log_file_size = "64MB"

# Per-level age caps
# [[retention_levels]]
# level = 0
# max_age_ms = 86400000
"#
    }

    /// Read, parse and validate config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StoreError::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: StorageConfig = toml::from_str(&content).map_err(|e| {
            StoreError::config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| StoreError::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
