//! Storage metrics
//!
//! Registered once per store in the caller's [`MetricsRegistry`].

use profstore_core::{Counter, CounterVec, GaugeVec, MetricsRegistry};

/// On-disk size per database
pub const DB_SIZE: &str = "profstore_storage_db_size_bytes";
/// Cached entries per database
pub const CACHE_SIZE: &str = "profstore_storage_cache_size";
/// Per-database GC passes
pub const DB_GC_TOTAL: &str = "profstore_storage_db_gc_total";
/// Aggregate GC passes
pub const GC_TOTAL: &str = "profstore_storage_gc_total";
/// Eviction passes that found memory above the threshold
pub const EVICTIONS_TOTAL: &str = "profstore_storage_evictions_total";

/// Metric handles owned by a store
#[derive(Clone)]
pub struct StorageMetrics {
    /// Gauge of on-disk bytes labeled by database name
    pub db_size: GaugeVec,
    /// Gauge of cached entries labeled by database name
    pub cache_size: GaugeVec,
    /// Counter of per-database GC passes labeled by database name
    pub db_gc: CounterVec,
    /// Counter of aggregate GC passes
    pub gc: Counter,
    /// Counter of eviction passes
    pub evictions: Counter,
}

impl StorageMetrics {
    /// Register the storage families in `registry`
    pub fn new(registry: &MetricsRegistry) -> Self {
        Self {
            db_size: registry.gauge_vec(DB_SIZE, "On-disk size of a database in bytes", "name"),
            cache_size: registry.gauge_vec(CACHE_SIZE, "Number of entries in a database cache", "name"),
            db_gc: registry.counter_vec(DB_GC_TOTAL, "Garbage collection passes per database", "name"),
            gc: registry.counter(GC_TOTAL, "Storage-wide garbage collection passes"),
            evictions: registry.counter(EVICTIONS_TOTAL, "Cache eviction passes"),
        }
    }
}
