//! Storage orchestrator
//!
//! [`Storage`] owns the store's databases and the background tasks that keep
//! them within memory and disk budgets:
//!
//! | task                     | mutex | body                                      |
//! |--------------------------|-------|-------------------------------------------|
//! | `profstore-gc`           | yes   | full GC once disk usage grew by `gc_size_diff` |
//! | `profstore-db-gc-<name>` | yes   | incremental GC of one database            |
//! | `profstore-evict`        | yes   | evict trees, write back the other caches  |
//! | `profstore-write-back`   | yes   | write back every cache, dictionaries last |
//! | `profstore-metrics`      | no    | refresh size gauges                       |
//!
//! Databases open in dependency order and close in reverse dependency
//! layers, so dictionaries outlive every flush of the trees cache.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use profstore_core::{ByteSize, CloseError, MetricsRegistry, Result, StoreError};
use profstore_storage::{
    Cache, CacheMaintenance, CacheOptions, Engine, EngineOpener, LogEngineOpener, RetentionPolicy,
};

use crate::codecs::{DictionaryCodec, DimensionCodec, SegmentCodec, TreeCodec};
use crate::config::StorageConfig;
use crate::database::{Db, DISCARD_RATIO};
use crate::graph::{DatabaseKind, DependencyGraph};
use crate::labels::Labels;
use crate::memory::{MemoryProbe, SystemMemory};
use crate::metrics::StorageMetrics;
use crate::migrate::migrate;
use crate::tasks::{write_back_all, EvictionTask, SizeWatcher, TaskSet};

// ============================================================================
// Construction helpers
// ============================================================================

/// Databases opened so far during construction
#[derive(Default)]
struct Opening {
    dbs: HashMap<DatabaseKind, Arc<Db>>,
    main: Option<Arc<dyn Engine>>,
    dictionaries: Option<Arc<Cache<DictionaryCodec>>>,
    dimensions: Option<Arc<Cache<DimensionCodec>>>,
    segments: Option<Arc<Cache<SegmentCodec>>>,
    trees: Option<Arc<Cache<TreeCodec>>>,
}

impl Opening {
    fn open(
        &mut self,
        kind: DatabaseKind,
        config: &StorageConfig,
        registry: &MetricsRegistry,
        metrics: &StorageMetrics,
        opener: &dyn EngineOpener,
    ) -> Result<()> {
        let path = config.storage_path.join(kind.name());
        std::fs::create_dir_all(&path)?;
        let engine = opener.open(&path, &config.engine_options(kind.name()))?;

        let options = CacheOptions {
            name: kind.name().to_string(),
            prefix: kind.prefix().to_string(),
            ttl: config.cache_ttl(),
        };
        let engine_handle = Arc::clone(&engine);
        let cache: Option<Arc<dyn CacheMaintenance>> = match kind {
            DatabaseKind::Main => {
                self.main = Some(Arc::clone(&engine));
                None
            }
            DatabaseKind::Dictionaries => {
                let cache = Arc::new(Cache::new(engine_handle, registry, options, DictionaryCodec));
                self.dictionaries = Some(Arc::clone(&cache));
                Some(cache as Arc<dyn CacheMaintenance>)
            }
            DatabaseKind::Dimensions => {
                let cache = Arc::new(Cache::new(engine_handle, registry, options, DimensionCodec));
                self.dimensions = Some(Arc::clone(&cache));
                Some(cache as Arc<dyn CacheMaintenance>)
            }
            DatabaseKind::Segments => {
                let cache = Arc::new(Cache::new(engine_handle, registry, options, SegmentCodec));
                self.segments = Some(Arc::clone(&cache));
                Some(cache as Arc<dyn CacheMaintenance>)
            }
            DatabaseKind::Trees => {
                let Some(dictionaries) = self.dictionaries.clone() else {
                    // Keep the engine closable on the failure path.
                    let db = Db::new(kind, engine, None, metrics.db_gc.with_label_values(kind.name()));
                    self.dbs.insert(kind, Arc::new(db));
                    return Err(StoreError::InvalidOperation(
                        "trees database opened before dictionaries".to_string(),
                    ));
                };
                let codec = TreeCodec::new(dictionaries);
                let cache = Arc::new(Cache::new(engine_handle, registry, options, codec));
                self.trees = Some(Arc::clone(&cache));
                Some(cache as Arc<dyn CacheMaintenance>)
            }
        };

        let db = Db::new(kind, engine, cache, metrics.db_gc.with_label_values(kind.name()));
        self.dbs.insert(kind, Arc::new(db));
        debug!(target: "profstore::storage", db = kind.name(), path = %path.display(), "opened database");
        Ok(())
    }
}

fn missing(kind: DatabaseKind) -> StoreError {
    StoreError::InvalidOperation(format!("{} database was not opened", kind.name()))
}

/// Close databases layer by layer; each layer closes concurrently.
fn close_layers(layers: &[Vec<DatabaseKind>], dbs: &HashMap<DatabaseKind, Arc<Db>>) -> std::result::Result<(), CloseError> {
    let mut errors = CloseError::new();
    for layer in layers {
        let results: Vec<(&'static str, std::result::Result<(), CloseError>)> = std::thread::scope(|s| {
            let handles: Vec<_> = layer
                .iter()
                .filter_map(|kind| dbs.get(kind))
                .map(|db| (db.name(), s.spawn(move || db.close())))
                .collect();
            handles
                .into_iter()
                .map(|(name, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        let mut e = CloseError::new();
                        e.push(name, StoreError::engine("close panicked"));
                        Err(e)
                    });
                    (name, result)
                })
                .collect()
        });
        for (name, result) in results {
            match result {
                Ok(()) => debug!(target: "profstore::storage", db = name, "closed database"),
                Err(e) => errors.merge(e),
            }
        }
    }
    errors.into_result()
}

/// Write-back visits databases in close order, so a dependency is written
/// after every cache whose write-back may dirty it.
fn write_back_order(layers: &[Vec<DatabaseKind>]) -> Vec<DatabaseKind> {
    layers.iter().flatten().copied().collect()
}

fn total_size(dbs: &[Arc<Db>]) -> ByteSize {
    dbs.iter().map(|d| d.size()).sum()
}

/// Full GC pass over every database; the caller holds the maintenance mutex.
fn collect_garbage_locked(dbs: &[Arc<Db>], metrics: &StorageMetrics) {
    let before = total_size(dbs);
    info!(target: "profstore::storage", size = %before, "starting garbage collection");
    for db in dbs {
        db.run_gc(DISCARD_RATIO);
    }
    metrics.gc.inc();
    info!(
        target: "profstore::storage",
        before = %before,
        after = %total_size(dbs),
        "garbage collection finished"
    );
}

fn refresh_metrics(dbs: &[Arc<Db>], metrics: &StorageMetrics) {
    for db in dbs {
        metrics
            .db_size
            .with_label_values(db.name())
            .set(db.size().as_u64() as f64);
        if let Some(cache) = db.cache() {
            metrics
                .cache_size
                .with_label_values(db.name())
                .set(cache.size() as f64);
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

/// The storage orchestrator.
///
/// Construct with [`Storage::open`]; call [`Storage::close`] to stop the
/// background tasks and close every database. Dropping an open store closes
/// it and logs any failure.
pub struct Storage {
    config: StorageConfig,
    metrics: StorageMetrics,

    /// Databases in reporting order
    dbs: Vec<Arc<Db>>,
    by_kind: HashMap<DatabaseKind, Arc<Db>>,
    close_layers: Vec<Vec<DatabaseKind>>,

    main: Arc<dyn Engine>,
    labels: Labels,
    dictionaries: Arc<Cache<DictionaryCodec>>,
    dimensions: Arc<Cache<DimensionCodec>>,
    segments: Arc<Cache<SegmentCodec>>,
    trees: Arc<Cache<TreeCodec>>,

    maintenance: Arc<Mutex<()>>,
    tasks: Mutex<TaskSet>,
    closed: AtomicBool,
}

impl Storage {
    /// Open the store with the bundled engine and the system memory probe.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, a database cannot be opened,
    /// migration fails, total memory cannot be determined, or a task cannot
    /// be started. Databases opened before the failure are closed again and
    /// no task is left running.
    pub fn open(config: StorageConfig, registry: &MetricsRegistry) -> Result<Self> {
        Self::open_with(config, registry, &LogEngineOpener, Arc::new(SystemMemory))
    }

    /// Open the store over a custom engine opener and memory probe.
    pub fn open_with(
        config: StorageConfig,
        registry: &MetricsRegistry,
        opener: &dyn EngineOpener,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage_path)?;

        let graph = DependencyGraph::default();
        let order = graph.open_order()?;
        let layers = graph.close_layers()?;
        let metrics = StorageMetrics::new(registry);

        let mut opening = Opening::default();
        for kind in order {
            if let Err(e) = opening.open(kind, &config, registry, &metrics, opener) {
                error!(target: "profstore::storage", db = kind.name(), error = %e, "failed to open database");
                Self::release(&layers, &opening.dbs);
                return Err(e);
            }
        }

        match Self::assemble(config, metrics, opening, layers, probe) {
            Ok(storage) => Ok(storage),
            Err((e, layers, dbs)) => {
                error!(target: "profstore::storage", error = %e, "failed to start storage");
                Self::release(&layers, &dbs);
                Err(e)
            }
        }
    }

    fn release(layers: &[Vec<DatabaseKind>], dbs: &HashMap<DatabaseKind, Arc<Db>>) {
        if let Err(e) = close_layers(layers, dbs) {
            error!(target: "profstore::storage", error = %e, "failed to release databases");
        }
    }

    /// Everything after the databases are open. On failure, hands the
    /// databases back so the caller can release them.
    #[allow(clippy::type_complexity)]
    fn assemble(
        config: StorageConfig,
        metrics: StorageMetrics,
        opening: Opening,
        layers: Vec<Vec<DatabaseKind>>,
        probe: Arc<dyn MemoryProbe>,
    ) -> std::result::Result<Self, (StoreError, Vec<Vec<DatabaseKind>>, HashMap<DatabaseKind, Arc<Db>>)> {
        let Opening {
            dbs: by_kind,
            main,
            dictionaries,
            dimensions,
            segments,
            trees,
        } = opening;

        let handles = (|| -> Result<_> {
            Ok((
                main.ok_or_else(|| missing(DatabaseKind::Main))?,
                dictionaries.ok_or_else(|| missing(DatabaseKind::Dictionaries))?,
                dimensions.ok_or_else(|| missing(DatabaseKind::Dimensions))?,
                segments.ok_or_else(|| missing(DatabaseKind::Segments))?,
                trees.ok_or_else(|| missing(DatabaseKind::Trees))?,
            ))
        })();
        let (main, dictionaries, dimensions, segments, trees) = match handles {
            Ok(h) => h,
            Err(e) => return Err((e, layers, by_kind)),
        };

        let labels = Labels::new(Arc::clone(&main));

        if let Err(e) = migrate(main.as_ref()) {
            return Err((e, layers, by_kind));
        }

        let mem_total = match probe.total_memory() {
            Ok(0) => {
                return Err((
                    StoreError::MemoryProbe("total memory reported as zero".to_string()),
                    layers,
                    by_kind,
                ))
            }
            Ok(n) => n,
            Err(e) => return Err((e, layers, by_kind)),
        };

        let dbs: Vec<Arc<Db>> = DatabaseKind::REPORT_ORDER
            .iter()
            .filter_map(|k| by_kind.get(k).cloned())
            .collect();

        let maintenance = Arc::new(Mutex::new(()));
        let mut tasks = TaskSet::new(Arc::clone(&maintenance));
        let eviction = EvictionTask::new(
            config.cache_evict_threshold,
            config.cache_evict_volume,
            mem_total,
            probe,
            vec![Arc::clone(&trees) as Arc<dyn CacheMaintenance>],
            vec![
                Arc::clone(&dictionaries) as Arc<dyn CacheMaintenance>,
                Arc::clone(&dimensions) as Arc<dyn CacheMaintenance>,
                Arc::clone(&segments) as Arc<dyn CacheMaintenance>,
            ],
            metrics.evictions.clone(),
        );

        let write_back: Vec<Arc<dyn CacheMaintenance>> = write_back_order(&layers)
            .iter()
            .filter_map(|k| by_kind.get(k))
            .filter_map(|d| d.cache().cloned())
            .collect();

        if let Err(e) = Self::start_tasks(&mut tasks, &config, &metrics, &dbs, eviction, write_back) {
            tasks.shutdown();
            return Err((e, layers, by_kind));
        }

        info!(
            target: "profstore::storage",
            path = %config.storage_path.display(),
            databases = dbs.len(),
            tasks = tasks.len(),
            "storage opened"
        );

        Ok(Self {
            config,
            metrics,
            dbs,
            by_kind,
            close_layers: layers,
            main,
            labels,
            dictionaries,
            dimensions,
            segments,
            trees,
            maintenance,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }

    fn start_tasks(
        tasks: &mut TaskSet,
        config: &StorageConfig,
        metrics: &StorageMetrics,
        dbs: &[Arc<Db>],
        eviction: EvictionTask,
        write_back: Vec<Arc<dyn CacheMaintenance>>,
    ) -> Result<()> {
        {
            let dbs = dbs.to_vec();
            let metrics = metrics.clone();
            let mut watcher = SizeWatcher::new(config.gc_size_diff);
            tasks.spawn_maintenance("profstore-gc", config.gc_interval(), move || {
                if watcher.observe(total_size(&dbs)) {
                    collect_garbage_locked(&dbs, &metrics);
                }
            })?;
        }

        tasks.spawn_maintenance("profstore-evict", config.evict_interval(), move || {
            eviction.run();
        })?;

        tasks.spawn_maintenance("profstore-write-back", config.write_back_interval(), move || {
            write_back_all(&write_back)
        })?;

        {
            let dbs = dbs.to_vec();
            let metrics = metrics.clone();
            tasks.spawn_periodic("profstore-metrics", config.metrics_update_interval(), move || {
                refresh_metrics(&dbs, &metrics)
            })?;
        }

        for db in dbs {
            let db = Arc::clone(db);
            let diff = config.gc_size_diff;
            tasks.spawn_maintenance(
                &format!("profstore-db-gc-{}", db.name()),
                config.db_gc_interval(),
                move || {
                    db.gc_tick(diff);
                },
            )?;
        }
        Ok(())
    }

    /// Stop every task, then close the databases.
    ///
    /// Databases close in dependency layers: everything but dictionaries
    /// concurrently, then dictionaries. Every database is attempted even if
    /// another failed; all failures are returned together.
    ///
    /// Calling `close` again returns `Ok(())` once the first call finished;
    /// a call racing the first one blocks until it is done.
    pub fn close(&self) -> std::result::Result<(), CloseError> {
        let mut tasks = self.tasks.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tasks.shutdown();
        let result = close_layers(&self.close_layers, &self.by_kind);
        drop(tasks);
        match &result {
            Ok(()) => info!(target: "profstore::storage", "storage closed"),
            Err(e) => error!(target: "profstore::storage", error = %e, "storage closed with errors"),
        }
        result
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// On-disk bytes per database name
    pub fn disk_usage(&self) -> BTreeMap<String, ByteSize> {
        self.dbs
            .iter()
            .map(|d| (d.name().to_string(), d.size()))
            .collect()
    }

    /// Cached entries per database name, for databases with a cache
    pub fn cache_stats(&self) -> BTreeMap<String, u64> {
        self.dbs
            .iter()
            .filter_map(|d| d.cache().map(|c| (d.name().to_string(), c.size() as u64)))
            .collect()
    }

    /// Sum of every database's on-disk size
    pub fn total_disk_usage(&self) -> ByteSize {
        total_size(&self.dbs)
    }

    /// Run a full GC pass now, waiting for any running maintenance first
    pub fn collect_garbage(&self) {
        let _guard = self.maintenance.lock();
        collect_garbage_locked(&self.dbs, &self.metrics);
    }

    /// Retention policy built from the configuration
    pub fn retention_policy(&self) -> RetentionPolicy {
        self.config.retention_policy()
    }

    /// Bytes to reclaim to get back under the retention size limit
    pub fn capacity_to_reclaim(&self) -> ByteSize {
        self.retention_policy()
            .capacity_to_reclaim(self.total_disk_usage(), self.config.reclaim_size_ratio)
    }

    /// Check whether a write of data starting at `start` may proceed.
    ///
    /// # Errors
    ///
    /// `StoreError::Closed` once shutdown began; `StoreError::RetentionViolation`
    /// if `start` is older than the retention policy keeps.
    pub fn admit_write(&self, start: SystemTime) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        if self.retention_policy().is_expired(start, SystemTime::now()) {
            return Err(StoreError::RetentionViolation);
        }
        Ok(())
    }

    /// The configuration the store was opened with
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Root directory of the store
    pub fn path(&self) -> &Path {
        &self.config.storage_path
    }

    /// Database wrapper by kind
    pub fn database(&self, kind: DatabaseKind) -> Option<&Arc<Db>> {
        self.by_kind.get(&kind)
    }

    /// Databases in reporting order
    pub fn databases(&self) -> &[Arc<Db>] {
        &self.dbs
    }

    /// Main database engine
    pub fn main(&self) -> &Arc<dyn Engine> {
        &self.main
    }

    /// Label index
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Dictionaries cache
    pub fn dictionaries(&self) -> &Arc<Cache<DictionaryCodec>> {
        &self.dictionaries
    }

    /// Dimensions cache
    pub fn dimensions(&self) -> &Arc<Cache<DimensionCodec>> {
        &self.dimensions
    }

    /// Segments cache
    pub fn segments(&self) -> &Arc<Cache<SegmentCodec>> {
        &self.segments
    }

    /// Trees cache
    pub fn trees(&self) -> &Arc<Cache<TreeCodec>> {
        &self.trees
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.close() {
                error!(target: "profstore::storage", error = %e, "failed to close storage on drop");
            }
        }
    }
}
