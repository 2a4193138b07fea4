//! Integration tests for the storage orchestrator
//!
//! Most tests run the store over in-memory fake engines that log every call,
//! so ordering and lifecycle guarantees can be checked directly:
//! - Databases close in dependency layers, dictionaries last
//! - Nothing touches an engine after it was closed
//! - A failed open releases what was already opened
//! - GC, eviction and metrics tasks fire on their thresholds
//!
//! The last module runs the store end to end over the real log engine.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tempfile::TempDir;

use profstore_core::{ByteSize, MetricsRegistry, Result, StoreError};
use profstore_engine::metrics::{DB_GC_TOTAL, DB_SIZE, EVICTIONS_TOTAL, GC_TOTAL};
use profstore_engine::{
    DatabaseKind, Dimension, EvictionTask, MemoryProbe, Segment, Storage, StorageConfig, Tree,
    CURRENT_SCHEMA_VERSION,
};
use profstore_storage::{
    CacheMaintenance, Engine, EngineOpener, EngineOptions, GcOutcome, LogEngineOpener,
};

// ============================================================================
// Fakes
// ============================================================================

type EventLog = Arc<Mutex<Vec<(String, &'static str)>>>;

/// In-memory engine recording every call
struct FakeEngine {
    name: String,
    log: EventLog,
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    size: AtomicU64,
    fail_close: bool,
    close_delay: Duration,
    closed: AtomicBool,
    closes: AtomicUsize,
    flattens: AtomicUsize,
    calls_after_close: AtomicUsize,
}

impl FakeEngine {
    fn record(&self, op: &'static str) {
        if op != "close" && self.closed.load(Ordering::SeqCst) {
            self.calls_after_close.fetch_add(1, Ordering::SeqCst);
        }
        self.log.lock().push((self.name.clone(), op));
    }
}

impl Engine for FakeEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.record("get");
        Ok(self.data.lock().get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.record("set");
        self.data.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.record("delete");
        self.data.lock().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.record("scan");
        Ok(self
            .data
            .lock()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn size(&self) -> (u64, u64) {
        (0, self.size.load(Ordering::SeqCst))
    }

    fn flatten(&self, _workers: usize) -> Result<()> {
        self.record("flatten");
        self.flattens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn run_value_log_gc(&self, _discard_ratio: f64) -> Result<GcOutcome> {
        self.record("gc");
        Ok(GcOutcome::NoRewrite)
    }

    fn close(&self) -> Result<()> {
        self.record("close");
        std::thread::sleep(self.close_delay);
        self.closed.store(true, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(StoreError::engine("close failed"));
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeOpener {
    log: EventLog,
    engines: Mutex<BTreeMap<String, Arc<FakeEngine>>>,
    fail_open: Option<&'static str>,
    fail_close: Option<&'static str>,
    slow_close: Option<&'static str>,
}

impl FakeOpener {
    fn engine(&self, name: &str) -> Arc<FakeEngine> {
        Arc::clone(&self.engines.lock()[name])
    }

    fn opened(&self) -> BTreeSet<String> {
        self.engines.lock().keys().cloned().collect()
    }

    fn events_of(&self, op: &'static str) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|(_, o)| *o == op)
            .map(|(n, _)| n.clone())
            .collect()
    }
}

impl EngineOpener for FakeOpener {
    fn open(&self, _path: &Path, options: &EngineOptions) -> Result<Arc<dyn Engine>> {
        if self.fail_open == Some(options.name.as_str()) {
            return Err(StoreError::engine("open failed"));
        }
        let engine = Arc::new(FakeEngine {
            name: options.name.clone(),
            log: Arc::clone(&self.log),
            data: Mutex::new(BTreeMap::new()),
            size: AtomicU64::new(0),
            fail_close: self.fail_close == Some(options.name.as_str()),
            close_delay: if self.slow_close == Some(options.name.as_str()) {
                Duration::from_millis(100)
            } else {
                Duration::ZERO
            },
            closed: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
            flattens: AtomicUsize::new(0),
            calls_after_close: AtomicUsize::new(0),
        });
        self.engines
            .lock()
            .insert(options.name.clone(), Arc::clone(&engine));
        Ok(engine)
    }
}

struct FakeProbe {
    total: u64,
    used: AtomicU64,
}

impl FakeProbe {
    fn new(total: u64, used: u64) -> Arc<Self> {
        Arc::new(Self {
            total,
            used: AtomicU64::new(used),
        })
    }
}

impl MemoryProbe for FakeProbe {
    fn total_memory(&self) -> Result<u64> {
        Ok(self.total)
    }

    fn used_memory(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }
}

/// Cache stand-in recording maintenance calls into a shared log
struct RecordingCache {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl CacheMaintenance for RecordingCache {
    fn name(&self) -> &str {
        self.name
    }

    fn size(&self) -> usize {
        0
    }

    fn flush(&self) -> Result<()> {
        self.log.lock().push(format!("flush {}", self.name));
        Ok(())
    }

    fn write_back(&self) -> Result<()> {
        self.log.lock().push(format!("write_back {}", self.name));
        Ok(())
    }

    fn evict(&self, percent: f64) -> Result<()> {
        self.log.lock().push(format!("evict {} {}", self.name, percent));
        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

const HOUR_MS: u64 = 3_600_000;

/// Config whose tasks tick once at startup and then sleep for an hour
fn quiet_config(dir: &TempDir) -> StorageConfig {
    StorageConfig {
        metrics_update_interval_ms: HOUR_MS,
        write_back_interval_ms: HOUR_MS,
        evict_interval_ms: HOUR_MS,
        gc_interval_ms: HOUR_MS,
        db_gc_interval_ms: HOUR_MS,
        ..StorageConfig::with_path(dir.path())
    }
}

fn open_fake(config: StorageConfig, opener: &FakeOpener, registry: &MetricsRegistry) -> Storage {
    Storage::open_with(config, registry, opener, FakeProbe::new(1 << 30, 0)).unwrap()
}

/// Poll `cond` until it holds or five seconds pass
fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn all_names() -> BTreeSet<String> {
    DatabaseKind::ALL.iter().map(|k| k.name().to_string()).collect()
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[test]
    fn test_open_creates_every_database() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener::default();
        let storage = open_fake(quiet_config(&dir), &opener, &MetricsRegistry::new());

        assert_eq!(opener.opened(), all_names());
        for kind in DatabaseKind::ALL {
            assert!(dir.path().join(kind.name()).is_dir());
            assert!(storage.database(kind).is_some());
        }
        storage.close().unwrap();
    }

    #[test]
    fn test_open_writes_schema_version() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener::default();
        let storage = open_fake(quiet_config(&dir), &opener, &MetricsRegistry::new());

        let version = storage
            .main()
            .get(profstore_engine::migrate::SCHEMA_VERSION_KEY)
            .unwrap()
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION.to_le_bytes().to_vec());
        storage.close().unwrap();
    }

    #[test]
    fn test_dictionaries_close_last() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener::default();
        let storage = open_fake(quiet_config(&dir), &opener, &MetricsRegistry::new());
        storage.close().unwrap();

        let closes = opener.events_of("close");
        assert_eq!(closes.len(), 5);
        assert_eq!(closes[4], "dicts");
        let first: BTreeSet<String> = closes[..4].iter().cloned().collect();
        let expected: BTreeSet<String> = ["main", "dimensions", "segments", "trees"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(first, expected);
    }

    #[test]
    fn test_trees_flush_reaches_dictionaries_before_they_close() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener::default();
        let storage = open_fake(quiet_config(&dir), &opener, &MetricsRegistry::new());

        let mut tree = Tree::new();
        tree.insert(&["main", "work"], 7);
        storage.trees().put("app:1", tree);
        storage.close().unwrap();

        let dicts = opener.engine("dicts");
        assert!(dicts.data.lock().contains_key(b"d:app".as_slice()));
        assert!(opener.engine("trees").data.lock().contains_key(b"t:app:1".as_slice()));
        assert_eq!(dicts.calls_after_close.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_close_failure_still_closes_everything() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener {
            fail_close: Some("segments"),
            ..FakeOpener::default()
        };
        let storage = open_fake(quiet_config(&dir), &opener, &MetricsRegistry::new());

        let err = storage.close().unwrap_err();
        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].0, "segments");
        for name in all_names() {
            assert_eq!(opener.engine(&name).closes.load(Ordering::SeqCst), 1, "{}", name);
        }
        assert_eq!(opener.events_of("close").last().map(String::as_str), Some("dicts"));
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener::default();
        let storage = open_fake(quiet_config(&dir), &opener, &MetricsRegistry::new());

        storage.close().unwrap();
        storage.close().unwrap();
        drop(storage);
        for name in all_names() {
            assert_eq!(opener.engine(&name).closes.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_concurrent_close_waits_for_the_first() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener {
            slow_close: Some("dicts"),
            ..FakeOpener::default()
        };
        let storage = open_fake(quiet_config(&dir), &opener, &MetricsRegistry::new());

        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    storage.close().unwrap();
                    // Whichever call returns, every database is already closed
                    for name in all_names() {
                        assert_eq!(opener.engine(&name).closes.load(Ordering::SeqCst), 1, "{}", name);
                    }
                });
            }
        });
        assert_eq!(opener.events_of("close").len(), 5);
    }

    #[test]
    fn test_drop_closes_open_storage() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener::default();
        drop(open_fake(quiet_config(&dir), &opener, &MetricsRegistry::new()));
        assert_eq!(opener.events_of("close").len(), 5);
    }

    #[test]
    fn test_no_engine_calls_after_close() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener::default();
        let config = StorageConfig {
            metrics_update_interval_ms: 1,
            write_back_interval_ms: 1,
            evict_interval_ms: 1,
            gc_interval_ms: 1,
            db_gc_interval_ms: 1,
            gc_size_diff: ByteSize(0),
            ..StorageConfig::with_path(dir.path())
        };
        // Memory always above the threshold so eviction runs every tick
        let probe = FakeProbe::new(100, 100);
        let storage =
            Storage::open_with(config, &MetricsRegistry::new(), &opener, probe).unwrap();

        for i in 0..50 {
            storage.segments().put(&format!("s{}", i), Segment(vec![i as u8; 16]));
            let mut dim = Dimension::new();
            dim.insert(format!("k{}", i));
            storage.dimensions().put(&format!("d{}", i), dim);
        }
        std::thread::sleep(Duration::from_millis(30));
        storage.close().unwrap();

        let events = opener.log.lock().len();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(opener.log.lock().len(), events);
        for name in all_names() {
            assert_eq!(
                opener.engine(&name).calls_after_close.load(Ordering::SeqCst),
                0,
                "{} was used after close",
                name
            );
        }
    }
}

// ============================================================================
// Failed construction
// ============================================================================

mod failed_open {
    use super::*;

    #[test]
    fn test_open_failure_releases_opened_databases() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener {
            fail_open: Some("segments"),
            ..FakeOpener::default()
        };
        let result = Storage::open_with(
            quiet_config(&dir),
            &MetricsRegistry::new(),
            &opener,
            FakeProbe::new(1 << 30, 0),
        );
        assert!(result.is_err());

        let opened: BTreeSet<String> = ["main", "dicts", "dimensions"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(opener.opened(), opened);
        for name in &opened {
            let engine = opener.engine(name);
            assert_eq!(engine.closes.load(Ordering::SeqCst), 1);
            assert_eq!(engine.flattens.load(Ordering::SeqCst), 0);
        }
        assert_eq!(opener.events_of("close").last().map(String::as_str), Some("dicts"));
    }

    #[test]
    fn test_zero_total_memory_fails_open() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener::default();
        let result = Storage::open_with(
            quiet_config(&dir),
            &MetricsRegistry::new(),
            &opener,
            FakeProbe::new(0, 0),
        );
        assert!(matches!(result, Err(StoreError::MemoryProbe(_))));

        assert_eq!(opener.opened(), all_names());
        for name in all_names() {
            let engine = opener.engine(&name);
            assert_eq!(engine.closes.load(Ordering::SeqCst), 1);
            assert_eq!(engine.flattens.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn test_invalid_config_opens_nothing() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener::default();
        let config = StorageConfig {
            cache_evict_threshold: 0.0,
            ..quiet_config(&dir)
        };
        let result =
            Storage::open_with(config, &MetricsRegistry::new(), &opener, FakeProbe::new(1, 0));
        assert!(matches!(result, Err(StoreError::Config(_))));
        assert!(opener.opened().is_empty());
    }
}

// ============================================================================
// Background tasks
// ============================================================================

mod tasks {
    use super::*;

    #[test]
    fn test_first_tick_runs_gc_on_every_database() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener::default();
        let registry = MetricsRegistry::new();
        let storage = open_fake(quiet_config(&dir), &opener, &registry);

        assert!(wait_for(|| DatabaseKind::ALL
            .iter()
            .all(|k| registry.counter_value(DB_GC_TOTAL, k.name()) == Some(1))));
        storage.close().unwrap();

        for name in all_names() {
            assert_eq!(opener.engine(&name).flattens.load(Ordering::SeqCst), 1);
        }
        // Sizes never moved past the default threshold
        assert_eq!(registry.counter_value(GC_TOTAL, ""), Some(0));
    }

    #[test]
    fn test_gc_fires_only_past_size_threshold() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener::default();
        let registry = MetricsRegistry::new();
        let config = StorageConfig {
            gc_interval_ms: 2,
            gc_size_diff: ByteSize(100),
            ..quiet_config(&dir)
        };
        let storage = open_fake(config, &opener, &registry);
        // Growth of exactly the threshold does not trigger
        opener.engine("main").size.store(100, Ordering::SeqCst);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.counter_value(GC_TOTAL, ""), Some(0));

        opener.engine("trees").size.store(1, Ordering::SeqCst);
        assert!(wait_for(|| registry.counter_value(GC_TOTAL, "") == Some(1)));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.counter_value(GC_TOTAL, ""), Some(1));
        storage.close().unwrap();
    }

    #[test]
    fn test_collect_garbage_covers_every_database() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener::default();
        let registry = MetricsRegistry::new();
        let storage = open_fake(quiet_config(&dir), &opener, &registry);
        assert!(wait_for(|| DatabaseKind::ALL
            .iter()
            .all(|k| registry.counter_value(DB_GC_TOTAL, k.name()) == Some(1))));

        storage.collect_garbage();
        storage.close().unwrap();

        assert_eq!(registry.counter_value(GC_TOTAL, ""), Some(1));
        for name in all_names() {
            assert_eq!(opener.engine(&name).flattens.load(Ordering::SeqCst), 2);
        }
    }

    #[test]
    fn test_metrics_task_reports_sizes() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener::default();
        let registry = MetricsRegistry::new();
        let config = StorageConfig {
            metrics_update_interval_ms: 2,
            ..quiet_config(&dir)
        };
        let storage = open_fake(config, &opener, &registry);
        opener.engine("segments").size.store(4096, Ordering::SeqCst);

        assert!(wait_for(|| registry.gauge_value(DB_SIZE, "segments") == Some(4096.0)));
        storage.close().unwrap();
    }

    #[test]
    fn test_stats_are_stable_without_writes() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener::default();
        let storage = open_fake(quiet_config(&dir), &opener, &MetricsRegistry::new());
        opener.engine("main").size.store(10, Ordering::SeqCst);

        let usage = storage.disk_usage();
        assert_eq!(usage.len(), 5);
        assert_eq!(usage["main"], ByteSize(10));
        assert_eq!(storage.disk_usage(), usage);
        assert_eq!(storage.cache_stats(), storage.cache_stats());
        assert!(!storage.cache_stats().contains_key("main"));
        storage.close().unwrap();
    }

    fn eviction(used: u64, log: &Arc<Mutex<Vec<String>>>, registry: &MetricsRegistry) -> EvictionTask {
        let cache = |name| -> Arc<dyn CacheMaintenance> {
            Arc::new(RecordingCache {
                name,
                log: Arc::clone(log),
            })
        };
        EvictionTask::new(
            0.25,
            0.5,
            1000,
            FakeProbe::new(1000, used),
            vec![cache("trees")],
            vec![cache("dicts"), cache("dimensions"), cache("segments")],
            registry.counter(EVICTIONS_TOTAL, "evictions"),
        )
    }

    #[test]
    fn test_eviction_below_threshold_is_noop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = MetricsRegistry::new();
        assert!(!eviction(249, &log, &registry).run());
        assert!(log.lock().is_empty());
        assert_eq!(registry.counter_value(EVICTIONS_TOTAL, ""), Some(0));
    }

    #[test]
    fn test_eviction_at_threshold_evicts_trees_then_writes_back() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = MetricsRegistry::new();
        assert!(eviction(250, &log, &registry).run());
        assert_eq!(
            *log.lock(),
            vec![
                "evict trees 0.5".to_string(),
                "write_back dicts".to_string(),
                "write_back dimensions".to_string(),
                "write_back segments".to_string(),
            ]
        );
        assert_eq!(registry.counter_value(EVICTIONS_TOTAL, ""), Some(1));
    }
}

// ============================================================================
// Retention
// ============================================================================

mod retention {
    use super::*;

    #[test]
    fn test_admit_write_honours_absolute_retention() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener::default();
        let config = StorageConfig {
            retention_ms: HOUR_MS,
            ..quiet_config(&dir)
        };
        let storage = open_fake(config, &opener, &MetricsRegistry::new());
        let now = SystemTime::now();

        storage.admit_write(now).unwrap();
        assert!(matches!(
            storage.admit_write(now - Duration::from_secs(2 * 3600)),
            Err(StoreError::RetentionViolation)
        ));

        storage.close().unwrap();
        assert!(matches!(storage.admit_write(now), Err(StoreError::Closed)));
    }

    #[test]
    fn test_unlimited_retention_admits_anything() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener::default();
        let storage = open_fake(quiet_config(&dir), &opener, &MetricsRegistry::new());
        assert!(storage.retention_policy().is_unlimited());
        storage.admit_write(SystemTime::UNIX_EPOCH).unwrap();
        assert_eq!(storage.capacity_to_reclaim(), ByteSize(0));
        storage.close().unwrap();
    }

    #[test]
    fn test_capacity_to_reclaim_over_limit() {
        let dir = TempDir::new().unwrap();
        let opener = FakeOpener::default();
        let config = StorageConfig {
            retention_size: ByteSize(1000),
            reclaim_size_ratio: 0.1,
            ..quiet_config(&dir)
        };
        let storage = open_fake(config, &opener, &MetricsRegistry::new());
        opener.engine("segments").size.store(1200, Ordering::SeqCst);

        assert_eq!(storage.capacity_to_reclaim(), ByteSize(300));
        storage.close().unwrap();
    }
}

// ============================================================================
// End to end over the log engine
// ============================================================================

mod end_to_end {
    use super::*;

    fn open_real(dir: &TempDir) -> Storage {
        open_real_with(dir, &MetricsRegistry::new())
    }

    fn open_real_with(dir: &TempDir, registry: &MetricsRegistry) -> Storage {
        Storage::open_with(
            quiet_config(dir),
            registry,
            &LogEngineOpener,
            FakeProbe::new(1 << 30, 0),
        )
        .unwrap()
    }

    #[test]
    fn test_data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let storage = open_real(&dir);
            let mut tree = Tree::new();
            tree.insert(&["main", "parse", "lex"], 30);
            tree.insert(&["main", "eval"], 12);
            storage.trees().put("app:1", tree);

            let mut dim = Dimension::new();
            dim.insert("segment-a");
            storage.dimensions().put("app", dim);
            storage.segments().put("app:seg", Segment(b"opaque".to_vec()));
            storage.labels().put("region", "eu-west").unwrap();
            storage.close().unwrap();
        }

        let storage = open_real(&dir);
        let tree = storage.trees().get("app:1").unwrap().unwrap();
        assert_eq!(tree.value(&["main", "parse", "lex"]), 30);
        assert_eq!(tree.total(), 42);

        let dim = storage.dimensions().get("app").unwrap().unwrap();
        assert_eq!(dim.keys().collect::<Vec<_>>(), vec!["segment-a"]);
        assert_eq!(
            storage.segments().get("app:seg").unwrap(),
            Some(Segment(b"opaque".to_vec()))
        );
        assert_eq!(storage.labels().values("region").unwrap(), vec!["eu-west"]);
        assert!(storage.dictionaries().get("app").unwrap().is_some());
        storage.close().unwrap();
    }

    #[test]
    fn test_disk_usage_reports_every_database() {
        let dir = TempDir::new().unwrap();
        let storage = open_real(&dir);
        storage.segments().put("s", Segment(vec![1u8; 1024]));
        storage.segments().flush().unwrap();

        let usage = storage.disk_usage();
        let names: BTreeSet<String> = usage.keys().cloned().collect();
        assert_eq!(names, all_names());
        assert!(usage["segments"] >= ByteSize(1024));
        assert_eq!(storage.total_disk_usage(), usage.values().copied().sum());
        storage.close().unwrap();
    }

    #[test]
    fn test_disk_usage_never_shrinks_under_writes() {
        let dir = TempDir::new().unwrap();
        let registry = MetricsRegistry::new();
        let storage = open_real_with(&dir, &registry);
        // The startup GC pass is the only one within the hour
        assert!(wait_for(|| DatabaseKind::ALL
            .iter()
            .all(|k| registry.counter_value(DB_GC_TOTAL, k.name()) == Some(1))));

        let mut last = storage.disk_usage();
        for i in 0..50u32 {
            storage.segments().put(&format!("app:seg-{}", i), Segment(vec![i as u8; 256]));
            let frame = format!("fn_{}", i);
            let mut tree = Tree::new();
            tree.insert(&["main", frame.as_str()], u64::from(i) + 1);
            storage.trees().put(&format!("app:{}", i), tree);
            storage.labels().put("run", &i.to_string()).unwrap();
            storage.segments().flush().unwrap();
            storage.trees().flush().unwrap();
            storage.dictionaries().flush().unwrap();

            let usage = storage.disk_usage();
            for (name, size) in &usage {
                assert!(*size >= last[name], "{} shrank from {} to {}", name, last[name], size);
            }
            last = usage;
        }
        assert!(last["segments"] >= ByteSize(50 * 256));
        storage.close().unwrap();
    }
}
