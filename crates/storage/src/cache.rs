//! Write-back cache
//!
//! A [`Cache`] fronts one database. Reads fall through to the engine on a
//! miss and keep the decoded value; writes stay in memory marked dirty until
//! a write-back, eviction or flush persists them under the database prefix.
//!
//! Engine I/O never happens while the entry map is locked. Each put stamps
//! the entry with a version, and a persisted entry is only marked clean if
//! no newer put replaced it in the meantime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use profstore_core::{Counter, MetricsRegistry, Result, StoreError};

use crate::codec::Codec;
use crate::engine::Engine;

/// Type-erased maintenance surface of a cache.
///
/// The orchestrator drives caches with different value types through this
/// trait.
pub trait CacheMaintenance: Send + Sync {
    /// Database name the cache belongs to
    fn name(&self) -> &str;

    /// Number of cached entries
    fn size(&self) -> usize;

    /// Persist every dirty entry, then drop all entries
    fn flush(&self) -> Result<()>;

    /// Persist dirty entries and drop entries idle longer than the TTL
    fn write_back(&self) -> Result<()>;

    /// Persist and drop the least recently used `percent` of entries
    fn evict(&self, percent: f64) -> Result<()>;
}

/// Cache construction options
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Database name, used for metrics labels and log fields
    pub name: String,
    /// Prefix prepended to every key written to the engine
    pub prefix: String,
    /// Idle time after which a clean entry is dropped on write-back
    pub ttl: Duration,
}

struct Entry<V> {
    value: V,
    dirty: bool,
    version: u64,
    last_access: Instant,
}

struct State<V> {
    entries: HashMap<String, Entry<V>>,
    version: u64,
}

struct CacheMetrics {
    hits: Counter,
    misses: Counter,
    write_backs: Counter,
}

impl CacheMetrics {
    fn new(registry: &MetricsRegistry, name: &str) -> Self {
        Self {
            hits: registry
                .counter_vec("profstore_cache_hits_total", "Cache reads served from memory", "name")
                .with_label_values(name),
            misses: registry
                .counter_vec("profstore_cache_misses_total", "Cache reads that went to the engine", "name")
                .with_label_values(name),
            write_backs: registry
                .counter_vec("profstore_cache_write_backs_total", "Cache entries persisted to the engine", "name")
                .with_label_values(name),
        }
    }
}

/// Write-back cache over one engine, driven by a [`Codec`].
pub struct Cache<C: Codec> {
    options: CacheOptions,
    engine: Arc<dyn Engine>,
    codec: C,
    state: Mutex<State<C::Value>>,
    metrics: CacheMetrics,
}

impl<C: Codec> Cache<C> {
    /// Create an empty cache
    pub fn new(
        engine: Arc<dyn Engine>,
        registry: &MetricsRegistry,
        options: CacheOptions,
        codec: C,
    ) -> Self {
        let metrics = CacheMetrics::new(registry, &options.name);
        Self {
            options,
            engine,
            codec,
            state: Mutex::new(State {
                entries: HashMap::new(),
                version: 0,
            }),
            metrics,
        }
    }

    /// Database name
    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// The codec values pass through
    pub fn codec(&self) -> &C {
        &self.codec
    }

    fn storage_key(&self, key: &str) -> Vec<u8> {
        let mut k = Vec::with_capacity(self.options.prefix.len() + key.len());
        k.extend_from_slice(self.options.prefix.as_bytes());
        k.extend_from_slice(key.as_bytes());
        k
    }

    /// Look up a value, loading it from the engine on a miss
    pub fn get(&self, key: &str) -> Result<Option<C::Value>> {
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.entries.get_mut(key) {
                entry.last_access = Instant::now();
                self.metrics.hits.inc();
                return Ok(Some(entry.value.clone()));
            }
        }

        self.metrics.misses.inc();
        let Some(bytes) = self.engine.get(&self.storage_key(key))? else {
            return Ok(None);
        };
        let value = self.codec.decode(key, &bytes)?;

        let mut state = self.state.lock();
        let entry = state
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value,
                dirty: false,
                version: 0,
                last_access: Instant::now(),
            });
        Ok(Some(entry.value.clone()))
    }

    /// Store a value; it reaches the engine on the next write-back
    pub fn put(&self, key: &str, value: C::Value) {
        let mut state = self.state.lock();
        state.version += 1;
        let version = state.version;
        state.entries.insert(
            key.to_string(),
            Entry {
                value,
                dirty: true,
                version,
                last_access: Instant::now(),
            },
        );
    }

    /// Remove a value from the cache and the engine
    pub fn delete(&self, key: &str) -> Result<()> {
        self.state.lock().entries.remove(key);
        self.engine.delete(&self.storage_key(key))
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode and write a batch, returning what was written and the first failure
    fn persist(
        &self,
        batch: Vec<(String, C::Value, u64)>,
    ) -> (Vec<(String, u64)>, Option<StoreError>) {
        let mut written = Vec::with_capacity(batch.len());
        let mut first_err = None;
        for (key, value, version) in batch {
            let result = self
                .codec
                .encode(&key, &value)
                .and_then(|bytes| self.engine.set(&self.storage_key(&key), &bytes));
            match result {
                Ok(()) => {
                    self.metrics.write_backs.inc();
                    written.push((key, version));
                }
                Err(e) => {
                    warn!(
                        target: "profstore::cache",
                        cache = %self.options.name,
                        key = %key,
                        error = %e,
                        "write-back failed, entry stays dirty"
                    );
                    first_err.get_or_insert(e);
                }
            }
        }
        (written, first_err)
    }

    /// Persist every dirty entry and mark the written ones clean
    fn write_dirty(&self) -> Option<StoreError> {
        let batch: Vec<_> = {
            let state = self.state.lock();
            state
                .entries
                .iter()
                .filter(|(_, e)| e.dirty)
                .map(|(k, e)| (k.clone(), e.value.clone(), e.version))
                .collect()
        };
        if batch.is_empty() {
            return None;
        }

        let (written, err) = self.persist(batch);
        let mut state = self.state.lock();
        mark_clean(&mut state.entries, written);
        err
    }

    /// Persist dirty entries and expire idle clean ones
    pub fn write_back(&self) -> Result<()> {
        let err = self.write_dirty();

        let ttl = self.options.ttl;
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.entries.len();
        state
            .entries
            .retain(|_, e| e.dirty || now.duration_since(e.last_access) < ttl);
        let expired = before - state.entries.len();
        if expired > 0 {
            debug!(target: "profstore::cache", cache = %self.options.name, expired, "expired idle entries");
        }

        err.map_or(Ok(()), Err)
    }

    /// Persist everything and empty the cache.
    ///
    /// Entries that fail to persist are kept so a later flush can retry.
    pub fn flush(&self) -> Result<()> {
        let err = self.write_dirty();

        let mut state = self.state.lock();
        state.entries.retain(|_, e| e.dirty);
        state.entries.shrink_to_fit();

        err.map_or(Ok(()), Err)
    }

    /// Persist and drop the least recently used share of entries.
    ///
    /// `percent` is a fraction in `[0, 1]`. Spare map capacity is released
    /// afterwards so the freed memory goes back to the allocator.
    pub fn evict(&self, percent: f64) -> Result<()> {
        let percent = percent.clamp(0.0, 1.0);
        let (victims, batch) = {
            let state = self.state.lock();
            let n = (state.entries.len() as f64 * percent) as usize;
            if n == 0 {
                return Ok(());
            }
            let mut by_age: Vec<_> = state.entries.iter().collect();
            by_age.sort_by_key(|(_, e)| e.last_access);

            let mut victims = Vec::with_capacity(n);
            let mut batch = Vec::new();
            for (key, entry) in by_age.into_iter().take(n) {
                victims.push(key.clone());
                if entry.dirty {
                    batch.push((key.clone(), entry.value.clone(), entry.version));
                }
            }
            (victims, batch)
        };

        let (written, err) = self.persist(batch);

        let mut state = self.state.lock();
        mark_clean(&mut state.entries, written);
        let mut evicted = 0usize;
        for key in &victims {
            if state.entries.get(key).is_some_and(|e| !e.dirty) {
                state.entries.remove(key);
                evicted += 1;
            }
        }
        state.entries.shrink_to_fit();
        debug!(target: "profstore::cache", cache = %self.options.name, evicted, "evicted entries");

        err.map_or(Ok(()), Err)
    }
}

fn mark_clean<V>(entries: &mut HashMap<String, Entry<V>>, written: Vec<(String, u64)>) {
    for (key, version) in written {
        if let Some(entry) = entries.get_mut(&key) {
            if entry.version == version {
                entry.dirty = false;
            }
        }
    }
}

impl<C: Codec> CacheMaintenance for Cache<C> {
    fn name(&self) -> &str {
        Cache::name(self)
    }

    fn size(&self) -> usize {
        self.len()
    }

    fn flush(&self) -> Result<()> {
        Cache::flush(self)
    }

    fn write_back(&self) -> Result<()> {
        Cache::write_back(self)
    }

    fn evict(&self, percent: f64) -> Result<()> {
        Cache::evict(self, percent)
    }
}
