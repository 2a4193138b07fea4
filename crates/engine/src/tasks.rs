//! Periodic background tasks.
//!
//! Each task runs on its own named thread: once immediately, then every
//! `interval` until the shared [`StopSignal`] fires. Maintenance tasks also
//! hold the store-wide maintenance mutex while their body runs, so at most
//! one heavy operation (GC, eviction, write-back) touches the disk at a time.
//!
//! Task bodies that make decisions ([`SizeWatcher`], [`EvictionTask`]) are
//! plain structs so they can be driven tick by tick in tests.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use profstore_core::{ByteSize, Counter, Result};
use profstore_storage::CacheMaintenance;

use crate::memory::MemoryProbe;

// ============================================================================
// Stop signal
// ============================================================================

/// One-shot cancellation token shared by every task of a store.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    /// Create an unfired signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal and wake every waiter
    pub fn stop(&self) {
        let (lock, cond) = &*self.inner;
        let mut stopped = lock.lock();
        *stopped = true;
        cond.notify_all();
    }

    /// Whether the signal has fired
    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep for `timeout` or until the signal fires.
    ///
    /// Returns `true` if the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cond) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut stopped = lock.lock();
        while !*stopped {
            if cond.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

/// Drive `body` on a fixed interval until `stop` fires.
///
/// The body runs once right away unless the signal already fired. The next
/// wait starts after the body returns, so a slow body delays later ticks
/// instead of queueing them.
pub fn run_periodic(stop: &StopSignal, interval: Duration, mut body: impl FnMut()) {
    if stop.is_stopped() {
        return;
    }
    body();
    while !stop.wait_timeout(interval) {
        body();
    }
}

// ============================================================================
// Task set
// ============================================================================

/// The running tasks of a store, plus what they share.
pub struct TaskSet {
    stop: StopSignal,
    maintenance: Arc<Mutex<()>>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl TaskSet {
    /// Create an empty set sharing `maintenance` with the store
    pub fn new(maintenance: Arc<Mutex<()>>) -> Self {
        Self {
            stop: StopSignal::new(),
            maintenance,
            handles: Vec::new(),
        }
    }

    /// The signal every task of this set observes
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Number of spawned tasks
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no task was spawned
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Spawn a task that runs `body` every `interval` without the mutex.
    pub fn spawn_periodic(
        &mut self,
        name: &str,
        interval: Duration,
        body: impl FnMut() + Send + 'static,
    ) -> Result<()> {
        let stop = self.stop.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_periodic(&stop, interval, body))?;
        debug!(target: "profstore::storage", task = name, ?interval, "started task");
        self.handles.push((name.to_string(), handle));
        Ok(())
    }

    /// Spawn a task whose body holds the maintenance mutex while it runs.
    pub fn spawn_maintenance(
        &mut self,
        name: &str,
        interval: Duration,
        mut body: impl FnMut() + Send + 'static,
    ) -> Result<()> {
        let maintenance = Arc::clone(&self.maintenance);
        self.spawn_periodic(name, interval, move || {
            let _guard = maintenance.lock();
            body();
        })
    }

    /// Fire the stop signal and wait for every task to exit.
    pub fn shutdown(&mut self) {
        self.stop.stop();
        debug!(target: "profstore::storage", tasks = self.handles.len(), "waiting for storage tasks to finish");
        for (name, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                error!(target: "profstore::storage", task = %name, "storage task panicked");
            }
        }
        debug!(target: "profstore::storage", "storage tasks finished");
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.shutdown();
        }
    }
}

// ============================================================================
// Task bodies
// ============================================================================

/// Tracks aggregate disk usage and reports when it grew by more than `diff`.
#[derive(Debug, Clone)]
pub struct SizeWatcher {
    baseline: ByteSize,
    diff: ByteSize,
}

impl SizeWatcher {
    /// Start from a zero baseline
    pub fn new(diff: ByteSize) -> Self {
        Self {
            baseline: ByteSize(0),
            diff,
        }
    }

    /// Size recorded at the last trigger
    pub fn baseline(&self) -> ByteSize {
        self.baseline
    }

    /// Feed the current size; on `true` the baseline moved to `current`.
    ///
    /// A zero `diff` triggers on every observation.
    pub fn observe(&mut self, current: ByteSize) -> bool {
        if self.diff.is_zero() || current.saturating_sub(self.baseline) > self.diff {
            self.baseline = current;
            return true;
        }
        false
    }
}

/// Memory-pressure eviction.
///
/// When used memory reaches `threshold` of the total, evicts `volume` of the
/// `evict` caches, then writes back the `write_back` caches in order. The
/// caches in `write_back` keep their entries and rely on TTL expiry instead.
pub struct EvictionTask {
    threshold: f64,
    volume: f64,
    mem_total: u64,
    probe: Arc<dyn MemoryProbe>,
    evict: Vec<Arc<dyn CacheMaintenance>>,
    write_back: Vec<Arc<dyn CacheMaintenance>>,
    evictions: Counter,
}

impl EvictionTask {
    /// Build the task; `mem_total` must be non-zero
    pub fn new(
        threshold: f64,
        volume: f64,
        mem_total: u64,
        probe: Arc<dyn MemoryProbe>,
        evict: Vec<Arc<dyn CacheMaintenance>>,
        write_back: Vec<Arc<dyn CacheMaintenance>>,
        evictions: Counter,
    ) -> Self {
        Self {
            threshold,
            volume,
            mem_total,
            probe,
            evict,
            write_back,
            evictions,
        }
    }

    /// Run one tick; returns whether eviction fired
    pub fn run(&self) -> bool {
        let used = self.probe.used_memory() as f64 / self.mem_total as f64;
        if used < self.threshold {
            return false;
        }

        debug!(target: "profstore::storage", used, threshold = self.threshold, "memory above threshold, evicting");
        for cache in &self.evict {
            if let Err(e) = cache.evict(self.volume) {
                warn!(target: "profstore::storage", db = cache.name(), error = %e, "cache eviction failed");
            }
        }
        for cache in &self.write_back {
            if let Err(e) = cache.write_back() {
                warn!(target: "profstore::storage", db = cache.name(), error = %e, "cache write-back failed");
            }
        }
        self.evictions.inc();
        true
    }
}

/// Write back every cache in order, logging failures.
pub fn write_back_all(caches: &[Arc<dyn CacheMaintenance>]) {
    for cache in caches {
        if let Err(e) = cache.write_back() {
            warn!(target: "profstore::storage", db = cache.name(), error = %e, "cache write-back failed");
        }
    }
}
