//! Database wrapper
//!
//! A [`Db`] couples one engine with its name, key prefix, optional cache and
//! its own GC bookkeeping.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use profstore_core::{ByteSize, CloseError, Counter};
use profstore_storage::{CacheMaintenance, Engine, GcOutcome};

use crate::graph::DatabaseKind;

/// Share of stale bytes at which a value-log file is rewritten
pub const DISCARD_RATIO: f64 = 0.7;

/// Compaction concurrency used by GC
const FLATTEN_WORKERS: usize = 2;

#[derive(Debug, Default)]
struct GcState {
    /// Size right after the last GC pass; `None` until the first pass
    last_gc: Option<ByteSize>,
}

/// One named database of the store.
pub struct Db {
    kind: DatabaseKind,
    engine: Arc<dyn Engine>,
    cache: Option<Arc<dyn CacheMaintenance>>,
    gc: Mutex<GcState>,
    gc_count: Counter,
}

impl Db {
    /// Wrap an opened engine
    pub fn new(
        kind: DatabaseKind,
        engine: Arc<dyn Engine>,
        cache: Option<Arc<dyn CacheMaintenance>>,
        gc_count: Counter,
    ) -> Self {
        Self {
            kind,
            engine,
            cache,
            gc: Mutex::new(GcState::default()),
            gc_count,
        }
    }

    /// Which database this is
    pub fn kind(&self) -> DatabaseKind {
        self.kind
    }

    /// Database name
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// The engine handle
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// The cache, if this database has one
    pub fn cache(&self) -> Option<&Arc<dyn CacheMaintenance>> {
        self.cache.as_ref()
    }

    /// On-disk size: index plus value log
    pub fn size(&self) -> ByteSize {
        let (index, vlog) = self.engine.size();
        ByteSize(index.saturating_add(vlog))
    }

    /// Flatten, then rewrite value-log files until nothing qualifies.
    ///
    /// Returns whether any file was rewritten. Failures are logged and end
    /// the pass.
    pub fn run_gc(&self, discard_ratio: f64) -> bool {
        debug!(target: "profstore::db", db = self.name(), "starting garbage collection");
        if let Err(e) = self.engine.flatten(FLATTEN_WORKERS) {
            error!(target: "profstore::db", db = self.name(), error = %e, "failed to flatten database");
        }

        let mut reclaimed = false;
        loop {
            match self.engine.run_value_log_gc(discard_ratio) {
                Ok(GcOutcome::Rewritten) => reclaimed = true,
                Ok(GcOutcome::NoRewrite) => return reclaimed,
                Err(e) => {
                    warn!(target: "profstore::db", db = self.name(), error = %e, "failed to run GC");
                    return false;
                }
            }
        }
    }

    /// Incremental GC tick.
    ///
    /// Runs a pass when none has run yet, when `diff` is zero, or when the
    /// size grew by more than `diff` since the last pass, even if that pass
    /// left the database empty. Returns whether a
    /// pass ran.
    pub fn gc_tick(&self, diff: ByteSize) -> bool {
        let mut state = self.gc.lock();
        let due = match state.last_gc {
            None => true,
            Some(last) => diff.is_zero() || self.size().saturating_sub(last) > diff,
        };
        if !due {
            return false;
        }
        self.run_gc(DISCARD_RATIO);
        self.gc_count.inc();
        state.last_gc = Some(self.size());
        true
    }

    /// Flush the cache, then close the engine.
    ///
    /// The engine is closed even if the flush failed; every failure is
    /// logged and returned.
    pub fn close(&self) -> Result<(), CloseError> {
        let mut errors = CloseError::new();
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.flush() {
                error!(target: "profstore::db", db = self.name(), error = %e, "flushing cache");
                errors.push(self.name(), e);
            }
        }
        if let Err(e) = self.engine.close() {
            error!(target: "profstore::db", db = self.name(), error = %e, "closing database");
            errors.push(self.name(), e);
        }
        errors.into_result()
    }
}
