//! Key-value engine contract.
//!
//! Every database in the store is backed by one engine instance bound to a
//! directory on disk. The orchestrator only needs point reads/writes,
//! compaction (`flatten`), value-log garbage collection and a size probe, so
//! that is all the trait exposes.
//!
//! [`LogEngine`] is the bundled implementation: an append-only value log
//! with an in-memory key index that `flatten` persists as a sorted snapshot.

mod log;
pub mod record;

pub use log::LogEngine;

use std::path::Path;
use std::sync::Arc;

use profstore_core::Result;

/// Result of a single value-log GC attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOutcome {
    /// One value-log file was rewritten and its space reclaimed
    Rewritten,
    /// No value-log file had enough stale data; nothing was done
    NoRewrite,
}

/// Options used when opening an engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Name used in log fields
    pub name: String,
    /// Truncate a torn value-log tail on open instead of failing
    pub truncate: bool,
    /// fsync after every write
    pub sync_writes: bool,
    /// Compact (flatten) during close
    pub compact_on_close: bool,
    /// Value-log segment rotation threshold in bytes
    pub value_log_file_size: u64,
    /// Most verbose level the engine itself logs at
    pub log_level: tracing::Level,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            truncate: true,
            sync_writes: false,
            compact_on_close: false,
            value_log_file_size: 64 * 1024 * 1024,
            log_level: tracing::Level::ERROR,
        }
    }
}

/// An embedded key-value engine instance.
///
/// All methods take `&self`; implementations synchronize internally so a
/// handle can be shared between the cache, maintenance tasks and readers.
pub trait Engine: Send + Sync {
    /// Read a key
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Write a key
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove a key
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// On-disk size as `(index bytes, value-log bytes)`
    fn size(&self) -> (u64, u64);

    /// Compact the index into a single sorted file
    fn flatten(&self, workers: usize) -> Result<()>;

    /// Rewrite one value-log file whose stale share is at least `discard_ratio`
    fn run_value_log_gc(&self, discard_ratio: f64) -> Result<GcOutcome>;

    /// Flush and release the engine; further calls fail
    fn close(&self) -> Result<()>;
}

/// Opens engines; the seam that lets the orchestrator run over any engine.
pub trait EngineOpener: Send + Sync {
    /// Open (or create) an engine rooted at `path`
    fn open(&self, path: &Path, options: &EngineOptions) -> Result<Arc<dyn Engine>>;
}

/// Opener for the bundled [`LogEngine`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEngineOpener;

impl EngineOpener for LogEngineOpener {
    fn open(&self, path: &Path, options: &EngineOptions) -> Result<Arc<dyn Engine>> {
        Ok(Arc::new(LogEngine::open(path, options.clone())?))
    }
}
