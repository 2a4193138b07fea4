//! Profstore - storage orchestration for a profiling-data store
//!
//! Profstore keeps profiling data in five embedded databases (main,
//! dictionaries, dimensions, segments, trees), fronts four of them with
//! write-back caches, and runs background tasks that keep memory and disk
//! usage in check.
//!
//! # Quick Start
//!
//! ```no_run
//! use profstore::{MetricsRegistry, Storage, StorageConfig, Tree};
//!
//! let registry = MetricsRegistry::new();
//! let storage = Storage::open(StorageConfig::with_path("/tmp/profstore"), &registry)?;
//!
//! let mut tree = Tree::new();
//! tree.insert(&["main", "handle_request"], 10);
//! storage.trees().put("myapp:cpu", tree);
//!
//! storage.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Architecture
//!
//! - `profstore-core`: errors, byte sizes, metrics registry
//! - `profstore-storage`: engine contract and log engine, caches, retention
//! - `profstore-engine`: the [`Storage`] orchestrator and its tasks

pub use profstore_core::{ByteSize, CloseError, MetricsRegistry, Result, StoreError};
pub use profstore_engine::*;
pub use profstore_storage::{
    Cache, CacheMaintenance, Codec, Engine, EngineOpener, EngineOptions, GcOutcome, LogEngine,
    LogEngineOpener, RetentionPolicy,
};
