//! Storage orchestration for profstore
//!
//! This crate ties the lower layers together:
//! - Storage: opens the named databases in dependency order and closes them
//!   in reverse layers
//! - Background tasks: GC, per-database GC, cache eviction, write-back and
//!   metrics refresh
//! - Config: the `profstore.toml` storage section
//! - Codecs for dictionaries, dimensions, segments and trees
//! - Labels and schema migration over the main database

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codecs;
pub mod config;
pub mod database;
pub mod graph;
pub mod labels;
pub mod memory;
pub mod metrics;
pub mod migrate;
pub mod storage;
pub mod tasks;

pub use codecs::{
    Dictionary, DictionaryCodec, Dimension, DimensionCodec, Segment, SegmentCodec, Tree, TreeCodec,
};
pub use config::{RetentionLevel, StorageConfig, CONFIG_FILE_NAME};
pub use database::Db;
pub use graph::{DatabaseKind, DependencyGraph};
pub use labels::Labels;
pub use memory::{MemoryProbe, SystemMemory};
pub use metrics::StorageMetrics;
pub use migrate::{migrate, CURRENT_SCHEMA_VERSION};
pub use storage::Storage;
pub use tasks::{EvictionTask, SizeWatcher, StopSignal, TaskSet};
