//! Storage layer for profstore
//!
//! This crate implements the building blocks each database is made of:
//! - Engine: the key-value engine contract and `LogEngine`, a file-backed
//!   value log with a snapshotted key index
//! - Cache: a TTL-based write-back cache keyed under a database prefix
//! - Codec: how cached values are serialized
//! - Retention: age and size bounds on retained data
//!
//! The orchestration of several databases (background GC, eviction,
//! write-back) lives in `profstore-engine`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod codec;
pub mod engine;
pub mod retention;

pub use cache::{Cache, CacheMaintenance, CacheOptions};
pub use codec::{Codec, IdentityCodec};
pub use engine::{Engine, EngineOpener, EngineOptions, GcOutcome, LogEngine, LogEngineOpener};
pub use retention::RetentionPolicy;
