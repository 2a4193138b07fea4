//! Core types for profstore
//!
//! This crate defines the foundational types used throughout the system:
//! - StoreError / CloseError: Error taxonomy
//! - ByteSize: Byte quantities with human-readable parsing
//! - MetricsRegistry: Labeled gauges and counters

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bytesize;
pub mod error;
pub mod metrics;

pub use bytesize::{ByteSize, ParseByteSizeError};
pub use error::{CloseError, Result, StoreError};
pub use metrics::{Counter, CounterVec, Gauge, GaugeVec, MetricsRegistry};
