//! Error types for profstore
//!
//! This module defines the error taxonomy shared by every layer.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for profstore operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error types for the profiling-data store
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error (directory creation, file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage engine failure (open, write, compaction, value-log GC)
    #[error("Engine error: {0}")]
    Engine(String),

    /// Cached value could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// On-disk data failed validation
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Configuration is invalid or could not be loaded
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Schema migration failed at startup
    #[error("Migration failed: {0}")]
    Migration(String),

    /// Total system memory could not be determined
    #[error("Memory probe failed: {0}")]
    MemoryProbe(String),

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Write refused because the data is already outside the retention window
    #[error("could not write because of retention settings")]
    RetentionViolation,

    /// Write refused because shutdown has begun
    #[error("storage closed")]
    Closed,
}

impl StoreError {
    /// Create an engine error from any displayable value
    pub fn engine(msg: impl fmt::Display) -> Self {
        StoreError::Engine(msg.to_string())
    }

    /// Create a codec error from any displayable value
    pub fn codec(msg: impl fmt::Display) -> Self {
        StoreError::Codec(msg.to_string())
    }

    /// Create a configuration error from any displayable value
    pub fn config(msg: impl fmt::Display) -> Self {
        StoreError::Config(msg.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

/// Aggregated shutdown failure.
///
/// Shutdown keeps closing databases after an individual failure, so every
/// failure is collected here instead of aborting on the first one.
#[derive(Debug, Default)]
pub struct CloseError {
    failures: Vec<(String, StoreError)>,
}

impl CloseError {
    /// Create an empty aggregate
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for the named database
    pub fn push(&mut self, name: impl Into<String>, err: StoreError) {
        self.failures.push((name.into(), err));
    }

    /// Append every failure recorded in `other`
    pub fn merge(&mut self, other: CloseError) {
        self.failures.extend(other.failures);
    }

    /// True when no failure was recorded
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Recorded failures in the order they were observed
    pub fn failures(&self) -> &[(String, StoreError)] {
        &self.failures
    }

    /// `Ok(())` when empty, otherwise `Err(self)`
    pub fn into_result(self) -> std::result::Result<(), CloseError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to close {} database(s)", self.failures.len())?;
        for (name, err) in &self.failures {
            write!(f, "; {}: {}", name, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseError {}
