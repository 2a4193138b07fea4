//! Retention policy types
//!
//! Bounds how much profiling data is kept, by age and by size. The store
//! only builds the policy; the segment layer consults it to decide what
//! historical data may be dropped.
//!
//! A zero duration or size means "no limit" for that dimension.
//!
//! # Example
//!
//! ```ignore
//! use profstore_storage::retention::RetentionPolicy;
//! use profstore_core::ByteSize;
//! use std::time::Duration;
//!
//! let policy = RetentionPolicy::new()
//!     .set_absolute_max_age(Duration::from_secs(30 * 24 * 3600))
//!     .set_size_limit(ByteSize(100 << 30))
//!     .set_level_max_age(0, Duration::from_secs(24 * 3600));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use profstore_core::ByteSize;

/// Age and size bounds on retained data. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetentionPolicy {
    absolute_max_age: Duration,
    size_limit: ByteSize,
    levels: BTreeMap<u32, Duration>,
}

impl RetentionPolicy {
    /// A policy that retains everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the age of any retained data
    pub fn set_absolute_max_age(mut self, max_age: Duration) -> Self {
        self.absolute_max_age = max_age;
        self
    }

    /// Cap the total size of retained data
    pub fn set_size_limit(mut self, limit: ByteSize) -> Self {
        self.size_limit = limit;
        self
    }

    /// Cap the age of data aggregated at `level`.
    ///
    /// A zero duration removes the cap for that level.
    pub fn set_level_max_age(mut self, level: u32, max_age: Duration) -> Self {
        if max_age.is_zero() {
            self.levels.remove(&level);
        } else {
            self.levels.insert(level, max_age);
        }
        self
    }

    /// Absolute age cap, if any
    pub fn absolute_max_age(&self) -> Option<Duration> {
        (!self.absolute_max_age.is_zero()).then_some(self.absolute_max_age)
    }

    /// Size cap, if any
    pub fn size_limit(&self) -> Option<ByteSize> {
        (!self.size_limit.is_zero()).then_some(self.size_limit)
    }

    /// Age cap configured for `level`, if any
    pub fn level_max_age(&self, level: u32) -> Option<Duration> {
        self.levels.get(&level).copied()
    }

    /// Whether the policy bounds nothing
    pub fn is_unlimited(&self) -> bool {
        self.absolute_max_age.is_zero() && self.size_limit.is_zero() && self.levels.is_empty()
    }

    /// Oldest instant data may carry to be retained, relative to `now`
    pub fn lower_time_boundary(&self, now: SystemTime) -> Option<SystemTime> {
        self.absolute_max_age()
            .map(|age| now.checked_sub(age).unwrap_or(SystemTime::UNIX_EPOCH))
    }

    /// Lower time boundary for one level: its own cap, else the absolute one
    pub fn level_lower_boundary(&self, level: u32, now: SystemTime) -> Option<SystemTime> {
        match self.level_max_age(level) {
            Some(age) => Some(now.checked_sub(age).unwrap_or(SystemTime::UNIX_EPOCH)),
            None => self.lower_time_boundary(now),
        }
    }

    /// Whether data starting at `start` is already outside the absolute bound
    pub fn is_expired(&self, start: SystemTime, now: SystemTime) -> bool {
        self.lower_time_boundary(now)
            .is_some_and(|boundary| start < boundary)
    }

    /// Bytes to reclaim so usage drops below the size limit.
    ///
    /// Once `used` exceeds the limit, an extra `ratio` share of the limit is
    /// reclaimed on top of the overflow so the next write does not
    /// immediately trigger another pass.
    pub fn capacity_to_reclaim(&self, used: ByteSize, ratio: f64) -> ByteSize {
        let Some(limit) = self.size_limit() else {
            return ByteSize(0);
        };
        if used <= limit {
            return ByteSize(0);
        }
        let headroom = (limit.as_u64() as f64 * ratio.max(0.0)) as u64;
        ByteSize((used.as_u64() - limit.as_u64()).saturating_add(headroom))
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlimited() {
            return write!(f, "Unlimited");
        }
        write!(
            f,
            "Retention(max_age={:?}, size_limit={}, levels={})",
            self.absolute_max_age,
            self.size_limit,
            self.levels.len()
        )
    }
}
