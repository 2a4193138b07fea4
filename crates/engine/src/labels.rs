//! Label index over the main database.
//!
//! Keys are stored as `l:<key>` and values as `v:<key>:<value>`, both with
//! empty payloads; listing is a prefix scan.

use std::sync::Arc;

use profstore_core::Result;
use profstore_storage::Engine;

const KEY_PREFIX: &str = "l:";
const VALUE_PREFIX: &str = "v:";

/// Label keys and values seen by the store
#[derive(Clone)]
pub struct Labels {
    engine: Arc<dyn Engine>,
}

impl Labels {
    /// Index stored in `engine`
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// Record that `key` was seen with `value`
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.engine.set(format!("{}{}", KEY_PREFIX, key).as_bytes(), &[])?;
        self.engine
            .set(format!("{}{}:{}", VALUE_PREFIX, key, value).as_bytes(), &[])
    }

    /// Every label key, sorted
    pub fn keys(&self) -> Result<Vec<String>> {
        self.scan_suffixes(KEY_PREFIX)
    }

    /// Every value seen for `key`, sorted
    pub fn values(&self, key: &str) -> Result<Vec<String>> {
        self.scan_suffixes(&format!("{}{}:", VALUE_PREFIX, key))
    }

    fn scan_suffixes(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .engine
            .scan_prefix(prefix.as_bytes())?
            .into_iter()
            .map(|(k, _)| String::from_utf8_lossy(&k[prefix.len()..]).into_owned())
            .collect())
    }
}
