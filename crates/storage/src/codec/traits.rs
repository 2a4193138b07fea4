//! Cache codec trait definitions.

use profstore_core::Result;

/// Converts one database's cached values to and from stored bytes.
///
/// The key (without the database prefix) is passed to both directions so a
/// codec can derive context from it, e.g. the application a tree belongs to.
///
/// # Thread Safety
///
/// Codecs must be `Send + Sync`; a cache encodes from maintenance threads
/// and decodes on the read path concurrently.
pub trait Codec: Send + Sync + 'static {
    /// In-memory value type held by the cache
    type Value: Clone + Send + Sync + 'static;

    /// Serialize a value for storage under `key`
    fn encode(&self, key: &str, value: &Self::Value) -> Result<Vec<u8>>;

    /// Deserialize the bytes stored under `key`
    fn decode(&self, key: &str, bytes: &[u8]) -> Result<Self::Value>;
}
