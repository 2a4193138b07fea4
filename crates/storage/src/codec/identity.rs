//! Identity codec (no transformation).

use profstore_core::Result;

use super::traits::Codec;

/// Stores values as the raw bytes they already are.
///
/// # Example
///
/// ```
/// use profstore_storage::codec::{Codec, IdentityCodec};
///
/// let codec = IdentityCodec;
/// let encoded = codec.encode("k", &b"hello".to_vec()).unwrap();
/// assert_eq!(codec.decode("k", &encoded).unwrap(), b"hello".to_vec());
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl Codec for IdentityCodec {
    type Value = Vec<u8>;

    fn encode(&self, _key: &str, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, _key: &str, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}
