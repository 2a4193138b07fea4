//! Cache codec abstraction.
//!
//! Every cache-fronted database supplies a codec describing how its values
//! are laid out on disk. The cache only ever sees the [`Codec`] trait; the
//! concrete value types (dictionaries, dimensions, trees, segments) live with
//! the orchestrator.
//!
//! # Usage
//!
//! ```ignore
//! use profstore_storage::codec::{Codec, IdentityCodec};
//!
//! let bytes = IdentityCodec.encode("app.cpu", &b"raw".to_vec())?;
//! let value = IdentityCodec.decode("app.cpu", &bytes)?;
//! ```

mod identity;
mod traits;

pub use identity::IdentityCodec;
pub use traits::Codec;
