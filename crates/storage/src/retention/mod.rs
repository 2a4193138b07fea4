//! Data retention
//!
//! See [`RetentionPolicy`].

mod policy;

pub use policy::RetentionPolicy;
