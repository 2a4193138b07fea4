//! Schema version bookkeeping in the main database.

use byteorder::{ByteOrder, LittleEndian};
use tracing::info;

use profstore_core::{Result, StoreError};
use profstore_storage::Engine;

/// Key holding the on-disk schema version
pub const SCHEMA_VERSION_KEY: &[u8] = b"meta:schema-version";

/// Schema version written by this build
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Bring the stored schema up to [`CURRENT_SCHEMA_VERSION`].
///
/// A fresh store gets the current version written. Returns the version found
/// before migrating (0 for a fresh store).
///
/// # Errors
///
/// `StoreError::Migration` if the stored version is unreadable or newer than
/// this build supports.
pub fn migrate(main: &dyn Engine) -> Result<u32> {
    let found = match main.get(SCHEMA_VERSION_KEY)? {
        None => 0,
        Some(bytes) if bytes.len() == 4 => LittleEndian::read_u32(&bytes),
        Some(bytes) => {
            return Err(StoreError::Migration(format!(
                "schema version record has {} bytes, expected 4",
                bytes.len()
            )))
        }
    };

    if found > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::Migration(format!(
            "storage schema version {} is newer than supported version {}",
            found, CURRENT_SCHEMA_VERSION
        )));
    }
    if found < CURRENT_SCHEMA_VERSION {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, CURRENT_SCHEMA_VERSION);
        main.set(SCHEMA_VERSION_KEY, &buf)?;
        info!(
            target: "profstore::storage",
            from = found,
            to = CURRENT_SCHEMA_VERSION,
            "migrated storage schema"
        );
    }
    Ok(found)
}
