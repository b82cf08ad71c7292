//! Advisory file locking
//!
//! Readers share the lock, writers hold it exclusively. The lock is the
//! only cross-process coordination the engine uses; it is released when
//! the file handle is dropped.

use std::fs::File;

use fs2::FileExt;
use keywell_core::{Error, Result};

/// Acquires the advisory lock on `file`
///
/// With `try_only`, contention surfaces immediately as a `System` error
/// instead of blocking.
pub fn acquire(file: &File, exclusive: bool, try_only: bool) -> Result<()> {
    let result = match (exclusive, try_only) {
        (true, false) => FileExt::lock_exclusive(file),
        (true, true) => FileExt::try_lock_exclusive(file),
        (false, false) => FileExt::lock_shared(file),
        (false, true) => FileExt::try_lock_shared(file),
    };
    result.map_err(|e| {
        if e.kind() == std::io::ErrorKind::WouldBlock {
            Error::System("file lock contention".to_string())
        } else {
            Error::System(format!("file lock failed: {}", e))
        }
    })
}
