//! File substrate: hybrid mmap/positional I/O with write-ahead logging
//!
//! [`FileMap`] owns the database file. A prefix of configurable length
//! is memory-mapped; reads and writes are served from the map when they
//! fit and fall back to positional I/O beyond it. While a transaction
//! is active, every write or shrinking truncation that touches the
//! guarded region first emits the pre-image of the affected bytes into
//! the companion WAL file, so the region can be rolled back byte for
//! byte.
//!
//! [`wal`] implements the WAL file itself: header, message stream, and
//! the scan used both by in-process aborts and by crash recovery.

mod lock;
mod map;
pub mod wal;

pub use map::FileMap;
