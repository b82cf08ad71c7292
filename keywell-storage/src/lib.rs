//! keywell-storage: an embedded, single-file key-value hash database
//!
//! One file holds everything: a 64-byte header, a bounded dump area for
//! the free-block pool, a fixed bucket array, and the record region.
//! Records carry their chain pointers inline, so each bucket roots a
//! binary tree of colliding keys keyed by (folded hash, key). Updates
//! happen in place when the new record fits its old extent; otherwise
//! the extent goes to a bounded free-block pool for reuse and the
//! record relocates.
//!
//! ## File layout
//!
//! ```text
//! +--------------------+
//! |       Header       |  64 bytes - magic, geometry, status, meta
//! +--------------------+
//! |   Free-pool dump   |  2W+2 bytes - persisted across clean closes
//! +--------------------+
//! |    Bucket array    |  bnum x W bytes - chain root offsets
//! +--------------------+
//! |   Record region    |  records and free blocks, 2^apow aligned
//! +--------------------+
//! ```
//!
//! ## Durability
//!
//! The prefix of the file is memory-mapped with positional I/O beyond
//! it. Transactions (explicit, or implicit per-mutation with
//! `AUTO_TRAN`) write pre-images into a companion WAL file; opening a
//! database next to a live WAL replays it and restores the exact state
//! at transaction begin. A writer crash without a WAL is detected via a
//! dirty flag in the header and answered by rebuilding the file from
//! its record region.
//!
//! ## Concurrency
//!
//! Any number of reader threads and writer threads may share one
//! [`HashDB`]: per-key operations take a global read lock plus one of
//! 64 slotted record locks, while structural operations (iteration,
//! defragmentation, transactions, close) take the global lock
//! exclusively. A separate process coordinates through the advisory
//! file lock only.
//!
//! # Example
//!
//! ```no_run
//! use keywell_storage::{mode, HashDB};
//!
//! let db = HashDB::open("data.kwh", mode::WRITER | mode::CREATE)?;
//! db.set(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?.as_deref(), Some(&b"world"[..]));
//! db.close()?;
//! # Ok::<(), keywell_core::Error>(())
//! ```

pub mod codec;
pub mod compress;
pub mod db;
pub mod fbp;
pub mod file;
pub mod fsutil;

pub use compress::{Compressor, Lz4Compressor, SnappyCompressor};
pub use db::{mode, Builder, Cursor, HashDB, OPT_COMPRESS, OPT_LINEAR, OPT_SMALL};

// Re-exported so callers need only one crate in scope
pub use keywell_core::{Error, ErrorKind, Key, Result, Value, VisitAction, Visitor};
