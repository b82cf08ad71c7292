//! Transaction manager
//!
//! A transaction guards the byte range from the header's count field to
//! the logical size at begin: every overwrite inside it is pre-imaged
//! into the WAL, so an abort restores metadata and data together, and
//! appends past the snapshot are simply truncated away.
//!
//! Explicit transactions are database-global. A second writer asking to
//! begin one backs off and retries, doubling its sleep up to one
//! second. Auto-transactions (the `AUTO_TRAN` open flag) wrap each
//! individual mutation instead and are serialized by their own mutex;
//! they stand down while an explicit transaction is active.
//!
//! `hard` selects physical durability: the data file and the WAL are
//! fsynced at the transaction boundaries. Without it the WAL bytes are
//! written but may still sit in the page cache.

use std::sync::atomic::Ordering;
use std::time::Duration;

use keywell_core::{Error, Result};

use crate::codec::header;

use super::HashDB;

const BACKOFF_FLOOR: Duration = Duration::from_micros(1024);
const BACKOFF_CEIL: Duration = Duration::from_secs(1);

impl HashDB {
    /// Begins an explicit transaction, waiting out a concurrent one
    pub fn begin_transaction(&self, hard: bool) -> Result<()> {
        self.begin_tran(hard, false)
    }

    /// Begins an explicit transaction, failing instead of waiting
    pub fn begin_transaction_try(&self, hard: bool) -> Result<()> {
        self.begin_tran(hard, true)
    }

    fn begin_tran(&self, hard: bool, try_only: bool) -> Result<()> {
        let mut wait = BACKOFF_FLOOR;
        loop {
            let m = self.mlock_write();
            self.check_open()?;
            self.check_writer()?;
            if !self.tran.load(Ordering::Acquire) {
                self.file.begin_wal(header::META_OFF_COUNT, hard)?;
                self.tran.store(true, Ordering::Release);
                return Ok(());
            }
            drop(m);
            if try_only {
                return Err(Error::Logic("transaction competition avoided".to_string()));
            }
            std::thread::sleep(wait);
            wait = (wait * 2).min(BACKOFF_CEIL);
        }
    }

    /// Ends the current transaction, committing or rolling back
    pub fn end_transaction(&self, commit: bool) -> Result<()> {
        let _m = self.mlock_write();
        self.check_open()?;
        self.check_writer()?;
        if !self.tran.load(Ordering::Acquire) {
            return Err(Error::Invalid("transaction not established".to_string()));
        }
        let result = if commit {
            self.file.end_wal(true)
        } else {
            self.file.end_wal(false).and_then(|_| self.reload_after_rollback())
        };
        self.tran.store(false, Ordering::Release);
        if let Err(e) = &result {
            self.note_fatal(e);
        }
        result
    }

    /// Runs `f` inside a transaction: commit on `Ok`, abort on `Err`
    pub fn transaction<T, F>(&self, hard: bool, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        self.begin_transaction(hard)?;
        match f(self) {
            Ok(value) => {
                self.end_transaction(true)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = self.end_transaction(false) {
                    return Err(abort_err);
                }
                Err(e)
            }
        }
    }
}
