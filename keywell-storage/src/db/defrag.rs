//! Defragmenter
//!
//! Compacts the record region by shifting records backward over free
//! blocks. Starting from the persisted scan position, the first free
//! block found becomes the destination; each following record is read
//! whole, its padding shrunk to minimal alignment, its parent pointer
//! re-resolved by walking its chain (records store no parent pointers —
//! re-lookup keeps the disk format compact), and the record rewritten
//! at the destination. Cursors parked on a shifted record are patched
//! to its new offset.
//!
//! When the scan reaches the logical end the tail is truncated away;
//! otherwise the remaining gap is stamped as a single free block and
//! the scan position is parked on it for the next run.
//!
//! The whole pass runs under the exclusive global lock. The
//! opportunistic auto-defrag trigger only try-locks it, so a contended
//! lock silently skips the run.

use std::sync::atomic::Ordering;

use keywell_core::{Error, Result};

use super::chain::Region;
use super::HashDB;

impl HashDB {
    pub(crate) fn defrag_outer(&self, step: i64) -> Result<()> {
        let _m = self.mlock_write();
        self.check_open()?;
        self.check_writer()?;
        if step <= 0 {
            self.dfcur.store(self.roff, Ordering::Release);
            while !self.defrag_impl(i64::MAX)? {}
        } else {
            self.defrag_impl(step)?;
        }
        self.frgcnt.store(0, Ordering::Release);
        Ok(())
    }

    /// One bounded defrag run; the caller holds the global lock
    /// exclusively. Returns whether the scan reached the logical end.
    pub(crate) fn defrag_impl(&self, step: i64) -> Result<bool> {
        let end = self.file.size();
        let mut cur = self.dfcur.load(Ordering::Acquire).max(self.roff);
        let mut steps = step;

        // Find the first free block
        let base;
        loop {
            if cur >= end {
                self.dfcur.store(self.roff, Ordering::Release);
                return Ok(true);
            }
            match self.read_region(cur)? {
                Region::Free { rsiz, .. } => {
                    base = cur;
                    cur += rsiz;
                    break;
                }
                Region::Record(rec) => {
                    cur += rec.rsiz;
                    steps -= 1;
                    if steps <= 0 {
                        self.dfcur.store(cur, Ordering::Release);
                        return Ok(false);
                    }
                }
            }
        }

        // Shift records backward over the gap
        let mut dest = base;
        while cur < end && steps > 0 {
            match self.read_region(cur)? {
                Region::Free { rsiz, .. } => cur += rsiz,
                Region::Record(mut rec) => {
                    steps -= 1;
                    self.read_record_value(&mut rec)?;
                    let raw = rec.value.take().unwrap();

                    let h = crate::codec::hash::hash(&rec.key);
                    let bidx = h % self.bucket_count();
                    let (found, entoff) =
                        self.search_chain(bidx, crate::codec::hash::fold(h), &rec.key)?;
                    let found = found.ok_or_else(|| {
                        Error::Logic("shifted record unreachable from its bucket".to_string())
                    })?;
                    if found.off != rec.off {
                        return Err(Error::Logic(
                            "chain resolves to a different record than the shift source".to_string(),
                        ));
                    }

                    let (_, nrsiz) = self.lay.calc_sizes(rec.ksiz, raw.len());
                    self.write_record_at(dest, nrsiz, rec.left, rec.right, &rec.key, &raw)?;
                    self.link_parent(entoff, bidx, dest)?;
                    self.escape_cursors(rec.off, dest);

                    dest += nrsiz;
                    cur += rec.rsiz;
                }
            }
        }

        // Pooled blocks inside the rewritten range are gone
        self.fbp.lock().trim(base, cur);

        if cur >= end {
            self.file.truncate(dest)?;
            self.dump_meta()?;
            self.clamp_cursors(dest);
            self.dfcur.store(self.roff, Ordering::Release);
            Ok(true)
        } else {
            let gap = cur - dest;
            self.free_region(dest, gap)?;
            self.dfcur.store(dest, Ordering::Release);
            Ok(false)
        }
    }
}
