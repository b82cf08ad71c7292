//! Cursors: insertion-order traversal with live-migration safety
//!
//! A cursor is a pair of shared atomic cells `(off, end)`: the current
//! scan position and the logical-size snapshot taken at jump time. The
//! database keeps a weak registry of every live cursor; whenever the
//! defragmenter shifts a record or the file tail is truncated, the
//! registered cells are patched so no cursor is left pointing into a
//! moved record. A cursor parked on a region that later becomes a free
//! block simply skips forward on its next access.
//!
//! `accept` takes the global lock exclusively because the dispatched
//! visitor may relocate the record under the cursor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use keywell_core::{Error, Result, VisitAction, Visitor};

use super::chain::Region;
use super::HashDB;

/// Shared position cells, patched in place by the defragmenter
#[derive(Debug, Default)]
pub(crate) struct CursorState {
    pub off: AtomicU64,
    pub end: AtomicU64,
}

/// Insertion-order cursor over the records of a [`HashDB`]
pub struct Cursor<'a> {
    db: &'a HashDB,
    st: Arc<CursorState>,
}

impl HashDB {
    /// Creates a cursor; it starts unpositioned
    pub fn cursor(&self) -> Cursor<'_> {
        let st = Arc::new(CursorState::default());
        let mut registry = self.cursors.lock();
        registry.retain(|w| w.strong_count() > 0);
        registry.push(Arc::downgrade(&st));
        Cursor { db: self, st }
    }

    /// Redirects cursors parked on `off` to `dest`
    pub(crate) fn escape_cursors(&self, off: u64, dest: u64) {
        for weak in self.cursors.lock().iter() {
            if let Some(st) = weak.upgrade() {
                if st.off.load(Ordering::Acquire) == off {
                    st.off.store(dest, Ordering::Release);
                }
                if st.end.load(Ordering::Acquire) == off {
                    st.end.store(dest, Ordering::Release);
                }
            }
        }
    }

    /// Invalidates cursors that fell past a truncated tail
    pub(crate) fn clamp_cursors(&self, new_size: u64) {
        for weak in self.cursors.lock().iter() {
            if let Some(st) = weak.upgrade() {
                if st.off.load(Ordering::Acquire) >= new_size {
                    st.off.store(0, Ordering::Release);
                }
                if st.end.load(Ordering::Acquire) > new_size {
                    st.end.store(new_size, Ordering::Release);
                }
            }
        }
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        let target = Arc::as_ptr(&self.st);
        self.db
            .cursors
            .lock()
            .retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), target));
    }
}

impl Cursor<'_> {
    /// Positions at the first record
    pub fn jump(&self) -> Result<()> {
        let _m = self.db.mlock_read();
        self.db.check_open()?;
        self.st.end.store(self.db.file.size(), Ordering::Release);
        self.st.off.store(self.db.roff, Ordering::Release);
        self.settle()
    }

    /// Positions at the record stored under `key`
    pub fn jump_key(&self, key: &[u8]) -> Result<()> {
        let _m = self.db.mlock_read();
        self.db.check_open()?;
        let h = crate::codec::hash::hash(key);
        let (found, _) = self
            .db
            .search_chain(h % self.db.bucket_count(), crate::codec::hash::fold(h), key)?;
        match found {
            Some(rec) => {
                self.st.end.store(self.db.file.size(), Ordering::Release);
                self.st.off.store(rec.off, Ordering::Release);
                Ok(())
            }
            None => {
                self.st.off.store(0, Ordering::Release);
                Err(Error::NoRecord("no record for the cursor key".to_string()))
            }
        }
    }

    /// Advances past the current region to the next record
    pub fn step(&self) -> Result<()> {
        let _m = self.db.mlock_read();
        self.db.check_open()?;
        let off = self.located()?;
        let rsiz = match self.db.read_region(off)? {
            Region::Record(rec) => rec.rsiz,
            Region::Free { rsiz, .. } => rsiz,
        };
        self.st.off.store(off + rsiz, Ordering::Release);
        self.settle()
    }

    /// Applies `visitor` to the record under the cursor, optionally
    /// stepping afterwards
    pub fn accept(&self, visitor: &mut dyn Visitor, writable: bool, step: bool) -> Result<()> {
        let result = self.accept_impl(visitor, writable, step);
        if let Err(e) = &result {
            self.db.note_fatal(e);
        }
        result
    }

    fn accept_impl(&self, visitor: &mut dyn Visitor, writable: bool, step: bool) -> Result<()> {
        let _m = self.db.mlock_write();
        self.db.check_open()?;
        if writable {
            self.db.check_writer()?;
        }
        self.located()?;
        self.settle()?;
        let off = self.st.off.load(Ordering::Acquire);

        let mut rec = match self.db.read_region(off)? {
            Region::Record(rec) => rec,
            Region::Free { .. } => {
                return Err(Error::Broken(format!("cursor settled on a free block at {}", off)))
            }
        };
        let rsiz = rec.rsiz;
        self.db.read_record_value(&mut rec)?;
        let plain = self.db.decompress(rec.value.take().unwrap())?;

        match visitor.visit_full(&rec.key, &plain) {
            VisitAction::Nop => {}
            _ if !writable => {
                return Err(Error::NoPermission(
                    "visitor attempted a mutation on a read-only access".to_string(),
                ))
            }
            action => {
                let h = crate::codec::hash::hash(&rec.key);
                let bidx = h % self.db.bucket_count();
                let fh = crate::codec::hash::fold(h);
                self.db.mutate_guarded(|db| {
                    let (found, entoff) = db.search_chain(bidx, fh, &rec.key)?;
                    let found = found.ok_or_else(|| {
                        Error::Broken("cursor record unreachable from its bucket".to_string())
                    })?;
                    if found.off != off {
                        return Err(Error::Broken(
                            "chain resolves to a different record than the cursor".to_string(),
                        ));
                    }
                    match action {
                        VisitAction::Remove => db.remove_record(&found, entoff, bidx),
                        VisitAction::Replace(value) => {
                            let raw = db.compress(value)?;
                            db.replace_record(found, entoff, bidx, &rec.key, &raw)
                        }
                        VisitAction::Nop => Ok(()),
                    }
                })?;
            }
        }

        if step {
            self.st.off.store(off + rsiz, Ordering::Release);
            // Exhaustion after a successful visit is not an error; the
            // next access reports it.
            let _ = self.settle();
        }
        Ok(())
    }

    /// Reads the record under the cursor as a key/value pair
    pub fn get(&self, step: bool) -> Result<(Vec<u8>, Vec<u8>)> {
        struct Take {
            pair: Option<(Vec<u8>, Vec<u8>)>,
        }
        impl Visitor for Take {
            fn visit_full(&mut self, k: &[u8], v: &[u8]) -> VisitAction {
                self.pair = Some((k.to_vec(), v.to_vec()));
                VisitAction::Nop
            }
        }
        let mut take = Take { pair: None };
        self.accept(&mut take, false, step)?;
        take.pair
            .ok_or_else(|| Error::NoRecord("cursor has no record".to_string()))
    }

    /// Reads the key under the cursor
    pub fn get_key(&self, step: bool) -> Result<Vec<u8>> {
        Ok(self.get(step)?.0)
    }

    /// Reads the value under the cursor
    pub fn get_value(&self, step: bool) -> Result<Vec<u8>> {
        Ok(self.get(step)?.1)
    }

    /// Rewrites the value under the cursor
    pub fn set_value(&self, value: &[u8], step: bool) -> Result<()> {
        struct Set<'a>(&'a [u8]);
        impl Visitor for Set<'_> {
            fn visit_full(&mut self, _k: &[u8], _v: &[u8]) -> VisitAction {
                VisitAction::Replace(self.0.to_vec())
            }
        }
        self.accept(&mut Set(value), true, step)
    }

    /// Removes the record under the cursor
    pub fn remove(&self) -> Result<()> {
        struct Remove;
        impl Visitor for Remove {
            fn visit_full(&mut self, _k: &[u8], _v: &[u8]) -> VisitAction {
                VisitAction::Remove
            }
        }
        self.accept(&mut Remove, true, false)
    }

    fn located(&self) -> Result<u64> {
        let off = self.st.off.load(Ordering::Acquire);
        if off == 0 {
            return Err(Error::NoRecord("cursor is not located".to_string()));
        }
        Ok(off)
    }

    /// Skips free blocks until a record or the end snapshot; clears the
    /// cursor when exhausted
    fn settle(&self) -> Result<()> {
        let mut off = self.st.off.load(Ordering::Acquire);
        let end = self.st.end.load(Ordering::Acquire);
        while off != 0 && off < end {
            match self.db.read_region(off)? {
                Region::Record(_) => {
                    self.st.off.store(off, Ordering::Release);
                    return Ok(());
                }
                Region::Free { rsiz, .. } => off += rsiz,
            }
        }
        self.st.off.store(0, Ordering::Release);
        Err(Error::NoRecord("cursor ran off the end".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{mode, HashDB};
    use keywell_core::{Error, VisitAction, Visitor};
    use tempfile::TempDir;

    fn seeded_db(dir: &TempDir) -> HashDB {
        let db = HashDB::builder()
            .buckets(17)
            .map_size(1 << 20)
            .open(dir.path().join("db.kwh"), mode::WRITER | mode::CREATE)
            .unwrap();
        db.set(b"alpha", b"1").unwrap();
        db.set(b"beta", b"22").unwrap();
        db.set(b"gamma", b"333").unwrap();
        db
    }

    #[test]
    fn jump_and_step_walk_in_insertion_order() {
        let dir = TempDir::new().unwrap();
        let db = seeded_db(&dir);

        let cur = db.cursor();
        cur.jump().unwrap();
        assert_eq!(cur.get(false).unwrap(), (b"alpha".to_vec(), b"1".to_vec()));
        cur.step().unwrap();
        assert_eq!(cur.get(false).unwrap(), (b"beta".to_vec(), b"22".to_vec()));
        cur.step().unwrap();
        assert_eq!(cur.get(false).unwrap(), (b"gamma".to_vec(), b"333".to_vec()));
        assert!(matches!(cur.step(), Err(Error::NoRecord(_))));
        assert!(matches!(cur.get(false), Err(Error::NoRecord(_))));
    }

    #[test]
    fn get_with_step_drains_the_database() {
        let dir = TempDir::new().unwrap();
        let db = seeded_db(&dir);

        let cur = db.cursor();
        cur.jump().unwrap();
        let mut keys = Vec::new();
        loop {
            match cur.get(true) {
                Ok((k, _)) => keys.push(k),
                Err(Error::NoRecord(_)) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(keys, vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]);
    }

    #[test]
    fn jump_key_positions_on_the_record() {
        let dir = TempDir::new().unwrap();
        let db = seeded_db(&dir);

        let cur = db.cursor();
        cur.jump_key(b"beta").unwrap();
        assert_eq!(cur.get_value(false).unwrap(), b"22");
        assert!(matches!(cur.jump_key(b"missing"), Err(Error::NoRecord(_))));
    }

    #[test]
    fn cursor_skips_records_removed_underneath_it() {
        let dir = TempDir::new().unwrap();
        let db = seeded_db(&dir);

        let cur = db.cursor();
        cur.jump().unwrap(); // parked on alpha
        db.remove(b"alpha").unwrap();
        // The extent under the cursor is a free block now; the next
        // access settles on beta
        assert_eq!(cur.get_key(false).unwrap(), b"beta");
    }

    #[test]
    fn cursor_remove_and_set_value() {
        let dir = TempDir::new().unwrap();
        let db = seeded_db(&dir);

        let cur = db.cursor();
        cur.jump().unwrap();
        cur.remove().unwrap();
        assert!(db.get(b"alpha").unwrap().is_none());
        assert_eq!(db.count(), 2);

        // After the removal the cursor settles on beta
        cur.set_value(b"rewritten", false).unwrap();
        assert_eq!(db.get(b"beta").unwrap().unwrap(), b"rewritten");
    }

    #[test]
    fn relocating_set_value_keeps_the_map_consistent() {
        let dir = TempDir::new().unwrap();
        let db = seeded_db(&dir);

        let cur = db.cursor();
        cur.jump_key(b"beta").unwrap();
        let fat = vec![b'F'; 500];
        cur.set_value(&fat, false).unwrap();
        assert_eq!(db.get(b"beta").unwrap().unwrap(), fat);
        assert_eq!(db.get(b"alpha").unwrap().unwrap(), b"1");
        assert_eq!(db.get(b"gamma").unwrap().unwrap(), b"333");
        assert_eq!(db.count(), 3);
    }

    #[test]
    fn unlocated_cursor_reports_no_record() {
        let dir = TempDir::new().unwrap();
        let db = seeded_db(&dir);
        let cur = db.cursor();
        assert!(matches!(cur.get(false), Err(Error::NoRecord(_))));
        assert!(matches!(cur.step(), Err(Error::NoRecord(_))));
    }

    #[test]
    fn read_only_cursor_accept_rejects_mutation() {
        let dir = TempDir::new().unwrap();
        let db = seeded_db(&dir);
        let cur = db.cursor();
        cur.jump().unwrap();

        struct Mutator;
        impl Visitor for Mutator {
            fn visit_full(&mut self, _k: &[u8], _v: &[u8]) -> VisitAction {
                VisitAction::Remove
            }
        }
        assert!(matches!(
            cur.accept(&mut Mutator, false, false),
            Err(Error::NoPermission(_))
        ));
        assert_eq!(db.count(), 3);
    }

    #[test]
    fn clear_invalidates_live_cursors() {
        let dir = TempDir::new().unwrap();
        let db = seeded_db(&dir);
        let cur = db.cursor();
        cur.jump().unwrap();

        db.clear().unwrap();
        assert!(matches!(cur.get(false), Err(Error::NoRecord(_))));

        // The cursor is reusable after repopulation
        db.set(b"fresh", b"start").unwrap();
        cur.jump().unwrap();
        assert_eq!(cur.get_key(false).unwrap(), b"fresh");
    }

    #[test]
    fn dropping_a_cursor_deregisters_it() {
        let dir = TempDir::new().unwrap();
        let db = seeded_db(&dir);
        {
            let cur = db.cursor();
            cur.jump().unwrap();
            assert_eq!(db.cursors.lock().len(), 1);
        }
        assert_eq!(db.cursors.lock().len(), 0);
    }
}
