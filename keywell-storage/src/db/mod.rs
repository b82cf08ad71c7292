//! The hash database
//!
//! A single file holds a 64-byte header, the free-pool dump area, a
//! fixed bucket array, and the record region. Every key hashes to a
//! bucket; each bucket roots a binary tree of records ordered by
//! (folded hash, key). All reads and mutations reduce to [`HashDB::accept`],
//! which looks the key up and dispatches a [`Visitor`].
//!
//! ## Locking
//!
//! - `mlock` — global read/write lock. Read-held by per-key operations,
//!   write-held by open/close, iteration, defragmentation, clearing,
//!   transaction boundaries, and cursor accept (which may relocate
//!   records).
//! - `rlocks[0..64]` — slotted record locks indexed by
//!   `bucket mod 64`; write-held by per-key mutations, read-held by
//!   per-key reads. Acquired only while `mlock` is read-held.
//! - `atlock` — serializes auto-transactions.
//! - `fbp`, `cursors`, `meta_lock` — leaf locks, never held across
//!   another lock acquisition.
//!
//! Never acquire two record slots at once; always take `mlock` before a
//! record slot.

mod bucket;
mod chain;
mod cursor;
mod defrag;
mod repair;
mod tran;

pub use cursor::Cursor;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::warn;
use parking_lot::{Mutex, RwLock};

use keywell_core::{Error, Result, VisitAction, Visitor};

use crate::codec::{header, header::DbHeader, Layout};
use crate::compress::{Compressor, Lz4Compressor};
use crate::fbp::FreeBlockPool;
use crate::file::FileMap;

use bucket::BucketArray;
use cursor::CursorState;

/// Open-mode bit flags, combined by bitwise or
pub mod mode {
    /// Open as a reader
    pub const READER: u32 = 1 << 0;
    /// Open as a writer
    pub const WRITER: u32 = 1 << 1;
    /// Create the file when it does not exist (writer)
    pub const CREATE: u32 = 1 << 2;
    /// Start from an empty file (writer)
    pub const TRUNCATE: u32 = 1 << 3;
    /// Wrap every mutation in a WAL-backed auto-transaction
    pub const AUTO_TRAN: u32 = 1 << 4;
    /// Physically sync the file after every mutation
    pub const AUTO_SYNC: u32 = 1 << 5;
    /// Skip the advisory file lock
    pub const NO_LOCK: u32 = 1 << 6;
    /// Fail instead of blocking on the advisory file lock
    pub const TRY_LOCK: u32 = 1 << 7;
    /// Never rebuild a dirty database at open
    pub const NO_REPAIR: u32 = 1 << 8;
}

/// Tuning option: 32-bit addressing (4-byte chain pointers)
pub const OPT_SMALL: u8 = 1 << 0;
/// Tuning option: linear chains instead of binary trees
pub const OPT_LINEAR: u8 = 1 << 1;
/// Tuning option: per-record value compression
pub const OPT_COMPRESS: u8 = 1 << 2;

const LOCK_SLOTS: usize = 64;
const DEFAULT_APOW: u8 = 3;
const DEFAULT_FPOW: u8 = 10;
const DEFAULT_BNUM: u64 = 1_048_583;
const DEFAULT_MSIZ: u64 = 64 << 20;
const AUTO_DEFRAG_COEF: i64 = 2;

/// Tuning knobs, fixed at open
///
/// Geometry parameters (`alignment_power`, `free_pool_power`,
/// `buckets`, `options`) only apply when the open creates or truncates
/// the file; an existing database keeps the geometry recorded in its
/// header. `map_size`, `defrag_unit` and the compressor are runtime
/// settings and apply to every open.
pub struct Builder {
    apow: u8,
    fpow: u8,
    bnum: u64,
    msiz: u64,
    dfunit: i64,
    opts: u8,
    compressor: Option<Arc<dyn Compressor>>,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            apow: DEFAULT_APOW,
            fpow: DEFAULT_FPOW,
            bnum: DEFAULT_BNUM,
            msiz: DEFAULT_MSIZ,
            dfunit: 0,
            opts: 0,
            compressor: None,
        }
    }
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record alignment is `2^apow`; valid range 0..=15
    pub fn alignment_power(mut self, apow: u8) -> Self {
        self.apow = apow;
        self
    }

    /// Free-block pool capacity is `2^fpow`; valid range 0..=20
    pub fn free_pool_power(mut self, fpow: u8) -> Self {
        self.fpow = fpow;
        self
    }

    /// Bucket count; large values are rounded to a nearby prime
    pub fn buckets(mut self, bnum: u64) -> Self {
        self.bnum = bnum;
        self
    }

    /// Length of the memory-mapped file prefix; 0 disables the map
    pub fn map_size(mut self, msiz: u64) -> Self {
        self.msiz = msiz;
        self
    }

    /// Fragmentation threshold for opportunistic defragmentation;
    /// 0 disables auto-defrag
    pub fn defrag_unit(mut self, dfunit: i64) -> Self {
        self.dfunit = dfunit;
        self
    }

    /// Combination of `OPT_SMALL`, `OPT_LINEAR`, `OPT_COMPRESS`
    pub fn options(mut self, opts: u8) -> Self {
        self.opts = opts;
        self
    }

    /// Compressor used when `OPT_COMPRESS` is set; defaults to LZ4
    pub fn compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Opens the database at `path`
    pub fn open(self, path: impl AsRef<Path>, omode: u32) -> Result<HashDB> {
        HashDB::open_with(self, path.as_ref(), omode)
    }
}

/// An embedded, single-file key-value hash database
pub struct HashDB {
    mlock: RwLock<()>,
    rlocks: Vec<RwLock<()>>,
    atlock: Mutex<()>,
    meta_lock: Mutex<()>,
    pub(crate) fbp: Mutex<FreeBlockPool>,
    pub(crate) cursors: Mutex<Vec<Weak<CursorState>>>,
    pub(crate) file: FileMap,
    pub(crate) lay: Layout,
    bnum: u64,
    dfunit: i64,
    fbp_area: usize,
    pub(crate) roff: u64,
    pub(crate) buckets: BucketArray,
    writer: bool,
    autotran: bool,
    autosync: bool,
    pub(crate) count: AtomicU64,
    pub(crate) frgcnt: AtomicU64,
    pub(crate) dfcur: AtomicU64,
    pub(crate) tran: AtomicBool,
    closed: AtomicBool,
    compressor: Option<Arc<dyn Compressor>>,
}

impl std::fmt::Debug for HashDB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashDB").finish_non_exhaustive()
    }
}

impl HashDB {
    /// Opens a database with default tuning
    pub fn open(path: impl AsRef<Path>, omode: u32) -> Result<HashDB> {
        Builder::default().open(path, omode)
    }

    /// Starts a tuning builder
    pub fn builder() -> Builder {
        Builder::default()
    }

    fn open_with(params: Builder, path: &Path, omode: u32) -> Result<HashDB> {
        let writer = omode & mode::WRITER != 0;
        if !writer && omode & mode::READER == 0 {
            return Err(Error::Invalid("open mode needs READER or WRITER".to_string()));
        }
        if !writer && omode & (mode::CREATE | mode::TRUNCATE | mode::AUTO_TRAN | mode::AUTO_SYNC) != 0
        {
            return Err(Error::Invalid("writer-only flags passed to a reader open".to_string()));
        }
        if params.apow > 15 {
            return Err(Error::Invalid(format!("alignment power out of range: {}", params.apow)));
        }
        if params.fpow > 20 {
            return Err(Error::Invalid(format!("free-pool power out of range: {}", params.fpow)));
        }
        if params.bnum < 1 {
            return Err(Error::Invalid("bucket count must be positive".to_string()));
        }
        if params.dfunit < 0 {
            return Err(Error::Invalid("defrag unit must not be negative".to_string()));
        }

        let mut truncate = omode & mode::TRUNCATE != 0;
        for attempt in 0..3 {
            let mut file = FileMap::open(
                path,
                writer,
                omode & mode::CREATE != 0,
                truncate,
                omode & mode::NO_LOCK != 0,
                omode & mode::TRY_LOCK != 0,
            )?;
            truncate = false;

            let mut recovered = false;
            let hdr = if file.physical_size() == 0 {
                if !writer {
                    return Err(Error::Broken("empty database file".to_string()));
                }
                Self::init_file(&params, &file)?
            } else {
                recovered = file.recover_wal()?;
                if file.physical_size() < header::HEADER_SIZE as u64 {
                    return Err(Error::Broken("file too small for a header".to_string()));
                }
                let mut hdr = DbHeader::decode(&file.read_vec(0, header::HEADER_SIZE)?)?;
                if recovered {
                    // Replay restored consistency; the open flag predates
                    // the transaction and must be cleared by hand.
                    hdr.flags &= !header::FLAG_OPEN;
                    file.write(header::FLAGS_OFF, &[hdr.flags])?;
                }
                let dirty = hdr.flags & (header::FLAG_OPEN | header::FLAG_FATAL) != 0;
                if dirty {
                    if !writer {
                        warn!(
                            "database {} was not closed cleanly; serving the image as-is",
                            path.display()
                        );
                    } else if omode & mode::NO_REPAIR != 0 {
                        return Err(Error::Broken(
                            "database was not closed cleanly and repair is disabled".to_string(),
                        ));
                    } else {
                        if attempt == 2 {
                            return Err(Error::Broken("database repair did not converge".to_string()));
                        }
                        repair::rebuild(path, &file, &hdr, params.compressor.clone())?;
                        drop(file);
                        continue;
                    }
                }
                hdr
            };

            let lay = Layout::new(hdr.apow, hdr.opts & OPT_SMALL != 0, hdr.opts & OPT_LINEAR != 0);
            let (fbp_area, boff, roff) = Self::geometry(&lay, hdr.fpow, hdr.bnum);
            if hdr.lsiz < roff {
                return Err(Error::Broken(format!(
                    "logical size {} below the record region at {}",
                    hdr.lsiz, roff
                )));
            }
            if file.physical_size() < hdr.lsiz {
                return Err(Error::Broken(format!(
                    "physical size {} below logical size {}",
                    file.physical_size(),
                    hdr.lsiz
                )));
            }
            file.set_size(hdr.lsiz);
            file.map_prefix(params.msiz)?;

            let compressor = if hdr.opts & OPT_COMPRESS != 0 {
                Some(
                    params
                        .compressor
                        .clone()
                        .unwrap_or_else(|| Arc::new(Lz4Compressor) as Arc<dyn Compressor>),
                )
            } else {
                None
            };

            let mut fbp = FreeBlockPool::new(hdr.fpow);
            if writer && fbp_area > 0 && !recovered {
                // The dump is only refreshed at a clean close. A WAL
                // replay rolls record extents back without touching it,
                // so after recovery the pool starts cold, like after an
                // in-process abort.
                fbp.load(&lay, &file.read_vec(64, fbp_area)?);
            }

            if writer {
                file.write(header::FLAGS_OFF, &[hdr.flags | header::FLAG_OPEN])?;
            }

            let db = HashDB {
                mlock: RwLock::new(()),
                rlocks: (0..LOCK_SLOTS).map(|_| RwLock::new(())).collect(),
                atlock: Mutex::new(()),
                meta_lock: Mutex::new(()),
                fbp: Mutex::new(fbp),
                cursors: Mutex::new(Vec::new()),
                file,
                lay,
                bnum: hdr.bnum,
                dfunit: params.dfunit,
                fbp_area,
                roff,
                buckets: BucketArray::new(boff, hdr.bnum, lay),
                writer,
                autotran: omode & mode::AUTO_TRAN != 0,
                autosync: omode & mode::AUTO_SYNC != 0,
                count: AtomicU64::new(hdr.count),
                frgcnt: AtomicU64::new(0),
                dfcur: AtomicU64::new(roff),
                tran: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                compressor,
            };
            return Ok(db);
        }
        Err(Error::Broken("database repair did not converge".to_string()))
    }

    /// Initializes a fresh file and returns its header
    fn init_file(params: &Builder, file: &FileMap) -> Result<DbHeader> {
        let bnum = normalize_bnum(params.bnum);
        let lay = Layout::new(
            params.apow,
            params.opts & OPT_SMALL != 0,
            params.opts & OPT_LINEAR != 0,
        );
        let (_, _, roff) = Self::geometry(&lay, params.fpow, bnum);
        let hdr = DbHeader::new(params.apow, params.fpow, params.opts, bnum, roff);
        file.write(0, &hdr.encode())?;
        file.truncate(roff)?;
        Ok(hdr)
    }

    fn geometry(lay: &Layout, fpow: u8, bnum: u64) -> (usize, u64, u64) {
        let fbp_area = if fpow > 0 { 2 * lay.width as usize + 2 } else { 0 };
        let boff = header::HEADER_SIZE as u64 + fbp_area as u64;
        let roff = lay.align_up(boff + bnum * lay.width as u64);
        (fbp_area, boff, roff)
    }

    /// Closes the database, dumping the free-block pool and clearing
    /// the open flag
    pub fn close(self) -> Result<()> {
        let result = self.close_impl();
        self.closed.store(true, Ordering::Release);
        result
    }

    /// Drops the handle without a clean shutdown, as if the process had
    /// crashed. Testing hook.
    #[doc(hidden)]
    pub fn abandon(self) {
        self.closed.store(true, Ordering::Release);
    }

    fn close_impl(&self) -> Result<()> {
        let _m = self.mlock.write();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NotOpened("database already closed".to_string()));
        }
        if self.tran.load(Ordering::Acquire) {
            // An open transaction at close aborts
            self.file.end_wal(false)?;
            self.tran.store(false, Ordering::Release);
            self.reload_after_rollback()?;
        }
        if self.writer {
            if self.fbp_area > 0 {
                let mut area = vec![0u8; self.fbp_area];
                let dump = self.fbp.lock().dump(&self.lay, self.fbp_area);
                area[..dump.len()].copy_from_slice(&dump);
                self.file.write(header::HEADER_SIZE as u64, &area)?;
            }
            self.dump_meta()?;
            let flags = self.file.read_vec(header::FLAGS_OFF, 1)?[0];
            self.file.write(header::FLAGS_OFF, &[flags & !header::FLAG_OPEN])?;
            self.file.finish()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Number of live records
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Logical size of the database file
    pub fn size(&self) -> u64 {
        self.file.size()
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NotOpened("database is closed".to_string()));
        }
        Ok(())
    }

    pub(crate) fn check_writer(&self) -> Result<()> {
        if !self.writer {
            return Err(Error::NoPermission("database opened as a reader".to_string()));
        }
        Ok(())
    }

    /// Applies `visitor` to the record stored under `key`
    ///
    /// This is the single mutation primitive; every facade reduces to
    /// it. With `writable` false the visitor must return
    /// [`VisitAction::Nop`].
    pub fn accept(&self, key: &[u8], visitor: &mut dyn Visitor, writable: bool) -> Result<()> {
        let result = self.accept_outer(key, visitor, writable);
        if let Err(e) = &result {
            self.note_fatal(e);
        }
        result
    }

    fn accept_outer(&self, key: &[u8], visitor: &mut dyn Visitor, writable: bool) -> Result<()> {
        let m = self.mlock.read();
        self.check_open()?;
        if writable {
            self.check_writer()?;
        }
        let h = crate::codec::hash::hash(key);
        let slot = ((h % self.bnum) as usize) % LOCK_SLOTS;
        if writable {
            let _r = self.rlocks[slot].write();
            self.mutate_guarded(|db| db.accept_impl(key, h, visitor, true))?;
            if self.autosync {
                self.file.sync_data()?;
            }
        } else {
            let _r = self.rlocks[slot].read();
            self.accept_impl(key, h, visitor, false)?;
        }
        drop(m);
        self.try_auto_defrag()
    }

    /// Runs `f` inside an auto-transaction when they are enabled and no
    /// explicit transaction is active
    pub(crate) fn mutate_guarded<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Self) -> Result<()>,
    {
        if self.autotran && !self.tran.load(Ordering::Acquire) {
            let _a = self.atlock.lock();
            self.file.begin_wal(header::META_OFF_COUNT, false)?;
            match f(self) {
                Ok(()) => self.file.end_wal(true),
                Err(e) => {
                    if let Err(re) = self
                        .file
                        .end_wal(false)
                        .and_then(|_| self.reload_after_rollback())
                    {
                        warn!("auto-transaction rollback failed: {}", re);
                    }
                    Err(e)
                }
            }
        } else {
            f(self)
        }
    }

    pub(crate) fn accept_impl(
        &self,
        key: &[u8],
        h: u64,
        visitor: &mut dyn Visitor,
        writable: bool,
    ) -> Result<()> {
        let bidx = h % self.bnum;
        let fh = crate::codec::hash::fold(h);
        let (found, entoff) = self.search_chain(bidx, fh, key)?;
        match found {
            Some(mut rec) => {
                self.read_record_value(&mut rec)?;
                let plain = self.decompress(rec.value.take().unwrap())?;
                match visitor.visit_full(key, &plain) {
                    VisitAction::Nop => Ok(()),
                    _ if !writable => Err(Error::NoPermission(
                        "visitor attempted a mutation on a read-only access".to_string(),
                    )),
                    VisitAction::Remove => self.remove_record(&rec, entoff, bidx),
                    VisitAction::Replace(value) => {
                        let raw = self.compress(value)?;
                        self.replace_record(rec, entoff, bidx, key, &raw)
                    }
                }
            }
            None => match visitor.visit_empty(key) {
                VisitAction::Nop | VisitAction::Remove => Ok(()),
                _ if !writable => Err(Error::NoPermission(
                    "visitor attempted a mutation on a read-only access".to_string(),
                )),
                VisitAction::Replace(value) => {
                    let raw = self.compress(value)?;
                    self.insert_record(bidx, entoff, key, &raw)
                }
            },
        }
    }

    /// Applies `visitor` to every record in file order
    ///
    /// Holds the global lock exclusively for the whole pass, so the
    /// scan is atomic relative to every other operation. Removals and
    /// relocating rewrites are routed back through the accept path to
    /// keep chains consistent.
    pub fn iterate(&self, visitor: &mut dyn Visitor, writable: bool) -> Result<()> {
        let result = self.iterate_impl(visitor, writable);
        if let Err(e) = &result {
            self.note_fatal(e);
        }
        result
    }

    fn iterate_impl(&self, visitor: &mut dyn Visitor, writable: bool) -> Result<()> {
        let _m = self.mlock.write();
        self.check_open()?;
        if writable {
            self.check_writer()?;
        }
        let end = self.file.size();
        let mut off = self.roff;
        while off < end {
            match self.read_region(off)? {
                chain::Region::Free { rsiz, .. } => off += rsiz,
                chain::Region::Record(mut rec) => {
                    let rsiz = rec.rsiz;
                    self.read_record_value(&mut rec)?;
                    let plain = self.decompress(rec.value.take().unwrap())?;
                    match visitor.visit_full(&rec.key, &plain) {
                        VisitAction::Nop => {}
                        _ if !writable => {
                            return Err(Error::NoPermission(
                                "visitor attempted a mutation on a read-only access".to_string(),
                            ))
                        }
                        action => {
                            let key = rec.key.clone();
                            self.mutate_guarded(|db| db.apply_decision(&key, action))?;
                        }
                    }
                    off += rsiz;
                }
            }
        }
        Ok(())
    }

    /// Re-dispatches a decision made outside the accept path
    fn apply_decision(&self, key: &[u8], action: VisitAction) -> Result<()> {
        struct Replay {
            action: Option<VisitAction>,
        }
        impl Visitor for Replay {
            fn visit_full(&mut self, _key: &[u8], _value: &[u8]) -> VisitAction {
                self.action.take().unwrap_or(VisitAction::Nop)
            }
            fn visit_empty(&mut self, _key: &[u8]) -> VisitAction {
                self.action.take().unwrap_or(VisitAction::Nop)
            }
        }
        let mut replay = Replay {
            action: Some(action),
        };
        self.accept_impl(key, crate::codec::hash::hash(key), &mut replay, true)
    }

    /// Removes every record and resets the file to its pristine layout
    pub fn clear(&self) -> Result<()> {
        let _m = self.mlock.write();
        self.check_open()?;
        self.check_writer()?;
        self.file.truncate(self.roff)?;
        // Zero the free-pool dump area and the bucket array
        let mut off = header::HEADER_SIZE as u64;
        let zeros = [0u8; 8192];
        while off < self.roff {
            let n = (self.roff - off).min(zeros.len() as u64) as usize;
            self.file.write(off, &zeros[..n])?;
            off += n as u64;
        }
        self.count.store(0, Ordering::Release);
        self.frgcnt.store(0, Ordering::Release);
        self.dfcur.store(self.roff, Ordering::Release);
        self.fbp.lock().clear();
        self.dump_meta()?;
        self.clamp_cursors(self.roff);
        Ok(())
    }

    /// Flushes metadata, and with `hard` the file contents, to disk
    pub fn synchronize(&self, hard: bool) -> Result<()> {
        let _m = self.mlock.read();
        self.check_open()?;
        self.check_writer()?;
        self.dump_meta()?;
        if hard {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Runs the defragmenter; `step <= 0` compacts the whole file
    pub fn defrag(&self, step: i64) -> Result<()> {
        let result = self.defrag_outer(step);
        if let Err(e) = &result {
            self.note_fatal(e);
        }
        result
    }

    /// Reads the 16-byte opaque header region
    pub fn opaque(&self) -> Result<[u8; header::OPAQUE_SIZE]> {
        let _m = self.mlock.read();
        self.check_open()?;
        let buf = self.file.read_vec(header::OPAQUE_OFF, header::OPAQUE_SIZE)?;
        Ok(buf.try_into().unwrap())
    }

    /// Writes the 16-byte opaque header region
    pub fn set_opaque(&self, data: &[u8; header::OPAQUE_SIZE]) -> Result<()> {
        let _m = self.mlock.read();
        self.check_open()?;
        self.check_writer()?;
        self.file.write(header::OPAQUE_OFF, data)
    }

    // ---- facades over accept ----

    /// Stores `value` under `key`, overwriting any existing record
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        struct Set<'a>(&'a [u8]);
        impl Visitor for Set<'_> {
            fn visit_full(&mut self, _k: &[u8], _v: &[u8]) -> VisitAction {
                VisitAction::Replace(self.0.to_vec())
            }
            fn visit_empty(&mut self, _k: &[u8]) -> VisitAction {
                VisitAction::Replace(self.0.to_vec())
            }
        }
        self.accept(key, &mut Set(value), true)
    }

    /// Stores `value` under `key`; fails when the key already exists
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        struct Add<'a> {
            value: &'a [u8],
            existed: bool,
        }
        impl Visitor for Add<'_> {
            fn visit_full(&mut self, _k: &[u8], _v: &[u8]) -> VisitAction {
                self.existed = true;
                VisitAction::Nop
            }
            fn visit_empty(&mut self, _k: &[u8]) -> VisitAction {
                VisitAction::Replace(self.value.to_vec())
            }
        }
        let mut v = Add {
            value,
            existed: false,
        };
        self.accept(key, &mut v, true)?;
        if v.existed {
            return Err(Error::Invalid("record duplication".to_string()));
        }
        Ok(())
    }

    /// Replaces the value of an existing record; fails when missing
    pub fn replace(&self, key: &[u8], value: &[u8]) -> Result<()> {
        struct Replace<'a> {
            value: &'a [u8],
            found: bool,
        }
        impl Visitor for Replace<'_> {
            fn visit_full(&mut self, _k: &[u8], _v: &[u8]) -> VisitAction {
                self.found = true;
                VisitAction::Replace(self.value.to_vec())
            }
        }
        let mut v = Replace {
            value,
            found: false,
        };
        self.accept(key, &mut v, true)?;
        if !v.found {
            return Err(Error::NoRecord("no record to replace".to_string()));
        }
        Ok(())
    }

    /// Concatenates `value` to the record under `key`, inserting when
    /// missing
    pub fn append(&self, key: &[u8], value: &[u8]) -> Result<()> {
        struct Append<'a>(&'a [u8]);
        impl Visitor for Append<'_> {
            fn visit_full(&mut self, _k: &[u8], old: &[u8]) -> VisitAction {
                let mut joined = Vec::with_capacity(old.len() + self.0.len());
                joined.extend_from_slice(old);
                joined.extend_from_slice(self.0);
                VisitAction::Replace(joined)
            }
            fn visit_empty(&mut self, _k: &[u8]) -> VisitAction {
                VisitAction::Replace(self.0.to_vec())
            }
        }
        self.accept(key, &mut Append(value), true)
    }

    /// Removes the record under `key`; fails when missing
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        struct Remove {
            found: bool,
        }
        impl Visitor for Remove {
            fn visit_full(&mut self, _k: &[u8], _v: &[u8]) -> VisitAction {
                self.found = true;
                VisitAction::Remove
            }
        }
        let mut v = Remove { found: false };
        self.accept(key, &mut v, true)?;
        if !v.found {
            return Err(Error::NoRecord("no record to remove".to_string()));
        }
        Ok(())
    }

    /// Retrieves the value under `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        struct Get {
            value: Option<Vec<u8>>,
        }
        impl Visitor for Get {
            fn visit_full(&mut self, _k: &[u8], v: &[u8]) -> VisitAction {
                self.value = Some(v.to_vec());
                VisitAction::Nop
            }
        }
        let mut v = Get { value: None };
        self.accept(key, &mut v, false)?;
        Ok(v.value)
    }

    // ---- internals shared with the submodules ----

    pub(crate) fn mlock_read(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.mlock.read()
    }

    pub(crate) fn mlock_write(&self) -> parking_lot::RwLockWriteGuard<'_, ()> {
        self.mlock.write()
    }

    pub(crate) fn bucket_count(&self) -> u64 {
        self.bnum
    }

    pub(crate) fn dump_meta(&self) -> Result<()> {
        let _g = self.meta_lock.lock();
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.count.load(Ordering::Acquire).to_be_bytes());
        buf[8..].copy_from_slice(&self.file.size().to_be_bytes());
        self.file.write(header::META_OFF_COUNT, &buf)
    }

    pub(crate) fn reload_after_rollback(&self) -> Result<()> {
        let buf = self.file.read_vec(header::META_OFF_COUNT, 16)?;
        let count = u64::from_be_bytes(buf[..8].try_into().unwrap());
        let lsiz = u64::from_be_bytes(buf[8..].try_into().unwrap());
        self.count.store(count, Ordering::Release);
        self.file.set_size(lsiz);
        // Pooled blocks may describe rolled-back state; start cold
        self.fbp.lock().clear();
        self.dfcur.store(self.roff, Ordering::Release);
        self.clamp_cursors(lsiz);
        Ok(())
    }

    pub(crate) fn compress(&self, value: Vec<u8>) -> Result<Vec<u8>> {
        match &self.compressor {
            Some(c) => c.compress(&value),
            None => Ok(value),
        }
    }

    pub(crate) fn decompress(&self, raw: Vec<u8>) -> Result<Vec<u8>> {
        match &self.compressor {
            Some(c) => c.decompress(&raw),
            None => Ok(raw),
        }
    }

    fn try_auto_defrag(&self) -> Result<()> {
        if !self.writer || self.dfunit <= 0 {
            return Ok(());
        }
        if (self.frgcnt.load(Ordering::Acquire) as i64) < self.dfunit {
            return Ok(());
        }
        // Best effort: when the exclusive lock is contended the run is
        // skipped and the counter keeps accruing.
        let Some(_m) = self.mlock.try_write() else {
            return Ok(());
        };
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.defrag_impl(self.dfunit.saturating_mul(AUTO_DEFRAG_COEF))?;
        self.frgcnt.store(0, Ordering::Release);
        Ok(())
    }

    pub(crate) fn note_fatal(&self, e: &Error) {
        if !e.is_fatal() || !self.writer || self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Ok(b) = self.file.read_vec(header::FLAGS_OFF, 1) {
            let _ = self.file.write(header::FLAGS_OFF, &[b[0] | header::FLAG_FATAL]);
        }
    }
}

impl Drop for HashDB {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.close_impl() {
                warn!("close on drop failed: {}", e);
            }
            self.closed.store(true, Ordering::Release);
        }
    }
}

fn normalize_bnum(bnum: u64) -> u64 {
    let bnum = bnum.max(1);
    if bnum <= 4 {
        bnum
    } else {
        next_prime(bnum)
    }
}

fn next_prime(n: u64) -> u64 {
    let mut candidate = if n % 2 == 0 { n + 1 } else { n };
    loop {
        if is_prime(candidate) {
            return candidate;
        }
        candidate += 2;
    }
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3u64;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_tmp(dir: &TempDir) -> HashDB {
        HashDB::builder()
            .buckets(31)
            .map_size(1 << 20)
            .open(dir.path().join("db.kwh"), mode::WRITER | mode::CREATE)
            .unwrap()
    }

    #[test]
    fn prime_normalization() {
        assert_eq!(normalize_bnum(0), 1);
        assert_eq!(normalize_bnum(3), 3);
        assert_eq!(normalize_bnum(17), 17);
        assert_eq!(normalize_bnum(100), 101);
        assert_eq!(normalize_bnum(1_048_583), 1_048_583);
        assert!(is_prime(normalize_bnum(1_000_000)));
    }

    #[test]
    fn set_get_remove_roundtrip() {
        let dir = TempDir::new().unwrap();
        let db = open_tmp(&dir);

        db.set(b"alpha", b"1").unwrap();
        assert_eq!(db.get(b"alpha").unwrap().unwrap(), b"1");
        assert_eq!(db.count(), 1);

        db.remove(b"alpha").unwrap();
        assert!(db.get(b"alpha").unwrap().is_none());
        assert_eq!(db.count(), 0);
    }

    #[test]
    fn set_overwrites_without_growing_count() {
        let dir = TempDir::new().unwrap();
        let db = open_tmp(&dir);

        db.set(b"k", b"v1").unwrap();
        db.set(b"k", b"v2").unwrap();
        assert_eq!(db.get(b"k").unwrap().unwrap(), b"v2");
        assert_eq!(db.count(), 1);
    }

    #[test]
    fn add_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let db = open_tmp(&dir);

        db.add(b"k", b"v").unwrap();
        let err = db.add(b"k", b"w").unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        assert_eq!(db.get(b"k").unwrap().unwrap(), b"v");
    }

    #[test]
    fn replace_requires_an_existing_record() {
        let dir = TempDir::new().unwrap();
        let db = open_tmp(&dir);

        assert!(matches!(db.replace(b"k", b"v"), Err(Error::NoRecord(_))));
        db.set(b"k", b"v").unwrap();
        db.replace(b"k", b"w").unwrap();
        assert_eq!(db.get(b"k").unwrap().unwrap(), b"w");
    }

    #[test]
    fn remove_of_missing_key_reports_no_record() {
        let dir = TempDir::new().unwrap();
        let db = open_tmp(&dir);
        assert!(matches!(db.remove(b"ghost"), Err(Error::NoRecord(_))));
    }

    #[test]
    fn append_concatenates() {
        let dir = TempDir::new().unwrap();
        let db = open_tmp(&dir);

        db.append(b"k", b"abc").unwrap();
        db.append(b"k", b"def").unwrap();
        assert_eq!(db.get(b"k").unwrap().unwrap(), b"abcdef");
        assert_eq!(db.count(), 1);
    }

    #[test]
    fn clear_resets_count_and_size() {
        let dir = TempDir::new().unwrap();
        let db = open_tmp(&dir);

        for i in 0..50u32 {
            db.set(format!("key{}", i).as_bytes(), b"value").unwrap();
        }
        assert_eq!(db.count(), 50);

        db.clear().unwrap();
        assert_eq!(db.count(), 0);
        assert_eq!(db.size(), db.roff);
        assert!(db.get(b"key1").unwrap().is_none());

        db.set(b"after", b"clear").unwrap();
        assert_eq!(db.get(b"after").unwrap().unwrap(), b"clear");
    }

    #[test]
    fn close_persists_and_reader_reopens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.kwh");
        let db = HashDB::open(&path, mode::WRITER | mode::CREATE).unwrap();
        db.set(b"k", b"v").unwrap();
        db.close().unwrap();

        let db = HashDB::open(&path, mode::READER).unwrap();
        assert_eq!(db.get(b"k").unwrap().unwrap(), b"v");
    }

    #[test]
    fn reader_mode_rejects_mutations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.kwh");
        {
            let db = HashDB::open(&path, mode::WRITER | mode::CREATE).unwrap();
            db.set(b"k", b"v").unwrap();
            db.close().unwrap();
        }
        let db = HashDB::open(&path, mode::READER).unwrap();
        assert!(matches!(db.set(b"k", b"w"), Err(Error::NoPermission(_))));
        assert!(matches!(db.clear(), Err(Error::NoPermission(_))));
        assert_eq!(db.get(b"k").unwrap().unwrap(), b"v");
    }

    #[test]
    fn read_only_accept_rejects_mutating_visitors() {
        let dir = TempDir::new().unwrap();
        let db = open_tmp(&dir);
        db.set(b"k", b"v").unwrap();

        struct Mutator;
        impl Visitor for Mutator {
            fn visit_full(&mut self, _k: &[u8], _v: &[u8]) -> VisitAction {
                VisitAction::Remove
            }
        }
        let err = db.accept(b"k", &mut Mutator, false).unwrap_err();
        assert!(matches!(err, Error::NoPermission(_)));
        assert_eq!(db.get(b"k").unwrap().unwrap(), b"v");
    }

    #[test]
    fn opaque_region_roundtrips_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.kwh");
        {
            let db = HashDB::open(&path, mode::WRITER | mode::CREATE).unwrap();
            db.set_opaque(b"sixteen bytes!!!").unwrap();
            db.close().unwrap();
        }
        let db = HashDB::open(&path, mode::READER).unwrap();
        assert_eq!(&db.opaque().unwrap(), b"sixteen bytes!!!");
    }

    #[test]
    fn open_mode_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.kwh");
        assert!(matches!(HashDB::open(&path, 0), Err(Error::Invalid(_))));
        assert!(matches!(
            HashDB::open(&path, mode::READER | mode::CREATE),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            HashDB::builder().alignment_power(16).open(&path, mode::WRITER | mode::CREATE),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn existing_geometry_wins_over_builder_tuning() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.kwh");
        {
            let db = HashDB::builder()
                .alignment_power(4)
                .buckets(17)
                .open(&path, mode::WRITER | mode::CREATE)
                .unwrap();
            db.set(b"k", b"v").unwrap();
            db.close().unwrap();
        }
        // Different tuning on reopen; the header geometry is kept
        let db = HashDB::builder()
            .alignment_power(8)
            .buckets(977)
            .open(&path, mode::WRITER)
            .unwrap();
        assert_eq!(db.lay.apow, 4);
        assert_eq!(db.bnum, 17);
        assert_eq!(db.get(b"k").unwrap().unwrap(), b"v");
    }

    #[test]
    fn iterate_visits_in_insertion_order() {
        let dir = TempDir::new().unwrap();
        let db = open_tmp(&dir);
        db.set(b"alpha", b"1").unwrap();
        db.set(b"beta", b"22").unwrap();
        db.set(b"gamma", b"333").unwrap();

        struct Collect(Vec<Vec<u8>>);
        impl Visitor for Collect {
            fn visit_full(&mut self, k: &[u8], _v: &[u8]) -> VisitAction {
                self.0.push(k.to_vec());
                VisitAction::Nop
            }
        }
        let mut v = Collect(Vec::new());
        db.iterate(&mut v, false).unwrap();
        assert_eq!(v.0, vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]);
    }

    #[test]
    fn iterate_can_remove_and_rewrite() {
        let dir = TempDir::new().unwrap();
        let db = open_tmp(&dir);
        for i in 0..20u32 {
            db.set(format!("key{:02}", i).as_bytes(), b"orig").unwrap();
        }

        struct Mutate;
        impl Visitor for Mutate {
            fn visit_full(&mut self, k: &[u8], _v: &[u8]) -> VisitAction {
                if k.ends_with(b"3") {
                    VisitAction::Remove
                } else if k.ends_with(b"4") {
                    VisitAction::Replace(b"rewritten to something longer".to_vec())
                } else {
                    VisitAction::Nop
                }
            }
        }
        db.iterate(&mut Mutate, true).unwrap();

        assert_eq!(db.count(), 18);
        assert!(db.get(b"key03").unwrap().is_none());
        assert!(db.get(b"key13").unwrap().is_none());
        assert_eq!(db.get(b"key04").unwrap().unwrap(), b"rewritten to something longer");
        assert_eq!(db.get(b"key05").unwrap().unwrap(), b"orig");
    }
}
