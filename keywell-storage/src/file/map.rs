//! Memory-mapped database file with positional fallback
//!
//! The mapped prefix covers `msiz` bytes (page-rounded, fixed at open).
//! The mapping may extend past the physical end of the file; touching
//! an unbacked page faults, so every mapped write first grows the
//! physical size by truncation. Growth is amortized: the file is
//! extended to `min(msiz, end + physical/2)` rounded up to a page.
//! Writes past the map go straight to positional I/O, which extends the
//! file by itself; the physical size is trimmed back to the logical
//! size on close.
//!
//! Concurrency: the map is written through raw pointers from many
//! threads at once. This is sound only because the engine's lock
//! hierarchy guarantees that concurrently written ranges are disjoint —
//! see the locking notes on `HashDB`.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{info, warn};
use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::Mutex;

use keywell_core::{Error, Result};

use super::lock;
use super::wal::{self, WalFile};
use crate::fsutil;

/// System page size assumed for map and growth rounding
const PAGE_SIZE: u64 = 4096;

fn round_page(n: u64) -> u64 {
    (n + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

enum MapHolder {
    Rw(MmapMut),
    Ro(Mmap),
}

/// The database file: locked, optionally prefix-mapped, WAL-guarded
pub struct FileMap {
    file: File,
    path: PathBuf,
    wal_path: PathBuf,
    writer: bool,
    /// Mapped prefix length; 0 when unmapped
    msiz: u64,
    map: Option<MapHolder>,
    map_ptr: *mut u8,
    lsiz: AtomicU64,
    psiz: AtomicU64,
    grow: Mutex<()>,
    wal: Mutex<Option<WalFile>>,
    /// Fast-path flag mirroring `wal.is_some_and(active)`
    tran: AtomicBool,
}

// SAFETY: the raw map pointer is written from multiple threads, but the
// engine guarantees concurrently accessed ranges are disjoint (per-slot
// record locks; the global lock for structural operations). The mapping
// itself lives as long as `map`, which is only dropped with the struct.
unsafe impl Send for FileMap {}
unsafe impl Sync for FileMap {}

impl FileMap {
    /// Opens and locks the file; the map is attached later with
    /// [`map_prefix`](Self::map_prefix) once recovery has run
    pub fn open(
        path: impl AsRef<Path>,
        writer: bool,
        create: bool,
        truncate: bool,
        no_lock: bool,
        try_lock: bool,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(writer)
            .create(writer && create)
            .truncate(writer && truncate)
            .open(&path)
            .map_err(|e| Error::System(format!("open {}: {}", path.display(), e)))?;
        if !no_lock {
            lock::acquire(&file, writer, try_lock)?;
        }
        let len = file.metadata()?.len();
        let wal_path = PathBuf::from(format!("{}.wal", path.display()));
        Ok(FileMap {
            file,
            path,
            wal_path,
            writer,
            msiz: 0,
            map: None,
            map_ptr: std::ptr::null_mut(),
            lsiz: AtomicU64::new(len),
            psiz: AtomicU64::new(len),
            grow: Mutex::new(()),
            wal: Mutex::new(None),
            tran: AtomicBool::new(false),
        })
    }

    /// Maps the first `msiz` bytes (page-rounded); `msiz == 0` disables
    /// the map and every access goes positional
    pub fn map_prefix(&mut self, msiz: u64) -> Result<()> {
        debug_assert!(self.map.is_none());
        if msiz == 0 {
            return Ok(());
        }
        let len = round_page(msiz);
        if self.writer {
            // SAFETY: the file is held under an advisory lock; in-process
            // aliasing is constrained by the engine's lock hierarchy.
            let mut m = unsafe { MmapOptions::new().len(len as usize).map_mut(&self.file)? };
            self.map_ptr = m.as_mut_ptr();
            self.map = Some(MapHolder::Rw(m));
        } else {
            let m = unsafe { MmapOptions::new().len(len as usize).map(&self.file)? };
            self.map_ptr = m.as_ptr() as *mut u8;
            self.map = Some(MapHolder::Ro(m));
        }
        self.msiz = len;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }

    pub fn writer(&self) -> bool {
        self.writer
    }

    /// Logical size: the byte length the database considers in use
    pub fn size(&self) -> u64 {
        self.lsiz.load(Ordering::Acquire)
    }

    pub fn physical_size(&self) -> u64 {
        self.psiz.load(Ordering::Acquire)
    }

    /// Adopts a logical size recorded in the header at open time
    pub fn set_size(&self, lsiz: u64) {
        self.lsiz.store(lsiz, Ordering::Release);
    }

    /// Atomically reserves `n` bytes at the logical end; returns the
    /// offset of the reservation
    pub fn expand(&self, n: u64) -> u64 {
        self.lsiz.fetch_add(n, Ordering::AcqRel)
    }

    /// Reads `buf.len()` bytes at `off`
    pub fn read_into(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = off + buf.len() as u64;
        let mapped = self.msiz.min(self.psiz.load(Ordering::Acquire));
        if end <= mapped {
            // SAFETY: [off, end) is within the mapped, physically backed
            // prefix; writers to this range are excluded by upper locks.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.map_ptr.add(off as usize),
                    buf.as_mut_ptr(),
                    buf.len(),
                );
            }
        } else if off < mapped {
            let split = (mapped - off) as usize;
            unsafe {
                std::ptr::copy_nonoverlapping(self.map_ptr.add(off as usize), buf.as_mut_ptr(), split);
            }
            self.file.read_exact_at(&mut buf[split..], mapped)?;
        } else {
            self.file.read_exact_at(buf, off)?;
        }
        Ok(())
    }

    /// Reads `len` bytes at `off` into a fresh buffer
    pub fn read_vec(&self, off: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(off, &mut buf)?;
        Ok(buf)
    }

    /// Writes `buf` at `off`, capturing a WAL pre-image when a
    /// transaction guards the range
    pub fn write(&self, off: u64, buf: &[u8]) -> Result<()> {
        if !self.writer {
            return Err(Error::NoPermission("file opened read-only".to_string()));
        }
        if buf.is_empty() {
            return Ok(());
        }
        if self.tran.load(Ordering::Acquire) {
            self.capture(off, buf.len() as u64)?;
        }
        self.write_raw(off, buf)?;
        self.lsiz.fetch_max(off + buf.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    fn write_raw(&self, off: u64, buf: &[u8]) -> Result<()> {
        let end = off + buf.len() as u64;
        if end <= self.msiz {
            self.grow_physical(end)?;
            // SAFETY: physical size now covers [off, end); the range is
            // inside the map and disjoint from other writers.
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), self.map_ptr.add(off as usize), buf.len());
            }
        } else if off < self.msiz {
            let split = (self.msiz - off) as usize;
            self.grow_physical(self.msiz)?;
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), self.map_ptr.add(off as usize), split);
            }
            self.file.write_all_at(&buf[split..], self.msiz)?;
            self.psiz.fetch_max(end, Ordering::AcqRel);
        } else {
            self.file.write_all_at(buf, off)?;
            self.psiz.fetch_max(end, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Grows the physical size to cover `min_end` within the map,
    /// amortizing truncate calls
    fn grow_physical(&self, min_end: u64) -> Result<()> {
        if self.psiz.load(Ordering::Acquire) >= min_end {
            return Ok(());
        }
        let _g = self.grow.lock();
        let cur = self.psiz.load(Ordering::Acquire);
        if cur >= min_end {
            return Ok(());
        }
        let target = round_page(min_end + cur / 2).min(self.msiz).max(min_end);
        self.file.set_len(target)?;
        self.psiz.store(target, Ordering::Release);
        Ok(())
    }

    /// Truncates the file to `size`, logically and physically
    pub fn truncate(&self, size: u64) -> Result<()> {
        if !self.writer {
            return Err(Error::NoPermission("file opened read-only".to_string()));
        }
        if self.tran.load(Ordering::Acquire) {
            let trmsiz = self.wal.lock().as_ref().map(|w| w.trmsiz()).unwrap_or(0);
            if size < trmsiz {
                self.capture(size, trmsiz - size)?;
            }
        }
        self.truncate_raw(size)
    }

    fn truncate_raw(&self, size: u64) -> Result<()> {
        let _g = self.grow.lock();
        self.file.set_len(size)?;
        self.psiz.store(size, Ordering::Release);
        self.lsiz.store(size, Ordering::Release);
        Ok(())
    }

    /// Emits the pre-image of `[off, off+len)` clipped to the guarded
    /// region
    fn capture(&self, off: u64, len: u64) -> Result<()> {
        let mut guard = self.wal.lock();
        let Some(w) = guard.as_mut() else {
            return Ok(());
        };
        if !w.active() {
            return Ok(());
        }
        let lo = off.max(w.base());
        let hi = (off + len).min(w.trmsiz());
        if lo >= hi {
            return Ok(());
        }
        let pre = self.read_vec(lo, (hi - lo) as usize)?;
        w.append(lo, &pre)
    }

    /// Arms WAL capture for a transaction guarding `[base, size())`
    pub fn begin_wal(&self, base: u64, hard: bool) -> Result<()> {
        if !self.writer {
            return Err(Error::NoPermission("file opened read-only".to_string()));
        }
        let mut guard = self.wal.lock();
        if guard.is_none() {
            *guard = Some(WalFile::open(&self.wal_path)?);
        }
        let w = guard.as_mut().unwrap();
        w.begin(self.size(), base, hard)?;
        self.tran.store(true, Ordering::Release);
        Ok(())
    }

    /// Ends the WAL session; on abort the guarded region and the
    /// logical size are restored from the pre-images
    pub fn end_wal(&self, commit: bool) -> Result<()> {
        let mut guard = self.wal.lock();
        let Some(w) = guard.as_mut() else {
            return Err(Error::Logic("no WAL session".to_string()));
        };
        if !w.active() {
            return Err(Error::Logic("no active WAL session".to_string()));
        }
        self.tran.store(false, Ordering::Release);
        if commit {
            if w.hard() {
                self.sync_data()?;
            }
            w.end()
        } else {
            let orig = w.orig_lsiz();
            let messages = w.messages()?;
            for msg in messages.iter().rev() {
                self.write_raw(msg.off, &msg.data)?;
            }
            self.truncate_raw(orig)?;
            if w.hard() {
                self.sync_data()?;
            }
            w.end()
        }
    }

    /// Whether a WAL session is currently armed
    pub fn in_transaction(&self) -> bool {
        self.tran.load(Ordering::Acquire)
    }

    /// Replays a crash-left WAL onto this file, then unlinks it
    ///
    /// Must run before [`map_prefix`](Self::map_prefix), under the file
    /// lock. Returns whether a recovery happened.
    pub fn recover_wal(&self) -> Result<bool> {
        debug_assert!(self.map.is_none());
        let Some((orig, messages)) = wal::load(&self.wal_path)? else {
            if self.writer && fsutil::status(&self.wal_path)?.is_some() {
                // A committed (zeroed) WAL left behind by a crash after
                // commit; nothing to replay.
                fsutil::remove_file(&self.wal_path)?;
            }
            return Ok(false);
        };
        if !self.writer {
            warn!(
                "WAL present at {} but the database is opened read-only; serving unrecovered image",
                self.wal_path.display()
            );
            return Ok(false);
        }
        info!(
            "recovering {} from WAL: {} pre-images, original size {}",
            self.path.display(),
            messages.len(),
            orig
        );
        for msg in messages.iter().rev() {
            self.write_raw(msg.off, &msg.data)?;
        }
        self.truncate_raw(orig)?;
        self.file.sync_all()?;
        fsutil::remove_file(&self.wal_path)?;
        Ok(true)
    }

    /// Flushes the map and file contents to the platter
    pub fn sync_data(&self) -> Result<()> {
        if let Some(MapHolder::Rw(m)) = &self.map {
            m.flush()?;
        }
        self.file.sync_all()?;
        Ok(())
    }

    /// Clean shutdown: trims the grow-ahead slack and flushes
    pub fn finish(&self) -> Result<()> {
        if self.writer {
            let lsiz = self.size();
            {
                let _g = self.grow.lock();
                self.file.set_len(lsiz)?;
                self.psiz.store(lsiz, Ordering::Release);
            }
            self.sync_data()?;
            if fsutil::status(&self.wal_path)?.is_some() {
                fsutil::remove_file(&self.wal_path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_rw(path: &Path, msiz: u64) -> FileMap {
        let mut fm = FileMap::open(path, true, true, false, false, false).unwrap();
        fm.map_prefix(msiz).unwrap();
        fm
    }

    #[test]
    fn mapped_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let fm = open_rw(&dir.path().join("db"), 1 << 16);

        fm.write(100, b"hello mapped world").unwrap();
        let mut buf = [0u8; 18];
        fm.read_into(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello mapped world");
        assert_eq!(fm.size(), 118);
    }

    #[test]
    fn write_grows_physical_size_before_touching_the_map() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        let fm = open_rw(&path, 1 << 20);

        fm.write(50_000, &[7u8; 100]).unwrap();
        let physical = std::fs::metadata(&path).unwrap().len();
        assert!(physical >= 50_100);
        assert_eq!(physical % PAGE_SIZE, 0);
        assert_eq!(fm.physical_size(), physical);
    }

    #[test]
    fn writes_beyond_the_map_fall_back_to_positional_io() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        let fm = open_rw(&path, PAGE_SIZE);

        // Straddling write: half mapped, half positional
        let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        fm.write(PAGE_SIZE - 100, &data).unwrap();
        let mut buf = vec![0u8; 200];
        fm.read_into(PAGE_SIZE - 100, &mut buf).unwrap();
        assert_eq!(buf, data);

        // Fully positional write
        fm.write(PAGE_SIZE * 10, b"far away").unwrap();
        let mut buf = [0u8; 8];
        fm.read_into(PAGE_SIZE * 10, &mut buf).unwrap();
        assert_eq!(&buf, b"far away");
        assert_eq!(fm.size(), PAGE_SIZE * 10 + 8);
    }

    #[test]
    fn unmapped_file_serves_everything_positionally() {
        let dir = TempDir::new().unwrap();
        let fm = open_rw(&dir.path().join("db"), 0);

        fm.write(0, b"positional only").unwrap();
        let mut buf = [0u8; 15];
        fm.read_into(0, &mut buf).unwrap();
        assert_eq!(&buf, b"positional only");
    }

    #[test]
    fn expand_reserves_disjoint_extents() {
        let dir = TempDir::new().unwrap();
        let fm = open_rw(&dir.path().join("db"), 1 << 16);
        fm.write(0, &[0u8; 64]).unwrap();

        let a = fm.expand(32);
        let b = fm.expand(16);
        assert_eq!(a, 64);
        assert_eq!(b, 96);
        assert_eq!(fm.size(), 112);
    }

    #[test]
    fn finish_trims_growth_slack() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        let fm = open_rw(&path, 1 << 20);

        fm.write(10_000, &[1u8; 10]).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 10_010);
        fm.finish().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10_010);
    }

    #[test]
    fn readonly_handle_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        {
            let fm = open_rw(&path, 0);
            fm.write(0, b"seed").unwrap();
            fm.finish().unwrap();
        }
        let mut fm = FileMap::open(&path, false, false, false, false, false).unwrap();
        fm.map_prefix(PAGE_SIZE).unwrap();
        assert!(matches!(fm.write(0, b"x"), Err(Error::NoPermission(_))));
        let mut buf = [0u8; 4];
        fm.read_into(0, &mut buf).unwrap();
        assert_eq!(&buf, b"seed");
    }

    #[test]
    fn abort_restores_guarded_bytes_and_size() {
        let dir = TempDir::new().unwrap();
        let fm = open_rw(&dir.path().join("db"), 1 << 16);

        fm.write(0, &[0xAA; 256]).unwrap();
        assert_eq!(fm.size(), 256);

        fm.begin_wal(16, false).unwrap();
        fm.write(32, &[0xBB; 64]).unwrap(); // inside guard: captured
        fm.write(500, &[0xCC; 10]).unwrap(); // beyond snapshot: truncated away
        fm.end_wal(false).unwrap();

        assert_eq!(fm.size(), 256);
        let buf = fm.read_vec(0, 256).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn abort_respects_the_guard_base() {
        let dir = TempDir::new().unwrap();
        let fm = open_rw(&dir.path().join("db"), 1 << 16);

        fm.write(0, &[0xAA; 128]).unwrap();
        fm.begin_wal(64, false).unwrap();
        fm.write(0, &[0xBB; 128]).unwrap();
        fm.end_wal(false).unwrap();

        let buf = fm.read_vec(0, 128).unwrap();
        // Below the guard base the new bytes stick; above they roll back
        assert!(buf[..64].iter().all(|&b| b == 0xBB));
        assert!(buf[64..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn commit_keeps_changes_and_disarms_capture() {
        let dir = TempDir::new().unwrap();
        let fm = open_rw(&dir.path().join("db"), 1 << 16);

        fm.write(0, &[0xAA; 64]).unwrap();
        fm.begin_wal(0, false).unwrap();
        fm.write(0, &[0xBB; 64]).unwrap();
        fm.end_wal(true).unwrap();
        assert!(!fm.in_transaction());

        let buf = fm.read_vec(0, 64).unwrap();
        assert!(buf.iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn truncation_inside_a_transaction_rolls_back() {
        let dir = TempDir::new().unwrap();
        let fm = open_rw(&dir.path().join("db"), 1 << 16);

        fm.write(0, &[0xAA; 512]).unwrap();
        fm.begin_wal(0, false).unwrap();
        fm.truncate(100).unwrap();
        assert_eq!(fm.size(), 100);
        fm.end_wal(false).unwrap();

        assert_eq!(fm.size(), 512);
        let buf = fm.read_vec(0, 512).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn crash_recovery_replays_pre_images_in_reverse() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        {
            let fm = open_rw(&path, 1 << 16);
            fm.write(0, &[0xAA; 256]).unwrap();
            fm.begin_wal(0, true).unwrap();
            fm.write(10, &[0xBB; 20]).unwrap();
            fm.write(10, &[0xCC; 20]).unwrap(); // second overwrite of the same range
            fm.sync_data().unwrap();
            // Dropped without end_wal: simulated crash
        }

        let fm2 = FileMap::open(&path, true, false, false, false, false).unwrap();
        assert!(fm2.recover_wal().unwrap());
        assert_eq!(fm2.size(), 256);
        let buf = fm2.read_vec(0, 256).unwrap();
        // Earliest pre-image wins
        assert!(buf.iter().all(|&b| b == 0xAA));
        assert!(fsutil::status(format!("{}.wal", path.display())).unwrap().is_none());
    }

    #[test]
    fn recovery_without_wal_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        {
            let fm = open_rw(&path, 0);
            fm.write(0, b"data").unwrap();
            fm.finish().unwrap();
        }
        let fm = FileMap::open(&path, true, false, false, false, false).unwrap();
        assert!(!fm.recover_wal().unwrap());
        assert_eq!(fm.read_vec(0, 4).unwrap(), b"data");
    }

    #[test]
    fn second_writer_cannot_lock_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        let _first = FileMap::open(&path, true, true, false, false, false).unwrap();
        let second = FileMap::open(&path, true, false, false, false, true);
        assert!(second.is_err());
    }
}
