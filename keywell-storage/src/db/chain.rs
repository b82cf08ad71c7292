//! Chain engine: the binary tree hanging off each bucket
//!
//! Records that hash to the same bucket form a binary search tree whose
//! pointers are W-byte offsets embedded in the record headers. The tree
//! is keyed by (folded hash, key) — the folded hash compares first, key
//! length/bytes break ties — so an in-order walk yields strictly
//! increasing pairs. In linear mode the right pointer does not exist
//! and every mismatch follows the single link, degenerating the tree
//! into a list.
//!
//! A lookup remembers the *entry offset*: the file offset of the W-byte
//! pointer that led to the current node (or none, for the bucket slot
//! itself). That is all a mutation needs to splice the chain — records
//! never store parent pointers.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::Ordering;

use keywell_core::{Error, Result};

use crate::codec::{self, hash, Record};

use super::HashDB;

/// A decoded region of the record area
pub(crate) enum Region {
    Record(Record),
    Free { rsiz: u64 },
}

fn amend(e: Error, off: u64) -> Error {
    match e {
        Error::Broken(msg) => Error::Broken(format!("{} (offset {})", msg, off)),
        other => other,
    }
}

impl HashDB {
    /// Decodes the region starting at `off`
    ///
    /// Uses a single bounded read for the header and, for records whose
    /// key (and often value) fits the read-ahead window, the body too;
    /// otherwise the key is fetched with a second read.
    pub(crate) fn read_region(&self, off: u64) -> Result<Region> {
        let lsiz = self.file.size();
        if off < self.roff || off + 2 > lsiz {
            return Err(Error::Broken(format!("region offset {} out of bounds", off)));
        }
        let n = codec::READ_AHEAD.min((lsiz - off) as usize);
        let buf = self.file.read_vec(off, n)?;
        let parsed = codec::parse(&self.lay, &buf).map_err(|e| amend(e, off))?;
        let rsiz = parsed.rsiz();
        if off + rsiz > lsiz {
            return Err(Error::Broken(format!(
                "region at {} overruns the logical size",
                off
            )));
        }
        match parsed {
            codec::Parsed::Free { rsiz } => Ok(Region::Free { rsiz }),
            codec::Parsed::Record {
                psiz,
                left,
                right,
                ksiz,
                vsiz,
                hsiz,
            } => {
                let boff = off + hsiz as u64;
                let mut rec = Record {
                    off,
                    rsiz,
                    psiz,
                    left,
                    right,
                    ksiz,
                    vsiz,
                    boff,
                    key: Vec::new(),
                    value: None,
                };
                if hsiz + ksiz <= n {
                    rec.key = buf[hsiz..hsiz + ksiz].to_vec();
                    if hsiz + ksiz + vsiz <= n {
                        rec.value = Some(buf[hsiz + ksiz..hsiz + ksiz + vsiz].to_vec());
                    }
                } else {
                    rec.key = self.file.read_vec(boff, ksiz)?;
                }
                Ok(Region::Record(rec))
            }
        }
    }

    fn read_chain_record(&self, off: u64) -> Result<Record> {
        match self.read_region(off)? {
            Region::Record(rec) => Ok(rec),
            Region::Free { .. } => Err(Error::Broken(format!(
                "free block linked in a chain at offset {}",
                off
            ))),
        }
    }

    /// Loads the (still raw) value bytes of `rec` if not yet present
    pub(crate) fn read_record_value(&self, rec: &mut Record) -> Result<()> {
        if rec.value.is_none() {
            rec.value = Some(self.file.read_vec(rec.boff + rec.ksiz as u64, rec.vsiz)?);
        }
        Ok(())
    }

    /// Walks the chain of bucket `bidx` for `key`
    ///
    /// Returns the record on a hit, plus the entry offset of the
    /// pointer that led to it. On a miss the entry offset names the
    /// unused slot where a new leaf belongs (`None` = the bucket slot).
    pub(crate) fn search_chain(
        &self,
        bidx: u64,
        fh: u32,
        key: &[u8],
    ) -> Result<(Option<Record>, Option<u64>)> {
        let mut off = self.buckets.get(&self.file, bidx)?;
        let mut entoff = None;
        while off != 0 {
            let rec = self.read_chain_record(off)?;
            let rfh = hash::fold(hash::hash(&rec.key));
            let cmp = fh
                .cmp(&rfh)
                .then_with(|| codec::compare_keys(key, &rec.key));
            match cmp {
                CmpOrdering::Equal => return Ok((Some(rec), entoff)),
                CmpOrdering::Less if !self.lay.linear => {
                    entoff = Some(off + 2);
                    off = rec.left;
                }
                _ => {
                    if self.lay.linear {
                        entoff = Some(off + 2);
                        off = rec.left;
                    } else {
                        entoff = Some(off + 2 + self.lay.width as u64);
                        off = rec.right;
                    }
                }
            }
        }
        Ok((None, entoff))
    }

    /// Takes a sufficient extent from the pool, or reserves fresh space
    /// at the file tail
    fn allocate(&self, rsiz: u64) -> (u64, u64) {
        if let Some(fb) = self.fbp.lock().fetch(rsiz) {
            (fb.off, fb.rsiz)
        } else {
            (self.file.expand(rsiz), rsiz)
        }
    }

    /// Writes a record into an extent of `avail` bytes at `off`,
    /// splitting an oversized padding tail off as a free block
    pub(crate) fn write_record_at(
        &self,
        off: u64,
        avail: u64,
        left: u64,
        right: u64,
        key: &[u8],
        raw: &[u8],
    ) -> Result<()> {
        let (base, _) = self.lay.calc_sizes(key.len(), raw.len());
        if avail < base {
            return Err(Error::Logic(format!(
                "record of {} bytes placed in a {}-byte extent",
                base, avail
            )));
        }
        let mut rsiz = avail;
        let mut psiz = avail - base;
        if psiz > codec::MAX_PSIZ as u64 || psiz > rsiz / 2 {
            let tail = self.lay.align_down(psiz);
            if tail >= self.lay.min_record_size() {
                rsiz -= tail;
                psiz -= tail;
                self.free_region(off + rsiz, tail)?;
                self.frgcnt.fetch_add(1, Ordering::Relaxed);
            }
        }
        if psiz > codec::MAX_PSIZ as u64 {
            return Err(Error::Logic(format!("unsplittable padding of {} bytes", psiz)));
        }
        let mut out = Vec::with_capacity(rsiz as usize);
        codec::encode_record(&self.lay, psiz as u16, left, right, key, raw, &mut out)?;
        debug_assert_eq!(out.len() as u64, rsiz);
        self.file.write(off, &out)
    }

    /// Rewrites the pointer that owns a chain position
    pub(crate) fn link_parent(&self, entoff: Option<u64>, bidx: u64, child: u64) -> Result<()> {
        match entoff {
            Some(eo) => self.write_child(eo, child),
            None => self.buckets.set(&self.file, bidx, child),
        }
    }

    fn write_child(&self, entoff: u64, child: u64) -> Result<()> {
        let mut buf = [0u8; 6];
        self.lay.write_off(child, &mut buf)?;
        self.file.write(entoff, &buf[..self.lay.width as usize])
    }

    /// Stamps a free block over an extent and offers it to the pool
    pub(crate) fn free_region(&self, off: u64, rsiz: u64) -> Result<()> {
        let mut out = Vec::with_capacity(self.lay.free_block_size() as usize);
        codec::encode_free(&self.lay, rsiz, &mut out)?;
        self.file.write(off, &out)?;
        self.fbp.lock().insert(off, rsiz);
        Ok(())
    }

    /// Inserts a new leaf at the slot a failed lookup reported
    pub(crate) fn insert_record(
        &self,
        bidx: u64,
        entoff: Option<u64>,
        key: &[u8],
        raw: &[u8],
    ) -> Result<()> {
        let (_, rsiz) = self.lay.calc_sizes(key.len(), raw.len());
        let (off, avail) = self.allocate(rsiz);
        self.write_record_at(off, avail, 0, 0, key, raw)?;
        self.link_parent(entoff, bidx, off)?;
        self.count.fetch_add(1, Ordering::AcqRel);
        self.dump_meta()
    }

    /// Unlinks `rec` from its chain and releases its extent
    ///
    /// The two-children case promotes the rightmost descendant of the
    /// left child: that node has no right child of its own, so it can
    /// adopt both of the victim's subtrees by header rewrites alone —
    /// no record bytes move.
    pub(crate) fn remove_record(
        &self,
        rec: &Record,
        entoff: Option<u64>,
        bidx: u64,
    ) -> Result<()> {
        let child;
        if self.lay.linear {
            child = rec.left;
        } else if rec.left != 0 && rec.right != 0 {
            let mut m_off = rec.left;
            let mut m = self.read_chain_record(m_off)?;
            let mut parent_right: Option<u64> = None;
            while m.right != 0 {
                parent_right = Some(m_off + 2 + self.lay.width as u64);
                m_off = m.right;
                m = self.read_chain_record(m_off)?;
            }
            if let Some(pe) = parent_right {
                // Detach the replacement, then graft the victim's left
                // subtree under it
                self.write_child(pe, m.left)?;
                self.write_child(m_off + 2, rec.left)?;
            }
            self.write_child(m_off + 2 + self.lay.width as u64, rec.right)?;
            child = m_off;
        } else if rec.left != 0 {
            child = rec.left;
        } else {
            child = rec.right;
        }
        self.link_parent(entoff, bidx, child)?;
        self.free_region(rec.off, rec.rsiz)?;
        self.count.fetch_sub(1, Ordering::AcqRel);
        self.frgcnt.fetch_add(1, Ordering::Relaxed);
        self.dump_meta()
    }

    /// Rewrites the value of `rec`, in place when it fits, otherwise
    /// relocating the record and retargeting its parent pointer
    pub(crate) fn replace_record(
        &self,
        rec: Record,
        entoff: Option<u64>,
        bidx: u64,
        key: &[u8],
        raw: &[u8],
    ) -> Result<()> {
        let (base, rsiz) = self.lay.calc_sizes(key.len(), raw.len());
        if base <= rec.rsiz {
            self.write_record_at(rec.off, rec.rsiz, rec.left, rec.right, key, raw)?;
        } else {
            let (noff, avail) = self.allocate(rsiz);
            self.write_record_at(noff, avail, rec.left, rec.right, key, raw)?;
            self.link_parent(entoff, bidx, noff)?;
            self.free_region(rec.off, rec.rsiz)?;
            self.frgcnt.fetch_add(1, Ordering::Relaxed);
        }
        self.dump_meta()
    }
}
