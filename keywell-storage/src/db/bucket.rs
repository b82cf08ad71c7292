//! Bucket array
//!
//! A fixed run of `bnum` W-byte slots following the free-pool dump
//! area. Slot `i` holds the root offset of bucket `i`'s chain, shifted
//! right by `apow`; zero means the bucket is empty. The slots are
//! expected to sit inside the mapped prefix on hot paths, but every
//! access goes through the file substrate so an undersized map still
//! works.

use keywell_core::Result;

use crate::codec::Layout;
use crate::file::FileMap;

#[derive(Debug, Clone, Copy)]
pub(crate) struct BucketArray {
    boff: u64,
    bnum: u64,
    lay: Layout,
}

impl BucketArray {
    pub fn new(boff: u64, bnum: u64, lay: Layout) -> Self {
        BucketArray { boff, bnum, lay }
    }

    pub fn bnum(&self) -> u64 {
        self.bnum
    }

    /// Byte length of the whole array
    pub fn byte_size(&self) -> u64 {
        self.bnum * self.lay.width as u64
    }

    fn slot_off(&self, idx: u64) -> u64 {
        debug_assert!(idx < self.bnum);
        self.boff + idx * self.lay.width as u64
    }

    /// Root offset of bucket `idx`, or 0 when empty
    pub fn get(&self, file: &FileMap, idx: u64) -> Result<u64> {
        let mut buf = [0u8; 6];
        let w = self.lay.width as usize;
        file.read_into(self.slot_off(idx), &mut buf[..w])?;
        Ok(self.lay.read_off(&buf))
    }

    pub fn set(&self, file: &FileMap, idx: u64, off: u64) -> Result<()> {
        let mut buf = [0u8; 6];
        self.lay.write_off(off, &mut buf)?;
        let w = self.lay.width as usize;
        file.write(self.slot_off(idx), &buf[..w])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn slots_are_independent_and_default_to_empty() {
        let dir = TempDir::new().unwrap();
        let mut file = FileMap::open(dir.path().join("b"), true, true, false, false, false).unwrap();
        file.map_prefix(1 << 16).unwrap();
        file.truncate(4096).unwrap();

        let lay = Layout::new(3, false, false);
        let buckets = BucketArray::new(64, 16, lay);

        for i in 0..16 {
            assert_eq!(buckets.get(&file, i).unwrap(), 0);
        }

        buckets.set(&file, 3, 512).unwrap();
        buckets.set(&file, 4, 1024).unwrap();
        assert_eq!(buckets.get(&file, 3).unwrap(), 512);
        assert_eq!(buckets.get(&file, 4).unwrap(), 1024);
        assert_eq!(buckets.get(&file, 2).unwrap(), 0);
        assert_eq!(buckets.get(&file, 5).unwrap(), 0);
    }
}
