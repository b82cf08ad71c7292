//! Database file header
//!
//! The first 64 bytes of every database file identify the format and
//! carry the geometry and live metadata:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       8     magic "KWHDB\n\0\0"
//! 8       1     library version
//! 9       1     format version
//! 10      1     module checksum (CRC32 of the option bytes, low byte)
//! 11      1     database type tag (0x10 = hash)
//! 12      1     alignment power apow
//! 13      1     free-pool power fpow
//! 14      1     options (bit0 small, bit1 linear, bit2 compress)
//! 15      1     status flags (bit0 open, bit1 fatal)
//! 16      8     bucket count, big-endian
//! 24      8     record count, big-endian
//! 32      8     logical file size, big-endian
//! 40      8     reserved (zero)
//! 48      16    opaque user data
//! ```
//!
//! The status byte is deliberately outside the transaction guard region
//! (which begins at the count field): the open flag must survive a WAL
//! rollback so a crashed writer is still detectable.

use crc32fast::Hasher;
use keywell_core::{Error, Result};

/// Magic bytes identifying a keywell hash database file
pub const MAGIC: &[u8; 8] = b"KWHDB\n\0\0";

/// Size of the header in bytes
pub const HEADER_SIZE: usize = 64;

/// Library version stamped into new files
pub const LIB_VERSION: u8 = 1;

/// On-disk format version
pub const FORMAT_VERSION: u8 = 1;

/// Type tag of the hash database
pub const TYPE_HASH: u8 = 0x10;

/// Status flag: a writer has the file open
pub const FLAG_OPEN: u8 = 1 << 0;

/// Status flag: a fatal error was observed; the image is unreliable
pub const FLAG_FATAL: u8 = 1 << 1;

/// File offset of the status flag byte
pub const FLAGS_OFF: u64 = 15;

/// File offset of the record count; transactions guard from here on
pub const META_OFF_COUNT: u64 = 24;

/// File offset of the logical size field
pub const META_OFF_LSIZ: u64 = 32;

/// File offset and size of the opaque user region
pub const OPAQUE_OFF: u64 = 48;
pub const OPAQUE_SIZE: usize = 16;

/// Parsed form of the 64-byte header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbHeader {
    pub libver: u8,
    pub fmtver: u8,
    pub chksum: u8,
    pub dbtype: u8,
    pub apow: u8,
    pub fpow: u8,
    pub opts: u8,
    pub flags: u8,
    pub bnum: u64,
    pub count: u64,
    pub lsiz: u64,
    pub opaque: [u8; OPAQUE_SIZE],
}

/// Computes the module checksum guarding the format-defining bytes
pub fn module_checksum(dbtype: u8, apow: u8, fpow: u8, opts: u8) -> u8 {
    let mut hasher = Hasher::new();
    hasher.update(&[dbtype, apow, fpow, opts, FORMAT_VERSION]);
    (hasher.finalize() & 0xff) as u8
}

impl DbHeader {
    /// Creates a header for a freshly initialized file
    pub fn new(apow: u8, fpow: u8, opts: u8, bnum: u64, lsiz: u64) -> Self {
        DbHeader {
            libver: LIB_VERSION,
            fmtver: FORMAT_VERSION,
            chksum: module_checksum(TYPE_HASH, apow, fpow, opts),
            dbtype: TYPE_HASH,
            apow,
            fpow,
            opts,
            flags: 0,
            bnum,
            count: 0,
            lsiz,
            opaque: [0; OPAQUE_SIZE],
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8] = self.libver;
        buf[9] = self.fmtver;
        buf[10] = self.chksum;
        buf[11] = self.dbtype;
        buf[12] = self.apow;
        buf[13] = self.fpow;
        buf[14] = self.opts;
        buf[15] = self.flags;
        buf[16..24].copy_from_slice(&self.bnum.to_be_bytes());
        buf[24..32].copy_from_slice(&self.count.to_be_bytes());
        buf[32..40].copy_from_slice(&self.lsiz.to_be_bytes());
        buf[48..64].copy_from_slice(&self.opaque);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Broken(format!(
                "file too small for a header: {} bytes",
                data.len()
            )));
        }
        if &data[0..8] != MAGIC {
            return Err(Error::Broken("invalid magic data".to_string()));
        }
        let mut opaque = [0u8; OPAQUE_SIZE];
        opaque.copy_from_slice(&data[48..64]);
        let header = DbHeader {
            libver: data[8],
            fmtver: data[9],
            chksum: data[10],
            dbtype: data[11],
            apow: data[12],
            fpow: data[13],
            opts: data[14],
            flags: data[15],
            bnum: u64::from_be_bytes(data[16..24].try_into().unwrap()),
            count: u64::from_be_bytes(data[24..32].try_into().unwrap()),
            lsiz: u64::from_be_bytes(data[32..40].try_into().unwrap()),
            opaque,
        };
        header.validate()?;
        Ok(header)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dbtype != TYPE_HASH {
            return Err(Error::Invalid(format!(
                "database type mismatch: {:#04x}",
                self.dbtype
            )));
        }
        if self.fmtver != FORMAT_VERSION {
            return Err(Error::Invalid(format!(
                "unsupported format version {}",
                self.fmtver
            )));
        }
        if self.chksum != module_checksum(self.dbtype, self.apow, self.fpow, self.opts) {
            return Err(Error::Invalid("module checksum mismatch".to_string()));
        }
        if self.apow > 15 {
            return Err(Error::Broken(format!("alignment power out of range: {}", self.apow)));
        }
        if self.fpow > 20 {
            return Err(Error::Broken(format!("free-pool power out of range: {}", self.fpow)));
        }
        if self.bnum < 1 {
            return Err(Error::Broken("bucket count must be positive".to_string()));
        }
        Ok(())
    }
}
