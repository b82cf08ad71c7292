//! Write-ahead log file
//!
//! The WAL captures pre-images of bytes about to be overwritten inside
//! a transaction, so an abort — or a crash — can restore the guarded
//! region exactly as it was when the transaction began.
//!
//! ## File format (`<path>.wal`)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       3     magic "KW\n"
//! 3       8     logical size at transaction begin, big-endian
//! 11      ...   messages
//! ...     1     trailer 0x00
//! ```
//!
//! Each message is `0xEE | off (BE64) | size (BE64) | bytes`. A trailer
//! byte of zero follows the last message; appending the next message
//! overwrites it. Scanning therefore stops at the first byte that is
//! neither a message magic nor mid-stream.
//!
//! The first 256 KiB of the file are memory-mapped, so small
//! transactions never touch positional I/O; longer message streams
//! spill over into ordinary writes. On commit the prefix is zeroed
//! (which also invalidates the magic) and the file is truncated back to
//! the map size if it grew.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read};
use std::os::unix::fs::FileExt;
use std::path::Path;

use bytes::{BufMut, BytesMut};
use log::warn;
use memmap2::{MmapMut, MmapOptions};

use keywell_core::{Error, Result};

/// Magic bytes opening a live WAL file
pub const WAL_MAGIC: &[u8; 3] = b"KW\n";

/// Header length: magic plus the original logical size
pub const WAL_HEADER_SIZE: u64 = 11;

/// Length of the memory-mapped WAL prefix
pub const WAL_MAP_SIZE: u64 = 256 * 1024;

/// First byte of every message
pub const MSG_MAGIC: u8 = 0xEE;

/// A captured pre-image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalMessage {
    pub off: u64,
    pub data: Vec<u8>,
}

/// An open WAL file, reused across transactions on the same database
pub struct WalFile {
    file: File,
    map: MmapMut,
    /// End of valid content; 0 when no transaction is active
    size: u64,
    active: bool,
    hard: bool,
    /// Guarded region begin
    base: u64,
    /// Guarded region end: logical size at transaction begin
    trmsiz: u64,
}

impl WalFile {
    /// Opens (creating if needed) the WAL file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        if file.metadata()?.len() < WAL_MAP_SIZE {
            file.set_len(WAL_MAP_SIZE)?;
        }
        // SAFETY: the WAL is private to this database handle, which
        // serializes all access through the transaction mutex.
        let map = unsafe { MmapOptions::new().len(WAL_MAP_SIZE as usize).map_mut(&file)? };
        Ok(WalFile {
            file,
            map,
            size: 0,
            active: false,
            hard: false,
            base: 0,
            trmsiz: 0,
        })
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn hard(&self) -> bool {
        self.hard
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn trmsiz(&self) -> u64 {
        self.trmsiz
    }

    /// Original logical size recorded at transaction begin
    pub fn orig_lsiz(&self) -> u64 {
        self.trmsiz
    }

    /// Starts a transaction: writes the header and arms capture
    pub fn begin(&mut self, lsiz: u64, base: u64, hard: bool) -> Result<()> {
        if self.active {
            return Err(Error::Logic("transaction already active in WAL".to_string()));
        }
        let mut header = [0u8; WAL_HEADER_SIZE as usize + 1];
        header[..3].copy_from_slice(WAL_MAGIC);
        header[3..11].copy_from_slice(&lsiz.to_be_bytes());
        header[11] = 0; // trailer
        self.write_raw(0, &header)?;
        self.size = WAL_HEADER_SIZE;
        self.active = true;
        self.hard = hard;
        self.base = base;
        self.trmsiz = lsiz;
        if hard {
            self.sync()?;
        }
        Ok(())
    }

    /// Appends one pre-image message followed by a fresh trailer
    pub fn append(&mut self, off: u64, data: &[u8]) -> Result<()> {
        debug_assert!(self.active);
        let mut msg = BytesMut::with_capacity(17 + data.len() + 1);
        msg.put_u8(MSG_MAGIC);
        msg.put_u64(off);
        msg.put_u64(data.len() as u64);
        msg.put_slice(data);
        msg.put_u8(0); // trailer, overwritten by the next message
        self.write_raw(self.size, &msg)?;
        self.size += msg.len() as u64 - 1;
        Ok(())
    }

    /// Reads back every message of the active transaction
    pub fn messages(&mut self) -> Result<Vec<WalMessage>> {
        let mut buf = vec![0u8; (self.size - WAL_HEADER_SIZE) as usize];
        self.read_raw(WAL_HEADER_SIZE, &mut buf)?;
        parse_messages(&buf)
    }

    /// Ends the transaction: zeroes the used prefix and shrinks the
    /// file back to the map size if the stream spilled past it
    pub fn end(&mut self) -> Result<()> {
        let used = (self.size + 1).min(WAL_MAP_SIZE) as usize;
        self.map[..used].fill(0);
        if self.size + 1 > WAL_MAP_SIZE {
            self.file.set_len(WAL_MAP_SIZE)?;
        }
        if self.hard {
            self.sync()?;
        }
        self.size = 0;
        self.active = false;
        self.base = 0;
        self.trmsiz = 0;
        Ok(())
    }

    /// Flushes the map and the file to the platter
    pub fn sync(&self) -> Result<()> {
        self.map.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn write_raw(&mut self, off: u64, buf: &[u8]) -> Result<()> {
        let end = off + buf.len() as u64;
        if end <= WAL_MAP_SIZE {
            self.map[off as usize..end as usize].copy_from_slice(buf);
        } else if off < WAL_MAP_SIZE {
            let split = (WAL_MAP_SIZE - off) as usize;
            self.map[off as usize..].copy_from_slice(&buf[..split]);
            self.file.write_all_at(&buf[split..], WAL_MAP_SIZE)?;
        } else {
            self.file.write_all_at(buf, off)?;
        }
        Ok(())
    }

    fn read_raw(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        let end = off + buf.len() as u64;
        if end <= WAL_MAP_SIZE {
            buf.copy_from_slice(&self.map[off as usize..end as usize]);
        } else if off < WAL_MAP_SIZE {
            let split = (WAL_MAP_SIZE - off) as usize;
            buf[..split].copy_from_slice(&self.map[off as usize..]);
            self.file.read_exact_at(&mut buf[split..], WAL_MAP_SIZE)?;
        } else {
            self.file.read_exact_at(buf, off)?;
        }
        Ok(())
    }
}

/// Loads a WAL file for crash recovery
///
/// Returns `None` when the file does not hold a live transaction (no
/// magic — e.g. the prefix was zeroed by a clean commit). The message
/// scan is best-effort: a torn tail is dropped with a warning and the
/// intact prefix is still returned.
pub fn load(path: impl AsRef<Path>) -> Result<Option<(u64, Vec<WalMessage>)>> {
    let file = match File::open(path.as_ref()) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);

    let mut header = [0u8; WAL_HEADER_SIZE as usize];
    if reader.read_exact(&mut header).is_err() {
        return Ok(None);
    }
    if &header[..3] != WAL_MAGIC {
        return Ok(None);
    }
    let orig = u64::from_be_bytes(header[3..11].try_into().unwrap());

    let mut body = Vec::new();
    reader.read_to_end(&mut body)?;
    let messages = match parse_messages(&body) {
        Ok(msgs) => msgs,
        Err(e) => {
            warn!("WAL message stream damaged, replaying intact prefix: {}", e);
            parse_intact_prefix(&body)
        }
    };
    Ok(Some((orig, messages)))
}

fn parse_messages(buf: &[u8]) -> Result<Vec<WalMessage>> {
    let mut messages = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        match buf[pos] {
            0 => break,
            MSG_MAGIC => {
                if pos + 17 > buf.len() {
                    return Err(Error::Broken("truncated WAL message header".to_string()));
                }
                let off = u64::from_be_bytes(buf[pos + 1..pos + 9].try_into().unwrap());
                let size = u64::from_be_bytes(buf[pos + 9..pos + 17].try_into().unwrap()) as usize;
                let start = pos + 17;
                if start + size > buf.len() {
                    return Err(Error::Broken("truncated WAL message body".to_string()));
                }
                messages.push(WalMessage {
                    off,
                    data: buf[start..start + size].to_vec(),
                });
                pos = start + size;
            }
            other => {
                return Err(Error::Broken(format!("invalid WAL message magic {:#04x}", other)));
            }
        }
    }
    Ok(messages)
}

fn parse_intact_prefix(buf: &[u8]) -> Vec<WalMessage> {
    let mut messages = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() && buf[pos] == MSG_MAGIC && pos + 17 <= buf.len() {
        let off = u64::from_be_bytes(buf[pos + 1..pos + 9].try_into().unwrap());
        let size = u64::from_be_bytes(buf[pos + 9..pos + 17].try_into().unwrap()) as usize;
        let start = pos + 17;
        if start + size > buf.len() {
            break;
        }
        messages.push(WalMessage {
            off,
            data: buf[start..start + size].to_vec(),
        });
        pos = start + size;
    }
    messages
}
