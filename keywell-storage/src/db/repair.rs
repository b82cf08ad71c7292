//! Crash repair
//!
//! A writer that opens a file whose header still carries the open flag
//! (or the sticky fatal flag) and finds no WAL to replay cannot trust
//! the chain structure: a mutation may have been torn mid-write. The
//! record region itself is append-ordered and self-describing, so the
//! salvage path walks it tolerantly, re-inserts every intact record
//! into a fresh database built with the same geometry, and atomically
//! renames the rebuild over the original. The scan stops at the first
//! region that no longer parses; everything behind it is lost.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};

use keywell_core::Result;

use crate::codec::{self, header::DbHeader, Layout};
use crate::compress::{Compressor, Lz4Compressor};
use crate::file::FileMap;
use crate::fsutil;

use super::{mode, Builder, HashDB, OPT_COMPRESS, OPT_LINEAR, OPT_SMALL};

/// Rebuilds the database at `path` from the record region of `file`
///
/// `file` is the locked, unmapped handle of the damaged database; its
/// header has already been decoded into `hdr`.
pub(crate) fn rebuild(
    path: &Path,
    file: &FileMap,
    hdr: &DbHeader,
    compressor: Option<Arc<dyn Compressor>>,
) -> Result<()> {
    let lay = Layout::new(hdr.apow, hdr.opts & OPT_SMALL != 0, hdr.opts & OPT_LINEAR != 0);
    let fbp_area = if hdr.fpow > 0 { 2 * lay.width as u64 + 2 } else { 0 };
    let roff = lay.align_up(64 + fbp_area + hdr.bnum * lay.width as u64);

    let unpack: Arc<dyn Compressor> = if hdr.opts & OPT_COMPRESS != 0 {
        compressor.clone().unwrap_or_else(|| Arc::new(Lz4Compressor))
    } else {
        Arc::new(NoUnpack)
    };

    let tmp_path = PathBuf::from(format!("{}.kwtmp", path.display()));
    let mut builder = Builder::new()
        .alignment_power(hdr.apow)
        .free_pool_power(hdr.fpow)
        .buckets(hdr.bnum)
        .options(hdr.opts);
    if let Some(c) = compressor {
        builder = builder.compressor(c);
    }
    let tmp = builder.open(&tmp_path, mode::WRITER | mode::CREATE | mode::TRUNCATE)?;

    let end = file.physical_size();
    let mut off = roff;
    let mut salvaged = 0u64;
    let mut dropped = 0u64;
    while off < end {
        let n = codec::READ_AHEAD.min((end - off) as usize);
        let Ok(buf) = file.read_vec(off, n) else { break };
        let parsed = match codec::parse(&lay, &buf) {
            Ok(p) => p,
            Err(e) => {
                warn!("salvage stops at offset {}: {}", off, e);
                break;
            }
        };
        let rsiz = parsed.rsiz();
        if rsiz == 0 || off + rsiz > end {
            warn!("salvage stops at offset {}: region overruns the file", off);
            break;
        }
        if let codec::Parsed::Record {
            ksiz, vsiz, hsiz, ..
        } = parsed
        {
            let boff = off + hsiz as u64;
            match salvage_record(file, &*unpack, boff, ksiz, vsiz, &tmp) {
                Ok(()) => salvaged += 1,
                Err(e) => {
                    dropped += 1;
                    warn!("record at offset {} dropped during salvage: {}", off, e);
                }
            }
        }
        off += rsiz;
    }

    tmp.close()?;
    std::fs::rename(&tmp_path, path)?;
    if fsutil::status(file.wal_path())?.is_some() {
        fsutil::remove_file(file.wal_path())?;
    }
    info!(
        "rebuilt {}: {} records salvaged, {} dropped",
        path.display(),
        salvaged,
        dropped
    );
    Ok(())
}

/// Identity pass-through used when compression is off
struct NoUnpack;

impl Compressor for NoUnpack {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

fn salvage_record(
    file: &FileMap,
    unpacker: &dyn Compressor,
    boff: u64,
    ksiz: usize,
    vsiz: usize,
    tmp: &HashDB,
) -> Result<()> {
    let key = file.read_vec(boff, ksiz)?;
    let raw = file.read_vec(boff + ksiz as u64, vsiz)?;
    let value = unpacker.decompress(&raw)?;
    tmp.set(&key, &value)
}
