//! Pluggable per-record compression
//!
//! When the compress option is set, every value is run through the
//! configured [`Compressor`] before it reaches the record codec, and
//! inflated again before a visitor sees it. The stored value length is
//! the compressed length; the engine never inspects the bytes.
//!
//! Two implementations ship with the crate: LZ4 (the default) and
//! Snappy. A database must always be reopened with the compressor it
//! was written with — the header only records *that* compression is on,
//! not which algorithm produced the bytes.

use keywell_core::{Error, Result};

/// Byte-buffer compression used for record values
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// LZ4 block compression with a length prefix
#[derive(Debug, Default)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(data, None, true)
            .map_err(|e| Error::System(format!("lz4 compression failed: {}", e)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None)
            .map_err(|e| Error::Broken(format!("lz4 decompression failed: {}", e)))
    }
}

/// Snappy raw-block compression
#[derive(Debug, Default)]
pub struct SnappyCompressor;

impl Compressor for SnappyCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| Error::System(format!("snappy compression failed: {}", e)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::Broken(format!("snappy decompression failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(c: &dyn Compressor, data: &[u8]) {
        let packed = c.compress(data).unwrap();
        let unpacked = c.decompress(&packed).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn lz4_roundtrip() {
        roundtrip(&Lz4Compressor, b"");
        roundtrip(&Lz4Compressor, b"x");
        roundtrip(&Lz4Compressor, &vec![7u8; 100_000]);
    }

    #[test]
    fn snappy_roundtrip() {
        roundtrip(&SnappyCompressor, b"");
        roundtrip(&SnappyCompressor, b"x");
        roundtrip(&SnappyCompressor, &vec![7u8; 100_000]);
    }

    #[test]
    fn lz4_shrinks_repetitive_data() {
        let data = vec![42u8; 64 * 1024];
        let packed = Lz4Compressor.compress(&data).unwrap();
        assert!(packed.len() < data.len() / 4);
    }

    #[test]
    fn decompress_rejects_garbage() {
        assert!(Lz4Compressor.decompress(&[0xff; 16]).is_err());
        assert!(SnappyCompressor.decompress(&[0xff; 16]).is_err());
    }
}
