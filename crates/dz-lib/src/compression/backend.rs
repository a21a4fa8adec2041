// ── ByteBackend: general-purpose byte compressors behind one trait ─────────

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use super::bytes::{write_u64, ByteReader};
use crate::cli::StreamBackend;
use crate::DzError;

/// Backend byte-level compressor (gzip, zstd).
///
/// Every field stream that is not range coded goes through one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ByteBackend {
    Gzip { level: u32 },
    Zstd { level: i32 },
}

pub(crate) trait ByteCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

impl ByteCompressor for ByteBackend {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            ByteBackend::Gzip { level } => compress_gzip(data, *level),
            ByteBackend::Zstd { level } => zstd::bulk::compress(data, *level)
                .map_err(|e| anyhow::anyhow!("Zstd compression failed: {}", e)),
        }
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            ByteBackend::Gzip { .. } => decompress_gzip(data),
            ByteBackend::Zstd { .. } => zstd::stream::decode_all(data)
                .map_err(|e| DzError::format(format!("Zstd decompression failed: {}", e))),
        }
    }
}

impl ByteBackend {
    pub(crate) fn from_config(backend: StreamBackend, level: i32) -> Self {
        match backend {
            StreamBackend::Gzip => ByteBackend::Gzip { level: level.clamp(0, 9) as u32 },
            StreamBackend::Zstd => ByteBackend::Zstd { level: level.clamp(1, 22) },
        }
    }

    /// Append `[u64 raw size]` and, when non-empty, `[u64 compressed size][bytes]`.
    pub(crate) fn write_stream(&self, out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
        write_u64(out, data.len() as u64);
        if data.is_empty() {
            return Ok(());
        }
        let compressed = self.compress(data)?;
        write_u64(out, compressed.len() as u64);
        out.extend_from_slice(&compressed);
        Ok(())
    }

    /// Inverse of [`ByteBackend::write_stream`].
    pub(crate) fn read_stream(&self, reader: &mut ByteReader<'_>) -> Result<Vec<u8>> {
        let raw_size = reader.read_u64()?;
        if raw_size == 0 {
            return Ok(Vec::new());
        }
        let compressed = reader.read_sized()?;
        let data = self.decompress(compressed)?;
        if data.len() as u64 != raw_size {
            return Err(DzError::format(format!(
                "stream size mismatch: expected {} bytes, got {}",
                raw_size,
                data.len()
            )));
        }
        Ok(data)
    }
}

pub(crate) fn compress_gzip(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    encoder.write_all(data)?;
    encoder.finish().context("gzip compression failed")
}

pub(crate) fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| DzError::format(format!("gzip decompression failed: {}", e)))?;
    Ok(out)
}
