//! Snapshot payload compression
//!
//! Supports zstd, gzip and lz4 with automatic selection: zstd is
//! preferred, and a result is only kept when it saves at least 10 %
//! over the raw payload.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

/// Compression errors
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("Compression failed: {0}")]
    CompressFailed(String),

    #[error("Decompression failed: {0}")]
    DecompressFailed(String),
}

/// Result type for compression operations
pub type CompressionResult<T> = Result<T, CompressionError>;

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Zstd,
    Gzip,
    Lz4,
    None,
}

/// Minimum saving required before a compressed payload is kept.
const MIN_SAVING_RATIO: f64 = 0.10;

/// Compress with a specific algorithm.
pub fn compress(data: &[u8], algorithm: CompressionAlgorithm) -> CompressionResult<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::Zstd => zstd::encode_all(data, 3)
            .map_err(|e| CompressionError::CompressFailed(e.to_string())),
        CompressionAlgorithm::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| CompressionError::CompressFailed(e.to_string()))
        }
        CompressionAlgorithm::Lz4 => lz4::block::compress(data, None, true)
            .map_err(|e| CompressionError::CompressFailed(e.to_string())),
        CompressionAlgorithm::None => Ok(data.to_vec()),
    }
}

/// Decompress with a specific algorithm.
pub fn decompress(data: &[u8], algorithm: CompressionAlgorithm) -> CompressionResult<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::Zstd => zstd::decode_all(data)
            .map_err(|e| CompressionError::DecompressFailed(e.to_string())),
        CompressionAlgorithm::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| CompressionError::DecompressFailed(e.to_string()))?;
            Ok(out)
        }
        CompressionAlgorithm::Lz4 => lz4::block::decompress(data, None)
            .map_err(|e| CompressionError::DecompressFailed(e.to_string())),
        CompressionAlgorithm::None => Ok(data.to_vec()),
    }
}

/// Compress with automatic algorithm selection.
///
/// Prefers zstd; falls back to gzip if zstd fails. Returns the raw
/// payload tagged `None` when compression saves less than 10 %.
pub fn auto_compress(data: &[u8]) -> (CompressionAlgorithm, Vec<u8>) {
    let candidate = match compress(data, CompressionAlgorithm::Zstd) {
        Ok(compressed) => Some((CompressionAlgorithm::Zstd, compressed)),
        Err(_) => compress(data, CompressionAlgorithm::Gzip)
            .ok()
            .map(|compressed| (CompressionAlgorithm::Gzip, compressed)),
    };

    if let Some((algorithm, compressed)) = candidate {
        let saving = 1.0 - compressed.len() as f64 / data.len().max(1) as f64;
        if saving >= MIN_SAVING_RATIO {
            return (algorithm, compressed);
        }
    }

    (CompressionAlgorithm::None, data.to_vec())
}
