//! Content-defined and fixed-size chunking

use serde::{Deserialize, Serialize};

/// Chunking parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Target chunk size in bytes
    pub target_chunk_size: usize,
    /// Minimum chunk size
    pub min_chunk_size: usize,
    /// Maximum chunk size
    pub max_chunk_size: usize,
    /// Sliding window width for the rolling hash
    pub window_size: usize,
    /// Polynomial prime for the rolling hash
    pub prime: u64,
    /// Modulus for hash operations
    pub modulus: u64,
    /// Boundary mask: a boundary is declared where the low mask bits of
    /// the fingerprint are zero
    pub mask: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_chunk_size: 64 * 1024,
            min_chunk_size: 16 * 1024,
            max_chunk_size: 256 * 1024,
            window_size: 48,
            prime: 3,
            modulus: (1 << 16) - 1,
            mask: 0x1FFF,
        }
    }
}

/// Rabin fingerprint-based content-defined chunker.
///
/// Boundaries depend only on content, so an insertion early in a stream
/// shifts at most one chunk instead of re-cutting everything after it.
pub struct RabinChunker {
    config: ChunkingConfig,
    /// prime^(window_size-1) mod modulus, for removing the byte that
    /// leaves the window
    prime_power: u64,
}

impl RabinChunker {
    pub fn new(config: ChunkingConfig) -> Self {
        let mut prime_power = 1u64;
        for _ in 0..config.window_size.saturating_sub(1) {
            prime_power = (prime_power * config.prime) % config.modulus;
        }
        Self {
            config,
            prime_power,
        }
    }

    /// Split data into content-defined chunks as (offset, bytes) pairs.
    pub fn chunk<'a>(&self, data: &'a [u8]) -> Vec<(usize, &'a [u8])> {
        let mut chunks = Vec::new();
        let mut offset = 0;
        let data_len = data.len();

        while offset < data_len {
            let chunk_start = offset;
            let span_end = (offset + self.config.max_chunk_size).min(data_len);
            let mut chunk_end = (offset + self.config.target_chunk_size).min(span_end);

            if offset + self.config.min_chunk_size < data_len {
                // A content boundary wins wherever it lands in [min, max];
                // without one the cut falls back to the target size, so
                // low-entropy streams still line up for deduplication.
                let boundary =
                    self.find_boundary(&data[offset..span_end], self.config.min_chunk_size);
                if boundary > 0 {
                    chunk_end = offset + boundary;
                }
            }

            chunks.push((chunk_start, &data[chunk_start..chunk_end]));
            offset = chunk_end;
        }

        chunks
    }

    /// First offset past `min_size` where the masked fingerprint is zero,
    /// or 0 when no boundary exists in this span.
    fn find_boundary(&self, data: &[u8], min_size: usize) -> usize {
        let window_size = self.config.window_size;
        if data.len() < min_size || data.len() < window_size {
            return 0;
        }

        let mut hash: u64 = 0;
        for &byte in &data[..window_size] {
            hash = (hash * self.config.prime + byte as u64) % self.config.modulus;
        }

        for i in window_size..data.len() {
            if i >= min_size && hash & self.config.mask == 0 {
                return i;
            }

            let old_byte = data[i - window_size] as u64;
            let new_byte = data[i] as u64;

            // Remove the outgoing byte, shift, add the incoming one. The
            // subtraction is kept positive under the modulus.
            let without_old =
                (hash + self.config.modulus * 256 - (old_byte * self.prime_power) % self.config.modulus)
                    % self.config.modulus;
            hash = (without_old * self.config.prime + new_byte) % self.config.modulus;
        }

        0
    }
}

/// Fixed-size chunking fallback: equal spans of the target size.
pub struct FixedChunker {
    chunk_size: usize,
}

impl FixedChunker {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    pub fn chunk<'a>(&self, data: &'a [u8]) -> Vec<(usize, &'a [u8])> {
        data.chunks(self.chunk_size)
            .enumerate()
            .map(|(index, chunk)| (index * self.chunk_size, chunk))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(chunks: &[(usize, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (_, chunk) in chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    #[test]
    fn test_empty_input() {
        let chunker = RabinChunker::new(ChunkingConfig::default());
        assert!(chunker.chunk(&[]).is_empty());
    }

    #[test]
    fn test_chunks_cover_input_exactly() {
        let chunker = RabinChunker::new(ChunkingConfig::default());
        let data: Vec<u8> = (0..1_000_000u32).map(|i| (i * 31 % 251) as u8).collect();

        let chunks = chunker.chunk(&data);
        assert_eq!(reassemble(&chunks), data);

        // Offsets are contiguous.
        let mut expected_offset = 0;
        for (offset, chunk) in &chunks {
            assert_eq!(*offset, expected_offset);
            expected_offset += chunk.len();
        }
    }

    #[test]
    fn test_chunk_size_bounds() {
        let config = ChunkingConfig::default();
        let chunker = RabinChunker::new(config.clone());
        let data: Vec<u8> = (0..800_000u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();

        let chunks = chunker.chunk(&data);
        assert!(chunks.len() > 1);

        for (index, (_, chunk)) in chunks.iter().enumerate() {
            assert!(chunk.len() <= config.max_chunk_size);
            // Every chunk except the last respects the minimum.
            if index + 1 < chunks.len() {
                assert!(chunk.len() >= config.min_chunk_size);
            }
        }
    }

    #[test]
    fn test_boundaries_are_content_defined() {
        let chunker = RabinChunker::new(ChunkingConfig::default());
        let data: Vec<u8> = (0..600_000u32).map(|i| (i.wrapping_mul(40503) >> 8) as u8).collect();

        let original: Vec<usize> = chunker.chunk(&data).iter().map(|(_, c)| c.len()).collect();

        // Prepend a block; the tail of the chunking should realign.
        let mut shifted = vec![0xAAu8; 100_000];
        shifted.extend_from_slice(&data);
        let shifted_chunks: Vec<usize> =
            chunker.chunk(&shifted).iter().map(|(_, c)| c.len()).collect();

        // The final chunks agree once the cut points resynchronize.
        assert_eq!(
            original.last().unwrap(),
            shifted_chunks.last().unwrap()
        );
    }

    #[test]
    fn test_repeated_content_yields_repeated_chunks() {
        let chunker = RabinChunker::new(ChunkingConfig::default());
        let block: Vec<u8> = (0..200_000u32).map(|i| (i.wrapping_mul(7919) >> 4) as u8).collect();
        let mut doubled = block.clone();
        doubled.extend_from_slice(&block);

        let chunks = chunker.chunk(&doubled);
        let lens: Vec<usize> = chunks.iter().map(|(_, c)| c.len()).collect();

        // Both halves contain identical interior cut patterns, so at
        // least one chunk length repeats.
        let repeats = lens
            .iter()
            .filter(|len| lens.iter().filter(|other| other == len).count() > 1)
            .count();
        assert!(repeats > 0);
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(16))]

        /// Chunking any byte sequence covers it exactly and respects
        /// the size bounds on every non-final chunk.
        #[test]
        fn prop_chunking_partitions_input(data in proptest::collection::vec(0u8.., 0..400_000usize)) {
            let config = ChunkingConfig::default();
            let chunker = RabinChunker::new(config.clone());
            let chunks = chunker.chunk(&data);

            proptest::prop_assert_eq!(reassemble(&chunks), data.as_slice());
            for (index, (_, chunk)) in chunks.iter().enumerate() {
                proptest::prop_assert!(chunk.len() <= config.max_chunk_size);
                if index + 1 < chunks.len() {
                    proptest::prop_assert!(chunk.len() >= config.min_chunk_size);
                }
            }
        }
    }

    #[test]
    fn test_fixed_chunker_spans() {
        let chunker = FixedChunker::new(1024);
        let data = vec![7u8; 2500];
        let chunks = chunker.chunk(&data);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].0, 0);
        assert_eq!(chunks[1].0, 1024);
        assert_eq!(chunks[2].0, 2048);
        assert_eq!(chunks[2].1.len(), 452);
        assert_eq!(reassemble(&chunks), data);
    }
}
