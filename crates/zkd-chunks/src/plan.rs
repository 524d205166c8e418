//! Size-tiered chunk planning
//!
//! Smaller objects get smaller chunks, very large objects get larger ones,
//! bounding both per-chunk memory and total chunk count.

use serde::{Deserialize, Serialize};
use zkd_core::config::ChunkingConfig;
use zkd_core::types::MAX_CHUNK_BYTES;

/// Plaintext byte span covered by one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpan {
    pub index: u64,
    pub offset: u64,
    pub len: u64,
}

impl ChunkSpan {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Target chunk size for an object of `total_size` bytes.
pub fn chunk_size_for(total_size: u64, cfg: &ChunkingConfig) -> u64 {
    let size = if total_size >= cfg.large_threshold_bytes {
        cfg.large_chunk_bytes
    } else if total_size >= cfg.medium_threshold_bytes {
        cfg.medium_chunk_bytes
    } else {
        cfg.small_chunk_bytes
    };
    size.clamp(1, MAX_CHUNK_BYTES)
}

/// Split `[0, total_size)` into contiguous spans.
///
/// An empty object still gets one zero-length chunk so that every object
/// has at least one ciphertext (and one authentication tag) to verify.
pub fn plan_chunks(total_size: u64, cfg: &ChunkingConfig) -> Vec<ChunkSpan> {
    if total_size == 0 {
        return vec![ChunkSpan {
            index: 0,
            offset: 0,
            len: 0,
        }];
    }

    let chunk = chunk_size_for(total_size, cfg);
    let count = total_size.div_ceil(chunk);
    (0..count)
        .map(|index| {
            let offset = index * chunk;
            ChunkSpan {
                index,
                offset,
                len: chunk.min(total_size - offset),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn ten_mib_makes_three_chunks() {
        let spans = plan_chunks(10 * MIB, &ChunkingConfig::default());
        let lens: Vec<u64> = spans.iter().map(|s| s.len).collect();
        assert_eq!(lens, vec![4 * MIB, 4 * MIB, 2 * MIB]);
    }

    #[test]
    fn tiers_scale_with_size() {
        let cfg = ChunkingConfig::default();
        assert_eq!(chunk_size_for(100 * MIB, &cfg), 4 * MIB);
        assert_eq!(chunk_size_for(256 * MIB, &cfg), 6 * MIB);
        assert_eq!(chunk_size_for(3000 * MIB, &cfg), 8 * MIB);
    }

    #[test]
    fn empty_object_has_one_chunk() {
        let spans = plan_chunks(0, &ChunkingConfig::default());
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].len, 0);
    }

    #[test]
    fn exact_multiple_has_no_tail() {
        let spans = plan_chunks(8 * MIB, &ChunkingConfig::default());
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].end(), 8 * MIB);
    }

    #[test]
    fn configured_size_is_capped() {
        let cfg = ChunkingConfig {
            small_chunk_bytes: u64::MAX,
            ..ChunkingConfig::default()
        };
        assert_eq!(chunk_size_for(MIB, &cfg), MAX_CHUNK_BYTES);
    }

    proptest! {
        #[test]
        fn spans_cover_object_exactly(size in 1u64..50_000_000, small in 1u64..5_000_000) {
            let cfg = ChunkingConfig { small_chunk_bytes: small, ..ChunkingConfig::default() };
            let spans = plan_chunks(size, &cfg);
            let mut expected_offset = 0;
            for (i, span) in spans.iter().enumerate() {
                prop_assert_eq!(span.index, i as u64);
                prop_assert_eq!(span.offset, expected_offset);
                prop_assert!(span.len > 0);
                expected_offset = span.end();
            }
            prop_assert_eq!(expected_offset, size);
        }
    }
}
