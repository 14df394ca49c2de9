//! Content-defined chunking with a rolling hash
//!
//! Chunk boundaries are declared purely from the trailing window of bytes,
//! so identical content produces identical cuts no matter what precedes it.
//! That is the deduplication guarantee the storage layer relies on: two
//! files sharing a suffix converge on the same chunk sequence after the
//! first shared boundary.

use crate::error::CoreError;
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};

/// Width of the rolling-hash window in bytes
const WINDOW: usize = 64;

/// Seed for the byte substitution table; fixed so cuts are stable across
/// builds and hosts
const TABLE_SEED: u64 = 0x2f7e_9a41_c85d_3b06;

/// A contiguous byte range of the uncompressed source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// Byte offset into the source
    pub offset: u64,
    /// Length in bytes
    pub size: u64,
}

/// A content-addressed piece of a file. Offset and size refer to the
/// uncompressed source range; identity is the hash alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    /// Digest of the stored (compressed) chunk bytes
    pub hash: ContentHash,
    /// Byte offset into the uncompressed source
    pub offset: u64,
    /// Uncompressed length in bytes
    pub size: u64,
}

/// Chunker size bounds. Every produced span satisfies
/// `min_size <= size <= max_size` except a possibly shorter final span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Minimum chunk size in bytes
    pub min_size: u64,
    /// Target average chunk size in bytes; must be a power of two
    pub avg_size: u64,
    /// Maximum chunk size in bytes; forced cut
    pub max_size: u64,
}

impl ChunkerConfig {
    /// Check the size constraints: nonzero, min <= avg <= max, avg a power
    /// of two, min at least the rolling window width
    pub fn validate(&self) -> Result<(), CoreError> {
        let bounds = |reason| CoreError::ChunkerBounds {
            min: self.min_size,
            avg: self.avg_size,
            max: self.max_size,
            reason,
        };
        if self.min_size == 0 || self.avg_size == 0 || self.max_size == 0 {
            return Err(bounds("sizes must be nonzero"));
        }
        if self.min_size > self.avg_size || self.avg_size > self.max_size {
            return Err(bounds("requires min <= avg <= max"));
        }
        if !self.avg_size.is_power_of_two() {
            return Err(bounds("avg must be a power of two"));
        }
        if self.min_size < WINDOW as u64 {
            return Err(bounds("min smaller than the rolling window"));
        }
        Ok(())
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: 4 * 1024 * 1024,
            avg_size: 8 * 1024 * 1024,
            max_size: 16 * 1024 * 1024,
        }
    }
}

/// Content-defined chunker. Construction validates the configuration and
/// derives the substitution table.
pub struct Chunker {
    config: ChunkerConfig,
    table: [u64; 256],
}

impl Chunker {
    /// Build a chunker from validated bounds
    pub fn new(config: ChunkerConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let mut table = [0u64; 256];
        let mut state = TABLE_SEED;
        for entry in table.iter_mut() {
            state = splitmix64(state);
            *entry = state;
        }
        Ok(Self { config, table })
    }

    /// The configured bounds
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Split `data` into contiguous spans covering it exactly once.
    /// Empty input yields no spans.
    pub fn chunks(&self, data: &[u8]) -> Vec<Span> {
        let mut spans = Vec::new();
        let mut start = 0usize;
        while start < data.len() {
            let size = self.next_cut(&data[start..]);
            spans.push(Span {
                offset: start as u64,
                size: size as u64,
            });
            start += size;
        }
        spans
    }

    /// Length of the next chunk at the front of `data`. A cut is declared
    /// at the first position past `min_size` where the masked rolling state
    /// hits the boundary mark, or at `max_size` as a forced cut.
    fn next_cut(&self, data: &[u8]) -> usize {
        let min = self.config.min_size as usize;
        if data.len() <= min {
            return data.len();
        }
        let max = (self.config.max_size as usize).min(data.len());
        let mask = self.config.avg_size - 1;

        // Warm the window across the tail of the minimum-size prefix,
        // add-only: after this the state is a pure function of the
        // trailing WINDOW bytes, which is what makes cuts independent of
        // where the chunk started.
        let mut state = 0u64;
        for i in (min - WINDOW)..min {
            state = state.rotate_left(1) ^ self.table[data[i] as usize];
        }
        for i in min..max {
            if state & mask == mask {
                return i;
            }
            // Slide: the departing byte has aged one rotation per step
            // since it entered, WINDOW steps ago; 64-bit rotation wraps
            // exactly once for WINDOW = 64.
            state = state.rotate_left(1)
                ^ self.table[data[i] as usize]
                ^ self.table[data[i - WINDOW] as usize].rotate_left(WINDOW as u32);
        }
        max
    }
}

fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn small_config() -> ChunkerConfig {
        ChunkerConfig {
            min_size: 4 * 1024,
            avg_size: 8 * 1024,
            max_size: 16 * 1024,
        }
    }

    /// Deterministic pseudo-random buffer
    fn random_bytes(len: usize, mut seed: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            seed = splitmix64(seed);
            out.extend_from_slice(&seed.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    fn assert_span_laws(spans: &[Span], data_len: usize, config: &ChunkerConfig) {
        let mut expected_offset = 0u64;
        for (i, span) in spans.iter().enumerate() {
            assert_eq!(span.offset, expected_offset, "spans must be contiguous");
            assert!(span.size <= config.max_size, "span exceeds max");
            if i + 1 < spans.len() {
                assert!(span.size >= config.min_size, "non-final span below min");
            }
            expected_offset += span.size;
        }
        assert_eq!(expected_offset, data_len as u64, "spans must cover the data");
    }

    #[test]
    fn validation_rejects_bad_bounds() {
        let ok = small_config();
        assert!(ok.validate().is_ok());

        let mut c = small_config();
        c.avg_size = 12 * 1024; // not a power of two
        assert!(c.validate().is_err());

        let mut c = small_config();
        c.min_size = 32 * 1024; // min > avg
        assert!(c.validate().is_err());

        let mut c = small_config();
        c.max_size = 0;
        assert!(c.validate().is_err());

        let c = ChunkerConfig {
            min_size: 16,
            avg_size: 64,
            max_size: 256,
        };
        assert!(c.validate().is_err(), "min below window must be rejected");
    }

    #[test]
    fn empty_input_yields_no_spans() {
        let chunker = Chunker::new(small_config()).unwrap();
        assert!(chunker.chunks(&[]).is_empty());
    }

    #[test]
    fn short_input_is_one_span() {
        let chunker = Chunker::new(small_config()).unwrap();
        let data = random_bytes(1000, 7);
        let spans = chunker.chunks(&data);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0], Span { offset: 0, size: 1000 });
    }

    #[test]
    fn ten_mib_file_with_mib_bounds() {
        // 10 MiB with (min 4 MiB, avg 8 MiB, max 16 MiB): between one and
        // three spans, summing to exactly 10 MiB.
        let config = ChunkerConfig {
            min_size: 4 * 1024 * 1024,
            avg_size: 8 * 1024 * 1024,
            max_size: 16 * 1024 * 1024,
        };
        let chunker = Chunker::new(config).unwrap();
        let data = random_bytes(10 * 1024 * 1024, 42);
        let spans = chunker.chunks(&data);
        assert!((1..=3).contains(&spans.len()), "got {} spans", spans.len());
        assert_span_laws(&spans, data.len(), &config);
    }

    #[test]
    fn cuts_are_deterministic() {
        let chunker = Chunker::new(small_config()).unwrap();
        let data = random_bytes(300_000, 99);
        assert_eq!(chunker.chunks(&data), chunker.chunks(&data));
    }

    #[test]
    fn cuts_resynchronize_after_distinct_prefix() {
        // Prepending foreign bytes must not disturb the trailing cuts:
        // boundaries depend only on the local window, so the two runs
        // share almost all chunk content once they meet the first common
        // boundary.
        let config = small_config();
        let chunker = Chunker::new(config).unwrap();
        let shared = random_bytes(3 * 1024 * 1024, 1234);
        let prefix = random_bytes(512 * 1024, 5678);

        let plain = chunker.chunks(&shared);
        let mut prefixed_data = prefix.clone();
        prefixed_data.extend_from_slice(&shared);
        let prefixed = chunker.chunks(&prefixed_data);

        let slice_of = |spans: &[Span], data: &[u8], i: usize| -> Vec<u8> {
            let s = spans[i];
            data[s.offset as usize..(s.offset + s.size) as usize].to_vec()
        };

        // Trailing chunks line up byte for byte.
        let last_plain = slice_of(&plain, &shared, plain.len() - 1);
        let last_prefixed = slice_of(&prefixed, &prefixed_data, prefixed.len() - 1);
        assert_eq!(last_plain, last_prefixed);

        // And the overwhelming majority of chunk contents are shared.
        use std::collections::HashSet;
        let plain_set: HashSet<Vec<u8>> = (0..plain.len())
            .map(|i| slice_of(&plain, &shared, i))
            .collect();
        let common = (0..prefixed.len())
            .filter(|&i| plain_set.contains(&slice_of(&prefixed, &prefixed_data, i)))
            .count();
        assert!(
            common >= plain.len() / 2,
            "only {common} of {} chunks shared",
            plain.len()
        );
    }

    proptest! {
        #[test]
        fn prop_span_laws(seed in any::<u64>(), len in 0usize..200_000) {
            let config = small_config();
            let chunker = Chunker::new(config).unwrap();
            let data = random_bytes(len, seed);
            let spans = chunker.chunks(&data);
            assert_span_laws(&spans, data.len(), &config);
        }
    }
}
