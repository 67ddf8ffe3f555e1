//! # Simple-8b Integer Packing
//!
//! Packs a sequence of small unsigned integers into 64-bit words. Each word
//! spends its top 4 bits on a selector that fixes how many values the word
//! carries and at what bit width:
//!
//! | Selector | Values | Bits each |
//! |----------|--------|-----------|
//! | 0        | 240    | 0         |
//! | 1        | 120    | 0         |
//! | 2        | 60     | 1         |
//! | 3        | 30     | 2         |
//! | 4        | 20     | 3         |
//! | 5        | 15     | 4         |
//! | 6        | 12     | 5         |
//! | 7        | 10     | 6         |
//! | 8        | 8      | 7         |
//! | 9        | 7      | 8         |
//! | 10       | 6      | 10        |
//! | 11       | 5      | 12        |
//! | 12       | 4      | 15        |
//! | 13       | 3      | 20        |
//! | 14       | 2      | 30        |
//! | 15       | 1      | 60        |
//!
//! Zero-bit selectors encode runs of the value 0. Values of 2^60 or larger
//! cannot be represented and are an encode error.
//!
//! The container compressor uses this to pack the per-item length directory
//! at the head of a compressed container's uncompressed image; item lengths
//! are bounded by the page size, so they pack densely.

use eyre::{bail, ensure, Result};

/// (values per word, bits per value), indexed by selector.
const SELECTORS: [(usize, u32); 16] = [
    (240, 0),
    (120, 0),
    (60, 1),
    (30, 2),
    (20, 3),
    (15, 4),
    (12, 5),
    (10, 6),
    (8, 7),
    (7, 8),
    (6, 10),
    (5, 12),
    (4, 15),
    (3, 20),
    (2, 30),
    (1, 60),
];

/// Largest value Simple-8b can carry (60 payload bits).
pub const MAX_VALUE: u64 = (1 << 60) - 1;

/// Packs `values` into 64-bit words. Greedy: each word uses the densest
/// selector that covers the next run of values.
pub fn encode(values: &[u64]) -> Result<Vec<u64>> {
    let mut words = Vec::new();
    let mut pos = 0;

    while pos < values.len() {
        let mut packed = None;

        for (selector, &(count, bits)) in SELECTORS.iter().enumerate() {
            let available = values.len() - pos;
            if count > available {
                continue;
            }

            let fits = values[pos..pos + count].iter().all(|&v| {
                if bits == 0 {
                    v == 0
                } else {
                    v <= (1u64 << bits) - 1
                }
            });
            if !fits {
                continue;
            }

            let mut word = (selector as u64) << 60;
            for (i, &v) in values[pos..pos + count].iter().enumerate() {
                word |= v << (i as u32 * bits);
            }
            packed = Some((word, count));
            break;
        }

        match packed {
            Some((word, count)) => {
                words.push(word);
                pos += count;
            }
            None => {
                ensure!(
                    values[pos] <= MAX_VALUE,
                    "value {} exceeds simple8b maximum {}",
                    values[pos],
                    MAX_VALUE
                );
                bail!("could not pack value {} at position {}", values[pos], pos);
            }
        }
    }

    Ok(words)
}

/// Unpacks `count` values from `words`. Fails if the words run out before
/// `count` values are produced.
pub fn decode(words: &[u64], count: usize) -> Result<Vec<u64>> {
    let mut values = Vec::with_capacity(count);

    for &word in words {
        if values.len() >= count {
            break;
        }
        let selector = (word >> 60) as usize;
        let (n, bits) = SELECTORS[selector];
        let mask = if bits == 0 { 0 } else { (1u64 << bits) - 1 };

        for i in 0..n {
            if values.len() >= count {
                break;
            }
            values.push((word >> (i as u32 * bits)) & mask);
        }
    }

    ensure!(
        values.len() == count,
        "simple8b stream exhausted: decoded {} of {} values",
        values.len(),
        count
    );

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(values: &[u64]) -> usize {
        let words = encode(values).unwrap();
        let decoded = decode(&words, values.len()).unwrap();
        assert_eq!(decoded, values);
        words.len()
    }

    #[test]
    fn empty_input_produces_no_words() {
        assert_eq!(roundtrip(&[]), 0);
    }

    #[test]
    fn single_values_roundtrip() {
        roundtrip(&[0]);
        roundtrip(&[1]);
        roundtrip(&[MAX_VALUE]);
    }

    #[test]
    fn zero_runs_use_the_run_selectors() {
        // 240 zeros pack into exactly one word via selector 0.
        let zeros = vec![0u64; 240];
        assert_eq!(roundtrip(&zeros), 1);

        let zeros = vec![0u64; 120];
        assert_eq!(roundtrip(&zeros), 1);
    }

    #[test]
    fn sixty_one_bit_values_pack_into_one_word() {
        let ones = vec![1u64; 60];
        assert_eq!(roundtrip(&ones), 1);
    }

    #[test]
    fn selector_boundary_values_roundtrip() {
        for &(count, bits) in SELECTORS.iter() {
            if bits == 0 {
                continue;
            }
            let max = (1u64 << bits) - 1;
            let values = vec![max; count];
            assert_eq!(roundtrip(&values), 1, "bits={}", bits);
        }
    }

    #[test]
    fn mixed_magnitudes_roundtrip() {
        let values: Vec<u64> = (0..1000).map(|i| (i * 7919) % 4096).collect();
        roundtrip(&values);
    }

    #[test]
    fn page_sized_item_lengths_roundtrip() {
        // The compressor's actual workload: item lengths bounded by the page.
        let values: Vec<u64> = (0..200)
            .map(|i| 20 + (i * 37) % crate::config::PAGE_SIZE as u64)
            .collect();
        roundtrip(&values);
    }

    #[test]
    fn oversized_value_is_an_encode_error() {
        let result = encode(&[MAX_VALUE + 1]);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds simple8b maximum"));
    }

    #[test]
    fn short_stream_is_a_decode_error() {
        let words = encode(&[5, 6, 7]).unwrap();
        let result = decode(&words, 10);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exhausted"));
    }
}
