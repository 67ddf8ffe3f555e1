//! # Container Compressor / Decompressor
//!
//! The compressor packs a stream of plain (Single/Array) items into one
//! Compressed container whose on-disk size must not exceed the byte budget
//! it was given — the free space of the leaf being rewritten. The contract
//! is transactional per item: `add` either accepts the item and stays within
//! budget, or leaves the compressor exactly as it was and returns `false`
//! (the caller flushes and starts a new container).
//!
//! ## Container image
//!
//! The uncompressed image is self-indexing:
//!
//! ```text
//! [varint nitems][varint nwords][simple8b words: item lengths][item bytes]
//! ```
//!
//! The Simple-8b length directory lets the decompressor slice items out
//! without trusting the per-item size fields, which are then cross-checked
//! during `chunk`. The whole image is zstd-compressed; `finish` wraps the
//! result in a Compressed item stamped with `first_tid`, `last_tid` and
//! `uncompressed_size`.
//!
//! The decompressor holds one container at a time in a private buffer, so
//! callers can drop page latches while they iterate.

use eyre::{bail, ensure, Result};

use crate::btree::item::{create_compressed, ItemRef, COMPRESSED_HEADER_SIZE};
use crate::config::COMPRESSION_LEVEL;
use crate::encoding::simple8b;
use crate::encoding::varint::{decode_varint, encode_varint};
use crate::tid::{ZsTid, INVALID_ZSTID};

fn build_image(lens: &[u64], staging: &[u8]) -> Result<Vec<u8>> {
    let words = simple8b::encode(lens)?;

    let mut image = Vec::with_capacity(20 + words.len() * 8 + staging.len());
    let mut header = [0u8; 9];
    let n = encode_varint(lens.len() as u64, &mut header);
    image.extend_from_slice(&header[..n]);
    let n = encode_varint(words.len() as u64, &mut header);
    image.extend_from_slice(&header[..n]);
    for word in &words {
        image.extend_from_slice(&word.to_ne_bytes());
    }
    image.extend_from_slice(staging);
    Ok(image)
}

/// Streams plain items into one Compressed container under a byte budget.
#[derive(Debug, Default)]
pub struct Compressor {
    budget: usize,
    staging: Vec<u8>,
    lens: Vec<u64>,
    first_tid: ZsTid,
    last_tid: ZsTid,
    best: Option<(Vec<u8>, usize)>,
}

impl Compressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets state with a new container size bound.
    pub fn begin(&mut self, budget: usize) {
        self.budget = budget;
        self.staging.clear();
        self.lens.clear();
        self.first_tid = INVALID_ZSTID;
        self.last_tid = INVALID_ZSTID;
        self.best = None;
    }

    pub fn nitems(&self) -> usize {
        self.lens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lens.is_empty()
    }

    /// Tries to append `item`. Returns `false` (with state unchanged) when
    /// the container would no longer fit the budget.
    pub fn add(&mut self, item: ItemRef<'_>) -> Result<bool> {
        ensure!(
            !item.is_compressed(),
            "cannot add a compressed container to the compressor"
        );

        let bytes = item.bytes();
        let staging_mark = self.staging.len();
        self.staging.extend_from_slice(bytes);
        self.lens.push(bytes.len() as u64);

        let image = build_image(&self.lens, &self.staging)?;
        let compressed = zstd::bulk::compress(&image, COMPRESSION_LEVEL)
            .map_err(|e| eyre::eyre!("zstd compression failed: {}", e))?;

        if COMPRESSED_HEADER_SIZE + compressed.len() > self.budget {
            self.staging.truncate(staging_mark);
            self.lens.pop();
            return Ok(false);
        }

        if self.lens.len() == 1 {
            self.first_tid = item.tid();
        }
        self.last_tid = item.last_tid();
        self.best = Some((compressed, image.len()));
        Ok(true)
    }

    /// Emits the container accumulated so far and resets for the next one.
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        ensure!(!self.is_empty(), "cannot finish an empty container");

        let (compressed, uncompressed_size) = self.best.take().expect("best tracks lens");
        let container =
            create_compressed(self.first_tid, self.last_tid, uncompressed_size, &compressed);

        let budget = self.budget;
        self.begin(budget);
        Ok(container)
    }
}

/// Streams items back out of Compressed containers, one container at a time.
#[derive(Debug, Default)]
pub struct Decompressor {
    buf: Vec<u8>,
    ranges: Vec<(usize, usize)>,
    next: usize,
}

impl Decompressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs one container, replacing any previous one.
    pub fn chunk(&mut self, container: ItemRef<'_>) -> Result<()> {
        ensure!(
            container.is_compressed(),
            "decompressor fed a non-compressed item"
        );

        let expected = container.uncompressed_size();
        self.buf = zstd::bulk::decompress(container.compressed_payload(), expected)
            .map_err(|e| eyre::eyre!("zstd decompression failed: {}", e))?;
        ensure!(
            self.buf.len() == expected,
            "container decompressed to {} bytes, header claims {}",
            self.buf.len(),
            expected
        );

        let (nitems, mut pos) = decode_varint(&self.buf)?;
        let (nwords, read) = decode_varint(&self.buf[pos..])?;
        pos += read;

        let words_end = pos + nwords as usize * 8;
        ensure!(
            words_end <= self.buf.len(),
            "length directory extends beyond container image"
        );
        let words: Vec<u64> = self.buf[pos..words_end]
            .chunks_exact(8)
            .map(|c| u64::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        let lens = simple8b::decode(&words, nitems as usize)?;

        self.ranges.clear();
        self.next = 0;
        let mut start = words_end;
        let mut prev_tid = INVALID_ZSTID;
        for &len in &lens {
            let end = start + len as usize;
            ensure!(
                end <= self.buf.len(),
                "item extends beyond container image: {} > {}",
                end,
                self.buf.len()
            );

            let item = ItemRef::parse(&self.buf[start..end])?;
            if item.is_compressed() {
                bail!("nested compressed items are not supported");
            }
            ensure!(
                item.size() == len as usize,
                "item size {} disagrees with length directory {}",
                item.size(),
                len
            );
            ensure!(
                item.tid() > prev_tid,
                "container items out of TID order at tid {}",
                item.tid()
            );
            prev_tid = item.last_tid();

            self.ranges.push((start, end));
            start = end;
        }
        ensure!(
            start == self.buf.len(),
            "container image has {} trailing bytes",
            self.buf.len() - start
        );

        Ok(())
    }

    /// Next item image from the current container, in TID order. The slice
    /// lives in the decompressor's private buffer.
    pub fn read_item(&mut self) -> Option<&[u8]> {
        let &(start, end) = self.ranges.get(self.next)?;
        self.next += 1;
        Some(&self.buf[start..end])
    }

    pub fn exhausted(&self) -> bool {
        self.next >= self.ranges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::item::{create_item, AttrDesc};
    use crate::config::PAGE_CONTENT_SIZE;
    use crate::mvcc::UndoPtr;

    const INT8: AttrDesc = AttrDesc {
        attlen: 8,
        attbyval: true,
    };

    fn noise_bytes(seed: u64, len: usize) -> Vec<u8> {
        let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(1);
        (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    fn int_item(tid: ZsTid, value: i64) -> Vec<u8> {
        create_item(
            &INT8,
            tid,
            UndoPtr { counter: 1 },
            &[&value.to_ne_bytes()],
            1,
            false,
        )
        .unwrap()
    }

    fn compress_all(items: &[Vec<u8>], budget: usize) -> Vec<u8> {
        let mut compressor = Compressor::new();
        compressor.begin(budget);
        for item in items {
            let accepted = compressor.add(ItemRef::parse(item).unwrap()).unwrap();
            assert!(accepted, "item rejected under budget {}", budget);
        }
        compressor.finish().unwrap()
    }

    #[test]
    fn compress_then_decompress_preserves_items_and_order() {
        let items: Vec<Vec<u8>> = (1..=20).map(|i| int_item(i, i as i64 * 100)).collect();
        let container = compress_all(&items, PAGE_CONTENT_SIZE);

        let parsed = ItemRef::parse(&container).unwrap();
        assert!(parsed.is_compressed());
        assert_eq!(parsed.tid(), 1);
        assert_eq!(parsed.last_tid(), 20);

        let mut decompressor = Decompressor::new();
        decompressor.chunk(parsed).unwrap();

        for expected in &items {
            let bytes = decompressor.read_item().unwrap();
            assert_eq!(bytes, expected.as_slice());
        }
        assert!(decompressor.read_item().is_none());
        assert!(decompressor.exhausted());
    }

    #[test]
    fn container_fits_its_budget() {
        let items: Vec<Vec<u8>> = (1..=50).map(|i| int_item(i, i as i64)).collect();
        let budget = 400;

        let mut compressor = Compressor::new();
        compressor.begin(budget);
        let mut accepted = 0;
        for item in &items {
            if !compressor.add(ItemRef::parse(item).unwrap()).unwrap() {
                break;
            }
            accepted += 1;
        }
        assert!(accepted > 0);

        let container = compressor.finish().unwrap();
        assert!(container.len() <= budget, "{} > {}", container.len(), budget);
    }

    #[test]
    fn rejected_add_leaves_state_unchanged() {
        let mut compressor = Compressor::new();
        compressor.begin(200);

        let small = int_item(1, 1);
        assert!(compressor.add(ItemRef::parse(&small).unwrap()).unwrap());
        let nitems_before = compressor.nitems();

        // An item that cannot fit the remaining budget even compressed.
        let attr = AttrDesc::varlen();
        let big_value = noise_bytes(7, 4000);
        let big = create_item(&attr, 2, UndoPtr { counter: 1 }, &[&big_value], 1, false).unwrap();
        assert!(!compressor.add(ItemRef::parse(&big).unwrap()).unwrap());
        assert_eq!(compressor.nitems(), nitems_before);

        // The already-accepted content still finishes cleanly.
        let container = compressor.finish().unwrap();
        let parsed = ItemRef::parse(&container).unwrap();
        assert_eq!(parsed.tid(), 1);
        assert_eq!(parsed.last_tid(), 1);
    }

    #[test]
    fn single_item_over_budget_is_rejected_outright() {
        let mut compressor = Compressor::new();
        compressor.begin(COMPRESSED_HEADER_SIZE + 4);

        let item = int_item(1, 42);
        assert!(!compressor.add(ItemRef::parse(&item).unwrap()).unwrap());
        assert!(compressor.is_empty());
    }

    #[test]
    fn finish_on_empty_compressor_is_an_error() {
        let mut compressor = Compressor::new();
        compressor.begin(1000);
        assert!(compressor.finish().is_err());
    }

    #[test]
    fn nested_containers_are_rejected_by_add() {
        let container = compress_all(&[int_item(1, 1)], PAGE_CONTENT_SIZE);

        let mut compressor = Compressor::new();
        compressor.begin(PAGE_CONTENT_SIZE);
        let result = compressor.add(ItemRef::parse(&container).unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn decompressor_rejects_plain_items() {
        let item = int_item(1, 1);
        let mut decompressor = Decompressor::new();
        let result = decompressor.chunk(ItemRef::parse(&item).unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn corrupt_payload_fails_decompression() {
        let container = compress_all(&[int_item(1, 1), int_item(2, 2)], PAGE_CONTENT_SIZE);
        let mut corrupted = container.clone();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;
        corrupted[last - 1] ^= 0xFF;

        let mut decompressor = Decompressor::new();
        let result = decompressor.chunk(ItemRef::parse(&corrupted).unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn array_items_ride_through_containers() {
        let values: Vec<[u8; 8]> = (0..10i64).map(|i| i.to_ne_bytes()).collect();
        let refs: Vec<&[u8]> = values.iter().map(|v| &v[..]).collect();
        let array = create_item(&INT8, 100, UndoPtr { counter: 3 }, &refs, 10, false).unwrap();

        let container = compress_all(&[array.clone()], PAGE_CONTENT_SIZE);
        let parsed = ItemRef::parse(&container).unwrap();
        assert_eq!(parsed.last_tid(), 109);

        let mut decompressor = Decompressor::new();
        decompressor.chunk(parsed).unwrap();
        assert_eq!(decompressor.read_item().unwrap(), array.as_slice());
    }

    #[test]
    fn chunk_replaces_previous_container() {
        let first = compress_all(&[int_item(1, 1)], PAGE_CONTENT_SIZE);
        let second = compress_all(&[int_item(7, 7)], PAGE_CONTENT_SIZE);

        let mut decompressor = Decompressor::new();
        decompressor.chunk(ItemRef::parse(&first).unwrap()).unwrap();
        decompressor
            .chunk(ItemRef::parse(&second).unwrap())
            .unwrap();

        let bytes = decompressor.read_item().unwrap();
        assert_eq!(ItemRef::parse(bytes).unwrap().tid(), 7);
    }
}
