//! # TOAST Pointers for Oversized Datums
//!
//! Datums larger than `MAX_DATUM_SIZE` never enter an attribute tree
//! directly. The caller hands the value to a toast store, which chunks it
//! and returns a fixed 17-byte pointer; the tree stores the pointer bytes as
//! an ordinary (small) datum. On read, the caller recognizes the marker byte
//! and detoasts.
//!
//! ## Pointer format
//!
//! ```text
//! +--------+-------------+----------+
//! | Marker | Total Size  | Chunk ID |
//! | 1 byte | 8 bytes     | 8 bytes  |
//! | 0xFE   | u64 LE      | u64 LE   |
//! +--------+-------------+----------+
//! ```
//!
//! `chunk_id = (tid << 16) | attno`, which is unique per (tuple, attribute)
//! pair since TIDs are 48-bit.
//!
//! The page-level chunk allocator is a collaborator outside this engine;
//! `HeapToastStore` is the in-process reference implementation used by the
//! scenario tests.

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::tid::ZsTid;

pub const TOAST_MARKER: u8 = 0xFE;
pub const TOAST_POINTER_SIZE: usize = 17;
pub const TOAST_CHUNK_SIZE: usize = 2000;

/// Stores an oversized value, yielding pointer bytes for the tree.
pub trait Toaster {
    fn toast(&self, tid: ZsTid, attno: u16, value: &[u8]) -> Result<[u8; TOAST_POINTER_SIZE]>;
}

/// Reassembles a toasted value from its pointer bytes.
pub trait Detoaster {
    fn detoast(&self, toast_pointer: &[u8]) -> Result<Vec<u8>>;
}

/// Returns true if `datum` is a toast pointer rather than an inline value.
pub fn is_toast_pointer(datum: &[u8]) -> bool {
    datum.len() == TOAST_POINTER_SIZE && datum[0] == TOAST_MARKER
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToastPointer {
    pub total_size: u64,
    pub chunk_id: u64,
}

impl ToastPointer {
    pub fn new(tid: ZsTid, attno: u16, total_size: u64) -> Self {
        Self {
            total_size,
            chunk_id: (tid << 16) | attno as u64,
        }
    }

    pub fn encode(&self) -> [u8; TOAST_POINTER_SIZE] {
        let mut buf = [0u8; TOAST_POINTER_SIZE];
        buf[0] = TOAST_MARKER;
        buf[1..9].copy_from_slice(&self.total_size.to_le_bytes());
        buf[9..17].copy_from_slice(&self.chunk_id.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() >= TOAST_POINTER_SIZE,
            "toast pointer too short: {} < {}",
            data.len(),
            TOAST_POINTER_SIZE
        );
        ensure!(
            data[0] == TOAST_MARKER,
            "invalid toast marker: {:02x}",
            data[0]
        );

        let total_size = u64::from_le_bytes(data[1..9].try_into().unwrap());
        let chunk_id = u64::from_le_bytes(data[9..17].try_into().unwrap());

        Ok(Self {
            total_size,
            chunk_id,
        })
    }
}

/// In-process chunk store: `chunk_id -> ordered chunks`.
#[derive(Debug, Default)]
pub struct HeapToastStore {
    chunks: Mutex<HashMap<u64, Vec<Vec<u8>>>>,
}

impl HeapToastStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Toaster for HeapToastStore {
    fn toast(&self, tid: ZsTid, attno: u16, value: &[u8]) -> Result<[u8; TOAST_POINTER_SIZE]> {
        let pointer = ToastPointer::new(tid, attno, value.len() as u64);

        let chunks: Vec<Vec<u8>> = value
            .chunks(TOAST_CHUNK_SIZE)
            .map(|c| c.to_vec())
            .collect();
        self.chunks.lock().insert(pointer.chunk_id, chunks);

        Ok(pointer.encode())
    }
}

impl Detoaster for HeapToastStore {
    fn detoast(&self, toast_pointer: &[u8]) -> Result<Vec<u8>> {
        let pointer = ToastPointer::decode(toast_pointer)?;

        let chunks = self.chunks.lock();
        let stored = chunks
            .get(&pointer.chunk_id)
            .ok_or_else(|| eyre::eyre!("no toast chunks for chunk_id {}", pointer.chunk_id))?;

        let mut value = Vec::with_capacity(pointer.total_size as usize);
        for chunk in stored {
            value.extend_from_slice(chunk);
        }

        ensure!(
            value.len() as u64 == pointer.total_size,
            "toast reassembly size mismatch: {} != {}",
            value.len(),
            pointer.total_size
        );

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_roundtrip() {
        let pointer = ToastPointer::new(12345, 3, 10_000);
        let encoded = pointer.encode();

        assert!(is_toast_pointer(&encoded));
        assert_eq!(ToastPointer::decode(&encoded).unwrap(), pointer);
    }

    #[test]
    fn chunk_id_packs_tid_and_attno() {
        let pointer = ToastPointer::new(0x1234, 7, 100);
        assert_eq!(pointer.chunk_id, (0x1234 << 16) | 7);
    }

    #[test]
    fn decode_rejects_bad_marker() {
        let mut encoded = ToastPointer::new(1, 1, 1).encode();
        encoded[0] = 0x00;

        let result = ToastPointer::decode(&encoded);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("invalid toast marker"));
    }

    #[test]
    fn decode_rejects_short_input() {
        assert!(ToastPointer::decode(&[TOAST_MARKER, 0, 0]).is_err());
    }

    #[test]
    fn store_roundtrips_multi_chunk_values() {
        let store = HeapToastStore::new();
        let value: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let pointer = store.toast(42, 2, &value).unwrap();
        let restored = store.detoast(&pointer).unwrap();

        assert_eq!(restored, value);
    }

    #[test]
    fn inline_datum_is_not_a_pointer() {
        assert!(!is_toast_pointer(b"short value"));
        assert!(!is_toast_pointer(&[0u8; TOAST_POINTER_SIZE]));
    }
}
