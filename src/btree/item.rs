//! # Leaf Item Codec
//!
//! A leaf stores three item variants behind one common prefix:
//!
//! ```text
//! common   +----------+----------+-----------+
//! (12 B)   | tid u64  | size u16 | flags u16 |
//!          +----------+----------+-----------+
//!
//! Single   | common | undo_ptr u64 | payload...                      |
//! Array    | common | undo_ptr u64 | nelements u16 | payload...      |
//! Compr.   | common | last_tid u64 | uncompressed_size u32 | bytes...|
//! ```
//!
//! All fields are native-endian; the format is not portable across machines.
//! `size` is the full item length including headers, so a page can be walked
//! without knowing variants.
//!
//! An Array item covers `nelements` consecutive TIDs that share one undo
//! pointer and one null-ness; its payload is the datums back to back in
//! marshalled form. A Compressed item wraps the concatenated images of plain
//! items; containers never nest.
//!
//! ## Datum marshalling
//!
//! Fixed-width attributes (`attlen > 0`) store exactly `attlen` bytes.
//! Variable-width attributes (`attlen == -1`) store a varint length header
//! followed by the bytes; the header is one byte for values up to 240 bytes,
//! so short values get the short form.

use eyre::{bail, ensure, Result};
use zerocopy::byteorder::{NativeEndian, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::MAX_ITEM_SIZE;
use crate::encoding::varint::{decode_varint, encode_varint, varint_len};
use crate::mvcc::UndoPtr;
use crate::tid::ZsTid;

/// Item flag bits. `COMPRESSED` and `ARRAY` select the variant; the rest are
/// tuple lifecycle state.
pub mod flags {
    pub const COMPRESSED: u16 = 0x01;
    pub const ARRAY: u16 = 0x02;
    pub const NULL: u16 = 0x04;
    pub const DELETED: u16 = 0x08;
    pub const UPDATED: u16 = 0x10;
    pub const DEAD: u16 = 0x20;
}

pub const ITEM_HEADER_SIZE: usize = 12;
pub const SINGLE_HEADER_SIZE: usize = 20;
pub const ARRAY_HEADER_SIZE: usize = 22;
pub const COMPRESSED_HEADER_SIZE: usize = 24;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ItemHeader {
    pub tid: U64<NativeEndian>,
    pub size: U16<NativeEndian>,
    pub flags: U16<NativeEndian>,
}

/// Attribute storage descriptor: `attlen > 0` is a fixed width, `-1` is
/// variable width with a self-describing header. `attbyval` records whether
/// the host passes the value inline; the on-disk form is the same either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrDesc {
    pub attlen: i16,
    pub attbyval: bool,
}

impl AttrDesc {
    pub fn fixed(attlen: i16) -> Self {
        debug_assert!(attlen > 0);
        Self {
            attlen,
            attbyval: true,
        }
    }

    pub fn varlen() -> Self {
        Self {
            attlen: -1,
            attbyval: false,
        }
    }

    pub fn is_varlen(&self) -> bool {
        self.attlen < 0
    }
}

/// Marshalled length of one datum.
pub fn datum_stored_len(attr: &AttrDesc, value: &[u8]) -> usize {
    if attr.is_varlen() {
        varint_len(value.len() as u64) + value.len()
    } else {
        attr.attlen as usize
    }
}

/// Reads one marshalled datum from the front of `bytes`, returning the value
/// and the number of bytes consumed.
pub fn read_datum<'a>(attr: &AttrDesc, bytes: &'a [u8]) -> Result<(&'a [u8], usize)> {
    if attr.is_varlen() {
        let (len, header) = decode_varint(bytes)?;
        let end = header + len as usize;
        ensure!(
            end <= bytes.len(),
            "varlen datum extends beyond payload: {} > {}",
            end,
            bytes.len()
        );
        Ok((&bytes[header..end], end))
    } else {
        let len = attr.attlen as usize;
        ensure!(
            len <= bytes.len(),
            "fixed datum extends beyond payload: {} > {}",
            len,
            bytes.len()
        );
        Ok((&bytes[..len], len))
    }
}

/// Byte length of the first `n` elements of an array payload: multiplication
/// for fixed widths, a header walk for variable widths.
pub fn array_slice_len(attr: &AttrDesc, isnull: bool, payload: &[u8], n: usize) -> Result<usize> {
    if isnull {
        return Ok(0);
    }
    if !attr.is_varlen() {
        return Ok(attr.attlen as usize * n);
    }

    let mut pos = 0;
    for _ in 0..n {
        let (len, header) = decode_varint(&payload[pos..])?;
        pos += header + len as usize;
        ensure!(
            pos <= payload.len(),
            "array slice extends beyond payload: {} > {}",
            pos,
            payload.len()
        );
    }
    Ok(pos)
}

/// Borrowed view of one item image. `parse` trims the input to the item's
/// stored size, so a view is always exactly one item.
#[derive(Debug, Clone, Copy)]
pub struct ItemRef<'a> {
    data: &'a [u8],
}

impl<'a> ItemRef<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        ensure!(
            data.len() >= ITEM_HEADER_SIZE,
            "item too small: {} < {}",
            data.len(),
            ITEM_HEADER_SIZE
        );
        let header = ItemHeader::ref_from_bytes(&data[..ITEM_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read item header: {:?}", e))?;

        let size = header.size.get() as usize;
        ensure!(
            size >= ITEM_HEADER_SIZE && size <= data.len(),
            "item size {} out of range (buffer {})",
            size,
            data.len()
        );

        let item_flags = header.flags.get();
        ensure!(
            item_flags & flags::COMPRESSED == 0 || item_flags & flags::ARRAY == 0,
            "item cannot be both compressed and array"
        );

        let min_size = if item_flags & flags::COMPRESSED != 0 {
            COMPRESSED_HEADER_SIZE
        } else if item_flags & flags::ARRAY != 0 {
            ARRAY_HEADER_SIZE
        } else {
            SINGLE_HEADER_SIZE
        };
        ensure!(
            size >= min_size,
            "item size {} below variant header size {}",
            size,
            min_size
        );

        Ok(Self { data: &data[..size] })
    }

    fn header(&self) -> &ItemHeader {
        ItemHeader::ref_from_bytes(&self.data[..ITEM_HEADER_SIZE]).unwrap()
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn tid(&self) -> ZsTid {
        self.header().tid.get()
    }

    pub fn size(&self) -> usize {
        self.header().size.get() as usize
    }

    pub fn flags(&self) -> u16 {
        self.header().flags.get()
    }

    pub fn is_compressed(&self) -> bool {
        self.flags() & flags::COMPRESSED != 0
    }

    pub fn is_array(&self) -> bool {
        self.flags() & flags::ARRAY != 0
    }

    pub fn is_null(&self) -> bool {
        self.flags() & flags::NULL != 0
    }

    pub fn is_dead(&self) -> bool {
        self.flags() & flags::DEAD != 0
    }

    /// Last TID covered by this item (inclusive).
    pub fn last_tid(&self) -> ZsTid {
        if self.is_compressed() {
            U64::<NativeEndian>::ref_from_bytes(&self.data[12..20])
                .unwrap()
                .get()
        } else if self.is_array() {
            self.tid() + self.nelements() as ZsTid - 1
        } else {
            self.tid()
        }
    }

    /// Undo pointer of a plain item. Containers carry no undo state.
    pub fn undo_ptr(&self) -> Result<UndoPtr> {
        ensure!(
            !self.is_compressed(),
            "compressed container has no undo pointer"
        );
        let counter = U64::<NativeEndian>::ref_from_bytes(&self.data[12..20])
            .unwrap()
            .get();
        Ok(UndoPtr { counter })
    }

    pub fn nelements(&self) -> u16 {
        debug_assert!(self.is_array());
        U16::<NativeEndian>::ref_from_bytes(&self.data[20..22])
            .unwrap()
            .get()
    }

    /// Datum payload of a plain item, in marshalled form.
    pub fn payload(&self) -> Result<&'a [u8]> {
        ensure!(!self.is_compressed(), "compressed container has no payload");
        let offset = if self.is_array() {
            ARRAY_HEADER_SIZE
        } else {
            SINGLE_HEADER_SIZE
        };
        Ok(&self.data[offset..])
    }

    pub fn uncompressed_size(&self) -> usize {
        debug_assert!(self.is_compressed());
        U32::<NativeEndian>::ref_from_bytes(&self.data[20..24])
            .unwrap()
            .get() as usize
    }

    pub fn compressed_payload(&self) -> &'a [u8] {
        debug_assert!(self.is_compressed());
        &self.data[COMPRESSED_HEADER_SIZE..]
    }
}

fn write_common(buf: &mut Vec<u8>, tid: ZsTid, size: usize, item_flags: u16) {
    let header = ItemHeader {
        tid: U64::new(tid),
        size: U16::new(size as u16),
        flags: U16::new(item_flags),
    };
    buf.extend_from_slice(header.as_bytes());
}

/// Builds a Single item. `datum` is the marshalled payload; `None` stores a
/// NULL with empty payload.
pub fn create_single(
    tid: ZsTid,
    undo_ptr: UndoPtr,
    marshalled: Option<&[u8]>,
    extra_flags: u16,
) -> Vec<u8> {
    let (payload, null_flag): (&[u8], u16) = match marshalled {
        Some(d) => (d, 0),
        None => (&[], flags::NULL),
    };
    let size = SINGLE_HEADER_SIZE + payload.len();

    let mut buf = Vec::with_capacity(size);
    write_common(&mut buf, tid, size, extra_flags | null_flag);
    buf.extend_from_slice(&undo_ptr.counter.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Builds an Array item from an already-marshalled payload slice.
pub fn create_array_from_raw(
    tid: ZsTid,
    undo_ptr: UndoPtr,
    nelements: usize,
    marshalled: &[u8],
    isnull: bool,
) -> Vec<u8> {
    debug_assert!(nelements > 1 || (isnull && nelements >= 1));
    let null_flag = if isnull { flags::NULL } else { 0 };
    let size = ARRAY_HEADER_SIZE + marshalled.len();

    let mut buf = Vec::with_capacity(size);
    write_common(&mut buf, tid, size, flags::ARRAY | null_flag);
    buf.extend_from_slice(&undo_ptr.counter.to_ne_bytes());
    buf.extend_from_slice(&(nelements as u16).to_ne_bytes());
    buf.extend_from_slice(marshalled);
    buf
}

/// Builds a Single (one value) or Array (several values) item, marshalling
/// each datum. `values` must not mix null and non-null; an all-null run is
/// expressed by `isnull = true` with empty values.
pub fn create_item(
    attr: &AttrDesc,
    tid: ZsTid,
    undo_ptr: UndoPtr,
    values: &[&[u8]],
    nelements: usize,
    isnull: bool,
) -> Result<Vec<u8>> {
    ensure!(nelements > 0, "cannot create an item covering no tuples");

    let mut marshalled = Vec::new();
    if !isnull {
        ensure!(
            values.len() == nelements,
            "value count {} != element count {}",
            values.len(),
            nelements
        );
        for value in values {
            marshal_datum(attr, value, &mut marshalled)?;
        }
    }

    let item = if nelements == 1 {
        let payload = if isnull {
            None
        } else {
            Some(marshalled.as_slice())
        };
        create_single(tid, undo_ptr, payload, 0)
    } else {
        create_array_from_raw(tid, undo_ptr, nelements, &marshalled, isnull)
    };

    ensure!(
        item.len() <= MAX_ITEM_SIZE,
        "item of {} bytes exceeds maximum item size {}",
        item.len(),
        MAX_ITEM_SIZE
    );
    Ok(item)
}

/// Appends the marshalled form of `value` to `out`.
pub fn marshal_datum(attr: &AttrDesc, value: &[u8], out: &mut Vec<u8>) -> Result<()> {
    if attr.is_varlen() {
        let mut header = [0u8; 9];
        let n = encode_varint(value.len() as u64, &mut header);
        out.extend_from_slice(&header[..n]);
        out.extend_from_slice(value);
    } else {
        ensure!(
            value.len() == attr.attlen as usize,
            "fixed-width datum has {} bytes, attribute expects {}",
            value.len(),
            attr.attlen
        );
        out.extend_from_slice(value);
    }
    Ok(())
}

/// Copies a plain item, replacing its lifecycle flags and undo pointer.
/// Variant and payload are preserved.
pub fn with_flags_and_undo(item: ItemRef<'_>, extra_flags: u16, undo_ptr: UndoPtr) -> Vec<u8> {
    debug_assert!(!item.is_compressed());
    let mut buf = item.bytes().to_vec();

    let keep = flags::ARRAY | flags::NULL;
    let new_flags = (item.flags() & keep) | extra_flags;
    buf[10..12].copy_from_slice(&new_flags.to_ne_bytes());
    buf[12..20].copy_from_slice(&undo_ptr.counter.to_ne_bytes());
    buf
}

/// Materializes the element covering `tid` out of a plain item as a
/// standalone Single image. For a Single this is a copy; for an Array the
/// element is sliced out and the ARRAY flag dropped.
pub fn extract_single(attr: &AttrDesc, item: ItemRef<'_>, tid: ZsTid) -> Result<Vec<u8>> {
    ensure!(!item.is_compressed(), "cannot extract from a container");
    ensure!(
        item.tid() <= tid && tid <= item.last_tid(),
        "item [{}, {}] does not cover tid {}",
        item.tid(),
        item.last_tid(),
        tid
    );

    if !item.is_array() {
        return Ok(item.bytes().to_vec());
    }

    let isnull = item.is_null();
    let payload = item.payload()?;
    let elemno = (tid - item.tid()) as usize;

    let marshalled: Option<&[u8]> = if isnull {
        None
    } else {
        let start = array_slice_len(attr, isnull, payload, elemno)?;
        let elem_len = array_slice_len(attr, isnull, &payload[start..], 1)?;
        Some(&payload[start..start + elem_len])
    };

    let lifecycle = item.flags() & (flags::DELETED | flags::UPDATED | flags::DEAD);
    Ok(create_single(
        tid,
        item.undo_ptr()?,
        marshalled,
        lifecycle,
    ))
}

/// Builds a Compressed container image around `compressed` bytes.
pub fn create_compressed(
    first_tid: ZsTid,
    last_tid: ZsTid,
    uncompressed_size: usize,
    compressed: &[u8],
) -> Vec<u8> {
    let size = COMPRESSED_HEADER_SIZE + compressed.len();

    let mut buf = Vec::with_capacity(size);
    write_common(&mut buf, first_tid, size, flags::COMPRESSED);
    buf.extend_from_slice(&last_tid.to_ne_bytes());
    buf.extend_from_slice(&(uncompressed_size as u32).to_ne_bytes());
    buf.extend_from_slice(compressed);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::INVALID_UNDO_PTR;

    const INT4: AttrDesc = AttrDesc {
        attlen: 4,
        attbyval: true,
    };

    fn undo(counter: u64) -> UndoPtr {
        UndoPtr { counter }
    }

    #[test]
    fn header_sizes_are_fixed() {
        assert_eq!(size_of::<ItemHeader>(), ITEM_HEADER_SIZE);
        let single = create_single(1, INVALID_UNDO_PTR, Some(b""), 0);
        assert_eq!(single.len(), SINGLE_HEADER_SIZE);
    }

    #[test]
    fn single_item_roundtrip() {
        let item = create_item(&INT4, 7, undo(99), &[&5i32.to_ne_bytes()], 1, false).unwrap();
        let parsed = ItemRef::parse(&item).unwrap();

        assert_eq!(parsed.tid(), 7);
        assert_eq!(parsed.last_tid(), 7);
        assert!(!parsed.is_array());
        assert!(!parsed.is_null());
        assert_eq!(parsed.undo_ptr().unwrap(), undo(99));
        assert_eq!(parsed.payload().unwrap(), &5i32.to_ne_bytes());
    }

    #[test]
    fn null_single_has_empty_payload() {
        let item = create_item(&INT4, 3, undo(1), &[], 1, true).unwrap();
        let parsed = ItemRef::parse(&item).unwrap();

        assert!(parsed.is_null());
        assert!(parsed.payload().unwrap().is_empty());
        assert_eq!(item.len(), SINGLE_HEADER_SIZE);
    }

    #[test]
    fn array_item_covers_consecutive_tids() {
        let values: Vec<[u8; 4]> = (0..5i32).map(|i| i.to_ne_bytes()).collect();
        let refs: Vec<&[u8]> = values.iter().map(|v| &v[..]).collect();
        let item = create_item(&INT4, 10, undo(4), &refs, 5, false).unwrap();
        let parsed = ItemRef::parse(&item).unwrap();

        assert!(parsed.is_array());
        assert_eq!(parsed.tid(), 10);
        assert_eq!(parsed.nelements(), 5);
        assert_eq!(parsed.last_tid(), 14);
        assert_eq!(parsed.payload().unwrap().len(), 20);
    }

    #[test]
    fn varlen_values_get_self_describing_headers() {
        let attr = AttrDesc::varlen();
        let item = create_item(&attr, 1, undo(1), &[b"ab", b"chars"], 2, false).unwrap();
        let parsed = ItemRef::parse(&item).unwrap();

        let payload = parsed.payload().unwrap();
        let (first, consumed) = read_datum(&attr, payload).unwrap();
        assert_eq!(first, b"ab");
        let (second, _) = read_datum(&attr, &payload[consumed..]).unwrap();
        assert_eq!(second, b"chars");
    }

    #[test]
    fn array_slice_len_fixed_multiplies() {
        let len = array_slice_len(&INT4, false, &[0u8; 40], 7).unwrap();
        assert_eq!(len, 28);
    }

    #[test]
    fn array_slice_len_varlen_walks_headers() {
        let attr = AttrDesc::varlen();
        let mut payload = Vec::new();
        for value in [&b"a"[..], b"long-value", b"xy"] {
            marshal_datum(&attr, value, &mut payload).unwrap();
        }

        assert_eq!(array_slice_len(&attr, false, &payload, 1).unwrap(), 2);
        assert_eq!(array_slice_len(&attr, false, &payload, 2).unwrap(), 13);
        assert_eq!(
            array_slice_len(&attr, false, &payload, 3).unwrap(),
            payload.len()
        );
    }

    #[test]
    fn array_slice_len_null_is_zero() {
        assert_eq!(array_slice_len(&INT4, true, &[], 100).unwrap(), 0);
    }

    #[test]
    fn slicing_then_concatenating_reproduces_the_payload() {
        let attr = AttrDesc::varlen();
        let mut payload = Vec::new();
        for i in 0..10 {
            marshal_datum(&attr, format!("value-{}", i).as_bytes(), &mut payload).unwrap();
        }

        for cutoff in 0..=10 {
            let left = array_slice_len(&attr, false, &payload, cutoff).unwrap();
            let right = array_slice_len(&attr, false, &payload[left..], 10 - cutoff).unwrap();
            assert_eq!(left + right, payload.len(), "cutoff {}", cutoff);
        }
    }

    #[test]
    fn with_flags_and_undo_preserves_variant_and_payload() {
        let values: Vec<[u8; 4]> = (0..3i32).map(|i| i.to_ne_bytes()).collect();
        let refs: Vec<&[u8]> = values.iter().map(|v| &v[..]).collect();
        let item = create_item(&INT4, 20, undo(5), &refs, 3, false).unwrap();
        let original = ItemRef::parse(&item).unwrap();

        let stamped = with_flags_and_undo(original, flags::DELETED, undo(77));
        let parsed = ItemRef::parse(&stamped).unwrap();

        assert!(parsed.is_array());
        assert!(parsed.flags() & flags::DELETED != 0);
        assert_eq!(parsed.undo_ptr().unwrap(), undo(77));
        assert_eq!(parsed.payload().unwrap(), original.payload().unwrap());
    }

    #[test]
    fn extract_single_from_array_slices_one_element() {
        let values: Vec<[u8; 4]> = (10..15i32).map(|i| i.to_ne_bytes()).collect();
        let refs: Vec<&[u8]> = values.iter().map(|v| &v[..]).collect();
        let item = create_item(&INT4, 100, undo(8), &refs, 5, false).unwrap();
        let parsed = ItemRef::parse(&item).unwrap();

        let single = extract_single(&INT4, parsed, 102).unwrap();
        let sparsed = ItemRef::parse(&single).unwrap();

        assert!(!sparsed.is_array());
        assert_eq!(sparsed.tid(), 102);
        assert_eq!(sparsed.undo_ptr().unwrap(), undo(8));
        assert_eq!(sparsed.payload().unwrap(), &12i32.to_ne_bytes());
    }

    #[test]
    fn extract_single_rejects_uncovered_tid() {
        let item = create_item(&INT4, 5, undo(1), &[&1i32.to_ne_bytes()], 1, false).unwrap();
        let parsed = ItemRef::parse(&item).unwrap();

        assert!(extract_single(&INT4, parsed, 6).is_err());
    }

    #[test]
    fn compressed_container_roundtrip() {
        let item = create_compressed(50, 90, 1000, &[1, 2, 3, 4]);
        let parsed = ItemRef::parse(&item).unwrap();

        assert!(parsed.is_compressed());
        assert_eq!(parsed.tid(), 50);
        assert_eq!(parsed.last_tid(), 90);
        assert_eq!(parsed.uncompressed_size(), 1000);
        assert_eq!(parsed.compressed_payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn parse_rejects_truncated_and_contradictory_items() {
        assert!(ItemRef::parse(&[0u8; 4]).is_err());

        let mut item = create_single(1, INVALID_UNDO_PTR, Some(b"x"), 0);
        item[10..12].copy_from_slice(&(flags::COMPRESSED | flags::ARRAY).to_ne_bytes());
        assert!(ItemRef::parse(&item).is_err());
    }

    #[test]
    fn parse_trims_to_stored_size() {
        let mut buf = create_single(9, undo(2), Some(b"abc"), 0);
        buf.extend_from_slice(&[0xFF; 10]);

        let parsed = ItemRef::parse(&buf).unwrap();
        assert_eq!(parsed.bytes().len(), SINGLE_HEADER_SIZE + 3);
        assert_eq!(parsed.payload().unwrap(), b"abc");
    }

    #[test]
    fn fixed_width_marshalling_validates_length() {
        let result = create_item(&INT4, 1, undo(1), &[b"toolong"], 1, false);
        assert!(result.is_err());
    }
}
