//! # B-Tree Page Layout
//!
//! Every b-tree page carries a 28-byte trailer at its very end and a 6-byte
//! slot-directory header at its front:
//!
//! ```text
//! +------------------------------+ 0
//! | DirHeader (6 B)              |   nslots, free_end
//! +------------------------------+ 6
//! | Slot 0 (4 B) | Slot 1 | ...  |   offset + len per item, logical order
//! +------------------------------+
//! | Free space                   |
//! +------------------------------+ free_end
//! | Item content                 |   grows down from the trailer
//! +------------------------------+ PAGE_SIZE - 28
//! | PageTrailer (28 B)           |
//! +------------------------------+ PAGE_SIZE
//! ```
//!
//! ## Trailer
//!
//! ```text
//! Offset  Size  Field     Description
//! ------  ----  --------  ------------------------------------------
//! 0       2     attno     Attribute this tree belongs to
//! 2       2     flags     FOLLOW_RIGHT = incomplete split
//! 4       4     next      Right sibling block (INVALID_BLOCK if none)
//! 8       8     lokey     Inclusive lower TID bound
//! 16      8     hikey     Exclusive upper TID bound
//! 24      2     level     0 = leaf
//! 26      2     page_id   BTREE_PAGE_ID discriminator
//! ```
//!
//! Fields are native-endian. Leaf pages put item images in the slot
//! directory; internal pages keep a dense downlink array in the content area
//! instead (see `internal`).
//!
//! Slots are stored in logical (TID) order; content placement is arbitrary.
//! Pages are only rewritten wholesale by recompression, so there is no
//! per-page fragmentation bookkeeping.

use eyre::{ensure, Result};
use zerocopy::byteorder::{NativeEndian, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{BTREE_PAGE_ID, PAGE_HEADER_SIZE, PAGE_SIZE, PAGE_TRAILER_SIZE, SLOT_SIZE};
use crate::storage::BlockNumber;
use crate::tid::ZsTid;

/// Page flag bits.
pub mod page_flags {
    /// A split completed at this page but the parent holds no downlink for
    /// the right sibling yet. Whoever reaches this page next and needs the
    /// parent must finish the split first.
    pub const FOLLOW_RIGHT: u16 = 0x01;
}

pub const CONTENT_END: usize = PAGE_SIZE - PAGE_TRAILER_SIZE;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageTrailer {
    attno: U16<NativeEndian>,
    flags: U16<NativeEndian>,
    next: U32<NativeEndian>,
    lokey: U64<NativeEndian>,
    hikey: U64<NativeEndian>,
    level: U16<NativeEndian>,
    page_id: U16<NativeEndian>,
}

impl PageTrailer {
    pub fn attno(&self) -> u16 {
        self.attno.get()
    }

    pub fn flags(&self) -> u16 {
        self.flags.get()
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.flags = U16::new(flags);
    }

    pub fn follow_right(&self) -> bool {
        self.flags.get() & page_flags::FOLLOW_RIGHT != 0
    }

    pub fn next(&self) -> BlockNumber {
        self.next.get()
    }

    pub fn set_next(&mut self, next: BlockNumber) {
        self.next = U32::new(next);
    }

    pub fn lokey(&self) -> ZsTid {
        self.lokey.get()
    }

    pub fn set_lokey(&mut self, lokey: ZsTid) {
        self.lokey = U64::new(lokey);
    }

    pub fn hikey(&self) -> ZsTid {
        self.hikey.get()
    }

    pub fn set_hikey(&mut self, hikey: ZsTid) {
        self.hikey = U64::new(hikey);
    }

    pub fn level(&self) -> u16 {
        self.level.get()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct DirHeader {
    nslots: U16<NativeEndian>,
    free_end: U16<NativeEndian>,
    reserved: U16<NativeEndian>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct Slot {
    offset: U16<NativeEndian>,
    len: U16<NativeEndian>,
}

/// Read view of a b-tree page.
#[derive(Debug, Clone, Copy)]
pub struct BtreePage<'a> {
    data: &'a [u8],
}

impl<'a> BtreePage<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        let page = Self { data };
        ensure!(
            page.trailer().page_id.get() == BTREE_PAGE_ID,
            "expected b-tree page, got page id {:04x}",
            page.trailer().page_id.get()
        );
        Ok(page)
    }

    pub fn trailer(&self) -> &'a PageTrailer {
        PageTrailer::ref_from_bytes(&self.data[CONTENT_END..]).unwrap()
    }

    fn dir(&self) -> &'a DirHeader {
        DirHeader::ref_from_bytes(&self.data[..PAGE_HEADER_SIZE]).unwrap()
    }

    pub fn is_leaf(&self) -> bool {
        self.trailer().level() == 0
    }

    pub fn nitems(&self) -> usize {
        self.dir().nslots.get() as usize
    }

    fn slot(&self, index: usize) -> Result<&'a Slot> {
        ensure!(
            index < self.nitems(),
            "slot index {} out of bounds (nitems={})",
            index,
            self.nitems()
        );
        let offset = PAGE_HEADER_SIZE + index * SLOT_SIZE;
        Slot::ref_from_bytes(&self.data[offset..offset + SLOT_SIZE])
            .map_err(|e| eyre::eyre!("failed to read slot {}: {:?}", index, e))
    }

    /// Raw bytes of item `index`.
    pub fn item(&self, index: usize) -> Result<&'a [u8]> {
        let slot = self.slot(index)?;
        let start = slot.offset.get() as usize;
        let end = start + slot.len.get() as usize;
        ensure!(
            start >= PAGE_HEADER_SIZE && end <= CONTENT_END,
            "item {} extends outside content area: [{}, {})",
            index,
            start,
            end
        );
        Ok(&self.data[start..end])
    }

    /// Content area of an internal page (the dense downlink array).
    pub fn content(&self) -> &'a [u8] {
        &self.data[PAGE_HEADER_SIZE..CONTENT_END]
    }

    pub fn free_space(&self) -> usize {
        let used_front = PAGE_HEADER_SIZE + self.nitems() * SLOT_SIZE;
        self.dir().free_end.get() as usize - used_front
    }
}

/// Write view of a b-tree page.
pub struct BtreePageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> BtreePageMut<'a> {
    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        BtreePage::from_page(data)?;
        Ok(Self { data })
    }

    /// Formats `data` as an empty b-tree page.
    pub fn init(
        data: &'a mut [u8],
        attno: u16,
        level: u16,
        lokey: ZsTid,
        hikey: ZsTid,
        next: BlockNumber,
        flags: u16,
    ) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        data.fill(0);

        let dir = DirHeader {
            nslots: U16::new(0),
            free_end: U16::new(CONTENT_END as u16),
            reserved: U16::new(0),
        };
        data[..PAGE_HEADER_SIZE].copy_from_slice(dir.as_bytes());

        let trailer = PageTrailer {
            attno: U16::new(attno),
            flags: U16::new(flags),
            next: U32::new(next),
            lokey: U64::new(lokey),
            hikey: U64::new(hikey),
            level: U16::new(level),
            page_id: U16::new(BTREE_PAGE_ID),
        };
        data[CONTENT_END..].copy_from_slice(trailer.as_bytes());

        Ok(Self { data })
    }

    pub fn as_read(&self) -> BtreePage<'_> {
        BtreePage { data: self.data }
    }

    pub fn trailer_mut(&mut self) -> &mut PageTrailer {
        PageTrailer::mut_from_bytes(&mut self.data[CONTENT_END..]).unwrap()
    }

    fn dir_mut(&mut self) -> &mut DirHeader {
        DirHeader::mut_from_bytes(&mut self.data[..PAGE_HEADER_SIZE]).unwrap()
    }

    pub fn nitems(&self) -> usize {
        self.as_read().nitems()
    }

    pub fn free_space(&self) -> usize {
        self.as_read().free_space()
    }

    /// Appends an item after the current last slot. Items must be appended
    /// in ascending TID order; recompression guarantees that.
    pub fn add_item(&mut self, item: &[u8]) -> Result<()> {
        let need = item.len() + SLOT_SIZE;
        ensure!(
            self.free_space() >= need,
            "not enough free space for item: need {}, have {}",
            need,
            self.free_space()
        );

        let nslots = self.nitems();
        let new_free_end = self.as_read().dir().free_end.get() as usize - item.len();
        self.data[new_free_end..new_free_end + item.len()].copy_from_slice(item);

        let slot = Slot {
            offset: U16::new(new_free_end as u16),
            len: U16::new(item.len() as u16),
        };
        let slot_offset = PAGE_HEADER_SIZE + nslots * SLOT_SIZE;
        self.data[slot_offset..slot_offset + SLOT_SIZE].copy_from_slice(slot.as_bytes());

        let dir = self.dir_mut();
        dir.nslots = U16::new(nslots as u16 + 1);
        dir.free_end = U16::new(new_free_end as u16);

        Ok(())
    }

    /// Mutable content area of an internal page.
    pub fn content_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HEADER_SIZE..CONTENT_END]
    }

    /// Downlink count setter for internal pages, which reuse the slot count
    /// as their item count.
    pub fn set_nitems(&mut self, n: usize) {
        self.dir_mut().nslots = U16::new(n as u16);
    }
}
