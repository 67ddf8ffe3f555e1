//! # Internal Pages
//!
//! An internal page's content area is a dense, TID-sorted array of downlinks:
//!
//! ```text
//! InternalItem (12 bytes):
//! +--------------------+------------------+
//! | tid u64            | childblk u32     |
//! +--------------------+------------------+
//! ```
//!
//! `tid[0]` equals the page's lokey; a child's lokey equals its downlink tid;
//! `tid[i+1]` equals child i's hikey. For a search key `k`, descend to the
//! child at the largest `i` with `tid[i] <= k`.
//!
//! The slot count field in the page directory is reused as the downlink
//! count; internal pages have no slot directory.

use eyre::{ensure, Result};
use zerocopy::byteorder::{NativeEndian, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::page::{BtreePage, BtreePageMut, CONTENT_END};
use crate::config::PAGE_HEADER_SIZE;
use crate::storage::BlockNumber;
use crate::tid::ZsTid;

pub const INTERNAL_ITEM_SIZE: usize = 12;

/// Downlinks that fit one internal page.
pub const MAX_INTERNAL_ITEMS: usize = (CONTENT_END - PAGE_HEADER_SIZE) / INTERNAL_ITEM_SIZE;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, PartialEq, Eq)]
pub struct InternalItem {
    pub tid: U64<NativeEndian>,
    pub childblk: U32<NativeEndian>,
}

impl InternalItem {
    pub fn new(tid: ZsTid, childblk: BlockNumber) -> Self {
        Self {
            tid: U64::new(tid),
            childblk: U32::new(childblk),
        }
    }
}

/// Read view of an internal page's downlink array.
#[derive(Debug, Clone, Copy)]
pub struct InternalPage<'a> {
    page: BtreePage<'a>,
}

impl<'a> InternalPage<'a> {
    pub fn from_page(page: BtreePage<'a>) -> Result<Self> {
        ensure!(
            !page.is_leaf(),
            "expected internal page, got leaf (attno {})",
            page.trailer().attno()
        );
        Ok(Self { page })
    }

    pub fn nitems(&self) -> usize {
        self.page.nitems()
    }

    pub fn items(&self) -> &'a [InternalItem] {
        let bytes = &self.page.content()[..self.nitems() * INTERNAL_ITEM_SIZE];
        <[InternalItem]>::ref_from_bytes(bytes).unwrap()
    }

    /// Index of the downlink covering `key`: the largest `i` with
    /// `tid[i] <= key`. `None` when `key` sorts before every downlink.
    pub fn binsrch(&self, key: ZsTid) -> Option<usize> {
        let items = self.items();
        let mut low = 0;
        let mut high = items.len();
        while high > low {
            let mid = low + (high - low) / 2;
            if key >= items[mid].tid.get() {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low.checked_sub(1)
    }

    pub fn is_full(&self) -> bool {
        self.nitems() >= MAX_INTERNAL_ITEMS
    }
}

/// Write view of an internal page's downlink array.
pub struct InternalPageMut<'a> {
    page: BtreePageMut<'a>,
}

impl<'a> InternalPageMut<'a> {
    pub fn from_page(page: BtreePageMut<'a>) -> Result<Self> {
        ensure!(!page.as_read().is_leaf(), "expected internal page, got leaf");
        Ok(Self { page })
    }

    pub fn as_read(&self) -> InternalPage<'_> {
        InternalPage {
            page: self.page.as_read(),
        }
    }

    pub fn page_mut(&mut self) -> &mut BtreePageMut<'a> {
        &mut self.page
    }

    pub fn nitems(&self) -> usize {
        self.page.nitems()
    }

    fn items_mut(&mut self, n: usize) -> &mut [InternalItem] {
        let bytes = &mut self.page.content_mut()[..n * INTERNAL_ITEM_SIZE];
        <[InternalItem]>::mut_from_bytes(bytes).unwrap()
    }

    /// Inserts a downlink at `index`, shifting later entries right.
    pub fn insert_downlink_at(
        &mut self,
        index: usize,
        tid: ZsTid,
        childblk: BlockNumber,
    ) -> Result<()> {
        let n = self.nitems();
        ensure!(
            n < MAX_INTERNAL_ITEMS,
            "internal page is full ({} downlinks)",
            n
        );
        ensure!(
            index <= n,
            "downlink index {} out of bounds (nitems={})",
            index,
            n
        );

        let items = self.items_mut(n + 1);
        items.copy_within(index..n, index + 1);
        items[index] = InternalItem::new(tid, childblk);
        self.page.set_nitems(n + 1);

        Ok(())
    }

    /// Replaces the whole downlink array.
    pub fn replace_items(&mut self, new_items: &[InternalItem]) -> Result<()> {
        ensure!(
            new_items.len() <= MAX_INTERNAL_ITEMS,
            "{} downlinks exceed internal page capacity {}",
            new_items.len(),
            MAX_INTERNAL_ITEMS
        );
        self.items_mut(new_items.len()).copy_from_slice(new_items);
        self.page.set_nitems(new_items.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::storage::INVALID_BLOCK;

    fn internal_page(data: &mut [u8], downlinks: &[(ZsTid, BlockNumber)]) -> Result<()> {
        let page = BtreePageMut::init(data, 1, 1, 1, 1000, INVALID_BLOCK, 0)?;
        let mut internal = InternalPageMut::from_page(page)?;
        let items: Vec<InternalItem> = downlinks
            .iter()
            .map(|&(tid, blk)| InternalItem::new(tid, blk))
            .collect();
        internal.replace_items(&items)
    }

    #[test]
    fn items_roundtrip() {
        let mut data = vec![0u8; PAGE_SIZE];
        internal_page(&mut data, &[(1, 10), (50, 11), (90, 12)]).unwrap();

        let page = InternalPage::from_page(BtreePage::from_page(&data).unwrap()).unwrap();
        assert_eq!(page.nitems(), 3);
        assert_eq!(page.items()[1], InternalItem::new(50, 11));
    }

    #[test]
    fn leaf_pages_are_rejected() {
        let mut data = vec![0u8; PAGE_SIZE];
        BtreePageMut::init(&mut data, 1, 0, 1, 1000, INVALID_BLOCK, 0).unwrap();

        let result = InternalPage::from_page(BtreePage::from_page(&data).unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn binsrch_finds_covering_downlink() {
        let mut data = vec![0u8; PAGE_SIZE];
        internal_page(&mut data, &[(1, 10), (50, 11), (90, 12)]).unwrap();
        let page = InternalPage::from_page(BtreePage::from_page(&data).unwrap()).unwrap();

        assert_eq!(page.binsrch(0), None);
        assert_eq!(page.binsrch(1), Some(0));
        assert_eq!(page.binsrch(49), Some(0));
        assert_eq!(page.binsrch(50), Some(1));
        assert_eq!(page.binsrch(89), Some(1));
        assert_eq!(page.binsrch(90), Some(2));
        assert_eq!(page.binsrch(u64::MAX), Some(2));
    }

    #[test]
    fn insert_downlink_keeps_sort_order() {
        let mut data = vec![0u8; PAGE_SIZE];
        internal_page(&mut data, &[(1, 10), (90, 12)]).unwrap();

        {
            let page = BtreePageMut::from_page(&mut data).unwrap();
            let mut internal = InternalPageMut::from_page(page).unwrap();
            internal.insert_downlink_at(1, 50, 11).unwrap();
        }

        let page = InternalPage::from_page(BtreePage::from_page(&data).unwrap()).unwrap();
        let tids: Vec<ZsTid> = page.items().iter().map(|i| i.tid.get()).collect();
        assert_eq!(tids, vec![1, 50, 90]);
        assert_eq!(page.items()[1].childblk.get(), 11);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut data = vec![0u8; PAGE_SIZE];
        let downlinks: Vec<(ZsTid, BlockNumber)> = (0..MAX_INTERNAL_ITEMS)
            .map(|i| (i as ZsTid + 1, i as BlockNumber))
            .collect();
        internal_page(&mut data, &downlinks).unwrap();

        let page = BtreePageMut::from_page(&mut data).unwrap();
        let read = InternalPage::from_page(page.as_read()).unwrap();
        assert!(read.is_full());

        let mut internal = InternalPageMut::from_page(page).unwrap();
        let result = internal.insert_downlink_at(0, 0, 99);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("full"));
    }
}
