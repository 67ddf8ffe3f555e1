//! # Leaf Mutation Engine
//!
//! Leaves are never edited in place. Every mutation — insert, delete, flag
//! stamp, update — turns the leaf's current content into a normalized list
//! of item images, applies the edit to that list, and rewrites the leaf from
//! scratch (possibly splitting it into a chain of pages). Two passes:
//!
//! **Normalize** walks the existing page slot by slot. The one container
//! covering the target TID is decompressed inline; a covering Array is split
//! at the target (both slices keep the original undo pointer); a covering
//! Single is swapped for the replacement or dropped. Everything else passes
//! through untouched — containers that don't cover the target stay
//! compressed. New items are appended at the tail.
//!
//! **Recompress** streams the normalized list into fresh page images:
//! dead items whose undo counter predates the oldest retained pointer are
//! pruned; already-compressed containers are copied through verbatim; plain
//! items are fed to the compressor against the current page's free space,
//! with flush-and-retry on rejection and uncompressed storage as the last
//! resort. When a page fills, the next item starts a new page whose lokey is
//! that item's first TID.
//!
//! All normalized images live in a per-mutation arena, which unifies the
//! lifetimes of page bytes, decompressor output and caller-built items, and
//! frees everything at once when the mutation ends.

use bumpalo::Bump;
use eyre::{bail, ensure, Result};
use smallvec::{smallvec, SmallVec};

use super::item::{array_slice_len, create_array_from_raw, create_single, AttrDesc, ItemRef};
use super::page::{BtreePage, BtreePageMut};
use crate::compress::{Compressor, Decompressor};
use crate::config::{PAGE_SIZE, SLOT_SIZE};
use crate::mvcc::UndoPtr;
use crate::storage::INVALID_BLOCK;
use crate::tid::{tid_is_valid, ZsTid, INVALID_ZSTID};

/// An edit to apply while normalizing: remove `old_tid` (if valid), put
/// `replacement` in its place (if any), append `new_items` at the tail.
pub struct LeafEdit<'e> {
    pub old_tid: ZsTid,
    pub replacement: Option<&'e [u8]>,
    pub new_items: &'e [Vec<u8>],
}

fn emit<'b>(bump: &'b Bump, bytes: &[u8], out: &mut Vec<&'b [u8]>) {
    out.push(bump.alloc_slice_copy(bytes));
}

/// Builds an array slice of `n` elements starting at `tid` from an
/// already-marshalled payload run, degrading to a Single for `n == 1`.
fn slice_item(tid: ZsTid, undo_ptr: UndoPtr, raw: &[u8], n: usize, isnull: bool) -> Vec<u8> {
    if n == 1 {
        let payload = if isnull { None } else { Some(raw) };
        create_single(tid, undo_ptr, payload, 0)
    } else {
        create_array_from_raw(tid, undo_ptr, n, raw, isnull)
    }
}

fn process_plain<'b>(
    bump: &'b Bump,
    attr: &AttrDesc,
    item: ItemRef<'_>,
    edit: &LeafEdit<'_>,
    out: &mut Vec<&'b [u8]>,
    found_old: &mut bool,
) -> Result<()> {
    let covers = tid_is_valid(edit.old_tid)
        && item.tid() <= edit.old_tid
        && edit.old_tid <= item.last_tid();

    if !covers {
        emit(bump, item.bytes(), out);
        return Ok(());
    }

    ensure!(
        !*found_old,
        "tid {} covered by more than one item",
        edit.old_tid
    );
    *found_old = true;

    if !item.is_array() {
        if let Some(replacement) = edit.replacement {
            emit(bump, replacement, out);
        }
        return Ok(());
    }

    // The target sits inside an array: split around it. Both slices share
    // the original undo pointer, so the other TIDs keep their history.
    let isnull = item.is_null();
    let undo_ptr = item.undo_ptr()?;
    let nelements = item.nelements() as usize;
    let payload = item.payload()?;
    let cutoff = (edit.old_tid - item.tid()) as usize;

    let mut pos = 0;
    if cutoff > 0 {
        let len = array_slice_len(attr, isnull, payload, cutoff)?;
        let left = slice_item(item.tid(), undo_ptr, &payload[..len], cutoff, isnull);
        emit(bump, &left, out);
        pos = len;
    }

    // Skip the target element itself.
    pos += array_slice_len(attr, isnull, &payload[pos..], 1)?;

    if let Some(replacement) = edit.replacement {
        emit(bump, replacement, out);
    }

    let right_n = nelements - cutoff - 1;
    if right_n > 0 {
        let len = array_slice_len(attr, isnull, &payload[pos..], right_n)?;
        let right = slice_item(
            edit.old_tid + 1,
            undo_ptr,
            &payload[pos..pos + len],
            right_n,
            isnull,
        );
        emit(bump, &right, out);
    }

    Ok(())
}

/// Normalization pass: the leaf's post-edit logical content as a flat list
/// of item images. Containers not touched by the edit remain compressed.
pub fn normalize_items<'b>(
    bump: &'b Bump,
    attr: &AttrDesc,
    page: &BtreePage<'_>,
    edit: &LeafEdit<'_>,
) -> Result<Vec<&'b [u8]>> {
    if let Some(replacement) = edit.replacement {
        let r = ItemRef::parse(replacement)?;
        ensure!(
            r.tid() == edit.old_tid,
            "replacement tid {} != target tid {}",
            r.tid(),
            edit.old_tid
        );
    }

    let mut out = Vec::with_capacity(page.nitems() + edit.new_items.len());
    let mut found_old = false;
    let mut decompressor_used = false;

    for index in 0..page.nitems() {
        let item = ItemRef::parse(page.item(index)?)?;

        if item.is_compressed() {
            let covers = tid_is_valid(edit.old_tid)
                && item.tid() <= edit.old_tid
                && edit.old_tid <= item.last_tid();
            if !covers {
                emit(bump, item.bytes(), &mut out);
                continue;
            }

            // Containers are disjoint, so at most one covers the target.
            ensure!(
                !decompressor_used,
                "tid {} covered by more than one container",
                edit.old_tid
            );
            decompressor_used = true;

            let mut decompressor = Decompressor::new();
            decompressor.chunk(item)?;
            while let Some(bytes) = decompressor.read_item() {
                let inner = ItemRef::parse(bytes)?;
                process_plain(bump, attr, inner, edit, &mut out, &mut found_old)?;
            }
        } else {
            process_plain(bump, attr, item, edit, &mut out, &mut found_old)?;
        }
    }

    if tid_is_valid(edit.old_tid) && !found_old {
        bail!(
            "could not find old item to replace for tid {}",
            edit.old_tid
        );
    }

    for new_item in edit.new_items {
        ItemRef::parse(new_item)?;
        emit(bump, new_item, &mut out);
    }

    debug_assert!(
        out.windows(2).all(|w| {
            let a = ItemRef::parse(w[0]).unwrap();
            let b = ItemRef::parse(w[1]).unwrap();
            a.last_tid() < b.tid()
        }),
        "normalized items out of order or overlapping"
    );

    Ok(out)
}

/// Recompression pass: streams a normalized item list into one or more
/// fresh page images. Each image's lokey/hikey chain is already stitched;
/// right-sibling links and FOLLOW_RIGHT are wired by the caller once block
/// numbers exist.
pub struct Recompressor<'o> {
    attno: u16,
    hikey: ZsTid,
    pages: SmallVec<[Vec<u8>; 2]>,
    compressor: Compressor,
    compressed_items: usize,
    oldest_retained: Option<UndoPtr>,
    fetch_oldest: &'o mut dyn FnMut() -> Result<UndoPtr>,
}

impl<'o> Recompressor<'o> {
    pub fn new(
        attno: u16,
        lokey: ZsTid,
        hikey: ZsTid,
        fetch_oldest: &'o mut dyn FnMut() -> Result<UndoPtr>,
    ) -> Result<Self> {
        let mut recompressor = Self {
            attno,
            hikey,
            pages: smallvec![],
            compressor: Compressor::new(),
            compressed_items: 0,
            oldest_retained: None,
            fetch_oldest,
        };
        recompressor.new_page(lokey)?;
        Ok(recompressor)
    }

    fn new_page(&mut self, lokey: ZsTid) -> Result<()> {
        if let Some(prev) = self.pages.last_mut() {
            BtreePageMut::from_page(prev)?.trailer_mut().set_hikey(lokey);
        }

        let mut image = vec![0u8; PAGE_SIZE];
        BtreePageMut::init(
            &mut image,
            self.attno,
            0,
            lokey,
            self.hikey,
            INVALID_BLOCK,
            0,
        )?;
        self.pages.push(image);
        Ok(())
    }

    fn curr_free_space(&self) -> usize {
        let page = BtreePage::from_page(self.pages.last().expect("one page always exists"))
            .expect("recompressor images are valid pages");
        page.free_space()
    }

    fn add_to_page(&mut self, bytes: &[u8]) -> Result<()> {
        if self.curr_free_space() < bytes.len() + SLOT_SIZE {
            let tid = ItemRef::parse(bytes)?.tid();
            self.new_page(tid)?;
        }
        let data = self.pages.last_mut().expect("one page always exists");
        BtreePageMut::from_page(data)?.add_item(bytes)
    }

    fn add_to_compressor(&mut self, item: ItemRef<'_>) -> Result<bool> {
        if self.compressed_items == 0 {
            let budget = self.curr_free_space().saturating_sub(SLOT_SIZE);
            self.compressor.begin(budget);
        }
        let added = self.compressor.add(item)?;
        if added {
            self.compressed_items += 1;
        }
        Ok(added)
    }

    fn flush(&mut self) -> Result<()> {
        if self.compressed_items == 0 {
            return Ok(());
        }
        let container = self.compressor.finish()?;
        self.compressed_items = 0;
        self.add_to_page(&container)
    }

    /// Dead items are dropped once their whole history is older than any
    /// retained snapshot. The horizon is fetched lazily, once per rewrite.
    fn is_prunable(&mut self, item: ItemRef<'_>) -> Result<bool> {
        if !item.is_dead() {
            return Ok(false);
        }
        let oldest = match self.oldest_retained {
            Some(ptr) => ptr,
            None => {
                let ptr = (self.fetch_oldest)()?;
                self.oldest_retained = Some(ptr);
                ptr
            }
        };
        Ok(item.undo_ptr()?.counter < oldest.counter)
    }

    pub fn add(&mut self, bytes: &[u8]) -> Result<()> {
        let item = ItemRef::parse(bytes)?;

        if item.is_compressed() {
            // Passes through verbatim; flush first to keep TID order.
            self.flush()?;
            return self.add_to_page(bytes);
        }

        if self.is_prunable(item)? {
            return Ok(());
        }

        if self.add_to_compressor(item)? {
            return Ok(());
        }
        if self.compressed_items > 0 {
            self.flush()?;
            if self.add_to_compressor(item)? {
                return Ok(());
            }
        }
        // Does not compress into the page's budget even alone: store it
        // uncompressed (on a fresh page if need be).
        self.add_to_page(bytes)
    }

    pub fn finish(mut self) -> Result<SmallVec<[Vec<u8>; 2]>> {
        self.flush()?;
        Ok(self.pages)
    }
}

/// Runs the full Step B over a normalized list.
pub fn recompress_items(
    attno: u16,
    lokey: ZsTid,
    hikey: ZsTid,
    items: &[&[u8]],
    fetch_oldest: &mut dyn FnMut() -> Result<UndoPtr>,
) -> Result<SmallVec<[Vec<u8>; 2]>> {
    let mut recompressor = Recompressor::new(attno, lokey, hikey, fetch_oldest)?;
    for bytes in items {
        recompressor.add(bytes)?;
    }
    recompressor.finish()
}

/// Convenience for pure inserts.
pub fn pure_insert_edit(new_items: &[Vec<u8>]) -> LeafEdit<'_> {
    LeafEdit {
        old_tid: INVALID_ZSTID,
        replacement: None,
        new_items,
    }
}
