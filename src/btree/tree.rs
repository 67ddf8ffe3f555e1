//! # Attribute Trees
//!
//! A table is a forest of b-trees, one per attribute, all keyed by the same
//! 48-bit TID. `ZedStore` ties one table's trees to their collaborators (the
//! buffer pool, the undo log, the WAL and the transaction registry) and
//! exposes the per-tree operations: multi-insert, delete, update, tuple
//! lock, dead-marking, point lookup and TID allocation. Scans live in
//! `scan`.
//!
//! ## Concurrency protocol
//!
//! Lehman-Yao style. Locking order is child before parent, left before
//! right. Descent holds one latch at a time; a reader or writer that finds
//! `key >= hikey` after latching follows the right sibling, which makes
//! concurrent splits invisible to it. Only the brief parent-update step of
//! `insert_downlink` holds a child latch while acquiring the parent.
//!
//! A split writes the child chain first (every non-last page carries
//! FOLLOW_RIGHT) and installs parent downlinks afterwards, re-finding the
//! parent from the root via the left page's lokey. A crash between the two
//! steps leaves FOLLOW_RIGHT set; any writer that reaches such a page
//! finishes the split before applying its own change.
//!
//! ## Mutation shape
//!
//! All leaf mutations funnel through `replace_item`: normalize the leaf
//! content, apply the edit, recompress into fresh images, install the
//! images under one WAL batch, then wire up downlinks for any new pages.

use bumpalo::Bump;
use eyre::{bail, ensure, Result};

use super::internal::{InternalItem, InternalPage, InternalPageMut};
use super::item::{
    create_item, create_single, datum_stored_len, flags, read_datum, with_flags_and_undo,
    AttrDesc, ItemRef,
};
use super::leaf::{normalize_items, recompress_items, LeafEdit};
use super::page::{page_flags, BtreePage, BtreePageMut};
use crate::compress::Decompressor;
use crate::config::{MAX_ARRAY_BYTES, MAX_DATUM_SIZE};
use crate::meta;
use crate::mvcc::{
    CommandId, LockMode, Snapshot, TransactionRegistry, TxnId, UndoLog, UndoOp, UndoPtr,
    UndoRecord, UpdateResult, VisibilityChecker, WaitPolicy, INVALID_UNDO_PTR,
};
use crate::storage::{BlockNumber, BufferPool, PageWriteGuard, Wal, INVALID_BLOCK};
use crate::tid::{tid_is_valid, ZsTid, INVALID_ZSTID, MAX_PLUS_ONE_ZSTID, MAX_ZSTID, MIN_ZSTID};

/// One materialized tuple, as returned by point lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedTuple {
    pub tid: ZsTid,
    pub flags: u16,
    pub undo_ptr: UndoPtr,
    /// Unmarshalled value bytes; `None` for NULL.
    pub datum: Option<Vec<u8>>,
}

/// One table's attribute-tree forest plus its collaborators.
pub struct ZedStore<U: UndoLog, W: Wal> {
    pool: BufferPool,
    undo: U,
    wal: W,
    registry: TransactionRegistry,
}

impl<U: UndoLog, W: Wal> ZedStore<U, W> {
    /// Creates an empty table: a buffer pool holding just the metapage.
    pub fn create(undo: U, wal: W) -> Result<Self> {
        let pool = BufferPool::new();
        meta::init_metapage(&pool)?;
        Ok(Self {
            pool,
            undo,
            wal,
            registry: TransactionRegistry::new(),
        })
    }

    /// Opens a table from an already-populated buffer pool.
    pub fn open(pool: BufferPool, undo: U, wal: W) -> Result<Self> {
        ensure!(pool.page_count() > 0, "table file has no metapage");
        Ok(Self {
            pool,
            undo,
            wal,
            registry: TransactionRegistry::new(),
        })
    }

    pub fn create_attribute(&self, attno: u16, attr: AttrDesc) -> Result<()> {
        meta::register_attribute(&self.pool, attno, attr)
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn undo(&self) -> &U {
        &self.undo
    }

    pub fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    pub fn checker(&self) -> VisibilityChecker<'_, U> {
        VisibilityChecker::new(&self.undo, &self.registry)
    }

    pub(crate) fn root_for(&self, attno: u16, create: bool) -> Result<(BlockNumber, AttrDesc)> {
        meta::root_for(&self.pool, &self.wal, attno, create)
    }

    // ------------------------------------------------------------------
    // Descent
    // ------------------------------------------------------------------

    /// Walks from `root` to the leaf covering `key`. Returns the pinned,
    /// unlatched leaf; callers latch in their own mode and re-check hikey.
    pub(crate) fn descend(
        &self,
        root: BlockNumber,
        key: ZsTid,
    ) -> Result<crate::storage::PinnedBuf> {
        let mut next = root;
        let mut expected_level: Option<u16> = None;

        loop {
            let buf = self.pool.read(next)?;
            let guard = buf.read();
            let page = BtreePage::from_page(&guard)?;
            let trailer = page.trailer();

            match expected_level {
                None => expected_level = Some(trailer.level()),
                Some(level) => ensure!(
                    trailer.level() == level,
                    "unexpected level {} (wanted {}) descending at block {}",
                    trailer.level(),
                    level,
                    buf.block()
                ),
            }

            // Concurrent split: the keyspace moved right.
            if key >= trailer.hikey() {
                let right = trailer.next();
                ensure!(
                    right != INVALID_BLOCK,
                    "fell off the end of the tree for tid {}",
                    key
                );
                ensure!(
                    right != buf.block(),
                    "page {} right-link points to itself",
                    buf.block()
                );
                next = right;
                continue;
            }

            if trailer.level() == 0 {
                drop(guard);
                return Ok(buf);
            }

            let internal = InternalPage::from_page(page)?;
            let index = internal
                .binsrch(key)
                .ok_or_else(|| eyre::eyre!("could not descend tree for tid {}", key))?;
            next = internal.items()[index].childblk.get();
            expected_level = Some(trailer.level() - 1);
        }
    }

    /// Descends to the leaf covering `key` and latches it exclusively,
    /// walking right as needed after each latch.
    fn lock_leaf_exclusive(&self, root: BlockNumber, key: ZsTid) -> Result<PageWriteGuard> {
        let mut buf = self.descend(root, key)?;
        loop {
            let guard = buf.write();
            let page = BtreePage::from_page(&guard)?;
            let trailer = page.trailer();
            ensure!(
                trailer.level() == 0,
                "descended to non-leaf page {}",
                guard.block()
            );

            if key >= trailer.hikey() {
                let right = trailer.next();
                ensure!(
                    right != INVALID_BLOCK,
                    "fell off the end of the tree for tid {}",
                    key
                );
                ensure!(
                    right != guard.block(),
                    "page {} right-link points to itself",
                    guard.block()
                );
                drop(guard);
                buf = self.pool.read(right)?;
                continue;
            }

            return Ok(guard);
        }
    }

    // ------------------------------------------------------------------
    // Leaf mutation (Steps B-D around the normalize pass)
    // ------------------------------------------------------------------

    /// Rewrites a latched leaf with `edit` applied, splitting into a page
    /// chain when the content no longer fits, and installs downlinks for
    /// every page the split produced. Consumes (and releases) the latch.
    pub(crate) fn replace_item(
        &self,
        attno: u16,
        attr: &AttrDesc,
        mut leaf: PageWriteGuard,
        edit: &LeafEdit<'_>,
    ) -> Result<()> {
        let (lokey, hikey, orig_next, orig_follow_right) = {
            let page = BtreePage::from_page(&leaf)?;
            let t = page.trailer();
            (t.lokey(), t.hikey(), t.next(), t.follow_right())
        };

        let bump = Bump::new();
        let images = {
            let page = BtreePage::from_page(&leaf)?;
            let items = normalize_items(&bump, attr, &page, edit)?;
            let mut fetch_oldest = || Ok(self.undo.oldest_retained_ptr());
            recompress_items(attno, lokey, hikey, &items, &mut fetch_oldest)?
        };

        // Install the images: the first overwrites the original buffer, the
        // rest get fresh pages. All writes land in one WAL batch.
        let mut guards: Vec<PageWriteGuard> = Vec::with_capacity(images.len());
        leaf.copy_from_slice(&images[0]);
        guards.push(leaf);
        for image in images.iter().skip(1) {
            let buf = self.pool.alloc_new()?;
            let mut guard = buf.write();
            guard.copy_from_slice(image);
            guards.push(guard);
        }

        let last = guards.len() - 1;
        for index in 0..guards.len() {
            let next_blk = if index < last {
                guards[index + 1].block()
            } else {
                orig_next
            };
            let split_pending = index < last || orig_follow_right;
            let mut page = BtreePageMut::from_page(&mut guards[index])?;
            let trailer = page.trailer_mut();
            trailer.set_next(next_blk);
            if split_pending {
                trailer.set_flags(trailer.flags() | page_flags::FOLLOW_RIGHT);
            }
        }

        let batch: Vec<(BlockNumber, &[u8])> =
            guards.iter().map(|g| (g.block(), &g[..])).collect();
        self.wal.log_page_images(&batch)?;
        drop(batch);

        // Downlink installation, left to right. Each call consumes the left
        // latch; the last page's latch is either consumed by repairing an
        // inherited incomplete split or dropped here.
        let mut iter = guards.into_iter();
        let mut left = iter.next().expect("at least one page image");
        for right in iter {
            let right_blk = right.block();
            let right_lokey = BtreePage::from_page(&right)?.trailer().lokey();
            self.insert_downlink(left, right_lokey, right_blk)?;
            left = right;
        }
        if orig_follow_right {
            self.insert_downlink(left, hikey, orig_next)?;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Structural maintenance
    // ------------------------------------------------------------------

    /// Re-finds the parent holding the downlink for `(childblk, key)` and
    /// returns it exclusively latched, together with the downlink's index.
    /// `None` when `childblk` is the root.
    fn find_downlink(
        &self,
        attno: u16,
        key: ZsTid,
        childblk: BlockNumber,
        child_level: u16,
    ) -> Result<Option<(PageWriteGuard, usize)>> {
        let (root, _) = self.root_for(attno, false)?;
        ensure!(root != INVALID_BLOCK, "tree for attribute {} has no root", attno);
        if root == childblk {
            return Ok(None);
        }

        let mut next = root;
        let mut expected_level: Option<u16> = None;

        loop {
            let buf = self.pool.read(next)?;
            let guard = buf.write();
            let page = BtreePage::from_page(&guard)?;
            let trailer = page.trailer();

            match expected_level {
                None => expected_level = Some(trailer.level()),
                Some(level) => ensure!(
                    trailer.level() == level,
                    "unexpected level {} (wanted {}) re-finding downlink",
                    trailer.level(),
                    level
                ),
            }
            ensure!(
                trailer.level() > child_level,
                "unexpected page level {} re-finding downlink for block {}",
                trailer.level(),
                childblk
            );

            if key >= trailer.hikey() {
                let right = trailer.next();
                ensure!(
                    right != INVALID_BLOCK,
                    "fell off the end of the tree re-finding downlink for block {}",
                    childblk
                );
                next = right;
                continue;
            }

            let internal = InternalPage::from_page(page)?;
            let index = internal
                .binsrch(key)
                .ok_or_else(|| eyre::eyre!("could not descend re-finding downlink"))?;

            if trailer.level() == child_level + 1 {
                ensure!(
                    internal.items()[index].childblk.get() == childblk,
                    "could not re-find downlink for block {}",
                    childblk
                );
                return Ok(Some((guard, index)));
            }

            next = internal.items()[index].childblk.get();
            expected_level = Some(trailer.level() - 1);
        }
    }

    /// After a split, inserts the downlink for `rightblk` into the parent
    /// of the page behind `left`. Consumes (and releases) the left latch.
    /// Splits the parent, grows a new root, and finishes any incomplete
    /// split it encounters on the way.
    pub(crate) fn insert_downlink(
        &self,
        left: PageWriteGuard,
        right_lokey: ZsTid,
        rightblk: BlockNumber,
    ) -> Result<()> {
        let (attno, left_lokey, left_level) = {
            let page = BtreePage::from_page(&left)?;
            let t = page.trailer();
            (t.attno(), t.lokey(), t.level())
        };
        let leftblk = left.block();

        loop {
            let (parent, index) =
                match self.find_downlink(attno, left_lokey, leftblk, left_level)? {
                    None => return self.new_root(left, right_lokey, rightblk),
                    Some(found) => found,
                };

            // An incomplete split on the parent must be finished before the
            // parent can take a new downlink; then re-find.
            let parent_trailer = *BtreePage::from_page(&parent)?.trailer();
            if parent_trailer.follow_right() {
                self.insert_downlink(parent, parent_trailer.hikey(), parent_trailer.next())?;
                continue;
            }

            let (downlink_tid, parent_full) = {
                let internal = InternalPage::from_page(BtreePage::from_page(&parent)?)?;
                (internal.items()[index].tid.get(), internal.is_full())
            };
            ensure!(
                downlink_tid == left_lokey,
                "downlink tid {} does not match left page lokey {}",
                downlink_tid,
                left_lokey
            );

            if parent_full {
                return self.split_internal(parent, left, index + 1, right_lokey, rightblk);
            }

            let mut parent = parent;
            let mut left = left;
            {
                let page = BtreePageMut::from_page(&mut parent)?;
                let mut internal = InternalPageMut::from_page(page)?;
                internal.insert_downlink_at(index + 1, right_lokey, rightblk)?;
            }
            {
                let mut page = BtreePageMut::from_page(&mut left)?;
                let trailer = page.trailer_mut();
                trailer.set_flags(trailer.flags() & !page_flags::FOLLOW_RIGHT);
            }

            self.wal.log_page_images(&[
                (left.block(), &left[..]),
                (parent.block(), &parent[..]),
            ])?;
            return Ok(());
        }
    }

    /// Splits a full internal page to make room for a new downlink at
    /// `newoff`. 90/10 toward the right: TID allocation is append-heavy, so
    /// the right page gets the growth room. Recurses upward via
    /// `insert_downlink`.
    fn split_internal(
        &self,
        mut parent: PageWriteGuard,
        mut child: PageWriteGuard,
        newoff: usize,
        newkey: ZsTid,
        newchildblk: BlockNumber,
    ) -> Result<()> {
        let (attno, level, hikey, next, follow_right) = {
            let page = BtreePage::from_page(&parent)?;
            let t = page.trailer();
            (t.attno(), t.level(), t.hikey(), t.next(), t.follow_right())
        };
        ensure!(
            !follow_right,
            "splitting internal page {} with an unfinished split",
            parent.block()
        );

        let mut items: Vec<InternalItem> = {
            let internal = InternalPage::from_page(BtreePage::from_page(&parent)?)?;
            internal.items().to_vec()
        };
        items.insert(newoff, InternalItem::new(newkey, newchildblk));

        let splitpoint = (items.len() * 9 / 10).clamp(1, items.len() - 1);
        let splittid = items[splitpoint].tid.get();

        let right_buf = self.pool.alloc_new()?;
        let mut right = right_buf.write();
        {
            let page = BtreePageMut::init(&mut right, attno, level, splittid, hikey, next, 0)?;
            let mut internal = InternalPageMut::from_page(page)?;
            internal.replace_items(&items[splitpoint..])?;
        }
        {
            let page = BtreePageMut::from_page(&mut parent)?;
            let mut internal = InternalPageMut::from_page(page)?;
            internal.replace_items(&items[..splitpoint])?;
            let trailer = internal.page_mut().trailer_mut();
            trailer.set_hikey(splittid);
            trailer.set_next(right.block());
            trailer.set_flags(trailer.flags() | page_flags::FOLLOW_RIGHT);
        }
        {
            let mut page = BtreePageMut::from_page(&mut child)?;
            let trailer = page.trailer_mut();
            trailer.set_flags(trailer.flags() & !page_flags::FOLLOW_RIGHT);
        }

        self.wal.log_page_images(&[
            (child.block(), &child[..]),
            (parent.block(), &parent[..]),
            (right.block(), &right[..]),
        ])?;

        let rightblk = right.block();
        drop(child);
        drop(right);

        self.insert_downlink(parent, splittid, rightblk)
    }

    /// Grows a new root holding exactly two downlinks. The metapage root
    /// pointer changes under the exclusive metapage latch. Consumes the
    /// left-child latch.
    fn new_root(
        &self,
        mut left: PageWriteGuard,
        right_lokey: ZsTid,
        rightblk: BlockNumber,
    ) -> Result<()> {
        let (attno, level, left_lokey) = {
            let page = BtreePage::from_page(&left)?;
            let t = page.trailer();
            (t.attno(), t.level(), t.lokey())
        };
        ensure!(
            left_lokey < right_lokey,
            "new root downlinks out of order: {} >= {}",
            left_lokey,
            right_lokey
        );

        let meta_buf = self.pool.read(0)?;
        let mut meta_guard = meta_buf.write();

        let root_buf = self.pool.alloc_new()?;
        let mut root = root_buf.write();
        {
            let page = BtreePageMut::init(
                &mut root,
                attno,
                level + 1,
                MIN_ZSTID,
                MAX_PLUS_ONE_ZSTID,
                INVALID_BLOCK,
                0,
            )?;
            let mut internal = InternalPageMut::from_page(page)?;
            internal.replace_items(&[
                InternalItem::new(left_lokey, left.block()),
                InternalItem::new(right_lokey, rightblk),
            ])?;
        }
        {
            let mut page = BtreePageMut::from_page(&mut left)?;
            let trailer = page.trailer_mut();
            trailer.set_flags(trailer.flags() & !page_flags::FOLLOW_RIGHT);
        }

        meta::set_root(&mut meta_guard, attno, root.block())?;

        self.wal.log_page_images(&[
            (left.block(), &left[..]),
            (root.block(), &root[..]),
            (meta_buf.block(), &meta_guard[..]),
        ])?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Point lookup
    // ------------------------------------------------------------------

    /// Finds the single-item image covering `tid` on a latched leaf,
    /// materializing out of arrays and containers as needed. The scoped
    /// decompressor frees its buffer on every path.
    fn find_on_page(
        &self,
        attr: &AttrDesc,
        page: &BtreePage<'_>,
        tid: ZsTid,
    ) -> Result<Option<Vec<u8>>> {
        for index in 0..page.nitems() {
            let item = ItemRef::parse(page.item(index)?)?;
            if item.last_tid() < tid || item.tid() > tid {
                continue;
            }

            if item.is_compressed() {
                let mut decompressor = Decompressor::new();
                decompressor.chunk(item)?;
                while let Some(bytes) = decompressor.read_item() {
                    let inner = ItemRef::parse(bytes)?;
                    if inner.tid() <= tid && tid <= inner.last_tid() {
                        return Ok(Some(super::item::extract_single(attr, inner, tid)?));
                    }
                }
                return Ok(None);
            }

            return Ok(Some(super::item::extract_single(attr, item, tid)?));
        }
        Ok(None)
    }

    /// Exclusive-latch lookup for mutation paths: the returned latch keeps
    /// the leaf stable until the caller rewrites it.
    fn fetch_for_update(
        &self,
        attno: u16,
        tid: ZsTid,
    ) -> Result<Option<(AttrDesc, PageWriteGuard, Vec<u8>)>> {
        let (root, attr) = self.root_for(attno, false)?;
        if root == INVALID_BLOCK {
            return Ok(None);
        }

        let guard = self.lock_leaf_exclusive(root, tid)?;
        let image = {
            let page = BtreePage::from_page(&guard)?;
            self.find_on_page(&attr, &page, tid)?
        };
        Ok(image.map(|image| (attr, guard, image)))
    }

    /// Point lookup in TID space. With a snapshot, invisible tuples come
    /// back as `None`.
    pub fn fetch(
        &self,
        attno: u16,
        tid: ZsTid,
        snapshot: Option<&Snapshot>,
    ) -> Result<Option<FetchedTuple>> {
        ensure!(tid_is_valid(tid), "cannot fetch invalid tid {}", tid);
        let (root, attr) = self.root_for(attno, false)?;
        if root == INVALID_BLOCK {
            return Ok(None);
        }

        let buf = self.descend(root, tid)?;
        let image = {
            let guard = buf.read();
            let page = BtreePage::from_page(&guard)?;
            self.find_on_page(&attr, &page, tid)?
        };

        let image = match image {
            None => return Ok(None),
            Some(image) => image,
        };
        let item = ItemRef::parse(&image)?;
        let undo_ptr = item.undo_ptr()?;

        if let Some(snapshot) = snapshot {
            if !self.checker().satisfies(snapshot, item.flags(), undo_ptr)? {
                return Ok(None);
            }
        }

        // Dead tombstones drop their payload; never try to read one.
        let datum = if item.is_null() || item.is_dead() {
            None
        } else {
            let (value, _) = read_datum(&attr, item.payload()?)?;
            Some(value.to_vec())
        };

        Ok(Some(FetchedTuple {
            tid,
            flags: item.flags(),
            undo_ptr,
            datum,
        }))
    }

    // ------------------------------------------------------------------
    // Insert
    // ------------------------------------------------------------------

    /// Inserts a batch of values. If `tids[0]` is invalid, consecutive TIDs
    /// are allocated from the rightmost leaf and written back into `tids`
    /// (insert the first attribute with invalid TIDs, then reuse them for
    /// the rest). One INSERT undo record covers the whole batch; pass the
    /// same `undo_ptr` across attributes to share it.
    pub fn multi_insert(
        &self,
        attno: u16,
        values: &[Option<&[u8]>],
        tids: &mut [ZsTid],
        xid: TxnId,
        cid: CommandId,
        undo_ptr: &mut UndoPtr,
    ) -> Result<()> {
        ensure!(!values.is_empty(), "empty insert batch");
        ensure!(
            values.len() == tids.len(),
            "value count {} != tid slot count {}",
            values.len(),
            tids.len()
        );
        for value in values.iter().flatten() {
            ensure!(
                value.len() <= MAX_DATUM_SIZE,
                "datum of {} bytes exceeds the inline maximum {}; toast it first",
                value.len(),
                MAX_DATUM_SIZE
            );
        }

        let (root, attr) = self.root_for(attno, true)?;
        let assign_tids = tids[0] == INVALID_ZSTID;
        let target_key = if assign_tids { MAX_ZSTID } else { tids[0] };

        let guard = self.lock_leaf_exclusive(root, target_key)?;
        let page = BtreePage::from_page(&guard)?;

        if assign_tids {
            // The rightmost leaf's keyspace has never been handed out:
            // allocation is monotone, so an empty page restarts at lokey.
            debug_assert_eq!(page.trailer().hikey(), MAX_PLUS_ONE_ZSTID);
            let first = if page.nitems() > 0 {
                ItemRef::parse(page.item(page.nitems() - 1)?)?.last_tid() + 1
            } else {
                page.trailer().lokey()
            };
            ensure!(
                first + tids.len() as ZsTid - 1 <= MAX_ZSTID,
                "out of TIDs: cannot allocate {} tuples from {}",
                tids.len(),
                first
            );
            for (offset, tid) in tids.iter_mut().enumerate() {
                *tid = first + offset as ZsTid;
            }
        }
        ensure!(
            tids[tids.len() - 1] < page.trailer().hikey(),
            "insert batch [{}, {}] crosses leaf bound {}",
            tids[0],
            tids[tids.len() - 1],
            page.trailer().hikey()
        );

        if !undo_ptr.is_valid() {
            *undo_ptr = self.undo.append(UndoRecord {
                xid,
                cid,
                op: UndoOp::Insert {
                    attno,
                    first_tid: tids[0],
                    last_tid: tids[tids.len() - 1],
                },
            })?;
        }

        // Pack consecutive same-nullness runs into array items, capped so a
        // handful of arrays still fit one page.
        let mut new_items: Vec<Vec<u8>> = Vec::new();
        let mut start = 0;
        while start < values.len() {
            let isnull = values[start].is_none();
            let mut datasz = values[start].map_or(0, |v| datum_stored_len(&attr, v));
            let mut end = start + 1;
            while end < values.len() && datasz < MAX_ARRAY_BYTES {
                if values[end].is_none() != isnull || tids[end] != tids[end - 1] + 1 {
                    break;
                }
                if let Some(value) = values[end] {
                    datasz += datum_stored_len(&attr, value);
                }
                end += 1;
            }

            let run: Vec<&[u8]> = if isnull {
                Vec::new()
            } else {
                values[start..end].iter().map(|v| v.unwrap()).collect()
            };
            new_items.push(create_item(
                &attr,
                tids[start],
                *undo_ptr,
                &run,
                end - start,
                isnull,
            )?);
            start = end;
        }

        let edit = LeafEdit {
            old_tid: INVALID_ZSTID,
            replacement: None,
            new_items: &new_items,
        };
        self.replace_item(attno, &attr, guard, &edit)
    }

    // ------------------------------------------------------------------
    // Delete / update / lock / dead-marking
    // ------------------------------------------------------------------

    /// Marks the tuple deleted: stamps a DELETE undo record and replaces the
    /// item with a DELETED-flagged copy. Conflicts are returned, not raised.
    pub fn delete(
        &self,
        attno: u16,
        tid: ZsTid,
        xid: TxnId,
        cid: CommandId,
        snapshot: &Snapshot,
    ) -> Result<UpdateResult> {
        let (attr, guard, image) = match self.fetch_for_update(attno, tid)? {
            Some(found) => found,
            None => bail!(
                "could not find tuple to delete with tid {} for attribute {}",
                tid,
                attno
            ),
        };

        let item = ItemRef::parse(&image)?;
        let (result, keep_old_undo_ptr) =
            self.checker()
                .satisfies_update(snapshot, item.flags(), item.undo_ptr()?)?;
        if result != UpdateResult::Ok {
            return Ok(result);
        }

        let prev = if keep_old_undo_ptr {
            item.undo_ptr()?
        } else {
            INVALID_UNDO_PTR
        };
        let new_ptr = self.undo.append(UndoRecord {
            xid,
            cid,
            op: UndoOp::Delete { attno, tid, prev },
        })?;

        let deleted = with_flags_and_undo(item, flags::DELETED, new_ptr);
        let edit = LeafEdit {
            old_tid: tid,
            replacement: Some(&deleted),
            new_items: &[],
        };
        self.replace_item(attno, &attr, guard, &edit)?;
        Ok(UpdateResult::Ok)
    }

    /// Updates one attribute of a tuple: the old item is stamped UPDATED
    /// and chained to an UPDATE undo record naming the new TID; the new
    /// version is appended. If `new_tid` is invalid a TID is allocated and
    /// written back (first attribute allocates, the rest reuse).
    pub fn update(
        &self,
        attno: u16,
        old_tid: ZsTid,
        new_value: Option<&[u8]>,
        new_tid: &mut ZsTid,
        xid: TxnId,
        cid: CommandId,
        snapshot: &Snapshot,
    ) -> Result<UpdateResult> {
        // Lock and check the old tuple first. The latch is dropped before
        // the insert; in-core tuple locking across that window is not
        // implemented, so a concurrent modification surfaces as an error in
        // the re-check below.
        {
            let (_, _guard, image) = match self.fetch_for_update(attno, old_tid)? {
                Some(found) => found,
                None => bail!(
                    "could not find old tuple to update with tid {} for attribute {}",
                    old_tid,
                    attno
                ),
            };
            let item = ItemRef::parse(&image)?;
            let (result, _) =
                self.checker()
                    .satisfies_update(snapshot, item.flags(), item.undo_ptr()?)?;
            if result != UpdateResult::Ok {
                return Ok(result);
            }
        }

        // Insert the new version.
        let mut insert_undo = INVALID_UNDO_PTR;
        let mut tid_slot = [*new_tid];
        self.multi_insert(attno, &[new_value], &mut tid_slot, xid, cid, &mut insert_undo)?;
        *new_tid = tid_slot[0];

        // Re-find the old item and stamp it UPDATED.
        let (attr, guard, image) = match self.fetch_for_update(attno, old_tid)? {
            Some(found) => found,
            None => bail!(
                "old tuple with tid {} vanished during update of attribute {}",
                old_tid,
                attno
            ),
        };
        let item = ItemRef::parse(&image)?;
        let (result, keep_old_undo_ptr) =
            self.checker()
                .satisfies_update(snapshot, item.flags(), item.undo_ptr()?)?;
        if result != UpdateResult::Ok {
            bail!("tuple with tid {} concurrently updated", old_tid);
        }

        let prev = if keep_old_undo_ptr {
            item.undo_ptr()?
        } else {
            INVALID_UNDO_PTR
        };
        let new_ptr = self.undo.append(UndoRecord {
            xid,
            cid,
            op: UndoOp::Update {
                attno,
                old_tid,
                new_tid: *new_tid,
                prev,
            },
        })?;

        let updated = with_flags_and_undo(item, flags::UPDATED, new_ptr);
        let edit = LeafEdit {
            old_tid,
            replacement: Some(&updated),
            new_items: &[],
        };
        self.replace_item(attno, &attr, guard, &edit)?;
        Ok(UpdateResult::Ok)
    }

    /// Stamps a TUPLE_LOCK undo record on the item. Waiting for a
    /// conflicting transaction is the host's job: under `WaitPolicy::Block`
    /// the conflict comes back as `BeingModified` for the host to wait and
    /// retry; otherwise it maps to `WouldBlock`.
    pub fn lock_item(
        &self,
        attno: u16,
        tid: ZsTid,
        xid: TxnId,
        cid: CommandId,
        snapshot: &Snapshot,
        mode: LockMode,
        wait_policy: WaitPolicy,
    ) -> Result<UpdateResult> {
        let (attr, guard, image) = match self.fetch_for_update(attno, tid)? {
            Some(found) => found,
            None => bail!(
                "could not find tuple to lock with tid {} for attribute {}",
                tid,
                attno
            ),
        };

        let item = ItemRef::parse(&image)?;
        let (result, keep_old_undo_ptr) =
            self.checker()
                .satisfies_update(snapshot, item.flags(), item.undo_ptr()?)?;
        match result {
            UpdateResult::Ok => {}
            UpdateResult::BeingModified if wait_policy != WaitPolicy::Block => {
                return Ok(UpdateResult::WouldBlock);
            }
            other => return Ok(other),
        }

        ensure!(
            item.flags() & flags::DELETED == 0,
            "cannot lock deleted tuple {}",
            tid
        );
        ensure!(
            item.flags() & flags::UPDATED == 0,
            "cannot lock updated tuple {}",
            tid
        );

        let prev = if keep_old_undo_ptr {
            item.undo_ptr()?
        } else {
            INVALID_UNDO_PTR
        };
        let new_ptr = self.undo.append(UndoRecord {
            xid,
            cid,
            op: UndoOp::TupleLock {
                attno,
                tid,
                mode,
                prev,
            },
        })?;

        let locked = with_flags_and_undo(item, 0, new_ptr);
        let edit = LeafEdit {
            old_tid: tid,
            replacement: Some(&locked),
            new_items: &[],
        };
        self.replace_item(attno, &attr, guard, &edit)?;
        Ok(UpdateResult::Ok)
    }

    /// VACUUM tombstone: replaces the item with a payload-less DEAD item
    /// carrying `undo_ptr`. The next recompression prunes it once the
    /// pointer falls behind the retention horizon. A missing tuple is not
    /// an error here — a concurrent vacuum may have pruned it already.
    pub fn mark_item_dead(&self, attno: u16, tid: ZsTid, undo_ptr: UndoPtr) -> Result<()> {
        let (attr, guard, image) = match self.fetch_for_update(attno, tid)? {
            Some(found) => found,
            None => return Ok(()),
        };

        let item = ItemRef::parse(&image)?;
        if item.is_dead() {
            return Ok(());
        }

        let dead = create_single(tid, undo_ptr, Some(&[]), flags::DEAD);
        let edit = LeafEdit {
            old_tid: tid,
            replacement: Some(&dead),
            new_items: &[],
        };
        self.replace_item(attno, &attr, guard, &edit)
    }

    /// One past the last TID in the tree: the next TID allocation would
    /// start here.
    pub fn last_tid(&self, attno: u16) -> Result<ZsTid> {
        let (root, _) = self.root_for(attno, true)?;
        let buf = self.descend(root, MAX_ZSTID)?;
        let guard = buf.read();
        let page = BtreePage::from_page(&guard)?;

        if page.nitems() > 0 {
            Ok(ItemRef::parse(page.item(page.nitems() - 1)?)?.last_tid() + 1)
        } else {
            Ok(page.trailer().lokey())
        }
    }
}
