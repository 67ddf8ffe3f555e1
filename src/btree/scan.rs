//! # Scan Iterator
//!
//! Forward iterator over one attribute tree in strictly ascending TID
//! order. The iterator owns `next_tid`, the smallest TID not yet emitted;
//! every step either returns the tuple at `next_tid`'s position or advances
//! past items invisible to the snapshot.
//!
//! Three layers feed `next()`, checked in order:
//!
//! 1. an active **array cursor** — the private copy of an Array item being
//!    unpacked element by element;
//! 2. the **decompressor** — items streaming out of the container installed
//!    from the current leaf;
//! 3. the **leaf page** itself — plain items served directly, containers
//!    handed to the decompressor, and the right-sibling link followed when
//!    the page is exhausted.
//!
//! The leaf is latched shared only while its slots are inspected; the latch
//! is dropped before any tuple is returned and before container contents
//! are iterated (the decompressor's buffer is a private copy). At most one
//! leaf stays pinned at any time, and none after the scan ends.

use eyre::{ensure, Result};

use super::item::{read_datum, AttrDesc, ItemRef};
use super::page::BtreePage;
use super::tree::ZedStore;
use crate::compress::Decompressor;
use crate::mvcc::{Snapshot, UndoLog};
use crate::storage::{PinnedBuf, Wal, INVALID_BLOCK};
use crate::tid::{ZsTid, MIN_ZSTID};

/// One tuple produced by a scan. `datum` is an owned copy of the
/// unmarshalled value; `None` is NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTuple {
    pub tid: ZsTid,
    pub datum: Option<Vec<u8>>,
}

#[derive(Debug)]
struct ArrayCursor {
    payload: Vec<u8>,
    pos: usize,
    remaining: usize,
    next_tid: ZsTid,
    isnull: bool,
}

impl ArrayCursor {
    /// Copies an Array item into a private cursor, skipping elements below
    /// `next_tid`.
    fn install(attr: &AttrDesc, item: ItemRef<'_>, next_tid: ZsTid) -> Result<Self> {
        let mut cursor = Self {
            payload: item.payload()?.to_vec(),
            pos: 0,
            remaining: item.nelements() as usize,
            next_tid: item.tid(),
            isnull: item.is_null(),
        };
        while cursor.next_tid < next_tid && cursor.remaining > 0 {
            if !cursor.isnull {
                let (_, consumed) = read_datum(attr, &cursor.payload[cursor.pos..])?;
                cursor.pos += consumed;
            }
            cursor.next_tid += 1;
            cursor.remaining -= 1;
        }
        Ok(cursor)
    }
}

enum PageStep {
    /// Served something into the cursor/decompressor; re-run the layers.
    Resume,
    /// Return this tuple.
    Tuple(ScanTuple),
    /// Page exhausted; follow the right sibling (INVALID_BLOCK ends).
    WalkRight(u32),
}

/// Forward scan over one attribute tree.
pub struct TreeScan<'s, U: UndoLog, W: Wal> {
    store: &'s ZedStore<U, W>,
    attr: AttrDesc,
    snapshot: Snapshot,
    active: bool,
    lastbuf: Option<PinnedBuf>,
    next_tid: ZsTid,
    decompressor: Decompressor,
    has_decompressed: bool,
    array: Option<ArrayCursor>,
}

impl<U: UndoLog, W: Wal> ZedStore<U, W> {
    /// Starts a scan at `start_tid`. A completely empty tree yields an
    /// inactive scan that immediately reports EOF.
    pub fn begin_scan(
        &self,
        attno: u16,
        start_tid: ZsTid,
        snapshot: Snapshot,
    ) -> Result<TreeScan<'_, U, W>> {
        let (root, attr) = self.root_for(attno, false)?;

        let start_tid = start_tid.max(MIN_ZSTID);
        let lastbuf = if root == INVALID_BLOCK {
            None
        } else {
            Some(self.descend(root, start_tid)?)
        };

        Ok(TreeScan {
            store: self,
            attr,
            snapshot,
            active: lastbuf.is_some(),
            lastbuf,
            next_tid: start_tid,
            decompressor: Decompressor::new(),
            has_decompressed: false,
            array: None,
        })
    }
}

impl<U: UndoLog, W: Wal> TreeScan<'_, U, W> {
    /// Smallest TID not yet emitted.
    pub fn next_tid(&self) -> ZsTid {
        self.next_tid
    }

    /// Next visible tuple in TID order, or `None` at end of scan.
    pub fn next(&mut self) -> Result<Option<ScanTuple>> {
        if !self.active {
            return Ok(None);
        }

        loop {
            // Layer 1: an Array item mid-unpack.
            if let Some(cursor) = &mut self.array {
                if cursor.remaining == 0 {
                    self.array = None;
                } else {
                    let tid = cursor.next_tid;
                    let datum = if cursor.isnull {
                        None
                    } else {
                        let (value, consumed) =
                            read_datum(&self.attr, &cursor.payload[cursor.pos..])?;
                        cursor.pos += consumed;
                        Some(value.to_vec())
                    };
                    cursor.next_tid += 1;
                    cursor.remaining -= 1;
                    self.next_tid = tid + 1;
                    return Ok(Some(ScanTuple { tid, datum }));
                }
            }

            // Layer 2: items streaming out of the installed container.
            if self.has_decompressed {
                let checker = self.store.checker();
                let attr = self.attr;
                let snapshot = self.snapshot;
                let next_tid = self.next_tid;

                let mut new_array = None;
                let mut tuple = None;
                let mut advance_to = None;
                match self.decompressor.read_item() {
                    None => {
                        self.has_decompressed = false;
                        continue;
                    }
                    Some(bytes) => {
                        let item = ItemRef::parse(bytes)?;
                        if item.last_tid() < next_tid {
                            continue;
                        }
                        if !checker.satisfies(&snapshot, item.flags(), item.undo_ptr()?)? {
                            advance_to = Some(item.last_tid() + 1);
                        } else if item.is_array() {
                            new_array = Some(ArrayCursor::install(&attr, item, next_tid)?);
                        } else {
                            let datum = if item.is_null() {
                                None
                            } else {
                                let (value, _) = read_datum(&attr, item.payload()?)?;
                                Some(value.to_vec())
                            };
                            tuple = Some(ScanTuple {
                                tid: item.tid(),
                                datum,
                            });
                        }
                    }
                }

                if let Some(tid) = advance_to {
                    self.next_tid = tid;
                    continue;
                }
                if let Some(cursor) = new_array {
                    self.next_tid = cursor.next_tid;
                    self.array = Some(cursor);
                    continue;
                }
                if let Some(tuple) = tuple {
                    self.next_tid = tuple.tid + 1;
                    return Ok(Some(tuple));
                }
                continue;
            }

            // Layer 3: the leaf page itself, under a shared latch.
            let buf = match &self.lastbuf {
                Some(buf) => buf.clone(),
                None => {
                    self.active = false;
                    return Ok(None);
                }
            };

            let step = {
                let guard = buf.read();
                let page = BtreePage::from_page(&guard)?;
                self.scan_page(&page)?
            };

            match step {
                PageStep::Resume => continue,
                PageStep::Tuple(tuple) => {
                    self.next_tid = tuple.tid + 1;
                    return Ok(Some(tuple));
                }
                PageStep::WalkRight(next) => {
                    if next == INVALID_BLOCK {
                        self.active = false;
                        self.lastbuf = None;
                        return Ok(None);
                    }
                    let buf = self.lastbuf.take().expect("scan holds a leaf here");
                    self.lastbuf = Some(self.store.pool().release_and_read(buf, next)?);
                }
            }
        }
    }

    fn scan_page(&mut self, page: &BtreePage<'_>) -> Result<PageStep> {
        let checker = self.store.checker();

        for index in 0..page.nitems() {
            let item = ItemRef::parse(page.item(index)?)?;
            if item.last_tid() < self.next_tid {
                continue;
            }

            if item.is_compressed() {
                // The decompressor copies into private memory, so the latch
                // can drop before the contents are iterated.
                self.decompressor.chunk(item)?;
                self.has_decompressed = true;
                return Ok(PageStep::Resume);
            }

            if !checker.satisfies(&self.snapshot, item.flags(), item.undo_ptr()?)? {
                self.next_tid = item.last_tid() + 1;
                continue;
            }

            if item.is_array() {
                let cursor = ArrayCursor::install(&self.attr, item, self.next_tid)?;
                self.next_tid = cursor.next_tid;
                if cursor.remaining > 0 {
                    self.array = Some(cursor);
                    return Ok(PageStep::Resume);
                }
                continue;
            }

            let datum = if item.is_null() {
                None
            } else {
                let (value, _) = read_datum(&self.attr, item.payload()?)?;
                Some(value.to_vec())
            };
            return Ok(PageStep::Tuple(ScanTuple {
                tid: item.tid(),
                datum,
            }));
        }

        let next = page.trailer().next();
        ensure!(
            self.lastbuf
                .as_ref()
                .map(|b| b.block() != next)
                .unwrap_or(true),
            "page {} right-link points to itself",
            next
        );
        Ok(PageStep::WalkRight(next))
    }

    /// Collects the remaining tuples. Test and bulk-read convenience.
    pub fn collect_remaining(&mut self) -> Result<Vec<ScanTuple>> {
        let mut tuples = Vec::new();
        while let Some(tuple) = self.next()? {
            tuples.push(tuple);
        }
        Ok(tuples)
    }
}
