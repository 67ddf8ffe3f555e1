//! # ZedStore - Compressed Column-Oriented Table Storage
//!
//! ZedStore stores a table as a forest of B-trees, one per attribute, all
//! keyed by a 48-bit logical tuple identifier (TID). Leaf pages hold
//! variable-length items that are individually or collectively
//! LZ-compressed and carry undo-pointer MVCC metadata; every mutation
//! rewrites the affected leaf through a recompression pipeline instead of
//! editing items in place.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   Per-attribute operations (ZedStore)    │
//! │   insert / delete / update / lock /      │
//! │   fetch / scan                           │
//! ├─────────────────────┬────────────────────┤
//! │  B-tree structure   │  MVCC glue         │
//! │  descent, splits,   │  undo log,         │
//! │  downlinks          │  visibility        │
//! ├─────────────────────┴────────────────────┤
//! │  Leaf item model + recompression         │
//! │  Single / Array / Compressed containers  │
//! ├──────────────────────────────────────────┤
//! │  Compressor (zstd + Simple-8b directory) │
//! ├──────────────────────────────────────────┤
//! │  Buffer pool (pins + latch guards)       │
//! ├──────────────────────────────────────────┤
//! │  Paged file (mmap) + page-image WAL      │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## What lives outside
//!
//! The engine is library-level and leans on collaborators for transaction
//! state: the host owns transaction begin/commit/abort (driven through
//! [`mvcc::TransactionRegistry`]), row assembly across attribute trees, and
//! the TOAST chunk allocator. Reference implementations of the undo log and
//! toast store ship in-crate for embedding and tests.
//!
//! ## Quick start
//!
//! ```ignore
//! use zedstore::{AttrDesc, ZedStore};
//! use zedstore::mvcc::{MemUndoLog, INVALID_UNDO_PTR};
//! use zedstore::storage::NoopWal;
//!
//! let store = ZedStore::create(MemUndoLog::new(), NoopWal)?;
//! store.create_attribute(1, AttrDesc::fixed(8))?;
//!
//! store.registry().begin(xid);
//! let mut tids = vec![0; batch.len()];
//! let mut undo_ptr = INVALID_UNDO_PTR;
//! store.multi_insert(1, &batch, &mut tids, xid, 0, &mut undo_ptr)?;
//! store.registry().commit(xid);
//!
//! let snapshot = store.registry().snapshot(reader_xid, 0);
//! let mut scan = store.begin_scan(1, 1, snapshot)?;
//! while let Some(tuple) = scan.next()? {
//!     // tuples arrive in TID order
//! }
//! ```
//!
//! ## Module overview
//!
//! - [`btree`]: item model, leaf recompression, tree maintenance, scans
//! - [`compress`]: container compressor / streaming decompressor
//! - [`mvcc`]: undo log, snapshots, visibility checks
//! - [`storage`]: buffer pool, mmap file backend, WAL, TOAST pointers
//! - [`meta`]: the metapage (attribute → root directory)
//! - [`encoding`]: varint datum headers and Simple-8b packing

pub mod btree;
pub mod compress;
pub mod config;
pub mod encoding;
pub mod meta;
pub mod mvcc;
pub mod storage;
pub mod tid;

pub use btree::{AttrDesc, FetchedTuple, ScanTuple, TreeScan, ZedStore};
pub use tid::{ZsTid, INVALID_ZSTID, MAX_PLUS_ONE_ZSTID, MAX_ZSTID, MIN_ZSTID};
