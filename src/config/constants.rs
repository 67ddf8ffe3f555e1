//! # ZedStore Configuration Constants
//!
//! This module centralizes the layout constants of the on-disk format.
//! Constants that depend on each other are co-located and the derived values
//! are guarded by compile-time assertions, so a change to one cannot silently
//! break another.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (8192 bytes)
//!       │
//!       ├─> PAGE_TRAILER_SIZE (28 bytes, fixed by the trailer struct)
//!       │
//!       ├─> PAGE_CONTENT_SIZE (derived: PAGE_SIZE - header - trailer)
//!       │
//!       ├─> MAX_ITEM_SIZE (largest single item storable on an empty page)
//!       │
//!       └─> MAX_DATUM_SIZE (~1/4 of usable space; larger values must be
//!             toasted by the caller before they reach the tree)
//!
//! MAX_DATUM_SIZE
//!       │
//!       └─> MAX_ARRAY_BYTES (payload cap when packing consecutive datums
//!             into one array item on the insert path)
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `PAGE_CONTENT_SIZE == PAGE_SIZE - PAGE_HEADER_SIZE - PAGE_TRAILER_SIZE`
//! 2. `MAX_ITEM_SIZE + SLOT_SIZE <= PAGE_CONTENT_SIZE` (one max item + its
//!    slot always fits an empty page)
//! 3. `MAX_DATUM_SIZE < MAX_ITEM_SIZE` (a max-size datum plus item header
//!    still forms a storable item)

/// Size of each page in bytes. The fundamental unit of I/O and locking.
pub const PAGE_SIZE: usize = 8192;

/// Size of the slot-directory header at the front of every b-tree page.
pub const PAGE_HEADER_SIZE: usize = 6;

/// Size of the page trailer at the end of every b-tree page:
/// `{attno:u16, flags:u16, next:u32, lokey:u64, hikey:u64, level:u16, page_id:u16}`.
pub const PAGE_TRAILER_SIZE: usize = 28;

/// Size of one slot-directory entry (`offset:u16, len:u16`).
pub const SLOT_SIZE: usize = 4;

/// Bytes available for slots plus item content on a page.
pub const PAGE_CONTENT_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE - PAGE_TRAILER_SIZE;

/// Largest item (header + payload) that can be stored on a page.
pub const MAX_ITEM_SIZE: usize = PAGE_CONTENT_SIZE - SLOT_SIZE;

/// Largest datum the tree accepts inline. Larger values must be toasted by
/// the caller; the tree then stores the 17-byte toast pointer instead.
pub const MAX_DATUM_SIZE: usize = PAGE_CONTENT_SIZE / 4;

/// Payload cap when the insert path packs consecutive datums into one array
/// item. Small enough that several array items fit a page, which keeps
/// recompression granular.
pub const MAX_ARRAY_BYTES: usize = MAX_DATUM_SIZE;

/// zstd compression level used for leaf containers. Level 1 favors the
/// recompress-on-every-mutation write path over ratio.
pub const COMPRESSION_LEVEL: i32 = 1;

/// Page id discriminators, stored in the last two bytes of every page.
pub const BTREE_PAGE_ID: u16 = 0xF083;
pub const META_PAGE_ID: u16 = 0xF082;

const _: () = assert!(
    PAGE_CONTENT_SIZE == PAGE_SIZE - PAGE_HEADER_SIZE - PAGE_TRAILER_SIZE,
    "PAGE_CONTENT_SIZE derivation mismatch"
);

const _: () = assert!(
    MAX_ITEM_SIZE + SLOT_SIZE <= PAGE_CONTENT_SIZE,
    "a maximum-size item plus its slot must fit an empty page"
);

const _: () = assert!(
    MAX_DATUM_SIZE < MAX_ITEM_SIZE,
    "MAX_DATUM_SIZE must leave room for the item header"
);
