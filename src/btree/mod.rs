//! # Per-Attribute B-Tree Engine
//!
//! One b-tree per attribute, all keyed by the 48-bit TID. The tree is
//! Lehman-Yao style: every page knows its keyspace (`lokey`/`hikey`) and its
//! right sibling, so readers recover from concurrent splits by walking
//! right, and writers install parent downlinks after the fact.
//!
//! ## Page kinds
//!
//! - **Leaf pages** (level 0) hold the item variants of `item`: Single,
//!   Array, and Compressed containers wrapping runs of the other two.
//! - **Internal pages** hold a dense `(tid, childblk)` downlink array.
//!
//! ## Mutation model
//!
//! Leaves are immutable at the item level: every mutation rewrites the
//! whole leaf through the normalize/recompress pipeline in `leaf`, which
//! also re-packs compressed containers and prunes dead items. The page
//! chain a rewrite produces is stitched into the tree by the structural
//! routines in `tree`.
//!
//! ## Module map
//!
//! - `page`: page layout, trailer, slot directory
//! - `internal`: downlink arrays and their binary search
//! - `item`: leaf item variants and datum marshalling
//! - `leaf`: the normalize + recompress mutation engine
//! - `tree`: descent, split/newroot maintenance, public operations
//! - `scan`: the forward scan iterator

pub mod internal;
pub mod item;
pub mod leaf;
pub mod page;
pub mod scan;
pub mod tree;

pub use item::AttrDesc;
pub use scan::{ScanTuple, TreeScan};
pub use tree::{FetchedTuple, ZedStore};
