//! # Storage Module
//!
//! The foundational storage layer: a `Storage` trait over paged files, the
//! memory-mapped implementation, the buffer pool that hands out pinned and
//! latched page frames, the page-image WAL, and the TOAST pointer codec for
//! oversized datums.
//!
//! ## Table file layout
//!
//! A table is physically a single paged file:
//!
//! ```text
//! Offset 0:       Page 0 — metapage (attribute registry and root directory)
//! Offset 8192:    Page 1 — b-tree or toast page
//! Offset 16384:   Page 2
//! ...
//! ```
//!
//! The file size is always a multiple of `PAGE_SIZE`.
//!
//! ## Concurrency model
//!
//! The engine runs on parallel threads over a shared buffer pool. Page access
//! goes through `BufferPool` which yields `PinnedBuf` handles; a handle holds
//! a pin for its lifetime and hands out shared or exclusive latch guards.
//! Guards release their latch (and handles their pin) on drop, on every exit
//! path including errors.
//!
//! ## Module organization
//!
//! - `mmap`: memory-mapped single-file storage (`MmapStorage`)
//! - `buffer`: page frames, pins and latch guards (`BufferPool`, `PinnedBuf`)
//! - `wal`: page-image write-ahead log (`Wal`, `FileWal`, `NoopWal`)
//! - `toast`: oversized-datum pointers (`ToastPointer`, `Toaster`)

mod buffer;
mod mmap;
pub mod toast;
mod wal;

pub use buffer::{BlockNumber, BufferPool, PageReadGuard, PageWriteGuard, PinnedBuf, INVALID_BLOCK};
pub use mmap::MmapStorage;
pub use wal::{FileWal, NoopWal, Wal, WalFrameHeader, WAL_FRAME_HEADER_SIZE};

pub use crate::config::{PAGE_CONTENT_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE, PAGE_TRAILER_SIZE};

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// Parses a zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy<'a, T: FromBytes + KnownLayout + Immutable>(
    bytes: &'a [u8],
    type_name: &str,
) -> Result<&'a T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::ref_from_bytes(&bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}

/// Parses a mutable zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy_mut<'a, T: FromBytes + KnownLayout + zerocopy::IntoBytes>(
    bytes: &'a mut [u8],
    type_name: &str,
) -> Result<&'a mut T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::mut_from_bytes(&mut bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}

/// Paged byte storage. The buffer pool loads from and checkpoints into an
/// implementation of this trait; `MmapStorage` is the on-disk one.
pub trait Storage {
    fn page(&self, page_no: u32) -> Result<&[u8]>;
    fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]>;
    fn grow(&mut self, new_page_count: u32) -> Result<()>;
    fn page_count(&self) -> u32;
    fn sync(&self) -> Result<()>;

    fn prefetch_pages(&self, _start_page: u32, _count: u32) {}
}

impl Storage for MmapStorage {
    fn page(&self, page_no: u32) -> Result<&[u8]> {
        MmapStorage::page(self, page_no)
    }

    fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        MmapStorage::page_mut(self, page_no)
    }

    fn grow(&mut self, new_page_count: u32) -> Result<()> {
        MmapStorage::grow(self, new_page_count)
    }

    fn page_count(&self) -> u32 {
        MmapStorage::page_count(self)
    }

    fn sync(&self) -> Result<()> {
        MmapStorage::sync(self)
    }

    fn prefetch_pages(&self, start_page: u32, count: u32) {
        MmapStorage::prefetch_pages(self, start_page, count)
    }
}

/// In-memory storage, for tests and for hosts that checkpoint elsewhere.
#[derive(Debug, Default)]
pub struct MemStorage {
    pages: Vec<Vec<u8>>,
}

impl MemStorage {
    pub fn new(page_count: u32) -> Self {
        Self {
            pages: vec![vec![0u8; PAGE_SIZE]; page_count as usize],
        }
    }
}

impl Storage for MemStorage {
    fn page(&self, page_no: u32) -> Result<&[u8]> {
        self.pages
            .get(page_no as usize)
            .map(|p| p.as_slice())
            .ok_or_else(|| eyre::eyre!("page {} out of bounds", page_no))
    }

    fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        self.pages
            .get_mut(page_no as usize)
            .map(|p| p.as_mut_slice())
            .ok_or_else(|| eyre::eyre!("page {} out of bounds", page_no))
    }

    fn grow(&mut self, new_page_count: u32) -> Result<()> {
        while self.pages.len() < new_page_count as usize {
            self.pages.push(vec![0u8; PAGE_SIZE]);
        }
        Ok(())
    }

    fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
