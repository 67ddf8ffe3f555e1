//! # Page-Image Write-Ahead Log
//!
//! Recompression rewrites whole leaves, so recovery works from full page
//! images: every mutation logs one frame per page it dirtied, and replay
//! simply reinstates the images in order. Replaying a frame twice is
//! harmless, which keeps crash recovery trivial.
//!
//! ## Frame format
//!
//! ```text
//! +-----------+-----------+--------------+------------------+
//! | block u32 | len u32   | checksum u64 | image (len bytes)|
//! +-----------+-----------+--------------+------------------+
//! ```
//!
//! The checksum is CRC64 (ECMA-182) over the block number, the length and
//! the image. Replay stops at the first frame that fails validation: a torn
//! tail write looks exactly like the end of the log.
//!
//! ## Critical sections
//!
//! All pages touched by one logical mutation are handed to
//! `log_page_images` as a single batch; the batch is appended and fsynced
//! atomically with respect to other callers. This is the engine's critical
//! section: either every image of a mutation reaches the log, or none does.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use zerocopy::byteorder::{NativeEndian, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{BlockNumber, Storage, PAGE_SIZE};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub const WAL_FRAME_HEADER_SIZE: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct WalFrameHeader {
    block: U32<NativeEndian>,
    len: U32<NativeEndian>,
    checksum: U64<NativeEndian>,
}

impl WalFrameHeader {
    fn new(block: BlockNumber, image: &[u8]) -> Self {
        let mut header = Self {
            block: U32::new(block),
            len: U32::new(image.len() as u32),
            checksum: U64::new(0),
        };
        header.checksum = U64::new(header.compute_checksum(image));
        header
    }

    fn compute_checksum(&self, image: &[u8]) -> u64 {
        let mut digest = CRC64.digest();
        digest.update(self.block.as_bytes());
        digest.update(self.len.as_bytes());
        digest.update(image);
        digest.finalize()
    }

    pub fn block(&self) -> BlockNumber {
        self.block.get()
    }

    pub fn len(&self) -> usize {
        self.len.get() as usize
    }

    pub fn is_valid(&self, image: &[u8]) -> bool {
        self.compute_checksum(image) == self.checksum.get()
    }
}

/// The write-ahead log collaborator. One frame per dirtied page, one batch
/// per logical mutation.
pub trait Wal: Send + Sync {
    fn log_page_images(&self, pages: &[(BlockNumber, &[u8])]) -> Result<()>;
}

/// WAL that discards everything. For unit tests and hosts that do their own
/// logging.
#[derive(Debug, Default)]
pub struct NoopWal;

impl Wal for NoopWal {
    fn log_page_images(&self, _pages: &[(BlockNumber, &[u8])]) -> Result<()> {
        Ok(())
    }
}

/// File-backed page-image WAL.
#[derive(Debug)]
pub struct FileWal {
    file: Mutex<File>,
}

impl FileWal {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create WAL file '{}'", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open WAL file '{}'", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Replays every valid frame in `path` onto `storage`, growing it as
    /// needed. Returns the number of frames applied. Stops cleanly at the
    /// first corrupt or truncated frame.
    pub fn replay<P: AsRef<Path>, S: Storage>(path: P, storage: &mut S) -> Result<usize> {
        let path = path.as_ref();
        let mut file = File::open(path)
            .wrap_err_with(|| format!("failed to open WAL file '{}'", path.display()))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .wrap_err("failed to read WAL")?;

        let mut applied = 0;
        let mut pos = 0;
        while bytes.len() - pos >= WAL_FRAME_HEADER_SIZE {
            let header =
                match WalFrameHeader::ref_from_bytes(&bytes[pos..pos + WAL_FRAME_HEADER_SIZE]) {
                    Ok(h) => h,
                    Err(_) => break,
                };
            let image_start = pos + WAL_FRAME_HEADER_SIZE;
            let image_end = image_start + header.len();
            if header.len() != PAGE_SIZE || image_end > bytes.len() {
                break;
            }
            let image = &bytes[image_start..image_end];
            if !header.is_valid(image) {
                break;
            }

            let blk = header.block();
            if storage.page_count() <= blk {
                storage.grow(blk + 1)?;
            }
            storage.page_mut(blk)?.copy_from_slice(image);
            applied += 1;
            pos = image_end;
        }

        storage.sync()?;
        Ok(applied)
    }
}

impl Wal for FileWal {
    fn log_page_images(&self, pages: &[(BlockNumber, &[u8])]) -> Result<()> {
        let mut file = self.file.lock();

        for &(blk, image) in pages {
            ensure!(
                image.len() == PAGE_SIZE,
                "WAL page image for block {} has size {} != {}",
                blk,
                image.len(),
                PAGE_SIZE
            );
            let header = WalFrameHeader::new(blk, image);
            file.write_all(header.as_bytes())
                .wrap_err("failed to write WAL frame header")?;
            file.write_all(image).wrap_err("failed to write WAL frame")?;
        }

        file.sync_data().wrap_err("failed to sync WAL")
    }
}
