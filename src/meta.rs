//! # Metapage
//!
//! Block 0 of the table file is the metapage: the registry mapping each
//! attribute number to its descriptor and the root block of its b-tree.
//!
//! ```text
//! +-----------+--------+----------------------------------------+
//! | page_id   | nattrs | MetaEntry[nattrs]                      |
//! | u16       | u16    | {attno u16, attlen i16, attbyval u8,   |
//! |           |        |  reserved u8, root u32} each           |
//! +-----------+--------+----------------------------------------+
//! ```
//!
//! A tree is created lazily: the entry starts with `root = INVALID_BLOCK`,
//! and the first insert creates a single leaf covering the whole TID space
//! and points the entry at it. The root pointer only ever changes under the
//! exclusive metapage latch — either here (lazy creation) or when the tree
//! grows a new root.

use eyre::{bail, ensure, Result};
use zerocopy::byteorder::{I16, NativeEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::btree::item::AttrDesc;
use crate::btree::page::BtreePageMut;
use crate::config::{META_PAGE_ID, PAGE_SIZE};
use crate::storage::{BlockNumber, BufferPool, Wal, INVALID_BLOCK};
use crate::tid::{MAX_PLUS_ONE_ZSTID, MIN_ZSTID};

const META_HEADER_SIZE: usize = 4;
const META_ENTRY_SIZE: usize = 10;
const MAX_ATTRIBUTES: usize = (PAGE_SIZE - META_HEADER_SIZE) / META_ENTRY_SIZE;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct MetaHeader {
    page_id: U16<NativeEndian>,
    nattrs: U16<NativeEndian>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct MetaEntry {
    attno: U16<NativeEndian>,
    attlen: I16<NativeEndian>,
    attbyval: u8,
    reserved: u8,
    root: U32<NativeEndian>,
}

fn header(data: &[u8]) -> Result<&MetaHeader> {
    let header = MetaHeader::ref_from_bytes(&data[..META_HEADER_SIZE])
        .map_err(|e| eyre::eyre!("failed to read metapage header: {:?}", e))?;
    ensure!(
        header.page_id.get() == META_PAGE_ID,
        "expected metapage, got page id {:04x}",
        header.page_id.get()
    );
    Ok(header)
}

fn entries(data: &[u8]) -> Result<&[MetaEntry]> {
    let n = header(data)?.nattrs.get() as usize;
    let bytes = &data[META_HEADER_SIZE..META_HEADER_SIZE + n * META_ENTRY_SIZE];
    Ok(<[MetaEntry]>::ref_from_bytes(bytes).unwrap())
}

fn entries_mut(data: &mut [u8], n: usize) -> &mut [MetaEntry] {
    let bytes = &mut data[META_HEADER_SIZE..META_HEADER_SIZE + n * META_ENTRY_SIZE];
    <[MetaEntry]>::mut_from_bytes(bytes).unwrap()
}

/// Formats block 0 as an empty metapage. The pool must be empty.
pub fn init_metapage(pool: &BufferPool) -> Result<()> {
    ensure!(
        pool.page_count() == 0,
        "metapage must be the first page of the file"
    );
    let buf = pool.alloc_new()?;
    let mut guard = buf.write();

    let header = MetaHeader {
        page_id: U16::new(META_PAGE_ID),
        nattrs: U16::new(0),
    };
    guard[..META_HEADER_SIZE].copy_from_slice(header.as_bytes());
    Ok(())
}

/// Registers an attribute with no tree yet. Idempotent for identical
/// descriptors; conflicting re-registration is an error.
pub fn register_attribute(pool: &BufferPool, attno: u16, attr: AttrDesc) -> Result<()> {
    ensure!(attno > 0, "attribute numbers start at 1");
    let buf = pool.read(0)?;
    let mut guard = buf.write();

    let n = header(&guard)?.nattrs.get() as usize;
    for entry in entries(&guard)? {
        if entry.attno.get() == attno {
            ensure!(
                entry.attlen.get() == attr.attlen && (entry.attbyval != 0) == attr.attbyval,
                "attribute {} re-registered with conflicting descriptor",
                attno
            );
            return Ok(());
        }
    }
    ensure!(
        n < MAX_ATTRIBUTES,
        "metapage is full: {} attributes",
        MAX_ATTRIBUTES
    );

    let entry = MetaEntry {
        attno: U16::new(attno),
        attlen: I16::new(attr.attlen),
        attbyval: attr.attbyval as u8,
        reserved: 0,
        root: U32::new(INVALID_BLOCK),
    };
    entries_mut(&mut guard, n + 1)[n] = entry;
    MetaHeader::mut_from_bytes(&mut guard[..META_HEADER_SIZE])
        .unwrap()
        .nattrs = U16::new(n as u16 + 1);
    Ok(())
}

/// Looks up the root block and descriptor of an attribute's tree.
///
/// With `create_if_missing`, an empty tree gets its first page: a leaf
/// covering the whole TID space, created under the exclusive metapage latch
/// and logged together with the updated metapage.
pub fn root_for(
    pool: &BufferPool,
    wal: &dyn Wal,
    attno: u16,
    create_if_missing: bool,
) -> Result<(BlockNumber, AttrDesc)> {
    let meta_buf = pool.read(0)?;

    {
        let guard = meta_buf.read();
        if let Some((root, attr)) = lookup(&guard, attno)? {
            if root != INVALID_BLOCK || !create_if_missing {
                return Ok((root, attr));
            }
        } else {
            bail!("attribute {} is not registered", attno);
        }
    }

    // Lazy creation: retake the latch exclusively and re-check.
    let mut guard = meta_buf.write();
    let (root, attr) = lookup(&guard, attno)?.expect("attribute registered above");
    if root != INVALID_BLOCK {
        return Ok((root, attr));
    }

    let leaf_buf = pool.alloc_new()?;
    let mut leaf_guard = leaf_buf.write();
    BtreePageMut::init(
        &mut leaf_guard,
        attno,
        0,
        MIN_ZSTID,
        MAX_PLUS_ONE_ZSTID,
        INVALID_BLOCK,
        0,
    )?;

    set_root(&mut guard, attno, leaf_buf.block())?;
    wal.log_page_images(&[
        (meta_buf.block(), &guard[..]),
        (leaf_buf.block(), &leaf_guard[..]),
    ])?;

    Ok((leaf_buf.block(), attr))
}

fn lookup(data: &[u8], attno: u16) -> Result<Option<(BlockNumber, AttrDesc)>> {
    for entry in entries(data)? {
        if entry.attno.get() == attno {
            return Ok(Some((
                entry.root.get(),
                AttrDesc {
                    attlen: entry.attlen.get(),
                    attbyval: entry.attbyval != 0,
                },
            )));
        }
    }
    Ok(None)
}

/// Points an attribute's entry at a new root. The caller holds the exclusive
/// metapage latch (`data` is the latched page) and is responsible for
/// logging the page.
pub fn set_root(data: &mut [u8], attno: u16, new_root: BlockNumber) -> Result<()> {
    let n = header(data)?.nattrs.get() as usize;
    for entry in entries_mut(data, n) {
        if entry.attno.get() == attno {
            entry.root = U32::new(new_root);
            return Ok(());
        }
    }
    bail!("attribute {} is not registered", attno);
}
