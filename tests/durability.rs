//! Durability round-trips: checkpointing the buffer pool into the mmap
//! file, reopening it, and recovering page images from the WAL alone.

use tempfile::tempdir;
use zedstore::mvcc::{MemUndoLog, INVALID_UNDO_PTR};
use zedstore::storage::{BufferPool, FileWal, MemStorage, MmapStorage, NoopWal, Storage};
use zedstore::{AttrDesc, ZedStore, INVALID_ZSTID, MIN_ZSTID};

const ATTNO: u16 = 1;

fn insert_batch(store: &ZedStore<MemUndoLog, impl zedstore::storage::Wal>, xid: u64, n: i64) {
    store.registry().begin(xid);
    let values: Vec<[u8; 8]> = (0..n).map(|i| i.to_ne_bytes()).collect();
    let datums: Vec<Option<&[u8]>> = values.iter().map(|v| Some(&v[..])).collect();
    let mut tids = vec![INVALID_ZSTID; values.len()];
    let mut undo_ptr = INVALID_UNDO_PTR;
    store
        .multi_insert(ATTNO, &datums, &mut tids, xid, 0, &mut undo_ptr)
        .unwrap();
    store.registry().commit(xid);
}

fn scan_count(store: &ZedStore<MemUndoLog, impl zedstore::storage::Wal>) -> usize {
    let snapshot = store.registry().snapshot(99, 0);
    let mut scan = store.begin_scan(ATTNO, MIN_ZSTID, snapshot).unwrap();
    scan.collect_remaining().unwrap().len()
}

#[test]
fn checkpoint_to_mmap_and_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("table.zs");

    {
        let store = ZedStore::create(MemUndoLog::new(), NoopWal).unwrap();
        store.create_attribute(ATTNO, AttrDesc::fixed(8)).unwrap();
        insert_batch(&store, 10, 1000);

        let mut storage = MmapStorage::create(&path, 1).unwrap();
        store.pool().flush_to(&mut storage).unwrap();
    }

    let storage = MmapStorage::open(&path).unwrap();
    let pool = BufferPool::load(&storage).unwrap();
    let store = ZedStore::open(pool, MemUndoLog::new(), NoopWal).unwrap();

    assert_eq!(scan_count(&store), 1000);
}

#[test]
fn wal_replay_reconstructs_the_table() {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join("wal");

    {
        let wal = FileWal::create(&wal_path).unwrap();
        let store = ZedStore::create(MemUndoLog::new(), wal).unwrap();
        store.create_attribute(ATTNO, AttrDesc::fixed(8)).unwrap();
        insert_batch(&store, 10, 500);
        // The pool is dropped without ever being checkpointed: the WAL is
        // the only copy of the data.
    }

    let mut storage = MemStorage::new(0);
    let applied = FileWal::replay(&wal_path, &mut storage).unwrap();
    assert!(applied > 0);

    let pool = BufferPool::load(&storage).unwrap();
    let store = ZedStore::open(pool, MemUndoLog::new(), NoopWal).unwrap();
    assert_eq!(scan_count(&store), 500);
}

#[test]
fn wal_replay_is_idempotent() {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join("wal");

    {
        let wal = FileWal::create(&wal_path).unwrap();
        let store = ZedStore::create(MemUndoLog::new(), wal).unwrap();
        store.create_attribute(ATTNO, AttrDesc::fixed(8)).unwrap();
        insert_batch(&store, 10, 100);
    }

    let mut storage = MemStorage::new(0);
    FileWal::replay(&wal_path, &mut storage).unwrap();
    let first_pass: Vec<Vec<u8>> = (0..storage.page_count())
        .map(|blk| storage.page(blk).unwrap().to_vec())
        .collect();

    FileWal::replay(&wal_path, &mut storage).unwrap();
    for (blk, expected) in first_pass.iter().enumerate() {
        assert_eq!(
            storage.page(blk as u32).unwrap(),
            expected.as_slice(),
            "page {} changed on second replay",
            blk
        );
    }
}
