//! # Snapshots and Visibility
//!
//! Visibility is decided from three inputs: the item's flags (do they claim a
//! delete/update happened?), the item's undo pointer (who did the latest
//! operation?), and the reader's snapshot. The transaction registry supplies
//! commit ordering: every commit gets a sequence number, and a snapshot sees
//! exactly the transactions whose sequence number is at or below its own.
//!
//! Two predicates are exposed:
//!
//! - `satisfies`: plain read visibility for scans and point lookups.
//! - `satisfies_update`: the delete/update/lock precheck. Besides yes/no it
//!   classifies conflicts ({Invisible, Updated, BeingModified, SelfUpdated,
//!   WouldBlock}) and reports whether a new undo record should chain to the
//!   item's current one (`keep_old_undo_ptr` is false when the current
//!   record belongs to an aborted transaction).

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::RwLock;

use super::undo::{UndoLog, UndoOp};
use super::{CommandId, TxnId, UndoPtr};
use crate::btree::item::flags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    InProgress,
    Committed { seq: u64 },
    Aborted,
}

/// Commit bookkeeping for the visibility checks. The host's transaction
/// manager owns this in production; tests drive it directly.
#[derive(Debug, Default)]
pub struct TransactionRegistry {
    txns: RwLock<HashMap<TxnId, TxnStatus>>,
    next_seq: AtomicU64,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self {
            txns: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn begin(&self, xid: TxnId) {
        self.txns.write().insert(xid, TxnStatus::InProgress);
    }

    pub fn commit(&self, xid: TxnId) {
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        self.txns.write().insert(xid, TxnStatus::Committed { seq });
    }

    pub fn abort(&self, xid: TxnId) {
        self.txns.write().insert(xid, TxnStatus::Aborted);
    }

    /// `None` means the transaction predates the registry; such transactions
    /// are treated as committed before every snapshot.
    pub fn status(&self, xid: TxnId) -> Option<TxnStatus> {
        self.txns.read().get(&xid).copied()
    }

    /// Takes a snapshot for `xid` at its current command.
    pub fn snapshot(&self, xid: TxnId, cid: CommandId) -> Snapshot {
        Snapshot {
            xid,
            cid,
            seq: self.next_seq.load(Ordering::Acquire) - 1,
        }
    }
}

/// A point-in-time view: sees commits with `seq <= self.seq`, plus this
/// transaction's own earlier commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub xid: TxnId,
    pub cid: CommandId,
    pub seq: u64,
}

/// Outcome of the update-precheck, mirroring the host's tuple-modification
/// result codes. Everything except `Ok` is recovered by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Ok,
    Invisible,
    Updated,
    BeingModified,
    SelfUpdated,
    WouldBlock,
}

pub struct VisibilityChecker<'a, U: UndoLog + ?Sized> {
    undo: &'a U,
    registry: &'a TransactionRegistry,
}

impl<'a, U: UndoLog + ?Sized> VisibilityChecker<'a, U> {
    pub fn new(undo: &'a U, registry: &'a TransactionRegistry) -> Self {
        Self { undo, registry }
    }

    fn xid_visible(&self, snapshot: &Snapshot, xid: TxnId, cid: CommandId) -> bool {
        if xid == snapshot.xid {
            return cid < snapshot.cid;
        }
        match self.registry.status(xid) {
            Some(TxnStatus::Committed { seq }) => seq <= snapshot.seq,
            Some(_) => false,
            None => true,
        }
    }

    /// Is an item with `item_flags` / `undo_ptr` visible to `snapshot`?
    pub fn satisfies(
        &self,
        snapshot: &Snapshot,
        item_flags: u16,
        undo_ptr: UndoPtr,
    ) -> Result<bool> {
        if item_flags & flags::DEAD != 0 {
            return Ok(false);
        }

        let latest_deleted = item_flags & (flags::DELETED | flags::UPDATED) != 0;

        let record = self.undo.fetch(undo_ptr)?;
        let record = match record {
            // History trimmed or never existed: the latest operation is
            // older than any snapshot.
            None => return Ok(!latest_deleted),
            Some(r) => r,
        };

        match record.op {
            UndoOp::Insert { .. } => Ok(self.xid_visible(snapshot, record.xid, record.cid)),
            UndoOp::Delete { prev, .. } | UndoOp::Update { prev, .. } => {
                if self.xid_visible(snapshot, record.xid, record.cid) {
                    return Ok(false);
                }
                self.visible_via_chain(snapshot, prev)
            }
            UndoOp::TupleLock { prev, .. } => self.visible_via_chain(snapshot, prev),
        }
    }

    /// Walks the undo chain past locks and invisible deletions down to the
    /// inserting record.
    fn visible_via_chain(&self, snapshot: &Snapshot, mut ptr: UndoPtr) -> Result<bool> {
        loop {
            let record = match self.undo.fetch(ptr)? {
                None => return Ok(true),
                Some(r) => r,
            };
            match record.op {
                UndoOp::Insert { .. } => {
                    return Ok(self.xid_visible(snapshot, record.xid, record.cid))
                }
                UndoOp::Delete { prev, .. } | UndoOp::Update { prev, .. } => {
                    if self.xid_visible(snapshot, record.xid, record.cid) {
                        return Ok(false);
                    }
                    ptr = prev;
                }
                UndoOp::TupleLock { prev, .. } => ptr = prev,
            }
        }
    }

    /// Precheck for delete/update/lock. Returns the result code and whether
    /// a new undo record should chain to the item's current pointer.
    pub fn satisfies_update(
        &self,
        snapshot: &Snapshot,
        item_flags: u16,
        undo_ptr: UndoPtr,
    ) -> Result<(UpdateResult, bool)> {
        if item_flags & flags::DEAD != 0 {
            return Ok((UpdateResult::Invisible, true));
        }

        self.satisfies_update_at(snapshot, item_flags, undo_ptr)
    }

    fn satisfies_update_at(
        &self,
        snapshot: &Snapshot,
        item_flags: u16,
        undo_ptr: UndoPtr,
    ) -> Result<(UpdateResult, bool)> {
        let latest_deleted = item_flags & (flags::DELETED | flags::UPDATED) != 0;

        let record = match self.undo.fetch(undo_ptr)? {
            None => {
                // Trimmed history: any deletion is long committed.
                if latest_deleted {
                    return Ok((UpdateResult::Invisible, true));
                }
                return Ok((UpdateResult::Ok, true));
            }
            Some(r) => r,
        };

        let own = record.xid == snapshot.xid;
        let status = self.registry.status(record.xid);

        match record.op {
            UndoOp::Insert { .. } => {
                if own {
                    if record.cid < snapshot.cid {
                        Ok((UpdateResult::Ok, true))
                    } else {
                        Ok((UpdateResult::Invisible, true))
                    }
                } else {
                    match status {
                        Some(TxnStatus::Committed { seq }) if seq <= snapshot.seq => {
                            Ok((UpdateResult::Ok, true))
                        }
                        Some(TxnStatus::Committed { .. }) => Ok((UpdateResult::Invisible, true)),
                        Some(TxnStatus::InProgress) => Ok((UpdateResult::Invisible, true)),
                        Some(TxnStatus::Aborted) => Ok((UpdateResult::Invisible, false)),
                        None => Ok((UpdateResult::Ok, true)),
                    }
                }
            }
            UndoOp::Delete { .. } | UndoOp::Update { .. } => {
                if own {
                    if record.cid >= snapshot.cid {
                        Ok((UpdateResult::SelfUpdated, true))
                    } else {
                        Ok((UpdateResult::Invisible, true))
                    }
                } else {
                    match status {
                        Some(TxnStatus::InProgress) => Ok((UpdateResult::BeingModified, true)),
                        Some(TxnStatus::Committed { seq }) if seq <= snapshot.seq => {
                            Ok((UpdateResult::Invisible, true))
                        }
                        Some(TxnStatus::Committed { .. }) => Ok((UpdateResult::Updated, true)),
                        // The deletion rolled back: the tuple is live, and
                        // new undo records must not chain to the aborted one.
                        Some(TxnStatus::Aborted) => Ok((UpdateResult::Ok, false)),
                        None => Ok((UpdateResult::Invisible, true)),
                    }
                }
            }
            UndoOp::TupleLock { prev, .. } => {
                if own {
                    return Ok((UpdateResult::Ok, true));
                }
                match status {
                    Some(TxnStatus::InProgress) => Ok((UpdateResult::BeingModified, true)),
                    Some(TxnStatus::Aborted) => {
                        let (result, _) = self.satisfies_update_at(snapshot, item_flags, prev)?;
                        Ok((result, false))
                    }
                    _ => self.satisfies_update_at(snapshot, item_flags, prev),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::undo::{LockMode, MemUndoLog, UndoRecord};
    use crate::mvcc::INVALID_UNDO_PTR;

    struct Fixture {
        undo: MemUndoLog,
        registry: TransactionRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                undo: MemUndoLog::new(),
                registry: TransactionRegistry::new(),
            }
        }

        fn checker(&self) -> VisibilityChecker<'_, MemUndoLog> {
            VisibilityChecker::new(&self.undo, &self.registry)
        }

        fn insert(&self, xid: TxnId, cid: CommandId) -> UndoPtr {
            self.undo
                .append(UndoRecord {
                    xid,
                    cid,
                    op: UndoOp::Insert {
                        attno: 1,
                        first_tid: 1,
                        last_tid: 1,
                    },
                })
                .unwrap()
        }

        fn delete(&self, xid: TxnId, cid: CommandId, prev: UndoPtr) -> UndoPtr {
            self.undo
                .append(UndoRecord {
                    xid,
                    cid,
                    op: UndoOp::Delete {
                        attno: 1,
                        tid: 1,
                        prev,
                    },
                })
                .unwrap()
        }
    }

    #[test]
    fn committed_insert_is_visible_to_later_snapshot() {
        let f = Fixture::new();
        f.registry.begin(10);
        let ptr = f.insert(10, 0);
        f.registry.commit(10);

        let snap = f.registry.snapshot(20, 0);
        assert!(f.checker().satisfies(&snap, 0, ptr).unwrap());
    }

    #[test]
    fn uncommitted_insert_is_invisible_to_others_but_visible_to_self() {
        let f = Fixture::new();
        f.registry.begin(10);
        let ptr = f.insert(10, 0);

        let other = f.registry.snapshot(20, 0);
        assert!(!f.checker().satisfies(&other, 0, ptr).unwrap());

        let own = f.registry.snapshot(10, 1);
        assert!(f.checker().satisfies(&own, 0, ptr).unwrap());

        // Same command that did the insert does not see it yet.
        let same_cid = f.registry.snapshot(10, 0);
        assert!(!f.checker().satisfies(&same_cid, 0, ptr).unwrap());
    }

    #[test]
    fn aborted_insert_is_invisible() {
        let f = Fixture::new();
        f.registry.begin(10);
        let ptr = f.insert(10, 0);
        f.registry.abort(10);

        let snap = f.registry.snapshot(20, 0);
        assert!(!f.checker().satisfies(&snap, 0, ptr).unwrap());
    }

    #[test]
    fn commit_after_snapshot_is_invisible() {
        let f = Fixture::new();
        f.registry.begin(10);
        let ptr = f.insert(10, 0);

        let snap = f.registry.snapshot(20, 0);
        f.registry.commit(10);

        assert!(!f.checker().satisfies(&snap, 0, ptr).unwrap());
    }

    #[test]
    fn committed_delete_hides_the_tuple() {
        let f = Fixture::new();
        f.registry.begin(10);
        let insert_ptr = f.insert(10, 0);
        f.registry.commit(10);

        f.registry.begin(11);
        let delete_ptr = f.delete(11, 0, insert_ptr);
        f.registry.commit(11);

        let snap = f.registry.snapshot(20, 0);
        assert!(!f
            .checker()
            .satisfies(&snap, flags::DELETED, delete_ptr)
            .unwrap());
    }

    #[test]
    fn in_progress_delete_keeps_old_version_visible() {
        let f = Fixture::new();
        f.registry.begin(10);
        let insert_ptr = f.insert(10, 0);
        f.registry.commit(10);

        f.registry.begin(11);
        let delete_ptr = f.delete(11, 0, insert_ptr);

        let snap = f.registry.snapshot(20, 0);
        assert!(f
            .checker()
            .satisfies(&snap, flags::DELETED, delete_ptr)
            .unwrap());
    }

    #[test]
    fn trimmed_history_means_base_visibility() {
        let f = Fixture::new();
        let snap = f.registry.snapshot(20, 0);
        let checker = f.checker();

        assert!(checker.satisfies(&snap, 0, INVALID_UNDO_PTR).unwrap());
        assert!(!checker
            .satisfies(&snap, flags::DELETED, INVALID_UNDO_PTR)
            .unwrap());
        assert!(!checker
            .satisfies(&snap, flags::UPDATED, INVALID_UNDO_PTR)
            .unwrap());
    }

    #[test]
    fn dead_items_are_invisible_to_everyone() {
        let f = Fixture::new();
        let snap = f.registry.snapshot(20, 0);
        assert!(!f
            .checker()
            .satisfies(&snap, flags::DEAD, INVALID_UNDO_PTR)
            .unwrap());
    }

    #[test]
    fn update_check_reports_being_modified_for_in_progress_delete() {
        let f = Fixture::new();
        f.registry.begin(10);
        let insert_ptr = f.insert(10, 0);
        f.registry.commit(10);

        f.registry.begin(11);
        let delete_ptr = f.delete(11, 0, insert_ptr);

        let snap = f.registry.snapshot(20, 0);
        let (result, keep) = f
            .checker()
            .satisfies_update(&snap, flags::DELETED, delete_ptr)
            .unwrap();

        assert_eq!(result, UpdateResult::BeingModified);
        assert!(keep);
    }

    #[test]
    fn update_check_reports_updated_for_commit_after_snapshot() {
        let f = Fixture::new();
        f.registry.begin(10);
        let insert_ptr = f.insert(10, 0);
        f.registry.commit(10);

        let snap = f.registry.snapshot(20, 0);

        f.registry.begin(11);
        let delete_ptr = f.delete(11, 0, insert_ptr);
        f.registry.commit(11);

        let (result, keep) = f
            .checker()
            .satisfies_update(&snap, flags::DELETED, delete_ptr)
            .unwrap();

        assert_eq!(result, UpdateResult::Updated);
        assert!(keep);
    }

    #[test]
    fn update_check_drops_chain_to_aborted_delete() {
        let f = Fixture::new();
        f.registry.begin(10);
        let insert_ptr = f.insert(10, 0);
        f.registry.commit(10);

        f.registry.begin(11);
        let delete_ptr = f.delete(11, 0, insert_ptr);
        f.registry.abort(11);

        let snap = f.registry.snapshot(20, 0);
        let (result, keep) = f
            .checker()
            .satisfies_update(&snap, flags::DELETED, delete_ptr)
            .unwrap();

        assert_eq!(result, UpdateResult::Ok);
        assert!(!keep);
    }

    #[test]
    fn update_check_reports_self_updated_within_command() {
        let f = Fixture::new();
        f.registry.begin(10);
        let insert_ptr = f.insert(10, 0);
        f.registry.commit(10);

        f.registry.begin(11);
        let delete_ptr = f.delete(11, 2, insert_ptr);

        let snap = f.registry.snapshot(11, 2);
        let (result, _) = f
            .checker()
            .satisfies_update(&snap, flags::DELETED, delete_ptr)
            .unwrap();

        assert_eq!(result, UpdateResult::SelfUpdated);
    }

    #[test]
    fn update_check_sees_through_own_tuple_lock() {
        let f = Fixture::new();
        f.registry.begin(10);
        let insert_ptr = f.insert(10, 0);
        f.registry.commit(10);

        f.registry.begin(11);
        let lock_ptr = f
            .undo
            .append(UndoRecord {
                xid: 11,
                cid: 0,
                op: UndoOp::TupleLock {
                    attno: 1,
                    tid: 1,
                    mode: LockMode::Exclusive,
                    prev: insert_ptr,
                },
            })
            .unwrap();

        let own = f.registry.snapshot(11, 1);
        let (result, _) = f.checker().satisfies_update(&own, 0, lock_ptr).unwrap();
        assert_eq!(result, UpdateResult::Ok);

        let other = f.registry.snapshot(20, 0);
        let (result, _) = f.checker().satisfies_update(&other, 0, lock_ptr).unwrap();
        assert_eq!(result, UpdateResult::BeingModified);
    }
}
