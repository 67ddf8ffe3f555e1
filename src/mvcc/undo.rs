//! # Undo Log Collaborator
//!
//! Every logical operation on a tree appends exactly one undo record and
//! stamps the returned pointer on the affected item. Records chain through
//! their `prev` pointer so the full modification history of a TID can be
//! walked backwards.
//!
//! The log itself lives outside the engine; `MemUndoLog` is the in-process
//! reference implementation. Discarding the log tail (advancing the oldest
//! retained pointer) is how VACUUM makes dead items prunable.

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::Result;
use parking_lot::Mutex;

use super::{CommandId, TxnId, UndoPtr, INVALID_UNDO_PTR};
use crate::tid::ZsTid;

/// Tuple-lock strength, as requested by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Share,
    Exclusive,
}

/// What to do when a tuple lock conflicts with an in-progress transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Wait for the conflicting transaction (delegated to the host).
    Block,
    /// Fail immediately with a conflict.
    Error,
    /// Skip the conflicting tuple.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoOp {
    Insert {
        attno: u16,
        first_tid: ZsTid,
        last_tid: ZsTid,
    },
    Delete {
        attno: u16,
        tid: ZsTid,
        prev: UndoPtr,
    },
    Update {
        attno: u16,
        old_tid: ZsTid,
        new_tid: ZsTid,
        prev: UndoPtr,
    },
    TupleLock {
        attno: u16,
        tid: ZsTid,
        mode: LockMode,
        prev: UndoPtr,
    },
}

impl UndoOp {
    /// The previous record in this TID's chain, if any.
    pub fn prev(&self) -> UndoPtr {
        match *self {
            UndoOp::Insert { .. } => INVALID_UNDO_PTR,
            UndoOp::Delete { prev, .. } => prev,
            UndoOp::Update { prev, .. } => prev,
            UndoOp::TupleLock { prev, .. } => prev,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoRecord {
    pub xid: TxnId,
    pub cid: CommandId,
    pub op: UndoOp,
}

/// The undo log interface the engine depends on.
pub trait UndoLog: Send + Sync {
    /// Appends a record, returning its stable pointer.
    fn append(&self, record: UndoRecord) -> Result<UndoPtr>;

    /// Fetches a record; `None` if the pointer has been discarded.
    fn fetch(&self, ptr: UndoPtr) -> Result<Option<UndoRecord>>;

    /// The oldest pointer any snapshot may still need. Items flagged dead
    /// with an older pointer can be physically pruned.
    fn oldest_retained_ptr(&self) -> UndoPtr;
}

/// In-process undo log. Pointer counters are 1-based record indexes.
#[derive(Debug, Default)]
pub struct MemUndoLog {
    records: Mutex<Vec<UndoRecord>>,
    oldest: AtomicU64,
}

impl MemUndoLog {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            oldest: AtomicU64::new(1),
        }
    }

    /// Advances the retention horizon: pointers with `counter < ptr.counter`
    /// become unfetchable, as if the log tail were recycled.
    pub fn discard_up_to(&self, ptr: UndoPtr) {
        self.oldest.fetch_max(ptr.counter, Ordering::AcqRel);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UndoLog for MemUndoLog {
    fn append(&self, record: UndoRecord) -> Result<UndoPtr> {
        let mut records = self.records.lock();
        records.push(record);
        Ok(UndoPtr {
            counter: records.len() as u64,
        })
    }

    fn fetch(&self, ptr: UndoPtr) -> Result<Option<UndoRecord>> {
        if !ptr.is_valid() || ptr.counter < self.oldest.load(Ordering::Acquire) {
            return Ok(None);
        }
        let records = self.records.lock();
        Ok(records.get(ptr.counter as usize - 1).copied())
    }

    fn oldest_retained_ptr(&self) -> UndoPtr {
        UndoPtr {
            counter: self.oldest.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_record(xid: TxnId) -> UndoRecord {
        UndoRecord {
            xid,
            cid: 0,
            op: UndoOp::Insert {
                attno: 1,
                first_tid: 1,
                last_tid: 5,
            },
        }
    }

    #[test]
    fn append_returns_increasing_pointers() {
        let log = MemUndoLog::new();

        let a = log.append(insert_record(10)).unwrap();
        let b = log.append(insert_record(11)).unwrap();

        assert!(a < b);
        assert_eq!(a.counter, 1);
        assert_eq!(b.counter, 2);
    }

    #[test]
    fn fetch_returns_appended_record() {
        let log = MemUndoLog::new();
        let ptr = log.append(insert_record(42)).unwrap();

        let record = log.fetch(ptr).unwrap().unwrap();
        assert_eq!(record.xid, 42);
    }

    #[test]
    fn fetch_of_invalid_pointer_is_none() {
        let log = MemUndoLog::new();
        assert!(log.fetch(INVALID_UNDO_PTR).unwrap().is_none());
    }

    #[test]
    fn discarded_records_become_unfetchable() {
        let log = MemUndoLog::new();
        let a = log.append(insert_record(1)).unwrap();
        let b = log.append(insert_record(2)).unwrap();

        log.discard_up_to(b);

        assert!(log.fetch(a).unwrap().is_none());
        assert!(log.fetch(b).unwrap().is_some());
        assert_eq!(log.oldest_retained_ptr(), b);
    }

    #[test]
    fn prev_chains_through_every_record_kind() {
        let prev = UndoPtr { counter: 9 };

        assert_eq!(
            UndoOp::Delete {
                attno: 1,
                tid: 3,
                prev
            }
            .prev(),
            prev
        );
        assert_eq!(
            UndoOp::Update {
                attno: 1,
                old_tid: 3,
                new_tid: 8,
                prev
            }
            .prev(),
            prev
        );
        assert_eq!(
            UndoOp::TupleLock {
                attno: 1,
                tid: 3,
                mode: LockMode::Exclusive,
                prev
            }
            .prev(),
            prev
        );
        assert_eq!(
            UndoOp::Insert {
                attno: 1,
                first_tid: 1,
                last_tid: 1
            }
            .prev(),
            INVALID_UNDO_PTR
        );
    }
}
