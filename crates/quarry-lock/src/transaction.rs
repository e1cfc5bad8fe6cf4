//! Transactions: lock ownership with strict two-phase release.

use crate::manager::{DataItem, Lock, LockManager, LockMode};
use parking_lot::Mutex;
use quarry_common::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Transaction identifier. Ids are process-unique and start at 1; 0 never
/// occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(pub u64);

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// One lock held by a transaction, remembered with its acquisition mode so
/// the release matches.
struct HeldLock {
    lock: Arc<Lock>,
    mode: LockMode,
}

/// A transaction holding locks until it is dropped.
///
/// Strict two-phase locking: locks accumulate over the transaction's
/// lifetime and are released together on drop, never earlier. A
/// transaction must not re-acquire an item it already holds; in particular
/// there is no shared-to-exclusive upgrade.
pub struct Transaction {
    id: TxnId,
    manager: Arc<LockManager>,
    held: Mutex<Vec<HeldLock>>,
}

impl Transaction {
    /// Starts a transaction against a lock manager.
    pub fn new(manager: Arc<LockManager>) -> Self {
        Self {
            id: TxnId(NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed)),
            manager,
            held: Mutex::new(Vec::new()),
        }
    }

    /// Returns this transaction's id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Number of locks currently held.
    pub fn lock_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Acquires `item` in `mode`, blocking while incompatible owners hold
    /// it.
    ///
    /// Fails with a deadlock error if waiting would close a cycle in the
    /// waits-for graph. The transaction keeps its earlier locks in that
    /// case; the caller is expected to drop it (releasing everything) and
    /// retry.
    pub fn acquire(&self, item: DataItem, mode: LockMode) -> Result<()> {
        let lock = self.manager.acquire(self.id, item, mode)?;
        self.held.lock().push(HeldLock { lock, mode });
        Ok(())
    }
}

impl Drop for Transaction {
    /// Leaves the waits-for graph, then releases every held lock in its
    /// acquisition mode.
    fn drop(&mut self) {
        self.manager.graph().remove(self.id);
        let held = std::mem::take(&mut *self.held.lock());
        for entry in held {
            self.manager.release(self.id, &entry.lock, entry.mode);
        }
    }
}
