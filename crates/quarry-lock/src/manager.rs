//! Lock manager: a chained hash table of reference-counted lock records.
//!
//! Each data item maps to a [`Lock`] record in a fixed-size bucket table.
//! Transactions keep strong handles to the records they own; the bucket
//! chains hold only weak references. A record whose last handle is gone
//! has expired and is unlinked by whichever thread next walks its chain,
//! so releasing a lock never rewrites a chain.
//!
//! Lock ordering: bucket mutex before record metadata mutex; neither is
//! held while blocking on the reader-writer lock, and the waits-for graph
//! mutex is leaf-level.

use crate::graph::WaitsForGraph;
use crate::TxnId;
use log::trace;
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::{Mutex, RawRwLock};
use quarry_common::Result;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

/// Identifier of a lockable data item, usually a TID.
pub type DataItem = u64;

/// Locking mode of a data item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Unlocked,
    Shared,
    Exclusive,
}

/// Owner and waiter bookkeeping of one lock record.
struct LockMeta {
    mode: LockMode,
    owners: Vec<TxnId>,
    waiters: Vec<TxnId>,
}

/// A lock on one data item.
pub struct Lock {
    item: DataItem,
    /// The lock proper. Raw because transactions release it from `Drop`,
    /// outside the scope that acquired it.
    raw: RawRwLock,
    /// Guards owners, waiters, and the published mode.
    meta: Mutex<LockMeta>,
}

impl Lock {
    fn new(item: DataItem) -> Self {
        Self {
            item,
            raw: RawRwLock::INIT,
            meta: Mutex::new(LockMeta {
                mode: LockMode::Unlocked,
                owners: Vec::new(),
                waiters: Vec::new(),
            }),
        }
    }

    /// Returns the data item this record locks.
    pub fn item(&self) -> DataItem {
        self.item
    }

    /// Returns the currently published mode.
    pub fn mode(&self) -> LockMode {
        self.meta.lock().mode
    }

    /// Releases the underlying reader-writer lock.
    ///
    /// # Safety
    /// The caller must have acquired the lock in exactly `mode` and not
    /// released it since.
    unsafe fn release_raw(&self, mode: LockMode) {
        match mode {
            LockMode::Shared => unsafe { self.raw.unlock_shared() },
            LockMode::Exclusive => unsafe { self.raw.unlock_exclusive() },
            LockMode::Unlocked => unreachable!("held locks are shared or exclusive"),
        }
    }
}

struct Bucket {
    chain: Mutex<Vec<Weak<Lock>>>,
}

/// Concurrency-safe acquisition and release of data-item locks with
/// deadlock detection.
pub struct LockManager {
    buckets: Box<[Bucket]>,
    wfg: WaitsForGraph,
}

impl LockManager {
    /// Creates a lock manager with a fixed number of hash buckets. The
    /// count is fixed up front so chains never rehash.
    pub fn new(bucket_count: usize) -> Self {
        let buckets = (0..bucket_count.max(1))
            .map(|_| Bucket {
                chain: Mutex::new(Vec::new()),
            })
            .collect();
        Self {
            buckets,
            wfg: WaitsForGraph::new(),
        }
    }

    pub(crate) fn graph(&self) -> &WaitsForGraph {
        &self.wfg
    }

    fn bucket(&self, item: DataItem) -> &Bucket {
        let mut hasher = DefaultHasher::new();
        item.hash(&mut hasher);
        &self.buckets[(hasher.finish() as usize) % self.buckets.len()]
    }

    /// Returns the current mode of a data item. Expired records report
    /// `Unlocked`.
    pub fn mode_of(&self, item: DataItem) -> LockMode {
        let chain = self.bucket(item).chain.lock();
        for weak in chain.iter() {
            if let Some(lock) = weak.upgrade() {
                if lock.item == item {
                    return lock.mode();
                }
            }
        }
        LockMode::Unlocked
    }

    /// Finds or creates the record for `item`, unlinking expired records
    /// along the chain.
    fn lock_record(&self, item: DataItem) -> Arc<Lock> {
        let mut chain = self.bucket(item).chain.lock();
        let mut found = None;
        chain.retain(|weak| match weak.upgrade() {
            Some(lock) => {
                if found.is_none() && lock.item == item {
                    found = Some(lock);
                }
                true
            }
            None => false,
        });
        found.unwrap_or_else(|| {
            let lock = Arc::new(Lock::new(item));
            chain.push(Arc::downgrade(&lock));
            lock
        })
    }

    /// Acquires `item` in `mode` on behalf of `txn`.
    ///
    /// Blocks while incompatible owners hold the item. If waiting would
    /// close a cycle in the waits-for graph, the wait edges are backed out
    /// and the call fails with a deadlock error.
    pub(crate) fn acquire(&self, txn: TxnId, item: DataItem, mode: LockMode) -> Result<Arc<Lock>> {
        debug_assert_ne!(mode, LockMode::Unlocked);
        let lock = self.lock_record(item);

        let mut meta = lock.meta.lock();
        let acquired = match mode {
            LockMode::Shared => lock.raw.try_lock_shared(),
            _ => lock.raw.try_lock_exclusive(),
        };
        if acquired {
            meta.mode = mode;
            meta.owners.push(txn);
            // Whoever was already queued now waits on us as well.
            self.wfg.add_waiters(txn, &meta.waiters);
            drop(meta);
            return Ok(lock);
        }

        // Contended: publish the wait, check for deadlock, then block
        // without holding any mutex.
        self.wfg.add_waits_for(txn, &meta.owners)?;
        meta.waiters.push(txn);
        drop(meta);

        trace!("transaction {txn} blocks on item {item}");
        match mode {
            LockMode::Shared => lock.raw.lock_shared(),
            _ => lock.raw.lock_exclusive(),
        }

        let mut meta = lock.meta.lock();
        meta.waiters.retain(|t| *t != txn);
        meta.mode = mode;
        meta.owners.push(txn);
        self.wfg.add_waiters(txn, &meta.waiters);
        drop(meta);
        Ok(lock)
    }

    /// Releases one held lock of a finished transaction.
    pub(crate) fn release(&self, txn: TxnId, lock: &Lock, mode: LockMode) {
        {
            let mut meta = lock.meta.lock();
            meta.owners.retain(|t| *t != txn);
            if meta.owners.is_empty() {
                meta.mode = LockMode::Unlocked;
            }
        }
        // SAFETY: `txn` acquired `lock.raw` in exactly `mode`, and strict
        // two-phase locking guarantees it has not been released before.
        unsafe { lock.release_raw(mode) };
    }

    /// Number of unexpired lock records, for tests.
    #[cfg(test)]
    fn live_lock_count(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| {
                b.chain
                    .lock()
                    .iter()
                    .filter(|w| w.upgrade().is_some())
                    .count()
            })
            .sum()
    }
}
