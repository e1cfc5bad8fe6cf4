//! Concurrent B+-tree index over buffer-managed pages.
//!
//! Traversal uses lock coupling: at most two node latches (parent and
//! child) are held at a time, and the parent is released as soon as the
//! child is safely reached. Inserts latch every node on the path
//! exclusively and split unsafe inner nodes proactively on the way down, so
//! a split never propagates more than one level. Lookups descend with
//! shared latches; erases latch inner nodes shared and only the leaf
//! exclusively.

pub mod node;

use self::node::{is_leaf, node_count, node_level, InnerNode, LeafNode, Storable};
use parking_lot::Mutex;
use quarry_buffer::{BufferManager, PageGuard};
use quarry_common::{PageId, Result};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The three traversal modes, with distinct latching rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Traversal {
    Lookup,
    Insert,
    Erase,
}

/// A latched leaf reached by a traversal. For inserts the level-1 parent
/// stays latched so a leaf split can publish its separator.
struct LeafHandle<'a> {
    parent: Option<PageGuard<'a>>,
    leaf: PageGuard<'a>,
}

/// Ordered key-value index on paged storage.
///
/// Keys and values are fixed-size [`Storable`] types. Duplicate inserts
/// overwrite the stored value; erasing an absent key is a no-op.
pub struct BTree<K, V> {
    segment_id: u16,
    buffer: Arc<BufferManager>,
    /// Page id of the root, None until the first insert. Updated only
    /// while the old root is latched exclusively.
    root: Mutex<Option<u64>>,
    /// Next unallocated page id in this segment.
    next_page: AtomicU64,
    _marker: PhantomData<fn(K, V)>,
}

impl<K: Storable + Ord, V: Storable> BTree<K, V> {
    /// Creates an empty tree over `segment_id`.
    pub fn new(segment_id: u16, buffer: Arc<BufferManager>) -> Self {
        let base = (segment_id as u64) << quarry_common::page::OFFSET_BITS;
        Self {
            segment_id,
            buffer,
            root: Mutex::new(None),
            next_page: AtomicU64::new(base),
            _marker: PhantomData,
        }
    }

    /// Returns the segment this tree lives in.
    pub fn segment_id(&self) -> u16 {
        self.segment_id
    }

    /// Looks up the value stored for `key`.
    pub fn lookup(&self, key: &K) -> Result<Option<V>> {
        let Some(handle) = self.find_leaf(key, Traversal::Lookup)? else {
            return Ok(None);
        };
        Ok(LeafNode::<K, V>::lookup(handle.leaf.data(), key))
    }

    /// Inserts an entry, overwriting the value of an existing key.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        {
            // First insert allocates the root leaf. A page that has never
            // been written reads as zeroes, which is a valid empty leaf, so
            // no initializing write is needed.
            let mut root = self.root.lock();
            if root.is_none() {
                *root = Some(self.allocate_page());
            }
        }

        let handle = self.find_leaf(&key, Traversal::Insert)?;
        let LeafHandle { parent, mut leaf } = handle.expect("tree has a root");

        let page_size = self.buffer.page_size();
        if (node_count(leaf.data()) as usize) < LeafNode::<K, V>::capacity(page_size) {
            drop(parent);
            LeafNode::<K, V>::insert(leaf.data_mut(), key, value);
            leaf.mark_dirty();
            return Ok(());
        }

        // Leaf is full: split it and route the separator to the parent.
        let sibling_pid = self.allocate_page();
        let mut sibling = self.buffer.fix(PageId::from_u64(sibling_pid), true)?;
        let separator = LeafNode::<K, V>::split(leaf.data_mut(), sibling.data_mut());

        match parent {
            Some(mut parent) => {
                InnerNode::<K>::insert(
                    parent.data_mut(),
                    separator,
                    leaf.page_id().as_u64(),
                    sibling_pid,
                );
                parent.mark_dirty();
            }
            None => {
                // The leaf was the root; grow the tree by one level. The
                // root pointer changes while the old root is still latched
                // exclusively.
                let new_root_pid = self.allocate_page();
                let mut new_root = self.buffer.fix(PageId::from_u64(new_root_pid), true)?;
                InnerNode::<K>::init_root(
                    new_root.data_mut(),
                    1,
                    separator,
                    leaf.page_id().as_u64(),
                    sibling_pid,
                );
                new_root.mark_dirty();
                *self.root.lock() = Some(new_root_pid);
            }
        }

        if separator < key {
            LeafNode::<K, V>::insert(sibling.data_mut(), key, value);
        } else {
            LeafNode::<K, V>::insert(leaf.data_mut(), key, value);
        }
        leaf.mark_dirty();
        sibling.mark_dirty();
        Ok(())
    }

    /// Removes the entry for `key` if present.
    pub fn erase(&self, key: &K) -> Result<()> {
        let Some(mut handle) = self.find_leaf(key, Traversal::Erase)? else {
            return Ok(());
        };
        if LeafNode::<K, V>::erase(handle.leaf.data_mut(), key) {
            handle.leaf.mark_dirty();
        }
        Ok(())
    }

    fn allocate_page(&self) -> u64 {
        self.next_page.fetch_add(1, Ordering::Relaxed)
    }

    /// Fixes the current root page, re-validating the root pointer after
    /// the latch is held: a concurrent root split may have finished between
    /// reading the pointer and latching the page.
    fn fix_root(&self, exclusive: bool) -> Result<Option<(u64, PageGuard<'_>)>> {
        loop {
            let Some(pid) = *self.root.lock() else {
                return Ok(None);
            };
            let guard = self.buffer.fix(PageId::from_u64(pid), exclusive)?;
            if *self.root.lock() == Some(pid) {
                return Ok(Some((pid, guard)));
            }
            // The root moved; retry against the new one.
        }
    }

    /// Descends to the leaf responsible for `key`.
    fn find_leaf(&self, key: &K, mode: Traversal) -> Result<Option<LeafHandle<'_>>> {
        let root_exclusive = mode == Traversal::Insert;
        let Some((root_pid, mut parent)) = self.fix_root(root_exclusive)? else {
            return Ok(None);
        };

        if is_leaf(parent.data()) {
            if mode != Traversal::Erase {
                return Ok(Some(LeafHandle {
                    parent: None,
                    leaf: parent,
                }));
            }
            // Erase needs the leaf exclusive; refix and re-validate.
            drop(parent);
            let Some((_, guard)) = self.fix_root(true)? else {
                return Ok(None);
            };
            if is_leaf(guard.data()) {
                return Ok(Some(LeafHandle {
                    parent: None,
                    leaf: guard,
                }));
            }
            // The root grew while we were refixing; restart as a normal
            // descent.
            drop(guard);
            return self.find_leaf(key, mode);
        }

        // The root is an inner node. For inserts, split it proactively
        // while its exclusive latch is still held.
        if mode == Traversal::Insert && InnerNode::<K>::is_unsafe(parent.data()) {
            let sibling_pid = self.allocate_page();
            let mut sibling = self.buffer.fix(PageId::from_u64(sibling_pid), true)?;
            let separator = InnerNode::<K>::split(parent.data_mut(), sibling.data_mut());
            parent.mark_dirty();
            sibling.mark_dirty();

            let new_root_pid = self.allocate_page();
            let mut new_root = self.buffer.fix(PageId::from_u64(new_root_pid), true)?;
            let level = node_level(parent.data()) + 1;
            InnerNode::<K>::init_root(new_root.data_mut(), level, separator, root_pid, sibling_pid);
            new_root.mark_dirty();
            *self.root.lock() = Some(new_root_pid);

            if separator < *key {
                parent = sibling;
            }
        }

        // Lock-coupled descent: fix the child, then release the parent.
        loop {
            let level = node_level(parent.data());
            debug_assert!(level >= 1);
            let child_pid = InnerNode::<K>::lookup_child(parent.data(), key);
            let child_exclusive = match mode {
                Traversal::Insert => true,
                Traversal::Lookup => false,
                Traversal::Erase => level == 1,
            };
            let mut child = self.buffer.fix(PageId::from_u64(child_pid), child_exclusive)?;

            if level == 1 {
                debug_assert!(is_leaf(child.data()));
                let parent = (mode == Traversal::Insert).then_some(parent);
                return Ok(Some(LeafHandle {
                    parent,
                    leaf: child,
                }));
            }

            if mode == Traversal::Insert && InnerNode::<K>::is_unsafe(child.data()) {
                // Split the child before descending past it; the parent is
                // safe by induction, so the separator always fits.
                let sibling_pid = self.allocate_page();
                let mut sibling = self.buffer.fix(PageId::from_u64(sibling_pid), true)?;
                let separator = InnerNode::<K>::split(child.data_mut(), sibling.data_mut());
                InnerNode::<K>::insert(parent.data_mut(), separator, child_pid, sibling_pid);
                parent.mark_dirty();
                child.mark_dirty();
                sibling.mark_dirty();
                if separator < *key {
                    child = sibling;
                }
            }

            parent = child;
        }
    }
}
