//! Buffer frame management.

use parking_lot::RwLock;
use quarry_common::PageId;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Life-cycle state of a buffer frame.
///
/// The three transient states are not interchangeable: `Loading` marks a
/// frame whose payload is being read from disk, `Evicting` marks a frame
/// whose payload is being written back by an evictor, and `Reloaded` marks
/// an evicting frame that was re-fixed while the write-back was in flight.
/// Only a frame still in `Evicting` when its write-back completes may be
/// removed from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameState {
    /// Frame exists in the table but holds no page data yet.
    New = 0,
    /// Payload is being read from disk.
    Loading = 1,
    /// Payload reflects the on-disk page (possibly with dirty changes).
    Loaded = 2,
    /// An evictor is writing the payload back to disk.
    Evicting = 3,
    /// The frame was re-fixed while an eviction write-back was in flight.
    Reloaded = 4,
}

impl FrameState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => FrameState::New,
            1 => FrameState::Loading,
            2 => FrameState::Loaded,
            3 => FrameState::Evicting,
            4 => FrameState::Reloaded,
            _ => unreachable!("invalid frame state {value}"),
        }
    }
}

/// Which replacement queue a frame currently sits in. A frame is a member of
/// at most one queue at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueKind {
    None = 0,
    Fifo = 1,
    Lru = 2,
}

impl QueueKind {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => QueueKind::None,
            1 => QueueKind::Fifo,
            2 => QueueKind::Lru,
            _ => unreachable!("invalid queue kind {value}"),
        }
    }
}

/// A frame in the buffer pool holding a single page.
///
/// The payload lives behind a reader-writer latch that fixers hold for the
/// whole duration of a fix. The remaining metadata is atomic; it is only
/// mutated while the pool's global mutex is held, the atomics merely make
/// unsynchronized reads sound.
pub struct BufferFrame {
    /// The page held by this frame.
    pid: PageId,
    /// Page payload, latched for the duration of a fix.
    data: Arc<RwLock<Box<[u8]>>>,
    /// Life-cycle state.
    state: AtomicU8,
    /// Number of fixes currently outstanding.
    users: AtomicUsize,
    /// Whether the payload differs from the on-disk page.
    dirty: AtomicBool,
    /// Replacement queue membership.
    queue: AtomicU8,
}

impl BufferFrame {
    /// Creates a new frame for `pid` with a zeroed payload of `page_size`
    /// bytes.
    pub fn new(pid: PageId, page_size: usize) -> Self {
        Self {
            pid,
            data: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            state: AtomicU8::new(FrameState::New as u8),
            users: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
            queue: AtomicU8::new(QueueKind::None as u8),
        }
    }

    /// Returns the page id held by this frame.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.pid
    }

    /// Returns the latch-protected payload.
    #[inline]
    pub(crate) fn data(&self) -> &Arc<RwLock<Box<[u8]>>> {
        &self.data
    }

    #[inline]
    pub fn state(&self) -> FrameState {
        FrameState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FrameState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn users(&self) -> usize {
        self.users.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn inc_users(&self) {
        self.users.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn dec_users(&self) {
        let prev = self.users.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "user count underflow");
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    #[inline]
    pub(crate) fn queue(&self) -> QueueKind {
        QueueKind::from_u8(self.queue.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_queue(&self, queue: QueueKind) {
        self.queue.store(queue as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferFrame")
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("users", &self.users())
            .field("dirty", &self.is_dirty())
            .field("queue", &self.queue())
            .finish()
    }
}
