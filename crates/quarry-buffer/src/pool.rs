//! Buffer manager with two-queue replacement.
//!
//! The manager keeps a bounded set of page frames in memory. A single global
//! mutex guards the frame table, the two replacement queues and the segment
//! file map; per-frame reader-writer latches guard the page payloads. All
//! disk I/O happens with the global mutex released.
//!
//! Replacement uses two queues: pages enter a FIFO queue on first admission
//! and are promoted to the tail of an LRU queue when fixed again. Victim
//! search scans the FIFO queue head to tail first, then the LRU queue, and
//! picks the first unpinned frame whose payload is fully loaded.

use crate::file::{FileMode, PagedFile};
use crate::frame::{BufferFrame, FrameState, QueueKind};
use log::{debug, trace, warn};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, MutexGuard, RawRwLock};
use quarry_common::{PageId, QuarryError, Result};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

type SharedLatch = ArcRwLockReadGuard<RawRwLock, Box<[u8]>>;
type ExclusiveLatch = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

/// The latch a guard holds on its frame's payload.
enum Latch {
    Shared(SharedLatch),
    Exclusive(ExclusiveLatch),
}

/// RAII handle for a fixed page.
///
/// The guard owns the frame latch for its whole lifetime; dropping it
/// unfixes the page. A page unfixed without [`PageGuard::mark_dirty`] is
/// assumed unchanged and may be evicted without a write-back.
pub struct PageGuard<'a> {
    pool: &'a BufferManager,
    frame: Arc<BufferFrame>,
    latch: Option<Latch>,
    dirty: bool,
}

impl PageGuard<'_> {
    /// Returns the id of the fixed page.
    pub fn page_id(&self) -> PageId {
        self.frame.page_id()
    }

    /// Returns true if the page is latched exclusively.
    pub fn is_exclusive(&self) -> bool {
        matches!(self.latch, Some(Latch::Exclusive(_)))
    }

    /// Returns the page payload.
    pub fn data(&self) -> &[u8] {
        match self.latch.as_ref().expect("latch present until drop") {
            Latch::Shared(guard) => guard,
            Latch::Exclusive(guard) => guard,
        }
    }

    /// Returns the page payload for writing.
    ///
    /// Panics if the page was fixed shared; writing requires an exclusive
    /// fix.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match self.latch.as_mut().expect("latch present until drop") {
            Latch::Exclusive(guard) => guard,
            Latch::Shared(_) => panic!("page {} is fixed shared", self.frame.page_id()),
        }
    }

    /// Marks the page dirty so it is written back before eviction.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        // Release the payload latch before touching pool metadata, matching
        // the latch-after-mutex acquisition order of fix.
        self.latch = None;
        self.pool.complete_unfix(&self.frame, self.dirty);
    }
}

/// Shared pool state behind the global mutex.
struct PoolState {
    /// All frames currently known to the pool, keyed by raw page id.
    frames: HashMap<u64, Arc<BufferFrame>>,
    /// Admission queue, head is the oldest admission.
    fifo: VecDeque<u64>,
    /// Hot queue, head is the least recently used page.
    lru: VecDeque<u64>,
    /// Number of frames currently occupying a memory slot.
    resident: usize,
    /// Open segment files, keyed by segment id.
    files: HashMap<u16, Arc<PagedFile>>,
}

impl PoolState {
    /// Re-queues a frame on a repeated fix: FIFO members move to the LRU
    /// tail, LRU members move to the LRU tail.
    fn promote(&mut self, raw: u64, frame: &BufferFrame) {
        match frame.queue() {
            QueueKind::Fifo => {
                self.fifo.retain(|p| *p != raw);
                self.lru.push_back(raw);
                frame.set_queue(QueueKind::Lru);
            }
            QueueKind::Lru => {
                self.lru.retain(|p| *p != raw);
                self.lru.push_back(raw);
            }
            QueueKind::None => {}
        }
    }

    /// Removes a frame from whichever queue it sits in.
    fn unqueue(&mut self, raw: u64, frame: &BufferFrame) {
        match frame.queue() {
            QueueKind::Fifo => self.fifo.retain(|p| *p != raw),
            QueueKind::Lru => self.lru.retain(|p| *p != raw),
            QueueKind::None => {}
        }
        frame.set_queue(QueueKind::None);
    }
}

/// Buffer manager over segment files.
pub struct BufferManager {
    /// Size in bytes of every page.
    page_size: usize,
    /// Maximum number of resident frames.
    frame_count: usize,
    /// Directory holding the segment files, named by decimal segment id.
    data_dir: PathBuf,
    /// Frame table, queues and file map.
    state: Mutex<PoolState>,
}

impl BufferManager {
    /// Creates a buffer manager with `frame_count` frames of `page_size`
    /// bytes over segment files in `data_dir`.
    pub fn new(
        page_size: usize,
        frame_count: usize,
        data_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        if page_size < 64 {
            return Err(QuarryError::InvalidPageSize(page_size));
        }
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        Ok(Self {
            page_size,
            frame_count,
            data_dir,
            state: Mutex::new(PoolState {
                frames: HashMap::new(),
                fifo: VecDeque::new(),
                lru: VecDeque::new(),
                resident: 0,
                files: HashMap::new(),
            }),
        })
    }

    /// Creates a buffer manager sized to 25% of available system RAM, with
    /// a floor of 1000 frames.
    pub fn auto_sized(page_size: usize, data_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut sys = sysinfo::System::new_all();
        sys.refresh_memory();

        let target_bytes = sys.available_memory() as usize / 4;
        let frame_count = (target_bytes / page_size).max(1_000);
        Self::new(page_size, frame_count, data_dir)
    }

    /// Returns the page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the maximum number of resident frames.
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Fixes a page, returning a latched guard over its payload.
    ///
    /// On a cache hit the frame is latched in the requested mode. On a miss
    /// the page is read from its segment file first. Fails with
    /// [`QuarryError::BufferPoolFull`] when every frame is pinned; callers
    /// may retry after releasing their own fixes.
    pub fn fix(&self, pid: PageId, exclusive: bool) -> Result<PageGuard<'_>> {
        let raw = pid.as_u64();
        let mut state = self.state.lock();

        loop {
            let Some(frame) = state.frames.get(&raw).cloned() else {
                break;
            };
            frame.inc_users();
            match frame.state() {
                FrameState::Evicting => {
                    // An evictor is writing this page out. Claim it back;
                    // the evictor will notice and keep the frame.
                    frame.set_state(FrameState::Reloaded);
                }
                FrameState::New => {
                    // Another thread is still admitting this frame. Wait
                    // for it by passing through the exclusive latch.
                    drop(state);
                    drop(frame.data().write());
                    state = self.state.lock();
                    if frame.state() == FrameState::New {
                        // The admitting thread gave up (pool full or I/O
                        // error). Forget the frame and race for a fresh
                        // attempt.
                        frame.dec_users();
                        if frame.users() == 0 {
                            state.frames.remove(&raw);
                        }
                        continue;
                    }
                }
                _ => {}
            }
            state.promote(raw, &frame);
            drop(state);

            let latch = if exclusive {
                Latch::Exclusive(frame.data().write_arc())
            } else {
                Latch::Shared(frame.data().read_arc())
            };
            return Ok(PageGuard {
                pool: self,
                frame,
                latch: Some(latch),
                dirty: false,
            });
        }

        // Miss: insert the frame and latch it exclusively before anyone
        // else can observe the payload.
        let frame = Arc::new(BufferFrame::new(pid, self.page_size));
        frame.inc_users();
        state.frames.insert(raw, frame.clone());
        let write = frame.data().write_arc();

        if state.resident < self.frame_count {
            state.resident += 1;
        } else {
            match self.evict_one(&mut state) {
                Ok(true) => {}
                outcome => {
                    frame.dec_users();
                    drop(write);
                    if frame.users() == 0 {
                        state.frames.remove(&raw);
                    }
                    return match outcome {
                        Ok(false) => Err(QuarryError::BufferPoolFull),
                        Err(e) => Err(e),
                        Ok(true) => unreachable!(),
                    };
                }
            }
        }

        frame.set_state(FrameState::Loading);
        state.fifo.push_back(raw);
        frame.set_queue(QueueKind::Fifo);
        let file = self.segment_file(&mut state, pid.segment)?;
        drop(state);

        let mut write = write;
        let load = file.read_block(pid.offset * self.page_size as u64, &mut write);
        if let Err(e) = load {
            let mut state = self.state.lock();
            frame.set_state(FrameState::New);
            state.unqueue(raw, &frame);
            state.resident -= 1;
            frame.dec_users();
            drop(write);
            if frame.users() == 0 {
                state.frames.remove(&raw);
            }
            return Err(e);
        }
        frame.set_dirty(false);
        frame.set_state(FrameState::Loaded);

        let latch = if exclusive {
            Latch::Exclusive(write)
        } else {
            Latch::Shared(ArcRwLockWriteGuard::downgrade(write))
        };
        Ok(PageGuard {
            pool: self,
            frame,
            latch: Some(latch),
            dirty: false,
        })
    }

    /// Unfixes a page. Equivalent to marking the guard dirty (or not) and
    /// dropping it.
    pub fn unfix(&self, mut guard: PageGuard<'_>, dirty: bool) {
        if dirty {
            guard.mark_dirty();
        }
        drop(guard);
    }

    /// Writes every dirty frame back to its segment file.
    ///
    /// Blocks on pages that are currently fixed exclusively.
    pub fn flush(&self) -> Result<()> {
        let dirty: Vec<(Arc<BufferFrame>, Arc<PagedFile>)> = {
            let mut state = self.state.lock();
            let frames: Vec<Arc<BufferFrame>> = state
                .frames
                .values()
                .filter(|f| f.is_dirty())
                .cloned()
                .collect();
            let mut pairs = Vec::with_capacity(frames.len());
            for frame in frames {
                let file = self.segment_file(&mut state, frame.page_id().segment)?;
                pairs.push((frame, file));
            }
            pairs
        };

        for (frame, file) in dirty {
            let data = frame.data().read();
            file.write_block(frame.page_id().offset * self.page_size as u64, &data)?;
            frame.set_dirty(false);
        }
        Ok(())
    }

    /// Returns the page ids in the FIFO queue, oldest admission first.
    pub fn fifo_pids(&self) -> Vec<PageId> {
        let state = self.state.lock();
        state.fifo.iter().map(|raw| PageId::from_u64(*raw)).collect()
    }

    /// Returns the page ids in the LRU queue, least recently used first.
    pub fn lru_pids(&self) -> Vec<PageId> {
        let state = self.state.lock();
        state.lru.iter().map(|raw| PageId::from_u64(*raw)).collect()
    }

    /// Records an unfix: sets the dirty flag and drops one user.
    fn complete_unfix(&self, frame: &Arc<BufferFrame>, dirty: bool) {
        let _state = self.state.lock();
        if dirty {
            frame.set_dirty(true);
        }
        frame.dec_users();
    }

    /// Returns the open file for a segment, opening it on first use.
    fn segment_file(&self, state: &mut PoolState, segment: u16) -> Result<Arc<PagedFile>> {
        if let Some(file) = state.files.get(&segment) {
            return Ok(Arc::clone(file));
        }
        let path = self.data_dir.join(segment.to_string());
        let file = Arc::new(PagedFile::open(&path, FileMode::ReadWrite)?);
        state.files.insert(segment, Arc::clone(&file));
        Ok(file)
    }

    /// Scans the queues for the first evictable frame.
    fn find_victim(state: &PoolState) -> Option<Arc<BufferFrame>> {
        for raw in state.fifo.iter().chain(state.lru.iter()) {
            let frame = &state.frames[raw];
            if frame.users() == 0 && frame.state() == FrameState::Loaded {
                return Some(Arc::clone(frame));
            }
        }
        None
    }

    /// Evicts one frame, freeing its memory slot.
    ///
    /// Returns `Ok(false)` if no frame can be evicted. Dirty victims are
    /// written back from a snapshot with the global mutex released, so a
    /// concurrent fix may claim the victim mid-write; in that case the
    /// victim is kept and the search restarts.
    fn evict_one(&self, state: &mut MutexGuard<'_, PoolState>) -> Result<bool> {
        loop {
            let Some(victim) = Self::find_victim(state) else {
                return Ok(false);
            };
            victim.set_state(FrameState::Evicting);

            if victim.is_dirty() {
                // Snapshot under the global mutex: no user can latch the
                // payload without first passing through fix.
                let snapshot: Box<[u8]> = victim.data().read().clone();
                let file = self.segment_file(state, victim.page_id().segment)?;
                let offset = victim.page_id().offset * self.page_size as u64;

                let outcome =
                    MutexGuard::unlocked(state, || file.write_block(offset, &snapshot));
                if let Err(e) = outcome {
                    victim.set_state(FrameState::Loaded);
                    return Err(e);
                }

                if victim.state() == FrameState::Reloaded {
                    trace!(
                        "eviction of {} raced a re-fix, keeping frame",
                        victim.page_id()
                    );
                    victim.set_state(FrameState::Loaded);
                    continue;
                }
            }

            // Only a frame still in Evicting may leave the pool.
            debug_assert_eq!(victim.state(), FrameState::Evicting);
            let raw = victim.page_id().as_u64();
            state.unqueue(raw, &victim);
            state.frames.remove(&raw);
            debug!("evicted page {}", victim.page_id());
            return Ok(true);
        }
    }
}

impl Drop for BufferManager {
    /// Writes all dirty frames to disk.
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("flush on drop failed: {e}");
        }
    }
}
