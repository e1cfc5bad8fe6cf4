//! Scenario tests for the buffer manager.

use quarry_buffer::BufferManager;
use quarry_common::{PageId, QuarryError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn fifo_eviction_order() {
    let dir = tempdir().unwrap();
    let manager = BufferManager::new(1024, 10, dir.path()).unwrap();

    for offset in 1..=10 {
        let guard = manager.fix(PageId::new(0, offset), false).unwrap();
        drop(guard);
    }

    let fifo: Vec<u64> = manager.fifo_pids().iter().map(|p| p.offset).collect();
    assert_eq!(fifo, (1..=10).collect::<Vec<u64>>());
    assert!(manager.lru_pids().is_empty());

    // One more page evicts the FIFO head.
    manager.fix(PageId::new(0, 11), false).unwrap();
    let fifo: Vec<u64> = manager.fifo_pids().iter().map(|p| p.offset).collect();
    assert_eq!(fifo, (2..=11).collect::<Vec<u64>>());
}

#[test]
fn persistence_across_restart() {
    let dir = tempdir().unwrap();
    let pid = PageId::new(1, 5);

    {
        let manager = BufferManager::new(1024, 10, dir.path()).unwrap();
        let mut guard = manager.fix(pid, true).unwrap();
        guard.data_mut()[..8].copy_from_slice(&[0x42, 0, 0, 0, 0, 0, 0, 0]);
        guard.mark_dirty();
        drop(guard);
        // Dropping the manager flushes all dirty frames.
    }

    let manager = BufferManager::new(1024, 10, dir.path()).unwrap();
    let guard = manager.fix(pid, false).unwrap();
    assert_eq!(&guard.data()[..8], &[0x42, 0, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn hot_pages_survive_fifo_pressure() {
    let dir = tempdir().unwrap();
    let manager = BufferManager::new(1024, 4, dir.path()).unwrap();

    // Page 0 becomes hot: fixed twice, so it lives on the LRU queue.
    manager.fix(PageId::new(0, 0), false).unwrap();
    manager.fix(PageId::new(0, 0), false).unwrap();

    // Streaming through many cold pages exhausts the FIFO queue but never
    // touches the hot page.
    for offset in 1..20 {
        manager.fix(PageId::new(0, offset), false).unwrap();
    }

    let lru: Vec<u64> = manager.lru_pids().iter().map(|p| p.offset).collect();
    assert_eq!(lru, vec![0]);
}

#[test]
fn buffer_full_is_retryable() {
    let dir = tempdir().unwrap();
    let manager = BufferManager::new(1024, 2, dir.path()).unwrap();

    let g0 = manager.fix(PageId::new(0, 0), false).unwrap();
    let _g1 = manager.fix(PageId::new(0, 1), false).unwrap();

    assert!(matches!(
        manager.fix(PageId::new(0, 2), false),
        Err(QuarryError::BufferPoolFull)
    ));

    drop(g0);
    assert!(manager.fix(PageId::new(0, 2), false).is_ok());
}

#[test]
fn concurrent_counter_increments() {
    const THREADS: u64 = 4;
    const ROUNDS: u64 = 200;
    const PAGES: u64 = 8;

    let dir = tempdir().unwrap();
    let manager = Arc::new(BufferManager::new(1024, 4, dir.path()).unwrap());
    let retries = AtomicU64::new(0);

    // Each page holds a u64 counter; every increment happens under an
    // exclusive latch, so the final sums must be exact even though the pool
    // is half the working-set size.
    std::thread::scope(|scope| {
        for thread in 0..THREADS {
            let manager = Arc::clone(&manager);
            let retries = &retries;
            scope.spawn(move || {
                for round in 0..ROUNDS {
                    let pid = PageId::new(0, (thread + round) % PAGES);
                    loop {
                        match manager.fix(pid, true) {
                            Ok(mut guard) => {
                                let mut counter = [0u8; 8];
                                counter.copy_from_slice(&guard.data()[..8]);
                                let value = u64::from_le_bytes(counter) + 1;
                                guard.data_mut()[..8].copy_from_slice(&value.to_le_bytes());
                                guard.mark_dirty();
                                break;
                            }
                            Err(QuarryError::BufferPoolFull) => {
                                retries.fetch_add(1, Ordering::Relaxed);
                                std::thread::yield_now();
                            }
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                }
            });
        }
    });

    let mut total = 0u64;
    for offset in 0..PAGES {
        let guard = manager.fix(PageId::new(0, offset), false).unwrap();
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&guard.data()[..8]);
        total += u64::from_le_bytes(counter);
    }
    assert_eq!(total, THREADS * ROUNDS);
}

#[test]
fn concurrent_readers_share_a_page() {
    let dir = tempdir().unwrap();
    let manager = Arc::new(BufferManager::new(1024, 2, dir.path()).unwrap());

    {
        let mut guard = manager.fix(PageId::new(0, 0), true).unwrap();
        guard.data_mut()[0] = 7;
        guard.mark_dirty();
    }

    std::thread::scope(|scope| {
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            scope.spawn(move || {
                for _ in 0..100 {
                    let guard = manager.fix(PageId::new(0, 0), false).unwrap();
                    assert_eq!(guard.data()[0], 7);
                }
            });
        }
    });
}
