//! Scenario tests for the B+-tree against the real buffer manager.

use quarry_buffer::BufferManager;
use quarry_storage::btree::node::LeafNode;
use quarry_storage::BTree;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use tempfile::tempdir;

const PAGE_SIZE: usize = 1024;

fn test_tree(frames: usize) -> (BTree<u64, u64>, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let buffer = Arc::new(BufferManager::new(PAGE_SIZE, frames, dir.path()).unwrap());
    (BTree::new(1, buffer), dir)
}

fn leaf_capacity() -> u64 {
    LeafNode::<u64, u64>::capacity(PAGE_SIZE) as u64
}

#[test]
fn random_insert_lookup() {
    let (tree, _dir) = test_tree(64);
    let n = 10 * leaf_capacity();

    let mut keys: Vec<u64> = (0..n).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(42));

    for &key in &keys {
        tree.insert(key, 2 * key).unwrap();
    }
    for key in 0..n {
        assert_eq!(tree.lookup(&key).unwrap(), Some(2 * key), "key {key}");
    }
    assert_eq!(tree.lookup(&n).unwrap(), None);
}

#[test]
fn random_insert_with_repeats() {
    let (tree, _dir) = test_tree(64);
    let n = 4 * leaf_capacity();

    let mut rng = StdRng::seed_from_u64(7);
    let mut keys: Vec<u64> = (0..n).chain(0..n).collect();
    keys.shuffle(&mut rng);

    // Every key is inserted twice; the second write must win.
    for (round, &key) in keys.iter().enumerate() {
        tree.insert(key, key + round as u64).unwrap();
    }
    for key in 0..n {
        let value = tree.lookup(&key).unwrap().expect("key inserted");
        // The stored value stems from one of the two inserts of this key.
        let round = value - key;
        assert_eq!(keys[round as usize], key);
    }
}

#[test]
fn erase_sequence() {
    let (tree, _dir) = test_tree(64);
    let n = 2 * leaf_capacity();

    for key in 0..n {
        tree.insert(key, 2 * key).unwrap();
    }
    for key in 0..n {
        assert_eq!(tree.lookup(&key).unwrap(), Some(2 * key));
        tree.erase(&key).unwrap();
        assert_eq!(tree.lookup(&key).unwrap(), None, "key {key} still present");
    }
}

#[test]
fn eviction_during_workload() {
    // Four frames are far less than the tree needs, so pages cycle through
    // the pool constantly while the index stays correct.
    let (tree, _dir) = test_tree(4);
    let n = 10 * leaf_capacity();

    let mut keys: Vec<u64> = (0..n).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(1234));

    for &key in &keys {
        tree.insert(key, !key).unwrap();
    }
    for key in 0..n {
        assert_eq!(tree.lookup(&key).unwrap(), Some(!key), "key {key}");
    }
}

#[test]
fn concurrent_inserts_and_lookups() {
    let dir = tempdir().unwrap();
    let buffer = Arc::new(BufferManager::new(PAGE_SIZE, 128, dir.path()).unwrap());
    let tree = Arc::new(BTree::<u64, u64>::new(1, buffer));
    let per_thread = 3 * leaf_capacity();

    std::thread::scope(|scope| {
        for t in 0..4u64 {
            let tree = Arc::clone(&tree);
            scope.spawn(move || {
                let mut keys: Vec<u64> = (0..per_thread).collect();
                keys.shuffle(&mut StdRng::seed_from_u64(t));
                for i in keys {
                    let key = t * per_thread + i;
                    tree.insert(key, key + 1).unwrap();
                    assert_eq!(tree.lookup(&key).unwrap(), Some(key + 1));
                }
            });
        }
    });

    for key in 0..4 * per_thread {
        assert_eq!(tree.lookup(&key).unwrap(), Some(key + 1), "key {key}");
    }
}

#[test]
fn mixed_insert_erase_interleaving() {
    let (tree, _dir) = test_tree(64);
    let n = 6 * leaf_capacity();

    // Insert everything, erase the even keys, then re-insert half of them
    // with new values.
    for key in 0..n {
        tree.insert(key, key).unwrap();
    }
    for key in (0..n).step_by(2) {
        tree.erase(&key).unwrap();
    }
    for key in (0..n).step_by(4) {
        tree.insert(key, key + 100).unwrap();
    }

    for key in 0..n {
        let expected = if key % 4 == 0 {
            Some(key + 100)
        } else if key % 2 == 0 {
            None
        } else {
            Some(key)
        };
        assert_eq!(tree.lookup(&key).unwrap(), expected, "key {key}");
    }
}
