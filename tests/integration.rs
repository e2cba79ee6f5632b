use casmap::CasMap;
use fxhash::FxBuildHasher;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

type Map<K, V> = CasMap<K, V, FxBuildHasher>;

const KEYS: u64 = 8 * 1024;

#[test]
fn drop_empty() {
    let map: Map<u64, u64> = Map::with_hasher(FxBuildHasher::default());
    drop(map);
}

#[test]
fn multi_threaded_inserts_are_all_readable() {
    let map: Map<u64, u64> = Map::with_capacity_and_hasher(KEYS as usize, FxBuildHasher::default());
    (0..KEYS).into_par_iter().for_each(|key| {
        assert_eq!(map.insert(key, key * 10), None);
    });
    assert_eq!(map.len(), KEYS as usize);
    (0..KEYS).into_par_iter().for_each(|key| {
        assert_eq!(map.get(&key), Some(key * 10));
    });
}

#[test]
fn multi_threaded_inserts_through_resizes() {
    // Start tiny so the insert storm drags the table through many doublings.
    let map: Map<u64, u64> = Map::with_options_and_hasher(16, 0.65, true, FxBuildHasher::default());
    (0..KEYS).into_par_iter().for_each(|key| {
        map.insert(key, key * 10);
    });
    assert_eq!(map.len(), KEYS as usize);
    assert!(map.capacity() >= KEYS as usize);
    for key in 0..KEYS {
        assert_eq!(map.get(&key), Some(key * 10));
    }
}

#[test]
fn monotone_writes_on_one_key() {
    // Writers bump a shared counter and publish the ticket; a read must never
    // observe a ticket newer than one drawn afterwards.
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 10_000;
    let map: Arc<Map<u64, u64>> = Arc::new(Map::with_hasher(FxBuildHasher::default()));
    let counter = Arc::new(AtomicU64::new(0));
    map.insert(1, 0);

    (0..THREADS).into_par_iter().for_each(|_| {
        for _ in 0..PER_THREAD {
            let seen = map.get(&1);
            let ticket = counter.fetch_add(1, Ordering::Relaxed) + 1;
            map.insert(1, ticket);
            if let Some(seen) = seen {
                assert!(seen <= ticket);
            }
        }
    });
    assert!(map.get(&1).unwrap() <= THREADS * PER_THREAD);
}

#[test]
fn mixed_operations_on_disjoint_ranges() {
    const THREADS: u64 = 8;
    const RANGE: u64 = 128;
    // Pre-sized so the churn never crosses the resize threshold; removal only
    // consults the current array and would race a migration.
    let map: Map<u64, u64> = Map::with_capacity_and_hasher(4096, FxBuildHasher::default());

    (0..THREADS).into_par_iter().for_each(|thread| {
        let keys = (thread * RANGE)..((thread + 1) * RANGE);
        for round in 0..3 {
            for key in keys.clone() {
                assert_eq!(map.insert(key, key * 10), None);
                assert_eq!(map.get(&key), Some(key * 10));
                assert!(map.compare_replace(key, &(key * 10), key * 10 + 1));
                assert_eq!(map.get(&key), Some(key * 10 + 1));
                assert_eq!(map.remove(&key), Some(key * 10 + 1));
                assert_eq!(map.get(&key), None);
            }
            if round == 2 {
                for key in keys.clone() {
                    assert_eq!(map.insert_if_absent(key, key * 10), None);
                }
            }
        }
    });

    assert_eq!(map.len(), (THREADS * RANGE) as usize);
    for key in 0..THREADS * RANGE {
        assert_eq!(map.get(&key), Some(key * 10));
    }
}

#[test]
fn compare_replace_has_a_single_winner() {
    let map: Map<u64, u64> = Map::with_hasher(FxBuildHasher::default());
    map.insert(1, 0);
    let winners = AtomicUsize::new(0);

    (1..=64u64).into_par_iter().for_each(|ticket| {
        if map.compare_replace(1, &0, ticket) {
            winners.fetch_add(1, Ordering::Relaxed);
        }
    });

    assert_eq!(winners.load(Ordering::Relaxed), 1);
    let value = map.get(&1).unwrap();
    assert!((1..=64).contains(&value));
}

#[test]
fn each_key_is_removed_exactly_once() {
    const N: u64 = 1024;
    let map: Map<u64, u64> = Map::with_capacity_and_hasher(N as usize, FxBuildHasher::default());
    for key in 0..N {
        map.insert(key, key * 10);
    }
    let removed = AtomicUsize::new(0);

    // Two contenders per key; the deletion flag arbitrates.
    (0..2 * N).into_par_iter().for_each(|i| {
        let key = i % N;
        if let Some(value) = map.remove(&key) {
            assert_eq!(value, key * 10);
            removed.fetch_add(1, Ordering::Relaxed);
        }
    });

    assert_eq!(removed.load(Ordering::Relaxed), N as usize);
    assert_eq!(map.len(), 0);
    assert!(map.is_empty());
}

#[test]
fn readers_never_see_foreign_values() {
    const N: u64 = 4096;
    let map: Map<u64, u64> = Map::with_options_and_hasher(16, 0.65, true, FxBuildHasher::default());

    // Writers publish key * 10 while readers poll the same range; a read is
    // either a miss or a value some writer actually produced.
    (0..2 * N).into_par_iter().for_each(|i| {
        let key = i % N;
        if i < N {
            map.insert(key, key * 10);
        } else {
            match map.get(&key) {
                None => {}
                Some(value) => assert_eq!(value, key * 10),
            }
        }
    });
}

#[test]
fn iteration_after_parallel_churn() {
    const N: u64 = 2048;
    // Pre-sized for the same reason as mixed_operations_on_disjoint_ranges.
    let map: Map<u64, u64> = Map::with_capacity_and_hasher(2 * N as usize, FxBuildHasher::default());
    (0..N).into_par_iter().for_each(|key| {
        map.insert(key, key * 10);
        if key % 2 == 0 {
            map.remove(&key);
        }
    });

    let seen: BTreeSet<u64> = map.iter().map(|(k, _)| k).collect();
    let expected: BTreeSet<u64> = (0..N).filter(|k| k % 2 == 1).collect();
    assert_eq!(seen, expected);
    assert_eq!(map.len(), expected.len());
}

#[test]
fn clear_then_reuse() {
    let map: Map<u64, u64> = Map::with_options_and_hasher(16, 0.65, true, FxBuildHasher::default());
    (0..KEYS).into_par_iter().for_each(|key| {
        map.insert(key, key);
    });
    map.clear();
    assert!(map.is_empty());
    assert_eq!(map.capacity(), 16);

    (0..256u64).into_par_iter().for_each(|key| {
        map.insert(key, key + 1);
    });
    assert_eq!(map.len(), 256);
    for key in 0..256u64 {
        assert_eq!(map.get(&key), Some(key + 1));
    }
}
