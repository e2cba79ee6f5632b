//! Weakly consistent iteration over a live map.
//!
//! Iterators walk the current bucket array while concurrent mutators keep
//! running: an entry inserted or removed mid-walk may or may not be observed,
//! but every walk terminates and never yields the same entry twice. Each
//! iterator pins an epoch guard for its whole lifetime so the nodes it stands
//! on cannot be reclaimed under it.

use crate::entry::Entry;
use crate::error::Error;
use crate::map::CasMap;
use crate::raw_table::{BucketArray, RawTable};
use crossbeam_epoch::{self as epoch, Guard};
use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::Ordering;

/// Cursor over the live entries of one bucket array.
///
/// Follows chain links, skips logically deleted nodes and moves to the next
/// non-empty bucket when a chain ends. Also drives the resize migration.
pub(crate) struct RawIter<K, V> {
    array: *const BucketArray<K, V>,
    bucket: usize,
    cur: *const Entry<K, V>,
}

impl<K, V> RawIter<K, V> {
    pub(crate) fn new(array: &BucketArray<K, V>) -> Self {
        Self { array, bucket: 0, cur: ptr::null() }
    }

    /// Advance to the next live entry.
    ///
    /// # Safety
    ///
    /// `guard` must have been pinned since before the array was read from the
    /// table and the same pin must cover every call on this iterator.
    pub(crate) unsafe fn next<'g>(&mut self, guard: &'g Guard) -> Option<&'g Entry<K, V>> {
        loop {
            let next: *const Entry<K, V> = if self.cur.is_null() {
                let array = unsafe { &*self.array };
                if self.bucket >= array.len() {
                    return None;
                }
                let head = array.bucket_at(self.bucket).load(Ordering::Acquire, guard);
                self.bucket += 1;
                head.as_raw()
            } else {
                let cur = unsafe { &*self.cur };
                cur.next.load(Ordering::Acquire, guard).as_raw()
            };
            self.cur = next;
            if next.is_null() {
                // Chain exhausted, move on to the next bucket.
                continue;
            }
            let entry = unsafe { &*next };
            if !entry.is_deleted() {
                return Some(entry);
            }
        }
    }
}

/// Snapshot iterator over key/value pairs.
///
/// Returned by [`CasMap::iter`] and [`Entries::iter`]. Yields owned clones;
/// the underlying entries stay shared with the map.
pub struct Iter<'a, K, V> {
    table: &'a RawTable<K, V>,
    raw: RawIter<K, V>,
    guard: Guard,
    last: *const Entry<K, V>,
}

impl<'a, K, V> Iter<'a, K, V> {
    pub(crate) fn new(table: &'a RawTable<K, V>) -> Self {
        let guard = epoch::pin();
        let raw = RawIter::new(table.current_array(&guard));
        Self { table, raw, guard, last: ptr::null() }
    }
}

impl<'a, K, V> Iter<'a, K, V>
where
    K: Eq,
    V: Clone,
{
    /// Remove the most recently yielded entry from the map.
    ///
    /// Fails with [`Error::InvalidIteratorState`] when nothing has been
    /// yielded yet, when called twice for the same entry, or when the entry
    /// was already removed behind the iterator's back.
    pub fn remove_current(&mut self) -> Result<V, Error> {
        if self.last.is_null() {
            return Err(Error::InvalidIteratorState);
        }
        // SAFETY: `last` was yielded under our own pin, which is still held.
        let entry = unsafe { &*self.last };
        self.last = ptr::null();
        match self.table.remove(entry.hash, &mut |k| *k == entry.key, None, &self.guard) {
            Some(value) => Ok(value.clone()),
            None => Err(Error::InvalidIteratorState),
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        // SAFETY: `guard` was pinned before `raw` captured the array.
        let entry = unsafe { self.raw.next(&self.guard) }?;
        self.last = entry as *const _;
        Some((entry.key.clone(), entry.value.clone()))
    }
}

/// Snapshot iterator over keys, returned by [`Keys::iter`].
pub struct KeysIter<'a, K, V> {
    raw: RawIter<K, V>,
    guard: Guard,
    _table: PhantomData<&'a RawTable<K, V>>,
}

impl<'a, K, V> KeysIter<'a, K, V> {
    pub(crate) fn new(table: &'a RawTable<K, V>) -> Self {
        let guard = epoch::pin();
        let raw = RawIter::new(table.current_array(&guard));
        Self { raw, guard, _table: PhantomData }
    }
}

impl<'a, K, V> Iterator for KeysIter<'a, K, V>
where
    K: Clone,
{
    type Item = K;

    fn next(&mut self) -> Option<K> {
        // SAFETY: as in `Iter::next`.
        let entry = unsafe { self.raw.next(&self.guard) }?;
        Some(entry.key.clone())
    }
}

/// Snapshot iterator over values, returned by [`Values::iter`].
pub struct ValuesIter<'a, K, V> {
    raw: RawIter<K, V>,
    guard: Guard,
    _table: PhantomData<&'a RawTable<K, V>>,
}

impl<'a, K, V> ValuesIter<'a, K, V> {
    pub(crate) fn new(table: &'a RawTable<K, V>) -> Self {
        let guard = epoch::pin();
        let raw = RawIter::new(table.current_array(&guard));
        Self { raw, guard, _table: PhantomData }
    }
}

impl<'a, K, V> Iterator for ValuesIter<'a, K, V>
where
    V: Clone,
{
    type Item = V;

    fn next(&mut self) -> Option<V> {
        // SAFETY: as in `Iter::next`.
        let entry = unsafe { self.raw.next(&self.guard) }?;
        Some(entry.value.clone())
    }
}

/// Live view of the map's keys. Nothing is copied until iteration.
pub struct Keys<'a, K, V, S> {
    pub(crate) map: &'a CasMap<K, V, S>,
}

impl<'a, K, V, S> Keys<'a, K, V, S> {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear()
    }

    pub fn iter(&self) -> KeysIter<'a, K, V> {
        KeysIter::new(&self.map.table)
    }
}

impl<'a, K, V, S> Keys<'a, K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(key)
    }

    /// Remove the mapping for `key`; true if one was present.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = epoch::pin();
        let hash = self.map.hash_of(key);
        self.map.table.remove(hash, &mut |k| key.eq(k.borrow()), None, &guard).is_some()
    }
}

impl<'a, K, V, S> IntoIterator for Keys<'a, K, V, S>
where
    K: Clone,
{
    type Item = K;
    type IntoIter = KeysIter<'a, K, V>;

    fn into_iter(self) -> KeysIter<'a, K, V> {
        KeysIter::new(&self.map.table)
    }
}

/// Live view of the map's values.
pub struct Values<'a, K, V, S> {
    pub(crate) map: &'a CasMap<K, V, S>,
}

impl<'a, K, V, S> Values<'a, K, V, S> {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear()
    }

    pub fn iter(&self) -> ValuesIter<'a, K, V> {
        ValuesIter::new(&self.map.table)
    }
}

impl<'a, K, V, S> Values<'a, K, V, S>
where
    V: PartialEq,
{
    pub fn contains(&self, value: &V) -> bool {
        let guard = epoch::pin();
        self.map.table.contains_value(&mut |v| v == value, &guard)
    }

    /// Remove one mapping whose value equals `value`; true if one was found.
    pub fn remove(&self, value: &V) -> bool
    where
        K: Eq,
    {
        let table = &self.map.table;
        let guard = epoch::pin();
        let mut raw = RawIter::new(table.current_array(&guard));
        // SAFETY: the pin above covers both the array read and the walk.
        while let Some(entry) = unsafe { raw.next(&guard) } {
            if entry.value == *value
                && table.remove(entry.hash, &mut |k| *k == entry.key, None, &guard).is_some()
            {
                return true;
            }
        }
        false
    }
}

impl<'a, K, V, S> IntoIterator for Values<'a, K, V, S>
where
    V: Clone,
{
    type Item = V;
    type IntoIter = ValuesIter<'a, K, V>;

    fn into_iter(self) -> ValuesIter<'a, K, V> {
        ValuesIter::new(&self.map.table)
    }
}

/// Live view of the map's entries.
pub struct Entries<'a, K, V, S> {
    pub(crate) map: &'a CasMap<K, V, S>,
}

impl<'a, K, V, S> Entries<'a, K, V, S> {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear()
    }

    pub fn iter(&self) -> Iter<'a, K, V> {
        Iter::new(&self.map.table)
    }
}

impl<'a, K, V, S> Entries<'a, K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    /// A pair is contained when the key currently maps to exactly that value.
    pub fn contains<Q>(&self, key: &Q, value: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = epoch::pin();
        let hash = self.map.hash_of(key);
        match self.map.table.get(hash, &mut |k| key.eq(k.borrow()), &guard) {
            Some(current) => *current == *value,
            None => false,
        }
    }

    /// Remove the mapping only if the key currently maps to `value`.
    pub fn remove<Q>(&self, key: &Q, value: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = epoch::pin();
        let hash = self.map.hash_of(key);
        self.map
            .table
            .remove(hash, &mut |k| key.eq(k.borrow()), Some(&mut |v| v == value), &guard)
            .is_some()
    }
}

impl<'a, K, V, S> IntoIterator for Entries<'a, K, V, S>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Iter<'a, K, V> {
        Iter::new(&self.map.table)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::map::CasMap;
    use fxhash::FxBuildHasher;
    use std::collections::BTreeSet;

    fn filled(n: u64) -> CasMap<u64, u64, FxBuildHasher> {
        let map = CasMap::with_hasher(FxBuildHasher::default());
        for key in 0..n {
            map.insert(key, key * 10);
        }
        map
    }

    #[test]
    fn iterator_yields_every_live_entry_once() {
        let map = filled(100);
        let seen: Vec<(u64, u64)> = map.iter().collect();
        assert_eq!(seen.len(), 100);
        let keys: BTreeSet<u64> = seen.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, (0..100).collect());
        for (key, value) in seen {
            assert_eq!(value, key * 10);
        }
    }

    #[test]
    fn iterator_skips_removed_entries() {
        let map = filled(20);
        for key in 0..10u64 {
            map.remove(&key);
        }
        let keys: BTreeSet<u64> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, (10..20).collect());
    }

    #[test]
    fn iterator_on_empty_map_is_done() {
        let map = filled(0);
        assert_eq!(map.iter().next(), None);
    }

    #[test]
    fn remove_current_removes_from_map() {
        let map = filled(10);
        let mut iter = map.iter();
        while let Some((key, value)) = iter.next() {
            assert_eq!(iter.remove_current(), Ok(value));
            assert_eq!(map.get(&key), None);
        }
        drop(iter);
        assert!(map.is_empty());
    }

    #[test]
    fn remove_current_needs_a_yielded_entry() {
        let map = filled(3);
        let mut iter = map.iter();
        assert_eq!(iter.remove_current(), Err(Error::InvalidIteratorState));
        let (_, value) = iter.next().unwrap();
        assert_eq!(iter.remove_current(), Ok(value));
        // The yielded entry was consumed by the first removal.
        assert_eq!(iter.remove_current(), Err(Error::InvalidIteratorState));
    }

    #[test]
    fn remove_current_fails_when_entry_was_removed_underneath() {
        let map = filled(3);
        let mut iter = map.iter();
        let (key, _) = iter.next().unwrap();
        assert_eq!(map.remove(&key), Some(key * 10));
        assert_eq!(iter.remove_current(), Err(Error::InvalidIteratorState));
    }

    #[test]
    fn keys_view() {
        let map = filled(5);
        let keys = map.keys();
        assert_eq!(keys.len(), 5);
        assert!(!keys.is_empty());
        assert!(keys.contains(&3));
        assert!(!keys.contains(&7));
        assert!(keys.remove(&3));
        assert!(!keys.remove(&3));
        assert_eq!(map.len(), 4);
        let collected: BTreeSet<u64> = map.keys().into_iter().collect();
        assert_eq!(collected, [0, 1, 2, 4].into_iter().collect());
    }

    #[test]
    fn values_view() {
        let map = filled(5);
        let values = map.values();
        assert_eq!(values.len(), 5);
        assert!(values.contains(&40));
        assert!(!values.contains(&41));
        assert!(values.remove(&40));
        assert!(!values.remove(&40));
        assert_eq!(map.get(&4), None);
        let collected: BTreeSet<u64> = map.values().into_iter().collect();
        assert_eq!(collected, [0, 10, 20, 30].into_iter().collect());
    }

    #[test]
    fn entries_view() {
        let map = filled(5);
        let entries = map.entries();
        assert_eq!(entries.len(), 5);
        assert!(entries.contains(&2, &20));
        assert!(!entries.contains(&2, &21));
        assert!(!entries.remove(&2, &21));
        assert!(map.contains_key(&2));
        assert!(entries.remove(&2, &20));
        assert_eq!(map.get(&2), None);
        let collected: BTreeSet<(u64, u64)> = map.entries().into_iter().collect();
        assert_eq!(collected, [(0, 0), (1, 10), (3, 30), (4, 40)].into_iter().collect());
    }

    #[test]
    fn view_clear_clears_the_map() {
        let map = filled(8);
        map.keys().clear();
        assert!(map.is_empty());
        assert_eq!(map.get(&1), None);
    }
}
