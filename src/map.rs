use crate::iter::{Entries, Iter, Keys, Values};
use crate::raw_table::{mix, RawTable, UpdateMode, MIN_CAPACITY};
use crossbeam_epoch as epoch;
use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

/// Default hasher for `CasMap`.
pub type DefaultHashBuilder = RandomState;

/// Number of buckets a map is created with when none is given.
pub const DEFAULT_CAPACITY: usize = 128;

/// Fill ratio at which a resizable map doubles its bucket array.
pub const DEFAULT_LOAD_FACTOR: f32 = 0.65;

/// A concurrent, lock-free hash map with separate chaining.
///
/// Any number of threads may read and write in parallel; every mutation is a
/// compare-and-swap on a bucket head, a chain link or an entry's deletion
/// flag, and a contended attempt is retried rather than blocked on. Removal
/// is logical (a flag flip); dead nodes are unlinked opportunistically by
/// later walks and reclaimed through an epoch.
///
/// Reads return clones of the stored values, so shared ownership is the
/// caller's choice of `V` (an `Arc`, a small `Copy` type, and so on).
///
/// # Examples
///
/// ```
/// use casmap::CasMap;
/// use std::sync::Arc;
/// use std::thread;
///
/// let map = Arc::new(CasMap::new());
/// let writer = {
///     let map = Arc::clone(&map);
///     thread::spawn(move || {
///         map.insert(1, 10);
///     })
/// };
/// writer.join().unwrap();
/// assert_eq!(map.get(&1), Some(10));
/// ```
pub struct CasMap<K, V, S = DefaultHashBuilder> {
    pub(crate) hash_builder: S,
    pub(crate) table: RawTable<K, V>,
}

impl<K, V> CasMap<K, V, DefaultHashBuilder> {
    /// Creates an empty `CasMap` with the default capacity and load factor.
    ///
    /// # Examples
    ///
    /// ```
    /// use casmap::CasMap;
    /// let map: CasMap<i32, i32> = CasMap::new();
    /// ```
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty `CasMap` with at least `capacity` buckets.
    ///
    /// The capacity is rounded up to a power of two and never below 16.
    ///
    /// # Examples
    ///
    /// ```
    /// use casmap::CasMap;
    /// let map: CasMap<i32, i32> = CasMap::with_capacity(1024);
    /// ```
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, DefaultHashBuilder::default())
    }

    /// Creates an empty `CasMap` with an explicit capacity, load factor and
    /// growth policy. A non-resizable map keeps its bucket array forever and
    /// only its chains grow.
    #[inline]
    pub fn with_options(capacity: usize, load_factor: f32, resizable: bool) -> Self {
        Self::with_options_and_hasher(capacity, load_factor, resizable, DefaultHashBuilder::default())
    }
}

impl<K, V, S> CasMap<K, V, S> {
    /// Creates an empty `CasMap` which will use the given hash builder to
    /// hash keys.
    ///
    /// Warning: `hash_builder` is normally randomly generated to make maps
    /// resistant to collision attacks. Setting it manually can expose a DoS
    /// attack vector.
    #[inline]
    pub fn with_hasher(hash_builder: S) -> Self {
        Self::with_capacity_and_hasher(DEFAULT_CAPACITY, hash_builder)
    }

    /// Creates an empty `CasMap` with at least `capacity` buckets, using
    /// `hash_builder` to hash the keys.
    ///
    /// # Examples
    ///
    /// ```
    /// use casmap::map::DefaultHashBuilder;
    /// use casmap::CasMap;
    ///
    /// let s = DefaultHashBuilder::default();
    /// let map: CasMap<i32, i32> = CasMap::with_capacity_and_hasher(10, s);
    /// ```
    #[inline]
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        Self::with_options_and_hasher(capacity, DEFAULT_LOAD_FACTOR, true, hash_builder)
    }

    /// Fully parameterized constructor. The capacity is rounded up to a power
    /// of two with a floor of 16; the load factor is clamped to `[0.5, 1.0]`.
    pub fn with_options_and_hasher(
        capacity: usize,
        load_factor: f32,
        resizable: bool,
        hash_builder: S,
    ) -> Self {
        let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
        let load_factor = load_factor.clamp(0.5, 1.0);
        Self { hash_builder, table: RawTable::with_options(capacity, load_factor, resizable) }
    }

    /// Returns a reference to the map's [`BuildHasher`].
    #[inline]
    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }

    /// Number of live entries. Approximate while mutators are in flight,
    /// exact once the map is quiescent.
    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current number of buckets.
    pub fn capacity(&self) -> usize {
        let guard = epoch::pin();
        self.table.capacity(&guard)
    }

    #[inline]
    pub fn load_factor(&self) -> f32 {
        self.table.load_factor()
    }

    #[inline]
    pub fn is_resizable(&self) -> bool {
        self.table.is_resizable()
    }

    /// Inserts left before the next resize is triggered; zero once the
    /// threshold has been reached.
    #[inline]
    pub fn remaining_before_resize(&self) -> usize {
        self.table.remaining_before_resize()
    }

    /// Drops every entry and restores the construction-time capacity.
    ///
    /// Not atomic with respect to concurrent mutators: insertions racing a
    /// clear may survive into the fresh table or be lost with it.
    pub fn clear(&self) {
        let guard = epoch::pin();
        self.table.clear(&guard);
    }

    /// Live view of the keys.
    pub fn keys(&self) -> Keys<'_, K, V, S> {
        Keys { map: self }
    }

    /// Live view of the values.
    pub fn values(&self) -> Values<'_, K, V, S> {
        Values { map: self }
    }

    /// Live view of the entries.
    pub fn entries(&self) -> Entries<'_, K, V, S> {
        Entries { map: self }
    }

    /// Weakly consistent iterator over key/value clones.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(&self.table)
    }

    #[inline]
    pub(crate) fn hash_of<Q>(&self, key: &Q) -> u32
    where
        Q: Hash + ?Sized,
        S: BuildHasher,
    {
        mix(self.hash_builder.hash_one(key) as u32)
    }
}

impl<K, V, S> CasMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Returns a clone of the value mapped to `key`.
    ///
    /// While a resize is migrating entries the lookup probes both the old and
    /// the new bucket array, so a key is not hidden by its move.
    ///
    /// # Examples
    ///
    /// ```
    /// use casmap::CasMap;
    ///
    /// let map = CasMap::new();
    /// map.insert(1, "a");
    /// assert_eq!(map.get(&1), Some("a"));
    /// assert_eq!(map.get(&2), None);
    /// ```
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let guard = epoch::pin();
        let hash = self.hash_of(key);
        self.table.get(hash, &mut |k| key.eq(k.borrow()), &guard).cloned()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = epoch::pin();
        let hash = self.hash_of(key);
        self.table.get(hash, &mut |k| key.eq(k.borrow()), &guard).is_some()
    }

    /// Scans every chain of the current array for a live entry with this
    /// value. Linear in the size of the map.
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        let guard = epoch::pin();
        self.table.contains_value(&mut |v| v == value, &guard)
    }

    /// Removes the mapping for `key`, returning the previous value.
    ///
    /// # Examples
    ///
    /// ```
    /// use casmap::CasMap;
    ///
    /// let map = CasMap::new();
    /// map.insert(1, "a");
    /// assert_eq!(map.remove(&1), Some("a"));
    /// assert_eq!(map.remove(&1), None);
    /// ```
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let guard = epoch::pin();
        let hash = self.hash_of(key);
        self.table.remove(hash, &mut |k| key.eq(k.borrow()), None, &guard).cloned()
    }

    /// Removes the mapping only if the key currently maps to `expected`;
    /// true if the entry was removed by this call.
    pub fn compare_remove<Q>(&self, key: &Q, expected: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let guard = epoch::pin();
        let hash = self.hash_of(key);
        self.table
            .remove(hash, &mut |k| key.eq(k.borrow()), Some(&mut |v| v == expected), &guard)
            .is_some()
    }
}

impl<K, V, S> CasMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    /// Maps `key` to `value`, returning the previous value if the key was
    /// present. The new value is published before the old entry is retired,
    /// so a concurrent reader sees one of the two, never neither.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let guard = epoch::pin();
        let hash = self.hash_of(&key);
        let array = self.table.select_for_update(&guard);
        self.table.update(array, hash, key, value, UpdateMode::Upsert, None, false, &guard).cloned()
    }

    /// Inserts only if the key is absent. Returns the already-present value
    /// otherwise, leaving the map unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// use casmap::CasMap;
    ///
    /// let map = CasMap::new();
    /// assert_eq!(map.insert_if_absent(1, 10), None);
    /// assert_eq!(map.insert_if_absent(1, 20), Some(10));
    /// assert_eq!(map.get(&1), Some(10));
    /// ```
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<V> {
        let guard = epoch::pin();
        let hash = self.hash_of(&key);
        let array = self.table.select_for_update(&guard);
        self.table
            .update(array, hash, key, value, UpdateMode::IfAbsent, None, false, &guard)
            .cloned()
    }

    /// Inserts every pair of `entries`. Each insertion is an independent
    /// `insert`; there is no bulk atomicity.
    pub fn insert_all<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in entries {
            self.insert(key, value);
        }
    }

    /// Replaces the value only if the key is present. Returns the previous
    /// value, or `None` without inserting when the key is absent.
    pub fn replace(&self, key: K, value: V) -> Option<V> {
        let guard = epoch::pin();
        let hash = self.hash_of(&key);
        let array = self.table.select_for_update(&guard);
        self.table
            .update(array, hash, key, value, UpdateMode::ReplaceOnly, None, false, &guard)
            .cloned()
    }

    /// Replaces the value only if the key currently maps to `expected`;
    /// true if the replacement happened.
    ///
    /// # Examples
    ///
    /// ```
    /// use casmap::CasMap;
    ///
    /// let map = CasMap::new();
    /// map.insert(5, 50);
    /// assert!(!map.compare_replace(5, &99, 100));
    /// assert_eq!(map.get(&5), Some(50));
    /// assert!(map.compare_replace(5, &50, 100));
    /// assert_eq!(map.get(&5), Some(100));
    /// ```
    pub fn compare_replace(&self, key: K, expected: &V, value: V) -> bool
    where
        V: PartialEq,
    {
        let guard = epoch::pin();
        let hash = self.hash_of(&key);
        let array = self.table.select_for_update(&guard);
        match self.table.update(
            array,
            hash,
            key,
            value,
            UpdateMode::ReplaceOnly,
            Some(&mut |v: &V| v == expected),
            false,
            &guard,
        ) {
            Some(previous) => previous == expected,
            None => false,
        }
    }
}

impl<K, V, S> Default for CasMap<K, V, S>
where
    S: Default,
{
    /// Creates an empty `CasMap<K, V, S>` with the `Default` value for the
    /// hasher.
    #[inline]
    fn default() -> Self {
        Self::with_hasher(Default::default())
    }
}

impl<'a, K, V, S> IntoIterator for &'a CasMap<K, V, S>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Iter<'a, K, V> {
        self.iter()
    }
}
