use crate::entry::Entry;
use crate::iter::RawIter;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};

/// Smallest bucket array the table will ever allocate.
pub(crate) const MIN_CAPACITY: usize = 16;

/// Avalanche mixer applied to the caller's raw 32-bit hash (Wang/Jenkins
/// style). Spreads consecutive raw hashes over the whole table and clears the
/// sign bit so the result can double as a non-negative chain discriminator.
#[inline]
pub(crate) fn mix(mut h: u32) -> u32 {
    h = h.wrapping_add((h << 15) ^ 0xffff_cd7d);
    h ^= h >> 10;
    h = h.wrapping_add(h << 3);
    h ^= h >> 6;
    h = h.wrapping_add((h << 2).wrapping_add(h << 14));
    h ^= h >> 16;
    h & 0x7fff_ffff
}

/// A fixed-length, power-of-two array of chain heads.
///
/// A slot goes null -> entry by CAS; afterwards only the head pointer (when a
/// dead head is compacted away) or the chain links themselves move.
pub(crate) struct BucketArray<K, V> {
    buckets: Box<[Atomic<Entry<K, V>>]>,
}

impl<K, V> BucketArray<K, V> {
    pub(crate) fn new(len: usize) -> Self {
        debug_assert!(len.is_power_of_two());
        let mut buckets = Vec::with_capacity(len);
        buckets.resize_with(len, Atomic::null);
        Self { buckets: buckets.into_boxed_slice() }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Chain head for a mixed hash; the length is a power of two so masking
    /// and taking the hash modulo the length agree.
    #[inline]
    pub(crate) fn bucket(&self, hash: u32) -> &Atomic<Entry<K, V>> {
        &self.buckets[hash as usize & (self.buckets.len() - 1)]
    }

    #[inline]
    pub(crate) fn bucket_at(&self, index: usize) -> &Atomic<Entry<K, V>> {
        &self.buckets[index]
    }
}

impl<K, V> Drop for BucketArray<K, V> {
    fn drop(&mut self) {
        // Entries unlinked by compaction were retired individually and are no
        // longer reachable from any head; everything still linked is freed
        // here, exactly once per node since chains are acyclic and disjoint.
        let guard = unsafe { epoch::unprotected() };
        for slot in self.buckets.iter() {
            let mut cur = slot.load(Ordering::Relaxed, guard);
            while !cur.is_null() {
                // SAFETY: the array is being dropped, nothing else can reach
                // these nodes anymore.
                let entry = unsafe { cur.into_owned() };
                cur = entry.next.load(Ordering::Relaxed, guard);
            }
        }
    }
}

/// How the parameterized update routine treats an existing mapping.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateMode {
    /// Insert or replace unconditionally.
    Upsert,
    /// Keep an existing live mapping and return it untouched.
    IfAbsent,
    /// Only replace; never create a mapping for an absent key.
    ReplaceOnly,
}

/// The CAS-only core of the map.
///
/// All state lives in atomics: the two bucket-array pointers, the entry count
/// and the resize flag. No operation ever blocks; contended CAS attempts are
/// simply retried. `data_new` is null until the first resize and from then on
/// always points at the most recently allocated array; the combination
/// `data_new != null && resize_lock` is what mutators and readers treat as
/// "a resize is migrating right now".
pub(crate) struct RawTable<K, V> {
    data: Atomic<BucketArray<K, V>>,
    data_new: Atomic<BucketArray<K, V>>,
    size: AtomicUsize,
    resize_lock: AtomicBool,
    resize_threshold: AtomicUsize,
    initial_capacity: usize,
    load_factor: f32,
    resizable: bool,
}

impl<K, V> RawTable<K, V> {
    /// `initial_capacity` and `load_factor` must already be clamped by the
    /// public constructors.
    pub(crate) fn with_options(initial_capacity: usize, load_factor: f32, resizable: bool) -> Self {
        Self {
            data: Atomic::new(BucketArray::new(initial_capacity)),
            data_new: Atomic::null(),
            size: AtomicUsize::new(0),
            resize_lock: AtomicBool::new(false),
            resize_threshold: AtomicUsize::new((initial_capacity as f32 * load_factor) as usize),
            initial_capacity,
            load_factor,
            resizable,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn load_factor(&self) -> f32 {
        self.load_factor
    }

    #[inline]
    pub(crate) fn is_resizable(&self) -> bool {
        self.resizable
    }

    /// Inserts left before the next resize is triggered; zero once the
    /// threshold has been reached.
    pub(crate) fn remaining_before_resize(&self) -> usize {
        self.resize_threshold.load(Ordering::Acquire).saturating_sub(self.len())
    }

    pub(crate) fn capacity(&self, guard: &Guard) -> usize {
        // SAFETY: `data` is never null and the guard keeps the array alive.
        unsafe { self.data.load(Ordering::Acquire, guard).deref() }.len()
    }

    pub(crate) fn current_array<'g>(&self, guard: &'g Guard) -> &'g BucketArray<K, V> {
        // SAFETY: `data` is never null and superseded arrays are only retired
        // through the epoch, so the reference is valid for the guard.
        unsafe { self.data.load(Ordering::Acquire, guard).deref() }
    }

    /// The entry count is kept by explicit CAS retry rather than fetch-add so
    /// a failed attempt re-reads the latest value. It is approximate while
    /// mutators are in flight and exact in a quiescent table.
    fn increment_size(&self) {
        let mut size = self.size.load(Ordering::Relaxed);
        loop {
            match self.size.compare_exchange_weak(
                size,
                size + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => size = current,
            }
        }
    }

    fn decrement_size(&self) {
        let mut size = self.size.load(Ordering::Relaxed);
        loop {
            match self.size.compare_exchange_weak(
                size,
                size.saturating_sub(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => size = current,
            }
        }
    }

    /// Walk one chain for the first live entry matching `hash` and `is_match`.
    fn find<'g>(
        array: &'g BucketArray<K, V>,
        hash: u32,
        is_match: &mut dyn FnMut(&K) -> bool,
        guard: &'g Guard,
    ) -> Option<&'g V> {
        let mut cur = array.bucket(hash).load(Ordering::Acquire, guard);
        // SAFETY: chain nodes are retired through the epoch only after they
        // are unreachable, so every pointer read under the guard stays valid.
        while let Some(entry) = unsafe { cur.as_ref() } {
            if !entry.is_deleted() && entry.hash == hash && is_match(&entry.key) {
                return Some(&entry.value);
            }
            cur = entry.next.load(Ordering::Acquire, guard);
        }
        None
    }

    /// Lookup tolerating an in-flight resize.
    ///
    /// Up to three probes: the array a resize is filling first, then the
    /// array it drains, then whichever is current by the time both missed.
    /// This keeps a key visible while its migration straddles the moment the
    /// resize commits.
    pub(crate) fn get<'g>(
        &self,
        hash: u32,
        is_match: &mut dyn FnMut(&K) -> bool,
        guard: &'g Guard,
    ) -> Option<&'g V>
    where
        K: 'g,
    {
        let data_new = self.data_new.load(Ordering::Acquire, guard);
        let resizing = !data_new.is_null() && self.resize_lock.load(Ordering::Acquire);
        let mut array = if resizing { data_new } else { self.data.load(Ordering::Acquire, guard) };
        for probe in 0..3 {
            // SAFETY: arrays are epoch-retired, the guard keeps them valid.
            let found = Self::find(unsafe { array.deref() }, hash, is_match, guard);
            if found.is_some() {
                return found;
            }
            match probe {
                0 if !resizing => return None,
                0 => array = self.data.load(Ordering::Acquire, guard),
                1 => {
                    let data_new = self.data_new.load(Ordering::Acquire, guard);
                    array = if data_new.is_null() {
                        self.data.load(Ordering::Acquire, guard)
                    } else {
                        data_new
                    };
                }
                _ => return None,
            }
        }
        None
    }

    /// Full scan of the current array for a live entry whose value matches.
    pub(crate) fn contains_value(
        &self,
        is_match: &mut dyn FnMut(&V) -> bool,
        guard: &Guard,
    ) -> bool {
        let array = self.current_array(guard);
        for index in 0..array.len() {
            let mut cur = array.bucket_at(index).load(Ordering::Acquire, guard);
            // SAFETY: as in `find`.
            while let Some(entry) = unsafe { cur.as_ref() } {
                if !entry.is_deleted() && is_match(&entry.value) {
                    return true;
                }
                cur = entry.next.load(Ordering::Acquire, guard);
            }
        }
        false
    }

    /// Logical removal: flip the deleted flag of the first live matching
    /// entry; unlinking is left to later chain walks.
    ///
    /// Removal deliberately targets only the current array. An entry that an
    /// in-flight resize has already republished is found through the
    /// mutator-side redirect of later operations instead; the window where
    /// neither happens is a documented hazard of the migration protocol.
    pub(crate) fn remove<'g>(
        &self,
        hash: u32,
        is_match: &mut dyn FnMut(&K) -> bool,
        mut value_match: Option<&mut dyn FnMut(&V) -> bool>,
        guard: &'g Guard,
    ) -> Option<&'g V>
    where
        K: 'g,
    {
        let array = self.current_array(guard);
        let mut cur = array.bucket(hash).load(Ordering::Acquire, guard);
        // SAFETY: as in `find`.
        while let Some(entry) = unsafe { cur.as_ref() } {
            if !entry.is_deleted() && entry.hash == hash && is_match(&entry.key) {
                let matches = match value_match.as_mut() {
                    Some(check) => check(&entry.value),
                    None => true,
                };
                if matches {
                    if entry.mark_deleted() {
                        self.decrement_size();
                        return Some(&entry.value);
                    }
                    // Another remover flipped the flag first.
                    return None;
                }
            }
            cur = entry.next.load(Ordering::Acquire, guard);
        }
        None
    }
}

impl<K, V> RawTable<K, V>
where
    K: Eq,
{
    /// The parameterized core behind insert, insert-if-absent and the two
    /// replace flavors.
    ///
    /// A fresh entry is published *before* the superseded one is logically
    /// deleted, so a concurrent reader always observes at least one live copy
    /// of a key that is being replaced. Returns the previous live value when
    /// one was found, `None` when the key was absent.
    pub(crate) fn update<'g>(
        &self,
        array: &'g BucketArray<K, V>,
        hash: u32,
        key: K,
        value: V,
        mode: UpdateMode,
        mut expected: Option<&mut dyn FnMut(&V) -> bool>,
        is_resize: bool,
        guard: &'g Guard,
    ) -> Option<&'g V> {
        let slot = array.bucket(hash);
        let mut new_entry = Owned::new(Entry::new(hash, key, value));

        // Resolve a live head to walk from, compacting dead heads on the way.
        let head = loop {
            let head = slot.load(Ordering::Acquire, guard);
            // SAFETY: as in `find`.
            let head_ref = match unsafe { head.as_ref() } {
                Some(head_ref) => head_ref,
                None => {
                    if mode == UpdateMode::ReplaceOnly {
                        return None;
                    }
                    match slot.compare_exchange(
                        Shared::null(),
                        new_entry,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    ) {
                        Ok(_) => {
                            if !is_resize {
                                self.increment_size();
                            }
                            return None;
                        }
                        Err(err) => {
                            new_entry = err.new;
                            continue;
                        }
                    }
                }
            };
            if head_ref.is_deleted() {
                let successor = head_ref.next.load(Ordering::Acquire, guard);
                if successor.is_null() {
                    // Dead head with no successor: take its place outright.
                    if mode == UpdateMode::ReplaceOnly {
                        return None;
                    }
                    match slot.compare_exchange(
                        head,
                        new_entry,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    ) {
                        Ok(_) => {
                            // SAFETY: the CAS unlinked `head`, nothing reaches
                            // it through the table anymore.
                            unsafe { guard.defer_destroy(head) };
                            if !is_resize {
                                self.increment_size();
                            }
                            return None;
                        }
                        Err(err) => {
                            new_entry = err.new;
                            continue;
                        }
                    }
                }
                // Unlink the dead head; on failure someone else already
                // changed the slot and the re-read picks that up.
                if slot
                    .compare_exchange(head, successor, Ordering::AcqRel, Ordering::Acquire, guard)
                    .is_ok()
                {
                    // SAFETY: as above.
                    unsafe { guard.defer_destroy(head) };
                }
                continue;
            }
            break head_ref;
        };

        let mut old_entry: Option<&'g Entry<K, V>> = None;
        if head.hash == hash && head.key == new_entry.key {
            if mode == UpdateMode::IfAbsent {
                return Some(&head.value);
            }
            if let Some(check) = expected.as_mut() {
                if !check(&head.value) {
                    return Some(&head.value);
                }
            }
            old_entry = Some(head);
        }

        // Walk to the tail, recording the live match and skipping dead nodes.
        let mut pred = head;
        loop {
            let next = pred.next.load(Ordering::Acquire, guard);
            // SAFETY: as in `find`.
            let next_ref = match unsafe { next.as_ref() } {
                None => {
                    if mode == UpdateMode::ReplaceOnly && old_entry.is_none() {
                        return None;
                    }
                    match pred.next.compare_exchange(
                        Shared::null(),
                        new_entry,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    ) {
                        Ok(_) => {
                            if old_entry.is_none() && !is_resize {
                                self.increment_size();
                            }
                            break;
                        }
                        Err(err) => {
                            // Another thread extended the chain; retry from
                            // the same node.
                            new_entry = err.new;
                            continue;
                        }
                    }
                }
                Some(next_ref) => next_ref,
            };
            if next_ref.is_deleted() {
                let successor = next_ref.next.load(Ordering::Acquire, guard);
                // Unlink the dead node and re-read from the same predecessor;
                // a failed CAS means the link changed underneath and the next
                // round sees the fresh value either way.
                if pred
                    .next
                    .compare_exchange(next, successor, Ordering::AcqRel, Ordering::Acquire, guard)
                    .is_ok()
                {
                    // SAFETY: the CAS unlinked `next`.
                    unsafe { guard.defer_destroy(next) };
                }
                continue;
            }
            if next_ref.hash == hash && next_ref.key == new_entry.key {
                if mode == UpdateMode::IfAbsent {
                    return Some(&next_ref.value);
                }
                if let Some(check) = expected.as_mut() {
                    if !check(&next_ref.value) {
                        return Some(&next_ref.value);
                    }
                }
                old_entry = Some(next_ref);
            }
            pred = next_ref;
        }

        if let Some(old) = old_entry {
            // The new value is published; retire the one it supersedes. A
            // failed flip means a racing remover already did.
            old.mark_deleted();
            return Some(&old.value);
        }
        None
    }
}

impl<K, V> RawTable<K, V>
where
    K: Eq + Clone,
    V: Clone,
{
    /// Pick the array a mutation must act on, growing the table first when
    /// the threshold has been reached. While a resize is migrating, mutators
    /// write into the array it is filling.
    pub(crate) fn select_for_update<'g>(&self, guard: &'g Guard) -> &'g BucketArray<K, V> {
        if self.resizable {
            self.check_resize(guard);
        }
        let data_new = self.data_new.load(Ordering::Acquire, guard);
        let target = if !data_new.is_null() && self.resize_lock.load(Ordering::Acquire) {
            data_new
        } else {
            self.data.load(Ordering::Acquire, guard)
        };
        // SAFETY: both arrays are epoch-retired and non-null here.
        unsafe { target.deref() }
    }

    fn check_resize(&self, guard: &Guard) {
        if self.resize_threshold.load(Ordering::Acquire) <= self.len() {
            self.resize(guard);
        }
    }

    /// Double the table. At most one thread runs this at a time; a thread
    /// that loses the flag race proceeds with its mutation without waiting.
    #[cold]
    fn resize(&self, guard: &Guard) {
        if self
            .resize_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if self.resize_threshold.load(Ordering::Acquire) > self.len() {
            // A burst of removals cleared the threshold between the check and
            // the lock acquisition; nothing to do.
            self.resize_lock.store(false, Ordering::Release);
            return;
        }

        let data = self.data.load(Ordering::Acquire, guard);
        // SAFETY: `data` is never null.
        let old_array = unsafe { data.deref() };
        let new_capacity = old_array.len() * 2;
        self.resize_threshold
            .store((new_capacity as f32 * self.load_factor) as usize, Ordering::Release);
        let new = Owned::new(BucketArray::new(new_capacity)).into_shared(guard);
        let stale = self.data_new.swap(new, Ordering::AcqRel, guard);
        if !stale.is_null() && stale != data {
            // A previous `clear` replaced `data` and orphaned this array.
            // SAFETY: nothing selects it anymore.
            unsafe { guard.defer_destroy(stale) };
        }
        // SAFETY: just allocated, never null.
        let new_array = unsafe { new.deref() };

        // Republish every live entry, then retire the original. A key the
        // migration races with is kept wherever the newer copy already is:
        // if a writer got to the new array first, if-absent leaves that copy
        // alone; migrated size is already accounted for, so the per-entry
        // counting is suppressed.
        let mut entries = RawIter::new(old_array);
        // SAFETY: `old_array` was loaded under `guard` and stays valid.
        while let Some(entry) = unsafe { entries.next(guard) } {
            self.update(
                new_array,
                entry.hash,
                entry.key.clone(),
                entry.value.clone(),
                UpdateMode::IfAbsent,
                None,
                true,
                guard,
            );
            entry.mark_deleted();
        }

        self.data.store(new, Ordering::Release);
        // SAFETY: the swing above made the old array unreachable for new
        // operations; in-flight readers are covered by their guards.
        unsafe { guard.defer_destroy(data) };
        self.resize_lock.store(false, Ordering::Release);
    }
}

impl<K, V> RawTable<K, V> {
    /// Swap in a fresh array of the construction-time capacity and drain the
    /// counter. Not coordinated with an in-flight resize or with concurrent
    /// mutators; entries interleaving with a clear may survive or be lost.
    pub(crate) fn clear(&self, guard: &Guard) {
        let fresh = Owned::new(BucketArray::new(self.initial_capacity)).into_shared(guard);
        let old = self.data.swap(fresh, Ordering::AcqRel, guard);
        let data_new = self.data_new.load(Ordering::Acquire, guard);
        if old != data_new {
            // SAFETY: `old` is no longer selectable by any new operation.
            unsafe { guard.defer_destroy(old) };
        }
        let mut size = self.size.load(Ordering::Acquire);
        loop {
            match self.size.compare_exchange_weak(size, 0, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(current) => size = current,
            }
        }
    }
}

impl<K, V> Drop for RawTable<K, V> {
    fn drop(&mut self) {
        fence(Ordering::Acquire);
        let guard = unsafe { epoch::unprotected() };
        let data = self.data.load(Ordering::Relaxed, guard);
        let data_new = self.data_new.load(Ordering::Relaxed, guard);
        // After a resize both fields alias the same array; free it once.
        if !data_new.is_null() && data_new != data {
            // SAFETY: exclusive access, nothing is pinned anymore.
            drop(unsafe { data_new.into_owned() });
        }
        if !data.is_null() {
            // SAFETY: as above.
            drop(unsafe { data.into_owned() });
        }
    }
}
