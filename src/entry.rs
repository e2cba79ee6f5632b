use crossbeam_epoch::Atomic;
use std::sync::atomic::{AtomicBool, Ordering};

/// A single chain node.
///
/// The hash, key and value never change after construction; replacing a value
/// publishes a fresh node and logically deletes this one. The `deleted` flag
/// is monotone, once raised it never reverts, so a reader that observed a live
/// node may act on it even while a remover is racing.
pub(crate) struct Entry<K, V> {
    pub(crate) hash: u32,
    pub(crate) key: K,
    pub(crate) value: V,
    pub(crate) next: Atomic<Entry<K, V>>,
    deleted: AtomicBool,
}

impl<K, V> Entry<K, V> {
    pub(crate) fn new(hash: u32, key: K, value: V) -> Self {
        Self { hash, key, value, next: Atomic::null(), deleted: AtomicBool::new(false) }
    }

    #[inline]
    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Raise the deleted flag. Returns false if another thread won the race,
    /// in which case the caller must not account for the removal.
    #[inline]
    pub(crate) fn mark_deleted(&self) -> bool {
        self.deleted.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }
}
