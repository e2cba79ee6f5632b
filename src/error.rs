use thiserror::Error;

/// Errors reported by the map's iterators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// `remove_current` was called before any entry was yielded, twice for the
    /// same entry, or after the entry was removed behind the iterator's back.
    #[error("iterator does not point at a live entry")]
    InvalidIteratorState,
}
