//! Iterators: short-lived handles to rows.

use std::sync::atomic::{AtomicU64, Ordering};

use slotmap::{Key, KeyData};

/// Counter shared by every model so that no two stamps ever coincide.
static STAMP_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Draws a fresh model stamp.
///
/// A model stamps each iterator it hands out and replaces its stamp whenever
/// outstanding iterators become meaningless. Stamps are globally unique, so an
/// iterator from one model is always rejected by another.
pub fn next_stamp() -> u64 {
    STAMP_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A handle to one row of a specific model.
///
/// Iterators are cheap copies that only the issuing model can interpret.
/// Unless the model advertises [`ModelFlags::iters_persist`](super::ModelFlags),
/// an iterator is valid only until the next change notification of its model.
/// To keep a row alive across changes, pass the iterator to
/// [`TreeModel::ref_node`](super::TreeModel::ref_node) or hold a
/// [`RowReference`](super::RowReference).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeIter {
    stamp: u64,
    level: u64,
    node: u64,
}

impl TreeIter {
    /// Creates an iterator from raw parts.
    ///
    /// Model implementations choose what `level` and `node` mean.
    #[inline]
    pub const fn new(stamp: u64, level: u64, node: u64) -> Self {
        Self { stamp, level, node }
    }

    /// Creates an iterator from slotmap keys.
    pub(crate) fn from_keys(stamp: u64, level: impl Key, node: impl Key) -> Self {
        Self::new(stamp, level.data().as_ffi(), node.data().as_ffi())
    }

    /// The stamp of the model that issued this iterator.
    #[inline]
    pub const fn stamp(&self) -> u64 {
        self.stamp
    }

    /// First model-specific word.
    #[inline]
    pub const fn level(&self) -> u64 {
        self.level
    }

    /// Second model-specific word.
    #[inline]
    pub const fn node(&self) -> u64 {
        self.node
    }

    /// Decodes the `level` word as a slotmap key.
    pub(crate) fn level_key<K: Key>(&self) -> K {
        KeyData::from_ffi(self.level).into()
    }

    /// Decodes the `node` word as a slotmap key.
    pub(crate) fn node_key<K: Key>(&self) -> K {
        KeyData::from_ffi(self.node).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::{SlotMap, new_key_type};

    new_key_type! {
        struct TestKey;
    }

    #[test]
    fn test_stamps_are_unique() {
        let a = next_stamp();
        let b = next_stamp();
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_round_trip() {
        let mut map: SlotMap<TestKey, &str> = SlotMap::with_key();
        let level = map.insert("level");
        let node = map.insert("node");

        let iter = TreeIter::from_keys(7, level, node);
        assert_eq!(iter.stamp(), 7);
        assert_eq!(iter.level_key::<TestKey>(), level);
        assert_eq!(map[iter.node_key::<TestKey>()], "node");
    }
}
