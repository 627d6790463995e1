//! A tree store that counts node references.
//!
//! [`RefCountStore`] behaves exactly like a [`TreeStore`] but records every
//! [`ref_node`](TreeModel::ref_node) and [`unref_node`](TreeModel::unref_node)
//! it receives. Tests stack proxies on top of it and use [`check_level`]
//! and the `assert_*` helpers to pin down how many references the proxies
//! hold on each backing row.
//!
//! [`check_level`]: RefCountStore::check_level

use std::collections::HashMap;

use parking_lot::Mutex;

use horizon_arbor_core::logging::targets;

use super::iter::TreeIter;
use super::path::TreePath;
use super::traits::{ModelFlags, ModelSignals, TreeModel};
use super::tree_store::TreeStore;
use super::value::{Value, ValueType};

/// A [`TreeStore`] that tracks a reference count per row.
///
/// Counts are keyed by row identity and survive reordering. Releasing a row
/// more often than it was referenced panics.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use horizon_arbor::model::{RefCountStore, TreeModel, ValueType};
///
/// let store = Arc::new(RefCountStore::new(&[ValueType::Int]));
/// let row = store.store().append(None).unwrap();
///
/// store.ref_node(&row);
/// store.assert_root_level_referenced(1);
/// store.unref_node(&row);
/// store.assert_entire_model_unreferenced();
/// ```
pub struct RefCountStore {
    store: TreeStore,
    counts: Mutex<HashMap<u64, usize>>,
}

impl RefCountStore {
    /// Creates an empty counting store with the given column types.
    pub fn new(column_types: &[ValueType]) -> Self {
        Self {
            store: TreeStore::new(column_types),
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped store, used to populate and mutate the rows.
    pub fn store(&self) -> &TreeStore {
        &self.store
    }

    /// Current reference count of the row at `iter`.
    pub fn node_ref_count(&self, iter: &TreeIter) -> usize {
        self.counts.lock().get(&iter.node()).copied().unwrap_or(0)
    }

    fn check_iter(&self, iter: &TreeIter, expected: usize, may_assert: bool) -> bool {
        let actual = self.counts.lock().get(&iter.node()).copied();
        match actual {
            None if expected == 0 => true,
            None => {
                if may_assert {
                    panic!(
                        "expected ref count {}, but node has never been referenced",
                        expected
                    );
                }
                false
            }
            Some(actual) if actual != expected => {
                if may_assert {
                    panic!("expected ref count {}, but got {}", expected, actual);
                }
                false
            }
            Some(_) => true,
        }
    }

    /// Verifies that every child of `parent` (or every root row) has a
    /// reference count of exactly `expected`.
    ///
    /// With `recurse`, descendants are checked as well. With `may_assert`,
    /// the first mismatch panics instead of returning `false`.
    pub fn check_level(
        &self,
        parent: Option<&TreeIter>,
        expected: usize,
        recurse: bool,
        may_assert: bool,
    ) -> bool {
        let mut pending: Vec<Option<TreeIter>> = vec![parent.copied()];
        while let Some(parent) = pending.pop() {
            let mut child = self.store.iter_children(parent.as_ref());
            while let Some(iter) = child {
                if !self.check_iter(&iter, expected, may_assert) {
                    return false;
                }
                if recurse && self.store.iter_has_child(&iter) {
                    pending.push(Some(iter));
                }
                child = self.store.iter_next(&iter);
            }
        }
        true
    }

    /// Panics unless no row anywhere is referenced.
    pub fn assert_entire_model_unreferenced(&self) {
        self.check_level(None, 0, true, true);
    }

    /// Panics unless no root row is referenced.
    pub fn assert_root_level_unreferenced(&self) {
        self.check_level(None, 0, false, true);
    }

    /// Panics unless no child of `parent` is referenced.
    pub fn assert_level_unreferenced(&self, parent: &TreeIter) {
        self.check_level(Some(parent), 0, false, true);
    }

    /// Panics unless every row is referenced exactly `count` times.
    pub fn assert_entire_model_referenced(&self, count: usize) {
        self.check_level(None, count, true, true);
    }

    /// Panics if every row is referenced exactly `count` times.
    pub fn assert_not_entire_model_referenced(&self, count: usize) {
        assert!(
            !self.check_level(None, count, true, false),
            "every row is referenced {} times",
            count
        );
    }

    /// Panics unless every root row is referenced exactly `count` times.
    pub fn assert_root_level_referenced(&self, count: usize) {
        self.check_level(None, count, false, true);
    }

    /// Panics unless every child of `parent` is referenced exactly `count` times.
    pub fn assert_level_referenced(&self, count: usize, parent: &TreeIter) {
        self.check_level(Some(parent), count, false, true);
    }

    /// Panics unless the row at `iter` is referenced exactly `count` times.
    pub fn assert_node_ref_count(&self, iter: &TreeIter, count: usize) {
        self.check_iter(iter, count, true);
    }
}

impl std::fmt::Debug for RefCountStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefCountStore")
            .field("store", &self.store)
            .field("referenced_rows", &self.counts.lock().len())
            .finish()
    }
}

impl TreeModel for RefCountStore {
    fn flags(&self) -> ModelFlags {
        self.store.flags()
    }

    fn n_columns(&self) -> usize {
        self.store.n_columns()
    }

    fn column_type(&self, column: usize) -> Option<ValueType> {
        self.store.column_type(column)
    }

    fn iter(&self, path: &TreePath) -> Option<TreeIter> {
        self.store.iter(path)
    }

    fn path(&self, iter: &TreeIter) -> Option<TreePath> {
        self.store.path(iter)
    }

    fn value(&self, iter: &TreeIter, column: usize) -> Value {
        self.store.value(iter, column)
    }

    fn iter_next(&self, iter: &TreeIter) -> Option<TreeIter> {
        self.store.iter_next(iter)
    }

    fn iter_previous(&self, iter: &TreeIter) -> Option<TreeIter> {
        self.store.iter_previous(iter)
    }

    fn iter_children(&self, parent: Option<&TreeIter>) -> Option<TreeIter> {
        self.store.iter_children(parent)
    }

    fn iter_has_child(&self, iter: &TreeIter) -> bool {
        self.store.iter_has_child(iter)
    }

    fn iter_n_children(&self, parent: Option<&TreeIter>) -> usize {
        self.store.iter_n_children(parent)
    }

    fn iter_nth_child(&self, parent: Option<&TreeIter>, n: usize) -> Option<TreeIter> {
        self.store.iter_nth_child(parent, n)
    }

    fn iter_parent(&self, child: &TreeIter) -> Option<TreeIter> {
        self.store.iter_parent(child)
    }

    fn ref_node(&self, iter: &TreeIter) {
        *self.counts.lock().entry(iter.node()).or_insert(0) += 1;
    }

    fn unref_node(&self, iter: &TreeIter) {
        let mut counts = self.counts.lock();
        let count = counts.entry(iter.node()).or_insert(0);
        assert!(*count > 0, "unref of a node that holds no reference");
        *count -= 1;
        tracing::trace!(target: targets::STORE, node = iter.node(), count = *count, "unref");
    }

    fn signals(&self) -> &ModelSignals {
        self.store.signals()
    }
}
