//! Row references: handles that follow a row across structural changes.
//!
//! A [`RowReference`] remembers the path of one row and keeps it up to date
//! as the model inserts, deletes and reorders rows around it. While valid, it
//! holds a reference (see [`TreeModel::ref_node`]) on every row along its
//! path, so proxy models keep that part of their cache alive. When the row
//! or one of its ancestors is deleted, the reference becomes invalid for good.
//!
//! References are registered in the model's [`ModelSignals`](super::ModelSignals);
//! the `emit_*` helpers update them before any slot observes the change.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

use horizon_arbor_core::logging::targets;

use super::path::TreePath;
use super::traits::TreeModel;

new_key_type! {
    /// Registration key of a row reference inside its model's signals.
    pub(crate) struct ReferenceId;
}

struct Registration {
    /// `None` once the row is gone.
    path: Option<TreePath>,
    model: Weak<dyn TreeModel>,
}

/// The set of references registered against one model.
#[derive(Default)]
pub(crate) struct RowReferenceList {
    entries: Mutex<SlotMap<ReferenceId, Registration>>,
}

impl RowReferenceList {
    fn register(&self, model: Weak<dyn TreeModel>, path: TreePath) -> ReferenceId {
        self.entries.lock().insert(Registration {
            path: Some(path),
            model,
        })
    }

    /// Removes a registration, returning its path if it was still valid.
    fn unregister(&self, id: ReferenceId) -> Option<TreePath> {
        self.entries.lock().remove(id).and_then(|entry| entry.path)
    }

    fn path(&self, id: ReferenceId) -> Option<TreePath> {
        self.entries.lock().get(id).and_then(|entry| entry.path.clone())
    }

    pub(crate) fn row_inserted(&self, inserted: &TreePath) {
        let Some(last) = inserted.last() else {
            return;
        };
        let depth = inserted.depth();
        let parent = &inserted.indices()[..depth - 1];

        let mut entries = self.entries.lock();
        for entry in entries.values_mut() {
            let Some(path) = entry.path.as_mut() else {
                continue;
            };
            if path.depth() < depth || !path.indices().starts_with(parent) {
                continue;
            }
            let index = &mut path.indices_mut()[depth - 1];
            if *index >= last {
                *index += 1;
            }
        }
    }

    pub(crate) fn row_deleted(&self, deleted: &TreePath) {
        let Some(last) = deleted.last() else {
            return;
        };
        let depth = deleted.depth();
        let parent = &deleted.indices()[..depth - 1];

        // Releases run after the lock is dropped: they call into the model.
        let mut releases: Vec<(Weak<dyn TreeModel>, TreePath, usize)> = Vec::new();
        {
            let mut entries = self.entries.lock();
            for entry in entries.values_mut() {
                let Some(path) = entry.path.as_mut() else {
                    continue;
                };
                if path.depth() < depth || !path.indices().starts_with(parent) {
                    continue;
                }
                let index = path.indices()[depth - 1];
                if index == last {
                    // Rows below the deleted one are already gone.
                    let surviving = if path.depth() > depth {
                        depth - 1
                    } else {
                        path.depth() - 1
                    };
                    if let Some(path) = entry.path.take() {
                        releases.push((entry.model.clone(), path, surviving));
                    }
                } else if index > last {
                    path.indices_mut()[depth - 1] -= 1;
                }
            }
        }

        for (model, path, depth) in releases {
            tracing::trace!(target: targets::ROW_REFERENCE, %path, "row reference invalidated");
            if let Some(model) = model.upgrade() {
                unref_path(model.as_ref(), &path, depth);
            }
        }
    }

    pub(crate) fn rows_reordered(&self, parent: &TreePath, new_order: &[usize]) {
        let depth = parent.depth();
        let mut entries = self.entries.lock();
        for entry in entries.values_mut() {
            let Some(path) = entry.path.as_mut() else {
                continue;
            };
            if !parent.is_ancestor(path) {
                continue;
            }
            let old = path.indices()[depth];
            if let Some(new) = new_order.iter().position(|&o| o == old) {
                path.indices_mut()[depth] = new;
            }
        }
    }
}

/// References every row along `path`, parents first.
pub(crate) fn ref_path(model: &dyn TreeModel, path: &TreePath) {
    let mut parent = None;
    for &index in path.indices() {
        let Some(iter) = model.iter_nth_child(parent.as_ref(), index) else {
            return;
        };
        model.ref_node(&iter);
        parent = Some(iter);
    }
}

/// Releases the rows along the first `depth` indices of `path`, children first.
pub(crate) fn unref_path(model: &dyn TreeModel, path: &TreePath, depth: usize) {
    let mut chain = Vec::with_capacity(depth);
    let mut parent = None;
    for &index in path.indices().iter().take(depth) {
        let Some(iter) = model.iter_nth_child(parent.as_ref(), index) else {
            break;
        };
        chain.push(iter);
        parent = Some(iter);
    }
    for iter in chain.iter().rev() {
        model.unref_node(iter);
    }
}

/// A persistent handle to a row.
///
/// Dropping the reference releases the rows it held.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use horizon_arbor::model::{RowReference, TreeModel, TreePath, TreeStore, ValueType};
///
/// let store = Arc::new(TreeStore::new(&[ValueType::Int]));
/// store.append(None).unwrap();
/// store.append(None).unwrap();
///
/// let model: Arc<dyn TreeModel> = store.clone();
/// let reference = RowReference::new(model, &TreePath::from([1])).unwrap();
///
/// store.prepend(None).unwrap();
/// assert_eq!(reference.path(), Some(TreePath::from([2])));
///
/// let row = store.iter(&TreePath::from([2])).unwrap();
/// store.remove(&row).unwrap();
/// assert!(!reference.valid());
/// ```
pub struct RowReference {
    model: Arc<dyn TreeModel>,
    id: ReferenceId,
}

impl RowReference {
    /// Creates a reference to the row at `path`.
    ///
    /// Returns `None` if the path does not resolve to a row.
    pub fn new(model: Arc<dyn TreeModel>, path: &TreePath) -> Option<Self> {
        if path.is_empty() {
            return None;
        }
        model.iter(path)?;
        ref_path(model.as_ref(), path);

        let id = model
            .signals()
            .references()
            .register(Arc::downgrade(&model), path.clone());
        Some(Self { model, id })
    }

    /// The current path of the row, or `None` once it has been deleted.
    pub fn path(&self) -> Option<TreePath> {
        self.model.signals().references().path(self.id)
    }

    /// Returns `true` while the row exists.
    pub fn valid(&self) -> bool {
        self.path().is_some()
    }

    /// The model this reference points into.
    pub fn model(&self) -> &Arc<dyn TreeModel> {
        &self.model
    }

    /// Creates an independent reference to the same row.
    pub fn copy(&self) -> Option<RowReference> {
        RowReference::new(self.model.clone(), &self.path()?)
    }
}

impl Drop for RowReference {
    fn drop(&mut self) {
        if let Some(path) = self.model.signals().references().unregister(self.id) {
            unref_path(self.model.as_ref(), &path, path.depth());
        }
    }
}

impl fmt::Debug for RowReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowReference")
            .field("path", &self.path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TreeStore, ValueType};

    fn store_with_rows(n: usize) -> Arc<TreeStore> {
        let store = Arc::new(TreeStore::new(&[ValueType::Int]));
        for i in 0..n {
            let row = store.append(None).unwrap();
            store.set_value(&row, 0, (i as i64).into()).unwrap();
        }
        store
    }

    #[test]
    fn test_invalid_path_returns_none() {
        let store = store_with_rows(2);
        assert!(RowReference::new(store.clone(), &TreePath::from([5])).is_none());
        assert!(RowReference::new(store, &TreePath::new()).is_none());
    }

    #[test]
    fn test_follows_insertions_and_deletions() {
        let store = store_with_rows(3);
        let reference = RowReference::new(store.clone(), &TreePath::from([1])).unwrap();

        store.insert(None, 0).unwrap();
        assert_eq!(reference.path(), Some(TreePath::from([2])));

        // Inserting after the row leaves it alone.
        store.append(None).unwrap();
        assert_eq!(reference.path(), Some(TreePath::from([2])));

        let first = store.iter_first().unwrap();
        store.remove(&first).unwrap();
        assert_eq!(reference.path(), Some(TreePath::from([1])));

        let row = store.iter(&TreePath::from([1])).unwrap();
        assert_eq!(store.value(&row, 0).as_int(), Some(1));
    }

    #[test]
    fn test_deleting_ancestor_invalidates() {
        let store = store_with_rows(2);
        let parent = store.iter(&TreePath::from([1])).unwrap();
        store.append(Some(&parent)).unwrap();
        store.append(Some(&parent)).unwrap();

        let reference = RowReference::new(store.clone(), &TreePath::from([1, 1])).unwrap();
        let copy = reference.copy().unwrap();

        store.remove(&parent).unwrap();
        assert!(!reference.valid());
        assert!(!copy.valid());
        assert_eq!(reference.path(), None);
    }

    #[test]
    fn test_follows_reorder() {
        let store = store_with_rows(3);
        let reference = RowReference::new(store.clone(), &TreePath::from([0])).unwrap();

        store.reorder(None, &[2, 0, 1]).unwrap();
        assert_eq!(reference.path(), Some(TreePath::from([1])));
    }
}
