//! Core trait and signal types for tree models.

use horizon_arbor_core::Signal;

use super::iter::TreeIter;
use super::path::TreePath;
use super::row_reference::RowReferenceList;
use super::value::{Value, ValueType};

/// Capabilities a model advertises to its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ModelFlags {
    /// Iterators stay valid across changes for as long as their row exists.
    pub iters_persist: bool,
    /// No row has children.
    pub list_only: bool,
}

impl ModelFlags {
    /// Creates flags with every capability unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the persistent iterators flag.
    pub fn with_iters_persist(mut self, persist: bool) -> Self {
        self.iters_persist = persist;
        self
    }

    /// Sets the list only flag.
    pub fn with_list_only(mut self, list_only: bool) -> Self {
        self.list_only = list_only;
        self
    }
}

/// The interface shared by backing stores and proxy models.
///
/// `TreeModel` exposes a hierarchy of rows, each holding one [`Value`] per
/// column. Rows are addressed by [`TreePath`] (position) or [`TreeIter`]
/// (a model-specific handle). Filter and sort proxies both consume and
/// implement this trait, so they stack in any order.
///
/// # Reference Counting
///
/// Consumers that display rows call [`ref_node`](TreeModel::ref_node) for
/// every row they keep on screen and [`unref_node`](TreeModel::unref_node)
/// when they let go of it. Plain stores may ignore these calls; proxy
/// models use them to decide which parts of their cache to keep.
///
/// # Change Notification
///
/// Models announce changes through [`ModelSignals`]. Implementations must
/// emit after their own state is consistent and without holding internal
/// locks, since handlers commonly call back into the model.
///
/// # Example
///
/// ```
/// use horizon_arbor::model::{TreeModel, TreeStore, ValueType};
///
/// let store = TreeStore::new(&[ValueType::String]);
/// let row = store.append(None).unwrap();
/// store.set_value(&row, 0, "hello".into()).unwrap();
///
/// let first = store.iter_first().unwrap();
/// assert_eq!(store.value(&first, 0).as_str(), Some("hello"));
/// ```
pub trait TreeModel: Send + Sync {
    /// Returns the capabilities of this model.
    fn flags(&self) -> ModelFlags {
        ModelFlags::default()
    }

    /// Number of columns per row.
    fn n_columns(&self) -> usize;

    /// Declared type of `column`, or `None` if it is out of range.
    fn column_type(&self, column: usize) -> Option<ValueType>;

    /// Resolves a path to an iterator.
    fn iter(&self, path: &TreePath) -> Option<TreeIter>;

    /// Returns the path of the row at `iter`.
    fn path(&self, iter: &TreeIter) -> Option<TreePath>;

    /// Returns the value stored in `column` of the row at `iter`.
    ///
    /// Returns [`Value::None`] for invalid iterators or columns.
    fn value(&self, iter: &TreeIter, column: usize) -> Value;

    /// Returns the next sibling.
    fn iter_next(&self, iter: &TreeIter) -> Option<TreeIter>;

    /// Returns the previous sibling.
    fn iter_previous(&self, iter: &TreeIter) -> Option<TreeIter> {
        let mut path = self.path(iter)?;
        if !path.prev() {
            return None;
        }
        self.iter(&path)
    }

    /// Returns the first child of `parent`, or the first root row.
    fn iter_children(&self, parent: Option<&TreeIter>) -> Option<TreeIter>;

    /// Returns `true` if the row has at least one child.
    fn iter_has_child(&self, iter: &TreeIter) -> bool;

    /// Number of children of `parent`, or of root rows.
    fn iter_n_children(&self, parent: Option<&TreeIter>) -> usize;

    /// Returns the `n`th child of `parent`, or the `n`th root row.
    fn iter_nth_child(&self, parent: Option<&TreeIter>, n: usize) -> Option<TreeIter>;

    /// Returns the parent row.
    fn iter_parent(&self, child: &TreeIter) -> Option<TreeIter>;

    /// Asks the model to keep the row at `iter` cached.
    fn ref_node(&self, _iter: &TreeIter) {}

    /// Releases a reference taken with [`ref_node`](TreeModel::ref_node).
    fn unref_node(&self, _iter: &TreeIter) {}

    /// Returns the signals for this model.
    fn signals(&self) -> &ModelSignals;

    // -------------------------------------------------------------------------
    // Convenience methods
    // -------------------------------------------------------------------------

    /// Returns the first root row.
    fn iter_first(&self) -> Option<TreeIter> {
        self.iter_children(None)
    }

    /// Visits every row depth-first in pre-order.
    ///
    /// The walk stops as soon as `func` returns `true`.
    fn foreach(&self, func: &mut dyn FnMut(&TreePath, &TreeIter) -> bool) {
        let mut path = TreePath::first();
        let mut current = self.iter_children(None);
        let mut parents: Vec<TreeIter> = Vec::new();

        loop {
            let Some(iter) = current else {
                let Some(parent) = parents.pop() else {
                    return;
                };
                path.up();
                path.next();
                current = self.iter_next(&parent);
                continue;
            };

            if func(&path, &iter) {
                return;
            }

            if let Some(child) = self.iter_children(Some(&iter)) {
                parents.push(iter);
                path.down();
                current = Some(child);
            } else {
                path.next();
                current = self.iter_next(&iter);
            }
        }
    }
}

/// Collection of signals emitted by tree models.
///
/// Consumers connect to the public signals. Models emit through the
/// `emit_*` helpers, which also keep live [`RowReference`](super::RowReference)s
/// pointing at their rows before any slot runs.
///
/// Paths are always expressed in the emitting model's coordinates. For
/// `rows_reordered`, `new_order[new_position] == old_position`.
pub struct ModelSignals {
    /// Emitted after a row's values changed.
    /// Args: (path, iter)
    pub row_changed: Signal<(TreePath, TreeIter)>,

    /// Emitted after a row was inserted.
    /// Args: (path, iter)
    pub row_inserted: Signal<(TreePath, TreeIter)>,

    /// Emitted when a row gains its first child or loses its last one.
    /// Args: (path, iter)
    pub row_has_child_toggled: Signal<(TreePath, TreeIter)>,

    /// Emitted after a row was removed. The path is where the row used to be.
    pub row_deleted: Signal<TreePath>,

    /// Emitted after the children of a row were permuted.
    /// Args: (parent path, parent iter or `None` for the root, new order)
    pub rows_reordered: Signal<(TreePath, Option<TreeIter>, Vec<usize>)>,

    references: RowReferenceList,
}

impl Default for ModelSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModelSignals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSignals")
            .field("row_changed", &self.row_changed)
            .field("row_inserted", &self.row_inserted)
            .field("row_has_child_toggled", &self.row_has_child_toggled)
            .field("row_deleted", &self.row_deleted)
            .field("rows_reordered", &self.rows_reordered)
            .finish_non_exhaustive()
    }
}

impl ModelSignals {
    /// Creates a new set of model signals.
    pub fn new() -> Self {
        Self {
            row_changed: Signal::new(),
            row_inserted: Signal::new(),
            row_has_child_toggled: Signal::new(),
            row_deleted: Signal::new(),
            rows_reordered: Signal::new(),
            references: RowReferenceList::default(),
        }
    }

    /// Emits `row_changed`.
    pub fn emit_row_changed(&self, path: TreePath, iter: TreeIter) {
        self.row_changed.emit((path, iter));
    }

    /// Shifts row references, then emits `row_inserted`.
    pub fn emit_row_inserted(&self, path: TreePath, iter: TreeIter) {
        self.references.row_inserted(&path);
        self.row_inserted.emit((path, iter));
    }

    /// Emits `row_has_child_toggled`.
    pub fn emit_row_has_child_toggled(&self, path: TreePath, iter: TreeIter) {
        self.row_has_child_toggled.emit((path, iter));
    }

    /// Invalidates or shifts row references, then emits `row_deleted`.
    pub fn emit_row_deleted(&self, path: TreePath) {
        self.references.row_deleted(&path);
        self.row_deleted.emit(path);
    }

    /// Remaps row references, then emits `rows_reordered`.
    pub fn emit_rows_reordered(&self, path: TreePath, iter: Option<TreeIter>, new_order: Vec<usize>) {
        self.references.rows_reordered(&path, &new_order);
        self.rows_reordered.emit((path, iter, new_order));
    }

    pub(crate) fn references(&self) -> &RowReferenceList {
        &self.references
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_model_flags() {
        let flags = ModelFlags::new();
        assert!(!flags.iters_persist);
        assert!(!flags.list_only);

        let flags = flags.with_iters_persist(true);
        assert!(flags.iters_persist);
    }

    #[test]
    fn test_model_signals_creation() {
        let signals = ModelSignals::new();
        assert_eq!(signals.row_inserted.connection_count(), 0);
        assert_eq!(signals.rows_reordered.connection_count(), 0);
    }

    #[test]
    fn test_emit_helpers_reach_slots() {
        let signals = ModelSignals::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let recv = received.clone();
        signals.row_inserted.connect(move |(path, _)| {
            recv.lock().push(format!("inserted {}", path));
        });
        let recv = received.clone();
        signals.row_deleted.connect(move |path| {
            recv.lock().push(format!("deleted {}", path));
        });
        let recv = received.clone();
        signals.rows_reordered.connect(move |(path, _, order)| {
            recv.lock().push(format!("reordered '{}' {:?}", path, order));
        });

        let iter = TreeIter::new(1, 0, 0);
        signals.emit_row_inserted(TreePath::from([0]), iter);
        signals.emit_row_deleted(TreePath::from([1, 2]));
        signals.emit_rows_reordered(TreePath::new(), None, vec![1, 0]);

        assert_eq!(
            *received.lock(),
            vec!["inserted 0", "deleted 1:2", "reordered '' [1, 0]"]
        );
    }
}
