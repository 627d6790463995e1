//! Mutable hierarchical backing store.
//!
//! `TreeStore` holds rows with a fixed column schema in a tree of arbitrary
//! depth. It is the usual bottom layer under filter and sort proxies.

use std::fmt;

use parking_lot::RwLock;
use slotmap::{Key, SlotMap, new_key_type};

use horizon_arbor_core::logging::targets;

use super::iter::{TreeIter, next_stamp};
use super::path::TreePath;
use super::traits::{ModelFlags, ModelSignals, TreeModel};
use super::value::{Value, ValueType};
use crate::error::{Error, Result};

new_key_type! {
    /// Identity of a stored row. Stable for as long as the row exists.
    pub(crate) struct NodeId;
}

/// A row in the tree structure.
struct TreeNode {
    values: Vec<Value>,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
}

/// Internal storage for tree nodes.
struct TreeStorage {
    column_types: Vec<ValueType>,
    nodes: SlotMap<NodeId, TreeNode>,
    root_children: Vec<NodeId>,
}

impl TreeStorage {
    fn new(column_types: &[ValueType]) -> Self {
        Self {
            column_types: column_types.to_vec(),
            nodes: SlotMap::with_key(),
            root_children: Vec::new(),
        }
    }

    fn children_of(&self, parent: Option<NodeId>) -> &[NodeId] {
        match parent {
            None => &self.root_children,
            Some(id) => self
                .nodes
                .get(id)
                .map(|n| n.children.as_slice())
                .unwrap_or(&[]),
        }
    }

    fn children_of_mut(&mut self, parent: Option<NodeId>) -> Option<&mut Vec<NodeId>> {
        match parent {
            None => Some(&mut self.root_children),
            Some(id) => self.nodes.get_mut(id).map(|n| &mut n.children),
        }
    }

    fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|n| n.parent)
    }

    fn row_of(&self, id: NodeId) -> Option<usize> {
        self.children_of(self.parent_of(id))
            .iter()
            .position(|&child| child == id)
    }

    fn path_of(&self, id: NodeId) -> Option<TreePath> {
        let mut indices = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current {
            indices.push(self.row_of(node)?);
            current = self.parent_of(node);
        }
        indices.reverse();
        Some(TreePath::from(indices))
    }

    fn node_at(&self, path: &TreePath) -> Option<NodeId> {
        let mut parent = None;
        for &index in path.indices() {
            parent = Some(*self.children_of(parent).get(index)?);
        }
        parent
    }

    fn remove_subtree(&mut self, id: NodeId) {
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            if let Some(node) = self.nodes.remove(next) {
                pending.extend(node.children);
            }
        }
    }

    fn check_values(&self, values: &[(usize, Value)]) -> Result<()> {
        for (column, value) in values {
            let ty = *self
                .column_types
                .get(*column)
                .ok_or_else(|| Error::invalid_column(*column, self.column_types.len()))?;
            if let Some(actual) = value.value_type() {
                if actual != ty {
                    return Err(Error::type_mismatch(*column, ty, actual));
                }
            }
        }
        Ok(())
    }
}

/// Where a new row goes among its siblings.
enum Slot {
    Index(usize),
    Before(NodeId),
    After(NodeId),
}

/// A mutable tree of rows with a fixed column schema.
///
/// All mutation goes through `&self`; change notifications are emitted
/// after the internal lock has been released, so handlers may query the
/// store freely. Iterators stay valid for as long as their row exists.
///
/// # Signals
///
/// - insertion: `row_inserted`, then `row_has_child_toggled` on the parent
///   if it gained its first child
/// - value change: `row_changed`
/// - removal: `row_deleted`, then `row_has_child_toggled` on the parent if
///   it lost its last child
/// - `swap`/`move_*`/`reorder`: `rows_reordered`
///
/// # Example
///
/// ```
/// use horizon_arbor::model::{TreeModel, TreeStore, ValueType};
///
/// let store = TreeStore::new(&[ValueType::String, ValueType::Bool]);
/// let parent = store.append(None).unwrap();
/// store.set(&parent, &[(0, "Documents".into()), (1, true.into())]).unwrap();
///
/// let child = store
///     .insert_with_values(Some(&parent), 0, &[(0, "notes.txt".into())])
///     .unwrap();
/// assert_eq!(store.iter_depth(&child), 1);
/// assert!(store.iter_has_child(&parent));
/// ```
pub struct TreeStore {
    storage: RwLock<TreeStorage>,
    stamp: u64,
    signals: ModelSignals,
}

impl TreeStore {
    /// Creates an empty store with the given column types.
    pub fn new(column_types: &[ValueType]) -> Self {
        Self {
            storage: RwLock::new(TreeStorage::new(column_types)),
            stamp: next_stamp(),
            signals: ModelSignals::new(),
        }
    }

    /// The column schema.
    pub fn column_types(&self) -> Vec<ValueType> {
        self.storage.read().column_types.clone()
    }

    fn iter_for(&self, id: NodeId) -> TreeIter {
        TreeIter::new(self.stamp, 0, id.data().as_ffi())
    }

    /// Decodes an iterator, rejecting stale and foreign ones.
    fn node_of(&self, storage: &TreeStorage, iter: &TreeIter) -> Option<NodeId> {
        if iter.stamp() != self.stamp {
            tracing::warn!(target: targets::STORE, "iterator from another model");
            return None;
        }
        let id: NodeId = iter.node_key();
        storage.nodes.contains_key(id).then_some(id)
    }

    fn parent_of_iter(&self, storage: &TreeStorage, parent: Option<&TreeIter>) -> Result<Option<NodeId>> {
        match parent {
            None => Ok(None),
            Some(iter) => self.node_of(storage, iter).map(Some).ok_or(Error::InvalidIter),
        }
    }

    // -------------------------------------------------------------------------
    // Insertion
    // -------------------------------------------------------------------------

    /// Inserts an empty row as child `position` of `parent`.
    ///
    /// A `position` past the end appends.
    pub fn insert(&self, parent: Option<&TreeIter>, position: usize) -> Result<TreeIter> {
        let parent = self.parent_of_iter(&self.storage.read(), parent)?;
        self.insert_row(parent, Slot::Index(position), Vec::new())
    }

    /// Appends an empty row to the children of `parent`.
    pub fn append(&self, parent: Option<&TreeIter>) -> Result<TreeIter> {
        self.insert(parent, usize::MAX)
    }

    /// Prepends an empty row to the children of `parent`.
    pub fn prepend(&self, parent: Option<&TreeIter>) -> Result<TreeIter> {
        self.insert(parent, 0)
    }

    /// Inserts an empty row before `sibling`, or appends to `parent` if
    /// `sibling` is `None`.
    pub fn insert_before(&self, parent: Option<&TreeIter>, sibling: Option<&TreeIter>) -> Result<TreeIter> {
        match sibling {
            None => self.append(parent),
            Some(sibling) => {
                let sibling = self.sibling_under(parent, sibling)?;
                self.insert_row(None, Slot::Before(sibling), Vec::new())
            }
        }
    }

    /// Inserts an empty row after `sibling`, or prepends to `parent` if
    /// `sibling` is `None`.
    pub fn insert_after(&self, parent: Option<&TreeIter>, sibling: Option<&TreeIter>) -> Result<TreeIter> {
        match sibling {
            None => self.prepend(parent),
            Some(sibling) => {
                let sibling = self.sibling_under(parent, sibling)?;
                self.insert_row(None, Slot::After(sibling), Vec::new())
            }
        }
    }

    /// Inserts a row with its values already set.
    ///
    /// Emits a single `row_inserted` and no `row_changed`.
    pub fn insert_with_values(
        &self,
        parent: Option<&TreeIter>,
        position: usize,
        values: &[(usize, Value)],
    ) -> Result<TreeIter> {
        let parent = {
            let storage = self.storage.read();
            storage.check_values(values)?;
            self.parent_of_iter(&storage, parent)?
        };
        self.insert_row(parent, Slot::Index(position), values.to_vec())
    }

    fn sibling_under(&self, parent: Option<&TreeIter>, sibling: &TreeIter) -> Result<NodeId> {
        let storage = self.storage.read();
        let sibling = self.node_of(&storage, sibling).ok_or(Error::InvalidIter)?;
        if let Some(parent) = parent {
            let parent = self.node_of(&storage, parent).ok_or(Error::InvalidIter)?;
            if storage.parent_of(sibling) != Some(parent) {
                return Err(Error::InvalidIter);
            }
        }
        Ok(sibling)
    }

    fn insert_row(&self, parent: Option<NodeId>, slot: Slot, values: Vec<(usize, Value)>) -> Result<TreeIter> {
        let (id, path, toggled_parent) = {
            let mut storage = self.storage.write();
            let (parent, index) = match slot {
                Slot::Index(position) => {
                    let len = storage.children_of(parent).len();
                    (parent, position.min(len))
                }
                Slot::Before(sibling) | Slot::After(sibling) => {
                    let parent = storage.parent_of(sibling);
                    let row = storage.row_of(sibling).ok_or(Error::InvalidIter)?;
                    let index = if matches!(slot, Slot::After(_)) { row + 1 } else { row };
                    (parent, index)
                }
            };

            let mut row_values = vec![Value::None; storage.column_types.len()];
            for (column, value) in values {
                row_values[column] = value;
            }

            let id = storage.nodes.insert(TreeNode {
                values: row_values,
                children: Vec::new(),
                parent,
            });
            let siblings = storage.children_of_mut(parent).ok_or(Error::InvalidIter)?;
            siblings.insert(index, id);
            let first_child = siblings.len() == 1;

            let path = storage.path_of(id).ok_or(Error::InvalidIter)?;
            let toggled_parent = match parent {
                Some(parent) if first_child => Some((storage.path_of(parent).ok_or(Error::InvalidIter)?, parent)),
                _ => None,
            };
            (id, path, toggled_parent)
        };

        tracing::trace!(target: targets::STORE, %path, "row inserted");
        let iter = self.iter_for(id);
        self.signals.emit_row_inserted(path, iter);
        if let Some((parent_path, parent)) = toggled_parent {
            self.signals
                .emit_row_has_child_toggled(parent_path, self.iter_for(parent));
        }
        Ok(iter)
    }

    // -------------------------------------------------------------------------
    // Values
    // -------------------------------------------------------------------------

    /// Sets one cell and emits `row_changed`.
    pub fn set_value(&self, iter: &TreeIter, column: usize, value: Value) -> Result<()> {
        self.set(iter, &[(column, value)])
    }

    /// Sets several cells of one row and emits a single `row_changed`.
    pub fn set(&self, iter: &TreeIter, values: &[(usize, Value)]) -> Result<()> {
        let path = {
            let mut storage = self.storage.write();
            let id = self.node_of(&storage, iter).ok_or(Error::InvalidIter)?;
            storage.check_values(values)?;
            let path = storage.path_of(id).ok_or(Error::InvalidIter)?;
            let node = storage.nodes.get_mut(id).ok_or(Error::InvalidIter)?;
            for (column, value) in values {
                node.values[*column] = value.clone();
            }
            path
        };
        self.signals.emit_row_changed(path, *iter);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Removal
    // -------------------------------------------------------------------------

    /// Removes a row and all its descendants.
    ///
    /// Returns the row that now occupies the removed row's position, if any.
    pub fn remove(&self, iter: &TreeIter) -> Result<Option<TreeIter>> {
        let (path, next, toggled_parent) = {
            let mut storage = self.storage.write();
            let id = self.node_of(&storage, iter).ok_or(Error::InvalidIter)?;
            let path = storage.path_of(id).ok_or(Error::InvalidIter)?;
            let parent = storage.parent_of(id);
            let row = path.last().ok_or(Error::InvalidIter)?;

            let siblings = storage.children_of_mut(parent).ok_or(Error::InvalidIter)?;
            siblings.remove(row);
            let next = siblings.get(row).copied();
            let now_empty = siblings.is_empty();
            storage.remove_subtree(id);

            let toggled_parent = match parent {
                Some(parent) if now_empty => Some((path.parent(), parent)),
                _ => None,
            };
            (path, next, toggled_parent)
        };

        tracing::trace!(target: targets::STORE, %path, "row removed");
        self.signals.emit_row_deleted(path);
        if let Some((parent_path, parent)) = toggled_parent {
            self.signals
                .emit_row_has_child_toggled(parent_path, self.iter_for(parent));
        }
        Ok(next.map(|id| self.iter_for(id)))
    }

    /// Removes every row, one root row at a time.
    pub fn clear(&self) {
        while let Some(first) = self.iter_first() {
            if self.remove(&first).is_err() {
                break;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reordering
    // -------------------------------------------------------------------------

    /// Permutes the children of `parent` so that new position `i` holds the
    /// row previously at `new_order[i]`.
    pub fn reorder(&self, parent: Option<&TreeIter>, new_order: &[usize]) -> Result<()> {
        let parent = self.parent_of_iter(&self.storage.read(), parent)?;
        let old = self.storage.read().children_of(parent).to_vec();
        if new_order.len() != old.len() {
            return Err(Error::invalid_reorder(format!(
                "expected {} positions, got {}",
                old.len(),
                new_order.len()
            )));
        }
        let mut seen = vec![false; old.len()];
        for &o in new_order {
            if o >= old.len() || std::mem::replace(&mut seen[o], true) {
                return Err(Error::invalid_reorder(format!("position {} is invalid or repeated", o)));
            }
        }
        let children = new_order.iter().map(|&o| old[o]).collect();
        self.apply_order(parent, children)
    }

    /// Exchanges two rows with the same parent.
    pub fn swap(&self, a: &TreeIter, b: &TreeIter) -> Result<()> {
        let (parent, children) = {
            let storage = self.storage.read();
            let a = self.node_of(&storage, a).ok_or(Error::InvalidIter)?;
            let b = self.node_of(&storage, b).ok_or(Error::InvalidIter)?;
            let parent = storage.parent_of(a);
            if parent != storage.parent_of(b) {
                return Err(Error::invalid_reorder("rows have different parents"));
            }
            let mut children = storage.children_of(parent).to_vec();
            let ia = storage.row_of(a).ok_or(Error::InvalidIter)?;
            let ib = storage.row_of(b).ok_or(Error::InvalidIter)?;
            children.swap(ia, ib);
            (parent, children)
        };
        self.apply_order(parent, children)
    }

    /// Moves `iter` in front of `position`, or to the end if `position` is
    /// `None`.
    pub fn move_before(&self, iter: &TreeIter, position: Option<&TreeIter>) -> Result<()> {
        self.move_row(iter, position, false)
    }

    /// Moves `iter` behind `position`, or to the start if `position` is
    /// `None`.
    pub fn move_after(&self, iter: &TreeIter, position: Option<&TreeIter>) -> Result<()> {
        self.move_row(iter, position, true)
    }

    fn move_row(&self, iter: &TreeIter, position: Option<&TreeIter>, after: bool) -> Result<()> {
        let (parent, children) = {
            let storage = self.storage.read();
            let id = self.node_of(&storage, iter).ok_or(Error::InvalidIter)?;
            let parent = storage.parent_of(id);
            let mut children = storage.children_of(parent).to_vec();
            children.retain(|&child| child != id);

            let index = match position {
                None if after => 0,
                None => children.len(),
                Some(position) => {
                    let target = self.node_of(&storage, position).ok_or(Error::InvalidIter)?;
                    if storage.parent_of(target) != parent {
                        return Err(Error::invalid_reorder("rows have different parents"));
                    }
                    let at = children
                        .iter()
                        .position(|&child| child == target)
                        .unwrap_or(children.len());
                    if after { at + 1 } else { at }
                }
            };
            children.insert(index.min(children.len()), id);
            (parent, children)
        };
        self.apply_order(parent, children)
    }

    /// Installs a new child order and emits `rows_reordered` if it changed.
    fn apply_order(&self, parent: Option<NodeId>, children: Vec<NodeId>) -> Result<()> {
        let (path, new_order) = {
            let mut storage = self.storage.write();
            let old = storage.children_of(parent).to_vec();
            let new_order: Vec<usize> = children
                .iter()
                .map(|id| old.iter().position(|o| o == id).ok_or(Error::InvalidIter))
                .collect::<Result<_>>()?;
            if new_order.iter().enumerate().all(|(i, &o)| i == o) {
                return Ok(());
            }
            let path = match parent {
                Some(parent) => storage.path_of(parent).ok_or(Error::InvalidIter)?,
                None => TreePath::new(),
            };
            *storage.children_of_mut(parent).ok_or(Error::InvalidIter)? = children;
            (path, new_order)
        };
        self.signals
            .emit_rows_reordered(path, parent.map(|p| self.iter_for(p)), new_order);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Returns `true` if `iter` is a strict ancestor of `descendant`.
    pub fn is_ancestor(&self, iter: &TreeIter, descendant: &TreeIter) -> bool {
        let storage = self.storage.read();
        let (Some(ancestor), Some(mut current)) =
            (self.node_of(&storage, iter), self.node_of(&storage, descendant))
        else {
            return false;
        };
        while let Some(parent) = storage.parent_of(current) {
            if parent == ancestor {
                return true;
            }
            current = parent;
        }
        false
    }

    /// Depth of the row; root rows have depth 0.
    pub fn iter_depth(&self, iter: &TreeIter) -> usize {
        let storage = self.storage.read();
        let mut depth = 0;
        let mut current = self.node_of(&storage, iter);
        while let Some(parent) = current.and_then(|id| storage.parent_of(id)) {
            depth += 1;
            current = Some(parent);
        }
        depth
    }

    /// Returns `true` if `iter` belongs to this store and its row still exists.
    pub fn iter_is_valid(&self, iter: &TreeIter) -> bool {
        iter.stamp() == self.stamp && self.storage.read().nodes.contains_key(iter.node_key::<NodeId>())
    }
}

impl fmt::Debug for TreeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let storage = self.storage.read();
        f.debug_struct("TreeStore")
            .field("column_types", &storage.column_types)
            .field("rows", &storage.nodes.len())
            .finish()
    }
}

impl TreeModel for TreeStore {
    fn flags(&self) -> ModelFlags {
        ModelFlags::new().with_iters_persist(true)
    }

    fn n_columns(&self) -> usize {
        self.storage.read().column_types.len()
    }

    fn column_type(&self, column: usize) -> Option<ValueType> {
        self.storage.read().column_types.get(column).copied()
    }

    fn iter(&self, path: &TreePath) -> Option<TreeIter> {
        if path.is_empty() {
            return None;
        }
        let id = self.storage.read().node_at(path)?;
        Some(self.iter_for(id))
    }

    fn path(&self, iter: &TreeIter) -> Option<TreePath> {
        let storage = self.storage.read();
        let id = self.node_of(&storage, iter)?;
        storage.path_of(id)
    }

    fn value(&self, iter: &TreeIter, column: usize) -> Value {
        let storage = self.storage.read();
        self.node_of(&storage, iter)
            .and_then(|id| storage.nodes.get(id))
            .and_then(|node| node.values.get(column).cloned())
            .unwrap_or_default()
    }

    fn iter_next(&self, iter: &TreeIter) -> Option<TreeIter> {
        let storage = self.storage.read();
        let id = self.node_of(&storage, iter)?;
        let row = storage.row_of(id)?;
        let next = *storage.children_of(storage.parent_of(id)).get(row + 1)?;
        Some(self.iter_for(next))
    }

    fn iter_previous(&self, iter: &TreeIter) -> Option<TreeIter> {
        let storage = self.storage.read();
        let id = self.node_of(&storage, iter)?;
        let row = storage.row_of(id)?.checked_sub(1)?;
        let previous = *storage.children_of(storage.parent_of(id)).get(row)?;
        Some(self.iter_for(previous))
    }

    fn iter_children(&self, parent: Option<&TreeIter>) -> Option<TreeIter> {
        self.iter_nth_child(parent, 0)
    }

    fn iter_has_child(&self, iter: &TreeIter) -> bool {
        self.iter_n_children(Some(iter)) > 0
    }

    fn iter_n_children(&self, parent: Option<&TreeIter>) -> usize {
        let storage = self.storage.read();
        match parent {
            None => storage.root_children.len(),
            Some(iter) => self
                .node_of(&storage, iter)
                .map_or(0, |id| storage.children_of(Some(id)).len()),
        }
    }

    fn iter_nth_child(&self, parent: Option<&TreeIter>, n: usize) -> Option<TreeIter> {
        let storage = self.storage.read();
        let parent = match parent {
            None => None,
            Some(iter) => Some(self.node_of(&storage, iter)?),
        };
        let child = *storage.children_of(parent).get(n)?;
        Some(self.iter_for(child))
    }

    fn iter_parent(&self, child: &TreeIter) -> Option<TreeIter> {
        let storage = self.storage.read();
        let id = self.node_of(&storage, child)?;
        storage.parent_of(id).map(|parent| self.iter_for(parent))
    }

    fn signals(&self) -> &ModelSignals {
        &self.signals
    }
}

static_assertions::assert_impl_all!(TreeStore: Send, Sync);
