//! A proxy that presents a child model's rows in sorted order.
//!
//! [`TreeModelSort`] keeps every row of its child but orders each level by a
//! comparison: a per-column callback, a default callback, or the natural
//! order of a column's [`Value`]s. Without a comparison, rows keep the
//! child's order.
//!
//! Sorting never changes which rows exist, so consumers see row insertions
//! at their sorted position and value changes as a `rows_reordered` followed
//! by `row_changed` at the row's new position.
//!
//! Comparison callbacks run while the proxy's cache is locked. They may read
//! the child model they are given but must not call back into the proxy.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use horizon_arbor_core::Signal;
use horizon_arbor_core::logging::{PerfSpan, TreeFormatOptions, span_names, targets};

use crate::error::{Error, Result};

use super::cache::{Cache, ChildConnections, ChildListener, EltId, LevelId, Retention};
use super::iter::TreeIter;
use super::path::TreePath;
use super::traits::{ModelFlags, ModelSignals, TreeModel};
use super::value::{Value, ValueType, compare_values};

/// Compares two child rows.
pub type SortFunc = Arc<dyn Fn(&dyn TreeModel, &TreeIter, &TreeIter) -> Ordering + Send + Sync>;

/// What a [`TreeModelSort`] sorts by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortColumn {
    /// The default sort function, or the child's order if none is set.
    #[default]
    Default,
    /// The child's order.
    Unsorted,
    /// A column, compared with its sort function if one is set and by
    /// value otherwise.
    Column(usize),
}

/// Direction of a sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

enum Comparator {
    Func(SortFunc),
    Column(usize),
}

/// An elt paired with the child row it mirrors.
type Keyed = (EltId, Option<TreeIter>);

struct SortState {
    cache: Cache,
    column: SortColumn,
    order: SortOrder,
    funcs: HashMap<usize, SortFunc>,
    default_func: Option<SortFunc>,
}

impl SortState {
    /// The active comparison, or `None` when rows follow the child's order.
    fn comparator(&self) -> Option<Comparator> {
        match self.column {
            SortColumn::Unsorted => None,
            SortColumn::Default => self.default_func.clone().map(Comparator::Func),
            SortColumn::Column(column) => Some(
                self.funcs
                    .get(&column)
                    .cloned()
                    .map_or(Comparator::Column(column), Comparator::Func),
            ),
        }
    }

    fn keyed(&self, elt: EltId) -> Keyed {
        (elt, self.cache.child_iter(elt))
    }

    fn compare(&self, comparator: &Comparator, a: &Keyed, b: &Keyed) -> Ordering {
        let (Some(a), Some(b)) = (&a.1, &b.1) else {
            return Ordering::Equal;
        };
        let child = self.cache.child();
        let ordering = match comparator {
            Comparator::Func(func) => func(child.as_ref(), a, b),
            Comparator::Column(column) => {
                compare_values(&child.value(a, *column), &child.value(b, *column))
            }
        };
        match self.order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    }

    /// `elts` in the order the current comparison puts them. Stable.
    fn sorted(&self, elts: &[EltId]) -> Vec<EltId> {
        match self.comparator() {
            None => {
                let mut sorted = elts.to_vec();
                sorted.sort_by_key(|&id| self.cache.elts[id].offset);
                sorted
            }
            Some(comparator) => {
                let mut keyed: Vec<Keyed> = elts.iter().map(|&id| self.keyed(id)).collect();
                keyed.sort_by(|a, b| self.compare(&comparator, a, b));
                keyed.into_iter().map(|(id, _)| id).collect()
            }
        }
    }

    /// Index at which `elt` belongs among `others`, after any equal rows.
    fn insertion_index(&self, others: &[EltId], elt: EltId) -> usize {
        match self.comparator() {
            None => {
                let offset = self.cache.elts[elt].offset;
                others.partition_point(|&id| self.cache.elts[id].offset < offset)
            }
            Some(comparator) => {
                let key = self.keyed(elt);
                others.partition_point(|&id| {
                    self.compare(&comparator, &self.keyed(id), &key) != Ordering::Greater
                })
            }
        }
    }

    /// Mirrors the children of `parent`, or the root rows.
    fn build_level(&mut self, parent: Option<EltId>) -> Option<LevelId> {
        let parent_iter = match parent {
            Some(elt) => Some(self.cache.child_iter(elt)?),
            None => self.cache.root_parent_iter()?,
        };
        let rows = self.cache.child().iter_n_children(parent_iter.as_ref());
        if rows == 0 {
            return None;
        }

        if let Some(parent) = parent {
            self.cache.ref_elt(parent, false);
        }
        let level = self.cache.new_level(parent);
        for offset in 0..rows {
            self.cache.push_elt(level, offset, true);
        }
        let sorted = self.sorted(&self.cache.levels[level].elts);
        self.cache.levels[level].elts = sorted;

        let first = self.cache.levels[level].elts[0];
        self.cache.ref_elt(first, false);
        tracing::trace!(target: targets::SORT, rows, "level built");
        Some(level)
    }

    fn root_level(&mut self) -> Option<LevelId> {
        match self.cache.root {
            Some(root) => Some(root),
            None => self.build_level(None),
        }
    }

    fn children_of(&mut self, elt: EltId) -> Option<LevelId> {
        match self.cache.elts[elt].children {
            Some(level) => Some(level),
            None => self.build_level(Some(elt)),
        }
    }

    /// Finds the elt mirroring `child_path`, optionally building levels.
    fn locate(&mut self, child_path: &TreePath, build_levels: bool) -> Option<EltId> {
        let mut level = if build_levels {
            self.root_level()
        } else {
            self.cache.root
        };
        let (&last, ancestors) = child_path.indices().split_last()?;
        for &offset in ancestors {
            let elt = self.cache.find_offset(level?, offset)?;
            level = if build_levels {
                self.children_of(elt)
            } else {
                self.cache.elts[elt].children
            };
        }
        self.cache.find_offset(level?, last)
    }

    /// Resolves a proxy path, building levels along the way.
    fn walk(&mut self, path: &TreePath) -> Option<EltId> {
        let (&last, ancestors) = path.indices().split_last()?;
        let mut level = self.root_level()?;
        for &index in ancestors {
            let elt = *self.cache.levels[level].elts.get(index)?;
            level = self.children_of(elt)?;
        }
        self.cache.levels[level].elts.get(last).copied()
    }

    /// Re-sorts one level. Returns the permutation if anything moved.
    fn sort_level(&mut self, level: LevelId) -> Option<Vec<usize>> {
        let before = self.cache.levels[level].elts.clone();
        if before.len() < 2 {
            return None;
        }
        let after = self.sorted(&before);
        if after == before {
            return None;
        }
        let new_order = permutation(&before, &after);
        let (old_first, new_first) = (before[0], after[0]);
        self.cache.levels[level].elts = after;
        self.cache.transfer_first_ref(old_first, new_first);
        Some(new_order)
    }

    /// Path and iterator of the row owning `level`, as `rows_reordered` wants them.
    fn parent_payload(&self, level: LevelId) -> Option<(TreePath, Option<TreeIter>)> {
        match self.cache.levels[level].parent_elt {
            None => Some((TreePath::new(), None)),
            Some(parent) => {
                let path = self.cache.path_of(parent)?;
                Some((path, Some(self.cache.iter_for(parent))))
            }
        }
    }

    fn payload(&self, elt: EltId) -> Option<(TreePath, TreeIter)> {
        let path = self.cache.path_of(elt)?;
        Some((path, self.cache.iter_for(elt)))
    }
}

/// `new_order[new_position] == old_position` for a rearranged level.
fn permutation(before: &[EltId], after: &[EltId]) -> Vec<usize> {
    let old_positions: HashMap<EltId, usize> = before
        .iter()
        .enumerate()
        .map(|(position, &id)| (id, position))
        .collect();
    after
        .iter()
        .map(|id| old_positions.get(id).copied().unwrap_or_default())
        .collect()
}

type Reorder = (TreePath, Option<TreeIter>, Vec<usize>);

/// A proxy that sorts the rows of a child model.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use horizon_arbor::model::{SortColumn, SortOrder, TreeModel, TreeModelSort, TreeStore, ValueType};
///
/// let store = Arc::new(TreeStore::new(&[ValueType::Int]));
/// for n in [3, 1, 2] {
///     let row = store.append(None).unwrap();
///     store.set_value(&row, 0, n.into()).unwrap();
/// }
///
/// let sort = TreeModelSort::new(store.clone());
/// sort.set_sort_column_id(SortColumn::Column(0), SortOrder::Ascending).unwrap();
///
/// let first = sort.iter_first().unwrap();
/// assert_eq!(sort.value(&first, 0).as_int(), Some(1));
/// ```
pub struct TreeModelSort {
    child: Arc<dyn TreeModel>,
    state: Mutex<SortState>,
    signals: ModelSignals,
    sort_column_changed: Signal<()>,
    connections: ChildConnections,
}

impl TreeModelSort {
    /// Creates a proxy that keeps the child's order until a sort is chosen.
    pub fn new(child: Arc<dyn TreeModel>) -> Arc<Self> {
        Self::create(child, SortColumn::Default, SortOrder::Ascending, HashMap::new(), None)
    }

    /// Starts configuring a sort proxy over `child`.
    pub fn builder(child: Arc<dyn TreeModel>) -> TreeModelSortBuilder {
        TreeModelSortBuilder {
            child,
            column: SortColumn::Default,
            order: SortOrder::Ascending,
            funcs: HashMap::new(),
            default_func: None,
        }
    }

    fn create(
        child: Arc<dyn TreeModel>,
        column: SortColumn,
        order: SortOrder,
        funcs: HashMap<usize, SortFunc>,
        default_func: Option<SortFunc>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let connections = ChildConnections::connect(child.as_ref(), weak.clone());
            let cache = Cache::new(child.clone(), None, Retention::ReferencedOnly);
            Self {
                child,
                state: Mutex::new(SortState {
                    cache,
                    column,
                    order,
                    funcs,
                    default_func,
                }),
                signals: ModelSignals::new(),
                sort_column_changed: Signal::new(),
                connections,
            }
        })
    }

    /// The sorted model.
    pub fn model(&self) -> &Arc<dyn TreeModel> {
        &self.child
    }

    /// Emitted after the sort column or order changed.
    pub fn sort_column_changed(&self) -> &Signal<()> {
        &self.sort_column_changed
    }

    /// The current sort column and order.
    pub fn sort_column_id(&self) -> (SortColumn, SortOrder) {
        let state = self.state.lock();
        (state.column, state.order)
    }

    /// Changes what rows are sorted by and re-sorts every cached level.
    ///
    /// Emits `sort_column_changed`, then one `rows_reordered` per level
    /// whose order changed. Switching to [`SortColumn::Unsorted`] keeps the
    /// current order until rows change.
    pub fn set_sort_column_id(&self, column: SortColumn, order: SortOrder) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.column == column && state.order == order {
                return Ok(());
            }
            match column {
                SortColumn::Column(index)
                    if index >= self.child.n_columns() && !state.funcs.contains_key(&index) =>
                {
                    return Err(Error::invalid_column(index, self.child.n_columns()));
                }
                SortColumn::Default if state.default_func.is_none() && state.column != SortColumn::Default => {
                    return Err(Error::configuration("no default sort function is set"));
                }
                _ => {}
            }
            state.column = column;
            state.order = order;
        }

        tracing::debug!(target: targets::SORT, ?column, ?order, "sort column changed");
        self.sort_column_changed.emit(());
        if column != SortColumn::Unsorted {
            self.resort();
        }
        Ok(())
    }

    /// Sets the comparison used for `column`.
    pub fn set_sort_func<F>(&self, column: usize, func: F)
    where
        F: Fn(&dyn TreeModel, &TreeIter, &TreeIter) -> Ordering + Send + Sync + 'static,
    {
        let active = {
            let mut state = self.state.lock();
            state.funcs.insert(column, Arc::new(func));
            state.column == SortColumn::Column(column)
        };
        if active {
            self.resort();
        }
    }

    /// Sets the comparison used by [`SortColumn::Default`].
    pub fn set_default_sort_func<F>(&self, func: F)
    where
        F: Fn(&dyn TreeModel, &TreeIter, &TreeIter) -> Ordering + Send + Sync + 'static,
    {
        let active = {
            let mut state = self.state.lock();
            state.default_func = Some(Arc::new(func));
            state.column == SortColumn::Default
        };
        if active {
            self.resort();
        }
    }

    /// Returns `true` if a default comparison is set.
    pub fn has_default_sort_func(&self) -> bool {
        self.state.lock().default_func.is_some()
    }

    /// Removes the default comparison and returns to the child's order.
    pub fn reset_default_sort_func(&self) {
        {
            let mut state = self.state.lock();
            state.default_func = None;
            state.column = SortColumn::Default;
            state.order = SortOrder::Ascending;
        }
        self.resort();
    }

    /// Returns `true` if `iter` is a live iterator of this proxy.
    ///
    /// Meant for debugging: the check is as expensive as a path lookup.
    pub fn iter_is_valid(&self, iter: &TreeIter) -> bool {
        self.state.lock().cache.decode(iter).is_some()
    }

    /// Releases cached levels nobody references and invalidates iterators.
    pub fn clear_cache(&self) {
        let mut state = self.state.lock();
        if state.cache.zero_ref_count() > 0 {
            state.cache.increment_stamp();
        }
    }

    /// Converts a child path to the path of the same row in this proxy.
    pub fn convert_child_path_to_path(&self, child_path: &TreePath) -> Option<TreePath> {
        let mut state = self.state.lock();
        let elt = state.locate(child_path, true)?;
        state.cache.path_of(elt)
    }

    /// Converts a proxy path to the path of the same row in the child.
    pub fn convert_path_to_child_path(&self, path: &TreePath) -> Option<TreePath> {
        let mut state = self.state.lock();
        let elt = state.walk(path)?;
        Some(state.cache.child_path(elt))
    }

    /// Converts a child iterator to an iterator of this proxy.
    pub fn convert_child_iter_to_iter(&self, child_iter: &TreeIter) -> Option<TreeIter> {
        let child_path = self.child.path(child_iter)?;
        let mut state = self.state.lock();
        let elt = state.locate(&child_path, true)?;
        Some(state.cache.iter_for(elt))
    }

    /// Converts a proxy iterator to an iterator of the child.
    pub fn convert_iter_to_child_iter(&self, iter: &TreeIter) -> Option<TreeIter> {
        let state = self.state.lock();
        let elt = state.cache.decode(iter)?;
        state.cache.child_iter(elt)
    }

    /// Renders the cached levels for debugging.
    pub fn dump_cache(&self, options: TreeFormatOptions) -> String {
        self.state.lock().cache.dump("TreeModelSort cache", options)
    }

    /// Re-sorts every cached level, announcing each level that changed.
    fn resort(&self) {
        let _span = PerfSpan::new(span_names::RESORT);
        let reorders: Vec<Reorder> = {
            let mut state = self.state.lock();
            let Some(root) = state.cache.root else {
                return;
            };

            let mut pending = vec![root];
            let mut changed = Vec::new();
            while let Some(level) = pending.pop() {
                if let Some(new_order) = state.sort_level(level) {
                    changed.push((level, new_order));
                }
                let children: Vec<LevelId> = state.cache.levels[level]
                    .elts
                    .iter()
                    .filter_map(|&id| state.cache.elts[id].children)
                    .collect();
                pending.extend(children);
            }
            if changed.is_empty() {
                return;
            }

            state.cache.bump_stamp();
            changed
                .into_iter()
                .filter_map(|(level, new_order)| {
                    let (path, iter) = state.parent_payload(level)?;
                    Some((path, iter, new_order))
                })
                .collect()
        };

        for (path, iter, new_order) in reorders {
            self.signals.emit_rows_reordered(path, iter, new_order);
        }
    }
}

impl ChildListener for TreeModelSort {
    fn child_row_changed(&self, child_path: &TreePath, _child_iter: &TreeIter) {
        let (elt, reordered) = {
            let mut state = self.state.lock();
            let Some(elt) = state.locate(child_path, false) else {
                return;
            };
            // Keeps the level cached while it is re-sorted.
            state.cache.ref_elt(elt, true);

            let level = state.cache.elts[elt].level;
            let before = state.cache.levels[level].elts.clone();
            let mut reordered = None;
            if before.len() >= 2
                && let Some(comparator) = state.comparator()
            {
                let old_index = state.cache.position(elt);
                let key = state.keyed(elt);
                let after_previous = old_index == 0
                    || state.compare(&comparator, &state.keyed(before[old_index - 1]), &key) != Ordering::Greater;
                let before_next = old_index + 1 == before.len()
                    || state.compare(&comparator, &key, &state.keyed(before[old_index + 1])) != Ordering::Greater;

                if !(after_previous && before_next) {
                    let mut after = before.clone();
                    after.remove(old_index);
                    let new_index = state.insertion_index(&after, elt);
                    after.insert(new_index, elt);

                    let new_order = permutation(&before, &after);
                    state.cache.levels[level].elts = after;
                    let new_first = state.cache.levels[level].elts[0];
                    state.cache.transfer_first_ref(before[0], new_first);
                    state.cache.increment_stamp();

                    reordered = state
                        .parent_payload(level)
                        .map(|(path, iter)| (path, iter, new_order));
                }
            }
            (elt, reordered)
        };

        if let Some((path, iter, new_order)) = reordered {
            self.signals.emit_rows_reordered(path, iter, new_order);
        }

        let changed = {
            let state = self.state.lock();
            if state.cache.elts.contains_key(elt) {
                state.payload(elt)
            } else {
                None
            }
        };
        if let Some((path, iter)) = changed {
            self.signals.emit_row_changed(path, iter);
        }

        let mut state = self.state.lock();
        if state.cache.elts.contains_key(elt) {
            state.cache.unref_elt(elt, true, true);
        }
    }

    fn child_row_inserted(&self, child_path: &TreePath, _child_iter: &TreeIter) {
        let inserted = {
            let mut state = self.state.lock();
            let Some(offset) = child_path.last() else {
                return;
            };

            if state.cache.root.is_none() {
                // Building the root level mirrors the new row as well.
                state.build_level(None);
            } else {
                let level = if child_path.depth() > 1 {
                    let Some(parent) = state.locate(&child_path.parent(), false) else {
                        return;
                    };
                    state.cache.elts[parent].children
                } else {
                    state.cache.root
                };
                let Some(level) = level else {
                    return;
                };

                state.cache.shift_for_insert(level, offset);
                if Some(level) != state.cache.root && state.cache.levels[level].ext_ref_count == 0 {
                    state.cache.free_level(level, true, true, false);
                    return;
                }

                let elt = state.cache.push_elt(level, offset, true);
                let mut others = state.cache.levels[level].elts.clone();
                others.pop();
                let index = state.insertion_index(&others, elt);
                others.insert(index, elt);
                state.cache.levels[level].elts = others;
                if index == 0 {
                    let previous = state.cache.levels[level].elts[1];
                    state.cache.transfer_first_ref(previous, elt);
                }
                state.cache.increment_stamp();
            }

            state
                .locate(child_path, false)
                .and_then(|elt| state.payload(elt))
        };

        if let Some((path, iter)) = inserted {
            tracing::trace!(target: targets::SORT, %path, "row inserted");
            self.signals.emit_row_inserted(path, iter);
        }
    }

    fn child_row_has_child_toggled(&self, child_path: &TreePath, _child_iter: &TreeIter) {
        let toggled = {
            let mut state = self.state.lock();
            state
                .locate(child_path, false)
                .and_then(|elt| state.payload(elt))
        };
        if let Some((path, iter)) = toggled {
            self.signals.emit_row_has_child_toggled(path, iter);
        }
    }

    fn child_row_deleted(&self, child_path: &TreePath) {
        let deleted = {
            let mut state = self.state.lock();
            let Some(elt) = state.locate(child_path, false) else {
                return;
            };
            let Some(path) = state.cache.path_of(elt) else {
                return;
            };
            let level = state.cache.elts[elt].level;
            let offset = state.cache.elts[elt].offset;

            state.cache.release_external(elt, false);
            let keep = usize::from(state.cache.elts[elt].children.is_some());
            state.cache.release_down_to(elt, keep, false);

            if state.cache.levels[level].elts.len() == 1 {
                state.cache.free_level(level, false, true, false);
            } else {
                let is_first = state.cache.levels[level].elts[0] == elt;
                if let Some(children) = state.cache.elts[elt].children {
                    state.cache.free_level(children, false, false, false);
                }
                state.cache.forget_elt(elt);
                state.cache.shift_for_delete(level, offset);
                if is_first {
                    let first = state.cache.levels[level].elts[0];
                    state.cache.ref_elt(first, false);
                }
            }
            state.cache.increment_stamp();
            path
        };

        self.signals.emit_row_deleted(deleted);
    }

    fn child_rows_reordered(&self, child_path: &TreePath, _child_iter: Option<&TreeIter>, new_order: &[usize]) {
        let reordered = {
            let mut state = self.state.lock();
            let level = if child_path.is_empty() {
                state.cache.root
            } else {
                state
                    .locate(child_path, false)
                    .and_then(|parent| state.cache.elts[parent].children)
            };
            let Some(level) = level else {
                return;
            };
            let before = state.cache.levels[level].elts.clone();
            if before.len() < 2 {
                return;
            }

            let mut new_offsets = vec![0; new_order.len()];
            for (position, &old) in new_order.iter().enumerate() {
                if let Some(slot) = new_offsets.get_mut(old) {
                    *slot = position;
                }
            }
            for &id in &before {
                let entry = &mut state.cache.elts[id];
                if let Some(&offset) = new_offsets.get(entry.offset) {
                    entry.offset = offset;
                }
            }

            // A sorted level does not depend on the child's order.
            if state.comparator().is_some() {
                return;
            }
            let after = state.sorted(&before);
            if after == before {
                return;
            }
            let permuted = permutation(&before, &after);
            let new_first = after[0];
            state.cache.levels[level].elts = after;
            state.cache.transfer_first_ref(before[0], new_first);
            state.cache.increment_stamp();
            state
                .parent_payload(level)
                .map(|(path, iter)| (path, iter, permuted))
        };

        if let Some((path, iter, new_order)) = reordered {
            self.signals.emit_rows_reordered(path, iter, new_order);
        }
    }
}

impl Drop for TreeModelSort {
    fn drop(&mut self) {
        self.connections.disconnect(self.child.as_ref());
        let state = self.state.get_mut();
        if let Some(root) = state.cache.root {
            state.cache.free_level(root, true, true, true);
        }
    }
}

impl std::fmt::Debug for TreeModelSort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TreeModelSort")
            .field("column", &state.column)
            .field("order", &state.order)
            .field("cache", &state.cache)
            .finish_non_exhaustive()
    }
}

impl TreeModel for TreeModelSort {
    fn flags(&self) -> ModelFlags {
        ModelFlags::new().with_list_only(self.child.flags().list_only)
    }

    fn n_columns(&self) -> usize {
        self.child.n_columns()
    }

    fn column_type(&self, column: usize) -> Option<ValueType> {
        self.child.column_type(column)
    }

    fn iter(&self, path: &TreePath) -> Option<TreeIter> {
        let mut state = self.state.lock();
        let elt = state.walk(path)?;
        Some(state.cache.iter_for(elt))
    }

    fn path(&self, iter: &TreeIter) -> Option<TreePath> {
        let state = self.state.lock();
        let elt = state.cache.decode(iter)?;
        state.cache.path_of(elt)
    }

    fn value(&self, iter: &TreeIter, column: usize) -> Value {
        let child_iter = {
            let state = self.state.lock();
            state.cache.decode(iter).and_then(|elt| state.cache.child_iter(elt))
        };
        match child_iter {
            Some(child_iter) => self.child.value(&child_iter, column),
            None => Value::None,
        }
    }

    fn iter_next(&self, iter: &TreeIter) -> Option<TreeIter> {
        let state = self.state.lock();
        let elt = state.cache.decode(iter)?;
        let next = state.cache.next_visible(elt)?;
        Some(state.cache.iter_for(next))
    }

    fn iter_previous(&self, iter: &TreeIter) -> Option<TreeIter> {
        let state = self.state.lock();
        let elt = state.cache.decode(iter)?;
        let previous = state.cache.previous_visible(elt)?;
        Some(state.cache.iter_for(previous))
    }

    fn iter_children(&self, parent: Option<&TreeIter>) -> Option<TreeIter> {
        self.iter_nth_child(parent, 0)
    }

    fn iter_has_child(&self, iter: &TreeIter) -> bool {
        self.convert_iter_to_child_iter(iter)
            .is_some_and(|child_iter| self.child.iter_has_child(&child_iter))
    }

    fn iter_n_children(&self, parent: Option<&TreeIter>) -> usize {
        match parent {
            None => {
                let mut state = self.state.lock();
                state
                    .root_level()
                    .map_or(0, |root| state.cache.levels[root].elts.len())
            }
            Some(iter) => self
                .convert_iter_to_child_iter(iter)
                .map_or(0, |child_iter| self.child.iter_n_children(Some(&child_iter))),
        }
    }

    fn iter_nth_child(&self, parent: Option<&TreeIter>, n: usize) -> Option<TreeIter> {
        let mut state = self.state.lock();
        let level = match parent {
            None => state.root_level()?,
            Some(iter) => {
                let elt = state.cache.decode(iter)?;
                state.children_of(elt)?
            }
        };
        let elt = *state.cache.levels[level].elts.get(n)?;
        Some(state.cache.iter_for(elt))
    }

    fn iter_parent(&self, child: &TreeIter) -> Option<TreeIter> {
        let state = self.state.lock();
        let elt = state.cache.decode(child)?;
        let parent = state.cache.levels[state.cache.elts[elt].level].parent_elt?;
        Some(state.cache.iter_for(parent))
    }

    fn ref_node(&self, iter: &TreeIter) {
        let mut state = self.state.lock();
        match state.cache.decode(iter) {
            Some(elt) => state.cache.ref_elt(elt, true),
            None => tracing::warn!(target: targets::SORT, "ref_node on a stale iterator"),
        }
    }

    fn unref_node(&self, iter: &TreeIter) {
        let mut state = self.state.lock();
        match state.cache.decode(iter) {
            Some(elt) => state.cache.unref_elt(elt, true, true),
            None => tracing::warn!(target: targets::SORT, "unref_node on a stale iterator"),
        }
    }

    fn signals(&self) -> &ModelSignals {
        &self.signals
    }
}

/// Configures a [`TreeModelSort`] before it starts mirroring its child.
pub struct TreeModelSortBuilder {
    child: Arc<dyn TreeModel>,
    column: SortColumn,
    order: SortOrder,
    funcs: HashMap<usize, SortFunc>,
    default_func: Option<SortFunc>,
}

impl TreeModelSortBuilder {
    /// Sorts by `column` in `order` from the start.
    pub fn sort_column(mut self, column: SortColumn, order: SortOrder) -> Self {
        self.column = column;
        self.order = order;
        self
    }

    /// Sets the comparison used for `column`.
    pub fn sort_func<F>(mut self, column: usize, func: F) -> Self
    where
        F: Fn(&dyn TreeModel, &TreeIter, &TreeIter) -> Ordering + Send + Sync + 'static,
    {
        self.funcs.insert(column, Arc::new(func));
        self
    }

    /// Sets the comparison used by [`SortColumn::Default`].
    pub fn default_sort_func<F>(mut self, func: F) -> Self
    where
        F: Fn(&dyn TreeModel, &TreeIter, &TreeIter) -> Ordering + Send + Sync + 'static,
    {
        self.default_func = Some(Arc::new(func));
        self
    }

    /// Creates the proxy.
    ///
    /// Fails if the sort column is neither a child column nor has a
    /// comparison of its own.
    pub fn build(self) -> Result<Arc<TreeModelSort>> {
        if let SortColumn::Column(index) = self.column
            && index >= self.child.n_columns()
            && !self.funcs.contains_key(&index)
        {
            return Err(Error::invalid_column(index, self.child.n_columns()));
        }
        Ok(TreeModelSort::create(
            self.child,
            self.column,
            self.order,
            self.funcs,
            self.default_func,
        ))
    }
}

impl std::fmt::Debug for TreeModelSortBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeModelSortBuilder")
            .field("column", &self.column)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(TreeModelSort: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RefCountStore, TreeStore};

    fn store_with(values: &[i64]) -> Arc<RefCountStore> {
        let store = Arc::new(RefCountStore::new(&[ValueType::Int]));
        for &value in values {
            let row = store.store().append(None).unwrap();
            store.store().set_value(&row, 0, value.into()).unwrap();
        }
        store
    }

    fn root_values(model: &dyn TreeModel) -> Vec<i64> {
        (0..model.iter_n_children(None))
            .filter_map(|n| model.iter_nth_child(None, n))
            .filter_map(|iter| model.value(&iter, 0).as_int())
            .collect()
    }

    #[test]
    fn test_child_order_until_sorted() {
        let store = store_with(&[3, 1, 2]);
        let sort = TreeModelSort::new(store.clone());
        assert_eq!(root_values(sort.as_ref()), vec![3, 1, 2]);

        sort.set_sort_column_id(SortColumn::Column(0), SortOrder::Descending)
            .unwrap();
        assert_eq!(root_values(sort.as_ref()), vec![3, 2, 1]);
        assert_eq!(
            sort.sort_column_id(),
            (SortColumn::Column(0), SortOrder::Descending)
        );
    }

    #[test]
    fn test_resort_emits_permutation() {
        let store = store_with(&[3, 1, 2]);
        let sort = TreeModelSort::new(store.clone());
        sort.iter_first().unwrap();

        let orders = Arc::new(Mutex::new(Vec::new()));
        let seen = orders.clone();
        sort.signals().rows_reordered.connect(move |(path, _, order)| {
            seen.lock().push((path.clone(), order.clone()));
        });

        sort.set_sort_column_id(SortColumn::Column(0), SortOrder::Ascending)
            .unwrap();
        assert_eq!(*orders.lock(), vec![(TreePath::new(), vec![1, 2, 0])]);
    }

    #[test]
    fn test_first_ref_follows_sorted_order() {
        let store = store_with(&[3, 1, 2]);
        let sort = TreeModelSort::new(store.clone());
        sort.iter_first().unwrap();

        let first_child = store.iter_first().unwrap();
        store.assert_node_ref_count(&first_child, 1);

        sort.set_sort_column_id(SortColumn::Column(0), SortOrder::Ascending)
            .unwrap();
        store.assert_node_ref_count(&first_child, 0);
        let smallest = store.iter(&TreePath::from([1])).unwrap();
        store.assert_node_ref_count(&smallest, 1);
    }

    #[test]
    fn test_sort_func_overrides_value_order() {
        let store = store_with(&[1, 2, 3]);
        let sort = TreeModelSort::builder(store.clone())
            .sort_column(SortColumn::Column(0), SortOrder::Ascending)
            .sort_func(0, |model, a, b| {
                let a = model.value(a, 0).as_int().unwrap_or_default();
                let b = model.value(b, 0).as_int().unwrap_or_default();
                (a % 2).cmp(&(b % 2)).then(a.cmp(&b))
            })
            .build()
            .unwrap();
        assert_eq!(root_values(sort.as_ref()), vec![2, 1, 3]);
    }

    #[test]
    fn test_invalid_column_rejected() {
        let store = Arc::new(TreeStore::new(&[ValueType::Int]));
        let sort = TreeModelSort::new(store.clone());
        assert_eq!(
            sort.set_sort_column_id(SortColumn::Column(4), SortOrder::Ascending),
            Err(Error::invalid_column(4, 1))
        );
        assert!(TreeModelSort::builder(store)
            .sort_column(SortColumn::Column(2), SortOrder::Ascending)
            .build()
            .is_err());
    }

    #[test]
    fn test_default_without_func_rejected() {
        let store = store_with(&[1]);
        let sort = TreeModelSort::new(store);
        sort.set_sort_column_id(SortColumn::Unsorted, SortOrder::Ascending)
            .unwrap();
        assert!(matches!(
            sort.set_sort_column_id(SortColumn::Default, SortOrder::Ascending),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn test_changed_row_moves() {
        let store = store_with(&[1, 2, 3]);
        let sort = TreeModelSort::builder(store.clone())
            .sort_column(SortColumn::Column(0), SortOrder::Ascending)
            .build()
            .unwrap();
        sort.iter_first().unwrap();

        let first = store.iter_first().unwrap();
        store.store().set_value(&first, 0, 5.into()).unwrap();
        assert_eq!(root_values(sort.as_ref()), vec![2, 3, 5]);
        assert_eq!(
            sort.convert_child_path_to_path(&TreePath::from([0])),
            Some(TreePath::from([2]))
        );
    }

    #[test]
    fn test_drop_releases_child_refs() {
        let store = store_with(&[2, 1]);
        let parent = store.iter_first().unwrap();
        store.store().append(Some(&parent)).unwrap();

        let sort = TreeModelSort::new(store.clone());
        let row = sort.iter_first().unwrap();
        sort.ref_node(&row);
        sort.iter_children(Some(&row)).unwrap();
        assert!(sort.iter_is_valid(&row));

        drop(sort);
        store.assert_entire_model_unreferenced();
    }
}
