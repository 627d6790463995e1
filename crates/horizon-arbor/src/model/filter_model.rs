//! A proxy that shows a subset of a child model's rows.
//!
//! [`TreeModelFilter`] decides per row whether it is visible, either with a
//! callback or by reading a boolean column. It can also present one subtree
//! of the child model as its entire content (a *virtual root*), and replace
//! the child's columns with computed ones.
//!
//! The filter mirrors its child lazily: a level of rows is built the first
//! time somebody asks for it and released again once nobody references it.
//! A row that is filtered out is not cached at all, except for the first row
//! of a level, which is kept as a hidden placeholder so that the child row
//! above it stays referenced and keeps reporting changes.
//!
//! # Visibility Changes
//!
//! The visibility callback runs when rows are cached and again whenever the
//! child reports `row_changed`, `row_inserted` or `row_has_child_toggled`
//! for a row. If the callback depends on anything other than the row it is
//! given, changing that state requires a call to
//! [`refilter`](TreeModelFilter::refilter); the filter cannot notice it.
//!
//! The callback runs while the filter's cache is locked. It may read the
//! child model it is given but must not call back into the filter.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use horizon_arbor_core::logging::{PerfSpan, TreeFormatOptions, span_names, targets};

use crate::error::{Error, Result};

use super::cache::{Cache, ChildConnections, ChildListener, EltId, LevelId, Retention};
use super::iter::TreeIter;
use super::path::TreePath;
use super::row_reference::{ref_path, unref_path};
use super::traits::{ModelFlags, ModelSignals, TreeModel};
use super::value::{Value, ValueType};

/// Decides whether a child row is visible.
///
/// Receives the child model and the child row.
pub type VisibleFn = Arc<dyn Fn(&dyn TreeModel, &TreeIter) -> bool + Send + Sync>;

/// Computes the value of one filter column.
///
/// Receives the child model, the child row and the filter column.
pub type ModifyFn = Arc<dyn Fn(&dyn TreeModel, &TreeIter, usize) -> Value + Send + Sync>;

enum Visibility {
    All,
    Func(VisibleFn),
    Column(usize),
}

struct Modify {
    types: Vec<ValueType>,
    func: ModifyFn,
}

struct FilterState {
    cache: Cache,
    visibility: Visibility,
    modify: Option<Modify>,
    /// No levels are built while a deletion is being reported.
    in_row_deleted: bool,
    virtual_root_deleted: bool,
}

impl FilterState {
    fn is_visible(&self, child_iter: &TreeIter) -> bool {
        let child = self.cache.child();
        match &self.visibility {
            Visibility::All => true,
            Visibility::Func(func) => func(child.as_ref(), child_iter),
            Visibility::Column(column) => child
                .value(child_iter, *column)
                .as_bool()
                .unwrap_or(false),
        }
    }

    /// Mirrors the children of `parent`, or the root rows, without emitting.
    fn build_level(&mut self, parent: Option<EltId>) -> Option<LevelId> {
        if self.in_row_deleted || self.virtual_root_deleted {
            return None;
        }

        let parent_iter = match parent {
            Some(elt) => Some(self.cache.child_iter(elt)?),
            None => self.cache.root_parent_iter()?,
        };
        let child = self.cache.child().clone();
        let first = child.iter_children(parent_iter.as_ref())?;

        if let Some(parent) = parent {
            self.cache.ref_elt(parent, false);
        }
        let level = self.cache.new_level(parent);

        let mut current = Some(first);
        let mut offset = 0;
        let mut empty = true;
        while let Some(iter) = current {
            if self.is_visible(&iter) {
                self.cache.push_elt(level, offset, true);
                empty = false;
            }
            offset += 1;
            current = child.iter_next(&iter);
        }

        if empty {
            let parent_unreferenced = self.cache.levels[level]
                .parent_level
                .is_some_and(|parent_level| self.cache.levels[parent_level].ext_ref_count == 0);
            if parent_unreferenced {
                self.cache.free_level(level, false, true, false);
                return None;
            }
            self.cache.push_elt(level, 0, false);
        }

        let first_elt = self.cache.levels[level].elts[0];
        self.cache.ref_elt(first_elt, false);
        tracing::trace!(target: targets::FILTER, rows = offset, "level built");
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

    fn find_offset(&self, level: LevelId, offset: usize) -> Option<EltId> {
        let elts = &self.cache.levels[level].elts;
        elts.binary_search_by_key(&offset, |&id| self.cache.elts[id].offset)
            .ok()
            .map(|index| elts[index])
    }

    /// Caches a hidden elt for child row `offset`, keeping offset order.
    fn insert_elt(&mut self, level: LevelId, offset: usize) -> EltId {
        let index = self.cache.levels[level]
            .elts
            .partition_point(|&id| self.cache.elts[id].offset < offset);
        self.cache.insert_elt(level, index, offset, false)
    }

    /// Caches child row `offset` of `level` if it exists and passes the filter.
    fn fetch_child(&mut self, level: LevelId, offset: usize) -> Option<EltId> {
        let parent_iter = self.cache.level_parent_iter(level)?;
        let child = self.cache.child().clone();
        let iter = child.iter_nth_child(parent_iter.as_ref(), offset)?;
        if !self.is_visible(&iter) {
            return None;
        }
        Some(self.insert_elt(level, offset))
    }

    /// Strips the virtual root from a child path.
    fn relative_path(&self, child_path: &TreePath) -> Option<TreePath> {
        match self.cache.virtual_root() {
            Some(root) => child_path.strip_prefix(root),
            None => Some(child_path.clone()),
        }
    }

    /// Finds the elt mirroring `child_path`.
    ///
    /// With `build_levels`, missing levels along the way are built. With
    /// `fetch_children`, uncached rows that pass the filter are cached.
    fn locate(&mut self, child_path: &TreePath, build_levels: bool, fetch_children: bool) -> Option<EltId> {
        let relative = self.relative_path(child_path)?;
        let mut level = if build_levels {
            self.root_level()
        } else {
            self.cache.root
        };

        let mut found = None;
        for &offset in relative.indices() {
            let current = level?;
            let elt = match self.find_offset(current, offset) {
                Some(elt) => elt,
                None if fetch_children => self.fetch_child(current, offset)?,
                None => return None,
            };
            if build_levels && self.cache.elts[elt].children.is_none() {
                self.build_level(Some(elt));
            }
            level = self.cache.elts[elt].children;
            found = Some(elt);
        }
        found
    }

    /// Reduces a level whose parent just became hidden to its placeholder.
    fn prune_level(&mut self, level: LevelId) {
        let elts = self.cache.levels[level].elts.clone();
        for &elt in &elts {
            if let Some(children) = self.cache.elts[elt].children {
                self.cache.free_level(children, true, true, true);
            }
        }

        let Some((&first, rest)) = elts.split_first() else {
            return;
        };
        self.cache.release_external(first, true);
        self.cache.elts[first].visible = false;

        for &elt in rest {
            self.cache.release_external(elt, true);
            self.cache.release_down_to(elt, 0, true);
            self.cache.forget_elt(elt);
        }
    }

    fn payload(&self, elt: EltId) -> Option<(TreePath, TreeIter)> {
        let path = self.cache.path_of(elt)?;
        Some((path, self.cache.iter_for(elt)))
    }
}

/// Outcome of comparing a row's cached and requested visibility.
enum Transition {
    Hide(EltId),
    Update(EltId),
    Show,
}

/// The first change [`TreeModelFilter::check_ancestors`] found on the way down.
enum AncestorChange {
    Insert(TreePath),
    Remove(EltId),
    Toggle(TreePath, TreeIter),
}

/// A proxy that hides rows of a child model.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use horizon_arbor::model::{TreeModel, TreeModelFilter, TreeStore, ValueType};
///
/// let store = Arc::new(TreeStore::new(&[ValueType::Int, ValueType::Bool]));
/// for (n, shown) in [(1, true), (2, false), (3, true)] {
///     let row = store.append(None).unwrap();
///     store.set(&row, &[(0, n.into()), (1, shown.into())]).unwrap();
/// }
///
/// let filter = TreeModelFilter::builder(store.clone())
///     .visible_column(1)
///     .build()
///     .unwrap();
/// assert_eq!(filter.iter_n_children(None), 2);
///
/// let second = filter.iter_nth_child(None, 1).unwrap();
/// assert_eq!(filter.value(&second, 0).as_int(), Some(3));
/// ```
pub struct TreeModelFilter {
    child: Arc<dyn TreeModel>,
    state: Mutex<FilterState>,
    signals: ModelSignals,
    connections: ChildConnections,
}

impl TreeModelFilter {
    /// Creates a filter that shows every row of `child`.
    pub fn new(child: Arc<dyn TreeModel>) -> Arc<Self> {
        Self::create(child, None, Visibility::All, None)
    }

    /// Starts configuring a filter over `child`.
    pub fn builder(child: Arc<dyn TreeModel>) -> TreeModelFilterBuilder {
        TreeModelFilterBuilder {
            child,
            virtual_root: None,
            visibility: Visibility::All,
            modify: None,
        }
    }

    fn create(
        child: Arc<dyn TreeModel>,
        virtual_root: Option<TreePath>,
        visibility: Visibility,
        modify: Option<Modify>,
    ) -> Arc<Self> {
        if let Some(root) = &virtual_root {
            ref_path(child.as_ref(), root);
        }
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let connections = ChildConnections::connect(child.as_ref(), weak.clone());
            let cache = Cache::new(child.clone(), virtual_root, Retention::MonitorParents);
            Self {
                child,
                state: Mutex::new(FilterState {
                    cache,
                    visibility,
                    modify,
                    in_row_deleted: false,
                    virtual_root_deleted: false,
                }),
                signals: ModelSignals::new(),
                connections,
            }
        })
    }

    /// The filtered model.
    pub fn model(&self) -> &Arc<dyn TreeModel> {
        &self.child
    }

    /// The child path shown as this filter's root, if any.
    pub fn virtual_root(&self) -> Option<TreePath> {
        self.state.lock().cache.virtual_root().cloned()
    }

    /// Replaces the visibility rule with a callback.
    ///
    /// Cached rows keep their visibility until [`refilter`](Self::refilter).
    pub fn set_visible_func<F>(&self, func: F)
    where
        F: Fn(&dyn TreeModel, &TreeIter) -> bool + Send + Sync + 'static,
    {
        self.state.lock().visibility = Visibility::Func(Arc::new(func));
    }

    /// Replaces the visibility rule with a boolean child column.
    ///
    /// Cached rows keep their visibility until [`refilter`](Self::refilter).
    pub fn set_visible_column(&self, column: usize) -> Result<()> {
        check_visible_column(self.child.as_ref(), column)?;
        self.state.lock().visibility = Visibility::Column(column);
        Ok(())
    }

    /// Replaces the child's columns with `types.len()` computed ones.
    pub fn set_modify_func<F>(&self, types: &[ValueType], func: F)
    where
        F: Fn(&dyn TreeModel, &TreeIter, usize) -> Value + Send + Sync + 'static,
    {
        self.state.lock().modify = Some(Modify {
            types: types.to_vec(),
            func: Arc::new(func),
        });
    }

    /// Re-evaluates the visibility of every child row.
    ///
    /// Rows whose visibility changed are inserted or deleted; nothing is
    /// emitted for rows that stay as they are, so a second call in a row
    /// emits nothing.
    pub fn refilter(&self) {
        let _span = PerfSpan::new(span_names::REFILTER);
        self.child.foreach(&mut |path, iter| {
            self.handle_row_changed(path, iter, true);
            false
        });
    }

    /// Releases cached levels nobody references and invalidates iterators.
    pub fn clear_cache(&self) {
        let mut state = self.state.lock();
        if state.cache.zero_ref_count() > 0 {
            state.cache.increment_stamp();
        }
    }

    /// Converts a child path to a filter path, or `None` if the row is hidden.
    pub fn convert_child_path_to_path(&self, child_path: &TreePath) -> Option<TreePath> {
        let mut state = self.state.lock();
        let elt = state.locate(child_path, true, true)?;
        state.cache.path_of(elt)
    }

    /// Converts a filter path to the path of the child row it shows.
    pub fn convert_path_to_child_path(&self, path: &TreePath) -> Option<TreePath> {
        let mut state = self.state.lock();
        let elt = Self::walk(&mut state, path)?;
        Some(state.cache.child_path(elt))
    }

    /// Converts a child iterator to a filter iterator, or `None` if the row is hidden.
    pub fn convert_child_iter_to_iter(&self, child_iter: &TreeIter) -> Option<TreeIter> {
        let child_path = self.child.path(child_iter)?;
        let path = self.convert_child_path_to_path(&child_path)?;
        self.iter(&path)
    }

    /// Converts a filter iterator to an iterator of the child model.
    pub fn convert_iter_to_child_iter(&self, iter: &TreeIter) -> Option<TreeIter> {
        let state = self.state.lock();
        let elt = state.cache.decode(iter)?;
        state.cache.child_iter(elt)
    }

    /// Renders the cached levels for debugging.
    pub fn dump_cache(&self, options: TreeFormatOptions) -> String {
        self.state.lock().cache.dump("TreeModelFilter cache", options)
    }

    /// Resolves a filter path, building levels along the way.
    fn walk(state: &mut FilterState, path: &TreePath) -> Option<EltId> {
        let (&last, ancestors) = path.indices().split_last()?;
        let mut level = state.root_level()?;
        for &index in ancestors {
            let elt = state.cache.nth_visible(level, index)?;
            level = state.children_of(elt)?;
        }
        state.cache.nth_visible(level, last)
    }

    // -------------------------------------------------------------------------
    // Emission helpers
    // -------------------------------------------------------------------------

    /// Builds the root level and announces every visible row in it.
    ///
    /// Returns `false` if there was nothing to build.
    fn build_root_and_emit(&self) -> bool {
        let visible: Vec<EltId> = {
            let mut state = self.state.lock();
            if state.cache.root.is_some() {
                return true;
            }
            let Some(root) = state.build_level(None) else {
                return false;
            };
            state.cache.levels[root]
                .elts
                .iter()
                .copied()
                .filter(|&id| state.cache.elts[id].visible)
                .collect()
        };

        for elt in visible {
            let payload = {
                let state = self.state.lock();
                if !state.cache.elts.contains_key(elt) {
                    continue;
                }
                state.payload(elt)
            };
            if let Some((path, iter)) = payload {
                self.signals.emit_row_inserted(path, iter);
            }
            self.update_children(elt);
        }
        true
    }

    /// Builds the child level of a visible row if it is being monitored and
    /// tells consumers holding the row that it has children.
    fn update_children(&self, elt: EltId) {
        let (path, iter) = {
            let mut state = self.state.lock();
            let Some(entry) = state.cache.elts.get(elt) else {
                return;
            };
            if !entry.visible {
                return;
            }
            let monitored = state.cache.levels[entry.level]
                .parent_level
                .is_none_or(|parent_level| state.cache.levels[parent_level].ext_ref_count > 0);
            if !monitored {
                return;
            }
            let Some(child_iter) = state.cache.child_iter(elt) else {
                return;
            };
            if !state.cache.child().iter_has_child(&child_iter) {
                return;
            }
            if state.cache.elts[elt].children.is_none() {
                state.build_level(Some(elt));
            }

            let entry = &state.cache.elts[elt];
            let populated = entry
                .children
                .is_some_and(|children| !state.cache.levels[children].elts.is_empty());
            if entry.ext_ref_count == 0 || !populated {
                return;
            }
            let Some(payload) = state.payload(elt) else {
                return;
            };
            payload
        };
        self.signals.emit_row_has_child_toggled(path, iter);
    }

    /// Announces a child row that just became visible.
    fn emit_row_inserted_for_path(&self, child_path: &TreePath) {
        let mut signals_emitted = false;
        if self.state.lock().cache.root.is_none() {
            self.build_root_and_emit();
            let state = self.state.lock();
            signals_emitted = state
                .cache
                .root
                .is_some_and(|root| state.cache.visible_count(root) > 0);
        }

        let (elt, inserted, toggled) = {
            let mut state = self.state.lock();
            state.cache.increment_stamp();
            let Some(elt) = state.locate(child_path, false, true) else {
                return;
            };
            state.cache.elts[elt].visible = true;
            if !state.cache.visible_in_proxy(elt) {
                return;
            }
            let Some((path, iter)) = state.payload(elt) else {
                return;
            };

            let level = state.cache.elts[elt].level;
            let level_entry = &state.cache.levels[level];
            let announce = level_entry.parent_level.is_none() || level_entry.ext_ref_count > 0;
            let toggled = match level_entry.parent_elt {
                Some(parent)
                    if state.cache.elts[parent].ext_ref_count > 0
                        && state.cache.visible_count(level) == 1 =>
                {
                    Some((path.parent(), state.cache.iter_for(parent)))
                }
                _ => None,
            };
            let inserted = (!signals_emitted && announce).then_some((path, iter));
            (elt, inserted, toggled)
        };

        if let Some((path, iter)) = inserted {
            self.signals.emit_row_inserted(path, iter);
        }
        if let Some((path, iter)) = toggled {
            self.signals.emit_row_has_child_toggled(path, iter);
        }
        if !signals_emitted {
            self.update_children(elt);
        }
    }

    /// Hides a visible row, dropping it from the cache where possible.
    fn remove_elt_from_level(&self, elt: EltId) {
        let (deleted, toggled) = {
            let mut state = self.state.lock();
            let Some(entry) = state.cache.elts.get(elt) else {
                return;
            };
            let level = entry.level;
            let level_entry = &state.cache.levels[level];
            let parent_elt = level_entry.parent_elt;
            let parent_level = level_entry.parent_level;
            let original_ext = level_entry.ext_ref_count;
            let length = level_entry.elts.len();
            let is_root = parent_level.is_none();
            let announce = is_root || original_ext > 0;
            let deleted = if announce { state.cache.path_of(elt) } else { None };

            state.cache.elts[elt].visible = false;
            let emit_child_toggled = !is_root
                && state.cache.visible_count(level) == 0
                && parent_elt.is_some_and(|parent| state.cache.elts[parent].visible);

            if length > 1 {
                if let Some(children) = state.cache.elts[elt].children {
                    state.cache.free_level(children, true, true, true);
                }
                let elts = &state.cache.levels[level].elts;
                if elts[0] == elt {
                    let next = elts[1];
                    state.cache.transfer_first_ref(elt, next);
                }
                state.cache.release_external(elt, true);
                state.cache.release_down_to(elt, 0, true);
                state.cache.forget_elt(elt);
                state.cache.increment_stamp();
            } else {
                state.cache.release_external(elt, true);
                let keep = is_root
                    || parent_level.is_some_and(|parent_level| {
                        Some(parent_level) == state.cache.root
                            || state.cache.levels[parent_level].ext_ref_count > 0
                    });
                if !keep {
                    state.cache.free_level(level, true, true, true);
                } else if let Some(children) = state.cache.elts[elt].children {
                    if is_root {
                        state.prune_level(children);
                    } else {
                        state.cache.free_level(children, true, true, true);
                    }
                }
            }

            let toggled = match parent_elt {
                Some(parent)
                    if emit_child_toggled
                        && state.cache.elts.get(parent).is_some_and(|e| e.ext_ref_count > 0) =>
                {
                    state.payload(parent)
                }
                _ => None,
            };
            (deleted, toggled)
        };

        if let Some(path) = deleted {
            tracing::debug!(target: targets::FILTER, %path, "row hidden");
            self.signals.emit_row_deleted(path);
        }
        if let Some((path, iter)) = toggled {
            self.signals.emit_row_has_child_toggled(path, iter);
        }
    }

    /// Walks the ancestors of a changed child row and brings the first one
    /// whose visibility is out of date in line.
    ///
    /// `relative` is the child path with the virtual root stripped.
    fn check_ancestors(&self, relative: &TreePath) {
        let change = {
            let mut state = self.state.lock();
            if state.virtual_root_deleted || relative.depth() < 2 {
                return;
            }
            let Some(mut level) = state.cache.root else {
                return;
            };
            let Some(mut parent_iter) = state.cache.root_parent_iter() else {
                return;
            };
            let child = state.cache.child().clone();
            let ancestors = &relative.indices()[..relative.depth() - 1];

            let mut change = None;
            for &offset in ancestors {
                let Some(child_iter) = child.iter_nth_child(parent_iter.as_ref(), offset) else {
                    break;
                };
                let requested = state.is_visible(&child_iter);

                let Some(elt) = state.find_offset(level, offset) else {
                    if requested {
                        let elt = state.insert_elt(level, offset);
                        state.cache.elts[elt].visible = true;
                        change = child.path(&child_iter).map(AncestorChange::Insert);
                    }
                    break;
                };

                if state.cache.elts[elt].visible {
                    if !requested {
                        change = Some(AncestorChange::Remove(elt));
                        break;
                    }
                } else {
                    if requested {
                        state.cache.elts[elt].visible = true;
                        change = match state.cache.levels[level].parent_elt {
                            Some(parent) => state
                                .payload(parent)
                                .map(|(path, iter)| AncestorChange::Toggle(path, iter)),
                            None => child.path(&child_iter).map(AncestorChange::Insert),
                        };
                    }
                    break;
                }

                let Some(children) = state.cache.elts[elt].children else {
                    break;
                };
                level = children;
                parent_iter = Some(child_iter);
            }
            change
        };

        match change {
            Some(AncestorChange::Insert(child_path)) => self.emit_row_inserted_for_path(&child_path),
            Some(AncestorChange::Remove(elt)) => self.remove_elt_from_level(elt),
            Some(AncestorChange::Toggle(path, iter)) => {
                self.signals.emit_row_has_child_toggled(path, iter);
            }
            None => {}
        }
    }

    // -------------------------------------------------------------------------
    // Child signal handlers
    // -------------------------------------------------------------------------

    /// Handles a changed child row. `refiltering` suppresses the
    /// notifications for rows whose visibility did not change.
    fn handle_row_changed(&self, child_path: &TreePath, child_iter: &TreeIter, refiltering: bool) {
        let (relative, transition) = {
            let mut state = self.state.lock();
            if state.virtual_root_deleted {
                return;
            }
            let Some(relative) = state.relative_path(child_path) else {
                return;
            };
            if relative.is_empty() {
                return;
            }

            let requested = state.is_visible(child_iter);
            let cached = state
                .locate(child_path, false, false)
                .filter(|&elt| state.cache.elts[elt].visible);
            let transition = match (cached, requested) {
                (None, false) => return,
                (Some(elt), false) => Transition::Hide(elt),
                (Some(elt), true) => Transition::Update(elt),
                (None, true) => Transition::Show,
            };
            (relative, transition)
        };

        match transition {
            Transition::Hide(elt) => {
                self.remove_elt_from_level(elt);
                self.check_ancestors(&relative);
            }
            Transition::Update(elt) => {
                if !refiltering {
                    let (in_proxy, changed) = {
                        let state = self.state.lock();
                        match state.cache.elts.get(elt) {
                            Some(entry) if state.cache.visible_in_proxy(elt) => {
                                let referenced = state.cache.levels[entry.level].ext_ref_count > 0;
                                (true, referenced.then(|| state.payload(elt)).flatten())
                            }
                            _ => (false, None),
                        }
                    };
                    if let Some((path, iter)) = changed {
                        self.signals.emit_row_changed(path, iter);
                    }
                    if in_proxy {
                        self.update_children(elt);
                    }
                }
                self.check_ancestors(&relative);
            }
            Transition::Show => {
                self.check_ancestors(&relative);
                self.emit_row_inserted_for_path(child_path);
            }
        }
    }

    /// Forgets everything after the virtual root or one of its ancestors
    /// was deleted from the child.
    fn handle_virtual_root_deleted(&self, child_path: &TreePath) {
        let rows = {
            let mut state = self.state.lock();
            if let Some(root) = state.cache.virtual_root().cloned() {
                unref_path(self.child.as_ref(), &root, child_path.depth().saturating_sub(1));
            }
            state.virtual_root_deleted = true;

            let Some(root) = state.cache.root else {
                return;
            };
            let rows = state.cache.visible_count(root);
            state.cache.free_level(root, false, true, false);
            state.cache.increment_stamp();
            rows
        };

        tracing::debug!(target: targets::FILTER, rows, "virtual root deleted");
        for _ in 0..rows {
            self.signals.emit_row_deleted(TreePath::first());
        }
    }
}

/// Checks that `column` exists in `child` and holds booleans.
fn check_visible_column(child: &dyn TreeModel, column: usize) -> Result<()> {
    match child.column_type(column) {
        Some(ValueType::Bool) => Ok(()),
        Some(actual) => Err(Error::type_mismatch(column, ValueType::Bool, actual)),
        None => Err(Error::invalid_column(column, child.n_columns())),
    }
}

impl ChildListener for TreeModelFilter {
    fn child_row_changed(&self, path: &TreePath, iter: &TreeIter) {
        self.handle_row_changed(path, iter, false);
    }

    fn child_row_inserted(&self, child_path: &TreePath, child_iter: &TreeIter) {
        enum Next {
            BuildRoot,
            Done,
            Toggle(TreePath, TreeIter),
            Inserted,
        }

        let (relative, next) = {
            let mut state = self.state.lock();
            if state.virtual_root_deleted {
                return;
            }

            if let Some(root) = state.cache.virtual_root_mut()
                && root.depth() >= child_path.depth()
            {
                let depth = child_path.depth() - 1;
                if root.indices()[..depth] == child_path.indices()[..depth]
                    && root.indices()[depth] >= child_path.indices()[depth]
                {
                    root.indices_mut()[depth] += 1;
                }
            }

            let Some(relative) = state.relative_path(child_path) else {
                return;
            };
            let Some(offset) = relative.last() else {
                return;
            };

            let next = match state.cache.root {
                None => Next::BuildRoot,
                Some(root) => {
                    let parent = if relative.depth() > 1 {
                        match state.locate(&child_path.parent(), false, false) {
                            Some(parent) => Some(parent),
                            None => {
                                drop(state);
                                self.check_ancestors(&relative);
                                return;
                            }
                        }
                    } else {
                        None
                    };
                    let level = match parent {
                        Some(parent) => state.cache.elts[parent].children,
                        None => Some(root),
                    };
                    match (level, parent) {
                        (None, Some(parent)) => match state.payload(parent) {
                            Some((path, iter)) => Next::Toggle(path, iter),
                            None => Next::Done,
                        },
                        (None, None) => Next::Done,
                        (Some(level), _) => {
                            state.cache.shift_for_insert(level, offset);
                            if state.is_visible(child_iter) {
                                let elt = state.insert_elt(level, offset);
                                state.cache.elts[elt].visible = true;
                                Next::Inserted
                            } else {
                                Next::Done
                            }
                        }
                    }
                }
            };
            (relative, next)
        };

        match next {
            Next::BuildRoot => {
                self.build_root_and_emit();
                self.check_ancestors(&relative);
            }
            Next::Done => self.check_ancestors(&relative),
            Next::Toggle(path, iter) => {
                self.signals.emit_row_has_child_toggled(path, iter);
                self.check_ancestors(&relative);
            }
            Next::Inserted => {
                self.check_ancestors(&relative);
                self.emit_row_inserted_for_path(child_path);
            }
        }
    }

    fn child_row_has_child_toggled(&self, child_path: &TreePath, child_iter: &TreeIter) {
        let (elt, inserted) = {
            let mut state = self.state.lock();
            if state.virtual_root_deleted {
                return;
            }
            let is_virtual_root = state.cache.virtual_root() == Some(child_path);
            if is_virtual_root && state.cache.root.is_none() {
                drop(state);
                self.build_root_and_emit();
                return;
            }

            let Some(elt) = state.locate(child_path, false, true) else {
                return;
            };
            let requested = state.is_visible(child_iter);
            let visible = state.cache.elts[elt].visible;
            match (visible, requested) {
                (false, false) => return,
                (true, false) => {
                    drop(state);
                    self.remove_elt_from_level(elt);
                    return;
                }
                (true, true) => (elt, None),
                (false, true) => {
                    state.cache.elts[elt].visible = true;
                    let inserted = if state.cache.visible_in_proxy(elt) {
                        state.payload(elt)
                    } else {
                        None
                    };
                    (elt, inserted)
                }
            }
        };

        if let Some((path, iter)) = inserted {
            self.signals.emit_row_inserted(path, iter);
        }

        let toggled = {
            let mut state = self.state.lock();
            if !state.cache.elts.contains_key(elt) {
                return;
            }
            let entry = &state.cache.elts[elt];
            if entry.ref_count > 1 && entry.children.is_none() && state.cache.child().iter_has_child(child_iter) {
                state.build_level(Some(elt));
            }
            state.payload(elt)
        };
        if let Some((path, iter)) = toggled {
            self.signals.emit_row_has_child_toggled(path, iter);
        }
    }

    fn child_row_deleted(&self, child_path: &TreePath) {
        let (relative, deleted, toggled) = {
            let mut state = self.state.lock();
            if state.virtual_root_deleted {
                return;
            }

            let root_deleted = state
                .cache
                .virtual_root()
                .is_some_and(|root| root == child_path || child_path.is_ancestor(root));
            if root_deleted {
                drop(state);
                self.handle_virtual_root_deleted(child_path);
                return;
            }

            if let Some(root) = state.cache.virtual_root_mut()
                && root.depth() >= child_path.depth()
            {
                let depth = child_path.depth() - 1;
                if root.indices()[..depth] == child_path.indices()[..depth]
                    && root.indices()[depth] > child_path.indices()[depth]
                {
                    root.indices_mut()[depth] -= 1;
                }
            }

            let Some(relative) = state.relative_path(child_path) else {
                return;
            };
            let Some(offset) = relative.last() else {
                return;
            };

            let Some(elt) = state.locate(child_path, false, false) else {
                // The row was not cached; only the offsets of its siblings move.
                let level = if relative.depth() > 1 {
                    state
                        .locate(&child_path.parent(), false, false)
                        .and_then(|parent| state.cache.elts[parent].children)
                } else {
                    state.cache.root
                };
                if let Some(level) = level {
                    state.cache.shift_for_delete(level, offset);
                }
                return;
            };

            let level = state.cache.elts[elt].level;
            let parent_elt = state.cache.levels[level].parent_elt;
            let parent_level = state.cache.levels[level].parent_level;
            let original_ext = state.cache.levels[level].ext_ref_count;
            let was_visible = state.cache.elts[elt].visible;
            let path = if was_visible { state.cache.path_of(elt) } else { None };
            let emit_child_toggled = was_visible && state.cache.visible_count(level) == 1;

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

            let mut deleted = None;
            if was_visible {
                state.cache.increment_stamp();
                if parent_elt.is_none() || original_ext > 0 {
                    deleted = path;
                }
            }

            let toggled = match (parent_elt, parent_level) {
                (Some(parent), Some(_)) if emit_child_toggled => {
                    state.cache.elts.get(parent).and_then(|_| state.payload(parent))
                }
                _ => None,
            };
            (relative, deleted, toggled)
        };

        if let Some(path) = deleted {
            self.signals.emit_row_deleted(path);
        }
        if let Some((path, iter)) = toggled {
            self.state.lock().in_row_deleted = true;
            self.signals.emit_row_has_child_toggled(path, iter);
            self.state.lock().in_row_deleted = false;
        }
        self.check_ancestors(&relative);
    }

    fn child_rows_reordered(&self, child_path: &TreePath, _child_iter: Option<&TreeIter>, new_order: &[usize]) {
        let reordered = {
            let mut state = self.state.lock();
            if state.virtual_root_deleted {
                return;
            }

            // A reorder above the virtual root only moves the root itself.
            if let Some(root) = state.cache.virtual_root_mut()
                && child_path.is_ancestor(root)
            {
                let depth = child_path.depth();
                if let Some(position) = new_order.iter().position(|&o| o == root.indices()[depth]) {
                    root.indices_mut()[depth] = position;
                }
                return;
            }

            let (level, parent) = if state.cache.virtual_root() == Some(child_path)
                || (child_path.is_empty() && state.cache.virtual_root().is_none())
            {
                (state.cache.root, None)
            } else {
                let Some(parent) = state.locate(child_path, false, false) else {
                    return;
                };
                (state.cache.elts[parent].children, Some(parent))
            };
            let Some(level) = level else {
                return;
            };
            if state.cache.levels[level].elts.is_empty() {
                return;
            }

            let old: Vec<EltId> = state.cache.levels[level].elts.clone();
            let old_first = old[0];
            let old_offsets: Vec<usize> = old.iter().map(|&id| state.cache.elts[id].offset).collect();
            let mut old_visible_index = Vec::with_capacity(old.len());
            let mut visible_seen = 0;
            for &id in &old {
                if state.cache.elts[id].visible {
                    old_visible_index.push(Some(visible_seen));
                    visible_seen += 1;
                } else {
                    old_visible_index.push(None);
                }
            }

            let mut new_elts = Vec::with_capacity(old.len());
            let mut visible_order = Vec::new();
            for (position, old_offset) in new_order.iter().enumerate() {
                let Ok(index) = old_offsets.binary_search(old_offset) else {
                    continue;
                };
                let id = old[index];
                state.cache.elts[id].offset = position;
                if let Some(visible_index) = old_visible_index[index] {
                    visible_order.push(visible_index);
                }
                new_elts.push(id);
            }
            state.cache.levels[level].elts = new_elts;

            let new_first = state.cache.levels[level].elts[0];
            state.cache.transfer_first_ref(old_first, new_first);

            if visible_order.iter().enumerate().all(|(i, &o)| i == o) {
                return;
            }
            state.cache.bump_stamp();
            match parent {
                None => Some((TreePath::new(), None, visible_order)),
                Some(parent) => state
                    .payload(parent)
                    .map(|(path, iter)| (path, Some(iter), visible_order)),
            }
        };

        if let Some((path, iter, new_order)) = reordered {
            self.signals.emit_rows_reordered(path, iter, new_order);
        }
    }
}

impl Drop for TreeModelFilter {
    fn drop(&mut self) {
        self.connections.disconnect(self.child.as_ref());
        let state = self.state.get_mut();
        if !state.virtual_root_deleted
            && let Some(root) = state.cache.virtual_root().cloned()
        {
            unref_path(self.child.as_ref(), &root, root.depth());
        }
        if let Some(root) = state.cache.root {
            state.cache.free_level(root, true, true, true);
        }
    }
}

impl std::fmt::Debug for TreeModelFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeModelFilter")
            .field("cache", &self.state.lock().cache)
            .finish_non_exhaustive()
    }
}

impl TreeModel for TreeModelFilter {
    fn flags(&self) -> ModelFlags {
        ModelFlags::new().with_list_only(self.child.flags().list_only)
    }

    fn n_columns(&self) -> usize {
        match &self.state.lock().modify {
            Some(modify) => modify.types.len(),
            None => self.child.n_columns(),
        }
    }

    fn column_type(&self, column: usize) -> Option<ValueType> {
        match &self.state.lock().modify {
            Some(modify) => modify.types.get(column).copied(),
            None => self.child.column_type(column),
        }
    }

    fn iter(&self, path: &TreePath) -> Option<TreeIter> {
        let mut state = self.state.lock();
        let elt = Self::walk(&mut state, path)?;
        Some(state.cache.iter_for(elt))
    }

    fn path(&self, iter: &TreeIter) -> Option<TreePath> {
        let state = self.state.lock();
        let elt = state.cache.decode(iter)?;
        state.cache.path_of(elt)
    }

    fn value(&self, iter: &TreeIter, column: usize) -> Value {
        let (child_iter, modify) = {
            let state = self.state.lock();
            let Some(elt) = state.cache.decode(iter) else {
                return Value::None;
            };
            let modify = state.modify.as_ref().map(|modify| modify.func.clone());
            (state.cache.child_iter(elt), modify)
        };
        let Some(child_iter) = child_iter else {
            return Value::None;
        };
        match modify {
            Some(func) => func(self.child.as_ref(), &child_iter, column),
            None => self.child.value(&child_iter, column),
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
        self.iter_n_children(Some(iter)) > 0
    }

    fn iter_n_children(&self, parent: Option<&TreeIter>) -> usize {
        let mut state = self.state.lock();
        let level = match parent {
            None => state.root_level(),
            Some(iter) => match state.cache.decode(iter) {
                Some(elt) if state.cache.elts[elt].visible => state.children_of(elt),
                _ => None,
            },
        };
        level.map_or(0, |level| state.cache.visible_count(level))
    }

    fn iter_nth_child(&self, parent: Option<&TreeIter>, n: usize) -> Option<TreeIter> {
        let mut state = self.state.lock();
        let level = match parent {
            None => state.root_level()?,
            Some(iter) => {
                let elt = state.cache.decode(iter)?;
                if !state.cache.elts[elt].visible {
                    return None;
                }
                state.children_of(elt)?
            }
        };
        let elt = state.cache.nth_visible(level, n)?;
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
            None => tracing::warn!(target: targets::FILTER, "ref_node on a stale iterator"),
        }
    }

    fn unref_node(&self, iter: &TreeIter) {
        let mut state = self.state.lock();
        match state.cache.decode(iter) {
            Some(elt) => state.cache.unref_elt(elt, true, true),
            None => tracing::warn!(target: targets::FILTER, "unref_node on a stale iterator"),
        }
    }

    fn signals(&self) -> &ModelSignals {
        &self.signals
    }
}

/// Configures a [`TreeModelFilter`] before it starts mirroring its child.
pub struct TreeModelFilterBuilder {
    child: Arc<dyn TreeModel>,
    virtual_root: Option<TreePath>,
    visibility: Visibility,
    modify: Option<(Vec<ValueType>, ModifyFn)>,
}

impl TreeModelFilterBuilder {
    /// Shows only the descendants of the child row at `path`.
    pub fn virtual_root(mut self, path: TreePath) -> Self {
        self.virtual_root = Some(path);
        self
    }

    /// Decides visibility with a callback.
    pub fn visible_func<F>(mut self, func: F) -> Self
    where
        F: Fn(&dyn TreeModel, &TreeIter) -> bool + Send + Sync + 'static,
    {
        self.visibility = Visibility::Func(Arc::new(func));
        self
    }

    /// Decides visibility by a boolean child column.
    pub fn visible_column(mut self, column: usize) -> Self {
        self.visibility = Visibility::Column(column);
        self
    }

    /// Replaces the child's columns with computed ones.
    pub fn modify_func<F>(mut self, types: &[ValueType], func: F) -> Self
    where
        F: Fn(&dyn TreeModel, &TreeIter, usize) -> Value + Send + Sync + 'static,
    {
        self.modify = Some((types.to_vec(), Arc::new(func)));
        self
    }

    /// Creates the filter.
    ///
    /// Fails if the virtual root does not name a child row or the visible
    /// column does not hold booleans.
    pub fn build(self) -> Result<Arc<TreeModelFilter>> {
        if let Some(root) = &self.virtual_root
            && (root.is_empty() || self.child.iter(root).is_none())
        {
            return Err(Error::invalid_virtual_root(root));
        }
        if let Visibility::Column(column) = self.visibility {
            check_visible_column(self.child.as_ref(), column)?;
        }
        let modify = self.modify.map(|(types, func)| Modify { types, func });
        Ok(TreeModelFilter::create(self.child, self.virtual_root, self.visibility, modify))
    }
}

impl std::fmt::Debug for TreeModelFilterBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeModelFilterBuilder")
            .field("virtual_root", &self.virtual_root)
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(TreeModelFilter: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RefCountStore;

    fn store_with(rows: &[(i64, bool)]) -> Arc<RefCountStore> {
        let store = Arc::new(RefCountStore::new(&[ValueType::Int, ValueType::Bool]));
        for &(value, visible) in rows {
            let row = store.store().append(None).unwrap();
            store
                .store()
                .set(&row, &[(0, value.into()), (1, visible.into())])
                .unwrap();
        }
        store
    }

    fn by_column(store: &Arc<RefCountStore>) -> Arc<TreeModelFilter> {
        TreeModelFilter::builder(store.clone())
            .visible_column(1)
            .build()
            .unwrap()
    }

    fn record_reorders(filter: &TreeModelFilter) -> Arc<Mutex<Vec<(TreePath, Vec<usize>)>>> {
        let orders = Arc::new(Mutex::new(Vec::new()));
        let seen = orders.clone();
        filter.signals().rows_reordered.connect(move |(path, _, order)| {
            seen.lock().push((path.clone(), order.clone()));
        });
        orders
    }

    fn root_values(model: &dyn TreeModel) -> Vec<i64> {
        (0..model.iter_n_children(None))
            .filter_map(|n| model.iter_nth_child(None, n))
            .filter_map(|iter| model.value(&iter, 0).as_int())
            .collect()
    }

    #[test]
    fn test_reorder_of_hidden_rows_is_silent() {
        let store = store_with(&[(0, true), (1, false), (2, true)]);
        let filter = by_column(&store);
        filter.iter_first().unwrap();
        let orders = record_reorders(&filter);

        store.store().reorder(None, &[0, 2, 1]).unwrap();
        assert!(orders.lock().is_empty());
        assert_eq!(root_values(filter.as_ref()), vec![0, 2]);
        assert_eq!(
            filter.convert_path_to_child_path(&TreePath::from([1])),
            Some(TreePath::from([1]))
        );
    }

    #[test]
    fn test_reorder_reports_visible_permutation() {
        let store = store_with(&[(0, true), (1, false), (2, true)]);
        let filter = by_column(&store);
        filter.iter_first().unwrap();
        let orders = record_reorders(&filter);

        store.store().reorder(None, &[2, 1, 0]).unwrap();
        assert_eq!(*orders.lock(), vec![(TreePath::new(), vec![1, 0])]);
        assert_eq!(root_values(filter.as_ref()), vec![2, 0]);
    }

    #[test]
    fn test_swap_moves_first_ref() {
        let store = store_with(&[(0, true), (1, true)]);
        let filter = by_column(&store);
        filter.iter_first().unwrap();

        let a = store.iter(&TreePath::from([0])).unwrap();
        let b = store.iter(&TreePath::from([1])).unwrap();
        store.store().swap(&a, &b).unwrap();

        let b = store.iter(&TreePath::from([0])).unwrap();
        let a = store.iter(&TreePath::from([1])).unwrap();
        assert_eq!(store.node_ref_count(&b), 1);
        assert_eq!(store.node_ref_count(&a), 0);

        drop(filter);
        store.assert_entire_model_unreferenced();
    }
}
