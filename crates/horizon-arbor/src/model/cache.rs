//! The level cache shared by the filter and sort proxies.
//!
//! A proxy mirrors only the parts of its child model that somebody looked
//! at. Each mirrored set of siblings is a [`Level`]; each mirrored row is an
//! [`Elt`] that remembers its `offset` (index among the child model's
//! siblings) and, once expanded, the level holding its children.
//!
//! # Reference Accounting
//!
//! Every elt carries two counts. `ref_count` covers all references,
//! including the ones the proxy takes for itself; `ext_ref_count` covers
//! only those taken by consumers through
//! [`TreeModel::ref_node`](super::TreeModel::ref_node). Each reference on an
//! elt is forwarded to the mirrored child row, so the child sees exactly one
//! reference per proxy reference.
//!
//! The proxy takes two kinds of internal references:
//!
//! - A child level references its parent elt for as long as it exists.
//! - Every level references its first elt. When a different elt becomes
//!   first, the reference moves with [`Cache::transfer_first_ref`]. This is
//!   what keeps the first child of an expanded row referenced in the child
//!   model, so the child keeps reporting its `has_child_toggled` changes.
//!
//! Levels with no external references are candidates for release. Each elt
//! counts the unreferenced levels below it (`zero_ref_count`) so that
//! [`Cache::clear_cache`] only walks the branches that hold some.

use std::sync::{Arc, Weak};

use slotmap::{SlotMap, new_key_type};

use horizon_arbor_core::ConnectionId;
use horizon_arbor_core::logging::{DumpEntry, TreeDump, TreeFormatOptions, targets};

use super::iter::{TreeIter, next_stamp};
use super::path::TreePath;
use super::traits::TreeModel;

new_key_type! {
    /// Arena key of a cached level.
    pub(crate) struct LevelId;

    /// Arena key of a cached element.
    pub(crate) struct EltId;
}

/// A cached set of siblings.
#[derive(Debug)]
pub(crate) struct Level {
    /// Elements in proxy order. The filter keeps them sorted by offset.
    pub(crate) elts: Vec<EltId>,
    pub(crate) ref_count: usize,
    pub(crate) ext_ref_count: usize,
    /// The elt whose children this level mirrors, `None` for the root level.
    pub(crate) parent_elt: Option<EltId>,
    pub(crate) parent_level: Option<LevelId>,
}

/// A cached row.
#[derive(Debug)]
pub(crate) struct Elt {
    pub(crate) level: LevelId,
    /// Index of the mirrored row among its siblings in the child model.
    pub(crate) offset: usize,
    pub(crate) ref_count: usize,
    pub(crate) ext_ref_count: usize,
    /// Number of unreferenced levels somewhere below this elt.
    pub(crate) zero_ref_count: usize,
    pub(crate) children: Option<LevelId>,
    /// Whether consumers can see the row. Always `true` in the sort proxy.
    pub(crate) visible: bool,
}

/// Which unreferenced levels [`Cache::clear_cache`] may release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retention {
    /// Keep levels directly below the root or below a referenced level.
    /// Their rows must stay monitored to report `has_child_toggled`.
    MonitorParents,
    /// Release every unreferenced level except the root.
    ReferencedOnly,
}

/// Arena of cached levels plus the child model they mirror.
pub(crate) struct Cache {
    child: Arc<dyn TreeModel>,
    virtual_root: Option<TreePath>,
    retention: Retention,
    pub(crate) levels: SlotMap<LevelId, Level>,
    pub(crate) elts: SlotMap<EltId, Elt>,
    pub(crate) root: Option<LevelId>,
    /// Number of unreferenced levels other than the root.
    zero_ref_count: usize,
    stamp: u64,
}

impl Cache {
    pub(crate) fn new(
        child: Arc<dyn TreeModel>,
        virtual_root: Option<TreePath>,
        retention: Retention,
    ) -> Self {
        Self {
            child,
            virtual_root,
            retention,
            levels: SlotMap::with_key(),
            elts: SlotMap::with_key(),
            root: None,
            zero_ref_count: 0,
            stamp: next_stamp(),
        }
    }

    pub(crate) fn child(&self) -> &Arc<dyn TreeModel> {
        &self.child
    }

    pub(crate) fn virtual_root(&self) -> Option<&TreePath> {
        self.virtual_root.as_ref()
    }

    pub(crate) fn virtual_root_mut(&mut self) -> Option<&mut TreePath> {
        self.virtual_root.as_mut()
    }

    pub(crate) fn zero_ref_count(&self) -> usize {
        self.zero_ref_count
    }

    // -------------------------------------------------------------------------
    // Iterators and paths
    // -------------------------------------------------------------------------

    pub(crate) fn iter_for(&self, elt: EltId) -> TreeIter {
        TreeIter::from_keys(self.stamp, self.elts[elt].level, elt)
    }

    /// Resolves an iterator issued by this cache, rejecting stale ones.
    pub(crate) fn decode(&self, iter: &TreeIter) -> Option<EltId> {
        if iter.stamp() != self.stamp {
            return None;
        }
        let level: LevelId = iter.level_key();
        let elt: EltId = iter.node_key();
        let entry = self.elts.get(elt)?;
        (entry.level == level && self.levels.contains_key(level)).then_some(elt)
    }

    /// Path of the mirrored row in the child model.
    pub(crate) fn child_path(&self, elt: EltId) -> TreePath {
        let mut indices = Vec::new();
        let mut current = Some(elt);
        while let Some(id) = current {
            let entry = &self.elts[id];
            indices.push(entry.offset);
            current = self.levels[entry.level].parent_elt;
        }
        indices.reverse();
        let relative = TreePath::from_indices(indices);
        match &self.virtual_root {
            Some(root) => root.join(&relative),
            None => relative,
        }
    }

    pub(crate) fn child_iter(&self, elt: EltId) -> Option<TreeIter> {
        self.child.iter(&self.child_path(elt))
    }

    /// Child iterator of the row whose children the root level mirrors.
    ///
    /// The outer `None` means the virtual root no longer resolves; the inner
    /// `None` stands for the top of the child model.
    pub(crate) fn root_parent_iter(&self) -> Option<Option<TreeIter>> {
        match &self.virtual_root {
            Some(root) => self.child.iter(root).map(Some),
            None => Some(None),
        }
    }

    /// Child iterator of the row whose children `level` mirrors.
    pub(crate) fn level_parent_iter(&self, level: LevelId) -> Option<Option<TreeIter>> {
        match self.levels[level].parent_elt {
            Some(elt) => self.child_iter(elt).map(Some),
            None => self.root_parent_iter(),
        }
    }

    /// Proxy path of `elt`, or `None` if it or an ancestor is hidden.
    pub(crate) fn path_of(&self, elt: EltId) -> Option<TreePath> {
        let mut indices = Vec::new();
        let mut current = Some(elt);
        while let Some(id) = current {
            indices.push(self.visible_position(id)?);
            current = self.levels[self.elts[id].level].parent_elt;
        }
        indices.reverse();
        Some(TreePath::from_indices(indices))
    }

    /// Index of `elt` among the visible elts of its level.
    pub(crate) fn visible_position(&self, elt: EltId) -> Option<usize> {
        if !self.elts[elt].visible {
            return None;
        }
        let level = &self.levels[self.elts[elt].level];
        Some(
            level
                .elts
                .iter()
                .take_while(|&&id| id != elt)
                .filter(|&&id| self.elts[id].visible)
                .count(),
        )
    }

    /// Index of `elt` in its level, hidden elts included.
    pub(crate) fn position(&self, elt: EltId) -> usize {
        let level = &self.levels[self.elts[elt].level];
        level.elts.iter().position(|&id| id == elt).unwrap_or(level.elts.len())
    }

    /// Returns `true` if `elt` and all of its ancestors are visible.
    pub(crate) fn visible_in_proxy(&self, elt: EltId) -> bool {
        let mut current = Some(elt);
        while let Some(id) = current {
            if !self.elts[id].visible {
                return false;
            }
            current = self.levels[self.elts[id].level].parent_elt;
        }
        true
    }

    pub(crate) fn visible_count(&self, level: LevelId) -> usize {
        self.levels[level]
            .elts
            .iter()
            .filter(|&&id| self.elts[id].visible)
            .count()
    }

    pub(crate) fn nth_visible(&self, level: LevelId, n: usize) -> Option<EltId> {
        self.levels[level]
            .elts
            .iter()
            .copied()
            .filter(|&id| self.elts[id].visible)
            .nth(n)
    }

    pub(crate) fn next_visible(&self, elt: EltId) -> Option<EltId> {
        let level = &self.levels[self.elts[elt].level];
        let position = self.position(elt);
        level.elts[position + 1..]
            .iter()
            .copied()
            .find(|&id| self.elts[id].visible)
    }

    pub(crate) fn previous_visible(&self, elt: EltId) -> Option<EltId> {
        let level = &self.levels[self.elts[elt].level];
        let position = self.position(elt);
        level.elts[..position]
            .iter()
            .rev()
            .copied()
            .find(|&id| self.elts[id].visible)
    }

    /// Finds the elt mirroring child row `offset` in `level`.
    pub(crate) fn find_offset(&self, level: LevelId, offset: usize) -> Option<EltId> {
        self.levels[level]
            .elts
            .iter()
            .copied()
            .find(|&id| self.elts[id].offset == offset)
    }

    // -------------------------------------------------------------------------
    // Structure
    // -------------------------------------------------------------------------

    /// Creates an empty level below `parent` (or the root level).
    ///
    /// The caller is responsible for the reference on `parent`.
    pub(crate) fn new_level(&mut self, parent: Option<EltId>) -> LevelId {
        let parent_level = parent.map(|elt| self.elts[elt].level);
        let level = self.levels.insert(Level {
            elts: Vec::new(),
            ref_count: 0,
            ext_ref_count: 0,
            parent_elt: parent,
            parent_level,
        });
        match parent {
            Some(elt) => self.elts[elt].children = Some(level),
            None => self.root = Some(level),
        }
        self.adjust_zero_refs(level, true);
        level
    }

    /// Appends an unreferenced elt. Used while a level is being built.
    pub(crate) fn push_elt(&mut self, level: LevelId, offset: usize, visible: bool) -> EltId {
        let elt = self.alloc_elt(level, offset, visible);
        self.levels[level].elts.push(elt);
        elt
    }

    /// Inserts an elt at `index` of a built level, moving the first-elt
    /// reference if the new elt lands in front.
    pub(crate) fn insert_elt(
        &mut self,
        level: LevelId,
        index: usize,
        offset: usize,
        visible: bool,
    ) -> EltId {
        let elt = self.alloc_elt(level, offset, visible);
        let elts = &mut self.levels[level].elts;
        elts.insert(index, elt);
        if index == 0 && elts.len() > 1 {
            let previous = elts[1];
            self.transfer_first_ref(previous, elt);
        }
        elt
    }

    fn alloc_elt(&mut self, level: LevelId, offset: usize, visible: bool) -> EltId {
        self.elts.insert(Elt {
            level,
            offset,
            ref_count: 0,
            ext_ref_count: 0,
            zero_ref_count: 0,
            children: None,
            visible,
        })
    }

    /// Unlinks `elt` from its level and drops it. References must be gone.
    pub(crate) fn forget_elt(&mut self, elt: EltId) {
        let level = self.elts[elt].level;
        self.levels[level].elts.retain(|&id| id != elt);
        self.elts.remove(elt);
    }

    /// Shifts offsets to account for a child row inserted at `offset`.
    pub(crate) fn shift_for_insert(&mut self, level: LevelId, offset: usize) {
        for &id in &self.levels[level].elts {
            let entry = &mut self.elts[id];
            if entry.offset >= offset {
                entry.offset += 1;
            }
        }
    }

    /// Shifts offsets to account for the child row at `offset` going away.
    pub(crate) fn shift_for_delete(&mut self, level: LevelId, offset: usize) {
        for &id in &self.levels[level].elts {
            let entry = &mut self.elts[id];
            if entry.offset > offset {
                entry.offset -= 1;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reference counting
    // -------------------------------------------------------------------------

    fn adjust_zero_refs(&mut self, level: LevelId, unreferenced: bool) {
        let mut current = level;
        while let Some(parent_level) = self.levels[current].parent_level {
            if let Some(parent_elt) = self.levels[current].parent_elt {
                let count = &mut self.elts[parent_elt].zero_ref_count;
                if unreferenced {
                    *count += 1;
                } else {
                    *count -= 1;
                }
            }
            current = parent_level;
        }
        if Some(level) != self.root {
            if unreferenced {
                self.zero_ref_count += 1;
            } else {
                self.zero_ref_count -= 1;
            }
        }
    }

    /// Takes a reference on `elt` and on the child row it mirrors.
    pub(crate) fn ref_elt(&mut self, elt: EltId, external: bool) {
        if let Some(iter) = self.child_iter(elt) {
            self.child.ref_node(&iter);
        }

        let level = self.elts[elt].level;
        let entry = &mut self.elts[elt];
        entry.ref_count += 1;
        if external {
            entry.ext_ref_count += 1;
        }

        let level_entry = &mut self.levels[level];
        level_entry.ref_count += 1;
        if external {
            level_entry.ext_ref_count += 1;
            if level_entry.ext_ref_count == 1 {
                self.adjust_zero_refs(level, false);
            }
        }
    }

    /// Releases a reference on `elt`.
    ///
    /// With `propagate`, the reference on the mirrored child row is released
    /// too; callers pass `false` when that row no longer exists.
    ///
    /// # Panics
    ///
    /// Panics if `elt` holds no reference of the requested kind.
    pub(crate) fn unref_elt(&mut self, elt: EltId, external: bool, propagate: bool) {
        let entry = &self.elts[elt];
        assert!(entry.ref_count > 0, "unref of a row that holds no reference");
        assert!(
            !external || entry.ext_ref_count > 0,
            "unref of a row that holds no external reference"
        );

        if propagate && let Some(iter) = self.child_iter(elt) {
            self.child.unref_node(&iter);
        }

        let level = self.elts[elt].level;
        let entry = &mut self.elts[elt];
        entry.ref_count -= 1;
        if external {
            entry.ext_ref_count -= 1;
        }

        let level_entry = &mut self.levels[level];
        level_entry.ref_count -= 1;
        if external {
            level_entry.ext_ref_count -= 1;
            if level_entry.ext_ref_count == 0 {
                self.adjust_zero_refs(level, true);
            }
        }
    }

    /// Drops every external reference held on `elt`.
    pub(crate) fn release_external(&mut self, elt: EltId, propagate: bool) {
        while self.elts[elt].ext_ref_count > 0 {
            self.unref_elt(elt, true, propagate);
        }
    }

    /// Drops internal references on `elt` until `keep` remain.
    pub(crate) fn release_down_to(&mut self, elt: EltId, keep: usize, propagate: bool) {
        while self.elts[elt].ref_count > keep {
            self.unref_elt(elt, false, propagate);
        }
    }

    /// Moves the first-elt reference from `from` to `to`.
    ///
    /// The new reference is taken before the old one is dropped so the
    /// level never sits without one.
    pub(crate) fn transfer_first_ref(&mut self, from: EltId, to: EltId) {
        if from == to {
            return;
        }
        self.ref_elt(to, false);
        self.unref_elt(from, false, true);
    }

    /// Releases `level` and everything below it.
    ///
    /// - `unref_self` drops the first-elt references, forwarding them to the
    ///   child model.
    /// - `unref_parent` forwards the release of the parent elt's reference.
    /// - `unref_external` also drops consumer references still held.
    pub(crate) fn free_level(
        &mut self,
        level: LevelId,
        unref_self: bool,
        unref_parent: bool,
        unref_external: bool,
    ) {
        let elts = self.levels[level].elts.clone();
        for &elt in &elts {
            if let Some(children) = self.elts[elt].children {
                self.free_level(children, unref_self, unref_self && unref_parent, unref_external);
            }
            if unref_external {
                self.release_external(elt, unref_self);
            }
        }

        if unref_self && let Some(&first) = elts.first() {
            self.unref_elt(first, false, true);
        }

        if self.levels[level].ext_ref_count == 0 {
            self.adjust_zero_refs(level, false);
        }

        match self.levels[level].parent_elt {
            Some(parent) => {
                self.unref_elt(parent, false, unref_parent);
                self.elts[parent].children = None;
            }
            None => {
                self.root = None;
                self.zero_ref_count = 0;
            }
        }

        for elt in elts {
            self.elts.remove(elt);
        }
        self.levels.remove(level);
    }

    /// Invalidates outstanding iterators and releases unreferenced levels.
    pub(crate) fn increment_stamp(&mut self) {
        self.stamp = next_stamp();
        self.clear_cache();
    }

    /// Invalidates outstanding iterators without touching the cache.
    pub(crate) fn bump_stamp(&mut self) {
        self.stamp = next_stamp();
    }

    /// Releases every level nobody holds a reference in.
    pub(crate) fn clear_cache(&mut self) {
        if self.zero_ref_count == 0 {
            return;
        }
        if let Some(root) = self.root {
            self.clear_cache_helper(root);
        }
        tracing::trace!(
            target: targets::CACHE,
            levels = self.levels.len(),
            unreferenced = self.zero_ref_count,
            "cache cleared"
        );
    }

    fn clear_cache_helper(&mut self, level: LevelId) {
        let elts = self.levels[level].elts.clone();
        for elt in elts {
            if self.elts[elt].zero_ref_count > 0
                && let Some(children) = self.elts[elt].children
            {
                self.clear_cache_helper(children);
            }
        }

        let entry = &self.levels[level];
        if entry.ext_ref_count > 0 || Some(level) == self.root {
            return;
        }
        let release = match self.retention {
            Retention::ReferencedOnly => true,
            Retention::MonitorParents => entry
                .parent_level
                .is_some_and(|parent| Some(parent) != self.root && self.levels[parent].ext_ref_count == 0),
        };
        if release {
            self.free_level(level, true, true, false);
        }
    }

    // -------------------------------------------------------------------------
    // Debugging
    // -------------------------------------------------------------------------

    /// Renders the cached levels as a tree.
    pub(crate) fn dump(&self, title: &str, options: TreeFormatOptions) -> String {
        let roots = match self.root {
            Some(root) => self.dump_level(root, &options),
            None => Vec::new(),
        };
        TreeDump::with_options(options).format(title, &roots)
    }

    fn dump_level(&self, level: LevelId, options: &TreeFormatOptions) -> Vec<DumpEntry> {
        self.levels[level]
            .elts
            .iter()
            .filter(|&&id| options.show_hidden || self.elts[id].visible)
            .map(|&id| {
                let elt = &self.elts[id];
                let mut label = String::from("row");
                if options.show_offsets {
                    label.push_str(&format!(" @{}", elt.offset));
                }
                if options.show_counts {
                    label.push_str(&format!(" refs={} ext={}", elt.ref_count, elt.ext_ref_count));
                }
                if !elt.visible {
                    label.push_str(" (hidden)");
                }
                let mut entry = DumpEntry::new(label);
                if let Some(children) = elt.children {
                    for child in self.dump_level(children, options) {
                        entry.push_child(child);
                    }
                }
                entry
            })
            .collect()
    }
}

/// Receiver of the child model's change notifications.
///
/// Paths and iterators are in the child model's coordinates.
pub(crate) trait ChildListener: Send + Sync + 'static {
    fn child_row_changed(&self, path: &TreePath, iter: &TreeIter);
    fn child_row_inserted(&self, path: &TreePath, iter: &TreeIter);
    fn child_row_has_child_toggled(&self, path: &TreePath, iter: &TreeIter);
    fn child_row_deleted(&self, path: &TreePath);
    fn child_rows_reordered(&self, path: &TreePath, iter: Option<&TreeIter>, new_order: &[usize]);
}

/// Connections from a proxy to its child model's signals.
///
/// Slots hold the proxy weakly; a proxy being dropped ignores late signals.
pub(crate) struct ChildConnections {
    changed: ConnectionId,
    inserted: ConnectionId,
    toggled: ConnectionId,
    deleted: ConnectionId,
    reordered: ConnectionId,
}

impl ChildConnections {
    pub(crate) fn connect<L: ChildListener>(child: &dyn TreeModel, listener: Weak<L>) -> Self {
        let signals = child.signals();

        let weak = listener.clone();
        let changed = signals.row_changed.connect(move |(path, iter)| {
            if let Some(listener) = weak.upgrade() {
                listener.child_row_changed(path, iter);
            }
        });
        let weak = listener.clone();
        let inserted = signals.row_inserted.connect(move |(path, iter)| {
            if let Some(listener) = weak.upgrade() {
                listener.child_row_inserted(path, iter);
            }
        });
        let weak = listener.clone();
        let toggled = signals.row_has_child_toggled.connect(move |(path, iter)| {
            if let Some(listener) = weak.upgrade() {
                listener.child_row_has_child_toggled(path, iter);
            }
        });
        let weak = listener.clone();
        let deleted = signals.row_deleted.connect(move |path| {
            if let Some(listener) = weak.upgrade() {
                listener.child_row_deleted(path);
            }
        });
        let weak = listener;
        let reordered = signals.rows_reordered.connect(move |(path, iter, new_order)| {
            if let Some(listener) = weak.upgrade() {
                listener.child_rows_reordered(path, iter.as_ref(), new_order);
            }
        });

        Self {
            changed,
            inserted,
            toggled,
            deleted,
            reordered,
        }
    }

    pub(crate) fn disconnect(&self, child: &dyn TreeModel) {
        let signals = child.signals();
        signals.row_changed.disconnect(self.changed);
        signals.row_inserted.disconnect(self.inserted);
        signals.row_has_child_toggled.disconnect(self.toggled);
        signals.row_deleted.disconnect(self.deleted);
        signals.rows_reordered.disconnect(self.reordered);
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("levels", &self.levels.len())
            .field("elts", &self.elts.len())
            .field("zero_ref_count", &self.zero_ref_count)
            .field("virtual_root", &self.virtual_root)
            .finish()
    }
}
