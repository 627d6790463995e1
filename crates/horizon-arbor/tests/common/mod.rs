//! Shared fixtures for the model integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use horizon_arbor::model::{RefCountStore, TreeIter, TreeModel, TreePath, ValueType};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

/// Routes `tracing` output through the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A change notification as a consumer saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Changed(String),
    Inserted(String),
    Toggled(String),
    Deleted(String),
    Reordered(String, Vec<usize>),
}

/// Records every signal a model emits, in order.
#[derive(Clone, Default)]
pub struct SignalLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl SignalLog {
    pub fn attach(model: &dyn TreeModel) -> Self {
        let log = Self::default();
        let signals = model.signals();

        let events = log.events.clone();
        signals.row_changed.connect(move |(path, _)| {
            events.lock().push(Event::Changed(path.to_string()));
        });
        let events = log.events.clone();
        signals.row_inserted.connect(move |(path, _)| {
            events.lock().push(Event::Inserted(path.to_string()));
        });
        let events = log.events.clone();
        signals.row_has_child_toggled.connect(move |(path, _)| {
            events.lock().push(Event::Toggled(path.to_string()));
        });
        let events = log.events.clone();
        signals.row_deleted.connect(move |path| {
            events.lock().push(Event::Deleted(path.to_string()));
        });
        let events = log.events.clone();
        signals.rows_reordered.connect(move |(path, _, order)| {
            events.lock().push(Event::Reordered(path.to_string(), order.clone()));
        });
        log
    }

    /// Drains the recorded events.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }
}

pub fn inserted(path: &str) -> Event {
    Event::Inserted(path.to_string())
}

pub fn deleted(path: &str) -> Event {
    Event::Deleted(path.to_string())
}

pub fn toggled(path: &str) -> Event {
    Event::Toggled(path.to_string())
}

pub fn changed(path: &str) -> Event {
    Event::Changed(path.to_string())
}

/// A counting store with an int and a bool column.
///
/// `rows` lists `(value, visible)` for the root rows.
pub fn counted_store(rows: &[(i64, bool)]) -> Arc<RefCountStore> {
    let store = Arc::new(RefCountStore::new(&[ValueType::Int, ValueType::Bool]));
    for &(value, visible) in rows {
        append(&store, None, value, visible);
    }
    store
}

pub fn append(store: &RefCountStore, parent: Option<&TreeIter>, value: i64, visible: bool) -> TreeIter {
    let row = store.store().append(parent).unwrap();
    store
        .store()
        .set(&row, &[(0, value.into()), (1, visible.into())])
        .unwrap();
    row
}

/// A store whose root rows each have `children` visible child rows.
pub fn counted_tree(roots: usize, children: usize) -> Arc<RefCountStore> {
    let store = counted_store(&[]);
    for r in 0..roots {
        let parent = append(&store, None, r as i64, true);
        for c in 0..children {
            append(&store, Some(&parent), (r * 10 + c) as i64, true);
        }
    }
    store
}

/// Int values of the root rows, as the model presents them.
pub fn root_values(model: &dyn TreeModel) -> Vec<i64> {
    level_values(model, None)
}

pub fn level_values(model: &dyn TreeModel, parent: Option<&TreeIter>) -> Vec<i64> {
    (0..model.iter_n_children(parent))
        .filter_map(|n| model.iter_nth_child(parent, n))
        .filter_map(|iter| model.value(&iter, 0).as_int())
        .collect()
}

/// Stands in for a view: references every row it shows and releases them
/// when dropped.
///
/// Rows are remembered by path, so the model must not change structure
/// while a view is attached.
pub struct ViewRefs {
    model: Arc<dyn TreeModel>,
    paths: Vec<TreePath>,
}

impl ViewRefs {
    /// References every root row.
    pub fn root_level(model: Arc<dyn TreeModel>) -> Self {
        let mut view = Self {
            model,
            paths: Vec::new(),
        };
        view.show_level(&TreePath::new());
        view
    }

    /// References every row of the model.
    pub fn expanded(model: Arc<dyn TreeModel>) -> Self {
        let mut view = Self::root_level(model);
        let mut index = 0;
        while index < view.paths.len() {
            let path = view.paths[index].clone();
            view.show_level(&path);
            index += 1;
        }
        view
    }

    /// References the children of the row at `parent`.
    pub fn show_level(&mut self, parent: &TreePath) {
        let parent_iter = if parent.is_empty() {
            None
        } else {
            self.model.iter(parent)
        };
        for n in 0..self.model.iter_n_children(parent_iter.as_ref()) {
            if let Some(iter) = self.model.iter_nth_child(parent_iter.as_ref(), n) {
                self.model.ref_node(&iter);
                self.paths.push(parent.child(n));
            }
        }
    }
}

impl Drop for ViewRefs {
    fn drop(&mut self) {
        for path in self.paths.iter().rev() {
            if let Some(iter) = self.model.iter(path) {
                self.model.unref_node(&iter);
            }
        }
    }
}
