//! Tests for the sorting proxy.

mod common;

use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use horizon_arbor::model::{
    SortColumn, SortOrder, TreeModel, TreeModelFilter, TreeModelSort, TreePath,
};

use common::{
    Event, SignalLog, changed, counted_store, counted_tree, deleted, init_tracing, inserted,
    level_values, root_values,
};

fn path(s: &str) -> TreePath {
    s.parse().unwrap()
}

fn ascending(model: Arc<dyn TreeModel>) -> Arc<TreeModelSort> {
    TreeModelSort::builder(model)
        .sort_column(SortColumn::Column(0), SortOrder::Ascending)
        .build()
        .unwrap()
}

#[test]
fn test_insert_lands_at_sorted_position() {
    init_tracing();
    let store = counted_store(&[(3, true), (1, true), (2, true)]);
    let sort = ascending(store.clone());
    assert_eq!(root_values(sort.as_ref()), vec![1, 2, 3]);

    let log = SignalLog::attach(sort.as_ref());
    store
        .store()
        .insert_with_values(None, 3, &[(0, 0.into()), (1, true.into())])
        .unwrap();

    assert_eq!(log.take(), vec![inserted("0")]);
    assert_eq!(root_values(sort.as_ref()), vec![0, 1, 2, 3]);
    assert_eq!(sort.convert_child_path_to_path(&path("3")), Some(path("0")));
}

#[test]
fn test_changed_value_reorders_then_reports_change() {
    let store = counted_store(&[(1, true), (2, true), (3, true)]);
    let sort = ascending(store.clone());
    sort.iter_first().unwrap();

    let log = SignalLog::attach(sort.as_ref());
    let first = store.iter_first().unwrap();
    store.store().set_value(&first, 0, 5.into()).unwrap();

    assert_eq!(
        log.take(),
        vec![Event::Reordered(String::new(), vec![1, 2, 0]), changed("2")]
    );
    assert_eq!(root_values(sort.as_ref()), vec![2, 3, 5]);
}

#[test]
fn test_change_keeping_order_does_not_reorder() {
    let store = counted_store(&[(1, true), (5, true), (9, true)]);
    let sort = ascending(store.clone());
    sort.iter_first().unwrap();

    let log = SignalLog::attach(sort.as_ref());
    let middle = store.iter(&path("1")).unwrap();
    store.store().set_value(&middle, 0, 6.into()).unwrap();
    assert_eq!(log.take(), vec![changed("1")]);
}

#[test]
fn test_deleted_row_reported_at_sorted_path() {
    let store = counted_store(&[(3, true), (1, true), (2, true)]);
    let sort = ascending(store.clone());
    sort.iter_first().unwrap();

    let log = SignalLog::attach(sort.as_ref());
    let two = store.iter(&path("2")).unwrap();
    store.store().remove(&two).unwrap();

    assert_eq!(log.take(), vec![deleted("1")]);
    assert_eq!(root_values(sort.as_ref()), vec![1, 3]);
}

#[test]
fn test_child_reorder_follows_when_unsorted() {
    let store = counted_store(&[(0, true), (1, true), (2, true)]);
    let sort = TreeModelSort::new(store.clone());
    sort.iter_first().unwrap();

    let log = SignalLog::attach(sort.as_ref());
    store.store().reorder(None, &[2, 0, 1]).unwrap();
    assert_eq!(
        log.take(),
        vec![Event::Reordered(String::new(), vec![2, 0, 1])]
    );
    assert_eq!(root_values(sort.as_ref()), vec![2, 0, 1]);
}

#[test]
fn test_child_reorder_ignored_when_sorted() {
    let store = counted_store(&[(0, true), (1, true), (2, true)]);
    let sort = ascending(store.clone());
    sort.iter_first().unwrap();

    let log = SignalLog::attach(sort.as_ref());
    store.store().reorder(None, &[2, 0, 1]).unwrap();
    assert_eq!(log.take(), vec![]);
    assert_eq!(root_values(sort.as_ref()), vec![0, 1, 2]);
    assert_eq!(sort.convert_path_to_child_path(&path("0")), Some(path("1")));
}

#[test]
fn test_nested_levels_sorted() {
    let store = counted_tree(2, 3);
    let sort = TreeModelSort::builder(store.clone())
        .sort_column(SortColumn::Column(0), SortOrder::Descending)
        .build()
        .unwrap();

    assert_eq!(root_values(sort.as_ref()), vec![1, 0]);
    let first = sort.iter_first().unwrap();
    assert_eq!(level_values(sort.as_ref(), Some(&first)), vec![12, 11, 10]);
    assert_eq!(sort.convert_child_path_to_path(&path("1:2")), Some(path("0:0")));
    assert_eq!(sort.convert_path_to_child_path(&path("1:0")), Some(path("0:2")));
}

#[test]
fn test_changing_sort_column_notifies() {
    let store = counted_store(&[(2, true), (1, true)]);
    let sort = TreeModelSort::new(store.clone());
    sort.iter_first().unwrap();

    let notified = Arc::new(AtomicUsize::new(0));
    let count = notified.clone();
    sort.sort_column_changed().connect(move |_| {
        count.fetch_add(1, AtomicOrdering::SeqCst);
    });
    let log = SignalLog::attach(sort.as_ref());

    sort.set_sort_column_id(SortColumn::Column(0), SortOrder::Ascending)
        .unwrap();
    sort.set_sort_column_id(SortColumn::Column(0), SortOrder::Ascending)
        .unwrap();
    assert_eq!(notified.load(AtomicOrdering::SeqCst), 1);
    assert_eq!(
        log.take(),
        vec![Event::Reordered(String::new(), vec![1, 0])]
    );
}

#[test]
fn test_default_sort_func_and_reset() {
    let store = counted_store(&[(1, true), (3, true), (2, true)]);
    let sort = TreeModelSort::new(store.clone());
    assert!(!sort.has_default_sort_func());
    assert_eq!(root_values(sort.as_ref()), vec![1, 3, 2]);

    sort.set_default_sort_func(|model, a, b| {
        let a = model.value(a, 0).as_int().unwrap_or_default();
        let b = model.value(b, 0).as_int().unwrap_or_default();
        b.cmp(&a)
    });
    assert!(sort.has_default_sort_func());
    assert_eq!(root_values(sort.as_ref()), vec![3, 2, 1]);

    sort.reset_default_sort_func();
    assert!(!sort.has_default_sort_func());
    assert_eq!(root_values(sort.as_ref()), vec![1, 3, 2]);
}

#[test]
fn test_equal_keys_keep_child_order() {
    let store = counted_store(&[(1, true), (0, true), (1, false), (0, false)]);
    let sort = TreeModelSort::builder(store.clone())
        .sort_column(SortColumn::Column(0), SortOrder::Ascending)
        .build()
        .unwrap();

    let children: Vec<TreePath> = (0..4)
        .filter_map(|n| sort.convert_path_to_child_path(&TreePath::from([n])))
        .collect();
    assert_eq!(
        children,
        vec![path("1"), path("3"), path("0"), path("2")]
    );
}

#[test]
fn test_sort_over_filter() {
    init_tracing();
    let store = counted_store(&[(4, true), (1, false), (3, true), (2, true)]);
    let filter: Arc<dyn TreeModel> = TreeModelFilter::builder(store.clone())
        .visible_column(1)
        .build()
        .unwrap();
    let sort = TreeModelSort::builder(filter)
        .sort_func(0, |model, a, b| {
            let a = model.value(a, 0).as_int().unwrap_or_default();
            let b = model.value(b, 0).as_int().unwrap_or_default();
            a.cmp(&b).then(Ordering::Equal)
        })
        .sort_column(SortColumn::Column(0), SortOrder::Ascending)
        .build()
        .unwrap();
    assert_eq!(root_values(sort.as_ref()), vec![2, 3, 4]);

    let log = SignalLog::attach(sort.as_ref());
    let hidden = store.iter(&path("1")).unwrap();
    store.store().set_value(&hidden, 1, true.into()).unwrap();
    assert_eq!(log.take(), vec![inserted("0")]);
    assert_eq!(root_values(sort.as_ref()), vec![1, 2, 3, 4]);

    let four = store.iter_first().unwrap();
    store.store().set_value(&four, 1, false.into()).unwrap();
    assert_eq!(log.take(), vec![deleted("3")]);

    drop(sort);
    store.assert_entire_model_unreferenced();
}

#[test]
fn test_stale_iter_rejected() {
    let store = counted_store(&[(2, true), (1, true)]);
    let sort = ascending(store.clone());
    let first = sort.iter_first().unwrap();
    assert!(sort.iter_is_valid(&first));

    store.store().append(None).unwrap();
    assert!(!sort.iter_is_valid(&first));
    assert_eq!(sort.path(&first), None);
}
