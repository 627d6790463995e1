//! Tests for the references proxies hold on their child rows.

mod common;

use std::sync::Arc;

use horizon_arbor::model::{TreeModel, TreeModelFilter, TreeModelSort, TreePath};

use common::{ViewRefs, counted_store, counted_tree, init_tracing};

fn path(s: &str) -> TreePath {
    s.parse().unwrap()
}

#[test]
fn test_filter_level_holds_first_row() {
    init_tracing();
    let store = counted_store(&[(0, true), (1, true), (2, true)]);
    let filter = TreeModelFilter::new(store.clone());
    store.assert_entire_model_unreferenced();

    filter.iter_first().unwrap();
    let rows: Vec<_> = (0..3).filter_map(|n| store.iter_nth_child(None, n)).collect();
    store.assert_node_ref_count(&rows[0], 1);
    store.assert_node_ref_count(&rows[1], 0);
    store.assert_node_ref_count(&rows[2], 0);

    drop(filter);
    store.assert_entire_model_unreferenced();
}

#[test]
fn test_view_refs_forwarded_to_child() {
    let store = counted_store(&[(0, true), (1, true), (2, true)]);
    let filter = TreeModelFilter::new(store.clone());

    let view = ViewRefs::root_level(filter.clone());
    let rows: Vec<_> = (0..3).filter_map(|n| store.iter_nth_child(None, n)).collect();
    store.assert_node_ref_count(&rows[0], 2);
    store.assert_node_ref_count(&rows[1], 1);
    store.assert_node_ref_count(&rows[2], 1);

    drop(view);
    store.assert_node_ref_count(&rows[0], 1);
    store.assert_node_ref_count(&rows[1], 0);

    drop(filter);
    store.assert_entire_model_unreferenced();
}

#[test]
fn test_first_ref_moves_when_first_row_hidden() {
    let store = counted_store(&[(0, true), (1, true), (2, true)]);
    let filter = TreeModelFilter::builder(store.clone())
        .visible_column(1)
        .build()
        .unwrap();
    filter.iter_first().unwrap();

    let first = store.iter_first().unwrap();
    store.store().set_value(&first, 1, false.into()).unwrap();

    let second = store.iter(&path("1")).unwrap();
    store.assert_node_ref_count(&first, 0);
    store.assert_node_ref_count(&second, 1);

    store.store().set_value(&first, 1, true.into()).unwrap();
    store.assert_node_ref_count(&first, 1);
    store.assert_node_ref_count(&second, 0);

    drop(filter);
    store.assert_entire_model_unreferenced();
}

#[test]
fn test_expanded_filter_keeps_monitored_levels() {
    init_tracing();
    let store = counted_tree(2, 2);
    let filter = TreeModelFilter::new(store.clone());

    let view = ViewRefs::expanded(filter.clone());
    let first = store.iter(&path("0")).unwrap();
    let second = store.iter(&path("1")).unwrap();
    store.assert_node_ref_count(&first, 3);
    store.assert_node_ref_count(&second, 2);
    store.assert_node_ref_count(&store.iter(&path("0:0")).unwrap(), 2);
    store.assert_node_ref_count(&store.iter(&path("0:1")).unwrap(), 1);

    drop(view);
    filter.clear_cache();
    // Levels below the root stay cached to watch for visibility changes.
    store.assert_node_ref_count(&first, 2);
    store.assert_node_ref_count(&second, 1);
    store.assert_node_ref_count(&store.iter(&path("0:0")).unwrap(), 1);
    store.assert_node_ref_count(&store.iter(&path("1:0")).unwrap(), 1);
    store.assert_node_ref_count(&store.iter(&path("1:1")).unwrap(), 0);

    drop(filter);
    store.assert_entire_model_unreferenced();
}

#[test]
fn test_sort_clear_cache_frees_unreferenced_levels() {
    let store = counted_tree(2, 2);
    let sort = TreeModelSort::new(store.clone());

    let view = ViewRefs::expanded(sort.clone());
    let first = store.iter(&path("0")).unwrap();
    store.assert_node_ref_count(&first, 3);
    store.assert_node_ref_count(&store.iter(&path("1:0")).unwrap(), 2);
    store.assert_node_ref_count(&store.iter(&path("1:1")).unwrap(), 1);

    drop(view);
    sort.clear_cache();
    store.assert_node_ref_count(&first, 1);
    store.assert_node_ref_count(&store.iter(&path("1")).unwrap(), 0);
    store.assert_level_unreferenced(&first);

    drop(sort);
    store.assert_entire_model_unreferenced();
}

#[test]
fn test_stacked_proxies_release_everything() {
    init_tracing();
    let store = counted_tree(3, 2);
    let filter: Arc<dyn TreeModel> = TreeModelFilter::new(store.clone());
    let sort = TreeModelSort::new(filter);

    let view = ViewRefs::expanded(sort.clone());
    store.assert_not_entire_model_referenced(0);
    drop(view);
    drop(sort);
    store.assert_entire_model_unreferenced();
}

#[test]
fn test_deleting_referenced_row_releases_descendants() {
    let store = counted_tree(2, 2);
    let filter = TreeModelFilter::new(store.clone());
    let row = filter.iter(&path("1:1")).unwrap();
    filter.ref_node(&row);

    let parent = store.iter(&path("1")).unwrap();
    store.store().remove(&parent).unwrap();

    filter.clear_cache();
    drop(filter);
    store.assert_entire_model_unreferenced();
}

#[test]
fn test_virtual_root_refs_released_on_drop() {
    let store = counted_tree(2, 2);
    let filter = TreeModelFilter::builder(store.clone())
        .virtual_root(path("1"))
        .build()
        .unwrap();
    let view = ViewRefs::root_level(filter.clone());

    let children = store.iter(&path("1")).unwrap();
    store.assert_node_ref_count(&store.iter(&path("1:0")).unwrap(), 2);
    store.assert_node_ref_count(&store.iter(&path("1:1")).unwrap(), 1);
    assert!(store.node_ref_count(&children) >= 1);

    drop(view);
    drop(filter);
    store.assert_entire_model_unreferenced();
}

#[test]
fn test_dump_cache_lists_cached_rows() {
    let store = counted_store(&[(0, true), (1, false)]);
    let filter = TreeModelFilter::builder(store.clone())
        .visible_column(1)
        .build()
        .unwrap();
    filter.iter_first().unwrap();

    let dump = filter.dump_cache(Default::default());
    assert!(dump.contains("TreeModelFilter cache"));
    assert!(dump.contains("refs=1"));
}

fn child_counts(store: &horizon_arbor::model::RefCountStore) -> Vec<usize> {
    (0..store.iter_n_children(None))
        .filter_map(|n| store.iter_nth_child(None, n))
        .map(|row| store.node_ref_count(&row))
        .collect()
}

#[test]
fn test_swap_hands_first_ref_to_new_first_row() {
    let store = counted_store(&[(0, true), (1, true), (2, true)]);
    let filter = TreeModelFilter::new(store.clone());
    let view = ViewRefs::root_level(filter.clone());
    assert_eq!(child_counts(&store), vec![2, 1, 1]);

    let a = store.iter(&path("0")).unwrap();
    let b = store.iter(&path("1")).unwrap();
    store.store().swap(&a, &b).unwrap();
    assert_eq!(child_counts(&store), vec![2, 1, 1]);
    let b = store.iter(&path("0")).unwrap();
    assert_eq!(store.value(&b, 0).as_int(), Some(1));

    drop(view);
    assert_eq!(child_counts(&store), vec![1, 0, 0]);
    drop(filter);
    store.assert_entire_model_unreferenced();
}

#[test]
fn test_reorder_moves_first_ref_off_hidden_row() {
    init_tracing();
    let store = counted_store(&[(0, false), (1, true), (2, true), (3, true)]);
    let filter = TreeModelFilter::builder(store.clone())
        .visible_column(1)
        .build()
        .unwrap();
    let view = ViewRefs::root_level(filter.clone());
    assert_eq!(child_counts(&store), vec![1, 1, 1, 1]);

    store.store().reorder(None, &[2, 3, 0, 1]).unwrap();
    assert_eq!(child_counts(&store), vec![2, 1, 0, 1]);

    drop(view);
    assert_eq!(child_counts(&store), vec![1, 0, 0, 0]);
    drop(filter);
    store.assert_entire_model_unreferenced();
}

#[test]
fn test_first_row_need_not_be_at_offset_zero() {
    let store = counted_store(&[(0, false), (1, true), (2, false)]);
    let filter = TreeModelFilter::builder(store.clone())
        .visible_column(1)
        .build()
        .unwrap();
    filter.iter_first().unwrap();
    assert_eq!(child_counts(&store), vec![1, 0, 0]);

    // The uncached hidden row lands in front of every cached one.
    store.store().reorder(None, &[2, 1, 0]).unwrap();
    assert_eq!(child_counts(&store), vec![0, 1, 0]);
    assert_eq!(filter.convert_path_to_child_path(&path("0")), Some(path("1")));

    let leading = store.iter_first().unwrap();
    store.store().set_value(&leading, 1, true.into()).unwrap();
    assert_eq!(child_counts(&store), vec![1, 0, 0]);
    assert_eq!(filter.convert_path_to_child_path(&path("0")), Some(path("0")));

    drop(filter);
    store.assert_entire_model_unreferenced();
}
