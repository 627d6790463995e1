//! Observable tree models and the proxies layered on top of them.
//!
//! A [`TreeModel`] exposes rows addressed by [`TreePath`]s and
//! [`TreeIter`]s, and announces every structural change through its
//! [`ModelSignals`]. Consumers read rows on demand and take references
//! ([`TreeModel::ref_node`]) on the rows they keep on screen.
//!
//! # Model Implementations
//!
//! - [`TreeStore`]: the backing store, holding typed values per row
//! - [`RefCountStore`]: a store that records the references it receives
//! - [`TreeModelFilter`]: shows a subset of a child model's rows, optionally
//!   re-rooted at a virtual root and with computed columns
//! - [`TreeModelSort`]: shows a child model's rows in sorted order
//!
//! Proxies mirror their child lazily. A level of the child is only mirrored
//! once someone asks for it, and it stays cached while referenced. Every
//! proxy forwards references to the child rows it mirrors, so proxies can
//! be stacked in any order.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use horizon_arbor::model::{TreeModel, TreeModelFilter, TreePath, TreeStore, ValueType};
//!
//! let store = Arc::new(TreeStore::new(&[ValueType::Bool]));
//! for visible in [true, false, true] {
//!     let row = store.append(None).unwrap();
//!     store.set_value(&row, 0, visible.into()).unwrap();
//! }
//!
//! let filter = TreeModelFilter::builder(store.clone())
//!     .visible_column(0)
//!     .build()
//!     .unwrap();
//! assert_eq!(filter.iter_n_children(None), 2);
//!
//! let child = filter.convert_path_to_child_path(&TreePath::from([1])).unwrap();
//! assert_eq!(child, TreePath::from([2]));
//! ```
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────┐ signals ┌─────────────┐ signals ┌─────────────┐
//! │  TreeStore  │────────>│   Filter    │────────>│  Consumer   │
//! │             │<────────│   / Sort    │<────────│             │
//! └─────────────┘  refs   └─────────────┘  refs   └─────────────┘
//! ```

mod cache;
mod filter_model;
mod iter;
mod path;
mod ref_count;
mod row_reference;
mod sort_model;
mod traits;
mod tree_store;
mod value;

pub use filter_model::{ModifyFn, TreeModelFilter, TreeModelFilterBuilder, VisibleFn};
pub use iter::{TreeIter, next_stamp};
pub use path::TreePath;
pub use ref_count::RefCountStore;
pub use row_reference::RowReference;
pub use sort_model::{SortColumn, SortFunc, SortOrder, TreeModelSort, TreeModelSortBuilder};
pub use traits::{ModelFlags, ModelSignals, TreeModel};
pub use tree_store::TreeStore;
pub use value::{Value, ValueType, compare_values};
