//! Horizon Arbor - observable tree models with lazily cached proxies.
//!
//! This is the main crate. It re-exports the core signal and logging
//! support and provides the tree models under [`model`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use horizon_arbor::prelude::*;
//!
//! let store = Arc::new(TreeStore::new(&[ValueType::String]));
//! for name in ["pear", "apple", "fig"] {
//!     let row = store.append(None).unwrap();
//!     store.set_value(&row, 0, name.into()).unwrap();
//! }
//!
//! let sort = TreeModelSort::builder(store.clone())
//!     .sort_column(SortColumn::Column(0), SortOrder::Ascending)
//!     .build()
//!     .unwrap();
//! let first = sort.iter_first().unwrap();
//! assert_eq!(sort.value(&first, 0).as_str(), Some("apple"));
//! ```

pub use horizon_arbor_core::*;

pub mod error;
pub mod model;
pub mod prelude;

pub use error::{Error, Result};
