//! Prelude module for Horizon Arbor.
//!
//! This module re-exports the most commonly used types for convenient importing:
//!
//! ```
//! use horizon_arbor::prelude::*;
//! ```

pub use crate::error::{Error, Result};
pub use crate::model::{
    RowReference, SortColumn, SortOrder, TreeIter, TreeModel, TreeModelFilter, TreeModelSort,
    TreePath, TreeStore, Value, ValueType,
};
pub use horizon_arbor_core::{ConnectionId, Signal};
