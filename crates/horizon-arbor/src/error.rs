//! Error types for tree models.

use crate::model::ValueType;

/// Result type alias for model operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when configuring or mutating tree models.
///
/// Change notifications never produce errors; these are returned only by
/// calls with a caller to report to, such as store mutation and proxy
/// configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// A column index outside the model's schema.
    #[error("column {column} is out of range for a model with {n_columns} columns")]
    InvalidColumn { column: usize, n_columns: usize },

    /// A value whose type does not match the column type.
    #[error("column {column} holds {expected:?} values, got {actual:?}")]
    TypeMismatch {
        column: usize,
        expected: ValueType,
        actual: ValueType,
    },

    /// An iterator that is stale or belongs to another model.
    #[error("iterator is not valid for this model")]
    InvalidIter,

    /// A path that could not be parsed or does not resolve.
    #[error("invalid tree path '{path}': {message}")]
    InvalidPath { path: String, message: String },

    /// A virtual root that does not name a row of the child model.
    #[error("virtual root '{path}' does not exist in the child model")]
    InvalidVirtualRoot { path: String },

    /// A reorder permutation of the wrong length or with repeated entries.
    #[error("invalid reorder: {message}")]
    InvalidReorder { message: String },

    /// A configuration option conflicting with one already in effect.
    #[error("invalid configuration: {message}")]
    Configuration { message: String },
}

impl Error {
    /// Create a column range error.
    pub fn invalid_column(column: usize, n_columns: usize) -> Self {
        Self::InvalidColumn { column, n_columns }
    }

    /// Create a type mismatch error.
    pub fn type_mismatch(column: usize, expected: ValueType, actual: ValueType) -> Self {
        Self::TypeMismatch {
            column,
            expected,
            actual,
        }
    }

    /// Create a path error.
    pub fn invalid_path(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a virtual root error.
    pub fn invalid_virtual_root(path: impl ToString) -> Self {
        Self::InvalidVirtualRoot {
            path: path.to_string(),
        }
    }

    /// Create a reorder error.
    pub fn invalid_reorder(message: impl Into<String>) -> Self {
        Self::InvalidReorder {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}
