//! Tree paths for addressing rows by position.
//!
//! A `TreePath` is the list of child indices leading from a model's root to
//! a row. Paths are plain values: they do not track the row when the model
//! changes. Use [`RowReference`](super::RowReference) for that.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// The position of a row as a sequence of sibling indices.
///
/// The empty path denotes the (invisible) root itself. Paths order
/// lexicographically, so a parent sorts before its children and earlier
/// siblings before later ones.
///
/// # Example
///
/// ```
/// use horizon_arbor::model::TreePath;
///
/// let path: TreePath = "2:0:1".parse().unwrap();
/// assert_eq!(path.depth(), 3);
/// assert_eq!(path.indices(), &[2, 0, 1]);
/// assert_eq!(path.to_string(), "2:0:1");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreePath {
    indices: Vec<usize>,
}

impl TreePath {
    /// Creates the empty path.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the path `"0"`.
    pub fn first() -> Self {
        Self { indices: vec![0] }
    }

    /// Creates a path from a list of indices.
    pub fn from_indices(indices: impl Into<Vec<usize>>) -> Self {
        Self {
            indices: indices.into(),
        }
    }

    /// Number of indices in the path.
    #[inline]
    pub fn depth(&self) -> usize {
        self.indices.len()
    }

    /// Returns `true` for the empty path.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// The indices from the root downward.
    #[inline]
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Mutable access to the indices.
    #[inline]
    pub fn indices_mut(&mut self) -> &mut [usize] {
        &mut self.indices
    }

    /// The last index, if any.
    #[inline]
    pub fn last(&self) -> Option<usize> {
        self.indices.last().copied()
    }

    /// Appends a child index.
    pub fn append_index(&mut self, index: usize) {
        self.indices.push(index);
    }

    /// Prepends an index, making the path one level deeper at the top.
    pub fn prepend_index(&mut self, index: usize) {
        self.indices.insert(0, index);
    }

    /// Moves to the parent. Returns `false` if the path was already empty.
    pub fn up(&mut self) -> bool {
        self.indices.pop().is_some()
    }

    /// Moves to the first child.
    pub fn down(&mut self) {
        self.indices.push(0);
    }

    /// Moves to the next sibling. Does not check that it exists.
    pub fn next(&mut self) {
        if let Some(last) = self.indices.last_mut() {
            *last += 1;
        }
    }

    /// Moves to the previous sibling. Returns `false` at index 0.
    pub fn prev(&mut self) -> bool {
        match self.indices.last_mut() {
            Some(last) if *last > 0 => {
                *last -= 1;
                true
            }
            _ => false,
        }
    }

    /// Returns the parent path.
    pub fn parent(&self) -> TreePath {
        let mut parent = self.clone();
        parent.up();
        parent
    }

    /// Returns the path of the child at `index`.
    pub fn child(&self, index: usize) -> TreePath {
        let mut child = self.clone();
        child.append_index(index);
        child
    }

    /// Returns `true` if `descendant` lies strictly below this path.
    pub fn is_ancestor(&self, descendant: &TreePath) -> bool {
        descendant.depth() > self.depth() && descendant.indices.starts_with(&self.indices)
    }

    /// Returns `true` if this path lies strictly below `ancestor`.
    pub fn is_descendant(&self, ancestor: &TreePath) -> bool {
        ancestor.is_ancestor(self)
    }

    /// Strips `prefix` from the front of this path.
    ///
    /// Returns `None` unless `prefix` is a strict ancestor.
    pub fn strip_prefix(&self, prefix: &TreePath) -> Option<TreePath> {
        if !prefix.is_ancestor(self) {
            return None;
        }
        Some(TreePath::from_indices(&self.indices[prefix.depth()..]))
    }

    /// Concatenates `suffix` onto this path.
    pub fn join(&self, suffix: &TreePath) -> TreePath {
        let mut indices = self.indices.clone();
        indices.extend_from_slice(&suffix.indices);
        TreePath { indices }
    }

    /// The leading `depth` indices.
    pub fn truncated(&self, depth: usize) -> TreePath {
        TreePath::from_indices(&self.indices[..depth.min(self.depth())])
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, index) in self.indices.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{}", index)?;
        }
        Ok(())
    }
}

impl FromStr for TreePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::invalid_path(s, "path is empty"));
        }
        let indices = s
            .split(':')
            .map(|part| {
                part.trim()
                    .parse::<usize>()
                    .map_err(|_| Error::invalid_path(s, format!("'{}' is not an index", part)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { indices })
    }
}

impl From<Vec<usize>> for TreePath {
    fn from(indices: Vec<usize>) -> Self {
        Self { indices }
    }
}

impl From<&[usize]> for TreePath {
    fn from(indices: &[usize]) -> Self {
        Self::from_indices(indices)
    }
}

impl<const N: usize> From<[usize; N]> for TreePath {
    fn from(indices: [usize; N]) -> Self {
        Self::from_indices(indices.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path: TreePath = "0:12:3".parse().unwrap();
        assert_eq!(path.indices(), &[0, 12, 3]);
        assert_eq!(path.to_string(), "0:12:3");

        assert!("".parse::<TreePath>().is_err());
        assert!("1:x".parse::<TreePath>().is_err());
        assert!("-1".parse::<TreePath>().is_err());
    }

    #[test]
    fn test_navigation() {
        let mut path = TreePath::from([1, 2]);
        path.next();
        assert_eq!(path, TreePath::from([1, 3]));
        assert!(path.prev());
        path.down();
        assert_eq!(path, TreePath::from([1, 2, 0]));
        assert!(!path.prev());
        assert!(path.up());
        assert!(path.up());
        assert!(path.up());
        assert!(!path.up());
        assert!(path.is_empty());
    }

    #[test]
    fn test_ancestry() {
        let parent = TreePath::from([3]);
        let child = TreePath::from([3, 0, 1]);
        assert!(parent.is_ancestor(&child));
        assert!(child.is_descendant(&parent));
        assert!(!parent.is_ancestor(&parent));
        assert!(!TreePath::from([4]).is_ancestor(&child));
        assert!(TreePath::new().is_ancestor(&parent));

        assert_eq!(child.strip_prefix(&parent), Some(TreePath::from([0, 1])));
        assert_eq!(parent.strip_prefix(&parent), None);
        assert_eq!(parent.join(&TreePath::from([0, 1])), child);
    }

    #[test]
    fn test_ordering() {
        let mut paths = vec![
            TreePath::from([1]),
            TreePath::from([0, 5]),
            TreePath::from([0]),
            TreePath::from([0, 1]),
        ];
        paths.sort();
        assert_eq!(
            paths,
            vec![
                TreePath::from([0]),
                TreePath::from([0, 1]),
                TreePath::from([0, 5]),
                TreePath::from([1]),
            ]
        );
    }
}
