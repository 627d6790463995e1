//! Logging and debugging facilities for Horizon Arbor.
//!
//! This module provides:
//! - Integration with the `tracing` crate for structured logging
//! - Debug visualization for cached tree structures
//! - Performance tracing hooks for profiling
//!
//! # Tracing Integration
//!
//! Horizon Arbor uses the `tracing` crate for instrumentation. To see logs,
//! you need to install a tracing subscriber in your application:
//!
//! ```ignore
//! use tracing_subscriber;
//!
//! fn main() {
//!     // Initialize tracing (you can customize this)
//!     tracing_subscriber::fmt::init();
//!
//!     // Your application code...
//! }
//! ```
//!
//! Filter by subsystem with the constants in [`targets`], for example
//! `RUST_LOG=horizon_arbor::filter=trace`.
//!
//! # Debug Visualization
//!
//! Proxy models describe their level cache as a tree of [`DumpEntry`] values
//! and render it with [`TreeDump`]:
//!
//! ```
//! use horizon_arbor_core::logging::{DumpEntry, TreeDump, TreeFormatOptions};
//!
//! let mut root = DumpEntry::new("level 0");
//! root.push_child(DumpEntry::new("elt offset=0"));
//! let text = TreeDump::with_options(TreeFormatOptions::minimal()).format("Cache", &[root]);
//! assert!(text.contains("elt offset=0"));
//! ```

use std::fmt::Write as FmtWrite;

/// Span names used throughout Horizon Arbor for tracing.
///
/// These constants can be used to filter traces for specific subsystems.
pub mod span_names {
    /// Signal emission span.
    pub const SIGNAL: &str = "horizon_arbor::signal";
    /// Full visibility re-evaluation span.
    pub const REFILTER: &str = "horizon_arbor::refilter";
    /// Full re-sort span.
    pub const RESORT: &str = "horizon_arbor::resort";
}

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Core framework target.
    pub const CORE: &str = "horizon_arbor_core";
    /// Signal/slot system target.
    pub const SIGNAL: &str = "horizon_arbor_core::signal";
    /// Backing tree store target.
    pub const STORE: &str = "horizon_arbor::store";
    /// Level cache bookkeeping target.
    pub const CACHE: &str = "horizon_arbor::cache";
    /// Filtering proxy target.
    pub const FILTER: &str = "horizon_arbor::filter";
    /// Sorting proxy target.
    pub const SORT: &str = "horizon_arbor::sort";
    /// Row reference tracking target.
    pub const ROW_REFERENCE: &str = "horizon_arbor::row_reference";
    /// Performance spans target.
    pub const PERF: &str = "horizon_arbor::perf";
}

/// Style options for tree visualization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TreeStyle {
    /// ASCII characters for tree branches.
    Ascii,
    /// Unicode box-drawing characters.
    #[default]
    Unicode,
    /// Compact single-line representation.
    Compact,
}

/// Configuration for cache dump output.
#[derive(Debug, Clone)]
pub struct TreeFormatOptions {
    /// The style of tree visualization.
    pub style: TreeStyle,
    /// Whether to show reference counts on each entry.
    pub show_counts: bool,
    /// Whether to show backing offsets on each entry.
    pub show_offsets: bool,
    /// Whether to include entries hidden from consumers.
    pub show_hidden: bool,
    /// Maximum depth to traverse (None for unlimited).
    pub max_depth: Option<usize>,
    /// Indent size for each level.
    pub indent_size: usize,
}

impl Default for TreeFormatOptions {
    fn default() -> Self {
        Self {
            style: TreeStyle::default(),
            show_counts: true,
            show_offsets: true,
            show_hidden: false,
            max_depth: None,
            indent_size: 2,
        }
    }
}

impl TreeFormatOptions {
    /// Create options for detailed debugging output.
    pub fn detailed() -> Self {
        Self {
            show_hidden: true,
            ..Default::default()
        }
    }

    /// Create options for minimal output.
    pub fn minimal() -> Self {
        Self {
            show_counts: false,
            show_offsets: false,
            show_hidden: false,
            ..Default::default()
        }
    }
}

/// One line of a tree dump plus its nested entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpEntry {
    /// Text printed after the branch connector.
    pub label: String,
    /// Nested entries.
    pub children: Vec<DumpEntry>,
}

impl DumpEntry {
    /// Create an entry with no children.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            children: Vec::new(),
        }
    }

    /// Append a nested entry.
    pub fn push_child(&mut self, child: DumpEntry) {
        self.children.push(child);
    }
}

/// Renders [`DumpEntry`] trees as indented text.
#[derive(Debug, Clone, Default)]
pub struct TreeDump {
    options: TreeFormatOptions,
}

impl TreeDump {
    /// Create a formatter with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a formatter with custom options.
    pub fn with_options(options: TreeFormatOptions) -> Self {
        Self { options }
    }

    /// The options this formatter was built with.
    pub fn options(&self) -> &TreeFormatOptions {
        &self.options
    }

    /// Format a titled forest of entries.
    pub fn format(&self, title: &str, roots: &[DumpEntry]) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "{}:", title);

        if roots.is_empty() {
            let _ = writeln!(output, "  (empty)");
        } else {
            let count = roots.len();
            for (i, root) in roots.iter().enumerate() {
                self.format_subtree_into(root, 0, i + 1 == count, &mut output);
            }
        }
        output
    }

    fn format_subtree_into(&self, entry: &DumpEntry, depth: usize, is_last: bool, output: &mut String) {
        if let Some(max) = self.options.max_depth {
            if depth > max {
                return;
            }
        }

        output.push_str(&self.build_prefix(depth, is_last));
        output.push_str(&entry.label);
        output.push('\n');

        let child_count = entry.children.len();
        for (i, child) in entry.children.iter().enumerate() {
            self.format_subtree_into(child, depth + 1, i + 1 == child_count, output);
        }
    }

    /// Build the prefix string for a tree node.
    fn build_prefix(&self, depth: usize, is_last: bool) -> String {
        if depth == 0 {
            return String::new();
        }

        let (branch, corner, last) = match self.options.style {
            TreeStyle::Ascii => ("|", "+--", "`--"),
            TreeStyle::Unicode => ("\u{2502}", "\u{251c}\u{2500}\u{2500}", "\u{2514}\u{2500}\u{2500}"),
            TreeStyle::Compact => ("", "-", "-"),
        };

        let mut prefix = String::new();

        // Add indentation for parent levels
        for _ in 0..(depth - 1) {
            prefix.push_str(branch);
            for _ in 0..self.options.indent_size {
                prefix.push(' ');
            }
        }

        prefix.push_str(if is_last { last } else { corner });
        prefix.push(' ');
        prefix
    }
}

/// A guard that keeps a tracing span entered until dropped.
///
/// This is useful for tracking the duration of whole-tree operations.
#[derive(Debug)]
pub struct PerfSpan {
    _span: tracing::span::EnteredSpan,
}

impl PerfSpan {
    /// Create a new performance span.
    ///
    /// The span will be active until the guard is dropped.
    pub fn new(name: &'static str) -> Self {
        let span = tracing::info_span!(target: "horizon_arbor::perf", "perf", operation = name);
        Self {
            _span: span.entered(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DumpEntry {
        let mut root = DumpEntry::new("root");
        let mut first = DumpEntry::new("first");
        first.push_child(DumpEntry::new("grandchild"));
        root.push_child(first);
        root.push_child(DumpEntry::new("second"));
        root
    }

    #[test]
    fn test_tree_format_empty() {
        let output = TreeDump::new().format("Cache", &[]);
        assert!(output.starts_with("Cache:"));
        assert!(output.contains("(empty)"));
    }

    #[test]
    fn test_tree_format_unicode() {
        let output = TreeDump::new().format("Cache", &[sample()]);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[1], "root");
        assert_eq!(lines[2], "\u{251c}\u{2500}\u{2500} first");
        assert_eq!(lines[3], "\u{2502}  \u{2514}\u{2500}\u{2500} grandchild");
        assert_eq!(lines[4], "\u{2514}\u{2500}\u{2500} second");
    }

    #[test]
    fn test_tree_format_ascii_max_depth() {
        let options = TreeFormatOptions {
            style: TreeStyle::Ascii,
            max_depth: Some(1),
            ..Default::default()
        };
        let output = TreeDump::with_options(options).format("Cache", &[sample()]);
        assert!(output.contains("+-- first"));
        assert!(output.contains("`-- second"));
        assert!(!output.contains("grandchild"));
    }

    #[test]
    fn test_minimal_options() {
        let options = TreeFormatOptions::minimal();
        assert!(!options.show_counts);
        assert!(!options.show_offsets);
        assert!(TreeFormatOptions::detailed().show_hidden);
    }

    #[test]
    fn test_perf_span() {
        let _span = PerfSpan::new("test_operation");
    }
}
