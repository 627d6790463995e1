//! Core systems for Horizon Arbor.
//!
//! This crate provides the foundational components shared by the Horizon
//! Arbor tree models:
//!
//! - **Signal/Slot System**: Type-safe, re-entrant change notification
//! - **Logging**: Tracing targets, span names and cache dump formatting
//!
//! # Signal/Slot Example
//!
//! ```
//! use horizon_arbor_core::Signal;
//!
//! // Create a signal that notifies when a value changes
//! let value_changed = Signal::<i32>::new();
//!
//! // Connect a slot to handle the signal
//! let conn_id = value_changed.connect(|value| {
//!     println!("Value changed to: {}", value);
//! });
//!
//! // Emit the signal
//! value_changed.emit(42);
//!
//! // Disconnect when done
//! value_changed.disconnect(conn_id);
//! ```

pub mod logging;
pub mod signal;

pub use logging::{DumpEntry, PerfSpan, TreeDump, TreeFormatOptions, TreeStyle};
pub use signal::{ConnectionGuard, ConnectionId, Signal};
