// ============================================================================
// spark-compose - A Reactive Declarative-UI Runtime for Rust
// ============================================================================
//
// Cells hold state. Computation nodes read cells and return fragments.
// Writes mark the reading nodes dirty; `flush` recomposes them, diffs each
// new fragment against the previous one and hands the resulting patches to
// the host in a single call.
// ============================================================================

//! Reactive recomposition with explicit read-sets.
//!
//! ```
//! use spark_compose::{create_cell, define_computation, flush, set_host, Edit, Fragment, HostTree};
//!
//! let host = HostTree::new();
//! set_host(host.clone());
//!
//! let count = create_cell(0);
//! let c = count.clone();
//! let label = define_computation(None, move |_| {
//!     Fragment::text(format!("Count: {}", c.read()))
//! })
//! .unwrap();
//! flush().unwrap();
//!
//! count.write(1);
//! let report = flush().unwrap();
//! assert_eq!(report.recomposed, vec![label]);
//! assert!(matches!(report.patches.patches()[0].edits[..], [Edit::Update { .. }]));
//! assert_eq!(host.mount(label).unwrap().text_value(), Some("Count: 1"));
//! # spark_compose::take_host();
//! ```

pub mod config;
pub mod core;
pub mod error;
mod macros;
pub mod primitives;
pub mod reactivity;
pub mod render;

// Re-export core items at crate root for ergonomic access
pub use crate::core::constants;
pub use crate::core::context::{
    dirty_count, is_batching, is_flushing, is_tracking, is_untracking, with_context,
    write_version, RuntimeContext,
};
pub use crate::core::types::{default_equals, AnyCell, CellId, EqualsFn, NodeId, NodeStatus};

pub use config::{config, configure, RuntimeConfig};
pub use error::{ComposeError, Result};

// Re-export primitives at crate root
pub use primitives::cell::{create_cell, CellHandle};
pub use primitives::composer::Composer;
pub use primitives::derived::{derived, derived_with_equals, Derived};
pub use primitives::node::{
    define_computation, destroy_computation, node_children, node_count, node_fragment,
    node_parent, node_read_set, node_status,
};
pub use primitives::provide::{lookup_context, provide_context};
pub use primitives::remote::RemoteWriter;

// Re-export reactivity functions
pub use reactivity::batching::{batch, peek, tick, untrack};
pub use reactivity::equality::{always_equals, equals, nan_safe_equals, never_equals, same_len};
pub use reactivity::scheduling::{enqueue, flush, FlushReport};

// Re-export rendering
pub use render::diff::{diff, DiffOutcome};
pub use render::fragment::{AttrName, AttrValue, Attributes, Fragment, Key};
pub use render::host::{set_host, take_host, HostBridge, HostTree};
pub use render::patch::{Edit, EditCounts, Patch, PatchSequence, Path};

// =============================================================================
// TESTS
// =============================================================================
