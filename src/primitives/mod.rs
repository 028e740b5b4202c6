// ============================================================================
// spark-compose - Primitives Module
// Cells, derived stores, computation nodes and the composer
// ============================================================================

pub mod cell;
pub mod composer;
pub mod derived;
pub mod node;
pub mod provide;
pub mod remote;

pub use cell::{create_cell, CellHandle, CellInner};
pub use composer::Composer;
pub use derived::{derived, derived_with_equals, Derived, DerivedInner};
pub use node::{
    define_computation, destroy_computation, node_children, node_count, node_fragment,
    node_parent, node_read_set, node_status, NodeFn, NodeInner,
};
pub use provide::{lookup_context, provide_context};
pub use remote::RemoteWriter;
