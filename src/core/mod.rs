// ============================================================================
// spark-compose - Core Module
// Identifiers, type-erased traits and the thread-local runtime context
// ============================================================================

pub mod constants;
pub mod context;
pub mod types;

pub use constants::*;
pub use context::{
    dirty_count, is_batching, is_flushing, is_tracking, is_untracking, with_context,
    write_version, RuntimeContext,
};
pub use types::{
    default_equals, AnyCell, AnyDerived, CellId, Dependency, EqualsFn, NodeId, NodeStatus,
    ReadSet, Subscriber, SubscriberKey,
};
