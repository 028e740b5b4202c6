// ============================================================================
// spark-compose - Reactivity Module
// Read tracking, write propagation, scheduling and batching
// ============================================================================

pub mod batching;
pub mod equality;
pub mod scheduling;
pub mod tracking;

// Re-export main tracking functions
pub use tracking::{
    begin_tracking, end_tracking, install_dependencies, notify_write, release_dependencies,
    track_read, Tracking,
};

// Re-export scheduling functions
pub use scheduling::{enqueue, flush, FlushReport};

// Re-export batching functions
pub use batching::{batch, peek, tick, untrack};
