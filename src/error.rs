// ============================================================================
// spark-compose - Errors
// ============================================================================

use thiserror::Error;

use crate::core::types::{CellId, NodeId};
use crate::render::fragment::Key;

pub type Result<T> = std::result::Result<T, ComposeError>;

/// Everything that can go wrong in the runtime.
///
/// Errors are local to one node or one batch. `StaleRead`, `KeyCollision`
/// and `NodePanicked` are recovered and show up as diagnostics in a
/// [`FlushReport`](crate::FlushReport); `RunawayUpdate` aborts the batch that
/// produced it and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposeError {
    #[error("{cell} was read after its owner {owner} was destroyed")]
    StaleRead { cell: CellId, owner: NodeId },

    #[error("flush did not settle after {passes} passes ({} node(s) still dirty)", pending.len())]
    RunawayUpdate { passes: u32, pending: Vec<NodeId> },

    #[error("duplicate key {key} among the children of {node}")]
    KeyCollision { node: NodeId, key: Key },

    #[error("{node} panicked while recomposing: {message}")]
    NodePanicked { node: NodeId, message: String },

    #[error("{0} does not exist")]
    NodeNotFound(NodeId),

    #[error("a flush is already in progress on this thread")]
    FlushInProgress,

    #[error("edit targets a missing path {path:?}")]
    InvalidEdit { path: Vec<usize> },
}

impl ComposeError {
    /// Whether the error aborted a whole batch.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RunawayUpdate { .. } | Self::FlushInProgress)
    }
}
