// ============================================================================
// spark-compose - Recomposition Scheduling
// The dirty set and the flush loop
// ============================================================================
//
// Writes never execute anything. They put nodes into the dirty set, and
// `flush` drains it in passes:
//
//   1. Apply writes queued by other threads.
//   2. Snapshot the dirty set, order it by (depth, id) so ancestors run
//      before descendants, and recompose each node that still needs it.
//   3. Writes made during a pass land in the dirty set for the next pass.
//   4. Stop when the dirty set stays empty, or give up after
//      `max_flush_passes` passes.
//
// Staged fragments and patches only become visible when the flush settles;
// a runaway flush discards them and the host never sees a half-applied batch.
// ============================================================================

use std::collections::HashSet;
use std::rc::Rc;

use indexmap::IndexSet;

use tracing::{debug, debug_span, error, trace, warn};

use crate::core::constants::*;
use crate::core::context::with_context;
use crate::core::types::NodeId;
use crate::error::{ComposeError, Result};
use crate::primitives::node::{recompose, teardown, NodeInner};
use crate::reactivity::tracking::reads_changed;
use crate::render::host::deliver;
use crate::render::patch::PatchSequence;

// =============================================================================
// FLUSH REPORT
// =============================================================================

/// What one successful flush did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    /// Passes run (zero when nothing was dirty)
    pub passes: u32,

    /// Nodes executed, in execution order
    pub recomposed: Vec<NodeId>,

    /// The sequence handed to the host
    pub patches: PatchSequence,

    /// Non-fatal errors recovered during the flush
    pub diagnostics: Vec<ComposeError>,
}

impl FlushReport {
    /// True when the flush had nothing to do.
    pub fn is_idle(&self) -> bool {
        self.recomposed.is_empty() && self.patches.is_empty()
    }

    /// How many times `node` was executed.
    pub fn recompose_count(&self, node: NodeId) -> usize {
        self.recomposed.iter().filter(|id| **id == node).count()
    }
}

// =============================================================================
// SCHEDULE
// =============================================================================

/// Put a node into the dirty set with the given status.
///
/// DIRTY always wins over MAYBE_DIRTY. Destroyed or unknown nodes are ignored.
pub(crate) fn schedule(id: NodeId, status: u32) {
    let Some(node) = with_context(|ctx| ctx.node(id)) else {
        return;
    };
    if node.is_destroyed() {
        return;
    }
    if status == DIRTY || node.flags() & DIRTY == 0 {
        node.set_status(status);
    }
    with_context(|ctx| ctx.add_dirty(id));
}

/// Mark `node` dirty so it recomposes on the next flush.
///
/// Enqueueing an already queued node does nothing.
pub fn enqueue(node: NodeId) -> Result<()> {
    let alive = with_context(|ctx| ctx.node(node)).is_some_and(|n| !n.is_destroyed());
    if !alive {
        return Err(ComposeError::NodeNotFound(node));
    }
    schedule(node, DIRTY);
    Ok(())
}

/// Whether a queued node has to execute.
///
/// DIRTY nodes always do. MAYBE_DIRTY nodes only if a dependency's version
/// moved; otherwise they are marked clean here.
fn needs_recompose(node: &NodeInner) -> bool {
    let flags = node.flags();
    if flags & DIRTY != 0 {
        return true;
    }
    if flags & MAYBE_DIRTY == 0 {
        return false;
    }
    let reads = node.read_set();
    if reads_changed(&reads) {
        return true;
    }
    // A refresh above may have written and re-dirtied the node
    if node.flags() & DIRTY != 0 {
        return true;
    }
    node.set_status(CLEAN);
    false
}

// =============================================================================
// REMOTE WRITES
// =============================================================================

/// Apply writes queued by other threads, in arrival order.
pub(crate) fn drain_remote_writes() -> usize {
    let writes = with_context(|ctx| ctx.inbox()).drain();
    let count = writes.len();
    for write in writes {
        let cell = with_context(|ctx| ctx.remote_cell(write.cell));
        match cell {
            Some(cell) => {
                if !cell.write_boxed(write.value) {
                    warn!(cell = %write.cell, "remote write dropped: value type does not match the cell");
                }
            }
            None => trace!(cell = %write.cell, "remote write dropped: cell is gone"),
        }
    }
    count
}

// =============================================================================
// FLUSH
// =============================================================================

/// Resets the flushing flag if a node panic escapes the flush.
struct FlushGuard;

impl Drop for FlushGuard {
    fn drop(&mut self) {
        with_context(|ctx| {
            ctx.set_flushing(false);
            ctx.take_batch();
        });
    }
}

/// Recompose everything that is dirty and deliver the resulting patches.
///
/// Returns [`ComposeError::FlushInProgress`] when called from inside a flush
/// and [`ComposeError::RunawayUpdate`] when the dirty set does not drain
/// within the configured number of passes.
pub fn flush() -> Result<FlushReport> {
    if with_context(|ctx| ctx.is_flushing()) {
        return Err(ComposeError::FlushInProgress);
    }
    let span = debug_span!("flush");
    let _entered = span.enter();

    with_context(|ctx| {
        ctx.set_flushing(true);
        // Unmounts from destroys outside a flush go first
        for patch in ctx.take_pending_unmounts() {
            ctx.push_patch(patch);
        }
    });
    let _guard = FlushGuard;

    let remote = drain_remote_writes();
    if remote > 0 {
        trace!(count = remote, "applied remote writes");
    }

    let max_passes = with_context(|ctx| ctx.config().max_flush_passes);
    let mut passes = 0u32;

    loop {
        let snapshot = with_context(|ctx| ctx.take_dirty());
        if snapshot.is_empty() {
            break;
        }
        if passes >= max_passes {
            return Err(abort_runaway(passes, snapshot));
        }
        passes += 1;
        run_pass(passes, &snapshot);
    }

    Ok(commit(passes))
}

fn run_pass(pass: u32, snapshot: &[NodeId]) {
    let mut nodes: Vec<Rc<NodeInner>> = snapshot
        .iter()
        .filter_map(|id| with_context(|ctx| ctx.node(*id)))
        .collect();
    nodes.sort_by_key(|node| (node.depth(), node.id()));
    trace!(pass, queued = nodes.len(), "flush pass");

    for node in nodes {
        // Destroyed by an ancestor, or already recomposed by one this pass
        if node.is_destroyed() || !node.is_pending() {
            continue;
        }
        if needs_recompose(&node) {
            recompose(&node);
        }
    }
}

/// Make staged output current and hand the patches to the host.
fn commit(passes: u32) -> FlushReport {
    let batch = with_context(|ctx| ctx.take_batch());

    for id in &batch.staged {
        if let Some(node) = with_context(|ctx| ctx.node(*id)) {
            node.commit();
        }
    }

    let patches = PatchSequence::new(batch.patches);
    let report = FlushReport {
        passes,
        recomposed: batch.recomposed,
        patches,
        diagnostics: batch.diagnostics,
    };

    // The host may write cells or define nodes; those go to the next flush
    with_context(|ctx| ctx.set_flushing(false));
    deliver(&report.patches);

    debug!(
        passes = report.passes,
        recomposed = report.recomposed.len(),
        patches = report.patches.len(),
        edits = report.patches.edit_count(),
        diagnostics = report.diagnostics.len(),
        "flush settled"
    );
    report
}

/// Throw away the batch after too many passes.
///
/// Staged fragments and patches are dropped so the host keeps the last
/// committed state. Children spawned during the batch never mounted and are
/// torn down. Nodes that settled in the batch are queued again so the next
/// flush brings their output back in line with the cells; the `pending` nodes
/// are left clean. Unmounts of committed nodes that no longer exist are kept
/// for the next successful flush.
fn abort_runaway(passes: u32, pending: Vec<NodeId>) -> ComposeError {
    let batch = with_context(|ctx| ctx.take_batch());

    for id in &batch.staged {
        if let Some(node) = with_context(|ctx| ctx.node(*id)) {
            node.discard_staged();
        }
    }

    let mut never_mounted = Vec::new();
    for id in batch.created.iter().rev() {
        if let Some(node) = with_context(|ctx| ctx.node(*id)) {
            teardown(&node, &mut never_mounted);
        }
    }

    for id in &pending {
        if let Some(node) = with_context(|ctx| ctx.node(*id)) {
            node.set_status(CLEAN);
        }
    }

    let created: HashSet<NodeId> = batch.created.iter().copied().collect();
    let skipped: HashSet<NodeId> = pending.iter().copied().chain(created.iter().copied()).collect();
    let requeue: IndexSet<NodeId> = batch
        .staged
        .iter()
        .chain(&batch.recomposed)
        .filter(|id| !skipped.contains(*id))
        .copied()
        .collect();
    for id in &requeue {
        schedule(*id, DIRTY);
    }

    with_context(|ctx| {
        for patch in batch.patches {
            let committed_before = !created.contains(&patch.node);
            if patch.is_unmount() && committed_before && ctx.node(patch.node).is_none() {
                ctx.add_pending_unmount(patch);
            }
        }
    });

    error!(
        passes,
        pending = ?pending,
        requeued = requeue.len(),
        discarded_children = created.len(),
        "flush aborted: dirty set did not drain"
    );
    ComposeError::RunawayUpdate { passes, pending }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{configure, RuntimeConfig};
    use crate::primitives::cell::create_cell;
    use crate::primitives::node::{define_computation, destroy_computation, node_status};
    use crate::render::fragment::Fragment;
    use crate::core::types::NodeStatus;

    #[test]
    fn empty_flush_is_idle() {
        let report = flush().unwrap();
        assert_eq!(report.passes, 0);
        assert!(report.is_idle());
    }

    #[test]
    fn defined_node_runs_on_next_flush() {
        let count = create_cell(0);
        let c = count.clone();
        let node = define_computation(None, move |_| Fragment::text(format!("{}", c.read()))).unwrap();

        assert_eq!(node_status(node), Some(NodeStatus::Dirty));
        let report = flush().unwrap();
        assert_eq!(report.passes, 1);
        assert_eq!(report.recomposed, vec![node]);
        assert_eq!(node_status(node), Some(NodeStatus::Clean));

        destroy_computation(node).unwrap();
    }

    #[test]
    fn enqueue_unknown_node_fails() {
        let missing = NodeId(u64::MAX);
        assert_eq!(enqueue(missing), Err(ComposeError::NodeNotFound(missing)));
    }

    #[test]
    fn enqueue_forces_recompose() {
        let node = define_computation(None, |_| Fragment::text("static")).unwrap();
        flush().unwrap();

        enqueue(node).unwrap();
        enqueue(node).unwrap();
        let report = flush().unwrap();
        assert_eq!(report.recompose_count(node), 1);
        // Same output, nothing to patch
        assert!(report.patches.is_empty());

        destroy_computation(node).unwrap();
    }

    #[test]
    fn runaway_is_reported_and_recovered() {
        configure(RuntimeConfig::default().with_max_flush_passes(5));
        let spin = create_cell(0u32);
        let s = spin.clone();
        let node = define_computation(None, move |_| {
            let v = s.read();
            s.write(v + 1);
            Fragment::text("spinning")
        })
        .unwrap();

        match flush() {
            Err(ComposeError::RunawayUpdate { passes, pending }) => {
                assert_eq!(passes, 5);
                assert_eq!(pending, vec![node]);
            }
            other => panic!("expected runaway, got {other:?}"),
        }
        assert!(!crate::core::context::is_flushing());
        assert_eq!(node_status(node), Some(NodeStatus::Clean));

        destroy_computation(node).unwrap();
        let report = flush().unwrap();
        // Never committed, so there is nothing to unmount
        assert!(report.patches.is_empty());
        configure(RuntimeConfig::default());
    }
}
