// ============================================================================
// spark-compose - Runtime Context
// Thread-local state for tracking, scheduling and the node registry
// ============================================================================

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use indexmap::IndexSet;

use super::types::{AnyCell, CellId, NodeId, ReadSet, Subscriber};
use crate::config::RuntimeConfig;
use crate::error::ComposeError;
use crate::primitives::node::NodeInner;
use crate::primitives::remote::Inbox;
use crate::render::host::HostBridge;
use crate::render::patch::Patch;

// =============================================================================
// TRACKING FRAME
// =============================================================================

/// One level of the active-computation stack.
pub struct TrackingFrame {
    /// Reader whose dependencies are being collected
    pub subscriber: Subscriber,

    /// Cells read so far in this execution
    pub reads: ReadSet,
}

// =============================================================================
// BATCH STATE
// =============================================================================

/// Output accumulated by the flush in progress.
///
/// Nothing here reaches the host until the flush settles.
#[derive(Default)]
pub struct BatchState {
    pub patches: Vec<Patch>,
    /// Nodes holding a staged fragment
    pub staged: Vec<NodeId>,
    pub recomposed: Vec<NodeId>,
    /// Composed children spawned during the batch
    pub created: Vec<NodeId>,
    pub diagnostics: Vec<ComposeError>,
}

// =============================================================================
// RUNTIME CONTEXT
// =============================================================================

/// Thread-local runtime state.
///
/// One runtime lives on each thread that uses the crate. The owning thread
/// is the only flush-owner; other threads reach it through the remote-write
/// inbox.
pub struct RuntimeContext {
    // =========================================================================
    // TRACKING
    // =========================================================================
    frames: RefCell<Vec<TrackingFrame>>,

    /// Reads inside `untrack` do not subscribe
    untracking: Cell<bool>,

    // =========================================================================
    // IDS AND VERSIONS
    // =========================================================================
    next_node_id: Cell<u64>,
    next_cell_id: Cell<u64>,

    /// Global write version - incremented on every cell write
    write_version: Cell<u64>,

    // =========================================================================
    // NODES
    // =========================================================================
    nodes: RefCell<HashMap<NodeId, Rc<NodeInner>>>,

    // =========================================================================
    // SCHEDULING
    // =========================================================================
    batch_depth: Cell<u32>,

    /// Nodes waiting for the next pass, in enqueue order
    dirty: RefCell<IndexSet<NodeId>>,

    flushing: Cell<bool>,

    batch: RefCell<BatchState>,

    /// Unmount patches waiting for the next successful flush
    pending_unmounts: RefCell<Vec<Patch>>,

    // =========================================================================
    // OUTSIDE WORLD
    // =========================================================================
    host: RefCell<Option<Box<dyn HostBridge>>>,

    config: RefCell<RuntimeConfig>,

    inbox: Inbox,

    /// Cells reachable from `RemoteWriter`s
    remote_cells: RefCell<HashMap<CellId, Weak<dyn AnyCell>>>,
}

impl RuntimeContext {
    pub fn new() -> Self {
        Self {
            frames: RefCell::new(Vec::new()),
            untracking: Cell::new(false),
            next_node_id: Cell::new(1),
            next_cell_id: Cell::new(1),
            write_version: Cell::new(0),
            nodes: RefCell::new(HashMap::new()),
            batch_depth: Cell::new(0),
            dirty: RefCell::new(IndexSet::new()),
            flushing: Cell::new(false),
            batch: RefCell::new(BatchState::default()),
            pending_unmounts: RefCell::new(Vec::new()),
            host: RefCell::new(None),
            config: RefCell::new(RuntimeConfig::default()),
            inbox: Inbox::default(),
            remote_cells: RefCell::new(HashMap::new()),
        }
    }

    // =========================================================================
    // TRACKING
    // =========================================================================

    pub fn push_frame(&self, frame: TrackingFrame) {
        self.frames.borrow_mut().push(frame);
    }

    pub fn pop_frame(&self) -> Option<TrackingFrame> {
        self.frames.borrow_mut().pop()
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.borrow().len()
    }

    pub fn has_active_frame(&self) -> bool {
        !self.frames.borrow().is_empty()
    }

    /// Run `f` on the top frame, if any.
    pub fn with_top_frame<R>(&self, f: impl FnOnce(&mut TrackingFrame) -> R) -> Option<R> {
        self.frames.borrow_mut().last_mut().map(f)
    }

    pub fn active_subscriber(&self) -> Option<Subscriber> {
        self.frames.borrow().last().map(|frame| frame.subscriber.clone())
    }

    pub fn set_untracking(&self, value: bool) -> bool {
        self.untracking.replace(value)
    }

    pub fn is_untracking(&self) -> bool {
        self.untracking.get()
    }

    // =========================================================================
    // IDS AND VERSIONS
    // =========================================================================

    pub fn allocate_node_id(&self) -> NodeId {
        let id = self.next_node_id.get();
        self.next_node_id.set(id + 1);
        NodeId(id)
    }

    /// Whether `id` was handed out by this runtime.
    pub fn was_allocated(&self, id: NodeId) -> bool {
        id.0 > 0 && id.0 < self.next_node_id.get()
    }

    pub fn allocate_cell_id(&self) -> CellId {
        let id = self.next_cell_id.get();
        self.next_cell_id.set(id + 1);
        CellId(id)
    }

    pub fn increment_write_version(&self) -> u64 {
        let v = self.write_version.get() + 1;
        self.write_version.set(v);
        v
    }

    pub fn get_write_version(&self) -> u64 {
        self.write_version.get()
    }

    // =========================================================================
    // NODES
    // =========================================================================

    pub fn insert_node(&self, node: Rc<NodeInner>) {
        self.nodes.borrow_mut().insert(node.id(), node);
    }

    pub fn node(&self, id: NodeId) -> Option<Rc<NodeInner>> {
        self.nodes.borrow().get(&id).cloned()
    }

    pub fn remove_node(&self, id: NodeId) -> Option<Rc<NodeInner>> {
        self.nodes.borrow_mut().remove(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.borrow().len()
    }

    // =========================================================================
    // SCHEDULING
    // =========================================================================

    pub fn enter_batch(&self) -> u32 {
        let depth = self.batch_depth.get() + 1;
        self.batch_depth.set(depth);
        depth
    }

    pub fn exit_batch(&self) -> u32 {
        let depth = self.batch_depth.get().saturating_sub(1);
        self.batch_depth.set(depth);
        depth
    }

    pub fn is_batching(&self) -> bool {
        self.batch_depth.get() > 0
    }

    /// Add a node to the dirty set. Returns false if it was already queued.
    pub fn add_dirty(&self, id: NodeId) -> bool {
        self.dirty.borrow_mut().insert(id)
    }

    pub fn take_dirty(&self) -> Vec<NodeId> {
        self.dirty.take().into_iter().collect()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.borrow().len()
    }

    pub fn is_queued(&self, id: NodeId) -> bool {
        self.dirty.borrow().contains(&id)
    }

    pub fn set_flushing(&self, value: bool) -> bool {
        self.flushing.replace(value)
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.get()
    }

    // =========================================================================
    // BATCH STATE
    // =========================================================================

    pub fn patch_mark(&self) -> usize {
        self.batch.borrow().patches.len()
    }

    /// Insert patches at `at`, ahead of anything pushed after that mark.
    pub fn splice_patches(&self, at: usize, patches: Vec<Patch>) {
        let mut batch = self.batch.borrow_mut();
        let at = at.min(batch.patches.len());
        batch.patches.splice(at..at, patches);
    }

    pub fn push_patch(&self, patch: Patch) {
        self.batch.borrow_mut().patches.push(patch);
    }

    pub fn record_staged(&self, id: NodeId) {
        let mut batch = self.batch.borrow_mut();
        if !batch.staged.contains(&id) {
            batch.staged.push(id);
        }
    }

    pub fn record_recomposed(&self, id: NodeId) {
        self.batch.borrow_mut().recomposed.push(id);
    }

    pub fn record_created(&self, id: NodeId) {
        self.batch.borrow_mut().created.push(id);
    }

    pub fn push_diagnostic(&self, error: ComposeError) {
        self.batch.borrow_mut().diagnostics.push(error);
    }

    pub fn take_batch(&self) -> BatchState {
        self.batch.take()
    }

    pub fn add_pending_unmount(&self, patch: Patch) {
        self.pending_unmounts.borrow_mut().push(patch);
    }

    pub fn take_pending_unmounts(&self) -> Vec<Patch> {
        self.pending_unmounts.take()
    }

    // =========================================================================
    // OUTSIDE WORLD
    // =========================================================================

    pub fn replace_host(&self, host: Option<Box<dyn HostBridge>>) -> Option<Box<dyn HostBridge>> {
        self.host.replace(host)
    }

    pub fn has_host(&self) -> bool {
        self.host.borrow().is_some()
    }

    pub fn config(&self) -> RuntimeConfig {
        self.config.borrow().clone()
    }

    pub fn set_config(&self, config: RuntimeConfig) -> RuntimeConfig {
        self.config.replace(config)
    }

    pub fn inbox(&self) -> Inbox {
        self.inbox.clone()
    }

    pub fn register_remote_cell(&self, cell: Weak<dyn AnyCell>, id: CellId) {
        self.remote_cells.borrow_mut().insert(id, cell);
    }

    pub fn remote_cell(&self, id: CellId) -> Option<Rc<dyn AnyCell>> {
        let cell = self.remote_cells.borrow().get(&id).and_then(Weak::upgrade);
        if cell.is_none() {
            self.remote_cells.borrow_mut().remove(&id);
        }
        cell
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// THREAD-LOCAL ACCESS
// =============================================================================

thread_local! {
    static CONTEXT: RuntimeContext = RuntimeContext::new();
}

/// Access the thread-local runtime context.
///
/// Callers must not run user code (node functions, cleanups, host calls)
/// inside `f`; take what is needed out of the context first.
pub fn with_context<R>(f: impl FnOnce(&RuntimeContext) -> R) -> R {
    CONTEXT.with(f)
}

// =============================================================================
// CONVENIENCE FUNCTIONS
// =============================================================================

/// Whether a read right now would subscribe (inside a tracked computation,
/// not untracking).
pub fn is_tracking() -> bool {
    with_context(|ctx| ctx.has_active_frame() && !ctx.is_untracking())
}

pub fn is_untracking() -> bool {
    with_context(|ctx| ctx.is_untracking())
}

pub fn is_batching() -> bool {
    with_context(|ctx| ctx.is_batching())
}

pub fn is_flushing() -> bool {
    with_context(|ctx| ctx.is_flushing())
}

/// Number of nodes waiting for the next flush pass.
pub fn dirty_count() -> usize {
    with_context(|ctx| ctx.dirty_count())
}

/// Global write counter.
pub fn write_version() -> u64 {
    with_context(|ctx| ctx.get_write_version())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_creation() {
        with_context(|ctx| {
            assert_eq!(ctx.get_write_version(), 0);
            assert!(!ctx.has_active_frame());
            assert!(!ctx.is_untracking());
            assert!(!ctx.is_batching());
            assert!(!ctx.is_flushing());
            assert_eq!(ctx.dirty_count(), 0);
        });
    }

    #[test]
    fn ids_are_monotonic() {
        with_context(|ctx| {
            let a = ctx.allocate_node_id();
            let b = ctx.allocate_node_id();
            assert!(b > a);

            let c = ctx.allocate_cell_id();
            let d = ctx.allocate_cell_id();
            assert!(d > c);
        });
    }

    #[test]
    fn batch_depth() {
        with_context(|ctx| {
            assert_eq!(ctx.enter_batch(), 1);
            assert_eq!(ctx.enter_batch(), 2);
            assert!(ctx.is_batching());
            assert_eq!(ctx.exit_batch(), 1);
            assert_eq!(ctx.exit_batch(), 0);
            assert!(!ctx.is_batching());
            assert_eq!(ctx.exit_batch(), 0);
        });
    }

    #[test]
    fn dirty_set_is_idempotent() {
        with_context(|ctx| {
            let id = ctx.allocate_node_id();
            assert!(ctx.add_dirty(id));
            assert!(!ctx.add_dirty(id));
            assert_eq!(ctx.dirty_count(), 1);
            assert_eq!(ctx.take_dirty(), vec![id]);
            assert_eq!(ctx.dirty_count(), 0);
        });
    }

    #[test]
    fn frames_stack() {
        with_context(|ctx| {
            ctx.push_frame(TrackingFrame {
                subscriber: Subscriber::Node(NodeId(1)),
                reads: ReadSet::new(),
            });
            ctx.push_frame(TrackingFrame {
                subscriber: Subscriber::Node(NodeId(2)),
                reads: ReadSet::new(),
            });

            assert_eq!(ctx.frame_depth(), 2);
            assert_eq!(
                ctx.active_subscriber().map(|s| s.key()),
                Some(crate::core::types::SubscriberKey::Node(NodeId(2)))
            );

            ctx.pop_frame();
            ctx.pop_frame();
            assert!(!ctx.has_active_frame());
        });
    }

    #[test]
    fn convenience_functions() {
        assert!(!is_tracking());
        assert!(!is_untracking());
        assert!(!is_batching());
        assert!(!is_flushing());
        assert_eq!(dirty_count(), 0);
    }
}
