// ============================================================================
// spark-compose - Computation Nodes
// Units of rendered output and their recomposition
// ============================================================================
//
// A node owns its function, its read-set, the slot table behind
// `Composer::remember`, the cells it declared, and two fragments: the one
// the host currently shows (committed) and the one produced by the flush in
// progress (staged). Staged output becomes committed only when the flush
// settles.
//
// Patch order inside a flush comes from where patches are spliced. Before a
// node runs it takes a mark in the batch's patch list; children it executes
// nested push their patches after that mark; when it finishes, the unmounts
// of children it dropped and then its own patch are spliced in at the mark.
// Removals therefore reach the host leaves-first and insertions
// ancestors-first.
// ============================================================================

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use tracing::{debug, error, trace, warn};

use crate::core::constants::*;
use crate::core::context::with_context;
use crate::core::types::{AnyCell, CellId, NodeId, NodeStatus, ReadSet, Subscriber};
use crate::error::{ComposeError, Result};
use crate::primitives::cell::{destroy_cell, CellHandle};
use crate::primitives::composer::{Composed, Composer};
use crate::reactivity::scheduling::schedule;
use crate::reactivity::tracking::{install_dependencies, release_dependencies, Tracking};
use crate::render::diff::diff;
use crate::render::fragment::{Fragment, Key};
use crate::render::patch::Patch;

/// A node's function.
pub type NodeFn = Box<dyn FnMut(&mut Composer) -> Fragment>;

// =============================================================================
// NODE INNER
// =============================================================================

pub struct NodeInner {
    id: NodeId,

    /// VIEW | PINNED or COMPOSED | status
    flags: Cell<u32>,

    parent: Option<NodeId>,
    depth: usize,

    /// Key under which the parent declared it (composed nodes only)
    key: Option<Key>,

    /// Taken out while the node executes
    func: RefCell<Option<NodeFn>>,

    /// Last input passed through `Composer::child_with`
    input: RefCell<Option<Rc<dyn Any>>>,

    reads: RefCell<ReadSet>,

    committed: RefCell<Option<Fragment>>,
    staged: RefCell<Option<Fragment>>,

    /// Every child, in creation order
    children: RefCell<Vec<NodeId>>,

    /// Children declared through the composer, by key
    keyed_children: RefCell<HashMap<Key, NodeId>>,

    /// Slot table behind `Composer::remember`
    slots: RefCell<Vec<Rc<dyn Any>>>,

    owned_cells: RefCell<Vec<Rc<dyn AnyCell>>>,

    /// Provided context values, each a `CellHandle<T>` keyed by `TypeId::of::<T>()`
    contexts: RefCell<HashMap<TypeId, Rc<dyn Any>>>,

    cleanups: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl NodeInner {
    pub(crate) fn new(
        id: NodeId,
        parent: Option<NodeId>,
        depth: usize,
        key: Option<Key>,
        kind: u32,
        func: NodeFn,
    ) -> Self {
        Self {
            id,
            flags: Cell::new(VIEW | kind | DIRTY),
            parent,
            depth,
            key,
            func: RefCell::new(Some(func)),
            input: RefCell::new(None),
            reads: RefCell::new(ReadSet::new()),
            committed: RefCell::new(None),
            staged: RefCell::new(None),
            children: RefCell::new(Vec::new()),
            keyed_children: RefCell::new(HashMap::new()),
            slots: RefCell::new(Vec::new()),
            owned_cells: RefCell::new(Vec::new()),
            contexts: RefCell::new(HashMap::new()),
            cleanups: RefCell::new(Vec::new()),
        }
    }

    // =========================================================================
    // IDENTITY AND STATUS
    // =========================================================================

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    pub fn flags(&self) -> u32 {
        self.flags.get()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::from_flags(self.flags.get())
    }

    /// Replace the CLEAN / DIRTY / MAYBE_DIRTY bits.
    pub(crate) fn set_status(&self, status: u32) {
        self.flags.set((self.flags.get() & STATUS_MASK) | status);
    }

    fn set_flag(&self, flag: u32, on: bool) {
        let flags = self.flags.get();
        self.flags.set(if on { flags | flag } else { flags & !flag });
    }

    pub fn is_destroyed(&self) -> bool {
        self.flags.get() & DESTROYED != 0
    }

    /// DIRTY or MAYBE_DIRTY.
    pub fn is_pending(&self) -> bool {
        self.flags.get() & (DIRTY | MAYBE_DIRTY) != 0
    }

    pub fn is_composed(&self) -> bool {
        self.flags.get() & COMPOSED != 0
    }

    // =========================================================================
    // FUNCTION AND INPUT
    // =========================================================================

    fn take_func(&self) -> Option<NodeFn> {
        self.func.borrow_mut().take()
    }

    fn restore_func(&self, func: NodeFn) {
        if self.is_destroyed() {
            return;
        }
        let mut slot = self.func.borrow_mut();
        if slot.is_none() {
            *slot = Some(func);
        }
    }

    pub(crate) fn replace_func(&self, func: NodeFn) {
        *self.func.borrow_mut() = Some(func);
    }

    /// Whether `input` differs from the stored one (or none is stored).
    pub(crate) fn input_differs<I: PartialEq + 'static>(&self, input: &I) -> bool {
        match self.input.borrow().as_ref().and_then(|i| i.downcast_ref::<I>()) {
            Some(previous) => previous != input,
            None => true,
        }
    }

    pub(crate) fn set_input(&self, input: Option<Rc<dyn Any>>) {
        *self.input.borrow_mut() = input;
    }

    // =========================================================================
    // READ-SET
    // =========================================================================

    /// Snapshot of the read-set.
    pub fn read_set(&self) -> ReadSet {
        self.reads.borrow().clone()
    }

    /// Drop a destroyed cell from the read-set.
    pub(crate) fn forget_read(&self, cell: CellId) {
        self.reads.borrow_mut().shift_remove(&cell);
    }

    // =========================================================================
    // OUTPUT
    // =========================================================================

    /// What the host shows.
    pub fn committed_fragment(&self) -> Option<Fragment> {
        self.committed.borrow().clone()
    }

    /// The newest output: staged if this flush produced one, else committed.
    pub fn current_fragment(&self) -> Option<Fragment> {
        self.staged
            .borrow()
            .clone()
            .or_else(|| self.committed.borrow().clone())
    }

    fn has_output(&self) -> bool {
        self.staged.borrow().is_some() || self.committed.borrow().is_some()
    }

    fn stage(&self, fragment: Fragment) {
        *self.staged.borrow_mut() = Some(fragment);
    }

    pub(crate) fn commit(&self) {
        if let Some(fragment) = self.staged.borrow_mut().take() {
            *self.committed.borrow_mut() = Some(fragment);
        }
    }

    pub(crate) fn discard_staged(&self) {
        self.staged.borrow_mut().take();
    }

    // =========================================================================
    // CHILDREN
    // =========================================================================

    pub fn children(&self) -> Vec<NodeId> {
        self.children.borrow().clone()
    }

    pub(crate) fn register_child(&self, child: NodeId, key: Option<Key>) {
        self.children.borrow_mut().push(child);
        if let Some(key) = key {
            self.keyed_children.borrow_mut().insert(key, child);
        }
    }

    pub(crate) fn unregister_child(&self, child: NodeId) {
        self.children.borrow_mut().retain(|id| *id != child);
        self.keyed_children.borrow_mut().retain(|_, id| *id != child);
    }

    pub(crate) fn keyed_child(&self, key: &Key) -> Option<NodeId> {
        self.keyed_children.borrow().get(key).copied()
    }

    /// Keyed children in creation order.
    fn keyed_child_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.keyed_children.borrow().values().copied().collect();
        ids.sort_unstable();
        ids
    }

    // =========================================================================
    // SLOTS, CELLS, CONTEXTS, CLEANUPS
    // =========================================================================

    pub(crate) fn slot(&self, index: usize) -> Option<Rc<dyn Any>> {
        self.slots.borrow().get(index).cloned()
    }

    pub(crate) fn set_slot(&self, index: usize, value: Rc<dyn Any>) {
        let mut slots = self.slots.borrow_mut();
        if index < slots.len() {
            slots[index] = value;
        } else {
            slots.push(value);
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.borrow().len()
    }

    pub(crate) fn adopt_cell(&self, cell: Rc<dyn AnyCell>) {
        self.owned_cells.borrow_mut().push(cell);
    }

    pub fn owned_cell_count(&self) -> usize {
        self.owned_cells.borrow().len()
    }

    pub(crate) fn context<T: 'static>(&self) -> Option<CellHandle<T>> {
        self.contexts
            .borrow()
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<CellHandle<T>>())
            .cloned()
    }

    pub(crate) fn set_context<T: 'static>(&self, cell: CellHandle<T>) {
        self.contexts
            .borrow_mut()
            .insert(TypeId::of::<T>(), Rc::new(cell));
    }

    pub(crate) fn cleanup_count(&self) -> usize {
        self.cleanups.borrow().len()
    }

    pub(crate) fn add_cleanup(&self, cleanup: Box<dyn FnOnce()>) {
        self.cleanups.borrow_mut().push(cleanup);
    }
}

// =============================================================================
// RECOMPOSE
// =============================================================================

/// Execute `node` once and stage its output.
///
/// Only called from inside a flush, either by a pass or nested by a parent.
pub(crate) fn recompose(node: &Rc<NodeInner>) {
    let id = node.id();
    let Some(mut func) = node.take_func() else {
        // Already executing further up the stack
        return;
    };

    node.set_status(CLEAN);
    node.set_flag(RECOMPOSING, true);
    trace!(node = %id, depth = node.depth(), "recompose");

    let mark = with_context(|ctx| {
        ctx.record_recomposed(id);
        ctx.patch_mark()
    });

    let tracking = Tracking::begin(Subscriber::Node(id));
    let mut composer = Composer::new(node.clone());
    let result = panic::catch_unwind(AssertUnwindSafe(|| func(&mut composer)));
    let reads = tracking.finish();

    node.restore_func(func);
    node.set_flag(RECOMPOSING, false);
    let composed = composer.finish();

    if node.is_destroyed() {
        // Destroyed itself while running
        release_dependencies(&Subscriber::Node(id), &reads);
        return;
    }

    match result {
        Ok(fragment) => settle(node, fragment, reads, composed, mark),
        Err(payload) => recover(node, reads, composed, payload),
    }
}

fn settle(node: &Rc<NodeInner>, fragment: Fragment, reads: ReadSet, composed: Composed, mark: usize) {
    let id = node.id();

    let previous = node.reads.replace(reads);
    install_dependencies(&Subscriber::Node(id), &previous, &node.reads.borrow());

    let mut patches = retire_children(node, &composed.declared);

    let outcome = diff(node.current_fragment().as_ref(), &fragment);
    for key in outcome.collisions {
        warn!(node = %id, %key, "duplicate key among siblings, matching them by position");
        with_context(|ctx| ctx.push_diagnostic(ComposeError::KeyCollision { node: id, key }));
    }
    if !outcome.edits.is_empty() {
        patches.push(Patch::new(id, outcome.edits));
    }

    node.stage(fragment);
    with_context(|ctx| {
        ctx.record_staged(id);
        ctx.splice_patches(mark, patches);
    });
}

/// Keep the previous output and read-set of a node whose function panicked.
fn recover(node: &Rc<NodeInner>, reads: ReadSet, composed: Composed, payload: Box<dyn Any + Send>) {
    let id = node.id();
    let key = Subscriber::Node(id).key();

    // Subscriptions made by the failed run that the kept read-set lacks
    let kept = node.reads.borrow();
    for (cell, dep) in &reads {
        if !kept.contains_key(cell) {
            dep.cell.remove_subscriber(&key);
        }
    }
    drop(kept);

    // Children spawned by the failed run are not referenced by any output
    let mut unmounts = Vec::new();
    for child in composed.created {
        if let Some(child) = with_context(|ctx| ctx.node(child)) {
            teardown(&child, &mut unmounts);
        }
    }

    let message = panic_message(payload.as_ref());
    error!(node = %id, %message, "node function panicked, keeping its previous output");

    let rethrow = with_context(|ctx| {
        for patch in unmounts {
            ctx.push_patch(patch);
        }
        ctx.push_diagnostic(ComposeError::NodePanicked { node: id, message });
        !ctx.config().catch_node_panics
    });
    if rethrow {
        panic::resume_unwind(payload);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("non-string panic payload")
    }
}

/// Destroy composed children that the last run did not declare.
fn retire_children(node: &NodeInner, declared: &HashSet<NodeId>) -> Vec<Patch> {
    let mut unmounts = Vec::new();
    for child in node.keyed_child_ids() {
        if declared.contains(&child) {
            continue;
        }
        match with_context(|ctx| ctx.node(child)) {
            Some(child) => teardown(&child, &mut unmounts),
            None => node.unregister_child(child),
        }
    }
    unmounts
}

// =============================================================================
// DEFINE / DESTROY
// =============================================================================

/// Create a pinned computation node.
///
/// The node runs on the next flush and stays until
/// [`destroy_computation`] is called for it or for an ancestor.
///
/// # Example
///
/// ```
/// use spark_compose::{create_cell, define_computation, flush, node_fragment, Fragment};
///
/// let count = create_cell(0);
/// let c = count.clone();
/// let node = define_computation(None, move |_| {
///     Fragment::text(format!("Count: {}", c.read()))
/// })
/// .unwrap();
///
/// flush().unwrap();
/// assert_eq!(node_fragment(node).unwrap().text_value(), Some("Count: 0"));
/// ```
pub fn define_computation<F>(parent: Option<NodeId>, f: F) -> Result<NodeId>
where
    F: FnMut(&mut Composer) -> Fragment + 'static,
{
    let parent_node = match parent {
        Some(parent) => Some(
            with_context(|ctx| ctx.node(parent))
                .filter(|node| !node.is_destroyed())
                .ok_or(ComposeError::NodeNotFound(parent))?,
        ),
        None => None,
    };
    let depth = parent_node.as_ref().map_or(0, |p| p.depth() + 1);

    let id = with_context(|ctx| ctx.allocate_node_id());
    let node = Rc::new(NodeInner::new(id, parent, depth, None, PINNED, Box::new(f)));
    with_context(|ctx| ctx.insert_node(node));
    if let Some(parent_node) = parent_node {
        parent_node.register_child(id, None);
    }
    schedule(id, DIRTY);

    debug!(node = %id, parent = ?parent, "computation defined");
    Ok(id)
}

/// Destroy a node and its whole subtree.
///
/// Children go first. Each node runs its cleanups, releases its read-set,
/// destroys the cells it owns and, if the host was shown its output, gets an
/// unmount patch. Outside a flush the unmounts wait for the next one.
pub fn destroy_computation(node: NodeId) -> Result<()> {
    let target = with_context(|ctx| ctx.node(node)).ok_or(ComposeError::NodeNotFound(node))?;

    let mut unmounts = Vec::new();
    teardown(&target, &mut unmounts);

    with_context(|ctx| {
        let flushing = ctx.is_flushing();
        for patch in unmounts {
            if flushing {
                ctx.push_patch(patch);
            } else {
                ctx.add_pending_unmount(patch);
            }
        }
    });
    debug!(node = %node, "computation destroyed");
    Ok(())
}

/// Post-order destruction. Unmount patches are appended leaves first.
pub(crate) fn teardown(node: &Rc<NodeInner>, unmounts: &mut Vec<Patch>) {
    if node.is_destroyed() {
        return;
    }
    let id = node.id();
    node.set_flag(DESTROYED, true);

    let children = node.children.take();
    node.keyed_children.borrow_mut().clear();
    for child in children {
        if let Some(child) = with_context(|ctx| ctx.node(child)) {
            teardown(&child, unmounts);
        }
    }

    let cleanups = node.cleanups.take();
    for cleanup in cleanups.into_iter().rev() {
        cleanup();
    }

    let reads = node.reads.take();
    release_dependencies(&Subscriber::Node(id), &reads);

    let cells = node.owned_cells.take();
    for cell in &cells {
        destroy_cell(cell);
    }

    with_context(|ctx| ctx.remove_node(id));
    if let Some(parent) = node.parent().and_then(|p| with_context(|ctx| ctx.node(p))) {
        parent.unregister_child(id);
    }

    if node.has_output() {
        unmounts.push(Patch::unmount(id));
    }

    // Release user values; their destructors may touch other cells
    let slots = node.slots.take();
    let contexts = node.contexts.take();
    let func = node.func.borrow_mut().take();
    let input = node.input.borrow_mut().take();
    drop((slots, contexts, func, input));
    node.staged.borrow_mut().take();
    node.committed.borrow_mut().take();

    trace!(node = %id, "node destroyed");
}

// =============================================================================
// INTROSPECTION
// =============================================================================

/// State of `node`; `Destroyed` for a node that existed and is gone, `None`
/// for an id this runtime never handed out.
pub fn node_status(node: NodeId) -> Option<NodeStatus> {
    with_context(|ctx| match ctx.node(node) {
        Some(n) => Some(n.status()),
        None if ctx.was_allocated(node) => Some(NodeStatus::Destroyed),
        None => None,
    })
}

/// The fragment the host currently shows for `node`.
pub fn node_fragment(node: NodeId) -> Option<Fragment> {
    with_context(|ctx| ctx.node(node)).and_then(|n| n.committed_fragment())
}

/// Cells read by the last successful execution of `node`, in first-read order.
pub fn node_read_set(node: NodeId) -> Vec<CellId> {
    with_context(|ctx| ctx.node(node))
        .map(|n| n.reads.borrow().keys().copied().collect())
        .unwrap_or_default()
}

pub fn node_children(node: NodeId) -> Vec<NodeId> {
    with_context(|ctx| ctx.node(node))
        .map(|n| n.children())
        .unwrap_or_default()
}

pub fn node_parent(node: NodeId) -> Option<NodeId> {
    with_context(|ctx| ctx.node(node)).and_then(|n| n.parent())
}

/// Number of live nodes on this thread.
pub fn node_count() -> usize {
    with_context(|ctx| ctx.node_count())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::cell::create_cell;
    use crate::reactivity::scheduling::flush;
    use std::cell::Cell as StdCell;

    #[test]
    fn define_requires_live_parent() {
        let missing = NodeId(u64::MAX - 1);
        let err = define_computation(Some(missing), |_| Fragment::text("x")).unwrap_err();
        assert_eq!(err, ComposeError::NodeNotFound(missing));
        assert_eq!(node_status(missing), None);
    }

    #[test]
    fn read_set_is_replaced_not_accumulated() {
        let flag = create_cell(true);
        let a = create_cell("a");
        let b = create_cell("b");
        let (f, a2, b2) = (flag.clone(), a.clone(), b.clone());
        let node = define_computation(None, move |_| {
            let text = if f.read() { a2.read() } else { b2.read() };
            Fragment::text(text)
        })
        .unwrap();
        flush().unwrap();
        assert_eq!(node_read_set(node), vec![flag.id(), a.id()]);

        flag.write(false);
        flush().unwrap();
        assert_eq!(node_read_set(node), vec![flag.id(), b.id()]);
        assert_eq!(a.subscriber_count(), 0);

        // `a` is no longer read, so writing it does nothing
        a.write("a2");
        assert_eq!(flush().unwrap().recomposed, vec![]);
        destroy_computation(node).unwrap();
    }

    #[test]
    fn destroy_runs_cleanups_and_releases_everything() {
        let cleaned = Rc::new(StdCell::new(0));
        let input = create_cell(1);
        let (c, i) = (cleaned.clone(), input.clone());
        let root = define_computation(None, move |composer| {
            let c = c.clone();
            composer.on_cleanup(move || c.set(c.get() + 1));
            let local = composer.remember_cell(|| 10);
            Fragment::text((i.read() + local.read()).to_string())
        })
        .unwrap();
        let child = define_computation(Some(root), |_| Fragment::text("child")).unwrap();
        flush().unwrap();

        assert_eq!(node_children(root), vec![child]);
        assert_eq!(node_parent(child), Some(root));
        assert_eq!(input.subscriber_count(), 1);

        destroy_computation(root).unwrap();
        assert_eq!(cleaned.get(), 1);
        assert_eq!(input.subscriber_count(), 0);
        assert_eq!(node_status(root), Some(NodeStatus::Destroyed));
        assert_eq!(node_status(child), Some(NodeStatus::Destroyed));
        assert_eq!(destroy_computation(root), Err(ComposeError::NodeNotFound(root)));

        // Unmounts are delivered by the next flush, child first
        let report = flush().unwrap();
        let order: Vec<NodeId> = report.patches.iter().map(|p| p.node).collect();
        assert_eq!(order, vec![child, root]);
        assert!(report.patches.iter().all(Patch::is_unmount));
    }

    #[test]
    fn panicking_node_keeps_previous_output() {
        let fail = create_cell(false);
        let f = fail.clone();
        let node = define_computation(None, move |_| {
            if f.read() {
                panic!("render failed");
            }
            Fragment::text("ok")
        })
        .unwrap();
        flush().unwrap();

        fail.write(true);
        let report = flush().unwrap();
        assert!(report.patches.is_empty());
        assert!(matches!(
            report.diagnostics.as_slice(),
            [ComposeError::NodePanicked { node: n, message }] if *n == node && message == "render failed"
        ));
        assert_eq!(node_fragment(node).unwrap().text_value(), Some("ok"));
        assert_eq!(node_read_set(node), vec![fail.id()]);

        fail.write(false);
        let report = flush().unwrap();
        assert!(report.diagnostics.is_empty());
        destroy_computation(node).unwrap();
    }

    #[test]
    fn staged_output_commits_on_settle() {
        let text = create_cell(String::from("a"));
        let t = text.clone();
        let node = define_computation(None, move |_| Fragment::text(t.read())).unwrap();
        assert!(node_fragment(node).is_none());
        flush().unwrap();
        assert_eq!(node_fragment(node).unwrap().text_value(), Some("a"));

        text.write(String::from("b"));
        assert_eq!(node_fragment(node).unwrap().text_value(), Some("a"));
        flush().unwrap();
        assert_eq!(node_fragment(node).unwrap().text_value(), Some("b"));
        destroy_computation(node).unwrap();
    }
}
