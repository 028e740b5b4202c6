// ============================================================================
// spark-compose - Host Bridge
// The one seam between the runtime and a rendering backend
// ============================================================================

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::warn;

use super::fragment::Fragment;
use super::patch::PatchSequence;
use crate::core::context::with_context;
use crate::core::types::NodeId;

// =============================================================================
// HOST BRIDGE TRAIT
// =============================================================================

/// A rendering backend.
///
/// `apply_patch` is called once per successful flush with every patch of
/// that flush, in order. It is never called for an empty sequence.
pub trait HostBridge {
    fn apply_patch(&mut self, patches: &PatchSequence);
}

impl<F> HostBridge for F
where
    F: FnMut(&PatchSequence),
{
    fn apply_patch(&mut self, patches: &PatchSequence) {
        self(patches)
    }
}

/// Install the host for the current thread, returning the previous one.
pub fn set_host(host: impl HostBridge + 'static) -> Option<Box<dyn HostBridge>> {
    with_context(|ctx| ctx.replace_host(Some(Box::new(host))))
}

/// Remove the current thread's host.
pub fn take_host() -> Option<Box<dyn HostBridge>> {
    with_context(|ctx| ctx.replace_host(None))
}

/// Hand a settled patch sequence to the host.
///
/// The host is taken out of the context for the call so it may itself
/// install a replacement.
pub(crate) fn deliver(patches: &PatchSequence) {
    if patches.is_empty() {
        return;
    }
    let Some(mut host) = take_host() else {
        return;
    };
    host.apply_patch(patches);
    with_context(|ctx| {
        if !ctx.has_host() {
            ctx.replace_host(Some(host));
        }
    });
}

// =============================================================================
// HOST TREE
// =============================================================================

#[derive(Default)]
struct HostState {
    mounts: HashMap<NodeId, Fragment>,
    history: Vec<PatchSequence>,
    skipped: usize,
}

/// In-memory host: keeps one mounted fragment per node.
///
/// Clones share state, so one clone can be installed with [`set_host`]
/// while another is inspected.
///
/// ```
/// use spark_compose::{create_cell, define_computation, flush, set_host, Fragment, HostTree};
///
/// let host = HostTree::new();
/// set_host(host.clone());
///
/// let count = create_cell(0);
/// let c = count.clone();
/// let node = define_computation(None, move |_| Fragment::text(format!("Count: {}", c.read())))
///     .unwrap();
/// flush().unwrap();
///
/// assert_eq!(host.mount(node).unwrap().text_value(), Some("Count: 0"));
/// ```
#[derive(Clone, Default)]
pub struct HostTree {
    state: Rc<RefCell<HostState>>,
}

impl HostTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// The fragment currently mounted for `node`.
    pub fn mount(&self, node: NodeId) -> Option<Fragment> {
        self.state.borrow().mounts.get(&node).cloned()
    }

    pub fn is_mounted(&self, node: NodeId) -> bool {
        self.state.borrow().mounts.contains_key(&node)
    }

    pub fn mount_count(&self) -> usize {
        self.state.borrow().mounts.len()
    }

    /// The tree under `root` with every slot replaced by its node's mount.
    /// Slots of unmounted nodes are left in place.
    pub fn compose(&self, root: NodeId) -> Option<Fragment> {
        let state = self.state.borrow();
        state.mounts.get(&root).map(|f| resolve(f, &state.mounts))
    }

    /// Every sequence received so far, oldest first.
    pub fn history(&self) -> Vec<PatchSequence> {
        self.state.borrow().history.clone()
    }

    /// The most recently received sequence.
    pub fn last(&self) -> Option<PatchSequence> {
        self.state.borrow().history.last().cloned()
    }

    pub fn apply_count(&self) -> usize {
        self.state.borrow().history.len()
    }

    /// Edits rejected as malformed.
    pub fn skipped_edits(&self) -> usize {
        self.state.borrow().skipped
    }
}

fn resolve(fragment: &Fragment, mounts: &HashMap<NodeId, Fragment>) -> Fragment {
    if let Some(mounted) = fragment.slot_target().and_then(|id| mounts.get(&id)) {
        return resolve(mounted, mounts);
    }
    let mut out = fragment.clone();
    for child in out.children_mut() {
        *child = resolve(child, mounts);
    }
    out
}

impl HostBridge for HostTree {
    fn apply_patch(&mut self, patches: &PatchSequence) {
        let mut state = self.state.borrow_mut();
        for patch in patches {
            let mut root = state.mounts.remove(&patch.node);
            for edit in &patch.edits {
                if let Err(error) = edit.apply_to(&mut root) {
                    warn!(node = %patch.node, %error, "host skipped a malformed edit");
                    state.skipped += 1;
                }
            }
            if let Some(root) = root {
                state.mounts.insert(patch.node, root);
            }
        }
        state.history.push(patches.clone());
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::fragment::Key;
    use crate::render::patch::{Edit, Patch, Path};
    use smallvec::smallvec;

    fn mount(node: NodeId, fragment: Fragment) -> Patch {
        Patch::new(
            node,
            vec![Edit::Insert {
                at: Path::new(),
                fragment,
            }],
        )
    }

    #[test]
    fn applies_and_composes() {
        let mut host = HostTree::new();
        let parent = NodeId(1);
        let child = NodeId(2);

        host.apply_patch(&PatchSequence::new(vec![
            mount(
                parent,
                Fragment::new("col").child(Fragment::slot(Key::from("c"), child)),
            ),
            mount(child, Fragment::text("inner")),
        ]));

        let composed = host.compose(parent).unwrap();
        assert_eq!(composed.children()[0].text_value(), Some("inner"));
        assert_eq!(host.mount_count(), 2);
        assert_eq!(host.apply_count(), 1);

        host.apply_patch(&PatchSequence::new(vec![Patch::unmount(child)]));
        assert!(!host.is_mounted(child));
        assert!(host.compose(parent).unwrap().children()[0].is_slot());
    }

    #[test]
    fn malformed_edits_are_skipped() {
        let mut host = HostTree::new();
        host.apply_patch(&PatchSequence::new(vec![
            mount(NodeId(1), Fragment::new("col")),
            Patch::new(NodeId(1), vec![Edit::Remove { at: smallvec![4] }]),
        ]));
        assert_eq!(host.skipped_edits(), 1);
        assert!(host.is_mounted(NodeId(1)));
    }

    #[test]
    fn closures_are_hosts() {
        let seen = Rc::new(RefCell::new(0));
        let s = seen.clone();
        let mut host = move |patches: &PatchSequence| *s.borrow_mut() += patches.len();
        host.apply_patch(&PatchSequence::new(vec![Patch::unmount(NodeId(3))]));
        assert_eq!(*seen.borrow(), 1);
    }

    #[test]
    fn deliver_skips_empty_sequences() {
        let host = HostTree::new();
        set_host(host.clone());
        deliver(&PatchSequence::default());
        assert_eq!(host.apply_count(), 0);

        deliver(&PatchSequence::new(vec![mount(NodeId(5), Fragment::text("x"))]));
        assert_eq!(host.apply_count(), 1);
        assert!(take_host().is_some());
    }
}
