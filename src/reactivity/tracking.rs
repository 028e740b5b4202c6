// ============================================================================
// spark-compose - Dependency Tracking
// Recording reads into read-sets and propagating writes to subscribers
// ============================================================================
//
// Every execution of a node or derived store runs inside its own tracking
// frame. Reads land in the top frame only, so nested executions never leak
// dependencies into their parent. A reader is subscribed at the moment it
// first reads a cell; cells dropped from the read-set are unsubscribed when
// the execution ends.
//
// Borrow scoping follows the "collect-then-mutate" pattern throughout:
// subscriber lists are copied out of their RefCell before anyone is notified.
// ============================================================================

use std::rc::Rc;

use crate::core::constants::*;
use crate::core::context::{with_context, TrackingFrame};
use crate::core::types::{AnyCell, Dependency, NodeId, ReadSet, Subscriber};
use crate::reactivity::scheduling::schedule;

// =============================================================================
// FRAMES
// =============================================================================

/// Push a fresh frame for `subscriber`.
pub fn begin_tracking(subscriber: Subscriber) {
    with_context(|ctx| {
        ctx.push_frame(TrackingFrame {
            subscriber,
            reads: ReadSet::new(),
        })
    });
}

/// Pop the top frame and return what it read.
pub fn end_tracking() -> ReadSet {
    with_context(|ctx| ctx.pop_frame())
        .map(|frame| frame.reads)
        .unwrap_or_default()
}

/// RAII guard over [`begin_tracking`] / [`end_tracking`].
///
/// If the tracked computation unwinds, the frame is popped on drop and its
/// read-set discarded.
pub struct Tracking {
    finished: bool,
}

impl Tracking {
    pub fn begin(subscriber: Subscriber) -> Self {
        begin_tracking(subscriber);
        Self { finished: false }
    }

    /// End tracking and return the read-set.
    pub fn finish(mut self) -> ReadSet {
        self.finished = true;
        end_tracking()
    }
}

impl Drop for Tracking {
    fn drop(&mut self) {
        if !self.finished {
            end_tracking();
        }
    }
}

// =============================================================================
// TRACK READ
// =============================================================================

/// Record a read of `cell` in the top frame and subscribe the frame's owner.
///
/// Outside any frame, or inside `untrack`, this does nothing. Repeated reads
/// within one execution keep the version seen first.
pub fn track_read(cell: Rc<dyn AnyCell>) {
    let subscriber = with_context(|ctx| {
        if ctx.is_untracking() {
            return None;
        }
        ctx.with_top_frame(|frame| {
            let id = cell.id();
            if frame.reads.contains_key(&id) {
                return None;
            }
            frame.reads.insert(
                id,
                Dependency {
                    cell: cell.clone(),
                    version: cell.version(),
                },
            );
            Some(frame.subscriber.clone())
        })
        .flatten()
    });

    if let Some(subscriber) = subscriber {
        cell.add_subscriber(subscriber);
    }
}

// =============================================================================
// INSTALL DEPENDENCIES
// =============================================================================

/// Unsubscribe `subscriber` from every cell in `previous` that is absent
/// from `next`.
///
/// Cells in `next` were subscribed as they were read, so afterwards the
/// subscriber is registered on exactly the cells of `next`.
pub fn install_dependencies(subscriber: &Subscriber, previous: &ReadSet, next: &ReadSet) {
    let key = subscriber.key();
    for (id, dep) in previous {
        if !next.contains_key(id) {
            dep.cell.remove_subscriber(&key);
        }
    }
}

/// Unsubscribe `subscriber` from every cell in `reads`.
pub fn release_dependencies(subscriber: &Subscriber, reads: &ReadSet) {
    let key = subscriber.key();
    for dep in reads.values() {
        dep.cell.remove_subscriber(&key);
    }
}

// =============================================================================
// NOTIFY WRITE
// =============================================================================

/// Propagate a write of `source` to everything downstream.
///
/// Direct node subscribers become DIRTY. Derived subscribers are marked
/// stale, and their own node subscribers become MAYBE_DIRTY: whether they
/// actually recompose is decided at flush time by comparing versions.
///
/// Nothing is executed here. Nodes only land in the scheduler's dirty set.
pub fn notify_write(source: &dyn AnyCell) {
    let mut nodes: Vec<(NodeId, u32)> = Vec::new();

    // Explicit stack instead of recursion for deep derived chains
    let mut stack: Vec<Rc<dyn AnyCell>> = Vec::new();
    collect_subscribers(source.subscribers(), DIRTY, &mut nodes, &mut stack);

    while let Some(derived) = stack.pop() {
        collect_subscribers(derived.subscribers(), MAYBE_DIRTY, &mut nodes, &mut stack);
    }

    for (id, status) in nodes {
        schedule(id, status);
    }
}

fn collect_subscribers(
    subscribers: Vec<Subscriber>,
    status: u32,
    nodes: &mut Vec<(NodeId, u32)>,
    stack: &mut Vec<Rc<dyn AnyCell>>,
) {
    for subscriber in subscribers {
        match subscriber {
            Subscriber::Node(id) => nodes.push((id, status)),
            Subscriber::Derived { inner, .. } => {
                let Some(derived) = inner.upgrade() else {
                    continue;
                };
                // Already stale means its subscribers were told before
                if derived.mark_stale() {
                    if let Some(cell) = derived.as_cell() {
                        stack.push(cell);
                    }
                }
            }
        }
    }
}

// =============================================================================
// VERSION CHECK
// =============================================================================

/// Whether any cell in `reads` moved past the version recorded for it.
///
/// Derived stores are refreshed first, so a derived whose recomputation
/// produced an equal value does not count as changed.
pub fn reads_changed(reads: &ReadSet) -> bool {
    let deps: Vec<Dependency> = reads.values().cloned().collect();
    deps.iter().any(|dep| {
        dep.cell.refresh();
        dep.cell.version() != dep.version
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SubscriberKey;
    use crate::primitives::cell::create_cell;
    use crate::primitives::derived::derived;
    use crate::reactivity::batching::untrack;

    fn probe() -> Subscriber {
        Subscriber::Node(with_context(|ctx| ctx.allocate_node_id()))
    }

    #[test]
    fn reads_outside_frames_are_ignored() {
        let cell = create_cell(1);
        assert_eq!(cell.read(), 1);
        assert_eq!(cell.subscriber_count(), 0);
    }

    #[test]
    fn frame_collects_reads_once() {
        let a = create_cell(1);
        let b = create_cell(2);
        let me = probe();

        let tracking = Tracking::begin(me.clone());
        a.read();
        b.read();
        a.read();
        let reads = tracking.finish();

        assert_eq!(reads.len(), 2);
        assert_eq!(reads.keys().copied().collect::<Vec<_>>(), vec![a.id(), b.id()]);
        assert_eq!(a.subscriber_count(), 1);
        assert_eq!(b.subscriber_count(), 1);
        release_dependencies(&me, &reads);
        assert_eq!(a.subscriber_count(), 0);
    }

    #[test]
    fn nested_frames_are_isolated() {
        let outer_cell = create_cell(1);
        let inner_cell = create_cell(2);

        let outer = Tracking::begin(probe());
        outer_cell.read();
        let inner = Tracking::begin(probe());
        inner_cell.read();
        let inner_reads = inner.finish();
        let outer_reads = outer.finish();

        assert!(inner_reads.contains_key(&inner_cell.id()));
        assert!(!inner_reads.contains_key(&outer_cell.id()));
        assert!(outer_reads.contains_key(&outer_cell.id()));
        assert!(!outer_reads.contains_key(&inner_cell.id()));
    }

    #[test]
    fn untrack_suspends_recording() {
        let cell = create_cell(1);
        let tracking = Tracking::begin(probe());
        untrack(|| cell.read());
        let reads = tracking.finish();
        assert!(reads.is_empty());
        assert_eq!(cell.subscriber_count(), 0);
    }

    #[test]
    fn guard_pops_frame_on_unwind() {
        let depth_before = with_context(|ctx| ctx.frame_depth());
        let result = std::panic::catch_unwind(|| {
            let _tracking = Tracking::begin(Subscriber::Node(NodeId(999_999)));
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(with_context(|ctx| ctx.frame_depth()), depth_before);
    }

    #[test]
    fn install_drops_only_missing_cells() {
        let a = create_cell(1);
        let b = create_cell(2);
        let me = probe();

        let first = Tracking::begin(me.clone());
        a.read();
        b.read();
        let previous = first.finish();

        let second = Tracking::begin(me.clone());
        b.read();
        let next = second.finish();

        install_dependencies(&me, &previous, &next);
        assert_eq!(a.subscriber_count(), 0);
        assert_eq!(b.subscriber_count(), 1);
        release_dependencies(&me, &next);
    }

    #[test]
    fn version_check_sees_writes_and_ignores_equal_derived() {
        let source = create_cell(2);
        let parity = derived({
            let source = source.clone();
            move || source.read() % 2
        });

        let tracking = Tracking::begin(probe());
        parity.read();
        source.read();
        let reads = tracking.finish();
        assert!(!reads_changed(&reads));

        let only_derived: ReadSet = reads
            .iter()
            .filter(|(_, dep)| dep.cell.is_derived())
            .map(|(id, dep)| (*id, dep.clone()))
            .collect();

        source.write(4);
        assert!(reads_changed(&reads));
        assert!(!reads_changed(&only_derived));

        source.write(5);
        assert!(reads_changed(&only_derived));
    }

    #[test]
    fn subscriber_keys_distinguish_kinds() {
        let cell = create_cell(0);
        let node = probe();
        cell.inner().add_subscriber(node.clone());
        cell.inner().add_subscriber(node.clone());
        assert_eq!(cell.subscriber_count(), 1);
        cell.inner().remove_subscriber(&node.key());
        assert_eq!(cell.subscriber_count(), 0);
        assert_ne!(node.key(), SubscriberKey::Derived(cell.id()));
    }
}
