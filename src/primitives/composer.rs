// ============================================================================
// spark-compose - Composer
// What a node function can do while it runs
// ============================================================================
//
// `remember` and `on_cleanup` are positional: the n-th call of one run
// refers to the n-th call of every other run. Calls must therefore happen
// in the same order each time, the usual rule for slot tables.
// ============================================================================

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tracing::warn;

use crate::core::constants::*;
use crate::core::context::with_context;
use crate::core::types::NodeId;
use crate::error::ComposeError;
use crate::primitives::cell::{create_owned_cell, CellHandle};
use crate::primitives::derived::{derived, Derived};
use crate::primitives::node::{recompose, NodeFn, NodeInner};
use crate::primitives::provide::lookup_context;
use crate::render::fragment::{Fragment, Key};

/// Children declared and spawned by one run.
pub(crate) struct Composed {
    pub declared: HashSet<NodeId>,
    pub created: Vec<NodeId>,
}

/// Handle passed to a node function.
pub struct Composer {
    node: Rc<NodeInner>,
    slot_cursor: usize,
    cleanup_cursor: usize,
    seen_keys: HashMap<Key, u32>,
    declared: HashSet<NodeId>,
    created: Vec<NodeId>,
}

impl Composer {
    pub(crate) fn new(node: Rc<NodeInner>) -> Self {
        Self {
            node,
            slot_cursor: 0,
            cleanup_cursor: 0,
            seen_keys: HashMap::new(),
            declared: HashSet::new(),
            created: Vec::new(),
        }
    }

    pub(crate) fn finish(self) -> Composed {
        Composed {
            declared: self.declared,
            created: self.created,
        }
    }

    /// Id of the node being executed.
    pub fn node_id(&self) -> NodeId {
        self.node.id()
    }

    // =========================================================================
    // CHILDREN
    // =========================================================================

    /// Declare a child computation under `key` and return its slot fragment.
    ///
    /// The first declaration creates the child and runs it right away.
    /// Later declarations keep the child (and its cells) and swap in `f`
    /// without running it; the child reruns when its own reads change. A
    /// child that is not declared again is destroyed after this run.
    ///
    /// ```
    /// use spark_compose::{define_computation, flush, node_children, Fragment};
    ///
    /// let root = define_computation(None, |c| {
    ///     Fragment::new("col")
    ///         .child(c.child("title", |_| Fragment::text("Hello")))
    ///         .child(c.child("body", |_| Fragment::text("World")))
    /// })
    /// .unwrap();
    /// flush().unwrap();
    ///
    /// assert_eq!(node_children(root).len(), 2);
    /// ```
    pub fn child<F>(&mut self, key: impl Into<Key>, f: F) -> Fragment
    where
        F: FnMut(&mut Composer) -> Fragment + 'static,
    {
        let key = self.claim_key(key.into());
        let id = match self.existing_child(&key) {
            Some(child) => {
                child.replace_func(Box::new(f));
                child.id()
            }
            None => self.spawn_child(key.clone(), Box::new(f), None),
        };
        self.declared.insert(id);
        Fragment::slot(key, id)
    }

    /// Like [`child`](Self::child), but the child reruns immediately
    /// whenever `input` differs from the input of the previous declaration.
    pub fn child_with<I, F>(&mut self, key: impl Into<Key>, input: I, f: F) -> Fragment
    where
        I: PartialEq + 'static,
        F: FnMut(&mut Composer) -> Fragment + 'static,
    {
        let key = self.claim_key(key.into());
        let id = match self.existing_child(&key) {
            Some(child) => {
                let changed = child.input_differs(&input);
                child.replace_func(Box::new(f));
                if changed {
                    child.set_input(Some(Rc::new(input)));
                    child.set_status(DIRTY);
                    recompose(&child);
                }
                child.id()
            }
            None => self.spawn_child(key.clone(), Box::new(f), Some(Rc::new(input))),
        };
        self.declared.insert(id);
        Fragment::slot(key, id)
    }

    /// Repeated keys get an occurrence suffix and a diagnostic.
    fn claim_key(&mut self, key: Key) -> Key {
        let seen = self.seen_keys.entry(key.clone()).or_insert(0);
        let occurrence = *seen;
        *seen += 1;
        if occurrence == 0 {
            return key;
        }

        let node = self.node.id();
        warn!(%node, %key, "child key declared more than once");
        with_context(|ctx| {
            ctx.push_diagnostic(ComposeError::KeyCollision {
                node,
                key: key.clone(),
            })
        });
        Key::Occurrence(Box::new(key), occurrence)
    }

    fn existing_child(&self, key: &Key) -> Option<Rc<NodeInner>> {
        let id = self.node.keyed_child(key)?;
        with_context(|ctx| ctx.node(id)).filter(|child| !child.is_destroyed())
    }

    fn spawn_child(&mut self, key: Key, func: NodeFn, input: Option<Rc<dyn std::any::Any>>) -> NodeId {
        let parent = self.node.id();
        let id = with_context(|ctx| ctx.allocate_node_id());
        let child = Rc::new(NodeInner::new(
            id,
            Some(parent),
            self.node.depth() + 1,
            Some(key.clone()),
            COMPOSED,
            func,
        ));
        child.set_input(input);
        with_context(|ctx| {
            ctx.insert_node(child.clone());
            ctx.record_created(id);
        });
        self.node.register_child(id, Some(key));
        self.created.push(id);

        recompose(&child);
        id
    }

    // =========================================================================
    // SLOT TABLE
    // =========================================================================

    /// A value kept across runs of this node, created by `init` on the first.
    ///
    /// If the slot at this position holds a different type (the call order
    /// changed), it is replaced.
    pub fn remember<T: 'static>(&mut self, init: impl FnOnce() -> T) -> Rc<T> {
        let index = self.slot_cursor;
        self.slot_cursor += 1;

        if let Some(existing) = self.node.slot(index) {
            if let Ok(value) = existing.downcast::<T>() {
                return value;
            }
        }
        let value = Rc::new(init());
        self.node.set_slot(index, value.clone());
        value
    }

    /// A cell owned by this node, kept across runs.
    ///
    /// ```
    /// use spark_compose::{define_computation, flush, Fragment};
    ///
    /// define_computation(None, |c| {
    ///     let clicks = c.remember_cell(|| 0u32);
    ///     Fragment::new("button").attr("label", format!("Clicked {}", clicks.read()))
    /// })
    /// .unwrap();
    /// flush().unwrap();
    /// ```
    pub fn remember_cell<T: 'static>(&mut self, init: impl FnOnce() -> T) -> CellHandle<T> {
        let owner = self.node.id();
        (*self.remember(|| create_owned_cell(init(), owner))).clone()
    }

    /// A derived store kept across runs. `compute` is only used on the first.
    pub fn remember_derived<T, F>(&mut self, compute: F) -> Derived<T>
    where
        T: PartialEq + 'static,
        F: Fn() -> T + 'static,
    {
        (*self.remember(|| derived(compute))).clone()
    }

    // =========================================================================
    // CONTEXT VALUES
    // =========================================================================

    /// Provide a `T` to this node and its descendants.
    ///
    /// The value lives in a cell owned by this node; `init` only runs the
    /// first time. Write the returned cell to change what descendants see.
    pub fn provide<T: 'static>(&mut self, init: impl FnOnce() -> T) -> CellHandle<T> {
        if let Some(cell) = self.node.context::<T>() {
            return cell;
        }
        let cell = create_owned_cell(init(), self.node.id());
        self.node.set_context(cell.clone());
        cell
    }

    /// The nearest `T` provided by this node or an ancestor.
    pub fn consume<T: 'static>(&self) -> Option<CellHandle<T>> {
        lookup_context::<T>(self.node.id())
    }

    // =========================================================================
    // CLEANUP
    // =========================================================================

    /// Run `f` once when this node is destroyed. Registered on the first run
    /// only.
    pub fn on_cleanup(&mut self, f: impl FnOnce() + 'static) {
        let index = self.cleanup_cursor;
        self.cleanup_cursor += 1;
        if index >= self.node.cleanup_count() {
            self.node.add_cleanup(Box::new(f));
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::cell::create_cell;
    use crate::primitives::node::{define_computation, destroy_computation, node_children};
    use crate::reactivity::scheduling::flush;
    use std::cell::Cell as StdCell;

    #[test]
    fn remember_survives_reruns() {
        let tick = create_cell(0);
        let inits = Rc::new(StdCell::new(0));
        let (t, i) = (tick.clone(), inits.clone());
        let node = define_computation(None, move |c| {
            let i = i.clone();
            let stable = c.remember(move || {
                i.set(i.get() + 1);
                vec![1, 2, 3]
            });
            Fragment::text(format!("{}:{}", t.read(), stable.len()))
        })
        .unwrap();

        flush().unwrap();
        tick.write(1);
        flush().unwrap();
        assert_eq!(inits.get(), 1);
        destroy_computation(node).unwrap();
    }

    #[test]
    fn remembered_cell_is_owned_and_stable() {
        let ids = Rc::new(std::cell::RefCell::new(Vec::new()));
        let bump = create_cell(0);
        let (b, seen) = (bump.clone(), ids.clone());
        let node = define_computation(None, move |c| {
            b.read();
            let local = c.remember_cell(|| 5);
            seen.borrow_mut().push((local.id(), local.owner()));
            Fragment::text(local.read().to_string())
        })
        .unwrap();
        flush().unwrap();
        bump.write(1);
        flush().unwrap();

        let ids = ids.borrow();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);
        assert_eq!(ids[0].1, Some(node));
        destroy_computation(node).unwrap();
    }

    #[test]
    fn child_is_reused_by_key() {
        let outer = create_cell(0);
        let child_runs = Rc::new(StdCell::new(0));
        let (o, r) = (outer.clone(), child_runs.clone());
        let root = define_computation(None, move |c| {
            let r = r.clone();
            let n = o.read();
            Fragment::new("col")
                .attr("n", n as i64)
                .child(c.child("stable", move |_| {
                    r.set(r.get() + 1);
                    Fragment::text("child")
                }))
        })
        .unwrap();
        flush().unwrap();
        let first = node_children(root);

        outer.write(1);
        flush().unwrap();
        assert_eq!(node_children(root), first);
        assert_eq!(child_runs.get(), 1);
        destroy_computation(root).unwrap();
    }

    #[test]
    fn child_with_reruns_on_changed_input() {
        let label = create_cell(String::from("a"));
        let runs = Rc::new(StdCell::new(0));
        let (l, r) = (label.clone(), runs.clone());
        let root = define_computation(None, move |c| {
            let text = l.read();
            let r = r.clone();
            let shown = text.clone();
            c.child_with("label", text, move |_| {
                r.set(r.get() + 1);
                Fragment::text(shown.clone())
            })
        })
        .unwrap();
        flush().unwrap();
        assert_eq!(runs.get(), 1);

        // Same input: parent reruns, child does not
        label.write(String::from("a"));
        flush().unwrap();
        assert_eq!(runs.get(), 1);

        label.write(String::from("b"));
        let report = flush().unwrap();
        assert_eq!(runs.get(), 2);
        assert_eq!(report.recomposed.len(), 2);
        destroy_computation(root).unwrap();
    }

    #[test]
    fn undeclared_children_are_destroyed() {
        let show = create_cell(true);
        let s = show.clone();
        let root = define_computation(None, move |c| {
            let mut col = Fragment::new("col");
            if s.read() {
                col = col.child(c.child("extra", |_| Fragment::text("extra")));
            }
            col
        })
        .unwrap();
        flush().unwrap();
        let extra = node_children(root)[0];

        show.write(false);
        let report = flush().unwrap();
        assert!(node_children(root).is_empty());
        let order: Vec<NodeId> = report.patches.iter().map(|p| p.node).collect();
        assert_eq!(order, vec![extra, root]);
        destroy_computation(root).unwrap();
    }

    #[test]
    fn duplicate_child_keys_are_disambiguated() {
        let root = define_computation(None, |c| {
            Fragment::new("row")
                .child(c.child("cell", |_| Fragment::text("1")))
                .child(c.child("cell", |_| Fragment::text("2")))
        })
        .unwrap();
        let report = flush().unwrap();
        assert_eq!(node_children(root).len(), 2);
        assert!(report
            .diagnostics
            .iter()
            .any(|d| matches!(d, ComposeError::KeyCollision { node, .. } if *node == root)));
        destroy_computation(root).unwrap();
    }

    #[test]
    fn cleanup_registers_once() {
        let bump = create_cell(0);
        let calls = Rc::new(StdCell::new(0));
        let (b, c2) = (bump.clone(), calls.clone());
        let node = define_computation(None, move |c| {
            b.read();
            let c2 = c2.clone();
            c.on_cleanup(move || c2.set(c2.get() + 1));
            Fragment::text("x")
        })
        .unwrap();
        flush().unwrap();
        bump.write(1);
        flush().unwrap();
        destroy_computation(node).unwrap();
        assert_eq!(calls.get(), 1);
    }
}
