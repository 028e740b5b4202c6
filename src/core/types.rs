// ============================================================================
// spark-compose - Type Definitions
// Identifiers and type-erased traits for the dependency graph
// ============================================================================

use std::any::Any;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use super::constants::*;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Identifier of a computation node.
///
/// Ids are allocated from a per-thread counter and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    /// Raw numeric value of the id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Identifier of a cell or derived store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(pub(crate) u64);

impl CellId {
    /// Raw numeric value of the id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

// =============================================================================
// SUBSCRIBERS
// =============================================================================
//
// A cell's subscriber set names the readers that depend on it. Computation
// nodes are addressed by id and looked up in the runtime registry. Derived
// stores are both readers and sources, so they are held weakly: a dropped
// derived store simply disappears from the graph.
// =============================================================================

/// Hashable identity of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriberKey {
    Node(NodeId),
    Derived(CellId),
}

/// A reader registered in a cell's subscriber set.
#[derive(Clone)]
pub enum Subscriber {
    Node(NodeId),
    Derived {
        id: CellId,
        inner: Weak<dyn AnyDerived>,
    },
}

impl Subscriber {
    pub fn key(&self) -> SubscriberKey {
        match self {
            Subscriber::Node(id) => SubscriberKey::Node(*id),
            Subscriber::Derived { id, .. } => SubscriberKey::Derived(*id),
        }
    }

    /// Whether the subscriber can still be notified.
    pub fn is_alive(&self) -> bool {
        match self {
            Subscriber::Node(_) => true,
            Subscriber::Derived { inner, .. } => inner.strong_count() > 0,
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscriber::Node(id) => f.debug_tuple("Node").field(id).finish(),
            Subscriber::Derived { id, .. } => f.debug_tuple("Derived").field(id).finish(),
        }
    }
}

// =============================================================================
// READ-SETS
// =============================================================================

/// One entry of a read-set: the cell and the version observed when it was read.
#[derive(Clone)]
pub struct Dependency {
    pub cell: Rc<dyn AnyCell>,
    pub version: u64,
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("cell", &self.cell.id())
            .field("version", &self.version)
            .finish()
    }
}

/// Cells read during one execution, in first-read order.
pub type ReadSet = IndexMap<CellId, Dependency>;

// =============================================================================
// TYPE-ERASED TRAITS
// =============================================================================
//
// Graph operations (subscribe, notify, version checks) never need the value
// type. Only reading and writing values does. Cells of any T are therefore
// stored as Rc<dyn AnyCell> in read-sets.
// =============================================================================

/// Type-erased source interface.
///
/// Implemented by `CellInner<T>` and `DerivedInner<T>`.
pub trait AnyCell: Any {
    fn id(&self) -> CellId;

    fn flags(&self) -> u32;

    fn set_flags(&self, flags: u32);

    /// Version counter. Cells bump it on every write; derived stores only
    /// when their value changes.
    fn version(&self) -> u64;

    /// Node that owns this cell, if any
    fn owner(&self) -> Option<NodeId> {
        None
    }

    fn subscriber_count(&self) -> usize;

    /// Add a subscriber. Adding the same key twice is a no-op.
    fn add_subscriber(&self, subscriber: Subscriber);

    fn remove_subscriber(&self, key: &SubscriberKey);

    /// Snapshot of live subscribers; dead derived entries are pruned.
    fn subscribers(&self) -> Vec<Subscriber>;

    /// Remove and return every subscriber.
    fn take_subscribers(&self) -> Vec<Subscriber>;

    /// Bring the value up to date. Cells are always current; derived
    /// stores recompute if stale.
    fn refresh(&self) {}

    /// Apply a value sent from another thread. Returns false on a type mismatch.
    fn write_boxed(&self, _value: Box<dyn Any + Send>) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;

    fn is_destroyed(&self) -> bool {
        self.flags() & DESTROYED != 0
    }

    fn is_derived(&self) -> bool {
        self.flags() & DERIVED != 0
    }
}

/// Reader side of a derived store.
pub trait AnyDerived {
    fn id(&self) -> CellId;

    /// Mark the store stale. Returns true if it was clean before, in which
    /// case its own subscribers must be notified.
    fn mark_stale(&self) -> bool;

    /// Forget a cell that was destroyed.
    fn drop_dependency(&self, cell: CellId);

    /// The store as a source.
    fn as_cell(&self) -> Option<Rc<dyn AnyCell>>;
}

// =============================================================================
// EQUALITY
// =============================================================================

/// Equality function type for opt-in write suppression
pub type EqualsFn<T> = fn(&T, &T) -> bool;

/// Default equality using PartialEq
pub fn default_equals<T: PartialEq>(a: &T, b: &T) -> bool {
    a == b
}

// =============================================================================
// NODE STATUS
// =============================================================================

/// Public view of a computation node's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Clean,
    Dirty,
    Recomposing,
    Destroyed,
}

impl NodeStatus {
    pub fn from_flags(flags: u32) -> Self {
        if flags & DESTROYED != 0 {
            NodeStatus::Destroyed
        } else if flags & RECOMPOSING != 0 {
            NodeStatus::Recomposing
        } else if flags & (DIRTY | MAYBE_DIRTY) != 0 {
            NodeStatus::Dirty
        } else {
            NodeStatus::Clean
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_with_prefix() {
        assert_eq!(NodeId(7).to_string(), "node#7");
        assert_eq!(CellId(3).to_string(), "cell#3");
    }

    #[test]
    fn subscriber_key_identifies_nodes() {
        let a = Subscriber::Node(NodeId(1));
        let b = Subscriber::Node(NodeId(1));
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), Subscriber::Node(NodeId(2)).key());
    }

    #[test]
    fn status_from_flags() {
        assert_eq!(NodeStatus::from_flags(VIEW | CLEAN), NodeStatus::Clean);
        assert_eq!(NodeStatus::from_flags(VIEW | DIRTY), NodeStatus::Dirty);
        assert_eq!(NodeStatus::from_flags(VIEW | MAYBE_DIRTY), NodeStatus::Dirty);
        assert_eq!(
            NodeStatus::from_flags(VIEW | CLEAN | RECOMPOSING),
            NodeStatus::Recomposing
        );
        assert_eq!(
            NodeStatus::from_flags(VIEW | DIRTY | DESTROYED),
            NodeStatus::Destroyed
        );
    }

    #[test]
    fn default_equals_uses_partial_eq() {
        assert!(default_equals(&1, &1));
        assert!(!default_equals(&"a", &"b"));
    }
}
