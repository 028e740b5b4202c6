// ============================================================================
// spark-compose - Cell Primitive
// One observable storage location
// ============================================================================

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::{trace, warn};

use crate::core::constants::*;
use crate::core::context::with_context;
use crate::core::types::{
    default_equals, AnyCell, CellId, EqualsFn, NodeId, Subscriber, SubscriberKey,
};
use crate::error::{ComposeError, Result};
use crate::primitives::remote::RemoteWriter;
use crate::reactivity::tracking::{notify_write, track_read};

// =============================================================================
// CELL INNER
// =============================================================================

/// Storage behind a [`CellHandle`].
pub struct CellInner<T> {
    id: CellId,
    flags: Cell<u32>,

    /// Bumped on every committed write
    version: Cell<u64>,

    value: RefCell<T>,

    subscribers: RefCell<IndexMap<SubscriberKey, Subscriber>>,

    owner: Option<NodeId>,
}

impl<T> CellInner<T> {
    fn new(value: T, owner: Option<NodeId>) -> Self {
        Self {
            id: with_context(|ctx| ctx.allocate_cell_id()),
            flags: Cell::new(CELL | CLEAN),
            version: Cell::new(0),
            value: RefCell::new(value),
            subscribers: RefCell::new(IndexMap::new()),
            owner,
        }
    }
}

impl<T: 'static> AnyCell for CellInner<T> {
    fn id(&self) -> CellId {
        self.id
    }

    fn flags(&self) -> u32 {
        self.flags.get()
    }

    fn set_flags(&self, flags: u32) {
        self.flags.set(flags);
    }

    fn version(&self) -> u64 {
        self.version.get()
    }

    fn owner(&self) -> Option<NodeId> {
        self.owner
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.borrow().len()
    }

    fn add_subscriber(&self, subscriber: Subscriber) {
        self.subscribers
            .borrow_mut()
            .entry(subscriber.key())
            .or_insert(subscriber);
    }

    fn remove_subscriber(&self, key: &SubscriberKey) {
        self.subscribers.borrow_mut().shift_remove(key);
    }

    fn subscribers(&self) -> Vec<Subscriber> {
        let mut subscribers = self.subscribers.borrow_mut();
        subscribers.retain(|_, s| s.is_alive());
        subscribers.values().cloned().collect()
    }

    fn take_subscribers(&self) -> Vec<Subscriber> {
        self.subscribers.take().into_values().collect()
    }

    fn write_boxed(&self, value: Box<dyn Any + Send>) -> bool {
        match value.downcast::<T>() {
            Ok(value) => {
                store(self, *value);
                true
            }
            Err(_) => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Replace the value, bump the version and notify subscribers.
fn store<T: 'static>(inner: &CellInner<T>, value: T) {
    *inner.value.borrow_mut() = value;
    commit_write(inner);
}

fn commit_write<T: 'static>(inner: &CellInner<T>) {
    inner.version.set(inner.version.get() + 1);
    with_context(|ctx| ctx.increment_write_version());
    trace!(cell = %inner.id, version = inner.version.get(), "cell written");
    notify_write(inner);
}

// =============================================================================
// CELL HANDLE
// =============================================================================

/// Cloneable handle to a cell.
///
/// # Example
///
/// ```
/// use spark_compose::create_cell;
///
/// let count = create_cell(0);
/// count.write(5);
/// assert_eq!(count.read(), 5);
/// assert_eq!(count.version(), 1);
///
/// // Equal values still count as a write
/// count.write(5);
/// assert_eq!(count.version(), 2);
/// ```
pub struct CellHandle<T> {
    inner: Rc<CellInner<T>>,
}

impl<T> Clone for CellHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> CellHandle<T> {
    /// Read the value, subscribing the running computation.
    ///
    /// A cell whose owner was destroyed returns its last value without
    /// subscribing; see [`try_read`](Self::try_read).
    pub fn read(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Like [`read`](Self::read) but fails on a destroyed cell.
    pub fn try_read(&self) -> Result<T>
    where
        T: Clone,
    {
        if let Some(owner) = self.stale_owner() {
            return Err(ComposeError::StaleRead {
                cell: self.inner.id,
                owner,
            });
        }
        Ok(self.read())
    }

    /// Borrow the value, subscribing the running computation.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        match self.stale_owner() {
            Some(owner) => report_stale(self.inner.id, owner),
            None => track_read(self.inner.clone()),
        }
        f(&self.inner.value.borrow())
    }

    /// Read without subscribing.
    pub fn peek(&self) -> T
    where
        T: Clone,
    {
        self.inner.value.borrow().clone()
    }

    /// Store a value and notify every subscriber, even if it is equal to
    /// the current one.
    pub fn write(&self, value: T) {
        store(&self.inner, value);
    }

    /// Mutate in place. Counts as a write.
    ///
    /// ```
    /// use spark_compose::create_cell;
    ///
    /// let items = create_cell(vec![1, 2]);
    /// items.update(|v| v.push(3));
    /// assert_eq!(items.read(), vec![1, 2, 3]);
    /// ```
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.inner.value.borrow_mut());
        commit_write(&self.inner);
    }

    /// Write only if `value` differs from the current value.
    /// Returns whether a write happened.
    pub fn write_if_changed(&self, value: T) -> bool
    where
        T: PartialEq,
    {
        self.write_if_changed_by(value, default_equals)
    }

    /// Write only if `equals` says the values differ.
    pub fn write_if_changed_by(&self, value: T, equals: EqualsFn<T>) -> bool {
        if equals(&self.inner.value.borrow(), &value) {
            return false;
        }
        self.write(value);
        true
    }

    /// A `Send` writer that queues values for the next flush on this thread.
    pub fn remote(&self) -> RemoteWriter<T>
    where
        T: Send,
    {
        let erased: Rc<dyn AnyCell> = self.inner.clone();
        with_context(|ctx| {
            ctx.register_remote_cell(Rc::downgrade(&erased), self.inner.id);
            RemoteWriter::new(self.inner.id, ctx.inbox())
        })
    }

    pub fn id(&self) -> CellId {
        self.inner.id
    }

    pub fn version(&self) -> u64 {
        self.inner.version.get()
    }

    pub fn owner(&self) -> Option<NodeId> {
        self.inner.owner
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriber_count()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Rc<CellInner<T>> {
        &self.inner
    }

    /// The cell as a type-erased source.
    pub fn as_any_cell(&self) -> Rc<dyn AnyCell> {
        self.inner.clone()
    }

    fn stale_owner(&self) -> Option<NodeId> {
        if self.inner.is_destroyed() {
            self.inner.owner
        } else {
            None
        }
    }
}

impl<T: std::fmt::Debug + 'static> std::fmt::Debug for CellHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellHandle")
            .field("id", &self.inner.id)
            .field("version", &self.inner.version.get())
            .field("value", &*self.inner.value.borrow())
            .finish()
    }
}

/// Log a stale read and record it for the running flush.
fn report_stale(cell: CellId, owner: NodeId) {
    let (log, flushing) = with_context(|ctx| (ctx.config().log_stale_reads, ctx.is_flushing()));
    if log {
        warn!(%cell, %owner, "read of a cell whose owner was destroyed");
    }
    if flushing {
        with_context(|ctx| ctx.push_diagnostic(ComposeError::StaleRead { cell, owner }));
    }
}

// =============================================================================
// CREATION AND DESTRUCTION
// =============================================================================

/// Create an unowned cell. It lives as long as any handle to it.
pub fn create_cell<T: 'static>(initial: T) -> CellHandle<T> {
    CellHandle {
        inner: Rc::new(CellInner::new(initial, None)),
    }
}

/// Create a cell owned by `owner`; it is destroyed with that node.
pub(crate) fn create_owned_cell<T: 'static>(initial: T, owner: NodeId) -> CellHandle<T> {
    let handle = CellHandle {
        inner: Rc::new(CellInner::new(initial, Some(owner))),
    };
    if let Some(node) = with_context(|ctx| ctx.node(owner)) {
        node.adopt_cell(handle.as_any_cell());
    }
    handle
}

/// Destroy a cell: drop it from every reader's read-set and clear its
/// subscriber set.
pub(crate) fn destroy_cell(cell: &Rc<dyn AnyCell>) {
    if cell.is_destroyed() {
        return;
    }
    cell.set_flags(cell.flags() | DESTROYED);
    let id = cell.id();
    for subscriber in cell.take_subscribers() {
        match subscriber {
            Subscriber::Node(node) => {
                if let Some(node) = with_context(|ctx| ctx.node(node)) {
                    node.forget_read(id);
                }
            }
            Subscriber::Derived { inner, .. } => {
                if let Some(derived) = inner.upgrade() {
                    derived.drop_dependency(id);
                }
            }
        }
    }
    trace!(cell = %id, "cell destroyed");
}

// =============================================================================
// TESTS
// =============================================================================
