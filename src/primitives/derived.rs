// ============================================================================
// spark-compose - Derived Stores
// Lazy computed values that recompute when their inputs change
// ============================================================================
//
// A derived store is both a reader (it has a read-set) and a source (it has
// subscribers and a version). Writes upstream only mark it stale; it
// recomputes on the next read, and its version moves only when the new value
// differs from the cached one. Nodes reading it are therefore marked
// MAYBE_DIRTY and skipped at flush time when the value came out equal.
// ============================================================================

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::core::constants::*;
use crate::core::context::with_context;
use crate::core::types::{
    default_equals, AnyCell, AnyDerived, CellId, EqualsFn, ReadSet, Subscriber, SubscriberKey,
};
use crate::reactivity::tracking::{install_dependencies, reads_changed, track_read, Tracking};

// =============================================================================
// DERIVED INNER
// =============================================================================

pub struct DerivedInner<T> {
    id: CellId,

    /// DERIVED | status (CLEAN, MAYBE_DIRTY, or DIRTY before the first run)
    flags: Cell<u32>,

    compute: Box<dyn Fn() -> T>,

    /// Cached value (None until the first computation)
    value: RefCell<Option<T>>,

    equals: EqualsFn<T>,

    /// Bumped when a recomputation produces a different value
    version: Cell<u64>,

    /// Cells read by the last computation
    deps: RefCell<ReadSet>,

    subscribers: RefCell<IndexMap<SubscriberKey, Subscriber>>,

    self_ref: Weak<DerivedInner<T>>,
}

impl<T: 'static> DerivedInner<T> {
    fn new(compute: Box<dyn Fn() -> T>, equals: EqualsFn<T>) -> Rc<Self> {
        let id = with_context(|ctx| ctx.allocate_cell_id());
        Rc::new_cyclic(|self_ref| Self {
            id,
            flags: Cell::new(DERIVED | DIRTY),
            compute,
            value: RefCell::new(None),
            equals,
            version: Cell::new(0),
            deps: RefCell::new(ReadSet::new()),
            subscribers: RefCell::new(IndexMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    fn as_subscriber(&self) -> Subscriber {
        let inner: Weak<dyn AnyDerived> = self.self_ref.clone();
        Subscriber::Derived { id: self.id, inner }
    }

    fn set_status(&self, status: u32) {
        self.flags.set((self.flags.get() & STATUS_MASK) | status);
    }

    /// Recompute if stale.
    ///
    /// A MAYBE_DIRTY store first checks its inputs: if none moved (for
    /// example an upstream derived recomputed to the same value) the cached
    /// value stays and nothing runs.
    fn update(&self) {
        let flags = self.flags.get();
        if flags & CLEAN != 0 {
            return;
        }
        if flags & MAYBE_DIRTY != 0 {
            let deps = self.deps.borrow().clone();
            if !reads_changed(&deps) {
                self.set_status(CLEAN);
                return;
            }
        }
        self.recompute();
    }

    fn recompute(&self) {
        let subscriber = self.as_subscriber();
        let tracking = Tracking::begin(subscriber.clone());
        let value = (self.compute)();
        let reads = tracking.finish();

        let previous = self.deps.replace(reads);
        install_dependencies(&subscriber, &previous, &self.deps.borrow());

        let changed = match &*self.value.borrow() {
            Some(old) => !(self.equals)(old, &value),
            None => true,
        };
        if changed {
            *self.value.borrow_mut() = Some(value);
            self.version.set(self.version.get() + 1);
        }
        self.set_status(CLEAN);
    }

    fn with_value<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.update();
        let value = self.value.borrow();
        match value.as_ref() {
            Some(value) => f(value),
            // update() always leaves a value behind
            None => unreachable!("derived store has no value after update"),
        }
    }
}

impl<T: 'static> AnyCell for DerivedInner<T> {
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

    fn refresh(&self) {
        self.update();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<T: 'static> AnyDerived for DerivedInner<T> {
    fn id(&self) -> CellId {
        self.id
    }

    fn mark_stale(&self) -> bool {
        if self.flags.get() & CLEAN == 0 {
            return false;
        }
        self.set_status(MAYBE_DIRTY);
        true
    }

    fn drop_dependency(&self, cell: CellId) {
        self.deps.borrow_mut().shift_remove(&cell);
    }

    fn as_cell(&self) -> Option<Rc<dyn AnyCell>> {
        self.self_ref.upgrade().map(|rc| rc as Rc<dyn AnyCell>)
    }
}

impl<T> Drop for DerivedInner<T> {
    fn drop(&mut self) {
        let key = SubscriberKey::Derived(self.id);
        for dep in self.deps.get_mut().values() {
            dep.cell.remove_subscriber(&key);
        }
    }
}

// =============================================================================
// DERIVED HANDLE
// =============================================================================

/// Cloneable handle to a derived store.
///
/// # Example
///
/// ```
/// use spark_compose::{create_cell, derived};
///
/// let width = create_cell(3);
/// let height = create_cell(4);
/// let area = derived({
///     let (w, h) = (width.clone(), height.clone());
///     move || w.read() * h.read()
/// });
///
/// assert_eq!(area.read(), 12);
/// width.write(5);
/// assert_eq!(area.read(), 20);
/// ```
pub struct Derived<T> {
    inner: Rc<DerivedInner<T>>,
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Derived<T> {
    /// Read the value, recomputing if stale, and subscribe the running
    /// computation.
    pub fn read(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Borrow the value, recomputing if stale, and subscribe the running
    /// computation.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.inner.update();
        track_read(self.inner.clone());
        self.inner.with_value(f)
    }

    /// Read without subscribing. Still recomputes if stale.
    pub fn peek(&self) -> T
    where
        T: Clone,
    {
        self.inner.with_value(T::clone)
    }

    pub fn id(&self) -> CellId {
        self.inner.id
    }

    /// Number of distinct values produced so far.
    pub fn version(&self) -> u64 {
        self.inner.version.get()
    }

    pub fn is_stale(&self) -> bool {
        self.inner.flags.get() & CLEAN == 0
    }

    /// Cells and stores read by the last computation.
    pub fn dependencies(&self) -> Vec<CellId> {
        self.inner.deps.borrow().keys().copied().collect()
    }

    pub fn as_any_cell(&self) -> Rc<dyn AnyCell> {
        self.inner.clone()
    }
}

impl<T: std::fmt::Debug + 'static> std::fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Derived")
            .field("id", &self.inner.id)
            .field("version", &self.inner.version.get())
            .field("value", &*self.inner.value.borrow())
            .finish()
    }
}

/// Create a derived store compared with `PartialEq`.
pub fn derived<T, F>(compute: F) -> Derived<T>
where
    T: PartialEq + 'static,
    F: Fn() -> T + 'static,
{
    derived_with_equals(compute, default_equals)
}

/// Create a derived store with a custom equality.
pub fn derived_with_equals<T, F>(compute: F, equals: EqualsFn<T>) -> Derived<T>
where
    T: 'static,
    F: Fn() -> T + 'static,
{
    Derived {
        inner: DerivedInner::new(Box::new(compute), equals),
    }
}

// =============================================================================
// TESTS
// =============================================================================
