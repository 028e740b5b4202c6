// ============================================================================
// spark-compose - Remote Writes
// Writing cells from other threads
// ============================================================================
//
// The runtime is thread-local. Other threads never touch a cell directly:
// they push boxed values into the owning runtime's inbox, and the owner
// applies them in arrival order at the start of its next flush.
// ============================================================================

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::types::CellId;

/// A value waiting to be written on the owning thread.
pub struct PendingWrite {
    pub cell: CellId,
    pub value: Box<dyn Any + Send>,
}

/// Shared queue of remote writes for one runtime.
#[derive(Clone, Default)]
pub struct Inbox {
    queue: Arc<Mutex<VecDeque<PendingWrite>>>,
}

impl Inbox {
    pub fn push(&self, write: PendingWrite) {
        self.queue.lock().push_back(write);
    }

    /// Take everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<PendingWrite> {
        self.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// `Send + Sync` writer for one cell.
///
/// # Example
///
/// ```
/// use spark_compose::{create_cell, flush};
///
/// let progress = create_cell(0u32);
/// let writer = progress.remote();
///
/// std::thread::spawn(move || writer.write(100)).join().unwrap();
/// assert_eq!(progress.read(), 0);
///
/// flush().unwrap();
/// assert_eq!(progress.read(), 100);
/// ```
pub struct RemoteWriter<T> {
    cell: CellId,
    inbox: Inbox,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for RemoteWriter<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell,
            inbox: self.inbox.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for RemoteWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteWriter")
            .field("cell", &self.cell)
            .finish()
    }
}

impl<T: Send + 'static> RemoteWriter<T> {
    pub(crate) fn new(cell: CellId, inbox: Inbox) -> Self {
        Self {
            cell,
            inbox,
            _marker: PhantomData,
        }
    }

    /// Queue `value` for the owning thread's next flush.
    pub fn write(&self, value: T) {
        self.inbox.push(PendingWrite {
            cell: self.cell,
            value: Box::new(value),
        });
    }

    pub fn cell(&self) -> CellId {
        self.cell
    }

    /// Writes queued on this runtime and not yet applied.
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================
