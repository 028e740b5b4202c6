// ============================================================================
// spark-compose - Batching
// Coalescing writes into one flush, and suspending tracking
// ============================================================================

use tracing::debug;

use crate::core::context::with_context;
use crate::error::Result;
use crate::reactivity::scheduling::flush;

// =============================================================================
// BATCH
// =============================================================================

/// Run `f` and flush once when the outermost batch exits.
///
/// Nested batches only flush at the outer boundary. Inside a flush (for
/// example from a node function) no flush is started; the writes land in
/// the running flush's next pass instead.
///
/// # Example
///
/// ```
/// use spark_compose::{batch, create_cell, define_computation, flush, Fragment};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let a = create_cell(1);
/// let b = create_cell(2);
/// let runs = Rc::new(Cell::new(0));
///
/// let (a2, b2, r) = (a.clone(), b.clone(), runs.clone());
/// define_computation(None, move |_| {
///     r.set(r.get() + 1);
///     Fragment::text(format!("{}", a2.read() + b2.read()))
/// })
/// .unwrap();
/// flush().unwrap();
/// assert_eq!(runs.get(), 1);
///
/// batch(|| {
///     a.write(10);
///     b.write(20);
/// })
/// .unwrap();
///
/// // One recomposition for both writes
/// assert_eq!(runs.get(), 2);
/// ```
pub fn batch<T>(f: impl FnOnce() -> T) -> Result<T> {
    with_context(|ctx| ctx.enter_batch());

    // Exit the batch even if `f` unwinds
    struct BatchGuard;

    impl Drop for BatchGuard {
        fn drop(&mut self) {
            with_context(|ctx| ctx.exit_batch());
        }
    }

    let value = {
        let _guard = BatchGuard;
        f()
    };

    let should_flush = with_context(|ctx| !ctx.is_batching() && !ctx.is_flushing());
    if should_flush {
        flush()?;
    }
    Ok(value)
}

// =============================================================================
// UNTRACK / PEEK
// =============================================================================

/// Run `f` without recording any reads.
///
/// # Example
///
/// ```
/// use spark_compose::{create_cell, define_computation, flush, node_read_set, untrack, Fragment};
///
/// let tracked = create_cell(1);
/// let ignored = create_cell(2);
///
/// let (t, i) = (tracked.clone(), ignored.clone());
/// let node = define_computation(None, move |_| {
///     let sum = t.read() + untrack(|| i.read());
///     Fragment::text(sum.to_string())
/// })
/// .unwrap();
/// flush().unwrap();
///
/// assert_eq!(node_read_set(node), vec![tracked.id()]);
/// ```
pub fn untrack<T>(f: impl FnOnce() -> T) -> T {
    let previous = with_context(|ctx| ctx.set_untracking(true));

    struct UntrackGuard(bool);

    impl Drop for UntrackGuard {
        fn drop(&mut self) {
            with_context(|ctx| ctx.set_untracking(self.0));
        }
    }

    let _guard = UntrackGuard(previous);
    f()
}

/// Alias for [`untrack`].
pub fn peek<T>(f: impl FnOnce() -> T) -> T {
    untrack(f)
}

// =============================================================================
// TICK
// =============================================================================

/// Flush and log the report instead of returning it.
pub fn tick() -> Result<()> {
    let report = flush()?;
    if !report.is_idle() {
        debug!(
            passes = report.passes,
            recomposed = ?report.recomposed,
            diagnostics = report.diagnostics.len(),
            "tick"
        );
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
