// ============================================================================
// spark-compose - Context Values
// Values provided by an ancestor and looked up by type
// ============================================================================
//
// A provided value is a cell owned by the providing node, so consumers
// subscribe to it like any other cell and rerun when it is written.
// ============================================================================

use crate::core::context::with_context;
use crate::core::types::NodeId;
use crate::error::{ComposeError, Result};
use crate::primitives::cell::{create_owned_cell, CellHandle};

/// Provide `value` as the `T` seen by `node` and its descendants.
///
/// If `node` already provides a `T`, its cell is written instead.
///
/// # Example
///
/// ```
/// use spark_compose::{define_computation, flush, lookup_context, provide_context, Fragment};
///
/// #[derive(Clone, PartialEq, Debug)]
/// struct Theme(&'static str);
///
/// let root = define_computation(None, |_| Fragment::new("app")).unwrap();
/// let leaf = define_computation(Some(root), |_| Fragment::new("leaf")).unwrap();
/// provide_context(root, Theme("dark")).unwrap();
///
/// let theme = lookup_context::<Theme>(leaf).unwrap();
/// assert_eq!(theme.read(), Theme("dark"));
/// # flush().unwrap();
/// ```
pub fn provide_context<T: 'static>(node: NodeId, value: T) -> Result<CellHandle<T>> {
    let target = with_context(|ctx| ctx.node(node))
        .filter(|n| !n.is_destroyed())
        .ok_or(ComposeError::NodeNotFound(node))?;

    if let Some(cell) = target.context::<T>() {
        cell.write(value);
        return Ok(cell);
    }
    let cell = create_owned_cell(value, node);
    target.set_context(cell.clone());
    Ok(cell)
}

/// The nearest `T` provided by `node` or one of its ancestors.
pub fn lookup_context<T: 'static>(node: NodeId) -> Option<CellHandle<T>> {
    let mut current = Some(node);
    while let Some(id) = current {
        let found = with_context(|ctx| ctx.node(id))?;
        if let Some(cell) = found.context::<T>() {
            return Some(cell);
        }
        current = found.parent();
    }
    None
}

// =============================================================================
// TESTS
// =============================================================================
