// ============================================================================
// spark-compose - Capture Macros
// Shorthand for handing cell handles to node functions and derived stores
// ============================================================================

/// Shadow each listed handle with a clone, then evaluate the expression.
///
/// A node function is `'static`, so every handle it reads has to be owned by
/// the closure. Listing the handles keeps the originals usable afterwards.
///
/// ```rust
/// use spark_compose::{cloned, create_cell, derived};
///
/// let width = create_cell(4);
/// let height = create_cell(3);
///
/// let area = derived(cloned!(width, height => move || width.read() * height.read()));
/// width.write(5);
/// assert_eq!(area.read(), 15);
/// ```
#[macro_export]
macro_rules! cloned {
    ($($handle:ident),+ $(,)? => $body:expr) => {{
        $( let $handle = $handle.clone(); )+
        $body
    }};
}

/// A derived store over the listed handles.
///
/// `derived!(a, b => expr)` reads as the body of the derivation; the handles
/// are cloned in and the closure is built around `expr`. Without a list the
/// expression is moved in as is.
///
/// ```rust
/// use spark_compose::create_cell;
///
/// let first = create_cell("Ada");
/// let last = create_cell("Lovelace");
///
/// let full = spark_compose::derived!(first, last => format!("{} {}", first.read(), last.read()));
/// assert_eq!(full.read(), "Ada Lovelace");
/// ```
#[macro_export]
macro_rules! derived {
    ($($handle:ident),+ $(,)? => $body:expr) => {
        $crate::derived($crate::cloned!($($handle),+ => move || $body))
    };
    ($body:expr) => {
        $crate::derived(move || $body)
    };
}

/// Define a root node whose function captures the listed handles.
///
/// Expands to `define_computation(None, ..)` and so evaluates to a
/// `Result<NodeId>`. The composer is bound to the name given between the
/// bars.
///
/// ```rust
/// use spark_compose::{computation, create_cell, flush, node_fragment, Fragment};
///
/// let count = create_cell(0);
/// let node = computation!(count => |_c| Fragment::text(format!("{}", count.read()))).unwrap();
///
/// flush().unwrap();
/// assert_eq!(node_fragment(node).unwrap().text_value(), Some("0"));
/// ```
#[macro_export]
macro_rules! computation {
    ($($handle:ident),+ $(,)? => |$c:ident| $body:expr) => {
        $crate::define_computation(
            None,
            $crate::cloned!($($handle),+ => move |$c: &mut $crate::Composer| $body),
        )
    };
    (|$c:ident| $body:expr) => {
        $crate::define_computation(None, move |$c: &mut $crate::Composer| $body)
    };
}
