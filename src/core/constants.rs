// ============================================================================
// spark-compose - Constants
// Flag constants for cells, derived stores and computation nodes
// ============================================================================

// =============================================================================
// TYPE FLAGS
// =============================================================================

/// Plain observable cell
pub const CELL: u32 = 1 << 0;

/// Derived store (lazily recomputed, both a reader and a source)
pub const DERIVED: u32 = 1 << 1;

/// Computation node producing an output fragment
pub const VIEW: u32 = 1 << 2;

/// Node created explicitly with `define_computation`.
/// Pinned nodes are never collected by their parent's recomposition.
pub const PINNED: u32 = 1 << 3;

/// Node declared by its parent through the composer
pub const COMPOSED: u32 = 1 << 4;

// =============================================================================
// STATE FLAGS
// =============================================================================

/// Up to date
pub const CLEAN: u32 = 1 << 10;

/// Definitely needs to recompose / recompute
pub const DIRTY: u32 = 1 << 11;

/// Only a derived store upstream changed; versions decide at flush time
pub const MAYBE_DIRTY: u32 = 1 << 12;

/// Node function is currently executing
pub const RECOMPOSING: u32 = 1 << 13;

/// Node or cell has been torn down
pub const DESTROYED: u32 = 1 << 14;

// =============================================================================
// STATUS MASK (for clearing status bits)
// =============================================================================

/// Mask to clear all status bits (CLEAN, DIRTY, MAYBE_DIRTY)
pub const STATUS_MASK: u32 = !(DIRTY | MAYBE_DIRTY | CLEAN);

/// Default cap on passes inside one flush before reporting a runaway update
pub const DEFAULT_MAX_FLUSH_PASSES: u32 = 1000;

/// Fragment kind used for the placeholder of a child computation
pub const SLOT_KIND: &str = "#slot";

/// Fragment kind produced by `Fragment::text`
pub const TEXT_KIND: &str = "#text";

/// Attribute on a slot fragment naming the child node
pub const SLOT_NODE_ATTR: &str = "node";

/// Attribute on a text fragment holding its content
pub const TEXT_VALUE_ATTR: &str = "value";

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_distinct() {
        let all_flags = [
            CELL,
            DERIVED,
            VIEW,
            PINNED,
            COMPOSED,
            CLEAN,
            DIRTY,
            MAYBE_DIRTY,
            RECOMPOSING,
            DESTROYED,
        ];

        for (i, &a) in all_flags.iter().enumerate() {
            for (j, &b) in all_flags.iter().enumerate() {
                if i != j {
                    assert_eq!(a & b, 0, "flags {i} and {j} overlap: {a:b} & {b:b}");
                }
            }
        }
    }

    #[test]
    fn status_mask_keeps_activity_bits() {
        let flags = VIEW | DIRTY | RECOMPOSING;
        let cleared = flags & STATUS_MASK;

        assert_eq!(cleared & DIRTY, 0);
        assert_ne!(cleared & VIEW, 0);
        assert_ne!(cleared & RECOMPOSING, 0);
    }

    #[test]
    fn status_transition_replaces_previous_status() {
        let mut flags = VIEW | CLEAN;
        flags = (flags & STATUS_MASK) | DIRTY;

        assert_ne!(flags & VIEW, 0);
        assert_eq!(flags & CLEAN, 0);
        assert_ne!(flags & DIRTY, 0);
    }
}
