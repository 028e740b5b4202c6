// ============================================================================
// spark-compose - Render Module
// Fragments, patches, the tree differ and the host bridge
// ============================================================================

pub mod diff;
pub mod fragment;
pub mod host;
pub mod patch;

pub use diff::{diff, DiffOutcome};
pub use fragment::{AttrName, AttrValue, Attributes, Fragment, Key};
pub use host::{set_host, take_host, HostBridge, HostTree};
pub use patch::{Edit, EditCounts, Patch, PatchSequence, Path};
