// ============================================================================
// spark-compose - Patches
// Structural edits handed to the host
// ============================================================================
//
// Paths are child-index paths starting at a node's root fragment; the empty
// path is the root itself. Edits of one patch are applied in order, each
// against the tree left by the previous one.
// ============================================================================

use smallvec::SmallVec;

use super::fragment::{AttrName, AttrValue, Fragment};
use crate::core::types::NodeId;
use crate::error::{ComposeError, Result};

/// Child-index path from a node's root fragment.
pub type Path = SmallVec<[usize; 8]>;

// =============================================================================
// EDIT
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    /// Insert `fragment` so that it ends up at `at`. An empty path mounts
    /// the node's root.
    Insert { at: Path, fragment: Fragment },

    /// Set and remove attributes of the fragment at `at`.
    Update {
        at: Path,
        set: Vec<(AttrName, AttrValue)>,
        unset: Vec<AttrName>,
    },

    /// Remove the subtree at `at`. An empty path unmounts the node.
    Remove { at: Path },

    /// Take the child at `from` out of `parent`'s children, then insert it
    /// at `to` in the shortened list.
    Move { parent: Path, from: usize, to: usize },
}

impl Edit {
    pub fn is_insert(&self) -> bool {
        matches!(self, Edit::Insert { .. })
    }

    pub fn is_update(&self) -> bool {
        matches!(self, Edit::Update { .. })
    }

    pub fn is_remove(&self) -> bool {
        matches!(self, Edit::Remove { .. })
    }

    pub fn is_move(&self) -> bool {
        matches!(self, Edit::Move { .. })
    }

    /// Apply this edit to a mounted root (`None` when nothing is mounted).
    ///
    /// This is the reference semantics every host must follow.
    pub fn apply_to(&self, root: &mut Option<Fragment>) -> Result<()> {
        match self {
            Edit::Insert { at, fragment } => match at.split_last() {
                None => {
                    *root = Some(fragment.clone());
                    Ok(())
                }
                Some((&index, parent)) => {
                    let children = children_at(root, parent, at)?;
                    if index > children.len() {
                        return Err(invalid(at));
                    }
                    children.insert(index, fragment.clone());
                    Ok(())
                }
            },
            Edit::Update { at, set, unset } => {
                let target = root
                    .as_mut()
                    .and_then(|r| r.at_mut(at))
                    .ok_or_else(|| invalid(at))?;
                for name in unset {
                    target.remove_attr(name);
                }
                for (name, value) in set {
                    target.set_attr(name.clone(), value.clone());
                }
                Ok(())
            }
            Edit::Remove { at } => match at.split_last() {
                None => {
                    root.take().map(|_| ()).ok_or_else(|| invalid(at))
                }
                Some((&index, parent)) => {
                    let children = children_at(root, parent, at)?;
                    if index >= children.len() {
                        return Err(invalid(at));
                    }
                    children.remove(index);
                    Ok(())
                }
            },
            Edit::Move { parent, from, to } => {
                let children = children_at(root, parent, parent)?;
                if *from >= children.len() || *to >= children.len() {
                    return Err(invalid(parent));
                }
                let moved = children.remove(*from);
                children.insert(*to, moved);
                Ok(())
            }
        }
    }
}

fn children_at<'a>(
    root: &'a mut Option<Fragment>,
    parent: &[usize],
    reported: &[usize],
) -> Result<&'a mut Vec<Fragment>> {
    root.as_mut()
        .and_then(|r| r.at_mut(parent))
        .map(Fragment::children_mut)
        .ok_or_else(|| invalid(reported))
}

fn invalid(path: &[usize]) -> ComposeError {
    ComposeError::InvalidEdit {
        path: path.to_vec(),
    }
}

// =============================================================================
// PATCH
// =============================================================================

/// The edits produced for one node by one recomposition.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub node: NodeId,
    pub edits: Vec<Edit>,
}

impl Patch {
    pub fn new(node: NodeId, edits: Vec<Edit>) -> Self {
        Self { node, edits }
    }

    /// A patch that unmounts `node` from the host.
    pub fn unmount(node: NodeId) -> Self {
        Self::new(node, vec![Edit::Remove { at: Path::new() }])
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn is_unmount(&self) -> bool {
        matches!(self.edits.as_slice(), [Edit::Remove { at }] if at.is_empty())
    }

    /// Apply every edit in order.
    pub fn apply_to(&self, root: &mut Option<Fragment>) -> Result<()> {
        self.edits.iter().try_for_each(|edit| edit.apply_to(root))
    }
}

// =============================================================================
// PATCH SEQUENCE
// =============================================================================

/// Per-kind edit counts, handy for assertions and logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EditCounts {
    pub inserts: usize,
    pub updates: usize,
    pub removes: usize,
    pub moves: usize,
}

impl EditCounts {
    pub fn total(&self) -> usize {
        self.inserts + self.updates + self.removes + self.moves
    }
}

/// Every patch produced by one flush, in application order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchSequence {
    patches: Vec<Patch>,
}

impl PatchSequence {
    pub fn new(patches: Vec<Patch>) -> Self {
        Self { patches }
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Patch> {
        self.patches.iter()
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Patches addressed to `node`, in order.
    pub fn for_node(&self, node: NodeId) -> impl Iterator<Item = &Patch> {
        self.patches.iter().filter(move |p| p.node == node)
    }

    pub fn counts(&self) -> EditCounts {
        let mut counts = EditCounts::default();
        for edit in self.patches.iter().flat_map(|p| p.edits.iter()) {
            match edit {
                Edit::Insert { .. } => counts.inserts += 1,
                Edit::Update { .. } => counts.updates += 1,
                Edit::Remove { .. } => counts.removes += 1,
                Edit::Move { .. } => counts.moves += 1,
            }
        }
        counts
    }

    pub fn edit_count(&self) -> usize {
        self.patches.iter().map(|p| p.edits.len()).sum()
    }
}

impl<'a> IntoIterator for &'a PatchSequence {
    type Item = &'a Patch;
    type IntoIter = std::slice::Iter<'a, Patch>;

    fn into_iter(self) -> Self::IntoIter {
        self.patches.iter()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn list(items: &[&'static str]) -> Fragment {
        Fragment::new("list").children_from(items.iter().map(|&k| Fragment::text(k).with_key(k)))
    }

    fn texts(f: &Fragment) -> Vec<&str> {
        f.children().iter().filter_map(Fragment::text_value).collect()
    }

    #[test]
    fn mount_and_unmount() {
        let mut root = None;
        Patch::new(
            NodeId(1),
            vec![Edit::Insert {
                at: Path::new(),
                fragment: Fragment::text("hi"),
            }],
        )
        .apply_to(&mut root)
        .unwrap();
        assert_eq!(root.as_ref().and_then(Fragment::text_value), Some("hi"));

        Patch::unmount(NodeId(1)).apply_to(&mut root).unwrap();
        assert!(root.is_none());
    }

    #[test]
    fn move_removes_then_inserts() {
        let mut root = Some(list(&["a", "b", "c", "d"]));
        Edit::Move {
            parent: Path::new(),
            from: 0,
            to: 3,
        }
        .apply_to(&mut root)
        .unwrap();
        assert_eq!(texts(root.as_ref().unwrap()), ["b", "c", "d", "a"]);

        Edit::Move {
            parent: Path::new(),
            from: 3,
            to: 0,
        }
        .apply_to(&mut root)
        .unwrap();
        assert_eq!(texts(root.as_ref().unwrap()), ["a", "b", "c", "d"]);
    }

    #[test]
    fn update_sets_and_unsets() {
        let mut root = Some(Fragment::new("box").attr("a", 1).attr("b", 2));
        Edit::Update {
            at: Path::new(),
            set: vec![("a".into(), AttrValue::Int(10))],
            unset: vec!["b".into()],
        }
        .apply_to(&mut root)
        .unwrap();

        let f = root.unwrap();
        assert_eq!(f.get_attr("a"), Some(&AttrValue::Int(10)));
        assert_eq!(f.get_attr("b"), None);
    }

    #[test]
    fn out_of_range_edits_are_rejected() {
        let mut root = Some(list(&["a"]));
        let err = Edit::Remove { at: smallvec![3] }.apply_to(&mut root).unwrap_err();
        assert_eq!(err, ComposeError::InvalidEdit { path: vec![3] });

        let err = Edit::Insert {
            at: smallvec![0, 5],
            fragment: Fragment::text("x"),
        }
        .apply_to(&mut root)
        .unwrap_err();
        assert!(matches!(err, ComposeError::InvalidEdit { .. }));

        let mut empty = None;
        assert!(Patch::unmount(NodeId(1)).apply_to(&mut empty).is_err());
    }

    #[test]
    fn counts_by_kind() {
        let seq = PatchSequence::new(vec![
            Patch::unmount(NodeId(2)),
            Patch::new(
                NodeId(1),
                vec![
                    Edit::Move {
                        parent: Path::new(),
                        from: 0,
                        to: 1,
                    },
                    Edit::Insert {
                        at: smallvec![2],
                        fragment: Fragment::text("x"),
                    },
                ],
            ),
        ]);
        let counts = seq.counts();
        assert_eq!(counts.removes, 1);
        assert_eq!(counts.moves, 1);
        assert_eq!(counts.inserts, 1);
        assert_eq!(counts.total(), 3);
        assert_eq!(seq.edit_count(), 3);
        assert_eq!(seq.for_node(NodeId(1)).count(), 1);
        assert!(seq.patches()[0].is_unmount());
    }
}
