// ============================================================================
// spark-compose - Tree Differ
// Minimal edit sequence between two fragments of the same node
// ============================================================================
//
// Children are reconciled in three steps against one parent:
//
//   1. Unmatched old children are removed, highest index first.
//   2. Matched children off the longest increasing subsequence are moved,
//      each right behind its predecessor in the new order. Indices come from
//      a Fenwick tree over precomputed slots, O(log n) per move.
//   3. New children are walked in order: unmatched ones are inserted,
//      matched ones are diffed recursively at their final index.
//
// After step 2 the surviving children already stand in new order, so every
// index emitted in step 3 is final.
// ============================================================================

use std::collections::{HashMap, HashSet};

use super::fragment::{AttrName, AttrValue, Fragment, Key};
use super::patch::{Edit, Path};
use crate::error::Result;

/// Edits plus the duplicate sibling keys found along the way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffOutcome {
    pub edits: Vec<Edit>,
    /// Keys declared more than once among siblings, once per sibling list
    pub collisions: Vec<Key>,
}

impl DiffOutcome {
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Apply the edits to `root` in order.
    pub fn apply_to(&self, root: &mut Option<Fragment>) -> Result<()> {
        self.edits.iter().try_for_each(|edit| edit.apply_to(root))
    }
}

/// Diff `previous` (absent on first render) against `next`.
pub fn diff(previous: Option<&Fragment>, next: &Fragment) -> DiffOutcome {
    let mut out = DiffOutcome::default();
    match previous {
        None => out.edits.push(Edit::Insert {
            at: Path::new(),
            fragment: next.clone(),
        }),
        Some(prev) => diff_node(prev, next, &mut Path::new(), &mut out),
    }
    out
}

fn diff_node(prev: &Fragment, next: &Fragment, path: &mut Path, out: &mut DiffOutcome) {
    if prev.kind() != next.kind() || prev.key() != next.key() {
        out.edits.push(Edit::Remove { at: path.clone() });
        out.edits.push(Edit::Insert {
            at: path.clone(),
            fragment: next.clone(),
        });
        return;
    }

    let (set, unset) = diff_attrs(prev, next);
    if !set.is_empty() || !unset.is_empty() {
        out.edits.push(Edit::Update {
            at: path.clone(),
            set,
            unset,
        });
    }

    diff_children(prev.children(), next.children(), path, out);
}

fn diff_attrs(prev: &Fragment, next: &Fragment) -> (Vec<(AttrName, AttrValue)>, Vec<AttrName>) {
    let set = next
        .attrs()
        .iter()
        .filter(|(name, value)| prev.attrs().get(*name) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let unset = prev
        .attrs()
        .keys()
        .filter(|name| !next.attrs().contains_key(*name))
        .cloned()
        .collect();
    (set, unset)
}

// =============================================================================
// CHILDREN
// =============================================================================

fn diff_children(old: &[Fragment], new: &[Fragment], path: &mut Path, out: &mut DiffOutcome) {
    if old.is_empty() && new.is_empty() {
        return;
    }

    let colliding = colliding_keys(old, new, out);
    let old_to_new = match_children(old, new, &colliding);

    let mut new_to_old = vec![None; new.len()];
    for (o, n) in old_to_new.iter().enumerate() {
        if let Some(n) = *n {
            new_to_old[n] = Some(o);
        }
    }

    // Step 1: removals
    for (o, matched) in old_to_new.iter().enumerate().rev() {
        if matched.is_none() {
            out.edits.push(Edit::Remove { at: child_path(path, o) });
        }
    }

    // Step 2: moves. `current` holds the new index of each surviving child.
    let current: Vec<usize> = old_to_new.iter().filter_map(|n| *n).collect();
    let stable = longest_increasing(&current);
    emit_moves(&current, &stable, path, out);

    // Step 3: inserts and recursion, in final order
    for (n, child) in new.iter().enumerate() {
        match new_to_old[n] {
            None => out.edits.push(Edit::Insert {
                at: child_path(path, n),
                fragment: child.clone(),
            }),
            Some(o) => {
                path.push(n);
                diff_node(&old[o], child, path, out);
                path.pop();
            }
        }
    }
}

fn child_path(parent: &Path, index: usize) -> Path {
    let mut path = parent.clone();
    path.push(index);
    path
}

/// Keys that appear more than once on either side. Duplicates on the new
/// side are reported.
fn colliding_keys(old: &[Fragment], new: &[Fragment], out: &mut DiffOutcome) -> HashSet<Key> {
    let reported = duplicate_keys(new);
    let mut colliding: HashSet<Key> = duplicate_keys(old).into_iter().collect();
    for key in reported {
        colliding.insert(key.clone());
        out.collisions.push(key);
    }
    colliding
}

/// Keys declared more than once, in order of their first repeat.
fn duplicate_keys(children: &[Fragment]) -> Vec<Key> {
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for key in children.iter().filter_map(Fragment::key) {
        if !seen.insert(key) && !duplicates.contains(key) {
            duplicates.push(key.clone());
        }
    }
    duplicates
}

/// For every old child, the index of the new child it corresponds to.
fn match_children(old: &[Fragment], new: &[Fragment], colliding: &HashSet<Key>) -> Vec<Option<usize>> {
    let mut old_by_key: HashMap<&Key, usize> = HashMap::new();
    let mut old_positional = Vec::new();
    for (o, child) in old.iter().enumerate() {
        match keyed(child, colliding) {
            Some(key) => {
                old_by_key.insert(key, o);
            }
            None => old_positional.push(o),
        }
    }

    let mut old_to_new = vec![None; old.len()];
    let mut positional = 0;
    for (n, child) in new.iter().enumerate() {
        match keyed(child, colliding) {
            Some(key) => {
                if let Some(&o) = old_by_key.get(key) {
                    old_to_new[o] = Some(n);
                }
            }
            None => {
                if let Some(&o) = old_positional.get(positional) {
                    if old[o].kind() == child.kind() && old[o].key() == child.key() {
                        old_to_new[o] = Some(n);
                    }
                }
                positional += 1;
            }
        }
    }
    old_to_new
}

/// The key a child is matched by, unless it collides with a sibling's.
fn keyed<'a>(child: &'a Fragment, colliding: &HashSet<Key>) -> Option<&'a Key> {
    child.key().filter(|k| !colliding.contains(*k))
}

// =============================================================================
// MOVES
// =============================================================================

/// Position of a child in the list while moves are applied.
///
/// Survivors start at `(position + 1, 0, 0)`. A moved child lands at
/// `(anchor, 1, n)`, where `anchor` is the start slot of the nearest stable
/// child before it in new order, or 0 at the front. Movers sharing an anchor
/// line up by new index, which puts each one right behind its predecessor.
type Slot = (usize, u8, usize);

/// Emit a move for every surviving child off the stable run.
///
/// Every slot a child can occupy is known up front, so current indices come
/// from counting occupied slots in a Fenwick tree instead of scanning.
fn emit_moves(current: &[usize], stable: &HashSet<usize>, path: &Path, out: &mut DiffOutcome) {
    let Some(width) = current.iter().max().map(|n| n + 1) else {
        return;
    };
    let mut position_of = vec![None; width];
    for (pos, n) in current.iter().enumerate() {
        position_of[*n] = Some(pos);
    }

    let mut moves: Vec<(Slot, Slot)> = Vec::new();
    let mut anchor = 0;
    for (n, pos) in position_of.iter().enumerate() {
        let Some(pos) = *pos else { continue };
        if stable.contains(&n) {
            anchor = pos + 1;
        } else {
            moves.push(((pos + 1, 0, 0), (anchor, 1, n)));
        }
    }
    if moves.is_empty() {
        return;
    }

    let mut slots: Vec<Slot> = (1..=current.len())
        .map(|start| (start, 0, 0))
        .chain(moves.iter().map(|(_, to)| *to))
        .collect();
    slots.sort_unstable();
    let index = |slot: Slot| slots.partition_point(|s| *s < slot);

    let mut occupied = Occupancy::new(slots.len());
    for start in 1..=current.len() {
        occupied.add(index((start, 0, 0)));
    }
    for (from_slot, to_slot) in moves {
        let from_slot = index(from_slot);
        let from = occupied.before(from_slot);
        occupied.remove(from_slot);
        let to_slot = index(to_slot);
        let to = occupied.before(to_slot);
        occupied.add(to_slot);
        if from != to {
            out.edits.push(Edit::Move {
                parent: path.clone(),
                from,
                to,
            });
        }
    }
}

/// Fenwick tree counting occupied slots.
struct Occupancy {
    tree: Vec<usize>,
}

impl Occupancy {
    fn new(len: usize) -> Self {
        Self { tree: vec![0; len + 1] }
    }

    fn add(&mut self, slot: usize) {
        let mut i = slot + 1;
        while i < self.tree.len() {
            self.tree[i] += 1;
            i += i & i.wrapping_neg();
        }
    }

    fn remove(&mut self, slot: usize) {
        let mut i = slot + 1;
        while i < self.tree.len() {
            self.tree[i] -= 1;
            i += i & i.wrapping_neg();
        }
    }

    /// Occupied slots strictly before `slot`.
    fn before(&self, slot: usize) -> usize {
        let mut i = slot;
        let mut total = 0;
        while i > 0 {
            total += self.tree[i];
            i -= i & i.wrapping_neg();
        }
        total
    }
}

// =============================================================================
// LONGEST INCREASING RUN
// =============================================================================

/// Values on one longest strictly increasing subsequence of `seq`.
fn longest_increasing(seq: &[usize]) -> HashSet<usize> {
    // tails[k]: index into seq of the smallest tail of an increasing run of length k + 1
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];

    for (i, value) in seq.iter().enumerate() {
        let k = tails.partition_point(|&t| seq[t] < *value);
        prev[i] = k.checked_sub(1).map(|k| tails[k]);
        if k == tails.len() {
            tails.push(i);
        } else {
            tails[k] = i;
        }
    }

    let mut stable = HashSet::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        stable.insert(seq[i]);
        cursor = prev[i];
    }
    stable
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn list(keys: &[&'static str]) -> Fragment {
        Fragment::new("list").children_from(keys.iter().map(|&k| Fragment::text(k).with_key(k)))
    }

    fn roundtrip(prev: &Fragment, next: &Fragment) -> DiffOutcome {
        let outcome = diff(Some(prev), next);
        let mut root = Some(prev.clone());
        outcome.apply_to(&mut root).unwrap();
        assert_eq!(root.as_ref(), Some(next));
        outcome
    }

    #[test]
    fn first_render_inserts_root() {
        let f = Fragment::text("hello");
        let outcome = diff(None, &f);
        assert_eq!(
            outcome.edits,
            vec![Edit::Insert {
                at: Path::new(),
                fragment: f.clone(),
            }]
        );
    }

    #[test]
    fn identical_trees_produce_nothing() {
        let f = Fragment::new("col")
            .attr("gap", 1)
            .child(list(&["a", "b"]))
            .child(Fragment::text("footer"));
        assert!(diff(Some(&f), &f).is_empty());
    }

    #[test]
    fn text_change_is_single_update() {
        let prev = Fragment::new("col").child(Fragment::text("Count: 0"));
        let next = Fragment::new("col").child(Fragment::text("Count: 1"));

        let outcome = roundtrip(&prev, &next);
        assert_eq!(
            outcome.edits,
            vec![Edit::Update {
                at: smallvec![0],
                set: vec![("value".into(), AttrValue::from("Count: 1"))],
                unset: vec![],
            }]
        );
    }

    #[test]
    fn kind_change_replaces_subtree() {
        let prev = Fragment::new("col").child(Fragment::text("a"));
        let next = Fragment::new("col").child(Fragment::new("button"));

        let outcome = roundtrip(&prev, &next);
        assert_eq!(outcome.edits.len(), 2);
        assert!(outcome.edits[0].is_remove());
        assert!(outcome.edits[1].is_insert());
    }

    #[test]
    fn removed_attribute_is_unset() {
        let prev = Fragment::new("box").attr("a", 1).attr("b", 2);
        let next = Fragment::new("box").attr("a", 1);

        let outcome = roundtrip(&prev, &next);
        assert_eq!(
            outcome.edits,
            vec![Edit::Update {
                at: Path::new(),
                set: vec![],
                unset: vec!["b".into()],
            }]
        );
    }

    #[test]
    fn rotation_is_one_move() {
        let outcome = roundtrip(&list(&["a", "b", "c", "d"]), &list(&["d", "a", "b", "c"]));
        assert_eq!(
            outcome.edits,
            vec![Edit::Move {
                parent: Path::new(),
                from: 3,
                to: 0,
            }]
        );
    }

    #[test]
    fn reversal_moves_all_but_one() {
        let outcome = roundtrip(&list(&["a", "b", "c", "d"]), &list(&["d", "c", "b", "a"]));
        let mv = |from, to| Edit::Move {
            parent: Path::new(),
            from,
            to,
        };
        assert_eq!(outcome.edits, vec![mv(2, 3), mv(1, 3), mv(0, 3)]);
    }

    #[test]
    fn long_reversal_stays_minimal() {
        let build = |keys: Vec<usize>| {
            Fragment::new("list").children_from(keys.into_iter().map(|k| Fragment::text(k.to_string()).with_key(k)))
        };
        let prev = build((0..500).collect());
        let next = build((0..500).rev().collect());

        let outcome = roundtrip(&prev, &next);
        assert_eq!(outcome.edits.len(), 499);
        assert!(outcome.edits.iter().all(Edit::is_move));
    }

    #[test]
    fn occupancy_counts_slots_before() {
        let mut occupied = Occupancy::new(6);
        for slot in [0, 2, 3, 5] {
            occupied.add(slot);
        }
        assert_eq!(occupied.before(0), 0);
        assert_eq!(occupied.before(3), 2);
        assert_eq!(occupied.before(6), 4);
        occupied.remove(2);
        assert_eq!(occupied.before(4), 2);
    }

    #[test]
    fn keyed_insert_and_remove() {
        let outcome = roundtrip(&list(&["a", "b", "c"]), &list(&["a", "x", "c"]));
        assert_eq!(
            outcome.edits,
            vec![
                Edit::Remove { at: smallvec![1] },
                Edit::Insert {
                    at: smallvec![1],
                    fragment: Fragment::text("x").with_key("x"),
                },
            ]
        );
    }

    #[test]
    fn mixed_reorder_insert_remove() {
        roundtrip(
            &list(&["a", "b", "c", "d", "e"]),
            &list(&["e", "x", "c", "a", "y"]),
        );
    }

    #[test]
    fn unkeyed_kind_mismatch_is_not_matched() {
        let prev = Fragment::new("row")
            .child(Fragment::text("a"))
            .child(Fragment::new("box"));
        let next = Fragment::new("row")
            .child(Fragment::new("box"))
            .child(Fragment::text("a"));

        let outcome = roundtrip(&prev, &next);
        assert!(!outcome.edits.iter().any(Edit::is_move));
        assert_eq!(outcome.edits.iter().filter(|e| e.is_remove()).count(), 2);
        assert_eq!(outcome.edits.iter().filter(|e| e.is_insert()).count(), 2);
    }

    #[test]
    fn duplicate_keys_fall_back_to_positions() {
        let dup = |label: &'static str| {
            Fragment::new("list")
                .child(Fragment::text(label).with_key("x"))
                .child(Fragment::text("second").with_key("x"))
        };

        let outcome = roundtrip(&dup("first"), &dup("changed"));
        assert_eq!(outcome.collisions, vec![Key::from("x")]);
        assert_eq!(outcome.edits.len(), 1);
        assert!(outcome.edits[0].is_update());
    }

    #[test]
    fn lis_picks_longest_run() {
        let stable = longest_increasing(&[1, 2, 3, 0]);
        assert_eq!(stable, HashSet::from([1, 2, 3]));
        assert_eq!(longest_increasing(&[]).len(), 0);
        assert_eq!(longest_increasing(&[3, 2, 1]).len(), 1);
    }
}
