//! # Sequence Diff
//!
//! Compares an old and a new sequence of keyed items.
//!
//! Two views are offered:
//!
//! - [`diff_by`] classifies every old index as same, moved, updated or
//!   deleted and every unmatched new index as added. Items are matched by
//!   key, so it is suited to reconciling collections with stable ids.
//! - [`edit_script`] produces a literal Insert/Remove/Change script that
//!   turns `old` into `new` when replayed in order.
//!
//! ## Invariants
//!
//! - `same + moved + updated + deleted == old.len()`
//! - `added - deleted == new.len() - old.len()`
//! - `diff(x, x)` reports no change

use similar::{capture_diff_slices, Algorithm, DiffOp};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Classification of old and new indices. All vectors are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    /// Old indices kept at the same position with equal content
    pub same: Vec<usize>,
    /// Old indices with no counterpart in `new`
    pub deleted: Vec<usize>,
    /// New indices with no counterpart in `old`
    pub added: Vec<usize>,
    /// `(old, new)` pairs whose position changed, content equal
    pub moved: Vec<(usize, usize)>,
    /// `(old, new)` pairs whose content changed, position may differ
    pub updated: Vec<(usize, usize)>,
}

impl DiffResult {
    /// No change at all, `same` aside.
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty()
            && self.added.is_empty()
            && self.moved.is_empty()
            && self.updated.is_empty()
    }

    /// Old indices that survive in `new`.
    pub fn kept(&self) -> usize {
        self.same.len() + self.moved.len() + self.updated.len()
    }
}

/// Diff of plain values where the value is both key and content.
pub fn diff<T: Eq + Hash>(old: &[T], new: &[T]) -> DiffResult {
    diff_by(old, new, |item| item, |a, b| a == b)
}

/// Diff with an explicit key and content comparison.
pub fn diff_by<'a, T, K, F, E>(old: &'a [T], new: &'a [T], key: F, content_eq: E) -> DiffResult
where
    K: Eq + Hash,
    F: Fn(&'a T) -> K,
    E: Fn(&'a T, &'a T) -> bool,
{
    let mut old_positions: HashMap<K, Vec<usize>> = HashMap::new();
    for (index, item) in old.iter().enumerate() {
        old_positions.entry(key(item)).or_default().push(index);
    }
    let mut new_positions: HashMap<K, Vec<usize>> = HashMap::new();
    for (index, item) in new.iter().enumerate() {
        new_positions.entry(key(item)).or_default().push(index);
    }

    let mut result = DiffResult::default();
    let mut pairs: Vec<(usize, usize)> = Vec::new();

    for (k, olds) in old_positions {
        let mut news = new_positions.remove(&k).unwrap_or_default();

        let new_set: HashSet<usize> = news.iter().copied().collect();
        let (unmoved, mut olds): (Vec<usize>, Vec<usize>) =
            olds.into_iter().partition(|index| new_set.contains(index));
        let unmoved_set: HashSet<usize> = unmoved.iter().copied().collect();
        news.retain(|index| !unmoved_set.contains(index));
        pairs.extend(unmoved.into_iter().map(|index| (index, index)));

        // Excess occurrences go away, highest index first
        let excess = olds.len().saturating_sub(news.len());
        result.deleted.extend(olds.drain(olds.len() - excess..));

        // Pair from the end: highest old with highest new
        let offset = news.len() - olds.len();
        pairs.extend(olds.iter().copied().zip(news[offset..].iter().copied()));
        result.added.extend_from_slice(&news[..offset]);
    }

    for news in new_positions.into_values() {
        result.added.extend(news);
    }

    for (old_index, new_index) in pairs {
        if !content_eq(&old[old_index], &new[new_index]) {
            result.updated.push((old_index, new_index));
        } else if old_index == new_index {
            result.same.push(old_index);
        } else {
            result.moved.push((old_index, new_index));
        }
    }

    result.same.sort_unstable();
    result.deleted.sort_unstable();
    result.added.sort_unstable();
    result.moved.sort_unstable();
    result.updated.sort_unstable();
    result
}

// ============================================================================
// Edit script
// ============================================================================

/// One step of an [`EditScript`]. Indices are positions in the sequence as
/// it stands when the step is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOp {
    /// Insert `new[new_index]` at `index`
    Insert { index: usize, new_index: usize },
    /// Remove the item at `index`
    Remove { index: usize },
    /// Overwrite the item at `index` with `new[new_index]`
    Change { index: usize, new_index: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditScript {
    pub ops: Vec<EditOp>,
    /// Kept items whose content did not change
    pub unchanged: usize,
}

impl EditScript {
    pub fn inserted(&self) -> usize {
        self.count(|op| matches!(op, EditOp::Insert { .. }))
    }

    pub fn removed(&self) -> usize {
        self.count(|op| matches!(op, EditOp::Remove { .. }))
    }

    pub fn changed(&self) -> usize {
        self.count(|op| matches!(op, EditOp::Change { .. }))
    }

    fn count(&self, pred: impl Fn(&EditOp) -> bool) -> usize {
        self.ops.iter().filter(|op| pred(op)).count()
    }

    /// Apply the script to `old`. `None` if the script does not fit.
    pub fn replay<T: Clone>(&self, old: &[T], new: &[T]) -> Option<Vec<T>> {
        let mut items = old.to_vec();
        for op in &self.ops {
            match *op {
                EditOp::Insert { index, new_index } => {
                    if index > items.len() {
                        return None;
                    }
                    items.insert(index, new.get(new_index)?.clone());
                }
                EditOp::Remove { index } => {
                    if index >= items.len() {
                        return None;
                    }
                    items.remove(index);
                }
                EditOp::Change { index, new_index } => {
                    *items.get_mut(index)? = new.get(new_index)?.clone();
                }
            }
        }
        Some(items)
    }
}

/// Minimal Insert/Remove/Change script from a Myers diff over the keys.
///
/// Positions come from a cursor over the sequence being rewritten: it
/// always equals the number of leading items that already match `new`.
pub fn edit_script<'a, T, K, F, E>(
    old: &'a [T],
    new: &'a [T],
    key: F,
    content_eq: E,
) -> EditScript
where
    K: Eq + Hash + Ord,
    F: Fn(&'a T) -> K,
    E: Fn(&'a T, &'a T) -> bool,
{
    let old_keys: Vec<K> = old.iter().map(&key).collect();
    let new_keys: Vec<K> = new.iter().map(&key).collect();

    let mut script = EditScript::default();
    let mut cursor = 0usize;
    for op in capture_diff_slices(Algorithm::Myers, &old_keys, &new_keys) {
        match op {
            DiffOp::Equal {
                old_index,
                new_index,
                len,
            } => {
                for offset in 0..len {
                    if content_eq(&old[old_index + offset], &new[new_index + offset]) {
                        script.unchanged += 1;
                    } else {
                        script.ops.push(EditOp::Change {
                            index: cursor,
                            new_index: new_index + offset,
                        });
                    }
                    cursor += 1;
                }
            }
            DiffOp::Delete { old_len, .. } => {
                push_removes(&mut script, cursor, old_len);
            }
            DiffOp::Insert {
                new_index, new_len, ..
            } => {
                push_inserts(&mut script, &mut cursor, new_index, new_len);
            }
            DiffOp::Replace {
                old_len,
                new_index,
                new_len,
                ..
            } => {
                push_removes(&mut script, cursor, old_len);
                push_inserts(&mut script, &mut cursor, new_index, new_len);
            }
        }
    }
    script
}

fn push_removes(script: &mut EditScript, cursor: usize, old_len: usize) {
    for _ in 0..old_len {
        script.ops.push(EditOp::Remove { index: cursor });
    }
}

fn push_inserts(script: &mut EditScript, cursor: &mut usize, new_index: usize, new_len: usize) {
    for offset in 0..new_len {
        script.ops.push(EditOp::Insert {
            index: *cursor,
            new_index: new_index + offset,
        });
        *cursor += 1;
    }
}
