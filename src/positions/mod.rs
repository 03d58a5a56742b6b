//! Manual ordering for note lists.
//!
//! A list is ordered purely by `position` (descending), pinned notes first. Reorders
//! rank every note off a base timestamp, so repeated reorders stay monotonic without
//! a global counter and never produce ties.

use crate::models::Note;
use std::collections::HashSet;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    pub id: String,
    pub pinned: bool,
    pub position: i64,
}

/// Assign positions for a reorder.
///
/// `pinned_ids` / `other_ids` are the user's desired order. Notes in `current` that
/// appear in neither sequence (added concurrently elsewhere) are appended after the
/// explicit ones of their partition, keeping their existing relative order.
pub fn allocate_positions(
    base_ms: i64,
    pinned_ids: &[String],
    other_ids: &[String],
    current: &[Note],
) -> Vec<Placement> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut ordered: Vec<(&str, bool)> = Vec::new();

    let pinned_explicit = take_unseen(pinned_ids, true, &mut seen);
    let other_explicit = take_unseen(other_ids, false, &mut seen);

    let mut stragglers: Vec<&Note> = current
        .iter()
        .filter(|n| !seen.contains(n.id.as_str()))
        .collect();
    sort_notes(stragglers.as_mut_slice());

    ordered.extend(pinned_explicit);
    ordered.extend(stragglers.iter().filter(|n| n.pinned).map(|n| (n.id.as_str(), true)));
    ordered.extend(other_explicit);
    ordered.extend(stragglers.iter().filter(|n| !n.pinned).map(|n| (n.id.as_str(), false)));

    let n = ordered.len() as i64;
    ordered
        .into_iter()
        .enumerate()
        .map(|(rank, (id, pinned))| Placement {
            id: id.to_string(),
            pinned,
            position: base_ms + (n - rank as i64),
        })
        .collect()
}

fn take_unseen<'a>(
    ids: &'a [String],
    pinned: bool,
    seen: &mut HashSet<&'a str>,
) -> Vec<(&'a str, bool)> {
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .map(|id| (id.as_str(), pinned))
        .collect()
}

/// Apply placements to a list in place and re-sort it.
pub fn apply_placements(notes: &mut [Note], placements: &[Placement]) {
    for note in notes.iter_mut() {
        if let Some(p) = placements.iter().find(|p| p.id == note.id) {
            note.pinned = p.pinned;
            note.position = p.position;
        }
    }
    sort_notes(notes);
}

/// Pinned first, then position descending. Stable, so equal keys keep list order.
pub fn sort_notes<N: std::borrow::Borrow<Note>>(notes: &mut [N]) {
    notes.sort_by(|a, b| {
        let (a, b) = (a.borrow(), b.borrow());
        b.pinned
            .cmp(&a.pinned)
            .then_with(|| b.position.cmp(&a.position))
    });
}

/// Position that puts a new (or newly pinned/unpinned) note at the top of its partition.
pub fn position_for_new_note(now_ms: i64, notes: &[Note]) -> i64 {
    let top = notes.iter().map(|n| n.position).max().unwrap_or(i64::MIN);
    now_ms.max(top.saturating_add(1))
}

/// Id order after dragging `dragged_id` before/after `target_id`.
///
/// Returns `None` for a no-op move or unknown ids.
pub fn compute_drag_order(
    ids: &[String],
    dragged_id: &str,
    target_id: &str,
    insert_after: bool,
) -> Option<Vec<String>> {
    if dragged_id == target_id {
        return None;
    }
    let from = ids.iter().position(|id| id == dragged_id)?;
    ids.iter().position(|id| id == target_id)?;

    let mut out: Vec<String> = ids.iter().filter(|id| *id != dragged_id).cloned().collect();
    let tidx = out.iter().position(|id| id == target_id)?;
    let insert_idx = if insert_after { tidx + 1 } else { tidx };
    out.insert(insert_idx, dragged_id.to_string());

    if out.iter().position(|id| id == dragged_id) == Some(from) {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_note;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn pos(placements: &[Placement], id: &str) -> i64 {
        placements
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.position)
            .unwrap_or_else(|| panic!("missing {id}"))
    }

    #[test]
    fn test_reorder_pinned_ahead_of_others() {
        let mut p1 = test_note("p1", 100);
        p1.pinned = true;
        let mut p2 = test_note("p2", 90);
        p2.pinned = true;
        let o1 = test_note("o1", 50);

        let placements = allocate_positions(
            1_000,
            &ids(&["p2", "p1"]),
            &ids(&["o1"]),
            &[p1, p2, o1],
        );

        assert!(pos(&placements, "p2") > pos(&placements, "p1"));
        assert!(pos(&placements, "p1") > pos(&placements, "o1"));
    }

    #[test]
    fn test_sorting_by_position_yields_submitted_order() {
        let current: Vec<Note> = ["a", "b", "c", "d"]
            .iter()
            .enumerate()
            .map(|(i, id)| test_note(id, i as i64))
            .collect();
        let placements = allocate_positions(5, &ids(&["c"]), &ids(&["d", "a", "b"]), &current);

        let mut notes = current.clone();
        apply_placements(&mut notes, &placements);
        let order: Vec<&str> = notes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(order, vec!["c", "d", "a", "b"]);

        let mut positions: Vec<i64> = placements.iter().map(|p| p.position).collect();
        positions.sort_unstable();
        positions.dedup();
        assert_eq!(positions.len(), placements.len());
    }

    #[test]
    fn test_concurrently_added_notes_are_appended_not_dropped() {
        let mut x = test_note("x", 300);
        x.pinned = true;
        let y = test_note("y", 200);
        let z = test_note("z", 250);
        let a = test_note("a", 10);
        let b = test_note("b", 20);

        let placements = allocate_positions(
            0,
            &ids(&[]),
            &ids(&["a", "b"]),
            &[x, y, z, a, b],
        );
        let order: Vec<&str> = placements.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(order, vec!["x", "a", "b", "z", "y"]);
        assert!(placements[0].pinned);
    }

    #[test]
    fn test_duplicate_ids_keep_first_occurrence() {
        let placements = allocate_positions(0, &ids(&["a"]), &ids(&["a", "b", "b"]), &[]);
        let order: Vec<(&str, bool)> = placements
            .iter()
            .map(|p| (p.id.as_str(), p.pinned))
            .collect();
        assert_eq!(order, vec![("a", true), ("b", false)]);
    }

    #[test]
    fn test_repeated_reorders_stay_monotonic() {
        let notes = vec![test_note("a", 0), test_note("b", 0)];
        let first = allocate_positions(1_000, &[], &ids(&["a", "b"]), &notes);
        let second = allocate_positions(2_000, &[], &ids(&["b", "a"]), &notes);
        assert!(pos(&second, "b") > pos(&second, "a"));
        assert!(pos(&second, "a") > pos(&first, "a"));
    }

    #[test]
    fn test_position_for_new_note_stays_on_top() {
        let notes = vec![test_note("a", 5_000)];
        assert_eq!(position_for_new_note(1_000, &notes), 5_001);
        assert_eq!(position_for_new_note(9_000, &notes), 9_000);
        assert_eq!(position_for_new_note(42, &[]), 42);
    }

    #[test]
    fn test_compute_drag_order() {
        let list = ids(&["a", "b", "c"]);
        assert_eq!(
            compute_drag_order(&list, "a", "c", true),
            Some(ids(&["b", "c", "a"]))
        );
        assert_eq!(
            compute_drag_order(&list, "c", "a", false),
            Some(ids(&["c", "a", "b"]))
        );
        // b is already right after a.
        assert_eq!(compute_drag_order(&list, "b", "a", true), None);
        assert_eq!(compute_drag_order(&list, "a", "a", true), None);
        assert_eq!(compute_drag_order(&list, "zz", "a", true), None);
    }
}
