//! Position bookkeeping for ordered rows (blocks, upsell items).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

/// Move the item at `from` to `to` and return the new position of every
/// item whose position changed. Only rows between `from` and `to` (inclusive)
/// are touched.
pub fn move_item<T: Clone>(ids: &[T], from: usize, to: usize) -> Vec<(T, i32)> {
    if from >= ids.len() || to >= ids.len() || from == to {
        return Vec::new();
    }

    let mut reordered = ids.to_vec();
    let moved = reordered.remove(from);
    reordered.insert(to, moved);

    let (lo, hi) = if from < to { (from, to) } else { (to, from) };
    (lo..=hi)
        .map(|index| (reordered[index].clone(), index as i32))
        .collect()
}

/// Indices to swap when moving `index` one step in `direction`, or `None`
/// when the item is already at that edge.
pub fn swap_adjacent(len: usize, index: usize, direction: Direction) -> Option<(usize, usize)> {
    if index >= len {
        return None;
    }
    match direction {
        Direction::Up if index > 0 => Some((index - 1, index)),
        Direction::Down if index + 1 < len => Some((index, index + 1)),
        _ => None,
    }
}

/// Assign contiguous 0-based positions following slice order.
pub fn resequence<T: Clone>(ids: &[T]) -> Vec<(T, i32)> {
    ids.iter()
        .enumerate()
        .map(|(index, id)| (id.clone(), index as i32))
        .collect()
}

/// Apply a one-step move and return the full resequenced order.
pub fn move_adjacent<T: Clone>(ids: &[T], index: usize, direction: Direction) -> Vec<(T, i32)> {
    let mut ids = ids.to_vec();
    if let Some((a, b)) = swap_adjacent(ids.len(), index, direction) {
        ids.swap(a, b);
    }
    resequence(&ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_move_forward_touches_range_only() {
        let ids = ["a", "b", "c", "d", "e"];
        let changes = move_item(&ids, 1, 3);
        assert_eq!(changes, vec![("c", 1), ("d", 2), ("b", 3)]);
    }

    #[test]
    fn test_move_backward() {
        let ids = ["a", "b", "c", "d"];
        let changes = move_item(&ids, 3, 0);
        assert_eq!(changes, vec![("d", 0), ("a", 1), ("b", 2), ("c", 3)]);
    }

    #[test]
    fn test_move_out_of_range_is_noop() {
        assert!(move_item(&["a", "b"], 0, 5).is_empty());
        assert!(move_item(&["a", "b"], 1, 1).is_empty());
    }

    #[test]
    fn test_edges_do_not_move() {
        assert_eq!(swap_adjacent(3, 0, Direction::Up), None);
        assert_eq!(swap_adjacent(3, 2, Direction::Down), None);
        assert_eq!(swap_adjacent(3, 1, Direction::Up), Some((0, 1)));
        assert_eq!(swap_adjacent(3, 1, Direction::Down), Some((1, 2)));
    }

    #[test]
    fn test_move_adjacent_resequences() {
        let order = move_adjacent(&["x", "y", "z"], 2, Direction::Up);
        assert_eq!(order, vec![("x", 0), ("z", 1), ("y", 2)]);
    }

    proptest! {
        #[test]
        fn move_adjacent_yields_contiguous_permutation(
            len in 1usize..20,
            index in 0usize..20,
            up in any::<bool>(),
        ) {
            let ids: Vec<usize> = (0..len).collect();
            let direction = if up { Direction::Up } else { Direction::Down };
            let order = move_adjacent(&ids, index, direction);

            let positions: Vec<i32> = order.iter().map(|(_, pos)| *pos).collect();
            prop_assert_eq!(positions, (0..len as i32).collect::<Vec<_>>());

            let mut seen: Vec<usize> = order.iter().map(|(id, _)| *id).collect();
            seen.sort_unstable();
            prop_assert_eq!(seen, ids);
        }

        #[test]
        fn move_item_matches_full_reorder(len in 1usize..15, from in 0usize..15, to in 0usize..15) {
            let ids: Vec<usize> = (0..len).collect();
            let mut positions: Vec<usize> = ids.clone();
            for (id, pos) in move_item(&ids, from, to) {
                positions[pos as usize] = id;
            }
            let mut expected = ids.clone();
            if from < len && to < len {
                let moved = expected.remove(from);
                expected.insert(to, moved);
            }
            prop_assert_eq!(positions, expected);
        }
    }
}
