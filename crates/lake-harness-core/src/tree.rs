//! Flattening of nested API payloads.
//!
//! Some trackers return work items as trees (a task with sub-tasks with
//! sub-tasks). Collectors flatten them into one record per node before
//! persisting. Traversal uses an explicit stack instead of recursion.

use std::collections::BTreeMap;

/// A node of a nested payload.
pub trait TreeNode: Clone {
    type Id: Ord + Clone;

    fn node_id(&self) -> Self::Id;

    fn children(&self) -> &[Self];
}

/// Flatten a tree into a list, parent first, children in declared order.
///
/// Every returned node keeps its own `children`, mirroring the payload the
/// API returned for it.
pub fn flatten_tree<T: TreeNode>(root: &T) -> Vec<T> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        out.push(node.clone());
        for child in node.children().iter().rev() {
            stack.push(child);
        }
    }
    out
}

/// Add every descendant of the given top-level nodes to the map.
///
/// Existing entries are never overwritten: a top-level node always wins over
/// a nested copy with the same id, and among nested copies the first one
/// reached (in key order, then pre-order) wins.
pub fn merge_children<T: TreeNode>(nodes: BTreeMap<T::Id, T>) -> BTreeMap<T::Id, T> {
    let mut merged = nodes.clone();
    for node in nodes.values() {
        for descendant in flatten_tree(node).into_iter().skip(1) {
            merged.entry(descendant.node_id()).or_insert(descendant);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Task {
        id: i64,
        children: Vec<Task>,
    }

    impl TreeNode for Task {
        type Id = i64;

        fn node_id(&self) -> i64 {
            self.id
        }

        fn children(&self) -> &[Task] {
            &self.children
        }
    }

    fn leaf(id: i64) -> Task {
        Task {
            id,
            children: vec![],
        }
    }

    fn node(id: i64, children: Vec<Task>) -> Task {
        Task { id, children }
    }

    fn ids(tasks: &[Task]) -> Vec<i64> {
        tasks.iter().map(|t| t.id).collect()
    }

    #[test]
    fn flatten_leaf_is_itself() {
        assert_eq!(flatten_tree(&leaf(2)), vec![leaf(2)]);
    }

    #[test]
    fn flatten_is_pre_order() {
        let one_with_seven = node(1, vec![leaf(7)]);
        let root = node(3, vec![leaf(4), leaf(6), one_with_seven.clone()]);
        let flat = flatten_tree(&root);
        assert_eq!(ids(&flat), vec![3, 4, 6, 1, 7]);
        assert_eq!(flat[0], root);
        assert_eq!(flat[3], one_with_seven);
    }

    #[test]
    fn flatten_deep_chain() {
        let mut root = leaf(0);
        for id in 1..200 {
            root = node(id, vec![root]);
        }
        let flat = flatten_tree(&root);
        assert_eq!(flat.len(), 200);
        assert_eq!(flat.last().map(|t| t.id), Some(0));
    }

    #[test]
    fn merge_empty_and_flat_maps_unchanged() {
        assert!(merge_children(BTreeMap::<i64, Task>::new()).is_empty());

        let flat: BTreeMap<i64, Task> = [(1, leaf(1)), (2, leaf(2))].into_iter().collect();
        assert_eq!(merge_children(flat.clone()), flat);
    }

    #[test]
    fn merge_adds_shared_children_once() {
        let one = node(1, vec![leaf(3), leaf(4)]);
        let two = node(2, vec![leaf(3), leaf(4), leaf(5)]);
        let merged = merge_children([(1, one.clone()), (2, two.clone())].into_iter().collect());

        let expected: BTreeMap<i64, Task> = [
            (1, one),
            (2, two),
            (3, leaf(3)),
            (4, leaf(4)),
            (5, leaf(5)),
        ]
        .into_iter()
        .collect();
        assert_eq!(merged, expected);
    }

    #[test]
    fn merge_never_overwrites_top_level_entries() {
        let one = node(1, vec![leaf(3), leaf(4)]);
        let two = node(2, vec![leaf(3), leaf(4), leaf(5)]);
        let three = node(3, vec![leaf(3), leaf(4), leaf(6), one.clone()]);
        let merged = merge_children(
            [(1, one.clone()), (2, two.clone()), (3, three.clone())]
                .into_iter()
                .collect(),
        );

        assert_eq!(merged.len(), 6);
        assert_eq!(merged[&1], one);
        assert_eq!(merged[&3], three);
        assert_eq!(merged[&6], leaf(6));
    }
}
