//! Property-based test generators using proptest.
//!
//! Forests are generated as parent vectors where every parent precedes its
//! child, so the generation order is always a valid parents-first order.
//! Delivery orders are shuffles of that order.

use crate::fixtures::{node_change, node_key};
use proptest::prelude::*;
use zonesync_protocol::{RecordChange, RecordKey};

/// A forest of nodes. Node at index `i` has id `i + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forest {
    /// Parent index of each node; always smaller than the node's own index.
    pub parents: Vec<Option<usize>>,
}

impl Forest {
    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    /// Returns true if the forest has no nodes.
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Record id of the node at `index`.
    pub fn id(index: usize) -> i64 {
        index as i64 + 1
    }

    /// Key of the node at `index`.
    pub fn key(index: usize) -> RecordKey {
        node_key(Self::id(index))
    }

    /// Remote change for the node at `index`, stamped `ts`.
    pub fn change(&self, index: usize, ts: u64) -> RecordChange {
        node_change(
            Self::id(index),
            self.parents[index].map(Self::id),
            &format!("node-{index}"),
            ts,
        )
    }

    /// Remote changes for every node, in `order`.
    pub fn changes_in(&self, order: &[usize], ts: u64) -> Vec<RecordChange> {
        order.iter().map(|&i| self.change(i, ts)).collect()
    }

    /// `index` and all of its descendants.
    pub fn subtree(&self, index: usize) -> Vec<usize> {
        let mut members = vec![index];
        // Children always follow their parent.
        for i in index + 1..self.len() {
            if let Some(p) = self.parents[i] {
                if members.contains(&p) {
                    members.push(i);
                }
            }
        }
        members
    }

    /// Returns true if `ancestor` lies on the parent chain of `index`.
    pub fn is_ancestor(&self, ancestor: usize, index: usize) -> bool {
        let mut current = self.parents[index];
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.parents[p];
        }
        false
    }
}

/// Strategy for forests of 1 to `max_nodes` nodes.
pub fn forest_strategy(max_nodes: usize) -> impl Strategy<Value = Forest> {
    (1..=max_nodes.max(1)).prop_flat_map(|n| {
        let slots: Vec<BoxedStrategy<Option<usize>>> = (0..n)
            .map(|i| {
                if i == 0 {
                    Just(None).boxed()
                } else {
                    prop::option::weighted(0.8, 0..i).boxed()
                }
            })
            .collect();
        slots.prop_map(|parents| Forest { parents })
    })
}

/// Strategy for a forest plus a random delivery order of its nodes.
pub fn shuffled_forest_strategy(max_nodes: usize) -> impl Strategy<Value = (Forest, Vec<usize>)> {
    forest_strategy(max_nodes).prop_flat_map(|forest| {
        let order: Vec<usize> = (0..forest.len()).collect();
        (Just(forest), Just(order).prop_shuffle())
    })
}

/// Strategy for a shuffled forest and a fetch page size.
pub fn paged_delivery_strategy(
    max_nodes: usize,
) -> impl Strategy<Value = (Forest, Vec<usize>, usize)> {
    (shuffled_forest_strategy(max_nodes), 1usize..=4)
        .prop_map(|((forest, order), page)| (forest, order, page))
}

/// Strategy for labels with distinct timestamps, in arbitrary order.
pub fn timestamped_labels_strategy(max_edits: usize) -> impl Strategy<Value = Vec<(String, u64)>> {
    prop::collection::vec(label_strategy(), 1..=max_edits.max(1)).prop_flat_map(|labels| {
        let stamps: Vec<u64> = (1..=labels.len() as u64).collect();
        (Just(labels), Just(stamps).prop_shuffle())
            .prop_map(|(labels, stamps)| labels.into_iter().zip(stamps).collect())
    })
}

/// Strategy for short lowercase labels.
pub fn label_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex")
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn forest_parents_precede_children(forest in forest_strategy(30)) {
            for (i, parent) in forest.parents.iter().enumerate() {
                if let Some(p) = parent {
                    prop_assert!(*p < i);
                }
            }
        }

        #[test]
        fn shuffle_is_permutation((forest, order) in shuffled_forest_strategy(30)) {
            let mut sorted = order.clone();
            sorted.sort_unstable();
            prop_assert_eq!(sorted, (0..forest.len()).collect::<Vec<_>>());
        }

        #[test]
        fn subtree_members_descend_from_root(forest in forest_strategy(20), pick in any::<prop::sample::Index>()) {
            let root = pick.index(forest.len());
            for member in forest.subtree(root) {
                prop_assert!(member == root || forest.is_ancestor(root, member));
            }
        }

        #[test]
        fn labels_have_distinct_stamps(edits in timestamped_labels_strategy(10)) {
            let mut stamps: Vec<u64> = edits.iter().map(|(_, ts)| *ts).collect();
            stamps.sort_unstable();
            stamps.dedup();
            prop_assert_eq!(stamps.len(), edits.len());
        }
    }

    #[test]
    fn test_subtree_of_chain() {
        let forest = Forest {
            parents: vec![None, Some(0), Some(1), None],
        };
        assert_eq!(forest.subtree(1), vec![1, 2]);
        assert_eq!(forest.subtree(3), vec![3]);
        assert_eq!(Forest::key(2), node_key(3));
    }
}
