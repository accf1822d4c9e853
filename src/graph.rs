// Merge graph of per-path change sequences
//
// Nodes are values observed at a position (index) of some replica history.
// Identity is (index, value) under the injected equality, so the same value
// seen at a different position is a different node. The graph never holds a
// cycle: linking back to an ancestor creates a fresh node for the value.

use crate::diff::Equivalence;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("No node for the source value at index {index}")]
    UnknownNode { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

struct Node<T> {
    // None for the start node
    value: Option<(T, usize)>,
    successors: Vec<NodeId>,
}

pub struct ChangeGraph<T, E> {
    equality: E,
    nodes: Vec<Node<T>>,
    edges: usize,
}

impl<T, E: Equivalence<T>> ChangeGraph<T, E> {
    pub fn new(equality: E) -> Self {
        Self {
            equality,
            nodes: vec![Node {
                value: None,
                successors: Vec::new(),
            }],
            edges: 0,
        }
    }

    pub fn start(&self) -> NodeId {
        NodeId(0)
    }

    /// Link `value` at `index` from the start node
    pub fn add_edge_from_start(&mut self, value: T, index: usize) -> NodeId {
        let node = match self.find(&value, index) {
            Some(node) => node,
            None => self.push(value, index),
        };
        self.link(self.start(), node);
        node
    }

    /// Link an existing node to `to_value` at `to_index`
    pub fn add_edge(
        &mut self,
        from_value: &T,
        from_index: usize,
        to_value: T,
        to_index: usize,
    ) -> Result<NodeId, GraphError> {
        let from = self
            .find(from_value, from_index)
            .ok_or(GraphError::UnknownNode { index: from_index })?;

        let to = match self.find(&to_value, to_index) {
            Some(existing) if existing != from && !self.is_ancestor(existing, from) => existing,
            Some(_) => {
                tracing::trace!("Value at index {} re-encountered downstream, adding a new node", to_index);
                self.push(to_value, to_index)
            }
            None => self.push(to_value, to_index),
        };

        self.link(from, to);
        Ok(to)
    }

    /// Most recently created node for (value, index)
    pub fn find(&self, value: &T, index: usize) -> Option<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .rev()
            .find(|(_, node)| match &node.value {
                Some((v, i)) => *i == index && self.equality.equivalent(v, value),
                None => false,
            })
            .map(|(id, _)| NodeId(id))
    }

    /// All value nodes, in creation order
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        (1..self.nodes.len()).map(NodeId)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn edge_count(&self) -> usize {
        self.edges
    }

    /// `None` for the start node
    pub fn value(&self, node: NodeId) -> Option<&T> {
        self.nodes[node.0].value.as_ref().map(|(v, _)| v)
    }

    pub fn index(&self, node: NodeId) -> Option<usize> {
        self.nodes[node.0].value.as_ref().map(|(_, i)| *i)
    }

    /// Whether two nodes hold equal values (start only equals start)
    pub fn same_value(&self, a: NodeId, b: NodeId) -> bool {
        match (self.value(a), self.value(b)) {
            (Some(a), Some(b)) => self.equality.equivalent(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    pub fn successors(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node.0].successors
    }

    /// Start nodes directly reaching `node`, i.e. its root values
    pub fn roots_of(&self, node: NodeId) -> Vec<NodeId> {
        self.start_successors()
            .filter(|root| *root == node || self.is_ancestor(*root, node))
            .collect()
    }

    fn start_successors(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[0].successors.iter().copied()
    }

    /// True when `ancestor` strictly precedes `node`
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<NodeId> = self.successors(ancestor).to_vec();
        while let Some(current) = stack.pop() {
            if current == node {
                return true;
            }
            if seen.insert(current) {
                stack.extend_from_slice(self.successors(current));
            }
        }
        false
    }

    /// Members of `nodes` that are not an ancestor of another member
    pub fn leading(&self, nodes: &[NodeId]) -> Vec<NodeId> {
        let unique: BTreeSet<NodeId> = nodes.iter().copied().collect();
        unique
            .iter()
            .copied()
            .filter(|candidate| {
                !unique
                    .iter()
                    .any(|other| other != candidate && self.is_ancestor(*candidate, *other))
            })
            .collect()
    }

    fn push(&mut self, value: T, index: usize) -> NodeId {
        self.nodes.push(Node {
            value: Some((value, index)),
            successors: Vec::new(),
        });
        NodeId(self.nodes.len() - 1)
    }

    fn link(&mut self, from: NodeId, to: NodeId) {
        let successors = &mut self.nodes[from.0].successors;
        if !successors.contains(&to) {
            successors.push(to);
            self.edges += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Exact;

    impl Equivalence<&'static str> for Exact {
        fn equivalent(&self, a: &&'static str, b: &&'static str) -> bool {
            a == b
        }
    }

    struct IgnoreCase;

    impl Equivalence<&'static str> for IgnoreCase {
        fn equivalent(&self, a: &&'static str, b: &&'static str) -> bool {
            a.eq_ignore_ascii_case(b)
        }
    }

    #[test]
    fn test_back_edge_creates_distinct_node() {
        let mut graph = ChangeGraph::new(Exact);
        let a = graph.add_edge_from_start("A", 2);
        let b = graph.add_edge(&"A", 2, "B", 3).unwrap();
        let a_again = graph.add_edge(&"B", 3, "A", 2).unwrap();

        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 3);
        assert_ne!(a, a_again);

        assert_eq!(graph.successors(graph.start()), &[a]);
        assert_eq!(graph.successors(a), &[b]);
        assert_eq!(graph.successors(b), &[a_again]);
        assert!(graph.successors(a_again).is_empty());
        assert_eq!(graph.value(a_again), Some(&"A"));
        assert!(graph.is_ancestor(a, a_again));
        assert!(!graph.is_ancestor(a_again, a));
    }

    #[test]
    fn test_same_value_at_other_index_is_distinct() {
        let mut graph = ChangeGraph::new(Exact);
        let a = graph.add_edge_from_start("A", 2);
        graph.add_edge(&"A", 2, "B", 3).unwrap();
        let a4 = graph.add_edge(&"B", 3, "A", 4).unwrap();

        assert_ne!(a, a4);
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.index(a4), Some(4));
    }

    #[test]
    fn test_nodes_and_edges_are_deduplicated() {
        let mut graph = ChangeGraph::new(IgnoreCase);
        let a = graph.add_edge_from_start("a", 0);
        assert_eq!(graph.add_edge_from_start("A", 0), a);

        let b = graph.add_edge(&"a", 0, "b", 1).unwrap();
        assert_eq!(graph.add_edge(&"A", 0, "B", 1).unwrap(), b);

        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn test_unknown_source_fails() {
        let mut graph = ChangeGraph::new(Exact);
        graph.add_edge_from_start("A", 0);
        assert_eq!(
            graph.add_edge(&"A", 1, "B", 2),
            Err(GraphError::UnknownNode { index: 1 })
        );
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn test_leading_nodes() {
        // Two replicas share a root, one advances twice, the other once
        let mut graph = ChangeGraph::new(Exact);
        let root = graph.add_edge_from_start("v0", 0);
        let left = graph.add_edge(&"v0", 0, "v1", 1).unwrap();
        let left2 = graph.add_edge(&"v1", 1, "v2", 2).unwrap();
        let right = graph.add_edge(&"v0", 0, "w1", 1).unwrap();

        assert_eq!(graph.leading(&[root, left2]), vec![left2]);
        assert_eq!(graph.leading(&[left, left2, left]), vec![left2]);

        let mut divergent = graph.leading(&[left2, right]);
        divergent.sort();
        assert_eq!(divergent, vec![left2, right]);

        assert_eq!(graph.roots_of(left2), vec![root]);
        assert_eq!(graph.roots_of(root), vec![root]);
    }
}
