// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeSet;

use petgraph::{prelude::DiGraph, Direction};

/// NodeIndex as employed in tasktree usage
pub type NodeIndex = petgraph::prelude::NodeIndex<u32>;

/// Simplistic encapsulation of petgraph APIs to provide
/// suitable mechanisms to empower scheduling code
#[derive(Debug, Clone)]
pub struct Dag<N>(DiGraph<N, (), u32>);

impl<N> Default for Dag<N> {
    fn default() -> Self {
        Self(DiGraph::default())
    }
}

impl<N> Dag<N>
where
    N: Clone + PartialEq,
{
    /// Construct a new Dag
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds node N to the graph and returns the index.
    /// If N already exists, it'll return the index of that node.
    pub fn add_node_or_get_index(&mut self, node: N) -> NodeIndex {
        if let Some(index) = self.get_index(&node) {
            index
        } else {
            self.0.add_node(node)
        }
    }

    /// Add an edge from a to b. If the edge would close a cycle the
    /// offending ring `b, .., a` is returned instead of the edge being
    /// added.
    pub fn add_edge(&mut self, a: NodeIndex, b: NodeIndex) -> Result<(), Vec<N>> {
        if a == b {
            return Err(vec![self.0[a].clone()]);
        }

        // A path b -> .. -> a means a -> b closes a ring
        if let Some(path) = self.path(b, a) {
            return Err(path.into_iter().map(|i| self.0[i].clone()).collect());
        }

        if self.0.find_edge(a, b).is_none() {
            self.0.add_edge(a, b, ());
        }

        Ok(())
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = &'_ N> {
        self.0.node_indices().map(|i| &self.0[i])
    }

    /// Topological sort. Ties between ready nodes are broken by node
    /// index, i.e. by insertion order, so the schedule is deterministic.
    pub fn topo(&self) -> Vec<&'_ N> {
        let mut in_degree = vec![0usize; self.0.node_count()];

        for index in self.0.node_indices() {
            in_degree[index.index()] = self.0.neighbors_directed(index, Direction::Incoming).count();
        }

        let mut ready = self
            .0
            .node_indices()
            .filter(|i| in_degree[i.index()] == 0)
            .collect::<BTreeSet<_>>();

        let mut sorted = Vec::with_capacity(self.0.node_count());

        while let Some(next) = ready.pop_first() {
            sorted.push(&self.0[next]);

            for succ in self.0.neighbors(next) {
                in_degree[succ.index()] -= 1;

                if in_degree[succ.index()] == 0 {
                    ready.insert(succ);
                }
            }
        }

        sorted
    }

    /// Return the index for node of type N
    pub fn get_index(&self, node: &N) -> Option<NodeIndex> {
        self.0.node_indices().find(|i| self.0[*i] == *node)
    }

    /// Some path from `from` to `to`, if one exists
    fn path(&self, from: NodeIndex, to: NodeIndex) -> Option<Vec<NodeIndex>> {
        let mut stack = vec![vec![from]];

        while let Some(path) = stack.pop() {
            let last = *path.last().expect("paths are never empty");

            if last == to {
                return Some(path);
            }

            for succ in self.0.neighbors(last) {
                if !path.contains(&succ) {
                    let mut next = path.clone();
                    next.push(succ);
                    stack.push(next);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cycle_reports_ring() {
        let mut dag = Dag::new();

        let a = dag.add_node_or_get_index("a");
        let b = dag.add_node_or_get_index("b");
        let c = dag.add_node_or_get_index("c");

        dag.add_edge(a, b).unwrap();
        dag.add_edge(b, c).unwrap();

        let ring = dag.add_edge(c, a).unwrap_err();
        assert_eq!(ring, vec!["a", "b", "c"]);
    }

    #[test]
    fn self_edge_is_a_ring() {
        let mut dag = Dag::new();
        let a = dag.add_node_or_get_index("a");
        assert_eq!(dag.add_edge(a, a).unwrap_err(), vec!["a"]);
    }

    #[test]
    fn duplicate_nodes_and_edges_collapse() {
        let mut dag = Dag::new();

        let a = dag.add_node_or_get_index("a");
        let a2 = dag.add_node_or_get_index("a");
        assert_eq!(a, a2);

        let b = dag.add_node_or_get_index("b");
        dag.add_edge(a, b).unwrap();
        dag.add_edge(a, b).unwrap();

        assert_eq!(dag.iter_nodes().count(), 2);
    }

    #[test]
    fn topo_is_insertion_deterministic() {
        let mut dag = Dag::new();

        // d depends on b and c, which depend on a; b inserted before c
        let a = dag.add_node_or_get_index("a");
        let b = dag.add_node_or_get_index("b");
        let c = dag.add_node_or_get_index("c");
        let d = dag.add_node_or_get_index("d");

        dag.add_edge(a, b).unwrap();
        dag.add_edge(a, c).unwrap();
        dag.add_edge(b, d).unwrap();
        dag.add_edge(c, d).unwrap();

        assert_eq!(dag.topo(), vec![&"a", &"b", &"c", &"d"]);
    }
}
