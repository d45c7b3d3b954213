//! Generic directed graphs over copyable node keys.
//!
//! Call graphs, block graphs and superlocation graphs are all views of
//! [`Graph`]: a petgraph `DiGraph` plus a key-to-index map. Strongly
//! connected components and dominator trees are computed with petgraph's
//! algorithms and translated back to node keys.

use std::collections::VecDeque;
use std::hash::Hash;

use petgraph::algo::{dominators::simple_fast, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Debug, Clone)]
pub struct Graph<N: Copy + Eq + Hash> {
    graph: DiGraph<N, ()>,
    index: FxHashMap<N, NodeIndex>,
}

impl<N: Copy + Eq + Hash> Default for Graph<N> {
    fn default() -> Self {
        Self {
            graph: DiGraph::new(),
            index: FxHashMap::default(),
        }
    }
}

impl<N: Copy + Eq + Hash> Graph<N> {
    /// Explore the graph reachable from `roots`.
    pub fn from_roots<I, F>(roots: I, mut edges: F) -> Self
    where
        I: IntoIterator<Item = N>,
        F: FnMut(N) -> Vec<N>,
    {
        let mut g = Self::default();
        let mut queue: VecDeque<N> = VecDeque::new();
        for root in roots {
            if !g.index.contains_key(&root) {
                g.add_node(root);
                queue.push_back(root);
            }
        }
        while let Some(node) = queue.pop_front() {
            for succ in edges(node) {
                if !g.index.contains_key(&succ) {
                    g.add_node(succ);
                    queue.push_back(succ);
                }
                g.add_edge(node, succ);
            }
        }
        g
    }

    /// Graph over exactly `nodes`; edges leaving the node set are dropped.
    pub fn from_nodes<I, F>(nodes: I, mut edges: F) -> Self
    where
        I: IntoIterator<Item = N>,
        F: FnMut(N) -> Vec<N>,
    {
        let mut g = Self::default();
        let nodes: Vec<N> = nodes.into_iter().collect();
        for &node in &nodes {
            g.add_node(node);
        }
        for &node in &nodes {
            for succ in edges(node) {
                if g.index.contains_key(&succ) {
                    g.add_edge(node, succ);
                }
            }
        }
        g
    }

    pub fn add_node(&mut self, node: N) {
        if !self.index.contains_key(&node) {
            let idx = self.graph.add_node(node);
            self.index.insert(node, idx);
        }
    }

    /// Adds `from -> to` once, inserting missing endpoints.
    pub fn add_edge(&mut self, from: N, to: N) {
        self.add_node(from);
        self.add_node(to);
        let (a, b) = (self.index[&from], self.index[&to]);
        if self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, ());
        }
    }

    pub fn contains(&self, node: N) -> bool {
        self.index.contains_key(&node)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = N> + '_ {
        self.graph.node_weights().copied()
    }

    /// Successors of `node`, in insertion order.
    pub fn edges(&self, node: N) -> Vec<N> {
        self.neighbors(node, Direction::Outgoing)
    }

    pub fn predecessors(&self, node: N) -> Vec<N> {
        self.neighbors(node, Direction::Incoming)
    }

    fn neighbors(&self, node: N, dir: Direction) -> Vec<N> {
        let Some(&idx) = self.index.get(&node) else {
            return vec![];
        };
        // petgraph yields the most recent edge first.
        let mut out: Vec<N> = self
            .graph
            .neighbors_directed(idx, dir)
            .map(|n| self.graph[n])
            .collect();
        out.reverse();
        out
    }

    /// Breadth-first search from `from`; returns the first node for which
    /// `found` holds.
    pub fn bfs(&self, from: N, mut found: impl FnMut(N) -> bool) -> Option<N> {
        let mut seen = FxHashSet::default();
        let mut queue = VecDeque::from([from]);
        seen.insert(from);
        while let Some(node) = queue.pop_front() {
            if found(node) {
                return Some(node);
            }
            for succ in self.edges(node) {
                if seen.insert(succ) {
                    queue.push_back(succ);
                }
            }
        }
        None
    }

    pub fn reachable(&self, from: N) -> FxHashSet<N> {
        let mut seen = FxHashSet::default();
        self.bfs(from, |n| {
            seen.insert(n);
            false
        });
        seen
    }

    /// Strongly connected components in reverse topological order: every
    /// component comes after all components it has edges to.
    pub fn scc(&self) -> Sccs<N> {
        let raw = tarjan_scc(&self.graph);
        let mut component_of = FxHashMap::default();
        let components: Vec<Vec<N>> = raw
            .iter()
            .enumerate()
            .map(|(c, members)| {
                members
                    .iter()
                    .map(|&idx| {
                        let node = self.graph[idx];
                        component_of.insert(node, c);
                        node
                    })
                    .collect()
            })
            .collect();

        let mut component_edges = vec![Vec::new(); components.len()];
        let mut recursive = vec![false; components.len()];
        for (c, members) in components.iter().enumerate() {
            recursive[c] = members.len() > 1;
            for &node in members {
                for succ in self.edges(node) {
                    let target = component_of[&succ];
                    if target == c {
                        recursive[c] = true;
                    } else if !component_edges[c].contains(&target) {
                        component_edges[c].push(target);
                    }
                }
            }
        }
        Sccs {
            components,
            component_of,
            component_edges,
            recursive,
        }
    }

    /// Dominator tree rooted at `root`. Nodes unreachable from `root` are
    /// not part of the tree.
    pub fn dominators(&self, root: N) -> DominatorTree<N> {
        let Some(&root_idx) = self.index.get(&root) else {
            return DominatorTree {
                root,
                idom: FxHashMap::default(),
                depth: FxHashMap::default(),
            };
        };
        let doms = simple_fast(&self.graph, root_idx);
        let mut idom = FxHashMap::default();
        for idx in self.graph.node_indices() {
            if let Some(parent) = doms.immediate_dominator(idx) {
                idom.insert(self.graph[idx], self.graph[parent]);
            }
        }
        let mut depth = FxHashMap::default();
        depth.insert(root, 0usize);
        for node in self.reachable(root) {
            let mut d = 0;
            let mut current = node;
            while let Some(&parent) = idom.get(&current) {
                d += 1;
                current = parent;
            }
            depth.insert(node, d);
        }
        DominatorTree { root, idom, depth }
    }
}

/// Result of [`Graph::scc`], doubling as the condensation of the graph.
#[derive(Debug, Clone)]
pub struct Sccs<N: Copy + Eq + Hash> {
    components: Vec<Vec<N>>,
    component_of: FxHashMap<N, usize>,
    component_edges: Vec<Vec<usize>>,
    recursive: Vec<bool>,
}

impl<N: Copy + Eq + Hash> Sccs<N> {
    /// Components in reverse topological order.
    pub fn components(&self) -> &[Vec<N>] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn component_of(&self, node: N) -> Option<usize> {
        self.component_of.get(&node).copied()
    }

    /// Whether the component contains a cycle (including a self-loop).
    pub fn is_recursive(&self, component: usize) -> bool {
        self.recursive[component]
    }

    /// Successor components in the condensed graph.
    pub fn component_edges(&self, component: usize) -> &[usize] {
        &self.component_edges[component]
    }

    /// Successor components of the component holding `node`.
    pub fn node_edges(&self, node: N) -> &[usize] {
        match self.component_of(node) {
            Some(c) => self.component_edges(c),
            None => &[],
        }
    }

    pub fn same_component(&self, a: N, b: N) -> bool {
        matches!((self.component_of(a), self.component_of(b)), (Some(x), Some(y)) if x == y)
    }
}

#[derive(Debug, Clone)]
pub struct DominatorTree<N: Copy + Eq + Hash> {
    root: N,
    idom: FxHashMap<N, N>,
    depth: FxHashMap<N, usize>,
}

impl<N: Copy + Eq + Hash> DominatorTree<N> {
    pub fn root(&self) -> N {
        self.root
    }

    pub fn idom(&self, node: N) -> Option<N> {
        self.idom.get(&node).copied()
    }

    pub fn contains(&self, node: N) -> bool {
        self.depth.contains_key(&node)
    }

    /// Reflexive dominance.
    pub fn dominates(&self, a: N, b: N) -> bool {
        if !self.contains(a) || !self.contains(b) {
            return false;
        }
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            match self.idom.get(&current) {
                Some(&parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Lowest common dominator of `nodes`. Nodes outside the tree are ignored.
    pub fn lcd(&self, nodes: impl IntoIterator<Item = N>) -> Option<N> {
        nodes
            .into_iter()
            .filter(|n| self.contains(*n))
            .fold(None, |acc, n| match acc {
                None => Some(n),
                Some(a) => Some(self.common(a, n)),
            })
    }

    fn common(&self, mut a: N, mut b: N) -> N {
        let mut da = self.depth[&a];
        let mut db = self.depth[&b];
        while da > db {
            a = self.idom[&a];
            da -= 1;
        }
        while db > da {
            b = self.idom[&b];
            db -= 1;
        }
        while a != b {
            a = self.idom[&a];
            b = self.idom[&b];
        }
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Graph<u32> {
        // 0 -> 1 -> 3, 0 -> 2 -> 3, 3 -> 4 -> 3
        let adj: FxHashMap<u32, Vec<u32>> = [
            (0, vec![1, 2]),
            (1, vec![3]),
            (2, vec![3]),
            (3, vec![4]),
            (4, vec![3]),
        ]
        .into_iter()
        .collect();
        Graph::from_roots([0], |n| adj.get(&n).cloned().unwrap_or_default())
    }

    #[test]
    fn test_from_roots_explores_reachable() {
        let g = diamond();
        assert_eq!(g.node_count(), 5);
        assert_eq!(g.edges(0), vec![1, 2]);
        assert_eq!(g.predecessors(3), vec![1, 2, 4]);
        assert_eq!(g.reachable(1).len(), 3);
        assert_eq!(g.bfs(0, |n| n == 4), Some(4));
        assert_eq!(g.bfs(1, |n| n == 2), None);
    }

    #[test]
    fn test_scc_order_and_recursion() {
        let g = diamond();
        let sccs = g.scc();
        assert_eq!(sccs.len(), 4);
        assert!(sccs.same_component(3, 4));
        let loop_c = sccs.component_of(3).unwrap();
        let entry_c = sccs.component_of(0).unwrap();
        assert!(sccs.is_recursive(loop_c));
        assert!(!sccs.is_recursive(entry_c));
        // Callees before callers.
        assert!(loop_c < entry_c);
        assert_eq!(sccs.node_edges(0).len(), 2);
    }

    #[test]
    fn test_self_loop_is_recursive() {
        let g = Graph::from_roots([7u32], |n| if n == 7 { vec![7] } else { vec![] });
        let sccs = g.scc();
        assert!(sccs.is_recursive(sccs.component_of(7).unwrap()));
    }

    #[test]
    fn test_dominators_and_lcd() {
        let g = diamond();
        let dom = g.dominators(0);
        assert_eq!(dom.idom(3), Some(0));
        assert_eq!(dom.idom(4), Some(3));
        assert!(dom.dominates(0, 4));
        assert!(dom.dominates(3, 3));
        assert!(!dom.dominates(1, 3));
        assert_eq!(dom.lcd([1, 2]), Some(0));
        assert_eq!(dom.lcd([4, 3]), Some(3));
        assert_eq!(dom.lcd([4]), Some(4));
        assert_eq!(dom.lcd(std::iter::empty()), None);
    }

    #[test]
    fn test_from_nodes_drops_outside_edges() {
        let g = Graph::from_nodes([1u32, 2], |n| vec![n + 1]);
        assert_eq!(g.edges(1), vec![2]);
        assert!(g.edges(2).is_empty());
    }
}
