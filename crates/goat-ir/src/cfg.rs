//! Block-level CFG navigation over deserialized SSA functions.
//!
//! Provides successors/predecessors, traversal orders, dominators and loop
//! headers over the basic-block graph recorded in the input.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::graph::{DominatorTree, Graph};
use crate::ir::{BasicBlock, EdgeKind, Function, Instruction, Op};

/// A traversable view of a function's CFG
pub struct Cfg<'a> {
    func: &'a Function,
    successors: FxHashMap<u32, Vec<(u32, &'a EdgeKind)>>,
    predecessors: FxHashMap<u32, Vec<(u32, &'a EdgeKind)>>,
}

impl<'a> Cfg<'a> {
    /// Build traversal indices from a deserialized function
    pub fn from_function(func: &'a Function) -> Self {
        let mut successors: FxHashMap<u32, Vec<(u32, &EdgeKind)>> = FxHashMap::default();
        let mut predecessors: FxHashMap<u32, Vec<(u32, &EdgeKind)>> = FxHashMap::default();

        for block in &func.blocks {
            successors.entry(block.id).or_default();
            predecessors.entry(block.id).or_default();
        }

        for edge in &func.cfg_edges {
            successors
                .entry(edge.from_block)
                .or_default()
                .push((edge.to_block, &edge.kind));
            predecessors
                .entry(edge.to_block)
                .or_default()
                .push((edge.from_block, &edge.kind));
        }
        // The true branch of an `If` always comes first.
        for succs in successors.values_mut() {
            succs.sort_by_key(|(_, kind)| **kind == EdgeKind::CondFalse);
        }

        Self {
            func,
            successors,
            predecessors,
        }
    }

    pub fn function(&self) -> &'a Function {
        self.func
    }

    /// Entry block (always block 0 in go/ssa)
    pub fn entry_block(&self) -> Option<&'a BasicBlock> {
        self.func.blocks.first()
    }

    pub fn block(&self, id: u32) -> Option<&'a BasicBlock> {
        self.func.blocks.get(id as usize)
    }

    pub fn successors(&self, block_id: u32) -> &[(u32, &'a EdgeKind)] {
        self.successors
            .get(&block_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn successor_ids(&self, block_id: u32) -> Vec<u32> {
        self.successors(block_id).iter().map(|(b, _)| *b).collect()
    }

    pub fn predecessors(&self, block_id: u32) -> &[(u32, &'a EdgeKind)] {
        self.predecessors
            .get(&block_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn blocks(&self) -> impl Iterator<Item = &'a BasicBlock> {
        self.func.blocks.iter()
    }

    pub fn block_count(&self) -> usize {
        self.func.blocks.len()
    }

    /// Blocks ending in `Return`
    pub fn return_blocks(&self) -> Vec<&'a BasicBlock> {
        self.blocks_ending_with(|op| matches!(op, Op::Return { .. }))
    }

    /// Blocks ending in `Panic`
    pub fn panic_blocks(&self) -> Vec<&'a BasicBlock> {
        self.blocks_ending_with(|op| matches!(op, Op::Panic { .. }))
    }

    fn blocks_ending_with(&self, pred: impl Fn(&Op) -> bool) -> Vec<&'a BasicBlock> {
        self.func
            .blocks
            .iter()
            .filter(|b| b.instructions.last().is_some_and(|i| pred(&i.op)))
            .collect()
    }

    /// BFS traversal from entry
    pub fn bfs_order(&self) -> Vec<u32> {
        let mut visited = FxHashSet::default();
        let mut order = Vec::new();
        let mut queue = VecDeque::new();

        if let Some(entry) = self.entry_block() {
            queue.push_back(entry.id);
            visited.insert(entry.id);
        }

        while let Some(id) = queue.pop_front() {
            order.push(id);
            for &(succ_id, _) in self.successors(id) {
                if visited.insert(succ_id) {
                    queue.push_back(succ_id);
                }
            }
        }

        order
    }

    /// Reverse post-order (useful for dataflow analysis)
    pub fn reverse_postorder(&self) -> Vec<u32> {
        let mut visited = FxHashSet::default();
        let mut postorder = Vec::new();

        if let Some(entry) = self.entry_block() {
            self.dfs_postorder(entry.id, &mut visited, &mut postorder);
        }

        postorder.reverse();
        postorder
    }

    fn dfs_postorder(&self, block_id: u32, visited: &mut FxHashSet<u32>, postorder: &mut Vec<u32>) {
        if !visited.insert(block_id) {
            return;
        }
        for &(succ_id, _) in self.successors(block_id) {
            self.dfs_postorder(succ_id, visited, postorder);
        }
        postorder.push(block_id);
    }

    pub fn reachable_from(&self, start: u32) -> FxHashSet<u32> {
        let mut visited = FxHashSet::default();
        let mut queue = VecDeque::from([start]);

        while let Some(id) = queue.pop_front() {
            if visited.insert(id) {
                for &(succ_id, _) in self.successors(id) {
                    queue.push_back(succ_id);
                }
            }
        }

        visited
    }

    pub fn graph(&self) -> Graph<u32> {
        Graph::from_roots([0], |b| self.successor_ids(b))
    }

    pub fn dominators(&self) -> DominatorTree<u32> {
        self.graph().dominators(0)
    }

    /// Targets of back edges: blocks dominating one of their predecessors.
    pub fn loop_headers(&self) -> FxHashSet<u32> {
        let dom = self.dominators();
        self.func
            .blocks
            .iter()
            .filter(|b| {
                self.predecessors(b.id)
                    .iter()
                    .any(|&(pred, _)| dom.dominates(b.id, pred))
            })
            .map(|b| b.id)
            .collect()
    }

    pub fn has_cycle(&self) -> bool {
        let graph = self.graph();
        let sccs = graph.scc();
        (0..sccs.len()).any(|c| sccs.is_recursive(c))
    }

    /// All instructions matching `pred`, with their block.
    pub fn find_instructions(&self, pred: impl Fn(&Op) -> bool) -> Vec<(u32, &'a Instruction)> {
        let mut results = Vec::new();
        for block in &self.func.blocks {
            for instr in &block.instructions {
                if pred(&instr.op) {
                    results.push((block.id, instr));
                }
            }
        }
        results
    }

    pub fn call_sites(&self) -> Vec<(u32, &'a Instruction)> {
        self.find_instructions(|op| matches!(op, Op::Call { .. } | Op::Go { .. } | Op::Defer { .. }))
    }
}
