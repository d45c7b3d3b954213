//! Worklist construction of the superlocation graph.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::{debug, trace};

use goat_cfg::NodeKind;
use goat_ir::ir::{Op, ValueId};
use goat_ir::FuncId;
use goat_lattice::{Lattice, Widen};

use crate::context::AnalysisContext;
use crate::error::AnalysisError;
use crate::goro::{Context, CtrLoc, Goro, Superloc};
use crate::memory::{HeapLoc, Memory};
use crate::options::WorklistOrder;
use crate::state::State;
use crate::transitions::{Step, Transition};
use crate::value::AbstractValue;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Edge {
    pub from: Superloc,
    pub to: Superloc,
    pub transition: Transition,
}

/// Reachable configurations, each superlocation paired with the join of
/// the memories it was reached with.
#[derive(Debug, Default)]
pub struct SuperlocGraph {
    pub roots: Vec<Superloc>,
    pub states: BTreeMap<Superloc, State>,
    pub edges: Vec<Edge>,
    /// Superlocations still queued when the deadline elapsed.
    pub frontier: BTreeSet<Superloc>,
    successors: FxHashMap<Superloc, Vec<usize>>,
    predecessors: FxHashMap<Superloc, Vec<usize>>,
}

impl SuperlocGraph {
    fn add_edge(&mut self, edge: Edge) {
        let index = self.edges.len();
        self.successors.entry(edge.from).or_default().push(index);
        self.predecessors.entry(edge.to).or_default().push(index);
        self.edges.push(edge);
    }

    pub fn outgoing(&self, sl: Superloc) -> impl Iterator<Item = &Edge> {
        self.successors
            .get(&sl)
            .into_iter()
            .flatten()
            .map(|i| &self.edges[*i])
    }

    pub fn incoming(&self, sl: Superloc) -> impl Iterator<Item = &Edge> {
        self.predecessors
            .get(&sl)
            .into_iter()
            .flatten()
            .map(|i| &self.edges[*i])
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metrics {
    pub wall_time_ms: u128,
    pub expanded_functions: usize,
    pub covered_comm_ops: usize,
    pub covered_go_sites: usize,
    pub superlocations: usize,
    pub edges: usize,
}

pub struct Exploration {
    pub graph: SuperlocGraph,
    pub metrics: Metrics,
    /// The deadline elapsed before the fixpoint was reached.
    pub timed_out: bool,
}

/// Bookkeeping shared by the expansions of one run.
#[derive(Default)]
struct Coverage {
    functions: BTreeSet<FuncId>,
    comm_ops: BTreeSet<ValueId>,
    go_sites: BTreeSet<ValueId>,
}

impl<'a> AnalysisContext<'a> {
    /// Memory before the entry runs: globals at their zero values and the
    /// entry's parameters unknown.
    pub fn initial_state(&self, root: Goro) -> State {
        let types = &self.program.types;
        let mut memory = Memory::new();
        for global in self.program.globals() {
            let elem = types.elem(global.type_id).unwrap_or(0);
            let record = |_: &HeapLoc, zero: AbstractValue| self.primitive_record(global.id, zero);
            memory.alloc(types, HeapLoc::global(global.id), elem, &record);
        }
        let func = self.program.function(self.entry);
        for param in func.params.iter().chain(&func.free_vars) {
            memory.set_local(root, Context::root(), param.id, AbstractValue::Top);
        }
        State::new(memory)
    }

    /// Build the superlocation graph from the entry to a fixpoint.
    pub fn explore(&self) -> Result<Exploration, AnalysisError> {
        let started = Instant::now();
        let cfg = self.cfg();
        let nodes = cfg
            .function(self.entry)
            .ok_or(AnalysisError::MissingBody(self.entry))?;
        let root = Goro::root(self.entry);
        let mut coverage = Coverage::default();
        coverage.functions.insert(self.entry);

        let mut graph = SuperlocGraph::default();
        let mut visits: FxHashMap<Superloc, usize> = FxHashMap::default();
        let mut worklist: VecDeque<Superloc> = VecDeque::new();
        let mut queued: FxHashSet<Superloc> = FxHashSet::default();
        let mut seen_edges: FxHashSet<Edge> = FxHashSet::default();

        let start = CtrLoc::new(nodes.entry, Context::root(), false);
        let initial = vec![(Superloc::new(BTreeMap::new()), self.initial_state(root))];
        for (sl, state) in self.expand_moved(initial, root, start, &mut coverage) {
            graph.roots.push(sl);
            if self.merge(&mut graph, &mut visits, sl, state) && queued.insert(sl) {
                worklist.push_back(sl);
            }
        }

        let mut timed_out = false;
        loop {
            if self.past_deadline(started) {
                timed_out = true;
                graph.frontier = worklist.iter().copied().collect();
                break;
            }
            let popped = match self.options.order {
                WorklistOrder::Fifo => worklist.pop_front(),
                WorklistOrder::Lifo => worklist.pop_back(),
            };
            let Some(sl) = popped else {
                break;
            };
            queued.remove(&sl);
            let Some(state) = graph.states.get(&sl).cloned() else {
                continue;
            };
            trace!(superloc = ?sl, pending = worklist.len(), "pop");
            for step in self.transitions(sl, &state)? {
                for (to, next) in self.apply(sl, step.clone(), &mut coverage) {
                    let edge = Edge {
                        from: sl,
                        to,
                        transition: step.transition.clone(),
                    };
                    if seen_edges.insert(edge.clone()) {
                        graph.add_edge(edge);
                    }
                    if self.merge(&mut graph, &mut visits, to, next) && queued.insert(to) {
                        worklist.push_back(to);
                    }
                }
            }
        }

        for sl in graph.states.keys() {
            for (_, cl) in sl.iter() {
                let node = cfg.node(cl.node);
                if let Some(instr) = node.instr {
                    if cfg.comm(cl.node).is_some() {
                        coverage.comm_ops.insert(instr);
                    }
                    let is_go = node.kind == NodeKind::Ssa
                        && matches!(self.program.instruction(instr).map(|i| &i.op), Some(Op::Go { .. }));
                    if is_go {
                        coverage.go_sites.insert(instr);
                    }
                }
            }
        }
        let metrics = Metrics {
            wall_time_ms: started.elapsed().as_millis(),
            expanded_functions: coverage.functions.len(),
            covered_comm_ops: coverage.comm_ops.len(),
            covered_go_sites: coverage.go_sites.len(),
            superlocations: graph.states.len(),
            edges: graph.edges.len(),
        };
        debug!(
            superlocs = metrics.superlocations,
            edges = metrics.edges,
            timed_out,
            "superlocation graph built"
        );
        Ok(Exploration {
            graph,
            metrics,
            timed_out,
        })
    }

    fn past_deadline(&self, started: Instant) -> bool {
        match self.options.deadline {
            Some(deadline) if deadline > Duration::ZERO => started.elapsed() >= deadline,
            _ => false,
        }
    }

    /// Join `state` into the configuration at `sl`. Returns whether the
    /// stored state grew.
    fn merge(
        &self,
        graph: &mut SuperlocGraph,
        visits: &mut FxHashMap<Superloc, usize>,
        sl: Superloc,
        state: State,
    ) -> bool {
        let count = visits.entry(sl).or_insert(0);
        *count += 1;
        let merged = match graph.states.get(&sl) {
            None => state,
            Some(old) if *count > self.options.widening_threshold => old.widen(&old.join(&state)),
            Some(old) => old.join(&state),
        };
        if graph.states.get(&sl) == Some(&merged) {
            return false;
        }
        graph.states.insert(sl, merged);
        true
    }

    /// Successor configurations of a step: every moved goroutine runs to
    /// its next stop points, one after the other.
    fn apply(&self, sl: Superloc, step: Step, coverage: &mut Coverage) -> Vec<(Superloc, State)> {
        let mut base = sl;
        for (goro, to) in &step.moves {
            if to.is_none() {
                base = base.without(*goro);
            }
        }
        let mut configs = vec![(base, step.state)];
        for (goro, to) in step.moves {
            if let Some(cl) = to {
                configs = configs
                    .into_iter()
                    .flat_map(|(sl, state)| self.expand_moved(vec![(sl, state)], goro, cl, coverage))
                    .collect();
            }
        }
        configs
    }

    fn expand_moved(
        &self,
        configs: Vec<(Superloc, State)>,
        goro: Goro,
        start: CtrLoc,
        coverage: &mut Coverage,
    ) -> Vec<(Superloc, State)> {
        let mut out = vec![];
        for (sl, state) in configs {
            let expansion = self.expand(goro, start, state.clone());
            coverage.functions.extend(expansion.entered.iter().copied());
            if expansion.leaves.is_empty() {
                // Never synchronizes again: it runs on without affecting
                // anyone else.
                trace!(goro = ?goro, from = ?start, "no stop point reachable");
                out.push((sl.without(goro), state));
                continue;
            }
            for (cl, leaf) in expansion.leaves {
                out.push((sl.with(goro, cl), leaf));
            }
        }
        out
    }
}
