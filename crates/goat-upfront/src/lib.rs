//! Pre-analyses for the GOAT abstract interpreter.
//!
//! Program-wide facts are computed once per input. Entry facts (the call
//! DAG below an entry, primitive usage, written fields and goroutine
//! topology) are recomputed for every entry function and P-set.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use goat_cfg::ProgramCfg;
use goat_ir::call_graph::CallGraph;
use goat_ir::ir::ValueId;
use goat_ir::points_to::PointsTo;
use goat_ir::{FuncId, Program};

pub mod channel_names;
pub mod decompose;
pub mod primitives;
pub mod pset;
pub mod reflected;
pub mod topology;
pub mod written;

pub use channel_names::ChannelNames;
pub use decompose::CallDag;
pub use primitives::{Primitive, PrimitiveKind, Primitives};
pub use pset::{FragmentPolicy, PSet, PSetContext};
pub use topology::{FunctionUsage, GoroSpec, GoroTopology, Usage};
pub use written::{Writes, WrittenFields};

/// Call sites with at least this many callees are dropped from the graph
/// used for decomposition.
pub const DEFAULT_PRUNE_THRESHOLD: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpfrontOptions {
    /// `None` keeps every call edge.
    pub prune_threshold: Option<usize>,
}

impl Default for UpfrontOptions {
    fn default() -> Self {
        Self {
            prune_threshold: Some(DEFAULT_PRUNE_THRESHOLD),
        }
    }
}

/// Facts shared by every entry of one program.
#[derive(Debug)]
pub struct ProgramFacts {
    pub points_to: PointsTo,
    /// The complete call graph; the interpreter resolves calls with it.
    pub call_graph: CallGraph,
    /// The call graph used for SCCs and dominators.
    pub pruned: CallGraph,
    pub cfg: ProgramCfg,
    pub primitives: Primitives,
    pub channel_names: ChannelNames,
    pub reflected: BTreeSet<ValueId>,
}

impl ProgramFacts {
    pub fn compute(program: &Program, options: UpfrontOptions) -> Self {
        let points_to = PointsTo::compute(program);
        let call_graph = CallGraph::build(program, &points_to);
        let pruned = match options.prune_threshold {
            Some(threshold) => {
                warn!(threshold, "pruning large call sites; results may be unsound");
                call_graph.pruned(threshold)
            }
            None => call_graph.clone(),
        };
        let cfg = ProgramCfg::build(program);
        let primitives = Primitives::collect(program);
        let channel_names = ChannelNames::collect(program);
        let reflected = reflected::reflected_channels(program, &points_to, &primitives);
        debug!(
            primitives = primitives.len(),
            call_edges = call_graph.edge_count(),
            cfg_nodes = cfg.len(),
            "computed program facts"
        );
        Self {
            points_to,
            call_graph,
            pruned,
            cfg,
            primitives,
            channel_names,
            reflected,
        }
    }

    pub fn entry(&self, program: &Program, entry: FuncId) -> EntryFacts {
        EntryFacts::compute(program, self, entry)
    }
}

/// Facts about the part of the program reachable from one entry.
#[derive(Debug)]
pub struct EntryFacts {
    pub dag: CallDag,
    pub usage: Usage,
    pub written: WrittenFields,
    pub topology: GoroTopology,
}

impl EntryFacts {
    pub fn compute(program: &Program, facts: &ProgramFacts, entry: FuncId) -> Self {
        let dag = CallDag::compute(&facts.pruned, entry);
        let usage = Usage::compute(
            program,
            &facts.points_to,
            &facts.primitives,
            dag.graph(),
            entry,
        );
        let written = WrittenFields::compute(program, &facts.points_to, dag.graph());
        let topology = GoroTopology::compute(&facts.pruned, entry);
        Self {
            dag,
            usage,
            written,
            topology,
        }
    }

    /// Split the primitives used under this entry into P-sets.
    pub fn psets(
        &self,
        program: &Program,
        facts: &ProgramFacts,
        policy: FragmentPolicy,
    ) -> Vec<PSet> {
        PSetContext {
            program,
            cfg: &facts.cfg,
            points_to: &facts.points_to,
            primitives: &facts.primitives,
            usage: &self.usage,
            dag: &self.dag,
            reflected: &facts.reflected,
        }
        .compute(policy)
    }
}
