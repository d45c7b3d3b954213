//! Goroutine topology: which primitives each function touches and which
//! goroutines each goroutine may spawn.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use goat_cfg::comm::{classify_op, Comm};
use goat_ir::call_graph::{CallGraph, CallKind};
use goat_ir::cfg::Cfg;
use goat_ir::graph::Graph;
use goat_ir::ir::{Op, ValueId};
use goat_ir::points_to::PointsTo;
use goat_ir::{FuncId, Program};

use crate::primitives::Primitives;

/// Primitives a single function touches.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FunctionUsage {
    /// Channels allocated here.
    pub created: BTreeSet<ValueId>,
    /// Channels sent on, received from, closed or selected on.
    pub chans: BTreeSet<ValueId>,
    /// Channels returned to the caller.
    pub out_chans: BTreeSet<ValueId>,
    /// Sync primitives locked, waited on or signalled.
    pub sync: BTreeSet<ValueId>,
}

impl FunctionUsage {
    pub fn uses(&self, prim: ValueId) -> bool {
        self.chans.contains(&prim) || self.sync.contains(&prim)
    }

    pub fn used(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.chans.iter().chain(self.sync.iter()).copied()
    }
}

/// Per-function usage for every function reachable from an entry.
#[derive(Debug, Clone, Default)]
pub struct Usage {
    functions: BTreeMap<FuncId, FunctionUsage>,
}

impl Usage {
    pub fn compute(
        program: &Program,
        points_to: &PointsTo,
        primitives: &Primitives,
        graph: &Graph<FuncId>,
        entry: FuncId,
    ) -> Self {
        let mut functions = BTreeMap::new();
        for func in graph.reachable(entry) {
            functions.insert(func, Self::process(program, points_to, primitives, func));
        }
        debug!(functions = functions.len(), "computed primitive usage");
        Self { functions }
    }

    fn process(
        program: &Program,
        points_to: &PointsTo,
        primitives: &Primitives,
        id: FuncId,
    ) -> FunctionUsage {
        let mut usage = FunctionUsage::default();
        let func = program.function(id);
        // Functions without blocks are opaque; assume they use nothing.
        if !func.has_body() {
            return usage;
        }
        let prims = |v: ValueId| primitives.of_value(points_to, v);
        let cfg = Cfg::from_function(func);
        for block in cfg.bfs_order() {
            let Some(block) = cfg.block(block) else {
                continue;
            };
            for instr in &block.instructions {
                if let Op::MakeChan { .. } = instr.op {
                    usage.created.extend(prims(instr.id));
                }
                if let Op::Return { results } = &instr.op {
                    for &r in results {
                        if program.types.is_chan(program.value_type(r)) {
                            usage.out_chans.extend(prims(r));
                        }
                    }
                }
                match classify_op(&instr.op, program) {
                    Some(Comm::Sync(call)) => usage.sync.extend(prims(call.receiver)),
                    Some(comm) => {
                        for chan in comm.operands() {
                            usage.chans.extend(prims(chan));
                        }
                    }
                    None => {}
                }
            }
        }
        usage
    }

    pub fn get(&self, func: FuncId) -> Option<&FunctionUsage> {
        self.functions.get(&func)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FuncId, &FunctionUsage)> {
        self.functions.iter().map(|(f, u)| (*f, u))
    }

    /// Functions using each primitive.
    pub fn primitive_uses(&self) -> BTreeMap<ValueId, BTreeSet<FuncId>> {
        let mut out: BTreeMap<ValueId, BTreeSet<FuncId>> = BTreeMap::new();
        for (func, usage) in self.iter() {
            for prim in usage.used() {
                out.entry(prim).or_default().insert(func);
            }
        }
        out
    }

    pub fn used_channels(&self) -> BTreeSet<ValueId> {
        self.functions
            .values()
            .flat_map(|u| u.chans.iter().chain(u.out_chans.iter()).copied())
            .collect()
    }
}

/// A goroutine body: the functions it may run without spawning.
#[derive(Debug, Clone, Serialize)]
pub struct GoroSpec {
    pub entry: FuncId,
    pub functions: BTreeSet<FuncId>,
    /// `go` sites reachable in this goroutine and their possible bodies.
    pub spawns: Vec<(ValueId, Vec<FuncId>)>,
}

#[derive(Debug, Clone, Default)]
pub struct GoroTopology {
    goros: Vec<GoroSpec>,
}

impl GoroTopology {
    pub fn compute(call_graph: &CallGraph, root: FuncId) -> Self {
        let mut goros: Vec<GoroSpec> = vec![];
        let mut seen = BTreeSet::from([root]);
        let mut queue = vec![root];
        while let Some(entry) = queue.pop() {
            let mut functions = BTreeSet::from([entry]);
            let mut spawns = vec![];
            let mut stack = vec![entry];
            while let Some(f) = stack.pop() {
                for site in call_graph.sites_in(f) {
                    if site.kind == CallKind::Go {
                        spawns.push((site.site, site.callees.clone()));
                        for &callee in &site.callees {
                            if seen.insert(callee) {
                                queue.push(callee);
                            }
                        }
                        continue;
                    }
                    for &callee in &site.callees {
                        if functions.insert(callee) {
                            stack.push(callee);
                        }
                    }
                }
            }
            goros.push(GoroSpec {
                entry,
                functions,
                spawns,
            });
        }
        goros.sort_by_key(|g| g.entry);
        Self { goros }
    }

    pub fn goroutines(&self) -> &[GoroSpec] {
        &self.goros
    }

    pub fn get(&self, entry: FuncId) -> Option<&GoroSpec> {
        self.goros.iter().find(|g| g.entry == entry)
    }

    /// Goroutine bodies that may transitively spawn themselves.
    pub fn spawn_cycles(&self) -> Vec<Vec<FuncId>> {
        let graph = Graph::from_nodes(self.goros.iter().map(|g| g.entry), |entry| {
            self.get(entry)
                .map(|g| g.spawns.iter().flat_map(|(_, c)| c.iter().copied()).collect())
                .unwrap_or_default()
        });
        let sccs = graph.scc();
        (0..sccs.len())
            .filter(|&c| sccs.is_recursive(c))
            .map(|c| {
                let mut members = sccs.components()[c].clone();
                members.sort_unstable();
                members
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goat_ir::builder::{ProgramBuilder, T_CHAN_INT, T_UNIT};

    #[test]
    fn test_usage_records_channel_and_sync_operations() {
        let mut b = ProgramBuilder::new();
        let (mut ch, mut mu) = (0, 0);
        b.func("main.worker", &[("c", T_CHAN_INT)], |f| {
            let c = f.param(0);
            let one = f.int(1);
            f.send(c, one);
            f.ret(&[]);
        });
        b.func("main.main", &[], |f| {
            ch = f.make_chan(0);
            mu = f.new_mutex();
            f.lock(mu);
            f.go("main.worker", &[ch]);
            f.recv(ch);
            f.unlock(mu);
            f.ret(&[]);
        });
        let p = b.build();
        let pts = PointsTo::estimate(&p);
        let prims = Primitives::collect(&p);
        let cg = CallGraph::build(&p, &pts);
        let main = p.func_id("main.main").unwrap();
        let worker = p.func_id("main.worker").unwrap();
        let usage = Usage::compute(&p, &pts, &prims, &cg.graph([main]), main);

        let m = usage.get(main).unwrap();
        assert!(m.created.contains(&ch));
        assert!(m.chans.contains(&ch));
        assert!(m.sync.contains(&mu));
        assert!(usage.get(worker).unwrap().uses(ch));
        let uses = usage.primitive_uses();
        assert_eq!(uses[&ch], BTreeSet::from([main, worker]));
        assert_eq!(usage.used_channels(), BTreeSet::from([ch]));
    }

    #[test]
    fn test_topology_separates_goroutines() {
        let mut b = ProgramBuilder::new();
        b.func("main.helper", &[], |f| f.ret(&[]));
        b.func("main.loop", &[], |f| {
            f.call("main.helper", &[], T_UNIT);
            f.go("main.loop", &[]);
            f.ret(&[]);
        });
        b.func("main.main", &[], |f| {
            f.go("main.loop", &[]);
            f.ret(&[]);
        });
        let p = b.build();
        let cg = CallGraph::build(&p, &PointsTo::estimate(&p));
        let main = p.func_id("main.main").unwrap();
        let lp = p.func_id("main.loop").unwrap();
        let helper = p.func_id("main.helper").unwrap();
        let topo = GoroTopology::compute(&cg, main);

        assert_eq!(topo.goroutines().len(), 2);
        let spec = topo.get(lp).unwrap();
        assert!(spec.functions.contains(&helper));
        assert_eq!(spec.spawns.len(), 1);
        assert_eq!(topo.get(main).unwrap().functions, BTreeSet::from([main]));
        assert_eq!(topo.spawn_cycles(), vec![vec![lp]]);
    }
}
