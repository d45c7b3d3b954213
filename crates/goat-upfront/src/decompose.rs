//! Call-graph decomposition rooted at an entry function.

use std::collections::BTreeSet;

use tracing::debug;

use goat_ir::call_graph::CallGraph;
use goat_ir::graph::{DominatorTree, Graph, Sccs};
use goat_ir::FuncId;

/// The call graph reachable from one entry, its SCC condensation and its
/// dominator tree.
#[derive(Debug, Clone)]
pub struct CallDag {
    root: FuncId,
    graph: Graph<FuncId>,
    sccs: Sccs<FuncId>,
    dominators: DominatorTree<FuncId>,
}

impl CallDag {
    pub fn compute(call_graph: &CallGraph, root: FuncId) -> Self {
        let graph = call_graph.graph([root]);
        let sccs = graph.scc();
        let dominators = graph.dominators(root);
        debug!(
            functions = graph.node_count(),
            components = sccs.len(),
            "decomposed call graph"
        );
        Self {
            root,
            graph,
            sccs,
            dominators,
        }
    }

    pub fn root(&self) -> FuncId {
        self.root
    }

    pub fn graph(&self) -> &Graph<FuncId> {
        &self.graph
    }

    pub fn sccs(&self) -> &Sccs<FuncId> {
        &self.sccs
    }

    pub fn dominators(&self) -> &DominatorTree<FuncId> {
        &self.dominators
    }

    pub fn contains(&self, func: FuncId) -> bool {
        self.graph.contains(func)
    }

    pub fn component_of(&self, func: FuncId) -> Option<usize> {
        self.sccs.component_of(func)
    }

    /// Whether `func` sits on a call-graph cycle.
    pub fn is_recursive(&self, func: FuncId) -> bool {
        self.component_of(func)
            .is_some_and(|c| self.sccs.is_recursive(c))
    }

    /// Least common dominator of `funcs`, ignoring functions outside the
    /// graph.
    pub fn lcd(&self, funcs: impl IntoIterator<Item = FuncId>) -> Option<FuncId> {
        self.dominators.lcd(funcs)
    }

    pub fn functions(&self) -> BTreeSet<FuncId> {
        self.graph.nodes().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goat_ir::builder::{ProgramBuilder, T_UNIT};
    use goat_ir::points_to::PointsTo;

    #[test]
    fn test_dag_components_and_dominators() {
        let mut b = ProgramBuilder::new();
        b.func("main.leaf", &[], |f| f.ret(&[]));
        b.func("main.even", &[], |f| {
            f.call("main.odd", &[], T_UNIT);
            f.call("main.leaf", &[], T_UNIT);
            f.ret(&[]);
        });
        b.func("main.odd", &[], |f| {
            f.call("main.even", &[], T_UNIT);
            f.ret(&[]);
        });
        b.func("main.side", &[], |f| {
            f.call("main.leaf", &[], T_UNIT);
            f.ret(&[]);
        });
        b.func("main.main", &[], |f| {
            f.call("main.even", &[], T_UNIT);
            f.call("main.side", &[], T_UNIT);
            f.ret(&[]);
        });
        b.func("main.unused", &[], |f| f.ret(&[]));
        let p = b.build();
        let cg = CallGraph::build(&p, &PointsTo::estimate(&p));
        let id = |n: &str| p.func_id(n).unwrap();
        let dag = CallDag::compute(&cg, id("main.main"));

        assert!(!dag.contains(id("main.unused")));
        assert!(dag.is_recursive(id("main.even")));
        assert!(!dag.is_recursive(id("main.leaf")));
        assert_eq!(
            dag.component_of(id("main.even")),
            dag.component_of(id("main.odd"))
        );
        // Callees come before callers.
        assert!(dag.component_of(id("main.leaf")) < dag.component_of(id("main.even")));
        assert_eq!(dag.lcd([id("main.leaf")]), Some(id("main.leaf")));
        assert_eq!(
            dag.lcd([id("main.odd"), id("main.side")]),
            Some(id("main.main"))
        );
        assert_eq!(dag.functions().len(), 5);
    }
}
