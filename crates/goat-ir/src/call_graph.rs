//! Call graph over the functions of a [`Program`].
//!
//! Edges come from statically named callees, from closures a function value
//! may point to, and from the call edges resolved by the input's pointer
//! analysis. `go` and `defer` sites are call sites too.

use std::collections::{BTreeSet, VecDeque};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::graph::Graph;
use crate::ir::{Callee, CallCommon, ConstValue, Label, Op, ValueId};
use crate::points_to::PointsTo;
use crate::program::{FuncId, Program};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Call,
    Go,
    Defer,
}

#[derive(Debug, Clone)]
pub struct CallSite {
    pub site: ValueId,
    pub caller: FuncId,
    pub kind: CallKind,
    pub callees: Vec<FuncId>,
}

/// Indexed call graph
#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    sites: FxHashMap<ValueId, CallSite>,
    /// Call sites per caller, in instruction order.
    sites_in: FxHashMap<FuncId, Vec<ValueId>>,
    callers: FxHashMap<FuncId, Vec<(FuncId, ValueId)>>,
}

/// Callees the input resolved for each call site.
pub fn input_edges_by_site(program: &Program) -> FxHashMap<ValueId, Vec<FuncId>> {
    let mut out: FxHashMap<ValueId, Vec<FuncId>> = FxHashMap::default();
    for edge in program.call_edges() {
        let (Some(site), Some(callee)) = (edge.site, program.func_id(&edge.callee)) else {
            continue;
        };
        let callees = out.entry(site).or_default();
        if !callees.contains(&callee) {
            callees.push(callee);
        }
    }
    out
}

/// Functions a function value may denote: closures it points to, or the
/// closure/function constant defining it directly.
pub fn closure_targets(program: &Program, value: ValueId, labels: &BTreeSet<Label>) -> Vec<FuncId> {
    let direct = std::iter::once(value);
    let pointed = labels.iter().filter(|l| l.path.is_empty()).map(|l| l.site);
    let mut out: Vec<FuncId> = direct
        .chain(pointed)
        .filter_map(|site| function_at_site(program, site))
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

fn function_at_site(program: &Program, site: ValueId) -> Option<FuncId> {
    if let Some(instr) = program.instruction(site) {
        return match &instr.op {
            Op::MakeClosure { func, .. } => program.func_id(func),
            _ => None,
        };
    }
    match program.constant(site).map(|c| &c.value) {
        Some(ConstValue::Func(name)) => program.func_id(name),
        _ => None,
    }
}

/// Resolve the callees of a call site.
pub fn resolve_callees(
    program: &Program,
    points_to: &PointsTo,
    input_edges: &FxHashMap<ValueId, Vec<FuncId>>,
    site: ValueId,
    call: &CallCommon,
) -> Vec<FuncId> {
    let mut out: Vec<FuncId> = input_edges.get(&site).cloned().unwrap_or_default();
    match &call.callee {
        Callee::Static { func } => out.extend(program.func_id(func)),
        Callee::Dynamic { value } => {
            out.extend(closure_targets(program, *value, points_to.labels(*value)))
        }
        Callee::Invoke { .. } | Callee::Builtin { .. } => {}
    }
    out.sort_unstable();
    out.dedup();
    out
}

impl CallGraph {
    pub fn build(program: &Program, points_to: &PointsTo) -> Self {
        let input_edges = input_edges_by_site(program);
        let mut cg = CallGraph::default();
        for (caller, func) in program.functions() {
            for instr in func.instructions() {
                let (call, kind) = match &instr.op {
                    Op::Call { call } => (call, CallKind::Call),
                    Op::Go { call } => (call, CallKind::Go),
                    Op::Defer { call } => (call, CallKind::Defer),
                    _ => continue,
                };
                let callees = resolve_callees(program, points_to, &input_edges, instr.id, call);
                cg.add_site(CallSite {
                    site: instr.id,
                    caller,
                    kind,
                    callees,
                });
            }
        }
        cg
    }

    fn add_site(&mut self, site: CallSite) {
        for &callee in &site.callees {
            self.callers
                .entry(callee)
                .or_default()
                .push((site.caller, site.site));
        }
        self.sites_in.entry(site.caller).or_default().push(site.site);
        self.sites.insert(site.site, site);
    }

    /// View without the callees of sites resolving to `threshold` or more
    /// functions.
    pub fn pruned(&self, threshold: usize) -> Self {
        let mut cg = CallGraph::default();
        for (caller, sites) in &self.sites_in {
            for site in sites {
                let mut s = self.sites[site].clone();
                debug_assert_eq!(s.caller, *caller);
                if s.callees.len() >= threshold {
                    s.callees.clear();
                }
                cg.add_site(s);
            }
        }
        cg
    }

    pub fn site(&self, site: ValueId) -> Option<&CallSite> {
        self.sites.get(&site)
    }

    pub fn callees_at(&self, site: ValueId) -> &[FuncId] {
        self.sites
            .get(&site)
            .map(|s| s.callees.as_slice())
            .unwrap_or(&[])
    }

    /// Call sites in `func`, in instruction order.
    pub fn sites_in(&self, func: FuncId) -> impl Iterator<Item = &CallSite> {
        self.sites_in
            .get(&func)
            .into_iter()
            .flatten()
            .filter_map(|s| self.sites.get(s))
    }

    /// Distinct callees of `func`, in first-call order.
    pub fn callees_of(&self, func: FuncId) -> Vec<FuncId> {
        let mut seen = FxHashSet::default();
        self.sites_in(func)
            .flat_map(|s| s.callees.iter().copied())
            .filter(|c| seen.insert(*c))
            .collect()
    }

    /// `(caller, site)` pairs calling `func`.
    pub fn calls_to(&self, func: FuncId) -> &[(FuncId, ValueId)] {
        self.callers.get(&func).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn has_callers(&self, func: FuncId) -> bool {
        !self.calls_to(func).is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.sites.values().map(|s| s.callees.len()).sum()
    }

    /// Function graph reachable from `roots`.
    pub fn graph(&self, roots: impl IntoIterator<Item = FuncId>) -> Graph<FuncId> {
        Graph::from_roots(roots, |f| self.callees_of(f))
    }

    /// All functions transitively reachable from `func`, excluding itself
    /// unless it is recursive.
    pub fn transitive_callees(&self, func: FuncId) -> FxHashSet<FuncId> {
        let mut visited = FxHashSet::default();
        let mut queue = VecDeque::from(self.callees_of(func));
        while let Some(f) = queue.pop_front() {
            if visited.insert(f) {
                queue.extend(self.callees_of(f));
            }
        }
        visited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{ProgramBuilder, T_INT};

    fn program() -> (Program, ValueId) {
        let mut b = ProgramBuilder::new();
        b.func("pkg.find", &[], |f| f.ret(&[]));
        b.func("pkg.save", &[], |f| {
            f.call("pkg.find", &[], T_INT);
            f.ret(&[]);
        });
        b.closure("pkg.main$1", &[], &[], |f| f.ret(&[]));
        let mut dynamic = 0;
        b.func("pkg.main", &[], |f| {
            f.call("pkg.find", &[], T_INT);
            f.go("pkg.save", &[]);
            let c = f.make_closure("pkg.main$1", &[]);
            dynamic = f.call_value(c, &[], T_INT);
            f.ret(&[]);
        });
        (b.build(), dynamic)
    }

    #[test]
    fn test_calls_and_callers() {
        let (p, dynamic) = program();
        let pts = PointsTo::estimate(&p);
        let cg = CallGraph::build(&p, &pts);
        let main = p.func_id("pkg.main").unwrap();
        let find = p.func_id("pkg.find").unwrap();
        let save = p.func_id("pkg.save").unwrap();
        let lit = p.func_id("pkg.main$1").unwrap();

        assert_eq!(cg.callees_of(main), vec![find, save, lit]);
        assert_eq!(cg.callees_at(dynamic), &[lit]);
        assert_eq!(cg.calls_to(find).len(), 2);
        assert!(!cg.has_callers(main));
        assert_eq!(cg.edge_count(), 4);
        assert_eq!(
            cg.sites_in(main).map(|s| s.kind).collect::<Vec<_>>(),
            vec![CallKind::Call, CallKind::Go, CallKind::Call]
        );

        let reachable = cg.transitive_callees(main);
        assert!(reachable.contains(&find) && reachable.contains(&lit));
        assert!(!reachable.contains(&main));
    }

    #[test]
    fn test_pruning_drops_wide_sites() {
        let (p, dynamic) = program();
        let pts = PointsTo::estimate(&p);
        let cg = CallGraph::build(&p, &pts).pruned(1);
        assert!(cg.callees_at(dynamic).is_empty());
        assert_eq!(cg.edge_count(), 0);
        assert!(cg.site(dynamic).is_some());
    }

    /// An interface call in `pkg.main` with `n` implementations.
    fn wide_invoke(n: usize) -> (Program, ValueId) {
        let mut b = ProgramBuilder::new();
        for i in 0..n {
            b.func(&format!("pkg.impl{i}"), &[], |f| f.ret(&[]));
        }
        let mut site = 0;
        b.func("pkg.main", &[("x", T_INT)], |f| {
            let x = f.param(0);
            site = f.invoke(x, "Run", &[], T_INT);
            f.ret(&[]);
        });
        for i in 0..n {
            b.call_edge("pkg.main", &format!("pkg.impl{i}"), site);
        }
        (b.build(), site)
    }

    #[test]
    fn test_pruning_threshold_is_inclusive() {
        let (p, site) = wide_invoke(9);
        let cg = CallGraph::build(&p, &PointsTo::default());
        assert_eq!(cg.pruned(10).callees_at(site).len(), 9);
        assert_eq!(cg.pruned(10).edge_count(), 9);

        let (p, site) = wide_invoke(10);
        let cg = CallGraph::build(&p, &PointsTo::default());
        assert_eq!(cg.callees_at(site).len(), 10);
        let pruned = cg.pruned(10);
        assert!(pruned.callees_at(site).is_empty());
        assert_eq!(pruned.edge_count(), 0);
        assert!(pruned.site(site).is_some());
    }

    #[test]
    fn test_input_edges_resolve_invokes() {
        let mut b = ProgramBuilder::new();
        b.func("pkg.impl", &[], |f| f.ret(&[]));
        let mut site = 0;
        b.func("pkg.main", &[("x", T_INT)], |f| {
            let x = f.param(0);
            site = f.invoke(x, "Run", &[], T_INT);
            f.ret(&[]);
        });
        b.call_edge("pkg.main", "pkg.impl", site);
        let p = b.build();
        let cg = CallGraph::build(&p, &PointsTo::default());
        assert_eq!(cg.callees_at(site), &[p.func_id("pkg.impl").unwrap()]);
    }
}
