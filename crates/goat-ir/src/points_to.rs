//! Points-to labels per SSA value.
//!
//! The input normally carries the result of a whole-program pointer
//! analysis. When it does not, a flow-insensitive, field-sensitive
//! inclusion-based estimate is computed from the SSA itself.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::call_graph::{closure_targets, input_edges_by_site};
use crate::ir::{Callee, CallCommon, ConstValue, Label, Op, PathElem, UnaryOp, ValueId};
use crate::models::Model;
use crate::program::{FuncId, Program};

/// Access paths longer than this are collapsed onto their prefix.
pub const MAX_PATH_LEN: usize = 4;

static NO_LABELS: BTreeSet<Label> = BTreeSet::new();

#[derive(Debug, Clone, Default)]
pub struct PointsTo {
    labels: FxHashMap<ValueId, BTreeSet<Label>>,
    estimated: bool,
}

impl PointsTo {
    /// Use the input's points-to entries, or estimate them when absent.
    pub fn compute(program: &Program) -> Self {
        if program.points_to_entries().is_empty() {
            warn!("input carries no points-to result; estimating it from the SSA");
            Self::estimate(program)
        } else {
            Self::from_entries(program)
        }
    }

    pub fn from_entries(program: &Program) -> Self {
        let mut labels: FxHashMap<ValueId, BTreeSet<Label>> = FxHashMap::default();
        for entry in program.points_to_entries() {
            labels
                .entry(entry.value)
                .or_default()
                .extend(entry.labels.iter().cloned());
        }
        Self {
            labels,
            estimated: false,
        }
    }

    pub fn estimate(program: &Program) -> Self {
        let mut estimator = Estimator::new(program);
        estimator.run();
        Self {
            labels: estimator.pts,
            estimated: true,
        }
    }

    pub fn is_estimated(&self) -> bool {
        self.estimated
    }

    pub fn labels(&self, value: ValueId) -> &BTreeSet<Label> {
        self.labels.get(&value).unwrap_or(&NO_LABELS)
    }

    /// Allocation sites `value` may point into.
    pub fn sites(&self, value: ValueId) -> BTreeSet<ValueId> {
        self.labels(value).iter().map(|l| l.site).collect()
    }

    pub fn may_alias(&self, a: ValueId, b: ValueId) -> bool {
        let lb = self.labels(b);
        self.labels(a).iter().any(|l| lb.contains(l))
    }
}

fn extend_capped(label: &Label, elem: &PathElem) -> Label {
    if label.path.len() >= MAX_PATH_LEN {
        label.clone()
    } else {
        label.extend(elem.clone())
    }
}

struct Estimator<'p> {
    program: &'p Program,
    pts: FxHashMap<ValueId, BTreeSet<Label>>,
    heap: FxHashMap<Label, BTreeSet<Label>>,
    returns: FxHashMap<FuncId, BTreeSet<Label>>,
    input_edges: FxHashMap<ValueId, Vec<FuncId>>,
    changed: bool,
}

impl<'p> Estimator<'p> {
    fn new(program: &'p Program) -> Self {
        Self {
            program,
            pts: FxHashMap::default(),
            heap: FxHashMap::default(),
            returns: FxHashMap::default(),
            input_edges: input_edges_by_site(program),
            changed: false,
        }
    }

    fn run(&mut self) {
        let program = self.program;
        for g in program.globals() {
            self.add(g.id, BTreeSet::from([Label::new(g.id)]));
        }
        // Function constants are their own closure sites.
        let mut funcs = vec![];
        for (_, f) in program.functions() {
            for instr in f.instructions() {
                for operand in instr.op.operands() {
                    if let Some(ConstValue::Func(_)) = program.constant(operand).map(|c| &c.value) {
                        funcs.push(operand);
                    }
                }
            }
        }
        for c in funcs {
            self.add(c, BTreeSet::from([Label::new(c)]));
        }

        let mut rounds = 0;
        loop {
            self.changed = false;
            rounds += 1;
            for (func_id, func) in program.functions() {
                for instr in func.instructions() {
                    self.visit(func_id, instr.id, &instr.op);
                }
            }
            if !self.changed {
                break;
            }
        }
        debug!(rounds, values = self.pts.len(), "points-to estimate converged");
    }

    fn get(&self, v: ValueId) -> BTreeSet<Label> {
        self.pts.get(&v).cloned().unwrap_or_default()
    }

    fn add(&mut self, v: ValueId, labels: BTreeSet<Label>) {
        if labels.is_empty() {
            return;
        }
        let entry = self.pts.entry(v).or_default();
        let before = entry.len();
        entry.extend(labels);
        self.changed |= entry.len() != before;
    }

    fn load(&self, v: ValueId, elem: Option<&PathElem>) -> BTreeSet<Label> {
        let mut out = BTreeSet::new();
        for l in self.pts.get(&v).into_iter().flatten() {
            let cell = match elem {
                Some(e) => extend_capped(l, e),
                None => l.clone(),
            };
            if let Some(contents) = self.heap.get(&cell) {
                out.extend(contents.iter().cloned());
            }
        }
        out
    }

    fn store(&mut self, v: ValueId, elem: Option<&PathElem>, labels: BTreeSet<Label>) {
        if labels.is_empty() {
            return;
        }
        let cells: Vec<Label> = self
            .pts
            .get(&v)
            .into_iter()
            .flatten()
            .map(|l| match elem {
                Some(e) => extend_capped(l, e),
                None => l.clone(),
            })
            .collect();
        for cell in cells {
            let entry = self.heap.entry(cell).or_default();
            let before = entry.len();
            entry.extend(labels.iter().cloned());
            self.changed |= entry.len() != before;
        }
    }

    fn add_heap(&mut self, cell: Label, labels: BTreeSet<Label>) {
        let entry = self.heap.entry(cell).or_default();
        let before = entry.len();
        entry.extend(labels);
        self.changed |= entry.len() != before;
    }

    fn project(&mut self, dst: ValueId, src: ValueId, elem: PathElem) {
        let labels = self.get(src).iter().map(|l| extend_capped(l, &elem)).collect();
        self.add(dst, labels);
    }

    /// Operand defined by `*y`, if any.
    fn deref_source(&self, x: ValueId) -> Option<ValueId> {
        match self.program.instruction(x).map(|i| &i.op) {
            Some(Op::UnOp {
                operator: UnaryOp::Deref,
                x: y,
                ..
            }) => Some(*y),
            _ => None,
        }
    }

    fn visit(&mut self, func: FuncId, id: ValueId, op: &Op) {
        match op {
            Op::Alloc { .. } | Op::MakeChan { .. } | Op::MakeMap | Op::MakeSlice { .. } => {
                self.add(id, BTreeSet::from([Label::new(id)]));
            }
            Op::MakeClosure { func: name, bindings } => {
                self.add(id, BTreeSet::from([Label::new(id)]));
                if let Some(target) = self.program.func_id(name) {
                    let free_vars: Vec<ValueId> = self
                        .program
                        .function(target)
                        .free_vars
                        .iter()
                        .map(|p| p.id)
                        .collect();
                    for (fv, b) in free_vars.into_iter().zip(bindings) {
                        let labels = self.get(*b);
                        self.add(fv, labels);
                    }
                }
            }
            Op::MakeInterface { x }
            | Op::Convert { x }
            | Op::ChangeType { x }
            | Op::ChangeInterface { x }
            | Op::Slice { x }
            | Op::TypeAssert { x, .. }
            | Op::Range { x } => {
                let labels = self.get(*x);
                self.add(id, labels);
            }
            Op::Extract { tuple, .. } => {
                let labels = self.get(*tuple);
                self.add(id, labels);
            }
            Op::Phi { edges } => {
                for e in edges {
                    let labels = self.get(e.value);
                    self.add(id, labels);
                }
            }
            Op::FieldAddr { x, field } => self.project(id, *x, PathElem::Field(field.clone())),
            Op::IndexAddr { x, .. } => self.project(id, *x, PathElem::ArrayElem),
            Op::Field { x, field } => {
                let labels = match self.deref_source(*x) {
                    Some(y) => self.load(y, Some(&PathElem::Field(field.clone()))),
                    None => self.get(*x),
                };
                self.add(id, labels);
            }
            Op::Index { x, .. } => {
                let labels = match self.deref_source(*x) {
                    Some(y) => self.load(y, Some(&PathElem::ArrayElem)),
                    None => self.get(*x),
                };
                self.add(id, labels);
            }
            Op::Lookup { x, .. } | Op::Next { iter: x } => {
                let labels = self.load(*x, Some(&PathElem::ArrayElem));
                self.add(id, labels);
            }
            Op::UnOp { operator, x, .. } => {
                let labels = match operator {
                    UnaryOp::Deref => self.load(*x, None),
                    UnaryOp::Recv => self.load(*x, Some(&PathElem::ArrayElem)),
                    _ => BTreeSet::new(),
                };
                self.add(id, labels);
            }
            Op::Store { addr, val } => {
                let labels = self.get(*val);
                self.store(*addr, None, labels);
            }
            Op::MapUpdate { map, val, .. } => {
                let labels = self.get(*val);
                self.store(*map, Some(&PathElem::ArrayElem), labels);
            }
            Op::Send { chan, x } => {
                let labels = self.get(*x);
                self.store(*chan, Some(&PathElem::ArrayElem), labels);
            }
            Op::Select { states, .. } => {
                for s in states {
                    match s.send {
                        Some(x) => {
                            let labels = self.get(x);
                            self.store(s.chan, Some(&PathElem::ArrayElem), labels);
                        }
                        None => {
                            let labels = self.load(s.chan, Some(&PathElem::ArrayElem));
                            self.add(id, labels);
                        }
                    }
                }
            }
            Op::Call { call } => match Model::of_call(call) {
                Some(Model::NewCond) => {
                    let cond = Label::new(id);
                    self.add(id, BTreeSet::from([cond.clone()]));
                    if let Some(&locker) = call.args.first() {
                        let labels = self.get(locker);
                        self.add_heap(cond.extend(PathElem::Field("L".into())), labels);
                    }
                }
                Some(model) if model.allocates() => {
                    let obj = Label::new(id);
                    self.add(id, BTreeSet::from([obj.clone()]));
                    if model.chan_in_field() {
                        let chan = obj.extend(PathElem::ArrayElem);
                        self.add_heap(obj.extend(PathElem::Field("C".into())), BTreeSet::from([chan]));
                    }
                }
                Some(Model::RLocker) => {
                    let labels = call.args.first().map(|rw| self.get(*rw)).unwrap_or_default();
                    self.add(id, labels);
                }
                Some(Model::AtomicStore) => {
                    if let [recv, val] = call.args[..] {
                        let labels = self.get(val);
                        self.store(recv, None, labels);
                    }
                }
                Some(Model::AtomicLoad) => {
                    if let Some(&recv) = call.args.first() {
                        let labels = self.load(recv, None);
                        self.add(id, labels);
                    }
                }
                _ => self.bind_call(id, call, true),
            },
            Op::Go { call } | Op::Defer { call } => self.bind_call(id, call, false),
            Op::Return { results } => {
                let mut labels = BTreeSet::new();
                for r in results {
                    labels.extend(self.get(*r));
                }
                if !labels.is_empty() {
                    let entry = self.returns.entry(func).or_default();
                    let before = entry.len();
                    entry.extend(labels);
                    self.changed |= entry.len() != before;
                }
            }
            _ => {}
        }
    }

    fn callees(&self, site: ValueId, call: &CallCommon) -> Vec<FuncId> {
        let mut out: Vec<FuncId> = self.input_edges.get(&site).cloned().unwrap_or_default();
        match &call.callee {
            Callee::Static { func } => out.extend(self.program.func_id(func)),
            Callee::Dynamic { value } => {
                let labels = self.pts.get(value).cloned().unwrap_or_default();
                out.extend(closure_targets(self.program, *value, &labels));
            }
            Callee::Invoke { .. } | Callee::Builtin { .. } => {}
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    fn bind_call(&mut self, site: ValueId, call: &CallCommon, has_result: bool) {
        let actuals = call.actuals();
        for callee in self.callees(site, call) {
            let params: Vec<ValueId> = self
                .program
                .function(callee)
                .params
                .iter()
                .map(|p| p.id)
                .collect();
            for (param, actual) in params.into_iter().zip(&actuals) {
                let labels = self.get(*actual);
                self.add(param, labels);
            }
            if has_result {
                let labels = self.returns.get(&callee).cloned().unwrap_or_default();
                self.add(site, labels);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{ProgramBuilder, T_INT};

    #[test]
    fn test_channel_flows_through_call_and_closure() {
        let mut b = ProgramBuilder::new();
        b.func("main.worker", &[("ch", crate::builder::T_CHAN_INT)], |f| {
            let ch = f.param(0);
            f.recv(ch);
            f.ret(&[]);
        });
        b.closure("main.main$1", &[], &[("ch", crate::builder::T_CHAN_INT)], |f| {
            let ch = f.free_var(0);
            let one = f.int(1);
            f.send(ch, one);
            f.ret(&[]);
        });
        let (mut chan, mut closure) = (0, 0);
        b.func("main.main", &[], |f| {
            chan = f.make_chan(0);
            f.go("main.worker", &[chan]);
            closure = f.make_closure("main.main$1", &[chan]);
            f.call_value(closure, &[], T_INT);
            f.ret(&[]);
        });
        let program = b.build();
        let pts = PointsTo::estimate(&program);

        let worker = program.func_id("main.worker").unwrap();
        let param = program.function(worker).params[0].id;
        assert_eq!(pts.sites(param), BTreeSet::from([chan]));

        let lit = program.func_id("main.main$1").unwrap();
        let fv = program.function(lit).free_vars[0].id;
        assert!(pts.may_alias(fv, chan));
        assert!(pts.is_estimated());
    }

    #[test]
    fn test_field_sensitive_mutex_paths() {
        let mut b = ProgramBuilder::new();
        let gossip = b.struct_type("main.Gossip", &[("mu", crate::builder::T_MUTEX), ("closed", crate::builder::T_BOOL)]);
        let ptr = b.pointer_type(gossip);
        let (mut obj, mut mu) = (0, 0);
        b.func("main.main", &[], |f| {
            obj = f.alloc(ptr);
            mu = f.field_addr(obj, "mu", crate::builder::T_PTR_MUTEX);
            f.lock(mu);
            f.ret(&[]);
        });
        let program = b.build();
        let pts = PointsTo::estimate(&program);
        let expected = Label::new(obj).extend(PathElem::Field("mu".into()));
        assert_eq!(pts.labels(mu), &BTreeSet::from([expected]));
    }

    #[test]
    fn test_cond_locker_is_stored_in_l_field() {
        let mut b = ProgramBuilder::new();
        let (mut mu, mut cond, mut locker) = (0, 0, 0);
        b.func("main.main", &[], |f| {
            mu = f.new_mutex();
            cond = f.new_cond(mu);
            let l_addr = f.field_addr(cond, "L", crate::builder::T_PTR_LOCKER);
            locker = f.load(l_addr, crate::builder::T_LOCKER);
            f.ret(&[]);
        });
        let program = b.build();
        let pts = PointsTo::estimate(&program);
        assert_eq!(pts.sites(cond), BTreeSet::from([cond]));
        assert_eq!(pts.sites(locker), BTreeSet::from([mu]));
    }

    #[test]
    fn test_timer_channel_lives_behind_field_c() {
        let mut b = ProgramBuilder::new();
        let timer = b.struct_type("time.Timer", &[("C", crate::builder::T_CHAN_INT)]);
        let timer_ptr = b.pointer_type(timer);
        let chan_ptr = b.pointer_type(crate::builder::T_CHAN_INT);
        let (mut t, mut ch, mut after) = (0, 0, 0);
        b.func("main.main", &[], |f| {
            let d = f.int(5);
            t = f.call("time.NewTimer", &[d], timer_ptr);
            let c = f.field_addr(t, "C", chan_ptr);
            ch = f.load(c, crate::builder::T_CHAN_INT);
            after = f.call("time.After", &[d], crate::builder::T_CHAN_INT);
            f.ret(&[]);
        });
        let program = b.build();
        let pts = PointsTo::estimate(&program);
        assert_eq!(pts.sites(t), BTreeSet::from([t]));
        assert_eq!(
            pts.labels(ch),
            &BTreeSet::from([Label::new(t).extend(PathElem::ArrayElem)])
        );
        assert_eq!(pts.sites(after), BTreeSet::from([after]));
    }

    #[test]
    fn test_rlocker_and_atomic_value_carry_labels() {
        let mut b = ProgramBuilder::new();
        let (mut rw, mut locker, mut ch, mut loaded) = (0, 0, 0, 0);
        b.func("main.main", &[], |f| {
            rw = f.new_rw_mutex();
            locker = f.call("(*sync.RWMutex).RLocker", &[rw], crate::builder::T_LOCKER);
            let cell = f.alloc(crate::builder::T_PTR_INT);
            ch = f.make_chan(0);
            f.call("(*sync/atomic.Value).Store", &[cell, ch], crate::builder::T_UNIT);
            loaded = f.call("(*sync/atomic.Value).Load", &[cell], crate::builder::T_CHAN_INT);
            f.ret(&[]);
        });
        let program = b.build();
        let pts = PointsTo::estimate(&program);
        assert_eq!(pts.sites(locker), BTreeSet::from([rw]));
        assert_eq!(pts.sites(loaded), BTreeSet::from([ch]));
    }

    #[test]
    fn test_long_paths_are_collapsed() {
        let mut label = Label::new(1);
        for _ in 0..10 {
            label = extend_capped(&label, &PathElem::ArrayElem);
        }
        assert_eq!(label.path.len(), MAX_PATH_LEN);
    }
}
