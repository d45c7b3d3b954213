//! Per-goroutine intraprocedural pre-expansion.
//!
//! Starting from a control location, a goroutine runs every step that does
//! not synchronize with another goroutine: plain instructions, calls into
//! relevant functions, operations on primitives outside the focus and
//! deferred calls. The fixpoint stops at communication nodes on focused
//! primitives, `go` statements with relevant callees and the goroutine's
//! outermost exit. Those stop points are the leaves handed back to the
//! transition relation.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use goat_cfg::{Comm, Node, NodeKind, SyncOp};
use goat_ir::ir::{CallCommon, Callee, EdgeKind, Op, ValueId};
use goat_ir::models::Model;
use goat_ir::FuncId;
use goat_lattice::{Flat, Lattice, Widen};

use crate::context::AnalysisContext;
use crate::goro::{is_root_exit, Context, CtrLoc, Goro};
use crate::memory::Location;
use crate::state::State;
use crate::value::{AbstractValue, Pointee};

/// Stop points reached by one goroutine.
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    pub leaves: BTreeMap<CtrLoc, State>,
    /// Functions whose bodies were interpreted.
    pub entered: BTreeSet<FuncId>,
}

/// A resolved callee and the free variables bound by its closure.
pub(crate) struct Target {
    pub func: FuncId,
    pub bindings: Vec<AbstractValue>,
}

impl<'a> AnalysisContext<'a> {
    /// Run `goro` from `start` until every path reaches a stop point.
    pub fn expand(&self, goro: Goro, start: CtrLoc, state: State) -> Expansion {
        let cfg = self.cfg();
        let mut expansion = Expansion::default();
        let mut states: FxHashMap<CtrLoc, State> = FxHashMap::default();
        let mut visits: FxHashMap<CtrLoc, usize> = FxHashMap::default();
        let mut queue = VecDeque::from([start]);
        let mut queued = FxHashSet::from_iter([start]);
        states.insert(start, state);

        while let Some(cl) = queue.pop_front() {
            queued.remove(&cl);
            let Some(state) = states.get(&cl).cloned() else {
                continue;
            };
            let successors = if self.is_stop(goro, cl, &state) {
                trace!(goro = ?goro, at = ?cl, "stop point");
                let bypass = self.bypass(goro, cl, &state);
                expansion.leaves.insert(cl, state);
                bypass
            } else {
                self.step(goro, cl, &state, &mut expansion.entered)
            };

            for (next, incoming) in successors {
                let widen = cfg.is_loop_head(next.node)
                    || cfg.node(next.node).kind == NodeKind::FunctionEntry;
                let count = visits.entry(next).or_insert(0);
                *count += 1;
                let merged = match states.get(&next) {
                    None => incoming,
                    Some(old) if widen && *count > self.options.widening_threshold => {
                        old.widen(&old.join(&incoming))
                    }
                    Some(old) => old.join(&incoming),
                };
                if states.get(&next) == Some(&merged) {
                    continue;
                }
                states.insert(next, merged);
                if queued.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        expansion
    }

    /// Whether `value` may denote a focused primitive.
    pub fn operand_focused(&self, state: &State, goro: Goro, ctx: Context, value: ValueId) -> bool {
        let v = self.operand(&state.memory, goro, ctx, value);
        self.value_focused(&v, value)
    }

    pub(crate) fn value_focused(&self, v: &AbstractValue, origin: ValueId) -> bool {
        match v.pointees() {
            Some(set) if !set.is_top_set() => set
                .iter()
                .any(|p| matches!(p, Pointee::Heap(loc) if self.is_focused(loc.site))),
            _ => self.touches_focus(origin),
        }
    }

    /// The locker of the condition variables `cond` may denote.
    pub fn cond_locker(&self, state: &State, goro: Goro, ctx: Context, cond: ValueId) -> AbstractValue {
        let v = self.operand(&state.memory, goro, ctx, cond);
        match v.pointees() {
            Some(set) if !set.is_top_set() => set
                .iter()
                .filter_map(|p| match p {
                    Pointee::Heap(loc) => Some(loc.field("L")),
                    Pointee::Nil => None,
                })
                .fold(AbstractValue::Bot, |acc, loc| {
                    let locker = state
                        .memory
                        .get(&Location::Heap(loc))
                        .cloned()
                        .unwrap_or(AbstractValue::Top);
                    acc.join(&locker)
                }),
            _ => AbstractValue::Top,
        }
    }

    fn locker_focused(&self, state: &State, goro: Goro, ctx: Context, cond: ValueId) -> bool {
        let locker = self.cond_locker(state, goro, ctx, cond);
        match locker.pointees() {
            Some(set) if !set.is_top_set() => set
                .iter()
                .any(|p| matches!(p, Pointee::Heap(loc) if self.is_focused(loc.site))),
            // Unknown locker: any focused mutex could be behind it.
            _ => self.focus.iter().any(|site| {
                self.facts
                    .primitives
                    .get(*site)
                    .is_some_and(|p| !p.kind.is_chan())
            }),
        }
    }

    fn is_nil_operand(&self, state: &State, goro: Goro, ctx: Context, value: ValueId) -> bool {
        self.operand(&state.memory, goro, ctx, value).is_nil()
    }

    /// Whether the goroutine hands control to the transition relation at `cl`.
    pub fn is_stop(&self, goro: Goro, cl: CtrLoc, state: &State) -> bool {
        let cfg = self.cfg();
        if is_root_exit(cfg, goro, cl) {
            return true;
        }
        let node = cfg.node(cl.node);
        let ctx = cl.ctx;
        if node.kind == NodeKind::Ssa {
            if let Some(Op::Go { call }) = self.op_of(node) {
                let site = node.instr.unwrap_or_default();
                return self
                    .targets(state, goro, ctx, site, call)
                    .iter()
                    .any(|t| self.enters(t.func));
            }
        }
        let Some(comm) = cfg.comm(cl.node) else {
            return false;
        };
        if let NodeKind::DeferCall { .. } = node.kind {
            let defer = node.instr.unwrap_or_default();
            if !state.charge(goro, defer, ctx).may_be(&true) {
                return false;
            }
        }
        let focused = |v: ValueId| self.operand_focused(state, goro, ctx, v);
        let nil = |v: ValueId| self.is_nil_operand(state, goro, ctx, v);
        match comm {
            Comm::Send { chan, .. } | Comm::Recv { chan, .. } | Comm::Close { chan } => {
                focused(*chan) || nil(*chan)
            }
            Comm::Select { arms, blocking } => {
                (*blocking && arms.iter().all(|a| nil(a.chan)))
                    || arms.iter().any(|a| focused(a.chan))
            }
            Comm::Sync(call) => match (node.kind, call.op) {
                (NodeKind::CondWait, _) => {
                    focused(call.receiver) || self.locker_focused(state, goro, ctx, call.receiver)
                }
                (NodeKind::CondWaiting, _) => focused(call.receiver),
                (NodeKind::CondWaking, _) => self.locker_focused(state, goro, ctx, call.receiver),
                (_, SyncOp::CondWait) => false,
                _ => focused(call.receiver),
            },
        }
    }

    /// Paths around a stop point: a deferred operation that may not be
    /// charged is also skipped.
    fn bypass(&self, goro: Goro, cl: CtrLoc, state: &State) -> Vec<(CtrLoc, State)> {
        let node = self.cfg().node(cl.node);
        let (NodeKind::DeferCall { .. }, Some(defer), Some(post)) = (node.kind, node.instr, node.post)
        else {
            return vec![];
        };
        match state.charge(goro, defer, cl.ctx) {
            Flat::Top => self.follow(cl, &self.cfg().node(post).succs, state),
            _ => vec![],
        }
    }

    fn op_of(&self, node: &Node) -> Option<&'a Op> {
        node.instr
            .and_then(|i| self.program.instruction(i))
            .map(|i| &i.op)
    }

    fn follow(&self, cl: CtrLoc, succs: &[u32], state: &State) -> Vec<(CtrLoc, State)> {
        succs.iter().map(|s| (cl.at(*s), state.clone())).collect()
    }

    /// Where a panicking frame continues.
    fn unwind(&self, func: FuncId, ctx: Context, state: State) -> Vec<(CtrLoc, State)> {
        match self.cfg().function(func) {
            Some(nodes) => vec![(CtrLoc::new(nodes.unwind, ctx, true), state)],
            None => vec![],
        }
    }

    fn step(
        &self,
        goro: Goro,
        cl: CtrLoc,
        state: &State,
        entered: &mut BTreeSet<FuncId>,
    ) -> Vec<(CtrLoc, State)> {
        let cfg = self.cfg();
        let node = cfg.node(cl.node);
        match node.kind {
            NodeKind::FunctionEntry => {
                let mut s = state.clone();
                if let Some(nodes) = cfg.function(node.func) {
                    for defer in &nodes.defers {
                        s.set_charge(goro, *defer, cl.ctx, false);
                    }
                }
                self.follow(cl, &node.succs, &s)
            }
            NodeKind::FunctionExit => self.return_to_callers(goro, cl, node, state, false),
            NodeKind::PanicExit => self.return_to_callers(goro, cl, node, state, true),
            NodeKind::Ssa => self.step_instruction(goro, cl, node, state, entered),
            NodeKind::BuiltinCall => {
                if matches!(cfg.comm(cl.node), Some(Comm::Close { .. })) {
                    return self.follow(cl, &node.succs, state);
                }
                let Some(instr) = node.instr.and_then(|i| self.program.instruction(i)) else {
                    return self.follow(cl, &node.succs, state);
                };
                let mut s = state.clone();
                match self.exec(&mut s, goro, cl.ctx, instr) {
                    Ok(()) => self.follow(cl, &node.succs, &s),
                    Err(_) => self.unwind(node.func, cl.ctx, s),
                }
            }
            NodeKind::Select => self.silent_select(goro, cl, node, state),
            NodeKind::DeferCall { .. } => self.step_deferred(goro, cl, node, state, entered),
            NodeKind::PostCall
            | NodeKind::SelectRecv(_)
            | NodeKind::SelectSend(_)
            | NodeKind::CondWait
            | NodeKind::CondWaiting
            | NodeKind::CondWaking => self.follow(cl, &node.succs, state),
        }
    }

    fn return_to_callers(
        &self,
        goro: Goro,
        cl: CtrLoc,
        node: &Node,
        state: &State,
        panicked: bool,
    ) -> Vec<(CtrLoc, State)> {
        let cfg = self.cfg();
        let frame = (goro, node.func, cl.ctx);
        let result = state
            .memory
            .get(&Location::Return {
                goro,
                func: node.func,
                ctx: cl.ctx,
            })
            .cloned()
            .unwrap_or_default();
        let posts = state.continuations(&frame);
        let mut popped = state.clone();
        if !self.is_recursive(node.func) {
            let defers = cfg.function(node.func).map_or(&[][..], |n| n.defers.as_slice());
            popped.pop_frame(frame, &self.registers(node.func), defers);
        }
        let mut out = vec![];
        for post in posts.iter() {
            let post_node = cfg.node(post.node);
            let s = popped.clone();
            if panicked {
                if let Some(nodes) = cfg.function(post_node.func) {
                    out.push((cl.unwinding_to(nodes.unwind, post.ctx), s));
                }
                continue;
            }
            let mut s = s;
            if let Some(Op::Call { .. }) = self.op_of(post_node) {
                if let Some(instr) = post_node.instr {
                    s.memory.set_local(goro, post.ctx, instr, result.clone());
                }
            }
            out.push((*post, s));
        }
        out
    }

    fn step_instruction(
        &self,
        goro: Goro,
        cl: CtrLoc,
        node: &Node,
        state: &State,
        entered: &mut BTreeSet<FuncId>,
    ) -> Vec<(CtrLoc, State)> {
        let Some(instr) = node.instr.and_then(|i| self.program.instruction(i)) else {
            return self.follow(cl, &node.succs, state);
        };
        let ctx = cl.ctx;
        match &instr.op {
            Op::Jump | Op::If { .. } => self.branch(goro, cl, node, state),
            Op::Return { results } => {
                let mut s = state.clone();
                let values: Vec<AbstractValue> = results
                    .iter()
                    .map(|r| self.operand(&s.memory, goro, ctx, *r))
                    .collect();
                let value = match values.len() {
                    1 => values.into_iter().next().unwrap_or_default(),
                    _ => AbstractValue::Tuple(values),
                };
                s.memory.set(
                    Location::Return {
                        goro,
                        func: node.func,
                        ctx,
                    },
                    value,
                );
                self.follow(cl, &node.succs, &s)
            }
            Op::Panic { .. } => node
                .succs
                .iter()
                .map(|s| (CtrLoc::new(*s, ctx, true), state.clone()))
                .collect(),
            Op::Call { call } => {
                let Some(post) = node.post else {
                    return vec![];
                };
                if self.cfg().comm(cl.node).is_some() {
                    return vec![(cl.at(post), state.clone())];
                }
                self.call(goro, cl, instr.id, call, post, state.clone(), entered)
            }
            Op::Defer { .. } => {
                let mut s = state.clone();
                s.set_charge(goro, instr.id, ctx, true);
                self.follow(cl, &node.succs, &s)
            }
            // Only `go` statements without relevant callees get here.
            Op::Go { .. } | Op::RunDefers => self.follow(cl, &node.succs, state),
            _ => {
                let mut s = state.clone();
                match self.exec(&mut s, goro, ctx, instr) {
                    Ok(()) => self.follow(cl, &node.succs, &s),
                    Err(fault) => {
                        trace!(goro = ?goro, at = ?cl, %fault, "runtime panic");
                        self.unwind(node.func, ctx, s)
                    }
                }
            }
        }
    }

    /// `Jump` and `If`: filter infeasible edges and bind the phis of the
    /// target block.
    fn branch(&self, goro: Goro, cl: CtrLoc, node: &Node, state: &State) -> Vec<(CtrLoc, State)> {
        let func = self.program.function(node.func);
        let mut edges: Vec<_> = func
            .cfg_edges
            .iter()
            .filter(|e| e.from_block == node.block)
            .collect();
        edges.sort_by_key(|e| e.kind == EdgeKind::CondFalse);
        let cond = match self.op_of(node) {
            Some(Op::If { cond }) => Some(self.operand(&state.memory, goro, cl.ctx, *cond)),
            _ => None,
        };

        let mut out = vec![];
        for (edge, succ) in edges.iter().zip(&node.succs) {
            let feasible = match (&edge.kind, &cond) {
                (EdgeKind::CondTrue, Some(c)) => c.may_be_bool(true),
                (EdgeKind::CondFalse, Some(c)) => c.may_be_bool(false),
                _ => true,
            };
            if !feasible {
                continue;
            }
            let mut s = state.clone();
            if let Some(block) = func.blocks.get(edge.to_block as usize) {
                let phis: Vec<(ValueId, AbstractValue)> = block
                    .instructions
                    .iter()
                    .filter_map(|i| match &i.op {
                        Op::Phi { edges } => {
                            let v = edges
                                .iter()
                                .find(|e| e.block == edge.from_block)
                                .map(|e| self.operand(&state.memory, goro, cl.ctx, e.value))
                                .unwrap_or(AbstractValue::Top);
                            Some((i.id, v))
                        }
                        _ => None,
                    })
                    .collect();
                for (id, v) in phis {
                    s.memory.set_local(goro, cl.ctx, id, v);
                }
            }
            out.push((cl.at(*succ), s));
        }
        out
    }

    /// A select whose arms all operate outside the focus: every non-nil
    /// arm and the default may be chosen.
    fn silent_select(&self, goro: Goro, cl: CtrLoc, node: &Node, state: &State) -> Vec<(CtrLoc, State)> {
        let Some(Comm::Select { arms, .. }) = self.cfg().comm(cl.node) else {
            return self.follow(cl, &node.succs, state);
        };
        let Some(instr) = node.instr else {
            return vec![];
        };
        let recvs = arms.iter().filter(|a| a.value.is_none()).count();
        let mut out = vec![];
        for (i, succ) in node.succs.iter().enumerate() {
            let index = match arms.get(i) {
                Some(arm) if self.is_nil_operand(state, goro, cl.ctx, arm.chan) => continue,
                Some(_) => i as i64,
                None => -1,
            };
            let mut tuple = vec![AbstractValue::int(index), AbstractValue::unknown_bool()];
            tuple.extend(std::iter::repeat(AbstractValue::Top).take(recvs));
            let mut s = state.clone();
            s.memory.set_local(goro, cl.ctx, instr, AbstractValue::Tuple(tuple));
            out.push((cl.at(*succ), s));
        }
        out
    }

    fn step_deferred(
        &self,
        goro: Goro,
        cl: CtrLoc,
        node: &Node,
        state: &State,
        entered: &mut BTreeSet<FuncId>,
    ) -> Vec<(CtrLoc, State)> {
        let (Some(defer), Some(post)) = (node.instr, node.post) else {
            return self.follow(cl, &node.succs, state);
        };
        let charge = state.charge(goro, defer, cl.ctx);
        let mut out = vec![];
        if !charge.may_be(&true) || charge == Flat::Top {
            out.extend(self.follow(cl, &self.cfg().node(post).succs, state));
        }
        if !charge.may_be(&true) {
            return out;
        }
        let mut s = state.clone();
        s.set_charge(goro, defer, cl.ctx, false);
        if self.cfg().comm(cl.node).is_some() {
            out.push((cl.at(post), s));
            return out;
        }
        if let Some(Op::Defer { call }) = self.op_of(node) {
            out.extend(self.call(goro, cl, defer, call, post, s, entered));
        }
        out
    }

    /// Callees of a call or `go` statement.
    pub(crate) fn targets(
        &self,
        state: &State,
        goro: Goro,
        ctx: Context,
        site: ValueId,
        call: &CallCommon,
    ) -> Vec<Target> {
        let from_graph = || -> Vec<Target> {
            self.facts
                .call_graph
                .callees_at(site)
                .iter()
                .map(|f| Target {
                    func: *f,
                    bindings: vec![],
                })
                .collect()
        };
        match &call.callee {
            Callee::Static { func } => self
                .program
                .func_id(func)
                .map(|f| {
                    vec![Target {
                        func: f,
                        bindings: vec![],
                    }]
                })
                .unwrap_or_default(),
            Callee::Dynamic { value } => match self.operand(&state.memory, goro, ctx, *value) {
                AbstractValue::Closure(closures) => closures
                    .into_iter()
                    .map(|(func, bindings)| Target { func, bindings })
                    .collect(),
                _ => from_graph(),
            },
            Callee::Invoke { .. } => from_graph(),
            Callee::Builtin { .. } => vec![],
        }
    }

    /// Bind the parameters and free variables of a new frame. Returns the
    /// callee's entry location.
    pub(crate) fn enter_frame(
        &self,
        state: &mut State,
        goro: Goro,
        ctx: Context,
        target: &Target,
        args: &[AbstractValue],
    ) -> Option<CtrLoc> {
        let entry = self.cfg().function(target.func)?.entry;
        let func = self.program.function(target.func);
        let frame = (goro, target.func, ctx);
        let active = !state.continuations(&frame).is_empty();
        let params = func
            .params
            .iter()
            .map(|p| p.id)
            .zip(args.iter().cloned().chain(std::iter::repeat(AbstractValue::Top)));
        let free = func
            .free_vars
            .iter()
            .map(|p| p.id)
            .zip(target.bindings.iter().cloned().chain(std::iter::repeat(AbstractValue::Top)));
        for (id, v) in params.chain(free) {
            match active {
                true => state.memory.join_local(goro, ctx, id, &v),
                false => state.memory.set_local(goro, ctx, id, v),
            }
        }
        if !active {
            let slot = Location::Return {
                goro,
                func: target.func,
                ctx,
            };
            state.memory.set(slot, AbstractValue::Bot);
        }
        Some(CtrLoc::new(entry, ctx, false))
    }

    /// Ordinary and deferred calls. Relevant callees are entered; the rest
    /// are summarized by their written fields.
    #[allow(clippy::too_many_arguments)]
    fn call(
        &self,
        goro: Goro,
        cl: CtrLoc,
        site: ValueId,
        call: &CallCommon,
        post: u32,
        state: State,
        entered: &mut BTreeSet<FuncId>,
    ) -> Vec<(CtrLoc, State)> {
        if let Some(model) = Model::of_call(call) {
            return self.modelled_call(goro, cl, site, call, model, post, state);
        }
        let args: Vec<AbstractValue> = call
            .actuals()
            .iter()
            .map(|a| self.operand(&state.memory, goro, cl.ctx, *a))
            .collect();
        let targets = self.targets(&state, goro, cl.ctx, site, call);
        let (inside, opaque): (Vec<_>, Vec<_>) = targets.into_iter().partition(|t| self.enters(t.func));

        let mut out = vec![];
        for target in &inside {
            let mut s = state.clone();
            let ctx = cl.ctx.push(site, self.options.call_context_depth);
            let Some(entry) = self.enter_frame(&mut s, goro, ctx, target, &args) else {
                continue;
            };
            s.add_continuation((goro, target.func, ctx), cl.at(post));
            entered.insert(target.func);
            out.push((entry, s));
        }
        if inside.is_empty() || !opaque.is_empty() {
            let mut s = state;
            for target in &opaque {
                if let Some(writes) = self.entry_facts.written.of(target.func) {
                    s.memory.top_inject(self.program, writes);
                }
            }
            let binds_result = matches!(self.program.instruction(site).map(|i| &i.op), Some(Op::Call { .. }));
            if binds_result {
                s.memory.set_local(goro, cl.ctx, site, AbstractValue::Top);
            }
            out.push((cl.at(post), s));
        }
        out
    }

    /// Calls summarized by a standard-library model. `Goexit` leaves the
    /// frame through its deferred calls.
    #[allow(clippy::too_many_arguments)]
    fn modelled_call(
        &self,
        goro: Goro,
        cl: CtrLoc,
        site: ValueId,
        call: &CallCommon,
        model: Model,
        post: u32,
        state: State,
    ) -> Vec<(CtrLoc, State)> {
        let func = self.cfg().node(cl.node).func;
        if model == Model::Goexit {
            trace!(goro = ?goro, at = ?cl, "goroutine exits");
            return match self.cfg().function(func) {
                Some(nodes) => vec![(CtrLoc::exiting(nodes.unwind, cl.ctx), state)],
                None => vec![],
            };
        }
        let Some(instr) = self.program.instruction(site) else {
            return vec![(cl.at(post), state)];
        };
        let mut s = state;
        match self.apply_model(&mut s, goro, cl.ctx, instr, model, &call.args) {
            Ok(()) => vec![(cl.at(post), s)],
            Err(fault) => {
                trace!(goro = ?goro, at = ?cl, %fault, "runtime panic");
                self.unwind(func, cl.ctx, s)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use goat_ir::builder::{ProgramBuilder, T_CHAN_INT, T_INT};
    use goat_upfront::{FragmentPolicy, ProgramFacts, UpfrontOptions};

    use super::*;
    use crate::options::AnalysisOptions;

    #[test]
    fn test_expansion_stops_at_focused_receive() {
        let mut b = ProgramBuilder::new();
        let mut recv = 0;
        b.func("main.main", &[], |f| {
            let ch = f.make_chan(0);
            let one = f.int(1);
            let two = f.int(2);
            let _ = f.binop(goat_ir::ir::BinaryOp::Add, one, two, T_INT);
            recv = f.recv(ch);
            f.ret(&[]);
        });
        let program = b.build();
        let facts = ProgramFacts::compute(&program, UpfrontOptions::default());
        let main = program.func_id("main.main").unwrap();
        let entry_facts = facts.entry(&program, main);
        let psets = entry_facts.psets(&program, &facts, FragmentPolicy::Total);
        let options = AnalysisOptions::default();
        let ctx = AnalysisContext::new(&program, &facts, &entry_facts, &psets[0], &options);

        let goro = Goro::root(main);
        let entry = facts.cfg.function(main).unwrap().entry;
        let expansion = ctx.expand(goro, CtrLoc::new(entry, Context::root(), false), State::default());
        let stops: Vec<u32> = expansion.leaves.keys().map(|cl| cl.node).collect();
        assert_eq!(stops, vec![facts.cfg.node_of(recv).unwrap()]);
    }

    #[test]
    fn test_branch_on_constant_prunes_dead_edge() {
        let mut b = ProgramBuilder::new();
        let mut recv = 0;
        b.func("main.main", &[], |f| {
            let ch = f.make_chan(0);
            let then_block = f.new_block();
            let else_block = f.new_block();
            let t = f.bool(true);
            f.branch(t, then_block, else_block);
            f.switch_to(then_block);
            f.ret(&[]);
            f.switch_to(else_block);
            recv = f.recv(ch);
            f.ret(&[]);
        });
        let program = b.build();
        let facts = ProgramFacts::compute(&program, UpfrontOptions::default());
        let main = program.func_id("main.main").unwrap();
        let entry_facts = facts.entry(&program, main);
        let psets = entry_facts.psets(&program, &facts, FragmentPolicy::Total);
        let options = AnalysisOptions::default();
        let ctx = AnalysisContext::new(&program, &facts, &entry_facts, &psets[0], &options);

        let goro = Goro::root(main);
        let nodes = facts.cfg.function(main).unwrap();
        let expansion = ctx.expand(goro, CtrLoc::new(nodes.entry, Context::root(), false), State::default());
        let stops: Vec<u32> = expansion.leaves.keys().map(|cl| cl.node).collect();
        assert_eq!(stops, vec![nodes.exit]);
        assert!(!expansion.leaves.keys().any(|cl| Some(cl.node) == facts.cfg.node_of(recv)));
    }

    #[test]
    fn test_returned_frame_is_dropped() {
        let mut b = ProgramBuilder::new();
        let (mut made, mut site, mut recv) = (0, 0, 0);
        b.func("main.mk", &[], |f| {
            made = f.make_chan(0);
            f.ret(&[made]);
        });
        b.func("main.main", &[], |f| {
            site = f.call("main.mk", &[], T_CHAN_INT);
            recv = f.recv(site);
            f.ret(&[]);
        });
        let program = b.build();
        let facts = ProgramFacts::compute(&program, UpfrontOptions::default());
        let main = program.func_id("main.main").unwrap();
        let mk = program.func_id("main.mk").unwrap();
        let entry_facts = facts.entry(&program, main);
        let psets = entry_facts.psets(&program, &facts, FragmentPolicy::Total);
        let options = AnalysisOptions::default();
        let ctx = AnalysisContext::new(&program, &facts, &entry_facts, &psets[0], &options);
        assert!(!ctx.is_recursive(mk));

        let goro = Goro::root(main);
        let entry = facts.cfg.function(main).unwrap().entry;
        let expansion = ctx.expand(goro, CtrLoc::new(entry, Context::root(), false), State::default());
        assert!(expansion.entered.contains(&mk));
        let (cl, state) = expansion.leaves.iter().next().unwrap();
        assert_eq!(Some(cl.node), facts.cfg.node_of(recv));

        let callee = Context::root().push(site, options.call_context_depth);
        assert!(state.memory.local(goro, callee, made).is_none());
        assert!(state.memory.get(&Location::Return { goro, func: mk, ctx: callee }).is_none());
        assert!(state.continuations(&(goro, mk, callee)).is_empty());
        // The caller still sees the returned channel.
        assert!(state.memory.local(goro, Context::root(), site).is_some());
    }

    #[test]
    fn test_recursive_functions_are_detected() {
        let mut b = ProgramBuilder::new();
        b.func("main.mk", &[], |f| {
            let ch = f.make_chan(0);
            f.call("main.mk", &[], T_CHAN_INT);
            f.ret(&[ch]);
        });
        b.func("main.main", &[], |f| {
            let ch = f.call("main.mk", &[], T_CHAN_INT);
            f.recv(ch);
            f.ret(&[]);
        });
        let program = b.build();
        let facts = ProgramFacts::compute(&program, UpfrontOptions::default());
        let main = program.func_id("main.main").unwrap();
        let entry_facts = facts.entry(&program, main);
        let psets = entry_facts.psets(&program, &facts, FragmentPolicy::Total);
        let options = AnalysisOptions::default();
        let ctx = AnalysisContext::new(&program, &facts, &entry_facts, &psets[0], &options);
        assert!(ctx.is_recursive(program.func_id("main.mk").unwrap()));
        assert!(!ctx.is_recursive(main));
    }
}
