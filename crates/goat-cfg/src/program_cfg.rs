//! Construction of the extended, program-wide CFG.
//!
//! Every function with a body gets an entry, an exit and a panic exit. Each
//! non-phi instruction becomes one node, except:
//! - calls, which are split into the call and the post-call node,
//! - `select`, which gets one node per arm,
//! - `RunDefers`, which is followed by one deferred-call node per `defer`
//!   statement of the function (latest first),
//! - `(*sync.Cond).Wait`, which becomes wait, waiting and waking nodes.
//!
//! Panics enter a per-function unwinding chain of deferred calls that ends
//! at the panic exit. Phi instructions are not nodes: they are evaluated
//! when control enters their block.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use goat_ir::cfg::Cfg;
use goat_ir::ir::{Callee, Function, Op, Span, ValueId};
use goat_ir::{FuncId, Program};

use crate::comm::{classify_call, classify_op, Comm, SyncOp};
use crate::node::{FunctionNodes, Node, NodeId, NodeKind};

#[derive(Debug, Clone, Default)]
pub struct ProgramCfg {
    nodes: Vec<Node>,
    functions: FxHashMap<FuncId, FunctionNodes>,
    instr_nodes: FxHashMap<ValueId, NodeId>,
    comms: FxHashMap<NodeId, Comm>,
    loop_heads: FxHashSet<NodeId>,
}

impl ProgramCfg {
    pub fn build(program: &Program) -> Self {
        let mut cfg = ProgramCfg::default();
        for (id, func) in program.functions() {
            if func.has_body() {
                FunctionBuilder::new(&mut cfg, program, id, func).build();
            }
        }
        debug!(
            nodes = cfg.nodes.len(),
            functions = cfg.functions.len(),
            comm_nodes = cfg.comms.len(),
            "built program CFG"
        );
        cfg
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id as usize]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (i as NodeId, n))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Landmarks of a function with a body.
    pub fn function(&self, func: FuncId) -> Option<&FunctionNodes> {
        self.functions.get(&func)
    }

    /// The node an instruction starts at (the call node for calls, the
    /// header for selects).
    pub fn node_of(&self, instr: ValueId) -> Option<NodeId> {
        self.instr_nodes.get(&instr).copied()
    }

    pub fn comm(&self, node: NodeId) -> Option<&Comm> {
        self.comms.get(&node)
    }

    pub fn comm_nodes(&self) -> impl Iterator<Item = (NodeId, &Comm)> {
        self.comms.iter().map(|(n, c)| (*n, c))
    }

    pub fn is_loop_head(&self, node: NodeId) -> bool {
        self.loop_heads.contains(&node)
    }

    /// Nodes of `func`, in creation order.
    pub fn nodes_of(&self, func: FuncId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes()
            .filter(move |(_, n)| n.func == func)
            .map(|(id, _)| id)
    }

    pub fn span(&self, node: NodeId, program: &Program) -> Option<Span> {
        let n = self.node(node);
        match n.instr {
            Some(instr) => program.span_of(instr).cloned(),
            None => program.function(n.func).span.clone(),
        }
    }

    /// One-line human description of a node.
    pub fn describe(&self, node: NodeId, program: &Program) -> String {
        let n = self.node(node);
        let func = &program.function(n.func).name;
        let what = match n.instr.and_then(|i| program.instruction(i)) {
            Some(instr) if instr.op.defines_value() && !instr.name.is_empty() => {
                format!("{} = {}", instr.name, instr.op.name())
            }
            Some(instr) => instr.op.name().to_string(),
            None => String::new(),
        };
        let mut out = format!("{func} [{}]", n.kind.label());
        if !what.is_empty() {
            out.push(' ');
            out.push_str(&what);
        }
        if let Some(span) = self.span(node, program) {
            out.push_str(&format!(" at {span}"));
        }
        out
    }
}

struct FunctionBuilder<'a> {
    cfg: &'a mut ProgramCfg,
    program: &'a Program,
    id: FuncId,
    func: &'a Function,
}

impl<'a> FunctionBuilder<'a> {
    fn new(cfg: &'a mut ProgramCfg, program: &'a Program, id: FuncId, func: &'a Function) -> Self {
        Self {
            cfg,
            program,
            id,
            func,
        }
    }

    fn add(&mut self, kind: NodeKind, instr: Option<ValueId>, block: u32) -> NodeId {
        let id = self.cfg.nodes.len() as NodeId;
        self.cfg.nodes.push(Node {
            kind,
            func: self.id,
            instr,
            block,
            succs: vec![],
            post: None,
        });
        id
    }

    fn link(&mut self, from: NodeId, to: NodeId) {
        self.cfg.nodes[from as usize].succs.push(to);
    }

    fn link_all(&mut self, from: &[NodeId], to: NodeId) {
        for &f in from {
            self.link(f, to);
        }
    }

    /// Deferred call followed by its post-call node.
    fn defer_call(&mut self, defer: ValueId, unwinding: bool) -> (NodeId, NodeId) {
        let block = self.block_of(defer);
        let call = self.add(NodeKind::DeferCall { unwinding }, Some(defer), block);
        let post = self.add(NodeKind::PostCall, Some(defer), block);
        self.link(call, post);
        self.cfg.nodes[call as usize].post = Some(post);
        self.record_comm(call);
        (call, post)
    }

    fn block_of(&self, instr: ValueId) -> u32 {
        match self.program.value_def(instr) {
            Some(goat_ir::program::ValueDef::Instr { block, .. }) => block,
            _ => 0,
        }
    }

    fn record_comm(&mut self, node: NodeId) {
        let program = self.program;
        let n = &self.cfg.nodes[node as usize];
        let Some(instr) = n.instr.and_then(|i| program.instruction(i)) else {
            return;
        };
        let relevant = match (&n.kind, &instr.op) {
            (NodeKind::Ssa, Op::Defer { .. } | Op::Go { .. }) => false,
            (NodeKind::DeferCall { .. }, Op::Defer { .. }) => true,
            (NodeKind::PostCall | NodeKind::FunctionEntry | NodeKind::FunctionExit, _) => false,
            (NodeKind::SelectRecv(_) | NodeKind::SelectSend(_), _) => false,
            _ => true,
        };
        if relevant {
            if let Some(comm) = classify_op(&instr.op, program) {
                self.cfg.comms.insert(node, comm);
            }
        }
    }

    fn build(mut self) {
        let entry = self.add(NodeKind::FunctionEntry, None, 0);
        let exit = self.add(NodeKind::FunctionExit, None, 0);
        let panic_exit = self.add(NodeKind::PanicExit, None, 0);

        let func = self.func;
        let defers: Vec<ValueId> = func
            .instructions()
            .filter(|i| matches!(i.op, Op::Defer { .. }))
            .map(|i| i.id)
            .collect();

        let mut unwind = panic_exit;
        for &d in &defers {
            let (call, post) = self.defer_call(d, true);
            self.link(post, unwind);
            unwind = call;
        }

        let mut block_heads = Vec::with_capacity(func.blocks.len());
        let mut terminators: Vec<(NodeId, u32)> = vec![];
        for block in &func.blocks {
            let mut head = None;
            let mut pending: Vec<NodeId> = vec![];
            for instr in &block.instructions {
                if matches!(instr.op, Op::Phi { .. }) {
                    continue;
                }
                let (first, tail) = self.expand(instr.id, &instr.op, block.id, exit, unwind, &defers);
                self.cfg.instr_nodes.insert(instr.id, first);
                if matches!(instr.op, Op::Jump | Op::If { .. }) {
                    terminators.push((first, block.id));
                }
                self.link_all(&pending, first);
                head.get_or_insert(first);
                pending = tail;
            }
            // Validated input always ends blocks with a terminator.
            block_heads.push(head.unwrap_or(exit));
        }

        self.link(entry, block_heads[0]);
        let block_cfg = Cfg::from_function(func);
        for (node, block) in terminators {
            for succ in block_cfg.successor_ids(block) {
                self.link(node, block_heads[succ as usize]);
            }
        }
        let loop_heads: Vec<NodeId> = block_cfg
            .loop_headers()
            .into_iter()
            .map(|b| block_heads[b as usize])
            .collect();
        self.cfg.loop_heads.extend(loop_heads.iter().copied());

        self.cfg.functions.insert(
            self.id,
            FunctionNodes {
                entry,
                exit,
                panic_exit,
                unwind,
                block_heads,
                defers,
                loop_heads,
            },
        );
    }

    /// Nodes for one instruction: its first node and the nodes whose
    /// successor is the next instruction.
    fn expand(
        &mut self,
        id: ValueId,
        op: &Op,
        block: u32,
        exit: NodeId,
        unwind: NodeId,
        defers: &[ValueId],
    ) -> (NodeId, Vec<NodeId>) {
        match op {
            Op::Call { call } => {
                if matches!(call.callee, Callee::Builtin { .. }) {
                    let n = self.add(NodeKind::BuiltinCall, Some(id), block);
                    self.record_comm(n);
                    return (n, vec![n]);
                }
                let is_wait = classify_call(call, self.program)
                    .is_some_and(|c| c.op == SyncOp::CondWait);
                if is_wait {
                    let wait = self.add(NodeKind::CondWait, Some(id), block);
                    let waiting = self.add(NodeKind::CondWaiting, Some(id), block);
                    let waking = self.add(NodeKind::CondWaking, Some(id), block);
                    self.link(wait, waiting);
                    self.link(waiting, waking);
                    for n in [wait, waiting, waking] {
                        self.record_comm(n);
                    }
                    return (wait, vec![waking]);
                }
                let n = self.add(NodeKind::Ssa, Some(id), block);
                let post = self.add(NodeKind::PostCall, Some(id), block);
                self.link(n, post);
                self.cfg.nodes[n as usize].post = Some(post);
                self.record_comm(n);
                (n, vec![post])
            }
            Op::Select { states, blocking } => {
                let header = self.add(NodeKind::Select, Some(id), block);
                self.record_comm(header);
                let mut tail = vec![];
                for (i, s) in states.iter().enumerate() {
                    let kind = match s.send {
                        Some(_) => NodeKind::SelectSend(i as u32),
                        None => NodeKind::SelectRecv(i as u32),
                    };
                    let arm = self.add(kind, Some(id), block);
                    self.link(header, arm);
                    tail.push(arm);
                }
                if !*blocking {
                    tail.push(header);
                }
                (header, tail)
            }
            Op::RunDefers => {
                let n = self.add(NodeKind::Ssa, Some(id), block);
                let mut pending = vec![n];
                for &d in defers.iter().rev() {
                    let (call, post) = self.defer_call(d, false);
                    self.link_all(&pending, call);
                    pending = vec![post];
                }
                (n, pending)
            }
            Op::Return { .. } => {
                let n = self.add(NodeKind::Ssa, Some(id), block);
                self.link(n, exit);
                (n, vec![])
            }
            Op::Panic { .. } => {
                let n = self.add(NodeKind::Ssa, Some(id), block);
                self.link(n, unwind);
                (n, vec![])
            }
            Op::Jump | Op::If { .. } => (self.add(NodeKind::Ssa, Some(id), block), vec![]),
            _ => {
                let n = self.add(NodeKind::Ssa, Some(id), block);
                self.record_comm(n);
                (n, vec![n])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goat_ir::builder::{ProgramBuilder, SelectArm, T_UNIT};

    fn kinds(cfg: &ProgramCfg, nodes: &[NodeId]) -> Vec<NodeKind> {
        nodes.iter().map(|n| cfg.node(*n).kind).collect()
    }

    #[test]
    fn test_calls_split_into_call_and_post() {
        let mut b = ProgramBuilder::new();
        b.func("main.f", &[], |f| f.ret(&[]));
        let mut call = 0;
        b.func("main.main", &[], |f| {
            call = f.call("main.f", &[], T_UNIT);
            f.ret(&[]);
        });
        let p = b.build();
        let cfg = ProgramCfg::build(&p);
        let main = cfg.function(p.func_id("main.main").unwrap()).unwrap();

        let n = cfg.node_of(call).unwrap();
        assert_eq!(cfg.node(main.entry).succs, vec![n]);
        let post = cfg.node(n).post.unwrap();
        assert_eq!(cfg.node(n).succs, vec![post]);
        assert_eq!(cfg.node(post).kind, NodeKind::PostCall);
        let ret = cfg.node(post).succs[0];
        assert_eq!(cfg.node(ret).succs, vec![main.exit]);
        assert_eq!(main.unwind, main.panic_exit);
        assert!(cfg.comm(n).is_none());
    }

    #[test]
    fn test_select_arms_and_default() {
        let mut b = ProgramBuilder::new();
        let mut sel = 0;
        b.func("main.main", &[], |f| {
            let a = f.make_chan(0);
            let c = f.make_chan(0);
            let one = f.int(1);
            sel = f.select(&[SelectArm::Recv(a), SelectArm::Send(c, one)], false);
            f.ret(&[]);
        });
        let p = b.build();
        let cfg = ProgramCfg::build(&p);
        let header = cfg.node_of(sel).unwrap();
        let succs = cfg.node(header).succs.clone();
        assert_eq!(
            kinds(&cfg, &succs[..2]),
            vec![NodeKind::SelectRecv(0), NodeKind::SelectSend(1)]
        );
        // Default falls through to the next instruction.
        assert_eq!(succs.len(), 3);
        assert_eq!(cfg.node(succs[0]).succs, vec![succs[2]]);
        assert!(matches!(cfg.comm(header), Some(Comm::Select { blocking: false, .. })));
    }

    #[test]
    fn test_empty_blocking_select_has_no_successor() {
        let mut b = ProgramBuilder::new();
        let mut sel = 0;
        b.func("main.main", &[], |f| {
            sel = f.select(&[], true);
            f.ret(&[]);
        });
        let p = b.build();
        let cfg = ProgramCfg::build(&p);
        assert!(cfg.node(cfg.node_of(sel).unwrap()).succs.is_empty());
    }

    #[test]
    fn test_defers_run_latest_first_and_unwind() {
        let mut b = ProgramBuilder::new();
        b.func("main.a", &[], |f| f.ret(&[]));
        b.func("main.b", &[], |f| f.ret(&[]));
        let (mut d1, mut d2) = (0, 0);
        b.func("main.main", &[], |f| {
            d1 = f.defer("main.a", &[]);
            d2 = f.defer("main.b", &[]);
            f.run_defers();
            f.ret(&[]);
        });
        let p = b.build();
        let cfg = ProgramCfg::build(&p);
        let main = cfg.function(p.func_id("main.main").unwrap()).unwrap();
        assert_eq!(main.defers, vec![d1, d2]);

        // Unwinding: d2, then d1, then the panic exit.
        let first = cfg.node(main.unwind);
        assert_eq!(first.kind, NodeKind::DeferCall { unwinding: true });
        assert_eq!(first.instr, Some(d2));
        let second = cfg.node(cfg.node(first.post.unwrap()).succs[0]);
        assert_eq!(second.instr, Some(d1));
        assert_eq!(cfg.node(second.post.unwrap()).succs, vec![main.panic_exit]);

        // Normal return: RunDefers, d2, d1, Return.
        let run = cfg
            .nodes_of(p.func_id("main.main").unwrap())
            .find(|&n| {
                cfg.node(n).kind == NodeKind::Ssa
                    && p.instruction(cfg.node(n).instr.unwrap()).unwrap().op == Op::RunDefers
            })
            .unwrap();
        let dc = cfg.node(run).succs[0];
        assert_eq!(cfg.node(dc).kind, NodeKind::DeferCall { unwinding: false });
        assert_eq!(cfg.node(dc).instr, Some(d2));
    }

    #[test]
    fn test_cond_wait_phases_and_loop_heads() {
        let mut b = ProgramBuilder::new();
        let mut wait = 0;
        b.func("main.main", &[], |f| {
            let mu = f.new_mutex();
            let c = f.new_cond(mu);
            let head = f.new_block();
            let body = f.new_block();
            let done = f.new_block();
            f.jump(head);
            f.switch_to(head);
            let t = f.bool(true);
            f.branch(t, body, done);
            f.switch_to(body);
            wait = f.cond_wait(c);
            f.jump(head);
            f.switch_to(done);
            f.ret(&[]);
        });
        let p = b.build();
        let cfg = ProgramCfg::build(&p);
        let w = cfg.node_of(wait).unwrap();
        let waiting = cfg.node(w).succs[0];
        let waking = cfg.node(waiting).succs[0];
        assert_eq!(
            kinds(&cfg, &[w, waiting, waking]),
            vec![NodeKind::CondWait, NodeKind::CondWaiting, NodeKind::CondWaking]
        );
        assert!(cfg.comm(waiting).is_some());

        let main = cfg.function(p.func_id("main.main").unwrap()).unwrap();
        assert_eq!(main.loop_heads, vec![main.block_heads[1]]);
        assert!(cfg.is_loop_head(main.block_heads[1]));
        assert!(cfg.describe(w, &p).contains("cond-wait"));
    }
}
