use goat_ir::ir::ValueId;
use goat_ir::FuncId;
use serde::Serialize;

/// Global index of a node in the program CFG.
pub type NodeId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum NodeKind {
    FunctionEntry,
    FunctionExit,
    /// Where a panicking goroutine leaves the function after its deferred
    /// calls ran.
    PanicExit,
    /// A plain SSA instruction, including calls before they return.
    Ssa,
    /// Call of a built-in such as `close` or `len`; never enters a callee.
    BuiltinCall,
    /// Control returns here from the callee of the preceding call node.
    PostCall,
    /// Header of a `select`; its successors are the arms.
    Select,
    SelectRecv(u32),
    SelectSend(u32),
    /// A deferred call replayed by `RunDefers` or during panic unwinding.
    DeferCall { unwinding: bool },
    /// `(*sync.Cond).Wait` releases its locker here.
    CondWait,
    /// Parked until signalled.
    CondWaiting,
    /// Signalled; reacquires the locker before returning.
    CondWaking,
}

impl NodeKind {
    pub fn label(&self) -> String {
        match self {
            NodeKind::FunctionEntry => "entry".into(),
            NodeKind::FunctionExit => "exit".into(),
            NodeKind::PanicExit => "panic-exit".into(),
            NodeKind::Ssa => "ssa".into(),
            NodeKind::BuiltinCall => "builtin".into(),
            NodeKind::PostCall => "post-call".into(),
            NodeKind::Select => "select".into(),
            NodeKind::SelectRecv(i) => format!("select-recv#{i}"),
            NodeKind::SelectSend(i) => format!("select-send#{i}"),
            NodeKind::DeferCall { unwinding: false } => "defer".into(),
            NodeKind::DeferCall { unwinding: true } => "defer-unwind".into(),
            NodeKind::CondWait => "cond-wait".into(),
            NodeKind::CondWaiting => "cond-waiting".into(),
            NodeKind::CondWaking => "cond-waking".into(),
        }
    }

    pub fn is_select_arm(&self) -> bool {
        matches!(self, NodeKind::SelectRecv(_) | NodeKind::SelectSend(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub kind: NodeKind,
    pub func: FuncId,
    /// The SSA instruction this node stands for. Deferred calls point at
    /// their `Defer` instruction; cond phases at the `Wait` call.
    pub instr: Option<ValueId>,
    /// Basic block of `instr`.
    pub block: u32,
    pub succs: Vec<NodeId>,
    /// Where a call node resumes once its callee returns.
    pub post: Option<NodeId>,
}

/// Landmarks of one function's nodes.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionNodes {
    pub entry: NodeId,
    pub exit: NodeId,
    pub panic_exit: NodeId,
    /// First node of the unwinding chain (the panic exit without defers).
    pub unwind: NodeId,
    /// First non-phi node of each basic block.
    pub block_heads: Vec<NodeId>,
    /// `Defer` instructions in program order.
    pub defers: Vec<ValueId>,
    /// Block heads that are targets of back edges.
    pub loop_heads: Vec<NodeId>,
}
