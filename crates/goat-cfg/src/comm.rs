//! Classification of concurrency operations.

use goat_ir::ir::{CallCommon, Callee, ChanDir, Op, UnaryOp, ValueId};
use goat_ir::Program;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum SyncOp {
    Lock,
    Unlock,
    RLock,
    RUnlock,
    WgAdd,
    WgDone,
    WgWait,
    CondWait,
    Signal,
    Broadcast,
}

impl SyncOp {
    /// Operations that may park the calling goroutine.
    pub fn may_block(self) -> bool {
        matches!(
            self,
            SyncOp::Lock | SyncOp::RLock | SyncOp::WgWait | SyncOp::CondWait
        )
    }
}

/// A call to a `sync` API the interpreter models.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncCall {
    pub op: SyncOp,
    pub receiver: ValueId,
    /// Remaining arguments (the delta of `WaitGroup.Add`).
    pub args: Vec<ValueId>,
    /// Dispatched dynamically through a `sync.Locker` interface.
    pub via_locker: bool,
}

impl SyncCall {
    pub fn delta(&self) -> Option<ValueId> {
        self.args.first().copied()
    }
}

/// Concurrency operation performed by a CFG node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Comm {
    Send { chan: ValueId, value: ValueId },
    Recv { chan: ValueId, comma_ok: bool },
    Close { chan: ValueId },
    Select { arms: Vec<SelectOp>, blocking: bool },
    Sync(SyncCall),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectOp {
    pub dir: ChanDir,
    pub chan: ValueId,
    pub value: Option<ValueId>,
}

impl Comm {
    /// Channels or primitives this operation touches.
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            Comm::Send { chan, .. } | Comm::Recv { chan, .. } | Comm::Close { chan } => vec![*chan],
            Comm::Select { arms, .. } => arms.iter().map(|a| a.chan).collect(),
            Comm::Sync(call) => vec![call.receiver],
        }
    }

    pub fn may_block(&self) -> bool {
        match self {
            Comm::Send { .. } | Comm::Recv { .. } => true,
            Comm::Close { .. } => false,
            Comm::Select { blocking, .. } => *blocking,
            Comm::Sync(call) => call.op.may_block(),
        }
    }
}

fn static_sync_op(name: &str) -> Option<SyncOp> {
    Some(match name {
        "(*sync.Mutex).Lock" | "(*sync.RWMutex).Lock" => SyncOp::Lock,
        "(*sync.Mutex).Unlock" | "(*sync.RWMutex).Unlock" => SyncOp::Unlock,
        "(*sync.RWMutex).RLock" => SyncOp::RLock,
        "(*sync.RWMutex).RUnlock" => SyncOp::RUnlock,
        "(*sync.WaitGroup).Add" => SyncOp::WgAdd,
        "(*sync.WaitGroup).Done" => SyncOp::WgDone,
        "(*sync.WaitGroup).Wait" => SyncOp::WgWait,
        "(*sync.Cond).Wait" => SyncOp::CondWait,
        "(*sync.Cond).Signal" => SyncOp::Signal,
        "(*sync.Cond).Broadcast" => SyncOp::Broadcast,
        _ => return None,
    })
}

/// Recognize a call to a modelled `sync` API.
pub fn classify_call(call: &CallCommon, program: &Program) -> Option<SyncCall> {
    match &call.callee {
        Callee::Static { func } => {
            let op = static_sync_op(func)?;
            let (&receiver, rest) = call.args.split_first()?;
            Some(SyncCall {
                op,
                receiver,
                args: rest.to_vec(),
                via_locker: false,
            })
        }
        Callee::Invoke { recv, method } if call.args.is_empty() => {
            let op = match method.as_str() {
                "Lock" => SyncOp::Lock,
                "Unlock" => SyncOp::Unlock,
                _ => return None,
            };
            let recv_type = program.value_type(*recv);
            let types = &program.types;
            let is_locker = types.name(recv_type) == "sync.Locker" || types.is_interface(recv_type);
            is_locker.then(|| SyncCall {
                op,
                receiver: *recv,
                args: vec![],
                via_locker: true,
            })
        }
        _ => None,
    }
}

/// Communication performed by an instruction, if any.
pub fn classify_op(op: &Op, program: &Program) -> Option<Comm> {
    match op {
        Op::Send { chan, x } => Some(Comm::Send {
            chan: *chan,
            value: *x,
        }),
        Op::UnOp {
            operator: UnaryOp::Recv,
            x,
            comma_ok,
        } => Some(Comm::Recv {
            chan: *x,
            comma_ok: *comma_ok,
        }),
        Op::Call { call } | Op::Defer { call } => match &call.callee {
            Callee::Builtin { name } if name == "close" => {
                call.args.first().map(|&chan| Comm::Close { chan })
            }
            _ => classify_call(call, program).map(Comm::Sync),
        },
        Op::Select { states, blocking } => Some(Comm::Select {
            arms: states
                .iter()
                .map(|s| SelectOp {
                    dir: s.dir,
                    chan: s.chan,
                    value: s.send,
                })
                .collect(),
            blocking: *blocking,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goat_ir::builder::{ProgramBuilder, SelectArm, T_LOCKER, T_UNIT};

    #[test]
    fn test_classify_sync_and_channel_ops() {
        let mut b = ProgramBuilder::new();
        let mut ids = vec![];
        b.func("main.main", &[], |f| {
            let ch = f.make_chan(1);
            let mu = f.new_mutex();
            let wg = f.new_wait_group();
            ids.push(f.lock(mu));
            ids.push(f.wg_add(wg, 2));
            ids.push(f.recv(ch));
            let one = f.int(1);
            ids.push(f.select(&[SelectArm::Send(ch, one)], false));
            let l = f.push(T_LOCKER, Op::MakeInterface { x: mu });
            ids.push(f.invoke(l, "Unlock", &[], T_UNIT));
            ids.push(f.builtin("close", &[ch], T_UNIT));
            ids.push(f.call("main.other", &[], T_UNIT));
            f.ret(&[]);
        });
        b.func("main.other", &[], |f| f.ret(&[]));
        let p = b.build();
        let comm = |v: ValueId| classify_op(&p.instruction(v).unwrap().op, &p);

        match comm(ids[0]) {
            Some(Comm::Sync(call)) => assert_eq!(call.op, SyncOp::Lock),
            other => panic!("expected lock, got {other:?}"),
        }
        match comm(ids[1]) {
            Some(Comm::Sync(call)) => {
                assert_eq!(call.op, SyncOp::WgAdd);
                assert!(call.delta().is_some());
            }
            other => panic!("expected add, got {other:?}"),
        }
        assert!(matches!(comm(ids[2]), Some(Comm::Recv { comma_ok: false, .. })));
        match comm(ids[3]) {
            Some(c @ Comm::Select { .. }) => {
                assert_eq!(c.operands().len(), 1);
                assert!(!c.may_block());
            }
            other => panic!("expected select, got {other:?}"),
        }
        match comm(ids[4]) {
            Some(Comm::Sync(call)) => assert!(call.via_locker && call.op == SyncOp::Unlock),
            other => panic!("expected locker unlock, got {other:?}"),
        }
        assert!(matches!(comm(ids[5]), Some(Comm::Close { .. })));
        assert_eq!(comm(ids[6]), None);
    }
}
