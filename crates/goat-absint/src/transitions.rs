//! The transition relation between superlocations.
//!
//! Every goroutine of a superlocation sits at a stop point. A transition
//! progresses one goroutine (two for a rendezvous, more for a broadcast)
//! past its stop point and updates memory. The driver then expands the
//! progressed goroutines to their next stop points.

use std::fmt;

use goat_cfg::{Comm, Node, NodeId, NodeKind, SyncCall, SyncOp};
use goat_ir::ir::{ChanDir, Op, ValueId};
use goat_lattice::{Flat, Interval, Lattice, Powerset};

use crate::context::AnalysisContext;
use crate::error::AnalysisError;
use crate::eval::Targets;
use crate::goro::{is_root_exit, Context, CtrLoc, Goro, Superloc};
use crate::memory::{HeapLoc, Location};
use crate::state::State;
use crate::value::{AbstractValue, ChanValue, CondValue, MutexValue, RwMutexValue};

/// Runtime panics the analysis reports when they are certain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub enum PanicReason {
    SendOnClosed,
    CloseOfClosed,
    CloseOfNil,
    UnlockOfUnlocked,
    RUnlockOfUnlocked,
    NegativeWaitGroup,
}

impl fmt::Display for PanicReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            PanicReason::SendOnClosed => "send on closed channel",
            PanicReason::CloseOfClosed => "close of closed channel",
            PanicReason::CloseOfNil => "close of nil channel",
            PanicReason::UnlockOfUnlocked => "unlock of unlocked mutex",
            PanicReason::RUnlockOfUnlocked => "RUnlock of unlocked RWMutex",
            PanicReason::NegativeWaitGroup => "negative WaitGroup counter",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PanicEvent {
    pub goro: Goro,
    pub node: NodeId,
    pub reason: PanicReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    Send,
    Receive,
    Rendezvous,
    Close,
    SelectDefault,
    Sync(SyncOp),
    /// A signalled goroutine leaves `Cond.Wait`.
    Wake,
    Spawn,
    Terminate,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionKind::Send => write!(f, "send"),
            TransitionKind::Receive => write!(f, "receive"),
            TransitionKind::Rendezvous => write!(f, "rendezvous"),
            TransitionKind::Close => write!(f, "close"),
            TransitionKind::SelectDefault => write!(f, "select default"),
            TransitionKind::Sync(op) => write!(f, "{op:?}"),
            TransitionKind::Wake => write!(f, "wake"),
            TransitionKind::Spawn => write!(f, "go"),
            TransitionKind::Terminate => write!(f, "terminate"),
        }
    }
}

/// Edge label of the superlocation graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transition {
    pub kind: TransitionKind,
    pub progressed: Vec<Goro>,
    pub panic: Option<PanicEvent>,
}

impl Transition {
    fn new(kind: TransitionKind, progressed: Vec<Goro>) -> Self {
        Self {
            kind,
            progressed,
            panic: None,
        }
    }

    fn panicking(kind: TransitionKind, event: PanicEvent) -> Self {
        Self {
            kind,
            progressed: vec![event.goro],
            panic: Some(event),
        }
    }
}

/// A transition before the progressed goroutines are expanded. A move to
/// `None` terminates the goroutine.
#[derive(Debug, Clone)]
pub struct Step {
    pub moves: Vec<(Goro, Option<CtrLoc>)>,
    pub state: State,
    pub transition: Transition,
}

/// A goroutine ready to send or receive, possibly as a select arm.
struct Offer {
    goro: Goro,
    cl: CtrLoc,
    chan: ValueId,
    /// The sent value; `None` for receives.
    send: Option<AbstractValue>,
    arm: Option<usize>,
    next: NodeId,
}

/// What a channel operand denotes.
enum ChanTarget {
    Record(HeapLoc, ChanValue),
    /// A channel outside the focus or with unknown identity.
    Unknown,
}

impl<'a> AnalysisContext<'a> {
    /// Enabled transitions out of `(sl, state)`.
    pub fn transitions(&self, sl: Superloc, state: &State) -> Result<Vec<Step>, AnalysisError> {
        let cfg = self.cfg();
        if self.is_crashed(sl) {
            return Ok(vec![]);
        }
        let mut steps = vec![];
        let mut offers = vec![];
        let mut defaults = vec![];
        for (goro, cl) in sl.iter() {
            let node = cfg.node(cl.node);
            if is_root_exit(cfg, goro, cl) {
                let mut s = state.clone();
                s.forget(goro);
                steps.push(Step {
                    moves: vec![(goro, None)],
                    state: s,
                    transition: Transition::new(TransitionKind::Terminate, vec![goro]),
                });
                continue;
            }
            if let Some(Op::Go { .. }) = self.node_op(node) {
                steps.extend(self.spawn(sl, state, goro, cl, node)?);
                continue;
            }
            let Some(comm) = cfg.comm(cl.node) else {
                return Err(AnalysisError::MalformedConfiguration {
                    superloc: sl.describe(cfg, self.program),
                    message: format!("{goro:?} is parked at a non-communicating node"),
                });
            };
            let next = node.succs.first().copied().unwrap_or(cl.node);
            match comm {
                Comm::Send { chan, value } => offers.push(Offer {
                    goro,
                    cl,
                    chan: *chan,
                    send: Some(self.operand(&state.memory, goro, cl.ctx, *value)),
                    arm: None,
                    next,
                }),
                Comm::Recv { chan, .. } => offers.push(Offer {
                    goro,
                    cl,
                    chan: *chan,
                    send: None,
                    arm: None,
                    next,
                }),
                Comm::Close { chan } => steps.extend(self.close(state, goro, cl, *chan, next)),
                Comm::Select { arms, blocking } => {
                    for (i, arm) in arms.iter().enumerate() {
                        let send = match (arm.dir, arm.value) {
                            (ChanDir::Send, Some(v)) => {
                                Some(self.operand(&state.memory, goro, cl.ctx, v))
                            }
                            (ChanDir::Send, None) => Some(AbstractValue::Top),
                            _ => None,
                        };
                        offers.push(Offer {
                            goro,
                            cl,
                            chan: arm.chan,
                            send,
                            arm: Some(i),
                            next: node.succs.get(i).copied().unwrap_or(cl.node),
                        });
                    }
                    if !*blocking {
                        defaults.push((goro, cl, node));
                    }
                }
                Comm::Sync(call) => steps.extend(self.sync(sl, state, goro, cl, node, call)),
            }
        }

        for offer in &offers {
            steps.extend(self.solo(state, offer));
        }
        for sender in offers.iter().filter(|o| o.send.is_some()) {
            for receiver in offers.iter().filter(|o| o.send.is_none()) {
                if sender.goro != receiver.goro {
                    steps.extend(self.rendezvous(state, sender, receiver));
                }
            }
        }
        for (goro, cl, node) in defaults {
            let arms: Vec<&Offer> = offers.iter().filter(|o| o.goro == goro).collect();
            if arms.iter().any(|o| self.surely_enabled(state, o)) {
                continue;
            }
            let mut s = state.clone();
            self.bind_select(&mut s, goro, cl, None, None);
            let next = node.succs.last().copied().unwrap_or(cl.node);
            steps.push(Step {
                moves: vec![(goro, Some(cl.at(next)))],
                state: s,
                transition: Transition::new(TransitionKind::SelectDefault, vec![goro]),
            });
        }
        Ok(steps)
    }

    /// Some goroutine's panic reached its outermost frame. A goroutine
    /// leaving through `Goexit` terminates normally instead.
    pub fn is_crashed(&self, sl: Superloc) -> bool {
        let cfg = self.cfg();
        sl.iter().any(|(g, cl)| {
            is_root_exit(cfg, g, cl)
                && cfg.node(cl.node).kind == NodeKind::PanicExit
                && (cl.panicked || !cl.exiting)
        })
    }

    fn node_op(&self, node: &Node) -> Option<&'a Op> {
        node.instr
            .and_then(|i| self.program.instruction(i))
            .map(|i| &i.op)
    }

    /// Leave a stop point, consuming the charge of a deferred operation.
    fn leave(&self, state: &mut State, goro: Goro, cl: CtrLoc, next: NodeId) -> CtrLoc {
        let node = self.cfg().node(cl.node);
        if let (NodeKind::DeferCall { .. }, Some(defer)) = (node.kind, node.instr) {
            state.set_charge(goro, defer, cl.ctx, false);
        }
        cl.at(next)
    }

    fn panic_step(&self, state: &State, goro: Goro, cl: CtrLoc, kind: TransitionKind, reason: PanicReason) -> Option<Step> {
        let node = self.cfg().node(cl.node);
        let unwind = self.cfg().function(node.func)?.unwind;
        let mut s = state.clone();
        self.leave(&mut s, goro, cl, unwind);
        Some(Step {
            moves: vec![(goro, Some(CtrLoc::new(unwind, cl.ctx, true)))],
            state: s,
            transition: Transition::panicking(
                kind,
                PanicEvent {
                    goro,
                    node: cl.node,
                    reason,
                },
            ),
        })
    }

    /// Runtime fault that is not reported, such as locking a nil mutex.
    fn fault_step(&self, state: &State, goro: Goro, cl: CtrLoc, kind: TransitionKind) -> Option<Step> {
        let node = self.cfg().node(cl.node);
        let unwind = self.cfg().function(node.func)?.unwind;
        Some(Step {
            moves: vec![(goro, Some(CtrLoc::new(unwind, cl.ctx, true)))],
            state: state.clone(),
            transition: Transition::new(kind, vec![goro]),
        })
    }

    fn write_record(&self, state: &mut State, loc: &HeapLoc, v: AbstractValue) {
        let strong = state.memory.is_strong(loc);
        state.memory.store(loc, &v, strong);
    }

    /// Channel records a channel operand may denote; nil denotes nothing.
    fn chan_targets(&self, state: &State, goro: Goro, ctx: Context, chan: ValueId) -> Vec<ChanTarget> {
        let value = self.operand(&state.memory, goro, ctx, chan);
        match Targets::of(&value) {
            Targets::Unknown => vec![ChanTarget::Unknown],
            Targets::Known { locs, .. } => locs
                .into_iter()
                .map(|loc| match state.memory.get(&Location::Heap(loc.clone())) {
                    Some(AbstractValue::Chan(c)) => ChanTarget::Record(loc, c.clone()),
                    _ => ChanTarget::Unknown,
                })
                .collect(),
        }
    }

    /// Bind the result of a receive or select at `cl`.
    fn bind_received(
        &self,
        state: &mut State,
        offer: &Offer,
        value: AbstractValue,
        ok: AbstractValue,
    ) {
        if offer.arm.is_some() {
            self.bind_select(state, offer.goro, offer.cl, offer.arm, Some((value, ok)));
            return;
        }
        let node = self.cfg().node(offer.cl.node);
        let (Some(instr), Some(Comm::Recv { comma_ok, .. })) = (node.instr, self.cfg().comm(offer.cl.node)) else {
            return;
        };
        let bound = match comma_ok {
            true => AbstractValue::Tuple(vec![value, ok]),
            false => value,
        };
        state.memory.set_local(offer.goro, offer.cl.ctx, instr, bound);
    }

    /// Select result tuple: chosen index, receive flag and one slot per
    /// receiving arm.
    fn bind_select(
        &self,
        state: &mut State,
        goro: Goro,
        cl: CtrLoc,
        arm: Option<usize>,
        received: Option<(AbstractValue, AbstractValue)>,
    ) {
        let node = self.cfg().node(cl.node);
        let (Some(instr), Some(Comm::Select { arms, .. })) = (node.instr, self.cfg().comm(cl.node)) else {
            return;
        };
        let index = arm.map_or(-1, |i| i as i64);
        let (value, ok) = match received {
            Some((v, ok)) => (Some(v), ok),
            None => (None, AbstractValue::bool(false)),
        };
        let mut tuple = vec![AbstractValue::int(index), ok];
        for (i, a) in arms.iter().enumerate() {
            if !matches!(a.dir, ChanDir::Recv) {
                continue;
            }
            let slot = match (&value, arm == Some(i)) {
                (Some(v), true) => v.clone(),
                _ => self.zero_value(self.chan_elem(a.chan)),
            };
            tuple.push(slot);
        }
        state.memory.set_local(goro, cl.ctx, instr, AbstractValue::Tuple(tuple));
    }

    fn bind_sent(&self, state: &mut State, offer: &Offer) {
        if offer.arm.is_some() {
            self.bind_select(state, offer.goro, offer.cl, offer.arm, None);
        }
    }

    /// Whether the offer can proceed in every concretization.
    fn surely_enabled(&self, state: &State, offer: &Offer) -> bool {
        let value = self.operand(&state.memory, offer.goro, offer.cl.ctx, offer.chan);
        let targets = self.chan_targets(state, offer.goro, offer.cl.ctx, offer.chan);
        if targets.is_empty() || matches!(Targets::of(&value), Targets::Known { nil: true, .. }) {
            return false;
        }
        targets.iter().all(|t| match t {
            ChanTarget::Unknown => false,
            ChanTarget::Record(_, c) => match offer.send {
                Some(_) => c.is_closed() || (c.must_buffer() && c.closed.is(&false)),
                None => c.must_have_messages() || c.is_closed(),
            },
        })
    }

    /// Transitions of one goroutine on its own: buffered sends and
    /// receives, receives from closed channels and unknown channels.
    fn solo(&self, state: &State, offer: &Offer) -> Vec<Step> {
        let mut out = vec![];
        let goro = offer.goro;
        let kind = match offer.send {
            Some(_) => TransitionKind::Send,
            None => TransitionKind::Receive,
        };
        for target in self.chan_targets(state, goro, offer.cl.ctx, offer.chan) {
            let mut s = state.clone();
            match (target, &offer.send) {
                (ChanTarget::Unknown, Some(_)) => self.bind_sent(&mut s, offer),
                (ChanTarget::Unknown, None) => {
                    self.bind_received(&mut s, offer, AbstractValue::Top, AbstractValue::unknown_bool())
                }
                (ChanTarget::Record(loc, c), Some(v)) => {
                    if c.is_closed() {
                        out.extend(self.panic_step(state, goro, offer.cl, kind, PanicReason::SendOnClosed));
                        continue;
                    }
                    if !c.may_buffer() {
                        continue;
                    }
                    self.write_record(&mut s, &loc, AbstractValue::Chan(c.after_send(v)));
                    self.bind_sent(&mut s, offer);
                }
                (ChanTarget::Record(loc, c), None) => {
                    if c.may_have_messages() {
                        let mut s = s.clone();
                        let payload = match *c.payload {
                            AbstractValue::Bot => AbstractValue::Top,
                            ref v => v.clone(),
                        };
                        self.write_record(&mut s, &loc, AbstractValue::Chan(c.after_receive()));
                        self.bind_received(&mut s, offer, payload, AbstractValue::bool(true));
                        let to = self.leave(&mut s, goro, offer.cl, offer.next);
                        out.push(Step {
                            moves: vec![(goro, Some(to))],
                            state: s,
                            transition: Transition::new(kind, vec![goro]),
                        });
                    }
                    if !(c.may_be_closed() && c.buffer.contains(0)) {
                        continue;
                    }
                    let zero = self.zero_value(self.chan_elem(offer.chan));
                    self.bind_received(&mut s, offer, zero, AbstractValue::bool(false));
                }
            }
            let to = self.leave(&mut s, goro, offer.cl, offer.next);
            out.push(Step {
                moves: vec![(goro, Some(to))],
                state: s,
                transition: Transition::new(kind, vec![goro]),
            });
        }
        out
    }

    /// An unbuffered handoff between two goroutines.
    fn rendezvous(&self, state: &State, sender: &Offer, receiver: &Offer) -> Vec<Step> {
        let Some(value) = &sender.send else {
            return vec![];
        };
        let senders = self.chan_targets(state, sender.goro, sender.cl.ctx, sender.chan);
        let receivers = self.chan_targets(state, receiver.goro, receiver.cl.ctx, receiver.chan);
        let mut out = vec![];
        for target in senders {
            let ChanTarget::Record(loc, c) = target else {
                continue;
            };
            let shared = receivers
                .iter()
                .any(|r| matches!(r, ChanTarget::Record(other, _) if *other == loc));
            if !shared || !c.may_be_synchronous() || c.is_closed() {
                continue;
            }
            let mut s = state.clone();
            self.bind_sent(&mut s, sender);
            self.bind_received(&mut s, receiver, value.clone(), AbstractValue::bool(true));
            let to_sender = self.leave(&mut s, sender.goro, sender.cl, sender.next);
            let to_receiver = self.leave(&mut s, receiver.goro, receiver.cl, receiver.next);
            out.push(Step {
                moves: vec![(sender.goro, Some(to_sender)), (receiver.goro, Some(to_receiver))],
                state: s,
                transition: Transition::new(
                    TransitionKind::Rendezvous,
                    vec![sender.goro, receiver.goro],
                ),
            });
        }
        out
    }

    fn close(&self, state: &State, goro: Goro, cl: CtrLoc, chan: ValueId, next: NodeId) -> Vec<Step> {
        let kind = TransitionKind::Close;
        if self.operand(&state.memory, goro, cl.ctx, chan).is_nil() {
            return self
                .panic_step(state, goro, cl, kind, PanicReason::CloseOfNil)
                .into_iter()
                .collect();
        }
        let mut out = vec![];
        for target in self.chan_targets(state, goro, cl.ctx, chan) {
            let mut s = state.clone();
            if let ChanTarget::Record(loc, c) = target {
                if c.is_closed() {
                    out.extend(self.panic_step(state, goro, cl, kind, PanicReason::CloseOfClosed));
                    continue;
                }
                self.write_record(&mut s, &loc, AbstractValue::Chan(c.after_close()));
            }
            let to = self.leave(&mut s, goro, cl, next);
            out.push(Step {
                moves: vec![(goro, Some(to))],
                state: s,
                transition: Transition::new(kind, vec![goro]),
            });
        }
        out
    }

    /// Heap records a primitive operand may denote. `None` when unknown.
    pub(crate) fn records(&self, state: &State, value: &AbstractValue) -> Option<Vec<(HeapLoc, AbstractValue)>> {
        match Targets::of(value) {
            Targets::Unknown => None,
            Targets::Known { locs, .. } => Some(
                locs.into_iter()
                    .map(|loc| {
                        let record = state
                            .memory
                            .get(&Location::Heap(loc.clone()))
                            .cloned()
                            .unwrap_or(AbstractValue::Top);
                        (loc, record)
                    })
                    .collect(),
            ),
        }
    }

    fn sync(
        &self,
        sl: Superloc,
        state: &State,
        goro: Goro,
        cl: CtrLoc,
        node: &Node,
        call: &SyncCall,
    ) -> Vec<Step> {
        let next = node.succs.first().copied().unwrap_or(cl.node);
        let kind = TransitionKind::Sync(call.op);
        let receiver = self.operand(&state.memory, goro, cl.ctx, call.receiver);
        match (node.kind, call.op) {
            (NodeKind::CondWait, _) => {
                let locker = self.cond_locker(state, goro, cl.ctx, call.receiver);
                let mut steps = self.lock_op(state, goro, cl, next, &locker, SyncOp::Unlock, kind);
                for step in steps.iter_mut().filter(|s| s.transition.panic.is_none()) {
                    self.update_conds(&mut step.state, &receiver, |c| c.waiters.insert(goro));
                }
                steps
            }
            (NodeKind::CondWaking, _) => {
                let locker = self.cond_locker(state, goro, cl.ctx, call.receiver);
                self.lock_op(state, goro, cl, next, &locker, SyncOp::Lock, TransitionKind::Wake)
            }
            // Parked until a signal moves it.
            (NodeKind::CondWaiting, _) => vec![],
            (_, SyncOp::Signal | SyncOp::Broadcast) => {
                self.signal(sl, state, goro, cl, next, &receiver, call.op)
            }
            (_, SyncOp::WgAdd | SyncOp::WgDone | SyncOp::WgWait) => {
                self.wait_group(state, goro, cl, next, &receiver, call)
            }
            (_, op) => self.lock_op(state, goro, cl, next, &receiver, op, kind),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn lock_op(
        &self,
        state: &State,
        goro: Goro,
        cl: CtrLoc,
        next: NodeId,
        mutex: &AbstractValue,
        op: SyncOp,
        kind: TransitionKind,
    ) -> Vec<Step> {
        let proceed = |s: State| -> Step {
            let mut s = s;
            let to = self.leave(&mut s, goro, cl, next);
            Step {
                moves: vec![(goro, Some(to))],
                state: s,
                transition: Transition::new(kind, vec![goro]),
            }
        };
        let (mutex, op) = match (mutex.read_locker(), op) {
            (Some(rw), SyncOp::Lock) => (rw, SyncOp::RLock),
            (Some(rw), SyncOp::Unlock) => (rw, SyncOp::RUnlock),
            _ => (mutex, op),
        };
        let Some(records) = self.records(state, mutex) else {
            return vec![proceed(state.clone())];
        };
        if records.is_empty() {
            // Nil mutex: a nil dereference.
            return match mutex.is_nil() {
                true => self.fault_step(state, goro, cl, kind).into_iter().collect(),
                false => vec![],
            };
        }
        let mut out = vec![];
        for (loc, record) in records {
            let mut s = state.clone();
            let updated = match (&record, op) {
                (AbstractValue::Mutex(m), SyncOp::Lock) => {
                    if !m.locked.may_be(&false) {
                        continue;
                    }
                    AbstractValue::Mutex(MutexValue::held_by(goro))
                }
                (AbstractValue::Mutex(m), SyncOp::Unlock) => {
                    if m.locked.is(&false) {
                        out.extend(self.panic_step(state, goro, cl, kind, PanicReason::UnlockOfUnlocked));
                        continue;
                    }
                    AbstractValue::Mutex(MutexValue::unlocked())
                }
                (AbstractValue::RwMutex(rw), SyncOp::Lock) => {
                    if !rw.writer.may_be(&false) || !rw.readers.contains(0) {
                        continue;
                    }
                    AbstractValue::RwMutex(RwMutexValue {
                        writer: Flat::Elem(true),
                        readers: Interval::constant(0),
                    })
                }
                (AbstractValue::RwMutex(rw), SyncOp::Unlock) => {
                    if rw.writer.is(&false) {
                        out.extend(self.panic_step(state, goro, cl, kind, PanicReason::UnlockOfUnlocked));
                        continue;
                    }
                    AbstractValue::RwMutex(RwMutexValue {
                        writer: Flat::Elem(false),
                        readers: rw.readers,
                    })
                }
                (AbstractValue::RwMutex(rw), SyncOp::RLock) => {
                    if !rw.writer.may_be(&false) {
                        continue;
                    }
                    AbstractValue::RwMutex(RwMutexValue {
                        writer: Flat::Elem(false),
                        readers: rw.readers.add_constant(1),
                    })
                }
                (AbstractValue::RwMutex(rw), SyncOp::RUnlock) => {
                    if rw.readers.as_constant() == Some(0) {
                        out.extend(self.panic_step(state, goro, cl, kind, PanicReason::RUnlockOfUnlocked));
                        continue;
                    }
                    AbstractValue::RwMutex(RwMutexValue {
                        writer: rw.writer.clone(),
                        readers: rw.readers.restrict(1, i64::MAX).add_constant(-1),
                    })
                }
                _ => {
                    out.push(proceed(s));
                    continue;
                }
            };
            self.write_record(&mut s, &loc, updated);
            out.push(proceed(s));
        }
        out
    }

    fn wait_group(
        &self,
        state: &State,
        goro: Goro,
        cl: CtrLoc,
        next: NodeId,
        wg: &AbstractValue,
        call: &SyncCall,
    ) -> Vec<Step> {
        let kind = TransitionKind::Sync(call.op);
        let proceed = |mut s: State| -> Step {
            let to = self.leave(&mut s, goro, cl, next);
            Step {
                moves: vec![(goro, Some(to))],
                state: s,
                transition: Transition::new(kind, vec![goro]),
            }
        };
        let Some(records) = self.records(state, wg) else {
            return vec![proceed(state.clone())];
        };
        let delta = match call.op {
            SyncOp::WgDone => Interval::constant(-1),
            _ => call
                .delta()
                .map(|d| self.operand(&state.memory, goro, cl.ctx, d).as_interval())
                .unwrap_or_else(Interval::top),
        };
        let mut out = vec![];
        for (loc, record) in records {
            let mut s = state.clone();
            let AbstractValue::WaitGroup(counter) = record else {
                out.push(proceed(s));
                continue;
            };
            match call.op {
                SyncOp::WgWait => {
                    if !counter.contains(0) {
                        continue;
                    }
                    self.write_record(&mut s, &loc, AbstractValue::WaitGroup(Interval::constant(0)));
                }
                _ => {
                    let updated = counter.add(&delta);
                    if matches!(updated.bounds(), Some((_, hi)) if hi < 0) {
                        out.extend(self.panic_step(state, goro, cl, kind, PanicReason::NegativeWaitGroup));
                        continue;
                    }
                    let updated = updated.restrict(0, i64::MAX);
                    self.write_record(&mut s, &loc, AbstractValue::WaitGroup(updated));
                }
            }
            out.push(proceed(s));
        }
        out
    }

    /// Rewrite every condition-variable record `cond` may denote.
    fn update_conds(&self, state: &mut State, cond: &AbstractValue, update: impl Fn(&mut CondValue)) {
        let Some(records) = self.records(state, cond) else {
            return;
        };
        for (loc, record) in records {
            if let AbstractValue::Cond(mut c) = record {
                update(&mut c);
                self.write_record(state, &loc, AbstractValue::Cond(c));
            }
        }
    }

    /// Goroutines the records of `cond` list as waiting; `None` when some
    /// record is unknown.
    fn queued_waiters(&self, state: &State, cond: &AbstractValue) -> Option<Powerset<Goro>> {
        let mut queued = Powerset::default();
        for (_, record) in self.records(state, cond)? {
            match record {
                AbstractValue::Cond(c) => queued = queued.join(&c.waiters),
                _ => return None,
            }
        }
        Some(queued)
    }

    /// `Signal` wakes one parked waiter of the same condition variable,
    /// `Broadcast` all of them. Only goroutines queued on the record by
    /// `Wait` can be woken.
    #[allow(clippy::too_many_arguments)]
    fn signal(
        &self,
        sl: Superloc,
        state: &State,
        goro: Goro,
        cl: CtrLoc,
        next: NodeId,
        cond: &AbstractValue,
        op: SyncOp,
    ) -> Vec<Step> {
        let cfg = self.cfg();
        let kind = TransitionKind::Sync(op);
        let locs: Vec<HeapLoc> = match Targets::of(cond) {
            Targets::Known { locs, .. } => locs,
            Targets::Unknown => vec![],
        };
        let queued = self.queued_waiters(state, cond);
        let waiters: Vec<(Goro, CtrLoc)> = sl
            .iter()
            .filter(|(g, w)| {
                *g != goro
                    && queued.as_ref().map_or(true, |q| q.may_contain(g))
                    && cfg.node(w.node).kind == NodeKind::CondWaiting
                    && match cfg.comm(w.node) {
                        Some(Comm::Sync(c)) => {
                            let v = self.operand(&state.memory, *g, w.ctx, c.receiver);
                            match Targets::of(&v) {
                                Targets::Known { locs: theirs, .. } => {
                                    theirs.iter().any(|l| locs.contains(l))
                                }
                                Targets::Unknown => true,
                            }
                        }
                        _ => false,
                    }
            })
            .collect();

        let mut base = state.clone();
        let to = self.leave(&mut base, goro, cl, next);
        if waiters.is_empty() {
            return vec![Step {
                moves: vec![(goro, Some(to))],
                state: base,
                transition: Transition::new(kind, vec![goro]),
            }];
        }
        let groups: Vec<Vec<(Goro, CtrLoc)>> = match op {
            SyncOp::Broadcast => vec![waiters],
            _ => waiters.into_iter().map(|w| vec![w]).collect(),
        };
        groups
            .into_iter()
            .map(|group| {
                let mut moves = vec![(goro, Some(to))];
                let mut progressed = vec![goro];
                let mut s = base.clone();
                for (g, w) in group {
                    let woken = cfg.node(w.node).succs.first().copied().unwrap_or(w.node);
                    moves.push((g, Some(w.at(woken))));
                    progressed.push(g);
                    self.update_conds(&mut s, cond, |c| c.waiters.remove(&g));
                }
                Step {
                    moves,
                    state: s,
                    transition: Transition::new(kind, progressed),
                }
            })
            .collect()
    }

    /// `go f(args)`: start a child goroutine per relevant callee.
    fn spawn(
        &self,
        sl: Superloc,
        state: &State,
        goro: Goro,
        cl: CtrLoc,
        node: &Node,
    ) -> Result<Vec<Step>, AnalysisError> {
        let (Some(site), Some(Op::Go { call })) = (node.instr, self.node_op(node)) else {
            return Ok(vec![]);
        };
        let next = node.succs.first().copied().unwrap_or(cl.node);
        let args: Vec<AbstractValue> = call
            .actuals()
            .iter()
            .map(|a| self.operand(&state.memory, goro, cl.ctx, *a))
            .collect();
        let mut out = vec![];
        let targets = self.targets(state, goro, cl.ctx, site, call);
        for target in targets.iter().filter(|t| self.enters(t.func)) {
            let mut child = goro.spawn(site, target.func);
            if child.is_circular() {
                child = child.radix();
            }
            let index = sl.free_index(child);
            if index as usize >= self.options.goroutine_bound {
                let site = self
                    .program
                    .span_of(site)
                    .map_or_else(|| format!("value {site}"), |s| format!("{}:{}", s.file, s.start_line));
                return Err(AnalysisError::UnboundedSpawn {
                    site,
                    bound: self.options.goroutine_bound,
                });
            }
            let child = child.with_index(index);
            let mut s = state.clone();
            s.forget(child);
            let Some(entry) = self.enter_frame(&mut s, child, Context::root(), target, &args) else {
                continue;
            };
            out.push(Step {
                moves: vec![(goro, Some(cl.at(next))), (child, Some(entry))],
                state: s,
                transition: Transition::new(TransitionKind::Spawn, vec![goro, child]),
            });
        }
        if targets.iter().any(|t| !self.enters(t.func)) || out.is_empty() {
            out.push(Step {
                moves: vec![(goro, Some(cl.at(next)))],
                state: state.clone(),
                transition: Transition::new(TransitionKind::Spawn, vec![goro]),
            });
        }
        Ok(out)
    }
}
