use goat_ir::ir::ValueId;
use goat_ir::FuncId;
use goat_lattice::{Flat, Lattice, MapLattice, Powerset, Widen};
use rustc_hash::FxHashSet;

use crate::goro::{Context, CtrLoc, Goro};
use crate::memory::Memory;

/// A callee frame: goroutine, function and call context.
pub type Frame = (Goro, FuncId, Context);

/// Memory plus the control state that lives beside it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    pub memory: Memory,
    /// Post-call locations a frame returns to.
    pub continuations: MapLattice<Frame, Powerset<CtrLoc>>,
    /// Whether each `defer` of a frame has been executed.
    pub charges: MapLattice<(Goro, ValueId, Context), Flat<bool>>,
}

impl State {
    pub fn new(memory: Memory) -> Self {
        Self {
            memory,
            ..Self::default()
        }
    }

    pub fn charge(&self, goro: Goro, defer: ValueId, ctx: Context) -> Flat<bool> {
        self.charges.get_or_bottom(&(goro, defer, ctx))
    }

    pub fn set_charge(&mut self, goro: Goro, defer: ValueId, ctx: Context, charged: bool) {
        self.charges.insert_mut((goro, defer, ctx), Flat::Elem(charged));
    }

    pub fn continuations(&self, frame: &Frame) -> Powerset<CtrLoc> {
        self.continuations.get_or_bottom(frame)
    }

    pub fn add_continuation(&mut self, frame: Frame, post: CtrLoc) {
        self.continuations = self.continuations.update(frame, &Powerset::singleton(post));
    }

    /// Drop the registers, continuations and defer charges of a frame that
    /// has returned. `registers` are the function's parameters, free
    /// variables and instructions; `defers` its defer statements.
    pub fn pop_frame(&mut self, frame: Frame, registers: &FxHashSet<ValueId>, defers: &[ValueId]) {
        let (goro, func, ctx) = frame;
        self.memory.forget_frame(goro, func, ctx, registers);
        self.continuations = self.continuations.retain(|f, _| *f != frame);
        self.charges = self
            .charges
            .retain(|(g, d, c), _| !(*g == goro && *c == ctx && defers.contains(d)));
    }

    /// Drop everything a terminated goroutine left behind.
    pub fn forget(&mut self, goro: Goro) {
        self.memory.forget(goro);
        self.continuations = self.continuations.retain(|(g, _, _), _| *g != goro);
        self.charges = self.charges.retain(|(g, _, _), _| *g != goro);
    }
}

impl Lattice for State {
    fn bottom() -> Self {
        Self::default()
    }

    fn top() -> Self {
        Self {
            memory: Memory::top(),
            continuations: MapLattice::top(),
            charges: MapLattice::top(),
        }
    }

    fn join(&self, other: &Self) -> Self {
        Self {
            memory: self.memory.join(&other.memory),
            continuations: self.continuations.join(&other.continuations),
            charges: self.charges.join(&other.charges),
        }
    }

    fn meet(&self, other: &Self) -> Self {
        Self {
            memory: self.memory.meet(&other.memory),
            continuations: self.continuations.meet(&other.continuations),
            charges: self.charges.meet(&other.charges),
        }
    }

    fn leq(&self, other: &Self) -> bool {
        self.memory.leq(&other.memory)
            && self.continuations.leq(&other.continuations)
            && self.charges.leq(&other.charges)
    }
}

impl Widen for State {
    fn widen(&self, next: &Self) -> Self {
        Self {
            memory: self.memory.widen(&next.memory),
            continuations: self.continuations.join(&next.continuations),
            charges: self.charges.join(&next.charges),
        }
    }
}
