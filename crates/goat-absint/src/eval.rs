//! Abstract evaluation of SSA values and non-communicating instructions.

use std::collections::BTreeMap;
use std::fmt;

use goat_ir::ir::{BinaryOp, Callee, ConstValue, Instruction, Op, TypeId, UnaryOp, ValueId};
use goat_ir::models::Model;
use goat_ir::points_to::MAX_PATH_LEN;
use goat_lattice::{Flat, Lattice, Powerset};

use crate::context::AnalysisContext;
use crate::goro::{Context, Goro};
use crate::memory::{HeapLoc, Memory};
use crate::state::State;
use crate::value::{AbstractValue, ChanValue, CondValue, Const, InterfaceValue, Pointee};

/// A runtime panic raised while evaluating an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    NilDereference,
    NilMapWrite,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::NilDereference => write!(f, "nil pointer dereference"),
            Fault::NilMapWrite => write!(f, "assignment to entry in nil map"),
        }
    }
}

/// Heap targets of a pointer-like value.
pub(crate) enum Targets {
    /// Unknown; the value is top.
    Unknown,
    Known { locs: Vec<HeapLoc>, nil: bool },
}

impl Targets {
    pub(crate) fn of(value: &AbstractValue) -> Targets {
        match value.pointees() {
            None => Targets::Unknown,
            Some(set) => Targets::Known {
                locs: set
                    .iter()
                    .filter_map(|p| match p {
                        Pointee::Heap(loc) => Some(loc.clone()),
                        Pointee::Nil => None,
                    })
                    .collect(),
                nil: set.contains(&Pointee::Nil),
            },
        }
    }

    /// Definitely nil.
    pub(crate) fn is_nil(&self) -> bool {
        matches!(self, Targets::Known { locs, nil: true } if locs.is_empty())
    }
}

fn map_pointees(value: &AbstractValue, f: impl Fn(&HeapLoc) -> HeapLoc) -> Result<AbstractValue, Fault> {
    match Targets::of(value) {
        Targets::Unknown => Ok(AbstractValue::Top),
        Targets::Known { locs, nil } => {
            if locs.is_empty() {
                return match nil {
                    true => Err(Fault::NilDereference),
                    false => Ok(AbstractValue::Bot),
                };
            }
            Ok(AbstractValue::Pointer(
                locs.iter().map(|l| Pointee::Heap(f(l))).collect(),
            ))
        }
    }
}

fn int_op(op: BinaryOp, a: i64, b: i64) -> AbstractValue {
    let arith = |r: Option<i64>| match r {
        Some(n) => AbstractValue::int(n),
        None => AbstractValue::Basic(Flat::Top),
    };
    match op {
        BinaryOp::Add => arith(a.checked_add(b)),
        BinaryOp::Sub => arith(a.checked_sub(b)),
        BinaryOp::Mul => arith(a.checked_mul(b)),
        BinaryOp::Div => arith(a.checked_div(b)),
        BinaryOp::Rem => arith(a.checked_rem(b)),
        BinaryOp::Eq => AbstractValue::bool(a == b),
        BinaryOp::Neq => AbstractValue::bool(a != b),
        BinaryOp::Lt => AbstractValue::bool(a < b),
        BinaryOp::Leq => AbstractValue::bool(a <= b),
        BinaryOp::Gt => AbstractValue::bool(a > b),
        BinaryOp::Geq => AbstractValue::bool(a >= b),
        BinaryOp::And => AbstractValue::int(a & b),
        BinaryOp::Or => AbstractValue::int(a | b),
        BinaryOp::Other => AbstractValue::Basic(Flat::Top),
    }
}

fn is_comparison(op: BinaryOp) -> bool {
    matches!(
        op,
        BinaryOp::Eq | BinaryOp::Neq | BinaryOp::Lt | BinaryOp::Leq | BinaryOp::Gt | BinaryOp::Geq
    )
}

/// Fold a binary operation over abstract operands.
pub fn binop(op: BinaryOp, x: &AbstractValue, y: &AbstractValue) -> AbstractValue {
    use AbstractValue::Basic;
    if x.is_bottom() || y.is_bottom() {
        return AbstractValue::Bot;
    }
    match (x, y) {
        (Basic(Flat::Elem(Const::Int(a))), Basic(Flat::Elem(Const::Int(b)))) => int_op(op, *a, *b),
        (Basic(Flat::Elem(Const::Bool(a))), Basic(Flat::Elem(Const::Bool(b)))) => match op {
            BinaryOp::Eq => AbstractValue::bool(a == b),
            BinaryOp::Neq => AbstractValue::bool(a != b),
            _ => Basic(Flat::Top),
        },
        (Basic(Flat::Elem(Const::Str(a))), Basic(Flat::Elem(Const::Str(b)))) => match op {
            BinaryOp::Add => Basic(Flat::Elem(Const::Str(format!("{a}{b}")))),
            BinaryOp::Eq => AbstractValue::bool(a == b),
            BinaryOp::Neq => AbstractValue::bool(a != b),
            _ => Basic(Flat::Top),
        },
        _ if matches!(op, BinaryOp::Eq | BinaryOp::Neq) => {
            let equal = nil_equality(x, y);
            match (equal, op) {
                (Some(e), BinaryOp::Eq) => AbstractValue::bool(e),
                (Some(e), _) => AbstractValue::bool(!e),
                (None, _) => AbstractValue::unknown_bool(),
            }
        }
        _ if is_comparison(op) => AbstractValue::unknown_bool(),
        (Basic(_), Basic(_)) => Basic(Flat::Top),
        _ => AbstractValue::Top,
    }
}

/// Decide `x == y` when one side is definitely nil.
fn nil_equality(x: &AbstractValue, y: &AbstractValue) -> Option<bool> {
    let (xs, ys) = (x.pointees()?, y.pointees()?);
    let nil_only = |s: &Powerset<Pointee>| s.single() == Some(&Pointee::Nil);
    let never_nil = |s: &Powerset<Pointee>| !s.is_empty() && !s.contains(&Pointee::Nil);
    match (nil_only(&xs), nil_only(&ys)) {
        (true, true) => Some(true),
        (true, false) if never_nil(&ys) => Some(false),
        (false, true) if never_nil(&xs) => Some(false),
        _ => None,
    }
}

impl<'a> AnalysisContext<'a> {
    /// Value of an SSA operand in the frame `(goro, ctx)`.
    pub fn operand(&self, memory: &Memory, goro: Goro, ctx: Context, v: ValueId) -> AbstractValue {
        if let Some(c) = self.program.constant(v) {
            return match &c.value {
                ConstValue::Func(name) => match self.program.func_id(name) {
                    Some(f) => AbstractValue::Closure(BTreeMap::from([(f, vec![])])),
                    None => AbstractValue::Top,
                },
                other => AbstractValue::from_const(other, c.type_id, &self.program.types),
            };
        }
        if self.program.global(v).is_some() {
            return AbstractValue::pointer_to(HeapLoc::global(v));
        }
        memory
            .local(goro, ctx, v)
            .cloned()
            .unwrap_or(AbstractValue::Top)
    }

    pub fn zero_value(&self, ty: TypeId) -> AbstractValue {
        AbstractValue::zero(&self.program.types, ty, MAX_PATH_LEN)
    }

    /// Element type of the channel an operand refers to.
    pub fn chan_elem(&self, chan: ValueId) -> TypeId {
        self.program
            .types
            .elem(self.program.value_type(chan))
            .unwrap_or(0)
    }

    /// Initial record of a primitive leaf; unfocused primitives are top.
    pub fn primitive_record(&self, site: ValueId, zero: AbstractValue) -> AbstractValue {
        match self.is_focused(site) {
            true => zero,
            false => AbstractValue::Top,
        }
    }

    /// Load through a pointer value.
    pub fn load(&self, memory: &Memory, ptr: &AbstractValue, ty: TypeId) -> Result<AbstractValue, Fault> {
        match Targets::of(ptr) {
            Targets::Unknown => Ok(AbstractValue::Top),
            Targets::Known { locs, nil } => {
                if locs.is_empty() && nil {
                    return Err(Fault::NilDereference);
                }
                Ok(locs.iter().fold(AbstractValue::Bot, |acc, loc| {
                    acc.join(&memory.read(&self.program.types, loc, ty))
                }))
            }
        }
    }

    /// Store through the pointer held by operand `addr`.
    pub fn store(
        &self,
        memory: &mut Memory,
        addr: ValueId,
        ptr: &AbstractValue,
        v: &AbstractValue,
    ) -> Result<(), Fault> {
        match Targets::of(ptr) {
            Targets::Unknown => {
                for label in self.facts.points_to.labels(addr) {
                    memory.store_matching(label.site, &label.path, v);
                }
                Ok(())
            }
            Targets::Known { locs, nil } => {
                if locs.is_empty() && nil {
                    return Err(Fault::NilDereference);
                }
                let strong = locs.len() == 1 && memory.is_strong(&locs[0]);
                for loc in &locs {
                    memory.store(loc, v, strong);
                }
                Ok(())
            }
        }
    }

    /// Summarize a call to a modelled standard-library function and bind
    /// its result. `Goexit` transfers control and is left to the caller.
    pub fn apply_model(
        &self,
        state: &mut State,
        goro: Goro,
        ctx: Context,
        instr: &Instruction,
        model: Model,
        args: &[ValueId],
    ) -> Result<(), Fault> {
        let arg = |state: &State, i: usize| {
            args.get(i)
                .map(|a| self.operand(&state.memory, goro, ctx, *a))
                .unwrap_or(AbstractValue::Top)
        };
        let loc = HeapLoc::new(instr.id, Some((goro, ctx)));
        let result = match model {
            Model::NewCond => {
                let locker = arg(state, 0);
                let record = self.primitive_record(instr.id, AbstractValue::Cond(CondValue::new(locker.clone())));
                state.memory.alloc_value(loc.clone(), record);
                state.memory.alloc_value(loc.field("L"), locker);
                AbstractValue::pointer_to(loc)
            }
            Model::After => {
                let elem = self.program.types.elem(instr.type_id).unwrap_or(0);
                let chan = ChanValue::ready(self.zero_value(elem));
                let record = self.primitive_record(instr.id, AbstractValue::Chan(chan));
                state.memory.alloc_value(loc.clone(), record);
                AbstractValue::pointer_to(loc)
            }
            Model::NewTimer | Model::NewTicker => {
                let chan = match model {
                    Model::NewTimer => ChanValue::ready(AbstractValue::Top),
                    _ => ChanValue::ticking(),
                };
                let chan_loc = loc.elem();
                let record = self.primitive_record(instr.id, AbstractValue::Chan(chan));
                state.memory.alloc_value(chan_loc.clone(), record);
                state
                    .memory
                    .alloc_value(loc.field("C"), AbstractValue::pointer_to(chan_loc));
                AbstractValue::pointer_to(loc)
            }
            Model::RLocker => AbstractValue::RLocker(Box::new(arg(state, 0))),
            Model::AtomicStore => {
                if let Some(&addr) = args.first() {
                    let (ptr, v) = (arg(state, 0), arg(state, 1));
                    self.store(&mut state.memory, addr, &ptr, &v)?;
                }
                return Ok(());
            }
            Model::AtomicLoad => self.load(&state.memory, &arg(state, 0), instr.type_id)?,
            Model::Goexit => return Ok(()),
        };
        state.memory.set_local(goro, ctx, instr.id, result);
        Ok(())
    }

    /// Execute an instruction that neither communicates nor transfers
    /// control, binding its result in the frame.
    pub fn exec(&self, state: &mut State, goro: Goro, ctx: Context, instr: &Instruction) -> Result<(), Fault> {
        let types = &self.program.types;
        let val = |state: &State, v: ValueId| self.operand(&state.memory, goro, ctx, v);
        let owner = Some((goro, ctx));
        let result = match &instr.op {
            Op::Alloc { .. } => {
                let loc = HeapLoc::new(instr.id, owner);
                let elem = types.elem(instr.type_id).unwrap_or(0);
                let record = |_: &HeapLoc, zero: AbstractValue| self.primitive_record(instr.id, zero);
                state.memory.alloc(types, loc.clone(), elem, &record);
                AbstractValue::pointer_to(loc)
            }
            Op::MakeChan { size } => {
                let capacity = match val(state, *size).as_int() {
                    Some(n) => Flat::Elem(n.max(0)),
                    None => Flat::Top,
                };
                let loc = HeapLoc::new(instr.id, owner);
                let record = self.primitive_record(instr.id, AbstractValue::Chan(ChanValue::new(capacity)));
                state.memory.alloc_value(loc.clone(), record);
                AbstractValue::pointer_to(loc)
            }
            Op::MakeMap => {
                let loc = HeapLoc::new(instr.id, owner);
                state.memory.alloc_value(loc.elem(), AbstractValue::Bot);
                AbstractValue::pointer_to(loc)
            }
            Op::MakeSlice { .. } => {
                let loc = HeapLoc::new(instr.id, owner);
                let elem = types.elem(instr.type_id).unwrap_or(0);
                state.memory.alloc_value(loc.elem(), self.zero_value(elem));
                AbstractValue::pointer_to(loc)
            }
            Op::MakeInterface { x } => AbstractValue::Interface(InterfaceValue {
                dynamic: BTreeMap::from([(self.program.value_type(*x), val(state, *x))]),
                nil: false,
            }),
            Op::MakeClosure { func, bindings } => match self.program.func_id(func) {
                Some(f) => {
                    let bound = bindings.iter().map(|b| val(state, *b)).collect();
                    AbstractValue::Closure(BTreeMap::from([(f, bound)]))
                }
                None => AbstractValue::Top,
            },
            Op::FieldAddr { x, field } => map_pointees(&val(state, *x), |l| l.field(field))?,
            Op::IndexAddr { x, .. } => map_pointees(&val(state, *x), |l| l.elem())?,
            Op::Field { x, field } => val(state, *x).field(field),
            Op::Index { .. } => AbstractValue::Top,
            Op::Lookup { x, comma_ok, .. } => {
                let map = val(state, *x);
                let elem = types.elem(self.program.value_type(*x));
                let v = match (Targets::of(&map), elem) {
                    (Targets::Known { locs, .. }, Some(elem)) => {
                        let found = locs.iter().fold(AbstractValue::Bot, |acc, l| {
                            acc.join(&state.memory.read(types, &l.elem(), elem))
                        });
                        found.join(&self.zero_value(elem))
                    }
                    _ => AbstractValue::Top,
                };
                match comma_ok {
                    true => AbstractValue::Tuple(vec![v, AbstractValue::unknown_bool()]),
                    false => v,
                }
            }
            Op::Slice { x } => match val(state, *x) {
                p @ AbstractValue::Pointer(_) => p,
                _ => AbstractValue::Top,
            },
            Op::UnOp { operator, x, comma_ok } => {
                let xv = val(state, *x);
                match operator {
                    UnaryOp::Deref => self.load(&state.memory, &xv, instr.type_id)?,
                    UnaryOp::Not => match xv.as_bool() {
                        Some(b) => AbstractValue::bool(!b),
                        None if xv.is_bottom() => AbstractValue::Bot,
                        None => AbstractValue::unknown_bool(),
                    },
                    UnaryOp::Neg => match xv.as_int().and_then(i64::checked_neg) {
                        Some(n) => AbstractValue::int(n),
                        None => AbstractValue::Basic(Flat::Top),
                    },
                    UnaryOp::Xor => AbstractValue::Basic(Flat::Top),
                    // Receives on primitives outside the focus.
                    UnaryOp::Recv => match comma_ok {
                        true => AbstractValue::Tuple(vec![AbstractValue::Top, AbstractValue::unknown_bool()]),
                        false => AbstractValue::Top,
                    },
                }
            }
            Op::BinOp { operator, x, y } => binop(*operator, &val(state, *x), &val(state, *y)),
            Op::Extract { tuple, index } => val(state, *tuple).component(*index as usize),
            Op::TypeAssert { x, asserted, comma_ok } => {
                self.type_assert(&val(state, *x), *asserted, *comma_ok)
            }
            Op::Convert { x } => match val(state, *x) {
                v @ AbstractValue::Basic(Flat::Elem(Const::Int(_))) => v,
                AbstractValue::Bot => AbstractValue::Bot,
                _ => AbstractValue::Top,
            },
            Op::ChangeType { x } | Op::ChangeInterface { x } => val(state, *x),
            Op::Store { addr, val: v } => {
                let ptr = val(state, *addr);
                let value = val(state, *v);
                self.store(&mut state.memory, *addr, &ptr, &value)?;
                return Ok(());
            }
            Op::MapUpdate { map, val: v, .. } => {
                let value = val(state, *v);
                match Targets::of(&val(state, *map)) {
                    Targets::Unknown => {
                        for label in self.facts.points_to.labels(*map) {
                            let mut path = label.path.clone();
                            path.push(goat_ir::ir::PathElem::ArrayElem);
                            state.memory.store_matching(label.site, &path, &value);
                        }
                    }
                    Targets::Known { locs, nil } => {
                        if locs.is_empty() && nil {
                            return Err(Fault::NilMapWrite);
                        }
                        for l in locs {
                            state.memory.store(&l.elem(), &value, false);
                        }
                    }
                }
                return Ok(());
            }
            Op::Call { call } => match &call.callee {
                Callee::Builtin { name } => self.builtin(state, goro, ctx, name, &call.args)?,
                _ => AbstractValue::Top,
            },
            Op::Send { .. } => return Ok(()),
            Op::Range { .. } | Op::Next { .. } | Op::Unknown => AbstractValue::Top,
            _ => return Ok(()),
        };
        state.memory.set_local(goro, ctx, instr.id, result);
        Ok(())
    }

    fn type_assert(&self, x: &AbstractValue, asserted: TypeId, comma_ok: bool) -> AbstractValue {
        let with_ok = |v: AbstractValue, ok: AbstractValue| match comma_ok {
            true => AbstractValue::Tuple(vec![v, ok]),
            false => v,
        };
        let AbstractValue::Interface(iface) = x else {
            return match x {
                AbstractValue::Bot => AbstractValue::Bot,
                _ => with_ok(AbstractValue::Top, AbstractValue::unknown_bool()),
            };
        };
        if self.program.types.is_interface(asserted) {
            let narrowed = AbstractValue::Interface(InterfaceValue {
                dynamic: iface.dynamic.clone(),
                nil: false,
            });
            // Method sets are not tracked; any non-nil value may satisfy.
            let ok = match (iface.dynamic.is_empty(), iface.nil) {
                (true, _) => AbstractValue::bool(false),
                (false, false) => AbstractValue::unknown_bool(),
                (false, true) => AbstractValue::unknown_bool(),
            };
            return with_ok(narrowed, ok);
        }
        match iface.dynamic.get(&asserted) {
            Some(v) => {
                let only = iface.dynamic.len() == 1 && !iface.nil;
                let ok = match only {
                    true => AbstractValue::bool(true),
                    false => AbstractValue::unknown_bool(),
                };
                with_ok(v.clone(), ok)
            }
            None if comma_ok => with_ok(self.zero_value(asserted), AbstractValue::bool(false)),
            None => AbstractValue::Bot,
        }
    }

    fn builtin(
        &self,
        state: &mut State,
        goro: Goro,
        ctx: Context,
        name: &str,
        args: &[ValueId],
    ) -> Result<AbstractValue, Fault> {
        let val = |state: &State, v: ValueId| self.operand(&state.memory, goro, ctx, v);
        Ok(match name {
            "append" => {
                let Some((&slice, rest)) = args.split_first() else {
                    return Ok(AbstractValue::Top);
                };
                let sv = val(state, slice);
                if let Targets::Known { locs, .. } = Targets::of(&sv) {
                    for v in rest {
                        let value = val(state, *v);
                        for l in &locs {
                            state.memory.store(&l.elem(), &value, false);
                        }
                    }
                }
                sv
            }
            "ssa:wrapnilchk" => match args.first() {
                Some(&x) => {
                    let v = val(state, x);
                    if Targets::of(&v).is_nil() {
                        return Err(Fault::NilDereference);
                    }
                    v
                }
                None => AbstractValue::Top,
            },
            "len" | "cap" => AbstractValue::Basic(Flat::Top),
            // `close` of an unfocused channel and the remaining built-ins.
            _ => AbstractValue::Top,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binop_folds_constants() {
        let three = binop(BinaryOp::Add, &AbstractValue::int(1), &AbstractValue::int(2));
        assert_eq!(three, AbstractValue::int(3));
        let lt = binop(BinaryOp::Lt, &AbstractValue::int(1), &AbstractValue::int(2));
        assert_eq!(lt.as_bool(), Some(true));
        let div = binop(BinaryOp::Div, &AbstractValue::int(1), &AbstractValue::int(0));
        assert_eq!(div, AbstractValue::Basic(Flat::Top));
        let unknown = binop(BinaryOp::Eq, &AbstractValue::Basic(Flat::Top), &AbstractValue::int(2));
        assert_eq!(unknown, AbstractValue::unknown_bool());
    }

    #[test]
    fn test_nil_comparisons_are_decided() {
        let nil = AbstractValue::nil_pointer();
        let heap = AbstractValue::pointer_to(HeapLoc::global(7));
        assert_eq!(binop(BinaryOp::Eq, &nil, &nil).as_bool(), Some(true));
        assert_eq!(binop(BinaryOp::Neq, &heap, &nil).as_bool(), Some(true));
        let maybe = nil.join(&heap);
        assert_eq!(binop(BinaryOp::Eq, &maybe, &nil), AbstractValue::unknown_bool());
    }

    #[test]
    fn test_field_addr_drops_nil() {
        let heap = AbstractValue::pointer_to(HeapLoc::global(7));
        let both = heap.join(&AbstractValue::nil_pointer());
        let field = map_pointees(&both, |l| l.field("mu")).unwrap();
        assert_eq!(field, AbstractValue::pointer_to(HeapLoc::global(7).field("mu")));
        assert_eq!(
            map_pointees(&AbstractValue::nil_pointer(), |l| l.field("mu")),
            Err(Fault::NilDereference)
        );
    }
}
