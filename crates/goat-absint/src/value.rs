//! The abstract value domain.

use std::collections::BTreeMap;
use std::fmt;

use goat_ir::ir::{ConstValue, TypeId, TypeKind};
use goat_ir::types::{SyncKind, TypeMap};
use goat_ir::FuncId;
use goat_lattice::{Flat, Interval, Lattice, Powerset, Widen};

use crate::goro::Goro;
use crate::memory::HeapLoc;

/// Constants of basic types. Floats and complex numbers are not tracked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Const {
    Int(i64),
    Bool(bool),
    Str(String),
}

/// Target of a pointer, channel, map or slice value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pointee {
    Nil,
    Heap(HeapLoc),
}

/// A channel as stored at its allocation site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChanValue {
    pub capacity: Flat<i64>,
    /// Buffered messages, within `[0, capacity]`.
    pub buffer: Interval,
    pub closed: Flat<bool>,
    /// Join of every value sent on the channel.
    pub payload: Box<AbstractValue>,
}

impl ChanValue {
    pub fn new(capacity: Flat<i64>) -> Self {
        Self {
            capacity,
            buffer: Interval::constant(0),
            closed: Flat::Elem(false),
            payload: Box::new(AbstractValue::Bot),
        }
    }

    /// A channel of capacity 1 already holding a value, as returned by
    /// `time.After`.
    pub fn ready(payload: AbstractValue) -> Self {
        Self {
            capacity: Flat::Elem(1),
            buffer: Interval::constant(1),
            closed: Flat::Elem(false),
            payload: Box::new(payload),
        }
    }

    /// A ticker channel. Ticks never run out, so it is modelled as a
    /// closed channel: receiving always succeeds.
    pub fn ticking() -> Self {
        Self {
            capacity: Flat::Elem(0),
            buffer: Interval::constant(0),
            closed: Flat::Elem(true),
            payload: Box::new(AbstractValue::Top),
        }
    }

    pub fn may_be_synchronous(&self) -> bool {
        self.capacity.may_be(&0)
    }

    /// A send may find room in the buffer.
    pub fn may_buffer(&self) -> bool {
        match self.capacity {
            Flat::Bot => false,
            Flat::Elem(n) => n > 0 && self.buffer.may_be_below(n),
            Flat::Top => !self.buffer.is_bottom(),
        }
    }

    /// Every send finds room in the buffer.
    pub fn must_buffer(&self) -> bool {
        match self.capacity {
            Flat::Elem(n) => n > 0 && self.buffer.all_below(n),
            _ => false,
        }
    }

    pub fn may_have_messages(&self) -> bool {
        self.buffer.may_be_above(0)
    }

    pub fn must_have_messages(&self) -> bool {
        matches!(self.buffer.bounds(), Some((lo, _)) if lo > 0)
    }

    pub fn may_be_closed(&self) -> bool {
        self.closed.may_be(&true)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is(&true)
    }

    pub fn after_send(&self, value: &AbstractValue) -> ChanValue {
        let buffer = match self.capacity {
            Flat::Elem(n) => self.buffer.restrict(0, n - 1).add_constant(1),
            _ => self.buffer.restrict(0, i64::MAX).add_constant(1),
        };
        ChanValue {
            buffer,
            payload: Box::new(self.payload.join(value)),
            ..self.clone()
        }
    }

    pub fn after_receive(&self) -> ChanValue {
        ChanValue {
            buffer: self.buffer.restrict(1, i64::MAX).add_constant(-1),
            ..self.clone()
        }
    }

    pub fn after_close(&self) -> ChanValue {
        ChanValue {
            closed: Flat::Elem(true),
            ..self.clone()
        }
    }
}

impl Lattice for ChanValue {
    fn bottom() -> Self {
        Self {
            capacity: Flat::Bot,
            buffer: Interval::Bot,
            closed: Flat::Bot,
            payload: Box::new(AbstractValue::Bot),
        }
    }

    fn top() -> Self {
        Self {
            capacity: Flat::Top,
            buffer: Interval::top(),
            closed: Flat::Top,
            payload: Box::new(AbstractValue::Top),
        }
    }

    fn join(&self, other: &Self) -> Self {
        Self {
            capacity: self.capacity.join(&other.capacity),
            buffer: self.buffer.join(&other.buffer),
            closed: self.closed.join(&other.closed),
            payload: Box::new(self.payload.join(&other.payload)),
        }
    }

    fn meet(&self, other: &Self) -> Self {
        Self {
            capacity: self.capacity.meet(&other.capacity),
            buffer: self.buffer.meet(&other.buffer),
            closed: self.closed.meet(&other.closed),
            payload: Box::new(self.payload.meet(&other.payload)),
        }
    }

    fn leq(&self, other: &Self) -> bool {
        self.capacity.leq(&other.capacity)
            && self.buffer.leq(&other.buffer)
            && self.closed.leq(&other.closed)
            && self.payload.leq(&other.payload)
    }
}

impl Widen for ChanValue {
    fn widen(&self, next: &Self) -> Self {
        let mut out = self.join(next);
        out.buffer = self.buffer.widen(&next.buffer);
        if let Flat::Elem(n) = out.capacity {
            out.buffer = out.buffer.restrict(0, n);
        }
        out.payload = Box::new(self.payload.widen(&next.payload));
        out
    }
}

/// A mutex record with the goroutines that may hold it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexValue {
    pub locked: Flat<bool>,
    pub holders: Powerset<Goro>,
}

impl MutexValue {
    pub fn unlocked() -> Self {
        Self {
            locked: Flat::Elem(false),
            holders: Powerset::default(),
        }
    }

    pub fn held_by(goro: Goro) -> Self {
        Self {
            locked: Flat::Elem(true),
            holders: Powerset::singleton(goro),
        }
    }

    fn join(&self, other: &Self) -> Self {
        Self {
            locked: self.locked.join(&other.locked),
            holders: self.holders.join(&other.holders),
        }
    }

    fn meet(&self, other: &Self) -> Self {
        Self {
            locked: self.locked.meet(&other.locked),
            holders: self.holders.meet(&other.holders),
        }
    }

    fn leq(&self, other: &Self) -> bool {
        self.locked.leq(&other.locked) && self.holders.leq(&other.holders)
    }
}

/// A condition variable with its locker and the goroutines parked in
/// `Wait` on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CondValue {
    pub locker: Box<AbstractValue>,
    pub waiters: Powerset<Goro>,
}

impl CondValue {
    pub fn new(locker: AbstractValue) -> Self {
        Self {
            locker: Box::new(locker),
            waiters: Powerset::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RwMutexValue {
    pub writer: Flat<bool>,
    pub readers: Interval,
}

impl RwMutexValue {
    pub fn unlocked() -> Self {
        Self {
            writer: Flat::Elem(false),
            readers: Interval::constant(0),
        }
    }
}

/// Interface values by dynamic type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceValue {
    pub dynamic: BTreeMap<TypeId, AbstractValue>,
    /// May be the nil interface.
    pub nil: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AbstractValue {
    #[default]
    Bot,
    Basic(Flat<Const>),
    Pointer(Powerset<Pointee>),
    /// Possible callees with their captured bindings.
    Closure(BTreeMap<FuncId, Vec<AbstractValue>>),
    Chan(ChanValue),
    Mutex(MutexValue),
    RwMutex(RwMutexValue),
    /// Wait-group counter.
    WaitGroup(Interval),
    Cond(CondValue),
    /// `RWMutex.RLocker()`: a locker whose Lock and Unlock read-lock the
    /// wrapped read-write mutex pointer.
    RLocker(Box<AbstractValue>),
    Struct(BTreeMap<String, AbstractValue>),
    Tuple(Vec<AbstractValue>),
    Interface(InterfaceValue),
    Top,
}

impl AbstractValue {
    pub fn int(n: i64) -> Self {
        AbstractValue::Basic(Flat::Elem(Const::Int(n)))
    }

    pub fn bool(b: bool) -> Self {
        AbstractValue::Basic(Flat::Elem(Const::Bool(b)))
    }

    pub fn unknown_bool() -> Self {
        AbstractValue::Basic(Flat::Top)
    }

    pub fn nil_pointer() -> Self {
        AbstractValue::Pointer(Powerset::singleton(Pointee::Nil))
    }

    pub fn pointer_to(loc: HeapLoc) -> Self {
        AbstractValue::Pointer(Powerset::singleton(Pointee::Heap(loc)))
    }

    pub fn from_const(value: &ConstValue, ty: TypeId, types: &TypeMap) -> Self {
        match value {
            ConstValue::Int(n) => AbstractValue::int(*n),
            ConstValue::Bool(b) => AbstractValue::bool(*b),
            ConstValue::Str(s) => AbstractValue::Basic(Flat::Elem(Const::Str(s.clone()))),
            ConstValue::Nil => match types.kind(ty) {
                TypeKind::Interface => AbstractValue::Interface(InterfaceValue {
                    dynamic: BTreeMap::new(),
                    nil: true,
                }),
                _ => AbstractValue::nil_pointer(),
            },
            // Function constants are resolved by the evaluator.
            ConstValue::Func(_) | ConstValue::Unknown => AbstractValue::Top,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AbstractValue::Basic(Flat::Elem(Const::Int(n))) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AbstractValue::Basic(Flat::Elem(Const::Bool(b))) => Some(*b),
            _ => None,
        }
    }

    /// Integer interval this value may take; top for unknown values.
    pub fn as_interval(&self) -> Interval {
        match self {
            AbstractValue::Bot => Interval::Bot,
            AbstractValue::Basic(Flat::Elem(Const::Int(n))) => Interval::constant(*n),
            _ => Interval::top(),
        }
    }

    /// Whether `b` is a possible boolean outcome.
    pub fn may_be_bool(&self, b: bool) -> bool {
        match self {
            AbstractValue::Bot => false,
            AbstractValue::Basic(Flat::Elem(Const::Bool(x))) => *x == b,
            AbstractValue::Basic(Flat::Bot) => false,
            _ => true,
        }
    }

    /// Heap locations and nil a pointer-like value may denote, looking
    /// through interfaces. `None` when the targets are unknown.
    pub fn pointees(&self) -> Option<Powerset<Pointee>> {
        match self {
            AbstractValue::Bot => Some(Powerset::default()),
            AbstractValue::Pointer(set) if !set.is_top_set() => Some(set.clone()),
            AbstractValue::Interface(iface) => {
                let mut out = Powerset::default();
                if iface.nil {
                    out.insert(Pointee::Nil);
                }
                for inner in iface.dynamic.values() {
                    out = out.join(&inner.pointees()?);
                }
                Some(out)
            }
            AbstractValue::RLocker(rw) => rw.pointees(),
            _ => None,
        }
    }

    /// The read-write mutex pointer behind an `RLocker`, looking through
    /// an interface holding only read lockers.
    pub fn read_locker(&self) -> Option<&AbstractValue> {
        match self {
            AbstractValue::RLocker(rw) => Some(rw),
            AbstractValue::Interface(iface) if !iface.nil && iface.dynamic.len() == 1 => {
                iface.dynamic.values().next().and_then(|v| v.read_locker())
            }
            _ => None,
        }
    }

    /// The value is definitely a nil pointer, channel or interface.
    pub fn is_nil(&self) -> bool {
        self.pointees()
            .is_some_and(|p| p.single() == Some(&Pointee::Nil))
    }

    pub fn field(&self, name: &str) -> AbstractValue {
        match self {
            AbstractValue::Bot => AbstractValue::Bot,
            AbstractValue::Struct(fields) => fields.get(name).cloned().unwrap_or(AbstractValue::Top),
            _ => AbstractValue::Top,
        }
    }

    pub fn component(&self, index: usize) -> AbstractValue {
        match self {
            AbstractValue::Bot => AbstractValue::Bot,
            AbstractValue::Tuple(items) => items.get(index).cloned().unwrap_or(AbstractValue::Top),
            _ => AbstractValue::Top,
        }
    }

    /// The value is a modelled primitive record.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            AbstractValue::Chan(_)
                | AbstractValue::Mutex(_)
                | AbstractValue::RwMutex(_)
                | AbstractValue::WaitGroup(_)
                | AbstractValue::Cond(_)
        )
    }

    /// Zero value of a type as held in a register. Structs are expanded
    /// field by field up to `depth`.
    pub fn zero(types: &TypeMap, ty: TypeId, depth: usize) -> AbstractValue {
        if let Some(kind) = types.sync_kind(ty) {
            return match kind {
                SyncKind::Mutex => AbstractValue::Mutex(MutexValue::unlocked()),
                SyncKind::RwMutex => AbstractValue::RwMutex(RwMutexValue::unlocked()),
                SyncKind::WaitGroup => AbstractValue::WaitGroup(Interval::constant(0)),
                SyncKind::Cond => AbstractValue::Cond(CondValue::new(AbstractValue::nil_pointer())),
            };
        }
        let Some(t) = types.underlying(ty) else {
            return AbstractValue::Top;
        };
        match t.kind {
            TypeKind::Basic => basic_zero(&t.name),
            TypeKind::Pointer
            | TypeKind::Chan
            | TypeKind::Map
            | TypeKind::Slice
            | TypeKind::Signature => AbstractValue::nil_pointer(),
            TypeKind::Interface => AbstractValue::Interface(InterfaceValue {
                dynamic: BTreeMap::new(),
                nil: true,
            }),
            TypeKind::Struct if depth > 0 => AbstractValue::Struct(
                t.fields
                    .iter()
                    .map(|f| {
                        (
                            f.name.clone(),
                            AbstractValue::zero(types, f.type_id, depth - 1),
                        )
                    })
                    .collect(),
            ),
            TypeKind::Tuple => AbstractValue::Tuple(
                t.fields
                    .iter()
                    .map(|f| AbstractValue::zero(types, f.type_id, depth.saturating_sub(1)))
                    .collect(),
            ),
            _ => AbstractValue::Top,
        }
    }
}

fn basic_zero(name: &str) -> AbstractValue {
    match name {
        "bool" | "untyped bool" => AbstractValue::bool(false),
        "string" | "untyped string" => AbstractValue::Basic(Flat::Elem(Const::Str(String::new()))),
        "int" | "int8" | "int16" | "int32" | "int64" | "uint" | "uint8" | "uint16" | "uint32"
        | "uint64" | "uintptr" | "byte" | "rune" | "untyped int" | "untyped rune" => {
            AbstractValue::int(0)
        }
        _ => AbstractValue::Top,
    }
}

fn join_maps<K: Ord + Clone>(
    a: &BTreeMap<K, AbstractValue>,
    b: &BTreeMap<K, AbstractValue>,
    f: impl Fn(&AbstractValue, &AbstractValue) -> AbstractValue,
) -> BTreeMap<K, AbstractValue> {
    let mut out = a.clone();
    for (k, v) in b {
        let merged = match out.get(k) {
            Some(old) => f(old, v),
            None => v.clone(),
        };
        out.insert(k.clone(), merged);
    }
    out
}

fn meet_maps<K: Ord + Clone>(
    a: &BTreeMap<K, AbstractValue>,
    b: &BTreeMap<K, AbstractValue>,
) -> BTreeMap<K, AbstractValue> {
    a.iter()
        .filter_map(|(k, v)| b.get(k).map(|w| (k.clone(), v.meet(w))))
        .collect()
}

fn leq_maps<K: Ord>(a: &BTreeMap<K, AbstractValue>, b: &BTreeMap<K, AbstractValue>) -> bool {
    a.iter()
        .all(|(k, v)| v.is_bottom() || b.get(k).is_some_and(|w| v.leq(w)))
}

fn join_bindings(a: &[AbstractValue], b: &[AbstractValue]) -> Vec<AbstractValue> {
    if a.len() != b.len() {
        return vec![AbstractValue::Top; a.len().max(b.len())];
    }
    a.iter().zip(b).map(|(x, y)| x.join(y)).collect()
}

impl Lattice for AbstractValue {
    fn bottom() -> Self {
        AbstractValue::Bot
    }

    fn top() -> Self {
        AbstractValue::Top
    }

    fn join(&self, other: &Self) -> Self {
        use AbstractValue::*;
        match (self, other) {
            (Bot, x) | (x, Bot) => x.clone(),
            (Top, _) | (_, Top) => Top,
            (Basic(a), Basic(b)) => Basic(a.join(b)),
            (Pointer(a), Pointer(b)) => Pointer(a.join(b)),
            (Closure(a), Closure(b)) => {
                let mut out = a.clone();
                for (f, bindings) in b {
                    let merged = match out.get(f) {
                        Some(old) => join_bindings(old, bindings),
                        None => bindings.clone(),
                    };
                    out.insert(*f, merged);
                }
                Closure(out)
            }
            (Chan(a), Chan(b)) => Chan(a.join(b)),
            (Mutex(a), Mutex(b)) => Mutex(a.join(b)),
            (RwMutex(a), RwMutex(b)) => RwMutex(RwMutexValue {
                writer: a.writer.join(&b.writer),
                readers: a.readers.join(&b.readers),
            }),
            (WaitGroup(a), WaitGroup(b)) => WaitGroup(a.join(b)),
            (Cond(a), Cond(b)) => Cond(CondValue {
                locker: Box::new(a.locker.join(&b.locker)),
                waiters: a.waiters.join(&b.waiters),
            }),
            (RLocker(a), RLocker(b)) => RLocker(Box::new(a.join(b))),
            (Struct(a), Struct(b)) => Struct(join_maps(a, b, |x, y| x.join(y))),
            (Tuple(a), Tuple(b)) if a.len() == b.len() => Tuple(join_bindings(a, b)),
            (Interface(a), Interface(b)) => Interface(InterfaceValue {
                dynamic: join_maps(&a.dynamic, &b.dynamic, |x, y| x.join(y)),
                nil: a.nil || b.nil,
            }),
            _ => Top,
        }
    }

    fn meet(&self, other: &Self) -> Self {
        use AbstractValue::*;
        match (self, other) {
            (Bot, _) | (_, Bot) => Bot,
            (Top, x) | (x, Top) => x.clone(),
            (Basic(a), Basic(b)) => Basic(a.meet(b)),
            (Pointer(a), Pointer(b)) => Pointer(a.meet(b)),
            (Chan(a), Chan(b)) => Chan(a.meet(b)),
            (Mutex(a), Mutex(b)) => Mutex(a.meet(b)),
            (RwMutex(a), RwMutex(b)) => RwMutex(RwMutexValue {
                writer: a.writer.meet(&b.writer),
                readers: a.readers.meet(&b.readers),
            }),
            (WaitGroup(a), WaitGroup(b)) => WaitGroup(a.meet(b)),
            (Cond(a), Cond(b)) => Cond(CondValue {
                locker: Box::new(a.locker.meet(&b.locker)),
                waiters: a.waiters.meet(&b.waiters),
            }),
            (RLocker(a), RLocker(b)) => RLocker(Box::new(a.meet(b))),
            (Struct(a), Struct(b)) => Struct(meet_maps(a, b)),
            (Tuple(a), Tuple(b)) if a.len() == b.len() => {
                Tuple(a.iter().zip(b).map(|(x, y)| x.meet(y)).collect())
            }
            (Interface(a), Interface(b)) => Interface(InterfaceValue {
                dynamic: meet_maps(&a.dynamic, &b.dynamic),
                nil: a.nil && b.nil,
            }),
            (a, b) if a == b => a.clone(),
            _ => Bot,
        }
    }

    fn leq(&self, other: &Self) -> bool {
        use AbstractValue::*;
        match (self, other) {
            (Bot, _) | (_, Top) => true,
            (_, Bot) | (Top, _) => false,
            (Basic(a), Basic(b)) => a.leq(b),
            (Pointer(a), Pointer(b)) => a.leq(b),
            (Closure(a), Closure(b)) => a.iter().all(|(f, xs)| {
                b.get(f).is_some_and(|ys| {
                    xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| x.leq(y))
                })
            }),
            (Chan(a), Chan(b)) => a.leq(b),
            (Mutex(a), Mutex(b)) => a.leq(b),
            (RwMutex(a), RwMutex(b)) => a.writer.leq(&b.writer) && a.readers.leq(&b.readers),
            (WaitGroup(a), WaitGroup(b)) => a.leq(b),
            (Cond(a), Cond(b)) => a.locker.leq(&b.locker) && a.waiters.leq(&b.waiters),
            (RLocker(a), RLocker(b)) => a.leq(b),
            (Struct(a), Struct(b)) => leq_maps(a, b),
            (Tuple(a), Tuple(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.leq(y)),
            (Interface(a), Interface(b)) => (!a.nil || b.nil) && leq_maps(&a.dynamic, &b.dynamic),
            _ => false,
        }
    }
}

impl Widen for AbstractValue {
    fn widen(&self, next: &Self) -> Self {
        use AbstractValue::*;
        match (self, next) {
            (Chan(a), Chan(b)) => Chan(a.widen(b)),
            (WaitGroup(a), WaitGroup(b)) => WaitGroup(a.widen(b)),
            (RwMutex(a), RwMutex(b)) => RwMutex(RwMutexValue {
                writer: a.writer.join(&b.writer),
                readers: a.readers.widen(&b.readers),
            }),
            (Struct(a), Struct(b)) => Struct(join_maps(a, b, |x, y| x.widen(y))),
            (Tuple(a), Tuple(b)) if a.len() == b.len() => {
                Tuple(a.iter().zip(b).map(|(x, y)| x.widen(y)).collect())
            }
            (Cond(a), Cond(b)) => Cond(CondValue {
                locker: Box::new(a.locker.widen(&b.locker)),
                waiters: a.waiters.join(&b.waiters),
            }),
            _ => self.join(next),
        }
    }
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Int(n) => write!(f, "{n}"),
            Const::Bool(b) => write!(f, "{b}"),
            Const::Str(s) => write!(f, "{s:?}"),
        }
    }
}

fn flat<T: fmt::Display>(v: &Flat<T>) -> String {
    match v {
        Flat::Bot => "⊥".into(),
        Flat::Elem(x) => x.to_string(),
        Flat::Top => "⊤".into(),
    }
}

fn goros(set: &Powerset<Goro>) -> String {
    if set.is_top_set() {
        return "⊤".into();
    }
    let parts: Vec<String> = set.iter().map(|g| format!("{g:?}")).collect();
    format!("{{{}}}", parts.join(", "))
}

impl fmt::Display for Pointee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pointee::Nil => write!(f, "nil"),
            Pointee::Heap(loc) => write!(f, "{loc}"),
        }
    }
}

impl fmt::Display for AbstractValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbstractValue::Bot => write!(f, "⊥"),
            AbstractValue::Top => write!(f, "⊤"),
            AbstractValue::Basic(c) => write!(f, "{}", flat(c)),
            AbstractValue::Pointer(set) => {
                let parts: Vec<String> = set.iter().map(|p| p.to_string()).collect();
                write!(f, "&{{{}}}", parts.join(", "))
            }
            AbstractValue::Closure(funcs) => {
                let parts: Vec<String> = funcs.keys().map(|f| format!("fn#{f}")).collect();
                write!(f, "closure{{{}}}", parts.join(", "))
            }
            AbstractValue::Chan(c) => write!(
                f,
                "chan[cap {}, buf {}, closed {}]",
                flat(&c.capacity),
                c.buffer,
                flat(&c.closed)
            ),
            AbstractValue::Mutex(m) => {
                write!(f, "mutex[locked {}, holders {}]", flat(&m.locked), goros(&m.holders))
            }
            AbstractValue::RwMutex(m) => {
                write!(f, "rwmutex[writer {}, readers {}]", flat(&m.writer), m.readers)
            }
            AbstractValue::WaitGroup(n) => write!(f, "waitgroup[{n}]"),
            AbstractValue::Cond(c) => write!(f, "cond[{}, waiters {}]", c.locker, goros(&c.waiters)),
            AbstractValue::RLocker(rw) => write!(f, "rlocker[{rw}]"),
            AbstractValue::Struct(fields) => {
                let parts: Vec<String> = fields.iter().map(|(k, v)| format!("{k}: {v}")).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            AbstractValue::Tuple(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
            AbstractValue::Interface(iface) => {
                let mut parts: Vec<String> = iface
                    .dynamic
                    .iter()
                    .map(|(t, v)| format!("T{t}: {v}"))
                    .collect();
                if iface.nil {
                    parts.push("nil".into());
                }
                write!(f, "iface{{{}}}", parts.join(", "))
            }
        }
    }
}
