//! Allocation sites of concurrency primitives.
//!
//! A primitive is identified by its allocation site. Sync primitives
//! embedded in a struct share the identity of the struct's allocation.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use goat_ir::ir::{Op, TypeId, ValueId};
use goat_ir::models::Model;
use goat_ir::points_to::PointsTo;
use goat_ir::types::{SyncKind, TypeMap};
use goat_ir::{FuncId, Program};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum PrimitiveKind {
    Chan,
    Mutex,
    RwMutex,
    WaitGroup,
    Cond,
}

impl PrimitiveKind {
    pub fn is_chan(self) -> bool {
        self == PrimitiveKind::Chan
    }

    fn from_sync(kind: SyncKind) -> Self {
        match kind {
            SyncKind::Mutex => PrimitiveKind::Mutex,
            SyncKind::RwMutex => PrimitiveKind::RwMutex,
            SyncKind::WaitGroup => PrimitiveKind::WaitGroup,
            SyncKind::Cond => PrimitiveKind::Cond,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Primitive {
    pub site: ValueId,
    pub kind: PrimitiveKind,
    /// Allocating function; `None` for package-level variables.
    pub func: Option<FuncId>,
    /// Allocated inside the standard library.
    pub goroot: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Primitives {
    by_site: BTreeMap<ValueId, Primitive>,
}

/// First sync primitive embedded by value in `ty`.
fn embedded_sync(types: &TypeMap, ty: TypeId, depth: usize) -> Option<SyncKind> {
    if depth > 8 {
        return None;
    }
    if let Some(kind) = types.sync_kind(ty) {
        return Some(kind);
    }
    if types.is_struct(ty) {
        return types
            .fields(ty)
            .iter()
            .find_map(|f| embedded_sync(types, f.type_id, depth + 1));
    }
    match types.underlying(ty) {
        Some(t) if t.kind == goat_ir::ir::TypeKind::Array => {
            embedded_sync(types, t.elem, depth + 1)
        }
        _ => None,
    }
}

impl Primitives {
    pub fn collect(program: &Program) -> Self {
        let types = &program.types;
        let mut by_site = BTreeMap::new();
        let mut add = |site: ValueId, kind: PrimitiveKind, func: Option<FuncId>| {
            let goroot = func.is_some_and(|f| program.is_stdlib(f));
            by_site.insert(
                site,
                Primitive {
                    site,
                    kind,
                    func,
                    goroot,
                },
            );
        };

        for (id, func) in program.functions() {
            for instr in func.instructions() {
                match &instr.op {
                    Op::MakeChan { .. } => add(instr.id, PrimitiveKind::Chan, Some(id)),
                    Op::Alloc { .. } => {
                        let kind = types
                            .elem(instr.type_id)
                            .and_then(|elem| embedded_sync(types, elem, 0));
                        if let Some(kind) = kind {
                            add(instr.id, PrimitiveKind::from_sync(kind), Some(id));
                        }
                    }
                    Op::Call { call } => match Model::of_call(call) {
                        Some(Model::NewCond) => add(instr.id, PrimitiveKind::Cond, Some(id)),
                        Some(model) if model.makes_chan() => add(instr.id, PrimitiveKind::Chan, Some(id)),
                        _ => {}
                    },
                    _ => {}
                }
            }
        }
        for g in program.globals() {
            let kind = types
                .elem(g.type_id)
                .and_then(|elem| embedded_sync(types, elem, 0));
            if let Some(kind) = kind {
                add(g.id, PrimitiveKind::from_sync(kind), None);
            }
        }
        Self { by_site }
    }

    pub fn get(&self, site: ValueId) -> Option<&Primitive> {
        self.by_site.get(&site)
    }

    pub fn contains(&self, site: ValueId) -> bool {
        self.by_site.contains_key(&site)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Primitive> {
        self.by_site.values()
    }

    pub fn len(&self) -> usize {
        self.by_site.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_site.is_empty()
    }

    pub fn channels(&self) -> impl Iterator<Item = &Primitive> {
        self.iter().filter(|p| p.kind.is_chan())
    }

    /// Primitive sites `value` may refer to.
    pub fn of_value(&self, points_to: &PointsTo, value: ValueId) -> BTreeSet<ValueId> {
        let mut out: BTreeSet<ValueId> = points_to
            .labels(value)
            .iter()
            .map(|l| l.site)
            .filter(|s| self.contains(*s))
            .collect();
        if self.contains(value) {
            out.insert(value);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goat_ir::builder::{ProgramBuilder, T_MUTEX, T_INT};

    #[test]
    fn test_collects_channels_sync_and_embedded_primitives() {
        let mut b = ProgramBuilder::new();
        let guarded = b.struct_type("main.Guarded", &[("mu", T_MUTEX), ("n", T_INT)]);
        let ptr = b.pointer_type(guarded);
        let plain = b.struct_type("main.Plain", &[("n", T_INT)]);
        let plain_ptr = b.pointer_type(plain);
        let (mut ch, mut mu, mut g, mut p, mut cond) = (0, 0, 0, 0, 0);
        b.func("main.main", &[], |f| {
            ch = f.make_chan(0);
            mu = f.new_mutex();
            g = f.alloc(ptr);
            p = f.alloc(plain_ptr);
            cond = f.new_cond(mu);
            f.ret(&[]);
        });
        let program = b.build();
        let prims = Primitives::collect(&program);

        assert_eq!(prims.get(ch).unwrap().kind, PrimitiveKind::Chan);
        assert_eq!(prims.get(mu).unwrap().kind, PrimitiveKind::Mutex);
        assert_eq!(prims.get(g).unwrap().kind, PrimitiveKind::Mutex);
        assert_eq!(prims.get(cond).unwrap().kind, PrimitiveKind::Cond);
        assert!(!prims.contains(p));
        assert_eq!(prims.channels().count(), 1);
        assert!(prims.iter().all(|p| !p.goroot));

        let pts = PointsTo::estimate(&program);
        assert_eq!(prims.of_value(&pts, ch), BTreeSet::from([ch]));
    }

    #[test]
    fn test_time_channels_are_primitives() {
        let mut b = ProgramBuilder::new();
        let (mut after, mut sleep) = (0, 0);
        b.func("main.main", &[], |f| {
            let d = f.int(1);
            after = f.call("time.After", &[d], goat_ir::builder::T_CHAN_INT);
            sleep = f.call("time.Sleep", &[d], goat_ir::builder::T_UNIT);
            f.ret(&[]);
        });
        let program = b.build();
        let prims = Primitives::collect(&program);
        assert_eq!(prims.get(after).map(|p| p.kind), Some(PrimitiveKind::Chan));
        assert!(!prims.contains(sleep));
    }
}
