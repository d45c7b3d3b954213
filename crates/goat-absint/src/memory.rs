//! Abstract memory: registers of every frame plus the heap.
//!
//! Heap objects are named by allocation site, the allocating goroutine and
//! call context, and an access path. Struct values are stored field by
//! field so that a store through `&x.f` only touches `x.f`.

use std::fmt;

use goat_ir::ir::{PathElem, TypeId, TypeKind, ValueId};
use goat_ir::points_to::MAX_PATH_LEN;
use goat_ir::types::TypeMap;
use goat_ir::{FuncId, Program};
use goat_lattice::{Lattice, MapLattice, Powerset, Widen};
use goat_upfront::Writes;
use rustc_hash::FxHashSet;

use crate::goro::{Context, Goro};
use crate::value::AbstractValue;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapLoc {
    pub site: ValueId,
    /// Allocating goroutine and context; `None` for package-level variables.
    pub owner: Option<(Goro, Context)>,
    pub path: Vec<PathElem>,
}

impl HeapLoc {
    pub fn new(site: ValueId, owner: Option<(Goro, Context)>) -> Self {
        Self {
            site,
            owner,
            path: vec![],
        }
    }

    pub fn global(site: ValueId) -> Self {
        Self::new(site, None)
    }

    /// Extend the access path. Paths at the length limit summarize every
    /// deeper location.
    pub fn extend(&self, elem: PathElem) -> Self {
        let mut out = self.clone();
        if out.path.len() < MAX_PATH_LEN {
            out.path.push(elem);
        }
        out
    }

    pub fn field(&self, name: &str) -> Self {
        self.extend(PathElem::Field(name.to_string()))
    }

    pub fn elem(&self) -> Self {
        self.extend(PathElem::ArrayElem)
    }

    pub fn root(&self) -> Self {
        Self::new(self.site, self.owner)
    }

    /// The location stands for a single concrete cell.
    pub fn is_precise(&self) -> bool {
        self.path.len() < MAX_PATH_LEN && !self.path.contains(&PathElem::ArrayElem)
    }

    pub fn is_within(&self, other: &HeapLoc) -> bool {
        self.site == other.site && self.owner == other.owner && self.path.starts_with(&other.path)
    }
}

impl fmt::Display for HeapLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "site{}", self.site)?;
        if let Some((goro, ctx)) = self.owner {
            write!(f, "@{goro:?}{ctx:?}")?;
        }
        for elem in &self.path {
            match elem {
                PathElem::Field(name) => write!(f, ".{name}")?,
                PathElem::ArrayElem => write!(f, "[*]")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    /// An SSA register of one frame.
    Local {
        goro: Goro,
        ctx: Context,
        value: ValueId,
    },
    /// Results of a frame, read back at its post-call nodes.
    Return {
        goro: Goro,
        func: FuncId,
        ctx: Context,
    },
    Heap(HeapLoc),
}

impl Location {
    pub fn goro(&self) -> Option<Goro> {
        match self {
            Location::Local { goro, .. } | Location::Return { goro, .. } => Some(*goro),
            Location::Heap(_) => None,
        }
    }
}

/// Type of the object allocated at `site`.
pub fn site_type(program: &Program, site: ValueId) -> TypeId {
    let ty = program.value_type(site);
    let is_alloc = program.global(site).is_some()
        || matches!(
            program.instruction(site).map(|i| &i.op),
            Some(goat_ir::ir::Op::Alloc { .. })
        );
    match is_alloc {
        true => program.types.elem(ty).unwrap_or(0),
        false => ty,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Memory {
    values: MapLattice<Location, AbstractValue>,
    /// Heap locations allocated more than once.
    multi: Powerset<HeapLoc>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, loc: &Location) -> Option<&AbstractValue> {
        self.values.get(loc)
    }

    pub fn local(&self, goro: Goro, ctx: Context, value: ValueId) -> Option<&AbstractValue> {
        self.values.get(&Location::Local { goro, ctx, value })
    }

    pub fn set_local(&mut self, goro: Goro, ctx: Context, value: ValueId, v: AbstractValue) {
        self.values.insert_mut(Location::Local { goro, ctx, value }, v);
    }

    /// Join `v` into a register that may already hold a value.
    pub fn join_local(&mut self, goro: Goro, ctx: Context, value: ValueId, v: &AbstractValue) {
        self.values = self.values.update(Location::Local { goro, ctx, value }, v);
    }

    pub fn set(&mut self, loc: Location, v: AbstractValue) {
        self.values.insert_mut(loc, v);
    }

    pub fn join_at(&mut self, loc: Location, v: &AbstractValue) {
        self.values = self.values.update(loc, v);
    }

    pub fn is_multi(&self, loc: &HeapLoc) -> bool {
        self.multi.iter().any(|m| loc.is_within(m))
    }

    /// Whether a store through a pointer to exactly `loc` may overwrite.
    pub fn is_strong(&self, loc: &HeapLoc) -> bool {
        loc.is_precise() && !self.is_multi(loc)
    }

    pub fn is_allocated(&self, loc: &HeapLoc) -> bool {
        let root = loc.root();
        self.values.keys().any(|k| match k {
            Location::Heap(h) => h.is_within(&root),
            _ => false,
        })
    }

    /// Allocate the object at `loc` with its zero value. `record` supplies
    /// the value of primitive leaves.
    pub fn alloc(
        &mut self,
        types: &TypeMap,
        loc: HeapLoc,
        ty: TypeId,
        record: &dyn Fn(&HeapLoc, AbstractValue) -> AbstractValue,
    ) {
        if self.is_allocated(&loc) {
            self.multi.insert(loc.root());
            let mut fresh = Memory::new();
            fresh.write_zero(types, &loc, ty, record, 0);
            for (k, v) in fresh.values.iter() {
                self.values = self.values.update(k.clone(), v);
            }
            return;
        }
        self.write_zero(types, &loc, ty, record, 0);
    }

    /// Allocate a single-cell object holding `v`.
    pub fn alloc_value(&mut self, loc: HeapLoc, v: AbstractValue) {
        let key = Location::Heap(loc.clone());
        if self.is_allocated(&loc) {
            self.multi.insert(loc.root());
            self.values = self.values.update(key, &v);
        } else {
            self.values.insert_mut(key, v);
        }
    }

    /// Weakly store `v` at `path` of every object allocated at `site`.
    pub fn store_matching(&mut self, site: ValueId, path: &[PathElem], v: &AbstractValue) {
        let roots: Vec<HeapLoc> = self
            .heap()
            .filter(|(h, _)| h.site == site)
            .map(|(h, _)| h.root())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        for root in roots {
            let loc = path.iter().fold(root, |loc, elem| loc.extend(elem.clone()));
            self.store(&loc, v, false);
        }
    }

    fn write_zero(
        &mut self,
        types: &TypeMap,
        loc: &HeapLoc,
        ty: TypeId,
        record: &dyn Fn(&HeapLoc, AbstractValue) -> AbstractValue,
        depth: usize,
    ) {
        if types.sync_kind(ty).is_some() {
            let zero = AbstractValue::zero(types, ty, 0);
            self.set(Location::Heap(loc.clone()), record(loc, zero));
            return;
        }
        let expandable = depth < MAX_PATH_LEN;
        match types.underlying(ty).map(|t| (t.kind.clone(), t.elem)) {
            Some((TypeKind::Struct, _)) if expandable => {
                for field in types.fields(ty) {
                    self.write_zero(types, &loc.field(&field.name), field.type_id, record, depth + 1);
                }
            }
            Some((TypeKind::Array, elem)) if expandable => {
                self.write_zero(types, &loc.elem(), elem, record, depth + 1);
            }
            _ => {
                let zero = AbstractValue::zero(types, ty, 0);
                self.set(Location::Heap(loc.clone()), zero);
            }
        }
    }

    /// Read the object at `loc`, reassembling structs from their fields.
    pub fn read(&self, types: &TypeMap, loc: &HeapLoc, ty: TypeId) -> AbstractValue {
        self.read_depth(types, loc, ty, 0)
    }

    fn read_depth(&self, types: &TypeMap, loc: &HeapLoc, ty: TypeId, depth: usize) -> AbstractValue {
        if let Some(v) = self.values.get(&Location::Heap(loc.clone())) {
            return v.clone();
        }
        if depth < MAX_PATH_LEN && types.sync_kind(ty).is_none() && types.is_struct(ty) {
            let fields = types.fields(ty);
            if !fields.is_empty() {
                return AbstractValue::Struct(
                    fields
                        .iter()
                        .map(|f| {
                            let v = self.read_depth(types, &loc.field(&f.name), f.type_id, depth + 1);
                            (f.name.clone(), v)
                        })
                        .collect(),
                );
            }
        }
        AbstractValue::Top
    }

    /// Store `v` at `loc`, splitting structs into their fields.
    pub fn store(&mut self, loc: &HeapLoc, v: &AbstractValue, strong: bool) {
        if let AbstractValue::Struct(fields) = v {
            if loc.path.len() < MAX_PATH_LEN {
                for (name, fv) in fields {
                    self.store(&loc.field(name), fv, strong);
                }
                return;
            }
        }
        let key = Location::Heap(loc.clone());
        let nested: Vec<Location> = self
            .values
            .keys()
            .filter(|k| matches!(k, Location::Heap(h) if h != loc && h.is_within(loc)))
            .cloned()
            .collect();
        for k in nested {
            self.write(k, v, strong);
        }
        if self.values.contains_key(&key) || strong {
            self.write(key, v, strong);
        }
    }

    fn write(&mut self, key: Location, v: &AbstractValue, strong: bool) {
        match strong {
            true => self.values.insert_mut(key, v.clone()),
            false => self.values = self.values.update(key, v),
        }
    }

    pub fn heap(&self) -> impl Iterator<Item = (&HeapLoc, &AbstractValue)> {
        self.values.iter().filter_map(|(k, v)| match k {
            Location::Heap(h) => Some((h, v)),
            _ => None,
        })
    }

    /// Drop every register and return slot of a goroutine.
    pub fn forget(&mut self, goro: Goro) {
        self.values = self.values.retain(|k, _| k.goro() != Some(goro));
    }

    /// Drop the registers of one returned frame and its result slot.
    pub fn forget_frame(&mut self, goro: Goro, func: FuncId, ctx: Context, registers: &FxHashSet<ValueId>) {
        self.values = self.values.retain(|k, _| match k {
            Location::Local { goro: g, ctx: c, value } => {
                !(*g == goro && *c == ctx && registers.contains(value))
            }
            Location::Return { goro: g, func: f, ctx: c } => !(*g == goro && *f == func && *c == ctx),
            Location::Heap(_) => true,
        });
    }

    /// Forget what a callee summarized by `writes` may have changed.
    /// Primitive records are kept; their state only changes through
    /// transitions.
    pub fn top_inject(&mut self, program: &Program, writes: &Writes) {
        if writes.is_empty() {
            return;
        }
        let types = &program.types;
        let hit: Vec<Location> = self
            .heap()
            .filter(|(_, v)| !v.is_primitive() && **v != AbstractValue::Top)
            .filter(|(h, _)| match h.path.split_last() {
                None => writes.pointers.contains(&h.site),
                Some((PathElem::ArrayElem, _)) => {
                    writes.maps.contains(&h.site) || writes.slices.contains(&h.site)
                }
                Some((PathElem::Field(name), parent)) => {
                    let root = site_type(program, h.site);
                    types
                        .type_at_path(root, parent)
                        .and_then(|t| types.underlying(t))
                        .is_some_and(|t| writes.is_field_written(t.id, name))
                }
            })
            .map(|(h, _)| Location::Heap(h.clone()))
            .collect();
        for loc in hit {
            self.values.insert_mut(loc, AbstractValue::Top);
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Lattice for Memory {
    fn bottom() -> Self {
        Self::default()
    }

    fn top() -> Self {
        // Never materialized; every location of a top memory reads top.
        Self {
            values: MapLattice::top(),
            multi: Powerset::top(),
        }
    }

    fn join(&self, other: &Self) -> Self {
        Self {
            values: self.values.join(&other.values),
            multi: self.multi.join(&other.multi),
        }
    }

    fn meet(&self, other: &Self) -> Self {
        Self {
            values: self.values.meet(&other.values),
            multi: self.multi.meet(&other.multi),
        }
    }

    fn leq(&self, other: &Self) -> bool {
        self.values.leq(&other.values) && self.multi.leq(&other.multi)
    }
}

impl Widen for Memory {
    fn widen(&self, next: &Self) -> Self {
        Self {
            values: self.values.widen(&next.values),
            multi: self.multi.join(&next.multi),
        }
    }
}
