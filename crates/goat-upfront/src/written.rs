//! Side-effect summary: which struct fields, maps, slices and pointer
//! cells a function and its transitive callees may write.
//!
//! Computed bottom-up over the SCCs of the call graph, so every function
//! in a component shares the component's summary.

use std::collections::BTreeSet;

use tracing::debug;

use goat_ir::graph::{Graph, Sccs};
use goat_ir::ir::{Op, PathElem, TypeId, ValueId};
use goat_ir::points_to::PointsTo;
use goat_ir::{FuncId, Program};

/// Writes performed by one call-graph component, callees included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Writes {
    /// `(struct type, field name)`; the struct type is the underlying one.
    pub fields: BTreeSet<(TypeId, String)>,
    pub maps: BTreeSet<ValueId>,
    pub slices: BTreeSet<ValueId>,
    pub pointers: BTreeSet<ValueId>,
}

impl Writes {
    fn union_with(&mut self, other: &Writes) {
        self.fields.extend(other.fields.iter().cloned());
        self.maps.extend(other.maps.iter().copied());
        self.slices.extend(other.slices.iter().copied());
        self.pointers.extend(other.pointers.iter().copied());
    }

    pub fn is_field_written(&self, struct_type: TypeId, field: &str) -> bool {
        self.fields
            .iter()
            .any(|(t, f)| *t == struct_type && f == field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
            && self.maps.is_empty()
            && self.slices.is_empty()
            && self.pointers.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct WrittenFields {
    sccs: Sccs<FuncId>,
    writes: Vec<Writes>,
}

/// Canonical id of a struct type: its underlying struct.
fn struct_id(program: &Program, ty: TypeId) -> Option<TypeId> {
    let t = program.types.underlying(ty)?;
    (t.kind == goat_ir::ir::TypeKind::Struct).then_some(t.id)
}

impl WrittenFields {
    pub fn compute(program: &Program, points_to: &PointsTo, graph: &Graph<FuncId>) -> Self {
        let sccs = graph.scc();
        let mut writes: Vec<Writes> = vec![Writes::default(); sccs.len()];
        // Components come callees first.
        for (c, component) in sccs.components().iter().enumerate() {
            let mut acc = Writes::default();
            for &func in component {
                local_writes(program, points_to, func, &mut acc);
            }
            for &callee in sccs.component_edges(c) {
                acc.union_with(&writes[callee]);
            }
            writes[c] = acc;
        }
        debug!(components = sccs.len(), "computed written fields");
        Self { sccs, writes }
    }

    /// Summary of `func`, empty when it is outside the analyzed graph.
    pub fn of(&self, func: FuncId) -> Option<&Writes> {
        self.sccs.component_of(func).map(|c| &self.writes[c])
    }

    /// Union of the summaries of `funcs`.
    pub fn combined(&self, funcs: impl IntoIterator<Item = FuncId>) -> Writes {
        let mut out = Writes::default();
        for f in funcs {
            if let Some(w) = self.of(f) {
                out.union_with(w);
            }
        }
        out
    }

    pub fn is_field_written(&self, func: FuncId, struct_type: TypeId, field: &str) -> bool {
        self.of(func)
            .is_some_and(|w| w.is_field_written(struct_type, field))
    }
}

fn local_writes(program: &Program, points_to: &PointsTo, func: FuncId, acc: &mut Writes) {
    for instr in program.function(func).instructions() {
        match &instr.op {
            Op::MapUpdate { map, .. } => {
                acc.maps.extend(points_to.labels(*map).iter().map(|l| l.site));
            }
            Op::Store { addr, val } => {
                for label in points_to.labels(*addr) {
                    let site = label.site;
                    match label.path.first() {
                        Some(PathElem::ArrayElem) => {
                            acc.slices.insert(site);
                        }
                        Some(PathElem::Field(_)) => {}
                        None => {
                            let heap = match program.instruction(site).map(|i| &i.op) {
                                Some(Op::Alloc { heap }) => *heap,
                                _ => true,
                            };
                            if heap {
                                acc.pointers.insert(site);
                            }
                        }
                    }

                    let Some(elem) = program.types.elem(program.value_type(site)) else {
                        continue;
                    };
                    let Some(struct_t) = struct_id(program, elem) else {
                        continue;
                    };
                    // Initializing a fresh allocation has no side effect on
                    // callers.
                    if let Some(Op::FieldAddr { x, .. }) = program.instruction(*addr).map(|i| &i.op) {
                        if *x == site {
                            continue;
                        }
                    }
                    let stored = program.value_type(*val);
                    if let Some(written) = struct_id(program, stored) {
                        for f in program.types.fields(written) {
                            acc.fields.insert((written, f.name.clone()));
                        }
                    } else if let Some(PathElem::Field(name)) = label.path.first() {
                        acc.fields.insert((struct_t, name.clone()));
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goat_ir::builder::{ProgramBuilder, T_INT, T_PTR_INT, T_UNIT};
    use goat_ir::call_graph::CallGraph;

    struct Fixture {
        program: Program,
        written: WrittenFields,
        state: TypeId,
    }

    fn fixture() -> Fixture {
        let mut b = ProgramBuilder::new();
        let state = b.struct_type("main.State", &[("count", T_INT), ("name", T_INT)]);
        let ptr = b.pointer_type(state);
        b.func("main.bump", &[("s", ptr)], |f| {
            let s = f.param(0);
            let addr = f.field_addr(s, "count", T_PTR_INT);
            let one = f.int(1);
            f.store(addr, one);
            f.ret(&[]);
        });
        b.func("main.outer", &[("s", ptr)], |f| {
            let s = f.param(0);
            f.call("main.bump", &[s], T_UNIT);
            f.ret(&[]);
        });
        b.func("main.main", &[], |f| {
            let s = f.alloc(ptr);
            // Initialization of the fresh allocation is not a side effect.
            let name = f.field_addr(s, "name", T_PTR_INT);
            let zero = f.int(0);
            f.store(name, zero);
            f.call("main.outer", &[s], T_UNIT);
            f.ret(&[]);
        });
        let program = b.build();
        let pts = PointsTo::estimate(&program);
        let cg = CallGraph::build(&program, &pts);
        let main = program.func_id("main.main").unwrap();
        let written = WrittenFields::compute(&program, &pts, &cg.graph([main]));
        let state = struct_id(&program, state).unwrap();
        Fixture {
            program,
            written,
            state,
        }
    }

    #[test]
    fn test_field_writes_propagate_to_callers() {
        let fx = fixture();
        let bump = fx.program.func_id("main.bump").unwrap();
        let outer = fx.program.func_id("main.outer").unwrap();
        assert!(fx.written.is_field_written(bump, fx.state, "count"));
        assert!(fx.written.is_field_written(outer, fx.state, "count"));
        assert!(!fx.written.is_field_written(outer, fx.state, "name"));
    }

    #[test]
    fn test_unwritten_fields_and_unknown_functions() {
        let fx = fixture();
        let main = fx.program.func_id("main.main").unwrap();
        assert!(!fx.written.is_field_written(main, fx.state, "name"));
        let combined = fx.written.combined([main]);
        assert!(combined.is_field_written(fx.state, "count"));
        assert!(fx.written.of(FuncId::MAX).is_none());
    }
}
