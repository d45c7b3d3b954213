//! Programmatic construction of small SSA programs for tests.
//!
//! ```ignore
//! let mut b = ProgramBuilder::new();
//! b.func("main.main", &[], |f| {
//!     let ch = f.make_chan(0);
//!     let one = f.int(1);
//!     f.send(ch, one);
//!     f.ret(&[]);
//! });
//! let program = b.build();
//! ```

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::*;
use crate::program::{InputError, Program};

pub const T_INT: TypeId = 1;
pub const T_BOOL: TypeId = 2;
pub const T_STRING: TypeId = 3;
pub const T_UNIT: TypeId = 4;
pub const T_CHAN_INT: TypeId = 5;
const T_SYNC_STATE: TypeId = 6;
pub const T_MUTEX: TypeId = 7;
pub const T_PTR_MUTEX: TypeId = 8;
pub const T_RWMUTEX: TypeId = 9;
pub const T_PTR_RWMUTEX: TypeId = 10;
pub const T_WAITGROUP: TypeId = 11;
pub const T_PTR_WAITGROUP: TypeId = 12;
pub const T_LOCKER: TypeId = 13;
const T_LOCKER_IFACE: TypeId = 14;
pub const T_PTR_LOCKER: TypeId = 15;
pub const T_COND: TypeId = 16;
const T_COND_STRUCT: TypeId = 17;
pub const T_PTR_COND: TypeId = 18;
pub const T_FUNC: TypeId = 19;
pub const T_PTR_INT: TypeId = 20;
pub const T_RECV_OK: TypeId = 21;

const FIRST_USER_TYPE: TypeId = 100;
const FIRST_VALUE: ValueId = 1000;

/// Source file every built instruction is attributed to.
pub const FILE: &str = "main.go";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectArm {
    Recv(ValueId),
    Send(ValueId, ValueId),
}

pub struct ProgramBuilder {
    next_value: ValueId,
    next_type: TypeId,
    line: u32,
    types: Vec<TypeRef>,
    constants: Vec<Constant>,
    globals: Vec<Global>,
    /// Functions per package prefix.
    packages: BTreeMap<String, Vec<Function>>,
    stdlib: BTreeSet<String>,
    externals: BTreeSet<String>,
    call_edges: Vec<CallEdge>,
    points_to: Vec<PointsToEntry>,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn type_ref(id: TypeId, kind: TypeKind, name: &str) -> TypeRef {
    TypeRef {
        id,
        kind,
        name: name.into(),
        underlying: 0,
        elem: 0,
        key: 0,
        fields: vec![],
    }
}

fn with_elem(mut t: TypeRef, elem: TypeId) -> TypeRef {
    t.elem = elem;
    t
}

fn with_underlying(mut t: TypeRef, underlying: TypeId) -> TypeRef {
    t.underlying = underlying;
    t
}

fn with_fields(mut t: TypeRef, fields: &[(&str, TypeId)]) -> TypeRef {
    t.fields = fields
        .iter()
        .map(|(name, type_id)| FieldInfo {
            name: (*name).into(),
            type_id: *type_id,
        })
        .collect();
    t
}

fn package_of(name: &str) -> String {
    let trimmed = name.trim_start_matches("(*").trim_start_matches('(');
    trimmed
        .split('.')
        .next()
        .unwrap_or("main")
        .to_string()
}

impl ProgramBuilder {
    pub fn new() -> Self {
        use TypeKind::*;
        let types = vec![
            type_ref(T_INT, Basic, "int"),
            type_ref(T_BOOL, Basic, "bool"),
            type_ref(T_STRING, Basic, "string"),
            type_ref(T_UNIT, Tuple, "()"),
            with_elem(type_ref(T_CHAN_INT, Chan, "chan int"), T_INT),
            type_ref(T_SYNC_STATE, Struct, "struct{state int32; sema uint32}"),
            with_underlying(type_ref(T_MUTEX, Named, "sync.Mutex"), T_SYNC_STATE),
            with_elem(type_ref(T_PTR_MUTEX, Pointer, "*sync.Mutex"), T_MUTEX),
            with_underlying(type_ref(T_RWMUTEX, Named, "sync.RWMutex"), T_SYNC_STATE),
            with_elem(type_ref(T_PTR_RWMUTEX, Pointer, "*sync.RWMutex"), T_RWMUTEX),
            with_underlying(type_ref(T_WAITGROUP, Named, "sync.WaitGroup"), T_SYNC_STATE),
            with_elem(type_ref(T_PTR_WAITGROUP, Pointer, "*sync.WaitGroup"), T_WAITGROUP),
            with_underlying(type_ref(T_LOCKER, Named, "sync.Locker"), T_LOCKER_IFACE),
            type_ref(T_LOCKER_IFACE, Interface, "interface{Lock(); Unlock()}"),
            with_elem(type_ref(T_PTR_LOCKER, Pointer, "*sync.Locker"), T_LOCKER),
            with_underlying(type_ref(T_COND, Named, "sync.Cond"), T_COND_STRUCT),
            with_fields(
                type_ref(T_COND_STRUCT, Struct, "struct{L sync.Locker}"),
                &[("L", T_LOCKER)],
            ),
            with_elem(type_ref(T_PTR_COND, Pointer, "*sync.Cond"), T_COND),
            type_ref(T_FUNC, Signature, "func()"),
            with_elem(type_ref(T_PTR_INT, Pointer, "*int"), T_INT),
            with_fields(
                type_ref(T_RECV_OK, Tuple, "(int, bool)"),
                &[("0", T_INT), ("1", T_BOOL)],
            ),
        ];
        Self {
            next_value: FIRST_VALUE,
            next_type: FIRST_USER_TYPE,
            line: 1,
            types,
            constants: vec![],
            globals: vec![],
            packages: BTreeMap::new(),
            stdlib: BTreeSet::from(["sync".to_string()]),
            externals: BTreeSet::new(),
            call_edges: vec![],
            points_to: vec![],
        }
    }

    fn fresh(&mut self) -> ValueId {
        let id = self.next_value;
        self.next_value += 1;
        id
    }

    fn next_span(&mut self) -> Span {
        let span = Span::new(FILE, self.line, 2);
        self.line += 1;
        span
    }

    fn fresh_type(&mut self, t: impl FnOnce(TypeId) -> TypeRef) -> TypeId {
        let id = self.next_type;
        self.next_type += 1;
        self.types.push(t(id));
        id
    }

    /// Named struct type; returns the named type.
    pub fn struct_type(&mut self, name: &str, fields: &[(&str, TypeId)]) -> TypeId {
        let underlying = self.fresh_type(|id| {
            with_fields(type_ref(id, TypeKind::Struct, &format!("struct {name}")), fields)
        });
        self.fresh_type(|id| with_underlying(type_ref(id, TypeKind::Named, name), underlying))
    }

    pub fn pointer_type(&mut self, elem: TypeId) -> TypeId {
        self.fresh_type(|id| with_elem(type_ref(id, TypeKind::Pointer, "*T"), elem))
    }

    pub fn chan_type(&mut self, elem: TypeId) -> TypeId {
        self.fresh_type(|id| with_elem(type_ref(id, TypeKind::Chan, "chan T"), elem))
    }

    pub fn slice_type(&mut self, elem: TypeId) -> TypeId {
        self.fresh_type(|id| with_elem(type_ref(id, TypeKind::Slice, "[]T"), elem))
    }

    fn tuple_type(&mut self, fields: &[TypeId]) -> TypeId {
        let names: Vec<String> = (0..fields.len()).map(|i| i.to_string()).collect();
        let pairs: Vec<(&str, TypeId)> = names
            .iter()
            .map(|n| n.as_str())
            .zip(fields.iter().copied())
            .collect();
        self.fresh_type(|id| with_fields(type_ref(id, TypeKind::Tuple, "tuple"), &pairs))
    }

    pub fn constant(&mut self, type_id: TypeId, value: ConstValue) -> ValueId {
        let id = self.fresh();
        self.constants.push(Constant { id, type_id, value });
        id
    }

    pub fn int(&mut self, v: i64) -> ValueId {
        self.constant(T_INT, ConstValue::Int(v))
    }

    pub fn bool(&mut self, v: bool) -> ValueId {
        self.constant(T_BOOL, ConstValue::Bool(v))
    }

    pub fn nil(&mut self, type_id: TypeId) -> ValueId {
        self.constant(type_id, ConstValue::Nil)
    }

    pub fn func_const(&mut self, name: &str) -> ValueId {
        self.constant(T_FUNC, ConstValue::Func(name.into()))
    }

    /// Package-level variable of type `*elem`.
    pub fn global(&mut self, name: &str, ptr_type: TypeId) -> ValueId {
        let id = self.fresh();
        let span = Some(self.next_span());
        self.globals.push(Global {
            id,
            name: name.into(),
            type_id: ptr_type,
            span,
        });
        id
    }

    pub fn mark_stdlib(&mut self, package: &str) {
        self.stdlib.insert(package.into());
    }

    pub fn func(
        &mut self,
        name: &str,
        params: &[(&str, TypeId)],
        body: impl FnOnce(&mut FunctionBuilder<'_>),
    ) {
        self.closure(name, params, &[], body)
    }

    /// Function with captured free variables, instantiated by `MakeClosure`.
    pub fn closure(
        &mut self,
        name: &str,
        params: &[(&str, TypeId)],
        free_vars: &[(&str, TypeId)],
        body: impl FnOnce(&mut FunctionBuilder<'_>),
    ) {
        let params = self.params(params);
        let free_vars = self.params(free_vars);
        let short_name = name.rsplit('.').next().unwrap_or(name).to_string();
        let span = Some(self.next_span());
        let func = Function {
            name: name.into(),
            short_name,
            span,
            params,
            free_vars,
            blocks: vec![BasicBlock {
                id: 0,
                name: "entry".into(),
                instructions: vec![],
            }],
            cfg_edges: vec![],
            is_method: name.starts_with('('),
        };
        let mut fb = FunctionBuilder {
            program: self,
            func,
            current: 0,
        };
        body(&mut fb);
        let func = fb.func;
        self.packages
            .entry(package_of(name))
            .or_default()
            .push(func);
    }

    fn params(&mut self, list: &[(&str, TypeId)]) -> Vec<Param> {
        list.iter()
            .map(|(n, t)| Param {
                id: self.fresh(),
                name: (*n).into(),
                type_id: *t,
            })
            .collect()
    }

    /// Function without a body.
    pub fn external(&mut self, name: &str) {
        self.externals.insert(name.into());
    }

    pub fn call_edge(&mut self, caller: &str, callee: &str, site: ValueId) {
        self.call_edges.push(CallEdge {
            caller: caller.into(),
            callee: callee.into(),
            site: Some(site),
            span: None,
            is_dynamic: true,
            is_go: false,
            is_defer: false,
        });
    }

    pub fn points_to(&mut self, value: ValueId, labels: Vec<Label>) {
        self.points_to.push(PointsToEntry { value, labels });
    }

    pub fn input(mut self) -> AnalysisInput {
        let defined: BTreeSet<String> = self
            .packages
            .values()
            .flatten()
            .map(|f| f.name.clone())
            .collect();
        for name in std::mem::take(&mut self.externals) {
            if defined.contains(&name) {
                continue;
            }
            self.packages.entry(package_of(&name)).or_default().push(Function {
                short_name: name.rsplit('.').next().unwrap_or(&name).to_string(),
                name,
                span: None,
                params: vec![],
                free_vars: vec![],
                blocks: vec![],
                cfg_edges: vec![],
                is_method: false,
            });
        }

        let mut packages: Vec<Package> = self
            .packages
            .into_iter()
            .map(|(path, functions)| Package {
                is_stdlib: self.stdlib.contains(&path),
                name: path.clone(),
                import_path: path,
                files: vec![FileInfo {
                    path: FILE.into(),
                    package_name: String::new(),
                    is_test: false,
                }],
                types: vec![],
                functions,
                call_edges: vec![],
                global_vars: vec![],
            })
            .collect();
        if packages.is_empty() {
            packages.push(Package {
                import_path: "main".into(),
                name: "main".into(),
                files: vec![],
                types: vec![],
                functions: vec![],
                call_edges: vec![],
                global_vars: vec![],
                is_stdlib: false,
            });
        }
        packages[0].types = self.types;
        packages[0].global_vars = self.globals;
        packages[0].call_edges = self.call_edges;
        AnalysisInput {
            packages,
            go_version: "go1.22".into(),
            bridge_version: "builder".into(),
            constants: self.constants,
            points_to: self.points_to,
        }
    }

    pub fn try_build(self) -> Result<Program, InputError> {
        Program::new(self.input())
    }

    pub fn build(self) -> Program {
        match self.try_build() {
            Ok(p) => p,
            Err(e) => panic!("builder produced an invalid program: {e}"),
        }
    }
}

pub struct FunctionBuilder<'a> {
    program: &'a mut ProgramBuilder,
    func: Function,
    current: u32,
}

impl FunctionBuilder<'_> {
    pub fn param(&self, i: usize) -> ValueId {
        self.func.params[i].id
    }

    pub fn free_var(&self, i: usize) -> ValueId {
        self.func.free_vars[i].id
    }

    pub fn int(&mut self, v: i64) -> ValueId {
        self.program.int(v)
    }

    pub fn bool(&mut self, v: bool) -> ValueId {
        self.program.bool(v)
    }

    pub fn nil(&mut self, type_id: TypeId) -> ValueId {
        self.program.nil(type_id)
    }

    pub fn program(&mut self) -> &mut ProgramBuilder {
        self.program
    }

    pub fn current_block(&self) -> u32 {
        self.current
    }

    pub fn new_block(&mut self) -> u32 {
        let id = self.func.blocks.len() as u32;
        self.func.blocks.push(BasicBlock {
            id,
            name: format!("b{id}"),
            instructions: vec![],
        });
        id
    }

    pub fn switch_to(&mut self, block: u32) {
        self.current = block;
    }

    pub fn push(&mut self, type_id: TypeId, op: Op) -> ValueId {
        let id = self.program.fresh();
        let span = Some(self.program.next_span());
        self.func.blocks[self.current as usize]
            .instructions
            .push(Instruction {
                id,
                name: format!("t{}", id - FIRST_VALUE),
                type_id,
                span,
                op,
            });
        id
    }

    fn call_op(&mut self, callee: Callee, args: &[ValueId]) -> CallCommon {
        if let Callee::Static { func } = &callee {
            if package_of(func) == "sync" {
                self.program.external(func);
            }
        }
        CallCommon {
            callee,
            args: args.to_vec(),
        }
    }

    pub fn alloc(&mut self, ptr_type: TypeId) -> ValueId {
        self.push(ptr_type, Op::Alloc { heap: true })
    }

    pub fn make_chan(&mut self, size: i64) -> ValueId {
        let size = self.int(size);
        self.push(T_CHAN_INT, Op::MakeChan { size })
    }

    /// Channel whose capacity is an arbitrary SSA value.
    pub fn make_chan_dynamic(&mut self, size: ValueId) -> ValueId {
        self.push(T_CHAN_INT, Op::MakeChan { size })
    }

    pub fn new_mutex(&mut self) -> ValueId {
        self.alloc(T_PTR_MUTEX)
    }

    pub fn new_rw_mutex(&mut self) -> ValueId {
        self.alloc(T_PTR_RWMUTEX)
    }

    pub fn new_wait_group(&mut self) -> ValueId {
        self.alloc(T_PTR_WAITGROUP)
    }

    /// `sync.NewCond(locker)`
    pub fn new_cond(&mut self, locker: ValueId) -> ValueId {
        let iface = self.push(T_LOCKER, Op::MakeInterface { x: locker });
        self.call_static(crate::models::NEW_COND, &[iface], T_PTR_COND)
    }

    pub fn make_closure(&mut self, func: &str, bindings: &[ValueId]) -> ValueId {
        self.push(
            T_FUNC,
            Op::MakeClosure {
                func: func.into(),
                bindings: bindings.to_vec(),
            },
        )
    }

    pub fn field_addr(&mut self, x: ValueId, field: &str, ptr_type: TypeId) -> ValueId {
        self.push(
            ptr_type,
            Op::FieldAddr {
                x,
                field: field.into(),
            },
        )
    }

    pub fn field(&mut self, x: ValueId, field: &str, type_id: TypeId) -> ValueId {
        self.push(
            type_id,
            Op::Field {
                x,
                field: field.into(),
            },
        )
    }

    pub fn index_addr(&mut self, x: ValueId, index: ValueId, ptr_type: TypeId) -> ValueId {
        self.push(ptr_type, Op::IndexAddr { x, index })
    }

    /// `*addr`
    pub fn load(&mut self, addr: ValueId, type_id: TypeId) -> ValueId {
        self.push(
            type_id,
            Op::UnOp {
                operator: UnaryOp::Deref,
                x: addr,
                comma_ok: false,
            },
        )
    }

    pub fn store(&mut self, addr: ValueId, val: ValueId) {
        self.push(T_UNIT, Op::Store { addr, val });
    }

    pub fn binop(&mut self, operator: BinaryOp, x: ValueId, y: ValueId, type_id: TypeId) -> ValueId {
        self.push(type_id, Op::BinOp { operator, x, y })
    }

    pub fn phi(&mut self, edges: &[(u32, ValueId)], type_id: TypeId) -> ValueId {
        let edges = edges
            .iter()
            .map(|&(block, value)| PhiEdge { block, value })
            .collect();
        self.push(type_id, Op::Phi { edges })
    }

    pub fn extract(&mut self, tuple: ValueId, index: u32, type_id: TypeId) -> ValueId {
        self.push(type_id, Op::Extract { tuple, index })
    }

    pub fn send(&mut self, chan: ValueId, x: ValueId) {
        self.push(T_UNIT, Op::Send { chan, x });
    }

    pub fn recv(&mut self, chan: ValueId) -> ValueId {
        self.push(
            T_INT,
            Op::UnOp {
                operator: UnaryOp::Recv,
                x: chan,
                comma_ok: false,
            },
        )
    }

    /// `v, ok := <-ch`; the result is an `(int, bool)` tuple.
    pub fn recv_ok(&mut self, chan: ValueId) -> ValueId {
        self.push(
            T_RECV_OK,
            Op::UnOp {
                operator: UnaryOp::Recv,
                x: chan,
                comma_ok: true,
            },
        )
    }

    pub fn close(&mut self, chan: ValueId) {
        self.builtin("close", &[chan], T_UNIT);
    }

    pub fn builtin(&mut self, name: &str, args: &[ValueId], type_id: TypeId) -> ValueId {
        let call = self.call_op(Callee::Builtin { name: name.into() }, args);
        self.push(type_id, Op::Call { call })
    }

    /// Select over `arms`; the result tuple is `(index, recvOk, recv values...)`.
    pub fn select(&mut self, arms: &[SelectArm], blocking: bool) -> ValueId {
        let states: Vec<SelectState> = arms
            .iter()
            .map(|arm| match *arm {
                SelectArm::Recv(chan) => SelectState {
                    dir: ChanDir::Recv,
                    chan,
                    send: None,
                    span: None,
                },
                SelectArm::Send(chan, x) => SelectState {
                    dir: ChanDir::Send,
                    chan,
                    send: Some(x),
                    span: None,
                },
            })
            .collect();
        let mut components = vec![T_INT, T_BOOL];
        components.extend(states.iter().filter(|s| s.dir == ChanDir::Recv).map(|_| T_INT));
        let tuple = self.program.tuple_type(&components);
        self.push(tuple, Op::Select { states, blocking })
    }

    pub fn call_static(&mut self, func: &str, args: &[ValueId], type_id: TypeId) -> ValueId {
        let call = self.call_op(Callee::Static { func: func.into() }, args);
        self.push(type_id, Op::Call { call })
    }

    pub fn call(&mut self, func: &str, args: &[ValueId], type_id: TypeId) -> ValueId {
        self.call_static(func, args, type_id)
    }

    pub fn call_value(&mut self, value: ValueId, args: &[ValueId], type_id: TypeId) -> ValueId {
        let call = self.call_op(Callee::Dynamic { value }, args);
        self.push(type_id, Op::Call { call })
    }

    pub fn invoke(&mut self, recv: ValueId, method: &str, args: &[ValueId], type_id: TypeId) -> ValueId {
        let call = self.call_op(
            Callee::Invoke {
                recv,
                method: method.into(),
            },
            args,
        );
        self.push(type_id, Op::Call { call })
    }

    pub fn go(&mut self, func: &str, args: &[ValueId]) -> ValueId {
        let call = self.call_op(Callee::Static { func: func.into() }, args);
        self.push(T_UNIT, Op::Go { call })
    }

    pub fn go_value(&mut self, value: ValueId, args: &[ValueId]) -> ValueId {
        let call = self.call_op(Callee::Dynamic { value }, args);
        self.push(T_UNIT, Op::Go { call })
    }

    pub fn defer(&mut self, func: &str, args: &[ValueId]) -> ValueId {
        let call = self.call_op(Callee::Static { func: func.into() }, args);
        self.push(T_UNIT, Op::Defer { call })
    }

    pub fn defer_value(&mut self, value: ValueId, args: &[ValueId]) -> ValueId {
        let call = self.call_op(Callee::Dynamic { value }, args);
        self.push(T_UNIT, Op::Defer { call })
    }

    pub fn run_defers(&mut self) {
        self.push(T_UNIT, Op::RunDefers);
    }

    pub fn lock(&mut self, mu: ValueId) -> ValueId {
        self.call_static("(*sync.Mutex).Lock", &[mu], T_UNIT)
    }

    pub fn unlock(&mut self, mu: ValueId) -> ValueId {
        self.call_static("(*sync.Mutex).Unlock", &[mu], T_UNIT)
    }

    pub fn rw_lock(&mut self, mu: ValueId) -> ValueId {
        self.call_static("(*sync.RWMutex).Lock", &[mu], T_UNIT)
    }

    pub fn rw_unlock(&mut self, mu: ValueId) -> ValueId {
        self.call_static("(*sync.RWMutex).Unlock", &[mu], T_UNIT)
    }

    pub fn rlock(&mut self, mu: ValueId) -> ValueId {
        self.call_static("(*sync.RWMutex).RLock", &[mu], T_UNIT)
    }

    pub fn runlock(&mut self, mu: ValueId) -> ValueId {
        self.call_static("(*sync.RWMutex).RUnlock", &[mu], T_UNIT)
    }

    pub fn wg_add(&mut self, wg: ValueId, delta: i64) -> ValueId {
        let delta = self.int(delta);
        self.call_static("(*sync.WaitGroup).Add", &[wg, delta], T_UNIT)
    }

    pub fn wg_done(&mut self, wg: ValueId) -> ValueId {
        self.call_static("(*sync.WaitGroup).Done", &[wg], T_UNIT)
    }

    pub fn wg_wait(&mut self, wg: ValueId) -> ValueId {
        self.call_static("(*sync.WaitGroup).Wait", &[wg], T_UNIT)
    }

    pub fn cond_wait(&mut self, cond: ValueId) -> ValueId {
        self.call_static("(*sync.Cond).Wait", &[cond], T_UNIT)
    }

    pub fn signal(&mut self, cond: ValueId) -> ValueId {
        self.call_static("(*sync.Cond).Signal", &[cond], T_UNIT)
    }

    pub fn broadcast(&mut self, cond: ValueId) -> ValueId {
        self.call_static("(*sync.Cond).Broadcast", &[cond], T_UNIT)
    }

    fn edge(&mut self, to_block: u32, kind: EdgeKind) {
        self.func.cfg_edges.push(CfgEdge {
            from_block: self.current,
            to_block,
            kind,
        });
    }

    pub fn jump(&mut self, target: u32) {
        self.push(T_UNIT, Op::Jump);
        self.edge(target, EdgeKind::Unconditional);
    }

    pub fn branch(&mut self, cond: ValueId, then_block: u32, else_block: u32) {
        self.push(T_UNIT, Op::If { cond });
        self.edge(then_block, EdgeKind::CondTrue);
        self.edge(else_block, EdgeKind::CondFalse);
    }

    pub fn ret(&mut self, results: &[ValueId]) {
        self.push(
            T_UNIT,
            Op::Return {
                results: results.to_vec(),
            },
        );
    }

    pub fn panic(&mut self, x: ValueId) {
        self.push(T_UNIT, Op::Panic { x });
    }
}
