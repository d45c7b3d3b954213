//! Owned SSA program model.
//!
//! These types mirror the JSON document produced by the SSA exporter
//! (one `AnalysisInput` per analyzed program). Instructions are a closed
//! tagged union: every analysis pattern-matches on [`Op`].

use serde::{Deserialize, Serialize};

/// Program-wide identifier of an SSA value (instruction, parameter,
/// free variable, global or constant).
pub type ValueId = u32;

/// Identifier of an entry in a package's type table.
pub type TypeId = u32;

/// Root type: the SSA program together with its points-to result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisInput {
    pub packages: Vec<Package>,
    #[serde(default)]
    pub go_version: String,
    #[serde(default)]
    pub bridge_version: String,
    /// Constant operands referenced by instructions.
    #[serde(default)]
    pub constants: Vec<Constant>,
    /// Points-to labels per SSA value. Empty means "estimate them".
    #[serde(default)]
    pub points_to: Vec<PointsToEntry>,
}

/// A Go package with SSA bodies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub import_path: String,
    pub name: String,
    #[serde(default)]
    pub files: Vec<FileInfo>,
    #[serde(default)]
    pub types: Vec<TypeRef>,
    pub functions: Vec<Function>,
    /// Call edges resolved by the points-to analysis.
    #[serde(default)]
    pub call_edges: Vec<CallEdge>,
    #[serde(default)]
    pub global_vars: Vec<Global>,
    /// Part of GOROOT.
    #[serde(default)]
    pub is_stdlib: bool,
}

/// File-level metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub is_test: bool,
}

/// Type reference with unique ID
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeRef {
    pub id: TypeId,
    pub kind: TypeKind,
    pub name: String,
    #[serde(default)]
    pub underlying: TypeId,
    #[serde(default)]
    pub elem: TypeId,
    #[serde(default)]
    pub key: TypeId,
    /// Struct fields and tuple components, in declaration order.
    #[serde(default)]
    pub fields: Vec<FieldInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeKind {
    Basic,
    Named,
    Pointer,
    Slice,
    Array,
    Map,
    Chan,
    Struct,
    Interface,
    Signature,
    Tuple,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub type_id: TypeId,
}

/// A package-level variable. Its value is the address of the variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Global {
    pub id: ValueId,
    pub name: String,
    /// Pointer type of the global's address.
    #[serde(default)]
    pub type_id: TypeId,
    #[serde(default)]
    pub span: Option<Span>,
}

/// Function parameter or captured free variable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub id: ValueId,
    pub name: String,
    #[serde(default)]
    pub type_id: TypeId,
}

/// A constant operand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constant {
    pub id: ValueId,
    #[serde(default)]
    pub type_id: TypeId,
    pub value: ConstValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "kind", content = "value")]
pub enum ConstValue {
    Int(i64),
    Bool(bool),
    Str(String),
    Nil,
    /// Reference to a function by its full name.
    Func(String),
    #[serde(other)]
    Unknown,
}

/// Source location span
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Span {
    pub file: String,
    pub start_line: u32,
    pub start_col: u32,
    #[serde(default)]
    pub end_line: u32,
    #[serde(default)]
    pub end_col: u32,
}

impl Span {
    pub fn new(file: impl Into<String>, line: u32, col: u32) -> Self {
        Self {
            file: file.into(),
            start_line: line,
            start_col: col,
            end_line: line,
            end_col: col,
        }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.start_line, self.start_col)
    }
}

/// SSA Instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub type_id: TypeId,
    #[serde(default)]
    pub span: Option<Span>,
    #[serde(flatten)]
    pub op: Op,
}

/// Instruction payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op")]
pub enum Op {
    Alloc {
        #[serde(default)]
        heap: bool,
    },
    MakeChan {
        size: ValueId,
    },
    MakeMap,
    MakeSlice {
        len: ValueId,
    },
    MakeInterface {
        x: ValueId,
    },
    MakeClosure {
        func: String,
        #[serde(default)]
        bindings: Vec<ValueId>,
    },
    FieldAddr {
        x: ValueId,
        field: String,
    },
    Field {
        x: ValueId,
        field: String,
    },
    IndexAddr {
        x: ValueId,
        index: ValueId,
    },
    Index {
        x: ValueId,
        index: ValueId,
    },
    Lookup {
        x: ValueId,
        index: ValueId,
        #[serde(default)]
        comma_ok: bool,
    },
    Slice {
        x: ValueId,
    },
    UnOp {
        operator: UnaryOp,
        x: ValueId,
        #[serde(default)]
        comma_ok: bool,
    },
    BinOp {
        operator: BinaryOp,
        x: ValueId,
        y: ValueId,
    },
    Phi {
        edges: Vec<PhiEdge>,
    },
    Call {
        call: CallCommon,
    },
    Extract {
        tuple: ValueId,
        index: u32,
    },
    TypeAssert {
        x: ValueId,
        asserted: TypeId,
        #[serde(default)]
        comma_ok: bool,
    },
    Convert {
        x: ValueId,
    },
    ChangeType {
        x: ValueId,
    },
    ChangeInterface {
        x: ValueId,
    },
    Select {
        states: Vec<SelectState>,
        #[serde(default)]
        blocking: bool,
    },
    Range {
        x: ValueId,
    },
    Next {
        iter: ValueId,
    },
    Store {
        addr: ValueId,
        val: ValueId,
    },
    MapUpdate {
        map: ValueId,
        key: ValueId,
        val: ValueId,
    },
    Send {
        chan: ValueId,
        x: ValueId,
    },
    If {
        cond: ValueId,
    },
    Jump,
    Return {
        #[serde(default)]
        results: Vec<ValueId>,
    },
    Panic {
        x: ValueId,
    },
    Go {
        call: CallCommon,
    },
    Defer {
        call: CallCommon,
    },
    RunDefers,
    #[serde(other)]
    Unknown,
}

impl Op {
    /// Whether the instruction ends its basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Op::If { .. } | Op::Jump | Op::Return { .. } | Op::Panic { .. }
        )
    }

    /// Whether the instruction defines a value that other instructions may use.
    pub fn defines_value(&self) -> bool {
        !matches!(
            self,
            Op::Store { .. }
                | Op::MapUpdate { .. }
                | Op::Send { .. }
                | Op::If { .. }
                | Op::Jump
                | Op::Return { .. }
                | Op::Panic { .. }
                | Op::Go { .. }
                | Op::Defer { .. }
                | Op::RunDefers
        )
    }

    /// SSA operands, in a stable order.
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            Op::Alloc { .. } | Op::MakeMap | Op::Jump | Op::RunDefers | Op::Unknown => vec![],
            Op::MakeChan { size } => vec![*size],
            Op::MakeSlice { len } => vec![*len],
            Op::MakeInterface { x }
            | Op::FieldAddr { x, .. }
            | Op::Field { x, .. }
            | Op::Slice { x }
            | Op::UnOp { x, .. }
            | Op::TypeAssert { x, .. }
            | Op::Convert { x }
            | Op::ChangeType { x }
            | Op::ChangeInterface { x }
            | Op::Range { x }
            | Op::Panic { x } => vec![*x],
            Op::MakeClosure { bindings, .. } => bindings.clone(),
            Op::IndexAddr { x, index } | Op::Index { x, index } | Op::Lookup { x, index, .. } => {
                vec![*x, *index]
            }
            Op::BinOp { x, y, .. } => vec![*x, *y],
            Op::Phi { edges } => edges.iter().map(|e| e.value).collect(),
            Op::Call { call } | Op::Go { call } | Op::Defer { call } => call.operands(),
            Op::Extract { tuple, .. } => vec![*tuple],
            Op::Select { states, .. } => states
                .iter()
                .flat_map(|s| std::iter::once(s.chan).chain(s.send))
                .collect(),
            Op::Next { iter } => vec![*iter],
            Op::Store { addr, val } => vec![*addr, *val],
            Op::MapUpdate { map, key, val } => vec![*map, *key, *val],
            Op::Send { chan, x } => vec![*chan, *x],
            Op::If { cond } => vec![*cond],
            Op::Return { results } => results.clone(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Alloc { .. } => "Alloc",
            Op::MakeChan { .. } => "MakeChan",
            Op::MakeMap => "MakeMap",
            Op::MakeSlice { .. } => "MakeSlice",
            Op::MakeInterface { .. } => "MakeInterface",
            Op::MakeClosure { .. } => "MakeClosure",
            Op::FieldAddr { .. } => "FieldAddr",
            Op::Field { .. } => "Field",
            Op::IndexAddr { .. } => "IndexAddr",
            Op::Index { .. } => "Index",
            Op::Lookup { .. } => "Lookup",
            Op::Slice { .. } => "Slice",
            Op::UnOp { .. } => "UnOp",
            Op::BinOp { .. } => "BinOp",
            Op::Phi { .. } => "Phi",
            Op::Call { .. } => "Call",
            Op::Extract { .. } => "Extract",
            Op::TypeAssert { .. } => "TypeAssert",
            Op::Convert { .. } => "Convert",
            Op::ChangeType { .. } => "ChangeType",
            Op::ChangeInterface { .. } => "ChangeInterface",
            Op::Select { .. } => "Select",
            Op::Range { .. } => "Range",
            Op::Next { .. } => "Next",
            Op::Store { .. } => "Store",
            Op::MapUpdate { .. } => "MapUpdate",
            Op::Send { .. } => "Send",
            Op::If { .. } => "If",
            Op::Jump => "Jump",
            Op::Return { .. } => "Return",
            Op::Panic { .. } => "Panic",
            Op::Go { .. } => "Go",
            Op::Defer { .. } => "Defer",
            Op::RunDefers => "RunDefers",
            Op::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// `*x`
    Deref,
    /// `<-x`
    Recv,
    Not,
    Neg,
    Xor,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    And,
    Or,
    #[serde(other)]
    Other,
}

/// Incoming value of a phi along the edge from `block`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhiEdge {
    pub block: u32,
    pub value: ValueId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChanDir {
    Send,
    Recv,
}

/// One communication arm of a select statement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectState {
    pub dir: ChanDir,
    pub chan: ValueId,
    /// Value sent, for send arms.
    #[serde(default)]
    pub send: Option<ValueId>,
    #[serde(default)]
    pub span: Option<Span>,
}

/// Shared shape of `Call`, `Go` and `Defer`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallCommon {
    pub callee: Callee,
    #[serde(default)]
    pub args: Vec<ValueId>,
}

impl CallCommon {
    pub fn operands(&self) -> Vec<ValueId> {
        let mut ops = match &self.callee {
            Callee::Dynamic { value } => vec![*value],
            Callee::Invoke { recv, .. } => vec![*recv],
            Callee::Static { .. } | Callee::Builtin { .. } => vec![],
        };
        ops.extend(self.args.iter().copied());
        ops
    }

    /// Receiver followed by arguments, the way callee parameters see them.
    pub fn actuals(&self) -> Vec<ValueId> {
        match &self.callee {
            Callee::Invoke { recv, .. } => std::iter::once(*recv)
                .chain(self.args.iter().copied())
                .collect(),
            _ => self.args.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum Callee {
    /// Call of a statically known function, by full name.
    Static { func: String },
    /// Call through a function value.
    Dynamic { value: ValueId },
    /// Interface method invocation.
    Invoke { recv: ValueId, method: String },
    /// Built-in function (`close`, `len`, `append`, ...).
    Builtin { name: String },
}

/// CFG edge between basic blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CfgEdge {
    pub from_block: u32,
    pub to_block: u32,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EdgeKind {
    Unconditional,
    CondTrue,
    CondFalse,
    #[serde(other)]
    Unknown,
}

/// SSA Basic Block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlock {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    pub instructions: Vec<Instruction>,
}

/// SSA Function with full CFG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub short_name: String,
    #[serde(default)]
    pub span: Option<Span>,
    #[serde(default)]
    pub params: Vec<Param>,
    /// Free variables captured by this closure, bound by `MakeClosure`.
    #[serde(default)]
    pub free_vars: Vec<Param>,
    /// Empty for external functions.
    #[serde(default)]
    pub blocks: Vec<BasicBlock>,
    #[serde(default)]
    pub cfg_edges: Vec<CfgEdge>,
    #[serde(default)]
    pub is_method: bool,
}

impl Function {
    pub fn has_body(&self) -> bool {
        !self.blocks.is_empty()
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.blocks.iter().flat_map(|b| b.instructions.iter())
    }
}

/// Call graph edge resolved by the points-to analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEdge {
    pub caller: String,
    pub callee: String,
    /// The `Call`/`Go`/`Defer` instruction.
    #[serde(default)]
    pub site: Option<ValueId>,
    #[serde(default)]
    pub span: Option<Span>,
    #[serde(default)]
    pub is_dynamic: bool,
    /// True if this call is via a `go` statement.
    #[serde(default)]
    pub is_go: bool,
    /// True if this call is via a `defer` statement.
    #[serde(default)]
    pub is_defer: bool,
}

/// One access step inside an allocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathElem {
    Field(String),
    /// `[*]`: any element of an array, slice or map.
    ArrayElem,
}

impl std::fmt::Display for PathElem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathElem::Field(name) => write!(f, ".{name}"),
            PathElem::ArrayElem => write!(f, "[*]"),
        }
    }
}

/// An allocation site plus an access path within it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    pub site: ValueId,
    #[serde(default)]
    pub path: Vec<PathElem>,
}

impl Label {
    pub fn new(site: ValueId) -> Self {
        Self { site, path: vec![] }
    }

    pub fn extend(&self, elem: PathElem) -> Self {
        let mut path = self.path.clone();
        path.push(elem);
        Self {
            site: self.site,
            path,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointsToEntry {
    pub value: ValueId,
    pub labels: Vec<Label>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_analysis_input() {
        let json = r#"{
            "packages": [{
                "import_path": "example.com/pkg",
                "name": "main",
                "files": [{"path": "main.go", "package_name": "main"}],
                "types": [{"id": 1, "kind": "Basic", "name": "int"}],
                "functions": [{
                    "name": "main.main",
                    "short_name": "main",
                    "blocks": [{"id": 0, "name": "entry", "instructions": [
                        {"id": 10, "op": "Return"}
                    ]}]
                }]
            }],
            "go_version": "1.22"
        }"#;

        let input: AnalysisInput = serde_json::from_str(json).unwrap();
        assert_eq!(input.packages.len(), 1);
        assert_eq!(input.packages[0].functions[0].short_name, "main");
        assert!(input.packages[0].functions[0].has_body());
        assert!(input.points_to.is_empty());
        assert_eq!(
            input.packages[0].functions[0].blocks[0].instructions[0].op,
            Op::Return { results: vec![] }
        );
    }

    #[test]
    fn test_deserialize_tagged_ops() {
        let json = r#"{"id": 3, "name": "t3", "type_id": 7, "op": "MakeChan", "size": 2}"#;
        let instr: Instruction = serde_json::from_str(json).unwrap();
        assert_eq!(instr.op, Op::MakeChan { size: 2 });

        let json = r#"{"id": 4, "op": "UnOp", "operator": "Recv", "x": 3, "comma_ok": true}"#;
        let instr: Instruction = serde_json::from_str(json).unwrap();
        assert_eq!(
            instr.op,
            Op::UnOp {
                operator: UnaryOp::Recv,
                x: 3,
                comma_ok: true
            }
        );
        assert!(instr.op.defines_value());
        assert!(!Op::Jump.defines_value());
    }

    #[test]
    fn test_deserialize_call_and_select() {
        let json = r#"{
            "id": 9, "op": "Call",
            "call": {"callee": {"kind": "Static", "func": "(*sync.Mutex).Lock"}, "args": [5]}
        }"#;
        let instr: Instruction = serde_json::from_str(json).unwrap();
        match &instr.op {
            Op::Call { call } => {
                assert_eq!(
                    call.callee,
                    Callee::Static {
                        func: "(*sync.Mutex).Lock".into()
                    }
                );
                assert_eq!(call.actuals(), vec![5]);
            }
            other => panic!("expected call, got {other:?}"),
        }

        let json = r#"{
            "id": 12, "op": "Select", "blocking": false,
            "states": [{"dir": "Recv", "chan": 3}, {"dir": "Send", "chan": 4, "send": 8}]
        }"#;
        let instr: Instruction = serde_json::from_str(json).unwrap();
        assert_eq!(instr.op.operands(), vec![3, 4, 8]);
    }

    #[test]
    fn test_unknown_op_and_const_values() {
        let instr: Instruction =
            serde_json::from_str(r#"{"id": 1, "op": "DebugRef"}"#).unwrap();
        assert_eq!(instr.op, Op::Unknown);

        let c: Constant =
            serde_json::from_str(r#"{"id": 2, "value": {"kind": "Int", "value": 3}}"#).unwrap();
        assert_eq!(c.value, ConstValue::Int(3));
        let c: Constant = serde_json::from_str(r#"{"id": 3, "value": {"kind": "Nil"}}"#).unwrap();
        assert_eq!(c.value, ConstValue::Nil);
    }

    #[test]
    fn test_span_creation() {
        let span = Span::new("main.go", 10, 5);
        assert_eq!(span.file, "main.go");
        assert_eq!(span.start_line, 10);
        assert_eq!(span.start_col, 5);
        assert_eq!(span.to_string(), "main.go:10:5");
    }

    #[test]
    fn test_label_extend() {
        let l = Label::new(4).extend(PathElem::Field("mu".into()));
        let l = l.extend(PathElem::ArrayElem);
        assert_eq!(l.site, 4);
        assert_eq!(l.path.len(), 2);
        assert_eq!(l.path[0].to_string(), ".mu");
    }
}
