//! Validated, indexed view of an [`AnalysisInput`].

use std::path::Path;

use rustc_hash::FxHashMap;

use crate::ir::{
    AnalysisInput, CallEdge, Constant, Function, Global, Instruction, PointsToEntry, Span, TypeId,
    ValueId,
};
use crate::types::TypeMap;

/// Dense index of a function in the program.
pub type FuncId = u32;

/// Malformed or inconsistent SSA/points-to input.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse analysis input: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("value id {0} is defined more than once")]
    DuplicateValue(ValueId),
    #[error("function {0} is defined more than once")]
    DuplicateFunction(String),
    #[error("{func}: operand {value} of instruction {instr} is never defined")]
    DanglingOperand {
        func: String,
        instr: ValueId,
        value: ValueId,
    },
    #[error("{func}: block {block} is out of order or missing")]
    MissingBlock { func: String, block: u32 },
    #[error("{func}: block {block} does not end in a control instruction")]
    UnterminatedBlock { func: String, block: u32 },
    #[error("points-to entry for unknown value {0}")]
    UnknownPointsToValue(ValueId),
    #[error("no entry function matches {0:?}")]
    MissingEntry(String),
}

/// Where an SSA value is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    Instr { func: FuncId, block: u32, index: u32 },
    Param { func: FuncId, index: u32 },
    FreeVar { func: FuncId, index: u32 },
    Global { index: u32 },
    Const { index: u32 },
}

#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub import_path: String,
    pub name: String,
    pub is_stdlib: bool,
}

#[derive(Debug, Clone)]
pub struct Program {
    functions: Vec<Function>,
    function_package: Vec<usize>,
    packages: Vec<PackageInfo>,
    by_name: FxHashMap<String, FuncId>,
    values: FxHashMap<ValueId, ValueDef>,
    globals: Vec<Global>,
    constants: Vec<Constant>,
    call_edges: Vec<CallEdge>,
    points_to: Vec<PointsToEntry>,
    test_files: Vec<String>,
    pub types: TypeMap,
}

impl Program {
    pub fn load_file(path: &Path) -> Result<Self, InputError> {
        let text = std::fs::read_to_string(path).map_err(|source| InputError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, InputError> {
        let input: AnalysisInput = serde_json::from_str(text)?;
        Self::new(input)
    }

    pub fn new(input: AnalysisInput) -> Result<Self, InputError> {
        let types = TypeMap::from_input(&input);
        let mut program = Program {
            functions: vec![],
            function_package: vec![],
            packages: vec![],
            by_name: FxHashMap::default(),
            values: FxHashMap::default(),
            globals: vec![],
            constants: input.constants,
            call_edges: vec![],
            points_to: input.points_to,
            test_files: vec![],
            types,
        };

        for (index, c) in program.constants.iter().enumerate() {
            define(&mut program.values, c.id, ValueDef::Const { index: index as u32 })?;
        }

        for (pkg_index, pkg) in input.packages.into_iter().enumerate() {
            program.packages.push(PackageInfo {
                import_path: pkg.import_path,
                name: pkg.name,
                is_stdlib: pkg.is_stdlib,
            });
            program.test_files.extend(
                pkg.files
                    .iter()
                    .filter(|f| f.is_test)
                    .map(|f| f.path.clone()),
            );
            for g in pkg.global_vars {
                let index = program.globals.len() as u32;
                define(&mut program.values, g.id, ValueDef::Global { index })?;
                program.globals.push(g);
            }
            program.call_edges.extend(pkg.call_edges);
            for func in pkg.functions {
                let id = program.functions.len() as FuncId;
                if program.by_name.insert(func.name.clone(), id).is_some() {
                    return Err(InputError::DuplicateFunction(func.name));
                }
                index_function(&mut program.values, id, &func)?;
                program.functions.push(func);
                program.function_package.push(pkg_index);
            }
        }

        program.validate()?;
        Ok(program)
    }

    fn validate(&self) -> Result<(), InputError> {
        for func in &self.functions {
            for (i, block) in func.blocks.iter().enumerate() {
                if block.id as usize != i {
                    return Err(InputError::MissingBlock {
                        func: func.name.clone(),
                        block: block.id,
                    });
                }
                let terminated = block
                    .instructions
                    .last()
                    .is_some_and(|instr| instr.op.is_terminator());
                if !terminated {
                    return Err(InputError::UnterminatedBlock {
                        func: func.name.clone(),
                        block: block.id,
                    });
                }
                for instr in &block.instructions {
                    for operand in instr.op.operands() {
                        if !self.values.contains_key(&operand) {
                            return Err(InputError::DanglingOperand {
                                func: func.name.clone(),
                                instr: instr.id,
                                value: operand,
                            });
                        }
                    }
                }
            }
            for edge in &func.cfg_edges {
                for block in [edge.from_block, edge.to_block] {
                    if block as usize >= func.blocks.len() {
                        return Err(InputError::MissingBlock {
                            func: func.name.clone(),
                            block,
                        });
                    }
                }
            }
        }
        for entry in &self.points_to {
            if !self.values.contains_key(&entry.value) {
                return Err(InputError::UnknownPointsToValue(entry.value));
            }
        }
        Ok(())
    }

    pub fn functions(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .map(|(i, f)| (i as FuncId, f))
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id as usize]
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn func_id(&self, name: &str) -> Option<FuncId> {
        self.by_name.get(name).copied()
    }

    pub fn package_of(&self, id: FuncId) -> &PackageInfo {
        &self.packages[self.function_package[id as usize]]
    }

    pub fn is_stdlib(&self, id: FuncId) -> bool {
        self.package_of(id).is_stdlib
    }

    pub fn value_def(&self, value: ValueId) -> Option<ValueDef> {
        self.values.get(&value).copied()
    }

    /// Instruction defining `value`, if it is an instruction.
    pub fn instruction(&self, value: ValueId) -> Option<&Instruction> {
        match self.values.get(&value)? {
            ValueDef::Instr { func, block, index } => Some(
                &self.functions[*func as usize].blocks[*block as usize].instructions
                    [*index as usize],
            ),
            _ => None,
        }
    }

    /// Function owning `value`, for instructions, parameters and free variables.
    pub fn value_func(&self, value: ValueId) -> Option<FuncId> {
        match self.values.get(&value)? {
            ValueDef::Instr { func, .. }
            | ValueDef::Param { func, .. }
            | ValueDef::FreeVar { func, .. } => Some(*func),
            ValueDef::Global { .. } | ValueDef::Const { .. } => None,
        }
    }

    pub fn constant(&self, value: ValueId) -> Option<&Constant> {
        match self.values.get(&value)? {
            ValueDef::Const { index } => self.constants.get(*index as usize),
            _ => None,
        }
    }

    pub fn global(&self, value: ValueId) -> Option<&Global> {
        match self.values.get(&value)? {
            ValueDef::Global { index } => self.globals.get(*index as usize),
            _ => None,
        }
    }

    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    pub fn call_edges(&self) -> &[CallEdge] {
        &self.call_edges
    }

    pub fn points_to_entries(&self) -> &[PointsToEntry] {
        &self.points_to
    }

    pub fn value_type(&self, value: ValueId) -> TypeId {
        match self.values.get(&value) {
            Some(ValueDef::Instr { .. }) => self.instruction(value).map_or(0, |i| i.type_id),
            Some(ValueDef::Param { func, index }) => {
                self.functions[*func as usize].params[*index as usize].type_id
            }
            Some(ValueDef::FreeVar { func, index }) => {
                self.functions[*func as usize].free_vars[*index as usize].type_id
            }
            Some(ValueDef::Global { index }) => self.globals[*index as usize].type_id,
            Some(ValueDef::Const { index }) => self.constants[*index as usize].type_id,
            None => 0,
        }
    }

    /// Human-readable name of a value for reports.
    pub fn value_name(&self, value: ValueId) -> String {
        match self.values.get(&value) {
            Some(ValueDef::Instr { .. }) => match self.instruction(value) {
                Some(i) if !i.name.is_empty() => i.name.clone(),
                _ => format!("t{value}"),
            },
            Some(ValueDef::Param { func, index }) => {
                self.functions[*func as usize].params[*index as usize].name.clone()
            }
            Some(ValueDef::FreeVar { func, index }) => {
                self.functions[*func as usize].free_vars[*index as usize].name.clone()
            }
            Some(ValueDef::Global { index }) => self.globals[*index as usize].name.clone(),
            Some(ValueDef::Const { index }) => format!("{:?}", self.constants[*index as usize].value),
            None => format!("v{value}"),
        }
    }

    pub fn span_of(&self, value: ValueId) -> Option<&Span> {
        match self.values.get(&value)? {
            ValueDef::Instr { .. } => self.instruction(value)?.span.as_ref(),
            ValueDef::Global { index } => self.globals[*index as usize].span.as_ref(),
            ValueDef::Param { func, .. } | ValueDef::FreeVar { func, .. } => {
                self.functions[*func as usize].span.as_ref()
            }
            ValueDef::Const { .. } => None,
        }
    }

    pub fn is_test_function(&self, id: FuncId) -> bool {
        let func = self.function(id);
        let in_test_file = func
            .span
            .as_ref()
            .is_some_and(|s| self.test_files.iter().any(|f| f == &s.file) || s.file.ends_with("_test.go"));
        func.short_name.starts_with("Test") && (in_test_file || func.span.is_none())
    }

    /// Entry functions: those whose name ends with `suffix`, or else every
    /// `main.main` (plus `Test*` functions when requested).
    pub fn entry_functions(
        &self,
        suffix: Option<&str>,
        include_tests: bool,
    ) -> Result<Vec<FuncId>, InputError> {
        let entries: Vec<FuncId> = self
            .functions()
            .filter(|(_, f)| f.has_body())
            .filter(|(id, f)| match suffix {
                Some(suffix) => f.name.ends_with(suffix),
                None => {
                    (f.short_name == "main" && self.package_of(*id).name == "main")
                        || (include_tests && self.is_test_function(*id))
                }
            })
            .map(|(id, _)| id)
            .collect();
        if entries.is_empty() {
            return Err(InputError::MissingEntry(
                suffix.unwrap_or("main").to_string(),
            ));
        }
        Ok(entries)
    }
}

fn define(
    values: &mut FxHashMap<ValueId, ValueDef>,
    id: ValueId,
    def: ValueDef,
) -> Result<(), InputError> {
    if values.insert(id, def).is_some() {
        return Err(InputError::DuplicateValue(id));
    }
    Ok(())
}

fn index_function(
    values: &mut FxHashMap<ValueId, ValueDef>,
    func: FuncId,
    f: &Function,
) -> Result<(), InputError> {
    for (index, p) in f.params.iter().enumerate() {
        define(values, p.id, ValueDef::Param { func, index: index as u32 })?;
    }
    for (index, p) in f.free_vars.iter().enumerate() {
        define(values, p.id, ValueDef::FreeVar { func, index: index as u32 })?;
    }
    for (b, block) in f.blocks.iter().enumerate() {
        for (i, instr) in block.instructions.iter().enumerate() {
            define(
                values,
                instr.id,
                ValueDef::Instr {
                    func,
                    block: b as u32,
                    index: i as u32,
                },
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = r#"{
        "packages": [{
            "import_path": "main",
            "name": "main",
            "files": [{"path": "main.go"}],
            "functions": [{
                "name": "main.main",
                "short_name": "main",
                "blocks": [{"id": 0, "instructions": [
                    {"id": 10, "name": "t0", "type_id": 2, "op": "MakeChan", "size": 1},
                    {"id": 11, "op": "Return"}
                ]}]
            }, {
                "name": "sync.runtime_Semacquire",
                "short_name": "runtime_Semacquire"
            }]
        }],
        "constants": [{"id": 1, "type_id": 1, "value": {"kind": "Int", "value": 0}}]
    }"#;

    #[test]
    fn test_index_values() {
        let program = Program::from_json(SIMPLE).unwrap();
        assert_eq!(program.function_count(), 2);
        let main = program.func_id("main.main").unwrap();
        assert_eq!(program.value_func(10), Some(main));
        assert_eq!(program.value_type(10), 2);
        assert_eq!(program.value_name(10), "t0");
        assert!(program.constant(1).is_some());
        assert!(program.instruction(1).is_none());
        assert_eq!(program.entry_functions(None, false).unwrap(), vec![main]);
    }

    #[test]
    fn test_dangling_operand_is_rejected() {
        let broken = SIMPLE.replace(r#""size": 1"#, r#""size": 99"#);
        let err = Program::from_json(&broken).unwrap_err();
        assert!(matches!(err, InputError::DanglingOperand { value: 99, .. }));
    }

    #[test]
    fn test_duplicate_value_is_rejected() {
        let broken = SIMPLE.replace(r#""id": 11"#, r#""id": 10"#);
        assert!(matches!(
            Program::from_json(&broken).unwrap_err(),
            InputError::DuplicateValue(10)
        ));
    }

    #[test]
    fn test_missing_entry() {
        let program = Program::from_json(SIMPLE).unwrap();
        assert!(matches!(
            program.entry_functions(Some("nothing"), false),
            Err(InputError::MissingEntry(_))
        ));
    }
}
