//! Human-readable names for channel allocation sites.

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use goat_ir::ir::{Function, Op, ValueId};
use goat_ir::Program;

/// `function.variable` per `make(chan ...)` site, for reports only.
#[derive(Debug, Clone, Default)]
pub struct ChannelNames {
    names: FxHashMap<ValueId, String>,
}

fn is_synthetic(name: &str) -> bool {
    name.is_empty()
        || (name.starts_with('t') && name.len() > 1 && name[1..].chars().all(|c| c.is_ascii_digit()))
}

fn names_in(func: &Function) -> Vec<(ValueId, String)> {
    // Variables a channel is stored into carry the source name.
    let mut stored_into: FxHashMap<ValueId, &str> = FxHashMap::default();
    let allocs: FxHashMap<ValueId, &str> = func
        .instructions()
        .filter(|i| matches!(i.op, Op::Alloc { .. }) && !is_synthetic(&i.name))
        .map(|i| (i.id, i.name.as_str()))
        .collect();
    for instr in func.instructions() {
        if let Op::Store { addr, val } = instr.op {
            if let Some(var) = allocs.get(&addr) {
                stored_into.entry(val).or_insert(*var);
            }
        }
    }

    func.instructions()
        .filter(|i| matches!(i.op, Op::MakeChan { .. }))
        .map(|i| {
            let var = stored_into
                .get(&i.id)
                .copied()
                .unwrap_or(i.name.as_str());
            let var = if var.is_empty() { "chan" } else { var };
            (i.id, format!("{}.{}", func.short_name, var))
        })
        .collect()
}

impl ChannelNames {
    pub fn collect(program: &Program) -> Self {
        let functions: Vec<&Function> = program.functions().map(|(_, f)| f).collect();
        let names = functions
            .par_iter()
            .flat_map_iter(|f| names_in(f))
            .collect();
        Self { names }
    }

    pub fn get(&self, site: ValueId) -> Option<&str> {
        self.names.get(&site).map(String::as_str)
    }

    /// Name of a channel site, or a positional fallback.
    pub fn describe(&self, site: ValueId, program: &Program) -> String {
        match self.get(site) {
            Some(name) => name.to_string(),
            None => program.value_name(site),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goat_ir::builder::ProgramBuilder;
    use goat_ir::ir::Instruction;

    #[test]
    fn test_names_prefer_variables() {
        let mut b = ProgramBuilder::new();
        let ptr = b.pointer_type(goat_ir::builder::T_CHAN_INT);
        let (mut stored, mut bare) = (0, 0);
        b.func("main.main", &[], |f| {
            let var = f.alloc(ptr);
            stored = f.make_chan(0);
            f.store(var, stored);
            bare = f.make_chan(1);
            f.ret(&[]);
        });
        let mut input = b.input();
        // Give the variable its source name.
        for pkg in &mut input.packages {
            for func in &mut pkg.functions {
                for block in &mut func.blocks {
                    for instr in &mut block.instructions {
                        rename_alloc(instr);
                    }
                }
            }
        }
        let p = Program::new(input).unwrap();
        let names = ChannelNames::collect(&p);
        assert_eq!(names.get(stored), Some("main.done"));
        assert!(names.get(bare).unwrap().starts_with("main.t"));
        assert_eq!(names.len(), 2);
    }

    fn rename_alloc(instr: &mut Instruction) {
        if matches!(instr.op, Op::Alloc { .. }) {
            instr.name = "done".into();
        }
    }
}
