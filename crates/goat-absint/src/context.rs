//! Read-only inputs of one analysis run.

use std::collections::{BTreeSet, VecDeque};

use rustc_hash::FxHashSet;

use goat_cfg::ProgramCfg;
use goat_ir::ir::ValueId;
use goat_ir::{FuncId, Program};
use goat_upfront::{EntryFacts, PSet, ProgramFacts};

use crate::options::AnalysisOptions;

/// Program, pre-analysis facts, focus and options for one entry and P-set.
pub struct AnalysisContext<'a> {
    pub program: &'a Program,
    pub facts: &'a ProgramFacts,
    pub entry_facts: &'a EntryFacts,
    pub entry: FuncId,
    /// Allocation sites of the focused primitives.
    pub focus: BTreeSet<ValueId>,
    pub options: &'a AnalysisOptions,
    relevant: FxHashSet<FuncId>,
    /// Relevant functions that may call themselves.
    recursive: FxHashSet<FuncId>,
}

impl<'a> AnalysisContext<'a> {
    pub fn new(
        program: &'a Program,
        facts: &'a ProgramFacts,
        entry_facts: &'a EntryFacts,
        pset: &PSet,
        options: &'a AnalysisOptions,
    ) -> Self {
        let mut ctx = Self {
            program,
            facts,
            entry_facts,
            entry: pset.entry,
            focus: pset.primitives.clone(),
            options,
            relevant: FxHashSet::default(),
            recursive: FxHashSet::default(),
        };
        ctx.relevant = ctx.relevant_functions();
        ctx.recursive = ctx
            .relevant
            .iter()
            .copied()
            .filter(|f| facts.call_graph.transitive_callees(*f).contains(f))
            .collect();
        ctx
    }

    pub fn cfg(&self) -> &'a ProgramCfg {
        &self.facts.cfg
    }

    pub fn is_focused(&self, site: ValueId) -> bool {
        self.focus.contains(&site)
    }

    /// Whether `value` may refer to a focused primitive.
    pub fn touches_focus(&self, value: ValueId) -> bool {
        self.facts
            .primitives
            .of_value(&self.facts.points_to, value)
            .iter()
            .any(|p| self.is_focused(*p))
    }

    /// Functions that allocate or use a focused primitive, and every
    /// function that may call or spawn one of them.
    fn relevant_functions(&self) -> FxHashSet<FuncId> {
        let mut queue: VecDeque<FuncId> = VecDeque::from([self.entry]);
        for (func, usage) in self.entry_facts.usage.iter() {
            let touches = usage
                .created
                .iter()
                .chain(&usage.out_chans)
                .copied()
                .chain(usage.used())
                .any(|p| self.is_focused(p));
            if touches {
                queue.push_back(func);
            }
        }
        queue.extend(
            self.focus
                .iter()
                .filter_map(|p| self.facts.primitives.get(*p).and_then(|p| p.func)),
        );
        let mut relevant = FxHashSet::default();
        while let Some(func) = queue.pop_front() {
            if relevant.insert(func) {
                queue.extend(self.facts.call_graph.calls_to(func).iter().map(|(caller, _)| *caller));
            }
        }
        relevant
    }

    pub fn is_relevant(&self, func: FuncId) -> bool {
        self.relevant.contains(&func)
    }

    /// Whether a frame of `func` may still be active below one that
    /// returns, so its registers must outlive the return.
    pub fn is_recursive(&self, func: FuncId) -> bool {
        self.recursive.contains(&func)
    }

    /// Registers of a frame of `func`.
    pub fn registers(&self, func: FuncId) -> FxHashSet<ValueId> {
        let func = self.program.function(func);
        func.params
            .iter()
            .chain(&func.free_vars)
            .map(|p| p.id)
            .chain(func.instructions().map(|i| i.id))
            .collect()
    }

    /// Callees the interpreter steps into; every other callee is summarized.
    pub fn enters(&self, func: FuncId) -> bool {
        self.program.function(func).has_body()
            && self.is_relevant(func)
            && !(self.options.skip_goroot && self.program.is_stdlib(func))
    }
}
