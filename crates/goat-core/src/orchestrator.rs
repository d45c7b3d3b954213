//! Analysis orchestrator: pre-analysis, per-entry and per-P-set runs,
//! panic isolation and result aggregation.

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use goat_absint::{
    AnalysisContext, AnalysisError, AnalysisResult, Block, Classification, Metrics, PanicFinding,
};
use goat_diagnostics::rules::{DEADLOCK, DEFINITE_PANIC, LEAK, PARTIAL_DEADLOCK};
use goat_diagnostics::{AnalysisSummary, Diagnostic, DiagnosticBuilder, DiagnosticSource, Severity};
use goat_ir::ir::Span;
use goat_ir::{FuncId, InputError, Program};
use goat_upfront::{EntryFacts, PSet, ProgramFacts};

use crate::config::{ConfigError, RunSettings};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid input: {0}")]
    Input(#[from] InputError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Complete,
    /// The deadline elapsed; blocks found so far are still listed.
    Skipped,
    /// The interpreter failed on this entry.
    Panic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryFailure {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superloc: Option<String>,
}

/// Result of one entry function and one P-set.
#[derive(Debug, Clone, Serialize)]
pub struct EntryReport {
    pub entry: String,
    /// Function the exploration started from.
    pub root: String,
    /// Names of the focused primitives.
    pub pset: Vec<String>,
    pub outcome: Outcome,
    pub blocks: Vec<Block>,
    pub panics: Vec<PanicFinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visualization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EntryFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub entries: usize,
    pub complete: usize,
    pub skipped: usize,
    pub panicked: usize,
    pub blocks: usize,
    pub panics: usize,
    pub wall_time_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub entries: Vec<EntryReport>,
    pub summary: ReportSummary,
}

impl AnalysisReport {
    fn new(entries: Vec<EntryReport>, started: Instant) -> Self {
        let count = |o: Outcome| entries.iter().filter(|e| e.outcome == o).count();
        let summary = ReportSummary {
            entries: entries.len(),
            complete: count(Outcome::Complete),
            skipped: count(Outcome::Skipped),
            panicked: count(Outcome::Panic),
            blocks: entries.iter().map(|e| e.blocks.len()).sum(),
            panics: entries.iter().map(|e| e.panics.len()).sum(),
            wall_time_ms: started.elapsed().as_millis(),
        };
        Self { entries, summary }
    }

    /// Distinct findings counted by severity.
    pub fn severity_summary(&self) -> AnalysisSummary {
        AnalysisSummary::from_diagnostics(&self.diagnostics(0), self.summary.wall_time_ms as u64)
    }

    /// Some finding is at least as severe as `threshold`.
    pub fn has_findings_at(&self, threshold: Severity) -> bool {
        self.severity_summary().has_issues_above(threshold)
    }

    /// Some entry did not run to completion.
    pub fn has_failures(&self) -> bool {
        self.summary.skipped + self.summary.panicked > 0
    }

    /// One diagnostic per distinct finding, sorted by position and
    /// truncated to `max_findings` when non-zero.
    pub fn diagnostics(&self, max_findings: usize) -> Vec<Diagnostic> {
        let mut seen = BTreeSet::new();
        let mut diags: Vec<Diagnostic> = self
            .entries
            .iter()
            .flat_map(|report| {
                let blocks = report.blocks.iter().map(|b| block_diagnostic(&report.entry, b));
                let panics = report.panics.iter().map(|p| panic_diagnostic(&report.entry, p));
                blocks.chain(panics)
            })
            .filter(|d| seen.insert((d.id.clone(), d.explanation.clone(), d.entry.clone())))
            .collect();

        diags.sort_by(|a, b| {
            a.location
                .file
                .cmp(&b.location.file)
                .then(a.location.line.cmp(&b.location.line))
                .then(b.severity.cmp(&a.severity))
        });
        if max_findings > 0 && diags.len() > max_findings {
            diags.truncate(max_findings);
        }
        diags
    }
}

fn position(span: Option<&Span>, fallback: &str) -> (String, u32, u32, u32, u32) {
    match span {
        Some(s) => (s.file.clone(), s.start_line, s.start_col, s.end_line, s.end_col),
        None => (fallback.to_string(), 0, 0, 0, 0),
    }
}

fn block_diagnostic(entry: &str, block: &Block) -> Diagnostic {
    let (rule, severity, title) = match block.classification {
        Classification::Deadlock => (DEADLOCK, Severity::Critical, "deadlock"),
        Classification::Leak => (LEAK, Severity::Error, "goroutine leak"),
        Classification::Partial => (PARTIAL_DEADLOCK, Severity::Warning, "partial deadlock"),
    };
    // Blocks always name at least one goroutine; an empty one renders as a
    // location-less finding.
    let Some((first, rest)) = block.blocked.split_first() else {
        return DiagnosticBuilder::new(rule, severity, title, DiagnosticSource::Blocking)
            .explanation(format!("blocked configuration {}", block.superloc))
            .path(block.path.clone())
            .entry(entry)
            .build();
    };
    let (file, line, col, end_line, end_col) = position(first.span.as_ref(), &first.location);
    let mut explanation = format!(
        "{} blocks forever on {} at {}",
        first.goroutine, first.operation, first.location
    );
    if !first.holders.is_empty() {
        explanation.push_str(&format!(" (held by {})", first.holders.join(", ")));
    }
    let mut builder = DiagnosticBuilder::new(
        rule,
        severity,
        format!("{title}: {} blocked on {}", first.goroutine, first.operation),
        DiagnosticSource::Blocking,
    )
    .location(file, line, col)
    .explanation(explanation)
    .path(block.path.clone())
    .entry(entry);
    if end_line > 0 {
        builder = builder.end_location(end_line, end_col);
    }
    for other in rest {
        let (file, line, col, _, _) = position(other.span.as_ref(), &other.location);
        builder = builder.related(
            file,
            line,
            col,
            format!("{} blocks on {}", other.goroutine, other.operation),
        );
    }
    builder.build()
}

fn panic_diagnostic(entry: &str, finding: &PanicFinding) -> Diagnostic {
    let (file, line, col, end_line, end_col) = position(finding.span.as_ref(), &finding.location);
    let mut builder = DiagnosticBuilder::new(
        DEFINITE_PANIC,
        Severity::Critical,
        format!("panic: {}", finding.reason),
        DiagnosticSource::Panic,
    )
    .location(file, line, col)
    .explanation(format!(
        "{} always panics at {}: {}",
        finding.goroutine, finding.location, finding.reason
    ))
    .path(finding.path.clone())
    .entry(entry);
    if end_line > 0 {
        builder = builder.end_location(end_line, end_col);
    }
    builder.build()
}

/// Load an input file and analyze it.
pub fn analyze_file(path: &Path, settings: &RunSettings) -> Result<AnalysisReport, OrchestratorError> {
    let program = goat_ir::load_json_file(path)?;
    analyze_program(&program, settings)
}

/// Analyze every entry function of `program`.
///
/// Input errors abort the run. Failures inside the interpreter are
/// confined to the entry and P-set they occur in.
pub fn analyze_program(
    program: &Program,
    settings: &RunSettings,
) -> Result<AnalysisReport, OrchestratorError> {
    let started = Instant::now();
    if settings.analysis.skip_goroot {
        warn!("standard-library primitives are treated as unknown; results may be unsound");
    }
    let entries = program.entry_functions(settings.entry_function.as_deref(), settings.include_tests)?;
    let facts = ProgramFacts::compute(program, settings.upfront);
    info!(
        entries = entries.len(),
        policy = %settings.policy,
        "analysis started"
    );

    let mut reports = Vec::new();
    for entry in entries {
        reports.extend(analyze_entry(program, &facts, entry, settings));
    }
    let report = AnalysisReport::new(reports, started);
    info!(
        blocks = report.summary.blocks,
        panics = report.summary.panics,
        wall_time_ms = report.summary.wall_time_ms as u64,
        "analysis finished"
    );
    Ok(report)
}

fn analyze_entry(
    program: &Program,
    facts: &ProgramFacts,
    entry: FuncId,
    settings: &RunSettings,
) -> Vec<EntryReport> {
    let name = &program.function(entry).name;
    let prepared = panic::catch_unwind(AssertUnwindSafe(|| {
        let entry_facts = facts.entry(program, entry);
        let psets = entry_facts.psets(program, facts, settings.policy);
        (entry_facts, psets)
    }));
    let (entry_facts, psets) = match prepared {
        Ok(prepared) => prepared,
        Err(payload) => {
            let failure = EntryFailure {
                message: panic_message(payload.as_ref()),
                superloc: None,
            };
            warn!(entry = %name, error = %failure.message, "pre-analysis panicked");
            return vec![failed(name, name, Vec::new(), failure)];
        }
    };
    info!(entry = %name, psets = psets.len(), "entry prepared");

    if psets.is_empty() {
        return vec![EntryReport {
            entry: name.clone(),
            root: name.clone(),
            pset: Vec::new(),
            outcome: Outcome::Complete,
            blocks: Vec::new(),
            panics: Vec::new(),
            metrics: None,
            visualization: None,
            error: None,
        }];
    }
    psets
        .iter()
        .map(|pset| analyze_pset(program, facts, &entry_facts, name, pset, settings))
        .collect()
}

fn analyze_pset(
    program: &Program,
    facts: &ProgramFacts,
    entry_facts: &EntryFacts,
    entry: &str,
    pset: &PSet,
    settings: &RunSettings,
) -> EntryReport {
    let root = program.function(pset.entry).name.clone();
    let names: Vec<String> = pset
        .primitives
        .iter()
        .map(|p| facts.channel_names.describe(*p, program))
        .collect();
    info!(entry, root = %root, pset = ?names, "analyzing P-set");

    let run = panic::catch_unwind(AssertUnwindSafe(|| {
        let ctx = AnalysisContext::new(program, facts, entry_facts, pset, &settings.analysis);
        goat_absint::analyze(&ctx)
    }));
    match run {
        Ok(Ok(result)) => completed(entry, root, names, result, settings),
        Ok(Err(err)) => {
            warn!(entry, root = %root, error = %err, "analysis failed");
            failed(entry, &root, names, failure_of(&err))
        }
        Err(payload) => {
            let failure = EntryFailure {
                message: panic_message(payload.as_ref()),
                superloc: None,
            };
            warn!(entry, root = %root, error = %failure.message, "analysis panicked");
            failed(entry, &root, names, failure)
        }
    }
}

fn completed(
    entry: &str,
    root: String,
    pset: Vec<String>,
    result: AnalysisResult,
    settings: &RunSettings,
) -> EntryReport {
    let outcome = if result.timed_out {
        warn!(entry, root = %root, "deadline elapsed; reporting partial results");
        Outcome::Skipped
    } else {
        Outcome::Complete
    };
    EntryReport {
        entry: entry.to_string(),
        root,
        pset,
        outcome,
        blocks: result.blocks,
        panics: result.panics,
        metrics: settings.metrics.then_some(result.metrics),
        visualization: result.visualization,
        error: None,
    }
}

fn failed(entry: &str, root: &str, pset: Vec<String>, failure: EntryFailure) -> EntryReport {
    EntryReport {
        entry: entry.to_string(),
        root: root.to_string(),
        pset,
        outcome: Outcome::Panic,
        blocks: Vec::new(),
        panics: Vec::new(),
        metrics: None,
        visualization: None,
        error: Some(failure),
    }
}

fn failure_of(err: &AnalysisError) -> EntryFailure {
    EntryFailure {
        message: err.to_string(),
        superloc: err.superloc().map(str::to_string),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "analysis panicked".to_string()
    }
}
