//! Failures inside the abstract interpreter.
//!
//! Every variant is an analysis panic: the orchestrator catches it at entry
//! granularity, reports the entry as `panic` and moves on.

use goat_ir::FuncId;

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// A goroutine spawn site produced more live instances than the bound,
    /// or a spawn chain is recursive.
    #[error("unbounded goroutine spawn at {site}: more than {bound} live instances")]
    UnboundedSpawn { site: String, bound: usize },
    #[error("function {0} has no body to analyze")]
    MissingBody(FuncId),
    #[error("malformed configuration {superloc}: {message}")]
    MalformedConfiguration { superloc: String, message: String },
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl AnalysisError {
    /// Description of the superlocation the error was raised in, if any.
    pub fn superloc(&self) -> Option<&str> {
        match self {
            AnalysisError::MalformedConfiguration { superloc, .. } => Some(superloc),
            _ => None,
        }
    }
}
