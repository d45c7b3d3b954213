//! Abstract interpretation of goroutines over a superlocation graph.
//!
//! For one entry function and one P-set, the driver explores every
//! reachable combination of goroutine control locations, tracking the
//! focused primitives precisely and everything else as top. The reporter
//! then reads blocked goroutines and definite panics off the graph.

pub mod context;
pub mod driver;
pub mod error;
pub mod eval;
pub mod goro;
pub mod intra;
pub mod memory;
pub mod options;
pub mod reporter;
pub mod state;
pub mod transitions;
pub mod value;
pub mod visualize;

use tracing::info;

pub use context::AnalysisContext;
pub use driver::{Metrics, SuperlocGraph};
pub use error::AnalysisError;
pub use goro::{Context, CtrLoc, Goro, Superloc};
pub use options::{AnalysisOptions, WorklistOrder};
pub use reporter::{Block, BlockedGoroutine, Classification, PanicFinding};
pub use transitions::{PanicReason, TransitionKind};

/// Outcome of one entry and P-set.
#[derive(Debug)]
pub struct AnalysisResult {
    pub blocks: Vec<Block>,
    pub panics: Vec<PanicFinding>,
    pub metrics: Metrics,
    /// The deadline cut the exploration short.
    pub timed_out: bool,
    pub visualization: Option<String>,
    pub graph: SuperlocGraph,
}

/// Explore the superlocation graph of `ctx` and report its blocks.
pub fn analyze(ctx: &AnalysisContext<'_>) -> Result<AnalysisResult, AnalysisError> {
    let exploration = ctx.explore()?;
    let blocks = ctx.blocks(&exploration.graph);
    let panics = ctx.panics(&exploration.graph);
    info!(
        entry = %ctx.program.function(ctx.entry).name,
        focus = ctx.focus.len(),
        blocks = blocks.len(),
        panics = panics.len(),
        superlocs = exploration.metrics.superlocations,
        "entry analyzed"
    );
    let visualization = ctx
        .options
        .visualize
        .then(|| ctx.visualize(&exploration.graph, &blocks));
    Ok(AnalysisResult {
        blocks,
        panics,
        metrics: exploration.metrics,
        timed_out: exploration.timed_out,
        visualization,
        graph: exploration.graph,
    })
}
