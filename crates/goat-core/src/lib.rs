//! GOAT core: configuration and per-entry orchestration.

pub mod config;
pub mod orchestrator;

pub use config::{Config, ConfigError, OutputFormat, RunSettings};
pub use orchestrator::{
    analyze_file, analyze_program, AnalysisReport, EntryFailure, EntryReport, OrchestratorError,
    Outcome, ReportSummary,
};
