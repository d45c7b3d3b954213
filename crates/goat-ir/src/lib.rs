//! GOAT IR: the SSA program model the analyzer consumes.
//!
//! The input is a JSON document produced by an SSA exporter. This crate
//! provides:
//! - The owned program model and its validated index
//! - Points-to labels, given or estimated
//! - The call graph and block-level CFG helpers
//! - Generic graph algorithms (SCCs, dominators, BFS)

pub mod call_graph; // Call graph construction and pruning
pub mod cfg; // Block-level CFG navigation
pub mod graph; // petgraph-backed graph utilities
pub mod ir; // Owned program model
pub mod models; // Standard-library call summaries
pub mod points_to; // Given or estimated points-to labels
pub mod program; // Validated, indexed program
pub mod types; // Type table helpers

#[cfg(any(test, feature = "test-fixtures"))]
pub mod builder;

pub use program::{FuncId, InputError, Program};

/// Load and validate an analysis input file.
pub fn load_json_file(path: &std::path::Path) -> Result<Program, InputError> {
    Program::load_file(path)
}

/// Load a JSON fixture from `tests/fixtures/` of the calling crate's
/// workspace by name.
///
/// This is available in test builds and when the `test-fixtures` feature is enabled.
#[cfg(any(test, feature = "test-fixtures"))]
pub fn load_fixture(name: &str) -> Program {
    let manifest_dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR"));
    let fixture_path = manifest_dir
        .join("../goat-cli/tests/fixtures")
        .join(format!("{name}.json"));
    load_json_file(&fixture_path).unwrap_or_else(|e| panic!("failed to load fixture {name}: {e}"))
}
