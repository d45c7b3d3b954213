//! GOAT diagnostics: finding types, the rule catalog and output formats.

pub mod diagnostic;
pub mod human;
pub mod rules;
pub mod sarif;

pub use diagnostic::*;
