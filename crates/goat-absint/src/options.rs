//! Analysis options, validated and passed explicitly.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Order in which the driver pops superlocations. Affects performance, not
/// the fixpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorklistOrder {
    #[default]
    Fifo,
    Lifo,
}

impl FromStr for WorklistOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(WorklistOrder::Fifo),
            "lifo" => Ok(WorklistOrder::Lifo),
            other => Err(format!("unknown worklist order {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisOptions {
    /// Length of the call strings distinguishing function frames.
    pub call_context_depth: usize,
    /// Live instances allowed per goroutine spawn site.
    pub goroutine_bound: usize,
    /// Joins at a loop head or recursive entry before widening kicks in.
    pub widening_threshold: usize,
    /// Wall-clock budget for one entry and P-set.
    pub deadline: Option<Duration>,
    /// Standard-library functions are opaque and their primitives stay top.
    pub skip_goroot: bool,
    pub order: WorklistOrder,
    /// Keep the superlocation graph listing in the result.
    pub visualize: bool,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            call_context_depth: 1,
            goroutine_bound: 3,
            widening_threshold: 3,
            deadline: None,
            skip_goroot: true,
            order: WorklistOrder::Fifo,
            visualize: false,
        }
    }
}
