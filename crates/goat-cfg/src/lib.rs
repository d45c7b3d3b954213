//! Extended control-flow graph for the GOAT analyzer.
//!
//! Nodes are program-wide: every function with a body contributes its
//! instruction nodes plus synthetic entry, exit, panic-exit, post-call,
//! select-arm, deferred-call and condition-variable nodes.

pub mod comm;
pub mod node;
pub mod program_cfg;

pub use comm::{Comm, SyncCall, SyncOp};
pub use node::{FunctionNodes, Node, NodeId, NodeKind};
pub use program_cfg::ProgramCfg;
