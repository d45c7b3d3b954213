//! Text listing of a superlocation graph.

use std::fmt::Write;

use crate::context::AnalysisContext;
use crate::driver::SuperlocGraph;
use crate::reporter::Block;

impl<'a> AnalysisContext<'a> {
    /// One numbered line per superlocation followed by its outgoing
    /// edges, then every block's path.
    pub fn visualize(&self, graph: &SuperlocGraph, blocks: &[Block]) -> String {
        let cfg = self.cfg();
        let ids: std::collections::BTreeMap<_, usize> = graph
            .states
            .keys()
            .enumerate()
            .map(|(i, sl)| (*sl, i))
            .collect();
        let mut out = String::new();
        let _ = writeln!(out, "superlocations: {}, edges: {}", graph.len(), graph.edges.len());
        for (sl, id) in &ids {
            let marker = match graph.roots.contains(sl) {
                true => " (root)",
                false => "",
            };
            let _ = writeln!(out, "S{id}{marker} {}", sl.describe(cfg, self.program));
            for edge in graph.outgoing(*sl) {
                let to = ids.get(&edge.to).map_or_else(|| "?".to_string(), |i| format!("S{i}"));
                let panic = edge
                    .transition
                    .panic
                    .map(|p| format!(" [panic: {}]", p.reason))
                    .unwrap_or_default();
                let _ = writeln!(out, "  --{}{panic}--> {to}", edge.transition.kind);
            }
        }
        for (i, block) in blocks.iter().enumerate() {
            let _ = writeln!(out, "block #{i} ({}):", block.classification.as_str());
            for step in &block.path {
                let _ = writeln!(out, "  {step}");
            }
        }
        out
    }
}
