//! Blocked goroutines and definite panics read off the superlocation graph.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use goat_cfg::{Comm, NodeId, NodeKind, SyncOp};
use goat_ir::ir::Span;

use crate::context::AnalysisContext;
use crate::driver::{Edge, SuperlocGraph};
use crate::goro::{CtrLoc, Goro, Superloc};
use crate::state::State;
use crate::transitions::PanicReason;
use crate::value::AbstractValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// Every live goroutine is blocked, or one is blocked on a lock only
    /// it could release.
    Deadlock,
    /// A single goroutine is stuck forever and nothing else runs.
    Leak,
    /// Some goroutines are stuck while others still run.
    Partial,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Deadlock => "deadlock",
            Classification::Leak => "leak",
            Classification::Partial => "partial",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedGoroutine {
    pub goroutine: String,
    pub location: String,
    pub span: Option<Span>,
    pub operation: String,
    /// Goroutines that may hold the mutex this one waits to lock.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub holders: Vec<String>,
    #[serde(skip)]
    pub node: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Block {
    pub superloc: String,
    pub blocked: Vec<BlockedGoroutine>,
    pub classification: Classification,
    /// Transitions from the entry configuration to the block.
    pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PanicFinding {
    pub goroutine: String,
    pub location: String,
    pub span: Option<Span>,
    pub reason: PanicReason,
    pub path: Vec<String>,
}

impl<'a> AnalysisContext<'a> {
    /// Blocks of `graph`, one per stuck goroutine and control location.
    pub fn blocks(&self, graph: &SuperlocGraph) -> Vec<Block> {
        let progress = progress_sets(graph);
        let empty = FxHashSet::default();
        let mut candidates: BTreeMap<(Goro, CtrLoc), (Superloc, Classification)> = BTreeMap::new();
        let mut stuck_at: FxHashMap<Superloc, Vec<Goro>> = FxHashMap::default();

        for sl in graph.states.keys() {
            if graph.frontier.contains(sl) || self.is_crashed(*sl) || sl.iter().any(|(_, cl)| cl.panicked) {
                continue;
            }
            let stuck: Vec<Goro> = sl
                .iter()
                .filter(|(g, _)| !progress.get(g).unwrap_or(&empty).contains(sl))
                .map(|(g, _)| g)
                .collect();
            if stuck.is_empty() {
                continue;
            }
            let class = self.classify(*sl, &stuck);
            for g in &stuck {
                let Some(cl) = sl.get(*g) else {
                    continue;
                };
                let better = match candidates.get(&(*g, cl)) {
                    None => true,
                    Some((old, old_class)) => (class, sl.len()) < (*old_class, old.len()),
                };
                if better {
                    candidates.insert((*g, cl), (*sl, class));
                }
            }
            stuck_at.insert(*sl, stuck);
        }

        let chosen: BTreeSet<(Superloc, Classification)> = candidates.into_values().collect();
        chosen
            .into_iter()
            .map(|(sl, classification)| {
                let state = graph.states.get(&sl);
                let blocked = stuck_at
                    .get(&sl)
                    .into_iter()
                    .flatten()
                    .filter_map(|g| sl.get(*g).map(|cl| self.blocked_goroutine(state, *g, cl)))
                    .collect();
                Block {
                    superloc: sl.describe(self.cfg(), self.program),
                    blocked,
                    classification,
                    path: self.path_to(graph, sl),
                }
            })
            .collect()
    }

    fn classify(&self, sl: Superloc, stuck: &[Goro]) -> Classification {
        if stuck.len() < sl.len() {
            return Classification::Partial;
        }
        if stuck.len() > 1 {
            return Classification::Deadlock;
        }
        let self_locked = stuck.iter().filter_map(|g| sl.get(*g)).any(|cl| {
            let node = self.cfg().node(cl.node);
            node.kind == NodeKind::CondWaking
                || matches!(
                    self.cfg().comm(cl.node),
                    Some(Comm::Sync(call)) if matches!(call.op, SyncOp::Lock | SyncOp::RLock)
                        && node.kind != NodeKind::CondWait
                )
        });
        match self_locked {
            true => Classification::Deadlock,
            false => Classification::Leak,
        }
    }

    fn blocked_goroutine(&self, state: Option<&State>, goro: Goro, cl: CtrLoc) -> BlockedGoroutine {
        let cfg = self.cfg();
        BlockedGoroutine {
            goroutine: goro.describe(self.program),
            location: cl.describe(cfg, self.program),
            span: cfg.span(cl.node, self.program),
            operation: self.operation(cl.node),
            holders: state.map_or_else(Vec::new, |s| self.lock_holders(s, goro, cl)),
            node: cl.node,
        }
    }

    /// Holders recorded on the mutex records a `Lock` at `cl` targets.
    fn lock_holders(&self, state: &State, goro: Goro, cl: CtrLoc) -> Vec<String> {
        let cfg = self.cfg();
        let Some(Comm::Sync(call)) = cfg.comm(cl.node) else {
            return vec![];
        };
        if call.op != SyncOp::Lock || cfg.node(cl.node).kind == NodeKind::CondWaking {
            return vec![];
        }
        let mutex = self.operand(&state.memory, goro, cl.ctx, call.receiver);
        let holders: BTreeSet<Goro> = self
            .records(state, &mutex)
            .into_iter()
            .flatten()
            .filter_map(|(_, record)| match record {
                AbstractValue::Mutex(m) => Some(m.holders),
                _ => None,
            })
            .flat_map(|h| h.iter().copied().collect::<Vec<_>>())
            .collect();
        holders.iter().map(|g| g.describe(self.program)).collect()
    }

    /// Short name of the operation a goroutine waits on.
    pub fn operation(&self, node: NodeId) -> String {
        let cfg = self.cfg();
        let kind = cfg.node(node).kind;
        match (kind, cfg.comm(node)) {
            (NodeKind::CondWait | NodeKind::CondWaiting, _) => "Cond.Wait".into(),
            (NodeKind::CondWaking, _) => "Cond.Wait (re-lock)".into(),
            (_, Some(Comm::Send { .. })) => "send".into(),
            (_, Some(Comm::Recv { .. })) => "receive".into(),
            (_, Some(Comm::Close { .. })) => "close".into(),
            (_, Some(Comm::Select { .. })) => "select".into(),
            (_, Some(Comm::Sync(call))) => match call.op {
                SyncOp::Lock => "Lock",
                SyncOp::Unlock => "Unlock",
                SyncOp::RLock => "RLock",
                SyncOp::RUnlock => "RUnlock",
                SyncOp::WgAdd => "WaitGroup.Add",
                SyncOp::WgDone => "WaitGroup.Done",
                SyncOp::WgWait => "WaitGroup.Wait",
                SyncOp::CondWait => "Cond.Wait",
                SyncOp::Signal => "Cond.Signal",
                SyncOp::Broadcast => "Cond.Broadcast",
            }
            .into(),
            (kind, None) => kind.label(),
        }
    }

    /// Definite panics, one per operation and reason.
    pub fn panics(&self, graph: &SuperlocGraph) -> Vec<PanicFinding> {
        let cfg = self.cfg();
        let mut seen = BTreeSet::new();
        let mut out = vec![];
        for edge in &graph.edges {
            let Some(event) = edge.transition.panic else {
                continue;
            };
            if !seen.insert((event.node, event.reason)) {
                continue;
            }
            let location = edge
                .from
                .get(event.goro)
                .map(|cl| cl.describe(cfg, self.program))
                .unwrap_or_else(|| cfg.describe(event.node, self.program));
            out.push(PanicFinding {
                goroutine: event.goro.describe(self.program),
                location,
                span: cfg.span(event.node, self.program),
                reason: event.reason,
                path: self.path_to(graph, edge.from),
            });
        }
        out
    }

    /// Shortest transition sequence from a root to `target`.
    pub fn path_to(&self, graph: &SuperlocGraph, target: Superloc) -> Vec<String> {
        let mut parent: FxHashMap<Superloc, Option<&Edge>> = FxHashMap::default();
        let mut queue = VecDeque::new();
        for root in &graph.roots {
            if parent.insert(*root, None).is_none() {
                queue.push_back(*root);
            }
        }
        while let Some(sl) = queue.pop_front() {
            if sl == target {
                break;
            }
            for edge in graph.outgoing(sl) {
                if !parent.contains_key(&edge.to) {
                    parent.insert(edge.to, Some(edge));
                    queue.push_back(edge.to);
                }
            }
        }
        let mut steps = vec![];
        let mut at = target;
        while let Some(Some(edge)) = parent.get(&at) {
            steps.push(self.describe_edge(edge));
            at = edge.from;
        }
        steps.push(format!("start {}", at.describe(self.cfg(), self.program)));
        steps.reverse();
        steps
    }

    fn describe_edge(&self, edge: &Edge) -> String {
        let who: Vec<String> = edge
            .transition
            .progressed
            .iter()
            .map(|g| g.describe(self.program))
            .collect();
        let mut out = format!("{} by {}", edge.transition.kind, who.join(", "));
        if let Some(event) = edge.transition.panic {
            out.push_str(&format!(" panics: {}", event.reason));
        }
        out.push_str(&format!(" -> {}", edge.to.describe(self.cfg(), self.program)));
        out
    }
}

/// For each goroutine, the superlocations from which some transition
/// progressing it is reachable.
fn progress_sets(graph: &SuperlocGraph) -> FxHashMap<Goro, FxHashSet<Superloc>> {
    let mut seeds: FxHashMap<Goro, Vec<Superloc>> = FxHashMap::default();
    for edge in &graph.edges {
        for g in &edge.transition.progressed {
            seeds.entry(*g).or_default().push(edge.from);
        }
    }
    seeds
        .into_iter()
        .map(|(goro, from)| {
            let mut reach: FxHashSet<Superloc> = FxHashSet::default();
            let mut queue: VecDeque<Superloc> = from.into_iter().collect();
            while let Some(sl) = queue.pop_front() {
                if !reach.insert(sl) {
                    continue;
                }
                queue.extend(graph.incoming(sl).map(|e| e.from).filter(|p| p.get(goro).is_some()));
            }
            (goro, reach)
        })
        .collect()
}
