//! Fragment selection: groups of primitives analyzed together.
//!
//! Each policy partitions the primitives used under an entry into P-sets.
//! The interpreter later tracks the primitives of one P-set precisely and
//! treats every other primitive as irrelevant.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use petgraph::unionfind::UnionFind;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

use goat_cfg::comm::Comm;
use goat_cfg::{NodeId, NodeKind, ProgramCfg};
use goat_ir::ir::{ChanDir, ValueId};
use goat_ir::points_to::PointsTo;
use goat_ir::{FuncId, Program};

use crate::decompose::CallDag;
use crate::primitives::Primitives;
use crate::topology::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FragmentPolicy {
    Singleton,
    SameFunc,
    Total,
    #[default]
    Gcatch,
    Scc,
}

impl FragmentPolicy {
    pub const ALL: [FragmentPolicy; 5] = [
        FragmentPolicy::Singleton,
        FragmentPolicy::SameFunc,
        FragmentPolicy::Total,
        FragmentPolicy::Gcatch,
        FragmentPolicy::Scc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FragmentPolicy::Singleton => "singleton",
            FragmentPolicy::SameFunc => "same-func",
            FragmentPolicy::Total => "total",
            FragmentPolicy::Gcatch => "gcatch",
            FragmentPolicy::Scc => "scc",
        }
    }
}

impl fmt::Display for FragmentPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FragmentPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FragmentPolicy::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown fragment policy {s:?}"))
    }
}

/// A group of focused primitives and the function analysis starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PSet {
    pub primitives: BTreeSet<ValueId>,
    pub entry: FuncId,
}

/// Everything the policies read.
pub struct PSetContext<'a> {
    pub program: &'a Program,
    pub cfg: &'a ProgramCfg,
    pub points_to: &'a PointsTo,
    pub primitives: &'a Primitives,
    pub usage: &'a Usage,
    pub dag: &'a CallDag,
    pub reflected: &'a BTreeSet<ValueId>,
}

type Deps = BTreeMap<ValueId, BTreeSet<ValueId>>;

impl<'a> PSetContext<'a> {
    /// Primitives used under the entry, outside the standard library.
    fn valid(&self) -> BTreeSet<ValueId> {
        self.usage
            .primitive_uses()
            .into_keys()
            .filter(|p| self.primitives.get(*p).is_some_and(|p| !p.goroot))
            .collect()
    }

    fn prims(&self, valid: &BTreeSet<ValueId>, value: ValueId) -> BTreeSet<ValueId> {
        self.primitives
            .of_value(self.points_to, value)
            .into_iter()
            .filter(|p| valid.contains(p))
            .collect()
    }

    pub fn compute(&self, policy: FragmentPolicy) -> Vec<PSet> {
        let valid = self.valid();
        let raw = match policy {
            FragmentPolicy::Singleton => valid.iter().map(|p| BTreeSet::from([*p])).collect(),
            FragmentPolicy::Total => vec![valid.clone()],
            FragmentPolicy::SameFunc => self.same_func(&valid),
            FragmentPolicy::Gcatch => self.gcatch(&valid),
            FragmentPolicy::Scc => self.scc(&valid),
        };
        let psets = self.finish(raw);
        debug!(%policy, psets = psets.len(), primitives = valid.len(), "selected fragments");
        psets
    }

    /// Drop reflected channels and duplicates, then pick entries.
    fn finish(&self, raw: Vec<BTreeSet<ValueId>>) -> Vec<PSet> {
        let mut seen = FxHashSet::default();
        let mut out = vec![];
        for set in raw {
            let set: BTreeSet<ValueId> = set
                .into_iter()
                .filter(|p| !self.reflected.contains(p))
                .collect();
            if set.is_empty() || !seen.insert(set.clone()) {
                continue;
            }
            let entry = self.entry_for(&set);
            out.push(PSet {
                primitives: set,
                entry,
            });
        }
        out
    }

    /// Least common dominator of the allocating and using functions.
    fn entry_for(&self, set: &BTreeSet<ValueId>) -> FuncId {
        let uses = self.usage.primitive_uses();
        let funcs = set.iter().flat_map(|p| {
            let alloc = self.primitives.get(*p).and_then(|p| p.func);
            let users = uses.get(p).into_iter().flatten().copied();
            alloc.into_iter().chain(users)
        });
        self.dag.lcd(funcs).unwrap_or(self.dag.root())
    }

    fn same_func(&self, valid: &BTreeSet<ValueId>) -> Vec<BTreeSet<ValueId>> {
        // Package-level primitives share a pseudo parent.
        let parent = |p: ValueId| self.primitives.get(p).and_then(|p| p.func);
        let mut parents: Vec<Option<FuncId>> = valid.iter().map(|p| parent(*p)).collect();
        parents.sort_unstable();
        parents.dedup();
        let index: FxHashMap<Option<FuncId>, usize> =
            parents.iter().enumerate().map(|(i, p)| (*p, i)).collect();
        let mut uf = UnionFind::<usize>::new(parents.len());
        for (_, usage) in self.usage.iter() {
            let mut used = usage.used().filter(|p| valid.contains(p));
            let Some(first) = used.next() else {
                continue;
            };
            let first = index[&parent(first)];
            for p in used {
                uf.union(first, index[&parent(p)]);
            }
        }
        let labels = uf.into_labeling();
        let mut groups: BTreeMap<usize, BTreeSet<ValueId>> = BTreeMap::new();
        for &p in valid {
            groups
                .entry(labels[index[&parent(p)]])
                .or_default()
                .insert(p);
        }
        groups.into_values().collect()
    }

    /// Forward propagation of "blocked on" sets through every function's
    /// CFG. A primitive used while another one may have blocked depends on
    /// it.
    fn dependency_map(&self, valid: &BTreeSet<ValueId>) -> (Deps, Deps) {
        let mut deps: Deps = valid.iter().map(|p| (*p, BTreeSet::new())).collect();
        let mut chan_chan: Deps = BTreeMap::new();
        let add_deps = |deps: &mut Deps, prims: &BTreeSet<ValueId>, blocked: &BTreeSet<ValueId>| {
            for p in prims {
                deps.entry(*p).or_default().extend(blocked.iter().copied());
            }
        };

        for func in self.dag.functions() {
            let Some(nodes) = self.cfg.function(func) else {
                continue;
            };
            let mut blocked_in: FxHashMap<NodeId, BTreeSet<ValueId>> = FxHashMap::default();
            blocked_in.insert(nodes.entry, BTreeSet::new());
            let mut queue = vec![nodes.entry];
            let mut visited = FxHashSet::default();
            visited.insert(nodes.entry);
            while let Some(n) = queue.pop() {
                let blocked = blocked_in.get(&n).cloned().unwrap_or_default();
                let node = self.cfg.node(n);
                let mut out = blocked.clone();
                match node.kind {
                    NodeKind::SelectRecv(i) | NodeKind::SelectSend(i) => {
                        let arm = node
                            .instr
                            .and_then(|s| self.cfg.node_of(s))
                            .and_then(|h| match self.cfg.comm(h) {
                                Some(Comm::Select { arms, .. }) => arms.get(i as usize),
                                _ => None,
                            });
                        if let Some(arm) = arm {
                            let ps = self.prims(valid, arm.chan);
                            add_deps(&mut deps, &ps, &blocked);
                            if arm.dir == ChanDir::Send {
                                if let Some(v) = arm.value {
                                    self.chan_in_chan(valid, &mut chan_chan, &ps, v);
                                }
                            }
                            out.extend(ps);
                        }
                    }
                    NodeKind::CondWaiting | NodeKind::CondWaking => {}
                    _ => match self.cfg.comm(n) {
                        Some(Comm::Send { chan, value }) => {
                            let ps = self.prims(valid, *chan);
                            add_deps(&mut deps, &ps, &blocked);
                            self.chan_in_chan(valid, &mut chan_chan, &ps, *value);
                            out.extend(ps);
                        }
                        Some(Comm::Recv { chan, .. }) => {
                            let ps = self.prims(valid, *chan);
                            add_deps(&mut deps, &ps, &blocked);
                            out.extend(ps);
                        }
                        Some(Comm::Close { chan }) => {
                            let ps = self.prims(valid, *chan);
                            add_deps(&mut deps, &ps, &blocked);
                        }
                        Some(Comm::Select { arms, .. }) => {
                            let arm_prims: Vec<BTreeSet<ValueId>> =
                                arms.iter().map(|a| self.prims(valid, a.chan)).collect();
                            for (i, a) in arm_prims.iter().enumerate() {
                                for (j, b) in arm_prims.iter().enumerate() {
                                    if i != j {
                                        add_deps(&mut deps, a, b);
                                    }
                                }
                            }
                        }
                        Some(Comm::Sync(call)) => {
                            let ps = self.prims(valid, call.receiver);
                            add_deps(&mut deps, &ps, &blocked);
                            if call.op.may_block() {
                                out.extend(ps);
                            }
                        }
                        None => {}
                    },
                }
                for &succ in &node.succs {
                    let entry = blocked_in.entry(succ).or_default();
                    let before = entry.len();
                    entry.extend(out.iter().copied());
                    if visited.insert(succ) || entry.len() != before {
                        queue.push(succ);
                    }
                }
            }
        }
        (deps, chan_chan)
    }

    /// The carrier channel becomes a dependency of the channel it carries.
    fn chan_in_chan(
        &self,
        valid: &BTreeSet<ValueId>,
        chan_chan: &mut Deps,
        carriers: &BTreeSet<ValueId>,
        payload: ValueId,
    ) {
        if !self.program.types.is_chan(self.program.value_type(payload)) {
            return;
        }
        for p in self.prims(valid, payload) {
            chan_chan.entry(p).or_default().extend(carriers.iter().copied());
        }
    }

    fn gcatch(&self, valid: &BTreeSet<ValueId>) -> Vec<BTreeSet<ValueId>> {
        let (deps, chan_chan) = self.dependency_map(valid);
        let uses = self.usage.primitive_uses();
        let mut out = vec![];
        for group in mutual_groups(&deps) {
            for &p1 in &group {
                let mut pset = BTreeSet::from([p1]);
                pset.extend(
                    group
                        .iter()
                        .copied()
                        .filter(|&p2| p2 != p1 && self.smaller_scope(&uses, p1, p2)),
                );
                if let Some(carriers) = chan_chan.get(&p1) {
                    pset.extend(carriers.iter().copied());
                }
                out.push(pset);
            }
        }
        out
    }

    /// Whether `p2` is used within a scope no wider than `p1`'s.
    fn smaller_scope(
        &self,
        uses: &BTreeMap<ValueId, BTreeSet<FuncId>>,
        p1: ValueId,
        p2: ValueId,
    ) -> bool {
        let scope = |p: ValueId| -> Option<usize> {
            let funcs: Vec<FuncId> = uses
                .get(&p)?
                .iter()
                .copied()
                .filter(|f| self.dag.contains(*f))
                .collect();
            if funcs.is_empty() {
                return None;
            }
            self.dag.component_of(self.dag.lcd(funcs)?)
        };
        match (scope(p1), scope(p2)) {
            (Some(c1), Some(c2)) => c2 <= c1,
            _ => false,
        }
    }

    /// Bottom-up variant: operations that block on a primitive depend on
    /// every unblocking operation reachable in the call graph, and back.
    fn scc(&self, valid: &BTreeSet<ValueId>) -> Vec<BTreeSet<ValueId>> {
        let sccs = self.dag.sccs();
        let mut unblocks: Vec<BTreeSet<ValueId>> = vec![BTreeSet::new(); sccs.len()];
        let mut blocks: Vec<BTreeSet<ValueId>> = vec![BTreeSet::new(); sccs.len()];
        let mut local: Vec<Vec<PrimOp>> = vec![vec![]; sccs.len()];
        for (c, component) in sccs.components().iter().enumerate() {
            for &func in component {
                local[c].extend(self.prim_ops(valid, func));
            }
            let mut u = BTreeSet::new();
            let mut b = BTreeSet::new();
            for op in &local[c] {
                if op.can_unblock {
                    u.extend(op.prims.iter().copied());
                }
                if op.can_block || op.channel_wait {
                    b.extend(op.prims.iter().copied());
                }
            }
            for &succ in sccs.component_edges(c) {
                u.extend(unblocks[succ].iter().copied());
                b.extend(blocks[succ].iter().copied());
            }
            unblocks[c] = u;
            blocks[c] = b;
        }

        let mut deps: Deps = BTreeMap::new();
        for (c, ops) in local.iter().enumerate() {
            for op in ops {
                for &p in &op.prims {
                    if op.can_block {
                        deps.entry(p).or_default().extend(unblocks[c].iter().copied());
                    }
                    if op.can_unblock {
                        for &b in &blocks[c] {
                            deps.entry(b).or_default().insert(p);
                        }
                    }
                }
            }
        }

        valid
            .iter()
            .map(|&p| {
                let mut set = BTreeSet::from([p]);
                if let Some(ds) = deps.get(&p) {
                    set.extend(
                        ds.iter()
                            .copied()
                            .filter(|o| deps.get(o).is_some_and(|od| od.contains(&p))),
                    );
                }
                set
            })
            .collect()
    }

    fn prim_ops(&self, valid: &BTreeSet<ValueId>, func: FuncId) -> Vec<PrimOp> {
        let mut ops = vec![];
        let mut push = |prims, can_unblock, can_block, channel_wait| {
            ops.push(PrimOp {
                prims,
                can_unblock,
                can_block,
                channel_wait,
            })
        };
        for instr in self.program.function(func).instructions() {
            let Some(comm) = goat_cfg::comm::classify_op(&instr.op, self.program) else {
                continue;
            };
            match comm {
                Comm::Send { chan, .. } | Comm::Recv { chan, .. } => {
                    push(self.prims(valid, chan), true, true, true)
                }
                Comm::Close { chan } => push(self.prims(valid, chan), true, false, false),
                Comm::Sync(call) => {
                    let blocks = call.op.may_block();
                    push(self.prims(valid, call.receiver), !blocks, blocks, false);
                }
                Comm::Select { arms, blocking } => {
                    for arm in arms {
                        push(self.prims(valid, arm.chan), true, blocking, true);
                    }
                }
            }
        }
        ops
    }
}

/// A concurrency operation seen by the SCC policy.
#[derive(Debug, Clone)]
struct PrimOp {
    prims: BTreeSet<ValueId>,
    can_unblock: bool,
    can_block: bool,
    /// Channel operations always count among the reachable blocking ones.
    channel_wait: bool,
}

/// Groups of mutually dependent primitives.
fn mutual_groups(deps: &Deps) -> Vec<BTreeSet<ValueId>> {
    let keys: Vec<ValueId> = deps.keys().copied().collect();
    let index: FxHashMap<ValueId, usize> = keys.iter().enumerate().map(|(i, k)| (*k, i)).collect();
    let mut uf = UnionFind::<usize>::new(keys.len());
    for (p1, ds) in deps {
        for p2 in ds {
            let mutual = deps.get(p2).is_some_and(|d| d.contains(p1));
            if let (true, Some(&a), Some(&b)) = (mutual, index.get(p1), index.get(p2)) {
                uf.union(a, b);
            }
        }
    }
    let labels = uf.into_labeling();
    let mut groups: BTreeMap<usize, BTreeSet<ValueId>> = BTreeMap::new();
    for (i, k) in keys.iter().enumerate() {
        groups.entry(labels[i]).or_default().insert(*k);
    }
    groups.into_values().collect()
}
