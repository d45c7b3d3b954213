//! Abstract goroutines, control locations and superlocations.
//!
//! All three are hash-consed with `internment`, so equality and hashing
//! are pointer operations. Ordering compares the interned data, which keeps
//! iteration over superlocations deterministic across runs.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use internment::Intern;

use goat_cfg::{NodeId, NodeKind, ProgramCfg};
use goat_ir::ir::ValueId;
use goat_ir::{FuncId, Program};

macro_rules! interned {
    ($name:ident, $data:ty) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(Intern<$data>);

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                if self.0 == other.0 {
                    return Ordering::Equal;
                }
                (*self.0).cmp(&*other.0)
            }
        }

        impl std::ops::Deref for $name {
            type Target = $data;

            fn deref(&self) -> &$data {
                &self.0
            }
        }
    };
}

/// Call string of a frame: the most recent call sites, innermost last.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextData(Vec<ValueId>);

interned!(Context, ContextData);

impl Context {
    pub fn root() -> Self {
        Context(Intern::new(ContextData(vec![])))
    }

    /// Context of a callee entered from `site`, keeping the last `depth`
    /// call sites.
    pub fn push(self, site: ValueId, depth: usize) -> Self {
        if depth == 0 {
            return self;
        }
        let mut sites = self.0 .0.clone();
        sites.push(site);
        if sites.len() > depth {
            sites.drain(..sites.len() - depth);
        }
        Context(Intern::new(ContextData(sites)))
    }

    pub fn sites(&self) -> &[ValueId] {
        &self.0 .0
    }

    pub fn is_root(&self) -> bool {
        self.0 .0.is_empty()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0 .0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GoroData {
    /// `None` for the root goroutine.
    pub parent: Option<Goro>,
    /// The `go` instruction that spawned this goroutine.
    pub site: Option<ValueId>,
    pub entry: FuncId,
    /// Number of identical siblings spawned before this one.
    pub index: u32,
}

interned!(Goro, GoroData);

impl Goro {
    pub fn root(entry: FuncId) -> Self {
        Goro(Intern::new(GoroData {
            parent: None,
            site: None,
            entry,
            index: 0,
        }))
    }

    pub fn spawn(self, site: ValueId, entry: FuncId) -> Self {
        Goro(Intern::new(GoroData {
            parent: Some(self),
            site: Some(site),
            entry,
            index: 0,
        }))
    }

    pub fn with_index(self, index: u32) -> Self {
        Goro(Intern::new(GoroData {
            index,
            ..(*self.0).clone()
        }))
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Equality ignoring the indexes along the spawn chain.
    pub fn weak_eq(&self, other: &Goro) -> bool {
        if self.site != other.site || self.entry != other.entry {
            return false;
        }
        match (self.parent, other.parent) {
            (None, None) => true,
            (Some(a), Some(b)) => a.weak_eq(&b),
            _ => false,
        }
    }

    /// Whether a spawn site repeats along the chain to the root.
    pub fn is_circular(&self) -> bool {
        let Some(site) = self.site else {
            return false;
        };
        let mut cur = self.parent;
        while let Some(g) = cur {
            if g.site == Some(site) {
                return true;
            }
            cur = g.parent;
        }
        false
    }

    /// The ancestor with the longest non-repeating spawn chain.
    pub fn radix(self) -> Goro {
        match self.parent {
            Some(parent) if self.is_circular() => parent.radix(),
            _ => self,
        }
    }

    pub fn depth(&self) -> usize {
        self.parent.map_or(1, |p| 1 + p.depth())
    }

    pub fn describe(&self, program: &Program) -> String {
        let mut out = match self.parent {
            None => program.function(self.entry).name.clone(),
            Some(parent) => format!(
                "{} ↝ go {}",
                parent.describe(program),
                program.function(self.entry).name
            ),
        };
        if let Some(span) = self.site.and_then(|s| program.span_of(s)) {
            out.push_str(&format!("@{}", span.start_line));
        }
        if self.index != 0 {
            out.push_str(&format!("({})", self.index));
        }
        out
    }
}

impl fmt::Debug for Goro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = self.parent {
            write!(f, "{parent:?}↝")?;
        }
        match self.site {
            Some(site) => write!(f, "go{site}")?,
            None => write!(f, "root")?,
        }
        if self.index != 0 {
            write!(f, "({})", self.index)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CtrLocData {
    pub node: NodeId,
    pub ctx: Context,
    /// The goroutine is unwinding after a panic.
    pub panicked: bool,
    /// The goroutine is unwinding after `runtime.Goexit` or a failed test
    /// assertion. Deferred calls still run and the goroutine then
    /// terminates normally.
    pub exiting: bool,
}

interned!(CtrLoc, CtrLocData);

impl CtrLoc {
    pub fn new(node: NodeId, ctx: Context, panicked: bool) -> Self {
        CtrLoc(Intern::new(CtrLocData {
            node,
            ctx,
            panicked,
            exiting: false,
        }))
    }

    pub fn exiting(node: NodeId, ctx: Context) -> Self {
        CtrLoc(Intern::new(CtrLocData {
            node,
            ctx,
            panicked: false,
            exiting: true,
        }))
    }

    pub fn at(self, node: NodeId) -> Self {
        CtrLoc(Intern::new(CtrLocData {
            node,
            ..(*self.0).clone()
        }))
    }

    /// The unwind point of an enclosing frame, keeping how this frame
    /// was left.
    pub fn unwinding_to(self, node: NodeId, ctx: Context) -> Self {
        match self.exiting && !self.panicked {
            true => CtrLoc::exiting(node, ctx),
            false => CtrLoc::new(node, ctx, true),
        }
    }

    pub fn describe(&self, cfg: &ProgramCfg, program: &Program) -> String {
        let mut out = cfg.describe(self.node, program);
        if self.panicked {
            out.push_str(" (panicked)");
        } else if self.exiting {
            out.push_str(" (exiting)");
        }
        out
    }
}

impl fmt::Debug for CtrLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}{:?}", self.node, self.ctx)?;
        if self.panicked {
            write!(f, "!")?;
        } else if self.exiting {
            write!(f, "~")?;
        }
        Ok(())
    }
}

/// Whether `cl` is the exit of the goroutine's outermost frame.
pub fn is_root_exit(cfg: &ProgramCfg, goro: Goro, cl: CtrLoc) -> bool {
    let node = cfg.node(cl.node);
    node.func == goro.entry
        && cl.ctx.is_root()
        && matches!(node.kind, NodeKind::FunctionExit | NodeKind::PanicExit)
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SuperlocData(BTreeMap<Goro, CtrLoc>);

interned!(Superloc, SuperlocData);

impl Superloc {
    pub fn new(threads: BTreeMap<Goro, CtrLoc>) -> Self {
        Superloc(Intern::new(SuperlocData(threads)))
    }

    pub fn threads(&self) -> &BTreeMap<Goro, CtrLoc> {
        &self.0 .0
    }

    pub fn get(&self, goro: Goro) -> Option<CtrLoc> {
        self.threads().get(&goro).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Goro, CtrLoc)> + '_ {
        self.threads().iter().map(|(g, c)| (*g, *c))
    }

    pub fn len(&self) -> usize {
        self.threads().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads().is_empty()
    }

    pub fn with(&self, goro: Goro, cl: CtrLoc) -> Self {
        let mut threads = self.threads().clone();
        threads.insert(goro, cl);
        Superloc::new(threads)
    }

    pub fn without(&self, goro: Goro) -> Self {
        let mut threads = self.threads().clone();
        threads.remove(&goro);
        Superloc::new(threads)
    }

    /// Smallest index not used by a live sibling of `child`.
    pub fn free_index(&self, child: Goro) -> u32 {
        let used: Vec<u32> = self
            .threads()
            .keys()
            .filter(|g| g.weak_eq(&child))
            .map(|g| g.index)
            .collect();
        (0..).find(|i| !used.contains(i)).unwrap_or(0)
    }

    pub fn describe(&self, cfg: &ProgramCfg, program: &Program) -> String {
        let parts: Vec<String> = self
            .iter()
            .map(|(g, cl)| format!("{}: {}", g.describe(program), cl.describe(cfg, program)))
            .collect();
        format!("⟨{}⟩", parts.join(" | "))
    }
}

impl fmt::Debug for Superloc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.threads().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_is_k_limited() {
        let root = Context::root();
        let one = root.push(10, 1);
        assert_eq!(one.sites(), &[10]);
        assert_eq!(one.push(20, 1).sites(), &[20]);
        assert_eq!(one.push(20, 2).sites(), &[10, 20]);
        assert_eq!(root.push(10, 0), root);
        // Interning makes equal contexts identical.
        assert_eq!(root.push(10, 1), one);
    }

    #[test]
    fn test_spawn_chains_and_radix() {
        let main = Goro::root(0);
        let worker = main.spawn(100, 1);
        let again = worker.spawn(200, 1);
        let looped = again.spawn(200, 1);
        assert!(!again.is_circular());
        assert!(looped.is_circular());
        assert_eq!(looped.radix(), again);
        assert_eq!(worker.depth(), 2);
        assert!(worker.with_index(1).weak_eq(&worker));
        assert_ne!(worker.with_index(1), worker);
    }

    #[test]
    fn test_superloc_free_index_skips_live_siblings() {
        let main = Goro::root(0);
        let child = main.spawn(100, 1);
        let cl = CtrLoc::new(0, Context::root(), false);
        let sl = Superloc::new(BTreeMap::from([(main, cl), (child, cl)]));
        assert_eq!(sl.free_index(child), 1);
        let sl = sl.with(child.with_index(1), cl);
        assert_eq!(sl.free_index(child), 2);
        assert_eq!(sl.without(child).free_index(child), 0);
        assert_eq!(sl.len(), 3);
    }

    #[test]
    fn test_unwinding_keeps_how_the_frame_was_left() {
        let outer = Context::root();
        let inner = outer.push(7, 1);
        let exiting = CtrLoc::exiting(3, inner);
        assert!(exiting.at(4).exiting);
        let up = exiting.unwinding_to(9, outer);
        assert!(up.exiting && !up.panicked);
        assert_eq!(up.ctx, outer);

        // A panic raised while exiting takes over.
        let both = CtrLoc(Intern::new(CtrLocData {
            panicked: true,
            ..(*exiting.0).clone()
        }));
        assert!(both.unwinding_to(9, outer).panicked);
        assert!(CtrLoc::new(3, inner, false).unwinding_to(9, outer).panicked);
        assert_ne!(CtrLoc::exiting(3, inner), CtrLoc::new(3, inner, false));
    }
}
