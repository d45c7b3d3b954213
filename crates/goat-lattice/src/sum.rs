use crate::{Lattice, Widen};

/// Disjoint sum of two lattices sharing a bottom and a top.
/// Joining values from different sides goes to top.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Sum<A, B> {
    Bot,
    Left(A),
    Right(B),
    Top,
}

impl<A: Lattice, B: Lattice> Lattice for Sum<A, B> {
    fn bottom() -> Self {
        Sum::Bot
    }

    fn top() -> Self {
        Sum::Top
    }

    fn join(&self, other: &Self) -> Self {
        match (self, other) {
            (Sum::Bot, x) | (x, Sum::Bot) => x.clone(),
            (Sum::Left(a), Sum::Left(b)) => Sum::Left(a.join(b)),
            (Sum::Right(a), Sum::Right(b)) => Sum::Right(a.join(b)),
            _ => Sum::Top,
        }
    }

    fn meet(&self, other: &Self) -> Self {
        match (self, other) {
            (Sum::Top, x) | (x, Sum::Top) => x.clone(),
            (Sum::Left(a), Sum::Left(b)) => Sum::Left(a.meet(b)),
            (Sum::Right(a), Sum::Right(b)) => Sum::Right(a.meet(b)),
            _ => Sum::Bot,
        }
    }

    fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (Sum::Bot, _) | (_, Sum::Top) => true,
            (Sum::Left(a), Sum::Left(b)) => a.leq(b),
            (Sum::Right(a), Sum::Right(b)) => a.leq(b),
            _ => false,
        }
    }
}

impl<A: Widen, B: Widen> Widen for Sum<A, B> {
    fn widen(&self, next: &Self) -> Self {
        match (self, next) {
            (Sum::Left(a), Sum::Left(b)) => Sum::Left(a.widen(b)),
            (Sum::Right(a), Sum::Right(b)) => Sum::Right(a.widen(b)),
            _ => self.join(next),
        }
    }
}
