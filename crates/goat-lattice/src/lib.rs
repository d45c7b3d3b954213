//! Abstract domains for the GOAT abstract interpreter.
//!
//! Every domain implements [`Lattice`]; domains with infinite ascending
//! chains also implement [`Widen`]. Combinators derive their operations
//! from the component domains:
//! - products are plain tuples `(A, B)` and `(A, B, C)`
//! - [`MapLattice`] is a pointwise map over a persistent hash trie
//! - [`Sum`] is a tagged union with a shared bottom and top

pub mod flat;
pub mod interval;
pub mod map;
pub mod powerset;
pub mod sum;

pub use flat::Flat;
pub use interval::Interval;
pub use map::MapLattice;
pub use powerset::Powerset;
pub use sum::Sum;

/// A bounded join-semilattice with a meet.
pub trait Lattice: Clone + PartialEq {
    fn bottom() -> Self;
    fn top() -> Self;
    fn join(&self, other: &Self) -> Self;
    fn meet(&self, other: &Self) -> Self;
    fn leq(&self, other: &Self) -> bool;

    fn is_bottom(&self) -> bool {
        *self == Self::bottom()
    }

    fn is_top(&self) -> bool {
        *self == Self::top()
    }
}

/// Widening: an inflationary, idempotent upper bound of `join` that
/// guarantees ascending chains stabilize.
pub trait Widen: Lattice {
    fn widen(&self, next: &Self) -> Self {
        self.join(next)
    }
}

impl<A: Lattice, B: Lattice> Lattice for (A, B) {
    fn bottom() -> Self {
        (A::bottom(), B::bottom())
    }

    fn top() -> Self {
        (A::top(), B::top())
    }

    fn join(&self, other: &Self) -> Self {
        (self.0.join(&other.0), self.1.join(&other.1))
    }

    fn meet(&self, other: &Self) -> Self {
        (self.0.meet(&other.0), self.1.meet(&other.1))
    }

    fn leq(&self, other: &Self) -> bool {
        self.0.leq(&other.0) && self.1.leq(&other.1)
    }
}

impl<A: Widen, B: Widen> Widen for (A, B) {
    fn widen(&self, next: &Self) -> Self {
        (self.0.widen(&next.0), self.1.widen(&next.1))
    }
}

impl<A: Lattice, B: Lattice, C: Lattice> Lattice for (A, B, C) {
    fn bottom() -> Self {
        (A::bottom(), B::bottom(), C::bottom())
    }

    fn top() -> Self {
        (A::top(), B::top(), C::top())
    }

    fn join(&self, other: &Self) -> Self {
        (
            self.0.join(&other.0),
            self.1.join(&other.1),
            self.2.join(&other.2),
        )
    }

    fn meet(&self, other: &Self) -> Self {
        (
            self.0.meet(&other.0),
            self.1.meet(&other.1),
            self.2.meet(&other.2),
        )
    }

    fn leq(&self, other: &Self) -> bool {
        self.0.leq(&other.0) && self.1.leq(&other.1) && self.2.leq(&other.2)
    }
}


#[cfg(test)]
mod tests {
    use super::laws::check_laws;
    use super::*;

    #[test]
    fn test_product_laws() {
        let samples: Vec<(Flat<i64>, Powerset<u32>)> = vec![
            Lattice::bottom(),
            (Flat::Elem(1), Powerset::singleton(1)),
            (Flat::Elem(2), Powerset::bottom()),
            (Flat::Top, Powerset::from_iter([1, 2])),
            Lattice::top(),
        ];
        check_laws(&samples);
    }
}
