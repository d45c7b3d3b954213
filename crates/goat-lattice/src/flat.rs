use serde::{Deserialize, Serialize};

use crate::{Lattice, Widen};

/// The flat lattice `⊥ < x < ⊤` over any value type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Flat<T> {
    Bot,
    Elem(T),
    Top,
}

impl<T> Flat<T> {
    pub fn as_elem(&self) -> Option<&T> {
        match self {
            Flat::Elem(v) => Some(v),
            _ => None,
        }
    }

    pub fn map<U>(&self, f: impl FnOnce(&T) -> U) -> Flat<U> {
        match self {
            Flat::Bot => Flat::Bot,
            Flat::Elem(v) => Flat::Elem(f(v)),
            Flat::Top => Flat::Top,
        }
    }
}

impl<T: PartialEq> Flat<T> {
    /// Whether the concretization may contain `v`.
    pub fn may_be(&self, v: &T) -> bool {
        match self {
            Flat::Bot => false,
            Flat::Elem(x) => x == v,
            Flat::Top => true,
        }
    }

    /// Whether the concretization is exactly `{v}`.
    pub fn is(&self, v: &T) -> bool {
        matches!(self, Flat::Elem(x) if x == v)
    }
}

impl<T: Clone + PartialEq> Lattice for Flat<T> {
    fn bottom() -> Self {
        Flat::Bot
    }

    fn top() -> Self {
        Flat::Top
    }

    fn join(&self, other: &Self) -> Self {
        match (self, other) {
            (Flat::Bot, x) | (x, Flat::Bot) => x.clone(),
            (Flat::Elem(a), Flat::Elem(b)) if a == b => self.clone(),
            _ => Flat::Top,
        }
    }

    fn meet(&self, other: &Self) -> Self {
        match (self, other) {
            (Flat::Top, x) | (x, Flat::Top) => x.clone(),
            (Flat::Elem(a), Flat::Elem(b)) if a == b => self.clone(),
            _ => Flat::Bot,
        }
    }

    fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (Flat::Bot, _) | (_, Flat::Top) => true,
            (Flat::Elem(a), Flat::Elem(b)) => a == b,
            _ => false,
        }
    }
}

impl<T: Clone + PartialEq> Widen for Flat<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::laws::check_laws;

    #[test]
    fn test_flat_laws() {
        check_laws(&[
            Flat::Bot,
            Flat::Elem(true),
            Flat::Elem(false),
            Flat::Top,
        ]);
    }

    #[test]
    fn test_flat_join_distinct_is_top() {
        assert_eq!(Flat::Elem(1).join(&Flat::Elem(2)), Flat::Top);
        assert_eq!(Flat::Elem(1).meet(&Flat::Elem(2)), Flat::Bot);
        assert!(Flat::Top.may_be(&3));
        assert!(!Flat::Top.is(&3));
        assert!(Flat::Elem(3).is(&3));
    }
}
