use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{Lattice, Widen};

/// Finite sets ordered by inclusion, plus a top bit that stands for
/// "any element" when the set cannot be enumerated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Powerset<T: Ord> {
    elems: BTreeSet<T>,
    top: bool,
}

impl<T: Ord> Default for Powerset<T> {
    fn default() -> Self {
        Self {
            elems: BTreeSet::new(),
            top: false,
        }
    }
}

impl<T: Ord + Clone> Powerset<T> {
    pub fn singleton(v: T) -> Self {
        let mut elems = BTreeSet::new();
        elems.insert(v);
        Self { elems, top: false }
    }

    pub fn is_top_set(&self) -> bool {
        self.top
    }

    pub fn is_empty(&self) -> bool {
        !self.top && self.elems.is_empty()
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn contains(&self, v: &T) -> bool {
        self.elems.contains(v)
    }

    /// Membership is possible: either listed or the set is top.
    pub fn may_contain(&self, v: &T) -> bool {
        self.top || self.elems.contains(v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.elems.iter()
    }

    pub fn insert(&mut self, v: T) {
        if !self.top {
            self.elems.insert(v);
        }
    }

    pub fn remove(&mut self, v: &T) {
        self.elems.remove(v);
    }

    pub fn with(&self, v: T) -> Self {
        let mut next = self.clone();
        next.insert(v);
        next
    }

    pub fn without(&self, v: &T) -> Self {
        let mut next = self.clone();
        next.remove(v);
        next
    }

    pub fn filter(&self, mut keep: impl FnMut(&T) -> bool) -> Self {
        Self {
            elems: self.elems.iter().filter(|v| keep(v)).cloned().collect(),
            top: self.top,
        }
    }

    pub fn map<U: Ord + Clone>(&self, f: impl FnMut(&T) -> U) -> Powerset<U> {
        Powerset {
            elems: self.elems.iter().map(f).collect(),
            top: self.top,
        }
    }

    /// The single element, when the set is exactly one known value.
    pub fn single(&self) -> Option<&T> {
        if !self.top && self.elems.len() == 1 {
            self.elems.iter().next()
        } else {
            None
        }
    }
}

impl<T: Ord + Clone> FromIterator<T> for Powerset<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            elems: iter.into_iter().collect(),
            top: false,
        }
    }
}

impl<T: Ord + Clone> Lattice for Powerset<T> {
    fn bottom() -> Self {
        Self::default()
    }

    fn top() -> Self {
        Self {
            elems: BTreeSet::new(),
            top: true,
        }
    }

    fn join(&self, other: &Self) -> Self {
        if self.top || other.top {
            return Self::top();
        }
        Self {
            elems: self.elems.union(&other.elems).cloned().collect(),
            top: false,
        }
    }

    fn meet(&self, other: &Self) -> Self {
        match (self.top, other.top) {
            (true, _) => other.clone(),
            (_, true) => self.clone(),
            _ => Self {
                elems: self.elems.intersection(&other.elems).cloned().collect(),
                top: false,
            },
        }
    }

    fn leq(&self, other: &Self) -> bool {
        other.top || (!self.top && self.elems.is_subset(&other.elems))
    }
}

impl<T: Ord + Clone> Widen for Powerset<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::laws::check_laws;

    #[test]
    fn test_powerset_laws() {
        check_laws(&[
            Powerset::bottom(),
            Powerset::singleton(1u8),
            Powerset::singleton(2u8),
            Powerset::from_iter([1u8, 2, 3]),
            Powerset::top(),
        ]);
    }

    #[test]
    fn test_top_bit_absorbs() {
        let a = Powerset::from_iter(["g1", "g2"]);
        let t = a.join(&Powerset::top());
        assert!(t.is_top_set());
        assert!(t.may_contain(&"g9"));
        assert!(!t.contains(&"g9"));
        assert_eq!(a.meet(&Powerset::top()), a);
    }

    #[test]
    fn test_single() {
        assert_eq!(Powerset::singleton(4).single(), Some(&4));
        assert_eq!(Powerset::from_iter([4, 5]).single(), None);
        assert_eq!(Powerset::<i32>::top().single(), None);
    }
}
