use std::fmt;
use std::hash::Hash;

use rpds::HashTrieMap;

use crate::{Lattice, Widen};

/// Pointwise map lattice. Missing keys are bottom; there is no finite top,
/// so `top()` is represented by an explicit flag.
///
/// Backed by a persistent hash trie so that configurations sharing most of
/// their memory share most of their spine.
#[derive(Clone)]
pub struct MapLattice<K: Hash + Eq, V> {
    entries: HashTrieMap<K, V>,
    top: bool,
}

impl<K: Hash + Eq + fmt::Debug, V: fmt::Debug> fmt::Debug for MapLattice<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.top {
            return write!(f, "⊤");
        }
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl<K: Hash + Eq, V> Default for MapLattice<K, V> {
    fn default() -> Self {
        Self {
            entries: HashTrieMap::new(),
            top: false,
        }
    }
}

impl<K: Hash + Eq + Clone, V: Lattice> MapLattice<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Value at `key`, bottom when absent.
    pub fn get_or_bottom(&self, key: &K) -> V {
        self.entries.get(key).cloned().unwrap_or_else(V::bottom)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Strong update.
    pub fn insert(&self, key: K, value: V) -> Self {
        Self {
            entries: self.entries.insert(key, value),
            top: self.top,
        }
    }

    pub fn insert_mut(&mut self, key: K, value: V) {
        self.entries.insert_mut(key, value);
    }

    /// Weak update: join with the current value.
    pub fn update(&self, key: K, value: &V) -> Self {
        let joined = match self.entries.get(&key) {
            Some(old) => old.join(value),
            None => value.clone(),
        };
        self.insert(key, joined)
    }

    pub fn remove(&self, key: &K) -> Self {
        Self {
            entries: self.entries.remove(key),
            top: self.top,
        }
    }

    pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) -> Self {
        let mut entries = self.entries.clone();
        for (k, v) in self.entries.iter() {
            if !keep(k, v) {
                entries.remove_mut(k);
            }
        }
        Self {
            entries,
            top: self.top,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.size()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn combine(&self, other: &Self, f: impl Fn(&V, &V) -> V) -> Self {
        if self.top || other.top {
            return Self::top();
        }
        let mut acc = self.entries.clone();
        for (k, v) in other.entries.iter() {
            let merged = match acc.get(k) {
                Some(old) => f(old, v),
                None => v.clone(),
            };
            acc.insert_mut(k.clone(), merged);
        }
        Self {
            entries: acc,
            top: false,
        }
    }
}

impl<K: Hash + Eq + Clone, V: Lattice> PartialEq for MapLattice<K, V> {
    fn eq(&self, other: &Self) -> bool {
        if self.top || other.top {
            return self.top == other.top;
        }
        // Bottom entries are equivalent to missing ones.
        self.entries
            .iter()
            .all(|(k, v)| match other.entries.get(k) {
                Some(w) => v == w,
                None => v.is_bottom(),
            })
            && other
                .entries
                .iter()
                .all(|(k, w)| self.entries.contains_key(k) || w.is_bottom())
    }
}

impl<K: Hash + Eq + Clone, V: Lattice> Lattice for MapLattice<K, V> {
    fn bottom() -> Self {
        Self::default()
    }

    fn top() -> Self {
        Self {
            entries: HashTrieMap::new(),
            top: true,
        }
    }

    fn join(&self, other: &Self) -> Self {
        self.combine(other, |a, b| a.join(b))
    }

    fn meet(&self, other: &Self) -> Self {
        if self.top {
            return other.clone();
        }
        if other.top {
            return self.clone();
        }
        let mut entries = HashTrieMap::new();
        for (k, v) in self.entries.iter() {
            if let Some(w) = other.entries.get(k) {
                entries.insert_mut(k.clone(), v.meet(w));
            }
        }
        Self {
            entries,
            top: false,
        }
    }

    fn leq(&self, other: &Self) -> bool {
        if other.top {
            return true;
        }
        if self.top {
            return false;
        }
        self.entries.iter().all(|(k, v)| match other.entries.get(k) {
            Some(w) => v.leq(w),
            None => v.is_bottom(),
        })
    }
}

impl<K: Hash + Eq + Clone, V: Widen> Widen for MapLattice<K, V> {
    fn widen(&self, next: &Self) -> Self {
        self.combine(next, |a, b| a.widen(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::laws::check_laws;
    use crate::Flat;

    fn m(pairs: &[(u32, Flat<i64>)]) -> MapLattice<u32, Flat<i64>> {
        let mut map = MapLattice::new();
        for (k, v) in pairs {
            map.insert_mut(*k, v.clone());
        }
        map
    }

    #[test]
    fn test_map_laws() {
        check_laws(&[
            MapLattice::bottom(),
            m(&[(1, Flat::Elem(1))]),
            m(&[(1, Flat::Elem(2)), (2, Flat::Top)]),
            m(&[(3, Flat::Elem(5))]),
            MapLattice::top(),
        ]);
    }

    #[test]
    fn test_weak_and_strong_update() {
        let base = m(&[(1, Flat::Elem(1))]);
        assert_eq!(base.insert(1, Flat::Elem(2)).get(&1), Some(&Flat::Elem(2)));
        assert_eq!(base.update(1, &Flat::Elem(2)).get(&1), Some(&Flat::Top));
        assert_eq!(base.update(7, &Flat::Elem(2)).get(&7), Some(&Flat::Elem(2)));
        // The original version is untouched.
        assert_eq!(base.get(&1), Some(&Flat::Elem(1)));
    }

    #[test]
    fn test_bottom_entries_compare_equal_to_missing() {
        assert_eq!(m(&[(1, Flat::Bot)]), MapLattice::bottom());
    }
}
