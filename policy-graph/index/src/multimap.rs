use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::hash::Hash;

/// Maps each key to a set of values.
#[derive(Debug)]
pub struct MultiMap<K, V> {
    map: HashMap<K, HashSet<V>>,
}

/// Tracks a many-to-many relation so that it may be queried from either side.
#[derive(Debug)]
pub struct BiMultiMap<A, B> {
    forward: MultiMap<A, B>,
    reverse: MultiMap<B, A>,
}

// === impl MultiMap ===

impl<K, V> Default for MultiMap<K, V> {
    fn default() -> Self {
        Self {
            map: HashMap::default(),
        }
    }
}

impl<K: Hash + Eq, V: Hash + Eq> MultiMap<K, V> {
    /// Returns true if the pair was not already present.
    pub fn put(&mut self, key: K, value: V) -> bool {
        self.map.entry(key).or_default().insert(value)
    }

    /// Returns true if the pair was present.
    pub fn discard(&mut self, key: &K, value: &V) -> bool {
        let Some(values) = self.map.get_mut(key) else {
            return false;
        };
        let removed = values.remove(value);
        if values.is_empty() {
            self.map.remove(key);
        }
        removed
    }

    pub fn contains(&self, key: &K, value: &V) -> bool {
        self.map.get(key).map_or(false, |vs| vs.contains(value))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn get(&self, key: &K) -> impl Iterator<Item = &V> {
        self.map.get(key).into_iter().flatten()
    }

    /// The number of distinct keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// === impl BiMultiMap ===

impl<A, B> Default for BiMultiMap<A, B> {
    fn default() -> Self {
        Self {
            forward: MultiMap::default(),
            reverse: MultiMap::default(),
        }
    }
}

impl<A: Hash + Eq + Clone, B: Hash + Eq + Clone> BiMultiMap<A, B> {
    pub fn insert(&mut self, a: A, b: B) -> bool {
        if !self.forward.put(a.clone(), b.clone()) {
            return false;
        }
        self.reverse.put(b, a);
        true
    }

    pub fn remove(&mut self, a: &A, b: &B) -> bool {
        if !self.forward.discard(a, b) {
            return false;
        }
        self.reverse.discard(b, a);
        true
    }

    pub fn contains(&self, a: &A, b: &B) -> bool {
        self.forward.contains(a, b)
    }

    pub fn get_by_left(&self, a: &A) -> impl Iterator<Item = &B> {
        self.forward.get(a)
    }

    pub fn get_by_right(&self, b: &B) -> impl Iterator<Item = &A> {
        self.reverse.get(b)
    }

    pub fn contains_left(&self, a: &A) -> bool {
        self.forward.contains_key(a)
    }

    pub fn contains_right(&self, b: &B) -> bool {
        self.reverse.contains_key(b)
    }

    /// The number of distinct left-hand values with at least one relation.
    pub fn left_len(&self) -> usize {
        self.forward.len()
    }
}
