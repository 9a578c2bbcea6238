use ahash::AHashMap as HashMap;
use std::{fmt, hash::Hash};

/// Counts references to keys. A count never drops below zero: releasing an unreferenced key
/// indicates corrupted bookkeeping and panics.
#[derive(Debug)]
pub struct RefCounts<K> {
    counts: HashMap<K, usize>,
}

impl<K> Default for RefCounts<K> {
    fn default() -> Self {
        Self {
            counts: HashMap::default(),
        }
    }
}

impl<K: Hash + Eq + fmt::Debug> RefCounts<K> {
    /// Returns the count after the increment.
    pub fn incr(&mut self, key: K) -> usize {
        let count = self.counts.entry(key).or_default();
        *count += 1;
        *count
    }

    /// Returns the count after the decrement. Keys are forgotten when their count reaches zero.
    pub fn decr(&mut self, key: &K) -> usize {
        let Some(count) = self.counts.get_mut(key) else {
            panic!("reference count for {key:?} dropped below zero");
        };
        *count -= 1;
        let count = *count;
        if count == 0 {
            self.counts.remove(key);
        }
        count
    }

    pub fn get(&self, key: &K) -> usize {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
