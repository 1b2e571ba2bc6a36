//! Dense sets over arena indices.
//!
//! Bits, program nodes and call graph nodes are all addressed by small integer indices into
//! their arenas. Graph traversals over those arenas mark visited elements in an [`IndexSet`],
//! a word-packed bit set that grows on demand.

use std::fmt;
use std::marker::PhantomData;

/// A handle addressing an element of an arena.
pub trait ArenaIndex: Copy {
    fn index(self) -> usize;
    fn from_index(index: usize) -> Self;
}

/// A set of arena handles backed by a vector of `u64` words.
#[derive(Clone)]
pub struct IndexSet<K> {
    words: Vec<u64>,
    count: usize,
    _key: PhantomData<K>,
}

impl<K> IndexSet<K> {
    const BITS_PER_WORD: usize = 64;

    /// Creates an empty set able to hold `capacity` indices without growing.
    pub fn with_capacity(capacity: usize) -> Self {
        let num_words = capacity.div_ceil(Self::BITS_PER_WORD);
        Self {
            words: vec![0; num_words],
            count: 0,
            _key: PhantomData,
        }
    }

    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    fn word_and_bit(index: usize) -> (usize, usize) {
        (index / Self::BITS_PER_WORD, index % Self::BITS_PER_WORD)
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
        self.count = 0;
    }
}

impl<K: ArenaIndex> IndexSet<K> {
    #[inline]
    pub fn contains(&self, key: K) -> bool {
        let (word_idx, bit_idx) = Self::word_and_bit(key.index());
        match self.words.get(word_idx) {
            Some(word) => word & (1u64 << bit_idx) != 0,
            None => false,
        }
    }

    /// Inserts the key. Returns true if it was not present before.
    #[inline]
    pub fn insert(&mut self, key: K) -> bool {
        let (word_idx, bit_idx) = Self::word_and_bit(key.index());
        if word_idx >= self.words.len() {
            self.words.resize(word_idx + 1, 0);
        }
        let mask = 1u64 << bit_idx;
        let was_clear = self.words[word_idx] & mask == 0;
        if was_clear {
            self.words[word_idx] |= mask;
            self.count += 1;
        }
        was_clear
    }

    /// Removes the key. Returns true if it was present.
    #[inline]
    pub fn remove(&mut self, key: K) -> bool {
        let (word_idx, bit_idx) = Self::word_and_bit(key.index());
        if word_idx >= self.words.len() {
            return false;
        }
        let mask = 1u64 << bit_idx;
        let was_set = self.words[word_idx] & mask != 0;
        if was_set {
            self.words[word_idx] &= !mask;
            self.count -= 1;
        }
        was_set
    }

    /// Iterates over the keys in ascending index order.
    pub fn iter(&self) -> IndexSetIter<'_, K> {
        IndexSetIter {
            words: &self.words,
            word_idx: 0,
            current_word: self.words.first().copied().unwrap_or(0),
            _key: PhantomData,
        }
    }
}

impl<K> Default for IndexSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ArenaIndex> Extend<K> for IndexSet<K> {
    fn extend<I: IntoIterator<Item = K>>(&mut self, iter: I) {
        for key in iter {
            self.insert(key);
        }
    }
}

impl<K: ArenaIndex> FromIterator<K> for IndexSet<K> {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        let mut set = IndexSet::new();
        set.extend(iter);
        set
    }
}

impl<K: ArenaIndex + fmt::Debug> fmt::Debug for IndexSet<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

pub struct IndexSetIter<'a, K> {
    words: &'a [u64],
    word_idx: usize,
    current_word: u64,
    _key: PhantomData<K>,
}

impl<K: ArenaIndex> Iterator for IndexSetIter<'_, K> {
    type Item = K;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current_word != 0 {
                let bit_idx = self.current_word.trailing_zeros() as usize;
                self.current_word &= self.current_word - 1; // Clear lowest set bit
                return Some(K::from_index(self.word_idx * IndexSet::<K>::BITS_PER_WORD + bit_idx));
            }
            self.word_idx += 1;
            if self.word_idx >= self.words.len() {
                return None;
            }
            self.current_word = self.words[self.word_idx];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    impl ArenaIndex for usize {
        fn index(self) -> usize {
            self
        }
        fn from_index(index: usize) -> Self {
            index
        }
    }

    #[test]
    fn test_insert_contains() {
        let mut set: IndexSet<usize> = IndexSet::with_capacity(100);
        assert!(!set.contains(42));
        assert!(set.insert(42));
        assert!(set.contains(42));
        assert!(!set.insert(42));
        assert_eq!(set.len(), 1);
        assert!(!set.contains(1000));
    }

    #[test]
    fn test_remove() {
        let mut set: IndexSet<usize> = IndexSet::new();
        set.insert(42);
        assert!(set.remove(42));
        assert!(!set.remove(42));
        assert!(set.is_empty());
    }

    #[test]
    fn test_iter_across_words() {
        let set: IndexSet<usize> = [65, 3, 64, 10, 5].into_iter().collect();
        let indices: Vec<_> = set.iter().collect();
        assert_eq!(indices, vec![3, 5, 10, 64, 65]);
    }
}
