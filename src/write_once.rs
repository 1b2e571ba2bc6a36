//! Insert-only maps keyed by arena indices.
//!
//! The analysis records facts (security labels, origins, node values) that must never change
//! once established. [`WriteOnceMap`] accepts a second write only if it carries the same value.

use std::fmt::Debug;

use crate::bitset::ArenaIndex;
use crate::error::{invariant_error, Result};

#[derive(Debug, Clone)]
pub struct WriteOnceMap<K, V> {
    name: &'static str,
    slots: Vec<Option<V>>,
    len: usize,
    _key: std::marker::PhantomData<K>,
}

impl<K, V> WriteOnceMap<K, V> {
    /// Creates an empty map. `name` identifies the map in error messages.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Vec::new(),
            len: 0,
            _key: std::marker::PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<K, V> WriteOnceMap<K, V>
where
    K: ArenaIndex + Debug,
    V: PartialEq + Debug,
{
    pub fn get(&self, key: K) -> Option<&V> {
        self.slots.get(key.index()).and_then(|slot| slot.as_ref())
    }

    pub fn contains_key(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    /// Records `value` for `key`.
    ///
    /// Writing the value already stored is a no-op; writing a different one is an invariant
    /// violation and leaves the map unchanged.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        let index = key.index();
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        match &self.slots[index] {
            Some(existing) if *existing == value => Ok(()),
            Some(existing) => Err(invariant_error!(
                "{}: {:?} is already mapped to {:?}, cannot remap it to {:?}",
                self.name,
                key,
                existing,
                value
            )),
            None => {
                self.slots[index] = Some(value);
                self.len += 1;
                Ok(())
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (K::from_index(i), v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit::Bit;

    use test_log::test;

    #[test]
    fn test_same_value_is_idempotent() {
        let mut map: WriteOnceMap<Bit, u32> = WriteOnceMap::new("test");
        map.insert(Bit::from_index(3), 7).unwrap();
        map.insert(Bit::from_index(3), 7).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(Bit::from_index(3)), Some(&7));
        assert_eq!(map.get(Bit::from_index(4)), None);
    }

    #[test]
    fn test_conflicting_value_fails() {
        let mut map: WriteOnceMap<Bit, u32> = WriteOnceMap::new("test");
        map.insert(Bit::from_index(1), 7).unwrap();
        let err = map.insert(Bit::from_index(1), 8).unwrap_err();
        assert!(err.to_string().contains("already mapped"));
        assert_eq!(map.get(Bit::from_index(1)), Some(&7));
    }
}
