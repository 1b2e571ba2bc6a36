//! Bits and the arena that owns them.
//!
//! A [`Bit`] is a lightweight handle (an index into a [`BitArena`]) to an immutable record: the
//! abstract state of the bit, the bits its value was computed from (data dependencies) and
//! the guard bits that were active when it was computed (control dependencies). The index is
//! also the bit's globally unique sequence id within one analysis run.
//!
//! Bits only ever point to bits created before them, so the dependency relation is a DAG.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use crate::bitset::{ArenaIndex, IndexSet};
use crate::error::{invariant_error, ParsingError, Result};
use crate::lattice::B;
use crate::value::ValueId;

/// Handle to a bit in a [`BitArena`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Bit(u32);

impl Bit {
    /// Sequence id of the bit.
    pub const fn id(self) -> u32 {
        self.0
    }
}

impl ArenaIndex for Bit {
    fn index(self) -> usize {
        self.0 as usize
    }

    fn from_index(index: usize) -> Self {
        Bit(index as u32)
    }
}

impl fmt::Display for Bit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Debug for Bit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// An immutable set of bits, kept sorted by sequence id.
#[derive(Clone, Default, Eq, PartialEq, Hash)]
pub struct DependencySet(Box<[Bit]>);

impl DependencySet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, bit: Bit) -> bool {
        self.0.binary_search(&bit).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = Bit> + '_ {
        self.0.iter().copied()
    }

    pub fn as_slice(&self) -> &[Bit] {
        &self.0
    }

    /// Union.
    pub fn sup(&self, other: &Self) -> Self {
        self.iter().chain(other.iter()).collect()
    }

    /// Intersection.
    pub fn inf(&self, other: &Self) -> Self {
        self.iter().filter(|b| other.contains(*b)).collect()
    }
}

impl FromIterator<Bit> for DependencySet {
    fn from_iter<I: IntoIterator<Item = Bit>>(iter: I) -> Self {
        let mut bits: Vec<Bit> = iter.into_iter().collect();
        bits.sort_unstable();
        bits.dedup();
        Self(bits.into_boxed_slice())
    }
}

impl<'a> IntoIterator for &'a DependencySet {
    type Item = Bit;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, Bit>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter().copied()
    }
}

impl fmt::Display for DependencySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, bit) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", bit)?;
        }
        write!(f, "}}")
    }
}

impl fmt::Debug for DependencySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for DependencySet {
    type Err = ParsingError;

    /// Parses `{#1, #2}` (braces optional, whitespace ignored).
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim_end();
        let mut body_start = s.len() - s.trim_start().len();
        let mut body_end = trimmed.len();
        if s[body_start..].starts_with('{') {
            if !trimmed.ends_with('}') {
                return Err(ParsingError::new(s, trimmed.len(), "missing closing '}'"));
            }
            body_start += 1;
            body_end -= 1;
        }

        let mut bits = Vec::new();
        let mut offset = body_start;
        for part in s[body_start..body_end].split(',') {
            let column = offset + (part.len() - part.trim_start().len());
            offset += part.len() + 1;
            let item = part.trim();
            if item.is_empty() {
                if s[body_start..body_end].trim().is_empty() {
                    continue;
                }
                return Err(ParsingError::new(s, column, "empty set element"));
            }
            let digits = item
                .strip_prefix('#')
                .ok_or_else(|| ParsingError::new(s, column, "expected '#' before bit id"))?;
            let id: u32 = digits
                .parse()
                .map_err(|_| ParsingError::new(s, column + 1, format!("invalid bit id {:?}", digits)))?;
            bits.push(Bit(id));
        }
        Ok(bits.into_iter().collect())
    }
}

/// The record behind a [`Bit`].
#[derive(Debug, Clone)]
pub struct BitData {
    pub value: B,
    pub data: DependencySet,
    pub control: DependencySet,
    owner: Option<(ValueId, usize)>,
}

impl BitData {
    /// The owning value and the 1-based index of the bit in it, if any.
    pub fn owner(&self) -> Option<(ValueId, usize)> {
        self.owner
    }

    /// Data dependencies followed by control dependencies.
    pub fn dependencies(&self) -> impl Iterator<Item = Bit> + '_ {
        self.data.iter().chain(self.control.iter())
    }
}

/// Append-only storage for all bits of an analysis run.
#[derive(Debug, Default)]
pub struct BitArena {
    bits: Vec<BitData>,
}

impl BitArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Creates a new bit.
    ///
    /// Fails if the bit is constant but has data dependencies.
    pub fn create(&mut self, value: B, data: DependencySet, control: DependencySet) -> Result<Bit> {
        if value.is_constant() && !data.is_empty() {
            return Err(invariant_error!(
                "constant bit {} cannot have data dependencies {}",
                value,
                data
            ));
        }
        let bit = Bit(self.bits.len() as u32);
        self.bits.push(BitData {
            value,
            data,
            control,
            owner: None,
        });
        Ok(bit)
    }

    pub fn constant(&mut self, value: bool) -> Bit {
        let bit = Bit(self.bits.len() as u32);
        self.bits.push(BitData {
            value: B::from_bool(value),
            data: DependencySet::empty(),
            control: DependencySet::empty(),
            owner: None,
        });
        bit
    }

    pub fn get(&self, bit: Bit) -> &BitData {
        &self.bits[bit.index()]
    }

    pub fn value(&self, bit: Bit) -> B {
        self.get(bit).value
    }

    pub fn data(&self, bit: Bit) -> &DependencySet {
        &self.get(bit).data
    }

    pub fn control(&self, bit: Bit) -> &DependencySet {
        &self.get(bit).control
    }

    pub fn is_constant(&self, bit: Bit) -> bool {
        self.value(bit).is_constant()
    }

    /// Associates the bit with its owning value, unless it already has an owner.
    ///
    /// Returns whether the association was made.
    pub fn set_owner(&mut self, bit: Bit, value: ValueId, index: usize) -> bool {
        let data = &mut self.bits[bit.index()];
        if data.owner.is_some() {
            return false;
        }
        data.owner = Some((value, index));
        true
    }

    /// Union of the control dependencies of the given bits.
    pub fn control_of(&self, bits: impl IntoIterator<Item = Bit>) -> DependencySet {
        bits.into_iter().flat_map(|b| self.control(b).iter()).collect()
    }

    /// All bits reachable from `roots` through data and control dependencies, including the
    /// roots themselves.
    ///
    /// Traversal does not continue past bits for which `stop` returns true (they are still
    /// included in the result).
    pub fn reachable<F>(&self, roots: impl IntoIterator<Item = Bit>, stop: F) -> IndexSet<Bit>
    where
        F: Fn(Bit) -> bool,
    {
        let mut seen = IndexSet::with_capacity(self.bits.len());
        let mut queue: VecDeque<Bit> = VecDeque::new();
        for root in roots {
            if seen.insert(root) {
                queue.push_back(root);
            }
        }
        while let Some(bit) = queue.pop_front() {
            if stop(bit) {
                continue;
            }
            for dep in self.get(bit).dependencies() {
                if seen.insert(dep) {
                    queue.push_back(dep);
                }
            }
        }
        seen
    }

    /// Short description of a bit: `#id(tag)`.
    pub fn describe(&self, bit: Bit) -> String {
        format!("{}({})", bit, self.value(bit))
    }
}
