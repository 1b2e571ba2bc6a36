//! Multi-bit values and value literals.
//!
//! A [`Value`] is a sequence of at least two bits, least significant bit first, interpreted
//! as a two's complement integer: widening replicates the sign (last) bit. Values hold bit
//! handles only, so equality and hashing are structural over the handles.
//!
//! A [`Lit`] is the bit-pattern of a literal (`0b1u`, `-3`, ...) before any bits exist for it.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use num_bigint::{BigInt, BigUint};
use num_traits::{One, Signed, Zero};

use crate::ast::NodeId;
use crate::bit::{Bit, BitArena, DependencySet};
use crate::bitset::ArenaIndex;
use crate::error::{ParsingError, Result};
use crate::lattice::{BitLattice, Lattice, B};

/// Identifier of a value registered in a [`Context`][crate::context::Context].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ValueId(u32);

impl ArenaIndex for ValueId {
    fn index(self) -> usize {
        self.0 as usize
    }

    fn from_index(index: usize) -> Self {
        ValueId(index as u32)
    }
}

/// The bit pattern of a literal, least significant bit first.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Lit(Vec<B>);

impl Lit {
    pub fn new(mut bits: Vec<B>) -> Self {
        while bits.len() < 2 {
            let sign = bits.last().copied().unwrap_or(B::Zero);
            bits.push(sign);
        }
        Lit(bits)
    }

    /// Minimal-width two's complement pattern of an integer.
    pub fn from_int(n: &BigInt) -> Self {
        let (width, magnitude) = if n.is_negative() {
            let width = (-n - BigInt::one()).bits() + 1;
            let shifted = n + (BigInt::one() << width);
            (width, shifted.to_biguint().unwrap_or_default())
        } else {
            (n.bits() + 1, n.to_biguint().unwrap_or_default())
        };
        let width = width.max(2);
        Lit((0..width).map(|i| B::from_bool(magnitude.bit(i))).collect())
    }

    pub fn width(&self) -> usize {
        self.0.len()
    }

    pub fn bits(&self) -> &[B] {
        &self.0
    }

    /// The integer this pattern denotes, if every bit is constant.
    pub fn as_int(&self) -> Option<BigInt> {
        let mut magnitude = BigUint::zero();
        for (i, b) in self.0.iter().enumerate() {
            if b.as_bool()? {
                magnitude.set_bit(i as u64, true);
            }
        }
        let mut n = BigInt::from(magnitude);
        if self.0.last() == Some(&B::One) {
            n -= BigInt::one() << self.0.len();
        }
        Some(n)
    }

    pub fn is_constant(&self) -> bool {
        self.0.iter().all(|b| b.is_constant())
    }
}

impl fmt::Display for Lit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0b")?;
        for b in self.0.iter().rev() {
            write!(f, "{}", b)?;
        }
        Ok(())
    }
}

impl FromStr for Lit {
    type Err = ParsingError;

    /// Parses `0b` followed by `0`, `1`, `u`, `x` digits (most significant first), or a
    /// decimal integer with an optional leading `-`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Some(digits) = s.strip_prefix("0b") {
            if digits.is_empty() {
                return Err(ParsingError::new(s, 2, "missing binary digits"));
            }
            let mut bits = Vec::with_capacity(digits.len() + 1);
            for (i, c) in digits.chars().enumerate() {
                let b = B::from_char(c)
                    .ok_or_else(|| ParsingError::new(s, 2 + i, format!("unexpected character '{}'", c)))?;
                bits.push(b);
            }
            if bits.len() < 2 {
                bits.insert(0, B::Zero);
            }
            bits.reverse();
            return Ok(Lit(bits));
        }

        let body = s.strip_prefix('-').unwrap_or(s);
        let sign_len = s.len() - body.len();
        if body.is_empty() {
            return Err(ParsingError::new(s, sign_len, "missing digits"));
        }
        if let Some(pos) = body.find(|c: char| !c.is_ascii_digit()) {
            return Err(ParsingError::new(s, sign_len + pos, "expected a decimal digit"));
        }
        let n: BigInt = s
            .parse()
            .map_err(|_| ParsingError::new(s, 0, "invalid integer literal"))?;
        Ok(Lit::from_int(&n))
    }
}

/// A multi-bit value.
#[derive(Clone)]
pub struct Value {
    bits: Vec<Bit>,
    description: Option<String>,
    node: Option<NodeId>,
}

impl Value {
    /// Creates a value from its bits, least significant first.
    ///
    /// # Panics
    ///
    /// Panics if fewer than two bits are given.
    pub fn new(bits: Vec<Bit>) -> Self {
        assert!(bits.len() >= 2, "Values need at least two bits, got {}", bits.len());
        Self {
            bits,
            description: None,
            node: None,
        }
    }

    /// Creates a value with fresh bits for the given literal pattern.
    ///
    /// Unknown and don't-care digits become fresh bits without dependencies.
    pub fn from_lit(arena: &mut BitArena, lit: &Lit) -> Result<Self> {
        let bits = lit
            .bits()
            .iter()
            .map(|&b| arena.create(b, DependencySet::empty(), DependencySet::empty()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::new(bits))
    }

    pub fn width(&self) -> usize {
        self.bits.len()
    }

    pub fn bits(&self) -> &[Bit] {
        &self.bits
    }

    /// The bit at the 1-based `index`; indices past the width yield the sign bit.
    pub fn bit(&self, index: usize) -> Bit {
        assert!(index >= 1, "Bit indices are 1-based");
        self.bits.get(index - 1).copied().unwrap_or_else(|| self.sign())
    }

    pub fn sign(&self) -> Bit {
        self.bits[self.bits.len() - 1]
    }

    /// The value sign-extended to at least `width` bits.
    pub fn extended(&self, width: usize) -> Value {
        if width <= self.width() {
            return self.clone();
        }
        let sign = self.sign();
        let mut bits = self.bits.clone();
        bits.resize(width, sign);
        Value::new(bits)
    }

    /// The lowest `width` bits (at least two).
    pub fn truncated(&self, width: usize) -> Value {
        let width = width.max(2);
        if width >= self.width() {
            return self.clone();
        }
        Value::new(self.bits[..width].to_vec())
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Sets the description unless one is already present. Returns whether it was set.
    pub fn set_description(&mut self, description: impl Into<String>) -> bool {
        if self.description.is_some() {
            return false;
        }
        self.description = Some(description.into());
        true
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    /// Sets the originating node unless one is already present. Returns whether it was set.
    pub fn set_node(&mut self, node: NodeId) -> bool {
        if self.node.is_some() {
            return false;
        }
        self.node = Some(node);
        true
    }

    /// The bit pattern of the value.
    pub fn lit(&self, arena: &BitArena) -> Lit {
        Lit(self.bits.iter().map(|&b| arena.value(b)).collect())
    }

    pub fn is_constant(&self, arena: &BitArena) -> bool {
        self.bits.iter().all(|&b| arena.is_constant(b))
    }

    pub fn as_constant(&self, arena: &BitArena) -> Option<BigInt> {
        self.lit(arena).as_int()
    }

    pub fn display<'a>(&'a self, arena: &'a BitArena) -> ValueDisplay<'a> {
        ValueDisplay { value: self, arena }
    }

    /// Bitwise supremum after sign-extension to equal width.
    ///
    /// Differing bits become unknown and depend on the joined non-constant bits.
    pub fn sup(&self, other: &Value, arena: &mut BitArena) -> Result<Value> {
        self.combine(other, arena, |l, a, b| l.sup(a, b))
    }

    /// Bitwise infimum after sign-extension to equal width.
    pub fn inf(&self, other: &Value, arena: &mut BitArena) -> Result<Value> {
        self.combine(other, arena, |l, a, b| l.inf(a, b))
    }

    fn combine<F>(&self, other: &Value, arena: &mut BitArena, op: F) -> Result<Value>
    where
        F: Fn(&BitLattice, B, B) -> B,
    {
        let width = self.width().max(other.width());
        let mut bits = Vec::with_capacity(width);
        for i in 1..=width {
            let (a, b) = (self.bit(i), other.bit(i));
            if a == b {
                bits.push(a);
                continue;
            }
            let tag = op(&BitLattice, arena.value(a), arena.value(b));
            let bit = if tag.is_constant() {
                arena.create(tag, DependencySet::empty(), DependencySet::empty())?
            } else {
                let data: DependencySet = [a, b].into_iter().filter(|&x| !arena.is_constant(x)).collect();
                let control = arena.control_of(data.iter());
                arena.create(tag, data, control)?
            };
            bits.push(bit);
        }
        Ok(Value::new(bits))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bits.hash(state);
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("bits", &self.bits)
            .field("description", &self.description)
            .finish()
    }
}

/// Renders a value as `0b…` with its bit tags.
pub struct ValueDisplay<'a> {
    value: &'a Value,
    arena: &'a BitArena,
}

impl fmt::Display for ValueDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value.lit(self.arena))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn lit(s: &str) -> Lit {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_binary() {
        assert_eq!(lit("0b1u").bits(), &[B::U, B::One]);
        assert_eq!(lit("0b1").bits(), &[B::One, B::Zero]);
        assert_eq!(lit("0bx0u1").width(), 4);
    }

    #[test]
    fn test_parse_decimal() {
        assert_eq!(lit("0").to_string(), "0b00");
        assert_eq!(lit("1").to_string(), "0b01");
        assert_eq!(lit("3").to_string(), "0b011");
        assert_eq!(lit("5").to_string(), "0b0101");
        assert_eq!(lit("-1").to_string(), "0b11");
        assert_eq!(lit("-2").to_string(), "0b10");
        assert_eq!(lit("-3").to_string(), "0b101");
    }

    #[test]
    fn test_as_int() {
        for n in [-130i64, -3, -2, -1, 0, 1, 2, 3, 127, 128, 1 << 40] {
            assert_eq!(lit(&n.to_string()).as_int(), Some(BigInt::from(n)));
        }
        let wide = "123456789012345678901234567890";
        assert_eq!(lit(wide).as_int().unwrap().to_string(), wide);
        assert_eq!(lit("0b1u").as_int(), None);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(lit_err("0b1z").column, 3);
        assert_eq!(lit_err("12a").column, 2);
        assert_eq!(lit_err("-").column, 1);
        assert_eq!(lit_err("0b").column, 2);
    }

    fn lit_err(s: &str) -> ParsingError {
        s.parse::<Lit>().unwrap_err()
    }

    #[test]
    fn test_value_round_trip() {
        let mut arena = BitArena::new();
        for s in ["0b1u", "0bxu01", "-7", "42", "0buuu"] {
            let value = Value::from_lit(&mut arena, &lit(s)).unwrap();
            let printed = value.display(&arena).to_string();
            assert_eq!(printed.parse::<Lit>().unwrap(), value.lit(&arena));
        }
    }

    #[test]
    fn test_sign_extension() {
        let mut arena = BitArena::new();
        let v = Value::from_lit(&mut arena, &lit("-2")).unwrap();
        let wide = v.extended(5);
        assert_eq!(wide.width(), 5);
        assert_eq!(wide.bit(5), v.sign());
        assert_eq!(wide.as_constant(&arena), Some(BigInt::from(-2)));
        assert_eq!(v.bit(9), v.sign());
    }

    #[test]
    fn test_structural_equality() {
        let mut arena = BitArena::new();
        let a = Value::from_lit(&mut arena, &lit("0b1u")).unwrap();
        let mut b = a.clone();
        b.set_description("copy");
        assert_eq!(a, b);
        let c = Value::from_lit(&mut arena, &lit("0b1u")).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_set_once_metadata() {
        let mut arena = BitArena::new();
        let mut v = Value::from_lit(&mut arena, &lit("1")).unwrap();
        assert!(v.set_description("first"));
        assert!(!v.set_description("second"));
        assert_eq!(v.description(), Some("first"));
        assert!(v.set_node(NodeId::new(2)));
        assert!(!v.set_node(NodeId::new(3)));
    }

    #[test]
    fn test_value_sup_inf() {
        let mut arena = BitArena::new();
        let a = Value::from_lit(&mut arena, &lit("0b01")).unwrap();
        let b = Value::from_lit(&mut arena, &lit("0b11")).unwrap();
        let sup = a.sup(&b, &mut arena).unwrap();
        assert_eq!(sup.lit(&arena).to_string(), "0bu1");
        let inf = a.inf(&b, &mut arena).unwrap();
        assert_eq!(inf.lit(&arena).to_string(), "0bx1");
        assert!(arena.data(sup.bit(2)).is_empty());
    }
}
