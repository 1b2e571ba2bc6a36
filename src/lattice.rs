//! Lattices used by the analysis: the 4-valued bit lattice and the security lattices.
//!
//! The bit lattice orders the abstract states of a single bit:
//!
//! ```text
//!        U
//!       / \
//!      0   1
//!       \ /
//!        X
//! ```
//!
//! `X` ("don't care") is the bottom element, `U` ("unknown") the top element, and the two
//! constants are incomparable.
//!
//! Security lattices are small and finite. Two are provided: the two-point `l ⊑ h` lattice
//! and the diamond `l ⊑ m, n ⊑ h`.

use std::fmt;
use std::str::FromStr;

use crate::error::ParsingError;

/// Operations shared by the lattices in this crate.
pub trait Lattice<T> {
    /// Least upper bound.
    fn sup(&self, a: T, b: T) -> T;

    /// Greatest lower bound.
    fn inf(&self, a: T, b: T) -> T;

    /// The least element.
    fn bot(&self) -> T;

    /// The greatest element.
    fn top(&self) -> T;

    /// Partial order: `a ⊑ b`.
    fn le(&self, a: T, b: T) -> bool;

    /// Supremum of many elements (`bot` for an empty iterator).
    fn sup_all<I>(&self, items: I) -> T
    where
        I: IntoIterator<Item = T>,
    {
        items.into_iter().fold(self.bot(), |acc, x| self.sup(acc, x))
    }
}

/// Abstract state of a single bit.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum B {
    /// Don't care (bottom).
    X,
    /// Unknown (top).
    U,
    /// Constant zero.
    Zero,
    /// Constant one.
    One,
}

impl B {
    pub const fn is_constant(self) -> bool {
        matches!(self, B::Zero | B::One)
    }

    pub const fn is_unknown(self) -> bool {
        matches!(self, B::U)
    }

    pub const fn from_bool(value: bool) -> Self {
        if value {
            B::One
        } else {
            B::Zero
        }
    }

    /// The boolean value of a constant tag.
    pub const fn as_bool(self) -> Option<bool> {
        match self {
            B::Zero => Some(false),
            B::One => Some(true),
            _ => None,
        }
    }

    /// Negation of a constant, identity on `U` and `X`.
    pub const fn negate(self) -> Self {
        match self {
            B::Zero => B::One,
            B::One => B::Zero,
            other => other,
        }
    }

    pub const fn to_char(self) -> char {
        match self {
            B::X => 'x',
            B::U => 'u',
            B::Zero => '0',
            B::One => '1',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'x' | 'X' => Some(B::X),
            'u' | 'U' => Some(B::U),
            '0' => Some(B::Zero),
            '1' => Some(B::One),
            _ => None,
        }
    }
}

impl fmt::Display for B {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_char())
    }
}

impl FromStr for B {
    type Err = ParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => {
                B::from_char(c).ok_or_else(|| ParsingError::new(s, 0, format!("unknown bit value '{}'", c)))
            }
            (None, _) => Err(ParsingError::new(s, 0, "empty bit literal")),
            (Some(_), Some(_)) => Err(ParsingError::new(s, 1, "bit literal must be a single character")),
        }
    }
}

/// The lattice over [`B`].
#[derive(Debug, Copy, Clone, Default)]
pub struct BitLattice;

impl Lattice<B> for BitLattice {
    fn sup(&self, a: B, b: B) -> B {
        match (a, b) {
            (B::X, other) | (other, B::X) => other,
            (a, b) if a == b => a,
            _ => B::U,
        }
    }

    fn inf(&self, a: B, b: B) -> B {
        match (a, b) {
            (B::U, other) | (other, B::U) => other,
            (a, b) if a == b => a,
            _ => B::X,
        }
    }

    fn bot(&self) -> B {
        B::X
    }

    fn top(&self) -> B {
        B::U
    }

    fn le(&self, a: B, b: B) -> bool {
        self.sup(a, b) == b
    }
}

/// A security level.
///
/// `L` is public and `H` secret in every lattice; `M` and `N` are the two incomparable
/// middle levels of the diamond lattice.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Sec {
    L,
    M,
    N,
    H,
}

impl Sec {
    pub const fn name(self) -> &'static str {
        match self {
            Sec::L => "l",
            Sec::M => "m",
            Sec::N => "n",
            Sec::H => "h",
        }
    }
}

impl fmt::Display for Sec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A finite security lattice selected by the user.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum SecurityLattice {
    /// `l ⊑ h`
    #[default]
    Basic,
    /// `l ⊑ m, n ⊑ h`
    Diamond,
}

impl SecurityLattice {
    /// All levels of this lattice, in ascending (topologically sorted) order.
    pub fn elements(self) -> &'static [Sec] {
        match self {
            SecurityLattice::Basic => &[Sec::L, Sec::H],
            SecurityLattice::Diamond => &[Sec::L, Sec::M, Sec::N, Sec::H],
        }
    }

    pub fn contains(self, sec: Sec) -> bool {
        self.elements().contains(&sec)
    }

    /// Parses a level tag that belongs to this lattice.
    pub fn parse(self, s: &str) -> Result<Sec, ParsingError> {
        let trimmed = s.trim();
        let offset = s.len() - s.trim_start().len();
        self.elements()
            .iter()
            .copied()
            .find(|sec| sec.name() == trimmed)
            .ok_or_else(|| {
                let expected: Vec<&str> = self.elements().iter().map(|sec| sec.name()).collect();
                ParsingError::new(
                    s,
                    offset,
                    format!("unknown security level, expected one of {}", expected.join(", ")),
                )
            })
    }
}

impl FromStr for SecurityLattice {
    type Err = ParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "basic" => Ok(SecurityLattice::Basic),
            "diamond" => Ok(SecurityLattice::Diamond),
            _ => Err(ParsingError::new(s, 0, "unknown lattice, expected 'basic' or 'diamond'")),
        }
    }
}

impl fmt::Display for SecurityLattice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityLattice::Basic => write!(f, "basic"),
            SecurityLattice::Diamond => write!(f, "diamond"),
        }
    }
}

impl Lattice<Sec> for SecurityLattice {
    fn sup(&self, a: Sec, b: Sec) -> Sec {
        if self.le(a, b) {
            b
        } else if self.le(b, a) {
            a
        } else {
            Sec::H
        }
    }

    fn inf(&self, a: Sec, b: Sec) -> Sec {
        if self.le(a, b) {
            a
        } else if self.le(b, a) {
            b
        } else {
            Sec::L
        }
    }

    fn bot(&self) -> Sec {
        Sec::L
    }

    fn top(&self) -> Sec {
        Sec::H
    }

    fn le(&self, a: Sec, b: Sec) -> bool {
        a == b || a == Sec::L || b == Sec::H
    }
}
