//! Bit-level semantics of expression nodes.
//!
//! Every expression kind maps to an [`Operator`], a pure function from operand values to a
//! result value. New bits are created in the [`Context`]; operands are never modified.
//!
//! Single-bit gates follow the same three steps:
//!
//! 1. the result tag is computed from the operand tags with the usual boolean shortcuts
//!    (`0 & u = 0`, `1 | u = 1`, ...);
//! 2. a constant result has no dependencies;
//! 3. otherwise the result depends on the operands that are not constant, and its control
//!    dependencies are those of its data dependencies.
//!
//! Arithmetic is built from these gates: addition is a ripple-carry chain of full adders,
//! multiplication is shift-and-add.

use std::fmt;

use log::trace;
use num_traits::ToPrimitive;

use crate::ast::{BinaryOp, UnaryOp};
use crate::bit::{Bit, DependencySet};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::lattice::{BitLattice, Lattice, B};
use crate::value::{Lit, Value};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Operator {
    Literal(Lit),
    Not,
    Neg,
    And,
    Or,
    Xor,
    Add,
    Sub,
    Mul,
    Shl,
    Shr,
    /// Bit at a 1-based index, as a 2-bit unsigned value.
    Select(usize),
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Equals,
    Unequals,
    /// Guard followed by at least two joined values.
    Phi,
}

/// Number of operands an operator accepts.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exactly(k) => n == k,
            Arity::AtLeast(k) => n >= k,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exactly(k) => write!(f, "{}", k),
            Arity::AtLeast(k) => write!(f, "at least {}", k),
        }
    }
}

impl From<UnaryOp> for Operator {
    fn from(op: UnaryOp) -> Self {
        match op {
            UnaryOp::Not => Operator::Not,
            UnaryOp::Neg => Operator::Neg,
        }
    }
}

impl From<BinaryOp> for Operator {
    fn from(op: BinaryOp) -> Self {
        match op {
            BinaryOp::And => Operator::And,
            BinaryOp::Or => Operator::Or,
            BinaryOp::Xor => Operator::Xor,
            BinaryOp::Add => Operator::Add,
            BinaryOp::Sub => Operator::Sub,
            BinaryOp::Mul => Operator::Mul,
            BinaryOp::Shl => Operator::Shl,
            BinaryOp::Shr => Operator::Shr,
            BinaryOp::Less => Operator::Less,
            BinaryOp::LessEq => Operator::LessEq,
            BinaryOp::Greater => Operator::Greater,
            BinaryOp::GreaterEq => Operator::GreaterEq,
            BinaryOp::Equals => Operator::Equals,
            BinaryOp::Unequals => Operator::Unequals,
        }
    }
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Literal(_) => "literal",
            Operator::Not => "not",
            Operator::Neg => "neg",
            Operator::And => "and",
            Operator::Or => "or",
            Operator::Xor => "xor",
            Operator::Add => "add",
            Operator::Sub => "sub",
            Operator::Mul => "mul",
            Operator::Shl => "shl",
            Operator::Shr => "shr",
            Operator::Select(_) => "select",
            Operator::Less => "less",
            Operator::LessEq => "less_eq",
            Operator::Greater => "greater",
            Operator::GreaterEq => "greater_eq",
            Operator::Equals => "equals",
            Operator::Unequals => "unequals",
            Operator::Phi => "phi",
        }
    }

    pub fn arity(&self) -> Arity {
        match self {
            Operator::Literal(_) => Arity::Exactly(0),
            Operator::Not | Operator::Neg | Operator::Select(_) => Arity::Exactly(1),
            Operator::Phi => Arity::AtLeast(3),
            _ => Arity::Exactly(2),
        }
    }

    /// Computes the result value.
    ///
    /// Fails with [`Error::WrongArgumentNumber`] if the operand count does not match the
    /// operator's arity.
    pub fn compute(&self, ctx: &mut Context, args: &[Value]) -> Result<Value> {
        let arity = self.arity();
        if !arity.accepts(args.len()) {
            return Err(Error::WrongArgumentNumber {
                operator: self.name(),
                expected: arity.to_string(),
                actual: args.len(),
            });
        }
        trace!("compute {} over {} operands", self.name(), args.len());
        match self {
            Operator::Literal(lit) => Value::from_lit(ctx.arena_mut(), lit),
            Operator::Not => bitwise_not(ctx, &args[0]),
            Operator::Neg => {
                let inverted = bitwise_not(ctx, &args[0])?;
                let one = Value::from_lit(ctx.arena_mut(), &Lit::new(vec![B::One, B::Zero]))?;
                add(ctx, &inverted, &one)
            }
            Operator::And => bitwise(ctx, &args[0], &args[1], and),
            Operator::Or => bitwise(ctx, &args[0], &args[1], or),
            Operator::Xor => bitwise(ctx, &args[0], &args[1], xor),
            Operator::Add => add(ctx, &args[0], &args[1]),
            Operator::Sub => sub(ctx, &args[0], &args[1]),
            Operator::Mul => mul(ctx, &args[0], &args[1]),
            Operator::Shl => shift(ctx, &args[0], &args[1], true),
            Operator::Shr => shift(ctx, &args[0], &args[1], false),
            Operator::Select(index) => {
                let bit = args[0].bit((*index).max(1));
                boolean(ctx, bit)
            }
            Operator::Less => {
                let bit = less(ctx, &args[0], &args[1])?;
                boolean(ctx, bit)
            }
            Operator::Greater => {
                let bit = less(ctx, &args[1], &args[0])?;
                boolean(ctx, bit)
            }
            Operator::LessEq => {
                let greater = less(ctx, &args[1], &args[0])?;
                let bit = not(ctx, greater)?;
                boolean(ctx, bit)
            }
            Operator::GreaterEq => {
                let lt = less(ctx, &args[0], &args[1])?;
                let bit = not(ctx, lt)?;
                boolean(ctx, bit)
            }
            Operator::Equals => {
                let bit = equals(ctx, &args[0], &args[1], false)?;
                boolean(ctx, bit)
            }
            Operator::Unequals => {
                let bit = equals(ctx, &args[0], &args[1], true)?;
                boolean(ctx, bit)
            }
            Operator::Phi => phi(ctx, &args[0], &args[1..]),
        }
    }
}

// Gates

/// Creates the result bit of a gate: a constant without dependencies, or an unknown bit
/// depending on the non-constant `operands`.
fn gate(ctx: &mut Context, tag: B, operands: impl IntoIterator<Item = Bit>) -> Result<Bit> {
    if let Some(value) = tag.as_bool() {
        return Ok(ctx.constant(value));
    }
    let data: DependencySet = operands.into_iter().filter(|&b| !ctx.arena().is_constant(b)).collect();
    ctx.create_bit(tag, data)
}

pub(crate) fn not(ctx: &mut Context, a: Bit) -> Result<Bit> {
    let tag = ctx.arena().value(a).negate();
    gate(ctx, tag, [a])
}

pub(crate) fn and(ctx: &mut Context, a: Bit, b: Bit) -> Result<Bit> {
    let (ta, tb) = (ctx.arena().value(a), ctx.arena().value(b));
    let tag = match (ta, tb) {
        (B::Zero, _) | (_, B::Zero) => B::Zero,
        (B::One, B::One) => B::One,
        _ => B::U,
    };
    gate(ctx, tag, [a, b])
}

pub(crate) fn or(ctx: &mut Context, a: Bit, b: Bit) -> Result<Bit> {
    let (ta, tb) = (ctx.arena().value(a), ctx.arena().value(b));
    let tag = match (ta, tb) {
        (B::One, _) | (_, B::One) => B::One,
        (B::Zero, B::Zero) => B::Zero,
        _ => B::U,
    };
    gate(ctx, tag, [a, b])
}

pub(crate) fn xor(ctx: &mut Context, a: Bit, b: Bit) -> Result<Bit> {
    if a == b {
        return Ok(ctx.constant(false));
    }
    let (ta, tb) = (ctx.arena().value(a), ctx.arena().value(b));
    let tag = match (ta.as_bool(), tb.as_bool()) {
        (Some(x), Some(y)) => B::from_bool(x ^ y),
        _ => B::U,
    };
    gate(ctx, tag, [a, b])
}

/// The bit as a 2-bit unsigned value `0b0c`.
fn boolean(ctx: &mut Context, bit: Bit) -> Result<Value> {
    let zero = ctx.constant(false);
    Ok(Value::new(vec![bit, zero]))
}

fn bitwise_not(ctx: &mut Context, a: &Value) -> Result<Value> {
    let bits = a.bits().iter().map(|&x| not(ctx, x)).collect::<Result<Vec<_>>>()?;
    Ok(Value::new(bits))
}

fn bitwise<F>(ctx: &mut Context, a: &Value, b: &Value, op: F) -> Result<Value>
where
    F: Fn(&mut Context, Bit, Bit) -> Result<Bit>,
{
    let width = a.width().max(b.width());
    let bits = (1..=width)
        .map(|i| op(ctx, a.bit(i), b.bit(i)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Value::new(bits))
}

// Arithmetic

/// Result width of addition: one carry bit more than the widest operand, capped at the
/// context bit width (but never below the operand width).
fn sum_width(ctx: &Context, a: &Value, b: &Value) -> usize {
    let width = a.width().max(b.width());
    if width < ctx.bit_width() {
        width + 1
    } else {
        width
    }
}

/// Ripple-carry addition of `a + b + carry` producing `width` bits.
fn ripple_carry(ctx: &mut Context, a: &Value, b: &Value, mut carry: Bit, width: usize) -> Result<Value> {
    let mut bits = Vec::with_capacity(width);
    for i in 1..=width {
        let (x, y) = (a.bit(i), b.bit(i));
        let half = xor(ctx, x, y)?;
        let sum = xor(ctx, half, carry)?;
        let generate = and(ctx, x, y)?;
        let propagate = and(ctx, half, carry)?;
        carry = or(ctx, generate, propagate)?;
        bits.push(sum);
    }
    Ok(Value::new(bits))
}

pub(crate) fn add(ctx: &mut Context, a: &Value, b: &Value) -> Result<Value> {
    let width = sum_width(ctx, a, b);
    let carry = ctx.constant(false);
    ripple_carry(ctx, a, b, carry, width)
}

/// `a - b` computed as `a + !b + 1`.
pub(crate) fn sub(ctx: &mut Context, a: &Value, b: &Value) -> Result<Value> {
    let width = sum_width(ctx, a, b);
    let inverted = bitwise_not(ctx, &b.extended(width))?;
    let carry = ctx.constant(true);
    ripple_carry(ctx, a, &inverted, carry, width)
}

/// Shift-and-add multiplication modulo `2^width`.
fn mul(ctx: &mut Context, a: &Value, b: &Value) -> Result<Value> {
    let widest = a.width().max(b.width());
    let width = (a.width() + b.width()).min(ctx.bit_width().max(widest));
    let zero = ctx.constant(false);
    let mut acc = Value::new(vec![zero; width]);
    for i in 1..=width {
        let multiplier = b.bit(i);
        if ctx.arena().value(multiplier) == B::Zero {
            continue;
        }
        let partial = (1..=width)
            .map(|j| if j < i { Ok(zero) } else { and(ctx, a.bit(j - i + 1), multiplier) })
            .collect::<Result<Vec<_>>>()?;
        let carry = ctx.constant(false);
        acc = ripple_carry(ctx, &acc, &Value::new(partial), carry, width)?;
    }
    Ok(acc)
}

/// Shift by a constant amount; an unknown amount yields an unknown value over both operands.
fn shift(ctx: &mut Context, a: &Value, amount: &Value, left: bool) -> Result<Value> {
    let Some(amount) = amount.as_constant(ctx.arena()).and_then(|n| n.to_usize()) else {
        return unknown_over(ctx, a.width(), &[a.clone(), amount.clone()]);
    };
    let bits = if left {
        let width = a.width().saturating_add(amount).min(ctx.bit_width().max(a.width()));
        let zero = ctx.constant(false);
        (0..width)
            .map(|i| if i < amount { zero } else { a.bit(i - amount + 1) })
            .collect()
    } else {
        (1..=a.width()).map(|i| a.bit(i.saturating_add(amount))).collect()
    };
    Ok(Value::new(bits))
}

/// A value of `width` unknown bits each depending on every non-constant bit of `args`.
///
/// This is the conservative result used whenever the precise semantics are not computed.
pub(crate) fn unknown_over(ctx: &mut Context, width: usize, args: &[Value]) -> Result<Value> {
    let data: DependencySet = args
        .iter()
        .flat_map(|v| v.bits().iter().copied())
        .filter(|&b| !ctx.arena().is_constant(b))
        .collect();
    let bits = (0..width.max(2))
        .map(|_| ctx.create_bit(B::U, data.clone()))
        .collect::<Result<Vec<_>>>()?;
    Ok(Value::new(bits))
}

// Comparisons

/// Signed `a < b`, scanning from the most significant bit down.
fn less(ctx: &mut Context, a: &Value, b: &Value) -> Result<Bit> {
    let width = a.width().max(b.width());
    let mut relevant = Vec::new();
    for i in (1..=width).rev() {
        let (x, y) = (a.bit(i), b.bit(i));
        if x == y {
            continue;
        }
        match (ctx.arena().value(x).as_bool(), ctx.arena().value(y).as_bool()) {
            (Some(vx), Some(vy)) if vx == vy => continue,
            (Some(vx), Some(_)) => {
                if !relevant.is_empty() {
                    return gate(ctx, B::U, relevant);
                }
                // The sign bit is inverted: a negative left operand is the smaller one.
                let result = if i == width { vx } else { !vx };
                return Ok(ctx.constant(result));
            }
            _ => relevant.extend([x, y]),
        }
    }
    if relevant.is_empty() {
        Ok(ctx.constant(false))
    } else {
        gate(ctx, B::U, relevant)
    }
}

fn equals(ctx: &mut Context, a: &Value, b: &Value, negate: bool) -> Result<Bit> {
    let width = a.width().max(b.width());
    let mut relevant = Vec::new();
    for i in 1..=width {
        let (x, y) = (a.bit(i), b.bit(i));
        if x == y {
            continue;
        }
        match (ctx.arena().value(x).as_bool(), ctx.arena().value(y).as_bool()) {
            (Some(vx), Some(vy)) if vx == vy => {}
            (Some(_), Some(_)) => return Ok(ctx.constant(negate)),
            _ => relevant.extend([x, y]),
        }
    }
    if relevant.is_empty() {
        Ok(ctx.constant(!negate))
    } else {
        gate(ctx, B::U, relevant)
    }
}

// Joins

/// Control-flow join of `joined` under `guard`.
///
/// A constant guard selects the first joined value (1) or the second (0). Otherwise every
/// result bit is the supremum of the joined bits and depends on the unknown joined bits and
/// on the guard bit.
fn phi(ctx: &mut Context, guard: &Value, joined: &[Value]) -> Result<Value> {
    let guard = guard.bit(1);
    match ctx.arena().value(guard).as_bool() {
        Some(true) => return Ok(joined[0].clone()),
        Some(false) => return Ok(joined[1].clone()),
        None => {}
    }
    let width = joined.iter().map(Value::width).max().unwrap_or(2);
    let mut bits = Vec::with_capacity(width);
    for i in 1..=width {
        let operands: Vec<Bit> = joined.iter().map(|v| v.bit(i)).collect();
        if operands.iter().all(|&b| b == operands[0]) && ctx.arena().is_constant(operands[0]) {
            bits.push(operands[0]);
            continue;
        }
        let tag = BitLattice.sup_all(operands.iter().map(|&b| ctx.arena().value(b)));
        let bit = if let Some(value) = tag.as_bool() {
            ctx.constant(value)
        } else {
            let data: DependencySet = operands
                .iter()
                .copied()
                .filter(|&b| !ctx.arena().is_constant(b))
                .chain(std::iter::once(guard))
                .collect();
            ctx.create_bit(B::U, data)?
        };
        bits.push(bit);
    }
    Ok(Value::new(bits))
}
