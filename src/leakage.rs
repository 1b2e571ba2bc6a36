//! Leakage quantification.
//!
//! For an attacker level `L`, the bit graph of a finished run is turned into a rule graph:
//!
//! - every bit depends on its data dependencies and its non-constant control dependencies;
//! - the output anchor of `L` depends on every unknown output bit at a level `⊑ L`;
//! - every unknown input bit at a level `⋢ L` additionally depends on the input anchor of `L`.
//!
//! The leakage to `L` is the weight of a minimum vertex cut between the output anchor and
//! the input anchor, where anchors cannot be cut and every bit weighs 1. The cut bits are
//! the witness: all information about the secret inputs that reaches the observable outputs
//! passes through them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::{debug, info};

use crate::bit::Bit;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::lattice::{Lattice, Sec};
use crate::mincut::{min_vertex_cut, INFTY};

/// A node of the rule graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RuleNode {
    Bit(Bit),
    InputAnchor(Sec),
    OutputAnchor(Sec),
}

impl fmt::Display for RuleNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleNode::Bit(bit) => write!(f, "{}", bit),
            RuleNode::InputAnchor(level) => write!(f, "input[{}]", level),
            RuleNode::OutputAnchor(level) => write!(f, "output[{}]", level),
        }
    }
}

/// Leakage to one attacker level.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Leakage {
    pub level: Sec,
    /// Upper bound on the number of leaked bits.
    pub bits: u64,
    /// Bits of a minimum cut between the secret inputs and the observable outputs.
    pub witness: Vec<Bit>,
}

impl fmt::Display for Leakage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "leakage to {}: {} bit(s)", self.level, self.bits)
    }
}

/// Rule graph of a finished run for one attacker level.
pub struct LeakageCalculation<'a> {
    ctx: &'a Context,
    level: Sec,
    secret: BTreeSet<Bit>,
    observable: Vec<Bit>,
}

impl<'a> LeakageCalculation<'a> {
    pub fn new(ctx: &'a Context, level: Sec) -> Result<Self> {
        let lattice = ctx.lattice();
        if !lattice.contains(level) {
            return Err(Error::Unsupported(format!(
                "level {} is not part of the {} lattice",
                level, lattice
            )));
        }
        let arena = ctx.arena();
        let io = ctx.io();
        let secret = io
            .inputs()
            .keys()
            .filter(|&&l| !lattice.le(l, level))
            .flat_map(|&l| io.input_bits(l))
            .filter(|&b| arena.value(b).is_unknown())
            .collect();
        let mut observable: Vec<Bit> = io
            .outputs()
            .keys()
            .filter(|&&l| lattice.le(l, level))
            .flat_map(|&l| io.output_bits(l))
            .filter(|&b| arena.value(b).is_unknown())
            .collect();
        observable.sort_unstable();
        observable.dedup();
        Ok(Self {
            ctx,
            level,
            secret,
            observable,
        })
    }

    pub fn level(&self) -> Sec {
        self.level
    }

    pub fn source(&self) -> RuleNode {
        RuleNode::OutputAnchor(self.level)
    }

    pub fn sink(&self) -> RuleNode {
        RuleNode::InputAnchor(self.level)
    }

    /// Successors of a node in the rule graph.
    pub fn dependencies(&self, node: RuleNode) -> Vec<RuleNode> {
        match node {
            RuleNode::OutputAnchor(_) => self.observable.iter().map(|&b| RuleNode::Bit(b)).collect(),
            RuleNode::InputAnchor(_) => Vec::new(),
            RuleNode::Bit(bit) => {
                let arena = self.ctx.arena();
                let record = arena.get(bit);
                let mut deps: Vec<RuleNode> = record
                    .data
                    .iter()
                    .chain(record.control.iter().filter(|&c| !arena.is_constant(c)))
                    .map(RuleNode::Bit)
                    .collect();
                if self.secret.contains(&bit) {
                    deps.push(self.sink());
                }
                deps
            }
        }
    }

    pub(crate) fn data_dependencies(&self, bit: Bit) -> impl Iterator<Item = Bit> + '_ {
        self.ctx.arena().data(bit).iter()
    }

    pub fn weight(&self, node: RuleNode) -> u64 {
        match node {
            RuleNode::Bit(_) => 1,
            RuleNode::InputAnchor(_) | RuleNode::OutputAnchor(_) => INFTY,
        }
    }

    /// Nodes reachable from the output anchor, in breadth-first order.
    pub fn nodes(&self) -> Vec<RuleNode> {
        let mut seen = BTreeSet::from([self.source()]);
        let mut order = vec![self.source()];
        let mut i = 0;
        while i < order.len() {
            for dep in self.dependencies(order[i]) {
                if seen.insert(dep) {
                    order.push(dep);
                }
            }
            i += 1;
        }
        order
    }

    pub fn compute(&self) -> Leakage {
        if self.secret.is_empty() || self.observable.is_empty() {
            debug!("leakage to {}: nothing to separate", self.level);
            return Leakage {
                level: self.level,
                bits: 0,
                witness: Vec::new(),
            };
        }
        let result = min_vertex_cut(
            &[self.source()],
            &[self.sink()],
            |n| self.dependencies(n),
            |n| self.weight(n),
        );
        let witness: Vec<Bit> = result
            .cut
            .iter()
            .filter_map(|n| match n {
                RuleNode::Bit(bit) => Some(*bit),
                _ => None,
            })
            .collect();
        let leakage = Leakage {
            level: self.level,
            bits: witness.len() as u64,
            witness,
        };
        info!("{} (max flow {})", leakage, result.flow);
        leakage
    }
}

/// Leakage of the run in `ctx` to an attacker at `level`.
pub fn leakage(ctx: &Context, level: Sec) -> Result<Leakage> {
    Ok(LeakageCalculation::new(ctx, level)?.compute())
}

/// Leakage to every level of the lattice.
pub fn leakages(ctx: &Context) -> Result<BTreeMap<Sec, u64>> {
    ctx.lattice()
        .elements()
        .iter()
        .map(|&level| Ok((level, leakage(ctx, level)?.bits)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::SecurityLattice;
    use crate::value::Value;

    use test_log::test;

    fn input(ctx: &mut Context, level: Sec, lit: &str) -> Value {
        let value = Value::from_lit(ctx.arena_mut(), &lit.parse().unwrap()).unwrap();
        ctx.add_input_value(level, value.clone()).unwrap();
        value
    }

    #[test]
    fn test_direct_copy() {
        let mut ctx = Context::default();
        let h = input(&mut ctx, Sec::H, "0b0uu");
        ctx.add_output_value(Sec::L, h.clone()).unwrap();

        let result = leakage(&ctx, Sec::L).unwrap();
        assert_eq!(result.bits, 2);
        assert_eq!(result.witness.len(), 2);
        assert_eq!(leakage(&ctx, Sec::H).unwrap().bits, 0);
    }

    #[test]
    fn test_bottleneck() {
        // Four secret bits squeezed through one gate.
        let mut ctx = Context::default();
        let h = input(&mut ctx, Sec::H, "0buuuu");
        let data = h.bits().iter().copied().collect();
        let gate = ctx.create_bit(crate::lattice::B::U, data).unwrap();
        let zero = ctx.constant(false);
        let out = Value::new(vec![gate, gate, zero]);
        ctx.add_output_value(Sec::L, out).unwrap();

        let result = leakage(&ctx, Sec::L).unwrap();
        assert_eq!(result.bits, 1);
        assert_eq!(result.witness, vec![gate]);
    }

    #[test]
    fn test_public_inputs_do_not_leak() {
        let mut ctx = Context::default();
        let l = input(&mut ctx, Sec::L, "0buu");
        ctx.add_output_value(Sec::L, l).unwrap();
        assert_eq!(leakages(&ctx).unwrap(), BTreeMap::from([(Sec::L, 0), (Sec::H, 0)]));
    }

    #[test]
    fn test_diamond_levels() {
        let mut ctx = Context::new(SecurityLattice::Diamond, 8);
        let m = input(&mut ctx, Sec::M, "0b0u");
        let n = input(&mut ctx, Sec::N, "0b0uu");
        let joined = Value::new(vec![m.bit(1), n.bit(1), n.bit(2)]);
        ctx.add_output_value(Sec::L, joined).unwrap();

        let all = leakages(&ctx).unwrap();
        assert_eq!(all[&Sec::L], 3);
        // m and n are incomparable: each one is secret to the other.
        assert_eq!(all[&Sec::M], 2);
        assert_eq!(all[&Sec::N], 1);
        assert_eq!(all[&Sec::H], 0);
    }

    #[test]
    fn test_control_dependencies_count() {
        let mut ctx = Context::default();
        let h = input(&mut ctx, Sec::H, "0b0u");
        ctx.push_cc(h.bit(1));
        let fresh = ctx.fresh_unknown_value(2).unwrap();
        let conditioned = ctx.apply_condition_value(fresh).unwrap();
        ctx.pop_cc();
        ctx.add_output_value(Sec::L, conditioned).unwrap();
        assert_eq!(leakage(&ctx, Sec::L).unwrap().bits, 1);
    }

    #[test]
    fn test_unknown_level() {
        let ctx = Context::default();
        assert!(matches!(leakage(&ctx, Sec::M), Err(Error::Unsupported(_))));
    }
}
