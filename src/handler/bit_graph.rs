//! Method summaries.
//!
//! A [`BitGraph`] records how the bits of a method's return value depend on the bits of its
//! parameters. It is obtained by analyzing the body on fully unknown parameters and then
//! reducing the resulting dependency graph:
//!
//! - [`Reduction::Basic`] connects every return bit directly to the parameter bits it
//!   reaches;
//! - [`Reduction::MinCut`] routes the connections through a minimum vertex cut between the
//!   return bits and the parameter bits. Every cut bit becomes an anchor depending on the
//!   parameter bits it reaches, and every return bit depends on the anchors it reaches.
//!   This keeps the information bottlenecks of the body, so leakage through a call is not
//!   overestimated.
//!
//! The graph is self-contained (it holds no handles into the arena it was computed in).
//! [`BitGraph::apply_to_args`] instantiates it at a call site by creating fresh bits over the
//! argument bits.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use log::trace;

use crate::ast::{MethodId, Program};
use crate::bit::{Bit, DependencySet};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::lattice::B;
use crate::mincut::{min_vertex_cut, INFTY};
use crate::value::Value;

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum Reduction {
    Basic,
    #[default]
    MinCut,
}

impl FromStr for Reduction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "basic" => Ok(Reduction::Basic),
            "mincut" => Ok(Reduction::MinCut),
            _ => Err("expected basic or mincut".to_string()),
        }
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reduction::Basic => write!(f, "basic"),
            Reduction::MinCut => write!(f, "mincut"),
        }
    }
}

/// Position of a parameter bit: parameter index (0-based) and bit index (1-based).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ParamBit {
    pub param: usize,
    pub bit: usize,
}

impl fmt::Display for ParamBit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}[{}]", self.param, self.bit)
    }
}

/// A node of a summary. Dependencies are indices of earlier nodes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SummaryNode {
    Param(ParamBit),
    Anchor(Vec<usize>),
    Return { tag: B, deps: Vec<usize> },
}

/// Canonical description of a return bit dependency, independent of node numbering.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
enum Dep {
    Param(ParamBit),
    Anchor(BTreeSet<ParamBit>),
}

#[derive(Debug, Clone)]
pub struct BitGraph {
    method: MethodId,
    name: String,
    params: usize,
    nodes: Vec<SummaryNode>,
    returns: Vec<usize>,
    signature: Vec<(B, BTreeSet<Dep>)>,
}

/// Accumulates summary nodes, creating parameter nodes on first use.
struct Builder {
    nodes: Vec<SummaryNode>,
    params: HashMap<ParamBit, usize>,
}

impl Builder {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            params: HashMap::new(),
        }
    }

    fn param(&mut self, param: ParamBit) -> usize {
        *self.params.entry(param).or_insert_with(|| {
            self.nodes.push(SummaryNode::Param(param));
            self.nodes.len() - 1
        })
    }

    fn push(&mut self, node: SummaryNode) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }
}

impl BitGraph {
    /// A summary without any connections: `width` unknown return bits without dependencies.
    pub fn empty(program: &Program, method: MethodId, width: usize) -> Self {
        let nodes = (0..width.max(2))
            .map(|_| SummaryNode::Return {
                tag: B::U,
                deps: Vec::new(),
            })
            .collect();
        Self::new(program, method, nodes, (0..width.max(2)).collect())
    }

    fn new(program: &Program, method: MethodId, nodes: Vec<SummaryNode>, returns: Vec<usize>) -> Self {
        let declaration = program.method(method);
        let mut graph = Self {
            method,
            name: declaration.name.clone(),
            params: declaration.params.len(),
            nodes,
            returns,
            signature: Vec::new(),
        };
        graph.signature = graph.compute_signature();
        graph
    }

    /// Builds the summary of `method` from the value `ret` it returned when analyzed on the
    /// abstract parameter values `params`.
    pub fn reduce(
        ctx: &Context,
        program: &Program,
        method: MethodId,
        params: &[Value],
        ret: &Value,
        reduction: Reduction,
    ) -> Self {
        let arena = ctx.arena();
        let mut param_of: HashMap<Bit, ParamBit> = HashMap::new();
        for (p, value) in params.iter().enumerate() {
            for (i, &bit) in value.bits().iter().enumerate() {
                param_of.entry(bit).or_insert(ParamBit { param: p, bit: i + 1 });
            }
        }
        let is_param = |b: Bit| param_of.contains_key(&b);
        let deps = |b: Bit| -> Vec<Bit> { arena.get(b).dependencies().filter(|&d| !arena.is_constant(d)).collect() };
        // Parameter bits reachable from `root` without passing a bit in `stop`.
        let reached_params = |root: Bit, stop: &BTreeSet<Bit>| -> BTreeSet<ParamBit> {
            arena
                .reachable([root], |b| is_param(b) || (b != root && stop.contains(&b)))
                .iter()
                .filter_map(|b| param_of.get(&b).copied())
                .collect()
        };

        let mut builder = Builder::new();
        let mut cut_nodes: HashMap<Bit, usize> = HashMap::new();

        if reduction == Reduction::MinCut {
            let mut sources: Vec<Bit> = ret
                .bits()
                .iter()
                .copied()
                .filter(|&b| !arena.is_constant(b) && !is_param(b))
                .collect();
            sources.sort_unstable();
            sources.dedup();
            let none = BTreeSet::new();
            let mut sinks: Vec<Bit> = Vec::new();
            for &s in &sources {
                for p in reached_params(s, &none) {
                    sinks.push(params[p.param].bit(p.bit));
                }
            }
            sinks.sort_unstable();
            sinks.dedup();

            if !sources.is_empty() && !sinks.is_empty() {
                let source_set: BTreeSet<Bit> = sources.iter().copied().collect();
                let weight = |b: Bit| if source_set.contains(&b) { INFTY } else { 1 };
                let result = min_vertex_cut(&sources, &sinks, deps, weight);
                trace!("{}: cut of {} bits", program.method(method).name, result.cut.len());
                for &c in &result.cut {
                    let node = match param_of.get(&c) {
                        Some(&p) => builder.param(p),
                        None => {
                            let anchor_deps = reached_params(c, &none).into_iter().map(|p| builder.param(p)).collect();
                            builder.push(SummaryNode::Anchor(anchor_deps))
                        }
                    };
                    cut_nodes.insert(c, node);
                }
            }
        }

        let cut: BTreeSet<Bit> = cut_nodes.keys().copied().collect();
        let mut returns = Vec::with_capacity(ret.width());
        for &r in ret.bits() {
            let tag = arena.value(r);
            let node = if let Some(value) = tag.as_bool() {
                SummaryNode::Return {
                    tag: B::from_bool(value),
                    deps: Vec::new(),
                }
            } else {
                let mut node_deps = BTreeSet::new();
                for b in arena.reachable([r], |b| is_param(b) || cut.contains(&b)).iter() {
                    if let Some(&n) = cut_nodes.get(&b) {
                        node_deps.insert(n);
                    } else if let Some(&p) = param_of.get(&b) {
                        node_deps.insert(builder.param(p));
                    }
                }
                SummaryNode::Return {
                    tag: B::U,
                    deps: node_deps.into_iter().collect(),
                }
            };
            returns.push(builder.push(node));
        }

        Self::new(program, method, builder.nodes, returns)
    }

    fn compute_signature(&self) -> Vec<(B, BTreeSet<Dep>)> {
        self.returns
            .iter()
            .map(|&r| match &self.nodes[r] {
                SummaryNode::Return { tag, deps } => (*tag, deps.iter().map(|&d| self.describe(d)).collect()),
                _ => (B::U, BTreeSet::new()),
            })
            .collect()
    }

    fn describe(&self, node: usize) -> Dep {
        match &self.nodes[node] {
            SummaryNode::Param(p) => Dep::Param(*p),
            SummaryNode::Anchor(deps) => Dep::Anchor(
                deps.iter()
                    .filter_map(|&d| match &self.nodes[d] {
                        SummaryNode::Param(p) => Some(*p),
                        _ => None,
                    })
                    .collect(),
            ),
            SummaryNode::Return { .. } => Dep::Anchor(BTreeSet::new()),
        }
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[SummaryNode] {
        &self.nodes
    }

    /// Node indices of the return bits, least significant first.
    pub fn returns(&self) -> &[usize] {
        &self.returns
    }

    pub fn width(&self) -> usize {
        self.returns.len()
    }

    /// Parameter bits the 1-based return bit `index` depends on.
    pub fn dependencies(&self, index: usize) -> BTreeSet<ParamBit> {
        let Some((_, deps)) = self.signature.get(index - 1) else {
            return BTreeSet::new();
        };
        deps.iter()
            .flat_map(|d| match d {
                Dep::Param(p) => vec![*p],
                Dep::Anchor(ps) => ps.iter().copied().collect(),
            })
            .collect()
    }

    /// Number of dependency edges.
    pub fn edge_count(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| match n {
                SummaryNode::Param(_) => 0,
                SummaryNode::Anchor(deps) | SummaryNode::Return { deps, .. } => deps.len(),
            })
            .sum()
    }

    /// Instantiates the summary over the argument bits of a call.
    ///
    /// Parameter bits are substituted by the corresponding argument bits; every other node
    /// becomes a fresh bit depending on the non-constant substitutes of its dependencies.
    pub fn apply_to_args(&self, ctx: &mut Context, args: &[Value]) -> Result<Value> {
        if args.len() != self.params {
            return Err(Error::WrongArgumentNumber {
                operator: "call",
                expected: self.params.to_string(),
                actual: args.len(),
            });
        }
        let mut mapped: Vec<Bit> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let bit = match node {
                SummaryNode::Param(p) => args[p.param].bit(p.bit),
                SummaryNode::Anchor(deps) => {
                    let data = self.substitute(ctx, deps, &mapped);
                    ctx.create_bit(B::U, data)?
                }
                SummaryNode::Return { tag, deps } => match tag.as_bool() {
                    Some(value) => ctx.constant(value),
                    None => {
                        let data = self.substitute(ctx, deps, &mapped);
                        ctx.create_bit(B::U, data)?
                    }
                },
            };
            mapped.push(bit);
        }
        Ok(Value::new(self.returns.iter().map(|&r| mapped[r]).collect()))
    }

    fn substitute(&self, ctx: &Context, deps: &[usize], mapped: &[Bit]) -> DependencySet {
        deps.iter()
            .map(|&d| mapped[d])
            .filter(|&b| !ctx.arena().is_constant(b))
            .collect()
    }
}

impl PartialEq for BitGraph {
    fn eq(&self, other: &Self) -> bool {
        self.method == other.method && self.signature == other.signature
    }
}

impl Eq for BitGraph {}

impl fmt::Display for BitGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for i in 1..=self.width() {
            if i > 1 {
                write!(f, ", ")?;
            }
            let deps: Vec<String> = self.dependencies(i).iter().map(ToString::to_string).collect();
            write!(f, "r[{}] <- {{{}}}", i, deps.join(", "))?;
        }
        write!(f, ")")
    }
}
