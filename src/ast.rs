//! Program representation consumed by the analysis.
//!
//! Programs arrive already name-resolved and in SSA form: every variable is assigned once per
//! activation, control-flow joins are explicit [`Node::Phi`] expressions, and every call
//! names its target method. Nodes live in an arena and refer to each other by [`NodeId`].
//!
//! [`ProgramBuilder`] constructs such trees programmatically:
//!
//! ```
//! use qif_rs::ast::ProgramBuilder;
//! use qif_rs::lattice::Sec;
//!
//! let mut b = ProgramBuilder::new();
//! let h = b.declare("h");
//! let o = b.declare("o");
//! let input = b.input(h, Sec::H, "0b1u").unwrap();
//! let read = b.var(h);
//! let output = b.output(o, Sec::L, read);
//! let program = b.finish(vec![input, output]);
//! assert_eq!(program.methods().count(), 0);
//! ```

use std::fmt;

use crate::bitset::ArenaIndex;
use crate::error::Result;
use crate::lattice::Sec;
use crate::value::Lit;

/// Handle to a node of a [`Program`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn new(index: u32) -> Self {
        NodeId(index)
    }
}

impl ArenaIndex for NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }

    fn from_index(index: usize) -> Self {
        NodeId(index as u32)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a variable (one SSA version).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VarId(u32);

impl ArenaIndex for VarId {
    fn index(self) -> usize {
        self.0 as usize
    }

    fn from_index(index: usize) -> Self {
        VarId(index as u32)
    }
}

/// Handle to a method.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MethodId(u32);

impl ArenaIndex for MethodId {
    fn index(self) -> usize {
        self.0 as usize
    }

    fn from_index(index: usize) -> Self {
        MethodId(index as u32)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BinaryOp {
    And,
    Or,
    Xor,
    Add,
    Sub,
    Mul,
    Shl,
    Shr,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Equals,
    Unequals,
}

#[derive(Debug, Clone)]
pub enum Node {
    // Expressions
    Literal(Lit),
    Var(VarId),
    Unary(UnaryOp, NodeId),
    Binary(BinaryOp, NodeId, NodeId),
    /// Selects the bit at a 1-based index.
    Select(NodeId, usize),
    /// Control-flow join: the first joined value is taken when the guard's first bit is 1,
    /// the second when it is 0.
    Phi { guard: NodeId, joined: Vec<NodeId> },
    Call { method: MethodId, args: Vec<NodeId> },

    // Statements
    Block(Vec<NodeId>),
    Assign { var: VarId, expr: NodeId },
    Input { var: VarId, level: Sec, lit: Lit },
    Output { var: VarId, level: Sec, expr: NodeId },
    If { cond: NodeId, then_branch: NodeId, else_branch: Option<NodeId> },
    While { cond: NodeId, body: NodeId },
    Return(Option<NodeId>),
    Expr(NodeId),
}

impl Node {
    /// Short name of the node kind, used in error paths and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Literal(_) => "literal",
            Node::Var(_) => "variable access",
            Node::Unary(..) => "unary expression",
            Node::Binary(..) => "binary expression",
            Node::Select(..) => "bit selection",
            Node::Phi { .. } => "phi",
            Node::Call { .. } => "call",
            Node::Block(_) => "block",
            Node::Assign { .. } => "assignment",
            Node::Input { .. } => "input declaration",
            Node::Output { .. } => "output declaration",
            Node::If { .. } => "if",
            Node::While { .. } => "while",
            Node::Return(_) => "return",
            Node::Expr(_) => "expression statement",
        }
    }

    pub fn is_expression(&self) -> bool {
        matches!(
            self,
            Node::Literal(_)
                | Node::Var(_)
                | Node::Unary(..)
                | Node::Binary(..)
                | Node::Select(..)
                | Node::Phi { .. }
                | Node::Call { .. }
        )
    }

    /// Direct child nodes, in evaluation order.
    pub fn children(&self) -> Vec<NodeId> {
        match self {
            Node::Literal(_) | Node::Var(_) | Node::Input { .. } | Node::Return(None) => vec![],
            Node::Unary(_, a) | Node::Select(a, _) | Node::Expr(a) | Node::Return(Some(a)) => vec![*a],
            Node::Binary(_, a, b) => vec![*a, *b],
            Node::Phi { guard, joined } => std::iter::once(*guard).chain(joined.iter().copied()).collect(),
            Node::Call { args, .. } => args.clone(),
            Node::Block(stmts) => stmts.clone(),
            Node::Assign { expr, .. } | Node::Output { expr, .. } => vec![*expr],
            Node::If {
                cond,
                then_branch,
                else_branch,
            } => std::iter::once(*cond)
                .chain(std::iter::once(*then_branch))
                .chain(*else_branch)
                .collect(),
            Node::While { cond, body } => vec![*cond, *body],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub params: Vec<VarId>,
    /// `None` until the body is defined.
    pub body: Option<NodeId>,
}

/// A name-resolved SSA program.
#[derive(Debug, Clone)]
pub struct Program {
    nodes: Vec<Node>,
    variables: Vec<Variable>,
    methods: Vec<Method>,
    main: NodeId,
}

impl Program {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The top-level block.
    pub fn main(&self) -> NodeId {
        self.main
    }

    pub fn variable(&self, var: VarId) -> &Variable {
        &self.variables[var.index()]
    }

    pub fn method(&self, id: MethodId) -> &Method {
        &self.methods[id.index()]
    }

    pub fn methods(&self) -> impl Iterator<Item = (MethodId, &Method)> {
        self.methods
            .iter()
            .enumerate()
            .map(|(i, m)| (MethodId::from_index(i), m))
    }

    pub fn method_by_name(&self, name: &str) -> Option<MethodId> {
        self.methods().find(|(_, m)| m.name == name).map(|(id, _)| id)
    }

    /// All call expressions in the subtree rooted at `root`, in pre-order.
    pub fn calls_in(&self, root: NodeId) -> Vec<(NodeId, MethodId)> {
        let mut calls = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            if let Node::Call { method, .. } = node {
                calls.push((id, *method));
            }
            stack.extend(node.children().into_iter().rev());
        }
        calls
    }
}

/// Incrementally builds a [`Program`].
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    nodes: Vec<Node>,
    variables: Vec<Variable>,
    methods: Vec<Method>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: Node) -> NodeId {
        let id = NodeId::from_index(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn declare(&mut self, name: &str) -> VarId {
        let id = VarId::from_index(self.variables.len());
        self.variables.push(Variable { name: name.to_string() });
        id
    }

    /// Declares a method and its parameters; the body is attached with [`define_method`].
    ///
    /// [`define_method`]: ProgramBuilder::define_method
    pub fn declare_method(&mut self, name: &str, params: &[&str]) -> (MethodId, Vec<VarId>) {
        let params: Vec<VarId> = params.iter().map(|p| self.declare(p)).collect();
        let id = MethodId::from_index(self.methods.len());
        self.methods.push(Method {
            name: name.to_string(),
            params: params.clone(),
            body: None,
        });
        (id, params)
    }

    pub fn define_method(&mut self, method: MethodId, body: Vec<NodeId>) {
        let block = self.block(body);
        self.methods[method.index()].body = Some(block);
    }

    pub fn lit(&mut self, literal: &str) -> Result<NodeId> {
        let lit: Lit = literal.parse()?;
        Ok(self.add(Node::Literal(lit)))
    }

    pub fn int(&mut self, n: i64) -> NodeId {
        self.add(Node::Literal(Lit::from_int(&n.into())))
    }

    pub fn var(&mut self, var: VarId) -> NodeId {
        self.add(Node::Var(var))
    }

    pub fn unary(&mut self, op: UnaryOp, a: NodeId) -> NodeId {
        self.add(Node::Unary(op, a))
    }

    pub fn binary(&mut self, op: BinaryOp, a: NodeId, b: NodeId) -> NodeId {
        self.add(Node::Binary(op, a, b))
    }

    pub fn select(&mut self, a: NodeId, index: usize) -> NodeId {
        self.add(Node::Select(a, index))
    }

    pub fn phi(&mut self, guard: NodeId, joined: Vec<NodeId>) -> NodeId {
        self.add(Node::Phi { guard, joined })
    }

    pub fn call(&mut self, method: MethodId, args: Vec<NodeId>) -> NodeId {
        self.add(Node::Call { method, args })
    }

    pub fn block(&mut self, stmts: Vec<NodeId>) -> NodeId {
        self.add(Node::Block(stmts))
    }

    pub fn assign(&mut self, var: VarId, expr: NodeId) -> NodeId {
        self.add(Node::Assign { var, expr })
    }

    pub fn input(&mut self, var: VarId, level: Sec, literal: &str) -> Result<NodeId> {
        let lit: Lit = literal.parse()?;
        Ok(self.add(Node::Input { var, level, lit }))
    }

    pub fn output(&mut self, var: VarId, level: Sec, expr: NodeId) -> NodeId {
        self.add(Node::Output { var, level, expr })
    }

    pub fn if_else(&mut self, cond: NodeId, then_branch: Vec<NodeId>, else_branch: Option<Vec<NodeId>>) -> NodeId {
        let then_branch = self.block(then_branch);
        let else_branch = else_branch.map(|stmts| self.block(stmts));
        self.add(Node::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    pub fn while_loop(&mut self, cond: NodeId, body: Vec<NodeId>) -> NodeId {
        let body = self.block(body);
        self.add(Node::While { cond, body })
    }

    pub fn ret(&mut self, expr: Option<NodeId>) -> NodeId {
        self.add(Node::Return(expr))
    }

    pub fn expr(&mut self, expr: NodeId) -> NodeId {
        self.add(Node::Expr(expr))
    }

    /// Finishes the program with the given top-level statements.
    ///
    /// # Panics
    ///
    /// Panics if a declared method was never defined.
    pub fn finish(mut self, main: Vec<NodeId>) -> Program {
        let main = self.block(main);
        for method in &self.methods {
            assert!(method.body.is_some(), "Method {} has no body", method.name);
        }
        Program {
            nodes: self.nodes,
            variables: self.variables,
            methods: self.methods,
            main,
        }
    }
}
