//! Call graph of a program.
//!
//! One node per declared method plus a synthetic [`CallNode::Main`] node for the top-level
//! code. Edges are found by scanning bodies for call expressions.
//!
//! Besides the graph queries, this module provides the generic [`CallGraph::worklist`]
//! fixpoint driver used both for the dominator computation and for method summaries.
//!
//! # Loops
//!
//! A node `h` is a *loop header* if one of its callers is dominated by `h` (the call edge is
//! a back edge). The loop depth of a node is the number of loop headers on its path in the
//! dominator tree, including itself:
//!
//! ```text
//! depth(main) = 0
//! depth(n)    = depth(idom(n)) + [n is a loop header]
//! ```

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt;

use log::{debug, trace};

use crate::ast::{MethodId, NodeId, Program};
use crate::bitset::ArenaIndex;
use crate::error::Result;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum CallNode {
    Main,
    Method(MethodId),
}

impl CallNode {
    pub fn is_main(self) -> bool {
        matches!(self, CallNode::Main)
    }

    pub fn method(self) -> Option<MethodId> {
        match self {
            CallNode::Main => None,
            CallNode::Method(m) => Some(m),
        }
    }
}

impl ArenaIndex for CallNode {
    fn index(self) -> usize {
        match self {
            CallNode::Main => 0,
            CallNode::Method(m) => m.index() + 1,
        }
    }

    fn from_index(index: usize) -> Self {
        match index {
            0 => CallNode::Main,
            i => CallNode::Method(MethodId::from_index(i - 1)),
        }
    }
}

impl fmt::Display for CallNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallNode::Main => write!(f, "main"),
            CallNode::Method(m) => write!(f, "method{}", m.index()),
        }
    }
}

pub struct CallGraph {
    callers: Vec<BTreeSet<CallNode>>,
    callees: Vec<BTreeSet<CallNode>>,
    call_sites: Vec<Vec<(NodeId, MethodId)>>,
    /// Nodes reachable from main, in post order.
    post_order: Vec<CallNode>,
    names: Vec<String>,
}

impl CallGraph {
    pub fn new(program: &Program) -> Self {
        let size = program.methods().count() + 1;
        let mut call_sites = vec![program.calls_in(program.main())];
        let mut names = vec!["main".to_string()];
        for (_, method) in program.methods() {
            call_sites.push(method.body.map(|body| program.calls_in(body)).unwrap_or_default());
            names.push(method.name.clone());
        }

        let mut callers = vec![BTreeSet::new(); size];
        let mut callees = vec![BTreeSet::new(); size];
        for (index, sites) in call_sites.iter().enumerate() {
            let caller = CallNode::from_index(index);
            for &(_, method) in sites {
                let callee = CallNode::Method(method);
                callees[index].insert(callee);
                callers[callee.index()].insert(caller);
            }
        }

        let mut graph = Self {
            callers,
            callees,
            call_sites,
            post_order: Vec::new(),
            names,
        };
        graph.post_order = graph.compute_post_order();
        debug!(
            "call graph: {} nodes, {} reachable from main",
            graph.callers.len(),
            graph.post_order.len()
        );
        graph
    }

    fn compute_post_order(&self) -> Vec<CallNode> {
        let mut order = Vec::new();
        let mut visited = vec![false; self.callers.len()];
        // Iterative DFS: (node, expanded)
        let mut stack = vec![(CallNode::Main, false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            if visited[node.index()] {
                continue;
            }
            visited[node.index()] = true;
            stack.push((node, true));
            for &callee in self.callees(node).iter().rev() {
                if !visited[callee.index()] {
                    stack.push((callee, false));
                }
            }
        }
        order
    }

    pub fn main(&self) -> CallNode {
        CallNode::Main
    }

    /// All nodes, main first.
    pub fn nodes(&self) -> impl Iterator<Item = CallNode> {
        (0..self.callers.len()).map(CallNode::from_index)
    }

    pub fn name(&self, node: CallNode) -> &str {
        &self.names[node.index()]
    }

    pub fn callers(&self, node: CallNode) -> &BTreeSet<CallNode> {
        &self.callers[node.index()]
    }

    pub fn callees(&self, node: CallNode) -> &BTreeSet<CallNode> {
        &self.callees[node.index()]
    }

    /// Call expressions in the body of `node`, in pre-order.
    pub fn call_sites(&self, node: CallNode) -> &[(NodeId, MethodId)] {
        &self.call_sites[node.index()]
    }

    /// Nodes reachable from main, in post order (callees before callers).
    pub fn post_order(&self) -> &[CallNode] {
        &self.post_order
    }

    pub fn is_reachable(&self, node: CallNode) -> bool {
        self.post_order.contains(&node)
    }

    /// Nodes that can (transitively) call themselves.
    pub fn recursive_nodes(&self) -> BTreeSet<CallNode> {
        self.nodes()
            .filter(|&node| {
                let mut seen = BTreeSet::new();
                let mut stack: Vec<CallNode> = self.callees(node).iter().copied().collect();
                while let Some(n) = stack.pop() {
                    if n == node {
                        return true;
                    }
                    if seen.insert(n) {
                        stack.extend(self.callees(n).iter().copied());
                    }
                }
                false
            })
            .collect()
    }

    /// Whether any node reachable from main is recursive.
    pub fn is_recursive(&self) -> bool {
        let recursive = self.recursive_nodes();
        self.post_order.iter().any(|n| recursive.contains(n))
    }

    /// Generic fixpoint driver over the nodes reachable from main.
    ///
    /// Every reachable node missing from `state` starts at `bot(node)`. All reachable nodes
    /// are queued in post order; the queue pops the node with the lowest `priority` first,
    /// using the post-order position as tie breaker. A popped node's state is recomputed by
    /// `action`; if it changed, the nodes in `next(node)` are queued again.
    ///
    /// Termination is the caller's responsibility (a monotone `action` over a domain of
    /// finite height).
    pub fn worklist<S, A, B, N, P, K>(
        &self,
        mut action: A,
        bot: B,
        next: N,
        priority: P,
        mut state: BTreeMap<CallNode, S>,
    ) -> Result<BTreeMap<CallNode, S>>
    where
        S: PartialEq,
        A: FnMut(CallNode, &BTreeMap<CallNode, S>) -> Result<S>,
        B: Fn(CallNode) -> S,
        N: Fn(CallNode) -> Vec<CallNode>,
        P: Fn(CallNode) -> K,
        K: Ord,
    {
        let position: BTreeMap<CallNode, usize> =
            self.post_order.iter().enumerate().map(|(i, &n)| (n, i)).collect();
        let mut queue = BinaryHeap::new();
        let mut queued = BTreeSet::new();
        for &node in &self.post_order {
            state.entry(node).or_insert_with(|| bot(node));
            queue.push(Reverse((priority(node), position[&node], node)));
            queued.insert(node);
        }

        let mut steps = 0usize;
        while let Some(Reverse((_, _, node))) = queue.pop() {
            queued.remove(&node);
            steps += 1;
            let new = action(node, &state)?;
            if state.get(&node) == Some(&new) {
                continue;
            }
            trace!("worklist: {} changed", self.name(node));
            state.insert(node, new);
            for n in next(node) {
                if let Some(&pos) = position.get(&n) {
                    if queued.insert(n) {
                        queue.push(Reverse((priority(n), pos, n)));
                    }
                }
            }
        }
        debug!("worklist converged after {} steps", steps);
        Ok(state)
    }

    /// Dominator sets of the reachable nodes.
    ///
    /// Main is dominated by itself only; every other node by itself and by the nodes
    /// dominating all of its reachable callers.
    pub fn dominators(&self) -> BTreeMap<CallNode, BTreeSet<CallNode>> {
        let all: BTreeSet<CallNode> = self.post_order.iter().copied().collect();
        let bot = |node: CallNode| {
            if node.is_main() {
                BTreeSet::from([CallNode::Main])
            } else {
                all.clone()
            }
        };
        let action = |node: CallNode, state: &BTreeMap<CallNode, BTreeSet<CallNode>>| {
            if node.is_main() {
                return Ok(BTreeSet::from([CallNode::Main]));
            }
            let mut result: Option<BTreeSet<CallNode>> = None;
            for caller in self.callers(node).iter().filter(|c| state.contains_key(c)) {
                let doms = &state[caller];
                result = Some(match result {
                    None => doms.clone(),
                    Some(acc) => acc.intersection(doms).copied().collect(),
                });
            }
            let mut result = result.unwrap_or_default();
            result.insert(node);
            Ok(result)
        };
        let next = |node: CallNode| self.callees(node).iter().copied().collect();
        // The action never fails.
        self.worklist(action, bot, next, |_| 0, BTreeMap::new()).unwrap_or_default()
    }

    /// Immediate dominator of every reachable node except main.
    pub fn immediate_dominators(&self) -> BTreeMap<CallNode, CallNode> {
        let dominators = self.dominators();
        let mut idom = BTreeMap::new();
        for (&node, doms) in &dominators {
            // The closest strict dominator is the one with the most dominators itself.
            let closest = doms
                .iter()
                .filter(|&&d| d != node)
                .max_by_key(|d| dominators.get(*d).map_or(0, BTreeSet::len));
            if let Some(&d) = closest {
                idom.insert(node, d);
            }
        }
        idom
    }

    /// Nodes with an incoming back edge.
    pub fn loop_headers(&self) -> BTreeSet<CallNode> {
        let dominators = self.dominators();
        dominators
            .keys()
            .copied()
            .filter(|&h| {
                self.callers(h)
                    .iter()
                    .any(|c| dominators.get(c).is_some_and(|doms| doms.contains(&h)))
            })
            .collect()
    }

    /// Loop depth of every reachable node.
    pub fn loop_depth(&self) -> BTreeMap<CallNode, usize> {
        let headers = self.loop_headers();
        let idom = self.immediate_dominators();
        let mut children: BTreeMap<CallNode, Vec<CallNode>> = BTreeMap::new();
        for (&node, &parent) in &idom {
            children.entry(parent).or_default().push(node);
        }

        let mut depth = BTreeMap::new();
        let mut stack = vec![(CallNode::Main, 0usize)];
        while let Some((node, parent_depth)) = stack.pop() {
            let d = parent_depth + usize::from(headers.contains(&node));
            depth.insert(node, d);
            if let Some(kids) = children.get(&node) {
                stack.extend(kids.iter().map(|&k| (k, d)));
            }
        }
        depth
    }
}

impl fmt::Debug for CallGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for node in self.nodes() {
            let callees: Vec<&str> = self.callees(node).iter().map(|&c| self.name(c)).collect();
            map.entry(&self.name(node), &callees);
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ProgramBuilder;

    use test_log::test;

    /// main -> f -> f (self recursion), main -> g.
    fn recursive_program() -> (Program, MethodId, MethodId) {
        let mut b = ProgramBuilder::new();
        let (f, fp) = b.declare_method("f", &["a"]);
        let (g, _) = b.declare_method("g", &[]);

        let a = b.var(fp[0]);
        let inner = b.call(f, vec![a]);
        let ret = b.ret(Some(inner));
        b.define_method(f, vec![ret]);

        let one = b.int(1);
        let ret = b.ret(Some(one));
        b.define_method(g, vec![ret]);

        let x = b.declare("x");
        let y = b.declare("y");
        let two = b.int(2);
        let call_f = b.call(f, vec![two]);
        let call_g = b.call(g, vec![]);
        let s1 = b.assign(x, call_f);
        let s2 = b.assign(y, call_g);
        (b.finish(vec![s1, s2]), f, g)
    }

    #[test]
    fn test_edges() {
        let (program, f, g) = recursive_program();
        let graph = CallGraph::new(&program);
        let (f, g) = (CallNode::Method(f), CallNode::Method(g));
        assert_eq!(graph.callees(CallNode::Main), &BTreeSet::from([f, g]));
        assert_eq!(graph.callers(f), &BTreeSet::from([CallNode::Main, f]));
        assert_eq!(graph.post_order().last(), Some(&CallNode::Main));
        assert_eq!(graph.post_order().len(), 3);
    }

    #[test]
    fn test_loop_depth() {
        let (program, f, g) = recursive_program();
        let graph = CallGraph::new(&program);
        let depth = graph.loop_depth();
        assert_eq!(depth[&CallNode::Main], 0);
        assert_eq!(depth[&CallNode::Method(f)], 1);
        assert_eq!(depth[&CallNode::Method(g)], 0);
        assert!(graph.is_recursive());
        assert_eq!(graph.recursive_nodes(), BTreeSet::from([CallNode::Method(f)]));
    }

    #[test]
    fn test_dominators_of_chain() {
        // main -> a -> b, main -> b
        let mut builder = ProgramBuilder::new();
        let (a, _) = builder.declare_method("a", &[]);
        let (b, _) = builder.declare_method("b", &[]);
        let call_b = builder.call(b, vec![]);
        let ret = builder.ret(Some(call_b));
        builder.define_method(a, vec![ret]);
        let zero = builder.int(0);
        let ret = builder.ret(Some(zero));
        builder.define_method(b, vec![ret]);
        let call_a = builder.call(a, vec![]);
        let call_b2 = builder.call(b, vec![]);
        let s1 = builder.expr(call_a);
        let s2 = builder.expr(call_b2);
        let program = builder.finish(vec![s1, s2]);

        let graph = CallGraph::new(&program);
        let (a, b) = (CallNode::Method(a), CallNode::Method(b));
        let doms = graph.dominators();
        assert_eq!(doms[&a], BTreeSet::from([CallNode::Main, a]));
        assert_eq!(doms[&b], BTreeSet::from([CallNode::Main, b]));
        let idom = graph.immediate_dominators();
        assert_eq!(idom[&b], CallNode::Main);
        assert!(graph.loop_headers().is_empty());
        assert!(!graph.is_recursive());
    }

    #[test]
    fn test_mutual_recursion_is_detected() {
        let mut b = ProgramBuilder::new();
        let (f, _) = b.declare_method("f", &[]);
        let (g, _) = b.declare_method("g", &[]);
        let call_g = b.call(g, vec![]);
        let ret = b.ret(Some(call_g));
        b.define_method(f, vec![ret]);
        let call_f = b.call(f, vec![]);
        let ret = b.ret(Some(call_f));
        b.define_method(g, vec![ret]);
        let start = b.call(f, vec![]);
        let stmt = b.expr(start);
        let program = b.finish(vec![stmt]);

        let graph = CallGraph::new(&program);
        assert!(graph.is_recursive());
        let depth = graph.loop_depth();
        assert_eq!(depth[&CallNode::Method(f)], 1);
        assert_eq!(depth[&CallNode::Method(g)], 1);
    }

    #[test]
    fn test_unreachable_methods_are_skipped() {
        let mut b = ProgramBuilder::new();
        let (f, _) = b.declare_method("f", &[]);
        let zero = b.int(0);
        let ret = b.ret(Some(zero));
        b.define_method(f, vec![ret]);
        let program = b.finish(vec![]);

        let graph = CallGraph::new(&program);
        assert!(!graph.is_reachable(CallNode::Method(f)));
        let state = graph
            .worklist(|_, _| Ok(1), |_| 0, |_| vec![], |_| 0, BTreeMap::new())
            .unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state[&CallNode::Main], 1);
    }
}
