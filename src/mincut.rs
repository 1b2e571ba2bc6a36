//! Minimum vertex cuts.
//!
//! Given source and sink nodes of a dependency graph and a weight per node, computes a set
//! of nodes of minimum total weight whose removal disconnects every source from every
//! sink. Edges point from a node to its dependencies.
//!
//! Vertex weights are turned into edge capacities by splitting every node `n` into `n_in`
//! and `n_out` joined by an edge of capacity `weight(n)`. Dependency edges `n_out -> d_in`
//! have infinite capacity. A super source feeds all sources, all sinks drain into a super
//! sink, and the maximum flow is found with Edmonds–Karp (shortest augmenting paths).
//!
//! The cut consists of the nodes whose split edge leads from the part of the residual graph
//! reachable from the super source to the rest.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::hash::Hash;

use log::{debug, warn};

/// Weight of nodes that must not be cut. Flows are saturated at this value.
pub const INFTY: u64 = 1 << 40;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MinCut<N> {
    /// Nodes in the cut.
    pub cut: BTreeSet<N>,
    /// Value of the maximum flow (at most [`INFTY`]).
    pub flow: u64,
}

struct Edge {
    to: usize,
    capacity: u64,
}

/// Flow network with residual edges stored in pairs (`e ^ 1` is the reverse of `e`).
struct Network {
    edges: Vec<Edge>,
    adjacency: Vec<Vec<usize>>,
}

impl Network {
    fn new(size: usize) -> Self {
        Self {
            edges: Vec::new(),
            adjacency: vec![Vec::new(); size],
        }
    }

    fn add_edge(&mut self, from: usize, to: usize, capacity: u64) {
        self.adjacency[from].push(self.edges.len());
        self.edges.push(Edge { to, capacity });
        self.adjacency[to].push(self.edges.len());
        self.edges.push(Edge { to: from, capacity: 0 });
    }

    /// Shortest augmenting path as a list of edge ids, if any.
    fn augmenting_path(&self, source: usize, sink: usize) -> Option<Vec<usize>> {
        let mut via: Vec<Option<usize>> = vec![None; self.adjacency.len()];
        let mut seen = vec![false; self.adjacency.len()];
        let mut queue = VecDeque::from([source]);
        seen[source] = true;
        while let Some(v) = queue.pop_front() {
            if v == sink {
                let mut path = Vec::new();
                let mut current = sink;
                while let Some(e) = via[current] {
                    path.push(e);
                    current = self.edges[e ^ 1].to;
                }
                return Some(path);
            }
            for &e in &self.adjacency[v] {
                let edge = &self.edges[e];
                if edge.capacity > 0 && !seen[edge.to] {
                    seen[edge.to] = true;
                    via[edge.to] = Some(e);
                    queue.push_back(edge.to);
                }
            }
        }
        None
    }

    /// Maximum flow, stopping once it reaches [`INFTY`].
    fn max_flow(&mut self, source: usize, sink: usize) -> u64 {
        let mut flow = 0u64;
        while flow < INFTY {
            let Some(path) = self.augmenting_path(source, sink) else {
                break;
            };
            let bottleneck = path.iter().map(|&e| self.edges[e].capacity).min().unwrap_or(0);
            for &e in &path {
                self.edges[e].capacity -= bottleneck;
                self.edges[e ^ 1].capacity += bottleneck;
            }
            flow = flow.saturating_add(bottleneck);
        }
        flow.min(INFTY)
    }

    /// Vertices reachable from `source` in the residual network.
    fn residual_reachable(&self, source: usize) -> Vec<bool> {
        let mut seen = vec![false; self.adjacency.len()];
        let mut stack = vec![source];
        seen[source] = true;
        while let Some(v) = stack.pop() {
            for &e in &self.adjacency[v] {
                let edge = &self.edges[e];
                if edge.capacity > 0 && !seen[edge.to] {
                    seen[edge.to] = true;
                    stack.push(edge.to);
                }
            }
        }
        seen
    }
}

/// Computes a minimum vertex cut separating `sources` from `sinks`.
///
/// `deps(n)` lists the successors of `n`; the graph is explored from the sources and not
/// past the sinks. Sources and sinks must be disjoint.
///
/// If the flow reaches [`INFTY`] or the cut has weight 0 despite a positive flow, the
/// smaller of the sources' and the sinks' immediate neighbourhoods of finite weight is
/// returned instead.
pub fn min_vertex_cut<N, D, I, W>(sources: &[N], sinks: &[N], deps: D, weight: W) -> MinCut<N>
where
    N: Copy + Ord + Hash,
    D: Fn(N) -> I,
    I: IntoIterator<Item = N>,
    W: Fn(N) -> u64,
{
    let sink_set: BTreeSet<N> = sinks.iter().copied().collect();
    debug_assert!(sources.iter().all(|s| !sink_set.contains(s)), "sources and sinks overlap");

    // Explore the relevant part of the graph.
    let mut index: HashMap<N, usize> = HashMap::new();
    let mut nodes: Vec<N> = Vec::new();
    let mut successors: Vec<Vec<usize>> = Vec::new();
    let mut queue = VecDeque::new();
    let mut intern = |n: N, nodes: &mut Vec<N>, successors: &mut Vec<Vec<usize>>, queue: &mut VecDeque<usize>| {
        *index.entry(n).or_insert_with(|| {
            nodes.push(n);
            successors.push(Vec::new());
            queue.push_back(nodes.len() - 1);
            nodes.len() - 1
        })
    };
    for &s in sources.iter().chain(sinks) {
        intern(s, &mut nodes, &mut successors, &mut queue);
    }
    while let Some(i) = queue.pop_front() {
        let n = nodes[i];
        if sink_set.contains(&n) {
            continue;
        }
        for d in deps(n) {
            let j = intern(d, &mut nodes, &mut successors, &mut queue);
            successors[i].push(j);
        }
    }

    let count = nodes.len();
    let (source, sink) = (2 * count, 2 * count + 1);
    let mut network = Network::new(2 * count + 2);
    for (i, &n) in nodes.iter().enumerate() {
        network.add_edge(2 * i, 2 * i + 1, weight(n).min(INFTY));
        for &j in &successors[i] {
            network.add_edge(2 * i + 1, 2 * j, INFTY);
        }
    }
    for s in sources {
        network.add_edge(source, 2 * index[s], INFTY);
    }
    for t in sinks {
        network.add_edge(2 * index[t] + 1, sink, INFTY);
    }

    let flow = network.max_flow(source, sink);
    let reachable = network.residual_reachable(source);
    let cut: BTreeSet<N> = (0..count)
        .filter(|&i| reachable[2 * i] && !reachable[2 * i + 1])
        .map(|i| nodes[i])
        .collect();
    let cut_weight: u64 = cut.iter().map(|&n| weight(n).min(INFTY)).fold(0, u64::saturating_add);
    debug!("min cut: flow {}, {} nodes, weight {}", flow, cut.len(), cut_weight);

    if flow >= INFTY || (cut_weight == 0 && flow > 0) {
        warn!("degenerate min cut (flow {}, cut weight {}), using a neighbourhood", flow, cut_weight);
        let finite = |n: &N| weight(*n) < INFTY;
        let near_sources: BTreeSet<N> = sources
            .iter()
            .flat_map(|&s| successors[index[&s]].iter().map(|&j| nodes[j]))
            .filter(finite)
            .collect();
        let near_sinks: BTreeSet<N> = (0..count)
            .filter(|&i| successors[i].iter().any(|&j| sink_set.contains(&nodes[j])))
            .map(|i| nodes[i])
            .filter(finite)
            .collect();
        let cut = if near_sources.len() <= near_sinks.len() {
            near_sources
        } else {
            near_sinks
        };
        return MinCut { cut, flow: flow.min(INFTY) };
    }

    MinCut { cut, flow }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn graph(edges: &[(u32, u32)]) -> impl Fn(u32) -> Vec<u32> + '_ {
        move |n| edges.iter().filter(|(a, _)| *a == n).map(|&(_, b)| b).collect()
    }

    /// Whether a path from a source to a sink avoids the cut.
    fn connected(edges: &[(u32, u32)], sources: &[u32], sinks: &[u32], cut: &BTreeSet<u32>) -> bool {
        let deps = graph(edges);
        let mut stack: Vec<u32> = sources.iter().copied().filter(|s| !cut.contains(s)).collect();
        let mut seen = BTreeSet::new();
        while let Some(n) = stack.pop() {
            if sinks.contains(&n) {
                return true;
            }
            if seen.insert(n) {
                stack.extend(deps(n).into_iter().filter(|d| !cut.contains(d)));
            }
        }
        false
    }

    #[test]
    fn test_bottleneck() {
        // 0 -> {1, 2} -> 3 -> {4, 5} -> 6
        let edges = [(0, 1), (0, 2), (1, 3), (2, 3), (3, 4), (3, 5), (4, 6), (5, 6)];
        let weight = |n: u32| if n == 0 || n == 6 { INFTY } else { 1 };
        let result = min_vertex_cut(&[0], &[6], graph(&edges), weight);
        assert_eq!(result.flow, 1);
        assert_eq!(result.cut, BTreeSet::from([3]));
        assert!(!connected(&edges, &[0], &[6], &result.cut));
    }

    #[test]
    fn test_parallel_paths() {
        let edges = [(0, 1), (0, 2), (0, 3), (1, 4), (2, 4), (3, 4)];
        let weight = |n: u32| if n == 0 || n == 4 { INFTY } else { 1 };
        let result = min_vertex_cut(&[0], &[4], graph(&edges), weight);
        assert_eq!(result.flow, 3);
        assert_eq!(result.cut.len(), 3);
        assert!(!connected(&edges, &[0], &[4], &result.cut));
    }

    #[test]
    fn test_weighted_nodes() {
        // A heavy node on one path is bypassed by cutting two light ones elsewhere.
        let edges = [(0, 1), (1, 2), (2, 5), (0, 3), (3, 5)];
        let weight = |n: u32| match n {
            0 | 5 => INFTY,
            1 => 5,
            2 => 1,
            _ => 1,
        };
        let result = min_vertex_cut(&[0], &[5], graph(&edges), weight);
        assert_eq!(result.flow, 2);
        assert_eq!(result.cut, BTreeSet::from([2, 3]));
    }

    #[test]
    fn test_disconnected() {
        let edges = [(0, 1), (2, 3)];
        let result = min_vertex_cut(&[0], &[3], graph(&edges), |_| 1);
        assert_eq!(result.flow, 0);
        assert!(result.cut.is_empty());
    }

    #[test]
    fn test_cut_weight_bounded_by_flow() {
        let edges = [(0, 1), (0, 2), (1, 2), (1, 3), (2, 4), (3, 5), (4, 5), (3, 4)];
        let weight = |n: u32| if n == 0 || n == 5 { INFTY } else { u64::from(n) };
        let result = min_vertex_cut(&[0], &[5], graph(&edges), weight);
        let total: u64 = result.cut.iter().map(|&n| weight(n)).sum();
        assert!(total <= result.flow);
        assert!(!connected(&edges, &[0], &[5], &result.cut));
    }

    #[test]
    fn test_infinite_flow_falls_back() {
        // Every path runs through uncuttable nodes only.
        let edges = [(0, 1), (1, 2), (2, 3), (0, 4), (4, 3)];
        let weight = |n: u32| match n {
            4 => 1,
            _ => INFTY,
        };
        let result = min_vertex_cut(&[0], &[3], graph(&edges), weight);
        assert_eq!(result.flow, INFTY);
        assert_eq!(result.cut, BTreeSet::from([4]));
    }
}
