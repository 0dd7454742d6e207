//! Cycle detection over dependency edges.
//!
//! Edges point from a node to the node it depends on. Whole-graph checks use
//! Tarjan's strongly connected components (`petgraph::algo::tarjan_scc`); any
//! component with more than one member, or a single member with a self-edge,
//! is a cycle. When a batch of prospective edges is rejected, the detector also
//! names the edge that closes the cycle, so callers can say *which* addition
//! was refused instead of only that something was.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::{DiGraphMap, NodeTrait};
use serde::{Deserialize, Serialize};

/// A dependency cycle.
///
/// `path` is a closed walk along dependency edges: its first and last entries
/// are the same node. `closing_edge` is the edge whose presence completes the
/// walk; for a rejected addition it is the edge under consideration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle<N> {
    pub path: Vec<N>,
    pub closing_edge: (N, N),
}

impl<N: PartialEq> Cycle<N> {
    pub fn contains(&self, node: &N) -> bool {
        self.path.contains(node)
    }

    /// Distinct members of the cycle, in walk order.
    pub fn members(&self) -> &[N] {
        &self.path[..self.path.len().saturating_sub(1)]
    }
}

impl<N> Cycle<N> {
    pub fn map<M>(self, mut f: impl FnMut(N) -> M) -> Cycle<M> {
        let (from, to) = self.closing_edge;
        Cycle {
            path: self.path.into_iter().map(&mut f).collect(),
            closing_edge: (f(from), f(to)),
        }
    }
}

impl<N: fmt::Display> fmt::Display for Cycle<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.path.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{}", node)?;
        }
        write!(
            f,
            " (closed by {} -> {})",
            self.closing_edge.0, self.closing_edge.1
        )
    }
}

/// Directed graph wrapper answering acyclicity questions.
#[derive(Debug, Clone)]
pub struct CycleDetector<N: NodeTrait> {
    graph: DiGraphMap<N, ()>,
}

impl<N: NodeTrait> Default for CycleDetector<N> {
    fn default() -> Self {
        Self {
            graph: DiGraphMap::new(),
        }
    }
}

impl<N: NodeTrait> CycleDetector<N> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a node set and `(dependent, dependency)` edges.
    pub fn from_edges(
        nodes: impl IntoIterator<Item = N>,
        edges: impl IntoIterator<Item = (N, N)>,
    ) -> Self {
        let mut detector = Self::new();
        for node in nodes {
            detector.graph.add_node(node);
        }
        for (from, to) in edges {
            detector.graph.add_edge(from, to, ());
        }
        detector
    }

    /// Every cycle in the graph, one per cyclic strongly connected component.
    ///
    /// Each cycle starts at the smallest member of its component, and cycles
    /// are sorted by that start node, so output is deterministic.
    pub fn find_cycles(&self) -> Vec<Cycle<N>> {
        let mut cycles: Vec<Cycle<N>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter_map(|component| match component.as_slice() {
                [single] if self.graph.contains_edge(*single, *single) => Some(Cycle {
                    path: vec![*single, *single],
                    closing_edge: (*single, *single),
                }),
                [_] | [] => None,
                _ => self.cycle_in_component(&component),
            })
            .collect();
        cycles.sort_by(|a, b| a.path.first().cmp(&b.path.first()));
        cycles
    }

    pub fn is_acyclic(&self) -> bool {
        tarjan_scc(&self.graph).into_iter().all(|component| match component.as_slice() {
            [single] => !self.graph.contains_edge(*single, *single),
            _ => false,
        })
    }

    /// Check whether adding `additions` (in order) keeps the graph acyclic.
    ///
    /// On rejection the returned cycle's `closing_edge` is the first addition
    /// that closes a cycle, and `path` starts at that edge's target:
    /// `to -> ... -> from -> to`. If the graph already contained a cycle
    /// before any addition, that cycle is reported instead.
    pub fn check_additions(&self, additions: &[(N, N)]) -> Result<(), Cycle<N>> {
        let mut trial = self.clone();
        for &(from, to) in additions {
            trial.graph.add_edge(from, to, ());
        }
        if trial.is_acyclic() {
            return Ok(());
        }

        if let Some(existing) = self.find_cycles().into_iter().next() {
            return Err(existing);
        }

        let mut staged = self.clone();
        for &(from, to) in additions {
            if from == to {
                return Err(Cycle {
                    path: vec![from, to],
                    closing_edge: (from, to),
                });
            }
            if let Some(mut path) = staged.path(to, from) {
                path.push(to);
                return Err(Cycle {
                    path,
                    closing_edge: (from, to),
                });
            }
            staged.graph.add_edge(from, to, ());
        }

        // Unreachable in practice: the trial graph was cyclic, so some
        // addition must have closed a cycle above.
        match trial.find_cycles().into_iter().next() {
            Some(cycle) => Err(cycle),
            None => Ok(()),
        }
    }

    /// Shortest path `from -> ... -> to` following edge direction.
    pub fn path(&self, from: N, to: N) -> Option<Vec<N>> {
        if !self.graph.contains_node(from) || !self.graph.contains_node(to) {
            return None;
        }
        if from == to {
            return Some(vec![from]);
        }

        let mut previous: HashMap<N, N> = HashMap::new();
        let mut seen: HashSet<N> = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);

        while let Some(current) = queue.pop_front() {
            for next in self.graph.neighbors(current) {
                if !seen.insert(next) {
                    continue;
                }
                previous.insert(next, current);
                if next == to {
                    return Some(unwind(&previous, from, to));
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Find a closed walk inside a strongly connected component, starting and
    /// ending at its smallest member.
    fn cycle_in_component(&self, component: &[N]) -> Option<Cycle<N>> {
        let members: HashSet<N> = component.iter().copied().collect();
        let start = *component.iter().min()?;

        let mut previous: HashMap<N, N> = HashMap::new();
        let mut seen: HashSet<N> = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);

        while let Some(current) = queue.pop_front() {
            for next in self.graph.neighbors(current) {
                if !members.contains(&next) {
                    continue;
                }
                if next == start {
                    let mut path = unwind(&previous, start, current);
                    path.push(start);
                    return Some(Cycle {
                        path,
                        closing_edge: (current, start),
                    });
                }
                if seen.insert(next) {
                    previous.insert(next, current);
                    queue.push_back(next);
                }
            }
        }
        None
    }
}

fn unwind<N: NodeTrait>(previous: &HashMap<N, N>, from: N, to: N) -> Vec<N> {
    let mut path = vec![to];
    let mut cursor = to;
    while cursor != from {
        match previous.get(&cursor) {
            Some(&prior) => {
                path.push(prior);
                cursor = prior;
            }
            None => break,
        }
    }
    path.reverse();
    path
}
