use std::collections::{BTreeSet, HashSet};

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;

use crate::engine::PluginId;

/// Plugin-level adjacency derived from port connections. Parallel
/// connections between the same two plugins collapse into one edge.
pub fn adjacency<I>(edges: I) -> DiGraphMap<PluginId, ()>
where
    I: IntoIterator<Item = (PluginId, PluginId)>,
{
    let mut graph = DiGraphMap::new();
    for (from, to) in edges {
        graph.add_edge(from, to, ());
    }
    graph
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub members: BTreeSet<PluginId>,
    pub back_edges: Vec<(PluginId, PluginId)>,
}

impl CycleReport {
    pub fn has_cycles(&self) -> bool {
        !self.back_edges.is_empty()
    }
}

struct Frame {
    node: PluginId,
    neighbors: Vec<PluginId>,
    next: usize,
}

impl Frame {
    fn new(graph: &DiGraphMap<PluginId, ()>, node: PluginId) -> Self {
        let mut neighbors: Vec<PluginId> = graph.neighbors(node).collect();
        neighbors.sort_unstable();
        Self {
            node,
            neighbors,
            next: 0,
        }
    }
}

/// Depth-first search with an explicit stack; an edge back to a node still on
/// the stack is reported as a back edge. Roots and neighbours are visited in
/// ascending id order so the report is deterministic. Members are every node
/// of a strongly connected component that contains a cycle, so nodes of
/// overlapping loops reached through a finished branch are included.
pub fn detect_cycles(graph: &DiGraphMap<PluginId, ()>) -> CycleReport {
    let mut report = CycleReport::default();
    let mut visited: HashSet<PluginId> = HashSet::new();
    let mut roots: Vec<PluginId> = graph.nodes().collect();
    roots.sort_unstable();

    for root in roots {
        if !visited.insert(root) {
            continue;
        }
        let mut on_stack: HashSet<PluginId> = HashSet::from([root]);
        let mut stack = vec![Frame::new(graph, root)];

        while let Some(frame) = stack.last_mut() {
            let node = frame.node;
            let Some(&next) = frame.neighbors.get(frame.next) else {
                on_stack.remove(&node);
                stack.pop();
                continue;
            };
            frame.next += 1;

            if on_stack.contains(&next) {
                report.back_edges.push((node, next));
            } else if visited.insert(next) {
                on_stack.insert(next);
                stack.push(Frame::new(graph, next));
            }
        }
    }

    for component in tarjan_scc(graph) {
        if component.len() > 1 || graph.contains_edge(component[0], component[0]) {
            report.members.extend(component);
        }
    }
    report
}
