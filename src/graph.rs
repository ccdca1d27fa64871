//! Workflow node graph: dependency edges over spec nodes, the cycle
//! tolerant topological order used at materialisation time, and the level
//! assignment the DAG layout builds on.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::crd::WorkflowTaskNode;

/// Build a dependency graph from the spec nodes.
///
/// Returns a tuple of (graph, ``local_name_to_node_index_map``). Edges run
/// from a dependency to its dependent; references to unknown local names
/// are ignored.
pub fn build_graph(
    nodes: &[WorkflowTaskNode],
) -> (DiGraph<String, ()>, HashMap<String, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut indices = HashMap::new();

    for node in nodes {
        let idx = graph.add_node(node.local_name.clone());
        indices.insert(node.local_name.clone(), idx);
    }

    for node in nodes {
        let Some(&dst) = indices.get(&node.local_name) else {
            continue;
        };
        for dep in &node.dependencies {
            if let Some(&src) = indices.get(dep) {
                graph.add_edge(src, dst, ());
            }
        }
    }

    (graph, indices)
}

/// Topological order of spec node positions, dependencies first.
///
/// Cycle tolerant by construction: a node already on the visiting stack is
/// skipped rather than aborting the sort, preserving best-effort progress
/// for the acyclic remainder.
pub fn materialisation_order(nodes: &[WorkflowTaskNode]) -> Vec<usize> {
    let (graph, indices) = build_graph(nodes);
    let position: HashMap<NodeIndex, usize> = nodes
        .iter()
        .enumerate()
        .filter_map(|(i, n)| indices.get(&n.local_name).map(|idx| (*idx, i)))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    let mut visited = vec![false; graph.node_count()];
    let mut visiting = vec![false; graph.node_count()];

    fn visit(
        graph: &DiGraph<String, ()>,
        idx: NodeIndex,
        visited: &mut [bool],
        visiting: &mut [bool],
        out: &mut Vec<NodeIndex>,
    ) {
        if visited[idx.index()] || visiting[idx.index()] {
            return;
        }
        visiting[idx.index()] = true;
        let mut deps: Vec<NodeIndex> = graph.neighbors_directed(idx, Direction::Incoming).collect();
        // neighbors_directed iterates in reverse insertion order.
        deps.reverse();
        for dep in deps {
            visit(graph, dep, visited, visiting, out);
        }
        visiting[idx.index()] = false;
        visited[idx.index()] = true;
        out.push(idx);
    }

    let mut sorted = Vec::with_capacity(nodes.len());
    for node in nodes {
        if let Some(&idx) = indices.get(&node.local_name) {
            visit(&graph, idx, &mut visited, &mut visiting, &mut sorted);
        }
    }

    for idx in sorted {
        if let Some(&pos) = position.get(&idx) {
            order.push(pos);
        }
    }
    order
}

/// Depth of each node: 0 without dependencies, otherwise one past the
/// deepest dependency. Nodes on a cycle settle at the depth reached when
/// the walk first re-encounters them.
pub fn node_levels(nodes: &[WorkflowTaskNode]) -> HashMap<String, usize> {
    let by_name: HashMap<&str, &WorkflowTaskNode> = nodes
        .iter()
        .map(|n| (n.local_name.as_str(), n))
        .collect();
    let mut levels: HashMap<String, usize> = HashMap::new();

    fn level_of(
        name: &str,
        by_name: &HashMap<&str, &WorkflowTaskNode>,
        levels: &mut HashMap<String, usize>,
        visiting: &mut Vec<String>,
    ) -> usize {
        if let Some(&level) = levels.get(name) {
            return level;
        }
        if visiting.iter().any(|v| v == name) {
            return 0;
        }
        let Some(node) = by_name.get(name) else {
            return 0;
        };
        visiting.push(name.to_string());
        let level = node
            .dependencies
            .iter()
            .map(|dep| level_of(dep, by_name, levels, visiting) + 1)
            .max()
            .unwrap_or(0);
        visiting.pop();
        levels.insert(name.to_string(), level);
        level
    }

    for node in nodes {
        let mut visiting = Vec::new();
        level_of(&node.local_name, &by_name, &mut levels, &mut visiting);
    }
    levels
}
