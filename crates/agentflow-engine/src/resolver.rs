use std::collections::{BTreeSet, HashMap, VecDeque};

use agentflow_core::error::ValidationError;
use agentflow_core::types::{FlowDefinition, NodeKind};

/// Compute a topological execution order for `flow`.
///
/// Kahn's algorithm over node declaration indices: whenever several nodes
/// are ready, the one declared first runs first, so the order is a pure
/// function of the definition. Nodes never freed are reported as a cycle.
pub fn resolve_order(flow: &FlowDefinition) -> Result<Vec<String>, ValidationError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(flow.nodes.len());
    for (i, node) in flow.nodes.iter().enumerate() {
        if index.insert(node.id.as_str(), i).is_some() {
            return Err(ValidationError::DuplicateNode {
                node_id: node.id.clone(),
            });
        }
    }

    let mut in_degree = vec![0usize; flow.nodes.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); flow.nodes.len()];
    for edge in &flow.edges {
        let missing = [&edge.source, &edge.target]
            .into_iter()
            .find(|id| !index.contains_key(id.as_str()));
        if let Some(missing) = missing {
            return Err(ValidationError::DanglingEdge {
                from: edge.source.clone(),
                to: edge.target.clone(),
                missing: missing.clone(),
            });
        }
        let (from, to) = (index[edge.source.as_str()], index[edge.target.as_str()]);
        successors[from].push(to);
        in_degree[to] += 1;
    }

    let mut ready: BTreeSet<usize> = (0..flow.nodes.len()).filter(|i| in_degree[*i] == 0).collect();
    let mut order = Vec::with_capacity(flow.nodes.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &succ in &successors[next] {
            in_degree[succ] -= 1;
            if in_degree[succ] == 0 {
                ready.insert(succ);
            }
        }
    }

    if order.len() < flow.nodes.len() {
        let nodes = (0..flow.nodes.len())
            .filter(|i| in_degree[*i] > 0)
            .map(|i| flow.nodes[i].id.clone())
            .collect();
        return Err(ValidationError::CyclicGraph { nodes });
    }

    Ok(order.into_iter().map(|i| flow.nodes[i].id.clone()).collect())
}

/// Nodes with no path from any Start node, in declaration order.
/// A flow without Start nodes reports nothing.
pub fn unreachable_nodes(flow: &FlowDefinition) -> Vec<String> {
    let starts: Vec<&str> = flow
        .nodes
        .iter()
        .filter(|n| n.kind == NodeKind::Start)
        .map(|n| n.id.as_str())
        .collect();
    if starts.is_empty() {
        return Vec::new();
    }

    let mut seen: BTreeSet<&str> = starts.iter().copied().collect();
    let mut queue: VecDeque<&str> = starts.into_iter().collect();
    while let Some(id) = queue.pop_front() {
        for edge in flow.edges.iter().filter(|e| e.source == id) {
            if seen.insert(edge.target.as_str()) {
                queue.push_back(edge.target.as_str());
            }
        }
    }

    flow.nodes
        .iter()
        .filter(|n| !seen.contains(n.id.as_str()))
        .map(|n| n.id.clone())
        .collect()
}
