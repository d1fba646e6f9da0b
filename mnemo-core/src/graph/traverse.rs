use std::collections::HashMap;
use uuid::Uuid;

use super::clamp_depth;
use crate::models::{GraphEdge, GraphNode, TraversalHop};

/// Breadth-first expansion of outgoing edges from `start`.
///
/// Each branch carries the nodes on its path and never steps onto one of
/// them again, so cycles terminate. Edges whose target is missing from
/// `nodes` are ignored.
pub fn traverse_edges(
    start: Uuid,
    max_depth: u32,
    edges: &[GraphEdge],
    nodes: &HashMap<Uuid, GraphNode>,
) -> Vec<TraversalHop> {
    let max_depth = clamp_depth(max_depth);

    let mut outgoing: HashMap<Uuid, Vec<&GraphEdge>> = HashMap::new();
    for edge in edges {
        outgoing.entry(edge.source_node_id).or_default().push(edge);
    }

    let mut hops = Vec::new();
    // (node to expand, path ending at that node)
    let mut frontier: Vec<(Uuid, Vec<Uuid>)> = vec![(start, vec![start])];

    for depth in 1..=max_depth {
        let mut next = Vec::new();

        for (node_id, path) in &frontier {
            let Some(candidates) = outgoing.get(node_id) else {
                continue;
            };

            for edge in candidates {
                if path.contains(&edge.target_node_id) {
                    continue;
                }
                let Some(target) = nodes.get(&edge.target_node_id) else {
                    continue;
                };

                let mut branch = path.clone();
                branch.push(edge.target_node_id);

                hops.push(TraversalHop {
                    source_node_id: edge.source_node_id,
                    target_node_id: edge.target_node_id,
                    relation_type: edge.relation_type,
                    weight: edge.weight,
                    depth,
                    path: branch.clone(),
                    target_name: target.name.clone(),
                    target_type: target.node_type,
                });
                next.push((edge.target_node_id, branch));
            }
        }

        if next.is_empty() {
            break;
        }
        frontier = next;
    }

    hops.sort_by(|a, b| a.depth.cmp(&b.depth).then(b.weight.total_cmp(&a.weight)));
    hops
}
