//! Graph spread activation.
//!
//! BFS outward from query-derived seed entities, decaying activation per
//! hop, then maps activated entities to the memories that mention them.

use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::classify::extract_entities;
use crate::error::Result;
use crate::graph::GraphStore;

#[derive(Debug, Clone, Copy)]
pub struct ActivationParams {
    pub depth: u32,
    pub decay: f32,
    pub fanout: usize,
    pub min_activation: f32,
    pub node_cap: usize,
}

impl Default for ActivationParams {
    fn default() -> Self {
        Self { depth: 2, decay: 0.5, fanout: 10, min_activation: 0.1, node_cap: 30 }
    }
}

pub struct ActivatedMemory {
    pub memory_id: Uuid,
    pub activation: f32,
}

/// Run BFS spread activation seeded from entities extracted out of `query`
/// (same extraction rules as the classifier, 4.C), then resolve to the
/// memories mentioning each activated entity, returning the top `limit` by
/// activation.
pub async fn spread_activate(
    graph: &dyn GraphStore,
    query: &str,
    params: ActivationParams,
    limit: usize,
) -> Result<Vec<ActivatedMemory>> {
    let seeds = extract_entities(query);
    if seeds.is_empty() {
        return Ok(Vec::new());
    }

    let mut activation: HashMap<String, f32> = HashMap::new();
    let mut queue: VecDeque<(String, u32)> = VecDeque::new();
    for seed in &seeds {
        activation.insert(seed.clone(), 1.0);
        queue.push_back((seed.clone(), 0));
    }

    while let Some((name, depth)) = queue.pop_front() {
        if depth >= params.depth || activation.len() >= params.node_cap {
            continue;
        }
        let current_activation = *activation.get(&name).unwrap_or(&0.0);
        let neighbors = graph.neighbors(&name, params.fanout).await.unwrap_or_default();

        for neighbor in neighbors.into_iter().take(params.fanout) {
            if activation.len() >= params.node_cap && !activation.contains_key(&neighbor.name) {
                break;
            }
            let propagated = current_activation * params.decay;
            if propagated < params.min_activation {
                continue;
            }
            // A revisited node keeps max(old, new) activation but is never
            // re-enqueued — only a genuinely new node continues the BFS.
            let previously_seen = activation.contains_key(&neighbor.name);
            let slot = activation.entry(neighbor.name.clone()).or_insert(0.0);
            *slot = slot.max(propagated);
            if !previously_seen {
                queue.push_back((neighbor.name, depth + 1));
            }
        }
    }

    let mut memory_activation: HashMap<Uuid, f32> = HashMap::new();
    for (entity, entity_activation) in &activation {
        let mentions = graph.neighbors(entity, params.fanout).await.unwrap_or_default();
        for node in mentions {
            if let Ok(memory_id) = Uuid::parse_str(&node.name) {
                let slot = memory_activation.entry(memory_id).or_insert(0.0);
                *slot = slot.max(*entity_activation);
            }
        }
    }

    let mut ranked: Vec<ActivatedMemory> = memory_activation
        .into_iter()
        .map(|(memory_id, activation)| ActivatedMemory { memory_id, activation })
        .collect();
    ranked.sort_by(|a, b| b.activation.partial_cmp(&a.activation).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(limit);
    Ok(ranked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_match_documented_defaults() {
        let params = ActivationParams::default();
        assert_eq!(params.depth, 2);
        assert_eq!(params.fanout, 10);
        assert_eq!(params.node_cap, 30);
        assert!((params.decay - 0.5).abs() < 1e-6);
        assert!((params.min_activation - 0.1).abs() < 1e-6);
    }
}
