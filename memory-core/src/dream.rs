//! Dream compactor: long-running budget-bounded background
//! compaction. A single run walks the phase chain `dedup → merge → prune →
//! strengthen → (optional mine)`, aborting on budget exceeded but keeping
//! whatever phases already completed.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::error::Result;
use crate::graph::GraphStore;
use crate::pattern_miner::{self, MiningReport};
use crate::schema::{MemoryCell, MemoryType};
use crate::vector_store::{Filters, VectorStore};

const DEFAULT_BUDGET: Duration = Duration::from_secs(5 * 60);
const MIN_RUN_GAP_HOURS: i64 = 12;
const AGGRESSIVE_DEDUP_THRESHOLD: f32 = 0.88;
const EPISODIC_MERGE_THRESHOLD: f32 = 0.80;
const PRUNE_ACTIVATION: f32 = -4.0;
const PRUNE_IMPORTANCE: f32 = 0.2;
const STRENGTHEN_ACCESS_COUNT: u32 = 5;
const STRENGTHEN_USEFULNESS_RATIO: f32 = 0.5;
const MINING_BUDGET_FLOOR: Duration = Duration::from_secs(60);
const SCROLL_BATCH: usize = 500;

pub struct DreamReport {
    pub deduped: usize,
    pub episodic_merged: usize,
    pub pruned: usize,
    pub strengthened: usize,
    pub mining: Option<MiningReport>,
    pub aborted_on_budget: bool,
}

/// Deterministic marker id for an agent's dream cycle, used by [`should_run`]
/// to enforce the 12h gate without a separate scheduling store.
pub fn marker_id(agent_id: &str) -> Uuid {
    crate::shared_block::deterministic_id(&format!("dream-meta-{agent_id}"))
}

/// Zero vector with a tiny perturbation so the marker cell does not collide
/// with a genuine all-zero embedding from the embedding service.
fn marker_vector(dim: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dim];
    if let Some(first) = v.first_mut() {
        *first = 1e-6;
    }
    v
}

pub async fn should_run(store: &dyn VectorStore, collection: &str, agent_id: &str) -> Result<bool> {
    let id = marker_id(agent_id);
    let Some(payload) = store.get(collection, id).await? else {
        return Ok(true);
    };
    let Some(last_run) = payload.get("last_run").and_then(|v| v.as_str()).and_then(|s| s.parse::<chrono::DateTime<Utc>>().ok())
    else {
        return Ok(true);
    };
    Ok((Utc::now() - last_run).num_hours() >= MIN_RUN_GAP_HOURS)
}

async fn record_run(store: &dyn VectorStore, collection: &str, agent_id: &str, embedding_dim: usize) -> Result<()> {
    let id = marker_id(agent_id);
    let payload = serde_json::json!({
        "content": format!("dream-meta-{agent_id}"),
        "agent_id": agent_id,
        "memory_type": "core",
        "classification": "private",
        "scope": "private",
        "last_run": Utc::now(),
        "deleted": false,
        "updated_at": Utc::now(),
    });
    store.upsert(collection, id, &marker_vector(embedding_dim), payload).await
}

/// One dream cycle over `collection`, budget-bounded. `embedding_dim` sizes
/// the marker's placeholder vector to whatever the embedder produces.
#[instrument(skip(store, graph), fields(collection))]
pub async fn run(
    store: &dyn VectorStore,
    graph: Option<&dyn GraphStore>,
    collection: &str,
    agent_id: &str,
    embedding_dim: usize,
    budget: Option<Duration>,
) -> Result<DreamReport> {
    let budget = budget.unwrap_or(DEFAULT_BUDGET);
    let started = Instant::now();
    let mut report = DreamReport {
        deduped: 0,
        episodic_merged: 0,
        pruned: 0,
        strengthened: 0,
        mining: None,
        aborted_on_budget: false,
    };

    macro_rules! budget_exceeded {
        () => {
            started.elapsed() >= budget
        };
    }

    // 1. aggressive dedup, ≥0.88, batch scroll.
    let mut offset = None;
    let mut consumed: HashSet<Uuid> = HashSet::new();
    loop {
        if budget_exceeded!() {
            report.aborted_on_budget = true;
            return finish(report, store, collection, agent_id, embedding_dim).await;
        }
        let page = store.scroll(collection, SCROLL_BATCH, offset.clone(), &Filters::new()).await?;
        if page.points.is_empty() {
            break;
        }
        let cells: Vec<(MemoryCell, Option<Vec<f32>>)> = page
            .points
            .iter()
            .filter_map(|p| serde_json::from_value::<MemoryCell>(p.payload.clone()).ok().map(|c| (c, p.vector.clone())))
            .collect();

        for i in 0..cells.len() {
            if consumed.contains(&cells[i].0.id) {
                continue;
            }
            for j in (i + 1)..cells.len() {
                if consumed.contains(&cells[j].0.id) {
                    continue;
                }
                let (Some(va), Some(vb)) = (&cells[i].1, &cells[j].1) else { continue };
                let similarity = cosine_similarity(va, vb);
                if similarity >= AGGRESSIVE_DEDUP_THRESHOLD {
                    if merge_pair(store, collection, &cells[i].0, &cells[j].0).await.is_ok() {
                        consumed.insert(cells[j].0.id);
                        report.deduped += 1;
                    }
                }
            }
        }

        offset = page.next_offset;
        if offset.is_none() {
            break;
        }
    }

    // 2. episodic -> semantic merge, greedy clustering within each batch, ≥0.80.
    if budget_exceeded!() {
        report.aborted_on_budget = true;
        return finish(report, store, collection, agent_id, embedding_dim).await;
    }
    let mut offset = None;
    loop {
        if budget_exceeded!() {
            report.aborted_on_budget = true;
            return finish(report, store, collection, agent_id, embedding_dim).await;
        }
        let page = store.scroll(collection, SCROLL_BATCH, offset.clone(), &Filters::new()).await?;
        if page.points.is_empty() {
            break;
        }
        let episodic: Vec<(MemoryCell, Vec<f32>)> = page
            .points
            .iter()
            .filter_map(|p| {
                serde_json::from_value::<MemoryCell>(p.payload.clone()).ok().and_then(|c| {
                    if c.memory_type == MemoryType::Episodic && !consumed.contains(&c.id) {
                        p.vector.clone().map(|v| (c, v))
                    } else {
                        None
                    }
                })
            })
            .collect();

        let mut clustered: HashSet<Uuid> = HashSet::new();
        for i in 0..episodic.len() {
            if clustered.contains(&episodic[i].0.id) {
                continue;
            }
            let mut group = vec![i];
            for j in (i + 1)..episodic.len() {
                if clustered.contains(&episodic[j].0.id) {
                    continue;
                }
                if cosine_similarity(&episodic[i].1, &episodic[j].1) >= EPISODIC_MERGE_THRESHOLD {
                    group.push(j);
                }
            }
            if group.len() < 2 {
                continue;
            }
            group.sort_by_key(|&idx| std::cmp::Reverse(episodic[idx].0.access_count));
            let keeper_idx = group[0];
            let keeper = &episodic[keeper_idx].0;
            let mut access_times = keeper.access_times.clone();
            let mut linked: HashSet<Uuid> = keeper.linked_memories.iter().copied().collect();
            let mut max_importance = keeper.importance;
            for &idx in &group[1..] {
                let loser = &episodic[idx].0;
                access_times.extend(loser.access_times.iter().copied());
                linked.extend(loser.linked_memories.iter().copied());
                max_importance = max_importance.max(loser.importance);
                if store.soft_delete(collection, loser.id).await.is_ok() {
                    clustered.insert(loser.id);
                    consumed.insert(loser.id);
                }
            }
            access_times.sort();
            let patch = serde_json::json!({
                "memory_type": "semantic",
                "access_times": access_times,
                "linked_memories": linked.into_iter().collect::<Vec<_>>(),
                "importance": max_importance,
                "updated_at": Utc::now(),
            });
            if store.patch(collection, keeper.id, patch).await.is_ok() {
                clustered.insert(keeper.id);
                report.episodic_merged += group.len() - 1;
            }
        }

        offset = page.next_offset;
        if offset.is_none() {
            break;
        }
    }

    // 3. prune: activation < -4 and importance < 0.2, non-pinned.
    if budget_exceeded!() {
        report.aborted_on_budget = true;
        return finish(report, store, collection, agent_id, embedding_dim).await;
    }
    let mut offset = None;
    let now = Utc::now();
    loop {
        if budget_exceeded!() {
            report.aborted_on_budget = true;
            return finish(report, store, collection, agent_id, embedding_dim).await;
        }
        let page = store.scroll(collection, SCROLL_BATCH, offset.clone(), &Filters::new()).await?;
        if page.points.is_empty() {
            break;
        }
        for point in &page.points {
            let Ok(cell) = serde_json::from_value::<MemoryCell>(point.payload.clone()) else { continue };
            if consumed.contains(&cell.id) || cell.is_pinned() {
                continue;
            }
            let a = crate::decay::activation(&cell, now);
            if a < PRUNE_ACTIVATION && cell.importance < PRUNE_IMPORTANCE {
                let patch = serde_json::json!({
                    "deleted": true,
                    "metadata": {"prune_reason": "activation_and_importance_below_floor"},
                    "updated_at": now,
                });
                if store.patch(collection, cell.id, patch).await.is_ok() {
                    report.pruned += 1;
                }
            }
        }
        offset = page.next_offset;
        if offset.is_none() {
            break;
        }
    }

    // 4. strengthen.
    if budget_exceeded!() {
        report.aborted_on_budget = true;
        return finish(report, store, collection, agent_id, embedding_dim).await;
    }
    let mut offset = None;
    loop {
        if budget_exceeded!() {
            report.aborted_on_budget = true;
            return finish(report, store, collection, agent_id, embedding_dim).await;
        }
        let page = store.scroll(collection, SCROLL_BATCH, offset.clone(), &Filters::new()).await?;
        if page.points.is_empty() {
            break;
        }
        for point in &page.points {
            let Ok(cell) = serde_json::from_value::<MemoryCell>(point.payload.clone()) else { continue };
            if consumed.contains(&cell.id) {
                continue;
            }
            let useful_count = cell.metadata.get("useful_count").and_then(|v| v.as_u64()).unwrap_or(0);
            let usefulness_ratio = if cell.access_count > 0 { useful_count as f32 / cell.access_count as f32 } else { 0.0 };

            let mut patch = serde_json::Map::new();
            if cell.access_count > STRENGTHEN_ACCESS_COUNT {
                patch.insert("importance".into(), serde_json::json!((cell.importance + 0.1).min(1.0)));
            }
            if usefulness_ratio > STRENGTHEN_USEFULNESS_RATIO {
                patch.insert("confidence".into(), serde_json::json!((cell.confidence + 0.05).min(1.0)));
            }
            if !patch.is_empty() {
                patch.insert("updated_at".into(), serde_json::json!(now));
                if store.patch(collection, cell.id, serde_json::Value::Object(patch)).await.is_ok() {
                    report.strengthened += 1;
                }
            }
        }
        offset = page.next_offset;
        if offset.is_none() {
            break;
        }
    }

    // 5. optional mining if remaining budget > 60s.
    if budget.saturating_sub(started.elapsed()) > MINING_BUDGET_FLOOR {
        match pattern_miner::run(store, graph, collection).await {
            Ok(mining) => report.mining = Some(mining),
            Err(err) => warn!(error = %err, "pattern mining failed during dream cycle, continuing"),
        }
    }

    finish(report, store, collection, agent_id, embedding_dim).await
}

async fn finish(
    report: DreamReport,
    store: &dyn VectorStore,
    collection: &str,
    agent_id: &str,
    embedding_dim: usize,
) -> Result<DreamReport> {
    if let Err(err) = record_run(store, collection, agent_id, embedding_dim).await {
        warn!(error = %err, "failed recording dream marker cell");
    }
    info!(
        deduped = report.deduped,
        episodic_merged = report.episodic_merged,
        pruned = report.pruned,
        strengthened = report.strengthened,
        aborted_on_budget = report.aborted_on_budget,
        "dream cycle complete"
    );
    Ok(report)
}

async fn merge_pair(store: &dyn VectorStore, collection: &str, a: &MemoryCell, b: &MemoryCell) -> Result<()> {
    let (keeper, loser) = if a.access_count >= b.access_count { (a, b) } else { (b, a) };
    let mut linked: HashSet<Uuid> = keeper.linked_memories.iter().copied().collect();
    linked.extend(loser.linked_memories.iter().copied());
    let patch = serde_json::json!({
        "access_count": keeper.access_count + loser.access_count,
        "linked_memories": linked.into_iter().collect::<Vec<_>>(),
        "metadata": {"merged_from": loser.id},
        "updated_at": Utc::now(),
    });
    store.patch(collection, keeper.id, patch).await?;
    store.soft_delete(collection, loser.id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_id_is_deterministic_per_agent() {
        assert_eq!(marker_id("agent-1"), marker_id("agent-1"));
        assert_ne!(marker_id("agent-1"), marker_id("agent-2"));
    }

    #[test]
    fn marker_vector_is_not_exactly_zero() {
        let v = marker_vector(8);
        assert!(v.iter().any(|&x| x != 0.0));
    }
}
