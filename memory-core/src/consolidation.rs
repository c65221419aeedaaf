//! Consolidation: on-demand or cron pipeline over a single
//! partition. Every write here goes through `A.patch` with `updated_at=now`.

use std::collections::HashSet;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::error::Result;
use crate::schema::MemoryCell;
use crate::vector_store::VectorStore;

const CONTRADICTION_LOW: f32 = 0.70;
const CONTRADICTION_HIGH: f32 = 0.92;
const NEAR_DUP_THRESHOLD: f32 = 0.92;
const PROMOTE_ACCESS_COUNT: u32 = 10;
const DEMOTE_IMPORTANCE: f32 = 0.3;
const DEMOTE_STALE_DAYS: i64 = 30;

pub struct ConsolidationReport {
    pub contradictions_flagged: usize,
    pub merges: usize,
    pub promotions: usize,
    pub demotions: usize,
}

/// A cell plus the vector it was scrolled with — consolidation needs the
/// embedding to compute pairwise similarity.
pub struct ScrolledCell {
    pub cell: MemoryCell,
    pub vector: Vec<f32>,
}

fn has_negation_mismatch(a: &str, b: &str) -> bool {
    const TOKENS: &[&str] = &["not", "no", "never", "without", "cannot", "can't"];
    let contains = |text: &str| {
        let lower = text.to_lowercase();
        TOKENS.iter().any(|tok| lower.split_whitespace().any(|w| w.trim_matches(|c: char| !c.is_alphanumeric()) == *tok))
    };
    contains(a) != contains(b)
}

fn last_activity(cell: &MemoryCell) -> chrono::DateTime<Utc> {
    cell.access_times.last().copied().unwrap_or(cell.created_at)
}

/// Run one consolidation pass over a single scroll batch. Merge decisions
/// and contradiction flags never span batch boundaries — each call is a
/// single-batch pairwise comparison.
pub async fn run(store: &dyn VectorStore, collection: &str, batch: Vec<ScrolledCell>) -> Result<ConsolidationReport> {
    let mut report = ConsolidationReport { contradictions_flagged: 0, merges: 0, promotions: 0, demotions: 0 };
    let mut consumed: HashSet<Uuid> = HashSet::new();
    let now = Utc::now();

    // 1. contradictions + 2. near-dup merge, single pairwise pass.
    for i in 0..batch.len() {
        if consumed.contains(&batch[i].cell.id) {
            continue;
        }
        for j in (i + 1)..batch.len() {
            if consumed.contains(&batch[j].cell.id) {
                continue;
            }
            let similarity = cosine_similarity(&batch[i].vector, &batch[j].vector);
            let (a, b) = (&batch[i].cell, &batch[j].cell);

            if (CONTRADICTION_LOW..CONTRADICTION_HIGH).contains(&similarity) && has_negation_mismatch(&a.content, &b.content) {
                let (lower_confidence, other) = if a.confidence <= b.confidence { (a, b) } else { (b, a) };
                let patch = serde_json::json!({
                    "metadata": {"has_contradiction": true, "contradiction_with": other.id},
                    "updated_at": now,
                });
                if let Err(err) = store.patch(collection, lower_confidence.id, patch).await {
                    warn!(cell_id = %lower_confidence.id, error = %err, "failed flagging contradiction");
                } else {
                    report.contradictions_flagged += 1;
                }
                continue;
            }

            if similarity >= NEAR_DUP_THRESHOLD {
                let (keeper, loser) = if a.access_count >= b.access_count { (a, b) } else { (b, a) };
                let mut linked: HashSet<Uuid> = keeper.linked_memories.iter().copied().collect();
                linked.extend(loser.linked_memories.iter().copied());
                let patch = serde_json::json!({
                    "access_count": keeper.access_count + loser.access_count,
                    "linked_memories": linked.into_iter().collect::<Vec<_>>(),
                    "metadata": {"merged_from": loser.id},
                    "updated_at": now,
                });
                if let Err(err) = store.patch(collection, keeper.id, patch).await {
                    warn!(cell_id = %keeper.id, error = %err, "failed merging near-duplicate");
                } else if let Err(err) = store.soft_delete(collection, loser.id).await {
                    warn!(cell_id = %loser.id, error = %err, "failed soft-deleting merge loser");
                } else {
                    report.merges += 1;
                }
                consumed.insert(loser.id);
            }
        }
    }

    // 3. promote popular, 4. demote stale.
    for entry in &batch {
        let cell = &entry.cell;
        if consumed.contains(&cell.id) || cell.is_pinned() {
            continue;
        }

        if cell.access_count > PROMOTE_ACCESS_COUNT {
            let patch = serde_json::json!({
                "memory_type": "core",
                "metadata": {"promoted": true, "promotion_reason": "access_count_exceeded_threshold"},
                "updated_at": now,
            });
            if store.patch(collection, cell.id, patch).await.is_ok() {
                report.promotions += 1;
            }
            continue;
        }

        let stale_days = (now - last_activity(cell)).num_days();
        if cell.importance < DEMOTE_IMPORTANCE && stale_days >= DEMOTE_STALE_DAYS {
            let patch = serde_json::json!({
                "priority": cell.priority / 2.0,
                "metadata": {"demoted": true, "demotion_reason": "stale_low_importance", "previous_priority": cell.priority},
                "updated_at": now,
            });
            if store.patch(collection, cell.id, patch).await.is_ok() {
                report.demotions += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negation_mismatch_detected() {
        assert!(has_negation_mismatch("the build is broken", "the build is not broken"));
        assert!(!has_negation_mismatch("the build is broken", "the build is also broken"));
    }

    #[test]
    fn last_activity_falls_back_to_created_at_when_never_accessed() {
        let cell = MemoryCell::new("x".into(), "a".into());
        assert_eq!(last_activity(&cell), cell.created_at);
    }
}
