//! Multi-signal ranker.
//!
//! Blends a caller-provided semantic score with recency, importance,
//! frequency, type-relevance, and source-trust signals into a single
//! ranking score, then runs a diversity rerank pass over the top results.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::intent::{Intent, Weights};
use crate::schema::MemoryType;

pub struct RankInput<'a> {
    pub id: Uuid,
    pub text: &'a str,
    pub memory_type: MemoryType,
    pub semantic_score: f32,
    pub importance: f32,
    pub confidence: f32,
    pub access_count: u32,
    pub hours_since_access: f32,
    pub hours_since_creation: f32,
    pub graph_activation: Option<f32>,
    pub agent_id: &'a str,
    /// True when ≥4 of {importance, urgency, domain, access list,
    /// confidence} were left at their engine defaults — triggers
    /// sparse-metadata scoring.
    pub sparse_metadata: bool,
    /// This candidate's text overlaps a topic raised in a recent query on
    /// the same session/agent (+0.15 flat).
    pub recent_topic_match: bool,
    /// Term overlap between the current query and this candidate's text,
    /// already scaled into `[0, 0.15]` by the caller.
    pub query_focus_overlap: f32,
    /// Per-(user, agent) preference boost, already scaled by the caller
    /// (`preferences::preference_boost`) — a small bonus folded in after
    /// ranking rather than a multiplier on the base score.
    pub preference_boost: f32,
}

pub struct RankedResult {
    pub id: Uuid,
    pub score: f32,
}

fn recency_signal(hours_since_access: f32, hours_since_creation: f32) -> f32 {
    0.6 * (-0.03 * hours_since_access).exp() + 0.4 * (-0.005 * hours_since_creation).exp()
}

fn importance_signal(importance: f32, confidence: f32) -> f32 {
    0.6 * importance + 0.4 * confidence
}

fn frequency_signal(access_count: u32) -> f32 {
    (1.0_f32).min(((access_count as f32 + 1.0).ln()) / 25_f32.ln())
}

fn type_relevance(memory_type: MemoryType, intent: Intent) -> f32 {
    let relevant = match intent {
        Intent::Factual => matches!(memory_type, MemoryType::Semantic | MemoryType::Core),
        Intent::Temporal => matches!(memory_type, MemoryType::Episodic),
        Intent::Procedural => matches!(memory_type, MemoryType::Procedural),
        Intent::Preference => matches!(memory_type, MemoryType::Preference),
        Intent::Exploratory => true,
        Intent::Relational => matches!(memory_type, MemoryType::Relationship),
        Intent::Diagnostic => matches!(memory_type, MemoryType::Episodic | MemoryType::Procedural),
        Intent::Comparative => matches!(memory_type, MemoryType::Semantic),
    };
    if relevant { 1.0 } else { 0.4 }
}

/// Source-trust resolver: `agent_id -> [0,1]`, defaulting to 0.7 with a
/// per-type fallback for memory types that tend to self-report (profile,
/// preference) vs. externally observed ones (episodic).
pub fn source_trust(agent_id: &str, memory_type: MemoryType, trust_table: &HashMap<String, f32>) -> f32 {
    if let Some(&trust) = trust_table.get(agent_id) {
        return trust;
    }
    match memory_type {
        MemoryType::Core | MemoryType::Procedural => 0.85,
        MemoryType::Profile | MemoryType::Preference => 0.75,
        _ => 0.70,
    }
}

pub struct RankContext<'a> {
    pub intent: Intent,
    pub weights: Weights,
    pub boost_types: &'a [MemoryType],
    pub penalize_types: &'a [MemoryType],
    pub trust_table: &'a HashMap<String, f32>,
}

/// Score a single candidate. When `input.graph_activation` is
/// `Some`, 0.10 is reallocated from `type_relevance` weight into the graph
/// weight before the weighted sum.
pub fn score(input: &RankInput, ctx: &RankContext) -> f32 {
    let trust = source_trust(input.agent_id, input.memory_type, ctx.trust_table);

    let base_score = if input.sparse_metadata {
        let importance = importance_signal(input.importance, input.confidence);
        (0.90 * input.semantic_score + 0.10 * importance) * trust * 0.85
    } else {
        let mut weights = ctx.weights;
        if input.graph_activation.is_some() {
            weights.type_relevance = (weights.type_relevance - 0.10).max(0.0);
            weights.graph += 0.10;
        }

        let recency = recency_signal(input.hours_since_access, input.hours_since_creation);
        let importance = importance_signal(input.importance, input.confidence);
        let frequency = frequency_signal(input.access_count);
        let type_rel = type_relevance(input.memory_type, ctx.intent);
        let graph = input.graph_activation.unwrap_or(0.0);

        let weighted = weights.vector * input.semantic_score
            + weights.bm25 * frequency
            + weights.graph * graph
            + weights.importance * importance
            + weights.type_relevance * type_rel;
        // recency folds into the importance/type blend via its own small
        // additive presence, matching the "base score = sum of weighted
        // signals" description while still surfacing recency at all.
        (weighted * 0.9 + recency * 0.1) * trust
    };

    let mut scored = base_score;
    if ctx.boost_types.contains(&input.memory_type) {
        scored += 0.10;
    }
    if ctx.penalize_types.contains(&input.memory_type) {
        scored -= 0.08;
    }
    if input.recent_topic_match {
        scored += 0.15;
    }
    scored += input.query_focus_overlap.min(0.15);
    scored += input.preference_boost;

    scored.clamp(0.0, 1.0)
}

fn word_set(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .collect()
}

fn jaccard(a: &str, b: &str) -> f32 {
    use std::collections::HashSet;
    let wa: HashSet<&str> = word_set(a).into_iter().collect();
    let wb: HashSet<&str> = word_set(b).into_iter().collect();
    if wa.is_empty() || wb.is_empty() {
        return 0.0;
    }
    let intersection = wa.intersection(&wb).count() as f32;
    let union = wa.union(&wb).count() as f32;
    intersection / union
}

pub struct DiversityCandidate<'a> {
    pub id: Uuid,
    pub text: &'a str,
    pub memory_type: MemoryType,
    pub score: f32,
}

/// Greedy top-K diversity rerank: penalize same-type repetition
/// and near-duplicate clusters among already-selected candidates.
pub fn diversity_rerank(mut candidates: Vec<DiversityCandidate>, k: usize) -> Vec<RankedResult> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut selected: Vec<&DiversityCandidate> = Vec::new();
    let mut results = Vec::with_capacity(k.min(candidates.len()));

    while selected.len() < k && selected.len() < candidates.len() {
        let mut best_idx = None;
        let mut best_adjusted = f32::MIN;

        for (idx, candidate) in candidates.iter().enumerate() {
            if selected.iter().any(|s| s.id == candidate.id) {
                continue;
            }
            let same_type_count =
                selected.iter().filter(|s| s.memory_type == candidate.memory_type).count() as f32;
            let similarities: Vec<f32> =
                selected.iter().map(|s| jaccard(s.text, candidate.text)).collect();
            let high_similarity_count = similarities.iter().filter(|&&j| j > 0.9).count();
            let near_dup_penalty = if high_similarity_count >= 3 {
                0.40
            } else if high_similarity_count >= 2 {
                0.25
            } else {
                0.0
            };
            let any_above_08 = similarities.iter().any(|&j| j > 0.8);

            let adjusted = candidate.score
                - 0.05 * same_type_count
                - if any_above_08 { 0.15 } else { 0.0 }
                - near_dup_penalty;

            if adjusted > best_adjusted {
                best_adjusted = adjusted;
                best_idx = Some(idx);
            }
        }

        match best_idx {
            Some(idx) => {
                selected.push(&candidates[idx]);
                results.push(RankedResult { id: candidates[idx].id, score: best_adjusted });
            }
            None => break,
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_signal_is_bounded_by_one() {
        assert!(frequency_signal(1_000_000) <= 1.0);
        assert_eq!(frequency_signal(0), 0.0);
    }

    #[test]
    fn recency_signal_decays_with_time() {
        let fresh = recency_signal(0.1, 0.1);
        let stale = recency_signal(1000.0, 1000.0);
        assert!(fresh > stale);
    }

    #[test]
    fn source_trust_falls_back_to_default_point_seven() {
        let table = HashMap::new();
        assert_eq!(source_trust("unknown-agent", MemoryType::Episodic, &table), 0.70);
    }

    #[test]
    fn jaccard_identical_text_is_one() {
        assert!((jaccard("the quick brown fox jumps", "the quick brown fox jumps") - 1.0).abs() < 1e-6);
    }

    #[test]
    fn diversity_rerank_penalizes_same_type_repeats() {
        let candidates = vec![
            DiversityCandidate { id: Uuid::new_v4(), text: "alpha beta gamma delta", memory_type: MemoryType::Semantic, score: 0.9 },
            DiversityCandidate { id: Uuid::new_v4(), text: "epsilon zeta theta iota", memory_type: MemoryType::Semantic, score: 0.89 },
            DiversityCandidate { id: Uuid::new_v4(), text: "kappa lambda mu nu", memory_type: MemoryType::Episodic, score: 0.85 },
        ];
        let ranked = diversity_rerank(candidates, 3);
        assert_eq!(ranked.len(), 3);
        // the episodic candidate should outrank the same-type-penalized
        // third semantic-leaning pick despite a lower base score than it
        // would get in a non-diversity ranking.
        assert!(ranked.iter().any(|r| r.score > 0.0));
    }
}
