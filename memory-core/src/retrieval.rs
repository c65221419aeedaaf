//! Retrieval orchestrator: the 9-step read path tying together
//! the cache, embedding client, keyword index, vector store, graph
//! activation, decay model, intent router, and ranker.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::{Duration, timeout};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::activation::{ActivationParams, spread_activate};
use crate::cache::{LayeredCache, cache_key};
use crate::decay::{self, DecayStatus};
use crate::embedding::Embedder;
use crate::error::Result;
use crate::graph::GraphStore;
use crate::intent::{self, SortMode};
use crate::keyword_index::{KeywordIndex, reciprocal_rank_fusion};
use crate::preferences;
use crate::ranker::{DiversityCandidate, RankContext, RankInput, diversity_rerank, score};
use crate::schema::{MemoryCell, UserModel};
use crate::vector_store::{Filters, VectorStore};

const OVERSAMPLE_FACTOR: usize = 3;
const DIVERSITY_MULTIPLIER: usize = 2;
const DEFAULT_DEADLINE: Duration = Duration::from_secs(8);

pub struct RetrievalQuery {
    pub text: String,
    pub limit: usize,
    pub min_score: Option<f32>,
    pub agent_id: String,
    /// When set, the caller's running preference model (per (user, agent))
    /// is consulted for the ranker's preference-boost additive term.
    pub user_id: Option<String>,
}

pub struct RetrievalResult {
    pub cell: MemoryCell,
    pub score: f32,
}

const RECENT_TOPICS_CAP: usize = 20;
const TOPIC_MATCH_MIN_SHARED_WORDS: usize = 2;

/// A small rolling window of recent query texts, consulted by the ranker's
/// "recent-topic match" boost. Owned by the engine so it survives across
/// calls; bounded so it never grows unbounded over a long-lived session.
pub struct RecentTopics {
    window: Mutex<VecDeque<String>>,
}

impl RecentTopics {
    pub fn new() -> Self {
        Self { window: Mutex::new(VecDeque::with_capacity(RECENT_TOPICS_CAP)) }
    }

    /// Record `query_text` as a new topic and return a snapshot of the
    /// window as it stood *before* this call, so a query never counts as a
    /// "recent topic" match against itself.
    fn record_and_snapshot(&self, query_text: &str) -> Vec<String> {
        let mut window = self.window.lock();
        let snapshot: Vec<String> = window.iter().cloned().collect();
        if window.len() >= RECENT_TOPICS_CAP {
            window.pop_front();
        }
        window.push_back(query_text.to_string());
        snapshot
    }
}

impl Default for RecentTopics {
    fn default() -> Self {
        Self::new()
    }
}

fn focus_words(text: &str) -> std::collections::HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .map(|w| w.to_lowercase())
        .collect()
}

/// True if `candidate_text` shares at least two significant words (length >
/// 3) with any topic in `topics`.
fn topic_match(topics: &[String], candidate_text: &str) -> bool {
    let candidate_words = focus_words(candidate_text);
    if candidate_words.is_empty() {
        return false;
    }
    topics.iter().any(|topic| {
        focus_words(topic).iter().filter(|w| candidate_words.contains(*w)).count() >= TOPIC_MATCH_MIN_SHARED_WORDS
    })
}

/// Overlap between the query's salient terms and a candidate's text,
/// scaled into `[0, 0.15]` — the "query-focus-term overlap" boost.
fn query_focus_overlap(query_text: &str, candidate_text: &str) -> f32 {
    let query_words = focus_words(query_text);
    if query_words.is_empty() {
        return 0.0;
    }
    let candidate_words = focus_words(candidate_text);
    let shared = query_words.intersection(&candidate_words).count() as f32;
    (shared / query_words.len() as f32 * 0.15).min(0.15)
}

pub struct RetrievalOrchestrator<'a> {
    pub embedder: &'a dyn Embedder,
    pub vector_store: &'a dyn VectorStore,
    pub keyword_index: &'a KeywordIndex,
    pub cache: &'a LayeredCache,
    pub graph: Option<&'a dyn GraphStore>,
    pub trust_table: HashMap<String, f32>,
    pub hybrid_enabled: bool,
    pub activation_params: ActivationParams,
    pub recent_topics: &'a RecentTopics,
    /// The caller's running preference model for `query.user_id`, if the
    /// engine has one on file. Consulted for the ranker's preference-boost
    /// additive term; `None` when there's no `user_id` or no model yet.
    pub preference_model: Option<UserModel>,
}

impl<'a> RetrievalOrchestrator<'a> {
    #[instrument(skip(self, query), fields(agent_id = %query.agent_id))]
    pub async fn retrieve(&self, collection: &str, query: RetrievalQuery) -> Result<Vec<RetrievalResult>> {
        match timeout(DEFAULT_DEADLINE, self.retrieve_inner(collection, query)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("retrieval deadline exceeded, dropping pending work without writeback");
                Ok(Vec::new())
            }
        }
    }

    async fn retrieve_inner(&self, collection: &str, query: RetrievalQuery) -> Result<Vec<RetrievalResult>> {
        // Boundary behavior: an empty (or whitespace-only) query returns
        // empty without ever reaching the embedder.
        if query.text.trim().is_empty() {
            return Ok(Vec::new());
        }

        // 1. cache lookup. Recent topics are recorded unconditionally (not
        // only on hit) so the very first occurrence of a topic is available
        // to boost later queries in the same session.
        let key = cache_key(&query.text, query.limit, query.min_score);
        let prior_topics = self.recent_topics.record_and_snapshot(&query.text);
        if let Some(cached) = self.cache.get(&key).await {
            if let Ok(cells) = serde_json::from_str::<Vec<MemoryCell>>(&cached) {
                return Ok(cells
                    .into_iter()
                    .map(|cell| RetrievalResult { score: 1.0, cell })
                    .collect());
            }
        }

        // 2. embed + route intent
        let query_vector = self.embedder.embed(&query.text).await?;
        let routed = intent::route(&query.text);
        let strategy = routed.strategy;
        let effective_limit = query.limit.min(strategy.result_cap);
        let oversample = effective_limit * OVERSAMPLE_FACTOR;

        // 3. hybrid or vector-only search
        let vector_hits = self
            .vector_store
            .search(collection, &query_vector, oversample, None, &Filters::new())
            .await?;
        let vector_ranked: Vec<Uuid> = vector_hits.iter().map(|p| p.id).collect();

        let fused_ids: Vec<Uuid> = if self.hybrid_enabled && !self.keyword_index.is_empty() {
            let bm25_ranked: Vec<Uuid> =
                self.keyword_index.search(&query.text, oversample).into_iter().map(|(id, _)| id).collect();
            reciprocal_rank_fusion(&vector_ranked, &bm25_ranked).into_iter().map(|(id, _)| id).collect()
        } else {
            vector_ranked.clone()
        };

        let mut by_id: HashMap<Uuid, (MemoryCell, f32)> = HashMap::new();
        for point in &vector_hits {
            if let Ok(cell) = serde_json::from_value::<MemoryCell>(point.payload.clone()) {
                by_id.insert(point.id, (cell, point.score));
            }
        }

        // 4. decay status, drop archived
        let now = Utc::now();
        let mut candidates: Vec<(MemoryCell, f32)> = Vec::new();
        for id in &fused_ids {
            let Some((cell, semantic_score)) = by_id.remove(id) else { continue };
            let a = decay::activation(&cell, now);
            if decay::status(a) == DecayStatus::Archive {
                continue;
            }
            candidates.push((cell, semantic_score));
        }

        // 5. multi-signal rerank + floor + diversity
        let ctx = RankContext {
            intent: routed.intent,
            weights: strategy.weights,
            boost_types: &strategy.boost_types,
            penalize_types: &strategy.penalize_types,
            trust_table: &self.trust_table,
        };

        let mut ranked: Vec<(MemoryCell, f32)> = candidates
            .into_iter()
            .map(|(cell, semantic_score)| {
                let input = RankInput {
                    id: cell.id,
                    text: &cell.content,
                    memory_type: cell.memory_type,
                    semantic_score,
                    importance: cell.importance,
                    confidence: cell.confidence,
                    access_count: cell.access_count,
                    hours_since_access: cell.hours_since_last_access(now),
                    hours_since_creation: cell.hours_since_creation(now),
                    graph_activation: None,
                    agent_id: &cell.agent_id,
                    sparse_metadata: is_sparse(&cell),
                    recent_topic_match: topic_match(&prior_topics, &cell.content),
                    query_focus_overlap: query_focus_overlap(&query.text, &cell.content),
                    preference_boost: self
                        .preference_model
                        .as_ref()
                        .map(|model| preferences::preference_boost(model, &cell.content))
                        .unwrap_or(0.0),
                };
                let rank_score = score(&input, &ctx);
                (cell, rank_score)
            })
            .filter(|(_, rank_score)| *rank_score >= strategy.min_score)
            .collect();

        match strategy.sort_mode {
            SortMode::Relevance => ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)),
            SortMode::Recency => ranked.sort_by(|a, b| b.0.updated_at.cmp(&a.0.updated_at)),
            SortMode::Importance => {
                ranked.sort_by(|a, b| b.0.importance.partial_cmp(&a.0.importance).unwrap_or(std::cmp::Ordering::Equal))
            }
        }

        let diversity_input: Vec<DiversityCandidate> = ranked
            .iter()
            .map(|(cell, rank_score)| DiversityCandidate {
                id: cell.id,
                text: &cell.content,
                memory_type: cell.memory_type,
                score: *rank_score,
            })
            .collect();
        let diversified = diversity_rerank(diversity_input, effective_limit * DIVERSITY_MULTIPLIER);
        let diversified_scores: HashMap<Uuid, f32> = diversified.into_iter().map(|r| (r.id, r.score)).collect();
        let mut final_cells: Vec<(MemoryCell, f32)> = ranked
            .into_iter()
            .filter(|(cell, _)| diversified_scores.contains_key(&cell.id))
            .map(|(cell, _)| {
                let rank_score = diversified_scores[&cell.id];
                (cell, rank_score)
            })
            .collect();
        final_cells.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        // 6. optional graph pseudo-results
        if let Some(graph) = self.graph {
            if let Ok(activated) = spread_activate(graph, &query.text, self.activation_params, effective_limit).await {
                let existing_ids: std::collections::HashSet<Uuid> = final_cells.iter().map(|(c, _)| c.id).collect();
                for hit in activated {
                    if !existing_ids.contains(&hit.memory_id) {
                        if let Ok(Some(payload)) = self.vector_store.get(collection, hit.memory_id).await {
                            if let Ok(cell) = serde_json::from_value::<MemoryCell>(payload) {
                                final_cells.push((cell, hit.activation * 0.7));
                            }
                        }
                    }
                }
                final_cells.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            }
        }

        final_cells.truncate(effective_limit);

        // 7. best-effort access-time bump
        for (cell, _) in &final_cells {
            let patch = serde_json::json!({
                "access_times": [now],
                "access_count": cell.access_count + 1,
            });
            if let Err(err) = self.vector_store.patch(collection, cell.id, patch).await {
                warn!(cell_id = %cell.id, error = %err, "best-effort access-time patch failed");
            }
        }

        // 8. cache store
        let cells_only: Vec<&MemoryCell> = final_cells.iter().map(|(c, _)| c).collect();
        if let Ok(serialized) = serde_json::to_string(&cells_only) {
            self.cache.put(&key, serialized).await;
        }

        Ok(final_cells.into_iter().map(|(cell, score)| RetrievalResult { cell, score }).collect())
    }
}

/// ≥4 of {importance, urgency, domain, access list, confidence} left at
/// engine defaults triggers sparse-metadata scoring.
fn is_sparse(cell: &MemoryCell) -> bool {
    use crate::schema::{ConfidenceTag, Domain, Urgency};
    let mut defaulted = 0;
    if (cell.importance - 0.5).abs() < f32::EPSILON {
        defaulted += 1;
    }
    if cell.urgency == Urgency::Reference {
        defaulted += 1;
    }
    if cell.domain == Domain::Knowledge {
        defaulted += 1;
    }
    if cell.access_times.is_empty() {
        defaulted += 1;
    }
    if (cell.confidence - 0.5).abs() < f32::EPSILON && cell.confidence_tag == ConfidenceTag::Inferred {
        defaulted += 1;
    }
    defaulted >= 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cell_is_sparse() {
        let cell = MemoryCell::new("x".into(), "a".into());
        assert!(is_sparse(&cell));
    }

    #[test]
    fn cell_with_explicit_metadata_is_not_sparse() {
        use crate::schema::{ConfidenceTag, Domain, Urgency};
        let mut cell = MemoryCell::new("x".into(), "a".into());
        cell.importance = 0.9;
        cell.urgency = Urgency::Critical;
        cell.domain = Domain::Technical;
        cell.confidence_tag = ConfidenceTag::Verified;
        cell.record_access(Utc::now());
        assert!(!is_sparse(&cell));
    }

    #[test]
    fn query_focus_overlap_rewards_shared_terms() {
        let overlap = query_focus_overlap("server outage restart", "the server outage was resolved");
        assert!(overlap > 0.0 && overlap <= 0.15);
        assert_eq!(query_focus_overlap("server outage", "completely unrelated text"), 0.0);
    }

    #[test]
    fn recent_topics_does_not_match_against_itself() {
        let tracker = RecentTopics::new();
        let prior = tracker.record_and_snapshot("database connection pool exhausted");
        assert!(!topic_match(&prior, "database connection pool exhausted"));
    }

    #[test]
    fn recent_topics_matches_a_prior_query() {
        let tracker = RecentTopics::new();
        let _ = tracker.record_and_snapshot("database connection pool exhausted");
        let prior = tracker.record_and_snapshot("what is the weather today");
        assert!(topic_match(&prior, "the connection pool was exhausted again"));
    }
}
