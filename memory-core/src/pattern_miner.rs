//! Pattern miner: clustering, TF-IDF, recurring-error grouping,
//! and graph co-occurrence over a scroll of live cells, synthesized into
//! `Pattern` cells persisted in the private partition.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::error::Result;
use crate::graph::GraphStore;
use crate::keyword_index::tokenize;
use crate::schema::{Domain, MemoryCell, MemoryType, Pattern, PatternKind};
use crate::vector_store::{Filters, VectorStore};

const SCROLL_LIMIT: usize = 20_000;
const CLUSTER_BATCH: usize = 500;
const CLUSTER_THRESHOLD: f32 = 0.75;
const MIN_CLUSTER_MEMBERS: usize = 3;
const RECURRING_ERROR_THRESHOLD: f32 = 0.7;
const MIN_RECURRING_ERROR_MEMBERS: usize = 2;
const MIN_COOCCURRENCE_MEMORIES: usize = 3;
const TOP_DF_RATIO: f32 = 0.80;
const MIN_DF: usize = 2;
const TOP_TERMS_PER_DOC: usize = 10;
const TOP_TERMS_CORPUS: usize = 25;

static STOPWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "the", "a", "an", "and", "or", "but", "is", "are", "was", "were", "be", "been", "being",
        "to", "of", "in", "on", "at", "for", "with", "by", "from", "as", "that", "this", "it",
        "its", "i", "you", "we", "they", "he", "she", "not", "no", "do", "does", "did", "has",
        "have", "had", "will", "would", "can", "could", "should", "so", "if", "then", "there",
    ]
    .into_iter()
    .collect()
});

static ERROR_KEYWORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(error|exception|panic|crash|fail(ed|ure)?|bug|traceback|stack ?trace)\b").unwrap());

pub struct MemoryCluster {
    pub centroid_text: String,
    pub dominant_type: MemoryType,
    pub dominant_domain: Domain,
    pub average_similarity: f32,
    pub member_ids: Vec<Uuid>,
}

pub struct TfIdfReport {
    pub corpus_top_terms: Vec<(String, f32)>,
    pub per_doc_top_terms: HashMap<Uuid, Vec<String>>,
}

pub struct MiningReport {
    pub clusters: Vec<MemoryCluster>,
    pub tfidf: TfIdfReport,
    pub recurring_errors: usize,
    pub cooccurrences: usize,
    pub patterns_persisted: usize,
}

fn deterministic_pattern_id(kind: &str, key: &str) -> Uuid {
    let digest = Sha256::digest(format!("{kind}:{key}").as_bytes());
    let hex = format!("{digest:x}");
    let hex32 = &hex[..32];
    Uuid::parse_str(&format!(
        "{}-{}-{}-{}-{}",
        &hex32[0..8],
        &hex32[8..12],
        &hex32[12..16],
        &hex32[16..20],
        &hex32[20..32],
    ))
    .expect("32 hex chars always format into a UUID")
}

fn mode<T: Copy + Eq + std::hash::Hash>(values: impl Iterator<Item = T>, default: T) -> T {
    let mut counts: HashMap<T, usize> = HashMap::new();
    for v in values {
        *counts.entry(v).or_insert(0) += 1;
    }
    counts.into_iter().max_by_key(|(_, count)| *count).map(|(v, _)| v).unwrap_or(default)
}

/// Agglomerative single-linkage clustering at `CLUSTER_THRESHOLD`, run per
/// batch of `CLUSTER_BATCH` to bound the pairwise comparison to O(batch²).
fn cluster_batch(batch: &[(MemoryCell, Vec<f32>)]) -> Vec<MemoryCluster> {
    let n = batch.len();
    let mut assigned = vec![false; n];
    let mut clusters = Vec::new();

    for i in 0..n {
        if assigned[i] {
            continue;
        }
        let mut members = vec![i];
        assigned[i] = true;
        // single-linkage: grow the group while any unassigned item is
        // similar enough to any member already in it.
        loop {
            let mut grew = false;
            for j in 0..n {
                if assigned[j] {
                    continue;
                }
                let close_to_group = members.iter().any(|&m| cosine_similarity(&batch[m].1, &batch[j].1) >= CLUSTER_THRESHOLD);
                if close_to_group {
                    members.push(j);
                    assigned[j] = true;
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }

        if members.len() < MIN_CLUSTER_MEMBERS {
            continue;
        }

        let mut pair_count = 0u32;
        let mut pair_sum = 0.0f32;
        for a in 0..members.len() {
            for b in (a + 1)..members.len() {
                pair_sum += cosine_similarity(&batch[members[a]].1, &batch[members[b]].1);
                pair_count += 1;
            }
        }
        let average_similarity = if pair_count > 0 { pair_sum / pair_count as f32 } else { 1.0 };

        // centroid = mean vector; keeper = member closest to it.
        let dim = batch[members[0]].1.len();
        let mut centroid = vec![0.0f32; dim];
        for &m in &members {
            for (acc, v) in centroid.iter_mut().zip(batch[m].1.iter()) {
                *acc += v;
            }
        }
        for v in centroid.iter_mut() {
            *v /= members.len() as f32;
        }
        let closest = members
            .iter()
            .max_by(|&&a, &&b| {
                cosine_similarity(&batch[a].1, &centroid)
                    .partial_cmp(&cosine_similarity(&batch[b].1, &centroid))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied()
            .unwrap_or(members[0]);

        clusters.push(MemoryCluster {
            centroid_text: batch[closest].0.content.clone(),
            dominant_type: mode(members.iter().map(|&m| batch[m].0.memory_type), MemoryType::Semantic),
            dominant_domain: mode(members.iter().map(|&m| batch[m].0.domain), Domain::General),
            average_similarity,
            member_ids: members.iter().map(|&m| batch[m].0.id).collect(),
        });
    }

    clusters
}

fn tfidf(cells: &[MemoryCell]) -> TfIdfReport {
    let mut df: HashMap<String, usize> = HashMap::new();
    let mut doc_terms: HashMap<Uuid, HashMap<String, u32>> = HashMap::new();

    for cell in cells {
        let tokens: Vec<String> = tokenize(&cell.content).into_iter().filter(|t| !STOPWORDS.contains(t.as_str())).collect();
        let mut tf: HashMap<String, u32> = HashMap::new();
        for tok in &tokens {
            *tf.entry(tok.clone()).or_insert(0) += 1;
        }
        for term in tf.keys() {
            *df.entry(term.clone()).or_insert(0) += 1;
        }
        doc_terms.insert(cell.id, tf);
    }

    let n = cells.len().max(1);
    let keep = |term: &str| {
        let d = *df.get(term).unwrap_or(&0);
        d >= MIN_DF && (d as f32 / n as f32) <= TOP_DF_RATIO
    };

    let mut per_doc_top_terms: HashMap<Uuid, Vec<String>> = HashMap::new();
    let mut corpus_scores: HashMap<String, f32> = HashMap::new();

    for cell in cells {
        let Some(tf) = doc_terms.get(&cell.id) else { continue };
        let mut scored: Vec<(String, f32)> = tf
            .iter()
            .filter(|(term, _)| keep(term))
            .map(|(term, &count)| {
                let d = df[term] as f32;
                let idf = (n as f32 / d).ln();
                let score = count as f32 * idf;
                *corpus_scores.entry(term.clone()).or_insert(0.0) += score;
                (term.clone(), score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(TOP_TERMS_PER_DOC);
        per_doc_top_terms.insert(cell.id, scored.into_iter().map(|(t, _)| t).collect());
    }

    let mut corpus_top_terms: Vec<(String, f32)> = corpus_scores.into_iter().collect();
    corpus_top_terms.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    corpus_top_terms.truncate(TOP_TERMS_CORPUS);

    TfIdfReport { corpus_top_terms, per_doc_top_terms }
}

/// Greedy grouping of error-like cells at `RECURRING_ERROR_THRESHOLD`: each
/// unassigned cell seeds a group, absorbing every remaining cell within
/// threshold of the seed (not single-linkage, unlike cluster_batch).
fn recurring_error_groups(cells: &[(MemoryCell, Vec<f32>)]) -> Vec<Vec<usize>> {
    let candidates: Vec<usize> = cells
        .iter()
        .enumerate()
        .filter(|(_, (cell, _))| {
            matches!(cell.domain, Domain::Technical | Domain::General) && ERROR_KEYWORD_RE.is_match(&cell.content)
        })
        .map(|(i, _)| i)
        .collect();

    let mut assigned = HashSet::new();
    let mut groups = Vec::new();
    for &seed in &candidates {
        if assigned.contains(&seed) {
            continue;
        }
        let mut group = vec![seed];
        assigned.insert(seed);
        for &other in &candidates {
            if assigned.contains(&other) {
                continue;
            }
            if cosine_similarity(&cells[seed].1, &cells[other].1) >= RECURRING_ERROR_THRESHOLD {
                group.push(other);
                assigned.insert(other);
            }
        }
        if group.len() >= MIN_RECURRING_ERROR_MEMBERS {
            groups.push(group);
        }
    }
    groups
}

pub async fn run(store: &dyn VectorStore, graph: Option<&dyn GraphStore>, collection: &str) -> Result<MiningReport> {
    let mut all_cells: Vec<(MemoryCell, Vec<f32>)> = Vec::new();
    let mut offset = None;
    loop {
        if all_cells.len() >= SCROLL_LIMIT {
            break;
        }
        let page = store.scroll(collection, CLUSTER_BATCH, offset.clone(), &Filters::new()).await?;
        if page.points.is_empty() {
            break;
        }
        for point in page.points {
            let Some(vector) = point.vector else { continue };
            if let Ok(cell) = serde_json::from_value::<MemoryCell>(point.payload) {
                all_cells.push((cell, vector));
            }
        }
        offset = page.next_offset;
        if offset.is_none() {
            break;
        }
    }
    all_cells.truncate(SCROLL_LIMIT);

    let mut clusters = Vec::new();
    for batch in all_cells.chunks(CLUSTER_BATCH) {
        clusters.extend(cluster_batch(batch));
    }

    let cells_only: Vec<MemoryCell> = all_cells.iter().map(|(c, _)| c.clone()).collect();
    let tfidf_report = tfidf(&cells_only);

    let mut recurring_error_count = 0;
    for batch in all_cells.chunks(CLUSTER_BATCH) {
        recurring_error_count += recurring_error_groups(batch).len();
    }

    let mut cooccurrences = 0;
    let mut patterns: Vec<Pattern> = Vec::new();
    let now = chrono::Utc::now();

    for cluster in &clusters {
        let key = cluster.member_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",");
        patterns.push(Pattern {
            id: deterministic_pattern_id("cluster", &key),
            kind: PatternKind::Cluster,
            description: format!("cluster of {} memories around: {}", cluster.member_ids.len(), cluster.centroid_text),
            confidence: cluster.average_similarity,
            occurrences: cluster.member_ids.len() as u32,
            evidence_ids: cluster.member_ids.clone(),
            first_seen: now,
            last_seen: now,
            tags: vec![format!("{:?}", cluster.dominant_domain).to_lowercase()],
            metadata: HashMap::from([("source".to_string(), serde_json::json!("pattern_mining"))]),
        });
    }

    for batch in all_cells.chunks(CLUSTER_BATCH) {
        for group in recurring_error_groups(batch) {
            let ids: Vec<Uuid> = group.iter().map(|&i| batch[i].0.id).collect();
            let key = ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",");
            patterns.push(Pattern {
                id: deterministic_pattern_id("recurring_error", &key),
                kind: PatternKind::RecurringError,
                description: format!("recurring error across {} memories", ids.len()),
                confidence: 0.8,
                occurrences: ids.len() as u32,
                evidence_ids: ids,
                first_seen: now,
                last_seen: now,
                tags: vec!["recurring_error".to_string()],
                metadata: HashMap::from([("source".to_string(), serde_json::json!("pattern_mining"))]),
            });
        }
    }

    if let Some(graph) = graph {
        let mut entity_candidates: HashSet<String> = HashSet::new();
        for cell in &cells_only {
            entity_candidates.extend(crate::classify::extract_entities(&cell.content));
        }
        let entity_list: Vec<String> = entity_candidates.into_iter().collect();
        for i in 0..entity_list.len() {
            for j in (i + 1)..entity_list.len() {
                let (a, b) = (&entity_list[i], &entity_list[j]);
                match shared_memory_count(graph, a, b).await {
                    Ok(shared) if shared >= MIN_COOCCURRENCE_MEMORIES => {
                        cooccurrences += 1;
                        let key = format!("{a}|{b}");
                        patterns.push(Pattern {
                            id: deterministic_pattern_id("cooccurrence", &key),
                            kind: PatternKind::CoOccurrence,
                            description: format!("{a} and {b} co-occur across {shared} memories"),
                            confidence: (shared as f32 / 10.0).min(1.0),
                            occurrences: shared as u32,
                            evidence_ids: Vec::new(),
                            first_seen: now,
                            last_seen: now,
                            tags: vec![a.clone(), b.clone()],
                            metadata: HashMap::from([("source".to_string(), serde_json::json!("pattern_mining"))]),
                        });
                    }
                    Ok(_) => {}
                    Err(err) => warn!(a = %a, b = %b, error = %err, "co-occurrence lookup failed, skipping pair"),
                }
            }
        }
    }

    let patterns_persisted = patterns.len();
    for pattern in &patterns {
        let payload = serde_json::json!({
            "content": pattern.description,
            "pattern_kind": pattern.kind,
            "confidence": pattern.confidence,
            "occurrences": pattern.occurrences,
            "evidence_ids": pattern.evidence_ids,
            "first_seen": pattern.first_seen,
            "last_seen": pattern.last_seen,
            "tags": pattern.tags,
            "scope": "pattern",
            "memory_type": "semantic",
            "classification": "private",
            "metadata": pattern.metadata,
            "deleted": false,
            "updated_at": now,
        });
        let zero_vector = vec![0.0f32; all_cells.first().map(|(_, v)| v.len()).unwrap_or(8)];
        if let Err(err) = store.upsert(collection, pattern.id, &zero_vector, payload).await {
            warn!(pattern_id = %pattern.id, error = %err, "failed persisting mined pattern");
        }
    }

    Ok(MiningReport {
        clusters,
        tfidf: tfidf_report,
        recurring_errors: recurring_error_count,
        cooccurrences,
        patterns_persisted,
    })
}

async fn shared_memory_count(graph: &dyn GraphStore, a: &str, b: &str) -> Result<usize> {
    let neighbors_a: HashSet<String> = graph.neighbors(a, 200).await?.into_iter().map(|n| n.name).collect();
    let neighbors_b: HashSet<String> = graph.neighbors(b, 200).await?.into_iter().map(|n| n.name).collect();
    Ok(neighbors_a.intersection(&neighbors_b).count())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell_with_vector(content: &str, vector: Vec<f32>) -> (MemoryCell, Vec<f32>) {
        (MemoryCell::new(content.into(), "a".into()), vector)
    }

    #[test]
    fn cluster_batch_groups_similar_vectors() {
        let batch = vec![
            cell_with_vector("deploy step one", vec![1.0, 0.0]),
            cell_with_vector("deploy step two", vec![0.99, 0.01]),
            cell_with_vector("deploy step three", vec![0.98, 0.02]),
            cell_with_vector("unrelated cake recipe", vec![0.0, 1.0]),
        ];
        let clusters = cluster_batch(&batch);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].member_ids.len(), 3);
    }

    #[test]
    fn tfidf_drops_terms_outside_df_bounds() {
        let cells = vec![
            MemoryCell::new("rust ownership rules".into(), "a".into()),
            MemoryCell::new("rust borrowing rules".into(), "a".into()),
        ];
        let report = tfidf(&cells);
        // "rules" appears in every doc (df/n = 1.0 > 0.80) and should be dropped.
        assert!(!report.corpus_top_terms.iter().any(|(t, _)| t == "rules"));
    }

    #[test]
    fn recurring_error_groups_requires_min_members() {
        let batch = vec![cell_with_vector("panic: index out of bounds", vec![1.0, 0.0])];
        assert!(recurring_error_groups(&batch).is_empty());
    }

    #[test]
    fn deterministic_pattern_id_is_stable() {
        assert_eq!(deterministic_pattern_id("cluster", "a,b"), deterministic_pattern_id("cluster", "a,b"));
        assert_ne!(deterministic_pattern_id("cluster", "a,b"), deterministic_pattern_id("cluster", "a,c"));
    }
}
