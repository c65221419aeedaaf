//! Dedup & merge.
//!
//! Pure decision logic over an incoming cell and its closest existing
//! neighbor. Callers (component N, the store orchestrator) are responsible
//! for finding the neighbor via content-hash lookup or vector search and for
//! issuing the resulting soft-delete/upsert calls.

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::schema::MemoryCell;

const DUPLICATE_THRESHOLD: f32 = 0.92;
const CONFLICT_LOW: f32 = 0.70;

const NEGATION_TOKENS: &[&str] = &["not", "no", "never", "without", "cannot", "can't", "doesn't", "isn't"];

/// SHA-256 of trimmed, lowercased text — the exact-dedup key.
pub fn content_hash(text: &str) -> String {
    let normalized = text.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    format!("{digest:x}")
}

fn contains_negation(text: &str) -> bool {
    let lower = text.to_lowercase();
    NEGATION_TOKENS.iter().any(|tok| {
        lower
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .any(|word| word == *tok)
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum DedupOutcome {
    /// No existing cell is close enough to act on; store as new.
    New,
    /// Exact or near-exact duplicate of `existing_id`, same type: merge onto
    /// a fresh cell carrying the union of state, then soft-delete the old.
    Merge { existing_id: Uuid, merged: MergedCell },
    /// Exact or near-exact duplicate of `existing_id`, different type: tell
    /// the caller "duplicate" and store nothing.
    DuplicateDifferentType { existing_id: Uuid },
    /// Similarity in the conflict band and a negation mismatch between the
    /// two texts.
    Conflict { existing_id: Uuid, reason: String },
}

/// The fields a semantic merge folds forward onto the new cell.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedCell {
    pub importance: f32,
    pub access_count: u32,
    pub linked_memories: Vec<Uuid>,
    pub merged_from: Uuid,
    pub old_text_preview: String,
}

const PREVIEW_CHARS: usize = 120;

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

/// Decide what to do with `incoming` given the closest `existing` cell and
/// its embedding similarity to the incoming cell's embedding.
pub fn evaluate(incoming: &MemoryCell, existing: &MemoryCell, similarity: f32) -> DedupOutcome {
    if similarity >= DUPLICATE_THRESHOLD {
        if existing.memory_type == incoming.memory_type {
            let mut linked: HashSet<Uuid> = existing.linked_memories.iter().copied().collect();
            linked.insert(existing.id);
            DedupOutcome::Merge {
                existing_id: existing.id,
                merged: MergedCell {
                    importance: existing.importance.max(incoming.importance),
                    access_count: existing.access_count,
                    linked_memories: linked.into_iter().collect(),
                    merged_from: existing.id,
                    old_text_preview: preview(&existing.content),
                },
            }
        } else {
            DedupOutcome::DuplicateDifferentType { existing_id: existing.id }
        }
    } else if (CONFLICT_LOW..DUPLICATE_THRESHOLD).contains(&similarity) {
        let negated_existing = contains_negation(&existing.content);
        let negated_incoming = contains_negation(&incoming.content);
        if negated_existing != negated_incoming {
            DedupOutcome::Conflict {
                existing_id: existing.id,
                reason: format!(
                    "similarity {similarity:.2} with negation mismatch (existing negated={negated_existing}, incoming negated={negated_incoming})"
                ),
            }
        } else {
            DedupOutcome::New
        }
    } else {
        DedupOutcome::New
    }
}

/// Exact-hash shortcut: two cells whose trimmed-lowercased content hashes
/// match are duplicates regardless of embedding similarity (cosine ~1.0
/// would follow anyway, but this avoids a redundant embedding comparison).
pub fn hashes_match(a: &str, b: &str) -> bool {
    content_hash(a) == content_hash(b)
}

/// Re-exported for callers that already have two embeddings in hand and
/// want to skip a separate `Embedder` round trip.
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    cosine_similarity(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::MemoryType;

    fn cell(content: &str) -> MemoryCell {
        MemoryCell::new(content.to_string(), "agent-1".to_string())
    }

    #[test]
    fn content_hash_is_case_and_whitespace_insensitive() {
        assert_eq!(content_hash("  Hello World  "), content_hash("hello world"));
    }

    #[test]
    fn high_similarity_same_type_merges() {
        let existing = cell("the sky is blue");
        let incoming = cell("the sky is blue");
        match evaluate(&incoming, &existing, 0.95) {
            DedupOutcome::Merge { existing_id, .. } => assert_eq!(existing_id, existing.id),
            other => panic!("expected merge, got {other:?}"),
        }
    }

    #[test]
    fn high_similarity_different_type_is_duplicate_without_merge() {
        let mut existing = cell("the sky is blue");
        existing.memory_type = MemoryType::Episodic;
        let mut incoming = cell("the sky is blue");
        incoming.memory_type = MemoryType::Semantic;
        match evaluate(&incoming, &existing, 0.95) {
            DedupOutcome::DuplicateDifferentType { existing_id } => assert_eq!(existing_id, existing.id),
            other => panic!("expected duplicate-different-type, got {other:?}"),
        }
    }

    #[test]
    fn mid_band_negation_mismatch_is_conflict() {
        let existing = cell("the deploy is not safe");
        let incoming = cell("the deploy is safe");
        match evaluate(&incoming, &existing, 0.80) {
            DedupOutcome::Conflict { .. } => {}
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn mid_band_without_negation_mismatch_is_new() {
        let existing = cell("the deploy went fine yesterday");
        let incoming = cell("the deploy went well this morning");
        assert_eq!(evaluate(&incoming, &existing, 0.75), DedupOutcome::New);
    }

    #[test]
    fn low_similarity_is_new() {
        let existing = cell("unrelated text entirely");
        let incoming = cell("completely different content");
        assert_eq!(evaluate(&incoming, &existing, 0.20), DedupOutcome::New);
    }
}
