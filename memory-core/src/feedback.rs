//! Feedback loop: adjusts recalled cells from a user's reaction
//! to the last returned result list. Never re-embeds — every adjustment is
//! a metadata/scalar patch via `A.patch`.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::schema::MemoryCell;
use crate::vector_store::VectorStore;

const REFERENCE_IMPORTANCE_BOOST: f32 = 0.05;
const UNREFERENCED_STALE_PENALTY: f32 = -0.02;
const UNREFERENCED_STALE_HIT_FLOOR: u32 = 5;
const UNREFERENCED_STALE_RATIO_CEIL: f32 = 0.2;
const POSITIVE_IMPORTANCE_DELTA: f32 = 0.1;
const NEGATIVE_CONFIDENCE_DELTA: f32 = -0.1;
const PROMOTE_USEFULNESS_RATIO: f32 = 0.7;
const PROMOTE_MIN_HITS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

static POSITIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(thanks|thank you|perfect|exactly|great|helpful|yes,? that'?s (it|right|correct)|nailed it|works?)\b").unwrap()
});
static NEGATIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(wrong|incorrect|no,? that'?s not|not (right|helpful|what i meant)|useless|doesn'?t (work|help))\b").unwrap()
});

pub fn detect_sentiment(response: &str) -> Sentiment {
    let negative = NEGATIVE_RE.is_match(response);
    let positive = POSITIVE_RE.is_match(response);
    match (positive, negative) {
        (true, false) => Sentiment::Positive,
        (false, true) => Sentiment::Negative,
        _ => Sentiment::Neutral,
    }
}

fn shingles(text: &str, size: usize) -> HashSet<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() < size {
        return HashSet::new();
    }
    words.windows(size).map(|w| w.join(" ").to_lowercase()).collect()
}

fn long_tokens(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| w.len() > 4 || w.chars().next().is_some_and(|c| c.is_uppercase()))
        .map(|w| w.to_lowercase())
        .collect()
}

/// A memory is referenced iff any 3-word shingle from its text appears in
/// the response, or ≥2 of its proper-noun/long-token terms appear.
pub fn is_referenced(cell_text: &str, response: &str) -> bool {
    let response_lower = response.to_lowercase();
    let cell_shingles = shingles(cell_text, 3);
    if cell_shingles.iter().any(|s| response_lower.contains(s.as_str())) {
        return true;
    }
    let response_tokens = long_tokens(response);
    let cell_tokens = long_tokens(cell_text);
    cell_tokens.intersection(&response_tokens).count() >= 2
}

pub struct FeedbackOutcome {
    pub cell_id: Uuid,
    pub promoted_to_core: bool,
}

/// Apply one feedback pass over `recalled` against `response`. Returns one
/// outcome per recalled cell that was patched.
pub async fn apply(
    store: &dyn VectorStore,
    collection: &str,
    recalled: &[MemoryCell],
    response: &str,
) -> Result<Vec<FeedbackOutcome>> {
    let sentiment = detect_sentiment(response);
    let mut outcomes = Vec::new();

    for cell in recalled {
        let referenced = is_referenced(&cell.content, response);
        let hit = cell.metadata.get("hit_count").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let useful = cell.metadata.get("useful_count").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let reference_hits = cell.metadata.get("reference_count").and_then(|v| v.as_u64()).unwrap_or(0) as u32;

        let mut importance_delta = 0.0f32;
        let mut confidence_delta = 0.0f32;
        let mut new_useful = useful;
        let mut needs_review = cell.metadata.get("needs_review").and_then(|v| v.as_bool()).unwrap_or(false);
        let mut new_reference_hits = reference_hits;

        if referenced {
            importance_delta += REFERENCE_IMPORTANCE_BOOST;
            new_reference_hits += 1;
        } else {
            let reference_ratio = if hit > 0 { reference_hits as f32 / hit as f32 } else { 0.0 };
            if hit >= UNREFERENCED_STALE_HIT_FLOOR && reference_ratio < UNREFERENCED_STALE_RATIO_CEIL {
                importance_delta += UNREFERENCED_STALE_PENALTY;
            }
        }

        match sentiment {
            Sentiment::Neutral => {}
            Sentiment::Positive => {
                importance_delta += POSITIVE_IMPORTANCE_DELTA;
                new_useful += 1;
                needs_review = false;
            }
            Sentiment::Negative => {
                confidence_delta += NEGATIVE_CONFIDENCE_DELTA;
                needs_review = true;
            }
        }

        let new_hit = hit + 1;
        let usefulness_ratio = if new_hit > 0 { new_useful as f32 / new_hit as f32 } else { 0.0 };
        let promote = usefulness_ratio > PROMOTE_USEFULNESS_RATIO && new_hit >= PROMOTE_MIN_HITS && !cell.is_pinned();

        let mut metadata_patch = serde_json::json!({
            "hit_count": new_hit,
            "useful_count": new_useful,
            "reference_count": new_reference_hits,
            "needs_review": needs_review,
        });
        if promote {
            metadata_patch["promoted"] = serde_json::json!(true);
            metadata_patch["promotion_reason"] = serde_json::json!("usefulness_ratio_exceeded_threshold");
        }

        let mut patch = serde_json::json!({
            "importance": (cell.importance + importance_delta).clamp(0.0, 1.0),
            "confidence": (cell.confidence + confidence_delta).clamp(0.1, 1.0),
            "metadata": metadata_patch,
            "updated_at": chrono::Utc::now(),
        });
        if promote {
            patch["memory_type"] = serde_json::json!("core");
        }

        if let Err(err) = store.patch(collection, cell.id, patch).await {
            warn!(cell_id = %cell.id, error = %err, "failed applying feedback patch");
            continue;
        }

        outcomes.push(FeedbackOutcome { cell_id: cell.id, promoted_to_core: promote });
    }

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_positive_sentiment() {
        assert_eq!(detect_sentiment("thanks, that's exactly right"), Sentiment::Positive);
    }

    #[test]
    fn detects_negative_sentiment() {
        assert_eq!(detect_sentiment("no that's wrong"), Sentiment::Negative);
    }

    #[test]
    fn neutral_when_no_signal_present() {
        assert_eq!(detect_sentiment("ok let's move on"), Sentiment::Neutral);
    }

    #[test]
    fn shingle_match_marks_memory_referenced() {
        assert!(is_referenced("deploy the service with a rolling restart", "I used the rolling restart approach and it worked"));
    }

    #[test]
    fn unrelated_text_is_not_referenced() {
        assert!(!is_referenced("deploy the service with a rolling restart", "what's your favorite color"));
    }
}
