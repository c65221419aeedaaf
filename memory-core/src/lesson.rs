//! Lesson extraction & abstraction.
//!
//! Detects corrective feedback in free text and persists it as an ordinary
//! shared cell, plus a separate abstraction pass that distills mined
//! clusters/recurring-errors/co-occurrences into a single lesson each.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::Result;
use crate::pattern_miner::MiningReport;
use crate::schema::LessonType;
use crate::vector_store::VectorStore;

const MIN_CLUSTER_FOR_ABSTRACTION: usize = 3;
const MIN_RECURRING_ERROR_FOR_ABSTRACTION: usize = 2;
const MIN_COOCCURRENCE_FOR_ABSTRACTION: usize = 3;
const DEDUP_KEY_CHARS: usize = 100;

struct LessonPattern {
    lesson_type: LessonType,
    patterns: Vec<Regex>,
}

static LESSON_PATTERNS: LazyLock<Vec<LessonPattern>> = LazyLock::new(|| {
    vec![
        LessonPattern {
            lesson_type: LessonType::Correction,
            patterns: vec![
                Regex::new(r"(?i)\bactually,?\s").unwrap(),
                Regex::new(r"(?i)\bno,?\s+(that'?s|it'?s) (not|wrong|incorrect)\b").unwrap(),
                Regex::new(r"(?i)\bcorrection:").unwrap(),
            ],
        },
        LessonPattern {
            lesson_type: LessonType::Fix,
            patterns: vec![
                Regex::new(r"(?i)\bthe fix (is|was)\b").unwrap(),
                Regex::new(r"(?i)\bto fix this\b").unwrap(),
                Regex::new(r"(?i)\bresolved by\b").unwrap(),
            ],
        },
        LessonPattern {
            lesson_type: LessonType::Gotcha,
            patterns: vec![
                Regex::new(r"(?i)\bwatch out for\b").unwrap(),
                Regex::new(r"(?i)\bgotcha\b").unwrap(),
                Regex::new(r"(?i)\bbe careful (with|about)\b").unwrap(),
            ],
        },
        LessonPattern {
            lesson_type: LessonType::Learned,
            patterns: vec![
                Regex::new(r"(?i)\bi (learned|realized|found out)\b").unwrap(),
                Regex::new(r"(?i)\bturns out\b").unwrap(),
                Regex::new(r"(?i)\bit (turns out|appears) that\b").unwrap(),
            ],
        },
        LessonPattern {
            lesson_type: LessonType::AntiPattern,
            patterns: vec![
                Regex::new(r"(?i)\bnever do\b").unwrap(),
                Regex::new(r"(?i)\bdon'?t (use|do|try)\b").unwrap(),
                Regex::new(r"(?i)\banti-?pattern\b").unwrap(),
            ],
        },
    ]
});

pub struct DetectedLesson {
    pub lesson_type: LessonType,
    pub correction: String,
    pub source_context: String,
}

/// Regex-family lesson detection. Returns the first matching type in
/// declaration order (Correction → Fix → Gotcha → Learned → AntiPattern).
pub fn detect_lesson(text: &str, context: &str) -> Option<DetectedLesson> {
    for family in LESSON_PATTERNS.iter() {
        if family.patterns.iter().any(|re| re.is_match(text)) {
            return Some(DetectedLesson {
                lesson_type: family.lesson_type,
                correction: text.to_string(),
                source_context: context.to_string(),
            });
        }
    }
    None
}

fn dedup_key(text: &str) -> String {
    text.to_lowercase().chars().take(DEDUP_KEY_CHARS).collect()
}

fn lesson_type_label(lesson_type: LessonType) -> &'static str {
    match lesson_type {
        LessonType::Correction => "correction",
        LessonType::Fix => "fix",
        LessonType::Gotcha => "gotcha",
        LessonType::Learned => "learned",
        LessonType::AntiPattern => "anti_pattern",
    }
}

fn deterministic_lesson_id(key: &str) -> Uuid {
    let digest = Sha256::digest(format!("lesson:{key}").as_bytes());
    let hex = format!("{digest:x}");
    let hex32 = &hex[..32];
    Uuid::parse_str(&format!("{}-{}-{}-{}-{}", &hex32[0..8], &hex32[8..12], &hex32[12..16], &hex32[16..20], &hex32[20..32]))
        .expect("32 hex chars always format into a UUID")
}

fn deterministic_abstraction_id(method: &str, key: &str) -> Uuid {
    let digest = Sha256::digest(format!("abstraction:{method}:{key}").as_bytes());
    let hex = format!("{digest:x}");
    let hex32 = &hex[..32];
    Uuid::parse_str(&format!("{}-{}-{}-{}-{}", &hex32[0..8], &hex32[8..12], &hex32[12..16], &hex32[16..20], &hex32[20..32]))
        .expect("32 hex chars always format into a UUID")
}

/// Persist a detected lesson as a shared cell, deduped by the lower-cased
/// first-100-chars key. Returns `None` if a lesson with the same key already
/// exists (caller passes `seen` so a single extraction pass can dedup
/// against itself without a round trip per candidate).
pub async fn persist_lesson(
    store: &dyn VectorStore,
    collection: &str,
    lesson: &DetectedLesson,
    embedding: &[f32],
    seen: &mut HashMap<String, Uuid>,
) -> Result<Option<Uuid>> {
    let key = dedup_key(&lesson.correction);
    if seen.contains_key(&key) {
        return Ok(None);
    }

    let id = deterministic_lesson_id(&key);
    let text = format!("[LESSON:{}] {} (context: {})", lesson_type_label(lesson.lesson_type), lesson.correction, lesson.source_context);
    let payload = serde_json::json!({
        "content": text,
        "memory_type": "semantic",
        "classification": "public",
        "scope": "shared",
        "urgency": "important",
        "importance": 0.8,
        "confidence": 0.7,
        "metadata": {"source": "lesson_extraction", "lesson_type": lesson_type_label(lesson.lesson_type)},
        "deleted": false,
        "updated_at": chrono::Utc::now(),
    });
    store.upsert(collection, id, embedding, payload).await?;
    seen.insert(key, id);
    Ok(Some(id))
}

/// Abstract mined clusters / recurring errors / co-occurrences into a single
/// lesson each, once they clear the qualifying thresholds. `metadata.abstracted`
/// marks the result so repeat runs over the same mining output skip it — the
/// caller is expected to check for an existing point at the deterministic id
/// before calling this (kept a pure function here; I/O is the caller's job).
pub fn abstractions_for(mining: &MiningReport) -> Vec<(Uuid, String)> {
    let mut out = Vec::new();

    for cluster in &mining.clusters {
        if cluster.member_ids.len() < MIN_CLUSTER_FOR_ABSTRACTION {
            continue;
        }
        let key = cluster.member_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",");
        let id = deterministic_abstraction_id("cluster", &key);
        out.push((id, format!("[LESSON:learned] recurring theme across {} memories: {}", cluster.member_ids.len(), cluster.centroid_text)));
    }

    if mining.recurring_errors >= MIN_RECURRING_ERROR_FOR_ABSTRACTION {
        let id = deterministic_abstraction_id("recurring_error", &mining.recurring_errors.to_string());
        out.push((id, format!("[LESSON:gotcha] {} recurring error patterns detected, review before repeating", mining.recurring_errors)));
    }

    if mining.cooccurrences >= MIN_COOCCURRENCE_FOR_ABSTRACTION {
        let id = deterministic_abstraction_id("cooccurrence", &mining.cooccurrences.to_string());
        out.push((id, format!("[LESSON:learned] {} entity co-occurrence patterns found", mining.cooccurrences)));
    }

    out
}

pub async fn persist_abstraction(store: &dyn VectorStore, collection: &str, id: Uuid, text: String, embedding: &[f32]) -> Result<()> {
    let payload = serde_json::json!({
        "content": text,
        "memory_type": "semantic",
        "classification": "public",
        "scope": "shared",
        "urgency": "important",
        "importance": 0.8,
        "confidence": 0.7,
        "metadata": {"source": "pattern_mining", "abstracted": true},
        "deleted": false,
        "updated_at": chrono::Utc::now(),
    });
    store.upsert(collection, id, embedding, payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_correction_family() {
        let lesson = detect_lesson("Actually, the endpoint takes a POST not a GET", "api discussion").unwrap();
        assert_eq!(lesson.lesson_type, LessonType::Correction);
    }

    #[test]
    fn detects_fix_family() {
        let lesson = detect_lesson("The fix is to add a retry with backoff", "incident").unwrap();
        assert_eq!(lesson.lesson_type, LessonType::Fix);
    }

    #[test]
    fn plain_statement_has_no_lesson() {
        assert!(detect_lesson("the weather is nice today", "chat").is_none());
    }

    #[test]
    fn dedup_key_truncates_to_100_lowercased_chars() {
        let long = "A".repeat(150);
        let key = dedup_key(&long);
        assert_eq!(key.len(), DEDUP_KEY_CHARS);
        assert_eq!(key, "a".repeat(DEDUP_KEY_CHARS));
    }

    #[test]
    fn deterministic_lesson_id_is_stable() {
        assert_eq!(deterministic_lesson_id("k"), deterministic_lesson_id("k"));
        assert_ne!(deterministic_lesson_id("k1"), deterministic_lesson_id("k2"));
    }
}
