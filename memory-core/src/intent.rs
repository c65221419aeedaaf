//! Intent router.
//!
//! Pure regex-and-keyword classification of a query into one of eight
//! intents, each mapped to a retrieval [`Strategy`]. CPU-only, no
//! suspension points.

use std::sync::LazyLock;

use regex::Regex;

use crate::schema::MemoryType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Factual,
    Temporal,
    Procedural,
    Preference,
    Exploratory,
    Relational,
    Diagnostic,
    Comparative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMode {
    Relevance,
    Recency,
    Importance,
}

/// Five weights summing to 1.0: vector, bm25, graph, importance,
/// type-relevance.
#[derive(Debug, Clone, Copy)]
pub struct Weights {
    pub vector: f32,
    pub bm25: f32,
    pub graph: f32,
    pub importance: f32,
    pub type_relevance: f32,
}

#[derive(Debug, Clone)]
pub struct Strategy {
    pub weights: Weights,
    pub sort_mode: SortMode,
    pub boost_types: Vec<MemoryType>,
    pub penalize_types: Vec<MemoryType>,
    pub min_score: f32,
    pub result_cap: usize,
    pub expand_query: bool,
}

#[derive(Debug, Clone)]
pub struct RouterOutcome {
    pub intent: Intent,
    pub confidence: f32,
    pub strategy: Strategy,
    pub query_rewrite: Option<String>,
}

const BOOST: f32 = 0.10;
const PENALIZE: f32 = -0.08;

fn weights(vector: f32, bm25: f32, graph: f32, importance: f32, type_relevance: f32) -> Weights {
    Weights { vector, bm25, graph, importance, type_relevance }
}

struct IntentSpec {
    intent: Intent,
    patterns: &'static [&'static str],
}

static INTENT_SPECS: LazyLock<Vec<(Intent, Vec<Regex>)>> = LazyLock::new(|| {
    let specs: &[IntentSpec] = &[
        IntentSpec { intent: Intent::Factual, patterns: &[r"(?i)^what is\b", r"(?i)^who is\b", r"(?i)^define\b", r"(?i)\bfact(s)?\b"] },
        IntentSpec { intent: Intent::Temporal, patterns: &[r"(?i)\bwhen\b", r"(?i)\byesterday\b", r"(?i)\blast (week|month|year)\b", r"(?i)\btimeline\b"] },
        IntentSpec { intent: Intent::Procedural, patterns: &[r"(?i)^how (do|to|can)\b", r"(?i)\bsteps?\b", r"(?i)\bguide\b", r"(?i)\bprocedure\b"] },
        IntentSpec { intent: Intent::Preference, patterns: &[r"(?i)\bprefer\b", r"(?i)\bfavou?rite\b", r"(?i)\blike(s)? (to|doing)\b"] },
        IntentSpec { intent: Intent::Relational, patterns: &[r"(?i)\bwho (works|knows|is related)\b", r"(?i)\brelationship\b", r"(?i)\bconnected to\b"] },
        IntentSpec { intent: Intent::Diagnostic, patterns: &[r"(?i)\bwhy (is|did|does)\b", r"(?i)\berror\b", r"(?i)\bbug\b", r"(?i)\bbroken\b", r"(?i)\bfail(ed|ing)?\b"] },
        IntentSpec { intent: Intent::Comparative, patterns: &[r"(?i)\bvs\.?\b", r"(?i)\bversus\b", r"(?i)\bcompared? to\b", r"(?i)\bbetter than\b", r"(?i)\bdifference between\b"] },
    ];
    specs
        .iter()
        .map(|spec| {
            let compiled = spec.patterns.iter().map(|p| Regex::new(p).expect("static intent pattern compiles")).collect();
            (spec.intent, compiled)
        })
        .collect()
});

static QUESTION_AUX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(what|who|when|where|why|how|is|are|do|does|did|can|could)\s+(is|are|do|does|did|can|could)?\s*").unwrap());

fn strategy_for(intent: Intent) -> Strategy {
    match intent {
        Intent::Factual => Strategy {
            weights: weights(0.40, 0.30, 0.10, 0.10, 0.10),
            sort_mode: SortMode::Relevance,
            boost_types: vec![MemoryType::Semantic, MemoryType::Core],
            penalize_types: vec![MemoryType::Episodic],
            min_score: 0.15,
            result_cap: 20,
            expand_query: false,
        },
        Intent::Temporal => Strategy {
            weights: weights(0.30, 0.20, 0.10, 0.10, 0.30),
            sort_mode: SortMode::Recency,
            boost_types: vec![MemoryType::Episodic],
            penalize_types: vec![MemoryType::Procedural],
            min_score: 0.10,
            result_cap: 20,
            expand_query: false,
        },
        Intent::Procedural => Strategy {
            weights: weights(0.35, 0.25, 0.05, 0.10, 0.25),
            sort_mode: SortMode::Relevance,
            boost_types: vec![MemoryType::Procedural],
            penalize_types: vec![MemoryType::Episodic],
            min_score: 0.15,
            result_cap: 15,
            expand_query: true,
        },
        Intent::Preference => Strategy {
            weights: weights(0.35, 0.20, 0.05, 0.15, 0.25),
            sort_mode: SortMode::Importance,
            boost_types: vec![MemoryType::Preference],
            penalize_types: vec![MemoryType::Episodic],
            min_score: 0.10,
            result_cap: 15,
            expand_query: false,
        },
        Intent::Exploratory => Strategy {
            weights: weights(0.45, 0.20, 0.10, 0.10, 0.15),
            sort_mode: SortMode::Relevance,
            boost_types: vec![],
            penalize_types: vec![],
            min_score: 0.05,
            result_cap: 25,
            expand_query: true,
        },
        Intent::Relational => Strategy {
            weights: weights(0.25, 0.15, 0.35, 0.10, 0.15),
            sort_mode: SortMode::Relevance,
            boost_types: vec![MemoryType::Relationship],
            penalize_types: vec![],
            min_score: 0.10,
            result_cap: 20,
            expand_query: false,
        },
        Intent::Diagnostic => Strategy {
            weights: weights(0.35, 0.30, 0.10, 0.10, 0.15),
            sort_mode: SortMode::Recency,
            boost_types: vec![MemoryType::Episodic, MemoryType::Procedural],
            penalize_types: vec![MemoryType::Preference],
            min_score: 0.15,
            result_cap: 20,
            expand_query: true,
        },
        Intent::Comparative => Strategy {
            weights: weights(0.40, 0.25, 0.05, 0.10, 0.20),
            sort_mode: SortMode::Relevance,
            boost_types: vec![MemoryType::Semantic],
            penalize_types: vec![],
            min_score: 0.10,
            result_cap: 20,
            expand_query: true,
        },
    }
}

fn query_rewrite_for(intent: Intent, query: &str) -> Option<String> {
    match intent {
        Intent::Procedural => {
            let stripped = QUESTION_AUX_RE.replace(query, "");
            Some(format!("{} steps guide", stripped.trim()))
        }
        Intent::Factual | Intent::Relational | Intent::Diagnostic => {
            let stripped = QUESTION_AUX_RE.replace(query, "");
            let trimmed = stripped.trim();
            if trimmed != query.trim() { Some(trimmed.to_string()) } else { None }
        }
        _ => None,
    }
}

/// Classify `query` into an [`Intent`] and resolve its [`Strategy`].
/// Confidence is the intent's matched-pattern count, floored at 0.3, capped
/// at 1.0; `exploratory` is the default when nothing matches.
pub fn route(query: &str) -> RouterOutcome {
    let mut best: Option<(Intent, usize)> = None;
    for (intent, patterns) in INTENT_SPECS.iter() {
        let count = patterns.iter().filter(|re| re.is_match(query)).count();
        if count > 0 && best.map(|(_, best_count)| count > best_count).unwrap_or(true) {
            best = Some((*intent, count));
        }
    }

    let (intent, confidence) = match best {
        Some((intent, count)) => (intent, (count as f32 * 0.3).clamp(0.3, 1.0)),
        None => (Intent::Exploratory, 0.3),
    };

    RouterOutcome {
        intent,
        confidence,
        strategy: strategy_for(intent),
        query_rewrite: query_rewrite_for(intent, query),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn procedural_query_routes_to_procedural_intent() {
        let outcome = route("How do I deploy the service?");
        assert_eq!(outcome.intent, Intent::Procedural);
        assert!(outcome.query_rewrite.as_deref().unwrap().ends_with("steps guide"));
    }

    #[test]
    fn unmatched_query_defaults_to_exploratory() {
        let outcome = route("blue green orange purple");
        assert_eq!(outcome.intent, Intent::Exploratory);
        assert_eq!(outcome.confidence, 0.3);
    }

    #[test]
    fn strategy_weights_sum_to_one() {
        for intent in [
            Intent::Factual,
            Intent::Temporal,
            Intent::Procedural,
            Intent::Preference,
            Intent::Exploratory,
            Intent::Relational,
            Intent::Diagnostic,
            Intent::Comparative,
        ] {
            let strategy = strategy_for(intent);
            let w = strategy.weights;
            let sum = w.vector + w.bm25 + w.graph + w.importance + w.type_relevance;
            assert!((sum - 1.0).abs() < 1e-6, "{intent:?} weights sum to {sum}");
        }
    }

    #[test]
    fn diagnostic_query_detected() {
        let outcome = route("why is the server crashing");
        assert_eq!(outcome.intent, Intent::Diagnostic);
    }

    #[test]
    fn comparative_query_detected() {
        let outcome = route("rust vs go for backend services");
        assert_eq!(outcome.intent, Intent::Comparative);
    }
}
