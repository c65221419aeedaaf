//! Preferences & sentiment: a running per-user preference
//! model, session frustration state, and the small additive boost both feed
//! back into retrieval.
//!
//! This module's data shapes (`UserModel`, `PreferenceEntry`,
//! `FrustrationState`) sit alongside the other read/write data flow but have
//! no dedicated adapter of their own. The update rules below are grounded in
//! the adjacent modules this one most resembles: extraction mirrors the
//! classifier's pattern-set approach, and the additive retrieval boost
//! follows a "small bonus after ranking" design: scaled by entry strength
//! rather than a hard override of rank order.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use uuid::Uuid;

use crate::schema::{FrustrationState, PreferenceEntry, UserModel};

const MAX_SOURCE_IDS: usize = 20;
const STRENGTH_INCREMENT: f32 = 0.15;
const FRUSTRATION_ESCALATION_THRESHOLD: u32 = 3;
const FRUSTRATION_DECAY_PER_5MIN: f32 = 0.1;
const FRUSTRATION_SIGNAL_DELTA: f32 = 0.25;
const PREFERENCE_BOOST: f32 = 0.05;

struct PreferencePattern {
    category: &'static str,
    regex: Regex,
}

static PREFERENCE_PATTERNS: LazyLock<Vec<PreferencePattern>> = LazyLock::new(|| {
    vec![
        PreferencePattern { category: "likes", regex: Regex::new(r"(?i)\bi (?:really )?like (.+?)[.!]?$").unwrap() },
        PreferencePattern { category: "dislikes", regex: Regex::new(r"(?i)\bi (?:really )?(?:dislike|hate) (.+?)[.!]?$").unwrap() },
        PreferencePattern { category: "prefers", regex: Regex::new(r"(?i)\bi prefer (.+?)(?: over .+)?[.!]?$").unwrap() },
        PreferencePattern { category: "wants", regex: Regex::new(r"(?i)\bi want (.+?)[.!]?$").unwrap() },
        PreferencePattern { category: "favorites", regex: Regex::new(r"(?i)\bmy favou?rite (\w+) is (.+?)[.!]?$").unwrap() },
    ]
});

fn normalize_key(category: &str, value: &str) -> String {
    format!("{category}:{}", value.trim().to_lowercase())
}

/// Extract `(category, value)` pairs from free text via the preference
/// pattern set. A single message may carry more than one preference.
pub fn extract_preferences(text: &str) -> Vec<(String, String)> {
    let mut found = Vec::new();
    for pattern in PREFERENCE_PATTERNS.iter() {
        if let Some(caps) = pattern.regex.captures(text) {
            let value = caps.get(caps.len() - 1).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
            if !value.is_empty() {
                found.push((pattern.category.to_string(), value));
            }
        }
    }
    found
}

/// Fold newly-extracted preferences into a user's running model. Existing
/// keys gain evidence and a strength bump (capped at 1.0); new keys start at
/// the increment. `source_id`, if given, is appended to the entry's
/// evidence list, capped at `MAX_SOURCE_IDS` (oldest dropped first).
pub fn update_model(model: &mut UserModel, category: &str, value: &str, source_id: Option<Uuid>, now: DateTime<Utc>) {
    let key = normalize_key(category, value);
    let entry = model.preferences.entry(key).or_insert_with(|| PreferenceEntry {
        category: category.to_string(),
        value: value.to_string(),
        strength: 0.0,
        evidence_count: 0,
        first_seen: now,
        last_seen: now,
        source_ids: Vec::new(),
    });

    entry.strength = (entry.strength + STRENGTH_INCREMENT).min(1.0);
    entry.evidence_count += 1;
    entry.last_seen = now;
    if let Some(id) = source_id {
        entry.source_ids.push(id);
        if entry.source_ids.len() > MAX_SOURCE_IDS {
            entry.source_ids.remove(0);
        }
    }
}

/// Additive retrieval boost: a small bonus folded in after ranking rather
/// than a multiplier on the base score. Returns `PREFERENCE_BOOST` scaled by
/// the matching entry's strength, or 0 if the candidate text doesn't mention
/// any known preference value.
pub fn preference_boost(model: &UserModel, candidate_text: &str) -> f32 {
    let lower = candidate_text.to_lowercase();
    model
        .preferences
        .values()
        .filter(|entry| lower.contains(&entry.value.to_lowercase()))
        .map(|entry| entry.strength * PREFERENCE_BOOST)
        .fold(0.0f32, f32::max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrustrationSignal {
    Positive,
    Negative,
    Neutral,
}

/// Apply time-decay (0.1 per 5 minutes of silence since `last_updated`)
/// before folding in a new signal. Three or more consecutive negatives
/// escalate the state into the high end of the [0,1] band.
pub fn update_frustration(state: &mut FrustrationState, signal: FrustrationSignal, now: DateTime<Utc>) {
    let silence_minutes = (now - state.last_updated).num_seconds().max(0) as f32 / 60.0;
    let decay_steps = (silence_minutes / 5.0).floor();
    state.level = (state.level - decay_steps * FRUSTRATION_DECAY_PER_5MIN).max(0.0);

    match signal {
        FrustrationSignal::Negative => {
            state.consecutive_negative += 1;
            state.level = (state.level + FRUSTRATION_SIGNAL_DELTA).min(1.0);
            if state.consecutive_negative >= FRUSTRATION_ESCALATION_THRESHOLD {
                state.level = state.level.max(0.75);
            }
        }
        FrustrationSignal::Positive => {
            state.consecutive_negative = 0;
            state.level = (state.level - FRUSTRATION_SIGNAL_DELTA).max(0.0);
        }
        FrustrationSignal::Neutral => {
            state.consecutive_negative = 0;
        }
    }

    state.last_signal = Some(format!("{signal:?}").to_lowercase());
    state.last_updated = now;
    state.history.push((now, state.level));
}

pub fn is_frustrated(state: &FrustrationState) -> bool {
    state.level >= 0.75 || state.consecutive_negative >= FRUSTRATION_ESCALATION_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_like_preference() {
        let found = extract_preferences("I really like dark mode themes");
        assert_eq!(found.first().map(|(c, _)| c.as_str()), Some("likes"));
    }

    #[test]
    fn extracts_favorite_with_category() {
        let found = extract_preferences("My favorite editor is neovim");
        assert!(found.iter().any(|(c, v)| c == "favorites" && v.contains("neovim")));
    }

    #[test]
    fn update_model_accumulates_evidence() {
        let mut model = UserModel::default();
        let now = Utc::now();
        update_model(&mut model, "likes", "dark mode", None, now);
        update_model(&mut model, "likes", "dark mode", None, now);
        let entry = model.preferences.get("likes:dark mode").unwrap();
        assert_eq!(entry.evidence_count, 2);
        assert!(entry.strength > STRENGTH_INCREMENT);
    }

    #[test]
    fn three_consecutive_negatives_escalate_frustration() {
        let mut state = FrustrationState::default();
        let now = Utc::now();
        update_frustration(&mut state, FrustrationSignal::Negative, now);
        update_frustration(&mut state, FrustrationSignal::Negative, now);
        update_frustration(&mut state, FrustrationSignal::Negative, now);
        assert!(is_frustrated(&state));
    }

    #[test]
    fn silence_decays_frustration_level() {
        let mut state = FrustrationState { level: 0.5, ..Default::default() };
        let later = state.last_updated + chrono::Duration::minutes(15);
        update_frustration(&mut state, FrustrationSignal::Neutral, later);
        assert!(state.level < 0.5);
    }

    #[test]
    fn preference_boost_is_zero_without_match() {
        let model = UserModel::default();
        assert_eq!(preference_boost(&model, "anything"), 0.0);
    }
}
