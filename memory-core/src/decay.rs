//! ACT-R-style decay model.
//!
//! `core` and `procedural` cells are pinned and never decay; everything
//! else decays from its access history through a per-urgency `(d, β)` pair.

use crate::schema::{MemoryCell, MemoryType, Urgency};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayStatus {
    Active,
    Forgotten,
    Archive,
}

fn urgency_params(urgency: Urgency) -> (f32, f32) {
    match urgency {
        Urgency::Critical => (0.3, 2.0),
        Urgency::Important => (0.5, 1.0),
        Urgency::Reference => (0.6, 0.0),
        Urgency::Background => (0.8, -1.0),
    }
}

/// Activation `A = ln(Σ t_j^(−d)) + β`. `core` → 10, `procedural` → 5
/// (pinned, never decay). Empty access history treats `created_at` as the
/// sole synthetic access, so a never-recalled cell decays purely on age.
pub fn activation(cell: &MemoryCell, now: chrono::DateTime<chrono::Utc>) -> f32 {
    match cell.memory_type {
        MemoryType::Core => return 10.0,
        MemoryType::Procedural => return 5.0,
        _ => {}
    }

    let (d, beta) = urgency_params(cell.urgency);

    let sum: f32 = if cell.access_times.is_empty() {
        let hours = cell.hours_since_creation(now).max(0.001);
        hours.powf(-d)
    } else {
        cell.access_times
            .iter()
            .map(|&access_time| {
                let hours = ((now - access_time).num_seconds().max(0) as f32 / 3600.0).max(0.001);
                hours.powf(-d)
            })
            .sum()
    };

    sum.ln() + beta
}

pub fn status(a: f32) -> DecayStatus {
    if a >= -2.0 {
        DecayStatus::Active
    } else if a >= -4.0 {
        DecayStatus::Forgotten
    } else {
        DecayStatus::Archive
    }
}

/// Normalize activation into `[0, 1]` over the band `[-4, +3]`, clamped at
/// the edges, for blending into a ranking score.
pub fn normalize(a: f32) -> f32 {
    ((a + 4.0) / 7.0).clamp(0.0, 1.0)
}

/// `0.8·semanticScore + 0.2·normalize(A)` blend, for callers that want a
/// single decay-aware score.
pub fn blend_with_semantic(semantic_score: f32, a: f32) -> f32 {
    0.8 * semantic_score + 0.2 * normalize(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn cell_with(memory_type: MemoryType, urgency: Urgency) -> MemoryCell {
        let mut cell = MemoryCell::new("x".into(), "a".into());
        cell.memory_type = memory_type;
        cell.urgency = urgency;
        cell
    }

    #[test]
    fn core_cells_never_decay() {
        let cell = cell_with(MemoryType::Core, Urgency::Background);
        assert_eq!(activation(&cell, Utc::now()), 10.0);
    }

    #[test]
    fn procedural_cells_never_decay() {
        let cell = cell_with(MemoryType::Procedural, Urgency::Background);
        assert_eq!(activation(&cell, Utc::now()), 5.0);
    }

    #[test]
    fn fresh_cell_with_synthetic_access_is_active() {
        let cell = cell_with(MemoryType::Semantic, Urgency::Reference);
        let a = activation(&cell, Utc::now());
        assert_eq!(status(a), DecayStatus::Active);
    }

    #[test]
    fn stale_cell_decays_toward_archive() {
        let mut cell = cell_with(MemoryType::Semantic, Urgency::Background);
        cell.created_at = Utc::now() - chrono::Duration::days(90);
        let a = activation(&cell, Utc::now());
        assert!(a < -2.0);
    }

    #[test]
    fn normalize_clamps_outside_band() {
        assert_eq!(normalize(-10.0), 0.0);
        assert_eq!(normalize(10.0), 1.0);
    }

    #[test]
    fn status_bands_match_expected_thresholds() {
        assert_eq!(status(-1.0), DecayStatus::Active);
        assert_eq!(status(-3.0), DecayStatus::Forgotten);
        assert_eq!(status(-5.0), DecayStatus::Archive);
    }
}
