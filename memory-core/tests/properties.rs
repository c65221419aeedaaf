//! Property tests over the decay model and the keyword index.

use memory_core::decay::activation;
use memory_core::keyword_index::KeywordIndex;
use memory_core::schema::{MemoryCell, MemoryType, Urgency};
use proptest::prelude::*;
use uuid::Uuid;

fn decaying_cell(urgency: Urgency) -> MemoryCell {
    let mut cell = MemoryCell::new("a memory that is never recalled".to_string(), "agent-1".to_string());
    cell.memory_type = MemoryType::Semantic;
    cell.urgency = urgency;
    cell
}

fn any_decaying_urgency() -> impl Strategy<Value = Urgency> {
    prop_oneof![
        Just(Urgency::Critical),
        Just(Urgency::Important),
        Just(Urgency::Reference),
        Just(Urgency::Background),
    ]
}

proptest! {
    /// Activation only ever falls (or holds, at the resolution granted by
    /// floating point) as time advances past a cell's creation with no
    /// intervening access.
    #[test]
    fn decay_is_monotonic_without_access(
        urgency in any_decaying_urgency(),
        earlier_hours in 0.01f32..500.0,
        later_delta_hours in 0.01f32..5000.0,
    ) {
        let cell = decaying_cell(urgency);
        let now = cell.created_at;
        let t1 = now + chrono::Duration::seconds((earlier_hours * 3600.0) as i64);
        let t2 = t1 + chrono::Duration::seconds((later_delta_hours * 3600.0) as i64);

        let a1 = activation(&cell, t1);
        let a2 = activation(&cell, t2);
        prop_assert!(a2 <= a1 + 1e-4, "activation rose over time: a({t1})={a1}, a({t2})={a2}");
    }

    /// Pinned types never decay regardless of how much time passes.
    #[test]
    fn core_and_procedural_are_time_invariant(hours in 0.0f32..10_000.0) {
        let mut core = decaying_cell(Urgency::Background);
        core.memory_type = MemoryType::Core;
        let mut procedural = decaying_cell(Urgency::Background);
        procedural.memory_type = MemoryType::Procedural;

        let now = core.created_at + chrono::Duration::seconds((hours * 3600.0) as i64);
        prop_assert_eq!(activation(&core, now), 10.0);
        prop_assert_eq!(activation(&procedural, now), 5.0);
    }

    /// Adding a document and immediately removing it leaves the index
    /// exactly as empty as it started, through the public surface only
    /// (internal postings/doc tables are private).
    #[test]
    fn add_then_remove_restores_empty_index(text in "[a-z]{3,10}( [a-z]{3,10}){0,4}") {
        let index = KeywordIndex::new();
        prop_assert!(index.is_empty());

        let id = Uuid::new_v4();
        index.add(id, &text);
        prop_assert_eq!(index.len(), 1);
        prop_assert!(!index.is_empty());

        index.remove(id);
        prop_assert!(index.is_empty());
        prop_assert_eq!(index.len(), 0);
        prop_assert!(index.search(&text, 10).is_empty());
    }

    /// Re-adding the same id updates in place rather than accumulating a
    /// second document.
    #[test]
    fn re_add_is_idempotent_on_doc_count(
        first in "[a-z]{3,10}( [a-z]{3,10}){0,4}",
        second in "[a-z]{3,10}( [a-z]{3,10}){0,4}",
    ) {
        let index = KeywordIndex::new();
        let id = Uuid::new_v4();
        index.add(id, &first);
        index.add(id, &second);
        prop_assert_eq!(index.len(), 1);
        index.remove(id);
        prop_assert!(index.is_empty());
    }
}
