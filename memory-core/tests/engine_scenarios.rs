//! End-to-end scenarios wired against in-process fake adapters instead of
//! the HTTP-backed ones `MemoryEngine` builds. Exercises the store and
//! retrieval orchestrators directly so a scenario never needs a live
//! vector database, embedding service, or broker.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use memory_config::{AutoLinkConfig, CollectionNames};
use memory_core::cache::LayeredCache;
use memory_core::dream;
use memory_core::embedding::Embedder;
use memory_core::keyword_index::KeywordIndex;
use memory_core::retrieval::{RecentTopics, RetrievalOrchestrator, RetrievalQuery};
use memory_core::store::{StoreAction, StoreOrchestrator, StoreRequest};
use memory_core::vector_store::{Filters, ScoredPoint, ScrollPage, VectorStore};
use memory_core::{BroadcastMessage, MemoryCell, MemoryType, Result, Scope, Urgency};
use serde_json::{Value, json};
use uuid::Uuid;

mod fakes {
    use super::*;

    #[derive(Clone)]
    struct Point {
        vector: Vec<f32>,
        payload: Value,
    }

    /// In-memory stand-in for the Qdrant-compatible REST contract. Mirrors
    /// the filter, dedup-search, and shallow-patch semantics of
    /// [`memory_core::vector_store::HttpVectorStore`] without a network
    /// round trip.
    #[derive(Default)]
    pub struct FakeVectorStore {
        collections: Mutex<HashMap<String, HashMap<Uuid, Point>>>,
    }

    impl FakeVectorStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn payload_of(&self, collection: &str, id: Uuid) -> Option<Value> {
            self.collections.lock().unwrap().get(collection).and_then(|pts| pts.get(&id)).map(|p| p.payload.clone())
        }

        pub fn live_count(&self, collection: &str) -> usize {
            self.collections
                .lock()
                .unwrap()
                .get(collection)
                .map(|pts| pts.values().filter(|p| !p.payload.get("deleted").and_then(Value::as_bool).unwrap_or(false)).count())
                .unwrap_or(0)
        }

        pub fn seed(&self, collection: &str, id: Uuid, vector: Vec<f32>, payload: Value) {
            self.collections.lock().unwrap().entry(collection.to_string()).or_default().insert(id, Point { vector, payload });
        }
    }

    fn filters_match(payload: &Value, filters: &Filters) -> bool {
        let mut required = filters.0.clone();
        required.entry("deleted".to_string()).or_insert(json!(false));
        required.iter().all(|(k, v)| payload.get(k).map(|pv| pv == v).unwrap_or(false))
    }

    #[async_trait]
    impl VectorStore for FakeVectorStore {
        async fn upsert(&self, collection: &str, id: Uuid, vector: &[f32], payload: Value) -> Result<()> {
            self.collections
                .lock()
                .unwrap()
                .entry(collection.to_string())
                .or_default()
                .insert(id, Point { vector: vector.to_vec(), payload });
            Ok(())
        }

        async fn search(
            &self,
            collection: &str,
            vector: &[f32],
            limit: usize,
            min_score: Option<f32>,
            filters: &Filters,
        ) -> Result<Vec<ScoredPoint>> {
            let map = self.collections.lock().unwrap();
            let empty = HashMap::new();
            let points = map.get(collection).unwrap_or(&empty);
            let mut scored: Vec<ScoredPoint> = points
                .iter()
                .filter(|(_, p)| filters_match(&p.payload, filters))
                .map(|(id, p)| ScoredPoint {
                    id: *id,
                    score: memory_core::embedding::cosine_similarity(vector, &p.vector),
                    payload: p.payload.clone(),
                    vector: None,
                })
                .collect();
            scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            Ok(scored.into_iter().filter(|p| min_score.map_or(true, |m| p.score >= m)).take(limit).collect())
        }

        async fn scroll(&self, collection: &str, batch_size: usize, offset: Option<Value>, filters: &Filters) -> Result<ScrollPage> {
            let map = self.collections.lock().unwrap();
            let empty = HashMap::new();
            let points = map.get(collection).unwrap_or(&empty);
            let mut matching: Vec<(Uuid, &Point)> = points.iter().filter(|(_, p)| filters_match(&p.payload, filters)).map(|(id, p)| (*id, p)).collect();
            matching.sort_by_key(|(id, _)| *id);
            let start = offset.as_ref().and_then(Value::as_u64).unwrap_or(0) as usize;
            let end = (start + batch_size).min(matching.len());
            let page = matching[start.min(matching.len())..end]
                .iter()
                .map(|(id, p)| ScoredPoint { id: *id, score: 0.0, payload: p.payload.clone(), vector: Some(p.vector.clone()) })
                .collect();
            let next_offset = if end < matching.len() { Some(json!(end)) } else { None };
            Ok(ScrollPage { points: page, next_offset })
        }

        async fn patch(&self, collection: &str, id: Uuid, payload_patch: Value) -> Result<()> {
            let mut map = self.collections.lock().unwrap();
            if let Some(point) = map.get_mut(collection).and_then(|pts| pts.get_mut(&id)) {
                if let (Some(base), Some(patch)) = (point.payload.as_object_mut(), payload_patch.as_object()) {
                    for (k, v) in patch {
                        base.insert(k.clone(), v.clone());
                    }
                }
            }
            Ok(())
        }

        async fn get(&self, collection: &str, id: Uuid) -> Result<Option<Value>> {
            Ok(self.payload_of(collection, id))
        }

        async fn count(&self, collection: &str) -> Result<u64> {
            Ok(self.collections.lock().unwrap().get(collection).map(|pts| pts.len()).unwrap_or(0) as u64)
        }

        async fn ensure_text_index(&self, _collection: &str, _field: &str) -> Result<()> {
            Ok(())
        }
    }

    const DIMS: usize = 64;
    const STOPWORDS: &[&str] = &["a", "an", "the", "is", "are", "was", "were", "be", "to", "of"];

    /// Deterministic bag-of-words embedder: tokens hash into a fixed-width
    /// vector, L2-normalized. Stands in for a real embedding service —
    /// shared vocabulary drives similarity the same way semantic closeness
    /// would, without a network round trip.
    pub struct FakeEmbedder;

    fn bow_vector(text: &str) -> Vec<f32> {
        let mut v = vec![0f32; DIMS];
        for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            if STOPWORDS.contains(&token) {
                continue;
            }
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            token.hash(&mut hasher);
            v[(hasher.finish() as usize) % DIMS] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(bow_vector(text))
        }
    }

    /// Records every publish call for assertion instead of fanning out
    /// anywhere.
    #[derive(Default)]
    pub struct RecordingBus {
        pub published: Mutex<Vec<(String, BroadcastMessage)>>,
    }

    #[async_trait]
    impl memory_core::broadcast::PubSubBus for RecordingBus {
        async fn publish(&self, channel: &str, message: &BroadcastMessage) -> Result<()> {
            self.published.lock().unwrap().push((channel.to_string(), message.clone()));
            Ok(())
        }
    }
}

use fakes::{FakeEmbedder, FakeVectorStore, RecordingBus};

fn harness() -> (FakeVectorStore, FakeEmbedder, KeywordIndex, LayeredCache, CollectionNames, AutoLinkConfig) {
    (FakeVectorStore::new(), FakeEmbedder, KeywordIndex::new(), LayeredCache::new(None), CollectionNames::default(), AutoLinkConfig::default())
}

fn store_orchestrator<'a>(
    embedder: &'a FakeEmbedder,
    vector_store: &'a FakeVectorStore,
    keyword_index: &'a KeywordIndex,
    cache: &'a LayeredCache,
    collections: &'a CollectionNames,
    auto_link: &'a AutoLinkConfig,
    bus: Option<&'a RecordingBus>,
) -> StoreOrchestrator<'a> {
    StoreOrchestrator {
        embedder,
        vector_store,
        keyword_index,
        cache,
        graph: None,
        bus: bus.map(|b| b as &dyn memory_core::broadcast::PubSubBus),
        collections,
        auto_link,
    }
}

fn request(content: &str, agent_id: &str, private_hint: bool) -> StoreRequest {
    StoreRequest {
        content: content.to_string(),
        agent_id: agent_id.to_string(),
        user_id: None,
        context_hint_private: private_hint,
        extra_entities: Vec::new(),
    }
}

#[tokio::test]
async fn s1_store_and_recall_ranks_the_matching_cell_first() {
    let (store, embedder, keyword_index, cache, collections, auto_link) = harness();
    let orchestrator = store_orchestrator(&embedder, &store, &keyword_index, &cache, &collections, &auto_link, None);

    let ip_outcome = orchestrator.store(request("The server IP is 192.168.1.1", "agent-a", false)).await.unwrap();
    assert_eq!(ip_outcome.action, StoreAction::Created);
    let port_outcome = orchestrator.store(request("The database runs on port 5432", "agent-a", false)).await.unwrap();
    assert_eq!(port_outcome.action, StoreAction::Created);

    let recent_topics = RecentTopics::new();
    let retrieval = RetrievalOrchestrator {
        embedder: &embedder,
        vector_store: &store,
        keyword_index: &keyword_index,
        cache: &cache,
        graph: None,
        trust_table: HashMap::new(),
        hybrid_enabled: true,
        activation_params: Default::default(),
        recent_topics: &recent_topics,
        preference_model: None,
    };

    let results = retrieval
        .retrieve(&collections.shared, RetrievalQuery { text: "what is the server IP".to_string(), limit: 5, min_score: None, agent_id: "agent-b".to_string(), user_id: None })
        .await
        .unwrap();

    assert!(!results.is_empty(), "expected at least one hit");
    assert!(results[0].cell.content.contains("192.168.1.1"), "IP cell should rank first, got {:?}", results[0].cell.content);
    assert!(results.iter().any(|r| r.cell.content.contains("5432")), "port cell should still be returned");

    let ip_id = ip_outcome.cell.unwrap().id;
    let patched = store.payload_of(&collections.shared, ip_id).unwrap();
    assert_eq!(patched.get("access_count").and_then(Value::as_u64), Some(1), "recall should have bumped access_count");
}

#[tokio::test]
async fn s2_secret_content_is_blocked_and_never_persisted() {
    let (store, embedder, keyword_index, cache, collections, auto_link) = harness();
    let bus = RecordingBus::default();
    let orchestrator = store_orchestrator(&embedder, &store, &keyword_index, &cache, &collections, &auto_link, Some(&bus));

    let outcome = orchestrator.store(request("password: hunter2", "agent-a", false)).await.unwrap();

    assert_eq!(outcome.action, StoreAction::BlockedSecret);
    assert!(outcome.cell.is_none());
    assert_eq!(store.count(&collections.shared).await.unwrap(), 0);
    assert_eq!(store.count(&collections.private).await.unwrap(), 0);
    assert!(bus.published.lock().unwrap().is_empty(), "a blocked secret must never reach the bus");
}

#[tokio::test]
async fn s3_exact_repeat_is_a_duplicate_not_a_merge() {
    let (store, embedder, keyword_index, cache, collections, auto_link) = harness();
    let orchestrator = store_orchestrator(&embedder, &store, &keyword_index, &cache, &collections, &auto_link, None);

    let first = orchestrator.store(request("Paris is the capital of France", "agent-a", false)).await.unwrap();
    assert_eq!(first.action, StoreAction::Created);

    let second = orchestrator.store(request("Paris is the capital of France", "agent-a", false)).await.unwrap();
    assert_eq!(second.action, StoreAction::Duplicate);
    assert!(second.cell.is_none());

    assert_eq!(store.live_count(&collections.shared), 1, "an exact repeat must not create a second live cell");
}

#[tokio::test]
async fn s4_paraphrase_above_threshold_merges_into_one_live_cell() {
    let (store, embedder, keyword_index, cache, collections, auto_link) = harness();
    let orchestrator = store_orchestrator(&embedder, &store, &keyword_index, &cache, &collections, &auto_link, None);

    let first = orchestrator.store(request("server at 10.0.0.1", "agent-a", false)).await.unwrap();
    assert_eq!(first.action, StoreAction::Created);
    let first_id = first.cell.unwrap().id;

    let second = orchestrator.store(request("The server is at 10.0.0.1", "agent-a", false)).await.unwrap();
    assert_eq!(second.action, StoreAction::Merged);
    let merged_cell = second.cell.unwrap();

    assert_eq!(store.live_count(&collections.shared), 1, "a merge must leave exactly one live cell");
    let old_payload = store.payload_of(&collections.shared, first_id).unwrap();
    assert_eq!(old_payload.get("deleted").and_then(Value::as_bool), Some(true), "the superseded cell must be soft-deleted");
    assert_eq!(merged_cell.metadata.get("merged_from").and_then(|v| v.as_str()), Some(first_id.to_string()).as_deref());
}

#[tokio::test]
async fn s5_broadcast_fans_out_and_the_other_agent_can_recall_it() {
    let (store, embedder, keyword_index, cache, collections, auto_link) = harness();
    let bus = RecordingBus::default();
    let orchestrator = store_orchestrator(&embedder, &store, &keyword_index, &cache, &collections, &auto_link, Some(&bus));

    let outcome = orchestrator.store(request("server outage resolved by restarting the service", "agent-a", false)).await.unwrap();
    assert_eq!(outcome.action, StoreAction::Created);

    let published = bus.published.lock().unwrap();
    assert!(published.iter().any(|(channel, msg)| channel == "public" && msg.event == memory_core::BroadcastEvent::NewMemory));
    drop(published);

    let recent_topics = RecentTopics::new();
    let retrieval = RetrievalOrchestrator {
        embedder: &embedder,
        vector_store: &store,
        keyword_index: &keyword_index,
        cache: &cache,
        graph: None,
        trust_table: HashMap::new(),
        hybrid_enabled: true,
        activation_params: Default::default(),
        recent_topics: &recent_topics,
        preference_model: None,
    };
    let results = retrieval
        .retrieve(&collections.shared, RetrievalQuery { text: "server outage".to_string(), limit: 5, min_score: None, agent_id: "agent-b".to_string(), user_id: None })
        .await
        .unwrap();
    assert!(!results.is_empty(), "agent-b should be able to recall agent-a's shared memory");
}

fn aged_cell(days_old: i64, importance: f32) -> MemoryCell {
    let mut cell = MemoryCell::new("stale fact nobody revisits".to_string(), "agent-a".to_string());
    cell.memory_type = MemoryType::Semantic;
    cell.urgency = Urgency::Background;
    cell.scope = Scope::Public;
    cell.importance = importance;
    cell.created_at = Utc::now() - chrono::Duration::days(days_old);
    cell.updated_at = cell.created_at;
    cell
}

#[tokio::test]
async fn s6_dream_prunes_stale_low_importance_cells() {
    let store = FakeVectorStore::new();
    let collections = CollectionNames::default();

    let mut ids = Vec::new();
    for _ in 0..10 {
        let cell = aged_cell(120, 0.1);
        ids.push(cell.id);
        let payload = serde_json::to_value(&cell).unwrap();
        store.seed(&collections.shared, cell.id, vec![0.0; 8], payload);
    }

    let report = dream::run(&store, None, &collections.shared, "agent-a", 8, Some(std::time::Duration::from_secs(300))).await.unwrap();

    assert_eq!(report.pruned, 10);
    assert!(!report.aborted_on_budget);
    for id in ids {
        let payload = store.payload_of(&collections.shared, id).unwrap();
        assert_eq!(payload.get("deleted").and_then(Value::as_bool), Some(true), "every stale cell should be soft-deleted");
    }
}
