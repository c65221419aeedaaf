//! Engine facade — the single entry point composing every component behind
//! plain async methods, mirroring the role a top-level manager plays over a
//! set of otherwise-independent subsystems.
//!
//! `MemoryEngine` owns the adapters (vector store, embedder, optional graph
//! and pub/sub bus), the in-process keyword index, and the layered cache. It
//! exposes the write and read paths as `store`/`recall`, the background jobs
//! (consolidation, dream compaction, pattern mining) as on-demand passes over
//! a partition, and lesson extraction / feedback as thin wrappers a caller
//! drives explicitly. Per-(user, agent) preference and per-session
//! frustration state are kept in-process only (`record_preference_signal`,
//! `user_model`, `record_frustration_signal`, `is_frustrated`); `recall`
//! consults the caller's preference model, when `query.user_id` names one on
//! file, for the ranker's preference-boost term. A caller wanting either
//! durable persists it itself (a profile-partition cell, in this workspace's
//! case).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use memory_config::EngineConfig;

use crate::autolink;
use crate::broadcast::{HttpPubSubBus, PubSubBus};
use crate::cache::{HttpExternalKv, LayeredCache};
use crate::consolidation::{self, ConsolidationReport, ScrolledCell};
use crate::dream::{self, DreamReport};
use crate::embedding::{Embedder, HttpEmbedder};
use crate::error::Result;
use crate::feedback::{self, FeedbackOutcome};
use crate::graph::{GraphStore, HttpGraphStore};
use crate::keyword_index::KeywordIndex;
use crate::lesson::{self, DetectedLesson};
use crate::pattern_miner::{self, MiningReport};
use crate::preferences::{self, FrustrationSignal};
use crate::retrieval::{RecentTopics, RetrievalOrchestrator, RetrievalQuery, RetrievalResult};
use crate::schema::{FrustrationState, MemoryCell, Partition, UserModel};
use crate::shared_block;
use crate::store::{StoreOrchestrator, StoreOutcome, StoreRequest};
use crate::vector_store::{Filters, HttpVectorStore, VectorStore, collection_name};

/// Bootstrap streams up to 5000 live texts in batches of 100.
const BOOTSTRAP_SCROLL_BATCH: usize = 100;
const BOOTSTRAP_MAX: usize = 5000;
/// Consolidation's pairwise pass is bounded to ≤200 per batch.
const CONSOLIDATION_BATCH: usize = 200;

pub struct MemoryEngine {
    config: EngineConfig,
    embedder: Box<dyn Embedder>,
    vector_store: Box<dyn VectorStore>,
    graph: Option<Box<dyn GraphStore>>,
    bus: Option<Box<dyn PubSubBus>>,
    keyword_index: KeywordIndex,
    cache: LayeredCache,
    trust_table: HashMap<String, f32>,
    embedding_dim: Mutex<Option<usize>>,
    recent_topics: RecentTopics,
    /// Per (user, agent) running preference model (component V). No
    /// adapter of its own — it lives only as long as this process, same as
    /// `recent_topics`; a caller wanting it durable persists it as a
    /// profile-partition cell itself.
    user_models: Mutex<HashMap<(String, String), UserModel>>,
    /// Per-session frustration state (component V).
    frustration_states: Mutex<HashMap<String, FrustrationState>>,
}

impl MemoryEngine {
    /// Build the engine's adapters from a validated [`EngineConfig`]. Does
    /// not touch the network; callers that want the keyword index warm
    /// should follow up with [`Self::bootstrap_keyword_index`].
    pub fn new(config: EngineConfig) -> Result<Self> {
        let embedder = Box::new(HttpEmbedder::new(&config.embedding_url, &config.embedding_model));
        let vector_store = Box::new(HttpVectorStore::new(&config.vector_db_url));
        let graph: Option<Box<dyn GraphStore>> =
            if config.enable_graph() { config.graph_url.as_ref().map(|url| Box::new(HttpGraphStore::new(url)) as Box<dyn GraphStore>) } else { None };
        let bus: Option<Box<dyn PubSubBus>> =
            if config.enable_broadcast() { config.redis_url.as_ref().map(|url| Box::new(HttpPubSubBus::new(url)) as Box<dyn PubSubBus>) } else { None };
        // The external KV fronting L2 is the same redis-compatible bridge the
        // bus uses, namespaced separately rather than split into two URLs.
        let l2 = config.redis_url.as_ref().map(|url| Box::new(HttpExternalKv::new(url, "memory_cache")) as Box<dyn crate::cache::ExternalKv>);
        let cache = LayeredCache::new(l2);

        Ok(Self {
            embedder,
            vector_store,
            graph,
            bus,
            keyword_index: KeywordIndex::new(),
            cache,
            trust_table: HashMap::new(),
            embedding_dim: Mutex::new(None),
            recent_topics: RecentTopics::new(),
            user_models: Mutex::new(HashMap::new()),
            frustration_states: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Per-agent source-trust resolver used by the ranker. An
    /// absent entry resolves to the 0.7 default inside `ranker::source_trust`.
    pub fn set_trust(&mut self, agent_id: impl Into<String>, trust: f32) {
        self.trust_table.insert(agent_id.into(), trust.clamp(0.0, 1.0));
    }

    fn collection(&self, partition: Partition) -> &str {
        collection_name(&self.config.collections, partition)
    }

    /// Bootstrap: stream up to 5000 live texts from the shared partition in
    /// batches of 100 and add them to the keyword index.
    /// Non-fatal on any scroll error — returns whatever was added so far.
    #[instrument(skip(self))]
    pub async fn bootstrap_keyword_index(&self) -> usize {
        let collection = self.collection(Partition::Shared);
        let mut added = 0;
        let mut offset = None;
        loop {
            if added >= BOOTSTRAP_MAX {
                break;
            }
            let page = match self.vector_store.scroll(collection, BOOTSTRAP_SCROLL_BATCH, offset.clone(), &Filters::new()).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(error = %err, "keyword index bootstrap scroll failed, stopping early");
                    break;
                }
            };
            if page.points.is_empty() {
                break;
            }
            let entries: Vec<(Uuid, String)> = page
                .points
                .iter()
                .filter_map(|p| p.payload.get("content").and_then(|v| v.as_str()).map(|text| (p.id, text.to_string())))
                .collect();
            added += self.keyword_index.bootstrap(entries);
            offset = page.next_offset;
            if offset.is_none() {
                break;
            }
        }
        info!(added, "keyword index bootstrap complete");
        added
    }

    /// Write path. Routes to the partition the classifier picks.
    pub async fn store(&self, request: StoreRequest) -> Result<StoreOutcome> {
        let orchestrator = StoreOrchestrator {
            embedder: self.embedder.as_ref(),
            vector_store: self.vector_store.as_ref(),
            keyword_index: &self.keyword_index,
            cache: &self.cache,
            graph: self.graph.as_deref(),
            bus: self.bus.as_deref(),
            collections: &self.config.collections,
            auto_link: &self.config.auto_link,
        };
        orchestrator.store(request).await
    }

    /// Read path against a given partition. When `query.user_id` names a
    /// caller with a preference model on file, it is consulted for the
    /// ranker's preference-boost term (retrieval adaptation, component V).
    pub async fn recall(&self, partition: Partition, query: RetrievalQuery) -> Result<Vec<RetrievalResult>> {
        let preference_model = query
            .user_id
            .as_ref()
            .and_then(|user_id| self.user_model(user_id, &query.agent_id));
        let orchestrator = RetrievalOrchestrator {
            embedder: self.embedder.as_ref(),
            vector_store: self.vector_store.as_ref(),
            keyword_index: &self.keyword_index,
            cache: &self.cache,
            graph: self.graph.as_deref(),
            trust_table: self.trust_table.clone(),
            hybrid_enabled: self.config.features.enable_bm25,
            activation_params: crate::activation::ActivationParams {
                depth: self.config.spread_activation.depth,
                decay: self.config.spread_activation.decay,
                fanout: self.config.spread_activation.fanout,
                min_activation: self.config.spread_activation.min_activation,
                node_cap: self.config.spread_activation.node_cap,
            },
            recent_topics: &self.recent_topics,
            preference_model,
        };
        orchestrator.retrieve(self.collection(partition), query).await
    }

    /// Extract preferences from free text and fold them into the running
    /// model for `(user_id, agent_id)`. Returns how many were found.
    pub fn record_preference_signal(&self, user_id: &str, agent_id: &str, text: &str, source_id: Option<Uuid>) -> usize {
        let found = preferences::extract_preferences(text);
        if found.is_empty() {
            return 0;
        }
        let now = chrono::Utc::now();
        let mut models = self.user_models.lock().unwrap();
        let model = models.entry((user_id.to_string(), agent_id.to_string())).or_default();
        for (category, value) in &found {
            preferences::update_model(model, category, value, source_id, now);
        }
        found.len()
    }

    /// Current snapshot of the preference model for `(user_id, agent_id)`,
    /// if any signal has been recorded for it yet.
    pub fn user_model(&self, user_id: &str, agent_id: &str) -> Option<UserModel> {
        self.user_models.lock().unwrap().get(&(user_id.to_string(), agent_id.to_string())).cloned()
    }

    /// Fold a sentiment signal into a session's frustration state and
    /// return whether the session now counts as frustrated.
    pub fn record_frustration_signal(&self, session_id: &str, signal: FrustrationSignal) -> bool {
        let now = chrono::Utc::now();
        let mut states = self.frustration_states.lock().unwrap();
        let state = states.entry(session_id.to_string()).or_default();
        preferences::update_frustration(state, signal, now);
        preferences::is_frustrated(state)
    }

    pub fn is_frustrated(&self, session_id: &str) -> bool {
        self.frustration_states.lock().unwrap().get(session_id).map(preferences::is_frustrated).unwrap_or(false)
    }

    /// Consolidation pass over one scroll batch of a partition.
    /// Callers wanting full-partition coverage loop this until the scroll is
    /// exhausted; kept single-batch here so contradiction/merge decisions
    /// never silently span an unbounded O(n²) pairwise comparison.
    #[instrument(skip(self))]
    pub async fn consolidate_batch(&self, partition: Partition, offset: Option<serde_json::Value>) -> Result<(ConsolidationReport, Option<serde_json::Value>)> {
        let collection = self.collection(partition);
        let page = self.vector_store.scroll(collection, CONSOLIDATION_BATCH, offset, &Filters::new()).await?;
        let batch: Vec<ScrolledCell> = page
            .points
            .into_iter()
            .filter_map(|p| {
                let vector = p.vector?;
                let cell = serde_json::from_value::<MemoryCell>(p.payload).ok()?;
                Some(ScrolledCell { cell, vector })
            })
            .collect();
        let report = consolidation::run(self.vector_store.as_ref(), collection, batch).await?;
        Ok((report, page.next_offset))
    }

    pub async fn should_dream(&self, partition: Partition, agent_id: &str) -> Result<bool> {
        dream::should_run(self.vector_store.as_ref(), self.collection(partition), agent_id).await
    }

    /// Dream compaction, budget-bounded. `budget` overrides the
    /// configured `dream.budget_seconds` when given.
    #[instrument(skip(self))]
    pub async fn dream(&self, partition: Partition, agent_id: &str, budget: Option<Duration>) -> Result<DreamReport> {
        let dim = self.embedding_dim().await?;
        let budget = budget.or_else(|| Some(Duration::from_secs(self.config.dream.budget_seconds)));
        dream::run(self.vector_store.as_ref(), self.graph.as_deref(), self.collection(partition), agent_id, dim, budget).await
    }

    /// Pattern mining, run standalone (dream also runs it as an
    /// optional phase when budget allows).
    pub async fn mine_patterns(&self, partition: Partition) -> Result<MiningReport> {
        pattern_miner::run(self.vector_store.as_ref(), self.graph.as_deref(), self.collection(partition)).await
    }

    /// Lesson detection is pure and synchronous.
    pub fn detect_lesson(&self, text: &str, context: &str) -> Option<DetectedLesson> {
        lesson::detect_lesson(text, context)
    }

    pub async fn persist_lesson(&self, lesson: &DetectedLesson, seen: &mut HashMap<String, Uuid>) -> Result<Option<Uuid>> {
        let vector = self.embedder.embed(&lesson.correction).await?;
        lesson::persist_lesson(self.vector_store.as_ref(), self.collection(Partition::Shared), lesson, &vector, seen).await
    }

    /// Abstract a mining report's qualifying clusters/recurring-errors/
    /// co-occurrences into lessons, skipping any whose deterministic id
    /// already exists (idempotent across reruns, per (L3)).
    pub async fn abstract_mining_report(&self, mining: &MiningReport) -> Result<usize> {
        let collection = self.collection(Partition::Shared);
        let mut persisted = 0;
        for (id, text) in lesson::abstractions_for(mining) {
            if self.vector_store.get(collection, id).await?.is_some() {
                continue;
            }
            let vector = self.embedder.embed(&text).await?;
            lesson::persist_abstraction(self.vector_store.as_ref(), collection, id, text, &vector).await?;
            persisted += 1;
        }
        Ok(persisted)
    }

    /// Feedback loop over the last returned result list.
    pub async fn apply_feedback(&self, partition: Partition, recalled: &[MemoryCell], response: &str) -> Result<Vec<FeedbackOutcome>> {
        feedback::apply(self.vector_store.as_ref(), self.collection(partition), recalled, response).await
    }

    /// Re-fetch cells by id, for callers (like the CLI) that only kept the
    /// ids from a prior recall and need the full cell back for feedback.
    /// Ids the store no longer has are silently dropped.
    pub async fn get_cells(&self, partition: Partition, ids: &[Uuid]) -> Result<Vec<MemoryCell>> {
        let collection = self.collection(partition);
        let mut cells = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(payload) = self.vector_store.get(collection, *id).await? {
                match serde_json::from_value::<MemoryCell>(payload) {
                    Ok(cell) => cells.push(cell),
                    Err(err) => warn!(cell_id = %id, error = %err, "dropping malformed cell on re-fetch"),
                }
            }
        }
        Ok(cells)
    }

    /// Shared block manager, always in the shared partition.
    pub async fn get_shared_block(&self, name: &str) -> Result<Option<serde_json::Value>> {
        shared_block::get(self.vector_store.as_ref(), self.collection(Partition::Shared), name).await
    }

    pub async fn set_shared_block(&self, name: &str, content: &str, writer: &str) -> Result<u64> {
        let vector = self.embedder.embed(content).await?;
        shared_block::set(self.vector_store.as_ref(), self.collection(Partition::Shared), name, content, &vector, writer).await
    }

    pub async fn delete_shared_block(&self, name: &str) -> Result<()> {
        shared_block::delete(self.vector_store.as_ref(), self.collection(Partition::Shared), name).await
    }

    pub async fn list_shared_blocks(&self) -> Result<Vec<serde_json::Value>> {
        shared_block::list(self.vector_store.as_ref(), self.collection(Partition::Shared)).await
    }

    /// Best-effort bidirectional re-link for cells auto-link left dangling:
    /// peer-patch failures from the original pass are retried on the next
    /// maintenance cycle.
    pub async fn retry_auto_link(&self, partition: Partition, cell_id: Uuid, vector: &[f32]) -> Result<usize> {
        let outcome = autolink::link_new_cell(
            self.vector_store.as_ref(),
            self.collection(partition),
            cell_id,
            vector,
            self.config.auto_link.threshold,
            self.config.auto_link.top_k,
        )
        .await?;
        Ok(outcome.peer_patch_failures.len())
    }

    /// Lazily learn the embedding service's vector dimension from a real
    /// call, so the dream marker's placeholder vector matches it exactly.
    async fn embedding_dim(&self) -> Result<usize> {
        if let Some(dim) = *self.embedding_dim.lock().unwrap() {
            return Ok(dim);
        }
        let probe = self.embedder.embed("dream-cycle-dimension-probe").await?;
        let dim = probe.len();
        *self.embedding_dim.lock().unwrap() = Some(dim);
        Ok(dim)
    }
}
