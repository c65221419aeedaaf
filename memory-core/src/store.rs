//! Store orchestrator: the 11-step write path. Every adapter
//! call past step 2 is best-effort except the embed and the primary upsert
//! — those two define whether the cell exists at all.

use chrono::Utc;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::autolink::{self, AutoLinkOutcome};
use crate::broadcast::{self, PubSubBus};
use crate::cache::LayeredCache;
use crate::classify::{self, ClassificationResult};
use crate::dedup::{self, DedupOutcome};
use crate::embedding::Embedder;
use crate::error::Result;
use crate::graph::GraphStore;
use crate::keyword_index::KeywordIndex;
use crate::schema::{BroadcastEvent, BroadcastMessage, Classification, MemoryCell, Scope};
use crate::vector_store::{Filters, VectorStore, collection_name, partition_for};

const DEDUP_SEARCH_THRESHOLD: f32 = 0.85;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreAction {
    Created,
    Merged,
    Duplicate,
    BlockedSecret,
    ConflictFlagged,
}

pub struct StoreOutcome {
    pub action: StoreAction,
    pub cell: Option<MemoryCell>,
}

pub struct StoreRequest {
    pub content: String,
    pub agent_id: String,
    pub user_id: Option<String>,
    pub context_hint_private: bool,
    pub extra_entities: Vec<String>,
}

pub struct StoreOrchestrator<'a> {
    pub embedder: &'a dyn Embedder,
    pub vector_store: &'a dyn VectorStore,
    pub keyword_index: &'a KeywordIndex,
    pub cache: &'a LayeredCache,
    pub graph: Option<&'a dyn GraphStore>,
    pub bus: Option<&'a dyn PubSubBus>,
    pub collections: &'a memory_config::CollectionNames,
    pub auto_link: &'a memory_config::AutoLinkConfig,
}

impl<'a> StoreOrchestrator<'a> {
    #[instrument(skip(self, request), fields(agent_id = %request.agent_id))]
    pub async fn store(&self, request: StoreRequest) -> Result<StoreOutcome> {
        // 1. security classify; secret is terminal
        let classification: ClassificationResult = classify::classify(&request.content, request.context_hint_private);
        if classification.classification == Classification::Secret {
            return Ok(StoreOutcome { action: StoreAction::BlockedSecret, cell: None });
        }

        let partition = partition_for(classification.classification)?;
        let collection = collection_name(self.collections, partition);

        // 2. embed
        let vector = self.embedder.embed(&request.content).await?;

        // build the candidate cell up front; id may be replaced by a merge
        // target id after step 3.
        let mut cell = MemoryCell::new(request.content.clone(), request.agent_id.clone());
        cell.user_id = request.user_id.clone();
        cell.classification = classification.classification;
        cell.memory_type = classification.memory_type;
        cell.urgency = classification.urgency;
        cell.domain = classification.domain;
        cell.category = classification.category.clone();
        cell.priority = classification.priority;
        cell.scope = match partition {
            crate::schema::Partition::Shared | crate::schema::Partition::Profiles | crate::schema::Partition::Skills => {
                Scope::Public
            }
            crate::schema::Partition::Private => Scope::Private,
        };
        cell.clamp_confidence();

        // 3. dedup against the same partition
        let neighbors = self
            .vector_store
            .search(collection, &vector, 1, Some(DEDUP_SEARCH_THRESHOLD), &Filters::new())
            .await?;

        if let Some(neighbor) = neighbors.into_iter().next() {
            if let Ok(existing) = serde_json::from_value::<MemoryCell>(neighbor.payload) {
                if dedup::hashes_match(&cell.content, &existing.content) {
                    return Ok(StoreOutcome { action: StoreAction::Duplicate, cell: None });
                }
                let outcome = dedup::evaluate(&cell, &existing, neighbor.score);
                match outcome {
                    DedupOutcome::Merge { existing_id, merged } => {
                        cell.importance = merged.importance;
                        cell.access_count = merged.access_count;
                        cell.linked_memories = merged.linked_memories;
                        cell.metadata.insert("merged_from".to_string(), serde_json::json!(merged.merged_from));
                        cell.metadata.insert("merged_preview".to_string(), serde_json::json!(merged.old_text_preview));
                        let mut outcome = self
                            .persist_new_cell(collection, &mut cell, &vector, &classification, &request.extra_entities)
                            .await?;
                        if let Err(err) = self.vector_store.soft_delete(collection, existing_id).await {
                            warn!(existing_id = %existing_id, error = %err, "failed soft-deleting merged-away cell");
                        }
                        self.keyword_index.remove(existing_id);
                        outcome.action = StoreAction::Merged;
                        return Ok(outcome);
                    }
                    DedupOutcome::DuplicateDifferentType { .. } => {
                        return Ok(StoreOutcome { action: StoreAction::Duplicate, cell: None });
                    }
                    DedupOutcome::Conflict { existing_id, reason } => {
                        self.publish_conflict(&cell, existing_id, &reason).await;
                        // conflict emission does not block storage: the cell
                        // is still persisted, flagged for later review.
                        let mut outcome = self
                            .persist_new_cell(collection, &mut cell, &vector, &classification, &request.extra_entities)
                            .await?;
                        outcome.action = StoreAction::ConflictFlagged;
                        return Ok(outcome);
                    }
                    DedupOutcome::New => {}
                }
            }
        }

        let outcome = self
            .persist_new_cell(collection, &mut cell, &vector, &classification, &request.extra_entities)
            .await?;
        Ok(outcome)
    }

    async fn persist_new_cell(
        &self,
        collection: &str,
        cell: &mut MemoryCell,
        vector: &[f32],
        classification: &ClassificationResult,
        extra_entities: &[String],
    ) -> Result<StoreOutcome> {
        // 4. union locally-extracted entities with any enrichment-service result
        let mut entities = classification.entities.clone();
        entities.extend(extra_entities.iter().cloned());
        entities.sort();
        entities.dedup();

        // 5. serialize, 6. upsert
        let payload = serde_json::to_value(&*cell).map_err(|e| crate::error::MemoryError::data("store", e.to_string()))?;
        self.vector_store.upsert(collection, cell.id, vector, payload).await?;

        // 7. auto-link, best-effort, skipped entirely when disabled
        if self.auto_link.enabled {
            let AutoLinkOutcome { new_cell_links, .. } = autolink::link_new_cell(
                self.vector_store,
                collection,
                cell.id,
                vector,
                self.auto_link.threshold,
                self.auto_link.top_k,
            )
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "auto-link failed, continuing without links");
                AutoLinkOutcome { new_cell_links: Vec::new(), peer_patch_failures: Vec::new() }
            });
            cell.linked_memories = new_cell_links;
        }

        // 8. graph ingest, best-effort
        if let Some(graph) = self.graph {
            if let Err(err) = graph.ingest_memory(cell.id, &cell.content, &entities, &cell.agent_id, cell.event_time).await {
                warn!(error = %err, "graph ingest failed, continuing");
            }
        }

        // 9. broadcast new_memory, best-effort
        if let Some(bus) = self.bus {
            let message = BroadcastMessage {
                memory_id: cell.id,
                agent_id: cell.agent_id.clone(),
                memory_type: cell.memory_type,
                scope: cell.scope,
                text_preview: cell.content.chars().take(120).collect(),
                event: BroadcastEvent::NewMemory,
                linked_count: cell.linked_memories.len(),
                timestamp: Utc::now(),
            };
            broadcast::publish_best_effort(bus, &message).await;
        }

        // 10. broad cache invalidate, best-effort
        self.cache.invalidate_all().await;

        // 11. keyword index
        self.keyword_index.add(cell.id, &cell.content);

        Ok(StoreOutcome { action: StoreAction::Created, cell: Some(cell.clone()) })
    }

    async fn publish_conflict(&self, cell: &MemoryCell, existing_id: Uuid, reason: &str) {
        let Some(bus) = self.bus else { return };
        let message = BroadcastMessage {
            memory_id: cell.id,
            agent_id: cell.agent_id.clone(),
            memory_type: cell.memory_type,
            scope: cell.scope,
            text_preview: format!("conflict with {existing_id}: {reason}"),
            event: BroadcastEvent::ConflictResolved,
            linked_count: 0,
            timestamp: Utc::now(),
        };
        broadcast::publish_best_effort(bus, &message).await;
    }
}
