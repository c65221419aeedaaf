//! Graph adapter.
//!
//! Typed operations over an external Cypher-style graph store, reached
//! through a small REST contract the engine controls (one request per
//! operation, JSON bodies). Relationship types are validated before they
//! ever reach a query string.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::{MemoryError, Result, map_reqwest_err};

const ADAPTER: &str = "graph";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_SHORTEST_PATH_DEPTH: u32 = 10;
const MAX_TIMELINE_LIMIT: usize = 100;

static RELATIONSHIP_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z0-9_]+$").unwrap());

/// Validate a relationship type: `[A-Z0-9_]+`, to block
/// injection into whatever query language the backend speaks.
pub fn validate_relationship_type(rel_type: &str) -> Result<()> {
    if RELATIONSHIP_TYPE_RE.is_match(rel_type) {
        Ok(())
    } else {
        Err(MemoryError::Policy("relationship type must match [A-Z0-9_]+"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum EntityType {
    Person,
    Organization,
    Project,
    Location,
    Technology,
    Memory,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityNode {
    pub name: String,
    pub entity_type: EntityType,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub props: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub rel_type: String,
    pub since: DateTime<Utc>,
    pub confidence: Option<f32>,
    pub last_seen: DateTime<Utc>,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_entity(&self, name: &str, entity_type: EntityType, props: Value) -> Result<EntityNode>;
    async fn upsert_edge(&self, from: &str, to: &str, rel_type: &str, props: Value) -> Result<()>;
    async fn neighbors(&self, name: &str, limit: usize) -> Result<Vec<EntityNode>>;
    async fn shortest_path(&self, a: &str, b: &str, max_depth: u32) -> Result<Option<Vec<String>>>;
    async fn timeline(&self, name: &str, limit: usize) -> Result<Vec<GraphEdge>>;
    async fn temporal_query(&self, name: &str, as_of: NaiveDate) -> Result<Vec<GraphEdge>>;

    /// Ingest a memory cell as a `Memory` node: `MENTIONS` edges to each
    /// entity (auto-extracted if `entities` is empty) and one `CREATED_BY`
    /// edge to the owning agent.
    async fn ingest_memory(
        &self,
        id: Uuid,
        text: &str,
        entities: &[String],
        agent_id: &str,
        event_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let now = Utc::now();
        self.upsert_entity(
            &id.to_string(),
            EntityType::Memory,
            json!({"text": text, "agent_id": agent_id, "event_time": event_time, "ingested_at": now}),
        )
        .await?;

        let resolved_entities: Vec<String> = if entities.is_empty() {
            crate::classify::extract_entities(text)
        } else {
            entities.to_vec()
        };
        for entity in &resolved_entities {
            self.upsert_entity(entity, EntityType::Other, json!({})).await?;
            self.upsert_edge(&id.to_string(), entity, "MENTIONS", json!({"since": now})).await?;
        }

        self.upsert_entity(agent_id, EntityType::Person, json!({})).await?;
        self.upsert_edge(&id.to_string(), agent_id, "CREATED_BY", json!({"since": now})).await?;
        Ok(())
    }
}

pub struct HttpGraphStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGraphStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("reqwest client build");
        Self { client, base_url: base_url.into() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post<T: serde::de::DeserializeOwned>(&self, path: &str, body: Value) -> Result<T> {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_err(ADAPTER, e))?;
        if !resp.status().is_success() {
            return Err(MemoryError::transport(ADAPTER, format!("{path} status {}", resp.status())));
        }
        resp.json().await.map_err(|e| map_reqwest_err(ADAPTER, e))
    }
}

#[async_trait]
impl GraphStore for HttpGraphStore {
    async fn upsert_entity(&self, name: &str, entity_type: EntityType, props: Value) -> Result<EntityNode> {
        self.post(
            "/entities/upsert",
            json!({"name": name, "entity_type": entity_type, "props": props}),
        )
        .await
    }

    async fn upsert_edge(&self, from: &str, to: &str, rel_type: &str, props: Value) -> Result<()> {
        validate_relationship_type(rel_type)?;
        let _: Value = self
            .post("/edges/upsert", json!({"from": from, "to": to, "rel_type": rel_type, "props": props}))
            .await?;
        Ok(())
    }

    async fn neighbors(&self, name: &str, limit: usize) -> Result<Vec<EntityNode>> {
        self.post("/entities/neighbors", json!({"name": name, "limit": limit})).await
    }

    async fn shortest_path(&self, a: &str, b: &str, max_depth: u32) -> Result<Option<Vec<String>>> {
        let max_depth = max_depth.min(MAX_SHORTEST_PATH_DEPTH);
        self.post("/paths/shortest", json!({"from": a, "to": b, "max_depth": max_depth})).await
    }

    async fn timeline(&self, name: &str, limit: usize) -> Result<Vec<GraphEdge>> {
        let limit = limit.min(MAX_TIMELINE_LIMIT);
        self.post("/entities/timeline", json!({"name": name, "limit": limit})).await
    }

    async fn temporal_query(&self, name: &str, as_of: NaiveDate) -> Result<Vec<GraphEdge>> {
        self.post("/entities/temporal", json!({"name": name, "as_of": as_of})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uppercase_underscore_relationship_type_is_valid() {
        assert!(validate_relationship_type("MENTIONS").is_ok());
        assert!(validate_relationship_type("CREATED_BY").is_ok());
        assert!(validate_relationship_type("WORKS_WITH_2").is_ok());
    }

    #[test]
    fn lowercase_or_punctuated_relationship_type_is_rejected() {
        assert!(validate_relationship_type("mentions").is_err());
        assert!(validate_relationship_type("CREATED-BY").is_err());
        assert!(validate_relationship_type("DROP TABLE;").is_err());
    }
}
