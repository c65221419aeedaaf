//! Vector store adapter.
//!
//! Typed operations over the external vector database's REST contract.
//! Every method times out, surfaces non-2xx as a [`MemoryError::Transport`],
//! and never mutates caller inputs — payloads are built fresh from borrowed
//! data on every call.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::{MemoryError, Result, map_reqwest_err};
use crate::schema::{Classification, Partition};

const ADAPTER: &str = "vector_store";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A conjunctive filter translated to the backend's predicate language.
/// `deleted=false` is ANDed in automatically by [`VectorStoreClient::search`]
/// and [`VectorStoreClient::scroll`] unless the caller already specified a
/// `deleted` key.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Filters(pub HashMap<String, Value>);

impl Filters {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    fn to_qdrant_filter(&self) -> Value {
        let mut must: Vec<Value> = self
            .0
            .iter()
            .map(|(k, v)| json!({"key": k, "match": {"value": v}}))
            .collect();
        if !self.0.contains_key("deleted") {
            must.push(json!({"key": "deleted", "match": {"value": false}}));
        }
        json!({"must": must})
    }
}

#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: Uuid,
    pub score: f32,
    pub payload: Value,
    /// Present when the operation requested vectors (`scroll`); absent from
    /// `search` hits, which only need to return enough to hydrate a cell.
    pub vector: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct ScrollPage {
    pub points: Vec<ScoredPoint>,
    pub next_offset: Option<Value>,
}

/// Partition → collection name resolution, per the four logical partitions
/// the engine owns.
pub fn collection_name(collections: &memory_config::CollectionNames, partition: Partition) -> &str {
    match partition {
        Partition::Shared => &collections.shared,
        Partition::Private => &collections.private,
        Partition::Profiles => &collections.profiles,
        Partition::Skills => &collections.skills,
    }
}

/// Resolve the partition for a cell about to be stored: a
/// `secret` classification never resolves to a partition.
pub fn partition_for(classification: Classification) -> Result<Partition> {
    match classification {
        Classification::Secret => Err(MemoryError::Policy("secret content may never be stored")),
        Classification::Private => Ok(Partition::Private),
        Classification::Public => Ok(Partition::Shared),
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, collection: &str, id: Uuid, vector: &[f32], payload: Value) -> Result<()>;
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        min_score: Option<f32>,
        filters: &Filters,
    ) -> Result<Vec<ScoredPoint>>;
    async fn scroll(
        &self,
        collection: &str,
        batch_size: usize,
        offset: Option<Value>,
        filters: &Filters,
    ) -> Result<ScrollPage>;
    async fn patch(&self, collection: &str, id: Uuid, payload_patch: Value) -> Result<()>;
    async fn get(&self, collection: &str, id: Uuid) -> Result<Option<Value>>;
    async fn soft_delete(&self, collection: &str, id: Uuid) -> Result<()> {
        self.patch(collection, id, json!({"deleted": true, "updated_at": chrono::Utc::now()}))
            .await
    }
    async fn count(&self, collection: &str) -> Result<u64>;
    async fn ensure_text_index(&self, collection: &str, field: &str) -> Result<()>;
}

/// HTTP client over the Qdrant-compatible REST contract.
#[derive(Debug, Clone)]
pub struct HttpVectorStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVectorStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client build");
        Self { client, base_url: base_url.into() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    id: Value,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    vector: Option<Vec<f32>>,
}

#[derive(Deserialize)]
struct ScrollResponse {
    result: ScrollResult,
}

#[derive(Deserialize)]
struct ScrollResult {
    points: Vec<SearchHit>,
    #[serde(default)]
    next_page_offset: Option<Value>,
}

#[derive(Deserialize)]
struct GetResponse {
    result: GetResult,
}

#[derive(Deserialize)]
struct GetResult {
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct CountResponse {
    result: CountResult,
}

#[derive(Deserialize)]
struct CountResult {
    points_count: u64,
}

fn parse_id(value: &Value) -> Result<Uuid> {
    value
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| MemoryError::data(ADAPTER, "point id was not a UUID string"))
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn upsert(&self, collection: &str, id: Uuid, vector: &[f32], payload: Value) -> Result<()> {
        let body = json!({
            "wait": true,
            "points": [{"id": id.to_string(), "vector": vector, "payload": payload}],
        });
        let resp = self
            .client
            .put(self.url(&format!("/collections/{collection}/points")))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_err(ADAPTER, e))?;
        if !resp.status().is_success() {
            return Err(MemoryError::transport(ADAPTER, format!("upsert status {}", resp.status())));
        }
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
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
            "filter": filters.to_qdrant_filter(),
        });
        if let Some(min_score) = min_score {
            body["score_threshold"] = json!(min_score);
        }
        let resp = self
            .client
            .post(self.url(&format!("/collections/{collection}/points/search")))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_err(ADAPTER, e))?;
        if !resp.status().is_success() {
            return Err(MemoryError::transport(ADAPTER, format!("search status {}", resp.status())));
        }
        let parsed: SearchResponse = resp
            .json()
            .await
            .map_err(|e| map_reqwest_err(ADAPTER, e))?;
        parsed
            .result
            .into_iter()
            .map(|hit| Ok(ScoredPoint { id: parse_id(&hit.id)?, score: hit.score, payload: hit.payload, vector: hit.vector }))
            .collect()
    }

    async fn scroll(
        &self,
        collection: &str,
        batch_size: usize,
        offset: Option<Value>,
        filters: &Filters,
    ) -> Result<ScrollPage> {
        let mut body = json!({
            "limit": batch_size,
            "with_payload": true,
            "with_vector": true,
            "filter": filters.to_qdrant_filter(),
        });
        if let Some(offset) = offset {
            body["offset"] = offset;
        }
        let resp = self
            .client
            .post(self.url(&format!("/collections/{collection}/points/scroll")))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_err(ADAPTER, e))?;
        if !resp.status().is_success() {
            return Err(MemoryError::transport(ADAPTER, format!("scroll status {}", resp.status())));
        }
        let parsed: ScrollResponse = resp
            .json()
            .await
            .map_err(|e| map_reqwest_err(ADAPTER, e))?;
        let points = parsed
            .result
            .points
            .into_iter()
            .map(|hit| Ok(ScoredPoint { id: parse_id(&hit.id)?, score: hit.score, payload: hit.payload, vector: hit.vector }))
            .collect::<Result<Vec<_>>>()?;
        Ok(ScrollPage { points, next_offset: parsed.result.next_page_offset })
    }

    async fn patch(&self, collection: &str, id: Uuid, payload_patch: Value) -> Result<()> {
        let body = json!({
            "wait": true,
            "points": [id.to_string()],
            "payload": payload_patch,
        });
        let resp = self
            .client
            .post(self.url(&format!("/collections/{collection}/points/payload")))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_err(ADAPTER, e))?;
        if !resp.status().is_success() {
            return Err(MemoryError::transport(ADAPTER, format!("patch status {}", resp.status())));
        }
        Ok(())
    }

    async fn get(&self, collection: &str, id: Uuid) -> Result<Option<Value>> {
        let resp = self
            .client
            .get(self.url(&format!("/collections/{collection}/points/{id}")))
            .send()
            .await
            .map_err(|e| map_reqwest_err(ADAPTER, e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(MemoryError::transport(ADAPTER, format!("get status {}", resp.status())));
        }
        let parsed: GetResponse = resp
            .json()
            .await
            .map_err(|e| map_reqwest_err(ADAPTER, e))?;
        Ok(Some(parsed.result.payload))
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        let resp = self
            .client
            .get(self.url(&format!("/collections/{collection}")))
            .send()
            .await
            .map_err(|e| map_reqwest_err(ADAPTER, e))?;
        if !resp.status().is_success() {
            return Err(MemoryError::transport(ADAPTER, format!("count status {}", resp.status())));
        }
        let parsed: CountResponse = resp
            .json()
            .await
            .map_err(|e| map_reqwest_err(ADAPTER, e))?;
        Ok(parsed.result.points_count)
    }

    async fn ensure_text_index(&self, collection: &str, field: &str) -> Result<()> {
        let body = json!({
            "field_name": field,
            "field_schema": {
                "type": "text",
                "tokenizer": "word",
                "min_token_len": 2,
                "max_token_len": 40,
                "lowercase": true,
            },
        });
        let resp = self
            .client
            .put(self.url(&format!("/collections/{collection}/index")))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_err(ADAPTER, e))?;
        // Idempotent: a 4xx "already exists" is not a failure.
        if resp.status().is_server_error() {
            return Err(MemoryError::transport(ADAPTER, format!("index status {}", resp.status())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_never_resolves_to_a_partition() {
        assert!(partition_for(Classification::Secret).is_err());
    }

    #[test]
    fn public_and_private_map_to_expected_partitions() {
        assert_eq!(partition_for(Classification::Public).unwrap(), Partition::Shared);
        assert_eq!(partition_for(Classification::Private).unwrap(), Partition::Private);
    }

    #[test]
    fn filters_and_in_deleted_false_by_default() {
        let filters = Filters::new().with("agent_id", "a1");
        let filter = filters.to_qdrant_filter();
        let must = filter["must"].as_array().unwrap();
        assert!(must.iter().any(|clause| clause["key"] == "deleted"));
    }

    #[test]
    fn filters_respect_explicit_deleted_override() {
        let filters = Filters::new().with("deleted", true);
        let filter = filters.to_qdrant_filter();
        let must = filter["must"].as_array().unwrap();
        let deleted_clauses: Vec<_> = must.iter().filter(|c| c["key"] == "deleted").collect();
        assert_eq!(deleted_clauses.len(), 1);
    }
}
