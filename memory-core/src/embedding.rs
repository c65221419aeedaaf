//! Embedding client.
//!
//! Wraps the external embedding service behind a bounded LRU cache keyed by
//! content hash, so identical text captured twice in the same process never
//! pays for a second round trip. Accepts both response shapes in the wild:
//! an OpenAI-compatible `{"data": [{"embedding": [...]}]}` envelope and a
//! bare `{"embedding": [...]}` single-vector shape.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{MemoryError, Result, map_reqwest_err};

const ADAPTER: &str = "embedding";
const EMBED_TIMEOUT: Duration = Duration::from_secs(10);
const CACHE_CAPACITY: usize = 512;
const CACHE_TTL: Duration = Duration::from_secs(300);

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

fn content_key(text: &str) -> [u8; 32] {
    Sha256::digest(text.as_bytes()).into()
}

struct CacheEntry {
    vector: Vec<f32>,
    inserted_at: Instant,
}

/// HTTP client over the embedding service, fronted by a 512-entry / 5-minute
/// LRU cache keyed by content hash.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    cache: Mutex<LruCache<[u8; 32], CacheEntry>>,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(EMBED_TIMEOUT)
            .build()
            .expect("reqwest client build");
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
        }
    }

    fn url(&self) -> String {
        format!("{}/embeddings", self.base_url.trim_end_matches('/'))
    }

    fn cache_get(&self, key: &[u8; 32]) -> Option<Vec<f32>> {
        let mut cache = self.cache.lock();
        // `peek`, not `get` — a read must not promote the entry to
        // most-recently-used, or eviction stops being insertion-ordered.
        let entry = cache.peek(key)?;
        if entry.inserted_at.elapsed() > CACHE_TTL {
            cache.pop(key);
            return None;
        }
        Some(entry.vector.clone())
    }

    fn cache_put(&self, key: [u8; 32], vector: Vec<f32>) {
        self.cache.lock().put(key, CacheEntry { vector, inserted_at: Instant::now() });
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingResponse {
    OpenAiCompatible { data: Vec<OpenAiDatum> },
    Bare { embedding: Vec<f32> },
}

#[derive(Deserialize)]
struct OpenAiDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = content_key(text);
        if let Some(vector) = self.cache_get(&key) {
            return Ok(vector);
        }

        let body = json!({"model": self.model, "input": text});
        let resp = self
            .client
            .post(self.url())
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_err(ADAPTER, e))?;
        if !resp.status().is_success() {
            return Err(MemoryError::transport(ADAPTER, format!("embed status {}", resp.status())));
        }
        let parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| map_reqwest_err(ADAPTER, e))?;
        let vector = match parsed {
            EmbeddingResponse::OpenAiCompatible { data } => data
                .into_iter()
                .next()
                .map(|d| d.embedding)
                .ok_or_else(|| MemoryError::data(ADAPTER, "empty `data` array"))?,
            EmbeddingResponse::Bare { embedding } => embedding,
        };
        if vector.is_empty() {
            return Err(MemoryError::data(ADAPTER, "embedding vector was empty"));
        }

        self.cache_put(key, vector.clone());
        Ok(vector)
    }
}

/// Cosine similarity between two equal-length embedding vectors. Returns 0.0
/// for mismatched lengths or zero-magnitude vectors rather than panicking.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_mismatched_lengths_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0, 2.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn content_key_is_deterministic() {
        assert_eq!(content_key("hello"), content_key("hello"));
        assert_ne!(content_key("hello"), content_key("world"));
    }
}
