//! Layered retrieval cache.
//!
//! L1 is an in-process bounded LRU. L2 is an external KV store reached over
//! HTTP, namespaced so the engine can share the backing store with other
//! tenants. L2 is always best-effort: any transport failure degrades
//! silently to "miss" or "no-op", and L1 keeps serving on its own.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

const L1_CAPACITY: usize = 50;
const L1_TTL: Duration = Duration::from_secs(5 * 60);
const L2_TTL_SECONDS: u64 = 60 * 60;
const ADAPTER: &str = "cache";

/// Build the cache key: `lowercase(trim(query)) | limit | minScore`.
pub fn cache_key(query: &str, limit: usize, min_score: Option<f32>) -> String {
    let normalized = query.trim().to_lowercase();
    let min_score = min_score.map(|s| format!("{s:.3}")).unwrap_or_else(|| "none".to_string());
    format!("{normalized}|{limit}|{min_score}")
}

#[async_trait]
pub trait ExternalKv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()>;
    /// Flush every key under this cache's namespace.
    async fn flush(&self) -> Result<()>;
}

pub struct HttpExternalKv {
    client: reqwest::Client,
    base_url: String,
    namespace: &'static str,
}

impl HttpExternalKv {
    pub fn new(base_url: impl Into<String>, namespace: &'static str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .expect("reqwest client build");
        Self { client, base_url: base_url.into(), namespace }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

#[derive(Deserialize)]
struct KvGetResponse {
    value: Option<String>,
}

#[async_trait]
impl ExternalKv for HttpExternalKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let url = format!("{}/kv/{}", self.base_url.trim_end_matches('/'), self.namespaced(key));
        let resp = self.client.get(url).send().await.map_err(|e| crate::error::map_reqwest_err(ADAPTER, e))?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let parsed: KvGetResponse = resp.json().await.map_err(|e| crate::error::map_reqwest_err(ADAPTER, e))?;
        Ok(parsed.value)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let url = format!("{}/kv/{}", self.base_url.trim_end_matches('/'), self.namespaced(key));
        #[derive(Serialize)]
        struct Body<'a> {
            value: &'a str,
            ttl_seconds: u64,
        }
        self.client
            .put(url)
            .json(&Body { value, ttl_seconds })
            .send()
            .await
            .map_err(|e| crate::error::map_reqwest_err(ADAPTER, e))?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let url = format!("{}/kv/{}/*", self.base_url.trim_end_matches('/'), self.namespace);
        self.client.delete(url).send().await.map_err(|e| crate::error::map_reqwest_err(ADAPTER, e))?;
        Ok(())
    }
}

struct L1Entry {
    value: String,
    inserted_at: Instant,
}

/// Layered lookup/store/invalidate over L1 (in-process LRU) and an optional
/// L2 ([`ExternalKv`]).
pub struct LayeredCache {
    l1: Mutex<LruCache<String, L1Entry>>,
    l2: Option<Box<dyn ExternalKv>>,
}

impl LayeredCache {
    pub fn new(l2: Option<Box<dyn ExternalKv>>) -> Self {
        Self { l1: Mutex::new(LruCache::new(NonZeroUsize::new(L1_CAPACITY).unwrap())), l2 }
    }

    /// L1 → L2; a serving L2 hit is promoted back into L1.
    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.l1_get(key) {
            return Some(value);
        }
        let Some(l2) = &self.l2 else { return None };
        match l2.get(key).await {
            Ok(Some(value)) => {
                self.l1_put(key, value.clone());
                Some(value)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "cache L2 get failed, degrading to miss");
                None
            }
        }
    }

    /// Write-through to both layers. L2 failures are logged and swallowed.
    pub async fn put(&self, key: &str, value: String) {
        self.l1_put(key, value.clone());
        if let Some(l2) = &self.l2 {
            if let Err(err) = l2.set(key, &value, L2_TTL_SECONDS).await {
                warn!(error = %err, "cache L2 set failed, L1 still serves");
            }
        }
    }

    /// Flush-all on an `invalidate` bus event. The cache never tries to map
    /// a memory id back to the query keys that might reference it — it
    /// invalidates broadly instead.
    pub async fn invalidate_all(&self) {
        self.l1.lock().clear();
        if let Some(l2) = &self.l2 {
            if let Err(err) = l2.flush().await {
                warn!(error = %err, "cache L2 flush failed");
            }
        }
    }

    fn l1_get(&self, key: &str) -> Option<String> {
        let mut l1 = self.l1.lock();
        // `peek`, not `get` — spec calls for insertion-order eviction, which
        // a read must not disturb by promoting the entry to MRU.
        let entry = l1.peek(key)?;
        if entry.inserted_at.elapsed() > L1_TTL {
            l1.pop(key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn l1_put(&self, key: &str, value: String) {
        self.l1.lock().put(key.to_string(), L1Entry { value, inserted_at: Instant::now() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_normalizes_query_and_includes_params() {
        let a = cache_key("  Rust Ownership  ", 10, Some(0.5));
        let b = cache_key("rust ownership", 10, Some(0.5));
        assert_eq!(a, b);
    }

    #[test]
    fn cache_key_differs_on_limit() {
        assert_ne!(cache_key("x", 10, None), cache_key("x", 20, None));
    }

    #[tokio::test]
    async fn l1_only_cache_serves_without_l2() {
        let cache = LayeredCache::new(None);
        let key = cache_key("hello", 10, None);
        assert!(cache.get(&key).await.is_none());
        cache.put(&key, "result".to_string()).await;
        assert_eq!(cache.get(&key).await, Some("result".to_string()));
    }

    #[tokio::test]
    async fn invalidate_all_clears_l1() {
        let cache = LayeredCache::new(None);
        let key = cache_key("hello", 10, None);
        cache.put(&key, "result".to_string()).await;
        cache.invalidate_all().await;
        assert!(cache.get(&key).await.is_none());
    }
}
