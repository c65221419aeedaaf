//! Shared blocks.
//!
//! Versioned, at-most-one-live-cell-per-name blocks living in the shared
//! partition. The deterministic id plus monotonic version increment
//! together guarantee: no two live writers can diverge on a name.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::Result;
use crate::vector_store::{Filters, VectorStore};

const LIST_LIMIT: usize = 100;

/// First 32 hex chars of SHA-256(`shared_block:<name>`), formatted as a
/// UUID. Deterministic so `get`/`set`/`delete` for the same name always
/// touch the same point.
pub fn deterministic_id(name: &str) -> Uuid {
    let digest = Sha256::digest(format!("shared_block:{name}").as_bytes());
    let hex = format!("{digest:x}");
    let hex32 = &hex[..32];
    Uuid::parse_str(&format!(
        "{}-{}-{}-{}-{}",
        &hex32[0..8],
        &hex32[8..12],
        &hex32[12..16],
        &hex32[16..20],
        &hex32[20..32],
    ))
    .expect("32 hex chars always format into a UUID")
}

fn block_filters(name: &str) -> Filters {
    Filters::new()
        .with("scope", "shared_block")
        .with("block_name", name)
}

pub async fn get(store: &dyn VectorStore, collection: &str, name: &str) -> Result<Option<serde_json::Value>> {
    let page = store.scroll(collection, 1, None, &block_filters(name)).await?;
    Ok(page.points.into_iter().next().map(|p| p.payload))
}

/// Write (or overwrite) the block, bumping its version and last-writer.
pub async fn set(
    store: &dyn VectorStore,
    collection: &str,
    name: &str,
    content: &str,
    embedding: &[f32],
    writer: &str,
) -> Result<u64> {
    let id = deterministic_id(name);
    let existing_version = get(store, collection, name)
        .await?
        .and_then(|payload| payload.get("block_version").and_then(|v| v.as_u64()))
        .unwrap_or(0);
    let version = existing_version + 1;

    let payload = serde_json::json!({
        "content": content,
        "block_name": name,
        "block_version": version,
        "last_writer": writer,
        "memory_type": "core",
        "classification": "public",
        "scope": "shared_block",
        "confidence": 1.0,
        "priority": 0.9,
        "importance": 0.9,
        "access_count": version,
        "deleted": false,
        "updated_at": chrono::Utc::now(),
    });

    store.upsert(collection, id, embedding, payload).await?;
    Ok(version)
}

pub async fn delete(store: &dyn VectorStore, collection: &str, name: &str) -> Result<()> {
    let id = deterministic_id(name);
    store.soft_delete(collection, id).await
}

pub async fn list(store: &dyn VectorStore, collection: &str) -> Result<Vec<serde_json::Value>> {
    let filters = Filters::new().with("scope", "shared_block");
    let page = store.scroll(collection, LIST_LIMIT, None, &filters).await?;
    Ok(page.points.into_iter().map(|p| p.payload).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_id_is_stable_for_same_name() {
        assert_eq!(deterministic_id("agent-constitution"), deterministic_id("agent-constitution"));
    }

    #[test]
    fn deterministic_id_differs_across_names() {
        assert_ne!(deterministic_id("a"), deterministic_id("b"));
    }
}
