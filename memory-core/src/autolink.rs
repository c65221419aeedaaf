//! Auto-linker.
//!
//! Runs after a cell is stored: find its nearest neighbors in the same
//! partition, link bidirectionally. Peer-patch failures are logged and left
//! for consolidation (Q) to retry — this module never fails the store path.

use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::vector_store::{Filters, ScoredPoint, VectorStore};

pub struct AutoLinkOutcome {
    pub new_cell_links: Vec<Uuid>,
    pub peer_patch_failures: Vec<Uuid>,
}

/// Query the same partition for top-(k+1) nearest neighbors to `vector`,
/// excluding `new_id`, keep peers with similarity ≥ `threshold` up to `k`,
/// then cross-patch `linked_memories` on both sides.
pub async fn link_new_cell(
    store: &dyn VectorStore,
    collection: &str,
    new_id: Uuid,
    vector: &[f32],
    threshold: f32,
    k: usize,
) -> Result<AutoLinkOutcome> {
    let candidates: Vec<ScoredPoint> = store
        .search(collection, vector, k + 1, None, &Filters::new())
        .await?
        .into_iter()
        .filter(|point| point.id != new_id && point.score >= threshold)
        .take(k)
        .collect();

    let mut new_cell_links = Vec::with_capacity(candidates.len());
    let mut peer_patch_failures = Vec::new();

    for peer in &candidates {
        new_cell_links.push(peer.id);
        match existing_links(&peer.payload) {
            Ok(mut peer_links) => {
                if !peer_links.contains(&new_id) {
                    peer_links.push(new_id);
                    let patch = serde_json::json!({"linked_memories": peer_links});
                    if let Err(err) = store.patch(collection, peer.id, patch).await {
                        warn!(peer_id = %peer.id, error = %err, "auto-link peer patch failed, deferring to consolidation");
                        peer_patch_failures.push(peer.id);
                    }
                }
            }
            Err(err) => {
                warn!(peer_id = %peer.id, error = %err, "auto-link could not read peer linked_memories");
                peer_patch_failures.push(peer.id);
            }
        }
    }

    if !new_cell_links.is_empty() {
        let patch = serde_json::json!({"linked_memories": new_cell_links});
        if let Err(err) = store.patch(collection, new_id, patch).await {
            warn!(new_id = %new_id, error = %err, "auto-link could not patch new cell's linked_memories");
        }
    }

    Ok(AutoLinkOutcome { new_cell_links, peer_patch_failures })
}

fn existing_links(payload: &serde_json::Value) -> Result<Vec<Uuid>> {
    let links = payload
        .get("linked_memories")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| Uuid::parse_str(s).ok())
                .collect()
        })
        .unwrap_or_default();
    Ok(links)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_links_parses_uuid_array() {
        let id = Uuid::new_v4();
        let payload = serde_json::json!({"linked_memories": [id.to_string()]});
        let links = existing_links(&payload).unwrap();
        assert_eq!(links, vec![id]);
    }

    #[test]
    fn existing_links_defaults_to_empty_when_absent() {
        let payload = serde_json::json!({});
        assert!(existing_links(&payload).unwrap().is_empty());
    }
}
