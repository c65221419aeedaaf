//! Pub/sub broadcaster.
//!
//! Publishes [`BroadcastMessage`]s onto an external bus. Channel selection
//! is the only policy here; transport and subscription live behind
//! [`PubSubBus`].

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::error::{MemoryError, Result, map_reqwest_err};
use crate::schema::{BroadcastEvent, BroadcastMessage, MemoryType, Scope};

const ADAPTER: &str = "pubsub";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
pub trait PubSubBus: Send + Sync {
    async fn publish(&self, channel: &str, message: &BroadcastMessage) -> Result<()>;
}

/// HTTP bridge onto a channel-based broker. Wire format is UTF-8 JSON of
/// [`BroadcastMessage`]; the bridge is responsible for fanning that out to
/// whatever transport (redis, nats, …) backs it.
pub struct HttpPubSubBus {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPubSubBus {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("reqwest client build");
        Self { client, base_url: base_url.into() }
    }
}

#[derive(Deserialize)]
struct PublishResponse {
    #[serde(default)]
    subscribers: u64,
}

#[async_trait]
impl PubSubBus for HttpPubSubBus {
    async fn publish(&self, channel: &str, message: &BroadcastMessage) -> Result<()> {
        let url = format!("{}/publish", self.base_url.trim_end_matches('/'));
        let body = json!({"channel": format!("memory:{channel}"), "message": message});
        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_err(ADAPTER, e))?;
        if !resp.status().is_success() {
            return Err(MemoryError::transport(ADAPTER, format!("publish status {}", resp.status())));
        }
        let _: PublishResponse = resp.json().await.map_err(|e| map_reqwest_err(ADAPTER, e))?;
        Ok(())
    }
}

/// Channels a message should land on: `public`/`private:<agent>` by scope,
/// `critical` additionally for `core`/`profile` types, `invalidate` always
/// on `new_memory`.
pub fn channels_for(message: &BroadcastMessage) -> Vec<String> {
    let mut channels = Vec::new();
    match message.scope {
        Scope::Public => channels.push("public".to_string()),
        Scope::Private => channels.push(format!("private:{}", message.agent_id)),
    }
    if matches!(message.memory_type, MemoryType::Core | MemoryType::Profile) {
        channels.push("critical".to_string());
    }
    if message.event == BroadcastEvent::NewMemory {
        channels.push("invalidate".to_string());
    }
    channels
}

/// Best-effort fan-out: publish failures are logged, never propagated —
/// the store/retrieval paths that call this must not fail on a bus outage.
pub async fn publish_best_effort(bus: &dyn PubSubBus, message: &BroadcastMessage) {
    for channel in channels_for(message) {
        if let Err(err) = bus.publish(&channel, message).await {
            warn!(channel = %channel, error = %err, "broadcast publish failed, continuing");
        }
    }
}

/// The subscriber side is a thin dispatch loop: parse JSON, hand to
/// registered handlers, swallow malformed payloads rather than crash the
/// listener task.
pub fn try_parse_message(raw: &str) -> Option<BroadcastMessage> {
    match serde_json::from_str(raw) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!(error = %err, "dropping malformed broadcast message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn message(scope: Scope, memory_type: MemoryType, event: BroadcastEvent) -> BroadcastMessage {
        BroadcastMessage {
            memory_id: Uuid::new_v4(),
            agent_id: "agent-1".to_string(),
            memory_type,
            scope,
            text_preview: "preview".to_string(),
            event,
            linked_count: 0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn public_new_memory_hits_public_and_invalidate() {
        let msg = message(Scope::Public, MemoryType::Semantic, BroadcastEvent::NewMemory);
        let channels = channels_for(&msg);
        assert!(channels.contains(&"public".to_string()));
        assert!(channels.contains(&"invalidate".to_string()));
        assert!(!channels.contains(&"critical".to_string()));
    }

    #[test]
    fn private_core_memory_hits_private_and_critical() {
        let msg = message(Scope::Private, MemoryType::Core, BroadcastEvent::NewMemory);
        let channels = channels_for(&msg);
        assert!(channels.contains(&"private:agent-1".to_string()));
        assert!(channels.contains(&"critical".to_string()));
    }

    #[test]
    fn non_new_memory_event_skips_invalidate() {
        let msg = message(Scope::Public, MemoryType::Semantic, BroadcastEvent::ConflictResolved);
        assert!(!channels_for(&msg).contains(&"invalidate".to_string()));
    }

    #[test]
    fn malformed_message_parses_to_none() {
        assert!(try_parse_message("not json").is_none());
    }
}
