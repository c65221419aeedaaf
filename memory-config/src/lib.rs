//! Configuration for the cognitive memory engine.
//!
//! Mirrors the shape of the engine's logical subsystems: one
//! `#[serde(default)]` struct per concern, assembled into [`EngineConfig`].
//! A partial TOML file (or none at all) is always valid — missing keys fall
//! back to [`Default`] — but [`EngineConfig::validate`] enforces the
//! required fields and clamped ranges below.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Names of the four logical vector-store partitions the engine owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionNames {
    pub shared: String,
    pub private: String,
    pub profiles: String,
    pub skills: String,
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            shared: "memory_shared".to_string(),
            private: "memory_private".to_string(),
            profiles: "memory_profiles".to_string(),
            skills: "memory_skills".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoLinkConfig {
    pub enabled: bool,
    pub threshold: f32,
    pub top_k: usize,
}

impl Default for AutoLinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.70,
            top_k: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpreadActivationConfig {
    pub depth: u32,
    pub decay: f32,
    pub fanout: usize,
    pub min_activation: f32,
    pub node_cap: usize,
}

impl Default for SpreadActivationConfig {
    fn default() -> Self {
        Self {
            depth: 2,
            decay: 0.5,
            fanout: 10,
            min_activation: 0.1,
            node_cap: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DreamConfig {
    pub enabled: bool,
    pub interval_hours: u64,
    pub budget_seconds: u64,
}

impl Default for DreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 12,
            budget_seconds: 300,
        }
    }
}

/// Boolean switches gating optional subsystems and background passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub auto_capture: bool,
    pub auto_recall: bool,
    pub enable_extraction: bool,
    pub enable_graph: bool,
    pub enable_decay: bool,
    pub enable_priority_scoring: bool,
    pub enable_confidence_tags: bool,
    pub enable_bm25: bool,
    pub enable_preference_tracking: bool,
    pub enable_sentiment_tracking: bool,
    pub enable_lesson_extraction: bool,
    pub enable_temporal_mining: bool,
    pub enable_proactive_warnings: bool,
    pub enable_dream_consolidation: bool,
    pub enable_broadcast: bool,
    pub enable_collective_synthesis: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            auto_capture: true,
            auto_recall: true,
            enable_extraction: false,
            enable_graph: false,
            enable_decay: true,
            enable_priority_scoring: true,
            enable_confidence_tags: true,
            enable_bm25: true,
            enable_preference_tracking: true,
            enable_sentiment_tracking: true,
            enable_lesson_extraction: true,
            enable_temporal_mining: true,
            enable_proactive_warnings: true,
            enable_dream_consolidation: true,
            enable_broadcast: false,
            enable_collective_synthesis: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the external vector database (required).
    pub vector_db_url: String,
    /// Base URL of the external embedding service (required).
    pub embedding_url: String,
    /// Owning agent id for this engine instance (required).
    pub agent_id: String,
    pub embedding_model: String,
    pub capture_max_chars: usize,
    /// Present when content enrichment is configured.
    pub extraction_url: Option<String>,
    /// Present when the graph store is configured.
    pub graph_url: Option<String>,
    /// Present when the pub/sub bus (redis-compatible) is configured.
    pub redis_url: Option<String>,
    pub collections: CollectionNames,
    pub auto_link: AutoLinkConfig,
    pub spread_activation: SpreadActivationConfig,
    pub dream: DreamConfig,
    pub features: FeatureFlags,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            vector_db_url: String::new(),
            embedding_url: String::new(),
            agent_id: String::new(),
            embedding_model: "text-embedding".to_string(),
            capture_max_chars: 500,
            extraction_url: None,
            graph_url: None,
            redis_url: None,
            collections: CollectionNames::default(),
            auto_link: AutoLinkConfig::default(),
            spread_activation: SpreadActivationConfig::default(),
            dream: DreamConfig::default(),
            features: FeatureFlags::default(),
        }
    }
}

impl EngineConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading engine config at {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing engine config at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Enforce required fields, URL parseability, and clamped ranges.
    pub fn validate(&self) -> Result<()> {
        if self.vector_db_url.trim().is_empty() {
            bail!("config: `vector_db_url` is required");
        }
        if self.embedding_url.trim().is_empty() {
            bail!("config: `embedding_url` is required");
        }
        if self.agent_id.trim().is_empty() {
            bail!("config: `agent_id` is required");
        }

        url::Url::parse(&self.vector_db_url)
            .with_context(|| format!("config: `vector_db_url` is not a valid URL: {}", self.vector_db_url))?;
        url::Url::parse(&self.embedding_url)
            .with_context(|| format!("config: `embedding_url` is not a valid URL: {}", self.embedding_url))?;
        if let Some(url) = &self.extraction_url {
            url::Url::parse(url)
                .with_context(|| format!("config: `extraction_url` is not a valid URL: {url}"))?;
        }
        if let Some(url) = &self.graph_url {
            url::Url::parse(url)
                .with_context(|| format!("config: `graph_url` is not a valid URL: {url}"))?;
        }
        if let Some(url) = &self.redis_url {
            url::Url::parse(url)
                .with_context(|| format!("config: `redis_url` is not a valid URL: {url}"))?;
        }

        if !(100..=10_000).contains(&self.capture_max_chars) {
            bail!(
                "config: `capture_max_chars` must be in [100, 10000], got {}",
                self.capture_max_chars
            );
        }
        if !(0.3..=0.99).contains(&self.auto_link.threshold) {
            bail!(
                "config: `auto_link.threshold` must be in [0.3, 0.99], got {}",
                self.auto_link.threshold
            );
        }

        Ok(())
    }

    pub fn enable_graph(&self) -> bool {
        self.features.enable_graph && self.graph_url.is_some()
    }

    pub fn enable_broadcast(&self) -> bool {
        self.features.enable_broadcast && self.redis_url.is_some()
    }

    pub fn enable_extraction(&self) -> bool {
        self.features.enable_extraction && self.extraction_url.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> EngineConfig {
        EngineConfig {
            vector_db_url: "http://localhost:6333".to_string(),
            embedding_url: "http://localhost:8081".to_string(),
            agent_id: "agent-1".to_string(),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn missing_required_fields_fail_validation() {
        let config = EngineConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn invalid_url_fails_validation() {
        let mut config = valid_config();
        config.vector_db_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn capture_max_chars_out_of_range_fails() {
        let mut config = valid_config();
        config.capture_max_chars = 50;
        assert!(config.validate().is_err());
        config.capture_max_chars = 20_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn auto_link_threshold_out_of_range_fails() {
        let mut config = valid_config();
        config.auto_link.threshold = 0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("engine.toml");
        let config = valid_config();
        config.save_to(&path)?;
        let loaded = EngineConfig::load_from(&path)?;
        assert_eq!(loaded.agent_id, config.agent_id);
        assert_eq!(loaded.vector_db_url, config.vector_db_url);
        Ok(())
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("engine.toml");
        fs::write(
            &path,
            "vector_db_url = \"http://localhost:6333\"\nembedding_url = \"http://localhost:8081\"\nagent_id = \"a\"\n",
        )?;
        let loaded = EngineConfig::load_from(&path)?;
        assert_eq!(loaded.capture_max_chars, 500);
        assert!(loaded.features.enable_bm25);
        Ok(())
    }
}
