//! TOML configuration for the `crag` binary and [`RagService::from_config`](crate::service::RagService::from_config).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use convo_rag_core::models::{DistanceMetric, EmbeddingConfig};

/// Environment variable consulted when a config omits `api_key`.
pub const API_KEY_ENV: &str = "RAG_API_KEY";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub search: SearchConfig,
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Files processed concurrently by each stage.
    #[serde(default = "default_workers")]
    pub stage_workers: usize,
    /// Embedding requests in flight across the whole pipeline.
    #[serde(default = "default_workers")]
    pub embed_requests: usize,
    /// Row count above which a scope gets an ANN index.
    #[serde(default = "default_index_threshold")]
    pub index_threshold: usize,
    #[serde(default)]
    pub distance: DistanceMetric,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_workers: default_workers(),
            embed_requests: default_workers(),
            index_threshold: default_index_threshold(),
            distance: DistanceMetric::default(),
        }
    }
}

fn default_workers() -> usize {
    5
}
fn default_index_threshold() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    6
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a config document. Missing API keys are filled from
/// [`API_KEY_ENV`].
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if let Ok(key) = std::env::var(API_KEY_ENV) {
        if config.embedding.api_key.is_none() {
            config.embedding.api_key = Some(key.clone());
        }
        if let Some(rerank) = config.embedding.rerank.as_mut() {
            if rerank.api_key.is_none() {
                rerank.api_key = Some(key);
            }
        }
    }

    config
        .embedding
        .validate()
        .with_context(|| "Invalid [embedding] section")?;

    if config.search.top_k == 0 {
        bail!("search.top_k must be > 0");
    }
    if config.pipeline.stage_workers == 0 {
        bail!("pipeline.stage_workers must be > 0");
    }
    if config.pipeline.embed_requests == 0 {
        bail!("pipeline.embed_requests must be > 0");
    }

    Ok(config)
}
