//! Embedding and rerank endpoint client.
//!
//! Defines the [`EmbeddingClient`] trait consumed by the embed stage and the
//! search manager, and [`HttpEmbeddingClient`], the `reqwest` implementation
//! that speaks the OpenAI-style wire format:
//!
//! | Call | Request | Response |
//! |------|---------|----------|
//! | embed | `{model, input: [..], dimensions}` | `{data: [{embedding: [..]}], usage: {total_tokens}}` |
//! | rerank | `{model, query, documents: [..]}` | `{results: [{index, relevance_score}]}` |
//!
//! # Errors
//!
//! - Network failures and non-2xx statuses → [`RagError::Upstream`] (502)
//! - A 2xx body of the wrong shape → [`RagError::Malformed`] (502)
//!
//! There are no retries; a failed batch is reported as-is.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use convo_rag_core::error::{RagError, Result};
use convo_rag_core::models::{EmbeddingConfig, EndpointConfig, HttpMethod};

/// One scored document from a rerank call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankResult {
    /// Position of the document in the request's `documents`.
    pub index: usize,
    pub relevance_score: f32,
}

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed `inputs` in one request, returning vectors in input order.
    async fn embed(&self, config: &EmbeddingConfig, inputs: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Score `documents` against `query`.
    async fn rerank(
        &self,
        endpoint: &EndpointConfig,
        query: &str,
        documents: &[String],
    ) -> Result<Vec<RerankResult>>;
}

/// Check an embed response against the request that produced it.
///
/// The response must carry one vector per input, each exactly
/// `config.dimensions` long.
pub fn check_embeddings(
    config: &EmbeddingConfig,
    expected: usize,
    vectors: &[Vec<f32>],
) -> Result<()> {
    if vectors.len() != expected {
        return Err(RagError::Malformed(format!(
            "model '{}' (config '{}') returned {} embeddings for {} inputs",
            config.model,
            config.config_id(),
            vectors.len(),
            expected
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != config.dimensions) {
        return Err(RagError::Malformed(format!(
            "model '{}' (config '{}') returned a {}-dimension embedding, expected {}",
            config.model,
            config.config_id(),
            bad.len(),
            config.dimensions
        )));
    }
    Ok(())
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

/// [`EmbeddingClient`] over HTTP with bearer-token auth.
#[derive(Clone)]
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
}

impl HttpEmbeddingClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RagError::Upstream(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn send_json<B: Serialize + Sync + ?Sized>(
        &self,
        method: HttpMethod,
        url: &str,
        api_key: Option<&str>,
        timeout_secs: Option<u64>,
        body: &B,
    ) -> Result<String> {
        let mut request = match method {
            HttpMethod::Post => self.client.post(url),
            HttpMethod::Put => self.client.put(url),
        };
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }
        if let Some(secs) = timeout_secs {
            request = request.timeout(Duration::from_secs(secs));
        }

        let response = request
            .json(body)
            .send()
            .await
            .map_err(|e| RagError::Upstream(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RagError::Upstream(format!("reading response from {}: {}", url, e)))?;

        if !status.is_success() {
            return Err(RagError::Upstream(format!(
                "{} returned {}: {}",
                url, status, text
            )));
        }
        Ok(text)
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, config: &EmbeddingConfig, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = EmbedRequest {
            model: &config.model,
            input: inputs,
            dimensions: config.dimensions,
        };
        let text = self
            .send_json(
                config.method,
                &config.url,
                config.api_key.as_deref(),
                config.timeout_secs,
                &body,
            )
            .await?;

        let parsed: EmbedResponse = serde_json::from_str(&text).map_err(|e| {
            RagError::Malformed(format!("embedding response from '{}': {}", config.model, e))
        })?;

        if let Some(usage) = &parsed.usage {
            debug!(
                model = %config.model,
                inputs = inputs.len(),
                total_tokens = usage.total_tokens,
                "embedding request complete"
            );
        }

        let mut data = parsed.data;
        // Providers may return items out of order when they carry an index
        if data.iter().all(|d| d.index.is_some()) {
            data.sort_by_key(|d| d.index);
        }
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    async fn rerank(
        &self,
        endpoint: &EndpointConfig,
        query: &str,
        documents: &[String],
    ) -> Result<Vec<RerankResult>> {
        let body = RerankRequest {
            model: &endpoint.model,
            query,
            documents,
        };
        let text = self
            .send_json(
                endpoint.method,
                &endpoint.url,
                endpoint.api_key.as_deref(),
                None,
                &body,
            )
            .await?;

        let parsed: RerankResponse = serde_json::from_str(&text).map_err(|e| {
            RagError::Malformed(format!("rerank response from '{}': {}", endpoint.model, e))
        })?;
        debug!(model = %endpoint.model, documents = documents.len(), "rerank request complete");
        Ok(parsed.results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "openai".into(),
            model: "m".into(),
            url: "http://localhost".into(),
            api_key: None,
            method: HttpMethod::Post,
            rerank: None,
            dimensions: 3,
            max_tokens: 512,
            max_inputs: 2,
            max_file_chunks: 10,
            timeout_secs: None,
        }
    }

    #[test]
    fn check_embeddings_accepts_matching_batch() {
        let vectors = vec![vec![0.0; 3], vec![1.0; 3]];
        assert!(check_embeddings(&config(), 2, &vectors).is_ok());
    }

    #[test]
    fn check_embeddings_rejects_count_mismatch() {
        let err = check_embeddings(&config(), 2, &[vec![0.0; 3]]).unwrap_err();
        assert!(matches!(err, RagError::Malformed(_)));
    }

    #[test]
    fn check_embeddings_rejects_wrong_dimension() {
        let err = check_embeddings(&config(), 2, &[vec![0.0; 3], vec![0.0; 4]]).unwrap_err();
        assert_eq!(err.code(), 502);
        assert!(err.to_string().contains(&config().config_id()));
    }

    #[test]
    fn embed_request_serializes_wire_fields() {
        let input = vec!["a".to_string()];
        let body = EmbedRequest {
            model: "m",
            input: &input,
            dimensions: 3,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({"model": "m", "input": ["a"], "dimensions": 3}));
    }
}
