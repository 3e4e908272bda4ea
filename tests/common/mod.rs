#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use convo_rag::embedding::{EmbeddingClient, RerankResult};
use convo_rag::events::{RagEvent, StatusObserver};
use convo_rag_core::error::{RagError, Result};
use convo_rag_core::models::{
    ChunkRecord, DistanceMetric, EmbeddingConfig, EndpointConfig, HttpMethod, RowFilter,
};
use convo_rag_core::store::memory::InMemoryVectorStore;
use convo_rag_core::store::VectorStore;

pub const DIMS: usize = 4;

/// Inputs containing this marker get a wrong-dimension embedding back.
pub const MALFORMED_MARKER: &str = "BROKEN";
/// Inputs containing this marker make the call fail upstream.
pub const UPSTREAM_MARKER: &str = "UPSTREAM_DOWN";

pub fn embedding_config(url: &str) -> EmbeddingConfig {
    EmbeddingConfig {
        provider: "openai".to_string(),
        model: "mock-embed".to_string(),
        url: url.to_string(),
        api_key: None,
        method: HttpMethod::Post,
        rerank: None,
        dimensions: DIMS,
        max_tokens: 4,
        max_inputs: 2,
        max_file_chunks: 100,
        timeout_secs: None,
    }
}

pub fn rerank_endpoint(url: &str) -> EndpointConfig {
    EndpointConfig {
        provider: "jina".to_string(),
        model: "mock-rerank".to_string(),
        url: url.to_string(),
        api_key: None,
        method: HttpMethod::Post,
    }
}

/// Deterministic, never-zero vector derived from the text bytes.
pub fn text_vector(text: &str, dims: usize) -> Vec<f32> {
    let mut v = vec![1.0f32; dims];
    for (i, b) in text.bytes().enumerate() {
        v[i % dims] += (b % 7) as f32;
    }
    v
}

/// Ordered record of what happened, shared between test doubles.
pub type Journal = Arc<Mutex<Vec<String>>>;

/// One `embed` call as the mock saw it.
#[derive(Debug, Clone)]
pub struct EmbedCall {
    pub inputs: Vec<String>,
    /// Other embed calls still running when this one started.
    pub concurrent: usize,
}

/// Counts a running call until dropped, including when the caller
/// abandons the future.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(count: &'a AtomicUsize, peak: &AtomicUsize) -> (Self, usize) {
        let others = count.fetch_add(1, Ordering::SeqCst);
        peak.fetch_max(others + 1, Ordering::SeqCst);
        (Self(count), others)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-process [`EmbeddingClient`] with scripted failures.
#[derive(Default)]
pub struct MockEmbeddingClient {
    pub delay: Option<Duration>,
    /// Scores returned by rerank, in call order of the documents.
    pub rerank_scores: Mutex<Option<Vec<RerankResult>>>,
    /// Per-query vectors; queries not listed fall back to [`text_vector`].
    pub fixed: Mutex<HashMap<String, Vec<f32>>>,
    pub embed_calls: AtomicUsize,
    pub rerank_calls: AtomicUsize,
    pub calls: Mutex<Vec<EmbedCall>>,
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    /// Gets `embed:<inputs>` as each call starts.
    pub journal: Journal,
}

impl MockEmbeddingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn with_rerank(self, scores: Vec<RerankResult>) -> Self {
        *self.rerank_scores.lock().unwrap() = Some(scores);
        self
    }

    pub fn calls(&self) -> Vec<EmbedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Input count of every embed request, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.calls().iter().map(|c| c.inputs.len()).collect()
    }

    pub fn peak(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

/// Writes `<session>:<state>` for every resolved search into a [`Journal`].
pub struct JournalObserver(pub Journal);

impl StatusObserver for JournalObserver {
    fn publish(&self, event: RagEvent) {
        if let RagEvent::Search(e) = event {
            self.0
                .lock()
                .unwrap()
                .push(format!("{}:{:?}", e.session_id, e.state));
        }
    }
}

#[async_trait]
impl EmbeddingClient for MockEmbeddingClient {
    async fn embed(&self, config: &EmbeddingConfig, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        let (_flight, concurrent) = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        self.calls.lock().unwrap().push(EmbedCall {
            inputs: inputs.to_vec(),
            concurrent,
        });
        self.journal
            .lock()
            .unwrap()
            .push(format!("embed:{}", inputs.join(",")));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if inputs.iter().any(|i| i.contains(UPSTREAM_MARKER)) {
            return Err(RagError::Upstream("mock endpoint down".to_string()));
        }
        if inputs.iter().any(|i| i.contains(MALFORMED_MARKER)) {
            return Ok(inputs
                .iter()
                .map(|_| vec![0.5; config.dimensions + 1])
                .collect());
        }
        let fixed = self.fixed.lock().unwrap();
        Ok(inputs
            .iter()
            .map(|i| {
                fixed
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| text_vector(i, config.dimensions))
            })
            .collect())
    }

    async fn rerank(
        &self,
        _endpoint: &EndpointConfig,
        _query: &str,
        documents: &[String],
    ) -> Result<Vec<RerankResult>> {
        self.rerank_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(scores) = self.rerank_scores.lock().unwrap().clone() {
            return Ok(scores);
        }
        Ok((0..documents.len())
            .map(|index| RerankResult {
                index,
                relevance_score: 0.1,
            })
            .collect())
    }
}

pub fn hit(file_id: &str, content: &str, distance: f32) -> ChunkRecord {
    ChunkRecord {
        id: format!("{}-row", file_id),
        vector: vec![0.0; DIMS],
        file_id: file_id.to_string(),
        config_id: "cfg".to_string(),
        scope: None,
        content: content.to_string(),
        file_name: format!("{}.txt", file_id),
        file_size: content.len() as u32,
        mime_type: Some("text/plain".to_string()),
        chunk_index: 0,
        tokens: None,
        distance: Some(distance),
        relevance: None,
    }
}

/// Store whose search returns canned hits per scope, unsorted.
#[derive(Default)]
pub struct CannedStore {
    pub hits: HashMap<String, Vec<ChunkRecord>>,
}

#[async_trait]
impl VectorStore for CannedStore {
    async fn open(&self) -> Result<()> {
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }
    async fn has_table(&self, scope: &str) -> Result<bool> {
        Ok(self.hits.contains_key(scope))
    }
    async fn create_empty_table(&self, _scope: &str, _dimensions: usize) -> Result<()> {
        Ok(())
    }
    async fn count_rows(&self, scope: &str, _filter: Option<&RowFilter>) -> Result<usize> {
        Ok(self.hits.get(scope).map_or(0, |h| h.len()))
    }
    async fn delete_rows(&self, _scope: &str, _filter: &RowFilter) -> Result<usize> {
        Ok(0)
    }
    async fn insert(&self, _scope: &str, records: &[ChunkRecord]) -> Result<usize> {
        Ok(records.len())
    }
    async fn has_index(&self, _scope: &str, _column: &str) -> Result<bool> {
        Ok(false)
    }
    async fn create_index(&self, _scope: &str, _column: &str, _metric: DistanceMetric) -> Result<()> {
        Ok(())
    }
    async fn search(&self, scope: &str, _query: &[f32], top_k: usize) -> Result<Vec<ChunkRecord>> {
        let hits = self
            .hits
            .get(scope)
            .ok_or_else(|| RagError::TableNotFound(scope.to_string()))?;
        Ok(hits.iter().take(top_k).cloned().collect())
    }
}

/// In-memory store that counts index builds, optionally failing them.
#[derive(Default)]
pub struct CountingStore {
    pub inner: InMemoryVectorStore,
    pub index_builds: AtomicUsize,
    pub fail_index: bool,
}

#[async_trait]
impl VectorStore for CountingStore {
    async fn open(&self) -> Result<()> {
        self.inner.open().await
    }
    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
    async fn has_table(&self, scope: &str) -> Result<bool> {
        self.inner.has_table(scope).await
    }
    async fn create_empty_table(&self, scope: &str, dimensions: usize) -> Result<()> {
        self.inner.create_empty_table(scope, dimensions).await
    }
    async fn count_rows(&self, scope: &str, filter: Option<&RowFilter>) -> Result<usize> {
        self.inner.count_rows(scope, filter).await
    }
    async fn delete_rows(&self, scope: &str, filter: &RowFilter) -> Result<usize> {
        self.inner.delete_rows(scope, filter).await
    }
    async fn insert(&self, scope: &str, records: &[ChunkRecord]) -> Result<usize> {
        self.inner.insert(scope, records).await
    }
    async fn has_index(&self, scope: &str, column: &str) -> Result<bool> {
        self.inner.has_index(scope, column).await
    }
    async fn create_index(&self, scope: &str, column: &str, metric: DistanceMetric) -> Result<()> {
        self.index_builds.fetch_add(1, Ordering::SeqCst);
        if self.fail_index {
            return Err(RagError::Store("index build rejected".to_string()));
        }
        self.inner.create_index(scope, column, metric).await
    }
    async fn search(&self, scope: &str, query: &[f32], top_k: usize) -> Result<Vec<ChunkRecord>> {
        self.inner.search(scope, query, top_k).await
    }
}

/// What the mock HTTP server saw on its last request.
#[derive(Default, Clone)]
pub struct Seen {
    pub last_body: Arc<Mutex<Option<Value>>>,
    pub last_auth: Arc<Mutex<Option<String>>>,
}

/// Serve OpenAI-style embed and rerank routes on a random local port.
///
/// | Route | Behavior |
/// |-------|----------|
/// | `/v1/embeddings` | one [`text_vector`] per input, returned in reverse with indexes |
/// | `/v1/rerank` | scores `1 / (index + 1)` |
/// | `/fail` | 500 |
/// | `/garbage` | 200 with an unrelated JSON body |
pub async fn spawn_mock_server() -> (SocketAddr, Seen) {
    let seen = Seen::default();

    let embed_seen = seen.clone();
    let rerank_seen = seen.clone();
    let app = Router::new()
        .route(
            "/v1/embeddings",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let seen = embed_seen.clone();
                async move {
                    remember(&seen, &headers, &body);
                    let dims = body["dimensions"].as_u64().unwrap_or(DIMS as u64) as usize;
                    let inputs: Vec<String> = body["input"]
                        .as_array()
                        .map(|a| {
                            a.iter()
                                .filter_map(|v| v.as_str().map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default();
                    let data: Vec<Value> = inputs
                        .iter()
                        .enumerate()
                        .rev()
                        .map(|(i, text)| json!({"index": i, "embedding": text_vector(text, dims)}))
                        .collect();
                    Json(json!({"data": data, "usage": {"total_tokens": inputs.len() * 3}}))
                }
            }),
        )
        .route(
            "/v1/rerank",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let seen = rerank_seen.clone();
                async move {
                    remember(&seen, &headers, &body);
                    let n = body["documents"].as_array().map_or(0, |d| d.len());
                    let results: Vec<Value> = (0..n)
                        .map(|i| json!({"index": i, "relevance_score": 1.0 / (i as f32 + 1.0)}))
                        .collect();
                    Json(json!({"results": results}))
                }
            }),
        )
        .route(
            "/fail",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "model overloaded") }),
        )
        .route("/garbage", post(|| async { Json(json!({"nope": true})) }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, seen)
}

fn remember(seen: &Seen, headers: &HeaderMap, body: &Value) {
    *seen.last_body.lock().unwrap() = Some(body.clone());
    *seen.last_auth.lock().unwrap() = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
}
