//! Core data models used throughout convo-rag.
//!
//! These types describe the source files, embedding endpoints, persisted
//! chunk rows, pipeline bookkeeping and search sessions that flow through
//! ingestion and retrieval.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RagError;

/// Scope used when a file is ingested without one.
pub const DEFAULT_SCOPE: &str = "default";

/// Name of the vector column in every scope table.
pub const VECTOR_COLUMN: &str = "vector";

/// HTTP verb used to call an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
}

/// One networked model endpoint (embedding or rerank).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub provider: String,
    pub model: String,
    /// Full endpoint URL, e.g. `https://api.example.com/v1/rerank`.
    pub url: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub method: HttpMethod,
}

/// Embedding endpoint plus the chunking/batching limits bound to it.
///
/// Supplied by the caller and immutable for the duration of one ingestion
/// or search call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    /// Full embeddings endpoint URL, e.g. `https://api.example.com/v1/embeddings`.
    pub url: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub rerank: Option<EndpointConfig>,
    /// Length of every vector produced by this endpoint.
    pub dimensions: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Maximum inputs per embedding request.
    #[serde(default = "default_max_inputs")]
    pub max_inputs: usize,
    #[serde(default = "default_max_file_chunks")]
    pub max_file_chunks: usize,
    /// Optional HTTP timeout; the core itself imposes none.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_max_tokens() -> usize {
    512
}
fn default_max_inputs() -> usize {
    16
}
fn default_max_file_chunks() -> usize {
    1000
}

impl EmbeddingConfig {
    /// Stable identifier written into every row embedded with this config.
    ///
    /// Derived from provider, model, URL and dimensionality, so two configs
    /// producing comparable vectors share an id.
    pub fn config_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.provider.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.model.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.url.as_bytes());
        hasher.update((self.dimensions as u64).to_le_bytes());
        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_string()
    }

    /// Reject configs that cannot drive an ingestion or a search.
    pub fn validate(&self) -> Result<(), RagError> {
        if self.dimensions == 0 {
            return Err(RagError::InvalidInput(
                "embedding dimensions must be > 0".to_string(),
            ));
        }
        if self.max_inputs == 0 {
            return Err(RagError::InvalidInput(
                "embedding max_inputs must be > 0".to_string(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(RagError::InvalidInput(
                "embedding max_tokens must be > 0".to_string(),
            ));
        }
        if self.model.trim().is_empty() || self.url.trim().is_empty() {
            return Err(RagError::InvalidInput(format!(
                "embedding config for provider '{}' needs a model and a url",
                self.provider
            )));
        }
        Ok(())
    }
}

/// Identifies a source file and the conversation scope it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFileMeta {
    /// Caller-assigned id, stable across re-ingestion of the same file.
    pub id: String,
    pub path: PathBuf,
    #[serde(default)]
    pub scope: Option<String>,
}

impl LocalFileMeta {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn scope_or_default(&self) -> &str {
        self.scope.as_deref().unwrap_or(DEFAULT_SCOPE)
    }
}

/// [`LocalFileMeta`] enriched by the file reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFileInfo {
    #[serde(flatten)]
    pub meta: LocalFileMeta,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: Option<String>,
}

impl LocalFileInfo {
    /// Placeholder info before the file has been read: name from the path,
    /// size zero, mime unknown.
    pub fn from_meta(meta: LocalFileMeta) -> Self {
        let file_name = meta
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            meta,
            file_name,
            file_size: 0,
            mime_type: None,
        }
    }
}

/// One persisted unit: a chunk of a file plus its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vector: Vec<f32>,
    pub file_id: String,
    pub config_id: String,
    pub scope: Option<String>,
    pub content: String,
    pub file_name: String,
    pub file_size: u32,
    pub mime_type: Option<String>,
    pub chunk_index: i32,
    pub tokens: Option<u32>,
    /// Similarity to the query (higher is closer). Query-time only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    /// Rerank relevance score. Query-time only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f32>,
}

impl ChunkRecord {
    /// True when the record carries a vector of exactly `dimensions` floats.
    pub fn has_vector(&self, dimensions: usize) -> bool {
        !self.vector.is_empty() && self.vector.len() == dimensions
    }
}

/// Lifecycle state of one pipeline stage for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Processing,
    Success,
    Failed,
    Aborted,
}

/// One entry of a run's append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub stage_id: String,
    pub state: TaskState,
    pub code: Option<u16>,
    pub message: Option<String>,
}

impl TaskStatus {
    pub fn pending(stage_id: &str) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            state: TaskState::Pending,
            code: None,
            message: None,
        }
    }

    pub fn processing(stage_id: &str) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            state: TaskState::Processing,
            code: None,
            message: None,
        }
    }

    pub fn success(stage_id: &str, message: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            state: TaskState::Success,
            code: Some(200),
            message: Some(message.into()),
        }
    }

    /// `Aborted` for cancellation, `Failed` for everything else.
    pub fn from_error(stage_id: &str, err: &RagError) -> Self {
        let state = if err.is_aborted() {
            TaskState::Aborted
        } else {
            TaskState::Failed
        };
        Self {
            stage_id: stage_id.to_string(),
            state,
            code: Some(err.code()),
            message: Some(err.to_string()),
        }
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self.state, TaskState::Failed | TaskState::Aborted)
    }
}

/// Working record carried through the ingestion stages.
///
/// Owned by exactly one pipeline run; only `data` survives, inside the
/// vector store.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub info: LocalFileInfo,
    pub config: EmbeddingConfig,
    pub data: Vec<ChunkRecord>,
    pub status_log: Vec<TaskStatus>,
}

impl TaskInfo {
    pub fn new(meta: LocalFileMeta, config: EmbeddingConfig) -> Self {
        Self {
            info: LocalFileInfo::from_meta(meta),
            config,
            data: Vec::new(),
            status_log: Vec::new(),
        }
    }

    pub fn file_id(&self) -> &str {
        &self.info.meta.id
    }

    pub fn scope(&self) -> &str {
        self.info.meta.scope_or_default()
    }

    /// The most recent status, if any stage has reported.
    pub fn last_status(&self) -> Option<&TaskStatus> {
        self.status_log.last()
    }
}

/// One scope to search and the embedding config its table was built with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopedConfig {
    pub scope: String,
    pub config: EmbeddingConfig,
}

/// A retrieval request for one session slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParam {
    pub session_id: String,
    pub content: String,
    pub configs: Vec<ScopedConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchState {
    Pending,
    Success,
    Failed,
    Aborted,
}

impl SearchState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SearchState::Pending)
    }
}

/// Per-session search state, resolved once by the running search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchTask {
    pub session_id: String,
    pub content: String,
    pub configs: Vec<ScopedConfig>,
    pub state: SearchState,
    pub code: Option<u16>,
    pub message: Option<String>,
    pub result: Vec<ChunkRecord>,
}

impl SearchTask {
    pub fn pending(param: &SearchParam) -> Self {
        Self {
            session_id: param.session_id.clone(),
            content: param.content.clone(),
            configs: param.configs.clone(),
            state: SearchState::Pending,
            code: None,
            message: None,
            result: Vec::new(),
        }
    }

    pub fn succeed(&mut self, result: Vec<ChunkRecord>) {
        self.state = SearchState::Success;
        self.code = Some(200);
        self.message = None;
        self.result = result;
    }

    pub fn fail(&mut self, err: &RagError) {
        self.state = if err.is_aborted() {
            SearchState::Aborted
        } else {
            SearchState::Failed
        };
        self.code = Some(err.code());
        self.message = Some(err.to_string());
        self.result.clear();
    }
}

/// Equality predicate used to count or purge rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    FileId(String),
    FileName(String),
    ConfigId(String),
}

impl RowFilter {
    /// Column the predicate applies to.
    pub fn column(&self) -> &'static str {
        match self {
            RowFilter::FileId(_) => "file_id",
            RowFilter::FileName(_) => "file_name",
            RowFilter::ConfigId(_) => "config_id",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            RowFilter::FileId(v) | RowFilter::FileName(v) | RowFilter::ConfigId(v) => v,
        }
    }

    pub fn matches(&self, record: &ChunkRecord) -> bool {
        match self {
            RowFilter::FileId(v) => &record.file_id == v,
            RowFilter::FileName(v) => &record.file_name == v,
            RowFilter::ConfigId(v) => &record.config_id == v,
        }
    }
}

/// Similarity function used by search and by ANN indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    L2,
    Dot,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::L2 => "l2",
            DistanceMetric::Dot => "dot",
        }
    }

    pub fn parse(s: &str) -> Result<Self, RagError> {
        match s {
            "cosine" => Ok(DistanceMetric::Cosine),
            "l2" => Ok(DistanceMetric::L2),
            "dot" => Ok(DistanceMetric::Dot),
            other => Err(RagError::InvalidInput(format!(
                "unknown distance metric '{}': use cosine, l2 or dot",
                other
            ))),
        }
    }
}
