//! [`RagService`]: the single entry point the host application talks to.
//!
//! Wires the store, the ingestion pipeline and the search manager together
//! over one shared [`VectorStore`] handle, and publishes every status change
//! on a broadcast channel (see [`RagService::subscribe`]).

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use convo_rag_core::chunk::{Chunker, ParagraphChunker};
use convo_rag_core::error::Result;
use convo_rag_core::models::{EmbeddingConfig, LocalFileMeta, SearchParam, SearchTask, TaskInfo};
use convo_rag_core::store::VectorStore;

use crate::config::Config;
use crate::embedding::{EmbeddingClient, HttpEmbeddingClient};
use crate::events::{BroadcastObserver, RagEvent, StatusObserver};
use crate::pipeline::{PipelineOptions, TaskManager};
use crate::reader::{FileReader, FsFileReader};
use crate::search::SearchManager;
use crate::sqlite_store::SqliteVectorStore;

pub struct RagService {
    store: Arc<dyn VectorStore>,
    pipeline: Arc<TaskManager>,
    search: Arc<SearchManager>,
    events: Arc<BroadcastObserver>,
}

impl RagService {
    pub fn new(
        store: Arc<dyn VectorStore>,
        client: Arc<dyn EmbeddingClient>,
        reader: Arc<dyn FileReader>,
        chunker: Arc<dyn Chunker>,
        options: &PipelineOptions,
        top_k: usize,
    ) -> Self {
        let events = Arc::new(BroadcastObserver::default());
        let observer: Arc<dyn StatusObserver> = events.clone();
        let pipeline = Arc::new(TaskManager::standard(
            reader,
            chunker,
            client.clone(),
            store.clone(),
            observer.clone(),
            options,
        ));
        let search = Arc::new(SearchManager::new(client, store.clone(), observer, top_k));
        Self {
            store,
            pipeline,
            search,
            events,
        }
    }

    /// SQLite store, HTTP endpoints, filesystem reader and paragraph
    /// chunker, sized from `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let options = PipelineOptions {
            stage_workers: config.pipeline.stage_workers,
            embed_requests: config.pipeline.embed_requests,
            index_threshold: config.pipeline.index_threshold,
            metric: config.pipeline.distance,
        };
        Ok(Self::new(
            Arc::new(
                SqliteVectorStore::new(&config.store.path).with_metric(config.pipeline.distance),
            ),
            Arc::new(HttpEmbeddingClient::new()?),
            Arc::new(FsFileReader),
            Arc::new(ParagraphChunker),
            &options,
            config.search.top_k,
        ))
    }

    /// Start ingesting one file. Progress arrives as events; the handle
    /// resolves with the finished run.
    pub fn ingest(&self, meta: LocalFileMeta, config: EmbeddingConfig) -> JoinHandle<TaskInfo> {
        self.pipeline.process(meta, config)
    }

    /// Cancel ingestion of one file, or of every file when `meta` is `None`.
    pub fn stop_ingest(&self, meta: Option<&LocalFileMeta>) {
        self.pipeline.stop(meta);
    }

    /// Start a search for `param.session_id`, superseding a pending one.
    pub fn search(&self, param: SearchParam) -> Result<JoinHandle<SearchTask>> {
        self.search.start_search(param)
    }

    /// Wait for and consume the session's search result.
    pub async fn get_result(&self, session_id: &str) -> Result<SearchTask> {
        self.search.get_result(session_id).await
    }

    /// Cancel the session's pending search. Returns false when there is none
    /// or it has already settled.
    pub fn stop(&self, session_id: &str) -> bool {
        self.search.stop_search(session_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RagEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Cancel all work and release the store.
    pub async fn close(&self) -> Result<()> {
        self.pipeline.stop(None);
        self.search.stop_all();
        self.store.close().await
    }
}
